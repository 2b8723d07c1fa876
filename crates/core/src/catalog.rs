use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

const EMBEDDED_CATALOG: &str = include_str!("catalog.yml");

/// Execution metadata for a test the backend knows how to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestMetadata {
    pub name: String,
    /// Function that starts the test inside the deployed app.
    pub entry_point: String,
    /// Analysis detector linked from the final report.
    pub detector: String,
    #[serde(default)]
    pub default_parameters: String,
    #[serde(default)]
    pub description: String,
    /// Advisory; the catalog itself does not reject disabled tests.
    pub enabled: bool,
}

/// Read-only registry of tests, keyed case-insensitively by name.
#[derive(Debug, Clone, Default)]
pub struct TestCatalog {
    tests: BTreeMap<String, TestMetadata>,
}

impl TestCatalog {
    /// The catalog compiled into the binary.
    pub fn embedded() -> Result<Self> {
        let entries: Vec<TestMetadata> =
            serde_yaml::from_str(EMBEDDED_CATALOG).context("Failed to parse embedded catalog")?;
        Self::from_entries(entries)
    }

    pub fn from_entries(entries: impl IntoIterator<Item = TestMetadata>) -> Result<Self> {
        let mut tests = BTreeMap::new();
        for entry in entries {
            let key = entry.name.to_ascii_lowercase();
            if tests.contains_key(&key) {
                bail!("Duplicate test {} in catalog", entry.name);
            }
            tests.insert(key, entry);
        }
        Ok(Self { tests })
    }

    pub fn resolve(&self, name: &str) -> Option<&TestMetadata> {
        self.tests.get(&name.trim().to_ascii_lowercase())
    }

    /// All tests, ordered by lowercase name.
    pub fn list_all(&self) -> impl Iterator<Item = (&str, &TestMetadata)> {
        self.tests.values().map(|m| (m.name.as_str(), m))
    }

    pub fn len(&self) -> usize { self.tests.len() }

    pub fn is_empty(&self) -> bool { self.tests.is_empty() }
}

//! Chat commands embedded in issue and pull request comments.

use std::fmt::Write;

use anyhow::{Context, Result};
use apptest_core::catalog::TestCatalog;
use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Run { test: String, parameters: Option<String> },
    List,
    Help,
}

/// Finds the first command line addressed to the bot in a comment body.
#[derive(Debug, Clone)]
pub struct CommandParser {
    prefix: String,
    regex: Regex,
}

impl CommandParser {
    pub fn new(prefix: &str) -> Result<Self> {
        let regex = Regex::new(&format!(r"(?mi)^[ \t]*{}(?:[ \t]+(.*?))?[ \t\r]*$", regex::escape(prefix)))
            .with_context(|| format!("Invalid command prefix {prefix:?}"))?;
        Ok(Self { prefix: prefix.to_string(), regex })
    }

    pub fn prefix(&self) -> &str { &self.prefix }

    pub fn parse(&self, body: &str) -> Option<Command> {
        let captures = self.regex.captures(body)?;
        let args = captures.get(1).map_or("", |m| m.as_str()).trim();
        let (subcommand, rest) = split_word(args);
        Some(match subcommand.to_ascii_lowercase().as_str() {
            "run" => {
                let (test, parameters) = split_word(rest);
                if test.is_empty() {
                    return Some(Command::Help);
                }
                let parameters = (!parameters.is_empty()).then(|| parameters.to_string());
                Command::Run { test: test.to_string(), parameters }
            }
            "list" => Command::List,
            _ => Command::Help,
        })
    }

    pub fn usage(&self) -> String {
        let prefix = &self.prefix;
        format!(
            "Usage:\n\
             - `{prefix} run <test> [parameters]`: create a test app, run the test and report \
             the result\n\
             - `{prefix} list`: show available tests\n\
             - `{prefix} help`: show this message"
        )
    }
}

fn split_word(value: &str) -> (&str, &str) {
    let value = value.trim();
    match value.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (value, ""),
    }
}

/// Markdown table of the catalog.
pub fn catalog_table(catalog: &TestCatalog) -> String {
    let mut out = String::from(
        "| Test | Entry point | Default parameters | Enabled | Description |\n\
         |---|---|---|---|---|\n",
    );
    for (name, test) in catalog.list_all() {
        let _ = writeln!(
            out,
            "| `{}` | `{}` | {} | {} | {} |",
            name,
            test.entry_point,
            if test.default_parameters.is_empty() {
                "-".to_string()
            } else {
                format!("`{}`", test.default_parameters)
            },
            if test.enabled { "yes" } else { "no" },
            test.description,
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use apptest_core::catalog::TestMetadata;

    use super::*;

    fn parser() -> CommandParser { CommandParser::new("/apptest").unwrap() }

    #[test]
    fn test_parse_run() {
        let parser = parser();
        assert_eq!(
            parser.parse("/apptest run ManySequences"),
            Some(Command::Run { test: "ManySequences".to_string(), parameters: None })
        );
        assert_eq!(
            parser.parse("Looks good!\r\n\r\n  /AppTest RUN ManySequences count=100 batch=5\r\n"),
            Some(Command::Run {
                test: "ManySequences".to_string(),
                parameters: Some("count=100 batch=5".to_string()),
            })
        );
    }

    #[test]
    fn test_parse_other_commands() {
        let parser = parser();
        assert_eq!(parser.parse("/apptest list"), Some(Command::List));
        assert_eq!(parser.parse("/apptest"), Some(Command::Help));
        assert_eq!(parser.parse("/apptest help"), Some(Command::Help));
        assert_eq!(parser.parse("/apptest run"), Some(Command::Help));
        assert_eq!(parser.parse("/apptest frobnicate"), Some(Command::Help));
    }

    #[test]
    fn test_parse_ignores_unaddressed_comments() {
        let parser = parser();
        assert_eq!(parser.parse("LGTM"), None);
        assert_eq!(parser.parse("/apptesting run ManySequences"), None);
        assert_eq!(parser.parse("please /apptest run ManySequences"), None);
        assert_eq!(parser.parse(""), None);
    }

    #[test]
    fn test_catalog_table() {
        let catalog = TestCatalog::from_entries([TestMetadata {
            name: "ManySequences".to_string(),
            entry_point: "StartManySequences".to_string(),
            detector: "ManySequencesAnalysis".to_string(),
            default_parameters: "count=5000".to_string(),
            description: "Many sequences.".to_string(),
            enabled: true,
        }])
        .unwrap();
        let table = catalog_table(&catalog);
        assert!(table.contains(
            "| `ManySequences` | `StartManySequences` | `count=5000` | yes | Many sequences. |"
        ));
        assert!(parser().usage().contains("`/apptest run <test> [parameters]`"));
    }
}

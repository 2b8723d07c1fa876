/// Longest name the hosting platform accepts for an app.
pub const MAX_APP_NAME_LEN: usize = 60;

/// Build a test app name of the form `{prefix}-{test}-{suffix}`.
///
/// Names are lowercase and only contain ASCII alphanumerics and single hyphens. If the result
/// would exceed [`MAX_APP_NAME_LEN`], the test segment is shortened; prefix and suffix are kept
/// so names stay unique per trigger.
pub fn app_name(prefix: &str, test_name: &str, suffix: &str) -> String {
    let prefix = sanitize(prefix);
    let suffix = sanitize(suffix);
    let mut test = sanitize(test_name);
    let fixed = prefix.len() + suffix.len() + 2;
    let budget = MAX_APP_NAME_LEN.saturating_sub(fixed);
    test.truncate(budget);
    let test = test.trim_end_matches('-');
    [prefix.as_str(), test, suffix.as_str()]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
        .chars()
        .take(MAX_APP_NAME_LEN)
        .collect()
}

fn sanitize(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.is_empty() && !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_end_matches('-').to_string()
}

/// Shorten `value` to at most `max` characters, marking the cut with an ellipsis.
pub fn truncate(value: &str, max: usize) -> String {
    if value.chars().count() <= max {
        return value.to_string();
    }
    let mut out = value.chars().take(max.saturating_sub(1)).collect::<String>();
    out.push('…');
    out
}

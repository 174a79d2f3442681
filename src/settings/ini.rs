//! Lenient reader for `key = "value"` files: the settings store and the
//! per-version bundles share this format.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIssue {
    pub line: usize,
    pub message: String,
}

impl fmt::Display for ParseIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

/// Parse key/value pairs in file order, tolerating comments, section headers
/// and blank lines. A repeated key keeps its last value at its first position.
pub fn parse_key_values(contents: &str) -> Result<Vec<(String, String)>, ParseIssue> {
    let mut entries: Vec<(String, String)> = Vec::new();

    for (idx, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            continue;
        }

        let mut parts = line.splitn(2, '=');
        let Some(key) = parts.next() else {
            continue;
        };
        let key = key.trim();
        let Some(value) = parts.next() else {
            return Err(ParseIssue {
                line: idx + 1,
                message: format!("expected `key = value`, found `{line}`"),
            });
        };
        if key.is_empty() || !key.chars().all(is_key_char) {
            return Err(ParseIssue {
                line: idx + 1,
                message: format!("invalid key `{key}`"),
            });
        }

        let value = unquote(value.trim());
        match entries.iter_mut().find(|(existing, _)| existing == key) {
            Some(entry) => entry.1 = value,
            None => entries.push((key.to_string(), value)),
        }
    }

    Ok(entries)
}

/// Render a single settings line the way the writers expect to find it again.
pub fn format_entry(key: &str, value: &str) -> String {
    format!("{key} = \"{value}\"")
}

fn is_key_char(ch: char) -> bool {
    matches!(ch, '_' | '-' | '.') || ch.is_ascii_alphanumeric()
}

fn unquote(value: &str) -> String {
    for quote in ['"', '\''] {
        if let Some(rest) = value.strip_prefix(quote) {
            if let Some(end) = rest.find(quote) {
                return rest[..end].to_string();
            }
        }
    }
    // Unquoted values may carry a trailing `;` comment.
    match value.find(" ;") {
        Some(pos) => value[..pos].trim_end().to_string(),
        None => value.to_string(),
    }
}

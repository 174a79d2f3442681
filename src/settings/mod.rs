mod bundle;
pub mod ini;

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::RwLock;
use thiserror::Error;

use crate::patch::{self, LineRule, PatchError, PatchRule};

pub use bundle::Bundle;

pub const ENABLED: &str = "1";
pub const DISABLED: &str = "0";

pub const KEY_ONLINE: &str = "online";
pub const KEY_LOGS_VERBOSE: &str = "logsVerbose";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write settings file '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: PatchError,
    },
    #[error("malformed settings file '{path}' at {issue}")]
    Parse { path: PathBuf, issue: ini::ParseIssue },
    #[error("missing setting '{key}'")]
    MissingKey { key: String },
    #[error("setting '{key}' is not a number: '{value}'")]
    NotNumeric { key: String, value: String },
    #[error("value for setting '{key}' {reason}")]
    InvalidValue { key: String, reason: &'static str },
}

pub type SettingsResult<T> = Result<T, SettingsError>;

/// Handle to the persisted, ordered key/value settings file. Clones share the
/// same in-memory view.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: Arc<PathBuf>,
    entries: Arc<RwLock<Vec<(String, String)>>>,
}

impl SettingsStore {
    pub fn open(path: impl Into<PathBuf>) -> SettingsResult<Self> {
        let path = path.into();
        let entries = read_entries(&path)?;
        Ok(Self {
            path: Arc::new(path),
            entries: Arc::new(RwLock::new(entries)),
        })
    }

    /// Re-read the file, discarding the in-memory view.
    pub fn reload(&self) -> SettingsResult<()> {
        let entries = read_entries(&self.path)?;
        *self.entries.write() = entries;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries
            .read()
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value.clone())
    }

    pub fn require(&self, key: &str) -> SettingsResult<String> {
        self.get(key).ok_or_else(|| SettingsError::MissingKey {
            key: key.to_string(),
        })
    }

    pub fn is_enabled(&self, key: &str) -> bool {
        self.get(key).is_some_and(|value| is_truthy(&value))
    }

    pub fn entries(&self) -> Vec<(String, String)> {
        self.entries.read().clone()
    }

    pub fn replace(&self, key: &str, value: &str) -> SettingsResult<()> {
        self.replace_all(&[(key, value)])
    }

    /// Rewrite the given keys in place with line rules over the current file
    /// contents, appending keys the file does not carry yet. One atomic
    /// write; every value is checked before anything is touched.
    pub fn replace_all(&self, pairs: &[(&str, &str)]) -> SettingsResult<()> {
        for (key, value) in pairs {
            validate_value(key, value)?;
        }

        let mut entries = self.entries.write();
        let existing = match fs::read_to_string(self.path.as_ref()) {
            Ok(contents) => contents,
            Err(error) if error.kind() == io::ErrorKind::NotFound => String::new(),
            Err(source) => {
                return Err(SettingsError::Read {
                    path: self.path.to_path_buf(),
                    source,
                });
            }
        };

        let mut rules = Vec::with_capacity(pairs.len());
        let mut appended = Vec::new();
        for (key, value) in pairs {
            let rule = LineRule::for_key(key, &ini::format_entry(key, value));
            if !rule.matches_any(&existing) {
                appended.push(ini::format_entry(key, value));
            }
            rules.push(PatchRule::from(rule));
        }
        let mut updated = patch::apply_rules(&existing, &rules);
        for line in appended {
            if !updated.is_empty() && !updated.ends_with('\n') {
                updated.push('\n');
            }
            updated.push_str(&line);
            updated.push('\n');
        }

        if updated != existing {
            patch::write_atomic(&self.path, &updated).map_err(|source| SettingsError::Write {
                path: self.path.to_path_buf(),
                source,
            })?;
        }

        for (key, value) in pairs {
            match entries.iter_mut().find(|(existing, _)| existing == key) {
                Some(entry) => entry.1 = value.to_string(),
                None => entries.push((key.to_string(), value.to_string())),
            }
        }
        tracing::debug!(path = %self.path.display(), keys = pairs.len(), "settings updated");
        Ok(())
    }
}

pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "on" | "true" | "yes"
    )
}

/// Values are written inside double quotes on a line of their own.
pub fn validate_value(key: &str, value: &str) -> SettingsResult<()> {
    let reason = if value.contains('"') {
        "must not contain '\"'"
    } else if value.chars().any(char::is_control) {
        "must not contain control characters"
    } else {
        return Ok(());
    };
    Err(SettingsError::InvalidValue {
        key: key.to_string(),
        reason,
    })
}

pub fn flag(enabled: bool) -> &'static str {
    if enabled { ENABLED } else { DISABLED }
}

pub fn parse_number(key: &str, value: &str) -> SettingsResult<u32> {
    value
        .trim()
        .parse::<u32>()
        .map_err(|_| SettingsError::NotNumeric {
            key: key.to_string(),
            value: value.to_string(),
        })
}

fn read_entries(path: &Path) -> SettingsResult<Vec<(String, String)>> {
    let contents = fs::read_to_string(path).map_err(|source| SettingsError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    ini::parse_key_values(&contents).map_err(|issue| SettingsError::Parse {
        path: path.to_path_buf(),
        issue,
    })
}

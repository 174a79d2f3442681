use std::{fs, path::PathBuf};

use super::{SettingsError, SettingsResult, ini};

/// Read-only per-version template: executable and config sub-paths, port
/// defaults and the version the bundle was shipped for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    values: Vec<(String, String)>,
}

impl Bundle {
    pub fn load(path: impl Into<PathBuf>) -> SettingsResult<Self> {
        let path = path.into();
        let contents = fs::read_to_string(&path).map_err(|source| SettingsError::Read {
            path: path.clone(),
            source,
        })?;
        let values = ini::parse_key_values(&contents).map_err(|issue| SettingsError::Parse {
            path,
            issue,
        })?;
        Ok(Self { values })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }
}

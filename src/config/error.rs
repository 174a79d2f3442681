use std::{io, path::PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing '{field}' in [{section}]")]
    MissingField {
        section: &'static str,
        field: &'static str,
    },
    #[error("probe timeout of {value}s is outside the accepted range 1-60")]
    InvalidProbeTimeout { value: u64 },
    #[error("unknown service manager '{value}' (expected 'memory' or 'supervisor')")]
    UnknownServiceManager { value: String },
    #[error("ping path '{value}' must start with '/'")]
    InvalidPingPath { value: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

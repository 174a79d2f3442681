use std::{io, path::PathBuf};

use thiserror::Error;

use crate::{
    cmdline::CommandError, patch::PatchError, probe::PortClassification, settings::SettingsError,
};

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("{module}: install directory '{path}' not found")]
    MissingInstall { module: String, path: PathBuf },
    #[error("{module}: required file '{path}' not found")]
    MissingConfig { module: String, path: PathBuf },
    #[error("{module}: bundle key '{key}' is not set in '{bundle}'")]
    MissingBundleKey {
        module: String,
        key: String,
        bundle: PathBuf,
    },
    #[error("{module}: invalid port '{value}' for {field} (expected 1-65535)")]
    InvalidPort {
        module: String,
        field: String,
        value: String,
    },
    #[error("{module}: no port field named '{field}'")]
    UnknownPortField { module: String, field: String },
    #[error("{module}: files for version {version} not found at '{path}'")]
    VersionFilesNotFound {
        module: String,
        version: String,
        path: PathBuf,
    },
    #[error("{module}: bundle '{bundle}' is for version {found}, expected {expected}")]
    VersionMismatch {
        module: String,
        expected: String,
        found: String,
        bundle: PathBuf,
    },
    #[error("{module} {version} cannot work with {dependency} {dependency_version}: {reason}")]
    IncompatibleVersion {
        module: String,
        version: String,
        dependency: String,
        dependency_version: String,
        reason: String,
    },
    #[error("{module}: port {port} is {classification}")]
    PortInUse {
        module: String,
        port: u16,
        classification: PortClassification,
    },
    #[error("{module}: probing port {port} timed out")]
    ProbeTimeout { module: String, port: u16 },
    #[error("{module}: service '{service}' failed: {message}")]
    ServiceBindingFailure {
        module: String,
        service: String,
        message: String,
    },
    #[error("{module} has no {what}")]
    Unsupported { module: String, what: &'static str },
    #[error("{module} is not ready ({state})")]
    NotReady { module: String, state: String },
    #[error("unknown module '{0}'")]
    UnknownModule(String),
    #[error("failed to access '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Patch(#[from] PatchError),
    #[error(transparent)]
    Command(#[from] CommandError),
}

pub type ModuleResult<T> = Result<T, ModuleError>;

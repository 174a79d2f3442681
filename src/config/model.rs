use std::{path::PathBuf, time::Duration};

pub const DEFAULT_PROBE_HOST: &str = "127.0.0.1";
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_PING_PATH: &str = "/homepage/ping.php";

/// Layout and tunables of the engine. Module state itself lives in the
/// settings store, not here.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub root: PathBuf,
    pub settings: PathBuf,
    pub logs: PathBuf,
    pub web: WebLayout,
    pub probe: ProbeConfig,
    pub service: ServiceManagerKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebLayout {
    pub www: PathBuf,
    pub alias: PathBuf,
    pub vhosts: PathBuf,
    /// Request path used by the HTTP probe.
    pub ping_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    pub host: String,
    pub timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_PROBE_HOST.to_string(),
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceManagerKind {
    Memory,
    Supervisor { program: PathBuf },
}

use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct RawConfig {
    pub root: Option<String>,
    pub settings: Option<String>,
    pub logs: Option<String>,
    #[serde(default)]
    pub web: RawWebConfig,
    #[serde(default)]
    pub probe: RawProbeConfig,
    #[serde(default)]
    pub service: RawServiceConfig,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawWebConfig {
    pub www: Option<String>,
    pub alias: Option<String>,
    pub vhosts: Option<String>,
    pub ping_path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawProbeConfig {
    pub host: Option<String>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawServiceConfig {
    pub manager: Option<String>,
    pub program: Option<String>,
}

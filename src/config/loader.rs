use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use super::{
    error::{ConfigError, ConfigResult},
    model::{
        DEFAULT_PING_PATH, DEFAULT_PROBE_HOST, DEFAULT_PROBE_TIMEOUT, EngineConfig, ProbeConfig,
        ServiceManagerKind, WebLayout,
    },
    raw::{RawConfig, RawProbeConfig, RawServiceConfig, RawWebConfig},
};

pub const CONFIG_FILE_NAME: &str = "bundlectl.toml";
pub const CONFIG_ENV_VAR: &str = "BUNDLECTL_CONFIG";

const MAX_PROBE_TIMEOUT_SECONDS: u64 = 60;

/// Locate and load the engine config: explicit path, then `$BUNDLECTL_CONFIG`,
/// then `./bundlectl.toml`. Only the implicit default may be absent.
pub fn discover(explicit: Option<&Path>) -> ConfigResult<EngineConfig> {
    if let Some(path) = explicit {
        return load_from_path(path);
    }
    if let Some(value) = env::var_os(CONFIG_ENV_VAR) {
        return load_from_path(PathBuf::from(value));
    }

    let cwd = env::current_dir().map_err(|source| ConfigError::ReadFailure {
        path: PathBuf::from("."),
        source,
    })?;
    let candidate = cwd.join(CONFIG_FILE_NAME);
    if candidate.is_file() {
        load_from_path(candidate)
    } else {
        tracing::debug!(dir = %cwd.display(), "no config file found, using defaults");
        convert_raw_config(&cwd, RawConfig::default())
    }
}

pub fn load_from_path<P: AsRef<Path>>(path: P) -> ConfigResult<EngineConfig> {
    let path_ref = path.as_ref();
    let raw_contents = fs::read_to_string(path_ref).map_err(|source| ConfigError::ReadFailure {
        path: path_ref.to_path_buf(),
        source,
    })?;
    load_from_str(path_ref, &raw_contents)
}

pub fn load_from_str(config_path: &Path, contents: &str) -> ConfigResult<EngineConfig> {
    let raw: RawConfig = toml::from_str(contents)?;
    convert_raw_config(config_path, raw)
}

fn convert_raw_config(config_path: &Path, raw: RawConfig) -> ConfigResult<EngineConfig> {
    let root = match raw.root {
        Some(value) => resolve_relative_path(config_path, value),
        None => base_dir(config_path),
    };
    let settings = raw
        .settings
        .map(|value| resolve_under_root(&root, value))
        .unwrap_or_else(|| root.join("settings.conf"));
    let logs = raw
        .logs
        .map(|value| resolve_under_root(&root, value))
        .unwrap_or_else(|| root.join("logs"));

    let web = convert_web_layout(&root, raw.web)?;
    let probe = convert_probe_config(raw.probe)?;
    let service = convert_service_config(&root, raw.service)?;

    Ok(EngineConfig {
        root,
        settings,
        logs,
        web,
        probe,
        service,
    })
}

fn convert_web_layout(root: &Path, raw: RawWebConfig) -> ConfigResult<WebLayout> {
    let dir = |value: Option<String>, default: &str| {
        value
            .map(|value| resolve_under_root(root, value))
            .unwrap_or_else(|| root.join(default))
    };

    let ping_path = raw
        .ping_path
        .unwrap_or_else(|| DEFAULT_PING_PATH.to_string());
    if !ping_path.starts_with('/') {
        return Err(ConfigError::InvalidPingPath { value: ping_path });
    }

    Ok(WebLayout {
        www: dir(raw.www, "www"),
        alias: dir(raw.alias, "alias"),
        vhosts: dir(raw.vhosts, "vhosts"),
        ping_path,
    })
}

fn convert_probe_config(raw: RawProbeConfig) -> ConfigResult<ProbeConfig> {
    let timeout = match raw.timeout_seconds {
        None => DEFAULT_PROBE_TIMEOUT,
        Some(value) if (1..=MAX_PROBE_TIMEOUT_SECONDS).contains(&value) => {
            Duration::from_secs(value)
        }
        Some(value) => return Err(ConfigError::InvalidProbeTimeout { value }),
    };

    Ok(ProbeConfig {
        host: raw
            .host
            .filter(|host| !host.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PROBE_HOST.to_string()),
        timeout,
    })
}

fn convert_service_config(root: &Path, raw: RawServiceConfig) -> ConfigResult<ServiceManagerKind> {
    let manager = raw
        .manager
        .map(|value| value.trim().to_ascii_lowercase())
        .unwrap_or_else(|| "memory".to_string());

    match manager.as_str() {
        "memory" => Ok(ServiceManagerKind::Memory),
        "supervisor" => {
            let program = raw.program.ok_or(ConfigError::MissingField {
                section: "service",
                field: "program",
            })?;
            Ok(ServiceManagerKind::Supervisor {
                program: resolve_under_root(root, program),
            })
        }
        _ => Err(ConfigError::UnknownServiceManager { value: manager }),
    }
}

fn base_dir(base: &Path) -> PathBuf {
    if base.is_dir() {
        base.to_path_buf()
    } else {
        base.parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

fn resolve_under_root(root: &Path, value: String) -> PathBuf {
    let path = PathBuf::from(value);
    if path.is_absolute() {
        path
    } else {
        root.join(path)
    }
}

fn resolve_relative_path(base: &Path, value: String) -> PathBuf {
    let path = PathBuf::from(value);
    if path.is_absolute() {
        return path;
    }
    base_dir(base).join(path)
}

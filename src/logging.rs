use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::Level;
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

use crate::settings::{self, KEY_LOGS_VERBOSE, SettingsStore};

pub const ACTION_LOG_FILE: &str = "bundlectl.log";

/// `logsVerbose` at or above this level turns on debug tracing.
const DEBUG_VERBOSITY: u32 = 2;

type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// `None` inside when `RUST_LOG` pinned the filter or another subscriber
/// was already installed.
static TRACING_FILTER: OnceCell<Option<FilterHandle>> = OnceCell::new();

pub fn init_tracing(verbose: bool) {
    TRACING_FILTER.get_or_init(|| {
        let from_env = EnvFilter::try_from_default_env().ok();
        let pinned = from_env.is_some();
        let default_level = if verbose { Level::DEBUG } else { Level::WARN };
        let env_filter = from_env.unwrap_or_else(|| {
            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy()
        });

        let (filter, handle) = reload::Layer::new(env_filter);
        let installed = tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
            .is_ok();
        (installed && !pinned).then_some(handle)
    });
}

/// Switch stderr tracing to debug once the settings file has been read.
pub fn raise_to_debug() {
    if let Some(Some(handle)) = TRACING_FILTER.get() {
        let debug = EnvFilter::builder()
            .with_default_directive(Level::DEBUG.into())
            .parse_lossy("");
        if let Err(error) = handle.reload(debug) {
            tracing::warn!(%error, "cannot raise log level");
        }
    }
}

/// Whether the settings ask for debug output.
pub fn settings_verbose(settings: &SettingsStore) -> bool {
    settings
        .get(KEY_LOGS_VERBOSE)
        .and_then(|raw| settings::parse_number(KEY_LOGS_VERBOSE, &raw).ok())
        .is_some_and(|level| level >= DEBUG_VERBOSITY)
}

/// Append-only record of every state-changing action, one line each.
#[derive(Debug, Clone)]
pub struct ActionLog {
    inner: Arc<Mutex<ActionLogInner>>,
}

impl ActionLog {
    pub fn open(logs_dir: &Path) -> Result<Self> {
        fs::create_dir_all(logs_dir)
            .with_context(|| format!("creating log directory {:?}", logs_dir.display()))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(ActionLogInner {
                path: logs_dir.join(ACTION_LOG_FILE),
                file: None,
            })),
        })
    }

    pub fn record(&self, entry: ActionEntry) -> Result<()> {
        let mut guard = self.inner.lock();
        guard.write_entry(&entry)
    }

    /// Record, downgrading a failed write to a warning. Used where the action
    /// itself already happened and must not be reported as failed.
    pub fn note(&self, entry: ActionEntry) {
        if let Err(error) = self.record(entry) {
            tracing::warn!(error = %error, "failed to write action log");
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActionEntry {
    pub module: String,
    pub level: ActionLevel,
    pub message: Option<String>,
}

impl ActionEntry {
    pub fn new(module: impl Into<String>, level: ActionLevel) -> Self {
        Self {
            module: module.into(),
            level,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    fn format_line(&self, timestamp: &str) -> String {
        let message = self
            .message
            .as_deref()
            .map(sanitize_message)
            .unwrap_or_default();

        format!(
            "{timestamp} | {level:<7} | {module:<10} | {message}\n",
            level = self.level.label(),
            module = self.module,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionLevel {
    Info,
    Warning,
    Error,
}

impl ActionLevel {
    pub fn label(self) -> &'static str {
        match self {
            ActionLevel::Info => "INFO",
            ActionLevel::Warning => "WARNING",
            ActionLevel::Error => "ERROR",
        }
    }
}

#[derive(Debug)]
struct ActionLogInner {
    path: PathBuf,
    file: Option<File>,
}

impl ActionLogInner {
    fn write_entry(&mut self, entry: &ActionEntry) -> Result<()> {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let line = entry.format_line(&timestamp);
        let path = self.path.clone();
        let file = self.ensure_file()?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("writing action log {:?}", path.display()))?;
        Ok(())
    }

    fn ensure_file(&mut self) -> Result<&mut File> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .with_context(|| format!("opening action log {:?}", self.path.display()))?;
            self.file = Some(file);
        }
        self.file
            .as_mut()
            .context("action log handle missing after open")
    }
}

fn sanitize_message(message: &str) -> String {
    message
        .chars()
        .map(|ch| if ch == '\n' || ch == '\r' { ' ' } else { ch })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_append_one_line_each() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let log = ActionLog::open(&dir.path().join("logs"))?;
        log.record(ActionEntry::new("mysql", ActionLevel::Info).with_message("port changed to 3310"))?;
        log.record(ActionEntry::new("apache", ActionLevel::Error).with_message("start failed\nAH00526: syntax"))?;

        let contents = fs::read_to_string(dir.path().join("logs").join(ACTION_LOG_FILE))?;
        let lines = contents.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);

        let fields = lines[0].split(" | ").collect::<Vec<_>>();
        assert_eq!(fields.len(), 4);
        assert!(fields[0].ends_with('Z'));
        assert_eq!(fields[1], "INFO   ");
        assert_eq!(fields[2], "mysql     ");
        assert_eq!(fields[3], "port changed to 3310");
        assert!(lines[1].ends_with("start failed AH00526: syntax"));
        Ok(())
    }

    #[test]
    fn reopening_keeps_earlier_entries() -> Result<()> {
        let dir = tempfile::tempdir()?;
        ActionLog::open(dir.path())?.record(ActionEntry::new("php", ActionLevel::Warning))?;
        ActionLog::open(dir.path())?.record(ActionEntry::new("php", ActionLevel::Info))?;
        let contents = fs::read_to_string(dir.path().join(ACTION_LOG_FILE))?;
        assert_eq!(contents.lines().count(), 2);
        Ok(())
    }

    #[test]
    fn debug_can_be_raised_after_early_init() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        init_tracing(false);
        assert!(!tracing::enabled!(Level::DEBUG));
        raise_to_debug();
        assert!(tracing::enabled!(Level::DEBUG));
    }

    #[test]
    fn verbosity_comes_from_settings() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("settings.conf");
        fs::write(&path, "logsVerbose = \"1\"\n")?;
        let store = SettingsStore::open(&path)?;
        assert!(!settings_verbose(&store));
        store.replace(KEY_LOGS_VERBOSE, "2")?;
        assert!(settings_verbose(&store));
        Ok(())
    }
}

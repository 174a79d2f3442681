use std::{
    collections::{HashMap, HashSet},
    io,
    path::PathBuf,
    sync::Arc,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;

use crate::config::ServiceManagerKind;

#[derive(Debug, Error)]
pub enum BindingError {
    #[error("service '{name}' is not installed")]
    NotInstalled { name: String },
    #[error("failed to run '{program}': {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("`{action}` for service '{name}' failed: {output}")]
    Command {
        name: String,
        action: String,
        output: String,
    },
    #[error("service '{name}' refused to {action}")]
    Rejected { name: String, action: String },
}

pub type BindingResult<T> = Result<T, BindingError>;

/// Every registration starts on demand; the engine starts services itself.
const START_ON_DEMAND: &str = "SERVICE_DEMAND_START";

/// Everything an OS service registration needs, computed by a module reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceSpec {
    pub name: String,
    pub display_name: String,
    pub binary: PathBuf,
    pub params: String,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
}

/// One OS-managed background process.
#[async_trait]
pub trait ServiceBinding: Send + Sync {
    fn name(&self) -> &str;
    async fn install(&self, spec: &ServiceSpec) -> BindingResult<()>;
    async fn remove(&self) -> BindingResult<()>;
    async fn start(&self) -> BindingResult<()>;
    async fn stop(&self) -> BindingResult<()>;
    async fn is_installed(&self) -> BindingResult<bool>;
    async fn is_running(&self) -> BindingResult<bool>;
}

pub trait ServiceManager: Send + Sync {
    fn binding(&self, name: &str) -> Box<dyn ServiceBinding>;
}

pub fn manager_for(kind: &ServiceManagerKind) -> Arc<dyn ServiceManager> {
    match kind {
        ServiceManagerKind::Memory => Arc::new(MemoryServiceManager::default()),
        ServiceManagerKind::Supervisor { program } => {
            Arc::new(SupervisorManager::new(program.clone()))
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    installed: HashMap<String, ServiceSpec>,
    running: HashSet<String>,
    refuse_start: HashSet<String>,
    calls: Vec<String>,
}

/// Bookkeeping-only manager. Nothing is registered with the OS; every call
/// is recorded so callers can inspect the order of operations.
#[derive(Debug, Clone, Default)]
pub struct MemoryServiceManager {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryServiceManager {
    /// Make every later `start` of `name` fail.
    #[cfg(test)]
    pub fn refuse_start(&self, name: &str) {
        self.state.lock().refuse_start.insert(name.to_string());
    }

    #[cfg(test)]
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    #[cfg(test)]
    pub fn installed(&self, name: &str) -> Option<ServiceSpec> {
        self.state.lock().installed.get(name).cloned()
    }
}

impl ServiceManager for MemoryServiceManager {
    fn binding(&self, name: &str) -> Box<dyn ServiceBinding> {
        Box::new(MemoryBinding {
            name: name.to_string(),
            state: Arc::clone(&self.state),
        })
    }
}

struct MemoryBinding {
    name: String,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBinding {
    fn record(&self, state: &mut MemoryState, action: &str) {
        state.calls.push(format!("{action} {}", self.name));
    }

    fn require_installed(&self, state: &MemoryState) -> BindingResult<()> {
        if state.installed.contains_key(&self.name) {
            Ok(())
        } else {
            Err(BindingError::NotInstalled {
                name: self.name.clone(),
            })
        }
    }
}

#[async_trait]
impl ServiceBinding for MemoryBinding {
    fn name(&self) -> &str {
        &self.name
    }

    async fn install(&self, spec: &ServiceSpec) -> BindingResult<()> {
        let mut state = self.state.lock();
        self.record(&mut state, "install");
        state.installed.insert(self.name.clone(), spec.clone());
        Ok(())
    }

    async fn remove(&self) -> BindingResult<()> {
        let mut state = self.state.lock();
        self.record(&mut state, "remove");
        self.require_installed(&state)?;
        state.installed.remove(&self.name);
        state.running.remove(&self.name);
        Ok(())
    }

    async fn start(&self) -> BindingResult<()> {
        let mut state = self.state.lock();
        self.record(&mut state, "start");
        self.require_installed(&state)?;
        if state.refuse_start.contains(&self.name) {
            return Err(BindingError::Rejected {
                name: self.name.clone(),
                action: "start".to_string(),
            });
        }
        state.running.insert(self.name.clone());
        Ok(())
    }

    async fn stop(&self) -> BindingResult<()> {
        let mut state = self.state.lock();
        self.record(&mut state, "stop");
        self.require_installed(&state)?;
        state.running.remove(&self.name);
        Ok(())
    }

    async fn is_installed(&self) -> BindingResult<bool> {
        Ok(self.state.lock().installed.contains_key(&self.name))
    }

    async fn is_running(&self) -> BindingResult<bool> {
        Ok(self.state.lock().running.contains(&self.name))
    }
}

const STATUS_RUNNING: &str = "SERVICE_RUNNING";

/// Drives an external service wrapper (nssm-style command surface:
/// `install`, `set`, `remove <name> confirm`, `start`, `stop`, `status`).
#[derive(Debug, Clone)]
pub struct SupervisorManager {
    program: PathBuf,
}

impl SupervisorManager {
    pub fn new(program: PathBuf) -> Self {
        Self { program }
    }
}

impl ServiceManager for SupervisorManager {
    fn binding(&self, name: &str) -> Box<dyn ServiceBinding> {
        Box::new(SupervisorBinding {
            program: self.program.clone(),
            name: name.to_string(),
        })
    }
}

struct SupervisorBinding {
    program: PathBuf,
    name: String,
}

impl SupervisorBinding {
    async fn run(&self, args: &[&str]) -> BindingResult<Vec<String>> {
        tracing::debug!(program = %self.program.display(), ?args, "service command");
        let output = Command::new(&self.program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| BindingError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        let lines = clean_lines(&output.stdout)
            .into_iter()
            .chain(clean_lines(&output.stderr))
            .collect::<Vec<_>>();
        if output.status.success() {
            Ok(lines)
        } else {
            Err(BindingError::Command {
                name: self.name.clone(),
                action: args.first().copied().unwrap_or_default().to_string(),
                output: lines.join(" ; "),
            })
        }
    }

    async fn set(&self, key: &str, value: &str) -> BindingResult<()> {
        self.run(&["set", &self.name, key, value]).await.map(|_| ())
    }

    async fn status(&self) -> BindingResult<Option<String>> {
        match self.run(&["status", &self.name]).await {
            Ok(lines) if lines.len() == 1 => Ok(lines.into_iter().next()),
            Ok(_) | Err(BindingError::Command { .. }) => Ok(None),
            Err(error) => Err(error),
        }
    }
}

#[async_trait]
impl ServiceBinding for SupervisorBinding {
    fn name(&self) -> &str {
        &self.name
    }

    async fn install(&self, spec: &ServiceSpec) -> BindingResult<()> {
        let binary = spec.binary.display().to_string();
        self.run(&["install", &self.name, &binary]).await?;
        self.set("AppParameters", &spec.params).await?;
        self.set("DisplayName", &spec.display_name).await?;
        self.set("Description", &spec.display_name).await?;
        self.set("AppNoConsole", "1").await?;
        self.set("Start", START_ON_DEMAND).await?;
        if let Some(stdout) = &spec.stdout {
            self.set("AppStdout", &stdout.display().to_string()).await?;
        }
        if let Some(stderr) = &spec.stderr {
            self.set("AppStderr", &stderr.display().to_string()).await?;
        }
        Ok(())
    }

    async fn remove(&self) -> BindingResult<()> {
        if !self.is_installed().await? {
            return Err(BindingError::NotInstalled {
                name: self.name.clone(),
            });
        }
        self.run(&["remove", &self.name, "confirm"]).await.map(|_| ())
    }

    async fn start(&self) -> BindingResult<()> {
        self.run(&["start", &self.name]).await.map(|_| ())
    }

    async fn stop(&self) -> BindingResult<()> {
        self.run(&["stop", &self.name]).await.map(|_| ())
    }

    async fn is_installed(&self) -> BindingResult<bool> {
        Ok(self.status().await?.is_some())
    }

    async fn is_running(&self) -> BindingResult<bool> {
        Ok(self.status().await?.as_deref() == Some(STATUS_RUNNING))
    }
}

/// Non-empty output lines with control and non-ASCII bytes stripped.
fn clean_lines(raw: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(raw)
        .lines()
        .map(|line| {
            line.chars()
                .filter(|ch| ch.is_ascii() && !ch.is_ascii_control())
                .collect::<String>()
                .trim()
                .to_string()
        })
        .filter(|line| !line.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            display_name: format!("{name} service"),
            binary: PathBuf::from("/opt/bin/daemon"),
            params: "-k runservice".to_string(),
            stdout: None,
            stderr: None,
        }
    }

    #[tokio::test]
    async fn memory_binding_tracks_lifecycle() {
        let manager = MemoryServiceManager::default();
        let binding = manager.binding("svc");
        assert!(!binding.is_installed().await.expect("status"));
        assert!(matches!(
            binding.start().await,
            Err(BindingError::NotInstalled { .. })
        ));

        binding.install(&spec("svc")).await.expect("install");
        binding.start().await.expect("start");
        assert!(binding.is_running().await.expect("running"));
        binding.stop().await.expect("stop");
        binding.remove().await.expect("remove");
        assert!(!binding.is_running().await.expect("running"));

        assert_eq!(
            manager.calls(),
            vec!["start svc", "install svc", "start svc", "stop svc", "remove svc"]
        );
    }

    #[tokio::test]
    async fn refused_start_leaves_service_installed() {
        let manager = MemoryServiceManager::default();
        manager.refuse_start("svc");
        let binding = manager.binding("svc");
        binding.install(&spec("svc")).await.expect("install");
        assert!(matches!(binding.start().await, Err(BindingError::Rejected { .. })));
        assert!(binding.is_installed().await.expect("status"));
        assert!(manager.installed("svc").is_some());
    }

    #[test]
    fn clean_lines_strips_noise() {
        let raw = b"SERVICE_\x00RUNNING\r\n\r\n  \n";
        assert_eq!(clean_lines(raw), vec!["SERVICE_RUNNING".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn supervisor_reports_missing_program() {
        let binding = SupervisorManager::new(PathBuf::from("/nonexistent/service-tool")).binding("svc");
        assert!(matches!(binding.start().await, Err(BindingError::Spawn { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn supervisor_installs_through_wrapper_commands() -> anyhow::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir()?;
        let log = dir.path().join("calls.log");
        let program = dir.path().join("service-tool");
        std::fs::write(
            &program,
            format!("#!/bin/sh\necho \"$@\" >> '{}'\n", log.display()),
        )?;
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755))?;

        let binding = SupervisorManager::new(program).binding("svc");
        binding.install(&spec("svc")).await?;
        let calls = std::fs::read_to_string(&log)?;
        let calls = calls.lines().collect::<Vec<_>>();
        assert_eq!(calls[0], "install svc /opt/bin/daemon");
        assert!(calls.contains(&"set svc Start SERVICE_DEMAND_START"));
        assert!(calls.contains(&"set svc AppParameters -k runservice"));
        Ok(())
    }
}

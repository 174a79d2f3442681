//! The generic module engine. One [`Module`] wraps one descriptor and drives
//! reload, version switches, enablement, ports, credentials and the OS
//! service binding against the shared settings store.

pub mod cascade;
pub mod descriptor;
pub mod descriptors;
pub mod error;
pub mod inventory;
pub mod online;
pub mod view;

#[cfg(test)]
pub(crate) mod testing;

use std::{fmt, path::PathBuf, sync::Arc, time::Duration};

use serde::Serialize;

pub use cascade::CascadeReport;
pub use descriptor::{Descriptor, DescriptorSpec, PRIMARY_PORT};
pub use error::{ModuleError, ModuleResult};
pub use view::{EngineContext, ModuleView};

use crate::{
    cmdline::{self, CommandReport},
    patch::{self, PatchOutcome},
    paths::{self, StableRootStatus},
    probe::{Credentials, PortClassification, PortProbe, ProbeError, ProbeProtocol},
    service::{BindingResult, ServiceBinding, ServiceManager, ServiceSpec},
    settings::{self, DISABLED},
};

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ModuleState {
    Uninitialized,
    Reloading,
    Disabled,
    /// Enabled, but something it needs is missing or malformed. Treated as
    /// disabled everywhere else.
    Invalid(String),
    Ready,
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleState::Uninitialized => write!(f, "uninitialized"),
            ModuleState::Reloading => write!(f, "reloading"),
            ModuleState::Disabled => write!(f, "disabled"),
            ModuleState::Invalid(reason) => write!(f, "invalid: {reason}"),
            ModuleState::Ready => write!(f, "ready"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PortChange {
    Applied {
        port: u16,
    },
    /// Nothing was persisted; the port is taken.
    Occupied {
        port: u16,
        classification: PortClassification,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialChange {
    Applied(CascadeReport),
    /// The server refused the password change; nothing was persisted.
    Rejected { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceOutcome {
    Started,
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandChecks {
    pub version: CommandReport,
    pub syntax: Option<CommandReport>,
}

pub struct Module {
    descriptor: Arc<dyn Descriptor>,
    ctx: EngineContext,
    services: Arc<dyn ServiceManager>,
    probe: PortProbe,
    command_timeout: Duration,
    state: ModuleState,
    view: Option<ModuleView>,
}

impl Module {
    pub fn new(
        descriptor: Arc<dyn Descriptor>,
        ctx: EngineContext,
        services: Arc<dyn ServiceManager>,
        probe: PortProbe,
    ) -> Self {
        Self {
            descriptor,
            ctx,
            services,
            probe,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            state: ModuleState::Uninitialized,
            view: None,
        }
    }

    pub fn id(&self) -> &'static str {
        self.descriptor.spec().id
    }

    pub fn spec(&self) -> &'static DescriptorSpec {
        self.descriptor.spec()
    }

    pub fn state(&self) -> &ModuleState {
        &self.state
    }

    pub fn view(&self) -> Option<&ModuleView> {
        self.view.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        self.state == ModuleState::Ready
    }

    /// Re-derive everything from the settings store and the filesystem.
    /// Nothing carries over from the previous call.
    pub fn reload(&mut self) -> ModuleResult<&ModuleState> {
        self.state = ModuleState::Reloading;
        let view = match ModuleView::load(&self.ctx, self.spec()) {
            Ok(view) => view,
            Err(error) => {
                tracing::error!(module = self.id(), %error, "reload failed");
                self.state = ModuleState::Invalid(error.to_string());
                self.view = None;
                return Err(error);
            }
        };
        self.state = evaluate(&view);
        tracing::debug!(module = self.id(), version = %view.version, state = %self.state, "reloaded");
        self.view = Some(view);
        Ok(&self.state)
    }

    fn loaded_view(&mut self) -> ModuleResult<&ModuleView> {
        if self.view.is_none() {
            self.reload()?;
        }
        self.current_view()
    }

    fn current_view(&self) -> ModuleResult<&ModuleView> {
        self.view.as_ref().ok_or_else(|| self.not_ready())
    }

    fn ready_view(&self) -> ModuleResult<&ModuleView> {
        match (&self.state, &self.view) {
            (ModuleState::Ready, Some(view)) => Ok(view),
            _ => Err(self.not_ready()),
        }
    }

    fn not_ready(&self) -> ModuleError {
        ModuleError::NotReady {
            module: self.id().to_string(),
            state: self.state.to_string(),
        }
    }

    pub fn versions(&self) -> ModuleResult<Vec<String>> {
        let spec = self.spec();
        self.ctx
            .paths
            .version_list(spec.family, spec.id)
            .map_err(|source| ModuleError::Io {
                path: self.ctx.paths.module_root(spec.family, spec.id),
                source,
            })
    }

    /// Activate `target`. Every check runs before anything is persisted.
    pub async fn switch_version(&mut self, target: &str) -> ModuleResult<CascadeReport> {
        let id = self.id();
        let version_key = self.spec().version_key();
        let current = self.loaded_view()?.clone();
        let candidate = current.for_version(target)?;

        if !candidate.paths.install_root.is_dir() {
            return Err(ModuleError::VersionFilesNotFound {
                module: id.to_string(),
                version: target.to_string(),
                path: candidate.paths.install_root.clone(),
            });
        }
        let Some(bundle) = candidate.bundle.as_ref() else {
            return Err(ModuleError::VersionFilesNotFound {
                module: id.to_string(),
                version: target.to_string(),
                path: candidate.paths.bundle.clone(),
            });
        };
        match bundle.get(&version_key) {
            Some(found) if found == target => {}
            found => {
                return Err(ModuleError::VersionMismatch {
                    module: id.to_string(),
                    expected: target.to_string(),
                    found: found.unwrap_or("unset").to_string(),
                    bundle: candidate.paths.bundle.clone(),
                });
            }
        }
        for key in self.spec().required_files {
            let missing = match bundle.get(key) {
                Some(relative) => Some(candidate.paths.install_file(relative)).filter(|path| !path.exists()),
                None => Some(candidate.paths.bundle.clone()),
            };
            if let Some(path) = missing {
                return Err(ModuleError::VersionFilesNotFound {
                    module: id.to_string(),
                    version: target.to_string(),
                    path,
                });
            }
        }
        if candidate.enabled {
            candidate.validate()?;
        }
        self.descriptor.check_compatibility(&candidate, &self.ctx)?;

        self.ctx.settings.replace(&version_key, target)?;
        tracing::info!(module = id, from = %current.version, to = target, "version switched");
        self.reload()?;
        self.update_config()?;
        let report = cascade::run(id, &self.ctx);
        self.reload()?;
        self.refresh_service().await?;
        Ok(report)
    }

    /// Persist the flag, reload, cascade, then bring the service in line.
    /// Enabling a module whose files are missing persists `0` and fails.
    pub async fn set_enable(&mut self, enabled: bool) -> ModuleResult<CascadeReport> {
        let id = self.id();
        let enable_key = self.spec().enable_key();
        if enabled {
            let view = ModuleView::load(&self.ctx, self.spec())?;
            if let Err(error) = view.validate() {
                tracing::warn!(module = id, %error, "cannot enable");
                self.ctx.settings.replace(&enable_key, DISABLED)?;
                self.reload()?;
                return Err(error);
            }
        }

        self.ctx.settings.replace(&enable_key, settings::flag(enabled))?;
        tracing::info!(module = id, enabled, "enablement changed");
        self.reload()?;
        self.update_config()?;
        let report = cascade::run(id, &self.ctx);
        if self.is_ready() {
            self.ensure_service_running().await?;
        } else if self.spec().service.is_some() {
            self.remove_service().await?;
        }
        Ok(report)
    }

    /// Set one port field. Range is checked before any probe; with `check`,
    /// an occupied port is reported instead of applied. Own files only.
    pub async fn change_port(&mut self, field: &str, raw: &str, check: bool) -> ModuleResult<PortChange> {
        let id = self.id();
        let spec = self
            .spec()
            .port_spec(field)
            .ok_or_else(|| ModuleError::UnknownPortField {
                module: id.to_string(),
                field: field.to_string(),
            })?;
        let port = settings::parse_number(spec.key, raw)
            .ok()
            .and_then(|value| u16::try_from(value).ok())
            .filter(|port| *port > 0)
            .ok_or_else(|| ModuleError::InvalidPort {
                module: id.to_string(),
                field: field.to_string(),
                value: raw.to_string(),
            })?;

        if check {
            let credentials = self.view.as_ref().and_then(ModuleView::credentials);
            let classification = self.classify(port, spec.protocol, credentials.as_ref()).await?;
            if !classification.is_free() {
                tracing::info!(module = id, port, %classification, "port change refused");
                return Ok(PortChange::Occupied {
                    port,
                    classification,
                });
            }
        }

        self.ctx.settings.replace(spec.key, &port.to_string())?;
        tracing::info!(module = id, field, port, "port changed");
        self.reload()?;
        self.update_config()?;
        Ok(PortChange::Applied { port })
    }

    /// Change the root account on the running server, logged in with the
    /// stored credentials, then store the new ones. With `on_server` off only
    /// the settings change. The admin apps render them, so this cascades.
    pub async fn change_credentials(
        &mut self,
        user: &str,
        password: &str,
        on_server: bool,
    ) -> ModuleResult<CredentialChange> {
        let id = self.id();
        let keys = self.spec().credentials.ok_or(ModuleError::Unsupported {
            module: id.to_string(),
            what: "credentials",
        })?;
        settings::validate_value(keys.user, user)?;
        settings::validate_value(keys.password, password)?;

        if on_server {
            let primary = self.spec().primary_port().ok_or(ModuleError::Unsupported {
                module: id.to_string(),
                what: "port",
            })?;
            let view = self.ready_view()?;
            let port = view.port_for(primary)?;
            let current = view.credentials().ok_or(ModuleError::Unsupported {
                module: id.to_string(),
                what: "credentials",
            })?;
            let target = Credentials {
                user: user.to_string(),
                password: password.to_string(),
            };
            match self
                .probe
                .change_password(port, primary.protocol, &current, &target)
                .await
            {
                Ok(()) => {}
                Err(ProbeError::Timeout { .. }) => {
                    return Err(ModuleError::ProbeTimeout {
                        module: id.to_string(),
                        port,
                    });
                }
                Err(error) => {
                    tracing::warn!(module = id, port, %error, "password change refused");
                    return Ok(CredentialChange::Rejected {
                        reason: error.to_string(),
                    });
                }
            }
        }

        self.ctx
            .settings
            .replace_all(&[(keys.user, user), (keys.password, password)])?;
        tracing::info!(module = id, user, on_server, "credentials changed");
        self.reload()?;
        Ok(CredentialChange::Applied(cascade::run(id, &self.ctx)))
    }

    /// Re-apply this module's own config rules. No-op unless ready.
    pub fn update_config(&self) -> ModuleResult<Vec<(PathBuf, PatchOutcome)>> {
        let Ok(view) = self.ready_view() else {
            return Ok(Vec::new());
        };
        let plan = self.descriptor.config_patches(view, &self.ctx)?;
        Ok(patch::apply_all(&plan)?)
    }

    /// Classify what listens on the configured port of `field`.
    pub async fn check_port(&self, field: &str) -> ModuleResult<(u16, PortClassification)> {
        let view = self.current_view()?;
        let port = view.port(field)?;
        let protocol = self
            .spec()
            .port_spec(field)
            .map(|spec| spec.protocol)
            .unwrap_or(ProbeProtocol::Connect);
        let credentials = view.credentials();
        let classification = self.classify(port, protocol, credentials.as_ref()).await?;
        Ok((port, classification))
    }

    async fn classify(
        &self,
        port: u16,
        protocol: ProbeProtocol,
        credentials: Option<&Credentials>,
    ) -> ModuleResult<PortClassification> {
        match self.probe.classify(port, protocol, credentials).await {
            Ok(classification) => Ok(classification),
            Err(ProbeError::Timeout { .. }) => Err(ModuleError::ProbeTimeout {
                module: self.id().to_string(),
                port,
            }),
            Err(error) => {
                tracing::warn!(module = self.id(), port, %error, "probe failed");
                Ok(PortClassification::UsedByOther { banner: None })
            }
        }
    }

    /// What the OS service registration should look like. `None` for
    /// modules that never run as a service.
    pub fn service_spec(&self) -> ModuleResult<Option<ServiceSpec>> {
        let spec = self.spec();
        let Some(template) = spec.service else {
            return Ok(None);
        };
        let view = self.ready_view()?;
        let log = |suffix: &str| {
            template
                .capture_output
                .then(|| self.ctx.logs.join(format!("{}.{suffix}.log", spec.id)))
        };
        Ok(Some(ServiceSpec {
            name: spec.service_name(),
            display_name: format!("{} {}", descriptor::SERVICE_PREFIX, spec.display_name),
            binary: view.install_file(template.binary_key)?,
            params: self.descriptor.service_params(view, &self.ctx)?,
            stdout: log("out"),
            stderr: log("err"),
        }))
    }

    fn binding(&self) -> ModuleResult<Box<dyn ServiceBinding>> {
        if self.spec().service.is_none() {
            return Err(ModuleError::Unsupported {
                module: self.id().to_string(),
                what: "service",
            });
        }
        Ok(self.services.binding(&self.spec().service_name()))
    }

    fn bound<T>(&self, result: BindingResult<T>) -> ModuleResult<T> {
        result.map_err(|error| ModuleError::ServiceBindingFailure {
            module: self.id().to_string(),
            service: self.spec().service_name(),
            message: error.to_string(),
        })
    }

    /// Register and start the service after checking nobody else holds the
    /// primary port. A failed start carries the syntax check output.
    pub async fn install_service(&mut self) -> ModuleResult<ServiceOutcome> {
        let id = self.id();
        let spec = self.service_spec()?.ok_or(ModuleError::Unsupported {
            module: id.to_string(),
            what: "service",
        })?;
        let (port, classification) = self.check_port(PRIMARY_PORT).await?;
        let binding = self.binding()?;
        let ours_running = matches!(classification, PortClassification::UsedBySelf { .. })
            && self.bound(binding.is_running().await)?;

        match classification {
            PortClassification::NotInUse => {
                if !self.bound(binding.is_installed().await)? {
                    self.bound(binding.install(&spec).await)?;
                }
                if let Err(error) = binding.start().await {
                    let mut message = error.to_string();
                    if let Some(syntax) = self.run_checks().await.ok().and_then(|checks| checks.syntax) {
                        message.push_str(" ; ");
                        message.push_str(&syntax.lines.join(" ; "));
                    }
                    return Err(ModuleError::ServiceBindingFailure {
                        module: id.to_string(),
                        service: spec.name,
                        message,
                    });
                }
                tracing::info!(module = id, service = %spec.name, port, "service installed and started");
                Ok(ServiceOutcome::Started)
            }
            PortClassification::UsedBySelf { .. } if ours_running => Ok(ServiceOutcome::AlreadyRunning),
            classification => Err(ModuleError::PortInUse {
                module: id.to_string(),
                port,
                classification,
            }),
        }
    }

    /// Stop and unregister the service. `false` when it was not installed.
    pub async fn remove_service(&self) -> ModuleResult<bool> {
        let binding = self.binding()?;
        if !self.bound(binding.is_installed().await)? {
            tracing::warn!(module = self.id(), service = binding.name(), "service not installed");
            return Ok(false);
        }
        if self.bound(binding.is_running().await)? {
            self.bound(binding.stop().await)?;
        }
        self.bound(binding.remove().await)?;
        Ok(true)
    }

    async fn ensure_service_running(&self) -> ModuleResult<()> {
        let Some(spec) = self.service_spec()? else {
            return Ok(());
        };
        let binding = self.binding()?;
        if !self.bound(binding.is_installed().await)? {
            self.bound(binding.install(&spec).await)?;
        }
        if !self.bound(binding.is_running().await)? {
            self.bound(binding.start().await)?;
        }
        Ok(())
    }

    /// After a version switch an existing registration points at the old
    /// install root: re-register it, keeping its running state.
    async fn refresh_service(&self) -> ModuleResult<()> {
        if self.spec().service.is_none() {
            return Ok(());
        }
        if !self.is_ready() {
            self.remove_service().await?;
            return Ok(());
        }
        let binding = self.binding()?;
        if !self.bound(binding.is_installed().await)? {
            return Ok(());
        }
        let was_running = self.bound(binding.is_running().await)?;
        self.remove_service().await?;
        if let Some(spec) = self.service_spec()? {
            self.bound(binding.install(&spec).await)?;
            if was_running {
                self.bound(binding.start().await)?;
            }
        }
        Ok(())
    }

    /// Run the version command and, where the product has one, the syntax
    /// check.
    pub async fn run_checks(&self) -> ModuleResult<CommandChecks> {
        let commands = self.spec().commands.ok_or(ModuleError::Unsupported {
            module: self.id().to_string(),
            what: "command-line probe",
        })?;
        let program = self.current_view()?.install_file(commands.binary_key)?;
        let version = cmdline::check(&program, commands.version_args, None, self.command_timeout).await?;
        let syntax = match commands.syntax {
            Some((args, sentinel)) => {
                Some(cmdline::check(&program, args, Some(sentinel), self.command_timeout).await?)
            }
            None => None,
        };
        Ok(CommandChecks { version, syntax })
    }
}

fn evaluate(view: &ModuleView) -> ModuleState {
    let linked = view
        .paths
        .install_root
        .is_dir()
        .then(|| paths::repoint_stable_root(&view.paths));
    if !view.enabled {
        if let Some(Err(error)) = &linked {
            tracing::warn!(module = view.id(), %error, "stable root not linked");
        }
        return ModuleState::Disabled;
    }
    if let Err(error) = view.validate() {
        tracing::warn!(module = view.id(), %error, "enabled module is invalid");
        return ModuleState::Invalid(error.to_string());
    }
    match linked {
        Some(Ok(StableRootStatus::Blocked)) => {
            let reason = format!(
                "stable root '{}' is a populated directory",
                view.paths.stable_root.display()
            );
            tracing::error!(module = view.id(), %reason, "cannot repoint stable root");
            ModuleState::Invalid(reason)
        }
        Some(Err(error)) => {
            tracing::error!(module = view.id(), %error, "cannot repoint stable root");
            ModuleState::Invalid(format!(
                "cannot link stable root '{}': {error}",
                view.paths.stable_root.display()
            ))
        }
        _ => ModuleState::Ready,
    }
}

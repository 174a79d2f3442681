//! Owns one lazily-built [`Module`] per descriptor and fans bulk operations
//! out over them. Every mutation also lands in the action log.

use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::Serialize;
use tokio::{sync::RwLock, task::JoinSet};

use crate::{
    config::EngineConfig,
    logging::{ActionEntry, ActionLevel, ActionLog},
    module::{
        CascadeReport, CommandChecks, CredentialChange, EngineContext, Module, ModuleError,
        ModuleResult, ModuleState, ModuleView, PortChange, ServiceOutcome,
        cascade::StepOutcome,
        descriptor::{MODULE_ORDER, descriptor},
        descriptors::web,
        online::{self, OnlineReport},
    },
    patch::{self, PatchOutcome},
    paths::Family,
    probe::{PortClassification, PortProbe},
    service::{self, ServiceManager, ServiceSpec},
    settings::SettingsStore,
};

pub type SharedModule = Arc<RwLock<Module>>;

#[derive(Debug, Clone, Serialize)]
pub struct PortStatus {
    pub field: &'static str,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModuleStatus {
    pub id: &'static str,
    pub name: &'static str,
    pub family: Family,
    pub version: Option<String>,
    pub enabled: bool,
    pub state: ModuleState,
    pub ports: Vec<PortStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortReport {
    pub module: &'static str,
    pub field: &'static str,
    pub port: Option<u16>,
    pub classification: Option<PortClassification>,
    pub error: Option<String>,
}

pub struct Registry {
    ctx: EngineContext,
    services: Arc<dyn ServiceManager>,
    probe: PortProbe,
    log: ActionLog,
    modules: HashMap<&'static str, OnceCell<SharedModule>>,
}

impl Registry {
    pub fn new(
        config: &EngineConfig,
        settings: SettingsStore,
        services: Arc<dyn ServiceManager>,
        log: ActionLog,
    ) -> Self {
        let probe = PortProbe::new(&config.probe).with_ping_path(config.web.ping_path.clone());
        Self {
            ctx: EngineContext::new(config, settings),
            services,
            probe,
            log,
            modules: MODULE_ORDER.iter().map(|id| (*id, OnceCell::new())).collect(),
        }
    }

    /// Open the settings store, service manager and action log `config`
    /// points at.
    pub fn open(config: &EngineConfig) -> Result<Self> {
        let settings = SettingsStore::open(&config.settings)
            .with_context(|| format!("opening settings {:?}", config.settings.display()))?;
        let log = ActionLog::open(&config.logs)?;
        Ok(Self::new(config, settings, service::manager_for(&config.service), log))
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    /// The module for `id`, built and reloaded on first access.
    pub fn module(&self, id: &str) -> ModuleResult<SharedModule> {
        let cell = self
            .modules
            .get(id)
            .ok_or_else(|| ModuleError::UnknownModule(id.to_string()))?;
        let shared = cell.get_or_try_init(|| {
            let descriptor = descriptor(id).ok_or_else(|| ModuleError::UnknownModule(id.to_string()))?;
            let mut module = Module::new(
                descriptor,
                self.ctx.clone(),
                Arc::clone(&self.services),
                self.probe.clone(),
            );
            if let Err(error) = module.reload() {
                tracing::warn!(module = id, %error, "initial reload failed");
            }
            Ok::<_, ModuleError>(Arc::new(RwLock::new(module)))
        })?;
        Ok(Arc::clone(shared))
    }

    pub fn view(&self, id: &str) -> ModuleResult<ModuleView> {
        self.ctx.view(id)
    }

    fn journal<T>(&self, id: &str, action: &str, result: &ModuleResult<T>) {
        let entry = match result {
            Ok(_) => ActionEntry::new(id, ActionLevel::Info).with_message(action),
            Err(error) => ActionEntry::new(id, ActionLevel::Error).with_message(format!("{action}: {error}")),
        };
        self.log.note(entry);
    }

    fn journal_cascade(&self, report: &CascadeReport) {
        tracing::debug!(modules = ?report.visited().collect::<Vec<_>>(), "cascade finished");
        for step in report.failures() {
            if let StepOutcome::Failed { error } = &step.outcome {
                self.log.note(
                    ActionEntry::new(&step.module, ActionLevel::Warning)
                        .with_message(format!("update after {} failed: {error}", step.trigger)),
                );
            }
        }
    }

    /// Re-read the settings file and reload every module.
    pub async fn reload_all(&self) -> ModuleResult<Vec<(&'static str, ModuleState)>> {
        self.ctx.settings.reload()?;
        let mut states = Vec::with_capacity(MODULE_ORDER.len());
        for id in MODULE_ORDER {
            let shared = self.module(id)?;
            let mut module = shared.write().await;
            if let Err(error) = module.reload() {
                tracing::warn!(module = id, %error, "reload failed");
            }
            states.push((id, module.state().clone()));
        }
        Ok(states)
    }

    /// Re-apply the own config rules of every ready module. Returns the
    /// files that changed.
    pub async fn update_all(&self) -> ModuleResult<Vec<PathBuf>> {
        let mut changed = Vec::new();
        for id in MODULE_ORDER {
            let shared = self.module(id)?;
            let module = shared.read().await;
            let result = module.update_config();
            if result.is_err() {
                self.journal(id, "update config", &result);
            }
            changed.extend(
                result?
                    .into_iter()
                    .filter(|(_, outcome)| *outcome == PatchOutcome::Changed)
                    .map(|(path, _)| path),
            );
        }
        Ok(changed)
    }

    pub async fn status(&self, ids: &[String]) -> ModuleResult<Vec<ModuleStatus>> {
        let mut statuses = Vec::new();
        for id in self.select(ids)? {
            let shared = self.module(id)?;
            let module = shared.read().await;
            let spec = module.spec();
            let view = module.view();
            let ports = match view {
                Some(view) => spec
                    .ports
                    .iter()
                    .filter_map(|port| {
                        Some(PortStatus {
                            field: port.field,
                            port: view.port_for(port).ok()?,
                        })
                    })
                    .collect(),
                None => Vec::new(),
            };
            statuses.push(ModuleStatus {
                id,
                name: spec.display_name,
                family: spec.family,
                version: view.map(|view| view.version.clone()),
                enabled: view.is_some_and(|view| view.enabled),
                state: module.state().clone(),
                ports,
            });
        }
        Ok(statuses)
    }

    /// Service registrations of every ready module that runs as a service,
    /// in registry order.
    pub async fn services(&self) -> ModuleResult<Vec<ServiceSpec>> {
        let mut specs = Vec::new();
        for id in MODULE_ORDER {
            let shared = self.module(id)?;
            let module = shared.read().await;
            if !module.is_ready() {
                continue;
            }
            if let Some(spec) = module.service_spec()? {
                specs.push(spec);
            }
        }
        Ok(specs)
    }

    /// Classify every port field of the selected modules concurrently. Each
    /// probe holds its module's read lock until it finishes.
    pub async fn probe_all(&self, ids: &[String]) -> ModuleResult<Vec<PortReport>> {
        let mut tasks = JoinSet::new();
        for id in self.select(ids)? {
            let shared = self.module(id)?;
            let ports = shared.read().await.spec().ports;
            for port in ports {
                let module = Arc::clone(&shared).read_owned().await;
                let field = port.field;
                tasks.spawn(async move {
                    let result = module.check_port(field).await;
                    (module.id(), field, result)
                });
            }
        }

        let mut reports = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (module, field, result) = match joined {
                Ok(outcome) => outcome,
                Err(error) => {
                    tracing::error!(%error, "probe task failed");
                    continue;
                }
            };
            let report = match result {
                Ok((port, classification)) => {
                    self.log.note(
                        ActionEntry::new(module, ActionLevel::Info)
                            .with_message(format!("port {port} ({field}): {classification}")),
                    );
                    PortReport {
                        module,
                        field,
                        port: Some(port),
                        classification: Some(classification),
                        error: None,
                    }
                }
                Err(error) => PortReport {
                    module,
                    field,
                    port: None,
                    classification: None,
                    error: Some(error.to_string()),
                },
            };
            reports.push(report);
        }
        reports.sort_by_key(|report| (order_of(report.module), field_order(report.module, report.field)));
        Ok(reports)
    }

    pub async fn switch_version(&self, id: &str, version: &str) -> ModuleResult<CascadeReport> {
        let shared = self.module(id)?;
        let result = shared.write().await.switch_version(version).await;
        self.journal(id, &format!("switch to {version}"), &result);
        if let Ok(report) = &result {
            self.journal_cascade(report);
        }
        result
    }

    pub async fn set_enable(&self, id: &str, enabled: bool) -> ModuleResult<CascadeReport> {
        let shared = self.module(id)?;
        let result = shared.write().await.set_enable(enabled).await;
        let action = if enabled { "enable" } else { "disable" };
        self.journal(id, action, &result);
        if let Ok(report) = &result {
            self.journal_cascade(report);
        }
        result
    }

    pub async fn change_port(&self, id: &str, field: &str, raw: &str, check: bool) -> ModuleResult<PortChange> {
        let shared = self.module(id)?;
        let result = shared.write().await.change_port(field, raw, check).await;
        let action = match &result {
            Ok(PortChange::Occupied { port, classification }) => {
                format!("port {port} for {field} refused: {classification}")
            }
            _ => format!("set {field} port to {raw}"),
        };
        self.journal(id, &action, &result);
        result
    }

    pub async fn change_credentials(
        &self,
        id: &str,
        user: &str,
        password: &str,
        on_server: bool,
    ) -> ModuleResult<CredentialChange> {
        let shared = self.module(id)?;
        let result = shared.write().await.change_credentials(user, password, on_server).await;
        let action = match &result {
            Ok(CredentialChange::Rejected { reason }) => {
                format!("credentials for {user} rejected: {reason}")
            }
            _ => format!("set credentials for {user}"),
        };
        self.journal(id, &action, &result);
        if let Ok(CredentialChange::Applied(report)) = &result {
            self.journal_cascade(report);
        }
        result
    }

    pub async fn install_service(&self, id: &str) -> ModuleResult<ServiceOutcome> {
        let shared = self.module(id)?;
        let result = shared.write().await.install_service().await;
        self.journal(id, "install service", &result);
        result
    }

    pub async fn remove_service(&self, id: &str) -> ModuleResult<bool> {
        let shared = self.module(id)?;
        let result = shared.read().await.remove_service().await;
        self.journal(id, "remove service", &result);
        result
    }

    pub async fn run_checks(&self, id: &str) -> ModuleResult<CommandChecks> {
        let shared = self.module(id)?;
        shared.read().await.run_checks().await
    }

    pub async fn versions(&self, id: &str) -> ModuleResult<Vec<String>> {
        let shared = self.module(id)?;
        shared.read().await.versions()
    }

    /// Flip every installed module between public and local-only access,
    /// then reload so modules see the new flag.
    pub async fn switch_online(&self, online: bool) -> ModuleResult<OnlineReport> {
        let result = online::switch_online(&self.ctx, online);
        let action = if online { "go online" } else { "go offline" };
        self.journal("bundle", action, &result);
        let report = result?;
        for (id, reason) in &report.skipped {
            self.log.note(
                ActionEntry::new(*id, ActionLevel::Warning).with_message(format!("{action} skipped: {reason}")),
            );
        }
        self.reload_all().await?;
        Ok(report)
    }

    /// Write `<alias>/<name>.conf` exposing `destination` under `/<name>`.
    pub fn add_alias(&self, name: &str, destination: &Path) -> ModuleResult<PathBuf> {
        let apache = self.ctx.view("apache")?;
        let path = self.ctx.web.alias.join(format!("{name}.conf"));
        let contents = web::alias_content(&apache.version, self.ctx.online(), name, destination);
        let result = create_file(&path, &contents);
        self.journal("apache", &format!("add alias {name}"), &result);
        result.map(|_| path)
    }

    /// Write `<vhosts>/<server_name>.conf` serving `document_root`.
    pub fn add_vhost(&self, server_name: &str, document_root: &Path) -> ModuleResult<PathBuf> {
        let apache = self.ctx.view("apache")?;
        let path = self.ctx.web.vhosts.join(format!("{server_name}.conf"));
        let result = web::vhost_content(&apache, &self.ctx, server_name, document_root)
            .and_then(|contents| create_file(&path, &contents));
        self.journal("apache", &format!("add vhost {server_name}"), &result);
        result.map(|_| path)
    }

    fn select(&self, ids: &[String]) -> ModuleResult<Vec<&'static str>> {
        if ids.is_empty() {
            return Ok(MODULE_ORDER.to_vec());
        }
        ids.iter()
            .map(|id| {
                MODULE_ORDER
                    .iter()
                    .copied()
                    .find(|known| *known == id.as_str())
                    .ok_or_else(|| ModuleError::UnknownModule(id.clone()))
            })
            .collect()
    }
}

fn create_file(path: &Path, contents: &str) -> ModuleResult<()> {
    if path.exists() {
        return Err(ModuleError::Io {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::AlreadyExists, "file already exists"),
        });
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ModuleError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    Ok(patch::write_atomic(path, contents)?)
}

fn order_of(id: &str) -> usize {
    MODULE_ORDER
        .iter()
        .position(|known| *known == id)
        .unwrap_or(MODULE_ORDER.len())
}

fn field_order(id: &str, field: &str) -> usize {
    descriptor(id)
        .and_then(|descriptor| descriptor.spec().ports.iter().position(|port| port.field == field))
        .unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        module::{inventory, testing::Fixture},
        service::MemoryServiceManager,
    };
    use std::fs;

    fn registry(fixture: &Fixture, services: &MemoryServiceManager) -> Registry {
        let log = ActionLog::open(&fixture.config().logs).expect("action log");
        Registry::new(fixture.config(), fixture.settings(), Arc::new(services.clone()), log)
    }

    fn action_log(fixture: &Fixture) -> String {
        fs::read_to_string(fixture.config().logs.join(crate::logging::ACTION_LOG_FILE)).unwrap_or_default()
    }

    #[tokio::test]
    async fn services_follow_registry_order() -> anyhow::Result<()> {
        let fixture = Fixture::new();
        fixture.install_mysql("8.0.36", 3306);
        fixture.install_mariadb("10.4", 3307);
        fixture.install_memcached("1.6.21");
        for id in ["mysql", "mariadb", "memcached"] {
            fixture.enable(id);
        }
        let registry = registry(&fixture, &MemoryServiceManager::default());

        let names = registry
            .services()
            .await?
            .into_iter()
            .map(|spec| spec.name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["bundlectlmemcached", "bundlectlmariadb", "bundlectlmysql"]);
        Ok(())
    }

    #[tokio::test]
    async fn versions_are_listed_in_version_order() -> anyhow::Result<()> {
        let fixture = Fixture::new();
        fixture.install_mariadb("10.6.16", 3306);
        fixture.install_mariadb("10.4", 3306);
        let registry = registry(&fixture, &MemoryServiceManager::default());
        assert_eq!(registry.versions("mariadb").await?, vec!["10.4", "10.6.16"]);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_module_is_rejected() {
        let fixture = Fixture::new();
        let registry = registry(&fixture, &MemoryServiceManager::default());
        assert!(matches!(registry.module("nginx"), Err(ModuleError::UnknownModule(_))));
        assert!(matches!(
            registry.status(&["nginx".to_string()]).await,
            Err(ModuleError::UnknownModule(id)) if id == "nginx"
        ));
    }

    #[tokio::test]
    async fn reload_all_picks_up_external_edits() -> anyhow::Result<()> {
        let fixture = Fixture::new();
        fixture.install_memcached("1.6.21");
        let registry = registry(&fixture, &MemoryServiceManager::default());
        assert_eq!(registry.status(&["memcached".to_string()]).await?[0].state, ModuleState::Disabled);

        let path = &fixture.config().settings;
        let edited = fs::read_to_string(path)?.replace("memcachedEnable = \"0\"", "memcachedEnable = \"1\"");
        fs::write(path, edited)?;

        let states = registry.reload_all().await?;
        assert!(states.contains(&("memcached", ModuleState::Ready)));
        assert_eq!(states.len(), MODULE_ORDER.len());
        Ok(())
    }

    #[tokio::test]
    async fn failed_enable_is_journaled() {
        let fixture = Fixture::new();
        let registry = registry(&fixture, &MemoryServiceManager::default());
        assert!(registry.set_enable("mysql", true).await.is_err());

        let log = action_log(&fixture);
        let line = log.lines().last().expect("one entry");
        assert!(line.contains("| ERROR   | mysql      | enable: "), "{line}");
    }

    #[tokio::test]
    async fn probe_all_reports_each_port_field() -> anyhow::Result<()> {
        let fixture = Fixture::new();
        fixture.install_memcached("1.6.21");
        let free = std::net::TcpListener::bind("127.0.0.1:0")?.local_addr()?.port();
        fixture.settings().replace("memcachedPort", &free.to_string())?;
        let registry = registry(&fixture, &MemoryServiceManager::default());

        let reports = registry.probe_all(&["memcached".to_string()]).await?;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].port, Some(free));
        assert_eq!(reports[0].classification, Some(PortClassification::NotInUse));
        assert!(action_log(&fixture).contains(&format!("port {free} (primary): ")));
        Ok(())
    }

    #[tokio::test]
    async fn online_switch_reloads_and_journals() -> anyhow::Result<()> {
        let fixture = Fixture::new();
        fixture.install_apache("2.4.58", 80);
        let registry = registry(&fixture, &MemoryServiceManager::default());

        let report = registry.switch_online(true).await?;
        assert!(report.skipped.is_empty());
        assert!(registry.context().online());
        assert!(action_log(&fixture).contains("| bundle     | go online"));
        Ok(())
    }

    #[tokio::test]
    async fn added_vhost_is_listed_and_not_overwritten() -> anyhow::Result<()> {
        let fixture = Fixture::new();
        fixture.install_apache("2.4.58", 8080);
        let registry = registry(&fixture, &MemoryServiceManager::default());
        let root = fixture.www().join("site");

        let path = registry.add_vhost("site.test", &root)?;
        let contents = fs::read_to_string(&path)?;
        assert!(contents.starts_with("<VirtualHost *:8080>\n"));
        assert!(contents.contains("Require local"));
        assert_eq!(inventory::vhost_urls(&fixture.vhosts())?[0].name, "site.test");

        assert!(matches!(
            registry.add_vhost("site.test", &root),
            Err(ModuleError::Io { .. })
        ));

        let alias = registry.add_alias("tools", &fixture.www().join("tools"))?;
        assert_eq!(inventory::conf_names(&fixture.alias())?, vec!["tools"]);
        assert!(fs::read_to_string(alias)?.starts_with("Alias /tools \""));
        Ok(())
    }
}

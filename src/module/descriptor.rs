use std::{collections::HashMap, sync::Arc};

use once_cell::sync::Lazy;

use super::{
    descriptors::{apps, daemons, runtime, sql, web},
    error::ModuleResult,
    view::{EngineContext, ModuleView},
};
use crate::{cmdline::Sentinel, patch::FilePatch, paths::Family, probe::ProbeProtocol};

/// Field name of the port every service-bearing module probes before install.
pub const PRIMARY_PORT: &str = "primary";

/// Prefix of every OS service name registered by the engine.
pub const SERVICE_PREFIX: &str = "bundlectl";

/// Registry order; also the order `services()` and `status` report in.
pub const MODULE_ORDER: [&str; 14] = [
    "apache",
    "mailpit",
    "memcached",
    "mariadb",
    "mysql",
    "nodejs",
    "php",
    "postgresql",
    "svn",
    "filezilla",
    "xlight",
    "phpmyadmin",
    "adminer",
    "phppgadmin",
];

#[derive(Debug, Clone, Copy)]
pub struct PortSpec {
    pub field: &'static str,
    /// Settings key holding the port, e.g. `apacheSslPort`.
    pub key: &'static str,
    pub default: u16,
    pub protocol: ProbeProtocol,
}

#[derive(Debug, Clone, Copy)]
pub struct ServiceTemplate {
    /// Bundle key of the binary the service runs.
    pub binary_key: &'static str,
    /// Redirect stdout/stderr to `<logs>/<id>.out.log` / `.err.log`.
    pub capture_output: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct CredentialKeys {
    pub user: &'static str,
    pub password: &'static str,
    pub default_user: &'static str,
}

#[derive(Debug, Clone, Copy)]
pub struct CommandProbe {
    pub binary_key: &'static str,
    pub version_args: &'static [&'static str],
    pub syntax: Option<(&'static [&'static str], Sentinel)>,
}

/// Static facts about one bundled module.
#[derive(Debug, Clone, Copy)]
pub struct DescriptorSpec {
    pub id: &'static str,
    pub family: Family,
    pub display_name: &'static str,
    /// Bundle keys naming files (relative to the install root) that must
    /// exist while the module is enabled.
    pub required_files: &'static [&'static str],
    pub ports: &'static [PortSpec],
    pub service: Option<ServiceTemplate>,
    pub credentials: Option<CredentialKeys>,
    pub commands: Option<CommandProbe>,
}

impl DescriptorSpec {
    pub fn enable_key(&self) -> String {
        format!("{}Enable", self.id)
    }

    pub fn version_key(&self) -> String {
        format!("{}Version", self.id)
    }

    pub fn service_name(&self) -> String {
        format!("{SERVICE_PREFIX}{}", self.id)
    }

    pub fn port_spec(&self, field: &str) -> Option<&'static PortSpec> {
        self.ports.iter().find(|spec| spec.field == field)
    }

    pub fn primary_port(&self) -> Option<&'static PortSpec> {
        self.port_spec(PRIMARY_PORT).or_else(|| self.ports.first())
    }
}

/// Behaviour that differs per module. Everything else is driven by the
/// generic engine from [`DescriptorSpec`].
pub trait Descriptor: Send + Sync {
    fn spec(&self) -> &'static DescriptorSpec;

    /// Rewrites of this module's own files so they agree with the settings.
    fn config_patches(&self, _view: &ModuleView, _ctx: &EngineContext) -> ModuleResult<Vec<FilePatch>> {
        Ok(Vec::new())
    }

    /// Can `candidate` run against the currently active dependencies?
    fn check_compatibility(&self, _candidate: &ModuleView, _ctx: &EngineContext) -> ModuleResult<()> {
        Ok(())
    }

    fn service_params(&self, _view: &ModuleView, _ctx: &EngineContext) -> ModuleResult<String> {
        Ok(String::new())
    }

    /// Rewrites applied when the host switches between public and local-only.
    fn online_patches(
        &self,
        _view: &ModuleView,
        _ctx: &EngineContext,
        _online: bool,
    ) -> ModuleResult<Vec<FilePatch>> {
        Ok(Vec::new())
    }
}

static DESCRIPTOR_REGISTRY: Lazy<HashMap<&'static str, Arc<dyn Descriptor>>> = Lazy::new(|| {
    let mut map: HashMap<&'static str, Arc<dyn Descriptor>> = HashMap::new();
    let all: [Arc<dyn Descriptor>; 14] = [
        Arc::new(web::Apache),
        Arc::new(daemons::Mailpit),
        Arc::new(daemons::Memcached),
        Arc::new(sql::SqlEngine::MARIADB),
        Arc::new(sql::SqlEngine::MYSQL),
        Arc::new(runtime::NodeJs),
        Arc::new(runtime::Php),
        Arc::new(sql::SqlEngine::POSTGRESQL),
        Arc::new(daemons::Svn),
        Arc::new(daemons::FileZilla),
        Arc::new(daemons::Xlight),
        Arc::new(apps::AdminApp::PHPMYADMIN),
        Arc::new(apps::AdminApp::ADMINER),
        Arc::new(apps::AdminApp::PHPPGADMIN),
    ];
    for descriptor in all {
        map.insert(descriptor.spec().id, descriptor);
    }
    map
});

pub fn descriptor(id: &str) -> Option<Arc<dyn Descriptor>> {
    DESCRIPTOR_REGISTRY.get(id).cloned()
}

/// Every descriptor in registry order.
pub fn descriptors() -> impl Iterator<Item = Arc<dyn Descriptor>> {
    MODULE_ORDER.into_iter().filter_map(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_covers_module_order() {
        assert_eq!(descriptors().count(), MODULE_ORDER.len());
        for id in MODULE_ORDER {
            let descriptor = descriptor(id).expect("registered");
            assert_eq!(descriptor.spec().id, id);
        }
    }

    #[test]
    fn port_keys_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for descriptor in descriptors() {
            for port in descriptor.spec().ports {
                assert!(seen.insert(port.key), "duplicate port key {}", port.key);
                assert!(port.key.starts_with(descriptor.spec().id));
            }
        }
    }

    #[test]
    fn service_names_are_prefixed() {
        let apache = descriptor("apache").expect("apache");
        assert_eq!(apache.spec().service_name(), "bundlectlapache");
        assert_eq!(apache.spec().enable_key(), "apacheEnable");
        assert_eq!(apache.spec().version_key(), "apacheVersion");
    }
}

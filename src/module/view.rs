use std::path::PathBuf;

use super::{
    descriptor::{DescriptorSpec, PortSpec, descriptor},
    error::{ModuleError, ModuleResult},
};
use crate::{
    config::{EngineConfig, WebLayout},
    paths::{ModulePaths, PathResolver},
    probe::Credentials,
    settings::{self, Bundle, KEY_ONLINE, SettingsStore},
};

/// Shared handles every module operation works against.
#[derive(Debug, Clone)]
pub struct EngineContext {
    pub settings: SettingsStore,
    pub paths: PathResolver,
    pub web: WebLayout,
    pub logs: PathBuf,
}

impl EngineContext {
    pub fn new(config: &EngineConfig, settings: SettingsStore) -> Self {
        Self {
            settings,
            paths: PathResolver::new(config.root.clone()),
            web: config.web.clone(),
            logs: config.logs.clone(),
        }
    }

    pub fn online(&self) -> bool {
        self.settings.is_enabled(KEY_ONLINE)
    }

    /// Fresh snapshot of another module, read from settings and disk.
    pub fn view(&self, id: &str) -> ModuleResult<ModuleView> {
        let descriptor = descriptor(id).ok_or_else(|| ModuleError::UnknownModule(id.to_string()))?;
        ModuleView::load(self, descriptor.spec())
    }
}

/// What the settings store and the filesystem say about one module right now.
#[derive(Debug, Clone)]
pub struct ModuleView {
    pub spec: &'static DescriptorSpec,
    pub enabled: bool,
    pub version: String,
    pub paths: ModulePaths,
    pub bundle: Option<Bundle>,
    settings: SettingsStore,
}

impl ModuleView {
    pub fn load(ctx: &EngineContext, spec: &'static DescriptorSpec) -> ModuleResult<Self> {
        let version = ctx.settings.require(&spec.version_key())?;
        let paths = ctx.paths.resolve(spec.family, spec.id, &version);
        Ok(Self {
            spec,
            enabled: ctx.settings.is_enabled(&spec.enable_key()),
            bundle: load_bundle(&paths)?,
            version,
            paths,
            settings: ctx.settings.clone(),
        })
    }

    /// The same module at `target`, with paths derived by substituting the
    /// version tag of the current ones.
    pub fn for_version(&self, target: &str) -> ModuleResult<Self> {
        let paths = self.paths.for_version(self.spec.id, target);
        Ok(Self {
            spec: self.spec,
            enabled: self.enabled,
            version: target.to_string(),
            bundle: load_bundle(&paths)?,
            paths,
            settings: self.settings.clone(),
        })
    }

    pub fn id(&self) -> &'static str {
        self.spec.id
    }

    /// Globally selected value first, then the version's bundle default.
    pub fn setting(&self, key: &str) -> Option<String> {
        self.settings
            .get(key)
            .or_else(|| self.bundle.as_ref()?.get(key).map(str::to_string))
    }

    pub fn bundle_value(&self, key: &str) -> ModuleResult<&str> {
        let bundle = self.bundle.as_ref().ok_or_else(|| ModuleError::MissingConfig {
            module: self.id().to_string(),
            path: self.paths.bundle.clone(),
        })?;
        bundle.get(key).ok_or_else(|| ModuleError::MissingBundleKey {
            module: self.id().to_string(),
            key: key.to_string(),
            bundle: self.paths.bundle.clone(),
        })
    }

    pub fn install_file(&self, key: &str) -> ModuleResult<PathBuf> {
        Ok(self.paths.install_file(self.bundle_value(key)?))
    }

    pub fn stable_file(&self, key: &str) -> ModuleResult<PathBuf> {
        Ok(self.paths.stable_file(self.bundle_value(key)?))
    }

    pub fn port(&self, field: &str) -> ModuleResult<u16> {
        let spec = self
            .spec
            .port_spec(field)
            .ok_or_else(|| ModuleError::UnknownPortField {
                module: self.id().to_string(),
                field: field.to_string(),
            })?;
        self.port_for(spec)
    }

    pub fn port_for(&self, spec: &PortSpec) -> ModuleResult<u16> {
        let Some(raw) = self.setting(spec.key) else {
            return Ok(spec.default);
        };
        let invalid = || ModuleError::InvalidPort {
            module: self.id().to_string(),
            field: spec.field.to_string(),
            value: raw.clone(),
        };
        let value = settings::parse_number(spec.key, &raw).map_err(|_| invalid())?;
        u16::try_from(value)
            .ok()
            .filter(|port| *port > 0)
            .ok_or_else(invalid)
    }

    pub fn ports(&self) -> ModuleResult<Vec<(&'static PortSpec, u16)>> {
        self.spec
            .ports
            .iter()
            .map(|spec| Ok((spec, self.port_for(spec)?)))
            .collect()
    }

    pub fn credentials(&self) -> Option<Credentials> {
        let keys = self.spec.credentials?;
        Some(Credentials {
            user: self
                .setting(keys.user)
                .filter(|user| !user.is_empty())
                .unwrap_or_else(|| keys.default_user.to_string()),
            password: self.setting(keys.password).unwrap_or_default(),
        })
    }

    /// Everything an enabled module needs on disk, plus well-formed ports.
    pub fn validate(&self) -> ModuleResult<()> {
        if !self.paths.install_root.is_dir() {
            return Err(ModuleError::MissingInstall {
                module: self.id().to_string(),
                path: self.paths.install_root.clone(),
            });
        }
        for key in self.spec.required_files {
            let path = self.install_file(key)?;
            if !path.exists() {
                return Err(ModuleError::MissingConfig {
                    module: self.id().to_string(),
                    path,
                });
            }
        }
        self.ports()?;
        Ok(())
    }
}

fn load_bundle(paths: &ModulePaths) -> ModuleResult<Option<Bundle>> {
    if !paths.bundle.is_file() {
        return Ok(None);
    }
    Ok(Some(Bundle::load(&paths.bundle)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::testing::Fixture;

    #[test]
    fn ports_prefer_settings_then_bundle_then_default() {
        let fixture = Fixture::new();
        fixture.install_mysql("8.0.36", 3306);
        let ctx = fixture.context();

        let view = ctx.view("mysql").expect("view");
        assert_eq!(view.port("primary").expect("port"), 3306);

        ctx.settings.replace("mysqlPort", "3310").expect("replace");
        let view = ctx.view("mysql").expect("view");
        assert_eq!(view.port("primary").expect("port"), 3310);

        let memcached = ctx.view("memcached").expect("view");
        assert_eq!(memcached.port("primary").expect("port"), 11211);
    }

    #[test]
    fn malformed_port_is_invalid_port() {
        let fixture = Fixture::new();
        fixture.install_mysql("8.0.36", 3306);
        let ctx = fixture.context();
        ctx.settings.replace("mysqlPort", "70000").expect("replace");
        let view = ctx.view("mysql").expect("view");
        assert!(matches!(
            view.validate(),
            Err(ModuleError::InvalidPort { value, .. }) if value == "70000"
        ));
    }

    #[test]
    fn validate_reports_missing_pieces_in_order() {
        let fixture = Fixture::new();
        let ctx = fixture.context();
        let view = ctx.view("mysql").expect("view");
        assert!(matches!(view.validate(), Err(ModuleError::MissingInstall { .. })));

        fixture.install_mysql("8.0.36", 3306);
        std::fs::remove_file(fixture.module_dir("mysql", "8.0.36").join("my.ini")).expect("remove");
        let view = ctx.view("mysql").expect("view");
        assert!(matches!(view.validate(), Err(ModuleError::MissingConfig { path, .. }) if path.ends_with("my.ini")));
    }

    #[test]
    fn credentials_fall_back_to_defaults() {
        let fixture = Fixture::new();
        let ctx = fixture.context();
        let pg = ctx.view("postgresql").expect("view");
        let credentials = pg.credentials().expect("sql engine");
        assert_eq!(credentials.user, "postgres");
        assert_eq!(credentials.password, "");
        assert!(ctx.view("apache").expect("view").credentials().is_none());
    }

    #[test]
    fn unknown_module_is_reported() {
        let fixture = Fixture::new();
        assert!(matches!(
            fixture.context().view("nginx"),
            Err(ModuleError::UnknownModule(id)) if id == "nginx"
        ));
    }
}

use super::{line_rule, web};
use crate::{
    module::{
        descriptor::{CommandProbe, Descriptor, DescriptorSpec, PRIMARY_PORT},
        error::ModuleResult,
        view::{EngineContext, ModuleView},
    },
    patch::FilePatch,
    paths::Family,
};

const PHP_SPEC: DescriptorSpec = DescriptorSpec {
    id: "php",
    family: Family::Bins,
    display_name: "PHP",
    required_files: &["phpCliExe", "phpConf"],
    ports: &[],
    service: None,
    credentials: None,
    commands: Some(CommandProbe {
        binary_key: "phpCliExe",
        version_args: &["-v"],
        syntax: None,
    }),
};

const NODEJS_SPEC: DescriptorSpec = DescriptorSpec {
    id: "nodejs",
    family: Family::Bins,
    display_name: "Node.js",
    required_files: &["nodejsExe"],
    ports: &[],
    service: None,
    credentials: None,
    commands: Some(CommandProbe {
        binary_key: "nodejsExe",
        version_args: &["--version"],
        syntax: None,
    }),
};

pub struct Php;

impl Descriptor for Php {
    fn spec(&self) -> &'static DescriptorSpec {
        &PHP_SPEC
    }

    /// php.ini follows the MySQL port.
    fn config_patches(&self, view: &ModuleView, ctx: &EngineContext) -> ModuleResult<Vec<FilePatch>> {
        let mysql_port = match ctx.view("mysql").and_then(|mysql| mysql.port(PRIMARY_PORT)) {
            Ok(port) => port,
            Err(error) => {
                tracing::warn!(%error, "mysql port unavailable, php.ini left as is");
                return Ok(Vec::new());
            }
        };
        Ok(vec![FilePatch::required(
            view.install_file("phpConf")?,
            vec![
                line_rule(
                    r"^mysql.default_port\s*=\s*(\d+)",
                    format!("mysql.default_port = {mysql_port}"),
                )?,
                line_rule(
                    r"^mysqli.default_port\s*=\s*(\d+)",
                    format!("mysqli.default_port = {mysql_port}"),
                )?,
            ],
        )])
    }

    /// A new PHP version must ship a module for the active Apache.
    fn check_compatibility(&self, candidate: &ModuleView, ctx: &EngineContext) -> ModuleResult<()> {
        let apache = match ctx.view("apache") {
            Ok(apache) => apache,
            Err(error) => {
                tracing::debug!(%error, "no apache to check against");
                return Ok(());
            }
        };
        if !apache.enabled {
            return Ok(());
        }
        web::php_binding(candidate, &apache.version)
            .map(|_| ())
            .map_err(|reason| web::incompatible(candidate, &apache, reason))
    }
}

pub struct NodeJs;

impl Descriptor for NodeJs {
    fn spec(&self) -> &'static DescriptorSpec {
        &NODEJS_SPEC
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        module::{error::ModuleError, testing::Fixture},
        patch,
    };
    use std::fs;

    #[test]
    fn php_ini_follows_mysql_port() {
        let fixture = Fixture::new();
        fixture.install_php("8.3.1", 8);
        fixture.install_mysql("8.0.36", 3310);
        let ctx = fixture.context();
        let php = ctx.view("php").expect("php");

        patch::apply_all(&Php.config_patches(&php, &ctx).expect("plan")).expect("apply");
        let ini = fs::read_to_string(fixture.module_dir("php", "8.3.1").join("php.ini")).expect("ini");
        assert!(ini.contains("mysql.default_port = 3310\n"));
        assert!(ini.contains("mysqli.default_port = 3310\n"));
    }

    #[test]
    fn php_without_apache_module_is_incompatible_with_enabled_apache() {
        let fixture = Fixture::new();
        fixture.install_apache("2.4.58", 80);
        fixture.install_php("8.3.1", 8);
        fixture.enable("apache");
        fs::remove_file(fixture.module_dir("php", "8.3.1").join("php8apache2_4.dll")).expect("remove");
        let ctx = fixture.context();
        let php = ctx.view("php").expect("php");
        assert!(matches!(
            Php.check_compatibility(&php, &ctx),
            Err(ModuleError::IncompatibleVersion { dependency, .. }) if dependency == "apache"
        ));
    }
}

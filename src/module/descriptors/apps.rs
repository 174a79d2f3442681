use super::{line_rule, unix_path};
use crate::{
    module::{
        descriptor::{Descriptor, DescriptorSpec, PRIMARY_PORT},
        error::ModuleResult,
        view::{EngineContext, ModuleView},
    },
    patch::{self, FilePatch, PatchRule},
    paths::Family,
};

const PHPMYADMIN_SPEC: DescriptorSpec = DescriptorSpec {
    id: "phpmyadmin",
    family: Family::Apps,
    display_name: "phpMyAdmin",
    required_files: &["phpmyadminConf"],
    ports: &[],
    service: None,
    credentials: None,
    commands: None,
};

const ADMINER_SPEC: DescriptorSpec = DescriptorSpec {
    id: "adminer",
    family: Family::Apps,
    display_name: "Adminer",
    required_files: &["adminerConf"],
    ports: &[],
    service: None,
    credentials: None,
    commands: None,
};

const PHPPGADMIN_SPEC: DescriptorSpec = DescriptorSpec {
    id: "phppgadmin",
    family: Family::Apps,
    display_name: "phpPgAdmin",
    required_files: &["phppgadminConf"],
    ports: &[],
    service: None,
    credentials: None,
    commands: None,
};

/// Database admin web app: an Apache alias plus a PHP config file that
/// mirrors the ports and root credentials of the SQL engines it fronts.
pub struct AdminApp {
    spec: &'static DescriptorSpec,
    conf_key: &'static str,
    engines: &'static [&'static str],
}

impl AdminApp {
    pub const PHPMYADMIN: AdminApp = AdminApp {
        spec: &PHPMYADMIN_SPEC,
        conf_key: "phpmyadminConf",
        engines: &["mysql", "mariadb"],
    };
    pub const ADMINER: AdminApp = AdminApp {
        spec: &ADMINER_SPEC,
        conf_key: "adminerConf",
        engines: &["mysql", "mariadb", "postgresql"],
    };
    pub const PHPPGADMIN: AdminApp = AdminApp {
        spec: &PHPPGADMIN_SPEC,
        conf_key: "phppgadminConf",
        engines: &["postgresql"],
    };

    fn engine_rules(&self, engine: &ModuleView) -> ModuleResult<Vec<PatchRule>> {
        let id = engine.id();
        let port = engine.port(PRIMARY_PORT)?;
        let mut rules = vec![line_rule(
            &format!(r"^\${id}Port\s=\s(\d+)"),
            format!("${id}Port = {port};"),
        )?];
        if let Some(credentials) = engine.credentials() {
            rules.push(line_rule(
                &format!(r"^\${id}RootUser\s=\s"),
                format!("${id}RootUser = {};", php_string(&credentials.user)),
            )?);
            rules.push(line_rule(
                &format!(r"^\${id}RootPwd\s=\s"),
                format!("${id}RootPwd = {};", php_string(&credentials.password)),
            )?);
        }
        if id == "postgresql" && self.spec.id == "phppgadmin" {
            for key in ["postgresqlDumpExe", "postgresqlDumpAllExe"] {
                let path = php_string(&unix_path(&engine.stable_file(key)?));
                rules.push(line_rule(&format!(r"^\${key}\s=\s"), format!("${key} = {path};"))?);
            }
        }
        Ok(rules)
    }
}

/// Single-quoted PHP literal, ready to drop into a line template.
fn php_string(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{}'", patch::literal(&escaped))
}

impl Descriptor for AdminApp {
    fn spec(&self) -> &'static DescriptorSpec {
        self.spec
    }

    fn config_patches(&self, view: &ModuleView, ctx: &EngineContext) -> ModuleResult<Vec<FilePatch>> {
        let id = view.id();
        let stable_root = unix_path(&view.paths.stable_root);
        let alias = FilePatch::optional(
            ctx.web.alias.join(format!("{id}.conf")),
            vec![
                line_rule(
                    &format!(r"^Alias\s\/{id}\s.*"),
                    format!("Alias /{id} \"{stable_root}/\""),
                )?,
                line_rule(r"^<Directory\s.*", format!("<Directory \"{stable_root}/\">"))?,
            ],
        );

        let mut rules = Vec::new();
        for engine_id in self.engines {
            let engine = match ctx.view(engine_id) {
                Ok(engine) if engine.enabled => engine,
                Ok(_) => continue,
                Err(error) => {
                    tracing::warn!(%error, app = id, engine = engine_id, "skipping engine settings");
                    continue;
                }
            };
            rules.extend(self.engine_rules(&engine)?);
        }

        let mut plan = vec![alias];
        if !rules.is_empty() {
            plan.push(FilePatch::required(view.install_file(self.conf_key)?, rules));
        }
        Ok(plan)
    }
}

use super::line_rule;
use crate::{
    cmdline::Sentinel,
    module::{
        descriptor::{
            CommandProbe, CredentialKeys, Descriptor, DescriptorSpec, PRIMARY_PORT, PortSpec,
            ServiceTemplate,
        },
        error::ModuleResult,
        view::{EngineContext, ModuleView},
    },
    patch::FilePatch,
    paths::Family,
    probe::ProbeProtocol,
};

const MYSQL_SPEC: DescriptorSpec = DescriptorSpec {
    id: "mysql",
    family: Family::Bins,
    display_name: "MySQL",
    required_files: &["mysqlExe", "mysqlCliExe", "mysqlConf"],
    ports: &[PortSpec {
        field: PRIMARY_PORT,
        key: "mysqlPort",
        default: 3306,
        protocol: ProbeProtocol::MySql { product: "mysql" },
    }],
    service: Some(ServiceTemplate {
        binary_key: "mysqlExe",
        capture_output: false,
    }),
    credentials: Some(CredentialKeys {
        user: "mysqlRootUser",
        password: "mysqlRootPwd",
        default_user: "root",
    }),
    commands: Some(CommandProbe {
        binary_key: "mysqlExe",
        version_args: &["--version"],
        syntax: Some((&["--help", "--verbose"], Sentinel::LastLineLacks("[ERROR]"))),
    }),
};

const MARIADB_SPEC: DescriptorSpec = DescriptorSpec {
    id: "mariadb",
    family: Family::Bins,
    display_name: "MariaDB",
    required_files: &["mariadbExe", "mariadbCliExe", "mariadbConf"],
    ports: &[PortSpec {
        field: PRIMARY_PORT,
        key: "mariadbPort",
        default: 3307,
        protocol: ProbeProtocol::MySql { product: "mariadb" },
    }],
    service: Some(ServiceTemplate {
        binary_key: "mariadbExe",
        capture_output: false,
    }),
    credentials: Some(CredentialKeys {
        user: "mariadbRootUser",
        password: "mariadbRootPwd",
        default_user: "root",
    }),
    commands: Some(CommandProbe {
        binary_key: "mariadbExe",
        version_args: &["--version"],
        syntax: Some((&["--help", "--verbose"], Sentinel::LastLineLacks("[ERROR]"))),
    }),
};

const POSTGRESQL_SPEC: DescriptorSpec = DescriptorSpec {
    id: "postgresql",
    family: Family::Bins,
    display_name: "PostgreSQL",
    required_files: &[
        "postgresqlCtlExe",
        "postgresqlCliExe",
        "postgresqlDumpExe",
        "postgresqlDumpAllExe",
        "postgresqlConf",
    ],
    ports: &[PortSpec {
        field: PRIMARY_PORT,
        key: "postgresqlPort",
        default: 5432,
        protocol: ProbeProtocol::Postgres,
    }],
    service: Some(ServiceTemplate {
        binary_key: "postgresqlCtlExe",
        capture_output: false,
    }),
    credentials: Some(CredentialKeys {
        user: "postgresqlRootUser",
        password: "postgresqlRootPwd",
        default_user: "postgres",
    }),
    commands: Some(CommandProbe {
        binary_key: "postgresqlCliExe",
        version_args: &["--version"],
        syntax: None,
    }),
};

/// One of the three SQL servers. They differ only in data and in whether the
/// service takes its own name as parameter.
pub struct SqlEngine {
    spec: &'static DescriptorSpec,
    conf_key: &'static str,
    named_service: bool,
}

impl SqlEngine {
    pub const MYSQL: SqlEngine = SqlEngine {
        spec: &MYSQL_SPEC,
        conf_key: "mysqlConf",
        named_service: true,
    };
    pub const MARIADB: SqlEngine = SqlEngine {
        spec: &MARIADB_SPEC,
        conf_key: "mariadbConf",
        named_service: true,
    };
    pub const POSTGRESQL: SqlEngine = SqlEngine {
        spec: &POSTGRESQL_SPEC,
        conf_key: "postgresqlConf",
        named_service: false,
    };
}

impl Descriptor for SqlEngine {
    fn spec(&self) -> &'static DescriptorSpec {
        self.spec
    }

    fn config_patches(&self, view: &ModuleView, _ctx: &EngineContext) -> ModuleResult<Vec<FilePatch>> {
        let port = view.port(PRIMARY_PORT)?;
        Ok(vec![FilePatch::required(
            view.install_file(self.conf_key)?,
            vec![line_rule(r"^port(.*?)=(.*?)(\d+)", format!("port = {port}"))?],
        )])
    }

    /// mysqld / mariadbd run as a service under their own service name.
    fn service_params(&self, _view: &ModuleView, _ctx: &EngineContext) -> ModuleResult<String> {
        Ok(if self.named_service {
            self.spec.service_name()
        } else {
            String::new()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{module::testing::Fixture, patch};
    use std::fs;

    #[test]
    fn port_rule_rewrites_every_section() {
        let fixture = Fixture::new();
        fixture.install_mariadb("10.6.16", 3307);
        let ctx = fixture.context();
        ctx.settings.replace("mariadbPort", "3308").expect("port");
        let view = ctx.view("mariadb").expect("view");

        patch::apply_all(&SqlEngine::MARIADB.config_patches(&view, &ctx).expect("plan")).expect("apply");
        let conf = fs::read_to_string(fixture.module_dir("mariadb", "10.6.16").join("my.ini")).expect("conf");
        assert_eq!(conf.matches("port = 3308").count(), 2);
        assert!(!conf.contains("3307"));
    }

    #[test]
    fn postgresql_port_lands_in_data_conf() {
        let fixture = Fixture::new();
        fixture.install_postgresql("16.1", 5432);
        let ctx = fixture.context();
        ctx.settings.replace("postgresqlPort", "5433").expect("port");
        let view = ctx.view("postgresql").expect("view");
        assert!(view.validate().is_ok());

        patch::apply_all(&SqlEngine::POSTGRESQL.config_patches(&view, &ctx).expect("plan")).expect("apply");
        let conf = fs::read_to_string(fixture.module_dir("postgresql", "16.1").join("data/postgresql.conf"))
            .expect("conf");
        assert_eq!(conf, "listen_addresses = '*'\nport = 5433\n");
    }

    #[test]
    fn service_params_follow_engine() {
        let fixture = Fixture::new();
        let ctx = fixture.context();
        let mysql = ctx.view("mysql").expect("view");
        let postgresql = ctx.view("postgresql").expect("view");
        assert_eq!(
            SqlEngine::MYSQL.service_params(&mysql, &ctx).expect("params"),
            "bundlectlmysql"
        );
        assert_eq!(
            SqlEngine::POSTGRESQL.service_params(&postgresql, &ctx).expect("params"),
            ""
        );
    }
}

//! Miniature install tree on disk for module tests.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use tempfile::TempDir;

use super::{descriptor::descriptor, view::EngineContext};
use crate::{
    config::{DEFAULT_PING_PATH, EngineConfig, ProbeConfig, ServiceManagerKind, WebLayout},
    paths::PathResolver,
    settings::{ENABLED, SettingsStore},
};

const DEFAULT_VERSIONS: [(&str, &str); 14] = [
    ("apache", "2.4.58"),
    ("mailpit", "1.15.0"),
    ("memcached", "1.6.21"),
    ("mariadb", "10.4"),
    ("mysql", "8.0.36"),
    ("nodejs", "20.11.0"),
    ("php", "8.3.1"),
    ("postgresql", "16.1"),
    ("svn", "1.14.2"),
    ("filezilla", "0.9.60"),
    ("xlight", "3.9.3"),
    ("phpmyadmin", "5.2.1"),
    ("adminer", "4.8.1"),
    ("phppgadmin", "7.14.7"),
];

pub const APACHE_CONF: &str = "ServerRoot \"/srv/apache\"\n\
Listen 80\n\
LoadModule rewrite_module modules/mod_rewrite.so\n\
#LoadModule ssl_module modules/mod_ssl.so\n\
PHPIniDir \"C:/old/php\"\n\
LoadFile \"C:/old/php/php8ts.dll\"\n\
LoadModule php_module \"C:/old/php/php8apache2_4.dll\"\n\
ServerName localhost:80\n\
<Directory \"/www\">\n\
# START switchOnline tag - Do not replace!\n\
Require local\n\
# END switchOnline tag - Do not replace!\n\
</Directory>\n";

pub struct Fixture {
    dir: TempDir,
    config: EngineConfig,
    settings: SettingsStore,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().to_path_buf();
        let config = EngineConfig {
            settings: root.join("settings.conf"),
            logs: root.join("logs"),
            web: WebLayout {
                www: root.join("www"),
                alias: root.join("alias"),
                vhosts: root.join("vhosts"),
                ping_path: DEFAULT_PING_PATH.to_string(),
            },
            probe: ProbeConfig {
                host: "127.0.0.1".to_string(),
                timeout: Duration::from_secs(2),
            },
            service: ServiceManagerKind::Memory,
            root,
        };
        for dir in [&config.logs, &config.web.www, &config.web.alias, &config.web.vhosts] {
            fs::create_dir_all(dir).expect("layout dir");
        }

        let mut seed = String::from("; bundlectl settings\nonline = \"0\"\n");
        for (id, version) in DEFAULT_VERSIONS {
            seed.push_str(&format!("{id}Enable = \"0\"\n{id}Version = \"{version}\"\n"));
        }
        fs::write(&config.settings, seed).expect("seed settings");
        let settings = SettingsStore::open(&config.settings).expect("open settings");

        Self {
            dir,
            config,
            settings,
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn settings(&self) -> SettingsStore {
        self.settings.clone()
    }

    pub fn context(&self) -> EngineContext {
        EngineContext::new(&self.config, self.settings.clone())
    }

    pub fn www(&self) -> PathBuf {
        self.config.web.www.clone()
    }

    pub fn alias(&self) -> PathBuf {
        self.config.web.alias.clone()
    }

    pub fn vhosts(&self) -> PathBuf {
        self.config.web.vhosts.clone()
    }

    pub fn module_root(&self, id: &str) -> PathBuf {
        let spec = descriptor(id).expect("known module").spec();
        PathResolver::new(self.root()).module_root(spec.family, id)
    }

    pub fn module_dir(&self, id: &str, version: &str) -> PathBuf {
        self.module_root(id).join(format!("{id}{version}"))
    }

    pub fn enable(&self, id: &str) {
        self.settings
            .replace(&format!("{id}Enable"), ENABLED)
            .expect("enable module");
    }

    pub fn write_vhost(&self, name: &str, contents: &str) {
        fs::write(self.vhosts().join(format!("{name}.conf")), contents).expect("vhost");
    }

    /// Write `files` and a bundle with `bundle` entries under the install
    /// root of `id` at `version`, then select that version.
    pub fn install(&self, id: &str, version: &str, bundle: &[(&str, String)], files: &[(&str, String)]) {
        let dir = self.module_dir(id, version);
        fs::create_dir_all(&dir).expect("install root");
        let mut contents = format!("{id}Version = \"{version}\"\n");
        for (key, value) in bundle {
            contents.push_str(&format!("{key} = \"{value}\"\n"));
        }
        fs::write(dir.join("bundle.conf"), contents).expect("bundle");
        for (relative, body) in files {
            let path = dir.join(relative);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).expect("file parent");
            }
            fs::write(path, body).expect("install file");
        }
        self.settings
            .replace(&format!("{id}Version"), version)
            .expect("select version");
    }

    pub fn install_apache(&self, version: &str, port: u16) {
        self.install(
            "apache",
            version,
            &[
                ("apacheExe", "bin/httpd.exe".to_string()),
                ("apacheConf", "conf/httpd.conf".to_string()),
                ("apachePort", port.to_string()),
                ("apacheSslPort", "443".to_string()),
            ],
            &[
                ("bin/httpd.exe", String::new()),
                ("conf/httpd.conf", APACHE_CONF.to_string()),
            ],
        );
    }

    pub fn install_php(&self, version: &str, major: u8) {
        let module = format!("php{major}apache2_4.dll");
        let ts_library = format!("php{major}ts.dll");
        self.install(
            "php",
            version,
            &[
                ("phpCliExe", "php.exe".to_string()),
                ("phpConf", "php.ini".to_string()),
                ("apache2.4", module.clone()),
            ],
            &[
                ("php.exe", String::new()),
                (
                    "php.ini",
                    "[PHP]\nextension=curl\n;extension=mbstring\nzend_extension=opcache\n\
                     [MySQL]\nmysql.default_port = 3306\n[MySQLi]\nmysqli.default_port = 3306\n"
                        .to_string(),
                ),
                (ts_library.as_str(), String::new()),
                (module.as_str(), String::new()),
            ],
        );
    }

    fn install_my_sql(&self, id: &str, version: &str, port: u16) {
        let keys = ["Exe", "CliExe", "Conf", "Port"].map(|suffix| format!("{id}{suffix}"));
        self.install(
            id,
            version,
            &[
                (keys[0].as_str(), "bin/mysqld.exe".to_string()),
                (keys[1].as_str(), "bin/mysql.exe".to_string()),
                (keys[2].as_str(), "my.ini".to_string()),
                (keys[3].as_str(), port.to_string()),
            ],
            &[
                ("bin/mysqld.exe", String::new()),
                ("bin/mysql.exe", String::new()),
                ("my.ini", format!("[client]\nport={port}\n\n[mysqld]\nport = {port}\n")),
            ],
        );
    }

    pub fn install_mysql(&self, version: &str, port: u16) {
        self.install_my_sql("mysql", version, port);
    }

    pub fn install_mariadb(&self, version: &str, port: u16) {
        self.install_my_sql("mariadb", version, port);
    }

    pub fn install_postgresql(&self, version: &str, port: u16) {
        self.install(
            "postgresql",
            version,
            &[
                ("postgresqlCtlExe", "bin/pg_ctl.exe".to_string()),
                ("postgresqlCliExe", "bin/psql.exe".to_string()),
                ("postgresqlDumpExe", "bin/pg_dump.exe".to_string()),
                ("postgresqlDumpAllExe", "bin/pg_dumpall.exe".to_string()),
                ("postgresqlConf", "data/postgresql.conf".to_string()),
                ("postgresqlPort", port.to_string()),
            ],
            &[
                ("bin/pg_ctl.exe", String::new()),
                ("bin/psql.exe", String::new()),
                ("bin/pg_dump.exe", String::new()),
                ("bin/pg_dumpall.exe", String::new()),
                ("data/postgresql.conf", format!("listen_addresses = '*'\nport = {port}\n")),
            ],
        );
    }

    pub fn install_memcached(&self, version: &str) {
        self.install(
            "memcached",
            version,
            &[("memcachedExe", "memcached.exe".to_string())],
            &[("memcached.exe", String::new())],
        );
    }

    pub fn install_filezilla(&self, version: &str) {
        self.install(
            "filezilla",
            version,
            &[
                ("filezillaExe", "FileZilla Server.exe".to_string()),
                ("filezillaConf", "FileZilla Server.xml".to_string()),
            ],
            &[
                ("FileZilla Server.exe", String::new()),
                (
                    "FileZilla Server.xml",
                    "<FileZillaServer>\n  <Settings>\n    <Item name=\"Serverports\" type=\"string\">21</Item>\n    <Item name=\"IP Filter Allowed\" type=\"string\">127.0.0.1 ::1</Item>\n    <Item name=\"IP Filter Disallowed\" type=\"string\">*</Item>\n  </Settings>\n</FileZillaServer>\n"
                        .to_string(),
                ),
            ],
        );
    }

    pub fn install_phpmyadmin(&self, version: &str) {
        self.install(
            "phpmyadmin",
            version,
            &[("phpmyadminConf", "config.inc.php".to_string())],
            &[(
                "config.inc.php",
                "<?php\n$mysqlPort = 3306;\n$mysqlRootUser = '';\n$mysqlRootPwd = '';\n\
                 $mariadbPort = 3307;\n$mariadbRootUser = '';\n$mariadbRootPwd = '';\n"
                    .to_string(),
            )],
        );
        fs::write(
            self.alias().join("phpmyadmin.conf"),
            "Alias /phpmyadmin \"C:/old/phpmyadmin/\"\n\n<Directory \"C:/old/phpmyadmin/\">\n    AllowOverride all\n# START switchOnline tag - Do not replace!\nRequire local\n# END switchOnline tag - Do not replace!\n</Directory>\n",
        )
        .expect("alias");
    }
}

use std::path::Path;

use super::{line_rule, unix_path};
use crate::{
    cmdline::Sentinel,
    module::{
        descriptor::{CommandProbe, Descriptor, DescriptorSpec, PRIMARY_PORT, PortSpec, ServiceTemplate},
        error::{ModuleError, ModuleResult},
        inventory,
        view::{EngineContext, ModuleView},
    },
    patch::{BlockRule, FilePatch, PatchRule},
    paths::Family,
    probe::ProbeProtocol,
};

pub const ONLINE_START_TAG: &str = "# START switchOnline tag - Do not replace!";
pub const ONLINE_END_TAG: &str = "# END switchOnline tag - Do not replace!";

const SSL_CONF: &str = "conf/extra/httpd-ssl.conf";
const HTACCESS: &str = ".htaccess";
const SSL_PORT: &str = "ssl";
/// Thread-safe PHP runtime libraries, newest first.
const TS_LIBRARIES: [&str; 2] = ["php8ts.dll", "php7ts.dll"];
const CAPTURE: &str = "{{1}}";

const SPEC: DescriptorSpec = DescriptorSpec {
    id: "apache",
    family: Family::Bins,
    display_name: "Apache",
    required_files: &["apacheExe", "apacheConf"],
    ports: &[
        PortSpec {
            field: PRIMARY_PORT,
            key: "apachePort",
            default: 80,
            protocol: ProbeProtocol::Http {
                server_token: "Apache",
            },
        },
        PortSpec {
            field: SSL_PORT,
            key: "apacheSslPort",
            default: 443,
            protocol: ProbeProtocol::Connect,
        },
    ],
    service: Some(ServiceTemplate {
        binary_key: "apacheExe",
        capture_output: false,
    }),
    credentials: None,
    commands: Some(CommandProbe {
        binary_key: "apacheExe",
        version_args: &["-v"],
        syntax: Some((&["-t"], Sentinel::LastLineEquals("Syntax OK"))),
    }),
};

pub struct Apache;

impl Descriptor for Apache {
    fn spec(&self) -> &'static DescriptorSpec {
        &SPEC
    }

    fn config_patches(&self, view: &ModuleView, ctx: &EngineContext) -> ModuleResult<Vec<FilePatch>> {
        let port = view.port(PRIMARY_PORT)?;
        let ssl_port = view.port(SSL_PORT)?;

        let mut main_rules = php_directives(view, ctx)?;
        main_rules.extend([
            line_rule(r"^Listen\s+(\d+)$", format!("Listen {port}"))?,
            line_rule(
                r"^ServerName\s+([a-zA-Z0-9.]+):(\d+)$",
                format!("ServerName {CAPTURE}:{port}"),
            )?,
            line_rule(
                r"^NameVirtualHost\s+([a-zA-Z0-9.*]+):(\d+)$",
                format!("NameVirtualHost {CAPTURE}:{port}"),
            )?,
        ]);
        main_rules.extend(virtual_host_rules(port, ssl_port)?);

        let mut plan = vec![FilePatch::required(view.install_file("apacheConf")?, main_rules)];
        plan.push(FilePatch::optional(
            view.paths.install_file(SSL_CONF),
            vec![
                line_rule(r"^Listen\s+(\d+)$", format!("Listen {ssl_port}"))?,
                line_rule(
                    r"^<VirtualHost\s+([a-zA-Z0-9._*]+):(\d+)>$",
                    format!("<VirtualHost {CAPTURE}:{ssl_port}>"),
                )?,
            ],
        ));
        for vhost in inventory::conf_files(&ctx.web.vhosts)? {
            plan.push(FilePatch::required(vhost, virtual_host_rules(port, ssl_port)?));
        }

        let host = if port == 80 {
            "http://localhost".to_string()
        } else {
            format!("http://localhost:{port}")
        };
        plan.push(FilePatch::optional(
            ctx.web.www.join(HTACCESS),
            vec![line_rule(
                r"(.*)http:\/\/localhost(.*)",
                format!("{CAPTURE}{host}/$1 [QSA,R=301,L]"),
            )?],
        ));
        Ok(plan)
    }

    fn check_compatibility(&self, candidate: &ModuleView, ctx: &EngineContext) -> ModuleResult<()> {
        let php = match ctx.view("php") {
            Ok(php) => php,
            Err(error) => {
                tracing::debug!(%error, "no php runtime to check against");
                return Ok(());
            }
        };
        if !php.enabled {
            return Ok(());
        }
        php_binding(&php, &candidate.version)
            .map(|_| ())
            .map_err(|reason| incompatible(candidate, &php, reason))
    }

    fn service_params(&self, _view: &ModuleView, _ctx: &EngineContext) -> ModuleResult<String> {
        Ok("-k runservice".to_string())
    }

    fn online_patches(
        &self,
        view: &ModuleView,
        ctx: &EngineContext,
        online: bool,
    ) -> ModuleResult<Vec<FilePatch>> {
        let block = PatchRule::from(online_block(&view.version, online));
        let mut plan = vec![
            FilePatch::required(view.install_file("apacheConf")?, vec![block.clone()]),
            FilePatch::optional(view.paths.install_file(SSL_CONF), vec![block.clone()]),
        ];
        for file in inventory::conf_files(&ctx.web.alias)?
            .into_iter()
            .chain(inventory::conf_files(&ctx.web.vhosts)?)
        {
            plan.push(FilePatch::required(file, vec![block.clone()]));
        }
        Ok(plan)
    }
}

fn virtual_host_rules(port: u16, ssl_port: u16) -> ModuleResult<Vec<PatchRule>> {
    Ok(vec![
        line_rule(
            r"^<VirtualHost\s+([a-zA-Z0-9.*]+):(\d+)>$",
            format!("<VirtualHost {CAPTURE}:{port}>"),
        )?,
        line_rule(
            r"^<VirtualHost\s+([a-zA-Z0-9.*]+):(\d+)> #SSL$",
            format!("<VirtualHost {CAPTURE}:{ssl_port}> #SSL"),
        )?,
    ])
}

/// `PHPIniDir` / `LoadFile` / `LoadModule php…` pointing at the active PHP
/// runtime, or commented out when it cannot be loaded.
fn php_directives(apache: &ModuleView, ctx: &EngineContext) -> ModuleResult<Vec<PatchRule>> {
    let php = match ctx.view("php") {
        Ok(php) => php,
        Err(error) => {
            tracing::warn!(%error, "php runtime unavailable, leaving php directives untouched");
            return Ok(Vec::new());
        }
    };

    let binding = if php.enabled && php.validate().is_ok() {
        match php_binding(&php, &apache.version) {
            Ok(binding) => Some(binding),
            Err(reason) => {
                tracing::warn!(php = %php.version, apache = %apache.version, %reason, "disabling php in apache");
                None
            }
        }
    } else {
        None
    };

    let Some(binding) = binding else {
        return Ok(vec![
            line_rule(r"^#?(PHPIniDir\s.*)", "#{{1}}")?,
            line_rule(r"^#?(LoadFile\s.*php.ts\.dll.*)", "#{{1}}")?,
            line_rule(r"^#?(LoadModule\s+php\S*_module\s.*)", "#{{1}}")?,
        ]);
    };

    let root = unix_path(&php.paths.stable_root);
    Ok(vec![
        line_rule(r"^#?PHPIniDir\s.*", format!("PHPIniDir \"{root}\""))?,
        line_rule(
            r"^#?LoadFile\s.*php.ts\.dll.*",
            format!("LoadFile \"{root}/{}\"", binding.ts_library),
        )?,
        line_rule(
            r"^#?LoadModule\s+php\S*_module\s.*",
            format!(
                "LoadModule {} \"{root}/{}\"",
                binding.module_name, binding.module_file
            ),
        )?,
    ])
}

/// How a PHP runtime plugs into one Apache version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhpBinding {
    pub ts_library: &'static str,
    pub module_file: String,
    pub module_name: &'static str,
}

/// Resolve the in-process module `php` ships for `apache_version`. Bundle
/// keys look like `apache2.4 = "php8apache2_4.dll"`; they are matched on the
/// first two digits of the Apache version.
pub fn php_binding(php: &ModuleView, apache_version: &str) -> Result<PhpBinding, String> {
    let install_root = &php.paths.install_root;
    let ts_library = TS_LIBRARIES
        .into_iter()
        .find(|library| install_root.join(library).is_file())
        .ok_or_else(|| {
            format!(
                "no thread-safe runtime library ({}) in '{}'",
                TS_LIBRARIES.join(", "),
                install_root.display()
            )
        })?;

    let wanted = apache_version
        .chars()
        .filter(char::is_ascii_digit)
        .take(2)
        .collect::<String>();
    let bundle = php
        .bundle
        .as_ref()
        .ok_or_else(|| format!("settings bundle '{}' not found", php.paths.bundle.display()))?;
    let module_file = bundle
        .entries()
        .find_map(|(key, value)| {
            let tag = key.strip_prefix("apache")?.replace('.', "");
            (tag == wanted).then(|| value.to_string())
        })
        .ok_or_else(|| format!("no module for Apache {apache_version} declared"))?;
    if !install_root.join(&module_file).is_file() {
        return Err(format!(
            "module file '{}' not found",
            install_root.join(&module_file).display()
        ));
    }

    let module_name = if ts_library.starts_with("php8") {
        "php_module"
    } else {
        "php7_module"
    };
    Ok(PhpBinding {
        ts_library,
        module_file,
        module_name,
    })
}

pub(crate) fn incompatible(module: &ModuleView, dependency: &ModuleView, reason: String) -> ModuleError {
    ModuleError::IncompatibleVersion {
        module: module.id().to_string(),
        version: module.version.clone(),
        dependency: dependency.id().to_string(),
        dependency_version: dependency.version.clone(),
        reason,
    }
}

/// The public or local-only access block for an Apache version.
pub fn online_block(apache_version: &str, online: bool) -> BlockRule {
    let body = match (apache_version.starts_with("2.4"), online) {
        (true, true) => "Require all granted",
        (true, false) => "Require local",
        (false, true) => "Order Allow,Deny\nAllow from all",
        (false, false) => "Order Deny,Allow\nDeny from all\nAllow from 127.0.0.1 ::1",
    };
    BlockRule::new(ONLINE_START_TAG, ONLINE_END_TAG, body)
}

pub fn alias_content(apache_version: &str, online: bool, name: &str, destination: &Path) -> String {
    let destination = unix_path(destination);
    let block = online_block(apache_version, online);
    format!(
        "Alias /{name} \"{destination}/\"\n\n<Directory \"{destination}/\">\n    Options Indexes FollowSymLinks MultiViews\n    AllowOverride all\n{}\n</Directory>\n",
        block.rendered()
    )
}

pub fn vhost_content(
    apache: &ModuleView,
    ctx: &EngineContext,
    server_name: &str,
    document_root: &Path,
) -> ModuleResult<String> {
    let port = apache.port(PRIMARY_PORT)?;
    let ssl_port = apache.port(SSL_PORT)?;
    let block = online_block(&apache.version, ctx.online());
    let root = unix_path(document_root);
    let logs = unix_path(&ctx.logs);
    let ssl = unix_path(&ctx.paths.root().join("ssl"));
    let required = block.rendered();

    Ok(format!(
        "<VirtualHost *:{port}>\n\
         \x20   ServerAdmin webmaster@{server_name}\n\
         \x20   DocumentRoot \"{root}\"\n\
         \x20   ServerName {server_name}\n\
         \x20   ErrorLog \"{logs}/{server_name}_error.log\"\n\
         \x20   CustomLog \"{logs}/{server_name}_access.log\" combined\n\
         \n\
         \x20   <Directory \"{root}\">\n\
         \x20       Options Indexes FollowSymLinks MultiViews\n\
         \x20       AllowOverride all\n\
         {required}\n\
         \x20   </Directory>\n\
         </VirtualHost>\n\
         \n\
         <IfModule ssl_module>\n\
         <VirtualHost *:{ssl_port}> #SSL\n\
         \x20   DocumentRoot \"{root}\"\n\
         \x20   ServerName {server_name}\n\
         \x20   ServerAdmin webmaster@{server_name}\n\
         \x20   ErrorLog \"{logs}/{server_name}_error.log\"\n\
         \x20   TransferLog \"{logs}/{server_name}_access.log\"\n\
         \n\
         \x20   SSLEngine on\n\
         \x20   SSLProtocol all -SSLv2\n\
         \x20   SSLCipherSuite HIGH:MEDIUM:!aNULL:!MD5\n\
         \x20   SSLCertificateFile \"{ssl}/{server_name}.crt\"\n\
         \x20   SSLCertificateKeyFile \"{ssl}/{server_name}.pub\"\n\
         \n\
         \x20   <Directory \"{root}\">\n\
         \x20       SSLOptions +StdEnvVars\n\
         \x20       Options Indexes FollowSymLinks MultiViews\n\
         \x20       AllowOverride all\n\
         {required}\n\
         \x20   </Directory>\n\
         </VirtualHost>\n\
         </IfModule>\n"
    ))
}

use super::{line_rule, unix_path};
use crate::{
    module::{
        descriptor::{CommandProbe, Descriptor, DescriptorSpec, PRIMARY_PORT, PortSpec, ServiceTemplate},
        error::ModuleResult,
        view::{EngineContext, ModuleView},
    },
    patch::FilePatch,
    paths::Family,
    probe::{BannerMatch, ProbeProtocol},
};

const CAPTURE: &str = "{{1}}";

const MAILPIT_SPEC: DescriptorSpec = DescriptorSpec {
    id: "mailpit",
    family: Family::Bins,
    display_name: "Mailpit",
    required_files: &["mailpitExe"],
    ports: &[
        PortSpec {
            field: PRIMARY_PORT,
            key: "mailpitSmtpPort",
            default: 1025,
            protocol: ProbeProtocol::Banner(BannerMatch::Contains("Mailpit")),
        },
        PortSpec {
            field: "ui",
            key: "mailpitUiPort",
            default: 8025,
            protocol: ProbeProtocol::Connect,
        },
    ],
    service: Some(ServiceTemplate {
        binary_key: "mailpitExe",
        capture_output: true,
    }),
    credentials: None,
    commands: Some(CommandProbe {
        binary_key: "mailpitExe",
        version_args: &["version"],
        syntax: None,
    }),
};

const MEMCACHED_SPEC: DescriptorSpec = DescriptorSpec {
    id: "memcached",
    family: Family::Bins,
    display_name: "Memcached",
    required_files: &["memcachedExe"],
    ports: &[PortSpec {
        field: PRIMARY_PORT,
        key: "memcachedPort",
        default: 11211,
        protocol: ProbeProtocol::Memcached,
    }],
    service: Some(ServiceTemplate {
        binary_key: "memcachedExe",
        capture_output: true,
    }),
    credentials: None,
    commands: None,
};

const SVN_SPEC: DescriptorSpec = DescriptorSpec {
    id: "svn",
    family: Family::Bins,
    display_name: "Subversion",
    required_files: &["svnExe", "svnServe"],
    ports: &[PortSpec {
        field: PRIMARY_PORT,
        key: "svnPort",
        default: 3690,
        protocol: ProbeProtocol::Banner(BannerMatch::StartsWith("( success (")),
    }],
    service: Some(ServiceTemplate {
        binary_key: "svnServe",
        capture_output: false,
    }),
    credentials: None,
    commands: Some(CommandProbe {
        binary_key: "svnExe",
        version_args: &["--version"],
        syntax: None,
    }),
};

const FILEZILLA_SPEC: DescriptorSpec = DescriptorSpec {
    id: "filezilla",
    family: Family::Bins,
    display_name: "FileZilla Server",
    required_files: &["filezillaExe", "filezillaConf"],
    ports: &[
        PortSpec {
            field: PRIMARY_PORT,
            key: "filezillaPort",
            default: 21,
            protocol: ProbeProtocol::Banner(BannerMatch::Equals("220 FileZilla Server")),
        },
        PortSpec {
            field: "ssl",
            key: "filezillaSslPort",
            default: 990,
            protocol: ProbeProtocol::Connect,
        },
    ],
    service: Some(ServiceTemplate {
        binary_key: "filezillaExe",
        capture_output: false,
    }),
    credentials: None,
    commands: None,
};

const XLIGHT_SPEC: DescriptorSpec = DescriptorSpec {
    id: "xlight",
    family: Family::Bins,
    display_name: "Xlight FTP Server",
    required_files: &["xlightExe"],
    ports: &[
        PortSpec {
            field: PRIMARY_PORT,
            key: "xlightPort",
            default: 21,
            protocol: ProbeProtocol::Banner(BannerMatch::Contains("Xlight")),
        },
        PortSpec {
            field: "ssl",
            key: "xlightSslPort",
            default: 990,
            protocol: ProbeProtocol::Connect,
        },
    ],
    service: Some(ServiceTemplate {
        binary_key: "xlightExe",
        capture_output: false,
    }),
    credentials: None,
    commands: None,
};

pub struct Mailpit;

impl Descriptor for Mailpit {
    fn spec(&self) -> &'static DescriptorSpec {
        &MAILPIT_SPEC
    }

    fn service_params(&self, view: &ModuleView, _ctx: &EngineContext) -> ModuleResult<String> {
        let listen = view
            .setting("mailpitListen")
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let web_root = view
            .setting("mailpitWebRoot")
            .unwrap_or_else(|| "/".to_string());
        Ok(format!(
            " --listen \"{listen}:{ui}\" --smtp \"{listen}:{smtp}\" --webroot \"{web_root}\"",
            ui = view.port("ui")?,
            smtp = view.port(PRIMARY_PORT)?,
        ))
    }
}

pub struct Memcached;

const DEFAULT_MEMCACHED_MEMORY: u32 = 512;

impl Descriptor for Memcached {
    fn spec(&self) -> &'static DescriptorSpec {
        &MEMCACHED_SPEC
    }

    fn service_params(&self, view: &ModuleView, _ctx: &EngineContext) -> ModuleResult<String> {
        let memory = match view.setting("memcachedMemory") {
            Some(raw) => crate::settings::parse_number("memcachedMemory", &raw)?,
            None => DEFAULT_MEMCACHED_MEMORY,
        };
        Ok(format!(
            "-m {memory} -p {port} -U 0 -vv",
            port = view.port(PRIMARY_PORT)?
        ))
    }
}

pub struct Svn;

impl Descriptor for Svn {
    fn spec(&self) -> &'static DescriptorSpec {
        &SVN_SPEC
    }

    fn service_params(&self, view: &ModuleView, ctx: &EngineContext) -> ModuleResult<String> {
        Ok(format!(
            "--service --root \"{root}\" --listen-port \"{port}\" --log-file \"{log}\"",
            root = unix_path(&view.paths.stable_root.join("repos")),
            port = view.port(PRIMARY_PORT)?,
            log = unix_path(&ctx.logs.join("svn.log")),
        ))
    }
}

pub struct FileZilla;

impl FileZilla {
    fn item_rule(name: &str, value: &str) -> ModuleResult<crate::patch::PatchRule> {
        line_rule(
            &format!(r#"^(\s*)<Item name="{}" type="string">.*</Item>"#, regex::escape(name)),
            format!(r#"{CAPTURE}<Item name="{name}" type="string">{value}</Item>"#),
        )
    }
}

impl Descriptor for FileZilla {
    fn spec(&self) -> &'static DescriptorSpec {
        &FILEZILLA_SPEC
    }

    fn config_patches(&self, view: &ModuleView, _ctx: &EngineContext) -> ModuleResult<Vec<FilePatch>> {
        let port = view.port(PRIMARY_PORT)?;
        Ok(vec![FilePatch::required(
            view.install_file("filezillaConf")?,
            vec![Self::item_rule("Serverports", &port.to_string())?],
        )])
    }

    /// The IP filter follows the online flag.
    fn online_patches(
        &self,
        view: &ModuleView,
        _ctx: &EngineContext,
        online: bool,
    ) -> ModuleResult<Vec<FilePatch>> {
        let (allowed, disallowed) = if online { ("*", "") } else { ("127.0.0.1 ::1", "*") };
        Ok(vec![FilePatch::required(
            view.install_file("filezillaConf")?,
            vec![
                Self::item_rule("IP Filter Allowed", allowed)?,
                Self::item_rule("IP Filter Disallowed", disallowed)?,
            ],
        )])
    }
}

pub struct Xlight;

impl Descriptor for Xlight {
    fn spec(&self) -> &'static DescriptorSpec {
        &XLIGHT_SPEC
    }

    fn service_params(&self, _view: &ModuleView, _ctx: &EngineContext) -> ModuleResult<String> {
        Ok(" -startall".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{module::testing::Fixture, patch};
    use std::fs;

    #[test]
    fn memcached_params_carry_memory_and_port() {
        let fixture = Fixture::new();
        let ctx = fixture.context();
        ctx.settings
            .replace_all(&[("memcachedMemory", "256"), ("memcachedPort", "11311")])
            .expect("settings");
        let view = ctx.view("memcached").expect("view");
        assert_eq!(
            Memcached.service_params(&view, &ctx).expect("params"),
            "-m 256 -p 11311 -U 0 -vv"
        );
    }

    #[test]
    fn mailpit_params_use_both_ports() {
        let fixture = Fixture::new();
        let ctx = fixture.context();
        let view = ctx.view("mailpit").expect("view");
        assert_eq!(
            Mailpit.service_params(&view, &ctx).expect("params"),
            " --listen \"127.0.0.1:8025\" --smtp \"127.0.0.1:1025\" --webroot \"/\""
        );
    }

    #[test]
    fn filezilla_ip_filter_follows_online_flag() {
        let fixture = Fixture::new();
        fixture.install_filezilla("0.9.60");
        let ctx = fixture.context();
        let view = ctx.view("filezilla").expect("view");
        let conf_path = fixture.module_dir("filezilla", "0.9.60").join("FileZilla Server.xml");

        patch::apply_all(&FileZilla.online_patches(&view, &ctx, true).expect("plan")).expect("apply");
        let online = fs::read_to_string(&conf_path).expect("conf");
        assert!(online.contains(r#"    <Item name="IP Filter Allowed" type="string">*</Item>"#));
        assert!(online.contains(r#"    <Item name="IP Filter Disallowed" type="string"></Item>"#));

        patch::apply_all(&FileZilla.online_patches(&view, &ctx, false).expect("plan")).expect("apply");
        let offline = fs::read_to_string(&conf_path).expect("conf");
        assert!(offline.contains(r#"<Item name="IP Filter Allowed" type="string">127.0.0.1 ::1</Item>"#));
        assert!(offline.contains(r#"<Item name="IP Filter Disallowed" type="string">*</Item>"#));
    }
}

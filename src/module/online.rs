use std::path::PathBuf;

use super::{
    descriptor::{Descriptor, descriptors},
    error::ModuleResult,
    view::EngineContext,
};
use crate::{
    patch::{self, PatchOutcome},
    settings::{self, KEY_ONLINE},
};

/// Files touched by one online/offline switch.
#[derive(Debug, Clone, Default)]
pub struct OnlineReport {
    pub changed: Vec<PathBuf>,
    pub missing: Vec<PathBuf>,
    /// Modules whose files could not be rewritten, with the reason.
    pub skipped: Vec<(&'static str, String)>,
}

/// Rewrite the access rules of every installed module for `online`, then
/// persist the flag. Enablement does not matter: a disabled Apache still
/// carries the right block when it comes back. A module that cannot be
/// read or patched is logged and skipped; the flag is persisted regardless.
pub fn switch_online(ctx: &EngineContext, online: bool) -> ModuleResult<OnlineReport> {
    let mut report = OnlineReport::default();
    for descriptor in descriptors() {
        let id = descriptor.spec().id;
        if let Err(error) = patch_module(descriptor.as_ref(), ctx, online, &mut report) {
            tracing::warn!(module = id, %error, "access rules not switched");
            report.skipped.push((id, error.to_string()));
        }
    }
    ctx.settings.replace(KEY_ONLINE, settings::flag(online))?;
    tracing::info!(
        online,
        changed = report.changed.len(),
        skipped = report.skipped.len(),
        "access mode switched"
    );
    Ok(report)
}

fn patch_module(
    descriptor: &dyn Descriptor,
    ctx: &EngineContext,
    online: bool,
    report: &mut OnlineReport,
) -> ModuleResult<()> {
    let view = ctx.view(descriptor.spec().id)?;
    if !view.paths.install_root.is_dir() {
        return Ok(());
    }
    let plan = descriptor.online_patches(&view, ctx, online)?;
    for (path, outcome) in patch::apply_all(&plan)? {
        match outcome {
            PatchOutcome::Changed => report.changed.push(path),
            PatchOutcome::Missing => report.missing.push(path),
            PatchOutcome::Unchanged => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::testing::Fixture;
    use std::fs;

    #[test]
    fn toggle_round_trips_every_file() {
        let fixture = Fixture::new();
        fixture.install_apache("2.4.58", 80);
        fixture.install_phpmyadmin("5.2.1");
        fixture.install_filezilla("0.9.60");
        fixture.write_vhost(
            "site.test",
            "<VirtualHost *:80>\n<Directory \"/srv/site\">\n# START switchOnline tag - Do not replace!\nRequire local\n# END switchOnline tag - Do not replace!\n</Directory>\n</VirtualHost>\n",
        );
        let ctx = fixture.context();
        let files = [
            fixture.module_dir("apache", "2.4.58").join("conf/httpd.conf"),
            fixture.alias().join("phpmyadmin.conf"),
            fixture.vhosts().join("site.test.conf"),
            fixture.module_dir("filezilla", "0.9.60").join("FileZilla Server.xml"),
        ];
        let before = files
            .iter()
            .map(|file| fs::read_to_string(file).expect("read"))
            .collect::<Vec<_>>();

        let report = switch_online(&ctx, true).expect("online");
        assert_eq!(report.changed.len(), files.len());
        assert!(ctx.online());
        for file in &files[..3] {
            let contents = fs::read_to_string(file).expect("read");
            assert!(contents.contains("Require all granted"), "{}", file.display());
        }

        let again = switch_online(&ctx, true).expect("online twice");
        assert!(again.changed.is_empty());

        switch_online(&ctx, false).expect("offline");
        switch_online(&ctx, false).expect("offline twice");
        assert!(!ctx.online());
        let after = files
            .iter()
            .map(|file| fs::read_to_string(file).expect("read"))
            .collect::<Vec<_>>();
        assert_eq!(after, before);
    }

    #[test]
    fn unreadable_module_is_skipped_and_flag_still_persisted() {
        let fixture = Fixture::new();
        fixture.install_apache("2.4.58", 80);
        let settings_path = &fixture.config().settings;
        let without_xlight = fs::read_to_string(settings_path)
            .expect("settings")
            .lines()
            .filter(|line| !line.starts_with("xlightVersion"))
            .map(|line| format!("{line}\n"))
            .collect::<String>();
        fs::write(settings_path, without_xlight).expect("rewrite settings");
        let ctx = fixture.context();
        ctx.settings.reload().expect("reload");

        let report = switch_online(&ctx, true).expect("online");

        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0, "xlight");
        assert!(report.skipped[0].1.contains("xlightVersion"));
        let httpd = fs::read_to_string(fixture.module_dir("apache", "2.4.58").join("conf/httpd.conf")).expect("httpd");
        assert!(httpd.contains("Require all granted"));
        assert!(ctx.online());
        assert_eq!(fixture.settings().get(KEY_ONLINE).as_deref(), Some("1"));
    }
}

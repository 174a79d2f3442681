use super::*;
use std::io::{self, Write};

use anyhow::bail;
use serde::Serialize;
use unicode_width::UnicodeWidthStr;

use crate::module::{
    CascadeReport, CredentialChange, ModuleState, PortChange, ServiceOutcome,
    cascade::StepOutcome,
    inventory::{self, Toggle},
};
use crate::registry::{ModuleStatus, PortReport};
use crate::service::ServiceSpec;

pub fn completions(args: CompletionsArgs) -> Result<()> {
    use clap::CommandFactory;
    let mut cmd = crate::cli::Cli::command();
    let shell: Shell = args.shell.into();
    clap_complete::generate(shell, &mut cmd, "bundlectl", &mut std::io::stdout());
    Ok(())
}

pub async fn status(registry: &Registry, args: StatusArgs) -> Result<()> {
    let statuses = registry.status(&args.ids).await?;
    if args.json {
        return print_json(&statuses);
    }
    write_status_table(io::stdout().lock(), &statuses)?;
    Ok(())
}

pub async fn versions(registry: &Registry, args: ModuleArgs) -> Result<()> {
    let versions = registry.versions(&args.id).await?;
    let active = registry.view(&args.id)?.version;
    if versions.is_empty() {
        println!("no versions of {} installed", args.id);
        return Ok(());
    }
    for version in versions {
        let marker = if version == active { "*" } else { " " };
        println!("{marker} {version}");
    }
    Ok(())
}

pub async fn set_enable(registry: &Registry, args: ModuleArgs, enabled: bool) -> Result<()> {
    let report = registry.set_enable(&args.id, enabled).await?;
    let verb = if enabled { "enabled" } else { "disabled" };
    println!("{} {verb}", args.id);
    write_cascade(io::stdout().lock(), &report)?;
    Ok(())
}

pub async fn switch(registry: &Registry, args: SwitchArgs) -> Result<()> {
    let report = registry.switch_version(&args.id, &args.version).await?;
    println!("{} switched to {}", args.id, args.version);
    write_cascade(io::stdout().lock(), &report)?;
    Ok(())
}

pub async fn port(registry: &Registry, args: PortArgs) -> Result<()> {
    match registry
        .change_port(&args.id, &args.field, &args.port, !args.no_check)
        .await?
    {
        PortChange::Applied { port } => {
            println!("{} {} port set to {port}", args.id, args.field);
            Ok(())
        }
        PortChange::Occupied {
            port,
            classification,
        } => bail!("port {port} is {classification}; use --no-check to apply anyway"),
    }
}

pub async fn credentials(registry: &Registry, args: CredentialsArgs) -> Result<()> {
    match registry
        .change_credentials(&args.id, &args.user, &args.password, !args.settings_only)
        .await?
    {
        CredentialChange::Applied(report) => {
            println!("{} credentials updated", args.id);
            write_cascade(io::stdout().lock(), &report)?;
            Ok(())
        }
        CredentialChange::Rejected { reason } => {
            bail!("{} refused the password change: {reason}", args.id)
        }
    }
}

pub async fn probe(registry: &Registry, args: ProbeArgs) -> Result<()> {
    let reports = registry.probe_all(&args.ids).await?;
    if args.json {
        return print_json(&reports);
    }
    write_probe_table(io::stdout().lock(), &reports)?;
    Ok(())
}

pub async fn check(registry: &Registry, args: ModuleArgs) -> Result<()> {
    let checks = registry.run_checks(&args.id).await?;
    let mut stdout = io::stdout().lock();
    for report in std::iter::once(&checks.version).chain(checks.syntax.as_ref()) {
        let verdict = if report.passed { "ok" } else { "FAILED" };
        writeln!(stdout, "{}: {verdict}", report.command)?;
        for line in &report.lines {
            writeln!(stdout, "  {line}")?;
        }
    }
    if checks.syntax.as_ref().is_some_and(|syntax| !syntax.passed) || !checks.version.passed {
        bail!("{} checks failed", args.id);
    }
    Ok(())
}

pub async fn online(registry: &Registry, online: bool) -> Result<()> {
    let report = registry.switch_online(online).await?;
    let mode = if online { "online" } else { "offline" };
    println!("{mode}: {} files changed", report.changed.len());
    for path in &report.missing {
        println!("  missing: {}", path.display());
    }
    for (id, reason) in &report.skipped {
        eprintln!("warning: {id} skipped: {reason}");
    }
    Ok(())
}

pub fn list(registry: &Registry, args: ListArgs) -> Result<()> {
    let web = &registry.context().web;
    let toggles = match args.kind {
        ListKind::Vhosts => inventory::vhost_urls(&web.vhosts)?,
        ListKind::Aliases => names(inventory::conf_names(&web.alias)?),
        ListKind::Www => names(inventory::www_dirs(&web.www)?),
        ListKind::ApacheModules => inventory::apache_modules(&registry.view("apache")?)?,
        ListKind::PhpExtensions => inventory::php_extensions(&registry.view("php")?)?,
    };
    if args.json {
        return print_json(&toggles);
    }
    let mut stdout = io::stdout().lock();
    for toggle in &toggles {
        let marker = if toggle.enabled { "+" } else { "-" };
        writeln!(stdout, "{marker} {}", toggle.name)?;
    }
    Ok(())
}

pub async fn service(registry: &Registry, args: ServiceArgs) -> Result<()> {
    match args.action {
        ServiceAction::Install(ModuleArgs { id }) => match registry.install_service(&id).await? {
            ServiceOutcome::Started => println!("{id} service installed and started"),
            ServiceOutcome::AlreadyRunning => println!("{id} service already running"),
        },
        ServiceAction::Remove(ModuleArgs { id }) => {
            if registry.remove_service(&id).await? {
                println!("{id} service removed");
            } else {
                println!("{id} service was not installed");
            }
        }
        ServiceAction::List(ServiceListArgs { json }) => {
            let specs = registry.services().await?;
            if json {
                return print_json(&specs);
            }
            write_service_table(io::stdout().lock(), &specs)?;
        }
    }
    Ok(())
}

pub async fn reconcile(registry: &Registry) -> Result<()> {
    let states = registry.reload_all().await?;
    let changed = registry.update_all().await?;
    for (id, state) in states {
        if let ModuleState::Invalid(reason) = state {
            eprintln!("warning: {id} is invalid: {reason}");
        }
    }
    println!("{} files updated", changed.len());
    for path in changed {
        println!("  {}", path.display());
    }
    Ok(())
}

pub fn alias(registry: &Registry, args: AliasArgs) -> Result<()> {
    let AliasAction::Add { name, destination } = args.action;
    let destination = absolute(destination)?;
    let path = registry.add_alias(&name, &destination)?;
    println!("alias /{name} written to {}", path.display());
    Ok(())
}

pub fn vhost(registry: &Registry, args: VhostArgs) -> Result<()> {
    let VhostAction::Add {
        server_name,
        document_root,
    } = args.action;
    let document_root = absolute(document_root)?;
    let path = registry.add_vhost(&server_name, &document_root)?;
    println!("vhost {server_name} written to {}", path.display());
    Ok(())
}

fn absolute(path: PathBuf) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path);
    }
    Ok(std::env::current_dir()
        .context("resolving relative path")?
        .join(path))
}

fn names(names: Vec<String>) -> Vec<Toggle> {
    names
        .into_iter()
        .map(|name| Toggle {
            name,
            enabled: true,
        })
        .collect()
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("encoding JSON")?;
    println!("{rendered}");
    Ok(())
}

fn write_status_table<W: Write>(writer: W, statuses: &[ModuleStatus]) -> io::Result<()> {
    let rows = statuses
        .iter()
        .map(|status| {
            let ports = status
                .ports
                .iter()
                .map(|port| format!("{}={}", port.field, port.port))
                .collect::<Vec<_>>()
                .join(" ");
            vec![
                status.id.to_string(),
                status.name.to_string(),
                status.version.clone().unwrap_or_else(|| "-".to_string()),
                state_label(&status.state),
                ports,
            ]
        })
        .collect::<Vec<_>>();
    write_table(writer, &["MODULE", "NAME", "VERSION", "STATE", "PORTS"], &rows)
}

fn state_label(state: &ModuleState) -> String {
    match state {
        ModuleState::Invalid(_) => "invalid".to_string(),
        other => other.to_string(),
    }
}

fn write_probe_table<W: Write>(writer: W, reports: &[PortReport]) -> io::Result<()> {
    let rows = reports
        .iter()
        .map(|report| {
            let outcome = match (&report.classification, &report.error) {
                (Some(classification), _) => classification.to_string(),
                (None, Some(error)) => format!("error: {error}"),
                (None, None) => "-".to_string(),
            };
            vec![
                report.module.to_string(),
                report.field.to_string(),
                report.port.map(|port| port.to_string()).unwrap_or_else(|| "-".to_string()),
                outcome,
            ]
        })
        .collect::<Vec<_>>();
    write_table(writer, &["MODULE", "FIELD", "PORT", "OUTCOME"], &rows)
}

fn write_service_table<W: Write>(writer: W, specs: &[ServiceSpec]) -> io::Result<()> {
    let rows = specs
        .iter()
        .map(|spec| {
            vec![
                spec.name.clone(),
                spec.binary.display().to_string(),
                spec.params.clone(),
            ]
        })
        .collect::<Vec<_>>();
    write_table(writer, &["SERVICE", "BINARY", "PARAMETERS"], &rows)
}

fn write_cascade<W: Write>(mut writer: W, report: &CascadeReport) -> io::Result<()> {
    for step in &report.steps {
        let outcome = match &step.outcome {
            StepOutcome::Patched { changed } => format!("updated ({changed} files changed)"),
            StepOutcome::Skipped { reason } => format!("skipped: {reason}"),
            StepOutcome::Failed { error } => format!("FAILED: {error}"),
        };
        writeln!(writer, "  {} <- {}: {outcome}", step.module, step.trigger)?;
    }
    Ok(())
}

/// Left-aligned columns sized by display width, two spaces apart.
fn write_table<W: Write>(mut writer: W, header: &[&str], rows: &[Vec<String>]) -> io::Result<()> {
    let mut widths = header
        .iter()
        .map(|cell| UnicodeWidthStr::width(*cell))
        .collect::<Vec<_>>();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(UnicodeWidthStr::width(cell.as_str()));
        }
    }

    let header = header.iter().map(|cell| cell.to_string()).collect::<Vec<_>>();
    for row in std::iter::once(&header).chain(rows) {
        let line = row
            .iter()
            .zip(&widths)
            .map(|(cell, width)| pad(cell, *width))
            .collect::<Vec<_>>()
            .join("  ");
        writeln!(writer, "{}", line.trim_end())?;
    }
    Ok(())
}

fn pad(cell: &str, width: usize) -> String {
    let fill = width.saturating_sub(UnicodeWidthStr::width(cell));
    format!("{cell}{}", " ".repeat(fill))
}

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum, builder::PossibleValue};
use clap_complete::Shell;
use std::path::PathBuf;

use crate::{config, logging, module::PRIMARY_PORT, registry::Registry};

#[derive(Parser, Debug)]
#[command(
    name = "bundlectl",
    version,
    about = "Manage the bundled services of a local web stack"
)]
pub struct Cli {
    /// Engine config file (default: $BUNDLECTL_CONFIG, then ./bundlectl.toml)
    #[arg(long, short = 'c', global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log debug output to stderr
    #[arg(long, short = 'v', global = true, action = ArgAction::SetTrue)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        logging::init_tracing(self.verbose);
        if let Command::Completions(args) = self.command {
            return handlers::completions(args);
        }

        let config = config::discover(self.config.as_deref()).context("loading engine config")?;
        let registry = Registry::open(&config)?;
        if logging::settings_verbose(&registry.context().settings) {
            logging::raise_to_debug();
        }

        match self.command {
            Command::Status(args) => handlers::status(&registry, args).await,
            Command::Versions(args) => handlers::versions(&registry, args).await,
            Command::Enable(args) => handlers::set_enable(&registry, args, true).await,
            Command::Disable(args) => handlers::set_enable(&registry, args, false).await,
            Command::Switch(args) => handlers::switch(&registry, args).await,
            Command::Port(args) => handlers::port(&registry, args).await,
            Command::Credentials(args) => handlers::credentials(&registry, args).await,
            Command::Probe(args) => handlers::probe(&registry, args).await,
            Command::Check(args) => handlers::check(&registry, args).await,
            Command::Online => handlers::online(&registry, true).await,
            Command::Offline => handlers::online(&registry, false).await,
            Command::List(args) => handlers::list(&registry, args),
            Command::Service(args) => handlers::service(&registry, args).await,
            Command::Reconcile => handlers::reconcile(&registry).await,
            Command::Alias(args) => handlers::alias(&registry, args),
            Command::Vhost(args) => handlers::vhost(&registry, args),
            Command::Completions(_) => Ok(()),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show every module's version, state and ports
    Status(StatusArgs),
    /// List the installed versions of a module
    Versions(ModuleArgs),
    /// Enable a module and start its service
    Enable(ModuleArgs),
    /// Disable a module and remove its service
    Disable(ModuleArgs),
    /// Activate another installed version
    Switch(SwitchArgs),
    /// Change one of a module's ports
    Port(PortArgs),
    /// Change the root credentials of a database engine
    Credentials(CredentialsArgs),
    /// Classify what listens on each configured port
    Probe(ProbeArgs),
    /// Run a module's version and syntax checks
    Check(ModuleArgs),
    /// Allow access from other hosts
    Online,
    /// Restrict access to this host
    Offline,
    /// Enumerate vhosts, aliases, Apache modules or PHP extensions
    List(ListArgs),
    /// Install or remove a module's OS service
    Service(ServiceArgs),
    /// Reload every module and re-apply its config
    Reconcile,
    /// Manage Apache aliases
    Alias(AliasArgs),
    /// Manage Apache virtual hosts
    Vhost(VhostArgs),
    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
pub struct ModuleArgs {
    /// Module id, e.g. `apache` or `mariadb`
    pub id: String,
}

#[derive(Args, Debug, Default)]
pub struct StatusArgs {
    /// Modules to show (default all)
    #[arg()]
    pub ids: Vec<String>,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct SwitchArgs {
    pub id: String,
    /// Version to activate, as listed by `versions`
    pub version: String,
}

#[derive(Args, Debug)]
pub struct PortArgs {
    pub id: String,
    /// New port, 1-65535
    pub port: String,

    /// Port field to change
    #[arg(long, short = 'f', default_value = PRIMARY_PORT)]
    pub field: String,

    /// Apply without probing the port first
    #[arg(long = "no-check", action = ArgAction::SetTrue)]
    pub no_check: bool,
}

#[derive(Args, Debug)]
pub struct CredentialsArgs {
    pub id: String,

    #[arg(long, short = 'u')]
    pub user: String,

    #[arg(long, short = 'p', default_value = "")]
    pub password: String,

    /// Only store the credentials; leave the server's accounts untouched
    #[arg(long)]
    pub settings_only: bool,
}

#[derive(Args, Debug, Default)]
pub struct ProbeArgs {
    /// Modules to probe (default all)
    #[arg()]
    pub ids: Vec<String>,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    #[arg(value_enum)]
    pub kind: ListKind,

    /// Print JSON instead of plain lines
    #[arg(long)]
    pub json: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum ListKind {
    Vhosts,
    Aliases,
    ApacheModules,
    PhpExtensions,
    Www,
}

#[derive(Args, Debug)]
pub struct ServiceArgs {
    #[command(subcommand)]
    pub action: ServiceAction,
}

#[derive(Subcommand, Debug)]
pub enum ServiceAction {
    /// Register and start the service after checking its port
    Install(ModuleArgs),
    /// Stop and unregister the service
    Remove(ModuleArgs),
    /// Show the registration every ready module would get
    List(ServiceListArgs),
}

#[derive(Args, Debug, Default)]
pub struct ServiceListArgs {
    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct AliasArgs {
    #[command(subcommand)]
    pub action: AliasAction,
}

#[derive(Subcommand, Debug)]
pub enum AliasAction {
    /// Expose a directory under `/<name>`
    Add {
        name: String,
        destination: PathBuf,
    },
}

#[derive(Args, Debug)]
pub struct VhostArgs {
    #[command(subcommand)]
    pub action: VhostAction,
}

#[derive(Subcommand, Debug)]
pub enum VhostAction {
    /// Serve a document root under its own server name
    Add {
        server_name: String,
        document_root: PathBuf,
    },
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: CompletionShell,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

impl ValueEnum for CompletionShell {
    fn value_variants<'a>() -> &'a [Self] {
        &[
            CompletionShell::Bash,
            CompletionShell::Zsh,
            CompletionShell::Fish,
            CompletionShell::PowerShell,
            CompletionShell::Elvish,
        ]
    }

    fn to_possible_value(&self) -> Option<PossibleValue> {
        Some(match self {
            CompletionShell::Bash => PossibleValue::new("bash"),
            CompletionShell::Zsh => PossibleValue::new("zsh"),
            CompletionShell::Fish => PossibleValue::new("fish"),
            CompletionShell::PowerShell => PossibleValue::new("powershell"),
            CompletionShell::Elvish => PossibleValue::new("elvish"),
        })
    }
}

impl From<CompletionShell> for Shell {
    fn from(shell: CompletionShell) -> Self {
        match shell {
            CompletionShell::Bash => Shell::Bash,
            CompletionShell::Zsh => Shell::Zsh,
            CompletionShell::Fish => Shell::Fish,
            CompletionShell::PowerShell => Shell::PowerShell,
            CompletionShell::Elvish => Shell::Elvish,
        }
    }
}

mod handlers;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_defaults_to_primary_field_with_check() {
        let cli = Cli::try_parse_from(["bundlectl", "port", "mysql", "3310"]).expect("parse");
        let Command::Port(args) = cli.command else {
            panic!("expected port command");
        };
        assert_eq!(args.field, PRIMARY_PORT);
        assert!(!args.no_check);
    }

    #[test]
    fn global_flags_follow_subcommands() {
        let cli = Cli::try_parse_from(["bundlectl", "status", "--json", "-c", "stack.toml", "-v"]).expect("parse");
        assert_eq!(cli.config, Some(PathBuf::from("stack.toml")));
        assert!(cli.verbose);
        assert!(matches!(cli.command, Command::Status(StatusArgs { json: true, .. })));
    }

    #[test]
    fn list_kinds_are_kebab_case() {
        let cli = Cli::try_parse_from(["bundlectl", "list", "php-extensions"]).expect("parse");
        assert!(matches!(
            cli.command,
            Command::List(ListArgs {
                kind: ListKind::PhpExtensions,
                ..
            })
        ));
    }

    #[test]
    fn command_tree_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}

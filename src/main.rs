mod cli;
mod cmdline;
mod config;
mod logging;
mod module;
mod patch;
mod paths;
mod probe;
mod registry;
mod service;
mod settings;

use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    cli.execute().await
}

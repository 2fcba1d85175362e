mod api;
mod commands;
mod config;
mod domain;
mod duration;
mod inventory;
mod logging;
mod metrics;
mod server;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "puppetdb-exporter",
    version,
    about = "Export PuppetDB node and report status as Prometheus metrics"
)]
struct Cli {
    /// Path to config file (default: ~/.config/puppetdb-exporter/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: config::ConfigOverrides,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll PuppetDB on an interval and serve the metrics over HTTP
    Serve,

    /// Poll PuppetDB once and print each node's classification
    Check {
        /// Output format (table or json)
        #[arg(long, default_value = "table")]
        format: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = config::load(cli.config.as_deref(), &cli.overrides)?;
    logging::init(&config);

    match cli.command {
        Commands::Serve => commands::serve::run(config),
        Commands::Check { format } => commands::check::run(config, &format),
    }
}

mod commands;
mod node;

use anyhow::Result;
use clap::{Parser, Subcommand};

use natsmesh_core::{bootstrap::load_config, logging};

#[derive(Parser, Debug)]
#[command(name = "natsmesh")]
#[command(about = "Keeps a NATS cluster's membership and broker configuration in sync", long_about = None)]
struct Args {
    /// Config file (otherwise NATSMESH_CONFIG_PATH, ./natsmesh.yaml, /config/natsmesh.yaml)
    #[arg(long, short, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Join the mesh and keep the broker configuration up to date
    Run,
    /// Print the broker configuration for the current registry
    Render {
        /// Write to this file instead of stdout
        #[arg(long, short)]
        output: Option<String>,
    },
    /// Ask the local broker to reload its configuration
    Reload,
    /// List registered servers with their last heartbeat
    Servers,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;
    logging::init_logging(&config.logging)?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => node::run(config, args.config).await,
        Command::Render { output } => commands::render(&config, output.as_deref()).await,
        Command::Reload => commands::reload(&config).await,
        Command::Servers => commands::servers(&config).await,
    }
}

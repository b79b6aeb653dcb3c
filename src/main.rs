use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

mod cmd;

#[derive(Parser)]
#[command(name = "phasegraph")]
#[command(version, about = "Phase scheduler for component hierarchies")]
pub struct Cli {
    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Path to phasegraph.toml (defaults to <project-dir>/phasegraph.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the demo testbench through every phase
    Run {
        /// Log every sub-event and transition
        #[arg(long)]
        trace: bool,

        /// Override the global timeout in milliseconds (0 disables it)
        #[arg(long)]
        timeout_ms: Option<i64>,

        /// End timed out phases instead of failing the run
        #[arg(long)]
        force_end: bool,

        /// Keep the driver's main-phase objection raised forever
        #[arg(long)]
        hang: bool,

        /// Print scheduler events as JSON lines
        #[arg(long)]
        events: bool,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the phase graph as execution waves
    Graph {
        /// Print waves as JSON
        #[arg(long)]
        json: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default phasegraph.toml file
    Init,
}

fn init_tracing(cli: &Cli) {
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if cli.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Run {
            trace,
            timeout_ms,
            force_end,
            hang,
            events,
            json,
        } => {
            let options = cmd::RunOptions {
                trace: *trace,
                timeout_ms: *timeout_ms,
                force_end: *force_end,
                hang: *hang,
                events: *events,
                json: *json,
            };
            cmd::cmd_run(&project_dir, cli.config.as_deref(), &options).await?;
        }
        Commands::Graph { json } => {
            cmd::cmd_graph(&project_dir, cli.config.as_deref(), *json)?;
        }
        Commands::Config { command } => {
            cmd::cmd_config(&project_dir, cli.config.as_deref(), command.clone())?;
        }
    }

    Ok(())
}

mod commands;
mod manifest;
mod providers;

use anyhow::Context;
use clap::{Parser, Subcommand};
use instanceflow_config::Settings;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "instanceflowd")]
#[command(about = "Keeps declared compute instances in sync with the cloud", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to the standard search path)
    #[arg(short, long, global = true, env = "INSTANCEFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Record store directory (overrides `state_dir`)
    #[arg(long, global = true, env = "INSTANCEFLOW_STATE_DIR")]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller until interrupted
    Run {
        /// Cloud backend (overrides `provider`)
        #[arg(long)]
        provider: Option<String>,
    },
    /// Create records from a manifest file
    Apply {
        /// Manifest (YAML, one or more documents)
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
    /// Request deletion of a record
    Delete {
        name: String,
        #[arg(short, long, default_value = "default")]
        namespace: String,
    },
    /// Show one record
    Get {
        name: String,
        #[arg(short, long, default_value = "default")]
        namespace: String,
        /// Print the full record as YAML or JSON
        #[arg(short, long, value_parser = ["yaml", "json"])]
        output: Option<String>,
    },
    /// List records
    List,
}

fn load_settings(cli: &Cli) -> anyhow::Result<Settings> {
    let mut settings = match &cli.config {
        Some(path) => instanceflow_config::load_from(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => instanceflow_config::load()?,
    };
    if let Some(state_dir) = &cli.state_dir {
        settings.state_dir = state_dir.clone();
    }
    Ok(settings)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run { provider } => commands::run::handle(settings, provider).await,
        Commands::Apply { file } => commands::apply::handle(&settings, &file).await,
        Commands::Delete { name, namespace } => {
            commands::delete::handle(&settings, &namespace, &name).await
        }
        Commands::Get {
            name,
            namespace,
            output,
        } => commands::get::handle(&settings, &namespace, &name, output.as_deref()).await,
        Commands::List => commands::list::handle(&settings).await,
    }
}

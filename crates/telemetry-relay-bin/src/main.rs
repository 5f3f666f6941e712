//! Telemetry Relay - pipes newline-delimited JSON events through a durable delivery channel.

mod relay;
mod status;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use telemetry_config_and_utils::{init_logging, Config, Paths};

/// Telemetry relay command-line interface.
#[derive(Parser)]
#[command(name = "telemetry-relay")]
#[command(about = "Deliver newline-delimited JSON telemetry with on-disk retry")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error). Overrides the config file.
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Base directory for config, logs and batch files. Defaults to ~/.telemetry-relay
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,

    /// Config file to use instead of <base-dir>/config.json
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Endpoint batches are POSTed to. Overrides the config file.
    #[arg(short, long, global = true, env = "TELEMETRY_ENDPOINT")]
    endpoint: Option<String>,

    /// Read events from this file instead of stdin
    #[arg(short, long)]
    input: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Relay events until end of input (the default)
    Run,
    /// Print batch file counts of the working directory
    Status,
}

fn load_config(cli: &Cli, paths: &Paths) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => {
            let mut config = Config::load_from_file(path)?;
            config.apply_env_overrides(|name| std::env::var(name).ok());
            config
        }
        None => Config::load(paths)?,
    };

    if let Some(endpoint) = &cli.endpoint {
        config.endpoint_address = endpoint.clone();
    }
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let paths = match &cli.base_dir {
        Some(base) => Paths::with_base_dir(base.clone()),
        None => Paths::new()?,
    };
    let config = load_config(&cli, &paths)?;

    match cli.command {
        Some(Commands::Status) => {
            status::print_status(&config, &paths)?;
        }
        Some(Commands::Run) | None => {
            paths.ensure_dirs()?;
            init_logging(&config.log_level, Some(paths.log_file()));
            relay::run(&config, &paths, cli.input.as_deref()).await?;
        }
    }

    Ok(())
}

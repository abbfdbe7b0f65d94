//! cuesync CLI
//!
//! Command-line interface for cuesync - follow a remote playback timeline.

use std::fs::OpenOptions;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use cuesync_core::Config;

mod commands;
mod output;

use commands::run::RunOptions;
use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "cuesync")]
#[command(about = "cuesync - keep a local player in step with a remote playback timeline")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Use this config file instead of the default
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow a control server with a simulated player until Ctrl-C
    Run {
        /// Control server URL (defaults to server_url from the config)
        #[arg(long)]
        url: Option<String>,
        /// Length of the simulated media in seconds
        #[arg(long)]
        duration: Option<u64>,
        /// Let the simulated player absorb small drift by nudging its rate
        #[arg(long)]
        rate_correction: bool,
    },
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Decode one control frame and print the command
    Decode {
        /// Frame payload, e.g. '{"type":"play","position":0,"referenceTime":1000}'
        frame: String,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (server_url, drift_tolerance_ms, ...)
        key: String,
        /// Configuration value
        value: String,
    },
    /// Print the config file location
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config_path = cli.config.as_ref();

    match cli.command {
        Commands::Config { command } => handle_config_command(command, config_path, &output),
        Commands::Decode { frame } => commands::decode::decode(&frame, &output),
        Commands::Run {
            url,
            duration,
            rate_correction,
        } => {
            let config = Config::load_with_cli_override(config_path)
                .context("Failed to load configuration")?;
            init_logging(&config);

            let options = RunOptions {
                url,
                duration_ms: duration.map(|secs| secs as i64 * 1_000),
                rate_correction,
            };
            commands::run::run(&config, options, &output).await
        }
    }
}

fn handle_config_command(
    command: Option<ConfigCommands>,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    match command {
        Some(ConfigCommands::Show) | None => commands::config::show(config_path, output),
        Some(ConfigCommands::Set { key, value }) => {
            commands::config::set(key, value, config_path, output)
        }
        Some(ConfigCommands::Path) => commands::config::path(config_path, output),
    }
}

/// Initialize logging
///
/// Level comes from CUESYNC_LOG (default `warn`). Logs go to stderr, or to
/// config.log_file when one is set.
fn init_logging(config: &Config) {
    let log_level = std::env::var("CUESYNC_LOG").unwrap_or_else(|_| "warn".to_string());
    let env_filter = EnvFilter::new(format!(
        "cuesync_core={},cuesync_cli={}",
        log_level, log_level
    ));

    let Some(log_path) = &config.log_file else {
        // Ignore error if already initialized
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init();
        return;
    };

    let log_file = match OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Warning: Could not open log file {:?}: {}", log_path, e);
            return;
        }
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(log_file)
        .try_init();

    info!("Logging to {:?}", log_path);
}

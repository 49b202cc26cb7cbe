//! Main entry point for the feedsync CLI.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use engine::tracer::{LogFormat, init_tracing};
use uuid::Uuid;

mod commands;

/// feedsync CLI
#[derive(Parser)]
#[command(name = "feedsync")]
#[command(about = "Command-line tools for the feedsync synchronization engine", long_about = None)]
struct Cli {
    /// Log line format (text or json)
    #[arg(long, global = true, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

/// Subcommands for the feedsync CLI
#[derive(Subcommand)]
enum Commands {
    /// Replay a recorded change feed through a conversation and print the result
    Replay {
        /// Signed-in user whose view is reconstructed
        #[arg(long)]
        viewer: Uuid,

        /// Other participant of the conversation
        #[arg(long)]
        peer: Uuid,

        /// Newline-delimited JSON file with one raw change per line
        #[arg(long, short)]
        file: PathBuf,

        /// Path to the configuration file (optional)
        #[arg(
            long,
            short,
            help = "Path to the configuration file (e.g., config.yaml or config.json). If not provided, defaults will be used."
        )]
        config: Option<PathBuf>,

        /// Mark the conversation read after replaying
        #[arg(long)]
        mark_read: bool,
    },

    /// Generate shell completion scripts for the CLI
    Completion {
        /// The shell type for which to generate the completion script (e.g., bash, zsh, fish, powershell)
        #[arg(
            long,
            short,
            help = "The shell type for which to generate the completion script (e.g., bash, zsh, fish, powershell)"
        )]
        shell: String,
    },

    /// Generate a configuration file
    Config {
        /// Format of the configuration file to generate (yaml or json). Defaults to yaml.
        #[arg(
            long,
            short,
            help = "Format of the configuration file to generate (yaml or json). Defaults to yaml."
        )]
        format: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Replay {
            viewer,
            peer,
            file,
            config,
            mark_read,
        } => {
            let config = shared::SyncConfig::load_config(config)
                .context("failed to load configuration")?;
            init_tracing(&config.log_level, cli.log_format);
            let report = commands::replay::replay(
                &commands::replay::ReplayArgs {
                    viewer,
                    peer,
                    file,
                    mark_read,
                },
                &config,
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Completion { shell } => {
            let shell = shell
                .parse::<clap_complete::Shell>()
                .map_err(|err| anyhow::anyhow!("invalid shell type '{shell}': {err}"))?;
            commands::completion::generate_completion(shell);
        }
        Commands::Config { format } => {
            let format = format.unwrap_or_else(|| "yaml".to_string());
            commands::config::generate_config(&format)?;
        }
    }

    Ok(())
}

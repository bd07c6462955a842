//! Broadcast recorder control tool.
//!
//! Talks to a running broadcast extension through the shared configuration:
//! asks it to stop, reads back the record it leaves for the host app and
//! inspects finished recordings.

mod commands;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use broadcast_session::ExtensionConfig;

pub use commands::{inspect_recording, last_microphone, stop_broadcast};

#[derive(Parser, Debug)]
#[command(name = "broadcast-recorder", version, about)]
pub struct Cli {
    /// Extension configuration file (JSON). Defaults apply when omitted.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Application group identifier, overriding the configuration file.
    #[arg(short, long, global = true)]
    pub group: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Ask the running broadcast to stop
    Stop,
    /// Print a JSON summary of a recording
    Inspect { file: PathBuf },
    /// Print whether the last session captured the microphone, and clear it
    LastMic {
        /// Leave the record in place
        #[arg(long)]
        keep: bool,
    },
}

/// Initialize logging.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "broadcast_recorder=debug,broadcast_session=debug,broadcast_muxer=debug,broadcast_writer=debug".into()
        }))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(cli: &Cli) -> anyhow::Result<ExtensionConfig> {
    let config = match &cli.config {
        Some(path) => ExtensionConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => {
            debug!("No configuration file given, using defaults");
            ExtensionConfig::default()
        }
    };
    Ok(match &cli.group {
        Some(group) => config.with_app_group(group.clone()),
        None => config,
    })
}

/// Run one command.
pub fn run(cli: Cli) -> anyhow::Result<()> {
    match &cli.command {
        Command::Stop => {
            let config = load_config(&cli)?;
            let reached = stop_broadcast(&config)?;
            if reached == 0 {
                info!("No broadcast is listening for the stop notification");
            }
            println!("{}", reached);
        }
        Command::Inspect { file } => {
            let summary = inspect_recording(file)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::LastMic { keep } => {
            let config = load_config(&cli)?;
            match last_microphone(&config, !*keep)? {
                Some(enabled) => println!("{}", enabled),
                None => println!("unknown"),
            }
        }
    }
    Ok(())
}

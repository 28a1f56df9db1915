//! DocIntel CLI - ask questions about your documents from the terminal.
//!
//! Shows the backend's processing stages live while an answer is produced,
//! and keeps going through stream drops by falling back to status polling.

mod commands;

use clap::{Parser, Subcommand};
use docintel_progress::{ClientConfig, ConfigLoader};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// DocIntel CLI - document question answering with live progress
#[derive(Parser, Debug)]
#[command(name = "docintel", author, version, about = "Ask DocIntel questions with live progress")]
struct Args {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "warn", global = true)]
    log_level: String,

    /// Path to a TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Chat API root (overrides the configuration file)
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Output machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ask a question in a chat session
    ///
    /// Subscribes to the session's progress stream, sends the question and
    /// prints each processing stage until the answer is ready.
    Ask {
        /// Chat session id
        session_id: String,

        /// The question to ask
        question: String,
    },

    /// Show the messages of a chat session
    History {
        /// Chat session id
        session_id: String,
    },

    /// Print the effective configuration
    Config,
}

fn load_config(args: &Args) -> anyhow::Result<ClientConfig> {
    let mut config = match &args.config {
        Some(path) => ConfigLoader::load(path)?,
        None => ClientConfig::default(),
    };
    if let Some(base_url) = &args.base_url {
        config.base_url.clone_from(base_url);
        ConfigLoader::validate(&config)?;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .init();

    let config = load_config(&args)?;

    match args.command {
        Command::Ask { session_id, question } => {
            commands::ask::execute(&config, session_id, question, args.json).await
        }
        Command::History { session_id } => {
            commands::history::execute(&config, &session_id, args.json).await
        }
        Command::Config => commands::config::execute(&config, args.json),
    }
}

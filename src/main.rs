#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::similar_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt};

use zeroclaw_sessions::config::Config;
use zeroclaw_sessions::pairing;
use zeroclaw_sessions::session::SessionId;
use zeroclaw_sessions::store::{CredentialStore, SqliteBackend};

/// Operator tools for the WhatsApp session host.
#[derive(Parser, Debug)]
#[command(name = "zeroclaw-sessions")]
#[command(author = "theonlyhennygod")]
#[command(version)]
#[command(about = "Inspect and maintain stored WhatsApp sessions.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Inspect or delete stored credentials
    Creds {
        #[command(subcommand)]
        command: CredsCommands,
    },

    /// Render a pairing challenge as a QR code
    Qr {
        /// Challenge string issued by the engine
        payload: String,

        /// Write a PNG to this file instead of printing to the terminal
        #[arg(long)]
        png: Option<PathBuf>,
    },

    /// Show the effective configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum CredsCommands {
    /// Summary of an account's primary credentials (no key material)
    Show { id: SessionId },
    /// Count of stored keys per category
    Keys { id: SessionId },
    /// Delete every stored key of an account
    Purge {
        id: SessionId,
        /// Skip the confirmation check
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the configuration as TOML
    Show,
}

fn open_store(config: &Config, id: SessionId) -> Result<CredentialStore> {
    let db_path = config.store.database_path();
    let backend = SqliteBackend::open(&db_path).with_context(|| {
        format!(
            "Failed to open credential database: {}",
            db_path.display()
        )
    })?;
    Ok(CredentialStore::new(
        Arc::new(backend),
        &config.store.key_prefix,
        id,
    ))
}

async fn handle_creds(config: &Config, command: CredsCommands) -> Result<()> {
    match command {
        CredsCommands::Show { id } => {
            let store = open_store(config, id)?;
            if store.inventory().await?.get("creds").is_none() {
                println!("No stored credentials for session {id}.");
                return Ok(());
            }
            let creds = store.load_primary_credentials().await?;
            let summary = serde_json::json!({
                "session": id,
                "paired": creds.is_paired(),
                "me": creds.me,
                "registered": creds.registered,
                "registration_id": creds.registration_id,
                "platform": creds.platform,
                "next_pre_key_id": creds.next_pre_key_id,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        CredsCommands::Keys { id } => {
            let store = open_store(config, id)?;
            let counts = store.inventory().await?;
            if counts.is_empty() {
                println!("No stored keys for session {id}.");
            }
            for (category, count) in counts {
                println!("{category:<24} {count}");
            }
        }
        CredsCommands::Purge { id, yes } => {
            if !yes {
                anyhow::bail!("Refusing to purge session {id} without --yes");
            }
            let store = open_store(config, id)?;
            let removed = store.purge().await?;
            println!("✅ Removed {removed} key(s) for session {id}");
        }
    }
    Ok(())
}

fn handle_qr(payload: &str, png: Option<PathBuf>) -> Result<()> {
    match png {
        Some(path) => {
            let bytes = pairing::render_png(payload)?;
            std::fs::write(&path, bytes)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("✅ Wrote {}", path.display());
        }
        None => {
            let rendered = pairing::render_terminal(payload)?;
            println!("Scan in WhatsApp > Linked Devices:");
            println!("{rendered}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging - respects RUST_LOG env var, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    match cli.command {
        Commands::Qr { payload, png } => handle_qr(&payload, png),
        Commands::Creds { command } => {
            let config = Config::load_or_init()?;
            handle_creds(&config, command).await
        }
        Commands::Config {
            command: ConfigCommands::Show,
        } => {
            let config = Config::load_or_init()?;
            println!("# {}", config.config_path.display());
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

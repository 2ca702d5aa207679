#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::assigning_clones,
    clippy::bool_to_int_with_if,
    clippy::case_sensitive_file_extension_comparisons,
    clippy::cast_possible_wrap,
    clippy::doc_markdown,
    clippy::field_reassign_with_default,
    clippy::float_cmp,
    clippy::implicit_clone,
    clippy::items_after_statements,
    clippy::map_unwrap_or,
    clippy::manual_let_else,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::needless_raw_string_hashes,
    clippy::redundant_closure_for_method_calls,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unused_self,
    clippy::cast_precision_loss,
    clippy::unnecessary_cast,
    clippy::unnecessary_lazy_evaluations,
    clippy::unnecessary_literal_bound,
    clippy::unnecessary_map_or,
    clippy::unnecessary_wraps,
    dead_code
)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use relaygate::config::Config;
use relaygate::{ConfigCommands, DedupCommands};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// `relaygate` - many chat accounts, one supervised gateway.
#[derive(Parser, Debug)]
#[command(name = "relaygate")]
#[command(version)]
#[command(about = "Multi-account chat transport gateway.", long_about = None)]
struct Cli {
    /// Config file (defaults to ~/.relaygate/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the gateway daemon until Ctrl+C
    Daemon {
        /// Use the in-process loopback transport; nothing leaves the process
        #[arg(long)]
        dry_run: bool,
    },

    /// Print the state last written by a running daemon
    Status,

    /// Inspect the deduplication store
    Dedup {
        #[command(subcommand)]
        dedup_command: DedupCommands,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging - respects RUST_LOG env var, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load_or_init()?,
    };

    match cli.command {
        Commands::Daemon { dry_run } => {
            info!(
                "📨 Starting relaygate daemon with {} configured instance(s)",
                config.instances.len()
            );
            relaygate::daemon::run(config, dry_run).await
        }

        Commands::Status => {
            let state = relaygate::daemon::read_state(&config)?;
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(())
        }

        Commands::Dedup { dedup_command } => handle_dedup_command(dedup_command, &config).await,

        Commands::Config { config_command } => match config_command {
            ConfigCommands::Show => {
                println!("{}", toml::to_string_pretty(&config)?);
                Ok(())
            }
            ConfigCommands::Path => {
                println!("{}", config.config_path.display());
                Ok(())
            }
        },
    }
}

async fn handle_dedup_command(command: DedupCommands, config: &Config) -> Result<()> {
    let store = relaygate::kv::create_kv_store(&config.dedup)?;
    match command {
        DedupCommands::Search { pattern } => {
            let keys = store.keys(&pattern).await?;
            if keys.is_empty() {
                println!("No deduplication keys match `{pattern}`.");
                return Ok(());
            }
            for key in &keys {
                let record = store.get(key).await?.unwrap_or_default();
                println!("{key}  {record}");
            }
            println!();
            println!("{} key(s)", keys.len());
            Ok(())
        }
        DedupCommands::Purge => {
            let removed = store.purge_expired().await?;
            println!("Removed {removed} expired record(s) from the {} store.", store.name());
            Ok(())
        }
    }
}

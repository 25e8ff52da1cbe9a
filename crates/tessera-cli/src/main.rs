use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tessera_core::{initialize_token_system, TokenComponentInput, TokenConfig, TokenError, TokenState};

#[derive(Debug, Parser)]
#[command(name = "tessera", version, about = "Design-token cache and distribution engine")]
struct Cli {
    /// Config file to use instead of the user config.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Ingest a JSON payload `{id: {type, value}}` and print the merged state.
    Process { file: PathBuf },
    /// Print cached tokens for the given component types.
    Get {
        #[arg(required = true)]
        types: Vec<String>,
    },
    /// Subscribe to a component type, optionally ingest a payload, and print
    /// what the subscriber received.
    Watch {
        component_type: String,
        file: Option<PathBuf>,
    },
    /// List cached component types.
    Types,
    /// Wipe the token cache.
    Clear,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tessera=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), TokenError> {
    let config = match &cli.config {
        Some(path) => TokenConfig::load_from(path)?,
        None => TokenConfig::load()?,
    };
    let manager = initialize_token_system(&config).await?;

    match cli.command {
        Command::Process { file } => {
            let state = manager.process_tokens(read_payload(&file)?).await?;
            print_state(&state)?;
        }
        Command::Get { types } => {
            print_state(&manager.get_tokens(types).await)?;
        }
        Command::Watch {
            component_type,
            file,
        } => {
            let received: Arc<Mutex<Vec<TokenState>>> = Arc::default();
            let sink = received.clone();
            let subscription = manager.subscribe(component_type.clone(), move |state| {
                if let Ok(mut inbox) = sink.lock() {
                    inbox.push(state.clone());
                }
            });

            match file {
                Some(file) => {
                    manager.process_tokens(read_payload(&file)?).await?;
                }
                None => manager.preload_tokens([component_type]).await,
            }
            manager.flush().await;
            subscription.unsubscribe();

            let received = received.lock().map(|r| r.clone()).unwrap_or_default();
            if received.is_empty() {
                tracing::info!("no updates delivered");
            }
            for state in &received {
                print_state(state)?;
            }
        }
        Command::Types => {
            for (kind, count) in manager.store().component_types().await? {
                println!("{kind}\t{count}");
            }
        }
        Command::Clear => {
            manager.clear_cache().await?;
            tracing::info!("token cache cleared");
        }
    }
    Ok(())
}

fn read_payload(path: &Path) -> Result<HashMap<String, TokenComponentInput>, TokenError> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn print_state(state: &TokenState) -> Result<(), TokenError> {
    println!("{}", serde_json::to_string_pretty(state)?);
    Ok(())
}

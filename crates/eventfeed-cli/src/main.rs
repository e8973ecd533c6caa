use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use eventfeed_cli::cli::{commands, CliConfig, Overrides, SearchArgs};
use eventfeed_cli::tracing_setup::init_tracing;
use eventfeed_core::{ApiClient, FeedRuntime, StaticToken, TokenProvider};

#[derive(Parser)]
#[command(name = "eventfeed")]
#[command(about = "Search and browse the events feed")]
struct Cli {
    /// Path to JSON config file (defaults to <config dir>/eventfeed/config.json)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// API base URL, overrides config and EVENTFEED_API_URL
    #[arg(long)]
    api_url: Option<String>,

    /// Bearer token, overrides config and EVENTFEED_TOKEN
    #[arg(long)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream a search and print the visible cards
    Search {
        /// Search text; empty matches everything
        #[arg(default_value = "")]
        query: String,

        /// Number of pages to reveal
        #[arg(long, default_value_t = 1)]
        pages: usize,

        /// Resolve thumbnails for the visible cards
        #[arg(long)]
        thumbnails: bool,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Single-event operations
    Event {
        #[command(subcommand)]
        action: EventAction,
    },

    /// File operations
    File {
        #[command(subcommand)]
        action: FileAction,
    },

    /// Configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum EventAction {
    /// Print an event as JSON
    Get { id: String },
    /// Delete an event
    Delete { id: String },
}

#[derive(Subcommand)]
enum FileAction {
    /// Download a file
    Get {
        id: String,
        #[arg(long, short = 'o')]
        output: PathBuf,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let overrides = Overrides {
        api_url: cli.api_url.clone(),
        token: cli.token.clone(),
    };
    let config = CliConfig::resolve(cli.config.as_deref(), &overrides)?;

    if let Commands::Config {
        action: ConfigAction::Show,
    } = &cli.command
    {
        println!("{}", serde_json::to_string_pretty(&config.redacted())?);
        return Ok(());
    }

    let tokens: Arc<dyn TokenProvider> = Arc::new(StaticToken::new(config.require_token()?));

    match cli.command {
        Commands::Search {
            query,
            pages,
            thumbnails,
            json,
        } => {
            let mut runtime =
                FeedRuntime::new(&config.core, tokens).context("Failed to build feed runtime")?;
            runtime.start(&config.core);

            let args = SearchArgs {
                query,
                pages,
                thumbnails,
            };
            let report = commands::search(&runtime, &args).await;
            runtime.shutdown();
            commands::print_report(&report?, json)?;
        }
        Commands::Event { action } => {
            let client = ApiClient::new(config.core.api_base_url.clone(), tokens);
            match action {
                EventAction::Get { id } => commands::get_event(&client, &id).await?,
                EventAction::Delete { id } => commands::delete_event(&client, &id).await?,
            }
        }
        Commands::File {
            action: FileAction::Get { id, output },
        } => {
            let client = ApiClient::new(config.core.api_base_url.clone(), tokens);
            commands::download_file(&client, &id, &output).await?;
        }
        Commands::Config { .. } => {}
    }

    Ok(())
}

//! # WeLearn API CLI (`welearn-api`)
//!
//! ## Usage
//!
//! ```bash
//! welearn-api --config ./config/welearn.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `welearn-api serve` | Start the HTTP API |
//! | `welearn-api collections` | List vector collections with their language and model |
//! | `welearn-api search "<query>"` | Run a search from the terminal |
//! | `welearn-api check-config` | Print the effective configuration, secrets masked |
//!
//! ## Examples
//!
//! ```bash
//! # Serve on the configured address (default 0.0.0.0:8080)
//! welearn-api serve
//!
//! # Slice search restricted to SDG 6 and 14
//! welearn-api search "plastic in the oceans" --sdg 6 --sdg 14
//!
//! # One hit per document
//! welearn-api search "énergie solaire" --by-document --nb-results 5
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use welearn_api::config::{self, Config, LogConfig};
use welearn_api::db;
use welearn_api::embedding::{ProviderEmbedder, QueryEmbedder};
use welearn_api::pg_store::PgMetadataStore;
use welearn_api::qdrant::QdrantStore;
use welearn_api::search::SearchService;
use welearn_api::server;
use welearn_core::models::{Document, EnhancedSearchQuery, SearchMethod};

/// WeLearn API: semantic search, sourced Q&A and syllabus tutoring over
/// SDG-classified learning resources.
#[derive(Parser)]
#[command(name = "welearn-api", version)]
struct Cli {
    /// Path to configuration file (TOML). A missing file means defaults
    /// plus environment overrides.
    #[arg(long, global = true, default_value = "./config/welearn.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API.
    Serve,

    /// List the vector collections and their parsed language and model.
    Collections,

    /// Search the collection matching the query's language.
    Search {
        query: String,

        #[arg(long, default_value_t = 10)]
        nb_results: usize,

        /// Restrict to these SDGs (repeatable).
        #[arg(long = "sdg")]
        sdgs: Vec<i64>,

        /// Return one hit per document instead of slices.
        #[arg(long)]
        by_document: bool,
    },

    /// Print the effective configuration with secrets masked.
    CheckConfig,
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&log.level))
        .unwrap_or_else(|_| {
            eprintln!("warning: invalid log filter '{}', using info", log.level);
            EnvFilter::new("info")
        });
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if log.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn search_service(config: &Config) -> Result<SearchService> {
    let vectors = Arc::new(QdrantStore::new(&config.qdrant_url(), &config.qdrant)?);
    let metadata = Arc::new(PgMetadataStore::new(db::connect(config)?));
    let embedder = Arc::new(QueryEmbedder::new(
        Arc::new(ProviderEmbedder::new(config.embedding.clone())),
        config.embedding.cache_size,
    ));
    Ok(SearchService::new(vectors, metadata, embedder, config.search.clone()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::load_config(&cli.config)?;
    init_tracing(&config.log);

    match cli.command {
        Commands::Serve => server::run_server(config).await?,
        Commands::CheckConfig => print!("{}", config.redacted()?),
        Commands::Collections => {
            let search = search_service(&config)?;
            let names = search.get_collections().await?;
            if names.is_empty() {
                println!("No collections found.");
            }
            for name in names {
                match search.collection_info(&name) {
                    Ok(c) => println!("{}  lang={}  model={}", c.name, c.lang, c.model),
                    Err(_) => println!("{}  (not a WeLearn collection)", name),
                }
            }
        }
        Commands::Search {
            query,
            nb_results,
            sdgs,
            by_document,
        } => {
            let search = search_service(&config)?;
            let mut qp = EnhancedSearchQuery::new(query);
            qp.nb_results = nb_results;
            qp.sdg_filter = (!sdgs.is_empty()).then_some(sdgs);
            let method = if by_document {
                SearchMethod::ByDocument
            } else {
                SearchMethod::BySlices
            };
            let points = search.search_handler(&qp, method).await?;
            if points.is_empty() {
                println!("No results.");
            }
            for (i, point) in points.iter().enumerate() {
                let doc = Document::from_point(point);
                println!("{}. [{:.3}] {}", i + 1, doc.score, doc.payload.document_title);
                println!("   {}", doc.payload.document_url);
                let snippet: String = doc.payload.slice_content.chars().take(160).collect();
                println!("   {}", snippet.replace('\n', " "));
            }
        }
    }
    Ok(())
}

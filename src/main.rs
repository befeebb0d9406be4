use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coderag::config::Config;
use coderag::db::SnapshotStore;
use coderag::embedder;
use coderag::index::VectorIndex;
use coderag::indexer::Indexer;
use coderag::retriever::{Retrieval, Retriever};
use serde_json::json;
use tokio::sync::Mutex as TokioMutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "coderag")]
#[command(version, about = "Index Python projects and retrieve relevant code chunks", long_about = None)]
struct Cli {
    /// Path to the JSON config file
    #[arg(short, long, default_value = "")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index a project directory and print the report
    Index {
        /// Project root
        dir: PathBuf,
    },

    /// Index (or reuse the snapshot of) a project, then retrieve chunks for a query
    Search {
        /// Natural-language question
        query: String,

        /// Project root
        #[arg(short, long, default_value = ".")]
        root: PathBuf,

        /// Number of chunks to return
        #[arg(long)]
        top_k: Option<usize>,

        /// Minimum cosine similarity
        #[arg(long)]
        min_score: Option<f32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // 1. Load config
    let config = Config::load(&cli.config)?;
    config.validate().context("invalid configuration")?;

    // 2. Init embedder and index
    let embedder = embedder::from_config(&config.embedding).context("failed to create embedder")?;
    info!(
        "Using embedder {} ({} dimensions)",
        embedder.name(),
        embedder.dimensions()
    );
    let index = Arc::new(VectorIndex::new(config.embedding.dimensions));

    // 3. Init indexer, with snapshots unless disabled
    let mut indexer = Indexer::new(&config, Arc::clone(&embedder), Arc::clone(&index))?;
    if config.keep_snapshots > 0 {
        let store = SnapshotStore::open(&config.db_path).context("failed to open database")?;
        indexer = indexer.with_store(Arc::new(TokioMutex::new(store)));
    }

    match cli.command {
        Commands::Index { dir } => {
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_signal.cancel();
                }
            });

            let report = indexer
                .index_project_with_cancel(&dir, cancel)
                .await
                .with_context(|| format!("failed to index {}", dir.display()))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Search {
            query,
            root,
            top_k,
            min_score,
        } => {
            indexer
                .index_project(&root)
                .await
                .with_context(|| format!("failed to index {}", root.display()))?;

            let k = top_k.unwrap_or(config.retrieval.top_k);
            let min_score = min_score.unwrap_or(config.retrieval.min_score);
            let retriever = Retriever::new(
                index,
                embedder,
                config.retrieval.clone(),
                config.embedding_timeout(),
            );

            let output = match retriever.retrieve(&query, k, min_score).await? {
                Retrieval::Found(result) => {
                    let hits: Vec<_> = result
                        .hits
                        .iter()
                        .map(|hit| {
                            json!({
                                "file": hit.chunk.file_path,
                                "start_line": hit.chunk.start_line,
                                "end_line": hit.chunk.end_line,
                                "kind": hit.chunk.kind,
                                "name": hit.chunk.qualified_name,
                                "score": hit.score,
                                "parent": result.parent(hit).map(|p| p.qualified_name.clone()),
                                "text": hit.chunk.text,
                            })
                        })
                        .collect();
                    json!({ "generation": result.generation_id(), "hits": hits })
                }
                Retrieval::NoRelevantContext => json!({ "hits": [], "no_relevant_context": true }),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

//! lawqa CLI - index and query Vietnamese road-traffic law passages.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lawqa_core::{Embedder, Passage, PassageStore, QaConfig, Reranker};
use lawqa_embed::{KeywordOverlapReranker, OnnxEmbedder, OnnxReranker, UnavailableReranker};
use lawqa_query::{QueryClassifier, RetrievalEngine, RetrievalOutcome};
use lawqa_store::SqliteStore;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// lawqa - Hybrid retrieval over Vietnamese road-traffic law
#[derive(Parser)]
#[command(name = "lawqa")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (default: <config dir>/lawqa/config.toml, then ./lawqa.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database path, overriding the config
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Ingest passage records (JSON array or JSON Lines)
    Ingest {
        /// Record files
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Store passages without computing embeddings
        #[arg(long)]
        skip_embeddings: bool,
    },

    /// Show the query pattern and fusion weight for a question
    Classify {
        question: String,
    },

    /// Retrieve law passages for a question
    Retrieve {
        question: String,

        /// Number of passages to keep after reranking
        #[arg(short = 'k', long)]
        final_k: Option<usize>,

        /// Rerank by keyword overlap instead of the cross-encoder model
        #[arg(long)]
        keyword_rerank: bool,

        /// Fall back to fused order if the reranker fails
        #[arg(long)]
        degraded: bool,

        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show statistics
    Stats,
}

fn setup_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> CliResult<QaConfig> {
    let mut config = match &cli.config {
        Some(path) => QaConfig::load(path)?,
        None => QaConfig::load_default()?,
    };
    if let Some(db) = &cli.database {
        config.database.path = db.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> CliResult<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let config = load_config(&cli)?;

    match cli.command {
        Commands::Init => init_database(&config)?,
        Commands::Ingest {
            files,
            skip_embeddings,
        } => {
            let store = open_store(&config)?;
            ingest(&config, &store, &files, skip_embeddings).await?;
        }
        Commands::Classify { question } => classify(&config, &question),
        Commands::Retrieve {
            question,
            final_k,
            keyword_rerank,
            degraded,
            json,
        } => {
            let mut config = config;
            if let Some(k) = final_k {
                config.retrieval.final_k = k;
                config.retrieval.initial_k = config.retrieval.initial_k.max(k);
            }
            config.retrieval.degraded_rerank |= degraded;

            let outcome = if keyword_rerank {
                retrieve(&config, KeywordOverlapReranker::new(), &question).await?
            } else {
                match OnnxReranker::from_config(&config.reranker) {
                    Ok(reranker) => retrieve(&config, reranker, &question).await?,
                    Err(e) if config.retrieval.degraded_rerank => {
                        warn!("Reranker unavailable, continuing in fused order: {}", e);
                        retrieve(&config, UnavailableReranker::new(e.to_string()), &question)
                            .await?
                    }
                    Err(e) => return Err(e.into()),
                }
            };
            print_outcome(outcome, json)?;
        }
        Commands::Stats => {
            let store = open_store(&config)?;
            stats(&config, &store).await?;
        }
    }

    Ok(())
}

fn init_database(config: &QaConfig) -> CliResult<()> {
    let path = &config.database.path;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let _store = SqliteStore::from_config(&config.database)?;
    println!("Initialized database at: {}", path.display());
    Ok(())
}

fn open_store(config: &QaConfig) -> CliResult<SqliteStore> {
    let path = &config.database.path;
    if !path.exists() {
        return Err(format!(
            "Database {} does not exist. Run 'lawqa init' first, or specify a path with -d.",
            path.display()
        )
        .into());
    }
    Ok(SqliteStore::from_config(&config.database)?)
}

/// Parse a record file: a JSON array of passages, or one passage per line.
fn read_records(path: &Path) -> CliResult<Vec<Passage>> {
    let content = fs::read_to_string(path)?;
    let trimmed = content.trim_start();
    if trimmed.starts_with('[') {
        return Ok(serde_json::from_str(trimmed)?);
    }

    let mut passages = Vec::new();
    for (n, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let passage = serde_json::from_str(line)
            .map_err(|e| format!("{}:{}: {}", path.display(), n + 1, e))?;
        passages.push(passage);
    }
    Ok(passages)
}

async fn ingest(
    config: &QaConfig,
    store: &SqliteStore,
    files: &[PathBuf],
    skip_embeddings: bool,
) -> CliResult<()> {
    let embedder = if skip_embeddings {
        None
    } else {
        Some(OnnxEmbedder::from_config(&config.embedding)?)
    };

    let mut total = 0usize;
    for file in files {
        let mut passages = read_records(file)?;
        if passages.is_empty() {
            println!("  {} - no records", file.display());
            continue;
        }

        if let Some(embedder) = &embedder {
            embed_missing(embedder, &mut passages, config.embedding.batch_size).await?;
        }

        store.insert_passages(&passages).await?;
        println!("  {} - {} passages", file.display(), passages.len());
        total += passages.len();
    }

    println!("\nComplete: {} passages ingested", total);
    Ok(())
}

async fn embed_missing(
    embedder: &OnnxEmbedder,
    passages: &mut [Passage],
    batch_size: usize,
) -> CliResult<()> {
    let mut missing: Vec<&mut Passage> = passages
        .iter_mut()
        .filter(|p| p.embedding.is_empty())
        .collect();
    if missing.is_empty() {
        return Ok(());
    }

    info!("Embedding {} passages", missing.len());
    for chunk in missing.chunks_mut(batch_size.max(1)) {
        let texts: Vec<&str> = chunk.iter().map(|p| p.enriched_text.as_str()).collect();
        let vectors = embedder.embed_documents(&texts).await?;
        for (passage, vector) in chunk.iter_mut().zip(vectors) {
            passage.embedding = vector;
        }
    }
    Ok(())
}

fn classify(config: &QaConfig, question: &str) {
    let pattern = QueryClassifier::new().classify(question);
    println!("pattern: {}", pattern);
    println!("alpha:   {:.2}", config.retrieval.alpha.alpha_for(pattern));
}

async fn retrieve<R: Reranker>(
    config: &QaConfig,
    reranker: R,
    question: &str,
) -> CliResult<RetrievalOutcome> {
    let store = open_store(config)?;
    let embedder = OnnxEmbedder::from_config(&config.embedding)?;

    let engine = RetrievalEngine::new(
        Arc::new(store),
        Arc::new(embedder),
        Arc::new(reranker),
        config.retrieval.clone(),
    )?;
    Ok(engine.retrieve(question).await?)
}

fn print_outcome(mut outcome: RetrievalOutcome, json: bool) -> CliResult<()> {
    if json {
        for ranked in &mut outcome.passages {
            ranked.passage.embedding.clear();
        }
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    println!(
        "pattern: {}  alpha: {:.2}  latency: {}ms",
        outcome.pattern, outcome.alpha, outcome.latency_ms
    );
    if outcome.degraded {
        warn!("Reranker unavailable; passages are in fused order");
        println!("(degraded: reranker unavailable, fused order shown)");
    }

    let Some(context) = &outcome.context else {
        println!("\nNo relevant law passages found for this question.");
        return Ok(());
    };

    println!();
    for ranked in &outcome.passages {
        match ranked.rerank_score {
            Some(score) => println!(
                "{}. {} (fused {:.3}, rerank {:.3})",
                ranked.rank, ranked.passage.citation, ranked.fused_score, score
            ),
            None => println!(
                "{}. {} (fused {:.3})",
                ranked.rank, ranked.passage.citation, ranked.fused_score
            ),
        }
    }

    println!("\n--- context ---\n{}", context.context);
    println!("\n--- citations ---");
    for citation in &context.citations {
        println!("- {}", citation);
    }
    Ok(())
}

async fn stats(config: &QaConfig, store: &SqliteStore) -> CliResult<()> {
    let stats = store.stats().await?;
    println!("Database:   {}", config.database.path.display());
    println!("Passages:   {}", stats.passages);
    println!("Embedded:   {}", stats.embeddings);
    println!("Laws:       {}", stats.laws);
    println!("Size:       {} bytes", stats.storage_bytes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_retrieve() {
        let cli = Cli::parse_from([
            "lawqa",
            "-d",
            "/tmp/law.db",
            "retrieve",
            "Điều 5 quy định gì?",
            "-k",
            "3",
            "--keyword-rerank",
        ]);
        assert_eq!(cli.database, Some(PathBuf::from("/tmp/law.db")));
        match cli.command {
            Commands::Retrieve {
                question,
                final_k,
                keyword_rerank,
                ..
            } => {
                assert_eq!(question, "Điều 5 quy định gì?");
                assert_eq!(final_k, Some(3));
                assert!(keyword_rerank);
            }
            _ => panic!("expected retrieve"),
        }
    }

    #[test]
    fn test_read_records_json_and_lines() {
        let dir = tempfile::tempdir().unwrap();

        let record = r#"{"id":"x","law":"Luật số 36/2024/QH15","article_no":5,"text":"Tốc độ tối đa.","enriched_text":"[ARTICLE] Điều 5\nTốc độ tối đa.","display_citation":"Điều 5 Luật số 36/2024/QH15"}"#;

        let array = dir.path().join("records.json");
        fs::write(&array, format!("[{}]", record)).unwrap();
        let parsed = read_records(&array).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].article_no, "5");

        let lines = dir.path().join("records.jsonl");
        fs::write(&lines, format!("{}\n\n{}\n", record, record)).unwrap();
        assert_eq!(read_records(&lines).unwrap().len(), 2);
    }
}

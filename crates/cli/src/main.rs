//! kgfusion CLI
//!
//! Builds a knowledge graph from documents and answers queries over it.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kgfusion_agents::{
    BuildReport, CompletionClient, ConnectedComponents, EmbeddingClient, KnowledgePipeline,
    PipelineConfig, PipelineServices, QueryOutcome,
};
use kgfusion_core::Document;
use kgfusion_db::{init_memory, init_persistent, Repository};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// kgfusion - knowledge graph extraction and fused retrieval
#[derive(Parser)]
#[command(name = "kgfusion")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Database path (defaults to ~/.kgfusion/data)
    #[arg(short, long)]
    db_path: Option<PathBuf>,

    /// Use in-memory database (for testing)
    #[arg(long)]
    memory: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract entities and relations from files and index them
    Build {
        /// Text or markdown files
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Answer a query by fusing graph, vector and keyword retrieval
    Query {
        /// Query text
        text: String,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show database statistics
    Stats,

    /// Delete the local database (fresh start)
    ResetDb,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env if present.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Commands::ResetDb = cli.command {
        let path = resolve_db_path(cli.db_path)?;
        return cmd_reset_db(&path);
    }

    let db = if cli.memory {
        info!("Using in-memory database");
        init_memory().await?
    } else {
        let db_path = resolve_db_path(cli.db_path)?;
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        info!("Using database at: {}", db_path.display());
        init_persistent(&db_path).await?
    };
    let repo = Repository::new(db);

    match cli.command {
        Commands::Build { files, json } => cmd_build(repo, files, json).await?,
        Commands::Query { text, json } => cmd_query(repo, text, json).await?,
        Commands::Stats => cmd_stats(repo).await?,
        Commands::ResetDb => {
            // Handled before database init.
        }
    }

    Ok(())
}

fn resolve_db_path(explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path),
        None => {
            let mut path = dirs::home_dir().context("Could not find home directory")?;
            path.push(".kgfusion");
            path.push("data");
            Ok(path)
        }
    }
}

/// Wire the pipeline to the inference services and the repository
async fn pipeline(repo: Repository, needs_completion: bool) -> Result<KnowledgePipeline> {
    // Without embeddings the vector channel and entity-vector seeding fail
    // per call; the remaining channels still answer.
    let embedder = EmbeddingClient::default_local();
    if !embedder.health().await.unwrap_or(false) {
        warn!(
            url = %embedder.base_url(),
            "Embeddings service is not reachable, vector retrieval will be unavailable"
        );
    }

    let completion = CompletionClient::default_local();
    if needs_completion && !completion.health().await.unwrap_or(false) {
        eprintln!("Error: completion service is not reachable.");
        eprintln!("  Completion: {}", completion.base_url());
        anyhow::bail!("Completion service unavailable");
    }

    let known = repo.load_entities().await?;
    let store = Arc::new(repo);
    let services = PipelineServices {
        completion: Arc::new(completion),
        embedder: Arc::new(embedder),
        graph: store.clone(),
        vectors: store.clone(),
        keywords: store,
        communities: Arc::new(ConnectedComponents),
    };
    let config = PipelineConfig::from_env().context("Invalid pipeline configuration")?;

    info!(known_entities = known.len(), "Pipeline ready");
    Ok(KnowledgePipeline::new(config, services)?.with_known_entities(known))
}

fn read_document(path: &Path) -> Result<Document> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read file: {}", path.display()))?;
    let title = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    Ok(Document::new(path.display().to_string(), content).with_title(title))
}

async fn cmd_build(repo: Repository, files: Vec<PathBuf>, json: bool) -> Result<()> {
    let documents = files
        .iter()
        .map(|path| read_document(path))
        .collect::<Result<Vec<_>>>()?;

    let pipeline = pipeline(repo, true).await?;
    let report = pipeline.build_knowledge(&documents).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &BuildReport) {
    println!("✓ Built knowledge from {} documents", report.documents);
    println!(
        "  • Chunks: {} graph, {} vector, {} keyword",
        report.chunks.graph, report.chunks.vector, report.chunks.keyword
    );
    println!(
        "  • Entities: {} ({} created from relations)",
        report.delta.entities.len(),
        report.dynamic_entities
    );
    println!("  • Relationships: {}", report.delta.relationships.len());
    println!("  • Communities: {}", report.delta.communities.len());
    println!(
        "  • Indexed: {} vectors, {} keyword documents",
        report.vectors_indexed, report.keyword_docs_indexed
    );

    if report.is_degraded() {
        println!("\n⚠ Completed with problems:");
        println!("  • Failed batches: {}", report.failed_batches);
        println!("  • Parse failures: {}", report.parse_failures);
        println!("  • Dropped relationships: {}", report.dropped_relationships);
        for chunk in &report.skipped_chunks {
            println!("    - skipped {}", chunk);
        }
        for error in &report.index_errors {
            println!("    - {}", error);
        }
    }
}

async fn cmd_query(repo: Repository, text: String, json: bool) -> Result<()> {
    let pipeline = pipeline(repo, false).await?;
    let outcome = pipeline.query(&text).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_outcome(&outcome);
    }
    Ok(())
}

fn print_outcome(outcome: &QueryOutcome) {
    for failed in &outcome.failed_channels {
        eprintln!("⚠ {} channel unavailable: {:?}", failed.channel, failed.failure);
    }

    if outcome.results.is_empty() {
        println!("No results found.");
        return;
    }

    println!("Found {} results:\n", outcome.results.len());
    for (i, r) in outcome.results.iter().enumerate() {
        println!("{}. [{:.3}] via {}", i + 1, r.combined_score, r.metadata.channel);
        println!(
            "   graph {:.2} · vector {:.2} · keyword {:.2}",
            r.scores.graph, r.scores.vector, r.scores.keyword
        );
        let preview: String = r.content.chars().take(200).collect();
        let truncated = r.content.chars().count() > 200;
        println!("   {}{}", preview, if truncated { "..." } else { "" });
        println!();
    }
}

async fn cmd_stats(repo: Repository) -> Result<()> {
    let stats = repo.get_stats().await?;

    println!("Database Statistics:");
    println!("  • Entities: {}", stats.entity_count);
    println!("  • Relationships: {}", stats.relationship_count);
    println!("  • Vectors: {}", stats.vector_count);
    println!("  • Keyword documents: {}", stats.keyword_count);

    Ok(())
}

fn cmd_reset_db(path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_dir_all(path)
            .with_context(|| format!("Failed to remove db at {}", path.display()))?;
        println!("✓ Removed database at {}", path.display());
    } else {
        println!("Database not found at {}, nothing to remove", path.display());
    }
    Ok(())
}

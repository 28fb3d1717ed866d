use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use medical_rag::chunker::RecursiveSplitter;
use medical_rag::config::{Config, ProviderKind};
use medical_rag::embeddings::{EmbeddingProvider, EmbeddingService, HashingEmbedder};
use medical_rag::extraction::{LlmHeaderExtractor, MetadataExtractor, StaticTags};
use medical_rag::filter::{TagConstraint, TagFilter};
use medical_rag::inference::InferenceService;
use medical_rag::ingest::IngestionPipeline;
use medical_rag::query::QueryOrchestrator;
use medical_rag::{ReloadOutcome, RetrievalIndex, Tags};

type Index = RetrievalIndex<EmbeddingProvider>;

#[derive(Parser)]
#[command(name = "medical-rag")]
#[command(about = "Retrieval and question answering over medical records")]
#[command(version)]
#[command(after_help = "Configuration is read from the environment (and .env): MEDICAL_DB_DIR, \
DOCUMENTS_DIR, EMBEDDING_PROVIDER, OLLAMA_URL, OLLAMA_EMBEDDING_MODEL, LLM_BASE_URL, LLM_MODEL, \
OPENAI_API_KEY, ...")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Tag, chunk and index a document folder or a single file
    Ingest {
        /// Folder or file to ingest (defaults to DOCUMENTS_DIR)
        dir: Option<PathBuf>,

        /// Tag every chunk with key=value instead of asking the extraction model
        #[arg(short, long = "tag", value_name = "KEY=VALUE")]
        tags: Vec<String>,
    },

    /// Answer a question from the indexed records
    Ask {
        /// Question words, joined with spaces
        #[arg(required = true)]
        question: Vec<String>,

        /// Only retrieve chunks whose tags match key=value
        #[arg(short, long = "filter", value_name = "KEY=VALUE")]
        filters: Vec<String>,

        /// Number of chunks to retrieve (defaults to TOP_K)
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
    },

    /// Count chunks whose tags match every key=value
    Count {
        #[arg(value_name = "KEY=VALUE")]
        filters: Vec<String>,
    },

    /// Print index statistics as JSON
    Stats,
}

fn setup_logging(config: &Config) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    match &config.log_dir {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir)
                .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
            let log_file = log_dir.join("medical-rag.log");
            let file_appender = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_file)
                .with_context(|| format!("Failed to open log file {}", log_file.display()))?;

            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(file_appender)
                .json()
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .compact()
                .init();
        }
    }

    tracing::debug!("Logging initialized");
    tracing::debug!("Log level: {}", config.log_level);
    Ok(())
}

async fn connect_embedder(config: &Config) -> Result<EmbeddingProvider> {
    match config.provider()? {
        ProviderKind::Ollama => {
            let service = EmbeddingService::connect(
                &config.ollama_url,
                &config.embedding_model,
                config.embedding_batch_size,
            )
            .await?;
            Ok(EmbeddingProvider::Ollama(service))
        }
        ProviderKind::Hashing => Ok(EmbeddingProvider::Hashing(HashingEmbedder::new(
            config.hashing_dimension,
        ))),
    }
}

fn parse_tags(args: &[String]) -> Result<Tags> {
    let mut tags = Tags::new();
    for arg in args {
        let TagConstraint { key, value } = arg.parse()?;
        tags.insert(key, value);
    }
    Ok(tags)
}

async fn run_ingest<X: MetadataExtractor>(
    index: Arc<Index>,
    config: &Config,
    extractor: X,
    dir: PathBuf,
) -> Result<()> {
    let splitter = RecursiveSplitter::new(config.chunk_size, config.chunk_overlap)?;
    let pipeline = IngestionPipeline::new(index, splitter, extractor, &config.db_dir)
        .with_health_probe(config.llm_is_local);

    if dir.is_file() {
        let chunks = pipeline.ingest_file(&dir).await?;
        println!("Ingested {} ({} chunks)", dir.display(), chunks);
        return Ok(());
    }

    let report = pipeline.ingest_folder(&dir).await?;

    for failure in &report.failed {
        eprintln!("Skipped {}: {}", failure.path.display(), failure.error);
    }
    println!(
        "Ingested {} documents ({} chunks), {} failed",
        report.ingested.len(),
        report.total_chunks(),
        report.failed.len()
    );
    if let Some(error) = report.save_error {
        bail!("Index could not be saved to {}: {error}", config.db_dir.display());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let dotenv_result = dotenv::dotenv();

    let cli = Cli::parse();

    let config = Config::from_env();
    config.validate()?;
    setup_logging(&config)?;

    if let Err(e) = dotenv_result {
        tracing::debug!("No .env file loaded: {}", e);
    }
    tracing::info!("{}", config.summary());

    let embedder = connect_embedder(&config).await?;
    let index: Arc<Index> = Arc::new(RetrievalIndex::new(embedder));

    match index.reload(&config.db_dir).await? {
        ReloadOutcome::Loaded { entries, dimension } => {
            tracing::info!(entries, dimension, "Index ready");
        }
        ReloadOutcome::NothingToLoad => {
            tracing::info!(location = %config.db_dir.display(), "Starting with an empty index");
        }
    }

    match cli.command {
        Command::Ingest { dir, tags } => {
            let dir = dir.unwrap_or_else(|| config.documents_dir.clone());
            if tags.is_empty() {
                let model = InferenceService::new(&config.llm_base_url, &config.api_key, &config.extraction_model)?;
                run_ingest(index, &config, LlmHeaderExtractor::new(model), dir).await?;
            } else {
                run_ingest(index, &config, StaticTags(parse_tags(&tags)?), dir).await?;
            }
        }
        Command::Ask {
            question,
            filters,
            top_k,
        } => {
            let filter = TagFilter::parse_all(&filters)?;
            let model = InferenceService::new(&config.llm_base_url, &config.api_key, &config.llm_model)?;
            let orchestrator = QueryOrchestrator::new(index, model)
                .with_top_k(top_k.unwrap_or(config.top_k))
                .with_overfetch_factor(config.overfetch_factor);

            let answer = orchestrator.ask(&question.join(" "), Some(&filter)).await?;
            println!("{}", answer.text);
        }
        Command::Count { filters } => {
            let filter = TagFilter::parse_all(&filters)?;
            let count = index.aggregate_count(|tags| filter.matches(tags)).await;
            tracing::info!(filter = %filter, count, "Counted matching chunks");
            println!("{count}");
        }
        Command::Stats => {
            println!("{}", serde_json::to_string_pretty(&index.stats().await)?);
        }
    }

    Ok(())
}

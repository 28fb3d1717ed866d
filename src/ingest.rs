use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use walkdir::WalkDir;

use crate::chunker::Chunker;
use crate::embeddings::Embedder;
use crate::extraction::MetadataExtractor;
use crate::index::RetrievalIndex;
use crate::vector_store::{FlatVectorStore, VectorIndex};

/// Extensions picked up by folder ingestion. Documents are expected to be
/// converted to text or markdown before they get here.
pub const DOCUMENT_EXTENSIONS: [&str; 3] = ["md", "markdown", "txt"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestFailure {
    pub path: PathBuf,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Documents added to the index, with their chunk counts.
    pub ingested: Vec<(PathBuf, usize)>,
    pub failed: Vec<IngestFailure>,
    /// Set when saving the index failed. The batch stops there and the last
    /// entry of `ingested` is held in memory only.
    pub save_error: Option<String>,
}

impl IngestReport {
    pub fn total_chunks(&self) -> usize {
        self.ingested.iter().map(|(_, n)| n).sum()
    }
}

/// How a document failed to reach disk.
#[derive(Debug)]
enum DocumentError {
    /// Nothing from the document entered the index.
    Skipped(anyhow::Error),
    /// The chunks are in the index but saving it failed.
    Unsaved { chunks: usize, source: anyhow::Error },
}

impl DocumentError {
    fn into_error(self) -> anyhow::Error {
        match self {
            DocumentError::Skipped(e) | DocumentError::Unsaved { source: e, .. } => e,
        }
    }
}

/// Document → tags + chunks → index → disk.
pub struct IngestionPipeline<E, C, X, V = FlatVectorStore> {
    index: Arc<RetrievalIndex<E, V>>,
    chunker: Arc<C>,
    extractor: X,
    location: PathBuf,
    probe_health: bool,
}

impl<E, C, X, V> IngestionPipeline<E, C, X, V>
where
    E: Embedder,
    V: VectorIndex,
    C: Chunker + 'static,
    X: MetadataExtractor,
{
    pub fn new(
        index: Arc<RetrievalIndex<E, V>>,
        chunker: C,
        extractor: X,
        location: impl Into<PathBuf>,
    ) -> Self {
        Self {
            index,
            chunker: Arc::new(chunker),
            extractor,
            location: location.into(),
            probe_health: false,
        }
    }

    /// Check the extractor's backend before each document (local servers).
    pub fn with_health_probe(mut self, enabled: bool) -> Self {
        self.probe_health = enabled;
        self
    }

    pub fn index(&self) -> &Arc<RetrievalIndex<E, V>> {
        &self.index
    }

    /// Tag, split, ingest and persist one document. Returns its chunk count.
    pub async fn ingest_document(&self, name: &str, text: &str) -> Result<usize> {
        self.process_document(name, text).await.map_err(DocumentError::into_error)
    }

    pub async fn ingest_file(&self, path: &Path) -> Result<usize> {
        self.process_file(path).await.map_err(DocumentError::into_error)
    }

    async fn process_file(&self, path: &Path) -> Result<usize, DocumentError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))
            .map_err(DocumentError::Skipped)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        self.process_document(&name, &text).await
    }

    async fn process_document(&self, name: &str, text: &str) -> Result<usize, DocumentError> {
        if self.probe_health && !self.extractor.ready().await {
            return Err(DocumentError::Skipped(anyhow!(
                "Extraction server unreachable, skipping {name}"
            )));
        }

        let tags = self
            .extractor
            .extract(text)
            .await
            .with_context(|| format!("Failed to extract metadata for {name}"))
            .map_err(DocumentError::Skipped)?;

        let chunks = tokio::task::spawn_blocking({
            let chunker = Arc::clone(&self.chunker);
            let text = text.to_owned();
            move || chunker.split(&text)
        })
        .await
        .context("Chunking task failed")
        .map_err(DocumentError::Skipped)?;

        if chunks.is_empty() {
            tracing::warn!(document = name, "Document produced no chunks");
            return Ok(0);
        }

        let count = chunks.len();
        self.index
            .ingest(chunks, vec![tags; count])
            .await
            .with_context(|| format!("Failed to index {name}"))
            .map_err(DocumentError::Skipped)?;
        self.index
            .persist(&self.location)
            .await
            .with_context(|| format!("Failed to save index after {name}"))
            .map_err(|source| DocumentError::Unsaved {
                chunks: count,
                source,
            })?;

        tracing::info!(document = name, chunks = count, "Document ingested");
        Ok(count)
    }

    /// Ingest every text/markdown document under `dir` in file-name order.
    /// A failing document is recorded and skipped; the batch continues.
    /// A failed save stops the batch and is reported in `save_error`.
    pub async fn ingest_folder(&self, dir: &Path) -> Result<IngestReport> {
        if !dir.is_dir() {
            bail!("Documents directory not found: {}", dir.display());
        }

        let paths: Vec<PathBuf> = tokio::task::spawn_blocking({
            let dir = dir.to_path_buf();
            move || {
                WalkDir::new(&dir)
                    .sort_by_file_name()
                    .into_iter()
                    .filter_map(|e| e.ok())
                    .filter(|e| e.file_type().is_file() && is_document(e.path()))
                    .map(|e| e.path().to_path_buf())
                    .collect()
            }
        })
        .await
        .context("Document discovery task failed")?;

        tracing::info!(dir = %dir.display(), documents = paths.len(), "Found documents to ingest");

        let mut report = IngestReport::default();
        for path in paths {
            match self.process_file(&path).await {
                Ok(chunks) => report.ingested.push((path, chunks)),
                Err(DocumentError::Skipped(e)) => {
                    let error = format!("{e:#}");
                    tracing::error!(path = %path.display(), error = %error, "Document ingestion failed");
                    report.failed.push(IngestFailure { path, error });
                }
                Err(DocumentError::Unsaved { chunks, source }) => {
                    let error = format!("{source:#}");
                    tracing::error!(path = %path.display(), error = %error, "Index save failed, stopping batch");
                    report.ingested.push((path, chunks));
                    report.save_error = Some(error);
                    break;
                }
            }
        }

        tracing::info!(
            ingested = report.ingested.len(),
            failed = report.failed.len(),
            chunks = report.total_chunks(),
            "Batch ingestion complete"
        );
        Ok(report)
    }
}

fn is_document(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| DOCUMENT_EXTENSIONS.iter().any(|d| ext.eq_ignore_ascii_case(d)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::RecursiveSplitter;
    use crate::embeddings::HashingEmbedder;
    use crate::extraction::StaticTags;
    use crate::index::ReloadOutcome;
    use crate::metadata_store::Tags;
    use crate::persistence::{METADATA_FILE, VECTORS_FILE};
    use serde_json::json;

    /// Reads the condition from a `Condition:` line; fails otherwise.
    struct HeaderLineExtractor {
        ready: bool,
    }

    impl MetadataExtractor for HeaderLineExtractor {
        async fn extract(&self, document: &str) -> Result<Tags> {
            let condition = document
                .lines()
                .find_map(|l| l.strip_prefix("Condition: "))
                .ok_or_else(|| anyhow::anyhow!("no header"))?;
            Ok(json!({ "condition": condition }).as_object().cloned().unwrap())
        }

        async fn ready(&self) -> bool {
            self.ready
        }
    }

    fn pipeline<X: MetadataExtractor>(
        extractor: X,
        location: &Path,
    ) -> IngestionPipeline<HashingEmbedder, RecursiveSplitter, X> {
        IngestionPipeline::new(
            Arc::new(RetrievalIndex::new(HashingEmbedder::new(64))),
            RecursiveSplitter::new(40, 0).unwrap(),
            extractor,
            location,
        )
    }

    #[tokio::test]
    async fn test_document_tags_apply_to_every_chunk_and_persist() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db = temp_dir.path().join("medical_db");
        let pipeline = pipeline(HeaderLineExtractor { ready: true }, &db);

        let text = "Condition: walnut allergy\n\nPatient reports hives after walnut exposure.\n\nEpinephrine prescribed.";
        let chunks = pipeline.ingest_document("a.md", text).await.unwrap();
        assert!(chunks >= 2);

        let index = pipeline.index();
        assert_eq!(index.len().await, chunks);
        assert_eq!(index.count_by_condition("walnut allergy").await, chunks);
        assert!(db.join(VECTORS_FILE).exists());
        assert!(db.join(METADATA_FILE).exists());

        let fresh: RetrievalIndex<HashingEmbedder> = RetrievalIndex::new(HashingEmbedder::new(64));
        assert!(matches!(
            fresh.reload(&db).await.unwrap(),
            ReloadOutcome::Loaded { entries, .. } if entries == chunks
        ));
    }

    #[tokio::test]
    async fn test_folder_skips_failures_and_continues() {
        let temp_dir = tempfile::tempdir().unwrap();
        let docs = temp_dir.path().join("raw_records");
        std::fs::create_dir_all(docs.join("nested")).unwrap();
        std::fs::write(docs.join("a.md"), "Condition: asthma\nUses an inhaler daily.").unwrap();
        std::fs::write(docs.join("b.txt"), "No header in this record.").unwrap();
        std::fs::write(docs.join("nested/c.markdown"), "Condition: diabetes\nInsulin twice daily.").unwrap();
        std::fs::write(docs.join("scan.pdf"), "binary").unwrap();

        let pipeline = pipeline(HeaderLineExtractor { ready: true }, &temp_dir.path().join("db"));
        let report = pipeline.ingest_folder(&docs).await.unwrap();

        assert_eq!(report.ingested.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].path.ends_with("b.txt"));
        assert!(report.failed[0].error.contains("no header"));
        assert_eq!(pipeline.index().count_by_condition("asthma").await, report.ingested[0].1);
        assert!(pipeline.index().count_by_condition("diabetes").await > 0);
        assert_eq!(pipeline.index().len().await, report.total_chunks());
    }

    #[tokio::test]
    async fn test_save_failure_stops_batch_and_counts_held_chunks() {
        let temp_dir = tempfile::tempdir().unwrap();
        let docs = temp_dir.path().join("raw_records");
        std::fs::create_dir_all(&docs).unwrap();
        std::fs::write(docs.join("a.md"), "Condition: asthma\nUses an inhaler daily.").unwrap();
        std::fs::write(docs.join("b.md"), "Condition: gout\nTakes allopurinol.").unwrap();

        // A regular file where the database directory should be.
        let location = temp_dir.path().join("db");
        std::fs::write(&location, "not a directory").unwrap();

        let pipeline = pipeline(HeaderLineExtractor { ready: true }, &location);
        let report = pipeline.ingest_folder(&docs).await.unwrap();

        assert_eq!(report.ingested.len(), 1);
        assert!(report.ingested[0].0.ends_with("a.md"));
        assert!(report.failed.is_empty());
        assert!(report.save_error.as_deref().unwrap().contains("Failed to save index after a.md"));
        assert_eq!(pipeline.index().len().await, report.total_chunks());
        assert_eq!(pipeline.index().count_by_condition("gout").await, 0);
    }

    #[tokio::test]
    async fn test_health_probe_skips_document() {
        let temp_dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(HeaderLineExtractor { ready: false }, temp_dir.path())
            .with_health_probe(true);

        let err = pipeline
            .ingest_document("a.md", "Condition: asthma\nText.")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unreachable"));
        assert!(pipeline.index().is_empty().await);
    }

    #[tokio::test]
    async fn test_static_tags_and_blank_document() {
        let temp_dir = tempfile::tempdir().unwrap();
        let tags = json!({"source": "cli"}).as_object().cloned().unwrap();
        let pipeline = pipeline(StaticTags(tags), temp_dir.path());

        assert_eq!(pipeline.ingest_document("blank.md", "   \n\n ").await.unwrap(), 0);
        assert_eq!(pipeline.ingest_document("note.md", "Short note.").await.unwrap(), 1);
        let count = pipeline
            .index()
            .aggregate_count(|t| t.get("source") == Some(&json!("cli")))
            .await;
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_missing_folder_is_an_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(StaticTags::default(), temp_dir.path());
        assert!(pipeline.ingest_folder(&temp_dir.path().join("nope")).await.is_err());
    }
}

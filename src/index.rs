//! The retrieval index: embedding space, aligned vector + metadata stores,
//! persistence, semantic and filtered search, exact aggregation.
//!
//! Position `i` in the vector store and position `i` in the metadata store
//! always describe the same chunk. The only mutation paths are [`ingest`]
//! (append to both under one write lock) and [`reload`] (replace both
//! wholesale), so the stores can never drift apart.
//!
//! [`ingest`]: RetrievalIndex::ingest
//! [`reload`]: RetrievalIndex::reload

use std::path::Path;

use tokio::sync::{Mutex, RwLock};

use crate::embeddings::Embedder;
use crate::error::IndexError;
use crate::lock::TimedWriteLockGuard;
use crate::metadata_store::{Chunk, MetadataStore, Tags};
use crate::persistence::{self, ArtifactPaths};
use crate::vector_store::{FlatVectorStore, Neighbor, VectorIndex};

/// Raw candidates fetched per requested result in `filtered_search`.
pub const DEFAULT_OVERFETCH_FACTOR: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub position: usize,
    /// Squared Euclidean distance to the query embedding.
    pub distance: f32,
    pub chunk: Chunk,
}

/// One stored entry: position, vector and chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub position: usize,
    pub vector: Vec<f32>,
    pub chunk: Chunk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    Loaded { entries: usize, dimension: usize },
    /// One or both artifacts are absent; the in-memory index is untouched.
    NothingToLoad,
}

struct IndexState<V> {
    vectors: V,
    metadata: MetadataStore,
}

impl<V: VectorIndex> IndexState<V> {
    fn empty(dimension: usize) -> Self {
        Self {
            vectors: V::with_dimension(dimension),
            metadata: MetadataStore::new(),
        }
    }

    /// Append to both stores or to neither.
    fn append(&mut self, vectors: &[Vec<f32>], chunks: Vec<Chunk>) -> Result<(), IndexError> {
        if vectors.len() != chunks.len() {
            return Err(IndexError::MalformedEmbeddings {
                expected: chunks.len(),
                actual: vectors.len(),
            });
        }
        self.vectors.add(vectors)?;
        self.metadata.append(chunks);
        debug_assert_eq!(self.vectors.len(), self.metadata.len());
        Ok(())
    }

    fn to_hits(&self, neighbors: Vec<Neighbor>) -> Result<Vec<SearchHit>, IndexError> {
        neighbors
            .into_iter()
            .map(|n| {
                Ok(SearchHit {
                    position: n.position,
                    distance: n.distance,
                    chunk: self.metadata.get(n.position)?.clone(),
                })
            })
            .collect()
    }
}

/// Persistent vector index over chunk embeddings plus their tags.
///
/// Reads (`search`, `filtered_search`, `aggregate_count`) share a read lock;
/// `ingest` and `reload` take the write lock only for the in-memory
/// append/swap. Embedding and disk I/O run outside it. Persist and reload
/// are additionally serialised against each other.
pub struct RetrievalIndex<E, V = FlatVectorStore> {
    embedder: E,
    state: RwLock<IndexState<V>>,
    io_lock: Mutex<()>,
}

impl<E: Embedder, V: VectorIndex> RetrievalIndex<E, V> {
    /// An empty index whose dimension is the embedder's declared dimension.
    pub fn new(embedder: E) -> Self {
        let dimension = embedder.dimension();
        tracing::info!(
            model = embedder.model_name(),
            dimension,
            "Created empty retrieval index"
        );
        Self {
            embedder,
            state: RwLock::new(IndexState::empty(dimension)),
            io_lock: Mutex::new(()),
        }
    }

    pub fn embedder(&self) -> &E {
        &self.embedder
    }

    pub fn embedding_model(&self) -> &str {
        self.embedder.model_name()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.metadata.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn dimension(&self) -> usize {
        self.state.read().await.vectors.dimension()
    }

    /// Embed `chunks` in one batched call and append them with their tags.
    ///
    /// Fails without storing anything if the lengths differ, the embedder is
    /// unreachable, or it returns the wrong number or size of vectors.
    pub async fn ingest(&self, chunks: Vec<String>, tags: Vec<Tags>) -> Result<usize, IndexError> {
        if chunks.len() != tags.len() {
            return Err(IndexError::LengthMismatch {
                chunks: chunks.len(),
                tags: tags.len(),
            });
        }
        if chunks.is_empty() {
            return Ok(0);
        }

        let embeddings = self
            .embedder
            .encode(&chunks)
            .await
            .map_err(|e| IndexError::CollaboratorUnreachable(format!("{e:#}")))?;
        if embeddings.len() != chunks.len() {
            return Err(IndexError::MalformedEmbeddings {
                expected: chunks.len(),
                actual: embeddings.len(),
            });
        }

        let count = chunks.len();
        let records: Vec<Chunk> = chunks
            .into_iter()
            .zip(tags)
            .map(|(text, tags)| Chunk { text, tags })
            .collect();

        let total = {
            let mut state = TimedWriteLockGuard::acquire(&self.state, "ingest").await;
            state.append(&embeddings, records)?;
            state.metadata.len()
        };

        tracing::info!(added = count, total, "Ingested chunks");
        Ok(count)
    }

    /// The `k` chunks nearest to `query`, ascending by distance.
    /// Fewer than `k` when the index is smaller; empty on an empty index.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>, IndexError> {
        let k = k.max(1);
        if self.is_empty().await {
            return Ok(vec![]);
        }

        let query_vector = self.embed_query(query).await?;
        let state = self.state.read().await;
        let neighbors = state.vectors.search(&query_vector, k)?;
        let hits = state.to_hits(neighbors)?;

        tracing::debug!(query, k, returned = hits.len(), "Semantic search");
        Ok(hits)
    }

    /// Semantic search restricted to chunks whose tags satisfy `predicate`.
    ///
    /// Only the `k × overfetch_factor` nearest chunks are inspected, in
    /// ascending distance, and the first `k` matches are kept. Matches
    /// outside that window are never seen, so this can return fewer than `k`
    /// results, or none, even when enough matching chunks exist. That is the
    /// price of not scanning the whole index; callers must not assume `k`
    /// results. Use [`aggregate_count`](Self::aggregate_count) for exact
    /// structured questions.
    pub async fn filtered_search<P>(
        &self,
        query: &str,
        predicate: P,
        k: usize,
        overfetch_factor: usize,
    ) -> Result<Vec<SearchHit>, IndexError>
    where
        P: Fn(&Tags) -> bool,
    {
        let k = k.max(1);
        let window = k.saturating_mul(overfetch_factor.max(1));
        if self.is_empty().await {
            return Ok(vec![]);
        }

        let query_vector = self.embed_query(query).await?;
        let state = self.state.read().await;
        let neighbors = state.vectors.search(&query_vector, window)?;
        let inspected = neighbors.len();

        let mut hits = Vec::with_capacity(k);
        for neighbor in neighbors {
            let chunk = state.metadata.get(neighbor.position)?;
            if !predicate(&chunk.tags) {
                continue;
            }
            hits.push(SearchHit {
                position: neighbor.position,
                distance: neighbor.distance,
                chunk: chunk.clone(),
            });
            if hits.len() == k {
                break;
            }
        }

        if hits.len() < k {
            tracing::debug!(
                query,
                k,
                window,
                inspected,
                returned = hits.len(),
                "Filtered search exhausted its candidate window"
            );
        }
        Ok(hits)
    }

    /// Exact number of chunks whose tags satisfy `predicate`: a full scan of
    /// the metadata, no embedding and no vector search.
    pub async fn aggregate_count<P>(&self, predicate: P) -> usize
    where
        P: Fn(&Tags) -> bool,
    {
        self.state.read().await.metadata.count_where(predicate)
    }

    /// Exact number of chunks tagged `condition == name`.
    pub async fn count_by_condition(&self, name: &str) -> usize {
        self.aggregate_count(|tags| tags.get("condition").and_then(|v| v.as_str()) == Some(name))
            .await
    }

    /// Write both artifacts under `location`, creating it if needed.
    /// On failure the previously committed pair stays readable.
    pub async fn persist(&self, location: impl AsRef<Path>) -> Result<(), IndexError> {
        let paths = ArtifactPaths::new(location);
        let _io = self.io_lock.lock().await;

        let (vector_bytes, metadata_bytes, entries) = {
            let state = self.state.read().await;
            let metadata = persistence::encode_metadata(state.metadata.records())?;
            let vectors = persistence::encode_vectors(
                state.vectors.dimension(),
                state.vectors.as_raw(),
                &metadata,
            );
            (vectors, metadata, state.metadata.len())
        };

        persistence::write_pair(&paths, &vector_bytes, &metadata_bytes).await?;
        tracing::info!(entries, location = ?paths.dir, "Index persisted");
        Ok(())
    }

    /// Replace the in-memory index with the pair stored at `location`.
    ///
    /// The dimension comes from the stored vectors, not from the embedder.
    /// Returns [`ReloadOutcome::NothingToLoad`] when either artifact is
    /// missing, leaving the current state as it was.
    pub async fn reload(&self, location: impl AsRef<Path>) -> Result<ReloadOutcome, IndexError> {
        let paths = ArtifactPaths::new(location);
        let _io = self.io_lock.lock().await;

        let Some(snapshot) = persistence::read_pair(&paths).await? else {
            tracing::info!(location = ?paths.dir, "No existing index found");
            return Ok(ReloadOutcome::NothingToLoad);
        };

        let vectors = V::from_raw(snapshot.dimension, snapshot.vectors)?;
        if vectors.len() != snapshot.records.len() {
            return Err(IndexError::CorruptIndex(format!(
                "{} vectors but {} metadata records",
                vectors.len(),
                snapshot.records.len()
            )));
        }

        let dimension = vectors.dimension();
        if dimension != self.embedder.dimension() {
            tracing::warn!(
                stored = dimension,
                embedder = self.embedder.dimension(),
                model = self.embedder.model_name(),
                "Stored index dimension differs from the embedding model; new ingests will be rejected"
            );
        }

        let entries = snapshot.records.len();
        {
            let mut state = TimedWriteLockGuard::acquire(&self.state, "reload").await;
            *state = IndexState {
                vectors,
                metadata: MetadataStore::from_records(snapshot.records),
            };
        }

        tracing::info!(entries, dimension, location = ?paths.dir, "Loaded index from disk");
        Ok(ReloadOutcome::Loaded { entries, dimension })
    }

    /// Ordered copy of every (position, vector, chunk) entry.
    pub async fn entries(&self) -> Vec<IndexEntry> {
        let state = self.state.read().await;
        state
            .metadata
            .iter()
            .enumerate()
            .map(|(position, chunk)| IndexEntry {
                position,
                vector: state
                    .vectors
                    .vector(position)
                    .map(<[f32]>::to_vec)
                    .unwrap_or_default(),
                chunk: chunk.clone(),
            })
            .collect()
    }

    pub async fn stats(&self) -> serde_json::Value {
        let state = self.state.read().await;
        serde_json::json!({
            "entries": state.metadata.len(),
            "dimension": state.vectors.dimension(),
            "embedding_model": self.embedder.model_name(),
        })
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>, IndexError> {
        self.embedder
            .encode_query(query)
            .await
            .map_err(|e| IndexError::CollaboratorUnreachable(format!("{e:#}")))
    }
}

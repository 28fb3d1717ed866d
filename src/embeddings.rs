use anyhow::{Context, Result, anyhow, bail};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::num::NonZeroUsize;
use tokio::sync::RwLock;

const QUERY_CACHE_SIZE: NonZeroUsize = match NonZeroUsize::new(1000) {
    Some(size) => size,
    None => NonZeroUsize::MIN,
};

const DIMENSION_PROBE: &str = "dimension probe";

/// Text → vector collaborator.
///
/// `encode` returns one vector per input, in input order, each of length
/// `dimension()`. The index checks both properties and never trusts them.
pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;

    fn dimension(&self) -> usize;

    fn encode(&self, texts: &[String]) -> impl Future<Output = Result<Vec<Vec<f32>>>> + Send;

    fn encode_query(&self, text: &str) -> impl Future<Output = Result<Vec<f32>>> + Send {
        async move {
            let batch = [text.to_string()];
            let mut vectors = self.encode(&batch).await?;
            vectors
                .pop()
                .ok_or_else(|| anyhow!("Embedding collaborator returned no vector for query"))
        }
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

/// `/api/embed` answers with `embeddings`; older servers and some models
/// answer a single input with `embedding`.
#[derive(Deserialize)]
struct EmbedReply {
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
    #[serde(default)]
    embedding: Option<Vec<f32>>,
}

impl EmbedReply {
    fn into_vectors(self) -> Vec<Vec<f32>> {
        match self.embedding {
            Some(single) if self.embeddings.is_empty() => vec![single],
            _ => self.embeddings,
        }
    }
}

#[derive(Deserialize)]
struct ModelList {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    name: String,
}

/// `nomic-embed-text` is satisfied by `nomic-embed-text:latest`; an explicit
/// tag must match exactly.
fn is_pulled(available: &[String], model: &str) -> bool {
    available.iter().any(|name| {
        name == model || (!model.contains(':') && name.split(':').next() == Some(model))
    })
}

/// Embedding service backed by Ollama's `/api/embed`, with an LRU cache for
/// query embeddings.
pub struct EmbeddingService {
    client: reqwest::Client,
    ollama_url: String,
    model: String,
    dimension: usize,
    batch_size: usize,
    query_cache: RwLock<LruCache<String, Vec<f32>>>,
}

impl EmbeddingService {
    /// Connect, verify the model is pulled, and probe its output dimension.
    pub async fn connect(ollama_url: &str, model: &str, batch_size: usize) -> Result<Self> {
        tracing::info!(ollama_url, model, batch_size, "Connecting to Ollama");

        let mut service = Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(1200))
                .build()
                .context("Failed to build HTTP client")?,
            ollama_url: ollama_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            dimension: 0,
            batch_size: batch_size.max(1),
            query_cache: RwLock::new(LruCache::new(QUERY_CACHE_SIZE)),
        };

        let available = service.pulled_models().await?;
        if !is_pulled(&available, &service.model) {
            bail!(
                "Model '{}' not found. Available: {:?}. Run: ollama pull {}",
                service.model,
                available,
                service.model
            );
        }

        let probe = service.embed_one(DIMENSION_PROBE).await?;
        if probe.is_empty() {
            bail!("Model '{model}' returned an empty embedding");
        }
        service.dimension = probe.len();
        tracing::info!(
            model = %service.model,
            dimension = service.dimension,
            "Embedding dimension detected"
        );

        Ok(service)
    }

    /// Names from `/api/tags`. Failing to reach the server here is what
    /// callers see when Ollama is not running.
    async fn pulled_models(&self) -> Result<Vec<String>> {
        let not_running = || {
            format!(
                "Cannot connect to Ollama at {}. Make sure Ollama is running.",
                self.ollama_url
            )
        };
        let response = self
            .client
            .get(format!("{}/api/tags", self.ollama_url))
            .timeout(std::time::Duration::from_secs(5))
            .send()
            .await
            .with_context(not_running)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("{status} - {body}")).with_context(not_running);
        }

        let list: ModelList = response
            .json()
            .await
            .context("Unexpected model list from Ollama")?;
        tracing::debug!(models = list.models.len(), "Connected to Ollama");
        Ok(list.models.into_iter().map(|m| m.name).collect())
    }

    async fn post_embed(&self, input: &[String]) -> Result<Vec<Vec<f32>>> {
        let request = EmbedRequest {
            model: &self.model,
            input,
        };
        let response = self
            .client
            .post(format!("{}/api/embed", self.ollama_url))
            .json(&request)
            .send()
            .await
            .with_context(|| format!("Cannot reach Ollama at {}", self.ollama_url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Ollama API error: {status} - {body}");
        }

        let reply: EmbedReply = response
            .json()
            .await
            .context("Unexpected embedding response from Ollama")?;
        Ok(reply.into_vectors())
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        self.post_embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No embedding returned from Ollama"))
    }

    /// One request per batch; a reply of the wrong size is retried one text
    /// at a time.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let vectors = self.post_embed(texts).await?;
        if vectors.len() == texts.len() {
            return Ok(vectors);
        }

        tracing::warn!(
            model = %self.model,
            returned = vectors.len(),
            expected = texts.len(),
            "Batch embedding size mismatch, falling back to sequential"
        );
        let mut result = Vec::with_capacity(texts.len());
        for text in texts {
            result.push(self.embed_one(text).await?);
        }
        Ok(result)
    }
}

impl Embedder for EmbeddingService {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let total_batches = texts.len().div_ceil(self.batch_size);
        let mut embeddings = Vec::with_capacity(texts.len());
        for (batch_idx, batch) in texts.chunks(self.batch_size).enumerate() {
            tracing::debug!(
                "Batch {}/{}: generating embeddings for {} chunks",
                batch_idx + 1,
                total_batches,
                batch.len()
            );
            embeddings.extend(self.embed_batch(batch).await?);
        }
        Ok(embeddings)
    }

    async fn encode_query(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(cached) = self.query_cache.write().await.get(text) {
            return Ok(cached.clone());
        }

        let embedding = self.embed_one(text).await?;
        self.query_cache
            .write()
            .await
            .put(text.to_string(), embedding.clone());
        Ok(embedding)
    }
}

/// Offline embedder: feature-hashed term counts, L2-normalised.
///
/// Carries no semantics beyond shared vocabulary, but is deterministic and
/// needs no server, which makes it suitable for air-gapped use and tests.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimension];
        for token in tokenize(text) {
            let bucket = (fnv1a(token.as_bytes()) % self.dimension as u64) as usize;
            vector[bucket] += 1.0;
        }
        normalize(&mut vector);
        vector
    }
}

impl Embedder for HashingEmbedder {
    fn model_name(&self) -> &str {
        "hashing"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed(t)).collect())
    }
}

/// Runtime choice between the configured embedding backends.
pub enum EmbeddingProvider {
    Ollama(EmbeddingService),
    Hashing(HashingEmbedder),
}

impl Embedder for EmbeddingProvider {
    fn model_name(&self) -> &str {
        match self {
            Self::Ollama(service) => service.model_name(),
            Self::Hashing(hashing) => hashing.model_name(),
        }
    }

    fn dimension(&self) -> usize {
        match self {
            Self::Ollama(service) => service.dimension(),
            Self::Hashing(hashing) => hashing.dimension(),
        }
    }

    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        match self {
            Self::Ollama(service) => service.encode(texts).await,
            Self::Hashing(hashing) => hashing.encode(texts).await,
        }
    }

    async fn encode_query(&self, text: &str) -> Result<Vec<f32>> {
        match self {
            Self::Ollama(service) => service.encode_query(text).await,
            Self::Hashing(hashing) => hashing.encode_query(text).await,
        }
    }
}

/// Lowercase alphanumeric terms of at least 3 characters.
fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.len() >= 3)
        .map(|token| token.to_lowercase())
        .collect()
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    bytes.iter().fold(OFFSET_BASIS, |hash, &byte| {
        (hash ^ byte as u64).wrapping_mul(PRIME)
    })
}

fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

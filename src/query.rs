use std::sync::Arc;

use crate::embeddings::Embedder;
use crate::error::IndexError;
use crate::filter::TagFilter;
use crate::index::{DEFAULT_OVERFETCH_FACTOR, RetrievalIndex, SearchHit};
use crate::inference::{ChatMessage, ChatModel, CompletionOptions};
use crate::vector_store::{FlatVectorStore, VectorIndex};

pub const CONTEXT_SEPARATOR: &str = "\n---\n";
pub const DEFAULT_TOP_K: usize = 5;
const ANSWER_TEMPERATURE: f32 = 0.1;
const ANSWER_MAX_TOKENS: u32 = 2048;

#[derive(Debug, Clone)]
pub struct Answer {
    /// Model output verbatim, or an `Inference error: ...` line.
    pub text: String,
    pub sources: Vec<SearchHit>,
}

/// Retrieves context for a question and asks the answer model.
pub struct QueryOrchestrator<E, M, V = FlatVectorStore> {
    index: Arc<RetrievalIndex<E, V>>,
    model: M,
    top_k: usize,
    overfetch_factor: usize,
}

impl<E: Embedder, M: ChatModel, V: VectorIndex> QueryOrchestrator<E, M, V> {
    pub fn new(index: Arc<RetrievalIndex<E, V>>, model: M) -> Self {
        Self {
            index,
            model,
            top_k: DEFAULT_TOP_K,
            overfetch_factor: DEFAULT_OVERFETCH_FACTOR,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }

    pub fn with_overfetch_factor(mut self, factor: usize) -> Self {
        self.overfetch_factor = factor.max(1);
        self
    }

    /// Context chunks for `question`; filtered when `filter` has constraints.
    pub async fn retrieve(&self, question: &str, filter: Option<&TagFilter>) -> Result<Vec<SearchHit>, IndexError> {
        match filter.filter(|f| !f.is_empty()) {
            Some(filter) => {
                self.index
                    .filtered_search(question, |tags| filter.matches(tags), self.top_k, self.overfetch_factor)
                    .await
            }
            None => self.index.search(question, self.top_k).await,
        }
    }

    /// Answer `question` from retrieved context.
    ///
    /// Retrieval errors are returned; an inference failure is reported in
    /// the answer text instead.
    pub async fn ask(&self, question: &str, filter: Option<&TagFilter>) -> Result<Answer, IndexError> {
        let sources = self.retrieve(question, filter).await?;
        let context = build_context(&sources);
        let prompt = build_prompt(&context, question);

        let options = CompletionOptions {
            temperature: Some(ANSWER_TEMPERATURE),
            max_tokens: Some(ANSWER_MAX_TOKENS),
            json_mode: false,
        };

        let text = match self.model.complete(&[ChatMessage::user(prompt)], &options).await {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(model = self.model.model_name(), error = %format!("{e:#}"), "Inference failed");
                format!("Inference error: {e:#}")
            }
        };

        tracing::info!(question, sources = sources.len(), "Answered question");
        Ok(Answer { text, sources })
    }

    /// Exact count of chunks matching `filter`.
    pub async fn count(&self, filter: &TagFilter) -> usize {
        self.index.aggregate_count(|tags| filter.matches(tags)).await
    }
}

pub fn build_context(hits: &[SearchHit]) -> String {
    hits.iter()
        .map(|h| h.chunk.text.as_str())
        .collect::<Vec<_>>()
        .join(CONTEXT_SEPARATOR)
}

pub fn build_prompt(context: &str, question: &str) -> String {
    format!(
        "Use the provided context to answer the question. If unsure, say 'Incomplete data'.\n\n\
         CONTEXT:\n{context}\n\n\
         QUESTION: {question}"
    )
}

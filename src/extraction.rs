//! Per-document tag extraction.
//!
//! Every chunk of a document gets the same tag map. It comes either from a
//! language model reading the document header or from fixed user-supplied
//! tags.

use std::future::Future;

use anyhow::{Context, Result, bail};
use serde_json::Value;

use crate::inference::{ChatMessage, ChatModel, CompletionOptions};
use crate::metadata_store::Tags;

/// Characters of the document shown to the model.
pub const HEADER_CHARS: usize = 2000;

const EXTRACTION_INSTRUCTION: &str = "Identify the following fields from this medical record header: \
     patient_id, primary_condition, visit_year. Return ONLY a JSON object.";

pub trait MetadataExtractor: Send + Sync {
    fn extract(&self, document: &str) -> impl Future<Output = Result<Tags>> + Send;

    /// Whether the backing service can take requests right now.
    fn ready(&self) -> impl Future<Output = bool> + Send {
        async { true }
    }
}

/// Asks a chat model for header fields and coerces its reply into tags.
pub struct LlmHeaderExtractor<M> {
    model: M,
}

impl<M: ChatModel> LlmHeaderExtractor<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }

    fn prompt(document: &str) -> String {
        let header: String = document.chars().take(HEADER_CHARS).collect();
        format!("{EXTRACTION_INSTRUCTION}\n\nTEXT:\n{header}")
    }
}

impl<M: ChatModel> MetadataExtractor for LlmHeaderExtractor<M> {
    async fn extract(&self, document: &str) -> Result<Tags> {
        let options = CompletionOptions {
            json_mode: true,
            ..CompletionOptions::default()
        };
        let reply = self
            .model
            .complete(&[ChatMessage::user(Self::prompt(document))], &options)
            .await
            .context("Metadata extraction request failed")?;

        let value: Value = serde_json::from_str(reply.trim())
            .with_context(|| format!("Extraction model returned non-JSON reply: {reply}"))?;
        let tags = coerce_tags(value)?;
        tracing::debug!(model = self.model.model_name(), fields = tags.len(), "Extracted document tags");
        Ok(tags)
    }

    async fn ready(&self) -> bool {
        self.model.health().await
    }
}

/// Fixed tags applied to every document.
#[derive(Debug, Clone, Default)]
pub struct StaticTags(pub Tags);

impl MetadataExtractor for StaticTags {
    async fn extract(&self, _document: &str) -> Result<Tags> {
        Ok(self.0.clone())
    }
}

/// Turn a model's JSON reply into a tag map.
///
/// Accepts an object, an object whose only value is an object or array
/// (e.g. `{"records": [...]}`), or an array whose first element is an
/// object.
pub fn coerce_tags(value: Value) -> Result<Tags> {
    match value {
        Value::Object(map) if map.len() == 1 => {
            let only = map.values().next().cloned();
            match only {
                Some(inner @ (Value::Object(_) | Value::Array(_))) => coerce_tags(inner),
                _ => Ok(map),
            }
        }
        Value::Object(map) => Ok(map),
        Value::Array(items) => match items.into_iter().next() {
            Some(Value::Object(map)) => Ok(map),
            Some(other) => bail!("Expected an object in extraction array, got {other}"),
            None => bail!("Extraction model returned an empty array"),
        },
        other => bail!("Expected a JSON object from extraction model, got {other}"),
    }
}

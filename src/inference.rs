use std::future::Future;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tokio::time::Duration;

const COMPLETION_TIMEOUT: Duration = Duration::from_secs(120);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Per-request generation settings. `None` leaves the server default.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Ask the server for a JSON object reply.
    pub json_mode: bool,
}

/// Chat-completion collaborator.
pub trait ChatModel: Send + Sync {
    fn model_name(&self) -> &str;

    fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> impl Future<Output = Result<String>> + Send;

    /// Whether the endpoint is reachable. Remote providers are assumed up.
    fn health(&self) -> impl Future<Output = bool> + Send {
        async { true }
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize, Debug)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize, Debug)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl ChatCompletionResponse {
    fn into_text(self) -> Result<String> {
        self.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| anyhow!("Completion response contained no choices"))
    }
}

/// OpenAI-compatible chat-completions client (llama.cpp server, OpenAI, ...).
pub struct InferenceService {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl InferenceService {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .timeout(COMPLETION_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl ChatModel for InferenceService {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[ChatMessage], options: &CompletionOptions) -> Result<String> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            response_format: options.json_mode.then_some(ResponseFormat {
                kind: "json_object",
            }),
        };

        let start = std::time::Instant::now();
        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("Failed to contact inference server at {}", self.base_url))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Inference API error: {} - {}", status, body));
        }

        let payload: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse completion response")?;

        tracing::debug!(
            model = %self.model,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Completion received"
        );
        payload.into_text()
    }

    async fn health(&self) -> bool {
        match self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(url = %self.base_url, error = %e, "Health probe failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_omits_unset_options() {
        let messages = vec![ChatMessage::user("hi")];
        let request = ChatCompletionRequest {
            model: "gemma-3-27b",
            messages: &messages,
            temperature: None,
            max_tokens: None,
            response_format: None,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"model": "gemma-3-27b", "messages": [{"role": "user", "content": "hi"}]})
        );
    }

    #[test]
    fn test_request_json_mode() {
        let messages = vec![ChatMessage::user("extract")];
        let request = ChatCompletionRequest {
            model: "m",
            messages: &messages,
            temperature: Some(0.1),
            max_tokens: Some(2048),
            response_format: Some(ResponseFormat {
                kind: "json_object",
            }),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["response_format"], json!({"type": "json_object"}));
        assert_eq!(value["max_tokens"], 2048);
    }

    #[test]
    fn test_response_text_extraction() {
        let payload: ChatCompletionResponse = serde_json::from_value(json!({
            "choices": [{"message": {"role": "assistant", "content": "Patient A."}}]
        }))
        .unwrap();
        assert_eq!(payload.into_text().unwrap(), "Patient A.");

        let empty: ChatCompletionResponse = serde_json::from_value(json!({"choices": []})).unwrap();
        assert!(empty.into_text().is_err());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_reported() {
        let service = InferenceService::new("http://127.0.0.1:59998/", "sk-no-key-required", "m").unwrap();
        assert_eq!(service.base_url(), "http://127.0.0.1:59998");
        assert!(!service.health().await);

        let err = service
            .complete(&[ChatMessage::user("hello")], &CompletionOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to contact inference server"));
    }
}

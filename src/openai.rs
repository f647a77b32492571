use crate::completion::{ChatMessage, ChatModel};
use crate::config::{env_opt, env_or, env_required};
use crate::embeddings::{Embedder, Embedding};
use crate::error::{RagError, Result};
use crate::retry::{Failure, RetryPolicy};
use async_trait::async_trait;
use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
// Matches the 3072-dimension index the service was built around
const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-large";
const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_BATCH_SIZE: usize = 100;

/// Configuration for an OpenAI-compatible API
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub embedding_model: String,
    /// Ask the API to shorten vectors to this size
    pub embedding_dimensions: Option<u32>,
    pub chat_model: String,
    /// Maximum inputs per embeddings request
    pub batch_size: usize,
    pub generation: GenerationConfig,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        OpenAiConfig {
            api_key: api_key.into(),
            base_url: base_url.into(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            embedding_dimensions: None,
            chat_model: DEFAULT_CHAT_MODEL.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            generation: GenerationConfig::default(),
        }
    }

    /// Create a new configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let api_key = env_required("OPENAI_API_KEY")?;
        let base_url = env_opt("OPENAI_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let embedding_dimensions = match env_opt("OPENAI_EMBEDDING_DIMENSIONS") {
            Some(_) => Some(env_or("OPENAI_EMBEDDING_DIMENSIONS", 0u32)?),
            None => None,
        };

        let batch_size = env_or("EMBEDDING_BATCH_SIZE", DEFAULT_BATCH_SIZE)?;
        if batch_size == 0 {
            return Err(RagError::invalid_input("EMBEDDING_BATCH_SIZE must be at least 1"));
        }

        Ok(OpenAiConfig {
            embedding_model: env_opt("OPENAI_EMBEDDING_MODEL")
                .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string()),
            embedding_dimensions,
            chat_model: env_opt("OPENAI_CHAT_MODEL")
                .unwrap_or_else(|| DEFAULT_CHAT_MODEL.to_string()),
            batch_size,
            ..OpenAiConfig::new(api_key, base_url)
        })
    }
}

/// Sampling parameters for answer generation
#[derive(Debug, Clone, Serialize)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        GenerationConfig {
            temperature: 0.3,
            top_p: 0.9,
            max_tokens: 800,
        }
    }
}

/// Client for an OpenAI-compatible embeddings and chat API
#[derive(Clone)]
pub struct OpenAiClient {
    config: OpenAiConfig,
    retry: RetryPolicy,
    client: reqwest::Client,
}

impl OpenAiClient {
    /// Create a new client
    pub fn new(config: OpenAiConfig, retry: RetryPolicy) -> Self {
        let client = reqwest::Client::new();
        OpenAiClient {
            config,
            retry,
            client,
        }
    }

    /// Get the client configuration
    pub fn config(&self) -> &OpenAiConfig {
        &self.config
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), endpoint)
    }

    /// POST `body` to `endpoint` and decode the JSON reply, retrying per policy
    async fn post_json<B, R>(&self, service: &'static str, endpoint: &str, body: &B) -> Result<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = self.url(endpoint);
        let url = url.as_str();
        let client = &self.client;
        let api_key = self.config.api_key.as_str();
        let timeout = self.retry.timeout;

        self.retry
            .run(service, || async move {
                let response = client
                    .post(url)
                    .bearer_auth(api_key)
                    .timeout(timeout)
                    .json(body)
                    .send()
                    .await
                    .map_err(Failure::from_reqwest)?;

                let status = response.status();
                if !status.is_success() {
                    let error_text = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "Unknown error".to_string());
                    return Err(Failure::from_status(status, &error_text));
                }

                response.json::<R>().await.map_err(|e| {
                    Failure::Permanent(format!("Failed to decode response: {}", e))
                })
            })
            .await
    }

    /// Embed one batch, restoring input order from the returned indices
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        let request = EmbeddingRequest {
            model: &self.config.embedding_model,
            input: texts,
            dimensions: self.config.embedding_dimensions,
        };

        let response: EmbeddingResponse = self.post_json("embeddings", "embeddings", &request).await?;

        if response.data.len() != texts.len() {
            return Err(RagError::upstream(
                "embeddings",
                format!(
                    "Mismatch between request and response counts: {} vs {}",
                    texts.len(),
                    response.data.len()
                ),
            ));
        }

        let mut slots: Vec<Option<Embedding>> = vec![None; texts.len()];
        for item in response.data {
            let slot = slots.get_mut(item.index).ok_or_else(|| {
                RagError::upstream(
                    "embeddings",
                    format!("response index {} out of range", item.index),
                )
            })?;
            *slot = Some(Embedding {
                values: item.embedding,
            });
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(i, slot)| {
                slot.ok_or_else(|| {
                    RagError::upstream("embeddings", format!("missing embedding for input {}", i))
                })
            })
            .collect()
    }
}

#[async_trait]
impl Embedder for OpenAiClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let batches = texts.len().div_ceil(self.config.batch_size);
        let mut embeddings = Vec::with_capacity(texts.len());

        for (i, batch) in texts.chunks(self.config.batch_size).enumerate() {
            debug!(
                "Embedding batch {}/{} ({} texts)",
                i + 1,
                batches,
                batch.len()
            );
            embeddings.extend(self.embed_batch(batch).await?);
        }

        Ok(embeddings)
    }
}

#[async_trait]
impl ChatModel for OpenAiClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let request = ChatRequest {
            model: &self.config.chat_model,
            messages,
            temperature: self.config.generation.temperature,
            top_p: self.config.generation.top_p,
            max_tokens: self.config.generation.max_tokens,
        };

        let response: ChatResponse = self
            .post_json("completion", "chat/completions", &request)
            .await?;

        // Extract the generated text from the response
        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| RagError::upstream("completion", "No response generated"))
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<u32>,
}

#[derive(Deserialize, Debug)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize, Debug)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    top_p: f32,
    max_tokens: u32,
}

#[derive(Deserialize, Debug)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize, Debug)]
struct ResponseMessage {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(server: &MockServer, batch_size: usize, max_attempts: u32) -> OpenAiClient {
        let mut config = OpenAiConfig::new("test-key", server.uri());
        config.batch_size = batch_size;
        let retry = RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            timeout: Duration::from_secs(5),
        };
        OpenAiClient::new(config, retry)
    }

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_from_env_keeps_default_sampling() {
        std::env::set_var("OPENAI_API_KEY", "sk-test");
        let config = OpenAiConfig::from_env().unwrap();
        let defaults = GenerationConfig::default();

        assert_eq!(config.api_key, "sk-test");
        assert_eq!(config.generation.max_tokens, defaults.max_tokens);
        assert!((config.generation.temperature - defaults.temperature).abs() < f32::EPSILON);
        assert!((config.generation.top_p - defaults.top_p).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_embed_preserves_order_across_batches() {
        let server = MockServer::start().await;

        // Each batch answers out of order
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_partial_json(json!({"input": ["a", "b"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"index": 1, "embedding": [2.0, 0.0]},
                    {"index": 0, "embedding": [1.0, 0.0]}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(body_partial_json(json!({"input": ["c"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"index": 0, "embedding": [3.0, 0.0]}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server, 2, 1);
        let embeddings = client.embed(&texts(&["a", "b", "c"])).await.unwrap();

        let firsts: Vec<f32> = embeddings.iter().map(|e| e.values[0]).collect();
        assert_eq!(firsts, vec![1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn test_embed_retries_server_errors() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"index": 0, "embedding": [0.5]}]
            })))
            .mount(&server)
            .await;

        let client = test_client(&server, 10, 3);
        let embedding = client.embed_one("karma").await.unwrap();
        assert_eq!(embedding.values, vec![0.5]);
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad model"))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server, 10, 3);
        let err = client.embed(&texts(&["x"])).await.unwrap_err();
        assert!(err.is_upstream());
        assert!(err.to_string().contains("bad model"));
    }

    #[tokio::test]
    async fn test_count_mismatch_is_rejected() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"index": 0, "embedding": [0.5]}]
            })))
            .mount(&server)
            .await;

        let client = test_client(&server, 10, 1);
        assert!(client.embed(&texts(&["x", "y"])).await.is_err());
    }

    #[tokio::test]
    async fn test_complete_returns_first_choice() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(json!({
                "model": "gpt-4o-mini",
                "messages": [{"role": "system", "content": "be brief"}, {"role": "user", "content": "who is Sanjaya?"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "The charioteer-narrator."}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server, 10, 1);
        let answer = client
            .complete(&[
                ChatMessage::system("be brief"),
                ChatMessage::user("who is Sanjaya?"),
            ])
            .await
            .unwrap();
        assert_eq!(answer, "The charioteer-narrator.");
    }

    #[tokio::test]
    async fn test_complete_without_choices_fails() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;

        let client = test_client(&server, 10, 1);
        assert!(client.complete(&[ChatMessage::user("hi")]).await.is_err());
    }
}

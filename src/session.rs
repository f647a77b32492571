use crate::completion::{ChatMessage, Role};
use crate::config::env_opt;
use crate::error::{RagError, Result};
use crate::retry::{Failure, RetryPolicy};
use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

const SERVICE: &str = "session-store";

/// A rating left by a user on an answer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feedback {
    #[serde(default)]
    pub session_id: Option<String>,
    pub rating: u8,
    #[serde(default)]
    pub feedback: Option<String>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub answer: Option<String>,
}

impl Feedback {
    /// Ratings go from 1 to 5; low ratings must say what went wrong
    pub fn validate(&self) -> Result<()> {
        if !(1..=5).contains(&self.rating) {
            return Err(RagError::invalid_input(format!(
                "rating must be between 1 and 5, got {}",
                self.rating
            )));
        }

        let has_text = self
            .feedback
            .as_deref()
            .is_some_and(|text| !text.trim().is_empty());
        if self.should_ask_feedback() && !has_text {
            return Err(RagError::invalid_input(
                "feedback text is required for ratings of 3 or lower",
            ));
        }
        Ok(())
    }

    pub fn should_ask_feedback(&self) -> bool {
        self.rating <= 3
    }
}

/// Conversation history keyed by conversation id
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// The newest `limit` turns, oldest first
    async fn history(&self, conversation_id: &str, limit: usize) -> Result<Vec<ChatMessage>>;

    /// Append turns in order
    async fn append(&self, conversation_id: &str, turns: &[ChatMessage]) -> Result<()>;

    /// Validate and record feedback, returning its id
    async fn store_feedback(&self, feedback: &Feedback) -> Result<String>;
}

/// In-process store used when no Supabase credentials are configured
#[derive(Default)]
pub struct MemorySessionStore {
    conversations: Mutex<HashMap<String, Vec<ChatMessage>>>,
    feedback: Mutex<Vec<Feedback>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn feedback_count(&self) -> usize {
        self.feedback.lock().await.len()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn history(&self, conversation_id: &str, limit: usize) -> Result<Vec<ChatMessage>> {
        let conversations = self.conversations.lock().await;
        Ok(conversations
            .get(conversation_id)
            .map(|turns| turns[turns.len().saturating_sub(limit)..].to_vec())
            .unwrap_or_default())
    }

    async fn append(&self, conversation_id: &str, turns: &[ChatMessage]) -> Result<()> {
        self.conversations
            .lock()
            .await
            .entry(conversation_id.to_string())
            .or_default()
            .extend(turns.iter().cloned());
        Ok(())
    }

    async fn store_feedback(&self, feedback: &Feedback) -> Result<String> {
        feedback.validate()?;
        self.feedback.lock().await.push(feedback.clone());
        Ok(Uuid::new_v4().to_string())
    }
}

/// Configuration for Supabase
#[derive(Debug, Clone)]
pub struct SupabaseConfig {
    pub url: String,
    pub api_key: String,
}

impl SupabaseConfig {
    /// Read credentials; `None` when the store isn't configured
    pub fn from_env() -> Option<Self> {
        let url = env_opt("SUPABASE_URL")?;
        let api_key = env_opt("SUPABASE_KEY").or_else(|| env_opt("SUPABASE_ANON_KEY"))?;
        Some(SupabaseConfig { url, api_key })
    }
}

/// Session store backed by Supabase's REST interface
pub struct SupabaseSessionStore {
    config: SupabaseConfig,
    retry: RetryPolicy,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct MessageRow {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct FeedbackRow {
    id: serde_json::Value,
}

impl SupabaseSessionStore {
    pub fn new(config: SupabaseConfig, retry: RetryPolicy) -> Self {
        SupabaseSessionStore {
            config,
            retry,
            client: reqwest::Client::new(),
        }
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.config.url.trim_end_matches('/'), table)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header("apikey", &self.config.api_key)
            .bearer_auth(&self.config.api_key)
            .timeout(self.retry.timeout)
    }

    /// Send a request built by `build` and return the body on success
    async fn send<F>(&self, build: F) -> Result<String>
    where
        F: Fn() -> reqwest::RequestBuilder + Sync,
    {
        let build = &build;
        self.retry
            .run(SERVICE, || async move {
                let response = build().send().await.map_err(Failure::from_reqwest)?;
                let status = response.status();
                let body = response.text().await.map_err(Failure::from_reqwest)?;
                if !status.is_success() {
                    return Err(Failure::from_status(status, &body));
                }
                Ok(body)
            })
            .await
    }

    /// Create the conversation row, or bump its `updatedAt`
    async fn touch_conversation(&self, conversation_id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let url = format!("{}?on_conflict=id", self.table_url("conversations"));
        let row = json!({
            "id": conversation_id,
            "title": format!("Bhagavad Gita Chat - {}", Utc::now().format("%Y-%m-%d %H:%M")),
            "createdAt": now,
            "updatedAt": now,
        });

        self.send(|| {
            self.request(reqwest::Method::POST, &url)
                .header("Prefer", "resolution=merge-duplicates,return=minimal")
                .json(&row)
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for SupabaseSessionStore {
    async fn history(&self, conversation_id: &str, limit: usize) -> Result<Vec<ChatMessage>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let url = self.table_url("messages");
        let limit = limit.to_string();
        let filter = format!("eq.{}", conversation_id);

        let body = self
            .send(|| {
                self.request(reqwest::Method::GET, &url).query(&[
                    ("select", "role,content,createdAt"),
                    ("conversationId", filter.as_str()),
                    ("order", "createdAt.desc"),
                    ("limit", limit.as_str()),
                ])
            })
            .await?;

        let rows: Vec<MessageRow> = serde_json::from_str(&body)
            .map_err(|e| RagError::upstream(SERVICE, format!("Failed to parse messages: {}", e)))?;

        // Newest first on the wire; the prompt wants oldest first
        let history: Vec<ChatMessage> = rows
            .into_iter()
            .rev()
            .filter_map(|row| Role::parse(&row.role).map(|role| ChatMessage::new(role, row.content)))
            .collect();

        debug!(
            "Loaded {} prior turns for conversation {}",
            history.len(),
            conversation_id
        );
        Ok(history)
    }

    async fn append(&self, conversation_id: &str, turns: &[ChatMessage]) -> Result<()> {
        if turns.is_empty() {
            return Ok(());
        }

        self.touch_conversation(conversation_id).await?;

        let url = self.table_url("messages");
        let base = Utc::now();
        let rows: Vec<serde_json::Value> = turns
            .iter()
            .enumerate()
            .map(|(i, turn)| {
                // Offset by a millisecond per turn so ordering by createdAt is stable
                let created_at = base + chrono::Duration::milliseconds(i as i64);
                json!({
                    "id": Uuid::new_v4().to_string(),
                    "conversationId": conversation_id,
                    "role": turn.role.as_str(),
                    "content": turn.content,
                    "createdAt": created_at.to_rfc3339(),
                })
            })
            .collect();

        self.send(|| {
            self.request(reqwest::Method::POST, &url)
                .header("Prefer", "return=minimal")
                .json(&rows)
        })
        .await?;
        Ok(())
    }

    async fn store_feedback(&self, feedback: &Feedback) -> Result<String> {
        feedback.validate()?;

        let url = self.table_url("feedback");
        let now = Utc::now().to_rfc3339();
        let row = json!({
            "timestamp": now,
            "type": "conversation",
            "rating": feedback.rating,
            "feedback": feedback.feedback,
            "session_id": feedback.session_id,
            "query_text": feedback.query,
            "answer_text": feedback.answer,
        });

        let body = self
            .send(|| {
                self.request(reqwest::Method::POST, &url)
                    .header("Prefer", "return=representation")
                    .json(&row)
            })
            .await?;

        let id = serde_json::from_str::<Vec<FeedbackRow>>(&body)
            .ok()
            .and_then(|rows| rows.into_iter().next())
            .map(|row| match row.id {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            })
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn supabase_store(server: &MockServer) -> SupabaseSessionStore {
        SupabaseSessionStore::new(
            SupabaseConfig {
                url: server.uri(),
                api_key: "anon-key".to_string(),
            },
            RetryPolicy {
                max_attempts: 1,
                timeout: Duration::from_secs(5),
                ..Default::default()
            },
        )
    }

    fn feedback(rating: u8, text: Option<&str>) -> Feedback {
        Feedback {
            session_id: Some("s1".to_string()),
            rating,
            feedback: text.map(str::to_string),
            query: None,
            answer: None,
        }
    }

    #[test]
    fn test_feedback_validation() {
        assert!(feedback(5, None).validate().is_ok());
        assert!(feedback(2, Some("missed the quote")).validate().is_ok());
        assert!(feedback(3, None).validate().is_err());
        assert!(feedback(2, Some("   ")).validate().is_err());
        assert!(feedback(0, Some("x")).validate().is_err());
        assert!(feedback(6, None).validate().is_err());
    }

    #[tokio::test]
    async fn test_memory_store_keeps_newest_turns() {
        let store = MemorySessionStore::new();
        store
            .append(
                "s1",
                &[
                    ChatMessage::user("q1"),
                    ChatMessage::assistant("a1"),
                    ChatMessage::user("q2"),
                ],
            )
            .await
            .unwrap();

        let history = store.history("s1", 2).await.unwrap();
        assert_eq!(
            history,
            vec![ChatMessage::assistant("a1"), ChatMessage::user("q2")]
        );
        assert!(store.history("unknown", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_rejects_invalid_feedback() {
        let store = MemorySessionStore::new();
        assert!(store.store_feedback(&feedback(1, None)).await.is_err());
        store.store_feedback(&feedback(4, None)).await.unwrap();
        assert_eq!(store.feedback_count().await, 1);
    }

    #[tokio::test]
    async fn test_supabase_history_is_returned_oldest_first() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rest/v1/messages"))
            .and(header("apikey", "anon-key"))
            .and(query_param("conversationId", "eq.s1"))
            .and(query_param("order", "createdAt.desc"))
            .and(query_param("limit", "4"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"role": "assistant", "content": "a1", "createdAt": "2024-01-01T00:00:02Z"},
                {"role": "User", "content": "q1", "createdAt": "2024-01-01T00:00:01Z"}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let history = supabase_store(&server).history("s1", 4).await.unwrap();
        assert_eq!(
            history,
            vec![ChatMessage::user("q1"), ChatMessage::assistant("a1")]
        );
    }

    #[tokio::test]
    async fn test_supabase_append_upserts_conversation_then_inserts() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/rest/v1/conversations"))
            .and(body_partial_json(json!({"id": "s1"})))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/rest/v1/messages"))
            .and(body_partial_json(json!([
                {"conversationId": "s1", "role": "user", "content": "q1"},
                {"conversationId": "s1", "role": "assistant", "content": "a1"}
            ])))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        supabase_store(&server)
            .append(
                "s1",
                &[ChatMessage::user("q1"), ChatMessage::assistant("a1")],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_supabase_failure_is_upstream_error() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rest/v1/messages"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = supabase_store(&server).history("s1", 10).await.unwrap_err();
        assert!(err.is_upstream());
    }

    #[tokio::test]
    async fn test_supabase_feedback_returns_row_id() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/rest/v1/feedback"))
            .and(body_partial_json(json!({"rating": 5, "session_id": "s1"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!([{"id": 42}])))
            .mount(&server)
            .await;

        let id = supabase_store(&server)
            .store_feedback(&feedback(5, None))
            .await
            .unwrap();
        assert_eq!(id, "42");
    }
}

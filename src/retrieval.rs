use crate::database::{ScoredEntry, VectorIndex};
use crate::embeddings::Embedder;
use crate::error::{RagError, Result};
use log::{debug, info};
use serde::Deserialize;
use std::sync::Arc;

/// A user question
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Query {
    pub text: String,
    /// Conversation to read history from and append to
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Overrides the configured top-k
    #[serde(default)]
    pub top_k: Option<u64>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Query {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_conversation(mut self, conversation_id: Option<String>) -> Self {
        self.conversation_id = conversation_id;
        self
    }

    pub fn with_top_k(mut self, top_k: Option<u64>) -> Self {
        self.top_k = top_k;
        self
    }
}

/// Passages that cleared the threshold; never empty
#[derive(Debug, Clone)]
pub struct Retrieval {
    pub passages: Vec<ScoredEntry>,
    pub best_score: Option<f32>,
}

/// Embeds queries and keeps the matches that are close enough
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    top_k: u64,
    min_score: f32,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        top_k: u64,
        min_score: f32,
    ) -> Self {
        Retriever {
            embedder,
            index,
            top_k,
            min_score,
        }
    }

    pub fn min_score(&self) -> f32 {
        self.min_score
    }

    /// Ranked matches for `query`, no threshold applied
    pub async fn search(&self, query: &Query) -> Result<Vec<ScoredEntry>> {
        let text = query.text.trim();
        if text.is_empty() {
            return Err(RagError::invalid_input("Query cannot be empty"));
        }

        let top_k = query.top_k.unwrap_or(self.top_k).max(1);
        let embedding = self.embedder.embed_one(text).await?;
        let mut matches = self.index.query(&embedding.values, top_k).await?;

        matches.sort_by(|a, b| b.score.total_cmp(&a.score));
        matches.truncate(usize::try_from(top_k).unwrap_or(usize::MAX));
        Ok(matches)
    }

    /// Matches for `query` whose score reaches the relevance threshold
    ///
    /// Fails with `NotFound` when none does.
    pub async fn retrieve(&self, query: &Query) -> Result<Retrieval> {
        let matches = self.search(query).await?;
        let best_score = matches.first().map(|m| m.score);

        let passages: Vec<ScoredEntry> = matches
            .into_iter()
            .filter(|m| m.score >= self.min_score)
            .collect();

        debug!(
            "Best score {:?}, {} passages at or above {}",
            best_score,
            passages.len(),
            self.min_score
        );
        if passages.is_empty() {
            return Err(RagError::not_found(
                format!("no passage scored at least {}", self.min_score),
                best_score,
            ));
        }
        info!("Retrieved {} relevant passages", passages.len());

        Ok(Retrieval {
            passages,
            best_score,
        })
    }
}

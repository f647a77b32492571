use crate::answer::AnswerComposer;
use crate::chunking::chunk_document;
use crate::completion::{ChatMessage, ChatModel};
use crate::config::RagConfig;
use crate::database::{EntryMetadata, IndexEntry, ScoredEntry, VectorIndex};
use crate::document::Document;
use crate::embeddings::{embed_chunks, ChunkEmbedding, Embedder};
use crate::error::{RagError, Result};
use crate::retrieval::{Query, Retriever};
use crate::session::{Feedback, SessionStore};
use log::{error, info, warn};
use serde::Serialize;
use std::io::{BufRead, Write};
use std::sync::Arc;

/// Returned without calling the completion API when nothing is relevant
pub const NO_RELEVANT_PASSAGES_REPLY: &str = "Sorry, I couldn't find relevant information about this topic in the Bhagavad Gita transcripts. Please try rephrasing your question or ask about a different topic.";

/// Returned when a remote dependency failed while answering
pub const UNAVAILABLE_REPLY: &str =
    "I apologize, but I'm having trouble processing your request right now. Please try again.";

/// How a chat request was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Answered,
    NoRelevantPassages,
    Unavailable,
}

/// A passage shown to the user as a source
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourcePassage {
    pub id: String,
    pub source_id: String,
    pub chunk_index: usize,
    pub text: String,
    pub score: f32,
}

impl From<&ScoredEntry> for SourcePassage {
    fn from(scored: &ScoredEntry) -> Self {
        SourcePassage {
            id: scored.entry.id.clone(),
            source_id: scored.entry.metadata.source_id.clone(),
            chunk_index: scored.entry.metadata.chunk_index,
            text: scored.entry.metadata.text.clone(),
            score: scored.score,
        }
    }
}

/// Result of one chat turn
#[derive(Debug, Clone, Serialize)]
pub struct ChatReply {
    pub query: String,
    pub answer: String,
    pub status: ReplyStatus,
    pub sources: Vec<SourcePassage>,
    pub best_score: Option<f32>,
    pub conversation_id: Option<String>,
}

impl ChatReply {
    /// Ids of the chunks the answer was grounded in
    pub fn source_ids(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.id.as_str()).collect()
    }
}

/// Summary of an ingestion run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReport {
    pub documents: usize,
    pub chunks: usize,
    pub upserted: usize,
    pub collection: String,
}

/// State of the engine's dependencies
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub index_connected: bool,
    pub collection: String,
    pub total_vectors: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// RAG (Retrieval-Augmented Generation) engine
pub struct RagEngine {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    sessions: Arc<dyn SessionStore>,
    retriever: Retriever,
    composer: AnswerComposer,
    config: RagConfig,
}

impl RagEngine {
    /// Create a new RAG engine
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        chat: Arc<dyn ChatModel>,
        sessions: Arc<dyn SessionStore>,
        config: RagConfig,
    ) -> Self {
        let retriever = Retriever::new(
            embedder.clone(),
            index.clone(),
            config.top_k,
            config.min_score,
        );

        RagEngine {
            embedder,
            index,
            sessions,
            retriever,
            composer: AnswerComposer::new(chat),
            config,
        }
    }

    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    /// Chunk, embed and index documents
    ///
    /// Stops at the first failure; re-running is safe since upserts overwrite by id.
    pub async fn ingest(&self, documents: &[Document], recreate: bool) -> Result<IngestReport> {
        self.config.chunking.validate()?;

        if recreate {
            info!("Recreating collection {}", self.index.name());
            self.index.clear().await?;
        } else {
            self.index.ensure_collection().await?;
        }

        let mut chunks = Vec::new();
        for document in documents {
            let document_chunks = chunk_document(document, &self.config.chunking)?;
            info!(
                "Split {} into {} chunks",
                document.id,
                document_chunks.len()
            );
            chunks.extend(document_chunks);
        }

        let report = IngestReport {
            documents: documents.len(),
            chunks: chunks.len(),
            upserted: 0,
            collection: self.index.name().to_string(),
        };
        if chunks.is_empty() {
            warn!("No text to index");
            return Ok(report);
        }

        info!("Generating embeddings for {} chunks...", chunks.len());
        let embedded = embed_chunks(self.embedder.as_ref(), chunks).await?;

        let entries: Vec<IndexEntry> = embedded.into_iter().map(to_index_entry).collect();
        let upserted = entries.len();
        self.index.upsert(entries).await?;
        info!("Stored {} chunks in {}", upserted, self.index.name());

        Ok(IngestReport { upserted, ..report })
    }

    /// Ranked matches without the relevance threshold
    pub async fn search(&self, query: &Query) -> Result<Vec<ScoredEntry>> {
        self.retriever.search(query).await
    }

    /// Answer one question
    ///
    /// Only an empty question is returned as an error; remote failures degrade the reply.
    pub async fn chat(&self, query: Query) -> Result<ChatReply> {
        if query.text.trim().is_empty() {
            return Err(RagError::invalid_input("Query cannot be empty"));
        }

        let history = self.load_history(query.conversation_id.as_deref()).await;

        let retrieval = match self.retriever.retrieve(&query).await {
            Ok(retrieval) => retrieval,
            Err(RagError::NotFound { message, best_score }) => {
                info!("Answering with the fallback: {}", message);
                return Ok(self.reply(
                    &query,
                    NO_RELEVANT_PASSAGES_REPLY,
                    ReplyStatus::NoRelevantPassages,
                    Vec::new(),
                    best_score,
                ));
            }
            Err(e @ RagError::InvalidInput(_)) => return Err(e),
            Err(e) => {
                error!("Retrieval failed: {}", e);
                return Ok(self.reply(&query, UNAVAILABLE_REPLY, ReplyStatus::Unavailable, Vec::new(), None));
            }
        };

        let sources: Vec<SourcePassage> = retrieval.passages.iter().map(SourcePassage::from).collect();

        let answer = match self
            .composer
            .compose(&query.text, &retrieval.passages, &history)
            .await
        {
            Ok(answer) => answer,
            Err(e) => {
                error!("Answer generation failed: {}", e);
                return Ok(self.reply(
                    &query,
                    UNAVAILABLE_REPLY,
                    ReplyStatus::Unavailable,
                    sources,
                    retrieval.best_score,
                ));
            }
        };

        if let Some(conversation_id) = query.conversation_id.as_deref() {
            let turns = [
                ChatMessage::user(query.text.trim()),
                ChatMessage::assistant(answer.text.clone()),
            ];
            if let Err(e) = self.sessions.append(conversation_id, &turns).await {
                warn!("Failed to save conversation {}: {}", conversation_id, e);
            }
        }

        Ok(self.reply(
            &query,
            &answer.text,
            ReplyStatus::Answered,
            sources,
            retrieval.best_score,
        ))
    }

    async fn load_history(&self, conversation_id: Option<&str>) -> Vec<ChatMessage> {
        let Some(conversation_id) = conversation_id else {
            return Vec::new();
        };

        match self
            .sessions
            .history(conversation_id, self.config.history_limit)
            .await
        {
            Ok(history) => history,
            Err(e) => {
                warn!(
                    "Failed to load history for {}, continuing without it: {}",
                    conversation_id, e
                );
                Vec::new()
            }
        }
    }

    fn reply(
        &self,
        query: &Query,
        answer: &str,
        status: ReplyStatus,
        sources: Vec<SourcePassage>,
        best_score: Option<f32>,
    ) -> ChatReply {
        ChatReply {
            query: query.text.clone(),
            answer: answer.to_string(),
            status,
            sources,
            best_score,
            conversation_id: query.conversation_id.clone(),
        }
    }

    /// Index status; never fails
    pub async fn health(&self) -> HealthReport {
        let index = self.index.health().await;
        HealthReport {
            status: if index.connected { "healthy" } else { "degraded" },
            index_connected: index.connected,
            collection: self.index.name().to_string(),
            total_vectors: index.total_vectors,
            error: index.error,
        }
    }

    /// Store feedback and return its id
    pub async fn record_feedback(&self, feedback: &Feedback) -> Result<String> {
        feedback.validate()?;
        self.sessions.store_feedback(feedback).await
    }

    /// Answer questions read line by line from `input` until `exit`
    pub async fn run_query_loop<R, W>(
        &self,
        mut input: R,
        mut output: W,
        conversation_id: Option<String>,
    ) -> anyhow::Result<()>
    where
        R: BufRead,
        W: Write,
    {
        info!("Ready to answer questions. Type 'exit' to quit.");

        let mut buffer = String::new();

        loop {
            write!(output, "\nYour question: ")?;
            output.flush()?;

            buffer.clear();
            if input.read_line(&mut buffer)? == 0 {
                break;
            }

            let question = buffer.trim();
            if question.eq_ignore_ascii_case("exit") {
                info!("Goodbye!");
                break;
            }
            if question.is_empty() {
                continue;
            }

            let query = Query::new(question).with_conversation(conversation_id.clone());
            let reply = self.chat(query).await?;

            writeln!(output, "\n{}", reply.answer)?;
            if !reply.sources.is_empty() {
                writeln!(output, "\nSources: {}", reply.source_ids().join(", "))?;
            }
        }

        Ok(())
    }
}

fn to_index_entry(embedded: ChunkEmbedding) -> IndexEntry {
    let ChunkEmbedding { chunk, embedding } = embedded;
    IndexEntry {
        id: chunk.id,
        vector: embedding.values,
        metadata: EntryMetadata {
            source_id: chunk.source_id,
            chunk_index: chunk.chunk_index,
            text: chunk.text,
        },
    }
}

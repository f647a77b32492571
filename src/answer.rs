use crate::completion::{ChatMessage, ChatModel};
use crate::context::build_messages;
use crate::database::ScoredEntry;
use crate::error::Result;
use log::debug;
use serde::Serialize;
use std::sync::Arc;

/// Generated text plus the chunks it was grounded in
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub text: String,
    pub source_ids: Vec<String>,
}

/// Turns retrieved passages and a question into a generated answer
pub struct AnswerComposer {
    model: Arc<dyn ChatModel>,
}

impl AnswerComposer {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        AnswerComposer { model }
    }

    /// One completion call; the reply is returned verbatim
    pub async fn compose(
        &self,
        question: &str,
        passages: &[ScoredEntry],
        history: &[ChatMessage],
    ) -> Result<Answer> {
        let messages = build_messages(question, passages, history);
        debug!(
            "Sending {} messages with {} passages to the completion API",
            messages.len(),
            passages.len()
        );

        let text = self.model.complete(&messages).await?;

        Ok(Answer {
            text,
            source_ids: passages.iter().map(|p| p.entry.id.clone()).collect(),
        })
    }
}

use crate::completion::ChatMessage;
use crate::database::ScoredEntry;

/// Instruction placed at the top of every completion request
pub const SYSTEM_INSTRUCTION: &str = "\
You are a warm and knowledgeable Bhagavad Gita teacher helping people understand \
Swamiji's teachings.

Rules:
1. Answer ONLY from the passages provided in the context. Never use outside knowledge \
and never invent details the passages do not contain.
2. Quote Swamiji's exact words from the context in double quotes, e.g. \
Swamiji says: \"...\". Do not paraphrase inside quotes.
3. Open with a one-sentence summary that answers the question, then give the quote, \
then explain what it means in two to four sentences.
4. If the passages do not contain the answer, say: \
\"I don't have information about that in the teachings I have, but here is what I can share...\" \
and share only what the passages support.
5. Be conversational and respectful. Do not use Markdown headings.";

/// Render retrieved passages as the context block of the prompt
pub fn format_context(passages: &[ScoredEntry]) -> String {
    passages
        .iter()
        .enumerate()
        .map(|(i, passage)| {
            let metadata = &passage.entry.metadata;
            format!(
                "Passage {} ({}, chunk {}, relevance {:.3}):\n{}\n",
                i + 1,
                metadata.source_id,
                metadata.chunk_index,
                passage.score,
                metadata.text
            )
        })
        .collect::<Vec<String>>()
        .join("\n")
}

/// Build the message list for one question
///
/// Order: system instruction, prior turns, then the context block with the question.
pub fn build_messages(
    question: &str,
    passages: &[ScoredEntry],
    history: &[ChatMessage],
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::system(SYSTEM_INSTRUCTION));
    messages.extend(history.iter().cloned());
    messages.push(ChatMessage::user(format!(
        "Context from the teachings:\n\n{}\nQuestion: {}",
        format_context(passages),
        question.trim()
    )));
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::Role;
    use crate::database::{EntryMetadata, IndexEntry};

    fn passage(id: &str, text: &str, score: f32) -> ScoredEntry {
        ScoredEntry {
            score,
            entry: IndexEntry {
                id: format!("c1-ep1-chunk-{}", id),
                vector: Vec::new(),
                metadata: EntryMetadata {
                    source_id: "c1-ep1".to_string(),
                    chunk_index: id.parse().unwrap(),
                    text: text.to_string(),
                },
            },
        }
    }

    #[test]
    fn test_context_block_attributes_sources() {
        let context = format_context(&[
            passage("0", "Dhritarashtra asked Sanjaya.", 0.91234),
            passage("4", "Arjuna's bow slipped.", 0.6),
        ]);

        assert!(context.starts_with("Passage 1 (c1-ep1, chunk 0, relevance 0.912):\n"));
        assert!(context.contains("Dhritarashtra asked Sanjaya."));
        assert!(context.contains("Passage 2 (c1-ep1, chunk 4, relevance 0.600):\nArjuna's bow slipped."));
    }

    #[test]
    fn test_messages_order_and_content() {
        let history = vec![
            ChatMessage::user("Who is Sanjaya?"),
            ChatMessage::assistant("The narrator."),
        ];
        let messages = build_messages(
            "  What did he see?  ",
            &[passage("2", "He saw the conch shells.", 0.8)],
            &history,
        );

        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[0].content, SYSTEM_INSTRUCTION);
        assert_eq!(&messages[1..3], &history[..]);
        assert_eq!(messages[3].role, Role::User);
        assert!(messages[3].content.contains("He saw the conch shells."));
        assert!(messages[3].content.ends_with("Question: What did he see?"));
    }
}

use crate::config::env_or;
use crate::document::Document;
use crate::error::{RagError, Result};

const DEFAULT_CHUNK_SIZE: usize = 1000;
const DEFAULT_OVERLAP: usize = 200;

/// Window sizes, measured in characters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        ChunkingConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_OVERLAP,
        }
    }
}

impl ChunkingConfig {
    /// Create a new configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let config = ChunkingConfig {
            chunk_size: env_or("CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?,
            overlap: env_or("CHUNK_OVERLAP", DEFAULT_OVERLAP)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject sizes that would never advance through the text
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(RagError::invalid_input("chunk size must be positive"));
        }
        if self.overlap >= self.chunk_size {
            return Err(RagError::invalid_input(format!(
                "overlap ({}) must be smaller than chunk size ({})",
                self.overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

/// Represents a text chunk with metadata
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Stable id, `{source_id}-chunk-{chunk_index}`
    pub id: String,
    /// Id of the document this chunk was cut from
    pub source_id: String,
    /// Position of this chunk within its document
    pub chunk_index: usize,
    /// The actual text content of this chunk
    pub text: String,
    /// Characters shared with the previous chunk
    pub overlap_with_previous: usize,
    /// Estimated token count for this chunk
    pub token_count: usize,
}

/// Build the id of a chunk
pub fn chunk_id(source_id: &str, chunk_index: usize) -> String {
    format!("{}-chunk-{}", source_id, chunk_index)
}

/// Split text into fixed-size character windows where neighbours share `overlap` characters
///
/// The last window keeps whatever is left and may be shorter than `chunk_size`.
pub fn split_into_windows(text: &str, chunk_size: usize, overlap: usize) -> Result<Vec<String>> {
    ChunkingConfig {
        chunk_size,
        overlap,
    }
    .validate()?;

    // Byte offset of every char boundary, plus the end of the string
    let boundaries: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let char_count = boundaries.len() - 1;

    let step = chunk_size - overlap;
    let mut windows = Vec::new();
    let mut start = 0;

    while start < char_count {
        let end = (start + chunk_size).min(char_count);
        windows.push(text[boundaries[start]..boundaries[end]].to_string());
        if end == char_count {
            break;
        }
        start += step;
    }

    Ok(windows)
}

/// Cut a document into chunks ready for embedding
pub fn chunk_document(document: &Document, config: &ChunkingConfig) -> Result<Vec<Chunk>> {
    let windows = split_into_windows(&document.text(), config.chunk_size, config.overlap)?;

    let chunks = windows
        .into_iter()
        .enumerate()
        .map(|(chunk_index, text)| Chunk {
            id: chunk_id(&document.id, chunk_index),
            source_id: document.id.clone(),
            chunk_index,
            token_count: estimate_token_count(&text),
            overlap_with_previous: if chunk_index == 0 { 0 } else { config.overlap },
            text,
        })
        .collect();

    Ok(chunks)
}

/// Calculate approximate token count for a text
/// This is a very simple estimation - words plus punctuation
pub fn estimate_token_count(text: &str) -> usize {
    let words = text.split_whitespace().count();
    let punctuation = text.chars().filter(|c| c.is_ascii_punctuation()).count();
    words + punctuation
}

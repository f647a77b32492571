use crate::chunking::Chunk;
use crate::error::{RagError, Result};
use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};

/// Representation of a vector embedding
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn dimension(&self) -> usize {
        self.values.len()
    }
}

/// Anything that turns text into vectors
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed `texts`; the output has one vector per input, in input order
    async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>>;

    /// Embed a single text
    async fn embed_one(&self, text: &str) -> Result<Embedding> {
        self.embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RagError::upstream("embeddings", "empty embedding response"))
    }
}

/// A chunk paired with the vector produced from its text
#[derive(Debug, Clone)]
pub struct ChunkEmbedding {
    pub chunk: Chunk,
    pub embedding: Embedding,
}

/// Generate embeddings for a list of chunks
pub async fn embed_chunks(embedder: &dyn Embedder, chunks: Vec<Chunk>) -> Result<Vec<ChunkEmbedding>> {
    if chunks.is_empty() {
        return Ok(Vec::new());
    }

    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let embeddings = embedder.embed(&texts).await?;

    if embeddings.len() != chunks.len() {
        return Err(RagError::upstream(
            "embeddings",
            format!(
                "expected {} embeddings, got {}",
                chunks.len(),
                embeddings.len()
            ),
        ));
    }

    info!("Generated {} embeddings", embeddings.len());

    Ok(chunks
        .into_iter()
        .zip(embeddings)
        .map(|(chunk, embedding)| ChunkEmbedding { chunk, embedding })
        .collect())
}

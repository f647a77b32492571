use crate::database::{IndexEntry, IndexStats, ScoredEntry, VectorIndex};
use crate::error::{RagError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

const SERVICE: &str = "memory-index";

/// Brute-force cosine index held in process memory
///
/// Serves offline runs (`--memory-index`) and tests; contents are lost on exit.
pub struct MemoryIndex {
    name: String,
    dimension: usize,
    entries: RwLock<HashMap<String, IndexEntry>>,
}

impl MemoryIndex {
    pub fn new(name: impl Into<String>, dimension: usize) -> Self {
        MemoryIndex {
            name: name.into(),
            dimension,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn check_dimension(&self, len: usize) -> Result<()> {
        if len != self.dimension {
            return Err(RagError::upstream(
                SERVICE,
                format!(
                    "vector dimension {} does not match index dimension {}",
                    len, self.dimension
                ),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ensure_collection(&self) -> Result<()> {
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.write().await.clear();
        Ok(())
    }

    async fn upsert(&self, entries: Vec<IndexEntry>) -> Result<()> {
        for entry in &entries {
            self.check_dimension(entry.vector.len())?;
        }

        let mut stored = self.entries.write().await;
        for entry in entries {
            stored.insert(entry.id.clone(), entry);
        }
        Ok(())
    }

    async fn query(&self, vector: &[f32], top_k: u64) -> Result<Vec<ScoredEntry>> {
        self.check_dimension(vector.len())?;

        let stored = self.entries.read().await;
        let mut matches: Vec<ScoredEntry> = stored
            .values()
            .map(|entry| ScoredEntry {
                score: cosine_similarity(vector, &entry.vector),
                entry: entry.clone(),
            })
            .collect();

        // Ties broken by id so results are deterministic
        matches.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.entry.id.cmp(&b.entry.id))
        });
        matches.truncate(usize::try_from(top_k).unwrap_or(usize::MAX));
        Ok(matches)
    }

    async fn stats(&self) -> Result<IndexStats> {
        Ok(IndexStats {
            total_vectors: self.entries.read().await.len() as u64,
            dimension: Some(self.dimension as u64),
        })
    }
}

/// Cosine similarity; zero vectors score 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::EntryMetadata;

    fn entry(id: &str, vector: Vec<f32>) -> IndexEntry {
        IndexEntry {
            id: id.to_string(),
            vector,
            metadata: EntryMetadata {
                source_id: "c1-ep1".to_string(),
                chunk_index: 0,
                text: format!("text of {}", id),
            },
        }
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let index = MemoryIndex::new("test", 2);
        let e = entry("a", vec![1.0, 0.0]);

        index.upsert(vec![e.clone()]).await.unwrap();
        let after_first = index.stats().await.unwrap();
        let first_results = index.query(&[1.0, 0.0], 10).await.unwrap();

        index.upsert(vec![e]).await.unwrap();
        assert_eq!(index.stats().await.unwrap(), after_first);
        assert_eq!(index.query(&[1.0, 0.0], 10).await.unwrap(), first_results);
        assert_eq!(after_first.total_vectors, 1);
    }

    #[tokio::test]
    async fn test_upsert_overwrites_same_id() {
        let index = MemoryIndex::new("test", 2);
        index.upsert(vec![entry("a", vec![1.0, 0.0])]).await.unwrap();
        index.upsert(vec![entry("a", vec![0.0, 1.0])]).await.unwrap();

        let results = index.query(&[0.0, 1.0], 1).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!((results[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_query_orders_by_score_and_limits() {
        let index = MemoryIndex::new("test", 2);
        index
            .upsert(vec![
                entry("far", vec![0.0, 1.0]),
                entry("near", vec![1.0, 0.1]),
                entry("mid", vec![1.0, 1.0]),
            ])
            .await
            .unwrap();

        let results = index.query(&[1.0, 0.0], 2).await.unwrap();
        let ids: Vec<&str> = results.iter().map(|r| r.entry.id.as_str()).collect();
        assert_eq!(ids, vec!["near", "mid"]);
        assert!(results[0].score >= results[1].score);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_upstream_error() {
        let index = MemoryIndex::new("test", 3);
        assert!(index.query(&[1.0], 1).await.unwrap_err().is_upstream());
        assert!(index
            .upsert(vec![entry("a", vec![1.0])])
            .await
            .unwrap_err()
            .is_upstream());
    }

    #[tokio::test]
    async fn test_health_reports_count() {
        let index = MemoryIndex::new("test", 2);
        index.upsert(vec![entry("a", vec![1.0, 0.0])]).await.unwrap();
        let health = index.health().await;
        assert!(health.connected);
        assert_eq!(health.total_vectors, 1);
    }
}

use crate::config::{env_opt, env_or};
use crate::error::{RagError, Result};
use crate::retry::{Failure, RetryPolicy};
use async_trait::async_trait;
use log::{debug, info, warn};
use qdrant_client::qdrant::{
    vectors_config, CreateCollectionBuilder, Distance, PointStruct, ScoredPoint,
    SearchPointsBuilder, UpsertPointsBuilder, VectorParamsBuilder,
};
use qdrant_client::{Payload, Qdrant, QdrantError};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use tonic::Code;
use uuid::Uuid;

const DEFAULT_URL: &str = "http://localhost:6334";
const DEFAULT_COLLECTION: &str = "bhagavad-gita";
// text-embedding-3-large
const DEFAULT_VECTOR_SIZE: u64 = 3072;
const UPSERT_BATCH_SIZE: usize = 100;
const SERVICE: &str = "qdrant";

/// What an index stores next to each vector
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryMetadata {
    pub source_id: String,
    pub chunk_index: usize,
    pub text: String,
}

/// A vector plus the chunk it was computed from
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    /// Chunk id; upserts with the same id overwrite each other
    pub id: String,
    pub vector: Vec<f32>,
    pub metadata: EntryMetadata,
}

/// A query match
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredEntry {
    pub score: f32,
    pub entry: IndexEntry,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexStats {
    pub total_vectors: u64,
    pub dimension: Option<u64>,
}

/// Liveness report; never an error
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexHealth {
    pub connected: bool,
    pub total_vectors: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A similarity index over chunk vectors
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Human-readable name of the backing collection
    fn name(&self) -> &str;

    /// Make sure the collection exists and matches the configured dimension
    async fn ensure_collection(&self) -> Result<()>;

    /// Remove every entry
    async fn clear(&self) -> Result<()>;

    /// Insert or overwrite entries by id
    async fn upsert(&self, entries: Vec<IndexEntry>) -> Result<()>;

    /// Nearest entries to `vector`, best first, at most `top_k`
    async fn query(&self, vector: &[f32], top_k: u64) -> Result<Vec<ScoredEntry>>;

    async fn stats(&self) -> Result<IndexStats>;

    async fn health(&self) -> IndexHealth {
        match self.stats().await {
            Ok(stats) => IndexHealth {
                connected: true,
                total_vectors: stats.total_vectors,
                error: None,
            },
            Err(e) => IndexHealth {
                connected: false,
                total_vectors: 0,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Configuration for Qdrant
#[derive(Debug, Clone)]
pub struct QdrantConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub collection: String,
    pub vector_size: u64,
}

impl QdrantConfig {
    /// Create a new configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let url = env_opt("QDRANT_URL").unwrap_or_else(|| DEFAULT_URL.to_string());
        let api_key = env_opt("QDRANT_API_KEY");
        let collection =
            env_opt("QDRANT_COLLECTION").unwrap_or_else(|| DEFAULT_COLLECTION.to_string());
        let vector_size = env_or("VECTOR_DIMENSION", DEFAULT_VECTOR_SIZE)?;

        Ok(QdrantConfig {
            url,
            api_key,
            collection,
            vector_size,
        })
    }
}

/// Client for interacting with Qdrant
pub struct QdrantIndex {
    client: Qdrant,
    collection: String,
    vector_size: u64,
    retry: RetryPolicy,
}

impl QdrantIndex {
    /// Create a new Qdrant client
    pub fn new(config: QdrantConfig, retry: RetryPolicy) -> Result<Self> {
        let config_builder = Qdrant::from_url(&config.url).timeout(retry.timeout);
        let config_builder = if let Some(api_key) = config.api_key {
            config_builder.api_key(api_key)
        } else {
            config_builder
        };

        let client = config_builder
            .build()
            .map_err(|e| RagError::upstream(SERVICE, e))?;

        Ok(QdrantIndex {
            client,
            collection: config.collection,
            vector_size: config.vector_size,
            retry,
        })
    }

    async fn collection_exists(&self) -> Result<bool> {
        let collection = self.collection.as_str();
        let client = &self.client;
        self.retry
            .run(SERVICE, || async move {
                client
                    .collection_exists(collection)
                    .await
                    .map_err(classify_qdrant_error)
            })
            .await
    }

    async fn create_collection(&self) -> Result<()> {
        let create_collection = CreateCollectionBuilder::new(self.collection.clone())
            .vectors_config(VectorParamsBuilder::new(self.vector_size, Distance::Cosine));

        self.client
            .create_collection(create_collection)
            .await
            .map_err(|e| {
                RagError::upstream(
                    SERVICE,
                    format!("Failed to create collection {}: {}", self.collection, e),
                )
            })?;

        info!(
            "Created collection {} ({} dimensions, cosine)",
            self.collection, self.vector_size
        );
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    fn name(&self) -> &str {
        &self.collection
    }

    async fn ensure_collection(&self) -> Result<()> {
        if !self.collection_exists().await? {
            return self.create_collection().await;
        }

        let stats = self.stats().await?;
        match stats.dimension {
            Some(dimension) if dimension != self.vector_size => Err(RagError::upstream(
                SERVICE,
                format!(
                    "collection {} stores {}-dimension vectors but {} are configured",
                    self.collection, dimension, self.vector_size
                ),
            )),
            _ => {
                info!("Using existing collection: {}", self.collection);
                Ok(())
            }
        }
    }

    async fn clear(&self) -> Result<()> {
        if self.collection_exists().await? {
            self.client
                .delete_collection(self.collection.clone())
                .await
                .map_err(|e| {
                    RagError::upstream(
                        SERVICE,
                        format!("Failed to delete collection {}: {}", self.collection, e),
                    )
                })?;
            info!("Deleted collection {}", self.collection);
        }
        self.create_collection().await
    }

    async fn upsert(&self, entries: Vec<IndexEntry>) -> Result<()> {
        let points = entries
            .into_iter()
            .map(to_point)
            .collect::<Result<Vec<PointStruct>>>()?;

        let batches = points.len().div_ceil(UPSERT_BATCH_SIZE);
        for (i, batch) in points.chunks(UPSERT_BATCH_SIZE).enumerate() {
            let collection = self.collection.as_str();
            let client = &self.client;
            self.retry
                .run(SERVICE, || async move {
                    client
                        .upsert_points(
                            UpsertPointsBuilder::new(collection, batch.to_vec()).wait(true),
                        )
                        .await
                        .map_err(classify_qdrant_error)
                })
                .await?;
            info!("Upserted batch {}/{}", i + 1, batches);
        }

        Ok(())
    }

    async fn query(&self, vector: &[f32], top_k: u64) -> Result<Vec<ScoredEntry>> {
        let collection = self.collection.as_str();
        let client = &self.client;

        let search_response = self
            .retry
            .run(SERVICE, || async move {
                client
                    .search_points(
                        SearchPointsBuilder::new(collection, vector.to_vec(), top_k)
                            .with_payload(true),
                    )
                    .await
                    .map_err(classify_qdrant_error)
            })
            .await?;

        let mut matches = entries_from_points(search_response.result, &self.collection);
        matches.sort_by(|a, b| b.score.total_cmp(&a.score));

        debug!("Qdrant returned {} matches", matches.len());
        Ok(matches)
    }

    async fn stats(&self) -> Result<IndexStats> {
        let collection = self.collection.as_str();
        let client = &self.client;

        let response = self
            .retry
            .run(SERVICE, || async move {
                client
                    .collection_info(collection)
                    .await
                    .map_err(classify_qdrant_error)
            })
            .await?;

        let info = response.result.ok_or_else(|| {
            RagError::upstream(SERVICE, format!("no info for collection {}", self.collection))
        })?;

        let dimension = info
            .config
            .and_then(|c| c.params)
            .and_then(|p| p.vectors_config)
            .and_then(|v| v.config)
            .and_then(|config| match config {
                vectors_config::Config::Params(params) => Some(params.size),
                vectors_config::Config::ParamsMap(_) => None,
            });

        Ok(IndexStats {
            total_vectors: info.points_count.unwrap_or(0),
            dimension,
        })
    }
}

/// Retry only what the server reports as overload or outage
fn classify_qdrant_error(err: QdrantError) -> Failure {
    match &err {
        QdrantError::ResponseError { status } => match status.code() {
            Code::Unavailable
            | Code::DeadlineExceeded
            | Code::ResourceExhausted
            | Code::Internal
            | Code::Unknown
            | Code::Aborted => Failure::Transient(err.to_string()),
            _ => Failure::Permanent(err.to_string()),
        },
        QdrantError::ResourceExhaustedError { .. } | QdrantError::Io(_) => {
            Failure::Transient(err.to_string())
        }
        _ => Failure::Permanent(err.to_string()),
    }
}

/// Qdrant only accepts integers and UUIDs as point ids
pub fn point_id(entry_id: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, entry_id.as_bytes()).to_string()
}

fn to_point(entry: IndexEntry) -> Result<PointStruct> {
    let payload = Payload::try_from(json!({
        "chunk_id": entry.id,
        "source_id": entry.metadata.source_id,
        "chunk_index": entry.metadata.chunk_index,
        "text": entry.metadata.text,
    }))
    .map_err(|e| RagError::upstream(SERVICE, format!("invalid payload: {}", e)))?;

    Ok(PointStruct::new(point_id(&entry.id), entry.vector, payload))
}

/// Convert search hits, logging points this crate didn't write
fn entries_from_points(points: Vec<ScoredPoint>, collection: &str) -> Vec<ScoredEntry> {
    let returned = points.len();
    let entries: Vec<ScoredEntry> = points.into_iter().filter_map(from_scored_point).collect();
    if entries.len() < returned {
        warn!(
            "Skipped {} points in {} without chunk_id/text payload",
            returned - entries.len(),
            collection
        );
    }
    entries
}

fn from_scored_point(scored_point: ScoredPoint) -> Option<ScoredEntry> {
    let payload: HashMap<String, qdrant_client::qdrant::Value> = scored_point.payload;
    let text = payload.get("text")?.as_str()?.to_string();
    let id = payload.get("chunk_id")?.as_str()?.to_string();

    let source_id = payload
        .get("source_id")
        .and_then(|v| v.as_str())
        .cloned()
        .unwrap_or_default();

    let chunk_index = payload
        .get("chunk_index")
        .and_then(|v| v.as_integer())
        .map(|v| v as usize)
        .unwrap_or(0);

    Some(ScoredEntry {
        score: scored_point.score,
        entry: IndexEntry {
            id,
            vector: Vec::new(),
            metadata: EntryMetadata {
                source_id,
                chunk_index,
                text,
            },
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_id_is_stable_uuid() {
        let a = point_id("c1-ep1-chunk-0");
        assert_eq!(a, point_id("c1-ep1-chunk-0"));
        assert_ne!(a, point_id("c1-ep1-chunk-1"));
        assert!(Uuid::parse_str(&a).is_ok());
    }

    #[test]
    fn test_scored_point_round_trip_through_payload() {
        let entry = IndexEntry {
            id: "c1-ep2-chunk-3".to_string(),
            vector: vec![0.1, 0.2],
            metadata: EntryMetadata {
                source_id: "c1-ep2".to_string(),
                chunk_index: 3,
                text: "Sanjaya said".to_string(),
            },
        };

        let point = to_point(entry).unwrap();
        let scored = ScoredPoint {
            payload: point.payload,
            score: 0.87,
            ..Default::default()
        };

        let restored = from_scored_point(scored).unwrap();
        assert_eq!(restored.entry.id, "c1-ep2-chunk-3");
        assert_eq!(restored.entry.metadata.source_id, "c1-ep2");
        assert_eq!(restored.entry.metadata.chunk_index, 3);
        assert_eq!(restored.entry.metadata.text, "Sanjaya said");
        assert!((restored.score - 0.87).abs() < f32::EPSILON);
    }

    #[test]
    fn test_outage_codes_are_retried_others_are_not() {
        let transient = [Code::Unavailable, Code::DeadlineExceeded, Code::ResourceExhausted, Code::Internal];
        for code in transient {
            let err = QdrantError::ResponseError {
                status: tonic::Status::new(code, "busy"),
            };
            assert!(matches!(classify_qdrant_error(err), Failure::Transient(_)), "{:?}", code);
        }

        let permanent = [Code::NotFound, Code::InvalidArgument, Code::PermissionDenied, Code::Unauthenticated];
        for code in permanent {
            let err = QdrantError::ResponseError {
                status: tonic::Status::new(code, "bad request"),
            };
            assert!(matches!(classify_qdrant_error(err), Failure::Permanent(_)), "{:?}", code);
        }

        let conversion = QdrantError::ConversionError("sparse into dense".to_string());
        assert!(matches!(classify_qdrant_error(conversion), Failure::Permanent(_)));
    }

    #[test]
    fn test_foreign_points_are_dropped_from_matches() {
        let entry = IndexEntry {
            id: "c1-ep1-chunk-0".to_string(),
            vector: vec![1.0],
            metadata: EntryMetadata {
                source_id: "c1-ep1".to_string(),
                chunk_index: 0,
                text: "Dhritarashtra asked".to_string(),
            },
        };
        let ours = ScoredPoint {
            payload: to_point(entry).unwrap().payload,
            score: 0.9,
            ..Default::default()
        };
        let foreign = ScoredPoint {
            score: 0.95,
            ..Default::default()
        };

        let entries = entries_from_points(vec![foreign, ours], "gita");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry.id, "c1-ep1-chunk-0");
    }

    #[test]
    fn test_scored_point_without_text_is_skipped() {
        assert!(from_scored_point(ScoredPoint::default()).is_none());
    }
}

use crate::chunking::ChunkingConfig;
use crate::database::QdrantConfig;
use crate::error::{RagError, Result};
use crate::openai::OpenAiConfig;
use crate::retry::RetryPolicy;
use crate::session::SupabaseConfig;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

const DEFAULT_TOP_K: u64 = 5;
// Passages scoring below this are not used as context
const DEFAULT_MIN_SCORE: f32 = 0.5;
const DEFAULT_HISTORY_LIMIT: usize = 10;
const DEFAULT_SERVER_ADDR: &str = "0.0.0.0:8000";

/// Read an optional variable, treating empty values as unset
pub fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Read a required variable
pub fn env_required(key: &str) -> Result<String> {
    env_opt(key).ok_or_else(|| RagError::invalid_input(format!("{} is not set", key)))
}

/// Read and parse a variable, falling back to `default` when unset
pub fn env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env_opt(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| RagError::invalid_input(format!("{} has an invalid value: {}", key, raw))),
        None => Ok(default),
    }
}

/// Retrieval and prompt settings
#[derive(Debug, Clone)]
pub struct RagConfig {
    pub top_k: u64,
    /// Minimum similarity a passage needs to be used as context
    pub min_score: f32,
    /// Prior turns included in the prompt
    pub history_limit: usize,
    pub chunking: ChunkingConfig,
}

impl Default for RagConfig {
    fn default() -> Self {
        RagConfig {
            top_k: DEFAULT_TOP_K,
            min_score: DEFAULT_MIN_SCORE,
            history_limit: DEFAULT_HISTORY_LIMIT,
            chunking: ChunkingConfig::default(),
        }
    }
}

impl RagConfig {
    /// Create a new configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let top_k = env_or("RAG_TOP_K", DEFAULT_TOP_K)?;
        let min_score = env_or("RAG_MIN_SCORE", DEFAULT_MIN_SCORE)?;
        let history_limit = env_or("HISTORY_LIMIT", DEFAULT_HISTORY_LIMIT)?;
        let chunking = ChunkingConfig::from_env()?;

        if top_k == 0 {
            return Err(RagError::invalid_input("RAG_TOP_K must be at least 1"));
        }

        Ok(RagConfig {
            top_k,
            min_score,
            history_limit,
            chunking,
        })
    }
}

/// Everything the binary needs to wire the pipeline together
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub openai: OpenAiConfig,
    pub qdrant: QdrantConfig,
    pub supabase: Option<SupabaseConfig>,
    pub rag: RagConfig,
    pub retry: RetryPolicy,
    pub server_addr: String,
    /// Only files under this directory may be ingested over HTTP
    pub ingest_dir: Option<PathBuf>,
}

impl AppConfig {
    /// Create a new configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = AppConfig {
            openai: OpenAiConfig::from_env()?,
            qdrant: QdrantConfig::from_env()?,
            supabase: SupabaseConfig::from_env(),
            rag: RagConfig::from_env()?,
            retry: RetryPolicy::from_env()?,
            server_addr: env_opt("SERVER_ADDR").unwrap_or_else(|| DEFAULT_SERVER_ADDR.to_string()),
            ingest_dir: env_opt("INGEST_DIR").map(PathBuf::from),
        };
        config.align_vector_size(env_opt("VECTOR_DIMENSION").is_some())?;
        Ok(config)
    }

    /// Make the index dimension follow the embedding model's output size
    ///
    /// When both are set explicitly they must agree.
    pub fn align_vector_size(&mut self, vector_size_explicit: bool) -> Result<()> {
        let Some(dimensions) = self.openai.embedding_dimensions else {
            return Ok(());
        };
        let dimensions = u64::from(dimensions);

        if vector_size_explicit && self.qdrant.vector_size != dimensions {
            return Err(RagError::invalid_input(format!(
                "VECTOR_DIMENSION ({}) does not match OPENAI_EMBEDDING_DIMENSIONS ({})",
                self.qdrant.vector_size, dimensions
            )));
        }
        self.qdrant.vector_size = dimensions;
        Ok(())
    }
}

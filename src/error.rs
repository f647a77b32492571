use thiserror::Error;

/// Errors produced by the ingestion and query pipelines
#[derive(Debug, Error)]
pub enum RagError {
    /// Bad chunking parameters, malformed documents, empty queries
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Any remote failure: embedding, index, completion or session store
    #[error("{service} request failed: {message}")]
    Upstream {
        service: &'static str,
        message: String,
    },

    /// No passage cleared the relevance threshold
    #[error("not found: {message}")]
    NotFound {
        message: String,
        /// Best score among the rejected matches
        best_score: Option<f32>,
    },
}

impl RagError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        RagError::InvalidInput(message.into())
    }

    pub fn upstream(service: &'static str, err: impl std::fmt::Display) -> Self {
        RagError::Upstream {
            service,
            message: err.to_string(),
        }
    }

    pub fn not_found(message: impl Into<String>, best_score: Option<f32>) -> Self {
        RagError::NotFound {
            message: message.into(),
            best_score,
        }
    }

    pub fn is_upstream(&self) -> bool {
        matches!(self, RagError::Upstream { .. })
    }
}

pub type Result<T, E = RagError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_display_names_service() {
        let err = RagError::upstream("qdrant", "connection refused");
        assert_eq!(err.to_string(), "qdrant request failed: connection refused");
        assert!(err.is_upstream());
        assert!(!RagError::invalid_input("x").is_upstream());
    }
}

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// One failed file inside an otherwise successful sync.
#[derive(Debug, Clone)]
pub struct FileError {
    pub path: String,
    pub message: String,
}

/// The engine-wide error taxonomy. Variants map to distinct handling
/// policies: config errors are fatal at startup, transient I/O is retried
/// with backoff, conflicts and validation errors surface to the caller
/// without retry, upstream errors mark the owning job failed.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transient I/O error: {0}")]
    TransientIo(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation error: {message}")]
    Validation {
        message: String,
        suggestions: Vec<String>,
    },

    #[error("upstream error from {service}: {message}")]
    Upstream { service: String, message: String },

    #[error("sync completed with {failed} failed file(s) out of {total}")]
    PartialSync {
        failed: usize,
        total: usize,
        errors: Vec<FileError>,
    },
}

impl EngineError {
    pub fn config(msg: impl Into<String>) -> Self {
        EngineError::Config(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        EngineError::TransientIo(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        EngineError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        EngineError::Conflict(msg.into())
    }

    pub fn validation(msg: impl Into<String>, suggestions: Vec<String>) -> Self {
        EngineError::Validation {
            message: msg.into(),
            suggestions,
        }
    }

    pub fn upstream(service: impl Into<String>, msg: impl Into<String>) -> Self {
        EngineError::Upstream {
            service: service.into(),
            message: msg.into(),
        }
    }

    /// Whether a supervisor should retry the failed operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::TransientIo(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(EngineError::transient("socket reset").is_transient());
        assert!(!EngineError::config("missing url").is_transient());
        assert!(!EngineError::upstream("embedder", "500").is_transient());
    }

    #[test]
    fn validation_carries_suggestions() {
        let err = EngineError::validation(
            "unknown dataset pattern 'prod-*'",
            vec!["api-prod".to_string(), "db-prod".to_string()],
        );
        match err {
            EngineError::Validation { suggestions, .. } => assert_eq!(suggestions.len(), 2),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}

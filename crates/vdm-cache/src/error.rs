use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors produced by the FMQL query cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("no FMQL backend configured: need an endpoint or a broker connection pool")]
    NoBackendConfigured,

    #[error("query {query:?} has no known FMQL form")]
    UnsupportedQueryForm { query: String },

    #[error("cache storage unavailable at {path}: {source}")]
    StorageUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt cache entry {path}: {message}")]
    CorruptCacheEntry { path: PathBuf, message: String },

    #[error("no cache entry for {query:?}")]
    NotFound { query: String },

    #[error("cache entry for {query:?} was present during the completeness check but vanished")]
    CacheInvariantViolation { query: String },

    #[error("transport failure: {message}")]
    TransportFailure { message: String },

    #[error("invalid response to {query:?}: {message}")]
    InvalidResponse { query: String, message: String },
}

impl CacheError {
    pub(crate) fn transport(message: impl Into<String>) -> Self {
        Self::TransportFailure {
            message: message.into(),
        }
    }

    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::StorageUnavailable {
            path: path.into(),
            source,
        }
    }

    /// Whether retrying the same backend call could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransportFailure { .. })
    }
}

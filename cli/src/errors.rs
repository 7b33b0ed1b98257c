use shared::{ErrCode, ErrorInfo};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid reference: {0}")]
    InvalidReference(String),
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },
    #[error("{0}")]
    Remote(#[from] ErrorInfo),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("task failed: {0}")]
    Task(String),
    #[error("{0}")]
    Other(String),
}

impl From<tokio::task::JoinError> for ClientError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Task(e.to_string())
    }
}

impl ClientError {
    /// The server cannot (or will not) shape a transfer location; the
    /// engines fall back to moving bytes through the registry.
    pub fn is_location_fallback(&self) -> bool {
        match self {
            Self::Remote(info) => {
                info.code == ErrCode::Unsupported || info.http_status == 404
            }
            Self::Unsupported(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_fallback_predicate() {
        assert!(ClientError::Remote(ErrorInfo::unsupported("x")).is_location_fallback());
        let mut not_found = ErrorInfo::new(ErrCode::Unknown, "gone");
        not_found.http_status = 404;
        assert!(ClientError::Remote(not_found).is_location_fallback());
        assert!(!ClientError::Remote(ErrorInfo::internal("boom")).is_location_fallback());
        assert!(!ClientError::Other("x".into()).is_location_fallback());
    }
}

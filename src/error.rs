//! Error types for the extraction system.

use thiserror::Error;

use crate::domain::shard::SessionId;

/// Result type alias using the broadside error type.
pub type Result<T> = std::result::Result<T, BroadsideError>;

/// Main error type for the extraction system.
///
/// Only admission rejections and host-launch failures ever reach the caller of
/// [`crate::Extractor::extract`]. Per-item failures (`AssetFetch`, `Render`) are
/// folded into the report by the item pipeline.
#[derive(Error, Debug)]
pub enum BroadsideError {
    /// A batch is already in flight and the gate is single-flight
    #[error("An extraction batch is already running")]
    AlreadyRunning,

    /// The gate's concurrency counter is at its cap
    #[error("Too many active extraction batches ({active}/{max})")]
    TooManyActiveSessions { active: usize, max: usize },

    /// More raw references than the session pool can hold
    #[error("Batch too large: {count} references submitted, at most {max} allowed")]
    BatchTooLarge { count: usize, max: usize },

    /// A render host session could not be created at all
    #[error("Failed to launch render host session {session_id}: {message}")]
    HostLaunch {
        session_id: SessionId,
        message: String,
    },

    /// Fetching a design payload failed
    #[error("Asset fetch failed: {0}")]
    AssetFetch(String),

    /// The render host raised while opening or rendering a design
    #[error("Render failed: {0}")]
    Render(String),

    /// HTTP client error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error (side-effect logs)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BroadsideError {
    /// True for the variants produced by the admission gate.
    pub fn is_admission_rejection(&self) -> bool {
        matches!(
            self,
            BroadsideError::AlreadyRunning
                | BroadsideError::TooManyActiveSessions { .. }
                | BroadsideError::BatchTooLarge { .. }
        )
    }

    /// Status code a request layer should surface for this error.
    ///
    /// Capacity rejections are retryable later (429), oversized batches must be
    /// resubmitted smaller (413), and a host that cannot start is a bad gateway.
    pub fn status_code(&self) -> u16 {
        match self {
            BroadsideError::AlreadyRunning | BroadsideError::TooManyActiveSessions { .. } => 429,
            BroadsideError::BatchTooLarge { .. } => 413,
            BroadsideError::HostLaunch { .. } => 502,
            _ => 500,
        }
    }

    /// Short label used for metrics and log fields.
    pub fn reason(&self) -> &'static str {
        match self {
            BroadsideError::AlreadyRunning => "already_running",
            BroadsideError::TooManyActiveSessions { .. } => "too_many_active_sessions",
            BroadsideError::BatchTooLarge { .. } => "batch_too_large",
            BroadsideError::HostLaunch { .. } => "host_launch",
            BroadsideError::AssetFetch(_) => "asset_fetch",
            BroadsideError::Render(_) => "render",
            BroadsideError::Http(_) => "http",
            BroadsideError::Serialization(_) => "serialization",
            BroadsideError::Io(_) => "io",
            BroadsideError::Other(_) => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_rejections_map_to_distinct_statuses() {
        let busy = BroadsideError::AlreadyRunning;
        let full = BroadsideError::TooManyActiveSessions { active: 2, max: 2 };
        let large = BroadsideError::BatchTooLarge { count: 300, max: 225 };

        assert!(busy.is_admission_rejection());
        assert!(full.is_admission_rejection());
        assert!(large.is_admission_rejection());

        assert_eq!(busy.status_code(), 429);
        assert_eq!(full.status_code(), 429);
        assert_eq!(large.status_code(), 413);
        assert!(large.to_string().contains("300"));
    }

    #[test]
    fn test_item_errors_are_not_admission_rejections() {
        let err = BroadsideError::AssetFetch("404 from origin".to_string());
        assert!(!err.is_admission_rejection());
        assert_eq!(err.status_code(), 500);
        assert_eq!(err.reason(), "asset_fetch");
    }
}

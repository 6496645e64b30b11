//! Error types for the relay

use crate::state::TransitionRejected;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the relay
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error (external processes, local files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A source key that is not in the registry
    #[error("Unknown source: {0}")]
    UnknownSource(String),

    /// An upstream answered with a non-success status
    #[error("Upstream {source_key} answered {status}")]
    UpstreamStatus { source_key: String, status: u16 },

    /// The audio extractor could not resolve a playable URL
    #[error("Extractor failed for {uri}: {reason}")]
    Extractor { uri: String, reason: String },

    /// Message listing or download failed
    #[error("Message repository error: {0}")]
    Repository(String),

    /// A message id that is not in the catalog
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// Invalid recurrence expression or schedule rule
    #[error("Invalid schedule rule {rule}: {reason}")]
    Schedule { rule: String, reason: String },

    /// Unknown IANA timezone name
    #[error("Unknown timezone: {0}")]
    Timezone(String),

    /// The broadcast state refused a transition
    #[error("Transition rejected: {0}")]
    Rejected(#[from] TransitionRejected),

    /// Configuration error (from wrconfig/anyhow)
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    pub fn repository(msg: impl Into<String>) -> Self {
        Self::Repository(msg.into())
    }

    pub fn schedule(rule: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Schedule {
            rule: rule.into(),
            reason: reason.into(),
        }
    }

    /// True for failures of an upstream audio source (connection, status,
    /// extraction, broken process pipe), which trigger the fallback policy
    pub fn is_upstream_failure(&self) -> bool {
        matches!(
            self,
            Self::Http(_) | Self::Io(_) | Self::UpstreamStatus { .. } | Self::Extractor { .. }
        )
    }
}

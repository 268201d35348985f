//! Error types for the thumbnail loader

use std::io;

/// Why a single thumbnail could not be loaded.
///
/// Failures are local to one key; they never abort other loads.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    /// Connection reset, timeout or similar; retried once
    #[error("network error: {0}")]
    TransientNetwork(String),

    #[error("thumbnail not found (HTTP {status})")]
    NotFound { status: u16 },

    #[error("thumbnail server error (HTTP {status})")]
    Server { status: u16 },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The working set was replaced before the load finished
    #[error("request cancelled")]
    Cancelled,
}

impl LoadError {
    /// Whether a failed attempt may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, LoadError::TransientNetwork(_))
    }

    /// Classify a non-2xx HTTP status
    pub fn from_status(status: u16) -> Self {
        if (400..500).contains(&status) {
            LoadError::NotFound { status }
        } else {
            LoadError::Server { status }
        }
    }
}

/// Errors that can occur while loading or saving configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for configuration key: {0}")]
    InvalidValue(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Errors raised while constructing or driving a loader.
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_errors_retry() {
        assert!(LoadError::TransientNetwork("connection reset".into()).is_retryable());
        assert!(!LoadError::NotFound { status: 404 }.is_retryable());
        assert!(!LoadError::Server { status: 503 }.is_retryable());
        assert!(!LoadError::InvalidResponse("empty body".into()).is_retryable());
        assert!(!LoadError::Cancelled.is_retryable());
    }

    #[test]
    fn test_from_status() {
        assert_eq!(LoadError::from_status(404), LoadError::NotFound { status: 404 });
        assert_eq!(LoadError::from_status(403), LoadError::NotFound { status: 403 });
        assert_eq!(LoadError::from_status(500), LoadError::Server { status: 500 });
        assert_eq!(LoadError::from_status(302), LoadError::Server { status: 302 });
    }

    #[test]
    fn test_display() {
        assert_eq!(
            LoadError::NotFound { status: 404 }.to_string(),
            "thumbnail not found (HTTP 404)"
        );
        let err = ConfigError::InvalidValue("max_concurrent_loads".into());
        assert_eq!(
            LoaderError::from(err).to_string(),
            "invalid value for configuration key: max_concurrent_loads"
        );
    }
}

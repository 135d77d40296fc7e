//! Error taxonomy shared by the routing registry and the dispatch pipeline.

use thiserror::Error;

/// Errors raised while building or running a routing pipeline.
///
/// Resolution failures for retry policies and load balancers never surface here:
/// they are recovered with a default where they happen.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ProxyError {
    /// No origin could be selected for the backend service.
    #[error("no hosts available for backend service '{backend}'")]
    NoAvailableHosts {
        /// Backend service id.
        backend: String,
    },

    /// Connection refused, reset or lost while talking to an origin.
    #[error("transport failure on origin '{origin}': {message}")]
    Transport {
        /// Origin id the failure was observed on.
        origin: String,
        /// Human readable cause.
        message: String,
    },

    /// A backend service declaration is structurally invalid.
    #[error("malformed backend service: {0}")]
    MalformedBackendService(String),

    /// A component was wired with missing or inconsistent settings.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The request cannot be forwarded as-is (e.g. a rewrite produced an invalid URI).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// No backend service is mounted at the request path.
    #[error("no backend service configured for path '{path}'")]
    NoServiceConfigured {
        /// Request path.
        path: String,
    },

    /// The routing object has already been shut down.
    #[error("routing object '{0}' has been stopped")]
    ObjectStopped(String),
}

impl ProxyError {
    /// Builds a [`ProxyError::Transport`] for the given origin.
    pub fn transport(origin: impl Into<String>, message: impl ToString) -> Self {
        Self::Transport {
            origin: origin.into(),
            message: message.to_string(),
        }
    }

    /// Whether a retry policy may try the request again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::NoAvailableHosts { .. })
    }
}

/// Result type alias used throughout Vortex.
pub type Result<T, E = ProxyError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_and_no_hosts_are_retryable() {
        assert!(ProxyError::transport("o1", "connection reset").is_retryable());
        assert!(ProxyError::NoAvailableHosts { backend: "app".into() }.is_retryable());
    }

    #[test]
    fn configuration_errors_are_not_retryable() {
        assert!(!ProxyError::MalformedBackendService("no origins".into()).is_retryable());
        assert!(!ProxyError::Configuration("x".into()).is_retryable());
        assert!(!ProxyError::BadRequest("x".into()).is_retryable());
    }

    #[test]
    fn transport_message_names_origin() {
        let err = ProxyError::transport("origin-1", "refused");
        assert_eq!(
            err.to_string(),
            "transport failure on origin 'origin-1': refused"
        );
    }
}

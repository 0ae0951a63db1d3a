//! Error types shared by every Bleemeo connector component.
//!
//! A sum type, not an exception hierarchy: the reconciler loop
//! pattern-matches the outcome of an API call to decide backoff, drop, or
//! propagate.

use thiserror::Error;

/// Unified error type returned by cache, API, broker and reconciler
/// operations.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Credentials were rejected, or re-authentication after a 401 failed.
    #[error("authentication failed: {reason}")]
    Auth { reason: String },

    /// The server returned 404 for a targeted GET/PATCH/DELETE.
    #[error("object not found: {resource}")]
    NotFound { resource: String },

    /// The server returned 403 for a DELETE.
    #[error("operation forbidden: {resource}")]
    Forbidden { resource: String },

    /// Any other 4xx/5xx response.
    #[error("API error {status} on {resource}: {body}")]
    Api { status: u16, resource: String, body: String },

    /// TCP/TLS/timeout failure before a response was obtained.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server returned a payload that did not have the expected shape.
    #[error("invariant violation: {0}")]
    Invariant(String),
}

impl ConnectorError {
    pub fn auth(reason: impl Into<String>) -> Self {
        ConnectorError::Auth { reason: reason.into() }
    }

    pub fn api(status: u16, resource: impl Into<String>, body: impl Into<String>) -> Self {
        let resource = resource.into();
        let body = body.into();
        match status {
            404 => ConnectorError::NotFound { resource },
            403 => ConnectorError::Forbidden { resource },
            _ => ConnectorError::Api { status, resource, body },
        }
    }

    /// Counts as an "error" for the reconciler's successive-error escalator
    /// (transport failures and 5xx responses); auth failures and 4xx client
    /// errors are handled by their own dedicated policies instead.
    pub fn is_transient(&self) -> bool {
        match self {
            ConnectorError::Transport(_) => true,
            ConnectorError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, ConnectorError::Auth { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ConnectorError::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, ConnectorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_maps_status_to_variant() {
        assert!(matches!(ConnectorError::api(404, "v1/metric/x/", ""), ConnectorError::NotFound { .. }));
        assert!(matches!(ConnectorError::api(403, "v1/metric/x/", ""), ConnectorError::Forbidden { .. }));
        assert!(matches!(ConnectorError::api(500, "v1/metric/", "boom"), ConnectorError::Api { status: 500, .. }));
    }

    #[test]
    fn transient_classification() {
        assert!(ConnectorError::Transport("timeout".into()).is_transient());
        assert!(ConnectorError::api(503, "v1/service/", "").is_transient());
        assert!(!ConnectorError::api(400, "v1/service/", "").is_transient());
        assert!(!ConnectorError::Auth { reason: "bad password".into() }.is_transient());
    }
}

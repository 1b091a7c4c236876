//! Error taxonomy for backend queries and mutations

use lineage_core::NodeId;
use thiserror::Error;

/// Errors surfaced by the store, the coordinator and the resolver.
///
/// `Clone` so that one in-flight result can be handed to every waiting caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Transport failure or request timeout.
    #[error("Network error: {0}")]
    Network(String),

    /// Non-2xx response. `code` carries the backend's `detail` when present.
    #[error("HTTP {status}: {}", .code.as_deref().unwrap_or("no detail"))]
    Http { status: u16, code: Option<String> },

    /// Client-side precondition failed; no request was issued.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The operation targets a node that is no longer in the graph.
    #[error("Node {node_id} is no longer present")]
    StaleReference { node_id: NodeId },

    /// The same operation is already in flight for this target.
    #[error("Operation {key} is already in progress")]
    Busy { key: String },

    #[error("Not authenticated")]
    Unauthenticated,

    #[error("Failed to decode response: {0}")]
    Decode(String),
}

impl ClientError {
    /// Worth retrying automatically: transport failures, 5xx and 429.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Network(_) => true,
            ClientError::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Authentication failures are never retried.
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            ClientError::Unauthenticated | ClientError::Http { status: 401 | 403, .. }
        )
    }

    /// Whether the UI should present this as a failure of `origin`.
    ///
    /// Auth failures always are. Read and shape failures otherwise stay scoped
    /// to their view as a transient indicator. A mutation that was skipped or
    /// is already in flight is a no-op, not a failure.
    pub fn is_fatal(&self, origin: ErrorOrigin) -> bool {
        if self.is_auth() {
            return true;
        }
        match origin {
            ErrorOrigin::Read | ErrorOrigin::Shape => false,
            ErrorOrigin::Mutation => {
                !matches!(self, ClientError::StaleReference { .. } | ClientError::Busy { .. })
            }
        }
    }
}

/// The kind of work an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorOrigin {
    /// Workspace list, graph snapshot, node descriptor or node page.
    Read,
    /// Row-count resolution.
    Shape,
    Mutation,
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ClientError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            ClientError::Http {
                status: status.as_u16(),
                code: None,
            }
        } else {
            ClientError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Decode(err.to_string())
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Invalid or unreadable configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality_depends_on_origin() {
        let bad_request = ClientError::Http { status: 400, code: None };
        let network = ClientError::Network("connection refused".to_string());
        let stale = ClientError::StaleReference { node_id: "n1".into() };
        let busy = ClientError::Busy { key: "n1:delete".to_string() };

        assert!(!bad_request.is_fatal(ErrorOrigin::Shape));
        assert!(!network.is_fatal(ErrorOrigin::Read));
        assert!(bad_request.is_fatal(ErrorOrigin::Mutation));
        assert!(network.is_fatal(ErrorOrigin::Mutation));
        assert!(!stale.is_fatal(ErrorOrigin::Mutation));
        assert!(!busy.is_fatal(ErrorOrigin::Mutation));

        for origin in [ErrorOrigin::Read, ErrorOrigin::Shape, ErrorOrigin::Mutation] {
            assert!(ClientError::Unauthenticated.is_fatal(origin));
            assert!(ClientError::Http { status: 403, code: None }.is_fatal(origin));
        }
    }
}

//! Authentication collaborator

use std::collections::BTreeMap;

/// Supplies the session's authentication state and request headers.
pub trait AuthProvider: Send + Sync {
    fn is_authenticated(&self) -> bool;

    /// Headers to attach to every backend request.
    fn auth_headers(&self) -> BTreeMap<String, String>;
}

/// Bearer token issued by the backend's login flow.
#[derive(Debug, Clone)]
pub struct BearerToken {
    token: Option<String>,
}

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Self {
        let token = token.into();
        Self {
            token: (!token.trim().is_empty()).then_some(token),
        }
    }

    /// A session that has not logged in yet.
    pub fn signed_out() -> Self {
        Self { token: None }
    }
}

impl AuthProvider for BearerToken {
    fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    fn auth_headers(&self) -> BTreeMap<String, String> {
        self.token
            .iter()
            .map(|t| ("Authorization".to_string(), format!("Bearer {}", t)))
            .collect()
    }
}

/// Backend running with multi-user mode disabled: always authenticated, no headers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleUser;

impl AuthProvider for SingleUser {
    fn is_authenticated(&self) -> bool {
        true
    }

    fn auth_headers(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

//! Workspace backend implementations

pub mod http;
pub mod local;

use crate::auth::AuthProvider;
use crate::backend::WorkspaceBackend;
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use std::sync::Arc;

/// Factory function to create workspace backends
pub fn create_backend(
    kind: &str,
    config: &ClientConfig,
    auth: Arc<dyn AuthProvider>,
) -> ClientResult<Arc<dyn WorkspaceBackend>> {
    match kind {
        "http" => Ok(Arc::new(http::HttpBackend::new(config, auth)?)),
        "local" => Ok(Arc::new(local::LocalBackend::with_sample_data())),
        _ => Err(ClientError::Validation(format!("Unknown backend: {}", kind))),
    }
}

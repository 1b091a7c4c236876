//! Lineage client: cache-coherent mirror of a server-owned workspace graph
//!
//! This crate provides the query cache, mutation coordination and shape
//! resolution on top of a pluggable workspace backend, tied together by a
//! `Session` that accepts UI intents and publishes change events.

pub mod auth;
pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod mutation;
pub mod pending;
pub mod providers;
pub mod retry;
pub mod session;
pub mod shape;
pub mod store;
pub mod wire;


pub use auth::{AuthProvider, BearerToken, SingleUser};
pub use backend::*;
pub use config::{ClientConfig, Freshness, RetryConfig};
pub use error::{ClientError, ClientResult, ConfigError, ErrorOrigin};
pub use mutation::{MutationCoordinator, MutationOutcome};
pub use pending::{OperationKey, OperationKind, OperationTarget};
pub use providers::create_backend;
pub use session::{GraphView, Intent, IntentOutcome, Session, SessionEvent};
pub use shape::{ShapeResolver, ShapeStatus};
pub use store::{GraphStore, InvalidationScope};

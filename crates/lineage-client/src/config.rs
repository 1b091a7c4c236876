//! Client configuration: TOML file, then environment overrides

use crate::error::ConfigError;
use lineage_core::LayoutConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable overriding `base_url`.
pub const ENV_BASE_URL: &str = "LINEAGE_BASE_URL";
/// Environment variable overriding `api_token`.
pub const ENV_API_TOKEN: &str = "LINEAGE_API_TOKEN";
/// Environment variable overriding `request_timeout_secs`.
pub const ENV_TIMEOUT_SECS: &str = "LINEAGE_TIMEOUT_SECS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Root of the workspace API, e.g. `http://localhost:8001/api`.
    pub base_url: String,
    pub api_token: Option<String>,
    /// Expiry is reported as a network error.
    pub request_timeout_secs: u64,
    /// Rows per node-data page.
    pub page_size: u32,
    pub freshness: Freshness,
    pub retry: RetryConfig,
    pub layout: LayoutConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            base_url: "http://localhost:8001/api".to_string(),
            api_token: None,
            request_timeout_secs: 120,
            page_size: 100,
            freshness: Freshness::default(),
            retry: RetryConfig::default(),
            layout: LayoutConfig::default(),
        }
    }
}

/// How long each cached query stays fresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Freshness {
    pub workspace_list_secs: u64,
    pub current_workspace_secs: u64,
    pub graph_secs: u64,
    pub node_data_secs: u64,
    pub node_schema_secs: u64,
}

impl Default for Freshness {
    fn default() -> Self {
        Freshness {
            workspace_list_secs: 300,
            current_workspace_secs: 60,
            graph_secs: 30,
            node_data_secs: 30,
            node_schema_secs: 30,
        }
    }
}

impl Freshness {
    pub fn workspace_list(&self) -> Duration {
        Duration::from_secs(self.workspace_list_secs)
    }

    pub fn current_workspace(&self) -> Duration {
        Duration::from_secs(self.current_workspace_secs)
    }

    pub fn graph(&self) -> Duration {
        Duration::from_secs(self.graph_secs)
    }

    pub fn node_data(&self) -> Duration {
        Duration::from_secs(self.node_data_secs)
    }

    pub fn node_schema(&self) -> Duration {
        Duration::from_secs(self.node_schema_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Extra attempts for idempotent reads.
    pub read_retries: u32,
    /// Extra attempts for mutations.
    pub mutation_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            read_retries: 3,
            mutation_retries: 1,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
        }
    }
}

impl ClientConfig {
    /// Load from an optional TOML file, then apply `.env` and process environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                tracing::debug!("Loaded config file: {}", path.display());
                Self::from_toml_str(&text)?
            }
            None => ClientConfig::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `LINEAGE_*` overrides from a variable lookup.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(url) = lookup(ENV_BASE_URL) {
            self.base_url = url;
        }
        if let Some(token) = lookup(ENV_API_TOKEN) {
            self.api_token = Some(token);
        }
        if let Some(secs) = lookup(ENV_TIMEOUT_SECS) {
            self.request_timeout_secs = secs.trim().parse().map_err(|_| ConfigError::Invalid {
                field: "request_timeout_secs",
                reason: format!("not a number: {:?}", secs),
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "base_url",
                reason: "must not be empty".to_string(),
            });
        }
        if self.page_size == 0 {
            return Err(ConfigError::Invalid {
                field: "page_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "request_timeout_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

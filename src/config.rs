use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::jobs::JobFamily;

pub const DEFAULT_CONFIG_FILE: &str = "commerce-sync.yaml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub writer: WriterConfig,
    pub remote: RemoteConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Connection URL or bare SQLite path
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "commerce-sync.db".to_string(),
            max_connections: 20,
            min_connections: 1,
            connect_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Broker database; `None` means the application database
    pub broker_url: Option<String>,
    pub poll_interval_ms: u64,
    /// Budget for in-flight jobs to finish during shutdown
    pub lock_duration_secs: u64,
    pub concurrency: HashMap<JobFamily, usize>,
    /// How long finished jobs and their outputs are kept
    pub job_ttl_hours: i64,
    pub purge_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            broker_url: None,
            poll_interval_ms: 1000,
            lock_duration_secs: 300,
            concurrency: HashMap::new(),
            job_ttl_hours: 24,
            purge_interval_secs: 600,
        }
    }
}

impl QueueConfig {
    pub fn concurrency_for(&self, family: JobFamily) -> usize {
        self.concurrency
            .get(&family)
            .copied()
            .filter(|limit| *limit > 0)
            .unwrap_or_else(|| family.default_concurrency())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    pub chunk_size: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self { chunk_size: 100 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub graphql_endpoint: Option<String>,
    pub access_token: Option<String>,
    pub token_header: String,
    pub page_size: usize,
    pub request_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            graphql_endpoint: None,
            access_token: None,
            token_header: "X-Shopify-Access-Token".to_string(),
            page_size: 100,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub output_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("outputs"),
        }
    }
}

impl AppConfig {
    /// Reads the YAML file when present, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        let mut config = if path.exists() {
            info!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Self::from_yaml(&content)?
        } else {
            debug!("No configuration file at {}, using defaults", path.display());
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse configuration")
    }

    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("COMMERCE_SYNC_DATABASE_URL") {
            self.database.url = url;
        }
        if let Some(url) = lookup("COMMERCE_SYNC_BROKER_URL") {
            self.queue.broker_url = Some(url);
        }
        if let Some(dir) = lookup("COMMERCE_SYNC_OUTPUT_DIR") {
            self.storage.output_dir = PathBuf::from(dir);
        }
        if let Some(endpoint) = lookup("COMMERCE_SYNC_GRAPHQL_ENDPOINT") {
            self.remote.graphql_endpoint = Some(endpoint);
        }
        if let Some(token) = lookup("COMMERCE_SYNC_GRAPHQL_TOKEN") {
            self.remote.access_token = Some(token);
        }
    }

    pub fn broker_url(&self) -> &str {
        self.queue.broker_url.as_deref().unwrap_or(&self.database.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config = AppConfig::from_yaml("writer:\n  chunk_size: 250\n").unwrap();
        assert_eq!(config.writer.chunk_size, 250);
        assert_eq!(config.queue.lock_duration_secs, 300);
        assert_eq!(config.remote.page_size, 100);
        assert_eq!(config.broker_url(), "commerce-sync.db");
    }

    #[test]
    fn test_concurrency_overrides() {
        let config = AppConfig::from_yaml("queue:\n  concurrency:\n    export: 4\n    sync: 0\n").unwrap();
        assert_eq!(config.queue.concurrency_for(JobFamily::Export), 4);
        assert_eq!(config.queue.concurrency_for(JobFamily::Sync), 2);
        assert_eq!(config.queue.concurrency_for(JobFamily::Thumbnail), 1);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AppConfig::default();
        config.apply_env(|key| match key {
            "COMMERCE_SYNC_DATABASE_URL" => Some("sqlite::memory:".to_string()),
            "COMMERCE_SYNC_BROKER_URL" => Some("postgres://queue/jobs".to_string()),
            _ => None,
        });
        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.broker_url(), "postgres://queue/jobs");
        assert!(config.remote.graphql_endpoint.is_none());
    }
}

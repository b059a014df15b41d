use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use super::JobFamily;
use crate::errors::{JobError, JobResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredOutput {
    pub location: String,
    pub size_bytes: i64,
}

/// Object key of a job artifact: `{family}/{jobId}/{filename}`.
pub fn output_key(family: JobFamily, job_id: &str, filename: &str) -> String {
    format!("{}/{}/{}", family, job_id, filename)
}

/// Where finished job artifacts are uploaded.
#[async_trait]
pub trait OutputStorage: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> JobResult<StoredOutput>;

    /// Deleting a location that does not exist is not an error.
    async fn delete(&self, location: &str) -> JobResult<()>;
}

/// Artifacts as files under a root directory.
#[derive(Debug, Clone)]
pub struct LocalOutputStorage {
    root: PathBuf,
}

impl LocalOutputStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> JobResult<PathBuf> {
        let relative = Path::new(key);
        let safe = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        if key.is_empty() || !safe {
            return Err(JobError::Storage(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid output key '{}'", key),
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl OutputStorage for LocalOutputStorage {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> JobResult<StoredOutput> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let size_bytes = bytes.len() as i64;
        tokio::fs::write(&path, bytes).await?;
        debug!("Stored {} bytes at {}", size_bytes, path.display());

        Ok(StoredOutput {
            location: key.to_string(),
            size_bytes,
        })
    }

    async fn delete(&self, location: &str) -> JobResult<()> {
        let path = self.resolve(location)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        // Drop the per-job directory once empty
        if let Some(dir) = path.parent() {
            let _ = tokio::fs::remove_dir(dir).await;
        }
        Ok(())
    }
}

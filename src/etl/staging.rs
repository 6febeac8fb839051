/// Staging Module
///
/// Writes validated batches to `<dir>/<artifact>-<yyyyMMddHHmmss>.json`
/// before they are loaded.
use crate::error::{EtlError, EtlResult};
use chrono::Utc;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct StagingWriter {
    directory: PathBuf,
}

impl StagingWriter {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self { directory: directory.into() }
    }

    /// Serialize `rows` as pretty JSON and return the artifact path
    pub async fn write<T: Serialize>(&self, rows: &[T], artifact: &str) -> EtlResult<PathBuf> {
        let name = self.directory.display().to_string();

        tokio::fs::create_dir_all(&self.directory).await.map_err(|e| EtlError::unavailable(&name, e))?;

        let path = self.directory.join(format!("{}-{}.json", artifact, Utc::now().format("%Y%m%d%H%M%S")));
        let body = serde_json::to_vec_pretty(rows).map_err(|e| EtlError::unavailable(&name, e))?;
        tokio::fs::write(&path, body).await.map_err(|e| EtlError::unavailable(&name, e))?;

        tracing::info!("Staged {} {} rows at {}", rows.len(), artifact, path.display());
        Ok(path)
    }
}

/// Error Module
///
/// Failure taxonomy for the load path. Per-record validation problems are not
/// errors: they travel as messages inside stage reports.
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by a storage backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(test)]
    #[error("duplicate {entity} key {key}")]
    Duplicate { entity: &'static str, key: String },

    #[cfg(test)]
    #[error("{0} is not supported by this store")]
    Unsupported(&'static str),

    #[cfg(test)]
    #[error("injected failure: {0}")]
    Injected(String),
}

/// Errors raised by extraction, loading and orchestration.
#[derive(Debug, Error)]
pub enum EtlError {
    #[error("source file not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("source {source_name} unavailable: {message}")]
    SourceUnavailable { source_name: String, message: String },

    #[error("failed to load {entity}: {source}")]
    LoadFailure {
        entity: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),
}

impl EtlError {
    pub fn unavailable(source_name: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::SourceUnavailable { source_name: source_name.into(), message: message.to_string() }
    }

    pub fn load(entity: &'static str, source: StoreError) -> Self {
        Self::LoadFailure { entity, source }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type EtlResult<T> = Result<T, EtlError>;

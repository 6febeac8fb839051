/// ETL Pipeline Module
///
/// This module holds the building blocks the pipeline runs in order:
/// - Extract: read raw records from files, queries and APIs
/// - Transform: validate raw records into operational entities
/// - Load: chunked transactional upsert into storage
/// - Dimension / Fact: star-schema population from operational rows
pub mod dimension;
pub mod extract;
pub mod fact;
pub mod load;
pub mod staging;
pub mod transform;

use crate::db::{EntityTable, Store};
use crate::error::EtlResult;
use crate::models::Entity;
use load::{BatchLoader, LoadCounts};
use serde::Serialize;
use staging::StagingWriter;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Outcome of one entity stage
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageReport {
    /// Records handed to the stage
    pub received: usize,
    /// Records that passed validation
    pub processed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub validation_errors: Vec<String>,
    pub elapsed: Duration,
}

impl StageReport {
    pub fn loaded(
        received: usize,
        processed: usize,
        counts: LoadCounts,
        validation_errors: Vec<String>,
        elapsed: Duration,
    ) -> Self {
        Self {
            received,
            processed,
            inserted: counts.inserted,
            updated: counts.updated,
            validation_errors,
            elapsed,
        }
    }

    /// Nothing written; every message is kept
    pub fn rejected(received: usize, validation_errors: Vec<String>, elapsed: Duration) -> Self {
        Self { received, validation_errors, elapsed, ..Self::default() }
    }

    pub fn rows_affected(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Validate raw records, optionally stage the valid ones, and upsert them.
///
/// Invalid rows are reported and skipped. A batch with no valid rows is still
/// a successful stage with nothing written.
pub async fn process_entity<R, E, S>(
    store: &S,
    records: &[R],
    validate: impl Fn(&R) -> Result<E, String>,
    loader: &BatchLoader<E>,
    staging: Option<(&StagingWriter, &str)>,
    cancel: &CancellationToken,
) -> EtlResult<StageReport>
where
    E: Entity + Serialize,
    S: Store,
    S::Tx: EntityTable<E>,
{
    let started = Instant::now();
    let validated = transform::validate_all(records, validate);

    let received = validated.received();

    if !validated.errors.is_empty() {
        tracing::warn!("{} validation rejected {} of {} records", E::NAME, validated.errors.len(), received);
    }

    let processed = validated.valid.len();
    if processed == 0 {
        return Ok(StageReport::rejected(received, validated.errors, started.elapsed()));
    }

    if let Some((writer, artifact)) = staging {
        writer.write(&validated.valid, artifact).await?;
    }

    let counts = loader.load(store, validated.valid, cancel).await?;

    Ok(StageReport::loaded(received, processed, counts, validated.errors, started.elapsed()))
}

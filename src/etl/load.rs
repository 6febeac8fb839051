/// Load Module
///
/// Chunked upsert of entities into storage. One call is one transaction:
/// every chunk is written inside it and nothing is visible until all chunks
/// have succeeded.
use crate::db::{EntityTable, Store, Transaction};
use crate::error::{EtlError, EtlResult};
use crate::models::{DimCustomer, DimProduct, Entity};
use chrono::Utc;
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// How one entity type is matched and merged during an upsert
pub trait UpsertStrategy<E: Entity>: Send + Sync {
    fn natural_key(&self, entity: &E) -> E::Key {
        entity.natural_key()
    }

    /// Merge `incoming` onto the stored row, keeping the stored identity
    fn apply_update(&self, existing: &E, incoming: E) -> E;
}

/// Every field comes from the incoming row. Used where the natural key is
/// the storage identity (operational tables, date dimension).
#[derive(Debug, Clone, Copy, Default)]
pub struct Overwrite;

impl<E: Entity> UpsertStrategy<E> for Overwrite {
    fn apply_update(&self, _existing: &E, incoming: E) -> E {
        incoming
    }
}

/// Keeps the surrogate key and creation time, stamps the modification time
#[derive(Debug, Clone, Copy, Default)]
pub struct DimCustomerUpsert;

impl UpsertStrategy<DimCustomer> for DimCustomerUpsert {
    fn apply_update(&self, existing: &DimCustomer, incoming: DimCustomer) -> DimCustomer {
        DimCustomer {
            customer_key: existing.customer_key,
            created_at: existing.created_at,
            modified_at: Some(Utc::now()),
            ..incoming
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DimProductUpsert;

impl UpsertStrategy<DimProduct> for DimProductUpsert {
    fn apply_update(&self, existing: &DimProduct, incoming: DimProduct) -> DimProduct {
        DimProduct {
            product_key: existing.product_key,
            created_at: existing.created_at,
            modified_at: Some(Utc::now()),
            ..incoming
        }
    }
}

/// Rows written by one load
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadCounts {
    pub inserted: usize,
    pub updated: usize,
}

impl LoadCounts {
    pub fn affected(&self) -> usize {
        self.inserted + self.updated
    }
}

pub struct BatchLoader<E: Entity> {
    strategy: Box<dyn UpsertStrategy<E>>,
    chunk_size: usize,
}

impl<E: Entity> BatchLoader<E> {
    pub fn new(strategy: impl UpsertStrategy<E> + 'static, chunk_size: usize) -> Self {
        Self { strategy: Box::new(strategy), chunk_size: chunk_size.max(1) }
    }

    /// Keep the first occurrence of every natural key
    pub fn dedupe(&self, rows: Vec<E>) -> Vec<E> {
        let mut seen = HashSet::with_capacity(rows.len());
        rows.into_iter().filter(|row| seen.insert(self.strategy.natural_key(row))).collect()
    }

    /// Upsert `rows` in one transaction, rolling back on any error
    pub async fn load<S>(&self, store: &S, rows: Vec<E>, cancel: &CancellationToken) -> EtlResult<LoadCounts>
    where
        S: Store,
        S::Tx: EntityTable<E>,
    {
        let received = rows.len();
        let rows = self.dedupe(rows);
        if rows.len() < received {
            tracing::debug!("Dropped {} duplicate {} rows", received - rows.len(), E::NAME);
        }
        if rows.is_empty() {
            return Ok(LoadCounts::default());
        }

        let mut tx = store.begin().await.map_err(|e| EtlError::load(E::NAME, e))?;

        match self.load_chunks(&mut tx, &rows, cancel).await {
            Ok(counts) => {
                tx.commit().await.map_err(|e| EtlError::load(E::NAME, e))?;
                tracing::info!(
                    "Loaded {} {} rows ({} inserted, {} updated)",
                    counts.affected(),
                    E::NAME,
                    counts.inserted,
                    counts.updated
                );
                Ok(counts)
            }
            Err(e) => {
                tracing::warn!("Rolling back {} load: {}", E::NAME, e);
                if let Err(rollback) = tx.rollback().await {
                    tracing::error!("Rollback of {} load failed: {}", E::NAME, rollback);
                }
                Err(e)
            }
        }
    }

    async fn load_chunks<T>(&self, tx: &mut T, rows: &[E], cancel: &CancellationToken) -> EtlResult<LoadCounts>
    where
        T: EntityTable<E>,
    {
        let total_chunks = rows.len().div_ceil(self.chunk_size);
        let mut counts = LoadCounts::default();

        for (index, chunk) in rows.chunks(self.chunk_size).enumerate() {
            if cancel.is_cancelled() {
                return Err(EtlError::Cancelled);
            }

            let mut inserts = Vec::new();
            let mut updates = Vec::new();

            for row in chunk {
                let key = self.strategy.natural_key(row);
                match tx.find(&key).await.map_err(|e| EtlError::load(E::NAME, e))? {
                    Some(existing) => updates.push(self.strategy.apply_update(&existing, row.clone())),
                    None => inserts.push(row.clone()),
                }
            }

            if !inserts.is_empty() {
                counts.inserted += tx.insert_many(&inserts).await.map_err(|e| EtlError::load(E::NAME, e))? as usize;
            }
            if !updates.is_empty() {
                counts.updated += tx.update_many(&updates).await.map_err(|e| EtlError::load(E::NAME, e))? as usize;
            }

            tracing::debug!(
                "{} chunk {}/{}: {} inserts, {} updates",
                E::NAME,
                index + 1,
                total_chunks,
                inserts.len(),
                updates.len()
            );
        }

        Ok(counts)
    }
}

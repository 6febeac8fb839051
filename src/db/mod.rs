/// Database Module
///
/// This module defines the storage seam used by every load step:
/// - `Store` hands out transactions
/// - `Transaction` is one all-or-nothing unit of work over every table
/// - `EntityTable` / `FactTable` are the per-table operations inside it
///
/// `postgres::Database` is the production backend; `memory::MemoryStore` backs the tests.
#[cfg(test)]
pub mod memory;
pub mod postgres;

use crate::error::StoreError;
use crate::models::{Customer, DimCustomer, DimDate, DimProduct, Entity, FactSales, Order, OrderDetail, Product};
use async_trait::async_trait;

#[cfg(test)]
pub use memory::MemoryStore;
pub use postgres::Database;

/// Keyed access to one table of `E` rows inside a transaction.
#[async_trait]
pub trait EntityTable<E: Entity>: Send {
    /// Look up a row by natural key
    async fn find(&mut self, key: &E::Key) -> Result<Option<E>, StoreError>;

    /// Insert new rows, letting storage assign surrogate keys where the table has one
    async fn insert_many(&mut self, rows: &[E]) -> Result<u64, StoreError>;

    /// Overwrite existing rows, matched by their storage identity
    async fn update_many(&mut self, rows: &[E]) -> Result<u64, StoreError>;

    async fn list(&mut self) -> Result<Vec<E>, StoreError>;
}

/// The sales fact table inside a transaction.
#[async_trait]
pub trait FactTable: Send {
    /// Fast full clear. May be refused by the backend, in which case callers fall
    /// back to `delete_all_facts`.
    async fn truncate_facts(&mut self) -> Result<(), StoreError>;

    async fn delete_all_facts(&mut self) -> Result<u64, StoreError>;

    async fn insert_facts(&mut self, rows: &[FactSales]) -> Result<u64, StoreError>;
}

/// One unit of work. Nothing written through it is visible until `commit`.
#[async_trait]
pub trait Transaction:
    EntityTable<Customer>
    + EntityTable<Product>
    + EntityTable<Order>
    + EntityTable<OrderDetail>
    + EntityTable<DimCustomer>
    + EntityTable<DimProduct>
    + EntityTable<DimDate>
    + FactTable
    + Send
{
    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait Store: Send + Sync {
    type Tx: Transaction;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;
}

/// Read every row of one table in a short read-only transaction.
pub async fn read_all<S, E>(store: &S) -> Result<Vec<E>, StoreError>
where
    S: Store,
    E: Entity,
    S::Tx: EntityTable<E>,
{
    let mut tx = store.begin().await?;
    let rows = EntityTable::<E>::list(&mut tx).await;
    tx.rollback().await?;
    rows
}

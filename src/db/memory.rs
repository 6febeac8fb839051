/// In-memory storage backend
///
/// Each transaction works on a private copy of the tables and swaps it in on
/// commit, so rollback and partial failure behave like the database backend.
/// Faults can be injected to exercise rollback and TRUNCATE fallback paths.
use super::{EntityTable, FactTable, Store, Transaction};
use crate::error::StoreError;
use crate::models::{Customer, DimCustomer, DimDate, DimProduct, Entity, FactSales, Order, OrderDetail, Product};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Committed table contents
#[derive(Debug, Clone, Default)]
pub struct Tables {
    pub customers: BTreeMap<i32, Customer>,
    pub products: BTreeMap<i32, Product>,
    pub orders: BTreeMap<i32, Order>,
    pub order_details: BTreeMap<(i32, i32), OrderDetail>,
    pub dim_customers: BTreeMap<i32, DimCustomer>,
    pub dim_products: BTreeMap<i32, DimProduct>,
    pub dim_dates: BTreeMap<i32, DimDate>,
    pub facts: Vec<FactSales>,
    next_customer_key: i32,
    next_product_key: i32,
    next_fact_id: i32,
}

#[derive(Debug, Default)]
struct Faults {
    /// Fail the n-th write call (1-based); 0 disables
    fail_on_write: AtomicUsize,
    writes: AtomicUsize,
    reject_truncate: AtomicBool,
}

impl Faults {
    fn record_write(&self) -> Result<(), StoreError> {
        let n = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        let target = self.fail_on_write.load(Ordering::SeqCst);
        if target != 0 && n == target {
            return Err(StoreError::Injected(format!("write #{} rejected", n)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    faults: Arc<Faults>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the n-th insert/update call from now on fail
    pub fn fail_on_write(&self, n: usize) {
        let done = self.faults.writes.load(Ordering::SeqCst);
        self.faults.fail_on_write.store(done + n, Ordering::SeqCst);
    }

    /// Refuse TRUNCATE, as a database does when the table is referenced
    pub fn reject_truncate(&self) {
        self.faults.reject_truncate.store(true, Ordering::SeqCst);
    }

    /// Copy of the committed state
    pub fn snapshot(&self) -> Tables {
        lock(&self.tables).clone()
    }
}

fn lock(tables: &Mutex<Tables>) -> MutexGuard<'_, Tables> {
    tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct MemoryTx {
    working: Tables,
    shared: Arc<Mutex<Tables>>,
    faults: Arc<Faults>,
}

#[async_trait]
impl Store for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, StoreError> {
        Ok(MemoryTx { working: self.snapshot(), shared: Arc::clone(&self.tables), faults: Arc::clone(&self.faults) })
    }
}

#[async_trait]
impl Transaction for MemoryTx {
    async fn commit(self) -> Result<(), StoreError> {
        *lock(&self.shared) = self.working;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Maps an entity type onto its table in `Tables`.
pub trait MemoryBacked: Entity {
    fn table(tables: &mut Tables) -> &mut BTreeMap<Self::Key, Self>;

    /// Assign storage-generated identity on insert
    fn assign_identity(&mut self, _tables: &mut Tables) {}
}

impl MemoryBacked for Customer {
    fn table(tables: &mut Tables) -> &mut BTreeMap<i32, Self> {
        &mut tables.customers
    }
}

impl MemoryBacked for Product {
    fn table(tables: &mut Tables) -> &mut BTreeMap<i32, Self> {
        &mut tables.products
    }
}

impl MemoryBacked for Order {
    fn table(tables: &mut Tables) -> &mut BTreeMap<i32, Self> {
        &mut tables.orders
    }
}

impl MemoryBacked for OrderDetail {
    fn table(tables: &mut Tables) -> &mut BTreeMap<(i32, i32), Self> {
        &mut tables.order_details
    }
}

impl MemoryBacked for DimCustomer {
    fn table(tables: &mut Tables) -> &mut BTreeMap<i32, Self> {
        &mut tables.dim_customers
    }

    fn assign_identity(&mut self, tables: &mut Tables) {
        if self.customer_key == 0 {
            tables.next_customer_key += 1;
            self.customer_key = tables.next_customer_key;
        }
    }
}

impl MemoryBacked for DimProduct {
    fn table(tables: &mut Tables) -> &mut BTreeMap<i32, Self> {
        &mut tables.dim_products
    }

    fn assign_identity(&mut self, tables: &mut Tables) {
        if self.product_key == 0 {
            tables.next_product_key += 1;
            self.product_key = tables.next_product_key;
        }
    }
}

impl MemoryBacked for DimDate {
    fn table(tables: &mut Tables) -> &mut BTreeMap<i32, Self> {
        &mut tables.dim_dates
    }
}

#[async_trait]
impl<E: MemoryBacked> EntityTable<E> for MemoryTx {
    async fn find(&mut self, key: &E::Key) -> Result<Option<E>, StoreError> {
        Ok(E::table(&mut self.working).get(key).cloned())
    }

    async fn insert_many(&mut self, rows: &[E]) -> Result<u64, StoreError> {
        self.faults.record_write()?;

        for row in rows {
            let key = row.natural_key();
            if E::table(&mut self.working).contains_key(&key) {
                return Err(StoreError::Duplicate { entity: E::NAME, key: format!("{:?}", key) });
            }
            let mut row = row.clone();
            row.assign_identity(&mut self.working);
            E::table(&mut self.working).insert(key, row);
        }

        Ok(rows.len() as u64)
    }

    async fn update_many(&mut self, rows: &[E]) -> Result<u64, StoreError> {
        self.faults.record_write()?;

        let table = E::table(&mut self.working);
        let mut updated = 0;
        for row in rows {
            if let Some(existing) = table.get_mut(&row.natural_key()) {
                *existing = row.clone();
                updated += 1;
            }
        }

        Ok(updated)
    }

    async fn list(&mut self) -> Result<Vec<E>, StoreError> {
        Ok(E::table(&mut self.working).values().cloned().collect())
    }
}

#[async_trait]
impl FactTable for MemoryTx {
    async fn truncate_facts(&mut self) -> Result<(), StoreError> {
        if self.faults.reject_truncate.load(Ordering::SeqCst) {
            return Err(StoreError::Unsupported("TRUNCATE"));
        }
        self.working.facts.clear();
        Ok(())
    }

    async fn delete_all_facts(&mut self) -> Result<u64, StoreError> {
        let removed = self.working.facts.len() as u64;
        self.working.facts.clear();
        Ok(removed)
    }

    async fn insert_facts(&mut self, rows: &[FactSales]) -> Result<u64, StoreError> {
        self.faults.record_write()?;

        for row in rows {
            let mut row = row.clone();
            self.working.next_fact_id += 1;
            row.fact_sales_id = self.working.next_fact_id;
            self.working.facts.push(row);
        }

        Ok(rows.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn dim_product(id: i32) -> DimProduct {
        DimProduct {
            product_key: 0,
            product_id: id,
            product_name: "Lamp".into(),
            category: "Home".into(),
            price: Decimal::new(1999, 2),
            stock: 4,
            created_at: Utc::now(),
            modified_at: None,
            is_active: true,
        }
    }

    #[tokio::test]
    async fn test_surrogate_keys_are_assigned_on_insert() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        EntityTable::<DimProduct>::insert_many(&mut tx, &[dim_product(40), dim_product(7)]).await.unwrap();
        tx.commit().await.unwrap();

        let tables = store.snapshot();
        assert_eq!(tables.dim_products[&40].product_key, 1);
        assert_eq!(tables.dim_products[&7].product_key, 2);
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_rejected() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        EntityTable::<DimProduct>::insert_many(&mut tx, &[dim_product(1)]).await.unwrap();
        let err = EntityTable::<DimProduct>::insert_many(&mut tx, &[dim_product(1)]).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { entity: "DimProduct", .. }));
    }

    #[tokio::test]
    async fn test_injected_write_failure() {
        let store = MemoryStore::new();
        store.fail_on_write(2);
        let mut tx = store.begin().await.unwrap();
        assert!(EntityTable::<DimProduct>::insert_many(&mut tx, &[dim_product(1)]).await.is_ok());
        assert!(EntityTable::<DimProduct>::insert_many(&mut tx, &[dim_product(2)]).await.is_err());
    }

    #[tokio::test]
    async fn test_truncate_can_be_refused() {
        let store = MemoryStore::new();
        store.reject_truncate();
        let mut tx = store.begin().await.unwrap();
        assert!(matches!(tx.truncate_facts().await, Err(StoreError::Unsupported(_))));
        assert_eq!(tx.delete_all_facts().await.unwrap(), 0);
    }
}

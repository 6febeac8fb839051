/// Fact Module
///
/// Full-refresh load of the sales fact table. Candidates reference customers
/// and products by natural id and dates by `yyyyMMdd`; each is resolved to
/// dimension surrogate keys, checked against the amount rules, and the valid
/// set is bulk-inserted after the table has been cleared.
use super::dimension::{date_from_key, has_date_key};
use crate::db::{EntityTable, FactTable, Store, Transaction};
use crate::error::{EtlError, EtlResult, StoreError};
use crate::models::{DimCustomer, DimDate, DimProduct, FactCandidate, FactSales, Order, OrderDetail};
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const ENTITY: &str = "FactSales";

/// Largest accepted gap between `total_amount` and `quantity * unit_price`
pub const AMOUNT_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

/// Scale of `fact_sales.unit_price`. Candidates are rounded the way the column
/// rounds, so the amount rules see the stored value.
pub const UNIT_PRICE_SCALE: u32 = 4;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FactLoadReport {
    pub inserted: usize,
    /// Candidates dropped because a dimension row was missing or inactive
    pub invalid_count: usize,
    pub validation_errors: Vec<String>,
    pub elapsed: Duration,
}

/// Every amount rule a fact breaks, labelled with its order line
pub fn validate_amounts(
    label: &str,
    quantity: i32,
    unit_price: Decimal,
    total_amount: Decimal,
    discount_amount: Decimal,
    final_amount: Decimal,
) -> Vec<String> {
    let mut errors = Vec::new();

    if quantity <= 0 {
        errors.push(format!("Fact {}: Quantity must be greater than 0", label));
    }
    if unit_price <= Decimal::ZERO {
        errors.push(format!("Fact {}: UnitPrice must be greater than 0", label));
    }
    if total_amount <= Decimal::ZERO {
        errors.push(format!("Fact {}: TotalAmount must be greater than 0", label));
    }
    if final_amount < Decimal::ZERO {
        errors.push(format!("Fact {}: FinalAmount cannot be negative", label));
    }
    if final_amount != total_amount - discount_amount {
        errors.push(format!(
            "Fact {}: FinalAmount ({}) does not equal TotalAmount - DiscountAmount ({})",
            label,
            final_amount,
            total_amount - discount_amount
        ));
    }

    let computed = Decimal::from(quantity) * unit_price;
    if (computed - total_amount).abs() > AMOUNT_TOLERANCE {
        errors.push(format!(
            "Fact {}: TotalAmount ({}) does not match Quantity * UnitPrice ({})",
            label, total_amount, computed
        ));
    }

    errors
}

fn candidate_label(candidate: &FactCandidate) -> String {
    format!("{}-{}", candidate.order_id, candidate.product_id)
}

pub fn validate_candidate(candidate: &FactCandidate) -> Vec<String> {
    validate_amounts(
        &candidate_label(candidate),
        candidate.quantity,
        candidate.unit_price,
        candidate.total_amount,
        candidate.discount_amount,
        candidate.final_amount,
    )
}

/// Join order lines to their orders. Lines without an order are skipped.
pub fn build_candidates(orders: &[Order], details: &[OrderDetail]) -> Vec<FactCandidate> {
    let by_id: HashMap<i32, &Order> = orders.iter().map(|o| (o.order_id, o)).collect();
    let mut candidates = Vec::with_capacity(details.len());

    for detail in details {
        let Some(order) = by_id.get(&detail.order_id) else {
            tracing::warn!("Order line {}-{} has no order, skipping", detail.order_id, detail.product_id);
            continue;
        };

        if !has_date_key(order.order_date) {
            tracing::warn!("Order {} date {} has no date key, skipping", order.order_id, order.order_date);
            continue;
        }

        let unit_price = if detail.quantity > 0 {
            let exact = detail.total_price / Decimal::from(detail.quantity);
            exact.round_dp_with_strategy(UNIT_PRICE_SCALE, RoundingStrategy::MidpointAwayFromZero)
        } else {
            Decimal::ZERO
        };

        candidates.push(FactCandidate {
            customer_id: order.customer_id,
            product_id: detail.product_id,
            date_id: super::dimension::date_key(order.order_date),
            order_id: order.order_id,
            quantity: detail.quantity,
            unit_price,
            total_amount: detail.total_price,
            discount_amount: Decimal::ZERO,
            final_amount: detail.total_price,
            order_status: order.status.clone(),
        });
    }

    candidates
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FactBuilder;

impl FactBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Clear the fact table and load every candidate that resolves and passes
    /// the amount rules
    pub async fn load_facts<S: Store>(
        &self,
        store: &S,
        candidates: &[FactCandidate],
        cancel: &CancellationToken,
    ) -> EtlResult<FactLoadReport> {
        let started = Instant::now();
        tracing::info!("Starting fact load for {} candidates", candidates.len());

        let mut tx = store.begin().await.map_err(|e| EtlError::load(ENTITY, e))?;

        let result: EtlResult<FactLoadReport> = async {
            clean(&mut tx).await?;
            self.resolve_and_insert(&mut tx, candidates, cancel).await
        }
        .await;

        finish(tx, result, started).await
    }

    /// Clear the fact table, then refuse to load anything unless every
    /// candidate passes the amount rules. The clear is kept either way.
    pub async fn load_facts_with_cleaning<S: Store>(
        &self,
        store: &S,
        candidates: &[FactCandidate],
        cancel: &CancellationToken,
    ) -> EtlResult<FactLoadReport> {
        let started = Instant::now();
        let mut tx = store.begin().await.map_err(|e| EtlError::load(ENTITY, e))?;

        let result: EtlResult<FactLoadReport> = async {
            clean(&mut tx).await?;

            let errors: Vec<String> = candidates.iter().flat_map(validate_candidate).collect();
            if !errors.is_empty() {
                tracing::error!("Fact validation failed for {} messages, load cancelled", errors.len());
                return Ok(FactLoadReport { validation_errors: errors, ..FactLoadReport::default() });
            }

            self.resolve_and_insert(&mut tx, candidates, cancel).await
        }
        .await;

        finish(tx, result, started).await
    }

    async fn resolve_and_insert<T: Transaction>(
        &self,
        tx: &mut T,
        candidates: &[FactCandidate],
        cancel: &CancellationToken,
    ) -> EtlResult<FactLoadReport> {
        let now = Utc::now();
        let mut report = FactLoadReport::default();
        let mut facts = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            if cancel.is_cancelled() {
                return Err(EtlError::Cancelled);
            }

            let Some(fact) = resolve(tx, candidate, now).await? else {
                tracing::warn!(
                    "No dimensions found for order {} (customer {}, product {}, date {})",
                    candidate.order_id,
                    candidate.customer_id,
                    candidate.product_id,
                    candidate.date_id
                );
                report.invalid_count += 1;
                continue;
            };

            let errors = validate_candidate(candidate);
            if errors.is_empty() {
                facts.push(fact);
            } else {
                report.validation_errors.extend(errors);
            }
        }

        if !facts.is_empty() {
            report.inserted = tx.insert_facts(&facts).await.map_err(|e| EtlError::load(ENTITY, e))? as usize;
        }

        if report.invalid_count > 0 {
            tracing::warn!("Ignored {} fact candidates with unresolved dimensions", report.invalid_count);
        }

        Ok(report)
    }
}

/// TRUNCATE, falling back to DELETE when the backend refuses
async fn clean<T: FactTable>(tx: &mut T) -> EtlResult<()> {
    match tx.truncate_facts().await {
        Ok(()) => tracing::info!("Fact table truncated"),
        Err(e) => {
            tracing::warn!("TRUNCATE of fact table failed ({}), deleting all rows instead", e);
            let removed = tx.delete_all_facts().await.map_err(|e| EtlError::load(ENTITY, e))?;
            tracing::info!("Deleted {} fact rows", removed);
        }
    }
    Ok(())
}

/// Surrogate keys for a candidate, or `None` if any dimension is missing or inactive
async fn resolve<T: Transaction>(
    tx: &mut T,
    candidate: &FactCandidate,
    now: DateTime<Utc>,
) -> EtlResult<Option<FactSales>> {
    let load_err = |e: StoreError| EtlError::load(ENTITY, e);

    let customer = EntityTable::<DimCustomer>::find(tx, &candidate.customer_id).await.map_err(load_err)?;
    let Some(customer) = customer.filter(|c| c.is_active) else {
        return Ok(None);
    };

    let product = EntityTable::<DimProduct>::find(tx, &candidate.product_id).await.map_err(load_err)?;
    let Some(product) = product.filter(|p| p.is_active) else {
        return Ok(None);
    };

    let Some(date) = date_from_key(candidate.date_id) else {
        return Ok(None);
    };
    let date_key = super::dimension::date_key(date);
    if EntityTable::<DimDate>::find(tx, &date_key).await.map_err(load_err)?.is_none() {
        return Ok(None);
    }

    Ok(Some(FactSales {
        fact_sales_id: 0,
        customer_key: customer.customer_key,
        product_key: product.product_key,
        date_key,
        order_id: candidate.order_id,
        quantity: candidate.quantity,
        unit_price: candidate.unit_price,
        total_amount: candidate.total_amount,
        discount_amount: candidate.discount_amount,
        final_amount: candidate.final_amount,
        order_status: candidate.order_status.clone(),
        created_at: now,
        modified_at: now,
        is_active: true,
    }))
}

/// Commit on success, roll back on error
async fn finish<T: Transaction>(
    tx: T,
    result: EtlResult<FactLoadReport>,
    started: Instant,
) -> EtlResult<FactLoadReport> {
    match result {
        Ok(mut report) => {
            tx.commit().await.map_err(|e| EtlError::load(ENTITY, e))?;
            report.elapsed = started.elapsed();
            tracing::info!(
                "Fact load complete: {} inserted, {} unresolved, {} invalid",
                report.inserted,
                report.invalid_count,
                report.validation_errors.len()
            );
            Ok(report)
        }
        Err(e) => {
            tracing::warn!("Rolling back fact load: {}", e);
            if let Err(rollback) = tx.rollback().await {
                tracing::error!("Rollback of fact load failed: {}", rollback);
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::etl::dimension::DimensionResolver;
    use crate::models::{Customer, Product};
    use chrono::NaiveDate;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn candidate(customer_id: i32, product_id: i32, date_id: i32, quantity: i32, total: i64) -> FactCandidate {
        let total_amount = Decimal::new(total, 2);
        FactCandidate {
            customer_id,
            product_id,
            date_id,
            order_id: 100 + product_id,
            quantity,
            unit_price: total_amount / Decimal::from(quantity.max(1)),
            total_amount,
            discount_amount: Decimal::ZERO,
            final_amount: total_amount,
            order_status: "Shipped".into(),
        }
    }

    /// Store with customer 1, products 1 and 2, and January 2024 in the date dimension
    async fn seeded_store() -> MemoryStore {
        let store = MemoryStore::new();
        let resolver = DimensionResolver::new(100);
        let cancel = CancellationToken::new();

        let customers = vec![Customer {
            customer_id: 1,
            first_name: "Ana".into(),
            last_name: "Diaz".into(),
            email: "ana@example.com".into(),
            phone: String::new(),
            city: "Lima".into(),
            country: "Peru".into(),
        }];
        let products: Vec<Product> = (1..=2)
            .map(|id| Product {
                product_id: id,
                product_name: format!("Item {}", id),
                category: "Home".into(),
                price: Decimal::new(1000, 2),
                stock: 5,
            })
            .collect();

        resolver.resolve_customers(&store, &customers, &cancel).await.unwrap();
        resolver.resolve_products(&store, &products, &cancel).await.unwrap();
        resolver.resolve_dates(&store, ymd(2024, 1, 1), ymd(2024, 1, 31), &cancel).await.unwrap();
        store
    }

    #[test]
    fn test_amount_rules() {
        assert!(validate_candidate(&candidate(1, 1, 20240105, 3, 3000)).is_empty());

        let mut off = candidate(1, 1, 20240105, 3, 3000);
        off.unit_price = Decimal::new(900, 2);
        let errors = validate_candidate(&off);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("does not match Quantity * UnitPrice"));

        let mut discounted = candidate(1, 1, 20240105, 1, 1000);
        discounted.discount_amount = Decimal::new(200, 2);
        assert!(validate_candidate(&discounted)[0].contains("does not equal TotalAmount - DiscountAmount"));
        discounted.final_amount = Decimal::new(800, 2);
        assert!(validate_candidate(&discounted).is_empty());
    }

    #[test]
    fn test_rounding_within_tolerance() {
        // 10.00 / 3 does not divide evenly
        let c = candidate(1, 1, 20240105, 3, 1000);
        assert!(validate_candidate(&c).is_empty());
    }

    #[test]
    fn test_build_candidates_joins_orders() {
        let orders = vec![Order { order_id: 7, customer_id: 3, order_date: ymd(2024, 2, 9), status: "Paid".into() }];
        let details = vec![
            OrderDetail { order_id: 7, product_id: 2, quantity: 4, total_price: Decimal::new(2000, 2) },
            OrderDetail { order_id: 8, product_id: 2, quantity: 1, total_price: Decimal::new(500, 2) },
        ];

        let candidates = build_candidates(&orders, &details);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].customer_id, 3);
        assert_eq!(candidates[0].date_id, 20240209);
        assert_eq!(candidates[0].unit_price, Decimal::new(500, 2));
        assert_eq!(candidates[0].final_amount, Decimal::new(2000, 2));
        assert_eq!(candidates[0].order_status, "Paid");
    }

    #[test]
    fn test_unit_price_is_validated_at_stored_scale() {
        let orders = vec![Order { order_id: 1, customer_id: 1, order_date: ymd(2024, 1, 5), status: "Paid".into() }];
        let details = vec![
            OrderDetail { order_id: 1, product_id: 1, quantity: 3000, total_price: Decimal::new(1000, 2) },
            OrderDetail { order_id: 1, product_id: 2, quantity: 3, total_price: Decimal::new(1000, 2) },
        ];

        let candidates = build_candidates(&orders, &details);
        assert_eq!(candidates[0].unit_price, Decimal::new(33, 4));
        assert_eq!(candidates[1].unit_price, Decimal::new(33333, 4));

        // 3000 * 0.0033 = 9.90, outside the tolerance once rounded
        let errors = validate_candidate(&candidates[0]);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("does not match Quantity * UnitPrice"));
        assert!(validate_candidate(&candidates[1]).is_empty());
    }

    #[test]
    fn test_orders_outside_key_years_are_skipped() {
        let far = NaiveDate::from_ymd_opt(250_000, 1, 1).unwrap();
        let orders = vec![
            Order { order_id: 1, customer_id: 1, order_date: far, status: "Paid".into() },
            Order { order_id: 2, customer_id: 1, order_date: ymd(2024, 1, 5), status: "Paid".into() },
        ];
        let details = vec![
            OrderDetail { order_id: 1, product_id: 1, quantity: 1, total_price: Decimal::new(500, 2) },
            OrderDetail { order_id: 2, product_id: 1, quantity: 1, total_price: Decimal::new(500, 2) },
        ];

        let candidates = build_candidates(&orders, &details);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].date_id, 20240105);
    }

    #[tokio::test]
    async fn test_unknown_product_is_counted_not_raised() {
        let store = seeded_store().await;
        let candidates = vec![candidate(1, 1, 20240105, 2, 2000), candidate(1, 99, 20240105, 1, 1000)];

        let report = FactBuilder::new().load_facts(&store, &candidates, &CancellationToken::new()).await.unwrap();

        assert_eq!(report.inserted, 1);
        assert_eq!(report.invalid_count, 1);
        assert!(report.validation_errors.is_empty());

        let facts = store.snapshot().facts;
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].date_key, 20240105);
        assert_eq!(facts[0].final_amount, facts[0].total_amount - facts[0].discount_amount);
    }

    #[tokio::test]
    async fn test_unparsable_or_missing_dates_are_unresolved() {
        let store = seeded_store().await;
        let candidates = vec![candidate(1, 1, 20241399, 1, 1000), candidate(1, 1, 20250101, 1, 1000)];

        let report = FactBuilder::new().load_facts(&store, &candidates, &CancellationToken::new()).await.unwrap();
        assert_eq!((report.inserted, report.invalid_count), (0, 2));
    }

    #[tokio::test]
    async fn test_reload_replaces_previous_facts() {
        let store = seeded_store().await;
        let builder = FactBuilder::new();
        let cancel = CancellationToken::new();

        builder.load_facts(&store, &[candidate(1, 1, 20240105, 1, 1000)], &cancel).await.unwrap();
        builder.load_facts(&store, &[candidate(1, 2, 20240106, 2, 2000)], &cancel).await.unwrap();

        let facts = store.snapshot().facts;
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].date_key, 20240106);
    }

    #[tokio::test]
    async fn test_truncate_refusal_falls_back_to_delete() {
        let store = seeded_store().await;
        let builder = FactBuilder::new();
        let cancel = CancellationToken::new();

        builder.load_facts(&store, &[candidate(1, 1, 20240105, 1, 1000)], &cancel).await.unwrap();
        store.reject_truncate();
        let report = builder.load_facts(&store, &[candidate(1, 2, 20240107, 1, 1000)], &cancel).await.unwrap();

        assert_eq!(report.inserted, 1);
        assert_eq!(store.snapshot().facts.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_amounts_are_excluded() {
        let store = seeded_store().await;
        let mut bad = candidate(1, 2, 20240105, 2, 2000);
        bad.final_amount = Decimal::new(1500, 2);

        let report = FactBuilder::new()
            .load_facts(&store, &[candidate(1, 1, 20240105, 1, 1000), bad], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.inserted, 1);
        assert_eq!(report.validation_errors.len(), 1);
    }

    #[tokio::test]
    async fn test_all_or_nothing_load_keeps_the_clean() {
        let store = seeded_store().await;
        let builder = FactBuilder::new();
        let cancel = CancellationToken::new();
        builder.load_facts(&store, &[candidate(1, 1, 20240105, 1, 1000)], &cancel).await.unwrap();

        let mut bad = candidate(1, 2, 20240105, 1, 1000);
        bad.quantity = 0;
        let report =
            builder.load_facts_with_cleaning(&store, &[candidate(1, 1, 20240106, 1, 1000), bad], &cancel).await.unwrap();

        assert_eq!(report.inserted, 0);
        assert!(!report.validation_errors.is_empty());
        assert!(store.snapshot().facts.is_empty());
    }

    #[tokio::test]
    async fn test_failed_insert_rolls_back_the_clean() {
        let store = seeded_store().await;
        let builder = FactBuilder::new();
        let cancel = CancellationToken::new();
        builder.load_facts(&store, &[candidate(1, 1, 20240105, 1, 1000)], &cancel).await.unwrap();

        store.fail_on_write(1);
        let err = builder.load_facts(&store, &[candidate(1, 2, 20240106, 1, 1000)], &cancel).await.unwrap_err();

        assert!(matches!(err, EtlError::LoadFailure { entity: "FactSales", .. }));
        assert_eq!(store.snapshot().facts.len(), 1);
    }
}

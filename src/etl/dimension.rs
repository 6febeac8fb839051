/// Dimension Module
///
/// Builds customer, product and date dimension rows from operational data
/// and upserts them by natural id. Surrogate keys are reused for known ids
/// and generated by storage for new ones.
use super::load::{BatchLoader, DimCustomerUpsert, DimProductUpsert, Overwrite};
use super::StageReport;
use crate::db::{EntityTable, Store};
use crate::error::EtlResult;
use crate::models::{Customer, DimCustomer, DimDate, DimProduct, Product};
use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use rust_decimal::Decimal;
use std::ops::RangeInclusive;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

pub const START_AFTER_END: &str = "Start date cannot be greater than end date";

/// Years representable by an 8-digit date key
pub const KEY_YEARS: RangeInclusive<i32> = 1000..=9999;

pub fn has_date_key(date: NaiveDate) -> bool {
    KEY_YEARS.contains(&date.year())
}

/// First and last day with a date key
pub fn key_date_bounds() -> (NaiveDate, NaiveDate) {
    let first = NaiveDate::from_ymd_opt(*KEY_YEARS.start(), 1, 1).unwrap_or(NaiveDate::MIN);
    let last = NaiveDate::from_ymd_opt(*KEY_YEARS.end(), 12, 31).unwrap_or(NaiveDate::MAX);
    (first, last)
}

/// `yyyyMMdd` as an integer. Only meaningful where [`has_date_key`] holds.
pub fn date_key(date: NaiveDate) -> i32 {
    date.year() * 10_000 + date.month() as i32 * 100 + date.day() as i32
}

/// Inverse of [`date_key`]; `None` for anything that is not a real calendar day
pub fn date_from_key(key: i32) -> Option<NaiveDate> {
    if !(10_000_000..=99_999_999).contains(&key) {
        return None;
    }
    NaiveDate::from_ymd_opt(key / 10_000, (key / 100 % 100) as u32, (key % 100) as u32)
}

pub fn date_row(date: NaiveDate) -> DimDate {
    let month = date.month() as i32;
    let quarter = (month - 1) / 3 + 1;
    let weekday = date.weekday();

    DimDate {
        date_key: date_key(date),
        full_date: date,
        year: date.year(),
        quarter,
        month,
        month_name: date.format("%B").to_string(),
        week_of_year: date.iso_week().week() as i32,
        day_of_year: date.ordinal() as i32,
        day_of_month: date.day() as i32,
        day_of_week: weekday.num_days_from_sunday() as i32,
        day_name: date.format("%A").to_string(),
        is_weekend: matches!(weekday, Weekday::Sat | Weekday::Sun),
        // No holiday calendar is available
        is_holiday: false,
        fiscal_year: format!("FY{}", date.year()),
        fiscal_quarter: quarter,
        fiscal_month: month,
    }
}

/// One row per day from `start` to `end` inclusive
pub fn build_date_range(start: NaiveDate, end: NaiveDate) -> Result<Vec<DimDate>, String> {
    if start > end {
        return Err(START_AFTER_END.to_string());
    }
    if !has_date_key(start) || !has_date_key(end) {
        return Err(format!("Dates must fall within years {} to {}", KEY_YEARS.start(), KEY_YEARS.end()));
    }

    Ok(start.iter_days().take_while(|d| *d <= end).map(date_row).collect())
}

pub fn to_dim_customer(customer: &Customer, now: DateTime<Utc>) -> DimCustomer {
    let country = customer.country.trim().to_string();

    DimCustomer {
        customer_key: 0,
        customer_id: customer.customer_id,
        first_name: customer.first_name.trim().to_string(),
        last_name: customer.last_name.trim().to_string(),
        email: customer.email.trim().to_lowercase(),
        phone: customer.phone.trim().to_string(),
        city: customer.city.trim().to_string(),
        region: country.clone(),
        country,
        created_at: now,
        modified_at: None,
        is_active: true,
    }
}

pub fn to_dim_product(product: &Product, now: DateTime<Utc>) -> DimProduct {
    DimProduct {
        product_key: 0,
        product_id: product.product_id,
        product_name: product.product_name.trim().to_string(),
        category: product.category.trim().to_string(),
        price: product.price,
        stock: product.stock,
        created_at: now,
        modified_at: None,
        is_active: true,
    }
}

/// Every problem with every row; any message rejects the whole batch
pub fn validate_dim_customers(rows: &[DimCustomer]) -> Vec<String> {
    let mut errors = Vec::new();

    for row in rows {
        if row.first_name.is_empty() {
            errors.push(format!("Customer {}: FirstName is required", row.customer_id));
        }
        if row.last_name.is_empty() {
            errors.push(format!("Customer {}: LastName is required", row.customer_id));
        }
        if row.email.is_empty() {
            errors.push(format!("Customer {}: Email is required", row.customer_id));
        }
    }

    errors
}

pub fn validate_dim_products(rows: &[DimProduct]) -> Vec<String> {
    let mut errors = Vec::new();

    for row in rows {
        if row.product_name.is_empty() {
            errors.push(format!("Product {}: ProductName is required", row.product_id));
        }
        if row.price <= Decimal::ZERO {
            errors.push(format!("Product {}: Price must be greater than 0", row.product_id));
        }
        if row.stock < 0 {
            errors.push(format!("Product {}: Stock cannot be negative", row.product_id));
        }
    }

    errors
}

pub struct DimensionResolver {
    customers: BatchLoader<DimCustomer>,
    products: BatchLoader<DimProduct>,
    dates: BatchLoader<DimDate>,
}

impl DimensionResolver {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            customers: BatchLoader::new(DimCustomerUpsert, chunk_size),
            products: BatchLoader::new(DimProductUpsert, chunk_size),
            dates: BatchLoader::new(Overwrite, chunk_size),
        }
    }

    pub async fn resolve_customers<S>(
        &self,
        store: &S,
        customers: &[Customer],
        cancel: &CancellationToken,
    ) -> EtlResult<StageReport>
    where
        S: Store,
        S::Tx: EntityTable<DimCustomer>,
    {
        let started = Instant::now();
        let now = Utc::now();
        let rows: Vec<DimCustomer> = customers.iter().map(|c| to_dim_customer(c, now)).collect();

        let errors = validate_dim_customers(&rows);
        if !errors.is_empty() {
            tracing::warn!("Customer dimension validation failed: {}", errors.join("; "));
            return Ok(StageReport::rejected(customers.len(), errors, started.elapsed()));
        }

        let counts = self.customers.load(store, rows, cancel).await?;
        Ok(StageReport::loaded(customers.len(), customers.len(), counts, Vec::new(), started.elapsed()))
    }

    pub async fn resolve_products<S>(
        &self,
        store: &S,
        products: &[Product],
        cancel: &CancellationToken,
    ) -> EtlResult<StageReport>
    where
        S: Store,
        S::Tx: EntityTable<DimProduct>,
    {
        let started = Instant::now();
        let now = Utc::now();
        let rows: Vec<DimProduct> = products.iter().map(|p| to_dim_product(p, now)).collect();

        let errors = validate_dim_products(&rows);
        if !errors.is_empty() {
            tracing::warn!("Product dimension validation failed: {}", errors.join("; "));
            return Ok(StageReport::rejected(products.len(), errors, started.elapsed()));
        }

        let counts = self.products.load(store, rows, cancel).await?;
        Ok(StageReport::loaded(products.len(), products.len(), counts, Vec::new(), started.elapsed()))
    }

    /// Fill the date dimension for `start..=end`
    pub async fn resolve_dates<S>(
        &self,
        store: &S,
        start: NaiveDate,
        end: NaiveDate,
        cancel: &CancellationToken,
    ) -> EtlResult<StageReport>
    where
        S: Store,
        S::Tx: EntityTable<DimDate>,
    {
        let started = Instant::now();

        let rows = match build_date_range(start, end) {
            Ok(rows) => rows,
            Err(message) => {
                tracing::warn!("Date dimension skipped for {}..{}: {}", start, end, message);
                return Ok(StageReport::rejected(0, vec![message], started.elapsed()));
            }
        };

        let received = rows.len();
        let counts = self.dates.load(store, rows, cancel).await?;
        tracing::info!("Date dimension covers {} to {} ({} days)", start, end, received);
        Ok(StageReport::loaded(received, received, counts, Vec::new(), started.elapsed()))
    }
}

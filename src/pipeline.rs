/// Pipeline Module
///
/// Orchestrates the complete run: customers → products → orders → order
/// details → dimensions → facts. Each stage is isolated: a failing stage is
/// recorded in the run summary and the next stage still runs. Cancellation
/// is the exception and aborts the whole run.
use crate::config::{EntitySources, EtlConfig};
use crate::db::{read_all, EntityTable, Store};
use crate::error::{EtlError, EtlResult};
use crate::etl::dimension::{key_date_bounds, DimensionResolver};
use crate::etl::extract::{self, Extractor, RowMapper};
use crate::etl::fact::{build_candidates, FactBuilder, FactLoadReport};
use crate::etl::load::{BatchLoader, Overwrite};
use crate::etl::staging::StagingWriter;
use crate::etl::{process_entity, transform, StageReport};
use crate::models::{
    Customer, CustomerRecord, Entity, Order, OrderDetail, OrderDetailRecord, OrderRecord, Product, ProductRecord,
};
use chrono::{Months, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PipelineStage {
    Customer,
    Product,
    Order,
    OrderDetail,
    Dimension,
    Fact,
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineStage::Customer => write!(f, "Customer"),
            PipelineStage::Product => write!(f, "Product"),
            PipelineStage::Order => write!(f, "Order"),
            PipelineStage::OrderDetail => write!(f, "OrderDetail"),
            PipelineStage::Dimension => write!(f, "Dimension"),
            PipelineStage::Fact => write!(f, "Fact"),
        }
    }
}

/// Extractors per entity, tried in order and concatenated
pub struct Sources {
    pub customers: Vec<Extractor<CustomerRecord>>,
    pub products: Vec<Extractor<ProductRecord>>,
    pub orders: Vec<Extractor<OrderRecord>>,
    pub order_details: Vec<Extractor<OrderDetailRecord>>,
}

impl Sources {
    /// File, then query, then API source for every entity, as enabled
    pub fn from_config(config: &EtlConfig) -> EtlResult<Self> {
        Ok(Self {
            customers: sources_for(config, &config.customers, extract::customer_from_row)?,
            products: sources_for(config, &config.products, extract::product_from_row)?,
            orders: sources_for(config, &config.orders, extract::order_from_row)?,
            order_details: sources_for(config, &config.order_details, extract::order_detail_from_row)?,
        })
    }
}

fn sources_for<T: DeserializeOwned + Send>(
    config: &EtlConfig,
    entity: &EntitySources,
    mapper: RowMapper<T>,
) -> EtlResult<Vec<Extractor<T>>> {
    let mut sources = Vec::new();

    if config.enable_file_source {
        sources.push(Extractor::file(entity.file.clone()));
    }

    if config.enable_query_source {
        if let (Some(url), Some(query)) = (&config.source_database_url, &entity.query) {
            sources.push(Extractor::query(url.clone(), query.clone(), entity.query_params.clone(), mapper));
        }
    }

    if config.enable_api_source {
        if let Some(endpoint) = &entity.endpoint {
            let clients = config.api_clients()?;
            sources.push(Extractor::api(clients.get(&config.api_client_name)?.clone(), endpoint.clone()));
        }
    }

    Ok(sources)
}

/// Settings the orchestrator needs from the full configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub batch_size: usize,
    pub staging_dir: Option<std::path::PathBuf>,
    pub date_years_back: u32,
    pub date_years_ahead: u32,
    /// Load no facts at all unless every candidate passes the amount rules
    pub strict_fact_validation: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: crate::etl::load::DEFAULT_CHUNK_SIZE,
            staging_dir: None,
            date_years_back: 2,
            date_years_ahead: 1,
            strict_fact_validation: false,
        }
    }
}

impl From<&EtlConfig> for PipelineConfig {
    fn from(config: &EtlConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            staging_dir: config.staging_dir.clone(),
            date_years_back: config.date_years_back,
            date_years_ahead: config.date_years_ahead,
            strict_fact_validation: config.strict_fact_validation,
        }
    }
}

/// Run execution summary
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub customers: StageReport,
    pub products: StageReport,
    pub orders: StageReport,
    pub order_details: StageReport,
    pub dim_customers: StageReport,
    pub dim_products: StageReport,
    pub dim_dates: StageReport,
    pub facts: FactLoadReport,
    pub errors: Vec<String>,
    pub elapsed: Duration,
}

impl RunSummary {
    /// A run succeeds only when nothing at all was reported
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn operational_rows(&self) -> usize {
        [&self.customers, &self.products, &self.orders, &self.order_details].iter().map(|r| r.rows_affected()).sum()
    }

    pub fn dimension_rows(&self) -> usize {
        [&self.dim_customers, &self.dim_products, &self.dim_dates].iter().map(|r| r.rows_affected()).sum()
    }
}

/// Main ETL Pipeline
pub struct Pipeline<S: Store> {
    store: S,
    sources: Sources,
    config: PipelineConfig,
    staging: Option<StagingWriter>,
    dimensions: DimensionResolver,
    facts: FactBuilder,
}

impl<S: Store> Pipeline<S> {
    /// Create a new pipeline instance
    pub fn new(store: S, sources: Sources, config: PipelineConfig) -> Self {
        Self {
            staging: config.staging_dir.clone().map(StagingWriter::new),
            dimensions: DimensionResolver::new(config.batch_size),
            facts: FactBuilder::new(),
            store,
            sources,
            config,
        }
    }

    /// Run every stage once. Fails only when cancelled; stage failures end
    /// up in `RunSummary::errors`.
    pub async fn run(&self, cancel: &CancellationToken) -> EtlResult<RunSummary> {
        self.run_at(Utc::now().date_naive(), cancel).await
    }

    /// Same as [`Pipeline::run`] with the date dimension centred on `today`
    pub async fn run_at(&self, today: NaiveDate, cancel: &CancellationToken) -> EtlResult<RunSummary> {
        let start_time = Instant::now();
        let mut summary = RunSummary::default();

        tracing::info!("Starting ETL run");
        println!("\n🚀 Starting ETL Pipeline...");
        println!("   📦 Batch size: {}", self.config.batch_size);

        let stage = PipelineStage::Customer;
        let result = self.entity_stage(&self.sources.customers, transform::validate_customer, "customers", cancel).await;
        summary.customers = record(stage, result, &mut summary.errors)?.unwrap_or_default();

        let stage = PipelineStage::Product;
        let result = self.entity_stage(&self.sources.products, transform::validate_product, "products", cancel).await;
        summary.products = record(stage, result, &mut summary.errors)?.unwrap_or_default();

        let stage = PipelineStage::Order;
        let result = self.entity_stage(&self.sources.orders, transform::validate_order, "orders", cancel).await;
        summary.orders = record(stage, result, &mut summary.errors)?.unwrap_or_default();

        let stage = PipelineStage::OrderDetail;
        let result = self
            .entity_stage(&self.sources.order_details, transform::validate_order_detail, "order_details", cancel)
            .await;
        summary.order_details = record(stage, result, &mut summary.errors)?.unwrap_or_default();

        let result = self.dimension_stage(today, cancel).await;
        if let Some((customers, products, dates)) = record_stage(PipelineStage::Dimension, result, &mut summary.errors)? {
            for report in [&customers, &products, &dates] {
                summary.errors.extend(report.validation_errors.iter().cloned());
            }
            summary.dim_customers = customers;
            summary.dim_products = products;
            summary.dim_dates = dates;
        }

        let result = self.fact_stage(cancel).await;
        if let Some(facts) = record_stage(PipelineStage::Fact, result, &mut summary.errors)? {
            summary.errors.extend(facts.validation_errors.iter().cloned());
            summary.facts = facts;
        }

        summary.elapsed = start_time.elapsed();

        tracing::info!("ETL run finished with {} errors in {:.2}s", summary.errors.len(), summary.elapsed.as_secs_f64());
        println!("\n✅ Pipeline complete!");
        print_final_stats(&summary);

        Ok(summary)
    }

    /// Extract from every source, validate, stage and upsert one entity type
    async fn entity_stage<R, E>(
        &self,
        extractors: &[Extractor<R>],
        validate: fn(&R) -> Result<E, String>,
        artifact: &str,
        cancel: &CancellationToken,
    ) -> EtlResult<StageReport>
    where
        R: DeserializeOwned + Send,
        E: Entity + Serialize,
        S::Tx: EntityTable<E>,
    {
        let mut records = Vec::new();
        for extractor in extractors {
            records.extend(extractor.extract(cancel).await?);
        }

        let loader = BatchLoader::<E>::new(Overwrite, self.config.batch_size);
        let staging = self.staging.as_ref().map(|writer| (writer, artifact));

        process_entity(&self.store, &records, validate, &loader, staging, cancel).await
    }

    async fn dimension_stage(
        &self,
        today: NaiveDate,
        cancel: &CancellationToken,
    ) -> EtlResult<(StageReport, StageReport, StageReport)> {
        let customers: Vec<Customer> = read_all(&self.store).await.map_err(|e| EtlError::load(Customer::NAME, e))?;
        let products: Vec<Product> = read_all(&self.store).await.map_err(|e| EtlError::load(Product::NAME, e))?;

        let dim_customers = self.dimensions.resolve_customers(&self.store, &customers, cancel).await?;
        let dim_products = self.dimensions.resolve_products(&self.store, &products, cancel).await?;

        let (start, end) = date_range(today, self.config.date_years_back, self.config.date_years_ahead);
        let dim_dates = self.dimensions.resolve_dates(&self.store, start, end, cancel).await?;

        Ok((dim_customers, dim_products, dim_dates))
    }

    async fn fact_stage(&self, cancel: &CancellationToken) -> EtlResult<FactLoadReport> {
        let orders: Vec<Order> = read_all(&self.store).await.map_err(|e| EtlError::load(Order::NAME, e))?;
        let details: Vec<OrderDetail> =
            read_all(&self.store).await.map_err(|e| EtlError::load(OrderDetail::NAME, e))?;

        let candidates = build_candidates(&orders, &details);
        if self.config.strict_fact_validation {
            self.facts.load_facts_with_cleaning(&self.store, &candidates, cancel).await
        } else {
            self.facts.load_facts(&self.store, &candidates, cancel).await
        }
    }
}

/// Inclusive date dimension range around `today`, clamped to dates with a key
fn date_range(today: NaiveDate, years_back: u32, years_ahead: u32) -> (NaiveDate, NaiveDate) {
    let (first, last) = key_date_bounds();
    let start = years_back
        .checked_mul(12)
        .and_then(|months| today.checked_sub_months(Months::new(months)))
        .map_or(first, |d| d.max(first));
    let end = years_ahead
        .checked_mul(12)
        .and_then(|months| today.checked_add_months(Months::new(months)))
        .map_or(last, |d| d.min(last));
    (start, end)
}

/// Keep a stage's report, or record its failure. Cancellation is passed up.
fn record_stage<T>(stage: PipelineStage, result: EtlResult<T>, errors: &mut Vec<String>) -> EtlResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_cancelled() => {
            tracing::warn!("{} stage cancelled", stage);
            Err(e)
        }
        Err(e) => {
            tracing::error!("{} processing failed: {}", stage, e);
            errors.push(format!("{} processing failed: {}", stage, e));
            Ok(None)
        }
    }
}

/// `record_stage` for entity stages, which also carry validation messages
fn record(
    stage: PipelineStage,
    result: EtlResult<StageReport>,
    errors: &mut Vec<String>,
) -> EtlResult<Option<StageReport>> {
    let report = record_stage(stage, result, errors)?;
    if let Some(report) = &report {
        errors.extend(report.validation_errors.iter().cloned());
        tracing::info!(
            "{} stage: {} received, {} processed, {} inserted, {} updated",
            stage,
            report.received,
            report.processed,
            report.inserted,
            report.updated
        );
    }
    Ok(report)
}

/// Print final statistics
fn print_final_stats(summary: &RunSummary) {
    println!("\n📊 Pipeline Statistics:");
    println!("   ⏱️  Total time: {:.2}s", summary.elapsed.as_secs_f64());
    for (name, report) in [
        ("Customers", &summary.customers),
        ("Products", &summary.products),
        ("Orders", &summary.orders),
        ("Order details", &summary.order_details),
    ] {
        println!(
            "   📦 {}: {} received, {} valid, {} inserted, {} updated",
            name,
            format_number(report.received as u64),
            format_number(report.processed as u64),
            format_number(report.inserted as u64),
            format_number(report.updated as u64)
        );
    }
    println!("   📥 Operational rows written: {}", format_number(summary.operational_rows() as u64));
    println!("   🧱 Dimension rows written: {}", format_number(summary.dimension_rows() as u64));
    println!(
        "   💾 Facts inserted: {} ({} unresolved)",
        format_number(summary.facts.inserted as u64),
        summary.facts.invalid_count
    );

    if summary.is_success() {
        println!("   ✅ Run succeeded");
    } else {
        println!("\n❌ Errors encountered: {}", summary.errors.len());
        for (i, error) in summary.errors.iter().take(5).enumerate() {
            println!("   {}. {}", i + 1, error);
        }
        if summary.errors.len() > 5 {
            println!("   ... and {} more errors", summary.errors.len() - 5);
        }
    }
}

/// Format a number with thousand separators
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();

    for (count, c) in s.chars().rev().enumerate() {
        if count > 0 && count % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }

    result.chars().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use std::path::{Path, PathBuf};

    const CUSTOMERS: &str = "\
CustomerID,FirstName,LastName,Email,Phone,City,Country
1,Ana,Diaz,ana@example.com,555-0100,Lima,Peru
2,Ben,Ortiz,ben@example.com,,Quito,Ecuador
";
    const PRODUCTS: &str = "\
ProductID,ProductName,Category,Price,Stock
10,Desk Lamp,Home,25.00,40
11,Notebook,,3.50,200
";
    const ORDERS: &str = "\
OrderID,CustomerID,OrderDate,Status
100,1,2024-01-15,Shipped
101,2,01/20/2024,Pending
";
    const ORDER_DETAILS: &str = "\
OrderID,ProductID,Quantity,TotalPrice
100,10,2,50.00
100,11,3,10.50
101,11,1,3.50
";

    async fn write_data(dir: &Path, files: &[(&str, &str)]) {
        tokio::fs::create_dir_all(dir).await.unwrap();
        for (name, content) in files {
            tokio::fs::write(dir.join(name), content).await.unwrap();
        }
    }

    fn file_sources(dir: &Path) -> Sources {
        Sources {
            customers: vec![Extractor::file(dir.join("customers.csv"))],
            products: vec![Extractor::file(dir.join("products.csv"))],
            orders: vec![Extractor::file(dir.join("orders.csv"))],
            order_details: vec![Extractor::file(dir.join("order_details.csv"))],
        }
    }

    fn temp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("sales-etl-{}-{}", name, std::process::id()))
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(1234), "1,234");
        assert_eq!(format_number(1234567), "1,234,567");
        assert_eq!(format_number(12), "12");
    }

    #[test]
    fn test_date_range_spans_years() {
        let (start, end) = date_range(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap(), 2, 1);
        assert_eq!(start, NaiveDate::from_ymd_opt(2022, 2, 28).unwrap());
        assert_eq!(end, NaiveDate::from_ymd_opt(2025, 2, 28).unwrap());

        let (start, end) = date_range(today(), u32::MAX, u32::MAX);
        assert_eq!(start, NaiveDate::from_ymd_opt(1000, 1, 1).unwrap());
        assert_eq!(end, NaiveDate::from_ymd_opt(9999, 12, 31).unwrap());
    }

    #[test]
    fn test_stage_labels() {
        assert_eq!(PipelineStage::OrderDetail.to_string(), "OrderDetail");
        assert_eq!(PipelineStage::Dimension.to_string(), "Dimension");
    }

    #[tokio::test]
    async fn test_full_run_populates_star_schema() {
        let dir = temp_dir("full");
        write_data(
            &dir,
            &[
                ("customers.csv", CUSTOMERS),
                ("products.csv", PRODUCTS),
                ("orders.csv", ORDERS),
                ("order_details.csv", ORDER_DETAILS),
            ],
        )
        .await;

        let store = MemoryStore::new();
        let pipeline = Pipeline::new(store.clone(), file_sources(&dir), PipelineConfig::default());
        let summary = pipeline.run_at(today(), &CancellationToken::new()).await.unwrap();

        assert!(summary.is_success(), "errors: {:?}", summary.errors);
        assert_eq!(summary.operational_rows(), 9);
        assert_eq!(summary.dim_customers.inserted, 2);
        assert_eq!(summary.dim_products.inserted, 2);
        assert_eq!(summary.facts.inserted, 3);
        assert_eq!(summary.facts.invalid_count, 0);

        let tables = store.snapshot();
        assert_eq!(tables.products[&11].category, "Unknown");
        assert!(tables.dim_dates.contains_key(&20220601));
        assert!(tables.dim_dates.contains_key(&20250601));
        for fact in &tables.facts {
            assert_eq!(fact.final_amount, fact.total_amount - fact.discount_amount);
            assert!(tables.dim_dates.contains_key(&fact.date_key));
        }

        // A second run reuses every surrogate key and replaces the facts
        let again = pipeline.run_at(today(), &CancellationToken::new()).await.unwrap();
        assert_eq!(again.customers.inserted, 0);
        assert_eq!(again.dim_customers.inserted, 0);
        assert_eq!(store.snapshot().facts.len(), 3);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_fails_only_its_stage() {
        let dir = temp_dir("missing");
        write_data(&dir, &[("products.csv", PRODUCTS)]).await;

        let store = MemoryStore::new();
        let pipeline = Pipeline::new(store.clone(), file_sources(&dir), PipelineConfig::default());
        let summary = pipeline.run_at(today(), &CancellationToken::new()).await.unwrap();

        assert!(!summary.is_success());
        assert!(summary.errors[0].starts_with("Customer processing failed: source file not found"));
        assert_eq!(summary.products.inserted, 2);
        assert_eq!(summary.dim_products.inserted, 2);
        assert!(summary.errors.iter().any(|e| e.starts_with("Order processing failed")));
        assert!(summary.errors.iter().any(|e| e.starts_with("OrderDetail processing failed")));

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_validation_messages_reach_the_summary() {
        let dir = temp_dir("invalid");
        let customers = format!("{}3,Cleo,,cleo@example.com,,Bogota,Colombia\n", CUSTOMERS);
        write_data(
            &dir,
            &[
                ("customers.csv", customers.as_str()),
                ("products.csv", PRODUCTS),
                ("orders.csv", ORDERS),
                ("order_details.csv", ORDER_DETAILS),
            ],
        )
        .await;

        let pipeline = Pipeline::new(MemoryStore::new(), file_sources(&dir), PipelineConfig::default());
        let summary = pipeline.run_at(today(), &CancellationToken::new()).await.unwrap();

        assert_eq!(summary.customers.processed, 2);
        assert_eq!(summary.errors, vec!["Customer 3: LastName is required".to_string()]);
        assert_eq!(summary.facts.inserted, 3);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_propagates() {
        let dir = temp_dir("cancel");
        write_data(&dir, &[("customers.csv", CUSTOMERS)]).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let pipeline = Pipeline::new(MemoryStore::new(), file_sources(&dir), PipelineConfig::default());
        let err = pipeline.run_at(today(), &cancel).await.unwrap_err();
        assert!(err.is_cancelled());

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[test]
    fn test_sources_follow_enable_flags() {
        let lookup = |key: &str| match key {
            "DATABASE_URL" => Some("postgres://localhost/dw".to_string()),
            "ENABLE_QUERY_SOURCE" => Some("true".to_string()),
            "SOURCE_DATABASE_URL" => Some("postgres://localhost/ops".to_string()),
            "CUSTOMERS_QUERY" => Some("SELECT * FROM customers WHERE city = $1".to_string()),
            "CUSTOMERS_QUERY_PARAMS" => Some("Lisbon".to_string()),
            _ => None,
        };
        let config = EtlConfig::from_lookup(lookup, &crate::cli::Cli::default()).unwrap();
        let sources = Sources::from_config(&config).unwrap();

        assert_eq!(sources.customers.len(), 2);
        match &sources.customers[1] {
            Extractor::Query(source) => assert_eq!(source.params, vec!["Lisbon".to_string()]),
            _ => panic!("expected a query source"),
        }
        assert_eq!(sources.products.len(), 1);
    }
}

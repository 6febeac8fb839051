/// Extract Module
///
/// Pulls raw records from delimited files, a PostgreSQL source or an HTTP API.
/// Every source is single-shot and honours the cancellation token at its read
/// boundaries.
use crate::api::ApiClient;
use crate::error::{EtlError, EtlResult};
use crate::models::{CustomerRecord, OrderDetailRecord, OrderRecord, ProductRecord};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::Row;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Statement timeout for query sources
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(120);

/// Maps one result row onto a raw record
pub type RowMapper<T> = fn(&PgRow) -> Result<T, sqlx::Error>;

/// Delimited file with a header row
#[derive(Debug, Clone)]
pub struct FileSource {
    pub path: PathBuf,
}

/// Read statement against a PostgreSQL source.
///
/// Parameters are bound positionally as text, so statements should cast them
/// where a column is not textual (`WHERE customer_id > $1::int`).
#[derive(Clone)]
pub struct QuerySource<T> {
    pub url: String,
    pub query: String,
    pub params: Vec<String>,
    pub mapper: RowMapper<T>,
}

/// Relative path on a named API client
#[derive(Debug, Clone)]
pub struct ApiSource {
    pub client: ApiClient,
    pub path: String,
}

#[derive(Clone)]
pub enum Extractor<T> {
    File(FileSource),
    Query(QuerySource<T>),
    Api(ApiSource),
}

impl<T: DeserializeOwned + Send> Extractor<T> {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(FileSource { path: path.into() })
    }

    pub fn query(url: impl Into<String>, query: impl Into<String>, params: Vec<String>, mapper: RowMapper<T>) -> Self {
        Self::Query(QuerySource { url: url.into(), query: query.into(), params, mapper })
    }

    pub fn api(client: ApiClient, path: impl Into<String>) -> Self {
        Self::Api(ApiSource { client, path: path.into() })
    }

    /// Short human-readable description for logs
    pub fn describe(&self) -> String {
        match self {
            Self::File(source) => format!("file {}", source.path.display()),
            Self::Query(_) => "query source".to_string(),
            Self::Api(source) => format!("api {}", source.client.url_for(&source.path)),
        }
    }

    pub async fn extract(&self, cancel: &CancellationToken) -> EtlResult<Vec<T>> {
        if cancel.is_cancelled() {
            return Err(EtlError::Cancelled);
        }

        let rows = match self {
            Self::File(source) => extract_file(source, cancel).await?,
            Self::Query(source) => extract_query(source, cancel).await?,
            Self::Api(source) => extract_api(source, cancel).await?,
        };

        tracing::info!("Extracted {} records from {}", rows.len(), self.describe());
        Ok(rows)
    }
}

async fn extract_file<T: DeserializeOwned>(source: &FileSource, cancel: &CancellationToken) -> EtlResult<Vec<T>> {
    let name = source.path.display().to_string();

    let content = tokio::select! {
        _ = cancel.cancelled() => return Err(EtlError::Cancelled),
        read = tokio::fs::read_to_string(&source.path) => match read {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EtlError::SourceNotFound(source.path.clone()))
            }
            Err(e) => return Err(EtlError::unavailable(name, e)),
        },
    };

    parse_delimited(&content, &name, cancel)
}

async fn extract_query<T>(source: &QuerySource<T>, cancel: &CancellationToken) -> EtlResult<Vec<T>> {
    let result = tokio::select! {
        _ = cancel.cancelled() => return Err(EtlError::Cancelled),
        result = tokio::time::timeout(QUERY_TIMEOUT, run_query(source)) => result,
    };

    match result {
        Ok(Ok(rows)) => Ok(rows),
        Ok(Err(e)) => Err(EtlError::unavailable("query source", e)),
        Err(_) => Err(EtlError::unavailable("query source", format!("timed out after {}s", QUERY_TIMEOUT.as_secs()))),
    }
}

async fn run_query<T>(source: &QuerySource<T>) -> Result<Vec<T>, sqlx::Error> {
    let pool = PgPoolOptions::new().max_connections(1).acquire_timeout(QUERY_TIMEOUT).connect(&source.url).await?;

    let mut query = sqlx::query(&source.query);
    for param in &source.params {
        query = query.bind(param.as_str());
    }
    let rows = query.fetch_all(&pool).await;
    pool.close().await;

    rows?.iter().map(source.mapper).collect()
}

async fn extract_api<T: DeserializeOwned>(source: &ApiSource, cancel: &CancellationToken) -> EtlResult<Vec<T>> {
    let payload = tokio::select! {
        _ = cancel.cancelled() => return Err(EtlError::Cancelled),
        payload = source.client.get_json(&source.path) => payload?,
    };

    decode_json_array(payload, &source.client.url_for(&source.path))
}

/// Lower-case a field name and drop everything but letters and digits, so
/// `Order ID`, `order_id` and `OrderId` all become `orderid`
pub fn normalize_field_name(name: &str) -> String {
    name.chars().filter(|c| c.is_alphanumeric()).flat_map(char::to_lowercase).collect()
}

/// Parse header-driven delimited text. Blank rows are ignored and rows that
/// cannot be decoded are skipped with a warning.
pub fn parse_delimited<T: DeserializeOwned>(
    content: &str,
    source_name: &str,
    cancel: &CancellationToken,
) -> EtlResult<Vec<T>> {
    let mut reader =
        csv::ReaderBuilder::new().flexible(true).trim(csv::Trim::All).from_reader(content.as_bytes());

    let headers: csv::StringRecord = reader
        .headers()
        .map_err(|e| EtlError::unavailable(source_name, e))?
        .iter()
        .map(normalize_field_name)
        .collect();

    let mut rows = Vec::new();

    for (index, result) in reader.records().enumerate() {
        if cancel.is_cancelled() {
            return Err(EtlError::Cancelled);
        }

        // Line numbers are 1-based and the header takes line 1
        let line = index + 2;
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Skipping unreadable row {} of {}: {}", line, source_name, e);
                continue;
            }
        };

        if record.iter().all(|field| field.is_empty()) {
            continue;
        }

        match record.deserialize::<T>(Some(&headers)) {
            Ok(row) => rows.push(row),
            Err(e) => tracing::warn!("Skipping row {} of {}: {}", line, source_name, e),
        }
    }

    Ok(rows)
}

/// Decode a JSON array of objects, matching keys case-insensitively
pub fn decode_json_array<T: DeserializeOwned>(payload: serde_json::Value, source_name: &str) -> EtlResult<Vec<T>> {
    let items = match payload {
        serde_json::Value::Array(items) => items,
        other => {
            return Err(EtlError::unavailable(
                source_name,
                format!("expected a JSON array, got {}", json_kind(&other)),
            ))
        }
    };

    let mut rows = Vec::with_capacity(items.len());

    for (index, item) in items.into_iter().enumerate() {
        let item = match item {
            serde_json::Value::Object(map) => serde_json::Value::Object(
                map.into_iter().map(|(key, value)| (normalize_field_name(&key), value)).collect(),
            ),
            other => other,
        };

        match serde_json::from_value::<T>(item) {
            Ok(row) => rows.push(row),
            Err(e) => tracing::warn!("Skipping item {} of {}: {}", index, source_name, e),
        }
    }

    Ok(rows)
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

// ========== Row mappers for query sources ==========
//
// Columns are read by snake_case name; absent or mistyped columns come back as
// `None` and are rejected later by validation.

fn opt<'r, V>(row: &'r PgRow, column: &str) -> Option<V>
where
    V: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get::<Option<V>, _>(column).ok().flatten()
}

pub fn customer_from_row(row: &PgRow) -> Result<CustomerRecord, sqlx::Error> {
    Ok(CustomerRecord {
        customer_id: opt(row, "customer_id"),
        first_name: opt(row, "first_name"),
        last_name: opt(row, "last_name"),
        email: opt(row, "email"),
        phone: opt(row, "phone"),
        city: opt(row, "city"),
        country: opt(row, "country"),
    })
}

pub fn product_from_row(row: &PgRow) -> Result<ProductRecord, sqlx::Error> {
    Ok(ProductRecord {
        product_id: opt(row, "product_id"),
        product_name: opt(row, "product_name"),
        category: opt(row, "category"),
        price: opt::<Decimal>(row, "price"),
        stock: opt(row, "stock"),
    })
}

pub fn order_from_row(row: &PgRow) -> Result<OrderRecord, sqlx::Error> {
    // DATE columns are rendered as ISO text, textual columns are passed through
    let order_date = opt::<NaiveDate>(row, "order_date")
        .map(|d| d.format("%Y-%m-%d").to_string())
        .or_else(|| opt::<String>(row, "order_date"));

    Ok(OrderRecord {
        order_id: opt(row, "order_id"),
        customer_id: opt(row, "customer_id"),
        order_date,
        status: opt(row, "status"),
    })
}

pub fn order_detail_from_row(row: &PgRow) -> Result<OrderDetailRecord, sqlx::Error> {
    Ok(OrderDetailRecord {
        order_id: opt(row, "order_id"),
        product_id: opt(row, "product_id"),
        quantity: opt(row, "quantity"),
        total_price: opt::<Decimal>(row, "total_price"),
    })
}

/// Configuration Module
///
/// Builds the run configuration from environment-style keys, with CLI flags
/// taking precedence. The lookup is a plain function so tests can feed a map
/// instead of the process environment.
use crate::api::{ApiClient, ApiClients};
use crate::cli::Cli;
use crate::error::{EtlError, EtlResult};
use crate::etl::load::DEFAULT_CHUNK_SIZE;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_API_CLIENT: &str = "sales-api";

/// Widest date dimension window on either side of the run date
pub const MAX_DATE_YEARS: u32 = 100;

/// Where one entity's records come from
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySources {
    pub file: PathBuf,
    pub query: Option<String>,
    /// Positional text parameters bound to `query` as `$1`, `$2`, ...
    pub query_params: Vec<String>,
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EtlConfig {
    pub database_url: String,

    pub customers: EntitySources,
    pub products: EntitySources,
    pub orders: EntitySources,
    pub order_details: EntitySources,

    pub enable_file_source: bool,
    pub enable_query_source: bool,
    pub enable_api_source: bool,

    pub source_database_url: Option<String>,
    pub api_client_name: String,
    pub api_base_url: Option<String>,
    pub api_timeout: Duration,

    pub batch_size: usize,
    pub staging_dir: Option<PathBuf>,
    pub run_interval: Duration,
    pub date_years_back: u32,
    pub date_years_ahead: u32,
    pub strict_fact_validation: bool,
}

impl EtlConfig {
    /// Load from the process environment (after `.env` has been applied)
    pub fn from_env(cli: &Cli) -> EtlResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok(), cli)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>, cli: &Cli) -> EtlResult<Self> {
        // Blank values count as unset
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let database_url = cli
            .database_url
            .clone()
            .or_else(|| get("DATABASE_URL"))
            .ok_or_else(|| EtlError::Config("DATABASE_URL is not set".to_string()))?;

        let data_dir = cli.data_dir.clone().or_else(|| get("DATA_DIR").map(PathBuf::from)).unwrap_or_else(|| "data".into());

        let entity = |prefix: &str, file_name: &str| EntitySources {
            file: get(&format!("{}_FILE", prefix)).map(PathBuf::from).unwrap_or_else(|| data_dir.join(file_name)),
            query: get(&format!("{}_QUERY", prefix)),
            query_params: get(&format!("{}_QUERY_PARAMS", prefix)).map(|raw| split_params(&raw)).unwrap_or_default(),
            endpoint: get(&format!("{}_ENDPOINT", prefix)),
        };

        let batch_size = match cli.batch_size {
            Some(size) => size,
            None => parse_or(&get, "BATCH_SIZE", DEFAULT_CHUNK_SIZE)?,
        };
        if batch_size == 0 {
            return Err(EtlError::Config("BATCH_SIZE must be greater than 0".to_string()));
        }

        let interval_minutes = match cli.interval {
            Some(minutes) => minutes,
            None => parse_or(&get, "RUN_INTERVAL_MINUTES", 60u64)?,
        };

        let date_years_back = parse_or(&get, "DATE_YEARS_BACK", 2u32)?;
        let date_years_ahead = parse_or(&get, "DATE_YEARS_AHEAD", 1u32)?;
        if date_years_back > MAX_DATE_YEARS || date_years_ahead > MAX_DATE_YEARS {
            return Err(EtlError::Config(format!(
                "DATE_YEARS_BACK and DATE_YEARS_AHEAD must be at most {}",
                MAX_DATE_YEARS
            )));
        }

        Ok(Self {
            database_url,
            customers: entity("CUSTOMERS", "customers.csv"),
            products: entity("PRODUCTS", "products.csv"),
            orders: entity("ORDERS", "orders.csv"),
            order_details: entity("ORDER_DETAILS", "order_details.csv"),
            enable_file_source: parse_bool_or(&get, "ENABLE_FILE_SOURCE", true)?,
            enable_query_source: parse_bool_or(&get, "ENABLE_QUERY_SOURCE", false)?,
            enable_api_source: parse_bool_or(&get, "ENABLE_API_SOURCE", false)?,
            source_database_url: get("SOURCE_DATABASE_URL"),
            api_client_name: get("API_CLIENT_NAME").unwrap_or_else(|| DEFAULT_API_CLIENT.to_string()),
            api_base_url: get("API_BASE_URL"),
            api_timeout: Duration::from_secs(parse_or(&get, "API_TIMEOUT_SECS", 30u64)?),
            batch_size,
            staging_dir: cli.staging_dir.clone().or_else(|| get("STAGING_DIR").map(PathBuf::from)),
            run_interval: Duration::from_secs(interval_minutes.max(1) * 60),
            date_years_back,
            date_years_ahead,
            strict_fact_validation: parse_bool_or(&get, "STRICT_FACT_VALIDATION", false)?,
        })
    }

    /// Registered API clients; empty unless a base URL is configured
    pub fn api_clients(&self) -> EtlResult<ApiClients> {
        let mut clients = ApiClients::new();
        if let Some(base_url) = &self.api_base_url {
            clients.register(ApiClient::new(&self.api_client_name, base_url, self.api_timeout)?);
        }
        Ok(clients)
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> EtlResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw.parse().map_err(|e| EtlError::Config(format!("{} has invalid value '{}': {}", key, raw, e))),
        None => Ok(default),
    }
}

fn parse_bool_or(get: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> EtlResult<bool> {
    match get(key).map(|v| v.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "true" | "1" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "false" | "0" | "no" | "off") => Ok(false),
        Some(v) => Err(EtlError::Config(format!("{} has invalid value '{}': expected true or false", key, v))),
    }
}

fn split_params(raw: &str) -> Vec<String> {
    raw.split(',').map(|param| param.trim().to_string()).collect()
}

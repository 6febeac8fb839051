/// Data Models Module
///
/// This module defines the core data structures used throughout the application:
/// raw source records as they arrive from files, queries and APIs, the
/// operational entities they are validated into, and the star-schema
/// dimension and fact rows built from those entities.
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::hash::Hash;

/// A stored row with a natural (source-assigned) identity.
///
/// `natural_key` is the explicit key extractor for the type; nothing looks
/// keys up by field name.
pub trait Entity: Clone + Debug + Send + Sync + 'static {
    type Key: Clone + Eq + Hash + Ord + Debug + Send + Sync + 'static;

    /// Name used in logs and validation messages
    const NAME: &'static str;

    fn natural_key(&self) -> Self::Key;
}

// ========== Raw source records ==========
//
// Field names are normalized (lower-cased, non-alphanumerics removed) before
// decoding, so every rename below is in normalized form. Values that are
// missing or fail to parse decode as `None` and are rejected by validation.

/// Customer row as it arrives from a source
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct CustomerRecord {
    #[serde(rename = "customerid", deserialize_with = "csv::invalid_option")]
    pub customer_id: Option<i32>,
    #[serde(rename = "firstname", deserialize_with = "csv::invalid_option")]
    pub first_name: Option<String>,
    #[serde(rename = "lastname", deserialize_with = "csv::invalid_option")]
    pub last_name: Option<String>,
    #[serde(deserialize_with = "csv::invalid_option")]
    pub email: Option<String>,
    #[serde(deserialize_with = "csv::invalid_option")]
    pub phone: Option<String>,
    #[serde(deserialize_with = "csv::invalid_option")]
    pub city: Option<String>,
    #[serde(deserialize_with = "csv::invalid_option")]
    pub country: Option<String>,
}

/// Product row as it arrives from a source
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ProductRecord {
    #[serde(rename = "productid", deserialize_with = "csv::invalid_option")]
    pub product_id: Option<i32>,
    #[serde(rename = "productname", alias = "name", deserialize_with = "csv::invalid_option")]
    pub product_name: Option<String>,
    #[serde(deserialize_with = "csv::invalid_option")]
    pub category: Option<String>,
    #[serde(deserialize_with = "csv::invalid_option")]
    pub price: Option<Decimal>,
    #[serde(deserialize_with = "csv::invalid_option")]
    pub stock: Option<i32>,
}

/// Order row as it arrives from a source. The date stays textual until
/// validation so that unparsable dates become diagnostics, not decode errors.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct OrderRecord {
    #[serde(rename = "orderid", deserialize_with = "csv::invalid_option")]
    pub order_id: Option<i32>,
    #[serde(rename = "customerid", deserialize_with = "csv::invalid_option")]
    pub customer_id: Option<i32>,
    #[serde(rename = "orderdate", deserialize_with = "csv::invalid_option")]
    pub order_date: Option<String>,
    #[serde(deserialize_with = "csv::invalid_option")]
    pub status: Option<String>,
}

/// Order line as it arrives from a source
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct OrderDetailRecord {
    #[serde(rename = "orderid", deserialize_with = "csv::invalid_option")]
    pub order_id: Option<i32>,
    #[serde(rename = "productid", deserialize_with = "csv::invalid_option")]
    pub product_id: Option<i32>,
    #[serde(deserialize_with = "csv::invalid_option")]
    pub quantity: Option<i32>,
    #[serde(rename = "totalprice", deserialize_with = "csv::invalid_option")]
    pub total_price: Option<Decimal>,
}

// ========== Operational entities ==========

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Customer {
    pub customer_id: i32,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub city: String,
    pub country: String,
}

impl Entity for Customer {
    type Key = i32;
    const NAME: &'static str = "Customer";

    fn natural_key(&self) -> i32 {
        self.customer_id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Product {
    pub product_id: i32,
    pub product_name: String,
    pub category: String,
    pub price: Decimal,
    pub stock: i32,
}

impl Entity for Product {
    type Key = i32;
    const NAME: &'static str = "Product";

    fn natural_key(&self) -> i32 {
        self.product_id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Order {
    pub order_id: i32,
    pub customer_id: i32,
    pub order_date: NaiveDate,
    pub status: String,
}

impl Entity for Order {
    type Key = i32;
    const NAME: &'static str = "Order";

    fn natural_key(&self) -> i32 {
        self.order_id
    }
}

/// Order line, identified by (order_id, product_id)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct OrderDetail {
    pub order_id: i32,
    pub product_id: i32,
    pub quantity: i32,
    pub total_price: Decimal,
}

impl Entity for OrderDetail {
    type Key = (i32, i32);
    const NAME: &'static str = "OrderDetail";

    fn natural_key(&self) -> (i32, i32) {
        (self.order_id, self.product_id)
    }
}

// ========== Dimensions ==========

/// Customer dimension. `customer_key` is the surrogate key; 0 means "not yet
/// assigned" and is replaced by storage on insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DimCustomer {
    pub customer_key: i32,
    pub customer_id: i32,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub city: String,
    pub country: String,
    pub region: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl Entity for DimCustomer {
    type Key = i32;
    const NAME: &'static str = "DimCustomer";

    fn natural_key(&self) -> i32 {
        self.customer_id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DimProduct {
    pub product_key: i32,
    pub product_id: i32,
    pub product_name: String,
    pub category: String,
    pub price: Decimal,
    pub stock: i32,
    pub created_at: DateTime<Utc>,
    pub modified_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl Entity for DimProduct {
    type Key = i32;
    const NAME: &'static str = "DimProduct";

    fn natural_key(&self) -> i32 {
        self.product_id
    }
}

/// Calendar dimension. The surrogate key is the deterministic `yyyyMMdd` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DimDate {
    pub date_key: i32,
    pub full_date: NaiveDate,
    pub year: i32,
    pub quarter: i32,
    pub month: i32,
    pub month_name: String,
    pub week_of_year: i32,
    pub day_of_year: i32,
    pub day_of_month: i32,
    /// 0 = Sunday .. 6 = Saturday
    pub day_of_week: i32,
    pub day_name: String,
    pub is_weekend: bool,
    pub is_holiday: bool,
    pub fiscal_year: String,
    pub fiscal_quarter: i32,
    pub fiscal_month: i32,
}

impl Entity for DimDate {
    type Key = i32;
    const NAME: &'static str = "DimDate";

    fn natural_key(&self) -> i32 {
        self.date_key
    }
}

// ========== Facts ==========

/// Sales fact row. Dimension references are plain surrogate keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct FactSales {
    pub fact_sales_id: i32,
    pub customer_key: i32,
    pub product_key: i32,
    pub date_key: i32,
    pub order_id: i32,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub total_amount: Decimal,
    pub discount_amount: Decimal,
    pub final_amount: Decimal,
    pub order_status: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub is_active: bool,
}

/// A fact before dimension resolution: customer and product by natural id,
/// date as an 8-digit `yyyyMMdd` integer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactCandidate {
    pub customer_id: i32,
    pub product_id: i32,
    pub date_id: i32,
    pub order_id: i32,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub total_amount: Decimal,
    pub discount_amount: Decimal,
    pub final_amount: Decimal,
    pub order_status: String,
}

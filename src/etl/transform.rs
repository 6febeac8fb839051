/// Transform Module
///
/// Turns raw source records into operational entities. Each validator is a
/// pure function returning either the entity or the first failing rule as a
/// message of the form `"<Entity> <id>: <Field> <rule>"`.
use crate::models::{
    Customer, CustomerRecord, Order, OrderDetail, OrderDetailRecord, OrderRecord, Product, ProductRecord,
};
use super::dimension::has_date_key;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;

/// Category stored for products that arrive without one
pub const UNKNOWN_CATEGORY: &str = "Unknown";

const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%m/%d/%Y"];
const DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

/// Valid rows of a batch together with the messages for the rejected ones
#[derive(Debug, Clone)]
pub struct Validated<T> {
    pub valid: Vec<T>,
    pub errors: Vec<String>,
}

impl<T> Default for Validated<T> {
    fn default() -> Self {
        Self { valid: Vec::new(), errors: Vec::new() }
    }
}

impl<T> Validated<T> {
    pub fn received(&self) -> usize {
        self.valid.len() + self.errors.len()
    }
}

/// Run `validate` over every record, keeping going past failures
pub fn validate_all<R, T>(records: &[R], validate: impl Fn(&R) -> Result<T, String>) -> Validated<T> {
    let mut out = Validated::default();

    for record in records {
        match validate(record) {
            Ok(entity) => out.valid.push(entity),
            Err(message) => {
                tracing::debug!("Rejected record: {}", message);
                out.errors.push(message);
            }
        }
    }

    out
}

/// Trimmed, non-empty text or `None`
fn text(value: &Option<String>) -> Option<String> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

fn label(id: Option<i32>) -> String {
    id.map(|id| id.to_string()).unwrap_or_else(|| "?".to_string())
}

pub fn validate_customer(record: &CustomerRecord) -> Result<Customer, String> {
    let id = label(record.customer_id);
    let customer_id = record.customer_id.ok_or_else(|| format!("Customer {}: CustomerId is required", id))?;

    let first_name = text(&record.first_name).ok_or_else(|| format!("Customer {}: FirstName is required", id))?;
    let last_name = text(&record.last_name).ok_or_else(|| format!("Customer {}: LastName is required", id))?;

    let email = text(&record.email).unwrap_or_default();
    if !email.is_empty() && !email.contains('@') {
        return Err(format!("Customer {}: Invalid email format", id));
    }

    Ok(Customer {
        customer_id,
        first_name,
        last_name,
        email,
        phone: text(&record.phone).unwrap_or_default(),
        city: text(&record.city).unwrap_or_default(),
        country: text(&record.country).unwrap_or_default(),
    })
}

pub fn validate_product(record: &ProductRecord) -> Result<Product, String> {
    let id = label(record.product_id);
    let product_id = record.product_id.ok_or_else(|| format!("Product {}: ProductId is required", id))?;

    let product_name = text(&record.product_name).ok_or_else(|| format!("Product {}: ProductName is required", id))?;

    let price = record.price.filter(|p| *p > Decimal::ZERO);
    let price = price.ok_or_else(|| format!("Product {}: Price must be greater than 0", id))?;

    let stock = record.stock.filter(|s| *s >= 0);
    let stock = stock.ok_or_else(|| format!("Product {}: Stock cannot be negative", id))?;

    Ok(Product {
        product_id,
        product_name,
        category: text(&record.category).unwrap_or_else(|| UNKNOWN_CATEGORY.to_string()),
        price,
        stock,
    })
}

pub fn validate_order(record: &OrderRecord) -> Result<Order, String> {
    let id = label(record.order_id);
    let order_id = record.order_id.ok_or_else(|| format!("Order {}: OrderId is required", id))?;

    let customer_id = record.customer_id.filter(|c| *c > 0);
    let customer_id = customer_id.ok_or_else(|| format!("Order {}: CustomerId must be greater than 0", id))?;

    let order_date = text(&record.order_date)
        .and_then(|raw| parse_order_date(&raw))
        .ok_or_else(|| format!("Order {}: Invalid OrderDate format", id))?;

    let status = text(&record.status).ok_or_else(|| format!("Order {}: Status is required", id))?;

    Ok(Order { order_id, customer_id, order_date, status })
}

pub fn validate_order_detail(record: &OrderDetailRecord) -> Result<OrderDetail, String> {
    let id = format!("{}-{}", label(record.order_id), label(record.product_id));

    let order_id = record.order_id.filter(|o| *o > 0);
    let order_id = order_id.ok_or_else(|| format!("OrderDetail {}: OrderId must be greater than 0", id))?;

    let product_id = record.product_id.filter(|p| *p > 0);
    let product_id = product_id.ok_or_else(|| format!("OrderDetail {}: ProductId must be greater than 0", id))?;

    let quantity = record.quantity.filter(|q| *q > 0);
    let quantity = quantity.ok_or_else(|| format!("OrderDetail {}: Quantity must be greater than 0", id))?;

    let total_price = record.total_price.filter(|t| *t > Decimal::ZERO);
    let total_price = total_price.ok_or_else(|| format!("OrderDetail {}: TotalPrice must be greater than 0", id))?;

    Ok(OrderDetail { order_id, product_id, quantity, total_price })
}

/// Parse an order date in any accepted layout; time of day is dropped.
/// Years without a date key are refused.
pub fn parse_order_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();

    DATE_FORMATS
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(raw, f).ok())
        .or_else(|| DATETIME_FORMATS.iter().find_map(|f| NaiveDateTime::parse_from_str(raw, f).ok()).map(|dt| dt.date()))
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.date_naive()))
        .filter(|date| has_date_key(*date))
}

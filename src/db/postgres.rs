/// PostgreSQL backend
///
/// Connection pool management, schema migrations and the table operations
/// for operational, dimension and fact tables.
use super::{EntityTable, FactTable, Store, Transaction};
use crate::error::StoreError;
use crate::models::{Customer, DimCustomer, DimDate, DimProduct, FactSales, Order, OrderDetail, Product};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, QueryBuilder};

/// Rows per multi-row INSERT, keeping bind parameters well under the protocol limit
const INSERT_BATCH: usize = 1000;

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL database")?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await.context("Failed to run database migrations")?;

        tracing::info!("Database migrations completed successfully");
        Ok(())
    }

    /// Test the database connection
    pub async fn test_connection(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await.context("Database connection test failed")?;

        Ok(())
    }
}

pub struct PgTx {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl Store for Database {
    type Tx = PgTx;

    async fn begin(&self) -> Result<PgTx, StoreError> {
        Ok(PgTx { tx: self.pool.begin().await? })
    }
}

#[async_trait]
impl Transaction for PgTx {
    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

// ========== Operational tables ==========

const CUSTOMER_COLUMNS: &str = "customer_id, first_name, last_name, email, phone, city, country";

#[async_trait]
impl EntityTable<Customer> for PgTx {
    async fn find(&mut self, key: &i32) -> Result<Option<Customer>, StoreError> {
        let sql = format!("SELECT {} FROM customers WHERE customer_id = $1", CUSTOMER_COLUMNS);
        Ok(sqlx::query_as::<_, Customer>(&sql).bind(*key).fetch_optional(&mut *self.tx).await?)
    }

    async fn insert_many(&mut self, rows: &[Customer]) -> Result<u64, StoreError> {
        let mut inserted = 0;
        for batch in rows.chunks(INSERT_BATCH) {
            let mut qb: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO customers ({}) ", CUSTOMER_COLUMNS));
            qb.push_values(batch, |mut b, c| {
                b.push_bind(c.customer_id)
                    .push_bind(c.first_name.clone())
                    .push_bind(c.last_name.clone())
                    .push_bind(c.email.clone())
                    .push_bind(c.phone.clone())
                    .push_bind(c.city.clone())
                    .push_bind(c.country.clone());
            });
            inserted += qb.build().execute(&mut *self.tx).await?.rows_affected();
        }
        Ok(inserted)
    }

    async fn update_many(&mut self, rows: &[Customer]) -> Result<u64, StoreError> {
        let mut updated = 0;
        for c in rows {
            updated += sqlx::query(
                r#"
                UPDATE customers
                SET first_name = $2, last_name = $3, email = $4, phone = $5, city = $6, country = $7
                WHERE customer_id = $1
                "#,
            )
            .bind(c.customer_id)
            .bind(&c.first_name)
            .bind(&c.last_name)
            .bind(&c.email)
            .bind(&c.phone)
            .bind(&c.city)
            .bind(&c.country)
            .execute(&mut *self.tx)
            .await?
            .rows_affected();
        }
        Ok(updated)
    }

    async fn list(&mut self) -> Result<Vec<Customer>, StoreError> {
        let sql = format!("SELECT {} FROM customers ORDER BY customer_id", CUSTOMER_COLUMNS);
        Ok(sqlx::query_as::<_, Customer>(&sql).fetch_all(&mut *self.tx).await?)
    }
}

const PRODUCT_COLUMNS: &str = "product_id, product_name, category, price, stock";

#[async_trait]
impl EntityTable<Product> for PgTx {
    async fn find(&mut self, key: &i32) -> Result<Option<Product>, StoreError> {
        let sql = format!("SELECT {} FROM products WHERE product_id = $1", PRODUCT_COLUMNS);
        Ok(sqlx::query_as::<_, Product>(&sql).bind(*key).fetch_optional(&mut *self.tx).await?)
    }

    async fn insert_many(&mut self, rows: &[Product]) -> Result<u64, StoreError> {
        let mut inserted = 0;
        for batch in rows.chunks(INSERT_BATCH) {
            let mut qb: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO products ({}) ", PRODUCT_COLUMNS));
            qb.push_values(batch, |mut b, p| {
                b.push_bind(p.product_id)
                    .push_bind(p.product_name.clone())
                    .push_bind(p.category.clone())
                    .push_bind(p.price)
                    .push_bind(p.stock);
            });
            inserted += qb.build().execute(&mut *self.tx).await?.rows_affected();
        }
        Ok(inserted)
    }

    async fn update_many(&mut self, rows: &[Product]) -> Result<u64, StoreError> {
        let mut updated = 0;
        for p in rows {
            updated += sqlx::query(
                "UPDATE products SET product_name = $2, category = $3, price = $4, stock = $5 WHERE product_id = $1",
            )
            .bind(p.product_id)
            .bind(&p.product_name)
            .bind(&p.category)
            .bind(p.price)
            .bind(p.stock)
            .execute(&mut *self.tx)
            .await?
            .rows_affected();
        }
        Ok(updated)
    }

    async fn list(&mut self) -> Result<Vec<Product>, StoreError> {
        let sql = format!("SELECT {} FROM products ORDER BY product_id", PRODUCT_COLUMNS);
        Ok(sqlx::query_as::<_, Product>(&sql).fetch_all(&mut *self.tx).await?)
    }
}

const ORDER_COLUMNS: &str = "order_id, customer_id, order_date, status";

#[async_trait]
impl EntityTable<Order> for PgTx {
    async fn find(&mut self, key: &i32) -> Result<Option<Order>, StoreError> {
        let sql = format!("SELECT {} FROM orders WHERE order_id = $1", ORDER_COLUMNS);
        Ok(sqlx::query_as::<_, Order>(&sql).bind(*key).fetch_optional(&mut *self.tx).await?)
    }

    async fn insert_many(&mut self, rows: &[Order]) -> Result<u64, StoreError> {
        let mut inserted = 0;
        for batch in rows.chunks(INSERT_BATCH) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!("INSERT INTO orders ({}) ", ORDER_COLUMNS));
            qb.push_values(batch, |mut b, o| {
                b.push_bind(o.order_id).push_bind(o.customer_id).push_bind(o.order_date).push_bind(o.status.clone());
            });
            inserted += qb.build().execute(&mut *self.tx).await?.rows_affected();
        }
        Ok(inserted)
    }

    async fn update_many(&mut self, rows: &[Order]) -> Result<u64, StoreError> {
        let mut updated = 0;
        for o in rows {
            updated += sqlx::query("UPDATE orders SET customer_id = $2, order_date = $3, status = $4 WHERE order_id = $1")
                .bind(o.order_id)
                .bind(o.customer_id)
                .bind(o.order_date)
                .bind(&o.status)
                .execute(&mut *self.tx)
                .await?
                .rows_affected();
        }
        Ok(updated)
    }

    async fn list(&mut self) -> Result<Vec<Order>, StoreError> {
        let sql = format!("SELECT {} FROM orders ORDER BY order_id", ORDER_COLUMNS);
        Ok(sqlx::query_as::<_, Order>(&sql).fetch_all(&mut *self.tx).await?)
    }
}

const ORDER_DETAIL_COLUMNS: &str = "order_id, product_id, quantity, total_price";

#[async_trait]
impl EntityTable<OrderDetail> for PgTx {
    async fn find(&mut self, key: &(i32, i32)) -> Result<Option<OrderDetail>, StoreError> {
        let sql = format!("SELECT {} FROM order_details WHERE order_id = $1 AND product_id = $2", ORDER_DETAIL_COLUMNS);
        Ok(sqlx::query_as::<_, OrderDetail>(&sql).bind(key.0).bind(key.1).fetch_optional(&mut *self.tx).await?)
    }

    async fn insert_many(&mut self, rows: &[OrderDetail]) -> Result<u64, StoreError> {
        let mut inserted = 0;
        for batch in rows.chunks(INSERT_BATCH) {
            let mut qb: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO order_details ({}) ", ORDER_DETAIL_COLUMNS));
            qb.push_values(batch, |mut b, d| {
                b.push_bind(d.order_id).push_bind(d.product_id).push_bind(d.quantity).push_bind(d.total_price);
            });
            inserted += qb.build().execute(&mut *self.tx).await?.rows_affected();
        }
        Ok(inserted)
    }

    async fn update_many(&mut self, rows: &[OrderDetail]) -> Result<u64, StoreError> {
        let mut updated = 0;
        for d in rows {
            updated += sqlx::query(
                "UPDATE order_details SET quantity = $3, total_price = $4 WHERE order_id = $1 AND product_id = $2",
            )
            .bind(d.order_id)
            .bind(d.product_id)
            .bind(d.quantity)
            .bind(d.total_price)
            .execute(&mut *self.tx)
            .await?
            .rows_affected();
        }
        Ok(updated)
    }

    async fn list(&mut self) -> Result<Vec<OrderDetail>, StoreError> {
        let sql = format!("SELECT {} FROM order_details ORDER BY order_id, product_id", ORDER_DETAIL_COLUMNS);
        Ok(sqlx::query_as::<_, OrderDetail>(&sql).fetch_all(&mut *self.tx).await?)
    }
}

// ========== Dimension tables ==========

const DIM_CUSTOMER_COLUMNS: &str = "customer_key, customer_id, first_name, last_name, email, phone, city, country, \
                                    region, created_at, modified_at, is_active";

#[async_trait]
impl EntityTable<DimCustomer> for PgTx {
    async fn find(&mut self, key: &i32) -> Result<Option<DimCustomer>, StoreError> {
        let sql = format!("SELECT {} FROM dim_customer WHERE customer_id = $1", DIM_CUSTOMER_COLUMNS);
        Ok(sqlx::query_as::<_, DimCustomer>(&sql).bind(*key).fetch_optional(&mut *self.tx).await?)
    }

    /// `customer_key` is generated by the table's sequence
    async fn insert_many(&mut self, rows: &[DimCustomer]) -> Result<u64, StoreError> {
        let mut inserted = 0;
        for batch in rows.chunks(INSERT_BATCH) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO dim_customer (customer_id, first_name, last_name, email, phone, city, country, region, \
                 created_at, modified_at, is_active) ",
            );
            qb.push_values(batch, |mut b, c| {
                b.push_bind(c.customer_id)
                    .push_bind(c.first_name.clone())
                    .push_bind(c.last_name.clone())
                    .push_bind(c.email.clone())
                    .push_bind(c.phone.clone())
                    .push_bind(c.city.clone())
                    .push_bind(c.country.clone())
                    .push_bind(c.region.clone())
                    .push_bind(c.created_at)
                    .push_bind(c.modified_at)
                    .push_bind(c.is_active);
            });
            inserted += qb.build().execute(&mut *self.tx).await?.rows_affected();
        }
        Ok(inserted)
    }

    async fn update_many(&mut self, rows: &[DimCustomer]) -> Result<u64, StoreError> {
        let mut updated = 0;
        for c in rows {
            updated += sqlx::query(
                r#"
                UPDATE dim_customer
                SET customer_id = $2, first_name = $3, last_name = $4, email = $5, phone = $6, city = $7,
                    country = $8, region = $9, created_at = $10, modified_at = $11, is_active = $12
                WHERE customer_key = $1
                "#,
            )
            .bind(c.customer_key)
            .bind(c.customer_id)
            .bind(&c.first_name)
            .bind(&c.last_name)
            .bind(&c.email)
            .bind(&c.phone)
            .bind(&c.city)
            .bind(&c.country)
            .bind(&c.region)
            .bind(c.created_at)
            .bind(c.modified_at)
            .bind(c.is_active)
            .execute(&mut *self.tx)
            .await?
            .rows_affected();
        }
        Ok(updated)
    }

    async fn list(&mut self) -> Result<Vec<DimCustomer>, StoreError> {
        let sql = format!("SELECT {} FROM dim_customer ORDER BY customer_key", DIM_CUSTOMER_COLUMNS);
        Ok(sqlx::query_as::<_, DimCustomer>(&sql).fetch_all(&mut *self.tx).await?)
    }
}

const DIM_PRODUCT_COLUMNS: &str =
    "product_key, product_id, product_name, category, price, stock, created_at, modified_at, is_active";

#[async_trait]
impl EntityTable<DimProduct> for PgTx {
    async fn find(&mut self, key: &i32) -> Result<Option<DimProduct>, StoreError> {
        let sql = format!("SELECT {} FROM dim_product WHERE product_id = $1", DIM_PRODUCT_COLUMNS);
        Ok(sqlx::query_as::<_, DimProduct>(&sql).bind(*key).fetch_optional(&mut *self.tx).await?)
    }

    async fn insert_many(&mut self, rows: &[DimProduct]) -> Result<u64, StoreError> {
        let mut inserted = 0;
        for batch in rows.chunks(INSERT_BATCH) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO dim_product (product_id, product_name, category, price, stock, created_at, modified_at, \
                 is_active) ",
            );
            qb.push_values(batch, |mut b, p| {
                b.push_bind(p.product_id)
                    .push_bind(p.product_name.clone())
                    .push_bind(p.category.clone())
                    .push_bind(p.price)
                    .push_bind(p.stock)
                    .push_bind(p.created_at)
                    .push_bind(p.modified_at)
                    .push_bind(p.is_active);
            });
            inserted += qb.build().execute(&mut *self.tx).await?.rows_affected();
        }
        Ok(inserted)
    }

    async fn update_many(&mut self, rows: &[DimProduct]) -> Result<u64, StoreError> {
        let mut updated = 0;
        for p in rows {
            updated += sqlx::query(
                r#"
                UPDATE dim_product
                SET product_id = $2, product_name = $3, category = $4, price = $5, stock = $6,
                    created_at = $7, modified_at = $8, is_active = $9
                WHERE product_key = $1
                "#,
            )
            .bind(p.product_key)
            .bind(p.product_id)
            .bind(&p.product_name)
            .bind(&p.category)
            .bind(p.price)
            .bind(p.stock)
            .bind(p.created_at)
            .bind(p.modified_at)
            .bind(p.is_active)
            .execute(&mut *self.tx)
            .await?
            .rows_affected();
        }
        Ok(updated)
    }

    async fn list(&mut self) -> Result<Vec<DimProduct>, StoreError> {
        let sql = format!("SELECT {} FROM dim_product ORDER BY product_key", DIM_PRODUCT_COLUMNS);
        Ok(sqlx::query_as::<_, DimProduct>(&sql).fetch_all(&mut *self.tx).await?)
    }
}

const DIM_DATE_COLUMNS: &str = "date_key, full_date, year, quarter, month, month_name, week_of_year, day_of_year, \
                                day_of_month, day_of_week, day_name, is_weekend, is_holiday, fiscal_year, \
                                fiscal_quarter, fiscal_month";

#[async_trait]
impl EntityTable<DimDate> for PgTx {
    async fn find(&mut self, key: &i32) -> Result<Option<DimDate>, StoreError> {
        let sql = format!("SELECT {} FROM dim_date WHERE date_key = $1", DIM_DATE_COLUMNS);
        Ok(sqlx::query_as::<_, DimDate>(&sql).bind(*key).fetch_optional(&mut *self.tx).await?)
    }

    async fn insert_many(&mut self, rows: &[DimDate]) -> Result<u64, StoreError> {
        let mut inserted = 0;
        for batch in rows.chunks(INSERT_BATCH) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!("INSERT INTO dim_date ({}) ", DIM_DATE_COLUMNS));
            qb.push_values(batch, |mut b, d| {
                b.push_bind(d.date_key)
                    .push_bind(d.full_date)
                    .push_bind(d.year)
                    .push_bind(d.quarter)
                    .push_bind(d.month)
                    .push_bind(d.month_name.clone())
                    .push_bind(d.week_of_year)
                    .push_bind(d.day_of_year)
                    .push_bind(d.day_of_month)
                    .push_bind(d.day_of_week)
                    .push_bind(d.day_name.clone())
                    .push_bind(d.is_weekend)
                    .push_bind(d.is_holiday)
                    .push_bind(d.fiscal_year.clone())
                    .push_bind(d.fiscal_quarter)
                    .push_bind(d.fiscal_month);
            });
            inserted += qb.build().execute(&mut *self.tx).await?.rows_affected();
        }
        Ok(inserted)
    }

    async fn update_many(&mut self, rows: &[DimDate]) -> Result<u64, StoreError> {
        let mut updated = 0;
        for d in rows {
            updated += sqlx::query(
                r#"
                UPDATE dim_date
                SET full_date = $2, year = $3, quarter = $4, month = $5, month_name = $6, week_of_year = $7,
                    day_of_year = $8, day_of_month = $9, day_of_week = $10, day_name = $11, is_weekend = $12,
                    is_holiday = $13, fiscal_year = $14, fiscal_quarter = $15, fiscal_month = $16
                WHERE date_key = $1
                "#,
            )
            .bind(d.date_key)
            .bind(d.full_date)
            .bind(d.year)
            .bind(d.quarter)
            .bind(d.month)
            .bind(&d.month_name)
            .bind(d.week_of_year)
            .bind(d.day_of_year)
            .bind(d.day_of_month)
            .bind(d.day_of_week)
            .bind(&d.day_name)
            .bind(d.is_weekend)
            .bind(d.is_holiday)
            .bind(&d.fiscal_year)
            .bind(d.fiscal_quarter)
            .bind(d.fiscal_month)
            .execute(&mut *self.tx)
            .await?
            .rows_affected();
        }
        Ok(updated)
    }

    async fn list(&mut self) -> Result<Vec<DimDate>, StoreError> {
        let sql = format!("SELECT {} FROM dim_date ORDER BY date_key", DIM_DATE_COLUMNS);
        Ok(sqlx::query_as::<_, DimDate>(&sql).fetch_all(&mut *self.tx).await?)
    }
}

// ========== Fact table ==========

const FACT_COLUMNS: &str = "customer_key, product_key, date_key, order_id, quantity, unit_price, total_amount, \
                            discount_amount, final_amount, order_status, created_at, modified_at, is_active";

#[async_trait]
impl FactTable for PgTx {
    /// TRUNCATE inside a savepoint so a refusal leaves the outer transaction usable
    async fn truncate_facts(&mut self) -> Result<(), StoreError> {
        sqlx::query("SAVEPOINT fact_clean").execute(&mut *self.tx).await?;

        match sqlx::query("TRUNCATE TABLE fact_sales").execute(&mut *self.tx).await {
            Ok(_) => {
                sqlx::query("RELEASE SAVEPOINT fact_clean").execute(&mut *self.tx).await?;
                Ok(())
            }
            Err(e) => {
                sqlx::query("ROLLBACK TO SAVEPOINT fact_clean").execute(&mut *self.tx).await?;
                Err(e.into())
            }
        }
    }

    async fn delete_all_facts(&mut self) -> Result<u64, StoreError> {
        Ok(sqlx::query("DELETE FROM fact_sales").execute(&mut *self.tx).await?.rows_affected())
    }

    async fn insert_facts(&mut self, rows: &[FactSales]) -> Result<u64, StoreError> {
        let mut inserted = 0;
        for batch in rows.chunks(INSERT_BATCH) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!("INSERT INTO fact_sales ({}) ", FACT_COLUMNS));
            qb.push_values(batch, |mut b, f| {
                b.push_bind(f.customer_key)
                    .push_bind(f.product_key)
                    .push_bind(f.date_key)
                    .push_bind(f.order_id)
                    .push_bind(f.quantity)
                    .push_bind(f.unit_price)
                    .push_bind(f.total_amount)
                    .push_bind(f.discount_amount)
                    .push_bind(f.final_amount)
                    .push_bind(f.order_status.clone())
                    .push_bind(f.created_at)
                    .push_bind(f.modified_at)
                    .push_bind(f.is_active);
            });
            inserted += qb.build().execute(&mut *self.tx).await?.rows_affected();
        }

        tracing::debug!("Inserted {} fact rows", inserted);
        Ok(inserted)
    }
}

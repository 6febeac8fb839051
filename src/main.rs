/// Sales Warehouse ETL
///
/// Loads operational sales data (customers, products, orders, order details)
/// from CSV files, SQL queries and HTTP APIs, then populates a star schema of
/// customer, product and date dimensions around a sales fact table.
mod api;
mod cli;
mod config;
mod db;
mod error;
mod etl;
mod models;
mod pipeline;

use anyhow::{Context, Result};
use clap::Parser;
use cli::Cli;
use config::EtlConfig;
use db::Database;
use pipeline::{format_number, Pipeline, PipelineConfig, Sources};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();
    cli.validate()?;

    println!("🚀 Starting Sales Warehouse ETL...");

    let config = EtlConfig::from_env(&cli).context("Invalid configuration. Please check your .env file")?;

    println!("📂 Data directory sources:");
    println!("   👤 {}", config.customers.file.display());
    println!("   📦 {}", config.products.file.display());
    println!("   🧾 {}", config.orders.file.display());
    println!("   📋 {}", config.order_details.file.display());

    // Initialize database connection
    println!("\n💾 Connecting to PostgreSQL database...");
    let database = Database::new(&config.database_url).await.context("Failed to connect to PostgreSQL database")?;

    // Test database connection
    database.test_connection().await.context("Database connection test failed")?;

    println!("✅ Database connected successfully!");

    if cli.skip_migrations {
        println!("⏭️  Skipping database migrations");
    } else {
        println!("📋 Running database migrations...");
        database.migrate().await.context("Failed to run database migrations")?;
        println!("✅ Database schema is up to date!");
    }

    let sources = Sources::from_config(&config).context("Failed to configure data sources")?;
    let pipeline = Pipeline::new(database, sources, PipelineConfig::from(&config));

    // Ctrl-C stops the current run at its next checkpoint
    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Shutdown requested, cancelling current run");
            signal_token.cancel();
        }
    });

    tracing::info!("Sales Warehouse ETL initialized successfully");

    if !cli.continuous {
        return match pipeline.run(&cancel).await {
            Ok(summary) if summary.is_success() => {
                println!("\n✨ ETL run complete!");
                Ok(())
            }
            Ok(summary) => {
                println!("\n⚠️  ETL run finished with {} errors", format_number(summary.errors.len() as u64));
                Ok(())
            }
            Err(e) if e.is_cancelled() => {
                println!("\n🛑 ETL run cancelled");
                Ok(())
            }
            Err(e) => Err(e).context("Pipeline execution failed"),
        };
    }

    println!("\n🔁 Continuous mode: running every {} minute(s)", config.run_interval.as_secs() / 60);
    let mut run_count: u64 = 0;

    loop {
        run_count += 1;
        tracing::info!("Starting scheduled run #{}", run_count);

        match pipeline.run(&cancel).await {
            Ok(summary) if !summary.is_success() => {
                tracing::warn!("Run #{} finished with {} errors", run_count, summary.errors.len());
            }
            Ok(_) => tracing::info!("Run #{} completed successfully", run_count),
            Err(e) if e.is_cancelled() => break,
            Err(e) => tracing::error!("Run #{} failed: {}", run_count, e),
        }

        tokio::select! {
            _ = tokio::time::sleep(config.run_interval) => {}
            _ = cancel.cancelled() => break,
        }
    }

    println!("\n🛑 Stopped after {} run(s)", format_number(run_count));

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_feeds_config() {
        let cli = Cli::parse_from(["sales-warehouse-etl", "--database-url", "postgres://localhost/dw", "--interval", "5"]);
        let config = EtlConfig::from_lookup(|_| None, &cli).unwrap();
        let pipeline_config = PipelineConfig::from(&config);

        assert_eq!(config.run_interval, std::time::Duration::from_secs(300));
        assert_eq!(pipeline_config.batch_size, config.batch_size);
        assert!(pipeline_config.staging_dir.is_none());
    }
}

/// CLI Module
///
/// Command-line interface configuration using clap.
use clap::Parser;
use std::path::PathBuf;

/// Sales Warehouse ETL - load operational sales data into a star schema
///
/// Flags override the matching environment variables.
#[derive(Parser, Debug, Default)]
#[command(name = "sales-warehouse-etl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Database connection URL (overrides DATABASE_URL env var)
    #[arg(short = 'd', long, value_name = "URL")]
    pub database_url: Option<String>,

    /// Directory holding the source CSV files (overrides DATA_DIR)
    #[arg(long, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Write validated batches as JSON here before loading (overrides STAGING_DIR)
    #[arg(long, value_name = "DIR")]
    pub staging_dir: Option<PathBuf>,

    /// Rows per upsert chunk (overrides BATCH_SIZE)
    #[arg(short = 'b', long, value_name = "SIZE")]
    pub batch_size: Option<usize>,

    /// Keep running on a fixed interval
    #[arg(short = 'c', long)]
    pub continuous: bool,

    /// Minutes between continuous runs (overrides RUN_INTERVAL_MINUTES)
    #[arg(long, value_name = "MINUTES")]
    pub interval: Option<u64>,

    /// Do not apply the bundled schema at start-up
    #[arg(long)]
    pub skip_migrations: bool,
}

impl Cli {
    /// Validate CLI arguments
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == Some(0) {
            anyhow::bail!("Batch size must be greater than 0");
        }

        if self.interval == Some(0) {
            anyhow::bail!("Interval must be at least 1 minute");
        }

        if self.interval.is_some() && !self.continuous {
            tracing::warn!("--interval has no effect without --continuous");
        }

        Ok(())
    }
}

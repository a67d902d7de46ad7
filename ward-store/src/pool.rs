use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;
use ward_common::config::Config;

/// The packaged schema migration, executed idempotently at startup.
const MIGRATION_SQL: &str = include_str!("../../migrations/001_initial_schema.sql");

/// Handle to the durable store. Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Connect to PostgreSQL with the configured pool bounds.
    pub async fn connect(config: &Config) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(config.postgres_min_connections)
            .max_connections(config.postgres_max_connections)
            .connect(&config.postgres_url)
            .await
            .context("Failed to connect to PostgreSQL")?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool; used by tests with their own setup.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Install the schema. The migration script only contains
    /// `IF NOT EXISTS` / `CREATE OR REPLACE` statements, so running it at
    /// every startup is safe.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::raw_sql(MIGRATION_SQL)
            .execute(&self.pool)
            .await
            .context("Failed to install database schema")?;
        info!("Database schema installed");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

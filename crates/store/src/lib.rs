//! SQLite persistence for the Homelab Hub.
//!
//! One [`Store`] wraps the pool; repositories are free functions taking a
//! `&mut SqliteConnection` so a single transaction can span several of them
//! (the heartbeat pipeline runs entirely inside one).

pub mod actions;
pub mod alerts;
pub mod compliance;
pub mod credentials;
pub mod host_keys;
pub mod metrics;
pub mod schema;
pub mod servers;
pub mod services;
pub mod settings;
#[cfg(test)]
pub(crate) mod testutil;
pub mod vault;

use std::str::FromStr;

use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};

use hlh_domain::Result;

/// Handle to the hub database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database at `url` and apply the schema.
    pub async fn connect(url: &str) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory database for tests. Single connection so every caller sees
    /// the same database.
    pub async fn connect_in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(sqlx::Error::from)?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        for statement in schema::STATEMENTS {
            sqlx::query(statement).execute(&mut *conn).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn acquire(&self) -> Result<PoolConnection<Sqlite>> {
        Ok(self.pool.acquire().await?)
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }
}

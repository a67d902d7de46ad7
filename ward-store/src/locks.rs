//! Advisory wallet locks.
//!
//! A lock row serializes destructive wallet operations (refresh, withdrawal
//! steps) across watcher loops and worker processes. Locks are TTL-bounded
//! so a crashed holder cannot wedge a wallet: every acquisition first runs
//! `cleanup_expired_locks()`, then races on the primary key.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{TimeDelta, Utc};
use sqlx::Row;
use tracing::debug;

use crate::pool::Store;

impl Store {
    /// Try to take the advisory lock for a wallet.
    ///
    /// Returns `true` iff this caller inserted the lock row. A `false`
    /// return means another holder has a live lock; callers should skip
    /// the guarded operation and try again next tick.
    pub async fn acquire_wallet_lock(&self, xpub_van: &str, ttl: Duration) -> Result<bool> {
        sqlx::query("SELECT cleanup_expired_locks()")
            .execute(self.pool())
            .await
            .context("Failed to clean up expired wallet locks")?;

        let expires_at =
            Utc::now() + TimeDelta::from_std(ttl).context("Lock TTL out of range")?;
        let row = sqlx::query(
            "INSERT INTO wallet_locks (xpub_van, expires_at)
             VALUES ($1, $2)
             ON CONFLICT (xpub_van) DO NOTHING
             RETURNING xpub_van",
        )
        .bind(xpub_van)
        .bind(expires_at)
        .fetch_optional(self.pool())
        .await
        .context("Failed to acquire wallet lock")?;

        let acquired = row
            .map(|row| row.try_get::<String, _>("xpub_van"))
            .transpose()?
            .is_some();
        debug!("Wallet lock {xpub_van}: acquired={acquired}");
        Ok(acquired)
    }

    /// Release the lock. A no-op when the row is already gone.
    pub async fn release_wallet_lock(&self, xpub_van: &str) -> Result<()> {
        sqlx::query("DELETE FROM wallet_locks WHERE xpub_van = $1")
            .bind(xpub_van)
            .execute(self.pool())
            .await
            .context("Failed to release wallet lock")?;
        Ok(())
    }
}

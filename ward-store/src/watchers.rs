//! The watcher registry.
//!
//! A watcher row expresses "monitor this transfer until settled, failed, or
//! expired". Rows are keyed `(xpub_van, recipient_id)`; terminal watchers
//! are deleted by the same call path that records the terminal status, so
//! the table only ever holds live monitors (plus rows waiting to expire).

use std::{
    fmt::{self, Display},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use sqlx::{postgres::PgRow, Row};
use tracing::debug;
use ward_common::{time, wallet::WalletIdentity};

use crate::pool::Store;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatcherStatus {
    Watching,
    Settled,
    Failed,
    Expired,
}

impl WatcherStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Watching => "watching",
            Self::Settled => "settled",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "watching" => Self::Watching,
            "settled" => Self::Settled,
            "failed" => Self::Failed,
            "expired" => Self::Expired,
            other => bail!("Unknown watcher status: '{other}'"),
        })
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Watching)
    }
}

impl Display for WatcherStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of `refresh_watchers`.
#[derive(Clone, Debug)]
pub struct Watcher {
    pub wallet: WalletIdentity,
    pub recipient_id: String,
    pub asset_id: Option<String>,
    pub status: WatcherStatus,
    pub refresh_count: i32,
    pub created_at: i64,
    pub last_refresh: Option<i64>,
    pub expires_at: Option<i64>,
}

fn watcher_from_row(row: &PgRow) -> Result<Watcher> {
    let status: String = row.try_get("status")?;
    Ok(Watcher {
        wallet: WalletIdentity {
            xpub_vanilla: row.try_get("xpub_van")?,
            xpub_colored: row.try_get("xpub_col")?,
            master_fingerprint: row.try_get("master_fingerprint")?,
        },
        recipient_id: row.try_get("recipient_id")?,
        asset_id: row.try_get("asset_id")?,
        status: WatcherStatus::from_str(&status)?,
        refresh_count: row.try_get("refresh_count")?,
        created_at: time::to_epoch(row.try_get::<DateTime<Utc>, _>("created_at")?),
        last_refresh: time::to_epoch_opt(
            row.try_get::<Option<DateTime<Utc>>, _>("last_refresh")?,
        ),
        expires_at: time::to_epoch_opt(row.try_get::<Option<DateTime<Utc>>, _>("expires_at")?),
    })
}

const ACTIVE_FILTER: &str = "status = 'watching' AND (expires_at IS NULL OR expires_at > NOW())";

impl Store {
    /// Create or refresh a watcher. On conflict the existing row is reset
    /// to `watching` with a fresh TTL and a zeroed refresh counter.
    pub async fn create_watcher(
        &self,
        wallet: &WalletIdentity,
        recipient_id: &str,
        asset_id: Option<&str>,
        ttl: Duration,
    ) -> Result<()> {
        let expires_at = Utc::now()
            + TimeDelta::from_std(ttl).context("Watcher TTL out of range")?;
        sqlx::query(
            "INSERT INTO refresh_watchers (
                 xpub_van, xpub_col, master_fingerprint, recipient_id,
                 asset_id, status, created_at, expires_at
             ) VALUES ($1, $2, $3, $4, $5, 'watching', NOW(), $6)
             ON CONFLICT (xpub_van, recipient_id) DO UPDATE SET
                 status = 'watching',
                 expires_at = $6,
                 refresh_count = 0,
                 xpub_col = EXCLUDED.xpub_col,
                 master_fingerprint = EXCLUDED.master_fingerprint,
                 asset_id = EXCLUDED.asset_id",
        )
        .bind(&wallet.xpub_vanilla)
        .bind(&wallet.xpub_colored)
        .bind(&wallet.master_fingerprint)
        .bind(recipient_id)
        .bind(asset_id)
        .bind(expires_at)
        .execute(self.pool())
        .await
        .context("Failed to create watcher")?;
        debug!(
            "Created/updated watcher for {wallet}:{recipient_id}",
            wallet = wallet.short_id()
        );
        Ok(())
    }

    pub async fn get_watcher(
        &self,
        xpub_van: &str,
        recipient_id: &str,
    ) -> Result<Option<Watcher>> {
        let row = sqlx::query(
            "SELECT * FROM refresh_watchers WHERE xpub_van = $1 AND recipient_id = $2",
        )
        .bind(xpub_van)
        .bind(recipient_id)
        .fetch_optional(self.pool())
        .await
        .context("Failed to fetch watcher")?;
        row.as_ref().map(watcher_from_row).transpose()
    }

    pub async fn update_watcher_status(
        &self,
        xpub_van: &str,
        recipient_id: &str,
        status: WatcherStatus,
        refresh_count: Option<i32>,
    ) -> Result<()> {
        match refresh_count {
            Some(count) => {
                sqlx::query(
                    "UPDATE refresh_watchers
                     SET status = $3, last_refresh = NOW(), refresh_count = $4
                     WHERE xpub_van = $1 AND recipient_id = $2",
                )
                .bind(xpub_van)
                .bind(recipient_id)
                .bind(status.as_str())
                .bind(count)
                .execute(self.pool())
                .await
            }
            None => {
                sqlx::query(
                    "UPDATE refresh_watchers
                     SET status = $3, last_refresh = NOW()
                     WHERE xpub_van = $1 AND recipient_id = $2",
                )
                .bind(xpub_van)
                .bind(recipient_id)
                .bind(status.as_str())
                .execute(self.pool())
                .await
            }
        }
        .context("Failed to update watcher status")?;
        Ok(())
    }

    /// Record the asset a transfer turned out to belong to, and extend the
    /// watcher to the transfer's own expiration when it has one.
    pub async fn update_watcher_asset_and_expiration(
        &self,
        xpub_van: &str,
        recipient_id: &str,
        asset_id: &str,
        expiration: Option<i64>,
    ) -> Result<()> {
        let expires_at = expiration.map(time::from_epoch);
        sqlx::query(
            "UPDATE refresh_watchers
             SET asset_id = $3, expires_at = COALESCE($4, expires_at)
             WHERE xpub_van = $1 AND recipient_id = $2",
        )
        .bind(xpub_van)
        .bind(recipient_id)
        .bind(asset_id)
        .bind(expires_at)
        .execute(self.pool())
        .await
        .context("Failed to update watcher asset")?;
        Ok(())
    }

    /// Remove a watcher. Safe to call when the row no longer exists.
    pub async fn stop_watcher(&self, xpub_van: &str, recipient_id: &str) -> Result<()> {
        sqlx::query(
            "DELETE FROM refresh_watchers WHERE xpub_van = $1 AND recipient_id = $2",
        )
        .bind(xpub_van)
        .bind(recipient_id)
        .execute(self.pool())
        .await
        .context("Failed to stop watcher")?;
        Ok(())
    }

    /// All live watchers across every wallet (for recovery).
    pub async fn active_watchers(&self) -> Result<Vec<Watcher>> {
        let rows = sqlx::query(&format!(
            "SELECT * FROM refresh_watchers WHERE {ACTIVE_FILTER}"
        ))
        .fetch_all(self.pool())
        .await
        .context("Failed to list active watchers")?;
        rows.iter().map(watcher_from_row).collect()
    }

    /// Live watchers for one wallet, oldest first.
    pub async fn active_watchers_for_wallet(&self, xpub_van: &str) -> Result<Vec<Watcher>> {
        let rows = sqlx::query(&format!(
            "SELECT * FROM refresh_watchers
             WHERE xpub_van = $1 AND {ACTIVE_FILTER}
             ORDER BY created_at ASC"
        ))
        .bind(xpub_van)
        .fetch_all(self.pool())
        .await
        .context("Failed to list active watchers for wallet")?;
        rows.iter().map(watcher_from_row).collect()
    }

    /// Wallets that currently have at least one live watcher.
    pub async fn watcher_wallets(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(&format!(
            "SELECT DISTINCT xpub_van FROM refresh_watchers WHERE {ACTIVE_FILTER}"
        ))
        .fetch_all(self.pool())
        .await
        .context("Failed to list wallets with active watchers")?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("xpub_van").map_err(Into::into))
            .collect()
    }
}

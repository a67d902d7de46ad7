//! Durable withdrawal state.
//!
//! One row per withdrawal, keyed by `withdrawal_id` with a unique
//! `idempotency_key`. The orchestrator re-reads the row between steps and
//! persists every mutation, so `process_withdrawal` can be re-invoked after
//! a crash and resume from the last recorded status.

use std::fmt::{self, Display};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, Row};
use uuid::Uuid;
use ward_common::{time, wallet::WalletIdentity};

use crate::pool::Store;

/// Withdrawal state machine statuses, persisted as SCREAMING_SNAKE text.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WithdrawalStatus {
    Requested,
    ClosingChannels,
    WaitingCloseConfirmations,
    WaitingBalanceUpdate,
    SweepingOutputs,
    Broadcasted,
    Confirmed,
    Failed,
}

impl WithdrawalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "REQUESTED",
            Self::ClosingChannels => "CLOSING_CHANNELS",
            Self::WaitingCloseConfirmations => "WAITING_CLOSE_CONFIRMATIONS",
            Self::WaitingBalanceUpdate => "WAITING_BALANCE_UPDATE",
            Self::SweepingOutputs => "SWEEPING_OUTPUTS",
            Self::Broadcasted => "BROADCASTED",
            Self::Confirmed => "CONFIRMED",
            Self::Failed => "FAILED",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "REQUESTED" => Self::Requested,
            "CLOSING_CHANNELS" => Self::ClosingChannels,
            "WAITING_CLOSE_CONFIRMATIONS" => Self::WaitingCloseConfirmations,
            "WAITING_BALANCE_UPDATE" => Self::WaitingBalanceUpdate,
            "SWEEPING_OUTPUTS" => Self::SweepingOutputs,
            "BROADCASTED" => Self::Broadcasted,
            "CONFIRMED" => Self::Confirmed,
            "FAILED" => Self::Failed,
            other => bail!("Unknown withdrawal status: '{other}'"),
        })
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed)
    }
}

impl Display for WithdrawalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the withdrawn funds come from. Only channel liquidity today.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WithdrawalSource {
    ChannelsOnly,
}

impl WithdrawalSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChannelsOnly => "channels_only",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "channels_only" => Self::ChannelsOnly,
            other => bail!("Unknown withdrawal source: '{other}'"),
        })
    }
}

/// One row of `withdrawals`.
#[derive(Clone, Debug)]
pub struct Withdrawal {
    pub withdrawal_id: Uuid,
    pub idempotency_key: String,
    pub wallet: WalletIdentity,
    /// Destination: a Bitcoin address, or an `rgb:` invoice for asset
    /// withdrawals.
    pub address_or_invoice: String,
    pub asset_id: Option<String>,
    pub asset_amount: Option<i64>,
    pub source: WithdrawalSource,
    pub amount_sats_requested: Option<i64>,
    pub amount_sats_sent: Option<i64>,
    pub fee_rate: i64,
    pub deduct_fee_from_amount: bool,
    pub fee_sats: Option<i64>,
    pub baseline_balance_sats: Option<i64>,
    pub balance_wait_started_at: Option<i64>,
    pub channel_ids_to_close: Vec<String>,
    pub close_txids: Vec<String>,
    pub sweep_txid: Option<String>,
    pub status: WithdrawalStatus,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub retryable: bool,
    pub attempt_count: i32,
    pub last_attempt_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

fn withdrawal_from_row(row: &PgRow) -> Result<Withdrawal> {
    let status: String = row.try_get("status")?;
    let source: String = row.try_get("source")?;
    Ok(Withdrawal {
        withdrawal_id: row.try_get("withdrawal_id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        wallet: WalletIdentity {
            xpub_vanilla: row.try_get("xpub_van")?,
            xpub_colored: row.try_get("xpub_col")?,
            master_fingerprint: row.try_get("master_fingerprint")?,
        },
        address_or_invoice: row.try_get("address_or_invoice")?,
        asset_id: row.try_get("asset_id")?,
        asset_amount: row.try_get("asset_amount")?,
        source: WithdrawalSource::from_str(&source)?,
        amount_sats_requested: row.try_get("amount_sats_requested")?,
        amount_sats_sent: row.try_get("amount_sats_sent")?,
        fee_rate: row.try_get("fee_rate")?,
        deduct_fee_from_amount: row.try_get("deduct_fee_from_amount")?,
        fee_sats: row.try_get("fee_sats")?,
        baseline_balance_sats: row.try_get("baseline_balance_sats")?,
        balance_wait_started_at: time::to_epoch_opt(
            row.try_get::<Option<DateTime<Utc>>, _>("balance_wait_started_at")?,
        ),
        channel_ids_to_close: row.try_get("channel_ids_to_close")?,
        close_txids: row.try_get("close_txids")?,
        sweep_txid: row.try_get("sweep_txid")?,
        status: WithdrawalStatus::from_str(&status)?,
        error_code: row.try_get("error_code")?,
        error_message: row.try_get("error_message")?,
        retryable: row.try_get("retryable")?,
        attempt_count: row.try_get("attempt_count")?,
        last_attempt_at: time::to_epoch_opt(
            row.try_get::<Option<DateTime<Utc>>, _>("last_attempt_at")?,
        ),
        created_at: time::to_epoch(row.try_get::<DateTime<Utc>, _>("created_at")?),
        updated_at: time::to_epoch(row.try_get::<DateTime<Utc>, _>("updated_at")?),
    })
}

impl Store {
    /// Insert a fresh withdrawal row. Fails on an idempotency-key conflict;
    /// callers check for an existing row first and treat a race here as
    /// "someone else created it".
    pub async fn insert_withdrawal(&self, w: &Withdrawal) -> Result<()> {
        sqlx::query(
            "INSERT INTO withdrawals (
                 withdrawal_id, idempotency_key,
                 xpub_van, xpub_col, master_fingerprint,
                 address_or_invoice, asset_id, asset_amount, source,
                 amount_sats_requested, fee_rate, deduct_fee_from_amount,
                 status, created_at, updated_at
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                       $13, NOW(), NOW())",
        )
        .bind(w.withdrawal_id)
        .bind(&w.idempotency_key)
        .bind(&w.wallet.xpub_vanilla)
        .bind(&w.wallet.xpub_colored)
        .bind(&w.wallet.master_fingerprint)
        .bind(&w.address_or_invoice)
        .bind(&w.asset_id)
        .bind(w.asset_amount)
        .bind(w.source.as_str())
        .bind(w.amount_sats_requested)
        .bind(w.fee_rate)
        .bind(w.deduct_fee_from_amount)
        .bind(w.status.as_str())
        .execute(self.pool())
        .await
        .context("Failed to insert withdrawal")?;
        Ok(())
    }

    pub async fn get_withdrawal(&self, withdrawal_id: Uuid) -> Result<Option<Withdrawal>> {
        let row = sqlx::query("SELECT * FROM withdrawals WHERE withdrawal_id = $1")
            .bind(withdrawal_id)
            .fetch_optional(self.pool())
            .await
            .context("Failed to fetch withdrawal")?;
        row.as_ref().map(withdrawal_from_row).transpose()
    }

    pub async fn get_withdrawal_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<Withdrawal>> {
        let row = sqlx::query("SELECT * FROM withdrawals WHERE idempotency_key = $1")
            .bind(idempotency_key)
            .fetch_optional(self.pool())
            .await
            .context("Failed to fetch withdrawal by idempotency key")?;
        row.as_ref().map(withdrawal_from_row).transpose()
    }

    /// Persist the mutable progress fields of a withdrawal.
    pub async fn save_withdrawal(&self, w: &Withdrawal) -> Result<()> {
        sqlx::query(
            "UPDATE withdrawals SET
                 amount_sats_sent = $2,
                 fee_sats = $3,
                 baseline_balance_sats = $4,
                 balance_wait_started_at = $5,
                 channel_ids_to_close = $6,
                 close_txids = $7,
                 sweep_txid = $8,
                 updated_at = NOW()
             WHERE withdrawal_id = $1",
        )
        .bind(w.withdrawal_id)
        .bind(w.amount_sats_sent)
        .bind(w.fee_sats)
        .bind(w.baseline_balance_sats)
        .bind(w.balance_wait_started_at.map(time::from_epoch))
        .bind(&w.channel_ids_to_close)
        .bind(&w.close_txids)
        .bind(&w.sweep_txid)
        .execute(self.pool())
        .await
        .context("Failed to save withdrawal")?;
        Ok(())
    }

    /// Record a status transition, bumping the attempt counter. Error
    /// fields are written when present and left untouched otherwise.
    pub async fn update_withdrawal_status(
        &self,
        withdrawal_id: Uuid,
        status: WithdrawalStatus,
        error_code: Option<&str>,
        error_message: Option<&str>,
        retryable: bool,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE withdrawals SET
                 status = $2,
                 error_code = COALESCE($3, error_code),
                 error_message = COALESCE($4, error_message),
                 retryable = $5,
                 attempt_count = attempt_count + 1,
                 last_attempt_at = NOW(),
                 updated_at = NOW()
             WHERE withdrawal_id = $1",
        )
        .bind(withdrawal_id)
        .bind(status.as_str())
        .bind(error_code)
        .bind(error_message)
        .bind(retryable)
        .execute(self.pool())
        .await
        .context("Failed to update withdrawal status")?;
        Ok(())
    }

    /// Non-terminal withdrawals, oldest first; resumed at startup.
    pub async fn resumable_withdrawals(&self) -> Result<Vec<Withdrawal>> {
        let rows = sqlx::query(
            "SELECT * FROM withdrawals
             WHERE status NOT IN ('CONFIRMED', 'FAILED')
             ORDER BY created_at ASC",
        )
        .fetch_all(self.pool())
        .await
        .context("Failed to list resumable withdrawals")?;
        rows.iter().map(withdrawal_from_row).collect()
    }
}

//! The refresh job queue.
//!
//! Jobs are units of asynchronous work on one wallet. Many jobs may exist
//! per wallet; dequeueing is serialized per wallet through
//! `FOR UPDATE SKIP LOCKED` plus the one-worker-per-wallet process model.
//! Rows are retained after completion for audit.

use std::fmt::{self, Display};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, Row};
use tracing::debug;
use uuid::Uuid;
use ward_common::{time, wallet::WalletIdentity};

use crate::pool::Store;

/// Job lifecycle: `pending → processing → {completed | failed}`, with a
/// failed attempt re-queued to `pending` while retries remain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "pending" => Self::Pending,
            "processing" => Self::Processing,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            other => bail!("Unknown job status: '{other}'"),
        })
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What caused a job to be enqueued.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobTrigger {
    Manual,
    Sync,
    AssetSent,
    InvoiceCreated,
    Recovery,
}

impl JobTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Sync => "sync",
            Self::AssetSent => "asset_sent",
            Self::InvoiceCreated => "invoice_created",
            Self::Recovery => "recovery",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "manual" => Self::Manual,
            "sync" => Self::Sync,
            "asset_sent" => Self::AssetSent,
            "invoice_created" => Self::InvoiceCreated,
            "recovery" => Self::Recovery,
            other => bail!("Unknown job trigger: '{other}'"),
        })
    }
}

impl Display for JobTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of `refresh_jobs`.
#[derive(Clone, Debug)]
pub struct RefreshJob {
    pub id: i64,
    pub job_id: Uuid,
    pub wallet: WalletIdentity,
    pub trigger: JobTrigger,
    pub recipient_id: Option<String>,
    pub asset_id: Option<String>,
    pub status: JobStatus,
    pub attempts: i32,
    pub max_retries: i32,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub processed_at: Option<i64>,
}

fn job_from_row(row: &PgRow) -> Result<RefreshJob> {
    let status: String = row.try_get("status")?;
    let trigger: String = row.try_get("trigger")?;
    Ok(RefreshJob {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        wallet: WalletIdentity {
            xpub_vanilla: row.try_get("xpub_van")?,
            xpub_colored: row.try_get("xpub_col")?,
            master_fingerprint: row.try_get("master_fingerprint")?,
        },
        trigger: JobTrigger::from_str(&trigger)?,
        recipient_id: row.try_get("recipient_id")?,
        asset_id: row.try_get("asset_id")?,
        status: JobStatus::from_str(&status)?,
        attempts: row.try_get("attempts")?,
        max_retries: row.try_get("max_retries")?,
        error_message: row.try_get("error_message")?,
        created_at: time::to_epoch(row.try_get::<DateTime<Utc>, _>("created_at")?),
        processed_at: time::to_epoch_opt(
            row.try_get::<Option<DateTime<Utc>>, _>("processed_at")?,
        ),
    })
}

impl Store {
    /// Insert a new `pending` job and return its fresh id. Multiple
    /// concurrent jobs for the same wallet are permitted.
    pub async fn enqueue_job(
        &self,
        wallet: &WalletIdentity,
        trigger: JobTrigger,
        recipient_id: Option<&str>,
        asset_id: Option<&str>,
        max_retries: u32,
    ) -> Result<Uuid> {
        let job_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO refresh_jobs (
                 job_id, xpub_van, xpub_col, master_fingerprint,
                 trigger, recipient_id, asset_id, status, created_at, max_retries
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', NOW(), $8)",
        )
        .bind(job_id)
        .bind(&wallet.xpub_vanilla)
        .bind(&wallet.xpub_colored)
        .bind(&wallet.master_fingerprint)
        .bind(trigger.as_str())
        .bind(recipient_id)
        .bind(asset_id)
        .bind(max_retries as i32)
        .execute(self.pool())
        .await
        .context("Failed to enqueue refresh job")?;
        debug!(
            "Enqueued {trigger} job {job_id} for {wallet}",
            wallet = wallet.short_id()
        );
        Ok(job_id)
    }

    /// Dequeue the oldest pending job for one wallet, flipping it to
    /// `processing`. The row lock (`FOR UPDATE SKIP LOCKED`) makes this
    /// safe under any number of concurrent callers: at most one gets the
    /// row, the rest see `None`.
    pub async fn dequeue_job_for_wallet(&self, xpub_van: &str) -> Result<Option<RefreshJob>> {
        let mut txn = self
            .pool()
            .begin()
            .await
            .context("Failed to begin dequeue transaction")?;

        let row = sqlx::query(
            "SELECT * FROM refresh_jobs
             WHERE xpub_van = $1 AND status = 'pending'
             ORDER BY created_at ASC
             FOR UPDATE SKIP LOCKED
             LIMIT 1",
        )
        .bind(xpub_van)
        .fetch_optional(&mut *txn)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut job = job_from_row(&row)?;

        sqlx::query(
            "UPDATE refresh_jobs
             SET status = 'processing', processed_at = NOW()
             WHERE id = $1",
        )
        .bind(job.id)
        .execute(&mut *txn)
        .await?;

        txn.commit()
            .await
            .context("Failed to commit dequeue transaction")?;

        job.status = JobStatus::Processing;
        job.processed_at = Some(time::now_secs());
        Ok(Some(job))
    }

    pub async fn mark_job_completed(&self, job_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE refresh_jobs SET status = 'completed' WHERE job_id = $1")
            .bind(job_id)
            .execute(self.pool())
            .await
            .context("Failed to mark job completed")?;
        Ok(())
    }

    /// Record a failed attempt. The job returns to `pending` while
    /// `attempts < max_retries`, otherwise it becomes `failed` for good.
    pub async fn mark_job_failed(
        &self,
        job_id: Uuid,
        error_message: &str,
        attempts: i32,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE refresh_jobs
             SET status = CASE WHEN $2 >= max_retries THEN 'failed' ELSE 'pending' END,
                 attempts = $2,
                 error_message = $3
             WHERE job_id = $1",
        )
        .bind(job_id)
        .bind(attempts)
        .bind(error_message)
        .execute(self.pool())
        .await
        .context("Failed to mark job failed")?;
        Ok(())
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Option<RefreshJob>> {
        let row = sqlx::query("SELECT * FROM refresh_jobs WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(self.pool())
            .await
            .context("Failed to fetch job")?;
        row.as_ref().map(job_from_row).transpose()
    }

    /// Wallets that currently have at least one pending job.
    pub async fn pending_job_wallets(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT xpub_van FROM refresh_jobs WHERE status = 'pending'",
        )
        .fetch_all(self.pool())
        .await
        .context("Failed to list wallets with pending jobs")?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("xpub_van").map_err(Into::into))
            .collect()
    }
}

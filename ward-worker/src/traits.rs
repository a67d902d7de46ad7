//! Persistence seams for the worker logic.
//!
//! The job processor, transfer watcher, and withdrawal orchestrator are
//! generic over these traits so their state machines can be exercised
//! against in-memory fakes. [`ward_store::Store`] is the production
//! implementation of both.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;
use ward_common::wallet::WalletIdentity;
use ward_store::{
    JobTrigger, RefreshJob, Store, Watcher, WatcherStatus, Withdrawal, WithdrawalStatus,
};

/// The job-queue / watcher / lock subset of the durable store.
#[async_trait]
pub trait QueueStore: Send + Sync + 'static {
    async fn enqueue_job(
        &self,
        wallet: &WalletIdentity,
        trigger: JobTrigger,
        recipient_id: Option<&str>,
        asset_id: Option<&str>,
        max_retries: u32,
    ) -> Result<Uuid>;

    async fn dequeue_job_for_wallet(&self, xpub_van: &str) -> Result<Option<RefreshJob>>;

    async fn mark_job_completed(&self, job_id: Uuid) -> Result<()>;

    async fn mark_job_failed(&self, job_id: Uuid, error: &str, attempts: i32) -> Result<()>;

    async fn create_watcher(
        &self,
        wallet: &WalletIdentity,
        recipient_id: &str,
        asset_id: Option<&str>,
        ttl: Duration,
    ) -> Result<()>;

    async fn get_watcher(&self, xpub_van: &str, recipient_id: &str)
        -> Result<Option<Watcher>>;

    async fn update_watcher_status(
        &self,
        xpub_van: &str,
        recipient_id: &str,
        status: WatcherStatus,
        refresh_count: Option<i32>,
    ) -> Result<()>;

    async fn update_watcher_asset_and_expiration(
        &self,
        xpub_van: &str,
        recipient_id: &str,
        asset_id: &str,
        expiration: Option<i64>,
    ) -> Result<()>;

    async fn stop_watcher(&self, xpub_van: &str, recipient_id: &str) -> Result<()>;

    async fn active_watchers_for_wallet(&self, xpub_van: &str) -> Result<Vec<Watcher>>;

    async fn acquire_wallet_lock(&self, xpub_van: &str, ttl: Duration) -> Result<bool>;

    async fn release_wallet_lock(&self, xpub_van: &str) -> Result<()>;
}

/// The withdrawal persistence subset of the durable store.
#[async_trait]
pub trait WithdrawalStore: Send + Sync + 'static {
    async fn insert_withdrawal(&self, withdrawal: &Withdrawal) -> Result<()>;

    async fn get_withdrawal(&self, withdrawal_id: Uuid) -> Result<Option<Withdrawal>>;

    async fn get_withdrawal_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<Withdrawal>>;

    async fn save_withdrawal(&self, withdrawal: &Withdrawal) -> Result<()>;

    async fn update_withdrawal_status(
        &self,
        withdrawal_id: Uuid,
        status: WithdrawalStatus,
        error_code: Option<&str>,
        error_message: Option<&str>,
        retryable: bool,
    ) -> Result<()>;

    async fn resumable_withdrawals(&self) -> Result<Vec<Withdrawal>>;
}

#[async_trait]
impl QueueStore for Store {
    async fn enqueue_job(
        &self,
        wallet: &WalletIdentity,
        trigger: JobTrigger,
        recipient_id: Option<&str>,
        asset_id: Option<&str>,
        max_retries: u32,
    ) -> Result<Uuid> {
        Store::enqueue_job(self, wallet, trigger, recipient_id, asset_id, max_retries).await
    }

    async fn dequeue_job_for_wallet(&self, xpub_van: &str) -> Result<Option<RefreshJob>> {
        Store::dequeue_job_for_wallet(self, xpub_van).await
    }

    async fn mark_job_completed(&self, job_id: Uuid) -> Result<()> {
        Store::mark_job_completed(self, job_id).await
    }

    async fn mark_job_failed(&self, job_id: Uuid, error: &str, attempts: i32) -> Result<()> {
        Store::mark_job_failed(self, job_id, error, attempts).await
    }

    async fn create_watcher(
        &self,
        wallet: &WalletIdentity,
        recipient_id: &str,
        asset_id: Option<&str>,
        ttl: Duration,
    ) -> Result<()> {
        Store::create_watcher(self, wallet, recipient_id, asset_id, ttl).await
    }

    async fn get_watcher(
        &self,
        xpub_van: &str,
        recipient_id: &str,
    ) -> Result<Option<Watcher>> {
        Store::get_watcher(self, xpub_van, recipient_id).await
    }

    async fn update_watcher_status(
        &self,
        xpub_van: &str,
        recipient_id: &str,
        status: WatcherStatus,
        refresh_count: Option<i32>,
    ) -> Result<()> {
        Store::update_watcher_status(self, xpub_van, recipient_id, status, refresh_count).await
    }

    async fn update_watcher_asset_and_expiration(
        &self,
        xpub_van: &str,
        recipient_id: &str,
        asset_id: &str,
        expiration: Option<i64>,
    ) -> Result<()> {
        Store::update_watcher_asset_and_expiration(
            self,
            xpub_van,
            recipient_id,
            asset_id,
            expiration,
        )
        .await
    }

    async fn stop_watcher(&self, xpub_van: &str, recipient_id: &str) -> Result<()> {
        Store::stop_watcher(self, xpub_van, recipient_id).await
    }

    async fn active_watchers_for_wallet(&self, xpub_van: &str) -> Result<Vec<Watcher>> {
        Store::active_watchers_for_wallet(self, xpub_van).await
    }

    async fn acquire_wallet_lock(&self, xpub_van: &str, ttl: Duration) -> Result<bool> {
        Store::acquire_wallet_lock(self, xpub_van, ttl).await
    }

    async fn release_wallet_lock(&self, xpub_van: &str) -> Result<()> {
        Store::release_wallet_lock(self, xpub_van).await
    }
}

#[async_trait]
impl WithdrawalStore for Store {
    async fn insert_withdrawal(&self, withdrawal: &Withdrawal) -> Result<()> {
        Store::insert_withdrawal(self, withdrawal).await
    }

    async fn get_withdrawal(&self, withdrawal_id: Uuid) -> Result<Option<Withdrawal>> {
        Store::get_withdrawal(self, withdrawal_id).await
    }

    async fn get_withdrawal_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<Withdrawal>> {
        Store::get_withdrawal_by_idempotency_key(self, idempotency_key).await
    }

    async fn save_withdrawal(&self, withdrawal: &Withdrawal) -> Result<()> {
        Store::save_withdrawal(self, withdrawal).await
    }

    async fn update_withdrawal_status(
        &self,
        withdrawal_id: Uuid,
        status: WithdrawalStatus,
        error_code: Option<&str>,
        error_message: Option<&str>,
        retryable: bool,
    ) -> Result<()> {
        Store::update_withdrawal_status(
            self,
            withdrawal_id,
            status,
            error_code,
            error_message,
            retryable,
        )
        .await
    }

    async fn resumable_withdrawals(&self) -> Result<Vec<Withdrawal>> {
        Store::resumable_withdrawals(self).await
    }
}

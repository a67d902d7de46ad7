//! In-memory fakes for exercising the worker state machines without a
//! database or a live node.

use std::{collections::HashMap, time::Duration};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;
use ward_common::{config::Config, time, wallet::WalletIdentity};
use ward_node_client::{models::*, NodeApi, NodeApiError};
use ward_store::{
    JobStatus, JobTrigger, RefreshJob, Watcher, WatcherStatus, Withdrawal, WithdrawalStatus,
};

use crate::traits::{QueueStore, WithdrawalStore};

pub fn test_wallet() -> WalletIdentity {
    WalletIdentity::new("xpub-vanilla-test", "xpub-colored-test", "f00dbabe")
}

/// Defaults with sub-second retry delays so tests never stall.
pub fn test_config() -> Config {
    Config {
        retry_delay_base: Duration::from_millis(1),
        ..Config::default()
    }
}

pub fn test_job(wallet: &WalletIdentity, trigger: JobTrigger) -> RefreshJob {
    RefreshJob {
        id: 1,
        job_id: Uuid::new_v4(),
        wallet: wallet.clone(),
        trigger,
        recipient_id: None,
        asset_id: None,
        status: JobStatus::Processing,
        attempts: 0,
        max_retries: 10,
        error_message: None,
        created_at: time::now_secs(),
        processed_at: Some(time::now_secs()),
    }
}

// --- MemStore --- //

#[derive(Default)]
struct MemStoreInner {
    jobs: Vec<RefreshJob>,
    next_job_row_id: i64,
    watchers: HashMap<(String, String), Watcher>,
    /// xpub_van -> lock expiry epoch.
    locks: HashMap<String, i64>,
    withdrawals: Vec<Withdrawal>,
}

/// In-memory implementation of both store traits.
pub struct MemStore {
    inner: Mutex<MemStoreInner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemStoreInner::default()),
        }
    }

    pub async fn seed_watcher(
        &self,
        wallet: &WalletIdentity,
        recipient_id: &str,
        asset_id: Option<&str>,
        expires_at: i64,
    ) {
        let mut inner = self.inner.lock().await;
        inner.watchers.insert(
            (wallet.xpub_vanilla.clone(), recipient_id.to_owned()),
            Watcher {
                wallet: wallet.clone(),
                recipient_id: recipient_id.to_owned(),
                asset_id: asset_id.map(str::to_owned),
                status: WatcherStatus::Watching,
                refresh_count: 0,
                created_at: time::now_secs(),
                last_refresh: None,
                expires_at: Some(expires_at),
            },
        );
    }

    pub async fn seed_job(&self, job: &RefreshJob) {
        let mut inner = self.inner.lock().await;
        inner.jobs.push(job.clone());
    }

    pub async fn jobs_snapshot(&self) -> Vec<RefreshJob> {
        self.inner.lock().await.jobs.clone()
    }

    pub async fn job_status(&self, job_id: Uuid) -> Option<JobStatus> {
        self.inner
            .lock()
            .await
            .jobs
            .iter()
            .find(|job| job.job_id == job_id)
            .map(|job| job.status)
    }
}

#[async_trait]
impl QueueStore for MemStore {
    async fn enqueue_job(
        &self,
        wallet: &WalletIdentity,
        trigger: JobTrigger,
        recipient_id: Option<&str>,
        asset_id: Option<&str>,
        max_retries: u32,
    ) -> Result<Uuid> {
        let mut inner = self.inner.lock().await;
        inner.next_job_row_id += 1;
        let job_id = Uuid::new_v4();
        let row_id = inner.next_job_row_id;
        inner.jobs.push(RefreshJob {
            id: row_id,
            job_id,
            wallet: wallet.clone(),
            trigger,
            recipient_id: recipient_id.map(str::to_owned),
            asset_id: asset_id.map(str::to_owned),
            status: JobStatus::Pending,
            attempts: 0,
            max_retries: max_retries as i32,
            error_message: None,
            created_at: time::now_secs(),
            processed_at: None,
        });
        Ok(job_id)
    }

    async fn dequeue_job_for_wallet(&self, xpub_van: &str) -> Result<Option<RefreshJob>> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .iter_mut()
            .filter(|job| job.wallet.xpub_vanilla == xpub_van)
            .find(|job| job.status == JobStatus::Pending);
        Ok(job.map(|job| {
            job.status = JobStatus::Processing;
            job.processed_at = Some(time::now_secs());
            job.clone()
        }))
    }

    async fn mark_job_completed(&self, job_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.jobs.iter_mut().find(|job| job.job_id == job_id) {
            job.status = JobStatus::Completed;
        }
        Ok(())
    }

    async fn mark_job_failed(&self, job_id: Uuid, error: &str, attempts: i32) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.jobs.iter_mut().find(|job| job.job_id == job_id) {
            job.attempts = attempts;
            job.error_message = Some(error.to_owned());
            job.status = if attempts >= job.max_retries {
                JobStatus::Failed
            } else {
                JobStatus::Pending
            };
        }
        Ok(())
    }

    async fn create_watcher(
        &self,
        wallet: &WalletIdentity,
        recipient_id: &str,
        asset_id: Option<&str>,
        ttl: Duration,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let expires_at = time::now_secs() + ttl.as_secs() as i64;
        let key = (wallet.xpub_vanilla.clone(), recipient_id.to_owned());
        match inner.watchers.get_mut(&key) {
            Some(watcher) => {
                watcher.status = WatcherStatus::Watching;
                watcher.refresh_count = 0;
                watcher.expires_at = Some(expires_at);
                watcher.asset_id = asset_id.map(str::to_owned);
            }
            None => {
                inner.watchers.insert(
                    key,
                    Watcher {
                        wallet: wallet.clone(),
                        recipient_id: recipient_id.to_owned(),
                        asset_id: asset_id.map(str::to_owned),
                        status: WatcherStatus::Watching,
                        refresh_count: 0,
                        created_at: time::now_secs(),
                        last_refresh: None,
                        expires_at: Some(expires_at),
                    },
                );
            }
        }
        Ok(())
    }

    async fn get_watcher(
        &self,
        xpub_van: &str,
        recipient_id: &str,
    ) -> Result<Option<Watcher>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .watchers
            .get(&(xpub_van.to_owned(), recipient_id.to_owned()))
            .cloned())
    }

    async fn update_watcher_status(
        &self,
        xpub_van: &str,
        recipient_id: &str,
        status: WatcherStatus,
        refresh_count: Option<i32>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(watcher) = inner
            .watchers
            .get_mut(&(xpub_van.to_owned(), recipient_id.to_owned()))
        {
            watcher.status = status;
            watcher.last_refresh = Some(time::now_secs());
            if let Some(count) = refresh_count {
                watcher.refresh_count = count;
            }
        }
        Ok(())
    }

    async fn update_watcher_asset_and_expiration(
        &self,
        xpub_van: &str,
        recipient_id: &str,
        asset_id: &str,
        expiration: Option<i64>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(watcher) = inner
            .watchers
            .get_mut(&(xpub_van.to_owned(), recipient_id.to_owned()))
        {
            watcher.asset_id = Some(asset_id.to_owned());
            if expiration.is_some() {
                watcher.expires_at = expiration;
            }
        }
        Ok(())
    }

    async fn stop_watcher(&self, xpub_van: &str, recipient_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .watchers
            .remove(&(xpub_van.to_owned(), recipient_id.to_owned()));
        Ok(())
    }

    async fn active_watchers_for_wallet(&self, xpub_van: &str) -> Result<Vec<Watcher>> {
        let inner = self.inner.lock().await;
        let now = time::now_secs();
        let mut watchers: Vec<Watcher> = inner
            .watchers
            .values()
            .filter(|w| w.wallet.xpub_vanilla == xpub_van)
            .filter(|w| w.status == WatcherStatus::Watching)
            .filter(|w| w.expires_at.map(|e| e > now).unwrap_or(true))
            .cloned()
            .collect();
        watchers.sort_by_key(|w| w.created_at);
        Ok(watchers)
    }

    async fn acquire_wallet_lock(&self, xpub_van: &str, ttl: Duration) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let now = time::now_secs();
        inner.locks.retain(|_, expires_at| *expires_at >= now);
        if inner.locks.contains_key(xpub_van) {
            return Ok(false);
        }
        inner
            .locks
            .insert(xpub_van.to_owned(), now + ttl.as_secs() as i64);
        Ok(true)
    }

    async fn release_wallet_lock(&self, xpub_van: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.locks.remove(xpub_van);
        Ok(())
    }
}

#[async_trait]
impl WithdrawalStore for MemStore {
    async fn insert_withdrawal(&self, withdrawal: &Withdrawal) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner
            .withdrawals
            .iter()
            .any(|w| w.idempotency_key == withdrawal.idempotency_key)
        {
            bail!("duplicate idempotency key");
        }
        inner.withdrawals.push(withdrawal.clone());
        Ok(())
    }

    async fn get_withdrawal(&self, withdrawal_id: Uuid) -> Result<Option<Withdrawal>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .withdrawals
            .iter()
            .find(|w| w.withdrawal_id == withdrawal_id)
            .cloned())
    }

    async fn get_withdrawal_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<Withdrawal>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .withdrawals
            .iter()
            .find(|w| w.idempotency_key == idempotency_key)
            .cloned())
    }

    async fn save_withdrawal(&self, withdrawal: &Withdrawal) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner
            .withdrawals
            .iter_mut()
            .find(|w| w.withdrawal_id == withdrawal.withdrawal_id)
        {
            existing.amount_sats_sent = withdrawal.amount_sats_sent;
            existing.fee_sats = withdrawal.fee_sats;
            existing.baseline_balance_sats = withdrawal.baseline_balance_sats;
            existing.balance_wait_started_at = withdrawal.balance_wait_started_at;
            existing.channel_ids_to_close = withdrawal.channel_ids_to_close.clone();
            existing.close_txids = withdrawal.close_txids.clone();
            existing.sweep_txid = withdrawal.sweep_txid.clone();
            existing.updated_at = time::now_secs();
        }
        Ok(())
    }

    async fn update_withdrawal_status(
        &self,
        withdrawal_id: Uuid,
        status: WithdrawalStatus,
        error_code: Option<&str>,
        error_message: Option<&str>,
        retryable: bool,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(w) = inner
            .withdrawals
            .iter_mut()
            .find(|w| w.withdrawal_id == withdrawal_id)
        {
            w.status = status;
            if let Some(code) = error_code {
                w.error_code = Some(code.to_owned());
            }
            if let Some(message) = error_message {
                w.error_message = Some(message.to_owned());
            }
            w.retryable = retryable;
            w.attempt_count += 1;
            w.last_attempt_at = Some(time::now_secs());
            w.updated_at = time::now_secs();
        }
        Ok(())
    }

    async fn resumable_withdrawals(&self) -> Result<Vec<Withdrawal>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .withdrawals
            .iter()
            .filter(|w| !w.status.is_terminal())
            .cloned()
            .collect())
    }
}

// --- MockNode --- //

#[derive(Default)]
struct MockNodeInner {
    assets: Vec<Asset>,
    /// Keyed by the asset filter of the `listtransfers` call.
    transfers: HashMap<Option<String>, Vec<Transfer>>,
    refresh_calls: usize,
    refresh_error: Option<String>,
    /// batch_transfer_idx -> failure details reported on refresh.
    refresh_failures: HashMap<i64, String>,
    failed_batches: Vec<i64>,
    /// Successive vanilla spendable balances; the last value repeats.
    balances: Vec<u64>,
    balance_reads: usize,
    channels: Vec<Channel>,
    closed_channels: Vec<String>,
    close_error: Option<String>,
    close_marks_closing: bool,
    sent_btc: Vec<SendBtcRequest>,
    sent_assets: Vec<SendAssetRequest>,
    txid_counter: usize,
}

/// A scripted wallet node.
pub struct MockNode {
    inner: Mutex<MockNodeInner>,
}

impl MockNode {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MockNodeInner::default()),
        }
    }

    pub async fn set_assets(&self, asset_ids: Vec<&str>) {
        let mut inner = self.inner.lock().await;
        inner.assets = asset_ids
            .into_iter()
            .map(|asset_id| Asset {
                asset_id: asset_id.to_owned(),
                ticker: None,
                name: None,
                precision: Some(0),
                balance: None,
            })
            .collect();
    }

    pub async fn set_transfers(&self, asset_id: Option<&str>, transfers: Vec<Transfer>) {
        let mut inner = self.inner.lock().await;
        inner
            .transfers
            .insert(asset_id.map(str::to_owned), transfers);
    }

    pub async fn set_refresh_error(&self, message: &str) {
        self.inner.lock().await.refresh_error = Some(message.to_owned());
    }

    pub async fn set_refresh_failure(&self, batch_transfer_idx: i64, details: &str) {
        self.inner
            .lock()
            .await
            .refresh_failures
            .insert(batch_transfer_idx, details.to_owned());
    }

    pub async fn set_channels(&self, channels: Vec<Channel>) {
        self.inner.lock().await.channels = channels;
    }

    pub async fn set_balances(&self, balances: Vec<u64>) {
        let mut inner = self.inner.lock().await;
        inner.balances = balances;
        inner.balance_reads = 0;
    }

    pub async fn set_close_error(&self, message: &str) {
        self.inner.lock().await.close_error = Some(message.to_owned());
    }

    /// When set, a successful close flips the channel to `Closing`.
    pub async fn close_marks_channels_closing(&self, enabled: bool) {
        self.inner.lock().await.close_marks_closing = enabled;
    }

    pub async fn refresh_calls(&self) -> usize {
        self.inner.lock().await.refresh_calls
    }

    pub async fn failed_batches(&self) -> Vec<i64> {
        self.inner.lock().await.failed_batches.clone()
    }

    pub async fn closed_channels(&self) -> Vec<String> {
        self.inner.lock().await.closed_channels.clone()
    }

    pub async fn sent_btc(&self) -> Vec<SendBtcRequest> {
        self.inner.lock().await.sent_btc.clone()
    }

    pub async fn sent_assets(&self) -> Vec<SendAssetRequest> {
        self.inner.lock().await.sent_assets.clone()
    }
}

#[async_trait]
impl NodeApi for MockNode {
    async fn refresh_wallet(
        &self,
        _wallet: &WalletIdentity,
    ) -> Result<RefreshResponse, NodeApiError> {
        let mut inner = self.inner.lock().await;
        inner.refresh_calls += 1;
        if let Some(message) = &inner.refresh_error {
            return Err(NodeApiError::Node {
                code: 500,
                message: message.clone(),
            });
        }
        let mut response = RefreshResponse::default();
        for (batch_idx, details) in &inner.refresh_failures {
            response.0.insert(
                batch_idx.to_string(),
                RefreshedTransfer {
                    updated_status: None,
                    failure: Some(RefreshFailure {
                        code: Some(500),
                        details: Some(details.clone()),
                    }),
                },
            );
        }
        Ok(response)
    }

    async fn list_assets(&self, _wallet: &WalletIdentity) -> Result<Vec<Asset>, NodeApiError> {
        Ok(self.inner.lock().await.assets.clone())
    }

    async fn list_transfers(
        &self,
        _wallet: &WalletIdentity,
        asset_id: Option<&str>,
    ) -> Result<Vec<Transfer>, NodeApiError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .transfers
            .get(&asset_id.map(str::to_owned))
            .cloned()
            .unwrap_or_default())
    }

    async fn fail_transfers(
        &self,
        _wallet: &WalletIdentity,
        req: &FailTransfersRequest,
    ) -> Result<FailTransfersResponse, NodeApiError> {
        let mut inner = self.inner.lock().await;
        if let Some(batch_idx) = req.batch_transfer_idx {
            inner.failed_batches.push(batch_idx);
        }
        Ok(FailTransfersResponse {
            transfers_changed: true,
        })
    }

    async fn get_btc_balance(
        &self,
        _wallet: &WalletIdentity,
    ) -> Result<BtcBalanceResponse, NodeApiError> {
        let mut inner = self.inner.lock().await;
        let spendable = match inner.balances.get(inner.balance_reads).copied() {
            Some(balance) => {
                inner.balance_reads += 1;
                balance
            }
            None => inner.balances.last().copied().unwrap_or(0),
        };
        Ok(BtcBalanceResponse {
            vanilla: BtcBalance {
                settled: spendable,
                future: spendable,
                spendable,
            },
            colored: BtcBalance {
                settled: 0,
                future: 0,
                spendable: 0,
            },
        })
    }

    async fn list_channels(
        &self,
        _wallet: &WalletIdentity,
    ) -> Result<Vec<Channel>, NodeApiError> {
        Ok(self.inner.lock().await.channels.clone())
    }

    async fn open_channel(
        &self,
        _wallet: &WalletIdentity,
        _req: &OpenChannelRequest,
    ) -> Result<OpenChannelResponse, NodeApiError> {
        Ok(OpenChannelResponse {
            temporary_channel_id: "tmp-chan".to_owned(),
        })
    }

    async fn close_channel(
        &self,
        _wallet: &WalletIdentity,
        req: &CloseChannelRequest,
    ) -> Result<(), NodeApiError> {
        let mut inner = self.inner.lock().await;
        if let Some(message) = &inner.close_error {
            return Err(NodeApiError::Node {
                code: 500,
                message: message.clone(),
            });
        }
        inner.closed_channels.push(req.channel_id.clone());
        if inner.close_marks_closing {
            let channel_id = req.channel_id.clone();
            if let Some(channel) = inner
                .channels
                .iter_mut()
                .find(|channel| channel.channel_id == channel_id)
            {
                channel.status = ChannelStatus::Closing;
            }
        }
        Ok(())
    }

    async fn send_btc(
        &self,
        _wallet: &WalletIdentity,
        req: &SendBtcRequest,
    ) -> Result<String, NodeApiError> {
        let mut inner = self.inner.lock().await;
        inner.sent_btc.push(req.clone());
        inner.txid_counter += 1;
        Ok(format!("txid-{n}", n = inner.txid_counter))
    }

    async fn send_asset(
        &self,
        _wallet: &WalletIdentity,
        req: &SendAssetRequest,
    ) -> Result<String, NodeApiError> {
        let mut inner = self.inner.lock().await;
        inner.sent_assets.push(req.clone());
        inner.txid_counter += 1;
        Ok(format!("txid-asset-{n}", n = inner.txid_counter))
    }

    async fn list_transactions(
        &self,
        _wallet: &WalletIdentity,
    ) -> Result<Vec<Transaction>, NodeApiError> {
        Ok(Vec::new())
    }

    async fn decode_rgb_invoice(
        &self,
        _wallet: &WalletIdentity,
        _invoice: &str,
    ) -> Result<DecodedRgbInvoice, NodeApiError> {
        Ok(DecodedRgbInvoice {
            recipient_id: "decoded-recipient".to_owned(),
            asset_id: None,
            amount: None,
            expiration_timestamp: None,
            transport_endpoints: vec!["rpc://proxy".to_owned()],
        })
    }

    async fn create_rgb_invoice(
        &self,
        _wallet: &WalletIdentity,
        _req: &RgbInvoiceRequest,
    ) -> Result<RgbInvoice, NodeApiError> {
        Ok(RgbInvoice {
            invoice: "rgb:invoice".to_owned(),
            recipient_id: "fresh-recipient".to_owned(),
            expiration_timestamp: None,
            batch_transfer_idx: Some(1),
        })
    }
}

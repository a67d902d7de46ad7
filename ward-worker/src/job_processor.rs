//! Routes dequeued jobs to their handlers and manages job lifecycle.
//!
//! Errors never escape to the worker loop: a failed handler marks the job
//! failed (which re-queues it while retries remain) and returns.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};
use ward_common::{backoff, config::Config, shutdown::ShutdownChannel, time, wallet::WalletIdentity};
use ward_node_client::{models::FailTransfersRequest, NodeApi};
use ward_store::{JobTrigger, RefreshJob};

use crate::traits::QueueStore;

/// Process one refresh job, marking it completed or failed.
pub async fn process_job<S: QueueStore, N: NodeApi>(
    store: &Arc<S>,
    node: &Arc<N>,
    config: &Arc<Config>,
    job: &RefreshJob,
    shutdown: &ShutdownChannel,
) {
    info!(
        "Processing job {job_id}: trigger={trigger}, recipient_id={recipient:?}, \
         asset_id={asset:?}",
        job_id = job.job_id,
        trigger = job.trigger,
        recipient = job.recipient_id,
        asset = job.asset_id,
    );

    let result = handle_job(store, node, config, job, shutdown).await;
    match result {
        Ok(()) => {
            if let Err(e) = store.mark_job_completed(job.job_id).await {
                error!("Failed to mark job {job_id} completed: {e:#}", job_id = job.job_id);
            }
        }
        Err(e) => {
            error!("Error processing job {job_id}: {e:#}", job_id = job.job_id);
            let attempts = job.attempts + 1;
            if let Err(mark_err) = store
                .mark_job_failed(job.job_id, &format!("{e:#}"), attempts)
                .await
            {
                error!(
                    "Failed to mark job {job_id} failed: {mark_err:#}",
                    job_id = job.job_id
                );
            }
        }
    }
}

async fn handle_job<S: QueueStore, N: NodeApi>(
    store: &Arc<S>,
    node: &Arc<N>,
    config: &Arc<Config>,
    job: &RefreshJob,
    shutdown: &ShutdownChannel,
) -> Result<()> {
    // An invoice that doesn't know its asset yet only needs a short-lived
    // watcher; a later job picks the transfer up once the node assigns the
    // asset.
    if job.trigger == JobTrigger::InvoiceCreated && job.asset_id.is_none() {
        if let Some(recipient_id) = &job.recipient_id {
            return ensure_invoice_watcher(store, config, &job.wallet, recipient_id).await;
        }
    }
    process_wallet_unified(store, node, config, job, shutdown).await
}

/// Create the short-TTL watcher for a fresh invoice, unless one exists.
async fn ensure_invoice_watcher<S: QueueStore>(
    store: &Arc<S>,
    config: &Arc<Config>,
    wallet: &WalletIdentity,
    recipient_id: &str,
) -> Result<()> {
    if store
        .get_watcher(&wallet.xpub_vanilla, recipient_id)
        .await?
        .is_some()
    {
        info!(
            "Watcher already exists for {wallet}:{recipient_id}, skipping creation",
            wallet = wallet.short_id()
        );
        return Ok(());
    }
    store
        .create_watcher(
            wallet,
            recipient_id,
            None,
            config.invoice_watcher_expiration,
        )
        .await?;
    info!(
        "Created invoice watcher for {recipient_id} \
         ({ttl:?} expiration)",
        ttl = config.invoice_watcher_expiration
    );
    Ok(())
}

/// The unified wallet handler: refresh with retry, then enumerate every
/// transfer (asset-less and per asset), creating watchers for incomplete
/// ones and actively failing cancellable expired ones.
async fn process_wallet_unified<S: QueueStore, N: NodeApi>(
    store: &Arc<S>,
    node: &Arc<N>,
    config: &Arc<Config>,
    job: &RefreshJob,
    shutdown: &ShutdownChannel,
) -> Result<()> {
    let wallet = &job.wallet;
    let xpub_van = &wallet.xpub_vanilla;

    // The advisory lock keeps a concurrent watcher loop (or a stray second
    // worker) from refreshing the same wallet mid-scan.
    if !store
        .acquire_wallet_lock(xpub_van, config.wallet_lock_ttl)
        .await?
    {
        warn!(
            "Wallet {wallet} is already being processed, skipping",
            wallet = wallet.short_id()
        );
        return Ok(());
    }

    let result = process_wallet_locked(store, node, config, job, shutdown).await;
    if let Err(e) = store.release_wallet_lock(xpub_van).await {
        error!("Failed to release wallet lock for {xpub_van}: {e:#}");
    }
    result
}

async fn process_wallet_locked<S: QueueStore, N: NodeApi>(
    store: &Arc<S>,
    node: &Arc<N>,
    config: &Arc<Config>,
    job: &RefreshJob,
    shutdown: &ShutdownChannel,
) -> Result<()> {
    let wallet = &job.wallet;
    let max_attempts = (job.max_retries.max(1)) as u32;
    let mut delays = backoff::iter(config.retry_delay_base);

    // Refresh with retry: transient node trouble (SyncNeeded, 5xx, a
    // concurrent refresh) usually clears within a few backoff steps.
    let mut attempt = 0;
    loop {
        if shutdown.try_recv() {
            return Ok(());
        }
        attempt += 1;
        debug!(
            "Refreshing wallet {wallet} (attempt {attempt}/{max_attempts})",
            wallet = wallet.short_id()
        );
        match node.refresh_wallet(wallet).await {
            Ok(_) => break,
            Err(e) if attempt < max_attempts => {
                let delay = delays.next().unwrap_or(config.retry_delay_base);
                warn!(
                    "Refresh failed for {wallet}, retrying in {delay:?}: {e}",
                    wallet = wallet.short_id()
                );
                tokio::select! {
                    () = shutdown.recv() => return Ok(()),
                    () = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => {
                return Err(e).context("Wallet refresh failed after retries");
            }
        }
    }

    // Transfers that haven't been assigned an asset yet.
    scan_transfers(store, node, config, wallet, None).await?;

    // Then every asset's transfer list.
    let assets = node
        .list_assets(wallet)
        .await
        .context("Failed to list assets")?;
    debug!(
        "Wallet {wallet}: scanning {n} asset(s)",
        wallet = wallet.short_id(),
        n = assets.len()
    );
    for asset in assets {
        if shutdown.try_recv() {
            return Ok(());
        }
        scan_transfers(store, node, config, wallet, Some(&asset.asset_id)).await?;
    }

    info!(
        "Wallet {wallet}: completed processing all assets and transfers",
        wallet = wallet.short_id()
    );
    Ok(())
}

/// Walk one transfer list: watch the incomplete, fail the cancellable
/// expired, skip the rest.
async fn scan_transfers<S: QueueStore, N: NodeApi>(
    store: &Arc<S>,
    node: &Arc<N>,
    config: &Arc<Config>,
    wallet: &WalletIdentity,
    asset_id: Option<&str>,
) -> Result<()> {
    let transfers = match node.list_transfers(wallet, asset_id).await {
        Ok(transfers) => transfers,
        // A single bad asset listing mustn't fail the whole job.
        Err(e) => {
            warn!("Failed to list transfers for asset {asset_id:?}: {e}");
            return Ok(());
        }
    };

    let now = time::now_secs();
    for transfer in transfers {
        if transfer.is_terminal() {
            continue;
        }

        if transfer.is_expired_at(now) {
            if transfer.can_cancel_at(now) {
                if let Some(batch_transfer_idx) = transfer.batch_transfer_idx {
                    let req = FailTransfersRequest {
                        batch_transfer_idx: Some(batch_transfer_idx),
                        no_asset_only: false,
                        skip_sync: false,
                    };
                    match node.fail_transfers(wallet, &req).await {
                        Ok(_) => info!(
                            "Failed expired transfer \
                             (batch_transfer_idx: {batch_transfer_idx})"
                        ),
                        Err(e) => error!("Failed to cancel expired transfer: {e}"),
                    }
                }
            }
            continue;
        }

        let Some(recipient_id) = &transfer.recipient_id else {
            debug!("Transfer has no recipient_id, cannot create watcher");
            continue;
        };
        if store
            .get_watcher(&wallet.xpub_vanilla, recipient_id)
            .await?
            .is_none()
        {
            if let Err(e) = store
                .create_watcher(wallet, recipient_id, asset_id, config.watcher_ttl)
                .await
            {
                error!("Failed to create watcher for transfer {recipient_id}: {e:#}");
            } else {
                info!(
                    "Created watcher for transfer {recipient_id} of {wallet}",
                    wallet = wallet.short_id()
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use ward_node_client::models::{Transfer, TransferKind, TransferStatus};
    use ward_store::JobStatus;

    use super::*;
    use crate::test_support::{test_config, test_job, test_wallet, MemStore, MockNode};

    fn transfer(
        recipient: &str,
        status: TransferStatus,
        kind: TransferKind,
        expiration: Option<i64>,
    ) -> Transfer {
        Transfer {
            idx: 1,
            batch_transfer_idx: Some(3),
            created_at: 0,
            updated_at: 0,
            status,
            kind,
            txid: None,
            recipient_id: Some(recipient.to_owned()),
            expiration,
            transport_endpoints: Vec::new(),
        }
    }

    #[tokio::test]
    async fn invoice_created_without_asset_creates_short_ttl_watcher() {
        let store = Arc::new(MemStore::new());
        let node = Arc::new(MockNode::new());
        let config = Arc::new(test_config());
        let shutdown = ShutdownChannel::new();
        let wallet = test_wallet();

        let mut job = test_job(&wallet, JobTrigger::InvoiceCreated);
        job.recipient_id = Some("r1".to_owned());
        store.seed_job(&job).await;

        process_job(&store, &node, &config, &job, &shutdown).await;

        // Short-TTL watcher created; job completed; no node traffic at all.
        let watcher = store
            .get_watcher(&wallet.xpub_vanilla, "r1")
            .await
            .unwrap()
            .expect("watcher should exist");
        let ttl = watcher.expires_at.unwrap() - time::now_secs();
        assert!(ttl > 0 && ttl <= config.invoice_watcher_expiration.as_secs() as i64);
        assert!(watcher.asset_id.is_none());

        assert_eq!(store.job_status(job.job_id).await, Some(JobStatus::Completed));
        assert_eq!(node.refresh_calls().await, 0);
    }

    #[tokio::test]
    async fn unified_handler_creates_watchers_for_incomplete_transfers() {
        let store = Arc::new(MemStore::new());
        let node = Arc::new(MockNode::new());
        let config = Arc::new(test_config());
        let shutdown = ShutdownChannel::new();
        let wallet = test_wallet();

        node.set_assets(vec!["rgb:aaa"]).await;
        node.set_transfers(
            Some("rgb:aaa"),
            vec![
                transfer("pending", TransferStatus::WaitingConfirmations, TransferKind::Send, None),
                transfer("done", TransferStatus::Settled, TransferKind::Send, None),
            ],
        )
        .await;

        let job = test_job(&wallet, JobTrigger::Manual);
        store.seed_job(&job).await;
        process_job(&store, &node, &config, &job, &shutdown).await;

        assert!(store.get_watcher(&wallet.xpub_vanilla, "pending").await.unwrap().is_some());
        assert!(store.get_watcher(&wallet.xpub_vanilla, "done").await.unwrap().is_none());
        assert_eq!(store.job_status(job.job_id).await, Some(JobStatus::Completed));
        assert_eq!(node.refresh_calls().await, 1);
        // The handler released the wallet lock.
        assert!(store
            .acquire_wallet_lock(&wallet.xpub_vanilla, std::time::Duration::from_secs(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn unified_handler_fails_cancellable_expired_transfers() {
        let store = Arc::new(MemStore::new());
        let node = Arc::new(MockNode::new());
        let config = Arc::new(test_config());
        let shutdown = ShutdownChannel::new();
        let wallet = test_wallet();

        let expired = transfer(
            "expired",
            TransferStatus::WaitingCounterparty,
            TransferKind::ReceiveBlind,
            Some(time::now_secs() - 60),
        );
        node.set_transfers(None, vec![expired]).await;

        let job = test_job(&wallet, JobTrigger::Sync);
        store.seed_job(&job).await;
        process_job(&store, &node, &config, &job, &shutdown).await;

        assert_eq!(node.failed_batches().await, vec![3]);
        // Expired transfers never get a watcher.
        assert!(store.get_watcher(&wallet.xpub_vanilla, "expired").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn refresh_retry_exhaustion_marks_job_failed() {
        let store = Arc::new(MemStore::new());
        let node = Arc::new(MockNode::new());
        let mut config = test_config();
        config.retry_delay_base = std::time::Duration::from_millis(1);
        let config = Arc::new(config);
        let shutdown = ShutdownChannel::new();
        let wallet = test_wallet();

        node.set_refresh_error("node offline").await;

        let mut job = test_job(&wallet, JobTrigger::Manual);
        job.max_retries = 2;
        store.seed_job(&job).await;
        process_job(&store, &node, &config, &job, &shutdown).await;

        // attempts(1) < max_retries(2), so the job went back to pending.
        assert_eq!(store.job_status(job.job_id).await, Some(JobStatus::Pending));
        assert_eq!(node.refresh_calls().await, 2);

        // Final attempt exhausts the budget and fails for good.
        let mut last = job.clone();
        last.attempts = 1;
        process_job(&store, &node, &config, &last, &shutdown).await;
        assert_eq!(store.job_status(job.job_id).await, Some(JobStatus::Failed));
    }
}

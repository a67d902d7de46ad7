//! The per-transfer watcher.
//!
//! Drives a single `(wallet, recipient_id)` to a terminal state: the tick
//! checks the watcher's own TTL, locates the transfer (searching across all
//! assets while the asset is still unknown), reacts to terminal and expired
//! transfers, then refreshes the wallet under the advisory lock. Terminal
//! transitions record the final status and delete the watcher row in the
//! same call path, so a finished watcher can never be observed again.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};
use ward_common::{
    config::Config, shutdown::ShutdownChannel, time, wallet::WalletIdentity,
};
use ward_node_client::{
    models::{FailTransfersRequest, Transfer, TransferStatus},
    NodeApi,
};
use ward_store::{JobTrigger, WatcherStatus};

use crate::traits::QueueStore;

/// What a single tick decided.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing terminal happened; sleep one refresh interval and go again.
    Continue,
    /// The transfer reached `settled` or `failed`; the watcher is gone.
    Completed(WatcherStatus),
    /// The transfer or the watcher itself expired; the watcher is gone.
    Expired,
}

pub struct TransferWatcher<S, N> {
    store: Arc<S>,
    node: Arc<N>,
    config: Arc<Config>,
    wallet: WalletIdentity,
    recipient_id: String,
    asset_id: Option<String>,
    refresh_count: i32,
}

impl<S: QueueStore, N: NodeApi> TransferWatcher<S, N> {
    pub fn new(
        store: Arc<S>,
        node: Arc<N>,
        config: Arc<Config>,
        wallet: WalletIdentity,
        recipient_id: String,
        asset_id: Option<String>,
    ) -> Self {
        Self {
            store,
            node,
            config,
            wallet,
            recipient_id,
            asset_id,
            refresh_count: 0,
        }
    }

    /// Watch the transfer until it reaches a terminal state or shutdown.
    pub async fn run(mut self, shutdown: &ShutdownChannel) -> Result<()> {
        self.ensure_watcher_exists().await;
        info!(
            "Started watching transfer {recipient} (asset: {asset:?}) for {wallet}",
            recipient = self.recipient_id,
            asset = self.asset_id,
            wallet = self.wallet.short_id(),
        );

        loop {
            if shutdown.try_recv() {
                debug!(
                    "Shutting down watcher for transfer {recipient}",
                    recipient = self.recipient_id
                );
                return Ok(());
            }

            match self.tick().await {
                Ok(TickOutcome::Continue) => {}
                Ok(TickOutcome::Completed(status)) => {
                    info!(
                        "Stopped watching transfer {recipient}: {status}",
                        recipient = self.recipient_id
                    );
                    return Ok(());
                }
                Ok(TickOutcome::Expired) => {
                    info!(
                        "Stopped watching transfer {recipient}: expired",
                        recipient = self.recipient_id
                    );
                    return Ok(());
                }
                // A failed tick is retried after the usual interval; the
                // watcher row outlives any transient node/store trouble.
                Err(e) => error!(
                    "Error watching transfer {recipient}: {e:#}",
                    recipient = self.recipient_id
                ),
            }

            tokio::select! {
                () = shutdown.recv() => return Ok(()),
                () = tokio::time::sleep(self.config.refresh_interval) => {}
            }
        }
    }

    /// One evaluation of the watcher state machine.
    pub async fn tick(&mut self) -> Result<TickOutcome> {
        let now = time::now_secs();

        // An invoice that never got an asset assigned only lives for the
        // short watcher TTL. Once that elapses, nudge a wallet sync (the
        // sync job re-discovers anything real) and expire.
        if self.asset_id.is_none() && self.watcher_ttl_elapsed(now).await? {
            info!(
                "Watcher for {recipient} expired before an asset was assigned, \
                 triggering sync job",
                recipient = self.recipient_id
            );
            if let Err(e) = self
                .store
                .enqueue_job(
                    &self.wallet,
                    JobTrigger::Sync,
                    None,
                    None,
                    self.config.max_refresh_retries,
                )
                .await
            {
                error!("Failed to trigger sync job after watcher expiry: {e:#}");
            }
            self.finish(WatcherStatus::Expired).await?;
            return Ok(TickOutcome::Expired);
        }

        let mut transfer = self.find_transfer().await?;

        // The transfer may have been assigned an asset since the invoice
        // was issued; search every asset's transfer list for it.
        if transfer.is_none() && self.asset_id.is_none() {
            if let Some((found, found_asset)) = self.search_all_assets().await {
                if let Some(asset_id) = found_asset {
                    info!(
                        "Found transfer {recipient} under asset {asset_id}, updating watcher",
                        recipient = self.recipient_id
                    );
                    self.store
                        .update_watcher_asset_and_expiration(
                            &self.wallet.xpub_vanilla,
                            &self.recipient_id,
                            &asset_id,
                            found.expiration,
                        )
                        .await?;
                    self.asset_id = Some(asset_id);
                }
                transfer = Some(found);
            }
        }

        if let Some(tr) = &transfer {
            if tr.is_terminal() {
                let status = match tr.status {
                    TransferStatus::Settled => WatcherStatus::Settled,
                    _ => WatcherStatus::Failed,
                };
                self.finish(status).await?;
                return Ok(TickOutcome::Completed(status));
            }

            if tr.is_expired_at(now) {
                self.cancel_expired(tr, now).await;
                self.finish(WatcherStatus::Expired).await?;
                return Ok(TickOutcome::Expired);
            }
        }

        self.refresh_under_lock(transfer.as_ref()).await
    }

    async fn watcher_ttl_elapsed(&self, now: i64) -> Result<bool> {
        let watcher = self
            .store
            .get_watcher(&self.wallet.xpub_vanilla, &self.recipient_id)
            .await?;
        Ok(watcher
            .and_then(|w| w.expires_at)
            .is_some_and(|expires_at| now >= expires_at))
    }

    /// Locate the watched transfer in the node's transfer list, filtered by
    /// asset when the asset is known.
    async fn find_transfer(&self) -> Result<Option<Transfer>> {
        let transfers = self
            .node
            .list_transfers(&self.wallet, self.asset_id.as_deref())
            .await
            .context("Failed to list transfers")?;
        Ok(transfers
            .into_iter()
            .find(|tr| tr.recipient_id.as_deref() == Some(self.recipient_id.as_str())))
    }

    /// Search the asset-less list and then every asset's list for the
    /// watched recipient. Lookup failures are logged, not fatal: the next
    /// tick simply tries again.
    async fn search_all_assets(&self) -> Option<(Transfer, Option<String>)> {
        let result = self.try_search_all_assets().await;
        match result {
            Ok(found) => found,
            Err(e) => {
                warn!(
                    "Error searching for transfer {recipient} across assets: {e:#}",
                    recipient = self.recipient_id
                );
                None
            }
        }
    }

    async fn try_search_all_assets(&self) -> Result<Option<(Transfer, Option<String>)>> {
        let transfers = self.node.list_transfers(&self.wallet, None).await?;
        if let Some(tr) = transfers
            .into_iter()
            .find(|tr| tr.recipient_id.as_deref() == Some(self.recipient_id.as_str()))
        {
            return Ok(Some((tr, None)));
        }

        for asset in self.node.list_assets(&self.wallet).await? {
            let transfers = self
                .node
                .list_transfers(&self.wallet, Some(&asset.asset_id))
                .await?;
            if let Some(tr) = transfers
                .into_iter()
                .find(|tr| tr.recipient_id.as_deref() == Some(self.recipient_id.as_str()))
            {
                return Ok(Some((tr, Some(asset.asset_id))));
            }
        }
        Ok(None)
    }

    /// Actively fail an expired transfer at the node when the cancellation
    /// predicate allows it. Failures here don't block expiry.
    async fn cancel_expired(&self, tr: &Transfer, now: i64) {
        if !tr.can_cancel_at(now) {
            info!(
                "Transfer {recipient} expired but is not cancellable \
                 (status: {status:?}, kind: {kind:?})",
                recipient = self.recipient_id,
                status = tr.status,
                kind = tr.kind,
            );
            return;
        }
        let Some(batch_transfer_idx) = tr.batch_transfer_idx else {
            warn!(
                "Transfer {recipient} expired but has no batch_transfer_idx",
                recipient = self.recipient_id
            );
            return;
        };
        let req = FailTransfersRequest {
            batch_transfer_idx: Some(batch_transfer_idx),
            no_asset_only: false,
            skip_sync: false,
        };
        match self.node.fail_transfers(&self.wallet, &req).await {
            Ok(_) => info!(
                "Failed expired transfer {recipient} (batch_transfer_idx: {batch_transfer_idx})",
                recipient = self.recipient_id
            ),
            Err(e) => error!(
                "Failed to cancel expired transfer {recipient}: {e}",
                recipient = self.recipient_id
            ),
        }
    }

    /// Refresh the wallet behind the advisory lock and look for a reported
    /// failure on the watched transfer.
    async fn refresh_under_lock(&mut self, transfer: Option<&Transfer>) -> Result<TickOutcome> {
        let xpub_van = &self.wallet.xpub_vanilla;
        if !self
            .store
            .acquire_wallet_lock(xpub_van, self.config.wallet_lock_ttl)
            .await?
        {
            debug!(
                "Wallet {wallet} is being refreshed elsewhere, skipping this cycle",
                wallet = self.wallet.short_id()
            );
            return Ok(TickOutcome::Continue);
        }

        let refresh_result = self.node.refresh_wallet(&self.wallet).await;
        self.store.release_wallet_lock(xpub_van).await?;

        let response = match refresh_result {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    "Refresh failed for {wallet}: {e}",
                    wallet = self.wallet.short_id()
                );
                return Ok(TickOutcome::Continue);
            }
        };
        self.refresh_count += 1;

        if let Some(batch_transfer_idx) = transfer.and_then(|tr| tr.batch_transfer_idx) {
            if let Some(details) = response.failure_details(batch_transfer_idx) {
                error!(
                    "Transfer {recipient} (batch_transfer_idx: {batch_transfer_idx}) \
                     failed during refresh: {details}",
                    recipient = self.recipient_id
                );
                self.finish(WatcherStatus::Failed).await?;
                return Ok(TickOutcome::Completed(WatcherStatus::Failed));
            }
        }

        self.store
            .update_watcher_status(
                xpub_van,
                &self.recipient_id,
                WatcherStatus::Watching,
                Some(self.refresh_count),
            )
            .await?;
        Ok(TickOutcome::Continue)
    }

    /// Record the terminal status and remove the watcher row.
    async fn finish(&self, status: WatcherStatus) -> Result<()> {
        self.store
            .update_watcher_status(
                &self.wallet.xpub_vanilla,
                &self.recipient_id,
                status,
                Some(self.refresh_count),
            )
            .await?;
        self.store
            .stop_watcher(&self.wallet.xpub_vanilla, &self.recipient_id)
            .await?;
        Ok(())
    }

    /// Create the watcher row if it doesn't exist yet, preserving the
    /// expiration of an existing row.
    async fn ensure_watcher_exists(&self) {
        let existing = self
            .store
            .get_watcher(&self.wallet.xpub_vanilla, &self.recipient_id)
            .await;
        match existing {
            Ok(Some(_)) => {}
            Ok(None) => {
                if let Err(e) = self
                    .store
                    .create_watcher(
                        &self.wallet,
                        &self.recipient_id,
                        self.asset_id.as_deref(),
                        self.config.watcher_ttl,
                    )
                    .await
                {
                    warn!("Failed to create watcher entry: {e:#}");
                }
            }
            Err(e) => warn!("Failed to look up watcher entry: {e:#}"),
        }
    }
}

//! The node API surface as a trait.
//!
//! The worker, watcher, and withdrawal orchestrator are all generic over
//! [`NodeApi`] so tests can substitute a scripted node. [`NodeClient`] is
//! the production implementation.
//!
//! [`NodeClient`]: crate::client::NodeClient

use async_trait::async_trait;
use ward_common::wallet::WalletIdentity;

use crate::{error::NodeApiError, models::*};

/// Operations the orchestration core consumes from the wallet node.
/// Method names are the contract; wire paths live in the client.
#[async_trait]
pub trait NodeApi: Send + Sync + 'static {
    /// Sync the wallet and advance its pending transfers.
    /// Returns per-transfer outcomes keyed by `batch_transfer_idx`.
    async fn refresh_wallet(
        &self,
        wallet: &WalletIdentity,
    ) -> Result<RefreshResponse, NodeApiError>;

    /// All assets known to the wallet, across schemas.
    async fn list_assets(&self, wallet: &WalletIdentity) -> Result<Vec<Asset>, NodeApiError>;

    /// Transfers for one asset, or the asset-less transfer list when
    /// `asset_id` is `None`.
    async fn list_transfers(
        &self,
        wallet: &WalletIdentity,
        asset_id: Option<&str>,
    ) -> Result<Vec<Transfer>, NodeApiError>;

    /// Actively fail transfers; used for expired invoices.
    async fn fail_transfers(
        &self,
        wallet: &WalletIdentity,
        req: &FailTransfersRequest,
    ) -> Result<FailTransfersResponse, NodeApiError>;

    async fn get_btc_balance(
        &self,
        wallet: &WalletIdentity,
    ) -> Result<BtcBalanceResponse, NodeApiError>;

    async fn list_channels(&self, wallet: &WalletIdentity)
        -> Result<Vec<Channel>, NodeApiError>;

    async fn open_channel(
        &self,
        wallet: &WalletIdentity,
        req: &OpenChannelRequest,
    ) -> Result<OpenChannelResponse, NodeApiError>;

    async fn close_channel(
        &self,
        wallet: &WalletIdentity,
        req: &CloseChannelRequest,
    ) -> Result<(), NodeApiError>;

    /// On-chain send; returns the broadcast txid.
    async fn send_btc(
        &self,
        wallet: &WalletIdentity,
        req: &SendBtcRequest,
    ) -> Result<String, NodeApiError>;

    /// RGB asset send; returns the broadcast txid.
    async fn send_asset(
        &self,
        wallet: &WalletIdentity,
        req: &SendAssetRequest,
    ) -> Result<String, NodeApiError>;

    async fn list_transactions(
        &self,
        wallet: &WalletIdentity,
    ) -> Result<Vec<Transaction>, NodeApiError>;

    async fn decode_rgb_invoice(
        &self,
        wallet: &WalletIdentity,
        invoice: &str,
    ) -> Result<DecodedRgbInvoice, NodeApiError>;

    async fn create_rgb_invoice(
        &self,
        wallet: &WalletIdentity,
        req: &RgbInvoiceRequest,
    ) -> Result<RgbInvoice, NodeApiError>;
}

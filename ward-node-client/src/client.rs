use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use ward_common::{
    backoff,
    wallet::{
        WalletIdentity, HEADER_MASTER_FINGERPRINT, HEADER_XPUB_COL, HEADER_XPUB_VAN,
    },
};

use crate::{def::NodeApi, error::NodeApiError, models::*};

/// Attempts per logical request, including the first.
const RETRY_ATTEMPTS: usize = 3;
/// Backoff base between retry attempts.
const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(250);

/// The reqwest-backed client to the wallet node.
///
/// One instance per process; the inner [`reqwest::Client`] pools
/// connections. Every request carries the wallet identity headers and the
/// optional bearer token. Transient failures (transport errors and
/// 429/500/502/503/504) are retried inline with exponential backoff.
#[derive(Clone)]
pub struct NodeClient {
    client: reqwest::Client,
    base_url: String,
    bearer: Option<String>,
    /// Timeout for send / broadcast / channel open+close calls, which can
    /// legitimately take longer than a listing.
    send_timeout: Duration,
}

impl NodeClient {
    pub fn new(
        base_url: impl Into<String>,
        bearer_token: Option<String>,
        http_timeout: Duration,
        send_timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("ward")
            .timeout(http_timeout)
            .build()
            .expect("Failed to build reqwest Client");
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            client,
            base_url,
            bearer: bearer_token,
            send_timeout,
        }
    }

    pub fn from_config(config: &ward_common::config::Config) -> Self {
        Self::new(
            config.api_url.clone(),
            config.api_token.clone(),
            config.http_timeout,
            config.send_timeout,
        )
    }

    /// A POST request builder for `path` carrying the identity headers.
    fn post(&self, path: &str, wallet: &WalletIdentity) -> reqwest::RequestBuilder {
        let url = format!("{base}{path}", base = self.base_url);
        let mut builder = self
            .client
            .post(url)
            .header(HEADER_XPUB_VAN, &wallet.xpub_vanilla)
            .header(HEADER_XPUB_COL, &wallet.xpub_colored)
            .header(HEADER_MASTER_FINGERPRINT, &wallet.master_fingerprint);
        if let Some(token) = &self.bearer {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    /// Send a built request, retrying transient failures.
    async fn send<T: DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<T, NodeApiError> {
        let mut delays = backoff::iter(RETRY_BACKOFF_BASE);
        for attempt in 1..=RETRY_ATTEMPTS {
            let Some(this_attempt) = builder.try_clone() else {
                // No streaming bodies in this client, so this is unreachable
                // in practice; send the original unretried if it happens.
                return Self::send_once(builder).await;
            };
            match Self::send_once(this_attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < RETRY_ATTEMPTS => {
                    let delay = delays.next().unwrap_or(RETRY_BACKOFF_BASE);
                    warn!(
                        "Node request failed (attempt {attempt}/{RETRY_ATTEMPTS}), \
                         retrying in {delay:?}: {err}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
        unreachable!("loop always returns on the final attempt")
    }

    /// Whether the node answers HTTP at all. Failing this at startup is
    /// logged but not fatal; the node may simply still be booting.
    pub async fn health_check(&self) -> bool {
        let url = format!("{base}/", base = self.base_url);
        match self.client.get(url).send().await {
            Ok(response) => response.status().as_u16() < 500,
            Err(_) => false,
        }
    }

    async fn send_once<T: DeserializeOwned>(
        builder: reqwest::RequestBuilder,
    ) -> Result<T, NodeApiError> {
        let response = builder.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        if !status.is_success() {
            return Err(NodeApiError::from_response(status.as_u16(), &bytes));
        }
        debug!("Node replied {status} ({n} bytes)", n = bytes.len());
        serde_json::from_slice(&bytes)
            .map_err(|err| NodeApiError::InvalidResponse(err.to_string()))
    }
}

#[async_trait]
impl NodeApi for NodeClient {
    async fn refresh_wallet(
        &self,
        wallet: &WalletIdentity,
    ) -> Result<RefreshResponse, NodeApiError> {
        self.send(self.post("/wallet/refresh", wallet)).await
    }

    async fn list_assets(&self, wallet: &WalletIdentity) -> Result<Vec<Asset>, NodeApiError> {
        let resp: ListAssetsResponse =
            self.send(self.post("/wallet/listassets", wallet)).await?;
        Ok(resp.into_assets())
    }

    async fn list_transfers(
        &self,
        wallet: &WalletIdentity,
        asset_id: Option<&str>,
    ) -> Result<Vec<Transfer>, NodeApiError> {
        let req = ListTransfersRequest {
            asset_id: asset_id.map(str::to_owned),
        };
        let resp: ListTransfersResponse = self
            .send(self.post("/wallet/listtransfers", wallet).json(&req))
            .await?;
        Ok(resp.transfers)
    }

    async fn fail_transfers(
        &self,
        wallet: &WalletIdentity,
        req: &FailTransfersRequest,
    ) -> Result<FailTransfersResponse, NodeApiError> {
        self.send(self.post("/wallet/failtransfers", wallet).json(req))
            .await
    }

    async fn get_btc_balance(
        &self,
        wallet: &WalletIdentity,
    ) -> Result<BtcBalanceResponse, NodeApiError> {
        let body = serde_json::json!({ "skip_sync": false });
        self.send(self.post("/btcbalance", wallet).json(&body)).await
    }

    async fn list_channels(
        &self,
        wallet: &WalletIdentity,
    ) -> Result<Vec<Channel>, NodeApiError> {
        let resp: ListChannelsResponse =
            self.send(self.post("/listchannels", wallet)).await?;
        Ok(resp.channels)
    }

    async fn open_channel(
        &self,
        wallet: &WalletIdentity,
        req: &OpenChannelRequest,
    ) -> Result<OpenChannelResponse, NodeApiError> {
        let builder = self
            .post("/openchannel", wallet)
            .json(req)
            .timeout(self.send_timeout);
        self.send(builder).await
    }

    async fn close_channel(
        &self,
        wallet: &WalletIdentity,
        req: &CloseChannelRequest,
    ) -> Result<(), NodeApiError> {
        let builder = self
            .post("/closechannel", wallet)
            .json(req)
            .timeout(self.send_timeout);
        let _: serde_json::Value = self.send(builder).await?;
        Ok(())
    }

    async fn send_btc(
        &self,
        wallet: &WalletIdentity,
        req: &SendBtcRequest,
    ) -> Result<String, NodeApiError> {
        let builder = self
            .post("/sendbtc", wallet)
            .json(req)
            .timeout(self.send_timeout);
        let resp: SendBtcResponse = self.send(builder).await?;
        Ok(resp.txid)
    }

    async fn send_asset(
        &self,
        wallet: &WalletIdentity,
        req: &SendAssetRequest,
    ) -> Result<String, NodeApiError> {
        let builder = self
            .post("/sendasset", wallet)
            .json(req)
            .timeout(self.send_timeout);
        let resp: SendAssetResponse = self.send(builder).await?;
        Ok(resp.txid)
    }

    async fn list_transactions(
        &self,
        wallet: &WalletIdentity,
    ) -> Result<Vec<Transaction>, NodeApiError> {
        let body = serde_json::json!({ "skip_sync": false });
        let resp: ListTransactionsResponse = self
            .send(self.post("/listtransactions", wallet).json(&body))
            .await?;
        Ok(resp.transactions)
    }

    async fn decode_rgb_invoice(
        &self,
        wallet: &WalletIdentity,
        invoice: &str,
    ) -> Result<DecodedRgbInvoice, NodeApiError> {
        let req = DecodeRgbInvoiceRequest {
            invoice: invoice.to_owned(),
        };
        self.send(self.post("/decodergbinvoice", wallet).json(&req))
            .await
    }

    async fn create_rgb_invoice(
        &self,
        wallet: &WalletIdentity,
        req: &RgbInvoiceRequest,
    ) -> Result<RgbInvoice, NodeApiError> {
        self.send(self.post("/rgbinvoice", wallet).json(req)).await
    }
}

//! Esplora-compatible indexer REST client (spec §4.D, alternate pull-only
//! backend).
//!
//! No teacher precedent beyond the generic `reqwest`+`serde_json` idiom
//! already used for the RPC client (`rpc::client`); this module reuses the
//! same bounded-retry shape for transient failures (connect/timeout/5xx).

use std::time::Duration;

use serde::Deserialize;
use tokio::time::sleep;
use tracing::warn;

use crate::error::{GatewayError, GatewayResult};

const DEFAULT_MAX_RETRIES: u8 = 3;
const DEFAULT_RETRY_INTERVAL_MS: u64 = 1_000;

/// One entry of `GET /address/{a}/txs`, trimmed to the fields the
/// reconciler needs to build an `ObservationDelta`.
#[derive(Debug, Clone, Deserialize)]
pub struct IndexerTx {
    pub txid: String,
    pub vout: Vec<IndexerVout>,
    pub status: IndexerTxStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexerVout {
    pub scriptpubkey: String,
    pub value: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexerTxStatus {
    pub confirmed: bool,
    pub block_height: Option<u64>,
}

/// Thin Esplora-style REST client: `GET /address/{a}`, `/address/{a}/txs`,
/// `/blocks/tip/height`, `/tx/{txid}` (spec §4.D).
#[derive(Debug, Clone)]
pub struct IndexerClient {
    base_url: String,
    client: reqwest::Client,
    max_retries: u8,
    retry_interval_ms: u64,
}

impl IndexerClient {
    pub fn new(base_url: String, timeout: Duration) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Fatal(format!("could not build indexer client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
        })
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> GatewayResult<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut retries = 0;
        loop {
            let response = self.client.get(&url).send().await;
            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_server_error() && retries < self.max_retries {
                        warn!(%status, %url, "indexer server error, retrying");
                        retries += 1;
                        sleep(Duration::from_millis(self.retry_interval_ms)).await;
                        continue;
                    }
                    if !status.is_success() {
                        return Err(GatewayError::Transient(format!(
                            "indexer request to {url} failed with status {status}"
                        )));
                    }
                    return resp.json::<T>().await.map_err(GatewayError::from);
                }
                Err(err) => {
                    let transient = err.is_timeout() || err.is_connect();
                    if transient && retries < self.max_retries {
                        warn!(%err, %url, "transient indexer error, retrying");
                        retries += 1;
                        sleep(Duration::from_millis(self.retry_interval_ms)).await;
                        continue;
                    }
                    return Err(GatewayError::from(err));
                }
            }
        }
    }

    /// `GET /address/{a}/txs`: transactions touching `address`, newest
    /// first per Esplora convention.
    pub async fn address_txs(&self, address: &str) -> GatewayResult<Vec<IndexerTx>> {
        self.get_json(&format!("/address/{address}/txs")).await
    }

    /// `GET /tx/{txid}`.
    pub async fn tx(&self, txid: &str) -> GatewayResult<IndexerTx> {
        self.get_json(&format!("/tx/{txid}")).await
    }

    /// `GET /blocks/tip/height`.
    pub async fn tip_height(&self) -> GatewayResult<u64> {
        self.get_json("/blocks/tip/height").await
    }
}

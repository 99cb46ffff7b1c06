use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::upstream::{UpstreamError, get_json};

const ESPLORA: &str = "explorer";

/// A transaction as listed by an Esplora-compatible explorer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExplorerTx {
    pub txid: String,
    pub vout: Vec<TxOutput>,
    pub status: TxStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TxOutput {
    /// Absent for outputs without a standard address (OP_RETURN and the like)
    #[serde(default)]
    pub scriptpubkey_address: Option<String>,
    /// Satoshis
    pub value: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TxStatus {
    pub confirmed: bool,
}

impl ExplorerTx {
    /// Total satoshis this transaction pays to `address`.
    pub fn received_by(&self, address: &str) -> u64 {
        self.vout
            .iter()
            .filter(|out| out.scriptpubkey_address.as_deref() == Some(address))
            .fold(0u64, |total, out| total.saturating_add(out.value))
    }
}

#[async_trait]
pub trait Explorer: Send + Sync {
    async fn address_transactions(&self, address: &str) -> Result<Vec<ExplorerTx>, UpstreamError>;
}

/// Client for the Esplora REST API (mempool.space, blockstream.info).
pub struct EsploraExplorer {
    client: Client,
    base_url: String,
}

impl EsploraExplorer {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl Explorer for EsploraExplorer {
    async fn address_transactions(&self, address: &str) -> Result<Vec<ExplorerTx>, UpstreamError> {
        let url = format!(
            "{}/address/{address}/txs",
            self.base_url.trim_end_matches('/')
        );
        get_json(&self.client, ESPLORA, &url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_esplora_listing_and_sums_outputs() {
        let body = r#"[{
            "txid": "ab12",
            "version": 2,
            "vin": [],
            "vout": [
                {"scriptpubkey": "76a9", "scriptpubkey_address": "mwatched", "value": 60000},
                {"scriptpubkey": "6a", "scriptpubkey_type": "op_return", "value": 0},
                {"scriptpubkey": "76a9", "scriptpubkey_address": "mother", "value": 5000},
                {"scriptpubkey": "76a9", "scriptpubkey_address": "mwatched", "value": 40000}
            ],
            "status": {"confirmed": true, "block_height": 100}
        }]"#;
        let txs: Vec<ExplorerTx> = serde_json::from_str(body).unwrap();
        assert_eq!(txs.len(), 1);
        assert!(txs[0].status.confirmed);
        assert_eq!(txs[0].vout[1].scriptpubkey_address, None);
        assert_eq!(txs[0].received_by("mwatched"), 100_000);
        assert_eq!(txs[0].received_by("nobody"), 0);
    }
}

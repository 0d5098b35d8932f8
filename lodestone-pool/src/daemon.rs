//! Thin JSON-RPC client for the upstream bitcoind.
//!
//! Only the handful of calls the pool needs: chain health, sync state,
//! block templates, address validation, and block submission. All calls
//! go through one reqwest client with basic auth from the daemon config.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::DaemonConfig;
use crate::error::{Error, Result};

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// Subset of `getblockchaininfo`.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockchainInfo {
    pub chain: String,
    pub blocks: u64,
    pub headers: u64,
    #[serde(rename = "verificationprogress")]
    pub verification_progress: f64,
    #[serde(rename = "initialblockdownload", default)]
    pub initial_block_download: bool,
}

/// Subset of `getnetworkinfo`.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkInfo {
    pub connections: u32,
    #[serde(rename = "subversion", default)]
    pub sub_version: String,
}

/// One transaction from a block template.
#[derive(Debug, Clone, Deserialize)]
pub struct TemplateTransaction {
    pub data: String,
    pub txid: Option<String>,
    pub hash: Option<String>,
}

/// Subset of `getblocktemplate`.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockTemplate {
    pub version: u32,
    #[serde(rename = "previousblockhash")]
    pub previous_block_hash: String,
    #[serde(rename = "coinbasevalue")]
    pub coinbase_value: u64,
    pub target: String,
    #[serde(rename = "curtime")]
    pub cur_time: u32,
    pub bits: String,
    pub height: u64,
    #[serde(default)]
    pub transactions: Vec<TemplateTransaction>,
    pub default_witness_commitment: Option<String>,
}

/// Subset of `validateaddress`.
#[derive(Debug, Clone, Deserialize)]
pub struct AddressInfo {
    #[serde(rename = "isvalid")]
    pub is_valid: bool,
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: Option<String>,
}

pub struct DaemonClient {
    http: reqwest::Client,
    config: DaemonConfig,
}

impl DaemonClient {
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let request = RpcRequest {
            id: 1,
            method,
            params,
        };

        let mut builder = self.http.post(&self.config.url).json(&request);
        if let Some(user) = &self.config.user {
            builder = builder.basic_auth(user, self.config.password.as_deref());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Daemon(format!("{method}: {e}")))?;
        let body: RpcResponse<T> = response
            .json()
            .await
            .map_err(|e| Error::Daemon(format!("{method}: {e}")))?;

        if let Some(err) = body.error {
            return Err(Error::Daemon(format!(
                "{method}: {} (code {})",
                err.message, err.code
            )));
        }
        body.result
            .ok_or_else(|| Error::Daemon(format!("{method}: empty result")))
    }

    pub async fn get_blockchain_info(&self) -> Result<BlockchainInfo> {
        self.call("getblockchaininfo", json!([])).await
    }

    pub async fn get_network_info(&self) -> Result<NetworkInfo> {
        self.call("getnetworkinfo", json!([])).await
    }

    pub async fn get_block_template(&self) -> Result<BlockTemplate> {
        self.call(
            "getblocktemplate",
            json!([{ "rules": ["segwit"], "capabilities": ["coinbasetxn", "workid", "coinbase/append"] }]),
        )
        .await
    }

    pub async fn validate_address(&self, address: &str) -> Result<AddressInfo> {
        self.call("validateaddress", json!([address])).await
    }

    /// Submit a serialized block. `None` means the daemon accepted it;
    /// `Some(reason)` carries the rejection string.
    pub async fn submit_block(&self, block_hex: &str) -> Result<Option<String>> {
        let result: Option<String> = self.call_nullable("submitblock", json!([block_hex])).await?;
        Ok(result)
    }

    // submitblock returns JSON null on success, which `call` treats as a
    // missing result. This variant keeps the null.
    async fn call_nullable<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Option<T>> {
        let request = RpcRequest {
            id: 1,
            method,
            params,
        };

        let mut builder = self.http.post(&self.config.url).json(&request);
        if let Some(user) = &self.config.user {
            builder = builder.basic_auth(user, self.config.password.as_deref());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Daemon(format!("{method}: {e}")))?;
        let body: RpcResponse<T> = response
            .json()
            .await
            .map_err(|e| Error::Daemon(format!("{method}: {e}")))?;

        if let Some(err) = body.error {
            return Err(Error::Daemon(format!(
                "{method}: {} (code {})",
                err.message, err.code
            )));
        }
        Ok(body.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_block_template() {
        let json = r#"{
            "version": 536870912,
            "previousblockhash": "0e63c04c1572cccbeef0e2820fb4cf935b06cad1fb6b71ff6da69e0e14a1ba0e",
            "coinbasevalue": 5000000000,
            "target": "7fffff0000000000000000000000000000000000000000000000000000000000",
            "curtime": 1700000000,
            "bits": "207fffff",
            "height": 101,
            "transactions": [
                { "data": "0100", "txid": "aa", "hash": "bb" }
            ],
            "default_witness_commitment": "6a24aa21a9ed"
        }"#;
        let template: BlockTemplate = serde_json::from_str(json).unwrap();
        assert_eq!(template.height, 101);
        assert_eq!(template.transactions.len(), 1);
        assert!(template.default_witness_commitment.is_some());
    }

    #[test]
    fn parses_blockchain_info() {
        let json = r#"{
            "chain": "regtest",
            "blocks": 205,
            "headers": 205,
            "verificationprogress": 1.0,
            "initialblockdownload": false
        }"#;
        let info: BlockchainInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.chain, "regtest");
        assert!(!info.initial_block_download);
    }
}

//! Minimal JSON-RPC 2.0 client shared by the EVM and Solana adapters

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::ChainError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Serializes as an empty `params` array
pub const NO_PARAMS: [u8; 0] = [];

#[derive(Serialize)]
struct JsonRpcRequest<'a, T> {
    jsonrpc: &'static str,
    method: &'a str,
    params: T,
    id: u64,
}

#[derive(Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize, Debug)]
struct JsonRpcError {
    code: i64,
    message: String,
}

pub struct RpcClient {
    url: String,
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(url: &str) -> Result<Self, ChainError> {
        Self::with_timeout(url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(url: &str, timeout: Duration) -> Result<Self, ChainError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChainError::Rpc(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            url: url.to_string(),
            http,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Call a method whose result must be non-null
    pub async fn call<P, R>(&self, method: &str, params: P) -> Result<R, ChainError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        self.call_optional(method, params)
            .await?
            .ok_or_else(|| ChainError::Rpc(format!("{}: no result in RPC response", method)))
    }

    /// Call a method whose result may legitimately be `null`
    /// (unknown block, pending receipt, ...)
    pub async fn call_optional<P, R>(&self, method: &str, params: P) -> Result<Option<R>, ChainError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        };

        let response = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error(method, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChainError::Rpc(format!("{}: HTTP {}", method, status)));
        }

        let rpc_response: JsonRpcResponse<R> = response
            .json()
            .await
            .map_err(|e| ChainError::Parse(format!("{}: failed to parse response: {}", method, e)))?;

        if let Some(error) = rpc_response.error {
            return Err(ChainError::Rpc(format!(
                "{}: RPC error {}: {}",
                method, error.code, error.message
            )));
        }
        Ok(rpc_response.result)
    }
}

fn transport_error(method: &str, e: reqwest::Error) -> ChainError {
    if e.is_timeout() {
        ChainError::Timeout(format!("{}: {}", method, e))
    } else {
        ChainError::Rpc(format!("{}: HTTP request failed: {}", method, e))
    }
}

/// `0x`-prefixed hex quantity
pub fn to_hex(n: u64) -> String {
    format!("0x{:x}", n)
}

pub fn parse_hex_u64(s: &str) -> Result<u64, ChainError> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16)
        .map_err(|e| ChainError::Parse(format!("invalid hex quantity '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let req = JsonRpcRequest {
            jsonrpc: "2.0",
            method: "eth_getBlockByNumber",
            params: ("0x10", false),
            id: 7,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["method"], "eth_getBlockByNumber");
        assert_eq!(json["params"][0], "0x10");
        assert_eq!(json["params"][1], false);
        assert_eq!(json["id"], 7);
    }

    #[test]
    fn test_no_params_is_empty_array() {
        assert_eq!(serde_json::to_string(&NO_PARAMS).unwrap(), "[]");
    }

    #[test]
    fn test_null_result_is_none() {
        let resp: JsonRpcResponse<String> =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":null}"#).unwrap();
        assert!(resp.result.is_none());
        assert!(resp.error.is_none());
    }

    #[test]
    fn test_error_object_parsed() {
        let resp: JsonRpcResponse<String> = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"header not found"}}"#,
        )
        .unwrap();
        let err = resp.error.unwrap();
        assert_eq!(err.code, -32000);
        assert_eq!(err.message, "header not found");
    }

    #[test]
    fn test_hex_helpers() {
        assert_eq!(to_hex(255), "0xff");
        assert_eq!(parse_hex_u64("0x1b4").unwrap(), 436);
        assert!(parse_hex_u64("0xzz").is_err());
    }
}

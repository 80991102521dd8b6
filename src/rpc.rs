//! Upstream JSON-RPC seam and quantity helpers.
//!
//! The provider only needs `request(method, params) -> result` from the
//! node connection; HTTP, IPC or in-process transports all plug in here.

use alloy_primitives::U256;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::LedgerError;

pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// JSON-RPC error object, passed through from upstream unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("RPC error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// EIP-1193 shaped error for RPC callers.
impl From<LedgerError> for RpcError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Rpc(inner) => inner,
            other => Self::new(other.rpc_code(), other.to_string()),
        }
    }
}

#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError>;
}

/// `0x`-prefixed hex quantity, decimal string or JSON number.
pub fn parse_quantity(value: &Value) -> Result<U256, LedgerError> {
    let parsed = match value {
        Value::Number(n) => n.as_u64().map(U256::from),
        Value::String(s) => match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some("") => Some(U256::ZERO),
            Some(hex) => U256::from_str_radix(hex, 16).ok(),
            None => U256::from_str_radix(s, 10).ok(),
        },
        _ => None,
    };
    parsed.ok_or_else(|| LedgerError::InvalidParams(format!("invalid quantity {value}")))
}

pub fn parse_u64_quantity(value: &Value) -> Result<u64, LedgerError> {
    let quantity = parse_quantity(value)?;
    u64::try_from(quantity)
        .map_err(|_| LedgerError::InvalidParams(format!("quantity {value} does not fit in 64 bits")))
}

/// Minimal hex form used on the wire: `0x0`, `0x1a`, ...
pub fn to_quantity(value: U256) -> String {
    format!("{value:#x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn quantities() {
        assert_eq!(parse_quantity(&json!("0x1a")).unwrap(), U256::from(26));
        assert_eq!(parse_quantity(&json!("0x")).unwrap(), U256::ZERO);
        assert_eq!(parse_quantity(&json!("42")).unwrap(), U256::from(42));
        assert_eq!(parse_quantity(&json!(7)).unwrap(), U256::from(7));
        assert!(parse_quantity(&json!("0xzz")).is_err());
        assert!(parse_quantity(&json!(null)).is_err());
        assert!(parse_quantity(&json!(-1)).is_err());
    }

    #[test]
    fn u64_overflow() {
        assert_eq!(parse_u64_quantity(&json!("0x5208")).unwrap(), 21_000);
        assert!(parse_u64_quantity(&json!("0x10000000000000000")).is_err());
    }

    #[test]
    fn quantity_formatting() {
        assert_eq!(to_quantity(U256::ZERO), "0x0");
        assert_eq!(to_quantity(U256::from(21_000)), "0x5208");
    }

    #[test]
    fn ledger_error_to_rpc() {
        let err = RpcError::from(LedgerError::UserRejected);
        assert_eq!(err.code, 4001);

        let upstream = RpcError::new(-32000, "nonce too low");
        let err = RpcError::from(LedgerError::Rpc(upstream.clone()));
        assert_eq!(err, upstream);
    }
}

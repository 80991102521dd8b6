//! JSON-RPC provider that signs locally on the Ledger and forwards
//! everything else upstream.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::accounts::AccountRegistry;
use crate::config::{AccountSelector, DerivationFn};
use crate::connection::LedgerConnectionInfo;
use crate::eip712::TypedData;
use crate::error::LedgerError;
use crate::rpc::{parse_quantity, parse_u64_quantity, to_quantity, RpcTransport};
use crate::signer::Signer;
use crate::tx::{FeeScheme, SignedTransaction, UnsignedTransaction, MAX_CHAIN_ID};
use crate::types::{Account, Bip32Path, DeviceFilter};

/// Priority fee used when the node has no `eth_maxPriorityFeePerGas`.
pub const DEFAULT_PRIORITY_FEE: u64 = 1_000_000_000;

/// Transaction fields as they arrive in `eth_sendTransaction` params.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransactionRequest {
    pub from: Option<String>,
    pub to: Option<String>,
    pub value: Option<Value>,
    #[serde(alias = "input")]
    pub data: Option<String>,
    pub nonce: Option<Value>,
    pub gas: Option<Value>,
    pub gas_limit: Option<Value>,
    pub gas_price: Option<Value>,
    pub max_fee_per_gas: Option<Value>,
    pub max_priority_fee_per_gas: Option<Value>,
}

/// Current fee parameters reported by the node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeeData {
    pub gas_price: Option<U256>,
    pub max_fee_per_gas: Option<U256>,
    pub max_priority_fee_per_gas: Option<U256>,
}

/// Fee scheme for a request: explicit fee-market fields, then an explicit
/// gas price, then whatever the node suggests.
pub fn select_fee_scheme(
    max_fee_per_gas: Option<U256>,
    max_priority_fee_per_gas: Option<U256>,
    gas_price: Option<U256>,
    fee_data: Option<FeeData>,
) -> FeeScheme {
    if let (Some(max_fee_per_gas), Some(max_priority_fee_per_gas)) =
        (max_fee_per_gas, max_priority_fee_per_gas)
    {
        return FeeScheme::FeeMarket {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        };
    }
    if let Some(gas_price) = gas_price {
        return FeeScheme::Legacy { gas_price };
    }

    let fee_data = fee_data.unwrap_or_default();
    match (fee_data.max_fee_per_gas, fee_data.max_priority_fee_per_gas) {
        (Some(max_fee_per_gas), Some(max_priority_fee_per_gas)) => FeeScheme::FeeMarket {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        },
        _ => FeeScheme::Legacy {
            gas_price: fee_data.gas_price.unwrap_or(U256::ZERO),
        },
    }
}

pub struct LedgerProvider {
    upstream: Arc<dyn RpcTransport>,
    signer: Signer,
    selectors: Vec<AccountSelector>,
    derivation: DerivationFn,
    registry: AccountRegistry,
}

impl LedgerProvider {
    pub fn new(
        upstream: Arc<dyn RpcTransport>,
        signer: Signer,
        accounts: Vec<AccountSelector>,
        derivation: DerivationFn,
    ) -> Self {
        Self {
            upstream,
            signer,
            selectors: accounts,
            derivation,
            registry: AccountRegistry::default(),
        }
    }

    /// Connect the device and derive the configured accounts.
    pub async fn initialize(
        &mut self,
        filter: &DeviceFilter,
        timeout: Duration,
    ) -> Result<(), LedgerError> {
        if !self.signer.is_connected() {
            self.signer.connect(filter, timeout).await?;
        }
        self.registry =
            AccountRegistry::resolve(&self.selectors, &self.derivation, &self.signer).await?;
        log::info!("Ledger provider ready with {} account(s)", self.registry.len());
        Ok(())
    }

    /// Handle one JSON-RPC call.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, LedgerError> {
        match method {
            "eth_accounts" | "eth_requestAccounts" => Ok(json!(self.registry.addresses())),
            "eth_sendTransaction" => {
                let signed = self.sign_request(&params).await?;
                let raw = signed.encode_hex();
                log::debug!("broadcasting {}", signed.hash());
                Ok(self
                    .upstream
                    .request("eth_sendRawTransaction", json!([raw]))
                    .await?)
            }
            "eth_signTransaction" => {
                let signed = self.sign_request(&params).await?;
                Ok(Value::String(signed.encode_hex()))
            }
            "personal_sign" | "eth_sign" => self.personal_sign(&params).await,
            "eth_signTypedData" | "eth_signTypedData_v3" | "eth_signTypedData_v4" => {
                self.sign_typed_data(&params).await
            }
            _ => Ok(self.upstream.request(method, params).await?),
        }
    }

    /// Build, sign and return a transaction without broadcasting it.
    pub async fn sign_transaction(
        &self,
        request: &TransactionRequest,
    ) -> Result<SignedTransaction, LedgerError> {
        self.ensure_connected()?;
        let from = request
            .from
            .as_deref()
            .ok_or_else(|| LedgerError::InvalidParams("transaction has no from".into()))?;
        let account = self.account(from)?.clone();
        let tx = self.build_transaction(&account, request).await?;

        let path: Bip32Path = account.derivation_path.parse()?;
        let signature = self.signer.sign_transaction(&path, &tx.encode_unsigned()).await?;
        Ok(tx.into_signed(&signature))
    }

    /// Fill the gaps in `request` from upstream.
    pub async fn build_transaction(
        &self,
        account: &Account,
        request: &TransactionRequest,
    ) -> Result<UnsignedTransaction, LedgerError> {
        let from = account.checksum_address();
        let to = request
            .to
            .as_deref()
            .map(|to| parse_address(to, "to"))
            .transpose()?;
        let value = optional_quantity(&request.value)?.unwrap_or(U256::ZERO);
        let data = parse_data(request.data.as_deref())?;

        let chain_id = parse_u64_quantity(&self.upstream.request("eth_chainId", json!([])).await?)?;
        if chain_id > MAX_CHAIN_ID {
            return Err(LedgerError::InvalidParams(format!(
                "chain id {chain_id} is too large for EIP-155"
            )));
        }

        let nonce = match &request.nonce {
            Some(nonce) => parse_u64_quantity(nonce)?,
            None => {
                let count = self
                    .upstream
                    .request("eth_getTransactionCount", json!([from, "pending"]))
                    .await?;
                parse_u64_quantity(&count)?
            }
        };

        let gas_limit = match request.gas_limit.as_ref().or(request.gas.as_ref()) {
            Some(gas) => parse_u64_quantity(gas)?,
            None => {
                let mut call = json!({
                    "from": from,
                    "value": to_quantity(value),
                    "data": format!("0x{}", hex::encode(&data)),
                });
                if let Some(to) = &to {
                    call["to"] = json!(to.to_checksum(None));
                }
                let estimate = self.upstream.request("eth_estimateGas", json!([call])).await?;
                parse_u64_quantity(&estimate)?
            }
        };

        let max_fee_per_gas = optional_quantity(&request.max_fee_per_gas)?;
        let max_priority_fee_per_gas = optional_quantity(&request.max_priority_fee_per_gas)?;
        let gas_price = optional_quantity(&request.gas_price)?;
        let explicit_fee = (max_fee_per_gas.is_some() && max_priority_fee_per_gas.is_some())
            || gas_price.is_some();
        let fee_data = if explicit_fee {
            None
        } else {
            Some(self.fetch_fee_data().await?)
        };
        let fee = select_fee_scheme(max_fee_per_gas, max_priority_fee_per_gas, gas_price, fee_data);

        log::debug!("chain {chain_id} nonce {nonce} gas {gas_limit} fee {fee:?}");
        Ok(UnsignedTransaction {
            chain_id,
            nonce,
            gas_limit,
            to,
            value,
            data,
            fee,
        })
    }

    /// `eth_gasPrice`, the latest base fee and the suggested priority fee.
    pub async fn fetch_fee_data(&self) -> Result<FeeData, LedgerError> {
        let gas_price = parse_quantity(&self.upstream.request("eth_gasPrice", json!([])).await?)?;

        let block = self
            .upstream
            .request("eth_getBlockByNumber", json!(["latest", false]))
            .await?;
        let base_fee = match block.get("baseFeePerGas") {
            Some(fee) if !fee.is_null() => Some(parse_quantity(fee)?),
            _ => None,
        };

        let Some(base_fee) = base_fee else {
            return Ok(FeeData {
                gas_price: Some(gas_price),
                ..Default::default()
            });
        };

        let priority = match self.upstream.request("eth_maxPriorityFeePerGas", json!([])).await {
            Ok(fee) => parse_quantity(&fee)?,
            Err(e) => {
                log::debug!("eth_maxPriorityFeePerGas unavailable ({e}), using 1 gwei");
                U256::from(DEFAULT_PRIORITY_FEE)
            }
        };

        Ok(FeeData {
            gas_price: Some(gas_price),
            max_fee_per_gas: Some(base_fee.saturating_mul(U256::from(2)).saturating_add(priority)),
            max_priority_fee_per_gas: Some(priority),
        })
    }

    /// Managed accounts, in configuration order.
    pub fn accounts(&self) -> &[Account] {
        self.registry.as_slice()
    }

    pub fn connection_info(&self) -> LedgerConnectionInfo {
        let handle = self.signer.session().handle();
        LedgerConnectionInfo {
            device_id: handle.map(|h| h.device_id().to_string()),
            model_id: handle.map(|h| h.model_id()),
            accounts: self.registry.as_slice().to_vec(),
            is_connected: self.signer.is_connected(),
        }
    }

    /// Release the device and forget the accounts. Safe to call repeatedly.
    pub async fn disconnect(&mut self) {
        self.registry = AccountRegistry::default();
        self.signer.disconnect().await;
    }

    pub fn upstream(&self) -> &Arc<dyn RpcTransport> {
        &self.upstream
    }

    pub fn signer(&self) -> &Signer {
        &self.signer
    }

    async fn sign_request(&self, params: &Value) -> Result<SignedTransaction, LedgerError> {
        let tx = param(params, 0)?.clone();
        let request: TransactionRequest = serde_json::from_value(tx)
            .map_err(|e| LedgerError::InvalidParams(format!("bad transaction: {e}")))?;
        self.sign_transaction(&request).await
    }

    async fn personal_sign(&self, params: &Value) -> Result<Value, LedgerError> {
        self.ensure_connected()?;
        let first = param_str(params, 0)?;
        let second = param_str(params, 1)?;

        let (address, message) = match (first.parse::<Address>(), second.parse::<Address>()) {
            (Ok(a), Ok(b)) if self.registry.find(&a).is_none() && self.registry.find(&b).is_some() => {
                (second, first)
            }
            (Ok(_), _) => (first, second),
            (Err(_), Ok(_)) => (second, first),
            (Err(_), Err(_)) => {
                return Err(LedgerError::InvalidParams(
                    "personal_sign needs an address parameter".into(),
                ))
            }
        };

        let account = self.account(address)?;
        let path: Bip32Path = account.derivation_path.parse()?;
        let signature = self.signer.sign_message(&path, &message_bytes(message)).await?;
        Ok(Value::String(signature.to_hex()))
    }

    async fn sign_typed_data(&self, params: &Value) -> Result<Value, LedgerError> {
        self.ensure_connected()?;
        let account = self.account(param_str(params, 0)?)?;
        let data = TypedData::from_value(param(params, 1)?.clone())?;

        let path: Bip32Path = account.derivation_path.parse()?;
        let signed = self.signer.sign_typed_data_payload(&path, &data).await?;
        Ok(Value::String(signed.signature.to_hex()))
    }

    fn ensure_connected(&self) -> Result<(), LedgerError> {
        if self.signer.is_connected() {
            Ok(())
        } else {
            Err(LedgerError::DeviceNotConnected("call initialize first".into()))
        }
    }

    fn account(&self, address: &str) -> Result<&Account, LedgerError> {
        address
            .parse::<Address>()
            .ok()
            .and_then(|a| self.registry.find(&a))
            .ok_or_else(|| LedgerError::UnknownAccount(address.to_string()))
    }
}

fn param(params: &Value, index: usize) -> Result<&Value, LedgerError> {
    params
        .get(index)
        .ok_or_else(|| LedgerError::InvalidParams(format!("missing param {index}")))
}

fn param_str(params: &Value, index: usize) -> Result<&str, LedgerError> {
    param(params, index)?
        .as_str()
        .ok_or_else(|| LedgerError::InvalidParams(format!("param {index} must be a string")))
}

fn optional_quantity(value: &Option<Value>) -> Result<Option<U256>, LedgerError> {
    match value {
        Some(Value::Null) | None => Ok(None),
        Some(v) => parse_quantity(v).map(Some),
    }
}

fn parse_address(s: &str, field: &str) -> Result<Address, LedgerError> {
    s.parse()
        .map_err(|_| LedgerError::InvalidParams(format!("invalid {field} address {s:?}")))
}

fn parse_data(data: Option<&str>) -> Result<Bytes, LedgerError> {
    let data = data.unwrap_or("0x");
    let hex_str = data.strip_prefix("0x").unwrap_or(data);
    hex::decode(hex_str)
        .map(Bytes::from)
        .map_err(|e| LedgerError::InvalidParams(format!("invalid data: {e}")))
}

/// `0x` hex is raw bytes, anything else is UTF-8 text.
fn message_bytes(message: &str) -> Vec<u8> {
    message
        .strip_prefix("0x")
        .and_then(|h| hex::decode(h).ok())
        .unwrap_or_else(|| message.as_bytes().to_vec())
}

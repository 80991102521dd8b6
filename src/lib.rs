//! Ethereum JSON-RPC signing provider backed by a Ledger hardware wallet.
//!
//! Talks to the Ledger Ethereum app over USB HID, Bluetooth LE or TCP
//! (Speculos simulator). Signing calls are answered on the device; every
//! other RPC method goes to the upstream node unchanged.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use ledger_eth_provider::{LedgerConfig, LedgerConnection, RpcTransport};
//! use serde_json::json;
//!
//! # async fn run(upstream: Arc<dyn RpcTransport>) -> Result<(), ledger_eth_provider::LedgerError> {
//! let config = LedgerConfig::from_json(r#"{ "accounts": [0, 1] }"#)?;
//! let Some(connection) = LedgerConnection::open(&config, upstream).await? else {
//!     return Ok(());
//! };
//!
//! let accounts = connection.provider().request("eth_accounts", json!([])).await?;
//! println!("{accounts}");
//!
//! connection.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`session`] -- [`DeviceSession`]: discovery, connection lifecycle, action dispatch
//! - [`signer`] -- [`Signer`]: addresses and signatures from the Ethereum app
//! - [`accounts`] -- [`AccountRegistry`]: config entries to derived accounts
//! - [`provider`] -- [`LedgerProvider`]: JSON-RPC interception
//! - [`connection`] -- [`LedgerConnection`]: per-network lifecycle
//! - [`transport`] -- device communication (USB HID, BLE, TCP)
//! - [`tx`], [`eip712`] -- transaction and typed-data encoding
//!
//! # Feature flags
//!
//! - `hid` (default) -- USB HID transport for real Ledger devices
//! - `ble` -- Bluetooth LE transport
//! - `tcp` -- TCP transport for the Speculos simulator

pub mod accounts;
pub mod apdu;
pub mod commands;
pub mod config;
pub mod connection;
pub mod eip712;
pub mod error;
pub(crate) mod protocol;
pub mod provider;
pub mod rpc;
pub mod session;
pub mod signer;
pub mod transport;
pub mod tx;
pub mod types;

pub use accounts::{parse_account_indices, AccountRegistry};
pub use commands::{AppConfiguration, AppInfo, DeviceAction};
pub use config::{AccountSelector, DerivationFn, LedgerConfig, LedgerOptions};
pub use connection::{LedgerConnection, LedgerConnectionInfo};
pub use eip712::TypedData;
pub use error::{LedgerError, TransportError};
pub use provider::{LedgerProvider, TransactionRequest};
pub use rpc::{RpcError, RpcTransport};
pub use session::{DeviceActionResult, DeviceSession, SessionHandle, SessionState};
pub use signer::{Signer, TypedDataSignature};
pub use transport::{Transport, TransportType};
pub use tx::{FeeScheme, SignedTransaction, UnsignedTransaction};
pub use types::{Account, AddressInfo, Bip32Path, DeviceFilter, DeviceModel, SignatureComponents};

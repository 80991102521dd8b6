//! Per-network Ledger configuration.
//!
//! ```json
//! {
//!   "accounts": [0, "1", "m/44'/60'/0'/0/5"],
//!   "options": {
//!     "connectionTimeout": 30000,
//!     "actionTimeout": 60000,
//!     "deviceFilter": { "modelId": "nanoX" },
//!     "transportType": "usb",
//!     "derivationPath": "m/44'/60'/0'/0/{index}"
//!   }
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LedgerError;
use crate::transport::TransportType;
use crate::types::DeviceFilter;

/// Maps an account index to a derivation path.
pub type DerivationFn = Arc<dyn Fn(u32) -> String + Send + Sync>;

pub const INDEX_PLACEHOLDER: &str = "{index}";
pub const DEFAULT_DERIVATION_PATH: &str = "m/44'/60'/0'/0/{index}";

/// One entry of the `accounts` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AccountSelector {
    Index(u32),
    Text(String),
    /// Anything else; skipped when resolving accounts.
    Other(Value),
}

impl From<u32> for AccountSelector {
    fn from(index: u32) -> Self {
        Self::Index(index)
    }
}

impl From<&str> for AccountSelector {
    fn from(s: &str) -> Self {
        Self::Text(s.into())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Usb,
    Ble,
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpOptions {
    pub host: String,
    pub port: u16,
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 9999,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LedgerOptions {
    /// Discovery deadline in milliseconds.
    pub connection_timeout: u64,
    /// Per-action deadline in milliseconds.
    pub action_timeout: u64,
    pub device_filter: DeviceFilter,
    pub transport_type: TransportKind,
    pub tcp: TcpOptions,
    /// Template with an `{index}` placeholder.
    pub derivation_path: String,
}

impl Default for LedgerOptions {
    fn default() -> Self {
        Self {
            connection_timeout: 30_000,
            action_timeout: 60_000,
            device_filter: DeviceFilter::default(),
            transport_type: TransportKind::Usb,
            tcp: TcpOptions::default(),
            derivation_path: DEFAULT_DERIVATION_PATH.into(),
        }
    }
}

impl LedgerOptions {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout)
    }

    pub fn transport_type(&self) -> TransportType {
        match self.transport_type {
            TransportKind::Usb => TransportType::Usb,
            TransportKind::Ble => TransportType::Ble,
            TransportKind::Tcp => TransportType::Tcp(self.tcp.host.clone(), self.tcp.port),
        }
    }

    pub fn derivation_fn(&self) -> DerivationFn {
        let template = self.derivation_path.clone();
        Arc::new(move |index| template.replace(INDEX_PLACEHOLDER, &index.to_string()))
    }
}

/// `m/44'/60'/0'/0/{index}`
pub fn default_derivation() -> DerivationFn {
    Arc::new(|index| format!("m/44'/60'/0'/0/{index}"))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub accounts: Vec<AccountSelector>,
    pub options: LedgerOptions,
}

impl LedgerConfig {
    pub fn from_json(json: &str) -> Result<Self, LedgerError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| LedgerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        let options = &self.options;
        if options.connection_timeout == 0 {
            return Err(LedgerError::Config("connectionTimeout must be positive".into()));
        }
        if options.action_timeout == 0 {
            return Err(LedgerError::Config("actionTimeout must be positive".into()));
        }
        if !options.derivation_path.contains(INDEX_PLACEHOLDER) {
            return Err(LedgerError::Config(format!(
                "derivationPath {:?} has no {INDEX_PLACEHOLDER} placeholder",
                options.derivation_path
            )));
        }
        Ok(())
    }

    /// A network without accounts is served by the plain upstream connection.
    pub fn has_accounts(&self) -> bool {
        !self.accounts.is_empty()
    }
}

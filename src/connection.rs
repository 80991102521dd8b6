//! Per-network connection lifecycle.
//!
//! A network whose config lists Ledger accounts gets its RPC traffic
//! routed through a [`LedgerProvider`]; other networks keep the plain
//! upstream connection.

use std::sync::Arc;

use serde::Serialize;

use crate::config::LedgerConfig;
use crate::error::LedgerError;
use crate::provider::LedgerProvider;
use crate::rpc::RpcTransport;
use crate::session::DeviceSession;
use crate::signer::Signer;
use crate::transport;
use crate::types::Account;

/// Connection metadata for callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerConnectionInfo {
    pub device_id: Option<String>,
    pub model_id: Option<String>,
    pub accounts: Vec<Account>,
    pub is_connected: bool,
}

pub struct LedgerConnection {
    provider: LedgerProvider,
}

impl LedgerConnection {
    /// Wrap `upstream` in a Ledger provider when `config` lists accounts.
    ///
    /// Returns `Ok(None)` for networks without Ledger accounts.
    pub async fn open(
        config: &LedgerConfig,
        upstream: Arc<dyn RpcTransport>,
    ) -> Result<Option<Self>, LedgerError> {
        if !config.has_accounts() {
            return Ok(None);
        }
        config.validate()?;

        let options = &config.options;
        let transport_type = options.transport_type();
        log::info!("opening Ledger connection over {transport_type}");
        let transport = transport::open(&transport_type)
            .map_err(|e| LedgerError::DeviceNotConnected(e.to_string()))?;
        let session = DeviceSession::new(transport).with_action_timeout(options.action_timeout());

        let provider = LedgerProvider::new(
            upstream,
            Signer::new(session),
            config.accounts.clone(),
            options.derivation_fn(),
        );
        Self::from_provider(provider, config).await.map(Some)
    }

    /// Initialize an already assembled provider, e.g. one built on a
    /// custom transport or derivation function.
    pub async fn from_provider(
        mut provider: LedgerProvider,
        config: &LedgerConfig,
    ) -> Result<Self, LedgerError> {
        let options = &config.options;
        if let Err(e) = provider
            .initialize(&options.device_filter, options.connection_timeout())
            .await
        {
            provider.disconnect().await;
            return Err(e);
        }
        Ok(Self { provider })
    }

    pub fn info(&self) -> LedgerConnectionInfo {
        self.provider.connection_info()
    }

    pub fn provider(&self) -> &LedgerProvider {
        &self.provider
    }

    /// Release the device. Errors are logged, never returned.
    pub async fn close(mut self) {
        self.provider.disconnect().await;
        log::info!("Ledger connection closed");
    }
}

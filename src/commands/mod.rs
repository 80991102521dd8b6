//! Individual command implementations.
//!
//! You probably want [`Signer`](crate::signer::Signer) instead. Every
//! `exec` returns a [`DeviceFailure`] on a transport error, a non-success
//! status word or a malformed answer.

pub mod app_info;
pub mod get_address;
pub mod open_app;
pub mod quit_app;
pub mod sign_message;
pub mod sign_tx;
pub mod sign_typed_data;

use alloy_primitives::B256;

use crate::error::{DeviceFailure, LedgerError};
use crate::transport::Transport;
use crate::types::{AddressInfo, Bip32Path, SignatureComponents};

pub use app_info::{AppConfiguration, AppInfo};

/// One discrete operation submitted to a [`DeviceSession`](crate::session::DeviceSession).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceAction {
    GetAddress {
        path: Bip32Path,
        confirm: bool,
    },
    /// `payload` is the unsigned RLP (with type prefix for typed transactions).
    SignTransaction {
        path: Bip32Path,
        payload: Vec<u8>,
    },
    SignPersonalMessage {
        path: Bip32Path,
        message: Vec<u8>,
    },
    SignTypedDataHash {
        path: Bip32Path,
        domain_separator: B256,
        struct_hash: B256,
    },
    GetAppConfiguration,
}

impl DeviceAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::GetAddress { .. } => "get-address",
            Self::SignTransaction { .. } => "sign-transaction",
            Self::SignPersonalMessage { .. } => "sign-personal-message",
            Self::SignTypedDataHash { .. } => "sign-typed-data",
            Self::GetAppConfiguration => "get-app-configuration",
        }
    }
}

/// Output of a completed [`DeviceAction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutput {
    Address(AddressInfo),
    Signature(SignatureComponents),
    AppConfiguration(AppConfiguration),
}

pub(crate) async fn run(
    transport: &dyn Transport,
    action: &DeviceAction,
) -> Result<ActionOutput, DeviceFailure> {
    match action {
        DeviceAction::GetAddress { path, confirm } => get_address::exec(transport, path, *confirm)
            .await
            .map(ActionOutput::Address),
        DeviceAction::SignTransaction { path, payload } => {
            sign_tx::exec(transport, path, payload)
                .await
                .map(ActionOutput::Signature)
        }
        DeviceAction::SignPersonalMessage { path, message } => {
            sign_message::exec(transport, path, message)
                .await
                .map(ActionOutput::Signature)
        }
        DeviceAction::SignTypedDataHash {
            path,
            domain_separator,
            struct_hash,
        } => sign_typed_data::exec(transport, path, domain_separator, struct_hash)
            .await
            .map(ActionOutput::Signature),
        DeviceAction::GetAppConfiguration => app_info::configuration(transport)
            .await
            .map(ActionOutput::AppConfiguration),
    }
}

/// A well-formed status word with an unparseable payload still fails the action.
pub(crate) fn malformed(err: LedgerError) -> DeviceFailure {
    DeviceFailure::from_message(err.to_string())
}

//! High-level API - [`Signer`] owns a [`DeviceSession`] and exposes the
//! Ethereum app operations.

use std::time::Duration;

use alloy_primitives::B256;
use serde_json::Value;

use crate::commands::{ActionOutput, AppConfiguration, DeviceAction};
use crate::eip712::TypedData;
use crate::error::LedgerError;
use crate::session::{DeviceActionResult, DeviceSession, SessionHandle};
use crate::types::{AddressInfo, Bip32Path, DeviceFilter, SignatureComponents};

/// Name the dashboard knows the Ethereum app by.
pub const ETHEREUM_APP: &str = "Ethereum";

/// Result of signing EIP-712 data: the device signature and the digest it
/// covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypedDataSignature {
    pub digest: B256,
    pub signature: SignatureComponents,
}

/// Ethereum signing on a Ledger device.
///
/// Every device failure goes through the same mapping: a user denial
/// becomes [`LedgerError::UserRejected`], a locked device
/// [`LedgerError::AppNotOpen`], anything else
/// [`LedgerError::CommandFailed`]. Without a session, calls fail with
/// [`LedgerError::DeviceNotConnected`] before touching the device.
pub struct Signer {
    session: DeviceSession,
}

impl Signer {
    pub fn new(session: DeviceSession) -> Self {
        Self { session }
    }

    /// Connect and bring up the Ethereum app.
    pub async fn connect(
        &mut self,
        filter: &DeviceFilter,
        timeout: Duration,
    ) -> Result<SessionHandle, LedgerError> {
        let handle = self.session.connect(filter, timeout).await?;
        if let Err(e) = self.session.open_application(ETHEREUM_APP).await {
            self.session.disconnect().await;
            return Err(e);
        }
        Ok(handle)
    }

    pub async fn disconnect(&mut self) {
        self.session.disconnect().await;
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn session(&self) -> &DeviceSession {
        &self.session
    }

    /// Derive the address for `path`. With `confirm_on_device` the device
    /// displays it and waits for the holder's approval.
    pub async fn get_address(
        &self,
        path: &Bip32Path,
        confirm_on_device: bool,
    ) -> Result<AddressInfo, LedgerError> {
        let action = DeviceAction::GetAddress {
            path: path.clone(),
            confirm: confirm_on_device,
        };
        match self.run(action).await? {
            ActionOutput::Address(info) => Ok(info),
            other => Err(unexpected(other)),
        }
    }

    /// `unsigned_tx` is the unsigned RLP payload, type prefix included.
    pub async fn sign_transaction(
        &self,
        path: &Bip32Path,
        unsigned_tx: &[u8],
    ) -> Result<SignatureComponents, LedgerError> {
        let action = DeviceAction::SignTransaction {
            path: path.clone(),
            payload: unsigned_tx.to_vec(),
        };
        self.run_signature(action).await
    }

    /// EIP-191 personal message.
    pub async fn sign_message(
        &self,
        path: &Bip32Path,
        message: &[u8],
    ) -> Result<SignatureComponents, LedgerError> {
        let action = DeviceAction::SignPersonalMessage {
            path: path.clone(),
            message: message.to_vec(),
        };
        self.run_signature(action).await
    }

    /// EIP-712 from loose parts; the primary type is inferred from `types`.
    pub async fn sign_typed_data(
        &self,
        path: &Bip32Path,
        domain: Value,
        types: Value,
        value: Value,
    ) -> Result<TypedDataSignature, LedgerError> {
        let data = TypedData::new(domain, types, None, value)?;
        self.sign_typed_data_payload(path, &data).await
    }

    pub async fn sign_typed_data_payload(
        &self,
        path: &Bip32Path,
        data: &TypedData,
    ) -> Result<TypedDataSignature, LedgerError> {
        let domain_separator = data.domain_separator()?;
        let struct_hash = data.struct_hash()?;
        let digest = crate::eip712::signing_digest(&domain_separator, &struct_hash);

        let action = DeviceAction::SignTypedDataHash {
            path: path.clone(),
            domain_separator,
            struct_hash,
        };
        let signature = self.run_signature(action).await?;
        Ok(TypedDataSignature { digest, signature })
    }

    /// Ethereum app version and settings.
    pub async fn app_configuration(&self) -> Result<AppConfiguration, LedgerError> {
        match self.run(DeviceAction::GetAppConfiguration).await? {
            ActionOutput::AppConfiguration(cfg) => Ok(cfg),
            other => Err(unexpected(other)),
        }
    }

    async fn run_signature(&self, action: DeviceAction) -> Result<SignatureComponents, LedgerError> {
        match self.run(action).await? {
            ActionOutput::Signature(sig) => Ok(sig),
            other => Err(unexpected(other)),
        }
    }

    async fn run(&self, action: DeviceAction) -> Result<ActionOutput, LedgerError> {
        into_output(self.session.execute(action).await?)
    }
}

fn into_output(result: DeviceActionResult) -> Result<ActionOutput, LedgerError> {
    match result {
        DeviceActionResult::Completed(output) => Ok(output),
        DeviceActionResult::Failed(failure) => Err(LedgerError::from_failure(failure)),
    }
}

fn unexpected(output: ActionOutput) -> LedgerError {
    LedgerError::InvalidResponse(format!("unexpected action output {output:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeviceFailure;

    #[test]
    fn rejection_by_status_or_message() {
        for failure in [
            DeviceFailure::from_status(0x6985),
            DeviceFailure::from_status(0x5501),
            DeviceFailure::from_message("UserRefusedOnDevice: rejected"),
        ] {
            let err = into_output(DeviceActionResult::Failed(failure)).unwrap_err();
            assert!(matches!(err, LedgerError::UserRejected), "{err:?}");
        }
    }

    #[test]
    fn other_failures_carry_message() {
        let err = into_output(DeviceActionResult::Failed(DeviceFailure::from_message(
            "HID read failed",
        )))
        .unwrap_err();
        assert!(matches!(err, LedgerError::CommandFailed(m) if m == "HID read failed"));
    }

    #[test]
    fn completed_passes_through() {
        let sig = SignatureComponents {
            r: B256::ZERO,
            s: B256::ZERO,
            v: 27,
        };
        let out = into_output(DeviceActionResult::Completed(ActionOutput::Signature(sig))).unwrap();
        assert_eq!(out, ActionOutput::Signature(sig));
    }
}

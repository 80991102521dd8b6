//! Error types, Ledger status word mapping and device failure classification.

use std::time::Duration;

use thiserror::Error;

use crate::rpc::{RpcError, INTERNAL_ERROR, INVALID_PARAMS};

/// Status words returned by the Ledger dashboard and the Ethereum app.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum StatusWord {
    Ok = 0x9000,
    UserRefusedOnDevice = 0x5501,
    DeviceLocked = 0x5515,
    AppNotInstalled = 0x6807,
    InvalidLength = 0x6700,
    ConditionsNotSatisfied = 0x6985,
    InvalidData = 0x6A80,
    InvalidParameters = 0x6B00,
    InsNotSupported = 0x6D00,
    ClaNotSupported = 0x6E00,
}

impl StatusWord {
    pub(crate) fn is_success(code: u16) -> bool {
        code == Self::Ok as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            0x9000 => Self::Ok,
            0x5501 => Self::UserRefusedOnDevice,
            0x5515 => Self::DeviceLocked,
            0x6807 => Self::AppNotInstalled,
            0x6700 => Self::InvalidLength,
            0x6985 => Self::ConditionsNotSatisfied,
            0x6A80 => Self::InvalidData,
            0x6B00 => Self::InvalidParameters,
            0x6D00 => Self::InsNotSupported,
            0x6E00 => Self::ClaNotSupported,
            _ => return None,
        })
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::UserRefusedOnDevice => "user rejected the request on device",
            Self::DeviceLocked => "device is locked",
            Self::AppNotInstalled => "application is not installed",
            Self::InvalidLength => "wrong data length",
            Self::ConditionsNotSatisfied => "user rejected the request on device",
            Self::InvalidData => "invalid data",
            Self::InvalidParameters => "invalid parameters",
            Self::InsNotSupported => "instruction not supported - is the Ethereum app open?",
            Self::ClaNotSupported => "class not supported - is the Ethereum app open?",
        }
    }

    /// Codes the device uses when the holder declines an action.
    pub fn is_rejection(code: u16) -> bool {
        matches!(
            Self::from_code(code),
            Some(Self::ConditionsNotSatisfied | Self::UserRefusedOnDevice)
        )
    }
}

/// Where a failure was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureSource {
    /// The device answered: a status word or a device-reported message.
    Device,
    /// The link to the device failed (USB, BLE, TCP, IO).
    Transport,
}

/// Why a device action ended in the `Failed` state.
///
/// Carries the status word when the device answered, and a human readable
/// message in every case (transport errors have no status word).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFailure {
    pub status: Option<u16>,
    pub message: String,
    pub source: FailureSource,
}

const REJECTION_MARKER: &str = "rejected";

impl DeviceFailure {
    pub fn from_status(code: u16) -> Self {
        let message = match StatusWord::from_code(code) {
            Some(sw) => format!("device returned status 0x{code:04X}: {}", sw.description()),
            None => format!("device returned status 0x{code:04X}"),
        };
        Self {
            status: Some(code),
            message,
            source: FailureSource::Device,
        }
    }

    /// A failure the device reported without a status word.
    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            source: FailureSource::Device,
        }
    }

    pub fn from_transport(error: &TransportError) -> Self {
        Self {
            status: None,
            message: error.to_string(),
            source: FailureSource::Transport,
        }
    }

    /// Status code first, then the message substring rule. Transport
    /// failures are never rejections.
    pub fn is_user_rejection(&self) -> bool {
        if self.source == FailureSource::Transport {
            return false;
        }
        if let Some(code) = self.status {
            if StatusWord::is_rejection(code) {
                return true;
            }
        }
        self.message.to_ascii_lowercase().contains(REJECTION_MARKER)
    }

    pub fn is_locked(&self) -> bool {
        self.status == Some(StatusWord::DeviceLocked as u16)
    }
}

impl From<TransportError> for DeviceFailure {
    fn from(e: TransportError) -> Self {
        Self::from_transport(&e)
    }
}

impl std::fmt::Display for DeviceFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Errors returned by the library.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Ledger device not connected: {0}")]
    DeviceNotConnected(String),

    #[error("Ethereum app is not open: {0}")]
    AppNotOpen(String),

    #[error("user rejected the request on device")]
    UserRejected,

    #[error("device command failed: {0}")]
    CommandFailed(String),

    #[error("account {0} is not managed by this Ledger provider")]
    UnknownAccount(String),

    #[error("device did not answer within {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("invalid BIP32 path: {0}")]
    InvalidPath(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("invalid typed data: {0}")]
    InvalidTypedData(String),

    #[error("invalid Ledger configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl LedgerError {
    /// Map a failed device action onto the public taxonomy.
    pub fn from_failure(failure: DeviceFailure) -> Self {
        if failure.is_user_rejection() {
            Self::UserRejected
        } else if failure.is_locked() {
            Self::AppNotOpen("device is locked".into())
        } else {
            Self::CommandFailed(failure.message)
        }
    }

    /// EIP-1193 style error code for RPC callers.
    pub fn rpc_code(&self) -> i64 {
        match self {
            Self::UserRejected => 4001,
            Self::UnknownAccount(_) => 4100,
            Self::DeviceNotConnected(_) | Self::AppNotOpen(_) => 4900,
            Self::InvalidParams(_) | Self::InvalidTypedData(_) | Self::InvalidPath(_) => {
                INVALID_PARAMS
            }
            Self::Rpc(e) => e.code,
            _ => INTERNAL_ERROR,
        }
    }
}

/// Transport-level errors (USB, BLE, TCP, IO).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no Ledger device found - is it plugged in and unlocked?")]
    DeviceNotFound,

    #[error("communication error: {0}")]
    Comm(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("transport is not connected")]
    NotConnected,

    #[error("device timed out after {0}ms")]
    Timeout(u32),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

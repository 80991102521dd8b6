//! Core types: BIP32 derivation paths, device descriptors, addresses, signatures.

use std::str::FromStr;

use alloy_primitives::{Address, B256};
use byteorder::{BigEndian, WriteBytesExt};
use serde::{Deserialize, Serialize, Serializer};

use crate::error::LedgerError;

const HARDENED: u32 = 0x8000_0000;
/// The Ethereum app refuses paths deeper than this.
const MAX_DEPTH: usize = 10;
const BIP44_PURPOSE: u32 = 44;
const ETH_COIN_TYPE: u32 = 60;

/// BIP32 derivation path.
///
/// Parsed from the usual `m/44'/60'/0'/0/0` notation; `h`/`H` are accepted
/// as hardened markers and the leading `m/` is optional.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bip32Path(Vec<u32>);

impl Bip32Path {
    pub fn new(components: Vec<u32>) -> Result<Self, LedgerError> {
        let path = Self(components);
        path.validate()?;
        Ok(path)
    }

    /// Ledger Live / MetaMask layout: `m/44'/60'/0'/0/index`
    #[must_use]
    pub fn ethereum(index: u32) -> Self {
        Self(vec![
            BIP44_PURPOSE | HARDENED,
            ETH_COIN_TYPE | HARDENED,
            HARDENED,
            0,
            index,
        ])
    }

    /// Wire format: `[n: u8][path[0]: u32 BE]...[path[n-1]: u32 BE]`
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + self.0.len() * 4);
        buf.push(self.0.len() as u8);
        for &component in &self.0 {
            buf.write_u32::<BigEndian>(component).unwrap();
        }
        buf
    }

    pub fn components(&self) -> &[u32] {
        &self.0
    }

    /// Trailing address index of a five-level BIP44 path
    /// (`m/44'/coin'/account'/change/index`).
    pub fn bip44_index(&self) -> Option<u32> {
        match self.0.as_slice() {
            [purpose, coin, account, change, index]
                if *purpose == (BIP44_PURPOSE | HARDENED)
                    && coin & HARDENED != 0
                    && account & HARDENED != 0
                    && change & HARDENED == 0
                    && index & HARDENED == 0 =>
            {
                Some(*index)
            }
            _ => None,
        }
    }

    fn validate(&self) -> Result<(), LedgerError> {
        if self.0.is_empty() {
            return Err(LedgerError::InvalidPath("path has no components".into()));
        }
        if self.0.len() > MAX_DEPTH {
            return Err(LedgerError::InvalidPath(format!(
                "path has {} components (max {MAX_DEPTH})",
                self.0.len()
            )));
        }
        Ok(())
    }
}

impl FromStr for Bip32Path {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let body = trimmed
            .strip_prefix("m/")
            .or_else(|| trimmed.strip_prefix("M/"))
            .unwrap_or(trimmed);

        let mut components = Vec::new();
        for part in body.split('/') {
            let (digits, hardened) = match part.strip_suffix(['\'', 'h', 'H']) {
                Some(d) => (d, true),
                None => (part, false),
            };
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return Err(LedgerError::InvalidPath(format!(
                    "bad component {part:?} in {s:?}"
                )));
            }
            let value: u32 = digits
                .parse()
                .map_err(|_| LedgerError::InvalidPath(format!("component {part:?} overflows")))?;
            if value & HARDENED != 0 {
                return Err(LedgerError::InvalidPath(format!(
                    "component {part:?} out of range"
                )));
            }
            components.push(if hardened { value | HARDENED } else { value });
        }

        Self::new(components)
    }
}

impl std::fmt::Display for Bip32Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "m")?;
        for &c in &self.0 {
            let val = c & !HARDENED;
            let h = if c & HARDENED != 0 { "'" } else { "" };
            write!(f, "/{val}{h}")?;
        }
        Ok(())
    }
}

/// Ledger hardware family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceModel {
    NanoS,
    NanoSPlus,
    NanoX,
    Flex,
    Stax,
    Speculos,
    Unknown(u16),
}

impl DeviceModel {
    /// Upper byte of the PID encodes the device family:
    /// `0x10` = Nano S, `0x40` = Nano X, `0x50` = Nano S+,
    /// `0x60` = Stax, `0x70` = Flex.
    pub fn from_product_id(pid: u16) -> Self {
        match pid >> 8 {
            0x10 => Self::NanoS,
            0x40 => Self::NanoX,
            0x50 => Self::NanoSPlus,
            0x60 => Self::Stax,
            0x70 => Self::Flex,
            _ => Self::Unknown(pid),
        }
    }

    /// Short model identifier, as used in device filters.
    pub fn id(&self) -> String {
        match self {
            Self::NanoS => "nanoS".into(),
            Self::NanoSPlus => "nanoSP".into(),
            Self::NanoX => "nanoX".into(),
            Self::Flex => "flex".into(),
            Self::Stax => "stax".into(),
            Self::Speculos => "speculos".into(),
            Self::Unknown(pid) => format!("unknown-{pid:04x}"),
        }
    }
}

impl std::fmt::Display for DeviceModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NanoS => write!(f, "Nano S"),
            Self::NanoSPlus => write!(f, "Nano S+"),
            Self::NanoX => write!(f, "Nano X"),
            Self::Flex => write!(f, "Flex"),
            Self::Stax => write!(f, "Stax"),
            Self::Speculos => write!(f, "Speculos"),
            Self::Unknown(pid) => write!(f, "Unknown (0x{pid:04X})"),
        }
    }
}

/// A device seen during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// Transport-specific identifier (HID path, BLE peripheral id, host:port).
    pub device_id: String,
    pub model: DeviceModel,
}

impl DiscoveredDevice {
    pub fn model_id(&self) -> String {
        self.model.id()
    }
}

/// Optional constraints used to pick one device out of several.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
}

impl DeviceFilter {
    pub fn is_empty(&self) -> bool {
        self.device_id.is_none() && self.model_id.is_none()
    }

    pub fn matches(&self, device: &DiscoveredDevice) -> bool {
        if let Some(id) = &self.device_id {
            if *id != device.device_id {
                return false;
            }
        }
        if let Some(model) = &self.model_id {
            if !model.eq_ignore_ascii_case(&device.model_id()) {
                return false;
            }
        }
        true
    }

    /// First matching device, or the first device when nothing matches.
    pub fn select<'a>(&self, devices: &'a [DiscoveredDevice]) -> Option<&'a DiscoveredDevice> {
        devices
            .iter()
            .find(|d| self.matches(d))
            .or_else(|| devices.first())
    }
}

/// Output of the get-address command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressInfo {
    pub address: Address,
    /// Uncompressed secp256k1 key (65 bytes, `0x04` prefix).
    pub public_key: Vec<u8>,
}

impl AddressInfo {
    pub fn public_key_hex(&self) -> String {
        format!("0x{}", hex::encode(&self.public_key))
    }
}

/// ECDSA signature as returned by the Ethereum app.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureComponents {
    pub r: B256,
    pub s: B256,
    pub v: u8,
}

impl SignatureComponents {
    /// Device layout: `[v][r (32)][s (32)]`
    pub fn from_device(data: &[u8]) -> Result<Self, LedgerError> {
        if data.len() < 65 {
            return Err(LedgerError::InvalidResponse(format!(
                "expected 65-byte signature, got {} bytes",
                data.len()
            )));
        }
        Ok(Self {
            v: data[0],
            r: B256::from_slice(&data[1..33]),
            s: B256::from_slice(&data[33..65]),
        })
    }

    /// `r ‖ s ‖ v`
    pub fn to_bytes(&self) -> [u8; 65] {
        let mut out = [0u8; 65];
        out[..32].copy_from_slice(self.r.as_slice());
        out[32..64].copy_from_slice(self.s.as_slice());
        out[64] = self.v;
        out
    }

    /// `0x` + 130 hex digits.
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.to_bytes()))
    }

    /// Recovery parity for signatures carrying `v` in {0, 1, 27, 28}.
    pub fn y_parity(&self) -> bool {
        match self.v {
            0 | 1 => self.v == 1,
            v => (v.wrapping_sub(27)) & 1 == 1,
        }
    }

    /// Recovery parity of a legacy EIP-155 signature.
    ///
    /// The app only reports the low byte of `chain_id * 2 + 35 + parity`;
    /// the base is always odd, so the parity is the lowest bit of the
    /// difference.
    pub fn legacy_y_parity(&self, chain_id: u64) -> bool {
        let base = chain_id.wrapping_mul(2).wrapping_add(35) as u8;
        (self.v ^ base) & 1 == 1
    }
}

impl std::fmt::Display for SignatureComponents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A derived account managed by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    #[serde(serialize_with = "checksummed")]
    pub address: Address,
    pub derivation_path: String,
    pub public_key: String,
}

impl Account {
    pub fn checksum_address(&self) -> String {
        self.address.to_checksum(None)
    }
}

fn checksummed<S: Serializer>(address: &Address, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&address.to_checksum(None))
}

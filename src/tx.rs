//! Transaction payloads: the unsigned form sent to the device and the
//! signed form broadcast to the network.
//!
//! - legacy (EIP-155): `rlp([nonce, gasPrice, gas, to, value, data, chainId, 0, 0])`
//! - fee-market (EIP-1559): `0x02 || rlp([chainId, nonce, maxPriorityFee, maxFee, gas, to, value, data, []])`
//!
//! Access lists are always empty.

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use alloy_rlp::{Decodable, Encodable, Header, EMPTY_STRING_CODE};

use crate::error::LedgerError;
use crate::types::SignatureComponents;

pub const FEE_MARKET_TX_TYPE: u8 = 0x02;

/// Largest chain id whose EIP-155 `v` (`chainId * 2 + 36`) fits a `u64`.
pub const MAX_CHAIN_ID: u64 = (u64::MAX - 36) / 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxType {
    Legacy,
    FeeMarket,
}

impl TxType {
    pub fn id(self) -> u8 {
        match self {
            Self::Legacy => 0,
            Self::FeeMarket => FEE_MARKET_TX_TYPE,
        }
    }
}

/// Exactly one fee scheme per transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeScheme {
    Legacy {
        gas_price: U256,
    },
    FeeMarket {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTransaction {
    pub chain_id: u64,
    pub nonce: u64,
    pub gas_limit: u64,
    /// `None` deploys a contract.
    pub to: Option<Address>,
    pub value: U256,
    pub data: Bytes,
    pub fee: FeeScheme,
}

impl UnsignedTransaction {
    pub fn tx_type(&self) -> TxType {
        match self.fee {
            FeeScheme::Legacy { .. } => TxType::Legacy,
            FeeScheme::FeeMarket { .. } => TxType::FeeMarket,
        }
    }

    /// The payload the device signs.
    pub fn encode_unsigned(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.data.len());
        match self.fee {
            FeeScheme::Legacy { gas_price } => encode_list(&mut out, |buf| {
                self.encode_legacy_fields(gas_price, buf);
                self.chain_id.encode(buf);
                0u8.encode(buf);
                0u8.encode(buf);
            }),
            FeeScheme::FeeMarket {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                out.push(FEE_MARKET_TX_TYPE);
                encode_list(&mut out, |buf| {
                    self.encode_fee_market_fields(max_fee_per_gas, max_priority_fee_per_gas, buf);
                });
            }
        }
        out
    }

    pub fn signing_hash(&self) -> B256 {
        keccak256(self.encode_unsigned())
    }

    /// Attach a device signature, normalizing `v` to the recovery parity.
    pub fn into_signed(self, signature: &SignatureComponents) -> SignedTransaction {
        let y_parity = match self.fee {
            FeeScheme::Legacy { .. } => signature.legacy_y_parity(self.chain_id),
            FeeScheme::FeeMarket { .. } => signature.y_parity(),
        };
        SignedTransaction {
            tx: self,
            y_parity,
            r: signature.r,
            s: signature.s,
        }
    }

    fn encode_legacy_fields(&self, gas_price: U256, buf: &mut Vec<u8>) {
        self.nonce.encode(buf);
        gas_price.encode(buf);
        self.gas_limit.encode(buf);
        encode_to(&self.to, buf);
        self.value.encode(buf);
        self.data.encode(buf);
    }

    fn encode_fee_market_fields(
        &self,
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
        buf: &mut Vec<u8>,
    ) {
        self.chain_id.encode(buf);
        self.nonce.encode(buf);
        max_priority_fee_per_gas.encode(buf);
        max_fee_per_gas.encode(buf);
        self.gas_limit.encode(buf);
        encode_to(&self.to, buf);
        self.value.encode(buf);
        self.data.encode(buf);
        // empty access list
        Header {
            list: true,
            payload_length: 0,
        }
        .encode(buf);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub tx: UnsignedTransaction,
    pub y_parity: bool,
    pub r: B256,
    pub s: B256,
}

impl SignedTransaction {
    /// `chainId * 2 + 35 + parity` for legacy, the bare parity otherwise.
    pub fn v(&self) -> u64 {
        let parity = u64::from(self.y_parity);
        match self.tx.fee {
            FeeScheme::Legacy { .. } => self
                .tx
                .chain_id
                .saturating_mul(2)
                .saturating_add(35 + parity),
            FeeScheme::FeeMarket { .. } => parity,
        }
    }

    /// Raw bytes for `eth_sendRawTransaction`.
    pub fn encode(&self) -> Vec<u8> {
        let tx = &self.tx;
        let mut out = Vec::with_capacity(192 + tx.data.len());
        let v = self.v();
        let r = U256::from_be_slice(self.r.as_slice());
        let s = U256::from_be_slice(self.s.as_slice());

        match tx.fee {
            FeeScheme::Legacy { gas_price } => encode_list(&mut out, |buf| {
                tx.encode_legacy_fields(gas_price, buf);
                v.encode(buf);
                r.encode(buf);
                s.encode(buf);
            }),
            FeeScheme::FeeMarket {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                out.push(FEE_MARKET_TX_TYPE);
                encode_list(&mut out, |buf| {
                    tx.encode_fee_market_fields(max_fee_per_gas, max_priority_fee_per_gas, buf);
                    v.encode(buf);
                    r.encode(buf);
                    s.encode(buf);
                });
            }
        }
        out
    }

    pub fn hash(&self) -> B256 {
        keccak256(self.encode())
    }

    pub fn encode_hex(&self) -> String {
        format!("0x{}", hex::encode(self.encode()))
    }

    /// Parse a raw signed transaction (legacy or type 2).
    pub fn decode(raw: &[u8]) -> Result<Self, LedgerError> {
        match raw.first() {
            Some(&FEE_MARKET_TX_TYPE) => decode_fee_market(&raw[1..]),
            Some(b) if *b >= 0xC0 => decode_legacy(raw),
            _ => Err(LedgerError::InvalidParams(
                "unsupported transaction encoding".into(),
            )),
        }
    }
}

/// Encodes an RLP list using a closure to write elements.
fn encode_list<F>(out: &mut Vec<u8>, f: F)
where
    F: FnOnce(&mut Vec<u8>),
{
    let mut payload = Vec::new();
    f(&mut payload);
    Header {
        list: true,
        payload_length: payload.len(),
    }
    .encode(out);
    out.extend_from_slice(&payload);
}

fn encode_to(to: &Option<Address>, buf: &mut Vec<u8>) {
    match to {
        Some(address) => address.encode(buf),
        None => buf.push(EMPTY_STRING_CODE),
    }
}

fn rlp_err(e: alloy_rlp::Error) -> LedgerError {
    LedgerError::InvalidParams(format!("malformed transaction: {e}"))
}

fn list_payload<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], LedgerError> {
    let header = Header::decode(buf).map_err(rlp_err)?;
    if !header.list || buf.len() < header.payload_length {
        return Err(LedgerError::InvalidParams(
            "malformed transaction: expected a list".into(),
        ));
    }
    let data: &'a [u8] = *buf;
    let (payload, rest) = data.split_at(header.payload_length);
    *buf = rest;
    Ok(payload)
}

fn decode_to<'a>(buf: &mut &'a [u8]) -> Result<Option<Address>, LedgerError> {
    let data: &'a [u8] = *buf;
    if let Some((&EMPTY_STRING_CODE, rest)) = data.split_first() {
        *buf = rest;
        return Ok(None);
    }
    Address::decode(buf).map(Some).map_err(rlp_err)
}

fn decode_legacy(raw: &[u8]) -> Result<SignedTransaction, LedgerError> {
    let mut outer = raw;
    let mut buf = list_payload(&mut outer)?;

    let nonce = u64::decode(&mut buf).map_err(rlp_err)?;
    let gas_price = U256::decode(&mut buf).map_err(rlp_err)?;
    let gas_limit = u64::decode(&mut buf).map_err(rlp_err)?;
    let to = decode_to(&mut buf)?;
    let value = U256::decode(&mut buf).map_err(rlp_err)?;
    let data = Bytes::decode(&mut buf).map_err(rlp_err)?;
    let v = u64::decode(&mut buf).map_err(rlp_err)?;
    let r = U256::decode(&mut buf).map_err(rlp_err)?;
    let s = U256::decode(&mut buf).map_err(rlp_err)?;

    let (chain_id, y_parity) = match v {
        27 | 28 => (0, v == 28),
        v if v >= 35 => ((v - 35) / 2, (v - 35) % 2 == 1),
        v => {
            return Err(LedgerError::InvalidParams(format!(
                "malformed transaction: invalid v {v}"
            )))
        }
    };

    Ok(SignedTransaction {
        tx: UnsignedTransaction {
            chain_id,
            nonce,
            gas_limit,
            to,
            value,
            data,
            fee: FeeScheme::Legacy { gas_price },
        },
        y_parity,
        r: r.into(),
        s: s.into(),
    })
}

fn decode_fee_market(raw: &[u8]) -> Result<SignedTransaction, LedgerError> {
    let mut outer = raw;
    let mut buf = list_payload(&mut outer)?;

    let chain_id = u64::decode(&mut buf).map_err(rlp_err)?;
    let nonce = u64::decode(&mut buf).map_err(rlp_err)?;
    let max_priority_fee_per_gas = U256::decode(&mut buf).map_err(rlp_err)?;
    let max_fee_per_gas = U256::decode(&mut buf).map_err(rlp_err)?;
    let gas_limit = u64::decode(&mut buf).map_err(rlp_err)?;
    let to = decode_to(&mut buf)?;
    let value = U256::decode(&mut buf).map_err(rlp_err)?;
    let data = Bytes::decode(&mut buf).map_err(rlp_err)?;
    list_payload(&mut buf)?; // access list
    let v = u64::decode(&mut buf).map_err(rlp_err)?;
    let r = U256::decode(&mut buf).map_err(rlp_err)?;
    let s = U256::decode(&mut buf).map_err(rlp_err)?;

    if v > 1 {
        return Err(LedgerError::InvalidParams(format!(
            "malformed transaction: invalid y parity {v}"
        )));
    }

    Ok(SignedTransaction {
        tx: UnsignedTransaction {
            chain_id,
            nonce,
            gas_limit,
            to,
            value,
            data,
            fee: FeeScheme::FeeMarket {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            },
        },
        y_parity: v == 1,
        r: r.into(),
        s: s.into(),
    })
}

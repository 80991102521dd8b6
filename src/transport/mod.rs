//! Transport backends for talking to Ledger devices.
//!
//! - [`hid::HidTransport`] -- USB HID for real hardware (feature `hid`, default)
//! - [`ble::BleTransport`] -- Bluetooth LE for Nano X / Stax / Flex (feature `ble`)
//! - [`tcp::TcpTransport`] -- TCP for the Speculos simulator (feature `tcp`)

#[cfg(feature = "ble")]
pub mod ble;
#[cfg(feature = "hid")]
pub mod hid;
#[cfg(feature = "tcp")]
pub mod tcp;

use async_trait::async_trait;

use crate::apdu::{ApduAnswer, ApduCommand};
use crate::error::TransportError;
use crate::types::DiscoveredDevice;

/// Physical link to a Ledger device.
///
/// A transport enumerates devices, holds at most one open connection and
/// exchanges APDU frames over it. Callers serialize access; transports
/// only guard their own handles.
#[async_trait]
pub trait Transport: Send + Sync {
    /// List the Ledger devices currently reachable.
    async fn discover(&self) -> Result<Vec<DiscoveredDevice>, TransportError>;

    /// Open a connection to a device returned by [`discover`](Self::discover).
    async fn connect(&self, device: &DiscoveredDevice) -> Result<(), TransportError>;

    /// Send one APDU and wait for its answer.
    async fn send_frame(&self, command: &ApduCommand) -> Result<ApduAnswer, TransportError>;

    /// Close the current connection, if any.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Re-establish the connection after the device switched apps.
    ///
    /// The default does nothing - only transports whose device
    /// re-enumerates on an app switch (USB HID) need to override this.
    async fn reconnect(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportType {
    Usb,
    Ble,
    /// `(host, port)` for the Speculos simulator.
    Tcp(String, u16),
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Usb => write!(f, "usb"),
            Self::Ble => write!(f, "ble"),
            Self::Tcp(host, port) => write!(f, "tcp({host}:{port})"),
        }
    }
}

pub fn open(transport_type: &TransportType) -> Result<Box<dyn Transport>, TransportError> {
    match transport_type {
        #[cfg(feature = "hid")]
        TransportType::Usb => Ok(Box::new(hid::HidTransport::new())),
        #[cfg(feature = "ble")]
        TransportType::Ble => Ok(Box::new(ble::BleTransport::new())),
        #[cfg(feature = "tcp")]
        TransportType::Tcp(host, port) => Ok(Box::new(tcp::TcpTransport::new(host, *port))),
        #[allow(unreachable_patterns)]
        other => Err(TransportError::Comm(format!(
            "{other} transport not compiled in - enable the matching 'hid', 'ble' or 'tcp' feature"
        ))),
    }
}

/// Ledger HID/BLE framing shared by the packet-based transports.
///
/// Every packet starts with `[tag = 0x05][seq: u16 BE]`; the first packet
/// additionally carries the `[len: u16 BE]` of the whole APDU.
#[cfg(any(feature = "hid", feature = "ble"))]
pub(crate) mod framing {
    use crate::error::TransportError;

    pub const TAG_APDU: u8 = 0x05;

    /// Split a serialized APDU into packets of `packet_size` bytes
    /// (header included), zero-padding the last one when `pad` is set.
    pub fn encode(apdu: &[u8], packet_size: usize, pad: bool) -> Vec<Vec<u8>> {
        let mut payload = Vec::with_capacity(2 + apdu.len());
        payload.extend_from_slice(&(apdu.len() as u16).to_be_bytes());
        payload.extend_from_slice(apdu);

        let chunk_size = packet_size - 3;
        payload
            .chunks(chunk_size)
            .enumerate()
            .map(|(seq, chunk)| {
                let mut packet = Vec::with_capacity(packet_size);
                packet.push(TAG_APDU);
                packet.extend_from_slice(&(seq as u16).to_be_bytes());
                packet.extend_from_slice(chunk);
                if pad {
                    packet.resize(packet_size, 0);
                }
                packet
            })
            .collect()
    }

    /// Incremental reassembly of an answer spread over several packets.
    #[derive(Debug, Default)]
    pub struct Reassembler {
        expected_len: Option<usize>,
        seq: u16,
        data: Vec<u8>,
    }

    impl Reassembler {
        /// Feed one packet (without any transport-specific prefix). Returns
        /// the complete answer once every byte arrived.
        pub fn push(&mut self, packet: &[u8]) -> Result<Option<Vec<u8>>, TransportError> {
            if packet.len() < 3 {
                return Err(TransportError::Comm(format!(
                    "short packet: {} bytes",
                    packet.len()
                )));
            }
            if packet[0] != TAG_APDU {
                return Err(TransportError::Comm(format!(
                    "unexpected packet tag 0x{:02X}",
                    packet[0]
                )));
            }
            let seq = u16::from_be_bytes([packet[1], packet[2]]);
            if seq != self.seq {
                return Err(TransportError::Comm(format!(
                    "sequence mismatch: expected {}, got {seq}",
                    self.seq
                )));
            }

            let body = if seq == 0 {
                if packet.len() < 5 {
                    return Err(TransportError::Comm("first packet too short".into()));
                }
                self.expected_len = Some(u16::from_be_bytes([packet[3], packet[4]]) as usize);
                &packet[5..]
            } else {
                &packet[3..]
            };

            let expected = self.expected_len.unwrap_or_default();
            let take = (expected - self.data.len()).min(body.len());
            self.data.extend_from_slice(&body[..take]);
            self.seq = self.seq.wrapping_add(1);

            if self.data.len() >= expected {
                return Ok(Some(std::mem::take(&mut self.data)));
            }
            Ok(None)
        }
    }

}

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, ValueNotification,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::{FutureExt, Stream, StreamExt};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::apdu::{ApduAnswer, ApduCommand};
use crate::error::TransportError;
use crate::transport::framing::{self, Reassembler};
use crate::transport::Transport;
use crate::types::{DeviceModel, DiscoveredDevice};

/// GATT layout of one Ledger family: service, notify and write characteristics.
struct BleSpec {
    model: DeviceModel,
    service: Uuid,
    notify: Uuid,
    write: Uuid,
}

static BLE_SPECS: [BleSpec; 3] = [
    BleSpec {
        model: DeviceModel::NanoX,
        service: Uuid::from_u128(0x13d63400_2c97_0004_0000_4c6564676572),
        notify: Uuid::from_u128(0x13d63400_2c97_0004_0001_4c6564676572),
        write: Uuid::from_u128(0x13d63400_2c97_0004_0002_4c6564676572),
    },
    BleSpec {
        model: DeviceModel::Stax,
        service: Uuid::from_u128(0x13d63400_2c97_6004_0000_4c6564676572),
        notify: Uuid::from_u128(0x13d63400_2c97_6004_0001_4c6564676572),
        write: Uuid::from_u128(0x13d63400_2c97_6004_0002_4c6564676572),
    },
    BleSpec {
        model: DeviceModel::Flex,
        service: Uuid::from_u128(0x13d63400_2c97_3004_0000_4c6564676572),
        notify: Uuid::from_u128(0x13d63400_2c97_3004_0001_4c6564676572),
        write: Uuid::from_u128(0x13d63400_2c97_3004_0002_4c6564676572),
    },
];

const SCAN_POLL: Duration = Duration::from_millis(500);
const MTU_REQUEST: [u8; 5] = [0x08, 0x00, 0x00, 0x00, 0x00];
const DEFAULT_MTU: usize = 20;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

type Notifications = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

struct Link {
    peripheral: Peripheral,
    write: Characteristic,
    notifications: Notifications,
    mtu: usize,
}

/// Bluetooth LE transport (Nano X, Stax, Flex).
///
/// Scans on the first adapter until at least one Ledger advertises one of
/// the known services; the caller bounds the scan with its own timeout.
/// The transport awaits answers without a deadline of its own and drops
/// notifications left over from an earlier exchange before each write.
pub struct BleTransport {
    link: Mutex<Option<Link>>,
}

fn ble_err(e: btleplug::Error) -> TransportError {
    TransportError::Comm(e.to_string())
}

fn spec_for_services(services: &[Uuid]) -> Option<&'static BleSpec> {
    BLE_SPECS.iter().find(|s| services.contains(&s.service))
}

impl BleTransport {
    pub fn new() -> Self {
        Self {
            link: Mutex::new(None),
        }
    }

    async fn adapter() -> Result<Adapter, TransportError> {
        let manager = Manager::new().await.map_err(ble_err)?;
        manager
            .adapters()
            .await
            .map_err(ble_err)?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::Comm("no Bluetooth adapter available".into()))
    }

    async fn ledger_peripherals(
        adapter: &Adapter,
    ) -> Result<Vec<(Peripheral, &'static BleSpec)>, TransportError> {
        let mut found = Vec::new();
        for peripheral in adapter.peripherals().await.map_err(ble_err)? {
            let Some(props) = peripheral.properties().await.map_err(ble_err)? else {
                continue;
            };
            if let Some(spec) = spec_for_services(&props.services) {
                found.push((peripheral, spec));
            }
        }
        Ok(found)
    }

    async fn read_answer(link: &mut Link) -> Result<Vec<u8>, TransportError> {
        let mut reassembler = Reassembler::default();
        loop {
            let notification = link
                .notifications
                .next()
                .await
                .ok_or_else(|| TransportError::Comm("notification stream closed".into()))?;
            if let Some(answer) = reassembler.push(&notification.value)? {
                return Ok(answer);
            }
        }
    }

    /// Drop notifications already queued on the link.
    fn drain(link: &mut Link) -> usize {
        let mut discarded = 0;
        while let Some(Some(_)) = link.notifications.next().now_or_never() {
            discarded += 1;
        }
        discarded
    }

    async fn negotiate_mtu(link: &mut Link) -> Result<usize, TransportError> {
        link.peripheral
            .write(&link.write, &MTU_REQUEST, WriteType::WithResponse)
            .await
            .map_err(ble_err)?;
        let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, link.notifications.next())
            .await
            .map_err(|_| TransportError::Timeout(HANDSHAKE_TIMEOUT.as_millis() as u32))?
            .ok_or_else(|| TransportError::Comm("notification stream closed".into()))?;
        Ok(match reply.value.as_slice() {
            [0x08, _, _, _, _, mtu, ..] if *mtu as usize > 3 => *mtu as usize,
            _ => DEFAULT_MTU,
        })
    }
}

impl Default for BleTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn discover(&self) -> Result<Vec<DiscoveredDevice>, TransportError> {
        let adapter = Self::adapter().await?;
        let services = BLE_SPECS.iter().map(|s| s.service).collect();
        adapter
            .start_scan(ScanFilter { services })
            .await
            .map_err(ble_err)?;

        let found = loop {
            tokio::time::sleep(SCAN_POLL).await;
            let found = Self::ledger_peripherals(&adapter).await?;
            if !found.is_empty() {
                break found;
            }
        };
        let _ = adapter.stop_scan().await;

        Ok(found
            .into_iter()
            .map(|(peripheral, spec)| DiscoveredDevice {
                device_id: peripheral.address().to_string(),
                model: spec.model,
            })
            .collect())
    }

    async fn connect(&self, device: &DiscoveredDevice) -> Result<(), TransportError> {
        let adapter = Self::adapter().await?;
        let (peripheral, spec) = Self::ledger_peripherals(&adapter)
            .await?
            .into_iter()
            .find(|(p, _)| p.address().to_string() == device.device_id)
            .ok_or(TransportError::DeviceNotFound)?;

        peripheral.connect().await.map_err(ble_err)?;
        peripheral.discover_services().await.map_err(ble_err)?;

        let characteristics = peripheral.characteristics();
        let find = |uuid: Uuid| {
            characteristics
                .iter()
                .find(|c| c.uuid == uuid)
                .cloned()
                .ok_or_else(|| TransportError::ConnectionFailed(format!("missing characteristic {uuid}")))
        };
        let notify = find(spec.notify)?;
        let write = find(spec.write)?;

        peripheral.subscribe(&notify).await.map_err(ble_err)?;
        let notifications = peripheral.notifications().await.map_err(ble_err)?;

        let mut link = Link {
            peripheral,
            write,
            notifications,
            mtu: DEFAULT_MTU,
        };
        link.mtu = Self::negotiate_mtu(&mut link).await?;

        log::info!(
            "connected to Ledger {} over BLE (mtu {})",
            spec.model,
            link.mtu
        );
        *self.link.lock().await = Some(link);
        Ok(())
    }

    async fn send_frame(&self, command: &ApduCommand) -> Result<ApduAnswer, TransportError> {
        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or(TransportError::NotConnected)?;

        let stale = Self::drain(link);
        if stale > 0 {
            log::debug!("discarded {stale} stale BLE notification(s)");
        }
        for packet in framing::encode(&command.serialize(), link.mtu, false) {
            link.peripheral
                .write(&link.write, &packet, WriteType::WithResponse)
                .await
                .map_err(ble_err)?;
        }

        let answer = Self::read_answer(link).await?;
        Ok(ApduAnswer::from_raw(answer))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if let Some(link) = self.link.lock().await.take() {
            link.peripheral.disconnect().await.map_err(ble_err)?;
        }
        Ok(())
    }
}

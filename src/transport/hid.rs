use std::ffi::CString;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::apdu::{ApduAnswer, ApduCommand};
use crate::error::TransportError;
use crate::transport::framing::{self, Reassembler};
use crate::transport::Transport;
use crate::types::{DeviceModel, DiscoveredDevice};

const LEDGER_VID: u16 = 0x2c97;
const LEDGER_USAGE_PAGE: u16 = 0xFFA0;
const LEDGER_CHANNEL: u16 = 0x0101;
const LEDGER_PACKET_WRITE_SIZE: usize = 65;
const LEDGER_PACKET_READ_SIZE: usize = 64;
/// Reads wait this long before releasing the handle and polling again.
const READ_POLL_MS: i32 = 500;
/// Report id byte + 2-byte channel precede the framed packet on writes.
const FRAME_SIZE: usize = LEDGER_PACKET_WRITE_SIZE - 3;

const RECONNECT_ATTEMPTS: u32 = 20;
const RECONNECT_DELAY: Duration = Duration::from_millis(250);

struct OpenDevice {
    handle: hidapi::HidDevice,
    model: DeviceModel,
    /// Bumped on every open, so a reader never picks up a newer handle.
    generation: u64,
}

/// USB HID transport.
///
/// `hidapi` is blocking, so every call runs on the blocking thread pool.
/// An answer is awaited without a deadline of its own (the session bounds
/// its callers); the handle is released between read polls so a
/// disconnect can close it. Input left over from an earlier exchange is
/// drained before each write.
pub struct HidTransport {
    device: Arc<Mutex<Option<OpenDevice>>>,
    generation: AtomicU64,
}

impl HidTransport {
    pub fn new() -> Self {
        Self {
            device: Arc::new(Mutex::new(None)),
            generation: AtomicU64::new(0),
        }
    }

    fn enumerate() -> Result<Vec<(CString, DeviceModel)>, TransportError> {
        let api = hidapi::HidApi::new().map_err(|e| TransportError::Comm(e.to_string()))?;
        Ok(api
            .device_list()
            .filter(|info| info.vendor_id() == LEDGER_VID && info.usage_page() == LEDGER_USAGE_PAGE)
            .map(|info| {
                (
                    info.path().to_owned(),
                    DeviceModel::from_product_id(info.product_id()),
                )
            })
            .collect())
    }

    fn open_path(path: &CString) -> Result<hidapi::HidDevice, TransportError> {
        let api = hidapi::HidApi::new().map_err(|e| TransportError::Comm(e.to_string()))?;
        api.open_path(path)
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))
    }

    fn write_apdu(device: &hidapi::HidDevice, apdu: &[u8]) -> Result<(), TransportError> {
        for frame in framing::encode(apdu, FRAME_SIZE, true) {
            let mut buffer = Vec::with_capacity(LEDGER_PACKET_WRITE_SIZE);
            buffer.push(0x00);
            buffer.extend_from_slice(&LEDGER_CHANNEL.to_be_bytes());
            buffer.extend_from_slice(&frame);

            device
                .write(&buffer)
                .map_err(|e| TransportError::Comm(e.to_string()))?;
        }
        Ok(())
    }

    /// Discard packets nobody is waiting for.
    fn drain(device: &hidapi::HidDevice) -> Result<usize, TransportError> {
        let mut buffer = vec![0u8; LEDGER_PACKET_READ_SIZE];
        let mut discarded = 0;
        while device
            .read_timeout(&mut buffer, 0)
            .map_err(|e| TransportError::Comm(e.to_string()))?
            > 0
        {
            discarded += 1;
        }
        Ok(discarded)
    }

    /// One poll for an answer packet. `Ok(None)` until the answer is complete.
    fn read_packet(
        device: &hidapi::HidDevice,
        reassembler: &mut Reassembler,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        let mut buffer = vec![0u8; LEDGER_PACKET_READ_SIZE];
        let n = device
            .read_timeout(&mut buffer, READ_POLL_MS)
            .map_err(|e| TransportError::Comm(e.to_string()))?;

        if n == 0 {
            return Ok(None);
        }
        if n < 2 {
            return Err(TransportError::Comm(format!("HID short read: {n} bytes")));
        }

        let channel = u16::from_be_bytes([buffer[0], buffer[1]]);
        if channel != LEDGER_CHANNEL {
            return Err(TransportError::Comm("HID channel mismatch".into()));
        }

        reassembler.push(&buffer[2..n])
    }

    /// Write `apdu`, then poll until its answer is complete. Fails with
    /// `NotConnected` once the handle was closed or replaced.
    fn exchange(slot: &Mutex<Option<OpenDevice>>, apdu: &[u8]) -> Result<Vec<u8>, TransportError> {
        let generation = {
            let guard = Self::lock(slot)?;
            let device = guard.as_ref().ok_or(TransportError::NotConnected)?;
            let stale = Self::drain(&device.handle)?;
            if stale > 0 {
                log::debug!("discarded {stale} stale HID packet(s)");
            }
            Self::write_apdu(&device.handle, apdu)?;
            device.generation
        };

        let mut reassembler = Reassembler::default();
        loop {
            let guard = Self::lock(slot)?;
            let device = guard
                .as_ref()
                .filter(|d| d.generation == generation)
                .ok_or(TransportError::NotConnected)?;
            if let Some(answer) = Self::read_packet(&device.handle, &mut reassembler)? {
                return Ok(answer);
            }
        }
    }

    async fn blocking<T, F>(f: F) -> Result<T, TransportError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, TransportError> + Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| TransportError::Comm(format!("HID worker failed: {e}")))?
    }

    fn lock(
        device: &Mutex<Option<OpenDevice>>,
    ) -> Result<std::sync::MutexGuard<'_, Option<OpenDevice>>, TransportError> {
        device
            .lock()
            .map_err(|e| TransportError::Comm(format!("mutex poisoned: {e}")))
    }
}

impl Default for HidTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for HidTransport {
    async fn discover(&self) -> Result<Vec<DiscoveredDevice>, TransportError> {
        let found = Self::blocking(Self::enumerate).await?;
        Ok(found
            .into_iter()
            .map(|(path, model)| DiscoveredDevice {
                device_id: path.to_string_lossy().into_owned(),
                model,
            })
            .collect())
    }

    async fn connect(&self, device: &DiscoveredDevice) -> Result<(), TransportError> {
        let path = CString::new(device.device_id.clone())
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let model = device.model;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let slot = Arc::clone(&self.device);

        Self::blocking(move || {
            let handle = Self::open_path(&path)?;
            *Self::lock(&slot)? = Some(OpenDevice {
                handle,
                model,
                generation,
            });
            Ok(())
        })
        .await?;

        log::info!("connected to Ledger {model} over USB");
        Ok(())
    }

    async fn send_frame(&self, command: &ApduCommand) -> Result<ApduAnswer, TransportError> {
        let serialized = command.serialize();
        let slot = Arc::clone(&self.device);

        Self::blocking(move || {
            let response = Self::exchange(&slot, &serialized)?;
            Ok(ApduAnswer::from_raw(response))
        })
        .await
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let slot = Arc::clone(&self.device);
        Self::blocking(move || {
            Self::lock(&slot)?.take();
            Ok(())
        })
        .await
    }

    /// The device drops off the bus while switching apps and comes back
    /// under a new path; poll until a device of the same model shows up.
    async fn reconnect(&self) -> Result<(), TransportError> {
        let model = {
            let slot = Arc::clone(&self.device);
            let model = Self::blocking(move || {
                let mut guard = Self::lock(&slot)?;
                Ok(guard.take().map(|d| d.model))
            })
            .await?;
            model.ok_or(TransportError::NotConnected)?
        };

        for attempt in 1..=RECONNECT_ATTEMPTS {
            tokio::time::sleep(RECONNECT_DELAY).await;

            let devices = self.discover().await?;
            let candidate = devices
                .iter()
                .find(|d| d.model == model)
                .or_else(|| devices.first());

            if let Some(device) = candidate {
                match self.connect(device).await {
                    Ok(()) => return Ok(()),
                    Err(e) => log::debug!("reconnect attempt {attempt} failed: {e}"),
                }
            }
        }

        Err(TransportError::DeviceNotFound)
    }
}

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::apdu::{ApduAnswer, ApduCommand};
use crate::error::TransportError;
use crate::transport::Transport;
use crate::types::{DeviceModel, DiscoveredDevice};

const MAX_RESPONSE_LEN: usize = 65536;

/// TCP transport for the Speculos simulator (default `127.0.0.1:9999`).
///
/// Wire: `[u32 BE length][APDU]` send, `[u32 BE length][response]` recv.
///
/// Speculos has a quirk: the status word (`SW1 SW2`) is sent as a bare
/// 2-byte suffix *outside* the length-prefixed frame, so we read both
/// and stitch them into a standard APDU response.
pub struct TcpTransport {
    addr: String,
    stream: Mutex<Option<TcpStream>>,
}

impl TcpTransport {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            addr: format!("{host}:{port}"),
            stream: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    /// Speculos serves a single device; it is "discovered" when the port
    /// accepts connections.
    async fn discover(&self) -> Result<Vec<DiscoveredDevice>, TransportError> {
        match TcpStream::connect(&self.addr).await {
            Ok(_) => Ok(vec![DiscoveredDevice {
                device_id: self.addr.clone(),
                model: DeviceModel::Speculos,
            }]),
            Err(e) => {
                log::debug!("no simulator at {}: {e}", self.addr);
                Ok(Vec::new())
            }
        }
    }

    async fn connect(&self, device: &DiscoveredDevice) -> Result<(), TransportError> {
        let stream = TcpStream::connect(&device.device_id)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {e}", device.device_id)))?;
        *self.stream.lock().await = Some(stream);
        log::info!("connected to Speculos at {}", device.device_id);
        Ok(())
    }

    /// A failed exchange leaves the stream mid-frame, so it is closed and
    /// later frames fail with `NotConnected`.
    async fn send_frame(&self, command: &ApduCommand) -> Result<ApduAnswer, TransportError> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or(TransportError::NotConnected)?;

        let result = exchange(stream, &command.serialize()).await;
        if let Err(e) = &result {
            log::debug!("closing simulator link after failed exchange: {e}");
            guard.take();
        }
        result
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.lock().await.take() {
            stream.shutdown().await?;
        }
        Ok(())
    }
}

async fn exchange(stream: &mut TcpStream, apdu: &[u8]) -> Result<ApduAnswer, TransportError> {
    let len = apdu.len() as u32;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(apdu).await?;
    stream.flush().await?;

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let resp_len = u32::from_be_bytes(len_buf) as usize;
    if resp_len > MAX_RESPONSE_LEN {
        return Err(TransportError::Comm(format!(
            "response too large: {resp_len} bytes (max {MAX_RESPONSE_LEN})"
        )));
    }

    let mut resp = vec![0u8; resp_len + 2];
    stream.read_exact(&mut resp[..resp_len]).await?;

    // SW is sent bare after the framed data -- Speculos quirk
    stream.read_exact(&mut resp[resp_len..resp_len + 2]).await?;

    Ok(ApduAnswer::from_raw(resp))
}

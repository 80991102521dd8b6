//! Request/response plumbing on top of a [`Transport`].
//!
//! Payloads larger than one APDU are streamed as a sequence of chunks:
//! the first with P1 = `0x00`, every following one with P1 = `0x80`.
//! Only the answer to the last chunk carries the result.

pub mod chunks;

use crate::apdu::{ApduCommand, Instruction};
use crate::error::{DeviceFailure, StatusWord};
use crate::transport::Transport;

pub const P1_FIRST_CHUNK: u8 = 0x00;
pub const P1_MORE_CHUNKS: u8 = 0x80;

/// Send one APDU and return its payload, or the failure the status word
/// describes.
pub async fn exchange(
    transport: &dyn Transport,
    command: &ApduCommand,
) -> Result<Vec<u8>, DeviceFailure> {
    log::debug!(
        "=> {:02x}{:02x}{:02x}{:02x} ({} bytes)",
        command.cla,
        command.ins,
        command.p1,
        command.p2,
        command.data.len()
    );
    let answer = transport.send_frame(command).await?;
    let code = answer.retcode();
    log::debug!("<= 0x{code:04X} ({} bytes)", answer.data().len());

    if !StatusWord::is_success(code) {
        return Err(DeviceFailure::from_status(code));
    }
    Ok(answer.data().to_vec())
}

/// Stream `payload` in chunks and return the payload of the final answer.
///
/// Any non-success status word aborts the sequence.
pub async fn send_chunked(
    transport: &dyn Transport,
    ins: Instruction,
    p2: u8,
    payload: &[u8],
    keep_together: usize,
) -> Result<Vec<u8>, DeviceFailure> {
    let mut result = Vec::new();
    for (i, chunk) in chunks::split(payload, keep_together).into_iter().enumerate() {
        let p1 = if i == 0 { P1_FIRST_CHUNK } else { P1_MORE_CHUNKS };
        let cmd = ApduCommand::with_data(ins, chunk.to_vec()).p1(p1).p2(p2);
        result = exchange(transport, &cmd).await?;
    }
    Ok(result)
}

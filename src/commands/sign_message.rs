use crate::apdu::Instruction;
use crate::commands::malformed;
use crate::error::DeviceFailure;
use crate::protocol;
use crate::transport::Transport;
use crate::types::{Bip32Path, SignatureComponents};

/// EIP-191 personal message. The device prepends the
/// `"\x19Ethereum Signed Message:\n" + len` prefix itself.
pub async fn exec(
    transport: &dyn Transport,
    path: &Bip32Path,
    message: &[u8],
) -> Result<SignatureComponents, DeviceFailure> {
    let payload = encode_payload(path, message);
    let result =
        protocol::send_chunked(transport, Instruction::SignPersonalMessage, 0x00, &payload, 0)
            .await?;
    SignatureComponents::from_device(&result).map_err(malformed)
}

/// `[path][message_len: u32 BE][message]`
pub(crate) fn encode_payload(path: &Bip32Path, message: &[u8]) -> Vec<u8> {
    let mut payload = path.serialize();
    payload.extend_from_slice(&(message.len() as u32).to_be_bytes());
    payload.extend_from_slice(message);
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_layout() {
        let payload = encode_payload(&Bip32Path::ethereum(0), b"hello");
        assert_eq!(payload.len(), 21 + 4 + 5);
        assert_eq!(&payload[21..25], &[0, 0, 0, 5]);
        assert_eq!(&payload[25..], b"hello");
    }

    #[test]
    fn empty_message() {
        let payload = encode_payload(&Bip32Path::ethereum(0), b"");
        assert_eq!(&payload[21..], &[0, 0, 0, 0]);
    }
}

use alloy_rlp::Header;

use crate::apdu::Instruction;
use crate::commands::malformed;
use crate::error::DeviceFailure;
use crate::protocol;
use crate::transport::Transport;
use crate::types::{Bip32Path, SignatureComponents};

/// First chunk: `[path][rlp...]`, continuation chunks carry the rest of the
/// RLP. Returns `[v][r][s]`.
pub async fn exec(
    transport: &dyn Transport,
    path: &Bip32Path,
    unsigned_rlp: &[u8],
) -> Result<SignatureComponents, DeviceFailure> {
    let mut payload = path.serialize();
    payload.extend_from_slice(unsigned_rlp);

    let keep = legacy_tail_len(unsigned_rlp);
    let result =
        protocol::send_chunked(transport, Instruction::SignTransaction, 0x00, &payload, keep)
            .await?;
    SignatureComponents::from_device(&result).map_err(malformed)
}

/// Byte length of the `[chainId, 0, 0]` tail of a legacy EIP-155 payload.
///
/// The app decides how to parse `v` from the chunk boundary, so the tail must
/// arrive in one piece. Typed payloads (first byte below `0xC0`) have no such
/// tail.
pub(crate) fn legacy_tail_len(rlp: &[u8]) -> usize {
    if rlp.first().map_or(true, |b| *b < 0xC0) {
        return 0;
    }

    let mut buf = rlp;
    let Ok(list) = Header::decode(&mut buf) else {
        return 0;
    };
    if !list.list || buf.len() < list.payload_length {
        return 0;
    }

    let mut items = &buf[..list.payload_length];
    let mut offsets = Vec::new();
    while !items.is_empty() {
        offsets.push(rlp.len() - items.len());
        let Ok(item) = Header::decode(&mut items) else {
            return 0;
        };
        if items.len() < item.payload_length {
            return 0;
        }
        items = &items[item.payload_length..];
    }

    match offsets.len().checked_sub(3) {
        Some(i) => rlp.len() - offsets[i],
        None => 0,
    }
}

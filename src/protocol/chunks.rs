use crate::apdu::MAX_APDU_DATA;

/// Split `payload` into APDU-sized chunks.
///
/// The last `keep_together` bytes are never split across two chunks: if a
/// chunk boundary would fall inside them, the chunk is cut short so they
/// start the next one. The Ethereum app needs this for the EIP-155
/// `[chainId, 0, 0]` tail of legacy transactions.
pub fn split(payload: &[u8], keep_together: usize) -> Vec<&[u8]> {
    if payload.is_empty() {
        return vec![payload];
    }

    let tail_start = payload.len().saturating_sub(keep_together);
    let mut chunks = Vec::new();
    let mut offset = 0;

    while offset < payload.len() {
        let mut end = (offset + MAX_APDU_DATA).min(payload.len());
        if end < payload.len() && end > tail_start && tail_start > offset {
            end = tail_start;
        }
        chunks.push(&payload[offset..end]);
        offset = end;
    }

    chunks
}

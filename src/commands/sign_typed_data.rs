use alloy_primitives::B256;

use crate::apdu::{ApduCommand, Instruction};
use crate::commands::malformed;
use crate::error::DeviceFailure;
use crate::protocol;
use crate::transport::Transport;
use crate::types::{Bip32Path, SignatureComponents};

/// EIP-712 in "hashed" mode: the device only sees the two 32-byte hashes.
const P2_HASHED: u8 = 0x00;

/// Data: `[path][domain_separator (32)][struct_hash (32)]`
pub async fn exec(
    transport: &dyn Transport,
    path: &Bip32Path,
    domain_separator: &B256,
    struct_hash: &B256,
) -> Result<SignatureComponents, DeviceFailure> {
    let mut data = path.serialize();
    data.extend_from_slice(domain_separator.as_slice());
    data.extend_from_slice(struct_hash.as_slice());

    let cmd = ApduCommand::with_data(Instruction::SignEip712Hashed, data).p2(P2_HASHED);
    let result = protocol::exchange(transport, &cmd).await?;
    SignatureComponents::from_device(&result).map_err(malformed)
}

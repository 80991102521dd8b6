use alloy_primitives::Address;

use crate::apdu::{ApduCommand, Instruction};
use crate::commands::malformed;
use crate::error::{DeviceFailure, LedgerError};
use crate::protocol;
use crate::transport::Transport;
use crate::types::{AddressInfo, Bip32Path};

const P1_NO_DISPLAY: u8 = 0x00;
const P1_CONFIRM: u8 = 0x01;
const P2_NO_CHAINCODE: u8 = 0x00;

/// With `confirm` set the device shows the address and waits for approval.
pub async fn exec(
    transport: &dyn Transport,
    path: &Bip32Path,
    confirm: bool,
) -> Result<AddressInfo, DeviceFailure> {
    let p1 = if confirm { P1_CONFIRM } else { P1_NO_DISPLAY };
    let cmd = ApduCommand::with_data(Instruction::GetAddress, path.serialize())
        .p1(p1)
        .p2(P2_NO_CHAINCODE);
    let result = protocol::exchange(transport, &cmd).await?;
    parse_address_response(&result).map_err(malformed)
}

/// Response: `[pk_len][pubkey (65)][addr_len][address (40 ASCII hex)]`
pub(crate) fn parse_address_response(data: &[u8]) -> Result<AddressInfo, LedgerError> {
    if data.is_empty() {
        return Err(LedgerError::InvalidResponse("empty address response".into()));
    }

    let pk_len = data[0] as usize;
    if pk_len != 65 || data.len() < 1 + pk_len + 1 {
        return Err(LedgerError::InvalidResponse(format!(
            "unexpected public key length: {pk_len}"
        )));
    }
    let public_key = data[1..1 + pk_len].to_vec();

    let addr_len = data[1 + pk_len] as usize;
    let addr_start = 2 + pk_len;
    if addr_len != 40 || data.len() < addr_start + addr_len {
        return Err(LedgerError::InvalidResponse(format!(
            "unexpected address length: {addr_len}"
        )));
    }

    let ascii = std::str::from_utf8(&data[addr_start..addr_start + addr_len])
        .map_err(|_| LedgerError::InvalidResponse("address is not ASCII".into()))?;
    let address: Address = ascii
        .parse()
        .map_err(|e| LedgerError::InvalidResponse(format!("bad address {ascii:?}: {e}")))?;

    Ok(AddressInfo {
        address,
        public_key,
    })
}

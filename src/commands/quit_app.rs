use crate::apdu::{ApduCommand, Instruction};
use crate::protocol;
use crate::transport::Transport;

/// The app exits before it can send a proper response, so we
/// ignore transport/protocol errors here.
pub async fn exec(transport: &dyn Transport) {
    let cmd = ApduCommand::new(Instruction::QuitApp);
    if let Err(e) = protocol::exchange(transport, &cmd).await {
        log::debug!("quit app: {e}");
    }
}

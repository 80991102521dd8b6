use crate::apdu::{ApduCommand, Instruction};
use crate::commands::{app_info, quit_app};
use crate::error::DeviceFailure;
use crate::protocol;
use crate::transport::Transport;

/// Ask the dashboard to launch `name`. The user confirms on the device.
pub async fn exec(transport: &dyn Transport, name: &str) -> Result<(), DeviceFailure> {
    let cmd = ApduCommand::with_data(Instruction::OpenApp, name.as_bytes().to_vec());
    protocol::exchange(transport, &cmd).await?;
    Ok(())
}

/// Make sure `name` is the running app.
///
/// Leaves a running `name` alone, quits any other app first, and
/// re-attaches the transport after each switch (the device re-enumerates).
/// Returns whether an app switch happened.
pub async fn ensure(transport: &dyn Transport, name: &str) -> Result<bool, DeviceFailure> {
    let current = app_info::exec(transport).await?;
    if current.name == name {
        log::debug!("{current} already running");
        return Ok(false);
    }

    if !current.is_dashboard() {
        log::debug!("quitting {current}");
        quit_app::exec(transport).await;
        transport.reconnect().await?;
    }

    exec(transport, name).await?;
    transport.reconnect().await?;
    log::info!("opened {name} app");
    Ok(true)
}

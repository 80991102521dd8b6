use crate::apdu::{ApduCommand, Instruction};
use crate::commands::malformed;
use crate::error::{DeviceFailure, LedgerError};
use crate::protocol;
use crate::transport::Transport;

/// Name the OS reports while no application is running.
pub const DASHBOARD_NAME: &str = "BOLOS";

/// The application currently running on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInfo {
    pub name: String,
    pub version: String,
    pub flags: Vec<u8>,
}

impl AppInfo {
    pub fn is_dashboard(&self) -> bool {
        self.name == DASHBOARD_NAME
    }
}

impl std::fmt::Display for AppInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} v{}", self.name, self.version)
    }
}

/// Ethereum app configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppConfiguration {
    pub flags: u8,
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl AppConfiguration {
    /// Blind signing of contract data enabled in the app settings.
    pub fn arbitrary_data_enabled(&self) -> bool {
        self.flags & 0x01 != 0
    }
}

impl std::fmt::Display for AppConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Ethereum v{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Dashboard query, answered by the OS whatever app is running.
pub async fn exec(transport: &dyn Transport) -> Result<AppInfo, DeviceFailure> {
    let cmd = ApduCommand::new(Instruction::GetAppAndVersion);
    let result = protocol::exchange(transport, &cmd).await?;
    parse_app_info(&result).map_err(malformed)
}

/// Only answered by the Ethereum app.
pub async fn configuration(transport: &dyn Transport) -> Result<AppConfiguration, DeviceFailure> {
    let cmd = ApduCommand::new(Instruction::GetAppConfiguration);
    let result = protocol::exchange(transport, &cmd).await?;
    parse_configuration(&result).map_err(malformed)
}

/// Response: `[format][name_len][name][version_len][version][flags_len][flags]`
pub(crate) fn parse_app_info(data: &[u8]) -> Result<AppInfo, LedgerError> {
    let mut rest = data
        .get(1..)
        .ok_or_else(|| LedgerError::InvalidResponse("empty app info response".into()))?;

    let name = String::from_utf8_lossy(take_field(&mut rest, "name")?).into_owned();
    let version = String::from_utf8_lossy(take_field(&mut rest, "version")?).into_owned();
    // Older firmware stops after the version.
    let flags = take_field(&mut rest, "flags")
        .map(<[u8]>::to_vec)
        .unwrap_or_default();

    Ok(AppInfo {
        name,
        version,
        flags,
    })
}

/// Pop one `[len][bytes]` field off the front of `rest`.
fn take_field<'a>(rest: &mut &'a [u8], what: &str) -> Result<&'a [u8], LedgerError> {
    let data: &'a [u8] = *rest;
    let (&len, tail) = data
        .split_first()
        .ok_or_else(|| LedgerError::InvalidResponse(format!("app info truncated before {what}")))?;
    let len = len as usize;
    if tail.len() < len {
        return Err(LedgerError::InvalidResponse(format!(
            "app info {what} truncated: {len} bytes announced, {} available",
            tail.len()
        )));
    }
    let (value, tail) = tail.split_at(len);
    *rest = tail;
    Ok(value)
}

/// Response: `[flags][major][minor][patch]`
pub(crate) fn parse_configuration(data: &[u8]) -> Result<AppConfiguration, LedgerError> {
    if data.len() < 4 {
        return Err(LedgerError::InvalidResponse(
            "configuration response too short - is the Ethereum app running?".into(),
        ));
    }
    Ok(AppConfiguration {
        flags: data[0],
        major: data[1],
        minor: data[2],
        patch: data[3],
    })
}

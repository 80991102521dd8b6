//! APDU command and response types.
//!
//! The Ethereum app answers on CLA `0xE0`. Dashboard-level commands
//! (app info, quit) use CLA `0xB0`; open-app goes to the dashboard on `0xE0`.

pub const CLA_ETH: u8 = 0xE0;
pub const CLA_BOLOS: u8 = 0xB0;

/// Short APDU payload limit.
pub const MAX_APDU_DATA: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduCommand {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
}

impl ApduCommand {
    pub fn new(ins: Instruction) -> Self {
        Self {
            cla: ins.cla(),
            ins: ins.code(),
            p1: 0x00,
            p2: 0x00,
            data: Vec::new(),
        }
    }

    pub fn with_data(ins: Instruction, data: Vec<u8>) -> Self {
        Self {
            data,
            ..Self::new(ins)
        }
    }

    #[must_use]
    pub fn p1(mut self, p1: u8) -> Self {
        self.p1 = p1;
        self
    }

    #[must_use]
    pub fn p2(mut self, p2: u8) -> Self {
        self.p2 = p2;
        self
    }

    /// Wire format: `[CLA][INS][P1][P2][LC][DATA]`
    ///
    /// # Panics
    ///
    /// Panics if `data` exceeds 255 bytes (short APDU LC limit).
    pub fn serialize(&self) -> Vec<u8> {
        assert!(
            self.data.len() <= MAX_APDU_DATA,
            "APDU data too long: {} bytes (max 255)",
            self.data.len()
        );
        let mut buf = Vec::with_capacity(5 + self.data.len());
        buf.push(self.cla);
        buf.push(self.ins);
        buf.push(self.p1);
        buf.push(self.p2);
        buf.push(self.data.len() as u8);
        buf.extend_from_slice(&self.data);
        buf
    }
}

/// APDU response - last 2 bytes are the status word, everything before
/// that is the payload. Use [`data()`](ApduAnswer::data) to strip the SW.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduAnswer {
    raw: Vec<u8>,
}

impl ApduAnswer {
    pub fn from_raw(raw: Vec<u8>) -> Self {
        Self { raw }
    }

    pub fn retcode(&self) -> u16 {
        if self.raw.len() < 2 {
            return 0;
        }
        let len = self.raw.len();
        ((self.raw[len - 2] as u16) << 8) | (self.raw[len - 1] as u16)
    }

    /// Payload only - strips the trailing 2-byte status word.
    pub fn data(&self) -> &[u8] {
        if self.raw.len() < 2 {
            return &[];
        }
        &self.raw[..self.raw.len() - 2]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    // Ethereum app
    GetAddress,
    SignTransaction,
    GetAppConfiguration,
    SignPersonalMessage,
    SignEip712Hashed,
    // dashboard
    OpenApp,
    GetAppAndVersion,
    QuitApp,
}

impl Instruction {
    pub fn code(self) -> u8 {
        match self {
            Self::GetAddress => 0x02,
            Self::SignTransaction => 0x04,
            Self::GetAppConfiguration => 0x06,
            Self::SignPersonalMessage => 0x08,
            Self::SignEip712Hashed => 0x0C,
            Self::OpenApp => 0xD8,
            Self::GetAppAndVersion => 0x01,
            Self::QuitApp => 0xA7,
        }
    }

    pub fn cla(self) -> u8 {
        match self {
            Self::GetAppAndVersion | Self::QuitApp => CLA_BOLOS,
            _ => CLA_ETH,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -- ApduCommand --

    #[test]
    fn serialize_empty_data() {
        let cmd = ApduCommand::new(Instruction::GetAppConfiguration);
        let buf = cmd.serialize();
        assert_eq!(buf, vec![0xE0, 0x06, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn serialize_with_data_and_params() {
        let cmd = ApduCommand::with_data(Instruction::GetAddress, vec![0xAA, 0xBB]).p1(0x01);
        let buf = cmd.serialize();
        assert_eq!(buf, vec![0xE0, 0x02, 0x01, 0x00, 0x02, 0xAA, 0xBB]);
    }

    #[test]
    fn dashboard_commands_use_bolos_class() {
        let cmd = ApduCommand::new(Instruction::GetAppAndVersion);
        assert_eq!(cmd.serialize(), vec![0xB0, 0x01, 0x00, 0x00, 0x00]);
        let cmd = ApduCommand::new(Instruction::QuitApp);
        assert_eq!(cmd.serialize()[..2], [0xB0, 0xA7]);
        let cmd = ApduCommand::new(Instruction::OpenApp);
        assert_eq!(cmd.serialize()[..2], [0xE0, 0xD8]);
    }

    #[test]
    fn serialize_max_255_bytes() {
        let cmd = ApduCommand::with_data(Instruction::SignTransaction, vec![0xFF; 255]);
        let buf = cmd.serialize();
        assert_eq!(buf.len(), 5 + 255);
        assert_eq!(buf[4], 255); // LC byte
    }

    #[test]
    #[should_panic(expected = "APDU data too long")]
    fn serialize_panics_at_256_bytes() {
        let cmd = ApduCommand::with_data(Instruction::SignTransaction, vec![0x00; 256]);
        cmd.serialize();
    }

    // -- ApduAnswer --

    #[test]
    fn retcode_empty_response() {
        let ans = ApduAnswer::from_raw(vec![]);
        assert_eq!(ans.retcode(), 0);
    }

    #[test]
    fn retcode_with_payload() {
        let ans = ApduAnswer::from_raw(vec![0x01, 0x02, 0x03, 0x69, 0x85]);
        assert_eq!(ans.retcode(), 0x6985);
    }

    #[test]
    fn data_single_byte() {
        let ans = ApduAnswer::from_raw(vec![0x90]);
        assert!(ans.data().is_empty());
    }

    #[test]
    fn data_strips_status_word() {
        let ans = ApduAnswer::from_raw(vec![0xAA, 0xBB, 0xCC, 0x90, 0x00]);
        assert_eq!(ans.data(), &[0xAA, 0xBB, 0xCC]);
    }
}

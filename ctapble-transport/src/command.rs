//! CTAPHID/CTAPBLE command opcodes and the translation table between them.

/// CTAPHID command opcodes, carried in the high bit of the init frame's
/// command byte (the high bit itself just marks "this is an init frame,
/// not a continuation" and is masked off before matching here).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HidCommand {
    Ping = 0x01,
    Msg = 0x03,
    Lock = 0x04,
    Init = 0x06,
    Wink = 0x08,
    Cbor = 0x10,
    Cancel = 0x11,
    KeepAlive = 0x3B,
    Error = 0x3F,
}

impl HidCommand {
    pub fn name(self) -> &'static str {
        match self {
            Self::Ping => "PING",
            Self::Msg => "MSG",
            Self::Lock => "LOCK",
            Self::Init => "INIT",
            Self::Wink => "WINK",
            Self::Cbor => "CBOR",
            Self::Cancel => "CANCEL",
            Self::KeepAlive => "KEEPALIVE",
            Self::Error => "ERROR",
        }
    }
}

impl TryFrom<u8> for HidCommand {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0x01 => Ok(Self::Ping),
            0x03 => Ok(Self::Msg),
            0x04 => Ok(Self::Lock),
            0x06 => Ok(Self::Init),
            0x08 => Ok(Self::Wink),
            0x10 => Ok(Self::Cbor),
            0x11 => Ok(Self::Cancel),
            0x3B => Ok(Self::KeepAlive),
            0x3F => Ok(Self::Error),
            other => Err(other),
        }
    }
}

/// CTAPHID capability flags advertised in the INIT reply. Wink is never
/// set here: BLE authenticators have no physical "wink" indicator to
/// forward, so this bridge only ever advertises CBOR + NMSG support,
/// matching every BLE FIDO2 authenticator's actual capability set.
pub mod capability {
    pub const WINK: u8 = 0x01;
    pub const CBOR: u8 = 0x04;
    pub const NMSG: u8 = 0x08;
}

/// CTAPBLE command opcodes. Unlike [`HidCommand`], the high bit is part
/// of the opcode value itself (every init-frame command byte here is
/// `0x80 | opcode`), so these values already include it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BleCommand {
    Ping = 0x81,
    KeepAlive = 0x82,
    Msg = 0x83,
    Cancel = 0xBE,
    Error = 0xBF,
}

impl BleCommand {
    pub fn name(self) -> &'static str {
        match self {
            Self::Ping => "PING",
            Self::KeepAlive => "KEEPALIVE",
            Self::Msg => "MSG",
            Self::Cancel => "CANCEL",
            Self::Error => "ERROR",
        }
    }
}

impl TryFrom<u8> for BleCommand {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0x81 => Ok(Self::Ping),
            0x82 => Ok(Self::KeepAlive),
            0x83 => Ok(Self::Msg),
            0xBE => Ok(Self::Cancel),
            0xBF => Ok(Self::Error),
            other => Err(other),
        }
    }
}

/// Translate a fully-reassembled HID request into its BLE-bound command,
/// per the §4.2 translation table. `None` means the command is handled
/// locally by the HID endpoint and never forwarded to the authenticator
/// (INIT, WINK, MSG/U2F, LOCK).
pub fn translate_hid_to_ble(cmd: HidCommand) -> Option<BleCommand> {
    match cmd {
        HidCommand::Cbor => Some(BleCommand::Msg),
        HidCommand::Cancel => Some(BleCommand::Cancel),
        HidCommand::Error => Some(BleCommand::Error),
        HidCommand::Ping => Some(BleCommand::Ping),
        HidCommand::Init | HidCommand::Wink | HidCommand::Msg | HidCommand::Lock => None,
    }
}

/// Translate a fully-reassembled BLE notification into its HID-bound
/// command, per the §4.2 translation table. Every BLE command has a HID
/// counterpart; there is no "handled locally, not forwarded" case on
/// this direction.
pub fn translate_ble_to_hid(cmd: BleCommand) -> HidCommand {
    match cmd {
        BleCommand::Msg => HidCommand::Cbor,
        BleCommand::KeepAlive => HidCommand::KeepAlive,
        BleCommand::Error => HidCommand::Error,
        BleCommand::Ping => HidCommand::Ping,
        BleCommand::Cancel => HidCommand::Cancel,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hid_command_round_trips_through_u8() {
        for (byte, expected) in [
            (0x01, HidCommand::Ping),
            (0x03, HidCommand::Msg),
            (0x06, HidCommand::Init),
            (0x10, HidCommand::Cbor),
            (0x11, HidCommand::Cancel),
            (0x3F, HidCommand::Error),
        ] {
            assert_eq!(HidCommand::try_from(byte), Ok(expected));
        }
    }

    #[test]
    fn ble_command_retains_high_bit() {
        assert_eq!(BleCommand::try_from(0xBE), Ok(BleCommand::Cancel));
        assert!(BleCommand::try_from(0x3E).is_err());
    }

    #[test]
    fn cbor_forwards_to_ble_msg() {
        assert_eq!(translate_hid_to_ble(HidCommand::Cbor), Some(BleCommand::Msg));
    }

    #[test]
    fn init_wink_msg_lock_are_not_forwarded() {
        for cmd in [HidCommand::Init, HidCommand::Wink, HidCommand::Msg, HidCommand::Lock] {
            assert_eq!(translate_hid_to_ble(cmd), None);
        }
    }

    #[test]
    fn ble_msg_translates_back_to_hid_cbor() {
        assert_eq!(translate_ble_to_hid(BleCommand::Msg), HidCommand::Cbor);
    }
}

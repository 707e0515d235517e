//! Protocol constants: framing sizes, GATT UUIDs, and timing defaults.

/// USB HID framing constants.
pub mod hid {
    /// Fixed HID report size (init and continuation frames alike).
    pub const PACKET_SIZE: usize = 64;
    /// Reserved channel used only for the INIT handshake.
    pub const BROADCAST_CHANNEL: u32 = 0xFFFFFFFF;
    /// Payload capacity of an init frame: `4 (channel) + 1 (cmd) + 2 (len)`.
    pub const INIT_CAPACITY: usize = PACKET_SIZE - 7;
    /// Payload capacity of a continuation frame: `4 (channel) + 1 (seq)`.
    pub const CONT_CAPACITY: usize = PACKET_SIZE - 5;
}

/// BLE GATT framing constants.
pub mod ble {
    /// `max_msg_size` bounds allowed by the CTAP2 BLE transport spec.
    pub const MIN_MAX_MSG_SIZE: u16 = 20;
    pub const MAX_MAX_MSG_SIZE: u16 = 512;
}

/// BlueZ GATT service/characteristic UUIDs for the FIDO2 BLE service.
pub mod uuid {
    /// Primary FIDO2 GATT service.
    pub const FIDO_SERVICE: &str = "0000fffd-0000-1000-8000-00805f9b34fb";
    /// ControlPoint: relying-party-to-authenticator writes land here.
    pub const CONTROL_POINT: &str = "f1d0fff1-deaa-ecee-b42f-c9ba7ed623bb";
    /// Status: authenticator-to-relying-party notifications arrive here.
    pub const STATUS: &str = "f1d0fff2-deaa-ecee-b42f-c9ba7ed623bb";
    /// ControlPointLength: big-endian u16 giving `max_msg_size`.
    pub const CONTROL_POINT_LENGTH: &str = "f1d0fff3-deaa-ecee-b42f-c9ba7ed623bb";
    /// Service Revision Bitfield. Present on spec-compliant authenticators
    /// but never written by this bridge (see module docs on `ble_endpoint`).
    pub const SERVICE_REVISION_BITFIELD: &str = "f1d0fff4-deaa-ecee-b42f-c9ba7ed623bb";
}

/// CTAP1 error codes carried as the single-byte payload of a HID/BLE
/// ERROR frame.
pub mod error_code {
    pub const INVALID_COMMAND: u8 = 0x01;
    pub const INVALID_PARAMETER: u8 = 0x02;
    pub const INVALID_LENGTH: u8 = 0x03;
    pub const INVALID_SEQ: u8 = 0x04;
}

/// Virtual HID device identity (placeholders; override via CLI flags).
pub mod device {
    pub const DEFAULT_VENDOR_ID: u16 = 0xAAAA;
    pub const DEFAULT_PRODUCT_ID: u16 = 0xAAAA;
    pub const DEVICE_NAME: &str = "PONE Fido2BLE Proxy";
}

/// The fixed 34-byte CTAPHID report descriptor: one vendor-defined
/// collection with a 64-byte input report and a 64-byte output report.
pub const REPORT_DESCRIPTOR: &[u8] = &[
    0x06, 0xD0, 0xF1, // Usage Page (FIDO alliance HID usage page)
    0x09, 0x01, // Usage (CTAPHID usage for top-level collection)
    0xA1, 0x01, // Collection (Application)
    0x09, 0x20, // Usage (Raw IN data report)
    0x15, 0x00, // Logical Minimum (0)
    0x26, 0xFF, 0x00, // Logical Maximum (255)
    0x75, 0x08, // Report Size (8)
    0x95, 0x40, // Report Count (64)
    0x81, 0x02, // Input (Data,Var,Abs)
    0x09, 0x21, // Usage (Raw OUT data report)
    0x15, 0x00, // Logical Minimum (0)
    0x26, 0xFF, 0x00, // Logical Maximum (255)
    0x75, 0x08, // Report Size (8)
    0x95, 0x40, // Report Count (64)
    0x91, 0x02, // Output (Data,Var,Abs,Non-volatile)
    0xC0, // End Collection
];

//! CTAPHID/CTAPBLE framing, BLE GATT session handling, and BlueZ discovery
//! for the FIDO2 BLE-to-USB-HID bridge.
//!
//! This crate is transport-only: it has no knowledge of the virtual USB
//! HID device or of the CLI that drives the bridge binary. It owns:
//!
//! - [`framer`]: the stateful fragmenter/reassembler shared by both the
//!   HID and BLE framings.
//! - [`command`]: the CTAPHID/CTAPBLE opcode tables and the translation
//!   between them.
//! - [`protocol`]: framing constants, GATT UUIDs, and timing defaults.
//! - [`ble_endpoint`]: one BLE GATT session per paired authenticator.
//! - [`discovery`]: enumeration of paired FIDO authenticators via BlueZ,
//!   plus hot-plug notifications.

pub mod ble_endpoint;
pub mod command;
pub mod discovery;
pub mod error;
pub mod framer;
pub mod protocol;
pub mod types;

pub use ble_endpoint::{BleEndpoint, BluerGattTransport, GattTransport};
pub use command::{translate_ble_to_hid, translate_hid_to_ble, BleCommand, HidCommand};
pub use discovery::{BlueZDiscovery, DeviceDiscovery};
pub use error::BridgeError;
pub use framer::{FrameLayout, Reassembler};
pub use types::{AuthenticatorDescriptor, ConnectionState, DiscoveryEvent};

//! Common domain types shared by framing, BLE sessions, and discovery.

use std::time::Duration;

/// A paired BLE device BlueZ has exposed as advertising the FIDO2 GATT
/// service, before any GATT connection has been attempted.
#[derive(Debug, Clone)]
pub struct AuthenticatorDescriptor {
    /// BlueZ D-Bus object path, e.g. `/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF`.
    pub device_path: String,
    /// Bluetooth device address.
    pub address: String,
    /// Advertised/cached device name, if BlueZ has resolved one.
    pub name: Option<String>,
    /// True iff BlueZ's object tree already lists child objects (GATT
    /// services/characteristics) under this device's path at discovery
    /// time, meaning a prior GATT introspection already succeeded and a
    /// fresh disconnect/introspect/reconnect dance can be skipped.
    pub cached: bool,
}

/// Lifecycle state of one [`crate::ble_endpoint::BleEndpoint`].
///
/// An idle timeout is a lifecycle *event*, not an error or a distinct
/// state: it triggers the `Connected -> Draining -> Disconnected`
/// transition like any other disconnect, cancelling in-flight writes
/// along the way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No GATT connection has ever been established, or the previous
    /// one has fully torn down.
    Disconnected,
    /// GATT connect is in flight.
    Connecting,
    /// Connected, ControlPoint/Status characteristics resolved and
    /// notifications subscribed.
    Connected,
    /// Disconnect is in flight (explicit, idle-triggered, or unsolicited);
    /// any pending write observes `BridgeError::Transport` rather than
    /// being queued.
    Draining,
}

/// Hot-plug notification for paired FIDO2 authenticators.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A paired authenticator advertising the FIDO2 service appeared
    /// (either newly paired, or BlueZ just announced it via
    /// `InterfacesAdded`, or its `Paired` property flipped to true).
    Added(AuthenticatorDescriptor),
    /// A previously-known authenticator's BlueZ device object disappeared.
    Removed(String),
}

/// Timing and retry knobs a [`crate::ble_endpoint::BleEndpoint`] is
/// configured with. All defaults mirror the authoritative original
/// implementation this bridge's protocol behavior was grounded on.
#[derive(Debug, Clone, Copy)]
pub struct SessionTimings {
    /// No-traffic deadline after which the session disconnects itself.
    pub idle_timeout: Duration,
    /// Deadline for a GATT connect attempt (service/characteristic
    /// resolution included) before it is abandoned as a `ConnectTimeout`.
    pub connect_timeout: Duration,
    /// Poll interval for the idle-timer background task.
    pub idle_poll_interval: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_millis(3000),
            connect_timeout: Duration::from_millis(5000),
            idle_poll_interval: Duration::from_millis(100),
        }
    }
}

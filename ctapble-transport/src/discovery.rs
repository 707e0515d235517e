//! Enumeration of paired FIDO2 BLE authenticators via BlueZ, plus
//! hot-plug notifications.
//!
//! Grounded in the original implementation's `fido2ble.py`: a startup
//! scan over BlueZ's `ObjectManager` tree followed by a live subscription
//! to `InterfacesAdded`/`InterfacesRemoved`, both filtering on the FIDO
//! GATT service UUID appearing in either the `UUIDs` or `ServiceData`
//! device property. Unlike that source (whose live-hotplug path checked
//! only `UUIDs`), this implementation checks both consistently in the
//! startup scan and the hot-plug path, and additionally treats a
//! `Paired` property flip to `true` on an already-known device as a
//! hot-plug trigger, matching the original's module-level
//! `properties_changed` reaction — via a dedicated per-device watcher
//! task (`spawn_device_paired_watcher`) subscribed to that device's own
//! event stream, since adapter-level events (`bluer::AdapterEvent`) never
//! carry a per-device property change.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bluer::{Adapter, Address, Session};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::BridgeError;
use crate::protocol::uuid::FIDO_SERVICE;
use crate::types::{AuthenticatorDescriptor, DiscoveryEvent};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Enumerates paired devices and watches for hot-plug changes.
#[async_trait]
pub trait DeviceDiscovery: Send + Sync {
    /// Enumerate currently paired devices that advertise the FIDO2 GATT
    /// service, via `UUIDs` or `ServiceData`.
    async fn list_paired(&self) -> Result<Vec<AuthenticatorDescriptor>, BridgeError>;

    /// Subscribe to hot-plug add/remove notifications. Each call gets an
    /// independent receiver.
    fn watch(&self) -> broadcast::Receiver<DiscoveryEvent>;
}

/// BlueZ-backed [`DeviceDiscovery`] implementation built on `bluer`.
pub struct BlueZDiscovery {
    adapter: Adapter,
    event_tx: broadcast::Sender<DiscoveryEvent>,
    /// One per-device `Paired`-flip watcher task per currently-known
    /// device address, keyed so `DeviceRemoved` can cancel the matching
    /// watcher instead of leaking it.
    device_watchers: Mutex<HashMap<Address, JoinHandle<()>>>,
}

impl BlueZDiscovery {
    /// Connect to the system D-Bus and bind the default Bluetooth
    /// adapter.
    pub async fn new() -> Result<Self, BridgeError> {
        let session = Session::new()
            .await
            .map_err(|e| BridgeError::Configuration(format!("could not open BlueZ session: {e}")))?;
        let adapter = session
            .default_adapter()
            .await
            .map_err(|e| BridgeError::Configuration(format!("no default Bluetooth adapter: {e}")))?;
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            adapter,
            event_tx,
            device_watchers: Mutex::new(HashMap::new()),
        })
    }

    async fn describe(&self, address: Address) -> Result<Option<AuthenticatorDescriptor>, BridgeError> {
        let device = self.adapter.device(address)?;

        if !device.is_paired().await.unwrap_or(false) {
            return Ok(None);
        }

        let advertises_fido = device_advertises_fido(&device).await;
        if !advertises_fido {
            return Ok(None);
        }

        let name = device.name().await.unwrap_or(None);
        let cached = device.is_services_resolved().await.unwrap_or(false);

        Ok(Some(AuthenticatorDescriptor {
            device_path: format!("/org/bluez/{}/dev_{}", self.adapter.name(), address.to_string().replace(':', "_")),
            address: address.to_string(),
            name,
            cached,
        }))
    }

    /// Spawn the background task that drives `watch()`'s receivers:
    /// polls the adapter's device list for additions/removals, and spawns
    /// one per-device watcher per known address to catch a `Paired`
    /// property flip to `true` (e.g. a device bonded after it first showed
    /// up unpaired). `bluer`'s device-event streams are the idiomatic
    /// replacement for BlueZ's raw
    /// `InterfacesAdded`/`InterfacesRemoved`/`PropertiesChanged` D-Bus
    /// signals the original implementation subscribed to directly.
    pub fn spawn_hotplug_watcher(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.run_hotplug_watcher().await {
                warn!(error = %e, "BlueZ hotplug watcher exited");
            }
        });
    }

    async fn run_hotplug_watcher(self: Arc<Self>) -> Result<(), BridgeError> {
        use futures::StreamExt;

        let mut events = self.adapter.discover_devices_with_changes().await?;
        info!("watching BlueZ adapter for paired FIDO2 authenticators");

        while let Some(event) = events.next().await {
            match event {
                bluer::AdapterEvent::DeviceAdded(address) => {
                    if let Some(descriptor) = self.describe(address).await.unwrap_or(None) {
                        debug!(address = %address, "BlueZ reported a new paired FIDO2 device");
                        let _ = self.event_tx.send(DiscoveryEvent::Added(descriptor));
                    }
                    self.clone().spawn_device_paired_watcher(address);
                }
                bluer::AdapterEvent::DeviceRemoved(address) => {
                    debug!(address = %address, "BlueZ reported a device removed");
                    if let Some(handle) = self.device_watchers.lock().remove(&address) {
                        handle.abort();
                    }
                    let _ = self.event_tx.send(DiscoveryEvent::Removed(address.to_string()));
                }
                // Adapter-level property changes (discovering, powered,
                // ...); no per-device Paired transition ever arrives here
                // — that's what `spawn_device_paired_watcher` is for.
                bluer::AdapterEvent::PropertyChanged(_) => {}
            }
        }

        Ok(())
    }

    /// Watch one device's property-change stream for a `Paired` flip to
    /// `true`, emitting `DiscoveryEvent::Added` the same way a startup scan
    /// or a freshly-added device would, if it advertises the FIDO service.
    /// Grounded in `original_source/fido2ble/fido2ble.py`'s module-level
    /// `properties_changed` handler, which reacts to exactly this D-Bus
    /// signal on an already-known device rather than only at discovery
    /// time. Replaces any watcher already running for this address.
    fn spawn_device_paired_watcher(self: Arc<Self>, address: Address) {
        let handle = tokio::spawn(async move {
            use futures::StreamExt;

            let device = match self.adapter.device(address) {
                Ok(device) => device,
                Err(e) => {
                    warn!(address = %address, error = %e, "could not bind device for Paired watcher");
                    return;
                }
            };
            let mut events = match device.events().await {
                Ok(events) => events,
                Err(e) => {
                    warn!(address = %address, error = %e, "could not subscribe to device property changes");
                    return;
                }
            };

            while let Some(event) = events.next().await {
                if let bluer::DeviceEvent::PropertyChanged(bluer::DeviceProperty::Paired(true)) = event {
                    if let Some(descriptor) = self.describe(address).await.unwrap_or(None) {
                        debug!(address = %address, "BlueZ reported Paired -> true on a known device");
                        let _ = self.event_tx.send(DiscoveryEvent::Added(descriptor));
                    }
                }
            }
        });

        if let Some(previous) = self.device_watchers.lock().insert(address, handle) {
            previous.abort();
        }
    }
}

impl BlueZDiscovery {
    /// Resolve a previously-discovered authenticator's address back to a
    /// live `bluer::Device`, so the bin crate's supervisor can hand it to
    /// a [`crate::ble_endpoint::BluerGattTransport`] without this crate
    /// needing to know anything about `HidEndpoint` pairing.
    pub fn device(&self, address: &str) -> Result<bluer::Device, BridgeError> {
        let address: Address = address
            .parse()
            .map_err(|e| BridgeError::Configuration(format!("bad device address {address}: {e}")))?;
        Ok(self.adapter.device(address)?)
    }
}

#[async_trait]
impl DeviceDiscovery for BlueZDiscovery {
    async fn list_paired(&self) -> Result<Vec<AuthenticatorDescriptor>, BridgeError> {
        let mut found = Vec::new();
        for address in self.adapter.device_addresses().await? {
            if let Some(descriptor) = self.describe(address).await? {
                found.push(descriptor);
            }
        }
        info!(count = found.len(), "startup scan found paired FIDO2 authenticators");
        Ok(found)
    }

    fn watch(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.event_tx.subscribe()
    }
}

async fn device_advertises_fido(device: &bluer::Device) -> bool {
    if let Ok(Some(uuids)) = device.uuids().await {
        if uuids.iter().any(|u| u.to_string().eq_ignore_ascii_case(FIDO_SERVICE)) {
            return true;
        }
    }
    if let Ok(Some(service_data)) = device.service_data().await {
        if service_data.keys().any(|u| u.to_string().eq_ignore_ascii_case(FIDO_SERVICE)) {
            return true;
        }
    }
    false
}

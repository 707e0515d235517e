//! Bridge / Supervisor: discovers paired FIDO2 authenticators, pairs each
//! with a [`HidEndpoint`], reacts to BlueZ hot-plug events, and orchestrates
//! shutdown.
//!
//! Grounded in `original_source/fido2ble/fido2ble.py::find_fido`/
//! `monitor_bluez` for the discover-then-watch shape, and in the teacher's
//! own device-registry pattern (one `HashMap` keyed by a stable identifier,
//! one task per managed device, torn down on removal or shutdown).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use ctapble_transport::ble_endpoint::{BleEndpoint, BluerGattTransport};
use ctapble_transport::discovery::{BlueZDiscovery, DeviceDiscovery};
use ctapble_transport::error::BridgeError;
use ctapble_transport::types::{AuthenticatorDescriptor, DiscoveryEvent, SessionTimings};

use crate::hid_endpoint::{BleNotifyReassembler, HidEndpoint};

/// One running authenticator pairing: the task driving its HID/BLE event
/// loops, and a handle to ask it to stop.
struct EndpointHandle {
    shutdown: oneshot::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

/// Owns the supervisor's two authenticator registries (`spec.md` §5: "no
/// global mutable state beyond the supervisor's two authenticator
/// registries"). Here they collapse into one `HashMap` keyed by BlueZ
/// device path, since one authenticator maps to exactly one
/// `HidEndpoint`+`BleEndpoint` pair in this implementation.
pub struct Supervisor {
    discovery: Arc<BlueZDiscovery>,
    timings: SessionTimings,
    vendor_id: u16,
    product_id: u16,
    endpoints: Mutex<HashMap<String, EndpointHandle>>,
}

impl Supervisor {
    pub fn new(discovery: Arc<BlueZDiscovery>, timings: SessionTimings, vendor_id: u16, product_id: u16) -> Arc<Self> {
        Arc::new(Self {
            discovery,
            timings,
            vendor_id,
            product_id,
            endpoints: Mutex::new(HashMap::new()),
        })
    }

    /// Enumerate paired authenticators, pair each, then react to hot-plug
    /// events until `shutdown` resolves.
    pub async fn run(self: Arc<Self>, shutdown: impl std::future::Future<Output = ()>) -> Result<(), BridgeError> {
        let paired = self.discovery.list_paired().await?;
        if paired.is_empty() {
            info!("no paired FIDO2 BLE authenticators found at startup; waiting for hot-plug");
        }
        for descriptor in paired {
            self.clone().spawn_pairing(descriptor);
        }

        let mut events = self.discovery.watch();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(DiscoveryEvent::Added(descriptor)) => {
                            info!(address = %descriptor.address, "paired FIDO2 authenticator appeared");
                            self.clone().spawn_pairing(descriptor);
                        }
                        Ok(DiscoveryEvent::Removed(device_path)) => {
                            info!(device_path = %device_path, "authenticator removed");
                            self.remove(&device_path).await;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "hot-plug event receiver lagged; some add/remove events were dropped");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            warn!("hot-plug event channel closed; no further hot-plug events will be observed");
                            break;
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
            }
        }

        self.shutdown_all().await;
        Ok(())
    }

    fn spawn_pairing(self: Arc<Self>, descriptor: AuthenticatorDescriptor) {
        let key = descriptor.device_path.clone();
        if self.endpoints.lock().contains_key(&key) {
            debug!(device_path = %key, "authenticator already paired, ignoring duplicate add");
            return;
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let this = self.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = this.run_pairing(descriptor.clone(), shutdown_rx).await {
                error!(address = %descriptor.address, error = %e, "authenticator pairing task exited with an error");
            }
            this.endpoints.lock().remove(&descriptor.device_path);
        });

        self.endpoints.lock().insert(key, EndpointHandle { shutdown: shutdown_tx, task });
    }

    /// One authenticator's entire lifetime: resolve its `bluer::Device`,
    /// build the BLE session and virtual HID device, then pump both event
    /// loops until told to stop or either side dies. A panic or error in
    /// this task only ever drops this one authenticator's endpoints
    /// (`spec.md` §7 propagation policy) — it is never allowed to take the
    /// supervisor's own task down with it.
    async fn run_pairing(
        &self,
        descriptor: AuthenticatorDescriptor,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) -> Result<(), BridgeError> {
        let device = self.discovery.device(&descriptor.address)?;
        let transport = Arc::new(BluerGattTransport::new(device));
        let ble = BleEndpoint::new(transport, descriptor.clone(), self.timings);

        let (mut hid, mut output_rx, mut notify_rx) =
            HidEndpoint::start(ble.clone(), &descriptor, self.vendor_id, self.product_id).await?;
        info!(device = hid.device_name(), "authenticator paired");

        let mut ble_reassembler = BleNotifyReassembler::new();

        loop {
            tokio::select! {
                report = output_rx.recv() => {
                    match report {
                        Some(report) => hid.handle_output_report(&report).await,
                        None => {
                            warn!(address = %descriptor.address, "virtual HID device thread exited");
                            break;
                        }
                    }
                }
                notification = notify_rx.recv() => {
                    match notification {
                        Some(frame) => {
                            let max_msg_size = ble.max_msg_size();
                            if max_msg_size > 0 {
                                if let Some((cmd, payload)) = ble_reassembler.feed(max_msg_size, &frame) {
                                    ble.keep_alive();
                                    hid.handle_ble_message(cmd, payload);
                                }
                            }
                        }
                        None => {
                            debug!(address = %descriptor.address, "BLE notification channel closed");
                        }
                    }
                }
                _ = &mut shutdown_rx => {
                    break;
                }
            }
        }

        hid.shutdown().await;
        Ok(())
    }

    async fn remove(&self, device_path: &str) {
        let handle = self.endpoints.lock().remove(device_path);
        if let Some(handle) = handle {
            let _ = handle.shutdown.send(());
            let _ = handle.task.await;
        }
    }

    /// Shut down every `HidEndpoint`, then every `BleEndpoint` (`spec.md`
    /// §4.5) — each pairing task's own teardown order already does this
    /// (`hid.shutdown()` disconnects its `BleEndpoint` last), so here we
    /// just need to stop every task and wait for it to finish draining.
    async fn shutdown_all(&self) {
        let handles: Vec<EndpointHandle> = self.endpoints.lock().drain().map(|(_, v)| v).collect();
        for handle in handles {
            let _ = handle.shutdown.send(());
            let _ = handle.task.await;
        }
    }
}

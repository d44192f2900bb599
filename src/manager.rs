use std::cell::{Cell, OnceCell};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_broadcast::{InactiveReceiver, Sender};
use async_lock::Mutex;
use futures_core::Stream;
use log::{debug, info, warn};
use uuid::Uuid;

use crate::adapter::{ConnectionState, EventReceiver, RadioAdapter, RadioEvent};
use crate::async_util::sleep_blocking;
use crate::connection::{GattConnection, DEFAULT_MTU};
use crate::error::{Error, ErrorKind, GattStatus};
use crate::executor::{
    Completion, EventSeq, Operation, OperationExecutor, OperationKey, OperationKind,
    OperationTarget,
};
use crate::gatt_tree::AttributeKey;
use crate::util::defer;
use crate::{
    ConnHandle, ConnectOptions, ConnectionEvent, ConnectionPriority, DeviceId, ManagerConfig,
    Result, ScanMode,
};

/// A device found by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub device: DeviceId,
    pub rssi: i16,
}

/// Owns the live GATT connections of one radio and turns its callbacks into the results of
/// blocking calls.
///
/// Creating a manager spawns a dispatch thread draining the radio's events; it stops when
/// the last clone of the manager is dropped.
#[derive(Clone)]
pub struct GattConnectionManager {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    pub(crate) radio: Arc<dyn RadioAdapter>,
    pub(crate) executor: Arc<OperationExecutor>,
    pub(crate) config: ManagerConfig,
    registry: Mutex<HashMap<ConnHandle, GattConnection>>,
    events: Sender<ConnectionEvent>,
    #[allow(unused)]
    events_keeper: InactiveReceiver<ConnectionEvent>,
    radio_events: async_channel::Receiver<(EventSeq, RadioEvent)>,
}

impl GattConnectionManager {
    /// Creates a manager for `radio`, which delivers its events to the sink paired with
    /// `events`.
    pub fn new(
        radio: Arc<dyn RadioAdapter>,
        events: EventReceiver,
        config: ManagerConfig,
    ) -> Result<Self> {
        let (mut sender, receiver) = async_broadcast::broadcast(32);
        sender.set_overflow(true);
        let shared = Arc::new(Shared {
            radio,
            executor: Arc::new(OperationExecutor::with_clock(events.clock.clone())),
            config,
            registry: Mutex::new(HashMap::new()),
            events: sender,
            events_keeper: receiver.deactivate(),
            radio_events: events.receiver.clone(),
        });

        let weak = Arc::downgrade(&shared);
        let receiver = events.receiver;
        std::thread::Builder::new()
            .name("gatt-dispatch".into())
            .spawn(move || dispatch_loop(weak, receiver))
            .map_err(|e| {
                Error::new(
                    ErrorKind::Internal,
                    format!("failed to spawn the dispatch thread: {e}"),
                )
            })?;
        Ok(Self { shared })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }

    /// Connects to `device`.
    ///
    /// With a connection priority in `options`, the priority is requested until the radio
    /// accepts it; with an MTU, the connection is reported as established only after the MTU
    /// is negotiated. A connection failing at any step is torn down before returning.
    pub fn connect(&self, device: &DeviceId, options: ConnectOptions) -> Result<GattConnection> {
        let shared = &self.shared;
        let deadline = Instant::now() + options.timeout;
        let conn_slot: OnceCell<GattConnection> = OnceCell::new();
        let cleanup = defer(|| {
            if let Some(conn) = conn_slot.get() {
                conn.abort();
            }
        });

        let key = OperationKey::new(OperationKind::Connect, OperationTarget::Device(device.clone()));
        let op = Operation::new(key, || {
            // held across the request: the dispatcher must not see the first state change
            // of the new handle before it is registered
            let mut registry = shared.registry.lock_blocking();
            let handle = shared.radio.connect(device, options.auto_connect)?;
            let conn = GattConnection::new(handle, device.clone(), options.clone(), shared);
            registry.insert(handle, conn.clone());
            drop(registry);
            let _ = conn_slot.set(conn.clone());
            debug!("connecting to {device} as {handle}");
            if let Some(priority) = options.priority {
                self.request_priority(&conn, priority, deadline)?;
            }
            Ok(())
        })
        .on_cancel(|| {
            if let Some(conn) = conn_slot.get() {
                conn.abort();
            }
        });
        shared.executor.execute(op, Some(options.timeout))?;

        let conn = conn_slot
            .get()
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::Internal, "connection was not created"))?;
        cleanup.defuse();
        info!("connected to {device} as {}", conn.handle());
        shared.publish(ConnectionEvent::Connected(device.clone(), conn.handle()));
        Ok(conn)
    }

    // The radio rejects priority requests until its internal binding of the new connection
    // is complete; there is no callback for that, so poll until the connect deadline.
    fn request_priority(
        &self,
        conn: &GattConnection,
        priority: ConnectionPriority,
        deadline: Instant,
    ) -> Result<()> {
        loop {
            if conn.is_closed() {
                return Err(Error::new(
                    ErrorKind::ConnectionFailed,
                    format!("{} closed while requesting connection priority", conn.device()),
                ));
            }
            if self
                .shared
                .radio
                .request_connection_priority(conn.handle(), priority)
            {
                debug!("connection priority {priority:?} accepted by {}", conn.device());
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::new(
                    ErrorKind::Timeout,
                    format!("connection priority {priority:?} was never accepted"),
                ));
            }
            sleep_blocking(self.shared.config.priority_poll_interval);
        }
    }

    /// Scans until a device advertising `service` is found, or `timeout` elapses.
    /// `None` scans without deadline.
    pub fn scan(
        &self,
        service: Option<Uuid>,
        mode: ScanMode,
        timeout: Option<Duration>,
    ) -> Result<DiscoveredDevice> {
        let radio = &self.shared.radio;
        let started = Cell::new(false);
        let _stop = defer(|| {
            if started.get() {
                radio.stop_scan();
            }
        });

        let key = OperationKey::new(OperationKind::Scan, OperationTarget::Adapter);
        let op = Operation::new(key, || {
            radio.start_scan(service, mode)?;
            started.set(true);
            Ok(())
        });
        let (device, rssi) = self.shared.executor.execute_nonnull(op, timeout)?.into_device()?;
        debug!("found {device} ({rssi} dBm) by {mode:?} scan");
        Ok(DiscoveredDevice { device, rssi })
    }

    /// Finds a device advertising `service` and connects to it.
    ///
    /// A short low-latency scan is tried first, then a low-power scan. A failed connection
    /// restarts the whole sequence, up to [`ManagerConfig::connect_retries`] times.
    pub fn auto_connect(&self, service: Uuid, options: ConnectOptions) -> Result<GattConnection> {
        let mut attempt = 0;
        loop {
            let found = self.scan_escalating(service)?;
            match self.connect(&found.device, options.clone()) {
                Ok(conn) => return Ok(conn),
                Err(e) if attempt < self.shared.config.connect_retries => {
                    attempt += 1;
                    warn!(
                        "connecting to {} failed ({e}), retry {attempt} of {}",
                        found.device, self.shared.config.connect_retries
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn scan_escalating(&self, service: Uuid) -> Result<DiscoveredDevice> {
        let config = &self.shared.config;
        match self.scan(
            Some(service),
            ScanMode::LowLatency,
            Some(config.high_power_scan_window),
        ) {
            Err(e) if e.kind() == ErrorKind::Timeout => {
                info!("no device with {service} nearby, continuing with a low power scan");
                self.scan(Some(service), ScanMode::LowPower, config.low_power_scan_timeout)
            }
            res => res,
        }
    }

    /// The connection registered under `handle`, if it is still open.
    pub fn connection(&self, handle: ConnHandle) -> Option<GattConnection> {
        self.shared.lookup(handle)
    }

    /// All open connections, including those still connecting.
    pub fn connections(&self) -> Vec<GattConnection> {
        self.shared
            .registry
            .lock_blocking()
            .values()
            .cloned()
            .collect()
    }

    /// Closes every connection.
    pub fn close_all(&self) {
        for conn in self.connections() {
            if let Err(e) = conn.close() {
                warn!("closing {} failed: {e}", conn.device());
            }
        }
    }

    /// A stream of connection lifecycle events. Slow readers lose the oldest events.
    pub fn connection_events(&self) -> impl Stream<Item = ConnectionEvent> + Send + Unpin {
        self.shared.events.new_receiver()
    }
}

impl Shared {
    pub(crate) fn unregister(&self, handle: ConnHandle) {
        self.registry.lock_blocking().remove(&handle);
    }

    pub(crate) fn publish(&self, event: ConnectionEvent) {
        let _ = self.events.try_broadcast(event);
    }

    fn lookup(&self, handle: ConnHandle) -> Option<GattConnection> {
        self.registry.lock_blocking().get(&handle).cloned()
    }

    fn known(&self, handle: ConnHandle, what: &str) -> Option<GattConnection> {
        let conn = self.lookup(handle);
        if conn.is_none() {
            warn!("{what} for unknown connection {handle} dropped");
        }
        conn
    }

    fn dispatch(&self, seq: EventSeq, event: RadioEvent) {
        let executor = &self.executor;
        match event {
            RadioEvent::ConnectionStateChanged {
                handle,
                status,
                state,
            } => {
                let Some(conn) = self.known(handle, "state change") else {
                    return;
                };
                if state == ConnectionState::Connected && status.is_success() {
                    self.on_link_up(&conn, seq);
                } else {
                    self.on_link_down(&conn, seq, status);
                }
            }
            RadioEvent::ServicesDiscovered {
                handle,
                status,
                services,
            } => {
                let Some(conn) = self.known(handle, "service discovery") else {
                    return;
                };
                conn.store_services(services);
                let key = OperationKey::connection(OperationKind::DiscoverServices, handle);
                executor.notify_completion(&key, seq, status, None);
            }
            RadioEvent::CharacteristicRead {
                handle,
                key,
                status,
                value,
            } => {
                if self.known(handle, "characteristic read").is_some() {
                    let key = OperationKey::attribute(
                        OperationKind::ReadCharacteristic,
                        handle,
                        AttributeKey::Characteristic(key),
                    );
                    executor.notify_completion(&key, seq, status, Some(Completion::Value(value)));
                }
            }
            RadioEvent::CharacteristicWrite {
                handle,
                key,
                status,
            } => {
                if self.known(handle, "characteristic write").is_some() {
                    let key = OperationKey::attribute(
                        OperationKind::WriteCharacteristic,
                        handle,
                        AttributeKey::Characteristic(key),
                    );
                    executor.notify_completion(&key, seq, status, None);
                }
            }
            RadioEvent::DescriptorRead {
                handle,
                key,
                status,
                value,
            } => {
                if self.known(handle, "descriptor read").is_some() {
                    let key = OperationKey::attribute(
                        OperationKind::ReadDescriptor,
                        handle,
                        AttributeKey::Descriptor(key),
                    );
                    executor.notify_completion(&key, seq, status, Some(Completion::Value(value)));
                }
            }
            RadioEvent::DescriptorWrite {
                handle,
                key,
                status,
            } => {
                if self.known(handle, "descriptor write").is_some() {
                    let key = OperationKey::attribute(
                        OperationKind::WriteDescriptor,
                        handle,
                        AttributeKey::Descriptor(key),
                    );
                    executor.notify_completion(&key, seq, status, None);
                }
            }
            RadioEvent::MtuChanged {
                handle,
                status,
                mtu,
            } => {
                let Some(conn) = self.known(handle, "MTU change") else {
                    return;
                };
                if mtu < DEFAULT_MTU {
                    warn!("{handle} reported MTU {mtu}, using {DEFAULT_MTU}");
                }
                let mtu = mtu.max(DEFAULT_MTU);
                if status.is_success() {
                    conn.set_mtu(mtu);
                }
                if conn.take_awaiting_connect_mtu() {
                    let key = connect_key(&conn);
                    if status.is_success() {
                        conn.mark_connected();
                        executor.notify_success(&key, seq, None);
                    } else {
                        executor.notify_failure(
                            &key,
                            seq,
                            Error::new(
                                ErrorKind::ConnectionFailed,
                                format!("MTU negotiation failed with status {}", status.raw()),
                            ),
                        );
                    }
                } else {
                    let key = OperationKey::connection(OperationKind::RequestMtu, handle);
                    executor.notify_completion(&key, seq, status, Some(Completion::Mtu(mtu)));
                }
            }
            RadioEvent::RssiRead {
                handle,
                status,
                rssi,
            } => {
                if self.known(handle, "RSSI read").is_some() {
                    let key = OperationKey::connection(OperationKind::ReadRssi, handle);
                    executor.notify_completion(&key, seq, status, Some(Completion::Rssi(rssi)));
                }
            }
            RadioEvent::CharacteristicChanged { handle, key, value } => {
                if let Some(conn) = self.known(handle, "characteristic change") {
                    conn.deliver_change(&key, value);
                }
            }
            RadioEvent::ScanResult { device, rssi } => {
                let key = OperationKey::new(OperationKind::Scan, OperationTarget::Adapter);
                executor.notify_success(&key, seq, Some(Completion::Device(device, rssi)));
            }
            RadioEvent::ScanFailed { error_code } => {
                let key = OperationKey::new(OperationKind::Scan, OperationTarget::Adapter);
                executor.notify_failure(
                    &key,
                    seq,
                    Error::new(
                        ErrorKind::Protocol(GattStatus::from_raw(error_code)),
                        "scan failed",
                    ),
                );
            }
        }
    }

    fn on_link_up(&self, conn: &GattConnection, seq: EventSeq) {
        if conn.is_connected() {
            debug!("{} reported connected twice", conn.device());
            return;
        }
        let key = connect_key(conn);
        let Some(mtu) = conn.options().mtu else {
            conn.mark_connected();
            self.executor.notify_success(&key, seq, None);
            return;
        };
        conn.set_awaiting_connect_mtu(true);
        if let Err(e) = self.radio.request_mtu(conn.handle(), mtu) {
            conn.set_awaiting_connect_mtu(false);
            self.executor.notify_failure(&key, seq, e);
        }
    }

    // A disconnected state means the connect attempt failed if the connection was never
    // established, or the established session ended otherwise.
    fn on_link_down(&self, conn: &GattConnection, seq: EventSeq, status: GattStatus) {
        if conn.is_aborted() {
            debug!("{} torn down", conn.handle());
            conn.release();
        } else if !conn.is_connected() {
            conn.release();
            self.executor.notify_failure(
                &connect_key(conn),
                seq,
                Error::new(
                    ErrorKind::ConnectionFailed,
                    format!("connecting to {} failed with status {}", conn.device(), status.raw()),
                ),
            );
        } else {
            let key = OperationKey::connection(OperationKind::Disconnect, conn.handle());
            if self.executor.is_pending(&key) {
                // close() releases the session itself
                self.executor.notify_success(&key, seq, None);
            } else {
                info!("connection to {} lost, status {}", conn.device(), status.raw());
                conn.release();
            }
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        // wakes up the dispatch thread
        self.radio_events.close();
    }
}

fn connect_key(conn: &GattConnection) -> OperationKey {
    OperationKey::new(
        OperationKind::Connect,
        OperationTarget::Device(conn.device().clone()),
    )
}

fn dispatch_loop(shared: Weak<Shared>, receiver: async_channel::Receiver<(EventSeq, RadioEvent)>) {
    while let Ok((seq, event)) = receiver.recv_blocking() {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.dispatch(seq, event);
    }
    debug!("dispatch thread stopped");
}

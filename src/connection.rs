use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_lock::Mutex;
use log::{debug, info, warn};
use uuid::Uuid;

use crate::adapter::RadioAdapter;
use crate::async_util::{Flight, SingleFlight};
use crate::characteristic::Characteristic;
use crate::descriptor::Descriptor;
use crate::error::{Error, ErrorKind};
use crate::executor::{Operation, OperationExecutor, OperationKey, OperationKind};
use crate::gatt_tree::{self, AttributeKey, CharacteristicKey, DescriptorKey, GattService};
use crate::manager::Shared;
use crate::observer::ChangeObserver;
use crate::service::Service;
use crate::util::defer;
use crate::{ConnHandle, ConnectOptions, ConnectionEvent, DeviceId, ManagerConfig, Result, WriteType};

/// ATT MTU used until a larger one is negotiated.
pub const DEFAULT_MTU: u16 = 23;

const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];
const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];
const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

type CloseListener = Box<dyn FnOnce(&GattConnection) + Send + 'static>;

/// A GATT client session with one device.
///
/// All methods block the calling thread until the radio reports the outcome or the
/// configured timeout elapses. Clones share the same session.
#[derive(Clone)]
pub struct GattConnection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    handle: ConnHandle,
    device: DeviceId,
    options: ConnectOptions,
    radio: Arc<dyn RadioAdapter>,
    executor: Arc<OperationExecutor>,
    config: ManagerConfig,
    manager: Weak<Shared>,
    state: Mutex<ConnState>,
    discovery: SingleFlight<Result<()>>,
    observers: Mutex<HashMap<CharacteristicKey, ChangeObserver>>,
    // held across a CCCD write, so a concurrent enable sees the outcome of the first one
    notification_setup: Mutex<()>,
    close_listeners: Mutex<Vec<CloseListener>>,
}

struct ConnState {
    connected: bool,
    closing: bool,
    closed: bool,
    // the connect operation completes on the MTU callback instead of the state callback
    awaiting_connect_mtu: bool,
    services_discovered: bool,
    services: Vec<GattService>,
    mtu: u16,
}

impl PartialEq for GattConnection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for GattConnection {}

impl std::fmt::Debug for GattConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GattConnection")
            .field("handle", &self.inner.handle)
            .field("device", &self.inner.device)
            .finish()
    }
}

impl GattConnection {
    pub(crate) fn new(
        handle: ConnHandle,
        device: DeviceId,
        options: ConnectOptions,
        shared: &Arc<Shared>,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                handle,
                device,
                options,
                radio: shared.radio.clone(),
                executor: shared.executor.clone(),
                config: shared.config.clone(),
                manager: Arc::downgrade(shared),
                state: Mutex::new(ConnState {
                    connected: false,
                    closing: false,
                    closed: false,
                    awaiting_connect_mtu: false,
                    services_discovered: false,
                    services: Vec::new(),
                    mtu: DEFAULT_MTU,
                }),
                discovery: SingleFlight::new(),
                observers: Mutex::new(HashMap::new()),
                notification_setup: Mutex::new(()),
                close_listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The native handle of this session.
    pub fn handle(&self) -> ConnHandle {
        self.inner.handle
    }

    /// The remote device.
    pub fn device(&self) -> &DeviceId {
        &self.inner.device
    }

    /// The options this session was connected with.
    pub fn options(&self) -> &ConnectOptions {
        &self.inner.options
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock_blocking().connected
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock_blocking().closed
    }

    /// The negotiated ATT MTU.
    pub fn mtu(&self) -> u16 {
        self.inner.state.lock_blocking().mtu
    }

    /// The largest value that fits in a single write.
    pub fn max_write_len(&self) -> usize {
        usize::from(self.mtu()).saturating_sub(3)
    }

    /// Discovers the attribute table of the device, unless already discovered.
    ///
    /// Concurrent callers share a single discovery. A discovery failing because of a stale
    /// attribute cache is retried once after refreshing the cache, if the device is bonded
    /// and may change its services, or the connection was opened with `force_refresh`.
    pub fn discover_services(&self) -> Result<()> {
        self.check_connected()?;
        if self.inner.state.lock_blocking().services_discovered {
            return Ok(());
        }
        match self.inner.discovery.join() {
            Flight::Follower(follower) => follower.wait().unwrap_or_else(|| {
                Err(Error::new(ErrorKind::Internal, "service discovery abandoned"))
            }),
            Flight::Leader(leader) => {
                // another flight may have finished between the check and joining
                let res = if self.inner.state.lock_blocking().services_discovered {
                    Ok(())
                } else {
                    self.discover_with_refresh()
                };
                leader.finish(res.clone());
                res
            }
        }
    }

    fn discover_with_refresh(&self) -> Result<()> {
        let err = match self.discover_once() {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        if !self.should_refresh(&err) {
            return Err(err);
        }
        info!(
            "refreshing attribute cache of {} after failed discovery: {err}",
            self.inner.device
        );
        self.inner.radio.refresh(self.inner.handle)?;
        self.discover_once()
    }

    fn discover_once(&self) -> Result<()> {
        let handle = self.inner.handle;
        let key = OperationKey::connection(OperationKind::DiscoverServices, handle);
        let op = Operation::new(key, || self.inner.radio.discover_services(handle));
        self.inner
            .executor
            .execute(op, Some(self.inner.config.discovery_timeout))?;
        let mut state = self.inner.state.lock_blocking();
        state.services_discovered = true;
        debug!(
            "discovered {} services on {}",
            state.services.len(),
            self.inner.device
        );
        Ok(())
    }

    fn should_refresh(&self, err: &Error) -> bool {
        if !err.status().is_some_and(|s| s.is_stale_cache_failure()) {
            return false;
        }
        if self.inner.options.force_refresh {
            return true;
        }
        let has_service_changed =
            gatt_tree::has_service_changed(&self.inner.state.lock_blocking().services);
        has_service_changed && self.inner.radio.is_bonded(&self.inner.device)
    }

    /// Clears the radio's attribute cache. The table is discovered again on next use.
    pub fn refresh_cache(&self) -> Result<()> {
        self.check_connected()?;
        self.inner.radio.refresh(self.inner.handle)?;
        let mut state = self.inner.state.lock_blocking();
        state.services_discovered = false;
        state.services.clear();
        Ok(())
    }

    /// The services of the device, discovering them first if needed.
    pub fn services(&self) -> Result<Vec<Service>> {
        self.discover_services()?;
        let state = self.inner.state.lock_blocking();
        Ok(state.services.iter().map(Service::from_table).collect())
    }

    /// Finds the only service with `uuid`.
    pub fn get_service(&self, uuid: Uuid) -> Result<Service> {
        self.discover_services()?;
        let state = self.inner.state.lock_blocking();
        gatt_tree::find_service(&state.services, uuid).map(Service::from_table)
    }

    /// Finds the only characteristic with `characteristic` in the only service with `service`.
    pub fn get_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<Characteristic> {
        self.discover_services()?;
        let state = self.inner.state.lock_blocking();
        gatt_tree::find_characteristic(&state.services, service, characteristic)
            .map(|ch| Characteristic::from_table(service, ch))
    }

    /// Finds the only descriptor with `descriptor` of the characteristic found by
    /// [`GattConnection::get_characteristic`].
    pub fn get_descriptor(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
    ) -> Result<Descriptor> {
        self.discover_services()?;
        let key = DescriptorKey {
            service,
            characteristic,
            descriptor,
        };
        let state = self.inner.state.lock_blocking();
        gatt_tree::find_descriptor(&state.services, &key)?;
        Ok(Descriptor::new(key))
    }

    /// Read the value of a characteristic from the device.
    pub fn read_characteristic(&self, characteristic: &Characteristic) -> Result<Vec<u8>> {
        self.check_connected()?;
        let handle = self.inner.handle;
        let char_key = characteristic.key();
        let key = OperationKey::attribute(
            OperationKind::ReadCharacteristic,
            handle,
            AttributeKey::Characteristic(char_key),
        );
        let op = Operation::new(key, || {
            self.inner.radio.read_characteristic(handle, &char_key)
        });
        self.inner
            .executor
            .execute_nonnull(op, Some(self.inner.config.operation_timeout))?
            .into_value()
    }

    /// Write `value` to a characteristic. A write request is used if the characteristic
    /// supports it, a write command otherwise.
    pub fn write_characteristic(&self, characteristic: &Characteristic, value: &[u8]) -> Result<()> {
        let props = characteristic.properties();
        let write_type = if props.write {
            WriteType::WithResponse
        } else if props.write_without_response {
            WriteType::WithoutResponse
        } else {
            return Err(Error::new(
                ErrorKind::Unwritable,
                format!("characteristic {} is not writable", characteristic.uuid()),
            ));
        };
        self.check_connected()?;
        let handle = self.inner.handle;
        let char_key = characteristic.key();
        let key = OperationKey::attribute(
            OperationKind::WriteCharacteristic,
            handle,
            AttributeKey::Characteristic(char_key),
        );
        let op = Operation::new(key, || {
            self.inner
                .radio
                .write_characteristic(handle, &char_key, value, write_type)
        });
        self.inner
            .executor
            .execute(op, Some(self.inner.config.operation_timeout))?;
        Ok(())
    }

    /// Read the value of a descriptor from the device.
    pub fn read_descriptor(&self, descriptor: &Descriptor) -> Result<Vec<u8>> {
        self.check_connected()?;
        let handle = self.inner.handle;
        let desc_key = descriptor.key();
        let key = OperationKey::attribute(
            OperationKind::ReadDescriptor,
            handle,
            AttributeKey::Descriptor(desc_key),
        );
        let op = Operation::new(key, || self.inner.radio.read_descriptor(handle, &desc_key));
        self.inner
            .executor
            .execute_nonnull(op, Some(self.inner.config.operation_timeout))?
            .into_value()
    }

    /// Write `value` to a descriptor.
    pub fn write_descriptor(&self, descriptor: &Descriptor, value: &[u8]) -> Result<()> {
        self.check_connected()?;
        self.write_descriptor_key(&descriptor.key(), value)
    }

    fn write_descriptor_key(&self, desc_key: &DescriptorKey, value: &[u8]) -> Result<()> {
        let handle = self.inner.handle;
        let key = OperationKey::attribute(
            OperationKind::WriteDescriptor,
            handle,
            AttributeKey::Descriptor(*desc_key),
        );
        let op = Operation::new(key, || {
            self.inner.radio.write_descriptor(handle, desc_key, value)
        });
        self.inner
            .executor
            .execute(op, Some(self.inner.config.operation_timeout))?;
        Ok(())
    }

    /// Get the current signal strength from the device in dBm.
    pub fn read_remote_rssi(&self) -> Result<i16> {
        self.check_connected()?;
        let handle = self.inner.handle;
        let key = OperationKey::connection(OperationKind::ReadRssi, handle);
        let op = Operation::new(key, || self.inner.radio.read_remote_rssi(handle));
        self.inner
            .executor
            .execute_nonnull(op, Some(self.inner.config.operation_timeout))?
            .into_rssi()
    }

    /// Negotiates a new ATT MTU and returns the one accepted by the device.
    pub fn request_mtu(&self, mtu: u16) -> Result<u16> {
        if mtu < DEFAULT_MTU {
            return Err(Error::new(
                ErrorKind::InvalidParameter,
                format!("MTU {mtu} is below the minimum of {DEFAULT_MTU}"),
            ));
        }
        self.check_connected()?;
        let handle = self.inner.handle;
        let key = OperationKey::connection(OperationKind::RequestMtu, handle);
        let op = Operation::new(key, || self.inner.radio.request_mtu(handle, mtu));
        self.inner
            .executor
            .execute_nonnull(op, Some(self.inner.config.operation_timeout))?
            .into_mtu()
    }

    /// Enables notifications (or indications, if notifications are not supported) of value
    /// changes of a characteristic, and returns the observer receiving them.
    ///
    /// Enabling an already enabled characteristic returns the existing observer.
    pub fn enable_notification(&self, characteristic: &Characteristic) -> Result<ChangeObserver> {
        let props = characteristic.properties();
        let (value, notify) = if props.notify {
            (ENABLE_NOTIFICATION_VALUE, true)
        } else if props.indicate {
            (ENABLE_INDICATION_VALUE, false)
        } else {
            return Err(Error::new(
                ErrorKind::NotSupported,
                format!(
                    "characteristic {} supports neither notifications nor indications",
                    characteristic.uuid()
                ),
            ));
        };
        let cccd = characteristic.cccd().ok_or_else(|| {
            Error::new(
                ErrorKind::NotFound,
                format!(
                    "characteristic {} has no client characteristic configuration descriptor",
                    characteristic.uuid()
                ),
            )
        })?;
        self.check_connected()?;

        let char_key = characteristic.key();
        let _setup = self.inner.notification_setup.lock_blocking();
        let observer = {
            let mut observers = self.inner.observers.lock_blocking();
            if let Some(observer) = observers.get(&char_key) {
                return Ok(observer.clone());
            }
            let observer = ChangeObserver::new(char_key);
            observers.insert(char_key, observer.clone());
            observer
        };
        let remove_observer = defer(|| self.remove_observer(&char_key));

        self.write_descriptor_key(&cccd, &value)?;
        // the local flag goes last, the remote side may notify as soon as the CCCD is written
        if notify {
            self.inner
                .radio
                .set_characteristic_notification(self.inner.handle, &char_key, true)?;
        }
        remove_observer.defuse();
        debug!(
            "{} enabled for {} on {}",
            if notify { "notification" } else { "indication" },
            char_key.characteristic,
            self.inner.device
        );
        Ok(observer)
    }

    /// Disables value change pushes of a characteristic and closes its observer.
    pub fn disable_notification(&self, characteristic: &Characteristic) -> Result<()> {
        let char_key = characteristic.key();
        let cccd = characteristic.cccd().ok_or_else(|| {
            Error::new(
                ErrorKind::NotFound,
                format!(
                    "characteristic {} has no client characteristic configuration descriptor",
                    characteristic.uuid()
                ),
            )
        })?;
        self.check_connected()?;
        let _setup = self.inner.notification_setup.lock_blocking();
        let _remove_observer = defer(|| self.remove_observer(&char_key));
        if characteristic.properties().notify {
            if let Err(e) = self.inner.radio.set_characteristic_notification(
                self.inner.handle,
                &char_key,
                false,
            ) {
                warn!("failed to clear the notification flag of {}: {e}", char_key.characteristic);
            }
        }
        self.write_descriptor_key(&cccd, &DISABLE_NOTIFICATION_VALUE)
    }

    /// The observer of a characteristic with enabled notifications.
    pub fn observer(&self, characteristic: &CharacteristicKey) -> Option<ChangeObserver> {
        self.inner
            .observers
            .lock_blocking()
            .get(characteristic)
            .cloned()
    }

    fn remove_observer(&self, key: &CharacteristicKey) {
        if let Some(observer) = self.inner.observers.lock_blocking().remove(key) {
            observer.close();
        }
    }

    /// Registers a function called once when this connection closes, locally or because the
    /// link was lost. If the connection is already closed, it is called immediately.
    pub fn add_close_listener(&self, listener: impl FnOnce(&GattConnection) + Send + 'static) {
        {
            let mut listeners = self.inner.close_listeners.lock_blocking();
            if !self.is_closed() {
                listeners.push(Box::new(listener));
                return;
            }
        }
        listener(self);
    }

    /// Disconnects and releases the session. Calling it again, or on a session that never
    /// connected, does nothing.
    ///
    /// The native handle is released even if the disconnect request fails or times out;
    /// that error is still returned.
    pub fn close(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock_blocking();
            if state.closed || state.closing || !state.connected {
                return Ok(());
            }
            state.closing = true;
        }
        let _release = defer(|| self.release());

        let handle = self.inner.handle;
        let key = OperationKey::connection(OperationKind::Disconnect, handle);
        let op = Operation::new(key, || self.inner.radio.disconnect(handle));
        match self
            .inner
            .executor
            .execute(op, Some(self.inner.config.disconnect_timeout))
        {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("disconnecting {} failed: {e}", self.inner.device);
                Err(e)
            }
        }
    }

    fn check_connected(&self) -> Result<()> {
        let state = self.inner.state.lock_blocking();
        if state.connected && !state.closed {
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::NotConnected,
                format!("{} is not connected", self.inner.device),
            ))
        }
    }

    /// Checks if the connect sequence was given up, see [`GattConnection::abort`].
    pub(crate) fn is_aborted(&self) -> bool {
        let state = self.inner.state.lock_blocking();
        state.closing && !state.connected
    }

    pub(crate) fn mark_connected(&self) {
        let mut state = self.inner.state.lock_blocking();
        state.awaiting_connect_mtu = false;
        if state.closing || state.closed {
            return;
        }
        state.connected = true;
    }

    pub(crate) fn set_awaiting_connect_mtu(&self, awaiting: bool) {
        self.inner.state.lock_blocking().awaiting_connect_mtu = awaiting;
    }

    /// Returns whether the connect operation was waiting for the MTU, and stops waiting.
    pub(crate) fn take_awaiting_connect_mtu(&self) -> bool {
        std::mem::take(&mut self.inner.state.lock_blocking().awaiting_connect_mtu)
    }

    pub(crate) fn set_mtu(&self, mtu: u16) {
        self.inner.state.lock_blocking().mtu = mtu;
    }

    pub(crate) fn store_services(&self, services: Vec<GattService>) {
        self.inner.state.lock_blocking().services = services;
    }

    pub(crate) fn deliver_change(&self, key: &CharacteristicKey, value: Vec<u8>) {
        let observer = self.inner.observers.lock_blocking().get(key).cloned();
        match observer {
            Some(observer) => observer.deliver(value),
            None => debug!(
                "change of {} on {} without observer dropped",
                key.characteristic, self.inner.device
            ),
        }
    }

    /// Tears down a connection that never completed its connect sequence.
    pub(crate) fn abort(&self) {
        // never announced as connected, so no close listeners or disconnection event
        {
            let mut state = self.inner.state.lock_blocking();
            state.connected = false;
            state.closing = true;
        }
        if !self.is_closed() {
            if let Err(e) = self.inner.radio.disconnect(self.inner.handle) {
                debug!("disconnect of half-open {} failed: {e}", self.inner.handle);
            }
        }
        self.release();
    }

    /// Performs the transition to closed: releases the native handle, fails outstanding
    /// operations, closes observers, leaves the registry and fires the close listeners.
    pub(crate) fn release(&self) {
        let handle = self.inner.handle;
        let was_connected = {
            let mut state = self.inner.state.lock_blocking();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::replace(&mut state.connected, false)
        };

        self.inner.radio.close(handle);
        self.inner.executor.fail_target(
            handle,
            Error::new(
                ErrorKind::NotConnected,
                format!("connection to {} closed", self.inner.device),
            ),
        );
        for (_, observer) in self.inner.observers.lock_blocking().drain() {
            observer.close();
        }
        if let Some(shared) = self.inner.manager.upgrade() {
            shared.unregister(handle);
            if was_connected {
                shared.publish(ConnectionEvent::Disconnected(
                    self.inner.device.clone(),
                    handle,
                ));
            }
        }
        info!("connection {handle} to {} closed", self.inner.device);

        if was_connected {
            let listeners = std::mem::take(&mut *self.inner.close_listeners.lock_blocking());
            for listener in listeners {
                listener(self);
            }
        }
    }
}

//! An in-memory [`RadioAdapter`] simulating a set of peripherals.
//!
//! Requests are answered immediately through the [`EventSink`], unless their kind is muted
//! with [`FakeRadio::mute`], in which case the test delivers the outcome itself with
//! [`FakeRadio::emit`]. Every request is recorded and can be inspected with
//! [`FakeRadio::calls`].

use std::collections::{HashMap, HashSet};

use async_lock::Mutex;
use log::debug;
use uuid::Uuid;

use crate::adapter::{ConnectionState, EventSink, RadioAdapter, RadioEvent};
use crate::error::{Error, ErrorKind, GattStatus};
use crate::gatt_tree::{CharacteristicKey, DescriptorKey, GattService};
use crate::{ConnHandle, ConnectionPriority, DeviceId, Result, ScanMode, WriteType};

/// A request received by the [`FakeRadio`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCall {
    Connect(DeviceId),
    Disconnect(ConnHandle),
    Close(ConnHandle),
    DiscoverServices(ConnHandle),
    Refresh(ConnHandle),
    ReadCharacteristic(ConnHandle, CharacteristicKey),
    WriteCharacteristic(ConnHandle, CharacteristicKey, Vec<u8>, WriteType),
    ReadDescriptor(ConnHandle, DescriptorKey),
    WriteDescriptor(ConnHandle, DescriptorKey, Vec<u8>),
    SetNotification(ConnHandle, CharacteristicKey, bool),
    RequestMtu(ConnHandle, u16),
    RequestPriority(ConnHandle, ConnectionPriority),
    ReadRssi(ConnHandle),
    StartScan(Option<Uuid>, ScanMode),
    StopScan,
}

/// Request categories that can be muted or rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Connect,
    Disconnect,
    DiscoverServices,
    ReadCharacteristic,
    WriteCharacteristic,
    ReadDescriptor,
    WriteDescriptor,
    RequestMtu,
    ReadRssi,
    Scan,
}

/// A simulated remote device.
#[derive(Debug, Clone)]
pub struct FakePeripheral {
    pub id: DeviceId,
    pub services: Vec<GattService>,
    pub advertised: Vec<Uuid>,
    pub rssi: i16,
    pub bonded: bool,
    /// Only found by low-power scans, as if it advertised too rarely for a short window.
    pub low_power_only: bool,
    /// Number of upcoming connect attempts failing with [`GattStatus::GATT_ERROR`].
    pub failed_connects: usize,
    /// Number of upcoming discoveries failing with [`GattStatus::GATT_ERROR`].
    pub failed_discoveries: usize,
    /// Number of upcoming connection priority requests rejected.
    pub priority_rejections: usize,
    pub max_mtu: u16,
    pub mtu_status: GattStatus,
    values: HashMap<CharacteristicKey, Vec<u8>>,
    descriptor_values: HashMap<DescriptorKey, Vec<u8>>,
}

impl FakePeripheral {
    pub fn new(id: impl Into<DeviceId>) -> Self {
        Self {
            id: id.into(),
            services: Vec::new(),
            advertised: Vec::new(),
            rssi: -60,
            bonded: false,
            low_power_only: false,
            failed_connects: 0,
            failed_discoveries: 0,
            priority_rejections: 0,
            max_mtu: 517,
            mtu_status: GattStatus::SUCCESS,
            values: HashMap::new(),
            descriptor_values: HashMap::new(),
        }
    }

    pub fn service(mut self, service: GattService) -> Self {
        self.services.push(service);
        self
    }

    pub fn advertise(mut self, uuid: Uuid) -> Self {
        self.advertised.push(uuid);
        self
    }

    pub fn bonded(mut self, bonded: bool) -> Self {
        self.bonded = bonded;
        self
    }

    pub fn low_power_only(mut self, low_power_only: bool) -> Self {
        self.low_power_only = low_power_only;
        self
    }

    pub fn failed_connects(mut self, count: usize) -> Self {
        self.failed_connects = count;
        self
    }

    pub fn failed_discoveries(mut self, count: usize) -> Self {
        self.failed_discoveries = count;
        self
    }

    pub fn priority_rejections(mut self, count: usize) -> Self {
        self.priority_rejections = count;
        self
    }

    pub fn mtu_status(mut self, status: GattStatus) -> Self {
        self.mtu_status = status;
        self
    }

    pub fn value(mut self, key: CharacteristicKey, value: Vec<u8>) -> Self {
        self.values.insert(key, value);
        self
    }
}

struct FakeState {
    peripherals: Vec<FakePeripheral>,
    links: HashMap<ConnHandle, DeviceId>,
    next_handle: u32,
    calls: Vec<RadioCall>,
    muted: HashSet<CallKind>,
    rejected: HashSet<CallKind>,
    scan_error: Option<i32>,
}

impl FakeState {
    fn peripheral(&mut self, handle: ConnHandle) -> Option<&mut FakePeripheral> {
        let id = self.links.get(&handle)?.clone();
        self.peripherals.iter_mut().find(|p| p.id == id)
    }
}

/// See the [module documentation](self).
pub struct FakeRadio {
    sink: EventSink,
    state: Mutex<FakeState>,
}

impl FakeRadio {
    pub fn new(sink: EventSink) -> Self {
        Self {
            sink,
            state: Mutex::new(FakeState {
                peripherals: Vec::new(),
                links: HashMap::new(),
                next_handle: 1,
                calls: Vec::new(),
                muted: HashSet::new(),
                rejected: HashSet::new(),
                scan_error: None,
            }),
        }
    }

    pub fn add_peripheral(&self, peripheral: FakePeripheral) {
        self.state.lock_blocking().peripherals.push(peripheral);
    }

    /// Accepts requests of `kind` without answering them.
    pub fn mute(&self, kind: CallKind) {
        self.state.lock_blocking().muted.insert(kind);
    }

    pub fn unmute(&self, kind: CallKind) {
        self.state.lock_blocking().muted.remove(&kind);
    }

    /// Makes requests of `kind` fail synchronously.
    pub fn reject(&self, kind: CallKind) {
        self.state.lock_blocking().rejected.insert(kind);
    }

    /// Makes scans fail with `error_code`.
    pub fn fail_scans(&self, error_code: i32) {
        self.state.lock_blocking().scan_error = Some(error_code);
    }

    /// Delivers an event as if the radio reported it.
    pub fn emit(&self, event: RadioEvent) {
        self.sink.send(event);
    }

    /// Pushes a value change of a characteristic.
    pub fn notify(&self, handle: ConnHandle, key: CharacteristicKey, value: Vec<u8>) {
        self.emit(RadioEvent::CharacteristicChanged { handle, key, value });
    }

    /// Reports the loss of an established link.
    pub fn drop_link(&self, handle: ConnHandle, status: GattStatus) {
        self.emit(RadioEvent::ConnectionStateChanged {
            handle,
            status,
            state: ConnectionState::Disconnected,
        });
    }

    /// All requests received so far.
    pub fn calls(&self) -> Vec<RadioCall> {
        self.state.lock_blocking().calls.clone()
    }

    /// Number of recorded requests matching `pred`.
    pub fn count(&self, pred: impl Fn(&RadioCall) -> bool) -> usize {
        self.state.lock_blocking().calls.iter().filter(|c| pred(c)).count()
    }

    /// Handles of the native sessions not released yet.
    pub fn open_handles(&self) -> Vec<ConnHandle> {
        let mut handles: Vec<_> = self.state.lock_blocking().links.keys().copied().collect();
        handles.sort();
        handles
    }

    /// Records `call` and tells whether it should be answered.
    fn accept(&self, state: &mut FakeState, call: RadioCall, kind: CallKind) -> Result<bool> {
        debug!("fake radio: {call:?}");
        state.calls.push(call);
        if state.rejected.contains(&kind) {
            return Err(Error::new(
                ErrorKind::Internal,
                format!("{kind:?} request rejected by the radio"),
            ));
        }
        Ok(!state.muted.contains(&kind))
    }
}

impl RadioAdapter for FakeRadio {
    fn connect(&self, device: &DeviceId, _auto_connect: bool) -> Result<ConnHandle> {
        let mut state = self.state.lock_blocking();
        let respond = self.accept(&mut state, RadioCall::Connect(device.clone()), CallKind::Connect)?;
        let handle = ConnHandle(state.next_handle);
        state.next_handle += 1;
        state.links.insert(handle, device.clone());
        if !respond {
            return Ok(handle);
        }
        let connected = match state.peripherals.iter_mut().find(|p| &p.id == device) {
            Some(p) if p.failed_connects > 0 => {
                p.failed_connects -= 1;
                false
            }
            Some(_) => true,
            None => false,
        };
        self.sink.send(RadioEvent::ConnectionStateChanged {
            handle,
            status: if connected {
                GattStatus::SUCCESS
            } else {
                GattStatus::GATT_ERROR
            },
            state: if connected {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            },
        });
        Ok(handle)
    }

    fn disconnect(&self, handle: ConnHandle) -> Result<()> {
        let mut state = self.state.lock_blocking();
        if self.accept(&mut state, RadioCall::Disconnect(handle), CallKind::Disconnect)?
            && state.links.contains_key(&handle)
        {
            self.sink.send(RadioEvent::ConnectionStateChanged {
                handle,
                status: GattStatus::SUCCESS,
                state: ConnectionState::Disconnected,
            });
        }
        Ok(())
    }

    fn close(&self, handle: ConnHandle) {
        let mut state = self.state.lock_blocking();
        state.calls.push(RadioCall::Close(handle));
        state.links.remove(&handle);
    }

    fn discover_services(&self, handle: ConnHandle) -> Result<()> {
        let mut state = self.state.lock_blocking();
        if !self.accept(
            &mut state,
            RadioCall::DiscoverServices(handle),
            CallKind::DiscoverServices,
        )? {
            return Ok(());
        }
        let Some(p) = state.peripheral(handle) else {
            return Ok(());
        };
        let status = if p.failed_discoveries > 0 {
            p.failed_discoveries -= 1;
            GattStatus::GATT_ERROR
        } else {
            GattStatus::SUCCESS
        };
        let services = p.services.clone();
        self.sink.send(RadioEvent::ServicesDiscovered {
            handle,
            status,
            services,
        });
        Ok(())
    }

    fn refresh(&self, handle: ConnHandle) -> Result<()> {
        self.state.lock_blocking().calls.push(RadioCall::Refresh(handle));
        Ok(())
    }

    fn read_characteristic(&self, handle: ConnHandle, key: &CharacteristicKey) -> Result<()> {
        let mut state = self.state.lock_blocking();
        let call = RadioCall::ReadCharacteristic(handle, *key);
        if !self.accept(&mut state, call, CallKind::ReadCharacteristic)? {
            return Ok(());
        }
        let value = state
            .peripheral(handle)
            .and_then(|p| p.values.get(key).cloned())
            .unwrap_or_default();
        self.sink.send(RadioEvent::CharacteristicRead {
            handle,
            key: *key,
            status: GattStatus::SUCCESS,
            value,
        });
        Ok(())
    }

    fn write_characteristic(
        &self,
        handle: ConnHandle,
        key: &CharacteristicKey,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        let mut state = self.state.lock_blocking();
        let call = RadioCall::WriteCharacteristic(handle, *key, value.to_vec(), write_type);
        if !self.accept(&mut state, call, CallKind::WriteCharacteristic)? {
            return Ok(());
        }
        if let Some(p) = state.peripheral(handle) {
            p.values.insert(*key, value.to_vec());
        }
        self.sink.send(RadioEvent::CharacteristicWrite {
            handle,
            key: *key,
            status: GattStatus::SUCCESS,
        });
        Ok(())
    }

    fn read_descriptor(&self, handle: ConnHandle, key: &DescriptorKey) -> Result<()> {
        let mut state = self.state.lock_blocking();
        let call = RadioCall::ReadDescriptor(handle, *key);
        if !self.accept(&mut state, call, CallKind::ReadDescriptor)? {
            return Ok(());
        }
        let value = state
            .peripheral(handle)
            .and_then(|p| p.descriptor_values.get(key).cloned())
            .unwrap_or_default();
        self.sink.send(RadioEvent::DescriptorRead {
            handle,
            key: *key,
            status: GattStatus::SUCCESS,
            value,
        });
        Ok(())
    }

    fn write_descriptor(&self, handle: ConnHandle, key: &DescriptorKey, value: &[u8]) -> Result<()> {
        let mut state = self.state.lock_blocking();
        let call = RadioCall::WriteDescriptor(handle, *key, value.to_vec());
        if !self.accept(&mut state, call, CallKind::WriteDescriptor)? {
            return Ok(());
        }
        if let Some(p) = state.peripheral(handle) {
            p.descriptor_values.insert(*key, value.to_vec());
        }
        self.sink.send(RadioEvent::DescriptorWrite {
            handle,
            key: *key,
            status: GattStatus::SUCCESS,
        });
        Ok(())
    }

    fn set_characteristic_notification(
        &self,
        handle: ConnHandle,
        key: &CharacteristicKey,
        enable: bool,
    ) -> Result<()> {
        self.state
            .lock_blocking()
            .calls
            .push(RadioCall::SetNotification(handle, *key, enable));
        Ok(())
    }

    fn request_mtu(&self, handle: ConnHandle, mtu: u16) -> Result<()> {
        let mut state = self.state.lock_blocking();
        if !self.accept(&mut state, RadioCall::RequestMtu(handle, mtu), CallKind::RequestMtu)? {
            return Ok(());
        }
        let (status, mtu) = match state.peripheral(handle) {
            Some(p) => (p.mtu_status, mtu.min(p.max_mtu)),
            None => (GattStatus::GATT_ERROR, mtu),
        };
        self.sink.send(RadioEvent::MtuChanged {
            handle,
            status,
            mtu,
        });
        Ok(())
    }

    fn request_connection_priority(&self, handle: ConnHandle, priority: ConnectionPriority) -> bool {
        let mut state = self.state.lock_blocking();
        state.calls.push(RadioCall::RequestPriority(handle, priority));
        match state.peripheral(handle) {
            Some(p) if p.priority_rejections > 0 => {
                p.priority_rejections -= 1;
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    fn read_remote_rssi(&self, handle: ConnHandle) -> Result<()> {
        let mut state = self.state.lock_blocking();
        if !self.accept(&mut state, RadioCall::ReadRssi(handle), CallKind::ReadRssi)? {
            return Ok(());
        }
        if let Some(rssi) = state.peripheral(handle).map(|p| p.rssi) {
            self.sink.send(RadioEvent::RssiRead {
                handle,
                status: GattStatus::SUCCESS,
                rssi,
            });
        }
        Ok(())
    }

    fn start_scan(&self, service: Option<Uuid>, mode: ScanMode) -> Result<()> {
        let mut state = self.state.lock_blocking();
        if !self.accept(&mut state, RadioCall::StartScan(service, mode), CallKind::Scan)? {
            return Ok(());
        }
        if let Some(error_code) = state.scan_error {
            self.sink.send(RadioEvent::ScanFailed { error_code });
            return Ok(());
        }
        let found = state.peripherals.iter().find(|p| {
            service.map_or(true, |uuid| p.advertised.contains(&uuid))
                && (mode == ScanMode::LowPower || !p.low_power_only)
        });
        if let Some(p) = found {
            self.sink.send(RadioEvent::ScanResult {
                device: p.id.clone(),
                rssi: p.rssi,
            });
        }
        Ok(())
    }

    fn stop_scan(&self) {
        self.state.lock_blocking().calls.push(RadioCall::StopScan);
    }

    fn is_bonded(&self, device: &DeviceId) -> bool {
        self.state
            .lock_blocking()
            .peripherals
            .iter()
            .any(|p| &p.id == device && p.bonded)
    }
}

//! The radio-facing side of the crate: what a Bluetooth stack must provide, and how it
//! reports completions back.

use uuid::Uuid;

use crate::error::GattStatus;
use crate::executor::{EventClock, EventSeq};
use crate::gatt_tree::{CharacteristicKey, DescriptorKey, GattService};
use crate::{ConnHandle, ConnectionPriority, DeviceId, Result, ScanMode, WriteType};

/// Capabilities of the underlying radio stack.
///
/// Every request method only *issues* the request; an `Ok` return means the stack accepted
/// it, and the outcome is reported later through the [`EventSink`] handed to the adapter.
/// Methods are called from application threads and must not block on the outcome.
pub trait RadioAdapter: Send + Sync {
    /// Starts connecting to `device` and returns the handle of the new native session.
    fn connect(&self, device: &DeviceId, auto_connect: bool) -> Result<ConnHandle>;

    /// Requests disconnection. Completes with [`RadioEvent::ConnectionStateChanged`].
    fn disconnect(&self, handle: ConnHandle) -> Result<()>;

    /// Releases the native session. No event is delivered for `handle` afterwards.
    fn close(&self, handle: ConnHandle);

    /// Starts service discovery. Completes with [`RadioEvent::ServicesDiscovered`].
    fn discover_services(&self, handle: ConnHandle) -> Result<()>;

    /// Clears the stack's attribute cache of the device.
    fn refresh(&self, handle: ConnHandle) -> Result<()>;

    fn read_characteristic(&self, handle: ConnHandle, key: &CharacteristicKey) -> Result<()>;

    fn write_characteristic(
        &self,
        handle: ConnHandle,
        key: &CharacteristicKey,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<()>;

    fn read_descriptor(&self, handle: ConnHandle, key: &DescriptorKey) -> Result<()>;

    fn write_descriptor(&self, handle: ConnHandle, key: &DescriptorKey, value: &[u8])
        -> Result<()>;

    /// Toggles local delivery of [`RadioEvent::CharacteristicChanged`] for a characteristic.
    fn set_characteristic_notification(
        &self,
        handle: ConnHandle,
        key: &CharacteristicKey,
        enable: bool,
    ) -> Result<()>;

    /// Starts MTU negotiation. Completes with [`RadioEvent::MtuChanged`].
    fn request_mtu(&self, handle: ConnHandle, mtu: u16) -> Result<()>;

    /// Requests connection parameters. Returns `false` when the stack rejects the request,
    /// which it does until its internal service binding of a new connection is complete.
    fn request_connection_priority(&self, handle: ConnHandle, priority: ConnectionPriority)
        -> bool;

    /// Completes with [`RadioEvent::RssiRead`].
    fn read_remote_rssi(&self, handle: ConnHandle) -> Result<()>;

    /// Starts scanning for devices advertising `service`. Results are reported with
    /// [`RadioEvent::ScanResult`] or [`RadioEvent::ScanFailed`].
    fn start_scan(&self, service: Option<Uuid>, mode: ScanMode) -> Result<()>;

    fn stop_scan(&self);

    /// The pairing status of `device`.
    fn is_bonded(&self, device: &DeviceId) -> bool;
}

/// Connection state reported by the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Asynchronous completions and unsolicited events delivered by the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    ConnectionStateChanged {
        handle: ConnHandle,
        status: GattStatus,
        state: ConnectionState,
    },
    ServicesDiscovered {
        handle: ConnHandle,
        status: GattStatus,
        services: Vec<GattService>,
    },
    CharacteristicRead {
        handle: ConnHandle,
        key: CharacteristicKey,
        status: GattStatus,
        value: Vec<u8>,
    },
    CharacteristicWrite {
        handle: ConnHandle,
        key: CharacteristicKey,
        status: GattStatus,
    },
    DescriptorRead {
        handle: ConnHandle,
        key: DescriptorKey,
        status: GattStatus,
        value: Vec<u8>,
    },
    DescriptorWrite {
        handle: ConnHandle,
        key: DescriptorKey,
        status: GattStatus,
    },
    MtuChanged {
        handle: ConnHandle,
        status: GattStatus,
        mtu: u16,
    },
    RssiRead {
        handle: ConnHandle,
        status: GattStatus,
        rssi: i16,
    },
    CharacteristicChanged {
        handle: ConnHandle,
        key: CharacteristicKey,
        value: Vec<u8>,
    },
    ScanResult {
        device: DeviceId,
        rssi: i16,
    },
    ScanFailed {
        error_code: i32,
    },
}

/// Where a [`RadioAdapter`] sends its events. Cheap to clone, usable from any thread.
///
/// Each event is stamped in the order it is sent, which tells the manager whether a
/// completion belongs to the request currently waiting or to an earlier one.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: async_channel::Sender<(EventSeq, RadioEvent)>,
    clock: EventClock,
}

/// The receiving end of an [`EventSink`], consumed by the connection manager.
#[derive(Debug)]
pub struct EventReceiver {
    pub(crate) receiver: async_channel::Receiver<(EventSeq, RadioEvent)>,
    pub(crate) clock: EventClock,
}

/// Creates a connected sink/receiver pair.
pub fn event_channel() -> (EventSink, EventReceiver) {
    let (sender, receiver) = async_channel::unbounded();
    let clock = EventClock::new();
    (
        EventSink {
            sender,
            clock: clock.clone(),
        },
        EventReceiver { receiver, clock },
    )
}

impl EventSink {
    /// Delivers an event. Events sent after the manager is dropped are discarded.
    pub fn send(&self, event: RadioEvent) {
        let seq = self.clock.tick();
        if self.sender.try_send((seq, event)).is_err() {
            log::debug!("radio event dropped, the dispatcher is gone");
        }
    }
}

//! Blocking GATT client sessions on top of a callback-driven Bluetooth LE radio.
//!
//! The radio stack is injected as a [`RadioAdapter`], which reports the outcome of every
//! request through an [`EventSink`]. A [`GattConnectionManager`] drains those events on
//! its own dispatch thread and completes the matching blocked call, so that application
//! code can simply write:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use gatt_bridge::*;
//! # use gatt_bridge::fake::FakeRadio;
//! # fn main() -> gatt_bridge::Result<()> {
//! let (sink, events) = event_channel();
//! let radio = Arc::new(FakeRadio::new(sink));
//! let manager = GattConnectionManager::new(radio, events, ManagerConfig::default())?;
//!
//! let heart_rate = Uuid::from_u16(0x180d);
//! let conn = manager.auto_connect(heart_rate, ConnectOptions::default().mtu(247))?;
//! let measurement = conn.get_characteristic(heart_rate, Uuid::from_u16(0x2a37))?;
//! let observer = conn.enable_notification(&measurement)?;
//! let value = observer.wait_for_update(std::time::Duration::from_secs(5))?;
//! # let _ = value;
//! conn.close()?;
//! # Ok(())
//! # }
//! ```

pub use adapter::{event_channel, ConnectionState, EventReceiver, EventSink, RadioAdapter, RadioEvent};
pub use btuuid::BluetoothUuidExt;
pub use characteristic::Characteristic;
pub use config::ManagerConfig;
pub use connection::{GattConnection, DEFAULT_MTU};
pub use descriptor::Descriptor;
pub use error::{Error, ErrorKind, GattStatus};
pub use gatt_tree::{
    AttributeKey, CharacteristicKey, DescriptorKey, GattCharacteristic, GattDescriptor,
    GattService, ServiceKey,
};
pub use manager::{DiscoveredDevice, GattConnectionManager};
pub use observer::ChangeObserver;
pub use service::Service;

/// Convenience alias for a result with [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

pub use uuid::Uuid;
pub mod btuuid;
pub mod error;
pub mod executor;
pub mod fake;
mod types;
pub use types::*;

mod adapter;
mod async_util;
mod characteristic;
mod config;
mod connection;
mod descriptor;
mod gatt_tree;
mod manager;
mod observer;
mod service;
mod util;

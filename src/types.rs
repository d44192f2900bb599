use std::time::Duration;

/// A platform-specific device identifier, usually the Bluetooth address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceId(pub(crate) String);

impl DeviceId {
    /// Creates a device identifier from its textual form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the textual form of this identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Opaque handle of a native GATT client session, assigned by the radio on `connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnHandle(pub u32);

impl std::fmt::Display for ConnHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// GATT characteristic properties as defined in the Bluetooth Core Specification, Vol 3, Part G, §3.3.1.1.
///
/// Extended properties are not supported.
#[allow(missing_docs)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicProperties {
    pub broadcast: bool,
    pub read: bool,
    pub write_without_response: bool,
    pub write: bool,
    pub notify: bool,
    pub indicate: bool,
    pub authenticated_signed_writes: bool,
}

impl CharacteristicProperties {
    /// Raw transmutation from [`u32`].
    pub fn from_bits(bits: u32) -> Self {
        CharacteristicProperties {
            broadcast: (bits & (1 << 0)) != 0,
            read: (bits & (1 << 1)) != 0,
            write_without_response: (bits & (1 << 2)) != 0,
            write: (bits & (1 << 3)) != 0,
            notify: (bits & (1 << 4)) != 0,
            indicate: (bits & (1 << 5)) != 0,
            authenticated_signed_writes: (bits & (1 << 6)) != 0,
        }
    }

    /// Raw transmutation to [`u32`].
    pub fn to_bits(self) -> u32 {
        u32::from(self.broadcast)
            | (u32::from(self.read) << 1)
            | (u32::from(self.write_without_response) << 2)
            | (u32::from(self.write) << 3)
            | (u32::from(self.notify) << 4)
            | (u32::from(self.indicate) << 5)
            | (u32::from(self.authenticated_signed_writes) << 6)
    }

    /// Checks if either kind of write is allowed.
    pub fn is_writable(&self) -> bool {
        self.write || self.write_without_response
    }
}

/// Write type of a characteristic write request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteType {
    /// Write request, acknowledged by the remote device.
    WithResponse,
    /// Write command, not acknowledged.
    WithoutResponse,
}

/// Requested connection parameter set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionPriority {
    /// Default parameters recommended by the stack.
    Balanced,
    /// Short connection interval for high throughput and low latency.
    High,
    /// Long connection interval for reduced power consumption.
    LowPower,
}

/// Scan power mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ScanMode {
    /// Scans continuously. Finds devices fast, drains the battery.
    LowLatency,
    /// Scans with a long duty cycle.
    LowPower,
}

/// Options for a single connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConnectOptions {
    /// Let the radio connect whenever the device becomes available.
    pub auto_connect: bool,
    /// Connection priority to request once the link is up.
    pub priority: Option<ConnectionPriority>,
    /// MTU to negotiate before the connection is reported as established.
    pub mtu: Option<u16>,
    /// Deadline for the whole connect sequence.
    pub timeout: Duration,
    /// Refresh the attribute cache on a failed discovery even if the device is not
    /// known to change its services.
    pub force_refresh: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            auto_connect: false,
            priority: None,
            mtu: None,
            timeout: Duration::from_secs(30),
            force_refresh: false,
        }
    }
}

impl ConnectOptions {
    /// Sets the `auto_connect` flag.
    pub fn auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    /// Requests a connection priority after connecting.
    pub fn priority(mut self, priority: ConnectionPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Requests an MTU after connecting.
    pub fn mtu(mut self, mtu: u16) -> Self {
        self.mtu = Some(mtu);
        self
    }

    /// Sets the connect timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the forced cache refresh flag.
    pub fn force_refresh(mut self, force_refresh: bool) -> Self {
        self.force_refresh = force_refresh;
        self
    }
}

/// Connection lifecycle notifications published by the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A session was established.
    Connected(DeviceId, ConnHandle),
    /// A session was closed, locally or by the remote side.
    Disconnected(DeviceId, ConnHandle),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn property_bits() {
        let props = CharacteristicProperties::from_bits(0x1a);
        assert!(props.read);
        assert!(props.write);
        assert!(props.notify);
        assert!(!props.indicate);
        assert!(!props.write_without_response);
        assert_eq!(props.to_bits(), 0x1a);
        assert!(props.is_writable());
        assert!(!CharacteristicProperties::from_bits(0x02).is_writable());
    }
}

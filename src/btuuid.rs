//! Bluetooth SIG base UUID helpers and the few assigned numbers this crate relies on.

use uuid::Uuid;

/// The Bluetooth Base UUID, `00000000-0000-1000-8000-00805F9B34FB`.
pub const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

/// Builds a full [`Uuid`] from a 16-bit assigned number.
pub const fn bluetooth_uuid_from_u16(uuid: u16) -> Uuid {
    Uuid::from_u128(((uuid as u128) << 96) | BLUETOOTH_BASE_UUID)
}

/// Extension trait for [`Uuid`] with helper methods for Bluetooth UUIDs.
pub trait BluetoothUuidExt: private::Sealed {
    /// Creates a new [`Uuid`] from a 16-bit Bluetooth UUID.
    fn from_u16(uuid: u16) -> Self;

    /// Returns the 16-bit form of this UUID if it is derived from the Bluetooth Base UUID.
    fn try_to_u16(&self) -> Option<u16>;
}

impl BluetoothUuidExt for Uuid {
    fn from_u16(uuid: u16) -> Self {
        bluetooth_uuid_from_u16(uuid)
    }

    fn try_to_u16(&self) -> Option<u16> {
        let value = self.as_u128();
        (value & !(0xffff_u128 << 96) == BLUETOOTH_BASE_UUID).then_some((value >> 96) as u16)
    }
}

mod private {
    use uuid::Uuid;

    pub trait Sealed {}

    impl Sealed for Uuid {}
}

pub mod services {
    //! Assigned service UUIDs.
    use super::*;

    pub const GENERIC_ACCESS: Uuid = bluetooth_uuid_from_u16(0x1800);
    pub const GENERIC_ATTRIBUTE: Uuid = bluetooth_uuid_from_u16(0x1801);
}

pub mod characteristics {
    //! Assigned characteristic UUIDs.
    use super::*;

    pub const SERVICE_CHANGED: Uuid = bluetooth_uuid_from_u16(0x2a05);
}

pub mod descriptors {
    //! Assigned descriptor UUIDs.
    use super::*;

    pub const CLIENT_CHARACTERISTIC_CONFIGURATION: Uuid = bluetooth_uuid_from_u16(0x2902);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_form() {
        let cccd = descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION;
        assert_eq!(
            cccd.to_string(),
            "00002902-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(cccd.try_to_u16(), Some(0x2902));
        assert_eq!(Uuid::from_u128(1).try_to_u16(), None);
    }
}

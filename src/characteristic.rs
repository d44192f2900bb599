use crate::btuuid::descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION;
use crate::descriptor::Descriptor;
use crate::gatt_tree::{CharacteristicKey, DescriptorKey, GattCharacteristic};
use crate::{CharacteristicProperties, Uuid};

/// A Bluetooth GATT characteristic.
///
/// This is a snapshot of the attribute table; reads, writes and notifications go through
/// [`crate::GattConnection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    key: CharacteristicKey,
    properties: CharacteristicProperties,
    descriptors: Vec<Descriptor>,
}

impl std::hash::Hash for Characteristic {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl Characteristic {
    pub(crate) fn from_table(service: Uuid, characteristic: &GattCharacteristic) -> Self {
        let key = CharacteristicKey {
            service,
            characteristic: characteristic.uuid,
        };
        Self {
            key,
            properties: characteristic.properties,
            descriptors: characteristic
                .descriptors
                .iter()
                .map(|desc| Descriptor::new(key.descriptor(desc.uuid)))
                .collect(),
        }
    }

    /// The [Uuid] identifying the type of this GATT characteristic.
    pub fn uuid(&self) -> Uuid {
        self.key.characteristic
    }

    /// The [Uuid] of the service containing this characteristic.
    pub fn service_uuid(&self) -> Uuid {
        self.key.service
    }

    pub fn key(&self) -> CharacteristicKey {
        self.key
    }

    /// The properties of this this GATT characteristic.
    ///
    /// Characteristic properties indicate which operations (e.g. read, write, notify, etc)
    /// may be performed on this characteristic.
    pub fn properties(&self) -> CharacteristicProperties {
        self.properties
    }

    /// The descriptors of this characteristic.
    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    /// The client characteristic configuration descriptor, if the characteristic has one.
    pub fn cccd(&self) -> Option<DescriptorKey> {
        self.descriptors
            .iter()
            .find(|d| d.uuid() == CLIENT_CHARACTERISTIC_CONFIGURATION)
            .map(Descriptor::key)
    }
}

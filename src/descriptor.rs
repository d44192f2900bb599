use crate::gatt_tree::{CharacteristicKey, DescriptorKey};
use crate::Uuid;

/// A Bluetooth GATT descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Descriptor {
    key: DescriptorKey,
}

impl Descriptor {
    pub(crate) fn new(key: DescriptorKey) -> Self {
        Self { key }
    }

    /// The [Uuid] identifying the type of this GATT descriptor.
    pub fn uuid(&self) -> Uuid {
        self.key.descriptor
    }

    pub fn key(&self) -> DescriptorKey {
        self.key
    }

    /// The characteristic this descriptor belongs to.
    pub fn characteristic(&self) -> CharacteristicKey {
        self.key.characteristic()
    }
}

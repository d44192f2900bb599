use crate::characteristic::Characteristic;
use crate::gatt_tree::{GattService, ServiceKey};
use crate::Uuid;

/// A Bluetooth GATT service, as found in a connection's discovered attribute table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    key: ServiceKey,
    is_primary: bool,
    characteristics: Vec<Characteristic>,
}

impl std::hash::Hash for Service {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl Service {
    pub(crate) fn from_table(service: &GattService) -> Self {
        let key = ServiceKey {
            service: service.uuid,
        };
        Self {
            key,
            is_primary: service.is_primary,
            characteristics: service
                .characteristics
                .iter()
                .map(|ch| Characteristic::from_table(key.service, ch))
                .collect(),
        }
    }

    /// The [Uuid] identifying the type of this GATT service.
    pub fn uuid(&self) -> Uuid {
        self.key.service
    }

    pub fn key(&self) -> ServiceKey {
        self.key
    }

    /// Whether this is a primary service of the device.
    pub fn is_primary(&self) -> bool {
        self.is_primary
    }

    /// The characteristics of this service.
    pub fn characteristics(&self) -> &[Characteristic] {
        &self.characteristics
    }
}

//! The cached attribute table of a connection, and value-typed keys into it.

use uuid::Uuid;

use crate::btuuid;
use crate::error::{Error, ErrorKind};
use crate::{CharacteristicProperties, Result};

/// A service entry of the attribute table reported by the radio after discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub is_primary: bool,
    pub characteristics: Vec<GattCharacteristic>,
}

/// A characteristic entry of the attribute table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub descriptors: Vec<GattDescriptor>,
}

/// A descriptor entry of the attribute table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattDescriptor {
    pub uuid: Uuid,
}

impl GattService {
    pub fn new(uuid: Uuid, characteristics: Vec<GattCharacteristic>) -> Self {
        Self {
            uuid,
            is_primary: true,
            characteristics,
        }
    }
}

impl GattCharacteristic {
    pub fn new(
        uuid: Uuid,
        properties: CharacteristicProperties,
        descriptors: Vec<GattDescriptor>,
    ) -> Self {
        Self {
            uuid,
            properties,
            descriptors,
        }
    }
}

impl GattDescriptor {
    pub fn new(uuid: Uuid) -> Self {
        Self { uuid }
    }
}

/// Identifies a service of a connection by UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceKey {
    pub service: Uuid,
}

/// Identifies a characteristic of a connection by its (service, characteristic) UUIDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CharacteristicKey {
    pub service: Uuid,
    pub characteristic: Uuid,
}

/// Identifies a descriptor of a connection by its (service, characteristic, descriptor) UUIDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DescriptorKey {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub descriptor: Uuid,
}

impl CharacteristicKey {
    pub fn descriptor(&self, descriptor: Uuid) -> DescriptorKey {
        DescriptorKey {
            service: self.service,
            characteristic: self.characteristic,
            descriptor,
        }
    }
}

impl DescriptorKey {
    pub fn characteristic(&self) -> CharacteristicKey {
        CharacteristicKey {
            service: self.service,
            characteristic: self.characteristic,
        }
    }
}

/// An attribute that may be the target of a read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AttributeKey {
    Characteristic(CharacteristicKey),
    Descriptor(DescriptorKey),
}

/// Returns the only element of `iter`, or the lookup error describing why there isn't one.
fn single<'a, T>(mut iter: impl Iterator<Item = &'a T>, what: &str, uuid: Uuid) -> Result<&'a T> {
    let Some(first) = iter.next() else {
        return Err(Error::new(ErrorKind::NotFound, format!("no {what} {uuid}")));
    };
    if iter.next().is_some() {
        return Err(Error::new(
            ErrorKind::AmbiguousMatch,
            format!("more than one {what} {uuid}"),
        ));
    }
    Ok(first)
}

pub(crate) fn find_service(services: &[GattService], uuid: Uuid) -> Result<&GattService> {
    single(services.iter().filter(|s| s.uuid == uuid), "service", uuid)
}

pub(crate) fn find_characteristic(
    services: &[GattService],
    service: Uuid,
    characteristic: Uuid,
) -> Result<&GattCharacteristic> {
    let service = find_service(services, service)?;
    single(
        service
            .characteristics
            .iter()
            .filter(|c| c.uuid == characteristic),
        "characteristic",
        characteristic,
    )
}

pub(crate) fn find_descriptor<'a>(
    services: &'a [GattService],
    key: &DescriptorKey,
) -> Result<&'a GattDescriptor> {
    let characteristic = find_characteristic(services, key.service, key.characteristic)?;
    single(
        characteristic
            .descriptors
            .iter()
            .filter(|d| d.uuid == key.descriptor),
        "descriptor",
        key.descriptor,
    )
}

/// Checks if the table advertises the Service Changed characteristic, meaning a bonded
/// peer may change its attribute layout between connections.
pub(crate) fn has_service_changed(services: &[GattService]) -> bool {
    services
        .iter()
        .filter(|s| s.uuid == btuuid::services::GENERIC_ATTRIBUTE)
        .flat_map(|s| s.characteristics.iter())
        .any(|c| c.uuid == btuuid::characteristics::SERVICE_CHANGED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btuuid::BluetoothUuidExt;

    fn table() -> Vec<GattService> {
        let props = CharacteristicProperties::from_bits(0x02);
        vec![
            GattService::new(
                Uuid::from_u16(0x180d),
                vec![
                    GattCharacteristic::new(Uuid::from_u16(0x2a37), props, vec![]),
                    GattCharacteristic::new(Uuid::from_u16(0x2a38), props, vec![]),
                    GattCharacteristic::new(Uuid::from_u16(0x2a38), props, vec![]),
                ],
            ),
            GattService::new(Uuid::from_u16(0x180f), vec![]),
            GattService::new(Uuid::from_u16(0x180f), vec![]),
        ]
    }

    #[test]
    fn lookup_by_uuid() {
        let services = table();
        assert!(find_service(&services, Uuid::from_u16(0x180d)).is_ok());
        assert_eq!(
            find_service(&services, Uuid::from_u16(0x1810))
                .unwrap_err()
                .kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            find_service(&services, Uuid::from_u16(0x180f))
                .unwrap_err()
                .kind(),
            ErrorKind::AmbiguousMatch
        );
        assert!(
            find_characteristic(&services, Uuid::from_u16(0x180d), Uuid::from_u16(0x2a37)).is_ok()
        );
        assert_eq!(
            find_characteristic(&services, Uuid::from_u16(0x180d), Uuid::from_u16(0x2a38))
                .unwrap_err()
                .kind(),
            ErrorKind::AmbiguousMatch
        );
    }

    #[test]
    fn service_changed_marker() {
        let mut services = table();
        assert!(!has_service_changed(&services));
        services.push(GattService::new(
            btuuid::services::GENERIC_ATTRIBUTE,
            vec![GattCharacteristic::new(
                btuuid::characteristics::SERVICE_CHANGED,
                CharacteristicProperties::from_bits(0x20),
                vec![],
            )],
        ));
        assert!(has_service_changed(&services));
    }
}

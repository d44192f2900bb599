#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use gatt_bridge::btuuid::{characteristics, descriptors, services};
use gatt_bridge::fake::{FakePeripheral, FakeRadio};
use gatt_bridge::*;

pub const HEART_RATE: Uuid = btuuid::bluetooth_uuid_from_u16(0x180d);
pub const MEASUREMENT: Uuid = btuuid::bluetooth_uuid_from_u16(0x2a37);
pub const BODY_LOCATION: Uuid = btuuid::bluetooth_uuid_from_u16(0x2a38);
pub const CONTROL_POINT: Uuid = btuuid::bluetooth_uuid_from_u16(0x2a39);
pub const BATTERY: Uuid = btuuid::bluetooth_uuid_from_u16(0x180f);
pub const BATTERY_LEVEL: Uuid = btuuid::bluetooth_uuid_from_u16(0x2a19);
pub const CCCD: Uuid = descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION;

pub const TIMEOUT: Duration = Duration::from_millis(300);

pub struct Harness {
    pub radio: Arc<FakeRadio>,
    pub manager: GattConnectionManager,
}

pub fn harness() -> Harness {
    harness_with(config())
}

pub fn harness_with(config: ManagerConfig) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let (sink, events) = event_channel();
    let radio = Arc::new(FakeRadio::new(sink));
    let manager = GattConnectionManager::new(radio.clone(), events, config).unwrap();
    Harness { radio, manager }
}

pub fn config() -> ManagerConfig {
    ManagerConfig::default()
        .operation_timeout(TIMEOUT)
        .discovery_timeout(TIMEOUT)
        .disconnect_timeout(TIMEOUT)
        .high_power_scan_window(TIMEOUT)
        .low_power_scan_timeout(Some(TIMEOUT))
        .priority_poll_interval(Duration::from_millis(10))
}

pub fn options() -> ConnectOptions {
    ConnectOptions::default().timeout(Duration::from_secs(1))
}

fn props(f: impl FnOnce(&mut CharacteristicProperties)) -> CharacteristicProperties {
    let mut props = CharacteristicProperties::default();
    f(&mut props);
    props
}

pub fn heart_rate_service() -> GattService {
    GattService::new(
        HEART_RATE,
        vec![
            GattCharacteristic::new(
                MEASUREMENT,
                props(|p| p.notify = true),
                vec![GattDescriptor::new(CCCD)],
            ),
            GattCharacteristic::new(BODY_LOCATION, props(|p| p.read = true), vec![]),
            GattCharacteristic::new(
                CONTROL_POINT,
                props(|p| {
                    p.write = true;
                    p.indicate = true;
                }),
                vec![GattDescriptor::new(CCCD)],
            ),
        ],
    )
}

pub fn battery_service() -> GattService {
    GattService::new(
        BATTERY,
        vec![GattCharacteristic::new(
            BATTERY_LEVEL,
            props(|p| {
                p.read = true;
                p.write_without_response = true;
            }),
            vec![],
        )],
    )
}

/// The Generic Attribute service with Service Changed, announcing a mutable table.
pub fn generic_attribute_service() -> GattService {
    GattService::new(
        services::GENERIC_ATTRIBUTE,
        vec![GattCharacteristic::new(
            characteristics::SERVICE_CHANGED,
            props(|p| p.indicate = true),
            vec![GattDescriptor::new(CCCD)],
        )],
    )
}

pub fn heart_rate_monitor(id: &str) -> FakePeripheral {
    FakePeripheral::new(id)
        .service(heart_rate_service())
        .service(battery_service())
        .advertise(HEART_RATE)
}

pub fn connect(h: &Harness, peripheral: FakePeripheral) -> GattConnection {
    let id = peripheral.id.clone();
    h.radio.add_peripheral(peripheral);
    h.manager.connect(&id, options()).unwrap()
}

/// Polls `cond` until it holds, panicking after a second.
pub fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(1);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}

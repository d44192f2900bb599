mod common;

use std::time::Duration;

use gatt_bridge::fake::{FakePeripheral, RadioCall};
use gatt_bridge::*;

use common::*;

fn scans(h: &Harness, mode: ScanMode) -> usize {
    h.radio
        .count(|c| matches!(c, RadioCall::StartScan(_, m) if *m == mode))
}

fn connects(h: &Harness) -> usize {
    h.radio.count(|c| matches!(c, RadioCall::Connect(_)))
}

#[test]
fn scan_finds_advertising_device() {
    let h = harness();
    h.radio
        .add_peripheral(FakePeripheral::new("scale").service(battery_service()));
    h.radio.add_peripheral(heart_rate_monitor("hrm"));
    let found = h
        .manager
        .scan(Some(HEART_RATE), ScanMode::LowLatency, Some(TIMEOUT))
        .unwrap();
    assert_eq!(found.device, DeviceId::new("hrm"));
    assert_eq!(found.rssi, -60);
    assert_eq!(h.radio.count(|c| *c == RadioCall::StopScan), 1);
}

#[test]
fn scan_without_result_times_out() {
    let h = harness();
    let err = h
        .manager
        .scan(Some(HEART_RATE), ScanMode::LowPower, Some(Duration::from_millis(50)))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(h.radio.count(|c| *c == RadioCall::StopScan), 1);
}

#[test]
fn scan_failure_is_reported() {
    let h = harness();
    h.radio.add_peripheral(heart_rate_monitor("hrm"));
    h.radio.fail_scans(2);
    let err = h
        .manager
        .scan(None, ScanMode::LowLatency, Some(TIMEOUT))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol(GattStatus::from_raw(2)));
}

#[test]
fn auto_connect_with_nearby_device() {
    let h = harness();
    h.radio.add_peripheral(heart_rate_monitor("hrm"));
    let conn = h.manager.auto_connect(HEART_RATE, options()).unwrap();
    assert_eq!(conn.device(), &DeviceId::new("hrm"));
    assert_eq!(scans(&h, ScanMode::LowLatency), 1);
    assert_eq!(scans(&h, ScanMode::LowPower), 0);
}

#[test]
fn auto_connect_falls_back_to_low_power_scan() {
    let h = harness();
    h.radio
        .add_peripheral(heart_rate_monitor("far").low_power_only(true));
    let conn = h.manager.auto_connect(HEART_RATE, options()).unwrap();
    assert!(conn.is_connected());
    assert_eq!(scans(&h, ScanMode::LowLatency), 1);
    assert_eq!(scans(&h, ScanMode::LowPower), 1);
    assert_eq!(h.radio.count(|c| *c == RadioCall::StopScan), 2);
}

#[test]
fn auto_connect_gives_up_when_nothing_is_found() {
    let h = harness();
    let err = h.manager.auto_connect(HEART_RATE, options()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(connects(&h), 0);
}

#[test]
fn auto_connect_retries_failed_connections() {
    let h = harness_with(config().connect_retries(3));
    h.radio
        .add_peripheral(heart_rate_monitor("flaky").failed_connects(2));
    let conn = h.manager.auto_connect(HEART_RATE, options()).unwrap();
    assert!(conn.is_connected());
    assert_eq!(connects(&h), 3);
    assert_eq!(scans(&h, ScanMode::LowLatency), 3);
    assert_eq!(h.radio.open_handles(), vec![conn.handle()]);
}

#[test]
fn auto_connect_stops_after_the_last_retry() {
    let h = harness_with(config().connect_retries(2));
    h.radio
        .add_peripheral(heart_rate_monitor("broken").failed_connects(10));
    let err = h.manager.auto_connect(HEART_RATE, options()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
    assert_eq!(connects(&h), 3);
    assert!(h.radio.open_handles().is_empty());
}

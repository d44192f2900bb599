mod common;

use std::sync::mpsc;
use std::time::{Duration, Instant};

use futures_lite::StreamExt;
use gatt_bridge::fake::{CallKind, FakePeripheral, RadioCall};
use gatt_bridge::*;

use common::*;

#[test]
fn connect_then_close() {
    let h = harness();
    let mut events = h.manager.connection_events();
    let conn = connect(&h, heart_rate_monitor("hrm"));
    assert!(conn.is_connected());
    assert_eq!(conn.mtu(), DEFAULT_MTU);
    assert_eq!(h.manager.connection(conn.handle()), Some(conn.clone()));

    let (tx, rx) = mpsc::channel();
    conn.add_close_listener(move |c| tx.send(c.handle()).unwrap());
    conn.close().unwrap();
    assert!(conn.is_closed());
    assert!(!conn.is_connected());
    assert!(h.radio.open_handles().is_empty());
    assert_eq!(rx.recv_timeout(Duration::from_secs(1)), Ok(conn.handle()));
    assert!(h.manager.connections().is_empty());

    // closing twice does nothing
    conn.close().unwrap();
    assert_eq!(h.radio.count(|c| matches!(c, RadioCall::Disconnect(_))), 1);

    let handle = conn.handle();
    let device = DeviceId::new("hrm");
    let connected = futures_lite::future::block_on(events.next());
    assert_eq!(connected, Some(ConnectionEvent::Connected(device.clone(), handle)));
    let disconnected = futures_lite::future::block_on(events.next());
    assert_eq!(disconnected, Some(ConnectionEvent::Disconnected(device, handle)));
}

#[test]
fn close_listener_on_closed_connection_runs_immediately() {
    let h = harness();
    let conn = connect(&h, heart_rate_monitor("hrm"));
    conn.close().unwrap();
    let (tx, rx) = mpsc::channel();
    conn.add_close_listener(move |_| tx.send(()).unwrap());
    assert!(rx.try_recv().is_ok());
}

#[test]
fn operations_after_close_fail() {
    let h = harness();
    let conn = connect(&h, heart_rate_monitor("hrm"));
    conn.close().unwrap();
    assert_eq!(conn.read_remote_rssi().unwrap_err().kind(), ErrorKind::NotConnected);
    assert_eq!(conn.discover_services().unwrap_err().kind(), ErrorKind::NotConnected);
}

#[test]
fn connect_failure_releases_handle() {
    let h = harness();
    h.radio
        .add_peripheral(heart_rate_monitor("flaky").failed_connects(1));
    let err = h.manager.connect(&DeviceId::new("flaky"), options()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
    assert!(err.is_connection_error());
    assert!(h.radio.open_handles().is_empty());
    assert!(h.manager.connections().is_empty());

    // the next attempt is unaffected
    let conn = h.manager.connect(&DeviceId::new("flaky"), options()).unwrap();
    assert!(conn.is_connected());
}

#[test]
fn connect_timeout_releases_handle() {
    let h = harness();
    h.radio.add_peripheral(heart_rate_monitor("slow"));
    h.radio.mute(CallKind::Connect);
    let opts = options().timeout(Duration::from_millis(100));
    let err = h.manager.connect(&DeviceId::new("slow"), opts).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(h.radio.open_handles().is_empty());
    assert!(h.manager.connections().is_empty());

    h.radio.unmute(CallKind::Connect);
    let conn = h.manager.connect(&DeviceId::new("slow"), options()).unwrap();
    assert!(conn.is_connected());
}

#[test]
fn close_while_connecting_does_nothing() {
    let h = harness();
    h.radio.add_peripheral(heart_rate_monitor("slow"));
    h.radio.mute(CallKind::Connect);
    let manager = h.manager.clone();
    let connecting = std::thread::spawn(move || {
        manager.connect(&DeviceId::new("slow"), options().timeout(Duration::from_millis(300)))
    });

    wait_until(|| !h.manager.connections().is_empty());
    let pending = h.manager.connections().remove(0);
    assert!(!pending.is_connected());
    pending.close().unwrap();
    assert_eq!(h.radio.count(|c| matches!(c, RadioCall::Disconnect(_))), 0);
    assert!(!pending.is_closed());

    let err = connecting.join().unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[test]
fn close_releases_handle_when_disconnect_times_out() {
    let h = harness();
    let conn = connect(&h, heart_rate_monitor("hrm"));
    let (tx, rx) = mpsc::channel();
    conn.add_close_listener(move |_| tx.send(()).unwrap());

    h.radio.mute(CallKind::Disconnect);
    let err = conn.close().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(conn.is_closed());
    assert!(h.radio.open_handles().is_empty());
    assert!(rx.recv_timeout(Duration::from_secs(1)).is_ok());
}

#[test]
fn connect_negotiates_mtu() {
    let h = harness();
    h.radio.add_peripheral(heart_rate_monitor("hrm"));
    let conn = h
        .manager
        .connect(&DeviceId::new("hrm"), options().mtu(247))
        .unwrap();
    assert!(conn.is_connected());
    assert_eq!(conn.mtu(), 247);
    assert_eq!(conn.max_write_len(), 244);
    assert!(h
        .radio
        .calls()
        .contains(&RadioCall::RequestMtu(conn.handle(), 247)));
}

#[test]
fn failed_mtu_negotiation_fails_connect() {
    let h = harness();
    h.radio
        .add_peripheral(heart_rate_monitor("hrm").mtu_status(GattStatus::REQUEST_NOT_SUPPORTED));
    let err = h
        .manager
        .connect(&DeviceId::new("hrm"), options().mtu(247))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
    assert!(h.radio.open_handles().is_empty());
    assert!(h.manager.connections().is_empty());
}

#[test]
fn link_lost_during_mtu_negotiation_fails_connect() {
    let h = harness();
    h.radio.add_peripheral(heart_rate_monitor("hrm"));
    h.radio.mute(CallKind::RequestMtu);
    let manager = h.manager.clone();
    let connecting =
        std::thread::spawn(move || manager.connect(&DeviceId::new("hrm"), options().mtu(247)));

    wait_until(|| h.radio.count(|c| matches!(c, RadioCall::RequestMtu(..))) == 1);
    let handle = h.radio.open_handles()[0];
    h.radio.drop_link(handle, GattStatus::GATT_ERROR);

    let err = connecting.join().unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
    assert!(h.radio.open_handles().is_empty());
    assert!(h.manager.connections().is_empty());
}

#[test]
fn priority_is_requested_until_accepted() {
    let h = harness();
    h.radio
        .add_peripheral(heart_rate_monitor("hrm").priority_rejections(3));
    let conn = h
        .manager
        .connect(
            &DeviceId::new("hrm"),
            options().priority(ConnectionPriority::High),
        )
        .unwrap();
    assert!(conn.is_connected());
    let requests = h
        .radio
        .count(|c| matches!(c, RadioCall::RequestPriority(_, ConnectionPriority::High)));
    assert_eq!(requests, 4);
}

#[test]
fn priority_never_accepted_times_out() {
    let h = harness();
    h.radio
        .add_peripheral(heart_rate_monitor("hrm").priority_rejections(usize::MAX));
    let opts = options()
        .priority(ConnectionPriority::LowPower)
        .timeout(Duration::from_millis(150));
    let err = h.manager.connect(&DeviceId::new("hrm"), opts).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(h.radio.open_handles().is_empty());
}

#[test]
fn link_lost_during_priority_poll_fails_connect() {
    let h = harness();
    h.radio
        .add_peripheral(heart_rate_monitor("hrm").priority_rejections(usize::MAX));
    let manager = h.manager.clone();
    let connecting = std::thread::spawn(move || {
        manager.connect(
            &DeviceId::new("hrm"),
            options().priority(ConnectionPriority::High),
        )
    });

    wait_until(|| h.radio.count(|c| matches!(c, RadioCall::RequestPriority(..))) >= 2);
    let handle = h.radio.open_handles()[0];
    h.radio.drop_link(handle, GattStatus::GATT_ERROR);

    let err = connecting.join().unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
    assert!(h.radio.open_handles().is_empty());
    assert!(h.manager.connections().is_empty());
}

#[test]
fn connect_timeout_includes_priority_poll() {
    let h = harness();
    h.radio
        .add_peripheral(heart_rate_monitor("slow").priority_rejections(12));
    h.radio.mute(CallKind::Connect);
    let opts = options()
        .priority(ConnectionPriority::High)
        .timeout(Duration::from_millis(200));
    let started = Instant::now();
    let err = h.manager.connect(&DeviceId::new("slow"), opts).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(started.elapsed() < Duration::from_millis(300));
    assert!(h.radio.open_handles().is_empty());
}

#[test]
fn unsolicited_disconnect_fails_pending_operations() {
    let h = harness();
    let conn = connect(&h, heart_rate_monitor("hrm"));
    let body_location = conn.get_characteristic(HEART_RATE, BODY_LOCATION).unwrap();
    let (tx, rx) = mpsc::channel();
    conn.add_close_listener(move |_| tx.send(()).unwrap());

    h.radio.mute(CallKind::ReadCharacteristic);
    let reader = {
        let conn = conn.clone();
        std::thread::spawn(move || conn.read_characteristic(&body_location))
    };
    wait_until(|| h.radio.count(|c| matches!(c, RadioCall::ReadCharacteristic(..))) == 1);
    h.radio.drop_link(conn.handle(), GattStatus::GATT_ERROR);

    let err = reader.join().unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
    assert!(rx.recv_timeout(Duration::from_secs(1)).is_ok());
    assert!(conn.is_closed());
    assert_eq!(h.manager.connection(conn.handle()), None);
    assert!(h.radio.open_handles().is_empty());
}

#[test]
fn events_of_unknown_handles_are_dropped() {
    let h = harness();
    let conn = connect(&h, heart_rate_monitor("hrm"));
    h.radio.emit(RadioEvent::RssiRead {
        handle: ConnHandle(999),
        status: GattStatus::SUCCESS,
        rssi: -1,
    });
    h.radio.drop_link(ConnHandle(999), GattStatus::GATT_ERROR);
    assert_eq!(conn.read_remote_rssi().unwrap(), -60);
    assert!(conn.is_connected());
}

#[test]
fn close_all_closes_every_connection() {
    let h = harness();
    let a = connect(&h, heart_rate_monitor("a"));
    let b = connect(&h, FakePeripheral::new("b").service(battery_service()));
    assert_ne!(a.handle(), b.handle());
    assert_eq!(h.manager.connections().len(), 2);
    h.manager.close_all();
    assert!(a.is_closed() && b.is_closed());
    assert!(h.radio.open_handles().is_empty());
}

mod common;

use std::time::Duration;

use bleman::advertisement_data::AdvertisementData;
use bleman::radio::sim::RadioCommand;
use bleman::{AdapterState, CentralEvent, ConnectionState, ScanOptions};
use futures_lite::StreamExt;

use common::{BATTERY, HEART_RATE, Harness, peripheral, settle};

fn advertising(services: &[bleman::BluetoothUuid]) -> AdvertisementData {
    AdvertisementData {
        local_name: Some("sensor".to_owned()),
        service_uuids: services.to_vec(),
        is_connectable: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn scan_runs_while_observed() {
    let h = Harness::new();
    let mut scan = h.central.scan(ScanOptions::default()).unwrap();
    assert!(h.radio.is_scanning());

    h.radio.discover(peripheral(1), advertising(&[HEART_RATE]), -61);
    let discovery = scan.next().await.unwrap();
    assert_eq!(discovery.peripheral, peripheral(1));
    assert_eq!(discovery.rssi, -61);

    let record = h.central.peripheral(peripheral(1)).unwrap();
    assert_eq!(record.rssi, Some(-61));
    assert_eq!(record.connection_state, ConnectionState::Disconnected);
    assert!(record.discovered_at.is_some());

    drop(scan);
    assert!(!h.radio.is_scanning());
    assert_eq!(h.radio.count(|c| *c == RadioCommand::StopScan), 1);

    // A new scan only sees what is discovered after it started.
    let mut scan = h.central.scan(ScanOptions::default()).unwrap();
    h.radio.discover(peripheral(2), advertising(&[]), -70);
    assert_eq!(scan.next().await.unwrap().peripheral, peripheral(2));
}

#[tokio::test]
async fn concurrent_scans_share_the_radio() {
    let h = Harness::new();
    let mut heart_rate = h.central.scan(ScanOptions::services([HEART_RATE])).unwrap();
    let mut battery = h.central.scan(ScanOptions::services([BATTERY])).unwrap();

    h.radio.discover(peripheral(3), advertising(&[BATTERY]), -55);
    h.radio.discover(peripheral(4), advertising(&[HEART_RATE]), -56);
    h.radio.discover(peripheral(4), advertising(&[HEART_RATE]), -57);

    assert_eq!(heart_rate.next().await.unwrap().peripheral, peripheral(4));
    assert_eq!(battery.next().await.unwrap().peripheral, peripheral(3));

    drop(heart_rate);
    assert!(h.radio.is_scanning());
    assert_eq!(
        h.radio.commands().last(),
        Some(&RadioCommand::StartScan(bleman::radio::ScanFilter {
            services: vec![BATTERY],
            allow_duplicates: false,
        }))
    );
    drop(battery);
    assert!(!h.radio.is_scanning());
}

#[tokio::test]
async fn scan_duration_ends_the_stream() {
    let h = Harness::new();
    let mut scan = h
        .central
        .scan(ScanOptions::default().with_duration(Duration::from_millis(50)))
        .unwrap();

    assert!(scan.next().await.is_none());
    assert!(!h.radio.is_scanning());
    assert_eq!(h.radio.count(|c| *c == RadioCommand::StopScan), 1);
}

#[tokio::test]
async fn scan_duration_holds_without_polling() {
    let h = Harness::new();
    let mut scan = h
        .central
        .scan(ScanOptions::default().with_duration(Duration::from_millis(50)))
        .unwrap();
    assert!(h.radio.is_scanning());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!h.radio.is_scanning());
    assert_eq!(h.radio.count(|c| *c == RadioCommand::StopScan), 1);
    assert!(scan.next().await.is_none());
}

#[tokio::test]
async fn radio_ending_the_scan_ends_every_stream() {
    let h = Harness::new();
    let mut events = h.central.events();
    let mut first = h.central.scan(ScanOptions::default()).unwrap();
    let mut second = h.central.scan(ScanOptions::services([BATTERY])).unwrap();

    h.radio.end_scan();
    assert!(first.next().await.is_none());
    assert!(second.next().await.is_none());
    assert!(matches!(events.next().await, Some(CentralEvent::ScanStopped)));

    // The stack already stopped; no command is sent for it.
    assert_eq!(h.radio.count(|c| *c == RadioCommand::StopScan), 0);
}

#[tokio::test]
async fn scan_waits_for_the_radio() {
    let h = Harness::new();
    h.radio.set_adapter_state(AdapterState::PoweredOff);

    let mut scan = h.central.scan(ScanOptions::default()).unwrap();
    assert!(!h.radio.is_scanning());

    h.radio.set_adapter_state(AdapterState::PoweredOn);
    assert!(h.radio.is_scanning());
    h.radio.discover(peripheral(5), advertising(&[]), -40);
    assert_eq!(scan.next().await.unwrap().peripheral, peripheral(5));
}

#[tokio::test]
async fn link_changes_are_observed() {
    let h = Harness::new();
    let p = peripheral(6);
    let mut events = h.central.events();

    h.connect(p).await;
    h.radio.drop_link(p, bleman::radio::error::ErrorKind::Hci(0x13));
    settle().await;

    let mut states = Vec::new();
    let mut disconnected = false;
    while let Some(event) = events.next().await {
        match event {
            CentralEvent::ConnectionStateChanged(change) => {
                assert_eq!(change.peripheral, p);
                states.push(change.state);
            }
            CentralEvent::Disconnected(event) => {
                assert_eq!(event.peripheral, p);
                disconnected = true;
                break;
            }
            _ => {}
        }
    }
    assert!(disconnected);
    assert_eq!(
        states,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnected,
        ]
    );
    assert_eq!(h.central.peripheral(p).unwrap().handle, None);
}

#[tokio::test]
async fn detached_observers_stop_receiving() {
    let h = Harness::new();
    let mut events = h.central.events();
    let token = events.token();

    h.radio.set_adapter_state(AdapterState::PoweredOff);
    assert!(matches!(
        events.next().await,
        Some(CentralEvent::StateUpdated(AdapterState::PoweredOff))
    ));

    h.central.unsubscribe_observer(token);
    h.radio.set_adapter_state(AdapterState::PoweredOn);
    assert!(events.next().await.is_none());
}

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use bleman::advertisement_data::AdvertisementData;
use bleman::radio::sim::{RadioCommand, SimulatedRadio};
use bleman::{BluetoothUuid, Central, CentralConfig, CharacteristicId, PeripheralId, ScanOptions};
use futures_lite::StreamExt;
use tracing::info;
use tracing::metadata::LevelFilter;

const HEART_RATE: BluetoothUuid = BluetoothUuid::from_u16(0x180d);

/// Plays the part of the radio stack: advertises a few peripherals and answers whatever the
/// central asks for.
async fn run_stack(radio: Arc<SimulatedRadio>) {
    let advertisements: [(u8, &[u8]); 3] = [
        (1, &[0x02, 0x01, 0x06, 0x03, 0x03, 0x0d, 0x18, 0x06, 0x09, b'S', b't', b'r', b'a', b'p']),
        (2, &[0x02, 0x01, 0x06, 0x03, 0x03, 0x0f, 0x18, 0x04, 0x09, b'T', b'a', b'g']),
        (3, &[0x02, 0x01, 0x06, 0x03, 0x03, 0x0d, 0x18, 0x05, 0x09, b'W', b'a', b't', b'c']),
    ];

    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    let mut heart_rate = 60u8;
    loop {
        ticker.tick().await;
        for (n, raw) in advertisements {
            let peripheral = PeripheralId::Address([0xc0, 0xff, 0xee, 0, 0, n]);
            radio.discover(peripheral, AdvertisementData::parse(raw), -40 - i16::from(n) * 7);
        }

        for command in radio.take_commands() {
            match command {
                RadioCommand::Connect(peripheral) => {
                    let [.., n] = match peripheral {
                        PeripheralId::Address(address) => address,
                        PeripheralId::Uuid(_) => [0; 6],
                    };
                    let handle = bleman::ConnectionHandle(0x40 + u16::from(n));
                    radio.complete_connect(peripheral, handle);
                }
                RadioCommand::Disconnect(peripheral) => radio.complete_disconnect(peripheral),
                RadioCommand::SetNotify(peripheral, characteristic, enabled) => {
                    radio.complete_set_notify(peripheral, characteristic, Ok(enabled));
                }
                RadioCommand::ReadValue(peripheral, characteristic) => {
                    radio.complete_read(peripheral, characteristic, Ok(vec![0x01]));
                }
                RadioCommand::WriteValue(peripheral, characteristic, _, _) => {
                    radio.complete_write(peripheral, characteristic, Ok(()));
                }
                RadioCommand::StartScan(_) | RadioCommand::StopScan => {}
            }
        }

        heart_rate = heart_rate.wrapping_add(1);
        let measurement = CharacteristicId::new(HEART_RATE, BluetoothUuid::from_u16(0x2a37));
        radio.notify(
            PeripheralId::Address([0xc0, 0xff, 0xee, 0, 0, 1]),
            measurement,
            vec![0x00, heart_rate],
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{EnvFilter, fmt};

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let radio = Arc::new(SimulatedRadio::new());
    let central = Central::new(radio.clone(), CentralConfig::default());
    radio.attach(central.radio_delegate());
    let stack = tokio::spawn(run_stack(radio));

    info!("starting scan");
    let mut scan = central.scan(
        ScanOptions::services([HEART_RATE]).with_duration(Duration::from_secs(1)),
    )?;
    info!("scan started");
    let mut found = Vec::new();
    while let Some(discovery) = scan.next().await {
        info!(
            "{}{}: {:?}",
            discovery
                .advertisement_data
                .local_name
                .as_deref()
                .unwrap_or("(unknown)"),
            format!(" ({}dBm)", discovery.rssi),
            discovery.advertisement_data.service_uuids
        );
        found.push(discovery.peripheral);
    }
    info!(count = found.len(), "scan finished");

    let Some(&peripheral) = found.first() else {
        return Ok(());
    };
    let handle = central.connect(peripheral, None).await?;
    info!(%peripheral, ?handle, "connected");

    let measurement = CharacteristicId::new(HEART_RATE, BluetoothUuid::from_u16(0x2a37));
    let mut values = central.notifications(peripheral, measurement.clone());
    central.subscribe(peripheral, measurement.clone()).await?;
    for _ in 0..5 {
        if let Some(value) = values.next().await {
            info!(%peripheral, bpm = value.get(1).copied().unwrap_or_default(), "heart rate");
        }
    }
    central.unsubscribe(peripheral, measurement).await?;
    central.disconnect(peripheral).await?;
    info!(%peripheral, "disconnected");

    stack.abort();
    Ok(())
}

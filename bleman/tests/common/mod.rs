//! Shared fixtures: a `Central` wired to a `SimulatedRadio`.

#![allow(dead_code)]

use std::sync::Arc;

use bleman::radio::sim::{RadioCommand, SimulatedRadio};
use bleman::{
    BluetoothUuid, Central, CentralConfig, CharacteristicId, ConnectionHandle, PeripheralId,
};
use tracing_subscriber::filter::LevelFilter;

pub fn init_tracing() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .try_init();
}

pub struct Harness {
    pub radio: Arc<SimulatedRadio>,
    pub central: Central,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(CentralConfig::default())
    }

    pub fn with_config(config: CentralConfig) -> Self {
        init_tracing();
        let radio = Arc::new(SimulatedRadio::new());
        let central = Central::new(radio.clone(), config);
        radio.attach(central.radio_delegate());
        Self { radio, central }
    }

    /// Connects `peripheral`, playing the radio's part.
    pub async fn connect(&self, peripheral: PeripheralId) -> ConnectionHandle {
        let central = self.central.clone();
        let task = tokio::spawn(async move { central.connect(peripheral, None).await });
        settle().await;
        self.radio.complete_connect(peripheral, handle(peripheral));
        task.await.unwrap().unwrap()
    }

    pub fn writes(&self, peripheral: PeripheralId) -> Vec<Vec<u8>> {
        self.radio
            .commands()
            .into_iter()
            .filter_map(|command| match command {
                RadioCommand::WriteValue(p, _, data, _) if p == peripheral => Some(data),
                _ => None,
            })
            .collect()
    }
}

/// Lets every spawned task run until it waits on the radio.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

pub fn peripheral(n: u8) -> PeripheralId {
    PeripheralId::Address([0xc0, 0xff, 0xee, 0x00, 0x00, n])
}

pub fn handle(peripheral: PeripheralId) -> ConnectionHandle {
    match peripheral {
        PeripheralId::Address(address) => ConnectionHandle(0x40 + u16::from(address[5])),
        PeripheralId::Uuid(_) => ConnectionHandle(0x40),
    }
}

pub const HEART_RATE: BluetoothUuid = BluetoothUuid::from_u16(0x180d);
pub const BATTERY: BluetoothUuid = BluetoothUuid::from_u16(0x180f);

pub fn heart_rate_measurement() -> CharacteristicId {
    CharacteristicId::new(HEART_RATE, BluetoothUuid::from_u16(0x2a37))
}

pub fn heart_rate_control() -> CharacteristicId {
    CharacteristicId::new(HEART_RATE, BluetoothUuid::from_u16(0x2a39))
}

pub fn battery_level() -> CharacteristicId {
    CharacteristicId::new(BATTERY, BluetoothUuid::from_u16(0x2a19))
}

//! Tunables for a [`Central`](crate::Central).

use std::time::Duration;

use bleman_radio::BluetoothUuid;
use bleman_radio::advertisement_data::AdvertisementData;

/// Which GATT requests to one peripheral share its single in-flight slot.
///
/// Whether a stack tolerates a read while a write is unacknowledged on the same link varies, so
/// this is left to the integrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum GattSerialization {
    /// Writes are issued one at a time per peripheral, in submission order. Reads are issued as
    /// soon as they are requested.
    #[default]
    PerPeripheralWrites,
    /// Reads and writes share one FIFO and one in-flight slot per peripheral.
    PeripheralWide,
}

/// Configuration for a [`Central`](crate::Central).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CentralConfig {
    /// Deadline applied to reads, writes and notification changes that do not pass one.
    pub default_timeout: Option<Duration>,
    /// Deadline applied to connects that do not pass one.
    pub connect_timeout: Option<Duration>,
    pub gatt_serialization: GattSerialization,
    /// Buffered adapter state updates per receiver.
    pub state_capacity: usize,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            default_timeout: None,
            connect_timeout: Some(Duration::from_secs(10)),
            gatt_serialization: GattSerialization::default(),
            state_capacity: 1,
        }
    }
}

impl CentralConfig {
    pub fn with_default_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.default_timeout = timeout.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.connect_timeout = timeout.into();
        self
    }

    pub fn with_gatt_serialization(mut self, policy: GattSerialization) -> Self {
        self.gatt_serialization = policy;
        self
    }
}

/// Parameters for [`Central::scan`](crate::Central::scan).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOptions {
    /// Only report peripherals advertising one of these services. Empty means report everything.
    pub services: Vec<BluetoothUuid>,
    /// Report every advertisement rather than the first one per peripheral.
    pub allow_duplicates: bool,
    /// End the scan after this long.
    pub duration: Option<Duration>,
}

impl ScanOptions {
    pub fn services(services: impl IntoIterator<Item = BluetoothUuid>) -> Self {
        Self {
            services: services.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_duplicates(mut self, allow_duplicates: bool) -> Self {
        self.allow_duplicates = allow_duplicates;
        self
    }

    pub fn matches(&self, advertisement_data: &AdvertisementData) -> bool {
        self.services.is_empty() || advertisement_data.advertises_any(&self.services)
    }
}

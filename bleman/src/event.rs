use bleman_radio::advertisement_data::AdvertisementData;
use bleman_radio::{AdapterState, CharacteristicId, PeripheralId};

use crate::registry::ConnectionState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryEvent {
    pub peripheral: PeripheralId,
    pub advertisement_data: AdvertisementData,
    pub rssi: i16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub peripheral: PeripheralId,
    pub state: ConnectionState,
}

/// A value pushed by a peripheral on a subscribed characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    pub peripheral: PeripheralId,
    pub characteristic: CharacteristicId,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct DisconnectEvent {
    pub peripheral: PeripheralId,
    /// Why the link closed, if it was not requested.
    pub reason: Option<bleman_radio::Error>,
}

/// Everything a [`Central`](crate::Central) reports to its observers.
#[derive(Debug, Clone)]
pub enum CentralEvent {
    StateUpdated(AdapterState),
    Discovered(DiscoveryEvent),
    ConnectionStateChanged(ConnectionEvent),
    Notification(NotificationEvent),
    Disconnected(DisconnectEvent),
    /// The radio stopped scanning, either because the last scan ended or on its own.
    ScanStopped,
}

impl CentralEvent {
    pub fn peripheral(&self) -> Option<PeripheralId> {
        match self {
            CentralEvent::Discovered(e) => Some(e.peripheral),
            CentralEvent::ConnectionStateChanged(e) => Some(e.peripheral),
            CentralEvent::Notification(e) => Some(e.peripheral),
            CentralEvent::Disconnected(e) => Some(e.peripheral),
            CentralEvent::StateUpdated(_) | CentralEvent::ScanStopped => None,
        }
    }

    pub(crate) fn connection(peripheral: PeripheralId, state: ConnectionState) -> Self {
        CentralEvent::ConnectionStateChanged(ConnectionEvent { peripheral, state })
    }
}

//! The command and callback interfaces between a central and the radio stack.

use btuuid::BluetoothUuid;

use crate::advertisement_data::AdvertisementData;
use crate::error::{Error, Result};
use crate::id::{CharacteristicId, ConnectionHandle, PeripheralId};

/// The power and availability state of the local radio.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AdapterState {
    #[default]
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl AdapterState {
    /// Whether commands may be issued in this state.
    ///
    /// `Unknown` is accepted because many stacks only report their state after the first command.
    pub fn is_usable(self) -> bool {
        matches!(self, AdapterState::PoweredOn | AdapterState::Unknown)
    }
}

/// How a characteristic value is written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum WriteType {
    /// An ATT Write Request; the peer acknowledges it.
    #[default]
    WithResponse,
    /// An ATT Write Command; complete once the stack accepts it.
    WithoutResponse,
}

/// Parameters for a radio scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    /// Only report peripherals advertising one of these services. Empty means report everything.
    pub services: Vec<BluetoothUuid>,
    /// Report every advertisement rather than the first one per peripheral.
    pub allow_duplicates: bool,
}

impl ScanFilter {
    pub fn matches(&self, advertisement_data: &AdvertisementData) -> bool {
        self.services.is_empty() || advertisement_data.advertises_any(&self.services)
    }
}

/// Commands a central issues to the radio stack.
///
/// Every method only submits the command. Completion is reported later through the matching
/// [`RadioDelegate`] callback; an `Err` return means the command was never submitted and no
/// callback will follow.
pub trait RadioAdapter: Send + Sync + 'static {
    fn state(&self) -> AdapterState;

    /// Starts, or restarts with a new filter, scanning for advertisements.
    fn start_scan(&self, filter: &ScanFilter) -> Result<()>;

    fn stop_scan(&self);

    /// Opens a link. Reported by [`RadioDelegate::did_connect`] or
    /// [`RadioDelegate::did_fail_to_connect`].
    fn connect(&self, peripheral: PeripheralId) -> Result<()>;

    /// Closes a link or cancels a pending one. Reported by [`RadioDelegate::did_disconnect`].
    fn disconnect(&self, peripheral: PeripheralId) -> Result<()>;

    fn read_value(&self, peripheral: PeripheralId, characteristic: &CharacteristicId)
    -> Result<()>;

    /// Writes a characteristic value. Only writes of type [`WriteType::WithResponse`] are
    /// reported by [`RadioDelegate::did_write_value`].
    fn write_value(
        &self,
        peripheral: PeripheralId,
        characteristic: &CharacteristicId,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<()>;

    fn set_notify(
        &self,
        peripheral: PeripheralId,
        characteristic: &CharacteristicId,
        enabled: bool,
    ) -> Result<()>;

    /// Peripherals already connected to the host that expose any of `services`, with the handle
    /// of each link.
    fn connected_peripherals(
        &self,
        services: &[BluetoothUuid],
    ) -> Vec<(PeripheralId, ConnectionHandle)>;
}

/// Callbacks from the radio stack.
///
/// Implementations must not block. Callbacks may arrive on any thread, and from within any
/// [`RadioAdapter`] method other than `start_scan` and `stop_scan`.
pub trait RadioDelegate: Send + Sync {
    fn did_update_state(&self, state: AdapterState);

    fn did_discover(
        &self,
        peripheral: PeripheralId,
        advertisement_data: AdvertisementData,
        rssi: i16,
    );

    /// The stack stopped scanning on its own.
    fn did_stop_scan(&self) {}

    fn did_connect(&self, peripheral: PeripheralId, handle: ConnectionHandle);

    fn did_fail_to_connect(&self, peripheral: PeripheralId, error: Error);

    /// The link closed, either as requested or because it dropped. `error` is set when the
    /// disconnect was not requested.
    fn did_disconnect(&self, peripheral: PeripheralId, error: Option<Error>);

    fn did_read_value(
        &self,
        peripheral: PeripheralId,
        characteristic: CharacteristicId,
        result: Result<Vec<u8>>,
    );

    fn did_write_value(
        &self,
        peripheral: PeripheralId,
        characteristic: CharacteristicId,
        result: Result<()>,
    );

    /// Completion of [`RadioAdapter::set_notify`]; `Ok` carries whether notifications are now on.
    fn did_update_notification_state(
        &self,
        peripheral: PeripheralId,
        characteristic: CharacteristicId,
        result: Result<bool>,
    );

    /// A notification or indication pushed by the peripheral.
    fn did_receive_notification(
        &self,
        peripheral: PeripheralId,
        characteristic: CharacteristicId,
        value: Vec<u8>,
    );
}

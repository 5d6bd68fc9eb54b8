//! An in-memory radio for running a central without hardware.
//!
//! [`SimulatedRadio`] records every command it is given and never completes anything on its own.
//! The owner plays the part of the stack by calling the `complete_*`, `discover`, `notify` and
//! `drop_link` methods, which forward to the attached [`RadioDelegate`].
//!
//! ```
//! use std::sync::Arc;
//! use bleman_radio::sim::{RadioCommand, SimulatedRadio};
//! use bleman_radio::{PeripheralId, RadioAdapter};
//!
//! let radio = Arc::new(SimulatedRadio::new());
//! let peripheral = PeripheralId::Address([0xc0, 0xff, 0xee, 0, 0, 1]);
//! radio.connect(peripheral).unwrap();
//! assert_eq!(radio.commands(), vec![RadioCommand::Connect(peripheral)]);
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use btuuid::BluetoothUuid;
use tracing::trace;

use crate::adapter::{AdapterState, RadioAdapter, RadioDelegate, ScanFilter, WriteType};
use crate::advertisement_data::AdvertisementData;
use crate::error::{Error, Result};
use crate::id::{CharacteristicId, ConnectionHandle, PeripheralId};

/// A command received by a [`SimulatedRadio`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCommand {
    StartScan(ScanFilter),
    StopScan,
    Connect(PeripheralId),
    Disconnect(PeripheralId),
    ReadValue(PeripheralId, CharacteristicId),
    WriteValue(PeripheralId, CharacteristicId, Vec<u8>, WriteType),
    SetNotify(PeripheralId, CharacteristicId, bool),
}

#[derive(Default)]
struct SimState {
    adapter_state: AdapterState,
    scanning: bool,
    commands: Vec<RadioCommand>,
    rejections: VecDeque<Error>,
    system_links: Vec<SystemLink>,
}

struct SystemLink {
    peripheral: PeripheralId,
    handle: ConnectionHandle,
    services: Vec<BluetoothUuid>,
}

#[derive(Default)]
pub struct SimulatedRadio {
    state: Mutex<SimState>,
    delegate: Mutex<Option<Arc<dyn RadioDelegate>>>,
}

impl std::fmt::Debug for SimulatedRadio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.sim_state();
        f.debug_struct("SimulatedRadio")
            .field("adapter_state", &state.adapter_state)
            .field("scanning", &state.scanning)
            .field("commands", &state.commands.len())
            .finish()
    }
}

impl SimulatedRadio {
    /// A powered-on radio with nothing attached.
    pub fn new() -> Self {
        let radio = Self::default();
        radio.sim_state().adapter_state = AdapterState::PoweredOn;
        radio
    }

    /// Routes completions and events to `delegate`.
    pub fn attach(&self, delegate: Arc<dyn RadioDelegate>) {
        *lock(&self.delegate) = Some(delegate);
    }

    fn sim_state(&self) -> MutexGuard<'_, SimState> {
        lock(&self.state)
    }

    fn delegate(&self) -> Option<Arc<dyn RadioDelegate>> {
        lock(&self.delegate).clone()
    }

    /// Every command received so far, oldest first.
    pub fn commands(&self) -> Vec<RadioCommand> {
        self.sim_state().commands.clone()
    }

    /// Returns and forgets the commands received so far.
    pub fn take_commands(&self) -> Vec<RadioCommand> {
        std::mem::take(&mut self.sim_state().commands)
    }

    pub fn count(&self, pred: impl Fn(&RadioCommand) -> bool) -> usize {
        self.sim_state().commands.iter().filter(|c| pred(c)).count()
    }

    pub fn is_scanning(&self) -> bool {
        self.sim_state().scanning
    }

    /// Makes the next submitted command fail with `error` instead of being recorded.
    pub fn reject_next(&self, error: impl Into<Error>) {
        self.sim_state().rejections.push_back(error.into());
    }

    /// Registers a link owned by the host system, reported by
    /// [`RadioAdapter::connected_peripherals`].
    pub fn add_system_link(
        &self,
        peripheral: PeripheralId,
        handle: ConnectionHandle,
        services: Vec<BluetoothUuid>,
    ) {
        self.sim_state().system_links.push(SystemLink {
            peripheral,
            handle,
            services,
        });
    }

    pub fn set_adapter_state(&self, adapter_state: AdapterState) {
        {
            let mut state = self.sim_state();
            state.adapter_state = adapter_state;
            if adapter_state != AdapterState::PoweredOn {
                state.scanning = false;
            }
        }
        if let Some(delegate) = self.delegate() {
            delegate.did_update_state(adapter_state);
        }
    }

    pub fn discover(
        &self,
        peripheral: PeripheralId,
        advertisement_data: AdvertisementData,
        rssi: i16,
    ) {
        if let Some(delegate) = self.delegate() {
            delegate.did_discover(peripheral, advertisement_data, rssi);
        }
    }

    /// Stops scanning as if the stack had given up on its own.
    pub fn end_scan(&self) {
        self.sim_state().scanning = false;
        if let Some(delegate) = self.delegate() {
            delegate.did_stop_scan();
        }
    }

    pub fn complete_connect(&self, peripheral: PeripheralId, handle: ConnectionHandle) {
        if let Some(delegate) = self.delegate() {
            delegate.did_connect(peripheral, handle);
        }
    }

    pub fn fail_connect(&self, peripheral: PeripheralId, error: impl Into<Error>) {
        if let Some(delegate) = self.delegate() {
            delegate.did_fail_to_connect(peripheral, error.into());
        }
    }

    /// Reports a requested disconnect as complete.
    pub fn complete_disconnect(&self, peripheral: PeripheralId) {
        if let Some(delegate) = self.delegate() {
            delegate.did_disconnect(peripheral, None);
        }
    }

    /// Reports an unrequested loss of the link.
    pub fn drop_link(&self, peripheral: PeripheralId, error: impl Into<Error>) {
        if let Some(delegate) = self.delegate() {
            delegate.did_disconnect(peripheral, Some(error.into()));
        }
    }

    pub fn complete_read(
        &self,
        peripheral: PeripheralId,
        characteristic: CharacteristicId,
        result: Result<Vec<u8>>,
    ) {
        if let Some(delegate) = self.delegate() {
            delegate.did_read_value(peripheral, characteristic, result);
        }
    }

    pub fn complete_write(
        &self,
        peripheral: PeripheralId,
        characteristic: CharacteristicId,
        result: Result<()>,
    ) {
        if let Some(delegate) = self.delegate() {
            delegate.did_write_value(peripheral, characteristic, result);
        }
    }

    pub fn complete_set_notify(
        &self,
        peripheral: PeripheralId,
        characteristic: CharacteristicId,
        result: Result<bool>,
    ) {
        if let Some(delegate) = self.delegate() {
            delegate.did_update_notification_state(peripheral, characteristic, result);
        }
    }

    pub fn notify(
        &self,
        peripheral: PeripheralId,
        characteristic: CharacteristicId,
        value: Vec<u8>,
    ) {
        if let Some(delegate) = self.delegate() {
            delegate.did_receive_notification(peripheral, characteristic, value);
        }
    }

    fn submit(&self, command: RadioCommand) -> Result<()> {
        let mut state = self.sim_state();
        if let Some(error) = state.rejections.pop_front() {
            trace!(?command, %error, "rejecting command");
            return Err(error);
        }
        trace!(?command, "command submitted");
        match &command {
            RadioCommand::StartScan(_) => state.scanning = true,
            RadioCommand::StopScan => state.scanning = false,
            _ => {}
        }
        state.commands.push(command);
        Ok(())
    }
}

impl RadioAdapter for SimulatedRadio {
    fn state(&self) -> AdapterState {
        self.sim_state().adapter_state
    }

    fn start_scan(&self, filter: &ScanFilter) -> Result<()> {
        self.submit(RadioCommand::StartScan(filter.clone()))
    }

    fn stop_scan(&self) {
        let _ = self.submit(RadioCommand::StopScan);
    }

    fn connect(&self, peripheral: PeripheralId) -> Result<()> {
        self.submit(RadioCommand::Connect(peripheral))
    }

    fn disconnect(&self, peripheral: PeripheralId) -> Result<()> {
        self.submit(RadioCommand::Disconnect(peripheral))
    }

    fn read_value(
        &self,
        peripheral: PeripheralId,
        characteristic: &CharacteristicId,
    ) -> Result<()> {
        self.submit(RadioCommand::ReadValue(peripheral, characteristic.clone()))
    }

    fn write_value(
        &self,
        peripheral: PeripheralId,
        characteristic: &CharacteristicId,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        self.submit(RadioCommand::WriteValue(
            peripheral,
            characteristic.clone(),
            data.to_vec(),
            write_type,
        ))
    }

    fn set_notify(
        &self,
        peripheral: PeripheralId,
        characteristic: &CharacteristicId,
        enabled: bool,
    ) -> Result<()> {
        self.submit(RadioCommand::SetNotify(
            peripheral,
            characteristic.clone(),
            enabled,
        ))
    }

    fn connected_peripherals(
        &self,
        services: &[BluetoothUuid],
    ) -> Vec<(PeripheralId, ConnectionHandle)> {
        self.sim_state()
            .system_links
            .iter()
            .filter(|link| services.iter().any(|s| link.services.contains(s)))
            .map(|link| (link.peripheral, link.handle))
            .collect()
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

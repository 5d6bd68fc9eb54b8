//! Correlation and serialization of asynchronous BLE central operations.
//!
//! A [`Central`] sits between application code and a radio stack that implements
//! [`RadioAdapter`](bleman_radio::RadioAdapter). It turns the stack's callbacks into `async`
//! results and streams:
//!
//! - identical requests in flight (two connects to one peripheral, two reads of one characteristic)
//!   share a single radio command and all callers receive the same result;
//! - writes to a peripheral reach the radio one at a time, in submission order, independently of
//!   every other peripheral;
//! - each caller has its own deadline, and dropping a request future only withdraws that caller;
//! - discoveries, notifications and link changes fan out to any number of observers, and the radio
//!   only scans while someone is listening.
//!
//! `scan.rs` under `bleman/examples/` drives a [`SimulatedRadio`](radio::sim::SimulatedRadio) end to end.

mod central;
pub mod config;
mod connection;
pub mod error;
mod event;
mod gatt;
mod pending;
mod registry;
mod router;
mod util;
mod write_queue;

pub use bleman_radio as radio;
pub use bleman_radio::advertisement_data;
pub use bleman_radio::{
    AdapterState, BluetoothUuid, CharacteristicId, ConnectionHandle, PeripheralId, RadioAdapter,
    RadioDelegate, WriteType,
};
pub use central::*;
pub use config::{CentralConfig, GattSerialization, ScanOptions};
pub use error::{Error, ErrorKind, Result};
pub use event::*;
pub use pending::{OperationKey, OperationKind};
pub use registry::{ConnectionState, PeripheralRecord};
pub use router::{EventStream, NotificationStream, ObserverToken, ScanStream};
pub use util::BroadcastReceiver;

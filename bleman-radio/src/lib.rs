//! The boundary between a BLE central and the radio stack that drives it.
//!
//! A stack binding implements [`RadioAdapter`] to accept commands and reports completions and
//! unsolicited events through a [`RadioDelegate`]. The [`sim`] module provides an in-memory
//! adapter for tests and demos.

mod adapter;
pub mod advertisement_data;
pub mod error;
mod id;
pub mod sim;

pub use adapter::*;
pub use error::{Error, Result};
pub use id::*;

pub use btuuid::BluetoothUuid;

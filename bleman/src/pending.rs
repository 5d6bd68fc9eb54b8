//! Correlation of radio completions with the callers waiting on them.
//!
//! Every outstanding radio command is identified by an [`OperationKey`]. Callers asking for the
//! same key while a command is in flight join its waiter list instead of issuing a second command,
//! and all of them receive the same result.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bleman_radio::{CharacteristicId, ConnectionHandle, PeripheralId};
use futures_channel::oneshot;
use tracing::trace;

use crate::error::{Error, ErrorKind, Result};

/// What an operation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OperationKind {
    Connect,
    Disconnect,
    Read,
    Write,
    SubscribeStart,
    SubscribeStop,
    /// Starting a radio scan. Scans are reference counted by the router, never merged here.
    Scan,
}

impl Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            OperationKind::Connect => "connect",
            OperationKind::Disconnect => "disconnect",
            OperationKind::Read => "read",
            OperationKind::Write => "write",
            OperationKind::SubscribeStart => "subscribe",
            OperationKind::SubscribeStop => "unsubscribe",
            OperationKind::Scan => "scan",
        })
    }
}

/// Identifies what is being awaited. At most one operation per key is in flight.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationKey {
    pub kind: OperationKind,
    pub peripheral: PeripheralId,
    /// Set for every kind except `Connect` and `Disconnect`.
    pub characteristic: Option<CharacteristicId>,
}

impl OperationKey {
    pub fn connect(peripheral: PeripheralId) -> Self {
        Self::link(OperationKind::Connect, peripheral)
    }

    pub fn disconnect(peripheral: PeripheralId) -> Self {
        Self::link(OperationKind::Disconnect, peripheral)
    }

    pub fn read(peripheral: PeripheralId, characteristic: CharacteristicId) -> Self {
        Self::gatt(OperationKind::Read, peripheral, characteristic)
    }

    pub fn write(peripheral: PeripheralId, characteristic: CharacteristicId) -> Self {
        Self::gatt(OperationKind::Write, peripheral, characteristic)
    }

    pub fn subscribe(peripheral: PeripheralId, characteristic: CharacteristicId) -> Self {
        Self::gatt(OperationKind::SubscribeStart, peripheral, characteristic)
    }

    pub fn unsubscribe(peripheral: PeripheralId, characteristic: CharacteristicId) -> Self {
        Self::gatt(OperationKind::SubscribeStop, peripheral, characteristic)
    }

    fn link(kind: OperationKind, peripheral: PeripheralId) -> Self {
        Self {
            kind,
            peripheral,
            characteristic: None,
        }
    }

    fn gatt(
        kind: OperationKind,
        peripheral: PeripheralId,
        characteristic: CharacteristicId,
    ) -> Self {
        Self {
            kind,
            peripheral,
            characteristic: Some(characteristic),
        }
    }
}

impl Display for OperationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.characteristic {
            Some(characteristic) => {
                write!(f, "{} {} {}", self.kind, self.peripheral, characteristic)
            }
            None => write!(f, "{} {}", self.kind, self.peripheral),
        }
    }
}

/// The successful result of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    Connected(ConnectionHandle),
    Value(Vec<u8>),
    Done,
}

impl Outcome {
    /// The handle of a completed connect. Any other outcome means the operation was not a connect
    /// and is reported as `Canceled`.
    pub fn into_handle(self) -> Result<ConnectionHandle> {
        match self {
            Outcome::Connected(handle) => Ok(handle),
            outcome => Err(mismatched(outcome)),
        }
    }

    pub fn into_value(self) -> Result<Vec<u8>> {
        match self {
            Outcome::Value(value) => Ok(value),
            outcome => Err(mismatched(outcome)),
        }
    }
}

fn mismatched(outcome: Outcome) -> Error {
    trace!(?outcome, "operation resolved with an unexpected outcome");
    ErrorKind::Canceled.into()
}

pub(crate) type Sink = oneshot::Sender<Result<Outcome>>;
pub(crate) type SinkReceiver = oneshot::Receiver<Result<Outcome>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct WaiterId(u64);

impl WaiterId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        WaiterId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// One caller's completion sink.
#[derive(Debug)]
pub(crate) struct Waiter {
    pub id: WaiterId,
    sink: Sink,
}

impl Waiter {
    pub fn new() -> (Self, SinkReceiver) {
        let (sink, receiver) = oneshot::channel();
        let waiter = Waiter {
            id: WaiterId::next(),
            sink,
        };
        (waiter, receiver)
    }

    pub fn complete(self, result: Result<Outcome>) {
        // The receiver is gone if the caller stopped waiting.
        let _ = self.sink.send(result);
    }
}

#[derive(Debug)]
pub(crate) struct PendingOperation {
    waiters: Vec<Waiter>,
    created_at: Instant,
}

/// Whether an admitted caller must issue the radio command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    /// No operation was in flight; the caller issues the command.
    FirstWaiter,
    /// The caller joined an operation already in flight.
    Merged,
}

#[derive(Debug, Default)]
pub(crate) struct PendingTable {
    operations: HashMap<OperationKey, PendingOperation>,
}

impl PendingTable {
    pub fn admit(&mut self, key: OperationKey, waiter: Waiter) -> Admission {
        use std::collections::hash_map::Entry::*;

        match self.operations.entry(key) {
            Occupied(mut entry) => {
                trace!(key = %entry.key(), "merged into pending operation");
                entry.get_mut().waiters.push(waiter);
                Admission::Merged
            }
            Vacant(entry) => {
                trace!(key = %entry.key(), "admitted first waiter");
                entry.insert(PendingOperation {
                    waiters: vec![waiter],
                    created_at: Instant::now(),
                });
                Admission::FirstWaiter
            }
        }
    }

    pub fn contains(&self, key: &OperationKey) -> bool {
        self.operations.contains_key(key)
    }

    /// Removes the operation and delivers `result` to each of its waiters, in admission order.
    ///
    /// Returns `false` if nothing was pending for `key`.
    pub fn resolve(&mut self, key: &OperationKey, result: Result<Outcome>) -> bool {
        let Some(operation) = self.operations.remove(key) else {
            return false;
        };
        trace!(
            %key,
            waiters = operation.waiters.len(),
            elapsed = ?operation.created_at.elapsed(),
            ok = result.is_ok(),
            "resolved pending operation"
        );
        for waiter in operation.waiters {
            waiter.complete(result.clone());
        }
        true
    }

    /// Removes one waiter whose deadline elapsed and hands it a `Timeout`.
    ///
    /// The operation stays pending for the other waiters. Returns the number of waiters left, or
    /// `None` if the waiter had already been resolved.
    pub fn expire(&mut self, key: &OperationKey, waiter: WaiterId) -> Option<usize> {
        let (waiter, remaining) = self.take_waiter(key, waiter)?;
        waiter.complete(Err(ErrorKind::Timeout.into()));
        Some(remaining)
    }

    /// Removes one waiter that stopped listening. The operation stays pending, even with no
    /// waiters left, until the radio reports its completion.
    pub fn cancel(&mut self, key: &OperationKey, waiter: WaiterId) -> Option<usize> {
        self.take_waiter(key, waiter).map(|(_, remaining)| remaining)
    }

    /// Drops an operation without resolving it. Its waiters observe `Canceled`.
    pub fn discard(&mut self, key: &OperationKey) -> bool {
        self.operations.remove(key).is_some()
    }

    /// Resolves every pending operation with `error`.
    pub fn fail_all(&mut self, error: Error) -> usize {
        let keys: Vec<_> = self.operations.keys().cloned().collect();
        for key in &keys {
            self.resolve(key, Err(error.clone()));
        }
        keys.len()
    }

    pub fn waiter_count(&self, key: &OperationKey) -> usize {
        self.operations.get(key).map_or(0, |op| op.waiters.len())
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    fn take_waiter(&mut self, key: &OperationKey, waiter: WaiterId) -> Option<(Waiter, usize)> {
        let operation = self.operations.get_mut(key)?;
        let index = operation.waiters.iter().position(|w| w.id == waiter)?;
        let waiter = operation.waiters.remove(index);
        Some((waiter, operation.waiters.len()))
    }
}

#[cfg(test)]
mod tests {
    use btuuid::BluetoothUuid;

    use super::*;

    fn peripheral(n: u8) -> PeripheralId {
        PeripheralId::Address([0, 0, 0, 0, 0, n])
    }

    fn characteristic() -> CharacteristicId {
        CharacteristicId::new(BluetoothUuid::from_u16(0x180d), BluetoothUuid::from_u16(0x2a37))
    }

    #[test]
    fn second_waiter_merges() {
        let mut table = PendingTable::default();
        let key = OperationKey::connect(peripheral(1));

        let (first, _rx1) = Waiter::new();
        let (second, _rx2) = Waiter::new();
        assert_eq!(table.admit(key.clone(), first), Admission::FirstWaiter);
        assert_eq!(table.admit(key.clone(), second), Admission::Merged);
        assert_eq!(table.waiter_count(&key), 2);
    }

    #[test]
    fn resolve_delivers_to_every_waiter_once() {
        let mut table = PendingTable::default();
        let key = OperationKey::read(peripheral(1), characteristic());

        let (first, mut rx1) = Waiter::new();
        let (second, mut rx2) = Waiter::new();
        table.admit(key.clone(), first);
        table.admit(key.clone(), second);

        assert!(table.resolve(&key, Ok(Outcome::Value(vec![7]))));
        assert!(!table.resolve(&key, Ok(Outcome::Value(vec![8]))));

        assert_eq!(rx1.try_recv().unwrap().unwrap().unwrap(), Outcome::Value(vec![7]));
        assert_eq!(rx2.try_recv().unwrap().unwrap().unwrap(), Outcome::Value(vec![7]));
        assert!(table.is_empty());
    }

    #[test]
    fn expire_only_removes_one_waiter() {
        let mut table = PendingTable::default();
        let key = OperationKey::connect(peripheral(1));

        let (first, mut rx1) = Waiter::new();
        let (second, mut rx2) = Waiter::new();
        let first_id = first.id;
        table.admit(key.clone(), first);
        table.admit(key.clone(), second);

        assert_eq!(table.expire(&key, first_id), Some(1));
        assert_eq!(table.expire(&key, first_id), None);
        let timed_out: Error = rx1.try_recv().unwrap().unwrap().unwrap_err();
        assert_eq!(timed_out.kind(), ErrorKind::Timeout);
        assert!(rx2.try_recv().unwrap().is_none());

        table.resolve(&key, Ok(Outcome::Done));
        assert_eq!(rx2.try_recv().unwrap().unwrap().unwrap(), Outcome::Done);
    }

    #[test]
    fn cancel_keeps_operation_in_flight() {
        let mut table = PendingTable::default();
        let key = OperationKey::write(peripheral(2), characteristic());

        let (waiter, rx) = Waiter::new();
        let id = waiter.id;
        table.admit(key.clone(), waiter);
        drop(rx);

        assert_eq!(table.cancel(&key, id), Some(0));
        assert!(table.contains(&key));
        assert!(table.resolve(&key, Ok(Outcome::Done)));
    }

    #[test]
    fn outcomes_convert_to_what_the_caller_asked_for() {
        let handle = Outcome::Connected(ConnectionHandle(9)).into_handle().unwrap();
        assert_eq!(handle, ConnectionHandle(9));
        assert_eq!(Outcome::Value(vec![1]).into_value().unwrap(), vec![1]);

        let err = Outcome::Done.into_handle().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Canceled);
        let err = Outcome::Connected(ConnectionHandle(9)).into_value().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Canceled);
    }

    #[test]
    fn fail_all_resolves_every_key() {
        let mut table = PendingTable::default();
        let read = OperationKey::read(peripheral(1), characteristic());
        let subscribe = OperationKey::subscribe(peripheral(1), characteristic());

        let (a, mut rx_a) = Waiter::new();
        let (b, mut rx_b) = Waiter::new();
        table.admit(read, a);
        table.admit(subscribe, b);

        assert_eq!(table.fail_all(ErrorKind::ConnectionLost.into()), 2);
        for rx in [&mut rx_a, &mut rx_b] {
            assert_eq!(
                rx.try_recv().unwrap().unwrap().unwrap_err().kind(),
                ErrorKind::ConnectionLost
            );
        }
        assert!(table.is_empty());
    }
}

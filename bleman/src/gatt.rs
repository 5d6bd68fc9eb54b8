//! Reads, writes and notification changes on a connected peripheral.

use bleman_radio::CharacteristicId;
use tracing::{debug, trace};

use crate::config::GattSerialization;
use crate::connection::{Command, Effects};
use crate::error::{Error, ErrorKind, Result};
use crate::pending::{Admission, OperationKey, OperationKind, Outcome, Waiter};
use crate::registry::{ConnectionState, PeripheralEntry};
use crate::write_queue::{GattJob, WriteJob};

impl PeripheralEntry {
    fn ensure_connected(&self) -> Result<()> {
        self.ensure_attached()?;
        if self.state() != ConnectionState::Connected {
            return Err(ErrorKind::NotConnected.into());
        }
        Ok(())
    }

    /// Admits a read. Identical reads in flight share one radio request.
    pub(crate) fn read(
        &mut self,
        characteristic: CharacteristicId,
        waiter: Waiter,
        policy: GattSerialization,
        effects: &mut Effects,
    ) -> Result<()> {
        self.ensure_connected()?;
        let key = OperationKey::read(self.id(), characteristic.clone());
        if self.pending.admit(key, waiter) == Admission::Merged {
            return Ok(());
        }
        match policy {
            GattSerialization::PerPeripheralWrites => {
                effects.command(Command::Read(characteristic));
            }
            GattSerialization::PeripheralWide => {
                self.queue.enqueue(GattJob::Read(characteristic));
                effects.command(self.pump());
            }
        }
        Ok(())
    }

    /// Queues a write behind every earlier write to this peripheral.
    pub(crate) fn write(&mut self, job: WriteJob, effects: &mut Effects) -> Result<()> {
        self.ensure_connected()?;
        trace!(
            peripheral = %self.id(),
            characteristic = %job.characteristic,
            queued = self.queue.len(),
            busy = self.queue.is_busy(),
            "write queued"
        );
        self.queue.enqueue(GattJob::Write(job));
        effects.command(self.pump());
        Ok(())
    }

    /// Admits a subscribe or unsubscribe request.
    ///
    /// Asking for the state the characteristic is already in completes at once. A change in the
    /// opposite direction still in flight is rejected with `Busy`.
    pub(crate) fn set_notify(
        &mut self,
        characteristic: CharacteristicId,
        enabled: bool,
        waiter: Waiter,
        effects: &mut Effects,
    ) -> Result<()> {
        self.ensure_connected()?;
        let id = self.id();
        let (key, opposite) = if enabled {
            (
                OperationKey::subscribe(id, characteristic.clone()),
                OperationKey::unsubscribe(id, characteristic.clone()),
            )
        } else {
            (
                OperationKey::unsubscribe(id, characteristic.clone()),
                OperationKey::subscribe(id, characteristic.clone()),
            )
        };

        if self.pending.contains(&opposite) {
            return Err(ErrorKind::Busy.into());
        }
        if !self.pending.contains(&key) && self.subscriptions.contains(&characteristic) == enabled {
            waiter.complete(Ok(Outcome::Done));
            return Ok(());
        }
        match self.pending.admit(key.clone(), waiter) {
            Admission::FirstWaiter => effects.command(Command::SetNotify {
                characteristic,
                enabled,
            }),
            Admission::Merged => {
                let waiters = self.pending.waiter_count(&key);
                trace!(%key, waiters, "joined notification change");
            }
        }
        Ok(())
    }

    /// Handles the radio's reply to a read.
    ///
    /// Replies arrive in the order the reads were issued, so a reply owed to an abandoned read is
    /// dropped rather than handed to whoever asked for the characteristic since.
    pub(crate) fn on_read(
        &mut self,
        characteristic: CharacteristicId,
        result: bleman_radio::Result<Vec<u8>>,
        effects: &mut Effects,
    ) {
        let key = OperationKey::read(self.id(), characteristic.clone());
        if self.take_abandoned_read(&characteristic) {
            debug!(%key, "discarding reply to an abandoned read");
        } else {
            let result = result
                .map(Outcome::Value)
                .map_err(|error| Error::radio(OperationKind::Read, error));
            if !self.pending.resolve(&key, result) {
                debug!(%key, "discarding late read completion");
            }
        }
        self.finish_read(&characteristic, effects);
    }

    /// The stack refused a read, so no reply will follow.
    pub(crate) fn on_read_refused(
        &mut self,
        characteristic: CharacteristicId,
        error: bleman_radio::Error,
        effects: &mut Effects,
    ) {
        let key = OperationKey::read(self.id(), characteristic.clone());
        if !self.pending.resolve(&key, Err(Error::radio(OperationKind::Read, error))) {
            self.take_abandoned_read(&characteristic);
        }
        self.finish_read(&characteristic, effects);
    }

    fn finish_read(&mut self, characteristic: &CharacteristicId, effects: &mut Effects) {
        self.queue.on_job_complete(OperationKind::Read, characteristic);
        effects.command(self.pump());
    }

    /// Notes a read every caller gave up on after it was handed to the radio.
    pub(crate) fn abandon_read(&mut self, characteristic: CharacteristicId) {
        *self.abandoned_reads.entry(characteristic).or_default() += 1;
    }

    fn take_abandoned_read(&mut self, characteristic: &CharacteristicId) -> bool {
        let Some(count) = self.abandoned_reads.get_mut(characteristic) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            self.abandoned_reads.remove(characteristic);
        }
        true
    }

    pub(crate) fn on_write(
        &mut self,
        characteristic: CharacteristicId,
        result: bleman_radio::Result<()>,
        effects: &mut Effects,
    ) {
        let key = OperationKey::write(self.id(), characteristic.clone());
        let result = result
            .map(|()| Outcome::Done)
            .map_err(|error| Error::radio(OperationKind::Write, error));
        if !self.pending.resolve(&key, result) {
            debug!(%key, "discarding late write completion");
        }
        if self.queue.on_job_complete(OperationKind::Write, &characteristic) {
            effects.command(self.pump());
        }
    }

    pub(crate) fn on_notify_state(
        &mut self,
        characteristic: CharacteristicId,
        result: bleman_radio::Result<bool>,
    ) {
        let id = self.id();
        match result {
            Ok(true) => {
                self.subscriptions.insert(characteristic.clone());
                self.pending.resolve(
                    &OperationKey::subscribe(id, characteristic),
                    Ok(Outcome::Done),
                );
            }
            Ok(false) => {
                self.subscriptions.remove(&characteristic);
                self.pending.resolve(
                    &OperationKey::unsubscribe(id, characteristic),
                    Ok(Outcome::Done),
                );
            }
            Err(error) => {
                let subscribe = OperationKey::subscribe(id, characteristic.clone());
                let key = if self.pending.contains(&subscribe) {
                    subscribe
                } else {
                    OperationKey::unsubscribe(id, characteristic)
                };
                let operation = key.kind;
                if !self.pending.resolve(&key, Err(Error::radio(operation, error))) {
                    debug!(%key, "discarding late notification state failure");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bleman_radio::{BluetoothUuid, ConnectionHandle, PeripheralId, WriteType};

    use super::*;
    use crate::registry::PeripheralRegistry;

    fn peripheral() -> PeripheralId {
        PeripheralId::Address([0xc0, 0xff, 0xee, 0, 0, 3])
    }

    fn characteristic(n: u16) -> CharacteristicId {
        CharacteristicId::new(BluetoothUuid::from_u16(0x180f), BluetoothUuid::from_u16(n))
    }

    fn connected(registry: &PeripheralRegistry) -> crate::registry::SharedEntry {
        let shared = registry.entry_or_insert(peripheral());
        {
            let mut entry = shared.lock().unwrap();
            let mut effects = Effects::default();
            let (waiter, _rx) = Waiter::new();
            entry.connect(waiter, &mut effects).unwrap();
            entry.on_connected(ConnectionHandle(1), &mut effects);
        }
        shared
    }

    #[test]
    fn gatt_requests_need_a_link() {
        let registry = PeripheralRegistry::default();
        let shared = registry.entry_or_insert(peripheral());
        let mut entry = shared.lock().unwrap();
        let mut effects = Effects::default();

        let (waiter, _rx) = Waiter::new();
        let err = entry
            .read(characteristic(1), waiter, GattSerialization::default(), &mut effects)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotConnected);
        assert!(effects.commands.is_empty());
    }

    #[test]
    fn peripheral_wide_reads_wait_for_writes() {
        let registry = PeripheralRegistry::default();
        let shared = connected(&registry);
        let mut entry = shared.lock().unwrap();
        let mut effects = Effects::default();

        let (waiter, _write_rx) = Waiter::new();
        entry
            .write(
                WriteJob {
                    characteristic: characteristic(1),
                    data: vec![0x01],
                    write_type: WriteType::WithResponse,
                    waiter,
                },
                &mut effects,
            )
            .unwrap();
        let (waiter, mut read_rx) = Waiter::new();
        entry
            .read(characteristic(2), waiter, GattSerialization::PeripheralWide, &mut effects)
            .unwrap();
        assert_eq!(effects.commands.len(), 1);

        let mut effects = Effects::default();
        entry.on_write(characteristic(1), Ok(()), &mut effects);
        assert_eq!(effects.commands, vec![Command::Read(characteristic(2))]);

        entry.on_read(characteristic(2), Ok(vec![0x64]), &mut effects);
        assert_eq!(
            read_rx.try_recv().unwrap().unwrap().unwrap(),
            Outcome::Value(vec![0x64])
        );
    }

    #[test]
    fn reply_to_an_abandoned_read_is_dropped() {
        let registry = PeripheralRegistry::default();
        let shared = connected(&registry);
        let mut entry = shared.lock().unwrap();
        let mut effects = Effects::default();
        let policy = GattSerialization::PeripheralWide;

        let (waiter, mut stale_rx) = Waiter::new();
        let stale = waiter.id;
        entry
            .read(characteristic(2), waiter, policy, &mut effects)
            .unwrap();
        let key = OperationKey::read(peripheral(), characteristic(2));
        entry.expire(&key, stale, &mut effects);
        assert_eq!(
            stale_rx.try_recv().unwrap().unwrap().unwrap_err().kind(),
            ErrorKind::Timeout
        );

        // The slot is still taken by the abandoned read.
        let (waiter, mut rx) = Waiter::new();
        let mut effects = Effects::default();
        entry
            .read(characteristic(2), waiter, policy, &mut effects)
            .unwrap();
        assert!(effects.commands.is_empty());

        entry.on_read(characteristic(2), Ok(vec![0xde, 0xad]), &mut effects);
        assert!(rx.try_recv().unwrap().is_none());
        assert_eq!(effects.commands, vec![Command::Read(characteristic(2))]);

        entry.on_read(characteristic(2), Ok(vec![0x42]), &mut effects);
        assert_eq!(
            rx.try_recv().unwrap().unwrap().unwrap(),
            Outcome::Value(vec![0x42])
        );
        assert!(entry.abandoned_reads.is_empty());
    }

    #[test]
    fn opposite_notification_change_is_busy() {
        let registry = PeripheralRegistry::default();
        let shared = connected(&registry);
        let mut entry = shared.lock().unwrap();
        let mut effects = Effects::default();

        let (waiter, mut rx) = Waiter::new();
        entry
            .set_notify(characteristic(1), true, waiter, &mut effects)
            .unwrap();
        let (waiter, _rx) = Waiter::new();
        let err = entry
            .set_notify(characteristic(1), false, waiter, &mut effects)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);

        entry.on_notify_state(characteristic(1), Ok(true));
        assert_eq!(rx.try_recv().unwrap().unwrap().unwrap(), Outcome::Done);
        assert!(entry.subscriptions.contains(&characteristic(1)));

        // Subscribing again is a no-op.
        let (waiter, mut rx) = Waiter::new();
        let mut effects = Effects::default();
        entry
            .set_notify(characteristic(1), true, waiter, &mut effects)
            .unwrap();
        assert!(effects.commands.is_empty());
        assert_eq!(rx.try_recv().unwrap().unwrap().unwrap(), Outcome::Done);
    }
}

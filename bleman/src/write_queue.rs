//! Per-peripheral serialization of GATT requests.
//!
//! A link carries one unacknowledged write at a time. Each peripheral owns an independent FIFO, so
//! a stalled peripheral never holds up another one.

use std::collections::VecDeque;

use bleman_radio::{CharacteristicId, WriteType};
use tracing::trace;

use crate::connection::Command;
use crate::error::ErrorKind;
use crate::pending::{Admission, OperationKey, OperationKind, Waiter, WaiterId};
use crate::registry::{ConnectionState, PeripheralEntry};

#[derive(Debug)]
pub(crate) struct WriteJob {
    pub characteristic: CharacteristicId,
    pub data: Vec<u8>,
    pub write_type: WriteType,
    pub waiter: Waiter,
}

#[derive(Debug)]
pub(crate) enum GattJob {
    Write(WriteJob),
    /// A read sharing the slot with writes. Its waiters live in the pending table from the moment
    /// it is queued, so identical reads merge while they wait.
    Read(CharacteristicId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct InFlight {
    kind: OperationKind,
    characteristic: CharacteristicId,
}

#[derive(Debug, Default)]
pub(crate) struct WriteQueue {
    jobs: VecDeque<GattJob>,
    in_flight: Option<InFlight>,
}

impl WriteQueue {
    pub fn enqueue(&mut self, job: GattJob) {
        self.jobs.push_back(job);
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Takes the next job for the radio, unless one is still outstanding.
    pub fn on_radio_ready(&mut self) -> Option<GattJob> {
        if self.in_flight.is_some() {
            return None;
        }
        let job = self.jobs.pop_front()?;
        self.in_flight = Some(match &job {
            GattJob::Write(job) => InFlight {
                kind: OperationKind::Write,
                characteristic: job.characteristic.clone(),
            },
            GattJob::Read(characteristic) => InFlight {
                kind: OperationKind::Read,
                characteristic: characteristic.clone(),
            },
        });
        Some(job)
    }

    /// Frees the slot if the outstanding job is the one that completed.
    pub fn on_job_complete(
        &mut self,
        kind: OperationKind,
        characteristic: &CharacteristicId,
    ) -> bool {
        let matches = self
            .in_flight
            .as_ref()
            .is_some_and(|f| f.kind == kind && &f.characteristic == characteristic);
        if matches {
            self.in_flight = None;
        }
        matches
    }

    /// Removes a write that has not been handed to the radio yet.
    pub fn remove_waiter(&mut self, waiter: WaiterId) -> Option<WriteJob> {
        let index = self
            .jobs
            .iter()
            .position(|job| matches!(job, GattJob::Write(job) if job.waiter.id == waiter))?;
        match self.jobs.remove(index) {
            Some(GattJob::Write(job)) => Some(job),
            _ => None,
        }
    }

    /// Removes a read that has not been handed to the radio yet.
    pub fn remove_queued_read(&mut self, characteristic: &CharacteristicId) -> bool {
        let before = self.jobs.len();
        self.jobs
            .retain(|job| !matches!(job, GattJob::Read(c) if c == characteristic));
        self.jobs.len() != before
    }

    /// Takes every job not handed to the radio yet. The outstanding job keeps the slot.
    pub fn drain_pending(&mut self) -> Vec<GattJob> {
        self.jobs.drain(..).collect()
    }

    /// Forgets the outstanding job. Only for a link that is gone, since its reply never comes.
    pub fn release(&mut self) {
        self.in_flight = None;
    }
}

impl PeripheralEntry {
    /// Hands the next queued job to the radio if the slot is free and the link is up.
    pub(crate) fn pump(&mut self) -> Option<Command> {
        if self.state() != ConnectionState::Connected {
            return None;
        }
        let id = self.id();
        loop {
            match self.queue.on_radio_ready()? {
                GattJob::Write(job) => {
                    let key = OperationKey::write(id, job.characteristic.clone());
                    let admission = self.pending.admit(key, job.waiter);
                    debug_assert_eq!(admission, Admission::FirstWaiter);
                    let characteristic = &job.characteristic;
                    trace!(peripheral = %id, %characteristic, "dispatching write");
                    return Some(Command::Write {
                        characteristic: job.characteristic,
                        data: job.data,
                        write_type: job.write_type,
                    });
                }
                GattJob::Read(characteristic) => {
                    let key = OperationKey::read(id, characteristic.clone());
                    if self.pending.contains(&key) {
                        trace!(peripheral = %id, %characteristic, "dispatching read");
                        return Some(Command::Read(characteristic));
                    }
                    // Every waiter left while the read was queued.
                    self.queue.on_job_complete(OperationKind::Read, &characteristic);
                }
            }
        }
    }

    /// Fails every job that has not reached the radio with `ConnectionLost`. Returns how many
    /// there were.
    pub(crate) fn flush_queue(&mut self) -> usize {
        let id = self.id();
        let jobs = self.queue.drain_pending();
        let count = jobs.len();
        for job in jobs {
            match job {
                GattJob::Write(job) => job.waiter.complete(Err(ErrorKind::ConnectionLost.into())),
                GattJob::Read(characteristic) => {
                    let key = OperationKey::read(id, characteristic);
                    self.pending.resolve(&key, Err(ErrorKind::ConnectionLost.into()));
                }
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use bleman_radio::{ConnectionHandle, PeripheralId};
    use btuuid::BluetoothUuid;

    use super::*;
    use crate::connection::Effects;
    use crate::pending::SinkReceiver;
    use crate::registry::PeripheralRegistry;

    fn characteristic(n: u16) -> CharacteristicId {
        CharacteristicId::new(BluetoothUuid::from_u16(0xfff0), BluetoothUuid::from_u16(n))
    }

    fn write_job(n: u16, byte: u8) -> (WriteJob, SinkReceiver) {
        let (waiter, rx) = Waiter::new();
        let job = WriteJob {
            characteristic: characteristic(n),
            data: vec![byte],
            write_type: WriteType::WithResponse,
            waiter,
        };
        (job, rx)
    }

    fn write(n: u16, byte: u8) -> (GattJob, SinkReceiver) {
        let (job, rx) = write_job(n, byte);
        (GattJob::Write(job), rx)
    }

    fn data(job: GattJob) -> Vec<u8> {
        match job {
            GattJob::Write(job) => job.data,
            GattJob::Read(_) => panic!("expected a write"),
        }
    }

    #[test]
    fn one_job_outstanding_at_a_time() {
        let mut queue = WriteQueue::default();
        let (a, _rx_a) = write(1, 0x01);
        let (b, _rx_b) = write(2, 0x02);
        queue.enqueue(a);
        queue.enqueue(b);

        assert_eq!(data(queue.on_radio_ready().unwrap()), vec![0x01]);
        assert!(queue.on_radio_ready().is_none());

        assert!(!queue.on_job_complete(OperationKind::Write, &characteristic(2)));
        assert!(queue.on_radio_ready().is_none());

        assert!(queue.on_job_complete(OperationKind::Write, &characteristic(1)));
        assert_eq!(data(queue.on_radio_ready().unwrap()), vec![0x02]);
    }

    #[test]
    fn draining_keeps_the_outstanding_job() {
        let mut queue = WriteQueue::default();
        let (a, _rx_a) = write(1, 0x01);
        let (b, _rx_b) = write(1, 0x02);
        queue.enqueue(a);
        queue.enqueue(b);
        queue.on_radio_ready();

        let drained = queue.drain_pending();
        assert_eq!(drained.into_iter().map(data).collect::<Vec<_>>(), vec![vec![0x02]]);
        assert!(queue.is_busy());
        assert!(queue.on_radio_ready().is_none());

        queue.release();
        assert!(!queue.is_busy());
    }

    #[test]
    fn disconnect_flushes_jobs_that_have_not_been_sent() {
        let registry = PeripheralRegistry::default();
        let shared = registry.entry_or_insert(PeripheralId::Address([0, 0, 0, 0, 0, 9]));
        let mut entry = shared.lock().unwrap();
        let mut effects = Effects::default();
        let (waiter, _rx) = Waiter::new();
        entry.connect(waiter, &mut effects).unwrap();
        entry.on_connected(ConnectionHandle(1), &mut effects);

        let (a, _rx_a) = write_job(1, 0x01);
        let (b, mut rx_b) = write_job(1, 0x02);
        let mut effects = Effects::default();
        entry.write(a, &mut effects).unwrap();
        entry.write(b, &mut effects).unwrap();
        assert_eq!(effects.commands.len(), 1);

        let (waiter, _rx) = Waiter::new();
        entry.disconnect(waiter, &mut effects).unwrap();
        let err = rx_b.try_recv().unwrap().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionLost);

        // The write already on the air still completes, and nothing follows it.
        let mut effects = Effects::default();
        entry.on_write(characteristic(1), Ok(()), &mut effects);
        assert!(effects.commands.is_empty());
        assert!(!entry.queue.is_busy());
    }

    #[test]
    fn queued_write_can_be_withdrawn() {
        let mut queue = WriteQueue::default();
        let (a, _rx_a) = write(1, 0x01);
        let (waiter, _rx_b) = Waiter::new();
        let id = waiter.id;
        queue.enqueue(a);
        queue.enqueue(GattJob::Write(WriteJob {
            characteristic: characteristic(1),
            data: vec![0x02],
            write_type: WriteType::WithoutResponse,
            waiter,
        }));

        let removed = queue.remove_waiter(id).unwrap();
        assert_eq!(removed.data, vec![0x02]);
        assert_eq!(queue.len(), 1);
        assert!(queue.remove_waiter(id).is_none());
    }
}

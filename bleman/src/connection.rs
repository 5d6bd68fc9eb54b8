//! The connect state machine of a single peripheral.
//!
//! Everything here runs under the peripheral's lock and only records what has to happen next: the
//! radio commands to submit and the events to publish. The [`Central`](crate::Central) carries
//! them out once the lock is released.

use std::collections::VecDeque;

use bleman_radio::{CharacteristicId, ConnectionHandle, WriteType};
use tracing::{debug, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::event::{CentralEvent, DisconnectEvent};
use crate::pending::{Admission, OperationKey, OperationKind, Outcome, Waiter, WaiterId};
use crate::registry::{ConnectionState, PeripheralEntry};

/// A radio command for the peripheral that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Connect,
    /// `restore` is the state to fall back to if the stack refuses the command.
    Disconnect {
        restore: Option<ConnectionState>,
    },
    Read(CharacteristicId),
    Write {
        characteristic: CharacteristicId,
        data: Vec<u8>,
        write_type: WriteType,
    },
    SetNotify {
        characteristic: CharacteristicId,
        enabled: bool,
    },
}

/// Work left over after a state change, to be carried out without holding the peripheral lock.
#[derive(Debug, Default)]
pub(crate) struct Effects {
    pub commands: Vec<Command>,
    pub events: Vec<CentralEvent>,
}

impl Effects {
    pub fn command(&mut self, command: impl Into<Option<Command>>) {
        self.commands.extend(command.into());
    }

    pub fn event(&mut self, event: CentralEvent) {
        self.events.push(event);
    }
}

/// Commands of one peripheral waiting for the radio, oldest first.
///
/// Commands are submitted without holding the peripheral lock. Only the caller holding the drain
/// claim submits them, so they reach the radio in the order they were recorded.
#[derive(Debug, Default)]
pub(crate) struct Outbox {
    commands: VecDeque<Command>,
    draining: bool,
}

impl Outbox {
    pub fn push(&mut self, commands: impl IntoIterator<Item = Command>) {
        self.commands.extend(commands);
    }

    /// Takes the drain claim if there is work and nobody else holds it.
    pub fn claim(&mut self) -> bool {
        if self.draining || self.commands.is_empty() {
            return false;
        }
        self.draining = true;
        true
    }

    /// The next command to submit. Releases the claim once nothing is left.
    pub fn pop(&mut self) -> Option<Command> {
        let command = self.commands.pop_front();
        if command.is_none() {
            self.draining = false;
        }
        command
    }
}

impl PeripheralEntry {
    pub(crate) fn ensure_attached(&self) -> Result<()> {
        if self.detached {
            Err(ErrorKind::NotFound.into())
        } else {
            Ok(())
        }
    }

    fn set_state(&mut self, to: ConnectionState, effects: &mut Effects) -> Result<ConnectionState> {
        let from = self.record.transition(to)?;
        debug!(peripheral = %self.id(), ?from, ?to, "connection state changed");
        effects.event(CentralEvent::connection(self.id(), to));
        Ok(from)
    }

    /// Moves to `to` whether or not the state machine allows it. Used when the stack reports a
    /// state the central did not ask for.
    fn force_state(&mut self, to: ConnectionState, effects: &mut Effects) {
        if self.set_state(to, effects).is_err() {
            self.record.connection_state = to;
            if to == ConnectionState::Disconnected {
                self.record.handle = None;
            }
            effects.event(CentralEvent::connection(self.id(), to));
        }
    }

    /// Admits a connect request.
    ///
    /// An already connected peripheral completes `waiter` at once; a peripheral that is connecting
    /// merges it into the attempt in flight.
    pub(crate) fn connect(&mut self, waiter: Waiter, effects: &mut Effects) -> Result<()> {
        self.ensure_attached()?;
        let key = OperationKey::connect(self.id());
        match self.state() {
            ConnectionState::Connected => {
                let handle = self.record.handle.ok_or(ErrorKind::NotConnected)?;
                waiter.complete(Ok(Outcome::Connected(handle)));
            }
            ConnectionState::Connecting => {
                self.pending.admit(key, waiter);
            }
            ConnectionState::Disconnecting => return Err(ErrorKind::AlreadyInState.into()),
            ConnectionState::Disconnected => {
                self.set_state(ConnectionState::Connecting, effects)?;
                if self.pending.admit(key, waiter) == Admission::FirstWaiter {
                    effects.command(Command::Connect);
                }
            }
        }
        Ok(())
    }

    /// Admits a disconnect request. A connect still in flight is abandoned and its waiters see
    /// `Canceled`; GATT requests that have not reached the radio fail with `ConnectionLost`.
    pub(crate) fn disconnect(&mut self, waiter: Waiter, effects: &mut Effects) -> Result<()> {
        self.ensure_attached()?;
        let key = OperationKey::disconnect(self.id());
        match self.state() {
            ConnectionState::Disconnected => waiter.complete(Ok(Outcome::Done)),
            ConnectionState::Disconnecting => {
                self.pending.admit(key, waiter);
            }
            state @ (ConnectionState::Connected | ConnectionState::Connecting) => {
                self.set_state(ConnectionState::Disconnecting, effects)?;
                self.pending.resolve(
                    &OperationKey::connect(self.id()),
                    Err(ErrorKind::Canceled.into()),
                );
                let flushed = self.flush_queue();
                if flushed > 0 {
                    debug!(peripheral = %self.id(), flushed, "flushed GATT queue");
                }
                if self.pending.admit(key, waiter) == Admission::FirstWaiter {
                    effects.command(Command::Disconnect {
                        restore: Some(state),
                    });
                }
            }
        }
        Ok(())
    }

    pub(crate) fn on_connected(&mut self, handle: ConnectionHandle, effects: &mut Effects) {
        if self.state() != ConnectionState::Connecting {
            debug!(peripheral = %self.id(), state = ?self.state(), "discarding connect completion");
            return;
        }
        self.record.handle = Some(handle);
        self.force_state(ConnectionState::Connected, effects);
        self.pending.resolve(
            &OperationKey::connect(self.id()),
            Ok(Outcome::Connected(handle)),
        );
    }

    pub(crate) fn on_connect_failed(&mut self, error: bleman_radio::Error, effects: &mut Effects) {
        if self.state() != ConnectionState::Connecting {
            debug!(peripheral = %self.id(), %error, "discarding connect failure");
            return;
        }
        self.force_state(ConnectionState::Disconnected, effects);
        self.pending.resolve(
            &OperationKey::connect(self.id()),
            Err(Error::radio(OperationKind::Connect, error)),
        );
    }

    /// Handles the link closing, requested or not.
    ///
    /// A requested disconnect resolves its waiters successfully. Every other operation for this
    /// peripheral fails with `ConnectionLost`, the GATT queue is flushed and subscriptions end.
    pub(crate) fn on_disconnected(
        &mut self,
        reason: Option<bleman_radio::Error>,
        effects: &mut Effects,
    ) {
        let id = self.id();
        if self.state() == ConnectionState::Disconnected && self.pending.is_empty() {
            debug!(peripheral = %id, "already disconnected");
            return;
        }
        match &reason {
            Some(error) => warn!(peripheral = %id, %error, "link lost"),
            None => debug!(peripheral = %id, "disconnected"),
        }

        self.force_state(ConnectionState::Disconnected, effects);
        self.pending
            .resolve(&OperationKey::disconnect(id), Ok(Outcome::Done));
        let flushed = self.flush_queue();
        self.queue.release();
        self.abandoned_reads.clear();
        let failed = self.pending.fail_all(ErrorKind::ConnectionLost.into());
        self.subscriptions.clear();
        if failed + flushed > 0 {
            debug!(peripheral = %id, failed, flushed, "failed outstanding operations");
        }

        effects.event(CentralEvent::Disconnected(DisconnectEvent {
            peripheral: id,
            reason,
        }));
    }

    /// Abandons a connect attempt nobody waits for anymore.
    fn abort_connect(&mut self, effects: &mut Effects) {
        self.pending.discard(&OperationKey::connect(self.id()));
        if self.state() == ConnectionState::Connecting {
            debug!(peripheral = %self.id(), "aborting connect");
            self.force_state(ConnectionState::Disconnected, effects);
            effects.command(Command::Disconnect { restore: None });
        }
    }

    /// Registers a link the host system opened on its own. Callers waiting on a connect attempt
    /// get the adopted link.
    pub(crate) fn adopt_link(&mut self, handle: ConnectionHandle, effects: &mut Effects) {
        if self.state() == ConnectionState::Disconnecting {
            debug!(peripheral = %self.id(), "link is closing, not adopting it");
            return;
        }
        self.record.handle = Some(handle);
        if self.state() != ConnectionState::Connected {
            self.force_state(ConnectionState::Connected, effects);
        }
        self.pending.resolve(
            &OperationKey::connect(self.id()),
            Ok(Outcome::Connected(handle)),
        );
    }

    /// Handles one waiter's deadline elapsing.
    pub(crate) fn expire(&mut self, key: &OperationKey, waiter: WaiterId, effects: &mut Effects) {
        match self.pending.expire(key, waiter) {
            Some(0) => match key.kind {
                OperationKind::Connect => self.abort_connect(effects),
                // The stack still owns the write; the slot stays taken until it answers.
                OperationKind::Write => {}
                OperationKind::Read => {
                    self.pending.discard(key);
                    if let Some(characteristic) = &key.characteristic {
                        if !self.queue.remove_queued_read(characteristic) {
                            self.abandon_read(characteristic.clone());
                        }
                    }
                }
                _ => {
                    self.pending.discard(key);
                }
            },
            Some(_) => {}
            None => {
                if let Some(job) = self.queue.remove_waiter(waiter) {
                    job.waiter.complete(Err(ErrorKind::Timeout.into()));
                }
            }
        }
    }

    /// Handles a waiter that stopped listening. The operation keeps running for the others.
    pub(crate) fn cancel(&mut self, key: &OperationKey, waiter: WaiterId) {
        match self.pending.cancel(key, waiter) {
            Some(remaining) => {
                debug!(%key, remaining, "waiter canceled");
            }
            None => {
                self.queue.remove_waiter(waiter);
            }
        }
    }

    /// Settles a command once the stack accepted or refused it.
    pub(crate) fn after_submit(
        &mut self,
        command: Command,
        submitted: bleman_radio::Result<()>,
        effects: &mut Effects,
    ) {
        let id = self.id();
        let error = match submitted {
            Ok(()) => {
                if let Command::Write {
                    characteristic,
                    write_type: WriteType::WithoutResponse,
                    ..
                } = command
                {
                    self.on_write(characteristic, Ok(()), effects);
                }
                return;
            }
            Err(error) => error,
        };
        warn!(peripheral = %id, ?command, %error, "radio refused command");

        match command {
            Command::Connect => {
                let key = OperationKey::connect(id);
                if self.pending.resolve(&key, Err(Error::radio(OperationKind::Connect, error)))
                    && self.state() == ConnectionState::Connecting
                {
                    self.force_state(ConnectionState::Disconnected, effects);
                }
            }
            Command::Disconnect { restore } => {
                let key = OperationKey::disconnect(id);
                let error = Error::radio(OperationKind::Disconnect, error);
                self.pending.resolve(&key, Err(error));
                if let Some(restore) = restore {
                    if self.state() == ConnectionState::Disconnecting {
                        self.force_state(restore, effects);
                    }
                }
            }
            Command::Read(characteristic) => self.on_read_refused(characteristic, error, effects),
            Command::Write { characteristic, .. } => {
                self.on_write(characteristic, Err(error), effects)
            }
            Command::SetNotify {
                characteristic,
                enabled,
            } => {
                let key = if enabled {
                    OperationKey::subscribe(id, characteristic)
                } else {
                    OperationKey::unsubscribe(id, characteristic)
                };
                let operation = key.kind;
                self.pending
                    .resolve(&key, Err(Error::radio(operation, error)));
            }
        }
    }
}

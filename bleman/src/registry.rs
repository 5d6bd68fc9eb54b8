//! Known peripherals and the per-peripheral state guarded by their critical section.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use bleman_radio::advertisement_data::AdvertisementData;
use bleman_radio::{CharacteristicId, ConnectionHandle, PeripheralId};

use crate::connection::Outbox;
use crate::error::{ErrorKind, Result};
use crate::pending::PendingTable;
use crate::util::lock;
use crate::write_queue::WriteQueue;

/// The link state of a peripheral.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    /// Whether the state machine allows moving from `self` to `to`.
    ///
    /// The regular cycle is Disconnected → Connecting → Connected → Disconnecting → Disconnected.
    /// A failed or canceled connect and a dropped link shortcut back to Disconnected, and a
    /// pending connect may be abandoned through Disconnecting.
    pub fn can_transition(self, to: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, to),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnecting)
                | (Connecting, Disconnected)
                | (Connected, Disconnecting)
                | (Connected, Disconnected)
                | (Disconnecting, Disconnected)
        )
    }
}

/// What is known about a peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralRecord {
    pub id: PeripheralId,
    pub connection_state: ConnectionState,
    /// The most recent advertisement, if the peripheral was discovered by a scan.
    pub advertisement_data: Option<AdvertisementData>,
    pub rssi: Option<i16>,
    /// When the peripheral was first discovered.
    pub discovered_at: Option<SystemTime>,
    /// The stack's handle for the current link. Kept while disconnecting.
    pub handle: Option<ConnectionHandle>,
}

impl PeripheralRecord {
    fn new(id: PeripheralId) -> Self {
        Self {
            id,
            connection_state: ConnectionState::Disconnected,
            advertisement_data: None,
            rssi: None,
            discovered_at: None,
            handle: None,
        }
    }

    pub(crate) fn observe(&mut self, advertisement_data: AdvertisementData, rssi: i16) {
        self.discovered_at.get_or_insert_with(SystemTime::now);
        self.advertisement_data = Some(advertisement_data);
        self.rssi = Some(rssi);
    }

    /// Moves to `to`, rejecting transitions the state machine does not allow.
    pub(crate) fn transition(&mut self, to: ConnectionState) -> Result<ConnectionState> {
        let from = self.connection_state;
        if !from.can_transition(to) {
            return Err(ErrorKind::AlreadyInState.into());
        }
        self.connection_state = to;
        if to == ConnectionState::Disconnected {
            self.handle = None;
        }
        Ok(from)
    }
}

/// Everything owned by one peripheral. Guarded by a single lock, so admission and resolution of
/// its operations never interleave.
#[derive(Debug)]
pub(crate) struct PeripheralEntry {
    pub record: PeripheralRecord,
    pub pending: PendingTable,
    pub queue: WriteQueue,
    pub outbox: Outbox,
    pub subscriptions: HashSet<CharacteristicId>,
    /// Reads every caller gave up on while the radio still owes a reply, per characteristic.
    /// Those replies are dropped instead of resolving a later read.
    pub abandoned_reads: HashMap<CharacteristicId, usize>,
    /// Set once the entry has been removed from the registry.
    pub detached: bool,
}

impl PeripheralEntry {
    fn new(id: PeripheralId) -> Self {
        Self {
            record: PeripheralRecord::new(id),
            pending: PendingTable::default(),
            queue: WriteQueue::default(),
            outbox: Outbox::default(),
            subscriptions: HashSet::new(),
            abandoned_reads: HashMap::new(),
            detached: false,
        }
    }

    pub fn id(&self) -> PeripheralId {
        self.record.id
    }

    pub fn state(&self) -> ConnectionState {
        self.record.connection_state
    }
}

pub(crate) type SharedEntry = Arc<Mutex<PeripheralEntry>>;

/// The set of known peripherals.
///
/// The registry lock only guards membership. It is never taken while a peripheral's own lock is
/// held.
#[derive(Debug, Default)]
pub(crate) struct PeripheralRegistry {
    entries: Mutex<HashMap<PeripheralId, SharedEntry>>,
}

impl PeripheralRegistry {
    pub fn entry(&self, id: PeripheralId) -> Option<SharedEntry> {
        lock(&self.entries).get(&id).cloned()
    }

    pub fn entry_or_insert(&self, id: PeripheralId) -> SharedEntry {
        lock(&self.entries)
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(PeripheralEntry::new(id))))
            .clone()
    }

    /// Records an advertisement, registering the peripheral on first sight.
    pub fn upsert(
        &self,
        id: PeripheralId,
        advertisement_data: AdvertisementData,
        rssi: i16,
    ) -> PeripheralRecord {
        loop {
            let entry = self.entry_or_insert(id);
            let mut entry = lock(&entry);
            if entry.detached {
                continue;
            }
            entry.record.observe(advertisement_data, rssi);
            return entry.record.clone();
        }
    }

    pub fn get(&self, id: PeripheralId) -> Result<PeripheralRecord> {
        let entry = self.entry(id).ok_or(ErrorKind::NotFound)?;
        let record = lock(&entry).record.clone();
        Ok(record)
    }

    /// Forgets a peripheral. Only an idle, disconnected peripheral can be removed.
    pub fn remove(&self, id: PeripheralId) -> Result<PeripheralRecord> {
        let mut entries = lock(&self.entries);
        let shared = entries.get(&id).ok_or(ErrorKind::NotFound)?.clone();
        let mut entry = lock(&shared);
        if entry.state() != ConnectionState::Disconnected || !entry.pending.is_empty() {
            return Err(ErrorKind::AlreadyInState.into());
        }
        entry.detached = true;
        entries.remove(&id);
        Ok(entry.record.clone())
    }

    pub fn records(&self) -> Vec<PeripheralRecord> {
        let entries: Vec<_> = lock(&self.entries).values().cloned().collect();
        entries
            .iter()
            .map(|entry| lock(entry).record.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peripheral() -> PeripheralId {
        PeripheralId::Address([0xc0, 0xff, 0xee, 0, 0, 1])
    }

    fn set_state(
        registry: &PeripheralRegistry,
        state: ConnectionState,
    ) -> Result<ConnectionState> {
        let entry = registry.entry(peripheral()).ok_or(ErrorKind::NotFound)?;
        let mut entry = lock(&entry);
        entry.record.transition(state)
    }

    #[test]
    fn follows_connection_cycle() {
        let registry = PeripheralRegistry::default();
        registry.upsert(peripheral(), AdvertisementData::default(), -60);

        for state in [
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnecting,
            ConnectionState::Disconnected,
        ] {
            set_state(&registry, state).unwrap();
            assert_eq!(registry.get(peripheral()).unwrap().connection_state, state);
        }
    }

    #[test]
    fn rejects_illegal_transitions() {
        let registry = PeripheralRegistry::default();
        registry.upsert(peripheral(), AdvertisementData::default(), -60);
        set_state(&registry, ConnectionState::Connecting).unwrap();
        set_state(&registry, ConnectionState::Connected).unwrap();

        let err = set_state(&registry, ConnectionState::Connected).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyInState);
        let err = set_state(&registry, ConnectionState::Connecting).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyInState);
    }

    #[test]
    fn upsert_keeps_first_discovery_time() {
        let registry = PeripheralRegistry::default();
        let first = registry.upsert(peripheral(), AdvertisementData::default(), -70);
        let adv = AdvertisementData {
            local_name: Some("sensor".into()),
            ..Default::default()
        };
        let second = registry.upsert(peripheral(), adv, -40);

        assert_eq!(first.discovered_at, second.discovered_at);
        assert_eq!(second.rssi, Some(-40));
        assert_eq!(
            second.advertisement_data.unwrap().local_name.as_deref(),
            Some("sensor")
        );
    }

    #[test]
    fn remove_requires_disconnected() {
        let registry = PeripheralRegistry::default();
        registry.upsert(peripheral(), AdvertisementData::default(), -60);
        set_state(&registry, ConnectionState::Connecting).unwrap();

        assert_eq!(
            registry.remove(peripheral()).unwrap_err().kind(),
            ErrorKind::AlreadyInState
        );
        set_state(&registry, ConnectionState::Disconnected).unwrap();
        registry.remove(peripheral()).unwrap();
        assert_eq!(registry.get(peripheral()).unwrap_err().kind(), ErrorKind::NotFound);
    }
}

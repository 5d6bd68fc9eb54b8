use std::sync::{Arc, Weak};
use std::time::Duration;

use async_io::Timer;
use bleman_radio::advertisement_data::AdvertisementData;
use bleman_radio::{
    AdapterState, BluetoothUuid, CharacteristicId, ConnectionHandle, PeripheralId, RadioAdapter,
    RadioDelegate, WriteType,
};
use futures_lite::future;
use tracing::{debug, info, trace};

use crate::config::{CentralConfig, ScanOptions};
use crate::connection::{Command, Effects};
use crate::error::{ErrorKind, Result};
use crate::event::{CentralEvent, DiscoveryEvent, NotificationEvent};
use crate::pending::{OperationKey, Outcome, SinkReceiver, Waiter, WaiterId};
use crate::registry::{
    ConnectionState, PeripheralEntry, PeripheralRecord, PeripheralRegistry, SharedEntry,
};
use crate::router::{
    EventRouter, EventStream, Interest, NotificationStream, ObserverToken, ScanStream,
};
use crate::util::{BroadcastReceiver, BroadcastSender, broadcast, defer, lock};
use crate::write_queue::WriteJob;

/// The request interface of a BLE central.
///
/// Requests may be issued from any number of tasks at once. Identical requests in flight share one
/// radio command, GATT requests to a peripheral are serialized per peripheral, and completions
/// reported by the radio are routed back to every caller waiting on them.
///
/// A `Central` does not spawn tasks and works with any executor. Completions arrive through the
/// [`RadioDelegate`] returned by [`Central::radio_delegate`], which must be attached to the radio.
/// The only thread it starts is a sleeper that ends a scan when its duration elapses.
#[derive(Debug, Clone)]
pub struct Central {
    inner: Arc<Inner>,
}

struct Inner {
    radio: Arc<dyn RadioAdapter>,
    config: CentralConfig,
    registry: PeripheralRegistry,
    router: Arc<EventRouter>,
    state_updates: BroadcastSender<AdapterState>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

impl Central {
    pub fn new(radio: Arc<dyn RadioAdapter>, config: CentralConfig) -> Self {
        let router = Arc::new(EventRouter::new(radio.clone()));
        let state_updates = broadcast(config.state_capacity);
        Self {
            inner: Arc::new(Inner {
                radio,
                config,
                registry: PeripheralRegistry::default(),
                router,
                state_updates,
            }),
        }
    }

    /// The callbacks the radio reports completions and events through.
    ///
    /// The delegate only holds a weak reference, so attaching it to the radio does not keep the
    /// central alive.
    pub fn radio_delegate(&self) -> Arc<dyn RadioDelegate> {
        Arc::new(RadioEvents {
            inner: Arc::downgrade(&self.inner),
        })
    }

    pub fn config(&self) -> &CentralConfig {
        &self.inner.config
    }

    pub fn state(&self) -> AdapterState {
        self.inner.radio.state()
    }

    pub fn state_updates(&self) -> BroadcastReceiver<AdapterState> {
        self.inner.state_updates.new_receiver()
    }

    /// Every event the central reports, from now on.
    pub fn events(&self) -> EventStream {
        EventStream::new(self.inner.router.clone(), Interest::All)
    }

    /// Scans for peripherals matching `options`.
    ///
    /// The radio keeps scanning while at least one scan stream is alive. If the adapter is not
    /// powered on yet, the scan starts once it is.
    pub fn scan(&self, options: ScanOptions) -> Result<ScanStream> {
        let duration = options.duration;
        let events = EventStream::new(self.inner.router.clone(), Interest::Scan(options));
        let mut deadline = None;
        if let Some(duration) = duration {
            if !self.inner.router.end_scan_after(events.token(), duration) {
                deadline = Some(Timer::after(duration));
            }
        }
        self.inner.router.refresh_scan()?;
        Ok(ScanStream::new(events, deadline))
    }

    /// Values pushed by `peripheral` on `characteristic`. Notifications must be enabled with
    /// [`Central::subscribe`] for the peripheral to send any.
    pub fn notifications(
        &self,
        peripheral: PeripheralId,
        characteristic: CharacteristicId,
    ) -> NotificationStream {
        NotificationStream::new(EventStream::new(
            self.inner.router.clone(),
            Interest::Notifications {
                peripheral,
                characteristic,
            },
        ))
    }

    /// Detaches an observer, ending its stream.
    pub fn unsubscribe_observer(&self, token: ObserverToken) {
        self.inner.router.unsubscribe(token);
    }

    /// Connects to `peripheral`, registering it if it is not known yet.
    ///
    /// Concurrent connects to the same peripheral share one attempt. `timeout` defaults to
    /// [`CentralConfig::connect_timeout`]; when the last caller waiting on an attempt times out, the
    /// attempt is abandoned.
    pub async fn connect(
        &self,
        peripheral: PeripheralId,
        timeout: Option<Duration>,
    ) -> Result<ConnectionHandle> {
        self.inner.ensure_usable()?;
        let shared = self.inner.registry.entry_or_insert(peripheral);
        let (waiter, receiver) = Waiter::new();
        let waiter_id = waiter.id;

        self.inner
            .update(peripheral, &shared, |entry, effects| entry.connect(waiter, effects))?;

        let timeout = timeout.or(self.inner.config.connect_timeout);
        let key = OperationKey::connect(peripheral);
        self.wait(&shared, key, waiter_id, receiver, timeout)
            .await?
            .into_handle()
    }

    /// Disconnects from `peripheral`. Succeeds at once if it is not connected.
    pub async fn disconnect(&self, peripheral: PeripheralId) -> Result<()> {
        self.inner.ensure_usable()?;
        let shared = self.inner.known(peripheral)?;
        let (waiter, receiver) = Waiter::new();
        let waiter_id = waiter.id;

        self.inner
            .update(peripheral, &shared, |entry, effects| entry.disconnect(waiter, effects))?;

        let key = OperationKey::disconnect(peripheral);
        let timeout = self.inner.config.default_timeout;
        self.wait(&shared, key, waiter_id, receiver, timeout).await?;
        Ok(())
    }

    /// Reads the value of a characteristic.
    pub async fn read(
        &self,
        peripheral: PeripheralId,
        characteristic: CharacteristicId,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        self.inner.ensure_usable()?;
        let shared = self.inner.known(peripheral)?;
        let (waiter, receiver) = Waiter::new();
        let waiter_id = waiter.id;

        let policy = self.inner.config.gatt_serialization;
        let key = OperationKey::read(peripheral, characteristic.clone());
        self.inner.update(peripheral, &shared, |entry, effects| {
            entry.read(characteristic, waiter, policy, effects)
        })?;

        let timeout = timeout.or(self.inner.config.default_timeout);
        self.wait(&shared, key, waiter_id, receiver, timeout)
            .await?
            .into_value()
    }

    /// Writes the value of a characteristic.
    ///
    /// Writes to one peripheral reach the radio one at a time, in the order they were made. A
    /// [`WriteType::WithoutResponse`] write completes once the radio accepts it.
    pub async fn write(
        &self,
        peripheral: PeripheralId,
        characteristic: CharacteristicId,
        data: impl Into<Vec<u8>>,
        write_type: WriteType,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.inner.ensure_usable()?;
        let shared = self.inner.known(peripheral)?;
        let (waiter, receiver) = Waiter::new();
        let waiter_id = waiter.id;

        let job = WriteJob {
            characteristic: characteristic.clone(),
            data: data.into(),
            write_type,
            waiter,
        };
        self.inner
            .update(peripheral, &shared, |entry, effects| entry.write(job, effects))?;

        let key = OperationKey::write(peripheral, characteristic);
        let timeout = timeout.or(self.inner.config.default_timeout);
        self.wait(&shared, key, waiter_id, receiver, timeout).await?;
        Ok(())
    }

    /// Enables notifications on a characteristic.
    pub async fn subscribe(
        &self,
        peripheral: PeripheralId,
        characteristic: CharacteristicId,
    ) -> Result<()> {
        self.set_notify(peripheral, characteristic, true).await
    }

    /// Disables notifications on a characteristic.
    pub async fn unsubscribe(
        &self,
        peripheral: PeripheralId,
        characteristic: CharacteristicId,
    ) -> Result<()> {
        self.set_notify(peripheral, characteristic, false).await
    }

    async fn set_notify(
        &self,
        peripheral: PeripheralId,
        characteristic: CharacteristicId,
        enabled: bool,
    ) -> Result<()> {
        self.inner.ensure_usable()?;
        let shared = self.inner.known(peripheral)?;
        let (waiter, receiver) = Waiter::new();
        let waiter_id = waiter.id;

        let key = if enabled {
            OperationKey::subscribe(peripheral, characteristic.clone())
        } else {
            OperationKey::unsubscribe(peripheral, characteristic.clone())
        };
        self.inner.update(peripheral, &shared, |entry, effects| {
            entry.set_notify(characteristic, enabled, waiter, effects)
        })?;

        let timeout = self.inner.config.default_timeout;
        self.wait(&shared, key, waiter_id, receiver, timeout).await?;
        Ok(())
    }

    pub fn peripheral(&self, peripheral: PeripheralId) -> Result<PeripheralRecord> {
        self.inner.registry.get(peripheral)
    }

    pub fn peripherals(&self) -> Vec<PeripheralRecord> {
        self.inner.registry.records()
    }

    /// Removes a disconnected peripheral from the registry.
    pub fn forget(&self, peripheral: PeripheralId) -> Result<PeripheralRecord> {
        self.inner.registry.remove(peripheral)
    }

    /// Peripherals connected to the host by someone else that expose any of `services`. They are
    /// registered as connected, and a connect already waiting on one of them completes with the
    /// system's link.
    pub fn connected_peripherals(
        &self,
        services: &[BluetoothUuid],
    ) -> Result<Vec<PeripheralRecord>> {
        self.inner.ensure_usable()?;
        let links = self.inner.radio.connected_peripherals(services);
        let mut records = Vec::with_capacity(links.len());
        for (id, handle) in links {
            let shared = self.inner.registry.entry_or_insert(id);
            let record = self.inner.update(id, &shared, |entry, effects| {
                entry.adopt_link(handle, effects);
                entry.record.clone()
            });
            records.push(record);
        }
        Ok(records)
    }

    /// Waits for the operation `waiter` joined, giving up after `timeout`.
    ///
    /// Dropping the returned future withdraws the waiter; the operation itself keeps running for
    /// any other caller.
    async fn wait(
        &self,
        shared: &SharedEntry,
        key: OperationKey,
        waiter: WaiterId,
        mut receiver: SinkReceiver,
        timeout: Option<Duration>,
    ) -> Result<Outcome> {
        let guard = defer(|| lock(shared).cancel(&key, waiter));

        let res = match timeout {
            Some(timeout) => {
                let expired = async {
                    Timer::after(timeout).await;
                    None
                };
                let first = future::or(async { Some((&mut receiver).await) }, expired).await;
                match first {
                    Some(res) => res,
                    None => {
                        debug!(%key, ?timeout, "waiter timed out");
                        self.inner.expire(shared, &key, waiter);
                        receiver.await
                    }
                }
            }
            None => receiver.await,
        };

        guard.defuse();
        res?
    }
}

impl Inner {
    fn ensure_usable(&self) -> Result<()> {
        if self.radio.state().is_usable() {
            Ok(())
        } else {
            Err(ErrorKind::Unavailable.into())
        }
    }

    fn known(&self, peripheral: PeripheralId) -> Result<SharedEntry> {
        self.registry
            .entry(peripheral)
            .ok_or_else(|| ErrorKind::NotFound.into())
    }

    fn expire(&self, shared: &SharedEntry, key: &OperationKey, waiter: WaiterId) {
        self.update(key.peripheral, shared, |entry, effects| {
            entry.expire(key, waiter, effects)
        });
    }

    /// Runs `f` under the peripheral's lock, then publishes the events it recorded and hands its
    /// commands to the radio.
    fn update<R>(
        &self,
        peripheral: PeripheralId,
        shared: &SharedEntry,
        f: impl FnOnce(&mut PeripheralEntry, &mut Effects) -> R,
    ) -> R {
        let mut effects = Effects::default();
        let (res, claimed) = {
            let mut entry = lock(shared);
            let res = f(&mut *entry, &mut effects);
            entry.outbox.push(effects.commands.drain(..));
            (res, entry.outbox.claim())
        };
        for event in effects.events {
            self.router.emit(event);
        }
        if claimed {
            self.drain(peripheral, shared);
        }
        res
    }

    /// Submits the peripheral's outbox one command at a time, settling each before the next.
    ///
    /// Commands recorded meanwhile, including from callbacks the radio makes while a command is
    /// being submitted, are picked up by this loop.
    fn drain(&self, peripheral: PeripheralId, shared: &SharedEntry) {
        loop {
            let Some(command) = lock(shared).outbox.pop() else {
                return;
            };
            let submitted = self.submit(peripheral, &command);
            let mut followup = Effects::default();
            {
                let mut entry = lock(shared);
                entry.after_submit(command, submitted, &mut followup);
                entry.outbox.push(followup.commands.drain(..));
            }
            for event in followup.events {
                self.router.emit(event);
            }
        }
    }

    fn submit(&self, peripheral: PeripheralId, command: &Command) -> bleman_radio::Result<()> {
        trace!(%peripheral, ?command, "submitting command");
        match command {
            Command::Connect => self.radio.connect(peripheral),
            Command::Disconnect { .. } => self.radio.disconnect(peripheral),
            Command::Read(characteristic) => self.radio.read_value(peripheral, characteristic),
            Command::Write {
                characteristic,
                data,
                write_type,
            } => self
                .radio
                .write_value(peripheral, characteristic, data, *write_type),
            Command::SetNotify {
                characteristic,
                enabled,
            } => self.radio.set_notify(peripheral, characteristic, *enabled),
        }
    }

    /// Runs `f` against a known peripheral's entry and carries out its effects.
    fn with_entry(
        &self,
        peripheral: PeripheralId,
        what: &str,
        f: impl FnOnce(&mut PeripheralEntry, &mut Effects),
    ) {
        let Some(shared) = self.registry.entry(peripheral) else {
            debug!(%peripheral, what, "discarding callback for unknown peripheral");
            return;
        };
        self.update(peripheral, &shared, f);
    }

    fn on_state(&self, state: AdapterState) {
        info!(?state, "adapter state changed");
        let _ = self.state_updates.try_broadcast(state);
        self.router.emit(CentralEvent::StateUpdated(state));
        self.router.on_state(state);

        if !state.is_usable() {
            let reason = bleman_radio::Error::new(
                bleman_radio::error::ErrorKind::Other,
                format!("adapter is {state:?}"),
            );
            for record in self.registry.records() {
                if record.connection_state != ConnectionState::Disconnected {
                    self.with_entry(record.id, "state", |entry, effects| {
                        entry.on_disconnected(Some(reason.clone()), effects)
                    });
                }
            }
        }
    }

    fn on_discover(
        &self,
        peripheral: PeripheralId,
        advertisement_data: AdvertisementData,
        rssi: i16,
    ) {
        trace!(%peripheral, rssi, "discovered");
        self.registry
            .upsert(peripheral, advertisement_data.clone(), rssi);
        self.router.emit(CentralEvent::Discovered(DiscoveryEvent {
            peripheral,
            advertisement_data,
            rssi,
        }));
    }
}

/// Feeds radio callbacks into a [`Central`].
struct RadioEvents {
    inner: Weak<Inner>,
}

impl RadioEvents {
    fn inner(&self) -> Option<Arc<Inner>> {
        self.inner.upgrade()
    }
}

impl RadioDelegate for RadioEvents {
    fn did_update_state(&self, state: AdapterState) {
        if let Some(inner) = self.inner() {
            inner.on_state(state);
        }
    }

    fn did_discover(
        &self,
        peripheral: PeripheralId,
        advertisement_data: AdvertisementData,
        rssi: i16,
    ) {
        if let Some(inner) = self.inner() {
            inner.on_discover(peripheral, advertisement_data, rssi);
        }
    }

    fn did_stop_scan(&self) {
        if let Some(inner) = self.inner() {
            inner.router.on_scan_stopped();
        }
    }

    fn did_connect(&self, peripheral: PeripheralId, handle: ConnectionHandle) {
        if let Some(inner) = self.inner() {
            inner.with_entry(peripheral, "connect", |entry, effects| {
                entry.on_connected(handle, effects)
            });
        }
    }

    fn did_fail_to_connect(&self, peripheral: PeripheralId, error: bleman_radio::Error) {
        if let Some(inner) = self.inner() {
            inner.with_entry(peripheral, "connect failure", |entry, effects| {
                entry.on_connect_failed(error, effects)
            });
        }
    }

    fn did_disconnect(&self, peripheral: PeripheralId, error: Option<bleman_radio::Error>) {
        if let Some(inner) = self.inner() {
            inner.with_entry(peripheral, "disconnect", |entry, effects| {
                entry.on_disconnected(error, effects)
            });
        }
    }

    fn did_read_value(
        &self,
        peripheral: PeripheralId,
        characteristic: CharacteristicId,
        result: bleman_radio::Result<Vec<u8>>,
    ) {
        if let Some(inner) = self.inner() {
            inner.with_entry(peripheral, "read", |entry, effects| {
                entry.on_read(characteristic, result, effects)
            });
        }
    }

    fn did_write_value(
        &self,
        peripheral: PeripheralId,
        characteristic: CharacteristicId,
        result: bleman_radio::Result<()>,
    ) {
        if let Some(inner) = self.inner() {
            inner.with_entry(peripheral, "write", |entry, effects| {
                entry.on_write(characteristic, result, effects)
            });
        }
    }

    fn did_update_notification_state(
        &self,
        peripheral: PeripheralId,
        characteristic: CharacteristicId,
        result: bleman_radio::Result<bool>,
    ) {
        if let Some(inner) = self.inner() {
            inner.with_entry(peripheral, "notification state", |entry, _| {
                entry.on_notify_state(characteristic, result)
            });
        }
    }

    fn did_receive_notification(
        &self,
        peripheral: PeripheralId,
        characteristic: CharacteristicId,
        value: Vec<u8>,
    ) {
        if let Some(inner) = self.inner() {
            trace!(%peripheral, %characteristic, len = value.len(), "notification");
            inner.router.emit(CentralEvent::Notification(NotificationEvent {
                peripheral,
                characteristic,
                value,
            }));
        }
    }
}

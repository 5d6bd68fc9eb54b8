//! Fan-out of unsolicited radio events to observers.
//!
//! The radio only scans while at least one scan observer is attached. Attaching the first one
//! starts the scan, a change in the combined filter restarts it, and detaching the last one stops
//! it.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_io::Timer;
use bleman_radio::{AdapterState, CharacteristicId, PeripheralId, RadioAdapter, ScanFilter};
use futures_channel::mpsc;
use futures_lite::{Stream, ready};
use tracing::{debug, trace, warn};

use crate::config::ScanOptions;
use crate::error::{Error, Result};
use crate::event::{CentralEvent, DiscoveryEvent};
use crate::pending::OperationKind;
use crate::util::lock;

/// Identifies an attached observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObserverToken(u64);

/// Which events an observer receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interest {
    /// Every event.
    All,
    /// Discoveries matching the options. Keeps the radio scanning while attached.
    Scan(ScanOptions),
    /// Notifications on one characteristic. Detached when the peripheral disconnects.
    Notifications {
        peripheral: PeripheralId,
        characteristic: CharacteristicId,
    },
}

struct Observer {
    interest: Interest,
    sender: mpsc::UnboundedSender<CentralEvent>,
    /// Peripherals already reported to a scan observer that does not want duplicates.
    seen: HashSet<PeripheralId>,
}

enum Delivery {
    Send,
    Skip,
    Detach,
}

impl Observer {
    fn delivery(&mut self, event: &CentralEvent) -> Delivery {
        match (&self.interest, event) {
            (Interest::All, _) => Delivery::Send,
            (Interest::Scan(options), CentralEvent::Discovered(discovery)) => {
                if options.matches(&discovery.advertisement_data)
                    && (options.allow_duplicates || self.seen.insert(discovery.peripheral))
                {
                    Delivery::Send
                } else {
                    Delivery::Skip
                }
            }
            (
                Interest::Notifications {
                    peripheral,
                    characteristic,
                },
                CentralEvent::Notification(notification),
            ) if *peripheral == notification.peripheral
                && *characteristic == notification.characteristic =>
            {
                Delivery::Send
            }
            (Interest::Notifications { peripheral, .. }, CentralEvent::Disconnected(disconnect))
                if *peripheral == disconnect.peripheral =>
            {
                Delivery::Detach
            }
            _ => Delivery::Skip,
        }
    }

    fn is_scan(&self) -> bool {
        matches!(self.interest, Interest::Scan(_))
    }
}

pub(crate) struct EventRouter {
    radio: Arc<dyn RadioAdapter>,
    next_token: AtomicU64,
    observers: Mutex<BTreeMap<ObserverToken, Observer>>,
    /// The filter the radio is scanning with, if it is scanning. Also serializes scan commands.
    scan: Mutex<Option<ScanFilter>>,
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("observers", &self.observer_count())
            .field("scan", &*lock(&self.scan))
            .finish()
    }
}

impl EventRouter {
    pub fn new(radio: Arc<dyn RadioAdapter>) -> Self {
        Self {
            radio,
            next_token: AtomicU64::new(1),
            observers: Mutex::new(BTreeMap::new()),
            scan: Mutex::new(None),
        }
    }

    /// Attaches an observer. Events emitted before this call are not replayed.
    ///
    /// A scan observer does not start the radio by itself; see [`EventRouter::refresh_scan`].
    pub fn subscribe(
        &self,
        interest: Interest,
    ) -> (ObserverToken, mpsc::UnboundedReceiver<CentralEvent>) {
        let token = ObserverToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::unbounded();
        trace!(?token, ?interest, "observer attached");
        lock(&self.observers).insert(
            token,
            Observer {
                interest,
                sender,
                seen: HashSet::new(),
            },
        );
        (token, receiver)
    }

    /// Detaches an observer, ending its stream. Unknown tokens are ignored.
    pub fn unsubscribe(&self, token: ObserverToken) {
        // The observer's sender outlives the scan update, so its stream ends after the radio stops.
        let removed = lock(&self.observers).remove(&token);
        if let Some(observer) = removed {
            trace!(?token, "observer detached");
            if observer.is_scan() {
                self.refresh_scan_logged();
            }
        }
    }

    /// Detaches the scan observer `token` once `duration` has passed, whether or not anyone polls
    /// its stream. Returns `false` if no timer could be started.
    pub fn end_scan_after(self: &Arc<Self>, token: ObserverToken, duration: Duration) -> bool {
        let router = Arc::downgrade(self);
        let spawned = std::thread::Builder::new()
            .name("bleman-scan-timer".into())
            .spawn(move || {
                std::thread::sleep(duration);
                if let Some(router) = router.upgrade() {
                    debug!(?token, "scan duration elapsed");
                    router.unsubscribe(token);
                }
            });
        match spawned {
            Ok(_) => true,
            Err(error) => {
                warn!(%error, "no scan timer, the scan ends when its stream is next polled");
                false
            }
        }
    }

    pub fn observer_count(&self) -> usize {
        lock(&self.observers).len()
    }

    /// Delivers `event` to every interested observer, detaching the ones that went away.
    pub fn emit(&self, event: CentralEvent) {
        let mut scan_detached = false;
        {
            let mut observers = lock(&self.observers);
            let mut detached = Vec::new();
            for (token, observer) in observers.iter_mut() {
                match observer.delivery(&event) {
                    Delivery::Send => {
                        if observer.sender.unbounded_send(event.clone()).is_err() {
                            detached.push(*token);
                        }
                    }
                    Delivery::Skip => {}
                    Delivery::Detach => detached.push(*token),
                }
            }
            for token in detached {
                if let Some(observer) = observers.remove(&token) {
                    trace!(?token, "observer gone");
                    scan_detached |= observer.is_scan();
                }
            }
        }
        if scan_detached {
            self.refresh_scan_logged();
        }
    }

    /// The radio stopped scanning on its own. Every scan observer is detached.
    pub fn on_scan_stopped(&self) {
        *lock(&self.scan) = None;
        let detached = {
            let mut observers = lock(&self.observers);
            let before = observers.len();
            observers.retain(|_, observer| !observer.is_scan());
            before - observers.len()
        };
        debug!(detached, "radio stopped scanning");
        self.emit(CentralEvent::ScanStopped);
    }

    pub fn on_state(&self, state: AdapterState) {
        if !state.is_usable() {
            // The stack stops scanning with the radio. Scan observers stay attached and the scan
            // resumes once the radio is back.
            *lock(&self.scan) = None;
        } else if state == AdapterState::PoweredOn {
            self.refresh_scan_logged();
        }
    }

    fn wanted_filter(&self) -> Option<ScanFilter> {
        let observers = lock(&self.observers);
        let mut scans = observers
            .values()
            .filter_map(|observer| match &observer.interest {
                Interest::Scan(options) => Some(options),
                _ => None,
            })
            .peekable();
        scans.peek()?;

        let mut filter = ScanFilter::default();
        let mut everything = false;
        for options in scans {
            everything |= options.services.is_empty();
            for service in &options.services {
                if !filter.services.contains(service) {
                    filter.services.push(service.clone());
                }
            }
            filter.allow_duplicates |= options.allow_duplicates;
        }
        if everything {
            filter.services.clear();
        }
        Some(filter)
    }

    /// Brings the radio's scan in line with the attached scan observers.
    pub fn refresh_scan(&self) -> Result<()> {
        let mut active = lock(&self.scan);
        let wanted = self.wanted_filter();
        if *active == wanted {
            return Ok(());
        }

        match wanted {
            Some(filter) => {
                if !self.radio.state().is_usable() {
                    debug!("radio unavailable, deferring scan");
                    return Ok(());
                }
                self.radio
                    .start_scan(&filter)
                    .map_err(|error| Error::radio(OperationKind::Scan, error))?;
                debug!(?filter, "scan started");
                *active = Some(filter);
            }
            None => {
                self.radio.stop_scan();
                *active = None;
                drop(active);
                debug!("scan stopped");
                self.emit(CentralEvent::ScanStopped);
            }
        }
        Ok(())
    }

    fn refresh_scan_logged(&self) {
        if let Err(error) = self.refresh_scan() {
            warn!(%error, "failed to update scan");
        }
    }
}

/// A stream of the events an observer is interested in.
///
/// Dropping the stream detaches the observer.
pub struct EventStream {
    token: ObserverToken,
    receiver: mpsc::UnboundedReceiver<CentralEvent>,
    router: Arc<EventRouter>,
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream").field("token", &self.token).finish()
    }
}

impl EventStream {
    pub(crate) fn new(router: Arc<EventRouter>, interest: Interest) -> Self {
        let (token, receiver) = router.subscribe(interest);
        Self {
            token,
            receiver,
            router,
        }
    }

    pub fn token(&self) -> ObserverToken {
        self.token
    }

    fn detach(&self) {
        self.router.unsubscribe(self.token);
    }
}

impl Stream for EventStream {
    type Item = CentralEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.receiver).poll_next(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Discoveries from a [`Central::scan`](crate::Central::scan).
///
/// Ends when the scan duration elapses or the radio stops scanning. The radio stops at the end of
/// the duration even if the stream is never polled.
#[derive(Debug)]
pub struct ScanStream {
    events: EventStream,
    /// Only set when the router could not start a timer for the scan.
    deadline: Option<Timer>,
    done: bool,
}

impl ScanStream {
    pub(crate) fn new(events: EventStream, deadline: Option<Timer>) -> Self {
        Self {
            events,
            deadline,
            done: false,
        }
    }
}

impl Stream for ScanStream {
    type Item = DiscoveryEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        if let Some(deadline) = &mut this.deadline {
            if Pin::new(deadline).poll(cx).is_ready() {
                debug!(token = ?this.events.token, "scan duration elapsed");
                this.done = true;
                this.events.detach();
                return Poll::Ready(None);
            }
        }
        loop {
            match ready!(Pin::new(&mut this.events).poll_next(cx)) {
                Some(CentralEvent::Discovered(discovery)) => return Poll::Ready(Some(discovery)),
                Some(_) => continue,
                None => {
                    this.done = true;
                    return Poll::Ready(None);
                }
            }
        }
    }
}

/// Values pushed on one characteristic, from [`Central::notifications`](crate::Central::notifications).
///
/// Ends when the peripheral disconnects.
#[derive(Debug)]
pub struct NotificationStream {
    events: EventStream,
}

impl NotificationStream {
    pub(crate) fn new(events: EventStream) -> Self {
        Self { events }
    }
}

impl Stream for NotificationStream {
    type Item = Vec<u8>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match ready!(Pin::new(&mut this.events).poll_next(cx)) {
                Some(CentralEvent::Notification(notification)) => {
                    return Poll::Ready(Some(notification.value));
                }
                Some(_) => continue,
                None => return Poll::Ready(None),
            }
        }
    }
}

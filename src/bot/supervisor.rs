//! Radio connection supervisor.
//!
//! Owns the one live [`Transport`] and the [`LinkState`] machine around it:
//!
//! ```text
//!  Disconnected ──open──▶ Connecting ──bootstrap ok──▶ Connected
//!       ▲                     │                            │
//!       └──── open failed ────┘◀── link error (probe/send) ┘
//! ```
//!
//! A single background task drives reconnects and health probes. Everything else only reads
//! the current [`LinkHandle`] and, when a call fails with a link-class error, reports it through
//! [`ConnectionSupervisor::report_transport_error`]. Each successful connect bumps a generation
//! counter carried by the handle, so a late report against a link that was already replaced is
//! ignored instead of tearing down the new one.
use crate::config::SupervisorConfig;
use crate::meshtastic::{Connector, Identity, MeshEvent, NodeId, Transport, TransportError};
use crate::metrics;
use crate::notify::{Notifier, Severity};
use crate::storage::PeerDirectory;
use log::{debug, info, trace, warn};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("radio did not connect within {0}s")]
    ConnectTimeout(u64),
    #[error("supervisor has been stopped")]
    Stopped,
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub health_interval: Duration,
    pub backoff_floor: Duration,
    pub backoff_max: Duration,
    pub resync_interval: Duration,
    pub purge_after_days: u32,
}

impl From<&SupervisorConfig> for SupervisorSettings {
    fn from(cfg: &SupervisorConfig) -> Self {
        Self {
            health_interval: Duration::from_secs(cfg.health_interval_secs),
            backoff_floor: Duration::from_secs(cfg.backoff_floor_secs),
            backoff_max: Duration::from_secs(cfg.backoff_max_secs),
            resync_interval: Duration::from_secs(cfg.resync_interval_hours * 3600),
            purge_after_days: cfg.purge_after_days,
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from(&SupervisorConfig::default())
    }
}

/// The live transport plus the generation it was opened under.
#[derive(Clone)]
pub struct LinkHandle {
    pub transport: Arc<dyn Transport>,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorStatus {
    pub connected: bool,
    pub in_flight: usize,
    pub generation: u64,
    pub error_count: u64,
}

struct LinkShared {
    state: LinkState,
    link: Option<LinkHandle>,
    generation: u64,
    in_flight: usize,
    error_count: u64,
    identity: Option<Identity>,
    station_name: String,
}

struct Inner {
    connector: Arc<dyn Connector>,
    directory: Arc<dyn PeerDirectory>,
    notifier: Arc<dyn Notifier>,
    events: mpsc::UnboundedSender<MeshEvent>,
    settings: SupervisorSettings,
    shared: Mutex<LinkShared>,
    connect_lock: tokio::sync::Mutex<()>,
    state_tx: watch::Sender<LinkState>,
    shutdown_tx: watch::Sender<bool>,
    wake: Notify,
    loop_task: Mutex<Option<JoinHandle<()>>>,
    resync_task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct ConnectionSupervisor {
    inner: Arc<Inner>,
}

/// Counts one send as in flight until dropped.
pub struct SendGuard {
    inner: Arc<Inner>,
}

impl Drop for SendGuard {
    fn drop(&mut self) {
        let mut s = self.inner.lock();
        s.in_flight = s.in_flight.saturating_sub(1);
    }
}

impl ConnectionSupervisor {
    pub fn new(
        connector: Arc<dyn Connector>,
        directory: Arc<dyn PeerDirectory>,
        notifier: Arc<dyn Notifier>,
        events: mpsc::UnboundedSender<MeshEvent>,
        settings: SupervisorSettings,
    ) -> Self {
        let (state_tx, _) = watch::channel(LinkState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                connector,
                directory,
                notifier,
                events,
                settings,
                shared: Mutex::new(LinkShared {
                    state: LinkState::Disconnected,
                    link: None,
                    generation: 0,
                    in_flight: 0,
                    error_count: 0,
                    identity: None,
                    station_name: String::new(),
                }),
                connect_lock: tokio::sync::Mutex::new(()),
                state_tx,
                shutdown_tx,
                wake: Notify::new(),
                loop_task: Mutex::new(None),
                resync_task: Mutex::new(None),
            }),
        }
    }

    /// Launch the reconnect/health loop. Calling it again while the loop runs is a no-op.
    pub fn start(&self) {
        if *self.inner.shutdown_tx.borrow() {
            debug!("Supervisor start ignored: already stopped");
            return;
        }
        let mut slot = self
            .inner
            .loop_task
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        if slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *slot = Some(tokio::spawn(async move { inner.run().await }));
    }

    /// Start if needed and wait until the link is up.
    pub async fn connect_and_wait(&self, wait: Duration) -> Result<(), SupervisorError> {
        if *self.inner.shutdown_tx.borrow() {
            return Err(SupervisorError::Stopped);
        }
        self.start();
        let mut rx = self.inner.state_tx.subscribe();
        let outcome = match timeout(wait, rx.wait_for(|s| *s == LinkState::Connected)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(SupervisorError::Stopped),
            Err(_) => Err(SupervisorError::ConnectTimeout(wait.as_secs())),
        };
        outcome
    }

    /// Stop the loop, cancel the periodic resync and release the transport.
    pub async fn stop(&self) {
        self.inner.shutdown_tx.send_replace(true);
        self.inner.wake.notify_one();
        self.inner.abort_resync();
        let task = self
            .inner
            .loop_task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        match task {
            Some(handle) => {
                if timeout(Duration::from_secs(10), handle).await.is_err() {
                    warn!("Supervisor loop did not stop within 10s");
                }
            }
            None => self.inner.teardown().await,
        }
    }

    pub fn status(&self) -> SupervisorStatus {
        let s = self.inner.lock();
        SupervisorStatus {
            connected: s.state == LinkState::Connected,
            in_flight: s.in_flight,
            generation: s.generation,
            error_count: s.error_count,
        }
    }

    pub fn state(&self) -> LinkState {
        self.inner.lock().state
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.inner.state_tx.subscribe()
    }

    /// Current link, if connected.
    pub fn handle(&self) -> Option<LinkHandle> {
        let s = self.inner.lock();
        if s.state == LinkState::Connected {
            s.link.clone()
        } else {
            None
        }
    }

    pub fn begin_send(&self) -> SendGuard {
        self.inner.lock().in_flight += 1;
        SendGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn local_node(&self) -> Option<NodeId> {
        self.inner.lock().identity.as_ref().and_then(|i| i.node)
    }

    pub fn station_name(&self) -> String {
        self.inner.lock().station_name.clone()
    }

    pub fn report_transport_error(&self, generation: u64, origin: &str, err: &TransportError) {
        self.inner.report_transport_error(generation, origin, err);
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, LinkShared> {
        self.shared.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: LinkState) {
        self.lock().state = state;
        self.state_tx.send_replace(state);
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    fn abort_resync(&self) {
        let task = self
            .resync_task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }

    async fn run(self: Arc<Self>) {
        let floor = self.settings.backoff_floor;
        let max = self.settings.backoff_max;
        let mut backoff = floor;
        let mut shutdown = self.shutdown_tx.subscribe();
        info!("Connection supervisor started ({})", self.connector.describe());

        while !self.shutting_down() {
            if self.lock().state != LinkState::Connected {
                match self.try_connect().await {
                    Ok(()) => {
                        backoff = floor;
                        continue;
                    }
                    Err(e) => warn!("Connect via {} failed: {}", self.connector.describe(), e),
                }
                if self.shutting_down() {
                    break;
                }
                let wait = backoff.min(max);
                backoff = (backoff * 2).min(max);
                info!("Retrying radio connection in {}s", wait.as_secs());
                tokio::select! {
                    _ = sleep(wait) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            tokio::select! {
                _ = sleep(self.settings.health_interval) => self.health_check().await,
                _ = self.wake.notified() => {}
                _ = shutdown.changed() => {}
            }
        }

        self.abort_resync();
        self.teardown().await;
        info!("Connection supervisor stopped");
    }

    async fn try_connect(self: &Arc<Self>) -> Result<(), TransportError> {
        let _guard = self.connect_lock.lock().await;

        let stale = self.lock().link.take();
        if let Some(old) = stale {
            debug!("Closing stale link (generation {})", old.generation);
            old.transport.close().await;
        }
        self.abort_resync();
        self.set_state(LinkState::Connecting);

        let transport = match self.connector.open(self.events.clone()).await {
            Ok(t) => t,
            Err(e) => {
                self.set_state(LinkState::Disconnected);
                return Err(e);
            }
        };
        let generation = {
            let mut s = self.lock();
            s.generation += 1;
            s.link = Some(LinkHandle {
                transport: Arc::clone(&transport),
                generation: s.generation,
            });
            s.generation
        };

        if let Err(e) = self.bootstrap(&transport).await {
            self.lock().link = None;
            transport.close().await;
            self.set_state(LinkState::Disconnected);
            return Err(e);
        }

        {
            let mut s = self.lock();
            s.error_count = 0;
        }
        self.set_state(LinkState::Connected);
        metrics::inc_connects();
        let name = self.lock().station_name.clone();
        info!(
            "Radio connected (generation {}){}",
            generation,
            if name.is_empty() {
                String::new()
            } else {
                format!(" as '{}'", name)
            }
        );
        self.notifier
            .publish("Connected to Meshtastic radio", Severity::Info);
        self.schedule_resync();
        Ok(())
    }

    /// Identity, directory resync, stale peer purge. Only link-class failures abort.
    async fn bootstrap(&self, transport: &Arc<dyn Transport>) -> Result<(), TransportError> {
        match transport.identity().await {
            Ok(identity) => {
                let name = identity.display_name();
                if name.is_empty() {
                    warn!("Radio reported no owner name; replies will be unsigned in logs");
                }
                self.notifier.set_station_name(&name);
                let mut s = self.lock();
                s.station_name = name;
                s.identity = Some(identity);
            }
            Err(e) if e.is_link() => return Err(e),
            Err(e) => warn!("Could not read radio identity: {}", e),
        }

        match self.directory.resync_all(transport.as_ref()).await {
            Ok(n) => info!("Peer directory resync: {} peers updated", n),
            Err(e) if e.is_link() => return Err(e),
            Err(e) => warn!("Peer directory resync failed: {}", e),
        }

        let purged = self
            .directory
            .purge_older_than(self.settings.purge_after_days);
        if purged > 0 {
            info!(
                "Purged {} peers not heard in {} days",
                purged, self.settings.purge_after_days
            );
        }
        Ok(())
    }

    fn schedule_resync(self: &Arc<Self>) {
        let interval = self.settings.resync_interval;
        if interval.is_zero() {
            return;
        }
        let weak: Weak<Inner> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            loop {
                sleep(interval).await;
                let Some(inner) = weak.upgrade() else { break };
                let link = {
                    let s = inner.lock();
                    if s.state == LinkState::Connected {
                        s.link.clone()
                    } else {
                        None
                    }
                };
                let Some(link) = link else { continue };
                match inner.directory.resync_all(link.transport.as_ref()).await {
                    Ok(n) => info!("Periodic peer resync: {} peers updated", n),
                    Err(e) if e.is_link() => {
                        inner.report_transport_error(link.generation, "periodic resync", &e)
                    }
                    Err(e) => warn!("Periodic peer resync failed: {}", e),
                }
            }
        });
        self.abort_resync();
        *self.resync_task.lock().unwrap_or_else(|p| p.into_inner()) = Some(task);
    }

    async fn health_check(&self) {
        let link = {
            let s = self.lock();
            if s.state != LinkState::Connected {
                return;
            }
            s.link.clone()
        };
        let Some(link) = link else { return };
        // A probe that never returns counts as a dead link; otherwise the loop would stall.
        let result = match timeout(self.settings.health_interval, link.transport.probe()).await {
            Ok(r) => r,
            Err(_) => Err(TransportError::link("health probe timed out")),
        };
        match result {
            Ok(()) => trace!("Health probe ok (generation {})", link.generation),
            Err(e) if e.is_link() => {
                self.report_transport_error(link.generation, "health probe", &e)
            }
            Err(e) => warn!("Health probe error (link kept): {}", e),
        }
    }

    fn report_transport_error(&self, generation: u64, origin: &str, err: &TransportError) {
        if !err.is_link() {
            debug!("Not demoting link for non-link error from {}: {}", origin, err);
            return;
        }
        let dropped = {
            let mut s = self.lock();
            if s.generation != generation || s.state != LinkState::Connected {
                debug!(
                    "Ignoring link error from {} for generation {} (current {}, {:?})",
                    origin, generation, s.generation, s.state
                );
                return;
            }
            s.state = LinkState::Disconnected;
            s.error_count += 1;
            s.link.take()
        };
        self.state_tx.send_replace(LinkState::Disconnected);
        metrics::inc_link_errors();
        warn!("Radio link error from {}: {}; reconnecting", origin, err);
        self.notifier
            .publish("Lost connection to Meshtastic radio", Severity::Warning);
        if let Some(link) = dropped {
            if let Ok(rt) = tokio::runtime::Handle::try_current() {
                rt.spawn(async move { link.transport.close().await });
            }
        }
        self.wake.notify_one();
    }

    async fn teardown(&self) {
        let _guard = self.connect_lock.lock().await;
        let link = self.lock().link.take();
        self.set_state(LinkState::Disconnected);
        if let Some(link) = link {
            link.transport.close().await;
            debug!("Radio link closed (generation {})", link.generation);
        }
    }
}

//! Top-level wiring: builds every component from [`Config`] and runs the event loop.
use super::delivery::DeliveryPipeline;
use super::dispatch::InboundDispatcher;
use super::rate_limit::RateLimiter;
use super::supervisor::{ConnectionSupervisor, SupervisorSettings};
use super::traceroute::{TraceSettings, TracerouteOrchestrator};
use crate::config::Config;
use crate::meshtastic::{Connector, MeshEvent, StreamConnector};
use crate::metrics;
use crate::notify::{self, Notifier, Severity};
use crate::storage::{JsonPeerDirectory, PeerDirectory};
use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// How long shutdown waits for in-flight replies.
const DRAIN_WAIT: Duration = Duration::from_secs(5);

pub struct BotServer {
    config: Config,
    directory: Arc<dyn PeerDirectory>,
    notifier: Arc<dyn Notifier>,
    supervisor: ConnectionSupervisor,
    limiter: Arc<RateLimiter>,
    delivery: Arc<DeliveryPipeline>,
    traces: TracerouteOrchestrator,
    dispatcher: InboundDispatcher,
    events_rx: Option<mpsc::UnboundedReceiver<MeshEvent>>,
}

impl BotServer {
    /// Build a server that talks to the radio described in `config.meshtastic`.
    pub async fn new(config: Config) -> Result<Self> {
        let connector = StreamConnector::new(config.meshtastic.link_params())
            .with_handshake_timeout(Duration::from_secs(
                config.meshtastic.handshake_timeout_secs,
            ));
        Self::with_connector(config, Arc::new(connector)).await
    }

    /// Build a server around an arbitrary connector.
    pub async fn with_connector(config: Config, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        let directory: Arc<dyn PeerDirectory> =
            Arc::new(JsonPeerDirectory::open(&config.storage.peer_db).await?);
        let notifier = notify::from_config(&config.notify);
        Ok(Self::assemble(config, connector, directory, notifier))
    }

    /// Wire already constructed collaborators together.
    pub fn assemble(
        config: Config,
        connector: Arc<dyn Connector>,
        directory: Arc<dyn PeerDirectory>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let supervisor = ConnectionSupervisor::new(
            connector,
            Arc::clone(&directory),
            Arc::clone(&notifier),
            events_tx,
            SupervisorSettings::from(&config.supervisor),
        );
        let delivery = Arc::new(DeliveryPipeline::new(
            supervisor.clone(),
            Arc::clone(&directory),
            Arc::clone(&notifier),
            config.bot.max_message_len,
            config.bot.chunk_gap(),
        ));
        let traces = TracerouteOrchestrator::new(
            TraceSettings::from(&config.traceroute),
            supervisor.clone(),
            Arc::clone(&delivery),
            Arc::clone(&directory),
        );
        let limiter = Arc::new(RateLimiter::new());
        let dispatcher = InboundDispatcher::new(
            config.bot.clone(),
            config.traceroute.clone(),
            supervisor.clone(),
            Arc::clone(&directory),
            Arc::clone(&limiter),
            Arc::clone(&delivery),
            traces.clone(),
            Arc::clone(&notifier),
        );
        Self {
            config,
            directory,
            notifier,
            supervisor,
            limiter,
            delivery,
            traces,
            dispatcher,
            events_rx: Some(events_rx),
        }
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    pub fn traces(&self) -> &TracerouteOrchestrator {
        &self.traces
    }

    pub fn delivery(&self) -> &Arc<DeliveryPipeline> {
        &self.delivery
    }

    pub fn directory(&self) -> &Arc<dyn PeerDirectory> {
        &self.directory
    }

    pub fn dispatcher(&self) -> &InboundDispatcher {
        &self.dispatcher
    }

    /// Run until Ctrl-C, then shut down.
    pub async fn run(&mut self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Ctrl-C handler unavailable: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received shutdown signal");
        })
        .await
    }

    /// Run the event loop until `stop` resolves, then shut down.
    pub async fn run_until<F>(&mut self, stop: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut events = self
            .events_rx
            .take()
            .ok_or_else(|| anyhow!("server is already running"))?;

        info!("Starting meshping v{}", env!("CARGO_PKG_VERSION"));
        self.traces.start();

        tokio::pin!(stop);
        let connect_wait = Duration::from_secs(self.config.supervisor.connect_timeout_secs);
        tokio::select! {
            res = self.supervisor.connect_and_wait(connect_wait) => match res {
                Ok(()) => info!("Radio connected as {}", self.supervisor.station_name()),
                Err(e) => {
                    warn!("Initial radio connection failed: {}; retrying in the background", e);
                    self.notifier.publish(
                        &format!("Radio not connected yet: {}", e),
                        Severity::Warning,
                    );
                }
            },
            _ = &mut stop => {
                info!("Stopped before the radio connected");
                self.shutdown().await;
                return Ok(());
            }
        }

        let flush_every = Duration::from_secs(self.config.storage.flush_interval_secs.max(1));
        let mut housekeeping = interval(flush_every);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        housekeeping.tick().await;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        let outcome = self.dispatcher.handle_event(event);
                        debug!("Event handled: {:?}", outcome);
                    }
                    None => {
                        warn!("Radio event channel closed");
                        break;
                    }
                },
                _ = housekeeping.tick() => self.housekeeping().await,
                _ = &mut stop => break,
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn housekeeping(&self) {
        if let Err(e) = self.directory.persist().await {
            warn!("Peer directory flush failed: {}", e);
        }
        let pruned = self.limiter.prune(self.config.bot.reply_cooldown());
        if pruned > 0 {
            debug!("Pruned {} expired cooldown entries", pruned);
        }
        let status = self.supervisor.status();
        let traces = self.traces.stats();
        debug!(
            "connected={} in_flight={} traces(queued={}, active={}) deliveries={} metrics={:?}",
            status.connected,
            status.in_flight,
            traces.queued,
            traces.in_flight,
            self.delivery.pending(),
            metrics::snapshot()
        );
    }

    /// Stop the trace worker, let pending replies finish, release the radio and flush peers.
    pub async fn shutdown(&self) {
        info!("Shutting down meshping...");
        self.notifier.publish("Pingbot shutting down", Severity::Info);
        self.traces.stop().await;
        self.delivery.drain(DRAIN_WAIT).await;
        self.supervisor.stop().await;
        if let Err(e) = self.directory.persist().await {
            warn!("Final peer directory flush failed: {}", e);
        }
        info!("Shutdown complete");
    }

    /// Print a short human-readable summary for the `status` command.
    pub fn show_status(&self) {
        let stats = self.directory.statistics();
        println!("=== meshping status ===");
        println!("Radio link: {}", self.config.meshtastic.link_params());
        println!("Peer database: {}", self.config.storage.peer_db);
        println!("Known peers: {}", stats.total);
        println!(
            "Complete records: {} ({:.0}%)",
            stats.complete,
            stats.completion_rate()
        );
        println!("Heard in last 24h: {}", stats.heard_last_24h);
        println!("Seen via MQTT: {}", stats.via_mqtt);
        println!(
            "Traceroute: {}s pacing, {} per user, {}s timeout",
            self.config.traceroute.rate_limit_secs,
            self.config.traceroute.max_queue_per_user,
            self.config.traceroute.timeout_secs
        );
        println!("Reply cooldown: {}s", self.config.bot.reply_cooldown_secs);
    }
}

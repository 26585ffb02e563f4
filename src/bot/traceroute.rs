//! Traceroute orchestration.
//!
//! Radios drop traceroute requests that arrive too close together, so all traces share a single
//! worker that dispatches them one at a time with at least `rate_limit` between dispatches.
//! Requesters queue into a global FIFO with a cap on how many traces each may have outstanding.
//!
//! ```text
//!  enqueue ──▶ [ FIFO ] ──▶ worker: pace ─▶ "Starting…" ─▶ send request ─▶ wait ─┬─▶ report
//!                                                                  match_response ┘   timeout
//! ```
//!
//! The answer to a trace arrives as an ordinary inbound packet from the traced node, so pending
//! traces are keyed by target node id and [`TracerouteOrchestrator::match_response`] hands the
//! packet to the waiting worker through a oneshot channel.
//!
//! All bookkeeping lives behind one mutex that is never held across an await.
use super::delivery::DeliveryPipeline;
use super::supervisor::ConnectionSupervisor;
use crate::config::TracerouteConfig;
use crate::logutil::{clip_name, sanitize_for_user};
use crate::meshtastic::proto::{routing, RouteDiscovery};
use crate::meshtastic::{InboundPacket, NodeId, Payload};
use crate::metrics;
use crate::storage::PeerDirectory;
use chrono::{DateTime, Local};
use log::{debug, info, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};

pub const MSG_STARTING: &str = "Starting traceroute...";
pub const MSG_TIMEOUT: &str = "Traceroute timed out - no response received";
const LABEL_RESULT: &str = "Traceroute Result";

#[derive(Debug, Clone)]
pub struct TraceSettings {
    pub rate_limit: Duration,
    pub max_queue_per_user: usize,
    pub timeout: Duration,
    pub hop_limit: u32,
}

impl From<&TracerouteConfig> for TraceSettings {
    fn from(cfg: &TracerouteConfig) -> Self {
        Self {
            rate_limit: Duration::from_secs(cfg.rate_limit_secs),
            max_queue_per_user: cfg.max_queue_per_user,
            timeout: Duration::from_secs(cfg.timeout_secs),
            hop_limit: cfg.hop_limit,
        }
    }
}

/// Result of [`TracerouteOrchestrator::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Queued { position: usize, eta: Duration },
    QueueFull { max: usize },
    ShuttingDown,
}

impl Admission {
    pub fn accepted(&self) -> bool {
        matches!(self, Admission::Queued { .. })
    }

    pub fn message(&self) -> String {
        match self {
            Admission::Queued { position, eta } => {
                format!("position {}, ETA ~{}s", position, eta.as_secs())
            }
            Admission::QueueFull { .. } => "queue full".to_string(),
            Admission::ShuttingDown => "shutting down".to_string(),
        }
    }
}

/// What came back for a dispatched trace.
#[derive(Debug, Clone, PartialEq)]
pub enum TraceOutcome {
    Route(RouteDiscovery),
    RoutingError(i32),
}

#[derive(Debug, Clone)]
pub struct TraceResponse {
    pub from: NodeId,
    pub outcome: TraceOutcome,
    pub rx_rssi: Option<i32>,
    pub rx_snr: Option<f32>,
    pub received_at: DateTime<Local>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceStats {
    pub queued: usize,
    pub in_flight: bool,
    pub pending: usize,
}

#[derive(Debug)]
struct TraceJob {
    id: u64,
    requester: NodeId,
    target: NodeId,
    reply_to: NodeId,
    submitted_at: Instant,
}

enum TraceCommand {
    Run(TraceJob),
    Stop,
}

struct PendingTrace {
    requester: NodeId,
    submitted_at: Instant,
    responder: oneshot::Sender<TraceResponse>,
}

#[derive(Default)]
struct TraceState {
    user_queues: HashMap<NodeId, VecDeque<u64>>,
    /// Jobs in the FIFO that the worker has not popped yet.
    queued: usize,
    /// Requester whose job the worker currently holds.
    active: Option<NodeId>,
    pending: HashMap<NodeId, PendingTrace>,
    last_dispatch: Option<Instant>,
    next_id: u64,
    stopping: bool,
}

impl TraceState {
    fn outstanding(&self, requester: NodeId) -> usize {
        let queued = self.user_queues.get(&requester).map(|q| q.len()).unwrap_or(0);
        queued + usize::from(self.active == Some(requester))
    }
}

struct Inner {
    settings: TraceSettings,
    supervisor: ConnectionSupervisor,
    delivery: Arc<DeliveryPipeline>,
    directory: Arc<dyn PeerDirectory>,
    state: Mutex<TraceState>,
    queue_tx: mpsc::UnboundedSender<TraceCommand>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<TraceCommand>>>,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct TracerouteOrchestrator {
    inner: Arc<Inner>,
}

impl TracerouteOrchestrator {
    pub fn new(
        settings: TraceSettings,
        supervisor: ConnectionSupervisor,
        delivery: Arc<DeliveryPipeline>,
        directory: Arc<dyn PeerDirectory>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                settings,
                supervisor,
                delivery,
                directory,
                state: Mutex::new(TraceState::default()),
                queue_tx,
                queue_rx: Mutex::new(Some(queue_rx)),
                shutdown_tx,
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn settings(&self) -> &TraceSettings {
        &self.inner.settings
    }

    /// Spawn the worker. Only the first call has an effect.
    pub fn start(&self) {
        let Some(rx) = self
            .inner
            .queue_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.run_worker(rx).await });
        *self.inner.worker.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
    }

    /// Queue a trace of `target` for `requester`; results go to `reply_to`.
    pub fn enqueue(&self, requester: NodeId, target: NodeId, reply_to: NodeId) -> Admission {
        let mut st = self.inner.lock();
        if st.stopping {
            return Admission::ShuttingDown;
        }
        let max = self.inner.settings.max_queue_per_user;
        if st.outstanding(requester) >= max {
            metrics::inc_traces_rejected();
            debug!(
                "Traceroute request from {} rejected: {} outstanding (max {})",
                requester,
                st.outstanding(requester),
                max
            );
            return Admission::QueueFull { max };
        }
        st.next_id += 1;
        let job = TraceJob {
            id: st.next_id,
            requester,
            target,
            reply_to,
            submitted_at: Instant::now(),
        };
        let id = job.id;
        if self.inner.queue_tx.send(TraceCommand::Run(job)).is_err() {
            return Admission::ShuttingDown;
        }
        st.user_queues.entry(requester).or_default().push_back(id);
        st.queued += 1;
        let position = st.queued + usize::from(st.active.is_some());
        metrics::inc_traces_queued();
        let eta = self.inner.settings.rate_limit * position as u32;
        Admission::Queued { position, eta }
    }

    /// Deliver an inbound packet to the trace waiting on its sender, if any.
    ///
    /// Traceroute payloads and routing errors qualify; plain routing ACKs never match.
    pub fn match_response(&self, packet: &InboundPacket) -> bool {
        let outcome = match &packet.payload {
            Payload::Traceroute(route) => TraceOutcome::Route(route.clone()),
            Payload::Routing { error } if *error != routing::ERROR_NONE => {
                TraceOutcome::RoutingError(*error)
            }
            _ => return false,
        };
        // The send happens under the lock so a worker timing out concurrently either finds
        // the response in its receiver or still finds the entry to remove.
        let mut st = self.inner.lock();
        let Some(entry) = st.pending.remove(&packet.from) else {
            debug!("Unsolicited trace response from {}", packet.from);
            return false;
        };
        debug!(
            "Trace response from {} for {} after {}ms",
            packet.from,
            entry.requester,
            entry.submitted_at.elapsed().as_millis()
        );
        let response = TraceResponse {
            from: packet.from,
            outcome,
            rx_rssi: packet.rx_rssi,
            rx_snr: packet.rx_snr,
            received_at: Local::now(),
        };
        entry.responder.send(response).is_ok()
    }

    pub fn stats(&self) -> TraceStats {
        let st = self.inner.lock();
        TraceStats {
            queued: st.queued,
            in_flight: st.active.is_some(),
            pending: st.pending.len(),
        }
    }

    /// Outstanding traces (queued plus in the worker) for one requester.
    pub fn outstanding(&self, requester: NodeId) -> usize {
        self.inner.lock().outstanding(requester)
    }

    /// Stop the worker. Queued jobs are dropped without notice; a running job is abandoned.
    pub async fn stop(&self) {
        let dropped = {
            let mut st = self.inner.lock();
            st.stopping = true;
            st.queued
        };
        let _ = self.inner.queue_tx.send(TraceCommand::Stop);
        self.inner.shutdown_tx.send_replace(true);
        if dropped > 0 {
            info!("Discarding {} queued traceroute request(s)", dropped);
        }
        let worker = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = worker {
            if timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!("Traceroute worker did not stop within 5s");
            }
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, TraceState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn run_worker(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<TraceCommand>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        debug!("Traceroute worker started");
        while let Some(cmd) = rx.recv().await {
            let job = match cmd {
                TraceCommand::Run(job) => job,
                TraceCommand::Stop => break,
            };
            {
                let mut st = self.lock();
                if let Some(q) = st.user_queues.get_mut(&job.requester) {
                    q.retain(|id| *id != job.id);
                    if q.is_empty() {
                        st.user_queues.remove(&job.requester);
                    }
                }
                st.queued = st.queued.saturating_sub(1);
                if st.stopping {
                    continue;
                }
                st.active = Some(job.requester);
            }

            tokio::select! {
                _ = self.run_job(&job) => {}
                _ = shutdown.changed() => {
                    debug!("Abandoning traceroute to {} on shutdown", job.target);
                }
            }

            let mut st = self.lock();
            st.active = None;
            st.pending.remove(&job.target);
        }
        debug!("Traceroute worker stopped");
    }

    async fn run_job(&self, job: &TraceJob) {
        let wait = {
            let st = self.lock();
            st.last_dispatch
                .map(|t| self.settings.rate_limit.saturating_sub(t.elapsed()))
                .unwrap_or(Duration::ZERO)
        };
        if !wait.is_zero() {
            debug!(
                "Pacing traceroute to {}: waiting {}ms",
                job.target,
                wait.as_millis()
            );
            sleep(wait).await;
        }
        self.lock().last_dispatch = Some(Instant::now());
        metrics::inc_traces_dispatched();

        self.delivery.reply(MSG_STARTING, job.reply_to, "Traceroute Start");

        let Some(link) = self.supervisor.handle() else {
            metrics::inc_traces_failed();
            warn!("Traceroute to {} skipped: radio not connected", job.target);
            self.delivery.reply(
                "Traceroute failed: radio not connected",
                job.reply_to,
                LABEL_RESULT,
            );
            return;
        };

        let (tx, mut rx) = oneshot::channel();
        self.lock().pending.insert(
            job.target,
            PendingTrace {
                requester: job.requester,
                submitted_at: Instant::now(),
                responder: tx,
            },
        );

        let sent = {
            let _in_flight = self.supervisor.begin_send();
            link.transport
                .send_trace_request(job.target, self.settings.hop_limit)
                .await
        };
        if let Err(e) = sent {
            self.lock().pending.remove(&job.target);
            metrics::inc_traces_failed();
            if e.is_link() {
                self.supervisor
                    .report_transport_error(link.generation, "traceroute", &e);
            }
            warn!("Traceroute to {} could not be sent: {}", job.target, e);
            self.delivery.reply_after_reconnect(
                &format!("Traceroute failed: {}", sanitize_for_user(&e.to_string(), 100)),
                job.reply_to,
                LABEL_RESULT,
                self.settings.timeout,
            );
            return;
        }
        info!(
            "Traceroute to {} dispatched for {} (queued {}s ago)",
            job.target,
            job.requester,
            job.submitted_at.elapsed().as_secs()
        );

        let response = match timeout(self.settings.timeout, &mut rx).await {
            Ok(Ok(resp)) => Some(resp),
            Ok(Err(_)) => None,
            Err(_) => {
                // Remove first so a late match either lands in `rx` already or finds nothing.
                self.lock().pending.remove(&job.target);
                rx.try_recv().ok()
            }
        };

        match response {
            Some(resp) => {
                let report = self.format_report(job.target, &resp);
                match resp.outcome {
                    TraceOutcome::Route(_) => metrics::inc_traces_completed(),
                    TraceOutcome::RoutingError(_) => metrics::inc_traces_failed(),
                }
                self.delivery.reply(&report, job.reply_to, LABEL_RESULT);
            }
            None => {
                metrics::inc_traces_timed_out();
                info!(
                    "Traceroute to {} timed out after {}s",
                    job.target,
                    self.settings.timeout.as_secs()
                );
                self.delivery.reply(MSG_TIMEOUT, job.reply_to, LABEL_RESULT);
            }
        }
    }

    fn short_label(&self, id: NodeId) -> String {
        self.directory
            .get(id)
            .and_then(|p| p.short_name.or(p.long_name))
            .map(|n| clip_name(&n, 12))
            .unwrap_or_else(|| id.to_string())
    }

    fn format_report(&self, target: NodeId, resp: &TraceResponse) -> String {
        let target_name = clip_name(&self.directory.lookup(target), 30);
        let route = match &resp.outcome {
            TraceOutcome::Route(route) => route,
            TraceOutcome::RoutingError(code) => {
                return format!(
                    "Traceroute to {} failed: {}",
                    target_name,
                    routing::error_label(*code)
                );
            }
        };
        let origin = self
            .supervisor
            .local_node()
            .map(|id| self.short_label(id))
            .unwrap_or_else(|| "me".to_string());

        let mut lines = vec![format!("Traceroute to {}:", target_name)];
        lines.push(format_path(
            &origin,
            &route.route,
            &route.snr_towards,
            &self.short_label(target),
            |id| self.short_label(id),
        ));
        if !route.route_back.is_empty() || !route.snr_back.is_empty() {
            lines.push(format!(
                "Back: {}",
                format_path(
                    &self.short_label(target),
                    &route.route_back,
                    &route.snr_back,
                    &origin,
                    |id| self.short_label(id),
                )
            ));
        }
        let hops = route.route.len();
        lines.push(if hops == 0 {
            "Hops: 0 (direct)".to_string()
        } else {
            format!("Hops: {}", hops)
        });
        let mut signal = Vec::new();
        if let Some(rssi) = resp.rx_rssi {
            signal.push(format!("RSSI {}dBm", rssi));
        }
        if let Some(snr) = resp.rx_snr {
            signal.push(format!("SNR {:.1}dB", snr));
        }
        if !signal.is_empty() {
            lines.push(format!("Signal: {}", signal.join(", ")));
        }
        lines.push(format!(
            "Completed at: {}",
            resp.received_at.format("%H:%M:%S")
        ));
        lines.join("\n")
    }
}

fn format_snr(raw: Option<&i32>) -> Option<String> {
    match raw {
        Some(&v) if v != RouteDiscovery::SNR_UNKNOWN => Some(format!("{:.1}dB", v as f32 / 4.0)),
        Some(_) => Some("?".to_string()),
        None => None,
    }
}

/// `A > B (6.0dB) > C (?)`: one arrow per link, SNR measured at the receiving end.
fn format_path(
    start: &str,
    hops: &[u32],
    snrs: &[i32],
    end: &str,
    label: impl Fn(NodeId) -> String,
) -> String {
    let mut out = start.to_string();
    let names = hops
        .iter()
        .map(|&h| label(NodeId(h)))
        .chain(std::iter::once(end.to_string()));
    for (i, name) in names.enumerate() {
        out.push_str(" > ");
        out.push_str(&name);
        if let Some(snr) = format_snr(snrs.get(i)) {
            out.push_str(&format!(" ({})", snr));
        }
    }
    out
}

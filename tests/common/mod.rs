//! Shared fixtures: an in-memory radio (`MockConnector`/`MockTransport`), packet builders and a
//! notifier that records what it was told.
#![allow(dead_code)]

use async_trait::async_trait;
use meshping::bot::{ConnectionSupervisor, SupervisorSettings};
use meshping::meshtastic::{
    Connector, ErrorKind, Identity, InboundPacket, MeshEvent, NodeId, NodeRecord, Payload,
    Transport, TransportError,
};
use meshping::notify::{Notifier, Severity};
use meshping::storage::{JsonPeerDirectory, PeerDirectory};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

pub const BOT: NodeId = NodeId(0x0b0b_0b0b);
pub const ALICE: NodeId = NodeId(0xa11c_e001);
pub const BOB: NodeId = NodeId(0x0000_b0b0);
pub const CAROL: NodeId = NodeId(0xca70_1000);

fn failure(kind: ErrorKind, what: &str) -> TransportError {
    match kind {
        ErrorKind::Link => TransportError::link(format!("{} failed: connection reset", what)),
        ErrorKind::Application => TransportError::app(format!("{} rejected", what)),
    }
}

/// One simulated link. Records everything sent through it.
pub struct MockTransport {
    pub sent: Mutex<Vec<(String, NodeId)>>,
    pub sent_at: Mutex<Vec<Instant>>,
    pub traces: Mutex<Vec<(NodeId, u32, Instant)>>,
    pub probes: AtomicUsize,
    pub closed: AtomicBool,
    send_failures: Mutex<VecDeque<ErrorKind>>,
    trace_failures: Mutex<VecDeque<ErrorKind>>,
    probe_failure: Mutex<Option<ErrorKind>>,
    identity: Identity,
    nodes: Vec<NodeRecord>,
}

impl MockTransport {
    fn new(identity: Identity, nodes: Vec<NodeRecord>) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            sent_at: Mutex::new(Vec::new()),
            traces: Mutex::new(Vec::new()),
            probes: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            send_failures: Mutex::new(VecDeque::new()),
            trace_failures: Mutex::new(VecDeque::new()),
            probe_failure: Mutex::new(None),
            identity,
            nodes,
        }
    }

    /// The next `send_text` call fails with `kind`.
    pub fn fail_next_send(&self, kind: ErrorKind) {
        self.send_failures.lock().unwrap().push_back(kind);
    }

    /// The next `send_trace_request` call fails with `kind`.
    pub fn fail_next_trace(&self, kind: ErrorKind) {
        self.trace_failures.lock().unwrap().push_back(kind);
    }

    /// Every probe from now on fails with `kind` (or succeeds again with `None`).
    pub fn fail_probes(&self, kind: Option<ErrorKind>) {
        *self.probe_failure.lock().unwrap() = kind;
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
    }

    pub fn sent_to(&self, dest: NodeId) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, d)| *d == dest)
            .map(|(t, _)| t.clone())
            .collect()
    }

    pub fn text_times(&self) -> Vec<Instant> {
        self.sent_at.lock().unwrap().clone()
    }

    pub fn trace_times(&self) -> Vec<Instant> {
        self.traces.lock().unwrap().iter().map(|(_, _, t)| *t).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_text(&self, text: &str, destination: NodeId) -> Result<(), TransportError> {
        if let Some(kind) = self.send_failures.lock().unwrap().pop_front() {
            return Err(failure(kind, "send"));
        }
        self.sent
            .lock()
            .unwrap()
            .push((text.to_string(), destination));
        self.sent_at.lock().unwrap().push(Instant::now());
        Ok(())
    }

    async fn send_trace_request(
        &self,
        target: NodeId,
        hop_limit: u32,
    ) -> Result<(), TransportError> {
        if let Some(kind) = self.trace_failures.lock().unwrap().pop_front() {
            return Err(failure(kind, "trace"));
        }
        self.traces
            .lock()
            .unwrap()
            .push((target, hop_limit, Instant::now()));
        Ok(())
    }

    async fn probe(&self) -> Result<(), TransportError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        match *self.probe_failure.lock().unwrap() {
            Some(kind) => Err(failure(kind, "probe")),
            None => Ok(()),
        }
    }

    async fn identity(&self) -> Result<Identity, TransportError> {
        Ok(self.identity.clone())
    }

    async fn node_db(&self) -> Result<Vec<NodeRecord>, TransportError> {
        Ok(self.nodes.clone())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out a fresh [`MockTransport`] per `open`, optionally failing some opens first.
pub struct MockConnector {
    pub opens: AtomicUsize,
    failing_opens: AtomicUsize,
    links: Mutex<Vec<Arc<MockTransport>>>,
    events: Mutex<Option<mpsc::UnboundedSender<MeshEvent>>>,
    identity: Identity,
    nodes: Vec<NodeRecord>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::with_nodes(Vec::new())
    }

    pub fn with_nodes(nodes: Vec<NodeRecord>) -> Self {
        Self {
            opens: AtomicUsize::new(0),
            failing_opens: AtomicUsize::new(0),
            links: Mutex::new(Vec::new()),
            events: Mutex::new(None),
            identity: Identity {
                node: Some(BOT),
                owner_name: Some("PingBot".into()),
                node_info_name: None,
                short_name: None,
            },
            nodes,
        }
    }

    /// The next `n` calls to `open` fail with a link error.
    pub fn fail_next_opens(&self, n: usize) {
        self.failing_opens.store(n, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn latest(&self) -> Option<Arc<MockTransport>> {
        self.links.lock().unwrap().last().cloned()
    }

    pub fn link(&self, index: usize) -> Option<Arc<MockTransport>> {
        self.links.lock().unwrap().get(index).cloned()
    }

    /// Push an event as if the current link had received it.
    pub fn inject(&self, event: MeshEvent) {
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(
        &self,
        events: mpsc::UnboundedSender<MeshEvent>,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_opens.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_opens.store(failing - 1, Ordering::SeqCst);
            return Err(TransportError::link("connection refused"));
        }
        let link = Arc::new(MockTransport::new(self.identity.clone(), self.nodes.clone()));
        self.links.lock().unwrap().push(Arc::clone(&link));
        *self.events.lock().unwrap() = Some(events);
        Ok(link)
    }

    fn describe(&self) -> String {
        "mock radio".to_string()
    }
}

/// Notifier that keeps every published line.
#[derive(Default)]
pub struct RecordingNotifier {
    pub lines: Mutex<Vec<(String, Severity)>>,
    pub station: Mutex<Option<String>>,
}

impl RecordingNotifier {
    pub fn contains(&self, needle: &str) -> bool {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .any(|(l, _)| l.contains(needle))
    }
}

impl Notifier for RecordingNotifier {
    fn publish(&self, message: &str, severity: Severity) {
        self.lines
            .lock()
            .unwrap()
            .push((message.to_string(), severity));
    }

    fn set_station_name(&self, name: &str) {
        *self.station.lock().unwrap() = Some(name.to_string());
    }
}

/// Fast timings so reconnect tests finish quickly.
pub fn quick_settings() -> SupervisorSettings {
    SupervisorSettings {
        health_interval: Duration::from_millis(50),
        backoff_floor: Duration::from_millis(20),
        backoff_max: Duration::from_millis(100),
        resync_interval: Duration::ZERO,
        purge_after_days: 30,
    }
}

pub async fn temp_directory(dir: &tempfile::TempDir) -> Arc<dyn PeerDirectory> {
    Arc::new(
        JsonPeerDirectory::open(dir.path().join("peers.json"))
            .await
            .expect("open peer directory"),
    )
}

pub struct Rig {
    pub connector: Arc<MockConnector>,
    pub supervisor: ConnectionSupervisor,
    pub directory: Arc<dyn PeerDirectory>,
    pub notifier: Arc<RecordingNotifier>,
    pub events: mpsc::UnboundedReceiver<MeshEvent>,
    pub _dir: tempfile::TempDir,
}

/// Supervisor over a mock radio, not yet started.
pub async fn rig(connector: MockConnector, settings: SupervisorSettings) -> Rig {
    let dir = tempfile::tempdir().expect("tempdir");
    let directory = temp_directory(&dir).await;
    let connector = Arc::new(connector);
    let notifier = Arc::new(RecordingNotifier::default());
    let (tx, rx) = mpsc::unbounded_channel();
    let supervisor = ConnectionSupervisor::new(
        connector.clone(),
        Arc::clone(&directory),
        notifier.clone(),
        tx,
        settings,
    );
    Rig {
        connector,
        supervisor,
        directory,
        notifier,
        events: rx,
        _dir: dir,
    }
}

pub fn packet(from: NodeId, to: NodeId, payload: Payload) -> InboundPacket {
    InboundPacket {
        from,
        to,
        channel: 0,
        id: 42,
        request_id: 0,
        payload,
        rx_rssi: Some(-95),
        rx_snr: Some(7.5),
        hop_start: Some(3),
        hop_limit: Some(2),
        via_mqtt: false,
    }
}

pub fn channel_text(from: NodeId, text: &str) -> InboundPacket {
    packet(from, NodeId::BROADCAST, Payload::Text(text.to_string()))
}

pub fn direct_text(from: NodeId, text: &str) -> InboundPacket {
    packet(from, BOT, Payload::Text(text.to_string()))
}

pub fn node(id: NodeId, long: &str, short: &str) -> NodeRecord {
    NodeRecord {
        id: Some(id),
        long_name: Some(long.to_string()),
        short_name: Some(short.to_string()),
        ..Default::default()
    }
}

/// Poll `cond` every 10ms until it holds or `within` elapses.
pub async fn eventually<F: FnMut() -> bool>(within: Duration, mut cond: F) -> bool {
    let deadline = Instant::now() + within;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

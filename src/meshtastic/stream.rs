//! Stream transport: Meshtastic client API over TCP or a serial port.
//!
//! Opening a link runs the same handshake the official clients use:
//! 1. send the wake sequence so a serial radio leaves debug console mode
//! 2. send `want_config_id` with a random nonce
//! 3. collect `my_info` and the node database dump until `config_complete_id` echoes the nonce
//!
//! A reader task (a blocking thread for serial) then decodes frames for the rest of the
//! link's life and pushes [`MeshEvent`]s to the application. When the stream ends or errors
//! the link is marked dead; the next write or probe reports a [`TransportError::Link`].
use super::framer::{self, StreamFramer};
use super::proto::{self, from_radio, mesh_packet, to_radio};
use super::{
    Connector, Identity, InboundPacket, MeshEvent, NodeId, NodeRecord, Payload, Transport,
    TransportError,
};
use async_trait::async_trait;
use log::{debug, info, trace, warn};
use prost::Message;
use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
/// Hop limit for replies; matches the firmware default.
const TEXT_HOP_LIMIT: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkParams {
    Tcp { host: String, port: u16 },
    Serial { device: String, baud_rate: u32 },
}

impl fmt::Display for LinkParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkParams::Tcp { host, port } => write!(f, "tcp {}:{}", host, port),
            LinkParams::Serial { device, baud_rate } => {
                write!(f, "serial {} @ {} baud", device, baud_rate)
            }
        }
    }
}

pub struct StreamConnector {
    params: LinkParams,
    handshake_timeout: Duration,
}

impl StreamConnector {
    pub fn new(params: LinkParams) -> Self {
        Self {
            params,
            handshake_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_handshake_timeout(mut self, wait: Duration) -> Self {
        self.handshake_timeout = wait;
        self
    }
}

#[async_trait]
impl Connector for StreamConnector {
    async fn open(
        &self,
        events: mpsc::UnboundedSender<MeshEvent>,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let transport = match &self.params {
            LinkParams::Tcp { host, port } => StreamTransport::open_tcp(host, *port, events).await?,
            LinkParams::Serial { device, baud_rate } => {
                StreamTransport::open_serial(device, *baud_rate, events).await?
            }
        };
        if let Err(e) = transport.handshake(self.handshake_timeout).await {
            transport.close().await;
            return Err(e);
        }
        let (node, known) = {
            let st = transport.shared.lock();
            (st.my_node, st.nodes.len())
        };
        info!(
            "Radio link up ({}): node {}, {} nodes in radio database",
            self.params,
            node.map(|n| n.to_string()).unwrap_or_else(|| "?".into()),
            known
        );
        Ok(Arc::new(transport))
    }

    fn describe(&self) -> String {
        self.params.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigPhase {
    Pending,
    Complete,
    Closed,
}

#[derive(Default)]
struct RadioState {
    my_node: Option<NodeId>,
    owner: Option<NodeRecord>,
    nodes: HashMap<NodeId, NodeRecord>,
    config_id: u32,
    config_complete: bool,
    dead: Option<String>,
}

struct RadioShared {
    state: Mutex<RadioState>,
    phase: watch::Sender<ConfigPhase>,
    stop: AtomicBool,
}

impl RadioShared {
    fn new() -> Self {
        let (phase, _) = watch::channel(ConfigPhase::Pending);
        Self {
            state: Mutex::new(RadioState::default()),
            phase,
            stop: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RadioState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn mark_dead(&self, reason: String) {
        let mut st = self.lock();
        if st.dead.is_none() {
            if !self.stop.load(Ordering::Relaxed) {
                warn!("Radio link lost: {}", reason);
            }
            st.dead = Some(reason);
        }
        drop(st);
        self.phase.send_if_modified(|p| {
            if *p == ConfigPhase::Pending {
                *p = ConfigPhase::Closed;
                true
            } else {
                false
            }
        });
    }

    fn ensure_alive(&self) -> Result<(), TransportError> {
        match &self.lock().dead {
            Some(reason) => Err(TransportError::link(format!("radio link is down: {}", reason))),
            None => Ok(()),
        }
    }
}

fn merge_node(into: &mut NodeRecord, rec: &NodeRecord) {
    if rec.id.is_some() {
        into.id = rec.id;
    }
    if rec.long_name.is_some() {
        into.long_name = rec.long_name.clone();
    }
    if rec.short_name.is_some() {
        into.short_name = rec.short_name.clone();
    }
    into.hw_model = rec.hw_model.or(into.hw_model);
    into.role = rec.role.or(into.role);
    into.is_licensed = rec.is_licensed.or(into.is_licensed);
    into.last_heard = rec.last_heard.or(into.last_heard);
    into.snr = rec.snr.or(into.snr);
    into.hops_away = rec.hops_away.or(into.hops_away);
    into.via_mqtt = rec.via_mqtt;
}

/// Turns raw stream bytes into state updates and events. Owned by the reader.
struct Ingest {
    framer: StreamFramer,
    shared: Arc<RadioShared>,
    events: mpsc::UnboundedSender<MeshEvent>,
}

impl Ingest {
    fn feed(&mut self, bytes: &[u8]) {
        self.framer.push(bytes);
        while let Some(frame) = self.framer.next_frame() {
            match proto::FromRadio::decode(frame.as_slice()) {
                Ok(msg) => self.handle(msg),
                Err(e) => debug!(
                    "Dropping undecodable FromRadio frame ({} bytes): {}",
                    frame.len(),
                    e
                ),
            }
        }
        let skipped = self.framer.take_skipped();
        if skipped > 0 {
            trace!("Skipped {} non-frame bytes on radio stream", skipped);
        }
    }

    fn handle(&mut self, msg: proto::FromRadio) {
        match msg.payload_variant {
            Some(from_radio::PayloadVariant::Packet(pkt)) => {
                let Some(inbound) = InboundPacket::from_proto(&pkt) else {
                    trace!("Ignoring undecoded packet from {}", NodeId(pkt.from));
                    return;
                };
                if let Payload::NodeInfo(rec) = &inbound.payload {
                    let mut st = self.shared.lock();
                    if let Some(id) = rec.id {
                        merge_node(st.nodes.entry(id).or_default(), rec);
                    }
                }
                let _ = self.events.send(MeshEvent::Packet(inbound));
            }
            Some(from_radio::PayloadVariant::MyInfo(info)) => {
                self.shared.lock().my_node = Some(NodeId(info.my_node_num));
            }
            Some(from_radio::PayloadVariant::NodeInfo(info)) => {
                let rec = NodeRecord::from_proto(&info);
                let id = NodeId(info.num);
                let mut st = self.shared.lock();
                if !st.config_complete && st.my_node == Some(id) {
                    st.owner = Some(rec.clone());
                }
                merge_node(st.nodes.entry(id).or_default(), &rec);
                let live = st.config_complete;
                drop(st);
                if live {
                    let _ = self.events.send(MeshEvent::Node(rec));
                }
            }
            Some(from_radio::PayloadVariant::ConfigCompleteId(id)) => {
                let mut st = self.shared.lock();
                if id != st.config_id {
                    debug!("Ignoring config_complete_id {} (expected {})", id, st.config_id);
                    return;
                }
                st.config_complete = true;
                drop(st);
                self.shared.phase.send_replace(ConfigPhase::Complete);
            }
            Some(from_radio::PayloadVariant::Rebooted(_)) => {
                self.shared.mark_dead("radio rebooted".into());
            }
            None => {}
        }
    }
}

enum Writer {
    Tcp(tokio::net::tcp::OwnedWriteHalf),
    #[cfg(feature = "serial")]
    Serial(Arc<Mutex<Box<dyn serialport::SerialPort>>>),
}

impl Writer {
    async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        match self {
            Writer::Tcp(w) => {
                w.write_all(bytes).await?;
                w.flush().await
            }
            #[cfg(feature = "serial")]
            Writer::Serial(port) => {
                let port = Arc::clone(port);
                let bytes = bytes.to_vec();
                tokio::task::spawn_blocking(move || {
                    use std::io::Write as _;
                    let mut guard = port.lock().map_err(|_| {
                        std::io::Error::new(std::io::ErrorKind::Other, "serial port lock poisoned")
                    })?;
                    guard.write_all(&bytes)?;
                    guard.flush()
                })
                .await
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
            }
        }
    }

    async fn shutdown(&mut self) {
        match self {
            Writer::Tcp(w) => {
                let _ = w.shutdown().await;
            }
            #[cfg(feature = "serial")]
            Writer::Serial(_) => {}
        }
    }
}

pub struct StreamTransport {
    writer: tokio::sync::Mutex<Writer>,
    shared: Arc<RadioShared>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl StreamTransport {
    async fn open_tcp(
        host: &str,
        port: u16,
        events: mpsc::UnboundedSender<MeshEvent>,
    ) -> Result<Self, TransportError> {
        debug!("Connecting to radio at {}:{}", host, port);
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .map_err(|_| TransportError::link(format!("connect to {}:{} timed out", host, port)))??;
        let _ = stream.set_nodelay(true);
        let (mut rd, wr) = stream.into_split();

        let shared = Arc::new(RadioShared::new());
        let mut ingest = Ingest {
            framer: StreamFramer::new(),
            shared: Arc::clone(&shared),
            events,
        };
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                match rd.read(&mut buf).await {
                    Ok(0) => {
                        ingest.shared.mark_dead("radio closed the connection".into());
                        break;
                    }
                    Ok(n) => ingest.feed(&buf[..n]),
                    Err(e) => {
                        ingest.shared.mark_dead(e.to_string());
                        break;
                    }
                }
            }
        });

        Ok(Self {
            writer: tokio::sync::Mutex::new(Writer::Tcp(wr)),
            shared,
            reader: Mutex::new(Some(reader)),
        })
    }

    #[cfg(feature = "serial")]
    async fn open_serial(
        device: &str,
        baud_rate: u32,
        events: mpsc::UnboundedSender<MeshEvent>,
    ) -> Result<Self, TransportError> {
        debug!("Opening serial port {} at {} baud", device, baud_rate);
        let mut port = serialport::new(device, baud_rate)
            .timeout(Duration::from_millis(500))
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .open()
            .map_err(|e| TransportError::link(format!("failed to open serial port {}: {}", device, e)))?;

        // Toggle DTR/RTS so the device wakes, then drop whatever boot text is buffered.
        let _ = port.write_data_terminal_ready(true);
        let _ = port.write_request_to_send(true);
        sleep(Duration::from_millis(150)).await;
        let _ = port.clear(serialport::ClearBuffer::Input);

        let mut read_port = port
            .try_clone()
            .map_err(|e| TransportError::link(format!("failed to clone serial port {}: {}", device, e)))?;

        let shared = Arc::new(RadioShared::new());
        let mut ingest = Ingest {
            framer: StreamFramer::new(),
            shared: Arc::clone(&shared),
            events,
        };
        let reader = tokio::task::spawn_blocking(move || {
            use std::io::Read as _;
            let mut buf = [0u8; 1024];
            while !ingest.shared.stop.load(Ordering::Relaxed) {
                match read_port.read(&mut buf) {
                    Ok(0) => std::thread::sleep(std::time::Duration::from_millis(20)),
                    Ok(n) => ingest.feed(&buf[..n]),
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(e) => {
                        ingest.shared.mark_dead(e.to_string());
                        break;
                    }
                }
            }
        });

        Ok(Self {
            writer: tokio::sync::Mutex::new(Writer::Serial(Arc::new(Mutex::new(port)))),
            shared,
            reader: Mutex::new(Some(reader)),
        })
    }

    #[cfg(not(feature = "serial"))]
    async fn open_serial(
        device: &str,
        _baud_rate: u32,
        _events: mpsc::UnboundedSender<MeshEvent>,
    ) -> Result<Self, TransportError> {
        Err(TransportError::app(format!(
            "cannot open {}: built without the `serial` feature",
            device
        )))
    }

    async fn handshake(&self, wait: Duration) -> Result<(), TransportError> {
        let config_id = rand::thread_rng().gen_range(1..u32::MAX);
        self.shared.lock().config_id = config_id;
        let mut phase = self.shared.phase.subscribe();

        self.write_frame_bytes(&framer::wake_bytes()).await?;
        sleep(Duration::from_millis(100)).await;
        self.send_toradio(proto::ToRadio {
            payload_variant: Some(to_radio::PayloadVariant::WantConfigId(config_id)),
        })
        .await?;

        let outcome = timeout(wait, phase.wait_for(|p| *p != ConfigPhase::Pending)).await;
        match outcome {
            Ok(Ok(p)) if *p == ConfigPhase::Complete => Ok(()),
            Ok(_) => Err(TransportError::link("radio stream closed during config handshake")),
            Err(_) => Err(TransportError::link(format!(
                "no config_complete from radio within {}s",
                wait.as_secs()
            ))),
        }
    }

    async fn write_frame_bytes(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.shared.ensure_alive()?;
        let mut writer = self.writer.lock().await;
        match timeout(WRITE_TIMEOUT, writer.write_all(bytes)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.shared.mark_dead(e.to_string());
                Err(e.into())
            }
            Err(_) => {
                self.shared.mark_dead("write timed out".into());
                Err(TransportError::link("write to radio timed out"))
            }
        }
    }

    async fn send_toradio(&self, msg: proto::ToRadio) -> Result<(), TransportError> {
        let payload = msg.encode_to_vec();
        if payload.len() > framer::MAX_FRAME_SIZE {
            return Err(TransportError::app(format!(
                "encoded packet is {} bytes, radio limit is {}",
                payload.len(),
                framer::MAX_FRAME_SIZE
            )));
        }
        self.write_frame_bytes(&framer::encode_frame(&payload)).await
    }

    async fn send_packet(&self, packet: proto::MeshPacket) -> Result<(), TransportError> {
        self.send_toradio(proto::ToRadio {
            payload_variant: Some(to_radio::PayloadVariant::Packet(packet)),
        })
        .await
    }
}

fn packet_id() -> u32 {
    rand::thread_rng().gen_range(1..u32::MAX)
}

#[async_trait]
impl Transport for StreamTransport {
    async fn send_text(&self, text: &str, destination: NodeId) -> Result<(), TransportError> {
        let direct = !destination.is_broadcast();
        let packet = proto::MeshPacket {
            to: destination.0,
            id: packet_id(),
            hop_limit: TEXT_HOP_LIMIT,
            want_ack: direct,
            priority: if direct {
                mesh_packet::priority::RELIABLE
            } else {
                mesh_packet::priority::DEFAULT
            },
            payload_variant: Some(mesh_packet::PayloadVariant::Decoded(proto::Data {
                portnum: proto::PortNum::TextMessageApp as i32,
                payload: text.as_bytes().to_vec(),
                ..Default::default()
            })),
            ..Default::default()
        };
        self.send_packet(packet).await
    }

    async fn send_trace_request(
        &self,
        target: NodeId,
        hop_limit: u32,
    ) -> Result<(), TransportError> {
        if target.is_broadcast() {
            return Err(TransportError::app("cannot trace the broadcast address"));
        }
        let packet = proto::MeshPacket {
            to: target.0,
            id: packet_id(),
            hop_limit,
            want_ack: false,
            priority: mesh_packet::priority::RELIABLE,
            payload_variant: Some(mesh_packet::PayloadVariant::Decoded(proto::Data {
                portnum: proto::PortNum::TracerouteApp as i32,
                payload: proto::RouteDiscovery::default().encode_to_vec(),
                want_response: true,
                ..Default::default()
            })),
            ..Default::default()
        };
        self.send_packet(packet).await
    }

    async fn probe(&self) -> Result<(), TransportError> {
        self.send_toradio(proto::ToRadio {
            payload_variant: Some(to_radio::PayloadVariant::Heartbeat(proto::Heartbeat {})),
        })
        .await
    }

    async fn identity(&self) -> Result<Identity, TransportError> {
        let st = self.shared.lock();
        let node = st
            .my_node
            .ok_or_else(|| TransportError::app("radio has not reported its node number"))?;
        let own = st.nodes.get(&node);
        Ok(Identity {
            node: Some(node),
            owner_name: st.owner.as_ref().and_then(|o| o.long_name.clone()),
            node_info_name: own.and_then(|n| n.long_name.clone()),
            short_name: own.and_then(|n| n.short_name.clone()),
        })
    }

    async fn node_db(&self) -> Result<Vec<NodeRecord>, TransportError> {
        let st = self.shared.lock();
        if !st.config_complete {
            return Err(TransportError::app("node database not loaded yet"));
        }
        Ok(st.nodes.values().cloned().collect())
    }

    async fn close(&self) {
        let was_alive = self.shared.ensure_alive().is_ok();
        if was_alive {
            let _ = self
                .send_toradio(proto::ToRadio {
                    payload_variant: Some(to_radio::PayloadVariant::Disconnect(true)),
                })
                .await;
        }
        self.shared.stop.store(true, Ordering::Relaxed);
        self.shared.mark_dead("closed".into());
        self.writer.lock().await.shutdown().await;
        let handle = self
            .reader
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

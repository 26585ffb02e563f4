//! # Storage Module - Peer Directory
//!
//! Persistent record of every node the bot has heard about, keyed by node id. The directory
//! answers "what do we call this node" for replies and log lines, and is refreshed from three
//! places:
//!
//! - the radio's node database after each connect (`resync_all`)
//! - NODEINFO and NEIGHBORINFO packets as they arrive
//! - signal metadata of every text packet
//!
//! ## Layout
//!
//! ```text
//! data/
//! └── peers.json      ← { "version": 1, "updated_at": ..., "peers": [ ... ] }
//! ```
//!
//! Reads and merges happen in memory so the packet dispatcher never waits on disk. The owner
//! calls [`PeerDirectory::persist`] periodically; writes go to a temp file that is renamed over
//! the destination while an fs2 exclusive lock on a sidecar `.lock` file is held.

use crate::meshtastic::{InboundPacket, NodeId, NodeRecord, Transport, TransportError};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fs2::FileExt;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const FILE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hw_model: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<i32>,
    #[serde(default)]
    pub is_licensed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heard: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snr: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hop_count: Option<u32>,
    #[serde(default)]
    pub via_mqtt: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PeerRecord {
    fn new(id: NodeId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            long_name: None,
            short_name: None,
            hw_model: None,
            role: None,
            is_licensed: false,
            last_heard: None,
            snr: None,
            rssi: None,
            hop_count: None,
            via_mqtt: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Long name, else short name, else the node id.
    pub fn display_name(&self) -> String {
        self.long_name
            .as_deref()
            .or(self.short_name.as_deref())
            .map(str::to_string)
            .unwrap_or_else(|| self.id.to_string())
    }

    fn apply(&mut self, update: &PeerUpdate, now: DateTime<Utc>) {
        if let Some(v) = &update.long_name {
            self.long_name = Some(v.clone());
        }
        if let Some(v) = &update.short_name {
            self.short_name = Some(v.clone());
        }
        self.hw_model = update.hw_model.or(self.hw_model);
        self.role = update.role.or(self.role);
        if let Some(v) = update.is_licensed {
            self.is_licensed = v;
        }
        self.last_heard = match (self.last_heard, update.last_heard) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => b.or(a),
        };
        self.snr = update.snr.or(self.snr);
        self.rssi = update.rssi.or(self.rssi);
        self.hop_count = update.hop_count.or(self.hop_count);
        if let Some(v) = update.via_mqtt {
            self.via_mqtt = v;
        }
        self.updated_at = now;
    }
}

/// Partial record; only the fields that are `Some` are merged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerUpdate {
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub hw_model: Option<i32>,
    pub role: Option<i32>,
    pub is_licensed: Option<bool>,
    pub last_heard: Option<DateTime<Utc>>,
    pub snr: Option<f32>,
    pub rssi: Option<i32>,
    pub hop_count: Option<u32>,
    pub via_mqtt: Option<bool>,
}

impl PeerUpdate {
    pub fn from_record(rec: &NodeRecord) -> Self {
        PeerUpdate {
            long_name: rec.long_name.clone(),
            short_name: rec.short_name.clone(),
            hw_model: rec.hw_model,
            role: rec.role,
            is_licensed: rec.is_licensed,
            last_heard: rec.last_heard,
            snr: rec.snr,
            hop_count: rec.hops_away,
            via_mqtt: Some(rec.via_mqtt),
            ..Default::default()
        }
    }

    /// Signal metadata carried by any received packet.
    pub fn from_packet(pkt: &InboundPacket) -> Self {
        PeerUpdate {
            last_heard: Some(Utc::now()),
            snr: pkt.rx_snr,
            rssi: pkt.rx_rssi,
            hop_count: pkt.hops_taken(),
            via_mqtt: Some(pkt.via_mqtt),
            ..Default::default()
        }
    }

    pub fn merged_with(mut self, other: PeerUpdate) -> Self {
        self.long_name = other.long_name.or(self.long_name);
        self.short_name = other.short_name.or(self.short_name);
        self.hw_model = other.hw_model.or(self.hw_model);
        self.role = other.role.or(self.role);
        self.is_licensed = other.is_licensed.or(self.is_licensed);
        self.last_heard = other.last_heard.or(self.last_heard);
        self.snr = other.snr.or(self.snr);
        self.rssi = other.rssi.or(self.rssi);
        self.hop_count = other.hop_count.or(self.hop_count);
        self.via_mqtt = other.via_mqtt.or(self.via_mqtt);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DirectoryStats {
    pub total: usize,
    /// Peers with both a long and a short name.
    pub complete: usize,
    pub heard_last_24h: usize,
    pub via_mqtt: usize,
}

impl DirectoryStats {
    pub fn completion_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.complete as f64 * 100.0 / self.total as f64
        }
    }
}

/// Node-id keyed peer store.
///
/// `lookup` and `upsert` are synchronous and in-memory; `persist` flushes to durable storage.
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    fn lookup(&self, id: NodeId) -> String;

    fn get(&self, id: NodeId) -> Option<PeerRecord>;

    fn upsert(&self, id: NodeId, update: PeerUpdate);

    /// Pull the radio's node database into the directory. Returns how many peers changed.
    async fn resync_all(&self, transport: &dyn Transport) -> Result<usize, TransportError>;

    fn purge_older_than(&self, days: u32) -> usize;

    fn statistics(&self) -> DirectoryStats;

    async fn persist(&self) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct PeerFile {
    version: u32,
    updated_at: DateTime<Utc>,
    peers: Vec<PeerRecord>,
}

#[derive(Default)]
struct DirState {
    peers: BTreeMap<NodeId, PeerRecord>,
    dirty: bool,
}

/// [`PeerDirectory`] backed by a single JSON file.
pub struct JsonPeerDirectory {
    path: PathBuf,
    state: Mutex<DirState>,
}

impl JsonPeerDirectory {
    /// Load `path` if present. A file that fails to parse is moved aside to `<path>.corrupt`
    /// and the directory starts empty.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut peers = BTreeMap::new();
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let cleaned = content.trim_start_matches('\0');
                match serde_json::from_str::<PeerFile>(cleaned) {
                    Ok(file) => {
                        if file.version > FILE_VERSION {
                            warn!(
                                "Peer file {} has version {} (expected {}); loading anyway",
                                path.display(),
                                file.version,
                                FILE_VERSION
                            );
                        }
                        for rec in file.peers {
                            peers.insert(rec.id, rec);
                        }
                        info!("Loaded {} peers from {}", peers.len(), path.display());
                    }
                    Err(e) => {
                        let aside = path.with_extension("json.corrupt");
                        warn!(
                            "Peer file {} is unreadable ({}); moving it to {}",
                            path.display(),
                            e,
                            aside.display()
                        );
                        tokio::fs::rename(&path, &aside).await?;
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No peer file at {}; starting empty", path.display());
            }
            Err(e) => {
                return Err(anyhow!("Failed to read peer file {}: {}", path.display(), e));
            }
        }
        Ok(Self {
            path,
            state: Mutex::new(DirState {
                peers,
                dirty: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.lock().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, DirState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn purge_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut st = self.lock();
        let before = st.peers.len();
        st.peers
            .retain(|_, p| p.last_heard.unwrap_or(p.created_at) >= cutoff);
        let removed = before - st.peers.len();
        if removed > 0 {
            st.dirty = true;
        }
        removed
    }
}

#[async_trait]
impl PeerDirectory for JsonPeerDirectory {
    fn lookup(&self, id: NodeId) -> String {
        match self.lock().peers.get(&id) {
            Some(rec) => rec.display_name(),
            None => id.to_string(),
        }
    }

    fn get(&self, id: NodeId) -> Option<PeerRecord> {
        self.lock().peers.get(&id).cloned()
    }

    fn upsert(&self, id: NodeId, update: PeerUpdate) {
        let now = Utc::now();
        let mut st = self.lock();
        st.peers
            .entry(id)
            .or_insert_with(|| PeerRecord::new(id, now))
            .apply(&update, now);
        st.dirty = true;
    }

    async fn resync_all(&self, transport: &dyn Transport) -> Result<usize, TransportError> {
        let nodes = transport.node_db().await?;
        let now = Utc::now();
        let mut changed = 0usize;
        let mut st = self.lock();
        for rec in nodes {
            let Some(id) = rec.id else { continue };
            let entry = st
                .peers
                .entry(id)
                .or_insert_with(|| PeerRecord::new(id, now));
            let before = entry.clone();
            entry.apply(&PeerUpdate::from_record(&rec), now);
            if entry.long_name != before.long_name
                || entry.short_name != before.short_name
                || entry.last_heard != before.last_heard
                || before.created_at == now
            {
                changed += 1;
            }
        }
        if changed > 0 {
            st.dirty = true;
        }
        Ok(changed)
    }

    fn purge_older_than(&self, days: u32) -> usize {
        self.purge_before(Utc::now() - ChronoDuration::days(days as i64))
    }

    fn statistics(&self) -> DirectoryStats {
        let cutoff = Utc::now() - ChronoDuration::hours(24);
        let st = self.lock();
        let mut stats = DirectoryStats {
            total: st.peers.len(),
            ..Default::default()
        };
        for p in st.peers.values() {
            if p.long_name.is_some() && p.short_name.is_some() {
                stats.complete += 1;
            }
            if p.last_heard.map(|t| t >= cutoff).unwrap_or(false) {
                stats.heard_last_24h += 1;
            }
            if p.via_mqtt {
                stats.via_mqtt += 1;
            }
        }
        stats
    }

    async fn persist(&self) -> Result<()> {
        let content = {
            let mut st = self.lock();
            if !st.dirty {
                return Ok(());
            }
            let file = PeerFile {
                version: FILE_VERSION,
                updated_at: Utc::now(),
                peers: st.peers.values().cloned().collect(),
            };
            st.dirty = false;
            serde_json::to_string_pretty(&file)?
        };
        let path = self.path.clone();
        let written = tokio::task::spawn_blocking(move || write_file_locked(&path, &content))
            .await
            .map_err(|e| anyhow!("peer file writer panicked: {}", e))?;
        if let Err(e) = written {
            self.lock().dirty = true;
            return Err(e);
        }
        debug!("Peer directory saved to {}", self.path.display());
        Ok(())
    }
}

/// Atomically replace `path` with `content` while holding an exclusive lock on `<path>.lock`.
fn write_file_locked(path: &Path, content: &str) -> Result<()> {
    use std::fs::{self, File, OpenOptions};
    use std::io::Write;

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;

    let base = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("peers.json");
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(dir.join(format!(".{}.lock", base)))?;
    lock_file.lock_exclusive()?;

    let mut counter = 0u32;
    let tmp_path = loop {
        let candidate = dir.join(format!(".{}.tmp-{}-{}", base, std::process::id(), counter));
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(mut tmp) => {
                tmp.write_all(content.as_bytes())?;
                tmp.flush()?;
                let _ = tmp.sync_all();
                break candidate;
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                counter = counter.saturating_add(1);
            }
            Err(e) => return Err(anyhow!("Failed to create temp file for atomic write: {}", e)),
        }
    };

    fs::rename(&tmp_path, path)?;
    if let Ok(dir_file) = File::open(&dir) {
        let _ = dir_file.sync_all();
    }
    let _ = lock_file.unlock();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lookup_falls_back_through_names() {
        let dir = tempfile::tempdir().unwrap();
        let peers = JsonPeerDirectory::open(dir.path().join("peers.json"))
            .await
            .unwrap();
        let id = NodeId(0x1a2b3c4d);
        assert_eq!(peers.lookup(id), "!1a2b3c4d");
        peers.upsert(
            id,
            PeerUpdate {
                short_name: Some("RB".into()),
                ..Default::default()
            },
        );
        assert_eq!(peers.lookup(id), "RB");
        peers.upsert(
            id,
            PeerUpdate {
                long_name: Some("Radio Bob".into()),
                ..Default::default()
            },
        );
        assert_eq!(peers.lookup(id), "Radio Bob");
        // A metadata-only update keeps the names.
        peers.upsert(
            id,
            PeerUpdate {
                snr: Some(4.5),
                ..Default::default()
            },
        );
        assert_eq!(peers.lookup(id), "Radio Bob");
        assert_eq!(peers.get(id).unwrap().snr, Some(4.5));
    }

    #[tokio::test]
    async fn purge_drops_only_stale_peers() {
        let dir = tempfile::tempdir().unwrap();
        let peers = JsonPeerDirectory::open(dir.path().join("peers.json"))
            .await
            .unwrap();
        peers.upsert(
            NodeId(1),
            PeerUpdate {
                last_heard: Some(Utc::now() - ChronoDuration::days(45)),
                ..Default::default()
            },
        );
        peers.upsert(
            NodeId(2),
            PeerUpdate {
                last_heard: Some(Utc::now() - ChronoDuration::days(3)),
                ..Default::default()
            },
        );
        assert_eq!(peers.purge_older_than(30), 1);
        assert!(peers.get(NodeId(1)).is_none());
        assert!(peers.get(NodeId(2)).is_some());
    }

    #[test]
    fn completion_rate_handles_empty() {
        assert_eq!(DirectoryStats::default().completion_rate(), 0.0);
        let s = DirectoryStats {
            total: 4,
            complete: 1,
            ..Default::default()
        };
        assert!((s.completion_rate() - 25.0).abs() < f64::EPSILON);
    }
}

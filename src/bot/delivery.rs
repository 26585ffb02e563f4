//! Outbound delivery: splitting replies to the radio payload limit and sending them in order.
//!
//! Every reply is sent from its own background task so the packet loop never waits on the
//! radio. Tasks live in a [`JoinSet`] that is reaped on each spawn and drained on shutdown.
use super::supervisor::{ConnectionSupervisor, LinkHandle, LinkState};
use crate::logutil::{clip_name, escape_log, floor_char_boundary};
use crate::meshtastic::NodeId;
use crate::metrics;
use crate::notify::{Notifier, Severity};
use crate::storage::PeerDirectory;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, Duration};

/// Split `text` into chunks of at most `max_len` bytes.
///
/// Text that already fits is returned untouched. Otherwise each cut prefers the end of a
/// sentence (`.`, `!` or `?` followed by a space), then the last space, then a hard cut on a
/// char boundary. Chunks are trimmed and empty ones dropped. `max_len` below the width of a
/// single character cannot be honoured; such a character becomes its own chunk.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut rest = text.trim();
    while !rest.is_empty() {
        if rest.len() <= max_len {
            chunks.push(rest.to_string());
            break;
        }
        let cut = sentence_cut(rest, max_len)
            .or_else(|| space_cut(rest, max_len))
            .unwrap_or_else(|| hard_cut(rest, max_len));
        let chunk = rest[..cut].trim_end();
        if !chunk.is_empty() {
            chunks.push(chunk.to_string());
        }
        rest = rest[cut..].trim_start();
    }
    chunks
}

/// Index just past the last `.`/`!`/`?` that is followed by a space and fits in `max_len`.
fn sentence_cut(s: &str, max_len: usize) -> Option<usize> {
    let bytes = s.as_bytes();
    let upper = max_len.min(bytes.len() - 1);
    (0..upper)
        .rev()
        .find(|&i| matches!(bytes[i], b'.' | b'!' | b'?') && bytes[i + 1] == b' ')
        .map(|i| i + 1)
}

/// Index of the last space at or before `max_len`, excluding position 0.
fn space_cut(s: &str, max_len: usize) -> Option<usize> {
    let bytes = s.as_bytes();
    let upper = max_len.min(bytes.len() - 1);
    (1..=upper).rev().find(|&i| bytes[i] == b' ')
}

fn hard_cut(s: &str, max_len: usize) -> usize {
    let cut = floor_char_boundary(s, max_len);
    if cut > 0 {
        return cut;
    }
    s.chars().next().map(char::len_utf8).unwrap_or(s.len())
}

pub struct DeliveryPipeline {
    supervisor: ConnectionSupervisor,
    directory: Arc<dyn PeerDirectory>,
    notifier: Arc<dyn Notifier>,
    max_len: usize,
    chunk_gap: Duration,
    tasks: Mutex<JoinSet<()>>,
}

impl DeliveryPipeline {
    pub fn new(
        supervisor: ConnectionSupervisor,
        directory: Arc<dyn PeerDirectory>,
        notifier: Arc<dyn Notifier>,
        max_len: usize,
        chunk_gap: Duration,
    ) -> Self {
        Self {
            supervisor,
            directory,
            notifier,
            max_len,
            chunk_gap,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub fn split(&self, text: &str) -> Vec<String> {
        split_message(text, self.max_len)
    }

    fn tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Send `chunks` to `destination` one at a time, in order.
    ///
    /// Returns `false` as soon as a chunk fails. A link-class failure is reported to the
    /// supervisor; the remaining chunks are not attempted either way.
    pub async fn send_sequence(&self, chunks: &[String], destination: NodeId) -> bool {
        self.send_over(self.supervisor.handle(), chunks, destination).await
    }

    async fn send_over(
        &self,
        link: Option<LinkHandle>,
        chunks: &[String],
        destination: NodeId,
    ) -> bool {
        let Some(link) = link else {
            debug!(
                "Radio not connected; dropping {} chunk(s) for {}",
                chunks.len(),
                destination
            );
            metrics::inc_send_failures();
            return false;
        };
        for (i, chunk) in chunks.iter().enumerate() {
            if i > 0 {
                sleep(self.chunk_gap).await;
            }
            let result = {
                let _in_flight = self.supervisor.begin_send();
                link.transport.send_text(chunk, destination).await
            };
            match result {
                Ok(()) => metrics::inc_messages_sent(),
                Err(e) => {
                    metrics::inc_send_failures();
                    if e.is_link() {
                        self.supervisor
                            .report_transport_error(link.generation, "send", &e);
                    } else {
                        warn!(
                            "Send to {} failed at chunk {}/{}: {}",
                            destination,
                            i + 1,
                            chunks.len(),
                            e
                        );
                    }
                    return false;
                }
            }
        }
        true
    }

    /// Deliver in the background and publish one summary line when done.
    ///
    /// The link is the one current at call time, so a reply issued while the radio was up is
    /// not lost to a later demotion of that link.
    pub fn send_async(self: &Arc<Self>, chunks: Vec<String>, destination: NodeId, label: &str) {
        let link = self.supervisor.handle();
        self.spawn_delivery(chunks, destination, label, link, Duration::ZERO);
    }

    /// Split `text` and deliver it in the background.
    pub fn reply(self: &Arc<Self>, text: &str, destination: NodeId, label: &str) {
        let chunks = self.split(text);
        self.send_async(chunks, destination, label);
    }

    /// Like [`reply`](Self::reply), but if the radio is down wait up to `wait` for the next link.
    pub fn reply_after_reconnect(
        self: &Arc<Self>,
        text: &str,
        destination: NodeId,
        label: &str,
        wait: Duration,
    ) {
        let chunks = self.split(text);
        let link = self.supervisor.handle();
        self.spawn_delivery(chunks, destination, label, link, wait);
    }

    fn spawn_delivery(
        self: &Arc<Self>,
        chunks: Vec<String>,
        destination: NodeId,
        label: &str,
        link: Option<LinkHandle>,
        reconnect_wait: Duration,
    ) {
        if chunks.is_empty() {
            debug!("Nothing to send for {} -> {}", label, destination);
            return;
        }
        let this = Arc::clone(self);
        let label = label.to_string();
        let mut tasks = self.tasks();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            let link = match link {
                Some(link) => Some(link),
                None if !reconnect_wait.is_zero() => this.next_link(reconnect_wait).await,
                None => None,
            };
            let ok = this.send_over(link, &chunks, destination).await;
            let name = clip_name(&this.directory.lookup(destination), 50);
            if !ok {
                this.notifier.publish(
                    &format!("Failed to send {} -> {}", label, name),
                    Severity::Warning,
                );
            } else if chunks.len() == 1 {
                this.notifier.publish(
                    &format!("{} -> {}: {}", label, name, escape_log(&chunks[0])),
                    Severity::Info,
                );
            } else {
                this.notifier.publish(
                    &format!("{} -> {}: {} messages", label, name, chunks.len()),
                    Severity::Info,
                );
            }
        });
    }

    async fn next_link(&self, wait: Duration) -> Option<LinkHandle> {
        let mut state = self.supervisor.subscribe_state();
        let up = timeout(wait, state.wait_for(|s| *s == LinkState::Connected))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);
        if up {
            self.supervisor.handle()
        } else {
            None
        }
    }

    /// Deliveries spawned and not yet reaped.
    pub fn pending(&self) -> usize {
        self.tasks().len()
    }

    /// Wait up to `wait` for outstanding deliveries, then abandon the rest.
    pub async fn drain(&self, wait: Duration) {
        let mut set = std::mem::take(&mut *self.tasks());
        if set.is_empty() {
            return;
        }
        info!(
            "Waiting up to {}s for {} outbound deliveries",
            wait.as_secs(),
            set.len()
        );
        let finished = timeout(wait, async {
            while set.join_next().await.is_some() {}
        })
        .await;
        if finished.is_err() {
            warn!(
                "{} deliveries still running after {}s; abandoning them",
                set.len(),
                wait.as_secs()
            );
            set.abort_all();
        }
    }
}

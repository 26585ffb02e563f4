//! Inbound packet dispatch.
//!
//! Runs synchronously on the server loop for every event the radio produces. Nothing here
//! awaits: replies are handed to the delivery pipeline and trace requests to the orchestrator,
//! both of which do their I/O on their own tasks.
use super::delivery::DeliveryPipeline;
use super::rate_limit::RateLimiter;
use super::replies::{self, Command};
use super::supervisor::ConnectionSupervisor;
use super::traceroute::{Admission, TracerouteOrchestrator};
use crate::config::{BotConfig, TracerouteConfig};
use crate::logutil::{clip_name, escape_log};
use crate::meshtastic::{InboundPacket, MeshEvent, Payload};
use crate::metrics;
use crate::notify::{Notifier, Severity};
use crate::storage::{PeerDirectory, PeerUpdate};
use chrono::Local;
use log::{debug, trace};
use std::sync::Arc;

/// What the dispatcher did with a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ignored,
    OwnPacket,
    TraceResponse { matched: bool },
    DirectoryUpdated,
    RateLimited,
    Replied(Command),
}

pub struct InboundDispatcher {
    bot: BotConfig,
    trace_config: TracerouteConfig,
    supervisor: ConnectionSupervisor,
    directory: Arc<dyn PeerDirectory>,
    limiter: Arc<RateLimiter>,
    delivery: Arc<DeliveryPipeline>,
    traces: TracerouteOrchestrator,
    notifier: Arc<dyn Notifier>,
}

impl InboundDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bot: BotConfig,
        trace_config: TracerouteConfig,
        supervisor: ConnectionSupervisor,
        directory: Arc<dyn PeerDirectory>,
        limiter: Arc<RateLimiter>,
        delivery: Arc<DeliveryPipeline>,
        traces: TracerouteOrchestrator,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            bot,
            trace_config,
            supervisor,
            directory,
            limiter,
            delivery,
            traces,
            notifier,
        }
    }

    pub fn handle_event(&self, event: MeshEvent) -> Disposition {
        match event {
            MeshEvent::Packet(pkt) => self.handle(&pkt),
            MeshEvent::Node(rec) => match rec.id {
                Some(id) => {
                    self.directory.upsert(id, PeerUpdate::from_record(&rec));
                    trace!("Node database entry refreshed for {}", id);
                    Disposition::DirectoryUpdated
                }
                None => Disposition::Ignored,
            },
        }
    }

    pub fn handle(&self, pkt: &InboundPacket) -> Disposition {
        if self.supervisor.local_node() == Some(pkt.from) {
            return Disposition::OwnPacket;
        }
        match &pkt.payload {
            Payload::Traceroute(_) | Payload::Routing { .. } => {
                let matched = self.traces.match_response(pkt);
                Disposition::TraceResponse { matched }
            }
            Payload::NodeInfo(rec) => {
                self.directory.upsert(
                    pkt.from,
                    PeerUpdate::from_record(rec).merged_with(PeerUpdate::from_packet(pkt)),
                );
                let name = clip_name(&self.directory.lookup(pkt.from), 50);
                self.notifier.publish(
                    &format!("Updated node info for {} ({})", name, pkt.from),
                    Severity::Debug,
                );
                Disposition::DirectoryUpdated
            }
            Payload::NeighborInfo { neighbors } => {
                self.directory.upsert(pkt.from, PeerUpdate::from_packet(pkt));
                let name = clip_name(&self.directory.lookup(pkt.from), 50);
                self.notifier.publish(
                    &format!(
                        "Updated neighbor info for {} ({}, {} neighbors)",
                        name, pkt.from, neighbors
                    ),
                    Severity::Debug,
                );
                Disposition::DirectoryUpdated
            }
            Payload::Text(text) => self.handle_text(pkt, text),
            Payload::Other(port) => {
                trace!("Ignoring port {} packet from {}", port, pkt.from);
                Disposition::Ignored
            }
        }
    }

    fn handle_text(&self, pkt: &InboundPacket, text: &str) -> Disposition {
        let msg = text.trim().to_lowercase();
        if msg.len() > self.bot.max_inbound_len {
            debug!("Ignoring {}-byte message from {}", msg.len(), pkt.from);
            return Disposition::Ignored;
        }

        self.directory.upsert(pkt.from, PeerUpdate::from_packet(pkt));
        let sender = clip_name(&self.directory.lookup(pkt.from), 50);
        let direct = pkt.is_direct_message();
        let origin = if direct { "DM" } else { "Channel" };
        self.notifier.publish(
            &format!("Incoming from {} via {}: '{}'", sender, origin, escape_log(&msg)),
            Severity::Info,
        );

        let Some(command) = replies::parse_command(&msg, direct, &self.bot) else {
            return Disposition::Ignored;
        };

        if !self.limiter.allow(pkt.from, self.bot.reply_cooldown()) {
            metrics::inc_replies_rate_limited();
            self.notifier
                .publish(&format!("Rate-limited reply to {}", sender), Severity::Info);
            return Disposition::RateLimited;
        }

        match command {
            Command::Help => self.delivery.reply(
                &replies::help_text(&self.bot, &self.trace_config),
                pkt.from,
                "DM Help/About",
            ),
            Command::About => {
                self.delivery
                    .reply(&replies::about_text(&self.bot), pkt.from, "DM Help/About")
            }
            Command::Traceroute => {
                let admission = self.traces.enqueue(pkt.from, pkt.from, pkt.from);
                let reply = match &admission {
                    Admission::Queued { .. } => {
                        format!("Traceroute queued: {}", admission.message())
                    }
                    Admission::QueueFull { max } => {
                        format!("Traceroute failed: queue full (max {} per user)", max)
                    }
                    Admission::ShuttingDown => {
                        format!("Traceroute failed: {}", admission.message())
                    }
                };
                self.notifier.publish(
                    &format!("Traceroute request from {}: {}", sender, admission.message()),
                    Severity::Info,
                );
                self.delivery.reply(&reply, pkt.from, "Traceroute Queue");
            }
            Command::Ping(count) => {
                let now = Local::now();
                let chunks: Vec<String> = (0..count)
                    .flat_map(|_| self.delivery.split(&replies::pong_text(pkt, now)))
                    .collect();
                self.delivery.send_async(chunks, pkt.from, "Reply");
            }
        }
        Disposition::Replied(command)
    }
}

//! Canned reply texts and the chat command grammar.
use crate::config::{BotConfig, TracerouteConfig};
use crate::meshtastic::InboundPacket;
use chrono::{DateTime, Local};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Help,
    About,
    Traceroute,
    /// Trigger word or `ping N`; carries the number of pongs to send.
    Ping(u32),
}

/// Classify an already trimmed, lower-cased message.
///
/// `help`/`about` style commands only count in direct messages. `ping N` with N outside
/// `1..=max_ping` (or not a number) still earns a single pong.
pub fn parse_command(msg: &str, direct: bool, bot: &BotConfig) -> Option<Command> {
    if direct && bot.dm_commands.iter().any(|c| c == msg) {
        return Some(if msg.trim_start_matches('/') == "about" {
            Command::About
        } else {
            Command::Help
        });
    }
    if msg == bot.traceroute_command {
        return Some(Command::Traceroute);
    }
    if bot.triggers.iter().any(|t| t == msg) {
        return Some(Command::Ping(1));
    }
    let mut parts = msg.split_whitespace();
    if let (Some("ping"), Some(n), None) = (parts.next(), parts.next(), parts.next()) {
        let count = n
            .parse::<u32>()
            .ok()
            .filter(|c| (1..=bot.max_ping_count).contains(c))
            .unwrap_or(1);
        return Some(Command::Ping(count));
    }
    None
}

pub fn help_text(bot: &BotConfig, trace: &TracerouteConfig) -> String {
    format!(
        "Meshtastic Pingbot Help:\n\n\
         I respond to these triggers in channels and DMs: {}\n\n\
         Commands:\n\
         • ping/hello/test - Connection info (RSSI, SNR, hop count)\n\
         • {} - Meshtastic network path trace ({}s rate limit, max {} queued per user)\n\n\
         Enhanced ping command: 'ping N' where N is 1-{} for multiple responses.\n\n\
         DM-only commands: help, /help - Show this help message. \
         about, /about - Show information about this bot.",
        bot.triggers.join(", "),
        bot.traceroute_command,
        trace.rate_limit_secs,
        trace.max_queue_per_user,
        bot.max_ping_count,
    )
}

pub fn about_text(bot: &BotConfig) -> String {
    format!(
        "Meshtastic Pingbot v{}\n\n\
         I'm a simple ping-pong bot that helps test Meshtastic network connectivity. \
         Send me '{}' and I'll respond with your connection quality metrics. \
         Use 'ping N' (N=1-{}) for multiple responses. \
         Features: RSSI and SNR reporting, Hop count tracking, Rate limiting ({}s cooldown), \
         Channel and DM support. Built for the Meshtastic mesh networking community.",
        env!("CARGO_PKG_VERSION"),
        bot.triggers.join(", "),
        bot.max_ping_count,
        bot.reply_cooldown_secs,
    )
}

/// `pong (2024-05-01 12:00:00) RSSI: -97 SNR: 6.25 Hops: 2/3`
pub fn pong_text(pkt: &InboundPacket, now: DateTime<Local>) -> String {
    let rssi = pkt
        .rx_rssi
        .map(|v| v.to_string())
        .unwrap_or_else(|| "N/A".into());
    let snr = pkt
        .rx_snr
        .map(|v| v.to_string())
        .unwrap_or_else(|| "N/A".into());
    let mut out = format!(
        "pong ({}) RSSI: {} SNR: {}",
        now.format("%Y-%m-%d %H:%M:%S"),
        rssi,
        snr
    );
    if let (Some(hops), Some(start)) = (pkt.hops_taken(), pkt.hop_start) {
        out.push_str(&format!(" Hops: {}/{}", hops, start));
    }
    out
}

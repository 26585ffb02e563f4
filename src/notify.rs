//! Operator notifications.
//!
//! Components report noteworthy events (replies sent, traces finished, link changes) through
//! a [`Notifier`]. The bot fans each event out to the log and, when configured, to a
//! Discord-compatible webhook. Publishing never blocks the caller.
use log::{debug, error, info, warn};
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}

pub trait Notifier: Send + Sync {
    fn publish(&self, message: &str, severity: Severity);

    /// Called once the radio identity is known so sinks can tag their output.
    fn set_station_name(&self, _name: &str) {}
}

/// Writes events through the `log` facade under the `notify` target.
#[derive(Default)]
pub struct LogNotifier {
    station: RwLock<Option<String>>,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Notifier for LogNotifier {
    fn publish(&self, message: &str, severity: Severity) {
        let station = self.station.read().ok().and_then(|s| s.clone());
        let line = match station {
            Some(name) => format!("[{}] {}", name, message),
            None => message.to_string(),
        };
        match severity {
            Severity::Debug => debug!(target: "notify", "{}", line),
            Severity::Info => info!(target: "notify", "{}", line),
            Severity::Warning => warn!(target: "notify", "{}", line),
            Severity::Error => error!(target: "notify", "{}", line),
        }
    }

    fn set_station_name(&self, name: &str) {
        if let Ok(mut slot) = self.station.write() {
            *slot = if name.is_empty() {
                None
            } else {
                Some(name.to_string())
            };
        }
    }
}

/// Posts `{"content": ...}` to a webhook URL. Debug events are not forwarded.
#[cfg(feature = "webhook")]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    station: RwLock<Option<String>>,
    min_severity: Severity,
}

#[cfg(feature = "webhook")]
impl WebhookNotifier {
    const TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);
    /// Discord rejects messages longer than this.
    const MAX_CONTENT: usize = 1900;

    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            station: RwLock::new(None),
            min_severity: Severity::Info,
        }
    }

    fn format(&self, message: &str) -> String {
        let station = self.station.read().ok().and_then(|s| s.clone());
        let text = match station {
            Some(name) => format!("**{}**: {}", name, message),
            None => message.to_string(),
        };
        let cut = crate::logutil::floor_char_boundary(&text, Self::MAX_CONTENT);
        text[..cut].to_string()
    }
}

#[cfg(feature = "webhook")]
impl Notifier for WebhookNotifier {
    fn publish(&self, message: &str, severity: Severity) {
        if severity_rank(severity) < severity_rank(self.min_severity) {
            return;
        }
        // Outside a runtime (CLI helpers, some tests) there is nothing to post from.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let body = serde_json::json!({ "content": self.format(message) });
        let request = self.client.post(&self.url).json(&body);
        handle.spawn(async move {
            match tokio::time::timeout(Self::TIMEOUT, request.send()).await {
                Ok(Ok(resp)) if resp.status().is_success() => {}
                Ok(Ok(resp)) => debug!("Webhook rejected notification: HTTP {}", resp.status()),
                Ok(Err(e)) => debug!("Webhook post failed: {}", e),
                Err(_) => debug!("Webhook post timed out after {}s", Self::TIMEOUT.as_secs()),
            }
        });
    }

    fn set_station_name(&self, name: &str) {
        if let Ok(mut slot) = self.station.write() {
            *slot = Some(name.to_string()).filter(|n| !n.is_empty());
        }
    }
}

fn severity_rank(s: Severity) -> u8 {
    match s {
        Severity::Debug => 0,
        Severity::Info => 1,
        Severity::Warning => 2,
        Severity::Error => 3,
    }
}

/// Sends every event to each inner sink.
#[derive(Default)]
pub struct FanoutNotifier {
    sinks: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn Notifier>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl Notifier for FanoutNotifier {
    fn publish(&self, message: &str, severity: Severity) {
        for sink in &self.sinks {
            sink.publish(message, severity);
        }
    }

    fn set_station_name(&self, name: &str) {
        for sink in &self.sinks {
            sink.set_station_name(name);
        }
    }
}

/// Build the notifier described by the config: always the log, plus the webhook if set.
pub fn from_config(config: &crate::config::NotifyConfig) -> Arc<dyn Notifier> {
    let fanout = FanoutNotifier::new().with(Arc::new(LogNotifier::new()));
    match config.webhook_url.as_deref().map(str::trim) {
        #[cfg(feature = "webhook")]
        Some(url) if !url.is_empty() => {
            info!("Forwarding notifications to webhook");
            Arc::new(fanout.with(Arc::new(WebhookNotifier::new(url))))
        }
        #[cfg(not(feature = "webhook"))]
        Some(url) if !url.is_empty() => {
            warn!("webhook_url is set but this build lacks the `webhook` feature; ignoring");
            Arc::new(fanout)
        }
        _ => Arc::new(fanout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Capture {
        lines: Mutex<Vec<(String, Severity)>>,
        station: Mutex<String>,
    }

    impl Notifier for Capture {
        fn publish(&self, message: &str, severity: Severity) {
            self.lines.lock().unwrap().push((message.to_string(), severity));
        }
        fn set_station_name(&self, name: &str) {
            *self.station.lock().unwrap() = name.to_string();
        }
    }

    #[test]
    fn fanout_reaches_every_sink() {
        let a = Arc::new(Capture::default());
        let b = Arc::new(Capture::default());
        let fan = FanoutNotifier::new().with(a.clone()).with(b.clone());
        fan.set_station_name("Hilltop");
        fan.publish("Reply -> Bob: pong", Severity::Info);
        assert_eq!(a.lines.lock().unwrap().len(), 1);
        assert_eq!(b.lines.lock().unwrap()[0].0, "Reply -> Bob: pong");
        assert_eq!(*b.station.lock().unwrap(), "Hilltop");
    }

    #[cfg(feature = "webhook")]
    #[test]
    fn webhook_content_is_capped() {
        let hook = WebhookNotifier::new("http://127.0.0.1:9/hook");
        hook.set_station_name("Hilltop");
        let body = hook.format(&"é".repeat(2000));
        assert!(body.starts_with("**Hilltop**: "));
        assert!(body.len() <= WebhookNotifier::MAX_CONTENT);
    }
}

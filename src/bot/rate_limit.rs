//! Per-sender cooldown for trigger replies.
//!
//! The timestamp is taken when a reply is admitted, not when it is delivered, so a reply that
//! later fails to send still uses up the sender's window.
use crate::meshtastic::NodeId;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Default)]
pub struct RateLimiter {
    last_reply: Mutex<HashMap<NodeId, Instant>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(&self, sender: NodeId, cooldown: Duration) -> bool {
        self.allow_at(sender, cooldown, Instant::now())
    }

    /// `allow` with an explicit clock. A request exactly `cooldown` after the last admitted one
    /// is accepted; a rejection leaves the table untouched.
    pub fn allow_at(&self, sender: NodeId, cooldown: Duration, now: Instant) -> bool {
        let mut table = self.last_reply.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(last) = table.get(&sender) {
            if now.saturating_duration_since(*last) < cooldown {
                return false;
            }
        }
        table.insert(sender, now);
        true
    }

    /// Forget senders whose last admission is older than `max_age`.
    pub fn prune(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut table = self.last_reply.lock().unwrap_or_else(|p| p.into_inner());
        let before = table.len();
        table.retain(|_, last| now.saturating_duration_since(*last) < max_age);
        before - table.len()
    }

    pub fn len(&self) -> usize {
        self.last_reply.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_boundary_is_inclusive() {
        let rl = RateLimiter::new();
        let s = NodeId(7);
        let cd = Duration::from_secs(15);
        let t0 = Instant::now();
        assert!(rl.allow_at(s, cd, t0));
        assert!(!rl.allow_at(s, cd, t0 + Duration::from_secs(14)));
        assert!(rl.allow_at(s, cd, t0 + cd));
        // The window restarted at t0 + 15.
        assert!(!rl.allow_at(s, cd, t0 + Duration::from_secs(29)));
    }

    #[test]
    fn rejection_does_not_extend_window() {
        let rl = RateLimiter::new();
        let s = NodeId(9);
        let cd = Duration::from_secs(10);
        let t0 = Instant::now();
        assert!(rl.allow_at(s, cd, t0));
        for i in 1..10 {
            assert!(!rl.allow_at(s, cd, t0 + Duration::from_secs(i)));
        }
        assert!(rl.allow_at(s, cd, t0 + Duration::from_secs(10)));
    }

    #[test]
    fn senders_are_independent() {
        let rl = RateLimiter::new();
        let cd = Duration::from_secs(60);
        let t0 = Instant::now();
        assert!(rl.allow_at(NodeId(1), cd, t0));
        assert!(rl.allow_at(NodeId(2), cd, t0));
        assert!(!rl.allow_at(NodeId(1), cd, t0));
        assert_eq!(rl.len(), 2);
    }

    #[test]
    fn prune_drops_old_entries() {
        let rl = RateLimiter::new();
        rl.allow(NodeId(1), Duration::from_secs(1));
        assert_eq!(rl.prune(Duration::from_secs(3600)), 0);
        assert_eq!(rl.prune(Duration::ZERO), 1);
        assert!(rl.is_empty());
    }
}

//! Process-wide counters for the bot's moving parts.
//! Read through [`snapshot`]; the server logs a snapshot on its housekeeping tick.
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

static MESSAGES_SENT: AtomicU64 = AtomicU64::new(0);
static SEND_FAILURES: AtomicU64 = AtomicU64::new(0);
static REPLIES_RATE_LIMITED: AtomicU64 = AtomicU64::new(0);
static TRACES_QUEUED: AtomicU64 = AtomicU64::new(0);
static TRACES_REJECTED: AtomicU64 = AtomicU64::new(0);
static TRACES_DISPATCHED: AtomicU64 = AtomicU64::new(0);
static TRACES_COMPLETED: AtomicU64 = AtomicU64::new(0);
static TRACES_TIMED_OUT: AtomicU64 = AtomicU64::new(0);
static TRACES_FAILED: AtomicU64 = AtomicU64::new(0);
static CONNECTS: AtomicU64 = AtomicU64::new(0);
static LINK_ERRORS: AtomicU64 = AtomicU64::new(0);

pub fn inc_messages_sent() {
    MESSAGES_SENT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_send_failures() {
    SEND_FAILURES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_replies_rate_limited() {
    REPLIES_RATE_LIMITED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_traces_queued() {
    TRACES_QUEUED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_traces_rejected() {
    TRACES_REJECTED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_traces_dispatched() {
    TRACES_DISPATCHED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_traces_completed() {
    TRACES_COMPLETED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_traces_timed_out() {
    TRACES_TIMED_OUT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_traces_failed() {
    TRACES_FAILED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_connects() {
    CONNECTS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_link_errors() {
    LINK_ERRORS.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub messages_sent: u64,
    pub send_failures: u64,
    pub replies_rate_limited: u64,
    pub traces_queued: u64,
    pub traces_rejected: u64,
    pub traces_dispatched: u64,
    pub traces_completed: u64,
    pub traces_timed_out: u64,
    pub traces_failed: u64,
    pub connects: u64,
    pub link_errors: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        messages_sent: MESSAGES_SENT.load(Ordering::Relaxed),
        send_failures: SEND_FAILURES.load(Ordering::Relaxed),
        replies_rate_limited: REPLIES_RATE_LIMITED.load(Ordering::Relaxed),
        traces_queued: TRACES_QUEUED.load(Ordering::Relaxed),
        traces_rejected: TRACES_REJECTED.load(Ordering::Relaxed),
        traces_dispatched: TRACES_DISPATCHED.load(Ordering::Relaxed),
        traces_completed: TRACES_COMPLETED.load(Ordering::Relaxed),
        traces_timed_out: TRACES_TIMED_OUT.load(Ordering::Relaxed),
        traces_failed: TRACES_FAILED.load(Ordering::Relaxed),
        connects: CONNECTS.load(Ordering::Relaxed),
        link_errors: LINK_ERRORS.load(Ordering::Relaxed),
    }
}

//! Process-wide counters exposed on the debug endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub struct Stats {
    started: Instant,
    pub udp_queries: AtomicU64,
    pub tcp_queries: AtomicU64,
    pub replies_ok: AtomicU64,
    pub replies_failed: AtomicU64,
    pub unparseable: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            udp_queries: AtomicU64::new(0),
            tcp_queries: AtomicU64::new(0),
            replies_ok: AtomicU64::new(0),
            replies_failed: AtomicU64::new(0),
            unparseable: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "uptime_secs": self.started.elapsed().as_secs(),
            "udp_queries": self.udp_queries.load(Ordering::Relaxed),
            "tcp_queries": self.tcp_queries.load(Ordering::Relaxed),
            "replies_ok": self.replies_ok.load(Ordering::Relaxed),
            "replies_failed": self.replies_failed.load(Ordering::Relaxed),
            "unparseable": self.unparseable.load(Ordering::Relaxed),
        })
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

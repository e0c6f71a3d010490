// Data-plane counters consumed by the observability collaborator

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters for the ingestion and multicast paths.
#[derive(Debug, Default)]
pub struct Metrics {
    malformed_artnet: AtomicU64,
    malformed_sacn: AtomicU64,
    socket_errors: AtomicU64,
    igmp_failures: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub malformed_artnet: u64,
    pub malformed_sacn: u64,
    pub socket_errors: u64,
    pub igmp_failures: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_malformed_artnet(&self) {
        self.malformed_artnet.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_malformed_sacn(&self) {
        self.malformed_sacn.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_socket_error(&self) {
        self.socket_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_igmp_failure(&self) {
        self.igmp_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            malformed_artnet: self.malformed_artnet.load(Ordering::Relaxed),
            malformed_sacn: self.malformed_sacn.load(Ordering::Relaxed),
            socket_errors: self.socket_errors.load(Ordering::Relaxed),
            igmp_failures: self.igmp_failures.load(Ordering::Relaxed),
        }
    }
}

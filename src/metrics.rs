// src/metrics.rs
use std::sync::atomic::{AtomicUsize, Ordering};

/// Server-wide counters, cache-line aligned to keep the hot atomics off
/// shared lines.
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct ServerMetrics {
    requests: AtomicUsize,
    active_connections: AtomicUsize,
    bytes_sent: AtomicUsize,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn conn_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn conn_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, n: usize) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent.load(Ordering::Relaxed)
    }
}

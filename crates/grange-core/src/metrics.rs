//! Read-mostly atomic counters with non-atomic snapshot views.

use std::sync::atomic::{AtomicU64, Ordering};

/// Client-side dispatch counters.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    pub requests_sent: AtomicU64,
    pub responses_matched: AtomicU64,
    pub late_responses_dropped: AtomicU64,
    pub timeouts: AtomicU64,
    pub cancellations: AtomicU64,
    pub failures: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchMetricsSnapshot {
    pub requests_sent: u64,
    pub responses_matched: u64,
    pub late_responses_dropped: u64,
    pub timeouts: u64,
    pub cancellations: u64,
    pub failures: u64,
}

impl DispatchMetrics {
    pub fn snapshot(&self) -> DispatchMetricsSnapshot {
        DispatchMetricsSnapshot {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            responses_matched: self.responses_matched.load(Ordering::Relaxed),
            late_responses_dropped: self.late_responses_dropped.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Per-session traffic counters.
#[derive(Debug, Default)]
pub struct SessionMetrics {
    pub frames_sent: AtomicU64,
    pub frames_received: AtomicU64,
    pub heartbeats_sent: AtomicU64,
    pub heartbeats_received: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionMetricsSnapshot {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub heartbeats_sent: u64,
    pub heartbeats_received: u64,
}

impl SessionMetrics {
    pub fn snapshot(&self) -> SessionMetricsSnapshot {
        SessionMetricsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            heartbeats_received: self.heartbeats_received.load(Ordering::Relaxed),
        }
    }
}

/// Server-side catalog counters.
#[derive(Debug, Default)]
pub struct CatalogMetrics {
    pub activations: AtomicU64,
    pub evictions: AtomicU64,
    pub invocations: AtomicU64,
    pub handler_errors: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CatalogMetricsSnapshot {
    pub activations: u64,
    pub evictions: u64,
    pub invocations: u64,
    pub handler_errors: u64,
}

impl CatalogMetrics {
    pub fn snapshot(&self) -> CatalogMetricsSnapshot {
        CatalogMetricsSnapshot {
            activations: self.activations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            invocations: self.invocations.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
        }
    }
}

/// Authorization pipeline counters.
#[derive(Debug, Default)]
pub struct AuthMetrics {
    pub allowed: AtomicU64,
    pub denied: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AuthMetricsSnapshot {
    pub allowed: u64,
    pub denied: u64,
}

impl AuthMetrics {
    pub fn snapshot(&self) -> AuthMetricsSnapshot {
        AuthMetricsSnapshot {
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
        }
    }
}

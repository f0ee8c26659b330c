//! `Metrics` sink collaborator interface (out of scope per the core
//! specification, but wired in so the dispatch engine has somewhere to
//! write its counters).

use std::sync::atomic::{AtomicU64, Ordering};

/// Receives counters from the connection lifecycle and dispatch engine.
///
/// A real deployment would back this with a Prometheus/StatsD exporter; the
/// core only ever calls these methods, never reads them back.
pub trait Metrics: Send + Sync {
    /// A connection was accepted.
    fn connection_accepted(&self);
    /// A connection was closed, for whatever reason.
    fn connection_closed(&self);
    /// A chat message was processed (decrypted, verified, and stored).
    fn message_processed(&self, latency: std::time::Duration);
    /// A message failed processing (bad tag, bad signature, store failure).
    fn message_failed(&self);
    /// A rate-limit bucket denied a request.
    fn rate_limited(&self);
    /// Point-in-time snapshot of every counter, polled by the Acceptor's
    /// stats tick.
    fn snapshot(&self) -> MetricsSnapshot;
}

/// In-process counter accumulator, polled by the Acceptor's stats tick.
#[derive(Default)]
pub struct CountingMetrics {
    connections_accepted: AtomicU64,
    connections_closed: AtomicU64,
    messages_processed: AtomicU64,
    messages_failed: AtomicU64,
    rate_limited: AtomicU64,
    total_latency_micros: AtomicU64,
}

impl Metrics for CountingMetrics {
    fn connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    fn message_processed(&self, latency: std::time::Duration) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
        self.total_latency_micros
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    fn message_failed(&self) {
        self.messages_failed.fetch_add(1, Ordering::Relaxed);
    }

    fn rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
        }
    }
}

/// A snapshot of [`CountingMetrics`], taken on the Acceptor's 30s stats tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Connections accepted since startup.
    pub connections_accepted: u64,
    /// Connections closed since startup.
    pub connections_closed: u64,
    /// Messages successfully processed since startup.
    pub messages_processed: u64,
    /// Messages that failed processing since startup.
    pub messages_failed: u64,
    /// Requests denied by the rate limiter since startup.
    pub rate_limited: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = CountingMetrics::default();
        metrics.connection_accepted();
        metrics.connection_accepted();
        metrics.connection_closed();
        metrics.message_processed(std::time::Duration::from_millis(1));
        metrics.message_failed();
        metrics.rate_limited();

        let snap = metrics.snapshot();
        assert_eq!(snap.connections_accepted, 2);
        assert_eq!(snap.connections_closed, 1);
        assert_eq!(snap.messages_processed, 1);
        assert_eq!(snap.messages_failed, 1);
        assert_eq!(snap.rate_limited, 1);
    }
}

//! Communication Metrics
//!
//! Counters shared by senders and receivers: frames and bytes moved, peer
//! connections dropped, errors by category, and write latency percentiles
//! over a sliding window of recent writes.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Point-in-time view of a [`MetricsTracker`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommunicationMetrics {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub errors: u64,
    /// Peer connections closed after a failure or a close-communication frame
    pub peers_closed: u64,
    pub errors_by_category: HashMap<String, u64>,
    pub avg_write_latency_ns: u64,
    pub p99_write_latency_ns: u64,
    pub last_activity: Option<Instant>,
}

impl CommunicationMetrics {
    /// Time since the last send or receive
    pub fn idle_for(&self) -> Option<Duration> {
        self.last_activity.map(|at| at.elapsed())
    }
}

/// Lock-light counters, cheap to clone and share between threads
#[derive(Clone, Default)]
pub struct MetricsTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Default)]
struct TrackerInner {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    errors: AtomicU64,
    peers_closed: AtomicU64,
    error_types: RwLock<HashMap<String, u64>>,
    latency: RwLock<LatencyWindow>,
    last_activity: RwLock<Option<Instant>>,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one frame written to one peer
    #[inline]
    pub fn record_send(&self, bytes: usize, latency: Duration) {
        self.inner.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes_sent
            .fetch_add(bytes as u64, Ordering::Relaxed);

        // Skip the sample rather than stall a writer on a contended window.
        if let Some(mut window) = self.inner.latency.try_write() {
            window.record(latency.as_nanos() as u64);
        }
        *self.inner.last_activity.write() = Some(Instant::now());
    }

    /// Record one frame read from a peer
    #[inline]
    pub fn record_receive(&self, bytes: usize) {
        self.inner.messages_received.fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
        *self.inner.last_activity.write() = Some(Instant::now());
    }

    /// Record an error under its category
    pub fn record_error(&self, category: &str) {
        self.inner.errors.fetch_add(1, Ordering::Relaxed);
        *self
            .inner
            .error_types
            .write()
            .entry(category.to_string())
            .or_insert(0) += 1;
    }

    pub fn record_peer_closed(&self) {
        self.inner.peers_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CommunicationMetrics {
        let latency = self.inner.latency.read();

        CommunicationMetrics {
            messages_sent: self.inner.messages_sent.load(Ordering::Relaxed),
            messages_received: self.inner.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.inner.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.inner.bytes_received.load(Ordering::Relaxed),
            errors: self.inner.errors.load(Ordering::Relaxed),
            peers_closed: self.inner.peers_closed.load(Ordering::Relaxed),
            errors_by_category: self.inner.error_types.read().clone(),
            avg_write_latency_ns: latency.average(),
            p99_write_latency_ns: latency.percentile(99),
            last_activity: *self.inner.last_activity.read(),
        }
    }
}

/// Circular buffer of recent latency samples
#[derive(Default)]
struct LatencyWindow {
    samples: Vec<u64>,
    position: usize,
    total_samples: u64,
    sum: u64,
}

impl LatencyWindow {
    const SAMPLE_SIZE: usize = 1000;

    fn record(&mut self, latency_ns: u64) {
        self.sum = self.sum.saturating_add(latency_ns);
        self.total_samples += 1;

        if self.samples.len() < Self::SAMPLE_SIZE {
            self.samples.push(latency_ns);
        } else {
            self.samples[self.position] = latency_ns;
            self.position = (self.position + 1) % Self::SAMPLE_SIZE;
        }
    }

    fn average(&self) -> u64 {
        if self.total_samples > 0 {
            self.sum / self.total_samples
        } else {
            0
        }
    }

    fn percentile(&self, p: usize) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }

        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        let index = ((sorted.len() - 1) * p) / 100;
        sorted[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = MetricsTracker::new();
        metrics.record_send(100, Duration::from_micros(5));
        metrics.record_send(50, Duration::from_micros(15));
        metrics.record_receive(30);
        metrics.record_error("connection");
        metrics.record_error("connection");
        metrics.record_error("protocol");
        metrics.record_peer_closed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_sent, 2);
        assert_eq!(snapshot.bytes_sent, 150);
        assert_eq!(snapshot.messages_received, 1);
        assert_eq!(snapshot.bytes_received, 30);
        assert_eq!(snapshot.errors, 3);
        assert_eq!(snapshot.peers_closed, 1);
        assert_eq!(snapshot.errors_by_category.get("connection"), Some(&2));
        assert_eq!(snapshot.avg_write_latency_ns, 10_000);
        assert_eq!(snapshot.p99_write_latency_ns, 5_000);
        assert!(snapshot.idle_for().is_some());
    }

    #[test]
    fn test_clones_share_counters() {
        let metrics = MetricsTracker::new();
        let clone = metrics.clone();
        clone.record_receive(8);
        assert_eq!(metrics.snapshot().messages_received, 1);
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = MetricsTracker::new().snapshot();
        assert_eq!(snapshot.p99_write_latency_ns, 0);
        assert!(snapshot.last_activity.is_none());
    }
}

//! Lightweight Prometheus-compatible metrics for a session.
//!
//! Uses atomic counters so the coordinator and discovery threads can record
//! without locking. `render()` produces Prometheus text exposition format.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters shared by every component of one session.
pub struct Metrics {
    /// Outbound connections initiated by the tie-break rule (counter)
    pub connections_initiated_total: AtomicU64,
    /// Inbound connections accepted (counter)
    pub connections_accepted_total: AtomicU64,
    /// Inbound connections dropped as duplicates (counter)
    pub connections_deduplicated_total: AtomicU64,
    /// Connections cancelled by the connect or dead-peer timeout (counter)
    pub connections_pruned_total: AtomicU64,
    /// Secure-channel handshakes that failed (counter)
    pub handshake_failures_total: AtomicU64,
    /// Connections cancelled for malformed frames (counter)
    pub protocol_violations_total: AtomicU64,
    /// Frames written to ready connections (counter)
    pub frames_sent_total: AtomicU64,
    /// Frames decoded from ready connections (counter)
    pub frames_received_total: AtomicU64,
    /// Browse or listener restarts after failure (counter)
    pub discovery_restarts_total: AtomicU64,
    /// Session start time (for uptime calculation)
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_initiated_total: AtomicU64::new(0),
            connections_accepted_total: AtomicU64::new(0),
            connections_deduplicated_total: AtomicU64::new(0),
            connections_pruned_total: AtomicU64::new(0),
            handshake_failures_total: AtomicU64::new(0),
            protocol_violations_total: AtomicU64::new(0),
            frames_sent_total: AtomicU64::new(0),
            frames_received_total: AtomicU64::new(0),
            discovery_restarts_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let counters: [(&str, &str, &AtomicU64); 9] = [
            (
                "peershare_connections_initiated_total",
                "Outbound connections initiated",
                &self.connections_initiated_total,
            ),
            (
                "peershare_connections_accepted_total",
                "Inbound connections accepted",
                &self.connections_accepted_total,
            ),
            (
                "peershare_connections_deduplicated_total",
                "Inbound connections dropped as duplicates",
                &self.connections_deduplicated_total,
            ),
            (
                "peershare_connections_pruned_total",
                "Connections cancelled by timeout",
                &self.connections_pruned_total,
            ),
            (
                "peershare_handshake_failures_total",
                "Secure channel handshakes that failed",
                &self.handshake_failures_total,
            ),
            (
                "peershare_protocol_violations_total",
                "Connections cancelled for malformed frames",
                &self.protocol_violations_total,
            ),
            (
                "peershare_frames_sent_total",
                "Frames written to ready connections",
                &self.frames_sent_total,
            ),
            (
                "peershare_frames_received_total",
                "Frames decoded from ready connections",
                &self.frames_received_total,
            ),
            (
                "peershare_discovery_restarts_total",
                "Browse or listener restarts after failure",
                &self.discovery_restarts_total,
            ),
        ];

        let mut out = String::new();
        for (name, help, value) in counters {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {}\n",
                value.load(Ordering::Relaxed)
            ));
        }
        out.push_str(&format!(
            "# HELP peershare_uptime_seconds Session uptime in seconds\n\
             # TYPE peershare_uptime_seconds gauge\n\
             peershare_uptime_seconds {}\n",
            self.start_time.elapsed().as_secs()
        ));
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_default_zero() {
        let m = Metrics::new();
        assert_eq!(m.connections_initiated_total.load(Ordering::Relaxed), 0);
        assert_eq!(m.frames_sent_total.load(Ordering::Relaxed), 0);
        assert!(m.render().contains("peershare_handshake_failures_total 0"));
    }

    #[test]
    fn test_metrics_counter_increments() {
        let m = Metrics::new();
        Metrics::incr(&m.connections_pruned_total);
        Metrics::incr(&m.connections_pruned_total);
        m.frames_received_total.fetch_add(7, Ordering::Relaxed);

        let output = m.render();
        assert!(output.contains("peershare_connections_pruned_total 2"));
        assert!(output.contains("peershare_frames_received_total 7"));
    }

    #[test]
    fn test_metrics_render_prometheus_format() {
        let output = Metrics::new().render();
        assert!(output.contains("# HELP peershare_connections_accepted_total"));
        assert!(output.contains("# TYPE peershare_connections_accepted_total counter"));
        assert!(output.contains("# TYPE peershare_uptime_seconds gauge"));
        assert!(output
            .lines()
            .any(|l| l.starts_with("peershare_uptime_seconds ")));
    }
}

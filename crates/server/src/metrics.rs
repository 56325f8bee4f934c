use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    connections_active: AtomicU64,
    frames_ingress: AtomicU64,
    frames_egress: AtomicU64,
    calls_initiated: AtomicU64,
    calls_answered: AtomicU64,
    calls_connected: AtomicU64,
    calls_ended: AtomicU64,
    calls_timed_out: AtomicU64,
    calls_failed: AtomicU64,
    signals_relayed: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_connections(&self) {
        self.connections_active.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decr_connections(&self) {
        self.connections_active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn mark_ingress(&self) {
        self.frames_ingress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_egress(&self) {
        self.frames_egress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_call_initiated(&self) {
        self.calls_initiated.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_call_answered(&self) {
        self.calls_answered.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_call_connected(&self) {
        self.calls_connected.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_call_ended(&self) {
        self.calls_ended.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_call_timed_out(&self) {
        self.calls_timed_out.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_call_failed(&self) {
        self.calls_failed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_signal_relayed(&self) {
        self.signals_relayed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot_json(&self) -> Value {
        json!({
            "connections_active": self.connections_active.load(Ordering::SeqCst),
            "frames_ingress": self.frames_ingress.load(Ordering::SeqCst),
            "frames_egress": self.frames_egress.load(Ordering::SeqCst),
            "calls_initiated": self.calls_initiated.load(Ordering::SeqCst),
            "calls_answered": self.calls_answered.load(Ordering::SeqCst),
            "calls_connected": self.calls_connected.load(Ordering::SeqCst),
            "calls_ended": self.calls_ended.load(Ordering::SeqCst),
            "calls_timed_out": self.calls_timed_out.load(Ordering::SeqCst),
            "calls_failed": self.calls_failed.load(Ordering::SeqCst),
            "signals_relayed": self.signals_relayed.load(Ordering::SeqCst),
        })
    }

    pub fn encode_prometheus(&self) -> String {
        format!(
            "# TYPE catline_connections_active gauge\ncatline_connections_active {}\n\
             # TYPE catline_frames_ingress counter\ncatline_frames_ingress {}\n\
             # TYPE catline_frames_egress counter\ncatline_frames_egress {}\n\
             # TYPE catline_calls_initiated counter\ncatline_calls_initiated {}\n\
             # TYPE catline_calls_answered counter\ncatline_calls_answered {}\n\
             # TYPE catline_calls_connected counter\ncatline_calls_connected {}\n\
             # TYPE catline_calls_ended counter\ncatline_calls_ended {}\n\
             # TYPE catline_calls_timed_out counter\ncatline_calls_timed_out {}\n\
             # TYPE catline_calls_failed counter\ncatline_calls_failed {}\n\
             # TYPE catline_signals_relayed counter\ncatline_signals_relayed {}\n",
            self.connections_active.load(Ordering::SeqCst),
            self.frames_ingress.load(Ordering::SeqCst),
            self.frames_egress.load(Ordering::SeqCst),
            self.calls_initiated.load(Ordering::SeqCst),
            self.calls_answered.load(Ordering::SeqCst),
            self.calls_connected.load(Ordering::SeqCst),
            self.calls_ended.load(Ordering::SeqCst),
            self.calls_timed_out.load(Ordering::SeqCst),
            self.calls_failed.load(Ordering::SeqCst),
            self.signals_relayed.load(Ordering::SeqCst),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prometheus_encoding_contains_counters() {
        let metrics = Metrics::new();
        metrics.mark_call_initiated();
        metrics.mark_call_timed_out();
        let encoded = metrics.encode_prometheus();
        assert!(encoded.contains("catline_calls_initiated 1"));
        assert!(encoded.contains("catline_calls_timed_out 1"));
        assert!(encoded.contains("catline_connections_active 0"));
    }
}

// Process-global counters for the sync engine.
//
// Installed once at startup; recording is a no-op until then, so unit
// tests that never install metrics pay nothing.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
};

pub struct SyncMetrics {
    ws_rate_total: Mutex<HashMap<String, u64>>,
    ws_errors_total: Mutex<HashMap<String, u64>>,
    ws_duration_count: Mutex<HashMap<String, u64>>,
    ws_duration_sum_ms: Mutex<HashMap<String, u64>>,
    broadcast_events_total: AtomicU64,
    broadcast_recipients_total: AtomicU64,
}

static GLOBAL_METRICS: OnceLock<Arc<SyncMetrics>> = OnceLock::new();

impl Default for SyncMetrics {
    fn default() -> Self {
        Self {
            ws_rate_total: Mutex::new(HashMap::new()),
            ws_errors_total: Mutex::new(HashMap::new()),
            ws_duration_count: Mutex::new(HashMap::new()),
            ws_duration_sum_ms: Mutex::new(HashMap::new()),
            broadcast_events_total: AtomicU64::new(0),
            broadcast_recipients_total: AtomicU64::new(0),
        }
    }
}

pub fn set_global_metrics(metrics: Arc<SyncMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

fn global_metrics() -> Option<&'static Arc<SyncMetrics>> {
    GLOBAL_METRICS.get()
}

/// Record one handled inbound event (`join`, `play`, `message`, ...).
pub fn record_ws_request(event: &str, is_error: bool, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_ws_request(event, is_error, latency_ms);
    }
}

/// Record one fan-out and how many sessions it reached.
pub fn observe_broadcast(recipients: usize) {
    if let Some(metrics) = global_metrics() {
        metrics.observe_broadcast(recipients);
    }
}

impl SyncMetrics {
    pub fn record_ws_request(&self, event: &str, is_error: bool, latency_ms: u64) {
        increment(&self.ws_rate_total, event);
        if is_error {
            increment(&self.ws_errors_total, event);
        }
        increment(&self.ws_duration_count, event);
        add(&self.ws_duration_sum_ms, event, latency_ms);
    }

    pub fn observe_broadcast(&self, recipients: usize) {
        self.broadcast_events_total.fetch_add(1, Ordering::Relaxed);
        self.broadcast_recipients_total.fetch_add(recipients as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            ws_rate_total: clone_map(&self.ws_rate_total),
            ws_errors_total: clone_map(&self.ws_errors_total),
            ws_duration_sum_ms: clone_map(&self.ws_duration_sum_ms),
            broadcast_events_total: self.broadcast_events_total.load(Ordering::Relaxed),
            broadcast_recipients_total: self.broadcast_recipients_total.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub ws_rate_total: HashMap<String, u64>,
    pub ws_errors_total: HashMap<String, u64>,
    pub ws_duration_sum_ms: HashMap<String, u64>,
    pub broadcast_events_total: u64,
    pub broadcast_recipients_total: u64,
}

fn increment(map: &Mutex<HashMap<String, u64>>, key: &str) {
    add(map, key, 1);
}

fn add(map: &Mutex<HashMap<String, u64>>, key: &str, value: u64) {
    let mut guard = map.lock().expect("metrics mutex should not be poisoned");
    *guard.entry(key.to_string()).or_insert(0) += value;
}

fn clone_map(map: &Mutex<HashMap<String, u64>>) -> HashMap<String, u64> {
    map.lock().expect("metrics mutex should not be poisoned").clone()
}

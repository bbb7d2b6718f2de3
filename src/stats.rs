//! Stats counters and the JSON stats payload shared by the `stats` control
//! reply and the periodic passthrough-mode log line.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// One of the four counter blocks in the stats payload: a running count, an
/// approximate memory footprint, and a lifetime-generated total.
#[derive(Default, Serialize)]
pub struct CounterBlock {
    pub count: u64,
    pub memory: u64,
    pub generated: u64,
}

/// Atomic backing for a `CounterBlock`. `count` tracks the live/current
/// value; `generated` only ever increases.
#[derive(Default)]
pub struct Counter {
    count: AtomicU64,
    memory: AtomicU64,
    generated: AtomicU64,
}

impl Counter {
    pub fn record_created(&self, size: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.memory.fetch_add(size, Ordering::Relaxed);
        self.generated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_destroyed(&self, size: u64) {
        self.count.fetch_sub(1, Ordering::Relaxed);
        self.memory.fetch_sub(size, Ordering::Relaxed);
    }

    pub fn set_count(&self, value: u64) {
        self.count.store(value, Ordering::Relaxed);
    }

    pub fn set_generated(&self, value: u64) {
        self.generated.store(value, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterBlock {
        CounterBlock {
            count: self.count.load(Ordering::Relaxed),
            memory: self.memory.load(Ordering::Relaxed),
            generated: self.generated.load(Ordering::Relaxed),
        }
    }
}

/// The JSON payload shape in the stats table: four named blocks, plus an
/// optional `runtime` field present only in the periodic passthrough log.
#[derive(Serialize)]
pub struct StatsPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<u64>,
    pub clients: CounterBlock,
    pub dead: CounterBlock,
    pub sends: CounterBlock,
    pub delays: CounterBlock,
}

impl StatsPayload {
    pub fn to_line(&self) -> String {
        let mut s = serde_json::to_string(self).expect("StatsPayload always serializes");
        s.push('\n');
        s
    }
}

/// Every counter block this process tracks, collected in one place so
/// `stats` and the periodic log line read from the same source of truth.
#[derive(Default)]
pub struct Stats {
    pub clients: Counter,
    pub dead: Counter,
    pub sends: Counter,
    pub delays: Counter,
}

impl Stats {
    pub fn payload(&self, runtime_secs: Option<u64>) -> StatsPayload {
        StatsPayload {
            runtime: runtime_secs,
            clients: self.clients.snapshot(),
            dead: self.dead.snapshot(),
            sends: self.sends.snapshot(),
            delays: self.delays.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_create_destroy_tracks_count_and_memory() {
        let c = Counter::default();
        c.record_created(128);
        c.record_created(64);
        let snap = c.snapshot();
        assert_eq!(snap.count, 2);
        assert_eq!(snap.memory, 192);
        assert_eq!(snap.generated, 2);

        c.record_destroyed(64);
        let snap = c.snapshot();
        assert_eq!(snap.count, 1);
        assert_eq!(snap.memory, 128);
        assert_eq!(snap.generated, 2, "generated never decreases");
    }

    #[test]
    fn test_stats_payload_omits_runtime_when_none() {
        let stats = Stats::default();
        let line = stats.payload(None).to_line();
        assert!(!line.contains("runtime"));
    }

    #[test]
    fn test_stats_payload_includes_runtime_when_some() {
        let stats = Stats::default();
        let line = stats.payload(Some(60)).to_line();
        assert!(line.contains("\"runtime\":60"));
    }
}

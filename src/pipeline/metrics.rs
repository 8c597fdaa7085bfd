use serde::Serialize;
use statrs::statistics::{Data, OrderStatistics};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Latency reservoir size per stage. Old samples roll off so percentiles
/// track recent behavior.
const LATENCY_SAMPLE_CAP: usize = 1024;

/// Per-stage lifecycle. States only move forward; `Failed` is sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Pending = 0,
    Running = 1,
    Draining = 2,
    Closed = 3,
    Failed = 4,
}

impl StageState {
    fn from_u8(raw: u8) -> StageState {
        match raw {
            0 => StageState::Pending,
            1 => StageState::Running,
            2 => StageState::Draining,
            3 => StageState::Closed,
            _ => StageState::Failed,
        }
    }
}

/// Live counters for one stage. Cheap atomics so sampling never blocks
/// stage work.
#[derive(Debug)]
pub struct StageMetrics {
    name: String,
    items_in: AtomicU64,
    items_out: AtomicU64,
    items_errored: AtomicU64,
    items_retried: AtomicU64,
    state: AtomicU8,
    started_at: Instant,
    latencies: Mutex<VecDeque<f64>>,
}

impl StageMetrics {
    pub fn new(name: impl Into<String>, started_at: Instant) -> Self {
        Self {
            name: name.into(),
            items_in: AtomicU64::new(0),
            items_out: AtomicU64::new(0),
            items_errored: AtomicU64::new(0),
            items_retried: AtomicU64::new(0),
            state: AtomicU8::new(StageState::Pending as u8),
            started_at,
            latencies: Mutex::new(VecDeque::with_capacity(LATENCY_SAMPLE_CAP)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn record_in(&self, count: u64) {
        self.items_in.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_out(&self, count: u64) {
        self.items_out.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_errored(&self, count: u64) {
        self.items_errored.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_retried(&self, count: u64) {
        self.items_retried.fetch_add(count, Ordering::Relaxed);
    }

    pub fn observe_latency(&self, elapsed: Duration) {
        if let Ok(mut samples) = self.latencies.lock() {
            if samples.len() == LATENCY_SAMPLE_CAP {
                samples.pop_front();
            }
            samples.push_back(elapsed.as_secs_f64());
        }
    }

    /// Move the state machine forward. Backward transitions are ignored,
    /// which also makes `Failed` terminal.
    pub fn advance_state(&self, state: StageState) {
        self.state.fetch_max(state as u8, Ordering::Relaxed);
    }

    pub fn state(&self) -> StageState {
        StageState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn items_in(&self) -> u64 {
        self.items_in.load(Ordering::Relaxed)
    }

    pub fn items_out(&self) -> u64 {
        self.items_out.load(Ordering::Relaxed)
    }

    pub fn items_errored(&self) -> u64 {
        self.items_errored.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, queue_depth: Option<u64>, queue_capacity: usize) -> StageMetricsSnapshot {
        let items_in = self.items_in.load(Ordering::Relaxed);
        let items_out = self.items_out.load(Ordering::Relaxed);
        let items_errored = self.items_errored.load(Ordering::Relaxed);
        let items_retried = self.items_retried.load(Ordering::Relaxed);

        let error_rate = if items_in > 0 {
            Some(items_errored as f64 / items_in as f64)
        } else {
            None
        };

        let elapsed = self.started_at.elapsed().as_secs_f64();
        let throughput_per_sec = if elapsed > 0.0 {
            Some(items_out as f64 / elapsed)
        } else {
            None
        };

        let samples: Vec<f64> = self
            .latencies
            .lock()
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        let (latency_p50, latency_p95, latency_p99) = if samples.is_empty() {
            (None, None, None)
        } else {
            let mut data = Data::new(samples);
            (
                Some(data.percentile(50)),
                Some(data.percentile(95)),
                Some(data.percentile(99)),
            )
        };

        let queue_utilization = match queue_depth {
            Some(depth) if queue_capacity > 0 => Some(depth as f64 / queue_capacity as f64),
            _ => None,
        };

        StageMetricsSnapshot {
            stage: self.name.clone(),
            state: self.state(),
            items_in,
            items_out,
            items_errored,
            items_retried,
            error_rate,
            throughput_per_sec,
            latency_p50,
            latency_p95,
            latency_p99,
            queue_depth,
            queue_utilization,
        }
    }
}

/// One periodic sample of a stage's counters and queue stats. Plain data;
/// the metrics observer and `pipeline_metrics` table both consume it.
#[derive(Debug, Clone, Serialize)]
pub struct StageMetricsSnapshot {
    pub stage: String,
    pub state: StageState,
    pub items_in: u64,
    pub items_out: u64,
    pub items_errored: u64,
    pub items_retried: u64,
    pub error_rate: Option<f64>,
    pub throughput_per_sec: Option<f64>,
    pub latency_p50: Option<f64>,
    pub latency_p95: Option<f64>,
    pub latency_p99: Option<f64>,
    pub queue_depth: Option<u64>,
    pub queue_utilization: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_only_advances() {
        let metrics = StageMetrics::new("validate", Instant::now());
        assert_eq!(metrics.state(), StageState::Pending);
        metrics.advance_state(StageState::Running);
        metrics.advance_state(StageState::Pending);
        assert_eq!(metrics.state(), StageState::Running);
        metrics.advance_state(StageState::Failed);
        metrics.advance_state(StageState::Closed);
        assert_eq!(metrics.state(), StageState::Failed);
    }

    #[test]
    fn snapshot_derives_rates() {
        let metrics = StageMetrics::new("persist", Instant::now());
        metrics.record_in(10);
        metrics.record_out(8);
        metrics.record_errored(2);
        for _ in 0..8 {
            metrics.observe_latency(Duration::from_millis(10));
        }

        let snap = metrics.snapshot(Some(4), 16);
        assert_eq!(snap.items_in, 10);
        assert_eq!(snap.items_out, 8);
        assert_eq!(snap.error_rate, Some(0.2));
        assert_eq!(snap.queue_utilization, Some(0.25));
        let p50 = snap.latency_p50.unwrap();
        assert!((p50 - 0.010).abs() < 1e-6);
    }

    #[test]
    fn empty_stage_has_no_rates() {
        let metrics = StageMetrics::new("idle", Instant::now());
        let snap = metrics.snapshot(None, 16);
        assert!(snap.error_rate.is_none());
        assert!(snap.latency_p50.is_none());
        assert!(snap.queue_utilization.is_none());
    }
}

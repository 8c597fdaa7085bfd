use crate::error::GridError;

use super::metrics::StageMetricsSnapshot;

/// An item whose processing failed with a registered error kind after all
/// retries. Retained for inspection, never reprocessed.
#[derive(Debug, Clone)]
pub struct FailedItem<T> {
    pub item: T,
    pub stage_name: String,
    pub error: GridError,
    pub attempts: u32,
}

/// Outcome of one pipeline run: final per-stage metrics, dead letters, and
/// whether the run drained cleanly.
#[derive(Debug, Clone)]
pub struct PipelineResult<T> {
    pub pipeline_name: String,
    pub completed: bool,
    pub duration_seconds: f64,
    pub stage_metrics: Vec<StageMetricsSnapshot>,
    pub dead_letter_count: usize,
    /// Bounded sample of the dead-letter buffer.
    pub dead_letter_items: Vec<FailedItem<T>>,
    pub topology: String,
    /// Set when an unregistered error terminated the run.
    pub failure: Option<GridError>,
}

impl<T> PipelineResult<T> {
    pub fn summary(&self) -> String {
        let mut lines = vec![format!(
            "pipeline '{}' {} in {:.1}s",
            self.pipeline_name,
            if self.completed {
                "completed"
            } else {
                "did not complete"
            },
            self.duration_seconds
        )];
        for sm in &self.stage_metrics {
            let p50 = sm
                .latency_p50
                .map(|v| format!("{:.1}ms", v * 1000.0))
                .unwrap_or_else(|| "n/a".to_string());
            lines.push(format!(
                "  {}: {}/{} ok, {} errors, {} retries, p50={}",
                sm.stage, sm.items_out, sm.items_in, sm.items_errored, sm.items_retried, p50
            ));
        }
        lines.push(format!("  dead letters: {}", self.dead_letter_count));
        if let Some(failure) = &self.failure {
            lines.push(format!("  failure: {failure}"));
        }
        lines.join("\n")
    }
}

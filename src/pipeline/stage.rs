use std::time::Duration;

/// Declared options for one pipeline stage.
///
/// `concurrency` workers share the stage's input channel; with more than
/// one worker, output order is not guaranteed. `retries` only applies to
/// errors whose kind is registered with the pipeline's error router.
/// `batch_size` and `flush_timeout` only matter for batch stages.
#[derive(Debug, Clone)]
pub struct StageConfig {
    pub concurrency: usize,
    pub retries: u32,
    pub retry_base_delay: Duration,
    pub batch_size: usize,
    pub flush_timeout: Duration,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            retries: 0,
            retry_base_delay: Duration::ZERO,
            batch_size: 1,
            flush_timeout: Duration::from_secs(5),
        }
    }
}

impl StageConfig {
    pub fn concurrency(mut self, workers: usize) -> Self {
        self.concurrency = workers.max(1);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    pub fn batch(mut self, batch_size: usize, flush_timeout: Duration) -> Self {
        self.batch_size = batch_size.max(1);
        self.flush_timeout = flush_timeout;
        self
    }
}

//! Staged-pipeline runtime.
//!
//! A pipeline is a single source feeding a linear sequence of named stages
//! over bounded mpsc channels. Each stage runs `concurrency` worker tasks;
//! backpressure is the natural consequence of the bounded channels, so the
//! slowest stage rate-limits the source.
//!
//! Failure handling is typed: error kinds registered with the builder are
//! retried per the stage's retry policy and, once exhausted, captured as
//! dead letters (and handed to a registered handler). An error of an
//! unregistered kind terminates the whole run.
//!
//! Shutdown is cooperative. Cancelling the pipeline's token (or the source
//! finishing) stops production; in-flight items drain through the stages
//! until the drain timeout fires.

mod metrics;
mod result;
mod stage;


pub use metrics::{StageMetrics, StageMetricsSnapshot, StageState};
pub use result::{FailedItem, PipelineResult};
pub use stage::StageConfig;

use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorKind, GridError};

pub type StageFn<T> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<T, GridError>> + Send + Sync>;
pub type BatchStageFn<T> =
    Arc<dyn Fn(Vec<T>) -> BoxFuture<'static, Result<Vec<T>, GridError>> + Send + Sync>;
pub type ErrorHandler<T> = Arc<dyn Fn(FailedItem<T>) -> BoxFuture<'static, ()> + Send + Sync>;
pub type MetricsObserver =
    Arc<dyn Fn(Vec<StageMetricsSnapshot>) -> BoxFuture<'static, ()> + Send + Sync>;
pub type StageHook = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;
pub type ErrorHook<T> = Arc<dyn Fn(String, T, GridError) -> BoxFuture<'static, ()> + Send + Sync>;

type SourceFn<T> = Box<dyn FnOnce(SourceCtx<T>) -> BoxFuture<'static, ()> + Send>;

/// Wrap a plain async closure as an [`ErrorHandler`].
pub fn handler_fn<T, F, Fut>(func: F) -> ErrorHandler<T>
where
    F: Fn(FailedItem<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |failed| Box::pin(func(failed)))
}

/// Wrap a plain async closure as a [`MetricsObserver`].
pub fn observer_fn<F, Fut>(func: F) -> MetricsObserver
where
    F: Fn(Vec<StageMetricsSnapshot>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |snapshots| Box::pin(func(snapshots)))
}

/// Wrap a plain async closure as a [`StageHook`].
pub fn hook_fn<F, Fut>(func: F) -> StageHook
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |stage| Box::pin(func(stage)))
}

/// Wrap a plain async closure as an [`ErrorHook`].
pub fn error_hook_fn<T, F, Fut>(func: F) -> ErrorHook<T>
where
    F: Fn(String, T, GridError) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |stage, item, error| Box::pin(func(stage, item, error)))
}

/// Optional lifecycle callbacks. Invoked inline by stage workers; they
/// return nothing, so an observer can never fail the pipeline.
pub struct LifecycleHooks<T> {
    pub on_start: Option<StageHook>,
    pub on_error: Option<ErrorHook<T>>,
    pub on_complete: Option<StageHook>,
}

impl<T> Default for LifecycleHooks<T> {
    fn default() -> Self {
        Self {
            on_start: None,
            on_error: None,
            on_complete: None,
        }
    }
}

impl<T> Clone for LifecycleHooks<T> {
    fn clone(&self) -> Self {
        Self {
            on_start: self.on_start.clone(),
            on_error: self.on_error.clone(),
            on_complete: self.on_complete.clone(),
        }
    }
}

/// Handed to the source closure: a cancellable sender into the first
/// stage's channel. `send` and `sleep` return false once the pipeline is
/// shutting down, which is the source's cue to stop producing.
pub struct SourceCtx<T> {
    tx: mpsc::Sender<T>,
    stop: CancellationToken,
}

impl<T> SourceCtx<T> {
    pub async fn send(&self, item: T) -> bool {
        tokio::select! {
            _ = self.stop.cancelled() => false,
            result = self.tx.send(item) => result.is_ok(),
        }
    }

    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.stop.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.stop.is_cancelled()
    }
}

enum StageFunc<T> {
    Item(StageFn<T>),
    Batch(BatchStageFn<T>),
}

impl<T> Clone for StageFunc<T> {
    fn clone(&self) -> Self {
        match self {
            StageFunc::Item(f) => StageFunc::Item(f.clone()),
            StageFunc::Batch(f) => StageFunc::Batch(f.clone()),
        }
    }
}

struct StageSpec<T> {
    name: String,
    config: StageConfig,
    func: StageFunc<T>,
}

struct ErrorRoute<T> {
    kind: ErrorKind,
    handler: Option<ErrorHandler<T>>,
}

struct DeadLetters<T> {
    count: usize,
    items: Vec<FailedItem<T>>,
}

pub struct PipelineBuilder<T> {
    name: String,
    channel_capacity: usize,
    drain_timeout: Duration,
    dead_letter_limit: usize,
    metrics_interval: Duration,
    source: Option<SourceFn<T>>,
    stages: Vec<StageSpec<T>>,
    routes: Vec<ErrorRoute<T>>,
    hooks: LifecycleHooks<T>,
    observer: Option<MetricsObserver>,
    shutdown: CancellationToken,
}

impl<T: Clone + Send + 'static> PipelineBuilder<T> {
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn dead_letter_limit(mut self, limit: usize) -> Self {
        self.dead_letter_limit = limit;
        self
    }

    pub fn source<F, Fut>(mut self, func: F) -> Self
    where
        F: FnOnce(SourceCtx<T>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.source = Some(Box::new(move |ctx| Box::pin(func(ctx))));
        self
    }

    pub fn stage<F, Fut>(mut self, name: impl Into<String>, config: StageConfig, func: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, GridError>> + Send + 'static,
    {
        self.stages.push(StageSpec {
            name: name.into(),
            config,
            func: StageFunc::Item(Arc::new(move |item| Box::pin(func(item)))),
        });
        self
    }

    /// A stage that accepts and returns groups of items, flushed by size
    /// or by `flush_timeout`, whichever comes first.
    pub fn batch_stage<F, Fut>(
        mut self,
        name: impl Into<String>,
        config: StageConfig,
        func: F,
    ) -> Self
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<T>, GridError>> + Send + 'static,
    {
        self.stages.push(StageSpec {
            name: name.into(),
            config,
            func: StageFunc::Batch(Arc::new(move |batch| Box::pin(func(batch)))),
        });
        self
    }

    /// Register an error kind as routable: matching failures are retried
    /// per stage policy and then dead-lettered instead of failing the run.
    pub fn on_error(mut self, kind: ErrorKind) -> Self {
        self.routes.push(ErrorRoute {
            kind,
            handler: None,
        });
        self
    }

    /// Like [`on_error`](Self::on_error), additionally invoking `handler`
    /// for every dead-lettered item.
    pub fn on_error_with(mut self, kind: ErrorKind, handler: ErrorHandler<T>) -> Self {
        self.routes.push(ErrorRoute {
            kind,
            handler: Some(handler),
        });
        self
    }

    pub fn hooks(mut self, hooks: LifecycleHooks<T>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Register a metrics observer, sampled every `metrics_interval`
    /// (default 10s).
    pub fn on_metrics(mut self, observer: MetricsObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }

    /// Use an externally owned shutdown token instead of the pipeline's
    /// private one. The runner installs its interrupt observer on this.
    pub fn shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn build(self) -> Pipeline<T> {
        let topology = {
            let stages = self
                .stages
                .iter()
                .map(|s| {
                    if s.config.retries > 0 {
                        format!("{}[c{},r{}]", s.name, s.config.concurrency, s.config.retries)
                    } else {
                        format!("{}[c{}]", s.name, s.config.concurrency)
                    }
                })
                .collect::<Vec<_>>()
                .join(" -> ");
            format!(
                "{}: source -> {} | capacity={}",
                self.name, stages, self.channel_capacity
            )
        };
        Pipeline {
            name: self.name,
            channel_capacity: self.channel_capacity,
            drain_timeout: self.drain_timeout,
            dead_letter_limit: self.dead_letter_limit,
            metrics_interval: self.metrics_interval,
            source: self.source,
            stages: self.stages,
            routes: Arc::new(self.routes),
            hooks: self.hooks,
            observer: self.observer,
            shutdown: self.shutdown,
            topology,
        }
    }
}

pub struct Pipeline<T> {
    name: String,
    channel_capacity: usize,
    drain_timeout: Duration,
    dead_letter_limit: usize,
    metrics_interval: Duration,
    source: Option<SourceFn<T>>,
    stages: Vec<StageSpec<T>>,
    routes: Arc<Vec<ErrorRoute<T>>>,
    hooks: LifecycleHooks<T>,
    observer: Option<MetricsObserver>,
    shutdown: CancellationToken,
    topology: String,
}

/// Everything a stage worker needs, shared across its `concurrency` tasks.
struct StageCtx<T> {
    name: String,
    config: StageConfig,
    metrics: Arc<StageMetrics>,
    routes: Arc<Vec<ErrorRoute<T>>>,
    hooks: LifecycleHooks<T>,
    dead_letters: Arc<std::sync::Mutex<DeadLetters<T>>>,
    dead_letter_limit: usize,
    fatal: Arc<std::sync::Mutex<Option<GridError>>>,
    /// Fatal-error token: stops everything, including draining workers.
    abort: CancellationToken,
    /// Graceful token: stops the source, lets workers drain.
    shutdown: CancellationToken,
    started: AtomicBool,
}

impl<T: Clone + Send + Sync + 'static> Pipeline<T> {
    pub fn builder(name: impl Into<String>) -> PipelineBuilder<T> {
        PipelineBuilder {
            name: name.into(),
            channel_capacity: 128,
            drain_timeout: Duration::from_secs(60),
            dead_letter_limit: 100,
            metrics_interval: Duration::from_secs(10),
            source: None,
            stages: Vec::new(),
            routes: Vec::new(),
            hooks: LifecycleHooks::default(),
            observer: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn topology(&self) -> &str {
        &self.topology
    }

    /// Cancel this to request a graceful shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(self) -> PipelineResult<T> {
        let run_started = Instant::now();
        let shutdown = self.shutdown.clone();
        let abort = CancellationToken::new();
        let fatal: Arc<std::sync::Mutex<Option<GridError>>> =
            Arc::new(std::sync::Mutex::new(None));
        let dead_letters = Arc::new(std::sync::Mutex::new(DeadLetters {
            count: 0,
            items: Vec::new(),
        }));

        // The source stops on graceful shutdown or fatal abort; workers
        // only stop early on abort so in-flight items can drain.
        let source_stop = CancellationToken::new();
        {
            let shutdown = shutdown.clone();
            let abort = abort.clone();
            let source_stop = source_stop.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = abort.cancelled() => {}
                }
                source_stop.cancel();
            });
        }

        // Wire one bounded channel in front of every stage.
        let stage_count = self.stages.len();
        let (src_tx, first_rx) = mpsc::channel::<T>(self.channel_capacity);
        let mut inputs: Vec<mpsc::Receiver<T>> = Vec::with_capacity(stage_count);
        let mut outputs: Vec<Option<mpsc::Sender<T>>> = Vec::with_capacity(stage_count);
        let mut input_weaks: Vec<mpsc::WeakSender<T>> = Vec::with_capacity(stage_count);

        if stage_count > 0 {
            input_weaks.push(src_tx.downgrade());
            inputs.push(first_rx);
            for _ in 1..stage_count {
                let (tx, rx) = mpsc::channel::<T>(self.channel_capacity);
                input_weaks.push(tx.downgrade());
                outputs.push(Some(tx));
                inputs.push(rx);
            }
            outputs.push(None);
        }

        let mut samplers: Vec<(Arc<StageMetrics>, mpsc::WeakSender<T>)> = Vec::new();
        let mut supervisors: Vec<JoinHandle<()>> = Vec::with_capacity(stage_count);

        for ((spec, rx), out) in self
            .stages
            .into_iter()
            .zip(inputs.into_iter())
            .zip(outputs.into_iter())
        {
            let metrics = Arc::new(StageMetrics::new(spec.name.clone(), run_started));
            if !input_weaks.is_empty() {
                samplers.push((metrics.clone(), input_weaks.remove(0)));
            }
            let ctx = Arc::new(StageCtx {
                name: spec.name,
                config: spec.config,
                metrics,
                routes: self.routes.clone(),
                hooks: self.hooks.clone(),
                dead_letters: dead_letters.clone(),
                dead_letter_limit: self.dead_letter_limit,
                fatal: fatal.clone(),
                abort: abort.clone(),
                shutdown: shutdown.clone(),
                started: AtomicBool::new(false),
            });
            supervisors.push(tokio::spawn(run_stage(ctx, spec.func, rx, out)));
        }

        // Launch the source; dropping its sender when the closure returns
        // is what lets the first stage drain and close.
        let source_ctx = SourceCtx {
            tx: src_tx,
            stop: source_stop.clone(),
        };
        let mut source_handle = match self.source {
            Some(source) => tokio::spawn(source(source_ctx)),
            None => tokio::spawn(async move {
                drop(source_ctx);
            }),
        };

        // Periodic metrics sampling, independent of stage work.
        let sampler_stop = CancellationToken::new();
        let sampler_handle = self.observer.clone().map(|observer| {
            let entries = samplers.clone();
            let stop = sampler_stop.clone();
            let interval = self.metrics_interval;
            let capacity = self.channel_capacity;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = ticker.tick() => {
                            observer(snapshot_stages(&entries, capacity)).await;
                        }
                    }
                }
            })
        });

        // Run until the source finishes or shutdown/abort is requested,
        // then grant in-flight items the drain timeout.
        let mut source_done = false;
        tokio::select! {
            _ = &mut source_handle => { source_done = true; }
            _ = shutdown.cancelled() => {}
            _ = abort.cancelled() => {}
        }

        let drain = async {
            if !source_done {
                let _ = source_handle.await;
            }
            for supervisor in supervisors {
                let _ = supervisor.await;
            }
        };
        let drained = tokio::time::timeout(self.drain_timeout, drain).await.is_ok();
        if !drained {
            tracing::warn!(
                pipeline = %self.name,
                timeout_secs = self.drain_timeout.as_secs_f64(),
                "drain timeout expired, abandoning in-flight items"
            );
            abort.cancel();
        }

        sampler_stop.cancel();
        if let Some(handle) = sampler_handle {
            let _ = handle.await;
        }

        let failure = fatal.lock().ok().and_then(|guard| guard.clone());
        let (dead_letter_count, dead_letter_items) = dead_letters
            .lock()
            .map(|dl| (dl.count, dl.items.clone()))
            .unwrap_or((0, Vec::new()));

        PipelineResult {
            pipeline_name: self.name,
            completed: drained && failure.is_none(),
            duration_seconds: run_started.elapsed().as_secs_f64(),
            stage_metrics: snapshot_stages(&samplers, self.channel_capacity),
            dead_letter_count,
            dead_letter_items,
            topology: self.topology,
            failure,
        }
    }
}

fn snapshot_stages<T>(
    entries: &[(Arc<StageMetrics>, mpsc::WeakSender<T>)],
    capacity: usize,
) -> Vec<StageMetricsSnapshot> {
    entries
        .iter()
        .map(|(metrics, weak)| {
            let depth = weak
                .upgrade()
                .map(|tx| (capacity - tx.capacity()) as u64);
            metrics.snapshot(depth, capacity)
        })
        .collect()
}

async fn run_stage<T: Clone + Send + Sync + 'static>(
    ctx: Arc<StageCtx<T>>,
    func: StageFunc<T>,
    rx: mpsc::Receiver<T>,
    out: Option<mpsc::Sender<T>>,
) {
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    let mut workers = Vec::with_capacity(ctx.config.concurrency);
    for _ in 0..ctx.config.concurrency {
        let ctx = ctx.clone();
        let func = func.clone();
        let rx = rx.clone();
        let out = out.clone();
        workers.push(tokio::spawn(async move {
            match func {
                StageFunc::Item(func) => item_worker(ctx, func, rx, out).await,
                StageFunc::Batch(func) => batch_worker(ctx, func, rx, out).await,
            }
        }));
    }
    drop(out);

    for worker in workers {
        let _ = worker.await;
    }
    ctx.metrics.advance_state(StageState::Closed);
    if let Some(hook) = &ctx.hooks.on_complete {
        hook(ctx.name.clone()).await;
    }
}

async fn mark_started<T>(ctx: &StageCtx<T>) {
    if !ctx.started.swap(true, Ordering::SeqCst) {
        ctx.metrics.advance_state(StageState::Running);
        if let Some(hook) = &ctx.hooks.on_start {
            hook(ctx.name.clone()).await;
        }
    }
}

async fn item_worker<T: Clone + Send + 'static>(
    ctx: Arc<StageCtx<T>>,
    func: StageFn<T>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<T>>>,
    out: Option<mpsc::Sender<T>>,
) {
    mark_started(&ctx).await;
    loop {
        let item = {
            let mut rx = rx.lock().await;
            let item = tokio::select! {
                _ = ctx.abort.cancelled() => None,
                item = rx.recv() => item,
            };
            if item.is_some() && rx.is_closed() {
                ctx.metrics.advance_state(StageState::Draining);
            }
            item
        };
        let Some(item) = item else { break };
        ctx.metrics.record_in(1);
        process_item(&ctx, &func, item, out.as_ref()).await;
        if ctx.abort.is_cancelled() {
            break;
        }
    }
}

async fn process_item<T: Clone + Send + 'static>(
    ctx: &StageCtx<T>,
    func: &StageFn<T>,
    item: T,
    out: Option<&mpsc::Sender<T>>,
) {
    let mut attempts: u32 = 0;
    loop {
        attempts += 1;
        let invoke_started = Instant::now();
        match func(item.clone()).await {
            Ok(output) => {
                ctx.metrics.observe_latency(invoke_started.elapsed());
                forward(ctx, out, output).await;
                ctx.metrics.record_out(1);
                return;
            }
            Err(error) => {
                if let Some(hook) = &ctx.hooks.on_error {
                    hook(ctx.name.clone(), item.clone(), error.clone()).await;
                }
                if should_retry(ctx, &error, attempts) {
                    ctx.metrics.record_retried(1);
                    retry_delay(ctx, attempts).await;
                    continue;
                }
                ctx.metrics.record_errored(1);
                dispose_failure(ctx, item, error, attempts).await;
                return;
            }
        }
    }
}

async fn batch_worker<T: Clone + Send + 'static>(
    ctx: Arc<StageCtx<T>>,
    func: BatchStageFn<T>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<T>>>,
    out: Option<mpsc::Sender<T>>,
) {
    mark_started(&ctx).await;
    loop {
        let (batch, closed) = collect_batch(&ctx, &rx).await;
        if !batch.is_empty() {
            ctx.metrics.record_in(batch.len() as u64);
            process_batch(&ctx, &func, batch, out.as_ref()).await;
        }
        if closed || ctx.abort.is_cancelled() {
            break;
        }
    }
}

/// Pull up to `batch_size` items, giving up after `flush_timeout` from the
/// first item. Returns the (possibly partial) batch and whether the input
/// channel is exhausted.
async fn collect_batch<T>(
    ctx: &StageCtx<T>,
    rx: &tokio::sync::Mutex<mpsc::Receiver<T>>,
) -> (Vec<T>, bool) {
    let mut rx = rx.lock().await;
    let mut batch = Vec::with_capacity(ctx.config.batch_size);

    tokio::select! {
        _ = ctx.abort.cancelled() => return (batch, true),
        first = rx.recv() => match first {
            Some(item) => batch.push(item),
            None => return (batch, true),
        }
    }

    let deadline = Instant::now() + ctx.config.flush_timeout;
    while batch.len() < ctx.config.batch_size {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        tokio::select! {
            _ = ctx.abort.cancelled() => return (batch, true),
            _ = tokio::time::sleep(remaining) => break,
            item = rx.recv() => match item {
                Some(item) => batch.push(item),
                None => return (batch, true),
            }
        }
    }
    (batch, false)
}

async fn process_batch<T: Clone + Send + 'static>(
    ctx: &StageCtx<T>,
    func: &BatchStageFn<T>,
    batch: Vec<T>,
    out: Option<&mpsc::Sender<T>>,
) {
    let size = batch.len() as u64;
    let mut attempts: u32 = 0;
    loop {
        attempts += 1;
        let invoke_started = Instant::now();
        match func(batch.clone()).await {
            Ok(outputs) => {
                ctx.metrics.observe_latency(invoke_started.elapsed());
                let count = outputs.len() as u64;
                for output in outputs {
                    forward(ctx, out, output).await;
                }
                ctx.metrics.record_out(count);
                return;
            }
            Err(error) => {
                if let Some(hook) = &ctx.hooks.on_error {
                    for item in &batch {
                        hook(ctx.name.clone(), item.clone(), error.clone()).await;
                    }
                }
                if should_retry(ctx, &error, attempts) {
                    ctx.metrics.record_retried(size);
                    retry_delay(ctx, attempts).await;
                    continue;
                }
                ctx.metrics.record_errored(size);
                for item in batch {
                    dispose_failure(ctx, item, error.clone(), attempts).await;
                }
                return;
            }
        }
    }
}

async fn forward<T>(ctx: &StageCtx<T>, out: Option<&mpsc::Sender<T>>, output: T) {
    if let Some(tx) = out {
        tokio::select! {
            _ = ctx.abort.cancelled() => {}
            result = tx.send(output) => {
                if result.is_err() {
                    tracing::debug!(stage = %ctx.name, "downstream channel closed, dropping output");
                }
            }
        }
    }
}

/// Retry only errors whose kind is registered; anything else is fatal and
/// retrying it would just repeat the failure.
fn should_retry<T>(ctx: &StageCtx<T>, error: &GridError, attempts: u32) -> bool {
    attempts <= ctx.config.retries && ctx.routes.iter().any(|r| r.kind.matches(error))
}

async fn retry_delay<T>(ctx: &StageCtx<T>, attempts: u32) {
    let delay = ctx.config.retry_base_delay * 2u32.saturating_pow(attempts - 1);
    if delay.is_zero() {
        return;
    }
    // Shutdown shortens the wait; the retry itself still runs.
    tokio::select! {
        _ = ctx.abort.cancelled() => {}
        _ = ctx.shutdown.cancelled() => {}
        _ = tokio::time::sleep(delay) => {}
    }
}

async fn dispose_failure<T: Clone + Send + 'static>(
    ctx: &StageCtx<T>,
    item: T,
    error: GridError,
    attempts: u32,
) {
    let route = ctx.routes.iter().find(|r| r.kind.matches(&error));
    match route {
        Some(route) => {
            let failed = FailedItem {
                item,
                stage_name: ctx.name.clone(),
                error,
                attempts,
            };
            if let Ok(mut dl) = ctx.dead_letters.lock() {
                dl.count += 1;
                if dl.items.len() < ctx.dead_letter_limit {
                    dl.items.push(failed.clone());
                }
            }
            tracing::debug!(
                stage = %ctx.name,
                error = %failed.error,
                attempts,
                "item dead-lettered"
            );
            if let Some(handler) = &route.handler {
                handler(failed).await;
            }
        }
        None => {
            tracing::error!(stage = %ctx.name, error = %error, "fatal pipeline error");
            if let Ok(mut fatal) = ctx.fatal.lock() {
                if fatal.is_none() {
                    *fatal = Some(error);
                }
            }
            ctx.metrics.advance_state(StageState::Failed);
            ctx.abort.cancel();
        }
    }
}

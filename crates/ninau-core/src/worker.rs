//! Claim-loop worker: bounded-concurrency execution against the shared
//! store.
//!
//! The loop is a pool, not a chain: a tick stream wakes it, a
//! `FuturesUnordered` holds the in-flight claim-and-execute tasks, and the
//! concurrency cap gates how many claims may be outstanding. Every wake-up
//! (a tick, or a task finishing and freeing a slot) refills capacity by
//! claiming until the store comes back empty. Claims across processes are
//! arbitrated solely by the store's atomic claim operation; nothing here
//! locks.
//!
//! Handler failures are recorded on the job and never stop the loop. Store
//! failures inside the loop go to a configurable sink and never stop the
//! loop either. The only ways out are the shutdown signal and the tick
//! stream ending, both of which drain in-flight work and then release any
//! leftover claims.

use std::collections::HashMap;
use std::sync::Arc;

use futures::{FutureExt as _, Stream, StreamExt as _, future::BoxFuture};
use serde_json::Value;

use crate::job::{ClaimantId, DEFAULT_NAME, JobFailure, JobRecord};
use crate::store::JobStore;
use crate::utils::{DEFAULT_DELAY, IntervalError, IntoInterval, Ticker};

/// How long the shutdown reaper pass may hold up process exit.
const REAP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// How claim-and-execute futures are executed (inline, Tokio, ...).
pub trait JobSpawner {
    type JobHandle<Fut>: Future<Output = ()> + Send + 'static
    where
        Fut: Future<Output = ()> + Send + 'static;
    fn spawn<Fut>(fut: Fut) -> Self::JobHandle<Fut>
    where
        Fut: Future<Output = ()> + Send + 'static;
}

/// Minimal spawner that runs jobs inside the worker's own task pool
/// (deterministic tests, no runtime requirement).
pub struct InlineSpawner;

impl JobSpawner for InlineSpawner {
    type JobHandle<Fut>
        = Fut
    where
        Fut: Future<Output = ()> + Send + 'static;
    fn spawn<Fut>(fut: Fut) -> Self::JobHandle<Fut>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        fut
    }
}

/// Stream that wakes the worker to attempt claims.
pub trait TickStream: Stream<Item = ()> + Send {}

impl<St> TickStream for St where St: Stream<Item = ()> + Send {}

/// What a handler resolves to: the output to publish, or the failure to
/// record on the job.
pub type HandlerResult = Result<Value, Box<dyn std::error::Error + Send + Sync>>;

type HandlerFn = Arc<dyn Fn(Value) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

type ErrorSink = Arc<dyn Fn(&(dyn std::error::Error + 'static)) + Send + Sync>;

fn default_error_sink() -> ErrorSink {
    Arc::new(|error| tracing::error!(error = %error, "store operation failed"))
}

/// Configuration rejected when building a worker.
#[derive(Debug)]
pub struct ConfigError {
    inner: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid worker configuration: {}", self.inner)
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.inner.as_ref())
    }
}

impl From<IntervalError> for ConfigError {
    fn from(error: IntervalError) -> Self {
        Self {
            inner: Box::new(error),
        }
    }
}

/// Builder for [`Worker`]. Handlers, concurrency and the claimant token are
/// fixed at build time; the claim filter only ever matches registered names.
pub struct WorkerBuilder<S, Tick = Ticker, Sp = InlineSpawner> {
    store: S,
    tick: Tick,
    config_error: Option<ConfigError>,
    concurrency: usize,
    dispose: bool,
    claimant: ClaimantId,
    handlers: HashMap<String, HandlerFn>,
    error_sink: ErrorSink,
    marker: std::marker::PhantomData<fn() -> Sp>,
}

impl<S> WorkerBuilder<S> {
    /// Start configuring a worker over `store`. Until changed, it attempts
    /// claims once per second, one handler at a time, under a fresh random
    /// claimant token.
    pub fn new(store: S) -> Self {
        WorkerBuilder {
            store,
            tick: Ticker::new(DEFAULT_DELAY),
            config_error: None,
            concurrency: 1,
            dispose: false,
            claimant: ClaimantId::generate(),
            handlers: HashMap::new(),
            error_sink: default_error_sink(),
            marker: std::marker::PhantomData,
        }
    }
}

impl<S, Tick, Sp> WorkerBuilder<S, Tick, Sp> {
    /// Register `handler` for jobs dispatched under `name`.
    ///
    /// The handler receives the job's input and resolves to the output to
    /// publish or the error to record. Registering a name twice keeps the
    /// later handler.
    pub fn register<F, Fut, E>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, E>> + Send + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
    {
        let erased: HandlerFn = Arc::new(move |input| {
            let fut = handler(input);
            async move { fut.await.map_err(Into::into) }.boxed()
        });
        self.handlers.insert(name.into(), erased);
        self
    }

    /// Register a handler under the default name.
    pub fn register_default<F, Fut, E>(self, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, E>> + Send + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
    {
        self.register(DEFAULT_NAME, handler)
    }

    /// Cap on concurrently executing handlers. Defaults to one; zero is
    /// legal and claims nothing.
    pub fn concurrency(self, concurrency: usize) -> Self {
        Self {
            concurrency,
            ..self
        }
    }

    /// Delete records on success instead of publishing their output.
    pub fn dispose(self) -> Self {
        Self {
            dispose: true,
            ..self
        }
    }

    /// Claim-ownership token. Hand several workers the same token to share
    /// one reaping domain, or distinct tokens to keep them separate.
    pub fn claimant(self, claimant: ClaimantId) -> Self {
        Self { claimant, ..self }
    }

    /// Replace the sink store failures inside the loop are reported to.
    pub fn error_sink<F>(self, sink: F) -> Self
    where
        F: Fn(&(dyn std::error::Error + 'static)) + Send + Sync + 'static,
    {
        Self {
            error_sink: Arc::new(sink),
            ..self
        }
    }

    /// Replace the tick stream pacing claim attempts (tests, notify
    /// integration).
    pub fn tick<Tick2>(self, tick: Tick2) -> WorkerBuilder<S, Tick2, Sp>
    where
        Tick2: TickStream,
    {
        WorkerBuilder {
            store: self.store,
            tick,
            config_error: self.config_error,
            concurrency: self.concurrency,
            dispose: self.dispose,
            claimant: self.claimant,
            handlers: self.handlers,
            error_sink: self.error_sink,
            marker: std::marker::PhantomData,
        }
    }

    /// Choose how claim-and-execute tasks are spawned.
    pub fn job_spawner<Sp2>(self, _spawner: Sp2) -> WorkerBuilder<S, Tick, Sp2>
    where
        Sp2: JobSpawner,
    {
        WorkerBuilder {
            store: self.store,
            tick: self.tick,
            config_error: self.config_error,
            concurrency: self.concurrency,
            dispose: self.dispose,
            claimant: self.claimant,
            handlers: self.handlers,
            error_sink: self.error_sink,
            marker: std::marker::PhantomData,
        }
    }

    /// Validate the configuration and produce a worker.
    pub fn build(self) -> Result<Worker<S, Tick, Sp>, ConfigError> {
        if let Some(error) = self.config_error {
            return Err(error);
        }
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        Ok(Worker {
            store: self.store,
            tick: self.tick,
            handlers: Arc::new(self.handlers),
            names: names.into(),
            concurrency: self.concurrency,
            dispose: self.dispose,
            claimant: self.claimant,
            error_sink: self.error_sink,
            marker: std::marker::PhantomData,
        })
    }
}

impl<S, Sp> WorkerBuilder<S, Ticker, Sp> {
    /// Set the idle backoff between unsuccessful claim rounds. Accepts a
    /// duration or a shorthand string; rejected values surface at `build`.
    pub fn delay(self, interval: impl IntoInterval) -> Self {
        match interval.into_interval() {
            Ok(period) => Self {
                tick: Ticker::new(period),
                ..self
            },
            Err(error) => Self {
                config_error: Some(error.into()),
                ..self
            },
        }
    }
}

/// Self-scheduling claim loop bound to one store handle and one claimant
/// token.
pub struct Worker<S, Tick = Ticker, Sp = InlineSpawner> {
    store: S,
    tick: Tick,
    handlers: Arc<HashMap<String, HandlerFn>>,
    names: Arc<[String]>,
    concurrency: usize,
    dispose: bool,
    claimant: ClaimantId,
    error_sink: ErrorSink,
    marker: std::marker::PhantomData<fn() -> Sp>,
}

impl<S, Tick, Sp> std::fmt::Debug for Worker<S, Tick, Sp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("names", &self.names)
            .field("concurrency", &self.concurrency)
            .field("dispose", &self.dispose)
            .field("claimant", &self.claimant)
            .finish_non_exhaustive()
    }
}

impl<S, Tick, Sp> Worker<S, Tick, Sp> {
    /// Token this worker claims under; what a host passes to [`reap`] after
    /// an abnormal stop.
    pub fn claimant(&self) -> ClaimantId {
        self.claimant
    }

    /// Names this worker will claim, sorted.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Expose the store handle for composition.
    pub fn store_ref(&self) -> &S {
        &self.store
    }
}

impl<S, Tick, Sp> Worker<S, Tick, Sp>
where
    S: JobStore + Clone + Send + Sync + 'static,
    Tick: TickStream,
    Sp: JobSpawner,
{
    /// Run until the tick stream ends, then drain and release leftover
    /// claims.
    pub fn run(self) -> impl Future<Output = ()> + Send {
        self.with_graceful_shutdown(std::future::pending::<()>())
            .run()
    }

    /// Stop claiming when `signal` resolves. In-flight handlers finish and
    /// publish naturally; the reaper pass then releases anything still
    /// claimed under this worker's token.
    pub fn with_graceful_shutdown<Signal>(
        self,
        signal: Signal,
    ) -> WorkerWithGracefulShutdown<S, Tick, Signal, Sp>
    where
        Signal: Future<Output = ()> + Send,
    {
        WorkerWithGracefulShutdown {
            worker: self,
            signal,
        }
    }
}

/// Worker variant that stops claiming on a shutdown signal and drains.
pub struct WorkerWithGracefulShutdown<S, Tick, Signal, Sp> {
    worker: Worker<S, Tick, Sp>,
    signal: Signal,
}

impl<S, Tick, Signal, Sp> WorkerWithGracefulShutdown<S, Tick, Signal, Sp>
where
    S: JobStore + Clone + Send + Sync + 'static,
    Tick: TickStream,
    Signal: Future<Output = ()> + Send,
    Sp: JobSpawner,
{
    pub fn run(self) -> impl Future<Output = ()> + Send {
        let Worker {
            store,
            tick,
            handlers,
            names,
            concurrency,
            dispose,
            claimant,
            error_sink,
            marker: _,
        } = self.worker;
        run_worker::<S, Tick, Signal, Sp>(
            store,
            tick,
            handlers,
            names,
            concurrency,
            dispose,
            claimant,
            error_sink,
            self.signal,
        )
    }
}

/// Core loop: refill claims on every wake-up, idle on the tick otherwise.
#[allow(clippy::too_many_arguments)]
async fn run_worker<S, Tick, Signal, Sp>(
    store: S,
    tick: Tick,
    handlers: Arc<HashMap<String, HandlerFn>>,
    names: Arc<[String]>,
    concurrency: usize,
    dispose: bool,
    claimant: ClaimantId,
    error_sink: ErrorSink,
    signal: Signal,
) where
    S: JobStore + Clone + Send + Sync + 'static,
    Tick: TickStream,
    Signal: Future<Output = ()> + Send,
    Sp: JobSpawner,
{
    futures::pin_mut!(tick);
    futures::pin_mut!(signal);
    let mut tick = tick.fuse();
    let mut signal = signal.fuse();
    // In-flight claim-and-execute tasks; its length is the in-flight count
    // the concurrency cap gates.
    let mut tasks = futures::stream::FuturesUnordered::new();

    loop {
        // Fill free capacity before waiting: one claim per free slot, each
        // spawned as soon as it lands so no claim blocks the next. A miss or
        // a store failure ends the burst until the next wake-up; that tick
        // wait is the only backoff.
        while tasks.len() < concurrency && !names.is_empty() {
            match store.claim(&names, claimant).await {
                Ok(Some(job)) => {
                    let handler = match handlers.get(&job.name) {
                        Some(handler) => handler.clone(),
                        // Unreachable while the claim filter only matches
                        // registered names; the record stays claimed for the
                        // reaper rather than being lost.
                        None => {
                            tracing::error!(
                                job_id = %job.id,
                                name = %job.name,
                                "claimed a job with no registered handler"
                            );
                            debug_assert!(false, "claim filter returned an unregistered name");
                            break;
                        }
                    };
                    let fut =
                        execute_one(store.clone(), job, handler, dispose, error_sink.clone());
                    tasks.push(Sp::spawn(fut));
                }
                Ok(None) => break,
                Err(error) => {
                    (error_sink)(&error);
                    break;
                }
            }
        }

        futures::select! {
            tick_val = tick.next() => {
                if tick_val.is_none() {
                    tracing::trace!("tick stream ended, stopping claims");
                    break;
                }
            }
            _ = tasks.select_next_some() => {}
            _ = signal => {
                tracing::trace!(
                    in_flight = tasks.len(),
                    "shutdown signal received, draining"
                );
                break;
            }
        }
    }

    // Closing only stops new claims: work already claimed runs to
    // completion and publishes its result.
    while tasks.next().await.is_some() {}

    reap(&store, claimant, REAP_TIMEOUT).await;
}

/// Run one claimed job and publish the outcome. Both failure channels end
/// up on the record; neither is fatal to the caller.
async fn execute_one<S>(
    store: S,
    job: JobRecord,
    handler: HandlerFn,
    dispose: bool,
    error_sink: ErrorSink,
) where
    S: JobStore + Send + Sync,
{
    let JobRecord {
        id, name, input, ..
    } = job;
    tracing::trace!(job_id = %id, name = %name, "handler started");
    match handler(input).await {
        Ok(_) if dispose => {
            if let Err(error) = store.remove(id).await {
                (error_sink)(&error);
            }
        }
        Ok(output) => {
            if let Err(error) = store.succeed(id, output).await {
                (error_sink)(&error);
            }
        }
        Err(failure) => {
            let failure = JobFailure::from_error(failure.as_ref());
            tracing::debug!(job_id = %id, name = %name, error = %failure.message, "handler failed");
            if let Err(error) = store.fail(id, failure).await {
                (error_sink)(&error);
            }
        }
    }
    tracing::trace!(job_id = %id, "handler finished");
}

/// Return every record claimed under `claimant` to the pending pool.
///
/// Best effort with a hard bound: failures are logged, never propagated,
/// and the attempt is dropped once `timeout` elapses so recovery can never
/// delay process exit. Runs automatically after a worker drains; a host
/// wiring its own exit hook calls it directly with the token from
/// [`Worker::claimant`].
pub async fn reap<S>(store: &S, claimant: ClaimantId, timeout: std::time::Duration)
where
    S: JobStore + Sync,
{
    let release = store.release(claimant).fuse();
    let deadline = futures_timer::Delay::new(timeout).fuse();
    futures::pin_mut!(release);
    futures::pin_mut!(deadline);
    futures::select! {
        released = release => match released {
            Ok(0) => {}
            Ok(count) => tracing::info!(count, claimant = %claimant, "released abandoned claims"),
            Err(error) => {
                tracing::error!(error = %error, claimant = %claimant, "failed to release abandoned claims");
            }
        },
        _ = deadline => {
            tracing::warn!(claimant = %claimant, "gave up releasing abandoned claims");
        }
    }
}

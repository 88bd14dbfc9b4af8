//! Consumer side of a queue: claim, dispatch, heartbeat and reconciliation.
//!
//! A worker moves one token at a time from `pending` to `doing` over its own
//! store connection, claims it in `doing-map` with a set-if-absent, runs the
//! handler registered for the token's job name and finally drops the token
//! from both `doing` and `doing-map`. A periodic heartbeat refreshes the
//! claim timestamp of the in-flight token and, at most once per retry
//! interval, sweeps `doing` for tokens whose claim is missing or stale.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Mutex;

use crate::clock::now_millis;
use crate::config::WorkerConfig;
use crate::error::{FleetError, Result};
use crate::queue::{Pusher, Queue};
use crate::store::Store;
use crate::token::{JobToken, Payload};

/// Result type for job handlers.
pub type JobResult = std::result::Result<(), JobError>;

/// Error returned from job handlers. Logged by the worker, never retried.
#[derive(Debug)]
pub struct JobError {
    /// Error message.
    pub message: String,
}

impl JobError {
    /// Create a new error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl<E: std::error::Error> From<E> for JobError {
    fn from(err: E) -> Self {
        Self::new(err.to_string())
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = JobResult> + Send>>;
type Handler = Arc<dyn Fn(String, Payload) -> HandlerFuture + Send + Sync>;

/// Parameters of one reconciliation sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepOptions {
    /// Run even if another sweep happened within `interval`.
    pub force: bool,
    /// Claims older than this are re-queued.
    pub timeout: Duration,
    /// Lease of the `retrying` throttle key.
    pub interval: Duration,
}

impl SweepOptions {
    /// Options taken from a worker configuration, not forced.
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            force: false,
            timeout: config.retry_timeout,
            interval: config.retry_interval,
        }
    }

    /// Set the force flag.
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Set the staleness timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for SweepOptions {
    fn default() -> Self {
        Self::from_config(&WorkerConfig::default())
    }
}

struct Inner<S: Store + Clone> {
    queue: Queue<S>,
    reader: S,
    config: WorkerConfig,
    handlers: RwLock<HashMap<String, Handler>>,
    in_flight: Mutex<Option<String>>,
    running: AtomicBool,
    retry_at: AtomicI64,
}

/// Consumer of one queue. Cheap to clone; clones share handlers and state.
pub struct QueueWorker<S: Store + Clone + 'static> {
    inner: Arc<Inner<S>>,
}

impl<S: Store + Clone + 'static> Clone for QueueWorker<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Store + Clone + 'static> QueueWorker<S> {
    /// Create a worker for `queue`. The blocking read gets its own
    /// connection via [`Store::duplicate`].
    pub fn new(queue: Queue<S>, config: WorkerConfig) -> Self {
        let reader = queue.store().duplicate();
        Self {
            inner: Arc::new(Inner {
                queue,
                reader,
                config,
                handlers: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(None),
                running: AtomicBool::new(false),
                retry_at: AtomicI64::new(0),
            }),
        }
    }

    /// The consumed queue.
    pub fn queue(&self) -> &Queue<S> {
        &self.inner.queue
    }

    /// Worker configuration.
    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    /// Register the handler for a job name and return a pusher for it.
    /// Registering a name again replaces the previous handler.
    pub fn on<F, Fut>(&self, name: impl Into<String>, handler: F) -> Pusher<S>
    where
        F: Fn(String, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        let name = name.into();
        let handler: Handler = Arc::new(move |id: String, payload: Payload| -> HandlerFuture {
            Box::pin(handler(id, payload))
        });
        self.inner.handlers.write().insert(name.clone(), handler);
        self.inner.queue.pusher(name)
    }

    /// Whether a handler is registered for `name`.
    pub fn has_handler(&self, name: &str) -> bool {
        self.inner.handlers.read().contains_key(name)
    }

    /// Token currently being processed, if any.
    pub async fn in_flight(&self) -> Option<String> {
        self.inner.in_flight.lock().await.clone()
    }

    /// Whether the consumer loop is running.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Start the consumer loop and heartbeat in the background.
    ///
    /// Only the first call starts anything; later calls return `false`.
    /// Must be called from within a tokio runtime.
    pub fn init(&self) -> bool {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            tracing::debug!(queue = %self.inner.queue.name(), "Queue worker already initialized");
            return false;
        }

        let worker = self.clone();
        tokio::spawn(async move {
            worker.consume(std::future::pending::<()>()).await;
        });
        true
    }

    /// Run the consumer loop in the foreground until `shutdown` resolves.
    ///
    /// Shutdown is observed while waiting for a token or backing off; a
    /// handler that is already running completes first. A token moved to
    /// `doing` at the instant of shutdown stays there unclaimed and is
    /// picked up by a later sweep.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(FleetError::Config(format!(
                "worker for queue {} is already running",
                self.inner.queue.name()
            )));
        }

        self.consume(shutdown).await;
        self.inner.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn consume<F>(&self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let queue = self.inner.queue.name().to_string();
        let keys = self.inner.queue.keys();
        tracing::info!(queue = %queue, "Queue worker started");

        let heartbeat = tokio::spawn(self.clone().heartbeat_loop());
        tokio::pin!(shutdown);

        loop {
            let received = tokio::select! {
                _ = &mut shutdown => break,
                received = self.inner.reader.block_move(&keys.pending, &keys.doing) => received,
            };

            let result = match received {
                Ok(Some(token)) => self.process(token).await,
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            };

            if let Err(e) = result {
                tracing::error!(queue = %queue, error = %e, "Queue worker error");
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(self.inner.config.error_backoff) => {}
                }
            }
        }

        heartbeat.abort();
        tracing::info!(queue = %queue, "Queue worker stopped");
    }

    async fn process(&self, token: String) -> Result<()> {
        let store = self.inner.queue.store();
        let keys = self.inner.queue.keys();
        let started = now_millis();

        if !store
            .hset_nx(&keys.doing_map, &token, &started.to_string())
            .await?
        {
            tracing::debug!(token = %token, "Job already claimed, skipping");
            return Ok(());
        }

        *self.inner.in_flight.lock().await = Some(token.clone());
        tracing::debug!(token = %token, "Job started");

        self.dispatch(&token).await;

        // Clearing waits for a heartbeat write in progress, so the release
        // below is never followed by a refresh of the released token.
        *self.inner.in_flight.lock().await = None;
        store
            .release_claim(&keys.doing_map, &keys.doing, &token)
            .await?;

        tracing::debug!(
            token = %token,
            elapsed_ms = now_millis() - started,
            "Job completed"
        );
        Ok(())
    }

    async fn dispatch(&self, token: &str) {
        let job = match JobToken::parse(token) {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(token = %token, error = %e, "Malformed job token, dropping");
                return;
            }
        };

        let handler = self.inner.handlers.read().get(&job.name).cloned();
        let Some(handler) = handler else {
            tracing::error!(
                job_name = %job.name,
                job_id = %job.id,
                token = %token,
                "Job handler not found, dropping"
            );
            return;
        };

        // The handler runs in its own task so a panic cannot unwind the loop.
        let task = tokio::spawn(handler(job.id.clone(), job.payload));
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!(
                    token = %token,
                    job_name = %job.name,
                    error = %err,
                    "Job failed"
                );
            }
            Err(err) => {
                tracing::error!(
                    token = %token,
                    job_name = %job.name,
                    error = %err,
                    "Job panicked"
                );
            }
        }
    }

    async fn heartbeat_loop(self) {
        let mut interval = tokio::time::interval(self.inner.config.heartbeat_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            interval.tick().await;
            self.heartbeat().await;
        }
    }

    /// One heartbeat tick: refresh the in-flight claim, then sweep if the
    /// retry interval has elapsed since the last sweep from this worker.
    /// Failures are logged and never propagate.
    pub async fn heartbeat(&self) {
        let now = now_millis();
        let keys = self.inner.queue.keys();

        {
            let in_flight = self.inner.in_flight.lock().await;
            if let Some(token) = in_flight.as_ref() {
                if let Err(e) = self
                    .inner
                    .queue
                    .store()
                    .hset(&keys.doing_map, token, &now.to_string())
                    .await
                {
                    tracing::error!(token = %token, error = %e, "Failed to refresh job heartbeat");
                }
            }
        }

        let retry_interval = self.inner.config.retry_interval.as_millis() as i64;
        if now - self.inner.retry_at.load(Ordering::SeqCst) > retry_interval {
            self.inner.retry_at.store(now, Ordering::SeqCst);
            if let Err(e) = self.sweep(SweepOptions::from_config(&self.inner.config)).await {
                tracing::error!(queue = %self.inner.queue.name(), error = %e, "Queue sweep failed");
            }
        }
    }

    /// Re-queue tokens whose claim is missing or older than
    /// `options.timeout`, returning them.
    ///
    /// Unless forced, at most one sweep per `options.interval` runs across
    /// every worker of the queue. A token that is between its move into
    /// `doing` and its claim looks orphaned to a concurrent sweep and may be
    /// re-queued; the claim guard keeps the two deliveries from running at
    /// the same time but not from running twice.
    pub async fn sweep(&self, options: SweepOptions) -> Result<Vec<String>> {
        let store = self.inner.queue.store();
        let keys = self.inner.queue.keys();
        let now = now_millis();

        let acquired = store
            .set_nx_px(
                &keys.retrying,
                &now.to_string(),
                (options.interval.as_millis() as u64).max(1),
            )
            .await?;
        if !acquired && !options.force {
            return Ok(Vec::new());
        }

        let (doing, claims) = store.read_list_and_hash(&keys.doing, &keys.doing_map).await?;
        let timeout = options.timeout.as_millis() as i64;
        let is_stale = |at: &str| now - at.parse::<i64>().unwrap_or(0) > timeout;

        let mut seen = HashSet::new();
        let mut stale: Vec<String> = Vec::new();
        for (token, at) in &claims {
            if is_stale(at.as_str()) && seen.insert(token.clone()) {
                stale.push(token.clone());
            }
        }
        for token in doing {
            let orphaned = claims.get(&token).map_or(true, |at| is_stale(at.as_str()));
            if orphaned && seen.insert(token.clone()) {
                stale.push(token);
            }
        }

        store.requeue(&keys.doing_map, &keys.pending, &stale).await?;
        if !stale.is_empty() {
            tracing::info!(
                queue = %self.inner.queue.name(),
                count = stale.len(),
                "Re-queued stale jobs"
            );
        }
        Ok(stale)
    }
}

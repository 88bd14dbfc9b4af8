//! Cron schedules fired through a queue.
//!
//! Every process evaluates every schedule, but the evaluation window comes
//! from a shared "last check" key replaced with `GETSET`: concurrent ticks
//! split the timeline into disjoint windows and each due firing is pushed
//! once across the fleet. Fired jobs run through the ordinary worker path
//! under the reserved job name [`CRON_JOB`], keyed by schedule id.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{Local, TimeZone};
use parking_lot::RwLock;

use crate::clock::now_millis;
use crate::config::CronConfig;
use crate::cron_time::{CronTime, Schedule};
use crate::error::Result;
use crate::queue::Pusher;
use crate::store::Store;
use crate::token::Payload;
use crate::worker::{JobResult, QueueWorker};

/// Job name under which schedule firings are queued.
pub const CRON_JOB: &str = "CRON";

type CronFuture = Pin<Box<dyn Future<Output = JobResult> + Send>>;
type CronHandler = Arc<dyn Fn() -> CronFuture + Send + Sync>;

struct Entry {
    id: String,
    expression: String,
    schedule: Schedule,
    handler: CronHandler,
}

type Registry = Arc<RwLock<Vec<Arc<Entry>>>>;

/// Registry of schedules riding on a queue worker.
#[derive(Clone)]
pub struct Cron<S: Store + Clone + 'static, Tz: TimeZone = Local> {
    version: String,
    last_key: String,
    store: S,
    pusher: Pusher<S>,
    entries: Registry,
    counter: Arc<AtomicU64>,
    config: CronConfig,
    tz: Tz,
}

impl<S: Store + Clone + 'static> Cron<S, Local> {
    /// Attach a cron to `worker`, registering its [`CRON_JOB`] handler.
    ///
    /// Schedule ids are `{version}-{n}`; processes running the same version
    /// and registering in the same order agree on them.
    pub fn new(worker: &QueueWorker<S>, version: impl Into<String>) -> Self {
        let entries: Registry = Arc::new(RwLock::new(Vec::new()));

        let registry = Arc::clone(&entries);
        let pusher = worker.on(CRON_JOB, move |id, _| {
            let entry = registry.read().iter().find(|e| e.id == id).cloned();
            run_entry(id, entry)
        });

        Self {
            version: version.into(),
            last_key: worker.queue().keys().cron_last(),
            store: worker.queue().store().clone(),
            pusher,
            entries,
            counter: Arc::new(AtomicU64::new(0)),
            config: CronConfig::default(),
            tz: Local,
        }
    }
}

impl<S, Tz> Cron<S, Tz>
where
    S: Store + Clone + 'static,
    Tz: TimeZone + Send + Sync + 'static,
{
    /// Evaluate schedules in `tz` instead of the local time zone.
    pub fn with_timezone<Tz2: TimeZone + Send + Sync + 'static>(self, tz: Tz2) -> Cron<S, Tz2> {
        Cron {
            version: self.version,
            last_key: self.last_key,
            store: self.store,
            pusher: self.pusher,
            entries: self.entries,
            counter: self.counter,
            config: self.config,
            tz,
        }
    }

    /// Replace the driver configuration.
    pub fn with_config(mut self, config: CronConfig) -> Self {
        self.config = config;
        self
    }

    /// Version tag of generated ids.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Register `handler` to run whenever `expression` is due. Returns the
    /// schedule id. A malformed expression fails here, before anything runs.
    pub fn on<F, Fut>(&self, expression: &str, handler: F) -> Result<String>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        let schedule = Schedule::parse(expression)?;
        let id = format!(
            "{}-{}",
            self.version,
            self.counter.fetch_add(1, Ordering::SeqCst) + 1
        );

        let handler: CronHandler = Arc::new(move || -> CronFuture { Box::pin(handler()) });
        self.entries.write().push(Arc::new(Entry {
            id: id.clone(),
            expression: expression.to_string(),
            schedule,
            handler,
        }));

        tracing::debug!(cron_id = %id, expression = %expression, "Cron schedule registered");
        Ok(id)
    }

    /// Claim the window since the previous check and push every schedule
    /// due in it. Returns the ids pushed.
    pub async fn tick(&self) -> Result<Vec<String>> {
        let deadline = now_millis();
        let previous = self
            .store
            .get_set(&self.last_key, &deadline.to_string())
            .await?;
        let start = previous
            .and_then(|value| value.parse::<i64>().ok())
            .filter(|value| *value != 0)
            .unwrap_or(deadline - 1000);

        let due: Vec<String> = self
            .entries
            .read()
            .iter()
            .filter(|entry| {
                CronTime::from_schedule(entry.schedule, Some(start), Some(deadline), self.tz.clone())
                    .next_match()
                    .is_some()
            })
            .map(|entry| entry.id.clone())
            .collect();

        for id in &due {
            self.pusher.push(id, Payload::none()).await?;
        }
        if !due.is_empty() {
            tracing::debug!(count = due.len(), start, deadline, "Cron schedules fired");
        }
        Ok(due)
    }

    /// Call [`tick`](Self::tick) every `tick_interval` until `shutdown`
    /// resolves. Tick failures are logged and the loop continues.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        tracing::info!(version = %self.version, "Cron started");
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "Cron tick failed");
                    }
                }
            }
        }
        tracing::info!(version = %self.version, "Cron stopped");
    }
}

async fn run_entry(id: String, entry: Option<Arc<Entry>>) -> JobResult {
    let Some(entry) = entry else {
        tracing::error!(cron_id = %id, "Cron handler not found, dropping");
        return Ok(());
    };

    if let Err(err) = (entry.handler)().await {
        tracing::error!(
            cron_id = %id,
            expression = %entry.expression,
            error = %err,
            "Cron job failed"
        );
    }
    Ok(())
}

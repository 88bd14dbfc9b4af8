//! # fleet - Distributed coordination over Redis
//!
//! Small building blocks for services that run as several processes against
//! one shared Redis:
//!
//! - **Queue**: at-least-once jobs with heartbeats and recovery of jobs
//!   claimed by crashed processes
//! - **Lock**: leased locks in waiting, non-blocking and throttling modes
//! - **Cron**: six-field schedules with second granularity, fired at most
//!   once per matching second across the fleet
//! - **Cache**: namespaced values with per-entry expiry
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fleet::{Fleet, Payload, RedisConfig};
//!
//! #[tokio::main]
//! async fn main() -> fleet::Result<()> {
//!     let fleet = Fleet::connect(RedisConfig::builder().prefix("myapp").build()).await?;
//!
//!     let queue = fleet.queue("mail");
//!     let worker = fleet.worker(&queue);
//!     let send = worker.on("send", |id, payload| async move {
//!         println!("sending {id}: {payload:?}");
//!         Ok(())
//!     });
//!     worker.init();
//!     send.push("42", Payload::none()).await?;
//!
//!     let cron = fleet.cron(&worker, "v1");
//!     cron.on("0 */5 * * * *", || async { Ok(()) })?;
//!     cron.run_until(async { tokio::signal::ctrl_c().await.ok(); }).await;
//!     Ok(())
//! }
//! ```

pub use fleet_core::{
    kebab_case, now_millis, Cache, Cron, CronConfig, CronParseError, CronTime, FleetError,
    JobError, JobResult, JobToken, KeySpace, Lock, LockManager, LockOptions, MemoryStore,
    Payload, Pusher, Queue, QueueKeys, QueueWorker, Result, Schedule, Store, SweepOptions,
    WorkerConfig, WorkerConfigBuilder, CRON_JOB, DEFAULT_DEADLINE_MS, DEFAULT_TTL,
};
pub use fleet_redis::{RedisConfig, RedisConfigBuilder, RedisStore};

/// Entry point tying a store and key prefix to every primitive.
#[derive(Clone)]
pub struct Fleet<S: Store + Clone + 'static = RedisStore> {
    store: S,
    space: KeySpace,
    worker_config: WorkerConfig,
    locks: LockManager<S>,
}

impl Fleet<RedisStore> {
    /// Connect to Redis.
    pub async fn connect(config: RedisConfig) -> Result<Self> {
        let store = RedisStore::connect(&config).await?;
        Ok(Self::with_store(store, config.prefix))
    }

    /// Connect using `REDIS_URL`, `REDIS_PREFIX` and `REDIS_TRACE`.
    pub async fn from_env() -> Result<Self> {
        Self::connect(RedisConfig::from_env()?).await
    }
}

impl<S: Store + Clone + 'static> Fleet<S> {
    /// Use an existing store.
    pub fn with_store(store: S, prefix: impl Into<String>) -> Self {
        let space = KeySpace::new(prefix);
        Self {
            locks: LockManager::new(store.clone(), space.clone()),
            store,
            space,
            worker_config: WorkerConfig::default(),
        }
    }

    /// Config applied to workers created afterwards.
    pub fn with_worker_config(mut self, config: WorkerConfig) -> Self {
        self.worker_config = config;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn space(&self) -> &KeySpace {
        &self.space
    }

    /// Queue handle for `name`.
    pub fn queue(&self, name: &str) -> Queue<S> {
        Queue::new(self.store.clone(), &self.space, name)
    }

    /// Worker consuming `queue`. Call [`QueueWorker::init`] once handlers
    /// are registered.
    pub fn worker(&self, queue: &Queue<S>) -> QueueWorker<S> {
        QueueWorker::new(queue.clone(), self.worker_config.clone())
    }

    /// Shared lock manager.
    pub fn locks(&self) -> &LockManager<S> {
        &self.locks
    }

    /// Cron producing onto `worker`'s queue.
    pub fn cron(&self, worker: &QueueWorker<S>, version: &str) -> Cron<S> {
        Cron::new(worker, version)
    }

    pub fn cache(&self) -> Cache<S> {
        Cache::new(self.store.clone(), self.space.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fleet() -> Fleet<MemoryStore> {
        Fleet::with_store(MemoryStore::new(), "app")
    }

    #[test]
    fn test_fleet_key_layout() {
        let fleet = fleet();
        let queue = fleet.queue("mail");
        assert_eq!(queue.keys().pending, "app-{fleet-queue-mail}-pending");
        assert_eq!(fleet.space().lock("Daily Report"), "app-fleet-lock-daily-report");
        assert_eq!(fleet.cache().key("users"), "app:users");
    }

    #[tokio::test]
    async fn test_fleet_worker_uses_config() {
        let config = WorkerConfig::builder()
            .heartbeat_interval(Duration::from_secs(1))
            .build();
        let fleet = fleet().with_worker_config(config);
        let worker = fleet.worker(&fleet.queue("jobs"));
        assert_eq!(worker.config().heartbeat_interval, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_fleet_queue_round_trip() {
        let fleet = fleet();
        let queue = fleet.queue("jobs");
        let worker = fleet.worker(&queue);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let pusher = worker.on("greet", move |id, payload| {
            let tx = tx.clone();
            async move {
                tx.send((id, payload.decode::<String>()?)).ok();
                Ok::<(), JobError>(())
            }
        });
        assert!(worker.init());

        pusher.push("7", Payload::new(&"hello").unwrap()).await.unwrap();
        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, ("7".to_string(), Some("hello".to_string())));
    }

    #[tokio::test]
    async fn test_fleet_locks_are_shared() {
        let fleet = fleet();
        let holder = fleet.locks().lock("sync", Duration::from_secs(5));
        assert!(holder.lock().await.unwrap());

        let other = fleet.clone();
        let busy = other
            .locks()
            .try_start("sync", Duration::from_secs(1), || async {})
            .await;
        assert!(matches!(busy, Err(FleetError::LockBusy { .. })));
    }

    #[tokio::test]
    async fn test_fleet_cache_wrap() {
        let fleet = fleet();
        let cache = fleet.cache();
        let value: u32 = cache
            .wrap::<_, FleetError, _, _>("n", "1", DEFAULT_TTL, false, || async { Ok(5) })
            .await
            .unwrap();
        assert_eq!(value, 5);
        assert_eq!(cache.get::<u32>("n", "1").await.unwrap(), Some(5));
    }
}

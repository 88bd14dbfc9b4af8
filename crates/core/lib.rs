//! # fleet-core - Distributed coordination primitives
//!
//! This crate provides the store-agnostic half of fleet:
//! - `Store` trait for Redis-like backends, plus the in-process `MemoryStore`
//! - `Queue` / `QueueWorker`: at-least-once job queue with heartbeats and
//!   reconciliation of crashed claims
//! - `LockManager`: leased locks with blocking, non-blocking and throttling modes
//! - `CronTime` / `Cron`: six-field second-granularity schedules fired through a queue
//! - `Cache`: namespaced TTL cache
//! - Error and configuration types

mod cache;
mod clock;
mod config;
mod cron;
mod cron_time;
mod error;
mod keys;
mod lock;
mod memory;
mod queue;
mod store;
mod token;
mod worker;

// Re-export main types
pub use cache::{Cache, DEFAULT_TTL};
pub use clock::now_millis;
pub use config::{CronConfig, LockOptions, WorkerConfig, WorkerConfigBuilder};
pub use cron::{Cron, CRON_JOB};
pub use cron_time::{CronTime, Schedule, DEFAULT_DEADLINE_MS};
pub use error::{CronParseError, FleetError, Result};
pub use keys::{kebab_case, KeySpace, QueueKeys};
pub use lock::{Lock, LockManager};
pub use memory::MemoryStore;
pub use queue::{Pusher, Queue};
pub use store::Store;
pub use token::{JobToken, Payload, SEPARATOR};
pub use worker::{JobError, JobResult, QueueWorker, SweepOptions};

//! slotgate: distributed admission control for long-running evaluation tasks.
//!
//! Any number of service instances share one coordination store. At most
//! `max_concurrent` tasks hold a slot at a time; the rest wait in a single
//! FIFO queue and are granted slots as holders release them.

mod config;
mod task;
mod version;

pub mod admission;
pub mod launcher;
pub mod service;
pub mod store;
pub mod transport;
pub mod webhook;

pub use admission::{AcquireOptions, AdmissionController, AdmissionError, SlotStats};
pub use config::{AdmissionConfig, ConfigError};
pub use launcher::{EvaluationError, EvaluationJob, Evaluator, HttpEvaluator, TaskLauncher};
pub use service::{EvaluationService, ServiceError};
pub use store::{CoordinationStore, MemoryStore, RedisStore, StoreConfig, StoreError};
pub use task::{SlotPosition, TaskId, TaskMetadata, TaskStatus};
pub use version::SLOTGATE_VERSION;

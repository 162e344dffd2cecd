//! Coordination store port.
//!
//! The store is the single arbiter of who holds a slot. Every state
//! transition below is one atomic operation on the store side, so the
//! controller holds no lock of its own and behaves the same whether one
//! process or many share the store.
//!
//! Shared state:
//! - active registry: task ids holding a slot, each with a lease expiry
//! - wait queue: FIFO of `(task_id, enqueued_at)`
//! - task metadata: `{status, timestamp}` with a TTL, observability only
//! - events channel: [`Notification`]s for waiting callers

mod memory;
mod redis_store;
mod scripts;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::task::{SlotPosition, TaskId, TaskMetadata};

pub use self::memory::MemoryStore;
pub use self::redis_store::{RedisStore, StoreConfig};

/// Capacity rules passed along with every mutating call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotPolicy {
    pub capacity: usize,
    /// `None` means grants never expire on their own.
    pub lease: Option<Duration>,
}

/// Outcome of [`CoordinationStore::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admit {
    Granted,
    Queued,
    AlreadyActive,
}

/// Outcome of [`CoordinationStore::release`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Released {
    pub was_active: bool,
    /// Waiters handed a slot as part of this release.
    pub promoted: usize,
}

/// Outcome of [`CoordinationStore::withdraw`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Withdrawal {
    Withdrawn,
    /// Promoted before the withdrawal landed; the caller now holds a slot.
    AlreadyGranted,
    NotQueued,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedTask {
    pub task_id: String,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetReport {
    pub cleared_active: usize,
    pub cleared_queued: usize,
}

/// Event published on the store's channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    /// `task_id` was moved from the wait queue into the active registry.
    Granted { task_id: String },
    /// Registry and queue were cleared; every waiter must re-check.
    Reset,
}

/// Stream of notifications; ends when the underlying connection drops.
pub type Subscription = BoxStream<'static, Notification>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("malformed store data: {0}")]
    Decode(String),
    #[error("store closed")]
    Closed,
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Grant a slot if the queue is empty and capacity is free, otherwise
    /// enqueue the task (once) and promote queue heads into free capacity.
    async fn admit(&self, task: &TaskId, policy: &SlotPolicy) -> Result<Admit, StoreError>;

    /// Evict expired leases and hand free slots to queue heads.
    async fn promote(&self, policy: &SlotPolicy) -> Result<usize, StoreError>;

    /// Remove `task` from the registry (no-op for non-members) and promote.
    async fn release(&self, task: &TaskId, policy: &SlotPolicy) -> Result<Released, StoreError>;

    /// Extend the lease of an active task. `false` if it no longer holds a slot.
    async fn renew(&self, task: &TaskId, policy: &SlotPolicy) -> Result<bool, StoreError>;

    async fn withdraw(&self, task: &TaskId) -> Result<Withdrawal, StoreError>;

    async fn position(&self, task: &TaskId) -> Result<SlotPosition, StoreError>;

    async fn active_count(&self) -> Result<usize, StoreError>;

    async fn queue_len(&self) -> Result<usize, StoreError>;

    /// Queued tasks, head first.
    async fn waiting(&self) -> Result<Vec<QueuedTask>, StoreError>;

    /// Clear registry and queue unconditionally and publish [`Notification::Reset`].
    async fn reset(&self) -> Result<ResetReport, StoreError>;

    async fn write_metadata(
        &self,
        task: &TaskId,
        metadata: &TaskMetadata,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    async fn read_metadata(&self, task: &TaskId) -> Result<Option<TaskMetadata>, StoreError>;

    async fn subscribe(&self) -> Result<Subscription, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

//! In-process [`CoordinationStore`] for tests and single-instance deployments.
//!
//! All shared state sits behind one mutex, which makes every operation
//! trivially atomic. Lease expiry uses `tokio::time::Instant`, so paused-time
//! tests can drive it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::{
    Admit, CoordinationStore, Notification, QueuedTask, Released, ResetReport, SlotPolicy,
    StoreError, Subscription, Withdrawal,
};
use crate::task::{SlotPosition, TaskId, TaskMetadata};

const EVENTS_CAPACITY: usize = 256;

#[derive(Default)]
struct State {
    /// Active registry: task -> lease expiry (`None` = no lease).
    active: HashMap<TaskId, Option<Instant>>,
    queue: VecDeque<(TaskId, DateTime<Utc>)>,
    metadata: HashMap<TaskId, (TaskMetadata, Instant)>,
}

impl State {
    fn evict_expired(&mut self, now: Instant) {
        self.active
            .retain(|_, expiry| expiry.is_none_or(|at| at > now));
    }

    fn is_queued(&self, task: &TaskId) -> bool {
        self.queue.iter().any(|(id, _)| id == task)
    }

    /// Moves queue heads into free capacity and returns them in grant order.
    fn promote(&mut self, policy: &SlotPolicy, now: Instant) -> Vec<TaskId> {
        self.evict_expired(now);
        let mut promoted = Vec::new();
        while self.active.len() < policy.capacity {
            let Some((head, _)) = self.queue.pop_front() else {
                break;
            };
            self.active.insert(head.clone(), lease_expiry(policy, now));
            promoted.push(head);
        }
        promoted
    }
}

fn lease_expiry(policy: &SlotPolicy, now: Instant) -> Option<Instant> {
    policy.lease.map(|lease| now + lease)
}

pub struct MemoryStore {
    state: Mutex<State>,
    events: broadcast::Sender<Notification>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);
        Self {
            state: Mutex::new(State::default()),
            events,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // State is always left consistent between statements, so a panic in
        // another holder does not invalidate it.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_grants(&self, promoted: &[TaskId], skip: Option<&TaskId>) {
        for task in promoted {
            if Some(task) == skip {
                continue;
            }
            // No subscribers is fine: waiters also poll.
            let _ = self.events.send(Notification::Granted {
                task_id: task.to_string(),
            });
        }
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn admit(&self, task: &TaskId, policy: &SlotPolicy) -> Result<Admit, StoreError> {
        let now = Instant::now();
        let (admit, promoted) = {
            let mut state = self.state();
            state.evict_expired(now);

            if state.active.contains_key(task) {
                return Ok(Admit::AlreadyActive);
            }

            if !state.is_queued(task) {
                if state.queue.is_empty() && state.active.len() < policy.capacity {
                    state.active.insert(task.clone(), lease_expiry(policy, now));
                    return Ok(Admit::Granted);
                }
                state.queue.push_back((task.clone(), Utc::now()));
            }

            let promoted = state.promote(policy, now);
            let admit = if state.active.contains_key(task) {
                Admit::Granted
            } else {
                Admit::Queued
            };
            (admit, promoted)
        };

        self.publish_grants(&promoted, Some(task));
        Ok(admit)
    }

    async fn promote(&self, policy: &SlotPolicy) -> Result<usize, StoreError> {
        let promoted = self.state().promote(policy, Instant::now());
        self.publish_grants(&promoted, None);
        Ok(promoted.len())
    }

    async fn release(&self, task: &TaskId, policy: &SlotPolicy) -> Result<Released, StoreError> {
        let (was_active, promoted) = {
            let mut state = self.state();
            let was_active = state.active.remove(task).is_some();
            (was_active, state.promote(policy, Instant::now()))
        };

        self.publish_grants(&promoted, None);
        Ok(Released {
            was_active,
            promoted: promoted.len(),
        })
    }

    async fn renew(&self, task: &TaskId, policy: &SlotPolicy) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut state = self.state();
        state.evict_expired(now);
        match state.active.get_mut(task) {
            Some(expiry) => {
                *expiry = lease_expiry(policy, now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn withdraw(&self, task: &TaskId) -> Result<Withdrawal, StoreError> {
        let mut state = self.state();
        let before = state.queue.len();
        state.queue.retain(|(id, _)| id != task);

        if state.active.contains_key(task) {
            Ok(Withdrawal::AlreadyGranted)
        } else if state.queue.len() < before {
            Ok(Withdrawal::Withdrawn)
        } else {
            Ok(Withdrawal::NotQueued)
        }
    }

    async fn position(&self, task: &TaskId) -> Result<SlotPosition, StoreError> {
        let state = self.state();
        Ok(if state.active.contains_key(task) {
            SlotPosition::Active
        } else if state.is_queued(task) {
            SlotPosition::Queued
        } else {
            SlotPosition::Absent
        })
    }

    async fn active_count(&self) -> Result<usize, StoreError> {
        Ok(self.state().active.len())
    }

    async fn queue_len(&self) -> Result<usize, StoreError> {
        Ok(self.state().queue.len())
    }

    async fn waiting(&self) -> Result<Vec<QueuedTask>, StoreError> {
        Ok(self
            .state()
            .queue
            .iter()
            .map(|(id, at)| QueuedTask {
                task_id: id.to_string(),
                enqueued_at: *at,
            })
            .collect())
    }

    async fn reset(&self) -> Result<ResetReport, StoreError> {
        let report = {
            let mut state = self.state();
            let report = ResetReport {
                cleared_active: state.active.len(),
                cleared_queued: state.queue.len(),
            };
            state.active.clear();
            state.queue.clear();
            report
        };

        let _ = self.events.send(Notification::Reset);
        Ok(report)
    }

    async fn write_metadata(
        &self,
        task: &TaskId,
        metadata: &TaskMetadata,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut state = self.state();
        state.metadata.retain(|_, (_, expires_at)| *expires_at > now);
        state
            .metadata
            .insert(task.clone(), (metadata.clone(), now + ttl));
        Ok(())
    }

    async fn read_metadata(&self, task: &TaskId) -> Result<Option<TaskMetadata>, StoreError> {
        let now = Instant::now();
        let mut state = self.state();
        state.metadata.retain(|_, (_, expires_at)| *expires_at > now);
        Ok(state.metadata.get(task).map(|(meta, _)| meta.clone()))
    }

    async fn subscribe(&self) -> Result<Subscription, StoreError> {
        let rx = self.events.subscribe();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(event) => Some((event, rx)),
                // Missed events: make every waiter re-check.
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Notification subscriber lagged");
                    Some((Notification::Reset, rx))
                }
                Err(broadcast::error::RecvError::Closed) => None,
            }
        });
        Ok(Box::pin(stream))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn id(raw: &str) -> TaskId {
        TaskId::parse(raw).unwrap()
    }

    fn policy(capacity: usize) -> SlotPolicy {
        SlotPolicy {
            capacity,
            lease: None,
        }
    }

    #[tokio::test]
    async fn admit_grants_until_capacity_then_queues() {
        let store = MemoryStore::new();
        let p = policy(2);

        assert_eq!(store.admit(&id("t1"), &p).await.unwrap(), Admit::Granted);
        assert_eq!(store.admit(&id("t2"), &p).await.unwrap(), Admit::Granted);
        assert_eq!(store.admit(&id("t3"), &p).await.unwrap(), Admit::Queued);

        assert_eq!(store.active_count().await.unwrap(), 2);
        assert_eq!(store.queue_len().await.unwrap(), 1);
        assert_eq!(
            store.position(&id("t3")).await.unwrap(),
            SlotPosition::Queued
        );
    }

    #[tokio::test]
    async fn admit_twice_does_not_double_enqueue() {
        let store = MemoryStore::new();
        let p = policy(1);

        store.admit(&id("t1"), &p).await.unwrap();
        assert_eq!(store.admit(&id("t2"), &p).await.unwrap(), Admit::Queued);
        assert_eq!(store.admit(&id("t2"), &p).await.unwrap(), Admit::Queued);
        assert_eq!(store.queue_len().await.unwrap(), 1);
        assert_eq!(
            store.admit(&id("t1"), &p).await.unwrap(),
            Admit::AlreadyActive
        );
    }

    #[tokio::test]
    async fn release_hands_slot_to_queue_head_and_publishes() {
        let store = MemoryStore::new();
        let p = policy(1);
        let mut events = store.subscribe().await.unwrap();

        store.admit(&id("t1"), &p).await.unwrap();
        store.admit(&id("t2"), &p).await.unwrap();
        store.admit(&id("t3"), &p).await.unwrap();

        let released = store.release(&id("t1"), &p).await.unwrap();
        assert_eq!(
            released,
            Released {
                was_active: true,
                promoted: 1
            }
        );
        assert_eq!(
            store.position(&id("t2")).await.unwrap(),
            SlotPosition::Active
        );
        assert_eq!(
            store.position(&id("t3")).await.unwrap(),
            SlotPosition::Queued
        );
        assert_eq!(
            events.next().await,
            Some(Notification::Granted {
                task_id: "t2".to_string()
            })
        );
    }

    #[tokio::test]
    async fn release_of_non_member_is_noop() {
        let store = MemoryStore::new();
        let released = store.release(&id("ghost"), &policy(1)).await.unwrap();
        assert_eq!(released, Released::default());
    }

    #[tokio::test]
    async fn newcomer_does_not_pass_waiters() {
        let store = MemoryStore::new();
        let p = policy(1);

        store.admit(&id("t1"), &p).await.unwrap();
        store.admit(&id("t2"), &p).await.unwrap();

        // Free the slot without promoting, as if the holder's lease lapsed.
        store.state().active.clear();

        // t3 arrives first, but t2 is ahead of it in the queue.
        assert_eq!(store.admit(&id("t3"), &p).await.unwrap(), Admit::Queued);
        assert_eq!(
            store.position(&id("t2")).await.unwrap(),
            SlotPosition::Active
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_is_evicted_on_promote() {
        let store = MemoryStore::new();
        let p = SlotPolicy {
            capacity: 1,
            lease: Some(Duration::from_secs(30)),
        };

        store.admit(&id("crashed"), &p).await.unwrap();
        store.admit(&id("waiter"), &p).await.unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(store.promote(&p).await.unwrap(), 0);

        tokio::time::advance(Duration::from_secs(21)).await;
        assert_eq!(store.promote(&p).await.unwrap(), 1);
        assert_eq!(
            store.position(&id("crashed")).await.unwrap(),
            SlotPosition::Absent
        );
        assert_eq!(
            store.position(&id("waiter")).await.unwrap(),
            SlotPosition::Active
        );
    }

    #[tokio::test(start_paused = true)]
    async fn renew_extends_lease() {
        let store = MemoryStore::new();
        let p = SlotPolicy {
            capacity: 1,
            lease: Some(Duration::from_secs(30)),
        };

        store.admit(&id("t1"), &p).await.unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(store.renew(&id("t1"), &p).await.unwrap());
        tokio::time::advance(Duration::from_secs(20)).await;

        store.promote(&p).await.unwrap();
        assert_eq!(store.active_count().await.unwrap(), 1);
        assert!(!store.renew(&id("other"), &p).await.unwrap());
    }

    #[tokio::test]
    async fn withdraw_reports_each_outcome() {
        let store = MemoryStore::new();
        let p = policy(1);

        store.admit(&id("t1"), &p).await.unwrap();
        store.admit(&id("t2"), &p).await.unwrap();

        assert_eq!(
            store.withdraw(&id("t2")).await.unwrap(),
            Withdrawal::Withdrawn
        );
        assert_eq!(
            store.withdraw(&id("t2")).await.unwrap(),
            Withdrawal::NotQueued
        );
        assert_eq!(
            store.withdraw(&id("t1")).await.unwrap(),
            Withdrawal::AlreadyGranted
        );
    }

    #[tokio::test]
    async fn reset_clears_and_notifies() {
        let store = MemoryStore::new();
        let p = policy(1);
        let mut events = store.subscribe().await.unwrap();

        store.admit(&id("t1"), &p).await.unwrap();
        store.admit(&id("t2"), &p).await.unwrap();

        let report = store.reset().await.unwrap();
        assert_eq!(
            report,
            ResetReport {
                cleared_active: 1,
                cleared_queued: 1
            }
        );
        assert_eq!(store.active_count().await.unwrap(), 0);
        assert_eq!(store.queue_len().await.unwrap(), 0);
        assert_eq!(events.next().await, Some(Notification::Reset));
    }

    #[tokio::test(start_paused = true)]
    async fn metadata_expires_after_ttl() {
        let store = MemoryStore::new();
        let task = id("t1");

        store
            .write_metadata(&task, &TaskMetadata::active(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(store.read_metadata(&task).await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(store.read_metadata(&task).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_metadata_is_swept_on_write() {
        let store = MemoryStore::new();

        for i in 0..10_000 {
            store
                .write_metadata(
                    &id(&format!("t{i}")),
                    &TaskMetadata::completed(),
                    Duration::from_secs(1),
                )
                .await
                .unwrap();
            tokio::time::advance(Duration::from_secs(2)).await;
        }
        assert_eq!(store.state().metadata.len(), 1);

        // Live entries survive the sweep.
        store
            .write_metadata(&id("a"), &TaskMetadata::active(), Duration::from_secs(60))
            .await
            .unwrap();
        store
            .write_metadata(&id("b"), &TaskMetadata::active(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.state().metadata.len(), 2);
        assert!(store.read_metadata(&id("a")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn waiting_lists_queue_in_fifo_order() {
        let store = MemoryStore::new();
        let p = policy(1);

        for raw in ["t1", "t2", "t3"] {
            store.admit(&id(raw), &p).await.unwrap();
        }

        let waiting: Vec<_> = store
            .waiting()
            .await
            .unwrap()
            .into_iter()
            .map(|q| q.task_id)
            .collect();
        assert_eq!(waiting, vec!["t2", "t3"]);
    }
}

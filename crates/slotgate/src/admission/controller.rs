use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::AdmissionError;
use super::waiters::{self, Signal, WaiterHandle, Waiters};
use crate::config::AdmissionConfig;
use crate::store::{
    Admit, CoordinationStore, QueuedTask, ResetReport, StoreError, Withdrawal,
};
use crate::task::{SlotPosition, TaskId, TaskMetadata};

/// Utilization snapshot. `active` and `queued` are read separately and may
/// disagree momentarily under concurrent activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotStats {
    pub active: usize,
    pub queued: usize,
    pub max: usize,
}

/// How long, and under what conditions, an `acquire` may wait.
#[derive(Debug, Clone)]
pub struct AcquireOptions {
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl AcquireOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Bounds how many tasks run at once across every process sharing a store.
///
/// Call [`start`](Self::start) to receive store notifications; without it
/// waiters still make progress on the re-check interval.
pub struct AdmissionController {
    store: Arc<dyn CoordinationStore>,
    config: AdmissionConfig,
    waiters: Arc<Waiters>,
    heartbeats: DashMap<TaskId, JoinHandle<()>>,
    dispatcher: StdMutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl AdmissionController {
    pub fn new(store: Arc<dyn CoordinationStore>, config: AdmissionConfig) -> Self {
        Self {
            store,
            config,
            waiters: Arc::new(Waiters::default()),
            heartbeats: DashMap::new(),
            dispatcher: StdMutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Spawn the notification dispatcher. Idempotent.
    pub fn start(&self) {
        let mut dispatcher = self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner);
        if dispatcher.is_some() {
            return;
        }
        *dispatcher = Some(tokio::spawn(waiters::dispatch(
            Arc::clone(&self.store),
            Arc::clone(&self.waiters),
            self.shutdown.child_token(),
        )));
        tracing::info!(
            max_concurrent = self.config.max_concurrent,
            lease_secs = self.config.lease_ttl.map(|l| l.as_secs()),
            "Admission controller started"
        );
    }

    /// Stop the dispatcher and lease renewals and fail pending waits with
    /// [`AdmissionError::Closed`]. Leases held by this process then lapse.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let pending = self.waiters.len();
        if pending > 0 {
            tracing::info!(pending, "Failing pending acquires");
        }
        self.waiters.close_all();

        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = dispatcher {
            let _ = handle.await;
        }

        self.heartbeats.retain(|_, handle| {
            handle.abort();
            false
        });
        tracing::info!("Admission controller stopped");
    }

    /// Wait, without limit, until `task_id` holds a slot.
    pub async fn acquire(&self, task_id: &str) -> Result<(), AdmissionError> {
        self.acquire_with(task_id, AcquireOptions::default()).await
    }

    pub async fn acquire_with(
        &self,
        task_id: &str,
        options: AcquireOptions,
    ) -> Result<(), AdmissionError> {
        let task = TaskId::parse(task_id)?;
        if self.shutdown.is_cancelled() {
            return Err(AdmissionError::Closed);
        }

        // Register before touching the store so no grant can slip past us.
        let mut waiter = self.waiters.register(&task)?;

        match self.store.admit(&task, &self.config.policy()).await? {
            Admit::Granted => {}
            Admit::AlreadyActive => return Err(AdmissionError::AlreadyActive(task.to_string())),
            Admit::Queued => {
                tracing::info!(task_id = %task, "No free slot, waiting");
                self.wait_for_slot(&task, &mut waiter, &options).await?;
            }
        }
        drop(waiter);

        self.on_admitted(&task).await;
        Ok(())
    }

    async fn wait_for_slot(
        &self,
        task: &TaskId,
        waiter: &mut WaiterHandle,
        options: &AcquireOptions,
    ) -> Result<(), AdmissionError> {
        let deadline = options.timeout.map(|timeout| Instant::now() + timeout);
        let mut recheck = tokio::time::interval(self.config.recheck_interval);
        recheck.set_missed_tick_behavior(MissedTickBehavior::Delay);
        recheck.reset();

        loop {
            let expired = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = options.cancel.cancelled() => {
                    return self.abandon(task, AdmissionError::Cancelled).await;
                }
                _ = self.shutdown.cancelled() => {
                    return self.abandon(task, AdmissionError::Closed).await;
                }
                _ = expired => {
                    return self.abandon(task, AdmissionError::TimedOut).await;
                }
                signal = waiter.recv() => match signal {
                    Some(Signal::Granted) => return Ok(()),
                    Some(Signal::Recheck) => {
                        tracing::debug!(task_id = %task, "Re-checking after notification");
                    }
                    None => return self.abandon(task, AdmissionError::Closed).await,
                },
                _ = recheck.tick() => {}
            }

            match self.recheck(task).await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                // The next tick tries again; the wait itself is still valid.
                Err(e) => tracing::warn!(task_id = %task, error = %e, "Slot re-check failed"),
            }
        }
    }

    /// Promote, then look up where `task` stands. Rejoins the queue if its
    /// entry was discarded (e.g. by a reset).
    async fn recheck(&self, task: &TaskId) -> Result<bool, StoreError> {
        let policy = self.config.policy();
        self.store.promote(&policy).await?;

        match self.store.position(task).await? {
            SlotPosition::Active => Ok(true),
            SlotPosition::Queued => Ok(false),
            SlotPosition::Absent => {
                tracing::debug!(task_id = %task, "Queue entry gone, rejoining");
                let admit = self.store.admit(task, &policy).await?;
                Ok(matches!(admit, Admit::Granted | Admit::AlreadyActive))
            }
        }
    }

    /// Leave the queue. A grant that raced with the withdrawal is handed back.
    async fn abandon(&self, task: &TaskId, reason: AdmissionError) -> Result<(), AdmissionError> {
        match self.store.withdraw(task).await {
            Ok(Withdrawal::AlreadyGranted) => {
                if let Err(e) = self.store.release(task, &self.config.policy()).await {
                    tracing::error!(task_id = %task, error = %e, "Failed to return slot granted during abandon");
                }
            }
            Ok(Withdrawal::Withdrawn | Withdrawal::NotQueued) => {}
            Err(e) => {
                tracing::warn!(task_id = %task, error = %e, "Failed to withdraw from wait queue");
            }
        }
        tracing::info!(task_id = %task, reason = %reason, "Gave up waiting for a slot");
        Err(reason)
    }

    async fn on_admitted(&self, task: &TaskId) {
        // Metadata is bookkeeping only; a failed write never blocks admission.
        if let Err(e) = self
            .store
            .write_metadata(task, &TaskMetadata::active(), self.config.metadata_ttl)
            .await
        {
            tracing::warn!(task_id = %task, error = %e, "Failed to record task metadata");
        }

        if let Some(lease) = self.config.lease_ttl {
            self.spawn_heartbeat(task.clone(), lease);
        }
        tracing::info!(task_id = %task, "Slot acquired");
    }

    fn spawn_heartbeat(&self, task: TaskId, lease: Duration) {
        let store = Arc::clone(&self.store);
        let policy = self.config.policy();
        let period = (lease / 3).max(Duration::from_millis(10));
        let key = task.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.reset();
            loop {
                ticker.tick().await;
                match store.renew(&task, &policy).await {
                    Ok(true) => tracing::trace!(task_id = %task, "Lease renewed"),
                    Ok(false) => {
                        tracing::warn!(task_id = %task, "Lease lost - slot no longer held");
                        return;
                    }
                    Err(e) => tracing::warn!(task_id = %task, error = %e, "Lease renewal failed"),
                }
            }
        });

        if let Some(previous) = self.heartbeats.insert(key, handle) {
            previous.abort();
        }
    }

    /// Return the slot held by `task_id`. Releasing a task without a slot is a no-op.
    pub async fn release(&self, task_id: &str) -> Result<(), AdmissionError> {
        let task = TaskId::parse(task_id)?;
        if let Some((_, heartbeat)) = self.heartbeats.remove(&task) {
            heartbeat.abort();
        }

        let released = self.store.release(&task, &self.config.policy()).await?;

        if let Err(e) = self
            .store
            .write_metadata(&task, &TaskMetadata::completed(), self.config.metadata_ttl)
            .await
        {
            tracing::warn!(task_id = %task, error = %e, "Failed to record task metadata");
        }

        if released.was_active {
            tracing::info!(task_id = %task, promoted = released.promoted, "Slot released");
        } else {
            tracing::debug!(task_id = %task, "Release for task without a slot");
        }
        Ok(())
    }

    pub async fn stats(&self) -> Result<SlotStats, AdmissionError> {
        let active = self.store.active_count().await?;
        let queued = self.store.queue_len().await?;
        Ok(SlotStats {
            active,
            queued,
            max: self.config.max_concurrent,
        })
    }

    /// Queued tasks, head first, with the time each joined the queue.
    pub async fn waiting(&self) -> Result<Vec<QueuedTask>, AdmissionError> {
        Ok(self.store.waiting().await?)
    }

    pub async fn metadata(&self, task_id: &str) -> Result<Option<TaskMetadata>, AdmissionError> {
        let task = TaskId::parse(task_id)?;
        Ok(self.store.read_metadata(&task).await?)
    }

    /// Clear all slots and the queue. Waiters still pending anywhere re-check
    /// on the resulting notification and rejoin.
    pub async fn reset(&self) -> Result<ResetReport, AdmissionError> {
        let report = self.store.reset().await?;
        self.heartbeats.retain(|_, handle| {
            handle.abort();
            false
        });
        tracing::warn!(
            cleared_active = report.cleared_active,
            cleared_queued = report.cleared_queued,
            "Admission state reset"
        );
        Ok(report)
    }

    pub async fn ping(&self) -> Result<(), AdmissionError> {
        Ok(self.store.ping().await?)
    }
}

//! Process-local routing of store notifications to waiting callers.
//!
//! One dispatcher per controller holds the store subscription. A `Granted`
//! event wakes only the waiter it names; `Reset` (or a resubscription, after
//! which events may have been missed) wakes every local waiter to re-check.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::AdmissionError;
use crate::store::{CoordinationStore, Notification};
use crate::task::TaskId;

const RESUBSCRIBE_BASE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Signal {
    /// The store moved this waiter into the active registry.
    Granted,
    /// State may have changed in a way that was not announced per task.
    Recheck,
}

#[derive(Default)]
pub(super) struct Waiters {
    inner: DashMap<TaskId, mpsc::UnboundedSender<Signal>>,
}

impl Waiters {
    pub fn register(self: &Arc<Self>, task: &TaskId) -> Result<WaiterHandle, AdmissionError> {
        match self.inner.entry(task.clone()) {
            Entry::Occupied(_) => Err(AdmissionError::AlreadyWaiting(task.to_string())),
            Entry::Vacant(slot) => {
                let (tx, rx) = mpsc::unbounded_channel();
                slot.insert(tx);
                Ok(WaiterHandle {
                    task: task.clone(),
                    rx,
                    waiters: Arc::clone(self),
                })
            }
        }
    }

    pub fn route(&self, notification: Notification) {
        match notification {
            Notification::Granted { task_id } => {
                let Ok(task) = TaskId::parse(&task_id) else {
                    tracing::warn!(%task_id, "Grant for malformed task id");
                    return;
                };
                if let Some(tx) = self.inner.get(&task) {
                    let _ = tx.send(Signal::Granted);
                }
            }
            Notification::Reset => self.recheck_all(),
        }
    }

    pub fn recheck_all(&self) {
        for entry in self.inner.iter() {
            let _ = entry.value().send(Signal::Recheck);
        }
    }

    /// Drops every sender; pending waiters observe a closed channel.
    pub fn close_all(&self) {
        self.inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

/// Registration of one pending `acquire`; unregisters on drop.
pub(super) struct WaiterHandle {
    task: TaskId,
    rx: mpsc::UnboundedReceiver<Signal>,
    waiters: Arc<Waiters>,
}

impl WaiterHandle {
    pub async fn recv(&mut self) -> Option<Signal> {
        self.rx.recv().await
    }
}

impl Drop for WaiterHandle {
    fn drop(&mut self) {
        self.waiters.inner.remove(&self.task);
    }
}

/// Subscribe to store notifications and route them until cancelled,
/// resubscribing with exponential backoff when the stream ends.
pub(super) async fn dispatch(
    store: Arc<dyn CoordinationStore>,
    waiters: Arc<Waiters>,
    token: CancellationToken,
) {
    let mut attempt: u32 = 0;
    loop {
        let subscription = tokio::select! {
            _ = token.cancelled() => return,
            subscription = store.subscribe() => subscription,
        };

        match subscription {
            Ok(mut events) => {
                if attempt > 0 {
                    tracing::info!(attempt, "Resubscribed to slot notifications");
                    waiters.recheck_all();
                }
                attempt = 0;

                loop {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        event = events.next() => match event {
                            Some(notification) => waiters.route(notification),
                            None => {
                                tracing::warn!("Slot notification stream ended");
                                break;
                            }
                        },
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, attempt, "Failed to subscribe to slot notifications");
            }
        }

        attempt += 1;
        let backoff = RESUBSCRIBE_BASE * (1 << attempt.min(6));
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: &str) -> TaskId {
        TaskId::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn grant_reaches_only_named_waiter() {
        let waiters = Arc::new(Waiters::default());
        let mut a = waiters.register(&id("a")).unwrap();
        let mut b = waiters.register(&id("b")).unwrap();

        waiters.route(Notification::Granted {
            task_id: "b".to_string(),
        });

        assert_eq!(b.recv().await, Some(Signal::Granted));
        assert!(a.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn reset_wakes_everyone() {
        let waiters = Arc::new(Waiters::default());
        let mut a = waiters.register(&id("a")).unwrap();
        let mut b = waiters.register(&id("b")).unwrap();

        waiters.route(Notification::Reset);

        assert_eq!(a.recv().await, Some(Signal::Recheck));
        assert_eq!(b.recv().await, Some(Signal::Recheck));
    }

    #[test]
    fn duplicate_registration_is_rejected_until_dropped() {
        let waiters = Arc::new(Waiters::default());
        let handle = waiters.register(&id("a")).unwrap();
        assert!(matches!(
            waiters.register(&id("a")),
            Err(AdmissionError::AlreadyWaiting(_))
        ));

        drop(handle);
        assert_eq!(waiters.len(), 0);
        assert!(waiters.register(&id("a")).is_ok());
    }

    #[tokio::test]
    async fn close_all_ends_pending_waits() {
        let waiters = Arc::new(Waiters::default());
        let mut a = waiters.register(&id("a")).unwrap();
        waiters.close_all();
        assert_eq!(a.recv().await, None);
    }
}

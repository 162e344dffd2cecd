//! Redis-backed [`CoordinationStore`].
//!
//! Commands share one multiplexed [`ConnectionManager`], which reconnects
//! with bounded exponential backoff. Notifications use a dedicated pub/sub
//! connection per subscription.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, Script, ScriptInvocation};

use super::scripts::Scripts;
use super::{
    Admit, CoordinationStore, Notification, QueuedTask, Released, ResetReport, SlotPolicy,
    StoreError, Subscription, Withdrawal,
};
use crate::task::{SlotPosition, TaskId, TaskMetadata};

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub redis_url: String,
    /// Namespace for every key and the events channel.
    pub key_prefix: String,
    pub connect_retries: usize,
    /// Base delay of the reconnect backoff.
    pub retry_factor: Duration,
    pub response_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "slotgate".to_string(),
            connect_retries: 6,
            retry_factor: Duration::from_millis(100),
            response_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Keys {
    active: String,
    queue: String,
    enqueued: String,
    channel: String,
    prefix: String,
}

impl Keys {
    fn new(prefix: &str) -> Self {
        Self {
            active: format!("{prefix}:active"),
            queue: format!("{prefix}:queue"),
            enqueued: format!("{prefix}:enqueued"),
            channel: format!("{prefix}:events"),
            prefix: prefix.to_string(),
        }
    }

    fn metadata(&self, task: &TaskId) -> String {
        format!("{}:task:{}", self.prefix, task)
    }
}

pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
    keys: Keys,
    scripts: Scripts,
}

impl RedisStore {
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let client = redis::Client::open(config.redis_url.as_str())?;

        let manager_config = ConnectionManagerConfig::new()
            .set_number_of_retries(config.connect_retries)
            .set_exponent_base(2)
            .set_factor(config.retry_factor.as_millis() as u64)
            .set_response_timeout(config.response_timeout);
        let conn = ConnectionManager::new_with_config(client.clone(), manager_config).await?;

        tracing::info!(prefix = %config.key_prefix, "Connected to coordination store");

        Ok(Self {
            client,
            conn,
            keys: Keys::new(&config.key_prefix),
            scripts: Scripts::load(),
        })
    }

    /// Script invocation with the fixed `active, queue, enqueued` key triple.
    fn invoke<'a>(&self, script: &'a Script) -> ScriptInvocation<'a> {
        let mut invocation = script.prepare_invoke();
        invocation
            .key(&self.keys.active)
            .key(&self.keys.queue)
            .key(&self.keys.enqueued);
        invocation
    }
}

fn lease_ms(policy: &SlotPolicy) -> u64 {
    // 0 tells the scripts "no lease"; clamp sub-millisecond leases to 1.
    policy
        .lease
        .map_or(0, |lease| (lease.as_millis() as u64).max(1))
}

fn decode_position(code: i64) -> Result<SlotPosition, StoreError> {
    match code {
        1 => Ok(SlotPosition::Active),
        2 => Ok(SlotPosition::Queued),
        0 => Ok(SlotPosition::Absent),
        other => Err(StoreError::Decode(format!("unknown position code {other}"))),
    }
}

fn decode_admit(code: i64) -> Result<Admit, StoreError> {
    match code {
        1 => Ok(Admit::Granted),
        0 => Ok(Admit::Queued),
        2 => Ok(Admit::AlreadyActive),
        other => Err(StoreError::Decode(format!("unknown admit code {other}"))),
    }
}

fn decode_withdrawal(code: i64) -> Result<Withdrawal, StoreError> {
    match code {
        1 => Ok(Withdrawal::Withdrawn),
        2 => Ok(Withdrawal::AlreadyGranted),
        0 => Ok(Withdrawal::NotQueued),
        other => Err(StoreError::Decode(format!("unknown withdraw code {other}"))),
    }
}

fn decode_waiting(
    ids: Vec<String>,
    stamps: HashMap<String, i64>,
) -> Result<Vec<QueuedTask>, StoreError> {
    ids.into_iter()
        .map(|task_id| {
            let millis = stamps
                .get(&task_id)
                .copied()
                .ok_or_else(|| StoreError::Decode(format!("no enqueue time for {task_id}")))?;
            let enqueued_at = DateTime::<Utc>::from_timestamp_millis(millis)
                .ok_or_else(|| StoreError::Decode(format!("bad enqueue time {millis}")))?;
            Ok(QueuedTask {
                task_id,
                enqueued_at,
            })
        })
        .collect()
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn admit(&self, task: &TaskId, policy: &SlotPolicy) -> Result<Admit, StoreError> {
        let mut conn = self.conn.clone();
        let code: i64 = self
            .invoke(&self.scripts.admit)
            .arg(task.as_str())
            .arg(policy.capacity)
            .arg(lease_ms(policy))
            .arg(&self.keys.channel)
            .invoke_async(&mut conn)
            .await?;
        decode_admit(code)
    }

    async fn promote(&self, policy: &SlotPolicy) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let promoted: usize = self
            .invoke(&self.scripts.promote)
            .arg(policy.capacity)
            .arg(lease_ms(policy))
            .arg(&self.keys.channel)
            .invoke_async(&mut conn)
            .await?;
        Ok(promoted)
    }

    async fn release(&self, task: &TaskId, policy: &SlotPolicy) -> Result<Released, StoreError> {
        let mut conn = self.conn.clone();
        let (removed, promoted): (i64, usize) = self
            .invoke(&self.scripts.release)
            .arg(task.as_str())
            .arg(policy.capacity)
            .arg(lease_ms(policy))
            .arg(&self.keys.channel)
            .invoke_async(&mut conn)
            .await?;
        Ok(Released {
            was_active: removed > 0,
            promoted,
        })
    }

    async fn renew(&self, task: &TaskId, policy: &SlotPolicy) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let renewed: i64 = self
            .invoke(&self.scripts.renew)
            .arg(task.as_str())
            .arg(lease_ms(policy))
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn withdraw(&self, task: &TaskId) -> Result<Withdrawal, StoreError> {
        let mut conn = self.conn.clone();
        let code: i64 = self
            .invoke(&self.scripts.withdraw)
            .arg(task.as_str())
            .invoke_async(&mut conn)
            .await?;
        decode_withdrawal(code)
    }

    async fn position(&self, task: &TaskId) -> Result<SlotPosition, StoreError> {
        let mut conn = self.conn.clone();
        let code: i64 = self
            .invoke(&self.scripts.position)
            .arg(task.as_str())
            .invoke_async(&mut conn)
            .await?;
        decode_position(code)
    }

    async fn active_count(&self) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let count: usize = conn.zcard(&self.keys.active).await?;
        Ok(count)
    }

    async fn queue_len(&self) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(&self.keys.queue).await?;
        Ok(len)
    }

    async fn waiting(&self) -> Result<Vec<QueuedTask>, StoreError> {
        let mut conn = self.conn.clone();
        let (ids, stamps): (Vec<String>, HashMap<String, i64>) = redis::pipe()
            .atomic()
            .lrange(&self.keys.queue, 0, -1)
            .hgetall(&self.keys.enqueued)
            .query_async(&mut conn)
            .await?;
        decode_waiting(ids, stamps)
    }

    async fn reset(&self) -> Result<ResetReport, StoreError> {
        let mut conn = self.conn.clone();
        let (cleared_active, cleared_queued): (usize, usize) = self
            .invoke(&self.scripts.reset)
            .arg(&self.keys.channel)
            .invoke_async(&mut conn)
            .await?;
        Ok(ResetReport {
            cleared_active,
            cleared_queued,
        })
    }

    async fn write_metadata(
        &self,
        task: &TaskId,
        metadata: &TaskMetadata,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let payload =
            serde_json::to_string(metadata).map_err(|e| StoreError::Decode(e.to_string()))?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(self.keys.metadata(task), payload, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn read_metadata(&self, task: &TaskId) -> Result<Option<TaskMetadata>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.keys.metadata(task)).await?;
        raw.map(|payload| {
            serde_json::from_str(&payload).map_err(|e| StoreError::Decode(e.to_string()))
        })
        .transpose()
    }

    async fn subscribe(&self) -> Result<Subscription, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.keys.channel).await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping unreadable notification");
                    return None;
                }
            };
            match serde_json::from_str::<Notification>(&payload) {
                Ok(notification) => Some(notification),
                Err(e) => {
                    tracing::warn!(error = %e, %payload, "Dropping malformed notification");
                    None
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

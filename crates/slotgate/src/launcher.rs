//! Background execution of evaluation jobs behind the admission controller.
//!
//! Each launched job runs acquire -> evaluate -> release -> callback on its
//! own task. The slot is returned whether or not evaluation succeeds.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::task::TaskTracker;

use crate::admission::{AdmissionController, AdmissionError};
use crate::task::TaskId;
use crate::webhook::{CallbackPayload, CallbackSender};

/// One unit of work submitted through `/mass-evaluation/start`.
#[derive(Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EvaluationJob {
    pub task_id: String,
    pub batch_id: String,
    pub file_url: String,
    pub question_description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_token: Option<String>,
    pub callback_url: String,
}

impl fmt::Debug for EvaluationJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvaluationJob")
            .field("task_id", &self.task_id)
            .field("batch_id", &self.batch_id)
            .field("file_url", &self.file_url)
            .field("user_token", &self.user_token.as_ref().map(|_| "<redacted>"))
            .field("callback_url", &self.callback_url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("Invalid taskId {0:?}")]
    InvalidTaskId(String),
}

impl EvaluationJob {
    pub fn validate(&self) -> Result<(), JobError> {
        let required = [
            ("taskId", &self.task_id),
            ("batchId", &self.batch_id),
            ("fileUrl", &self.file_url),
            ("questionDescription", &self.question_description),
            ("callbackUrl", &self.callback_url),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(JobError::MissingField(name));
            }
        }
        TaskId::parse(&self.task_id).map_err(|_| JobError::InvalidTaskId(self.task_id.clone()))?;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("evaluator request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("evaluator returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("{0}")]
    Failed(String),
}

/// The workload a slot guards.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, job: &EvaluationJob) -> Result<Value, EvaluationError>;
}

/// Forwards jobs to an HTTP evaluation endpoint and returns its JSON reply.
pub struct HttpEvaluator {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpEvaluator {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, EvaluationError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            endpoint: endpoint.into(),
            client,
        })
    }
}

#[async_trait]
impl Evaluator for HttpEvaluator {
    async fn evaluate(&self, job: &EvaluationJob) -> Result<Value, EvaluationError> {
        let mut request = self.client.post(&self.endpoint).json(job);
        if let Some(token) = &job.user_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EvaluationError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}

/// Runs jobs in the background and reports each outcome to its callback URL.
#[derive(Clone)]
pub struct TaskLauncher {
    controller: Arc<AdmissionController>,
    evaluator: Arc<dyn Evaluator>,
    callbacks: CallbackSender,
    tracker: TaskTracker,
}

impl TaskLauncher {
    pub fn new(
        controller: Arc<AdmissionController>,
        evaluator: Arc<dyn Evaluator>,
        callbacks: CallbackSender,
    ) -> Self {
        Self {
            controller,
            evaluator,
            callbacks,
            tracker: TaskTracker::new(),
        }
    }

    /// Start `job` in the background. Fails only once draining has begun.
    pub fn launch(&self, job: EvaluationJob) -> Result<(), AdmissionError> {
        if self.tracker.is_closed() {
            return Err(AdmissionError::Closed);
        }

        let controller = Arc::clone(&self.controller);
        let evaluator = Arc::clone(&self.evaluator);
        let callbacks = self.callbacks.clone();

        self.tracker.spawn(async move {
            let payload = run(&controller, evaluator.as_ref(), &job).await;
            callbacks.deliver(&job.callback_url, &payload).await;
        });
        Ok(())
    }

    /// Refuse new launches and wait up to `timeout` for in-flight ones.
    /// Returns whether everything finished in time.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tracker.close();
        let pending = self.tracker.len();
        if pending > 0 {
            tracing::info!(pending, "Waiting for in-flight evaluations");
        }

        let drained = tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok();
        if !drained {
            tracing::warn!(remaining = self.tracker.len(), "Drain timed out");
        }
        drained
    }
}

async fn run(
    controller: &AdmissionController,
    evaluator: &dyn Evaluator,
    job: &EvaluationJob,
) -> CallbackPayload {
    if let Err(e) = controller.acquire(&job.task_id).await {
        tracing::error!(task_id = %job.task_id, error = %e, "Failed to acquire slot");
        return CallbackPayload::failed(&job.task_id, &job.batch_id, e);
    }

    tracing::info!(task_id = %job.task_id, batch_id = %job.batch_id, "Evaluation started");
    // A panicking evaluator must still reach the release below.
    let outcome = match AssertUnwindSafe(evaluator.evaluate(job)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic_err) => {
            let info = {
                let any = &*panic_err;
                if let Some(msg) = any.downcast_ref::<&'static str>() {
                    (*msg).to_string()
                } else if let Some(msg) = any.downcast_ref::<String>() {
                    msg.clone()
                } else {
                    "unknown panic".to_string()
                }
            };
            tracing::error!(task_id = %job.task_id, panic = %info, "Evaluator panicked");
            Err(EvaluationError::Failed(format!("evaluator panicked: {info}")))
        }
    };

    if let Err(e) = controller.release(&job.task_id).await {
        tracing::error!(task_id = %job.task_id, error = %e, "Failed to release slot");
    }

    match outcome {
        Ok(result) => {
            tracing::info!(task_id = %job.task_id, "Evaluation succeeded");
            CallbackPayload::succeeded(&job.task_id, &job.batch_id, result)
        }
        Err(e) => {
            tracing::warn!(task_id = %job.task_id, error = %e, "Evaluation failed");
            CallbackPayload::failed(&job.task_id, &job.batch_id, e)
        }
    }
}

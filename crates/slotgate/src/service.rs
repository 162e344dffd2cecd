//! EvaluationService: transport-agnostic front for mass evaluation.
//!
//! Owns the admission controller and the launcher. Transports validate
//! nothing themselves; they hand requests here and map the errors.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::admission::{AdmissionController, AdmissionError, SlotStats};
use crate::launcher::{EvaluationJob, JobError, TaskLauncher};
use crate::store::{QueuedTask, ResetReport};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    InvalidJob(#[from] JobError),
    #[error(transparent)]
    Admission(#[from] AdmissionError),
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub stats: SlotStats,
    pub waiting: Vec<QueuedTask>,
}

pub struct EvaluationService {
    controller: Arc<AdmissionController>,
    launcher: TaskLauncher,
}

impl EvaluationService {
    pub fn new(controller: Arc<AdmissionController>, launcher: TaskLauncher) -> Self {
        Self {
            controller,
            launcher,
        }
    }

    pub fn controller(&self) -> &Arc<AdmissionController> {
        &self.controller
    }

    /// Validate and launch. Returns the accepted task id.
    pub fn start(&self, job: EvaluationJob) -> Result<String, ServiceError> {
        job.validate()?;
        let task_id = job.task_id.clone();
        self.launcher.launch(job)?;
        tracing::info!(task_id = %task_id, "Evaluation accepted");
        Ok(task_id)
    }

    pub async fn stats(&self) -> Result<StatsSnapshot, AdmissionError> {
        let stats = self.controller.stats().await?;
        let waiting = self.controller.waiting().await?;
        Ok(StatsSnapshot { stats, waiting })
    }

    pub async fn clear_slots(&self) -> Result<ResetReport, AdmissionError> {
        self.controller.reset().await
    }

    pub async fn healthy(&self) -> bool {
        match self.controller.ping().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Coordination store unreachable");
                false
            }
        }
    }

    /// Stop accepting work, wait for in-flight evaluations, then stop the controller.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        self.launcher.drain(drain_timeout).await;
        self.controller.shutdown().await;
    }
}

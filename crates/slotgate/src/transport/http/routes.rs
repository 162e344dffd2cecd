//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
};
use serde_json::json;

use crate::admission::AdmissionError;
use crate::launcher::EvaluationJob;
use crate::service::{EvaluationService, ServiceError};
use crate::version::SLOTGATE_VERSION;

fn failure(status: StatusCode, error: impl ToString) -> (StatusCode, Json<serde_json::Value>) {
    (
        status,
        Json(json!({
            "success": false,
            "error": error.to_string(),
        })),
    )
}

fn admission_status(error: &AdmissionError) -> StatusCode {
    match error {
        AdmissionError::Store(_) | AdmissionError::Closed => StatusCode::SERVICE_UNAVAILABLE,
        AdmissionError::InvalidTaskId(_) => StatusCode::BAD_REQUEST,
        AdmissionError::AlreadyActive(_) | AdmissionError::AlreadyWaiting(_) => {
            StatusCode::CONFLICT
        }
        AdmissionError::Cancelled | AdmissionError::TimedOut => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn start_evaluation(
    State(service): State<Arc<EvaluationService>>,
    body: Result<Json<EvaluationJob>, JsonRejection>,
) -> impl IntoResponse {
    let job = match body {
        Ok(Json(job)) => job,
        Err(rejection) => return failure(StatusCode::BAD_REQUEST, rejection.body_text()),
    };

    match service.start(job) {
        Ok(task_id) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "success": true,
                "taskId": task_id,
                "status": "started",
            })),
        ),
        Err(ServiceError::InvalidJob(e)) => failure(StatusCode::BAD_REQUEST, e),
        Err(ServiceError::Admission(e)) => failure(admission_status(&e), e),
    }
}

async fn stats(State(service): State<Arc<EvaluationService>>) -> impl IntoResponse {
    match service.stats().await {
        Ok(snapshot) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "stats": snapshot.stats,
                "waiting": snapshot.waiting,
            })),
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to read slot stats");
            failure(admission_status(&e), e)
        }
    }
}

async fn clear_slots(State(service): State<Arc<EvaluationService>>) -> impl IntoResponse {
    match service.clear_slots().await {
        Ok(cleared) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "cleared": cleared,
            })),
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to clear slots");
            failure(admission_status(&e), e)
        }
    }
}

async fn health_check(State(service): State<Arc<EvaluationService>>) -> impl IntoResponse {
    if service.healthy().await {
        (
            StatusCode::OK,
            Json(json!({"status": "ok", "version": SLOTGATE_VERSION})),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "unavailable", "version": SLOTGATE_VERSION})),
        )
    }
}

pub fn routes(service: Arc<EvaluationService>) -> Router {
    Router::new()
        .route("/health-check", get(health_check))
        .route("/mass-evaluation/start", post(start_evaluation))
        .route("/mass-evaluation/stats", get(stats))
        .route("/mass-evaluation/clear-slots", post(clear_slots))
        .with_state(service)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::admission::AdmissionController;
    use crate::config::AdmissionConfig;
    use crate::launcher::{EvaluationError, Evaluator, TaskLauncher};
    use crate::store::{
        Admit, CoordinationStore, MemoryStore, QueuedTask, Released, ResetReport, SlotPolicy,
        StoreError, Subscription, Withdrawal,
    };
    use crate::task::{SlotPosition, TaskId, TaskMetadata};
    use crate::webhook::CallbackSender;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn response_json(response: axum::response::Response) -> serde_json::Value {
        let body = response.into_body();
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    struct Graded;

    #[async_trait::async_trait]
    impl Evaluator for Graded {
        async fn evaluate(&self, _job: &EvaluationJob) -> Result<serde_json::Value, EvaluationError> {
            Ok(json!({"grade": "A"}))
        }
    }

    fn service_with(store: Arc<dyn CoordinationStore>, max_concurrent: usize) -> Arc<EvaluationService> {
        let controller = Arc::new(AdmissionController::new(
            store,
            AdmissionConfig {
                max_concurrent,
                lease_ttl: None,
                recheck_interval: Duration::from_millis(20),
                ..Default::default()
            },
        ));
        controller.start();
        let launcher = TaskLauncher::new(
            controller.clone(),
            Arc::new(Graded),
            CallbackSender::with_auth_token(None).unwrap(),
        );
        Arc::new(EvaluationService::new(controller, launcher))
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_check_reports_ok_and_version() {
        let app = routes(service_with(Arc::new(MemoryStore::new()), 2));

        let response = app
            .oneshot(Request::get("/health-check").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["version"], SLOTGATE_VERSION);
    }

    #[tokio::test]
    async fn start_rejects_missing_field() {
        let app = routes(service_with(Arc::new(MemoryStore::new()), 2));

        let response = app
            .oneshot(post_json(
                "/mass-evaluation/start",
                json!({"taskId": "t1", "batchId": "b1"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = response_json(response).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "Missing required field: fileUrl");
    }

    #[tokio::test]
    async fn start_rejects_malformed_body() {
        let app = routes(service_with(Arc::new(MemoryStore::new()), 2));

        let response = app
            .oneshot(
                Request::post("/mass-evaluation/start")
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response_json(response).await["success"], false);
    }

    #[tokio::test]
    async fn start_accepts_and_calls_back() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/cb"))
            .and(body_partial_json(json!({
                "taskId": "t1",
                "batchId": "b1",
                "success": true,
                "result": {"grade": "A"}
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let service = service_with(Arc::new(MemoryStore::new()), 2);
        let app = routes(service.clone());

        let response = app
            .oneshot(post_json(
                "/mass-evaluation/start",
                json!({
                    "taskId": "t1",
                    "batchId": "b1",
                    "fileUrl": "https://files.test/a.pdf",
                    "questionDescription": "Describe borrowing",
                    "callbackUrl": format!("{}/cb", server.uri()),
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let json = response_json(response).await;
        assert_eq!(
            json,
            json!({"success": true, "taskId": "t1", "status": "started"})
        );

        service.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn stats_lists_waiting_tasks() {
        let service = service_with(Arc::new(MemoryStore::new()), 1);
        let controller = service.controller().clone();
        controller.acquire("holder").await.unwrap();
        let waiter = tokio::spawn({
            let controller = controller.clone();
            async move { controller.acquire("queued-1").await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let response = routes(service.clone())
            .oneshot(
                Request::get("/mass-evaluation/stats")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["stats"], json!({"active": 1, "queued": 1, "max": 1}));
        assert_eq!(json["waiting"][0]["taskId"], "queued-1");
        assert!(json["waiting"][0]["enqueuedAt"].is_string());

        controller.release("holder").await.unwrap();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn clear_slots_reports_cleared_counts() {
        let service = service_with(Arc::new(MemoryStore::new()), 2);
        service.controller().acquire("a").await.unwrap();
        service.controller().acquire("b").await.unwrap();

        let response = routes(service)
            .oneshot(
                Request::post("/mass-evaluation/clear-slots")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(
            json,
            json!({
                "success": true,
                "cleared": {"clearedActive": 2, "clearedQueued": 0}
            })
        );
    }

    /// A store whose backend is down.
    struct Unreachable;

    fn down() -> StoreError {
        StoreError::Closed
    }

    #[async_trait::async_trait]
    impl CoordinationStore for Unreachable {
        async fn admit(&self, _: &TaskId, _: &SlotPolicy) -> Result<Admit, StoreError> {
            Err(down())
        }
        async fn promote(&self, _: &SlotPolicy) -> Result<usize, StoreError> {
            Err(down())
        }
        async fn release(&self, _: &TaskId, _: &SlotPolicy) -> Result<Released, StoreError> {
            Err(down())
        }
        async fn renew(&self, _: &TaskId, _: &SlotPolicy) -> Result<bool, StoreError> {
            Err(down())
        }
        async fn withdraw(&self, _: &TaskId) -> Result<Withdrawal, StoreError> {
            Err(down())
        }
        async fn position(&self, _: &TaskId) -> Result<SlotPosition, StoreError> {
            Err(down())
        }
        async fn active_count(&self) -> Result<usize, StoreError> {
            Err(down())
        }
        async fn queue_len(&self) -> Result<usize, StoreError> {
            Err(down())
        }
        async fn waiting(&self) -> Result<Vec<QueuedTask>, StoreError> {
            Err(down())
        }
        async fn reset(&self) -> Result<ResetReport, StoreError> {
            Err(down())
        }
        async fn write_metadata(
            &self,
            _: &TaskId,
            _: &TaskMetadata,
            _: Duration,
        ) -> Result<(), StoreError> {
            Err(down())
        }
        async fn read_metadata(&self, _: &TaskId) -> Result<Option<TaskMetadata>, StoreError> {
            Err(down())
        }
        async fn subscribe(&self) -> Result<Subscription, StoreError> {
            Err(down())
        }
        async fn ping(&self) -> Result<(), StoreError> {
            Err(down())
        }
    }

    #[tokio::test]
    async fn store_outage_maps_to_503() {
        let service = service_with(Arc::new(Unreachable), 2);

        let stats = routes(service.clone())
            .oneshot(
                Request::get("/mass-evaluation/stats")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(stats.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response_json(stats).await["success"], false);

        let cleared = routes(service.clone())
            .oneshot(
                Request::post("/mass-evaluation/clear-slots")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(cleared.status(), StatusCode::SERVICE_UNAVAILABLE);

        let health = routes(service)
            .oneshot(Request::get("/health-check").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response_json(health).await["status"], "unavailable");
    }
}

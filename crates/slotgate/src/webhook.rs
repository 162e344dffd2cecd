//! Completion callbacks for launched evaluations.
//!
//! One POST per task to the caller-supplied `callbackUrl`:
//! - JSON body `{taskId, batchId, success, result | error}`
//! - WEBHOOK_AUTH_TOKEN bearer authentication
//! - Best effort: failures are logged, never retried

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::version::SLOTGATE_VERSION;

const CALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackPayload {
    pub task_id: String,
    pub batch_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CallbackPayload {
    pub fn succeeded(task_id: &str, batch_id: &str, result: Value) -> Self {
        Self {
            task_id: task_id.to_string(),
            batch_id: batch_id.to_string(),
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(task_id: &str, batch_id: &str, error: impl ToString) -> Self {
        Self {
            task_id: task_id.to_string(),
            batch_id: batch_id.to_string(),
            success: false,
            result: None,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct CallbackSender {
    client: reqwest::Client,
}

impl CallbackSender {
    /// Build a sender, picking up `WEBHOOK_AUTH_TOKEN` from the environment.
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_auth_token(std::env::var("WEBHOOK_AUTH_TOKEN").ok())
    }

    pub fn with_auth_token(token: Option<String>) -> Result<Self, reqwest::Error> {
        let mut headers = reqwest::header::HeaderMap::new();

        if let Some(token) = token
            && let Ok(value) = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", token))
        {
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }

        let user_agent = format!("slotgate/{}", SLOTGATE_VERSION);
        if let Ok(value) = reqwest::header::HeaderValue::from_str(&user_agent) {
            headers.insert(reqwest::header::USER_AGENT, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(CALLBACK_TIMEOUT)
            .build()?;

        Ok(Self { client })
    }

    /// POST the payload and log the outcome. Never fails the caller.
    pub async fn deliver(&self, url: &str, payload: &CallbackPayload) {
        match self.client.post(url).json(payload).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(
                    task_id = %payload.task_id,
                    status = %response.status(),
                    "Callback delivered"
                );
            }
            Ok(response) => {
                tracing::warn!(
                    task_id = %payload.task_id,
                    status = %response.status(),
                    "Callback rejected"
                );
            }
            Err(e) => {
                tracing::warn!(task_id = %payload.task_id, error = %e, "Failed to send callback");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn payload_wire_shape() {
        let ok = CallbackPayload::succeeded("t1", "b1", serde_json::json!({"score": 7}));
        insta::assert_json_snapshot!(ok, @r#"
        {
          "taskId": "t1",
          "batchId": "b1",
          "success": true,
          "result": {
            "score": 7
          }
        }
        "#);

        let failed = CallbackPayload::failed("t2", "b1", "evaluator unreachable");
        insta::assert_json_snapshot!(failed, @r#"
        {
          "taskId": "t2",
          "batchId": "b1",
          "success": false,
          "error": "evaluator unreachable"
        }
        "#);
    }

    #[tokio::test]
    async fn deliver_posts_json_with_headers() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/callback"))
            .and(header("authorization", "Bearer secret"))
            .and(header(
                "user-agent",
                format!("slotgate/{}", SLOTGATE_VERSION).as_str(),
            ))
            .and(body_json(serde_json::json!({
                "taskId": "t1",
                "batchId": "b1",
                "success": true,
                "result": {"score": 1}
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sender = CallbackSender::with_auth_token(Some("secret".into())).unwrap();
        sender
            .deliver(
                &format!("{}/callback", server.uri()),
                &CallbackPayload::succeeded("t1", "b1", serde_json::json!({"score": 1})),
            )
            .await;
    }

    #[tokio::test]
    async fn deliver_does_not_retry_on_500() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/callback"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let sender = CallbackSender::with_auth_token(None).unwrap();
        sender
            .deliver(
                &format!("{}/callback", server.uri()),
                &CallbackPayload::failed("t1", "b1", "boom"),
            )
            .await;
    }

    #[tokio::test]
    async fn deliver_tolerates_unreachable_endpoint() {
        let sender = CallbackSender::with_auth_token(None).unwrap();
        sender
            .deliver(
                "http://127.0.0.1:9/callback",
                &CallbackPayload::failed("t1", "b1", "boom"),
            )
            .await;
    }
}

//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::bridge::CommandExecutor;
use crate::health::HealthSnapshot;

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub command: String,
}

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub output: String,
}

async fn execute(
    State(executor): State<Arc<dyn CommandExecutor>>,
    Json(request): Json<ExecuteRequest>,
) -> axum::response::Response {
    match executor.execute(&request.command).await {
        Ok(outcome) => Json(ExecuteResponse {
            output: outcome.into_output(),
        })
        .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "command dispatch failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn health_check(
    State(executor): State<Arc<dyn CommandExecutor>>,
) -> Json<HealthSnapshot> {
    Json(executor.health().await)
}

pub fn routes(executor: Arc<dyn CommandExecutor>) -> Router {
    Router::new()
        .route("/execute", post(execute))
        .route("/health-check", get(health_check))
        .with_state(executor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{BridgeError, ExecuteOutcome};
    use crate::child::SpawnError;
    use crate::health::{BRIDGELET_VERSION, ChildStatus};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    enum MockMode {
        Echo,
        TimeOut,
        Fail,
    }

    struct MockExecutor {
        mode: MockMode,
    }

    #[async_trait]
    impl CommandExecutor for MockExecutor {
        async fn execute(&self, command: &str) -> Result<ExecuteOutcome, BridgeError> {
            match self.mode {
                MockMode::Echo => Ok(ExecuteOutcome::Completed(format!("OK|{command}"))),
                MockMode::TimeOut => Ok(ExecuteOutcome::TimedOut),
                MockMode::Fail => Err(BridgeError::Spawn(SpawnError::Other(
                    "no such program".to_string(),
                ))),
            }
        }

        async fn health(&self) -> HealthSnapshot {
            HealthSnapshot {
                child: ChildStatus::Running,
                last_exit_code: None,
                version: BRIDGELET_VERSION,
            }
        }
    }

    fn app(mode: MockMode) -> Router {
        routes(Arc::new(MockExecutor { mode }))
    }

    async fn response_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn execute_request(body: &str) -> Request<Body> {
        Request::post("/execute")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn execute_returns_child_output() {
        let response = app(MockMode::Echo)
            .oneshot(execute_request(r#"{"command":"CHECK_AVAILABILITY|2024-01-01"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["output"], "OK|CHECK_AVAILABILITY|2024-01-01");
    }

    #[tokio::test]
    async fn execute_renders_timeout_sentinel() {
        let response = app(MockMode::TimeOut)
            .oneshot(execute_request(r#"{"command":"SLOW_QUERY"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["output"], "ERROR|Timeout");
    }

    #[tokio::test]
    async fn execute_bridge_error_returns_500() {
        let response = app(MockMode::Fail)
            .oneshot(execute_request(r#"{"command":"PING"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = response_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("no such program"));
    }

    #[tokio::test]
    async fn execute_rejects_missing_command_field() {
        let response = app(MockMode::Echo)
            .oneshot(execute_request(r#"{}"#))
            .await
            .unwrap();

        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn health_check_reports_child_state() {
        let response = app(MockMode::Echo)
            .oneshot(Request::get("/health-check").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["child"], "RUNNING");
        assert_eq!(json["version"], BRIDGELET_VERSION);
    }
}

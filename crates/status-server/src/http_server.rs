//! HTTP Status Server

use crate::methods::{handle_checkpoint, handle_healthcheck, handle_status, StatusContext};
use crate::StatusServerConfig;
use agent_runtime::SharedStatus;
use axum::{
    extract::State,
    http::{header, Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

pub struct StatusServer {
    context: Arc<StatusContext>,
    http_addr: String,
}

impl StatusServer {
    pub fn new(status: SharedStatus, config: StatusServerConfig) -> Self {
        Self {
            context: Arc::new(StatusContext {
                status,
                health_threshold_secs: config.health_threshold_secs,
            }),
            http_addr: config.http_addr,
        }
    }

    pub fn router(&self) -> Router {
        // Dashboards read this from the browser
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

        Router::new()
            .route("/healthcheck", get(healthcheck))
            .route("/status", get(status))
            .route("/checkpoint", get(checkpoint))
            .layer(cors)
            .with_state(self.context.clone())
    }

    /// Serve until the task is dropped
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.http_addr).await?;
        tracing::info!("Status server listening on {}", self.http_addr);

        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

async fn healthcheck(State(context): State<Arc<StatusContext>>) -> impl IntoResponse {
    let health = handle_healthcheck(&context, chrono::Utc::now().timestamp());
    let code = if health.is_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(health))
}

async fn status(State(context): State<Arc<StatusContext>>) -> impl IntoResponse {
    (StatusCode::OK, Json(handle_status(&context)))
}

async fn checkpoint(State(context): State<Arc<StatusContext>>) -> impl IntoResponse {
    match handle_checkpoint(&context) {
        Ok(view) => (StatusCode::OK, Json(json!(view))),
        Err(e) => (StatusCode::NOT_FOUND, Json(json!({ "error": e.to_string() }))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_runtime::AgentStatus;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use mech_consensus::ParticipantId;
    use parking_lot::RwLock;
    use serde_json::Value;
    use tower::ServiceExt;

    fn server() -> (StatusServer, SharedStatus) {
        let status = Arc::new(RwLock::new(AgentStatus::new(&ParticipantId::from("agent-1"))));
        let server = StatusServer::new(status.clone(), StatusServerConfig::default());
        (server, status)
    }

    async fn get_json(router: Router, path: &str) -> (StatusCode, Value) {
        let response = router
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let code = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (code, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let (server, status) = server();
        status.write().round_id = 4;
        status.write().phase = "settle".into();

        let (code, body) = get_json(server.router(), "/status").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["participant"], "agent-1");
        assert_eq!(body["round_id"], 4);
        assert_eq!(body["phase"], "settle");
    }

    #[tokio::test]
    async fn test_healthcheck_endpoint() {
        let (server, status) = server();

        let (code, body) = get_json(server.router(), "/healthcheck").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["is_healthy"], true);

        status.write().started_at = chrono::Utc::now().timestamp() - 3_600;
        let (code, body) = get_json(server.router(), "/healthcheck").await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["is_healthy"], false);
    }

    #[tokio::test]
    async fn test_checkpoint_endpoint_before_finalization() {
        let (server, _) = server();
        let (code, body) = get_json(server.router(), "/checkpoint").await;
        assert_eq!(code, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("finalized"));
    }
}

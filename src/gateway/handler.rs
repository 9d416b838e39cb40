//! HTTP API handler

use super::connection::ws_upgrade;
use super::hub::GatewayHub;
use super::handlers::system;
use crate::channels::{AuthOutcome, WebhookPayload};
use crate::error::Error;
use crate::protocol::ErrorCode;
use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// API handler for HTTP endpoints
pub struct ApiHandler;

impl ApiHandler {
    /// Create the router
    pub fn router(hub: Arc<GatewayHub>) -> Router {
        let cors = build_cors(&hub.config().gateway.cors_origins);
        Router::new()
            .route("/", get(ws_upgrade))
            .route("/ws", get(ws_upgrade))
            .route("/health", get(health_check))
            .route("/status", get(get_status))
            .route("/webhook/:channel", post(receive_webhook))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .with_state(hub)
    }
}

fn build_cors(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT]);

    if origins.is_empty() {
        cors.allow_origin(Any)
    } else {
        let parsed: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        cors.allow_origin(parsed)
    }
}

/// Health check response
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    ok: bool,
}

/// Health check endpoint
async fn health_check(State(hub): State<Arc<GatewayHub>>) -> impl IntoResponse {
    let snapshot = hub.snapshot();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        ok: snapshot.health.ts == 0 || snapshot.health.ok,
    })
}

/// Get gateway status
async fn get_status(State(hub): State<Arc<GatewayHub>>) -> impl IntoResponse {
    Json(system::status(&hub))
}

/// Webhook acceptance response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookResponse {
    accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl WebhookResponse {
    fn rejected(status: StatusCode, error: impl Into<String>) -> (StatusCode, Json<Self>) {
        (
            status,
            Json(Self {
                accepted: false,
                message_id: None,
                error: Some(error.into()),
            }),
        )
    }
}

/// Receive an inbound message for a webhook channel
async fn receive_webhook(
    State(hub): State<Arc<GatewayHub>>,
    Path(channel): Path<String>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    let Some(adapter) = hub.webhook(&channel) else {
        return WebhookResponse::rejected(
            StatusCode::NOT_FOUND,
            format!("channel '{}' not found", channel),
        );
    };

    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    if let AuthOutcome::Rejected { reason } = adapter.verify_bearer(authorization) {
        tracing::warn!(channel = %channel, reason = %reason, "Webhook request rejected");
        return WebhookResponse::rejected(StatusCode::UNAUTHORIZED, reason);
    }

    let payload: WebhookPayload = match serde_json::from_str(&body) {
        Ok(payload) => payload,
        Err(e) => {
            return WebhookResponse::rejected(
                StatusCode::BAD_REQUEST,
                format!("invalid webhook payload: {}", e),
            )
        }
    };

    match adapter.accept(payload).await {
        Ok(message) => (
            StatusCode::ACCEPTED,
            Json(WebhookResponse {
                accepted: true,
                message_id: Some(message.channel_message_id),
                error: None,
            }),
        ),
        Err(e) => {
            let status = status_for(&e);
            WebhookResponse::rejected(status, e.to_error_shape().message)
        }
    }
}

fn status_for(err: &Error) -> StatusCode {
    match err.code() {
        ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::ScriptedBackend;
    use crate::channels::{ChannelAdapter, ChannelEvent, WebhookAdapter};
    use crate::config::WebhookChannelConfig;
    use crate::gateway::hub::tests::hub_with;
    use axum::body::Body;
    use axum::http::Request;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    async fn webhook_hub(secret: Option<&str>) -> (Arc<GatewayHub>, mpsc::Receiver<ChannelEvent>) {
        let hub = hub_with(Arc::new(ScriptedBackend::new(Vec::new())));
        let adapter = Arc::new(WebhookAdapter::new(WebhookChannelConfig {
            name: "ops".into(),
            secret: secret.map(str::to_string),
            callback_url: None,
            account_id: None,
        }));
        let (tx, mut rx) = mpsc::channel(8);
        adapter.start(tx).await.unwrap();
        let _ = rx.recv().await;
        hub.register_webhook(adapter);
        (hub, rx)
    }

    fn post(uri: &str, auth: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(auth) = auth {
            builder = builder.header(header::AUTHORIZATION, auth);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    const BODY: &str = r#"{"messageId":"m-1","senderId":"u-1","content":"hi"}"#;

    #[tokio::test]
    async fn test_health_endpoint() {
        let hub = hub_with(Arc::new(ScriptedBackend::new(Vec::new())));
        let response = ApiHandler::router(hub)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_webhook_accepts_message() {
        let (hub, mut rx) = webhook_hub(Some("hook-secret")).await;
        let response = ApiHandler::router(hub)
            .oneshot(post("/webhook/ops", Some("Bearer hook-secret"), BODY))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        match rx.recv().await {
            Some(ChannelEvent::Message(message)) => {
                assert_eq!(message.channel, "ops");
                assert_eq!(message.content, "hi");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_webhook_rejections() {
        let (hub, _rx) = webhook_hub(Some("hook-secret")).await;
        let router = ApiHandler::router(hub);

        let response = router
            .clone()
            .oneshot(post("/webhook/ops", Some("Bearer wrong"), BODY))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = router
            .clone()
            .oneshot(post("/webhook/nope", None, BODY))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = router
            .oneshot(post(
                "/webhook/ops",
                Some("Bearer hook-secret"),
                r#"{"messageId":"m-1","senderId":"u-1","content":"  "}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}

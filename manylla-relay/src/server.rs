//! Axum router setup.

use crate::config::RelayConfig;
use crate::handlers::{invite, share, sync};
use crate::rate_limit::RateLimiter;
use crate::storage::RelayStorage;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub storage: RelayStorage,
    pub sync_limiter: RateLimiter,
    pub share_limiter: RateLimiter,
    pub config: Arc<RelayConfig>,
}

impl AppState {
    pub fn new(storage: RelayStorage, config: &RelayConfig) -> Self {
        Self {
            storage,
            sync_limiter: RateLimiter::new(config.rate_limit_per_minute),
            share_limiter: RateLimiter::new(config.share_rate_limit_per_minute),
            config: Arc::new(config.clone()),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let sync_routes = Router::new()
        .route("/api/sync/push", post(sync::push))
        .route("/api/sync/pull", get(sync::pull))
        .route("/api/sync/health", get(sync::health))
        .route("/api/sync/invite", post(invite::create_invite))
        .route("/api/sync/invite/{code}", get(invite::validate_invite));

    let share_routes = Router::new()
        .route("/api/share", post(share::create_share))
        .route("/api/share/{code}", get(share::access_share));

    let max_payload_size = state.config.max_payload_size;
    Router::new()
        .merge(sync_routes)
        .merge(share_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_payload_size))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const SYNC_ID: &str = "54b916e20833f3bfc17f1607d8750e8b";
    const DEVICE_ID: &str = "0123456789abcdef0123456789abcdef";

    fn app_with(config: RelayConfig) -> Router {
        let storage = RelayStorage::in_memory().unwrap();
        build_router(AppState::new(storage, &config))
    }

    fn app() -> Router {
        app_with(RelayConfig::default())
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_reports_healthy() {
        let (status, body) = send(&app(), get("/api/sync/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn pull_before_push_reports_no_data() {
        let (status, body) = send(&app(), get(&format!("/api/sync/pull?sync_id={}", SYNC_ID))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "No data found");
    }

    #[tokio::test]
    async fn push_then_pull_returns_latest_blob() {
        let app = app();
        let push = |blob: &str| {
            post_json(
                "/api/sync/push",
                json!({"sync_id": SYNC_ID, "device_id": DEVICE_ID, "encrypted_blob": blob}),
            )
        };

        let (status, first) = send(&app, push("Zmlyc3Q=")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["success"], true);
        let (_, second) = send(&app, push("c2Vjb25k")).await;
        assert_eq!(second["version"], 2);
        assert!(second["timestamp"].as_i64().unwrap() > first["timestamp"].as_i64().unwrap());

        let (_, pulled) = send(&app, get(&format!("/api/sync/pull?sync_id={}", SYNC_ID))).await;
        assert_eq!(pulled["encrypted_blob"], "c2Vjb25k");
        assert_eq!(pulled["timestamp"], second["timestamp"]);

        let since = second["timestamp"].as_i64().unwrap();
        let (_, unchanged) = send(
            &app,
            get(&format!("/api/sync/pull?sync_id={}&since={}", SYNC_ID, since)),
        )
        .await;
        assert_eq!(unchanged["success"], true);
        assert!(unchanged["data"].is_null());
        assert!(unchanged.get("encrypted_blob").is_none());
    }

    #[tokio::test]
    async fn legacy_data_field_is_accepted() {
        let app = app();
        let (status, _) = send(
            &app,
            post_json("/api/sync/push", json!({"sync_id": SYNC_ID, "data": "Zmlyc3Q="})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn malformed_push_is_rejected() {
        let app = app();
        let (status, body) = send(
            &app,
            post_json("/api/sync/push", json!({"sync_id": "nope", "encrypted_blob": "Zmlyc3Q="})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (status, _) = send(
            &app,
            post_json("/api/sync/push", json!({"sync_id": SYNC_ID, "encrypted_blob": "%%%"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, get("/api/sync/pull")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn sync_requests_are_rate_limited_per_group() {
        let app = app_with(RelayConfig {
            rate_limit_per_minute: 2,
            ..RelayConfig::default()
        });
        let uri = format!("/api/sync/pull?sync_id={}", SYNC_ID);

        assert_eq!(send(&app, get(&uri)).await.0, StatusCode::OK);
        assert_eq!(send(&app, get(&uri)).await.0, StatusCode::OK);
        assert_eq!(send(&app, get(&uri)).await.0, StatusCode::TOO_MANY_REQUESTS);

        let other = "ffffffffffffffffffffffffffffffff";
        let (status, _) = send(&app, get(&format!("/api/sync/pull?sync_id={}", other))).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn invite_lifecycle() {
        let app = app();
        let (status, created) = send(
            &app,
            post_json(
                "/api/sync/invite",
                json!({"invite_code": "abcd-efgh", "sync_id": SYNC_ID, "device_id": DEVICE_ID}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(created["invite_code"], "ABCD-EFGH");

        let (_, valid) = send(&app, get("/api/sync/invite/ABCD-EFGH")).await;
        assert_eq!(valid["valid"], true);
        assert_eq!(valid["sync_id"], SYNC_ID);

        let (_, unknown) = send(&app, get("/api/sync/invite/WXYZ-2345")).await;
        assert_eq!(unknown["valid"], false);

        let (status, _) = send(
            &app,
            post_json("/api/sync/invite", json!({"invite_code": "ABCD-EFGH", "sync_id": SYNC_ID})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = send(&app, get("/api/sync/invite/bad")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn share_lifecycle() {
        let app = app();
        let (status, created) = send(
            &app,
            post_json(
                "/api/share",
                json!({
                    "access_code": "WXYZ-2345",
                    "encrypted_data": "AgAAAA==",
                    "recipient_type": "education",
                    "expiry_hours": 168,
                    "max_views": 1
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(created["expires_at"].as_i64().is_some());

        let (status, opened) = send(&app, get("/api/share/WXYZ-2345")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(opened["encrypted_data"], "AgAAAA==");
        assert_eq!(opened["recipient_type"], "education");

        let (status, _) = send(&app, get("/api/share/WXYZ-2345")).await;
        assert_eq!(status, StatusCode::GONE);

        let (status, missing) = send(&app, get("/api/share/ABCD-EFGH")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(missing["success"], false);
    }

    #[tokio::test]
    async fn share_validation() {
        let app = app();
        for body in [
            json!({"access_code": "WXYZ-2345", "encrypted_data": "AgAAAA==", "expiry_hours": 0}),
            json!({"access_code": "WXYZ-2345", "encrypted_data": "AgAAAA==", "expiry_hours": 100000}),
            json!({"access_code": "WXYZ-2345", "encrypted_data": "AgAAAA==", "recipient_type": "<script>"}),
            json!({"access_code": "WXYZ-2345", "encrypted_data": "AgAAAA==", "max_views": 0}),
            json!({"access_code": "1234", "encrypted_data": "AgAAAA=="}),
        ] {
            let (status, _) = send(&app, post_json("/api/share", body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn oversized_body_is_refused() {
        let app = app_with(RelayConfig {
            max_payload_size: 64,
            max_blob_size: 32,
            ..RelayConfig::default()
        });
        let blob = "A".repeat(128);
        let (status, _) = send(
            &app,
            post_json("/api/sync/push", json!({"sync_id": SYNC_ID, "encrypted_blob": blob})),
        )
        .await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }
}

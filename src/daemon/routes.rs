//! REST API route handlers
//!
//! Thin layer over [`PeerService`]: parse the request, call the service,
//! map [`PeerdError`] to a status code and a `{code, message}` body.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    middleware,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use super::auth::{auth_middleware, AuthState};
use crate::error::{ErrorKind, PeerdError};
use crate::service::{PeerEvent, PeerService, PeerView, Provisioned, ServerStatus};

/// Shared application state for route handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<PeerService>,
}

/// API error response
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: ErrorKind,
    pub message: String,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.code {
            ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::DuplicateId | ErrorKind::DuplicateAddress => StatusCode::CONFLICT,
            ErrorKind::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::DriverFailure => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<PeerdError> for ApiError {
    fn from(err: PeerdError) -> Self {
        Self {
            code: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            code: ErrorKind::InvalidRequest,
            message: rejection.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.message);
        }
        (status, Json(self)).into_response()
    }
}

/// Build the API router with all routes
pub fn build_router(state: AppState, auth: AuthState) -> Router {
    let api = Router::new()
        .route("/peers", get(handle_list_peers).post(handle_create_peer))
        .route("/peers/:id", get(handle_get_peer).delete(handle_delete_peer))
        .route("/peers/:id/config", get(handle_peer_config))
        .route("/status", get(handle_status))
        .route("/events", get(handle_events_sse))
        .route_layer(middleware::from_fn_with_state(auth, auth_middleware));

    Router::new()
        .route("/health", get(handle_health))
        .nest("/api/v1", api)
        .with_state(state)
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreatePeerRequest {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListPeersResponse {
    pub peers: Vec<PeerView>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct DeletePeerResponse {
    pub deleted: bool,
    pub id: String,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /health - liveness check, no auth
pub async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /api/v1/peers - provision a peer
pub async fn handle_create_peer(
    State(state): State<AppState>,
    request: Result<Json<CreatePeerRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Provisioned>), ApiError> {
    let Json(request) = request?;
    let provisioned = state
        .service
        .provision(&request.id, request.name.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(provisioned)))
}

/// GET /api/v1/peers - list peers with live stats
pub async fn handle_list_peers(
    State(state): State<AppState>,
) -> Result<Json<ListPeersResponse>, ApiError> {
    let peers = state.service.list().await?;
    Ok(Json(ListPeersResponse {
        total: peers.len(),
        peers,
    }))
}

/// GET /api/v1/peers/:id
pub async fn handle_get_peer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PeerView>, ApiError> {
    Ok(Json(state.service.get(&id).await?))
}

/// GET /api/v1/peers/:id/config - client document as plain text
pub async fn handle_peer_config(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let doc = state.service.client_config(&id).await?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        doc,
    )
        .into_response())
}

/// DELETE /api/v1/peers/:id - revoke a peer
pub async fn handle_delete_peer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeletePeerResponse>, ApiError> {
    let record = state.service.revoke(&id).await?;
    Ok(Json(DeletePeerResponse {
        deleted: true,
        id: record.id,
    }))
}

/// GET /api/v1/status
pub async fn handle_status(State(state): State<AppState>) -> Json<ServerStatus> {
    Json(state.service.status().await)
}

// ============================================================================
// Server-Sent Events
// ============================================================================

/// GET /api/v1/events - SSE stream of peer_added / peer_removed
pub async fn handle_events_sse(
    State(state): State<AppState>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.service.subscribe();
    // Lagged receivers skip what they missed
    let stream = BroadcastStream::new(rx).filter_map(|result| result.ok().and_then(sse_event));

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn sse_event(event: PeerEvent) -> Option<Result<Event, Infallible>> {
    let name = match event {
        PeerEvent::PeerAdded { .. } => "peer_added",
        PeerEvent::PeerRemoved { .. } => "peer_removed",
    };
    let data = serde_json::to_string(&event).ok()?;
    Some(Ok(Event::default().event(name).data(data)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ObfuscationParams, ServerIdentity, TunnelConfig};
    use crate::crypto::{Key, SequentialKeyProvider};
    use crate::driver::MemoryDriver;
    use crate::pool::AddressPool;
    use crate::registry::PeerRegistry;
    use axum::body::Body;
    use axum::http::Request;
    use std::net::Ipv4Addr;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const KEY: &str = "test-api-key";

    fn app() -> (TempDir, Router) {
        let dir = TempDir::new().unwrap();
        let service = PeerService::new(
            PeerRegistry::open(dir.path()).unwrap(),
            AddressPool::new("10.8.0.0/24".parse().unwrap(), Ipv4Addr::new(10, 8, 0, 1), None),
            Arc::new(MemoryDriver::new()),
            Arc::new(SequentialKeyProvider::default()),
            ServerIdentity {
                public_key: Key::from_bytes([3; 32]).public_key(),
                endpoint: "vpn.example.com:51820".into(),
                subnet: "10.8.0.0/24".parse().unwrap(),
                dns: vec!["1.1.1.1".parse().unwrap()],
                client_allowed_ips: vec!["0.0.0.0/0".parse().unwrap()],
                persistent_keepalive: 25,
                obfuscation: ObfuscationParams::default(),
            },
            "awg0",
        )
        .unwrap();

        let router = build_router(
            AppState {
                service: Arc::new(service),
            },
            AuthState::new(KEY.into()),
        );
        (dir, router)
    }

    fn request(method: &str, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("X-API-Key", KEY);
        match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    async fn send_json(app: &Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let (status, body) = send(app, req).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health_needs_no_key() {
        let (_dir, app) = app();
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = send_json(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_api_requires_key() {
        let (_dir, app) = app();

        let req = Request::builder().uri("/api/v1/peers").body(Body::empty()).unwrap();
        let (status, body) = send_json(&app, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "unauthorized");

        let req = Request::builder()
            .uri("/api/v1/peers")
            .header("X-API-Key", "wrong")
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&app, req).await.0, StatusCode::UNAUTHORIZED);

        let req = Request::builder()
            .uri("/api/v1/peers")
            .header("Authorization", format!("Bearer {}", KEY))
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&app, req).await.0, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_peer_lifecycle() {
        let (_dir, app) = app();

        let (status, created) = send_json(
            &app,
            request("POST", "/api/v1/peers", Some(serde_json::json!({"id": "alice"}))),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["id"], "alice");
        assert_eq!(created["name"], "alice");
        assert_eq!(created["address"], "10.8.0.2");
        let doc = TunnelConfig::parse(created["client_config"].as_str().unwrap()).unwrap();
        assert_eq!(doc.public_key().to_base64(), created["public_key"]);

        let (status, list) = send_json(&app, request("GET", "/api/v1/peers", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list["total"], 1);
        assert_eq!(list["peers"][0]["id"], "alice");
        assert_eq!(list["peers"][0]["live"]["rx_bytes"], 0);
        assert!(list["peers"][0].get("private_key").is_none());

        let (status, view) = send_json(&app, request("GET", "/api/v1/peers/alice", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["address"], "10.8.0.2");

        let response = app
            .clone()
            .oneshot(request("GET", "/api/v1/peers/alice/config", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/plain"));
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(body, created["client_config"].as_str().unwrap().as_bytes());

        let (status, deleted) =
            send_json(&app, request("DELETE", "/api/v1/peers/alice", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(deleted, serde_json::json!({"deleted": true, "id": "alice"}));

        let (status, err) = send_json(&app, request("DELETE", "/api/v1/peers/alice", None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(err["code"], "not_found");
    }

    #[tokio::test]
    async fn test_error_codes() {
        let (_dir, app) = app();
        let body = serde_json::json!({"id": "bob", "name": "Bob"});

        send(&app, request("POST", "/api/v1/peers", Some(body.clone()))).await;
        let (status, err) = send_json(&app, request("POST", "/api/v1/peers", Some(body))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(err["code"], "duplicate_id");

        let (status, err) = send_json(
            &app,
            request("POST", "/api/v1/peers", Some(serde_json::json!({"id": "no spaces"}))),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(err["code"], "invalid_request");

        let (status, err) = send_json(
            &app,
            request("POST", "/api/v1/peers", Some(serde_json::json!({"name": "no id"}))),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(err["code"], "invalid_request");

        let (status, _) = send_json(&app, request("GET", "/api/v1/peers/ghost", None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ErrorKind::PoolExhausted, StatusCode::SERVICE_UNAVAILABLE),
            (ErrorKind::DriverFailure, StatusCode::BAD_GATEWAY),
            (ErrorKind::DuplicateAddress, StatusCode::CONFLICT),
            (ErrorKind::InconsistentState, StatusCode::INTERNAL_SERVER_ERROR),
            (ErrorKind::StorageFailure, StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (code, status) in cases {
            let err = ApiError {
                code,
                message: String::new(),
            };
            assert_eq!(err.status(), status, "{:?}", code);
        }
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let (_dir, app) = app();
        send(
            &app,
            request("POST", "/api/v1/peers", Some(serde_json::json!({"id": "a"}))),
        )
        .await;

        let (status, body) = send_json(&app, request("GET", "/api/v1/status", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["interface"], "awg0");
        assert_eq!(body["subnet"], "10.8.0.0/24");
        assert_eq!(body["endpoint"], "vpn.example.com:51820");
        assert_eq!(body["peer_count"], 1);
        assert_eq!(body["pool"]["free"], 252);
        assert_eq!(body["live_peers"], 1);
        assert_eq!(body["interface_ok"], true);
    }

    #[test]
    fn test_sse_event_names() {
        let event = PeerEvent::PeerRemoved {
            id: "alice".into(),
            address: Ipv4Addr::new(10, 8, 0, 2),
        };
        assert!(sse_event(event).is_some());
    }
}

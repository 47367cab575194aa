//! HTTP control surface
//!
//! Small axum app exposing instance lifecycle endpoints and the terminal
//! WebSocket. Authorization for terminal sessions happens before the
//! upgrade, so an invalid token is an ordinary 401 response and no socket
//! is ever opened.

use crate::error::InstancerError;
use crate::instance::Instance;
use crate::manager::{ChallengeSpec, InstanceManager};
use crate::registry::Registry;
use crate::terminal::TerminalBridge;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

pub struct AppState {
    pub registry: Arc<Registry>,
    pub manager: Arc<InstanceManager>,
    pub bridge: Arc<TerminalBridge>,
}

#[derive(Debug, Deserialize)]
struct CreateInstanceRequest {
    challenge: ChallengeSpec,
    owner_id: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    instance_id: Option<String>,
}

fn error_response(e: InstancerError) -> Response {
    let (status, instance_id) = match &e {
        InstancerError::AlreadyActive { instance_id, .. } => {
            (StatusCode::CONFLICT, Some(instance_id.clone()))
        }
        InstancerError::HostnameConflict { .. } => (StatusCode::CONFLICT, None),
        InstancerError::RuntimeUnavailable(_) | InstancerError::ProxyReloadFailed(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, None)
        }
        InstancerError::UnknownInstance(_) | InstancerError::UnknownHostname(_) => {
            (StatusCode::NOT_FOUND, None)
        }
        InstancerError::SessionRejected(_) => (StatusCode::FORBIDDEN, None),
        InstancerError::InvalidChallengeSpec(_) | InstancerError::Template(_) => {
            (StatusCode::BAD_REQUEST, None)
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, None),
    };
    (
        status,
        Json(ErrorBody {
            error: e.to_string(),
            instance_id,
        }),
    )
        .into_response()
}

async fn health_check() -> &'static str {
    "OK"
}

async fn create_instance(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateInstanceRequest>,
) -> Response {
    match state
        .manager
        .request_instance(&req.challenge, &req.owner_id)
        .await
    {
        Ok(inst) => (StatusCode::CREATED, Json(inst)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_instances(State(state): State<Arc<AppState>>) -> Response {
    match state.registry.list_all() {
        Ok(instances) => Json::<Vec<Instance>>(instances).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_instance(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> Response {
    match state.registry.get(&instance_id) {
        Ok(Some(inst)) => Json(inst).into_response(),
        Ok(None) => error_response(InstancerError::UnknownInstance(instance_id)),
        Err(e) => error_response(e),
    }
}

async fn stop_instance(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> Response {
    match state.manager.stop_instance(&instance_id).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct TerminalQuery {
    token: Option<String>,
}

async fn terminal_session(
    State(state): State<Arc<AppState>>,
    Path(container_id): Path<String>,
    Query(query): Query<TerminalQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    // Token and instance state are checked before the upgrade.
    if state.bridge.authorize(query.token.as_deref()).is_err() {
        return (
            StatusCode::UNAUTHORIZED,
            Json(ErrorBody {
                error: "invalid session token".to_string(),
                instance_id: None,
            }),
        )
            .into_response();
    }
    let instance = match state.bridge.resolve(&container_id) {
        Ok(inst) => inst,
        // A known but non-running target still upgrades: the client gets
        // one error frame and a clean close instead of a bare HTTP error.
        Err(e @ InstancerError::SessionRejected(_)) => {
            return ws.on_upgrade(move |mut socket| async move {
                let _ = socket
                    .send(axum::extract::ws::Message::Text(
                        serde_json::json!({ "type": "error", "message": e.to_string() })
                            .to_string(),
                    ))
                    .await;
                let _ = socket.close().await;
            });
        }
        Err(e) => return error_response(e),
    };

    let bridge = state.bridge.clone();
    ws.on_upgrade(move |socket| async move { bridge.handle_socket(socket, instance).await })
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/instances", post(create_instance))
        .route("/instances", get(list_instances))
        .route("/instances/:instance_id", get(get_instance))
        .route("/instances/:instance_id", delete(stop_instance))
        .route("/terminal/:container_id", get(terminal_session))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

pub async fn run_server(state: Arc<AppState>, host: &str, port: u16) -> anyhow::Result<()> {
    let app = router(state);
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Instancer control API listening on {}", addr);
    info!("  GET    /health                  - Health check");
    info!("  POST   /instances               - Launch an instance");
    info!("  GET    /instances               - List instances");
    info!("  GET    /instances/:id           - Instance details");
    info!("  DELETE /instances/:id           - Stop an instance");
    info!("  GET    /terminal/:container_id  - Terminal WebSocket");

    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstancerConfig;
    use crate::runtime::mock::MockRuntime;
    use crate::terminal::SharedSecretAuth;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<MockRuntime>, Arc<Registry>) {
        let registry = Arc::new(Registry::in_memory().unwrap());
        let (runtime, _events) = MockRuntime::new();
        let config = InstancerConfig::default();
        let manager = Arc::new(InstanceManager::new(
            registry.clone(),
            runtime.clone(),
            config.clone(),
        ));
        let bridge = Arc::new(TerminalBridge::new(
            registry.clone(),
            runtime.clone(),
            Arc::new(SharedSecretAuth::new(None)),
            config,
        ));
        let state = Arc::new(AppState {
            registry: registry.clone(),
            manager,
            bridge,
        });
        (router(state), runtime, registry)
    }

    fn create_body(owner: &str) -> Body {
        Body::from(
            serde_json::json!({
                "challenge": {
                    "challenge_id": "chal-42",
                    "name": "Pwn 101",
                    "image": "pwn-101:latest",
                    "internal_port": 8080
                },
                "owner_id": owner
            })
            .to_string(),
        )
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _, _) = app();
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_create_and_list_instances() {
        let (app, _, _) = app();

        let response = app
            .clone()
            .oneshot(
                Request::post("/instances")
                    .header("content-type", "application/json")
                    .body(create_body("team-rocket"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .oneshot(Request::get("/instances").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let instances: Vec<Instance> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].owner_id, "team-rocket");
    }

    #[tokio::test]
    async fn test_duplicate_request_conflicts_with_existing_id() {
        let (app, _, _) = app();

        let first = app
            .clone()
            .oneshot(
                Request::post("/instances")
                    .header("content-type", "application/json")
                    .body(create_body("team-rocket"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);

        let second = app
            .oneshot(
                Request::post("/instances")
                    .header("content-type", "application/json")
                    .body(create_body("team-rocket"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
        let bytes = axum::body::to_bytes(second.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(body["instance_id"].is_string());
    }

    #[tokio::test]
    async fn test_stop_unknown_instance_is_404() {
        let (app, _, _) = app();
        let response = app
            .oneshot(
                Request::delete("/instances/missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_runtime_outage_maps_to_503() {
        let (app, runtime, _) = app();
        runtime
            .unavailable
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let response = app
            .oneshot(
                Request::post("/instances")
                    .header("content-type", "application/json")
                    .body(create_body("team-rocket"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}

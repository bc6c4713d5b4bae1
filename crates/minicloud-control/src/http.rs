//! HTTP surface of the orchestrator.
//!
//! Thin axum handlers over [`OrchestratorService`]; every error is rendered
//! as `{"error": {"code": ..., "message": ...}}`.
//!
//! # Routes
//!
//! - `GET /health` - Liveness
//! - `GET /ready` - Readiness (store reachable)
//! - `POST /v1/instances` - Provision an instance
//! - `GET /v1/instances/:instance_id` - Instance state
//! - `GET /v1/instances/:instance_id/events?limit=N` - Audit events
//! - `POST /v1/instances/:instance_id/stop` - Stop
//! - `POST /v1/instances/:instance_id/start` - Start
//! - `POST /v1/instances/:instance_id/terminate?force=true` - Terminate
//! - `POST /v1/instances/:instance_id/cancel` - Cancel the running operation
//! - `GET /v1/executions/:execution_id` - Execution snapshot
//! - `POST /v1/executions/:execution_id/signals/:name` - Agent signal
//! - `GET /v1/hosts`, `POST /v1/hosts` - Host inventory

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use minicloud_core::{ExecutionId, InstanceId};
use minicloud_store::{Host, InstanceSpec};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tower_http::trace::TraceLayer;

use crate::error::ControlError;
use crate::service::OrchestratorService;

type AppState = Arc<OrchestratorService>;

// =============================================================================
// Errors
// =============================================================================

/// API error type that implements `IntoResponse`.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request conflicts with the current state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The policy gate refused the request.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Invalid request body or parameters.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// No host can take the instance right now.
    #[error("no capacity: {0}")]
    NoCapacity(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl ApiError {
    /// Get the HTTP status code for this error.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NoCapacity(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code string for this error.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Forbidden(_) => "forbidden",
            Self::BadRequest(_) => "bad_request",
            Self::NoCapacity(_) => "no_capacity",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code(),
                message: self.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        match err.http_status_code() {
            404 => Self::NotFound(err.to_string()),
            409 => Self::Conflict(err.to_string()),
            403 => Self::Forbidden(err.to_string()),
            400 => Self::BadRequest(err.to_string()),
            503 => Self::NoCapacity(err.to_string()),
            _ => {
                tracing::error!(error = %err, "Internal error");
                Self::Internal(err.to_string())
            }
        }
    }
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status.
    pub status: &'static str,
    /// Service version.
    pub version: &'static str,
}

/// Response for an accepted stop, start, terminate or cancel.
#[derive(Debug, Serialize, Deserialize)]
pub struct OperationResponse {
    /// Instance the operation runs on.
    pub instance_id: InstanceId,
    /// Execution carrying the operation.
    pub execution_id: ExecutionId,
}

/// Query parameters for event retrieval.
#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Number of events to return (default: 100, max 1000).
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Query parameters for terminate.
#[derive(Debug, Deserialize)]
pub struct TerminateQuery {
    /// Skip the graceful shutdown.
    #[serde(default)]
    pub force: bool,
}

/// Response for host listing.
#[derive(Debug, Serialize, Deserialize)]
pub struct ListHostsResponse {
    /// Registered hosts.
    pub hosts: Vec<Host>,
}

// =============================================================================
// Router
// =============================================================================

/// Create the orchestrator router.
pub fn create_router(service: Arc<OrchestratorService>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/v1/instances", post(create_instance))
        .route("/v1/instances/:instance_id", get(get_instance))
        .route("/v1/instances/:instance_id/events", get(list_events))
        .route("/v1/instances/:instance_id/stop", post(stop_instance))
        .route("/v1/instances/:instance_id/start", post(start_instance))
        .route("/v1/instances/:instance_id/terminate", post(terminate_instance))
        .route("/v1/instances/:instance_id/cancel", post(cancel_operation))
        .route("/v1/executions/:execution_id", get(get_execution))
        .route("/v1/executions/:execution_id/signals/:name", post(send_signal))
        .route("/v1/hosts", get(list_hosts).post(register_host))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

// =============================================================================
// Handlers
// =============================================================================

async fn health() -> impl IntoResponse {
    let response = HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    };
    (StatusCode::OK, Json(response))
}

async fn ready(State(service): State<AppState>) -> impl IntoResponse {
    if service.is_ready() {
        (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ready",
                version: env!("CARGO_PKG_VERSION"),
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "unavailable",
                version: env!("CARGO_PKG_VERSION"),
            }),
        )
    }
}

async fn create_instance(
    State(service): State<AppState>,
    Json(spec): Json<InstanceSpec>,
) -> Result<impl IntoResponse, ApiError> {
    let view = service.start_provision(spec)?;
    Ok((StatusCode::ACCEPTED, Json(view)))
}

async fn get_instance(
    State(service): State<AppState>,
    Path(instance_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let instance_id = parse_instance_id(&instance_id)?;
    Ok(Json(service.get_state(&instance_id)?))
}

async fn list_events(
    State(service): State<AppState>,
    Path(instance_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let instance_id = parse_instance_id(&instance_id)?;
    Ok(Json(service.list_events(&instance_id, query.limit)?))
}

async fn stop_instance(
    State(service): State<AppState>,
    Path(instance_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let instance_id = parse_instance_id(&instance_id)?;
    let execution_id = service.stop(&instance_id)?;
    Ok(accepted(instance_id, execution_id))
}

async fn start_instance(
    State(service): State<AppState>,
    Path(instance_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let instance_id = parse_instance_id(&instance_id)?;
    let execution_id = service.start(&instance_id)?;
    Ok(accepted(instance_id, execution_id))
}

async fn terminate_instance(
    State(service): State<AppState>,
    Path(instance_id): Path<String>,
    Query(query): Query<TerminateQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let instance_id = parse_instance_id(&instance_id)?;
    let execution_id = service.terminate(&instance_id, query.force)?;
    Ok(accepted(instance_id, execution_id))
}

async fn cancel_operation(
    State(service): State<AppState>,
    Path(instance_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let instance_id = parse_instance_id(&instance_id)?;
    let execution_id = service.cancel(&instance_id)?;
    Ok(accepted(instance_id, execution_id))
}

async fn get_execution(
    State(service): State<AppState>,
    Path(execution_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let execution_id = parse_execution_id(&execution_id)?;
    Ok(Json(service.query_execution(&execution_id)?))
}

/// Agent callback. An empty body is an empty payload.
async fn send_signal(
    State(service): State<AppState>,
    Path((execution_id, name)): Path<(String, String)>,
    payload: Option<Json<Value>>,
) -> Result<impl IntoResponse, ApiError> {
    let execution_id = parse_execution_id(&execution_id)?;
    let payload = payload.map_or(Value::Object(serde_json::Map::new()), |Json(v)| v);
    service.signal(&execution_id, &name, payload)?;
    Ok(StatusCode::ACCEPTED)
}

async fn list_hosts(State(service): State<AppState>) -> impl IntoResponse {
    Json(ListHostsResponse {
        hosts: service.list_hosts(),
    })
}

async fn register_host(
    State(service): State<AppState>,
    Json(host): Json<Host>,
) -> Result<impl IntoResponse, ApiError> {
    let host = service.register_host(host)?;
    Ok((StatusCode::CREATED, Json(host)))
}

fn accepted(instance_id: InstanceId, execution_id: ExecutionId) -> impl IntoResponse {
    (
        StatusCode::ACCEPTED,
        Json(OperationResponse {
            instance_id,
            execution_id,
        }),
    )
}

fn parse_instance_id(raw: &str) -> Result<InstanceId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid instance id: {raw}")))
}

fn parse_execution_id(raw: &str) -> Result<ExecutionId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid execution id: {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum_test::TestServer;
    use minicloud_scheduler::HostRegistry;
    use minicloud_store::{InstanceEvent, InstanceState, RocksStore, Store};
    use minicloud_workflow::ExecutionSnapshot;
    use serde_json::json;
    use tempfile::TempDir;

    use crate::collaborators::mock::{MockAgent, MockHealthProbe};
    use crate::collaborators::{AgentCommand, Collaborators};
    use crate::config::OrchestratorConfig;
    use crate::service::InstanceView;
    use crate::workflows::PROVISIONED_SIGNAL;

    struct App {
        _dir: TempDir,
        agent: Arc<MockAgent>,
        service: Arc<OrchestratorService>,
        server: TestServer,
    }

    fn app() -> App {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn Store> = Arc::new(RocksStore::open(dir.path()).unwrap());
        let hosts = Arc::new(HostRegistry::load(store.clone()).unwrap());
        let agent = Arc::new(MockAgent::new());
        let collaborators = Collaborators::with_agent(agent.clone(), Arc::new(MockHealthProbe::healthy_on(1)));
        let service = Arc::new(OrchestratorService::new(
            store,
            hosts,
            collaborators,
            &OrchestratorConfig::default(),
        ));
        let server = TestServer::new(create_router(service.clone())).unwrap();
        App {
            _dir: dir,
            agent,
            service,
            server,
        }
    }

    async fn add_host(app: &App) {
        let response = app
            .server
            .post("/v1/hosts")
            .json(&json!({
                "id": "host-001",
                "name": "rack1-a",
                "zone": "zone-a",
                "cpu_total": 16,
                "cpu_allocated": 0,
                "memory_total_mb": 32768,
                "memory_allocated_mb": 0
            }))
            .await;
        assert_eq!(response.status_code(), StatusCode::CREATED);
    }

    #[test]
    fn error_status_codes() {
        assert_eq!(ApiError::NotFound("x".into()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::Conflict("x".into()).status_code(), StatusCode::CONFLICT);
        assert_eq!(ApiError::Forbidden("x".into()).status_code(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::NoCapacity("x".into()).status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ApiError::Internal("x".into()).code(), "internal_error");
    }

    #[test]
    fn control_errors_map_by_status() {
        let id = InstanceId::generate();
        assert!(matches!(ApiError::from(ControlError::InstanceNotFound(id)), ApiError::NotFound(_)));
        assert!(matches!(ApiError::from(ControlError::NoOperation(id)), ApiError::Conflict(_)));
        assert!(matches!(
            ApiError::from(ControlError::PolicyDenied("no".into())),
            ApiError::Forbidden(_)
        ));
        assert!(matches!(
            ApiError::from(ControlError::Internal("boom".into())),
            ApiError::Internal(_)
        ));
    }

    #[tokio::test]
    async fn health_and_ready() {
        let app = app();
        let health = app.server.get("/health").await;
        assert_eq!(health.status_code(), StatusCode::OK);
        assert_eq!(health.json::<Value>()["status"], "healthy");

        let ready = app.server.get("/ready").await;
        assert_eq!(ready.status_code(), StatusCode::OK);
    }

    #[tokio::test]
    async fn provision_over_http() {
        let app = app();
        add_host(&app).await;

        let response = app
            .server
            .post("/v1/instances")
            .json(&json!({ "name": "web-1", "project_id": "proj-1", "image": "ubuntu:22.04" }))
            .await;
        assert_eq!(response.status_code(), StatusCode::ACCEPTED);
        let view: InstanceView = response.json();
        assert_eq!(view.state, InstanceState::Requested);
        let execution_id = view.execution_id.clone().unwrap();

        // Play the agent through the signal endpoint.
        while app.agent.count(|c| matches!(c, AgentCommand::CreateInstance { .. })) == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let signal = app
            .server
            .post(&format!("/v1/executions/{execution_id}/signals/{PROVISIONED_SIGNAL}"))
            .json(&json!({ "ip": null, "bootLogs": "ok" }))
            .await;
        assert_eq!(signal.status_code(), StatusCode::ACCEPTED);
        app.service.wait_execution(&execution_id).await.unwrap();

        let state: InstanceView = app
            .server
            .get(&format!("/v1/instances/{}", view.instance_id))
            .await
            .json();
        assert_eq!(state.state, InstanceState::Running);

        let snapshot: ExecutionSnapshot = app
            .server
            .get(&format!("/v1/executions/{execution_id}"))
            .await
            .json();
        assert!(snapshot.is_terminal());

        let events: Vec<InstanceEvent> = app
            .server
            .get(&format!("/v1/instances/{}/events?limit=3", view.instance_id))
            .await
            .json();
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].to_state, InstanceState::Running);
    }

    #[tokio::test]
    async fn lifecycle_errors_render_as_json() {
        let app = app();

        let missing = app.server.get(&format!("/v1/instances/{}", InstanceId::generate())).await;
        assert_eq!(missing.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(missing.json::<Value>()["error"]["code"], "not_found");

        let malformed = app.server.post("/v1/instances/not-a-uuid/stop").await;
        assert_eq!(malformed.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(malformed.json::<Value>()["error"]["code"], "bad_request");

        let unknown_execution = app
            .server
            .post(&format!("/v1/executions/{}/signals/provisioned", InstanceId::generate()))
            .await;
        assert_eq!(unknown_execution.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn operations_on_requested_instance_conflict() {
        let app = app();
        // No hosts: provisioning fails, leaving the instance FAILED.
        let view: InstanceView = app
            .server
            .post("/v1/instances")
            .json(&json!({ "name": "web-1", "project_id": "proj-1" }))
            .await
            .json();
        let execution_id = view.execution_id.clone().unwrap();
        app.service.wait_execution(&execution_id).await.unwrap();

        for action in ["stop", "start", "terminate"] {
            let response = app
                .server
                .post(&format!("/v1/instances/{}/{action}", view.instance_id))
                .await;
            assert_eq!(response.status_code(), StatusCode::CONFLICT, "{action}");
        }

        let cancel = app
            .server
            .post(&format!("/v1/instances/{}/cancel", view.instance_id))
            .await;
        assert_eq!(cancel.status_code(), StatusCode::CONFLICT);

        let state: InstanceView = app
            .server
            .get(&format!("/v1/instances/{}", view.instance_id))
            .await
            .json();
        assert_eq!(state.state, InstanceState::Failed);
    }

    #[tokio::test]
    async fn hosts_listing() {
        let app = app();
        add_host(&app).await;

        let hosts: ListHostsResponse = app.server.get("/v1/hosts").await.json();
        assert_eq!(hosts.hosts.len(), 1);
        assert_eq!(hosts.hosts[0].cpu_total, 16);

        let bad = app
            .server
            .post("/v1/hosts")
            .json(&json!({ "id": "host-002", "name": "empty", "zone": "zone-a", "cpu_total": 0, "cpu_allocated": 0, "memory_total_mb": 0, "memory_allocated_mb": 0 }))
            .await;
        assert_eq!(bad.status_code(), StatusCode::BAD_REQUEST);
    }
}

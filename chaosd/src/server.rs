use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chaos_common::protocol::{
    routes, ContainerPidResponse, ContainerRequest, DeviceRuleResponse, Empty, ErrorBody,
    ErrorKind, JvmRulesRequest, RuntimeMutatorRequest, RuntimeMutatorResponse,
};
use chaos_common::Logger;

use crate::error::ExecutorError;
use crate::executor::Executor;

pub struct AppState {
    pub executor: Executor,
    pub request_timeout: Duration,
    pub log: Logger,
}

pub struct ApiError(ExecutorError);

impl From<ExecutorError> for ApiError {
    fn from(e: ExecutorError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = match kind {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Invalid => StatusCode::BAD_REQUEST,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            kind,
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Run one operation under the request deadline. Dropping the operation on
/// timeout kills any child process it spawned.
async fn bounded<T, F>(state: &AppState, op: &'static str, fut: F) -> Result<T, ApiError>
where
    F: Future<Output = Result<T, ExecutorError>>,
{
    match tokio::time::timeout(state.request_timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            state.log.with_value("op", op).error(&e, "request failed");
            Err(e.into())
        }
        Err(_) => {
            let e = ExecutorError::Timeout(op.to_string(), state.request_timeout);
            state.log.with_value("op", op).error(&e, "request timed out");
            Err(e.into())
        }
    }
}

async fn container_pid(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ContainerRequest>,
) -> Result<Json<ContainerPidResponse>, ApiError> {
    let pid = bounded(
        &state,
        "container_pid",
        state.executor.container_pid(&req.container_id),
    )
    .await?;
    Ok(Json(ContainerPidResponse { pid }))
}

async fn install_jvm_rules(
    State(state): State<Arc<AppState>>,
    Json(req): Json<JvmRulesRequest>,
) -> Result<Json<Empty>, ApiError> {
    bounded(&state, "install_jvm_rules", state.executor.install_jvm_rules(&req)).await?;
    Ok(Json(Empty {}))
}

async fn uninstall_jvm_rules(
    State(state): State<Arc<AppState>>,
    Json(req): Json<JvmRulesRequest>,
) -> Result<Json<Empty>, ApiError> {
    bounded(
        &state,
        "uninstall_jvm_rules",
        state.executor.uninstall_jvm_rules(&req),
    )
    .await?;
    Ok(Json(Empty {}))
}

async fn install_runtime_mutator(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RuntimeMutatorRequest>,
) -> Result<Json<RuntimeMutatorResponse>, ApiError> {
    bounded(
        &state,
        "install_runtime_mutator",
        state.executor.install_runtime_mutator(&req),
    )
    .await
    .map(Json)
}

async fn uninstall_runtime_mutator(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RuntimeMutatorRequest>,
) -> Result<Json<Empty>, ApiError> {
    bounded(
        &state,
        "uninstall_runtime_mutator",
        state.executor.uninstall_runtime_mutator(&req),
    )
    .await?;
    Ok(Json(Empty {}))
}

async fn grant_fuse(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ContainerRequest>,
) -> Result<Json<DeviceRuleResponse>, ApiError> {
    bounded(&state, "grant_fuse", state.executor.grant_fuse(&req.container_id))
        .await
        .map(Json)
}

async fn revoke_fuse(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ContainerRequest>,
) -> Result<Json<DeviceRuleResponse>, ApiError> {
    bounded(&state, "revoke_fuse", state.executor.revoke_fuse(&req.container_id))
        .await
        .map(Json)
}

pub async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

pub fn all_routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route(routes::CONTAINER_PID, post(container_pid))
        .route(routes::JVM_RULES_INSTALL, post(install_jvm_rules))
        .route(routes::JVM_RULES_UNINSTALL, post(uninstall_jvm_rules))
        .route(routes::RUNTIME_MUTATOR_INSTALL, post(install_runtime_mutator))
        .route(routes::RUNTIME_MUTATOR_UNINSTALL, post(uninstall_runtime_mutator))
        .route(routes::FUSE_GRANT, post(grant_fuse))
        .route(routes::FUSE_REVOKE, post(revoke_fuse))
        .route(routes::HEALTHZ, get(healthz))
        .with_state(state)
}

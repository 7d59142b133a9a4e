use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{header, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, MethodRouter};
use axum::{Json, Router};
use gateway_sidecar_error::{ProblemDetails, SidecarError};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::Span;

use crate::config::SidecarConfig;
use crate::gateway_logs::LogRecorder;
use crate::gateway_proxy::{relay_response, GatewayClient, AGENT_RESPONSE_LIMIT};
use crate::persist::{PersistService, PersistedValue, PERSIST_BODY_LIMIT};
use crate::supervisor::{GatewaySupervisor, Readiness};
use crate::workspace::WorkspaceStore;

pub const AGENT_BODY_LIMIT: usize = 64 * 1024;
pub const AGENT_MESSAGE_LIMIT: usize = 16 * 1024;
pub const WORKSPACE_BODY_LIMIT: usize = 2 * 1024 * 1024;
const AGENT_PROBE_TIMEOUT: Duration = Duration::from_millis(100);
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub struct AppState {
    logs: Arc<LogRecorder>,
    supervisor: GatewaySupervisor,
    persist: PersistService,
    workspace: WorkspaceStore,
    gateway: GatewayClient,
}

impl AppState {
    pub fn new(config: &SidecarConfig, logs: Arc<LogRecorder>) -> Result<Self, reqwest::Error> {
        let supervisor = GatewaySupervisor::new(
            config.gateway_launch(),
            config.gateway_addr,
            config.restart,
            config.readiness,
            logs.clone(),
        );
        Ok(Self {
            persist: PersistService::new(config.state_dir(), logs.clone()),
            workspace: WorkspaceStore::new(config.workspace_root()),
            gateway: GatewayClient::new(config.gateway_addr)?,
            supervisor,
            logs,
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state))
}

pub fn build_router_with_state(shared: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route(
            "/internal/start-gateway",
            post(start_gateway).fallback(method_not_allowed),
        )
        .route("/internal/logs", get(get_logs).fallback(method_not_allowed))
        .route(
            "/internal/agent",
            with_body_limit(post(post_agent), AGENT_BODY_LIMIT),
        )
        .route(
            "/internal/workspace",
            with_body_limit(
                get(get_workspace).put(put_workspace).delete(delete_workspace),
                WORKSPACE_BODY_LIMIT,
            ),
        )
        .route(
            "/internal/persist",
            with_body_limit(get(get_persist).put(put_persist), PERSIST_BODY_LIMIT),
        )
        .route("/internal/state", get(get_state).fallback(method_not_allowed))
        .route("/health", get(get_health).fallback(method_not_allowed))
        .route("/ready", get(get_health).fallback(method_not_allowed))
        .fallback(proxy_to_gateway)
        .with_state(shared);

    let http_logging = match std::env::var("SIDECAR_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                tracing::info_span!(
                    "http.request",
                    method = %req.method(),
                    uri = %req.uri()
                )
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::debug!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    router
}

fn with_body_limit(
    route: MethodRouter<Arc<AppState>>,
    limit: usize,
) -> MethodRouter<Arc<AppState>> {
    route
        .fallback(method_not_allowed)
        .layer(DefaultBodyLimit::max(limit))
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Sidecar(#[from] SidecarError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Sidecar(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

async fn method_not_allowed(method: Method) -> ApiError {
    SidecarError::MethodNotAllowed {
        method: method.to_string(),
    }
    .into()
}

fn body_error(rejection: BytesRejection, limit: usize) -> SidecarError {
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        SidecarError::PayloadTooLarge {
            message: format!("request body exceeds {limit} bytes"),
            limit,
        }
    } else {
        SidecarError::invalid_request(format!("failed to read request body: {rejection}"))
    }
}

async fn start_gateway(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, ApiError> {
    match state.supervisor.start().await {
        Readiness::Ready => Ok(Json(json!({ "ok": true }))),
        Readiness::TimedOut => Err(SidecarError::GatewayUnavailable {
            message: "gateway did not become ready".to_string(),
        }
        .into()),
    }
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    tail: Option<String>,
}

async fn get_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogsQuery>,
) -> Json<serde_json::Value> {
    // Missing or unparsable values echo as 0; the recorder applies its default.
    let tail = query
        .tail
        .as_deref()
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .unwrap_or(0);
    let snapshot = state.logs.snapshot(tail);
    Json(json!({
        "ok": true,
        "tail": tail,
        "truncated": snapshot.truncated,
        "lines": snapshot.entries,
    }))
}

#[derive(Debug, Deserialize)]
struct AgentRequest {
    #[serde(default)]
    message: String,
}

async fn post_agent(
    State(state): State<Arc<AppState>>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, ApiError> {
    let body = body.map_err(|rejection| body_error(rejection, AGENT_BODY_LIMIT))?;
    let request: AgentRequest = serde_json::from_slice(&body)
        .map_err(|err| SidecarError::invalid_request(format!("invalid JSON body: {err}")))?;
    if request.message.is_empty() {
        return Err(SidecarError::invalid_request("missing message").into());
    }
    if request.message.len() > AGENT_MESSAGE_LIMIT {
        return Err(SidecarError::PayloadTooLarge {
            message: format!("message exceeds {AGENT_MESSAGE_LIMIT} bytes"),
            limit: AGENT_MESSAGE_LIMIT,
        }
        .into());
    }
    if !state.supervisor.is_accepting(AGENT_PROBE_TIMEOUT).await {
        return Err(SidecarError::GatewayUnavailable {
            message: "gateway not ready".to_string(),
        }
        .into());
    }

    state.logs.system(format!(
        "agent request start (bytes={})",
        request.message.len()
    ));
    let response = match state.gateway.send_agent_message(&request.message).await {
        Ok(response) => response,
        Err(err) => {
            state.logs.system(format!("agent request error: {err}"));
            tracing::warn!(error = %err, "agent request failed");
            return Err(SidecarError::UpstreamFailed {
                message: err.to_string(),
            }
            .into());
        }
    };

    let status = response.status();
    if status.is_success() {
        state.logs.system("agent request ok");
    } else {
        state
            .logs
            .system(format!("agent request status {}", status.as_u16()));
    }
    Ok(relay_response(response, Some(AGENT_RESPONSE_LIMIT)))
}

#[derive(Debug, Deserialize)]
struct WorkspaceQuery {
    path: Option<String>,
    list: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WorkspaceWrite {
    #[serde(default)]
    path: String,
    #[serde(default)]
    content: String,
}

async fn get_workspace(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WorkspaceQuery>,
) -> Result<Response, ApiError> {
    if query.list.as_deref() == Some("1") {
        let files = state.workspace.list()?;
        return Ok(Json(json!({ "ok": true, "files": files })).into_response());
    }
    let content = state.workspace.read(query.path.as_deref().unwrap_or_default())?;
    Ok((
        [(header::CONTENT_TYPE, "text/markdown; charset=utf-8")],
        content,
    )
        .into_response())
}

async fn put_workspace(
    State(state): State<Arc<AppState>>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let body = body.map_err(|rejection| body_error(rejection, WORKSPACE_BODY_LIMIT))?;
    let request: WorkspaceWrite = serde_json::from_slice(&body)
        .map_err(|err| SidecarError::invalid_request(format!("invalid JSON body: {err}")))?;
    state
        .workspace
        .write(&request.path, request.content.as_bytes())?;
    Ok(Json(json!({ "ok": true })))
}

async fn delete_workspace(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WorkspaceQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .workspace
        .delete(query.path.as_deref().unwrap_or_default())?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
struct PersistQuery {
    path: Option<String>,
}

async fn get_persist(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PersistQuery>,
) -> Result<Response, ApiError> {
    let value = state.persist.read(query.path.as_deref().unwrap_or_default())?;
    let response = match value {
        PersistedValue::Document(bytes) => {
            ([(header::CONTENT_TYPE, "application/json")], bytes).into_response()
        }
        PersistedValue::SessionKeys(keys) => Json(keys).into_response(),
    };
    Ok(response)
}

async fn put_persist(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PersistQuery>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let logical = query.path.as_deref().unwrap_or_default();
    let body = body.map_err(|rejection| {
        let err = body_error(rejection, PERSIST_BODY_LIMIT);
        if matches!(err, SidecarError::PayloadTooLarge { .. }) {
            state.persist.record_oversize(logical);
        }
        err
    })?;
    let written = state.persist.write(logical, &body)?;
    Ok(Json(json!({ "ok": true, "bytes": written })))
}

async fn get_state(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let accepting = state.supervisor.is_accepting(HEALTH_PROBE_TIMEOUT).await;
    Json(json!({
        "ok": true,
        "gateway": state.supervisor.status(),
        "gateway_addr": state.supervisor.gateway_addr().to_string(),
        "accepting": accepting,
        "logs": {
            "len": state.logs.len(),
            "capacity": state.logs.capacity(),
        },
    }))
}

async fn get_health(State(state): State<Arc<AppState>>) -> (StatusCode, &'static str) {
    if state.supervisor.is_accepting(HEALTH_PROBE_TIMEOUT).await {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "gateway not ready")
    }
}

async fn proxy_to_gateway(State(state): State<Arc<AppState>>, request: Request<Body>) -> Response {
    state.gateway.forward(request).await
}

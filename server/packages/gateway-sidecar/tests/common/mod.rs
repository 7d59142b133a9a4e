#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{any, get, post};
use axum::{Json, Router};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::util::ServiceExt;

use gateway_sidecar::config::SidecarConfig;
use gateway_sidecar::gateway_logs::LogRecorder;
use gateway_sidecar::router::{build_router, AppState};
use gateway_sidecar::supervisor::ReadinessPolicy;

pub const AGENT_REPLY_BYTES: usize = 300 * 1024;

pub struct TestApp {
    pub app: Router,
    pub logs: Arc<LogRecorder>,
    pub home: TempDir,
}

impl TestApp {
    pub fn new(gateway_port: u16) -> Self {
        Self::with_config(gateway_port, |_| {})
    }

    pub fn with_config(gateway_port: u16, configure: impl FnOnce(&mut SidecarConfig)) -> Self {
        let home = tempfile::tempdir().expect("create temp home");
        let mut config = SidecarConfig::new(home.path(), gateway_port);
        config.gateway_program = PathBuf::from("/nonexistent/picohost-gateway");
        config.readiness = ReadinessPolicy {
            poll_interval: Duration::from_millis(20),
            dial_timeout: Duration::from_millis(50),
            ceiling: Duration::from_millis(300),
        };
        configure(&mut config);

        let logs = Arc::new(LogRecorder::new(256));
        let state = AppState::new(&config, logs.clone()).expect("build app state");
        Self {
            app: build_router(state),
            logs,
            home,
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.home.path().join(".nanobot")
    }

    pub fn has_log(&self, line: &str) -> bool {
        self.logs
            .snapshot(2000)
            .entries
            .iter()
            .any(|entry| entry.line == line)
    }

    pub async fn send(
        &self,
        method: Method,
        uri: &str,
        body: Option<Vec<u8>>,
    ) -> (StatusCode, HeaderMap, Bytes) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(body.map(Body::from).unwrap_or_else(Body::empty))
            .expect("request");
        self.send_request(request).await
    }

    pub async fn send_request(&self, request: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
        let response = self.app.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("read body")
            .to_bytes();
        (status, headers, bytes)
    }

    pub async fn send_json(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let body = body.map(|value| serde_json::to_vec(&value).expect("encode"));
        let (status, _, bytes) = self.send(method, uri, body).await;
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        (status, value)
    }
}

/// A port nothing listens on.
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("addr").port()
}

/// Serves a stand-in for the gateway on an ephemeral loopback port.
pub async fn spawn_fake_gateway() -> SocketAddr {
    let router = Router::new()
        .route("/agent", post(fake_agent))
        .route("/echo", any(fake_echo))
        .route("/redirect", get(fake_redirect));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fake gateway");
    let addr = listener.local_addr().expect("fake gateway addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    addr
}

async fn fake_agent(Json(body): Json<Value>) -> axum::response::Response {
    let message = body["message"].as_str().unwrap_or_default().to_string();
    if message == "fail" {
        return (StatusCode::INTERNAL_SERVER_ERROR, "agent crashed").into_response();
    }
    if message == "big" {
        return (
            StatusCode::CREATED,
            [("x-gateway", "fake")],
            vec![b'a'; AGENT_REPLY_BYTES],
        )
            .into_response();
    }
    (
        StatusCode::CREATED,
        [("x-gateway", "fake")],
        Json(json!({ "reply": message.len() })),
    )
        .into_response()
}

async fn fake_echo(method: Method, headers: HeaderMap, request: Request<Body>) -> Json<Value> {
    let uri = request.uri().to_string();
    let body = request
        .into_body()
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .unwrap_or_default();
    Json(json!({
        "method": method.as_str(),
        "uri": uri,
        "custom": headers.get("x-custom").and_then(|value| value.to_str().ok()),
        "body": String::from_utf8_lossy(&body),
    }))
}

async fn fake_redirect() -> impl IntoResponse {
    (StatusCode::FOUND, [(header::LOCATION, "/elsewhere")])
}

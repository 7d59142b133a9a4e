//! HTTP plumbing between the sidecar and the gateway's loopback listener.

use std::net::SocketAddr;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::{HeaderName, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::{future, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub const AGENT_TIMEOUT: Duration = Duration::from_secs(130);
pub const AGENT_RESPONSE_LIMIT: usize = 256 * 1024 + 512;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const POOL_MAX_IDLE: usize = 32;
const REQUEST_BODY_CHUNKS: usize = 8;

const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Clone)]
pub struct GatewayClient {
    client: reqwest::Client,
    base_url: String,
}

impl GatewayClient {
    pub fn new(addr: SocketAddr) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE)
            .build()?;
        Ok(Self {
            client,
            base_url: format!("http://{addr}"),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Relays `request` to the gateway unchanged apart from hop-by-hop headers.
    ///
    /// Any transport failure becomes a 503; the gateway refusing connections
    /// while it boots or restarts is routine, so it is only logged at debug.
    pub async fn forward(&self, request: Request<Body>) -> Response {
        let (parts, body) = request.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("{}{}", self.base_url, path);

        let Ok(method) = reqwest::Method::from_bytes(parts.method.as_str().as_bytes()) else {
            return (StatusCode::BAD_REQUEST, "unsupported method").into_response();
        };

        let mut builder = self.client.request(method, &url);
        for (name, value) in parts.headers.iter() {
            if is_hop_by_hop(name.as_str()) || name.as_str() == "host" {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_bytes());
        }

        match builder.body(streaming_body(body)).send().await {
            Ok(response) => relay_response(response, None),
            Err(err) => {
                tracing::debug!(url = %url, error = %err, "gateway proxy request failed");
                (StatusCode::SERVICE_UNAVAILABLE, "gateway unavailable").into_response()
            }
        }
    }

    pub async fn send_agent_message(
        &self,
        message: &str,
    ) -> Result<reqwest::Response, reqwest::Error> {
        self.client
            .post(format!("{}/agent", self.base_url))
            .timeout(AGENT_TIMEOUT)
            .json(&serde_json::json!({ "message": message }))
            .send()
            .await
    }
}

/// Builds a response from the gateway's, streaming the body through.
///
/// With `limit` set, at most that many body bytes are relayed and the
/// upstream `content-length` is dropped.
pub fn relay_response(response: reqwest::Response, limit: Option<usize>) -> Response {
    let status =
        StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    for (name, value) in response.headers().iter() {
        let name = name.as_str();
        if is_hop_by_hop(name) || (limit.is_some() && name == "content-length") {
            continue;
        }
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) else {
            continue;
        };
        builder = builder.header(name, value);
    }

    let body = match limit {
        Some(limit) => Body::from_stream(limited_stream(response, limit)),
        None => Body::from_stream(response.bytes_stream()),
    };
    builder.body(body).unwrap_or_else(|_| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to build gateway response",
        )
            .into_response()
    })
}

fn limited_stream(
    response: reqwest::Response,
    limit: usize,
) -> impl futures::Stream<Item = Result<Bytes, reqwest::Error>> + Send {
    response
        .bytes_stream()
        .scan(limit, |remaining, chunk| {
            let item = match chunk {
                Ok(_) if *remaining == 0 => None,
                Ok(mut bytes) => {
                    bytes.truncate(*remaining);
                    *remaining -= bytes.len();
                    Some(Ok(bytes))
                }
                Err(err) => Some(Err(err)),
            };
            future::ready(item)
        })
}

/// Pumps the inbound body through a channel; axum bodies are not `Sync`,
/// which reqwest requires of streamed bodies.
fn streaming_body(body: Body) -> reqwest::Body {
    let (tx, rx) = mpsc::channel::<Result<Bytes, axum::Error>>(REQUEST_BODY_CHUNKS);
    tokio::spawn(async move {
        let mut stream = body.into_data_stream();
        while let Some(chunk) = stream.next().await {
            if tx.send(chunk).await.is_err() {
                break;
            }
        }
    });
    reqwest::Body::wrap_stream(ReceiverStream::new(rx))
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|hop| hop.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_are_recognised() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(!is_hop_by_hop("content-type"));
        assert!(!is_hop_by_hop("x-request-id"));
    }

    #[test]
    fn base_url_targets_loopback_gateway() {
        let client = GatewayClient::new(SocketAddr::from(([127, 0, 0, 1], 18790)))
            .expect("build client");
        assert_eq!(client.base_url(), "http://127.0.0.1:18790");
    }
}

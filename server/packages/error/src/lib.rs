use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    NotFound,
    MethodNotAllowed,
    PayloadTooLarge,
    Internal,
    UpstreamFailed,
    GatewayUnavailable,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:gateway-sidecar:error:invalid_request",
            Self::NotFound => "urn:gateway-sidecar:error:not_found",
            Self::MethodNotAllowed => "urn:gateway-sidecar:error:method_not_allowed",
            Self::PayloadTooLarge => "urn:gateway-sidecar:error:payload_too_large",
            Self::Internal => "urn:gateway-sidecar:error:internal",
            Self::UpstreamFailed => "urn:gateway-sidecar:error:upstream_failed",
            Self::GatewayUnavailable => "urn:gateway-sidecar:error:gateway_unavailable",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::NotFound => "Not Found",
            Self::MethodNotAllowed => "Method Not Allowed",
            Self::PayloadTooLarge => "Payload Too Large",
            Self::Internal => "Internal Error",
            Self::UpstreamFailed => "Upstream Failed",
            Self::GatewayUnavailable => "Gateway Unavailable",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::NotFound => 404,
            Self::MethodNotAllowed => 405,
            Self::PayloadTooLarge => 413,
            Self::Internal => 500,
            Self::UpstreamFailed => 502,
            Self::GatewayUnavailable => 503,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

/// Every failure the sidecar reports to an HTTP caller.
///
/// Supervision failures never appear here: the restart loop records them in
/// the gateway log and retries on its own.
#[derive(Debug, Error)]
pub enum SidecarError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("invalid path: {path:?}")]
    InvalidPath { path: String },
    #[error("not found: {resource}")]
    NotFound { resource: String },
    #[error("method not allowed: {method}")]
    MethodNotAllowed { method: String },
    #[error("payload too large: {message}")]
    PayloadTooLarge { message: String, limit: usize },
    #[error("io error: {message}")]
    Io { message: String },
    #[error("upstream request failed: {message}")]
    UpstreamFailed { message: String },
    #[error("gateway unavailable: {message}")]
    GatewayUnavailable { message: String },
}

impl SidecarError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn io(context: &str, err: &std::io::Error) -> Self {
        Self::Io {
            message: format!("{context}: {err}"),
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } | Self::InvalidPath { .. } => ErrorType::InvalidRequest,
            Self::NotFound { .. } => ErrorType::NotFound,
            Self::MethodNotAllowed { .. } => ErrorType::MethodNotAllowed,
            Self::PayloadTooLarge { .. } => ErrorType::PayloadTooLarge,
            Self::Io { .. } => ErrorType::Internal,
            Self::UpstreamFailed { .. } => ErrorType::UpstreamFailed,
            Self::GatewayUnavailable { .. } => ErrorType::GatewayUnavailable,
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        match self {
            Self::InvalidPath { path } => {
                problem
                    .extensions
                    .insert("path".to_string(), Value::String(path.clone()));
            }
            Self::NotFound { resource } => {
                problem
                    .extensions
                    .insert("resource".to_string(), Value::String(resource.clone()));
            }
            Self::PayloadTooLarge { limit, .. } => {
                problem.extensions.insert(
                    "limit".to_string(),
                    Value::Number(serde_json::Number::from(*limit as u64)),
                );
            }
            _ => {}
        }
        problem
    }
}

impl From<SidecarError> for ProblemDetails {
    fn from(value: SidecarError) -> Self {
        value.to_problem_details()
    }
}

impl From<&SidecarError> for ProblemDetails {
    fn from(value: &SidecarError) -> Self {
        value.to_problem_details()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn problem_details_carry_status_and_urn() {
        let err = SidecarError::InvalidPath {
            path: "../etc".to_string(),
        };
        let problem = err.to_problem_details();
        assert_eq!(problem.status, 400);
        assert_eq!(problem.type_, "urn:gateway-sidecar:error:invalid_request");
        assert_eq!(problem.extensions["path"], "../etc");

        let value = serde_json::to_value(&problem).expect("serialize problem");
        assert_eq!(value["type"], "urn:gateway-sidecar:error:invalid_request");
        assert_eq!(value["path"], "../etc");
        assert!(value.get("instance").is_none());
    }

    #[test]
    fn upstream_errors_map_to_gateway_statuses() {
        let unavailable = SidecarError::GatewayUnavailable {
            message: "gateway not ready".to_string(),
        };
        let failed = SidecarError::UpstreamFailed {
            message: "connection reset".to_string(),
        };
        assert_eq!(unavailable.error_type().status_code(), 503);
        assert_eq!(failed.error_type().status_code(), 502);
    }

    #[test]
    fn payload_too_large_reports_limit() {
        let err = SidecarError::PayloadTooLarge {
            message: "message too long".to_string(),
            limit: 16_384,
        };
        let problem = ProblemDetails::from(&err);
        assert_eq!(problem.status, 413);
        assert_eq!(problem.extensions["limit"], 16_384);
    }
}

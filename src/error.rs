// src/error.rs - Outward error taxonomy and the upstream error mapper
use crate::config::Environment;
use hyper::{
    header::{CONTENT_TYPE, RETRY_AFTER},
    Body, Response, StatusCode,
};
use serde::Serialize;
use thiserror::Error;

/// Every failure that reaches a client converges to one of these.
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    #[error("No route found for {path}")]
    RouteNotFound { path: String, available: Vec<String> },

    #[error("Authentication required: {reason}")]
    Unauthorized { reason: String },

    #[error("Authentication rejected: {reason}")]
    Forbidden { reason: String },

    #[error("Rate limit '{policy}' exceeded, retry after {retry_after_secs}s")]
    RateLimited {
        policy: String,
        message: String,
        retry_after_secs: u64,
    },

    #[error("Upstream quota exceeded at {service}: {detail}")]
    QuotaExceeded { service: String, detail: String },

    #[error("Service unavailable: {service} ({reason})")]
    ServiceUnavailable { service: String, reason: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },

    #[error("{service} rejected the request with {status}: {message}")]
    UpstreamRejected {
        service: String,
        status: u16,
        error: String,
        message: String,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Stable classification of [`GatewayError`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    RouteNotFound,
    Unauthorized,
    Forbidden,
    RateLimited,
    ServiceUnavailable,
    ValidationFailed,
    UpstreamRejected,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

/// JSON body written for every failed request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    pub success: bool,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_endpoints: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl GatewayError {
    pub fn service_unavailable<S: Into<String>, R: Into<String>>(service: S, reason: R) -> Self {
        GatewayError::ServiceUnavailable {
            service: service.into(),
            reason: reason.into(),
        }
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        GatewayError::ValidationFailed {
            message: message.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        GatewayError::Internal {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::RouteNotFound { .. } => ErrorKind::RouteNotFound,
            GatewayError::Unauthorized { .. } => ErrorKind::Unauthorized,
            GatewayError::Forbidden { .. } => ErrorKind::Forbidden,
            GatewayError::RateLimited { .. } | GatewayError::QuotaExceeded { .. } => {
                ErrorKind::RateLimited
            }
            GatewayError::ServiceUnavailable { .. } => ErrorKind::ServiceUnavailable,
            GatewayError::ValidationFailed { .. } => ErrorKind::ValidationFailed,
            GatewayError::UpstreamRejected { .. } => ErrorKind::UpstreamRejected,
            GatewayError::Internal { .. } => ErrorKind::Internal,
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            GatewayError::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden { .. } => StatusCode::FORBIDDEN,
            GatewayError::RateLimited { .. } | GatewayError::QuotaExceeded { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            GatewayError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::ValidationFailed { .. } => StatusCode::BAD_REQUEST,
            GatewayError::UpstreamRejected { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_REQUEST)
            }
            GatewayError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The stable `error` field of the envelope.
    pub fn user_message(&self) -> String {
        match self {
            GatewayError::RouteNotFound { .. } => "Endpoint not found".to_string(),
            GatewayError::Unauthorized { .. } => "Access token required".to_string(),
            GatewayError::Forbidden { .. } => "Invalid or expired token".to_string(),
            GatewayError::RateLimited { .. } => "Too many requests".to_string(),
            GatewayError::QuotaExceeded { .. } => {
                "API quota exceeded. Please try again later.".to_string()
            }
            GatewayError::ServiceUnavailable { .. } => "Service temporarily unavailable".to_string(),
            GatewayError::ValidationFailed { .. } => "Invalid request".to_string(),
            GatewayError::UpstreamRejected { error, .. } => error.clone(),
            GatewayError::Internal { .. } => "Internal server error".to_string(),
        }
    }

    fn detail_message(&self) -> Option<String> {
        match self {
            GatewayError::RouteNotFound { path, .. } => {
                Some(format!("No endpoint is registered for {}", path))
            }
            GatewayError::Unauthorized { reason } | GatewayError::Forbidden { reason } => {
                Some(reason.clone())
            }
            GatewayError::RateLimited { message, .. } => Some(message.clone()),
            GatewayError::QuotaExceeded { .. } => None,
            GatewayError::ServiceUnavailable { service, .. } => {
                Some(format!("The {} is currently unavailable", service))
            }
            GatewayError::ValidationFailed { message } => Some(message.clone()),
            GatewayError::UpstreamRejected { message, .. } => Some(message.clone()),
            GatewayError::Internal { .. } => Some("Something went wrong".to_string()),
        }
    }

    pub fn log_level(&self) -> LogLevel {
        match self {
            GatewayError::Internal { .. } => LogLevel::Error,
            GatewayError::ServiceUnavailable { .. } | GatewayError::QuotaExceeded { .. } => {
                LogLevel::Warn
            }
            GatewayError::RateLimited { .. } | GatewayError::UpstreamRejected { .. } => {
                LogLevel::Info
            }
            GatewayError::RouteNotFound { .. }
            | GatewayError::Unauthorized { .. }
            | GatewayError::Forbidden { .. }
            | GatewayError::ValidationFailed { .. } => LogLevel::Debug,
        }
    }

    pub fn log(&self, request_id: &str) {
        let kind = self.kind();
        match self.log_level() {
            LogLevel::Error => tracing::error!(request_id, ?kind, "{}", self),
            LogLevel::Warn => tracing::warn!(request_id, ?kind, "{}", self),
            LogLevel::Info => tracing::info!(request_id, ?kind, "{}", self),
            LogLevel::Debug => tracing::debug!(request_id, ?kind, "{}", self),
        }
    }

    pub fn envelope(&self, environment: Environment) -> ErrorEnvelope {
        let (retry_after, available_endpoints) = match self {
            GatewayError::RateLimited {
                retry_after_secs, ..
            } => (Some(*retry_after_secs), None),
            GatewayError::RouteNotFound { available, .. } => (None, Some(available.clone())),
            _ => (None, None),
        };

        ErrorEnvelope {
            success: false,
            error: self.user_message(),
            message: self.detail_message(),
            retry_after,
            available_endpoints,
            stack: environment.is_development().then(|| format!("{:?}", self)),
        }
    }

    /// Render the client-facing response.
    pub fn to_response(&self, environment: Environment) -> Response<Body> {
        let body = serde_json::to_vec(&self.envelope(environment)).unwrap_or_else(|_| {
            br#"{"success":false,"error":"Internal server error"}"#.to_vec()
        });

        let mut builder = Response::builder()
            .status(self.http_status())
            .header(CONTENT_TYPE, "application/json");
        if let GatewayError::RateLimited {
            retry_after_secs, ..
        } = self
        {
            builder = builder.header(RETRY_AFTER, retry_after_secs.to_string());
        }

        builder.body(Body::from(body)).unwrap_or_else(|_| {
            let mut fallback = Response::new(Body::from("Internal server error"));
            *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            fallback
        })
    }
}

/// Maps an upstream error response into the outward taxonomy.
///
/// Rules are checked in order and the first match wins: quota or rate-limit
/// signals, invalid-request signals, duplicate/uniqueness conflicts, not-found.
/// A 4xx without any recognised signal keeps its status; anything else becomes
/// a generic 500.
pub fn map_upstream_failure(service: &str, status: StatusCode, body: &[u8]) -> GatewayError {
    let upstream_message = extract_message(body);
    let signal = format!(
        "{} {}",
        upstream_message.as_deref().unwrap_or_default(),
        extract_code(body).unwrap_or_default()
    )
    .to_ascii_lowercase();
    let message = upstream_message.unwrap_or_else(|| {
        status
            .canonical_reason()
            .unwrap_or("Upstream error")
            .to_string()
    });

    let rejected = |status: u16, error: &str, message: String| GatewayError::UpstreamRejected {
        service: service.to_string(),
        status,
        error: error.to_string(),
        message,
    };

    if status == StatusCode::TOO_MANY_REQUESTS
        || ["quota", "rate limit", "rate_limit", "too many requests"]
            .iter()
            .any(|needle| signal.contains(needle))
    {
        return GatewayError::QuotaExceeded {
            service: service.to_string(),
            detail: message,
        };
    }

    if signal.contains("invalid_request") || signal.contains("invalid request") {
        return rejected(400, "Invalid request", message);
    }

    if status == StatusCode::CONFLICT
        || ["duplicate", "already exists", "e11000", "unique constraint"]
            .iter()
            .any(|needle| signal.contains(needle))
    {
        return rejected(400, "Duplicate field value entered", message);
    }

    if status == StatusCode::NOT_FOUND || signal.contains("not found") {
        return rejected(404, "Resource not found", message);
    }

    if status == StatusCode::BAD_REQUEST {
        return rejected(400, "Invalid request", message);
    }

    if status.is_client_error() {
        let error = status.canonical_reason().unwrap_or("Request rejected");
        return rejected(status.as_u16(), error, message);
    }

    GatewayError::Internal {
        message: format!("{} responded {}: {}", service, status, message),
    }
}

fn extract_message(body: &[u8]) -> Option<String> {
    match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(value) => {
            let nested = value.get("error").and_then(|e| e.get("message"));
            nested
                .or_else(|| value.get("message"))
                .or_else(|| value.get("error"))
                .or_else(|| value.get("detail"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        }
        Err(_) => {
            let text = String::from_utf8_lossy(body).trim().to_string();
            (!text.is_empty()).then_some(text)
        }
    }
}

fn extract_code(body: &[u8]) -> Option<String> {
    let value = serde_json::from_slice::<serde_json::Value>(body).ok()?;
    let error = value.get("error").unwrap_or(&value);
    let code = error
        .get("code")
        .or_else(|| error.get("type"))
        .or_else(|| value.get("code"))?;
    match code {
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

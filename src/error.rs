//! JSON error responses emitted by the proxy itself, distinct from upstream
//! statuses

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde_json::json;

/// Body type flowing through the proxy data path
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Error codes for proxy-originated failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    /// No healthy worker to dispatch to
    NoHealthyWorkers,
    /// Upstream failed before a response started
    BadGateway,
    /// Upstream did not respond within the request timeout
    GatewayTimeout,
}

impl ProxyErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::NoHealthyWorkers => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::BadGateway => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Error code string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::NoHealthyWorkers => "NO_HEALTHY_WORKERS",
            ProxyErrorCode::BadGateway => "BAD_GATEWAY",
            ProxyErrorCode::GatewayTimeout => "GATEWAY_TIMEOUT",
        }
    }
}

/// 503: no healthy workers; reports pool counts so callers can tell an empty
/// pool from an unhealthy one
pub fn no_healthy_workers(instances: usize, healthy: usize) -> Response<ProxyBody> {
    json_error_response(
        ProxyErrorCode::NoHealthyWorkers,
        json!({
            "error": "No healthy backend servers available",
            "instances": instances,
            "healthy": healthy,
        }),
    )
}

/// 502: upstream error before the response started
pub fn bad_gateway() -> Response<ProxyBody> {
    json_error_response(
        ProxyErrorCode::BadGateway,
        json!({
            "error": "Bad Gateway",
            "message": "Backend server error",
        }),
    )
}

/// 504: upstream timeout
pub fn gateway_timeout() -> Response<ProxyBody> {
    json_error_response(
        ProxyErrorCode::GatewayTimeout,
        json!({
            "error": "Gateway Timeout",
            "message": "Backend server timeout",
        }),
    )
}

fn json_error_response(code: ProxyErrorCode, body: serde_json::Value) -> Response<ProxyBody> {
    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(full_body(body.to_string()))
        .expect("valid response with StatusCode enum and static headers")
}

/// Build a complete in-memory body with the proxy's body type
pub fn full_body(content: impl Into<Bytes>) -> ProxyBody {
    Full::new(content.into()).map_err(|never| match never {}).boxed()
}

//! Supervisor failures and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::process::ExitStatus;

/// Fatal conditions that stop the whole supervisor
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The service process could not be spawned
    #[error("Failed to spawn service '{service}': {source}")]
    Spawn {
        service: String,
        #[source]
        source: std::io::Error,
    },

    /// The readiness probe used its whole attempt budget
    #[error("Service '{service}' did not answer on port {port} after {attempts} attempts")]
    ProbeExhausted {
        service: String,
        port: u16,
        attempts: u32,
    },

    /// The process exited before its readiness probe succeeded
    #[error("Service '{service}' exited during startup ({status})")]
    ExitedDuringStartup { service: String, status: String },

    /// A ready process exited without being asked to
    #[error("Service '{service}' exited unexpectedly ({status})")]
    UnexpectedExit { service: String, status: String },
}

/// Render an exit status the way it appears in logs and errors
pub fn describe_exit(status: &std::io::Result<ExitStatus>) -> String {
    match status {
        Ok(status) => {
            if let Some(code) = status.code() {
                return format!("exit code {}", code);
            }
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                if let Some(signal) = status.signal() {
                    return format!("killed by signal {}", signal);
                }
            }
            status.to_string()
        }
        Err(e) => format!("wait failed: {}", e),
    }
}

/// Error codes for per-request proxy failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Connecting to or talking with the backend failed
    UpstreamUnavailable,
    /// Backend did not return response headers in time
    UpstreamTimeout,
    /// Backend refused or broke a protocol upgrade
    UpgradeFailed,
}

impl ProxyErrorCode {
    /// Every upstream failure is reported to the client as a bad gateway
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::UpstreamUnavailable
            | ProxyErrorCode::UpstreamTimeout
            | ProxyErrorCode::UpgradeFailed => StatusCode::BAD_GATEWAY,
        }
    }

    /// Value for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            ProxyErrorCode::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            ProxyErrorCode::UpgradeFailed => "UPGRADE_FAILED",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.status
            )
        })
    }
}

/// Build a JSON error response carrying an X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = ErrorResponse::new(code, message).to_json();

    Response::builder()
        .status(code.status_code())
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

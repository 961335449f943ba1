//! Health check endpoints
//!
//! Provides Kubernetes-style health probes:
//! - /health, /healthz - Liveness probe (is the service running?)
//! - /ready, /readyz - Readiness probe (does the store answer?)
//!
//! The queue is not part of readiness: a queue outage degrades ingest
//! (503 after commit) but registration and governance keep working.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::server::AppState;

/// Readiness gives the store this long to answer a ping
const READY_PING_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Serialize)]
pub struct HealthResponse {
    /// Overall health status
    pub healthy: bool,
    /// 'online' or 'degraded'
    pub status: &'static str,
    /// Service version
    pub version: &'static str,
    /// Uptime in seconds
    pub uptime: u64,
    /// Current timestamp
    pub timestamp: String,
    /// Operating mode
    pub mode: String,
    pub store: BackendHealth,
    pub queue: BackendHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize)]
pub struct BackendHealth {
    pub backend: &'static str,
    /// Only probed by the readiness check
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected: Option<bool>,
}

fn build_health_response(
    state: &AppState,
    store_connected: Option<bool>,
    error: Option<String>,
) -> HealthResponse {
    let healthy = store_connected.unwrap_or(true);
    HealthResponse {
        healthy,
        status: if healthy { "online" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        uptime: state.started_at.elapsed().as_secs(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        mode: if state.args.dev_mode {
            "development".to_string()
        } else {
            "production".to_string()
        },
        store: BackendHealth {
            backend: state.store.backend(),
            connected: store_connected,
        },
        queue: BackendHealth {
            backend: state.queue.name(),
            connected: None,
        },
        error,
    }
}

fn health_json(status: StatusCode, response: &HealthResponse) -> Response<Full<Bytes>> {
    let body = serde_json::to_string(response)
        .unwrap_or_else(|_| r#"{"healthy":false,"error":"Serialization failed"}"#.to_string());

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

/// Handle liveness probe (/health, /healthz)
///
/// Returns 200 OK while the process is serving.
pub fn health_check(state: Arc<AppState>) -> Response<Full<Bytes>> {
    let response = build_health_response(&state, None, None);
    health_json(StatusCode::OK, &response)
}

/// Handle readiness probe (/ready, /readyz)
///
/// Returns 200 OK only if the store answers a ping.
pub async fn readiness_check(state: Arc<AppState>) -> Response<Full<Bytes>> {
    let ping = tokio::time::timeout(READY_PING_TIMEOUT, state.store.ping()).await;
    let (connected, error) = match ping {
        Ok(Ok(())) => (true, None),
        Ok(Err(e)) => (false, Some(e.to_string())),
        Err(_) => (false, Some("store ping timed out".to_string())),
    };

    let response = build_health_response(&state, Some(connected), error);
    let status = if connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    health_json(status, &response)
}

/// Version information for deployment verification
#[derive(Serialize)]
pub struct VersionResponse {
    /// Cargo package version
    pub version: &'static str,
    /// Git commit hash (short)
    pub commit: &'static str,
    /// Build timestamp
    pub build_time: &'static str,
    /// Service name
    pub service: &'static str,
}

/// Handle version endpoint (/version)
pub fn version_info() -> Response<Full<Bytes>> {
    let response = VersionResponse {
        version: env!("CARGO_PKG_VERSION"),
        commit: option_env!("GIT_COMMIT_SHORT").unwrap_or("unknown"),
        build_time: option_env!("BUILD_TIMESTAMP").unwrap_or("unknown"),
        service: "gatehouse",
    };

    let body = serde_json::to_string(&response)
        .unwrap_or_else(|_| r#"{"version":"unknown","commit":"unknown"}"#.to_string());

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

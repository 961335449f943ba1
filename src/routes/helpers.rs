//! Shared request/response helpers for the route handlers

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use tracing::{error, warn};

use crate::services::RequestMeta;
use crate::types::GatehouseError;

pub type FullBody = Full<Bytes>;

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

// =============================================================================
// Responses
// =============================================================================

pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<FullBody> {
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Full::new(Bytes::from(json)))
        .unwrap()
}

pub fn error_response(status: StatusCode, error: &str, code: Option<&str>) -> Response<FullBody> {
    json_response(
        status,
        &ErrorResponse {
            error: error.to_string(),
            code: code.map(|c| c.to_string()),
        },
    )
}

/// Render a service error. Storage and internal failures get a generic
/// message; the detail goes to the log.
pub fn gatehouse_error_response(err: &GatehouseError) -> Response<FullBody> {
    let status = err.status_code();
    if err.is_client_error() {
        return error_response(status, err.message(), Some(err.code()));
    }

    error!(code = err.code(), "Request failed: {}", err);
    let message = match err {
        GatehouseError::Timeout(step) => format!("timed out during {}", step),
        GatehouseError::Queue(_) => "analysis queue unavailable".to_string(),
        GatehouseError::Database(_) => "storage unavailable".to_string(),
        _ => "internal error".to_string(),
    };
    error_response(status, &message, Some(err.code()))
}

// =============================================================================
// Requests
// =============================================================================

pub fn get_auth_header(req: &Request<Incoming>) -> Option<&str> {
    req.headers()
        .get(hyper::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
}

pub fn get_header<'a>(req: &'a Request<Incoming>, name: &str) -> Option<&'a str> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Client address: first X-Forwarded-For entry, else the peer
pub fn client_ip(req: &Request<Incoming>, addr: SocketAddr) -> String {
    get_header(req, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| addr.ip().to_string())
}

/// Collect the audit context of a request
pub fn request_meta(req: &Request<Incoming>, addr: SocketAddr) -> RequestMeta {
    RequestMeta {
        remote_ip: Some(client_ip(req, addr)),
        request_id: get_header(req, "x-request-id").map(str::to_string),
        user_agent: get_header(req, "user-agent").map(str::to_string),
        actor: get_header(req, "x-admin-actor").map(str::to_string),
    }
}

/// Read and decode a JSON body no larger than `limit` bytes. An empty body
/// decodes as `{}` so optional-field requests may omit it.
pub async fn parse_json_body<T: DeserializeOwned>(
    req: Request<Incoming>,
    limit: usize,
) -> Result<T, Response<FullBody>> {
    let body = match Limited::new(req.into_body(), limit).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            warn!(limit, "Request body too large");
            return Err(error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                &format!("request body exceeds {} bytes", limit),
                Some("payload_too_large"),
            ));
        }
        Err(e) => {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                &format!("Failed to read request body: {}", e),
                Some("bad_request"),
            ));
        }
    };

    let body = if body.iter().all(u8::is_ascii_whitespace) {
        Bytes::from_static(b"{}")
    } else {
        body
    };

    serde_json::from_slice(&body).map_err(|e| {
        error_response(
            StatusCode::BAD_REQUEST,
            &format!("Invalid JSON: {}", e),
            Some("bad_request"),
        )
    })
}

/// Parse a query string into decoded key/value pairs
pub fn query_params(query: Option<&str>) -> Vec<(String, String)> {
    query
        .unwrap_or_default()
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (decode(k), decode(v))
        })
        .collect()
}

fn decode(raw: &str) -> String {
    let raw = raw.replace('+', " ");
    urlencoding::decode(&raw)
        .map(|s| s.into_owned())
        .unwrap_or(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_params_decode() {
        let params = query_params(Some("status=needs_info&limit=5&note=a%20b+c&flag"));
        assert_eq!(
            params,
            vec![
                ("status".to_string(), "needs_info".to_string()),
                ("limit".to_string(), "5".to_string()),
                ("note".to_string(), "a b c".to_string()),
                ("flag".to_string(), String::new()),
            ]
        );
        assert!(query_params(None).is_empty());
    }

    #[tokio::test]
    async fn test_error_response_hides_storage_detail() {
        let resp = gatehouse_error_response(&GatehouseError::Database(
            "connection refused 10.0.0.5".into(),
        ));
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "storage unavailable");
        assert_eq!(json["code"], "storage_unavailable");
    }

    #[tokio::test]
    async fn test_client_error_keeps_message() {
        let resp = gatehouse_error_response(&GatehouseError::Unauthorized("invalid api key".into()));
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "invalid api key");
    }
}

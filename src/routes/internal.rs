//! Internal admin routes
//!
//! All routes require `X-Internal-Admin-Token`. With no token configured the
//! whole surface answers 503.
//!
//! - GET  /internal/fetcher-promotion-requests?status=&limit=
//! - POST /internal/fetcher-promotion-requests/{id}/decide
//! - POST /internal/reports/{seq}/promote
//! - POST /internal/fetchers/{fetcher_id}/suspend
//! - POST /internal/fetcher-keys/{key_id}/revoke
//!
//! `X-Admin-Actor` names the operator in the moderation log.

use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

use super::helpers::{
    error_response, gatehouse_error_response, get_header, json_response, parse_json_body,
    query_params, request_meta, FullBody,
};
use crate::server::AppState;
use crate::services::governance::PromotionRequestView;
use crate::services::{DecideRequest, PromoteReportRequest, RequestMeta, SuspendRequest};

pub const ADMIN_TOKEN_HEADER: &str = "x-internal-admin-token";

/// Body limit for admin requests
const ADMIN_BODY_LIMIT: usize = 64 * 1024;

#[derive(Debug, Serialize)]
struct ListRequestsResponse {
    count: usize,
    requests: Vec<PromotionRequestView>,
}

/// Dispatch an /internal/* request
pub async fn handle_internal_request(
    req: Request<Incoming>,
    state: Arc<AppState>,
    addr: SocketAddr,
) -> Response<FullBody> {
    if !state.admin.is_configured() {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "internal admin token not configured",
            Some("admin_disabled"),
        );
    }
    if !state.admin.validate(get_header(&req, ADMIN_TOKEN_HEADER)) {
        warn!(peer = %addr, "Rejected internal request with bad admin token");
        return error_response(StatusCode::UNAUTHORIZED, "invalid admin token", Some("unauthorized"));
    }

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let subpath = path.strip_prefix("/internal").unwrap_or("");
    let meta = request_meta(&req, addr);

    match (method, subpath) {
        // GET /internal/fetcher-promotion-requests
        (Method::GET, "/fetcher-promotion-requests") | (Method::GET, "/fetcher-promotion-requests/") => {
            handle_list_requests(req, state).await
        }

        // POST /internal/fetcher-promotion-requests/{id}/decide
        (Method::POST, p) if p.starts_with("/fetcher-promotion-requests/") && p.ends_with("/decide") => {
            let id = path_param(p, "/fetcher-promotion-requests/", "/decide");
            match id.parse::<i64>() {
                Ok(request_id) => handle_decide(req, state, request_id, meta).await,
                Err(_) => bad_id("request id", id),
            }
        }

        // POST /internal/reports/{seq}/promote
        (Method::POST, p) if p.starts_with("/reports/") && p.ends_with("/promote") => {
            let seq = path_param(p, "/reports/", "/promote");
            match seq.parse::<i64>() {
                Ok(seq) => handle_promote(req, state, seq, meta).await,
                Err(_) => bad_id("report seq", seq),
            }
        }

        // POST /internal/fetchers/{fetcher_id}/suspend
        (Method::POST, p) if p.starts_with("/fetchers/") && p.ends_with("/suspend") => {
            let fetcher_id = path_param(p, "/fetchers/", "/suspend");
            if fetcher_id.is_empty() {
                return bad_id("fetcher id", fetcher_id);
            }
            let fetcher_id = fetcher_id.to_string();
            handle_suspend(req, state, &fetcher_id, meta).await
        }

        // POST /internal/fetcher-keys/{key_id}/revoke
        (Method::POST, p) if p.starts_with("/fetcher-keys/") && p.ends_with("/revoke") => {
            let key_id = path_param(p, "/fetcher-keys/", "/revoke");
            if key_id.is_empty() {
                return bad_id("key id", key_id);
            }
            match state.governance.revoke_key(key_id, &meta).await {
                Ok(revoked) => json_response(StatusCode::OK, &revoked),
                Err(e) => gatehouse_error_response(&e),
            }
        }

        _ => error_response(
            StatusCode::NOT_FOUND,
            &format!("No internal route for {}", path),
            Some("not_found"),
        ),
    }
}

/// The segment between `prefix` and `suffix`; empty when it is missing or
/// spans more than one segment
fn path_param<'a>(path: &'a str, prefix: &str, suffix: &str) -> &'a str {
    path.strip_prefix(prefix)
        .and_then(|s| s.strip_suffix(suffix))
        .filter(|s| !s.contains('/'))
        .unwrap_or("")
}

fn bad_id(what: &str, raw: &str) -> Response<FullBody> {
    error_response(
        StatusCode::BAD_REQUEST,
        &format!("invalid {}: {:?}", what, raw),
        Some("bad_request"),
    )
}

async fn handle_list_requests(req: Request<Incoming>, state: Arc<AppState>) -> Response<FullBody> {
    let params = query_params(req.uri().query());
    let param = |name: &str| {
        params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    };

    let limit = match param("limit").filter(|v| !v.is_empty()) {
        Some(raw) => match raw.parse::<i64>() {
            Ok(n) => Some(n),
            Err(_) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    &format!("invalid limit: {:?}", raw),
                    Some("bad_request"),
                )
            }
        },
        None => None,
    };

    match state.governance.list_requests(param("status"), limit).await {
        Ok(requests) => json_response(
            StatusCode::OK,
            &ListRequestsResponse {
                count: requests.len(),
                requests,
            },
        ),
        Err(e) => gatehouse_error_response(&e),
    }
}

async fn handle_decide(
    req: Request<Incoming>,
    state: Arc<AppState>,
    request_id: i64,
    meta: RequestMeta,
) -> Response<FullBody> {
    let body: DecideRequest = match parse_json_body(req, ADMIN_BODY_LIMIT).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };

    match state.governance.decide(request_id, body, &meta).await {
        Ok(decided) => json_response(StatusCode::OK, &decided),
        Err(e) => gatehouse_error_response(&e),
    }
}

async fn handle_promote(
    req: Request<Incoming>,
    state: Arc<AppState>,
    seq: i64,
    meta: RequestMeta,
) -> Response<FullBody> {
    let body: PromoteReportRequest = match parse_json_body(req, ADMIN_BODY_LIMIT).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };

    match state.governance.promote_report(seq, body, &meta).await {
        Ok(promoted) => json_response(StatusCode::OK, &promoted),
        Err(e) => gatehouse_error_response(&e),
    }
}

async fn handle_suspend(
    req: Request<Incoming>,
    state: Arc<AppState>,
    fetcher_id: &str,
    meta: RequestMeta,
) -> Response<FullBody> {
    let body: SuspendRequest = match parse_json_body(req, ADMIN_BODY_LIMIT).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };

    match state.governance.suspend_fetcher(fetcher_id, body, &meta).await {
        Ok(suspended) => json_response(StatusCode::OK, &suspended),
        Err(e) => gatehouse_error_response(&e),
    }
}

//! Fetcher-facing routes
//!
//! - POST /v1/fetchers/register                - self-registration (IP-limited)
//! - GET  /v1/fetchers/me                      - identity, caps and usage
//! - POST /v1/reports:bulkIngest               - bulk report admission
//! - POST /v1/fetchers/me/promotion-request    - ask for a governance upgrade
//! - GET  /v1/fetchers/me/promotion-status     - latest request
//!
//! Everything except registration requires `Authorization: Bearer <api key>`.

use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

use super::helpers::{
    gatehouse_error_response, get_auth_header, json_response, parse_json_body, request_meta,
    FullBody,
};
use crate::server::AppState;
use crate::services::{
    AuthenticatedFetcher, BulkIngestRequest, BulkIngestResponse, CreatePromotionRequest,
    RegisterRequest,
};

/// Body limit for the small JSON endpoints
const SMALL_BODY_LIMIT: usize = 64 * 1024;

/// Body of a 503 for a committed batch whose hand-off partly failed
#[derive(Debug, Serialize)]
struct QueuedFailedResponse<'a> {
    error: &'static str,
    code: &'static str,
    result: &'a BulkIngestResponse,
}

async fn authenticate(
    req: &Request<Incoming>,
    state: &AppState,
) -> Result<AuthenticatedFetcher, Response<FullBody>> {
    state
        .registration
        .authenticate(get_auth_header(req))
        .await
        .map_err(|e| gatehouse_error_response(&e))
}

/// POST /v1/fetchers/register
pub async fn handle_register(
    req: Request<Incoming>,
    state: Arc<AppState>,
    addr: SocketAddr,
) -> Response<FullBody> {
    let meta = request_meta(&req, addr);
    let body: RegisterRequest = match parse_json_body(req, SMALL_BODY_LIMIT).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };

    match state.registration.register(body, &meta).await {
        Ok(created) => json_response(StatusCode::CREATED, &created),
        Err(e) => gatehouse_error_response(&e),
    }
}

/// GET /v1/fetchers/me
pub async fn handle_fetcher_self(req: Request<Incoming>, state: Arc<AppState>) -> Response<FullBody> {
    let auth = match authenticate(&req, &state).await {
        Ok(a) => a,
        Err(resp) => return resp,
    };

    match state.registration.fetcher_self(&auth).await {
        Ok(view) => json_response(StatusCode::OK, &view),
        Err(e) => gatehouse_error_response(&e),
    }
}

/// POST /v1/reports:bulkIngest
///
/// 200 when every accepted or duplicate item reached the queue. When some
/// did not, the batch is still committed and the full result comes back
/// under a 503; resubmitting the same batch is safe.
pub async fn handle_bulk_ingest(
    req: Request<Incoming>,
    state: Arc<AppState>,
    addr: SocketAddr,
) -> Response<FullBody> {
    let auth = match authenticate(&req, &state).await {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let meta = request_meta(&req, addr);
    let body: BulkIngestRequest = match parse_json_body(req, state.args.ingest_max_body_bytes).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };

    match state.ingest.bulk_ingest(&auth, body, &meta).await {
        Ok(result) if result.all_queued() => json_response(StatusCode::OK, &result),
        Ok(result) => {
            warn!(
                fetcher_id = %auth.fetcher_id(),
                queue_failures = result.queue_failures,
                "Batch committed with queue failures"
            );
            json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &QueuedFailedResponse {
                    error: "queued_failed",
                    code: "queued_failed",
                    result: &result,
                },
            )
        }
        Err(e) => gatehouse_error_response(&e),
    }
}

/// POST /v1/fetchers/me/promotion-request
pub async fn handle_promotion_request(
    req: Request<Incoming>,
    state: Arc<AppState>,
    addr: SocketAddr,
) -> Response<FullBody> {
    let auth = match authenticate(&req, &state).await {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let meta = request_meta(&req, addr);
    let body: CreatePromotionRequest = match parse_json_body(req, SMALL_BODY_LIMIT).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };

    match state.governance.create_request(&auth, body, &meta).await {
        Ok(created) => json_response(StatusCode::CREATED, &created),
        Err(e) => gatehouse_error_response(&e),
    }
}

/// GET /v1/fetchers/me/promotion-status
pub async fn handle_promotion_status(req: Request<Incoming>, state: Arc<AppState>) -> Response<FullBody> {
    let auth = match authenticate(&req, &state).await {
        Ok(a) => a,
        Err(resp) => return resp,
    };

    match state.governance.promotion_status(&auth).await {
        Ok(status) => json_response(StatusCode::OK, &status),
        Err(e) => gatehouse_error_response(&e),
    }
}

//! HTTP server implementation
//!
//! Uses hyper http1 with TokioIo for async handling.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::auth::AdminTokenValidator;
use crate::config::Args;
use crate::logging::AuditLog;
use crate::queue::AnalysisQueue;
use crate::routes;
use crate::services::{GovernanceService, IngestService, RegistrationService};
use crate::store::Store;
use crate::types::GatehouseError;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Shared application state
pub struct AppState {
    pub args: Args,
    /// Credential, quota, report, promotion and audit storage
    pub store: Arc<dyn Store>,
    /// Analysis queue (report.raw / report.analysed)
    pub queue: Arc<dyn AnalysisQueue>,
    /// Background audit writer
    pub audit: AuditLog,
    pub registration: RegistrationService,
    pub ingest: IngestService,
    pub governance: GovernanceService,
    /// Validator for X-Internal-Admin-Token
    pub admin: AdminTokenValidator,
    pub started_at: Instant,
}

impl AppState {
    /// Wire the services over a store and queue. Must run inside a tokio
    /// runtime; the audit writer task is spawned here.
    pub fn new(args: Args, store: Arc<dyn Store>, queue: Arc<dyn AnalysisQueue>) -> Self {
        let audit = AuditLog::spawn(Arc::clone(&store), args.audit_queue_capacity);

        let registration = RegistrationService::new(
            Arc::clone(&store),
            audit.clone(),
            args.registration_config(),
        );
        let ingest = IngestService::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            audit.clone(),
            args.ingest_config(),
        );
        let governance = GovernanceService::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            audit.clone(),
            args.step_timeout(),
        );
        let admin = AdminTokenValidator::new(args.internal_admin_token.clone());

        Self {
            args,
            store,
            queue,
            audit,
            registration,
            ingest,
            governance,
            admin,
            started_at: Instant::now(),
        }
    }
}

pub async fn run(state: Arc<AppState>) -> Result<(), GatehouseError> {
    let listener = TcpListener::bind(state.args.listen).await?;

    info!(
        "Gatehouse listening on {} (store: {}, queue: {})",
        state.args.listen,
        state.store.backend(),
        state.queue.name()
    );

    if state.args.dev_mode {
        warn!("Development mode enabled");
    }
    if !state.admin.is_configured() {
        warn!("INTERNAL_ADMIN_TOKEN not set - /internal routes disabled");
    }

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new()
                        .preserve_header_case(true)
                        .title_case_headers(true)
                        .serve_connection(io, service)
                        .await
                    {
                        debug!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

/// Route incoming HTTP requests
pub async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    info!("[{}] {} {}", addr, method, path);

    if method == Method::OPTIONS {
        return Ok(to_boxed(preflight_response()));
    }

    // Admin surface: /internal/*
    if path.starts_with("/internal/") {
        return Ok(to_boxed(
            routes::handle_internal_request(req, Arc::clone(&state), addr).await,
        ));
    }

    let response = match (method, path.as_str()) {
        // Liveness probe - returns 200 while the process is up
        (Method::GET, "/health") | (Method::GET, "/healthz") => {
            to_boxed(routes::health_check(Arc::clone(&state)))
        }

        // Readiness probe - returns 200 only if the store answers
        (Method::GET, "/ready") | (Method::GET, "/readyz") => {
            to_boxed(routes::readiness_check(Arc::clone(&state)).await)
        }

        (Method::GET, "/version") => to_boxed(routes::version_info()),

        (Method::POST, "/v1/fetchers/register") => {
            to_boxed(routes::handle_register(req, Arc::clone(&state), addr).await)
        }

        (Method::GET, "/v1/fetchers/me") => {
            to_boxed(routes::handle_fetcher_self(req, Arc::clone(&state)).await)
        }

        (Method::POST, "/v1/reports:bulkIngest") => {
            to_boxed(routes::handle_bulk_ingest(req, Arc::clone(&state), addr).await)
        }

        (Method::POST, "/v1/fetchers/me/promotion-request") => {
            to_boxed(routes::handle_promotion_request(req, Arc::clone(&state), addr).await)
        }

        (Method::GET, "/v1/fetchers/me/promotion-status") => {
            to_boxed(routes::handle_promotion_status(req, Arc::clone(&state)).await)
        }

        (_, "/v1/fetchers/register")
        | (_, "/v1/fetchers/me")
        | (_, "/v1/reports:bulkIngest")
        | (_, "/v1/fetchers/me/promotion-request")
        | (_, "/v1/fetchers/me/promotion-status") => to_boxed(method_not_allowed_response()),

        _ => to_boxed(not_found_response(&path)),
    };

    Ok(response)
}

fn to_boxed(response: Response<Full<Bytes>>) -> Response<BoxBody> {
    response.map(|body| body.map_err(|never| match never {}).boxed())
}

/// CORS preflight response
fn preflight_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Headers", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
        .body(Full::new(Bytes::new()))
        .unwrap()
}

/// Not found response
fn not_found_response(path: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "error": "Not Found",
        "code": "not_found",
        "path": path,
    });

    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

fn method_not_allowed_response() -> Response<Full<Bytes>> {
    routes::error_response(
        StatusCode::METHOD_NOT_ALLOWED,
        "Method not allowed",
        Some("method_not_allowed"),
    )
}

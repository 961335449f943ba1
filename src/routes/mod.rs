//! HTTP routes for Gatehouse

pub mod fetcher;
pub mod health;
pub mod helpers;
pub mod internal;

pub use fetcher::{
    handle_bulk_ingest, handle_fetcher_self, handle_promotion_request, handle_promotion_status,
    handle_register,
};
pub use health::{health_check, readiness_check, version_info};
pub use helpers::{error_response, gatehouse_error_response, json_response, FullBody};
pub use internal::handle_internal_request;

//! Gatehouse - admission control and governance for crowdsourced reports
//!
//! Gatehouse sits in front of the report pipeline. Automated fetchers
//! register, authenticate with API keys and submit reports in bulk; each
//! batch is charged against per-key quota, deduplicated by source id,
//! stored in quarantine and handed to the analysis queue. Operators review
//! promotion requests and promote individual reports out of quarantine.
//!
//! ## Services
//!
//! - **Registration**: self-registration and API key authentication
//! - **Ingest**: quota, dedup, quarantine storage and queue hand-off
//! - **Governance**: promotion requests, report promotion, suspension, key revocation
//! - **Audit**: moderation events and ingestion lines written in the background

pub mod auth;
pub mod config;
pub mod db;
pub mod logging;
pub mod queue;
pub mod routes;
pub mod server;
pub mod services;
pub mod store;
pub mod types;

pub use config::Args;
pub use server::{run, AppState};
pub use types::{GatehouseError, Result};

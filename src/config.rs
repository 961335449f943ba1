//! Configuration for Gatehouse
//!
//! CLI arguments and environment variable handling using clap.

use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::time::Duration;

use crate::auth::KeyEnvironment;
use crate::db::schemas::FetcherDefaults;
use crate::queue::{ANALYSED_SUBJECT, RAW_SUBJECT};
use crate::services::{IngestConfig, QuotaCharge, RegistrationConfig};

/// Gatehouse - admission control and governance for crowdsourced reports
#[derive(Parser, Debug, Clone)]
#[command(name = "gatehouse")]
#[command(about = "Admission-control and governance gateway for report ingestion")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Enable development mode (in-memory fallbacks, no admin token required)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// Shared token for the /internal routes (X-Internal-Admin-Token)
    #[arg(long, env = "INTERNAL_ADMIN_TOKEN")]
    pub internal_admin_token: Option<String>,

    /// MongoDB connection URI (must point at a replica set)
    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    pub mongodb_uri: String,

    /// MongoDB database name
    #[arg(long, env = "MONGODB_DB", default_value = "gatehouse")]
    pub mongodb_db: String,

    /// NATS configuration
    #[command(flatten)]
    pub nats: NatsArgs,

    /// Environment prefix for issued keys; keys of the other environment are rejected
    #[arg(long, env = "FETCHER_KEY_ENV", value_enum, default_value_t = KeyEnvironment::Test)]
    pub fetcher_key_env: KeyEnvironment,

    /// Registrations allowed per client IP per hour (0 disables the limit)
    #[arg(long, env = "REGISTER_MAX_PER_HOUR_PER_IP", default_value = "10")]
    pub register_max_per_hour_per_ip: u32,

    /// Maximum items in one bulk ingest request
    #[arg(long, env = "INGEST_MAX_BATCH_ITEMS", default_value = "1000")]
    pub ingest_max_batch_items: usize,

    /// Maximum request body size in bytes
    #[arg(long, env = "INGEST_MAX_BODY_BYTES", default_value = "10485760")]
    pub ingest_max_body_bytes: usize,

    /// Deadline for each storage or queue step, in milliseconds
    #[arg(long, env = "STEP_TIMEOUT_MS", default_value = "5000")]
    pub step_timeout_ms: u64,

    /// Default per-minute item cap for new fetchers
    #[arg(long, env = "DEFAULT_PER_MINUTE_CAP", default_value = "20")]
    pub default_per_minute_cap: i64,

    /// Default daily item cap for new fetchers
    #[arg(long, env = "DEFAULT_DAILY_CAP", default_value = "200")]
    pub default_daily_cap: i64,

    /// What a batch is charged against quota: every submitted item, or only novel ones
    #[arg(long, env = "QUOTA_CHARGE", value_enum, default_value_t = QuotaCharge::Submitted)]
    pub quota_charge: QuotaCharge,

    /// Capacity of the background audit queue
    #[arg(long, env = "AUDIT_QUEUE_CAPACITY", default_value = "1024")]
    pub audit_queue_capacity: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Plain)]
    pub log_format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Plain,
    Json,
}

/// NATS connection arguments
#[derive(Parser, Debug, Clone)]
pub struct NatsArgs {
    /// NATS server URL
    #[arg(long, env = "NATS_URL", default_value = "nats://127.0.0.1:4222")]
    pub nats_url: String,

    /// NATS username (optional)
    #[arg(long, env = "NATS_USER")]
    pub nats_user: Option<String>,

    /// NATS password (optional)
    #[arg(long, env = "NATS_PASSWORD")]
    pub nats_password: Option<String>,

    /// Subject for newly admitted reports
    #[arg(long, env = "RAW_SUBJECT", default_value = RAW_SUBJECT)]
    pub raw_subject: String,

    /// Subject for promoted reports with their analysis
    #[arg(long, env = "ANALYSED_SUBJECT", default_value = ANALYSED_SUBJECT)]
    pub analysed_subject: String,

    /// Publish through JetStream and wait for the ack; false uses core publish + flush
    #[arg(
        long,
        env = "NATS_JETSTREAM",
        default_value = "true",
        action = clap::ArgAction::Set
    )]
    pub nats_jetstream: bool,
}

impl Args {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn registration_config(&self) -> RegistrationConfig {
        RegistrationConfig {
            key_environment: self.fetcher_key_env,
            defaults: FetcherDefaults {
                per_minute_cap_items: self.default_per_minute_cap,
                daily_cap_items: self.default_daily_cap,
                ..FetcherDefaults::default()
            },
            max_per_hour_per_ip: self.register_max_per_hour_per_ip,
        }
    }

    pub fn ingest_config(&self) -> IngestConfig {
        IngestConfig {
            max_batch_items: self.ingest_max_batch_items,
            step_timeout: self.step_timeout(),
            quota_charge: self.quota_charge,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if !self.dev_mode {
            let token = self.internal_admin_token.as_deref().unwrap_or_default();
            if token.trim().is_empty() {
                return Err("INTERNAL_ADMIN_TOKEN is required in production mode".to_string());
            }
        }

        if self.ingest_max_batch_items == 0 {
            return Err("INGEST_MAX_BATCH_ITEMS must be at least 1".to_string());
        }

        if self.ingest_max_body_bytes == 0 {
            return Err("INGEST_MAX_BODY_BYTES must be at least 1".to_string());
        }

        if self.step_timeout_ms == 0 {
            return Err("STEP_TIMEOUT_MS must be at least 1".to_string());
        }

        if self.default_per_minute_cap < 0 || self.default_daily_cap < 0 {
            return Err("default caps must not be negative".to_string());
        }

        if self.audit_queue_capacity == 0 {
            return Err("AUDIT_QUEUE_CAPACITY must be at least 1".to_string());
        }

        Ok(())
    }
}

//! Fetcher registration and API key authentication
//!
//! Registration is open but limited per client address. Authentication is a
//! point lookup by the key id embedded in the presented key followed by an
//! Argon2 verification of the secret. Every authentication failure looks
//! the same to the caller.

use bson::DateTime;
use chrono::{DurationRound, TimeDelta, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::quota::{EffectiveCaps, RemainingQuota, UsageSnapshot};
use super::RequestMeta;
use crate::auth::{
    constant_time_compare, extract_bearer, format_api_key, generate_secret, hash_secret,
    parse_api_key, verify_secret, KeyEnvironment, Scope, ScopeSet,
};
use crate::db::schemas::{FetcherDefaults, FetcherDoc, FetcherKeyDoc, IngestionAuditDoc};
use crate::logging::AuditLog;
use crate::store::Store;
use crate::types::{
    FetcherStatus, GatehouseError, OwnerType, Result, TrustLevel, Visibility,
};

/// Audit endpoint name for registrations
pub const REGISTER_ENDPOINT: &str = "/v1/fetchers/register";

/// Limiter entries kept before stale hours are swept
const LIMITER_SWEEP_THRESHOLD: usize = 10_000;

fn invalid_key() -> GatehouseError {
    GatehouseError::Unauthorized("invalid api key".into())
}

// ============================================================================
// Types
// ============================================================================

/// Registration body
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub name: Option<String>,
    /// `internal`, `partner` or `openclaw`; anything else is `unknown`
    #[serde(default)]
    pub owner_type: Option<String>,
}

/// Registration result. `api_key` is the only time the secret is shown.
#[derive(Debug, Clone, Serialize)]
pub struct RegisterResponse {
    pub fetcher_id: String,
    pub key_id: String,
    pub api_key: String,
    pub name: String,
    pub owner_type: OwnerType,
    pub status: FetcherStatus,
    pub tier: i32,
    pub caps: EffectiveCaps,
    pub scopes: Vec<String>,
    pub default_visibility: Visibility,
    pub default_trust_level: TrustLevel,
}

/// A caller that presented a valid key
#[derive(Debug, Clone)]
pub struct AuthenticatedFetcher {
    pub fetcher: FetcherDoc,
    pub key: FetcherKeyDoc,
    pub caps: EffectiveCaps,
}

impl AuthenticatedFetcher {
    pub fn fetcher_id(&self) -> &str {
        &self.fetcher.fetcher_id
    }

    pub fn key_id(&self) -> &str {
        &self.key.key_id
    }

    pub fn require_scope(&self, scope: Scope) -> Result<()> {
        if self.key.scopes.contains(scope) {
            Ok(())
        } else {
            Err(GatehouseError::Forbidden("insufficient scope".into()))
        }
    }
}

/// Current usage as shown to the fetcher
#[derive(Debug, Clone, Serialize)]
pub struct UsageView {
    pub minute_used: i64,
    pub daily_used: i64,
    #[serde(flatten)]
    pub remaining: RemainingQuota,
}

impl UsageView {
    fn new(usage: UsageSnapshot, caps: EffectiveCaps) -> Self {
        Self {
            minute_used: usage.minute_used,
            daily_used: usage.daily_used,
            remaining: usage.remaining(caps),
        }
    }
}

/// `GET /v1/fetchers/me`
#[derive(Debug, Clone, Serialize)]
pub struct FetcherSelfResponse {
    pub fetcher_id: String,
    pub key_id: String,
    pub name: String,
    pub owner_type: OwnerType,
    pub status: FetcherStatus,
    pub active: bool,
    pub tier: i32,
    pub reputation_score: i32,
    pub caps: EffectiveCaps,
    pub usage: UsageView,
    pub scopes: Vec<String>,
    pub default_visibility: Visibility,
    pub default_trust_level: TrustLevel,
    pub routing_enabled: bool,
    pub rewards_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified_domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<String>,
}

// ============================================================================
// Registration limiter
// ============================================================================

/// Fixed-window registration counter per client address
pub struct RegistrationLimiter {
    max_per_hour: u32,
    windows: DashMap<String, (chrono::DateTime<Utc>, u32)>,
}

impl RegistrationLimiter {
    /// `max_per_hour` of 0 disables the limit
    pub fn new(max_per_hour: u32) -> Self {
        Self {
            max_per_hour,
            windows: DashMap::new(),
        }
    }

    /// Count one registration from `ip`, or refuse it
    pub fn check(&self, ip: &str, now: chrono::DateTime<Utc>) -> Result<()> {
        if self.max_per_hour == 0 {
            return Ok(());
        }

        let hour = now.duration_trunc(TimeDelta::hours(1)).unwrap_or(now);
        if self.windows.len() > LIMITER_SWEEP_THRESHOLD {
            self.windows.retain(|_, (window, _)| *window == hour);
        }

        let mut entry = self.windows.entry(ip.to_string()).or_insert((hour, 0));
        if entry.0 != hour {
            *entry = (hour, 0);
        }
        if entry.1 >= self.max_per_hour {
            return Err(GatehouseError::RateLimited(
                "too many registrations from this address".into(),
            ));
        }
        entry.1 += 1;
        Ok(())
    }
}

// ============================================================================
// Registration service
// ============================================================================

/// Service configuration
#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    /// Keys are issued with, and only accepted for, this environment
    pub key_environment: KeyEnvironment,
    pub defaults: FetcherDefaults,
    pub max_per_hour_per_ip: u32,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            key_environment: KeyEnvironment::Test,
            defaults: FetcherDefaults::default(),
            max_per_hour_per_ip: 10,
        }
    }
}

pub struct RegistrationService {
    store: Arc<dyn Store>,
    audit: AuditLog,
    limiter: RegistrationLimiter,
    config: RegistrationConfig,
}

impl RegistrationService {
    pub fn new(store: Arc<dyn Store>, audit: AuditLog, config: RegistrationConfig) -> Self {
        Self {
            store,
            audit,
            limiter: RegistrationLimiter::new(config.max_per_hour_per_ip),
            config,
        }
    }

    /// Create a fetcher with one active key
    pub async fn register(&self, req: RegisterRequest, meta: &RequestMeta) -> Result<RegisterResponse> {
        let started = Instant::now();
        let result = self.register_inner(req, meta).await;

        let line = IngestionAuditDoc::new(REGISTER_ENDPOINT)
            .with_latency(started.elapsed().as_millis())
            .with_request(meta.remote_ip.clone(), meta.user_agent.clone(), meta.request_id.clone());
        let line = match &result {
            Ok(resp) => line
                .with_fetcher(&resp.fetcher_id, &resp.key_id)
                .with_outcome("registered", 201),
            Err(e) => line.with_outcome(e.code(), e.status_code().as_u16()),
        };
        self.audit.record_ingestion(line);

        result
    }

    async fn register_inner(&self, req: RegisterRequest, meta: &RequestMeta) -> Result<RegisterResponse> {
        let ip = meta.remote_ip.as_deref().unwrap_or("unknown");
        self.limiter.check(ip, Utc::now())?;

        let owner_type = OwnerType::from_input(req.owner_type.as_deref());
        let fetcher_id = Uuid::new_v4().to_string();
        let key_id = Uuid::new_v4().to_string();
        let secret = generate_secret();

        let to_hash = secret.clone();
        let key_hash = tokio::task::spawn_blocking(move || hash_secret(&to_hash))
            .await
            .map_err(|e| GatehouseError::Internal(format!("hashing task failed: {}", e)))??;

        let prefix = self.config.key_environment.prefix();
        let fetcher = FetcherDoc::new(
            fetcher_id.clone(),
            req.name.as_deref().unwrap_or_default(),
            owner_type,
            self.config.defaults,
        );
        let key = FetcherKeyDoc::new(
            key_id.clone(),
            fetcher_id.clone(),
            prefix,
            key_hash,
            ScopeSet::fetcher_default(),
        );
        let caps = EffectiveCaps::resolve(&fetcher, &key);

        let response = RegisterResponse {
            fetcher_id: fetcher_id.clone(),
            key_id: key_id.clone(),
            api_key: format_api_key(self.config.key_environment, &key_id, &secret),
            name: fetcher.name.clone(),
            owner_type,
            status: fetcher.status,
            tier: fetcher.tier,
            caps,
            scopes: key.scopes.to_strings(),
            default_visibility: fetcher.default_visibility,
            default_trust_level: fetcher.default_trust_level,
        };

        // An id collision is a storage fault, not a client conflict
        self.store
            .insert_fetcher_with_key(fetcher, key)
            .await
            .map_err(|e| match e {
                GatehouseError::DuplicateKey(msg) => GatehouseError::Database(msg),
                other => other,
            })?;

        info!(
            fetcher_id = %fetcher_id,
            owner_type = %owner_type,
            ip = %ip,
            "Registered fetcher"
        );
        Ok(response)
    }

    /// Resolve an `Authorization` header to a fetcher and key
    pub async fn authenticate(&self, authorization: Option<&str>) -> Result<AuthenticatedFetcher> {
        let raw = extract_bearer(authorization).ok_or_else(invalid_key)?;
        let parsed = parse_api_key(raw).ok_or_else(invalid_key)?;

        if parsed.environment != self.config.key_environment {
            debug!(key_id = %parsed.key_id, "Key presented for the wrong environment");
            return Err(invalid_key());
        }

        let (key, fetcher) = self
            .store
            .get_key_with_fetcher(&parsed.key_id)
            .await?
            .ok_or_else(invalid_key)?;

        if !constant_time_compare(&key.key_prefix, parsed.prefix()) {
            return Err(invalid_key());
        }
        if !key.is_active() || !fetcher.can_submit() {
            debug!(key_id = %key.key_id, fetcher_id = %fetcher.fetcher_id, "Key or fetcher not usable");
            return Err(invalid_key());
        }

        let secret = parsed.secret;
        let hash = key.key_hash.clone();
        let verified = tokio::task::spawn_blocking(move || verify_secret(&secret, &hash))
            .await
            .map_err(|e| GatehouseError::Internal(format!("verify task failed: {}", e)))?;
        if !verified {
            return Err(invalid_key());
        }

        if let Err(e) = self
            .store
            .touch_key(&fetcher.fetcher_id, &key.key_id, DateTime::now())
            .await
        {
            warn!(key_id = %key.key_id, "Failed to record key use: {}", e);
        }

        let caps = EffectiveCaps::resolve(&fetcher, &key);
        Ok(AuthenticatedFetcher { fetcher, key, caps })
    }

    /// Identity, governance and current usage for the caller
    pub async fn fetcher_self(&self, auth: &AuthenticatedFetcher) -> Result<FetcherSelfResponse> {
        auth.require_scope(Scope::FetcherRead)?;

        let usage = self
            .store
            .usage(auth.fetcher_id(), auth.key_id(), Utc::now())
            .await?;
        let f = &auth.fetcher;

        Ok(FetcherSelfResponse {
            fetcher_id: f.fetcher_id.clone(),
            key_id: auth.key.key_id.clone(),
            name: f.name.clone(),
            owner_type: f.owner_type,
            status: f.status,
            active: f.active,
            tier: f.tier,
            reputation_score: f.reputation_score,
            caps: auth.caps,
            usage: UsageView::new(usage, auth.caps),
            scopes: auth.key.scopes.to_strings(),
            default_visibility: f.default_visibility,
            default_trust_level: f.default_trust_level,
            routing_enabled: f.routing_enabled,
            rewards_enabled: f.rewards_enabled,
            verified_domain: f.verified_domain.clone(),
            last_seen_at: f.last_seen_at.map(|t| t.to_chrono().to_rfc3339()),
        })
    }
}

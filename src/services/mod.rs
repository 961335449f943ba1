//! Services layer for Gatehouse
//!
//! Business logic between the HTTP routes and the store/queue seams.
//!
//! ## Services
//!
//! - **Registration**: fetcher self-registration, key authentication, self view
//! - **Quota**: cap resolution and minute/day window arithmetic
//! - **Ingest**: bulk report admission (quota, dedup, quarantine, hand-off)
//! - **Governance**: promotion requests, report promotion, suspension, revocation

use std::future::Future;
use std::time::Duration;

use crate::types::{GatehouseError, Result};

pub mod governance;
pub mod ingest;
pub mod quota;
pub mod registration;

pub use governance::{
    CreatePromotionRequest, DecideRequest, GovernanceService, PromoteReportRequest,
    PromoteReportResponse, PromotionStatusResponse, SuspendRequest,
};
pub use ingest::{
    BulkIngestRequest, BulkIngestResponse, IngestConfig, IngestItem, IngestService, ItemResult,
    ItemStatus, QuotaCharge,
};
pub use quota::{EffectiveCaps, RemainingQuota, UsageSnapshot};
pub use registration::{
    AuthenticatedFetcher, FetcherSelfResponse, RegisterRequest, RegisterResponse,
    RegistrationConfig, RegistrationLimiter, RegistrationService,
};

/// Request context carried into audit records
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    /// Client address (first X-Forwarded-For entry, else the peer)
    pub remote_ip: Option<String>,
    /// X-Request-Id
    pub request_id: Option<String>,
    pub user_agent: Option<String>,
    /// X-Admin-Actor
    pub actor: Option<String>,
}

impl RequestMeta {
    /// Admin actor name, falling back to `internal_admin`
    pub fn admin_actor(&self, explicit: Option<&str>) -> String {
        let present = |s: &&str| !s.trim().is_empty();
        explicit
            .filter(present)
            .or(self.actor.as_deref().filter(present))
            .map(str::trim)
            .unwrap_or("internal_admin")
            .to_string()
    }
}

/// Run one step under a deadline; expiry becomes `Timeout(step)`
pub async fn with_timeout<T, F>(step: &str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(GatehouseError::Timeout(step.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_actor_fallback() {
        let meta = RequestMeta {
            actor: Some("ops@example".into()),
            ..Default::default()
        };
        assert_eq!(meta.admin_actor(Some("alice")), "alice");
        assert_eq!(meta.admin_actor(Some("  ")), "ops@example");
        assert_eq!(meta.admin_actor(None), "ops@example");
        assert_eq!(RequestMeta::default().admin_actor(None), "internal_admin");
    }

    #[tokio::test]
    async fn test_with_timeout_names_step() {
        let result: Result<()> = with_timeout("quota", Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await;

        match result {
            Err(GatehouseError::Timeout(step)) => assert_eq!(step, "quota"),
            other => panic!("unexpected {:?}", other),
        }
    }
}

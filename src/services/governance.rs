//! Governance workflows
//!
//! - Fetcher promotion requests: `pending -> approved | denied | needs_info`
//! - Report promotion out of quarantine, with a one-time republish of the
//!   analysed report
//! - Fetcher suspension and key revocation
//!
//! Every mutation here records one moderation event.

use bson::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::registration::AuthenticatedFetcher;
use super::{with_timeout, RequestMeta};
use crate::auth::Scope;
use crate::db::schemas::{
    actions, clamp_chars, FetcherSettings, ModerationEventDoc, PromotionRequestDoc,
    RequestedSettings, MIN_NOTES_LEN,
};
use crate::logging::AuditLog;
use crate::queue::{AnalysedReportMessage, AnalysisQueue};
use crate::store::{PromotionDecision, Store};
use crate::types::{
    FetcherStatus, GatehouseError, KeyStatus, PromotionStatus, Result, TrustLevel, Visibility,
};

pub const DEFAULT_LIST_LIMIT: i64 = 50;
pub const MAX_LIST_LIMIT: i64 = 200;

const MAX_NOTES_LEN: usize = 4096;
const MAX_CONTACT_LEN: usize = 255;

fn rfc3339(t: Option<DateTime>) -> Option<String> {
    t.map(|t| t.to_chrono().to_rfc3339())
}

fn trimmed(value: Option<String>, max: usize) -> Option<String> {
    value
        .map(|s| clamp_chars(s.trim(), max))
        .filter(|s| !s.is_empty())
}

// ============================================================================
// Types
// ============================================================================

/// `POST /v1/fetchers/me/promotion-request`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreatePromotionRequest {
    #[serde(default)]
    pub contact_email: Option<String>,
    #[serde(default)]
    pub verified_domain: Option<String>,
    #[serde(default, alias = "requested_settings")]
    pub requested: RequestedSettings,
    #[serde(default)]
    pub notes: Option<String>,
}

/// A promotion request as rendered over HTTP
#[derive(Debug, Clone, Serialize)]
pub struct PromotionRequestView {
    pub request_id: i64,
    pub fetcher_id: String,
    pub status: PromotionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified_domain: Option<String>,
    pub requested: RequestedSettings,
    pub notes: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision_notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewed_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied: Option<FetcherSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl From<PromotionRequestDoc> for PromotionRequestView {
    fn from(doc: PromotionRequestDoc) -> Self {
        Self {
            created_at: rfc3339(doc.created_at()),
            request_id: doc.request_id,
            fetcher_id: doc.fetcher_id,
            status: doc.status,
            contact_email: doc.contact_email,
            verified_domain: doc.verified_domain,
            requested: doc.requested,
            notes: doc.notes,
            decision_notes: doc.decision_notes,
            reviewed_by: doc.reviewed_by,
            reviewed_at: rfc3339(doc.reviewed_at),
            applied: doc.applied,
        }
    }
}

/// `GET /v1/fetchers/me/promotion-status`
#[derive(Debug, Clone, Serialize)]
pub struct PromotionStatusResponse {
    /// `none` or the latest request's status
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<PromotionRequestView>,
}

/// `POST /internal/fetcher-promotion-requests/{id}/decide`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DecideRequest {
    pub decision: String,
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub decision_notes: Option<String>,
    #[serde(default)]
    pub settings: Option<FetcherSettings>,
}

/// `POST /internal/reports/{seq}/promote`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PromoteReportRequest {
    #[serde(default)]
    pub visibility: Option<Visibility>,
    #[serde(default)]
    pub trust_level: Option<TrustLevel>,
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PromoteReportResponse {
    pub report_seq: i64,
    pub visibility: Visibility,
    pub trust_level: TrustLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promoted_to_public_at: Option<String>,
    /// Whether this call republished the analysed report
    pub published_analysed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish_error: Option<String>,
}

/// `POST /internal/fetchers/{fetcher_id}/suspend`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SuspendRequest {
    /// `limited`, `suspended` (default) or `banned`
    #[serde(default)]
    pub status: Option<FetcherStatus>,
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuspendResponse {
    pub fetcher_id: String,
    pub status: FetcherStatus,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RevokeResponse {
    pub key_id: String,
    pub fetcher_id: String,
    pub status: KeyStatus,
}

// ============================================================================
// Governance service
// ============================================================================

pub struct GovernanceService {
    store: Arc<dyn Store>,
    queue: Arc<dyn AnalysisQueue>,
    audit: AuditLog,
    step_timeout: Duration,
}

impl GovernanceService {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn AnalysisQueue>,
        audit: AuditLog,
        step_timeout: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            audit,
            step_timeout,
        }
    }

    fn record(&self, event: ModerationEventDoc, meta: &RequestMeta) {
        self.audit.record_moderation(
            event
                .with_actor_ip(meta.remote_ip.clone())
                .with_request_id(meta.request_id.clone()),
        );
    }

    /// Open a promotion request for the calling fetcher
    pub async fn create_request(
        &self,
        auth: &AuthenticatedFetcher,
        req: CreatePromotionRequest,
        meta: &RequestMeta,
    ) -> Result<PromotionRequestView> {
        auth.require_scope(Scope::FetcherRead)?;

        let notes = req.notes.as_deref().unwrap_or_default().trim();
        if notes.chars().count() < MIN_NOTES_LEN {
            return Err(GatehouseError::BadRequest(format!(
                "notes must be at least {} characters",
                MIN_NOTES_LEN
            )));
        }

        let mut doc = PromotionRequestDoc::new(
            auth.fetcher_id().to_string(),
            clamp_chars(notes, MAX_NOTES_LEN),
            req.requested,
        );
        doc.contact_email = trimmed(req.contact_email, MAX_CONTACT_LEN);
        doc.verified_domain = trimmed(req.verified_domain, MAX_CONTACT_LEN);

        let created = self.store.create_request(doc).await?;

        info!(
            fetcher_id = %created.fetcher_id,
            request_id = created.request_id,
            "Promotion request created"
        );
        self.record(
            ModerationEventDoc::new(
                &format!("fetcher:{}", created.fetcher_id),
                actions::PROMOTION_REQUEST_CREATE,
                "promotion_request",
                created.request_id,
            )
            .with_details(json!({
                "fetcher_id": created.fetcher_id,
                "requested": created.requested,
            })),
            meta,
        );

        Ok(created.into())
    }

    /// Latest request for the calling fetcher
    pub async fn promotion_status(&self, auth: &AuthenticatedFetcher) -> Result<PromotionStatusResponse> {
        auth.require_scope(Scope::FetcherRead)?;

        Ok(match self.store.latest_request(auth.fetcher_id()).await? {
            Some(doc) => PromotionStatusResponse {
                status: doc.status.to_string(),
                request: Some(doc.into()),
            },
            None => PromotionStatusResponse {
                status: "none".to_string(),
                request: None,
            },
        })
    }

    /// Requests in a status (default pending), oldest first
    pub async fn list_requests(
        &self,
        status: Option<&str>,
        limit: Option<i64>,
    ) -> Result<Vec<PromotionRequestView>> {
        let status = match status {
            Some(s) if !s.trim().is_empty() => s.parse()?,
            _ => PromotionStatus::Pending,
        };
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);

        let docs = self.store.list_requests(status, limit).await?;
        Ok(docs.into_iter().map(Into::into).collect())
    }

    /// Settle a pending request. Only one decision ever lands.
    pub async fn decide(
        &self,
        request_id: i64,
        req: DecideRequest,
        meta: &RequestMeta,
    ) -> Result<PromotionRequestView> {
        let decision: PromotionStatus = req.decision.parse()?;
        if !decision.is_terminal() {
            return Err(GatehouseError::BadRequest(
                "decision must be approved, denied or needs_info".into(),
            ));
        }

        let settings = match decision {
            PromotionStatus::Approved => {
                let settings = req
                    .settings
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| {
                        GatehouseError::BadRequest("approval requires a settings bundle".into())
                    })?;
                Some(settings.validate()?)
            }
            _ => None,
        };

        let actor = meta.admin_actor(req.actor.as_deref());
        let decided = self
            .store
            .decide_request(PromotionDecision {
                request_id,
                status: decision,
                actor: actor.clone(),
                decision_notes: trimmed(req.decision_notes, MAX_NOTES_LEN),
                settings: settings.clone(),
                at: DateTime::now(),
            })
            .await?;

        info!(
            request_id,
            fetcher_id = %decided.fetcher_id,
            decision = %decision,
            actor = %actor,
            "Promotion request decided"
        );
        self.record(
            ModerationEventDoc::new(
                &actor,
                actions::PROMOTION_REQUEST_DECIDE,
                "promotion_request",
                request_id,
            )
            .with_details(json!({
                "fetcher_id": decided.fetcher_id,
                "decision": decision,
                "decision_notes": decided.decision_notes,
                "settings": settings,
            })),
            meta,
        );

        Ok(decided.into())
    }

    /// Raise a report's visibility and trust, never lowering either
    pub async fn promote_report(
        &self,
        seq: i64,
        req: PromoteReportRequest,
        meta: &RequestMeta,
    ) -> Result<PromoteReportResponse> {
        let visibility = req.visibility.unwrap_or(Visibility::Public);
        let trust_level = req.trust_level.unwrap_or(TrustLevel::Verified);
        let actor = meta.admin_actor(req.actor.as_deref());

        let raw = self
            .store
            .apply_promotion(seq, visibility, trust_level, DateTime::now())
            .await?;

        let (published_analysed, publish_error) = if raw.visibility == Visibility::Public
            && raw.promoted_to_public_at.is_some()
            && raw.analysed_published_at.is_none()
        {
            self.publish_analysed(seq).await
        } else {
            (false, None)
        };

        info!(
            seq,
            visibility = %raw.visibility,
            trust_level = %raw.trust_level,
            published_analysed,
            actor = %actor,
            "Report promoted"
        );
        self.record(
            ModerationEventDoc::new(&actor, actions::REPORT_PROMOTE, "report", seq).with_details(
                json!({
                    "requested_visibility": visibility,
                    "requested_trust_level": trust_level,
                    "visibility": raw.visibility,
                    "trust_level": raw.trust_level,
                    "published_analysed": published_analysed,
                    "reason": req.reason,
                }),
            ),
            meta,
        );

        Ok(PromoteReportResponse {
            report_seq: seq,
            visibility: raw.visibility,
            trust_level: raw.trust_level,
            promoted_to_public_at: rfc3339(raw.promoted_to_public_at),
            published_analysed,
            publish_error,
        })
    }

    /// Claim, publish, and release the claim on failure so a later
    /// promotion retries. A report with no analysis rows yet counts as a
    /// failure.
    async fn publish_analysed(&self, seq: i64) -> (bool, Option<String>) {
        let claim_at = DateTime::now();
        match self.store.claim_analysed_publish(seq, claim_at).await {
            Ok(true) => {}
            Ok(false) => return (false, None),
            Err(e) => return (false, Some(e.message().to_string())),
        }

        let published: Result<()> = async {
            let report = self
                .store
                .get_report(seq)
                .await?
                .ok_or_else(|| GatehouseError::NotFound(format!("report {} not found", seq)))?;
            let analyses = self.store.load_analyses(seq).await?;
            if analyses.is_empty() {
                return Err(GatehouseError::NotFound(format!(
                    "no analysis rows for seq {}",
                    seq
                )));
            }
            let message = AnalysedReportMessage::new(&report, &analyses);
            with_timeout("publish", self.step_timeout, self.queue.publish_analysed(&message)).await
        }
        .await;

        match published {
            Ok(()) => (true, None),
            Err(e) => {
                warn!(seq, "Analysed publish failed, releasing claim: {}", e);
                if let Err(release) = self.store.release_analysed_publish(seq, claim_at).await {
                    warn!(seq, "Failed to release publish claim: {}", release);
                }
                (false, Some(e.message().to_string()))
            }
        }
    }

    /// Restrict a fetcher and clear its active flag
    pub async fn suspend_fetcher(
        &self,
        fetcher_id: &str,
        req: SuspendRequest,
        meta: &RequestMeta,
    ) -> Result<SuspendResponse> {
        let status = req.status.unwrap_or(FetcherStatus::Suspended);
        if !status.is_restriction() {
            return Err(GatehouseError::BadRequest(
                "status must be limited, suspended or banned".into(),
            ));
        }
        let actor = meta.admin_actor(req.actor.as_deref());

        let fetcher = self
            .store
            .set_fetcher_status(fetcher_id, status, false)
            .await?
            .ok_or_else(|| GatehouseError::NotFound(format!("fetcher {} not found", fetcher_id)))?;

        info!(fetcher_id, status = %status, actor = %actor, "Fetcher suspended");
        self.record(
            ModerationEventDoc::new(&actor, actions::FETCHER_SUSPEND, "fetcher", fetcher_id)
                .with_details(json!({ "status": status, "reason": req.reason })),
            meta,
        );

        Ok(SuspendResponse {
            fetcher_id: fetcher.fetcher_id,
            status: fetcher.status,
            active: fetcher.active,
        })
    }

    /// Revoke one key; the fetcher's other keys are untouched
    pub async fn revoke_key(&self, key_id: &str, meta: &RequestMeta) -> Result<RevokeResponse> {
        let actor = meta.admin_actor(None);
        let key = self
            .store
            .revoke_key(key_id)
            .await?
            .ok_or_else(|| GatehouseError::NotFound(format!("key {} not found", key_id)))?;

        info!(key_id, fetcher_id = %key.fetcher_id, actor = %actor, "Key revoked");
        self.record(
            ModerationEventDoc::new(&actor, actions::FETCHER_KEY_REVOKE, "fetcher_key", key_id)
                .with_details(json!({ "fetcher_id": key.fetcher_id })),
            meta,
        );

        Ok(RevokeResponse {
            key_id: key.key_id,
            fetcher_id: key.fetcher_id,
            status: key.status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ScopeSet;
    use crate::db::schemas::{FetcherDefaults, FetcherDoc, FetcherKeyDoc, ReportAnalysisDoc, ReportDoc, ReportRawDoc};
    use crate::queue::MemoryQueue;
    use crate::services::quota::EffectiveCaps;
    use crate::store::{CredentialStore, MemoryStore, NewReport, ReportStore};
    use crate::types::OwnerType;

    struct Harness {
        store: Arc<MemoryStore>,
        queue: Arc<MemoryQueue>,
        audit: AuditLog,
        svc: GovernanceService,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let audit = AuditLog::spawn(store.clone(), 64);
        let svc = GovernanceService::new(
            store.clone(),
            queue.clone(),
            audit.clone(),
            Duration::from_secs(1),
        );
        Harness {
            store,
            queue,
            audit,
            svc,
        }
    }

    async fn fetcher(store: &MemoryStore, id: &str) -> AuthenticatedFetcher {
        let fetcher = FetcherDoc::new(id.into(), "bot", OwnerType::Partner, FetcherDefaults::default());
        let key = FetcherKeyDoc::new(
            format!("key-{}", id),
            id.into(),
            "fk_test_",
            "hash".into(),
            ScopeSet::fetcher_default(),
        );
        store
            .insert_fetcher_with_key(fetcher.clone(), key.clone())
            .await
            .unwrap();
        let caps = EffectiveCaps::resolve(&fetcher, &key);
        AuthenticatedFetcher { fetcher, key, caps }
    }

    async fn shadow_report(store: &MemoryStore, fetcher_id: &str, source_id: &str) -> i64 {
        let seqs = store
            .insert_quarantined(vec![NewReport {
                report: ReportDoc {
                    description: "blocked drain".into(),
                    ..Default::default()
                },
                raw: ReportRawDoc {
                    fetcher_id: Some(fetcher_id.into()),
                    source_id: Some(source_id.into()),
                    ..Default::default()
                },
            }])
            .await
            .unwrap();
        seqs[0]
    }

    fn request(notes: &str) -> CreatePromotionRequest {
        CreatePromotionRequest {
            notes: Some(notes.into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_request_requires_notes() {
        let h = harness();
        let auth = fetcher(&h.store, "f1").await;

        let err = h
            .svc
            .create_request(&auth, request("   too short   "), &RequestMeta::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatehouseError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_single_pending_request() {
        let h = harness();
        let auth = fetcher(&h.store, "f1").await;
        let meta = RequestMeta::default();

        let first = h
            .svc
            .create_request(&auth, request("we run the city sensor network"), &meta)
            .await
            .unwrap();
        assert_eq!(first.status, PromotionStatus::Pending);

        let err = h
            .svc
            .create_request(&auth, request("second attempt while pending"), &meta)
            .await
            .unwrap_err();
        assert!(matches!(err, GatehouseError::Conflict(_)));

        let status = h.svc.promotion_status(&auth).await.unwrap();
        assert_eq!(status.status, "pending");
        assert_eq!(status.request.unwrap().request_id, first.request_id);
    }

    #[tokio::test]
    async fn test_approval_applies_settings_once() {
        let h = harness();
        let auth = fetcher(&h.store, "f1").await;
        let meta = RequestMeta {
            actor: Some("reviewer".into()),
            ..Default::default()
        };
        let created = h
            .svc
            .create_request(&auth, request("please raise our daily cap"), &meta)
            .await
            .unwrap();

        // Approval without settings is refused and leaves the request pending
        let err = h
            .svc
            .decide(
                created.request_id,
                DecideRequest {
                    decision: "approved".into(),
                    ..Default::default()
                },
                &meta,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatehouseError::BadRequest(_)));

        let approve = DecideRequest {
            decision: "approved".into(),
            settings: Some(FetcherSettings {
                tier: Some(2),
                daily_cap_items: Some(5000),
                default_visibility: Some(Visibility::Public),
                ..Default::default()
            }),
            ..Default::default()
        };
        let decided = h.svc.decide(created.request_id, approve.clone(), &meta).await.unwrap();
        assert_eq!(decided.status, PromotionStatus::Approved);
        assert_eq!(decided.reviewed_by.as_deref(), Some("reviewer"));

        let updated = h.store.get_fetcher("f1").await.unwrap().unwrap();
        assert_eq!(updated.tier, 2);
        assert_eq!(updated.daily_cap_items, 5000);
        assert_eq!(updated.default_visibility, Visibility::Public);

        let again = h.svc.decide(created.request_id, approve, &meta).await.unwrap_err();
        assert!(matches!(again, GatehouseError::Conflict(_)));

        let missing = h
            .svc
            .decide(
                999,
                DecideRequest {
                    decision: "denied".into(),
                    ..Default::default()
                },
                &meta,
            )
            .await
            .unwrap_err();
        assert!(matches!(missing, GatehouseError::NotFound(_)));

        h.audit.flush().await;
        let recorded: Vec<String> = h
            .store
            .moderation_events()
            .await
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(
            recorded,
            vec![actions::PROMOTION_REQUEST_CREATE, actions::PROMOTION_REQUEST_DECIDE]
        );
    }

    #[tokio::test]
    async fn test_invalid_decisions_rejected() {
        let h = harness();
        let meta = RequestMeta::default();
        for decision in ["pending", "maybe"] {
            let err = h
                .svc
                .decide(
                    1,
                    DecideRequest {
                        decision: decision.into(),
                        ..Default::default()
                    },
                    &meta,
                )
                .await
                .unwrap_err();
            assert!(matches!(err, GatehouseError::BadRequest(_)), "{}", decision);
        }

        let negative = DecideRequest {
            decision: "approved".into(),
            settings: Some(FetcherSettings {
                per_minute_cap_items: Some(-1),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(matches!(
            h.svc.decide(1, negative, &meta).await,
            Err(GatehouseError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_list_requests_oldest_first_and_clamped() {
        let h = harness();
        let meta = RequestMeta::default();
        for id in ["f1", "f2", "f3"] {
            let auth = fetcher(&h.store, id).await;
            h.svc
                .create_request(&auth, request("promotion please, thanks"), &meta)
                .await
                .unwrap();
        }

        let all = h.svc.list_requests(None, Some(0)).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].fetcher_id, "f1");

        let all = h.svc.list_requests(Some("pending"), None).await.unwrap();
        let ids: Vec<&str> = all.iter().map(|r| r.fetcher_id.as_str()).collect();
        assert_eq!(ids, vec!["f1", "f2", "f3"]);

        assert!(h.svc.list_requests(Some("approved"), None).await.unwrap().is_empty());
        assert!(h.svc.list_requests(Some("bogus"), None).await.is_err());
    }

    #[tokio::test]
    async fn test_promotion_is_monotonic_and_publishes_once() {
        let h = harness();
        let seq = shadow_report(&h.store, "f1", "a").await;
        h.store
            .insert_analysis(ReportAnalysisDoc {
                report_seq: seq,
                summary: "drain blocked".into(),
                ..Default::default()
            })
            .await;
        let meta = RequestMeta::default();

        let first = h
            .svc
            .promote_report(seq, PromoteReportRequest::default(), &meta)
            .await
            .unwrap();
        assert_eq!(first.visibility, Visibility::Public);
        assert_eq!(first.trust_level, TrustLevel::Verified);
        assert!(first.published_analysed);
        let stamp = first.promoted_to_public_at.clone().unwrap();

        // Asking for less never lowers anything, and nothing is republished
        let second = h
            .svc
            .promote_report(
                seq,
                PromoteReportRequest {
                    visibility: Some(Visibility::Shadow),
                    trust_level: Some(TrustLevel::Unverified),
                    ..Default::default()
                },
                &meta,
            )
            .await
            .unwrap();
        assert_eq!(second.visibility, Visibility::Public);
        assert_eq!(second.trust_level, TrustLevel::Verified);
        assert_eq!(second.promoted_to_public_at.as_deref(), Some(stamp.as_str()));
        assert!(!second.published_analysed);

        let analysed = h.queue.analysed_messages().await;
        assert_eq!(analysed.len(), 1);
        assert_eq!(analysed[0].report.seq, seq);
        assert_eq!(analysed[0].analysis[0].summary, "drain blocked");
    }

    #[tokio::test]
    async fn test_failed_publish_is_retried_on_next_promotion() {
        let h = harness();
        let seq = shadow_report(&h.store, "f1", "a").await;
        h.store
            .insert_analysis(ReportAnalysisDoc {
                report_seq: seq,
                summary: "streetlight out".into(),
                ..Default::default()
            })
            .await;
        let meta = RequestMeta::default();

        h.queue.set_failing(true);
        let first = h
            .svc
            .promote_report(seq, PromoteReportRequest::default(), &meta)
            .await
            .unwrap();
        assert_eq!(first.visibility, Visibility::Public);
        assert!(!first.published_analysed);
        assert!(first.publish_error.is_some());
        assert!(h.store.get_raw(seq).await.unwrap().unwrap().analysed_published_at.is_none());

        h.queue.set_failing(false);
        let retry = h
            .svc
            .promote_report(seq, PromoteReportRequest::default(), &meta)
            .await
            .unwrap();
        assert!(retry.published_analysed);
        assert_eq!(h.queue.analysed_messages().await.len(), 1);
    }

    #[tokio::test]
    async fn test_publish_waits_for_analysis_rows() {
        let h = harness();
        let seq = shadow_report(&h.store, "f1", "a").await;
        let meta = RequestMeta::default();

        let early = h
            .svc
            .promote_report(seq, PromoteReportRequest::default(), &meta)
            .await
            .unwrap();
        assert_eq!(early.visibility, Visibility::Public);
        assert!(early.promoted_to_public_at.is_some());
        assert!(!early.published_analysed);
        assert!(early.publish_error.unwrap().contains("no analysis rows"));
        assert!(h.queue.analysed_messages().await.is_empty());
        assert!(h.store.get_raw(seq).await.unwrap().unwrap().analysed_published_at.is_none());

        h.store
            .insert_analysis(ReportAnalysisDoc {
                report_seq: seq,
                summary: "graffiti on underpass".into(),
                ..Default::default()
            })
            .await;

        let late = h
            .svc
            .promote_report(seq, PromoteReportRequest::default(), &meta)
            .await
            .unwrap();
        assert!(late.published_analysed);
        assert!(late.publish_error.is_none());
        assert_eq!(late.promoted_to_public_at, early.promoted_to_public_at);

        let analysed = h.queue.analysed_messages().await;
        assert_eq!(analysed.len(), 1);
        assert_eq!(analysed[0].analysis.len(), 1);
        assert_eq!(analysed[0].analysis[0].summary, "graffiti on underpass");
    }

    #[tokio::test]
    async fn test_promote_unknown_report() {
        let h = harness();
        let err = h
            .svc
            .promote_report(42, PromoteReportRequest::default(), &RequestMeta::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatehouseError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_promote_report_without_quarantine_row() {
        let h = harness();
        let seq = h.store.insert_report(ReportDoc::default()).await;

        let resp = h
            .svc
            .promote_report(seq, PromoteReportRequest::default(), &RequestMeta::default())
            .await
            .unwrap();
        assert_eq!(resp.visibility, Visibility::Public);
        assert!(resp.promoted_to_public_at.is_none());
        assert!(!resp.published_analysed);
    }

    #[tokio::test]
    async fn test_suspend_and_revoke() {
        let h = harness();
        let auth = fetcher(&h.store, "f1").await;
        let meta = RequestMeta::default();

        let resp = h
            .svc
            .suspend_fetcher("f1", SuspendRequest::default(), &meta)
            .await
            .unwrap();
        assert_eq!(resp.status, FetcherStatus::Suspended);
        assert!(!resp.active);

        let active = SuspendRequest {
            status: Some(FetcherStatus::Active),
            ..Default::default()
        };
        assert!(matches!(
            h.svc.suspend_fetcher("f1", active, &meta).await,
            Err(GatehouseError::BadRequest(_))
        ));
        assert!(matches!(
            h.svc.suspend_fetcher("nobody", SuspendRequest::default(), &meta).await,
            Err(GatehouseError::NotFound(_))
        ));

        let revoked = h.svc.revoke_key(auth.key_id(), &meta).await.unwrap();
        assert_eq!(revoked.status, KeyStatus::Revoked);
        assert!(matches!(
            h.svc.revoke_key("missing", &meta).await,
            Err(GatehouseError::NotFound(_))
        ));

        h.audit.flush().await;
        let events = h.store.moderation_events().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, actions::FETCHER_SUSPEND);
        assert_eq!(events[0].actor, "internal_admin");
        assert_eq!(events[1].action, actions::FETCHER_KEY_REVOKE);
    }
}

//! End-to-end admission and governance flows over the in-memory store and queue
//!
//! Covers:
//! - Registration, authentication and the self view
//! - Dedup idempotence and novel-item quota charging
//! - Quota atomicity under concurrent batches
//! - Queue failure or publish timeout after commit, and safe resubmission
//! - All-or-nothing batch storage
//! - Concurrent batches racing on the same source ids
//! - Promotion monotonicity and the single analysed republish
//! - Single pending request and decision exclusivity

use std::sync::Arc;
use std::time::Duration;

use gatehouse::db::schemas::{actions, ReportAnalysisDoc};
use gatehouse::logging::AuditLog;
use gatehouse::queue::MemoryQueue;
use gatehouse::services::{
    AuthenticatedFetcher, BulkIngestRequest, CreatePromotionRequest, DecideRequest,
    GovernanceService, IngestConfig, IngestItem, IngestService, ItemStatus, PromoteReportRequest,
    QuotaCharge, RegisterRequest, RegistrationConfig, RegistrationService,
};
use gatehouse::services::RequestMeta;
use gatehouse::store::{MemoryStore, ReportStore};
use gatehouse::types::{GatehouseError, PromotionStatus, TrustLevel, Visibility};
use tokio_test::{assert_err, assert_ok};

// =============================================================================
// Harness
// =============================================================================

struct App {
    store: Arc<MemoryStore>,
    queue: Arc<MemoryQueue>,
    audit: AuditLog,
    registration: RegistrationService,
    ingest: IngestService,
    governance: GovernanceService,
}

fn app(quota_charge: QuotaCharge) -> App {
    app_with(
        RegistrationConfig::default(),
        IngestConfig {
            quota_charge,
            ..Default::default()
        },
    )
}

fn app_with(registration: RegistrationConfig, ingest: IngestConfig) -> App {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new());
    let audit = AuditLog::spawn(store.clone(), 256);

    App {
        registration: RegistrationService::new(store.clone(), audit.clone(), registration),
        ingest: IngestService::new(store.clone(), queue.clone(), audit.clone(), ingest),
        governance: GovernanceService::new(
            store.clone(),
            queue.clone(),
            audit.clone(),
            Duration::from_secs(2),
        ),
        store,
        queue,
        audit,
    }
}

fn meta(ip: &str) -> RequestMeta {
    RequestMeta {
        remote_ip: Some(ip.to_string()),
        request_id: Some("req-test".into()),
        user_agent: Some("flow-test/1.0".into()),
        actor: None,
    }
}

/// Register a fetcher and return its bearer header value
async fn register(app: &App, name: &str) -> (String, String) {
    let created = app
        .registration
        .register(
            RegisterRequest {
                name: Some(name.into()),
                owner_type: Some("partner".into()),
            },
            &meta("198.51.100.7"),
        )
        .await
        .unwrap();
    (format!("Bearer {}", created.api_key), created.key_id)
}

async fn auth(app: &App, bearer: &str) -> AuthenticatedFetcher {
    app.registration.authenticate(Some(bearer)).await.unwrap()
}

fn batch(source_ids: &[&str]) -> BulkIngestRequest {
    BulkIngestRequest {
        items: source_ids
            .iter()
            .map(|id| IngestItem {
                source_id: Some(id.to_string()),
                title: Some(format!("Pothole {}", id)),
                lat: Some(52.37),
                lng: Some(4.89),
                ..Default::default()
            })
            .collect(),
    }
}

fn numbered(prefix: &str, n: usize) -> BulkIngestRequest {
    let ids: Vec<String> = (0..n).map(|i| format!("{}-{}", prefix, i)).collect();
    let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    batch(&refs)
}

// =============================================================================
// Scenario
// =============================================================================

#[tokio::test]
async fn test_resubmission_and_promotion_scenario() {
    let app = app(QuotaCharge::Novel);
    let (bearer, key_id) = register(&app, "city-scraper").await;
    app.store.set_key_caps(&key_id, None, Some(5)).await;
    let fetcher = auth(&app, &bearer).await;
    let m = meta("198.51.100.7");

    let first = app.ingest.bulk_ingest(&fetcher, batch(&["a", "b", "c"]), &m).await.unwrap();
    assert_eq!(first.accepted, 3);
    assert!(first.all_queued());
    for result in &first.results {
        assert_eq!(result.status, ItemStatus::Accepted);
        assert_eq!(result.visibility, Some(Visibility::Shadow));
        assert!(result.queued);
    }
    let seq_a = first.results[0].report_seq.unwrap();

    let second = app.ingest.bulk_ingest(&fetcher, batch(&["a", "b", "d"]), &m).await.unwrap();
    let statuses: Vec<ItemStatus> = second.results.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![ItemStatus::Duplicate, ItemStatus::Duplicate, ItemStatus::Accepted]
    );
    assert_eq!(second.results[0].report_seq, Some(seq_a));
    assert_eq!(second.results[1].report_seq, first.results[1].report_seq);

    let me = app.registration.fetcher_self(&fetcher).await.unwrap();
    assert_eq!(me.usage.daily_used, 4);
    assert_eq!(me.usage.remaining.daily_remaining, Some(1));
    assert_eq!(app.store.report_count().await, 4);

    app.store
        .insert_analysis(ReportAnalysisDoc {
            report_seq: seq_a,
            summary: "pothole on main road".into(),
            ..Default::default()
        })
        .await;

    let promote = || PromoteReportRequest {
        visibility: Some(Visibility::Public),
        trust_level: Some(TrustLevel::Verified),
        actor: Some("reviewer@example.org".into()),
        reason: Some("confirmed on site".into()),
    };
    let promoted = app.governance.promote_report(seq_a, promote(), &m).await.unwrap();
    assert_eq!(promoted.visibility, Visibility::Public);
    assert_eq!(promoted.trust_level, TrustLevel::Verified);
    assert!(promoted.published_analysed);
    let stamp = promoted.promoted_to_public_at.clone();
    assert!(stamp.is_some());

    let again = app.governance.promote_report(seq_a, promote(), &m).await.unwrap();
    assert!(!again.published_analysed);
    assert_eq!(again.promoted_to_public_at, stamp);

    let analysed = app.queue.analysed_messages().await;
    assert_eq!(analysed.len(), 1);
    assert_eq!(analysed[0].report.seq, seq_a);
    assert_eq!(analysed[0].analysis[0].summary, "pothole on main road");

    let raw = app.store.get_raw(seq_a).await.unwrap().unwrap();
    assert_eq!(raw.visibility, Visibility::Public);

    app.audit.flush().await;
    let promotions = app
        .store
        .moderation_events()
        .await
        .into_iter()
        .filter(|e| e.action == actions::REPORT_PROMOTE)
        .count();
    assert_eq!(promotions, 2);
    let ingests = app
        .store
        .ingestion_audits()
        .await
        .into_iter()
        .filter(|l| l.endpoint == "/v1/reports:bulkIngest")
        .count();
    assert_eq!(ingests, 2);
}

// =============================================================================
// Admission
// =============================================================================

#[tokio::test]
async fn test_dedup_is_idempotent() {
    let app = app(QuotaCharge::Submitted);
    let (bearer, _) = register(&app, "dedup").await;
    let fetcher = auth(&app, &bearer).await;
    let m = meta("203.0.113.1");

    let first = app.ingest.bulk_ingest(&fetcher, batch(&["x", "y"]), &m).await.unwrap();
    for _ in 0..3 {
        let repeat = app.ingest.bulk_ingest(&fetcher, batch(&["x", "y"]), &m).await.unwrap();
        assert_eq!(repeat.accepted, 0);
        assert_eq!(repeat.duplicates, 2);
        let seqs: Vec<_> = repeat.results.iter().map(|r| r.report_seq).collect();
        let original: Vec<_> = first.results.iter().map(|r| r.report_seq).collect();
        assert_eq!(seqs, original);
    }

    assert_eq!(app.store.report_count().await, 2);
    assert_eq!(app.store.raw_count().await, 2);
    // Duplicates are re-queued so a lost hand-off can be recovered
    assert_eq!(app.queue.raw_messages().await.len(), 8);
}

#[tokio::test]
async fn test_submitted_charge_rejects_over_cap() {
    let app = app(QuotaCharge::Submitted);
    let (bearer, key_id) = register(&app, "greedy").await;
    app.store.set_key_caps(&key_id, None, Some(3)).await;
    let fetcher = auth(&app, &bearer).await;
    let m = meta("203.0.113.2");

    let err = app
        .ingest
        .bulk_ingest(&fetcher, batch(&["1", "2", "3", "4"]), &m)
        .await
        .unwrap_err();
    assert!(matches!(err, GatehouseError::QuotaExceeded(_)));
    assert_eq!(err.status_code().as_u16(), 429);
    assert_eq!(app.store.report_count().await, 0);

    // A refused batch does not use up quota
    let ok = app.ingest.bulk_ingest(&fetcher, batch(&["1", "2", "3"]), &m).await.unwrap();
    assert_eq!(ok.accepted, 3);
}

#[tokio::test]
async fn test_concurrent_batches_share_quota() {
    let app = app(QuotaCharge::Submitted);
    let (bearer, key_id) = register(&app, "parallel").await;
    app.store.set_key_caps(&key_id, Some(1000), Some(200)).await;
    let fetcher = auth(&app, &bearer).await;
    let m = meta("203.0.113.3");

    let (left, right) = tokio::join!(
        app.ingest.bulk_ingest(&fetcher, numbered("left", 150), &m),
        app.ingest.bulk_ingest(&fetcher, numbered("right", 150), &m),
    );

    let admitted = [&left, &right].iter().filter(|r| r.is_ok()).count();
    assert_eq!(admitted, 1);
    let refused = [left, right]
        .into_iter()
        .find_map(|r| r.err())
        .unwrap();
    assert!(matches!(refused, GatehouseError::QuotaExceeded(_)));
    assert_eq!(app.store.report_count().await, 150);
}

#[tokio::test]
async fn test_queue_failure_commits_and_retry_is_safe() {
    let app = app(QuotaCharge::Submitted);
    let (bearer, _) = register(&app, "flaky").await;
    let fetcher = auth(&app, &bearer).await;
    let m = meta("203.0.113.4");

    app.queue.set_failing(true);
    let degraded = app.ingest.bulk_ingest(&fetcher, batch(&["p", "q", "r"]), &m).await.unwrap();
    assert!(!degraded.all_queued());
    assert_eq!(degraded.queue_failures, 3);
    assert_eq!(degraded.accepted, 3);
    assert!(degraded.results.iter().all(|r| !r.queued && r.report_seq.is_some()));
    assert_eq!(app.store.report_count().await, 3);

    app.queue.set_failing(false);
    let retried = app.ingest.bulk_ingest(&fetcher, batch(&["p", "q", "r"]), &m).await.unwrap();
    assert!(retried.all_queued());
    assert_eq!(retried.duplicates, 3);
    assert_eq!(app.store.report_count().await, 3);
    assert_eq!(app.queue.raw_messages().await.len(), 3);

    app.audit.flush().await;
    let outcomes: Vec<String> = app
        .store
        .ingestion_audits()
        .await
        .into_iter()
        .filter(|l| l.endpoint == "/v1/reports:bulkIngest")
        .map(|l| l.outcome)
        .collect();
    assert_eq!(outcomes, vec!["queued_failed".to_string(), "ok".to_string()]);
}

#[tokio::test]
async fn test_publish_timeout_commits_and_marks_unqueued() {
    let app = app_with(
        RegistrationConfig::default(),
        IngestConfig {
            step_timeout: Duration::from_millis(50),
            ..Default::default()
        },
    );
    let (bearer, _) = register(&app, "slow-queue").await;
    let fetcher = auth(&app, &bearer).await;
    let m = meta("203.0.113.6");

    app.queue.set_delay(Duration::from_millis(500));
    let slow = app.ingest.bulk_ingest(&fetcher, batch(&["t1", "t2"]), &m).await.unwrap();
    assert!(!slow.all_queued());
    assert_eq!(slow.accepted, 2);
    assert_eq!(slow.queue_failures, 2);
    assert!(slow.results.iter().all(|r| !r.queued && r.report_seq.is_some()));
    assert_eq!(app.store.report_count().await, 2);
    assert_eq!(app.store.raw_count().await, 2);

    app.audit.flush().await;
    let line = app
        .store
        .ingestion_audits()
        .await
        .into_iter()
        .find(|l| l.endpoint == "/v1/reports:bulkIngest")
        .unwrap();
    assert_eq!(line.outcome, "queued_failed");
    assert_eq!(line.status_code, 503);

    app.queue.set_delay(Duration::ZERO);
    let retried = app.ingest.bulk_ingest(&fetcher, batch(&["t1", "t2"]), &m).await.unwrap();
    assert!(retried.all_queued());
    assert_eq!(retried.duplicates, 2);
    assert_eq!(app.store.report_count().await, 2);
}

#[tokio::test]
async fn test_failed_insert_stores_nothing() {
    let app = app(QuotaCharge::Submitted);
    let (bearer, _) = register(&app, "half-batch").await;
    let fetcher = auth(&app, &bearer).await;
    let m = meta("203.0.113.7");

    app.store.fail_next_insert_at(2);
    let err = app
        .ingest
        .bulk_ingest(&fetcher, batch(&["u1", "u2", "u3", "u4"]), &m)
        .await
        .unwrap_err();
    assert!(matches!(err, GatehouseError::Database(_)));
    assert_eq!(err.status_code().as_u16(), 503);
    assert_eq!(app.store.report_count().await, 0);
    assert_eq!(app.store.raw_count().await, 0);
    assert!(app.queue.raw_messages().await.is_empty());

    app.audit.flush().await;
    let line = app
        .store
        .ingestion_audits()
        .await
        .into_iter()
        .find(|l| l.endpoint == "/v1/reports:bulkIngest")
        .unwrap();
    assert_eq!(line.outcome, "storage_unavailable");
    assert_eq!(line.status_code, 503);
    assert_eq!(line.submitted, 4);
    assert_eq!(line.accepted, 0);

    // Nothing was stored, so the same batch goes through in full
    let ok = app
        .ingest
        .bulk_ingest(&fetcher, batch(&["u1", "u2", "u3", "u4"]), &m)
        .await
        .unwrap();
    assert_eq!(ok.accepted, 4);
    assert_eq!(app.store.report_count().await, 4);
}

#[tokio::test]
async fn test_racing_batches_store_each_source_once() {
    let app = app(QuotaCharge::Submitted);
    let (bearer, _) = register(&app, "racer").await;
    let fetcher = auth(&app, &bearer).await;
    let m = meta("203.0.113.5");

    let (one, two) = tokio::join!(
        app.ingest.bulk_ingest(&fetcher, batch(&["s1", "s2", "s3"]), &m),
        app.ingest.bulk_ingest(&fetcher, batch(&["s3", "s2", "s1"]), &m),
    );
    let (one, two) = (one.unwrap(), two.unwrap());

    assert_eq!(one.accepted + two.accepted, 3);
    assert_eq!(one.duplicates + two.duplicates, 3);
    assert_eq!(app.store.report_count().await, 3);

    // Both responses agree on where each source id lives
    for result in &one.results {
        let other = two
            .results
            .iter()
            .find(|r| r.source_id == result.source_id)
            .unwrap();
        assert_eq!(result.report_seq, other.report_seq);
    }
}

// =============================================================================
// Credentials
// =============================================================================

#[tokio::test]
async fn test_registration_rate_limit_per_ip() {
    let app = app_with(
        RegistrationConfig {
            max_per_hour_per_ip: 2,
            ..Default::default()
        },
        IngestConfig::default(),
    );
    let m = meta("192.0.2.50");
    let req = || RegisterRequest {
        name: Some("burst".into()),
        owner_type: None,
    };

    assert_ok!(app.registration.register(req(), &m).await);
    assert_ok!(app.registration.register(req(), &m).await);
    let err = assert_err!(app.registration.register(req(), &m).await);
    assert!(matches!(err, GatehouseError::RateLimited(_)));

    // Another address is unaffected
    assert_ok!(app.registration.register(req(), &meta("192.0.2.51")).await);
}

#[tokio::test]
async fn test_revoked_key_is_unauthorized() {
    let app = app(QuotaCharge::Submitted);
    let (bearer, key_id) = register(&app, "revoked").await;
    auth(&app, &bearer).await;

    app.governance.revoke_key(&key_id, &meta("10.0.0.1")).await.unwrap();

    let err = assert_err!(app.registration.authenticate(Some(&bearer)).await);
    assert!(matches!(err, GatehouseError::Unauthorized(_)));
    assert_eq!(err.message(), "invalid api key");
}

// =============================================================================
// Governance
// =============================================================================

#[tokio::test]
async fn test_single_pending_and_exclusive_decision() {
    let app = app(QuotaCharge::Submitted);
    let (bearer, _) = register(&app, "applicant").await;
    let fetcher = auth(&app, &bearer).await;
    let m = meta("198.51.100.9");

    let request = || CreatePromotionRequest {
        contact_email: Some("ops@applicant.example".into()),
        notes: Some("we operate the municipal sensor feed".into()),
        ..Default::default()
    };
    let created = app.governance.create_request(&fetcher, request(), &m).await.unwrap();
    let err = app.governance.create_request(&fetcher, request(), &m).await.unwrap_err();
    assert!(matches!(err, GatehouseError::Conflict(_)));

    let deny = || DecideRequest {
        decision: "denied".into(),
        decision_notes: Some("insufficient history".into()),
        ..Default::default()
    };
    let (first, second) = tokio::join!(
        app.governance.decide(created.request_id, deny(), &m),
        app.governance.decide(created.request_id, deny(), &m),
    );
    let outcomes = [first, second];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(outcomes
        .iter()
        .any(|r| matches!(r, Err(GatehouseError::Conflict(_)))));

    let status = app.governance.promotion_status(&fetcher).await.unwrap();
    assert_eq!(status.status, PromotionStatus::Denied.to_string());

    // Once settled, a new request may be opened
    app.governance.create_request(&fetcher, request(), &m).await.unwrap();
}

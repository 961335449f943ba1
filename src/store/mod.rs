//! Storage seams
//!
//! Services talk to storage through these traits so the MongoDB backend and
//! the in-memory backend (dev mode, tests) are interchangeable. Every method
//! that must be atomic says so; both backends honour it.

use async_trait::async_trait;
use bson::DateTime;
use chrono::Utc;
use std::collections::HashMap;

use crate::db::schemas::{
    FetcherDoc, FetcherKeyDoc, FetcherSettings, IngestionAuditDoc, ModerationEventDoc,
    PromotionRequestDoc, ReportAnalysisDoc, ReportDoc, ReportRawDoc,
};
use crate::services::quota::{EffectiveCaps, UsageSnapshot};
use crate::types::{FetcherStatus, PromotionStatus, Result, TrustLevel, Visibility};

pub mod memory;
pub mod mongo;

pub use memory::MemoryStore;
pub use mongo::MongoStore;

/// Rows inserted per statement inside the batch transaction
pub const INSERT_CHUNK: usize = 200;

/// A stored report found by its dedup key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExistingReport {
    pub seq: i64,
    pub visibility: Visibility,
    pub trust_level: TrustLevel,
}

/// A report and its quarantine row, before a sequence number is assigned
#[derive(Debug, Clone)]
pub struct NewReport {
    pub report: ReportDoc,
    pub raw: ReportRawDoc,
}

/// Decision written onto a pending promotion request
#[derive(Debug, Clone)]
pub struct PromotionDecision {
    pub request_id: i64,
    pub status: PromotionStatus,
    pub actor: String,
    pub decision_notes: Option<String>,
    /// Applied to the fetcher only when `status` is approved
    pub settings: Option<FetcherSettings>,
    pub at: DateTime,
}

/// Fetchers and their keys
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Persist a new fetcher and its first key as one unit
    async fn insert_fetcher_with_key(&self, fetcher: FetcherDoc, key: FetcherKeyDoc) -> Result<()>;

    /// Point lookup of a key and its owner
    async fn get_key_with_fetcher(&self, key_id: &str) -> Result<Option<(FetcherKeyDoc, FetcherDoc)>>;

    async fn get_fetcher(&self, fetcher_id: &str) -> Result<Option<FetcherDoc>>;

    /// Record a successful authentication
    async fn touch_key(&self, fetcher_id: &str, key_id: &str, at: DateTime) -> Result<()>;

    /// Set status and active flag; None when the fetcher does not exist
    async fn set_fetcher_status(
        &self,
        fetcher_id: &str,
        status: FetcherStatus,
        active: bool,
    ) -> Result<Option<FetcherDoc>>;

    /// Mark a key revoked; None when the key does not exist
    async fn revoke_key(&self, key_id: &str) -> Result<Option<FetcherKeyDoc>>;
}

/// Per-key minute/day counters
#[async_trait]
pub trait QuotaLedger: Send + Sync {
    /// Atomically check both windows and add `items`, or fail with
    /// `QuotaExceeded` leaving the counters unchanged
    async fn consume(
        &self,
        fetcher_id: &str,
        key_id: &str,
        now: chrono::DateTime<Utc>,
        items: i64,
        caps: EffectiveCaps,
    ) -> Result<()>;

    /// Usage in the windows containing `now`
    async fn usage(
        &self,
        fetcher_id: &str,
        key_id: &str,
        now: chrono::DateTime<Utc>,
    ) -> Result<UsageSnapshot>;
}

/// Reports and their quarantine rows
#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Dedup lookup. Pure read.
    async fn resolve_existing(
        &self,
        fetcher_id: &str,
        source_ids: &[String],
    ) -> Result<HashMap<String, ExistingReport>>;

    /// Insert all reports or none. Returns assigned sequence numbers in
    /// input order. A dedup-key collision fails the whole call with
    /// `DuplicateKey`.
    async fn insert_quarantined(&self, batch: Vec<NewReport>) -> Result<Vec<i64>>;

    async fn get_report(&self, seq: i64) -> Result<Option<ReportDoc>>;

    async fn get_raw(&self, seq: i64) -> Result<Option<ReportRawDoc>>;

    /// Upsert the quarantine row, never lowering visibility or trust.
    /// Stamps `promoted_to_public_at` once, when an existing non-public row
    /// becomes public. `NotFound` when the core report is missing.
    async fn apply_promotion(
        &self,
        seq: i64,
        visibility: Visibility,
        trust_level: TrustLevel,
        at: DateTime,
    ) -> Result<ReportRawDoc>;

    async fn load_analyses(&self, seq: i64) -> Result<Vec<ReportAnalysisDoc>>;

    /// Set `analysed_published_at` if it is unset and the report has been
    /// promoted. True when this caller won the claim.
    async fn claim_analysed_publish(&self, seq: i64, at: DateTime) -> Result<bool>;

    /// Undo a claim after a failed publish, if it still holds `at`
    async fn release_analysed_publish(&self, seq: i64, at: DateTime) -> Result<()>;
}

/// Promotion request workflow
#[async_trait]
pub trait PromotionStore: Send + Sync {
    /// Insert a pending request and assign its id. `Conflict` when the
    /// fetcher already has one pending.
    async fn create_request(&self, request: PromotionRequestDoc) -> Result<PromotionRequestDoc>;

    /// Most recent request for a fetcher
    async fn latest_request(&self, fetcher_id: &str) -> Result<Option<PromotionRequestDoc>>;

    async fn get_request(&self, request_id: i64) -> Result<Option<PromotionRequestDoc>>;

    /// Requests in `status`, oldest first
    async fn list_requests(&self, status: PromotionStatus, limit: i64) -> Result<Vec<PromotionRequestDoc>>;

    /// Move a pending request to a terminal state and, on approval, apply
    /// the settings to the fetcher, as one unit. `Conflict` when the request
    /// is no longer pending, `NotFound` when it does not exist.
    async fn decide_request(&self, decision: PromotionDecision) -> Result<PromotionRequestDoc>;
}

/// Append-only audit records
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append_moderation_event(&self, event: ModerationEventDoc) -> Result<()>;

    async fn append_ingestion_audit(&self, line: IngestionAuditDoc) -> Result<()>;
}

/// Backend liveness
#[async_trait]
pub trait StoreHealth: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn ping(&self) -> Result<()>;
}

/// Everything the services need from storage
pub trait Store:
    CredentialStore + QuotaLedger + ReportStore + PromotionStore + AuditSink + StoreHealth
{
}

impl<T> Store for T where
    T: CredentialStore + QuotaLedger + ReportStore + PromotionStore + AuditSink + StoreHealth
{
}

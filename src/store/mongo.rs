//! MongoDB-backed store
//!
//! Atomicity comes from three places:
//! - single-document conditional updates (quota counters, publish claims)
//! - unique indexes (dedup key, one pending request per fetcher)
//! - multi-document transactions (batch insert, registration, decisions)
//!
//! Transactions need a replica set or sharded cluster.

use async_trait::async_trait;
use bson::{bson, doc, Bson, DateTime, Document};
use chrono::Utc;
use mongodb::error::TRANSIENT_TRANSACTION_ERROR;
use mongodb::options::ReturnDocument;
use mongodb::ClientSession;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    AuditSink, CredentialStore, ExistingReport, NewReport, PromotionDecision, PromotionStore,
    QuotaLedger, ReportStore, StoreHealth, INSERT_CHUNK,
};
use crate::db::mongo::map_write_error;
use crate::db::schemas::{
    CounterDoc, FetcherDoc, FetcherKeyDoc, IngestionAuditDoc, ModerationEventDoc,
    PromotionRequestDoc, ReportAnalysisDoc, ReportDoc, ReportRawDoc, UsageCounterDoc,
    COUNTER_COLLECTION, FETCHER_COLLECTION, FETCHER_KEY_COLLECTION, INGESTION_AUDIT_COLLECTION,
    MODERATION_EVENT_COLLECTION, PROMOTION_REQUEST_COLLECTION, REPORT_ANALYSIS_COLLECTION,
    REPORT_COLLECTION, REPORT_RAW_COLLECTION, USAGE_COLLECTION,
};
use crate::db::{MongoClient, MongoCollection};
use crate::services::quota::{
    current_count, day_bucket, minute_bucket, EffectiveCaps, UsageSnapshot,
};
use crate::types::{
    FetcherStatus, GatehouseError, KeyStatus, PromotionStatus, Result, TrustLevel, Visibility,
};

const REPORT_SEQ_COUNTER: &str = "report_seq";
const PROMOTION_REQUEST_COUNTER: &str = "promotion_request_id";

/// Attempts for a transaction that hits a transient error
const TXN_ATTEMPTS: u32 = 5;

/// Attempts for the conditional quota update when buckets roll concurrently
const QUOTA_ATTEMPTS: u32 = 3;

/// `$in` lists are split to keep queries bounded
const RESOLVE_CHUNK: usize = 1000;

/// A failure inside a transaction attempt
struct TxnFailure {
    transient: bool,
    error: GatehouseError,
}

impl From<GatehouseError> for TxnFailure {
    fn from(error: GatehouseError) -> Self {
        Self {
            transient: false,
            error,
        }
    }
}

fn txn_failure(context: &'static str) -> impl Fn(mongodb::error::Error) -> TxnFailure {
    move |e| TxnFailure {
        transient: e.contains_label(TRANSIENT_TRANSACTION_ERROR),
        error: map_write_error(context, e),
    }
}

async fn begin(session: &mut ClientSession) -> std::result::Result<(), TxnFailure> {
    session
        .start_transaction()
        .await
        .map_err(txn_failure("Failed to start transaction"))
}

async fn commit(session: &mut ClientSession) -> std::result::Result<(), TxnFailure> {
    session
        .commit_transaction()
        .await
        .map_err(txn_failure("Commit failed"))
}

async fn abort(session: &mut ClientSession) {
    if let Err(e) = session.abort_transaction().await {
        debug!("Abort transaction failed: {}", e);
    }
}

async fn backoff(attempt: u32) {
    tokio::time::sleep(Duration::from_millis(10 * u64::from(attempt + 1))).await;
}

/// Store backed by MongoDB collections
pub struct MongoStore {
    client: MongoClient,
    fetchers: MongoCollection<FetcherDoc>,
    keys: MongoCollection<FetcherKeyDoc>,
    usage: MongoCollection<UsageCounterDoc>,
    counters: MongoCollection<CounterDoc>,
    reports: MongoCollection<ReportDoc>,
    raw: MongoCollection<ReportRawDoc>,
    analyses: MongoCollection<ReportAnalysisDoc>,
    requests: MongoCollection<PromotionRequestDoc>,
    events: MongoCollection<ModerationEventDoc>,
    audits: MongoCollection<IngestionAuditDoc>,
}

impl MongoStore {
    /// Open every collection and apply its indexes
    pub async fn new(client: MongoClient) -> Result<Self> {
        Ok(Self {
            fetchers: client.collection(FETCHER_COLLECTION).await?,
            keys: client.collection(FETCHER_KEY_COLLECTION).await?,
            usage: client.collection(USAGE_COLLECTION).await?,
            counters: client.collection(COUNTER_COLLECTION).await?,
            reports: client.collection(REPORT_COLLECTION).await?,
            raw: client.collection(REPORT_RAW_COLLECTION).await?,
            analyses: client.collection(REPORT_ANALYSIS_COLLECTION).await?,
            requests: client.collection(PROMOTION_REQUEST_COLLECTION).await?,
            events: client.collection(MODERATION_EVENT_COLLECTION).await?,
            audits: client.collection(INGESTION_AUDIT_COLLECTION).await?,
            client,
        })
    }

    /// Reserve `count` consecutive values from a named counter and return
    /// the first. Runs outside any transaction; an aborted batch leaves a gap.
    async fn reserve(&self, name: &str, count: i64) -> Result<i64> {
        let counter = self
            .counters
            .inner()
            .find_one_and_update(doc! { "name": name }, doc! { "$inc": { "value": count } })
            .upsert(true)
            .return_document(ReturnDocument::After)
            .await
            .map_err(|e| GatehouseError::Database(format!("Counter {} failed: {}", name, e)))?
            .ok_or_else(|| GatehouseError::Database(format!("Counter {} missing after upsert", name)))?;

        Ok(counter.value - count + 1)
    }

    async fn counter_doc(&self, fetcher_id: &str, key_id: &str) -> Result<Option<UsageCounterDoc>> {
        self.usage
            .find_one(doc! { "fetcher_id": fetcher_id, "key_id": key_id })
            .await
    }
}

/// Usage of one window, as an aggregation expression over the stored doc
fn window_usage(bucket_field: &str, items_field: &str, bucket: DateTime) -> Bson {
    bson!({
        "$cond": [
            { "$eq": [format!("${}", bucket_field), bucket] },
            format!("${}", items_field),
            0_i64
        ]
    })
}

/// Cap check for one window; unlimited caps are always satisfied
fn within_cap(cap: i64, usage: Bson, items: i64) -> Bson {
    if cap <= 0 {
        Bson::Boolean(true)
    } else {
        bson!({ "$lte": [{ "$add": [usage, items] }, cap] })
    }
}

/// Conditional-update filter for a quota charge. Only a counter whose
/// buckets are not ahead of ours may be rolled, so a lagging clock never
/// rewinds a newer window.
fn quota_filter(
    fetcher_id: &str,
    key_id: &str,
    caps: EffectiveCaps,
    items: i64,
    minute: DateTime,
    day: DateTime,
) -> Document {
    let minute_usage = window_usage("minute_bucket", "minute_items", minute);
    let day_usage = window_usage("day_bucket", "day_items", day);
    doc! {
        "fetcher_id": fetcher_id,
        "key_id": key_id,
        "$expr": { "$and": [
            { "$lte": ["$minute_bucket", minute] },
            { "$lte": ["$day_bucket", day] },
            within_cap(caps.per_minute, minute_usage, items),
            within_cap(caps.daily, day_usage, items),
        ] },
    }
}

/// Every conditional update lost a race although the batch fits
fn quota_contended() -> GatehouseError {
    GatehouseError::Conflict("quota counter is busy; retry the batch".into())
}

#[async_trait]
impl CredentialStore for MongoStore {
    async fn insert_fetcher_with_key(&self, fetcher: FetcherDoc, key: FetcherKeyDoc) -> Result<()> {
        let mut session = self.client.start_session().await?;

        for attempt in 0..TXN_ATTEMPTS {
            let outcome: std::result::Result<(), TxnFailure> = async {
                begin(&mut session).await?;
                self.fetchers.insert_one_in(fetcher.clone(), &mut session).await?;
                self.keys.insert_one_in(key.clone(), &mut session).await?;
                commit(&mut session).await
            }
            .await;

            match outcome {
                Ok(()) => return Ok(()),
                Err(failure) => {
                    abort(&mut session).await;
                    if !failure.transient || attempt + 1 == TXN_ATTEMPTS {
                        return Err(failure.error);
                    }
                    backoff(attempt).await;
                }
            }
        }
        Err(GatehouseError::Database("registration transaction did not complete".into()))
    }

    async fn get_key_with_fetcher(&self, key_id: &str) -> Result<Option<(FetcherKeyDoc, FetcherDoc)>> {
        let Some(key) = self.keys.find_one(doc! { "key_id": key_id }).await? else {
            return Ok(None);
        };
        let fetcher = self.get_fetcher(&key.fetcher_id).await?;
        Ok(fetcher.map(|f| (key, f)))
    }

    async fn get_fetcher(&self, fetcher_id: &str) -> Result<Option<FetcherDoc>> {
        self.fetchers.find_one(doc! { "fetcher_id": fetcher_id }).await
    }

    async fn touch_key(&self, fetcher_id: &str, key_id: &str, at: DateTime) -> Result<()> {
        self.keys
            .update_one(doc! { "key_id": key_id }, doc! { "$set": { "last_used_at": at } })
            .await?;
        self.fetchers
            .update_one(
                doc! { "fetcher_id": fetcher_id },
                doc! { "$set": { "last_seen_at": at } },
            )
            .await?;
        Ok(())
    }

    async fn set_fetcher_status(
        &self,
        fetcher_id: &str,
        status: FetcherStatus,
        active: bool,
    ) -> Result<Option<FetcherDoc>> {
        self.fetchers
            .inner()
            .find_one_and_update(
                doc! { "fetcher_id": fetcher_id },
                doc! { "$set": {
                    "status": status.as_str(),
                    "active": active,
                    "metadata.updated_at": DateTime::now(),
                } },
            )
            .return_document(ReturnDocument::After)
            .await
            .map_err(|e| GatehouseError::Database(format!("Fetcher status update failed: {}", e)))
    }

    async fn revoke_key(&self, key_id: &str) -> Result<Option<FetcherKeyDoc>> {
        self.keys
            .inner()
            .find_one_and_update(
                doc! { "key_id": key_id },
                doc! { "$set": {
                    "status": KeyStatus::Revoked.as_str(),
                    "metadata.updated_at": DateTime::now(),
                } },
            )
            .return_document(ReturnDocument::After)
            .await
            .map_err(|e| GatehouseError::Database(format!("Key revoke failed: {}", e)))
    }
}

#[async_trait]
impl QuotaLedger for MongoStore {
    async fn consume(
        &self,
        fetcher_id: &str,
        key_id: &str,
        now: chrono::DateTime<Utc>,
        items: i64,
        caps: EffectiveCaps,
    ) -> Result<()> {
        if items <= 0 {
            return Ok(());
        }

        let minute = DateTime::from_chrono(minute_bucket(now));
        let day = DateTime::from_chrono(day_bucket(now));
        let stamp = DateTime::from_chrono(now);

        // Make sure the counter exists so the conditional update has a target
        let ensure = self
            .usage
            .inner()
            .update_one(
                doc! { "fetcher_id": fetcher_id, "key_id": key_id },
                doc! { "$setOnInsert": {
                    "minute_bucket": minute,
                    "minute_items": 0_i64,
                    "day_bucket": day,
                    "day_items": 0_i64,
                    "metadata": { "is_deleted": false, "created_at": stamp, "updated_at": stamp },
                } },
            )
            .upsert(true)
            .await;
        if let Err(e) = ensure {
            // A concurrent upsert won the insert; the document exists
            if !crate::db::is_duplicate_key(&e) {
                return Err(GatehouseError::Database(format!("Usage counter upsert failed: {}", e)));
            }
        }

        let minute_usage = window_usage("minute_bucket", "minute_items", minute);
        let day_usage = window_usage("day_bucket", "day_items", day);

        let filter = quota_filter(fetcher_id, key_id, caps, items, minute, day);
        let update = vec![doc! { "$set": {
            "minute_items": { "$add": [minute_usage, items] },
            "minute_bucket": minute,
            "day_items": { "$add": [day_usage, items] },
            "day_bucket": day,
            "metadata.updated_at": stamp,
        } }];

        for _ in 0..QUOTA_ATTEMPTS {
            let result = self.usage.update_one(filter.clone(), update.clone()).await?;
            if result.matched_count == 1 {
                return Ok(());
            }

            // Work out which window refused, for the error message
            let usage = self.usage(fetcher_id, key_id, now).await?;
            caps.admit(usage, items)?;
            // Fits on re-read: the counter changed between the two calls
            debug!(fetcher_id, key_id, "quota update raced, retrying");
        }

        Err(quota_contended())
    }

    async fn usage(
        &self,
        fetcher_id: &str,
        key_id: &str,
        now: chrono::DateTime<Utc>,
    ) -> Result<UsageSnapshot> {
        Ok(match self.counter_doc(fetcher_id, key_id).await? {
            Some(c) => UsageSnapshot {
                minute_used: current_count(c.minute_bucket.to_chrono(), c.minute_items, minute_bucket(now)),
                daily_used: current_count(c.day_bucket.to_chrono(), c.day_items, day_bucket(now)),
            },
            None => UsageSnapshot::default(),
        })
    }
}

#[async_trait]
impl ReportStore for MongoStore {
    async fn resolve_existing(
        &self,
        fetcher_id: &str,
        source_ids: &[String],
    ) -> Result<HashMap<String, ExistingReport>> {
        let mut found = HashMap::new();
        for chunk in source_ids.chunks(RESOLVE_CHUNK) {
            let rows = self
                .raw
                .find_many(
                    doc! { "fetcher_id": fetcher_id, "source_id": { "$in": chunk.to_vec() } },
                    None,
                    None,
                )
                .await?;
            for row in rows {
                if let Some(source_id) = row.source_id {
                    found.insert(
                        source_id,
                        ExistingReport {
                            seq: row.report_seq,
                            visibility: row.visibility,
                            trust_level: row.trust_level,
                        },
                    );
                }
            }
        }
        Ok(found)
    }

    async fn insert_quarantined(&self, batch: Vec<NewReport>) -> Result<Vec<i64>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let first = self.reserve(REPORT_SEQ_COUNTER, batch.len() as i64).await?;
        let mut reports = Vec::with_capacity(batch.len());
        let mut raws = Vec::with_capacity(batch.len());
        for (offset, item) in batch.into_iter().enumerate() {
            let seq = first + offset as i64;
            let NewReport { mut report, mut raw } = item;
            report.seq = seq;
            raw.report_seq = seq;
            MongoCollection::stamp(&mut report);
            MongoCollection::stamp(&mut raw);
            reports.push(report);
            raws.push(raw);
        }
        let seqs: Vec<i64> = reports.iter().map(|r| r.seq).collect();

        let mut session = self.client.start_session().await?;
        for attempt in 0..TXN_ATTEMPTS {
            let outcome: std::result::Result<(), TxnFailure> = async {
                begin(&mut session).await?;
                for chunk in reports.chunks(INSERT_CHUNK) {
                    self.reports
                        .inner()
                        .insert_many(chunk)
                        .session(&mut session)
                        .await
                        .map_err(txn_failure("Report insert failed"))?;
                }
                for chunk in raws.chunks(INSERT_CHUNK) {
                    self.raw
                        .inner()
                        .insert_many(chunk)
                        .session(&mut session)
                        .await
                        .map_err(txn_failure("Quarantine insert failed"))?;
                }
                commit(&mut session).await
            }
            .await;

            match outcome {
                Ok(()) => return Ok(seqs),
                Err(failure) => {
                    abort(&mut session).await;
                    if !failure.transient || attempt + 1 == TXN_ATTEMPTS {
                        return Err(failure.error);
                    }
                    warn!(attempt, "Batch insert hit a transient error, retrying");
                    backoff(attempt).await;
                }
            }
        }
        Err(GatehouseError::Database("batch transaction did not complete".into()))
    }

    async fn get_report(&self, seq: i64) -> Result<Option<ReportDoc>> {
        self.reports.find_one(doc! { "seq": seq }).await
    }

    async fn get_raw(&self, seq: i64) -> Result<Option<ReportRawDoc>> {
        self.raw.find_one(doc! { "report_seq": seq }).await
    }

    async fn apply_promotion(
        &self,
        seq: i64,
        visibility: Visibility,
        trust_level: TrustLevel,
        at: DateTime,
    ) -> Result<ReportRawDoc> {
        if self.get_report(seq).await?.is_none() {
            return Err(GatehouseError::NotFound(format!("report {} not found", seq)));
        }

        // Never lower: a requested floor value keeps whatever is stored
        let visibility_expr = match visibility {
            Visibility::Public => bson!("public"),
            Visibility::Shadow => bson!({ "$ifNull": ["$visibility", "shadow"] }),
        };
        let trust_expr = match trust_level {
            TrustLevel::Verified => bson!("verified"),
            TrustLevel::Unverified => bson!({ "$ifNull": ["$trust_level", "unverified"] }),
        };
        // Set once: only an existing non-public row becoming public is stamped
        let promoted_expr = if visibility == Visibility::Public {
            bson!({ "$cond": [
                { "$eq": [{ "$type": "$promoted_to_public_at" }, "date"] },
                "$promoted_to_public_at",
                { "$cond": [
                    { "$ne": [{ "$ifNull": ["$visibility", "public"] }, "public"] },
                    at,
                    "$$REMOVE"
                ] }
            ] })
        } else {
            bson!("$promoted_to_public_at")
        };

        let pipeline = vec![doc! { "$set": {
            "visibility": visibility_expr,
            "trust_level": trust_expr,
            "promoted_to_public_at": promoted_expr,
            "spam_score": { "$ifNull": ["$spam_score", 0.0] },
            "metadata.is_deleted": { "$ifNull": ["$metadata.is_deleted", false] },
            "metadata.created_at": { "$ifNull": ["$metadata.created_at", at] },
            "metadata.updated_at": at,
        } }];

        self.raw
            .inner()
            .find_one_and_update(doc! { "report_seq": seq }, pipeline)
            .upsert(true)
            .return_document(ReturnDocument::After)
            .await
            .map_err(|e| map_write_error("Promotion upsert failed", e))?
            .ok_or_else(|| GatehouseError::Internal(format!("report {} raw row missing after upsert", seq)))
    }

    async fn load_analyses(&self, seq: i64) -> Result<Vec<ReportAnalysisDoc>> {
        self.analyses
            .find_many(
                doc! { "report_seq": seq },
                Some(doc! { "metadata.created_at": 1 }),
                None,
            )
            .await
    }

    async fn claim_analysed_publish(&self, seq: i64, at: DateTime) -> Result<bool> {
        let result = self
            .raw
            .update_one(
                doc! {
                    "report_seq": seq,
                    "analysed_published_at": null,
                    "promoted_to_public_at": { "$type": "date" },
                },
                doc! { "$set": { "analysed_published_at": at } },
            )
            .await?;
        Ok(result.modified_count == 1)
    }

    async fn release_analysed_publish(&self, seq: i64, at: DateTime) -> Result<()> {
        self.raw
            .update_one(
                doc! { "report_seq": seq, "analysed_published_at": at },
                doc! { "$unset": { "analysed_published_at": "" } },
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PromotionStore for MongoStore {
    async fn create_request(&self, mut request: PromotionRequestDoc) -> Result<PromotionRequestDoc> {
        let pending = self
            .requests
            .find_one(doc! {
                "fetcher_id": &request.fetcher_id,
                "status": PromotionStatus::Pending.as_str(),
            })
            .await?;
        if pending.is_some() {
            return Err(GatehouseError::Conflict(
                "a pending promotion request already exists".into(),
            ));
        }

        request.request_id = self.reserve(PROMOTION_REQUEST_COUNTER, 1).await?;
        request.status = PromotionStatus::Pending;
        MongoCollection::stamp(&mut request);

        // The partial unique index settles a race between two creators
        match self.requests.insert_one(request.clone()).await {
            Ok(()) => Ok(request),
            Err(GatehouseError::DuplicateKey(_)) => Err(GatehouseError::Conflict(
                "a pending promotion request already exists".into(),
            )),
            Err(e) => Err(e),
        }
    }

    async fn latest_request(&self, fetcher_id: &str) -> Result<Option<PromotionRequestDoc>> {
        let mut rows = self
            .requests
            .find_many(
                doc! { "fetcher_id": fetcher_id },
                Some(doc! { "request_id": -1 }),
                Some(1),
            )
            .await?;
        Ok(rows.pop())
    }

    async fn get_request(&self, request_id: i64) -> Result<Option<PromotionRequestDoc>> {
        self.requests.find_one(doc! { "request_id": request_id }).await
    }

    async fn list_requests(&self, status: PromotionStatus, limit: i64) -> Result<Vec<PromotionRequestDoc>> {
        self.requests
            .find_many(
                doc! { "status": status.as_str() },
                Some(doc! { "metadata.created_at": 1, "request_id": 1 }),
                Some(limit),
            )
            .await
    }

    async fn decide_request(&self, decision: PromotionDecision) -> Result<PromotionRequestDoc> {
        let applied = match (decision.status, &decision.settings) {
            (PromotionStatus::Approved, Some(settings)) => Some(settings.clone()),
            _ => None,
        };

        let mut set = doc! {
            "status": decision.status.as_str(),
            "reviewed_by": &decision.actor,
            "reviewed_at": decision.at,
            "metadata.updated_at": decision.at,
        };
        if let Some(ref notes) = decision.decision_notes {
            set.insert("decision_notes", notes.as_str());
        }
        if let Some(ref settings) = applied {
            set.insert("applied", bson::to_bson(settings)?);
        }
        let update: Document = doc! { "$set": set };
        let filter = doc! {
            "request_id": decision.request_id,
            "status": PromotionStatus::Pending.as_str(),
        };

        let mut session = self.client.start_session().await?;
        for attempt in 0..TXN_ATTEMPTS {
            let outcome: std::result::Result<Option<PromotionRequestDoc>, TxnFailure> = async {
                begin(&mut session).await?;

                // Matching on `pending` takes the document's write lock; a
                // concurrent decider either sees the new status or conflicts
                let decided = self
                    .requests
                    .inner()
                    .find_one_and_update(filter.clone(), update.clone())
                    .return_document(ReturnDocument::After)
                    .session(&mut session)
                    .await
                    .map_err(txn_failure("Decision update failed"))?;

                let Some(decided) = decided else {
                    return Ok(None);
                };

                if let Some(ref settings) = applied {
                    let result = self
                        .fetchers
                        .inner()
                        .update_one(
                            doc! { "fetcher_id": &decided.fetcher_id },
                            doc! { "$set": settings.to_set_document(decision.at) },
                        )
                        .session(&mut session)
                        .await
                        .map_err(txn_failure("Fetcher settings update failed"))?;
                    if result.matched_count == 0 {
                        return Err(TxnFailure::from(GatehouseError::NotFound(format!(
                            "fetcher {} not found",
                            decided.fetcher_id
                        ))));
                    }
                }

                commit(&mut session).await?;
                Ok(Some(decided))
            }
            .await;

            match outcome {
                Ok(Some(decided)) => return Ok(decided),
                Ok(None) => {
                    abort(&mut session).await;
                    return match self.get_request(decision.request_id).await? {
                        Some(existing) => Err(GatehouseError::Conflict(format!(
                            "request already {}",
                            existing.status
                        ))),
                        None => Err(GatehouseError::NotFound(format!(
                            "request {} not found",
                            decision.request_id
                        ))),
                    };
                }
                Err(failure) => {
                    abort(&mut session).await;
                    if !failure.transient || attempt + 1 == TXN_ATTEMPTS {
                        return Err(failure.error);
                    }
                    backoff(attempt).await;
                }
            }
        }
        Err(GatehouseError::Database("decision transaction did not complete".into()))
    }
}

#[async_trait]
impl AuditSink for MongoStore {
    async fn append_moderation_event(&self, event: ModerationEventDoc) -> Result<()> {
        self.events.insert_one(event).await
    }

    async fn append_ingestion_audit(&self, line: IngestionAuditDoc) -> Result<()> {
        self.audits.insert_one(line).await
    }
}

#[async_trait]
impl StoreHealth for MongoStore {
    fn backend(&self) -> &'static str {
        "mongodb"
    }

    async fn ping(&self) -> Result<()> {
        self.client.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_cap_is_trivially_true() {
        let usage = window_usage("day_bucket", "day_items", DateTime::from_millis(0));
        assert_eq!(within_cap(0, usage.clone(), 10), Bson::Boolean(true));
        assert_eq!(within_cap(-1, usage, 10), Bson::Boolean(true));
    }

    #[test]
    fn test_cap_expression_shape() {
        let bucket = DateTime::from_millis(60_000);
        let usage = window_usage("minute_bucket", "minute_items", bucket);
        let expr = within_cap(20, usage, 5);

        let lte = expr.as_document().unwrap().get_array("$lte").unwrap();
        assert_eq!(lte[1], Bson::Int64(20));
        let add = lte[0].as_document().unwrap().get_array("$add").unwrap();
        assert_eq!(add[1], Bson::Int64(5));
        let cond = add[0].as_document().unwrap().get_array("$cond").unwrap();
        assert_eq!(cond[1], Bson::String("$minute_items".into()));
    }

    #[test]
    fn test_quota_filter_never_rolls_newer_bucket_back() {
        let minute = DateTime::from_millis(120_000);
        let day = DateTime::from_millis(0);
        let caps = EffectiveCaps {
            per_minute: 20,
            daily: 0,
        };
        let filter = quota_filter("f1", "k1", caps, 5, minute, day);

        assert_eq!(filter.get_str("fetcher_id").unwrap(), "f1");
        let clauses = filter
            .get_document("$expr")
            .unwrap()
            .get_array("$and")
            .unwrap();
        assert_eq!(clauses.len(), 4);

        let guard = clauses[0].as_document().unwrap().get_array("$lte").unwrap();
        assert_eq!(guard[0], Bson::String("$minute_bucket".into()));
        assert_eq!(guard[1], Bson::DateTime(minute));
        let guard = clauses[1].as_document().unwrap().get_array("$lte").unwrap();
        assert_eq!(guard[0], Bson::String("$day_bucket".into()));
        assert_eq!(clauses[3], Bson::Boolean(true));
    }

    #[test]
    fn test_lost_races_are_not_reported_as_quota() {
        let err = quota_contended();
        assert!(matches!(err, GatehouseError::Conflict(_)));
        assert_eq!(err.status_code().as_u16(), 409);
    }
}

//! In-memory store for development mode and tests
//!
//! All state sits behind one async mutex, so every trait method is atomic
//! with respect to every other. Batch inserts are staged and committed in
//! one step, which gives the same all-or-nothing behaviour as the MongoDB
//! transaction.

use async_trait::async_trait;
use bson::DateTime;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

use super::{
    AuditSink, CredentialStore, ExistingReport, NewReport, PromotionDecision, PromotionStore,
    QuotaLedger, ReportStore, StoreHealth,
};
use crate::db::schemas::{
    FetcherDoc, FetcherKeyDoc, IngestionAuditDoc, Metadata, ModerationEventDoc, PromotionRequestDoc,
    ReportAnalysisDoc, ReportDoc, ReportRawDoc, UsageCounterDoc,
};
use crate::services::quota::{current_count, day_bucket, minute_bucket, EffectiveCaps, UsageSnapshot};
use crate::types::{
    FetcherStatus, GatehouseError, KeyStatus, PromotionStatus, Result, TrustLevel, Visibility,
};

const NO_FAILURE: usize = usize::MAX;

#[derive(Default)]
struct MemoryState {
    fetchers: HashMap<String, FetcherDoc>,
    keys: HashMap<String, FetcherKeyDoc>,
    usage: HashMap<(String, String), UsageCounterDoc>,
    reports: BTreeMap<i64, ReportDoc>,
    raw: BTreeMap<i64, ReportRawDoc>,
    /// (fetcher_id, source_id) -> seq
    dedup: HashMap<(String, String), i64>,
    analyses: Vec<ReportAnalysisDoc>,
    requests: BTreeMap<i64, PromotionRequestDoc>,
    events: Vec<ModerationEventDoc>,
    audits: Vec<IngestionAuditDoc>,
    last_seq: i64,
    last_request_id: i64,
}

/// Process-local store
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    /// Row index at which the next batch insert fails
    fail_insert_at: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            fail_insert_at: AtomicUsize::new(NO_FAILURE),
        }
    }

    /// Make the next batch insert fail after staging `row` reports
    pub fn fail_next_insert_at(&self, row: usize) {
        self.fail_insert_at.store(row, Ordering::SeqCst);
    }

    /// Seed a core report without a quarantine row, as created by
    /// non-fetcher submission paths
    pub async fn insert_report(&self, mut report: ReportDoc) -> i64 {
        let mut state = self.state.lock().await;
        state.last_seq += 1;
        report.seq = state.last_seq;
        state.reports.insert(report.seq, report);
        state.last_seq
    }

    /// Seed an analysis row, as the analysis pipeline would
    pub async fn insert_analysis(&self, analysis: ReportAnalysisDoc) {
        self.state.lock().await.analyses.push(analysis);
    }

    pub async fn report_count(&self) -> usize {
        self.state.lock().await.reports.len()
    }

    pub async fn raw_count(&self) -> usize {
        self.state.lock().await.raw.len()
    }

    pub async fn moderation_events(&self) -> Vec<ModerationEventDoc> {
        self.state.lock().await.events.clone()
    }

    pub async fn ingestion_audits(&self) -> Vec<IngestionAuditDoc> {
        self.state.lock().await.audits.clone()
    }

    pub async fn get_key(&self, key_id: &str) -> Option<FetcherKeyDoc> {
        self.state.lock().await.keys.get(key_id).cloned()
    }

    /// Override a key's caps
    pub async fn set_key_caps(&self, key_id: &str, per_minute: Option<i64>, daily: Option<i64>) {
        if let Some(key) = self.state.lock().await.keys.get_mut(key_id) {
            key.per_minute_cap_items = per_minute;
            key.daily_cap_items = daily;
        }
    }
}

fn usage_of(counter: Option<&UsageCounterDoc>, now: chrono::DateTime<Utc>) -> UsageSnapshot {
    match counter {
        Some(c) => UsageSnapshot {
            minute_used: current_count(c.minute_bucket.to_chrono(), c.minute_items, minute_bucket(now)),
            daily_used: current_count(c.day_bucket.to_chrono(), c.day_items, day_bucket(now)),
        },
        None => UsageSnapshot::default(),
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn insert_fetcher_with_key(&self, fetcher: FetcherDoc, key: FetcherKeyDoc) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.fetchers.contains_key(&fetcher.fetcher_id) || state.keys.contains_key(&key.key_id) {
            return Err(GatehouseError::Database("identifier collision".into()));
        }
        state.keys.insert(key.key_id.clone(), key);
        state.fetchers.insert(fetcher.fetcher_id.clone(), fetcher);
        Ok(())
    }

    async fn get_key_with_fetcher(&self, key_id: &str) -> Result<Option<(FetcherKeyDoc, FetcherDoc)>> {
        let state = self.state.lock().await;
        let found = state.keys.get(key_id).and_then(|key| {
            state
                .fetchers
                .get(&key.fetcher_id)
                .map(|fetcher| (key.clone(), fetcher.clone()))
        });
        Ok(found)
    }

    async fn get_fetcher(&self, fetcher_id: &str) -> Result<Option<FetcherDoc>> {
        Ok(self.state.lock().await.fetchers.get(fetcher_id).cloned())
    }

    async fn touch_key(&self, fetcher_id: &str, key_id: &str, at: DateTime) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(key) = state.keys.get_mut(key_id) {
            key.last_used_at = Some(at);
        }
        if let Some(fetcher) = state.fetchers.get_mut(fetcher_id) {
            fetcher.last_seen_at = Some(at);
        }
        Ok(())
    }

    async fn set_fetcher_status(
        &self,
        fetcher_id: &str,
        status: FetcherStatus,
        active: bool,
    ) -> Result<Option<FetcherDoc>> {
        let mut state = self.state.lock().await;
        Ok(state.fetchers.get_mut(fetcher_id).map(|fetcher| {
            fetcher.status = status;
            fetcher.active = active;
            fetcher.metadata.touch(DateTime::now());
            fetcher.clone()
        }))
    }

    async fn revoke_key(&self, key_id: &str) -> Result<Option<FetcherKeyDoc>> {
        let mut state = self.state.lock().await;
        Ok(state.keys.get_mut(key_id).map(|key| {
            key.status = KeyStatus::Revoked;
            key.metadata.touch(DateTime::now());
            key.clone()
        }))
    }
}

#[async_trait]
impl QuotaLedger for MemoryStore {
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

        let mut state = self.state.lock().await;
        let slot = (fetcher_id.to_string(), key_id.to_string());
        let usage = usage_of(state.usage.get(&slot), now);
        caps.admit(usage, items)?;

        let counter = state.usage.entry(slot).or_insert_with(|| UsageCounterDoc {
            fetcher_id: fetcher_id.to_string(),
            key_id: key_id.to_string(),
            ..Default::default()
        });
        counter.minute_bucket = DateTime::from_chrono(minute_bucket(now));
        counter.minute_items = usage.minute_used + items;
        counter.day_bucket = DateTime::from_chrono(day_bucket(now));
        counter.day_items = usage.daily_used + items;
        counter.metadata.touch(DateTime::from_chrono(now));
        Ok(())
    }

    async fn usage(
        &self,
        fetcher_id: &str,
        key_id: &str,
        now: chrono::DateTime<Utc>,
    ) -> Result<UsageSnapshot> {
        let state = self.state.lock().await;
        let slot = (fetcher_id.to_string(), key_id.to_string());
        Ok(usage_of(state.usage.get(&slot), now))
    }
}

#[async_trait]
impl ReportStore for MemoryStore {
    async fn resolve_existing(
        &self,
        fetcher_id: &str,
        source_ids: &[String],
    ) -> Result<HashMap<String, ExistingReport>> {
        let state = self.state.lock().await;
        let mut found = HashMap::new();
        for source_id in source_ids {
            let slot = (fetcher_id.to_string(), source_id.clone());
            if let Some(&seq) = state.dedup.get(&slot) {
                let raw = state.raw.get(&seq);
                found.insert(
                    source_id.clone(),
                    ExistingReport {
                        seq,
                        visibility: raw.map(|r| r.visibility).unwrap_or_default(),
                        trust_level: raw.map(|r| r.trust_level).unwrap_or_default(),
                    },
                );
            }
        }
        Ok(found)
    }

    async fn insert_quarantined(&self, batch: Vec<NewReport>) -> Result<Vec<i64>> {
        let mut state = self.state.lock().await;
        let fail_at = self.fail_insert_at.swap(NO_FAILURE, Ordering::SeqCst);

        // Sequence numbers are reserved up front; a failed batch leaves a gap
        let first = state.last_seq + 1;
        state.last_seq += batch.len() as i64;

        let now = DateTime::now();
        let mut staged = Vec::with_capacity(batch.len());
        let mut staged_keys = HashMap::new();
        for (offset, mut item) in batch.into_iter().enumerate() {
            if offset == fail_at {
                return Err(GatehouseError::Database("injected insert failure".into()));
            }

            let seq = first + offset as i64;
            item.report.seq = seq;
            item.report.metadata = Metadata::at(now);
            item.raw.report_seq = seq;
            item.raw.metadata = Metadata::at(now);

            if let (Some(fetcher_id), Some(source_id)) = (&item.raw.fetcher_id, &item.raw.source_id) {
                if !source_id.is_empty() {
                    let slot = (fetcher_id.clone(), source_id.clone());
                    if state.dedup.contains_key(&slot) || staged_keys.contains_key(&slot) {
                        return Err(GatehouseError::DuplicateKey(format!(
                            "source_id {} already stored for fetcher {}",
                            source_id, fetcher_id
                        )));
                    }
                    staged_keys.insert(slot, seq);
                }
            }
            staged.push(item);
        }

        let seqs = staged.iter().map(|item| item.report.seq).collect();
        for item in staged {
            state.reports.insert(item.report.seq, item.report);
            state.raw.insert(item.raw.report_seq, item.raw);
        }
        state.dedup.extend(staged_keys);
        Ok(seqs)
    }

    async fn get_report(&self, seq: i64) -> Result<Option<ReportDoc>> {
        Ok(self.state.lock().await.reports.get(&seq).cloned())
    }

    async fn get_raw(&self, seq: i64) -> Result<Option<ReportRawDoc>> {
        Ok(self.state.lock().await.raw.get(&seq).cloned())
    }

    async fn apply_promotion(
        &self,
        seq: i64,
        visibility: Visibility,
        trust_level: TrustLevel,
        at: DateTime,
    ) -> Result<ReportRawDoc> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if !state.reports.contains_key(&seq) {
            return Err(GatehouseError::NotFound(format!("report {} not found", seq)));
        }

        let raw = match state.raw.get_mut(&seq) {
            Some(raw) => {
                if raw.visibility != Visibility::Public
                    && visibility == Visibility::Public
                    && raw.promoted_to_public_at.is_none()
                {
                    raw.promoted_to_public_at = Some(at);
                }
                raw.visibility = raw.visibility.max(visibility);
                raw.trust_level = raw.trust_level.max(trust_level);
                raw.metadata.touch(at);
                raw.clone()
            }
            None => {
                // No quarantine row: the report was never shadowed
                let raw = ReportRawDoc {
                    metadata: Metadata::at(at),
                    report_seq: seq,
                    visibility,
                    trust_level,
                    ..Default::default()
                };
                state.raw.insert(seq, raw.clone());
                raw
            }
        };
        Ok(raw)
    }

    async fn load_analyses(&self, seq: i64) -> Result<Vec<ReportAnalysisDoc>> {
        let state = self.state.lock().await;
        Ok(state
            .analyses
            .iter()
            .filter(|a| a.report_seq == seq)
            .cloned()
            .collect())
    }

    async fn claim_analysed_publish(&self, seq: i64, at: DateTime) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.raw.get_mut(&seq) {
            Some(raw) if raw.promoted_to_public_at.is_some() && raw.analysed_published_at.is_none() => {
                raw.analysed_published_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_analysed_publish(&self, seq: i64, at: DateTime) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(raw) = state.raw.get_mut(&seq) {
            if raw.analysed_published_at == Some(at) {
                raw.analysed_published_at = None;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PromotionStore for MemoryStore {
    async fn create_request(&self, mut request: PromotionRequestDoc) -> Result<PromotionRequestDoc> {
        let mut state = self.state.lock().await;
        let pending = state
            .requests
            .values()
            .any(|r| r.fetcher_id == request.fetcher_id && r.status == PromotionStatus::Pending);
        if pending {
            return Err(GatehouseError::Conflict(
                "a pending promotion request already exists".into(),
            ));
        }

        state.last_request_id += 1;
        request.request_id = state.last_request_id;
        request.status = PromotionStatus::Pending;
        request.metadata = Metadata::new();
        state.requests.insert(request.request_id, request.clone());
        Ok(request)
    }

    async fn latest_request(&self, fetcher_id: &str) -> Result<Option<PromotionRequestDoc>> {
        let state = self.state.lock().await;
        Ok(state
            .requests
            .values()
            .rev()
            .find(|r| r.fetcher_id == fetcher_id)
            .cloned())
    }

    async fn get_request(&self, request_id: i64) -> Result<Option<PromotionRequestDoc>> {
        Ok(self.state.lock().await.requests.get(&request_id).cloned())
    }

    async fn list_requests(&self, status: PromotionStatus, limit: i64) -> Result<Vec<PromotionRequestDoc>> {
        let state = self.state.lock().await;
        Ok(state
            .requests
            .values()
            .filter(|r| r.status == status)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn decide_request(&self, decision: PromotionDecision) -> Result<PromotionRequestDoc> {
        let mut state = self.state.lock().await;
        let state = &mut *state;

        let request = state
            .requests
            .get_mut(&decision.request_id)
            .ok_or_else(|| GatehouseError::NotFound(format!("request {} not found", decision.request_id)))?;
        if request.status != PromotionStatus::Pending {
            return Err(GatehouseError::Conflict(format!(
                "request already {}",
                request.status
            )));
        }

        let applied = match (decision.status, decision.settings) {
            (PromotionStatus::Approved, Some(settings)) => {
                let fetcher = state.fetchers.get_mut(&request.fetcher_id).ok_or_else(|| {
                    GatehouseError::NotFound(format!("fetcher {} not found", request.fetcher_id))
                })?;
                settings.apply_to(fetcher);
                fetcher.metadata.touch(decision.at);
                Some(settings)
            }
            _ => None,
        };

        request.status = decision.status;
        request.decision_notes = decision.decision_notes;
        request.reviewed_by = Some(decision.actor);
        request.reviewed_at = Some(decision.at);
        request.applied = applied;
        request.metadata.touch(decision.at);
        Ok(request.clone())
    }
}

#[async_trait]
impl AuditSink for MemoryStore {
    async fn append_moderation_event(&self, event: ModerationEventDoc) -> Result<()> {
        self.state.lock().await.events.push(event);
        Ok(())
    }

    async fn append_ingestion_audit(&self, line: IngestionAuditDoc) -> Result<()> {
        self.state.lock().await.audits.push(line);
        Ok(())
    }
}

#[async_trait]
impl StoreHealth for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

//! Bulk report admission
//!
//! ## Flow
//!
//! 1. Reject empty or oversized batches
//! 2. Charge the caller's quota
//! 3. Normalise and validate each item
//! 4. Split valid items into new and duplicate by `(fetcher_id, source_id)`
//! 5. Insert the new ones, with their quarantine rows, as one unit
//! 6. Queue every new and duplicate item for analysis
//!
//! Storage is committed before anything is published, so a batch whose
//! publish partly failed can be resubmitted unchanged: stored items come
//! back as duplicates and are queued again.

use bson::DateTime;
use chrono::Utc;
use clap::ValueEnum;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::registration::AuthenticatedFetcher;
use super::{with_timeout, RequestMeta};
use crate::auth::Scope;
use crate::db::schemas::{
    clamp_chars, fetcher_reporter_id, IngestionAuditDoc, MediaRef, ReportDoc, ReportRawDoc,
};
use crate::logging::AuditLog;
use crate::queue::{AnalysisQueue, RawReportMessage};
use crate::store::{ExistingReport, NewReport, Store};
use crate::types::{GatehouseError, Result, TrustLevel, Visibility};

/// Audit endpoint name for bulk ingest
pub const INGEST_ENDPOINT: &str = "/v1/reports:bulkIngest";

pub const MAX_SOURCE_ID_LEN: usize = 255;
pub const MAX_TITLE_LEN: usize = 255;
pub const MAX_DESCRIPTION_LEN: usize = 8192;
pub const MAX_AGENT_ID_LEN: usize = 255;
pub const MAX_AGENT_VERSION_LEN: usize = 64;
pub const MAX_SOURCE_TYPE_LEN: usize = 32;
pub const MAX_MEDIA_ITEMS: usize = 10;
const MAX_MEDIA_URL_LEN: usize = 2048;
const MAX_CONTENT_TYPE_LEN: usize = 255;

/// Insert attempts when a concurrent batch claims the same source ids
const INSERT_ATTEMPTS: usize = 3;

const REASON_SOURCE_ID_REQUIRED: &str = "source_id is required";
const REASON_SOURCE_ID_TOO_LONG: &str = "source_id too long";
const REASON_INVALID_COORDINATES: &str = "invalid coordinates";

// ============================================================================
// Types
// ============================================================================

/// Which item count is charged against the quota
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaCharge {
    /// Every submitted item, before validation and dedup
    #[default]
    Submitted,
    /// Only valid items that are not already stored
    Novel,
}

/// Media reference as submitted
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaInput {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// One submitted observation
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IngestItem {
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "latitude")]
    pub lat: Option<f64>,
    #[serde(default, alias = "longitude")]
    pub lng: Option<f64>,
    /// RFC 3339
    #[serde(default)]
    pub collected_at: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub agent_version: Option<String>,
    #[serde(default)]
    pub source_type: Option<String>,
    #[serde(default)]
    pub media: Vec<MediaInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BulkIngestRequest {
    #[serde(default)]
    pub items: Vec<IngestItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Accepted,
    Duplicate,
    Rejected,
}

/// Outcome for one submitted item
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemResult {
    pub source_id: String,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_seq: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Whether the item was handed to the analysis queue
    pub queued: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visibility: Option<Visibility>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trust_level: Option<TrustLevel>,
}

/// Per-item results in input order, plus totals
#[derive(Debug, Clone, Serialize)]
pub struct BulkIngestResponse {
    pub submitted: usize,
    pub accepted: usize,
    pub duplicates: usize,
    pub rejected: usize,
    /// Items that should have been queued but were not
    pub queue_failures: usize,
    pub results: Vec<ItemResult>,
}

impl BulkIngestResponse {
    pub fn all_queued(&self) -> bool {
        self.queue_failures == 0
    }

    fn reject_reasons(&self) -> BTreeMap<String, i64> {
        let mut reasons = BTreeMap::new();
        for result in &self.results {
            if let Some(ref reason) = result.reason {
                *reasons.entry(reason.clone()).or_insert(0) += 1;
            }
        }
        reasons
    }
}

/// Service configuration
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub max_batch_items: usize,
    /// Deadline for each step: quota, dedup, insert, each publish
    pub step_timeout: Duration,
    pub quota_charge: QuotaCharge,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_batch_items: 1000,
            step_timeout: Duration::from_millis(5000),
            quota_charge: QuotaCharge::Submitted,
        }
    }
}

// ============================================================================
// Normalisation
// ============================================================================

/// A valid item ready to be stored
#[derive(Debug, Clone)]
struct Prepared {
    source_id: String,
    report: ReportDoc,
    raw: ReportRawDoc,
}

#[derive(Debug, Clone)]
enum Candidate {
    Rejected { source_id: String, reason: &'static str },
    Valid(Box<Prepared>),
}

/// Trim and clamp; empty becomes None
fn clean(value: Option<&str>, max: usize) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| clamp_chars(s, max))
}

fn coordinate(value: Option<f64>, limit: f64) -> Option<f64> {
    let v = value.unwrap_or(0.0);
    (v.is_finite() && (-limit..=limit).contains(&v)).then_some(v)
}

fn parse_collected_at(value: Option<&str>) -> Option<DateTime> {
    let raw = value?.trim();
    chrono::DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| DateTime::from_chrono(t.with_timezone(&Utc)))
}

fn normalize_media(media: &[MediaInput]) -> Vec<MediaRef> {
    media
        .iter()
        .filter_map(|m| {
            let url = clean(m.url.as_deref(), MAX_MEDIA_URL_LEN)?;
            let sha256 = m
                .sha256
                .as_deref()
                .map(|s| s.trim().to_ascii_lowercase())
                .filter(|s| s.len() == 64 && hex::decode(s).is_ok());
            Some(MediaRef {
                url,
                sha256,
                content_type: clean(m.content_type.as_deref(), MAX_CONTENT_TYPE_LEN),
            })
        })
        .take(MAX_MEDIA_ITEMS)
        .collect()
}

fn normalize_item(item: &IngestItem, fetcher_id: &str, now: DateTime) -> Candidate {
    let source_id = item.source_id.as_deref().unwrap_or_default().trim().to_string();
    let reject = |reason| Candidate::Rejected {
        source_id: source_id.clone(),
        reason,
    };

    if source_id.is_empty() {
        return reject(REASON_SOURCE_ID_REQUIRED);
    }
    if source_id.chars().count() > MAX_SOURCE_ID_LEN {
        return reject(REASON_SOURCE_ID_TOO_LONG);
    }
    let (Some(latitude), Some(longitude)) = (coordinate(item.lat, 90.0), coordinate(item.lng, 180.0))
    else {
        return reject(REASON_INVALID_COORDINATES);
    };

    let title = clean(item.title.as_deref(), MAX_TITLE_LEN).unwrap_or_default();
    let description = clean(item.description.as_deref(), MAX_DESCRIPTION_LEN)
        .unwrap_or_else(|| title.clone());

    let report = ReportDoc {
        reporter_id: fetcher_reporter_id(fetcher_id),
        latitude,
        longitude,
        title,
        description,
        media: normalize_media(&item.media),
        ts: now,
        ..Default::default()
    };
    let raw = ReportRawDoc {
        fetcher_id: Some(fetcher_id.to_string()),
        source_id: Some(source_id.clone()),
        agent_id: clean(item.agent_id.as_deref(), MAX_AGENT_ID_LEN),
        agent_version: clean(item.agent_version.as_deref(), MAX_AGENT_VERSION_LEN),
        collected_at: parse_collected_at(item.collected_at.as_deref()),
        source_type: clean(item.source_type.as_deref(), MAX_SOURCE_TYPE_LEN),
        visibility: Visibility::Shadow,
        trust_level: TrustLevel::Unverified,
        spam_score: 0.0,
        ..Default::default()
    };

    Candidate::Valid(Box::new(Prepared {
        source_id,
        report,
        raw,
    }))
}

/// Where a valid item landed after dedup
#[derive(Debug, Clone, Copy)]
enum Placement {
    /// Stored before this batch
    Existing(ExistingReport),
    /// New in this batch; index into the insert list
    New(usize),
}

/// Split valid candidates. The first occurrence of a source id decides its
/// placement; later occurrences in the same batch are duplicates of it.
fn partition(
    candidates: &[Candidate],
    existing: &HashMap<String, ExistingReport>,
) -> (Vec<usize>, HashMap<String, Placement>) {
    let mut new_items = Vec::new();
    let mut placements: HashMap<String, Placement> = HashMap::new();

    for (idx, candidate) in candidates.iter().enumerate() {
        let Candidate::Valid(prepared) = candidate else {
            continue;
        };
        if placements.contains_key(&prepared.source_id) {
            continue;
        }
        let placement = match existing.get(&prepared.source_id) {
            Some(found) => Placement::Existing(*found),
            None => {
                new_items.push(idx);
                Placement::New(new_items.len() - 1)
            }
        };
        placements.insert(prepared.source_id.clone(), placement);
    }

    (new_items, placements)
}

// ============================================================================
// Ingest service
// ============================================================================

pub struct IngestService {
    store: Arc<dyn Store>,
    queue: Arc<dyn AnalysisQueue>,
    audit: AuditLog,
    config: IngestConfig,
}

impl IngestService {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn AnalysisQueue>,
        audit: AuditLog,
        config: IngestConfig,
    ) -> Self {
        Self {
            store,
            queue,
            audit,
            config,
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Admit a batch. A response with queue failures is still a committed
    /// result; the caller decides how to surface it.
    pub async fn bulk_ingest(
        &self,
        auth: &AuthenticatedFetcher,
        request: BulkIngestRequest,
        meta: &RequestMeta,
    ) -> Result<BulkIngestResponse> {
        let started = Instant::now();
        let submitted = request.items.len();
        let result = self.ingest(auth, request).await;

        let line = IngestionAuditDoc::new(INGEST_ENDPOINT)
            .with_fetcher(auth.fetcher_id(), auth.key_id())
            .with_latency(started.elapsed().as_millis())
            .with_request(meta.remote_ip.clone(), meta.user_agent.clone(), meta.request_id.clone());
        let line = match &result {
            Ok(resp) => {
                let (outcome, status) = if resp.all_queued() {
                    ("ok", 200)
                } else {
                    ("queued_failed", 503)
                };
                line.with_outcome(outcome, status)
                    .with_counts(resp.submitted, resp.accepted, resp.duplicates, resp.rejected)
                    .with_reject_reasons(resp.reject_reasons())
            }
            Err(e) => line
                .with_outcome(e.code(), e.status_code().as_u16())
                .with_counts(submitted, 0, 0, 0),
        };
        self.audit.record_ingestion(line);

        result
    }

    async fn ingest(&self, auth: &AuthenticatedFetcher, request: BulkIngestRequest) -> Result<BulkIngestResponse> {
        auth.require_scope(Scope::ReportSubmit)?;

        let items = request.items;
        if items.is_empty() {
            return Err(GatehouseError::BadRequest("items must not be empty".into()));
        }
        if items.len() > self.config.max_batch_items {
            return Err(GatehouseError::BadRequest(format!(
                "too many items: {} (max {})",
                items.len(),
                self.config.max_batch_items
            )));
        }

        let fetcher_id = auth.fetcher_id();
        let now = Utc::now();
        let step = self.config.step_timeout;

        if self.config.quota_charge == QuotaCharge::Submitted {
            self.charge(auth, now, items.len() as i64).await?;
        }

        let stamp = DateTime::from_chrono(now);
        let candidates: Vec<Candidate> = items
            .iter()
            .map(|item| normalize_item(item, fetcher_id, stamp))
            .collect();
        let mut valid_ids: Vec<String> = candidates
            .iter()
            .filter_map(|c| match c {
                Candidate::Valid(p) => Some(p.source_id.clone()),
                Candidate::Rejected { .. } => None,
            })
            .collect();
        valid_ids.sort();
        valid_ids.dedup();

        let mut attempt = 0;
        let (placements, seqs) = loop {
            attempt += 1;
            let existing = if valid_ids.is_empty() {
                HashMap::new()
            } else {
                with_timeout("dedup", step, self.store.resolve_existing(fetcher_id, &valid_ids)).await?
            };
            let (new_items, placements) = partition(&candidates, &existing);

            if attempt == 1 && self.config.quota_charge == QuotaCharge::Novel {
                self.charge(auth, now, new_items.len() as i64).await?;
            }

            let batch: Vec<NewReport> = new_items
                .iter()
                .filter_map(|idx| match &candidates[*idx] {
                    Candidate::Valid(p) => Some(NewReport {
                        report: p.report.clone(),
                        raw: p.raw.clone(),
                    }),
                    Candidate::Rejected { .. } => None,
                })
                .collect();

            match with_timeout("insert", step, self.store.insert_quarantined(batch)).await {
                Ok(seqs) => break (placements, seqs),
                Err(GatehouseError::DuplicateKey(msg)) if attempt < INSERT_ATTEMPTS => {
                    warn!(fetcher_id = %fetcher_id, attempt, "Concurrent batch claimed a source id, re-resolving: {}", msg);
                }
                Err(GatehouseError::DuplicateKey(_)) => {
                    return Err(GatehouseError::Conflict(
                        "concurrent submissions of the same source ids; retry".into(),
                    ));
                }
                Err(e) => return Err(e),
            }
        };

        let mut results = Vec::with_capacity(candidates.len());
        let mut messages: Vec<(usize, RawReportMessage)> = Vec::new();
        let mut first_seen: HashMap<&str, usize> = HashMap::new();

        for (idx, candidate) in candidates.iter().enumerate() {
            match candidate {
                Candidate::Rejected { source_id, reason } => results.push(ItemResult {
                    source_id: source_id.clone(),
                    status: ItemStatus::Rejected,
                    report_seq: None,
                    reason: Some((*reason).to_string()),
                    queued: false,
                    visibility: None,
                    trust_level: None,
                }),
                Candidate::Valid(prepared) => {
                    let repeat = first_seen.insert(prepared.source_id.as_str(), idx).is_some();
                    let (seq, visibility, trust_level, status) = match placements.get(&prepared.source_id) {
                        Some(Placement::New(slot)) => (
                            seqs[*slot],
                            prepared.raw.visibility,
                            prepared.raw.trust_level,
                            if repeat { ItemStatus::Duplicate } else { ItemStatus::Accepted },
                        ),
                        Some(Placement::Existing(found)) => (
                            found.seq,
                            found.visibility,
                            found.trust_level,
                            ItemStatus::Duplicate,
                        ),
                        None => {
                            return Err(GatehouseError::Internal(format!(
                                "no placement for source id {}",
                                prepared.source_id
                            )))
                        }
                    };

                    messages.push((
                        results.len(),
                        RawReportMessage {
                            seq,
                            description: prepared.report.description.clone(),
                            latitude: prepared.report.latitude,
                            longitude: prepared.report.longitude,
                            fetcher_id: fetcher_id.to_string(),
                            source_id: prepared.source_id.clone(),
                            visibility,
                            trust_level,
                        },
                    ));
                    results.push(ItemResult {
                        source_id: prepared.source_id.clone(),
                        status,
                        report_seq: Some(seq),
                        reason: None,
                        queued: false,
                        visibility: Some(visibility),
                        trust_level: Some(trust_level),
                    });
                }
            }
        }

        let publishes = messages.iter().map(|(slot, message)| async move {
            let outcome = with_timeout("publish", step, self.queue.publish_raw(message)).await;
            (*slot, message.seq, outcome)
        });
        let mut queue_failures = 0;
        for (slot, seq, outcome) in join_all(publishes).await {
            match outcome {
                Ok(()) => results[slot].queued = true,
                Err(e) => {
                    queue_failures += 1;
                    warn!(fetcher_id = %fetcher_id, seq, "Failed to queue report: {}", e);
                }
            }
        }

        let count = |status: ItemStatus| results.iter().filter(|r| r.status == status).count();
        let response = BulkIngestResponse {
            submitted: results.len(),
            accepted: count(ItemStatus::Accepted),
            duplicates: count(ItemStatus::Duplicate),
            rejected: count(ItemStatus::Rejected),
            queue_failures,
            results,
        };

        info!(
            fetcher_id = %fetcher_id,
            submitted = response.submitted,
            accepted = response.accepted,
            duplicates = response.duplicates,
            rejected = response.rejected,
            queue_failures = response.queue_failures,
            "Bulk ingest"
        );
        Ok(response)
    }

    async fn charge(&self, auth: &AuthenticatedFetcher, now: chrono::DateTime<Utc>, items: i64) -> Result<()> {
        if items <= 0 {
            return Ok(());
        }
        debug!(fetcher_id = %auth.fetcher_id(), items, "Charging quota");
        with_timeout(
            "quota",
            self.config.step_timeout,
            self.store
                .consume(auth.fetcher_id(), auth.key_id(), now, items, auth.caps),
        )
        .await
    }
}

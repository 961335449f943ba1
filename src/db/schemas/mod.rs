//! Database schemas for Gatehouse
//!
//! Defines MongoDB document structures for fetchers, keys, reports,
//! promotion requests, usage counters and audit records.

mod audit;
mod fetcher;
mod fetcher_key;
mod metadata;
mod promotion;
mod report;
mod usage;

pub use audit::{
    actions, IngestionAuditDoc, ModerationEventDoc, INGESTION_AUDIT_COLLECTION,
    MODERATION_EVENT_COLLECTION,
};
pub use fetcher::{
    clamp_chars, normalize_name, FetcherDefaults, FetcherDoc, FetcherSettings,
    FETCHER_COLLECTION, MAX_NAME_LEN,
};
pub use fetcher_key::{FetcherKeyDoc, FETCHER_KEY_COLLECTION};
pub use metadata::Metadata;
pub use promotion::{
    PromotionRequestDoc, RequestedSettings, MIN_NOTES_LEN, PROMOTION_REQUEST_COLLECTION,
};
pub use report::{
    fetcher_reporter_id, MediaRef, ReportAnalysisDoc, ReportDoc, ReportRawDoc,
    REPORT_ANALYSIS_COLLECTION, REPORT_COLLECTION, REPORT_RAW_COLLECTION,
};
pub use usage::{CounterDoc, UsageCounterDoc, COUNTER_COLLECTION, USAGE_COLLECTION};

//! Report document schemas
//!
//! - `ReportDoc` is the core report row keyed by `seq`
//! - `ReportRawDoc` is the 1:1 quarantine side row carrying provenance,
//!   visibility and trust
//! - `ReportAnalysisDoc` is written by the analysis pipeline and only read
//!   here to republish enriched state on promotion

use bson::{doc, oid::ObjectId, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;
use crate::types::{TrustLevel, Visibility};

/// Collection name for core reports
pub const REPORT_COLLECTION: &str = "reports";

/// Collection name for quarantine metadata
pub const REPORT_RAW_COLLECTION: &str = "report_raw";

/// Collection name for analysis results
pub const REPORT_ANALYSIS_COLLECTION: &str = "report_analysis";

/// Reference to a media object attached to a report
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct MediaRef {
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// Core report document
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ReportDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    /// Monotonic sequence number
    pub seq: i64,

    /// `fetcher_v1:<fetcher_id>` for fetcher submissions
    pub reporter_id: String,

    pub latitude: f64,

    pub longitude: f64,

    pub title: String,

    pub description: String,

    #[serde(default)]
    pub media: Vec<MediaRef>,

    /// When the report was received
    pub ts: DateTime,
}

impl Default for ReportDoc {
    fn default() -> Self {
        Self {
            _id: None,
            metadata: Metadata::default(),
            seq: 0,
            reporter_id: String::new(),
            latitude: 0.0,
            longitude: 0.0,
            title: String::new(),
            description: String::new(),
            media: Vec::new(),
            ts: DateTime::from_millis(0),
        }
    }
}

/// Reporter id recorded for fetcher submissions
pub fn fetcher_reporter_id(fetcher_id: &str) -> String {
    format!("fetcher_v1:{}", fetcher_id)
}

impl IntoIndexes for ReportDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "seq": 1 },
            Some(
                IndexOptions::builder()
                    .unique(true)
                    .name("seq_unique".to_string())
                    .build(),
            ),
        )]
    }
}

impl MutMetadata for ReportDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

/// Quarantine metadata for a report
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ReportRawDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    pub report_seq: i64,

    /// Absent for rows created by a direct promotion of a non-fetcher report
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetcher_id: Option<String>,

    /// Fetcher-supplied external id, the dedup key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collected_at: Option<DateTime>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,

    #[serde(default)]
    pub visibility: Visibility,

    #[serde(default)]
    pub trust_level: TrustLevel,

    #[serde(default)]
    pub spam_score: f64,

    /// Set once, on the first shadow to public transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promoted_to_public_at: Option<DateTime>,

    /// Set once the enriched report has been republished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysed_published_at: Option<DateTime>,
}

impl IntoIndexes for ReportRawDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "report_seq": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("report_seq_unique".to_string())
                        .build(),
                ),
            ),
            // Dedup key; rows without a source id are not constrained
            (
                doc! { "fetcher_id": 1, "source_id": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .partial_filter_expression(doc! { "source_id": { "$gt": "" } })
                        .name("fetcher_source_unique".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for ReportRawDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

/// Analysis result for a report, produced downstream
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ReportAnalysisDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    pub report_seq: i64,

    /// Analyser that produced the result
    #[serde(default)]
    pub analyser: String,

    #[serde(default)]
    pub language: String,

    #[serde(default)]
    pub summary: String,

    #[serde(default)]
    pub categories: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity_score: Option<f64>,

    /// Analyser-specific payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoIndexes for ReportAnalysisDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "report_seq": 1 },
            Some(
                IndexOptions::builder()
                    .name("report_seq_index".to_string())
                    .build(),
            ),
        )]
    }
}

impl MutMetadata for ReportAnalysisDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

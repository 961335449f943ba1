//! Analysis queue message types
//!
//! Payloads are plain JSON. Timestamps are RFC 3339 strings so consumers do
//! not need to understand BSON extended JSON.

use serde::{Deserialize, Serialize};

use crate::db::schemas::{MediaRef, ReportAnalysisDoc, ReportDoc};
use crate::types::{TrustLevel, Visibility};

/// Default subject for newly admitted reports
pub const RAW_SUBJECT: &str = "report.raw";

/// Default subject for promoted reports with their analyses
pub const ANALYSED_SUBJECT: &str = "report.analysed";

/// A report handed to the analyser
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawReportMessage {
    pub seq: i64,
    pub description: String,
    pub latitude: f64,
    pub longitude: f64,
    pub fetcher_id: String,
    pub source_id: String,
    pub visibility: Visibility,
    pub trust_level: TrustLevel,
}

/// Report fields republished on promotion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportPayload {
    pub seq: i64,
    pub reporter_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub media: Vec<MediaRef>,
    pub ts: String,
}

impl From<&ReportDoc> for ReportPayload {
    fn from(report: &ReportDoc) -> Self {
        Self {
            seq: report.seq,
            reporter_id: report.reporter_id.clone(),
            latitude: report.latitude,
            longitude: report.longitude,
            title: report.title.clone(),
            description: report.description.clone(),
            media: report.media.clone(),
            ts: report.ts.to_chrono().to_rfc3339(),
        }
    }
}

/// One analysis result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisPayload {
    pub analyser: String,
    pub language: String,
    pub summary: String,
    pub categories: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl From<&ReportAnalysisDoc> for AnalysisPayload {
    fn from(analysis: &ReportAnalysisDoc) -> Self {
        Self {
            analyser: analysis.analyser.clone(),
            language: analysis.language.clone(),
            summary: analysis.summary.clone(),
            categories: analysis.categories.clone(),
            severity_score: analysis.severity_score,
            details: analysis.details.clone(),
            created_at: analysis
                .metadata
                .created_at
                .map(|t| t.to_chrono().to_rfc3339()),
        }
    }
}

/// A promoted report with everything the analyser has written for it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysedReportMessage {
    pub report: ReportPayload,
    pub analysis: Vec<AnalysisPayload>,
}

impl AnalysedReportMessage {
    pub fn new(report: &ReportDoc, analyses: &[ReportAnalysisDoc]) -> Self {
        Self {
            report: report.into(),
            analysis: analyses.iter().map(AnalysisPayload::from).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::DateTime;

    #[test]
    fn test_raw_message_wire_format() {
        let msg = RawReportMessage {
            seq: 7,
            description: "pothole".into(),
            latitude: 1.5,
            longitude: -2.0,
            fetcher_id: "f".into(),
            source_id: "a".into(),
            visibility: Visibility::Shadow,
            trust_level: TrustLevel::Unverified,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["seq"], 7);
        assert_eq!(json["visibility"], "shadow");
        assert_eq!(json["trust_level"], "unverified");
    }

    #[test]
    fn test_analysed_message_uses_rfc3339() {
        let report = ReportDoc {
            seq: 3,
            ts: DateTime::from_millis(0),
            ..Default::default()
        };
        let analysis = ReportAnalysisDoc {
            report_seq: 3,
            summary: "flooding".into(),
            ..Default::default()
        };

        let msg = AnalysedReportMessage::new(&report, &[analysis]);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["report"]["ts"], "1970-01-01T00:00:00+00:00");
        assert_eq!(json["analysis"][0]["summary"], "flooding");
        assert!(json["analysis"][0].get("severity_score").is_none());
    }
}

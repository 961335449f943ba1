//! Audit record schemas
//!
//! Both collections are append-only. Moderation events record every
//! governance mutation; ingestion audit lines record every ingest and
//! registration attempt with its outcome.

use bson::{doc, oid::ObjectId, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;

/// Collection name for moderation events
pub const MODERATION_EVENT_COLLECTION: &str = "moderation_events";

/// Collection name for ingestion audit lines
pub const INGESTION_AUDIT_COLLECTION: &str = "ingestion_audit";

/// Actions recorded as moderation events
pub mod actions {
    pub const PROMOTION_REQUEST_CREATE: &str = "promotion_request_create";
    pub const PROMOTION_REQUEST_DECIDE: &str = "promotion_request_decide";
    pub const REPORT_PROMOTE: &str = "report_promote";
    pub const FETCHER_SUSPEND: &str = "fetcher_suspend";
    pub const FETCHER_KEY_REVOKE: &str = "fetcher_key_revoke";
}

/// Immutable record of a governance-affecting action
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ModerationEventDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    pub event_id: String,

    /// Who performed the action (admin actor or `fetcher:<id>`)
    pub actor: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_ip: Option<String>,

    pub action: String,

    /// `fetcher`, `fetcher_key`, `report` or `promotion_request`
    pub target_type: String,

    pub target_id: String,

    #[serde(default)]
    pub details: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    pub at: DateTime,
}

impl Default for ModerationEventDoc {
    fn default() -> Self {
        Self {
            _id: None,
            metadata: Metadata::default(),
            event_id: String::new(),
            actor: String::new(),
            actor_ip: None,
            action: String::new(),
            target_type: String::new(),
            target_id: String::new(),
            details: serde_json::Value::Null,
            request_id: None,
            at: DateTime::from_millis(0),
        }
    }
}

impl ModerationEventDoc {
    /// Create a new event stamped now
    pub fn new(actor: &str, action: &str, target_type: &str, target_id: impl ToString) -> Self {
        let now = DateTime::now();
        Self {
            _id: None,
            metadata: Metadata::at(now),
            event_id: uuid::Uuid::new_v4().to_string(),
            actor: actor.to_string(),
            actor_ip: None,
            action: action.to_string(),
            target_type: target_type.to_string(),
            target_id: target_id.to_string(),
            details: serde_json::Value::Null,
            request_id: None,
            at: now,
        }
    }

    /// Set the actor's address
    pub fn with_actor_ip(mut self, ip: Option<String>) -> Self {
        self.actor_ip = ip;
        self
    }

    /// Set structured details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    /// Set the correlation id
    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }
}

impl IntoIndexes for ModerationEventDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "target_type": 1, "target_id": 1, "at": -1 },
                Some(
                    IndexOptions::builder()
                        .name("target_index".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "action": 1, "at": -1 },
                Some(
                    IndexOptions::builder()
                        .name("action_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for ModerationEventDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

/// One line per ingest or registration call
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct IngestionAuditDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetcher_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,

    pub endpoint: String,

    /// `ok`, `partially_queued`, `quota_exceeded`, `rate_limited`, ...
    pub outcome: String,

    pub status_code: i32,

    pub submitted: i64,

    pub accepted: i64,

    pub duplicates: i64,

    pub rejected: i64,

    /// Rejection reason -> count
    #[serde(default)]
    pub reject_reasons: BTreeMap<String, i64>,

    pub latency_ms: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    pub at: DateTime,
}

impl Default for IngestionAuditDoc {
    fn default() -> Self {
        Self {
            _id: None,
            metadata: Metadata::default(),
            fetcher_id: None,
            key_id: None,
            endpoint: String::new(),
            outcome: String::new(),
            status_code: 0,
            submitted: 0,
            accepted: 0,
            duplicates: 0,
            rejected: 0,
            reject_reasons: BTreeMap::new(),
            latency_ms: 0,
            remote_ip: None,
            user_agent: None,
            request_id: None,
            at: DateTime::from_millis(0),
        }
    }
}

impl IngestionAuditDoc {
    /// Create a new audit line stamped now
    pub fn new(endpoint: &str) -> Self {
        let now = DateTime::now();
        Self {
            metadata: Metadata::at(now),
            endpoint: endpoint.to_string(),
            at: now,
            ..Default::default()
        }
    }

    /// Set the caller identity
    pub fn with_fetcher(mut self, fetcher_id: &str, key_id: &str) -> Self {
        self.fetcher_id = Some(fetcher_id.to_string());
        self.key_id = Some(key_id.to_string());
        self
    }

    /// Set the outcome and HTTP status
    pub fn with_outcome(mut self, outcome: &str, status_code: u16) -> Self {
        self.outcome = outcome.to_string();
        self.status_code = status_code as i32;
        self
    }

    /// Set the item counts
    pub fn with_counts(mut self, submitted: usize, accepted: usize, duplicates: usize, rejected: usize) -> Self {
        self.submitted = submitted as i64;
        self.accepted = accepted as i64;
        self.duplicates = duplicates as i64;
        self.rejected = rejected as i64;
        self
    }

    /// Set the rejection histogram
    pub fn with_reject_reasons(mut self, reasons: BTreeMap<String, i64>) -> Self {
        self.reject_reasons = reasons;
        self
    }

    /// Set the elapsed time
    pub fn with_latency(mut self, latency_ms: u128) -> Self {
        self.latency_ms = latency_ms.min(i64::MAX as u128) as i64;
        self
    }

    /// Set request context
    pub fn with_request(
        mut self,
        remote_ip: Option<String>,
        user_agent: Option<String>,
        request_id: Option<String>,
    ) -> Self {
        self.remote_ip = remote_ip;
        self.user_agent = user_agent;
        self.request_id = request_id;
        self
    }
}

impl IntoIndexes for IngestionAuditDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "fetcher_id": 1, "at": -1 },
            Some(
                IndexOptions::builder()
                    .name("fetcher_at_index".to_string())
                    .build(),
            ),
        )]
    }
}

impl MutMetadata for IngestionAuditDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_moderation_event_builder() {
        let event = ModerationEventDoc::new("internal_admin", actions::FETCHER_SUSPEND, "fetcher", "f-1")
            .with_actor_ip(Some("10.0.0.1".into()))
            .with_details(serde_json::json!({ "status": "suspended" }))
            .with_request_id(Some("req-1".into()));

        assert_eq!(event.action, "fetcher_suspend");
        assert_eq!(event.target_id, "f-1");
        assert_eq!(event.details["status"], "suspended");
        assert!(!event.event_id.is_empty());
        assert_eq!(event.metadata.created_at, Some(event.at));
    }

    #[test]
    fn test_ingestion_audit_builder() {
        let mut reasons = BTreeMap::new();
        reasons.insert("source_id is required".to_string(), 2);

        let line = IngestionAuditDoc::new("/v1/reports:bulkIngest")
            .with_fetcher("f-1", "k-1")
            .with_outcome("ok", 200)
            .with_counts(5, 3, 0, 2)
            .with_reject_reasons(reasons)
            .with_latency(12);

        assert_eq!(line.fetcher_id.as_deref(), Some("f-1"));
        assert_eq!(line.submitted, 5);
        assert_eq!(line.rejected, 2);
        assert_eq!(line.reject_reasons["source_id is required"], 2);
        assert_eq!(line.status_code, 200);
    }
}

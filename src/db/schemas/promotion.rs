//! Fetcher promotion request schema
//!
//! A fetcher asks for higher trust; an admin approves, denies or asks for
//! more information. At most one request per fetcher may be pending, which
//! the partial unique index enforces.

use bson::{doc, oid::ObjectId, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::{FetcherSettings, Metadata};
use crate::types::{PromotionStatus, TrustLevel, Visibility};

/// Collection name for promotion requests
pub const PROMOTION_REQUEST_COLLECTION: &str = "fetcher_promotion_requests";

/// Minimum length of request notes after trimming
pub const MIN_NOTES_LEN: usize = 10;

/// Settings a fetcher asks for. Advisory; the reviewer decides what to apply.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct RequestedSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_cap_items: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_minute_cap_items: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_visibility: Option<Visibility>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_trust_level: Option<TrustLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewards_enabled: Option<bool>,
}

/// Promotion request document
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct PromotionRequestDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    /// Sequential public id
    pub request_id: i64,

    pub fetcher_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_email: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_domain: Option<String>,

    #[serde(default)]
    pub requested: RequestedSettings,

    pub notes: String,

    pub status: PromotionStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_notes: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_by: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_at: Option<DateTime>,

    /// Settings written to the fetcher on approval
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied: Option<FetcherSettings>,
}

impl PromotionRequestDoc {
    /// New pending request; `request_id` is assigned by the store
    pub fn new(fetcher_id: String, notes: String, requested: RequestedSettings) -> Self {
        Self {
            _id: None,
            metadata: Metadata::new(),
            request_id: 0,
            fetcher_id,
            contact_email: None,
            verified_domain: None,
            requested,
            notes,
            status: PromotionStatus::Pending,
            decision_notes: None,
            reviewed_by: None,
            reviewed_at: None,
            applied: None,
        }
    }

    pub fn created_at(&self) -> Option<DateTime> {
        self.metadata.created_at
    }
}

impl IntoIndexes for PromotionRequestDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "request_id": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("request_id_unique".to_string())
                        .build(),
                ),
            ),
            // Single pending request per fetcher
            (
                doc! { "fetcher_id": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .partial_filter_expression(doc! { "status": "pending" })
                        .name("fetcher_pending_unique".to_string())
                        .build(),
                ),
            ),
            // Review queue listing
            (
                doc! { "status": 1, "metadata.created_at": 1 },
                Some(
                    IndexOptions::builder()
                        .name("status_created_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for PromotionRequestDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

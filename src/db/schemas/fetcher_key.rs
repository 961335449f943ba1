//! Fetcher key document schema
//!
//! Stores the Argon2 hash of a key's secret half. The plaintext key is
//! shown once at registration and never persisted.

use bson::{doc, oid::ObjectId, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::auth::ScopeSet;
use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;
use crate::types::KeyStatus;

/// Collection name for fetcher keys
pub const FETCHER_KEY_COLLECTION: &str = "fetcher_keys";

/// Fetcher key document stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct FetcherKeyDoc {
    /// MongoDB document ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    /// Common metadata
    #[serde(default)]
    pub metadata: Metadata,

    /// Lookup identifier embedded in the presented key
    pub key_id: String,

    /// Owning fetcher
    pub fetcher_id: String,

    /// Environment prefix the key was issued with
    pub key_prefix: String,

    /// Argon2 PHC string of the secret
    pub key_hash: String,

    pub scopes: ScopeSet,

    /// Per-key override, used when positive
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_minute_cap_items: Option<i64>,

    /// Per-key override, used when positive
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_cap_items: Option<i64>,

    pub status: KeyStatus,

    /// Last successful authentication
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime>,
}

impl FetcherKeyDoc {
    /// Create a new active key
    pub fn new(
        key_id: String,
        fetcher_id: String,
        key_prefix: &str,
        key_hash: String,
        scopes: ScopeSet,
    ) -> Self {
        Self {
            _id: None,
            metadata: Metadata::new(),
            key_id,
            fetcher_id,
            key_prefix: key_prefix.to_string(),
            key_hash,
            scopes,
            per_minute_cap_items: None,
            daily_cap_items: None,
            status: KeyStatus::Active,
            last_used_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == KeyStatus::Active
    }
}

impl IntoIndexes for FetcherKeyDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            // Point lookup on authentication
            (
                doc! { "key_id": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("key_id_unique".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "fetcher_id": 1 },
                Some(
                    IndexOptions::builder()
                        .name("fetcher_id_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for FetcherKeyDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

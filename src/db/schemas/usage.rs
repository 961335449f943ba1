//! Quota counter schema
//!
//! One document per (fetcher, key). Each window stores its bucket start
//! alongside its count; a count whose bucket is not the current one reads
//! as zero and is overwritten by the next consume.

use bson::{doc, oid::ObjectId, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;

/// Collection name for usage counters
pub const USAGE_COLLECTION: &str = "fetcher_usage";

/// Collection name for id counters
pub const COUNTER_COLLECTION: &str = "counters";

/// Per-key usage counters
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct UsageCounterDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    pub fetcher_id: String,

    pub key_id: String,

    /// Start of the UTC minute `minute_items` belongs to
    pub minute_bucket: DateTime,

    pub minute_items: i64,

    /// Start of the UTC day `day_items` belongs to
    pub day_bucket: DateTime,

    pub day_items: i64,
}

impl Default for UsageCounterDoc {
    fn default() -> Self {
        Self {
            _id: None,
            metadata: Metadata::default(),
            fetcher_id: String::new(),
            key_id: String::new(),
            minute_bucket: DateTime::from_millis(0),
            minute_items: 0,
            day_bucket: DateTime::from_millis(0),
            day_items: 0,
        }
    }
}

impl IntoIndexes for UsageCounterDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "fetcher_id": 1, "key_id": 1 },
            Some(
                IndexOptions::builder()
                    .unique(true)
                    .name("fetcher_key_unique".to_string())
                    .build(),
            ),
        )]
    }
}

impl MutMetadata for UsageCounterDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

/// Named monotonic counter used to allocate report and request ids
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct CounterDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    pub name: String,

    /// Last value handed out
    #[serde(default)]
    pub value: i64,
}

impl IntoIndexes for CounterDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "name": 1 },
            Some(
                IndexOptions::builder()
                    .unique(true)
                    .name("name_unique".to_string())
                    .build(),
            ),
        )]
    }
}

impl MutMetadata for CounterDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

//! Common metadata for all documents
//!
//! Tracks creation and update timestamps. The soft-delete flag is honoured
//! by reads; governance records are never deleted.

use bson::DateTime;
use serde::{Deserialize, Serialize};

/// Common metadata for all documents
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Metadata {
    /// Whether this document has been soft-deleted
    #[serde(default)]
    pub is_deleted: bool,

    /// When the document was soft-deleted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime>,

    /// When the document was last updated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime>,

    /// When the document was created
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime>,
}

impl Metadata {
    /// Create new metadata stamped at `now`
    pub fn at(now: DateTime) -> Self {
        Self {
            is_deleted: false,
            deleted_at: None,
            updated_at: Some(now),
            created_at: Some(now),
        }
    }

    /// Create new metadata with current timestamp
    pub fn new() -> Self {
        Self::at(DateTime::now())
    }

    /// Bump the update timestamp
    pub fn touch(&mut self, now: DateTime) {
        self.updated_at = Some(now);
    }
}

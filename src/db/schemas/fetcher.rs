//! Fetcher document schema
//!
//! A fetcher is an external submitter of report batches. Its governance
//! fields (tier, caps, default visibility/trust, routing/rewards) are only
//! changed through admin actions or an approved promotion request.

use bson::{doc, oid::ObjectId, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;
use crate::types::{FetcherStatus, GatehouseError, OwnerType, TrustLevel, Visibility};

/// Collection name for fetchers
pub const FETCHER_COLLECTION: &str = "fetchers";

/// Longest accepted fetcher name
pub const MAX_NAME_LEN: usize = 255;

/// Values a newly registered fetcher starts with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetcherDefaults {
    pub tier: i32,
    pub reputation_score: i32,
    pub daily_cap_items: i64,
    pub per_minute_cap_items: i64,
}

impl Default for FetcherDefaults {
    fn default() -> Self {
        Self {
            tier: 0,
            reputation_score: 50,
            daily_cap_items: 200,
            per_minute_cap_items: 20,
        }
    }
}

/// Fetcher document stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct FetcherDoc {
    /// MongoDB document ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    /// Common metadata
    #[serde(default)]
    pub metadata: Metadata,

    /// Public identifier (UUID v4)
    pub fetcher_id: String,

    pub name: String,

    pub owner_type: OwnerType,

    pub status: FetcherStatus,

    /// Cleared by suspension; independent of `status` so an approval can
    /// re-enable a fetcher explicitly
    pub active: bool,

    pub tier: i32,

    pub reputation_score: i32,

    /// Items per UTC day, <= 0 means unlimited
    pub daily_cap_items: i64,

    /// Items per UTC minute, <= 0 means unlimited
    pub per_minute_cap_items: i64,

    #[serde(default)]
    pub default_visibility: Visibility,

    #[serde(default)]
    pub default_trust_level: TrustLevel,

    #[serde(default)]
    pub routing_enabled: bool,

    #[serde(default)]
    pub rewards_enabled: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified_domain: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_user_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime>,
}

impl FetcherDoc {
    /// Create a freshly registered fetcher
    pub fn new(
        fetcher_id: String,
        name: &str,
        owner_type: OwnerType,
        defaults: FetcherDefaults,
    ) -> Self {
        Self {
            _id: None,
            metadata: Metadata::new(),
            fetcher_id,
            name: normalize_name(name),
            owner_type,
            status: FetcherStatus::Active,
            active: true,
            tier: defaults.tier,
            reputation_score: defaults.reputation_score,
            daily_cap_items: defaults.daily_cap_items,
            per_minute_cap_items: defaults.per_minute_cap_items,
            default_visibility: Visibility::Shadow,
            default_trust_level: TrustLevel::Unverified,
            routing_enabled: false,
            rewards_enabled: false,
            verified_domain: None,
            owner_user_id: None,
            notes: None,
            last_seen_at: None,
        }
    }

    /// Whether this fetcher may authenticate and submit
    pub fn can_submit(&self) -> bool {
        self.active && self.status.can_submit()
    }
}

/// Trim, default to "anonymous" and clamp to `MAX_NAME_LEN` characters
pub fn normalize_name(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "anonymous".to_string();
    }
    clamp_chars(trimmed, MAX_NAME_LEN)
}

/// Truncate to at most `max` characters on a char boundary
pub fn clamp_chars(value: &str, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((idx, _)) => value[..idx].to_string(),
        None => value.to_string(),
    }
}

/// Governance settings applied to a fetcher by an admin decision.
///
/// Every field is optional; only the ones present are written.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct FetcherSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reputation_score: Option<i32>,
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
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetcher_status: Option<FetcherStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
}

impl FetcherSettings {
    /// True when no field is set
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Reject out-of-range values and clamp free text
    pub fn validate(mut self) -> Result<Self, GatehouseError> {
        if matches!(self.tier, Some(t) if t < 0) {
            return Err(GatehouseError::BadRequest("tier must be >= 0".into()));
        }
        if matches!(self.reputation_score, Some(r) if !(0..=100).contains(&r)) {
            return Err(GatehouseError::BadRequest(
                "reputation_score must be between 0 and 100".into(),
            ));
        }
        if matches!(self.daily_cap_items, Some(c) if c < 0)
            || matches!(self.per_minute_cap_items, Some(c) if c < 0)
        {
            return Err(GatehouseError::BadRequest("caps must be >= 0".into()));
        }

        self.verified_domain = self.verified_domain.map(|s| clamp_chars(s.trim(), 255));
        self.owner_user_id = self.owner_user_id.map(|s| clamp_chars(s.trim(), 255));
        self.notes = self.notes.map(|s| clamp_chars(s.trim(), 4096));
        Ok(self)
    }

    /// Apply the present fields to an in-memory fetcher
    pub fn apply_to(&self, fetcher: &mut FetcherDoc) {
        if let Some(v) = self.tier {
            fetcher.tier = v;
        }
        if let Some(v) = self.reputation_score {
            fetcher.reputation_score = v;
        }
        if let Some(v) = self.daily_cap_items {
            fetcher.daily_cap_items = v;
        }
        if let Some(v) = self.per_minute_cap_items {
            fetcher.per_minute_cap_items = v;
        }
        if let Some(v) = self.default_visibility {
            fetcher.default_visibility = v;
        }
        if let Some(v) = self.default_trust_level {
            fetcher.default_trust_level = v;
        }
        if let Some(v) = self.routing_enabled {
            fetcher.routing_enabled = v;
        }
        if let Some(v) = self.rewards_enabled {
            fetcher.rewards_enabled = v;
        }
        if let Some(ref v) = self.verified_domain {
            fetcher.verified_domain = Some(v.clone());
        }
        if let Some(ref v) = self.owner_user_id {
            fetcher.owner_user_id = Some(v.clone());
        }
        if let Some(ref v) = self.notes {
            fetcher.notes = Some(v.clone());
        }
        if let Some(v) = self.fetcher_status {
            fetcher.status = v;
        }
        if let Some(v) = self.active {
            fetcher.active = v;
        }
    }

    /// Build the `$set` body for the present fields
    pub fn to_set_document(&self, now: DateTime) -> Document {
        let mut set = doc! { "metadata.updated_at": now };
        if let Some(v) = self.tier {
            set.insert("tier", v);
        }
        if let Some(v) = self.reputation_score {
            set.insert("reputation_score", v);
        }
        if let Some(v) = self.daily_cap_items {
            set.insert("daily_cap_items", v);
        }
        if let Some(v) = self.per_minute_cap_items {
            set.insert("per_minute_cap_items", v);
        }
        if let Some(v) = self.default_visibility {
            set.insert("default_visibility", v.as_str());
        }
        if let Some(v) = self.default_trust_level {
            set.insert("default_trust_level", v.as_str());
        }
        if let Some(v) = self.routing_enabled {
            set.insert("routing_enabled", v);
        }
        if let Some(v) = self.rewards_enabled {
            set.insert("rewards_enabled", v);
        }
        if let Some(ref v) = self.verified_domain {
            set.insert("verified_domain", v.as_str());
        }
        if let Some(ref v) = self.owner_user_id {
            set.insert("owner_user_id", v.as_str());
        }
        if let Some(ref v) = self.notes {
            set.insert("notes", v.as_str());
        }
        if let Some(v) = self.fetcher_status {
            set.insert("status", v.as_str());
        }
        if let Some(v) = self.active {
            set.insert("active", v);
        }
        set
    }
}

impl IntoIndexes for FetcherDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "fetcher_id": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("fetcher_id_unique".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "status": 1 },
                Some(
                    IndexOptions::builder()
                        .name("status_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for FetcherDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_fetcher_defaults() {
        let f = FetcherDoc::new(
            "f-1".into(),
            "  ",
            OwnerType::Partner,
            FetcherDefaults::default(),
        );
        assert_eq!(f.name, "anonymous");
        assert_eq!(f.status, FetcherStatus::Active);
        assert!(f.can_submit());
        assert_eq!(f.tier, 0);
        assert_eq!(f.reputation_score, 50);
        assert_eq!(f.per_minute_cap_items, 20);
        assert_eq!(f.daily_cap_items, 200);
        assert_eq!(f.default_visibility, Visibility::Shadow);
    }

    #[test]
    fn test_clamp_chars_respects_boundaries() {
        assert_eq!(clamp_chars("héllo", 2), "hé");
        assert_eq!(clamp_chars("abc", 10), "abc");
        assert_eq!(normalize_name(&"x".repeat(300)).chars().count(), MAX_NAME_LEN);
    }

    #[test]
    fn test_settings_apply_only_present_fields() {
        let mut f = FetcherDoc::new("f-1".into(), "bot", OwnerType::Unknown, FetcherDefaults::default());
        let settings = FetcherSettings {
            tier: Some(2),
            daily_cap_items: Some(5000),
            routing_enabled: Some(true),
            ..Default::default()
        };
        assert!(!settings.is_empty());
        settings.apply_to(&mut f);

        assert_eq!(f.tier, 2);
        assert_eq!(f.daily_cap_items, 5000);
        assert_eq!(f.per_minute_cap_items, 20);
        assert!(f.routing_enabled);

        let set = settings.to_set_document(DateTime::now());
        assert_eq!(set.get_i32("tier").unwrap(), 2);
        assert_eq!(set.get_i64("daily_cap_items").unwrap(), 5000);
        assert!(set.get("per_minute_cap_items").is_none());
    }

    #[test]
    fn test_settings_validation() {
        assert!(FetcherSettings::default().is_empty());
        assert!(FetcherSettings { tier: Some(-1), ..Default::default() }.validate().is_err());
        assert!(FetcherSettings { daily_cap_items: Some(-5), ..Default::default() }.validate().is_err());
        assert!(FetcherSettings { reputation_score: Some(101), ..Default::default() }.validate().is_err());
        let ok = FetcherSettings {
            verified_domain: Some("  example.org ".into()),
            ..Default::default()
        }
        .validate()
        .unwrap();
        assert_eq!(ok.verified_domain.as_deref(), Some("example.org"));
    }
}

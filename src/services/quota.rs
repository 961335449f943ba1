//! Quota windows and cap resolution
//!
//! Usage is counted per (fetcher, key) in two fixed UTC windows: the
//! current minute and the current day. A cap <= 0 means unlimited.

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::Serialize;

use crate::db::schemas::{FetcherDoc, FetcherKeyDoc};
use crate::types::GatehouseError;

pub const PER_MINUTE_EXCEEDED: &str = "per-minute quota exceeded";
pub const DAILY_EXCEEDED: &str = "daily quota exceeded";

/// Caps in force for one key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EffectiveCaps {
    #[serde(rename = "per_minute_cap_items")]
    pub per_minute: i64,
    #[serde(rename = "daily_cap_items")]
    pub daily: i64,
}

impl EffectiveCaps {
    pub fn new(per_minute: i64, daily: i64) -> Self {
        Self { per_minute, daily }
    }

    /// Key override when present and positive, else the fetcher default
    pub fn resolve(fetcher: &FetcherDoc, key: &FetcherKeyDoc) -> Self {
        fn pick(key_cap: Option<i64>, fetcher_cap: i64) -> i64 {
            key_cap.filter(|c| *c > 0).unwrap_or(fetcher_cap)
        }

        Self {
            per_minute: pick(key.per_minute_cap_items, fetcher.per_minute_cap_items),
            daily: pick(key.daily_cap_items, fetcher.daily_cap_items),
        }
    }

    /// Check whether `items` more fit on top of `usage`
    pub fn admit(&self, usage: UsageSnapshot, items: i64) -> Result<(), GatehouseError> {
        if !fits(self.per_minute, usage.minute_used, items) {
            return Err(GatehouseError::QuotaExceeded(PER_MINUTE_EXCEEDED.into()));
        }
        if !fits(self.daily, usage.daily_used, items) {
            return Err(GatehouseError::QuotaExceeded(DAILY_EXCEEDED.into()));
        }
        Ok(())
    }
}

fn fits(cap: i64, used: i64, items: i64) -> bool {
    cap <= 0 || used.saturating_add(items) <= cap
}

/// Usage in the windows containing a given instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct UsageSnapshot {
    pub minute_used: i64,
    pub daily_used: i64,
}

impl UsageSnapshot {
    /// Remaining quota; None when the window is unlimited
    pub fn remaining(&self, caps: EffectiveCaps) -> RemainingQuota {
        let left = |cap: i64, used: i64| (cap > 0).then(|| (cap - used).max(0));
        RemainingQuota {
            minute_remaining: left(caps.per_minute, self.minute_used),
            daily_remaining: left(caps.daily, self.daily_used),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RemainingQuota {
    pub minute_remaining: Option<i64>,
    pub daily_remaining: Option<i64>,
}

/// Start of the UTC minute containing `now`
pub fn minute_bucket(now: DateTime<Utc>) -> DateTime<Utc> {
    now.duration_trunc(TimeDelta::minutes(1)).unwrap_or(now)
}

/// Start of the UTC day containing `now`
pub fn day_bucket(now: DateTime<Utc>) -> DateTime<Utc> {
    now.duration_trunc(TimeDelta::days(1)).unwrap_or(now)
}

/// Count stored for a window, zero when the stored bucket is stale
pub fn current_count(stored_bucket: DateTime<Utc>, stored_items: i64, bucket: DateTime<Utc>) -> i64 {
    if stored_bucket == bucket {
        stored_items
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ScopeSet;
    use crate::db::schemas::FetcherDefaults;
    use crate::types::OwnerType;
    use chrono::TimeZone;

    fn fetcher() -> FetcherDoc {
        FetcherDoc::new("f".into(), "bot", OwnerType::Unknown, FetcherDefaults::default())
    }

    fn key() -> FetcherKeyDoc {
        FetcherKeyDoc::new("k".into(), "f".into(), "fk_test_", "h".into(), ScopeSet::fetcher_default())
    }

    #[test]
    fn test_resolve_prefers_positive_key_override() {
        let f = fetcher();
        let mut k = key();
        assert_eq!(EffectiveCaps::resolve(&f, &k), EffectiveCaps::new(20, 200));

        k.daily_cap_items = Some(1000);
        k.per_minute_cap_items = Some(0);
        assert_eq!(EffectiveCaps::resolve(&f, &k), EffectiveCaps::new(20, 1000));
    }

    #[test]
    fn test_admit_checks_both_windows() {
        let caps = EffectiveCaps::new(20, 200);
        let usage = UsageSnapshot { minute_used: 15, daily_used: 190 };

        assert!(caps.admit(usage, 5).is_ok());
        match caps.admit(usage, 6) {
            Err(GatehouseError::QuotaExceeded(msg)) => assert_eq!(msg, PER_MINUTE_EXCEEDED),
            other => panic!("unexpected {:?}", other),
        }

        let caps = EffectiveCaps::new(0, 200);
        match caps.admit(usage, 11) {
            Err(GatehouseError::QuotaExceeded(msg)) => assert_eq!(msg, DAILY_EXCEEDED),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unlimited_caps() {
        let caps = EffectiveCaps::new(0, -1);
        let usage = UsageSnapshot { minute_used: i64::MAX, daily_used: i64::MAX };
        assert!(caps.admit(usage, 1_000_000).is_ok());
        assert_eq!(
            usage.remaining(caps),
            RemainingQuota { minute_remaining: None, daily_remaining: None }
        );
    }

    #[test]
    fn test_buckets_truncate_to_utc() {
        let now = Utc.with_ymd_and_hms(2026, 3, 14, 15, 9, 26).unwrap();
        assert_eq!(minute_bucket(now), Utc.with_ymd_and_hms(2026, 3, 14, 15, 9, 0).unwrap());
        assert_eq!(day_bucket(now), Utc.with_ymd_and_hms(2026, 3, 14, 0, 0, 0).unwrap());

        let stale = Utc.with_ymd_and_hms(2026, 3, 13, 0, 0, 0).unwrap();
        assert_eq!(current_count(stale, 99, day_bucket(now)), 0);
        assert_eq!(current_count(day_bucket(now), 99, day_bucket(now)), 99);
    }

    #[test]
    fn test_remaining_never_negative() {
        let caps = EffectiveCaps::new(20, 200);
        let usage = UsageSnapshot { minute_used: 25, daily_used: 4 };
        assert_eq!(
            usage.remaining(caps),
            RemainingQuota { minute_remaining: Some(0), daily_remaining: Some(196) }
        );
    }
}

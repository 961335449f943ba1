//! Governance enums shared by the store, services and routes
//!
//! Every enum serializes to the lowercase wire form used in documents,
//! queue messages and HTTP bodies.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::GatehouseError;

macro_rules! wire_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = GatehouseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(GatehouseError::BadRequest(format!(
                        "invalid {}: {:?}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

/// Who operates a fetcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OwnerType {
    Internal,
    Partner,
    Openclaw,
    #[default]
    Unknown,
}

wire_enum!(OwnerType {
    Internal => "internal",
    Partner => "partner",
    Openclaw => "openclaw",
    Unknown => "unknown",
});

impl OwnerType {
    /// Lenient parse used at registration: anything unrecognised is `Unknown`
    pub fn from_input(raw: Option<&str>) -> Self {
        raw.and_then(|s| s.parse().ok()).unwrap_or_default()
    }
}

/// Lifecycle status of a fetcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FetcherStatus {
    #[default]
    Active,
    Limited,
    Suspended,
    Banned,
}

wire_enum!(FetcherStatus {
    Active => "active",
    Limited => "limited",
    Suspended => "suspended",
    Banned => "banned",
});

impl FetcherStatus {
    /// Limited fetchers may still submit; suspended and banned may not
    pub fn can_submit(&self) -> bool {
        matches!(self, Self::Active | Self::Limited)
    }

    /// Statuses a direct suspension may set
    pub fn is_restriction(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

/// Status of a single API key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    #[default]
    Active,
    Revoked,
}

wire_enum!(KeyStatus {
    Active => "active",
    Revoked => "revoked",
});

/// Report visibility. Ordered so promotion can only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Shadow,
    Public,
}

wire_enum!(Visibility {
    Shadow => "shadow",
    Public => "public",
});

/// Report trust level. Ordered like `Visibility`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    #[default]
    Unverified,
    Verified,
}

wire_enum!(TrustLevel {
    Unverified => "unverified",
    Verified => "verified",
});

/// Promotion request state. `Pending` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PromotionStatus {
    #[default]
    Pending,
    Approved,
    Denied,
    NeedsInfo,
}

wire_enum!(PromotionStatus {
    Pending => "pending",
    Approved => "approved",
    Denied => "denied",
    NeedsInfo => "needs_info",
});

impl PromotionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

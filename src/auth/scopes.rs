//! Key scopes
//!
//! Scopes are an explicit enumerated set attached to each key. Endpoint
//! authorization is a membership check.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A capability granted to a fetcher key
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Scope {
    /// Submit report batches
    #[serde(rename = "report:submit")]
    ReportSubmit,
    /// Read own fetcher profile and promotion status
    #[serde(rename = "fetcher:read")]
    FetcherRead,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::ReportSubmit => "report:submit",
            Scope::FetcherRead => "fetcher:read",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of scopes carried by a key
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeSet(BTreeSet<Scope>);

impl ScopeSet {
    /// Scopes granted to a key at registration
    pub fn fetcher_default() -> Self {
        [Scope::ReportSubmit, Scope::FetcherRead].into_iter().collect()
    }

    pub fn contains(&self, scope: Scope) -> bool {
        self.0.contains(&scope)
    }

    pub fn iter(&self) -> impl Iterator<Item = Scope> + '_ {
        self.0.iter().copied()
    }

    pub fn to_strings(&self) -> Vec<String> {
        self.iter().map(|s| s.as_str().to_string()).collect()
    }
}

impl FromIterator<Scope> for ScopeSet {
    fn from_iter<I: IntoIterator<Item = Scope>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_scopes() {
        let scopes = ScopeSet::fetcher_default();
        assert!(scopes.contains(Scope::ReportSubmit));
        assert!(scopes.contains(Scope::FetcherRead));
        assert_eq!(scopes.to_strings(), vec!["report:submit", "fetcher:read"]);
    }

    #[test]
    fn test_read_only_set() {
        let scopes: ScopeSet = [Scope::FetcherRead].into_iter().collect();
        assert!(!scopes.contains(Scope::ReportSubmit));
    }

    #[test]
    fn test_serde_wire_form() {
        let json = serde_json::to_string(&ScopeSet::fetcher_default()).unwrap();
        assert_eq!(json, r#"["report:submit","fetcher:read"]"#);

        let back: ScopeSet = serde_json::from_str(r#"["fetcher:read"]"#).unwrap();
        assert!(back.contains(Scope::FetcherRead));
        assert!(!back.contains(Scope::ReportSubmit));
    }
}

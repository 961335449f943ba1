//! Fetcher API key format and admin token validation
//!
//! A fetcher key is `prefix + key_id + "_" + secret`:
//!
//! - `prefix` is `fk_live_` or `fk_test_` and pins the key to one environment
//! - `key_id` is a UUID v4 (no underscores), used for the indexed lookup
//! - `secret` is 32 random bytes, base64url without padding (may contain `_`)

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Prefix for production keys
pub const LIVE_PREFIX: &str = "fk_live_";

/// Prefix for test/staging keys
pub const TEST_PREFIX: &str = "fk_test_";

/// Deployment environment a key belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "lowercase")]
pub enum KeyEnvironment {
    Live,
    #[default]
    Test,
}

impl KeyEnvironment {
    pub fn prefix(&self) -> &'static str {
        match self {
            KeyEnvironment::Live => LIVE_PREFIX,
            KeyEnvironment::Test => TEST_PREFIX,
        }
    }

    fn from_key(key: &str) -> Option<(Self, &str)> {
        if let Some(rest) = key.strip_prefix(LIVE_PREFIX) {
            Some((KeyEnvironment::Live, rest))
        } else {
            key.strip_prefix(TEST_PREFIX)
                .map(|rest| (KeyEnvironment::Test, rest))
        }
    }
}

impl fmt::Display for KeyEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyEnvironment::Live => write!(f, "live"),
            KeyEnvironment::Test => write!(f, "test"),
        }
    }
}

/// A presented key split into its parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKey {
    pub environment: KeyEnvironment,
    pub key_id: String,
    pub secret: String,
}

impl ParsedKey {
    pub fn prefix(&self) -> &'static str {
        self.environment.prefix()
    }
}

/// Build the plaintext key handed to a fetcher at registration
pub fn format_api_key(environment: KeyEnvironment, key_id: &str, secret: &str) -> String {
    format!("{}{}_{}", environment.prefix(), key_id, secret)
}

/// Split a presented key. Returns None for anything malformed.
pub fn parse_api_key(raw: &str) -> Option<ParsedKey> {
    let (environment, rest) = KeyEnvironment::from_key(raw.trim())?;
    let (key_id, secret) = rest.split_once('_')?;

    if secret.is_empty() || Uuid::parse_str(key_id).is_err() {
        return None;
    }

    Some(ParsedKey {
        environment,
        key_id: key_id.to_string(),
        secret: secret.to_string(),
    })
}

/// Extract the key from an `Authorization: Bearer <key>` header value
pub fn extract_bearer(header: Option<&str>) -> Option<&str> {
    let value = header?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Validator for the shared internal admin token
#[derive(Debug, Clone)]
pub struct AdminTokenValidator {
    token: Option<String>,
}

impl AdminTokenValidator {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.trim().is_empty()),
        }
    }

    /// Admin routes are disabled when no token is configured
    pub fn is_configured(&self) -> bool {
        self.token.is_some()
    }

    pub fn validate(&self, presented: Option<&str>) -> bool {
        match (&self.token, presented) {
            (Some(expected), Some(given)) => constant_time_compare(given.trim(), expected),
            _ => false,
        }
    }
}

/// Constant-time string comparison to prevent timing attacks
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_ID: &str = "4f1c2d3e-5a6b-4c7d-8e9f-0a1b2c3d4e5f";

    #[test]
    fn test_format_and_parse() {
        let key = format_api_key(KeyEnvironment::Live, KEY_ID, "s3cr_et-value");
        assert!(key.starts_with("fk_live_"));

        let parsed = parse_api_key(&key).unwrap();
        assert_eq!(parsed.environment, KeyEnvironment::Live);
        assert_eq!(parsed.key_id, KEY_ID);
        // Underscores in the secret survive the split
        assert_eq!(parsed.secret, "s3cr_et-value");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_api_key("").is_none());
        assert!(parse_api_key("sk_live_abc_def").is_none());
        assert!(parse_api_key(&format!("fk_test_{}", KEY_ID)).is_none());
        assert!(parse_api_key(&format!("fk_test_{}_", KEY_ID)).is_none());
        assert!(parse_api_key("fk_test_not-a-uuid_secret").is_none());
    }

    #[test]
    fn test_extract_bearer() {
        assert_eq!(extract_bearer(Some("Bearer abc")), Some("abc"));
        assert_eq!(extract_bearer(Some("bearer   abc ")), Some("abc"));
        assert_eq!(extract_bearer(Some("Basic abc")), None);
        assert_eq!(extract_bearer(Some("Bearer ")), None);
        assert_eq!(extract_bearer(None), None);
    }

    #[test]
    fn test_admin_token_validator() {
        let unset = AdminTokenValidator::new(Some("  ".into()));
        assert!(!unset.is_configured());
        assert!(!unset.validate(Some("anything")));

        let validator = AdminTokenValidator::new(Some("admin-secret".into()));
        assert!(validator.is_configured());
        assert!(validator.validate(Some("admin-secret")));
        assert!(!validator.validate(Some("admin-secreT")));
        assert!(!validator.validate(None));
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("hello", "hello"));
        assert!(!constant_time_compare("hello", "world"));
        assert!(!constant_time_compare("hello", "hell"));
    }
}

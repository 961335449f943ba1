//! Authentication and authorization for Gatehouse
//!
//! Provides:
//! - Fetcher API key format (environment prefix, key id, secret)
//! - Secret generation and Argon2 hashing
//! - Enumerated key scopes
//! - Internal admin token validation

pub mod api_key;
pub mod scopes;
pub mod secret;

pub use api_key::{
    constant_time_compare, extract_bearer, format_api_key, parse_api_key, AdminTokenValidator,
    KeyEnvironment, ParsedKey,
};
pub use scopes::{Scope, ScopeSet};
pub use secret::{generate_secret, hash_secret, verify_secret};

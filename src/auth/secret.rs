//! Key secret generation and hashing
//!
//! Secrets are hashed with Argon2id and stored as PHC strings. Key secrets
//! carry 256 bits of entropy, so the hash parameters are lighter than the
//! ones used for human passwords; every authenticated request verifies one.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;

use crate::types::GatehouseError;

/// Random bytes in a key secret
pub const SECRET_BYTES: usize = 32;

fn hasher() -> Result<Argon2<'static>, GatehouseError> {
    let params = Params::new(4096, 1, 1, None)
        .map_err(|e| GatehouseError::Internal(format!("Invalid argon2 params: {e}")))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

/// Generate a fresh secret, base64url encoded without padding
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Hash a key secret using Argon2id
pub fn hash_secret(secret: &str) -> Result<String, GatehouseError> {
    let salt = SaltString::generate(&mut OsRng);

    hasher()?
        .hash_password(secret.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| GatehouseError::Internal(format!("Failed to hash secret: {e}")))
}

/// Verify a presented secret against a stored hash
///
/// Parameters are read from the PHC string, so hashes made with other
/// Argon2 settings still verify.
pub fn verify_secret(secret: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(secret.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let secret = generate_secret();
        let hash = hash_secret(&secret).unwrap();

        assert!(hash.starts_with("$argon2id"));
        assert!(verify_secret(&secret, &hash));
        assert!(!verify_secret("wrong-secret", &hash));
    }

    #[test]
    fn test_generate_secret_shape() {
        let a = generate_secret();
        let b = generate_secret();
        assert_ne!(a, b);
        // 32 bytes -> 43 chars unpadded
        assert_eq!(a.len(), 43);
        assert!(!a.contains('='));
        assert_eq!(URL_SAFE_NO_PAD.decode(&a).unwrap().len(), SECRET_BYTES);
    }

    #[test]
    fn test_invalid_hash_format() {
        assert!(!verify_secret("secret", "not-a-valid-hash"));
    }
}

//! One-way password hashing for stored identities.

pub use bcrypt::DEFAULT_COST;

/// Salted bcrypt hash of a plaintext password at the given work factor.
pub fn hash_password(plaintext: &str, cost: u32) -> Result<String, bcrypt::BcryptError> {
    bcrypt::hash(plaintext, cost)
}

/// Check a plaintext password against a stored hash.
///
/// A malformed hash counts as a mismatch rather than an error, so callers
/// answer it with the same "invalid credentials" response as a wrong password.
pub fn verify_password(plaintext: &str, hash: &str) -> bool {
    match bcrypt::verify(plaintext, hash) {
        Ok(matches) => matches,
        Err(e) => {
            tracing::warn!("Stored password hash could not be parsed: {}", e);
            false
        }
    }
}

use anyhow::Result;
use argon2::Argon2;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use std::sync::LazyLock;

// Verified against when the email is unknown so both rejections cost the same.
static DUMMY_HASH: LazyLock<String> =
    LazyLock::new(|| hash_password("zapdesk-unknown-account").unwrap_or_default());

/// Hash a password into an Argon2id PHC string.
pub fn hash_password(password: &str) -> Result<String> {
    // v4 UUIDs carry 122 bits from the OS RNG; plenty for a 16-byte salt
    let salt = SaltString::encode_b64(uuid::Uuid::new_v4().as_bytes())
        .map_err(|e| anyhow::anyhow!("failed to encode password salt: {e}"))?;
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("password hashing failed: {e}"))?;
    Ok(hash.to_string())
}

/// Check a password against a stored PHC string. Malformed hashes never
/// verify.
pub fn verify_password(password: &str, phc: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(phc) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Pay for a full verification against a throwaway hash.
pub(super) fn verify_against_dummy(password: &str) {
    std::hint::black_box(verify_password(password, &DUMMY_HASH));
}

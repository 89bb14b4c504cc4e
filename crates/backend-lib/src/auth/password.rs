// ============================
// crates/backend-lib/src/auth/password.rs
// ============================
//! Room password hashing and verification.
use anyhow::anyhow;
use scrypt::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Params, Scrypt,
};
use zeroize::Zeroize;

/// Hash a password using scrypt with the given cost (log2 N)
pub fn hash_password(plain: &str, log_n: u8) -> anyhow::Result<String> {
    let params = Params::new(log_n, 8, 1, Params::RECOMMENDED_LEN)
        .map_err(|e| anyhow!("invalid scrypt parameters: {e}"))?;
    let salt = SaltString::generate(&mut OsRng);
    let hash = Scrypt
        .hash_password_customized(plain.as_bytes(), None, None, params, &salt)?
        .to_string();
    Ok(hash)
}

/// Verify a password against a hash. The cost is read back from the hash.
pub fn verify_password(hash: &str, plain: &str) -> bool {
    let parsed_hash = match PasswordHash::new(hash) {
        Ok(h) => h,
        Err(_) => return false,
    };
    Scrypt.verify_password(plain.as_bytes(), &parsed_hash).is_ok()
}

/// Hash a password and zeroize the original
pub fn hash_password_secure(plain: &mut String, log_n: u8) -> anyhow::Result<String> {
    let hash = hash_password(plain, log_n);
    plain.zeroize();
    hash
}

/// [`hash_password_secure`] on the blocking pool
pub async fn hash_password_blocking(mut plain: String, log_n: u8) -> anyhow::Result<String> {
    tokio::task::spawn_blocking(move || hash_password_secure(&mut plain, log_n)).await?
}

/// [`verify_password`] on the blocking pool; the plaintext is wiped afterwards
pub async fn verify_password_blocking(hash: String, mut plain: String) -> bool {
    tokio::task::spawn_blocking(move || {
        let ok = verify_password(&hash, &plain);
        plain.zeroize();
        ok
    })
    .await
    .unwrap_or(false)
}

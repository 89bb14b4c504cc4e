// ============================
// crates/backend-lib/src/auth/mod.rs
// ============================
//! Room password handling.

pub mod password;
pub mod rate_limit;

pub use password::{
    hash_password, hash_password_blocking, hash_password_secure, verify_password,
    verify_password_blocking,
};
pub use rate_limit::JoinThrottle;

// ============================
// crates/backend-lib/src/auth/rate_limit.rs
// ============================
//! Throttling of wrong room passwords per client address.

use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// How long failure counts are remembered without a lockout
const FAILURE_MEMORY: Duration = Duration::from_secs(24 * 60 * 60);

/// Entry in the throttle map
#[derive(Debug, Clone)]
struct FailureEntry {
    /// Number of failed attempts
    failed_attempts: u32,
    /// Time of the last failed attempt
    last_failure: Instant,
    /// When the lockout expires, if locked out
    lockout_expiry: Option<Instant>,
}

/// Rate limiter for password-protected joins
#[derive(Debug, Clone)]
pub struct JoinThrottle {
    /// Map of IP addresses to failure entries
    attempts: Arc<DashMap<IpAddr, FailureEntry>>,
    /// Maximum number of failed attempts before lockout
    max_attempts: u32,
    /// Duration of lockout period
    lockout_duration: Duration,
}

impl JoinThrottle {
    /// Create a new join throttle
    pub fn new(max_attempts: u32, lockout_duration: Duration) -> Self {
        Self {
            attempts: Arc::new(DashMap::new()),
            max_attempts,
            lockout_duration,
        }
    }

    /// Record a wrong password
    pub fn record_failure(&self, ip: IpAddr) {
        let now = Instant::now();

        let mut entry = self.attempts.entry(ip).or_insert_with(|| FailureEntry {
            failed_attempts: 0,
            last_failure: now,
            lockout_expiry: None,
        });

        // Reset if a previous lockout has expired
        if entry.lockout_expiry.is_some_and(|expiry| now >= expiry) {
            entry.failed_attempts = 0;
            entry.lockout_expiry = None;
        }

        entry.failed_attempts += 1;
        entry.last_failure = now;

        if entry.failed_attempts >= self.max_attempts && entry.lockout_expiry.is_none() {
            entry.lockout_expiry = Some(now + self.lockout_duration);
            warn!(%ip, "client locked out after repeated wrong room passwords");
        }
    }

    /// Record a successful password check
    pub fn record_success(&self, ip: IpAddr) {
        self.attempts.remove(&ip);
    }

    /// Check if an IP may attempt a password-protected join
    pub fn is_allowed(&self, ip: IpAddr) -> bool {
        match self.attempts.get(&ip) {
            Some(entry) => entry
                .lockout_expiry
                .is_none_or(|expiry| Instant::now() >= expiry),
            None => true,
        }
    }

    /// Clean up expired lockouts and stale counters
    pub fn cleanup(&self) {
        let now = Instant::now();

        self.attempts.retain(|_, entry| match entry.lockout_expiry {
            Some(expiry) => now < expiry,
            None => now.duration_since(entry.last_failure) < FAILURE_MEMORY,
        });
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const IP: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7));

    #[test]
    fn test_lockout_after_max_failures() {
        let throttle = JoinThrottle::new(3, Duration::from_secs(60));
        throttle.record_failure(IP);
        throttle.record_failure(IP);
        assert!(throttle.is_allowed(IP));
        throttle.record_failure(IP);
        assert!(!throttle.is_allowed(IP));

        // other clients are unaffected
        assert!(throttle.is_allowed(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    }

    #[test]
    fn test_success_clears_failures() {
        let throttle = JoinThrottle::new(2, Duration::from_secs(60));
        throttle.record_failure(IP);
        throttle.record_success(IP);
        throttle.record_failure(IP);
        assert!(throttle.is_allowed(IP));
    }

    #[test]
    fn test_expired_lockout_is_lifted_and_swept() {
        let throttle = JoinThrottle::new(1, Duration::ZERO);
        throttle.record_failure(IP);
        assert!(throttle.is_allowed(IP));
        throttle.cleanup();
        assert!(throttle.is_empty());
    }
}

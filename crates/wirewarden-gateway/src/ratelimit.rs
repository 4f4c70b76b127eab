//! C11 Login Rate Limiter (spec §4.11).

use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ipnetwork::Ipv4Network;

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_WINDOW: Duration = Duration::from_secs(15 * 60);
const DEFAULT_LOCKOUT: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone)]
struct Attempt {
    count: u32,
    first_try: DateTime<Utc>,
    locked_at: Option<DateTime<Utc>>,
}

/// Outcome of a login attempt check (spec §4.11).
pub enum Verdict {
    Allowed,
    Locked { retry_after_secs: u64 },
}

/// Per-IP sliding-window counter with lockout and a background reaper.
pub struct RateLimiter {
    attempts: DashMap<IpAddr, Attempt>,
    max_attempts: u32,
    window: Duration,
    lockout: Duration,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            attempts: DashMap::new(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            window: DEFAULT_WINDOW,
            lockout: DEFAULT_LOCKOUT,
        }
    }

    /// Record a failed attempt, returning whether the caller should be
    /// rejected (spec §4.11, testable property 8).
    pub fn check_and_record_failure(&self, ip: IpAddr) -> Verdict {
        let now = Utc::now();
        let mut entry = self.attempts.entry(ip).or_insert_with(|| Attempt {
            count: 0,
            first_try: now,
            locked_at: None,
        });

        if let Some(locked_at) = entry.locked_at {
            let elapsed = (now - locked_at).to_std().unwrap_or_default();
            if elapsed < self.lockout {
                let retry_after = self.lockout.saturating_sub(elapsed).as_secs();
                return Verdict::Locked { retry_after_secs: retry_after };
            }
            // Lockout elapsed; treat as a fresh window.
            entry.count = 0;
            entry.first_try = now;
            entry.locked_at = None;
        }

        let window_elapsed = (now - entry.first_try).to_std().unwrap_or_default();
        if window_elapsed > self.window {
            entry.count = 0;
            entry.first_try = now;
        }

        entry.count += 1;
        if entry.count >= self.max_attempts {
            entry.locked_at = Some(now);
            return Verdict::Locked { retry_after_secs: self.lockout.as_secs() };
        }

        Verdict::Allowed
    }

    /// Check without recording, for pre-flight UI hints. Does not mutate state.
    pub fn is_locked(&self, ip: IpAddr) -> bool {
        self.remaining_lockout_secs(ip).is_some()
    }

    /// Seconds left in the current lockout, or `None` if not locked.
    pub fn remaining_lockout_secs(&self, ip: IpAddr) -> Option<u64> {
        let locked_at = self.attempts.get(&ip)?.locked_at?;
        let elapsed = (Utc::now() - locked_at).to_std().unwrap_or_default();
        (elapsed < self.lockout).then(|| self.lockout.saturating_sub(elapsed).as_secs())
    }

    pub fn clear(&self, ip: IpAddr) {
        self.attempts.remove(&ip);
    }

    /// Remove entries whose window or lockout has elapsed, bounding memory
    /// (spec §4.11 "background reaper runs every minute").
    pub fn reap(&self) {
        let now = Utc::now();
        self.attempts.retain(|_, entry| {
            if let Some(locked_at) = entry.locked_at {
                (now - locked_at).to_std().unwrap_or_default() < self.lockout
            } else {
                (now - entry.first_try).to_std().unwrap_or_default() < self.window
            }
        });
    }

    pub fn spawn_reaper(self: std::sync::Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                self.reap();
            }
        });
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// The effective client IP is the remote socket IP unless it falls inside a
/// configured trusted-proxy CIDR, in which case `X-Forwarded-For[0]` or
/// `X-Real-IP` is used. An empty trusted-proxy list trusts all remotes
/// (spec §4.11, resolved open question in spec §9 — surfaced as a startup
/// warning in [`crate::config::Config::from_env`]).
pub fn resolve_client_ip(
    remote: IpAddr,
    forwarded_for: Option<&str>,
    real_ip: Option<&str>,
    trusted_proxies: &[Ipv4Network],
) -> IpAddr {
    let trusted = trusted_proxies.is_empty()
        || match remote {
            IpAddr::V4(v4) => trusted_proxies.iter().any(|net| net.contains(v4)),
            IpAddr::V6(_) => false,
        };

    if !trusted {
        return remote;
    }

    if let Some(header) = forwarded_for {
        if let Some(first) = header.split(',').next().map(str::trim) {
            if let Ok(ip) = first.parse() {
                return ip;
            }
        }
    }

    if let Some(ip) = real_ip.and_then(|s| s.trim().parse().ok()) {
        return ip;
    }

    remote
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locks_after_max_attempts_and_unlocks_after_window() {
        let limiter = RateLimiter { max_attempts: 3, window: Duration::from_secs(60), lockout: Duration::from_millis(0), ..RateLimiter::new() };
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        assert!(matches!(limiter.check_and_record_failure(ip), Verdict::Allowed));
        assert!(matches!(limiter.check_and_record_failure(ip), Verdict::Allowed));
        assert!(matches!(limiter.check_and_record_failure(ip), Verdict::Locked { .. }));

        // lockout is instantaneous in this test, so the next attempt resets
        // the window instead of staying locked.
        assert!(matches!(limiter.check_and_record_failure(ip), Verdict::Allowed));
    }

    #[test]
    fn clear_removes_lockout() {
        let limiter = RateLimiter { max_attempts: 1, ..RateLimiter::new() };
        let ip: IpAddr = "10.0.0.2".parse().unwrap();
        let _ = limiter.check_and_record_failure(ip);
        assert!(limiter.is_locked(ip));
        limiter.clear(ip);
        assert!(!limiter.is_locked(ip));
    }

    #[test]
    fn empty_trust_list_uses_forwarded_header() {
        let remote: IpAddr = "203.0.113.5".parse().unwrap();
        let resolved = resolve_client_ip(remote, Some("198.51.100.7, 10.0.0.1"), None, &[]);
        assert_eq!(resolved, "198.51.100.7".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn untrusted_remote_ignores_forwarded_header() {
        let remote: IpAddr = "203.0.113.5".parse().unwrap();
        let trusted: Vec<Ipv4Network> = vec!["10.0.0.0/8".parse().unwrap()];
        let resolved = resolve_client_ip(remote, Some("198.51.100.7"), None, &trusted);
        assert_eq!(resolved, remote);
    }
}

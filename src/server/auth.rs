//! Credential check and per-address lockout.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginVerdict {
    Accepted,
    Rejected,
    /// Too many recent failures from this address
    LockedOut,
}

#[derive(Debug, Clone, Copy)]
struct Failures {
    count: u32,
    first: Instant,
}

/// Counts failed logins per peer address. After `max_failures` failures
/// inside `lockout`, the address is refused until the period runs out.
/// `max_failures == 0` disables the lockout.
#[derive(Debug)]
pub struct LoginGuard {
    users: HashMap<String, String>,
    max_failures: u32,
    lockout: Duration,
    failures: Mutex<HashMap<IpAddr, Failures>>,
}

impl LoginGuard {
    pub fn new(users: HashMap<String, String>, max_failures: u32, lockout: Duration) -> Self {
        Self {
            users,
            max_failures,
            lockout,
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn login(&self, ip: IpAddr, user: &str, password: &str) -> LoginVerdict {
        self.login_at(ip, user, password, Instant::now())
    }

    fn login_at(&self, ip: IpAddr, user: &str, password: &str, now: Instant) -> LoginVerdict {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(f) = failures.get(&ip) {
            if now.duration_since(f.first) >= self.lockout {
                failures.remove(&ip);
            } else if self.max_failures > 0 && f.count >= self.max_failures {
                return LoginVerdict::LockedOut;
            }
        }

        // An empty user table accepts anyone.
        let valid =
            self.users.is_empty() || self.users.get(user).is_some_and(|p| p == password);
        if valid {
            failures.remove(&ip);
            return LoginVerdict::Accepted;
        }

        let entry = failures.entry(ip).or_insert(Failures {
            count: 0,
            first: now,
        });
        entry.count += 1;
        warn!(%ip, user, failures = entry.count, "Failed login");
        LoginVerdict::Rejected
    }
}

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateScope {
    Global,
    User,
    Resource,
}

impl fmt::Display for RateScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateScope::Global => write!(f, "global"),
            RateScope::User => write!(f, "user"),
            RateScope::Resource => write!(f, "resource"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateKey {
    pub scope: RateScope,
    pub subject: String,
}

impl RateKey {
    pub fn global() -> Self {
        Self {
            scope: RateScope::Global,
            subject: "*".to_string(),
        }
    }

    pub fn user(subject: impl Into<String>) -> Self {
        Self {
            scope: RateScope::User,
            subject: subject.into(),
        }
    }

    pub fn resource(subject: impl Into<String>) -> Self {
        Self {
            scope: RateScope::Resource,
            subject: subject.into(),
        }
    }
}

struct Window {
    start: DateTime<Utc>,
    count: u32,
}

/// Fixed-window counters with atomic check-and-increment across all keys of
/// one evaluation: either every counter advances or none does. Counts are
/// monotonic within a window and reset at the boundary.
pub struct RateLimiter {
    window: Duration,
    counters: Mutex<HashMap<RateKey, Window>>,
}

impl RateLimiter {
    pub fn new(window: std::time::Duration) -> Self {
        Self {
            window: Duration::from_std(window).unwrap_or_else(|_| Duration::hours(1)),
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn hourly() -> Self {
        Self::new(std::time::Duration::from_secs(3600))
    }

    /// Check every `(key, limit)` pair and, only if all pass, commit one
    /// increment to each. Returns the first exceeded key otherwise.
    pub fn check_and_increment(&self, checks: &[(RateKey, u32)]) -> Result<(), RateKey> {
        self.check_at(Utc::now(), checks)
    }

    pub fn check_at(
        &self,
        now: DateTime<Utc>,
        checks: &[(RateKey, u32)],
    ) -> Result<(), RateKey> {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());

        for (key, limit) in checks {
            let window = counters.entry(key.clone()).or_insert(Window {
                start: now,
                count: 0,
            });
            if now - window.start >= self.window {
                window.start = now;
                window.count = 0;
            }
            if window.count >= *limit {
                return Err(key.clone());
            }
        }
        for (key, _) in checks {
            if let Some(window) = counters.get_mut(key) {
                window.count += 1;
            }
        }
        Ok(())
    }

    pub fn count(&self, key: &RateKey) -> u32 {
        self.counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map(|w| w.count)
            .unwrap_or(0)
    }

    /// Drop windows that ended more than one full window ago.
    pub fn prune(&self, now: DateTime<Utc>) {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let horizon = self.window * 2;
        counters.retain(|_, w| now - w.start < horizon);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_increase_until_limit() {
        let limiter = RateLimiter::hourly();
        let key = RateKey::resource("agent:A1");
        let checks = [(key.clone(), 2)];
        let now = Utc::now();

        assert!(limiter.check_at(now, &checks).is_ok());
        assert!(limiter.check_at(now, &checks).is_ok());
        let exceeded = limiter.check_at(now, &checks).unwrap_err();
        assert_eq!(exceeded, key);
        assert_eq!(limiter.count(&key), 2);
    }

    #[test]
    fn window_boundary_resets_counter() {
        let limiter = RateLimiter::hourly();
        let key = RateKey::user("u1");
        let checks = [(key.clone(), 1)];
        let now = Utc::now();

        assert!(limiter.check_at(now, &checks).is_ok());
        assert!(limiter.check_at(now, &checks).is_err());
        let later = now + Duration::hours(1);
        assert!(limiter.check_at(later, &checks).is_ok());
        assert_eq!(limiter.count(&key), 1);
    }

    #[test]
    fn failed_check_commits_nothing() {
        let limiter = RateLimiter::hourly();
        let a = RateKey::global();
        let b = RateKey::user("u1");
        let now = Utc::now();

        // Exhaust b.
        assert!(limiter.check_at(now, &[(b.clone(), 1)]).is_ok());
        // a passes but b is full: nothing may advance.
        let err = limiter
            .check_at(now, &[(a.clone(), 10), (b.clone(), 1)])
            .unwrap_err();
        assert_eq!(err, b);
        assert_eq!(limiter.count(&a), 0);
        assert_eq!(limiter.count(&b), 1);
    }

    #[test]
    fn prune_discards_stale_windows() {
        let limiter = RateLimiter::hourly();
        let key = RateKey::user("u1");
        let now = Utc::now();
        assert!(limiter.check_at(now, &[(key.clone(), 5)]).is_ok());
        limiter.prune(now + Duration::hours(3));
        assert_eq!(limiter.count(&key), 0);
    }
}

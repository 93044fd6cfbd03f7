//! Fixed-window request budgets per client key.
//!
//! Keys are `ip:<addr>` until a connection authenticates and `user:<id>`
//! afterwards. Each key has a minute and an hour window; a request is
//! granted only when every configured window has room, and a denied
//! request consumes nothing.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use clinic_settings::RateLimitSettings;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);

#[derive(Clone, Copy, Debug)]
struct Window {
    count: u32,
    reset_at: Instant,
}

impl Window {
    fn new(now: Instant, size: Duration) -> Self {
        Self {
            count: 0,
            reset_at: now + size,
        }
    }

    fn roll(&mut self, now: Instant, size: Duration) {
        if now > self.reset_at {
            self.count = 0;
            self.reset_at = now + size;
        }
    }
}

#[derive(Debug)]
struct Bucket {
    minute: Window,
    hour: Window,
    last_seen: Instant,
}

impl Bucket {
    fn new(now: Instant) -> Self {
        Self {
            minute: Window::new(now, MINUTE),
            hour: Window::new(now, HOUR),
            last_seen: now,
        }
    }
}

/// Which window rejected a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    /// Per-minute budget.
    Minute,
    /// Per-hour budget.
    Hour,
}

impl WindowKind {
    /// Label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
        }
    }
}

/// A denied request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimited {
    /// Window that is exhausted (the one that resets last).
    pub window: WindowKind,
    /// Time until the request would be granted again.
    pub retry_after: Duration,
}

/// Quota of one window, for client-visible reporting.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowInfo {
    /// Budget of the window.
    pub limit: u32,
    /// Requests granted in the current window.
    pub current_usage: u32,
    /// Requests still available.
    pub remaining: u32,
    /// Milliseconds until the window resets.
    pub reset_in_ms: u64,
    /// Wall-clock reset time.
    pub resets_at: DateTime<Utc>,
}

/// Quota of a key across both windows. A disabled window is `None`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitInfo {
    /// Per-minute quota.
    pub minute: Option<WindowInfo>,
    /// Per-hour quota.
    pub hour: Option<WindowInfo>,
}

/// Fixed-window limiter over a concurrent map of buckets.
pub struct RateLimiter {
    buckets: DashMap<String, Bucket>,
    per_minute: u32,
    per_hour: u32,
    idle_ttl: Duration,
}

impl RateLimiter {
    /// Create a limiter. A zero limit disables that window.
    pub fn new(per_minute: u32, per_hour: u32, idle_ttl: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            per_minute,
            per_hour,
            idle_ttl,
        }
    }

    /// Create a limiter from settings.
    pub fn from_settings(settings: &RateLimitSettings) -> Self {
        Self::new(
            settings.requests_per_minute,
            settings.requests_per_hour,
            Duration::from_secs(settings.idle_bucket_ttl_secs),
        )
    }

    /// Grant or deny one request for `key`.
    pub fn check(&self, key: &str) -> Result<(), RateLimited> {
        let now = Instant::now();
        // entry() holds the shard lock for the whole read-modify-write
        let mut bucket = self
            .buckets
            .entry(key.to_owned())
            .or_insert_with(|| Bucket::new(now));
        bucket.last_seen = now;
        bucket.minute.roll(now, MINUTE);
        bucket.hour.roll(now, HOUR);

        let mut denied: Option<RateLimited> = None;
        for (kind, window, limit) in [
            (WindowKind::Minute, bucket.minute, self.per_minute),
            (WindowKind::Hour, bucket.hour, self.per_hour),
        ] {
            if limit > 0 && window.count >= limit {
                let retry_after = window.reset_at.saturating_duration_since(now);
                if denied.is_none_or(|d| retry_after > d.retry_after) {
                    denied = Some(RateLimited {
                        window: kind,
                        retry_after,
                    });
                }
            }
        }
        if let Some(denied) = denied {
            debug!(key, window = ?denied.window, retry_after_ms = denied.retry_after.as_millis(), "rate limited");
            return Err(denied);
        }

        if self.per_minute > 0 {
            bucket.minute.count += 1;
        }
        if self.per_hour > 0 {
            bucket.hour.count += 1;
        }
        Ok(())
    }

    /// Whether one more request for `key` is granted (and count it if so).
    pub fn allow(&self, key: &str) -> bool {
        self.check(key).is_ok()
    }

    /// Current quota of `key` without consuming anything.
    pub fn info(&self, key: &str) -> RateLimitInfo {
        let now = Instant::now();
        let wall = Utc::now();
        let (minute, hour) = match self.buckets.get(key) {
            Some(b) => {
                let mut minute = b.minute;
                let mut hour = b.hour;
                minute.roll(now, MINUTE);
                hour.roll(now, HOUR);
                (minute, hour)
            }
            None => (Window::new(now, MINUTE), Window::new(now, HOUR)),
        };
        let describe = |window: Window, limit: u32| {
            (limit > 0).then(|| {
                let reset_in = window.reset_at.saturating_duration_since(now);
                WindowInfo {
                    limit,
                    current_usage: window.count,
                    remaining: limit.saturating_sub(window.count),
                    reset_in_ms: u64::try_from(reset_in.as_millis()).unwrap_or(u64::MAX),
                    resets_at: wall
                        + chrono::Duration::from_std(reset_in).unwrap_or_else(|_| chrono::Duration::zero()),
                }
            })
        };
        RateLimitInfo {
            minute: describe(minute, self.per_minute),
            hour: describe(hour, self.per_hour),
        }
    }

    /// Drop buckets idle for longer than the idle TTL. Returns how many.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let idle: Vec<String> = self
            .buckets
            .iter()
            .filter(|e| now.saturating_duration_since(e.last_seen) > self.idle_ttl)
            .map(|e| e.key().clone())
            .collect();
        let mut removed = 0;
        for key in idle {
            // re-check: the key may have been used since the snapshot
            if self
                .buckets
                .remove_if(&key, |_, b| now.saturating_duration_since(b.last_seen) > self.idle_ttl)
                .is_some()
            {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, remaining = self.buckets.len(), "swept idle rate-limit buckets");
        }
        removed
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether no key is tracked.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(per_minute: u32, per_hour: u32) -> RateLimiter {
        RateLimiter::new(per_minute, per_hour, HOUR)
    }

    #[tokio::test(start_paused = true)]
    async fn fourth_request_in_window_is_rejected() {
        let rl = limiter(3, 0);
        assert!(rl.allow("ip:1.2.3.4"));
        assert!(rl.allow("ip:1.2.3.4"));
        assert!(rl.allow("ip:1.2.3.4"));
        let denied = rl.check("ip:1.2.3.4").unwrap_err();
        assert_eq!(denied.window, WindowKind::Minute);
        assert!(denied.retry_after <= MINUTE);
    }

    #[tokio::test(start_paused = true)]
    async fn window_reset_grants_again() {
        let rl = limiter(3, 0);
        for _ in 0..3 {
            assert!(rl.allow("k"));
        }
        assert!(!rl.allow("k"));
        tokio::time::advance(MINUTE + Duration::from_millis(1)).await;
        assert!(rl.allow("k"));
        assert_eq!(rl.info("k").minute.unwrap().current_usage, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let rl = limiter(1, 0);
        assert!(rl.allow("a"));
        assert!(!rl.allow("a"));
        assert!(rl.allow("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn hour_window_outlives_minute_window() {
        let rl = limiter(2, 3);
        assert!(rl.allow("k"));
        assert!(rl.allow("k"));
        assert!(!rl.allow("k"));
        tokio::time::advance(MINUTE + Duration::from_secs(1)).await;
        assert!(rl.allow("k"));
        let denied = rl.check("k").unwrap_err();
        assert_eq!(denied.window, WindowKind::Hour);
        assert!(denied.retry_after > MINUTE);
    }

    #[tokio::test(start_paused = true)]
    async fn denied_requests_consume_nothing() {
        let rl = limiter(1, 10);
        assert!(rl.allow("k"));
        for _ in 0..5 {
            assert!(!rl.allow("k"));
        }
        let info = rl.info("k");
        assert_eq!(info.minute.unwrap().current_usage, 1);
        assert_eq!(info.hour.unwrap().current_usage, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn info_for_unknown_key_is_full_quota() {
        let rl = limiter(5, 0);
        let info = rl.info("nobody");
        let minute = info.minute.unwrap();
        assert_eq!(minute.current_usage, 0);
        assert_eq!(minute.remaining, 5);
        assert!(info.hour.is_none());
        assert!(rl.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_only_idle_buckets() {
        let rl = limiter(10, 0);
        assert!(rl.allow("old"));
        tokio::time::advance(HOUR + Duration::from_secs(1)).await;
        assert!(rl.allow("fresh"));
        assert_eq!(rl.sweep(), 1);
        assert_eq!(rl.len(), 1);
        assert_eq!(rl.info("fresh").minute.unwrap().current_usage, 1);
    }

    #[tokio::test]
    async fn concurrent_checks_never_exceed_limit() {
        let rl = std::sync::Arc::new(limiter(50, 0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let rl = rl.clone();
            handles.push(tokio::spawn(async move {
                (0..20).filter(|_| rl.allow("shared")).count()
            }));
        }
        let mut granted = 0;
        for h in handles {
            granted += h.await.unwrap();
        }
        assert_eq!(granted, 50);
    }
}

//! Token-Bucket Rate Limiting
//!
//! One bucket per tenant. Buckets refill lazily on each access, so there is
//! no background refill task; a bucket is only locked by callers for the
//! same tenant.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::types::{Cost, RateLimit, TenantId};

/// Token bucket state for a single tenant
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    rate_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket
    pub fn new(rate_per_sec: f64, burst: f64, now: Instant) -> Self {
        Self {
            tokens: burst,
            capacity: burst,
            rate_per_sec,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        // saturating: a stale `now` never drains tokens
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Refill, then take `cost` tokens if the balance stays non-negative.
    /// On failure the balance is left as refilled.
    pub fn try_consume(&mut self, cost: Cost, now: Instant) -> bool {
        self.refill(now);
        if self.tokens - cost < 0.0 {
            return false;
        }
        self.tokens -= cost;
        true
    }

    /// Give back tokens for work that never ran
    pub fn refund(&mut self, cost: Cost, now: Instant) {
        self.refill(now);
        self.tokens = (self.tokens + cost).min(self.capacity);
    }

    /// Apply new parameters, settling the elapsed interval at the old rate first
    pub fn reconfigure(&mut self, rate_per_sec: f64, burst: f64, now: Instant) {
        self.refill(now);
        self.rate_per_sec = rate_per_sec;
        self.capacity = burst;
        self.tokens = self.tokens.min(burst);
    }

    pub fn available(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// How long until `cost` tokens are available, if ever
    pub fn time_until(&self, cost: Cost) -> Option<Duration> {
        if cost > self.capacity {
            return None;
        }
        let missing = cost - self.tokens;
        if missing <= 0.0 {
            return Some(Duration::ZERO);
        }
        Some(Duration::from_secs_f64(missing / self.rate_per_sec))
    }

    fn matches(&self, rate_per_sec: f64, burst: f64) -> bool {
        self.rate_per_sec == rate_per_sec && self.capacity == burst
    }
}

/// Per-tenant token-bucket limiter
#[derive(Debug, Default)]
pub struct RateLimiter {
    buckets: DashMap<TenantId, Arc<Mutex<TokenBucket>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    /// Try to take `cost` tokens from the tenant's bucket under `limit`
    pub fn try_consume(&self, tenant_id: &str, limit: &RateLimit, cost: Cost) -> bool {
        self.try_consume_at(tenant_id, limit, cost, Instant::now())
    }

    pub fn try_consume_at(
        &self,
        tenant_id: &str,
        limit: &RateLimit,
        cost: Cost,
        now: Instant,
    ) -> bool {
        let Some(bucket) = self.bucket_for(tenant_id, limit, now) else {
            return true;
        };
        let allowed = bucket.lock().try_consume(cost, now);
        if !allowed {
            debug!(tenant_id = %tenant_id, cost, "Token bucket exhausted");
        }
        allowed
    }

    /// Take tokens for a request admitted under an earlier policy. An existing
    /// bucket is charged as currently configured; `limit` only seeds a bucket
    /// that does not exist yet.
    pub fn charge(&self, tenant_id: &str, limit: &RateLimit, cost: Cost) -> bool {
        let now = Instant::now();
        let existing = self.buckets.get(tenant_id).map(|bucket| bucket.value().clone());
        match existing {
            Some(bucket) => bucket.lock().try_consume(cost, now),
            None => self.try_consume_at(tenant_id, limit, cost, now),
        }
    }

    pub fn refund(&self, tenant_id: &str, limit: &RateLimit, cost: Cost) {
        let now = Instant::now();
        if let Some(bucket) = self.bucket_for(tenant_id, limit, now) {
            bucket.lock().refund(cost, now);
        }
    }

    /// Tokens currently banked for a tenant; `None` when unlimited
    pub fn available(&self, tenant_id: &str, limit: &RateLimit) -> Option<f64> {
        let now = Instant::now();
        self.bucket_for(tenant_id, limit, now)
            .map(|bucket| bucket.lock().available(now))
    }

    /// Wait until `cost` tokens would be available, `None` if unlimited or never
    pub fn time_until(&self, tenant_id: &str, limit: &RateLimit, cost: Cost) -> Option<Duration> {
        let now = Instant::now();
        self.bucket_for(tenant_id, limit, now).and_then(|bucket| {
            let mut bucket = bucket.lock();
            bucket.refill(now);
            bucket.time_until(cost)
        })
    }

    pub fn tenant_count(&self) -> usize {
        self.buckets.len()
    }

    /// Fetch the tenant's bucket, creating or reconfiguring it to match `limit`
    fn bucket_for(
        &self,
        tenant_id: &str,
        limit: &RateLimit,
        now: Instant,
    ) -> Option<Arc<Mutex<TokenBucket>>> {
        let (rate_per_sec, burst) = match *limit {
            RateLimit::TokenBucket {
                rate_per_sec,
                burst,
            } if !limit.is_unlimited() => (rate_per_sec, burst),
            _ => return None,
        };

        let bucket = match self.buckets.get(tenant_id) {
            Some(existing) => existing.value().clone(),
            None => self
                .buckets
                .entry(tenant_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(TokenBucket::new(rate_per_sec, burst, now))))
                .value()
                .clone(),
        };

        {
            let mut guard = bucket.lock();
            if !guard.matches(rate_per_sec, burst) {
                guard.reconfigure(rate_per_sec, burst, now);
            }
        }
        Some(bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_starts_full_and_drains() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(1.0, 2.0, now);

        assert!(bucket.try_consume(1.0, now));
        assert!(bucket.try_consume(1.0, now));
        assert!(!bucket.try_consume(1.0, now));
        assert_eq!(bucket.available(now), 0.0);
    }

    #[test]
    fn test_bucket_refills_and_caps_at_burst() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(2.0, 4.0, now);
        assert!(bucket.try_consume(4.0, now));

        assert_eq!(bucket.available(now + Duration::from_millis(500)), 1.0);
        // Long idle period never overfills
        assert_eq!(bucket.available(now + Duration::from_secs(60)), 4.0);
    }

    #[test]
    fn test_failed_consume_leaves_balance() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(1.0, 3.0, now);
        assert!(bucket.try_consume(2.0, now));
        assert!(!bucket.try_consume(2.0, now));
        assert_eq!(bucket.available(now), 1.0);
    }

    #[test]
    fn test_refill_ignores_time_going_backwards() {
        let start = Instant::now();
        let later = start + Duration::from_secs(1);
        let mut bucket = TokenBucket::new(1.0, 5.0, later);
        assert!(bucket.try_consume(5.0, later));

        assert!(!bucket.try_consume(1.0, start));
        assert_eq!(bucket.available(start), 0.0);
    }

    #[test]
    fn test_reconfigure_clamps_to_new_burst() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(1.0, 10.0, now);
        bucket.reconfigure(1.0, 3.0, now);
        assert_eq!(bucket.available(now), 3.0);
        assert_eq!(bucket.capacity(), 3.0);
    }

    #[test]
    fn test_refund_never_exceeds_capacity() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(1.0, 2.0, now);
        assert!(bucket.try_consume(1.0, now));
        bucket.refund(5.0, now);
        assert_eq!(bucket.available(now), 2.0);
    }

    #[test]
    fn test_time_until() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(2.0, 2.0, now);
        assert_eq!(bucket.time_until(1.0), Some(Duration::ZERO));
        assert!(bucket.try_consume(2.0, now));
        assert_eq!(bucket.time_until(1.0), Some(Duration::from_millis(500)));
        assert_eq!(bucket.time_until(3.0), None);
    }

    #[test]
    fn test_limiter_unlimited_bypasses_bucket() {
        let limiter = RateLimiter::new();
        for _ in 0..1_000 {
            assert!(limiter.try_consume("tenant-1", &RateLimit::Unlimited, 1.0));
        }
        assert!(limiter.try_consume(
            "tenant-1",
            &RateLimit::per_second(f64::INFINITY, 1.0),
            1.0
        ));
        assert_eq!(limiter.tenant_count(), 0);
        assert_eq!(limiter.available("tenant-1", &RateLimit::Unlimited), None);
    }

    #[test]
    fn test_limiter_isolates_tenants() {
        let limiter = RateLimiter::new();
        let limit = RateLimit::per_second(1.0, 1.0);
        let now = Instant::now();

        assert!(limiter.try_consume_at("a", &limit, 1.0, now));
        assert!(!limiter.try_consume_at("a", &limit, 1.0, now));
        assert!(limiter.try_consume_at("b", &limit, 1.0, now));
        assert_eq!(limiter.tenant_count(), 2);
    }

    #[test]
    fn test_limiter_picks_up_policy_change() {
        let limiter = RateLimiter::new();
        let now = Instant::now();
        let tight = RateLimit::per_second(1.0, 1.0);
        let loose = RateLimit::per_second(1.0, 1.0e9);

        assert!(limiter.try_consume_at("a", &tight, 1.0, now));
        assert!(!limiter.try_consume_at("a", &tight, 1.0, now));

        // A larger burst does not mint tokens, it only raises the cap
        assert!(!limiter.try_consume_at("a", &loose, 1.0, now));
        assert!(limiter.try_consume_at("a", &loose, 1.0, now + Duration::from_secs(5)));
    }

    #[test]
    fn test_concurrent_consumers_never_overdraw() {
        let limiter = Arc::new(RateLimiter::new());
        // Negligible refill so the burst is the only supply
        let limit = RateLimit::per_second(1.0e-9, 100.0);
        let now = Instant::now();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    (0..50)
                        .filter(|_| limiter.try_consume_at("shared", &limit, 1.0, now))
                        .count()
                })
            })
            .collect();

        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_charge_keeps_current_configuration() {
        let limiter = RateLimiter::new();
        let old = RateLimit::per_second(1.0, 1.0);
        let current = RateLimit::per_second(10.0, 10.0);

        assert!(limiter.try_consume("t", &current, 1.0));
        assert!(limiter.charge("t", &old, 1.0));

        let bucket = limiter.buckets.get("t").unwrap().value().clone();
        assert_eq!(bucket.lock().capacity(), 10.0);
        assert_eq!(limiter.available("t", &current), Some(8.0));

        // Without a bucket the request's own limit seeds one
        assert!(limiter.charge("fresh", &old, 1.0));
        assert!(!limiter.charge("fresh", &old, 1.0));
        assert!(limiter.charge("open", &RateLimit::Unlimited, 100.0));
    }
}

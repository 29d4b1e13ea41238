//! Per-user token-bucket rate limiting with a hard spend cap.
//!
//! One bucket per identity, held in a concurrent map with per-entry
//! locks: checks for one user serialize, users never block each other.
//! Refill is computed lazily at check time from elapsed wall-clock, so no
//! background timer is needed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::config::RateConfig;
use crate::error::GatewayError;
use crate::security::audit::{AuditKind, AuditLog};

/// Mutable per-user state. Only touched through the owning map entry.
#[derive(Debug)]
struct RateBucket {
    tokens_remaining: f64,
    last_refill: Instant,
    cumulative_cost: f64,
}

pub struct RateLimiter {
    buckets: DashMap<String, RateBucket>,
    capacity: f64,
    refill_rate: f64,
    cost_limit: f64,
    audit: Arc<AuditLog>,
}

impl RateLimiter {
    pub fn new(config: &RateConfig, audit: Arc<AuditLog>) -> Self {
        Self {
            buckets: DashMap::new(),
            capacity: config.bucket_capacity,
            refill_rate: config.refill_rate,
            cost_limit: config.per_user_cost_limit,
            audit,
        }
    }

    /// Check whether `user` may spend `cost` now, consuming it if so.
    ///
    /// Refills the bucket from elapsed time, then applies two gates in
    /// order: the cumulative spend cap (denies regardless of tokens until
    /// an external reset) and token availability. Denials are audited
    /// with the computed retry hint.
    pub fn check_and_consume(&self, user: &str, cost: f64) -> Result<(), GatewayError> {
        self.check_and_consume_at(user, cost, Instant::now())
    }

    /// Clear a user's cumulative cost (external reset event, e.g. a new
    /// billing period). The token bucket itself is untouched.
    pub fn reset_cost(&self, user: &str) {
        if let Some(mut bucket) = self.buckets.get_mut(user) {
            bucket.cumulative_cost = 0.0;
            debug!("Reset cumulative cost for {}", user);
        }
    }

    /// Current token balance, for inspection. `None` if the user has not
    /// made a request yet.
    pub fn tokens_remaining(&self, user: &str) -> Option<f64> {
        self.buckets.get(user).map(|b| b.tokens_remaining)
    }

    pub fn cumulative_cost(&self, user: &str) -> Option<f64> {
        self.buckets.get(user).map(|b| b.cumulative_cost)
    }

    fn check_and_consume_at(
        &self,
        user: &str,
        cost: f64,
        now: Instant,
    ) -> Result<(), GatewayError> {
        let decision = {
            let mut bucket = self
                .buckets
                .entry(user.to_string())
                .or_insert_with(|| RateBucket {
                    tokens_remaining: self.capacity,
                    last_refill: now,
                    cumulative_cost: 0.0,
                });

            let elapsed = now
                .checked_duration_since(bucket.last_refill)
                .unwrap_or_default()
                .as_secs_f64();
            bucket.tokens_remaining =
                (bucket.tokens_remaining + elapsed * self.refill_rate).min(self.capacity);
            bucket.last_refill = now;

            if bucket.cumulative_cost >= self.cost_limit {
                Err(None)
            } else if bucket.tokens_remaining >= cost {
                bucket.tokens_remaining -= cost;
                bucket.cumulative_cost += cost;
                Ok(())
            } else {
                let retry_after =
                    Duration::from_secs_f64((cost - bucket.tokens_remaining) / self.refill_rate);
                Err(Some(retry_after))
            }
        };

        // Entry lock released before auditing, so a slow append never
        // holds up other users hashed to the same shard.
        match decision {
            Ok(()) => Ok(()),
            Err(retry_after) => {
                let detail = match retry_after {
                    Some(d) => format!("bucket exhausted, retry in {:.1}s", d.as_secs_f64()),
                    None => format!("spend cap {:.1} reached", self.cost_limit),
                };
                if let Err(e) = self.audit.append(user, AuditKind::RateLimited, detail) {
                    warn!("Failed to audit rate limit: {}", e);
                }
                Err(GatewayError::RateLimited { retry_after })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn limiter(config: RateConfig, dir: &Path) -> RateLimiter {
        let audit = Arc::new(AuditLog::open(dir.join("audit.jsonl")).unwrap());
        RateLimiter::new(&config, audit)
    }

    fn small_config() -> RateConfig {
        RateConfig {
            bucket_capacity: 5.0,
            refill_rate: 1.0,
            per_user_cost_limit: 1000.0,
        }
    }

    #[test]
    fn burst_boundary_and_refill() {
        let tmp = tempfile::tempdir().unwrap();
        let limiter = limiter(small_config(), tmp.path());
        let t0 = Instant::now();

        // capacity=5, refill=1/s, cost=1: five immediate calls pass
        for _ in 0..5 {
            limiter.check_and_consume_at("u", 1.0, t0).unwrap();
        }

        // the sixth is limited with retry_after ~ 1.0s
        match limiter.check_and_consume_at("u", 1.0, t0) {
            Err(GatewayError::RateLimited {
                retry_after: Some(d),
            }) => {
                assert!((d.as_secs_f64() - 1.0).abs() < 1e-6, "{:?}", d);
            }
            other => panic!("expected RateLimited, got {:?}", other.err()),
        }

        // one second later a single call succeeds again
        limiter
            .check_and_consume_at("u", 1.0, t0 + Duration::from_secs(1))
            .unwrap();
    }

    #[test]
    fn tokens_never_exceed_capacity_or_go_negative() {
        let tmp = tempfile::tempdir().unwrap();
        let limiter = limiter(small_config(), tmp.path());
        let t0 = Instant::now();

        // A long idle period must clamp at capacity, not accumulate
        limiter.check_and_consume_at("u", 1.0, t0).unwrap();
        let later = t0 + Duration::from_secs(3600);
        limiter.check_and_consume_at("u", 1.0, later).unwrap();
        let remaining = limiter.tokens_remaining("u").unwrap();
        assert!(remaining <= 5.0, "remaining={}", remaining);
        assert!(remaining >= 0.0);

        // Draining past zero is refused, never negative
        for _ in 0..10 {
            let _ = limiter.check_and_consume_at("u", 1.0, later);
        }
        assert!(limiter.tokens_remaining("u").unwrap() >= 0.0);
    }

    #[test]
    fn spend_cap_denies_despite_full_bucket() {
        let tmp = tempfile::tempdir().unwrap();
        let limiter = limiter(
            RateConfig {
                bucket_capacity: 100.0,
                refill_rate: 100.0,
                per_user_cost_limit: 3.0,
            },
            tmp.path(),
        );
        let t0 = Instant::now();

        for _ in 0..3 {
            limiter.check_and_consume_at("u", 1.0, t0).unwrap();
        }

        // Cap reached: denied with no retry hint, even with tokens to spare
        match limiter.check_and_consume_at("u", 1.0, t0 + Duration::from_secs(10)) {
            Err(GatewayError::RateLimited { retry_after: None }) => {}
            other => panic!("expected cap denial, got {:?}", other.err()),
        }

        // An external reset clears it
        limiter.reset_cost("u");
        limiter
            .check_and_consume_at("u", 1.0, t0 + Duration::from_secs(10))
            .unwrap();
    }

    #[test]
    fn users_do_not_share_buckets() {
        let tmp = tempfile::tempdir().unwrap();
        let limiter = limiter(small_config(), tmp.path());
        let t0 = Instant::now();

        for _ in 0..5 {
            limiter.check_and_consume_at("alice", 1.0, t0).unwrap();
        }
        assert!(limiter.check_and_consume_at("alice", 1.0, t0).is_err());

        // Bob's bucket is untouched by Alice's exhaustion
        limiter.check_and_consume_at("bob", 1.0, t0).unwrap();
        assert_eq!(limiter.cumulative_cost("bob"), Some(1.0));
    }

    #[test]
    fn denials_are_audited() {
        let tmp = tempfile::tempdir().unwrap();
        let limiter = limiter(small_config(), tmp.path());
        let t0 = Instant::now();

        for _ in 0..5 {
            limiter.check_and_consume_at("u", 1.0, t0).unwrap();
        }
        let _ = limiter.check_and_consume_at("u", 1.0, t0);

        let events = limiter.audit.read_events().unwrap();
        let limited: Vec<_> = events
            .iter()
            .filter(|e| e.kind == AuditKind::RateLimited)
            .collect();
        assert_eq!(limited.len(), 1);
        assert!(limited[0].detail.contains("retry in"));
    }

    #[test]
    fn fractional_costs_accumulate() {
        let tmp = tempfile::tempdir().unwrap();
        let limiter = limiter(small_config(), tmp.path());
        let t0 = Instant::now();

        limiter.check_and_consume_at("u", 2.5, t0).unwrap();
        limiter.check_and_consume_at("u", 2.5, t0).unwrap();
        assert!(limiter.check_and_consume_at("u", 0.5, t0).is_err());
        assert_eq!(limiter.cumulative_cost("u"), Some(5.0));
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! RateLimiter (C1): token-bucket admission control per scope.
//!
//! Buckets live in a `parking_lot::RwLock<HashMap<String, Bucket>>` keyed by
//! scope string. Refill and consumption happen under one short-held write
//! lock per call — never across an `.await` — matching the hot-path lock
//! discipline the rest of the pack uses for in-memory quota tracking.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use agentcore_config::RateLimitConfig;

/// Internal bucket state. Not part of the public data-model surface, but
/// typed identically to the spec's `Bucket`.
#[derive(Debug, Clone, Copy)]
struct Bucket {
    capacity: f64,
    refill_per_ms: f64,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(capacity: u32, refill_period: Duration) -> Self {
        let capacity = capacity as f64;
        Self {
            capacity,
            refill_per_ms: capacity / refill_period.as_millis().max(1) as f64,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed_ms = now.saturating_duration_since(self.last_refill).as_millis() as f64;
        if elapsed_ms <= 0.0 {
            return;
        }
        self.tokens = (self.tokens + elapsed_ms * self.refill_per_ms).min(self.capacity);
        self.last_refill = now;
    }

    fn set_capacity(&mut self, capacity: u32, refill_period: Duration) {
        let capacity = capacity as f64;
        self.refill_per_ms = capacity / refill_period.as_millis().max(1) as f64;
        self.capacity = capacity;
        self.tokens = self.tokens.min(self.capacity);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConsumeResult {
    pub allowed: bool,
    pub remaining: f64,
    /// Estimated wait until `n` tokens would be available, when denied.
    pub wait_hint: Option<Duration>,
}

#[derive(Debug, Clone, Copy)]
pub struct BucketState {
    pub capacity: f64,
    pub tokens: f64,
    pub last_refill: Instant,
}

/// Token-bucket rate limiter shared across turns. Three default scopes are
/// used by the rest of the pipeline: `user:global`, `channel:<type>`,
/// `llm:<providerId>` — this type itself is scope-agnostic and keyed purely
/// by the caller-supplied scope string.
pub struct RateLimiter {
    buckets: RwLock<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Non-blocking. Returns how many tokens remain and, when denied, an
    /// estimated wait until `n` tokens would be available.
    pub fn try_consume(&self, scope: &str, n: u32, capacity: u32, refill_period: Duration) -> ConsumeResult {
        let now = Instant::now();
        let mut buckets = self.buckets.write();
        let bucket = buckets
            .entry(scope.to_string())
            .or_insert_with(|| Bucket::new(capacity, refill_period));
        bucket.set_capacity(capacity, refill_period);
        bucket.refill(now);

        let n = n as f64;
        if bucket.tokens.floor() >= n {
            bucket.tokens -= n;
            ConsumeResult {
                allowed: true,
                remaining: bucket.tokens,
                wait_hint: None,
            }
        } else {
            let deficit = n - bucket.tokens;
            let wait_ms = if bucket.refill_per_ms > 0.0 {
                deficit / bucket.refill_per_ms
            } else {
                f64::INFINITY
            };
            ConsumeResult {
                allowed: false,
                remaining: bucket.tokens,
                wait_hint: Some(Duration::from_millis(wait_ms.ceil().min(u64::MAX as f64) as u64)),
            }
        }
    }

    pub fn get_state(&self, scope: &str) -> Option<BucketState> {
        let buckets = self.buckets.read();
        buckets.get(scope).map(|b| BucketState {
            capacity: b.capacity,
            tokens: b.tokens,
            last_refill: b.last_refill,
        })
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

pub fn user_scope() -> &'static str {
    "user:global"
}

pub fn channel_scope(channel_type: &str) -> String {
    format!("channel:{channel_type}")
}

pub fn llm_scope(provider_id: &str) -> String {
    format!("llm:{provider_id}")
}

/// Consume against all three default scopes using the configured capacities,
/// used by `Pipeline`'s admission step ahead of `Sanitize`.
pub fn try_consume_default_scopes(
    limiter: &RateLimiter,
    cfg: &RateLimitConfig,
    channel_type: &str,
    provider_id: &str,
) -> ConsumeResult {
    if !cfg.enabled {
        return ConsumeResult {
            allowed: true,
            remaining: f64::INFINITY,
            wait_hint: None,
        };
    }
    let user = limiter.try_consume(
        user_scope(),
        1,
        cfg.user_requests_per_minute,
        Duration::from_secs(60),
    );
    if !user.allowed {
        return user;
    }
    let channel = limiter.try_consume(
        &channel_scope(channel_type),
        1,
        cfg.channel_messages_per_second,
        Duration::from_secs(1),
    );
    if !channel.allowed {
        return channel;
    }
    limiter.try_consume(&llm_scope(provider_id), 1, cfg.llm_requests_per_minute, Duration::from_secs(60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_n_requests_within_capacity_are_allowed() {
        let rl = RateLimiter::new();
        for _ in 0..5 {
            let r = rl.try_consume("s", 1, 5, Duration::from_secs(60));
            assert!(r.allowed);
        }
    }

    #[test]
    fn capacity_plus_one_request_is_denied() {
        let rl = RateLimiter::new();
        for _ in 0..5 {
            assert!(rl.try_consume("s", 1, 5, Duration::from_secs(60)).allowed);
        }
        let denied = rl.try_consume("s", 1, 5, Duration::from_secs(60));
        assert!(!denied.allowed);
        assert!(denied.wait_hint.is_some());
    }

    #[test]
    fn tokens_never_go_negative_or_exceed_capacity() {
        let rl = RateLimiter::new();
        for _ in 0..20 {
            rl.try_consume("s", 1, 5, Duration::from_secs(60));
        }
        let state = rl.get_state("s").unwrap();
        assert!(state.tokens >= 0.0);
        assert!(state.tokens.floor() <= state.capacity);
    }

    #[test]
    fn get_state_returns_none_for_unknown_scope() {
        let rl = RateLimiter::new();
        assert!(rl.get_state("never-touched").is_none());
    }

    #[test]
    fn capacity_reload_clamps_existing_tokens_in_place() {
        let rl = RateLimiter::new();
        rl.try_consume("s", 0, 10, Duration::from_secs(60));
        assert_eq!(rl.get_state("s").unwrap().capacity, 10.0);
        rl.try_consume("s", 0, 3, Duration::from_secs(60));
        let state = rl.get_state("s").unwrap();
        assert_eq!(state.capacity, 3.0);
        assert!(state.tokens <= 3.0);
    }

    #[test]
    fn disabled_rate_limit_always_allows() {
        let rl = RateLimiter::new();
        let cfg = RateLimitConfig {
            enabled: false,
            user_requests_per_minute: 1,
            channel_messages_per_second: 1,
            llm_requests_per_minute: 1,
        };
        for _ in 0..10 {
            assert!(try_consume_default_scopes(&rl, &cfg, "telegram", "openai").allowed);
        }
    }

    #[test]
    fn default_scopes_are_distinctly_keyed() {
        assert_eq!(user_scope(), "user:global");
        assert_eq!(channel_scope("telegram"), "channel:telegram");
        assert_eq!(llm_scope("openai"), "llm:openai");
    }
}

//! Per-client request rate limiting
//!
//! Buckets live behind the [`RateLimitStore`] trait. Two in-memory stores are
//! provided: a fixed window counter and a governor-backed token bucket. The
//! [`RateLimiter`] facade turns store decisions into gateway errors and fails
//! closed when the store cannot answer.

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use governor::{
    Quota, RateLimiter as GovernorRateLimiter,
    clock::{Clock, DefaultClock},
    middleware::StateInformationMiddleware,
    state::keyed::DefaultKeyedStateStore,
};
use parking_lot::Mutex;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{RateLimitConfig, RateLimitStrategy};
use crate::error::GatewayError;

/// Outcome of one admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Quota per window
    pub limit: u32,
    /// Requests still admissible in the current window
    pub remaining: u32,
    /// Time until the key regains capacity
    pub reset_after: Duration,
}

/// Store failure; the limiter rejects the request when this happens
#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limit store unavailable: {0}")]
    Unavailable(String),
}

/// Backing store for rate limit buckets
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Count one request against `key` and decide whether it is admitted
    async fn check(&self, key: &str) -> Result<RateDecision, RateLimitError>;

    /// Drop buckets that no longer hold state; returns how many were removed
    async fn purge_expired(&self) -> usize;

    /// Number of keys currently tracked
    fn tracked_keys(&self) -> usize;
}

#[derive(Debug)]
struct Window {
    started: Instant,
    count: u32,
}

/// Counter per key, reset when the window elapses
#[derive(Debug)]
pub struct FixedWindowStore {
    windows: DashMap<String, Arc<Mutex<Window>>>,
    limit: u32,
    window: Duration,
}

impl FixedWindowStore {
    #[must_use]
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            limit,
            window,
        }
    }

    fn bucket(&self, key: &str) -> Arc<Mutex<Window>> {
        // The shard guard is released before the bucket is locked, so
        // requests for different keys never wait on each other.
        if let Some(existing) = self.windows.get(key) {
            return Arc::clone(existing.value());
        }
        let entry = self.windows.entry(key.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(Window {
                started: Instant::now(),
                count: 0,
            }))
        });
        Arc::clone(entry.value())
    }
}

#[async_trait]
impl RateLimitStore for FixedWindowStore {
    async fn check(&self, key: &str) -> Result<RateDecision, RateLimitError> {
        let bucket = self.bucket(key);
        let mut window = bucket.lock();

        let now = Instant::now();
        if now.duration_since(window.started) >= self.window {
            window.started = now;
            window.count = 0;
        }

        let reset_after = self
            .window
            .saturating_sub(now.duration_since(window.started));
        let allowed = window.count < self.limit;
        if allowed {
            window.count += 1;
        }

        Ok(RateDecision {
            allowed,
            limit: self.limit,
            remaining: self.limit.saturating_sub(window.count),
            reset_after,
        })
    }

    async fn purge_expired(&self) -> usize {
        let before = self.windows.len();
        let window = self.window;
        self.windows
            .retain(|_, bucket| bucket.lock().started.elapsed() < window);
        before.saturating_sub(self.windows.len())
    }

    fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}

type KeyedLimiter = GovernorRateLimiter<
    String,
    DefaultKeyedStateStore<String>,
    DefaultClock,
    StateInformationMiddleware,
>;

/// GCRA bucket per key; the quota refills evenly across the window
pub struct TokenBucketStore {
    limiter: KeyedLimiter,
    clock: DefaultClock,
    limit: u32,
}

impl TokenBucketStore {
    pub fn new(limit: u32, window: Duration) -> Result<Self> {
        let burst = NonZeroU32::new(limit).context("rate limit quota must be non-zero")?;
        let quota = Quota::with_period(window / limit)
            .context("rate limit window too short for the quota")?
            .allow_burst(burst);

        Ok(Self {
            limiter: GovernorRateLimiter::keyed(quota)
                .with_middleware::<StateInformationMiddleware>(),
            clock: DefaultClock::default(),
            limit,
        })
    }
}

#[async_trait]
impl RateLimitStore for TokenBucketStore {
    async fn check(&self, key: &str) -> Result<RateDecision, RateLimitError> {
        let decision = match self.limiter.check_key(&key.to_string()) {
            Ok(snapshot) => RateDecision {
                allowed: true,
                limit: self.limit,
                remaining: snapshot.remaining_burst_capacity(),
                reset_after: Duration::ZERO,
            },
            Err(not_until) => RateDecision {
                allowed: false,
                limit: self.limit,
                remaining: 0,
                reset_after: not_until.wait_time_from(self.clock.now()),
            },
        };
        Ok(decision)
    }

    async fn purge_expired(&self) -> usize {
        let before = self.limiter.len();
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
        before.saturating_sub(self.limiter.len())
    }

    fn tracked_keys(&self) -> usize {
        self.limiter.len()
    }
}

/// Admission facade used by the request pipeline
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    enabled: bool,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("enabled", &self.enabled)
            .field("tracked_keys", &self.store.tracked_keys())
            .finish()
    }
}

impl RateLimiter {
    /// Build the limiter with the store selected by `config.strategy`
    pub fn new(config: &RateLimitConfig) -> Result<Self> {
        let store: Arc<dyn RateLimitStore> = match config.strategy {
            RateLimitStrategy::FixedWindow => Arc::new(FixedWindowStore::new(
                config.requests_per_window,
                config.window(),
            )),
            RateLimitStrategy::TokenBucket => Arc::new(TokenBucketStore::new(
                config.requests_per_window,
                config.window(),
            )?),
        };
        Ok(Self::with_store(store, config.enabled))
    }

    #[must_use]
    pub fn with_store(store: Arc<dyn RateLimitStore>, enabled: bool) -> Self {
        Self { store, enabled }
    }

    /// Admit or reject one request for `key`.
    ///
    /// Returns `Ok(None)` when limiting is disabled. A store failure is
    /// reported as an internal error so the request is not admitted.
    pub async fn check(&self, key: &str) -> Result<Option<RateDecision>, GatewayError> {
        if !self.enabled {
            return Ok(None);
        }

        let decision = self.store.check(key).await.map_err(|e| {
            warn!(key, error = %e, "Rate limit store failed, rejecting request");
            GatewayError::Internal(e.to_string())
        })?;

        if decision.allowed {
            Ok(Some(decision))
        } else {
            Err(GatewayError::RateLimitExceeded {
                key: key.to_string(),
                retry_after_secs: decision.reset_after.as_secs_f64().ceil().max(1.0) as u64,
            })
        }
    }

    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.store.tracked_keys()
    }

    /// Periodically purge idle buckets
    pub fn spawn_cleanup(&self, every: Duration) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = store.purge_expired().await;
                if removed > 0 {
                    debug!(removed, remaining = store.tracked_keys(), "Purged idle rate limit buckets");
                }
            }
        })
    }
}

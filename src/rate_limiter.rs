//! Dual token-bucket admission control for the metered API.
//!
//! [`RateLimiter`] keeps one bucket for requests per minute and one for tokens
//! per minute. Both refill continuously and saturate at their capacity; a
//! caller of [`RateLimiter::acquire`] is suspended until both can pay.
//! Timestamps come from `tokio::time::Instant`, so a paused test runtime drives
//! refill deterministically.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

const WINDOW_MS: f64 = 60_000.0;

/// Named rate-limit configuration selected at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Tier1,
    Tier2,
    Tier3,
    Tier4,
    Custom {
        requests_per_minute: u32,
        tokens_per_minute: u32,
    },
}

impl Tier {
    /// Custom tier; zero limits are raised to one so the buckets can refill.
    pub fn custom(requests_per_minute: u32, tokens_per_minute: u32) -> Self {
        Tier::Custom {
            requests_per_minute: requests_per_minute.max(1),
            tokens_per_minute: tokens_per_minute.max(1),
        }
    }

    pub fn requests_per_minute(self) -> u32 {
        match self {
            Tier::Tier1 => 50,
            Tier::Tier2 => 1_000,
            Tier::Tier3 => 2_000,
            Tier::Tier4 => 4_000,
            Tier::Custom {
                requests_per_minute,
                ..
            } => requests_per_minute.max(1),
        }
    }

    pub fn tokens_per_minute(self) -> u32 {
        match self {
            Tier::Tier1 => 30_000,
            Tier::Tier2 => 450_000,
            Tier::Tier3 => 800_000,
            Tier::Tier4 => 2_000_000,
            Tier::Custom {
                tokens_per_minute, ..
            } => tokens_per_minute.max(1),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Tier1 => write!(f, "tier1"),
            Tier::Tier2 => write!(f, "tier2"),
            Tier::Tier3 => write!(f, "tier3"),
            Tier::Tier4 => write!(f, "tier4"),
            Tier::Custom {
                requests_per_minute,
                tokens_per_minute,
            } => write!(f, "custom({requests_per_minute} rpm, {tokens_per_minute} tpm)"),
        }
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tier1" | "1" => Ok(Tier::Tier1),
            "tier2" | "2" => Ok(Tier::Tier2),
            "tier3" | "3" => Ok(Tier::Tier3),
            "tier4" | "4" => Ok(Tier::Tier4),
            other => Err(format!("unknown tier '{other}' (expected tier1..tier4)")),
        }
    }
}

/// A single refilling bucket. `0 <= level <= capacity` at every observation.
#[derive(Debug, Clone, Copy)]
struct RateBucket {
    capacity: f64,
    level: f64,
    last_refill_at: Instant,
}

impl RateBucket {
    fn full(capacity: f64, now: Instant) -> Self {
        Self {
            capacity,
            level: capacity,
            last_refill_at: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed_ms = now.saturating_duration_since(self.last_refill_at).as_secs_f64() * 1000.0;
        self.level = (self.level + self.capacity * elapsed_ms / WINDOW_MS).min(self.capacity);
        self.last_refill_at = now;
    }

    /// Milliseconds until `needed` units are available, zero if they already are.
    fn wait_ms(&self, needed: f64) -> u64 {
        if self.level >= needed {
            return 0;
        }
        ((needed - self.level) * WINDOW_MS / self.capacity).ceil() as u64
    }

    fn debit(&mut self, amount: f64) {
        self.level = (self.level - amount).max(0.0);
    }
}

#[derive(Debug)]
struct Buckets {
    tokens: RateBucket,
    requests: RateBucket,
}

impl Buckets {
    fn refill(&mut self, now: Instant) {
        self.tokens.refill(now);
        self.requests.refill(now);
    }
}

/// Shared admission gate in front of the external API.
#[derive(Debug)]
pub struct RateLimiter {
    tier: Tier,
    buckets: Mutex<Buckets>,
}

impl RateLimiter {
    pub fn new(tier: Tier) -> Self {
        let now = Instant::now();
        Self {
            tier,
            buckets: Mutex::new(Buckets {
                tokens: RateBucket::full(f64::from(tier.tokens_per_minute()), now),
                requests: RateBucket::full(f64::from(tier.requests_per_minute()), now),
            }),
        }
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn tokens_per_minute(&self) -> u32 {
        self.tier.tokens_per_minute()
    }

    pub fn requests_per_minute(&self) -> u32 {
        self.tier.requests_per_minute()
    }

    /// Suspends until both buckets can pay, then debits `tokens_needed` tokens and one request.
    ///
    /// After each computed wait the buckets are re-checked; another acquirer may
    /// have taken the refill, in which case a fresh wait is computed. A request
    /// larger than the token capacity is charged a full bucket.
    pub async fn acquire(&self, tokens_needed: u64) {
        let needed = self.clamp_tokens(tokens_needed);
        loop {
            let wait_ms = {
                let mut buckets = self.lock();
                buckets.refill(Instant::now());
                let wait = buckets
                    .tokens
                    .wait_ms(needed)
                    .max(buckets.requests.wait_ms(1.0));
                if wait == 0 {
                    buckets.tokens.debit(needed);
                    buckets.requests.debit(1.0);
                    return;
                }
                wait
            };
            debug!(tokens = needed, wait_ms, "rate limiter waiting for refill");
            sleep(Duration::from_millis(wait_ms)).await;
        }
    }

    /// Restores both buckets to capacity and restarts the refill clock.
    pub fn reset(&self) {
        let now = Instant::now();
        let mut buckets = self.lock();
        buckets.tokens = RateBucket::full(buckets.tokens.capacity, now);
        buckets.requests = RateBucket::full(buckets.requests.capacity, now);
    }

    pub fn available_tokens(&self) -> f64 {
        let mut buckets = self.lock();
        buckets.refill(Instant::now());
        buckets.tokens.level
    }

    pub fn available_requests(&self) -> f64 {
        let mut buckets = self.lock();
        buckets.refill(Instant::now());
        buckets.requests.level
    }

    fn clamp_tokens(&self, tokens_needed: u64) -> f64 {
        let capacity = f64::from(self.tier.tokens_per_minute());
        let needed = tokens_needed as f64;
        if needed > capacity {
            warn!(
                tokens_needed,
                capacity, "request exceeds token bucket capacity, charging a full bucket"
            );
            capacity
        } else {
            needed
        }
    }

    fn lock(&self) -> MutexGuard<'_, Buckets> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

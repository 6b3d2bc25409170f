//! Fixed-window rate limiter, one set of windows per key.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::elapsed_between;

/// A cap of `max_requests` per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitTier {
    pub max_requests: u32,
    #[serde(with = "secs")]
    pub window: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    #[serde(with = "secs")]
    pub window: Duration,
    /// Longer caps checked alongside the primary window, e.g. per hour and
    /// per day. A slot is taken only when every tier has room.
    pub tiers: Vec<RateLimitTier>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window: Duration::from_secs(60),
            tiers: Vec::new(),
        }
    }
}

impl RateLimitConfig {
    fn limits(&self) -> impl Iterator<Item = RateLimitTier> + '_ {
        std::iter::once(RateLimitTier {
            max_requests: self.max_requests,
            window: self.window,
        })
        .chain(self.tiers.iter().copied())
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    opened_at: DateTime<Utc>,
    used: u32,
}

impl Window {
    fn current(self, tier: RateLimitTier, now: DateTime<Utc>) -> Self {
        if elapsed_between(self.opened_at, now) >= tier.window {
            Window { opened_at: now, used: 0 }
        } else {
            self
        }
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: HashMap<String, Vec<Window>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: HashMap::new(),
        }
    }

    /// Take one slot for `key` at `now`. When any tier is full, nothing is
    /// taken and the longest wait until every full tier reopens is returned.
    pub fn try_acquire(&mut self, key: &str, now: DateTime<Utc>) -> Result<(), Duration> {
        let tiers: Vec<RateLimitTier> = self.config.limits().collect();
        let windows = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| vec![Window { opened_at: now, used: 0 }; tiers.len()]);

        for (window, tier) in windows.iter_mut().zip(&tiers) {
            *window = window.current(*tier, now);
        }

        let wait = windows
            .iter()
            .zip(&tiers)
            .filter(|(w, t)| w.used >= t.max_requests)
            .map(|(w, t)| t.window.saturating_sub(elapsed_between(w.opened_at, now)))
            .max();
        if let Some(wait) = wait {
            return Err(wait);
        }

        for window in windows.iter_mut() {
            window.used += 1;
        }
        Ok(())
    }

    /// Slots left for `key` before the tightest tier is full.
    pub fn remaining(&self, key: &str, now: DateTime<Utc>) -> u32 {
        let Some(windows) = self.windows.get(key) else {
            return self.config.limits().map(|t| t.max_requests).min().unwrap_or(0);
        };
        windows
            .iter()
            .zip(self.config.limits())
            .map(|(w, t)| t.max_requests.saturating_sub(w.current(t, now).used))
            .min()
            .unwrap_or(0)
    }
}

//! Access-key to permission-tier lookup.
//!
//! A [`TierRegistry`] is consulted once per job, before any resource is
//! touched. The same key always resolves to the same tier, and a tier's
//! [`TierLimits`] never shrink as the tier grows. The only state it keeps is
//! each key's remaining request budget.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{OrchestratorError, Result};

/// Permission tiers, totally ordered from least to most privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Base,
    Elevated,
    Premium,
    Unrestricted,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Base, Tier::Elevated, Tier::Premium, Tier::Unrestricted];
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Base => write!(f, "base"),
            Tier::Elevated => write!(f, "elevated"),
            Tier::Premium => write!(f, "premium"),
            Tier::Unrestricted => write!(f, "unrestricted"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TierError {
    #[error("Access key missing")]
    MissingKey,

    #[error("Access key not recognised")]
    UnknownKey,
}

/// Requests allowed per access key within a rolling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRate {
    pub requests: u32,
    pub window_secs: u64,
}

impl RequestRate {
    pub const fn new(requests: u32, window_secs: u64) -> Self {
        Self {
            requests,
            window_secs,
        }
    }

    /// At least as many requests per second as `other`.
    fn at_least(&self, other: &RequestRate) -> bool {
        u128::from(self.requests) * u128::from(other.window_secs)
            >= u128::from(other.requests) * u128::from(self.window_secs)
    }

    /// Full burst of `requests`, refilled evenly across the window.
    fn quota(&self) -> Option<Quota> {
        let burst = NonZeroU32::new(self.requests)?;
        let window = Duration::from_secs(self.window_secs);
        Quota::with_period(window / self.requests).map(|q| q.allow_burst(burst))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    pub max_sub_commands: usize,
    pub unrestricted_content: bool,
    /// None means no request rate limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<RequestRate>,
}

impl TierLimits {
    pub const fn new(max_sub_commands: usize, unrestricted_content: bool) -> Self {
        Self {
            max_sub_commands,
            unrestricted_content,
            rate: None,
        }
    }

    pub const fn with_rate(mut self, requests: u32, window_secs: u64) -> Self {
        self.rate = Some(RequestRate::new(requests, window_secs));
        self
    }

    /// True when `self` is at least as permissive as `other` on every axis.
    pub fn covers(&self, other: &TierLimits) -> bool {
        let rate_covers = match (self.rate, other.rate) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(mine), Some(theirs)) => mine.at_least(&theirs),
        };
        self.max_sub_commands >= other.max_sub_commands
            && (self.unrestricted_content || !other.unrestricted_content)
            && rate_covers
    }
}

const RATE_WINDOW_SECS: u64 = 15 * 60;

/// Limits for every tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierTable {
    pub base: TierLimits,
    pub elevated: TierLimits,
    pub premium: TierLimits,
    pub unrestricted: TierLimits,
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            base: TierLimits::new(1, false).with_rate(10, RATE_WINDOW_SECS),
            elevated: TierLimits::new(4, false).with_rate(100, RATE_WINDOW_SECS),
            premium: TierLimits::new(16, true).with_rate(100, RATE_WINDOW_SECS),
            unrestricted: TierLimits::new(64, true),
        }
    }
}

impl TierTable {
    pub fn limits(&self, tier: Tier) -> TierLimits {
        match tier {
            Tier::Base => self.base,
            Tier::Elevated => self.elevated,
            Tier::Premium => self.premium,
            Tier::Unrestricted => self.unrestricted,
        }
    }

    /// Reject tables where a higher tier is more restrictive than a lower one.
    pub fn validate(&self) -> Result<()> {
        for tier in Tier::ALL {
            if let Some(rate) = self.limits(tier).rate {
                if rate.quota().is_none() {
                    return Err(OrchestratorError::Config(format!(
                        "tier {} rate needs at least one request per non-empty window",
                        tier
                    )));
                }
            }
        }
        for pair in Tier::ALL.windows(2) {
            let (lower, higher) = (pair[0], pair[1]);
            if !self.limits(higher).covers(&self.limits(lower)) {
                return Err(OrchestratorError::Config(format!(
                    "tier {} limits are narrower than tier {}",
                    higher, lower
                )));
            }
        }
        Ok(())
    }
}

/// External key → tier source (configuration file, database, ...).
pub trait KeySource: Send + Sync {
    fn lookup(&self, key: &str) -> Option<Tier>;
}

impl KeySource for HashMap<String, Tier> {
    fn lookup(&self, key: &str) -> Option<Tier> {
        self.get(key).copied()
    }
}

/// Per-key request budgets, one limiter per rate-limited tier.
struct RateLimits {
    limiters: HashMap<Tier, DefaultKeyedRateLimiter<String>>,
    clock: DefaultClock,
}

impl RateLimits {
    fn new(table: &TierTable) -> Self {
        let limiters = Tier::ALL
            .into_iter()
            .filter_map(|tier| {
                let quota = table.limits(tier).rate?.quota()?;
                Some((tier, RateLimiter::keyed(quota)))
            })
            .collect();
        Self {
            limiters,
            clock: DefaultClock::default(),
        }
    }

    /// Spend one request from `key`'s budget. Err holds the wait until the next one.
    fn check(&self, tier: Tier, key: &str) -> std::result::Result<(), Duration> {
        let Some(limiter) = self.limiters.get(&tier) else {
            return Ok(());
        };
        limiter
            .check_key(&key.to_string())
            .map_err(|not_until| not_until.wait_time_from(self.clock.now()))
    }
}

#[derive(Clone)]
pub struct TierRegistry {
    source: Arc<dyn KeySource>,
    table: TierTable,
    rates: Arc<RateLimits>,
}

impl TierRegistry {
    pub fn new(source: Arc<dyn KeySource>, table: TierTable) -> Self {
        let rates = Arc::new(RateLimits::new(&table));
        Self {
            source,
            table,
            rates,
        }
    }

    /// Resolve a key to its tier. A missing key and an unknown key are distinct failures.
    pub fn resolve_tier(&self, key: Option<&str>) -> std::result::Result<Tier, TierError> {
        let key = match key.map(str::trim) {
            Some(k) if !k.is_empty() => k,
            _ => return Err(TierError::MissingKey),
        };
        self.source.lookup(key).ok_or(TierError::UnknownKey)
    }

    pub fn limits(&self, tier: Tier) -> TierLimits {
        self.table.limits(tier)
    }

    /// Check a request's shape against its tier.
    pub fn admit(
        &self,
        tier: Tier,
        service: &str,
        sub_commands: usize,
        needs_unrestricted: bool,
    ) -> Result<()> {
        let limits = self.limits(tier);
        if sub_commands > limits.max_sub_commands {
            return Err(OrchestratorError::TierLimitExceeded {
                tier,
                limit: limits.max_sub_commands,
                requested: sub_commands,
            });
        }
        if needs_unrestricted && !limits.unrestricted_content {
            return Err(OrchestratorError::ContentNotPermitted {
                service: service.to_string(),
                tier,
            });
        }
        Ok(())
    }

    /// Resolve the key, spend one request from its budget, then check the
    /// request's shape. Every submission counts against the budget, including
    /// ones rejected for their shape.
    pub fn authorize(
        &self,
        key: Option<&str>,
        service: &str,
        sub_commands: usize,
        needs_unrestricted: bool,
    ) -> Result<Tier> {
        let tier = self.resolve_tier(key)?;
        let key = key.map(str::trim).unwrap_or_default();
        if let Err(retry_after) = self.rates.check(tier, key) {
            tracing::warn!(%tier, service, ?retry_after, "Request rate exceeded");
            return Err(OrchestratorError::RateLimited { tier, retry_after });
        }
        self.admit(tier, service, sub_commands, needs_unrestricted)?;
        Ok(tier)
    }
}

impl std::fmt::Debug for TierRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TierRegistry")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

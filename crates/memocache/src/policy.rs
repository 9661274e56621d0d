//! Resolution of TTL and MRU durations.
//!
//! A [`TimePolicy`] is either a fixed value or a callback evaluated against the call that is being
//! cached. Fixed values are seconds (`30`, `0.5`), strings with a unit (`"250ms"`, `"1.5h"`), or
//! canonical milliseconds ([`TimePolicy::Millis`]). Policies are resolved with the precedence
//! per-call override, then per-memoization option, then the global default.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::Timestamp;
use crate::hash::KeyValue;

/// A policy value that is not yet validated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PolicyValue {
    /// A number of seconds.
    Seconds(f64),
    /// A number followed by one of the units `ms`, `s`, `m`, `h` or `d`.
    Text(String),
}

impl From<f64> for PolicyValue {
    fn from(seconds: f64) -> Self {
        Self::Seconds(seconds)
    }
}

impl From<&str> for PolicyValue {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

/// A malformed policy.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PolicyError {
    #[error("invalid duration `{0}`, expected a number followed by ms, s, m, h or d")]
    InvalidFormat(String),
    #[error("duration is not a finite number: {0}")]
    NotFinite(f64),
}

fn duration_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(-?\d+(?:\.\d+)?)\s*(ms|s|m|h|d)\s*$").expect("valid duration regex")
    })
}

impl PolicyValue {
    /// Converts this value into (possibly non-positive) milliseconds.
    pub fn millis(&self) -> Result<f64, PolicyError> {
        let millis = match self {
            Self::Seconds(seconds) => seconds * 1000.0,
            Self::Text(text) => {
                let captures = duration_regex()
                    .captures(text)
                    .ok_or_else(|| PolicyError::InvalidFormat(text.clone()))?;
                let amount: f64 = captures[1]
                    .parse()
                    .map_err(|_| PolicyError::InvalidFormat(text.clone()))?;
                let factor = match &captures[2] {
                    "ms" => 1.0,
                    "s" => 1000.0,
                    "m" => 60_000.0,
                    "h" => 3_600_000.0,
                    _ => 86_400_000.0,
                };
                amount * factor
            }
        };
        if millis.is_finite() {
            Ok(millis)
        } else {
            Err(PolicyError::NotFinite(millis))
        }
    }
}

/// The context a policy callback is evaluated against.
pub struct PolicyInput<'a, A, R> {
    /// The receiver the call was made on, if any.
    pub receiver: Option<&'a KeyValue>,
    pub args: &'a A,
    /// The produced or cached result. `None` while the producer has not run yet.
    pub result: Option<&'a R>,
}

pub type PolicyFn<A, R> = Arc<dyn Fn(PolicyInput<'_, A, R>) -> PolicyValue + Send + Sync>;

/// A TTL or MRU specification.
pub enum TimePolicy<A, R> {
    /// Canonical milliseconds.
    Millis(u64),
    Value(PolicyValue),
    Callback(PolicyFn<A, R>),
}

impl<A, R> Clone for TimePolicy<A, R> {
    fn clone(&self) -> Self {
        match self {
            Self::Millis(ms) => Self::Millis(*ms),
            Self::Value(value) => Self::Value(value.clone()),
            Self::Callback(f) => Self::Callback(Arc::clone(f)),
        }
    }
}

impl<A, R> fmt::Debug for TimePolicy<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Millis(ms) => f.debug_tuple("Millis").field(ms).finish(),
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Callback(_) => f.debug_tuple("Callback").finish_non_exhaustive(),
        }
    }
}

impl<A, R> From<Duration> for TimePolicy<A, R> {
    fn from(duration: Duration) -> Self {
        Self::Millis(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }
}

impl<A, R> From<&str> for TimePolicy<A, R> {
    fn from(text: &str) -> Self {
        Self::Value(PolicyValue::from(text))
    }
}

impl<A, R> From<PolicyValue> for TimePolicy<A, R> {
    fn from(value: PolicyValue) -> Self {
        Self::Value(value)
    }
}

impl<A, R> TimePolicy<A, R> {
    pub fn seconds(seconds: f64) -> Self {
        Self::Value(PolicyValue::Seconds(seconds))
    }

    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(PolicyInput<'_, A, R>) -> PolicyValue + Send + Sync + 'static,
    {
        Self::Callback(Arc::new(f))
    }

    /// Whether the result of this policy depends on the produced value.
    pub fn is_callback(&self) -> bool {
        matches!(self, Self::Callback(_))
    }

    /// Evaluates this policy to milliseconds.
    pub fn millis(&self, input: PolicyInput<'_, A, R>) -> Result<f64, PolicyError> {
        match self {
            Self::Millis(ms) => Ok(*ms as f64),
            Self::Value(value) => value.millis(),
            Self::Callback(f) => f(input).millis(),
        }
    }

    /// Evaluates this policy as a TTL.
    pub fn ttl(&self, input: PolicyInput<'_, A, R>) -> Result<Ttl, PolicyError> {
        self.millis(input).map(Ttl::from_millis)
    }
}

/// The lifetime of a cached result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ttl {
    /// The result is handed to current waiters but not stored.
    DoNotCache,
    /// The result expires after the given duration.
    Expires(Duration),
    /// The result never expires.
    Forever,
}

impl Ttl {
    /// Maps a resolved number of milliseconds.
    ///
    /// Non-positive durations disable caching. Durations too large to represent never expire.
    pub fn from_millis(millis: f64) -> Self {
        if millis <= 0.0 {
            return Self::DoNotCache;
        }
        match Duration::try_from_secs_f64(millis / 1000.0) {
            Ok(duration) => Self::Expires(duration),
            Err(_) => Self::Forever,
        }
    }

    /// The expiry timestamp when written at `now`.
    ///
    /// `None` means the entry never expires; callers check [`Ttl::DoNotCache`] first.
    pub fn expires_at(self, now: Timestamp) -> Option<Timestamp> {
        match self {
            Self::Expires(duration) => Some(now.saturating_add(duration)),
            Self::DoNotCache => Some(now),
            Self::Forever => None,
        }
    }

    /// The duration handed to backing stores, `None` for entries without expiry.
    pub fn duration(self) -> Option<Duration> {
        match self {
            Self::Expires(duration) => Some(duration),
            Self::DoNotCache => Some(Duration::ZERO),
            Self::Forever => None,
        }
    }
}

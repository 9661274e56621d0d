//! Wall-clock timestamps shared between processes.
//!
//! Expiry times are stored as milliseconds since the UNIX epoch so that entries written by one
//! process can be interpreted by another one reading the same backing store. Within a process the
//! clock is anchored to the wall clock once and then advanced using [`tokio::time::Instant`],
//! which means paused tokio time (`tokio::time::pause`) also pauses cache time in tests.

use std::fmt;
use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

static ANCHOR: OnceLock<(u64, Instant)> = OnceLock::new();

fn anchor() -> (u64, Instant) {
    *ANCHOR.get_or_init(|| {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        (wall.as_millis() as u64, Instant::now())
    })
}

/// A point in time, in milliseconds since the UNIX epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Returns the current time.
    pub fn now() -> Self {
        let (epoch_ms, base) = anchor();
        let now = Instant::now();
        // Different tokio runtimes (with paused clocks) may observe instants before the anchor.
        let millis = match now.checked_duration_since(base) {
            Some(elapsed) => epoch_ms.saturating_add(elapsed.as_millis() as u64),
            None => epoch_ms.saturating_sub(base.duration_since(now).as_millis() as u64),
        };
        Self(millis)
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Returns this timestamp moved forward by `duration`, saturating at the maximum.
    pub fn saturating_add(self, duration: Duration) -> Self {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(millis))
    }

    /// The time left between `now` and this timestamp, zero if it already passed.
    pub fn remaining(self, now: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(now.0))
    }

    fn to_system_time(self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        humantime::format_rfc3339_millis(self.to_system_time()).fmt(f)
    }
}

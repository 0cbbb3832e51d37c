//! # Shared Value Types
//!
//! Time-to-live handling shared by the remote client and the local cache.
//!
//! ## Design Principles
//!
//! 1. **One Normalization Rule**: Any TTL of zero or below means "never
//!    expires", matching the `-1` convention used by callers.
//! 2. **Monotonic Deadlines**: Deadlines are computed from `Instant`, never from
//!    wall-clock time, so clock adjustments cannot expire entries early.

use std::fmt;
use std::time::{Duration, Instant};

/// Time-to-live for cache entries, in whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Ttl {
    /// The entry never expires (`-1` on the wire and in the public API).
    #[default]
    Never,
    /// The entry expires this many seconds after it was written.
    Seconds(u64),
}

impl Ttl {
    /// Normalizes a signed second count; values `<= 0` become `Never`.
    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        if secs <= 0 {
            Ttl::Never
        } else {
            Ttl::Seconds(secs as u64)
        }
    }

    /// Returns the TTL in seconds, `-1` for `Never`.
    #[inline]
    pub const fn as_secs(&self) -> i64 {
        match self {
            Ttl::Never => -1,
            Ttl::Seconds(secs) => *secs as i64,
        }
    }

    /// Returns true if this TTL never expires.
    #[inline]
    pub const fn is_never(&self) -> bool {
        matches!(self, Ttl::Never)
    }

    /// Returns the TTL as a `Duration`, `None` for `Never`.
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Ttl::Never => None,
            Ttl::Seconds(secs) => Some(Duration::from_secs(*secs)),
        }
    }

    /// Computes the absolute deadline for an entry written at `now`.
    pub fn deadline_from(&self, now: Instant) -> Option<Instant> {
        self.as_duration()
            .map(|ttl| now.checked_add(ttl).unwrap_or(now + Duration::from_secs(u32::MAX as u64)))
    }
}

impl From<i64> for Ttl {
    fn from(secs: i64) -> Self {
        Ttl::from_secs(secs)
    }
}

impl From<Duration> for Ttl {
    fn from(duration: Duration) -> Self {
        if duration.is_zero() {
            Ttl::Never
        } else {
            // Round sub-second remainders up so a 500ms TTL does not become "never".
            let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
            Ttl::Seconds(secs)
        }
    }
}

impl fmt::Display for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ttl::Never => write!(f, "never"),
            Ttl::Seconds(secs) => write!(f, "{secs}s"),
        }
    }
}

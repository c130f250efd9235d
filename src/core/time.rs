use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

const NSEC_PER_SEC: u64 = 1_000_000_000;

/// A point on the log timeline, stored as whole seconds plus nanoseconds.
///
/// `nsec` is always normalized below one second, so the derived ordering
/// (seconds first, then nanoseconds) is the chronological ordering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "RawTime")]
pub struct Time {
    pub sec: u64,
    pub nsec: u32,
}

/// Wire form of [`Time`], normalized on the way in
#[derive(Deserialize)]
struct RawTime {
    sec: u64,
    nsec: u32,
}

impl From<RawTime> for Time {
    fn from(raw: RawTime) -> Self {
        Time::new(raw.sec, raw.nsec)
    }
}

impl Time {
    pub const ZERO: Time = Time { sec: 0, nsec: 0 };
    pub const MAX: Time = Time { sec: u64::MAX, nsec: (NSEC_PER_SEC - 1) as u32 };

    /// Create a time, carrying excess nanoseconds into seconds
    pub fn new(sec: u64, nsec: u32) -> Self {
        let carry = nsec as u64 / NSEC_PER_SEC;
        Self {
            sec: sec.saturating_add(carry),
            nsec: (nsec as u64 % NSEC_PER_SEC) as u32,
        }
    }

    pub fn from_nanos(nanos: u128) -> Self {
        let sec = nanos / NSEC_PER_SEC as u128;
        if sec > u64::MAX as u128 {
            return Self::MAX;
        }
        Self {
            sec: sec as u64,
            nsec: (nanos % NSEC_PER_SEC as u128) as u32,
        }
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::from_nanos(millis as u128 * 1_000_000)
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        if !secs.is_finite() || secs <= 0.0 {
            return Self::ZERO;
        }
        Self::from_nanos((secs * NSEC_PER_SEC as f64).round() as u128)
    }

    pub fn as_nanos(&self) -> u128 {
        self.sec as u128 * NSEC_PER_SEC as u128 + self.nsec as u128
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.sec as f64 + self.nsec as f64 / NSEC_PER_SEC as f64
    }

    /// Add a duration, saturating at [`Time::MAX`]
    pub fn add(self, duration: Duration) -> Self {
        Self::from_nanos(self.as_nanos().saturating_add(duration.as_nanos()))
    }

    /// Subtract a duration, saturating at [`Time::ZERO`]
    pub fn saturating_sub(self, duration: Duration) -> Self {
        Self::from_nanos(self.as_nanos().saturating_sub(duration.as_nanos()))
    }

    /// The next representable time (one nanosecond later)
    pub fn next(self) -> Self {
        self.add(Duration::from_nanos(1))
    }

    /// Span from `earlier` to `self`, zero if `earlier` is later
    pub fn duration_since(&self, earlier: Time) -> Duration {
        let nanos = self.as_nanos().saturating_sub(earlier.as_nanos());
        Duration::new(
            (nanos / NSEC_PER_SEC as u128) as u64,
            (nanos % NSEC_PER_SEC as u128) as u32,
        )
    }

    /// Clamp into `[min, max]`. Unlike `Ord::clamp` an inverted range does
    /// not panic; `min` wins.
    pub fn clamp_to(self, min: Time, max: Time) -> Self {
        if self > max {
            max.max(min)
        } else if self < min {
            min
        } else {
            self
        }
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nsec)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid time {0:?}: expected non-negative decimal seconds")]
pub struct ParseTimeError(pub String);

impl FromStr for Time {
    type Err = ParseTimeError;

    /// Parse decimal seconds (`"12"`, `"12.5"`, `"12.000000001"`) without
    /// going through floating point. Digits past nanosecond precision are
    /// truncated.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let err = || ParseTimeError(s.to_string());

        let (whole, frac) = match trimmed.split_once('.') {
            Some((w, f)) => (w, f),
            None => (trimmed, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err(err());
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(err());
        }

        let sec = if whole.is_empty() { 0 } else { whole.parse::<u64>().map_err(|_| err())? };
        let mut nsec: u32 = 0;
        for (i, digit) in frac.bytes().take(9).enumerate() {
            nsec += (digit - b'0') as u32 * 10u32.pow(8 - i as u32);
        }

        Ok(Time { sec, nsec })
    }
}

/// An inclusive range of time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Time,
    pub end: Time,
}

impl TimeRange {
    pub fn new(start: Time, end: Time) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, time: Time) -> bool {
        self.start <= time && time <= self.end
    }

    pub fn duration(&self) -> Duration {
        self.end.duration_since(self.start)
    }
}

use std::fmt;
use std::time::Duration;

/// A position or duration on a stream timeline, in nanoseconds.
///
/// `StreamTime` is unsigned; there is no such thing as a negative stream
/// time or a negative duration. The all-ones bit pattern is reserved as the
/// [`NONE`](StreamTime::NONE) sentinel meaning "undefined", and the
/// NONE-aware helpers below propagate it instead of wrapping.
///
/// The derived ordering places `NONE` above every defined value, which is
/// what the stop-sorted object list relies on.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StreamTime(u64);

impl StreamTime {
    /// The undefined value.
    pub const NONE: StreamTime = StreamTime(u64::MAX);
    pub const ZERO: StreamTime = StreamTime(0);
    /// Largest defined value.
    pub const MAX: StreamTime = StreamTime(u64::MAX - 1);

    pub const fn from_nanos(nanos: u64) -> Self {
        StreamTime(nanos)
    }

    pub const fn from_millis(millis: u64) -> Self {
        StreamTime(millis * 1_000_000)
    }

    pub const fn from_secs(secs: u64) -> Self {
        StreamTime(secs * 1_000_000_000)
    }

    pub const fn nanos(self) -> u64 {
        self.0
    }

    pub const fn is_none(self) -> bool {
        self.0 == u64::MAX
    }

    pub const fn is_some(self) -> bool {
        !self.is_none()
    }

    /// The value itself when defined, `fallback` otherwise.
    pub fn or(self, fallback: StreamTime) -> StreamTime {
        if self.is_none() { fallback } else { self }
    }

    /// NONE-propagating addition, saturating at [`StreamTime::MAX`].
    pub fn saturating_add(self, other: StreamTime) -> StreamTime {
        if self.is_none() || other.is_none() {
            return StreamTime::NONE;
        }
        StreamTime(self.0.saturating_add(other.0).min(Self::MAX.0))
    }

    /// NONE-propagating subtraction, saturating at zero.
    pub fn saturating_sub(self, other: StreamTime) -> StreamTime {
        if self.is_none() || other.is_none() {
            return StreamTime::NONE;
        }
        StreamTime(self.0.saturating_sub(other.0))
    }

    /// Subtraction returning `None` when either side is undefined or the
    /// result would be negative.
    pub fn checked_sub(self, other: StreamTime) -> Option<StreamTime> {
        if self.is_none() || other.is_none() {
            return None;
        }
        self.0.checked_sub(other.0).map(StreamTime)
    }

    /// Smaller of the two, ignoring undefined sides.
    pub fn min_defined(self, other: StreamTime) -> StreamTime {
        match (self.is_some(), other.is_some()) {
            (true, true) => StreamTime(self.0.min(other.0)),
            (true, false) => self,
            (false, true) => other,
            (false, false) => StreamTime::NONE,
        }
    }

    /// Larger of the two, ignoring undefined sides.
    pub fn max_defined(self, other: StreamTime) -> StreamTime {
        match (self.is_some(), other.is_some()) {
            (true, true) => StreamTime(self.0.max(other.0)),
            (true, false) => self,
            (false, true) => other,
            (false, false) => StreamTime::NONE,
        }
    }
}

impl From<Duration> for StreamTime {
    fn from(value: Duration) -> Self {
        StreamTime(value.as_nanos().min(u128::from(Self::MAX.0)) as u64)
    }
}

impl fmt::Display for StreamTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return write!(f, "none");
        }
        let secs = self.0 / 1_000_000_000;
        let nanos = self.0 % 1_000_000_000;
        write!(
            f,
            "{}:{:02}:{:02}.{:09}",
            secs / 3600,
            (secs / 60) % 60,
            secs % 60,
            nanos
        )
    }
}

// Debug delegates to Display so log lines stay readable.
impl fmt::Debug for StreamTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

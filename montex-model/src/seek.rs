use crate::time::StreamTime;

/// Behaviour flags carried by a seek.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SeekFlags {
    /// Flush the pipeline before the new range starts playing.
    pub flush: bool,
    /// Land exactly on the requested position, never on a keyframe before.
    pub accurate: bool,
    /// Post a segment-done instead of going end-of-stream at the range end.
    pub segment: bool,
}

impl SeekFlags {
    pub const ACCURATE_FLUSH: SeekFlags = SeekFlags {
        flush: true,
        accurate: true,
        segment: false,
    };
}

/// Whether a seek edge carries a position or leaves that edge untouched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SeekBound {
    #[default]
    Set,
    Unset,
}

/// A seek request in one time coordinate system.
///
/// The engine rewrites these at every object boundary; the same shape is
/// used in the composition coordinate system and inside wrapped elements.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SeekDescriptor {
    pub rate: f64,
    pub flags: SeekFlags,
    pub start_bound: SeekBound,
    pub start: StreamTime,
    pub stop_bound: SeekBound,
    pub stop: StreamTime,
}

impl SeekDescriptor {
    /// A forward, flushing, accurate seek over `[start, stop)`.
    pub fn flushing(start: StreamTime, stop: StreamTime) -> Self {
        SeekDescriptor {
            rate: 1.0,
            flags: SeekFlags::ACCURATE_FLUSH,
            start_bound: SeekBound::Set,
            start,
            stop_bound: SeekBound::Set,
            stop,
        }
    }

    pub fn is_reverse(&self) -> bool {
        self.rate < 0.0
    }
}

impl Default for SeekDescriptor {
    fn default() -> Self {
        SeekDescriptor {
            rate: 1.0,
            flags: SeekFlags::default(),
            start_bound: SeekBound::Unset,
            start: StreamTime::NONE,
            stop_bound: SeekBound::Unset,
            stop: StreamTime::NONE,
        }
    }
}

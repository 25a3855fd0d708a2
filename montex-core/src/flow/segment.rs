use montex_model::{SeekBound, SeekDescriptor, SeekFlags, StreamTime};

/// The playback window buffers are interpreted against.
///
/// `start`/`stop` bound the window in stream time, `time` is the stream
/// time the window maps to in the downstream presentation, and `base` is
/// the amount of running time already consumed before this segment. The
/// composition's output probe rewrites `base` so that segments from
/// successive stacks concatenate into a continuous running time.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Segment {
    pub rate: f64,
    pub flags: SeekFlags,
    pub start: StreamTime,
    pub stop: StreamTime,
    pub time: StreamTime,
    pub base: StreamTime,
    pub position: StreamTime,
}

impl Default for Segment {
    fn default() -> Self {
        Segment {
            rate: 1.0,
            flags: SeekFlags::default(),
            start: StreamTime::ZERO,
            stop: StreamTime::NONE,
            time: StreamTime::ZERO,
            base: StreamTime::ZERO,
            position: StreamTime::ZERO,
        }
    }
}

impl Segment {
    pub fn is_reverse(&self) -> bool {
        self.rate < 0.0
    }

    /// Update the segment from a seek, leaving unset edges untouched.
    pub fn apply_seek(&mut self, seek: &SeekDescriptor) {
        self.rate = seek.rate;
        self.flags = seek.flags;
        if seek.start_bound == SeekBound::Set {
            self.start = seek.start;
            self.time = seek.start;
        }
        if seek.stop_bound == SeekBound::Set {
            self.stop = seek.stop;
        }
        self.position = if self.is_reverse() {
            self.stop
        } else {
            self.start
        };
    }

    /// Convert a position inside the segment to running time. Undefined
    /// positions stay undefined.
    pub fn running_time(&self, position: StreamTime) -> StreamTime {
        if position.is_none() {
            return StreamTime::NONE;
        }
        let elapsed = if self.is_reverse() {
            self.stop.saturating_sub(position)
        } else {
            position.saturating_sub(self.start)
        };
        if elapsed.is_none() {
            return StreamTime::NONE;
        }
        let scaled = if self.rate.abs() == 1.0 {
            elapsed
        } else {
            StreamTime::from_nanos((elapsed.nanos() as f64 / self.rate.abs()) as u64)
        };
        self.base.saturating_add(scaled)
    }

    /// Running-time span covered by the whole segment, or `NONE` when an
    /// edge is undefined.
    pub fn running_span(&self) -> StreamTime {
        let (first, second) = if self.is_reverse() {
            (self.stop, self.start)
        } else {
            (self.start, self.stop)
        };
        self.running_time(second)
            .saturating_sub(self.running_time(first))
    }
}

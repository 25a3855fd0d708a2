use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use montex_model::{SeekDescriptor, StreamTime};

use super::segment::Segment;

/// The identifying integer carried by every flush/seek/EOS event, used to
/// correlate cause and effect across the data plane.
///
/// Seqnums are free-running; comparisons are exact equality only, never
/// ordering. Zero is reserved to mean "absent/cleared".
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Seqnum(u32);

static NEXT_SEQNUM: AtomicU32 = AtomicU32::new(1);

impl Seqnum {
    pub const NONE: Seqnum = Seqnum(0);

    /// Allocate a fresh process-wide sequence number, skipping zero.
    pub fn next() -> Seqnum {
        loop {
            let n = NEXT_SEQNUM.fetch_add(1, Ordering::Relaxed);
            if n != 0 {
                return Seqnum(n);
            }
        }
    }

    pub const fn from_raw(raw: u32) -> Seqnum {
        Seqnum(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    pub const fn is_some(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Debug for Seqnum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "seqnum(none)")
        } else {
            write!(f, "seqnum({})", self.0)
        }
    }
}

impl fmt::Display for Seqnum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An event travelling through the pad graph.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Event {
    pub seqnum: Seqnum,
    pub payload: EventPayload,
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EventPayload {
    /// Upstream: reconfigure the playback range.
    Seek(SeekDescriptor),
    /// Downstream: the time window the following buffers belong to.
    Segment(Segment),
    FlushStart,
    FlushStop {
        reset_time: bool,
    },
    StreamStart {
        stream_id: String,
    },
    Caps(super::CapsFilter),
    Tag(String),
    Eos,
    StreamGroupDone,
    /// Upstream: quality-of-service feedback in running time.
    Qos {
        timestamp: StreamTime,
        jitter: i64,
    },
}

impl Event {
    /// Wrap a payload with a freshly allocated seqnum.
    pub fn new(payload: EventPayload) -> Event {
        Event {
            seqnum: Seqnum::next(),
            payload,
        }
    }

    pub fn with_seqnum(seqnum: Seqnum, payload: EventPayload) -> Event {
        Event { seqnum, payload }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self.payload {
            EventPayload::Seek(_) => "seek",
            EventPayload::Segment(_) => "segment",
            EventPayload::FlushStart => "flush-start",
            EventPayload::FlushStop { .. } => "flush-stop",
            EventPayload::StreamStart { .. } => "stream-start",
            EventPayload::Caps(_) => "caps",
            EventPayload::Tag(_) => "tag",
            EventPayload::Eos => "eos",
            EventPayload::StreamGroupDone => "stream-group-done",
            EventPayload::Qos { .. } => "qos",
        }
    }

    pub fn is_flush(&self) -> bool {
        matches!(
            self.payload,
            EventPayload::FlushStart | EventPayload::FlushStop { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seqnums_are_unique_and_nonzero() {
        let a = Seqnum::next();
        let b = Seqnum::next();
        assert_ne!(a, b);
        assert!(a.is_some());
        assert!(b.is_some());
    }
}

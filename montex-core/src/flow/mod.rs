//! The streaming-plane vocabulary the composition engine drives.
//!
//! The engine itself never decodes or transforms samples; it rearranges a
//! small graph of pads and elements and steers events through it. This
//! module is the embodiment of that collaborator: just enough pad, event
//! and element machinery for the controller contract and its tests.

mod buffer;
mod element;
mod event;
mod pad;
mod query;
mod segment;

pub use buffer::Buffer;
pub use element::{Bin, ElementState, StateChangeError, StreamElement};
pub use event::{Event, EventPayload, Seqnum};
pub use pad::{FlowItem, Pad, PadDirection, ProbeId, ProbeVerdict};
pub use query::Query;
pub use segment::Segment;

/// A stream-filter descriptor propagated from a composition down to the
/// objects it controls. `None` matches anything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CapsFilter {
    media_type: Option<String>,
}

impl CapsFilter {
    pub const fn any() -> Self {
        CapsFilter { media_type: None }
    }

    pub fn new(media_type: impl Into<String>) -> Self {
        CapsFilter {
            media_type: Some(media_type.into()),
        }
    }

    pub fn is_any(&self) -> bool {
        self.media_type.is_none()
    }

    pub fn intersects(&self, other: &CapsFilter) -> bool {
        match (&self.media_type, &other.media_type) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

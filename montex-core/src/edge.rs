//! Time translation at object boundaries.
//!
//! Every timed object stands between two coordinate systems: *external*
//! time (the parent composition's timeline) and *internal* time (whatever
//! the wrapped element counts in). The mapping is
//! `internal = external - start + in_point`, and this module applies it,
//! with the clamping rules the rest of the engine relies on, to seeks,
//! segments and position queries crossing an object's edge pads.

use std::sync::{Arc, Weak};

use tracing::{debug, trace};

use montex_model::{SeekBound, SeekDescriptor, StreamTime, Timing};

use crate::flow::{Event, EventPayload, FlowItem, Pad, Query};
use crate::object::TimedObject;

/// Result of a single time translation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Translated {
    pub time: StreamTime,
    /// The input fell outside the object's window and was clamped.
    pub clamped: bool,
}

/// Convert an external (parent-composition) time to the object's internal
/// time. Inputs below the object `start` clamp to `start`; an object
/// never has a negative internal time.
pub fn to_internal_time(timing: &Timing, external: StreamTime) -> Translated {
    if external.is_none() {
        return Translated {
            time: StreamTime::NONE,
            clamped: false,
        };
    }
    let (external, clamped) = if external < timing.start {
        (timing.start, true)
    } else {
        (external, false)
    };
    let mut internal = external.saturating_sub(timing.start);
    if timing.in_point.is_some() {
        internal = internal.saturating_add(timing.in_point);
    }
    Translated {
        time: internal,
        clamped,
    }
}

/// Convert an internal time to the object's external time. Inputs below
/// the `in_point` clamp to the object `start`.
pub fn to_external_time(timing: &Timing, internal: StreamTime) -> Translated {
    if internal.is_none() {
        return Translated {
            time: StreamTime::NONE,
            clamped: false,
        };
    }
    if timing.in_point.is_some() && internal < timing.in_point {
        return Translated {
            time: timing.start,
            clamped: true,
        };
    }
    let external = internal
        .saturating_sub(timing.in_point.or(StreamTime::ZERO))
        .saturating_add(timing.start);
    Translated {
        time: external,
        clamped: false,
    }
}

/// Rewrite a seek entering an object (parent → internal).
///
/// The external range is clamped to `[start, stop)`, both bounds become
/// set, the accurate flag is forced, and a reverse-playing source inverts
/// the rate sign.
pub fn translate_incoming_seek(
    timing: &Timing,
    reverse_source: bool,
    seek: &SeekDescriptor,
) -> SeekDescriptor {
    let rate = if reverse_source { -seek.rate } else { seek.rate };

    let (start_bound, start) = match seek.start_bound {
        SeekBound::Set => {
            let translated = to_internal_time(timing, seek.start);
            (SeekBound::Set, translated.time)
        }
        SeekBound::Unset => (SeekBound::Unset, seek.start),
    };

    // The stop edge is always pinned so the element cannot run past the
    // object window.
    let stop = match seek.stop_bound {
        SeekBound::Set => {
            let external = seek.stop.min_defined(timing.stop());
            to_internal_time(timing, external).time
        }
        SeekBound::Unset => to_internal_time(timing, timing.stop()).time,
    };

    let mut flags = seek.flags;
    flags.accurate = true;

    let translated = SeekDescriptor {
        rate,
        flags,
        start_bound,
        start,
        stop_bound: SeekBound::Set,
        stop,
    };
    trace!(?timing, from = ?seek, to = ?translated, "translated incoming seek");
    translated
}

/// Rewrite a seek leaving an object through its sink side
/// (internal → parent). The inverse of [`translate_incoming_seek`]:
/// unmappable edges resolve to the object's own `start`/`stop`.
pub fn translate_outgoing_seek(timing: &Timing, seek: &SeekDescriptor) -> SeekDescriptor {
    let (start_bound, start) = match seek.start_bound {
        SeekBound::Set => {
            let translated = to_external_time(timing, seek.start);
            let value = if translated.clamped {
                timing.start
            } else {
                translated.time
            };
            (SeekBound::Set, value)
        }
        SeekBound::Unset => (SeekBound::Unset, seek.start),
    };

    let stop = match seek.stop_bound {
        SeekBound::Set => {
            let translated = to_external_time(timing, seek.stop);
            if translated.clamped {
                timing.stop()
            } else {
                translated.time
            }
        }
        SeekBound::Unset => timing.stop(),
    };

    SeekDescriptor {
        rate: seek.rate,
        flags: seek.flags,
        start_bound,
        start,
        stop_bound: SeekBound::Set,
        stop,
    }
}

/// Install the edge hooks on an object's source edge pad: incoming seeks
/// and position queries are translated into the wrapped element's time,
/// outgoing segments and position answers back into the parent's.
pub(crate) fn install_src_edge_hooks(pad: &Arc<Pad>, object: Weak<TimedObject>) {
    let for_events = object.clone();
    pad.set_event_handler(move |pad, event| {
        let Some(object) = for_events.upgrade() else {
            return false;
        };
        match &event.payload {
            EventPayload::Seek(seek) => {
                if pad.target().is_none() {
                    trace!(object = object.name(), "edge pad has no target, stashing seek");
                    pad.stash_pending_seek(event.clone());
                    return true;
                }
                let timing = object.live_timing();
                let translated =
                    translate_incoming_seek(&timing, object.is_reverse_source(), seek);
                debug!(
                    object = object.name(),
                    seqnum = %event.seqnum,
                    start = %translated.start,
                    stop = %translated.stop,
                    "seeking wrapped element"
                );
                pad.route_event_upstream(Event::with_seqnum(
                    event.seqnum,
                    EventPayload::Seek(translated),
                ))
            }
            _ => pad.route_event_upstream(event),
        }
    });

    let for_items = object.clone();
    pad.set_filter(move |_, item| {
        let Some(object) = for_items.upgrade() else {
            return Some(item);
        };
        match item {
            FlowItem::Event(Event {
                seqnum,
                payload: EventPayload::Segment(mut segment),
            }) => {
                let timing = object.live_timing();
                segment.time = to_external_time(&timing, segment.time).time;
                Some(FlowItem::Event(Event::with_seqnum(
                    seqnum,
                    EventPayload::Segment(segment),
                )))
            }
            other => Some(other),
        }
    });

    pad.set_query_handler(move |pad, query| {
        let Some(object) = object.upgrade() else {
            return false;
        };
        match query {
            // Duration queries are answered at the edge with the object's
            // own duration, never passed to the wrapped element.
            Query::Duration { result } => {
                *result = Some(object.live_timing().duration);
                true
            }
            Query::Position { .. } => {
                if !pad.route_query_upstream(query) {
                    return false;
                }
                if let Query::Position { result: Some(internal) } = query {
                    let timing = object.live_timing();
                    *internal = to_external_time(&timing, *internal).time;
                }
                true
            }
            _ => pad.route_query_upstream(query),
        }
    });
}

/// Install the edge hooks on an operation's sink edge pad: segments coming
/// in from a child are translated into the operation's internal time,
/// seeks and position answers going out to the child back into parent
/// time.
pub(crate) fn install_sink_edge_hooks(pad: &Arc<Pad>, object: Weak<TimedObject>) {
    let for_events = object.clone();
    pad.set_event_handler(move |pad, event| {
        let Some(object) = for_events.upgrade() else {
            return false;
        };
        match &event.payload {
            EventPayload::Seek(seek) => {
                let timing = object.live_timing();
                let translated = translate_outgoing_seek(&timing, seek);
                pad.route_event_upstream(Event::with_seqnum(
                    event.seqnum,
                    EventPayload::Seek(translated),
                ))
            }
            _ => pad.route_event_upstream(event),
        }
    });

    let for_items = object.clone();
    pad.set_filter(move |_, item| {
        let Some(object) = for_items.upgrade() else {
            return Some(item);
        };
        match item {
            FlowItem::Event(Event {
                seqnum,
                payload: EventPayload::Segment(mut segment),
            }) => {
                let timing = object.live_timing();
                let translated = to_internal_time(&timing, segment.time);
                // A time that cannot be mapped into the operation starts
                // the internal segment at zero.
                segment.time = if translated.clamped {
                    StreamTime::ZERO
                } else {
                    translated.time
                };
                Some(FlowItem::Event(Event::with_seqnum(
                    seqnum,
                    EventPayload::Segment(segment),
                )))
            }
            other => Some(other),
        }
    });

    pad.set_query_handler(move |pad, query| {
        let Some(object) = object.upgrade() else {
            return false;
        };
        match query {
            Query::Position { .. } => {
                if !pad.route_query_upstream(query) {
                    return false;
                }
                if let Query::Position { result: Some(external) } = query {
                    let timing = object.live_timing();
                    *external = to_internal_time(&timing, *external).time;
                }
                true
            }
            _ => pad.route_query_upstream(query),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use montex_model::SeekFlags;

    fn timing(start: u64, duration: u64, in_point: Option<u64>) -> Timing {
        Timing {
            start: StreamTime::from_secs(start),
            duration: StreamTime::from_secs(duration),
            in_point: in_point.map_or(StreamTime::NONE, StreamTime::from_secs),
            ..Timing::default()
        }
    }

    #[test]
    fn round_trips_hold_over_the_object_window() {
        let t = timing(2, 3, Some(10));
        // internal -> external -> internal over [in_point, in_point + duration)
        for secs in [10_u64, 11, 12] {
            let internal = StreamTime::from_secs(secs);
            let external = to_external_time(&t, internal);
            assert!(!external.clamped);
            let back = to_internal_time(&t, external.time);
            assert_eq!(back.time, internal);
        }
        // external -> internal -> external over [start, stop)
        for millis in [2_000_u64, 3_500, 4_999] {
            let external = StreamTime::from_millis(millis);
            let internal = to_internal_time(&t, external);
            assert!(!internal.clamped);
            let back = to_external_time(&t, internal.time);
            assert_eq!(back.time, external);
        }
    }

    #[test]
    fn below_start_clamps_and_flags() {
        let t = timing(2, 3, Some(10));
        let translated = to_internal_time(&t, StreamTime::from_secs(1));
        assert!(translated.clamped);
        assert_eq!(translated.time, StreamTime::from_secs(10));

        let translated = to_external_time(&t, StreamTime::from_secs(9));
        assert!(translated.clamped);
        assert_eq!(translated.time, StreamTime::from_secs(2));
    }

    #[test]
    fn missing_in_point_translates_by_start_alone() {
        let t = timing(4, 2, None);
        assert_eq!(
            to_internal_time(&t, StreamTime::from_secs(5)).time,
            StreamTime::from_secs(1)
        );
        assert_eq!(
            to_external_time(&t, StreamTime::from_secs(1)).time,
            StreamTime::from_secs(5)
        );
    }

    #[test]
    fn incoming_seek_is_clamped_translated_and_accurate() {
        let t = timing(4, 2, Some(20));
        let seek = SeekDescriptor {
            flags: SeekFlags {
                flush: true,
                ..SeekFlags::default()
            },
            ..SeekDescriptor::flushing(StreamTime::from_secs(5), StreamTime::from_secs(9))
        };
        let translated = translate_incoming_seek(&t, false, &seek);
        assert_eq!(translated.start, StreamTime::from_secs(21));
        // External stop beyond the object window pins to the window edge.
        assert_eq!(translated.stop, StreamTime::from_secs(22));
        assert!(translated.flags.accurate);
        assert!((translated.rate - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn reverse_source_inverts_seek_rate() {
        let t = timing(0, 2, Some(0));
        let seek = SeekDescriptor::flushing(StreamTime::ZERO, StreamTime::from_secs(2));
        let translated = translate_incoming_seek(&t, true, &seek);
        assert!((translated.rate + 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn unset_stop_resolves_to_object_window() {
        let t = timing(1, 2, Some(5));
        let seek = SeekDescriptor {
            stop_bound: SeekBound::Unset,
            stop: StreamTime::NONE,
            ..SeekDescriptor::flushing(StreamTime::from_secs(1), StreamTime::NONE)
        };
        let translated = translate_incoming_seek(&t, false, &seek);
        assert_eq!(translated.stop_bound, SeekBound::Set);
        assert_eq!(translated.stop, StreamTime::from_secs(7));
    }

    #[test]
    fn outgoing_seek_maps_back_to_parent_time() {
        let t = timing(2, 3, Some(10));
        let seek = SeekDescriptor::flushing(StreamTime::from_secs(11), StreamTime::from_secs(13));
        let translated = translate_outgoing_seek(&t, &seek);
        assert_eq!(translated.start, StreamTime::from_secs(3));
        assert_eq!(translated.stop, StreamTime::from_secs(5));
    }

    #[test]
    fn outgoing_seek_below_in_point_resolves_to_object_start() {
        let t = timing(2, 3, Some(10));
        let seek = SeekDescriptor::flushing(StreamTime::from_secs(9), StreamTime::from_secs(13));
        let translated = translate_outgoing_seek(&t, &seek);
        assert_eq!(translated.start, StreamTime::from_secs(2));
    }
}

use montex_model::StreamTime;

/// Queries exchanged between pads. Answered in place by whoever handles
/// them; the boolean returned by the pad query entry points reports
/// whether anybody did.
#[derive(Clone, Debug, PartialEq)]
pub enum Query {
    Position {
        result: Option<StreamTime>,
    },
    Duration {
        result: Option<StreamTime>,
    },
    /// Downstream custom query: may downstream keep the current stack, or
    /// does it insist on a teardown for this update?
    NeedsTeardown {
        reason: &'static str,
        result: bool,
    },
    /// Bubbles up through bins; a composition answers with its stream id.
    ParentComposition {
        result: Option<String>,
    },
    /// Serialized downstream query used to flush request/response paths.
    Drain,
}

impl Query {
    pub fn position() -> Query {
        Query::Position { result: None }
    }

    pub fn duration() -> Query {
        Query::Duration { result: None }
    }

    /// Whether the query travels with the data stream (and therefore
    /// interests data probes).
    pub fn is_serialized(&self) -> bool {
        matches!(self, Query::Drain)
    }
}

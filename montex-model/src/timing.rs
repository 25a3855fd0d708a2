use crate::time::StreamTime;

/// Priority value that marks an object as an expandable default source.
/// Expandables are stretched by their composition to cover its whole
/// interval and lose every priority tie.
pub const EXPANDABLE_PRIORITY: u32 = u32::MAX;

/// The timed placement of an object on its composition timeline.
///
/// `stop` is always derived: `start + duration`. `in_point` may be
/// undefined ([`StreamTime::NONE`]), in which case the object plays its
/// wrapped media from wherever that media naturally starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Timing {
    pub start: StreamTime,
    pub duration: StreamTime,
    pub in_point: StreamTime,
    /// Lower wins. [`EXPANDABLE_PRIORITY`] denotes a default source.
    pub priority: u32,
    pub active: bool,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            start: StreamTime::ZERO,
            duration: StreamTime::ZERO,
            in_point: StreamTime::NONE,
            priority: 0,
            active: true,
        }
    }
}

impl Timing {
    pub fn stop(&self) -> StreamTime {
        self.start.saturating_add(self.duration)
    }

    /// Whether `t` falls inside the half-open interval `[start, stop)`.
    pub fn contains(&self, t: StreamTime) -> bool {
        t.is_some() && self.start <= t && t < self.stop()
    }
}

/// Live timing plus its pending shadow.
///
/// External writers only ever touch the pending side; the live side is
/// overwritten atomically at commit by the controller thread (the whole
/// pair sits behind the owning object's lock).
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TimingPair {
    live: Timing,
    pending: Timing,
    commit_needed: bool,
}

impl TimingPair {
    pub fn new(initial: Timing) -> Self {
        TimingPair {
            live: initial,
            pending: initial,
            commit_needed: false,
        }
    }

    pub fn live(&self) -> &Timing {
        &self.live
    }

    /// The value external readers observe: the pending shadow, which equals
    /// the live value whenever no commit is outstanding.
    pub fn pending(&self) -> &Timing {
        &self.pending
    }

    pub fn commit_needed(&self) -> bool {
        self.commit_needed
    }

    pub fn set_pending_start(&mut self, start: StreamTime) {
        self.pending.start = start;
        self.refresh_commit_needed();
    }

    pub fn set_pending_duration(&mut self, duration: StreamTime) {
        self.pending.duration = duration;
        self.refresh_commit_needed();
    }

    pub fn set_pending_in_point(&mut self, in_point: StreamTime) {
        self.pending.in_point = in_point;
        self.refresh_commit_needed();
    }

    pub fn set_pending_priority(&mut self, priority: u32) {
        self.pending.priority = priority;
        self.refresh_commit_needed();
    }

    pub fn set_pending_active(&mut self, active: bool) {
        self.pending.active = active;
        self.refresh_commit_needed();
    }

    /// Force both sides to the given value, bypassing the commit cycle.
    /// Used when the composition retimes its expandable default sources.
    pub fn force(&mut self, timing: Timing) {
        self.live = timing;
        self.pending = timing;
        self.commit_needed = false;
    }

    /// Copy pending over live. Returns whether anything changed.
    pub fn commit(&mut self) -> bool {
        if !self.commit_needed {
            return false;
        }
        self.live = self.pending;
        self.commit_needed = false;
        true
    }

    fn refresh_commit_needed(&mut self) {
        self.commit_needed = self.live != self.pending;
    }
}

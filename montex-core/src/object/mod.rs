//! Timed objects: the nodes placed on a composition timeline.
//!
//! A [`TimedObject`] wraps one stream element and gives it a placement
//! (`start`, `duration`, `in_point`, `priority`, `active`) with pending
//! shadows that only take effect at commit. Its *edge pad* is the boundary
//! through which all seeks, segments and queries are rewritten between the
//! parent composition's time and the wrapped element's time.

mod operation;
mod source;

pub use operation::OperationInner;
pub use source::SourceInner;

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use montex_model::{EXPANDABLE_PRIORITY, StreamTime, Timing, TimingPair};

use crate::edge;
use crate::flow::{CapsFilter, ElementState, Pad, PadDirection, StateChangeError, StreamElement};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectKind {
    /// Leaf producing data through a single edge pad.
    Source,
    /// N-input/1-output transform with sink edge pads tracking the number
    /// of children attached in the current stack.
    Operation,
}

#[derive(Debug)]
struct ObjectShared {
    timing: TimingPair,
    caps: CapsFilter,
    in_composition: bool,
    expandable: bool,
}

enum ObjectInner {
    Source(SourceInner),
    Operation(OperationInner),
}

/// A timed node of a composition.
pub struct TimedObject {
    name: String,
    kind: ObjectKind,
    shared: RwLock<ObjectShared>,
    src_pad: Arc<Pad>,
    inner: ObjectInner,
    element_state: Mutex<ElementState>,
}

impl fmt::Debug for TimedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.shared.read();
        f.debug_struct("TimedObject")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("timing", shared.timing.pending())
            .finish_non_exhaustive()
    }
}

impl TimedObject {
    /// Wrap a producing element as a source object.
    pub fn source(name: impl Into<String>, element: Arc<dyn StreamElement>) -> Arc<TimedObject> {
        Self::build(name.into(), ObjectKind::Source, element)
    }

    /// Wrap a transform element as an operation object. Operations whose
    /// element exposes no static sink pads are treated as dynamic-sink.
    pub fn operation(name: impl Into<String>, element: Arc<dyn StreamElement>) -> Arc<TimedObject> {
        Self::build(name.into(), ObjectKind::Operation, element)
    }

    fn build(
        name: String,
        kind: ObjectKind,
        element: Arc<dyn StreamElement>,
    ) -> Arc<TimedObject> {
        Arc::new_cyclic(|weak: &Weak<TimedObject>| {
            let src_pad = Pad::new(format!("{name}.src"), PadDirection::Src);
            edge::install_src_edge_hooks(&src_pad, weak.clone());
            src_pad.set_target(Some(element.src_pad()));

            let inner = match kind {
                ObjectKind::Source => ObjectInner::Source(SourceInner::new(element)),
                ObjectKind::Operation => {
                    ObjectInner::Operation(OperationInner::new(element, weak.clone()))
                }
            };

            TimedObject {
                name,
                kind,
                shared: RwLock::new(ObjectShared {
                    timing: TimingPair::default(),
                    caps: CapsFilter::any(),
                    in_composition: false,
                    expandable: false,
                }),
                src_pad,
                inner,
                element_state: Mutex::new(ElementState::Null),
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn is_source(&self) -> bool {
        self.kind == ObjectKind::Source
    }

    pub fn is_operation(&self) -> bool {
        self.kind == ObjectKind::Operation
    }

    pub fn edge_pad(&self) -> Arc<Pad> {
        Arc::clone(&self.src_pad)
    }

    pub fn wrapped_element(&self) -> Arc<dyn StreamElement> {
        match &self.inner {
            ObjectInner::Source(source) => source.element(),
            ObjectInner::Operation(operation) => operation.element(),
        }
    }

    pub fn as_operation(&self) -> Option<&OperationInner> {
        match &self.inner {
            ObjectInner::Operation(operation) => Some(operation),
            _ => None,
        }
    }

    pub fn as_source(&self) -> Option<&SourceInner> {
        match &self.inner {
            ObjectInner::Source(source) => Some(source),
            _ => None,
        }
    }

    // ---- timed properties -------------------------------------------------

    /// Live placement, as the data plane must see it.
    pub fn live_timing(&self) -> Timing {
        *self.shared.read().timing.live()
    }

    /// Placement as external readers see it: the pending shadow, equal to
    /// the live value whenever no commit is outstanding.
    pub fn timing(&self) -> Timing {
        *self.shared.read().timing.pending()
    }

    pub fn start(&self) -> StreamTime {
        self.timing().start
    }

    pub fn duration(&self) -> StreamTime {
        self.timing().duration
    }

    /// Derived, read-only: `start + duration`.
    pub fn stop(&self) -> StreamTime {
        self.timing().stop()
    }

    pub fn in_point(&self) -> StreamTime {
        self.timing().in_point
    }

    pub fn priority(&self) -> u32 {
        self.timing().priority
    }

    pub fn is_active(&self) -> bool {
        self.timing().active
    }

    pub fn set_start(&self, start: StreamTime) {
        self.shared.write().timing.set_pending_start(start);
    }

    pub fn set_duration(&self, duration: StreamTime) {
        self.shared.write().timing.set_pending_duration(duration);
    }

    pub fn set_in_point(&self, in_point: StreamTime) {
        self.shared.write().timing.set_pending_in_point(in_point);
    }

    pub fn set_priority(&self, priority: u32) {
        self.shared.write().timing.set_pending_priority(priority);
    }

    pub fn set_active(&self, active: bool) {
        self.shared.write().timing.set_pending_active(active);
    }

    pub fn commit_needed(&self) -> bool {
        self.shared.read().timing.commit_needed()
    }

    /// Copy pending values over live ones. Controller thread only.
    pub fn commit(&self) -> bool {
        let changed = self.shared.write().timing.commit();
        if changed {
            debug!(object = self.name, timing = ?self.live_timing(), "committed");
        }
        changed
    }

    /// Overwrite both live and pending placement, bypassing the commit
    /// cycle. Used by the composition to stretch expandables and to reset
    /// removed objects.
    pub fn force_timing(&self, timing: Timing) {
        self.shared.write().timing.force(timing);
    }

    // ---- capabilities -----------------------------------------------------

    pub fn is_expandable(&self) -> bool {
        self.shared.read().expandable
    }

    /// Mark this object as an expandable default source. Its priority is
    /// forced to the expandable level.
    pub fn set_expandable(&self, expandable: bool) {
        let mut shared = self.shared.write();
        shared.expandable = expandable;
        if expandable {
            shared.timing.set_pending_priority(EXPANDABLE_PRIORITY);
            shared.timing.commit();
        }
    }

    pub fn caps(&self) -> CapsFilter {
        self.shared.read().caps.clone()
    }

    pub fn set_caps(&self, caps: CapsFilter) {
        self.shared.write().caps = caps;
    }

    pub fn in_composition(&self) -> bool {
        self.shared.read().in_composition
    }

    pub fn set_in_composition(&self, value: bool) {
        self.shared.write().in_composition = value;
    }

    /// Whether this is a reverse-playing source (rate inversion applies on
    /// incoming seeks).
    pub fn is_reverse_source(&self) -> bool {
        self.as_source().is_some_and(SourceInner::is_reverse)
    }
}

impl StreamElement for TimedObject {
    fn name(&self) -> &str {
        &self.name
    }

    fn src_pad(&self) -> Arc<Pad> {
        self.edge_pad()
    }

    fn sink_pads(&self) -> Vec<Arc<Pad>> {
        match &self.inner {
            ObjectInner::Operation(operation) => operation.sink_edge_pads(),
            ObjectInner::Source(_) => Vec::new(),
        }
    }

    fn set_state(&self, state: ElementState) -> Result<(), StateChangeError> {
        let rolling = state.is_rolling();
        // Pads go active before the element starts rolling (its first
        // pushes may happen inside set_state) and inactive after it
        // stopped.
        if rolling {
            self.src_pad.set_active(true);
            for sink in self.sink_pads() {
                sink.set_active(true);
            }
        }
        self.wrapped_element().set_state(state)?;
        if !rolling {
            self.src_pad.set_active(false);
            for sink in self.sink_pads() {
                sink.set_active(false);
            }
        }
        *self.element_state.lock() = state;
        Ok(())
    }

    fn state(&self) -> ElementState {
        *self.element_state.lock()
    }

    fn input_priority_changed(&self, pad: &Arc<Pad>, priority: u32) {
        if let ObjectInner::Operation(operation) = &self.inner {
            operation.input_priority_changed(pad, priority);
        }
    }

    fn hard_cleanup(&self) {
        self.src_pad.unlink();
        if let ObjectInner::Operation(operation) = &self.inner {
            operation.hard_cleanup();
        }
    }
}

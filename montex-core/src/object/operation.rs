use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::edge;
use crate::flow::{Pad, PadDirection, StreamElement};

use super::TimedObject;

/// The operation-specific half of a [`TimedObject`]: an N-input/1-output
/// transform whose sink edge pads track the number of children attached in
/// the current stack.
pub struct OperationInner {
    element: Arc<dyn StreamElement>,
    owner: Weak<TimedObject>,
    dynamic_sinks: bool,
    /// Expected sink count. For static elements this is the element's pad
    /// count; for dynamic ones it follows the stack's child count.
    num_sinks: Mutex<usize>,
    /// Materialized sink edge pads, in link-request order.
    sinks: Mutex<Vec<Arc<Pad>>>,
    next_sink_id: AtomicUsize,
}

impl std::fmt::Debug for OperationInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationInner")
            .field("element", &self.element.name())
            .field("dynamic_sinks", &self.dynamic_sinks)
            .field("num_sinks", &self.num_sinks())
            .field("real_sinks", &self.real_sinks())
            .finish()
    }
}

impl OperationInner {
    pub(super) fn new(element: Arc<dyn StreamElement>, owner: Weak<TimedObject>) -> OperationInner {
        let static_sinks = element.sink_pads();
        let dynamic_sinks = static_sinks.is_empty();
        let operation = OperationInner {
            element,
            owner,
            dynamic_sinks,
            num_sinks: Mutex::new(static_sinks.len()),
            sinks: Mutex::new(Vec::new()),
            next_sink_id: AtomicUsize::new(0),
        };
        for target in static_sinks {
            operation.ghost_sink(target);
        }
        operation
    }

    pub fn element(&self) -> Arc<dyn StreamElement> {
        Arc::clone(&self.element)
    }

    pub fn has_dynamic_sinks(&self) -> bool {
        self.dynamic_sinks
    }

    pub fn num_sinks(&self) -> usize {
        *self.num_sinks.lock()
    }

    pub fn real_sinks(&self) -> usize {
        self.sinks.lock().len()
    }

    pub fn sink_edge_pads(&self) -> Vec<Arc<Pad>> {
        self.sinks.lock().clone()
    }

    /// Resize a dynamic operation to the wanted sink count and materialize
    /// or release pads until the real count matches.
    pub fn set_num_sinks(&self, wanted: usize) {
        if !self.dynamic_sinks {
            warn!(element = self.element.name(), "ignoring sink resize on static operation");
            return;
        }
        *self.num_sinks.lock() = wanted;
        self.sync_sinks();
    }

    /// Request or release pads on the wrapped element until
    /// `real_sinks == num_sinks`.
    pub fn sync_sinks(&self) {
        let wanted = self.num_sinks();
        debug!(
            element = self.element.name(),
            wanted,
            real = self.real_sinks(),
            dynamic = self.dynamic_sinks,
            "synchronizing sinks"
        );

        while self.real_sinks() < wanted {
            let target = if self.dynamic_sinks {
                self.element.request_sink_pad()
            } else {
                self.unused_element_sink()
            };
            match target {
                Some(target) => {
                    self.ghost_sink(target);
                }
                None => {
                    warn!(element = self.element.name(), "no sink pad available on element");
                    break;
                }
            }
        }

        while self.real_sinks() > wanted {
            let Some(spare) = self.unlinked_sink() else {
                warn!(element = self.element.name(), "all sinks linked, cannot release");
                break;
            };
            self.remove_sink(&spare);
        }
    }

    /// First materialized sink edge pad with no peer, i.e. the next slot a
    /// child can be linked into.
    pub fn unlinked_sink(&self) -> Option<Arc<Pad>> {
        self.sinks.lock().iter().find(|pad| !pad.is_linked()).cloned()
    }

    pub fn input_priority_changed(&self, pad: &Arc<Pad>, priority: u32) {
        self.element.input_priority_changed(pad, priority);
    }

    /// Unlink every input even if upstream never finished.
    pub fn hard_cleanup(&self) {
        for sink in self.sink_edge_pads() {
            sink.unlink();
        }
    }

    fn ghost_sink(&self, target: Arc<Pad>) {
        let id = self.next_sink_id.fetch_add(1, Ordering::Relaxed);
        let ghost = Pad::new(
            format!("{}.sink_{id}", self.element.name()),
            PadDirection::Sink,
        );
        edge::install_sink_edge_hooks(&ghost, self.owner.clone());
        ghost.set_target(Some(target));
        self.sinks.lock().push(ghost);
    }

    fn remove_sink(&self, pad: &Arc<Pad>) {
        let target = pad.target();
        pad.set_target(None);
        if let (true, Some(target)) = (self.dynamic_sinks, target) {
            self.element.release_sink_pad(&target);
        }
        self.sinks.lock().retain(|sink| !Arc::ptr_eq(sink, pad));
    }

    /// First element sink pad not yet ghosted, for static operations.
    fn unused_element_sink(&self) -> Option<Arc<Pad>> {
        let ghosted: Vec<Arc<Pad>> = self
            .sinks
            .lock()
            .iter()
            .filter_map(|ghost| ghost.target())
            .collect();
        self.element
            .sink_pads()
            .into_iter()
            .find(|candidate| !ghosted.iter().any(|taken| Arc::ptr_eq(taken, candidate)))
    }
}

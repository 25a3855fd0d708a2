use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use montex_model::EngineError;

use super::event::Event;
use super::pad::Pad;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ElementState {
    Null,
    Ready,
    Paused,
    Playing,
}

impl ElementState {
    /// Whether data is allowed to flow in this state.
    pub fn is_rolling(self) -> bool {
        matches!(self, ElementState::Paused | ElementState::Playing)
    }
}

impl fmt::Display for ElementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElementState::Null => "null",
            ElementState::Ready => "ready",
            ElementState::Paused => "paused",
            ElementState::Playing => "playing",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("element `{element}` refused state change to {target}")]
pub struct StateChangeError {
    pub element: String,
    pub target: ElementState,
}

impl From<StateChangeError> for EngineError {
    fn from(err: StateChangeError) -> Self {
        EngineError::ChildStateChange {
            element: err.element,
            target: err.target.to_string(),
        }
    }
}

/// A wrapped producer or transform driven by the engine.
///
/// Implementations own their pads; the engine only ever touches them
/// through this trait and through the pads themselves.
pub trait StreamElement: Send + Sync {
    fn name(&self) -> &str;

    fn src_pad(&self) -> Arc<Pad>;

    fn sink_pads(&self) -> Vec<Arc<Pad>> {
        Vec::new()
    }

    /// Materialize another sink pad, for transforms with on-demand inputs.
    fn request_sink_pad(&self) -> Option<Arc<Pad>> {
        None
    }

    fn release_sink_pad(&self, _pad: &Arc<Pad>) {}

    fn set_state(&self, state: ElementState) -> Result<(), StateChangeError>;

    fn state(&self) -> ElementState;

    /// Send an upstream event into the element, entering at its src pad.
    fn send_event(&self, event: Event) -> bool {
        self.src_pad().send_event(event)
    }

    /// Notification that the input linked on `pad` now carries a child of
    /// the given priority.
    fn input_priority_changed(&self, _pad: &Arc<Pad>, _priority: u32) {}

    /// Forcefully unlink this element's inputs even if upstream never
    /// finished. Only meaningful for transforms.
    fn hard_cleanup(&self) {}
}

/// An ordered set of elements whose states change together. The engine
/// keeps the active stack's objects in one bin so a single state call
/// collapses or revives the whole tree.
pub struct Bin {
    name: String,
    children: Mutex<Vec<Arc<dyn StreamElement>>>,
    state: Mutex<ElementState>,
    state_locked: AtomicBool,
}

impl fmt::Debug for Bin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bin")
            .field("name", &self.name)
            .field("children", &self.children.lock().len())
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl Bin {
    pub fn new(name: impl Into<String>) -> Bin {
        Bin {
            name: name.into(),
            children: Mutex::new(Vec::new()),
            state: Mutex::new(ElementState::Null),
            state_locked: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add(&self, child: Arc<dyn StreamElement>) {
        debug!(bin = self.name, child = child.name(), "adding element");
        self.children.lock().push(child);
    }

    pub fn children(&self) -> Vec<Arc<dyn StreamElement>> {
        self.children.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.children.lock().is_empty()
    }

    /// Remove every child, running its hard cleanup and dropping it to
    /// null state.
    pub fn clear(&self) {
        let children = std::mem::take(&mut *self.children.lock());
        for child in children {
            child.hard_cleanup();
            if let Err(err) = child.set_state(ElementState::Null) {
                warn!(bin = self.name, error = %err, "child refused null during clear");
            }
        }
    }

    /// Prevent parent-driven state changes until unlocked. Direct
    /// `set_state` calls still apply.
    pub fn set_state_locked(&self, locked: bool) {
        self.state_locked.store(locked, Ordering::Release);
    }

    pub fn is_state_locked(&self) -> bool {
        self.state_locked.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ElementState {
        *self.state.lock()
    }

    /// Drive every child to `state`. Children are stopped in reverse
    /// order so downstream elements wind down first.
    pub fn set_state(&self, state: ElementState) -> Result<(), StateChangeError> {
        let children = self.children();
        let going_down = state < *self.state.lock();
        let iter: Box<dyn Iterator<Item = &Arc<dyn StreamElement>>> = if going_down {
            Box::new(children.iter().rev())
        } else {
            Box::new(children.iter())
        };
        for child in iter {
            child.set_state(state)?;
        }
        *self.state.lock() = state;
        Ok(())
    }

    /// Bring a single child to the bin's current state.
    pub fn sync_child_state(&self, child: &Arc<dyn StreamElement>) -> Result<(), StateChangeError> {
        child.set_state(self.state())
    }
}

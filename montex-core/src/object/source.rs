use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::flow::StreamElement;

/// The source-specific half of a [`TimedObject`](super::TimedObject):
/// exactly one wrapped producer, published through the object's edge pad.
pub struct SourceInner {
    element: Arc<dyn StreamElement>,
    reverse: AtomicBool,
}

impl std::fmt::Debug for SourceInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceInner")
            .field("element", &self.element.name())
            .field("reverse", &self.is_reverse())
            .finish()
    }
}

impl SourceInner {
    pub(super) fn new(element: Arc<dyn StreamElement>) -> SourceInner {
        SourceInner {
            element,
            reverse: AtomicBool::new(false),
        }
    }

    pub fn element(&self) -> Arc<dyn StreamElement> {
        Arc::clone(&self.element)
    }

    /// A reverse-playing source inverts the rate sign of incoming seeks.
    pub fn is_reverse(&self) -> bool {
        self.reverse.load(Ordering::Acquire)
    }

    pub fn set_reverse(&self, reverse: bool) {
        self.reverse.store(reverse, Ordering::Release);
    }
}

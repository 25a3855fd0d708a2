//! Stack selection: which tree of objects is active at a playhead
//! position, and over which interval that tree stays valid.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::Arc;

use tracing::{debug, trace};

use montex_model::{EngineError, StreamTime};

use crate::object::TimedObject;

/// One node of the active tree. The `Arc`s alias entries of the
/// composition's master object set, which stays in charge of membership
/// and lifecycle; a stack never outlives a rebuild.
#[derive(Clone)]
pub struct StackNode {
    pub object: Arc<TimedObject>,
    pub children: Vec<StackNode>,
}

impl std::fmt::Debug for StackNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackNode")
            .field("object", &self.object.name())
            .field("children", &self.children)
            .finish()
    }
}

impl StackNode {
    fn leaf(object: Arc<TimedObject>) -> StackNode {
        StackNode {
            object,
            children: Vec::new(),
        }
    }

    /// Structural equality: same object identities, same per-level child
    /// order and count. Matching shapes let an update skip the teardown.
    pub fn same_shape(&self, other: &StackNode) -> bool {
        if !Arc::ptr_eq(&self.object, &other.object) {
            return false;
        }
        if self.children.len() != other.children.len() {
            return false;
        }
        self.children
            .iter()
            .zip(other.children.iter())
            .all(|(a, b)| a.same_shape(b))
    }

    /// Depth-first visit, parents before children.
    pub fn visit(&self, visitor: &mut impl FnMut(&StackNode)) {
        visitor(self);
        for child in &self.children {
            child.visit(visitor);
        }
    }

    /// Multi-line description for stack-swap logging.
    pub fn dump(&self) -> String {
        fn append(node: &StackNode, depth: usize, out: &mut String) {
            let timing = node.object.live_timing();
            let _ = writeln!(
                out,
                "{:indent$}{} [{} -- {}] prio={}",
                "",
                node.object.name(),
                timing.start,
                timing.stop(),
                timing.priority,
                indent = depth * 4
            );
            for child in &node.children {
                append(child, depth + 1, out);
            }
        }
        let mut out = String::new();
        append(self, 0, &mut out);
        out
    }
}

/// A selected stack and the half-open interval over which it need not be
/// rebuilt.
#[derive(Debug)]
pub struct Selection {
    pub stack: Option<StackNode>,
    pub start: StreamTime,
    pub stop: StreamTime,
}

/// Borrowed view of the composition state the selection walks over.
pub(crate) struct StackBuilder<'a> {
    pub objects_start: &'a [Arc<TimedObject>],
    pub objects_stop: &'a [Arc<TimedObject>],
    pub expandables: &'a [Arc<TimedObject>],
    pub reverse: bool,
    /// Actual playback interval (segment cropped to the composition).
    pub real_start: StreamTime,
    pub real_stop: StreamTime,
    /// The composition's own stop value, bounding expandables.
    pub composition_stop: StreamTime,
}

impl StackBuilder<'_> {
    /// Select the active tree at `timestamp`. A missing stack inside the
    /// composition's real interval is a timeline gap.
    pub fn select(&self, timestamp: StreamTime) -> Result<Selection, EngineError> {
        let mut candidates: Vec<Arc<TimedObject>> = Vec::new();
        let mut first_out_of_stack = StreamTime::NONE;

        if self.reverse {
            for object in self.objects_stop {
                let timing = object.live_timing();
                if timing.stop() >= timestamp {
                    if timing.start < timestamp && timing.active {
                        candidates.push(Arc::clone(object));
                    }
                } else {
                    first_out_of_stack = timing.stop();
                    break;
                }
            }
        } else {
            for object in self.objects_start {
                let timing = object.live_timing();
                if timing.start <= timestamp {
                    if timing.stop() > timestamp && timing.active {
                        candidates.push(Arc::clone(object));
                    }
                } else {
                    first_out_of_stack = timing.start;
                    break;
                }
            }
        }

        if timestamp < self.composition_stop {
            for expandable in self.expandables {
                trace!(object = expandable.name(), "adding expandable to the stack list");
                candidates.push(Arc::clone(expandable));
            }
        }

        // Priority ascending, walk order breaking ties.
        candidates.sort_by_key(|object| object.live_timing().priority);

        let mut start = StreamTime::NONE;
        let mut stop = StreamTime::NONE;
        let mut highest_source_priority = 0_u32;
        let mut pool: VecDeque<Arc<TimedObject>> = candidates.into();
        let stack = fold_tree(&mut pool, &mut start, &mut stop, &mut highest_source_priority);

        let Some(stack) = stack else {
            let in_real_interval = if self.reverse {
                timestamp > self.real_start
            } else {
                timestamp < self.real_stop
            };
            if in_real_interval {
                return Err(EngineError::TimelineGap {
                    position: timestamp,
                });
            }
            return Ok(Selection {
                stack: None,
                start: StreamTime::ZERO,
                stop: StreamTime::ZERO,
            });
        };

        if first_out_of_stack.is_some() {
            if self.reverse {
                start = start.max_defined(first_out_of_stack);
            } else {
                stop = stop.min_defined(first_out_of_stack);
            }
        }

        let top_priority = stack.object.live_timing().priority;
        let boundary = if highest_source_priority == 0 {
            top_priority
        } else {
            highest_source_priority
        };
        let (start, stop) = self.refine_above_priority(timestamp, start, stop, boundary);

        debug!(%timestamp, %start, %stop, "selected stack\n{}", stack.dump());
        Ok(Selection {
            stack: Some(stack),
            start,
            stop,
        })
    }

    /// Clip the tentative interval against higher-priority objects that
    /// sit outside the stack at `timestamp`: the stack stops being valid
    /// as soon as one of them would enter it.
    fn refine_above_priority(
        &self,
        timestamp: StreamTime,
        start: StreamTime,
        stop: StreamTime,
        priority: u32,
    ) -> (StreamTime, StreamTime) {
        let mut nstart = start;
        let mut nstop = stop;

        for object in self.objects_start {
            let timing = object.live_timing();
            if timing.priority >= priority || !timing.active {
                continue;
            }
            if timing.start <= timestamp || timing.start >= nstop {
                continue;
            }
            trace!(object = object.name(), at = %timing.start, "start bound found above priority");
            nstop = timing.start;
            break;
        }

        for object in self.objects_stop {
            let timing = object.live_timing();
            if timing.priority >= priority || !timing.active {
                continue;
            }
            if timing.stop() >= timestamp || timing.stop() <= nstart {
                continue;
            }
            trace!(object = object.name(), at = %timing.stop(), "stop bound found above priority");
            nstart = timing.stop();
            break;
        }

        (nstart, nstop)
    }
}

/// Fold the priority-sorted list into a tree: the head becomes the node,
/// and an operation consumes the next `num_sinks` entries (or every
/// remaining one, with dynamic sinks) as its children, depth first.
/// Tracks the running `start` (max of starts), `stop` (min of stops) and
/// the numerically largest source priority.
fn fold_tree(
    pool: &mut VecDeque<Arc<TimedObject>>,
    start: &mut StreamTime,
    stop: &mut StreamTime,
    highest_source_priority: &mut u32,
) -> Option<StackNode> {
    let object = pool.pop_front()?;
    let timing = object.live_timing();

    *stop = stop.min_defined(timing.stop());
    *start = start.max_defined(timing.start);

    if object.is_source() {
        if timing.priority > *highest_source_priority {
            *highest_source_priority = timing.priority;
        }
        return Some(StackNode::leaf(object));
    }

    let operation = object.as_operation().expect("non-source objects are operations");
    let limit = !operation.has_dynamic_sinks();
    let mut remaining = operation.num_sinks();

    let mut node = StackNode::leaf(object);
    while !pool.is_empty() && (!limit || remaining > 0) {
        if let Some(child) = fold_tree(pool, start, stop, highest_source_priority) {
            node.children.push(child);
        }
        if limit {
            remaining -= 1;
        }
    }
    Some(node)
}

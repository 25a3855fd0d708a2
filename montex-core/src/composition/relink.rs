//! Stack swap mechanics: tearing the active tree down without leaking a
//! half-open flush, and wiring the next tree up depth-first.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{debug, info, warn};

use montex_model::EngineError;

use crate::flow::{ElementState, Event, EventPayload, FlowItem, ProbeVerdict, StreamElement};
use crate::stack::StackNode;

use super::{BusMessage, CompositionInner, UpdateReason};

impl CompositionInner {
    /// Collapse the current stack: flush downstream when the reason calls
    /// for it, force the bin to ready to break any pre-roll deadlock, then
    /// empty it.
    pub(crate) fn deactivate_stack(&self, reason: UpdateReason) {
        info!(composition = self.name(), %reason, "deactivating current stack");
        self.shared.tearing_down_stack.store(true, Ordering::Release);

        let flushing = reason.flushes_downstream();
        let ptarget = self.output_pad().target();
        let mut drop_probe = None;

        if flushing {
            if let Some(target) = &ptarget {
                // Nothing may get prerolled between the flushes and the
                // state drop, or the stop below would deadlock against it.
                let id = target.add_probe(|_, item| {
                    if item.is_flush() {
                        ProbeVerdict::Pass
                    } else {
                        ProbeVerdict::Drop
                    }
                });
                drop_probe = Some(id);

                let seqnum = if reason == UpdateReason::Seek {
                    self.shared.seek_seqnum()
                } else {
                    let fresh = crate::flow::Seqnum::next();
                    self.shared.flush_seqnum.store(fresh.raw(), Ordering::Release);
                    fresh
                };
                info!(
                    composition = self.name(),
                    %seqnum,
                    "sending flushes downstream"
                );
                target.push(FlowItem::Event(Event::with_seqnum(
                    seqnum,
                    EventPayload::FlushStart,
                )));
            }
        }

        self.bin.set_state_locked(true);
        if let Err(err) = self.bin.set_state(ElementState::Ready) {
            // Children misbehaving while the stack collapses must not
            // flood the bus.
            warn!(composition = self.name(), error = %err, "child refused ready during teardown");
        }

        if let Some(target) = &ptarget {
            if flushing {
                let flush_stop = Event::with_seqnum(
                    self.shared.flush_seqnum_value(),
                    EventPayload::FlushStop { reset_time: true },
                );
                // The pad was deactivated with its element; activate it
                // around the push so the event actually travels.
                target.set_active(true);
                target.push(FlowItem::Event(flush_stop));
                target.set_active(false);
            }
            if let Some(id) = drop_probe {
                target.remove_probe(id);
            }
        }

        self.bin.clear();

        if let Some((pad, probe)) = self.state.lock().output_probe.take() {
            debug!(composition = self.name(), "removing old output probe");
            pad.remove_probe(probe);
        }

        self.shared.tearing_down_stack.store(false, Ordering::Release);
        info!(composition = self.name(), "stack deactivated");
    }

    /// Attach the new tree: add each node to the bin, sync its state,
    /// link it into its parent operation and propagate its priority.
    pub(crate) fn relink_stack(&self, stack: &StackNode) -> Result<(), EngineError> {
        self.relink_node(stack, None)
    }

    fn relink_node(
        &self,
        node: &StackNode,
        parent: Option<&StackNode>,
    ) -> Result<(), EngineError> {
        let object = &node.object;
        debug!(composition = self.name(), object = object.name(), "relinking node");

        let as_element: Arc<dyn StreamElement> = Arc::clone(object) as Arc<dyn StreamElement>;
        self.bin.add(Arc::clone(&as_element));
        if let Err(err) = self.bin.sync_child_state(&as_element) {
            warn!(composition = self.name(), error = %err, "child state sync failed during relink");
        }

        if let Some(parent) = parent {
            let operation = parent
                .object
                .as_operation()
                .expect("stack parents are operations");
            let Some(sink) = operation.unlinked_sink() else {
                return Err(EngineError::InvalidStructure {
                    operation: parent.object.name().to_string(),
                    children: parent.children.len(),
                    sinks: operation.num_sinks(),
                });
            };
            crate::flow::Pad::link(&object.edge_pad(), &sink);
            parent
                .object
                .input_priority_changed(&sink, object.live_timing().priority);
        }

        if let Some(operation) = object.as_operation() {
            let wanted = node.children.len();
            // Dynamic operations grow or shrink to the number of children
            // the selected tree gives them.
            if operation.has_dynamic_sinks() {
                operation.set_num_sinks(wanted);
            }
            for child in &node.children {
                self.relink_node(child, Some(node))?;
            }
            if wanted == 0 || wanted < operation.num_sinks() {
                return Err(EngineError::InvalidStructure {
                    operation: object.name().to_string(),
                    children: wanted,
                    sinks: operation.num_sinks(),
                });
            }
        }

        Ok(())
    }

    /// Finish the swap: store the initializing seek, re-ghost the output
    /// pad to the new root, reinstall the event probe and revive the bin.
    pub(crate) fn activate_new_stack(self: &Arc<Self>, toplevel_seek: Event) -> Result<(), EngineError> {
        let root = {
            let state = self.state.lock();
            state.current.as_ref().map(|stack| Arc::clone(&stack.object))
        };

        let Some(root) = root else {
            debug!(
                composition = self.name(),
                "no stack to activate, unlocking the bin"
            );
            self.bin.set_state_locked(false);
            return Ok(());
        };

        info!(
            composition = self.name(),
            seqnum = %toplevel_seek.seqnum,
            "activating stack, initializing seek armed"
        );
        *self.shared.stack_initialization_seek.lock() = Some(toplevel_seek);
        self.shared
            .stack_initialization_seek_sent
            .store(false, Ordering::Release);

        let root_pad = root.edge_pad();
        let output = self.output_pad();
        let unchanged = output
            .target()
            .is_some_and(|target| Arc::ptr_eq(&target, &root_pad));
        if !unchanged {
            debug!(
                composition = self.name(),
                target = root_pad.name(),
                "re-ghosting output pad"
            );
            output.set_target(Some(Arc::clone(&root_pad)));
        }

        if self.state.lock().output_probe.is_none() {
            let probe = self.install_output_probe(&root_pad);
            self.state.lock().output_probe = Some((Arc::clone(&root_pad), probe));
        }

        self.bin.set_state_locked(false);
        self.shared.suppress_child_error.store(true, Ordering::Release);
        let result = self.bin.set_state(self.element_state());
        self.shared
            .suppress_child_error
            .store(false, Ordering::Release);

        if let Err(err) = result {
            self.bin.set_state_locked(true);
            let _ = self.bin.set_state(ElementState::Null);
            let error: EngineError = err.into();
            self.post(BusMessage::Error {
                error: error.clone(),
            });
            return Err(error);
        }

        debug!(composition = self.name(), "stack activated");
        Ok(())
    }
}

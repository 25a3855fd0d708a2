//! The downstream event probe: the glue between the streaming data plane
//! and the controller state machine.
//!
//! The probe runs on data threads. To stay reentrancy-safe it only ever
//! flips the shared atomics, enqueues actions and resumes the task. It
//! never touches the object lists or the current stack.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use tracing::{debug, info};

use crate::flow::{Event, EventPayload, FlowItem, Pad, ProbeId, ProbeVerdict, Seqnum};
use crate::queue::{Action, ActionPriority};

use super::{CompositionInner, UpdateReason};

impl CompositionInner {
    pub(crate) fn install_output_probe(self: &Arc<Self>, pad: &Arc<Pad>) -> ProbeId {
        debug!(composition = self.name(), pad = pad.name(), "installing output probe");
        let weak: Weak<CompositionInner> = Arc::downgrade(self);
        pad.add_probe(move |_, item| {
            let Some(inner) = weak.upgrade() else {
                return ProbeVerdict::Pass;
            };
            inner.output_probe(item)
        })
    }

    fn output_probe(self: &Arc<Self>, item: &mut FlowItem) -> ProbeVerdict {
        let is_data = match item {
            FlowItem::Buffer(_) => true,
            FlowItem::Query(query) => query.is_serialized(),
            FlowItem::Event(_) => false,
        };
        if is_data {
            return self.handle_data_item(item);
        }

        let FlowItem::Event(event) = item else {
            return ProbeVerdict::Pass;
        };
        match event.payload.clone() {
            EventPayload::FlushStop { .. } => self.handle_flush_stop(item),
            EventPayload::FlushStart => self.handle_flush_start(item),
            EventPayload::StreamStart { .. } => self.handle_stream_start(item),
            EventPayload::StreamGroupDone => {
                let real_eos = self.shared.real_eos_seqnum.load(Ordering::Acquire);
                if event.seqnum.raw() != real_eos {
                    debug!(
                        composition = self.name(),
                        seqnum = %event.seqnum,
                        real_eos,
                        "dropping stream-group-done"
                    );
                    ProbeVerdict::Drop
                } else {
                    ProbeVerdict::Pass
                }
            }
            EventPayload::Caps(_) => {
                if self.shared.stack_initialization_seek.lock().is_some() {
                    info!(
                        composition = self.name(),
                        "waiting for pre-roll to send the initializing seek, dropping caps"
                    );
                    ProbeVerdict::Drop
                } else {
                    ProbeVerdict::Pass
                }
            }
            EventPayload::Segment(_) => self.handle_segment(item),
            EventPayload::Tag(_) => {
                if self.drops_tags() {
                    debug!(composition = self.name(), "dropping tag");
                    ProbeVerdict::Drop
                } else {
                    ProbeVerdict::Pass
                }
            }
            EventPayload::Eos => self.handle_eos(item),
            _ => ProbeVerdict::Pass,
        }
    }

    /// Buffers and serialized queries prove that the stack flows: they
    /// dispatch the pending initializing seek, or release the waiting
    /// task.
    fn handle_data_item(self: &Arc<Self>, item: &mut FlowItem) -> ProbeVerdict {
        let init_pending = self.shared.stack_initialization_seek.lock().clone();
        if let Some(seek) = init_pending {
            if self
                .shared
                .stack_initialization_seek_sent
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                info!(
                    composition = self.name(),
                    seqnum = %seek.seqnum,
                    "stack pre-rolled, scheduling the initializing seek"
                );
                self.queue
                    .push(ActionPriority::High, Action::Seek { event: seek });
                self.shared.send_stream_start.store(
                    self.shared.updating_reason() == UpdateReason::Initialize,
                    Ordering::Release,
                );
                self.queue.resume();
            }
            debug!(
                composition = self.name(),
                kind = item.kind(),
                "dropping data while the initializing seek is pending"
            );
            return ProbeVerdict::Drop;
        }

        if self
            .shared
            .waiting_serialized_query_or_buffer
            .load(Ordering::Acquire)
        {
            info!(composition = self.name(), "stack update complete");
            self.restart_task();
        }
        ProbeVerdict::Pass
    }

    fn handle_flush_stop(self: &Arc<Self>, item: &mut FlowItem) -> ProbeVerdict {
        let FlowItem::Event(event) = item else {
            return ProbeVerdict::Pass;
        };

        if self.is_ready_to_restart_task(event) {
            self.restart_task();
        }

        if self
            .shared
            .stack_initialization_seek_sent
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            info!(composition = self.name(), "done seeking the initialization stack");
            *self.shared.stack_initialization_seek.lock() = None;
        }

        let flush_seqnum = self.shared.flush_seqnum_value();
        if event.seqnum != flush_seqnum {
            info!(
                composition = self.name(),
                seqnum = %event.seqnum,
                %flush_seqnum,
                "dropping flush-stop"
            );
            return ProbeVerdict::Drop;
        }

        let restamp = self.shared.seek_seqnum();
        let seqnum = if restamp.is_some() { restamp } else { flush_seqnum };
        info!(composition = self.name(), %seqnum, "forwarding flush-stop");
        *event = Event::with_seqnum(seqnum, EventPayload::FlushStop { reset_time: true });
        self.shared.flush_seqnum.store(0, Ordering::Release);
        ProbeVerdict::Pass
    }

    fn handle_flush_start(self: &Arc<Self>, item: &mut FlowItem) -> ProbeVerdict {
        let FlowItem::Event(event) = item else {
            return ProbeVerdict::Pass;
        };
        let flush_seqnum = self.shared.flush_seqnum_value();
        if event.seqnum != flush_seqnum {
            info!(
                composition = self.name(),
                seqnum = %event.seqnum,
                %flush_seqnum,
                "dropping flush-start"
            );
            return ProbeVerdict::Drop;
        }
        let restamp = self.shared.seek_seqnum();
        if restamp.is_some() {
            event.seqnum = restamp;
        }
        debug!(composition = self.name(), seqnum = %event.seqnum, "forwarding flush-start");
        ProbeVerdict::Pass
    }

    /// Forward exactly one stream-start per initialization, restamped with
    /// the composition's stable stream id.
    fn handle_stream_start(self: &Arc<Self>, item: &mut FlowItem) -> ProbeVerdict {
        let FlowItem::Event(event) = item else {
            return ProbeVerdict::Pass;
        };
        if self
            .shared
            .send_stream_start
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let stream_id = self.stream_id();
            info!(composition = self.name(), stream_id, "forwarding stream-start");
            *event = Event::with_seqnum(
                event.seqnum,
                EventPayload::StreamStart { stream_id },
            );
            ProbeVerdict::Pass
        } else {
            debug!(composition = self.name(), "dropping stream-start");
            ProbeVerdict::Drop
        }
    }

    /// Rewrite `segment.base` so successive stacks concatenate into a
    /// continuous downstream running time.
    fn handle_segment(self: &Arc<Self>, item: &mut FlowItem) -> ProbeVerdict {
        let FlowItem::Event(event) = item else {
            return ProbeVerdict::Pass;
        };
        if self.shared.stack_initialization_seek.lock().is_some() {
            info!(
                composition = self.name(),
                "waiting for pre-roll to send the initializing seek, dropping segment"
            );
            return ProbeVerdict::Drop;
        }

        if self.is_ready_to_restart_task(event) {
            self.restart_task();
        }

        let EventPayload::Segment(mut segment) = event.payload.clone() else {
            return ProbeVerdict::Pass;
        };

        let span = segment.running_span();
        let base = self.shared.next_base_time.load(Ordering::Acquire);
        segment.base = montex_model::StreamTime::from_nanos(base);
        if span.is_some() {
            let next = base.saturating_add(span.nanos());
            debug!(
                composition = self.name(),
                base,
                next,
                "advancing the running-time accumulator"
            );
            self.shared.next_base_time.store(next, Ordering::Release);
        }

        let restamp = self.shared.seek_seqnum();
        let seqnum = if restamp.is_some() {
            restamp
        } else {
            event.seqnum
        };
        *event = Event::with_seqnum(seqnum, EventPayload::Segment(segment));
        ProbeVerdict::Pass
    }

    /// The first EOS matching `real_eos_seqnum` is the composition's own
    /// end of stream; one matching `next_eos_seqnum` schedules the next
    /// stack instead. Everything else is stale.
    fn handle_eos(self: &Arc<Self>, item: &mut FlowItem) -> ProbeVerdict {
        let FlowItem::Event(event) = item else {
            return ProbeVerdict::Pass;
        };
        let seqnum = event.seqnum;
        info!(
            composition = self.name(),
            %seqnum,
            real_eos = self.shared.real_eos_seqnum.load(Ordering::Acquire),
            "got EOS"
        );

        if self.is_ready_to_restart_task(event) {
            info!(
                composition = self.name(),
                "EOS right after the configuration events, restarting the task"
            );
            self.restart_task();
        }

        if self
            .shared
            .real_eos_seqnum
            .compare_exchange(seqnum.raw(), 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            info!(composition = self.name(), %seqnum, "EOS for real, forwarding");
            let restamp = self.shared.seek_seqnum();
            if restamp.is_some() {
                event.seqnum = restamp;
            }
            return ProbeVerdict::Pass;
        }

        let next_eos = Seqnum::from_raw(self.shared.next_eos_seqnum.load(Ordering::Acquire));
        if next_eos.is_some() && seqnum == next_eos {
            info!(composition = self.name(), %seqnum, "stack played out, scheduling update");
            self.queue.push(
                ActionPriority::Default,
                Action::Update {
                    seqnum: Seqnum::next(),
                    reason: UpdateReason::Eos,
                },
            );
        } else {
            info!(
                composition = self.name(),
                %seqnum,
                %next_eos,
                "EOS seqnum does not match the scheduled one"
            );
        }
        ProbeVerdict::Drop
    }
}

//! The serialized update state machine: action execution, commits, stack
//! updates and the seek pathway. Everything in this file runs on the
//! composition's dedicated controller thread.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{debug, info, warn};

use montex_model::{EngineError, StreamTime, Timing};

use crate::flow::{Event, EventPayload, Query, Seqnum, StreamElement};
use crate::object::TimedObject;
use crate::queue::{Action, ActionKind};
use crate::stack::StackBuilder;

use super::{BusMessage, CompState, CompositionInner, UpdateReason};

impl CompositionInner {
    pub(crate) fn execute(self: &Arc<Self>, action: Action) {
        debug!(composition = self.name(), ?action, "executing action");
        match action {
            Action::Commit { seqnum } => self.commit_action(seqnum),
            Action::Update { seqnum, reason } => self.update_action(seqnum, reason),
            Action::Seek { event } => self.seek_action(event),
            Action::InitializeStack { seqnum } => self.initialize_action(seqnum),
            Action::AddObject { object } => self.add_object_action(&object),
            Action::RemoveObject { object } => self.remove_object_action(&object),
            Action::EmitCommitted { changed } => {
                info!(composition = self.name(), "stack ready, emitting committed");
                self.post(BusMessage::Committed { changed });
            }
        }
    }

    // ---- add/remove reconciliation ---------------------------------------

    fn add_object_action(&self, object: &Arc<TimedObject>) {
        let mut state = self.state.lock();
        if state.contains(object) {
            if state.pending_io_contains(object) {
                info!(
                    composition = self.name(),
                    object = object.name(),
                    "object already in but marked for removal, unmarking"
                );
                state.pending_io.retain(|o| !Arc::ptr_eq(o, object));
            } else {
                warn!(
                    composition = self.name(),
                    object = object.name(),
                    "object is already in the composition"
                );
            }
            return;
        }
        if state.pending_io_contains(object) {
            warn!(
                composition = self.name(),
                object = object.name(),
                "object is already marked for addition"
            );
            return;
        }
        state.pending_io.push(Arc::clone(object));
    }

    fn remove_object_action(&self, object: &Arc<TimedObject>) {
        let mut state = self.state.lock();
        if !state.contains(object) {
            if state.pending_io_contains(object) {
                info!(
                    composition = self.name(),
                    object = object.name(),
                    "object was marked for addition, unmarking"
                );
                state.pending_io.retain(|o| !Arc::ptr_eq(o, object));
            } else {
                warn!(
                    composition = self.name(),
                    object = object.name(),
                    "object is not in the composition"
                );
            }
            return;
        }
        if state.pending_io_contains(object) {
            warn!(
                composition = self.name(),
                object = object.name(),
                "object is already marked for removal"
            );
            return;
        }
        state.pending_io.push(Arc::clone(object));
    }

    /// Reconcile `pending_io`: objects already in the composition leave it,
    /// the others join. Removing a member of the active stack deactivates
    /// the stack first.
    fn process_pending_entries(&self, reason: UpdateReason) {
        let pending = std::mem::take(&mut self.state.lock().pending_io);
        let mut deactivated = false;
        for object in pending {
            let is_member = self.state.lock().contains(&object);
            if is_member {
                if !deactivated && self.state.lock().in_current_stack(&object) {
                    deactivated = true;
                    self.deactivate_stack(reason);
                    self.state.lock().current = None;
                }
                self.really_remove_object(&object);
            } else {
                self.really_add_object(&object);
            }
        }
    }

    fn really_add_object(&self, object: &Arc<TimedObject>) {
        let mut state = self.state.lock();
        if object.is_expandable() {
            if !state.expandables.is_empty() {
                warn!(
                    composition = self.name(),
                    object = object.name(),
                    "composition already has an expandable, not adding another"
                );
                return;
            }
            let stop = self.timing.read().live().stop();
            object.force_timing(Timing {
                start: StreamTime::ZERO,
                duration: stop,
                in_point: StreamTime::ZERO,
                priority: montex_model::EXPANDABLE_PRIORITY,
                active: true,
            });
            state.expandables.push(Arc::clone(object));
        } else {
            state.objects_start.push(Arc::clone(object));
            state.objects_stop.push(Arc::clone(object));
            state.sort_object_lists();
        }
        drop(state);

        let caps = self.composition_caps();
        if !caps.is_any() {
            object.set_caps(caps);
        }
        object.set_in_composition(true);
        debug!(composition = self.name(), object = object.name(), "object added");
    }

    fn really_remove_object(&self, object: &Arc<TimedObject>) {
        let mut state = self.state.lock();
        state.objects_start.retain(|o| !Arc::ptr_eq(o, object));
        state.objects_stop.retain(|o| !Arc::ptr_eq(o, object));
        state.expandables.retain(|o| !Arc::ptr_eq(o, object));
        drop(state);

        object.hard_cleanup();
        object.force_timing(Timing::default());
        object.set_in_composition(false);
        debug!(composition = self.name(), object = object.name(), "object removed");
    }

    // ---- commit machinery -------------------------------------------------

    /// Translate pending to live for every object, reconcile pending
    /// adds/removes and restore the sort orders. Returns whether anything
    /// changed.
    fn commit_all_values(&self, reason: UpdateReason) -> bool {
        self.shared.next_base_time.store(0, Ordering::Release);
        self.process_pending_entries(reason);

        let objects: Vec<Arc<TimedObject>> = {
            let state = self.state.lock();
            state
                .objects_start
                .iter()
                .chain(state.expandables.iter())
                .cloned()
                .collect()
        };
        let mut committed = false;
        for object in &objects {
            committed |= object.commit();
        }
        committed |= self.timing.write().commit();
        if !committed {
            return false;
        }

        // The topology might have changed, restore the sort orders.
        self.state.lock().sort_object_lists();
        true
    }

    /// Recompute the composition's own start/stop/duration from the
    /// object lists, stretching expandables to the new stop.
    pub(crate) fn update_start_stop_duration(&self) {
        let state = self.state.lock();
        let has_objects = !state.objects_start.is_empty();
        let has_expandables = !state.expandables.is_empty();
        let first_start = state
            .objects_start
            .first()
            .map(|o| o.live_timing().start);
        let first_stop = state
            .objects_stop
            .first()
            .map(|o| o.live_timing().stop());
        let expandables: Vec<Arc<TimedObject>> = state.expandables.clone();
        drop(state);

        let mut timing = self.timing.write();
        let previous = *timing.live();

        if !has_objects && !has_expandables {
            if previous.start != StreamTime::ZERO || previous.duration != StreamTime::ZERO {
                info!(composition = self.name(), "no objects, resetting to zero");
                timing.force(Timing::default());
                drop(timing);
                self.post(BusMessage::DurationChanged {
                    duration: StreamTime::ZERO,
                });
            }
            return;
        }

        let start = if has_expandables {
            StreamTime::ZERO
        } else {
            first_start.unwrap_or(StreamTime::ZERO)
        };
        let stop = first_stop.unwrap_or(StreamTime::ZERO);

        if stop != previous.stop() {
            for expandable in &expandables {
                expandable.force_timing(Timing {
                    start: StreamTime::ZERO,
                    duration: stop,
                    in_point: StreamTime::ZERO,
                    priority: montex_model::EXPANDABLE_PRIORITY,
                    active: true,
                });
            }

            let mut state = self.state.lock();
            let reverse = state.segment.rate < 0.0;
            if reverse || state.segment.stop == previous.stop() || stop < state.segment.stop {
                state.segment.stop = stop;
            }
        }

        let duration = stop.saturating_sub(start);
        let changed = duration != previous.duration;
        timing.force(Timing {
            start,
            duration,
            in_point: StreamTime::NONE,
            priority: 0,
            active: true,
        });
        drop(timing);

        info!(
            composition = self.name(),
            %start,
            %stop,
            %duration,
            "composition interval updated"
        );
        if changed {
            self.post(BusMessage::DurationChanged { duration });
        }
    }

    /// Actual position to start playback at: the segment edge cropped to
    /// the composition interval.
    pub(crate) fn real_start(&self, state: &CompState) -> StreamTime {
        state
            .segment
            .start
            .max_defined(self.timing.read().live().start)
    }

    pub(crate) fn real_stop(&self, state: &CompState) -> StreamTime {
        let own = self.timing.read().live().stop();
        if state.segment.stop.is_none() {
            own
        } else {
            state.segment.stop.min_defined(own)
        }
    }

    /// The playhead as the data plane currently sees it: ask downstream
    /// first, then the stack root, then fall back to the stack start.
    pub(crate) fn current_position(&self) -> StreamTime {
        let mut query = Query::position();
        if self.output_pad().peer_query(&mut query) {
            if let Query::Position { result: Some(position) } = query {
                debug!(composition = self.name(), %position, "downstream answered position");
                return position;
            }
        }

        let root_pad = {
            let state = self.state.lock();
            state.current.as_ref().map(|stack| stack.object.edge_pad())
        };
        if let Some(pad) = root_pad {
            let mut query = Query::position();
            if pad.query(&mut query) {
                if let Query::Position { result: Some(position) } = query {
                    return position;
                }
            }
        }

        let state = self.state.lock();
        if state.current_stack_start.is_some() {
            state.current_stack_start
        } else {
            StreamTime::ZERO
        }
    }

    // ---- per-reason action functions -------------------------------------

    fn initialize_action(self: &Arc<Self>, seqnum: Seqnum) {
        self.post_start_update(seqnum, UpdateReason::Initialize);

        self.commit_all_values(UpdateReason::Initialize);
        self.update_start_stop_duration();
        self.shared.next_base_time.store(0, Ordering::Release);

        let start = {
            let state = self.state.lock();
            self.real_start(&state)
        };
        if let Err(error) = self.update_pipeline(start, seqnum, UpdateReason::Initialize) {
            warn!(composition = self.name(), %error, "initial stack update failed");
        }

        self.post_update_done(seqnum, UpdateReason::Initialize);
        self.state.lock().initialized = true;
    }

    fn commit_action(self: &Arc<Self>, seqnum: Seqnum) {
        self.post_start_update(seqnum, UpdateReason::Commit);

        // Capture the position before committing so it still reflects the
        // timeline the data plane has been playing.
        let position = self.current_position();

        if !self.commit_all_values(UpdateReason::Commit) {
            debug!(composition = self.name(), "nothing to commit");
            self.post(BusMessage::Committed { changed: false });
            self.post_update_done(seqnum, UpdateReason::Commit);
            return;
        }

        let initialized = self.state.lock().initialized;
        if !initialized {
            debug!(composition = self.name(), "not initialized yet, only updating values");
            self.update_start_stop_duration();
            self.post(BusMessage::Committed { changed: true });
            self.post_update_done(seqnum, UpdateReason::Commit);
            return;
        }

        self.update_start_stop_duration();
        {
            let mut state = self.state.lock();
            if state.segment.rate < 0.0 {
                state.segment.stop = position;
            } else {
                state.segment.start = position;
            }
        }
        if let Err(error) = self.update_pipeline(position, seqnum, UpdateReason::Commit) {
            warn!(composition = self.name(), %error, "stack update failed during commit");
        }

        if self.state.lock().current.is_none() {
            info!(
                composition = self.name(),
                "no stack at the current position, commit complete"
            );
            self.post(BusMessage::Committed { changed: true });
        }
        self.post_update_done(seqnum, UpdateReason::Commit);
    }

    /// Stack played out (EOS) or must move on: advance the segment edge to
    /// the boundary and re-run stack selection there.
    fn update_action(self: &Arc<Self>, seqnum: Seqnum, reason: UpdateReason) {
        self.post_start_update(seqnum, reason);

        {
            let mut state = self.state.lock();
            if state.segment.rate < 0.0 {
                let edge = state.current_stack_start;
                state.segment.stop = edge;
            } else {
                let edge = state.current_stack_stop;
                state.segment.start = edge;
            }
        }

        self.seek_handling(seqnum, reason);

        // A segment-flagged seek that ran out of timeline reports
        // segment-done instead of going end-of-stream.
        let state = self.state.lock();
        if state.current.is_none() && state.segment.flags.segment {
            let position = self.real_stop(&state);
            drop(state);
            self.post(BusMessage::SegmentDone { position });
        }

        self.post_update_done(seqnum, reason);
    }

    fn seek_action(self: &Arc<Self>, event: Event) {
        let EventPayload::Seek(seek) = &event.payload else {
            warn!(composition = self.name(), "seek action without a seek event");
            return;
        };
        let seqnum = event.seqnum;
        let initializing_stack = self.shared.initialization_seek_seqnum() == seqnum;
        let reason = if initializing_stack {
            UpdateReason::None
        } else {
            UpdateReason::Seek
        };

        info!(
            composition = self.name(),
            %seqnum,
            start = %seek.start,
            stop = %seek.stop,
            rate = seek.rate,
            initializing_stack,
            "handling seek"
        );

        {
            let mut state = self.state.lock();
            let reverse = seek.is_reverse();
            if initializing_stack {
                // During plain playback only the leading edge of the
                // segment advances from stack to stack; the far edge is
                // wherever the seek (or the timeline end) put it.
                let mut partial = *seek;
                if reverse {
                    partial.start_bound = montex_model::SeekBound::Unset;
                } else {
                    partial.stop_bound = montex_model::SeekBound::Unset;
                }
                state.segment.apply_seek(&partial);
            } else {
                state.segment.apply_seek(seek);
            }
            state.seek_segment.apply_seek(seek);
        }

        if !initializing_stack {
            self.post_start_update(seqnum, UpdateReason::Seek);
        }

        // Crop the segment to the composition interval. The start edge is
        // only cropped when no expandable fills the front.
        {
            let timing = *self.timing.read().live();
            let mut state = self.state.lock();
            if state.expandables.is_empty() {
                state.segment.start = state.segment.start.max_defined(timing.start);
            }
            state.segment.stop = state.segment.stop.min_defined(timing.stop());
        }

        if initializing_stack {
            info!(composition = self.name(), "pausing task to run initializing seek");
            self.pause_task();
        } else {
            self.shared.next_base_time.store(0, Ordering::Release);
            self.shared
                .flush_seqnum
                .store(seqnum.raw(), Ordering::Release);
            self.shared.seek_seqnum.store(seqnum.raw(), Ordering::Release);
        }

        self.seek_handling(seqnum, reason);

        if !initializing_stack {
            self.post_update_done(seqnum, UpdateReason::Seek);
        }
    }

    // ---- seek/update plumbing --------------------------------------------

    /// Rebuild the stack when the playhead left its validity window,
    /// otherwise just seek the current stack in place.
    fn seek_handling(self: &Arc<Self>, seqnum: Seqnum, reason: UpdateReason) {
        debug!(composition = self.name(), %reason, "seek handling");
        if self.have_to_update_stack(reason) {
            let playhead = {
                let state = self.state.lock();
                if state.segment.rate < 0.0 {
                    state.segment.stop
                } else {
                    state.segment.start
                }
            };
            if let Err(error) = self.update_pipeline(playhead, seqnum, reason) {
                warn!(composition = self.name(), %error, "stack update failed");
            }
        } else {
            let descriptor = {
                let state = self.state.lock();
                self.stack_seek_descriptor(&state, false, reason)
            };
            let event = Event::with_seqnum(seqnum, EventPayload::Seek(descriptor));
            self.set_real_eos_seqnum_from_seek(seqnum);
            self.queue.remove_kind(ActionKind::Update);
            self.seek_current_stack(event, reason.flushes_downstream());
        }
    }

    fn have_to_update_stack(&self, reason: UpdateReason) -> bool {
        if reason == UpdateReason::Eos {
            return true;
        }
        let state = self.state.lock();
        debug!(
            composition = self.name(),
            segment_start = %state.segment.start,
            segment_stop = %state.segment.stop,
            stack_start = %state.current_stack_start,
            stack_stop = %state.current_stack_stop,
            "stack reuse check"
        );
        state.segment.start < state.current_stack_start
            || state.segment.start >= state.current_stack_stop
    }

    /// Push a translated seek into the current stack's root.
    pub(crate) fn seek_current_stack(&self, event: Event, flush_downstream: bool) -> bool {
        let Some(target) = self.output_pad().target() else {
            warn!(
                composition = self.name(),
                "cannot seek: no target pad, no children ready or nothing committed"
            );
            return false;
        };
        if flush_downstream {
            self.shared
                .flush_seqnum
                .store(event.seqnum.raw(), Ordering::Release);
            info!(
                composition = self.name(),
                seqnum = %event.seqnum,
                "sending flushes downstream"
            );
        }
        debug!(composition = self.name(), seqnum = %event.seqnum, "seeking current stack");
        target.send_event(event)
    }

    /// Decide whether this stack ends the composition: when no source lies
    /// beyond it, the stack's own EOS is the real one.
    pub(crate) fn set_real_eos_seqnum_from_seek(&self, seqnum: Seqnum) {
        let state = self.state.lock();
        let reverse = state.segment.rate < 0.0;

        let ends_composition = 'check: {
            if reverse {
                if state.current_stack_start.is_none() {
                    break 'check true;
                }
                if state.segment.start != StreamTime::ZERO
                    && state.current_stack_start <= state.segment.start
                    && state.current_stack_stop > state.segment.start
                {
                    break 'check true;
                }
            } else {
                if state.current_stack_stop.is_none() {
                    break 'check true;
                }
                if state.seek_segment.stop.is_some()
                    && state.current_stack_start <= state.segment.stop
                    && state.current_stack_stop >= state.segment.stop
                {
                    break 'check true;
                }
            }

            for object in &state.objects_stop {
                if !object.is_source() {
                    continue;
                }
                let timing = object.live_timing();
                let beyond = if reverse {
                    state.current_stack_start > timing.start
                } else {
                    state.current_stack_stop < timing.stop()
                };
                if beyond {
                    break 'check false;
                }
            }
            true
        };
        drop(state);

        self.shared
            .next_eos_seqnum
            .store(seqnum.raw(), Ordering::Release);
        let real = if ends_composition { seqnum.raw() } else { 0 };
        self.shared.real_eos_seqnum.store(real, Ordering::Release);
        debug!(
            composition = self.name(),
            %seqnum,
            ends_composition,
            "EOS latches armed"
        );
    }

    /// Recompute the stack for `playhead` and either swap it in (flush,
    /// collapse, relink, prime) or seek the unchanged stack in place.
    pub(crate) fn update_pipeline(
        self: &Arc<Self>,
        playhead: StreamTime,
        seqnum: Seqnum,
        reason: UpdateReason,
    ) -> Result<(), EngineError> {
        if playhead.is_none() {
            return Ok(());
        }
        if self.element_state() == crate::flow::ElementState::Null {
            debug!(composition = self.name(), "still null, not updating the stack");
            return Ok(());
        }

        let duration = self.timing.read().live().duration;
        let mut playhead = playhead;
        if duration.is_some() && duration > StreamTime::ZERO && playhead >= duration {
            playhead = duration.saturating_sub(StreamTime::from_nanos(1));
            let mut state = self.state.lock();
            state.segment.start = StreamTime::NONE;
            state.segment.stop = StreamTime::NONE;
        }

        info!(
            composition = self.name(),
            %playhead,
            %reason,
            %seqnum,
            "updating the stack"
        );

        let selection = {
            let state = self.state.lock();
            let builder = StackBuilder {
                objects_start: &state.objects_start,
                objects_stop: &state.objects_stop,
                expandables: &state.expandables,
                reverse: state.segment.rate < 0.0,
                real_start: self.real_start(&state),
                real_stop: self.real_stop(&state),
                composition_stop: self.timing.read().live().stop(),
            };
            builder.select(playhead)
        };

        let selection = match selection {
            Ok(selection) => selection,
            Err(error) => {
                warn!(composition = self.name(), %error, "stack selection failed");
                self.post(BusMessage::Error {
                    error: error.clone(),
                });
                // Leave no stack behind; the flush pairing rules of the
                // teardown still apply.
                self.deactivate_stack(reason);
                self.state.lock().current = None;
                return Err(error);
            }
        };

        let tear_down = {
            let state = self.state.lock();
            let same = match (&state.current, &selection.stack) {
                (Some(a), Some(b)) => a.same_shape(b),
                (None, None) => true,
                _ => false,
            };
            !same
        } || self.downstream_needs_teardown(reason);

        {
            let mut state = self.state.lock();
            if state.segment.rate >= 0.0 {
                state.current_stack_start = playhead;
                state.current_stack_stop = selection.stop;
            } else {
                state.current_stack_start = selection.start;
                state.current_stack_stop = playhead;
            }
        }

        let descriptor = {
            let state = self.state.lock();
            self.stack_seek_descriptor(&state, true, reason)
        };
        let toplevel_seek = Event::with_seqnum(seqnum, EventPayload::Seek(descriptor));
        self.set_real_eos_seqnum_from_seek(seqnum);
        self.queue.remove_kind(ActionKind::Update);

        if tear_down {
            if let Some(stack) = &selection.stack {
                info!(
                    composition = self.name(),
                    "swapping stacks ({reason})\n{}",
                    stack.dump()
                );
            }
            self.deactivate_stack(reason);
            if let Some(stack) = &selection.stack {
                if let Err(error) = self.relink_stack(stack) {
                    self.state.lock().current = None;
                    self.post(BusMessage::Error {
                        error: error.clone(),
                    });
                    return Err(error);
                }
            }
        }

        self.state.lock().current = selection.stack;
        let have_stack = self.state.lock().current.is_some();

        if have_stack {
            self.shared.set_updating_reason(reason);
            self.shared
                .seqnum_to_restart_task
                .store(seqnum.raw(), Ordering::Release);
            info!(
                composition = self.name(),
                "new stack ready, holding the task until the data plane confirms it"
            );
            self.pause_task();
        } else {
            let mut state = self.state.lock();
            if state.objects_start.is_empty() {
                state.current_stack_start = StreamTime::ZERO;
                state.current_stack_stop = StreamTime::NONE;
                if let Some((pad, probe)) = state.output_probe.take() {
                    pad.remove_probe(probe);
                }
                drop(state);
                self.output_pad().set_target(None);
            }
            debug!(composition = self.name(), "nothing in the composition, update complete");
        }

        if tear_down {
            self.activate_new_stack(toplevel_seek)
        } else {
            self.seek_current_stack(toplevel_seek, reason.flushes_downstream());
            Ok(())
        }
    }

    fn downstream_needs_teardown(&self, reason: UpdateReason) -> bool {
        let mut query = Query::NeedsTeardown {
            reason: match reason {
                UpdateReason::Initialize => "Initialize",
                UpdateReason::Commit => "Commit",
                UpdateReason::Eos => "EOS",
                UpdateReason::Seek => "Seek",
                UpdateReason::None => "None",
            },
            result: false,
        };
        if !self.output_pad().peer_query(&mut query) {
            return false;
        }
        matches!(query, Query::NeedsTeardown { result: true, .. })
    }

    /// Resume action processing after the data plane confirmed the stack.
    /// Called from the output probe (data threads) and from flush-stop
    /// handling.
    pub(crate) fn restart_task(&self) {
        let reason = self.shared.updating_reason();
        info!(composition = self.name(), %reason, "restarting task, update done");

        if reason == UpdateReason::Commit {
            self.queue.push(
                crate::queue::ActionPriority::High,
                Action::EmitCommitted { changed: true },
            );
        }

        self.shared.seqnum_to_restart_task.store(0, Ordering::Release);
        self.shared
            .waiting_serialized_query_or_buffer
            .store(false, Ordering::Release);
        *self.shared.stack_initialization_seek.lock() = None;
        self.shared.set_updating_reason(UpdateReason::None);
        self.queue.resume();
    }

    /// Whether this event is the confirmation the paused task waits for.
    /// Events other than EOS first require a buffer or serialized query to
    /// prove the stack flows.
    pub(crate) fn is_ready_to_restart_task(&self, event: &Event) -> bool {
        let wanted = self.shared.seqnum_to_restart_task.load(Ordering::Acquire);
        if wanted == 0 {
            return false;
        }
        if event.seqnum.raw() != wanted {
            info!(
                composition = self.name(),
                kind = event.kind(),
                seqnum = %event.seqnum,
                wanted,
                "event seqnum does not match the restart slot"
            );
            return false;
        }
        if matches!(event.payload, EventPayload::Eos) {
            info!(composition = self.name(), "stack reconfiguration done (EOS)");
            return true;
        }
        self.shared
            .waiting_serialized_query_or_buffer
            .store(true, Ordering::Release);
        false
    }
}

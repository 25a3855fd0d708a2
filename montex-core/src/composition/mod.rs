//! The composition: a timed container that behaves externally as a single
//! source, and the serialized controller that keeps its active stack in
//! sync with the timeline.

mod controller;
mod probe;
mod relink;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, mpsc};
use std::thread::{JoinHandle, ThreadId};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use montex_model::{EngineError, SeekDescriptor, StreamTime, TimingPair};

use crate::flow::{
    Bin, CapsFilter, ElementState, Event, EventPayload, Pad, PadDirection, ProbeId, Query, Segment,
    Seqnum, StreamElement,
};
use crate::object::TimedObject;
use crate::queue::{Action, ActionPriority, ActionQueue};
use crate::stack::StackNode;

/// Why the stack is being touched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum UpdateReason {
    /// First transition from stopped to ready-to-play.
    Initialize,
    /// Timeline mutation took effect.
    Commit,
    /// The current stack played out.
    Eos,
    /// A downstream seek was received.
    Seek,
    /// An in-flight stack-initialization seek.
    None,
}

impl UpdateReason {
    pub(crate) fn flushes_downstream(self) -> bool {
        matches!(
            self,
            UpdateReason::Commit | UpdateReason::Seek | UpdateReason::Initialize
        )
    }

    fn to_u8(self) -> u8 {
        match self {
            UpdateReason::Initialize => 0,
            UpdateReason::Commit => 1,
            UpdateReason::Eos => 2,
            UpdateReason::Seek => 3,
            UpdateReason::None => 4,
        }
    }

    fn from_u8(raw: u8) -> UpdateReason {
        match raw {
            0 => UpdateReason::Initialize,
            1 => UpdateReason::Commit,
            2 => UpdateReason::Eos,
            3 => UpdateReason::Seek,
            _ => UpdateReason::None,
        }
    }
}

impl fmt::Display for UpdateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpdateReason::Initialize => "Initialize",
            UpdateReason::Commit => "Commit",
            UpdateReason::Eos => "EOS",
            UpdateReason::Seek => "Seek",
            UpdateReason::None => "None",
        };
        f.write_str(name)
    }
}

/// Structured messages posted on the composition bus.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BusMessage {
    /// `composition-start-update`: a stack-touching operation began.
    StartUpdate {
        reason: UpdateReason,
        seqnum: Seqnum,
    },
    /// `composition-update-done` with the same reason.
    UpdateDone {
        reason: UpdateReason,
        seqnum: Seqnum,
    },
    /// Raised from the controller thread once a commit (and any stack
    /// rebuild it caused) has completed.
    Committed { changed: bool },
    DurationChanged { duration: StreamTime },
    /// A segment-flagged seek ran out of timeline.
    SegmentDone { position: StreamTime },
    Error { error: EngineError },
}

/// State the output probe and the controller exchange. Probe callbacks run
/// on data threads and only ever flip these atomics, enqueue actions or
/// resume the task; the object lists and the stack stay controller-only.
pub(crate) struct ProbeShared {
    pub flush_seqnum: AtomicU32,
    pub seek_seqnum: AtomicU32,
    pub real_eos_seqnum: AtomicU32,
    pub next_eos_seqnum: AtomicU32,
    pub seqnum_to_restart_task: AtomicU32,
    pub waiting_serialized_query_or_buffer: AtomicBool,
    pub stack_initialization_seek: Mutex<Option<Event>>,
    pub stack_initialization_seek_sent: AtomicBool,
    pub send_stream_start: AtomicBool,
    pub next_base_time: AtomicU64,
    pub updating_reason: AtomicU8,
    pub tearing_down_stack: AtomicBool,
    pub suppress_child_error: AtomicBool,
}

impl ProbeShared {
    fn new() -> ProbeShared {
        ProbeShared {
            flush_seqnum: AtomicU32::new(0),
            seek_seqnum: AtomicU32::new(0),
            real_eos_seqnum: AtomicU32::new(0),
            next_eos_seqnum: AtomicU32::new(0),
            seqnum_to_restart_task: AtomicU32::new(0),
            waiting_serialized_query_or_buffer: AtomicBool::new(false),
            stack_initialization_seek: Mutex::new(None),
            stack_initialization_seek_sent: AtomicBool::new(false),
            send_stream_start: AtomicBool::new(false),
            next_base_time: AtomicU64::new(0),
            updating_reason: AtomicU8::new(UpdateReason::None.to_u8()),
            tearing_down_stack: AtomicBool::new(false),
            suppress_child_error: AtomicBool::new(false),
        }
    }

    pub fn updating_reason(&self) -> UpdateReason {
        UpdateReason::from_u8(self.updating_reason.load(Ordering::Acquire))
    }

    pub fn set_updating_reason(&self, reason: UpdateReason) {
        self.updating_reason.store(reason.to_u8(), Ordering::Release);
    }

    pub fn seek_seqnum(&self) -> Seqnum {
        Seqnum::from_raw(self.seek_seqnum.load(Ordering::Acquire))
    }

    pub fn flush_seqnum_value(&self) -> Seqnum {
        Seqnum::from_raw(self.flush_seqnum.load(Ordering::Acquire))
    }

    pub fn initialization_seek_seqnum(&self) -> Seqnum {
        self.stack_initialization_seek
            .lock()
            .as_ref()
            .map_or(Seqnum::NONE, |event| event.seqnum)
    }
}

/// Controller-plane state. Mutated only on the controller thread; short
/// read access elsewhere goes through the same mutex.
pub(crate) struct CompState {
    pub objects_start: Vec<Arc<TimedObject>>,
    pub objects_stop: Vec<Arc<TimedObject>>,
    pub expandables: Vec<Arc<TimedObject>>,
    /// Objects awaiting add/remove reconciliation at the next commit.
    pub pending_io: Vec<Arc<TimedObject>>,
    pub current: Option<StackNode>,
    pub segment: Segment,
    pub seek_segment: Segment,
    pub current_stack_start: StreamTime,
    pub current_stack_stop: StreamTime,
    pub initialized: bool,
    /// Probe installed on the ghost target of the output pad.
    pub output_probe: Option<(Arc<Pad>, ProbeId)>,
}

impl CompState {
    fn new() -> CompState {
        CompState {
            objects_start: Vec::new(),
            objects_stop: Vec::new(),
            expandables: Vec::new(),
            pending_io: Vec::new(),
            current: None,
            segment: Segment::default(),
            seek_segment: Segment::default(),
            current_stack_start: StreamTime::NONE,
            current_stack_stop: StreamTime::NONE,
            initialized: false,
            output_probe: None,
        }
    }

    pub fn contains(&self, object: &Arc<TimedObject>) -> bool {
        self.objects_start.iter().any(|o| Arc::ptr_eq(o, object))
            || self.expandables.iter().any(|o| Arc::ptr_eq(o, object))
    }

    pub fn pending_io_contains(&self, object: &Arc<TimedObject>) -> bool {
        self.pending_io.iter().any(|o| Arc::ptr_eq(o, object))
    }

    /// Whether the object is part of the currently active stack.
    pub fn in_current_stack(&self, object: &Arc<TimedObject>) -> bool {
        let Some(current) = &self.current else {
            return false;
        };
        let mut found = false;
        current.visit(&mut |node| {
            if Arc::ptr_eq(&node.object, object) {
                found = true;
            }
        });
        found
    }

    pub fn sort_object_lists(&mut self) {
        self.objects_start
            .sort_by_key(|o| (o.live_timing().start, o.live_timing().priority));
        self.objects_stop.sort_by_key(|o| {
            (
                std::cmp::Reverse(o.live_timing().stop()),
                o.live_timing().priority,
            )
        });
    }
}

struct TaskHandle {
    join: JoinHandle<()>,
    thread_id: ThreadId,
}

pub(crate) struct CompositionInner {
    name: String,
    id: Mutex<String>,
    drop_tags: AtomicBool,
    caps: Mutex<CapsFilter>,
    src_pad: Arc<Pad>,
    pub(crate) queue: ActionQueue,
    task: Mutex<Option<TaskHandle>>,
    pub(crate) state: Mutex<CompState>,
    pub(crate) shared: ProbeShared,
    /// The composition's own start/stop/duration, recomputed at commit.
    pub(crate) timing: RwLock<TimingPair>,
    element_state: Mutex<ElementState>,
    pub(crate) bin: Bin,
    bus_tx: mpsc::Sender<BusMessage>,
    bus_rx: Mutex<Option<mpsc::Receiver<BusMessage>>>,
}

/// A non-linear composition of timed objects, exposed to downstream code
/// as a single source with one output pad.
#[derive(Clone)]
pub struct Composition {
    inner: Arc<CompositionInner>,
}

impl fmt::Debug for Composition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Composition")
            .field("name", &self.inner.name)
            .field("id", &*self.inner.id.lock())
            .field("state", &*self.inner.element_state.lock())
            .finish_non_exhaustive()
    }
}

impl Composition {
    pub fn new(name: impl Into<String>) -> Composition {
        let name = name.into();
        let (bus_tx, bus_rx) = mpsc::channel();
        let src_pad = Pad::new(format!("{name}.src"), PadDirection::Src);
        let inner = Arc::new(CompositionInner {
            id: Mutex::new(format!("{name}-{}", Uuid::new_v4())),
            drop_tags: AtomicBool::new(true),
            caps: Mutex::new(CapsFilter::any()),
            src_pad,
            queue: ActionQueue::new(),
            task: Mutex::new(None),
            state: Mutex::new(CompState::new()),
            shared: ProbeShared::new(),
            timing: RwLock::new(TimingPair::default()),
            element_state: Mutex::new(ElementState::Null),
            bin: Bin::new(format!("{name}.current-bin")),
            bus_tx,
            bus_rx: Mutex::new(Some(bus_rx)),
            name,
        });
        inner.install_output_pad_handlers();
        Composition { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The stream id stamped on every outgoing stream-start.
    pub fn id(&self) -> String {
        self.inner.id.lock().clone()
    }

    pub fn set_id(&self, id: impl Into<String>) {
        *self.inner.id.lock() = id.into();
    }

    pub fn drop_tags(&self) -> bool {
        self.inner.drop_tags.load(Ordering::Acquire)
    }

    pub fn set_drop_tags(&self, drop_tags: bool) {
        self.inner.drop_tags.store(drop_tags, Ordering::Release);
    }

    pub fn caps(&self) -> CapsFilter {
        self.inner.caps.lock().clone()
    }

    pub fn set_caps(&self, caps: CapsFilter) {
        *self.inner.caps.lock() = caps;
    }

    /// The single output pad on which the composed stream appears.
    pub fn src_pad(&self) -> Arc<Pad> {
        Arc::clone(&self.inner.src_pad)
    }

    /// Take the bus receiver. Yields every structured message the engine
    /// posts; can only be taken once.
    pub fn bus(&self) -> mpsc::Receiver<BusMessage> {
        self.inner
            .bus_rx
            .lock()
            .take()
            .expect("composition bus was already taken")
    }

    /// Current composition start, as recomputed at the last commit.
    pub fn start(&self) -> StreamTime {
        self.inner.timing.read().live().start
    }

    pub fn stop(&self) -> StreamTime {
        self.inner.timing.read().live().stop()
    }

    pub fn duration(&self) -> StreamTime {
        self.inner.timing.read().live().duration
    }

    /// Schedule an object for addition. The object only becomes part of
    /// the composition at the next commit.
    pub fn add_object(&self, object: Arc<TimedObject>) {
        debug!(
            composition = self.inner.name,
            object = object.name(),
            "scheduling object addition"
        );
        object.set_in_composition(true);
        self.inner
            .queue
            .push(ActionPriority::Default, Action::AddObject { object });
    }

    /// Schedule an object for removal at the next commit.
    pub fn remove_object(&self, object: Arc<TimedObject>) {
        debug!(
            composition = self.inner.name,
            object = object.name(),
            "scheduling object removal"
        );
        self.inner
            .queue
            .push(ActionPriority::Default, Action::RemoveObject { object });
    }

    /// Trigger the commit pathway: pending timing becomes live, pending
    /// adds/removes are reconciled and the stack is updated if the
    /// playhead left its validity interval. The `committed` bus message
    /// reports completion.
    pub fn commit(&self) {
        let seqnum = Seqnum::next();
        info!(composition = self.inner.name, %seqnum, "commit requested");
        self.inner
            .queue
            .push(ActionPriority::Default, Action::Commit { seqnum });
    }

    pub fn state(&self) -> ElementState {
        *self.inner.element_state.lock()
    }

    /// Step the composition through the state machine to `target`.
    pub fn set_state(&self, target: ElementState) -> Result<(), EngineError> {
        loop {
            let current = self.state();
            if current == target {
                return Ok(());
            }
            let next = if target > current {
                match current {
                    ElementState::Null => ElementState::Ready,
                    ElementState::Ready => ElementState::Paused,
                    _ => ElementState::Playing,
                }
            } else {
                match current {
                    ElementState::Playing => ElementState::Paused,
                    ElementState::Paused => ElementState::Ready,
                    _ => ElementState::Null,
                }
            };
            self.inner.transition(current, next)?;
            *self.inner.element_state.lock() = next;
        }
    }

    /// Convenience: drive the composition to playing.
    pub fn play(&self) -> Result<(), EngineError> {
        self.set_state(ElementState::Playing)
    }

    pub fn current_stack_interval(&self) -> (StreamTime, StreamTime) {
        let state = self.inner.state.lock();
        (state.current_stack_start, state.current_stack_stop)
    }
}

impl CompositionInner {
    pub(crate) fn post(&self, message: BusMessage) {
        debug!(composition = self.name, ?message, "bus message");
        let _ = self.bus_tx.send(message);
    }

    pub(crate) fn post_start_update(&self, seqnum: Seqnum, reason: UpdateReason) {
        self.post(BusMessage::StartUpdate { reason, seqnum });
    }

    pub(crate) fn post_update_done(&self, seqnum: Seqnum, reason: UpdateReason) {
        self.post(BusMessage::UpdateDone { reason, seqnum });
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn stream_id(&self) -> String {
        self.id.lock().clone()
    }

    pub(crate) fn drops_tags(&self) -> bool {
        self.drop_tags.load(Ordering::Acquire)
    }

    pub(crate) fn composition_caps(&self) -> CapsFilter {
        self.caps.lock().clone()
    }

    pub(crate) fn output_pad(&self) -> Arc<Pad> {
        Arc::clone(&self.src_pad)
    }

    pub(crate) fn element_state(&self) -> ElementState {
        *self.element_state.lock()
    }

    /// Install the seek/QoS/query handlers on the output pad.
    fn install_output_pad_handlers(self: &Arc<Self>) {
        let for_events = Arc::downgrade(self);
        self.src_pad.set_event_handler(move |pad, event| {
            let Some(inner) = for_events.upgrade() else {
                return false;
            };
            match &event.payload {
                EventPayload::Seek(_) => {
                    inner.enqueue_seek(event);
                    true
                }
                EventPayload::Qos { timestamp, jitter } => {
                    match inner.translate_qos(*timestamp, *jitter) {
                        Some(translated) => pad.route_event_upstream(Event::with_seqnum(
                            event.seqnum,
                            translated,
                        )),
                        // Outside the currently configured stack: consumed.
                        None => true,
                    }
                }
                _ => pad.route_event_upstream(event),
            }
        });

        let for_queries = Arc::downgrade(self);
        self.src_pad.set_query_handler(move |pad, query| {
            let Some(inner) = for_queries.upgrade() else {
                return false;
            };
            match query {
                Query::Duration { result } => {
                    *result = Some(inner.timing.read().live().duration);
                    true
                }
                Query::ParentComposition { result } => {
                    *result = Some(inner.stream_id());
                    true
                }
                _ => pad.route_query_upstream(query),
            }
        });
    }

    /// Queue up a seek action unless its seqnum was already scheduled.
    fn enqueue_seek(&self, event: Event) {
        let next_eos = Seqnum::from_raw(self.shared.next_eos_seqnum.load(Ordering::Acquire));
        if self.queue.push_seek_idempotent(event, next_eos) {
            self.shared.next_eos_seqnum.store(0, Ordering::Release);
            self.shared.real_eos_seqnum.store(0, Ordering::Release);
            self.shared.seek_seqnum.store(0, Ordering::Release);
        }
    }

    /// Translate a QoS running timestamp from downstream into the current
    /// stack's coordinates. Returns `None` when the feedback predates the
    /// configured stack.
    fn translate_qos(&self, timestamp: StreamTime, jitter: i64) -> Option<EventPayload> {
        let state = self.state.lock();
        if state.seek_segment.start.is_none() {
            return Some(EventPayload::Qos { timestamp, jitter });
        }
        let curdiff = if state.segment.rate < 0.0 {
            state
                .seek_segment
                .stop
                .saturating_sub(state.current_stack_stop)
        } else {
            state
                .current_stack_start
                .saturating_sub(state.seek_segment.start)
        };
        drop(state);

        if curdiff.is_none() || curdiff == StreamTime::ZERO {
            return Some(EventPayload::Qos { timestamp, jitter });
        }
        let floor = timestamp.saturating_add(StreamTime::from_nanos(jitter.max(0) as u64));
        if timestamp < curdiff || curdiff > floor {
            debug!(composition = self.name, "QoS outside the current stack, discarding");
            return None;
        }
        Some(EventPayload::Qos {
            timestamp: timestamp.saturating_sub(curdiff),
            jitter,
        })
    }

    // ---- task control -----------------------------------------------------

    pub(crate) fn start_task(self: &Arc<Self>) {
        self.queue.set_running(true);
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let inner = Arc::clone(self);
        let join = std::thread::Builder::new()
            .name(format!("{}-update", self.name))
            .spawn(move || {
                debug!(composition = inner.name, "update task running");
                while let Some(action) = inner.queue.wait_next() {
                    inner.execute(action);
                    inner.queue.finish_current();
                }
                debug!(composition = inner.name, "update task exiting");
            })
            .expect("spawning the update task");
        let thread_id = join.thread().id();
        *task = Some(TaskHandle { join, thread_id });
    }

    /// Cooperative stop: flag, wake, join. Joining from the task's own
    /// thread is refused and the task is left installed for a retry.
    pub(crate) fn stop_task(&self) -> Result<(), EngineError> {
        self.queue.set_running(false);
        let handle = {
            let mut task = self.task.lock();
            match task.as_ref() {
                None => return Ok(()),
                Some(existing) if existing.thread_id == std::thread::current().id() => {
                    warn!(composition = self.name, "stop requested from the task thread");
                    return Err(EngineError::JoinFromOwnThread);
                }
                Some(_) => task.take().expect("checked above"),
            }
        };
        let _ = handle.join.join();
        Ok(())
    }

    /// Park the task after the current action. Released by the output
    /// probe once the new stack proves itself.
    pub(crate) fn pause_task(&self) {
        debug!(composition = self.name, "pausing update task");
        self.queue.pause();
    }

    // ---- lifecycle --------------------------------------------------------

    fn transition(
        self: &Arc<Self>,
        from: ElementState,
        to: ElementState,
    ) -> Result<(), EngineError> {
        use ElementState::*;
        info!(composition = self.name, %from, %to, "state change");
        match (from, to) {
            (Null, Ready) => {
                self.for_each_object(|object| {
                    if let Err(err) = object.set_state(Ready) {
                        warn!(composition = self.name, error = %err, "child refused ready");
                    }
                });
                self.start_task();
            }
            (Ready, Paused) => {
                let seqnum = Seqnum::next();
                self.queue
                    .push(ActionPriority::Default, Action::InitializeStack { seqnum });
            }
            (Paused, Playing) | (Playing, Paused) => {}
            (Paused, Ready) => {
                if self.stop_task().is_err() {
                    return Err(EngineError::JoinFromOwnThread);
                }
                self.queue.remove_kind(crate::queue::ActionKind::Update);
                self.queue.remove_kind(crate::queue::ActionKind::Seek);
                self.deactivate_stack(UpdateReason::Commit);
                self.reset();
                // Still able to process actions in ready.
                self.start_task();
            }
            (Ready, Null) => {
                if self.stop_task().is_err() {
                    return Err(EngineError::JoinFromOwnThread);
                }
                self.queue.remove_kind(crate::queue::ActionKind::Update);
                self.queue.remove_kind(crate::queue::ActionKind::Seek);
                self.for_each_object(|object| {
                    if let Err(err) = object.set_state(Null) {
                        warn!(composition = self.name, error = %err, "child refused null");
                    }
                });
                let _ = self.bin.set_state(Null);
            }
            _ => {}
        }
        Ok(())
    }

    fn for_each_object(&self, mut f: impl FnMut(&Arc<TimedObject>)) {
        let state = self.state.lock();
        let objects: Vec<Arc<TimedObject>> = state
            .objects_start
            .iter()
            .chain(state.expandables.iter())
            .cloned()
            .collect();
        drop(state);
        for object in &objects {
            f(object);
        }
    }

    /// Return to pristine timing/protocol state. The object set survives.
    fn reset(&self) {
        debug!(composition = self.name, "resetting");
        let mut state = self.state.lock();
        state.current = None;
        state.current_stack_start = StreamTime::NONE;
        state.current_stack_stop = StreamTime::NONE;
        state.segment = Segment::default();
        state.seek_segment = Segment::default();
        state.initialized = false;
        if let Some((pad, probe)) = state.output_probe.take() {
            pad.remove_probe(probe);
        }
        drop(state);

        self.shared.next_base_time.store(0, Ordering::Release);
        self.shared.flush_seqnum.store(0, Ordering::Release);
        self.shared.seek_seqnum.store(0, Ordering::Release);
        self.shared.real_eos_seqnum.store(0, Ordering::Release);
        self.shared.next_eos_seqnum.store(0, Ordering::Release);
        self.shared.seqnum_to_restart_task.store(0, Ordering::Release);
        self.shared
            .waiting_serialized_query_or_buffer
            .store(false, Ordering::Release);
        *self.shared.stack_initialization_seek.lock() = None;
        self.shared
            .stack_initialization_seek_sent
            .store(false, Ordering::Release);

        self.src_pad.set_target(None);
        self.bin.set_state_locked(true);
        self.bin.clear();
        self.bin.set_state_locked(false);
    }

    /// The seek descriptor that would prime the current stack.
    pub(crate) fn stack_seek_descriptor(
        &self,
        state: &CompState,
        initial: bool,
        reason: UpdateReason,
    ) -> SeekDescriptor {
        let mut flags = montex_model::SeekFlags::ACCURATE_FLUSH;
        if !initial {
            flags.segment = state.segment.flags.segment;
        }

        let (start, stop) = if matches!(reason, UpdateReason::Initialize | UpdateReason::Eos) {
            (state.current_stack_start, state.current_stack_stop)
        } else {
            (
                state
                    .segment
                    .start
                    .max_defined(state.current_stack_start)
                    .or(state.current_stack_start),
                state
                    .segment
                    .stop
                    .min_defined(state.current_stack_stop)
                    .or(state.current_stack_stop),
            )
        };

        SeekDescriptor {
            rate: state.segment.rate,
            flags,
            ..SeekDescriptor::flushing(start, stop)
        }
    }
}

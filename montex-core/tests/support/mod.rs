//! Fake stream elements and a collecting sink for driving the engine in
//! integration tests.
#![allow(dead_code)]

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use montex_core::composition::{BusMessage, Composition};
use montex_core::flow::{
    Buffer, ElementState, Event, EventPayload, FlowItem, Pad, PadDirection, Query, Segment, Seqnum,
    StateChangeError, StreamElement,
};
use montex_model::{SeekDescriptor, StreamTime};

/// Install the test log subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Spin until `cond` holds or the timeout passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// Drain the bus until a message matching `pred` shows up, returning
/// everything received up to and including it.
pub fn collect_until(
    bus: &std::sync::mpsc::Receiver<BusMessage>,
    timeout: Duration,
    mut pred: impl FnMut(&BusMessage) -> bool,
) -> Vec<BusMessage> {
    let deadline = Instant::now() + timeout;
    let mut seen = Vec::new();
    loop {
        let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
            return seen;
        };
        match bus.recv_timeout(remaining) {
            Ok(message) => {
                let done = pred(&message);
                seen.push(message);
                if done {
                    return seen;
                }
            }
            Err(_) => return seen,
        }
    }
}

/// Drain the bus until a message matching `pred` shows up.
pub fn wait_for_message(
    bus: &std::sync::mpsc::Receiver<BusMessage>,
    timeout: Duration,
    mut pred: impl FnMut(&BusMessage) -> bool,
) -> Option<BusMessage> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.checked_duration_since(Instant::now())?;
        match bus.recv_timeout(remaining) {
            Ok(message) if pred(&message) => return Some(message),
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

struct ActiveSegment {
    seqnum: Seqnum,
    segment: Segment,
    position: StreamTime,
}

/// A producer that answers seeks with the flush/segment/buffer protocol a
/// well-behaved source follows, and lets the test pump buffers at will.
pub struct FakeProducer {
    name: String,
    src: Arc<Pad>,
    state: Mutex<ElementState>,
    active: Mutex<Option<ActiveSegment>>,
    seeks: Mutex<Vec<(Seqnum, SeekDescriptor)>>,
    flushes: Mutex<Vec<(Seqnum, &'static str)>>,
    buffer_duration: StreamTime,
}

impl FakeProducer {
    pub fn new(name: &str, buffer_duration: StreamTime) -> Arc<FakeProducer> {
        Arc::new_cyclic(|weak: &Weak<FakeProducer>| {
            let src = Pad::new(format!("{name}.src"), PadDirection::Src);

            let for_events = weak.clone();
            src.set_event_handler(move |_, event| {
                let Some(producer) = for_events.upgrade() else {
                    return false;
                };
                match event.payload.clone() {
                    EventPayload::Seek(seek) => {
                        producer.handle_seek(event.seqnum, &seek);
                        true
                    }
                    _ => true,
                }
            });

            let for_queries = weak.clone();
            src.set_query_handler(move |_, query| {
                let Some(producer) = for_queries.upgrade() else {
                    return false;
                };
                match query {
                    Query::Position { result } => {
                        let active = producer.active.lock();
                        match active.as_ref() {
                            Some(active) => {
                                *result = Some(active.position);
                                true
                            }
                            None => false,
                        }
                    }
                    _ => false,
                }
            });

            FakeProducer {
                name: name.to_string(),
                src,
                state: Mutex::new(ElementState::Null),
                active: Mutex::new(None),
                seeks: Mutex::new(Vec::new()),
                flushes: Mutex::new(Vec::new()),
                buffer_duration,
            }
        })
    }

    fn handle_seek(&self, seqnum: Seqnum, seek: &SeekDescriptor) {
        self.seeks.lock().push((seqnum, *seek));

        if seek.flags.flush {
            self.flushes.lock().push((seqnum, "flush-start"));
            self.src.push(FlowItem::Event(Event::with_seqnum(
                seqnum,
                EventPayload::FlushStart,
            )));
            self.flushes.lock().push((seqnum, "flush-stop"));
            self.src.push(FlowItem::Event(Event::with_seqnum(
                seqnum,
                EventPayload::FlushStop { reset_time: true },
            )));
        }

        // Sticky events travel again after a flush.
        self.src.push(FlowItem::Event(Event::new(EventPayload::StreamStart {
            stream_id: format!("{}-stream", self.name),
        })));

        let mut segment = Segment::default();
        segment.apply_seek(seek);
        let position = if segment.is_reverse() {
            segment.stop
        } else {
            segment.start
        };
        *self.active.lock() = Some(ActiveSegment {
            seqnum,
            segment,
            position,
        });
        self.src.push(FlowItem::Event(Event::with_seqnum(
            seqnum,
            EventPayload::Segment(segment),
        )));

        // Preroll one buffer so downstream proves the stack flows.
        self.emit_one();
    }

    fn preroll(&self) {
        self.src.push(FlowItem::Event(Event::new(EventPayload::StreamStart {
            stream_id: format!("{}-stream", self.name),
        })));
        let segment = match self.active.lock().as_ref() {
            Some(active) => active.segment,
            None => {
                let segment = Segment::default();
                *self.active.lock() = Some(ActiveSegment {
                    seqnum: Seqnum::NONE,
                    segment,
                    position: StreamTime::ZERO,
                });
                segment
            }
        };
        self.src
            .push(FlowItem::Event(Event::new(EventPayload::Segment(segment))));
        self.emit_one();
    }

    /// Push the next buffer of the active segment. Returns false once the
    /// segment is exhausted.
    pub fn emit_one(&self) -> bool {
        let buffer = {
            let mut guard = self.active.lock();
            let Some(active) = guard.as_mut() else {
                return false;
            };
            if active.segment.stop.is_some() && active.position >= active.segment.stop {
                return false;
            }
            let remaining = active
                .segment
                .stop
                .checked_sub(active.position)
                .unwrap_or(self.buffer_duration);
            let duration = self.buffer_duration.min_defined(remaining);
            let buffer = Buffer::new(active.position, duration);
            active.position = active.position.saturating_add(duration);
            buffer
        };
        self.src.push(FlowItem::Buffer(buffer));
        true
    }

    /// Pump every remaining buffer of the active segment, then end the
    /// stream with the seek's seqnum.
    pub fn pump_to_eos(&self) {
        while self.emit_one() {}
        let seqnum = self
            .active
            .lock()
            .as_ref()
            .map_or(Seqnum::NONE, |active| active.seqnum);
        self.src
            .push(FlowItem::Event(Event::with_seqnum(seqnum, EventPayload::Eos)));
    }

    pub fn seeks(&self) -> Vec<(Seqnum, SeekDescriptor)> {
        self.seeks.lock().clone()
    }

    pub fn seek_count(&self) -> usize {
        self.seeks.lock().len()
    }

    pub fn last_seek(&self) -> Option<(Seqnum, SeekDescriptor)> {
        self.seeks.lock().last().copied()
    }

    /// Flush events this producer emitted, in order.
    pub fn flushes(&self) -> Vec<(Seqnum, &'static str)> {
        self.flushes.lock().clone()
    }

    pub fn wait_for_seek(&self, count: usize) -> bool {
        wait_until(Duration::from_secs(2), || self.seek_count() >= count)
    }
}

impl StreamElement for FakeProducer {
    fn name(&self) -> &str {
        &self.name
    }

    fn src_pad(&self) -> Arc<Pad> {
        Arc::clone(&self.src)
    }

    fn set_state(&self, state: ElementState) -> Result<(), StateChangeError> {
        let previous = *self.state.lock();
        if state.is_rolling() {
            self.src.set_active(true);
        } else {
            self.src.set_active(false);
            *self.active.lock() = None;
        }
        *self.state.lock() = state;
        if state.is_rolling() && !previous.is_rolling() {
            self.preroll();
        }
        Ok(())
    }

    fn state(&self) -> ElementState {
        *self.state.lock()
    }
}

/// An N-input/1-output transform that forwards whatever its inputs carry
/// and fans incoming seeks out to every linked input.
pub struct FakeFilter {
    name: String,
    src: Arc<Pad>,
    sinks: Mutex<Vec<Arc<Pad>>>,
    dynamic: bool,
    state: Mutex<ElementState>,
    priorities: Mutex<Vec<u32>>,
}

impl FakeFilter {
    pub fn with_static_sinks(name: &str, sink_count: usize) -> Arc<FakeFilter> {
        Self::build(name, false, sink_count)
    }

    pub fn with_request_sinks(name: &str) -> Arc<FakeFilter> {
        Self::build(name, true, 0)
    }

    fn build(name: &str, dynamic: bool, static_sinks: usize) -> Arc<FakeFilter> {
        Arc::new_cyclic(|weak: &Weak<FakeFilter>| {
            let src = Pad::new(format!("{name}.src"), PadDirection::Src);
            let for_events = weak.clone();
            src.set_event_handler(move |_, event| {
                let Some(filter) = for_events.upgrade() else {
                    return false;
                };
                match event.payload {
                    EventPayload::Seek(_) => {
                        let sinks = filter.sinks.lock().clone();
                        let mut sent = false;
                        for sink in sinks {
                            sent |= sink.send_event(event.clone());
                        }
                        sent
                    }
                    _ => true,
                }
            });

            let sinks = (0..static_sinks)
                .map(|index| Self::forwarding_sink(name, index, &src))
                .collect();

            FakeFilter {
                name: name.to_string(),
                src,
                sinks: Mutex::new(sinks),
                dynamic,
                state: Mutex::new(ElementState::Null),
                priorities: Mutex::new(Vec::new()),
            }
        })
    }

    fn forwarding_sink(name: &str, index: usize, src: &Arc<Pad>) -> Arc<Pad> {
        let pad = Pad::new(format!("{name}.sink{index}"), PadDirection::Sink);
        let src = Arc::clone(src);
        pad.set_chain(move |_, item| {
            src.push(item);
        });
        pad
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.lock().len()
    }

    pub fn priorities(&self) -> Vec<u32> {
        self.priorities.lock().clone()
    }
}

impl StreamElement for FakeFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn src_pad(&self) -> Arc<Pad> {
        Arc::clone(&self.src)
    }

    fn sink_pads(&self) -> Vec<Arc<Pad>> {
        self.sinks.lock().clone()
    }

    fn request_sink_pad(&self) -> Option<Arc<Pad>> {
        if !self.dynamic {
            return None;
        }
        let index = self.sinks.lock().len();
        let pad = Self::forwarding_sink(&self.name, index, &self.src);
        pad.set_active(self.state.lock().is_rolling());
        self.sinks.lock().push(Arc::clone(&pad));
        Some(pad)
    }

    fn release_sink_pad(&self, pad: &Arc<Pad>) {
        self.sinks.lock().retain(|sink| !Arc::ptr_eq(sink, pad));
    }

    fn set_state(&self, state: ElementState) -> Result<(), StateChangeError> {
        let rolling = state.is_rolling();
        self.src.set_active(rolling);
        for sink in self.sinks.lock().iter() {
            sink.set_active(rolling);
        }
        *self.state.lock() = state;
        Ok(())
    }

    fn state(&self) -> ElementState {
        *self.state.lock()
    }

    fn input_priority_changed(&self, _pad: &Arc<Pad>, priority: u32) {
        self.priorities.lock().push(priority);
    }
}

/// The downstream consumer: collects everything the composition outputs
/// and answers the position / needs-teardown queries.
pub struct Harness {
    pub sink: Arc<Pad>,
    items: Arc<Mutex<Vec<FlowItem>>>,
    position: Arc<Mutex<StreamTime>>,
}

impl Harness {
    pub fn new() -> Harness {
        init_tracing();
        let sink = Pad::new("harness.sink", PadDirection::Sink);
        let items = Arc::new(Mutex::new(Vec::new()));
        let position = Arc::new(Mutex::new(StreamTime::NONE));

        let collected = Arc::clone(&items);
        sink.set_chain(move |_, item| collected.lock().push(item));

        let answered = Arc::clone(&position);
        sink.set_query_handler(move |_, query| match query {
            Query::Position { result } => {
                let position = *answered.lock();
                if position.is_none() {
                    false
                } else {
                    *result = Some(position);
                    true
                }
            }
            Query::NeedsTeardown { result, .. } => {
                *result = false;
                true
            }
            _ => false,
        });

        Harness {
            sink,
            items,
            position,
        }
    }

    pub fn connect(&self, composition: &Composition) {
        Pad::link(&composition.src_pad(), &self.sink);
    }

    pub fn set_position(&self, position: StreamTime) {
        *self.position.lock() = position;
    }

    pub fn items(&self) -> Vec<FlowItem> {
        self.items.lock().clone()
    }

    pub fn events(&self) -> Vec<Event> {
        self.items()
            .into_iter()
            .filter_map(|item| match item {
                FlowItem::Event(event) => Some(event),
                _ => None,
            })
            .collect()
    }

    pub fn segments(&self) -> Vec<(Seqnum, Segment)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event.payload {
                EventPayload::Segment(segment) => Some((event.seqnum, segment)),
                _ => None,
            })
            .collect()
    }

    pub fn buffers(&self) -> Vec<Buffer> {
        self.items()
            .into_iter()
            .filter_map(|item| match item {
                FlowItem::Buffer(buffer) => Some(buffer),
                _ => None,
            })
            .collect()
    }

    pub fn stream_start_ids(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event.payload {
                EventPayload::StreamStart { stream_id } => Some(stream_id),
                _ => None,
            })
            .collect()
    }

    pub fn eos_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event.payload, EventPayload::Eos))
            .count()
    }

    /// Flush events seen downstream, as (kind, seqnum) pairs.
    pub fn flushes(&self) -> Vec<(&'static str, Seqnum)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event.payload {
                EventPayload::FlushStart => Some(("flush-start", event.seqnum)),
                EventPayload::FlushStop { .. } => Some(("flush-stop", event.seqnum)),
                _ => None,
            })
            .collect()
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

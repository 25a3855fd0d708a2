//! Commits during playback and downstream seeks: stack reuse, teardown
//! seeks and seek idempotence.

mod support;

use std::sync::Arc;
use std::time::Duration;

use montex_core::composition::{BusMessage, Composition, UpdateReason};
use montex_core::flow::{Event, EventPayload, Query};
use montex_core::object::TimedObject;
use montex_model::{SeekBound, SeekDescriptor, StreamTime};

use support::{FakeProducer, Harness, collect_until, wait_until};

fn source(
    name: &str,
    start: u64,
    duration: u64,
    in_point: u64,
    priority: u32,
) -> (Arc<TimedObject>, Arc<FakeProducer>) {
    let producer = FakeProducer::new(name, StreamTime::from_millis(500));
    let object = TimedObject::source(name, producer.clone());
    object.set_start(StreamTime::from_secs(start));
    object.set_duration(StreamTime::from_secs(duration));
    object.set_in_point(StreamTime::from_secs(in_point));
    object.set_priority(priority);
    (object, producer)
}

#[test]
fn commit_during_playback_extends_the_stack_without_teardown() {
    let composition = Composition::new("live-commit");
    let bus = composition.bus();
    let harness = Harness::new();
    harness.connect(&composition);

    let (d, pd) = source("d", 0, 4, 0, 1);
    composition.add_object(Arc::clone(&d));
    composition.commit();
    composition.play().expect("composition should reach playing");

    assert!(pd.wait_for_seek(1));
    assert!(
        wait_until(Duration::from_secs(2), || !harness.buffers().is_empty()),
        "first stack should be flowing"
    );
    // Flush the initial commit's messages so the assertions below only
    // see the live commit.
    let drained = collect_until(&bus, Duration::from_secs(2), |message| {
        matches!(
            message,
            BusMessage::UpdateDone {
                reason: UpdateReason::Commit,
                ..
            }
        )
    });
    assert!(!drained.is_empty(), "initial commit should have completed");

    // Playhead at 1s, duration extended to 6s.
    harness.set_position(StreamTime::from_secs(1));
    d.set_duration(StreamTime::from_secs(6));
    composition.commit();

    let messages = collect_until(&bus, Duration::from_secs(2), |message| {
        matches!(message, BusMessage::Committed { changed: true })
    });
    assert!(
        matches!(messages.last(), Some(BusMessage::Committed { changed: true })),
        "commit should complete, got {messages:?}"
    );
    let start_index = messages
        .iter()
        .position(|m| {
            matches!(
                m,
                BusMessage::StartUpdate {
                    reason: UpdateReason::Commit,
                    ..
                }
            )
        })
        .expect("composition-start-update(Commit)");
    let done_index = messages
        .iter()
        .position(|m| {
            matches!(
                m,
                BusMessage::UpdateDone {
                    reason: UpdateReason::Commit,
                    ..
                }
            )
        })
        .expect("composition-update-done(Commit)");
    assert!(start_index < done_index);
    assert!(done_index < messages.len() - 1, "committed must come after update-done");

    // Pending became live, the validity window stretched, and the stack
    // survived: the producer was seeked in place, not re-primed.
    assert_eq!(d.stop(), StreamTime::from_secs(6));
    assert_eq!(
        composition.current_stack_interval(),
        (StreamTime::from_secs(1), StreamTime::from_secs(6))
    );
    assert_eq!(pd.seek_count(), 2);
    let (commit_seqnum, seek) = pd.last_seek().unwrap();
    assert_eq!(seek.start, StreamTime::from_secs(1));
    assert_eq!(seek.stop, StreamTime::from_secs(6));

    // The commit flushed downstream with its own seqnum pair.
    let flushes = harness.flushes();
    assert!(
        flushes
            .iter()
            .any(|(kind, seqnum)| *kind == "flush-start" && *seqnum == commit_seqnum)
    );
    assert!(
        flushes
            .iter()
            .any(|(kind, seqnum)| *kind == "flush-stop" && *seqnum == commit_seqnum)
    );
}

#[test]
fn seek_into_a_later_stack_reaches_only_that_source() {
    let composition = Composition::new("seek");
    let harness = Harness::new();
    harness.connect(&composition);

    let (a, pa) = source("a", 0, 2, 10, 0);
    let (b, pb) = source("b", 2, 2, 20, 0);
    let (c, pc) = source("c", 4, 2, 30, 0);
    composition.add_object(a);
    composition.add_object(b);
    composition.add_object(c);
    composition.commit();
    composition.play().expect("composition should reach playing");

    assert!(pa.wait_for_seek(1));
    assert!(wait_until(Duration::from_secs(2), || !harness.buffers().is_empty()));

    // Downstream seek to t = 5s.
    let seek = Event::new(EventPayload::Seek(SeekDescriptor {
        stop_bound: SeekBound::Unset,
        stop: StreamTime::NONE,
        ..SeekDescriptor::flushing(StreamTime::from_secs(5), StreamTime::NONE)
    }));
    let seek_seqnum = seek.seqnum;
    assert!(composition.src_pad().send_event(seek));

    // The translated seek lands on c's internal pad at in_point + 1s.
    assert!(pc.wait_for_seek(1));
    let (_, translated) = pc.last_seek().unwrap();
    assert_eq!(translated.start, StreamTime::from_secs(31));
    assert_eq!(translated.stop, StreamTime::from_secs(32));

    // Nobody else saw the seek.
    assert_eq!(pa.seek_count(), 1);
    assert_eq!(pb.seek_count(), 0);

    // Downstream got the flush pair stamped with the seek's seqnum, and no
    // repeated stream-start.
    assert!(wait_until(Duration::from_secs(2), || {
        harness
            .flushes()
            .iter()
            .any(|(kind, seqnum)| *kind == "flush-stop" && *seqnum == seek_seqnum)
    }));
    assert!(
        harness
            .flushes()
            .iter()
            .any(|(kind, seqnum)| *kind == "flush-start" && *seqnum == seek_seqnum)
    );
    assert_eq!(harness.stream_start_ids().len(), 1);

    assert!(wait_until(Duration::from_secs(2), || {
        harness
            .buffers()
            .iter()
            .any(|buffer| buffer.pts == StreamTime::from_secs(31))
    }));
    pc.pump_to_eos();
    assert!(wait_until(Duration::from_secs(2), || harness.eos_count() == 1));
}

#[test]
fn parent_composition_query_reports_the_stream_id() {
    let composition = Composition::new("queried");
    composition.set_id("queried-stream");

    let mut query = Query::ParentComposition { result: None };
    assert!(composition.src_pad().query(&mut query));
    assert_eq!(
        query,
        Query::ParentComposition {
            result: Some("queried-stream".to_string())
        }
    );
}

#[test]
fn duplicate_seek_seqnums_produce_one_update() {
    let composition = Composition::new("idempotent-seek");
    let bus = composition.bus();
    let harness = Harness::new();
    harness.connect(&composition);

    let (a, pa) = source("a", 0, 2, 10, 0);
    let (c, pc) = source("c", 2, 2, 30, 0);
    composition.add_object(a);
    composition.add_object(c);
    composition.commit();
    composition.play().expect("composition should reach playing");

    assert!(pa.wait_for_seek(1));
    assert!(wait_until(Duration::from_secs(2), || !harness.buffers().is_empty()));

    let seek = Event::new(EventPayload::Seek(SeekDescriptor {
        stop_bound: SeekBound::Unset,
        stop: StreamTime::NONE,
        ..SeekDescriptor::flushing(StreamTime::from_secs(3), StreamTime::NONE)
    }));
    assert!(composition.src_pad().send_event(seek.clone()));
    assert!(composition.src_pad().send_event(seek));

    assert!(pc.wait_for_seek(1));
    let messages = collect_until(&bus, Duration::from_millis(500), |_| false);
    let seek_updates = messages
        .iter()
        .filter(|m| {
            matches!(
                m,
                BusMessage::StartUpdate {
                    reason: UpdateReason::Seek,
                    ..
                }
            )
        })
        .count();
    assert_eq!(seek_updates, 1, "two enqueues must collapse into one action");
    assert_eq!(pc.seek_count(), 1);
}

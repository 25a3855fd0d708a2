//! End-to-end playback: concatenation, priority overlaps and expandable
//! default sources, observed at the composition output.

mod support;

use std::sync::Arc;
use std::time::Duration;

use montex_core::composition::{BusMessage, Composition, UpdateReason};
use montex_core::object::TimedObject;
use montex_model::StreamTime;

use support::{FakeProducer, Harness, wait_for_message, wait_until};

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

fn wait_buffer_at(harness: &Harness, pts: StreamTime) -> bool {
    wait_until(Duration::from_secs(2), || {
        harness.buffers().iter().any(|buffer| buffer.pts == pts)
    })
}

#[test]
fn simple_concatenation_plays_three_sources_in_order() {
    let composition = Composition::new("concat");
    composition.set_id("concat-stream");
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

    assert!(pa.wait_for_seek(1), "first stack should get its initializing seek");
    assert!(wait_buffer_at(&harness, StreamTime::from_secs(10)));
    pa.pump_to_eos();

    assert!(pb.wait_for_seek(1), "second stack should get its initializing seek");
    assert!(wait_buffer_at(&harness, StreamTime::from_secs(20)));
    pb.pump_to_eos();

    assert!(pc.wait_for_seek(1), "third stack should get its initializing seek");
    assert!(wait_buffer_at(&harness, StreamTime::from_secs(30)));
    pc.pump_to_eos();

    assert!(
        wait_until(Duration::from_secs(2), || harness.eos_count() == 1),
        "exactly one EOS should reach downstream"
    );

    // Stream-start carries the composition id, once.
    assert_eq!(harness.stream_start_ids(), vec!["concat-stream".to_string()]);

    // Three segments whose external times and accumulated bases cover the
    // whole 0..6s presentation.
    let segments = harness.segments();
    assert_eq!(segments.len(), 3);
    let times: Vec<StreamTime> = segments.iter().map(|(_, s)| s.time).collect();
    assert_eq!(
        times,
        vec![
            StreamTime::ZERO,
            StreamTime::from_secs(2),
            StreamTime::from_secs(4)
        ]
    );
    let bases: Vec<StreamTime> = segments.iter().map(|(_, s)| s.base).collect();
    assert_eq!(
        bases,
        vec![
            StreamTime::ZERO,
            StreamTime::from_secs(2),
            StreamTime::from_secs(4)
        ]
    );

    // Buffers keep their internal timestamps, covering each source's
    // in-point window.
    let buffers = harness.buffers();
    assert!(buffers.iter().any(|b| b.pts == StreamTime::from_secs(10)));
    assert!(
        buffers
            .iter()
            .any(|b| b.pts == StreamTime::from_millis(11_500))
    );
    assert!(buffers.iter().any(|b| b.pts == StreamTime::from_secs(20)));
    assert!(buffers.iter().any(|b| b.pts == StreamTime::from_secs(30)));
    assert!(
        buffers
            .iter()
            .all(|b| b.pts < StreamTime::from_secs(12)
                || (b.pts >= StreamTime::from_secs(20) && b.pts < StreamTime::from_secs(22))
                || (b.pts >= StreamTime::from_secs(30) && b.pts < StreamTime::from_secs(32)))
    );

    // Each internal seek covered exactly one source's media window.
    assert_eq!(pa.seek_count(), 1);
    let (_, seek_a) = pa.last_seek().unwrap();
    assert_eq!(seek_a.start, StreamTime::from_secs(10));
    assert_eq!(seek_a.stop, StreamTime::from_secs(12));
}

#[test]
fn overlap_priority_switches_stacks_and_back() {
    let composition = Composition::new("overlap");
    let harness = Harness::new();
    harness.connect(&composition);

    // d covers [0,4) at priority 1, e wins [2,3) at priority 0.
    let (d, pd) = source("d", 0, 4, 0, 1);
    let (e, pe) = source("e", 2, 1, 100, 0);
    composition.add_object(d);
    composition.add_object(e);
    composition.commit();
    composition.play().expect("composition should reach playing");

    // Stack 1: {d} over [0,2).
    assert!(pd.wait_for_seek(1));
    let (_, seek) = pd.last_seek().unwrap();
    assert_eq!(seek.start, StreamTime::ZERO);
    assert_eq!(seek.stop, StreamTime::from_secs(2));
    assert_eq!(
        composition.current_stack_interval(),
        (StreamTime::ZERO, StreamTime::from_secs(2))
    );
    assert!(wait_buffer_at(&harness, StreamTime::ZERO));
    pd.pump_to_eos();

    // Stack 2: {e} over [2,3).
    assert!(pe.wait_for_seek(1));
    let (_, seek) = pe.last_seek().unwrap();
    assert_eq!(seek.start, StreamTime::from_secs(100));
    assert_eq!(seek.stop, StreamTime::from_secs(101));
    assert_eq!(
        composition.current_stack_interval(),
        (StreamTime::from_secs(2), StreamTime::from_secs(3))
    );
    assert!(wait_buffer_at(&harness, StreamTime::from_secs(100)));
    pe.pump_to_eos();

    // Stack 3: {d} again over [3,4).
    assert!(pd.wait_for_seek(2));
    let (_, seek) = pd.last_seek().unwrap();
    assert_eq!(seek.start, StreamTime::from_secs(3));
    assert_eq!(seek.stop, StreamTime::from_secs(4));
    assert_eq!(
        composition.current_stack_interval(),
        (StreamTime::from_secs(3), StreamTime::from_secs(4))
    );
    assert!(wait_buffer_at(&harness, StreamTime::from_secs(3)));
    pd.pump_to_eos();

    assert!(wait_until(Duration::from_secs(2), || harness.eos_count() == 1));

    // Every stack transition primed its stack with a flush pair, seqnums
    // monotone across the transitions d -> e -> d.
    let d_starts: Vec<u32> = pd
        .flushes()
        .into_iter()
        .filter(|(_, kind)| *kind == "flush-start")
        .map(|(seqnum, _)| seqnum.raw())
        .collect();
    let e_starts: Vec<u32> = pe
        .flushes()
        .into_iter()
        .filter(|(_, kind)| *kind == "flush-start")
        .map(|(seqnum, _)| seqnum.raw())
        .collect();
    assert_eq!(d_starts.len(), 2);
    assert_eq!(e_starts.len(), 1);
    assert!(d_starts[0] < e_starts[0]);
    assert!(e_starts[0] < d_starts[1]);

    // Each flush-start was paired with a flush-stop on the same seqnum.
    for producer in [&pd, &pe] {
        let flushes = producer.flushes();
        for pair in flushes.chunks(2) {
            assert_eq!(pair[0].1, "flush-start");
            assert_eq!(pair[1].1, "flush-stop");
            assert_eq!(pair[0].0, pair[1].0);
        }
    }

    // Downstream running time is continuous across the three stacks.
    let bases: Vec<StreamTime> = harness.segments().iter().map(|(_, s)| s.base).collect();
    assert_eq!(
        bases,
        vec![
            StreamTime::ZERO,
            StreamTime::from_secs(2),
            StreamTime::from_secs(3)
        ]
    );
}

#[test]
fn expandable_default_source_fills_the_front() {
    let composition = Composition::new("expandable");
    let bus = composition.bus();
    let harness = Harness::new();
    harness.connect(&composition);

    let (f, pf) = source("f", 2, 2, 50, 0);
    let (x, px) = source("x", 0, 0, 0, 0);
    x.set_expandable(true);
    composition.add_object(f);
    composition.add_object(x);
    composition.commit();
    composition.play().expect("composition should reach playing");

    // The expandable stretches the composition over [0, 4).
    assert!(px.wait_for_seek(1));
    assert_eq!(composition.start(), StreamTime::ZERO);
    assert_eq!(composition.duration(), StreamTime::from_secs(4));

    // [0,2) plays the default source.
    let (_, seek) = px.last_seek().unwrap();
    assert_eq!(seek.start, StreamTime::ZERO);
    assert_eq!(seek.stop, StreamTime::from_secs(2));
    assert!(wait_buffer_at(&harness, StreamTime::ZERO));
    px.pump_to_eos();

    // The transition at 2s tears down and primes f with an initializing
    // seek.
    assert!(
        wait_for_message(&bus, Duration::from_secs(2), |message| matches!(
            message,
            BusMessage::UpdateDone {
                reason: UpdateReason::Eos,
                ..
            }
        ))
        .is_some()
    );
    assert!(pf.wait_for_seek(1));
    let (_, seek) = pf.last_seek().unwrap();
    assert_eq!(seek.start, StreamTime::from_secs(50));
    assert_eq!(seek.stop, StreamTime::from_secs(52));

    assert!(wait_buffer_at(&harness, StreamTime::from_secs(50)));
    pf.pump_to_eos();
    assert!(wait_until(Duration::from_secs(2), || harness.eos_count() == 1));
}

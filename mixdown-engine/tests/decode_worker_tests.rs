//! Decode worker behaviour against synthetic media
//!
//! Fixture: 48 kHz mono, constant-amplitude packets. Workers run real threads,
//! so assertions wait (with a timeout) for the condition they expect.

mod helpers;

use helpers::*;
use mixdown_common::{MediaError, Track};
use mixdown_engine::{DecodeWorker, Error, EventLoop};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(5);
const SETTLE: Duration = Duration::from_millis(50);

fn flag() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}

#[test]
fn test_nothing_decoded_before_start() {
    let mut event_loop = EventLoop::new();
    let demuxer = Arc::new(FixtureDemuxer::new(mono(), Duration::from_secs(1), 1000));
    let decoder = FixtureDecoder::new(mono());
    let probe = decoder.probe();
    let worker = fixture_worker(Track::audio(1), demuxer, decoder, event_loop.dispatcher(), 8);

    settle(&mut event_loop, SETTLE);
    assert!(!worker.is_started());
    assert_eq!(worker.queued_blocks(), 0);
    assert_eq!(probe.blocks_produced.load(Ordering::SeqCst), 0);
}

#[test]
fn test_queue_fills_to_capacity_then_waits() {
    let mut event_loop = EventLoop::new();
    let demuxer = Arc::new(FixtureDemuxer::new(mono(), Duration::from_secs(3), 1000));
    let worker = fixture_worker(
        Track::audio(1),
        demuxer,
        FixtureDecoder::new(mono()),
        event_loop.dispatcher(),
        4,
    );
    worker.set_output_spec(mono());
    worker.start();

    assert!(wait_until(&mut event_loop, TIMEOUT, || worker.queued_blocks() == 4));
    settle(&mut event_loop, SETTLE);
    assert_eq!(worker.queued_blocks(), 4);

    // Popping frees space and blocks keep arriving in order
    for i in 0..10u64 {
        assert!(wait_until(&mut event_loop, TIMEOUT, || worker.queued_blocks() > 0));
        let block = worker.pop_block().expect("queued block");
        assert_eq!(block.start_frame(), i * 1000);
        assert!(worker.queued_blocks() <= 4);
    }
}

#[test]
fn test_runs_to_end_of_stream_and_idles() {
    let mut event_loop = EventLoop::new();
    // 0.1 s in 480-frame packets = 10 blocks
    let demuxer = Arc::new(FixtureDemuxer::new(mono(), Duration::from_millis(100), 480));
    let worker = fixture_worker(
        Track::audio(1),
        demuxer,
        FixtureDecoder::new(mono()),
        event_loop.dispatcher(),
        16,
    );
    worker.start();

    assert!(wait_until(&mut event_loop, TIMEOUT, || worker.is_end_of_stream()));
    assert_eq!(worker.queued_blocks(), 10);
    assert!(!worker.is_in_error_state());

    let mut frames = 0;
    while let Some(block) = worker.pop_block() {
        frames += block.frame_count();
    }
    assert_eq!(frames, 4800);
}

#[test]
fn test_newer_seek_supersedes_older() {
    let mut event_loop = EventLoop::new();
    // 3 s, 1000-frame packets, keyframe every 10 packets
    let demuxer = Arc::new(
        FixtureDemuxer::new(mono(), Duration::from_secs(3), 1000).with_keyframe_interval(10),
    );
    let decoder = FixtureDecoder::new(mono());
    let probe = decoder.probe();
    let worker = fixture_worker(Track::audio(1), demuxer, decoder, event_loop.dispatcher(), 16);
    worker.set_output_spec(mono());
    worker.start();

    let first_done = flag();
    let second_done = flag();
    let f = first_done.clone();
    worker.seek(Duration::from_millis(2500), move || f.store(true, Ordering::SeqCst));
    let s = second_done.clone();
    worker.seek(Duration::from_secs(1), move || s.store(true, Ordering::SeqCst));

    assert!(wait_until(&mut event_loop, TIMEOUT, || second_done.load(Ordering::SeqCst)));
    settle(&mut event_loop, SETTLE);
    assert!(!first_done.load(Ordering::SeqCst), "superseded seek must not complete");

    // The block just before the target, then the one starting at it
    let before = worker.pop_block().expect("block before target");
    assert!(before.start_frame() < 48_000);
    assert_eq!(before.end_frame(), 48_000);
    let after = worker.pop_block().expect("block at target");
    assert_eq!(after.start_frame(), 48_000);

    assert!(probe.flushes.load(Ordering::SeqCst) >= 1);
}

#[test]
fn test_seek_between_packets_keeps_straddling_block() {
    let mut event_loop = EventLoop::new();
    let demuxer = Arc::new(
        FixtureDemuxer::new(mono(), Duration::from_secs(2), 1000).with_keyframe_interval(10),
    );
    let worker = fixture_worker(
        Track::audio(1),
        demuxer,
        FixtureDecoder::new(mono()),
        event_loop.dispatcher(),
        16,
    );
    worker.start();

    let done = flag();
    let d = done.clone();
    // Frame 48_480 falls inside the packet starting at 48_000
    worker.seek(Duration::from_millis(1010), move || d.store(true, Ordering::SeqCst));
    assert!(wait_until(&mut event_loop, TIMEOUT, || done.load(Ordering::SeqCst)));

    let straddling = worker.pop_block().expect("straddling block");
    assert_eq!(straddling.start_frame(), 48_000);
    assert!(straddling.end_frame() > 48_480);
    assert_eq!(worker.pop_block().map(|b| b.start_frame()), Some(49_000));
}

#[test]
fn test_seek_before_start_applies_on_start() {
    let mut event_loop = EventLoop::new();
    let demuxer = Arc::new(FixtureDemuxer::new(mono(), Duration::from_secs(1), 1000));
    let worker = fixture_worker(
        Track::audio(1),
        demuxer,
        FixtureDecoder::new(mono()),
        event_loop.dispatcher(),
        8,
    );

    let done = flag();
    let d = done.clone();
    worker.seek(Duration::from_millis(500), move || d.store(true, Ordering::SeqCst));
    settle(&mut event_loop, SETTLE);
    assert!(!done.load(Ordering::SeqCst));

    worker.start();
    assert!(wait_until(&mut event_loop, TIMEOUT, || done.load(Ordering::SeqCst)));
    assert_eq!(worker.pop_block().map(|b| b.start_frame()), Some(24_000));
}

#[test]
fn test_seek_past_end_resolves_at_end_of_stream() {
    let mut event_loop = EventLoop::new();
    let demuxer = Arc::new(FixtureDemuxer::new(mono(), Duration::from_secs(1), 1000));
    let worker = fixture_worker(
        Track::audio(1),
        demuxer,
        FixtureDecoder::new(mono()),
        event_loop.dispatcher(),
        8,
    );
    worker.start();

    let done = flag();
    let d = done.clone();
    worker.seek(Duration::from_millis(2500), move || d.store(true, Ordering::SeqCst));

    assert!(wait_until(&mut event_loop, TIMEOUT, || done.load(Ordering::SeqCst)));
    assert!(worker.is_end_of_stream());
    assert_eq!(worker.queued_blocks(), 0);
}

#[test]
fn test_decode_error_reported_once_and_cleared_by_seek() {
    let mut event_loop = EventLoop::new();
    // 1 s in 4800-frame packets = 10 blocks; the 5th fails
    let demuxer = Arc::new(FixtureDemuxer::new(mono(), Duration::from_secs(1), 4800));
    let worker = fixture_worker(
        Track::audio(1),
        demuxer,
        FixtureDecoder::new(mono()).failing_at_block(5),
        event_loop.dispatcher(),
        16,
    );

    let errors = Arc::new(Mutex::new(Vec::new()));
    let e = errors.clone();
    worker.set_error_handler(move |err| e.lock().push(err));
    worker.start();

    assert!(wait_until(&mut event_loop, TIMEOUT, || errors.lock().len() == 1));
    assert!(matches!(errors.lock()[0], MediaError::Decoder(_)));
    assert!(worker.is_in_error_state());
    assert_eq!(worker.queued_blocks(), 0);

    settle(&mut event_loop, SETTLE);
    assert_eq!(errors.lock().len(), 1, "error must be reported once");
    assert_eq!(worker.queued_blocks(), 0, "no decoding while in error state");

    let done = flag();
    let d = done.clone();
    worker.seek(Duration::from_millis(500), move || d.store(true, Ordering::SeqCst));
    assert!(wait_until(&mut event_loop, TIMEOUT, || done.load(Ordering::SeqCst)));
    assert!(!worker.is_in_error_state());
    assert_eq!(worker.pop_block().map(|b| b.start_frame()), Some(24_000));

    settle(&mut event_loop, SETTLE);
    assert_eq!(errors.lock().len(), 1);
}

#[test]
fn test_error_before_handler_reported_when_installed() {
    let mut event_loop = EventLoop::new();
    let demuxer = Arc::new(FixtureDemuxer::new(mono(), Duration::from_secs(1), 4800));
    let worker = fixture_worker(
        Track::audio(1),
        demuxer,
        FixtureDecoder::new(mono()).failing_at_block(1),
        event_loop.dispatcher(),
        16,
    );
    worker.start();

    assert!(wait_until(&mut event_loop, TIMEOUT, || worker.is_in_error_state()));

    let reported = Arc::new(AtomicUsize::new(0));
    let r = reported.clone();
    worker.set_error_handler(move |_| {
        r.fetch_add(1, Ordering::SeqCst);
    });

    assert!(wait_until(&mut event_loop, TIMEOUT, || reported.load(Ordering::SeqCst) == 1));
    settle(&mut event_loop, SETTLE);
    assert_eq!(reported.load(Ordering::SeqCst), 1);
}

#[test]
fn test_track_seek_failure_falls_back_to_container() {
    let mut event_loop = EventLoop::new();
    let demuxer = Arc::new(FixtureDemuxer::new(mono(), Duration::from_secs(2), 1000));
    demuxer.reject_track_seeks.store(true, Ordering::SeqCst);
    let worker = fixture_worker(
        Track::audio(1),
        Arc::clone(&demuxer),
        FixtureDecoder::new(mono()),
        event_loop.dispatcher(),
        8,
    );
    worker.start();

    for target in [Duration::from_millis(500), Duration::from_millis(1500)] {
        let done = flag();
        let d = done.clone();
        worker.seek(target, move || d.store(true, Ordering::SeqCst));
        assert!(wait_until(&mut event_loop, TIMEOUT, || done.load(Ordering::SeqCst)));
    }

    // Only the first seek tries the track scope
    assert_eq!(demuxer.track_seeks.load(Ordering::SeqCst), 1);
    assert_eq!(demuxer.container_seeks.load(Ordering::SeqCst), 2);
    assert!(!worker.is_in_error_state());
}

#[test]
fn test_drop_joins_worker_blocked_on_full_queue() {
    let mut event_loop = EventLoop::new();
    let demuxer = Arc::new(FixtureDemuxer::new(mono(), Duration::from_secs(10), 1000));
    let worker = fixture_worker(
        Track::audio(1),
        demuxer,
        FixtureDecoder::new(mono()),
        event_loop.dispatcher(),
        2,
    );
    worker.start();
    assert!(wait_until(&mut event_loop, TIMEOUT, || worker.queued_blocks() == 2));

    let started = Instant::now();
    drop(worker);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn test_pending_completion_dropped_with_worker() {
    let mut event_loop = EventLoop::new();
    let demuxer = Arc::new(FixtureDemuxer::new(mono(), Duration::from_secs(1), 1000));
    let worker = fixture_worker(
        Track::audio(1),
        demuxer,
        FixtureDecoder::new(mono()),
        event_loop.dispatcher(),
        8,
    );
    worker.start();

    let done = flag();
    let d = done.clone();
    worker.seek(Duration::from_millis(200), move || d.store(true, Ordering::SeqCst));

    // Let the seek resolve without running its completion, then drop
    std::thread::sleep(Duration::from_millis(100));
    drop(worker);
    event_loop.pump();
    assert!(!done.load(Ordering::SeqCst));
}

#[test]
fn test_seek_drops_block_waiting_for_queue_space() {
    let mut event_loop = EventLoop::new();
    let demuxer = Arc::new(FixtureDemuxer::new(mono(), Duration::from_secs(3), 3000));
    // Three blocks per packet against a queue of two: the third has to wait
    let decoder = FixtureDecoder::new(mono()).with_blocks_per_packet(3);
    let probe = decoder.probe();
    let worker = fixture_worker(Track::audio(1), demuxer, decoder, event_loop.dispatcher(), 2);
    worker.start();

    assert!(wait_until(&mut event_loop, TIMEOUT, || {
        probe.blocks_produced.load(Ordering::SeqCst) == 3 && worker.queued_blocks() == 2
    }));
    settle(&mut event_loop, SETTLE);
    assert_eq!(probe.blocks_produced.load(Ordering::SeqCst), 3);

    let done = flag();
    let d = done.clone();
    worker.seek(Duration::from_secs(2), move || d.store(true, Ordering::SeqCst));
    assert!(wait_until(&mut event_loop, TIMEOUT, || done.load(Ordering::SeqCst)));

    let mut starts = Vec::new();
    while starts.len() < 6 {
        match worker.pop_block() {
            Some(block) => starts.push(block.start_frame()),
            None => assert!(wait_until(&mut event_loop, TIMEOUT, || worker.queued_blocks() > 0)),
        }
    }
    assert_eq!(starts, vec![96_000, 97_000, 98_000, 99_000, 100_000, 101_000]);
}

#[test]
fn test_zero_capacity_rejected() {
    let event_loop = EventLoop::new();
    let demuxer = Arc::new(FixtureDemuxer::new(mono(), Duration::from_secs(1), 1000));
    let result = DecodeWorker::new(
        Track::audio(1),
        demuxer,
        Box::new(FixtureDecoder::new(mono())),
        event_loop.dispatcher(),
        0,
    );
    assert!(matches!(result, Err(Error::Config(_))));
}

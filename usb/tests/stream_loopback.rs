use byteorder::{ByteOrder, LittleEndian};
use dfc_types::Channel;
use dfc_usb::stream::{
    CaptureTransform, EngineState, PlaybackTransform, StopReason, StreamConfig, StreamEngine,
    Transform,
};
use dfc_usb::transfer::synthetic::SyntheticTransport;
use std::fs::File;
use std::io::{BufWriter, Read};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn alternating(buffer: &mut [u8]) {
    for (index, sample) in buffer.chunks_exact_mut(2).enumerate() {
        let value = if index % 2 == 0 { 100 } else { -100 };
        LittleEndian::write_i16(sample, value);
    }
}

fn config() -> StreamConfig {
    StreamConfig {
        packets_per_transfer: 16,
        packet_size: 1024,
        queue_depth: 4,
        event_timeout: Duration::from_millis(100),
    }
}

#[test]
fn capture_for_one_second() {
    let transport = SyntheticTransport::new()
        .with_generator(alternating)
        .with_latency(Duration::from_millis(1));
    let transform = Transform::Capture(CaptureTransform::new(None));
    let mut engine = StreamEngine::new(transport, &config(), transform, true).unwrap();
    let handle = engine.stop_handle();

    let started = Instant::now();
    let reactor = thread::spawn(move || {
        let reason = engine.run().unwrap();
        (reason, engine)
    });

    thread::sleep(Duration::from_secs(1));
    handle.request_stop();
    let (reason, engine) = reactor.join().unwrap();
    let stats = engine.stats(started.elapsed());

    assert_eq!(reason, StopReason::Requested);
    assert_eq!(engine.state(), EngineState::Stopped);
    assert_eq!(handle.in_flight(), 0);

    assert_eq!(stats.failure_count, 0);
    assert!(stats.success_count > 0);
    assert_eq!(stats.bytes_transferred, stats.success_count * 16 * 1024);

    let capture = stats.capture.unwrap();
    assert_eq!(capture.ranges[Channel::Even].min, 100);
    assert_eq!(capture.ranges[Channel::Even].max, 100);
    assert_eq!(capture.ranges[Channel::Odd].min, -100);
    assert_eq!(capture.ranges[Channel::Odd].max, -100);

    let totals = capture.histogram_totals.unwrap();
    assert_eq!(totals[Channel::Even], stats.bytes_transferred / 4);
    assert_eq!(totals[Channel::Odd], stats.bytes_transferred / 4);
}

#[test]
fn capture_writes_the_raw_stream() {
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("capture.bin");
    let sink = BufWriter::new(File::create(&path).unwrap());

    let transport = SyntheticTransport::new().with_generator(alternating);
    let transform = Transform::Capture(CaptureTransform::new(Some(Box::new(sink))));
    let mut engine = StreamEngine::new(transport, &config(), transform, false).unwrap();

    engine.start().unwrap();
    for _ in 0..3 {
        engine.poll(Duration::from_millis(10)).unwrap();
    }
    engine.stop().unwrap();
    let bytes = engine.statistics().bytes_transferred();
    drop(engine);

    let mut written = Vec::new();
    File::open(&path)
        .unwrap()
        .read_to_end(&mut written)
        .unwrap();
    assert_eq!(written.len() as u64, bytes);
    assert_eq!(written.len(), 3 * 4 * 16 * 1024);
    assert_eq!(LittleEndian::read_i16(&written[0..2]), 100);
    assert_eq!(LittleEndian::read_i16(&written[2..4]), -100);
}

#[test]
fn playback_sends_the_input_file() {
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("playback.bin");

    // Enough samples to refill every transfer once.
    let samples: Vec<i16> = (0..2 * 16 * 1024 / 2).map(|i| (i % 1000) as i16).collect();
    let mut input = vec![0; samples.len() * 2];
    LittleEndian::write_i16_into(&samples, &mut input);
    std::fs::write(&path, &input).unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let transport = SyntheticTransport::new().with_consumer(move |buffer| {
        sink.lock().unwrap().extend_from_slice(buffer);
    });
    let source = File::open(&path).unwrap();
    let transform = Transform::Playback(PlaybackTransform::new(Box::new(source)));
    let mut engine = StreamEngine::new(transport, &config(), transform, false).unwrap();

    assert_eq!(engine.run().unwrap(), StopReason::EndOfStream);
    let stats = engine.stats(Duration::from_secs(1));
    assert_eq!(stats.playback.unwrap().input_bytes, input.len() as u64);

    // The first round of transfers carries silence, the samples follow.
    let received = received.lock().unwrap();
    let silence = 4 * 16 * 1024;
    assert!(received[..silence].iter().all(|&b| b == 0));

    let frames = &received[silence..silence + 8];
    assert_eq!(LittleEndian::read_i16(&frames[0..2]), 0);
    assert_eq!(LittleEndian::read_i16(&frames[2..4]), 0);
    assert_eq!(LittleEndian::read_i16(&frames[6..8]), 1 << 2);
}

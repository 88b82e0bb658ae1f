// Encoder sink behavior against scripted stand-in encoder processes:
// graceful drain on stop, prompt drop under backpressure, and the exit and
// stderr notification paths.

#![cfg(unix)]

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serial_test::serial;

use aircast::audio::encoder::{
    AudioCodec, ContainerFormat, EncoderRendition, EncoderSink, SinkState, StreamFormat,
    SINK_QUEUE_CAPACITY,
};
use aircast::audio::WaveFormat;

fn test_rendition() -> EncoderRendition {
    EncoderRendition {
        name: "aac_64k".to_string(),
        codec: AudioCodec::Aac,
        bitrate_bits: 64_000,
        output_sample_rate: 48000,
        segment_duration_seconds: 2,
        playlist_size: 4,
        container_format: ContainerFormat::MpegTs,
        stream_format: StreamFormat::Hls,
    }
}

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    condition()
}

#[test]
#[serial]
fn stop_drains_every_queued_block_before_exit() {
    let dir = tempfile::tempdir().unwrap();
    let received = dir.path().join("received.bin");
    let encoder = common::write_script(
        dir.path(),
        "fake-ffmpeg",
        &format!("cat > {}", received.display()),
    );

    let mut sink = EncoderSink::spawn(
        test_rendition(),
        &WaveFormat::new(48000, 2),
        dir.path(),
        &encoder,
        None,
        None,
    )
    .unwrap();

    let block = vec![0x5Au8; 4096];
    let blocks = 50;
    for _ in 0..blocks {
        assert!(sink.write_audio_data(block.clone()));
    }

    sink.stop();
    assert_eq!(sink.state(), SinkState::Exited);
    assert_eq!(sink.blocks_written(), blocks as u64);
    assert_eq!(sink.blocks_dropped(), 0);

    let written = std::fs::metadata(&received).unwrap().len();
    assert_eq!(written, (block.len() * blocks) as u64);
}

#[test]
#[serial]
fn saturated_queue_drops_promptly_instead_of_blocking() {
    let dir = tempfile::tempdir().unwrap();
    // Never reads stdin: the pipe fills, the writer wedges, the queue fills.
    let encoder = common::write_script(dir.path(), "fake-ffmpeg", "sleep 30");

    let mut sink = EncoderSink::spawn(
        test_rendition(),
        &WaveFormat::new(48000, 2),
        dir.path(),
        &encoder,
        None,
        None,
    )
    .unwrap();

    // Large blocks so the OS pipe buffer absorbs only a couple of them.
    let block = vec![0u8; 128 * 1024];
    let attempts = SINK_QUEUE_CAPACITY + 10;
    let started = Instant::now();
    for _ in 0..attempts {
        sink.write_audio_data(block.clone());
    }
    let elapsed = started.elapsed();

    assert!(sink.blocks_dropped() > 0, "expected drops once saturated");
    assert_eq!(
        sink.blocks_written() + sink.blocks_dropped(),
        attempts as u64
    );
    // Each drop costs at most the enqueue timeout; nothing blocks forever.
    assert!(
        elapsed < Duration::from_secs(10),
        "writes took {:?}, saturation must not block the caller",
        elapsed
    );

    sink.stop();
    assert_eq!(sink.state(), SinkState::Exited);
}

#[test]
#[serial]
fn self_exiting_encoder_fires_the_exit_handler() {
    let dir = tempfile::tempdir().unwrap();
    let encoder = common::instantly_exiting_encoder(dir.path());

    let exited = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&exited);
    let mut sink = EncoderSink::spawn(
        test_rendition(),
        &WaveFormat::new(48000, 2),
        dir.path(),
        &encoder,
        None,
        Some(Arc::new(move |name: &str| {
            assert_eq!(name, "aac_64k");
            flag.store(true, Ordering::SeqCst);
        })),
    )
    .unwrap();

    assert!(wait_until(Duration::from_secs(3), || exited
        .load(Ordering::SeqCst)));
    assert_eq!(sink.state(), SinkState::Exited);

    // Writes after exit are rejected without error.
    assert!(!sink.write_audio_data(vec![0u8; 16]));
    sink.stop();
}

#[test]
#[serial]
fn stderr_lines_reach_the_diagnostic_handler() {
    let dir = tempfile::tempdir().unwrap();
    let encoder = common::write_script(
        dir.path(),
        "fake-ffmpeg",
        "echo 'bitrate too low' 1>&2\ncat > /dev/null",
    );

    let lines = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink_lines = Arc::clone(&lines);
    let mut sink = EncoderSink::spawn(
        test_rendition(),
        &WaveFormat::new(48000, 2),
        dir.path(),
        &encoder,
        Some(Arc::new(move |name: &str, line: &str| {
            sink_lines
                .lock()
                .unwrap()
                .push(format!("{}: {}", name, line));
        })),
        None,
    )
    .unwrap();

    assert!(wait_until(Duration::from_secs(3), || !lines
        .lock()
        .unwrap()
        .is_empty()));
    sink.stop();

    let lines = lines.lock().unwrap();
    assert!(lines.iter().any(|l| l == "aac_64k: bitrate too low"));
}

#[test]
fn rendition_directory_exists_before_the_process_runs() {
    let dir = tempfile::tempdir().unwrap();
    let encoder = common::write_script(dir.path(), "fake-ffmpeg", "cat > /dev/null");

    let mut sink = EncoderSink::spawn(
        test_rendition(),
        &WaveFormat::new(48000, 2),
        dir.path(),
        &encoder,
        None,
        None,
    )
    .unwrap();

    assert!(dir.path().join("aac_64k").is_dir());
    sink.stop();
}

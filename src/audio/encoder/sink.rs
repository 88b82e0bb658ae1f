// One encoder sink per rendition: an external encoder process fed serialized
// PCM through a bounded queue and a dedicated writer thread.
//
// Backpressure policy: if the queue is full the block is dropped after a
// short timed attempt rather than blocking the capture thread. Encoder
// slowness degrades encoded audio continuity before it ever stalls capture.

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use colored::*;
use crossbeam::channel::{bounded, Sender};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::audio::types::WaveFormat;
use crate::error::AudioError;

use super::rendition::EncoderRendition;

/// Bounded queue depth in blocks between the capture thread and the writer.
pub const SINK_QUEUE_CAPACITY: usize = 100;

const ENQUEUE_TIMEOUT: Duration = Duration::from_millis(100);
const GRACEFUL_EXIT_TIMEOUT: Duration = Duration::from_secs(3);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const DROP_LOG_INTERVAL: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkState {
    Created,
    Running,
    Stopping,
    Exited,
}

/// Diagnostic line from the encoder's stderr: (rendition name, line).
pub type ErrorLineHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;
/// Process-exited notification carrying the rendition name.
pub type ExitHandler = Arc<dyn Fn(&str) + Send + Sync>;

pub struct EncoderSink {
    rendition: EncoderRendition,
    state: Arc<Mutex<SinkState>>,
    queue_tx: Mutex<Option<Sender<Vec<u8>>>>,
    child: Arc<Mutex<Child>>,
    writer_join: Option<JoinHandle<()>>,
    stderr_join: Option<JoinHandle<()>>,
    exit_join: Option<JoinHandle<()>>,
    blocks_written: Arc<AtomicU64>,
    blocks_dropped: Arc<AtomicU64>,
}

impl EncoderSink {
    /// Spawn the encoder process for one rendition and wire up its writer,
    /// stderr, and exit-watcher threads. Failure here (missing binary,
    /// unwritable output dir) is fatal for the stream that owns the sink.
    pub fn spawn(
        rendition: EncoderRendition,
        input_format: &WaveFormat,
        output_dir: &Path,
        encoder_binary: &Path,
        error_line_handler: Option<ErrorLineHandler>,
        exit_handler: Option<ExitHandler>,
    ) -> Result<Self, AudioError> {
        let subdir = rendition.output_subdir(output_dir);
        std::fs::create_dir_all(&subdir).map_err(|e| {
            AudioError::Sink(format!(
                "failed to create rendition directory {}: {}",
                subdir.display(),
                e
            ))
        })?;

        let args = rendition.build_args(input_format, output_dir);
        debug!(
            "{}: spawning {} {}",
            "ENCODER_SINK".blue(),
            encoder_binary.display(),
            args.join(" ")
        );

        let mut child = Command::new(encoder_binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                AudioError::Sink(format!(
                    "failed to spawn encoder {} for rendition {}: {}",
                    encoder_binary.display(),
                    rendition.name,
                    e
                ))
            })?;

        let mut stdin = child.stdin.take().ok_or_else(|| {
            AudioError::Sink(format!("no stdin pipe for rendition {}", rendition.name))
        })?;
        let stderr = child.stderr.take();

        let state = Arc::new(Mutex::new(SinkState::Running));
        let child = Arc::new(Mutex::new(child));
        let (queue_tx, queue_rx) = bounded::<Vec<u8>>(SINK_QUEUE_CAPACITY);

        let rendition_name = rendition.name.clone();
        let writer_join = std::thread::Builder::new()
            .name(format!("enc-writer-{}", rendition_name))
            .spawn(move || {
                // Runs until the channel closes (drain complete) or the pipe
                // breaks (process exited). Dropping stdin on the way out
                // closes the pipe so the encoder can finalize its output.
                for chunk in queue_rx.iter() {
                    if let Err(e) = stdin.write_all(&chunk) {
                        if e.kind() == ErrorKind::BrokenPipe {
                            debug!(
                                "{}: {} pipe closed, writer exiting",
                                "ENCODER_SINK".blue(),
                                rendition_name
                            );
                        } else {
                            warn!(
                                "{}: write to {} failed: {}",
                                "ENCODER_SINK".blue(),
                                rendition_name,
                                e
                            );
                        }
                        break;
                    }
                }
            })
            .map_err(|e| AudioError::Sink(format!("failed to spawn writer thread: {}", e)))?;

        let stderr_join = stderr.and_then(|stderr| {
            let rendition_name = rendition.name.clone();
            let handler = error_line_handler.clone();
            std::thread::Builder::new()
                .name(format!("enc-stderr-{}", rendition_name))
                .spawn(move || {
                    for line in BufReader::new(stderr).lines() {
                        let line = match line {
                            Ok(line) => line,
                            Err(_) => break,
                        };
                        warn!(
                            "{}: [{}] {}",
                            "ENCODER_DIAG".yellow(),
                            rendition_name,
                            line
                        );
                        if let Some(handler) = &handler {
                            handler(&rendition_name, &line);
                        }
                    }
                })
                // Diagnostics are best-effort; the sink runs without them.
                .map_err(|e| {
                    warn!(
                        "{}: failed to spawn stderr reader: {}",
                        "ENCODER_SINK".blue(),
                        e
                    )
                })
                .ok()
        });

        let exit_join = {
            let rendition_name = rendition.name.clone();
            let child = Arc::clone(&child);
            let state = Arc::clone(&state);
            std::thread::Builder::new()
                .name(format!("enc-exit-{}", rendition_name))
                .spawn(move || loop {
                    let status = match child.lock().unwrap().try_wait() {
                        Ok(Some(status)) => Some(status),
                        Ok(None) => None,
                        Err(e) => {
                            warn!(
                                "{}: wait on {} failed: {}",
                                "ENCODER_SINK".blue(),
                                rendition_name,
                                e
                            );
                            return;
                        }
                    };

                    if let Some(status) = status {
                        info!(
                            "{}: {} exited with {}",
                            "ENCODER_SINK".blue(),
                            rendition_name,
                            status
                        );
                        *state.lock().unwrap() = SinkState::Exited;
                        if let Some(handler) = &exit_handler {
                            handler(&rendition_name);
                        }
                        return;
                    }
                    std::thread::sleep(EXIT_POLL_INTERVAL);
                })
                .map_err(|e| AudioError::Sink(format!("failed to spawn exit watcher: {}", e)))?
        };

        info!(
            "{}: rendition {} running ({} @ {}kbps, {:?}/{:?})",
            "ENCODER_SINK".blue(),
            rendition.name,
            rendition.codec.encoder_name(),
            rendition.bitrate_kbps(),
            rendition.container_format,
            rendition.stream_format
        );

        Ok(Self {
            rendition,
            state,
            queue_tx: Mutex::new(Some(queue_tx)),
            child,
            writer_join: Some(writer_join),
            stderr_join,
            exit_join: Some(exit_join),
            blocks_written: Arc::new(AtomicU64::new(0)),
            blocks_dropped: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Enqueue one PCM block for the writer thread. Returns whether the
    /// block was accepted; a saturated queue drops the block after a short
    /// timed attempt and never blocks the caller beyond that.
    pub fn write_audio_data(&self, data: Vec<u8>) -> bool {
        if *self.state.lock().unwrap() != SinkState::Running {
            return false;
        }

        let guard = self.queue_tx.lock().unwrap();
        let Some(tx) = guard.as_ref() else {
            return false;
        };

        match tx.send_timeout(data, ENQUEUE_TIMEOUT) {
            Ok(()) => {
                self.blocks_written.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                let dropped = self.blocks_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % DROP_LOG_INTERVAL == 1 {
                    warn!(
                        "{}: {} queue saturated, dropped {} blocks so far",
                        "ENCODER_SINK".blue(),
                        self.rendition.name,
                        dropped
                    );
                }
                false
            }
        }
    }

    /// Graceful stop: close the queue so the writer drains and closes the
    /// encoder's stdin, wait a bounded time for a clean exit, then force
    /// terminate. Never waits indefinitely.
    pub fn stop(&mut self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == SinkState::Running {
                *state = SinkState::Stopping;
            }
        }

        // Signal no-more-input. The writer drains what is queued, then drops
        // stdin, which closes the pipe.
        *self.queue_tx.lock().unwrap() = None;

        let deadline = Instant::now() + GRACEFUL_EXIT_TIMEOUT;
        let mut exited = false;
        while Instant::now() < deadline {
            match self.child.lock().unwrap().try_wait() {
                Ok(Some(_)) => {
                    exited = true;
                    break;
                }
                Ok(None) => {}
                Err(_) => break,
            }
            std::thread::sleep(EXIT_POLL_INTERVAL);
        }

        if !exited {
            warn!(
                "{}: {} did not exit in {:?}, killing",
                "ENCODER_SINK".blue(),
                self.rendition.name,
                GRACEFUL_EXIT_TIMEOUT
            );
            let mut child = self.child.lock().unwrap();
            let _ = child.kill();
            let _ = child.wait();
        }

        if let Some(join) = self.writer_join.take() {
            let _ = join.join();
        }
        if let Some(join) = self.stderr_join.take() {
            let _ = join.join();
        }
        if let Some(join) = self.exit_join.take() {
            let _ = join.join();
        }

        *self.state.lock().unwrap() = SinkState::Exited;
        info!(
            "{}: {} stopped ({} blocks written, {} dropped)",
            "ENCODER_SINK".blue(),
            self.rendition.name,
            self.blocks_written.load(Ordering::Relaxed),
            self.blocks_dropped.load(Ordering::Relaxed)
        );
    }

    pub fn state(&self) -> SinkState {
        *self.state.lock().unwrap()
    }

    pub fn is_running(&self) -> bool {
        self.state() == SinkState::Running
    }

    pub fn rendition(&self) -> &EncoderRendition {
        &self.rendition
    }

    pub fn blocks_written(&self) -> u64 {
        self.blocks_written.load(Ordering::Relaxed)
    }

    pub fn blocks_dropped(&self) -> u64 {
        self.blocks_dropped.load(Ordering::Relaxed)
    }
}

impl Drop for EncoderSink {
    fn drop(&mut self) {
        if self.state() != SinkState::Exited {
            warn!(
                "{}: {} dropped while running, killing encoder process",
                "ENCODER_SINK".blue(),
                self.rendition.name
            );
            *self.queue_tx.lock().unwrap() = None;
            let mut child = self.child.lock().unwrap();
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::encoder::rendition::{AudioCodec, ContainerFormat, StreamFormat};

    fn test_rendition() -> EncoderRendition {
        EncoderRendition {
            name: "test".to_string(),
            codec: AudioCodec::Aac,
            bitrate_bits: 64_000,
            output_sample_rate: 48000,
            segment_duration_seconds: 2,
            playlist_size: 4,
            container_format: ContainerFormat::MpegTs,
            stream_format: StreamFormat::Hls,
        }
    }

    #[test]
    fn missing_binary_is_a_sink_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = EncoderSink::spawn(
            test_rendition(),
            &WaveFormat::new(48000, 2),
            dir.path(),
            Path::new("/definitely/not/an/encoder"),
            None,
            None,
        );
        assert!(matches!(result, Err(AudioError::Sink(_))));
    }

    #[test]
    fn spawn_creates_the_rendition_directory() {
        let dir = tempfile::tempdir().unwrap();
        // Spawn failure still happens after directory creation.
        let _ = EncoderSink::spawn(
            test_rendition(),
            &WaveFormat::new(48000, 2),
            dir.path(),
            Path::new("/definitely/not/an/encoder"),
            None,
            None,
        );
        assert!(dir.path().join("test").is_dir());
    }
}

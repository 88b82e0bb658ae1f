// Monitor output: a single shared system audio-output resource.
//
// Only one stream writes to the monitor at a time. Streams check "am I the
// monitored stream" under one lock before each write and silently no-op when
// superseded, which makes switching atomic from the writers' perspective.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use colored::*;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam::channel::{bounded, Sender};
use tracing::{info, warn};

use crate::audio::pcm;
use crate::audio::types::WaveFormat;
use crate::error::AudioError;

/// Best-effort audio monitor output. Writes are advisory: a slow or absent
/// device drops audio, it never backpressures the pipeline.
pub trait MonitorSink: Send + Sync {
    fn write(&self, pcm16_bytes: &[u8]);
    fn format(&self) -> WaveFormat;
}

/// Routes monitor writes from many streams to the single shared sink.
pub struct MonitorRouter {
    selected: Mutex<Option<String>>,
    sink: Mutex<Option<Box<dyn MonitorSink>>>,
}

impl MonitorRouter {
    pub fn new() -> Self {
        Self {
            selected: Mutex::new(None),
            sink: Mutex::new(None),
        }
    }

    pub fn set_sink(&self, sink: Box<dyn MonitorSink>) {
        *self.sink.lock().unwrap() = Some(sink);
    }

    /// Atomically switch which stream is monitored. `None` mutes monitoring.
    pub fn select(&self, stream_id: Option<String>) {
        let mut selected = self.selected.lock().unwrap();
        info!(
            "{}: monitored stream now {:?} (was {:?})",
            "MONITOR".green(),
            stream_id,
            *selected
        );
        *selected = stream_id;
    }

    pub fn selected(&self) -> Option<String> {
        self.selected.lock().unwrap().clone()
    }

    /// Forward audio for `stream_id` if it is the selected stream, otherwise
    /// no-op. The selection check and the write happen under the selection
    /// lock so a concurrent `select` cannot interleave stale writes.
    pub fn write_for(&self, stream_id: &str, pcm16_bytes: &[u8]) {
        let selected = self.selected.lock().unwrap();
        if selected.as_deref() != Some(stream_id) {
            return;
        }
        if let Some(sink) = self.sink.lock().unwrap().as_ref() {
            sink.write(pcm16_bytes);
        }
    }
}

impl Default for MonitorRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// cpal-backed monitor output over the default output device.
///
/// PCM16 writes are decoded into a lossy sample queue; the output callback
/// drains it and pads with silence on underrun. The cpal stream lives on its
/// own thread because streams are not `Send`.
pub struct CpalMonitorSink {
    format: WaveFormat,
    queue: Arc<Mutex<VecDeque<f32>>>,
    queue_capacity: usize,
    dropped_samples: AtomicU64,
    stop_tx: Sender<()>,
    join: Option<JoinHandle<()>>,
}

impl CpalMonitorSink {
    pub fn open(format: WaveFormat) -> Result<Self, AudioError> {
        // Half a second of queue; anything beyond that is dropped.
        let queue_capacity = format.samples_per_second() / 2;
        let queue = Arc::new(Mutex::new(VecDeque::with_capacity(queue_capacity)));

        let (ready_tx, ready_rx) = bounded::<Result<(), String>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let cb_queue = Arc::clone(&queue);
        let join = std::thread::Builder::new()
            .name("monitor-output".to_string())
            .spawn(move || {
                let host = cpal::default_host();
                let device = match host.default_output_device() {
                    Some(device) => device,
                    None => {
                        let _ = ready_tx.send(Err("no default output device".to_string()));
                        return;
                    }
                };

                let config = cpal::StreamConfig {
                    channels: format.channels,
                    sample_rate: cpal::SampleRate(format.sample_rate),
                    buffer_size: cpal::BufferSize::Default,
                };

                let stream = device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let mut queue = cb_queue.lock().unwrap();
                        for slot in data.iter_mut() {
                            *slot = queue.pop_front().unwrap_or(0.0);
                        }
                    },
                    |e| warn!("{}: output stream error: {}", "MONITOR".green(), e),
                    None,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(format!("failed to build output stream: {}", e)));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(format!("failed to start output stream: {}", e)));
                    return;
                }

                let _ = ready_tx.send(Ok(()));
                let _ = stop_rx.recv();
            })
            .map_err(|e| AudioError::Capture(format!("failed to spawn monitor thread: {}", e)))?;

        match ready_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(())) => Ok(Self {
                format,
                queue,
                queue_capacity,
                dropped_samples: AtomicU64::new(0),
                stop_tx,
                join: Some(join),
            }),
            Ok(Err(message)) => {
                let _ = join.join();
                Err(AudioError::Capture(format!("monitor output: {}", message)))
            }
            Err(_) => {
                let _ = stop_tx.send(());
                let _ = join.join();
                Err(AudioError::Capture(
                    "timed out opening monitor output".to_string(),
                ))
            }
        }
    }

    pub fn dropped_samples(&self) -> u64 {
        self.dropped_samples.load(Ordering::Relaxed)
    }
}

impl MonitorSink for CpalMonitorSink {
    fn write(&self, pcm16_bytes: &[u8]) {
        let samples = match pcm::bytes_to_float(pcm16_bytes, 2) {
            Ok(samples) => samples,
            Err(e) => {
                warn!("{}: rejected monitor write: {}", "MONITOR".green(), e);
                return;
            }
        };

        let mut queue = self.queue.lock().unwrap();
        let free = self.queue_capacity.saturating_sub(queue.len());
        let accepted = samples.len().min(free);
        queue.extend(samples[..accepted].iter().copied());
        if accepted < samples.len() {
            self.dropped_samples
                .fetch_add((samples.len() - accepted) as u64, Ordering::Relaxed);
        }
    }

    fn format(&self) -> WaveFormat {
        self.format
    }
}

impl Drop for CpalMonitorSink {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingSink {
        format: WaveFormat,
        writes: Arc<Mutex<Vec<usize>>>,
    }

    impl MonitorSink for RecordingSink {
        fn write(&self, pcm16_bytes: &[u8]) {
            self.writes.lock().unwrap().push(pcm16_bytes.len());
        }

        fn format(&self) -> WaveFormat {
            self.format
        }
    }

    #[test]
    fn only_the_selected_stream_reaches_the_sink() {
        let router = MonitorRouter::new();
        let writes = Arc::new(Mutex::new(Vec::new()));
        router.set_sink(Box::new(RecordingSink {
            format: WaveFormat::new(48000, 2),
            writes: Arc::clone(&writes),
        }));
        router.select(Some("stream-a".to_string()));

        router.write_for("stream-a", &[0u8; 4]);
        router.write_for("stream-b", &[0u8; 8]);

        assert_eq!(*writes.lock().unwrap(), vec![4]);
    }

    #[test]
    fn deselecting_mutes_all_writes() {
        let router = MonitorRouter::new();
        router.select(Some("stream-a".to_string()));
        assert_eq!(router.selected(), Some("stream-a".to_string()));
        router.select(None);
        assert_eq!(router.selected(), None);
        // No sink installed; write_for must be a silent no-op either way.
        router.write_for("stream-a", &[0u8; 4]);
    }
}

// Device/loopback capture over cpal.
//
// cpal streams are not `Send`, so the stream lives on a dedicated worker
// thread that parks until stop. The hardware callback copies samples into an
// `AudioBlock` and hands it to the registered handler; block sizes are
// whatever the driver delivers, not the configured buffer size exactly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use colored::*;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, SampleFormat, StreamConfig};
use crossbeam::channel::{bounded, Sender};
use tracing::{error, info, warn};

use crate::audio::types::{AudioBlock, WaveFormat};
use crate::error::AudioError;

use super::{BlockHandler, CaptureSource, ErrorHandler};

const WORKER_READY_TIMEOUT: Duration = Duration::from_secs(5);

struct CaptureWorker {
    stop_tx: Sender<()>,
    join: JoinHandle<()>,
}

/// Capture from a named input device, the system default, or the system
/// output loopback.
pub struct DeviceCaptureSource {
    format: WaveFormat,
    device_id: Option<String>,
    device_name: String,
    loopback: bool,
    buffer_size_frames: Option<u32>,
    block_handler: Option<BlockHandler>,
    error_handler: Option<ErrorHandler>,
    capturing: Arc<AtomicBool>,
    worker: Option<CaptureWorker>,
}

impl DeviceCaptureSource {
    /// Resolve the device immediately so a bad id fails at construction, not
    /// at start.
    pub fn new(
        device_id: Option<String>,
        loopback: bool,
        sample_rate: u32,
        channels: u16,
        buffer_size_frames: Option<u32>,
    ) -> Result<Self, AudioError> {
        let device = resolve_device(device_id.as_deref(), loopback)?;
        let device_name = device
            .name()
            .unwrap_or_else(|_| "<unnamed device>".to_string());

        info!(
            "{}: opened {} \"{}\" at {}Hz/{}ch",
            "CAPTURE_DEVICE".cyan(),
            if loopback { "loopback on" } else { "input" },
            device_name,
            sample_rate,
            channels
        );

        Ok(Self {
            format: WaveFormat::new(sample_rate, channels),
            device_id,
            device_name,
            loopback,
            buffer_size_frames,
            block_handler: None,
            error_handler: None,
            capturing: Arc::new(AtomicBool::new(false)),
            worker: None,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }
}

impl CaptureSource for DeviceCaptureSource {
    fn start(&mut self) -> Result<(), AudioError> {
        if self.capturing.load(Ordering::SeqCst) {
            return Ok(());
        }

        let block_handler = self.block_handler.clone().ok_or_else(|| {
            AudioError::Capture("no block handler registered before start".to_string())
        })?;
        let error_handler = self.error_handler.clone();

        let device_id = self.device_id.clone();
        let loopback = self.loopback;
        let format = self.format;
        let buffer_size_frames = self.buffer_size_frames;
        let capturing = Arc::clone(&self.capturing);

        let (ready_tx, ready_rx) = bounded::<Result<(), String>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let join = std::thread::Builder::new()
            .name("device-capture".to_string())
            .spawn(move || {
                let device = match resolve_device(device_id.as_deref(), loopback) {
                    Ok(device) => device,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };

                let stream = match build_stream(
                    &device,
                    format,
                    buffer_size_frames,
                    block_handler,
                    Arc::clone(&capturing),
                    error_handler,
                ) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(format!("failed to start stream: {}", e)));
                    return;
                }

                let _ = ready_tx.send(Ok(()));
                // Park until stop; the stream is dropped on the way out.
                let _ = stop_rx.recv();
            })
            .map_err(|e| AudioError::Capture(format!("failed to spawn capture thread: {}", e)))?;

        match ready_rx.recv_timeout(WORKER_READY_TIMEOUT) {
            Ok(Ok(())) => {
                self.capturing.store(true, Ordering::SeqCst);
                self.worker = Some(CaptureWorker { stop_tx, join });
                info!(
                    "{}: capturing from \"{}\"",
                    "CAPTURE_DEVICE".cyan(),
                    self.device_name
                );
                Ok(())
            }
            Ok(Err(message)) => {
                let _ = join.join();
                Err(AudioError::Capture(message))
            }
            Err(_) => {
                let _ = stop_tx.send(());
                let _ = join.join();
                Err(AudioError::Capture(
                    "timed out waiting for capture stream to start".to_string(),
                ))
            }
        }
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        self.capturing.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop_tx.send(());
            if worker.join.join().is_err() {
                warn!("{}: capture thread panicked on stop", "CAPTURE_DEVICE".cyan());
            }
        }
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    fn wave_format(&self) -> WaveFormat {
        self.format
    }

    fn on_block(&mut self, handler: BlockHandler) {
        self.block_handler = Some(handler);
    }

    fn on_error(&mut self, handler: ErrorHandler) {
        self.error_handler = Some(handler);
    }
}

impl Drop for DeviceCaptureSource {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Find the configured device. Loopback capture opens the system output
/// device for input, which is how WASAPI-style loopback is exposed.
fn resolve_device(device_id: Option<&str>, loopback: bool) -> Result<Device, AudioError> {
    let host = cpal::default_host();

    if loopback {
        return match device_id {
            None => host.default_output_device().ok_or_else(|| {
                AudioError::Config("no default output device for loopback capture".to_string())
            }),
            Some(id) => find_by_name(
                host.output_devices().map_err(|e| {
                    AudioError::Capture(format!("failed to enumerate output devices: {}", e))
                })?,
                id,
            ),
        };
    }

    match device_id {
        None => host
            .default_input_device()
            .ok_or_else(|| AudioError::Config("no default input device".to_string())),
        Some(id) => find_by_name(
            host.input_devices().map_err(|e| {
                AudioError::Capture(format!("failed to enumerate input devices: {}", e))
            })?,
            id,
        ),
    }
}

fn find_by_name(
    devices: impl Iterator<Item = Device>,
    device_id: &str,
) -> Result<Device, AudioError> {
    for device in devices {
        if device.name().map(|n| n == device_id).unwrap_or(false) {
            return Ok(device);
        }
    }
    Err(AudioError::Config(format!(
        "audio device not found: {}",
        device_id
    )))
}

fn build_stream(
    device: &Device,
    format: WaveFormat,
    buffer_size_frames: Option<u32>,
    block_handler: BlockHandler,
    capturing: Arc<AtomicBool>,
    error_handler: Option<ErrorHandler>,
) -> Result<cpal::Stream, AudioError> {
    let supported = device.default_input_config().map_err(|e| {
        AudioError::Capture(format!("failed to query device input config: {}", e))
    })?;

    let mut config = StreamConfig {
        channels: format.channels,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size: match buffer_size_frames {
            Some(frames) => BufferSize::Fixed(frames),
            None => BufferSize::Default,
        },
    };

    let channels = format.channels;
    let result = match supported.sample_format() {
        SampleFormat::F32 => build_f32_stream(
            device,
            &config,
            channels,
            block_handler.clone(),
            stream_error_callback(Arc::clone(&capturing), error_handler.clone()),
        ),
        SampleFormat::I16 => build_i16_stream(
            device,
            &config,
            channels,
            block_handler.clone(),
            stream_error_callback(Arc::clone(&capturing), error_handler.clone()),
        ),
        other => Err(AudioError::Capture(format!(
            "unsupported device sample format: {:?}",
            other
        ))),
    };

    match result {
        Err(AudioError::Capture(message)) if buffer_size_frames.is_some() => {
            // The configured buffer size is advisory; retry with the driver's
            // default before giving up. The retry stream carries the same
            // terminal-error wiring as the first attempt.
            warn!(
                "{}: fixed buffer size rejected ({}), retrying with driver default",
                "CAPTURE_DEVICE".cyan(),
                message
            );
            config.buffer_size = BufferSize::Default;
            match supported.sample_format() {
                SampleFormat::F32 => build_f32_stream(
                    device,
                    &config,
                    channels,
                    block_handler,
                    stream_error_callback(capturing, error_handler),
                ),
                SampleFormat::I16 => build_i16_stream(
                    device,
                    &config,
                    channels,
                    block_handler,
                    stream_error_callback(capturing, error_handler),
                ),
                other => Err(AudioError::Capture(format!(
                    "unsupported device sample format: {:?}",
                    other
                ))),
            }
        }
        other => other,
    }
}

/// Error callback for one stream build attempt: clears the capturing flag
/// and forwards the failure to the registered handler. Every attempt,
/// including the fixed-buffer retry, gets a callback with this exact wiring.
fn stream_error_callback(
    capturing: Arc<AtomicBool>,
    error_handler: Option<ErrorHandler>,
) -> impl FnMut(cpal::StreamError) + Send + 'static {
    move |e| {
        capturing.store(false, Ordering::SeqCst);
        error!("{}: stream error: {}", "CAPTURE_DEVICE".cyan(), e);
        if let Some(handler) = &error_handler {
            handler(AudioError::Capture(format!("capture stream failed: {}", e)));
        }
    }
}

fn build_f32_stream(
    device: &Device,
    config: &StreamConfig,
    channels: u16,
    block_handler: BlockHandler,
    err_cb: impl FnMut(cpal::StreamError) + Send + 'static,
) -> Result<cpal::Stream, AudioError> {
    device
        .build_input_stream(
            config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                block_handler(AudioBlock::new(data.to_vec(), channels));
            },
            err_cb,
            None,
        )
        .map_err(|e| AudioError::Capture(format!("failed to build input stream: {}", e)))
}

fn build_i16_stream(
    device: &Device,
    config: &StreamConfig,
    channels: u16,
    block_handler: BlockHandler,
    err_cb: impl FnMut(cpal::StreamError) + Send + 'static,
) -> Result<cpal::Stream, AudioError> {
    device
        .build_input_stream(
            config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let samples: Vec<f32> = data.iter().map(|&s| s as f32 / 32768.0).collect();
                block_handler(AudioBlock::new(samples, channels));
            },
            err_cb,
            None,
        )
        .map_err(|e| AudioError::Capture(format!("failed to build input stream: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_handler(count: Arc<AtomicUsize>) -> ErrorHandler {
        Arc::new(move |err| {
            assert!(matches!(err, AudioError::Capture(_)));
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn stream_error_callback_clears_capture_and_notifies() {
        let capturing = Arc::new(AtomicBool::new(true));
        let notified = Arc::new(AtomicUsize::new(0));
        let mut callback = stream_error_callback(
            Arc::clone(&capturing),
            Some(counting_handler(Arc::clone(&notified))),
        );

        callback(cpal::StreamError::DeviceNotAvailable);

        assert!(!capturing.load(Ordering::SeqCst));
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rebuilt_callback_keeps_the_same_wiring() {
        // A fixed-buffer retry builds a second callback from the same shared
        // state; a failure through that one must behave identically.
        let capturing = Arc::new(AtomicBool::new(true));
        let notified = Arc::new(AtomicUsize::new(0));
        let handler = counting_handler(Arc::clone(&notified));

        let _first = stream_error_callback(Arc::clone(&capturing), Some(handler.clone()));
        let mut retry = stream_error_callback(Arc::clone(&capturing), Some(handler));
        retry(cpal::StreamError::DeviceNotAvailable);

        assert!(!capturing.load(Ordering::SeqCst));
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }
}

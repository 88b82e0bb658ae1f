// Low-latency driver capture (JACK/ASIO class hosts).
//
// Opens a named cpal host rather than the default, negotiates the input
// channel count against what the driver exposes, and selects a contiguous
// channel window (offset + count) out of the driver's channel set inside the
// hardware callback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use colored::*;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, Host, SampleFormat, StreamConfig};
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

/// Capture through a named low-latency driver host.
pub struct LowLatencyCaptureSource {
    driver_name: String,
    format: WaveFormat,
    /// Total channels the driver delivers per frame.
    driver_channels: u16,
    channel_offset: u16,
    block_handler: Option<BlockHandler>,
    error_handler: Option<ErrorHandler>,
    capturing: Arc<AtomicBool>,
    worker: Option<CaptureWorker>,
}

impl LowLatencyCaptureSource {
    /// Open the named driver and negotiate the channel window. The delivered
    /// channel count is capped at what the driver exposes past
    /// `channel_offset`; asking for a window that starts beyond the driver's
    /// channel set is a configuration error.
    pub fn new(
        driver_name: &str,
        sample_rate: u32,
        channels: u16,
        channel_offset: u16,
    ) -> Result<Self, AudioError> {
        let host = resolve_host(driver_name)?;
        let device = host.default_input_device().ok_or_else(|| {
            AudioError::Config(format!("driver {} has no input device", driver_name))
        })?;
        let supported = device.default_input_config().map_err(|e| {
            AudioError::Capture(format!("failed to query driver input config: {}", e))
        })?;

        let driver_channels = supported.channels();
        if channel_offset >= driver_channels {
            return Err(AudioError::Config(format!(
                "channel offset {} is past the driver's {} input channels",
                channel_offset, driver_channels
            )));
        }

        let negotiated = channels.min(driver_channels - channel_offset);
        if negotiated < channels {
            warn!(
                "{}: driver {} exposes {} channels past offset {}, capping request of {}",
                "CAPTURE_DRIVER".cyan(),
                driver_name,
                driver_channels - channel_offset,
                channel_offset,
                channels
            );
        }

        info!(
            "{}: opened driver {} at {}Hz, channels {}..{} of {}",
            "CAPTURE_DRIVER".cyan(),
            driver_name,
            sample_rate,
            channel_offset,
            channel_offset + negotiated,
            driver_channels
        );

        Ok(Self {
            driver_name: driver_name.to_string(),
            format: WaveFormat::new(sample_rate, negotiated),
            driver_channels,
            channel_offset,
            block_handler: None,
            error_handler: None,
            capturing: Arc::new(AtomicBool::new(false)),
            worker: None,
        })
    }
}

impl CaptureSource for LowLatencyCaptureSource {
    fn start(&mut self) -> Result<(), AudioError> {
        if self.capturing.load(Ordering::SeqCst) {
            return Ok(());
        }

        let block_handler = self.block_handler.clone().ok_or_else(|| {
            AudioError::Capture("no block handler registered before start".to_string())
        })?;
        let error_handler = self.error_handler.clone();

        let driver_name = self.driver_name.clone();
        let format = self.format;
        let driver_channels = self.driver_channels;
        let offset = self.channel_offset as usize;
        let capturing = Arc::clone(&self.capturing);

        let (ready_tx, ready_rx) = bounded::<Result<(), String>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let join = std::thread::Builder::new()
            .name("driver-capture".to_string())
            .spawn(move || {
                let device = match resolve_host(&driver_name)
                    .and_then(|host| {
                        host.default_input_device().ok_or_else(|| {
                            AudioError::Config(format!(
                                "driver {} has no input device",
                                driver_name
                            ))
                        })
                    }) {
                    Ok(device) => device,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };

                let err_capturing = Arc::clone(&capturing);
                let err_cb = move |e: cpal::StreamError| {
                    err_capturing.store(false, Ordering::SeqCst);
                    error!("{}: stream error: {}", "CAPTURE_DRIVER".cyan(), e);
                    if let Some(handler) = &error_handler {
                        handler(AudioError::Capture(format!("driver stream failed: {}", e)));
                    }
                };

                let stream = match build_window_stream(
                    &device,
                    format,
                    driver_channels,
                    offset,
                    block_handler,
                    err_cb,
                ) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(format!("failed to start driver stream: {}", e)));
                    return;
                }

                let _ = ready_tx.send(Ok(()));
                let _ = stop_rx.recv();
            })
            .map_err(|e| AudioError::Capture(format!("failed to spawn capture thread: {}", e)))?;

        match ready_rx.recv_timeout(WORKER_READY_TIMEOUT) {
            Ok(Ok(())) => {
                self.capturing.store(true, Ordering::SeqCst);
                self.worker = Some(CaptureWorker { stop_tx, join });
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
                    "timed out waiting for driver stream to start".to_string(),
                ))
            }
        }
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        self.capturing.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop_tx.send(());
            if worker.join.join().is_err() {
                warn!("{}: capture thread panicked on stop", "CAPTURE_DRIVER".cyan());
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

impl Drop for LowLatencyCaptureSource {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn resolve_host(driver_name: &str) -> Result<Host, AudioError> {
    let host_id = cpal::available_hosts()
        .into_iter()
        .find(|id| id.name().eq_ignore_ascii_case(driver_name))
        .ok_or_else(|| {
            AudioError::Config(format!("low-latency driver not found: {}", driver_name))
        })?;

    cpal::host_from_id(host_id)
        .map_err(|e| AudioError::Capture(format!("failed to open driver {}: {}", driver_name, e)))
}

/// Build a stream over the driver's full channel set, selecting the
/// negotiated channel window per frame inside the callback.
fn build_window_stream(
    device: &Device,
    format: WaveFormat,
    driver_channels: u16,
    offset: usize,
    block_handler: BlockHandler,
    err_cb: impl FnMut(cpal::StreamError) + Send + 'static,
) -> Result<cpal::Stream, AudioError> {
    let supported = device.default_input_config().map_err(|e| {
        AudioError::Capture(format!("failed to query driver input config: {}", e))
    })?;

    let config = StreamConfig {
        channels: driver_channels,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size: BufferSize::Default,
    };

    let out_channels = format.channels as usize;
    let frame_len = driver_channels as usize;

    match supported.sample_format() {
        SampleFormat::F32 => device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let frames = data.len() / frame_len;
                    let mut samples = Vec::with_capacity(frames * out_channels);
                    for frame in data.chunks_exact(frame_len) {
                        samples.extend_from_slice(&frame[offset..offset + out_channels]);
                    }
                    block_handler(AudioBlock::new(samples, format.channels));
                },
                err_cb,
                None,
            )
            .map_err(|e| AudioError::Capture(format!("failed to build driver stream: {}", e))),
        SampleFormat::I16 => device
            .build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let frames = data.len() / frame_len;
                    let mut samples = Vec::with_capacity(frames * out_channels);
                    for frame in data.chunks_exact(frame_len) {
                        for &s in &frame[offset..offset + out_channels] {
                            samples.push(s as f32 / 32768.0);
                        }
                    }
                    block_handler(AudioBlock::new(samples, format.channels));
                },
                err_cb,
                None,
            )
            .map_err(|e| AudioError::Capture(format!("failed to build driver stream: {}", e))),
        other => Err(AudioError::Capture(format!(
            "unsupported driver sample format: {:?}",
            other
        ))),
    }
}

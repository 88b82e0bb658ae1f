// Capture sources: the hardware boundary of the pipeline.
//
// Every variant normalizes to the same contract: start/stop, a fixed wave
// format decided at construction, and a block-delivery callback invoked on a
// thread owned by the audio backend. The callback path is latency-critical
// and must never block on anything slower than a short mutex.

mod device;
mod low_latency;

pub use device::DeviceCaptureSource;
pub use low_latency::LowLatencyCaptureSource;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::config::CaptureConfig;
use crate::error::AudioError;

use super::types::{AudioBlock, WaveFormat};

pub type BlockHandler = Arc<dyn Fn(AudioBlock) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(AudioError) + Send + Sync>;

/// Capability interface shared by all capture variants.
///
/// Handlers must be registered before `start()`; registrations made while
/// capturing take effect on the next start.
pub trait CaptureSource: Send {
    fn start(&mut self) -> Result<(), AudioError>;
    fn stop(&mut self) -> Result<(), AudioError>;
    fn is_capturing(&self) -> bool;
    fn wave_format(&self) -> WaveFormat;
    fn on_block(&mut self, handler: BlockHandler);
    fn on_error(&mut self, handler: ErrorHandler);
}

/// Build the capture source selected by `config`.
///
/// A missing device or driver fails here, immediately; there is no silent
/// fallback to a different device. The second tuple element is the push
/// handle for manual sources, `None` for hardware variants.
pub fn build_capture_source(
    config: &CaptureConfig,
) -> Result<(Box<dyn CaptureSource>, Option<ManualFeed>), AudioError> {
    match config {
        CaptureConfig::Device {
            device_id,
            loopback,
            sample_rate,
            channels,
            buffer_size_frames,
        } => {
            let source = DeviceCaptureSource::new(
                device_id.clone(),
                *loopback,
                *sample_rate,
                *channels,
                *buffer_size_frames,
            )?;
            Ok((Box::new(source), None))
        }
        CaptureConfig::LowLatency {
            driver_name,
            sample_rate,
            channels,
            channel_offset,
        } => {
            let source = LowLatencyCaptureSource::new(
                driver_name,
                *sample_rate,
                *channels,
                *channel_offset,
            )?;
            Ok((Box::new(source), None))
        }
        CaptureConfig::Manual {
            sample_rate,
            channels,
        } => {
            let source = ManualCaptureSource::new(WaveFormat::new(*sample_rate, *channels));
            let feed = source.feed();
            Ok((Box::new(source), Some(feed)))
        }
    }
}

struct ManualShared {
    format: WaveFormat,
    capturing: AtomicBool,
    block_handler: Mutex<Option<BlockHandler>>,
    error_handler: Mutex<Option<ErrorHandler>>,
}

/// Push-driven capture source for offline feeds and scenario tests.
///
/// Blocks are supplied through the [`ManualFeed`] handle and delivered on the
/// pushing thread, matching the threading contract of the hardware variants.
pub struct ManualCaptureSource {
    shared: Arc<ManualShared>,
}

impl ManualCaptureSource {
    pub fn new(format: WaveFormat) -> Self {
        Self {
            shared: Arc::new(ManualShared {
                format,
                capturing: AtomicBool::new(false),
                block_handler: Mutex::new(None),
                error_handler: Mutex::new(None),
            }),
        }
    }

    pub fn feed(&self) -> ManualFeed {
        ManualFeed {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl CaptureSource for ManualCaptureSource {
    fn start(&mut self) -> Result<(), AudioError> {
        if self.shared.block_handler.lock().unwrap().is_none() {
            warn!("manual capture started with no block handler registered");
        }
        self.shared.capturing.store(true, Ordering::SeqCst);
        info!("manual capture source started ({:?})", self.shared.format);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        self.shared.capturing.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.shared.capturing.load(Ordering::SeqCst)
    }

    fn wave_format(&self) -> WaveFormat {
        self.shared.format
    }

    fn on_block(&mut self, handler: BlockHandler) {
        *self.shared.block_handler.lock().unwrap() = Some(handler);
    }

    fn on_error(&mut self, handler: ErrorHandler) {
        *self.shared.error_handler.lock().unwrap() = Some(handler);
    }
}

/// Clonable push handle for a [`ManualCaptureSource`].
#[derive(Clone)]
pub struct ManualFeed {
    shared: Arc<ManualShared>,
}

impl ManualFeed {
    /// Deliver one interleaved block. Returns whether the source was
    /// capturing and a handler consumed the block.
    pub fn push_block(&self, samples: Vec<f32>) -> bool {
        if !self.shared.capturing.load(Ordering::SeqCst) {
            return false;
        }
        let handler = self.shared.block_handler.lock().unwrap().clone();
        match handler {
            Some(handler) => {
                handler(AudioBlock::new(samples, self.shared.format.channels));
                true
            }
            None => false,
        }
    }

    /// Inject a terminal capture failure, as a disconnected device would.
    pub fn fail(&self, message: &str) {
        self.shared.capturing.store(false, Ordering::SeqCst);
        let handler = self.shared.error_handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(AudioError::Capture(message.to_string()));
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.shared.capturing.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn manual_source_delivers_only_while_capturing() {
        let mut source = ManualCaptureSource::new(WaveFormat::new(48000, 2));
        let feed = source.feed();
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);

        source.on_block(Arc::new(move |block| {
            assert_eq!(block.channels, 2);
            assert_eq!(block.samples_per_channel, 2);
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(!feed.push_block(vec![0.0; 4]));

        source.start().unwrap();
        assert!(feed.push_block(vec![0.0; 4]));
        source.stop().unwrap();
        assert!(!feed.push_block(vec![0.0; 4]));

        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn manual_failure_reaches_the_error_handler_and_stops_capture() {
        let mut source = ManualCaptureSource::new(WaveFormat::new(44100, 1));
        let feed = source.feed();
        let failed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&failed);

        source.on_error(Arc::new(move |err| {
            assert!(matches!(err, AudioError::Capture(_)));
            flag.store(true, Ordering::SeqCst);
        }));

        source.start().unwrap();
        feed.fail("device unplugged");

        assert!(failed.load(Ordering::SeqCst));
        assert!(!source.is_capturing());
    }
}

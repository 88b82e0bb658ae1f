// aircast: live audio capture -> effect chain -> adaptive-bitrate encoding.
//
// One `StreamRegistry` owns any number of `StreamPipeline`s; each pipeline
// captures PCM from a device, loopback, low-latency driver, or manual feed,
// runs it through an ordered effect chain, optionally rate-smooths it, and
// fans the result out to per-rendition encoder processes, visualization
// buffers and taps, and the shared monitor output.

pub mod audio;
pub mod config;
pub mod error;
pub mod log;

pub use audio::{
    AudioBlock, EncoderRendition, ManualFeed, MonitorRouter, PluginRegistry, ShutdownWatchdog,
    StreamPipeline, StreamRegistry, StreamState, StreamStatus, WaveFormat,
};
pub use config::{CaptureConfig, EffectEntryConfig, SmoothingConfig, StreamConfig};
pub use error::AudioError;
pub use log::init_logging;

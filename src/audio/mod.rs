// Audio pipeline: capture, effects, smoothing, encoding, and monitoring.

pub mod capture;
pub mod effects;
pub mod encoder;
pub mod monitor;
pub mod pcm;
pub mod pipeline;
pub mod registry;
pub mod ring_buffer;
pub mod smoothing;
pub mod taps;
pub mod types;

pub use capture::{build_capture_source, CaptureSource, ManualFeed};
pub use effects::{ChainCommand, EffectChain, EffectPlugin, PluginRegistry};
pub use encoder::{EncoderRendition, EncoderSink, SinkState};
pub use monitor::{CpalMonitorSink, MonitorRouter, MonitorSink};
pub use pipeline::StreamPipeline;
pub use registry::{ShutdownWatchdog, StreamRegistry};
pub use ring_buffer::RingAudioBuffer;
pub use smoothing::RateSmoothingBuffer;
pub use taps::{TapId, TapRegistry};
pub use types::{AudioBlock, StreamState, StreamStatus, WaveFormat};

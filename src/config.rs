use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::audio::encoder::EncoderRendition;
use crate::audio::types::{WaveFormat, DEFAULT_CHANNELS, DEFAULT_SAMPLE_RATE};

/// Immutable configuration snapshot for one stream.
///
/// The pipeline reads this once per `start()`; changing any field requires
/// stop + reconfigure + restart. Only per-entry effect bypass state may change
/// while the stream is running, via chain commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub id: String,
    pub name: String,
    pub capture: CaptureConfig,
    #[serde(default)]
    pub effects: Vec<EffectEntryConfig>,
    pub renditions: Vec<EncoderRendition>,
    #[serde(default)]
    pub smoothing: Option<SmoothingConfig>,
    /// Directory the encoder processes write segments and playlists into.
    pub output_dir: PathBuf,
    #[serde(default = "default_encoder_binary")]
    pub encoder_binary: PathBuf,
    /// Forward processed audio to the shared monitor output when this stream
    /// is the selected one.
    #[serde(default)]
    pub monitor_enabled: bool,
}

fn default_encoder_binary() -> PathBuf {
    PathBuf::from("ffmpeg")
}

impl StreamConfig {
    /// Convenience constructor with a generated id and the ambient defaults.
    pub fn new(
        name: impl Into<String>,
        capture: CaptureConfig,
        renditions: Vec<EncoderRendition>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            capture,
            effects: Vec::new(),
            renditions,
            smoothing: None,
            output_dir: output_dir.into(),
            encoder_binary: default_encoder_binary(),
            monitor_enabled: false,
        }
    }
}

/// Capture driver selection and parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "driver", rename_all = "snake_case")]
pub enum CaptureConfig {
    /// Regular device or system-output loopback capture. Block sizes are
    /// driver-determined; `buffer_size_frames` is advisory.
    Device {
        /// `None` selects the system default device.
        device_id: Option<String>,
        #[serde(default)]
        loopback: bool,
        sample_rate: u32,
        channels: u16,
        #[serde(default)]
        buffer_size_frames: Option<u32>,
    },
    /// Named low-latency driver host (JACK/ASIO class). `channel_offset`
    /// selects which of the driver's input channels feed the stream.
    LowLatency {
        driver_name: String,
        sample_rate: u32,
        channels: u16,
        #[serde(default)]
        channel_offset: u16,
    },
    /// Push-driven source for offline feeds and tests; blocks are supplied by
    /// the caller through a `ManualFeed` handle.
    Manual { sample_rate: u32, channels: u16 },
}

impl CaptureConfig {
    pub fn wave_format(&self) -> WaveFormat {
        match *self {
            CaptureConfig::Device {
                sample_rate,
                channels,
                ..
            }
            | CaptureConfig::LowLatency {
                sample_rate,
                channels,
                ..
            }
            | CaptureConfig::Manual {
                sample_rate,
                channels,
            } => WaveFormat::new(sample_rate, channels),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig::Device {
            device_id: None,
            loopback: false,
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            buffer_size_frames: None,
        }
    }
}

/// One entry in the configured effect chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectEntryConfig {
    /// Plugin name looked up in the `PluginRegistry`. An unknown name is a
    /// warning at load time, not a fatal error; the entry is skipped.
    pub plugin: String,
    /// Processing order; ties are broken by insertion order.
    pub order: i32,
    #[serde(default)]
    pub bypassed: bool,
    /// Opaque preset blob handed to the plugin after initialization.
    #[serde(default)]
    pub preset: Option<Vec<u8>>,
}

/// Rate-smoothing buffer configuration. Absent means capture blocks flow to
/// the fan-out directly at whatever cadence the driver delivers them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SmoothingConfig {
    /// Total buffered capacity in seconds of audio.
    pub buffer_seconds: f32,
    /// Fixed output chunk duration in milliseconds.
    pub output_chunk_ms: u32,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            buffer_seconds: 2.0,
            output_chunk_ms: 20,
        }
    }
}

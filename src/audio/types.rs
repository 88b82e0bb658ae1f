use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::encoder::SinkState;

pub const DEFAULT_SAMPLE_RATE: u32 = 48000;
pub const DEFAULT_CHANNELS: u16 = 2;

/// One block of interleaved audio as delivered by a capture callback.
///
/// Blocks are copied, never shared by reference, before being handed to
/// independent consumers so that no consumer's lifetime can pin the capture
/// thread's buffers. Sample values are raw and may exceed [-1, 1]; the final
/// PCM16 conversion before the encoder is the single clamping point.
#[derive(Debug, Clone)]
pub struct AudioBlock {
    /// Interleaved samples, `samples_per_channel * channels` long.
    pub samples: Vec<f32>,
    pub samples_per_channel: usize,
    pub channels: u16,
}

impl AudioBlock {
    pub fn new(samples: Vec<f32>, channels: u16) -> Self {
        debug_assert!(channels > 0);
        debug_assert_eq!(samples.len() % channels as usize, 0);
        let samples_per_channel = samples.len() / channels.max(1) as usize;
        Self {
            samples,
            samples_per_channel,
            channels,
        }
    }
}

/// Fixed capture/delivery format negotiated at source construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl WaveFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample: 32,
        }
    }

    /// Interleaved samples per second for this format.
    pub fn samples_per_second(&self) -> usize {
        self.sample_rate as usize * self.channels as usize
    }
}

/// Lifecycle state of one stream pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StreamState::Stopped => "stopped",
            StreamState::Starting => "starting",
            StreamState::Running => "running",
            StreamState::Stopping => "stopping",
            StreamState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Point-in-time status snapshot for one stream, serializable for callers.
#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub id: String,
    pub name: String,
    pub state: StreamState,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_seconds: u64,
    pub sinks: Vec<SinkStatus>,
    /// Fill percentage of the rate-smoothing buffer, when one is configured.
    /// Sustained values near 100 indicate encoder-side backpressure.
    pub smoothing_fill_percent: Option<f32>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SinkStatus {
    pub rendition: String,
    pub state: SinkState,
    pub blocks_written: u64,
    pub blocks_dropped: u64,
    /// Most recent stderr line from the encoder process, if any.
    pub last_diagnostic: Option<String>,
}

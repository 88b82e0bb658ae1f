// Encoder rendition description and ffmpeg command synthesis.
//
// The argument layout is the compatibility-critical surface shared with the
// HTTP delivery layer: codec names, container flags, and segment/playlist
// naming templates must match exactly what that layer expects on disk.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::audio::types::WaveFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioCodec {
    Aac,
    Mp3,
    Opus,
}

impl AudioCodec {
    pub fn encoder_name(&self) -> &'static str {
        match self {
            AudioCodec::Aac => "aac",
            AudioCodec::Mp3 => "libmp3lame",
            AudioCodec::Opus => "libopus",
        }
    }

    /// RFC 6381 codec string for the master playlist.
    pub fn codec_tag(&self) -> &'static str {
        match self {
            AudioCodec::Aac => "mp4a.40.2",
            AudioCodec::Mp3 => "mp4a.40.34",
            AudioCodec::Opus => "opus",
        }
    }
}

/// Segment container family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerFormat {
    /// Single-file style fragmented MP4 segments.
    Fmp4,
    /// MPEG transport-stream segments.
    MpegTs,
}

/// Pull-based streaming manifest family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamFormat {
    /// Simple indexed playlist (HLS).
    Hls,
    /// Template-based manifest with its own segment addressing (DASH).
    Dash,
}

/// One encoded output variant of a stream.
///
/// Immutable once the encoder process is spawned; changing any field requires
/// stop + respawn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderRendition {
    pub name: String,
    pub codec: AudioCodec,
    pub bitrate_bits: u32,
    pub output_sample_rate: u32,
    pub segment_duration_seconds: u32,
    pub playlist_size: u32,
    pub container_format: ContainerFormat,
    pub stream_format: StreamFormat,
}

impl EncoderRendition {
    pub fn bitrate_kbps(&self) -> u32 {
        self.bitrate_bits / 1000
    }

    /// Directory this rendition writes into, below the stream output dir.
    pub fn output_subdir(&self, output_dir: &Path) -> PathBuf {
        output_dir.join(&self.name)
    }

    /// The rendition's own playlist/manifest path, relative to the stream
    /// output dir. This is what the master manifest references.
    pub fn playlist_relative_path(&self) -> String {
        match self.stream_format {
            StreamFormat::Hls => format!("{}/index.m3u8", self.name),
            StreamFormat::Dash => format!("{}/manifest.mpd", self.name),
        }
    }

    fn segment_extension(&self) -> &'static str {
        match self.container_format {
            ContainerFormat::Fmp4 => "m4s",
            ContainerFormat::MpegTs => "ts",
        }
    }

    /// Full ffmpeg argument list for this rendition: raw signed-16-bit
    /// little-endian interleaved PCM on stdin, segments and playlist under
    /// `output_dir/<name>/`.
    pub fn build_args(&self, input: &WaveFormat, output_dir: &Path) -> Vec<String> {
        let subdir = self.output_subdir(output_dir);
        let mut args = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "warning".to_string(),
            "-f".to_string(),
            "s16le".to_string(),
            "-ar".to_string(),
            input.sample_rate.to_string(),
            "-ac".to_string(),
            input.channels.to_string(),
            "-i".to_string(),
            "-".to_string(),
            "-c:a".to_string(),
            self.codec.encoder_name().to_string(),
            "-b:a".to_string(),
            self.bitrate_bits.to_string(),
        ];

        // Resampling is delegated to the encoder; requesting the output rate
        // here avoids a second resampler inside the pipeline.
        if self.output_sample_rate != input.sample_rate {
            args.push("-ar".to_string());
            args.push(self.output_sample_rate.to_string());
        }

        match self.stream_format {
            StreamFormat::Hls => {
                args.extend([
                    "-f".to_string(),
                    "hls".to_string(),
                    "-hls_time".to_string(),
                    self.segment_duration_seconds.to_string(),
                    "-hls_list_size".to_string(),
                    self.playlist_size.to_string(),
                    // temp_file makes segment finalization an atomic rename,
                    // so the delivery layer never serves a partial write.
                    "-hls_flags".to_string(),
                    "delete_segments+temp_file".to_string(),
                ]);
                if self.container_format == ContainerFormat::Fmp4 {
                    args.push("-hls_segment_type".to_string());
                    args.push("fmp4".to_string());
                }
                args.push("-hls_segment_filename".to_string());
                args.push(
                    subdir
                        .join(format!("segment_%05d.{}", self.segment_extension()))
                        .to_string_lossy()
                        .into_owned(),
                );
                args.push(subdir.join("index.m3u8").to_string_lossy().into_owned());
            }
            StreamFormat::Dash => {
                args.extend([
                    "-f".to_string(),
                    "dash".to_string(),
                    "-seg_duration".to_string(),
                    self.segment_duration_seconds.to_string(),
                    "-window_size".to_string(),
                    self.playlist_size.to_string(),
                    "-remove_at_exit".to_string(),
                    "0".to_string(),
                ]);
                args.push(subdir.join("manifest.mpd").to_string_lossy().into_owned());
            }
        }

        args
    }
}

// Master manifest listing every rendition of a stream.
//
// Written before any sink starts serving so the delivery layer always finds
// a complete rendition list. The write goes through a temp file and an
// atomic rename; a partially written manifest is never visible on disk.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use super::rendition::EncoderRendition;

pub const MASTER_MANIFEST_NAME: &str = "master.m3u8";

/// Render the master playlist body.
pub fn render_master_manifest(renditions: &[EncoderRendition]) -> String {
    let mut body = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
    for rendition in renditions {
        body.push_str(&format!(
            "#EXT-X-STREAM-INF:BANDWIDTH={},CODECS=\"{}\",NAME=\"{}\"\n{}\n",
            rendition.bitrate_bits,
            rendition.codec.codec_tag(),
            rendition.name,
            rendition.playlist_relative_path()
        ));
    }
    body
}

/// Write the master manifest into `output_dir` atomically and return its
/// final path.
pub async fn write_master_manifest(
    output_dir: &Path,
    renditions: &[EncoderRendition],
) -> Result<PathBuf> {
    tokio::fs::create_dir_all(output_dir)
        .await
        .with_context(|| format!("failed to create output dir {}", output_dir.display()))?;

    let final_path = output_dir.join(MASTER_MANIFEST_NAME);
    let temp_path = output_dir.join(format!("{}.tmp", MASTER_MANIFEST_NAME));

    let body = render_master_manifest(renditions);
    tokio::fs::write(&temp_path, body.as_bytes())
        .await
        .with_context(|| format!("failed to write {}", temp_path.display()))?;
    tokio::fs::rename(&temp_path, &final_path)
        .await
        .with_context(|| format!("failed to finalize {}", final_path.display()))?;

    info!(
        "wrote master manifest {} ({} renditions)",
        final_path.display(),
        renditions.len()
    );
    Ok(final_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::encoder::rendition::{AudioCodec, ContainerFormat, StreamFormat};

    fn renditions() -> Vec<EncoderRendition> {
        vec![
            EncoderRendition {
                name: "aac_64k".to_string(),
                codec: AudioCodec::Aac,
                bitrate_bits: 64_000,
                output_sample_rate: 48000,
                segment_duration_seconds: 4,
                playlist_size: 6,
                container_format: ContainerFormat::MpegTs,
                stream_format: StreamFormat::Hls,
            },
            EncoderRendition {
                name: "aac_192k".to_string(),
                codec: AudioCodec::Aac,
                bitrate_bits: 192_000,
                output_sample_rate: 48000,
                segment_duration_seconds: 4,
                playlist_size: 6,
                container_format: ContainerFormat::MpegTs,
                stream_format: StreamFormat::Hls,
            },
        ]
    }

    #[test]
    fn master_manifest_lists_every_rendition() {
        let body = render_master_manifest(&renditions());
        assert!(body.starts_with("#EXTM3U\n"));
        assert!(body.contains("BANDWIDTH=64000"));
        assert!(body.contains("BANDWIDTH=192000"));
        assert!(body.contains("aac_64k/index.m3u8"));
        assert!(body.contains("aac_192k/index.m3u8"));
        assert!(body.contains("CODECS=\"mp4a.40.2\""));
    }

    #[tokio::test]
    async fn manifest_is_written_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_master_manifest(dir.path(), &renditions())
            .await
            .unwrap();

        assert_eq!(path, dir.path().join(MASTER_MANIFEST_NAME));
        assert!(path.is_file());
        assert!(!dir
            .path()
            .join(format!("{}.tmp", MASTER_MANIFEST_NAME))
            .exists());

        let body = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(body.contains("aac_64k"));
    }
}

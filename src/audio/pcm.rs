// Stateless PCM sample format conversions shared across the pipeline.
//
// Every function allocates its own output; callers own the returned buffers
// and the functions are safe to call from any thread, including the capture
// callback.

use crate::error::AudioError;

/// Convert little-endian integer PCM (16- or 24-bit) or 32-bit IEEE float
/// bytes into normalized interleaved f32 samples.
///
/// A byte length that is not a multiple of `bytes_per_sample` is a format
/// error rather than a silent truncation.
pub fn bytes_to_float(bytes: &[u8], bytes_per_sample: usize) -> Result<Vec<f32>, AudioError> {
    if bytes_per_sample == 0 || bytes.len() % bytes_per_sample != 0 {
        return Err(AudioError::Format(format!(
            "byte length {} is not a multiple of sample width {}",
            bytes.len(),
            bytes_per_sample
        )));
    }

    let mut samples = Vec::with_capacity(bytes.len() / bytes_per_sample);

    match bytes_per_sample {
        2 => {
            for chunk in bytes.chunks_exact(2) {
                let value = i16::from_le_bytes([chunk[0], chunk[1]]);
                samples.push(value as f32 / 32768.0);
            }
        }
        3 => {
            for chunk in bytes.chunks_exact(3) {
                // Sign-extend the 24-bit little-endian value through i32.
                let value = i32::from_le_bytes([0, chunk[0], chunk[1], chunk[2]]) >> 8;
                samples.push(value as f32 / 8_388_608.0);
            }
        }
        4 => {
            for chunk in bytes.chunks_exact(4) {
                samples.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
            }
        }
        other => {
            return Err(AudioError::Format(format!(
                "unsupported sample width: {} bytes",
                other
            )));
        }
    }

    Ok(samples)
}

/// Convert f32 samples to 16-bit signed little-endian PCM for the encoder.
///
/// Each sample is clamped to [-1, 1] before scaling. This is the single point
/// where out-of-range audio (for example from an unclamped effect) is made
/// safe for the encoder; the clipping is intentional lossy protection.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let clamped = sample.clamp(-1.0, 1.0);
        let value = (clamped * 32767.0) as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// 24-bit mirror of [`float_to_pcm16`], scaled at `2^23 - 1`.
pub fn float_to_pcm24(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 3);
    for &sample in samples {
        let clamped = sample.clamp(-1.0, 1.0);
        let value = (clamped * 8_388_607.0) as i32;
        let le = value.to_le_bytes();
        bytes.extend_from_slice(&le[0..3]);
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm16_decodes_known_values() {
        // 0, max positive, min negative
        let bytes = [0x00, 0x00, 0xFF, 0x7F, 0x00, 0x80];
        let samples = bytes_to_float(&bytes, 2).unwrap();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0], 0.0);
        assert!((samples[1] - (32767.0 / 32768.0)).abs() < 1e-6);
        assert_eq!(samples[2], -1.0);
    }

    #[test]
    fn pcm24_sign_extends_negative_values() {
        // -1 as 24-bit two's complement, little-endian
        let bytes = [0xFF, 0xFF, 0xFF];
        let samples = bytes_to_float(&bytes, 3).unwrap();
        assert!((samples[0] - (-1.0 / 8_388_608.0)).abs() < 1e-9);
    }

    #[test]
    fn float32_bytes_pass_through() {
        let bytes = 0.25f32.to_le_bytes();
        let samples = bytes_to_float(&bytes, 4).unwrap();
        assert_eq!(samples, vec![0.25]);
    }

    #[test]
    fn malformed_length_is_a_format_error() {
        let err = bytes_to_float(&[0x00, 0x01, 0x02], 2).unwrap_err();
        assert!(matches!(err, AudioError::Format(_)));
    }

    #[test]
    fn unsupported_width_is_a_format_error() {
        let err = bytes_to_float(&[0; 8], 8).unwrap_err();
        assert!(matches!(err, AudioError::Format(_)));
    }

    #[test]
    fn pcm16_encode_clamps_out_of_range_input() {
        let bytes = float_to_pcm16(&[2.0, -5.0]);
        let high = i16::from_le_bytes([bytes[0], bytes[1]]);
        let low = i16::from_le_bytes([bytes[2], bytes[3]]);
        assert_eq!(high, 32767);
        assert_eq!(low, -32767);
    }

    #[test]
    fn pcm24_encode_packs_three_bytes_per_sample() {
        let bytes = float_to_pcm24(&[1.0, -1.0, 0.0]);
        assert_eq!(bytes.len(), 9);
        assert_eq!(&bytes[0..3], &[0xFF, 0xFF, 0x7F]);
        assert_eq!(&bytes[6..9], &[0x00, 0x00, 0x00]);
    }
}

// Property tests for the PCM conversion layer: encoding to integer PCM and
// decoding back must stay within one quantization step, and out-of-range
// input must clamp rather than wrap.

use aircast::audio::pcm;
use proptest::prelude::*;

proptest! {
    #[test]
    fn pcm16_round_trip_stays_within_one_step(sample in -1.0f32..=1.0f32) {
        let bytes = pcm::float_to_pcm16(&[sample]);
        let back = pcm::bytes_to_float(&bytes, 2).unwrap();
        prop_assert_eq!(back.len(), 1);
        // Truncation on encode plus the 32767/32768 scale asymmetry.
        prop_assert!((back[0] - sample).abs() <= 2.0 / 32768.0 + 1e-6);
    }

    #[test]
    fn pcm24_round_trip_stays_within_one_step(sample in -1.0f32..=1.0f32) {
        let bytes = pcm::float_to_pcm24(&[sample]);
        let back = pcm::bytes_to_float(&bytes, 3).unwrap();
        prop_assert_eq!(back.len(), 1);
        prop_assert!((back[0] - sample).abs() <= 2.0 / 8_388_608.0 + 1e-6);
    }

    #[test]
    fn out_of_range_input_clamps_to_full_scale(sample in prop_oneof![1.0f32..=100.0, -100.0f32..=-1.0]) {
        let bytes = pcm::float_to_pcm16(&[sample]);
        let value = i16::from_le_bytes([bytes[0], bytes[1]]);
        prop_assert_eq!(value.abs(), 32767);
        prop_assert_eq!(value.signum() as f32, sample.signum());
    }

    #[test]
    fn pcm16_decode_never_exceeds_unit_range(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
        let even = &bytes[..bytes.len() - bytes.len() % 2];
        let samples = pcm::bytes_to_float(even, 2).unwrap();
        for sample in samples {
            prop_assert!((-1.0..=1.0).contains(&sample));
        }
    }
}

#[test]
fn interleaved_blocks_convert_sample_by_sample() {
    let input = vec![0.0, 0.5, -0.5, 1.0];
    let bytes = pcm::float_to_pcm16(&input);
    assert_eq!(bytes.len(), input.len() * 2);

    let back = pcm::bytes_to_float(&bytes, 2).unwrap();
    assert_eq!(back.len(), input.len());
    for (orig, round) in input.iter().zip(&back) {
        assert!((orig - round).abs() <= 2.0 / 32768.0 + 1e-6);
    }
}

// Dynamic range compressor plugin with per-channel envelope followers.

use serde::{Deserialize, Serialize};

use crate::error::AudioError;

use super::plugin::EffectPlugin;

const MIN_DB: f32 = -100.0;
const MIN_LOG_INPUT: f32 = 1e-10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct CompressorPreset {
    threshold_db: f32,
    ratio: f32,
    attack_ms: f32,
    release_ms: f32,
}

impl Default for CompressorPreset {
    fn default() -> Self {
        Self {
            threshold_db: -12.0,
            ratio: 4.0,
            attack_ms: 10.0,
            release_ms: 200.0,
        }
    }
}

#[derive(Debug)]
pub struct CompressorPlugin {
    preset: CompressorPreset,
    sample_rate: u32,
    attack_coeff: f32,
    release_coeff: f32,
    envelopes: Vec<f32>,
}

impl CompressorPlugin {
    pub fn new() -> Self {
        Self {
            preset: CompressorPreset::default(),
            sample_rate: 0,
            attack_coeff: 0.0,
            release_coeff: 0.0,
            envelopes: Vec::new(),
        }
    }

    pub fn preset_bytes(threshold_db: f32, ratio: f32, attack_ms: f32, release_ms: f32) -> Vec<u8> {
        serde_json::to_vec(&CompressorPreset {
            threshold_db,
            ratio,
            attack_ms,
            release_ms,
        })
        .unwrap_or_default()
    }

    fn update_coefficients(&mut self) {
        if self.sample_rate == 0 {
            return;
        }
        let rate = self.sample_rate as f32;
        self.attack_coeff = (-1.0 / (self.preset.attack_ms.max(0.01) * 0.001 * rate)).exp();
        self.release_coeff = (-1.0 / (self.preset.release_ms.max(0.01) * 0.001 * rate)).exp();
    }

    fn compress_sample(&mut self, channel: usize, sample: f32) -> f32 {
        let input = if sample.is_finite() { sample } else { 0.0 };
        let level = input.abs();
        let level_db = if level > MIN_LOG_INPUT {
            (20.0 * level.log10()).clamp(MIN_DB, 40.0)
        } else {
            MIN_DB
        };

        let envelope = self.envelopes[channel];
        let coeff = if level_db > envelope {
            self.attack_coeff
        } else {
            self.release_coeff
        };
        let next = level_db + (envelope - level_db) * coeff;
        self.envelopes[channel] = if next.is_finite() { next } else { MIN_DB };

        let over = self.envelopes[channel] - self.preset.threshold_db;
        if over <= 0.0 {
            return input;
        }

        let reduction_db = (over - over / self.preset.ratio.max(1.0)).clamp(0.0, 60.0);
        let gain = 10.0f32.powf(-reduction_db / 20.0).clamp(0.001, 1.0);
        input * gain
    }
}

impl Default for CompressorPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl EffectPlugin for CompressorPlugin {
    fn name(&self) -> &str {
        "compressor"
    }

    fn initialize(&mut self, sample_rate: u32, _max_block_size: usize) -> Result<(), AudioError> {
        if sample_rate == 0 {
            return Err(AudioError::Plugin("sample rate must be non-zero".to_string()));
        }
        self.sample_rate = sample_rate;
        self.update_coefficients();
        self.reset();
        Ok(())
    }

    fn process(
        &mut self,
        input: &[Vec<f32>],
        output: &mut [Vec<f32>],
        frames: usize,
    ) -> Result<(), AudioError> {
        if self.sample_rate == 0 {
            return Err(AudioError::Plugin("compressor not initialized".to_string()));
        }

        while self.envelopes.len() < input.len() {
            self.envelopes.push(MIN_DB);
        }

        for ch in 0..input.len() {
            for f in 0..frames {
                output[ch][f] = self.compress_sample(ch, input[ch][f]);
            }
        }
        Ok(())
    }

    fn preset(&self) -> Vec<u8> {
        serde_json::to_vec(&self.preset).unwrap_or_default()
    }

    fn set_preset(&mut self, preset: &[u8]) -> Result<(), AudioError> {
        let parsed: CompressorPreset = serde_json::from_slice(preset)
            .map_err(|e| AudioError::Plugin(format!("invalid compressor preset: {}", e)))?;
        if parsed.ratio < 1.0 {
            return Err(AudioError::Plugin(format!(
                "compression ratio must be >= 1.0, got {}",
                parsed.ratio
            )));
        }
        self.preset = parsed;
        self.update_coefficients();
        Ok(())
    }

    fn reset(&mut self) {
        self.envelopes.clear();
    }
}

use serde::{Deserialize, Serialize};

use crate::error::AudioError;

use super::plugin::EffectPlugin;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct GainPreset {
    gain_db: f32,
}

/// Flat gain stage.
#[derive(Debug)]
pub struct GainPlugin {
    gain_db: f32,
    gain_linear: f32,
}

impl GainPlugin {
    pub fn new() -> Self {
        Self {
            gain_db: 0.0,
            gain_linear: 1.0,
        }
    }

    pub fn set_gain_db(&mut self, gain_db: f32) {
        self.gain_db = gain_db;
        self.gain_linear = 10.0f32.powf(gain_db / 20.0);
    }

    /// Serialized preset for a given gain, as stored in stream configs.
    pub fn preset_bytes(gain_db: f32) -> Vec<u8> {
        serde_json::to_vec(&GainPreset { gain_db }).unwrap_or_default()
    }
}

impl Default for GainPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl EffectPlugin for GainPlugin {
    fn name(&self) -> &str {
        "gain"
    }

    fn initialize(&mut self, _sample_rate: u32, _max_block_size: usize) -> Result<(), AudioError> {
        Ok(())
    }

    fn process(
        &mut self,
        input: &[Vec<f32>],
        output: &mut [Vec<f32>],
        frames: usize,
    ) -> Result<(), AudioError> {
        for (in_ch, out_ch) in input.iter().zip(output.iter_mut()) {
            for f in 0..frames {
                out_ch[f] = in_ch[f] * self.gain_linear;
            }
        }
        Ok(())
    }

    fn preset(&self) -> Vec<u8> {
        Self::preset_bytes(self.gain_db)
    }

    fn set_preset(&mut self, preset: &[u8]) -> Result<(), AudioError> {
        let parsed: GainPreset = serde_json::from_slice(preset)
            .map_err(|e| AudioError::Plugin(format!("invalid gain preset: {}", e)))?;
        self.set_gain_db(parsed.gain_db);
        Ok(())
    }

    fn reset(&mut self) {}
}

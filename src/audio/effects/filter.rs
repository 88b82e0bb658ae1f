// Biquad high-pass/low-pass filter plugin.
//
// Coefficients follow the RBJ cookbook forms; filter state is kept per
// channel and grows lazily with the channel count seen in process calls.

use serde::{Deserialize, Serialize};

use crate::error::AudioError;

use super::plugin::EffectPlugin;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum FilterMode {
    HighPass,
    LowPass,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct FilterPreset {
    cutoff_hz: f32,
    q: f32,
}

#[derive(Debug, Clone, Copy, Default)]
struct BiquadState {
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

#[derive(Debug)]
pub struct BiquadFilterPlugin {
    mode: FilterMode,
    cutoff_hz: f32,
    q: f32,
    sample_rate: u32,
    // Normalized coefficients (a0 divided through).
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    states: Vec<BiquadState>,
}

impl BiquadFilterPlugin {
    pub fn high_pass() -> Self {
        Self::with_mode(FilterMode::HighPass, 80.0)
    }

    pub fn low_pass() -> Self {
        Self::with_mode(FilterMode::LowPass, 12000.0)
    }

    fn with_mode(mode: FilterMode, cutoff_hz: f32) -> Self {
        Self {
            mode,
            cutoff_hz,
            q: std::f32::consts::FRAC_1_SQRT_2,
            sample_rate: 0,
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
            states: Vec::new(),
        }
    }

    pub fn preset_bytes(cutoff_hz: f32, q: f32) -> Vec<u8> {
        serde_json::to_vec(&FilterPreset { cutoff_hz, q }).unwrap_or_default()
    }

    fn update_coefficients(&mut self) {
        if self.sample_rate == 0 {
            return;
        }

        let omega = 2.0 * std::f32::consts::PI * self.cutoff_hz / self.sample_rate as f32;
        let (sin_w, cos_w) = omega.sin_cos();
        let alpha = sin_w / (2.0 * self.q);
        let a0 = 1.0 + alpha;

        match self.mode {
            FilterMode::HighPass => {
                self.b0 = (1.0 + cos_w) / 2.0 / a0;
                self.b1 = -(1.0 + cos_w) / a0;
                self.b2 = (1.0 + cos_w) / 2.0 / a0;
            }
            FilterMode::LowPass => {
                self.b0 = (1.0 - cos_w) / 2.0 / a0;
                self.b1 = (1.0 - cos_w) / a0;
                self.b2 = (1.0 - cos_w) / 2.0 / a0;
            }
        }
        self.a1 = -2.0 * cos_w / a0;
        self.a2 = (1.0 - alpha) / a0;
    }
}

impl EffectPlugin for BiquadFilterPlugin {
    fn name(&self) -> &str {
        match self.mode {
            FilterMode::HighPass => "highpass",
            FilterMode::LowPass => "lowpass",
        }
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
            return Err(AudioError::Plugin("filter not initialized".to_string()));
        }

        while self.states.len() < input.len() {
            self.states.push(BiquadState::default());
        }

        for (ch, (in_ch, out_ch)) in input.iter().zip(output.iter_mut()).enumerate() {
            let state = &mut self.states[ch];
            for f in 0..frames {
                let x = in_ch[f];
                let y = self.b0 * x + self.b1 * state.x1 + self.b2 * state.x2
                    - self.a1 * state.y1
                    - self.a2 * state.y2;
                state.x2 = state.x1;
                state.x1 = x;
                state.y2 = state.y1;
                state.y1 = if y.is_finite() { y } else { 0.0 };
                out_ch[f] = state.y1;
            }
        }
        Ok(())
    }

    fn preset(&self) -> Vec<u8> {
        Self::preset_bytes(self.cutoff_hz, self.q)
    }

    fn set_preset(&mut self, preset: &[u8]) -> Result<(), AudioError> {
        let parsed: FilterPreset = serde_json::from_slice(preset)
            .map_err(|e| AudioError::Plugin(format!("invalid filter preset: {}", e)))?;
        if parsed.cutoff_hz <= 0.0 || parsed.q <= 0.0 {
            return Err(AudioError::Plugin(format!(
                "filter preset out of range: cutoff {} q {}",
                parsed.cutoff_hz, parsed.q
            )));
        }
        self.cutoff_hz = parsed.cutoff_hz;
        self.q = parsed.q;
        self.update_coefficients();
        Ok(())
    }

    fn reset(&mut self) {
        self.states.clear();
    }
}

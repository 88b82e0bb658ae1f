// Ordered effect chain engine.
//
// Plugins execute strictly in ascending configured order; the output of
// plugin k becomes the input of plugin k+1 through ping-pong between two
// interleaved scratch buffers, so no extra copies happen between stages.
// Bypass and plugin failure both short-circuit to exact passthrough.

use colored::*;
use crossbeam::channel::{unbounded, Receiver, Sender};
use tracing::{info, warn};

use crate::config::EffectEntryConfig;
use crate::error::AudioError;

use super::plugin::{ChainCommand, EffectPlugin, PluginRegistry};

/// One chain entry at runtime: a plugin instance plus its per-channel
/// deinterleaved scratch buffers, sized to the largest block seen so far
/// (grow-only, never shrunk, to avoid reallocation thrash).
pub struct LoadedEffect {
    name: String,
    bypassed: bool,
    plugin: Box<dyn EffectPlugin>,
    scratch_in: Vec<Vec<f32>>,
    scratch_out: Vec<Vec<f32>>,
}

impl LoadedEffect {
    fn ensure_scratch(&mut self, channels: usize, frames: usize) {
        while self.scratch_in.len() < channels {
            self.scratch_in.push(Vec::new());
            self.scratch_out.push(Vec::new());
        }
        for ch in 0..channels {
            if self.scratch_in[ch].len() < frames {
                self.scratch_in[ch].resize(frames, 0.0);
            }
            if self.scratch_out[ch].len() < frames {
                self.scratch_out[ch].resize(frames, 0.0);
            }
        }
    }

    /// Deinterleave, process, interleave into `dst`. Err means `dst` was not
    /// written and the caller should pass the input through unchanged.
    fn run(&mut self, src: &[f32], dst: &mut Vec<f32>, channels: usize) -> Result<(), AudioError> {
        let frames = src.len() / channels;
        self.ensure_scratch(channels, frames);

        for ch in 0..channels {
            for f in 0..frames {
                self.scratch_in[ch][f] = src[f * channels + ch];
            }
            // Output buffers are handed to the plugin zeroed.
            self.scratch_out[ch][..frames].fill(0.0);
        }

        self.plugin.process(
            &self.scratch_in[..channels],
            &mut self.scratch_out[..channels],
            frames,
        )?;

        dst.clear();
        dst.reserve(src.len());
        for f in 0..frames {
            for ch in 0..channels {
                dst.push(self.scratch_out[ch][f]);
            }
        }
        Ok(())
    }
}

enum Slot {
    Input,
    A,
    B,
}

/// Ordered, mutable list of effect instances for one stream.
///
/// Owned exclusively by that stream; the capture thread drives
/// `process_block` while other threads mutate bypass/preset state through
/// [`ChainCommand`]s, which are applied between blocks.
pub struct EffectChain {
    sample_rate: u32,
    channels: u16,
    effects: Vec<LoadedEffect>,
    command_tx: Sender<ChainCommand>,
    command_rx: Receiver<ChainCommand>,
    buf_a: Vec<f32>,
    buf_b: Vec<f32>,
}

impl EffectChain {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        let (command_tx, command_rx) = unbounded();
        Self {
            sample_rate,
            channels,
            effects: Vec::new(),
            command_tx,
            command_rx,
            buf_a: Vec::new(),
            buf_b: Vec::new(),
        }
    }

    /// Instantiate and initialize the configured entries in ascending order
    /// (stable for ties). A missing plugin or rejected preset is a warning;
    /// the stream starts without that stage.
    pub fn load(
        &mut self,
        registry: &PluginRegistry,
        entries: &[EffectEntryConfig],
        max_block_frames: usize,
    ) {
        let mut sorted: Vec<&EffectEntryConfig> = entries.iter().collect();
        sorted.sort_by_key(|entry| entry.order);

        for entry in sorted {
            let mut plugin = match registry.create(&entry.plugin) {
                Some(plugin) => plugin,
                None => {
                    warn!(
                        "{}: unknown plugin \"{}\", skipping chain entry",
                        "EFFECT_CHAIN".purple(),
                        entry.plugin
                    );
                    continue;
                }
            };

            if let Err(e) = plugin.initialize(self.sample_rate, max_block_frames) {
                warn!(
                    "{}: plugin \"{}\" failed to initialize ({}), skipping",
                    "EFFECT_CHAIN".purple(),
                    entry.plugin,
                    e
                );
                continue;
            }

            if let Some(preset) = &entry.preset {
                if let Err(e) = plugin.set_preset(preset) {
                    warn!(
                        "{}: plugin \"{}\" rejected preset ({}), using defaults",
                        "EFFECT_CHAIN".purple(),
                        entry.plugin,
                        e
                    );
                }
            }

            self.effects.push(LoadedEffect {
                name: entry.plugin.clone(),
                bypassed: entry.bypassed,
                plugin,
                scratch_in: Vec::new(),
                scratch_out: Vec::new(),
            });
        }

        info!(
            "{}: loaded {} of {} configured effects",
            "EFFECT_CHAIN".purple(),
            self.effects.len(),
            entries.len()
        );
    }

    /// Sender for runtime bypass/preset commands; clonable across threads.
    pub fn command_sender(&self) -> Sender<ChainCommand> {
        self.command_tx.clone()
    }

    /// Run one interleaved block through the chain and return the processed
    /// samples. The returned slice borrows either the input (fully bypassed
    /// or empty chain) or an internal scratch buffer; callers copy before the
    /// next block.
    pub fn process_block<'a>(&'a mut self, samples: &'a [f32]) -> &'a [f32] {
        self.apply_pending_commands();

        let channels = self.channels as usize;
        if samples.is_empty() || channels == 0 || self.effects.is_empty() {
            return samples;
        }

        let Self {
            effects,
            buf_a,
            buf_b,
            ..
        } = self;

        let mut cur = Slot::Input;
        for effect in effects.iter_mut() {
            if effect.bypassed {
                // True zero-latency passthrough: the plugin is not invoked
                // and the current buffer flows on untouched.
                continue;
            }

            let (src, dst): (&[f32], &mut Vec<f32>) = match cur {
                Slot::Input => (samples, &mut *buf_a),
                Slot::A => (&buf_a[..], &mut *buf_b),
                Slot::B => (&buf_b[..], &mut *buf_a),
            };

            match effect.run(src, dst, channels) {
                Ok(()) => {
                    cur = match cur {
                        Slot::Input => Slot::A,
                        Slot::A => Slot::B,
                        Slot::B => Slot::A,
                    };
                }
                Err(e) => {
                    // One misbehaving plugin must not take down the stream:
                    // this block passes through unchanged and the chain
                    // continues.
                    warn!(
                        "{}: plugin \"{}\" failed ({}), passing block through",
                        "EFFECT_CHAIN".purple(),
                        effect.name,
                        e
                    );
                }
            }
        }

        match cur {
            Slot::Input => samples,
            Slot::A => &*buf_a,
            Slot::B => &*buf_b,
        }
    }

    fn apply_pending_commands(&mut self) {
        while let Ok(command) = self.command_rx.try_recv() {
            match command {
                ChainCommand::SetBypassed { index, bypassed } => {
                    match self.effects.get_mut(index) {
                        Some(effect) => {
                            effect.bypassed = bypassed;
                            info!(
                                "{}: \"{}\" bypass set to {}",
                                "EFFECT_CHAIN".purple(),
                                effect.name,
                                bypassed
                            );
                        }
                        None => warn!(
                            "{}: bypass command for out-of-range index {}",
                            "EFFECT_CHAIN".purple(),
                            index
                        ),
                    }
                }
                ChainCommand::SetPreset { index, preset } => {
                    match self.effects.get_mut(index) {
                        Some(effect) => {
                            if let Err(e) = effect.plugin.set_preset(&preset) {
                                warn!(
                                    "{}: \"{}\" rejected preset update: {}",
                                    "EFFECT_CHAIN".purple(),
                                    effect.name,
                                    e
                                );
                            }
                        }
                        None => warn!(
                            "{}: preset command for out-of-range index {}",
                            "EFFECT_CHAIN".purple(),
                            index
                        ),
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    pub fn effect_names(&self) -> Vec<String> {
        self.effects.iter().map(|e| e.name.clone()).collect()
    }

    pub fn is_bypassed(&self, index: usize) -> Option<bool> {
        self.effects.get(index).map(|e| e.bypassed)
    }

    /// Drop all plugin instances and runtime state. Called when the pipeline
    /// stops or reconfigures.
    pub fn release(&mut self) {
        for effect in &mut self.effects {
            effect.plugin.reset();
        }
        self.effects.clear();
        self.buf_a.clear();
        self.buf_b.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::effects::gain::GainPlugin;

    fn chain_with_gain(gain_db: f32, bypassed: bool) -> EffectChain {
        let mut registry = PluginRegistry::with_builtins();
        registry.register("gain", || Box::new(GainPlugin::new()));

        let mut chain = EffectChain::new(48000, 2);
        let preset = GainPlugin::preset_bytes(gain_db);
        chain.load(
            &registry,
            &[EffectEntryConfig {
                plugin: "gain".to_string(),
                order: 0,
                bypassed,
                preset: Some(preset),
            }],
            1024,
        );
        chain
    }

    #[test]
    fn empty_chain_returns_the_input_slice() {
        let mut chain = EffectChain::new(48000, 2);
        let input = vec![0.5, -0.5, 0.25, -0.25];
        assert_eq!(chain.process_block(&input), input.as_slice());
    }

    #[test]
    fn active_gain_scales_samples() {
        let mut chain = chain_with_gain(-6.0, false);
        let input = vec![1.0, -1.0];
        let out = chain.process_block(&input).to_vec();
        let expected = 10.0f32.powf(-6.0 / 20.0);
        assert!((out[0] - expected).abs() < 1e-4);
        assert!((out[1] + expected).abs() < 1e-4);
    }

    #[test]
    fn bypassed_plugin_is_bit_identical_passthrough() {
        let mut chain = chain_with_gain(-6.0, true);

        for input in [Vec::new(), vec![0.123, -0.456], vec![0.7; 960]] {
            let out = chain.process_block(&input).to_vec();
            assert_eq!(out, input, "bypass must not alter samples");
        }
    }

    #[test]
    fn unknown_plugin_is_skipped_with_a_warning() {
        let registry = PluginRegistry::with_builtins();
        let mut chain = EffectChain::new(48000, 2);
        chain.load(
            &registry,
            &[EffectEntryConfig {
                plugin: "does-not-exist".to_string(),
                order: 0,
                bypassed: false,
                preset: None,
            }],
            1024,
        );
        assert!(chain.is_empty());
    }

    #[test]
    fn entries_execute_in_ascending_order_with_stable_ties() {
        let registry = PluginRegistry::with_builtins();
        let mut chain = EffectChain::new(48000, 2);
        chain.load(
            &registry,
            &[
                EffectEntryConfig {
                    plugin: "compressor".to_string(),
                    order: 5,
                    bypassed: false,
                    preset: None,
                },
                EffectEntryConfig {
                    plugin: "gain".to_string(),
                    order: 1,
                    bypassed: false,
                    preset: None,
                },
                EffectEntryConfig {
                    plugin: "highpass".to_string(),
                    order: 5,
                    bypassed: false,
                    preset: None,
                },
            ],
            1024,
        );
        assert_eq!(chain.effect_names(), vec!["gain", "compressor", "highpass"]);
    }

    #[test]
    fn bypass_command_applies_between_blocks() {
        let mut chain = chain_with_gain(-6.0, false);
        let sender = chain.command_sender();

        let input = vec![0.5, 0.5];
        let processed = chain.process_block(&input).to_vec();
        assert_ne!(processed, input);

        sender
            .send(ChainCommand::SetBypassed {
                index: 0,
                bypassed: true,
            })
            .unwrap();

        let out = chain.process_block(&input).to_vec();
        assert_eq!(out, input);
        assert_eq!(chain.is_bypassed(0), Some(true));
    }

    struct AlwaysFailingPlugin;

    impl crate::audio::effects::EffectPlugin for AlwaysFailingPlugin {
        fn name(&self) -> &str {
            "broken"
        }
        fn initialize(&mut self, _: u32, _: usize) -> Result<(), AudioError> {
            Ok(())
        }
        fn process(
            &mut self,
            _: &[Vec<f32>],
            _: &mut [Vec<f32>],
            _: usize,
        ) -> Result<(), AudioError> {
            Err(AudioError::Plugin("synthetic failure".to_string()))
        }
        fn preset(&self) -> Vec<u8> {
            Vec::new()
        }
        fn set_preset(&mut self, _: &[u8]) -> Result<(), AudioError> {
            Ok(())
        }
        fn reset(&mut self) {}
    }

    #[test]
    fn failing_plugin_passes_the_block_through_unchanged() {
        let mut registry = PluginRegistry::empty();
        registry.register("broken", || Box::new(AlwaysFailingPlugin));

        let mut chain = EffectChain::new(48000, 2);
        chain.load(
            &registry,
            &[EffectEntryConfig {
                plugin: "broken".to_string(),
                order: 0,
                bypassed: false,
                preset: None,
            }],
            1024,
        );
        assert_eq!(chain.len(), 1);

        let input = vec![0.25, -0.75, 0.5, -0.5];
        let out = chain.process_block(&input).to_vec();
        assert_eq!(out, input, "failed plugin must degrade to passthrough");
    }

    #[test]
    fn release_drops_all_effects() {
        let mut chain = chain_with_gain(0.0, false);
        assert_eq!(chain.len(), 1);
        chain.release();
        assert!(chain.is_empty());
    }
}

// Plugin capability interface and registry.
//
// The chain depends only on this trait, never on a concrete plugin SDK. A
// plugin processes deinterleaved per-channel buffers; deinterleave,
// interleave, bypass, and failure isolation are owned by the chain engine.

use std::collections::HashMap;

use crate::error::AudioError;

/// Uniform block-processing contract for one effect instance.
///
/// `process` receives one input and one output buffer per channel, each
/// holding the same number of frames. Output buffers arrive zeroed. Returning
/// an error makes the chain substitute passthrough for that block; it does
/// not unload the plugin.
pub trait EffectPlugin: Send {
    fn name(&self) -> &str;

    /// Called once before processing starts, and again after a
    /// reconfiguration. `max_block_size` is frames per channel and may be
    /// exceeded later; scratch sizing is the chain's problem, not the
    /// plugin's.
    fn initialize(&mut self, sample_rate: u32, max_block_size: usize) -> Result<(), AudioError>;

    fn process(
        &mut self,
        input: &[Vec<f32>],
        output: &mut [Vec<f32>],
        frames: usize,
    ) -> Result<(), AudioError>;

    /// Opaque preset blob, round-trippable through `set_preset`.
    fn preset(&self) -> Vec<u8>;

    fn set_preset(&mut self, preset: &[u8]) -> Result<(), AudioError>;

    /// Drop accumulated runtime state (envelopes, filter history).
    fn reset(&mut self);
}

pub type PluginFactory = fn() -> Box<dyn EffectPlugin>;

/// Name-to-factory registry for effect plugins.
///
/// Each stream's chain creates its own instances through the registry; plugin
/// instances are never shared across streams.
pub struct PluginRegistry {
    factories: HashMap<String, PluginFactory>,
}

impl PluginRegistry {
    /// Registry pre-populated with the built-in plugin set.
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("gain", || Box::new(super::gain::GainPlugin::new()));
        registry.register("highpass", || {
            Box::new(super::filter::BiquadFilterPlugin::high_pass())
        });
        registry.register("lowpass", || {
            Box::new(super::filter::BiquadFilterPlugin::low_pass())
        });
        registry.register("compressor", || {
            Box::new(super::compressor::CompressorPlugin::new())
        });
        registry
    }

    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: &str, factory: PluginFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn create(&self, name: &str) -> Option<Box<dyn EffectPlugin>> {
        self.factories.get(name).map(|factory| factory())
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}

/// Runtime mutation commands, applied by the chain between blocks and never
/// mid-block.
#[derive(Debug, Clone)]
pub enum ChainCommand {
    SetBypassed { index: usize, bypassed: bool },
    SetPreset { index: usize, preset: Vec<u8> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_creates_known_plugins() {
        let registry = PluginRegistry::with_builtins();
        for name in ["gain", "highpass", "lowpass", "compressor"] {
            let plugin = registry.create(name);
            assert!(plugin.is_some(), "missing builtin plugin {}", name);
        }
        assert!(registry.create("reverb").is_none());
    }
}

// Real-time audio effect chain: plugin capability interface, registry, and
// the chain engine that owns deinterleaving, bypass, and failure isolation.

mod chain;
mod compressor;
mod filter;
mod gain;
mod plugin;

pub use chain::EffectChain;
pub use compressor::CompressorPlugin;
pub use filter::BiquadFilterPlugin;
pub use gain::GainPlugin;
pub use plugin::{ChainCommand, EffectPlugin, PluginFactory, PluginRegistry};

use thiserror::Error;

/// Error taxonomy for the streaming pipeline.
///
/// The variants map onto how failures are handled: `Config` and `Sink` errors
/// are fatal for the stream that raised them, `Plugin` errors degrade the
/// stream to passthrough for the affected stage, and `Capture` errors are
/// terminal for the stream and surfaced to the orchestrator.
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("capture error: {0}")]
    Capture(String),

    #[error("sample format error: {0}")]
    Format(String),

    #[error("plugin error: {0}")]
    Plugin(String),

    #[error("encoder sink error: {0}")]
    Sink(String),

    #[error("invalid state: expected {expected}, found {found}")]
    InvalidState { expected: String, found: String },
}

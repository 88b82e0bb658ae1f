// Encoder sinks: one external encoding process per rendition, fed PCM16
// through bounded queues, plus the master manifest the delivery layer reads.

mod manifest;
mod rendition;
mod sink;

pub use manifest::{render_master_manifest, write_master_manifest, MASTER_MANIFEST_NAME};
pub use rendition::{AudioCodec, ContainerFormat, EncoderRendition, StreamFormat};
pub use sink::{EncoderSink, ErrorLineHandler, ExitHandler, SinkState, SINK_QUEUE_CAPACITY};

// Capture-to-render signal pipeline
//
// Device bytes flow through a fixed set of stages, each owned by one thread:
//
// - `source`: pluggable producers (synthetic, replay, serial, audio) writing raw bytes
// - `intake`: lock-free byte ring between the capture thread and the decoder
// - `decode`: PCM and SpikerBox byte decoders with embedded event markers
// - `dispatch`: worker that drains the intake, decodes and forwards batches
// - `signal_buffer`: shared per-channel sample ring plus event ring
// - `averaging`: event/threshold triggered signal averaging
// - `render`: per-tick frame preparation handed to a pluggable renderer
// - `controller`: lifecycle management and coordination

pub mod averaging;
pub mod config;
pub mod controller;
pub mod decode;
pub mod dispatch;
pub mod draw_buffer;
pub mod intake;
pub mod render;
pub mod signal_buffer;
pub mod source;
pub mod types;

pub use averaging::{AveragingSettings, SignalAverager};
pub use config::{AveragingTriggerType, Encoding, PipelineConfig, SourceConfig};
pub use controller::{StreamController, StreamEvent};
pub use decode::{create_decoder, Decoder, SamplesWithEvents};
pub use dispatch::{DispatchWorker, SampleSink};
pub use draw_buffer::{FftDrawBuffer, MultichannelDrawBuffer};
pub use intake::{IntakeMetrics, RawIntakeBuffer};
pub use render::{
    ChannelRenderState, FrameOutcome, FrameParams, FramePreparer, PreparedFrame, RenderPhase,
    WaveformRenderer,
};
pub use signal_buffer::{SharedSignalBuffer, SignalPropertyListener, SignalRings};
pub use source::{create_source, IntakeWriter, SampleSource, SourceKind, SourceMetadata};
pub use types::{Sample, SignalFormat, StreamError, StreamResult, StreamState, StreamStats};

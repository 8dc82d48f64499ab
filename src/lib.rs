pub mod audio_sink;
pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod protocol;
pub mod reorder;
pub mod resampler;
pub mod router;
pub mod sequencer;
pub mod transport;

pub use audio_sink::{AudioError, AudioSink, CpalConfig, CpalSink};
pub use client::{SpeechClient, SpeechHandle};
pub use config::{load_config, ClientConfig};
pub use error::{Result, SpeakError};
pub use protocol::{AudioFrame, Frame, OutboundRequest, PrefixHeader, StatusFrame, StreamMode};
pub use reorder::PartBoundary;
pub use router::{ResponseStream, StreamEvent};
pub use sequencer::{Sequencer, SequencerConfig};
pub use transport::{ConnectionState, Transport, TransportConfig, TransportEvent};

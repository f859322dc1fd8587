//! feedpipe-stream — moving a response from its producer to the pipeline.
//!
//! - [`Response`]: a response sink with a commit point, header
//!   interceptors and exclusive byte/text writers
//! - [`StreamBridge`]: runs a producer on its own task and exposes its body
//!   as an `AsyncRead` ([`BridgeReader`]) with bounded buffering
//! - [`SniffingReader`]: peek and mark/reset over any `AsyncRead`

mod bridge;
mod error;
mod response;
mod sniff;

pub use bridge::{
    BridgeConfig, BridgeReader, BridgeWriter, ProducerOutcome, ProducerResponse, StreamBridge,
};
pub use error::{BridgeError, SinkError, WriterKind};
pub use response::{ByteWriter, CharWriter, HeaderInterceptor, Response, ResponseHead};
pub use sniff::SniffingReader;

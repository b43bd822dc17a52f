#![warn(missing_docs)]

//! ClusterMgr protocol subsystem: perf-counter codec, report messages, framed TCP transport

pub mod codec;
pub mod connection;
pub mod error;
pub mod message;
pub mod perf;
pub mod protocol;
pub mod types;

pub use codec::{decode_report, encode_report, DecodeSummary, ReportPayload};
pub use connection::{MessageConnection, TransportConfig};
pub use error::{ProtoError, Result};
pub use message::{
    Configure, Hello, HelloReply, MessageType, MgrMap, MgrMessage, Open, Report,
    AUTH_PROTOCOL_NONE, AUTH_PROTOCOL_SHARED_SECRET,
};
pub use perf::{
    DeclareOutcome, PerfCounterCatalog, PerfCounterFlags, PerfCounterInstance, PerfCounterType,
};
pub use protocol::{Frame, FrameFlags, FrameHeader, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use types::{DaemonKey, DaemonType};

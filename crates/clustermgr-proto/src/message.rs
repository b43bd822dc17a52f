//! Report protocol messages.
//!
//! Messages are serialized with bincode and carried one per frame; the frame's
//! `msg_type` tag selects the variant.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::error::{ProtoError, Result};
use crate::perf::PerfCounterType;
use crate::protocol::{Frame, FrameFlags};
use crate::types::DaemonType;

/// Serialize any serde-compatible message to bytes using bincode.
pub fn serialize_message<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    bincode::serialize(msg).map_err(|e| ProtoError::SerializationError(e.to_string()))
}

/// Deserialize bytes to a message using bincode.
pub fn deserialize_message<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    bincode::deserialize(data).map_err(|e| ProtoError::SerializationError(e.to_string()))
}

/// Authentication protocol id: no credentials.
pub const AUTH_PROTOCOL_NONE: u32 = 1;

/// Authentication protocol id: pre-shared cluster secret.
pub const AUTH_PROTOCOL_SHARED_SECRET: u32 = 2;

/// Message type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    /// Connection handshake carrying the authorizer.
    Hello = 0x0001,
    /// Handshake verdict.
    HelloReply = 0x0002,
    /// Daemon introduces itself to the manager.
    Open = 0x0101,
    /// Manager tells the daemon how often to report.
    Configure = 0x0102,
    /// Periodic counter report.
    Report = 0x0103,
    /// Active manager announcement.
    MgrMap = 0x0201,
}

impl TryFrom<u16> for MessageType {
    type Error = ProtoError;

    fn try_from(v: u16) -> Result<Self> {
        match v {
            0x0001 => Ok(MessageType::Hello),
            0x0002 => Ok(MessageType::HelloReply),
            0x0101 => Ok(MessageType::Open),
            0x0102 => Ok(MessageType::Configure),
            0x0103 => Ok(MessageType::Report),
            0x0201 => Ok(MessageType::MgrMap),
            other => Err(ProtoError::UnknownMessageType(other)),
        }
    }
}

/// Handshake sent by the connecting side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Type of the connecting daemon.
    pub peer_type: DaemonType,
    /// Authentication protocol id.
    pub protocol: u32,
    /// Opaque authorizer for the protocol.
    #[serde(with = "serde_bytes")]
    pub authorizer: Vec<u8>,
}

/// Handshake verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloReply {
    /// Whether the authorizer was accepted.
    pub is_valid: bool,
    /// Reason for a rejection.
    pub reason: Option<String>,
}

/// Daemon introduction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Open {
    /// The daemon's own id, e.g. `3` for `osd.3`.
    pub daemon_name: String,
}

/// Reporting policy sent by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configure {
    /// Seconds between reports; zero disables reporting.
    pub stats_period: u32,
}

/// Periodic counter report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    /// The reporting daemon's id.
    pub daemon_name: String,
    /// Types not yet declared in this session.
    pub declare_types: Vec<PerfCounterType>,
    /// Positional value stream.
    #[serde(with = "serde_bytes")]
    pub packed: Vec<u8>,
}

/// Active manager announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MgrMap {
    /// Map epoch.
    pub epoch: u64,
    /// Address of the active manager, if one is up.
    pub active_addr: Option<SocketAddr>,
}

/// Any message of the report protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MgrMessage {
    /// See [`Hello`].
    Hello(Hello),
    /// See [`HelloReply`].
    HelloReply(HelloReply),
    /// See [`Open`].
    Open(Open),
    /// See [`Configure`].
    Configure(Configure),
    /// See [`Report`].
    Report(Report),
    /// See [`MgrMap`].
    MgrMap(MgrMap),
}

impl MgrMessage {
    /// The tag of this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            MgrMessage::Hello(_) => MessageType::Hello,
            MgrMessage::HelloReply(_) => MessageType::HelloReply,
            MgrMessage::Open(_) => MessageType::Open,
            MgrMessage::Configure(_) => MessageType::Configure,
            MgrMessage::Report(_) => MessageType::Report,
            MgrMessage::MgrMap(_) => MessageType::MgrMap,
        }
    }

    /// Wraps the message in a frame.
    pub fn to_frame(&self) -> Result<Frame> {
        let payload = match self {
            MgrMessage::Hello(m) => serialize_message(m)?,
            MgrMessage::HelloReply(m) => serialize_message(m)?,
            MgrMessage::Open(m) => serialize_message(m)?,
            MgrMessage::Configure(m) => serialize_message(m)?,
            MgrMessage::Report(m) => serialize_message(m)?,
            MgrMessage::MgrMap(m) => serialize_message(m)?,
        };
        let flags = match self {
            MgrMessage::Report(_) => FrameFlags::ONE_WAY,
            _ => FrameFlags::NONE,
        };
        Frame::new(self.message_type() as u16, payload, flags)
    }

    /// Decodes the message carried by a frame.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let p = &frame.payload;
        Ok(match MessageType::try_from(frame.header.msg_type)? {
            MessageType::Hello => MgrMessage::Hello(deserialize_message(p)?),
            MessageType::HelloReply => MgrMessage::HelloReply(deserialize_message(p)?),
            MessageType::Open => MgrMessage::Open(deserialize_message(p)?),
            MessageType::Configure => MgrMessage::Configure(deserialize_message(p)?),
            MessageType::Report => MgrMessage::Report(deserialize_message(p)?),
            MessageType::MgrMap => MgrMessage::MgrMap(deserialize_message(p)?),
        })
    }
}

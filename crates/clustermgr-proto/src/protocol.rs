//! Frame format for manager/daemon connections.
//!
//! Every message travels in one frame with a fixed 20-byte header followed by
//! a bincode payload. The header is big-endian.

use crate::error::{ProtoError, Result};

/// Frame header size in bytes (magic:4 + version:1 + flags:1 + msg_type:2 + payload_length:4 + checksum:4 + reserved:4)
pub const FRAME_HEADER_SIZE: usize = 20;

/// Protocol magic number for frame validation ("CMGR")
pub const MAGIC: u32 = 0x434D_4752;

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest accepted payload (16 MiB)
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Frame flags for protocol control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// Sender expects no reply.
    pub const ONE_WAY: Self = Self(0x04);

    /// Raw byte representation.
    pub fn as_u8(self) -> u8 {
        self.0
    }

    /// Create from raw byte representation.
    pub fn from_u8(b: u8) -> Self {
        Self(b)
    }

    /// Whether every bit of `other` is set.
    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

/// Frame header containing metadata about the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol magic number
    pub magic: u32,
    /// Protocol version
    pub version: u8,
    /// Control flags
    pub flags: FrameFlags,
    /// Raw message type tag; unknown tags survive framing and are rejected by message decoding.
    pub msg_type: u16,
    /// Payload length in bytes
    pub payload_length: u32,
    /// CRC32 checksum of payload
    pub checksum: u32,
}

impl FrameHeader {
    /// Serializes the header.
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_be_bytes());
        buf[4] = self.version;
        buf[5] = self.flags.as_u8();
        buf[6..8].copy_from_slice(&self.msg_type.to_be_bytes());
        buf[8..12].copy_from_slice(&self.payload_length.to_be_bytes());
        buf[12..16].copy_from_slice(&self.checksum.to_be_bytes());
        buf
    }

    /// Parses and sanity-checks a header.
    pub fn decode(buf: &[u8; FRAME_HEADER_SIZE]) -> Result<Self> {
        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != MAGIC {
            return Err(ProtoError::InvalidMagic {
                expected: MAGIC,
                got: magic,
            });
        }
        let version = buf[4];
        if version != PROTOCOL_VERSION {
            return Err(ProtoError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }
        let payload_length = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        if payload_length > MAX_PAYLOAD_SIZE {
            return Err(ProtoError::PayloadTooLarge {
                size: payload_length,
                max_size: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Self {
            magic,
            version,
            flags: FrameFlags::from_u8(buf[5]),
            msg_type: u16::from_be_bytes([buf[6], buf[7]]),
            payload_length,
            checksum: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
        })
    }
}

/// A single frame on the wire
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame header
    pub header: FrameHeader,
    /// Payload data
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a new frame, computing length and checksum.
    ///
    /// Payloads over [`MAX_PAYLOAD_SIZE`] are rejected here, since the peer
    /// would treat the header as fatal and drop the connection.
    pub fn new(msg_type: u16, payload: Vec<u8>, flags: FrameFlags) -> Result<Self> {
        let payload_length = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= MAX_PAYLOAD_SIZE)
            .ok_or(ProtoError::PayloadTooLarge {
                size: u32::try_from(payload.len()).unwrap_or(u32::MAX),
                max_size: MAX_PAYLOAD_SIZE,
            })?;
        let header = FrameHeader {
            magic: MAGIC,
            version: PROTOCOL_VERSION,
            flags,
            msg_type,
            payload_length,
            checksum: crc32fast::hash(&payload),
        };
        Ok(Self { header, payload })
    }

    /// Serializes header and payload into one buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&self.header.encode());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parses a complete frame from a buffer.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(ProtoError::InvalidFrame {
                reason: format!("{} bytes is shorter than a header", buf.len()),
            });
        }
        let mut header_buf = [0u8; FRAME_HEADER_SIZE];
        header_buf.copy_from_slice(&buf[..FRAME_HEADER_SIZE]);
        let header = FrameHeader::decode(&header_buf)?;
        let body = &buf[FRAME_HEADER_SIZE..];
        if body.len() != header.payload_length as usize {
            return Err(ProtoError::InvalidFrame {
                reason: format!(
                    "payload length {} does not match header {}",
                    body.len(),
                    header.payload_length
                ),
            });
        }
        let frame = Self {
            header,
            payload: body.to_vec(),
        };
        frame.validate()?;
        Ok(frame)
    }

    /// Verifies the payload checksum.
    pub fn validate(&self) -> Result<()> {
        let computed = crc32fast::hash(&self.payload);
        if computed != self.header.checksum {
            return Err(ProtoError::ChecksumMismatch {
                expected: self.header.checksum,
                computed,
            });
        }
        Ok(())
    }
}

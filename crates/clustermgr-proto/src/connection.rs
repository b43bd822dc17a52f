//! Framed message connection over TCP.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::error::{ProtoError, Result};
use crate::message::MgrMessage;
use crate::protocol::{Frame, FrameHeader, FRAME_HEADER_SIZE};

/// TCP transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Whether to enable TCP_NODELAY (disable Nagle's algorithm).
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            nodelay: true,
        }
    }
}

/// A connection carrying report protocol messages, with concurrent read/write support.
pub struct MessageConnection {
    read: Mutex<OwnedReadHalf>,
    write: Mutex<OwnedWriteHalf>,
    peer_addr: SocketAddr,
}

impl MessageConnection {
    /// Connects to `addr`.
    pub async fn connect(addr: SocketAddr, config: &TransportConfig) -> Result<Self> {
        let timeout = Duration::from_millis(config.connect_timeout_ms);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ProtoError::ConnectionTimeout {
                addr: addr.to_string(),
                timeout_ms: config.connect_timeout_ms,
            })??;
        if config.nodelay {
            stream.set_nodelay(true)?;
        }
        tracing::debug!(addr = %addr, "connected");
        Self::from_stream(stream)
    }

    /// Accepts one incoming connection.
    pub async fn accept(listener: &TcpListener, config: &TransportConfig) -> Result<Self> {
        let (stream, _) = listener.accept().await?;
        if config.nodelay {
            stream.set_nodelay(true)?;
        }
        Self::from_stream(stream)
    }

    /// Wraps an established stream.
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        let peer_addr = stream.peer_addr()?;
        let (read, write) = stream.into_split();
        Ok(Self {
            read: Mutex::new(read),
            write: Mutex::new(write),
            peer_addr,
        })
    }

    /// Sends a raw frame.
    pub async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let encoded = frame.encode();
        let mut write = self.write.lock().await;
        write.write_all(&encoded).await?;
        write.flush().await?;
        Ok(())
    }

    /// Receives a raw frame.
    ///
    /// A checksum failure leaves the stream positioned on the next header.
    pub async fn recv_frame(&self) -> Result<Frame> {
        let mut read = self.read.lock().await;
        let mut header_buf = [0u8; FRAME_HEADER_SIZE];
        read.read_exact(&mut header_buf).await?;
        let header = FrameHeader::decode(&header_buf)?;
        let mut payload = vec![0u8; header.payload_length as usize];
        if !payload.is_empty() {
            read.read_exact(&mut payload).await?;
        }
        let frame = Frame { header, payload };
        frame.validate()?;
        Ok(frame)
    }

    /// Sends one message.
    pub async fn send(&self, msg: &MgrMessage) -> Result<()> {
        let frame = msg.to_frame()?;
        self.send_frame(&frame).await
    }

    /// Receives one message.
    pub async fn recv(&self) -> Result<MgrMessage> {
        let frame = self.recv_frame().await?;
        MgrMessage::from_frame(&frame)
    }

    /// Remote address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Shuts down the write half; the peer sees end-of-stream.
    pub async fn shutdown(&self) -> Result<()> {
        let mut write = self.write.lock().await;
        write.shutdown().await?;
        Ok(())
    }
}

impl std::fmt::Debug for MessageConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageConnection")
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

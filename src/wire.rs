//! Framed transport over a TCP byte stream.
//!
//! A frame is a 2-byte little-endian length prefix followed by at most
//! [`MAX_FRAME_SIZE`] bytes of body (the text codec in [`crate::message`]).
//! The unit of flow control is one message, one reply, except where a kind
//! is documented as a terminal acknowledgement.

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::message::Message;
use crate::protocol::MAX_FRAME_SIZE;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unexpected message in this phase: expected {expected}, got {got}")]
    Unexpected {
        expected: &'static str,
        got: &'static str,
    },
    #[error("frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),
    #[error("connection lost mid-operation")]
    ConnectionLost,
}

/// One byte-stream connection to a peer. Short-lived for single operations,
/// long-lived for subscriptions.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        let _ = stream.set_nodelay(true);
        Connection { stream }
    }

    /// Open a connection and perform the login handshake.
    pub async fn connect(addr: &str, username: &str) -> Result<Connection> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connect {addr}"))?;
        let mut conn = Connection::new(stream);
        let reply = conn
            .request(&Message::Login { username: username.to_string() })
            .await?;
        if !reply.is_ok() {
            anyhow::bail!("login rejected for {username}: {}", reply.kind_name());
        }
        Ok(conn)
    }

    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        let body = msg.encode();
        if body.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(body.len()).into());
        }
        self.stream.write_all(&(body.len() as u16).to_le_bytes()).await?;
        if !body.is_empty() {
            self.stream.write_all(&body).await?;
        }
        Ok(())
    }

    /// Read the next frame. A socket closed between frames is an implicit
    /// end-of-stream and yields `Empty`, not an error.
    pub async fn recv(&mut self) -> Result<Message> {
        let mut prefix = [0u8; 2];
        match self.stream.read_exact(&mut prefix).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(Message::Empty)
            }
            Err(e) => return Err(e.into()),
        }
        let len = u16::from_le_bytes(prefix) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(len).into());
        }
        let mut body = vec![0u8; len];
        if len > 0 {
            self.stream
                .read_exact(&mut body)
                .await
                .map_err(|_| ProtocolError::ConnectionLost)?;
        }
        Ok(Message::decode(&body))
    }

    /// Synchronous round trip: write one frame, block until one reply frame.
    pub async fn request(&mut self, msg: &Message) -> Result<Message> {
        self.send(msg).await?;
        self.recv().await
    }

    /// Read a reply and insist on `Response(Ok)`.
    pub async fn expect_ok(&mut self) -> Result<()> {
        let reply = self.recv().await?;
        if reply.is_ok() {
            Ok(())
        } else {
            Err(ProtocolError::Unexpected {
                expected: "Response(Ok)",
                got: reply.kind_name(),
            }
            .into())
        }
    }
}

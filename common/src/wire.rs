//! Wire framing for Courier links.
//!
//! A [`Message`] is an ordered sequence of opaque byte [`Frame`]s; the relay
//! moves it around without ever looking inside a frame. On the worker-facing
//! wire a message travels inside a [`Delivery`], which carries the routing
//! envelope the connection layer attached on the way in and consumes on the
//! way out.
//!
//! Every wire record is a `u32` little-endian length prefix followed by a
//! bincode body, capped at [`MAX_WIRE_BYTES`].

use std::{
    io::{self, Read, Write},
    net::{SocketAddr, TcpStream},
    time::Duration,
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{error::TransportError, secure::SecureStream};

/// Upper bound on a single encoded wire record.
pub const MAX_WIRE_BYTES: usize = 1024 * 1024;

/// One opaque byte frame.
pub type Frame = Vec<u8>;

/// Ordered sequence of opaque frames; the atomic unit the broker relays.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    frames: Vec<Frame>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_frames(frames: Vec<Frame>) -> Self {
        Self { frames }
    }

    /// Convenience constructor for a single-frame message.
    pub fn single<B: Into<Frame>>(frame: B) -> Self {
        Self {
            frames: vec![frame.into()],
        }
    }

    pub fn push<B: Into<Frame>>(&mut self, frame: B) {
        self.frames.push(frame.into());
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn into_frames(self) -> Vec<Frame> {
        self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// A message together with the routing envelope that returns its reply to
/// the originating sender.
///
/// Envelope frames are attached and stripped by the connection layer; the
/// relay core and request handlers treat them as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub envelope: Vec<Frame>,
    pub message: Message,
}

impl Delivery {
    pub fn new(envelope: Vec<Frame>, message: Message) -> Self {
        Self { envelope, message }
    }

    /// Reply to this delivery: same envelope, new payload.
    pub fn reply(&self, message: Message) -> Self {
        Self {
            envelope: self.envelope.clone(),
            message,
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, TransportError> {
    let body =
        bincode::serialize(value).map_err(|e| TransportError::Codec(e.to_string()))?;
    if body.len() > MAX_WIRE_BYTES {
        return Err(TransportError::Oversized {
            len: body.len(),
            max: MAX_WIRE_BYTES,
        });
    }
    let mut wire = Vec::with_capacity(4 + body.len());
    wire.extend_from_slice(&(body.len() as u32).to_le_bytes());
    wire.extend_from_slice(&body);
    Ok(wire)
}

/// Pulls one complete record out of `buf`, if one has accumulated.
fn take_record(buf: &mut Vec<u8>) -> Result<Option<Vec<u8>>, TransportError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_WIRE_BYTES {
        return Err(TransportError::Oversized {
            len,
            max: MAX_WIRE_BYTES,
        });
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    let body = buf[4..4 + len].to_vec();
    buf.drain(..4 + len);
    Ok(Some(body))
}

enum LinkIo {
    Plain(TcpStream),
    Secure(SecureStream),
}

impl Read for LinkIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            LinkIo::Plain(s) => s.read(buf),
            LinkIo::Secure(s) => s.read(buf),
        }
    }
}

impl Write for LinkIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            LinkIo::Plain(s) => s.write(buf),
            LinkIo::Secure(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            LinkIo::Plain(s) => s.flush(),
            LinkIo::Secure(s) => s.flush(),
        }
    }
}

/// A framed connection, plaintext or secured, with identical send/receive
/// semantics either way.
pub struct Link {
    io: LinkIo,
    rx: Vec<u8>,
}

impl Link {
    pub fn plain(stream: TcpStream) -> Self {
        Self {
            io: LinkIo::Plain(stream),
            rx: Vec::new(),
        }
    }

    pub fn secure(stream: SecureStream) -> Self {
        Self {
            io: LinkIo::Secure(stream),
            rx: Vec::new(),
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match &self.io {
            LinkIo::Plain(s) => s.peer_addr(),
            LinkIo::Secure(s) => s.peer_addr(),
        }
    }

    /// Bounds how long a single [`Link::recv_poll`] read may block. `None`
    /// restores fully blocking reads.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match &self.io {
            LinkIo::Plain(s) => s.set_read_timeout(timeout),
            LinkIo::Secure(s) => s.set_read_timeout(timeout),
        }
    }

    /// Sends one record, blocking until it is fully written.
    pub fn send<T: Serialize>(&mut self, value: &T) -> Result<(), TransportError> {
        let wire = encode(value)?;
        self.io.write_all(&wire)?;
        self.io.flush()?;
        Ok(())
    }

    /// Attempts to receive one record without waiting past the configured
    /// read timeout. Returns `Ok(None)` when no complete record is available
    /// yet; partial bytes stay buffered for the next poll.
    pub fn recv_poll<T: DeserializeOwned>(&mut self) -> Result<Option<T>, TransportError> {
        loop {
            if let Some(body) = take_record(&mut self.rx)? {
                let value = bincode::deserialize(&body)
                    .map_err(|e| TransportError::Codec(e.to_string()))?;
                return Ok(Some(value));
            }

            let mut chunk = [0u8; 4096];
            match self.io.read(&mut chunk) {
                Ok(0) => {
                    if self.rx.is_empty() {
                        return Err(TransportError::Closed);
                    }
                    return Err(TransportError::Codec(
                        "connection closed mid-record".to_string(),
                    ));
                }
                Ok(n) => self.rx.extend_from_slice(&chunk[..n]),
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    return Ok(None)
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Receives one record, blocking until it arrives or the link fails.
    pub fn recv<T: DeserializeOwned>(&mut self) -> Result<T, TransportError> {
        loop {
            if let Some(value) = self.recv_poll()? {
                return Ok(value);
            }
        }
    }
}

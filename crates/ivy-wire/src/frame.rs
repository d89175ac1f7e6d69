//! Length-prefixed framing over a byte stream.
//!
//! Each frame is an 8-byte little-endian length followed by exactly that many
//! payload bytes. The writer emits a whole frame with a single `write_all`
//! through an exclusive `&mut` borrow, so two frames never interleave.

use ivy_types::config::DEFAULT_MAX_MESSAGE_SIZE;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::WireError;
use crate::message::{decode_envelope, encode_envelope, Envelope};

/// Size of the length prefix.
pub const LENGTH_PREFIX: usize = 8;

/// Body bytes reserved up front; larger frames grow as they are read.
const INITIAL_BODY_CAPACITY: u64 = 64 * 1024;

/// Prefix `body` with its little-endian u64 length.
pub fn encode_frame(body: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(LENGTH_PREFIX + body.len());
    bytes.extend_from_slice(&(body.len() as u64).to_le_bytes());
    bytes.extend_from_slice(body);
    bytes
}

/// Decode the length prefix from an 8-byte header.
pub fn decode_length(header: &[u8; LENGTH_PREFIX]) -> u64 {
    u64::from_le_bytes(*header)
}

/// Receiving half of a framed channel.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    max_message_size: u64,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_message_size: u64) -> Self {
        Self {
            inner,
            max_message_size,
        }
    }

    /// Read one complete frame body.
    ///
    /// A stream that ends cleanly on a frame boundary yields
    /// [`WireError::ConnectionClosed`]; ending inside a frame, header
    /// included, is an I/O error.
    pub async fn receive_raw(&mut self) -> Result<Vec<u8>, WireError> {
        let mut header = [0u8; LENGTH_PREFIX];
        let first = self.inner.read(&mut header).await?;
        if first == 0 {
            return Err(WireError::ConnectionClosed);
        }
        self.inner.read_exact(&mut header[first..]).await?;

        let len = decode_length(&header);
        if len > self.max_message_size {
            return Err(WireError::MessageTooLarge {
                size: len,
                max: self.max_message_size,
            });
        }

        // The declared length is untrusted until the bytes arrive.
        let mut body = Vec::with_capacity(len.min(INITIAL_BODY_CAPACITY) as usize);
        (&mut self.inner).take(len).read_to_end(&mut body).await?;
        if (body.len() as u64) < len {
            return Err(WireError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("frame ended after {} of {len} bytes", body.len()),
            )));
        }
        Ok(body)
    }

    /// Read and decode the next envelope.
    pub async fn receive(&mut self) -> Result<Envelope, WireError> {
        let body = self.receive_raw().await?;
        decode_envelope(&body)
    }
}

/// Sending half of a framed channel.
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write one frame carrying `body`.
    pub async fn send_raw(&mut self, body: &[u8]) -> Result<(), WireError> {
        let frame = encode_frame(body);
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Encode and write one envelope.
    pub async fn send(&mut self, envelope: &Envelope) -> Result<(), WireError> {
        let body = encode_envelope(envelope)?;
        self.send_raw(&body).await
    }

    /// Flush and close the write side of the stream.
    pub async fn shutdown(&mut self) -> Result<(), WireError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Both halves of a framed byte stream.
#[derive(Debug)]
pub struct FramedChannel<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
}

impl<R, W> FramedChannel<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, max_message_size: u64) -> Self {
        Self {
            reader: FrameReader::new(reader, max_message_size),
            writer: FrameWriter::new(writer),
        }
    }

    /// Framed channel with the default 16 MiB frame limit.
    pub fn with_default_limit(reader: R, writer: W) -> Self {
        Self::new(reader, writer, DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub async fn send(&mut self, envelope: &Envelope) -> Result<(), WireError> {
        self.writer.send(envelope).await
    }

    pub async fn receive(&mut self) -> Result<Envelope, WireError> {
        self.reader.receive().await
    }

    pub fn into_parts(self) -> (FrameReader<R>, FrameWriter<W>) {
        (self.reader, self.writer)
    }
}

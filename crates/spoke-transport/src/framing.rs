//! Length-delimited framing over any byte stream.
//!
//! TCP is a stream of bytes with no message boundaries. Every encoded
//! value is sent as one frame: a 4-byte big-endian length followed by
//! exactly that many bytes. `tokio-util`'s [`LengthDelimitedCodec`] does
//! the bookkeeping, the [`Codec`] turns frames into values.
//!
//! The framed halves are generic over `AsyncRead + AsyncWrite` so the same
//! code runs over a `TcpStream` in production and a `tokio::io::duplex`
//! pipe in tests.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Serialize, de::DeserializeOwned};
use spoke_protocol::Codec;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::TransportError;

/// Largest single encoded value accepted or produced: 16 MiB.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

fn length_delimited() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// The receiving half of a framed stream.
pub struct FrameReader<IO> {
    inner: FramedRead<ReadHalf<IO>, LengthDelimitedCodec>,
}

impl<IO: AsyncRead + AsyncWrite> FrameReader<IO> {
    /// Reads and decodes the next value.
    ///
    /// Returns `Ok(None)` when the peer closed the stream cleanly.
    /// Cancel-safe: dropping the future never loses a partial frame.
    pub async fn read_value<C: Codec, T: DeserializeOwned>(
        &mut self,
        codec: &C,
    ) -> Result<Option<T>, TransportError> {
        match self.inner.next().await {
            None => Ok(None),
            Some(Err(e)) => Err(TransportError::ReceiveFailed(e)),
            Some(Ok(frame)) => Ok(Some(codec.decode(&frame)?)),
        }
    }
}

/// The sending half of a framed stream.
pub struct FrameWriter<IO> {
    inner: FramedWrite<WriteHalf<IO>, LengthDelimitedCodec>,
}

impl<IO: AsyncRead + AsyncWrite> FrameWriter<IO> {
    /// Encodes `value` and writes it as one frame, flushing the socket.
    pub async fn write_value<C: Codec, T: Serialize>(
        &mut self,
        codec: &C,
        value: &T,
    ) -> Result<(), TransportError> {
        let bytes = codec.encode(value)?;
        self.inner
            .send(Bytes::from(bytes))
            .await
            .map_err(TransportError::SendFailed)
    }

    /// Shuts down the write side, signalling end-of-stream to the peer.
    pub async fn close(&mut self) -> Result<(), TransportError> {
        SinkExt::<Bytes>::close(&mut self.inner)
            .await
            .map_err(TransportError::SendFailed)
    }
}

/// Both framed halves of one byte stream.
///
/// The login handshake and the identity exchange talk through this type
/// before the stream is handed over to a [`crate::Connection`]. Keeping
/// the same framed halves across that hand-over matters: the reader may
/// already hold buffered bytes of the next frame.
pub struct FramedConnection<IO> {
    reader: FrameReader<IO>,
    writer: FrameWriter<IO>,
}

impl<IO: AsyncRead + AsyncWrite> FramedConnection<IO> {
    /// Wraps a byte stream.
    pub fn new(io: IO) -> Self {
        let (read, write) = tokio::io::split(io);
        Self {
            reader: FrameReader {
                inner: FramedRead::new(read, length_delimited()),
            },
            writer: FrameWriter {
                inner: FramedWrite::new(write, length_delimited()),
            },
        }
    }

    /// See [`FrameReader::read_value`].
    pub async fn read_value<C: Codec, T: DeserializeOwned>(
        &mut self,
        codec: &C,
    ) -> Result<Option<T>, TransportError> {
        self.reader.read_value(codec).await
    }

    /// See [`FrameWriter::write_value`].
    pub async fn write_value<C: Codec, T: Serialize>(
        &mut self,
        codec: &C,
        value: &T,
    ) -> Result<(), TransportError> {
        self.writer.write_value(codec, value).await
    }

    /// Closes the write side; the peer reads end-of-stream.
    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.writer.close().await
    }

    /// Splits into independently owned halves.
    pub fn into_parts(self) -> (FrameReader<IO>, FrameWriter<IO>) {
        (self.reader, self.writer)
    }
}

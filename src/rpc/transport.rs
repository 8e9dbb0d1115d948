//! Client-facing transports.
//!
//! Two wire formats carry the same JSON envelope:
//!
//! - **Message-oriented** ([`WebSocketSource`] / [`WebSocketSink`]): one
//!   envelope per WebSocket text message.
//! - **Length-framed** ([`FramedReader`] / [`FramedWriter`]): each envelope is
//!   preceded by its byte length as a 4-byte big-endian unsigned integer.
//!   Frames may arrive split across reads; partial frames are buffered.
//!
//! The server only sees [`FrameSource`] and [`FrameSink`], so it is
//! indifferent to which one a connection uses.

use std::future::Future;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

use crate::error::TransportError;

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

const READ_CHUNK: usize = 8 * 1024;

/// Incoming half of a connection.
pub trait FrameSource: Send {
    /// The next envelope, or `None` once the peer has closed cleanly.
    fn next_frame(&mut self)
        -> impl Future<Output = Result<Option<String>, TransportError>> + Send;
}

/// Outgoing half of a connection.
pub trait FrameSink: Send {
    /// Sends one envelope.
    fn send_frame(&mut self, frame: &str) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Flushes and closes the outgoing side.
    fn close(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Incremental decoder for length-prefixed frames.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_frame: usize,
}

impl FrameDecoder {
    /// A decoder rejecting frames longer than `max_frame` bytes.
    #[must_use]
    pub const fn new(max_frame: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame,
        }
    }

    /// Appends received bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet decoded.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Takes the next complete frame off the buffer, if there is one.
    ///
    /// # Errors
    ///
    /// [`TransportError::FrameTooLarge`] as soon as a header announces an
    /// oversized frame, [`TransportError::InvalidUtf8`] for a bad payload.
    pub fn decode(&mut self) -> Result<Option<String>, TransportError> {
        let Some(header) = self.buffer.get(..HEADER_LEN) else {
            return Ok(None);
        };
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if len > self.max_frame {
            return Err(TransportError::FrameTooLarge {
                len,
                max: self.max_frame,
            });
        }
        if self.buffer.len() < HEADER_LEN + len {
            return Ok(None);
        }
        let payload: Vec<u8> = self
            .buffer
            .drain(..HEADER_LEN + len)
            .skip(HEADER_LEN)
            .collect();
        Ok(Some(String::from_utf8(payload)?))
    }
}

/// Encodes one frame: big-endian length, then the UTF-8 payload.
///
/// # Errors
///
/// [`TransportError::FrameTooLarge`] if the payload exceeds `max_frame` or
/// does not fit a 32-bit length.
pub fn encode_frame(payload: &str, max_frame: usize) -> Result<Vec<u8>, TransportError> {
    let len = payload.len();
    let header = u32::try_from(len)
        .ok()
        .filter(|_| len <= max_frame)
        .ok_or(TransportError::FrameTooLarge {
            len,
            max: max_frame,
        })?;
    let mut frame = Vec::with_capacity(HEADER_LEN + len);
    frame.extend_from_slice(&header.to_be_bytes());
    frame.extend_from_slice(payload.as_bytes());
    Ok(frame)
}

/// Reads length-prefixed frames from a byte stream.
#[derive(Debug)]
pub struct FramedReader<R> {
    inner: R,
    decoder: FrameDecoder,
}

impl<R> FramedReader<R> {
    /// Wraps a byte stream.
    #[must_use]
    pub const fn new(inner: R, max_frame: usize) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(max_frame),
        }
    }
}

impl<R: AsyncRead + Unpin + Send> FrameSource for FramedReader<R> {
    async fn next_frame(&mut self) -> Result<Option<String>, TransportError> {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            if let Some(frame) = self.decoder.decode()? {
                return Ok(Some(frame));
            }
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                return match self.decoder.buffered() {
                    0 => Ok(None),
                    buffered => Err(TransportError::Truncated { buffered }),
                };
            }
            self.decoder.extend(&chunk[..n]);
        }
    }
}

/// Writes length-prefixed frames to a byte stream.
#[derive(Debug)]
pub struct FramedWriter<W> {
    inner: W,
    max_frame: usize,
}

impl<W> FramedWriter<W> {
    /// Wraps a byte stream.
    #[must_use]
    pub const fn new(inner: W, max_frame: usize) -> Self {
        Self { inner, max_frame }
    }
}

impl<W: AsyncWrite + Unpin + Send> FrameSink for FramedWriter<W> {
    async fn send_frame(&mut self, frame: &str) -> Result<(), TransportError> {
        let bytes = encode_frame(frame, self.max_frame)?;
        self.inner.write_all(&bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Splits a byte stream pair into framed halves.
pub const fn framed<R, W>(reader: R, writer: W, max_frame: usize) -> (FramedReader<R>, FramedWriter<W>) {
    (
        FramedReader::new(reader, max_frame),
        FramedWriter::new(writer, max_frame),
    )
}

/// Incoming half of a WebSocket connection.
#[derive(Debug)]
pub struct WebSocketSource<S> {
    inner: SplitStream<WebSocketStream<S>>,
    max_frame: usize,
}

/// Outgoing half of a WebSocket connection.
#[derive(Debug)]
pub struct WebSocketSink<S> {
    inner: SplitSink<WebSocketStream<S>, Message>,
}

/// Splits an established WebSocket into source and sink halves.
pub fn websocket<S>(stream: WebSocketStream<S>, max_frame: usize) -> (WebSocketSource<S>, WebSocketSink<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (sink, source) = stream.split();
    (
        WebSocketSource {
            inner: source,
            max_frame,
        },
        WebSocketSink { inner: sink },
    )
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> FrameSource for WebSocketSource<S> {
    async fn next_frame(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            match self.inner.next().await {
                None => return Ok(None),
                Some(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed)) => {
                    return Ok(None)
                }
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Message::Text(text))) => {
                    if text.len() > self.max_frame {
                        return Err(TransportError::FrameTooLarge {
                            len: text.len(),
                            max: self.max_frame,
                        });
                    }
                    return Ok(Some(text.as_str().to_owned()));
                }
                Some(Ok(Message::Binary(_))) => return Err(TransportError::UnexpectedBinary),
                Some(Ok(Message::Close(_))) => return Ok(None),
                // Control frames are answered by tungstenite itself.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> FrameSink for WebSocketSink<S> {
    async fn send_frame(&mut self, frame: &str) -> Result<(), TransportError> {
        self.inner.send(Message::text(frame.to_owned())).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.inner.close().await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

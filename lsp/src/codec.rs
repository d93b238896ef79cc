//! JSON-RPC framing codec for LSP communication.
//!
//! LSP uses `Content-Length: N\r\n\r\n{json}` framing over stdin/stdout.
//! [`FrameDecoder`] is a push decoder: feed it whatever bytes arrived and it
//! returns every frame completed so far, buffering the rest. [`FrameReader`]
//! and [`FrameWriter`] drive it over async pipes.

use std::collections::VecDeque;
use std::io;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::{Message, MessageError};

/// Maximum frame size (4 MiB) to prevent unbounded memory allocation.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Longest header line accepted before the buffered bytes are dropped.
const MAX_HEADER_LINE_BYTES: usize = 8 * 1024;

const READ_CHUNK_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("header block has no Content-Length")]
    MissingContentLength,
    #[error("invalid Content-Length value {0:?}")]
    InvalidContentLength(String),
    #[error("Content-Length {len} exceeds maximum {max}")]
    Oversized { len: usize, max: usize },
    #[error("header line exceeds {MAX_HEADER_LINE_BYTES} bytes")]
    HeaderTooLong,
    #[error("frame body is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("stream ended in the middle of a frame")]
    UnexpectedEof,
}

/// One decoded frame: the exact body bytes and their JSON value.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    body: Vec<u8>,
    value: Value,
}

impl Frame {
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    #[must_use]
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Classify the body as a JSON-RPC request, response or notification.
    pub fn message(self) -> Result<Message, MessageError> {
        Message::try_from(self.value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodeEvent {
    Frame(Frame),
    Error(FrameError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Header,
    Body { len: usize },
    Discard { remaining: usize },
}

/// Incremental `Content-Length` frame decoder.
///
/// Splitting the same byte stream at any boundaries yields the same events.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    state: DecodeState,
    /// Header lines seen in the current block.
    header_lines: usize,
    content_length: Option<Result<usize, String>>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            state: DecodeState::Header,
            header_lines: 0,
            content_length: None,
        }
    }

    /// True when bytes of an incomplete frame are buffered.
    #[must_use]
    pub fn is_mid_frame(&self) -> bool {
        match self.state {
            DecodeState::Header => self.header_lines > 0 || !self.buf.is_empty(),
            DecodeState::Body { .. } | DecodeState::Discard { .. } => true,
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<DecodeEvent> {
        self.buf.extend_from_slice(bytes);
        let mut events = Vec::new();

        loop {
            match self.state {
                DecodeState::Header => {
                    let Some(end) = find_crlf(&self.buf) else {
                        if self.buf.len() > MAX_HEADER_LINE_BYTES {
                            self.buf.clear();
                            self.reset_header();
                            events.push(DecodeEvent::Error(FrameError::HeaderTooLong));
                        }
                        break;
                    };
                    let line: Vec<u8> = self.buf.drain(..end + 2).take(end).collect();
                    if let Some(event) = self.header_line(&line) {
                        events.push(event);
                    }
                }
                DecodeState::Body { len } => {
                    if self.buf.len() < len {
                        break;
                    }
                    let body: Vec<u8> = self.buf.drain(..len).collect();
                    self.state = DecodeState::Header;
                    events.push(match serde_json::from_slice::<Value>(&body) {
                        Ok(value) => DecodeEvent::Frame(Frame { body, value }),
                        Err(e) => DecodeEvent::Error(FrameError::InvalidJson(e.to_string())),
                    });
                }
                DecodeState::Discard { remaining } => {
                    let n = remaining.min(self.buf.len());
                    self.buf.drain(..n);
                    if n < remaining {
                        self.state = DecodeState::Discard {
                            remaining: remaining - n,
                        };
                        break;
                    }
                    self.state = DecodeState::Header;
                }
            }
        }

        events
    }

    fn header_line(&mut self, line: &[u8]) -> Option<DecodeEvent> {
        if line.is_empty() {
            if self.header_lines == 0 {
                // Stray blank line between frames.
                return None;
            }
            let length = self.content_length.take();
            self.reset_header();
            return match length {
                None => Some(DecodeEvent::Error(FrameError::MissingContentLength)),
                Some(Err(raw)) => Some(DecodeEvent::Error(FrameError::InvalidContentLength(raw))),
                Some(Ok(len)) if len > MAX_FRAME_BYTES => {
                    self.state = DecodeState::Discard { remaining: len };
                    Some(DecodeEvent::Error(FrameError::Oversized {
                        len,
                        max: MAX_FRAME_BYTES,
                    }))
                }
                Some(Ok(len)) => {
                    self.state = DecodeState::Body { len };
                    None
                }
            };
        }

        self.header_lines += 1;
        let text = String::from_utf8_lossy(line);
        let Some((key, value)) = text.split_once(':') else {
            tracing::warn!(line = %text, "Skipping malformed LSP header line");
            return None;
        };
        // Header names are matched case-insensitively.
        if key.trim().eq_ignore_ascii_case("Content-Length") {
            let raw = value.trim();
            self.content_length = Some(raw.parse::<usize>().map_err(|_| raw.to_string()));
        }
        // Other headers (e.g. Content-Type) are ignored.
        None
    }

    fn reset_header(&mut self) {
        self.header_lines = 0;
        self.content_length = None;
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Serialize `msg` and prepend its `Content-Length` header.
pub fn encode<T: Serialize + ?Sized>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    let body = serde_json::to_vec(msg)?;
    let mut out = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    out.extend_from_slice(&body);
    Ok(out)
}

/// Reads decode events from an async reader.
pub struct FrameReader<R> {
    reader: R,
    decoder: FrameDecoder,
    queued: VecDeque<DecodeEvent>,
    chunk: Box<[u8]>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(),
            queued: VecDeque::new(),
            chunk: vec![0u8; READ_CHUNK_BYTES].into_boxed_slice(),
            eof: false,
        }
    }

    /// Next decode event.
    ///
    /// Returns `Ok(None)` on clean EOF. EOF inside a frame yields one
    /// [`FrameError::UnexpectedEof`] event first.
    pub async fn next_event(&mut self) -> io::Result<Option<DecodeEvent>> {
        loop {
            if let Some(event) = self.queued.pop_front() {
                return Ok(Some(event));
            }
            if self.eof {
                return Ok(None);
            }
            let n = self.reader.read(&mut self.chunk).await?;
            if n == 0 {
                self.eof = true;
                if self.decoder.is_mid_frame() {
                    return Ok(Some(DecodeEvent::Error(FrameError::UnexpectedEof)));
                }
                return Ok(None);
            }
            self.queued.extend(self.decoder.feed(&self.chunk[..n]));
        }
    }
}

/// Writes JSON-RPC frames to an async writer.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_frame<T: Serialize + ?Sized>(&mut self, msg: &T) -> io::Result<()> {
        let bytes = encode(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.write_encoded(&bytes).await
    }

    /// Write bytes already produced by [`encode`].
    pub async fn write_encoded(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}

//! Content-encoding negotiation and the streaming response encoder.
//!
//! Negotiation intersects the client's `Accept-Encoding` quality values with
//! a per-call whitelist, preferring the server's order and falling back to
//! identity. The encoder wraps the outgoing byte stream and supports a
//! mid-stream split: the current encoded stream is flushed and finalised,
//! then a fresh one opens over the same connection.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_compression::tokio::write::{BrotliEncoder, GzipEncoder, ZlibEncoder};
use bytes::Bytes;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_ENCODING, CONTENT_LENGTH, VARY};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// A transfer encoding the engine can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Identity,
    Gzip,
    Deflate,
    Brotli,
}

impl Encoding {
    /// The `Content-Encoding` token.
    pub fn token(&self) -> &'static str {
        match self {
            Encoding::Identity => "identity",
            Encoding::Gzip => "gzip",
            Encoding::Deflate => "deflate",
            Encoding::Brotli => "br",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token {
            "identity" => Some(Encoding::Identity),
            "gzip" | "x-gzip" => Some(Encoding::Gzip),
            "deflate" => Some(Encoding::Deflate),
            "br" => Some(Encoding::Brotli),
            _ => None,
        }
    }
}

/// Picks the encoding to use for a response.
///
/// Parses `Accept-Encoding` quality values, drops zero-q entries, intersects
/// the remainder with `whitelist`, and picks the first hit in whitelist
/// (server-preferred) order. Anything unmatched falls back to identity.
pub fn negotiate(accept_encoding: Option<&str>, whitelist: &[Encoding]) -> Encoding {
    let header = match accept_encoding {
        Some(h) => h,
        None => return Encoding::Identity,
    };

    let mut acceptable = Vec::new();
    let mut wildcard = false;
    for part in header.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let mut tokens = part.splitn(2, ';');
        let name = tokens.next().unwrap_or("").trim().to_ascii_lowercase();
        let q: f32 = tokens
            .next()
            .and_then(|params| {
                params.split(';').find_map(|p| {
                    p.trim()
                        .strip_prefix("q=")
                        .and_then(|v| v.trim().parse::<f32>().ok())
                })
            })
            .unwrap_or(1.0);
        if q <= 0.0 {
            continue;
        }
        if name == "*" {
            wildcard = true;
        } else if let Some(encoding) = Encoding::from_token(&name) {
            acceptable.push(encoding);
        }
    }

    for candidate in whitelist {
        if wildcard || acceptable.contains(candidate) {
            return *candidate;
        }
    }
    Encoding::Identity
}

/// Adjusts response headers before they are written.
///
/// Compressed streams advertise their encoding and lose any previously set
/// `Content-Length`, since the encoded size is unknown until the stream ends.
pub fn before_write_head(headers: &mut HeaderMap, encoding: Encoding) {
    if encoding == Encoding::Identity {
        return;
    }
    headers.insert(CONTENT_ENCODING, HeaderValue::from_static(encoding.token()));
    headers.remove(CONTENT_LENGTH);
    headers.insert(VARY, HeaderValue::from_static("accept-encoding"));
}

/// Shared byte sink the async encoders drain into.
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn take(&self) -> Bytes {
        let mut buf = self.0.lock().expect("encoder buffer poisoned");
        Bytes::from(std::mem::take(&mut *buf))
    }
}

impl AsyncWrite for SharedBuf {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.0
            .lock()
            .expect("encoder buffer poisoned")
            .extend_from_slice(data);
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

enum EncoderKind {
    Identity,
    Gzip(Box<GzipEncoder<SharedBuf>>),
    Deflate(Box<ZlibEncoder<SharedBuf>>),
    Brotli(Box<BrotliEncoder<SharedBuf>>),
}

/// Incremental encoder for one response stream.
///
/// Each `write` returns the encoded bytes produced so far; `finish` drains
/// the codec trailer; `split` finalises the current encoded stream and opens
/// a new one, so the response body carries several concatenated members.
pub struct StreamEncoder {
    encoding: Encoding,
    buf: SharedBuf,
    kind: EncoderKind,
}

impl StreamEncoder {
    pub fn new(encoding: Encoding) -> Self {
        let buf = SharedBuf::default();
        let kind = Self::make_kind(encoding, &buf);
        Self {
            encoding,
            buf,
            kind,
        }
    }

    fn make_kind(encoding: Encoding, buf: &SharedBuf) -> EncoderKind {
        match encoding {
            Encoding::Identity => EncoderKind::Identity,
            Encoding::Gzip => EncoderKind::Gzip(Box::new(GzipEncoder::new(buf.clone()))),
            Encoding::Deflate => EncoderKind::Deflate(Box::new(ZlibEncoder::new(buf.clone()))),
            Encoding::Brotli => EncoderKind::Brotli(Box::new(BrotliEncoder::new(buf.clone()))),
        }
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Encodes one chunk and returns whatever output the codec produced.
    ///
    /// The codec is sync-flushed after every chunk so the client can decode
    /// everything written so far; event streams depend on that.
    pub async fn write(&mut self, chunk: &[u8]) -> io::Result<Bytes> {
        match &mut self.kind {
            EncoderKind::Identity => Ok(Bytes::copy_from_slice(chunk)),
            EncoderKind::Gzip(enc) => {
                enc.write_all(chunk).await?;
                enc.flush().await?;
                Ok(self.buf.take())
            }
            EncoderKind::Deflate(enc) => {
                enc.write_all(chunk).await?;
                enc.flush().await?;
                Ok(self.buf.take())
            }
            EncoderKind::Brotli(enc) => {
                enc.write_all(chunk).await?;
                enc.flush().await?;
                Ok(self.buf.take())
            }
        }
    }

    /// Finalises the current encoded stream and returns its trailer bytes.
    pub async fn finish(&mut self) -> io::Result<Bytes> {
        match &mut self.kind {
            EncoderKind::Identity => Ok(Bytes::new()),
            EncoderKind::Gzip(enc) => {
                enc.shutdown().await?;
                Ok(self.buf.take())
            }
            EncoderKind::Deflate(enc) => {
                enc.shutdown().await?;
                Ok(self.buf.take())
            }
            EncoderKind::Brotli(enc) => {
                enc.shutdown().await?;
                Ok(self.buf.take())
            }
        }
    }

    /// Finalises the current encoded stream and opens a fresh one.
    ///
    /// Returns the trailer of the finished stream; subsequent writes go
    /// through the new codec.
    pub async fn split(&mut self) -> io::Result<Bytes> {
        let tail = self.finish().await?;
        self.kind = Self::make_kind(self.encoding, &self.buf);
        Ok(tail)
    }
}

/// One-shot encode of a buffered body.
pub async fn encode_all(encoding: Encoding, data: &[u8]) -> io::Result<Bytes> {
    if encoding == Encoding::Identity {
        return Ok(Bytes::copy_from_slice(data));
    }
    let mut encoder = StreamEncoder::new(encoding);
    let mut out = Vec::with_capacity(data.len() / 2);
    out.extend_from_slice(&encoder.write(data).await?);
    out.extend_from_slice(&encoder.finish().await?);
    Ok(Bytes::from(out))
}

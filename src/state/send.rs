//! Response writers.
//!
//! Every sender ends the response stream and returns a [`StreamEnded`]
//! sentinel proving it; handlers pass that sentinel back to the router.
//! Headers are written at most once per response: the first sender wins,
//! later attempts are logged with the first call site and ignored.

use std::io;

use bytes::Bytes;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::Frame;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::{Response, StatusCode};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::encoding::{before_write_head, encode_all, Encoding, StreamEncoder};
use crate::error::{ErrorReason, SendError};

use super::RequestState;

/// Body type the engine uses on both sides: request bodies are boxed into
/// it by the router, and every response carries one.
pub type EngineBody = UnsyncBoxBody<Bytes, io::Error>;

/// The response staged on the state, handed to hyper when dispatch returns.
pub(crate) type StagedResponse = Response<EngineBody>;

/// Proof that the response stream has ended.
///
/// Only senders mint this value; a handler completes a request by returning
/// it (wrapped in [`Flow::Done`]) to the router.
#[derive(Debug)]
pub struct StreamEnded(pub(crate) ());

/// What a handler tells the router to do next.
#[derive(Debug)]
pub enum Flow {
    /// This handler did not finish the response; try the next one.
    Continue,
    /// The response stream has ended.
    Done(StreamEnded),
}

impl From<StreamEnded> for Flow {
    fn from(ended: StreamEnded) -> Self {
        Flow::Done(ended)
    }
}

/// `SameSite` attribute values for [`CookieOptions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

/// Attributes for [`RequestState::set_cookie`].
#[derive(Debug, Clone, Default)]
pub struct CookieOptions {
    pub domain: Option<String>,
    pub path: Option<String>,
    pub expires: Option<std::time::SystemTime>,
    pub max_age: Option<i64>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<SameSite>,
}

pub(crate) fn full_body(data: Bytes) -> EngineBody {
    Full::new(data).map_err(|never| match never {}).boxed_unsync()
}

pub(crate) fn empty_body() -> EngineBody {
    Empty::new().map_err(|never| match never {}).boxed_unsync()
}

/// A bounded channel whose receiver is the response body. Senders feed the
/// client with backpressure; dropping the sender ends the body.
pub(crate) fn channel_body() -> (mpsc::Sender<io::Result<Bytes>>, EngineBody) {
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(16);
    let body = StreamBody::new(rx.map(|result| result.map(Frame::data)));
    (tx, body.boxed_unsync())
}

fn status_code(status: u16) -> Result<StatusCode, SendError> {
    StatusCode::from_u16(status)
        .map_err(|_| SendError::internal(format!("invalid status code {}", status)))
}

impl RequestState {
    /// The staging core. Applies the headers-written-once rule, merges
    /// pending headers (cookies), and records the staged response.
    pub(crate) fn stage(
        &mut self,
        label: &'static str,
        status: u16,
        mut headers: HeaderMap,
        body: EngineBody,
    ) -> Result<StreamEnded, SendError> {
        if let Some(first) = self.headers_sent {
            tracing::warn!(
                first_sender = first,
                attempted = label,
                route = %self.route_path,
                "response headers already sent; ignoring second send"
            );
            return Ok(StreamEnded(()));
        }

        for (name, value) in self.pending_headers.iter() {
            headers.append(name.clone(), value.clone());
        }

        let mut response = Response::new(body);
        *response.status_mut() = status_code(status)?;
        *response.headers_mut() = headers;

        self.headers_sent = Some(label);
        self.response = Some(response);
        Ok(StreamEnded(()))
    }

    /// Stages a buffered payload, compressing it first when an encoding was
    /// negotiated. Sets `Content-Length`; HEAD responses keep the length but
    /// omit the body.
    async fn stage_buffered(
        &mut self,
        label: &'static str,
        status: u16,
        mut headers: HeaderMap,
        payload: Bytes,
    ) -> Result<StreamEnded, SendError> {
        let payload = if self.encoding == Encoding::Identity {
            payload
        } else {
            let encoded = encode_all(self.encoding, &payload)
                .await
                .map_err(SendError::internal)?;
            before_write_head(&mut headers, self.encoding);
            encoded
        };

        headers.insert(
            hyper::header::CONTENT_LENGTH,
            HeaderValue::from(payload.len()),
        );

        let body = if self.is_head() {
            empty_body()
        } else {
            full_body(payload)
        };
        self.stage(label, status, headers, body)
    }

    /// Sends a response with no body.
    pub fn send_empty(
        &mut self,
        status: u16,
        headers: HeaderMap,
    ) -> Result<StreamEnded, SendError> {
        self.stage("send_empty", status, headers, empty_body())
    }

    /// Sends a UTF-8 string body with `Content-Length` set.
    pub async fn send_string(
        &mut self,
        status: u16,
        headers: HeaderMap,
        data: impl Into<String>,
    ) -> Result<StreamEnded, SendError> {
        let payload = Bytes::from(data.into().into_bytes());
        self.stage_buffered("send_string", status, headers, payload)
            .await
    }

    /// Sends a byte buffer with `Content-Length` set.
    pub async fn send_buffer(
        &mut self,
        status: u16,
        headers: HeaderMap,
        buf: Bytes,
    ) -> Result<StreamEnded, SendError> {
        self.stage_buffered("send_buffer", status, headers, buf)
            .await
    }

    /// Pipes a reader as the response body, through the negotiated encoding.
    ///
    /// For HEAD the source is dropped and only headers go out.
    pub fn send_stream(
        &mut self,
        status: u16,
        mut headers: HeaderMap,
        reader: impl AsyncRead + Send + Unpin + 'static,
    ) -> Result<StreamEnded, SendError> {
        if self.is_head() {
            drop(reader);
            return self.stage("send_stream", status, headers, empty_body());
        }

        before_write_head(&mut headers, self.encoding);
        let (tx, body) = channel_body();
        let ended = self.stage("send_stream", status, headers, body)?;
        tokio::spawn(pump_reader(reader, StreamEncoder::new(self.encoding), tx));
        Ok(ended)
    }

    /// Sends plain text as `text/plain; charset=utf-8`.
    pub async fn send_simple(&mut self, status: u16, text: &str) -> Result<StreamEnded, SendError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            hyper::header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        let payload = Bytes::copy_from_slice(text.as_bytes());
        self.stage_buffered("send_simple", status, headers, payload)
            .await
    }

    /// Serialises a value as `application/json; charset=utf-8`.
    pub async fn send_json<T: Serialize>(
        &mut self,
        status: u16,
        value: &T,
    ) -> Result<StreamEnded, SendError> {
        let payload = serde_json::to_vec(value).map_err(SendError::internal)?;
        let mut headers = HeaderMap::new();
        headers.insert(
            hyper::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        self.stage_buffered("send_json", status, headers, Bytes::from(payload))
            .await
    }

    /// 302 redirect. The listener's path prefix is prepended to `location`.
    pub fn redirect(&mut self, location: &str) -> Result<StreamEnded, SendError> {
        let target = format!("{}{}", self.path_prefix, location);
        let mut headers = HeaderMap::new();
        headers.insert(
            hyper::header::LOCATION,
            HeaderValue::from_str(&target)
                .map_err(|_| SendError::internal("invalid redirect location"))?,
        );
        self.stage("redirect", 302, headers, empty_body())
    }

    /// Ends the response with an empty 200.
    pub fn end(&mut self) -> Result<StreamEnded, SendError> {
        self.stage("end", 200, HeaderMap::new(), empty_body())
    }

    /// Opens a chunked response the caller writes to incrementally.
    ///
    /// The writer routes every chunk through the negotiated encoding and
    /// supports a mid-stream compression split.
    pub fn send_writer(
        &mut self,
        status: u16,
        mut headers: HeaderMap,
    ) -> Result<BodyWriter, SendError> {
        before_write_head(&mut headers, self.encoding);
        let discard = self.is_head();
        let (tx, body) = channel_body();
        let sentinel = self.stage("send_writer", status, headers, body)?;
        Ok(BodyWriter {
            tx,
            encoder: StreamEncoder::new(self.encoding),
            sentinel: Some(sentinel),
            discard,
        })
    }

    /// Queues a header for the response; merged into whichever sender runs.
    pub fn set_header(&mut self, name: &str, value: &str) {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            tracing::warn!(header = %name, "invalid header ignored");
            return;
        };
        self.pending_headers.insert(name, value);
    }

    /// Queues a `Set-Cookie` header for the response. The value is
    /// URL-encoded.
    pub fn set_cookie(&mut self, name: &str, value: &str, options: CookieOptions) {
        let mut cookie = format!("{}={}", name, urlencoding::encode(value));
        if let Some(domain) = &options.domain {
            cookie.push_str("; Domain=");
            cookie.push_str(domain);
        }
        if let Some(path) = &options.path {
            cookie.push_str("; Path=");
            cookie.push_str(path);
        }
        if let Some(expires) = options.expires {
            cookie.push_str("; Expires=");
            cookie.push_str(&httpdate::fmt_http_date(expires));
        }
        if let Some(max_age) = options.max_age {
            cookie.push_str(&format!("; Max-Age={}", max_age));
        }
        if options.secure {
            cookie.push_str("; Secure");
        }
        if options.http_only {
            cookie.push_str("; HttpOnly");
        }
        match options.same_site {
            Some(SameSite::Strict) => cookie.push_str("; SameSite=Strict"),
            Some(SameSite::Lax) => cookie.push_str("; SameSite=Lax"),
            Some(SameSite::None) => cookie.push_str("; SameSite=None"),
            None => {}
        }
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            self.pending_headers
                .append(HeaderName::from_static("set-cookie"), value);
        } else {
            tracing::warn!(cookie = %name, "cookie value not representable as a header");
        }
    }
}

/// Pumps a reader through an encoder into the response channel.
async fn pump_reader(
    mut reader: impl AsyncRead + Send + Unpin,
    mut encoder: StreamEncoder,
    mut tx: mpsc::Sender<io::Result<Bytes>>,
) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let encoded = match encoder.write(&buf[..n]).await {
                    Ok(encoded) => encoded,
                    Err(err) => {
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                };
                if !encoded.is_empty() && tx.send(Ok(encoded)).await.is_err() {
                    // Client went away; stop reading.
                    return;
                }
            }
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                return;
            }
        }
    }
    if let Ok(tail) = encoder.finish().await {
        if !tail.is_empty() {
            let _ = tx.send(Ok(tail)).await;
        }
    }
}

/// Incremental writer for chunked responses (logs, exports).
pub struct BodyWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
    encoder: StreamEncoder,
    sentinel: Option<StreamEnded>,
    discard: bool,
}

impl BodyWriter {
    fn closed_error() -> SendError {
        SendError::new(ErrorReason::StreamClosed, 500)
    }

    /// Writes one chunk, awaiting client backpressure.
    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), SendError> {
        if self.sentinel.is_none() {
            return Err(Self::closed_error());
        }
        if self.discard {
            return Ok(());
        }
        let encoded = self
            .encoder
            .write(chunk)
            .await
            .map_err(SendError::internal)?;
        if !encoded.is_empty() {
            self.tx
                .send(Ok(encoded))
                .await
                .map_err(|_| Self::closed_error())?;
        }
        Ok(())
    }

    /// Finalises the current encoded stream and opens a new one mid-body.
    pub async fn split_compression_stream(&mut self) -> Result<(), SendError> {
        if self.sentinel.is_none() {
            return Err(Self::closed_error());
        }
        let tail = self.encoder.split().await.map_err(SendError::internal)?;
        if !self.discard && !tail.is_empty() {
            self.tx
                .send(Ok(tail))
                .await
                .map_err(|_| Self::closed_error())?;
        }
        Ok(())
    }

    /// Flushes the encoder trailer and ends the body.
    pub async fn end(mut self) -> Result<StreamEnded, SendError> {
        let sentinel = self.sentinel.take().ok_or_else(Self::closed_error)?;
        let tail = self.encoder.finish().await.map_err(SendError::internal)?;
        if !self.discard && !tail.is_empty() {
            self.tx
                .send(Ok(tail))
                .await
                .map_err(|_| Self::closed_error())?;
        }
        Ok(sentinel)
    }
}

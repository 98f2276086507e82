//! Server-Sent Events.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::channel::mpsc;
use futures::SinkExt;
use hyper::header::{HeaderMap, HeaderValue};
use serde::Serialize;

use crate::error::{ErrorReason, SendError};

use super::send::{channel_body, StreamEnded};
use super::{Protocol, RequestState};

type CloseCallback = Box<dyn FnOnce() + Send>;

/// Live handle to an open event stream.
///
/// Cloned freely; all clones share the closed flag and close callbacks.
/// Events are observed by the client in emission order. Every write awaits
/// channel backpressure, and writing after close fails.
#[derive(Clone)]
pub struct SseHandle {
    tx: mpsc::Sender<io::Result<Bytes>>,
    closed: Arc<AtomicBool>,
    retry_ms: Option<u64>,
    on_close: Arc<Mutex<Vec<CloseCallback>>>,
}

impl RequestState {
    /// Starts a Server-Sent Events response.
    ///
    /// Writes the SSE header set and a preamble comment, subscribes the
    /// stream to the `exit` event, and returns the live handle together with
    /// the stream-ended sentinel for the router.
    ///
    /// `retry_ms`, when given, is appended to every event so clients know
    /// how long to wait before reconnecting.
    pub fn send_sse(
        &mut self,
        retry_ms: Option<u64>,
    ) -> Result<(SseHandle, StreamEnded), SendError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            hyper::header::CONTENT_TYPE,
            HeaderValue::from_static("text/event-stream"),
        );
        headers.insert(
            hyper::header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache, max-age=0"),
        );
        headers.insert(
            hyper::header::CONTENT_ENCODING,
            HeaderValue::from_static("identity"),
        );
        if self.protocol == Protocol::Http1 {
            headers.insert(
                hyper::header::CONNECTION,
                HeaderValue::from_static("keep-alive"),
            );
        }
        headers.insert("x-accel-buffering", HeaderValue::from_static("no"));

        let (mut tx, body) = channel_body();
        let ended = self.stage_sse(headers, body)?;

        // Preamble comment so proxies flush the headers immediately.
        let _ = tx.try_send(Ok(Bytes::from_static(b": stream open\n\n")));

        let handle = SseHandle {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
            retry_ms,
            on_close: Arc::new(Mutex::new(Vec::new())),
        };

        // Event streams close on graceful shutdown.
        let exit_handle = handle.clone();
        let bus = self.bus();
        tokio::spawn(async move {
            bus.wait_exit().await;
            exit_handle.close();
        });

        Ok((handle, ended))
    }

    fn stage_sse(
        &mut self,
        headers: HeaderMap,
        body: super::send::EngineBody,
    ) -> Result<StreamEnded, SendError> {
        // SSE always goes out unencoded, whatever was negotiated earlier.
        self.encoding = crate::encoding::Encoding::Identity;
        self.stage("send_sse", 200, headers, body)
    }
}

impl SseHandle {
    fn closed_error() -> SendError {
        SendError::new(ErrorReason::StreamClosed, 500)
    }

    fn check_field(value: &str, what: &str) -> Result<(), SendError> {
        if value.contains('\n') || value.contains('\r') {
            return Err(SendError::bad_request(serde_json::json!({
                "field": what,
                "message": "newlines are not allowed in SSE fields",
            })));
        }
        Ok(())
    }

    async fn write(&mut self, frame: String) -> Result<(), SendError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Self::closed_error());
        }
        if self.tx.send(Ok(Bytes::from(frame))).await.is_err() {
            // Client disconnected under us.
            self.close();
            return Err(Self::closed_error());
        }
        Ok(())
    }

    /// Emits one named event. `data` is JSON-serialised into the data line.
    pub async fn emit_event<T: Serialize>(
        &mut self,
        name: &str,
        data: &T,
        id: Option<&str>,
    ) -> Result<(), SendError> {
        Self::check_field(name, "event name")?;
        if let Some(id) = id {
            Self::check_field(id, "event id")?;
        }
        let payload = serde_json::to_string(data).map_err(SendError::internal)?;

        let mut frame = format!("event: {}\n", name);
        if let Some(id) = id {
            frame.push_str(&format!("id: {}\n", id));
        }
        if let Some(retry) = self.retry_ms {
            frame.push_str(&format!("retry: {}\n", retry));
        }
        frame.push_str(&format!("data: {}\n\n", payload));
        self.write(frame).await
    }

    /// Emits a comment line.
    pub async fn emit_comment(&mut self, text: &str) -> Result<(), SendError> {
        Self::check_field(text, "comment")?;
        self.write(format!(": {}\n\n", text)).await
    }

    /// Registers a callback fired once, when the stream closes.
    ///
    /// If the stream is already closed the callback fires immediately.
    pub fn on_close(&self, callback: impl FnOnce() + Send + 'static) {
        if self.closed.load(Ordering::SeqCst) {
            callback();
            return;
        }
        self.on_close
            .lock()
            .expect("close callbacks poisoned")
            .push(Box::new(callback));
    }

    /// Closes the stream. Idempotent; fires the close callbacks once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tx = self.tx.clone();
        tx.close_channel();
        let callbacks: Vec<CloseCallback> = {
            let mut guard = self.on_close.lock().expect("close callbacks poisoned");
            guard.drain(..).collect()
        };
        for callback in callbacks {
            callback();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

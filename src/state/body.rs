//! Request-body formats and their preparation.
//!
//! Each route declares the shape in which its handlers want the body; the
//! router prepares `data_buffer` / `data` accordingly before invoking them.

use ahash::AHashMap;
use bytes::Bytes;
use http_body_util::BodyExt;

use crate::error::SendError;

use super::RequestState;

/// The declared shape in which a handler receives the request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyFormat {
    /// The body is not read at all.
    #[default]
    Ignore,
    /// The handler consumes the raw stream itself.
    Stream,
    /// The body is read into `data_buffer`.
    Buffer,
    /// The body is decoded into a UTF-8 string.
    String,
    /// The body is parsed as JSON into `data`.
    Json,
    /// `application/x-www-form-urlencoded`, last value wins per name.
    UrlEncoded,
    /// `application/x-www-form-urlencoded` kept as an ordered multi-map.
    UrlEncodedMulti,
    /// The handler iterates parts via `read_multipart_data`.
    Multipart,
}

impl BodyFormat {
    /// Whether this format leaves the raw stream to the handler.
    pub fn leaves_stream(&self) -> bool {
        matches!(
            self,
            BodyFormat::Ignore | BodyFormat::Stream | BodyFormat::Multipart
        )
    }

    /// Whether a request whose `Content-Type` implies `incoming` can be
    /// served by a route declaring this format.
    pub(crate) fn accepts(&self, incoming: IncomingBodyKind) -> bool {
        match self {
            BodyFormat::Json => incoming == IncomingBodyKind::Json,
            BodyFormat::UrlEncoded | BodyFormat::UrlEncodedMulti => {
                incoming == IncomingBodyKind::Form
            }
            BodyFormat::Multipart => incoming == IncomingBodyKind::Multipart,
            // Generic formats take any body.
            BodyFormat::Ignore | BodyFormat::Stream | BodyFormat::Buffer | BodyFormat::String => {
                true
            }
        }
    }
}

/// Coarse body family implied by a request's `Content-Type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IncomingBodyKind {
    Json,
    Form,
    Multipart,
    Other,
}

pub(crate) fn incoming_body_kind(content_type: Option<&str>) -> IncomingBodyKind {
    let Some(raw) = content_type else {
        return IncomingBodyKind::Other;
    };
    match raw.parse::<mime::Mime>() {
        Ok(m) => match (m.type_(), m.subtype()) {
            (mime::APPLICATION, mime::JSON) => IncomingBodyKind::Json,
            (mime::APPLICATION, subtype) if subtype.as_str().ends_with("+json") => {
                IncomingBodyKind::Json
            }
            (mime::APPLICATION, subtype) if subtype == "x-www-form-urlencoded" => {
                IncomingBodyKind::Form
            }
            (mime::MULTIPART, _) => IncomingBodyKind::Multipart,
            _ => IncomingBodyKind::Other,
        },
        Err(_) => IncomingBodyKind::Other,
    }
}

/// The parsed body value a preparing format leaves in `data`.
#[derive(Debug, Clone, PartialEq)]
pub enum BodyData {
    Text(String),
    Json(serde_json::Value),
    UrlEncoded(AHashMap<String, String>),
    UrlEncodedMulti(Vec<(String, String)>),
}

impl RequestState {
    /// Reads the whole body into one buffer, enforcing the size ceiling.
    ///
    /// Idempotent: the buffer is cached after the first read.
    pub async fn read_buffer(&mut self) -> Result<Bytes, SendError> {
        if let Some(buffered) = &self.data_buffer {
            return Ok(buffered.clone());
        }

        let mut body = self
            .body
            .take()
            .ok_or_else(|| SendError::internal("request body already consumed"))?;

        let mut collected: Vec<u8> = Vec::new();
        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(|err| SendError::internal(err))?;
            if let Ok(data) = frame.into_data() {
                if collected.len() + data.len() > self.body_limit {
                    return Err(SendError::payload_too_large(self.body_limit));
                }
                collected.extend_from_slice(&data);
            }
        }

        let buffer = Bytes::from(collected);
        self.data_buffer = Some(buffer.clone());
        Ok(buffer)
    }

    /// Prepares `data_buffer` / `data` for the given format.
    ///
    /// Called by the router after matching; formats that leave the stream to
    /// the handler do nothing here.
    pub(crate) async fn prepare_body(&mut self, format: BodyFormat) -> Result<(), SendError> {
        self.body_format = format;
        match format {
            BodyFormat::Ignore | BodyFormat::Stream | BodyFormat::Multipart => Ok(()),
            BodyFormat::Buffer => {
                self.read_buffer().await?;
                Ok(())
            }
            BodyFormat::String => {
                let buffer = self.read_buffer().await?;
                let text = String::from_utf8(buffer.to_vec()).map_err(|err| {
                    SendError::bad_request(serde_json::Value::String(err.to_string()))
                })?;
                self.data = Some(BodyData::Text(text));
                Ok(())
            }
            BodyFormat::Json => {
                let buffer = self.read_buffer().await?;
                let value: serde_json::Value = serde_json::from_slice(&buffer)?;
                self.data = Some(BodyData::Json(value));
                Ok(())
            }
            BodyFormat::UrlEncoded => {
                let buffer = self.read_buffer().await?;
                let mut map = AHashMap::new();
                for (key, value) in url::form_urlencoded::parse(&buffer) {
                    map.insert(key.into_owned(), value.into_owned());
                }
                self.data = Some(BodyData::UrlEncoded(map));
                Ok(())
            }
            BodyFormat::UrlEncodedMulti => {
                let buffer = self.read_buffer().await?;
                let pairs = url::form_urlencoded::parse(&buffer)
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect();
                self.data = Some(BodyData::UrlEncodedMulti(pairs));
                Ok(())
            }
        }
    }
}

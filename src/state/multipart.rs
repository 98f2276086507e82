//! Multipart body ingestion.
//!
//! Parts are delivered to a sink in stream order; the next chunk is not
//! produced until the previous callback has completed, so slow consumers
//! apply backpressure naturally.

use std::future::Future;
use std::pin::Pin;

use crate::error::{ErrorReason, SendError};

use super::RequestState;

/// Chunk size handed to `on_part_chunk`.
const PART_CHUNK_SIZE: usize = 64 * 1024;

/// Metadata of one multipart part, taken from its header block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartInfo {
    /// `name` parameter of `Content-Disposition`.
    pub name: Option<String>,
    /// `filename` parameter of `Content-Disposition`, if this is a file part.
    pub filename: Option<String>,
    /// The part's own `Content-Type`, if present.
    pub content_type: Option<String>,
    /// All part headers in stream order.
    pub headers: Vec<(String, String)>,
}

/// Future returned by the sink callbacks.
pub type SinkFuture<'a> = Pin<Box<dyn Future<Output = Result<(), SendError>> + Send + 'a>>;

/// Receives multipart parts as they are read.
pub trait MultipartSink: Send {
    fn on_part_start<'a>(&'a mut self, part: &'a PartInfo) -> SinkFuture<'a>;
    fn on_part_chunk<'a>(&'a mut self, chunk: &'a [u8]) -> SinkFuture<'a>;
    fn on_part_end<'a>(&'a mut self) -> SinkFuture<'a>;
}

impl RequestState {
    /// Iterates the multipart parts of the request body through `sink`.
    ///
    /// Fails with `MULTIPART_INVALID_CONTENT_TYPE` when the request is not
    /// `multipart/*`, and with `MULTIPART_MISSING_BOUNDARY` when the content
    /// type has no boundary parameter.
    pub async fn read_multipart_data<S: MultipartSink>(
        &mut self,
        sink: &mut S,
    ) -> Result<(), SendError> {
        let content_type = self
            .header_str("content-type")
            .unwrap_or_default()
            .to_string();
        let mime: mime::Mime = content_type
            .parse()
            .map_err(|_| SendError::new(ErrorReason::MultipartInvalidContentType, 400))?;
        if mime.type_() != mime::MULTIPART {
            return Err(SendError::new(ErrorReason::MultipartInvalidContentType, 400));
        }
        let boundary = mime
            .get_param(mime::BOUNDARY)
            .map(|b| b.as_str().to_string())
            .filter(|b| !b.is_empty())
            .ok_or_else(|| SendError::new(ErrorReason::MultipartMissingBoundary, 400))?;

        let body = self.read_buffer().await?;
        walk_parts(&body, &boundary, sink).await
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Unquotes a `Content-Disposition` parameter value.
fn unquote(value: &str) -> &str {
    let value = value.trim();
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

fn parse_part_headers(block: &str) -> PartInfo {
    let mut info = PartInfo::default();
    for line in block.lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim().to_string();

        if name == "content-disposition" {
            for param in value.split(';').skip(1) {
                let Some((key, raw)) = param.trim().split_once('=') else {
                    continue;
                };
                match key.trim().to_ascii_lowercase().as_str() {
                    "name" => info.name = Some(unquote(raw).to_string()),
                    "filename" | "filename*" => info.filename = Some(unquote(raw).to_string()),
                    _ => {}
                }
            }
        } else if name == "content-type" {
            info.content_type = Some(value.clone());
        }
        info.headers.push((name, value));
    }
    info
}

/// Walks `--boundary`-delimited parts, driving the sink serially.
async fn walk_parts<S: MultipartSink>(
    body: &[u8],
    boundary: &str,
    sink: &mut S,
) -> Result<(), SendError> {
    let delim = format!("--{}", boundary);
    let next_delim = format!("\r\n--{}", boundary);

    let mut pos = match find_subsequence(body, delim.as_bytes()) {
        Some(at) => at + delim.len(),
        None => return Ok(()),
    };

    loop {
        // A delimiter followed by "--" is the closing one.
        if body.get(pos..pos + 2) == Some(b"--") {
            return Ok(());
        }
        if body.get(pos..pos + 2) == Some(b"\r\n") {
            pos += 2;
        }

        let Some(header_end) = find_subsequence(&body[pos..], b"\r\n\r\n") else {
            return Ok(());
        };
        let header_block = String::from_utf8_lossy(&body[pos..pos + header_end]).into_owned();
        let info = parse_part_headers(&header_block);

        let content_start = pos + header_end + 4;
        let content_len = match find_subsequence(&body[content_start..], next_delim.as_bytes()) {
            Some(len) => len,
            None => return Ok(()),
        };
        let content = &body[content_start..content_start + content_len];

        sink.on_part_start(&info).await?;
        for chunk in content.chunks(PART_CHUNK_SIZE) {
            sink.on_part_chunk(chunk).await?;
        }
        sink.on_part_end().await?;

        pos = content_start + content_len + next_delim.len();
    }
}

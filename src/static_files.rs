//! Static-file responses with range and conditional-GET semantics.

use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::time::SystemTime;

use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::{ErrorReason, SendError};
use crate::state::send::empty_body;
use crate::state::{RequestState, StreamEnded};

/// Future returned by a file-sender hook.
pub type FileHookFuture<'a> =
    Pin<Box<dyn Future<Output = Result<StreamEnded, SendError>> + Send + 'a>>;

/// Callback invoked instead of the default 404 / directory response.
pub type FileHook = Box<dyn for<'a> FnOnce(&'a mut RequestState) -> FileHookFuture<'a> + Send>;

/// Options for [`RequestState::send_file`].
pub struct SendFileOptions {
    /// Directory every served path is resolved under.
    pub root: PathBuf,
    /// Request-relative file path, usually a regex capture.
    pub path: String,
    /// Serve only from this byte offset.
    pub offset: Option<u64>,
    /// Serve at most this many bytes.
    pub length: Option<u64>,
    /// Advertise and honour `Range` requests.
    pub accept_ranges: bool,
    /// Explicit `Cache-Control` value; wins over `max_age`/`immutable`.
    pub cache_control: Option<String>,
    /// Appends `immutable` to a generated `Cache-Control`.
    pub immutable: bool,
    /// Emit an `ETag` and honour `If-None-Match`.
    pub etag: bool,
    /// Extensions tried in order when the path itself does not exist.
    pub extensions: Vec<String>,
    /// Emit `Last-Modified` and honour `If-Modified-Since`.
    pub last_modified: bool,
    /// `max-age` for a generated `Cache-Control`.
    pub max_age: Option<u64>,
    /// Invoked when the file does not exist; default sends 404.
    pub on_not_found: Option<FileHook>,
    /// Invoked when the path is a directory; default sends 404 with
    /// `x-reason: Directory listing not allowed`.
    pub on_dir: Option<FileHook>,
}

impl SendFileOptions {
    pub fn new(root: impl Into<PathBuf>, path: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            path: path.into(),
            offset: None,
            length: None,
            accept_ranges: true,
            cache_control: None,
            immutable: false,
            etag: true,
            extensions: Vec::new(),
            last_modified: true,
            max_age: None,
            on_not_found: None,
            on_dir: None,
        }
    }
}

/// Resolves a request-relative path under the root.
///
/// Every component is checked: traversal steps and dotfiles never resolve,
/// so the result is always inside `root`.
fn resolve_safe(root: &Path, request_path: &str) -> Option<PathBuf> {
    let mut resolved = root.to_path_buf();
    let relative = request_path.trim_start_matches('/');
    if relative.is_empty() {
        return None;
    }
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => {
                let part_str = part.to_str()?;
                if part_str.starts_with('.') {
                    return None;
                }
                resolved.push(part_str);
            }
            _ => return None,
        }
    }
    Some(resolved)
}

/// One `bytes=` range narrowed against the entity size.
fn parse_range(header: &str, entity_len: u64) -> Option<Result<(u64, u64), ()>> {
    let spec = header.strip_prefix("bytes=")?.trim();
    // Multi-range requests are served whole.
    if spec.contains(',') {
        return None;
    }
    let (start_raw, end_raw) = spec.split_once('-')?;
    if start_raw.is_empty() {
        // Suffix form: last N bytes.
        let suffix: u64 = end_raw.parse().ok()?;
        if suffix == 0 {
            return Some(Err(()));
        }
        let start = entity_len.saturating_sub(suffix);
        return Some(Ok((start, entity_len.saturating_sub(1))));
    }
    let start: u64 = start_raw.parse().ok()?;
    if start >= entity_len {
        return Some(Err(()));
    }
    let end = if end_raw.is_empty() {
        entity_len - 1
    } else {
        end_raw.parse::<u64>().ok()?.min(entity_len - 1)
    };
    if end < start {
        return Some(Err(()));
    }
    Some(Ok((start, end)))
}

fn file_etag(len: u64, modified: Option<SystemTime>) -> String {
    let mtime = modified
        .and_then(|m| m.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("\"{:x}-{:x}\"", len, mtime)
}

impl RequestState {
    /// Serves a file from `options.root`, honouring range and conditional
    /// headers, through the negotiated content encoding.
    pub async fn send_file(&mut self, options: SendFileOptions) -> Result<StreamEnded, SendError> {
        let SendFileOptions {
            root,
            path,
            offset,
            length,
            accept_ranges,
            cache_control,
            immutable,
            etag: want_etag,
            extensions,
            last_modified: want_last_modified,
            max_age,
            on_not_found,
            on_dir,
        } = options;

        let Some(base) = resolve_safe(&root, &path) else {
            return self.file_not_found(on_not_found).await;
        };

        // The path itself, then each fallback extension.
        let mut candidates = vec![base.clone()];
        for ext in &extensions {
            let mut with_ext = base.clone().into_os_string();
            with_ext.push(".");
            with_ext.push(ext);
            candidates.push(PathBuf::from(with_ext));
        }

        let mut found: Option<(PathBuf, std::fs::Metadata)> = None;
        for candidate in candidates {
            match tokio::fs::metadata(&candidate).await {
                Ok(meta) => {
                    found = Some((candidate, meta));
                    break;
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(SendError::internal(err)),
            }
        }
        let Some((file_path, meta)) = found else {
            return self.file_not_found(on_not_found).await;
        };

        if meta.is_dir() {
            if let Some(hook) = on_dir {
                return hook(self).await;
            }
            let mut headers = HeaderMap::new();
            headers.insert(
                HeaderName::from_static("x-reason"),
                HeaderValue::from_static("Directory listing not allowed"),
            );
            return self.stage("send_file", 404, headers, empty_body());
        }

        let file_len = meta.len();
        let modified = meta.modified().ok();
        let etag = file_etag(file_len, modified);

        let mut headers = HeaderMap::new();
        let mime = mime_guess::from_path(&file_path).first_or_octet_stream();
        headers.insert(
            hyper::header::CONTENT_TYPE,
            HeaderValue::from_str(mime.as_ref())
                .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
        );
        if accept_ranges {
            headers.insert(
                hyper::header::ACCEPT_RANGES,
                HeaderValue::from_static("bytes"),
            );
        }
        if want_etag {
            if let Ok(value) = HeaderValue::from_str(&etag) {
                headers.insert(hyper::header::ETAG, value);
            }
        }
        if want_last_modified {
            if let Some(modified) = modified {
                if let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(modified)) {
                    headers.insert(hyper::header::LAST_MODIFIED, value);
                }
            }
        }
        let cache_value = cache_control.or_else(|| {
            max_age.map(|age| {
                if immutable {
                    format!("public, max-age={}, immutable", age)
                } else {
                    format!("public, max-age={}", age)
                }
            })
        });
        if let Some(value) = cache_value {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(hyper::header::CACHE_CONTROL, value);
            }
        }

        // Conditional GET.
        if want_etag {
            if let Some(if_none_match) = self.header_str("if-none-match") {
                if if_none_match.split(',').any(|t| t.trim() == etag) {
                    return self.stage("send_file", 304, headers, empty_body());
                }
            }
        }
        if want_last_modified {
            if let (Some(since), Some(modified)) = (
                self.header_str("if-modified-since")
                    .and_then(|v| httpdate::parse_http_date(v).ok()),
                modified,
            ) {
                // HTTP dates have second precision.
                let modified_secs = modified
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                let since_secs = since
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                if modified_secs <= since_secs {
                    return self.stage("send_file", 304, headers, empty_body());
                }
            }
        }

        // The entity is the window selected by offset/length.
        let entity_start = offset.unwrap_or(0);
        if entity_start > file_len {
            return Err(SendError::new(ErrorReason::RangeNotSatisfiable, 416));
        }
        let entity_len = length
            .unwrap_or(file_len - entity_start)
            .min(file_len - entity_start);

        let mut status = 200;
        let mut read_start = entity_start;
        let mut read_len = entity_len;
        if accept_ranges {
            if let Some(range) = self.header_str("range").map(|h| h.to_string()) {
                match parse_range(&range, entity_len) {
                    Some(Ok((start, end))) => {
                        status = 206;
                        read_start = entity_start + start;
                        read_len = end - start + 1;
                        if let Ok(value) = HeaderValue::from_str(&format!(
                            "bytes {}-{}/{}",
                            start, end, entity_len
                        )) {
                            headers.insert(hyper::header::CONTENT_RANGE, value);
                        }
                    }
                    Some(Err(())) => {
                        let mut range_headers = HeaderMap::new();
                        if let Ok(value) =
                            HeaderValue::from_str(&format!("bytes */{}", entity_len))
                        {
                            range_headers.insert(hyper::header::CONTENT_RANGE, value);
                        }
                        return self.stage("send_file", 416, range_headers, empty_body());
                    }
                    None => {}
                }
            }
        }

        headers.insert(hyper::header::CONTENT_LENGTH, HeaderValue::from(read_len));

        if self.is_head() {
            return self.stage("send_file", status, headers, empty_body());
        }

        let mut file = tokio::fs::File::open(&file_path)
            .await
            .map_err(SendError::from)?;
        if read_start > 0 {
            file.seek(std::io::SeekFrom::Start(read_start))
                .await
                .map_err(SendError::internal)?;
        }
        let reader = file.take(read_len);
        self.send_stream(status, headers, reader)
    }

    async fn file_not_found(&mut self, hook: Option<FileHook>) -> Result<StreamEnded, SendError> {
        match hook {
            Some(hook) => hook(self).await,
            None => self.send_empty(404, HeaderMap::new()),
        }
    }
}

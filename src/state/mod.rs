//! The per-request façade (`RequestState`).
//!
//! A `RequestState` is created by the router once a request has been parsed.
//! It combines every parsed input (URL, headers, cookies, params, body) with
//! the response writers, and is owned by the task dispatching the request.
//! Only that task may read the body or write the response.

pub mod body;
pub mod multipart;
pub mod send;
pub mod sse;

use std::sync::Arc;

use ahash::AHashMap;
use bytes::Bytes;
use hyper::header::{HeaderMap, HeaderValue, HOST};
use hyper::{Method, Version};

use crate::bus::EventBus;
use crate::encoding::{negotiate, Encoding};

pub use body::{BodyData, BodyFormat};
pub use send::{BodyWriter, CookieOptions, Flow, SameSite, StreamEnded};
pub use sse::SseHandle;

/// The wire protocol a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http1,
    Http2,
}

/// Parsed components of the prefix-stripped request URL.
#[derive(Debug, Clone, PartialEq)]
pub struct UrlInfo {
    /// Decoded-as-received path, always starting with `/`.
    pub path: String,
    /// Raw query string without the leading `?`, if any.
    pub query: Option<String>,
}

/// Session handle attached by an external auth collaborator.
pub trait UserSession: Send + Sync {
    fn is_authenticated(&self) -> bool {
        false
    }
    fn username(&self) -> Option<&str> {
        None
    }
}

/// Why a raw request could not become a `RequestState`.
///
/// These end the request immediately, without routing.
#[derive(Debug, PartialEq)]
pub(crate) enum ParseFailure {
    /// Raw URL is outside the configured path prefix.
    PrefixMismatch { prefix: String },
    /// Raw URL equals the prefix exactly; redirect to `prefix + "/"`.
    PrefixRedirect { location: String },
    /// The URL could not be parsed at all.
    BadUrl,
}

/// Per-request state: parsed inputs plus response plumbing.
pub struct RequestState {
    pub(crate) method: Method,
    pub(crate) protocol: Protocol,
    pub(crate) host: String,
    pub(crate) path_prefix: String,
    pub(crate) url_info: UrlInfo,
    pub(crate) headers: HeaderMap,
    pub(crate) cookies: AHashMap<String, Vec<String>>,
    pub(crate) path_params: AHashMap<String, String>,
    pub(crate) query_params: AHashMap<String, Vec<String>>,
    pub(crate) expect_secure: bool,
    pub(crate) body_format: BodyFormat,
    pub(crate) route_path: String,
    pub(crate) user: Option<Arc<dyn UserSession>>,

    pub(crate) body: Option<send::EngineBody>,
    pub(crate) data_buffer: Option<Bytes>,
    pub(crate) data: Option<BodyData>,
    pub(crate) body_limit: usize,

    pub(crate) encoding: Encoding,
    pub(crate) pending_headers: HeaderMap,
    pub(crate) headers_sent: Option<&'static str>,
    pub(crate) response: Option<send::StagedResponse>,
    pub(crate) bus: Arc<EventBus>,
}

impl RequestState {
    /// Normalises a raw hyper request into a state.
    ///
    /// Applies the path-prefix rules: a URL outside the prefix is refused, a
    /// URL equal to the prefix redirects to `prefix + "/"`, and everything
    /// else is stripped down to a prefix-relative URL starting with `/`.
    pub(crate) fn from_request(
        req: hyper::Request<send::EngineBody>,
        prefix: &str,
        expect_secure: bool,
        body_limit: usize,
        bus: Arc<EventBus>,
    ) -> Result<Self, ParseFailure> {
        let (parts, body) = req.into_parts();

        let protocol = match parts.version {
            Version::HTTP_2 => Protocol::Http2,
            _ => Protocol::Http1,
        };

        let raw_path = parts.uri.path().to_string();
        if raw_path.is_empty() || !raw_path.starts_with('/') {
            return Err(ParseFailure::BadUrl);
        }

        let path = if prefix.is_empty() {
            raw_path
        } else if raw_path == prefix {
            return Err(ParseFailure::PrefixRedirect {
                location: format!("{}/", prefix),
            });
        } else if let Some(rest) = raw_path.strip_prefix(&format!("{}/", prefix)) {
            format!("/{}", rest)
        } else {
            return Err(ParseFailure::PrefixMismatch {
                prefix: prefix.to_string(),
            });
        };

        let query = parts.uri.query().map(|q| q.to_string());
        let mut query_params: AHashMap<String, Vec<String>> = AHashMap::new();
        if let Some(q) = query.as_deref() {
            for (key, value) in url::form_urlencoded::parse(q.as_bytes()) {
                query_params
                    .entry(key.into_owned())
                    .or_default()
                    .push(value.into_owned());
            }
        }

        let mut headers = parts.headers;

        // HTTP/2 carries the authority in a pseudo-header; fold it back into
        // `host` so downstream code sees one shape for both protocols.
        let host = headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
            .or_else(|| parts.uri.authority().map(|a| a.to_string()))
            .unwrap_or_else(|| "localhost".to_string());
        if !headers.contains_key(HOST) {
            if let Ok(value) = HeaderValue::from_str(&host) {
                headers.insert(HOST, value);
            }
        }

        let mut cookies: AHashMap<String, Vec<String>> = AHashMap::new();
        for value in headers.get_all(hyper::header::COOKIE) {
            let Ok(raw) = value.to_str() else { continue };
            for piece in raw.split(';') {
                let Ok(parsed) = cookie::Cookie::parse(piece.trim()) else {
                    continue;
                };
                let decoded = urlencoding::decode(parsed.value())
                    .map(|cow| cow.into_owned())
                    .unwrap_or_else(|_| parsed.value().to_string());
                cookies
                    .entry(parsed.name().to_string())
                    .or_default()
                    .push(decoded);
            }
        }

        Ok(Self {
            method: parts.method,
            protocol,
            host,
            path_prefix: prefix.to_string(),
            url_info: UrlInfo { path, query },
            headers,
            cookies,
            path_params: AHashMap::new(),
            query_params,
            expect_secure,
            body_format: BodyFormat::Ignore,
            route_path: String::new(),
            user: None,
            body: Some(body),
            data_buffer: None,
            data: None,
            body_limit,
            encoding: Encoding::Identity,
            pending_headers: HeaderMap::new(),
            headers_sent: None,
            response: None,
            bus,
        })
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// The prefix-stripped URL: path plus query string as received.
    pub fn url(&self) -> String {
        match self.url_info.query.as_deref() {
            Some(q) => format!("{}?{}", self.url_info.path, q),
            None => self.url_info.path.clone(),
        }
    }

    pub fn url_info(&self) -> &UrlInfo {
        &self.url_info
    }

    pub fn path_prefix(&self) -> &str {
        &self.path_prefix
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// A single header value as a string, if present and valid UTF-8.
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn cookies(&self) -> &AHashMap<String, Vec<String>> {
        &self.cookies
    }

    /// The first value of a cookie.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .get(name)
            .and_then(|values| values.first())
            .map(|v| v.as_str())
    }

    pub fn path_params(&self) -> &AHashMap<String, String> {
        &self.path_params
    }

    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.path_params.get(name).map(|v| v.as_str())
    }

    pub fn query_params(&self) -> &AHashMap<String, Vec<String>> {
        &self.query_params
    }

    /// The first value of a query parameter.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query_params
            .get(name)
            .and_then(|values| values.first())
            .map(|v| v.as_str())
    }

    pub fn expect_secure(&self) -> bool {
        self.expect_secure
    }

    pub fn body_format(&self) -> BodyFormat {
        self.body_format
    }

    /// The matched route path, empty before dispatch reaches a route.
    pub fn route_path(&self) -> &str {
        &self.route_path
    }

    pub fn headers_sent(&self) -> bool {
        self.headers_sent.is_some()
    }

    /// The decoded body buffer, once a buffering body format prepared it.
    pub fn data_buffer(&self) -> Option<&Bytes> {
        self.data_buffer.as_ref()
    }

    /// The parsed body value, once a parsing body format prepared it.
    pub fn data(&self) -> Option<&BodyData> {
        self.data.as_ref()
    }

    pub fn user(&self) -> Option<&Arc<dyn UserSession>> {
        self.user.as_ref()
    }

    /// Attaches the session handle; called by auth collaborators from the
    /// `request.state` hook.
    pub fn set_user(&mut self, user: Arc<dyn UserSession>) {
        self.user = Some(user);
    }

    pub(crate) fn is_head(&self) -> bool {
        self.method == Method::HEAD
    }

    /// Negotiates a content encoding for this response against a whitelist
    /// in server-preference order, remembers it, and returns it.
    pub fn accepts_encoding(&mut self, whitelist: &[Encoding]) -> Encoding {
        let accept = self
            .headers
            .get(hyper::header::ACCEPT_ENCODING)
            .and_then(|v| v.to_str().ok());
        self.encoding = negotiate(accept, whitelist);
        self.encoding
    }

    /// The encoding chosen by the last [`accepts_encoding`] call.
    ///
    /// [`accepts_encoding`]: RequestState::accepts_encoding
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Sends 103 Early Hints. HTTP/2 only; a no-op on HTTP/1.
    ///
    /// hyper's server API cannot write informational responses yet, so the
    /// hint set is currently recorded in the trace log only. The protocol
    /// gate and signature are stable.
    pub fn write_early_hints(&self, hints: &[(&str, &str)]) {
        if self.protocol != Protocol::Http2 {
            return;
        }
        tracing::debug!(?hints, "early hints (not written: no 1xx support in server stack)");
    }

    pub(crate) fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    /// Takes the staged response out of the state once dispatch is done.
    pub(crate) fn take_response(&mut self) -> Option<send::StagedResponse> {
        self.response.take()
    }
}

impl std::fmt::Debug for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestState")
            .field("method", &self.method)
            .field("url", &self.url_info.path)
            .field("path_prefix", &self.path_prefix)
            .field("body_format", &self.body_format)
            .field("route_path", &self.route_path)
            .field("headers_sent", &self.headers_sent)
            .finish()
    }
}

/// Builds a state for unit tests without a live socket.
#[cfg(test)]
pub(crate) fn test_state(method: Method, path_and_query: &str) -> RequestState {
    test_state_with(method, path_and_query, &[], Bytes::new())
}

#[cfg(test)]
pub(crate) fn test_state_with(
    method: Method,
    path_and_query: &str,
    headers: &[(&str, &str)],
    body: Bytes,
) -> RequestState {
    let mut builder = hyper::Request::builder().method(method).uri(path_and_query);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let req = builder
        .body(send::full_body(body))
        .expect("test request build");
    RequestState::from_request(
        req,
        "",
        false,
        crate::config::DEFAULT_BODY_LIMIT,
        Arc::new(EventBus::new()),
    )
    .expect("test request parse")
}

//! Route tree nodes.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use ahash::AHashMap;
use hyper::Method;
use regex::Regex;

use crate::error::SendError;
use crate::state::body::IncomingBodyKind;
use crate::state::{BodyFormat, Flow, RequestState};

/// Future returned by a route handler, borrowing the state it serves.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<Flow, SendError>> + Send + 'a>>;

/// A handler attached to a route node.
///
/// Plain functions with the signature
/// `fn(&mut RequestState) -> HandlerFuture<'_>` implement this directly.
pub trait RouteHandler: Send + Sync {
    fn call<'a>(&'a self, state: &'a mut RequestState) -> HandlerFuture<'a>;
}

impl<F> RouteHandler for F
where
    F: for<'a> Fn(&'a mut RequestState) -> HandlerFuture<'a> + Send + Sync,
{
    fn call<'a>(&'a self, state: &'a mut RequestState) -> HandlerFuture<'a> {
        self(state)
    }
}

/// Renders a `SendError` thrown by a handler below the node carrying it.
pub trait RecoveryHandler: Send + Sync {
    fn call<'a>(&'a self, state: &'a mut RequestState, error: &'a SendError) -> HandlerFuture<'a>;
}

impl<F> RecoveryHandler for F
where
    F: for<'a> Fn(&'a mut RequestState, &'a SendError) -> HandlerFuture<'a> + Send + Sync,
{
    fn call<'a>(&'a self, state: &'a mut RequestState, error: &'a SendError) -> HandlerFuture<'a> {
        self(state, error)
    }
}

/// Declarative checks evaluated after a route matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityCheck {
    /// `X-Requested-With` must equal one of the tokens registered on the
    /// router.
    RequestedWithHeader,
}

/// How a node matches the remaining request path.
pub enum PathMatcher {
    /// Matches everything, consumes nothing. Only the root uses this.
    Root,
    /// Consumes exactly this literal; the consumed span must end at a
    /// segment boundary.
    Literal(String),
    /// Anchored regex that must consume the entire remaining path. Named
    /// captures become path parameters.
    Regex(Regex),
    /// Anchored regex consuming a prefix of the remaining path; children
    /// match the rest.
    RegexPrefix(Regex),
}

impl PathMatcher {
    /// Specificity class used for sibling tie-breaks:
    /// literal, then regex with captures, then open regex.
    pub(crate) fn specificity(&self) -> u8 {
        match self {
            PathMatcher::Root => 0,
            PathMatcher::Literal(_) => 0,
            PathMatcher::Regex(re) if re.capture_names().flatten().next().is_some() => 1,
            PathMatcher::Regex(_) | PathMatcher::RegexPrefix(_) => 2,
        }
    }

    /// Attempts to consume a prefix of `rest`.
    ///
    /// Returns the consumed length and the decoded named captures. Path
    /// parameters are decoded exactly here, and nowhere else.
    pub(crate) fn match_prefix(&self, rest: &str) -> Option<(usize, AHashMap<String, String>)> {
        match self {
            PathMatcher::Root => Some((0, AHashMap::new())),
            PathMatcher::Literal(literal) => {
                if !rest.starts_with(literal.as_str()) {
                    return None;
                }
                let consumed = literal.len();
                let boundary_ok = rest.len() == consumed
                    || rest.as_bytes().get(consumed) == Some(&b'/')
                    || literal.ends_with('/');
                if boundary_ok {
                    Some((consumed, AHashMap::new()))
                } else {
                    None
                }
            }
            PathMatcher::Regex(re) => {
                let captures = re.captures(rest)?;
                let full = captures.get(0)?;
                if full.start() != 0 || full.end() != rest.len() {
                    return None;
                }
                Some((full.end(), named_captures(re, &captures)))
            }
            PathMatcher::RegexPrefix(re) => {
                let captures = re.captures(rest)?;
                let full = captures.get(0)?;
                if full.start() != 0 {
                    return None;
                }
                Some((full.end(), named_captures(re, &captures)))
            }
        }
    }

    /// The label this matcher contributes to `route_path`.
    pub(crate) fn label(&self) -> String {
        match self {
            PathMatcher::Root => String::new(),
            PathMatcher::Literal(literal) => literal.clone(),
            PathMatcher::Regex(re) | PathMatcher::RegexPrefix(re) => re.as_str().to_string(),
        }
    }
}

fn named_captures(re: &Regex, captures: &regex::Captures<'_>) -> AHashMap<String, String> {
    let mut params = AHashMap::new();
    for name in re.capture_names().flatten() {
        if let Some(value) = captures.name(name) {
            let raw = value.as_str();
            let decoded = urlencoding::decode(raw)
                .map(|cow| cow.into_owned())
                .unwrap_or_else(|_| raw.to_string());
            params.insert(name.to_string(), decoded);
        }
    }
    params
}

impl std::fmt::Debug for PathMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathMatcher::Root => write!(f, "Root"),
            PathMatcher::Literal(literal) => write!(f, "Literal({:?})", literal),
            PathMatcher::Regex(re) => write!(f, "Regex({:?})", re.as_str()),
            PathMatcher::RegexPrefix(re) => write!(f, "RegexPrefix({:?})", re.as_str()),
        }
    }
}

/// One node of the route tree.
///
/// The tree is built at startup and immutable once the server starts
/// serving; read-only access from any task is safe.
pub struct RouteNode {
    pub(crate) matcher: PathMatcher,
    /// Allowed methods; empty means every method.
    pub(crate) methods: Vec<Method>,
    /// Accepted body formats; empty means `Ignore`.
    pub(crate) body_formats: Vec<BodyFormat>,
    /// A deny-final node contributes captures but can never terminate a
    /// match.
    pub(crate) deny_final: bool,
    pub(crate) security_checks: Vec<SecurityCheck>,
    pub(crate) children: Vec<RouteNode>,
    pub(crate) handlers: Vec<Arc<dyn RouteHandler>>,
    pub(crate) recovery: Option<Arc<dyn RecoveryHandler>>,
}

impl RouteNode {
    /// The match-everything root. The engine creates exactly one of these.
    pub(crate) fn root() -> Self {
        Self::with_matcher(PathMatcher::Root)
    }

    fn with_matcher(matcher: PathMatcher) -> Self {
        Self {
            matcher,
            methods: Vec::new(),
            body_formats: Vec::new(),
            deny_final: false,
            security_checks: Vec::new(),
            children: Vec::new(),
            handlers: Vec::new(),
            recovery: None,
        }
    }

    /// A node matching a fixed path segment sequence like `/admin`.
    pub fn literal(path: &str) -> Self {
        Self::with_matcher(PathMatcher::Literal(path.to_string()))
    }

    /// A node matching an anchored regex over the whole remaining path.
    /// Named captures become path parameters.
    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self::with_matcher(PathMatcher::Regex(Regex::new(pattern)?)))
    }

    /// A node whose regex consumes only a prefix; children match the rest.
    pub fn regex_prefix(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self::with_matcher(PathMatcher::RegexPrefix(Regex::new(
            pattern,
        )?)))
    }

    pub fn methods(mut self, methods: &[Method]) -> Self {
        self.methods = methods.to_vec();
        self
    }

    pub fn body_format(mut self, format: BodyFormat) -> Self {
        self.body_formats.push(format);
        self
    }

    /// Marks this node as unable to terminate a match.
    pub fn deny_final(mut self) -> Self {
        self.deny_final = true;
        self
    }

    pub fn security_check(mut self, check: SecurityCheck) -> Self {
        self.security_checks.push(check);
        self
    }

    /// Appends a handler. Handlers along a matched path run in order, root
    /// first, until one ends the stream.
    pub fn handler(mut self, handler: impl RouteHandler + 'static) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Sets the recovery handler rendering uncaught `SendError`s below this
    /// node.
    pub fn recovery(mut self, handler: impl RecoveryHandler + 'static) -> Self {
        self.recovery = Some(Arc::new(handler));
        self
    }

    /// Appends a child, keeping registration order.
    pub fn child(mut self, child: RouteNode) -> Self {
        self.children.push(child);
        self
    }

    /// Appends a child on a mutable node; used by registration helpers.
    pub fn add_child(&mut self, child: RouteNode) -> &mut RouteNode {
        self.children.push(child);
        self.children.last_mut().expect("just pushed")
    }

    pub(crate) fn method_allowed(&self, method: &Method) -> bool {
        self.methods.is_empty() || self.methods.contains(method)
    }

    /// Picks the body format this node will use for a request, or `None`
    /// when none of its declared formats can take the incoming body.
    ///
    /// An empty declaration means the body is ignored. Bodyless methods get
    /// the first declared format so GET routes can share a node with their
    /// mutating siblings.
    pub(crate) fn negotiate_body(
        &self,
        method: &Method,
        kind: IncomingBodyKind,
    ) -> Option<BodyFormat> {
        if self.body_formats.is_empty() {
            return Some(BodyFormat::Ignore);
        }
        if *method == Method::GET || *method == Method::HEAD || *method == Method::OPTIONS {
            return self.body_formats.first().copied();
        }
        self.body_formats.iter().copied().find(|f| f.accepts(kind))
    }
}

impl std::fmt::Debug for RouteNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteNode")
            .field("matcher", &self.matcher)
            .field("methods", &self.methods)
            .field("deny_final", &self.deny_final)
            .field("children", &self.children.len())
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

//! The route tree and request dispatch.
//!
//! Dispatch phases: parse, middleware hook, match, body preparation,
//! security checks, handle, recovery, fallback. Parse failures end the
//! request immediately without routing.

pub mod node;
pub mod validation;

use std::sync::Arc;

use ahash::AHashMap;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::header::HeaderValue;
use hyper::{Method, Request, Response, StatusCode};

use crate::bus::{EventBus, RequestPhase};
use crate::error::{ErrorReason, SendError};
use crate::state::body::{incoming_body_kind, IncomingBodyKind};
use crate::state::send::{empty_body, full_body, EngineBody};
use crate::state::{BodyFormat, Flow, ParseFailure, RequestState};

pub use node::{
    HandlerFuture, PathMatcher, RecoveryHandler, RouteHandler, RouteNode, SecurityCheck,
};

/// Per-listener knobs the router needs at dispatch time.
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    pub prefix: String,
    pub expect_secure: bool,
    pub body_limit: usize,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            expect_secure: false,
            body_limit: crate::config::DEFAULT_BODY_LIMIT,
        }
    }
}

/// The route tree plus dispatch machinery.
///
/// Built at startup; immutable while serving.
pub struct Router {
    root: RouteNode,
    bus: Arc<EventBus>,
    requested_with_tokens: Vec<String>,
}

type Trail<'a> = Vec<(&'a RouteNode, AHashMap<String, String>)>;

impl Router {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            root: RouteNode::root(),
            bus,
            // The default token accepted by the CSRF check; embedders add
            // their own via `register_requested_with_token`.
            requested_with_tokens: vec!["fetch".to_string()],
        }
    }

    /// The root node, for route registration during startup.
    pub fn root_mut(&mut self) -> &mut RouteNode {
        &mut self.root
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Adds an accepted `X-Requested-With` token.
    pub fn register_requested_with_token(&mut self, token: impl Into<String>) {
        self.requested_with_tokens.push(token.into());
    }

    /// Serves one request end to end, producing the response for hyper.
    pub async fn handle<B>(&self, req: Request<B>, opts: &ListenerOptions) -> Response<EngineBody>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let req = req.map(|body| {
            body.map_err(|err| {
                let err: Box<dyn std::error::Error + Send + Sync> = err.into();
                std::io::Error::other(err)
            })
            .boxed_unsync()
        });
        let mut state = match RequestState::from_request(
            req,
            &opts.prefix,
            opts.expect_secure,
            opts.body_limit,
            Arc::clone(&self.bus),
        ) {
            Ok(state) => state,
            Err(ParseFailure::PrefixRedirect { location }) => {
                return redirect_response(&location);
            }
            Err(ParseFailure::PrefixMismatch { prefix }) => {
                return plain_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &format!(
                        "The server is setup with a path prefix {}, but this request is outside of that prefix.",
                        prefix
                    ),
                );
            }
            Err(ParseFailure::BadUrl) => {
                return plain_response(StatusCode::BAD_REQUEST, "Bad Request");
            }
        };

        if let Err(err) = self.dispatch(&mut state).await {
            self.render_error(&mut state, err).await;
        }

        match state.take_response() {
            Some(response) => response,
            None => {
                // A handler claimed completion without staging a response.
                let err = SendError::request_dropped(state.route_path());
                tracing::error!(route = %state.route_path(), "no response staged after dispatch");
                json_error_response(&err)
            }
        }
    }

    async fn dispatch(&self, state: &mut RequestState) -> Result<(), SendError> {
        for phase in [
            RequestPhase::Streamer,
            RequestPhase::State,
            RequestPhase::Middleware,
        ] {
            if self.run_hooks(phase, state).await? {
                return Ok(());
            }
        }

        let body_kind = incoming_body_kind(state.header_str("content-type"));
        let mut wrong_method = false;
        let trail = find_match(
            &self.root,
            state.method(),
            &state.url_info().path.clone(),
            body_kind,
            &mut wrong_method,
        );

        let Some(trail) = trail else {
            if self.run_hooks(RequestPhase::Fallback, state).await? {
                return Ok(());
            }
            return Err(if wrong_method {
                SendError::new(ErrorReason::MethodNotAllowed, 405)
            } else {
                SendError::not_found()
            });
        };

        // Merge captures root to leaf; the innermost value wins a name.
        let mut params = AHashMap::new();
        let mut route_path = String::new();
        for (node, captures) in &trail {
            for (name, value) in captures {
                params.insert(name.clone(), value.clone());
            }
            route_path.push_str(&node.matcher.label());
        }
        state.path_params = params;
        state.route_path = route_path;
        tracing::trace!(route = %state.route_path, method = %state.method(), "route matched");

        let terminal = trail.last().map(|(node, _)| *node).expect("non-empty trail");
        let format = terminal
            .negotiate_body(state.method(), body_kind)
            .unwrap_or(BodyFormat::Ignore);
        state.prepare_body(format).await?;

        for (node, _) in &trail {
            for check in &node.security_checks {
                self.run_security_check(*check, state)?;
            }
        }

        if self.run_hooks(RequestPhase::Handle, state).await? {
            return Ok(());
        }

        let handlers: Vec<Arc<dyn RouteHandler>> = trail
            .iter()
            .flat_map(|(node, _)| node.handlers.iter().cloned())
            .collect();
        let recovery = trail
            .iter()
            .rev()
            .find_map(|(node, _)| node.recovery.clone());

        for handler in handlers {
            match handler.call(state).await {
                Ok(Flow::Done(_)) => return Ok(()),
                Ok(Flow::Continue) => continue,
                Err(err) => return self.recover(state, recovery.as_deref(), err).await,
            }
        }

        if state.headers_sent() {
            Ok(())
        } else {
            tracing::error!(
                route = %state.route_path(),
                "handler chain completed without ending the stream"
            );
            Err(SendError::request_dropped(state.route_path()))
        }
    }

    /// Runs the hooks of a phase serially. Returns true when one of them
    /// ended the stream.
    async fn run_hooks(
        &self,
        phase: RequestPhase,
        state: &mut RequestState,
    ) -> Result<bool, SendError> {
        for hook in self.bus.request_hooks(phase) {
            if let Flow::Done(_) = hook(state).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn run_security_check(
        &self,
        check: SecurityCheck,
        state: &RequestState,
    ) -> Result<(), SendError> {
        match check {
            SecurityCheck::RequestedWithHeader => {
                let supplied = state.header_str("x-requested-with").unwrap_or_default();
                if self
                    .requested_with_tokens
                    .iter()
                    .any(|token| token == supplied)
                {
                    Ok(())
                } else {
                    Err(SendError::forbidden())
                }
            }
        }
    }

    /// Renders an uncaught handler error via the recovery handler, falling
    /// back to the default rendering.
    async fn recover(
        &self,
        state: &mut RequestState,
        recovery: Option<&dyn RecoveryHandler>,
        err: SendError,
    ) -> Result<(), SendError> {
        if state.headers_sent() {
            tracing::error!(route = %state.route_path(), error = %err, "error after headers were sent");
            return Ok(());
        }
        if let Some(recovery) = recovery {
            match recovery.call(state, &err).await {
                Ok(Flow::Done(_)) => return Ok(()),
                Ok(Flow::Continue) => {}
                Err(recovery_err) => {
                    tracing::error!(error = %recovery_err, "recovery handler failed");
                }
            }
        }
        Err(err)
    }

    /// Default rendering for an error that escaped dispatch.
    async fn render_error(&self, state: &mut RequestState, err: SendError) {
        if state.headers_sent() {
            tracing::error!(route = %state.route_path(), error = %err, "error after headers were sent");
            return;
        }
        tracing::debug!(route = %state.route_path(), error = %err, "rendering error response");
        let status = err.status;
        let body = err.to_json();
        if let Err(render_err) = state.send_json(status, &body).await {
            tracing::error!(error = %render_err, "failed to render error response");
        }
    }
}

fn find_match<'a>(
    root: &'a RouteNode,
    method: &Method,
    path: &str,
    body_kind: IncomingBodyKind,
    wrong_method: &mut bool,
) -> Option<Trail<'a>> {
    let mut trail: Trail<'a> = vec![(root, AHashMap::new())];
    if descend(root, path, method, body_kind, &mut trail, wrong_method) {
        Some(trail)
    } else {
        None
    }
}

/// Depth-first walk. Children are tried most-specific class first (literal,
/// regex with captures, open regex), registration order within a class.
fn descend<'a>(
    node: &'a RouteNode,
    rest: &str,
    method: &Method,
    body_kind: IncomingBodyKind,
    trail: &mut Trail<'a>,
    wrong_method: &mut bool,
) -> bool {
    if rest.is_empty() && !node.deny_final {
        if !node.method_allowed(method) {
            *wrong_method = true;
        } else if node.negotiate_body(method, body_kind).is_some() {
            return true;
        }
    }

    let mut order: Vec<usize> = (0..node.children.len()).collect();
    order.sort_by_key(|&i| node.children[i].matcher.specificity());
    for i in order {
        let child = &node.children[i];
        if let Some((consumed, captures)) = child.matcher.match_prefix(rest) {
            trail.push((child, captures));
            if descend(child, &rest[consumed..], method, body_kind, trail, wrong_method) {
                return true;
            }
            trail.pop();
        }
    }
    false
}

pub(crate) fn plain_response(status: StatusCode, text: &str) -> Response<EngineBody> {
    let mut response = Response::new(full_body(Bytes::copy_from_slice(text.as_bytes())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

pub(crate) fn redirect_response(location: &str) -> Response<EngineBody> {
    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::FOUND;
    if let Ok(value) = HeaderValue::from_str(location) {
        response.headers_mut().insert(hyper::header::LOCATION, value);
    }
    response
}

pub(crate) fn json_error_response(err: &SendError) -> Response<EngineBody> {
    let body = serde_json::to_vec(&err.to_json()).unwrap_or_default();
    let mut response = Response::new(full_body(Bytes::from(body)));
    *response.status_mut() =
        StatusCode::from_u16(err.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json; charset=utf-8"),
    );
    response
}

//! Server binary: assembles configuration, routes, and the listener set.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use hyper::Method;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;
use validator::Validate;

use multiwiki::bus::{EventBus, HookFuture, RequestPhase};
use multiwiki::error::{ErrorReason, SendError};
use multiwiki::router::validation::{EmptyParams, TypedInput, TypedRouteSpec};
use multiwiki::router::{HandlerFuture, PathMatcher, RouteNode, Router};
use multiwiki::state::{BodyFormat, Flow, RequestState};
use multiwiki::static_files::SendFileOptions;
use multiwiki::{register_typed_routes, EngineConfig, Server};

#[tokio::main]
async fn main() {
    let config = EngineConfig::from_env();

    let default_level = if config.debug { "multiwiki=trace" } else { "multiwiki=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let bus = Arc::new(EventBus::new());
    bus.on_request(RequestPhase::Middleware, Arc::new(security_headers));

    let mut router = Router::new(Arc::clone(&bus));
    build_routes(&mut router);

    let server = Server::new(config, router);
    if let Err(err) = server.run().await {
        tracing::error!(error = %err, "server failed");
        std::process::exit(1);
    }
}

fn build_routes(router: &mut Router) {
    let root = router.root_mut();

    root.add_child(RouteNode::literal("/").methods(&[Method::GET]).handler(home));

    root.add_child(
        RouteNode::regex("^/wiki/(?<recipe>[^/]+)$")
            .expect("wiki route pattern")
            .methods(&[Method::GET])
            .handler(wiki_page),
    );

    root.add_child(
        RouteNode::regex("^/static/(?<file>.+)$")
            .expect("static route pattern")
            .methods(&[Method::GET, Method::HEAD])
            .handler(static_file),
    );

    root.add_child(
        RouteNode::literal("/events")
            .methods(&[Method::GET])
            .handler(events_stream),
    );

    let admin = root.add_child(RouteNode::literal("/admin").deny_final());
    register_typed_routes!(admin, UserCreateRoute);
}

/// Adds the baseline security headers on every request.
fn security_headers(state: &mut RequestState) -> HookFuture<'_> {
    Box::pin(async move {
        state.set_header("x-content-type-options", "nosniff");
        Ok(Flow::Continue)
    })
}

fn home(state: &mut RequestState) -> HandlerFuture<'_> {
    Box::pin(async move {
        let ended = state.send_simple(200, "multiwiki is running\n").await?;
        Ok(Flow::Done(ended))
    })
}

/// Placeholder wiki renderer; the data model lives behind this route.
fn wiki_page(state: &mut RequestState) -> HandlerFuture<'_> {
    Box::pin(async move {
        let recipe = state.path_param("recipe").unwrap_or_default().to_string();
        if recipe.is_empty() {
            return Err(SendError::new(ErrorReason::RecipeNotFound, 404)
                .with_details(serde_json::json!({ "recipe": recipe })));
        }
        let ended = state
            .send_json(200, &serde_json::json!({ "recipe": recipe }))
            .await?;
        Ok(Flow::Done(ended))
    })
}

fn static_file(state: &mut RequestState) -> HandlerFuture<'_> {
    Box::pin(async move {
        let file = state.path_param("file").unwrap_or_default().to_string();
        state.accepts_encoding(&[
            multiwiki::encoding::Encoding::Brotli,
            multiwiki::encoding::Encoding::Gzip,
            multiwiki::encoding::Encoding::Deflate,
        ]);
        let ended = state
            .send_file(SendFileOptions {
                max_age: Some(86400),
                ..SendFileOptions::new("./public", file)
            })
            .await?;
        Ok(Flow::Done(ended))
    })
}

/// Pushes a heartbeat event stream until the client or the server goes away.
fn events_stream(state: &mut RequestState) -> HandlerFuture<'_> {
    Box::pin(async move {
        let (mut sse, ended) = state.send_sse(Some(5000))?;
        tokio::spawn(async move {
            let mut seq: u64 = 0;
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(15)).await;
                seq += 1;
                let id = seq.to_string();
                if sse
                    .emit_event("heartbeat", &serde_json::json!({ "seq": seq }), Some(&id))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
        Ok(Flow::Done(ended))
    })
}

#[derive(Debug, Deserialize, Validate)]
struct UserCreateBody {
    #[validate(length(min = 1, max = 64))]
    username: String,
}

#[derive(Debug, Serialize, Validate)]
struct UserCreateReply {
    username: String,
    created: bool,
}

/// `POST /admin/user_create`: JSON body, CSRF token required.
struct UserCreateRoute;

impl TypedRouteSpec for UserCreateRoute {
    type PathParams = EmptyParams;
    type QueryParams = EmptyParams;
    type Body = UserCreateBody;
    type Output = UserCreateReply;

    fn method() -> Method {
        Method::POST
    }

    fn matcher() -> PathMatcher {
        PathMatcher::Literal("/user_create".to_string())
    }

    fn body_format() -> BodyFormat {
        BodyFormat::Json
    }

    fn handle<'a>(
        _state: &'a mut RequestState,
        input: TypedInput<Self>,
    ) -> Pin<Box<dyn Future<Output = Result<Self::Output, SendError>> + Send + 'a>> {
        Box::pin(async move {
            let body = input.body.ok_or_else(|| {
                SendError::bad_request(serde_json::Value::String("body required".into()))
            })?;
            Ok(UserCreateReply {
                username: body.username,
                created: true,
            })
        })
    }
}

#[cfg(test)]
mod router_tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use http_body_util::{BodyExt, Full};
    use hyper::header::HeaderMap;
    use hyper::{Method, Request, StatusCode};

    use crate::bus::{EventBus, HookFuture, RequestPhase};
    use crate::router::{
        HandlerFuture, ListenerOptions, RouteNode, Router, SecurityCheck,
    };
    use crate::state::{BodyData, BodyFormat, Flow, RequestState};

    fn home(state: &mut RequestState) -> HandlerFuture<'_> {
        Box::pin(async move { Ok(Flow::Done(state.send_simple(200, "home").await?)) })
    }

    fn echo_name(state: &mut RequestState) -> HandlerFuture<'_> {
        Box::pin(async move {
            let name = state.path_param("name").unwrap_or_default().to_string();
            Ok(Flow::Done(state.send_simple(200, &name).await?))
        })
    }

    fn special(state: &mut RequestState) -> HandlerFuture<'_> {
        Box::pin(async move { Ok(Flow::Done(state.send_simple(200, "special").await?)) })
    }

    fn echo_json(state: &mut RequestState) -> HandlerFuture<'_> {
        Box::pin(async move {
            let value = match state.data() {
                Some(BodyData::Json(value)) => value.clone(),
                _ => serde_json::Value::Null,
            };
            Ok(Flow::Done(state.send_json(200, &value).await?))
        })
    }

    fn drop_handler(_state: &mut RequestState) -> HandlerFuture<'_> {
        Box::pin(async move { Ok(Flow::Continue) })
    }

    fn guarded_ok(state: &mut RequestState) -> HandlerFuture<'_> {
        Box::pin(async move { Ok(Flow::Done(state.send_simple(200, "allowed").await?)) })
    }

    fn build_router() -> Router {
        let mut router = Router::new(Arc::new(EventBus::new()));
        let root = router.root_mut();

        root.add_child(RouteNode::literal("/").methods(&[Method::GET]).handler(home));
        // Registration order puts the open regex first; the literal sibling
        // must still win on specificity.
        root.add_child(
            RouteNode::regex("^/files/(?<name>.+)$")
                .unwrap()
                .methods(&[Method::GET])
                .handler(echo_name),
        );
        root.add_child(
            RouteNode::literal("/files/special")
                .methods(&[Method::GET])
                .handler(special),
        );
        root.add_child(
            RouteNode::literal("/echo")
                .methods(&[Method::POST])
                .body_format(BodyFormat::Json)
                .handler(echo_json),
        );
        root.add_child(
            RouteNode::literal("/drop")
                .methods(&[Method::GET])
                .handler(drop_handler),
        );
        root.add_child(
            RouteNode::literal("/guarded")
                .methods(&[Method::POST])
                .security_check(SecurityCheck::RequestedWithHeader)
                .handler(guarded_ok),
        );
        root.add_child(
            RouteNode::regex_prefix("^/bags/(?<name>[^/]+)")
                .unwrap()
                .deny_final()
                .child(
                    RouteNode::regex("^/tiddlers/(?<name>[^/]+)$")
                        .unwrap()
                        .methods(&[Method::GET])
                        .handler(echo_name),
                ),
        );
        router
    }

    fn get(uri: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    async fn drive(
        router: &Router,
        req: Request<Full<Bytes>>,
        opts: &ListenerOptions,
    ) -> (StatusCode, HeaderMap, Bytes) {
        let response = router.handle(req, opts).await;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, headers, body)
    }

    #[tokio::test]
    async fn test_prefix_exact_redirects_to_prefix_slash() {
        let router = build_router();
        let opts = ListenerOptions {
            prefix: "/prefix".to_string(),
            ..Default::default()
        };
        let (status, headers, _) = drive(&router, get("/prefix"), &opts).await;
        assert_eq!(status, StatusCode::FOUND);
        assert_eq!(headers["location"], "/prefix/");
    }

    #[tokio::test]
    async fn test_request_outside_prefix_refused() {
        let router = build_router();
        let opts = ListenerOptions {
            prefix: "/prefix".to_string(),
            ..Default::default()
        };
        let (status, _, body) = drive(&router, get("/other"), &opts).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            &body[..],
            b"The server is setup with a path prefix /prefix, but this request is outside of that prefix.".as_slice()
        );
    }

    #[tokio::test]
    async fn test_request_inside_prefix_routed() {
        let router = build_router();
        let opts = ListenerOptions {
            prefix: "/prefix".to_string(),
            ..Default::default()
        };
        let (status, _, body) = drive(&router, get("/prefix/"), &opts).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"home");
    }

    #[tokio::test]
    async fn test_regex_capture_decoded_once() {
        let router = build_router();
        let (status, _, body) =
            drive(&router, get("/files/a%2Fb.txt"), &ListenerOptions::default()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"a/b.txt");
    }

    #[tokio::test]
    async fn test_literal_beats_open_regex() {
        let router = build_router();
        let (_, _, body) =
            drive(&router, get("/files/special"), &ListenerOptions::default()).await;
        assert_eq!(&body[..], b"special");
    }

    #[tokio::test]
    async fn test_innermost_capture_wins() {
        let router = build_router();
        let (status, _, body) = drive(
            &router,
            get("/bags/outer/tiddlers/inner"),
            &ListenerOptions::default(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"inner");
    }

    #[tokio::test]
    async fn test_deny_final_node_cannot_terminate() {
        let router = build_router();
        let (status, _, _) =
            drive(&router, get("/bags/outer"), &ListenerOptions::default()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unmatched_path_is_404() {
        let router = build_router();
        let (status, _, body) =
            drive(&router, get("/nowhere"), &ListenerOptions::default()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["reason"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_wrong_method_is_405() {
        let router = build_router();
        let (status, _, _) = drive(&router, get("/echo"), &ListenerOptions::default()).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_json_body_prepared_for_handler() {
        let router = build_router();
        let req = Request::builder()
            .method(Method::POST)
            .uri("/echo")
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from_static(br#"{"title":"Home"}"#)))
            .unwrap();
        let (status, _, body) = drive(&router, req, &ListenerOptions::default()).await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["title"], "Home");
    }

    #[tokio::test]
    async fn test_malformed_json_is_400() {
        let router = build_router();
        let req = Request::builder()
            .method(Method::POST)
            .uri("/echo")
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from_static(b"{not json")))
            .unwrap();
        let (status, _, body) = drive(&router, req, &ListenerOptions::default()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["reason"], "BAD_REQUEST");
    }

    #[tokio::test]
    async fn test_body_over_limit_is_413() {
        let router = build_router();
        let opts = ListenerOptions {
            body_limit: 8,
            ..Default::default()
        };
        let req = Request::builder()
            .method(Method::POST)
            .uri("/echo")
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(vec![b'a'; 64])))
            .unwrap();
        let (status, _, _) = drive(&router, req, &opts).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_missing_requested_with_header_is_403() {
        let router = build_router();
        let req = Request::builder()
            .method(Method::POST)
            .uri("/guarded")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let (status, _, _) = drive(&router, req, &ListenerOptions::default()).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_registered_requested_with_token_passes() {
        let router = build_router();
        let req = Request::builder()
            .method(Method::POST)
            .uri("/guarded")
            .header("x-requested-with", "fetch")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let (status, _, body) = drive(&router, req, &ListenerOptions::default()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"allowed");
    }

    #[tokio::test]
    async fn test_handler_not_ending_stream_is_request_dropped() {
        let router = build_router();
        let (status, _, body) = drive(&router, get("/drop"), &ListenerOptions::default()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["reason"], "REQUEST_DROPPED");
    }

    #[tokio::test]
    async fn test_middleware_hook_short_circuits() {
        fn teapot(state: &mut RequestState) -> HookFuture<'_> {
            Box::pin(async move {
                Ok(Flow::Done(state.send_simple(418, "teapot").await?))
            })
        }

        let bus = Arc::new(EventBus::new());
        bus.on_request(RequestPhase::Middleware, Arc::new(teapot));
        let router = Router::new(bus);
        let (status, _, body) = drive(&router, get("/"), &ListenerOptions::default()).await;
        assert_eq!(status.as_u16(), 418);
        assert_eq!(&body[..], b"teapot");
    }

    #[tokio::test]
    async fn test_fallback_hook_replaces_404() {
        fn custom_fallback(state: &mut RequestState) -> HookFuture<'_> {
            Box::pin(async move {
                Ok(Flow::Done(state.send_simple(200, "fallback page").await?))
            })
        }

        let bus = Arc::new(EventBus::new());
        bus.on_request(RequestPhase::Fallback, Arc::new(custom_fallback));
        let router = Router::new(bus);
        let (status, _, body) =
            drive(&router, get("/missing"), &ListenerOptions::default()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"fallback page");
    }

    #[tokio::test]
    async fn test_recovery_handler_renders_error() {
        use crate::error::{ErrorReason, SendError};

        fn failing(_state: &mut RequestState) -> HandlerFuture<'_> {
            Box::pin(async move {
                Err(SendError::new(ErrorReason::RecipeNotFound, 404))
            })
        }

        fn render<'a>(
            state: &'a mut RequestState,
            error: &'a SendError,
        ) -> HandlerFuture<'a> {
            Box::pin(async move {
                let text = format!("recovered: {}", error.reason);
                Ok(Flow::Done(state.send_simple(error.status, &text).await?))
            })
        }

        let mut router = Router::new(Arc::new(EventBus::new()));
        router.root_mut().add_child(
            RouteNode::literal("/recipes")
                .methods(&[Method::GET])
                .recovery(render)
                .handler(failing),
        );

        let (status, _, body) =
            drive(&router, get("/recipes"), &ListenerOptions::default()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(&body[..], b"recovered: RECIPE_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_handlers_along_path_run_in_order() {
        fn tag_then_continue(state: &mut RequestState) -> HandlerFuture<'_> {
            Box::pin(async move {
                state.set_header("x-seen-by", "outer");
                Ok(Flow::Continue)
            })
        }

        let mut router = Router::new(Arc::new(EventBus::new()));
        router.root_mut().add_child(
            RouteNode::literal("/nested")
                .handler(tag_then_continue)
                .child(
                    RouteNode::literal("/page")
                        .methods(&[Method::GET])
                        .handler(home),
                ),
        );

        let (status, headers, body) =
            drive(&router, get("/nested/page"), &ListenerOptions::default()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["x-seen-by"], "outer");
        assert_eq!(&body[..], b"home");
    }
}

//! Per-connection serving.
//!
//! Every accepted stream is served by the hyper-util auto builder, which
//! negotiates HTTP/1.1 (keep-alive) or HTTP/2 on the same port.

use std::convert::Infallible;
use std::sync::Arc;

use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;

use crate::router::{ListenerOptions, Router};

pub(crate) async fn serve_connection<I>(io: I, router: Arc<Router>, opts: Arc<ListenerOptions>)
where
    I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let router = Arc::clone(&router);
        let opts = Arc::clone(&opts);
        async move { Ok::<_, Infallible>(router.handle(req, &opts).await) }
    });

    let mut builder = Builder::new(TokioExecutor::new());
    builder.http1().keep_alive(true);

    if let Err(err) = builder
        .serve_connection_with_upgrades(TokioIo::new(io), service)
        .await
    {
        tracing::debug!(error = %err, "connection ended with error");
    }
}

/// Serves a cleartext listener whose only job is redirecting to the HTTPS
/// origin.
pub(crate) async fn serve_redirect_connection<I>(io: I, target_origin: Arc<String>)
where
    I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
        let origin = Arc::clone(&target_origin);
        async move {
            let location = format!(
                "{}{}",
                origin,
                req.uri()
                    .path_and_query()
                    .map(|pq| pq.as_str())
                    .unwrap_or("/")
            );
            Ok::<_, Infallible>(crate::router::redirect_response(&location))
        }
    });

    let mut builder = Builder::new(TokioExecutor::new());
    builder.http1().keep_alive(true);

    if let Err(err) = builder
        .serve_connection_with_upgrades(TokioIo::new(io), service)
        .await
    {
        tracing::debug!(error = %err, "redirect connection ended with error");
    }
}

//! The listener set.
//!
//! One socket per configured endpoint. Each listener subscribes to the
//! `exit` event, stops accepting when it fires, and closes its socket
//! exactly once. In-flight connections get up to five seconds to finish.

mod conn;
mod tls;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_rustls::TlsAcceptor;

use crate::bus::{events, EventBus};
use crate::config::{EngineConfig, ListenerConfig};
use crate::error::SendError;
use crate::router::{ListenerOptions, Router};

/// How long in-flight connections may keep running after `exit`.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Exit code for fatal bind errors (EACCES, EADDRINUSE).
const EXIT_CODE_BIND: i32 = 4;

struct BoundListener {
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    opts: Arc<ListenerOptions>,
    redirect_origin: Option<Arc<String>>,
}

/// Tracks live connections so shutdown can drain them.
#[derive(Clone)]
struct InFlight {
    count: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

impl InFlight {
    fn new() -> Self {
        Self {
            count: Arc::new(AtomicUsize::new(0)),
            notify: Arc::new(Notify::new()),
        }
    }

    fn enter(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    async fn drain(&self) {
        loop {
            // Register interest before checking, so a leave() between the
            // check and the await cannot be missed.
            let notified = self.notify.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }
    }
}

/// Owns the listener set and the serve/shutdown lifecycle.
pub struct Server {
    config: EngineConfig,
    router: Arc<Router>,
    bus: Arc<EventBus>,
}

impl Server {
    pub fn new(config: EngineConfig, router: Router) -> Self {
        let bus = Arc::clone(router.bus());
        Self {
            config,
            router: Arc::new(router),
            bus,
        }
    }

    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    /// Binds every configured listener and serves until `exit` fires.
    ///
    /// Ctrl-C emits `exit`. `EACCES` and `EADDRINUSE` terminate the process
    /// with exit code 4 after a diagnostic; other bind errors propagate.
    pub async fn run(self) -> Result<(), SendError> {
        let mut bound = Vec::new();
        for listener_config in &self.config.listeners {
            if let Err(message) = listener_config.validate() {
                return Err(SendError::internal(message));
            }
            bound.push(self.bind(listener_config).await?);
            if let Some(redirect) = self.bind_redirect(listener_config).await? {
                bound.push(redirect);
            }
        }

        let addresses: Vec<String> = bound
            .iter()
            .filter_map(|b| b.listener.local_addr().ok())
            .map(|a| a.to_string())
            .collect();
        tracing::info!(?addresses, "listening");
        self.bus
            .emit_async(
                events::LISTEN_ROUTER_INIT,
                serde_json::json!({ "addresses": addresses }),
            )
            .await
            .ok();

        let in_flight = InFlight::new();
        let mut accept_tasks = Vec::new();
        for listener in bound {
            accept_tasks.push(tokio::spawn(accept_loop(
                listener,
                Arc::clone(&self.router),
                Arc::clone(&self.bus),
                in_flight.clone(),
            )));
        }

        let mut exit = self.bus.subscribe_exit();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received, shutting down");
                self.bus.emit_async(events::EXIT, serde_json::Value::Null).await.ok();
            }
            _ = exit.recv() => {}
        }

        for task in accept_tasks {
            let _ = task.await;
        }
        if tokio::time::timeout(DRAIN_TIMEOUT, in_flight.drain())
            .await
            .is_err()
        {
            tracing::warn!("shutdown drain timed out; dropping remaining connections");
        }
        Ok(())
    }

    async fn bind(&self, config: &ListenerConfig) -> Result<BoundListener, SendError> {
        let address = format!("{}:{}", config.host(), config.parse_port());
        let listener = match TcpListener::bind(&address).await {
            Ok(listener) => listener,
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::AddrInUse | std::io::ErrorKind::PermissionDenied
                ) =>
            {
                tracing::error!(%address, error = %err, "fatal listen error");
                std::process::exit(EXIT_CODE_BIND);
            }
            Err(err) => return Err(SendError::internal(format!("bind {}: {}", address, err))),
        };

        let acceptor = if config.secure {
            let (Some(key), Some(cert)) = (config.key.as_ref(), config.cert.as_ref()) else {
                return Err(SendError::internal("secure listener missing key or cert"));
            };
            Some(tls::build_acceptor(key, cert)?)
        } else {
            None
        };

        Ok(BoundListener {
            listener,
            acceptor,
            opts: Arc::new(ListenerOptions {
                prefix: config.prefix().to_string(),
                expect_secure: config.secure,
                body_limit: config.body_limit(),
            }),
            redirect_origin: None,
        })
    }

    /// Binds the optional cleartext redirect port of a secure listener.
    async fn bind_redirect(
        &self,
        config: &ListenerConfig,
    ) -> Result<Option<BoundListener>, SendError> {
        let Some(redirect_port) = config.redirect else {
            return Ok(None);
        };
        let address = format!("{}:{}", config.host(), redirect_port);
        let listener = match TcpListener::bind(&address).await {
            Ok(listener) => listener,
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::AddrInUse | std::io::ErrorKind::PermissionDenied
                ) =>
            {
                tracing::error!(%address, error = %err, "fatal listen error");
                std::process::exit(EXIT_CODE_BIND);
            }
            Err(err) => return Err(SendError::internal(format!("bind {}: {}", address, err))),
        };

        let host = config.host();
        let origin_host = if host == "0.0.0.0" { "localhost" } else { host };
        let origin = format!("https://{}:{}", origin_host, config.parse_port());

        Ok(Some(BoundListener {
            listener,
            acceptor: None,
            opts: Arc::new(ListenerOptions::default()),
            redirect_origin: Some(Arc::new(origin)),
        }))
    }
}

/// Accepts connections until `exit`; dropping the listener closes the
/// socket.
async fn accept_loop(
    bound: BoundListener,
    router: Arc<Router>,
    bus: Arc<EventBus>,
    in_flight: InFlight,
) {
    let BoundListener {
        listener,
        acceptor,
        opts,
        redirect_origin,
    } = bound;
    let mut exit = bus.subscribe_exit();

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = exit.recv() => break,
        };

        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                tracing::error!(error = %err, "error accepting connection");
                continue;
            }
        };
        tracing::trace!(%peer, "connection accepted");

        let router = Arc::clone(&router);
        let opts = Arc::clone(&opts);
        let acceptor = acceptor.clone();
        let redirect_origin = redirect_origin.clone();
        let in_flight = in_flight.clone();

        in_flight.enter();
        tokio::spawn(async move {
            match (redirect_origin, acceptor) {
                (Some(origin), _) => conn::serve_redirect_connection(stream, origin).await,
                (None, Some(acceptor)) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => conn::serve_connection(tls_stream, router, opts).await,
                    Err(err) => {
                        tracing::debug!(error = %err, "tls handshake failed");
                    }
                },
                (None, None) => conn::serve_connection(stream, router, opts).await,
            }
            in_flight.leave();
        });
    }
}

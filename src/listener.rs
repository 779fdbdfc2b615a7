//! Listener lifecycle: sequential startup, per-connection serving and the
//! fatal-event cascade that tears every listener down.

use crate::config::{ListenerConfig, ServerConfig};
use crate::events::{Event, EventBus, EventKind};
use crate::handler::HandlerRegistry;
use crate::router::Router;
use crate::tenant::{Protocol, TenantResolver, VirtualHostIndex};
use crate::tls::{self, CertificateIndex, TlsError};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

/// A listener failed to start; carries the port it was meant to bind
#[derive(Debug, Error)]
#[error("listener on port {port} failed to start: {kind}")]
pub struct StartError {
    pub port: u16,
    #[source]
    pub kind: StartErrorKind,
}

#[derive(Debug, Error)]
pub enum StartErrorKind {
    #[error("bind failed: {0}")]
    Bind(std::io::Error),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("listeners were already started")]
    AlreadyStarted,

    #[error("shutdown requested while listeners were starting")]
    ShutdownRequested,
}

impl StartError {
    fn new(port: u16, kind: impl Into<StartErrorKind>) -> Self {
        Self {
            port,
            kind: kind.into(),
        }
    }

    fn bind(port: u16, err: std::io::Error) -> Self {
        Self::new(port, StartErrorKind::Bind(err))
    }
}

/// Handle to one bound socket
pub struct Listener {
    port: u16,
    encrypted: bool,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    closed: AtomicBool,
    events: EventBus,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("port", &self.port)
            .field("encrypted", &self.encrypted)
            .field("local_addr", &self.local_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Listener {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting connections. Returns false if already closed.
    /// Connections already accepted run to completion.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        let _ = self.shutdown_tx.send(true);
        info!(port = self.port, "Listener stopped");
        self.events.publish(
            Event::info(EventKind::ListenerStopped, "listener stopped")
                .with_info("port", self.port)
                .with_info("encrypted", self.encrypted),
        );
        true
    }
}

/// Starts listeners in order and tears them all down on the first fatal
/// event or on an explicit [`ListenerManager::shutdown`]
pub struct ListenerManager {
    bind: String,
    cert_dir: Option<PathBuf>,
    server_identity: String,
    max_body_bytes: usize,
    index: Arc<VirtualHostIndex>,
    handlers: Arc<HandlerRegistry>,
    events: EventBus,
    listeners: Mutex<Vec<Arc<Listener>>>,
    state_tx: watch::Sender<LifecycleState>,
    stopping: AtomicBool,
    fatal_cause: Mutex<Option<String>>,
}

impl ListenerManager {
    pub fn new(
        server: &ServerConfig,
        index: Arc<VirtualHostIndex>,
        handlers: Arc<HandlerRegistry>,
        events: EventBus,
    ) -> Self {
        let (state_tx, _) = watch::channel(LifecycleState::Idle);
        Self {
            bind: server.bind.clone(),
            cert_dir: server.cert_dir.clone(),
            server_identity: server.server_identity.clone(),
            max_body_bytes: server.max_body_bytes,
            index,
            handlers,
            events,
            listeners: Mutex::new(Vec::new()),
            state_tx,
            stopping: AtomicBool::new(false),
            fatal_cause: Mutex::new(None),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn state(&self) -> LifecycleState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.state_tx.subscribe()
    }

    pub fn listeners(&self) -> Vec<Arc<Listener>> {
        self.listeners.lock().clone()
    }

    /// Message of the fatal event that stopped the listeners, if any
    pub fn fatal_cause(&self) -> Option<String> {
        self.fatal_cause.lock().clone()
    }

    /// Start every listener in declaration order. The first failure closes
    /// the listeners started so far and is returned; later listeners are
    /// never attempted. A shutdown or fatal event that arrives mid-startup
    /// aborts the same way.
    pub async fn start_all(self: &Arc<Self>, configs: &[ListenerConfig]) -> Result<Vec<Arc<Listener>>, StartError> {
        let claimed = self.state_tx.send_if_modified(|state| {
            if *state == LifecycleState::Idle {
                *state = LifecycleState::Starting;
                true
            } else {
                false
            }
        });
        if !claimed {
            let port = configs.first().map(|c| c.port).unwrap_or(0);
            return Err(StartError::new(port, StartErrorKind::AlreadyStarted));
        }

        // Watch for fatal events before the first listener accepts traffic
        let fatal_rx = self.events.watch_fatal();
        let state_rx = self.state_tx.subscribe();
        tokio::spawn(Arc::clone(self).supervise(fatal_rx, state_rx));

        let mut started: Vec<Arc<Listener>> = Vec::with_capacity(configs.len());
        for config in configs {
            let listener = match self.start_one(*config).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!(port = e.port, error = %e, "Listener failed to start, closing started listeners");
                    let cause = e.to_string();
                    self.events.publish(
                        Event::fatal(EventKind::StartupFailure, "listener failed to start")
                            .with_cause(&cause)
                            .with_info("port", e.port),
                    );
                    self.teardown("startup failure", Some(cause));
                    return Err(e);
                }
            };

            if !self.register(&listener) {
                warn!(port = config.port, "Teardown began during startup, aborting");
                listener.close();
                return Err(StartError::new(config.port, StartErrorKind::ShutdownRequested));
            }
            started.push(listener);
        }

        let running = self.state_tx.send_if_modified(|state| {
            if *state == LifecycleState::Starting {
                *state = LifecycleState::Running;
                true
            } else {
                false
            }
        });
        if !running {
            // Teardown already closed everything registered above
            let port = configs.last().map(|c| c.port).unwrap_or(0);
            return Err(StartError::new(port, StartErrorKind::ShutdownRequested));
        }

        info!(listeners = started.len(), "All listeners running");
        Ok(started)
    }

    /// Record a freshly started listener so teardown can reach it. Returns
    /// false if teardown has already begun.
    fn register(&self, listener: &Arc<Listener>) -> bool {
        let mut listeners = self.listeners.lock();
        if self.stopping.load(Ordering::SeqCst) {
            return false;
        }
        listeners.push(Arc::clone(listener));
        true
    }

    async fn start_one(&self, config: ListenerConfig) -> Result<Arc<Listener>, StartError> {
        let port = config.port;
        let protocol = Protocol::from_encrypted(config.encrypted);

        let acceptor = if config.encrypted {
            let certificates = CertificateIndex::build(&self.index, port, self.cert_dir.as_deref())
                .map_err(|e| StartError::new(port, e))?;
            let server_config = tls::server_config(Arc::new(certificates), self.events.clone())
                .map_err(|e| StartError::new(port, e))?;
            Some(TlsAcceptor::from(server_config))
        } else {
            None
        };

        let tcp = TcpListener::bind((self.bind.as_str(), port))
            .await
            .map_err(|e| StartError::bind(port, e))?;
        let local_addr = tcp.local_addr().map_err(|e| StartError::bind(port, e))?;

        let resolver: Arc<dyn TenantResolver> = self.index.clone();
        let router = Router::new(
            resolver,
            Arc::clone(&self.handlers),
            self.events.clone(),
            protocol,
            &self.server_identity,
            self.max_body_bytes,
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(accept_loop(tcp, router, acceptor, shutdown_rx));

        info!(port, addr = %local_addr, %protocol, "Listener started (HTTP/1.1 and HTTP/2)");
        self.events.publish(
            Event::info(EventKind::ListenerStarted, "listener started")
                .with_info("port", port)
                .with_info("protocol", protocol)
                .with_info("addr", local_addr),
        );

        Ok(Arc::new(Listener {
            port,
            encrypted: config.encrypted,
            local_addr,
            shutdown_tx,
            closed: AtomicBool::new(false),
            events: self.events.clone(),
        }))
    }

    /// Close every listener. Safe to call repeatedly and concurrently with
    /// the fatal cascade; only the first caller does any work.
    pub fn shutdown(&self) {
        self.teardown("shutdown requested", None);
    }

    /// Resolves once the manager reaches [`LifecycleState::Stopped`]
    pub async fn wait_stopped(&self) {
        let mut state_rx = self.state_tx.subscribe();
        let _ = state_rx.wait_for(|state| *state == LifecycleState::Stopped).await;
    }

    fn teardown(&self, reason: &str, fatal_cause: Option<String>) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(cause) = &fatal_cause {
            *self.fatal_cause.lock() = Some(cause.clone());
        }

        self.state_tx.send_replace(LifecycleState::ShuttingDown);
        // Anything registered from here on is refused by `register`
        let listeners = self.listeners.lock().clone();
        info!(listeners = listeners.len(), reason, "Closing all listeners");
        for listener in &listeners {
            listener.close();
        }

        let mut event = Event::info(EventKind::Shutdown, reason);
        if let Some(cause) = fatal_cause {
            event = event.with_cause(cause);
        }
        self.events.publish(event);
        self.state_tx.send_replace(LifecycleState::Stopped);
    }

    /// Waits for the bus to latch a fatal event, then closes everything.
    /// The bus broadcasts before latching, so other subscribers already
    /// hold the event when teardown starts. Exits quietly if the manager
    /// stops for any other reason.
    async fn supervise(
        self: Arc<Self>,
        mut fatal_rx: watch::Receiver<Option<Event>>,
        mut state_rx: watch::Receiver<LifecycleState>,
    ) {
        let fatal = tokio::select! {
            latched = fatal_rx.wait_for(Option::is_some) => match latched {
                Ok(event) => (*event).clone(),
                Err(_) => None,
            },
            _ = state_rx.wait_for(|state| {
                matches!(state, LifecycleState::ShuttingDown | LifecycleState::Stopped)
            }) => None,
        };

        if let Some(event) = fatal {
            error!(kind = %event.kind, message = %event.message, "Fatal event, shutting down listeners");
            tokio::task::yield_now().await;
            let cause = match &event.cause {
                Some(cause) => format!("{}: {}", event.message, cause),
                None => event.message.clone(),
            };
            self.teardown("fatal event", Some(cause));
        }
        debug!("Listener supervisor exited");
    }
}

async fn accept_loop(
    listener: TcpListener,
    router: Router,
    acceptor: Option<TlsAcceptor>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let router = router.clone();
                        let acceptor = acceptor.clone();
                        tokio::spawn(async move {
                            handle_stream(stream, addr, router, acceptor).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

async fn handle_stream(stream: TcpStream, addr: SocketAddr, router: Router, acceptor: Option<TlsAcceptor>) {
    // The port the client actually reached is authoritative
    let local_port = match stream.local_addr() {
        Ok(local) => local.port(),
        Err(e) => {
            debug!(addr = %addr, error = %e, "Failed to read local address");
            return;
        }
    };

    match acceptor {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => {
                if let Err(e) = handle_connection(tls_stream, addr, local_port, router).await {
                    debug!(addr = %addr, error = %e, "TLS connection error");
                }
            }
            Err(e) => {
                debug!(addr = %addr, error = %e, "TLS handshake failed");
            }
        },
        None => {
            if let Err(e) = handle_connection(stream, addr, local_port, router).await {
                debug!(addr = %addr, error = %e, "Connection error");
            }
        }
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, local_port: u16, router: Router) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let router = router.clone();
        async move {
            let req = req.map(|body| body.boxed());
            Ok::<_, Infallible>(router.route(req, local_port).await)
        }
    });

    debug!(addr = %addr, port = local_port, "Serving connection");
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

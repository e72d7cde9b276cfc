//! Server-side accept loop.

use crate::registry::{next_id, Registry};
use crate::status::close_code;
use crate::transport::PendingTransport;
use crate::{WsConnection, WsError, WsHandler, WsParameters};
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Admission predicate applied to each accepted peer before any handshake.
pub type AcceptPolicy = Arc<dyn Fn(SocketAddr) -> bool + Send + Sync>;

struct Inner {
    id: u64,
    local_addr: SocketAddr,
    is_secure: bool,
    parameters: WsParameters,
    handler: Arc<dyn WsHandler>,
    connections: Registry<WsConnection>,
    listeners: Registry<WsListener>,
    shutdown: CancellationToken,
    close_reason: Mutex<String>,
}

/// A running listener. Cloning yields another handle to the same listener.
#[derive(Clone)]
pub struct WsListener {
    inner: Arc<Inner>,
}

impl fmt::Debug for WsListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsListener")
            .field("id", &self.inner.id)
            .field("local_addr", &self.inner.local_addr)
            .field("secure", &self.inner.is_secure)
            .field("open", &self.is_open())
            .finish()
    }
}

impl PartialEq for WsListener {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for WsListener {}

impl WsListener {
    /// Registers the listener and spawns its accept loop.
    pub(crate) fn start(
        listener: TcpListener,
        acceptor: Option<TlsAcceptor>,
        parameters: WsParameters,
        handler: Arc<dyn WsHandler>,
        accept_policy: Option<AcceptPolicy>,
        listeners: Registry<WsListener>,
    ) -> Result<Self, WsError> {
        let local_addr = listener.local_addr()?;
        let ws_listener = Self {
            inner: Arc::new(Inner {
                id: next_id(),
                local_addr,
                is_secure: acceptor.is_some(),
                parameters,
                handler,
                connections: Registry::default(),
                listeners,
                shutdown: CancellationToken::new(),
                close_reason: Mutex::new(String::new()),
            }),
        };
        ws_listener
            .inner
            .listeners
            .insert(ws_listener.id(), ws_listener.clone());
        tokio::spawn(
            ws_listener
                .clone()
                .accept_loop(listener, acceptor, accept_policy),
        );
        Ok(ws_listener)
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn port(&self) -> u16 {
        self.inner.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn is_secure(&self) -> bool {
        self.inner.is_secure
    }

    /// False once the listener was closed or failed.
    pub fn is_open(&self) -> bool {
        !self.inner.shutdown.is_cancelled()
    }

    pub fn parameters(&self) -> &WsParameters {
        &self.inner.parameters
    }

    /// Live connections accepted by this listener.
    pub fn list_connections(&self) -> Vec<WsConnection> {
        self.inner.connections.snapshot()
    }

    /// Stops accepting and closes every tracked connection with GOING_AWAY.
    ///
    /// Connections accepted while the close is in flight are closed by the
    /// accept loop once it has stopped.
    pub async fn close(&self, reason: &str) {
        if !self.inner.shutdown.is_cancelled() {
            info!(listener = self.id(), "Closing listener");
            *self.inner.close_reason.lock() = reason.to_string();
            self.inner.shutdown.cancel();
        }
        self.close_connections(reason).await;
    }

    /// Shuts the listener down after an accept error and reports it through
    /// `on_error` with no connection attached.
    pub(crate) async fn fail(&self, e: io::Error) {
        error!(listener = self.id(), error = %e, "Accept failed, shutting down listener");
        self.inner.shutdown.cancel();
        let error = WsError::Io(e);
        let callback = self.inner.handler.on_error(None, &error);
        if AssertUnwindSafe(callback).catch_unwind().await.is_err() {
            error!(listener = self.id(), "on_error panicked");
        }
        self.close_connections("").await;
    }

    async fn close_connections(&self, reason: &str) {
        for conn in self.inner.connections.snapshot() {
            conn.close(close_code::GOING_AWAY, reason).await;
        }
    }

    async fn accept_loop(
        self,
        listener: TcpListener,
        acceptor: Option<TlsAcceptor>,
        accept_policy: Option<AcceptPolicy>,
    ) {
        let id = self.id();
        info!(
            listener = id,
            port = self.port(),
            secure = self.is_secure(),
            "Listening"
        );

        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    if self.inner.shutdown.is_cancelled() {
                        debug!(listener = id, %peer, "Dropping connection accepted during shutdown");
                        break;
                    }
                    if let Some(policy) = &accept_policy {
                        if !policy(peer) {
                            debug!(listener = id, %peer, "Connection rejected by accept policy");
                            continue;
                        }
                    }
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(listener = id, error = %e, "Failed to set TCP_NODELAY");
                    }
                    let transport = match &acceptor {
                        Some(acceptor) => PendingTransport::TlsServer(stream, acceptor.clone()),
                        None => PendingTransport::Plain(stream),
                    };
                    let conn = WsConnection::start_server(
                        transport,
                        self.inner.parameters.clone(),
                        self.inner.connections.clone(),
                        Arc::clone(&self.inner.handler),
                    );
                    debug!(
                        listener = id,
                        connection = conn.id(),
                        %peer,
                        live = self.inner.connections.len(),
                        "Accepted connection"
                    );
                }
                Err(e) => {
                    if !self.inner.shutdown.is_cancelled() {
                        self.fail(e).await;
                    }
                    break;
                }
            }
        }

        drop(listener);
        // only this loop inserts, so nothing can be registered after this sweep
        let reason = self.inner.close_reason.lock().clone();
        self.close_connections(&reason).await;
        self.inner.listeners.remove(id);
        info!(listener = id, "Listener stopped");
    }
}

//! Endpoint owning listeners and client connections.

use crate::listener::AcceptPolicy;
use crate::registry::Registry;
use crate::status::close_code;
use crate::transport::{
    bind_listener, connect_tcp, resolve, server_name, tls_acceptor, tls_connector,
    PendingTransport,
};
use crate::{WsConnection, WsError, WsHandler, WsListener, WsParameters};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// Entry point for servers and clients.
///
/// Tracks every listener it started and every client connection it opened so
/// they can be closed together with [`WebSocket::close_all`].
///
/// # Example
///
/// ```no_run
/// use websocket_engine::{WebSocket, WsHandler, WsParameters};
/// use std::sync::Arc;
///
/// async fn run(handler: Arc<dyn WsHandler>) -> Result<(), websocket_engine::WsError> {
///     let websocket = WebSocket::new();
///     let params = WsParameters::default().with_subprotocols(["chat"]);
///
///     let listener = websocket.listen(8080, handler.clone(), &params)?;
///     let conn = websocket
///         .connect(&format!("ws://localhost:{}/room", listener.port()), handler, &params)
///         .await?;
///     conn.send_text("hello").await?;
///
///     websocket.close_all("bye").await;
///     Ok(())
/// }
/// ```
#[derive(Clone, Default)]
pub struct WebSocket {
    bind_address: Option<IpAddr>,
    accept_policy: Option<AcceptPolicy>,
    connections: Registry<WsConnection>,
    listeners: Registry<WsListener>,
}

impl WebSocket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local address listeners bind to and client sockets connect from.
    #[must_use]
    pub fn with_bind_address(mut self, address: IpAddr) -> Self {
        self.bind_address = Some(address);
        self
    }

    /// Rejects inbound peers for which `policy` returns false. Rejected sockets
    /// are closed before any handshake and never tracked.
    #[must_use]
    pub fn with_accept_policy<F>(mut self, policy: F) -> Self
    where
        F: Fn(SocketAddr) -> bool + Send + Sync + 'static,
    {
        self.accept_policy = Some(Arc::new(policy));
        self
    }

    pub fn bind_address(&self) -> Option<IpAddr> {
        self.bind_address
    }

    /// Starts a plain listener on `port` (0 picks a free port).
    ///
    /// # Errors
    /// Invalid parameters or a failure to bind.
    pub fn listen(
        &self,
        port: u16,
        handler: Arc<dyn WsHandler>,
        parameters: &WsParameters,
    ) -> Result<WsListener, WsError> {
        self.start_listener(port, handler, parameters, false)
    }

    /// Starts a TLS listener. `parameters.tls().server_config` must be set.
    ///
    /// # Errors
    /// Same as [`WebSocket::listen`], or a missing TLS server config.
    pub fn listen_secure(
        &self,
        port: u16,
        handler: Arc<dyn WsHandler>,
        parameters: &WsParameters,
    ) -> Result<WsListener, WsError> {
        self.start_listener(port, handler, parameters, true)
    }

    fn start_listener(
        &self,
        port: u16,
        handler: Arc<dyn WsHandler>,
        parameters: &WsParameters,
        secure: bool,
    ) -> Result<WsListener, WsError> {
        parameters.validate()?;
        let parameters = parameters.clone();
        let acceptor = if secure {
            Some(tls_acceptor(parameters.tls())?)
        } else {
            None
        };

        let ip = self
            .bind_address
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let listener = bind_listener(SocketAddr::new(ip, port), parameters.backlog())?;
        WsListener::start(
            listener,
            acceptor,
            parameters,
            handler,
            self.accept_policy.clone(),
            self.listeners.clone(),
        )
    }

    /// Opens a client connection to a `ws://` or `wss://` URI.
    ///
    /// Resolution and the TCP connect happen here, bounded by the handshake
    /// timeout; the TLS and opening handshakes continue in the connection's
    /// task and their outcome is reported through `handler`.
    ///
    /// # Errors
    /// Invalid URI or parameters, resolution failure, or connect failure.
    pub async fn connect(
        &self,
        uri: &str,
        handler: Arc<dyn WsHandler>,
        parameters: &WsParameters,
    ) -> Result<WsConnection, WsError> {
        parameters.validate()?;
        let parameters = parameters.clone();

        let url = Url::parse(uri).map_err(|e| WsError::InvalidUri(format!("{uri}: {e}")))?;
        let secure = match url.scheme() {
            "ws" => false,
            "wss" => true,
            other => {
                return Err(WsError::InvalidUri(format!(
                    "unsupported scheme {other}"
                )))
            }
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| WsError::InvalidUri(format!("{uri}: host required")))?
            .to_string();
        let port = url
            .port_or_known_default()
            .unwrap_or(if secure { 443 } else { 80 });

        let connector = if secure {
            Some((tls_connector(parameters.tls())?, server_name(&host)?))
        } else {
            None
        };

        let addrs = resolve(&host, port).await?;
        let tcp = connect_tcp(&addrs, self.bind_address, parameters.handshake_timeout()).await?;
        debug!(%url, peer = ?tcp.peer_addr().ok(), "Connected");

        let transport = match connector {
            Some((connector, name)) => PendingTransport::TlsClient(tcp, connector, name),
            None => PendingTransport::Plain(tcp),
        };
        Ok(WsConnection::start_client(
            transport,
            url,
            parameters,
            self.connections.clone(),
            handler,
        ))
    }

    /// Live client connections opened by this endpoint.
    pub fn list_connections(&self) -> Vec<WsConnection> {
        self.connections.snapshot()
    }

    pub fn list_listeners(&self) -> Vec<WsListener> {
        self.listeners.snapshot()
    }

    /// Closes every listener (and its connections), then every client
    /// connection, with GOING_AWAY.
    pub async fn close_all(&self, reason: &str) {
        for listener in self.listeners.snapshot() {
            listener.close(reason).await;
        }
        for conn in self.connections.snapshot() {
            conn.close(close_code::GOING_AWAY, reason).await;
        }
    }
}

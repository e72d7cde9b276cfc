//! Byte-stream transport: TCP, optional TLS and read timeouts.

use crate::{TlsParameters, WsError};
use hickory_resolver::TokioAsyncResolver;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::Sleep;
use tokio_rustls::rustls::{self, pki_types::ServerName};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

/// Any bidirectional byte stream a connection can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub(crate) type BoxedStream = Box<dyn AsyncStream>;

/// Read adapter that fails a read left pending longer than `timeout` with
/// `io::ErrorKind::TimedOut`. The deadline restarts after every completed read.
pub(crate) struct TimeoutRead<R> {
    inner: R,
    timeout: Duration,
    deadline: Option<Pin<Box<Sleep>>>,
}

impl<R> TimeoutRead<R> {
    pub(crate) fn new(inner: R, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            deadline: None,
        }
    }

    pub(crate) fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
        self.deadline = None;
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for TimeoutRead<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                let timeout = this.timeout;
                let deadline = this
                    .deadline
                    .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
                match deadline.as_mut().poll(cx) {
                    Poll::Ready(()) => {
                        this.deadline = None;
                        Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "read timed out",
                        )))
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }
}

/// A TCP stream whose TLS handshake (if any) has not run yet.
///
/// The handshake is deferred to the connection task so it runs under the
/// connection's handshake timeout and never blocks an accept loop.
pub(crate) enum PendingTransport {
    Plain(TcpStream),
    TlsServer(TcpStream, TlsAcceptor),
    TlsClient(TcpStream, TlsConnector, ServerName<'static>),
}

impl PendingTransport {
    pub(crate) fn is_secure(&self) -> bool {
        !matches!(self, Self::Plain(_))
    }

    pub(crate) fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Plain(tcp) | Self::TlsServer(tcp, _) | Self::TlsClient(tcp, _, _) => {
                tcp.peer_addr().ok()
            }
        }
    }

    /// Completes the TLS handshake, returning the stream and the negotiated TLS
    /// protocol version.
    pub(crate) async fn establish(self) -> Result<(BoxedStream, Option<String>), WsError> {
        match self {
            Self::Plain(tcp) => Ok((Box::new(tcp), None)),
            Self::TlsServer(tcp, acceptor) => {
                let tls = acceptor
                    .accept(tcp)
                    .await
                    .map_err(|e| WsError::Tls(e.to_string()))?;
                let protocol = tls.get_ref().1.protocol_version().map(|v| format!("{v:?}"));
                Ok((Box::new(tls), protocol))
            }
            Self::TlsClient(tcp, connector, server_name) => {
                let tls = connector
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| WsError::Tls(e.to_string()))?;
                let protocol = tls.get_ref().1.protocol_version().map(|v| format!("{v:?}"));
                Ok((Box::new(tls), protocol))
            }
        }
    }
}

/// Binds a listening socket with the requested backlog.
pub(crate) fn bind_listener(addr: SocketAddr, backlog: u32) -> Result<TcpListener, WsError> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(backlog)?)
}

/// Resolves `host` to its addresses. IP literals bypass DNS.
pub(crate) async fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>, WsError> {
    let literal = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = literal.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }

    let resolver = TokioAsyncResolver::tokio_from_system_conf()?;
    let lookup = resolver.lookup_ip(host).await?;
    let addrs: Vec<SocketAddr> = lookup.iter().map(|ip| SocketAddr::new(ip, port)).collect();
    if addrs.is_empty() {
        return Err(WsError::NoAddressesFound(host.to_string()));
    }
    debug!(host, count = addrs.len(), "Resolved host");
    Ok(addrs)
}

/// Connects to the first reachable address, each attempt bounded by `timeout`.
pub(crate) async fn connect_tcp(
    addrs: &[SocketAddr],
    bind_address: Option<IpAddr>,
    timeout: Duration,
) -> Result<TcpStream, WsError> {
    let mut last_error = None;
    for addr in addrs {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Some(ip) = bind_address {
            socket.set_reuseaddr(true)?;
            socket.bind(SocketAddr::new(ip, 0))?;
        }
        match tokio::time::timeout(timeout, socket.connect(*addr)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Ok(Err(e)) => {
                debug!(%addr, error = %e, "Connect attempt failed");
                last_error = Some(WsError::Io(e));
            }
            Err(_) => {
                debug!(%addr, "Connect attempt timed out");
                last_error = Some(WsError::Timeout);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| WsError::NoAddressesFound(String::new())))
}

/// TLS acceptor for a secure listener.
pub(crate) fn tls_acceptor(tls: &TlsParameters) -> Result<TlsAcceptor, WsError> {
    let config = tls.server_config.clone().ok_or_else(|| {
        WsError::InvalidParameters("secure listener requires a TLS server config".into())
    })?;
    Ok(TlsAcceptor::from(config))
}

/// TLS connector for a secure client, defaulting to the web PKI roots.
pub(crate) fn tls_connector(tls: &TlsParameters) -> Result<TlsConnector, WsError> {
    if let Some(config) = &tls.client_config {
        return Ok(TlsConnector::from(config.clone()));
    }
    Ok(TlsConnector::from(Arc::new(default_client_config()?)))
}

fn default_client_config() -> Result<rustls::ClientConfig, WsError> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let provider = rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));

    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| WsError::Tls(e.to_string()))?
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(config)
}

pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>, WsError> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host)
        .map(|name| name.to_owned())
        .map_err(|_| WsError::InvalidUri(format!("invalid TLS server name: {host}")))
}

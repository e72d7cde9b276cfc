//! WebSocket connection handling
//!
//! A connection runs as two tasks. The lifecycle task performs the TLS and
//! opening handshakes, then dispatches queued messages to the handler one at a
//! time. The receive task (see [`crate::receiver`]) reads frames and feeds the
//! queue. Every write goes through one async lock, so frames of concurrent
//! sends never interleave.

use crate::frame::{generate_mask, write_frame, OpCode};
use crate::handshake::{client_handshake, server_handshake};
use crate::receiver::{self, FrameReader};
use crate::registry::{next_id, Registry};
use crate::status::{
    close_code, close_payload, normalize_code, parse_close_payload, truncate_reason,
    ConnectionState, StatusRecord,
};
use crate::transport::{BoxedStream, PendingTransport, TimeoutRead};
use crate::{WsError, WsHandler, WsParameters, WsStatus};
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader, WriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;

/// Capacity of the queue between the receive and dispatch tasks.
const QUEUE_CAPACITY: usize = 3;

/// How often the dispatch task checks whether the receiver is still alive.
const DISPATCH_POLL: Duration = Duration::from_millis(100);

type FrameWriter = WriteHalf<BoxedStream>;

/// Negotiated at handshake time.
#[derive(Debug, Clone, Default)]
struct Session {
    subprotocol: Option<String>,
    path: Option<String>,
    query: Option<String>,
    tls_protocol: Option<String>,
}

struct Inner {
    id: u64,
    is_client_side: bool,
    is_secure: bool,
    parameters: WsParameters,
    url: Option<Url>,
    peer_addr: Option<SocketAddr>,
    session: RwLock<Session>,
    status: Mutex<StatusRecord>,
    writer: tokio::sync::Mutex<Option<FrameWriter>>,
    shutdown: CancellationToken,
    connections: Registry<WsConnection>,
}

/// Handle to a client or server connection. Cloning is cheap; all clones refer
/// to the same connection.
#[derive(Clone)]
pub struct WsConnection {
    inner: Arc<Inner>,
}

impl fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsConnection")
            .field("id", &self.inner.id)
            .field("client_side", &self.inner.is_client_side)
            .field("secure", &self.inner.is_secure)
            .field("peer_addr", &self.inner.peer_addr)
            .field("state", &self.inner.status.lock().state())
            .finish()
    }
}

impl PartialEq for WsConnection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for WsConnection {}

impl WsConnection {
    fn new(
        transport: &PendingTransport,
        url: Option<Url>,
        parameters: WsParameters,
        connections: Registry<WsConnection>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: next_id(),
                is_client_side: url.is_some(),
                is_secure: transport.is_secure(),
                parameters,
                url,
                peer_addr: transport.peer_addr(),
                session: RwLock::new(Session::default()),
                status: Mutex::new(StatusRecord::new()),
                writer: tokio::sync::Mutex::new(None),
                shutdown: CancellationToken::new(),
                connections,
            }),
        }
    }

    /// Registers the connection and spawns its lifecycle task.
    pub(crate) fn start_server(
        transport: PendingTransport,
        parameters: WsParameters,
        connections: Registry<WsConnection>,
        handler: Arc<dyn WsHandler>,
    ) -> Self {
        let conn = Self::new(&transport, None, parameters, connections);
        conn.start(transport, handler);
        conn
    }

    pub(crate) fn start_client(
        transport: PendingTransport,
        url: Url,
        parameters: WsParameters,
        connections: Registry<WsConnection>,
        handler: Arc<dyn WsHandler>,
    ) -> Self {
        let conn = Self::new(&transport, Some(url), parameters, connections);
        conn.start(transport, handler);
        conn
    }

    fn start(&self, transport: PendingTransport, handler: Arc<dyn WsHandler>) {
        self.inner.connections.insert(self.id(), self.clone());
        tokio::spawn(self.clone().run(transport, handler));
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_open(&self) -> bool {
        self.inner.status.lock().is_open()
    }

    pub fn is_secure(&self) -> bool {
        self.inner.is_secure
    }

    pub fn is_client_side(&self) -> bool {
        self.inner.is_client_side
    }

    /// Subprotocol agreed during the opening handshake.
    pub fn subprotocol(&self) -> Option<String> {
        self.inner.session.read().subprotocol.clone()
    }

    /// Snapshot of the current status.
    pub fn status(&self) -> WsStatus {
        self.inner.status.lock().snapshot()
    }

    pub fn parameters(&self) -> &WsParameters {
        &self.inner.parameters
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    /// Host from the request URI on the client side, peer IP on the server side.
    pub fn peer_host(&self) -> Option<String> {
        match &self.inner.url {
            Some(url) => url.host_str().map(String::from),
            None => self.inner.peer_addr.map(|addr| addr.ip().to_string()),
        }
    }

    /// Request URI of a client connection.
    pub fn url(&self) -> Option<&Url> {
        self.inner.url.as_ref()
    }

    /// Request path, known once the handshake completed.
    pub fn path(&self) -> Option<String> {
        self.inner.session.read().path.clone()
    }

    pub fn query(&self) -> Option<String> {
        self.inner.session.read().query.clone()
    }

    /// Negotiated TLS version of a secure connection.
    pub fn tls_protocol(&self) -> Option<String> {
        self.inner.session.read().tls_protocol.clone()
    }

    /// Connections of the owning listener. A client connection lists itself.
    pub fn list_connections(&self) -> Vec<WsConnection> {
        if self.inner.is_client_side {
            vec![self.clone()]
        } else {
            self.inner.connections.snapshot()
        }
    }

    pub async fn send_text(&self, text: &str) -> Result<(), WsError> {
        self.send(text.as_bytes(), true).await
    }

    pub async fn send_binary(&self, data: &[u8]) -> Result<(), WsError> {
        self.send(data, false).await
    }

    /// Sends one message, fragmented into frames of at most
    /// `payload_buffer_length` bytes.
    ///
    /// # Errors
    /// `NotOpen` once the connection left the open state; a transport failure
    /// closes the connection abnormally and is returned.
    pub async fn send(&self, payload: &[u8], is_text: bool) -> Result<(), WsError> {
        self.send_reader(payload, is_text).await
    }

    /// Streams `source` as one message. At least one frame is always sent, so
    /// an empty source yields an empty final frame.
    ///
    /// # Errors
    /// Same as [`WsConnection::send`]. A failing source closes the connection
    /// with INTERNAL_ERROR since the message cannot be completed.
    pub async fn send_reader<R: AsyncRead + Unpin>(
        &self,
        mut source: R,
        is_text: bool,
    ) -> Result<(), WsError> {
        let mut guard = self.inner.writer.lock().await;
        if !self.is_open() {
            return Err(WsError::NotOpen);
        }

        let mut buf = vec![0u8; self.inner.parameters.payload_buffer_length()];
        let mut opcode = if is_text { OpCode::Text } else { OpCode::Binary };
        loop {
            let len = match read_full(&mut source, &mut buf).await {
                Ok(len) => len,
                Err(e) => {
                    let kind = e.kind();
                    self.inner.status.lock().record_error(WsError::Io(e));
                    self.close_locked(&mut guard, close_code::INTERNAL_ERROR, "")
                        .await;
                    return Err(io::Error::from(kind).into());
                }
            };
            let Some(writer) = guard.as_mut() else {
                return Err(WsError::NotOpen);
            };
            let fin = len < buf.len();
            if let Err(e) = write_frame(writer, opcode, fin, &buf[..len], self.mask()).await {
                return Err(self.abort(e));
            }
            if fin {
                return Ok(());
            }
            opcode = OpCode::Continuation;
        }
    }

    /// Starts the closing handshake. Calling it again, or after the peer
    /// closed, does nothing.
    ///
    /// Codes outside 1000..=4999 become NO_STATUS and lose their reason;
    /// reasons longer than 123 bytes are truncated. If the peer does not echo
    /// the close frame within the handshake timeout the transport is dropped.
    pub async fn close(&self, code: u16, reason: &str) {
        let mut guard = self.inner.writer.lock().await;
        self.close_locked(&mut guard, code, reason).await;
    }

    /// Closes because of `error`, recording it if the connection was open.
    pub(crate) async fn close_due_to(&self, code: u16, error: WsError) {
        let mut guard = self.inner.writer.lock().await;
        {
            let mut status = self.inner.status.lock();
            if status.is_open() {
                status.record_error(error);
            }
        }
        self.close_locked(&mut guard, code, "").await;
    }

    async fn close_locked(&self, writer: &mut Option<FrameWriter>, code: u16, reason: &str) {
        let code = normalize_code(code);
        let reason = if code == close_code::NO_STATUS {
            ""
        } else {
            truncate_reason(reason)
        };

        let previous = {
            let mut status = self.inner.status.lock();
            let previous = status.state();
            if !status.begin_close(code, reason.to_string(), false) {
                return;
            }
            previous
        };

        if previous == ConnectionState::Connecting {
            debug!(connection = self.id(), code, "Aborting opening handshake");
            self.inner.shutdown.cancel();
            return;
        }

        debug!(connection = self.id(), code, reason, "Closing connection");
        if code != close_code::ABNORMAL_CLOSURE {
            if let Some(writer) = writer.as_mut() {
                let payload = close_payload(code, reason);
                if let Err(e) =
                    write_frame(writer, OpCode::Close, true, &payload, self.mask()).await
                {
                    self.abort(e);
                    return;
                }
            }
        }

        let shutdown = self.inner.shutdown.clone();
        let timeout = self.inner.parameters.handshake_timeout();
        let id = self.id();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    debug!(connection = id, "Close handshake timed out, dropping transport");
                    shutdown.cancel();
                }
                _ = shutdown.cancelled() => {}
            }
        });
    }

    /// Handles a close frame from the peer: echoes it if we did not close first.
    pub(crate) async fn receive_close(&self, payload: &[u8]) {
        let mut guard = self.inner.writer.lock().await;
        let echo = {
            let mut status = self.inner.status.lock();
            let (code, reason) = parse_close_payload(payload);
            // echo what was understood, a malformed payload goes back empty
            let echo = close_payload(code, &reason);
            let echoing = status.is_open() && status.begin_close(code, reason, true);
            status.mark_clean();
            echoing.then_some(echo)
        };
        if let Some(echo) = echo {
            debug!(connection = self.id(), "Peer closed, echoing close frame");
            if let Some(writer) = guard.as_mut() {
                if let Err(e) = write_frame(writer, OpCode::Close, true, &echo, self.mask()).await {
                    trace!(connection = self.id(), error = %e, "Close echo failed");
                }
            }
        }
    }

    /// Writes a ping or pong.
    pub(crate) async fn send_control(&self, opcode: OpCode, payload: &[u8]) -> Result<(), WsError> {
        let mut guard = self.inner.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(WsError::NotOpen);
        };
        match write_frame(writer, opcode, true, payload, self.mask()).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.abort(e)),
        }
    }

    /// A write failed: the transport is unusable, so close abnormally and
    /// drop it. Returns an error of the same kind for the caller.
    fn abort(&self, error: io::Error) -> WsError {
        let kind = error.kind();
        warn!(connection = self.id(), %error, "Write failed");
        {
            let mut status = self.inner.status.lock();
            status.record_error(WsError::Io(error));
            status.begin_close(close_code::ABNORMAL_CLOSURE, String::new(), false);
        }
        self.inner.shutdown.cancel();
        io::Error::from(kind).into()
    }

    fn mask(&self) -> Option<[u8; 4]> {
        self.inner.is_client_side.then(generate_mask)
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    async fn run(self, transport: PendingTransport, handler: Arc<dyn WsHandler>) {
        let id = self.id();
        let timeout = self.inner.parameters.handshake_timeout();

        let opened = tokio::select! {
            result = tokio::time::timeout(timeout, self.open_session(transport)) => match result {
                Ok(result) => result.map(Some),
                Err(_) => Err(WsError::Timeout),
            },
            _ = self.inner.shutdown.cancelled() => Ok(None),
        };

        match opened {
            Ok(Some(reader)) => {
                if self.inner.status.lock().open() {
                    info!(
                        connection = id,
                        client = self.inner.is_client_side,
                        subprotocol = ?self.subprotocol(),
                        "Connection open"
                    );
                    self.dispatch(handler.as_ref(), reader).await;
                }
            }
            Ok(None) => debug!(connection = id, "Opening handshake aborted"),
            Err(e) => {
                warn!(connection = id, error = %e, "Opening handshake failed");
                self.inner.status.lock().fail_connecting(e);
            }
        }

        self.release().await;
        let status = self.status();
        info!(connection = id, %status, "Connection closed");

        if let Some(error) = &status.error {
            let callback = handler.on_error(Some(&self), error);
            if AssertUnwindSafe(callback).catch_unwind().await.is_err() {
                error!(connection = id, "on_error panicked");
            }
        }
        if AssertUnwindSafe(handler.on_close(&self, status))
            .catch_unwind()
            .await
            .is_err()
        {
            error!(connection = id, "on_close panicked");
        }
        self.inner.connections.remove(id);
    }

    /// TLS handshake plus opening handshake. Frame bytes that arrive with the
    /// HTTP head stay buffered in the returned reader.
    async fn open_session(&self, transport: PendingTransport) -> Result<FrameReader, WsError> {
        let parameters = &self.inner.parameters;
        let (stream, tls_protocol) = transport.establish().await?;
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(TimeoutRead::new(
            read_half,
            parameters.handshake_timeout(),
        ));

        let session = match &self.inner.url {
            Some(url) => {
                let subprotocol = client_handshake(
                    &mut reader,
                    &mut write_half,
                    url,
                    parameters.subprotocols(),
                )
                .await?;
                Session {
                    subprotocol,
                    path: Some(url.path().to_string()),
                    query: url.query().map(String::from),
                    tls_protocol,
                }
            }
            None => {
                let handshake =
                    server_handshake(&mut reader, &mut write_half, parameters.subprotocols())
                        .await?;
                Session {
                    subprotocol: handshake.subprotocol,
                    path: Some(handshake.path),
                    query: handshake.query,
                    tls_protocol,
                }
            }
        };

        *self.inner.session.write() = session;
        *self.inner.writer.lock().await = Some(write_half);
        Ok(reader)
    }

    async fn dispatch(&self, handler: &dyn WsHandler, reader: FrameReader) {
        let id = self.id();
        let (queue_tx, queue_rx) = flume::bounded(QUEUE_CAPACITY);
        let receive_task = receiver::spawn(self.clone(), reader, queue_tx, queue_rx.clone());

        let subprotocol = self.subprotocol();
        self.guard_callback(handler.on_open(self, subprotocol.as_deref()))
            .await;

        loop {
            match tokio::time::timeout(DISPATCH_POLL, queue_rx.recv_async()).await {
                Ok(Ok(message)) => {
                    let is_text = message.is_text();
                    self.guard_callback(handler.on_message(self, message, is_text))
                        .await;
                }
                Ok(Err(_)) => break,
                Err(_) => {
                    if receive_task.is_finished() {
                        break;
                    }
                }
            }
        }

        let dropped = queue_rx.drain().count();
        if dropped > 0 {
            debug!(connection = id, dropped, "Dropped undelivered messages");
        }
        if let Err(e) = receive_task.await {
            error!(connection = id, error = %e, "Receive task failed");
        }
    }

    /// Runs an application callback. An error or panic closes the connection
    /// with INTERNAL_ERROR.
    async fn guard_callback<F>(&self, callback: F)
    where
        F: Future<Output = anyhow::Result<()>>,
    {
        let error = match AssertUnwindSafe(callback).catch_unwind().await {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e,
            Err(panic) => anyhow::anyhow!("handler panicked: {}", panic_message(panic.as_ref())),
        };
        error!(connection = self.id(), "Handler error: {error:#}");
        self.close_due_to(close_code::INTERNAL_ERROR, WsError::Handler(error))
            .await;
    }

    /// Drops the transport and settles the final status.
    async fn release(&self) {
        let writer = self.inner.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let timeout = self.inner.parameters.handshake_timeout();
            let _ = tokio::time::timeout(timeout, writer.shutdown()).await;
        }
        self.inner.shutdown.cancel();
        self.inner.status.lock().finish();
    }
}

/// Fills `buf` from `source`, stopping early only at end of stream.
async fn read_full<R: AsyncRead + Unpin>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#![allow(dead_code)]

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use websocket_engine::frame::{apply_mask, FrameHeader, OpCode};
use websocket_engine::handshake::accept_key;
use websocket_engine::{
    WebSocket, WsConnection, WsError, WsHandler, WsListener, WsMessage, WsParameters, WsStatus,
};

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a handler observed, in callback order.
#[derive(Debug, Clone)]
pub enum Event {
    Open(Option<String>),
    Message(Vec<u8>, bool),
    Error(String),
    Close(WsStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Behavior {
    #[default]
    Record,
    /// Send every message back to the peer.
    Echo,
    /// Fail every `on_message` call.
    FailOnMessage,
    /// Panic in every `on_message` call.
    PanicOnMessage,
}

/// Handler that forwards every callback to a flume channel.
pub struct Recorder {
    events: flume::Sender<Event>,
    behavior: Behavior,
}

impl Recorder {
    pub fn new(behavior: Behavior) -> (Arc<Self>, Events) {
        let (events, rx) = flume::unbounded();
        (Arc::new(Self { events, behavior }), Events { rx })
    }
}

#[async_trait]
impl WsHandler for Recorder {
    async fn on_open(&self, _conn: &WsConnection, subprotocol: Option<&str>) -> Result<()> {
        let _ = self.events.send(Event::Open(subprotocol.map(String::from)));
        Ok(())
    }

    async fn on_message(&self, conn: &WsConnection, mut message: WsMessage, is_text: bool) -> Result<()> {
        let data = message.read_to_vec();
        let _ = self.events.send(Event::Message(data.clone(), is_text));
        match self.behavior {
            Behavior::Record => Ok(()),
            Behavior::Echo => {
                conn.send(&data, is_text).await?;
                Ok(())
            }
            Behavior::FailOnMessage => Err(anyhow!("refusing message")),
            Behavior::PanicOnMessage => panic!("handler blew up"),
        }
    }

    async fn on_error(&self, _conn: Option<&WsConnection>, error: &WsError) {
        let _ = self.events.send(Event::Error(error.to_string()));
    }

    async fn on_close(&self, _conn: &WsConnection, status: WsStatus) {
        let _ = self.events.send(Event::Close(status));
    }
}

/// Receiving side of a [`Recorder`].
pub struct Events {
    rx: flume::Receiver<Event>,
}

impl Events {
    pub async fn next(&self) -> Result<Event> {
        match tokio::time::timeout(EVENT_TIMEOUT, self.rx.recv_async()).await {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(_)) => bail!("handler dropped"),
            Err(_) => bail!("no event within {EVENT_TIMEOUT:?}"),
        }
    }

    /// True if no event arrives within `wait`.
    pub async fn quiet_for(&self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.rx.recv_async())
            .await
            .is_err()
    }

    pub async fn open(&self) -> Result<Option<String>> {
        match self.next().await? {
            Event::Open(subprotocol) => Ok(subprotocol),
            other => bail!("expected open, got {other:?}"),
        }
    }

    pub async fn message(&self) -> Result<(Vec<u8>, bool)> {
        match self.next().await? {
            Event::Message(data, is_text) => Ok((data, is_text)),
            other => bail!("expected message, got {other:?}"),
        }
    }

    /// Waits for `on_close`, returning it with the preceding `on_error`, if any.
    /// Fails if a message or open arrives first.
    pub async fn close(&self) -> Result<(WsStatus, Option<String>)> {
        let mut error = None;
        loop {
            match self.next().await? {
                Event::Error(e) if error.is_none() => error = Some(e),
                Event::Close(status) => return Ok((status, error)),
                other => bail!("expected close, got {other:?}"),
            }
        }
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Endpoint bound to the loopback interface.
pub fn local_endpoint() -> WebSocket {
    WebSocket::new().with_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Starts a listener on a free loopback port.
pub fn create_test_server(
    behavior: Behavior,
    parameters: &WsParameters,
) -> Result<(WebSocket, WsListener, Events)> {
    init_tracing();
    let websocket = local_endpoint();
    let (handler, events) = Recorder::new(behavior);
    let listener = websocket.listen(0, handler, parameters)?;
    Ok((websocket, listener, events))
}

pub fn ws_url(listener: &WsListener, path: &str) -> String {
    format!("ws://127.0.0.1:{}{path}", listener.port())
}

/// Connects a recording client and waits until it is open.
pub async fn connect_client(
    listener: &WsListener,
    parameters: &WsParameters,
) -> Result<(WsConnection, Events)> {
    let (handler, events) = Recorder::new(Behavior::Record);
    let conn = local_endpoint()
        .connect(&ws_url(listener, "/"), handler, parameters)
        .await?;
    events.open().await?;
    Ok((conn, events))
}

/// Polls `condition` until it holds or `EVENT_TIMEOUT` passes.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Reads an HTTP head byte by byte so nothing after it is consumed.
pub async fn read_http_head(stream: &mut TcpStream) -> Result<String> {
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        let byte = stream.read_u8().await?;
        head.push(byte);
    }
    Ok(String::from_utf8(head)?)
}

/// Raw TCP client that has completed the opening handshake with `addr`.
pub async fn raw_client(addr: SocketAddr) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(addr).await?;
    let request = format!(
        "GET / HTTP/1.1\r\nHost: {addr}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await?;
    let response = read_http_head(&mut stream).await?;
    if !response.starts_with("HTTP/1.1 101") {
        bail!("handshake rejected: {response}");
    }
    Ok(stream)
}

/// Answers the opening handshake of an engine client on an accepted socket.
pub async fn raw_server_handshake(stream: &mut TcpStream) -> Result<()> {
    let request = read_http_head(stream).await?;
    let key = request
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("Sec-WebSocket-Key")
                .then(|| value.trim().to_string())
        })
        .ok_or_else(|| anyhow!("no key in request"))?;
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(&key)
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

/// Encodes one frame, masking it when `mask` is given.
pub fn encode_frame(opcode: OpCode, fin: bool, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
    let mut frame = FrameHeader::new(opcode, fin, payload.len() as u64, mask).to_bytes();
    let start = frame.len();
    frame.extend_from_slice(payload);
    if let Some(mask) = mask {
        apply_mask(mask, &mut frame[start..]);
    }
    frame
}

/// Reads one frame, returning its header and unmasked payload.
pub async fn read_frame(stream: &mut TcpStream) -> Result<(FrameHeader, Vec<u8>)> {
    let header = tokio::time::timeout(EVENT_TIMEOUT, FrameHeader::read_from(stream)).await??;
    let mut payload = vec![0u8; header.payload_len as usize];
    stream.read_exact(&mut payload).await?;
    if let Some(mask) = header.mask {
        apply_mask(mask, &mut payload);
    }
    Ok((header, payload))
}

/// Reads frames until a close frame arrives and returns its code.
pub async fn read_close_code(stream: &mut TcpStream) -> Result<u16> {
    loop {
        let (header, payload) = read_frame(stream).await?;
        if header.opcode == OpCode::Close {
            if payload.len() < 2 {
                bail!("close frame without code");
            }
            return Ok(u16::from_be_bytes([payload[0], payload[1]]));
        }
    }
}

//! Opening handshake (RFC 6455 section 4).
//!
//! Both roles read through the same buffered reader the receiver later uses,
//! so frame bytes that arrive right behind the HTTP head are never lost.

use crate::WsError;
use base64::prelude::*;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;
use url::{Position, Url};

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest HTTP head accepted from a peer.
pub const MAX_HEAD_LENGTH: usize = 16 * 1024;

/// Value of the `Server` and `User-Agent` headers.
pub const AGENT: &str = concat!("websocket_engine/", env!("CARGO_PKG_VERSION"));

/// Start line and headers of an HTTP request or response.
///
/// Header names compare case-insensitively. Repeated headers are joined with
/// `", "` when read, and folded continuation lines are unfolded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpHead {
    start_line: String,
    headers: Vec<(String, String)>,
}

impl HttpHead {
    pub fn new(start_line: impl Into<String>) -> Self {
        Self {
            start_line: start_line.into(),
            headers: Vec::new(),
        }
    }

    pub fn start_line(&self) -> &str {
        &self.start_line
    }

    /// Sets a header, replacing any previous value.
    #[must_use]
    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some((_, v)) => *v = value,
            None => self.headers.push((name.to_string(), value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Comma-separated values of a header, trimmed, empty items removed.
    pub fn values(&self, name: &str) -> Vec<String> {
        self.get(name)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// True if a comma-separated header contains `token`, ignoring case.
    pub fn contains_token(&self, name: &str, token: &str) -> bool {
        self.values(name)
            .iter()
            .any(|v| v.eq_ignore_ascii_case(token))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::with_capacity(256);
        out.push_str(&self.start_line);
        out.push_str("\r\n");
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }

    pub(crate) async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<(), WsError> {
        writer.write_all(&self.to_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Reads a head terminated by an empty line.
    pub(crate) async fn read_from<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Self, WsError> {
        let mut limited = reader.take(MAX_HEAD_LENGTH as u64);
        let mut head = Self::default();
        let mut line = Vec::with_capacity(128);

        loop {
            line.clear();
            let n = limited.read_until(b'\n', &mut line).await?;
            if n == 0 || line.last() != Some(&b'\n') {
                if limited.limit() == 0 {
                    return Err(WsError::Handshake("HTTP head too large".into()));
                }
                return Err(WsError::unexpected_eof());
            }

            let text = String::from_utf8_lossy(&line);
            let text = text.trim_end_matches(['\r', '\n']);
            if text.is_empty() {
                if head.start_line.is_empty() {
                    // tolerate blank lines ahead of the start line
                    continue;
                }
                return Ok(head);
            }

            if head.start_line.is_empty() {
                head.start_line = text.to_string();
            } else if text.starts_with([' ', '\t']) {
                let (_, value) = head
                    .headers
                    .last_mut()
                    .ok_or_else(|| WsError::Handshake("folded line without header".into()))?;
                value.push(' ');
                value.push_str(text.trim());
            } else {
                let (name, value) = text
                    .split_once(':')
                    .ok_or_else(|| WsError::Handshake(format!("malformed header line: {text}")))?;
                let (name, value) = (name.trim(), value.trim());
                match head
                    .headers
                    .iter_mut()
                    .find(|(n, _)| n.eq_ignore_ascii_case(name))
                {
                    Some((_, existing)) => {
                        existing.push_str(", ");
                        existing.push_str(value);
                    }
                    None => head.headers.push((name.to_string(), value.to_string())),
                }
            }
        }
    }
}

/// `Sec-WebSocket-Accept` value for a `Sec-WebSocket-Key`.
pub fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WEBSOCKET_GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

/// Fresh random `Sec-WebSocket-Key`.
pub fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(nonce)
}

/// Chooses the subprotocol for a server.
///
/// The first token offered by the client that the server supports wins. A
/// client offering nothing is accepted only by a server that requires nothing.
pub fn negotiate_subprotocol(
    offered: &[String],
    supported: &[String],
) -> Result<Option<String>, WsError> {
    if offered.is_empty() && supported.is_empty() {
        return Ok(None);
    }
    offered
        .iter()
        .find(|p| supported.contains(p))
        .cloned()
        .map(Some)
        .ok_or_else(|| WsError::Handshake("no acceptable subprotocol".into()))
}

/// Outcome of a successful server handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ServerHandshake {
    pub subprotocol: Option<String>,
    pub path: String,
    pub query: Option<String>,
}

/// Validates the client's upgrade request and answers it.
///
/// A rejected request is answered with `400 Bad Request` before the error
/// is returned.
pub(crate) async fn server_handshake<R, W>(
    reader: &mut R,
    writer: &mut W,
    supported: &[String],
) -> Result<ServerHandshake, WsError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let request = HttpHead::read_from(reader).await?;
    match check_request(&request, supported) {
        Ok((handshake, key)) => {
            let mut response = HttpHead::new("HTTP/1.1 101 Switching Protocols")
                .with("Upgrade", "websocket")
                .with("Connection", "Upgrade")
                .with("Sec-WebSocket-Accept", accept_key(&key));
            if let Some(subprotocol) = &handshake.subprotocol {
                response.set("Sec-WebSocket-Protocol", subprotocol.clone());
            }
            response.set("Server", AGENT);
            response.write_to(writer).await?;
            Ok(handshake)
        }
        Err(e) => {
            debug!(error = %e, "Rejecting upgrade request");
            let response = HttpHead::new("HTTP/1.1 400 Bad Request")
                .with("Connection", "close")
                .with("Server", AGENT);
            let _ = response.write_to(writer).await;
            Err(e)
        }
    }
}

fn check_request(request: &HttpHead, supported: &[String]) -> Result<(ServerHandshake, String), WsError> {
    let mut parts = request.start_line().split_whitespace();
    let (method, target) = match (parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(target), Some(_version)) => (method, target),
        _ => {
            return Err(WsError::Handshake(format!(
                "malformed request line: {}",
                request.start_line()
            )))
        }
    };
    if method != "GET" {
        return Err(WsError::Handshake(format!("unexpected method {method}")));
    }
    if !request.contains_token("Upgrade", "websocket") {
        return Err(WsError::Handshake("missing Upgrade: websocket".into()));
    }
    let key = request
        .get("Sec-WebSocket-Key")
        .filter(|k| !k.is_empty())
        .ok_or_else(|| WsError::Handshake("missing Sec-WebSocket-Key".into()))?
        .to_string();
    if let Some(version) = request.get("Sec-WebSocket-Version") {
        if version != "13" {
            return Err(WsError::Handshake(format!("unsupported version {version}")));
        }
    }
    let subprotocol = negotiate_subprotocol(&request.values("Sec-WebSocket-Protocol"), supported)?;

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path.to_string(), Some(query.to_string())),
        None => (target.to_string(), None),
    };
    Ok((
        ServerHandshake {
            subprotocol,
            path,
            query,
        },
        key,
    ))
}

/// Sends the upgrade request for `url` and validates the server's answer.
/// Returns the subprotocol chosen by the server.
pub(crate) async fn client_handshake<R, W>(
    reader: &mut R,
    writer: &mut W,
    url: &Url,
    subprotocols: &[String],
) -> Result<Option<String>, WsError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let key = generate_key();
    let request = client_request(url, &key, subprotocols);
    request.write_to(writer).await?;

    let response = HttpHead::read_from(reader).await?;
    let status = response.start_line().split_whitespace().nth(1);
    if status != Some("101") {
        return Err(WsError::Handshake(format!(
            "unexpected response: {}",
            response.start_line()
        )));
    }
    if response.get("Sec-WebSocket-Accept") != Some(accept_key(&key).as_str()) {
        return Err(WsError::Handshake("Sec-WebSocket-Accept mismatch".into()));
    }
    let chosen = response.get("Sec-WebSocket-Protocol").map(String::from);
    if let Some(chosen) = &chosen {
        if !subprotocols.contains(chosen) {
            return Err(WsError::Handshake(format!(
                "server chose unrequested subprotocol {chosen}"
            )));
        }
    }
    Ok(chosen)
}

fn client_request(url: &Url, key: &str, subprotocols: &[String]) -> HttpHead {
    let target = &url[Position::BeforePath..Position::AfterQuery];
    let target = if target.starts_with('/') {
        target.to_string()
    } else {
        format!("/{target}")
    };
    let host = &url[Position::BeforeHost..Position::AfterPort];

    let mut request = HttpHead::new(format!("GET {target} HTTP/1.1"))
        .with("Host", host)
        .with("Origin", format!("{}://{}", url.scheme(), host))
        .with("Upgrade", "websocket")
        .with("Connection", "Upgrade")
        .with("Sec-WebSocket-Key", key)
        .with("Sec-WebSocket-Version", "13");
    if !subprotocols.is_empty() {
        request.set("Sec-WebSocket-Protocol", subprotocols.join(", "));
    }
    request.set("User-Agent", AGENT);
    request
}

//! Per-connection configuration.
//!
//! [`WsParameters`] is a value type: `listen` and `connect` clone it, so changing
//! a template afterwards never affects connections already in flight.

use crate::WsError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::rustls;

/// Smallest outgoing frame payload.
pub const MIN_PAYLOAD_BUFFER_LENGTH: usize = 126;

/// Smallest accepted value for the incoming message limit.
pub const MIN_MESSAGE_LENGTH: u64 = 2048;

/// Pending-connection backlog used when none is configured.
pub const DEFAULT_BACKLOG: u32 = 1024;

/// Connection and listener parameters.
///
/// # Example
/// ```
/// use websocket_engine::WsParameters;
/// use std::time::Duration;
///
/// let params = WsParameters::default()
///     .with_subprotocols(["chat", "superchat"])
///     .with_idle_timeout(Duration::from_secs(10), true)
///     .with_max_message_length(64 * 1024);
///
/// assert_eq!(params.subprotocols(), ["chat", "superchat"]);
/// assert!(params.is_ping_enabled());
/// ```
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WsParameters {
    /// Subprotocols in order of preference.
    subprotocols: Vec<String>,
    /// TLS and opening/closing handshake timeout.
    handshake_timeout_ms: u64,
    /// Read timeout while the connection is open.
    idle_timeout_ms: u64,
    /// Send a ping on idle timeout instead of closing.
    ping_enabled: bool,
    /// Outgoing frame payload size.
    payload_buffer_length: usize,
    /// Listener backlog, `None` for the default.
    backlog: Option<u32>,
    /// Largest incoming message.
    max_message_length: u64,
    #[serde(skip)]
    tls: TlsParameters,
}

impl Default for WsParameters {
    fn default() -> Self {
        Self {
            subprotocols: Vec::new(),
            handshake_timeout_ms: 4000,
            idle_timeout_ms: 4000,
            ping_enabled: true,
            payload_buffer_length: 32768,
            backlog: None,
            max_message_length: 1024 * 1024,
            tls: TlsParameters::default(),
        }
    }
}

impl fmt::Debug for WsParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsParameters")
            .field("subprotocols", &self.subprotocols)
            .field("handshake_timeout_ms", &self.handshake_timeout_ms)
            .field("idle_timeout_ms", &self.idle_timeout_ms)
            .field("ping_enabled", &self.ping_enabled)
            .field("payload_buffer_length", &self.payload_buffer_length)
            .field("backlog", &self.backlog)
            .field("max_message_length", &self.max_message_length)
            .field("tls", &self.tls)
            .finish()
    }
}

impl WsParameters {
    /// Loads parameters from JSON. Missing fields keep their defaults.
    ///
    /// # Errors
    /// Returns `InvalidParameters` if the JSON does not describe valid parameters.
    pub fn from_json(json: &str) -> Result<Self, WsError> {
        let params: Self = serde_json::from_str(json)
            .map_err(|e| WsError::InvalidParameters(e.to_string()))?;
        let params = params.clamped();
        params.validate()?;
        Ok(params)
    }

    #[must_use]
    pub fn with_subprotocols<I, S>(mut self, subprotocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subprotocols = subprotocols.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Sets the read timeout of an open connection and whether a ping is sent
    /// when it expires. Without ping the connection closes abnormally instead.
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration, ping_enabled: bool) -> Self {
        self.idle_timeout_ms = timeout.as_millis() as u64;
        self.ping_enabled = ping_enabled;
        self
    }

    /// Outgoing frame payload size, at least [`MIN_PAYLOAD_BUFFER_LENGTH`].
    #[must_use]
    pub fn with_payload_buffer_length(mut self, len: usize) -> Self {
        self.payload_buffer_length = len.max(MIN_PAYLOAD_BUFFER_LENGTH);
        self
    }

    #[must_use]
    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = Some(backlog);
        self
    }

    /// Largest incoming message, at least [`MIN_MESSAGE_LENGTH`].
    #[must_use]
    pub fn with_max_message_length(mut self, len: u64) -> Self {
        self.max_message_length = len.max(MIN_MESSAGE_LENGTH);
        self
    }

    #[must_use]
    pub fn with_tls(mut self, tls: TlsParameters) -> Self {
        self.tls = tls;
        self
    }

    pub fn subprotocols(&self) -> &[String] {
        &self.subprotocols
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn is_ping_enabled(&self) -> bool {
        self.ping_enabled
    }

    pub fn payload_buffer_length(&self) -> usize {
        self.payload_buffer_length
    }

    pub fn backlog(&self) -> u32 {
        self.backlog.unwrap_or(DEFAULT_BACKLOG)
    }

    pub fn max_message_length(&self) -> u64 {
        self.max_message_length
    }

    pub fn tls(&self) -> &TlsParameters {
        &self.tls
    }

    /// Checks the parameters before a listener or connection starts.
    ///
    /// # Errors
    /// Returns `InvalidParameters` for zero timeouts or malformed subprotocol tokens.
    pub fn validate(&self) -> Result<(), WsError> {
        if self.handshake_timeout_ms == 0 {
            return Err(WsError::InvalidParameters(
                "handshake timeout must be positive".into(),
            ));
        }
        if self.idle_timeout_ms == 0 {
            return Err(WsError::InvalidParameters(
                "idle timeout must be positive".into(),
            ));
        }
        for subprotocol in &self.subprotocols {
            if subprotocol.is_empty()
                || subprotocol
                    .chars()
                    .any(|c| c == ',' || c.is_whitespace() || c.is_control())
            {
                return Err(WsError::InvalidParameters(format!(
                    "invalid subprotocol token: {subprotocol:?}"
                )));
            }
        }
        Ok(())
    }

    fn clamped(mut self) -> Self {
        self.payload_buffer_length = self.payload_buffer_length.max(MIN_PAYLOAD_BUFFER_LENGTH);
        self.max_message_length = self.max_message_length.max(MIN_MESSAGE_LENGTH);
        self
    }
}

/// TLS configuration handed to `tokio-rustls`.
///
/// Certificates are loaded by the application. A secure listener needs a
/// `server_config`; secure clients fall back to the bundled web PKI roots
/// without client authentication.
#[derive(Clone, Default)]
pub struct TlsParameters {
    pub client_config: Option<Arc<rustls::ClientConfig>>,
    pub server_config: Option<Arc<rustls::ServerConfig>>,
}

impl fmt::Debug for TlsParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsParameters")
            .field("client_config", &self.client_config.is_some())
            .field("server_config", &self.server_config.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let params = WsParameters::default();
        assert!(params.subprotocols().is_empty());
        assert_eq!(params.handshake_timeout(), Duration::from_millis(4000));
        assert_eq!(params.idle_timeout(), Duration::from_millis(4000));
        assert!(params.is_ping_enabled());
        assert_eq!(params.payload_buffer_length(), 32768);
        assert_eq!(params.backlog(), DEFAULT_BACKLOG);
        assert_eq!(params.max_message_length(), 1_048_576);
        assert!(params.tls().client_config.is_none());
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_floors() {
        let params = WsParameters::default()
            .with_payload_buffer_length(10)
            .with_max_message_length(100);
        assert_eq!(params.payload_buffer_length(), MIN_PAYLOAD_BUFFER_LENGTH);
        assert_eq!(params.max_message_length(), MIN_MESSAGE_LENGTH);
    }

    #[test]
    fn test_clone_is_independent() {
        let template = WsParameters::default().with_subprotocols(["chat"]);
        let copy = template.clone();
        let template = template.with_subprotocols(["other"]);
        assert_eq!(copy.subprotocols(), ["chat"]);
        assert_eq!(template.subprotocols(), ["other"]);
    }

    #[test]
    fn test_from_json() {
        let params = WsParameters::from_json(
            r#"{"subprotocols":["chat"],"idle_timeout_ms":500,"ping_enabled":false,"payload_buffer_length":1}"#,
        )
        .unwrap();
        assert_eq!(params.subprotocols(), ["chat"]);
        assert_eq!(params.idle_timeout(), Duration::from_millis(500));
        assert!(!params.is_ping_enabled());
        assert_eq!(params.payload_buffer_length(), MIN_PAYLOAD_BUFFER_LENGTH);
        assert_eq!(params.handshake_timeout(), Duration::from_millis(4000));
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(matches!(
            WsParameters::from_json("{\"idle_timeout_ms\":\"soon\"}"),
            Err(WsError::InvalidParameters(_))
        ));
        assert!(matches!(
            WsParameters::from_json("{\"handshake_timeout_ms\":0}"),
            Err(WsError::InvalidParameters(_))
        ));
    }

    #[test]
    fn test_validate_subprotocol_tokens() {
        let params = WsParameters::default().with_subprotocols(["a,b"]);
        assert!(params.validate().is_err());
        let params = WsParameters::default().with_subprotocols([""]);
        assert!(params.validate().is_err());
        let params = WsParameters::default().with_subprotocols(["chat.v2"]);
        assert!(params.validate().is_ok());
    }
}

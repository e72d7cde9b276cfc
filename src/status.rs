//! Connection state machine and close status.
//!
//! The mutable [`StatusRecord`] lives behind the connection's lock; everything
//! outside the connection only ever sees a cloned [`WsStatus`] snapshot.

use crate::WsError;
use std::fmt;
use std::sync::Arc;

/// Close codes used on the wire and in [`WsStatus::code`].
///
/// See RFC 6455 section 7.4 and the IANA close code registry.
pub mod close_code {
    pub const NORMAL_CLOSURE: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const UNSUPPORTED_DATA: u16 = 1003;
    /// No code was present in the close frame.
    pub const NO_STATUS: u16 = 1005;
    /// Local only, never sent in a close frame.
    pub const ABNORMAL_CLOSURE: u16 = 1006;
    pub const INVALID_DATA: u16 = 1007;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    pub const UNSUPPORTED_EXTENSION: u16 = 1010;
    pub const INTERNAL_ERROR: u16 = 1011;
    pub const SERVICE_RESTART: u16 = 1012;
    pub const TRY_AGAIN_LATER: u16 = 1013;

    /// Lowest code an application may send.
    pub const MIN_APPLICATION: u16 = 1000;
    /// Highest code an application may send.
    pub const MAX_APPLICATION: u16 = 4999;
}

/// Maximum length in bytes of a close reason.
pub const MAX_REASON_LENGTH: usize = 123;

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    /// Transport and opening handshake in progress.
    Connecting,
    /// Messages may be sent and received.
    Open,
    /// A close frame was sent or received; sends fail.
    Closing,
    /// Transport released.
    Closed,
}

/// Point-in-time copy of a connection's status.
#[derive(Debug, Clone)]
pub struct WsStatus {
    pub state: ConnectionState,
    /// Close code, set once the connection leaves [`ConnectionState::Open`]
    /// (or fails to reach it).
    pub code: Option<u16>,
    pub reason: String,
    /// The closing handshake completed.
    pub was_clean: bool,
    /// The peer initiated the close.
    pub closed_remotely: bool,
    pub error: Option<Arc<WsError>>,
}

impl WsStatus {
    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }
}

impl fmt::Display for WsStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "WsStatus({:?},{},\"{}\",{},{}{})",
            self.state,
            self.code.map_or_else(|| "-".to_string(), |c| c.to_string()),
            self.reason,
            if self.was_clean { "clean" } else { "dirty" },
            if self.closed_remotely {
                "remotely"
            } else {
                "locally"
            },
            if self.error.is_some() { ",error" } else { "" }
        )
    }
}

#[derive(Debug)]
pub(crate) struct StatusRecord {
    state: ConnectionState,
    code: Option<u16>,
    reason: String,
    was_clean: bool,
    closed_remotely: bool,
    error: Option<Arc<WsError>>,
}

impl StatusRecord {
    pub(crate) fn new() -> Self {
        Self {
            state: ConnectionState::Connecting,
            code: None,
            reason: String::new(),
            was_clean: false,
            closed_remotely: false,
            error: None,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub(crate) fn snapshot(&self) -> WsStatus {
        WsStatus {
            state: self.state,
            code: self.code,
            reason: self.reason.clone(),
            was_clean: self.was_clean,
            closed_remotely: self.closed_remotely,
            error: self.error.clone(),
        }
    }

    /// Connecting -> Open. Returns false if the connection was closed meanwhile.
    pub(crate) fn open(&mut self) -> bool {
        if self.state != ConnectionState::Connecting {
            return false;
        }
        self.state = ConnectionState::Open;
        true
    }

    /// Records the first error only.
    pub(crate) fn record_error(&mut self, error: WsError) {
        if self.error.is_none() {
            self.error = Some(Arc::new(error));
        }
    }

    /// Open (or Connecting) -> Closing with the given code. Returns false if the
    /// connection is already closing or closed.
    pub(crate) fn begin_close(&mut self, code: u16, reason: String, remotely: bool) -> bool {
        if self.state >= ConnectionState::Closing {
            return false;
        }
        self.state = ConnectionState::Closing;
        self.code = Some(code);
        self.reason = reason;
        self.closed_remotely = remotely;
        true
    }

    /// The closing handshake completed.
    pub(crate) fn mark_clean(&mut self) {
        self.was_clean = true;
    }

    /// Handshake failure before the connection ever opened.
    pub(crate) fn fail_connecting(&mut self, error: WsError) {
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Closing;
            self.code = Some(close_code::PROTOCOL_ERROR);
            self.closed_remotely = false;
        }
        self.record_error(error);
    }

    /// Transport released. Any connection that never got a close code ends abnormally.
    pub(crate) fn finish(&mut self) {
        if self.code.is_none() {
            self.code = Some(close_code::ABNORMAL_CLOSURE);
        }
        self.state = ConnectionState::Closed;
    }
}

/// Replaces codes an application may not send with NO_STATUS.
pub(crate) fn normalize_code(code: u16) -> u16 {
    if (close_code::MIN_APPLICATION..=close_code::MAX_APPLICATION).contains(&code) {
        code
    } else {
        close_code::NO_STATUS
    }
}

/// Cuts `reason` to at most [`MAX_REASON_LENGTH`] bytes on a character boundary.
pub(crate) fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_REASON_LENGTH {
        return reason;
    }
    let mut end = MAX_REASON_LENGTH;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

/// Close frame payload: big-endian code followed by the UTF-8 reason.
/// NO_STATUS is sent as an empty payload.
pub(crate) fn close_payload(code: u16, reason: &str) -> Vec<u8> {
    if code == close_code::NO_STATUS {
        return Vec::new();
    }
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    payload
}

/// Code and reason carried by a received close frame.
pub(crate) fn parse_close_payload(payload: &[u8]) -> (u16, String) {
    if payload.len() < 2 {
        return (close_code::NO_STATUS, String::new());
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
    (code, reason)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_code() {
        assert_eq!(normalize_code(1000), 1000);
        assert_eq!(normalize_code(4999), 4999);
        assert_eq!(normalize_code(999), close_code::NO_STATUS);
        assert_eq!(normalize_code(5000), close_code::NO_STATUS);
        assert_eq!(normalize_code(0), close_code::NO_STATUS);
    }

    #[test]
    fn test_truncate_reason_ascii() {
        let long = "x".repeat(200);
        assert_eq!(truncate_reason(&long).len(), MAX_REASON_LENGTH);
        assert_eq!(truncate_reason("bye"), "bye");
    }

    #[test]
    fn test_truncate_reason_keeps_char_boundary() {
        // 'é' is two bytes, so 62 of them are 124 bytes
        let reason = "é".repeat(62);
        let cut = truncate_reason(&reason);
        assert_eq!(cut.len(), 122);
        assert!(cut.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_close_payload_parse() {
        let payload = close_payload(1000, "bye");
        assert_eq!(payload, vec![0x03, 0xE8, b'b', b'y', b'e']);
        assert_eq!(parse_close_payload(&payload), (1000, "bye".to_string()));
        assert!(close_payload(close_code::NO_STATUS, "ignored").is_empty());
        assert_eq!(parse_close_payload(&[]).0, close_code::NO_STATUS);
        assert_eq!(parse_close_payload(&[0x03]).0, close_code::NO_STATUS);
    }

    #[test]
    fn test_state_transitions() {
        let mut record = StatusRecord::new();
        assert_eq!(record.state(), ConnectionState::Connecting);
        assert!(record.open());
        assert!(!record.open());
        assert!(record.begin_close(1000, "bye".into(), true));
        assert!(!record.begin_close(1001, String::new(), false));
        record.mark_clean();
        record.finish();

        let status = record.snapshot();
        assert_eq!(status.state, ConnectionState::Closed);
        assert_eq!(status.code, Some(1000));
        assert_eq!(status.reason, "bye");
        assert!(status.was_clean);
        assert!(status.closed_remotely);
    }

    #[test]
    fn test_failed_handshake_records_protocol_error() {
        let mut record = StatusRecord::new();
        record.fail_connecting(WsError::Handshake("bad key".into()));
        record.finish();
        let status = record.snapshot();
        assert_eq!(status.code, Some(close_code::PROTOCOL_ERROR));
        assert!(status.error.is_some());
        assert!(!status.was_clean);
    }

    #[test]
    fn test_first_error_wins() {
        let mut record = StatusRecord::new();
        record.record_error(WsError::Timeout);
        record.record_error(WsError::UnsupportedExtension);
        assert!(matches!(
            record.snapshot().error.as_deref(),
            Some(WsError::Timeout)
        ));
    }

    #[test]
    fn test_unclosed_connection_finishes_abnormally() {
        let mut record = StatusRecord::new();
        record.open();
        record.finish();
        assert_eq!(record.snapshot().code, Some(close_code::ABNORMAL_CLOSURE));
    }
}

//! Application callback interface.

use crate::{WsConnection, WsError, WsMessage, WsStatus};
use async_trait::async_trait;

/// Callbacks driven by a connection's dispatch task.
///
/// Per connection the order is: `on_open`, zero or more `on_message`, then at
/// most one `on_error` immediately followed by exactly one `on_close`. A
/// connection whose opening handshake fails skips `on_open`.
///
/// One handler instance is shared by every connection of a listener, so it
/// must be `Send + Sync`. Returning an error (or panicking) from `on_open` or
/// `on_message` closes that connection with INTERNAL_ERROR.
///
/// # Example
///
/// ```no_run
/// use websocket_engine::{WsConnection, WsError, WsHandler, WsMessage, WsStatus};
/// use async_trait::async_trait;
///
/// struct Echo;
///
/// #[async_trait]
/// impl WsHandler for Echo {
///     async fn on_open(&self, _conn: &WsConnection, _subprotocol: Option<&str>) -> anyhow::Result<()> {
///         Ok(())
///     }
///
///     async fn on_message(&self, conn: &WsConnection, mut msg: WsMessage, is_text: bool) -> anyhow::Result<()> {
///         conn.send(&msg.read_to_vec(), is_text).await?;
///         Ok(())
///     }
///
///     async fn on_error(&self, _conn: Option<&WsConnection>, error: &WsError) {
///         eprintln!("error: {error}");
///     }
///
///     async fn on_close(&self, _conn: &WsConnection, status: WsStatus) {
///         println!("closed: {status}");
///     }
/// }
/// ```
#[async_trait]
pub trait WsHandler: Send + Sync + 'static {
    /// The opening handshake completed.
    async fn on_open(&self, conn: &WsConnection, subprotocol: Option<&str>) -> anyhow::Result<()>;

    /// A complete message arrived. Messages are delivered one at a time in
    /// arrival order.
    async fn on_message(
        &self,
        conn: &WsConnection,
        message: WsMessage,
        is_text: bool,
    ) -> anyhow::Result<()>;

    /// `conn` is `None` for a listener-level failure.
    async fn on_error(&self, conn: Option<&WsConnection>, error: &WsError);

    async fn on_close(&self, conn: &WsConnection, status: WsStatus);
}

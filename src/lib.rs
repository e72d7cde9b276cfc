//! RFC 6455 WebSocket client and server engine on tokio.
//!
//! A [`WebSocket`] endpoint starts listeners and opens client connections.
//! Each [`WsConnection`] reports its life cycle to a shared [`WsHandler`]:
//! open, messages in arrival order, then an optional error and the final
//! close status.

pub mod error;
pub mod frame;
pub mod handler;
pub mod handshake;
pub mod listener;
pub mod message;
pub mod parameters;
pub mod status;
pub mod transport;
pub mod websocket;

mod connection;
mod receiver;
mod registry;

pub use connection::WsConnection;
pub use error::WsError;
pub use handler::WsHandler;
pub use handshake::HttpHead;
pub use listener::{AcceptPolicy, WsListener};
pub use message::WsMessage;
pub use parameters::{TlsParameters, WsParameters};
pub use status::{close_code, ConnectionState, WsStatus};
pub use websocket::WebSocket;

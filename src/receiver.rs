//! Inbound half of a connection.
//!
//! Reads frames, reassembles fragmented messages and answers control frames.
//! Completed messages go to the dispatch task over a bounded queue; when the
//! queue is full the receiver stops reading, which pushes back on the peer.
//!
//! While the connection is open an idle read first triggers a ping; a second
//! idle period without the matching pong (or any idle period with ping
//! disabled) closes the connection with ABNORMAL_CLOSURE.

use crate::connection::{panic_message, WsConnection};
use crate::frame::{read_payload, skip_payload, FrameHeader, OpCode, MAX_CONTROL_PAYLOAD};
use crate::status::close_code;
use crate::transport::{BoxedStream, TimeoutRead};
use crate::{WsError, WsMessage};
use futures_util::FutureExt;
use std::io;
use std::panic::AssertUnwindSafe;
use tokio::io::{AsyncBufReadExt, BufReader, ReadHalf};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Payload of every ping we send; the pong must echo it.
const PING_PAYLOAD: &[u8] = b"PingPong";

pub(crate) type FrameReader = BufReader<TimeoutRead<ReadHalf<BoxedStream>>>;

enum Flow {
    Continue,
    Stop,
}

enum Wait {
    Data,
    Idle,
    Eof,
}

/// A fragmented message in progress. `frames` is `None` once the message grew
/// past the limit; its remaining payload is skipped.
struct Partial {
    is_text: bool,
    frames: Option<Vec<Vec<u8>>>,
    length: u64,
}

pub(crate) struct Receiver {
    conn: WsConnection,
    reader: FrameReader,
    queue: flume::Sender<WsMessage>,
    pending: flume::Receiver<WsMessage>,
    expect_masked: bool,
    max_message_length: u64,
    ping_outstanding: bool,
    message: Option<Partial>,
}

/// Spawns the receive task. A panic inside it closes the connection with
/// INTERNAL_ERROR.
pub(crate) fn spawn(
    conn: WsConnection,
    reader: FrameReader,
    queue: flume::Sender<WsMessage>,
    pending: flume::Receiver<WsMessage>,
) -> JoinHandle<()> {
    let receiver = Receiver {
        expect_masked: !conn.is_client_side(),
        max_message_length: conn.parameters().max_message_length(),
        conn: conn.clone(),
        reader,
        queue,
        pending,
        ping_outstanding: false,
        message: None,
    };
    tokio::spawn(async move {
        if let Err(panic) = AssertUnwindSafe(receiver.run()).catch_unwind().await {
            let message = panic_message(panic.as_ref());
            error!(connection = conn.id(), "Receiver panicked: {message}");
            conn.close_due_to(close_code::INTERNAL_ERROR, WsError::Internal(message))
                .await;
        }
    })
}

impl Receiver {
    async fn run(mut self) {
        let id = self.conn.id();
        let shutdown = self.conn.shutdown_token();

        let result = tokio::select! {
            result = self.receive_loop() => result,
            _ = shutdown.cancelled() => {
                debug!(connection = id, "Receiver cancelled");
                Ok(())
            }
        };

        if let Err(error) = result {
            let code = error.close_code();
            if error.is_timeout() {
                info!(connection = id, "Peer idle past timeout");
            } else {
                debug!(connection = id, code, %error, "Receiver stopping");
            }
            self.conn.close_due_to(code, error).await;
        }

        // messages not yet dispatched are dropped
        let dropped = self.pending.drain().count();
        trace!(connection = id, dropped, "Receiver stopped");
    }

    async fn receive_loop(&mut self) -> Result<(), WsError> {
        loop {
            let parameters = self.conn.parameters();
            let timeout = if self.conn.is_open() {
                parameters.idle_timeout()
            } else {
                parameters.handshake_timeout()
            };
            self.reader.get_mut().set_timeout(timeout);

            let wait = match self.reader.fill_buf().await {
                Ok(buf) if buf.is_empty() => Wait::Eof,
                Ok(_) => Wait::Data,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => Wait::Idle,
                Err(e) => return Err(e.into()),
            };
            match wait {
                Wait::Eof => return Err(WsError::unexpected_eof()),
                Wait::Idle => {
                    self.on_idle().await?;
                    continue;
                }
                Wait::Data => {}
            }

            let header = FrameHeader::read_from(&mut self.reader).await?;
            if let Flow::Stop = self.on_frame(header).await? {
                return Ok(());
            }
        }
    }

    async fn on_idle(&mut self) -> Result<(), WsError> {
        if self.conn.is_open()
            && self.conn.parameters().is_ping_enabled()
            && !self.ping_outstanding
        {
            trace!(connection = self.conn.id(), "Idle, sending ping");
            self.ping_outstanding = true;
            return self.conn.send_control(OpCode::Ping, PING_PAYLOAD).await;
        }
        Err(WsError::Timeout)
    }

    async fn on_frame(&mut self, header: FrameHeader) -> Result<Flow, WsError> {
        if header.rsv != 0 {
            return Err(WsError::UnsupportedExtension);
        }
        if header.is_masked() != self.expect_masked {
            return Err(WsError::Protocol(if self.expect_masked {
                "unmasked client frame".into()
            } else {
                "masked server frame".into()
            }));
        }
        if header.opcode.is_control() {
            self.on_control(header).await
        } else {
            self.on_data(header).await
        }
    }

    async fn on_control(&mut self, header: FrameHeader) -> Result<Flow, WsError> {
        if !header.fin || header.payload_len > MAX_CONTROL_PAYLOAD {
            return Err(WsError::Protocol(format!(
                "invalid {:?} frame: fin={}, length={}",
                header.opcode, header.fin, header.payload_len
            )));
        }
        let payload = read_payload(&mut self.reader, &header).await?;

        match header.opcode {
            OpCode::Ping => {
                if self.conn.is_open() {
                    self.conn.send_control(OpCode::Pong, &payload).await?;
                }
            }
            OpCode::Pong => {
                if !self.ping_outstanding || payload != PING_PAYLOAD {
                    return Err(WsError::Protocol("unexpected pong".into()));
                }
                self.ping_outstanding = false;
            }
            OpCode::Close => {
                self.conn.receive_close(&payload).await;
                return Ok(Flow::Stop);
            }
            OpCode::Continuation | OpCode::Text | OpCode::Binary => {
                return Err(WsError::Internal(format!(
                    "{:?} is not a control opcode",
                    header.opcode
                )));
            }
        }
        Ok(Flow::Continue)
    }

    async fn on_data(&mut self, header: FrameHeader) -> Result<Flow, WsError> {
        let mut partial = match (header.opcode, self.message.take()) {
            (OpCode::Continuation, Some(partial)) => partial,
            (OpCode::Continuation, None) => {
                return Err(WsError::Protocol(
                    "continuation frame outside a fragmented message".into(),
                ))
            }
            (_, Some(_)) => {
                return Err(WsError::Protocol(
                    "data frame inside a fragmented message".into(),
                ))
            }
            (opcode, None) => Partial {
                is_text: opcode == OpCode::Text,
                frames: Some(Vec::new()),
                length: 0,
            },
        };

        partial.length = partial.length.saturating_add(header.payload_len);
        if partial.length > self.max_message_length && partial.frames.is_some() {
            partial.frames = None;
            warn!(
                connection = self.conn.id(),
                length = partial.length,
                limit = self.max_message_length,
                "Message too big"
            );
            self.conn
                .close_due_to(
                    close_code::MESSAGE_TOO_BIG,
                    WsError::MessageTooBig {
                        length: partial.length,
                        limit: self.max_message_length,
                    },
                )
                .await;
        }

        match partial.frames.as_mut() {
            Some(frames) => frames.push(read_payload(&mut self.reader, &header).await?),
            None => skip_payload(&mut self.reader, header.payload_len).await?,
        }

        if !header.fin {
            self.message = Some(partial);
            return Ok(Flow::Continue);
        }

        if let Some(frames) = partial.frames {
            let message = WsMessage::new(frames, partial.length, partial.is_text);
            if self.queue.send_async(message).await.is_err() {
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }
}

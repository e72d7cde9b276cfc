//! RFC 6455 frame codec.
//!
//! # Wire format
//!
//! ```text
//! [1 byte: FIN | RSV1-3 | opcode]
//! [1 byte: MASK | length class]
//! [0, 2 or 8 bytes BE: extended payload length]
//! [0 or 4 bytes: masking key]
//! [payload]
//! ```
//!
//! Length classes: below 126 the length is literal, 126 means a 16-bit
//! extension follows, 127 a 64-bit one. Every multi-byte field is read with
//! `read_exact`, so partial socket reads are tolerated and a short stream
//! fails with `UnexpectedEof`.

use crate::WsError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const FIN_BIT: u8 = 0x80;
const RSV_BITS: u8 = 0x70;
const OPCODE_BITS: u8 = 0x0F;
const MASK_BIT: u8 = 0x80;
const LENGTH_BITS: u8 = 0x7F;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: u64 = 125;

/// Largest encoded header: 2 + 8 length bytes + 4 mask bytes.
pub const MAX_HEADER_LENGTH: usize = 14;

/// Payload bytes buffered per read.
const READ_CHUNK: usize = 64 * 1024;

/// Frame opcodes. Reserved values are rejected on decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    pub fn is_data(self) -> bool {
        !self.is_control()
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WsError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            other => Err(WsError::Protocol(format!("Unexpected opcode 0x{other:X}"))),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(value: OpCode) -> Self {
        match value {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// Decoded or to-be-encoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    /// Extension bits (RSV1-3), shifted down to the low three bits.
    pub rsv: u8,
    pub opcode: OpCode,
    pub mask: Option<[u8; 4]>,
    pub payload_len: u64,
}

impl FrameHeader {
    pub fn new(opcode: OpCode, fin: bool, payload_len: u64, mask: Option<[u8; 4]>) -> Self {
        Self {
            fin,
            rsv: 0,
            opcode,
            mask,
            payload_len,
        }
    }

    pub fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    /// Writes the header into `dst`, returning the number of bytes used.
    pub fn encode(&self, dst: &mut [u8; MAX_HEADER_LENGTH]) -> usize {
        dst[0] = u8::from(self.opcode) | ((self.rsv & 0x07) << 4);
        if self.fin {
            dst[0] |= FIN_BIT;
        }

        let mut len = 2;
        if self.payload_len < 126 {
            dst[1] = self.payload_len as u8;
        } else if self.payload_len <= u64::from(u16::MAX) {
            dst[1] = 126;
            dst[2..4].copy_from_slice(&(self.payload_len as u16).to_be_bytes());
            len += 2;
        } else {
            dst[1] = 127;
            dst[2..10].copy_from_slice(&self.payload_len.to_be_bytes());
            len += 8;
        }

        if let Some(mask) = self.mask {
            dst[1] |= MASK_BIT;
            dst[len..len + 4].copy_from_slice(&mask);
            len += 4;
        }
        len
    }

    /// Encodes the header into a freshly allocated buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = [0u8; MAX_HEADER_LENGTH];
        let len = self.encode(&mut buf);
        buf[..len].to_vec()
    }

    /// Reads one frame header.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, WsError> {
        let mut prefix = [0u8; 2];
        reader.read_exact(&mut prefix).await?;
        let [b1, b2] = prefix;

        let fin = b1 & FIN_BIT != 0;
        let rsv = (b1 & RSV_BITS) >> 4;
        let opcode = OpCode::try_from(b1 & OPCODE_BITS)?;

        let payload_len = match b2 & LENGTH_BITS {
            126 => u64::from(reader.read_u16().await?),
            127 => {
                let len = reader.read_u64().await?;
                if len > i64::MAX as u64 {
                    return Err(WsError::Protocol("Invalid payload length".into()));
                }
                len
            }
            literal => u64::from(literal),
        };

        let mask = if b2 & MASK_BIT != 0 {
            let mut mask = [0u8; 4];
            reader.read_exact(&mut mask).await?;
            Some(mask)
        } else {
            None
        };

        Ok(Self {
            fin,
            rsv,
            opcode,
            mask,
            payload_len,
        })
    }
}

/// XORs `payload` with the masking key in place. Masking and unmasking are the
/// same operation.
pub fn apply_mask(mask: [u8; 4], payload: &mut [u8]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Fresh random masking key for a client frame.
pub fn generate_mask() -> [u8; 4] {
    rand::random()
}

/// Reads the payload announced by `header`, unmasking it if needed.
pub(crate) async fn read_payload<R: AsyncRead + Unpin>(
    reader: &mut R,
    header: &FrameHeader,
) -> Result<Vec<u8>, WsError> {
    let len = usize::try_from(header.payload_len)
        .map_err(|_| WsError::Internal("payload length exceeds address space".into()))?;

    // grow with the bytes that actually arrive, never by the claimed length
    let mut payload = Vec::new();
    while payload.len() < len {
        let start = payload.len();
        let chunk = (len - start).min(READ_CHUNK);
        payload.try_reserve(chunk).map_err(|e| {
            WsError::Internal(format!("cannot buffer {len} byte payload: {e}"))
        })?;
        payload.resize(start + chunk, 0);
        reader.read_exact(&mut payload[start..]).await?;
    }
    if let Some(mask) = header.mask {
        apply_mask(mask, &mut payload);
    }
    Ok(payload)
}

/// Discards `len` payload bytes without buffering them.
pub(crate) async fn skip_payload<R: AsyncRead + Unpin>(
    reader: &mut R,
    len: u64,
) -> Result<(), WsError> {
    let skipped = tokio::io::copy(&mut reader.take(len), &mut tokio::io::sink()).await?;
    if skipped != len {
        return Err(WsError::unexpected_eof());
    }
    Ok(())
}

/// Writes one complete frame. `mask` is applied to a copy of the payload.
pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    opcode: OpCode,
    fin: bool,
    payload: &[u8],
    mask: Option<[u8; 4]>,
) -> std::io::Result<()> {
    let header = FrameHeader::new(opcode, fin, payload.len() as u64, mask);
    let mut head = [0u8; MAX_HEADER_LENGTH];
    let head_len = header.encode(&mut head);

    let mut frame = Vec::with_capacity(head_len + payload.len());
    frame.extend_from_slice(&head[..head_len]);
    frame.extend_from_slice(payload);
    if let Some(mask) = mask {
        apply_mask(mask, &mut frame[head_len..]);
    }
    writer.write_all(&frame).await?;
    writer.flush().await
}

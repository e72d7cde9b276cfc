//! Reassembled application messages.

use crate::WsError;
use std::collections::VecDeque;
use std::io::{self, Read};

/// One complete text or binary message.
///
/// The payload is exposed as a forward-only byte stream through
/// [`std::io::Read`]: bytes are handed out once, and a consumed message yields
/// nothing more.
#[derive(Debug)]
pub struct WsMessage {
    frames: VecDeque<Vec<u8>>,
    current: Vec<u8>,
    position: usize,
    remaining: u64,
    is_text: bool,
}

impl WsMessage {
    pub(crate) fn new(frames: Vec<Vec<u8>>, length: u64, is_text: bool) -> Self {
        Self {
            frames: frames.into(),
            current: Vec::new(),
            position: 0,
            remaining: length,
            is_text,
        }
    }

    /// Builds a message from already received frame payloads.
    pub fn from_frames(frames: Vec<Vec<u8>>, is_text: bool) -> Self {
        let length = frames.iter().map(|f| f.len() as u64).sum();
        Self::new(frames, length, is_text)
    }

    /// The message was sent as UTF-8 text.
    pub fn is_text(&self) -> bool {
        self.is_text
    }

    /// Bytes not read yet.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }

    /// Reads every remaining byte.
    pub fn read_to_vec(&mut self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.remaining as usize);
        data.extend_from_slice(&self.current[self.position..]);
        self.current.clear();
        self.position = 0;
        for frame in self.frames.drain(..) {
            data.extend_from_slice(&frame);
        }
        self.remaining = 0;
        data
    }

    /// Reads the remaining bytes as UTF-8 text.
    ///
    /// # Errors
    /// Returns `InvalidData` if the bytes are not valid UTF-8.
    pub fn into_text(mut self) -> Result<String, WsError> {
        String::from_utf8(self.read_to_vec()).map_err(|e| WsError::InvalidData(e.to_string()))
    }

    fn next_frame(&mut self) -> bool {
        match self.frames.pop_front() {
            Some(frame) => {
                self.current = frame;
                self.position = 0;
                true
            }
            None => false,
        }
    }
}

impl Read for WsMessage {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.position >= self.current.len() {
            if !self.next_frame() {
                return Ok(0);
            }
        }
        let available = &self.current[self.position..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.position += n;
        self.remaining -= n as u64;
        Ok(n)
    }
}

//! TCP wire framing.
//!
//! Every frame is a 16-byte ASCII header holding the decimal payload length,
//! space padded on the right, followed by exactly that many payload bytes:
//!
//! ```text
//! 27              {"type":"result","data":""}
//! |<-- 16 bytes ->|<------ 27 bytes ------->|
//! ```
//!
//! The codec only deals in raw payload bytes. JSON decoding lives in
//! [`crate::protocol`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Width of the ASCII length header.
pub const HEADER_LEN: usize = 16;

/// Default upper bound on a single payload (16 MiB).
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("invalid length header {0:?}")]
    InvalidHeader(String),

    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    TooLarge { len: usize, max: usize },

    #[error("connection closed mid-frame: expected {expected} bytes, received {received}")]
    Truncated { expected: usize, received: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Head,
    Data(usize),
}

/// Length-prefixed frame codec for use with `FramedRead` / `FramedWrite`.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    state: DecodeState,
    max_frame_length: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_length(max_frame_length: usize) -> Self {
        Self {
            state: DecodeState::Head,
            max_frame_length,
        }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    fn decode_head(&self, src: &mut BytesMut) -> Result<Option<usize>, FrameError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let head = src.split_to(HEADER_LEN);
        let text = std::str::from_utf8(&head)
            .map_err(|_| FrameError::InvalidHeader(String::from_utf8_lossy(&head).into_owned()))?;
        let len: usize = text
            .trim()
            .parse()
            .map_err(|_| FrameError::InvalidHeader(text.to_string()))?;

        if len > self.max_frame_length {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_frame_length,
            });
        }

        Ok(Some(len))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        let len = match self.state {
            DecodeState::Head => match self.decode_head(src)? {
                Some(len) => {
                    self.state = DecodeState::Data(len);
                    len
                }
                None => {
                    src.reserve(HEADER_LEN - src.len());
                    return Ok(None);
                }
            },
            DecodeState::Data(len) => len,
        };

        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        self.state = DecodeState::Head;
        let payload = src.split_to(len).freeze();
        src.reserve(HEADER_LEN);
        Ok(Some(payload))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }

        match self.state {
            DecodeState::Head if src.is_empty() => Ok(None),
            DecodeState::Head => Err(FrameError::Truncated {
                expected: HEADER_LEN,
                received: src.len(),
            }),
            DecodeState::Data(expected) => {
                let received = src.remaining();
                src.clear();
                self.state = DecodeState::Head;
                Err(FrameError::Truncated { expected, received })
            }
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), FrameError> {
        if payload.len() > self.max_frame_length {
            return Err(FrameError::TooLarge {
                len: payload.len(),
                max: self.max_frame_length,
            });
        }

        dst.reserve(HEADER_LEN + payload.len());
        dst.put_slice(format!("{:<width$}", payload.len(), width = HEADER_LEN).as_bytes());
        dst.put_slice(&payload);
        Ok(())
    }
}

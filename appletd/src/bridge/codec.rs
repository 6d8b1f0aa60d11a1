//! Frame codec for the host byte stream.
//!
//! Wire layout: an 8-byte, space-padded decimal length, one command byte, then
//! each field followed by a single NUL. The length covers everything after the
//! prefix. Works over any AsyncRead/AsyncWrite via `FramedRead`/`FramedWrite`.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Width of the ASCII length prefix.
pub const LENGTH_PREFIX_LEN: usize = 8;

/// Largest payload an 8-digit prefix can describe.
pub const MAX_PAYLOAD_LEN: usize = 99_999_999;

const SEPARATOR: u8 = 0;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The prefix was not a decimal number. The stream cannot be resynchronized.
    #[error("malformed length prefix {0:?}")]
    BadLength(String),

    #[error("payload of {0} bytes does not fit the length prefix")]
    TooLarge(usize),

    #[error("field {0} contains a NUL byte")]
    EmbeddedSeparator(usize),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FrameError {
    /// Errors after which the read loop must not continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::BadLength(_) | Self::Io(_))
    }
}

/// One decoded (or to-be-encoded) protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    code: u8,
    fields: Vec<Bytes>,
}

impl Frame {
    pub fn new(code: u8) -> Self {
        Self {
            code,
            fields: Vec::new(),
        }
    }

    /// Append a field (builder style).
    pub fn field(mut self, value: impl Into<Bytes>) -> Self {
        self.fields.push(value.into());
        self
    }

    pub fn push(&mut self, value: impl Into<Bytes>) {
        self.fields.push(value.into());
    }

    pub fn code(&self) -> u8 {
        self.code
    }

    pub fn fields(&self) -> &[Bytes] {
        &self.fields
    }

    /// `None` means the field was never terminated, which is not the same as
    /// an empty field.
    pub fn get(&self, index: usize) -> Option<&Bytes> {
        self.fields.get(index)
    }

    /// Byte count covered by the length prefix.
    pub fn payload_len(&self) -> usize {
        1 + self.fields.iter().map(|f| f.len() + 1).sum::<usize>()
    }

    pub fn validate(&self) -> Result<(), FrameError> {
        if let Some(index) = self.fields.iter().position(|f| f.contains(&SEPARATOR)) {
            return Err(FrameError::EmbeddedSeparator(index));
        }
        let len = self.payload_len();
        if len > MAX_PAYLOAD_LEN {
            return Err(FrameError::TooLarge(len));
        }
        Ok(())
    }

    fn from_payload(mut payload: Bytes) -> Option<Self> {
        if payload.is_empty() {
            return None;
        }
        let code = payload.get_u8();
        let mut fields = Vec::new();
        while let Some(end) = payload.iter().position(|&b| b == SEPARATOR) {
            let field = payload.split_to(end);
            payload.advance(1);
            fields.push(field);
        }
        if !payload.is_empty() {
            tracing::debug!(
                code,
                trailing_bytes = payload.len(),
                "Dropping unterminated trailing field"
            );
        }
        Some(Self { code, fields })
    }
}

fn parse_length(prefix: &[u8]) -> Result<usize, FrameError> {
    std::str::from_utf8(prefix)
        .ok()
        .map(str::trim)
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| FrameError::BadLength(String::from_utf8_lossy(prefix).into_owned()))
}

/// Length-prefixed, NUL-delimited frame codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if src.len() < LENGTH_PREFIX_LEN {
                src.reserve(LENGTH_PREFIX_LEN - src.len());
                return Ok(None);
            }

            let len = parse_length(&src[..LENGTH_PREFIX_LEN])?;
            let total = LENGTH_PREFIX_LEN + len;
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }

            src.advance(LENGTH_PREFIX_LEN);
            let payload = src.split_to(len).freeze();
            tracing::trace!(payload_len = len, "Decoded frame");

            match Frame::from_payload(payload) {
                Some(frame) => return Ok(Some(frame)),
                None => tracing::warn!("Skipping frame without a command code"),
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.validate()?;
        let len = item.payload_len();
        tracing::trace!(code = item.code, payload_len = len, "Encoding frame");
        if len > 1_000_000 {
            tracing::debug!(
                code = item.code,
                payload_kb = len / 1024,
                "Large frame being encoded"
            );
        }

        dst.reserve(LENGTH_PREFIX_LEN + len);
        dst.put_slice(format!("{len:>8}").as_bytes());
        dst.put_u8(item.code);
        for field in &item.fields {
            dst.put_slice(field);
            dst.put_u8(SEPARATOR);
        }
        Ok(())
    }
}

//! Brace-balanced framing for streams of concatenated JSON objects.
//!
//! The wire protocol carries no length prefix and no delimiter: a frame is
//! the maximal byte run starting at `{` and ending at the `}` that returns
//! the brace-nesting count to zero. CR and LF bytes between frames are
//! tolerated so that operators can drive a server from telnet.
//!
//! String quoting is deliberately not honoured by the framer: a literal `{`
//! or `}` inside a JSON string still counts towards nesting. This is a
//! protocol assumption, not an oversight. Producers must not embed
//! unbalanced braces inside string literals.

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::Decoder;

/// Minimum accepted bound for [`JsonObjectCodec::max_frame_length`].
pub const MIN_FRAME_LENGTH: usize = 64;

/// Maximum accepted bound for [`JsonObjectCodec::max_frame_length`] (16 MiB).
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

pub(crate) fn clamp_frame_length(value: usize) -> usize {
    value.clamp(MIN_FRAME_LENGTH, MAX_FRAME_LENGTH)
}

/// Wire-level errors raised while detecting frame boundaries.
///
/// All variants are fatal for the connection that produced them; none of
/// them is recoverable by re-reading, because the framer has no way to
/// resynchronise on a stream with no delimiters.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    /// The first byte of a frame was neither `{` nor inter-frame CR/LF.
    #[error("invalid frame start: byte {byte:#04x} is not '{{'")]
    InvalidLeadingByte {
        /// The offending byte.
        byte: u8,
    },

    /// The stream ended while a frame was still open.
    #[error("stream ended mid-frame with {have} bytes accumulated")]
    TruncatedFrame {
        /// Bytes accumulated for the unfinished frame.
        have: usize,
    },

    /// A frame grew past the configured maximum without closing its braces.
    #[error("frame exceeds max length: {size} > {max}")]
    OversizedFrame {
        /// Bytes accumulated so far.
        size: usize,
        /// Configured maximum frame length.
        max: usize,
    },
}

impl From<FramingError> for io::Error {
    fn from(err: FramingError) -> Self { io::Error::new(io::ErrorKind::InvalidData, err) }
}

impl FramingError {
    /// Recover a `FramingError` previously converted into an [`io::Error`].
    ///
    /// Returns `None` for I/O errors that did not originate in the framer.
    #[must_use]
    pub fn from_io(err: &io::Error) -> Option<&Self> {
        err.get_ref().and_then(|inner| inner.downcast_ref())
    }
}

/// Streaming decoder extracting brace-balanced JSON objects.
///
/// Implements [`Decoder`] so it can drive a
/// [`FramedRead`](tokio_util::codec::FramedRead) over any `AsyncRead`. The
/// scan position and nesting depth persist across calls, so a frame split
/// over many reads is scanned once, not re-scanned per read.
///
/// # Examples
///
/// ```
/// use bytes::BytesMut;
/// use inlet::codec::JsonObjectCodec;
/// use tokio_util::codec::Decoder;
///
/// let mut codec = JsonObjectCodec::default();
/// let mut buf = BytesMut::from(&b"{\"a\":{\"b\":1}}{\"c\":2}"[..]);
/// let first = codec.decode(&mut buf).expect("decode").expect("frame");
/// assert_eq!(&first[..], b"{\"a\":{\"b\":1}}");
/// let second = codec.decode(&mut buf).expect("decode").expect("frame");
/// assert_eq!(&second[..], b"{\"c\":2}");
/// ```
#[derive(Clone, Debug)]
pub struct JsonObjectCodec {
    max_frame_length: usize,
    /// Bytes of the buffer already scanned for the current frame.
    scanned: usize,
    /// Current brace-nesting depth within the frame being scanned.
    depth: usize,
}

impl JsonObjectCodec {
    /// Construct a codec with a maximum frame length, clamped to
    /// [`MIN_FRAME_LENGTH`]..=[`MAX_FRAME_LENGTH`].
    #[must_use]
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            max_frame_length: clamp_frame_length(max_frame_length),
            scanned: 0,
            depth: 0,
        }
    }

    /// Return the maximum frame length accepted by this codec.
    #[must_use]
    pub fn max_frame_length(&self) -> usize { self.max_frame_length }

    fn mid_frame(&self) -> bool { self.scanned > 0 }
}

impl Default for JsonObjectCodec {
    fn default() -> Self { Self::new(MAX_FRAME_LENGTH) }
}

impl Decoder for JsonObjectCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Inter-frame CR/LF tolerance: strip iteratively, never mid-frame.
        if !self.mid_frame() {
            while let Some(&byte) = src.first() {
                match byte {
                    b'\n' | b'\r' => src.advance(1),
                    b'{' => break,
                    other => return Err(FramingError::InvalidLeadingByte { byte: other }.into()),
                }
            }
        }

        while self.scanned < src.len() {
            match src[self.scanned] {
                b'{' => self.depth += 1,
                b'}' => self.depth = self.depth.saturating_sub(1),
                _ => {}
            }
            self.scanned += 1;

            if self.depth == 0 {
                let frame = src.split_to(self.scanned).freeze();
                self.scanned = 0;
                return Ok(Some(frame));
            }
        }

        if self.scanned > self.max_frame_length {
            return Err(FramingError::OversizedFrame {
                size: self.scanned,
                max: self.max_frame_length,
            }
            .into());
        }

        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(FramingError::TruncatedFrame { have: src.len() }.into()),
        }
    }
}

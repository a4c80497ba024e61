// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Stream framed Kiln messages over blocking byte channels.
// Author: Lukas Bower

//! Blocking frame reader/writer over `std::io` streams.
//!
//! The channel between a session and its worker is a pair of pipes; both
//! directions carry length-prefixed frames. A peer disappearing mid-frame is
//! distinguished from a malformed frame so callers can tell a dead worker
//! from a protocol violation.

use std::io::{self, Read, Write};

use crate::codec::{decode_payload, encode_frame};
use crate::types::{CodecError, Frame, FRAME_LEN_BYTES, MAX_FRAME_LEN};

/// Errors surfaced while moving frames across a byte channel.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The peer closed the channel, at a frame boundary or mid-frame.
    #[error("peer closed the channel")]
    Disconnected,
    /// A frame arrived but could not be decoded.
    #[error("malformed frame: {0}")]
    Codec(#[from] CodecError),
    /// The underlying channel failed.
    #[error("channel i/o failed: {0}")]
    Io(#[from] io::Error),
}

/// Write half of a framed channel.
#[derive(Debug)]
pub struct FrameWriter<W: Write> {
    inner: W,
}

impl<W: Write> FrameWriter<W> {
    /// Wrap a byte sink.
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Encode and write a single frame, flushing the sink.
    pub fn write_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let bytes = encode_frame(frame)?;
        self.inner.write_all(&bytes)?;
        self.inner.flush()?;
        Ok(())
    }
}

/// Read half of a framed channel.
#[derive(Debug)]
pub struct FrameReader<R: Read> {
    inner: R,
    max_frame_len: u32,
}

impl<R: Read> FrameReader<R> {
    /// Wrap a byte source with the default frame ceiling.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            max_frame_len: MAX_FRAME_LEN,
        }
    }

    /// Wrap a byte source with a custom frame ceiling.
    pub fn with_limit(inner: R, max_frame_len: u32) -> Self {
        Self {
            inner,
            max_frame_len,
        }
    }

    /// Read and decode the next frame, blocking until one is available.
    ///
    /// EOF, clean or mid-frame, yields [`TransportError::Disconnected`].
    pub fn read_frame(&mut self) -> Result<Frame, TransportError> {
        let mut len_buf = [0u8; FRAME_LEN_BYTES];
        read_exact_or_gone(&mut self.inner, &mut len_buf)?;
        let declared = u32::from_be_bytes(len_buf);
        if declared == 0 {
            return Err(TransportError::Codec(CodecError::Truncated));
        }
        if declared > self.max_frame_len {
            return Err(TransportError::Codec(CodecError::Oversized {
                len: u64::from(declared),
                max: self.max_frame_len,
            }));
        }
        let mut payload = vec![0u8; declared as usize];
        read_exact_or_gone(&mut self.inner, &mut payload)?;
        Ok(decode_payload(&payload)?)
    }
}

fn read_exact_or_gone<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), TransportError> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
            Err(TransportError::Disconnected)
        }
        Err(err) => Err(TransportError::Io(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProgressBody;
    use std::io::Cursor;

    #[test]
    fn frames_round_trip_through_a_stream() {
        let mut sink = Vec::new();
        {
            let mut writer = FrameWriter::new(&mut sink);
            writer
                .write_frame(&Frame::Progress(ProgressBody::Step {
                    step: 1,
                    message: "compiling M".to_owned(),
                }))
                .expect("write progress");
            writer.write_frame(&Frame::Shutdown).expect("write shutdown");
        }
        let mut reader = FrameReader::new(Cursor::new(sink));
        assert!(matches!(
            reader.read_frame().expect("first frame"),
            Frame::Progress(ProgressBody::Step { step: 1, .. })
        ));
        assert!(matches!(
            reader.read_frame().expect("second frame"),
            Frame::Shutdown
        ));
        assert!(matches!(
            reader.read_frame(),
            Err(TransportError::Disconnected)
        ));
    }

    #[test]
    fn eof_mid_frame_reports_a_dead_peer() {
        let mut sink = Vec::new();
        FrameWriter::new(&mut sink)
            .write_frame(&Frame::Shutdown)
            .expect("write shutdown");
        sink.truncate(sink.len() - 1);
        let mut reader = FrameReader::new(Cursor::new(sink));
        assert!(matches!(
            reader.read_frame(),
            Err(TransportError::Disconnected)
        ));
    }

    #[test]
    fn oversized_declared_length_is_a_codec_error() {
        let bytes = (MAX_FRAME_LEN + 1).to_be_bytes().to_vec();
        let mut reader = FrameReader::new(Cursor::new(bytes));
        assert!(matches!(
            reader.read_frame(),
            Err(TransportError::Codec(CodecError::Oversized { .. }))
        ));
    }
}

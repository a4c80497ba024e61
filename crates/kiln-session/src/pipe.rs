// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Provide in-memory byte pipes for hosting a worker in-process.
// Author: Lukas Bower

//! Blocking in-memory byte pipes.
//!
//! An in-process worker speaks exactly the framed protocol a spawned worker
//! speaks; these pipes stand in for the child's stdin/stdout. Dropping the
//! write half yields end-of-stream on the read half, which is how a killed
//! worker looks to the session.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::mpsc::{channel, Receiver, Sender};

/// Create a connected unidirectional pipe.
pub(crate) fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = channel();
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            pending: VecDeque::new(),
        },
    )
}

/// Write half of an in-memory pipe.
#[derive(Debug)]
pub(crate) struct PipeWriter {
    tx: Sender<Vec<u8>>,
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader is gone"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Read half of an in-memory pipe.
#[derive(Debug)]
pub(crate) struct PipeReader {
    rx: Receiver<Vec<u8>>,
    pending: VecDeque<u8>,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pending.is_empty() {
            match self.rx.recv() {
                Ok(chunk) => self.pending.extend(chunk),
                // All writers dropped: clean end-of-stream.
                Err(_) => return Ok(0),
            }
        }
        let mut written = 0;
        while written < buf.len() {
            match self.pending.pop_front() {
                Some(byte) => {
                    buf[written] = byte;
                    written += 1;
                }
                None => break,
            }
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_cross_the_pipe_in_order() {
        let (mut writer, mut reader) = pipe();
        writer.write_all(b"abc").expect("write");
        writer.write_all(b"def").expect("write");
        let mut buf = [0u8; 6];
        reader.read_exact(&mut buf).expect("read");
        assert_eq!(&buf, b"abcdef");
    }

    #[test]
    fn dropping_the_writer_ends_the_stream() {
        let (writer, mut reader) = pipe();
        drop(writer);
        let mut buf = [0u8; 1];
        assert_eq!(reader.read(&mut buf).expect("read"), 0);
    }
}

// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Pin the on-wire frame discipline the two sides rely on.
// Author: Lukas Bower

//! Wire-level contract checks: tag assignment, length prefix, and stream
//! reassembly across arbitrary chunk boundaries.

use std::io::Read;

use kiln_codec::{
    encode_frame, CompileRequest, Frame, FrameReader, ProgressBody, Request, ResultBody,
    RunOutcome, TransportError, FRAME_LEN_BYTES,
};

#[test]
fn tag_bytes_match_the_protocol_table() {
    let request = Frame::Request(Request::Compile(CompileRequest {
        options: None,
        sources_dir: "/s".to_owned(),
        generate_code: false,
        overlay: Vec::new(),
    }));
    let progress = Frame::Progress(ProgressBody::Step {
        step: 1,
        message: String::new(),
    });
    let result = Frame::Result(ResultBody::Run(RunOutcome::Completed));
    for (frame, tag) in [
        (request, 0x00u8),
        (progress, 0x01),
        (result, 0x02),
        (Frame::Shutdown, 0x03),
    ] {
        let bytes = encode_frame(&frame).expect("encode");
        assert_eq!(bytes[FRAME_LEN_BYTES], tag);
    }
}

#[test]
fn length_prefix_is_big_endian_and_counts_the_payload() {
    let bytes = encode_frame(&Frame::Shutdown).expect("encode");
    let declared = u32::from_be_bytes(bytes[..FRAME_LEN_BYTES].try_into().expect("prefix"));
    assert_eq!(declared as usize, bytes.len() - FRAME_LEN_BYTES);
}

/// Reader delivering one byte at a time, the worst chunking a pipe can do.
struct Trickle {
    bytes: Vec<u8>,
    pos: usize,
}

impl Read for Trickle {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pos >= self.bytes.len() || buf.is_empty() {
            return Ok(0);
        }
        buf[0] = self.bytes[self.pos];
        self.pos += 1;
        Ok(1)
    }
}

#[test]
fn frames_reassemble_from_single_byte_reads() {
    let mut stream = Vec::new();
    stream.extend(
        encode_frame(&Frame::Progress(ProgressBody::Step {
            step: 1,
            message: "Compiling M".to_owned(),
        }))
        .expect("encode"),
    );
    stream.extend(
        encode_frame(&Frame::Result(ResultBody::Run(RunOutcome::Stopped))).expect("encode"),
    );
    let mut reader = FrameReader::new(Trickle {
        bytes: stream,
        pos: 0,
    });
    assert!(matches!(
        reader.read_frame().expect("first frame"),
        Frame::Progress(ProgressBody::Step { step: 1, .. })
    ));
    assert!(matches!(
        reader.read_frame().expect("second frame"),
        Frame::Result(ResultBody::Run(RunOutcome::Stopped))
    ));
    assert!(matches!(
        reader.read_frame(),
        Err(TransportError::Disconnected)
    ));
}

// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Provide wire types and codec primitives for the Kiln session protocol.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Wire types and framed codec for the Kiln compile-session protocol.
//!
//! The protocol couples an interactive session handle to an out-of-process
//! compiler worker: requests flow one way, a stream of progress frames and a
//! single terminal result flow back. Frames are length-prefixed (4-byte
//! big-endian) with a leading tag byte distinguishing request, progress,
//! result and shutdown payloads.

mod codec;
mod frame;
mod types;

pub use codec::{decode_frame, decode_payload, encode_frame};
pub use frame::{FrameReader, FrameWriter, TransportError};
pub use types::*;

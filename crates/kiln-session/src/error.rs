// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Define the session-level error taxonomy.
// Author: Lukas Bower

//! Errors surfaced by session operations.

use std::io;

use kiln_codec::TransportError;
use thiserror::Error;

/// Errors surfaced to callers of session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The handle's remembered token no longer matches the process token; a
    /// newer handle has superseded this one.
    #[error("session handle is stale")]
    StaleSession,
    /// A compile-backed query was issued before the first successful compile,
    /// or after a mutation invalidated the previous result.
    #[error("no compile result is available yet")]
    NoComputedYet,
    /// The worker sent bytes that do not form a valid frame, or a frame that
    /// makes no sense in the current protocol state. Fatal to the worker.
    #[error("worker protocol violation: {0}")]
    ProtocolViolation(String),
    /// The worker's channel reached end-of-stream mid-conversation.
    #[error("worker process is gone")]
    WorkerGone,
    /// The in-flight request was cancelled before its terminal result.
    #[error("request was cancelled")]
    Cancelled,
    /// An operating-system level failure, surfaced as-is.
    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),
}

impl SessionError {
    pub(crate) fn from_transport(err: TransportError) -> Self {
        match err {
            TransportError::Disconnected => Self::WorkerGone,
            TransportError::Codec(inner) => Self::ProtocolViolation(inner.to_string()),
            TransportError::Io(inner) => Self::Io(inner),
        }
    }
}

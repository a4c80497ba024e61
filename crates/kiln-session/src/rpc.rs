// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Drive one progress-streaming request against the worker.
// Author: Lukas Bower

//! Client half of the progress-streaming RPC.
//!
//! One request is in flight at a time. Sending takes the worker lock,
//! verifies the worker is idle (respawning it after a crash), writes the
//! request frame, and hands the read half to a dedicated reader thread.
//! The reader drains worker output into a bounded channel; the caller pulls
//! progress events and finally the terminal result. Frames observed after a
//! cancellation are discarded.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender};

use kiln_codec::{Frame, FrameReader, ProgressBody, Request, ResultBody, TransportError};

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::worker::{BoxRead, Phase, WorkerHandle};

/// Bound on buffered progress events; the worker stalls rather than letting
/// an inattentive client accumulate unbounded frames.
const PROGRESS_CHANNEL_DEPTH: usize = 64;

enum CallEvent {
    Progress(ProgressBody),
    Result(ResultBody),
    Failed(SessionError),
}

/// A single in-flight request. Drained exactly once, never restarted.
pub(crate) struct Call {
    rx: Receiver<CallEvent>,
    handle: WorkerHandle,
    cancelled: bool,
    stashed: Option<CallEvent>,
}

/// Send `request`, returning the call plus whether the worker was freshly
/// (re)spawned for it.
pub(crate) fn start_call(
    handle: &WorkerHandle,
    config: &SessionConfig,
    request: Request,
) -> Result<(Call, bool), SessionError> {
    let mut state = handle.lock();
    let fresh = WorkerHandle::ensure_ready_locked(&mut state, config)?;
    let write_result = match state.writer.as_mut() {
        Some(writer) => writer.write_frame(&Frame::Request(request)),
        None => Err(TransportError::Disconnected),
    };
    if let Err(err) = write_result {
        state.phase = Phase::Crashed;
        state.pending_failure = Some(format!("failed to send request to worker: {err}"));
        return Err(SessionError::from_transport(err));
    }
    let Some(reader) = state.reader.take() else {
        state.phase = Phase::Crashed;
        return Err(SessionError::WorkerGone);
    };
    state.phase = Phase::InRequest;
    drop(state);

    let (tx, rx) = sync_channel(PROGRESS_CHANNEL_DEPTH);
    let reader_handle = handle.clone();
    std::thread::Builder::new()
        .name("kiln-rpc-reader".to_owned())
        .spawn(move || drain(reader, tx, reader_handle))?;
    Ok((
        Call {
            rx,
            handle: handle.clone(),
            cancelled: false,
            stashed: None,
        },
        fresh,
    ))
}

fn drain(mut reader: FrameReader<BoxRead>, tx: SyncSender<CallEvent>, handle: WorkerHandle) {
    loop {
        match reader.read_frame() {
            Ok(Frame::Progress(body)) => {
                // A dropped receiver is fine: keep draining so the reader can
                // be returned at the terminal frame.
                let _ = tx.send(CallEvent::Progress(body));
            }
            Ok(Frame::Result(body)) => {
                let mut state = handle.lock();
                state.reader = Some(reader);
                state.phase = Phase::Idle;
                drop(state);
                let _ = tx.send(CallEvent::Result(body));
                return;
            }
            // Shutdown acknowledgements can race a cancellation; drain on
            // until the channel closes.
            Ok(Frame::Shutdown) => continue,
            Ok(Frame::Request(_)) => {
                let mut state = handle.lock();
                state.phase = Phase::Crashed;
                state.pending_failure = Some("worker echoed a request frame".to_owned());
                drop(state);
                let _ = tx.send(CallEvent::Failed(SessionError::ProtocolViolation(
                    "request frame from worker".to_owned(),
                )));
                return;
            }
            Err(err) => {
                let mut state = handle.lock();
                state.phase = Phase::Crashed;
                if state.cancelling {
                    state.cancelling = false;
                } else if state.pending_failure.is_none() {
                    state.pending_failure = Some(format!("worker request aborted: {err}"));
                }
                drop(state);
                let _ = tx.send(CallEvent::Failed(SessionError::from_transport(err)));
                return;
            }
        }
    }
}

impl Call {
    /// The next buffered progress event, or `None` once the terminal event
    /// is reached (or the call was cancelled).
    pub(crate) fn next_progress(&mut self) -> Option<ProgressBody> {
        if self.cancelled || self.stashed.is_some() {
            return None;
        }
        match self.rx.recv() {
            Ok(CallEvent::Progress(body)) => Some(body),
            Ok(other) => {
                self.stashed = Some(other);
                None
            }
            Err(_) => None,
        }
    }

    /// Abort the request: send a shutdown, tear the worker down, and mark
    /// the call cancelled. The waiting side observes `Cancelled`.
    pub(crate) fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        log::info!("cancelling in-flight worker request");
        let mut state = self.handle.lock();
        if let Some(writer) = state.writer.as_mut() {
            let _ = writer.write_frame(&Frame::Shutdown);
        }
        state.cancelling = true;
        state.kill();
        state.phase = Phase::Crashed;
        state.pending_failure = None;
    }

    /// Block until the terminal event, discarding remaining progress.
    pub(crate) fn wait(mut self) -> Result<ResultBody, SessionError> {
        loop {
            let event = match self.stashed.take() {
                Some(event) => event,
                None => match self.rx.recv() {
                    Ok(event) => event,
                    Err(_) => {
                        return Err(if self.cancelled {
                            SessionError::Cancelled
                        } else {
                            SessionError::WorkerGone
                        })
                    }
                },
            };
            match event {
                CallEvent::Progress(_) => continue,
                CallEvent::Result(body) => {
                    return if self.cancelled {
                        Err(SessionError::Cancelled)
                    } else {
                        Ok(body)
                    }
                }
                CallEvent::Failed(err) => {
                    return Err(if self.cancelled {
                        SessionError::Cancelled
                    } else {
                        err
                    })
                }
            }
        }
    }

    /// Whether `cancel` was called on this handle.
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

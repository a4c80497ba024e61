// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Manage the lifecycle of a session's compiler worker.
// Author: Lukas Bower

//! Parent-side worker lifecycle: spawn, crash bookkeeping, restart,
//! shutdown.
//!
//! A worker is normally this binary re-executed in server mode with its
//! stdin/stdout carrying the framed protocol; stderr passes through for
//! human eyes. Sessions may instead host the worker loop on a thread over
//! in-memory pipes, which exercises the identical protocol without a
//! process boundary.
//!
//! The worker walks `Starting → Idle → InRequest → (Idle | Crashed)`;
//! a crashed worker is respawned by the next request, and a shutdown wins
//! over any pending restart.

use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use kiln_codec::{Frame, FrameReader, FrameWriter, OPTS_SENTINEL, SERVER_FLAG};

use crate::config::{SessionConfig, WorkerMode};
use crate::error::SessionError;
use crate::pipe;
use crate::server;

pub(crate) type BoxRead = Box<dyn Read + Send>;
pub(crate) type BoxWrite = Box<dyn Write + Send>;

/// Where the worker is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Ready for a request.
    Idle,
    /// A request is in flight; its reader thread owns the read half.
    InRequest,
    /// The channel died or was killed; the next request respawns.
    Crashed,
    /// Not running: before the first spawn or after shutdown.
    Down,
}

enum LinkControl {
    Process(Child),
    InProcess(Option<JoinHandle<i32>>),
}

pub(crate) struct WorkerState {
    pub(crate) writer: Option<FrameWriter<BoxWrite>>,
    pub(crate) reader: Option<FrameReader<BoxRead>>,
    control: Option<LinkControl>,
    pub(crate) phase: Phase,
    /// Description of the last crash, surfaced as a diagnostic by the next
    /// compile that completes.
    pub(crate) pending_failure: Option<String>,
    /// Set while a deliberate cancellation tears the link down, so the
    /// resulting channel error is not recorded as a crash.
    pub(crate) cancelling: bool,
}

impl WorkerState {
    /// Tear down the current link, leaving the phase untouched.
    pub(crate) fn kill(&mut self) {
        self.writer = None;
        self.reader = None;
        match self.control.take() {
            Some(LinkControl::Process(mut child)) => {
                let _ = child.kill();
                let _ = child.wait();
            }
            Some(LinkControl::InProcess(handle)) => {
                // With both pipe halves dropped the loop unblocks and exits.
                if let Some(handle) = handle {
                    let _ = handle.join();
                }
            }
            None => {}
        }
    }
}

impl Drop for WorkerState {
    fn drop(&mut self) {
        if let Some(LinkControl::Process(mut child)) = self.control.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Shared handle to one session's worker.
#[derive(Clone)]
pub(crate) struct WorkerHandle {
    state: Arc<Mutex<WorkerState>>,
}

impl WorkerHandle {
    /// Spawn the worker for a fresh session.
    pub(crate) fn spawn(config: &SessionConfig) -> Result<Self, SessionError> {
        let handle = Self {
            state: Arc::new(Mutex::new(WorkerState {
                writer: None,
                reader: None,
                control: None,
                phase: Phase::Down,
                pending_failure: None,
                cancelling: false,
            })),
        };
        {
            let mut state = handle.lock();
            respawn_locked(&mut state, config)?;
        }
        Ok(handle)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().expect("worker state lock poisoned")
    }

    /// Make the worker ready for a request, respawning after a crash.
    /// Returns true when this call produced a fresh worker, whose first
    /// result will not be a diff against any earlier one.
    pub(crate) fn ensure_ready_locked(
        state: &mut WorkerState,
        config: &SessionConfig,
    ) -> Result<bool, SessionError> {
        match state.phase {
            Phase::Idle => Ok(false),
            Phase::InRequest => Err(SessionError::ProtocolViolation(
                "a request is already in flight".to_owned(),
            )),
            Phase::Crashed | Phase::Down => {
                log::info!("restarting worker after {:?}", state.phase);
                respawn_locked(state, config)?;
                Ok(true)
            }
        }
    }

    /// Consume the crash note recorded by the previous failure, if any.
    pub(crate) fn take_pending_failure(&self) -> Option<String> {
        self.lock().pending_failure.take()
    }

    /// Ask the worker to exit and wait for it.
    pub(crate) fn shutdown(&self) -> Result<(), SessionError> {
        let mut state = self.lock();
        if let Some(writer) = state.writer.as_mut() {
            let _ = writer.write_frame(&Frame::Shutdown);
        }
        state.writer = None;
        state.reader = None;
        match state.control.take() {
            Some(LinkControl::Process(mut child)) => {
                let status = child.wait()?;
                log::debug!("worker exited with {status}");
            }
            Some(LinkControl::InProcess(handle)) => {
                if let Some(handle) = handle {
                    let _ = handle.join();
                }
            }
            None => {}
        }
        state.phase = Phase::Down;
        Ok(())
    }
}

fn respawn_locked(state: &mut WorkerState, config: &SessionConfig) -> Result<(), SessionError> {
    state.kill();
    match &config.worker_mode {
        WorkerMode::OwnExecutable => {
            let exe = std::env::current_exe()?;
            spawn_process(state, config, &exe)?;
        }
        WorkerMode::Executable(path) => spawn_process(state, config, path)?,
        WorkerMode::InProcess => spawn_thread(state, config)?,
    }
    state.phase = Phase::Idle;
    state.cancelling = false;
    Ok(())
}

fn spawn_process(
    state: &mut WorkerState,
    config: &SessionConfig,
    exe: &std::path::Path,
) -> Result<(), SessionError> {
    let mut command = Command::new(exe);
    command
        .arg(SERVER_FLAG)
        .args(config.worker_options())
        .arg(OPTS_SENTINEL)
        .arg(&config.temp_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
    if !config.extra_path_dirs.is_empty() {
        let existing = std::env::var_os("PATH").unwrap_or_default();
        let merged = std::env::join_paths(
            config
                .extra_path_dirs
                .iter()
                .cloned()
                .chain(std::env::split_paths(&existing)),
        )
        .map_err(|err| SessionError::Io(std::io::Error::other(err)))?;
        command.env("PATH", merged);
    }
    let mut child = command.spawn()?;
    log::info!("spawned worker pid {}", child.id());
    let stdin = child.stdin.take().ok_or(SessionError::WorkerGone)?;
    let stdout = child.stdout.take().ok_or(SessionError::WorkerGone)?;
    state.writer = Some(FrameWriter::new(Box::new(stdin) as BoxWrite));
    state.reader = Some(FrameReader::new(Box::new(stdout) as BoxRead));
    state.control = Some(LinkControl::Process(child));
    Ok(())
}

fn spawn_thread(state: &mut WorkerState, config: &SessionConfig) -> Result<(), SessionError> {
    let (client_writer, server_reader) = pipe::pipe();
    let (server_writer, client_reader) = pipe::pipe();
    let options = config.worker_options();
    let temp_dir = config.temp_dir.clone();
    let handle = std::thread::Builder::new()
        .name("kiln-worker".to_owned())
        .spawn(move || server::serve_streams(server_reader, server_writer, options, temp_dir))?;
    log::info!("hosting worker in-process");
    state.writer = Some(FrameWriter::new(Box::new(client_writer) as BoxWrite));
    state.reader = Some(FrameReader::new(Box::new(client_reader) as BoxRead));
    state.control = Some(LinkControl::InProcess(Some(handle)));
    Ok(())
}

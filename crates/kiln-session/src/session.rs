// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Expose the client-facing session handle and its operations.
// Author: Lukas Bower

//! The client-facing session handle.
//!
//! A session is a value: mutating operations verify the handle is current
//! against the process token, perform their effect, advance the token, and
//! return a successor handle. A handle that missed a mutation is stale and
//! every operation on it fails. The last compile's output is carried along
//! and invalidated by any file or option mutation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln_codec::{
    CompileRequest, Diagnostic, ProgressBody, Request, ResultBody, RunOutcome, RunRequest,
    SrcSpan,
};

use crate::computed::{ComputedState, ResolvedImport};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::gate::ProcessGate;
use crate::pkgbuild::{self, BuildBackend, ProcessBackend};
use crate::progress::Progress;
use crate::rpc::{self, Call};
use crate::token::{self, StateToken};
use crate::update::{module_file, Mutation, UpdateBatch};
use crate::vfs::OverlayStore;
use crate::worker::WorkerHandle;

/// A live compilation session.
///
/// Cloning is cheap; clones share the worker. Only the handle produced by
/// the most recent successful mutation is current.
#[derive(Clone)]
pub struct IdeSession {
    config: Arc<SessionConfig>,
    token: StateToken,
    worker: WorkerHandle,
    /// Last materialized view, kept across invalidation as the base the
    /// worker's next diff applies to.
    baseline: Option<Arc<ComputedState>>,
    /// User-visible view; absent before the first compile and after any
    /// invalidating mutation.
    computed: Option<Arc<ComputedState>>,
    /// Dynamic options staged since the last compile; `None` means the
    /// worker keeps its current set.
    pending_options: Option<Vec<String>>,
    generate_code: bool,
    run_env: Vec<(String, Option<String>)>,
}

impl IdeSession {
    /// Open a session: create its directories and spawn its worker. The
    /// new handle is current without advancing the process token.
    pub fn init(config: SessionConfig) -> Result<Self, SessionError> {
        config.ensure_dirs()?;
        let worker = WorkerHandle::spawn(&config)?;
        log::info!(
            "session opened over {}",
            config.sources_dir.display()
        );
        Ok(Self {
            config: Arc::new(config),
            token: token::current(),
            worker,
            baseline: None,
            computed: None,
            pending_options: None,
            generate_code: false,
            run_env: Vec::new(),
        })
    }

    /// The session's configuration.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The token this handle remembers. Plain field read; valid on stale
    /// handles.
    #[must_use]
    pub fn token(&self) -> StateToken {
        self.token
    }

    /// Stage `batch` atomically, returning the successor handle. Fast and
    /// local: no compile is triggered, and any previous compile output is
    /// invalidated.
    pub fn update_files(&self, batch: &UpdateBatch) -> Result<Self, SessionError> {
        let _slot = ProcessGate::global().shared();
        let guard = token::lock_checked(self.token)?;
        let mut next = self.clone();
        let mut writes: Vec<(PathBuf, Option<Vec<u8>>)> = Vec::new();
        for mutation in batch.mutations() {
            match mutation {
                Mutation::PutModule { name, contents } => {
                    writes.push((module_file(name), Some(contents.clone())));
                }
                Mutation::DeleteModule { name } => writes.push((module_file(name), None)),
                Mutation::PutDataFile { path, contents } => {
                    writes.push((path.clone(), Some(contents.clone())));
                }
                Mutation::DeleteDataFile { path } => writes.push((path.clone(), None)),
                Mutation::SetOptions(options) => {
                    next.pending_options = Some(options.clone());
                }
                Mutation::SetGenerateCode(enabled) => next.generate_code = *enabled,
                Mutation::SetEnv(pairs) => next.run_env = pairs.clone(),
            }
        }
        OverlayStore::global().apply(writes);
        next.token = guard.advance();
        next.computed = None;
        Ok(next)
    }

    /// Enqueue a recompile of the current snapshot. Fails `StaleSession`
    /// synchronously; on success the token has already advanced, and the
    /// returned handle streams progress before yielding the successor
    /// session.
    pub fn update_session(&self) -> Result<UpdateHandle, SessionError> {
        let _slot = ProcessGate::global().shared();
        let guard = token::lock_checked(self.token)?;
        let request = Request::Compile(CompileRequest {
            options: self.pending_options.clone(),
            sources_dir: self.config.sources_dir.display().to_string(),
            generate_code: self.generate_code,
            overlay: OverlayStore::global().snapshot(),
        });
        let (call, fresh_worker) = rpc::start_call(&self.worker, &self.config, request)?;
        let mut next = self.clone();
        next.token = guard.advance();
        next.computed = None;
        next.pending_options = None;
        if fresh_worker {
            // A respawned worker diffs against nothing.
            next.baseline = None;
        }
        Ok(UpdateHandle { call, next })
    }

    /// Read a source module's current content, overlay first.
    pub fn source_module(&self, name: &str) -> Result<Vec<u8>, SessionError> {
        token::check(self.token)?;
        Ok(OverlayStore::global().read(module_file(name), &self.config.sources_dir)?)
    }

    /// Read a data file's current content, overlay first.
    pub fn data_file(&self, path: &Path) -> Result<Vec<u8>, SessionError> {
        token::check(self.token)?;
        Ok(OverlayStore::global().read(path, &self.config.data_dir)?)
    }

    /// Diagnostics from the last compile.
    pub fn source_errors(&self) -> Result<Vec<Diagnostic>, SessionError> {
        Ok(self.computed()?.source_errors().to_vec())
    }

    /// Modules the last compile loaded successfully.
    pub fn loaded_modules(&self) -> Result<Vec<String>, SessionError> {
        Ok(self.computed()?.loaded_modules().to_vec())
    }

    /// Imports of `module` from the last compile.
    pub fn imports(&self, module: &str) -> Result<Vec<ResolvedImport>, SessionError> {
        Ok(self.computed()?.imports(module))
    }

    /// Completion candidates in scope in `module`.
    pub fn auto_completion(&self, module: &str) -> Result<Vec<String>, SessionError> {
        Ok(self.computed()?.auto_completion(module))
    }

    /// Identifier info per span of `module`.
    pub fn span_info(&self, module: &str) -> Result<Vec<(SrcSpan, String)>, SessionError> {
        Ok(self.computed()?.span_info(module))
    }

    /// Expression type annotations of `module`.
    pub fn exp_types(&self, module: &str) -> Result<Vec<(SrcSpan, String)>, SessionError> {
        Ok(self.computed()?.exp_types(module))
    }

    /// Identifier references inside `module`.
    pub fn use_sites(&self, module: &str) -> Result<Vec<(String, SrcSpan)>, SessionError> {
        Ok(self.computed()?.use_sites(module))
    }

    /// External package dependencies of `module`.
    pub fn pkg_deps(&self, module: &str) -> Result<Vec<(String, Option<String>)>, SessionError> {
        Ok(self.computed()?.pkg_deps(module))
    }

    /// Execute `module.identifier` inside the worker, streaming its output.
    pub fn run_stmt(&self, module: &str, identifier: &str) -> Result<RunHandle, SessionError> {
        let _slot = ProcessGate::global().shared();
        token::check(self.token)?;
        let request = Request::Run(RunRequest {
            module: module.to_owned(),
            identifier: identifier.to_owned(),
            data_dir: self.config.data_dir.display().to_string(),
            env: self.run_env.clone(),
        });
        let (call, _fresh_worker) = rpc::start_call(&self.worker, &self.config, request)?;
        Ok(RunHandle { call })
    }

    /// Build one executable per target from the current snapshot using the
    /// default backend. Returns the builder's exit code.
    pub fn build_executable(&self, targets: &[String]) -> Result<i32, SessionError> {
        self.build_executable_with(targets, &mut ProcessBackend::default(), &mut |_| {})
    }

    /// Build executables with a caller-supplied backend and progress
    /// callback.
    pub fn build_executable_with(
        &self,
        targets: &[String],
        backend: &mut dyn BuildBackend,
        progress: &mut dyn FnMut(&str),
    ) -> Result<i32, SessionError> {
        let _slot = ProcessGate::global().shared();
        token::check(self.token)?;
        let computed = self.computed.as_deref().ok_or(SessionError::NoComputedYet)?;
        pkgbuild::build_executables(&self.config, computed, targets, backend, progress)
    }

    /// Generate documentation for the current snapshot using the default
    /// backend. Returns the builder's exit code.
    pub fn build_doc(&self) -> Result<i32, SessionError> {
        self.build_doc_with(&mut ProcessBackend::default(), &mut |_| {})
    }

    /// Generate documentation with a caller-supplied backend and progress
    /// callback.
    pub fn build_doc_with(
        &self,
        backend: &mut dyn BuildBackend,
        progress: &mut dyn FnMut(&str),
    ) -> Result<i32, SessionError> {
        let _slot = ProcessGate::global().shared();
        token::check(self.token)?;
        let computed = self.computed.as_deref().ok_or(SessionError::NoComputedYet)?;
        pkgbuild::build_doc(&self.config, computed, backend, progress)
    }

    /// End the session: advance the token (staling every handle), stop the
    /// worker, and delete the scratch directory when configured to.
    pub fn shutdown(self) -> Result<(), SessionError> {
        let _slot = ProcessGate::global().shared();
        let guard = token::lock_checked(self.token)?;
        guard.advance();
        self.worker.shutdown()?;
        if self.config.delete_temp_on_shutdown {
            let _ = std::fs::remove_dir_all(&self.config.temp_dir);
        }
        log::info!("session closed");
        Ok(())
    }

    fn computed(&self) -> Result<&ComputedState, SessionError> {
        token::check(self.token)?;
        self.computed
            .as_deref()
            .ok_or(SessionError::NoComputedYet)
    }
}

/// Handle to an in-flight recompile: a finite stream of progress events
/// followed by exactly one successor session.
pub struct UpdateHandle {
    call: Call,
    next: IdeSession,
}

impl UpdateHandle {
    /// The next progress event, or `None` once the stream is exhausted.
    pub fn progress(&mut self) -> Option<Progress> {
        loop {
            match self.call.next_progress()? {
                ProgressBody::Step { step, message } => {
                    return Some(Progress::from_body(step, message))
                }
                // Output frames belong to run requests.
                ProgressBody::Output(_) => continue,
            }
        }
    }

    /// Abort the compile. The worker is torn down and `wait` returns
    /// `Cancelled`; handles derived before the enqueue are already stale.
    pub fn cancel(&mut self) {
        self.call.cancel();
    }

    /// Block until the compile concludes and return the successor session
    /// carrying the new compile output.
    pub fn wait(self) -> Result<IdeSession, SessionError> {
        let body = self.call.wait()?;
        let ResultBody::Computed(update) = body else {
            return Err(SessionError::ProtocolViolation(
                "run result for a compile request".to_owned(),
            ));
        };
        let mut state = ComputedState::apply(self.next.baseline.as_deref(), &update)?;
        if let Some(failure) = self.next.worker.take_pending_failure() {
            state.prepend_other_error(failure);
        }
        let state = Arc::new(state);
        let mut next = self.next;
        next.baseline = Some(Arc::clone(&state));
        next.computed = Some(state);
        Ok(next)
    }
}

/// Handle to a running entry point: a stream of output chunks followed by
/// one terminal outcome.
pub struct RunHandle {
    call: Call,
}

impl RunHandle {
    /// The next chunk of program output, or `None` once the run concluded.
    pub fn output(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.call.next_progress()? {
                ProgressBody::Output(bytes) => return Some(bytes),
                ProgressBody::Step { .. } => continue,
            }
        }
    }

    /// Stop the running computation from outside.
    pub fn interrupt(&mut self) {
        self.call.cancel();
    }

    /// Block until the run concludes. An interrupted run reports
    /// [`RunOutcome::Stopped`].
    pub fn wait(self) -> Result<RunOutcome, SessionError> {
        let interrupted = self.call.is_cancelled();
        match self.call.wait() {
            Ok(ResultBody::Run(outcome)) => Ok(outcome),
            Ok(ResultBody::Computed(_)) => Err(SessionError::ProtocolViolation(
                "compile result for a run request".to_owned(),
            )),
            Err(SessionError::Cancelled) if interrupted => Ok(RunOutcome::Stopped),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerMode;
    use crate::worker::Phase;
    use serial_test::serial;

    fn fresh_session(root: &Path) -> IdeSession {
        OverlayStore::global().clear();
        let mut config = SessionConfig::for_root(root);
        config.worker_mode = WorkerMode::InProcess;
        IdeSession::init(config).expect("init session")
    }

    #[test]
    #[serial]
    fn init_does_not_advance_the_token() {
        let root = tempfile::tempdir().expect("temp root");
        let before = token::current();
        let session = fresh_session(root.path());
        assert_eq!(session.token(), before);
        assert_eq!(token::current(), before);
        session.shutdown().expect("shutdown");
    }

    #[test]
    #[serial]
    fn a_prior_worker_crash_surfaces_in_the_next_compile() {
        let root = tempfile::tempdir().expect("temp root");
        let session = fresh_session(root.path());
        {
            let mut state = session.worker.lock();
            state.kill();
            state.phase = Phase::Crashed;
            state.pending_failure = Some("worker request aborted: injected".to_owned());
        }
        let session = session
            .update_session()
            .expect("enqueue restarts the worker")
            .wait()
            .expect("compile");
        let errors = session.source_errors().expect("errors");
        assert!(
            matches!(
                errors.first(),
                Some(Diagnostic::Other { message }) if message.contains("injected")
            ),
            "expected the injected failure first, got {errors:?}"
        );
        session.shutdown().expect("shutdown");
    }
}

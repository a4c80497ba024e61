// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Provide the interactive compile-session library.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Interactive compilation sessions over an out-of-process compiler worker.
//!
//! A session couples four pieces: a process-wide monotonic state token that
//! certifies handles are current, a virtual file overlay mutated by atomic
//! update batches, a framed progress-streaming RPC to a worker process that
//! owns the compiler engine, and a package-build driver for turning the
//! last compile into executables or documentation. One bad compile never
//! kills the worker; a dead worker is respawned by the next request.

mod computed;
mod config;
mod engine;
mod error;
mod gate;
mod interner;
mod pipe;
mod pkgbuild;
mod progress;
mod rpc;
pub mod server;
mod session;
mod token;
mod update;
mod vfs;
mod worker;

pub use computed::{ComputedState, ResolvedImport};
pub use config::{SessionConfig, WorkerMode};
pub use engine::{
    CompileEngine, EngineBinding, EngineFault, EngineImport, EngineModule, EngineOutput,
    ReferenceEngine, SourceTarget, CRASH_MARKER,
};
pub use error::SessionError;
pub use gate::{ExclusiveGuard, ProcessGate, SharedGuard};
pub use interner::StringArena;
pub use pkgbuild::{
    BuildBackend, BuildLogs, Dependency, ExecutableSpec, PackageDesc, ProcessBackend,
};
pub use progress::Progress;
pub use session::{IdeSession, RunHandle, UpdateHandle};
pub use token::StateToken;
pub use update::{Mutation, UpdateBatch};
pub use vfs::OverlayStore;

pub use kiln_codec::{Diagnostic, RunOutcome, Severity, SrcSpan};

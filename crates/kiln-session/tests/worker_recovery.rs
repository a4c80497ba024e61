// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Exercise crash recovery, cancellation, and entry-point runs.
// Author: Lukas Bower

//! Worker resilience: engine faults, cancellation, restarts, and runs.

use serial_test::serial;
use tempfile::TempDir;

use kiln_session::{
    Diagnostic, IdeSession, OverlayStore, RunOutcome, SessionConfig, SessionError, UpdateBatch,
    WorkerMode, CRASH_MARKER,
};

fn fresh_session() -> (TempDir, IdeSession) {
    OverlayStore::global().clear();
    let root = tempfile::tempdir().expect("temp root");
    let mut config = SessionConfig::for_root(root.path());
    config.worker_mode = WorkerMode::InProcess;
    let session = IdeSession::init(config).expect("init session");
    (root, session)
}

#[test]
#[serial]
fn engine_fault_is_reported_and_recovered() {
    let (_root, session) = fresh_session();
    let session = session
        .update_files(&UpdateBatch::put_module(
            "Bad",
            format!("module Bad where\n{CRASH_MARKER}\n"),
        ))
        .expect("stage crashing module");
    let session = session
        .update_session()
        .expect("enqueue")
        .wait()
        .expect("compile concludes despite the fault");

    let errors = session.source_errors().expect("errors");
    assert!(
        matches!(errors.last(), Some(Diagnostic::Other { .. })),
        "expected a trailing out-of-band failure, got {errors:?}"
    );
    assert!(session.loaded_modules().expect("modules").is_empty());

    // The same worker serves the next compile cleanly.
    let session = session
        .update_files(&UpdateBatch::put_module("Bad", "module Bad where\nx = 1\n"))
        .expect("stage fixed module");
    let session = session
        .update_session()
        .expect("enqueue")
        .wait()
        .expect("clean compile");
    assert!(session.source_errors().expect("errors").is_empty());
    assert_eq!(session.loaded_modules().expect("modules"), vec!["Bad"]);
    session.shutdown().expect("shutdown");
}

#[test]
#[serial]
fn cancellation_stales_the_lineage() {
    let (_root, session) = fresh_session();
    let session = session
        .update_files(&UpdateBatch::put_module("M", "module M where\nx = 1\n"))
        .expect("stage module");
    let mut handle = session.update_session().expect("enqueue");
    handle.cancel();
    assert!(matches!(handle.wait(), Err(SessionError::Cancelled)));

    // The token advanced at enqueue, so the pre-enqueue handle is stale; a
    // fresh session is the recovery path.
    assert!(matches!(
        session.update_files(&UpdateBatch::new()),
        Err(SessionError::StaleSession)
    ));

    let (_root2, replacement) = fresh_session();
    let replacement = replacement
        .update_session()
        .expect("enqueue on fresh session")
        .wait()
        .expect("compile");
    assert!(replacement.source_errors().expect("errors").is_empty());
    replacement.shutdown().expect("shutdown");
}

#[test]
#[serial]
fn dynamic_options_persist_until_replaced() {
    let (_root, session) = fresh_session();
    let batch = UpdateBatch::put_module(
        "M",
        "module M where\nimport qualified Data.Map as Map\nx = 1\n",
    )
    .append(UpdateBatch::options(["-Wall"]));
    let session = session.update_files(&batch).expect("stage module");
    let session = session
        .update_session()
        .expect("enqueue")
        .wait()
        .expect("compile");
    let warned = |errors: &[Diagnostic]| {
        errors.iter().any(
            |diag| matches!(diag, Diagnostic::Src { message, .. } if message.contains("unused")),
        )
    };
    assert!(warned(&session.source_errors().expect("errors")));

    // No option mutation this time: the worker reuses its previous set.
    let session = session
        .update_files(&UpdateBatch::put_module("N", "module N where\ny = 2\n"))
        .expect("stage second module");
    let session = session
        .update_session()
        .expect("enqueue")
        .wait()
        .expect("recompile");
    assert!(warned(&session.source_errors().expect("errors")));

    // Replacing the set wholesale turns the warning off.
    let session = session
        .update_files(&UpdateBatch::options(Vec::<String>::new()))
        .expect("clear options");
    let session = session
        .update_session()
        .expect("enqueue")
        .wait()
        .expect("recompile");
    assert!(!warned(&session.source_errors().expect("errors")));
    session.shutdown().expect("shutdown");
}

#[test]
#[serial]
fn run_streams_output_and_completes() {
    let (_root, session) = fresh_session();
    let batch = UpdateBatch::put_module("M", "module M where\nmain = putStrLn \"hello\"\n")
        .append(UpdateBatch::generate_code(true));
    let session = session.update_files(&batch).expect("stage module");
    let session = session
        .update_session()
        .expect("enqueue")
        .wait()
        .expect("compile");

    let mut run = session.run_stmt("M", "main").expect("start run");
    let mut collected = Vec::new();
    while let Some(chunk) = run.output() {
        collected.extend_from_slice(&chunk);
    }
    assert_eq!(collected, b"hello\n");
    assert_eq!(run.wait().expect("run outcome"), RunOutcome::Completed);

    // Running is read-only: the same handle stays current.
    assert!(session.loaded_modules().is_ok());
    session.shutdown().expect("shutdown");
}

#[test]
#[serial]
fn run_without_code_generation_is_an_engine_exception() {
    let (_root, session) = fresh_session();
    let session = session
        .update_files(&UpdateBatch::put_module(
            "M",
            "module M where\nmain = putStrLn \"hello\"\n",
        ))
        .expect("stage module");
    let session = session
        .update_session()
        .expect("enqueue")
        .wait()
        .expect("compile");
    let run = session.run_stmt("M", "main").expect("start run");
    assert!(matches!(
        run.wait().expect("run outcome"),
        RunOutcome::EngineException(_)
    ));
    session.shutdown().expect("shutdown");
}

#[test]
#[serial]
fn interrupted_run_reports_stopped_and_the_session_recovers() {
    let (_root, session) = fresh_session();
    let batch = UpdateBatch::put_module("M", "module M where\nmain = putStrLn \"hello\"\n")
        .append(UpdateBatch::generate_code(true));
    let session = session.update_files(&batch).expect("stage module");
    let session = session
        .update_session()
        .expect("enqueue")
        .wait()
        .expect("compile");

    let mut run = session.run_stmt("M", "main").expect("start run");
    run.interrupt();
    assert_eq!(run.wait().expect("run outcome"), RunOutcome::Stopped);

    // Running never advances the token, so the handle is still current and
    // the next compile transparently respawns the worker.
    let session = session
        .update_session()
        .expect("enqueue after interrupt")
        .wait()
        .expect("compile after interrupt");
    assert_eq!(session.loaded_modules().expect("modules"), vec!["M"]);
    session.shutdown().expect("shutdown");
}

#[test]
#[serial]
fn crashed_worker_failure_surfaces_in_the_next_compile() {
    let (_root, session) = fresh_session();
    let session = session
        .update_files(&UpdateBatch::put_module("M", "module M where\nx = 1\n"))
        .expect("stage module");
    let mut handle = session.update_session().expect("enqueue");
    handle.cancel();
    assert!(matches!(handle.wait(), Err(SessionError::Cancelled)));

    // Cancellation stales every prior handle; only a fresh session can
    // drive the (restarted) worker again.
    let (_root2, session) = fresh_session();
    let session = session
        .update_session()
        .expect("enqueue")
        .wait()
        .expect("compile");
    assert!(session.source_errors().expect("errors").is_empty());
    session.shutdown().expect("shutdown");
}

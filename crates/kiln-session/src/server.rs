// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Host the compiler engine behind the worker's request loop.
// Author: Lukas Bower

//! Worker-side dispatch loop.
//!
//! The worker owns the compiler engine and speaks the framed protocol over
//! its input/output streams. A compile scans the sources directory, lays
//! the shipped overlay on top, feeds the engine, streams per-module
//! progress, and ships the symbol tables as diffs against the previous
//! compile. An engine fault is converted into a diagnostic and the engine
//! is reset; the worker itself keeps serving.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use kiln_codec::{
    CompileRequest, Computed, Diagnostic, Diff, ExpType, Frame, FrameReader, FrameWriter, Import,
    ModuleDiffs, PkgDep, ProgressBody, Request, ResultBody, RunOutcome, RunRequest, SpanInfo,
    SymbolId, TransportError, UseSite, OPTS_SENTINEL,
};

use crate::engine::{CompileEngine, EngineModule, EngineOutput, ReferenceEngine, SourceTarget};
use crate::gate::ProcessGate;
use crate::interner::StringArena;
use crate::progress::Progress;

/// Entry point for `--server` mode. `args` is everything after the server
/// flag: engine options, the sentinel, then transport parameters.
pub fn serve(args: &[String]) -> i32 {
    let Some(split) = args.iter().position(|arg| arg == OPTS_SENTINEL) else {
        log::error!("missing {OPTS_SENTINEL} sentinel in worker argv");
        return 2;
    };
    let options = args[..split].to_vec();
    let Some(temp_dir) = args.get(split + 1).map(PathBuf::from) else {
        log::error!("missing scratch directory in worker argv");
        return 2;
    };
    let stdin = std::io::stdin().lock();
    let stdout = std::io::stdout().lock();
    serve_streams(stdin, stdout, options, temp_dir)
}

/// Run the worker loop over arbitrary byte streams until shutdown or
/// disconnect. Returns the process exit code.
pub(crate) fn serve_streams<R: Read, W: Write>(
    input: R,
    output: W,
    options: Vec<String>,
    temp_dir: PathBuf,
) -> i32 {
    let (engine, dynamic_options) = ReferenceEngine::boot(&options);
    log::debug!(
        "worker booted with {} static options, scratch at {}",
        options.len(),
        temp_dir.display()
    );
    let mut worker = WorkerLoop {
        engine,
        dynamic_options,
        overlay: BTreeMap::new(),
        symbols: SymbolStore::default(),
    };
    let mut reader = FrameReader::new(input);
    let mut writer = FrameWriter::new(output);
    loop {
        match reader.read_frame() {
            Ok(Frame::Request(Request::Compile(request))) => {
                let computed = worker.compile(request, &mut writer);
                if writer
                    .write_frame(&Frame::Result(ResultBody::Computed(computed)))
                    .is_err()
                {
                    return 1;
                }
            }
            Ok(Frame::Request(Request::Run(request))) => {
                let body = worker.run(request, &mut writer);
                if writer.write_frame(&Frame::Result(body)).is_err() {
                    return 1;
                }
            }
            Ok(Frame::Shutdown) => {
                log::info!("worker shutting down");
                let _ = writer.write_frame(&Frame::Shutdown);
                return 0;
            }
            Ok(Frame::Progress(_)) | Ok(Frame::Result(_)) => {
                log::warn!("unexpected worker-bound frame");
                return 2;
            }
            Err(TransportError::Disconnected) => return 0,
            Err(err) => {
                log::warn!("worker channel failed: {err}");
                return 2;
            }
        }
    }
}

struct WorkerLoop<E> {
    engine: E,
    dynamic_options: Vec<String>,
    overlay: BTreeMap<String, Option<Vec<u8>>>,
    symbols: SymbolStore,
}

impl<E: CompileEngine> WorkerLoop<E> {
    fn compile<W: Write>(
        &mut self,
        request: CompileRequest,
        writer: &mut FrameWriter<W>,
    ) -> Computed {
        if let Some(options) = request.options {
            self.dynamic_options = options;
        }
        self.overlay = request
            .overlay
            .into_iter()
            .map(|entry| (entry.path, entry.contents))
            .collect();

        let mut io_diagnostics = Vec::new();
        let targets = self.collect_targets(Path::new(&request.sources_dir), &mut io_diagnostics);

        let mut current: Option<Progress> = None;
        let result = self.engine.compile(
            &targets,
            &self.dynamic_options,
            request.generate_code,
            &mut |message| {
                let next = match current.take() {
                    None => Progress::start(message),
                    Some(progress) => progress.update(message),
                };
                let _ = writer.write_frame(&Frame::Progress(next.body()));
                current = Some(next);
            },
        );

        match result {
            Ok(output) => {
                let mut diagnostics = io_diagnostics;
                diagnostics.extend(output.diagnostics.iter().cloned());
                self.symbols.absorb(&output, diagnostics)
            }
            Err(fault) => {
                log::warn!("engine fault: {}", fault.message);
                let mut diagnostics = io_diagnostics;
                diagnostics.extend(fault.diagnostics);
                diagnostics.push(Diagnostic::other(fault.message));
                self.engine.reset();
                self.symbols.absorb(&EngineOutput::default(), diagnostics)
            }
        }
    }

    fn run<W: Write>(&mut self, request: RunRequest, writer: &mut FrameWriter<W>) -> ResultBody {
        let _gate = ProcessGate::global().exclusive();
        let mut scope = RunScope::default();
        for (name, value) in &request.env {
            scope.saved_env.push((name.clone(), std::env::var_os(name)));
            match value {
                Some(value) => std::env::set_var(name, value),
                None => std::env::remove_var(name),
            }
        }
        scope.saved_cwd = std::env::current_dir().ok();
        if let Err(err) = std::env::set_current_dir(&request.data_dir) {
            return ResultBody::Run(RunOutcome::EngineException(format!(
                "cannot enter data directory {}: {err}",
                request.data_dir
            )));
        }
        let outcome = self
            .engine
            .run(&request.module, &request.identifier, &mut |bytes| {
                let _ = writer.write_frame(&Frame::Progress(ProgressBody::Output(bytes.to_vec())));
            });
        drop(scope);
        ResultBody::Run(outcome)
    }

    /// The compile target set is (disk scan ∪ overlay puts) − overlay
    /// masks; overlay content always supersedes a same-path disk file.
    fn collect_targets(
        &self,
        sources_dir: &Path,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Vec<SourceTarget> {
        let extensions = self.engine.source_extensions();
        let mut found = BTreeMap::new();
        scan_sources(sources_dir, sources_dir, extensions, &mut found, diagnostics);
        for (path, contents) in &self.overlay {
            if !has_extension(Path::new(path), extensions) {
                continue;
            }
            match contents {
                Some(bytes) => {
                    found.insert(path.clone(), bytes.clone());
                }
                None => {
                    found.remove(path);
                }
            }
        }
        found
            .into_iter()
            .map(|(path, bytes)| SourceTarget { path, bytes })
            .collect()
    }
}

// Restores the environment overlay and working directory on every exit
// path out of a run.
#[derive(Default)]
struct RunScope {
    saved_env: Vec<(String, Option<std::ffi::OsString>)>,
    saved_cwd: Option<PathBuf>,
}

impl Drop for RunScope {
    fn drop(&mut self) {
        if let Some(cwd) = self.saved_cwd.take() {
            let _ = std::env::set_current_dir(cwd);
        }
        for (name, value) in self.saved_env.drain(..) {
            match value {
                Some(value) => std::env::set_var(&name, value),
                None => std::env::remove_var(&name),
            }
        }
    }
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| extensions.contains(&ext))
}

fn scan_sources(
    dir: &Path,
    base: &Path,
    extensions: &[&str],
    found: &mut BTreeMap<String, Vec<u8>>,
    diagnostics: &mut Vec<Diagnostic>,
) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
        Err(err) => {
            diagnostics.push(Diagnostic::other(format!(
                "cannot scan {}: {err}",
                dir.display()
            )));
            return;
        }
    };
    for entry in entries {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if path.is_dir() {
            scan_sources(&path, base, extensions, found, diagnostics);
            continue;
        }
        if !has_extension(&path, extensions) {
            continue;
        }
        let relative = path
            .strip_prefix(base)
            .unwrap_or(&path)
            .to_string_lossy()
            .into_owned();
        match std::fs::read(&path) {
            Ok(bytes) => {
                found.insert(relative, bytes);
            }
            Err(err) => diagnostics.push(Diagnostic::other(format!(
                "cannot read {}: {err}",
                path.display()
            ))),
        }
    }
}

type CategoryMap<T> = BTreeMap<String, BTreeSet<T>>;

/// Worker-side symbol tables plus the interner; diffs every compile's
/// tables against the previous compile's.
#[derive(Default)]
struct SymbolStore {
    arena: StringArena,
    imports: CategoryMap<Import>,
    auto_completion: CategoryMap<SymbolId>,
    span_info: CategoryMap<SpanInfo>,
    pkg_deps: CategoryMap<PkgDep>,
    exp_types: CategoryMap<ExpType>,
    use_sites: CategoryMap<UseSite>,
}

impl SymbolStore {
    fn absorb(&mut self, output: &EngineOutput, diagnostics: Vec<Diagnostic>) -> Computed {
        let broken: BTreeSet<&str> = diagnostics
            .iter()
            .filter(|diag| diag.is_error())
            .filter_map(|diag| match diag {
                Diagnostic::Src { file, .. } => Some(file.as_str()),
                Diagnostic::Other { .. } => None,
            })
            .collect();
        let loaded_modules: Vec<&EngineModule> = output
            .modules
            .iter()
            .filter(|module| !broken.contains(module.file.as_str()))
            .collect();
        let loaded: Vec<String> = loaded_modules
            .iter()
            .map(|module| module.name.clone())
            .collect();

        let mut bindings_by_module: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for module in &loaded_modules {
            bindings_by_module.insert(
                module.name.as_str(),
                module
                    .bindings
                    .iter()
                    .map(|binding| binding.name.as_str())
                    .collect(),
            );
        }

        let mut imports: CategoryMap<Import> = BTreeMap::new();
        let mut auto_completion: CategoryMap<SymbolId> = BTreeMap::new();
        let mut span_info: CategoryMap<SpanInfo> = BTreeMap::new();
        let mut pkg_deps: CategoryMap<PkgDep> = BTreeMap::new();
        let mut exp_types: CategoryMap<ExpType> = BTreeMap::new();
        let mut use_sites: CategoryMap<UseSite> = BTreeMap::new();

        for module in &loaded_modules {
            let name = module.name.clone();

            let import_set = imports.entry(name.clone()).or_default();
            for import in &module.imports {
                import_set.insert(Import {
                    module: self.arena.intern(&import.module),
                    qualified: import.qualified,
                    alias: import.alias.as_deref().map(|alias| self.arena.intern(alias)),
                });
            }

            let completion_set = auto_completion.entry(name.clone()).or_default();
            for binding in &module.bindings {
                completion_set.insert(self.arena.intern(&binding.name));
            }
            for import in &module.imports {
                if let Some(names) = bindings_by_module.get(import.module.as_str()) {
                    for binding in names {
                        completion_set.insert(self.arena.intern(binding));
                    }
                }
            }

            let span_set = span_info.entry(name.clone()).or_default();
            if let Some(decl) = module.decl_span {
                span_set.insert(SpanInfo {
                    span: decl,
                    symbol: self.arena.intern(&module.name),
                });
            }
            for binding in &module.bindings {
                span_set.insert(SpanInfo {
                    span: binding.span,
                    symbol: self.arena.intern(&binding.name),
                });
            }

            let dep_set = pkg_deps.entry(name.clone()).or_default();
            for (package, version) in &module.pkg_deps {
                dep_set.insert(PkgDep {
                    package: self.arena.intern(package),
                    version: version.as_deref().map(|v| self.arena.intern(v)),
                });
            }

            let type_set = exp_types.entry(name.clone()).or_default();
            for binding in &module.bindings {
                if let Some((span, ty)) = &binding.signature {
                    type_set.insert(ExpType {
                        span: *span,
                        ty: self.arena.intern(ty),
                    });
                }
                if let Some((span, ty)) = &binding.inferred {
                    type_set.insert(ExpType {
                        span: *span,
                        ty: self.arena.intern(ty),
                    });
                }
            }

            let use_set = use_sites.entry(name.clone()).or_default();
            for binding in &module.bindings {
                for (symbol, span) in &binding.uses {
                    use_set.insert(UseSite {
                        symbol: self.arena.intern(symbol),
                        span: *span,
                    });
                }
            }
        }

        drop_empty(&mut imports);
        drop_empty(&mut auto_completion);
        drop_empty(&mut span_info);
        drop_empty(&mut pkg_deps);
        drop_empty(&mut exp_types);
        drop_empty(&mut use_sites);

        let computed = Computed {
            diagnostics,
            loaded,
            cache: self.arena.take_delta(),
            imports: diff_category(&self.imports, &imports),
            auto_completion: diff_category(&self.auto_completion, &auto_completion),
            span_info: diff_category(&self.span_info, &span_info),
            pkg_deps: diff_category(&self.pkg_deps, &pkg_deps),
            exp_types: diff_category(&self.exp_types, &exp_types),
            use_sites: diff_category(&self.use_sites, &use_sites),
        };
        self.imports = imports;
        self.auto_completion = auto_completion;
        self.span_info = span_info;
        self.pkg_deps = pkg_deps;
        self.exp_types = exp_types;
        self.use_sites = use_sites;
        computed
    }
}

fn drop_empty<T>(map: &mut CategoryMap<T>) {
    map.retain(|_, set| !set.is_empty());
}

fn diff_category<T: Ord + Clone>(
    old: &CategoryMap<T>,
    new: &CategoryMap<T>,
) -> ModuleDiffs<T> {
    let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    let empty = BTreeSet::new();
    let mut diffs = Vec::new();
    for key in keys {
        let before = old.get(key).unwrap_or(&empty);
        let after = new.get(key).unwrap_or(&empty);
        let diff = Diff {
            added: after.difference(before).cloned().collect(),
            removed: before.difference(after).cloned().collect(),
        };
        if !diff.is_empty() {
            diffs.push((key.clone(), diff));
        }
    }
    diffs
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_codec::SrcSpan;

    #[test]
    fn serve_rejects_malformed_argv() {
        // No sentinel at all.
        assert_eq!(serve(&["-O".to_owned()]), 2);
        // Sentinel but no scratch directory after it.
        assert_eq!(serve(&["-O".to_owned(), OPTS_SENTINEL.to_owned()]), 2);
    }

    fn module(name: &str, file: &str) -> EngineModule {
        EngineModule {
            name: name.to_owned(),
            file: file.to_owned(),
            decl_span: Some(SrcSpan::on_line(1, 8, name.len() as u32)),
            imports: Vec::new(),
            bindings: Vec::new(),
            pkg_deps: vec![("base".to_owned(), None)],
        }
    }

    #[test]
    fn second_compile_ships_only_the_difference() {
        let mut store = SymbolStore::default();
        let first = store.absorb(
            &EngineOutput {
                diagnostics: Vec::new(),
                modules: vec![module("M", "M.hs")],
            },
            Vec::new(),
        );
        assert_eq!(first.loaded, vec!["M".to_owned()]);
        assert_eq!(first.pkg_deps.len(), 1);
        assert_eq!(first.pkg_deps[0].1.added.len(), 1);

        // Identical compile: nothing changed, so no diffs and no new cache
        // entries.
        let second = store.absorb(
            &EngineOutput {
                diagnostics: Vec::new(),
                modules: vec![module("M", "M.hs")],
            },
            Vec::new(),
        );
        assert!(second.pkg_deps.is_empty());
        assert!(second.cache.entries.is_empty());
    }

    #[test]
    fn broken_modules_are_not_loaded() {
        let mut store = SymbolStore::default();
        let output = EngineOutput {
            diagnostics: vec![Diagnostic::error(
                "M.hs",
                SrcSpan::on_line(2, 1, 1),
                "parse error",
            )],
            modules: vec![module("M", "M.hs"), module("N", "N.hs")],
        };
        let diagnostics = output.diagnostics.clone();
        let computed = store.absorb(&output, diagnostics);
        assert_eq!(computed.loaded, vec!["N".to_owned()]);
    }

    #[test]
    fn a_failed_compile_removes_previous_symbols() {
        let mut store = SymbolStore::default();
        store.absorb(
            &EngineOutput {
                diagnostics: Vec::new(),
                modules: vec![module("M", "M.hs")],
            },
            Vec::new(),
        );
        let computed = store.absorb(
            &EngineOutput::default(),
            vec![Diagnostic::other("engine fault")],
        );
        assert!(computed.loaded.is_empty());
        assert_eq!(computed.pkg_deps.len(), 1);
        assert_eq!(computed.pkg_deps[0].1.removed.len(), 1);
    }
}

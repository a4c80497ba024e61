// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Define the compiler engine seam and the built-in reference engine.
// Author: Lukas Bower

//! The seam between the worker loop and the compiler it hosts.
//!
//! The worker treats the engine as opaque: hand it sources and options, get
//! back diagnostics and per-module facts, ask it to run an entry point. The
//! built-in [`ReferenceEngine`] is a line-oriented scanner for
//! Haskell-shaped modules, enough to exercise every session and protocol
//! path with real spans, imports and bindings. Production deployments slot
//! a real compiler behind the same trait.

use std::collections::{BTreeSet, HashMap};

use kiln_codec::{Diagnostic, RunOutcome, SrcSpan};

/// Fault raised by the engine while compiling. Diagnostics collected before
/// the fault are preserved so the worker can surface them.
#[derive(Debug)]
pub struct EngineFault {
    /// Description of the failure.
    pub message: String,
    /// Diagnostics gathered before the engine gave up.
    pub diagnostics: Vec<Diagnostic>,
}

/// One source file handed to the engine, overlay already resolved.
#[derive(Debug, Clone)]
pub struct SourceTarget {
    /// Path relative to the sources root.
    pub path: String,
    /// File content.
    pub bytes: Vec<u8>,
}

/// An import recorded while compiling a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineImport {
    /// Imported module name.
    pub module: String,
    /// True for qualified imports.
    pub qualified: bool,
    /// Local alias, when one was given.
    pub alias: Option<String>,
}

/// A top-level binding recorded while compiling a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineBinding {
    /// Binding name.
    pub name: String,
    /// Where the name is bound.
    pub span: SrcSpan,
    /// Right-hand side text.
    pub body: String,
    /// Declared type, with the signature's span.
    pub signature: Option<(SrcSpan, String)>,
    /// Inferred type of the right-hand side, with its span.
    pub inferred: Option<(SrcSpan, String)>,
    /// References to sibling bindings inside the body.
    pub uses: Vec<(String, SrcSpan)>,
}

/// Facts about one compiled module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineModule {
    /// Module name.
    pub name: String,
    /// Source path relative to the sources root.
    pub file: String,
    /// Where the module name is declared.
    pub decl_span: Option<SrcSpan>,
    /// Imports in declaration order.
    pub imports: Vec<EngineImport>,
    /// Top-level bindings in declaration order.
    pub bindings: Vec<EngineBinding>,
    /// External packages the imports resolve to.
    pub pkg_deps: Vec<(String, Option<String>)>,
}

/// Everything one compile cycle produced.
#[derive(Debug, Clone, Default)]
pub struct EngineOutput {
    /// Errors and warnings in emission order.
    pub diagnostics: Vec<Diagnostic>,
    /// All parsed modules, broken ones included; the worker decides which
    /// count as loaded.
    pub modules: Vec<EngineModule>,
}

/// The compiler hosted by the worker.
pub trait CompileEngine {
    /// File extensions the engine accepts as source modules.
    fn source_extensions(&self) -> &[&str];

    /// Compile the supplied targets under the dynamic option set, invoking
    /// `progress` once per module as it is worked on.
    fn compile(
        &mut self,
        targets: &[SourceTarget],
        dynamic_options: &[String],
        generate_code: bool,
        progress: &mut dyn FnMut(&str),
    ) -> Result<EngineOutput, EngineFault>;

    /// Execute `module.identifier`, streaming produced output.
    fn run(
        &mut self,
        module: &str,
        identifier: &str,
        output: &mut dyn FnMut(&[u8]),
    ) -> RunOutcome;

    /// Discard all compiled state so the next request starts fresh.
    fn reset(&mut self);
}

/// Marker line that makes the reference engine fail deterministically, for
/// exercising crash recovery end to end.
pub const CRASH_MARKER: &str = "-- @crash";

const BASE_VERSION: &str = "4.18.2.0";

#[derive(Debug, Default)]
struct CompiledModule {
    bindings: HashMap<String, String>,
}

/// Built-in line-oriented engine for Haskell-shaped sources.
#[derive(Debug, Default)]
pub struct ReferenceEngine {
    include_dirs: Vec<String>,
    package_dbs: Vec<String>,
    optimize: bool,
    modules: HashMap<String, CompiledModule>,
    code_generated: bool,
}

impl ReferenceEngine {
    /// Boot the engine with its static option set. Options the engine does
    /// not claim are returned as the initial dynamic set.
    pub fn boot(static_options: &[String]) -> (Self, Vec<String>) {
        let mut engine = Self::default();
        let mut leftover = Vec::new();
        let mut args = static_options.iter().peekable();
        while let Some(option) = args.next() {
            if option == "-package-db" {
                if let Some(db) = args.next() {
                    engine.package_dbs.push(db.clone());
                }
            } else if option == "-package" || option == "-hide-package" {
                let _ = args.next();
            } else if let Some(dir) = option.strip_prefix("-i") {
                engine.include_dirs.push(dir.to_owned());
            } else if option.starts_with("-O") {
                engine.optimize = true;
            } else {
                leftover.push(option.clone());
            }
        }
        (engine, leftover)
    }

    /// Package databases the engine was booted with.
    #[must_use]
    pub fn package_dbs(&self) -> &[String] {
        &self.package_dbs
    }

    /// Include roots the engine was booted with.
    #[must_use]
    pub fn include_dirs(&self) -> &[String] {
        &self.include_dirs
    }

    /// Whether an optimization level was requested at boot.
    #[must_use]
    pub fn optimizing(&self) -> bool {
        self.optimize
    }
}

impl CompileEngine for ReferenceEngine {
    fn source_extensions(&self) -> &[&str] {
        &["hs", "lhs"]
    }

    fn compile(
        &mut self,
        targets: &[SourceTarget],
        dynamic_options: &[String],
        generate_code: bool,
        progress: &mut dyn FnMut(&str),
    ) -> Result<EngineOutput, EngineFault> {
        let warn_all = dynamic_options.iter().any(|opt| opt == "-Wall");
        let target_names: BTreeSet<String> = targets
            .iter()
            .map(|target| module_name_of(&target.path, &target.bytes))
            .collect();

        let mut diagnostics = Vec::new();
        let mut modules = Vec::new();
        for target in targets {
            let text = String::from_utf8_lossy(&target.bytes);
            if text.lines().any(|line| line.trim() == CRASH_MARKER) {
                return Err(EngineFault {
                    message: format!("internal engine failure while compiling {}", target.path),
                    diagnostics,
                });
            }
            let module = parse_module(&target.path, &text, warn_all, &target_names, &mut diagnostics);
            progress(&format!("Compiling {}", module.name));
            modules.push(module);
        }

        let broken: BTreeSet<&str> = diagnostics
            .iter()
            .filter(|diag| diag.is_error())
            .filter_map(|diag| match diag {
                Diagnostic::Src { file, .. } => Some(file.as_str()),
                Diagnostic::Other { .. } => None,
            })
            .collect();
        self.modules = modules
            .iter()
            .filter(|module| !broken.contains(module.file.as_str()))
            .map(|module| {
                let compiled = CompiledModule {
                    bindings: module
                        .bindings
                        .iter()
                        .map(|binding| (binding.name.clone(), binding.body.clone()))
                        .collect(),
                };
                (module.name.clone(), compiled)
            })
            .collect();
        self.code_generated = generate_code;

        Ok(EngineOutput {
            diagnostics,
            modules,
        })
    }

    fn run(
        &mut self,
        module: &str,
        identifier: &str,
        output: &mut dyn FnMut(&[u8]),
    ) -> RunOutcome {
        if !self.code_generated {
            return RunOutcome::EngineException(
                "no object code was generated by the last compile".to_owned(),
            );
        }
        let Some(compiled) = self.modules.get(module) else {
            return RunOutcome::EngineException(format!("module {module} is not loaded"));
        };
        let Some(body) = compiled.bindings.get(identifier) else {
            return RunOutcome::EngineException(format!(
                "{module}.{identifier} is not defined"
            ));
        };
        let body = body.trim();
        if let Some(rest) = body.strip_prefix("error") {
            return RunOutcome::EngineException(unquote(rest.trim()).to_owned());
        }
        let printed = if let Some(rest) = body.strip_prefix("putStrLn") {
            unquote(rest.trim()).to_owned()
        } else {
            unquote(body).to_owned()
        };
        output(printed.as_bytes());
        output(b"\n");
        RunOutcome::Completed
    }

    fn reset(&mut self) {
        self.modules.clear();
        self.code_generated = false;
    }
}

fn unquote(text: &str) -> &str {
    text.strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(text)
}

fn module_name_of(path: &str, bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    for line in text.lines() {
        if let Some(rest) = line.trim_start().strip_prefix("module ") {
            if let Some(name) = rest.split_whitespace().next() {
                return trim_module_token(name).to_owned();
            }
        }
    }
    let stem = path
        .strip_suffix(".hs")
        .or_else(|| path.strip_suffix(".lhs"))
        .unwrap_or(path);
    stem.replace('/', ".")
}

fn trim_module_token(token: &str) -> &str {
    token.trim_end_matches(|c: char| !(c.is_alphanumeric() || c == '.' || c == '\'' || c == '_'))
}

fn is_identifier_start(c: char) -> bool {
    c.is_ascii_lowercase() || c == '_'
}

fn is_identifier_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '\''
}

fn parse_module(
    path: &str,
    text: &str,
    warn_all: bool,
    targets: &BTreeSet<String>,
    diagnostics: &mut Vec<Diagnostic>,
) -> EngineModule {
    let mut name = {
        let stem = path
            .strip_suffix(".hs")
            .or_else(|| path.strip_suffix(".lhs"))
            .unwrap_or(path);
        stem.replace('/', ".")
    };
    let mut decl_span = None;
    let mut imports = Vec::new();
    let mut bindings: Vec<EngineBinding> = Vec::new();
    // Line/column where each binding's body text begins, for use sites.
    let mut body_positions: Vec<(u32, u32)> = Vec::new();
    let mut signatures: HashMap<String, (SrcSpan, String)> = HashMap::new();

    let lines: Vec<&str> = text.lines().collect();
    for (idx, raw_line) in lines.iter().enumerate() {
        let line_no = (idx + 1) as u32;
        let line = *raw_line;
        let trimmed = line.trim_start();

        if warn_all && line.contains('\t') {
            diagnostics.push(Diagnostic::warning(
                path,
                SrcSpan::on_line(line_no, 1, line.len() as u32),
                "tab character in indentation",
            ));
        }
        if trimmed.starts_with("--") || trimmed.is_empty() {
            continue;
        }

        if let Some(rest) = trimmed.strip_prefix("module ") {
            if let Some(token) = rest.split_whitespace().next() {
                name = trim_module_token(token).to_owned();
                let col = (line.len() - trimmed.len()) as u32 + 8;
                decl_span = Some(SrcSpan::on_line(line_no, col, name.len() as u32));
            }
            continue;
        }

        if let Some(rest) = trimmed.strip_prefix("import ") {
            imports.push(parse_import(rest));
            continue;
        }

        // Top-level declarations start in column one.
        if line.starts_with(char::is_whitespace) {
            continue;
        }
        if let Some((lhs, rhs)) = split_signature(line) {
            let ident = lhs.trim();
            if !ident.is_empty() && ident.chars().next().is_some_and(is_identifier_start) {
                let span = SrcSpan::on_line(line_no, 1, ident.len() as u32);
                signatures.insert(ident.to_owned(), (span, rhs.trim().to_owned()));
                continue;
            }
        }
        if let Some((lhs, rhs, eq_col)) = split_binding(line) {
            let mut lhs_tokens = lhs.split_whitespace();
            let Some(ident) = lhs_tokens.next() else {
                continue;
            };
            if !ident.chars().next().is_some_and(is_identifier_start) {
                continue;
            }
            if bindings.iter().any(|binding| binding.name == ident) {
                diagnostics.push(Diagnostic::error(
                    path,
                    SrcSpan::on_line(line_no, 1, ident.len() as u32),
                    format!("multiple declarations of {ident}"),
                ));
                continue;
            }
            let mut body = rhs.trim().to_owned();
            let mut body_line = line_no;
            let mut body_col = eq_col + 1 + (rhs.len() - rhs.trim_start().len()) as u32;
            if body.is_empty() {
                // A naked `=` may continue on the next indented line.
                let continuation = lines
                    .get(idx + 1)
                    .filter(|next| {
                        !next.trim().is_empty() && next.starts_with(char::is_whitespace)
                    })
                    .copied();
                match continuation {
                    Some(next) => {
                        body = next.trim().to_owned();
                        body_line = line_no + 1;
                        body_col = (next.len() - next.trim_start().len()) as u32 + 1;
                    }
                    None => {
                        diagnostics.push(Diagnostic::error(
                            path,
                            SrcSpan::on_line(line_no, eq_col, 1),
                            "parse error: missing right-hand side",
                        ));
                        continue;
                    }
                }
            }
            let span = SrcSpan::on_line(line_no, 1, ident.len() as u32);
            let inferred = infer_literal_type(&body)
                .map(|ty| (SrcSpan::on_line(body_line, body_col, body.len() as u32), ty));
            body_positions.push((body_line, body_col));
            bindings.push(EngineBinding {
                name: ident.to_owned(),
                span,
                body,
                signature: None,
                inferred,
                uses: Vec::new(),
            });
        }
    }

    for binding in &mut bindings {
        binding.signature = signatures.remove(&binding.name);
    }

    let names: BTreeSet<String> = bindings.iter().map(|b| b.name.clone()).collect();
    for (binding, (body_line, body_col)) in bindings.iter_mut().zip(body_positions) {
        let body = binding.body.clone();
        binding.uses = find_uses(&body, body_line, body_col, &names, &binding.name);
    }

    if warn_all {
        for import in &imports {
            if !import.qualified {
                continue;
            }
            let needle = format!(
                "{}.",
                import.alias.as_deref().unwrap_or(import.module.as_str())
            );
            if !text.contains(&needle) {
                diagnostics.push(Diagnostic::warning(
                    path,
                    SrcSpan::on_line(1, 1, 1),
                    format!("unused qualified import of {}", import.module),
                ));
            }
        }
    }

    let mut pkg_deps = Vec::new();
    for import in &imports {
        if let Some(dep) = package_for(&import.module, targets) {
            if !pkg_deps.contains(&dep) {
                pkg_deps.push(dep);
            }
        }
    }

    EngineModule {
        name,
        file: path.to_owned(),
        decl_span,
        imports,
        bindings,
        pkg_deps,
    }
}

fn parse_import(rest: &str) -> EngineImport {
    let mut tokens = rest.split_whitespace().peekable();
    let qualified = tokens.peek() == Some(&"qualified");
    if qualified {
        let _ = tokens.next();
    }
    let module = tokens
        .next()
        .map(trim_module_token)
        .unwrap_or_default()
        .to_owned();
    let mut alias = None;
    while let Some(token) = tokens.next() {
        if token == "as" {
            alias = tokens.next().map(|t| trim_module_token(t).to_owned());
            break;
        }
    }
    EngineImport {
        module,
        qualified,
        alias,
    }
}

// A signature line is `name :: Type`; a `::` appearing after an `=` belongs
// to a binding body, not a signature.
fn split_signature(line: &str) -> Option<(&str, &str)> {
    let pos = line.find("::")?;
    if line[..pos].contains('=') {
        return None;
    }
    Some((&line[..pos], &line[pos + 2..]))
}

fn split_binding(line: &str) -> Option<(&str, &str, u32)> {
    let bytes = line.as_bytes();
    for (pos, &byte) in bytes.iter().enumerate() {
        if byte != b'=' {
            continue;
        }
        let prev = pos.checked_sub(1).map(|p| bytes[p]);
        let next = bytes.get(pos + 1);
        if prev == Some(b'=') || prev == Some(b'/') || prev == Some(b'<') || prev == Some(b'>') {
            continue;
        }
        if next == Some(&b'=') {
            continue;
        }
        return Some((&line[..pos], &line[pos + 1..], (pos + 1) as u32));
    }
    None
}

fn infer_literal_type(body: &str) -> Option<String> {
    let body = body.trim();
    if body.starts_with('"') && body.ends_with('"') && body.len() >= 2 {
        return Some("[Char]".to_owned());
    }
    if !body.is_empty() && body.chars().all(|c| c.is_ascii_digit()) {
        return Some("Integer".to_owned());
    }
    None
}

fn find_uses(
    body: &str,
    body_line: u32,
    body_col: u32,
    names: &BTreeSet<String>,
    own_name: &str,
) -> Vec<(String, SrcSpan)> {
    let mut uses = Vec::new();
    let mut prev: Option<char> = None;
    let mut chars = body.char_indices().peekable();
    while let Some((start, c)) = chars.next() {
        // A token starts only at a word boundary; `ap` inside `Map.x` is
        // not a reference.
        let boundary = !prev.is_some_and(|p| is_identifier_char(p) || p == '.');
        prev = Some(c);
        if !is_identifier_start(c) || !boundary {
            continue;
        }
        let mut end = start + c.len_utf8();
        while let Some(&(idx, next)) = chars.peek() {
            if is_identifier_char(next) {
                end = idx + next.len_utf8();
                chars.next();
            } else {
                break;
            }
        }
        let token = &body[start..end];
        if token != own_name && names.contains(token) {
            uses.push((
                token.to_owned(),
                SrcSpan::on_line(body_line, body_col + start as u32, token.len() as u32),
            ));
        }
    }
    uses
}

fn package_for(module: &str, targets: &BTreeSet<String>) -> Option<(String, Option<String>)> {
    if targets.contains(module) {
        return None;
    }
    let root = module.split('.').next().unwrap_or(module);
    match root {
        "Prelude" | "Data" | "Control" | "System" | "Text" | "Foreign" | "Numeric" | "GHC" => {
            Some(("base".to_owned(), Some(BASE_VERSION.to_owned())))
        }
        other => Some((other.to_lowercase(), None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(path: &str, text: &str) -> SourceTarget {
        SourceTarget {
            path: path.to_owned(),
            bytes: text.as_bytes().to_vec(),
        }
    }

    fn compile(
        engine: &mut ReferenceEngine,
        targets: &[SourceTarget],
        options: &[&str],
    ) -> EngineOutput {
        let options: Vec<String> = options.iter().map(|s| (*s).to_owned()).collect();
        let mut steps = Vec::new();
        engine
            .compile(targets, &options, true, &mut |msg| {
                steps.push(msg.to_owned())
            })
            .expect("compile")
    }

    #[test]
    fn clean_module_yields_bindings_and_no_errors() {
        let (mut engine, _) = ReferenceEngine::boot(&[]);
        let output = compile(
            &mut engine,
            &[target("M.hs", "module M where\nx = 1\ny = x\n")],
            &[],
        );
        assert!(output.diagnostics.is_empty());
        assert_eq!(output.modules.len(), 1);
        let module = &output.modules[0];
        assert_eq!(module.name, "M");
        assert_eq!(module.bindings.len(), 2);
        assert_eq!(module.bindings[1].uses, vec![(
            "x".to_owned(),
            SrcSpan::on_line(3, 5, 1)
        )]);
    }

    #[test]
    fn missing_rhs_is_a_parse_error() {
        let (mut engine, _) = ReferenceEngine::boot(&[]);
        let output = compile(&mut engine, &[target("M.hs", "module M where\nx =")], &[]);
        assert_eq!(output.diagnostics.len(), 1);
        assert!(output.diagnostics[0].is_error());
    }

    #[test]
    fn crash_marker_faults_the_engine() {
        let (mut engine, _) = ReferenceEngine::boot(&[]);
        let err = engine
            .compile(
                &[target("Bad.hs", "module Bad where\n-- @crash\n")],
                &[],
                false,
                &mut |_| {},
            )
            .expect_err("engine fault");
        assert!(err.message.contains("Bad.hs"));
    }

    #[test]
    fn imports_resolve_to_packages() {
        let (mut engine, _) = ReferenceEngine::boot(&[]);
        let output = compile(
            &mut engine,
            &[
                target("M.hs", "module M where\nimport Data.List\nimport Helper\nx = 1\n"),
                target("Helper.hs", "module Helper where\nh = 2\n"),
            ],
            &[],
        );
        let module = &output.modules[0];
        assert_eq!(module.pkg_deps.len(), 1);
        assert_eq!(module.pkg_deps[0].0, "base");
        assert!(module.pkg_deps[0].1.is_some());
    }

    #[test]
    fn run_prints_literal_bindings() {
        let (mut engine, _) = ReferenceEngine::boot(&[]);
        compile(
            &mut engine,
            &[target("M.hs", "module M where\nmain = putStrLn \"hello\"\n")],
            &[],
        );
        let mut collected = Vec::new();
        let outcome = engine.run("M", "main", &mut |bytes| {
            collected.extend_from_slice(bytes)
        });
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(collected, b"hello\n");
    }

    #[test]
    fn run_without_code_generation_is_an_exception() {
        let (mut engine, _) = ReferenceEngine::boot(&[]);
        let options: Vec<String> = Vec::new();
        engine
            .compile(
                &[target("M.hs", "module M where\nmain = 1\n")],
                &options,
                false,
                &mut |_| {},
            )
            .expect("compile");
        let outcome = engine.run("M", "main", &mut |_| {});
        assert!(matches!(outcome, RunOutcome::EngineException(_)));
    }

    #[test]
    fn boot_partitions_static_from_dynamic_options() {
        let options = vec![
            "-package-db".to_owned(),
            "/pkg/db".to_owned(),
            "-isrc".to_owned(),
            "-O2".to_owned(),
            "-Wall".to_owned(),
            "-XScopedTypeVariables".to_owned(),
        ];
        let (engine, leftover) = ReferenceEngine::boot(&options);
        assert_eq!(engine.package_dbs(), ["/pkg/db"]);
        assert_eq!(leftover, vec!["-Wall", "-XScopedTypeVariables"]);
    }

    #[test]
    fn unused_qualified_import_warns_under_wall() {
        let (mut engine, _) = ReferenceEngine::boot(&[]);
        let output = compile(
            &mut engine,
            &[target(
                "M.hs",
                "module M where\nimport qualified Data.Map as Map\nx = 1\n",
            )],
            &["-Wall"],
        );
        assert!(output
            .diagnostics
            .iter()
            .any(|diag| matches!(diag, Diagnostic::Src { message, .. } if message.contains("unused"))));
    }
}

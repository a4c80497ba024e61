// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Define Kiln wire types shared between the session client and worker.
// Author: Lukas Bower
#![allow(clippy::module_name_repetitions)]

//! Data model for the Kiln compile-session wire protocol.

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;

/// Length prefix size for framed messages.
pub const FRAME_LEN_BYTES: usize = 4;

/// Default maximum frame payload accepted by either side.
///
/// Compile requests carry the full file overlay, so the ceiling is generous.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Argv sentinel separating engine options from transport parameters.
pub const OPTS_SENTINEL: &str = "--ghc-opts-end";

/// Argv flag selecting worker mode in the re-executed binary.
pub const SERVER_FLAG: &str = "--server";

/// Identifier for an interned string in the explicit-sharing cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SymbolId(u32);

impl SymbolId {
    /// Create a symbol identifier from the supplied raw value.
    #[must_use]
    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    /// Access the raw identifier value.
    #[must_use]
    pub fn into_raw(self) -> u32 {
        self.0
    }
}

/// Additive extension of the id→string cache shipped with a compile result.
///
/// Entries extend the receiver's arena contiguously; the first entry's id
/// must equal the receiver's current arena length.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheDelta {
    /// Newly interned strings in id order.
    pub entries: Vec<(SymbolId, String)>,
}

/// Severity of a source-level diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// The compile unit is in error.
    Error,
    /// Advisory only; compilation proceeded.
    Warning,
}

/// Line/column region inside one source file. Lines and columns are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SrcSpan {
    /// First line of the region.
    pub start_line: u32,
    /// First column of the region.
    pub start_col: u32,
    /// Last line of the region.
    pub end_line: u32,
    /// Column one past the region on the last line.
    pub end_col: u32,
}

impl SrcSpan {
    /// Span covering `len` columns of a single line.
    #[must_use]
    pub fn on_line(line: u32, start_col: u32, len: u32) -> Self {
        Self {
            start_line: line,
            start_col,
            end_line: line,
            end_col: start_col.saturating_add(len),
        }
    }
}

/// A compiler-produced error or warning, or an out-of-band failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// Diagnostic anchored to a source region.
    Src {
        /// Error or warning.
        severity: Severity,
        /// Path of the offending file, relative to the sources root.
        file: String,
        /// Region the message refers to.
        span: SrcSpan,
        /// Human-readable message.
        message: String,
    },
    /// Failure with no source location, e.g. an engine fault.
    Other {
        /// Human-readable message.
        message: String,
    },
}

impl Diagnostic {
    /// Construct a source-level error.
    #[must_use]
    pub fn error(file: impl Into<String>, span: SrcSpan, message: impl Into<String>) -> Self {
        Self::Src {
            severity: Severity::Error,
            file: file.into(),
            span,
            message: message.into(),
        }
    }

    /// Construct a source-level warning.
    #[must_use]
    pub fn warning(file: impl Into<String>, span: SrcSpan, message: impl Into<String>) -> Self {
        Self::Src {
            severity: Severity::Warning,
            file: file.into(),
            span,
            message: message.into(),
        }
    }

    /// Construct an out-of-band failure.
    #[must_use]
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    /// True for source-level errors; warnings and out-of-band messages are not
    /// counted.
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::Src {
                severity: Severity::Error,
                ..
            }
        )
    }
}

// External JSON encoding: `kind` is "Error", "Warning" or "message"; span
// fields are omitted for out-of-band failures.
impl Serialize for Diagnostic {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Src {
                severity,
                file,
                span,
                message,
            } => {
                let mut map = serializer.serialize_map(Some(7))?;
                let kind = match severity {
                    Severity::Error => "Error",
                    Severity::Warning => "Warning",
                };
                map.serialize_entry("kind", kind)?;
                map.serialize_entry("file", file)?;
                map.serialize_entry("startline", &span.start_line)?;
                map.serialize_entry("startcol", &span.start_col)?;
                map.serialize_entry("endline", &span.end_line)?;
                map.serialize_entry("endcol", &span.end_col)?;
                map.serialize_entry("message", message)?;
                map.end()
            }
            Self::Other { message } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("kind", "message")?;
                map.serialize_entry("message", message)?;
                map.end()
            }
        }
    }
}

/// One module import recorded by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Import {
    /// Imported module name.
    pub module: SymbolId,
    /// True when the import is qualified.
    pub qualified: bool,
    /// Local alias, when one was given.
    pub alias: Option<SymbolId>,
}

/// Identifier attached to a source region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpanInfo {
    /// Region the identifier occupies.
    pub span: SrcSpan,
    /// The identifier itself.
    pub symbol: SymbolId,
}

/// External package dependency observed during a compile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PkgDep {
    /// Package name.
    pub package: SymbolId,
    /// Pinned version when the engine knows one.
    pub version: Option<SymbolId>,
}

/// Inferred or declared type of an expression region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExpType {
    /// Region of the expression.
    pub span: SrcSpan,
    /// Rendered type text.
    pub ty: SymbolId,
}

/// A place where an identifier is referenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UseSite {
    /// The referenced identifier.
    pub symbol: SymbolId,
    /// Location of the reference.
    pub span: SrcSpan,
}

/// Added/removed entries for one symbol category of one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diff<T> {
    /// Entries new in this compile.
    pub added: Vec<T>,
    /// Entries gone since the previous compile.
    pub removed: Vec<T>,
}

impl<T> Diff<T> {
    /// True when the diff carries no changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl<T> Default for Diff<T> {
    fn default() -> Self {
        Self {
            added: Vec::new(),
            removed: Vec::new(),
        }
    }
}

/// Per-module diffs for one symbol category, keyed by module name.
pub type ModuleDiffs<T> = Vec<(String, Diff<T>)>;

/// Aggregated output of one compile cycle, shipped as diffs against the
/// worker's previous compile for wire economy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Computed {
    /// Errors and warnings produced by the compile, in emission order.
    pub diagnostics: Vec<Diagnostic>,
    /// Names of all successfully loaded modules.
    pub loaded: Vec<String>,
    /// Strings interned since the previous result.
    pub cache: CacheDelta,
    /// Import changes per module.
    pub imports: ModuleDiffs<Import>,
    /// Auto-completion candidate changes per module.
    pub auto_completion: ModuleDiffs<SymbolId>,
    /// Span-to-identifier changes per module.
    pub span_info: ModuleDiffs<SpanInfo>,
    /// Package dependency changes per module.
    pub pkg_deps: ModuleDiffs<PkgDep>,
    /// Expression type annotation changes per module.
    pub exp_types: ModuleDiffs<ExpType>,
    /// Use-site index changes per module.
    pub use_sites: ModuleDiffs<UseSite>,
}

/// One entry of the file overlay shipped with a compile request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayEntry {
    /// Logical path relative to the session roots.
    pub path: String,
    /// Overlay content, or `None` when the path is masked (deleted even if a
    /// file of the same name exists on disk).
    pub contents: Option<Vec<u8>>,
}

/// Request to recompile the current snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileRequest {
    /// Replacement for the worker's dynamic option set; `None` reuses the
    /// previous set.
    pub options: Option<Vec<String>>,
    /// Directory scanned for on-disk source files.
    pub sources_dir: String,
    /// Whether the engine should produce runnable code.
    pub generate_code: bool,
    /// Snapshot of the in-memory file overlay.
    pub overlay: Vec<OverlayEntry>,
}

/// Request to execute a named entry point inside the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    /// Module that defines the entry point.
    pub module: String,
    /// Name of the entry point binding.
    pub identifier: String,
    /// Working directory for the executed computation.
    pub data_dir: String,
    /// Environment overlay: `Some` sets a variable, `None` removes it.
    pub env: Vec<(String, Option<String>)>,
}

/// Client-to-worker request payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Recompile the current snapshot.
    Compile(CompileRequest),
    /// Execute a named entry point.
    Run(RunRequest),
}

/// Non-terminal payloads streamed while a request is in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressBody {
    /// A numbered step of ongoing work. Steps start at 1 and never decrease
    /// within a request.
    Step {
        /// Step counter.
        step: u32,
        /// Free-form description of the step.
        message: String,
    },
    /// A chunk of stdout produced by a running entry point.
    Output(Vec<u8>),
}

/// Final outcome of a `Run` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The entry point ran to completion.
    Completed,
    /// The engine raised while executing the entry point.
    EngineException(String),
    /// The computation was stopped from outside.
    Stopped,
}

/// Terminal payloads concluding a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultBody {
    /// Outcome of a compile request.
    Computed(Computed),
    /// Outcome of a run request.
    Run(RunOutcome),
}

/// A single protocol frame, either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Request payload follows (client → worker).
    Request(Request),
    /// Non-terminal progress payload (worker → client).
    Progress(ProgressBody),
    /// Terminal result payload (worker → client).
    Result(ResultBody),
    /// Shutdown request or acknowledgement (either direction).
    Shutdown,
}

/// Possible errors produced while encoding or decoding Kiln frames.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    /// Input buffer was shorter than the declared frame length.
    #[error("truncated frame")]
    Truncated,
    /// Declared frame length does not match the observed payload length.
    #[error("length mismatch: declared {declared} actual {actual}")]
    LengthMismatch {
        /// Payload length declared in the frame header.
        declared: u32,
        /// Actual byte length observed.
        actual: usize,
    },
    /// Frame payload exceeds the configured ceiling.
    #[error("frame of {len} bytes exceeds limit of {max}")]
    Oversized {
        /// Declared or encoded payload length.
        len: u64,
        /// Configured ceiling.
        max: u32,
    },
    /// Leading tag byte does not name a frame kind.
    #[error("unknown frame tag {0:#04x}")]
    UnknownTag(u8),
    /// Variant byte inside a payload is out of range.
    #[error("unknown {what} variant {value}")]
    UnknownVariant {
        /// Field being decoded.
        what: &'static str,
        /// Offending byte.
        value: u8,
    },
    /// Encountered malformed UTF-8 in a string field.
    #[error("invalid utf8 in string field")]
    InvalidUtf8,
    /// Boolean field held a byte other than 0 or 1.
    #[error("invalid boolean byte {0}")]
    InvalidBool(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn src_diagnostic_json_carries_span_fields() {
        let diag = Diagnostic::error("M.hs", SrcSpan::on_line(2, 1, 4), "parse error");
        let json = serde_json::to_value(&diag).expect("serialize diagnostic");
        assert_eq!(json["kind"], "Error");
        assert_eq!(json["file"], "M.hs");
        assert_eq!(json["startline"], 2);
        assert_eq!(json["startcol"], 1);
        assert_eq!(json["endline"], 2);
        assert_eq!(json["endcol"], 5);
        assert_eq!(json["message"], "parse error");
    }

    #[test]
    fn other_diagnostic_json_omits_span_fields() {
        let diag = Diagnostic::other("engine gave up");
        let json = serde_json::to_value(&diag).expect("serialize diagnostic");
        assert_eq!(json["kind"], "message");
        assert_eq!(json["message"], "engine gave up");
        assert!(json.get("file").is_none());
        assert!(json.get("startline").is_none());
    }

    #[test]
    fn only_src_errors_count_as_errors() {
        assert!(Diagnostic::error("M.hs", SrcSpan::on_line(1, 1, 1), "e").is_error());
        assert!(!Diagnostic::warning("M.hs", SrcSpan::on_line(1, 1, 1), "w").is_error());
        assert!(!Diagnostic::other("m").is_error());
    }
}

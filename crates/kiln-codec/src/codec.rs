// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Encode and decode Kiln compile-session wire frames.
// Author: Lukas Bower

//! Deterministic binary encoding of [`Frame`] values.
//!
//! Every frame is a 4-byte big-endian payload length followed by the payload;
//! the payload's first byte is the frame tag, the remainder is the
//! variant-specific body. All multi-byte integers are big-endian.

use crate::types::*;

/// Frame tags on the wire.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameTag {
    Request = 0x00,
    Progress = 0x01,
    Result = 0x02,
    Shutdown = 0x03,
}

impl TryFrom<u8> for FrameTag {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => FrameTag::Request,
            0x01 => FrameTag::Progress,
            0x02 => FrameTag::Result,
            0x03 => FrameTag::Shutdown,
            other => return Err(CodecError::UnknownTag(other)),
        })
    }
}

/// Encode a frame into its wire representation, length prefix included.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, CodecError> {
    let mut payload = Vec::new();
    match frame {
        Frame::Request(request) => {
            payload.push(FrameTag::Request as u8);
            put_request(&mut payload, request)?;
        }
        Frame::Progress(body) => {
            payload.push(FrameTag::Progress as u8);
            put_progress(&mut payload, body)?;
        }
        Frame::Result(body) => {
            payload.push(FrameTag::Result as u8);
            put_result(&mut payload, body)?;
        }
        Frame::Shutdown => payload.push(FrameTag::Shutdown as u8),
    }
    let len: u32 = payload.len().try_into().map_err(|_| CodecError::Oversized {
        len: payload.len() as u64,
        max: MAX_FRAME_LEN,
    })?;
    if len > MAX_FRAME_LEN {
        return Err(CodecError::Oversized {
            len: u64::from(len),
            max: MAX_FRAME_LEN,
        });
    }
    let mut buffer = Vec::with_capacity(payload.len() + FRAME_LEN_BYTES);
    buffer.extend_from_slice(&len.to_be_bytes());
    buffer.extend_from_slice(&payload);
    Ok(buffer)
}

/// Decode a frame from a complete wire buffer, length prefix included.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, CodecError> {
    if bytes.len() < FRAME_LEN_BYTES {
        return Err(CodecError::Truncated);
    }
    let declared = u32::from_be_bytes(bytes[..FRAME_LEN_BYTES].try_into().expect("length checked"));
    let payload = &bytes[FRAME_LEN_BYTES..];
    if declared as usize != payload.len() {
        return Err(CodecError::LengthMismatch {
            declared,
            actual: payload.len(),
        });
    }
    decode_payload(payload)
}

/// Decode a frame payload (the bytes following the length prefix).
pub fn decode_payload(payload: &[u8]) -> Result<Frame, CodecError> {
    if payload.is_empty() {
        return Err(CodecError::Truncated);
    }
    let tag = FrameTag::try_from(payload[0])?;
    let mut cursor = Cursor::new(&payload[1..]);
    Ok(match tag {
        FrameTag::Request => Frame::Request(read_request(&mut cursor)?),
        FrameTag::Progress => Frame::Progress(read_progress(&mut cursor)?),
        FrameTag::Result => Frame::Result(read_result(&mut cursor)?),
        FrameTag::Shutdown => Frame::Shutdown,
    })
}

fn put_request(buf: &mut Vec<u8>, request: &Request) -> Result<(), CodecError> {
    match request {
        Request::Compile(req) => {
            buf.push(0);
            match &req.options {
                Some(options) => {
                    buf.push(1);
                    put_list(buf, options, |buf, opt| put_string(buf, opt))?;
                }
                None => buf.push(0),
            }
            put_string(buf, &req.sources_dir)?;
            put_bool(buf, req.generate_code);
            put_list(buf, &req.overlay, |buf, entry| {
                put_string(buf, &entry.path)?;
                match &entry.contents {
                    Some(bytes) => {
                        buf.push(1);
                        put_bytes(buf, bytes)
                    }
                    None => {
                        buf.push(0);
                        Ok(())
                    }
                }
            })
        }
        Request::Run(req) => {
            buf.push(1);
            put_string(buf, &req.module)?;
            put_string(buf, &req.identifier)?;
            put_string(buf, &req.data_dir)?;
            put_list(buf, &req.env, |buf, (name, value)| {
                put_string(buf, name)?;
                put_opt_string(buf, value.as_deref())
            })
        }
    }
}

fn read_request(cursor: &mut Cursor<'_>) -> Result<Request, CodecError> {
    match cursor.read_u8()? {
        0 => {
            let options = match cursor.read_u8()? {
                0 => None,
                1 => Some(read_list(cursor, |cursor| cursor.read_string())?),
                other => {
                    return Err(CodecError::UnknownVariant {
                        what: "option presence",
                        value: other,
                    })
                }
            };
            let sources_dir = cursor.read_string()?;
            let generate_code = cursor.read_bool()?;
            let overlay = read_list(cursor, |cursor| {
                let path = cursor.read_string()?;
                let contents = match cursor.read_u8()? {
                    0 => None,
                    1 => Some(cursor.read_bytes()?),
                    other => {
                        return Err(CodecError::UnknownVariant {
                            what: "overlay presence",
                            value: other,
                        })
                    }
                };
                Ok(OverlayEntry { path, contents })
            })?;
            Ok(Request::Compile(CompileRequest {
                options,
                sources_dir,
                generate_code,
                overlay,
            }))
        }
        1 => {
            let module = cursor.read_string()?;
            let identifier = cursor.read_string()?;
            let data_dir = cursor.read_string()?;
            let env = read_list(cursor, |cursor| {
                let name = cursor.read_string()?;
                let value = cursor.read_opt_string()?;
                Ok((name, value))
            })?;
            Ok(Request::Run(RunRequest {
                module,
                identifier,
                data_dir,
                env,
            }))
        }
        other => Err(CodecError::UnknownVariant {
            what: "request",
            value: other,
        }),
    }
}

fn put_progress(buf: &mut Vec<u8>, body: &ProgressBody) -> Result<(), CodecError> {
    match body {
        ProgressBody::Step { step, message } => {
            buf.push(0);
            buf.extend_from_slice(&step.to_be_bytes());
            put_string(buf, message)
        }
        ProgressBody::Output(bytes) => {
            buf.push(1);
            put_bytes(buf, bytes)
        }
    }
}

fn read_progress(cursor: &mut Cursor<'_>) -> Result<ProgressBody, CodecError> {
    match cursor.read_u8()? {
        0 => {
            let step = cursor.read_u32()?;
            let message = cursor.read_string()?;
            Ok(ProgressBody::Step { step, message })
        }
        1 => Ok(ProgressBody::Output(cursor.read_bytes()?)),
        other => Err(CodecError::UnknownVariant {
            what: "progress",
            value: other,
        }),
    }
}

fn put_result(buf: &mut Vec<u8>, body: &ResultBody) -> Result<(), CodecError> {
    match body {
        ResultBody::Computed(computed) => {
            buf.push(0);
            put_computed(buf, computed)
        }
        ResultBody::Run(outcome) => {
            buf.push(1);
            match outcome {
                RunOutcome::Completed => {
                    buf.push(0);
                    Ok(())
                }
                RunOutcome::EngineException(message) => {
                    buf.push(1);
                    put_string(buf, message)
                }
                RunOutcome::Stopped => {
                    buf.push(2);
                    Ok(())
                }
            }
        }
    }
}

fn read_result(cursor: &mut Cursor<'_>) -> Result<ResultBody, CodecError> {
    match cursor.read_u8()? {
        0 => Ok(ResultBody::Computed(read_computed(cursor)?)),
        1 => {
            let outcome = match cursor.read_u8()? {
                0 => RunOutcome::Completed,
                1 => RunOutcome::EngineException(cursor.read_string()?),
                2 => RunOutcome::Stopped,
                other => {
                    return Err(CodecError::UnknownVariant {
                        what: "run outcome",
                        value: other,
                    })
                }
            };
            Ok(ResultBody::Run(outcome))
        }
        other => Err(CodecError::UnknownVariant {
            what: "result",
            value: other,
        }),
    }
}

fn put_computed(buf: &mut Vec<u8>, computed: &Computed) -> Result<(), CodecError> {
    put_list(buf, &computed.diagnostics, put_diagnostic)?;
    put_list(buf, &computed.loaded, |buf, name| put_string(buf, name))?;
    put_list(buf, &computed.cache.entries, |buf, (id, text)| {
        buf.extend_from_slice(&id.into_raw().to_be_bytes());
        put_string(buf, text)
    })?;
    put_module_diffs(buf, &computed.imports, put_import)?;
    put_module_diffs(buf, &computed.auto_completion, |buf, id: &SymbolId| {
        buf.extend_from_slice(&id.into_raw().to_be_bytes());
        Ok(())
    })?;
    put_module_diffs(buf, &computed.span_info, |buf, info: &SpanInfo| {
        put_span(buf, &info.span);
        buf.extend_from_slice(&info.symbol.into_raw().to_be_bytes());
        Ok(())
    })?;
    put_module_diffs(buf, &computed.pkg_deps, |buf, dep: &PkgDep| {
        buf.extend_from_slice(&dep.package.into_raw().to_be_bytes());
        put_opt_symbol(buf, dep.version);
        Ok(())
    })?;
    put_module_diffs(buf, &computed.exp_types, |buf, ty: &ExpType| {
        put_span(buf, &ty.span);
        buf.extend_from_slice(&ty.ty.into_raw().to_be_bytes());
        Ok(())
    })?;
    put_module_diffs(buf, &computed.use_sites, |buf, site: &UseSite| {
        buf.extend_from_slice(&site.symbol.into_raw().to_be_bytes());
        put_span(buf, &site.span);
        Ok(())
    })
}

fn read_computed(cursor: &mut Cursor<'_>) -> Result<Computed, CodecError> {
    let diagnostics = read_list(cursor, read_diagnostic)?;
    let loaded = read_list(cursor, |cursor| cursor.read_string())?;
    let entries = read_list(cursor, |cursor| {
        let id = SymbolId::from_raw(cursor.read_u32()?);
        let text = cursor.read_string()?;
        Ok((id, text))
    })?;
    let imports = read_module_diffs(cursor, read_import)?;
    let auto_completion = read_module_diffs(cursor, |cursor| {
        Ok(SymbolId::from_raw(cursor.read_u32()?))
    })?;
    let span_info = read_module_diffs(cursor, |cursor| {
        let span = cursor.read_span()?;
        let symbol = SymbolId::from_raw(cursor.read_u32()?);
        Ok(SpanInfo { span, symbol })
    })?;
    let pkg_deps = read_module_diffs(cursor, |cursor| {
        let package = SymbolId::from_raw(cursor.read_u32()?);
        let version = cursor.read_opt_symbol()?;
        Ok(PkgDep { package, version })
    })?;
    let exp_types = read_module_diffs(cursor, |cursor| {
        let span = cursor.read_span()?;
        let ty = SymbolId::from_raw(cursor.read_u32()?);
        Ok(ExpType { span, ty })
    })?;
    let use_sites = read_module_diffs(cursor, |cursor| {
        let symbol = SymbolId::from_raw(cursor.read_u32()?);
        let span = cursor.read_span()?;
        Ok(UseSite { symbol, span })
    })?;
    Ok(Computed {
        diagnostics,
        loaded,
        cache: CacheDelta { entries },
        imports,
        auto_completion,
        span_info,
        pkg_deps,
        exp_types,
        use_sites,
    })
}

fn put_diagnostic(buf: &mut Vec<u8>, diag: &Diagnostic) -> Result<(), CodecError> {
    match diag {
        Diagnostic::Src {
            severity,
            file,
            span,
            message,
        } => {
            buf.push(0);
            buf.push(match severity {
                Severity::Error => 0,
                Severity::Warning => 1,
            });
            put_string(buf, file)?;
            put_span(buf, span);
            put_string(buf, message)
        }
        Diagnostic::Other { message } => {
            buf.push(1);
            put_string(buf, message)
        }
    }
}

fn read_diagnostic(cursor: &mut Cursor<'_>) -> Result<Diagnostic, CodecError> {
    match cursor.read_u8()? {
        0 => {
            let severity = match cursor.read_u8()? {
                0 => Severity::Error,
                1 => Severity::Warning,
                other => {
                    return Err(CodecError::UnknownVariant {
                        what: "severity",
                        value: other,
                    })
                }
            };
            let file = cursor.read_string()?;
            let span = cursor.read_span()?;
            let message = cursor.read_string()?;
            Ok(Diagnostic::Src {
                severity,
                file,
                span,
                message,
            })
        }
        1 => Ok(Diagnostic::Other {
            message: cursor.read_string()?,
        }),
        other => Err(CodecError::UnknownVariant {
            what: "diagnostic",
            value: other,
        }),
    }
}

fn put_import(buf: &mut Vec<u8>, import: &Import) -> Result<(), CodecError> {
    buf.extend_from_slice(&import.module.into_raw().to_be_bytes());
    put_bool(buf, import.qualified);
    put_opt_symbol(buf, import.alias);
    Ok(())
}

fn read_import(cursor: &mut Cursor<'_>) -> Result<Import, CodecError> {
    let module = SymbolId::from_raw(cursor.read_u32()?);
    let qualified = cursor.read_bool()?;
    let alias = cursor.read_opt_symbol()?;
    Ok(Import {
        module,
        qualified,
        alias,
    })
}

fn put_module_diffs<T>(
    buf: &mut Vec<u8>,
    diffs: &ModuleDiffs<T>,
    put_item: impl Fn(&mut Vec<u8>, &T) -> Result<(), CodecError> + Copy,
) -> Result<(), CodecError> {
    put_list(buf, diffs, |buf, (module, diff)| {
        put_string(buf, module)?;
        put_list(buf, &diff.added, put_item)?;
        put_list(buf, &diff.removed, put_item)
    })
}

fn read_module_diffs<T>(
    cursor: &mut Cursor<'_>,
    read_item: impl Fn(&mut Cursor<'_>) -> Result<T, CodecError> + Copy,
) -> Result<ModuleDiffs<T>, CodecError> {
    read_list(cursor, |cursor| {
        let module = cursor.read_string()?;
        let added = read_list(cursor, read_item)?;
        let removed = read_list(cursor, read_item)?;
        Ok((module, Diff { added, removed }))
    })
}

fn put_list<T>(
    buf: &mut Vec<u8>,
    items: &[T],
    put_item: impl Fn(&mut Vec<u8>, &T) -> Result<(), CodecError>,
) -> Result<(), CodecError> {
    let count: u32 = items.len().try_into().map_err(|_| CodecError::Oversized {
        len: items.len() as u64,
        max: MAX_FRAME_LEN,
    })?;
    buf.extend_from_slice(&count.to_be_bytes());
    for item in items {
        put_item(buf, item)?;
    }
    Ok(())
}

fn read_list<T>(
    cursor: &mut Cursor<'_>,
    read_item: impl Fn(&mut Cursor<'_>) -> Result<T, CodecError>,
) -> Result<Vec<T>, CodecError> {
    let count = cursor.read_u32()? as usize;
    // An adversarial count cannot exceed what the payload can actually hold.
    if count > cursor.remaining() {
        return Err(CodecError::Truncated);
    }
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(read_item(cursor)?);
    }
    Ok(items)
}

fn put_bool(buf: &mut Vec<u8>, value: bool) {
    buf.push(u8::from(value));
}

fn put_span(buf: &mut Vec<u8>, span: &SrcSpan) {
    buf.extend_from_slice(&span.start_line.to_be_bytes());
    buf.extend_from_slice(&span.start_col.to_be_bytes());
    buf.extend_from_slice(&span.end_line.to_be_bytes());
    buf.extend_from_slice(&span.end_col.to_be_bytes());
}

fn put_opt_symbol(buf: &mut Vec<u8>, symbol: Option<SymbolId>) {
    match symbol {
        Some(id) => {
            buf.push(1);
            buf.extend_from_slice(&id.into_raw().to_be_bytes());
        }
        None => buf.push(0),
    }
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<(), CodecError> {
    let len: u32 = bytes.len().try_into().map_err(|_| CodecError::Oversized {
        len: bytes.len() as u64,
        max: MAX_FRAME_LEN,
    })?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

fn put_string(buf: &mut Vec<u8>, value: &str) -> Result<(), CodecError> {
    put_bytes(buf, value.as_bytes())
}

fn put_opt_string(buf: &mut Vec<u8>, value: Option<&str>) -> Result<(), CodecError> {
    match value {
        Some(text) => {
            buf.push(1);
            put_string(buf, text)
        }
        None => {
            buf.push(0);
            Ok(())
        }
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos.saturating_add(len);
        if end > self.buf.len() {
            return Err(CodecError::Truncated);
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, CodecError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes(bytes.try_into().expect("length checked")))
    }

    fn read_bool(&mut self) -> Result<bool, CodecError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::InvalidBool(other)),
        }
    }

    fn read_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn read_string(&mut self) -> Result<String, CodecError> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)
    }

    fn read_opt_string(&mut self) -> Result<Option<String>, CodecError> {
        match self.read_u8()? {
            0 => Ok(None),
            1 => Ok(Some(self.read_string()?)),
            other => Err(CodecError::UnknownVariant {
                what: "string presence",
                value: other,
            }),
        }
    }

    fn read_opt_symbol(&mut self) -> Result<Option<SymbolId>, CodecError> {
        match self.read_u8()? {
            0 => Ok(None),
            1 => Ok(Some(SymbolId::from_raw(self.read_u32()?))),
            other => Err(CodecError::UnknownVariant {
                what: "symbol presence",
                value: other,
            }),
        }
    }

    fn read_span(&mut self) -> Result<SrcSpan, CodecError> {
        Ok(SrcSpan {
            start_line: self.read_u32()?,
            start_col: self.read_u32()?,
            end_line: self.read_u32()?,
            end_col: self.read_u32()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_compile() -> Frame {
        Frame::Request(Request::Compile(CompileRequest {
            options: Some(vec!["-Wall".to_owned()]),
            sources_dir: "/tmp/s".to_owned(),
            generate_code: true,
            overlay: vec![
                OverlayEntry {
                    path: "M.hs".to_owned(),
                    contents: Some(b"module M where\n".to_vec()),
                },
                OverlayEntry {
                    path: "Gone.hs".to_owned(),
                    contents: None,
                },
            ],
        }))
    }

    #[test]
    fn compile_request_survives_the_wire() {
        let frame = sample_compile();
        let bytes = encode_frame(&frame).expect("encode frame");
        assert_eq!(decode_frame(&bytes).expect("decode frame"), frame);
    }

    #[test]
    fn computed_result_survives_the_wire() {
        let frame = Frame::Result(ResultBody::Computed(Computed {
            diagnostics: vec![
                Diagnostic::error("M.hs", SrcSpan::on_line(2, 1, 4), "parse error"),
                Diagnostic::other("engine restarted"),
            ],
            loaded: vec!["M".to_owned()],
            cache: CacheDelta {
                entries: vec![(SymbolId::from_raw(0), "M".to_owned())],
            },
            imports: vec![(
                "M".to_owned(),
                Diff {
                    added: vec![Import {
                        module: SymbolId::from_raw(0),
                        qualified: true,
                        alias: Some(SymbolId::from_raw(0)),
                    }],
                    removed: vec![],
                },
            )],
            ..Computed::default()
        }));
        let bytes = encode_frame(&frame).expect("encode frame");
        assert_eq!(decode_frame(&bytes).expect("decode frame"), frame);
    }

    #[test]
    fn detect_truncated_frames() {
        let mut bytes = encode_frame(&sample_compile()).expect("encode frame");
        bytes.truncate(3);
        assert_eq!(decode_frame(&bytes), Err(CodecError::Truncated));
    }

    #[test]
    fn detect_length_mismatch() {
        let mut bytes = encode_frame(&Frame::Shutdown).expect("encode frame");
        bytes[3] = bytes[3].wrapping_add(1);
        assert!(matches!(
            decode_frame(&bytes),
            Err(CodecError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn reject_unknown_tags() {
        let bytes = vec![0, 0, 0, 1, 0x7f];
        assert_eq!(decode_frame(&bytes), Err(CodecError::UnknownTag(0x7f)));
    }

    #[test]
    fn reject_invalid_utf8_in_strings() {
        let frame = Frame::Progress(ProgressBody::Step {
            step: 1,
            message: "ok".to_owned(),
        });
        let mut bytes = encode_frame(&frame).expect("encode frame");
        let len = bytes.len();
        bytes[len - 2] = 0xfe;
        bytes[len - 1] = 0xff;
        assert_eq!(decode_frame(&bytes), Err(CodecError::InvalidUtf8));
    }

    #[test]
    fn reject_adversarial_list_counts() {
        // A run request whose env list claims more entries than the payload
        // can hold must fail cleanly rather than allocate.
        let mut payload = vec![0x00u8, 1];
        put_string(&mut payload, "M").expect("encode module");
        put_string(&mut payload, "main").expect("encode identifier");
        put_string(&mut payload, "/tmp/d").expect("encode data dir");
        payload.extend_from_slice(&u32::MAX.to_be_bytes());
        let mut bytes = (payload.len() as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(&payload);
        assert_eq!(decode_frame(&bytes), Err(CodecError::Truncated));
    }

    #[test]
    fn shutdown_is_a_single_tag_byte() {
        let bytes = encode_frame(&Frame::Shutdown).expect("encode frame");
        assert_eq!(bytes, vec![0, 0, 0, 1, 0x03]);
        assert_eq!(decode_frame(&bytes).expect("decode"), Frame::Shutdown);
    }
}

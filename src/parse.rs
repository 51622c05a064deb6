//! Parse results and the parser contract.
//!
//! The grammar-driven parser is an external collaborator: it turns a named
//! source string into a `FileDescriptorProto` plus source locations. This
//! module defines the [`Parser`] trait the executor drives, the
//! [`ParseResult`] the linker consumes and mutates, and the bidirectional
//! [`SourceIndex`] between descriptor-proto nodes and source spans.
//!
//! A descriptor-proto node is addressed by its *location path*, the standard
//! `SourceCodeInfo.location.path` scheme: a sequence of field numbers and
//! indices leading from the file descriptor root to the node. Location paths
//! are what the AST side of the index hands out as node handles.

use crate::{
    error::{Error, Result},
    path::ResolvedPath,
    report::Handler,
    span::{LineCol, Span},
};
use prost_types::{source_code_info::Location, FileDescriptorProto, SourceCodeInfo};
use std::{collections::HashMap, fmt, sync::Arc};

/// Field numbers of `FileDescriptorProto` and friends, as used in location
/// paths.
pub(crate) mod loc {
    pub const FILE_PACKAGE: i32 = 2;
    pub const FILE_DEPENDENCY: i32 = 3;
    pub const FILE_MESSAGE: i32 = 4;
    pub const FILE_ENUM: i32 = 5;
    pub const FILE_SERVICE: i32 = 6;
    pub const FILE_EXTENSION: i32 = 7;

    pub const MESSAGE_FIELD: i32 = 2;
    pub const MESSAGE_NESTED: i32 = 3;
    pub const MESSAGE_ENUM: i32 = 4;
    pub const MESSAGE_EXTENSION: i32 = 6;
    pub const MESSAGE_ONEOF: i32 = 8;

    pub const ENUM_VALUE: i32 = 2;
    pub const SERVICE_METHOD: i32 = 2;
}

bitflags::bitflags! {
    /// What source info to attach to compiled descriptors.
    ///
    /// The empty set means none. Modes are OR-able:
    /// `SourceInfoMode::STANDARD | SourceInfoMode::EXTRA_COMMENTS`.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SourceInfoMode: u8 {
        /// Standard locations with leading/trailing comments.
        const STANDARD = 1 << 0;
        /// Also keep detached comments.
        const EXTRA_COMMENTS = 1 << 1;
        /// Also keep locations for interpreted options.
        const EXTRA_OPTION_LOCATIONS = 1 << 2;
    }
}

/// Bidirectional index between descriptor-proto nodes and source spans.
///
/// Forward: location path → [`Span`]. Reverse: a source position → the
/// location path of the innermost node whose span contains it.
#[derive(Clone, Debug)]
pub struct SourceIndex {
    file: ResolvedPath,
    spans: HashMap<Vec<i32>, Span>,
    // kept in parse order for reverse lookups
    entries: Vec<(Vec<i32>, Span)>,
}

impl SourceIndex {
    pub(crate) fn empty(file: ResolvedPath) -> Self {
        Self { file, spans: HashMap::new(), entries: Vec::new() }
    }

    pub(crate) fn from_info(file: ResolvedPath, info: Option<&SourceCodeInfo>) -> Self {
        let mut index = Self::empty(file);
        let Some(info) = info else { return index };
        for location in &info.location {
            let Some(span) = decode_span(&index.file, &location.span) else { continue };
            index.entries.push((location.path.clone(), span.clone()));
            index.spans.entry(location.path.clone()).or_insert(span);
        }
        index
    }

    /// The file every span in this index points into.
    pub fn file(&self) -> &ResolvedPath {
        &self.file
    }

    /// The span recorded for a descriptor-proto node.
    pub fn span(&self, path: &[i32]) -> Option<Span> {
        self.spans.get(path).cloned()
    }

    /// Like [`span`](Self::span), falling back to a position-less span that
    /// still names the file. Symbol registration relies on the file name
    /// always being present.
    pub fn span_or_file(&self, path: &[i32]) -> Span {
        self.span(path).unwrap_or_else(|| Span::file_only(self.file.clone()))
    }

    /// The location path of the innermost node whose span contains `pos`.
    pub fn path_at(&self, pos: LineCol) -> Option<&[i32]> {
        self.entries
            .iter()
            .filter(|(_, span)| span.start <= pos && pos < span.end)
            .min_by_key(|(_, span)| (span.end.line.saturating_sub(span.start.line), span.end.col))
            .map(|(path, _)| path.as_slice())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// `Location.span` is either [start_line, start_col, end_line, end_col] or
// [line, start_col, end_col].
fn decode_span(file: &ResolvedPath, raw: &[i32]) -> Option<Span> {
    let span = match *raw {
        [line, start, end_line, end] => Span::new(
            file.clone(),
            LineCol::new(line as u32, start as u32),
            LineCol::new(end_line as u32, end as u32),
        ),
        [line, start, end] => Span::new(
            file.clone(),
            LineCol::new(line as u32, start as u32),
            LineCol::new(line as u32, end as u32),
        ),
        _ => return None,
    };
    Some(span)
}

/// The parsed form of one source file: the descriptor proto plus the retained
/// source locations.
///
/// The descriptor inside an `Ast` keeps its `source_code_info`; deriving a
/// [`ParseResult`] splits that info out into a [`SourceIndex`] so the linker
/// can mutate the proto without touching the locations.
#[derive(Clone)]
pub struct Ast {
    name: ResolvedPath,
    source: Arc<str>,
    proto: FileDescriptorProto,
}

impl Ast {
    pub fn new(name: ResolvedPath, source: impl Into<Arc<str>>, proto: FileDescriptorProto) -> Self {
        Self { name, source: source.into(), proto }
    }

    pub fn name(&self) -> &ResolvedPath {
        &self.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn source_info(&self) -> Option<&SourceCodeInfo> {
        self.proto.source_code_info.as_ref()
    }

    pub(crate) fn proto(&self) -> &FileDescriptorProto {
        &self.proto
    }
}

impl fmt::Debug for Ast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ast")
            .field("name", &self.name)
            .field("source_len", &self.source.len())
            .finish()
    }
}

/// A descriptor proto ready for linking, with the optional AST it came from
/// and the index between the two.
///
/// Cloning is a deep copy of the descriptor proto: the linker mutates it, and
/// two concurrent builds must never share mutable state. The index and the
/// AST are immutable and structurally shared.
#[derive(Clone, Debug)]
pub struct ParseResult {
    proto: FileDescriptorProto,
    ast: Option<Ast>,
    index: Arc<SourceIndex>,
}

impl ParseResult {
    pub(crate) fn new(proto: FileDescriptorProto, ast: Option<Ast>, index: SourceIndex) -> Self {
        Self { proto, ast, index: Arc::new(index) }
    }

    /// The file this result was parsed from.
    pub fn file(&self) -> &ResolvedPath {
        self.index.file()
    }

    pub fn proto(&self) -> &FileDescriptorProto {
        &self.proto
    }

    pub(crate) fn proto_mut(&mut self) -> &mut FileDescriptorProto {
        &mut self.proto
    }

    pub fn ast(&self) -> Option<&Ast> {
        self.ast.as_ref()
    }

    pub fn index(&self) -> &SourceIndex {
        &self.index
    }

    pub(crate) fn index_arc(&self) -> Arc<SourceIndex> {
        self.index.clone()
    }

    /// Releases the AST (and with it the retained source text).
    pub fn drop_ast(&mut self) {
        self.ast = None;
    }

    pub(crate) fn into_parts(self) -> (FileDescriptorProto, Option<Ast>, Arc<SourceIndex>) {
        (self.proto, self.ast, self.index)
    }
}

/// The grammar-driven parser collaborator.
///
/// Implementations must be cheap to share across the executor's worker tasks.
pub trait Parser: Send + Sync {
    /// Parses `source` into an [`Ast`] named `name`. Syntax errors are routed
    /// through `handler` before the call fails.
    fn parse(&self, name: &ResolvedPath, source: &str, handler: &Handler) -> Result<Ast>;

    /// Derives a [`ParseResult`] from a previously parsed [`Ast`].
    fn result_from_ast(&self, ast: Ast, validate: bool, handler: &Handler) -> Result<ParseResult>;

    /// Wraps an already-built descriptor proto that has no AST. Any
    /// `source_code_info` present on the proto still feeds the index.
    fn result_without_ast(&self, proto: FileDescriptorProto) -> ParseResult;
}

/// The default [`Parser`], backed by `protox-parse`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProtoxParser;

impl Parser for ProtoxParser {
    fn parse(&self, name: &ResolvedPath, source: &str, handler: &Handler) -> Result<Ast> {
        match protox_parse::parse(name.as_str(), source) {
            Ok(proto) => Ok(Ast::new(name.clone(), source, proto)),
            Err(err) => {
                let err = Error::Parse { file: name.clone(), message: err.to_string() };
                handler.error(err.clone())?;
                Err(err)
            }
        }
    }

    fn result_from_ast(&self, ast: Ast, _validate: bool, _handler: &Handler) -> Result<ParseResult> {
        // the backing parser validates while parsing, so there is no separate
        // validation pass to run here
        let mut proto = ast.proto().clone();
        let info = proto.source_code_info.take();
        let index = SourceIndex::from_info(ast.name().clone(), info.as_ref());
        Ok(ParseResult::new(proto, Some(ast), index))
    }

    fn result_without_ast(&self, mut proto: FileDescriptorProto) -> ParseResult {
        let file = ResolvedPath::from(proto.name());
        let info = proto.source_code_info.take();
        let index = SourceIndex::from_info(file, info.as_ref());
        ParseResult::new(proto, None, index)
    }
}

/// Filters parser-retained source info down to what `mode` asks for.
pub(crate) fn filter_source_info(info: &SourceCodeInfo, mode: SourceInfoMode) -> SourceCodeInfo {
    let mut out = info.clone();
    if !mode.contains(SourceInfoMode::EXTRA_COMMENTS) {
        for location in &mut out.location {
            location.leading_detached_comments.clear();
        }
    }
    out
}

#[allow(dead_code)]
pub(crate) fn location_for(path: Vec<i32>, span: Vec<i32>) -> Location {
    Location { path, span, ..Default::default() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_with(locations: Vec<Location>) -> SourceIndex {
        let info = SourceCodeInfo { location: locations };
        SourceIndex::from_info("test.proto".into(), Some(&info))
    }

    #[test]
    fn decodes_both_span_encodings() {
        let index = index_with(vec![
            location_for(vec![loc::FILE_MESSAGE, 0], vec![2, 0, 4, 1]),
            location_for(vec![loc::FILE_MESSAGE, 0, loc::MESSAGE_FIELD, 0], vec![3, 4, 20]),
        ]);

        let message = index.span(&[loc::FILE_MESSAGE, 0]).unwrap();
        assert_eq!(message.start, LineCol::new(2, 0));
        assert_eq!(message.end, LineCol::new(4, 1));

        let field = index.span(&[loc::FILE_MESSAGE, 0, loc::MESSAGE_FIELD, 0]).unwrap();
        assert_eq!(field.start.line, field.end.line);
        assert_eq!(field.end.col, 20);
    }

    #[test]
    fn reverse_lookup_returns_innermost_node() {
        let index = index_with(vec![
            location_for(vec![loc::FILE_MESSAGE, 0], vec![2, 0, 4, 1]),
            location_for(vec![loc::FILE_MESSAGE, 0, loc::MESSAGE_FIELD, 0], vec![3, 4, 20]),
        ]);

        let inner = index.path_at(LineCol::new(3, 10)).unwrap();
        assert_eq!(inner, &[loc::FILE_MESSAGE, 0, loc::MESSAGE_FIELD, 0]);

        let outer = index.path_at(LineCol::new(2, 1)).unwrap();
        assert_eq!(outer, &[loc::FILE_MESSAGE, 0]);

        assert!(index.path_at(LineCol::new(40, 0)).is_none());
    }

    #[test]
    fn missing_spans_fall_back_to_the_file() {
        let index = SourceIndex::empty("fallback.proto".into());
        let span = index.span_or_file(&[loc::FILE_PACKAGE]);
        assert_eq!(span.file, "fallback.proto");
        assert!(!span.has_position());
    }
}

//! Source positions for diagnostics.

use crate::path::ResolvedPath;
use std::fmt;

/// A zero-based line/column position in a source file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LineCol {
    pub line: u32,
    pub col: u32,
}

impl LineCol {
    pub fn new(line: u32, col: u32) -> Self {
        Self { line, col }
    }
}

/// A source region identifying where a symbol was declared or a statement
/// written.
///
/// `file` always names the defining file and is what span-based deletion in
/// the symbol table keys on; `start`/`end` may both be zero when the parse
/// that produced the span carried no source info.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Span {
    pub file: ResolvedPath,
    pub start: LineCol,
    pub end: LineCol,
}

impl Span {
    pub fn new(file: ResolvedPath, start: LineCol, end: LineCol) -> Self {
        Self { file, start, end }
    }

    /// A span that names a file but no position within it.
    pub fn file_only(file: ResolvedPath) -> Self {
        Self { file, start: LineCol::default(), end: LineCol::default() }
    }

    /// Whether the span carries an actual position.
    pub fn has_position(&self) -> bool {
        self.start != LineCol::default() || self.end != LineCol::default()
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has_position() {
            // positions render one-based, the way editors count
            write!(f, "{}:{}:{}", self.file, self.start.line + 1, self.start.col + 1)
        } else {
            write!(f, "{}", self.file)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_one_based_positions() {
        let span = Span::new("a.proto".into(), LineCol::new(2, 4), LineCol::new(2, 10));
        assert_eq!(span.to_string(), "a.proto:3:5");

        let bare = Span::file_only("a.proto".into());
        assert_eq!(bare.to_string(), "a.proto");
        assert!(!bare.has_position());
    }
}

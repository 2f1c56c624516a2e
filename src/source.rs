//! Source buffers and source locations.
//!
//! Every evaluated file is registered as a [`Source`] in the workspace.
//! Locations are stored as `(offset, length)` pairs and resolved to
//! line/column coordinates only when a diagnostic is actually rendered.

use std::sync::OnceLock;

use camino::{Utf8Path, Utf8PathBuf};

/// A half-open byte span `(off, off + len)` within one source buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceLocation {
    pub off: u32,
    pub len: u32,
}

impl SourceLocation {
    #[must_use]
    pub const fn new(off: u32, len: u32) -> Self {
        Self { off, len }
    }

    /// The smallest span covering both `self` and `other`.
    #[must_use]
    pub fn union(self, other: Self) -> Self {
        let start = self.off.min(other.off);
        let end = (self.off + self.len).max(other.off + other.len);
        Self::new(start, end - start)
    }
}

/// Line/column coordinates for a resolved [`SourceLocation`], 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetailedLocation {
    pub line: u32,
    pub col: u32,
    pub end_line: u32,
    pub end_col: u32,
}

/// An immutable source buffer plus the metadata needed for diagnostics.
///
/// The buffer is byte-oriented; the language permits arbitrary bytes inside
/// string literals, so no UTF-8 validity is assumed beyond the lexical
/// structure itself.
#[derive(Debug)]
pub struct Source {
    path: Utf8PathBuf,
    text: Vec<u8>,
    line_starts: OnceLock<Vec<u32>>,
}

impl Source {
    #[must_use]
    pub fn new(path: Utf8PathBuf, text: Vec<u8>) -> Self {
        Self { path, text, line_starts: OnceLock::new() }
    }

    /// An in-memory buffer with a synthetic path, used by `eval` helpers
    /// and tests.
    #[must_use]
    pub fn anonymous(text: impl Into<Vec<u8>>) -> Self {
        Self::new(Utf8PathBuf::from("<internal>"), text.into())
    }

    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    #[must_use]
    pub fn text(&self) -> &[u8] {
        &self.text
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.text.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    fn line_starts(&self) -> &[u32] {
        self.line_starts.get_or_init(|| {
            let mut starts = vec![0_u32];
            for (i, b) in self.text.iter().enumerate() {
                if *b == b'\n' {
                    starts.push(u32::try_from(i).unwrap_or(u32::MAX) + 1);
                }
            }
            starts
        })
    }

    /// Resolve a byte span to 1-based line/column coordinates by binary
    /// search over the line-start table.
    #[must_use]
    pub fn resolve(&self, loc: SourceLocation) -> DetailedLocation {
        let (line, col) = self.line_col(loc.off);
        let end = loc.off + loc.len.max(1) - 1;
        let (end_line, end_col) = self.line_col(end);
        DetailedLocation { line, col, end_line, end_col }
    }

    fn line_col(&self, off: u32) -> (u32, u32) {
        let starts = self.line_starts();
        let line_idx = match starts.binary_search(&off) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        let line_start = starts[line_idx];
        let line = u32::try_from(line_idx).unwrap_or(u32::MAX) + 1;
        (line, off - line_start + 1)
    }

    /// The full text of the given 1-based line, without its newline.
    #[must_use]
    pub fn line_text(&self, line: u32) -> &[u8] {
        let starts = self.line_starts();
        let idx = line.saturating_sub(1) as usize;
        let start = starts.get(idx).copied().unwrap_or(0) as usize;
        let end = starts
            .get(idx + 1)
            .map_or(self.text.len(), |next| (*next as usize).saturating_sub(1));
        &self.text[start.min(self.text.len())..end.min(self.text.len())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn src(text: &str) -> Source {
        Source::anonymous(text.as_bytes().to_vec())
    }

    #[rstest]
    #[case(0, 1, 1)]
    #[case(4, 1, 5)]
    #[case(6, 2, 1)]
    #[case(10, 2, 5)]
    fn resolves_offsets_to_line_and_column(#[case] off: u32, #[case] line: u32, #[case] col: u32) {
        let s = src("first\nsecond\nthird\n");
        let d = s.resolve(SourceLocation::new(off, 1));
        assert_eq!((d.line, d.col), (line, col));
    }

    #[rstest]
    fn resolves_multi_line_span() {
        let s = src("aa\nbb\ncc\n");
        let d = s.resolve(SourceLocation::new(1, 5));
        assert_eq!((d.line, d.col), (1, 2));
        assert_eq!((d.end_line, d.end_col), (2, 3));
    }

    #[rstest]
    fn line_text_strips_newline() {
        let s = src("one\ntwo\n");
        assert_eq!(s.line_text(1), b"one");
        assert_eq!(s.line_text(2), b"two");
    }

    #[rstest]
    fn union_covers_both_spans() {
        let a = SourceLocation::new(2, 3);
        let b = SourceLocation::new(8, 4);
        assert_eq!(a.union(b), SourceLocation::new(2, 10));
    }
}

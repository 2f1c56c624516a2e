//! Deduplicated, source-located diagnostics.
//!
//! Language-level failures never unwind as `Err` values; they are recorded
//! here and replayed once evaluation finishes. The store deduplicates on
//! `(source, offset, level, message)`, sorts by source then offset, and
//! renders each entry as `path:line:col: level msg` with a caret-underlined
//! snippet of the offending span.

use std::collections::HashSet;
use std::io::Write;

use crate::source::{Source, SourceLocation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Warning,
    Error,
}

impl Level {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub src_idx: u32,
    pub loc: SourceLocation,
    pub level: Level,
    pub msg: String,
}

/// In-memory diagnostics batch for one workspace.
#[derive(Debug, Default)]
pub struct DiagnosticStore {
    diagnostics: Vec<Diagnostic>,
    seen: HashSet<(u32, u32, Level, String)>,
    werror: bool,
}

impl DiagnosticStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Promote warnings to errors from here on.
    pub fn set_werror(&mut self, werror: bool) {
        self.werror = werror;
    }

    pub fn push(&mut self, src_idx: u32, loc: SourceLocation, level: Level, msg: impl Into<String>) {
        let level = if self.werror && level == Level::Warning { Level::Error } else { level };
        let msg = msg.into();
        if self.seen.insert((src_idx, loc.off, level, msg.clone())) {
            self.diagnostics.push(Diagnostic { src_idx, loc, level, msg });
        }
    }

    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(|d| d.level == Level::Error)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.diagnostics.len()
    }

    /// All diagnostics in replay order (source index, then offset).
    #[must_use]
    pub fn sorted(&self) -> Vec<&Diagnostic> {
        let mut out: Vec<&Diagnostic> = self.diagnostics.iter().collect();
        out.sort_by_key(|d| (d.src_idx, d.loc.off));
        out
    }

    /// Render every diagnostic to `out`. `sources` is the workspace source
    /// table indexed by `src_idx`.
    pub fn replay(&self, sources: &[Source], out: &mut dyn Write) -> std::io::Result<()> {
        for d in self.sorted() {
            let Some(src) = sources.get(d.src_idx as usize) else {
                writeln!(out, "<unknown>: {} {}", d.level.as_str(), d.msg)?;
                continue;
            };
            render(src, d, out)?;
        }
        Ok(())
    }
}

fn render(src: &Source, d: &Diagnostic, out: &mut dyn Write) -> std::io::Result<()> {
    let det = src.resolve(d.loc);
    writeln!(out, "{}:{}:{}: {} {}", src.path(), det.line, det.col, d.level.as_str(), d.msg)?;

    if det.line == det.end_line {
        let line = String::from_utf8_lossy(src.line_text(det.line));
        writeln!(out, "{line}")?;
        let pad = " ".repeat(det.col.saturating_sub(1) as usize);
        let width = ((det.end_col + 1).saturating_sub(det.col)).max(1) as usize;
        writeln!(out, "{pad}^{}", "~".repeat(width.saturating_sub(1)))?;
    } else {
        // Multi-line span: bracket the first and last lines.
        let first = String::from_utf8_lossy(src.line_text(det.line));
        let last = String::from_utf8_lossy(src.line_text(det.end_line));
        writeln!(out, "  / {first}")?;
        writeln!(out, " |_ {last}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn store_with(diags: &[(u32, u32, Level, &str)]) -> DiagnosticStore {
        let mut store = DiagnosticStore::new();
        for (src, off, level, msg) in diags {
            store.push(*src, SourceLocation::new(*off, 1), *level, *msg);
        }
        store
    }

    #[rstest]
    fn deduplicates_identical_entries() {
        let store = store_with(&[
            (0, 4, Level::Error, "boom"),
            (0, 4, Level::Error, "boom"),
            (0, 4, Level::Error, "other"),
        ]);
        assert_eq!(store.len(), 2);
    }

    #[rstest]
    fn sorts_by_source_then_offset() {
        let store = store_with(&[
            (1, 0, Level::Error, "c"),
            (0, 9, Level::Error, "b"),
            (0, 2, Level::Error, "a"),
        ]);
        let msgs: Vec<&str> = store.sorted().iter().map(|d| d.msg.as_str()).collect();
        assert_eq!(msgs, ["a", "b", "c"]);
    }

    #[rstest]
    fn werror_promotes_warnings() {
        let mut store = DiagnosticStore::new();
        store.set_werror(true);
        store.push(0, SourceLocation::new(0, 1), Level::Warning, "w");
        assert!(store.has_errors());
    }

    #[rstest]
    fn renders_caret_snippet() {
        let src = Source::anonymous(b"x = blarg\n".to_vec());
        let mut store = DiagnosticStore::new();
        store.push(0, SourceLocation::new(4, 5), Level::Error, "undefined object blarg");
        let mut buf = Vec::new();
        store.replay(std::slice::from_ref(&src), &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("<internal>:1:5: error undefined object blarg"));
        assert!(text.contains("    ^~~~~"));
    }
}

//! Manifest scanner for the ninja grammar.
//!
//! A character-level scanner over the whole manifest buffer. `$` escapes
//! (`$ `, `$:`, `$$`, `$\n` continuation, `$var`, `${var}`) are resolved
//! into [`EvalString`] chunks; CRLF line endings are tolerated.

use crate::runner::env::{EvalPart, EvalString};
use crate::runner::graph::GraphError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    Build,
    Default,
    Include,
    Pool,
    Rule,
    Subninja,
}

/// Keyword table, kept sorted for binary search.
const KEYWORDS: &[(&str, Keyword)] = &[
    ("build", Keyword::Build),
    ("default", Keyword::Default),
    ("include", Keyword::Include),
    ("pool", Keyword::Pool),
    ("rule", Keyword::Rule),
    ("subninja", Keyword::Subninja),
];

/// A top-level manifest declaration.
#[derive(Debug)]
pub enum Statement {
    Keyword(Keyword),
    /// `name = value` at file scope.
    Variable(String),
    Eof,
}

pub struct Scanner {
    path: String,
    src: Vec<u8>,
    i: usize,
    line: u32,
    col: u32,
}

impl Scanner {
    pub fn from_file(path: &str) -> Result<Self, GraphError> {
        let src = std::fs::read(path)
            .map_err(|e| GraphError::Fatal(format!("failed to read {path}: {e}")))?;
        Ok(Self::from_bytes(path, src))
    }

    #[must_use]
    pub fn from_bytes(path: &str, src: Vec<u8>) -> Self {
        Self { path: path.to_owned(), src, i: 0, line: 1, col: 1 }
    }

    fn err(&self, msg: impl Into<String>) -> GraphError {
        GraphError::Scan { path: self.path.clone(), line: self.line, col: self.col, msg: msg.into() }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.i).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.i += 1;
        if c == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn is_simple_var(c: u8) -> bool {
        c.is_ascii_alphanumeric() || c == b'_' || c == b'-'
    }

    fn is_var(c: u8) -> bool {
        Self::is_simple_var(c) || c == b'.'
    }

    /// Consume `\n` or `\r\n`.
    fn newline(&mut self) -> Result<bool, GraphError> {
        match self.peek() {
            Some(b'\r') => {
                self.bump();
                if self.peek() != Some(b'\n') {
                    return Err(self.err("expected '\\n' after '\\r'"));
                }
                self.bump();
                Ok(true)
            }
            Some(b'\n') => {
                self.bump();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn single_space(&mut self) -> Result<bool, GraphError> {
        match self.peek() {
            Some(b'$') => {
                // `$` followed by a newline is a line continuation.
                let save = (self.i, self.line, self.col);
                self.bump();
                if self.newline()? {
                    return Ok(true);
                }
                (self.i, self.line, self.col) = save;
                Ok(false)
            }
            Some(b' ') => {
                self.bump();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn space(&mut self) -> Result<bool, GraphError> {
        let mut any = false;
        while self.single_space()? {
            any = true;
        }
        Ok(any)
    }

    fn comment(&mut self) -> Result<bool, GraphError> {
        if self.peek() != Some(b'#') {
            return Ok(false);
        }
        loop {
            if self.peek().is_none() {
                return Ok(true);
            }
            self.bump();
            if self.newline()? {
                return Ok(true);
            }
        }
    }

    fn read_name(&mut self) -> Result<String, GraphError> {
        let mut buf = Vec::new();
        while let Some(c) = self.peek() {
            if !Self::is_var(c) {
                break;
            }
            buf.push(c);
            self.bump();
        }
        if buf.is_empty() {
            return Err(self.err("expected name"));
        }
        self.space()?;
        String::from_utf8(buf).map_err(|_| self.err("name is not valid UTF-8"))
    }

    /// Next top-level statement keyword, variable name, or EOF.
    pub fn keyword(&mut self) -> Result<Statement, GraphError> {
        loop {
            match self.peek() {
                None => return Ok(Statement::Eof),
                Some(b' ') => {
                    self.space()?;
                    if !self.comment()? && !self.newline()? {
                        return Err(self.err("unexpected indent"));
                    }
                }
                Some(b'#') => {
                    self.comment()?;
                }
                Some(b'\r' | b'\n') => {
                    self.newline()?;
                }
                Some(_) => {
                    let name = self.read_name()?;
                    let found = KEYWORDS
                        .binary_search_by(|(kw, _)| (*kw).cmp(name.as_str()))
                        .map(|idx| KEYWORDS[idx].1);
                    return Ok(match found {
                        Ok(kw) => Statement::Keyword(kw),
                        Err(_) => Statement::Variable(name),
                    });
                }
            }
        }
    }

    pub fn name(&mut self) -> Result<String, GraphError> {
        self.read_name()
    }

    /// Scan a value: literal chunks plus `$` escapes. In path mode the
    /// value ends at space, `:`, or `|`.
    pub fn string(&mut self, path: bool) -> Result<Option<EvalString>, GraphError> {
        let mut parts: EvalString = Vec::new();
        let mut lit = Vec::new();

        let flush = |parts: &mut EvalString, lit: &mut Vec<u8>| {
            if !lit.is_empty() {
                parts.push(EvalPart::Lit(String::from_utf8_lossy(lit).into_owned()));
                lit.clear();
            }
        };

        loop {
            match self.peek() {
                None | Some(b'\r' | b'\n') => break,
                Some(b'$') => {
                    self.bump();
                    match self.peek() {
                        Some(b'$' | b' ' | b':') => {
                            lit.push(self.bump().unwrap_or(0));
                        }
                        Some(b'{') => {
                            self.bump();
                            flush(&mut parts, &mut lit);
                            let mut var = Vec::new();
                            while let Some(c) = self.peek() {
                                if !Self::is_var(c) {
                                    break;
                                }
                                var.push(c);
                                self.bump();
                            }
                            if self.peek() != Some(b'}') || var.is_empty() {
                                return Err(self.err("invalid variable name"));
                            }
                            self.bump();
                            parts.push(EvalPart::Var(String::from_utf8_lossy(&var).into_owned()));
                        }
                        Some(b'\r' | b'\n') => {
                            self.newline()?;
                            self.space()?;
                        }
                        _ => {
                            flush(&mut parts, &mut lit);
                            let mut var = Vec::new();
                            while let Some(c) = self.peek() {
                                if !Self::is_simple_var(c) {
                                    break;
                                }
                                var.push(c);
                                self.bump();
                            }
                            if var.is_empty() {
                                return Err(self.err("invalid $ escape"));
                            }
                            parts.push(EvalPart::Var(String::from_utf8_lossy(&var).into_owned()));
                        }
                    }
                }
                Some(c @ (b':' | b'|' | b' ')) if path => {
                    let _ = c;
                    break;
                }
                Some(_) => {
                    lit.push(self.bump().unwrap_or(0));
                }
            }
        }
        flush(&mut parts, &mut lit);
        if path {
            self.space()?;
        }
        if parts.is_empty() { Ok(None) } else { Ok(Some(parts)) }
    }

    /// All whitespace-separated paths up to the end of the clause.
    pub fn paths(&mut self) -> Result<Vec<EvalString>, GraphError> {
        let mut out = Vec::new();
        while let Some(path) = self.string(true)? {
            out.push(path);
        }
        Ok(out)
    }

    pub fn expect_char(&mut self, c: u8) -> Result<(), GraphError> {
        if self.peek() != Some(c) {
            return Err(self.err(format!("expected '{}'", c as char)));
        }
        self.bump();
        self.space()?;
        Ok(())
    }

    /// `|` / `||` separators. `allowed` is a bitmask: 1 allows `|`, 2
    /// allows `||`. Returns 0, 1, or 2.
    pub fn pipe(&mut self, allowed: u8) -> Result<u8, GraphError> {
        if self.peek() != Some(b'|') {
            return Ok(0);
        }
        self.bump();
        if self.peek() != Some(b'|') {
            if allowed & 1 == 0 {
                return Err(self.err("expected '||'"));
            }
            self.space()?;
            return Ok(1);
        }
        if allowed & 2 == 0 {
            return Err(self.err("unexpected '||'"));
        }
        self.bump();
        self.space()?;
        Ok(2)
    }

    /// An indented continuation line introduces a binding.
    pub fn indent(&mut self) -> Result<bool, GraphError> {
        loop {
            let indent = self.space()?;
            if !self.comment()? {
                return Ok(indent && !self.newline()?);
            }
        }
    }

    pub fn expect_newline(&mut self) -> Result<(), GraphError> {
        if !self.newline()? {
            if self.peek().is_none() {
                return Ok(());
            }
            return Err(self.err("expected newline"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn scan(text: &str) -> Scanner {
        Scanner::from_bytes("test.ninja", text.as_bytes().to_vec())
    }

    #[rstest]
    fn keywords_and_variables_are_distinguished() {
        let mut s = scan("rule cc\ncflags = -O2\n");
        assert!(matches!(s.keyword().expect("kw"), Statement::Keyword(Keyword::Rule)));
        let _name = s.name().expect("name");
        s.expect_newline().expect("nl");
        assert!(matches!(s.keyword().expect("kw"), Statement::Variable(v) if v == "cflags"));
    }

    #[rstest]
    fn dollar_escapes_resolve() {
        let mut s = scan("x = a$$b$ c$:d\n");
        let Statement::Variable(_) = s.keyword().expect("kw") else { panic!("expected var") };
        s.expect_char(b'=').expect("eq");
        let value = s.string(false).expect("scan").expect("value");
        assert_eq!(value, vec![EvalPart::Lit("a$b c:d".into())]);
    }

    #[rstest]
    fn variable_references_split_chunks() {
        let mut s = scan("x = pre${var}post $simple\n");
        let _ = s.keyword().expect("kw");
        s.expect_char(b'=').expect("eq");
        let value = s.string(false).expect("scan").expect("value");
        assert_eq!(
            value,
            vec![
                EvalPart::Lit("pre".into()),
                EvalPart::Var("var".into()),
                EvalPart::Lit("post ".into()),
                EvalPart::Var("simple".into()),
            ]
        );
    }

    #[rstest]
    fn line_continuation_joins_values() {
        let mut s = scan("x = one $\n    two\n");
        let _ = s.keyword().expect("kw");
        s.expect_char(b'=').expect("eq");
        let value = s.string(false).expect("scan").expect("value");
        assert_eq!(value, vec![EvalPart::Lit("one two".into())]);
    }

    #[rstest]
    fn paths_stop_at_colon_and_pipes() {
        let mut s = scan("a.o b.o : cc\n");
        let paths = s.paths().expect("paths");
        assert_eq!(paths.len(), 2);
        s.expect_char(b':').expect("colon");
        assert_eq!(s.name().expect("rule"), "cc");
    }

    #[rstest]
    fn crlf_is_tolerated() {
        let mut s = scan("x = 1\r\ny = 2\r\n");
        assert!(matches!(s.keyword().expect("kw"), Statement::Variable(v) if v == "x"));
        s.expect_char(b'=').expect("eq");
        let _ = s.string(false).expect("scan");
        s.expect_newline().expect("nl");
        assert!(matches!(s.keyword().expect("kw"), Statement::Variable(v) if v == "y"));
    }

    #[rstest]
    fn unexpected_indent_is_an_error() {
        let mut s = scan("  oops\n");
        assert!(s.keyword().is_err());
    }

    #[rstest]
    fn indent_detects_bindings() {
        let mut s = scan("  var = 1\nnot_indented\n");
        assert!(s.indent().expect("indent"));
        assert_eq!(s.name().expect("name"), "var");
    }
}

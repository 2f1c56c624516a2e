//! Header-dependency ingestion: GCC-style Makefile depfiles and MSVC
//! `/showIncludes` output.
//!
//! The Makefile parser keeps samurai's tolerance for the escaping that
//! gcc and clang actually emit (doubled backslashes, escaped spaces and
//! `#`, `$$`, backslash-newline continuations). A variable reference or a
//! stray backslash is a parse error; whether that is fatal is the
//! caller's policy.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DepfileError {
    #[error("bad depfile[{0}]: contains variable reference")]
    VariableReference(usize),
    #[error("bad depfile[{0}]: '{1}' is not a valid target character")]
    BadTargetChar(usize, char),
    #[error("bad depfile: expected ':', saw '{0}'")]
    ExpectedColon(char),
    #[error("bad depfile: multiple outputs: {0} != {1}")]
    MultipleOutputs(String, String),
    #[error("bad depfile[{0}]: '\\' only allowed before newline")]
    StrayBackslash(usize),
}

struct Reader<'a> {
    src: &'a [u8],
    i: usize,
}

impl Reader<'_> {
    /// Next byte with CRLF collapsed to LF; `None` at end.
    fn getc(&mut self) -> Option<u8> {
        let c = *self.src.get(self.i)?;
        if c == b'\r' && self.src.get(self.i + 1) == Some(&b'\n') {
            self.i += 2;
            return Some(b'\n');
        }
        self.i += 1;
        Some(c)
    }
}

fn is_word_char(c: u8, saw_colon: bool) -> bool {
    c.is_ascii_alphanumeric() || b"$+,-./@\\_()".contains(&c) || (saw_colon && c == b':')
}

/// Parse one Makefile-style dependency rule: `target: dep dep ...` with
/// continuations. Returns the dependency paths.
pub fn parse_gcc_depfile(text: &[u8]) -> Result<Vec<String>, DepfileError> {
    let mut r = Reader { src: text, i: 0 };
    let mut deps: Vec<String> = Vec::new();
    let mut out: Option<Vec<u8>> = None;
    let mut buf: Vec<u8> = Vec::new();
    let mut saw_colon = false;

    let mut c = r.getc();
    'outer: loop {
        while let Some(ch) = c {
            if !is_word_char(ch, saw_colon) {
                break;
            }
            match ch {
                b'\\' => {
                    // Fold the doubled-backslash runs clang and gcc emit;
                    // an escaped space or `#` drops the backslash.
                    let mut n = 0_usize;
                    loop {
                        c = r.getc();
                        n += 1;
                        if n % 2 == 0 {
                            buf.push(b'\\');
                        }
                        if c != Some(b'\\') {
                            break;
                        }
                    }
                    if matches!(c, Some(b' ' | b'\t')) && n % 2 != 0 {
                        // escaped whitespace; fall through to push it
                    } else {
                        match c {
                            Some(b'#') => {}
                            Some(b'\n') => {
                                c = Some(b' ');
                                continue;
                            }
                            _ => {
                                if n % 2 != 0 {
                                    buf.push(b'\\');
                                }
                                continue;
                            }
                        }
                    }
                }
                b'$' => {
                    c = r.getc();
                    if c != Some(b'$') {
                        return Err(DepfileError::VariableReference(r.i));
                    }
                }
                _ => {}
            }
            if let Some(ch) = c {
                buf.push(ch);
            }
            c = r.getc();
        }

        if saw_colon {
            if let Some(ch) = c
                && !ch.is_ascii_whitespace()
            {
                return Err(DepfileError::BadTargetChar(r.i, ch as char));
            }
            if !buf.is_empty() {
                deps.push(String::from_utf8_lossy(&buf).into_owned());
            }
            if c == Some(b'\n') {
                saw_colon = false;
                while c == Some(b'\n') {
                    c = r.getc();
                }
            }
            if c.is_none() {
                break 'outer;
            }
        } else {
            while matches!(c, Some(b' ' | b'\t')) {
                c = r.getc();
            }
            let Some(ch) = c else { break 'outer };
            if ch != b':' {
                return Err(DepfileError::ExpectedColon(ch as char));
            }
            match &out {
                None => out = Some(buf.clone()),
                Some(prev) if *prev != buf => {
                    return Err(DepfileError::MultipleOutputs(
                        String::from_utf8_lossy(&buf).into_owned(),
                        String::from_utf8_lossy(prev).into_owned(),
                    ));
                }
                Some(_) => {}
            }
            saw_colon = true;
            c = r.getc();
        }

        buf.clear();
        loop {
            if c == Some(b'\\') {
                if r.getc() != Some(b'\n') {
                    return Err(DepfileError::StrayBackslash(r.i));
                }
            } else if !matches!(c, Some(b' ' | b'\t')) {
                break;
            }
            c = r.getc();
        }
    }
    Ok(deps)
}

/// Read and parse a depfile from disk. `Ok(None)` means the file does not
/// exist; the caller decides whether that is tolerable.
pub fn parse_gcc_depfile_at(path: &str, allowmissing: bool) -> Result<Option<Vec<String>>, DepfileError> {
    match std::fs::read(path) {
        Ok(bytes) => parse_gcc_depfile(&bytes).map(Some),
        Err(_) if allowmissing => Ok(Some(Vec::new())),
        Err(_) => Ok(None),
    }
}

/// Result of filtering MSVC `/showIncludes` output.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MsvcDeps {
    pub deps: Vec<String>,
    /// Stdout with the include lines (and the source echo) removed.
    pub filtered_output: String,
}

const DEFAULT_MSVC_PREFIX: &str = "Note: including file: ";

fn is_source_echo(line: &str) -> bool {
    let lower = line.to_lowercase();
    [".c", ".cc", ".cxx", ".cpp", ".c++"].iter().any(|ext| lower.ends_with(ext))
}

/// Split compiler stdout into discovered headers and the output the user
/// should actually see. System headers are dropped by the locale-sensitive
/// substring match ninja uses.
#[must_use]
pub fn parse_msvc_showincludes(output: &str, prefix: Option<&str>) -> MsvcDeps {
    let prefix = prefix.unwrap_or(DEFAULT_MSVC_PREFIX);
    let mut result = MsvcDeps::default();
    let mut seen_prefix = false;
    for line in output.lines() {
        let line = line.trim_end_matches([' ', '\t', '\r']);
        if !seen_prefix && is_source_echo(line) {
            // cl.exe echoes the name of the compiled file; ninja filters
            // it, so we do too.
            continue;
        }
        if let Some(rest) = line.strip_prefix(prefix) {
            seen_prefix = true;
            let path = rest.trim_start_matches([' ', '\t']).to_lowercase();
            if path.contains("program files") || path.contains("microsoft visual studio") {
                continue;
            }
            let absolute = if std::path::Path::new(&path).is_absolute() {
                path
            } else {
                std::env::current_dir()
                    .ok()
                    .and_then(|d| d.join(&path).to_str().map(ToOwned::to_owned))
                    .unwrap_or(path)
            };
            result.deps.push(absolute);
        } else {
            result.filtered_output.push_str(line);
            result.filtered_output.push('\n');
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn parse(text: &str) -> Result<Vec<String>, DepfileError> {
        parse_gcc_depfile(text.as_bytes())
    }

    #[rstest]
    fn parses_simple_rule() {
        let deps = parse("a.o: a.c h.h\n").expect("parse");
        assert_eq!(deps, ["a.c", "h.h"]);
    }

    #[rstest]
    fn continuation_lines_join() {
        let deps = parse("a.o: a.c \\\n  h1.h \\\n  h2.h\n").expect("parse");
        assert_eq!(deps, ["a.c", "h1.h", "h2.h"]);
    }

    #[rstest]
    fn escaped_spaces_stay_in_one_path() {
        let deps = parse("a.o: dir/my\\ file.h\n").expect("parse");
        assert_eq!(deps, ["dir/my file.h"]);
    }

    #[rstest]
    fn doubled_dollars_collapse() {
        let deps = parse("a.o: weird$$name.h\n").expect("parse");
        assert_eq!(deps, ["weird$name.h"]);
    }

    #[rstest]
    fn variable_reference_is_an_error() {
        assert!(matches!(parse("a.o: $(VAR)/x.h\n"), Err(DepfileError::VariableReference(_))));
    }

    #[rstest]
    fn mismatched_second_target_is_an_error() {
        assert!(matches!(
            parse("a.o: x.h\nb.o: y.h\n"),
            Err(DepfileError::MultipleOutputs(..))
        ));
    }

    #[rstest]
    fn repeated_identical_target_is_fine() {
        let deps = parse("a.o: x.h\na.o: y.h\n").expect("parse");
        assert_eq!(deps, ["x.h", "y.h"]);
    }

    #[rstest]
    fn missing_depfile_respects_allowmissing() {
        assert_eq!(parse_gcc_depfile_at("/no/such/depfile.d", true), Ok(Some(Vec::new())));
        assert_eq!(parse_gcc_depfile_at("/no/such/depfile.d", false), Ok(None));
    }

    #[rstest]
    fn msvc_filter_splits_includes_from_output() {
        let output = concat!(
            "main.cpp\n",
            "Note: including file: C:\\Program Files\\MSVC\\include\\stdio.h\n",
            "Note: including file:    src\\local.h\n",
            "some diagnostic\n",
        );
        let result = parse_msvc_showincludes(output, None);
        assert_eq!(result.deps.len(), 1);
        assert!(result.deps[0].ends_with("local.h"));
        assert_eq!(result.filtered_output, "some diagnostic\n");
    }

    #[rstest]
    fn msvc_custom_prefix_is_honored() {
        let output = "Hinweis: Einlesen der Datei: x.h\n";
        let result = parse_msvc_showincludes(output, Some("Hinweis: Einlesen der Datei: "));
        assert_eq!(result.deps.len(), 1);
    }
}

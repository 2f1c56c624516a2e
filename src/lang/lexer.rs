//! Tokenizer for the build description language.
//!
//! Tokens are produced on demand and never allocate beyond interning their
//! payload into the heap. End-of-line is a token at statement depth but is
//! suppressed inside `()`, `[]` and `{}` by a nesting counter.

use crate::lang::object::{Heap, Obj};
use crate::source::{Source, SourceLocation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Error(Obj),
    Eof,
    Eol,
    LParen,
    RParen,
    LBrack,
    RBrack,
    LCurl,
    RCurl,
    Dot,
    Comma,
    Colon,
    Question,
    Assign,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    PlusAssign,
    Eq,
    NEq,
    Gt,
    Geq,
    Lt,
    Leq,
    True,
    False,
    If,
    Elif,
    Else,
    Endif,
    And,
    Or,
    Not,
    NotIn,
    In,
    Foreach,
    Endforeach,
    Continue,
    Break,
    Identifier(Obj),
    Str(Obj),
    FStr(Obj),
    Number(i64),
    // `func` extension
    Func,
    Endfunc,
    Return,
    BitOr,
    ReturnType,
}

impl TokenKind {
    #[must_use]
    pub const fn describe(self) -> &'static str {
        match self {
            Self::Error(_) => "error",
            Self::Eof => "end of file",
            Self::Eol => "end of line",
            Self::LParen => "(",
            Self::RParen => ")",
            Self::LBrack => "[",
            Self::RBrack => "]",
            Self::LCurl => "{",
            Self::RCurl => "}",
            Self::Dot => ".",
            Self::Comma => ",",
            Self::Colon => ":",
            Self::Question => "?",
            Self::Assign => "=",
            Self::Plus => "+",
            Self::Minus => "-",
            Self::Star => "*",
            Self::Slash => "/",
            Self::Percent => "%",
            Self::PlusAssign => "+=",
            Self::Eq => "==",
            Self::NEq => "!=",
            Self::Gt => ">",
            Self::Geq => ">=",
            Self::Lt => "<",
            Self::Leq => "<=",
            Self::True => "true",
            Self::False => "false",
            Self::If => "if",
            Self::Elif => "elif",
            Self::Else => "else",
            Self::Endif => "endif",
            Self::And => "and",
            Self::Or => "or",
            Self::Not => "not",
            Self::NotIn => "not in",
            Self::In => "in",
            Self::Foreach => "foreach",
            Self::Endforeach => "endforeach",
            Self::Continue => "continue",
            Self::Break => "break",
            Self::Identifier(_) => "identifier",
            Self::Str(_) => "string",
            Self::FStr(_) => "fstring",
            Self::Number(_) => "number",
            Self::Func => "func",
            Self::Endfunc => "endfunc",
            Self::Return => "return",
            Self::BitOr => "|",
            Self::ReturnType => "->",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Token {
    pub kind: TokenKind,
    pub loc: SourceLocation,
}

/// Construction-time lexer behavior flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct LexerMode {
    /// Enable the `func`/`endfunc`/`return`/`->` extension keywords.
    pub extensions: bool,
    /// Track `fmt:off`/`fmt:on` comment spans for the formatter.
    pub formatter: bool,
}

pub struct Lexer<'src> {
    src: &'src [u8],
    i: usize,
    enclosing: u32,
    mode: LexerMode,
    fmt_off_at: Option<u32>,
    raw_blocks: Vec<SourceLocation>,
}

fn is_ident_start(c: u8) -> bool {
    c == b'_' || c.is_ascii_alphabetic()
}

fn is_ident(c: u8) -> bool {
    is_ident_start(c) || c.is_ascii_digit()
}

impl<'src> Lexer<'src> {
    #[must_use]
    pub fn new(source: &'src Source, mode: LexerMode) -> Self {
        Self {
            src: source.text(),
            i: 0,
            enclosing: 0,
            mode,
            fmt_off_at: None,
            raw_blocks: Vec::new(),
        }
    }

    /// Spans between `fmt:off` and `fmt:on` comments, recorded only in
    /// formatter mode.
    #[must_use]
    pub fn raw_blocks(&self) -> &[SourceLocation] {
        &self.raw_blocks
    }

    fn peek(&self) -> u8 {
        self.src.get(self.i).copied().unwrap_or(0)
    }

    fn peek_at(&self, ahead: usize) -> u8 {
        self.src.get(self.i + ahead).copied().unwrap_or(0)
    }

    fn bump(&mut self) -> u8 {
        let c = self.peek();
        if self.i < self.src.len() {
            self.i += 1;
        }
        c
    }

    fn loc_from(&self, start: usize) -> SourceLocation {
        SourceLocation::new(
            u32::try_from(start).unwrap_or(u32::MAX),
            u32::try_from(self.i - start).unwrap_or(u32::MAX),
        )
    }

    fn token(&self, kind: TokenKind, start: usize) -> Token {
        Token { kind, loc: self.loc_from(start) }
    }

    fn error(&self, heap: &mut Heap, start: usize, msg: &str) -> Token {
        let obj = heap.str_intern(msg.as_bytes());
        Token { kind: TokenKind::Error(obj), loc: self.loc_from(start) }
    }

    fn skip_insignificant(&mut self) {
        loop {
            match self.peek() {
                b' ' | b'\t' | b'\r' => {
                    self.bump();
                }
                b'\\' if self.peek_at(1) == b'\n' => {
                    // Line continuation is consumed whitespace.
                    self.bump();
                    self.bump();
                }
                b'#' => self.skip_comment(),
                b'\n' if self.enclosing > 0 => {
                    self.bump();
                }
                _ => return,
            }
        }
    }

    fn skip_comment(&mut self) {
        let start = self.i;
        while self.peek() != b'\n' && self.i < self.src.len() {
            self.bump();
        }
        if self.mode.formatter {
            let text = &self.src[start..self.i];
            let body: Vec<u8> = text[1..].iter().copied().filter(|c| *c != b' ').collect();
            if body == b"fmt:off" {
                self.fmt_off_at = Some(u32::try_from(start).unwrap_or(u32::MAX));
            } else if body == b"fmt:on"
                && let Some(off) = self.fmt_off_at.take()
            {
                let end = u32::try_from(self.i).unwrap_or(u32::MAX);
                self.raw_blocks.push(SourceLocation::new(off, end - off));
            }
        }
    }

    /// Produce the next token.
    pub fn next_token(&mut self, heap: &mut Heap) -> Token {
        self.skip_insignificant();
        let start = self.i;
        let c = self.peek();
        match c {
            0 => self.token(TokenKind::Eof, start),
            b'\n' => {
                self.bump();
                self.token(TokenKind::Eol, start)
            }
            b'(' => self.punct(TokenKind::LParen, true),
            b'[' => self.punct(TokenKind::LBrack, true),
            b'{' => self.punct(TokenKind::LCurl, true),
            b')' => self.punct_close(TokenKind::RParen),
            b']' => self.punct_close(TokenKind::RBrack),
            b'}' => self.punct_close(TokenKind::RCurl),
            b'.' => self.punct(TokenKind::Dot, false),
            b',' => self.punct(TokenKind::Comma, false),
            b':' => self.punct(TokenKind::Colon, false),
            b'?' => self.punct(TokenKind::Question, false),
            b'+' => self.maybe_two(TokenKind::Plus, b'=', TokenKind::PlusAssign),
            b'-' => {
                if self.mode.extensions && self.peek_at(1) == b'>' {
                    self.bump();
                    self.bump();
                    self.token(TokenKind::ReturnType, start)
                } else {
                    self.punct(TokenKind::Minus, false)
                }
            }
            b'*' => self.punct(TokenKind::Star, false),
            b'/' => self.punct(TokenKind::Slash, false),
            b'%' => self.punct(TokenKind::Percent, false),
            b'=' => self.maybe_two(TokenKind::Assign, b'=', TokenKind::Eq),
            b'>' => self.maybe_two(TokenKind::Gt, b'=', TokenKind::Geq),
            b'<' => self.maybe_two(TokenKind::Lt, b'=', TokenKind::Leq),
            b'|' if self.mode.extensions => self.punct(TokenKind::BitOr, false),
            b'!' => {
                if self.peek_at(1) == b'=' {
                    self.bump();
                    self.bump();
                    self.token(TokenKind::NEq, start)
                } else {
                    self.bump();
                    self.error(heap, start, "unexpected character '!'")
                }
            }
            b'\'' => self.lex_string(heap, false),
            b'f' if self.peek_at(1) == b'\'' => {
                self.bump();
                self.lex_string(heap, true)
            }
            c if c.is_ascii_digit() => self.lex_number(heap),
            c if is_ident_start(c) => self.lex_identifier(heap),
            other => {
                self.bump();
                self.error(heap, start, &format!("unexpected character '{}'", other as char))
            }
        }
    }

    fn punct(&mut self, kind: TokenKind, open: bool) -> Token {
        let start = self.i;
        self.bump();
        if open {
            self.enclosing += 1;
        }
        self.token(kind, start)
    }

    fn punct_close(&mut self, kind: TokenKind) -> Token {
        let start = self.i;
        self.bump();
        self.enclosing = self.enclosing.saturating_sub(1);
        self.token(kind, start)
    }

    fn maybe_two(&mut self, single: TokenKind, second: u8, double: TokenKind) -> Token {
        let start = self.i;
        self.bump();
        if self.peek() == second {
            self.bump();
            self.token(double, start)
        } else {
            self.token(single, start)
        }
    }

    fn lex_identifier(&mut self, heap: &mut Heap) -> Token {
        let start = self.i;
        while is_ident(self.peek()) {
            self.bump();
        }
        let text = &self.src[start..self.i];
        let kind = match text {
            b"true" => TokenKind::True,
            b"false" => TokenKind::False,
            b"if" => TokenKind::If,
            b"elif" => TokenKind::Elif,
            b"else" => TokenKind::Else,
            b"endif" => TokenKind::Endif,
            b"and" => TokenKind::And,
            b"or" => TokenKind::Or,
            b"not" => return self.lex_not(heap, start),
            b"in" => TokenKind::In,
            b"foreach" => TokenKind::Foreach,
            b"endforeach" => TokenKind::Endforeach,
            b"continue" => TokenKind::Continue,
            b"break" => TokenKind::Break,
            b"func" if self.mode.extensions => TokenKind::Func,
            b"endfunc" if self.mode.extensions => TokenKind::Endfunc,
            b"return" if self.mode.extensions => TokenKind::Return,
            other => TokenKind::Identifier(heap.str_intern(other)),
        };
        self.token(kind, start)
    }

    /// `not` directly followed by `in` merges into a single token.
    fn lex_not(&mut self, heap: &mut Heap, start: usize) -> Token {
        let _ = heap;
        let mut j = self.i;
        while matches!(self.src.get(j), Some(b' ' | b'\t')) {
            j += 1;
        }
        if self.src[j..].starts_with(b"in")
            && !self.src.get(j + 2).copied().is_some_and(is_ident)
        {
            self.i = j + 2;
            return self.token(TokenKind::NotIn, start);
        }
        self.token(TokenKind::Not, start)
    }

    fn lex_number(&mut self, heap: &mut Heap) -> Token {
        let start = self.i;
        let (radix, digits_start) = if self.peek() == b'0' {
            match self.peek_at(1) {
                b'x' | b'X' => (16, 2),
                b'o' | b'O' => (8, 2),
                b'b' | b'B' => (2, 2),
                _ => (10, 0),
            }
        } else {
            (10, 0)
        };
        for _ in 0..digits_start {
            self.bump();
        }
        let digits_from = self.i;
        while self.peek().is_ascii_alphanumeric() {
            self.bump();
        }
        let text = &self.src[digits_from..self.i];
        if text.is_empty() && digits_start > 0 {
            return self.error(heap, start, "expected digits after numeric base prefix");
        }
        let mut value: i64 = 0;
        for b in text {
            let Some(d) = (*b as char).to_digit(radix) else {
                return self.error(heap, start, &format!("invalid digit '{}'", *b as char));
            };
            let Some(next) = value.checked_mul(i64::from(radix)).and_then(|v| v.checked_add(i64::from(d)))
            else {
                return self.error(heap, start, "number literal out of range");
            };
            value = next;
        }
        self.token(TokenKind::Number(value), start)
    }

    fn lex_string(&mut self, heap: &mut Heap, fstring: bool) -> Token {
        let start = if fstring { self.i - 1 } else { self.i };
        self.bump(); // opening quote
        if !fstring && self.peek() == b'\'' && self.peek_at(1) == b'\'' {
            self.bump();
            self.bump();
            return self.lex_multiline(heap, start);
        }
        let mut buf = Vec::new();
        loop {
            match self.peek() {
                0 | b'\n' => {
                    return self.error(heap, start, "unterminated string");
                }
                b'\'' => {
                    self.bump();
                    break;
                }
                b'\\' => {
                    self.bump();
                    self.lex_escape(&mut buf);
                }
                _ => buf.push(self.bump()),
            }
        }
        let obj = heap.str_intern(&buf);
        let kind = if fstring { TokenKind::FStr(obj) } else { TokenKind::Str(obj) };
        self.token(kind, start)
    }

    /// Triple-quoted strings are verbatim: no escape processing.
    fn lex_multiline(&mut self, heap: &mut Heap, start: usize) -> Token {
        let body_start = self.i;
        loop {
            if self.i >= self.src.len() {
                return self.error(heap, start, "unterminated multiline string");
            }
            if self.peek() == b'\'' && self.peek_at(1) == b'\'' && self.peek_at(2) == b'\'' {
                let body = &self.src[body_start..self.i];
                let obj = heap.str_intern(body);
                self.bump();
                self.bump();
                self.bump();
                return self.token(TokenKind::Str(obj), start);
            }
            self.bump();
        }
    }

    fn lex_escape(&mut self, buf: &mut Vec<u8>) {
        let c = self.bump();
        match c {
            b'\\' => buf.push(b'\\'),
            b'\'' => buf.push(b'\''),
            b'a' => buf.push(0x07),
            b'b' => buf.push(0x08),
            b'f' => buf.push(0x0c),
            b'n' => buf.push(b'\n'),
            b'r' => buf.push(b'\r'),
            b't' => buf.push(b'\t'),
            b'v' => buf.push(0x0b),
            b'0'..=b'7' => {
                let mut value = u32::from(c - b'0');
                for _ in 0..2 {
                    let d = self.peek();
                    if !(b'0'..=b'7').contains(&d) {
                        break;
                    }
                    self.bump();
                    value = value * 8 + u32::from(d - b'0');
                }
                buf.push((value & 0xff) as u8);
            }
            b'x' => self.lex_hex_escape(buf, 2, false),
            b'u' => self.lex_hex_escape(buf, 4, true),
            b'U' => self.lex_hex_escape(buf, 8, true),
            // Unknown escapes pass through untouched.
            other => {
                buf.push(b'\\');
                if other != 0 {
                    buf.push(other);
                }
            }
        }
    }

    fn lex_hex_escape(&mut self, buf: &mut Vec<u8>, digits: usize, unicode: bool) {
        let mut value: u32 = 0;
        let mut consumed = 0;
        while consumed < digits {
            let Some(d) = (self.peek() as char).to_digit(16) else { break };
            self.bump();
            value = value << 4 | d;
            consumed += 1;
        }
        if consumed == 0 {
            buf.push(b'\\');
            buf.push(if digits == 2 { b'x' } else if digits == 4 { b'u' } else { b'U' });
            return;
        }
        if unicode {
            // Encode the code point as UTF-8; invalid points fall back to
            // the replacement character.
            let ch = char::from_u32(value).unwrap_or('\u{fffd}');
            let mut tmp = [0_u8; 4];
            buf.extend_from_slice(ch.encode_utf8(&mut tmp).as_bytes());
        } else {
            buf.push((value & 0xff) as u8);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn lex_all(text: &str) -> (Vec<TokenKind>, Heap) {
        let mut heap = Heap::new();
        let source = Source::anonymous(text.as_bytes().to_vec());
        let mut lexer = Lexer::new(&source, LexerMode { extensions: true, formatter: false });
        let mut kinds = Vec::new();
        loop {
            let tok = lexer.next_token(&mut heap);
            let done = tok.kind == TokenKind::Eof;
            kinds.push(tok.kind);
            if done {
                break;
            }
        }
        (kinds, heap)
    }

    fn lex_one_string(text: &str) -> Vec<u8> {
        let (kinds, heap) = lex_all(text);
        match kinds[0] {
            TokenKind::Str(obj) | TokenKind::FStr(obj) => heap.str_bytes(obj).to_vec(),
            other => panic!("expected string token, got {other:?}"),
        }
    }

    #[rstest]
    #[case(r"'\n'", vec![0x0a])]
    #[case(r"'\xff'", vec![0xff])]
    #[case(r"'é'", vec![0xc3, 0xa9])]
    #[case(r"'\U0001F600'", "\u{1F600}".as_bytes().to_vec())]
    #[case(r"'\101'", vec![0x41])]
    #[case(r"'\a\b\f\r\t\v'", vec![0x07, 0x08, 0x0c, 0x0d, 0x09, 0x0b])]
    #[case(r"'\\'", vec![b'\\'])]
    #[case(r"'\''", vec![b'\'']) ]
    #[case(r"'\q'", vec![b'\\', b'q'])]
    fn escape_sequences_produce_exact_bytes(#[case] text: &str, #[case] expected: Vec<u8>) {
        assert_eq!(lex_one_string(text), expected);
    }

    #[rstest]
    fn multiline_strings_are_verbatim() {
        assert_eq!(lex_one_string("'''a\\nb'''"), b"a\\nb".to_vec());
    }

    #[rstest]
    #[case("0", 0)]
    #[case("42", 42)]
    #[case("0x1f", 31)]
    #[case("0o17", 15)]
    #[case("0b101", 5)]
    fn number_bases(#[case] text: &str, #[case] expected: i64) {
        let (kinds, _) = lex_all(text);
        assert_eq!(kinds[0], TokenKind::Number(expected));
    }

    #[rstest]
    fn number_overflow_is_an_error_token() {
        let (kinds, _) = lex_all("99999999999999999999999999");
        assert!(matches!(kinds[0], TokenKind::Error(_)));
    }

    #[rstest]
    fn not_in_merges_into_one_token() {
        let (kinds, _) = lex_all("a not in b");
        assert!(kinds.contains(&TokenKind::NotIn));
        assert!(!kinds.contains(&TokenKind::Not));
    }

    #[rstest]
    fn newlines_suppressed_inside_brackets() {
        let (kinds, _) = lex_all("[1,\n2]");
        assert!(!kinds.contains(&TokenKind::Eol));
        let (kinds, _) = lex_all("1\n2");
        assert!(kinds.contains(&TokenKind::Eol));
    }

    #[rstest]
    fn line_continuation_is_whitespace() {
        let (kinds, _) = lex_all("1 \\\n+ 2");
        assert_eq!(
            kinds,
            vec![
                TokenKind::Number(1),
                TokenKind::Plus,
                TokenKind::Number(2),
                TokenKind::Eof
            ]
        );
    }

    #[rstest]
    fn comments_run_to_end_of_line() {
        let (kinds, _) = lex_all("1 # two three\n2");
        assert_eq!(
            kinds,
            vec![
                TokenKind::Number(1),
                TokenKind::Eol,
                TokenKind::Number(2),
                TokenKind::Eof
            ]
        );
    }

    #[rstest]
    fn formatter_mode_records_raw_blocks() {
        let mut heap = Heap::new();
        let source = Source::anonymous(b"# fmt:off\nx = 1\n# fmt:on\n".to_vec());
        let mut lexer = Lexer::new(&source, LexerMode { extensions: false, formatter: true });
        loop {
            if lexer.next_token(&mut heap).kind == TokenKind::Eof {
                break;
            }
        }
        assert_eq!(lexer.raw_blocks().len(), 1);
    }

    #[rstest]
    fn fstring_token_keeps_placeholders() {
        assert_eq!(lex_one_string("f'hello @who@'"), b"hello @who@".to_vec());
    }

    #[rstest]
    fn arrow_requires_extension_mode() {
        let (kinds, _) = lex_all("-> x");
        assert_eq!(kinds[0], TokenKind::ReturnType);
    }
}

//! Recursive-descent parser with Pratt operator precedence.
//!
//! On error the parser records a diagnostic, resynchronizes to the next
//! end-of-line at bracket depth zero, and keeps going, so a single run
//! reports as many problems as possible.

use crate::diagnostics::{DiagnosticStore, Level};
use crate::lang::ast::{Arguments, Ast, BinOp, IfArm, NodeId, NodeKind, ParamDecl, UnOp};
use crate::lang::lexer::{Lexer, LexerMode, Token, TokenKind};
use crate::lang::object::{Heap, Obj};
use crate::lang::types::{TypeRegistry, TypeTag, tag};
use crate::source::{Source, SourceLocation};

/// Binding powers, low to high. Assignment and ternary are handled
/// structurally; everything else goes through the Pratt loop.
fn binding_power(kind: TokenKind) -> Option<(BinOp, u8)> {
    match kind {
        TokenKind::Or => Some((BinOp::Or, 1)),
        TokenKind::And => Some((BinOp::And, 2)),
        TokenKind::Eq => Some((BinOp::Eq, 3)),
        TokenKind::NEq => Some((BinOp::NEq, 3)),
        TokenKind::In => Some((BinOp::In, 3)),
        TokenKind::NotIn => Some((BinOp::NotIn, 3)),
        TokenKind::Lt => Some((BinOp::Lt, 4)),
        TokenKind::Leq => Some((BinOp::Leq, 4)),
        TokenKind::Gt => Some((BinOp::Gt, 4)),
        TokenKind::Geq => Some((BinOp::Geq, 4)),
        TokenKind::Plus => Some((BinOp::Add, 5)),
        TokenKind::Minus => Some((BinOp::Sub, 5)),
        TokenKind::Star => Some((BinOp::Mul, 6)),
        TokenKind::Slash => Some((BinOp::Div, 6)),
        TokenKind::Percent => Some((BinOp::Mod, 6)),
        _ => None,
    }
}

pub struct Parser<'a, 'src> {
    lexer: Lexer<'src>,
    heap: &'a mut Heap,
    types: &'a mut TypeRegistry,
    diags: &'a mut DiagnosticStore,
    src_idx: u32,
    cur: Token,
    next: Token,
    ast: Ast,
    ok: bool,
}

impl<'a, 'src> Parser<'a, 'src> {
    /// Parse one source buffer into an AST. Returns the AST and whether it
    /// parsed without errors.
    pub fn parse(
        source: &'src Source,
        heap: &'a mut Heap,
        types: &'a mut TypeRegistry,
        diags: &'a mut DiagnosticStore,
        src_idx: u32,
        mode: LexerMode,
    ) -> (Ast, bool) {
        let mut lexer = Lexer::new(source, mode);
        let cur = lexer.next_token(heap);
        let next = lexer.next_token(heap);
        let mut parser = Parser {
            lexer,
            heap,
            types,
            diags,
            src_idx,
            cur,
            next,
            ast: Ast::new(),
            ok: true,
        };
        let stmts = parser.parse_block(&[]);
        parser.ast.stmts = stmts;
        (parser.ast, parser.ok)
    }

    fn advance(&mut self) -> Token {
        let tok = self.cur;
        self.cur = self.next;
        self.next = self.lexer.next_token(self.heap);
        tok
    }

    fn error_at(&mut self, loc: SourceLocation, msg: impl Into<String>) {
        self.ok = false;
        self.diags.push(self.src_idx, loc, Level::Error, msg);
    }

    fn unexpected(&mut self, expected: &str) {
        let got = self.cur.kind.describe();
        let loc = self.cur.loc;
        self.error_at(loc, format!("expected {expected}, got {got}"));
    }

    /// Skip to the next end-of-line so later statements still parse.
    fn resync(&mut self) {
        while !matches!(self.cur.kind, TokenKind::Eol | TokenKind::Eof) {
            self.advance();
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> bool {
        if self.cur.kind == kind {
            self.advance();
            true
        } else {
            self.unexpected(what);
            false
        }
    }

    fn skip_eol(&mut self) {
        while self.cur.kind == TokenKind::Eol {
            self.advance();
        }
    }

    fn block_terminator(&self, terminators: &[TokenKind]) -> bool {
        terminators.contains(&self.cur.kind) || self.cur.kind == TokenKind::Eof
    }

    fn parse_block(&mut self, terminators: &[TokenKind]) -> Vec<NodeId> {
        let mut stmts = Vec::new();
        loop {
            self.skip_eol();
            if self.block_terminator(terminators) {
                return stmts;
            }
            if let Some(stmt) = self.parse_stmt() {
                stmts.push(stmt);
            } else {
                self.resync();
            }
        }
    }

    fn parse_stmt(&mut self) -> Option<NodeId> {
        let loc = self.cur.loc;
        match self.cur.kind {
            TokenKind::If => self.parse_if(),
            TokenKind::Foreach => self.parse_foreach(),
            TokenKind::Continue => {
                self.advance();
                Some(self.ast.push(NodeKind::Continue, loc))
            }
            TokenKind::Break => {
                self.advance();
                Some(self.ast.push(NodeKind::Break, loc))
            }
            TokenKind::Func if matches!(self.next.kind, TokenKind::Identifier(_)) => {
                self.parse_func_def(true)
            }
            TokenKind::Return => {
                self.advance();
                let value = if matches!(self.cur.kind, TokenKind::Eol | TokenKind::Eof) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                Some(self.ast.push(NodeKind::Return(value), loc))
            }
            TokenKind::Identifier(name)
                if matches!(self.next.kind, TokenKind::Assign | TokenKind::PlusAssign) =>
            {
                self.advance();
                let add = self.cur.kind == TokenKind::PlusAssign;
                self.advance();
                let value = self.parse_expr()?;
                let kind = if add {
                    NodeKind::AddAssign { name, value }
                } else {
                    NodeKind::Assign { name, value }
                };
                Some(self.ast.push(kind, loc))
            }
            _ => self.parse_expr(),
        }
    }

    fn parse_if(&mut self) -> Option<NodeId> {
        let loc = self.cur.loc;
        self.advance();
        let mut arms = Vec::new();
        let cond = self.parse_expr()?;
        let body =
            self.parse_block(&[TokenKind::Elif, TokenKind::Else, TokenKind::Endif]);
        arms.push(IfArm { cond: Some(cond), body });
        loop {
            match self.cur.kind {
                TokenKind::Elif => {
                    self.advance();
                    let cond = self.parse_expr()?;
                    let body = self
                        .parse_block(&[TokenKind::Elif, TokenKind::Else, TokenKind::Endif]);
                    arms.push(IfArm { cond: Some(cond), body });
                }
                TokenKind::Else => {
                    self.advance();
                    let body = self.parse_block(&[TokenKind::Endif]);
                    arms.push(IfArm { cond: None, body });
                }
                _ => break,
            }
        }
        self.expect(TokenKind::Endif, "endif");
        Some(self.ast.push(NodeKind::If { arms }, loc))
    }

    fn parse_foreach(&mut self) -> Option<NodeId> {
        let loc = self.cur.loc;
        self.advance();
        let TokenKind::Identifier(first) = self.cur.kind else {
            self.unexpected("iteration variable");
            return None;
        };
        self.advance();
        let second = if self.cur.kind == TokenKind::Comma {
            self.advance();
            let TokenKind::Identifier(second) = self.cur.kind else {
                self.unexpected("second iteration variable");
                return None;
            };
            self.advance();
            Some(second)
        } else {
            None
        };
        if !self.expect(TokenKind::Colon, "':'") {
            return None;
        }
        let iterable = self.parse_expr()?;
        let body = self.parse_block(&[TokenKind::Endforeach]);
        self.expect(TokenKind::Endforeach, "endforeach");
        Some(self.ast.push(NodeKind::Foreach { vars: (first, second), iterable, body }, loc))
    }

    fn parse_func_def(&mut self, named: bool) -> Option<NodeId> {
        let loc = self.cur.loc;
        self.advance(); // func
        let name = if named {
            let TokenKind::Identifier(name) = self.cur.kind else {
                self.unexpected("function name");
                return None;
            };
            self.advance();
            Some(name)
        } else {
            None
        };
        if !self.expect(TokenKind::LParen, "'('") {
            return None;
        }
        let mut params = Vec::new();
        while self.cur.kind != TokenKind::RParen {
            let TokenKind::Identifier(pname) = self.cur.kind else {
                self.unexpected("parameter name");
                return None;
            };
            self.advance();
            let ty = if self.cur.kind == TokenKind::Colon {
                self.advance();
                self.parse_type_expr()?
            } else {
                tag::ANY
            };
            let default = if self.cur.kind == TokenKind::Assign {
                self.advance();
                Some(self.parse_expr()?)
            } else {
                None
            };
            params.push(ParamDecl { name: pname, ty, default });
            if self.cur.kind == TokenKind::Comma {
                self.advance();
            } else {
                break;
            }
        }
        if !self.expect(TokenKind::RParen, "')'") {
            return None;
        }
        let return_type = if self.cur.kind == TokenKind::ReturnType {
            self.advance();
            self.parse_type_expr()?
        } else {
            tag::NULL
        };
        let body = self.parse_block(&[TokenKind::Endfunc]);
        self.expect(TokenKind::Endfunc, "endfunc");
        Some(self.ast.push(NodeKind::FuncDef { name, params, return_type, body }, loc))
    }

    /// `identifier | func`, optionally `[inner]`, joined by `|`.
    fn parse_type_expr(&mut self) -> Option<TypeTag> {
        let mut result = self.parse_type_atom()?;
        while self.cur.kind == TokenKind::BitOr {
            self.advance();
            let rhs = self.parse_type_atom()?;
            result = self.types.or(result, rhs);
        }
        Some(result)
    }

    fn parse_type_atom(&mut self) -> Option<TypeTag> {
        let base = match self.cur.kind {
            TokenKind::Func => {
                self.advance();
                tag::CALLABLE
            }
            TokenKind::Identifier(name) => {
                let name = self.heap.str_display(name);
                self.advance();
                match name.as_str() {
                    "any" => tag::ANY,
                    "void" | "null" => tag::NULL,
                    "bool" => tag::BOOL,
                    "int" | "number" => tag::NUMBER,
                    "str" | "string" => tag::STR,
                    "list" | "array" => tag::ARRAY,
                    "dict" => tag::DICT,
                    "file" => tag::FILE,
                    "glob" => tag::ANY.glob(),
                    "listify" => tag::ANY.listify(),
                    other => {
                        let loc = self.cur.loc;
                        self.error_at(loc, format!("unknown type '{other}'"));
                        return None;
                    }
                }
            }
            _ => {
                self.unexpected("type");
                return None;
            }
        };
        if self.cur.kind == TokenKind::LBrack {
            self.advance();
            let inner = self.parse_type_expr()?;
            if !self.expect(TokenKind::RBrack, "']'") {
                return None;
            }
            return Some(self.types.nested(base, inner));
        }
        Some(base)
    }

    fn parse_expr(&mut self) -> Option<NodeId> {
        let loc = self.cur.loc;
        let cond = self.parse_binary(0)?;
        if self.cur.kind != TokenKind::Question {
            return Some(cond);
        }
        self.advance();
        let then = self.parse_expr()?;
        if !self.expect(TokenKind::Colon, "':'") {
            return None;
        }
        let otherwise = self.parse_expr()?;
        Some(self.ast.push(NodeKind::Ternary { cond, then, otherwise }, loc))
    }

    fn parse_binary(&mut self, min_bp: u8) -> Option<NodeId> {
        let mut lhs = self.parse_unary()?;
        while let Some((op, bp)) = binding_power(self.cur.kind) {
            if bp <= min_bp {
                break;
            }
            let loc = self.cur.loc;
            self.advance();
            let rhs = self.parse_binary(bp)?;
            lhs = self.ast.push(NodeKind::Binary { op, lhs, rhs }, loc);
        }
        Some(lhs)
    }

    fn parse_unary(&mut self) -> Option<NodeId> {
        let loc = self.cur.loc;
        let op = match self.cur.kind {
            TokenKind::Not => Some(UnOp::Not),
            TokenKind::Minus => Some(UnOp::Negate),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let expr = self.parse_unary()?;
            return Some(self.ast.push(NodeKind::Unary { op, expr }, loc));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Option<NodeId> {
        let mut expr = self.parse_primary()?;
        loop {
            let loc = self.cur.loc;
            match self.cur.kind {
                TokenKind::Dot => {
                    self.advance();
                    let TokenKind::Identifier(name) = self.cur.kind else {
                        self.unexpected("method name");
                        return None;
                    };
                    self.advance();
                    let (args, has_parens) = if self.cur.kind == TokenKind::LParen {
                        self.advance();
                        (self.parse_args()?, true)
                    } else {
                        (Arguments::default(), false)
                    };
                    expr = self.ast.push(
                        NodeKind::Method { receiver: expr, name, args, has_parens },
                        loc,
                    );
                }
                TokenKind::LParen => {
                    self.advance();
                    let args = self.parse_args()?;
                    expr = self.ast.push(NodeKind::Call { callee: expr, args }, loc);
                }
                TokenKind::LBrack => {
                    self.advance();
                    let index = self.parse_expr()?;
                    if !self.expect(TokenKind::RBrack, "']'") {
                        return None;
                    }
                    expr = self.ast.push(NodeKind::Index { lhs: expr, index }, loc);
                }
                _ => return Some(expr),
            }
        }
    }

    /// Arguments up to the closing paren: positionals, then keywords. A
    /// positional after a keyword is rejected.
    fn parse_args(&mut self) -> Option<Arguments> {
        let mut args = Arguments::default();
        while self.cur.kind != TokenKind::RParen {
            if let TokenKind::Identifier(name) = self.cur.kind
                && self.next.kind == TokenKind::Colon
            {
                self.advance();
                self.advance();
                let value = self.parse_expr()?;
                args.kwargs.push((name, value));
            } else {
                if !args.kwargs.is_empty() {
                    let loc = self.cur.loc;
                    self.error_at(loc, "positional argument after keyword argument");
                    return None;
                }
                let value = self.parse_expr()?;
                args.positional.push(value);
            }
            if self.cur.kind == TokenKind::Comma {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(TokenKind::RParen, "')'");
        Some(args)
    }

    fn parse_primary(&mut self) -> Option<NodeId> {
        let loc = self.cur.loc;
        match self.cur.kind {
            TokenKind::True => {
                self.advance();
                Some(self.ast.push(NodeKind::Literal(Obj::TRUE), loc))
            }
            TokenKind::False => {
                self.advance();
                Some(self.ast.push(NodeKind::Literal(Obj::FALSE), loc))
            }
            TokenKind::Number(n) => {
                self.advance();
                let obj = self.heap.make_number(n);
                Some(self.ast.push(NodeKind::Literal(obj), loc))
            }
            TokenKind::Str(s) => {
                self.advance();
                Some(self.ast.push(NodeKind::Literal(s), loc))
            }
            TokenKind::FStr(s) => {
                self.advance();
                Some(self.expand_fstring(s, loc))
            }
            TokenKind::Identifier(name) => {
                self.advance();
                Some(self.ast.push(NodeKind::Id(name), loc))
            }
            TokenKind::LParen => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect(TokenKind::RParen, "')'");
                Some(expr)
            }
            TokenKind::LBrack => {
                self.advance();
                let mut items = Vec::new();
                while self.cur.kind != TokenKind::RBrack {
                    items.push(self.parse_expr()?);
                    if self.cur.kind == TokenKind::Comma {
                        self.advance();
                    } else {
                        break;
                    }
                }
                self.expect(TokenKind::RBrack, "']'");
                Some(self.ast.push(NodeKind::Array(items), loc))
            }
            TokenKind::LCurl => {
                self.advance();
                let mut entries = Vec::new();
                while self.cur.kind != TokenKind::RCurl {
                    let key = self.parse_expr()?;
                    if !self.expect(TokenKind::Colon, "':'") {
                        return None;
                    }
                    let value = self.parse_expr()?;
                    entries.push((key, value));
                    if self.cur.kind == TokenKind::Comma {
                        self.advance();
                    } else {
                        break;
                    }
                }
                self.expect(TokenKind::RCurl, "'}'");
                Some(self.ast.push(NodeKind::Dict(entries), loc))
            }
            TokenKind::Func => self.parse_func_def(false),
            TokenKind::Error(msg) => {
                let msg = self.heap.str_display(msg);
                self.advance();
                self.error_at(loc, msg);
                None
            }
            _ => {
                self.unexpected("expression");
                None
            }
        }
    }

    /// Expand `f'a @x@ b'` into `'a ' + stringify(x) + ' b'` node chains.
    fn expand_fstring(&mut self, content: Obj, loc: SourceLocation) -> NodeId {
        let bytes = self.heap.str_bytes(content).to_vec();
        let mut parts: Vec<NodeId> = Vec::new();
        let mut lit = Vec::new();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'@' {
                // Find a matching `@` with a valid identifier between.
                if let Some(rel_end) = bytes[i + 1..].iter().position(|b| *b == b'@') {
                    let name = &bytes[i + 1..i + 1 + rel_end];
                    let valid = !name.is_empty()
                        && name
                            .iter()
                            .all(|b| b.is_ascii_alphanumeric() || *b == b'_');
                    if valid {
                        let lit_obj = self.heap.str_intern(&lit);
                        lit.clear();
                        parts.push(self.ast.push(NodeKind::Literal(lit_obj), loc));
                        let id_obj = self.heap.str_intern(name);
                        let id_node = self.ast.push(NodeKind::Id(id_obj), loc);
                        parts.push(self.ast.push(NodeKind::Stringify(id_node), loc));
                        i += rel_end + 2;
                        continue;
                    }
                }
            }
            lit.push(bytes[i]);
            i += 1;
        }
        let tail = self.heap.str_intern(&lit);
        parts.push(self.ast.push(NodeKind::Literal(tail), loc));
        let mut iter = parts.into_iter();
        let first = iter.next().unwrap_or_else(|| {
            let empty = self.heap.str_intern(b"");
            self.ast.push(NodeKind::Literal(empty), loc)
        });
        iter.fold(first, |lhs, rhs| {
            self.ast.push(NodeKind::Binary { op: BinOp::Add, lhs, rhs }, loc)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    struct Parsed {
        ast: Ast,
        heap: Heap,
        ok: bool,
        diags: DiagnosticStore,
    }

    fn parse(text: &str) -> Parsed {
        let source = Source::anonymous(text.as_bytes().to_vec());
        let mut heap = Heap::new();
        let mut types = TypeRegistry::new();
        let mut diags = DiagnosticStore::new();
        let (ast, ok) = Parser::parse(
            &source,
            &mut heap,
            &mut types,
            &mut diags,
            0,
            LexerMode { extensions: true, formatter: false },
        );
        Parsed { ast, heap, ok, diags }
    }

    #[rstest]
    fn precedence_binds_or_loosest() {
        // `a or b and c == d` parses as `a or (b and (c == d))`.
        let p = parse("a or b and c == d");
        assert!(p.ok);
        let root = p.ast.get(p.ast.stmts[0]);
        let NodeKind::Binary { op: BinOp::Or, rhs, .. } = root.kind else {
            panic!("expected top-level or, got {:?}", root.kind);
        };
        let NodeKind::Binary { op: BinOp::And, rhs: and_rhs, .. } = p.ast.get(rhs).kind else {
            panic!("expected and under or");
        };
        let NodeKind::Binary { op: BinOp::Eq, .. } = p.ast.get(and_rhs).kind else {
            panic!("expected eq under and");
        };
    }

    #[rstest]
    fn fstring_expands_to_concat_chain() {
        let p = parse("f'hello @who@'");
        assert!(p.ok);
        // 'hello ' + str(who) + ''
        let root = p.ast.get(p.ast.stmts[0]);
        let NodeKind::Binary { op: BinOp::Add, lhs, rhs } = root.kind else {
            panic!("expected concat chain");
        };
        let NodeKind::Literal(tail) = p.ast.get(rhs).kind else {
            panic!("expected trailing literal");
        };
        assert_eq!(p.heap.str_bytes(tail), b"");
        let NodeKind::Binary { op: BinOp::Add, lhs: hd, rhs: mid } = p.ast.get(lhs).kind else {
            panic!("expected inner concat");
        };
        let NodeKind::Literal(head) = p.ast.get(hd).kind else { panic!("expected literal") };
        assert_eq!(p.heap.str_bytes(head), b"hello ");
        assert!(matches!(p.ast.get(mid).kind, NodeKind::Stringify(_)));
    }

    #[rstest]
    fn keyword_arguments_follow_positionals() {
        let p = parse("project('demo', version: '1.0')");
        assert!(p.ok);
        let NodeKind::Call { args, .. } = &p.ast.get(p.ast.stmts[0]).kind else {
            panic!("expected call");
        };
        assert_eq!(args.positional.len(), 1);
        assert_eq!(args.kwargs.len(), 1);
    }

    #[rstest]
    fn positional_after_keyword_is_rejected() {
        let p = parse("f(a: 1, 2)");
        assert!(!p.ok);
    }

    #[rstest]
    fn parser_resynchronizes_after_errors() {
        let p = parse("x = = 1\ny = 2\n");
        assert!(!p.ok);
        // The second statement still parsed.
        assert!(p.ast.stmts.len() >= 1);
        assert!(p.diags.has_errors());
    }

    #[rstest]
    fn if_chain_collects_arms() {
        let p = parse("if a\n1\nelif b\n2\nelse\n3\nendif\n");
        assert!(p.ok);
        let NodeKind::If { arms } = &p.ast.get(p.ast.stmts[0]).kind else {
            panic!("expected if");
        };
        assert_eq!(arms.len(), 3);
        assert!(arms[2].cond.is_none());
    }

    #[rstest]
    fn foreach_supports_two_variables() {
        let p = parse("foreach k, v : d\nk\nendforeach\n");
        assert!(p.ok);
        let NodeKind::Foreach { vars, .. } = &p.ast.get(p.ast.stmts[0]).kind else {
            panic!("expected foreach");
        };
        assert!(vars.1.is_some());
    }

    #[rstest]
    fn anonymous_func_is_an_expression() {
        let p = parse("g = (func() -> int\nreturn 1\nendfunc)");
        assert!(p.ok);
        let NodeKind::Assign { value, .. } = p.ast.get(p.ast.stmts[0]).kind else {
            panic!("expected assignment");
        };
        assert!(matches!(p.ast.get(value).kind, NodeKind::FuncDef { name: None, .. }));
    }

    #[rstest]
    fn method_without_parens_is_member_access() {
        let p = parse("disabler().foo().bar");
        assert!(p.ok);
        let NodeKind::Method { has_parens, .. } = p.ast.get(p.ast.stmts[0]).kind else {
            panic!("expected method node");
        };
        assert!(!has_parens);
    }

    #[rstest]
    fn ternary_nests_under_or() {
        let p = parse("a ? b : c");
        assert!(p.ok);
        assert!(matches!(p.ast.get(p.ast.stmts[0]).kind, NodeKind::Ternary { .. }));
    }
}

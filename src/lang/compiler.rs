//! Bytecode compiler.
//!
//! Walks the AST and appends instructions to the single code vector shared
//! by the whole workspace. Constants and jump destinations are 3-byte
//! big-endian operands; a parallel location table maps instruction
//! pointers back to source spans for diagnostics.

use crate::diagnostics::{DiagnosticStore, Level};
use crate::lang::ast::{Arguments, Ast, BinOp, IfArm, NodeId, NodeKind, UnOp};
use crate::lang::natives::NativeRegistry;
use crate::lang::object::{FuncDef, FuncParam, Heap, Obj};
use crate::lang::types::TypeTag;
use crate::source::SourceLocation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    Constant = 1,
    ConstantList,
    ConstantDict,
    ConstantFunc,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Not,
    Eq,
    In,
    Gt,
    Lt,
    Negate,
    Stringify,
    Store,
    AddStore,
    Load,
    TryLoad,
    Return,
    ReturnEnd,
    Call,
    CallMethod,
    CallNative,
    Index,
    Iterator,
    IteratorNext,
    Jmp,
    JmpIfTrue,
    JmpIfFalse,
    JmpIfNull,
    JmpIfDisabler,
    JmpIfDisablerKeep,
    Pop,
    Dup,
    Swap,
    Typecheck,
    // Static-analysis only; executed as no-ops.
    AzBranch,
    AzMerge,
}

impl Op {
    const ALL: [Self; 38] = [
        Self::Constant,
        Self::ConstantList,
        Self::ConstantDict,
        Self::ConstantFunc,
        Self::Add,
        Self::Sub,
        Self::Mul,
        Self::Div,
        Self::Mod,
        Self::Not,
        Self::Eq,
        Self::In,
        Self::Gt,
        Self::Lt,
        Self::Negate,
        Self::Stringify,
        Self::Store,
        Self::AddStore,
        Self::Load,
        Self::TryLoad,
        Self::Return,
        Self::ReturnEnd,
        Self::Call,
        Self::CallMethod,
        Self::CallNative,
        Self::Index,
        Self::Iterator,
        Self::IteratorNext,
        Self::Jmp,
        Self::JmpIfTrue,
        Self::JmpIfFalse,
        Self::JmpIfNull,
        Self::JmpIfDisabler,
        Self::JmpIfDisablerKeep,
        Self::Pop,
        Self::Dup,
        Self::Swap,
        Self::Typecheck,
    ];

    #[must_use]
    pub fn decode(byte: u8) -> Option<Self> {
        match byte {
            0 => None,
            b if b == Self::AzBranch as u8 => Some(Self::AzBranch),
            b if b == Self::AzMerge as u8 => Some(Self::AzMerge),
            b => Self::ALL.get((b - 1) as usize).copied(),
        }
    }
}

/// `(ip, source span)` pair for diagnostics; kept sorted by construction.
#[derive(Debug, Clone, Copy)]
pub struct LocEntry {
    pub ip: u32,
    pub src_idx: u32,
    pub loc: SourceLocation,
}

/// Compiler output shared with the VM.
#[derive(Debug, Default)]
pub struct CodeBuf {
    pub code: Vec<u8>,
    pub locations: Vec<LocEntry>,
    /// Typecheck operands index into this table; tags are 64-bit and do
    /// not fit a 3-byte operand.
    pub type_constants: Vec<TypeTag>,
}

impl CodeBuf {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Recover the source span of an instruction by binary search.
    #[must_use]
    pub fn lookup_location(&self, ip: u32) -> Option<(u32, SourceLocation)> {
        if self.locations.is_empty() {
            return None;
        }
        let idx = match self.locations.binary_search_by_key(&ip, |e| e.ip) {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) => i - 1,
        };
        self.locations.get(idx).map(|e| (e.src_idx, e.loc))
    }
}

pub struct Compiler<'a> {
    buf: &'a mut CodeBuf,
    heap: &'a mut Heap,
    natives: &'a NativeRegistry,
    diags: &'a mut DiagnosticStore,
    ast: &'a Ast,
    src_idx: u32,
    /// Per-loop stacks of break-jump patch sites and loop heads.
    loop_stack: Vec<LoopCtx>,
    ok: bool,
}

struct LoopCtx {
    head: u32,
    break_patches: Vec<usize>,
}

impl<'a> Compiler<'a> {
    /// Compile a parsed file, appending to `buf`. Returns the entry point
    /// of the compiled chunk and whether compilation succeeded. The chunk
    /// always ends with `ReturnEnd`.
    pub fn compile(
        buf: &'a mut CodeBuf,
        heap: &'a mut Heap,
        natives: &'a NativeRegistry,
        diags: &'a mut DiagnosticStore,
        ast: &'a Ast,
        src_idx: u32,
    ) -> (u32, bool) {
        let entry = u32::try_from(buf.code.len()).unwrap_or(u32::MAX);
        let mut compiler =
            Compiler { buf, heap, natives, diags, ast, src_idx, loop_stack: Vec::new(), ok: true };
        for stmt in &ast.stmts {
            compiler.compile_stmt(*stmt);
        }
        compiler.push_constant_obj(Obj::NULL);
        compiler.push_op(Op::ReturnEnd);
        (entry, compiler.ok)
    }

    fn ip(&self) -> u32 {
        u32::try_from(self.buf.code.len()).unwrap_or(u32::MAX)
    }

    fn push_op(&mut self, op: Op) {
        self.buf.code.push(op as u8);
    }

    fn push_u24(&mut self, value: u32) {
        self.buf.code.push(((value >> 16) & 0xff) as u8);
        self.buf.code.push(((value >> 8) & 0xff) as u8);
        self.buf.code.push((value & 0xff) as u8);
    }

    fn push_constant_obj(&mut self, obj: Obj) {
        self.push_op(Op::Constant);
        self.push_u24(obj.0);
    }

    /// Emit a jump and return the operand position for later patching.
    fn push_jmp(&mut self, op: Op) -> usize {
        self.push_op(op);
        let pos = self.buf.code.len();
        self.push_u24(0);
        pos
    }

    fn patch_jmp(&mut self, pos: usize) {
        let target = self.ip();
        self.buf.code[pos] = ((target >> 16) & 0xff) as u8;
        self.buf.code[pos + 1] = ((target >> 8) & 0xff) as u8;
        self.buf.code[pos + 2] = (target & 0xff) as u8;
    }

    fn mark_location(&mut self, loc: SourceLocation) {
        self.buf.locations.push(LocEntry { ip: self.ip(), src_idx: self.src_idx, loc });
    }

    fn error_at(&mut self, loc: SourceLocation, msg: impl Into<String>) {
        self.ok = false;
        self.diags.push(self.src_idx, loc, Level::Error, msg);
    }

    fn compile_stmt(&mut self, id: NodeId) {
        let node = self.ast.get(id);
        let loc = node.loc;
        self.mark_location(loc);
        match &node.kind {
            NodeKind::Assign { name, value } => {
                self.compile_expr(*value);
                self.push_op(Op::Store);
                self.push_u24(name.0);
            }
            NodeKind::AddAssign { name, value } => {
                self.compile_expr(*value);
                self.push_op(Op::AddStore);
                self.push_u24(name.0);
            }
            NodeKind::If { arms } => self.compile_if(arms),
            NodeKind::Foreach { vars, iterable, body } => {
                self.compile_foreach(*vars, *iterable, body);
            }
            NodeKind::Continue => {
                if self.loop_stack.is_empty() {
                    self.error_at(loc, "continue outside of a loop");
                    return;
                }
                let head = self.loop_stack.last().map_or(0, |l| l.head);
                self.push_op(Op::Jmp);
                self.push_u24(head);
            }
            NodeKind::Break => {
                let patch = self.push_jmp(Op::Jmp);
                match self.loop_stack.last_mut() {
                    Some(ctx) => ctx.break_patches.push(patch),
                    None => self.error_at(loc, "break outside of a loop"),
                }
            }
            NodeKind::Return(value) => {
                match value {
                    Some(v) => self.compile_expr(*v),
                    None => self.push_constant_obj(Obj::NULL),
                }
                self.push_op(Op::Return);
            }
            NodeKind::FuncDef { name: Some(name), .. } => {
                let name = *name;
                self.compile_func_def(id);
                self.push_op(Op::Store);
                self.push_u24(name.0);
            }
            _ => {
                // Expression statement: evaluate and discard.
                self.compile_expr(id);
                self.push_op(Op::Pop);
            }
        }
    }

    fn compile_expr(&mut self, id: NodeId) {
        let node = self.ast.get(id);
        let loc = node.loc;
        self.mark_location(loc);
        match &node.kind {
            NodeKind::Literal(obj) => self.push_constant_obj(*obj),
            NodeKind::Id(name) => {
                self.push_op(Op::Load);
                self.push_u24(name.0);
            }
            NodeKind::Array(items) => {
                for item in items {
                    self.compile_expr(*item);
                }
                self.push_op(Op::ConstantList);
                self.push_u24(u32::try_from(items.len()).unwrap_or(0));
            }
            NodeKind::Dict(entries) => {
                for (k, v) in entries {
                    self.compile_expr(*k);
                    self.compile_expr(*v);
                }
                self.push_op(Op::ConstantDict);
                self.push_u24(u32::try_from(entries.len()).unwrap_or(0));
            }
            NodeKind::Binary { op, lhs, rhs } => self.compile_binary(*op, *lhs, *rhs),
            NodeKind::Unary { op, expr } => {
                self.compile_expr(*expr);
                match op {
                    UnOp::Not => self.push_op(Op::Not),
                    UnOp::Negate => self.push_op(Op::Negate),
                }
            }
            NodeKind::Ternary { cond, then, otherwise } => {
                self.compile_expr(*cond);
                let end_disabler = self.push_jmp(Op::JmpIfDisablerKeep);
                let to_else = self.push_jmp(Op::JmpIfFalse);
                self.compile_expr(*then);
                let to_end = self.push_jmp(Op::Jmp);
                self.patch_jmp(to_else);
                self.compile_expr(*otherwise);
                self.patch_jmp(to_end);
                self.patch_jmp(end_disabler);
            }
            NodeKind::Index { lhs, index } => {
                self.compile_expr(*lhs);
                self.compile_expr(*index);
                self.push_op(Op::Index);
            }
            NodeKind::Call { callee, args } => self.compile_call(*callee, args),
            NodeKind::Method { receiver, name, args, has_parens } => {
                self.compile_expr(*receiver);
                self.compile_args(args);
                self.push_op(Op::CallMethod);
                self.push_u24(name.0);
                self.push_u24(u32::try_from(args.positional.len()).unwrap_or(0));
                self.push_u24(u32::try_from(args.kwargs.len()).unwrap_or(0));
                self.buf.code.push(u8::from(*has_parens));
            }
            NodeKind::Stringify(expr) => {
                self.compile_expr(*expr);
                self.push_op(Op::Stringify);
            }
            NodeKind::FuncDef { name: None, .. } => self.compile_func_def(id),
            NodeKind::FuncDef { name: Some(_), .. } => {
                // A named definition in expression position still yields
                // the capture; the statement path adds the store.
                self.compile_func_def(id);
            }
            _ => {
                self.error_at(loc, "statement not allowed in expression position");
                self.push_constant_obj(Obj::NULL);
            }
        }
    }

    /// `and`/`or` lower to jump chains so the right operand only runs when
    /// needed and a disabler operand short-circuits the whole expression.
    fn compile_binary(&mut self, op: BinOp, lhs: NodeId, rhs: NodeId) {
        match op {
            BinOp::And | BinOp::Or => {
                let exit_op = if op == BinOp::And { Op::JmpIfFalse } else { Op::JmpIfTrue };
                let short_result = if op == BinOp::And { Obj::FALSE } else { Obj::TRUE };
                let long_result = if op == BinOp::And { Obj::TRUE } else { Obj::FALSE };

                self.compile_expr(lhs);
                let dis1 = self.push_jmp(Op::JmpIfDisablerKeep);
                let short1 = self.push_jmp(exit_op);
                self.compile_expr(rhs);
                let dis2 = self.push_jmp(Op::JmpIfDisablerKeep);
                let short2 = self.push_jmp(exit_op);
                self.push_constant_obj(long_result);
                let done = self.push_jmp(Op::Jmp);
                self.patch_jmp(short1);
                self.patch_jmp(short2);
                self.push_constant_obj(short_result);
                self.patch_jmp(done);
                self.patch_jmp(dis1);
                self.patch_jmp(dis2);
            }
            _ => {
                self.compile_expr(lhs);
                self.compile_expr(rhs);
                match op {
                    BinOp::Add => self.push_op(Op::Add),
                    BinOp::Sub => self.push_op(Op::Sub),
                    BinOp::Mul => self.push_op(Op::Mul),
                    BinOp::Div => self.push_op(Op::Div),
                    BinOp::Mod => self.push_op(Op::Mod),
                    BinOp::Eq => self.push_op(Op::Eq),
                    BinOp::NEq => {
                        self.push_op(Op::Eq);
                        self.push_op(Op::Not);
                    }
                    BinOp::In => self.push_op(Op::In),
                    BinOp::NotIn => {
                        self.push_op(Op::In);
                        self.push_op(Op::Not);
                    }
                    BinOp::Gt => self.push_op(Op::Gt),
                    BinOp::Lt => self.push_op(Op::Lt),
                    BinOp::Leq => {
                        self.push_op(Op::Gt);
                        self.push_op(Op::Not);
                    }
                    BinOp::Geq => {
                        self.push_op(Op::Lt);
                        self.push_op(Op::Not);
                    }
                    BinOp::And | BinOp::Or => unreachable!("handled above"),
                }
            }
        }
    }

    fn compile_if(&mut self, arms: &[IfArm]) {
        // End-jumps collect on a local patch stack and resolve after the
        // chain; a disabler condition skips the whole chain.
        let mut end_patches = Vec::new();
        let mut disabler_patches = Vec::new();
        for arm in arms {
            match arm.cond {
                Some(cond) => {
                    self.compile_expr(cond);
                    disabler_patches.push(self.push_jmp(Op::JmpIfDisabler));
                    let next_arm = self.push_jmp(Op::JmpIfFalse);
                    for stmt in &arm.body {
                        self.compile_stmt(*stmt);
                    }
                    end_patches.push(self.push_jmp(Op::Jmp));
                    self.patch_jmp(next_arm);
                }
                None => {
                    for stmt in &arm.body {
                        self.compile_stmt(*stmt);
                    }
                }
            }
        }
        for patch in end_patches {
            self.patch_jmp(patch);
        }
        for patch in disabler_patches {
            self.patch_jmp(patch);
        }
    }

    fn compile_foreach(&mut self, vars: (Obj, Option<Obj>), iterable: NodeId, body: &[NodeId]) {
        self.compile_expr(iterable);
        self.push_op(Op::Iterator);
        let head = self.ip();
        self.push_op(Op::IteratorNext);
        let exit = self.push_jmp(Op::JmpIfNull);
        match vars.1 {
            Some(value_var) => {
                // Dict iteration pushes value then key; key is on top.
                self.push_op(Op::Store);
                self.push_u24(vars.0.0);
                self.push_op(Op::Store);
                self.push_u24(value_var.0);
            }
            None => {
                self.push_op(Op::Store);
                self.push_u24(vars.0.0);
            }
        }
        self.loop_stack.push(LoopCtx { head, break_patches: Vec::new() });
        for stmt in body {
            self.compile_stmt(*stmt);
        }
        self.push_op(Op::Jmp);
        self.push_u24(head);
        let ctx = self.loop_stack.pop().unwrap_or(LoopCtx { head, break_patches: Vec::new() });
        for patch in ctx.break_patches {
            self.patch_jmp(patch);
        }
        self.patch_jmp(exit);
        // Drop the iterator left under the loop.
        self.push_op(Op::Pop);
    }

    fn compile_func_def(&mut self, id: NodeId) {
        let node = self.ast.get(id);
        let loc = node.loc;
        let NodeKind::FuncDef { name, params, return_type, body } = &node.kind else {
            return;
        };
        let (name, params, return_type, body) =
            (*name, params.clone(), *return_type, body.clone());

        let skip = self.push_jmp(Op::Jmp);
        let entry_ip = self.ip();
        for stmt in &body {
            self.compile_stmt(*stmt);
        }
        // Guarantee a trailing implicit `return null`.
        if self.buf.code.last() != Some(&(Op::Return as u8)) {
            self.push_constant_obj(Obj::NULL);
            self.push_op(Op::Return);
        }
        self.patch_jmp(skip);

        let mut func_params = Vec::new();
        for p in &params {
            let default = match p.default {
                Some(d) => match &self.ast.get(d).kind {
                    NodeKind::Literal(obj) => Some(*obj),
                    _ => {
                        self.error_at(loc, "parameter default must be a constant");
                        None
                    }
                },
                None => None,
            };
            func_params.push(FuncParam { name: p.name, ty: p.ty, default });
        }
        let fname = name.unwrap_or_else(|| self.heap.str_intern(b"<lambda>"));
        let func = self.heap.make_func(FuncDef {
            name: fname,
            entry_ip,
            params: func_params,
            return_type,
            src_idx: self.src_idx,
        });
        self.push_op(Op::ConstantFunc);
        self.push_u24(func.0);
    }

    fn compile_args(&mut self, args: &Arguments) {
        for arg in &args.positional {
            self.compile_expr(*arg);
        }
        for (name, value) in &args.kwargs {
            self.push_constant_obj(*name);
            self.compile_expr(*value);
        }
    }

    fn compile_call(&mut self, callee: NodeId, args: &Arguments) {
        let callee_node = self.ast.get(callee);
        if let NodeKind::Id(name) = callee_node.kind {
            let name_bytes = self.heap.str_bytes(name).to_vec();
            if let Some(idx) = self.natives.kernel_index(&name_bytes) {
                self.compile_args(args);
                self.push_op(Op::CallNative);
                self.push_u24(u32::try_from(args.positional.len()).unwrap_or(0));
                self.push_u24(u32::try_from(args.kwargs.len()).unwrap_or(0));
                self.push_u24(idx);
                return;
            }
        }
        self.compile_expr(callee);
        self.compile_args(args);
        self.push_op(Op::Call);
        self.push_u24(u32::try_from(args.positional.len()).unwrap_or(0));
        self.push_u24(u32::try_from(args.kwargs.len()).unwrap_or(0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::lexer::LexerMode;
    use crate::lang::parser::Parser;
    use crate::lang::types::TypeRegistry;
    use crate::source::Source;
    use rstest::rstest;

    fn compile(text: &str) -> (CodeBuf, bool) {
        let source = Source::anonymous(text.as_bytes().to_vec());
        let mut heap = Heap::new();
        let mut types = TypeRegistry::new();
        let mut diags = DiagnosticStore::new();
        let natives = NativeRegistry::empty();
        let (ast, ok) = Parser::parse(
            &source,
            &mut heap,
            &mut types,
            &mut diags,
            0,
            LexerMode { extensions: true, formatter: false },
        );
        assert!(ok, "parse failed");
        let mut buf = CodeBuf::new();
        let (_, ok) = Compiler::compile(&mut buf, &mut heap, &natives, &mut diags, &ast, 0);
        (buf, ok)
    }

    fn ops_of(buf: &CodeBuf) -> Vec<Op> {
        let mut ops = Vec::new();
        let mut ip = 0;
        while ip < buf.code.len() {
            let op = Op::decode(buf.code[ip]).expect("valid opcode");
            ops.push(op);
            ip += 1 + operand_len(op, &buf.code[ip + 1..]);
        }
        ops
    }

    fn operand_len(op: Op, _rest: &[u8]) -> usize {
        match op {
            Op::Constant
            | Op::ConstantList
            | Op::ConstantDict
            | Op::ConstantFunc
            | Op::Store
            | Op::AddStore
            | Op::Load
            | Op::TryLoad
            | Op::Jmp
            | Op::JmpIfTrue
            | Op::JmpIfFalse
            | Op::JmpIfNull
            | Op::JmpIfDisabler
            | Op::JmpIfDisablerKeep
            | Op::Typecheck
            | Op::AzBranch => 3,
            Op::Call => 6,
            Op::CallMethod => 10,
            Op::CallNative => 9,
            _ => 0,
        }
    }

    #[rstest]
    fn chunk_ends_with_return_end() {
        let (buf, ok) = compile("x = 1");
        assert!(ok);
        assert_eq!(ops_of(&buf).last(), Some(&Op::ReturnEnd));
    }

    #[rstest]
    fn assignment_emits_store() {
        let (buf, _) = compile("x = 1");
        let ops = ops_of(&buf);
        assert!(ops.contains(&Op::Store));
    }

    #[rstest]
    fn neq_lowers_to_eq_not() {
        let (buf, _) = compile("a != b");
        let ops = ops_of(&buf);
        let eq_pos = ops.iter().position(|o| *o == Op::Eq).expect("eq");
        assert_eq!(ops[eq_pos + 1], Op::Not);
    }

    #[rstest]
    fn foreach_emits_iterator_loop() {
        let (buf, _) = compile("foreach x : [1]\nx\nendforeach\n");
        let ops = ops_of(&buf);
        assert!(ops.contains(&Op::Iterator));
        assert!(ops.contains(&Op::IteratorNext));
        assert!(ops.contains(&Op::JmpIfNull));
    }

    #[rstest]
    fn func_def_jumps_over_body_and_stores() {
        let (buf, ok) = compile("func f() -> int\nreturn 1\nendfunc\n");
        assert!(ok);
        let ops = ops_of(&buf);
        assert_eq!(ops[0], Op::Jmp);
        assert!(ops.contains(&Op::ConstantFunc));
        assert!(ops.contains(&Op::Store));
    }

    #[rstest]
    fn ternary_uses_disabler_keep_jump() {
        let (buf, _) = compile("a ? b : c");
        let ops = ops_of(&buf);
        assert!(ops.contains(&Op::JmpIfDisablerKeep));
    }

    #[rstest]
    fn location_lookup_finds_enclosing_entry() {
        let (buf, _) = compile("x = 1\ny = 2\n");
        let (src, loc) = buf.lookup_location(0).expect("location");
        assert_eq!(src, 0);
        assert_eq!(loc.off, 0);
    }
}

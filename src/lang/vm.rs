//! The bytecode virtual machine.
//!
//! A stack machine over the workspace code vector. The operand stack holds
//! `(handle, ip)` pairs so argument type errors can point at the expression
//! that produced the value. Scopes are a stack of dicts, outer to inner:
//! `store` writes the innermost, `load` searches outward.
//!
//! Instruction failures record a diagnostic (located via binary search on
//! the location table), set the error flag, and unwind to the outermost
//! frame.

use crate::diagnostics::Level;
use crate::lang::compiler::{CodeBuf, Op};
use crate::lang::natives::{ArgVal, CallArgs, NativeResult};
use crate::lang::object::{CaptureRecord, DictKey, FuncDef, IterState, Obj, ObjType, ObjValue};
use crate::lang::types::{TypeTag, tag};
use crate::workspace::Workspace;

#[derive(Debug, Clone, Copy)]
pub struct StackEntry {
    pub obj: Obj,
    pub ip: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Eval,
    Func,
}

#[derive(Debug, Clone, Copy)]
pub struct CallFrame {
    pub return_ip: u32,
    pub typ: FrameType,
    pub saved_scope: Obj,
    pub expected_return_type: TypeTag,
}

/// VM state owned by the workspace.
#[derive(Debug, Default)]
pub struct Vm {
    pub buf: CodeBuf,
    pub stack: Vec<StackEntry>,
    pub call_stack: Vec<CallFrame>,
    pub ip: u32,
    /// Array of scope dicts, outermost first.
    pub scope_stack: Obj,
    pub error: bool,
    pub saw_disabler: bool,
}

enum LoopExit {
    /// `ReturnEnd` reached; top-level result.
    End(Obj),
    /// The call stack shrank back to the caller's depth.
    FrameDrained,
}

impl Workspace {
    // ------------------------------------------------------------------
    // diagnostics plumbing

    pub fn vm_error_at(&mut self, ip: u32, msg: &str) {
        let (src_idx, loc) = self.vm.buf.lookup_location(ip).unwrap_or_default();
        self.diags.push(src_idx, loc, Level::Error, msg);
        self.vm.error = true;
    }

    pub fn vm_error(&mut self, msg: &str) {
        let ip = self.vm.ip;
        self.vm_error_at(ip, msg);
    }

    pub fn vm_warning_at(&mut self, ip: u32, msg: &str) {
        let (src_idx, loc) = self.vm.buf.lookup_location(ip).unwrap_or_default();
        self.diags.push(src_idx, loc, Level::Warning, msg);
    }

    // ------------------------------------------------------------------
    // scope helpers

    /// Write into the innermost scope dict.
    pub fn scope_store(&mut self, name: Obj, value: Obj) {
        let stack = self.vm.scope_stack;
        let len = self.heap.arr_len(stack);
        if let Some(dict) = self.heap.arr_get(stack, len.saturating_sub(1)) {
            self.heap.dict_set_str(dict, name, value);
        }
    }

    /// Search scopes inner to outer.
    #[must_use]
    pub fn scope_lookup(&self, name: Obj) -> Option<Obj> {
        let dicts = self.heap.arr_to_vec(self.vm.scope_stack);
        dicts.iter().rev().find_map(|d| self.heap.dict_get_str(*d, name))
    }

    #[must_use]
    pub fn scope_lookup_bytes(&self, name: &[u8]) -> Option<Obj> {
        let dicts = self.heap.arr_to_vec(self.vm.scope_stack);
        dicts.iter().rev().find_map(|d| self.heap.dict_get_bytes(*d, name))
    }

    /// Rebind wherever the name currently lives; used by `+=`.
    fn scope_rebind(&mut self, name: Obj, value: Obj) -> bool {
        let dicts = self.heap.arr_to_vec(self.vm.scope_stack);
        for dict in dicts.iter().rev() {
            if self.heap.dict_get_str(*dict, name).is_some() {
                self.heap.dict_set_str(*dict, name, value);
                return true;
            }
        }
        false
    }

    /// Deep-duplicate a scope stack: the dict list and each dict are
    /// copied, values are shared handles. Captures take this at creation.
    pub fn scope_stack_dup_deep(&mut self, stack: Obj) -> Obj {
        let dicts = self.heap.arr_to_vec(stack);
        let new_stack = self.heap.arr_new();
        for dict in dicts {
            let dup = self.heap.dict_dup(dict);
            self.heap.arr_push(new_stack, dup);
        }
        new_stack
    }

    /// Coerce a single value into a one-element array; arrays pass through
    /// with nested arrays flattened one level.
    pub fn listify(&mut self, obj: Obj) -> Obj {
        let out = self.heap.arr_new();
        if self.heap.typ(obj) == ObjType::Array {
            for item in self.heap.arr_to_vec(obj) {
                if self.heap.typ(item) == ObjType::Array {
                    self.heap.arr_extend(out, item);
                } else {
                    self.heap.arr_push(out, item);
                }
            }
        } else if obj != Obj::NULL {
            self.heap.arr_push(out, obj);
        }
        out
    }

    // ------------------------------------------------------------------
    // execution

    fn fetch_u24(&mut self) -> u32 {
        let ip = self.vm.ip as usize;
        let code = &self.vm.buf.code;
        let value = (u32::from(code[ip]) << 16) | (u32::from(code[ip + 1]) << 8) | u32::from(code[ip + 2]);
        self.vm.ip += 3;
        value
    }

    fn fetch_u8(&mut self) -> u8 {
        let ip = self.vm.ip as usize;
        let value = self.vm.buf.code[ip];
        self.vm.ip += 1;
        value
    }

    fn push(&mut self, obj: Obj) {
        let ip = self.vm.ip;
        self.vm.stack.push(StackEntry { obj, ip });
    }

    fn pop(&mut self) -> Result<StackEntry, ()> {
        match self.vm.stack.pop() {
            Some(entry) => Ok(entry),
            None => {
                self.vm_error("stack underflow");
                Err(())
            }
        }
    }

    fn peek(&self) -> Option<Obj> {
        self.vm.stack.last().map(|e| e.obj)
    }

    /// Execute a compiled chunk from `entry` until its `ReturnEnd`.
    pub fn vm_execute(&mut self, entry: u32) -> Result<Obj, ()> {
        let saved_ip = self.vm.ip;
        self.vm.ip = entry;
        let depth = self.vm.call_stack.len();
        let result = match self.run_loop(depth) {
            Ok(LoopExit::End(value)) => Ok(value),
            Ok(LoopExit::FrameDrained) => {
                self.vm_error("unbalanced call frame");
                Err(())
            }
            Err(()) => Err(()),
        };
        self.vm.ip = saved_ip;
        result
    }

    fn run_loop(&mut self, base_depth: usize) -> Result<LoopExit, ()> {
        loop {
            let opcode = self.fetch_u8();
            let Some(op) = Op::decode(opcode) else {
                self.vm_error(&format!("corrupt bytecode: {opcode:#x}"));
                return Err(());
            };
            match op {
                Op::Constant => {
                    let handle = self.fetch_u24();
                    self.push(Obj(handle));
                }
                Op::ConstantList => {
                    let n = self.fetch_u24() as usize;
                    let mut items = Vec::with_capacity(n);
                    for _ in 0..n {
                        items.push(self.pop()?.obj);
                    }
                    items.reverse();
                    let arr = self.heap.arr_from_vec(&items);
                    self.push(arr);
                }
                Op::ConstantDict => {
                    let n = self.fetch_u24() as usize;
                    let mut pairs = Vec::with_capacity(n);
                    for _ in 0..n {
                        let value = self.pop()?;
                        let key = self.pop()?;
                        pairs.push((key, value));
                    }
                    pairs.reverse();
                    let dict = self.heap.dict_new();
                    for (key, value) in pairs {
                        match self.heap.get(key.obj) {
                            ObjValue::Str(_) => self.heap.dict_set_str(dict, key.obj, value.obj),
                            ObjValue::Number(n) => {
                                self.heap.dict_set(dict, DictKey::Int(n), value.obj);
                            }
                            _ => {
                                self.vm_error_at(key.ip, "dict keys must be strings or integers");
                                return Err(());
                            }
                        }
                    }
                    self.push(dict);
                }
                Op::ConstantFunc => {
                    let func = Obj(self.fetch_u24());
                    let func_idx = self.heap.record_idx(func) as u32;
                    let scope = self.vm.scope_stack;
                    let captured = self.scope_stack_dup_deep(scope);
                    let capture = self
                        .heap
                        .make_capture(CaptureRecord { func: func_idx, scope_stack: captured });
                    self.push(capture);
                }
                Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod | Op::Eq | Op::In | Op::Gt | Op::Lt => {
                    let rhs = self.pop()?;
                    let lhs = self.pop()?;
                    let result = self.binary_op(op, lhs, rhs)?;
                    self.push(result);
                }
                Op::Not => {
                    let value = self.pop()?;
                    if value.obj == Obj::DISABLER {
                        self.push(Obj::DISABLER);
                    } else if let Some(b) = self.heap.bool_value(value.obj) {
                        let result = self.heap.make_bool(!b);
                        self.push(result);
                    } else {
                        let got = self.heap.typ(value.obj).name();
                        self.vm_error_at(value.ip, &format!("cannot negate {got}"));
                        return Err(());
                    }
                }
                Op::Negate => {
                    let value = self.pop()?;
                    if value.obj == Obj::DISABLER {
                        self.push(Obj::DISABLER);
                    } else if let Some(n) = self.heap.number(value.obj) {
                        let result = self.heap.make_number(-n);
                        self.push(result);
                    } else {
                        let got = self.heap.typ(value.obj).name();
                        self.vm_error_at(value.ip, &format!("cannot negate {got}"));
                        return Err(());
                    }
                }
                Op::Stringify => {
                    let value = self.pop()?;
                    let result = self.stringify(value)?;
                    self.push(result);
                }
                Op::Store => {
                    let name = Obj(self.fetch_u24());
                    let value = self.pop()?.obj;
                    self.scope_store(name, value);
                }
                Op::AddStore => {
                    let name = Obj(self.fetch_u24());
                    let rhs = self.pop()?;
                    let Some(current) = self.scope_lookup(name) else {
                        let n = self.heap.str_display(name);
                        self.vm_error_at(rhs.ip, &format!("{n} is not defined"));
                        return Err(());
                    };
                    let lhs = StackEntry { obj: current, ip: rhs.ip };
                    let sum = self.binary_op(Op::Add, lhs, rhs)?;
                    self.scope_rebind(name, sum);
                }
                Op::Load => {
                    let name = Obj(self.fetch_u24());
                    match self.scope_lookup(name) {
                        Some(value) => self.push(value),
                        None => {
                            let n = self.heap.str_display(name);
                            self.vm_error(&format!("{n} is not defined"));
                            return Err(());
                        }
                    }
                }
                Op::TryLoad => {
                    let name = Obj(self.fetch_u24());
                    let value = self.scope_lookup(name).unwrap_or(Obj::DISABLER);
                    self.push(value);
                }
                Op::Return => {
                    let value = self.pop()?;
                    let Some(frame) = self.vm.call_stack.pop() else {
                        self.vm_error_at(value.ip, "return outside of a function");
                        return Err(());
                    };
                    if frame.typ == FrameType::Func
                        && !self.types.typecheck(&self.heap, value.obj, frame.expected_return_type)
                    {
                        let expected = self.types.display(frame.expected_return_type);
                        let got = self.heap.typ(value.obj).name();
                        self.vm_error_at(
                            value.ip,
                            &format!("return value: expected {expected}, got {got}"),
                        );
                        return Err(());
                    }
                    self.vm.scope_stack = frame.saved_scope;
                    self.vm.ip = frame.return_ip;
                    self.push(value.obj);
                    if self.vm.call_stack.len() == base_depth {
                        return Ok(LoopExit::FrameDrained);
                    }
                }
                Op::ReturnEnd => {
                    let value = self.pop()?.obj;
                    return Ok(LoopExit::End(value));
                }
                Op::Call => {
                    let nargs = self.fetch_u24() as usize;
                    let nkwargs = self.fetch_u24() as usize;
                    let args = self.collect_args(nargs, nkwargs)?;
                    let callee = self.pop()?;
                    let result = self.call_value(callee, args)?;
                    self.push(result);
                }
                Op::CallMethod => {
                    let name = Obj(self.fetch_u24());
                    let nargs = self.fetch_u24() as usize;
                    let nkwargs = self.fetch_u24() as usize;
                    let has_parens = self.fetch_u8() != 0;
                    let mut args = self.collect_args(nargs, nkwargs)?;
                    let receiver = self.pop()?;
                    if receiver.obj == Obj::DISABLER {
                        self.vm.saw_disabler = true;
                        self.push(Obj::DISABLER);
                        continue;
                    }
                    if !has_parens {
                        let n = self.heap.str_display(name);
                        self.vm_error_at(receiver.ip, &format!("{n} is a method; call it with ()"));
                        return Err(());
                    }
                    let result = self.call_method(receiver, name, &mut args)?;
                    self.push(result);
                }
                Op::CallNative => {
                    let nargs = self.fetch_u24() as usize;
                    let nkwargs = self.fetch_u24() as usize;
                    let idx = self.fetch_u24();
                    let mut args = self.collect_args(nargs, nkwargs)?;
                    let Some(desc) = self.natives.get(idx) else {
                        self.vm_error("unknown native function");
                        return Err(());
                    };
                    let func = desc.func;
                    let handles_disabler = desc.handles_disabler;
                    if args.has_disabler() && !handles_disabler {
                        self.vm.saw_disabler = true;
                        self.push(Obj::DISABLER);
                        continue;
                    }
                    let result = func(self, Obj::NULL, &mut args)?;
                    self.push(result);
                }
                Op::Index => {
                    let index = self.pop()?;
                    let container = self.pop()?;
                    let result = self.index_op(container, index)?;
                    self.push(result);
                }
                Op::Iterator => {
                    let value = self.pop()?;
                    let iter = match self.heap.typ(value.obj) {
                        ObjType::Disabler => Obj::DISABLER,
                        // `range()` yields a ready-made iterator.
                        ObjType::Iterator => value.obj,
                        ObjType::Array => {
                            let cell = self.heap.first_cell(value.obj);
                            self.heap.make_iterator(IterState::Array { arr: value.obj, cell })
                        }
                        ObjType::Dict => {
                            self.heap.make_iterator(IterState::Dict { dict: value.obj, idx: 0 })
                        }
                        other => {
                            self.vm_error_at(value.ip, &format!("cannot iterate over {}", other.name()));
                            return Err(());
                        }
                    };
                    self.push(iter);
                }
                Op::IteratorNext => {
                    let Some(iter) = self.peek() else {
                        self.vm_error("stack underflow");
                        return Err(());
                    };
                    self.iterator_next(iter)?;
                }
                Op::Jmp => {
                    let target = self.fetch_u24();
                    self.vm.ip = target;
                }
                Op::JmpIfTrue | Op::JmpIfFalse => {
                    let target = self.fetch_u24();
                    let value = self.pop()?;
                    let Some(b) = self.heap.bool_value(value.obj) else {
                        let got = self.heap.typ(value.obj).name();
                        self.vm_error_at(value.ip, &format!("condition must be a bool, got {got}"));
                        return Err(());
                    };
                    if b == (op == Op::JmpIfTrue) {
                        self.vm.ip = target;
                    }
                }
                Op::JmpIfNull => {
                    let target = self.fetch_u24();
                    if self.peek() == Some(Obj::NULL) {
                        self.pop()?;
                        self.vm.ip = target;
                    }
                }
                Op::JmpIfDisabler => {
                    let target = self.fetch_u24();
                    if self.peek() == Some(Obj::DISABLER) {
                        self.pop()?;
                        self.vm.saw_disabler = true;
                        self.vm.ip = target;
                    }
                }
                Op::JmpIfDisablerKeep => {
                    let target = self.fetch_u24();
                    if self.peek() == Some(Obj::DISABLER) {
                        self.vm.saw_disabler = true;
                        self.vm.ip = target;
                    }
                }
                Op::Pop => {
                    self.pop()?;
                }
                Op::Dup => {
                    let Some(top) = self.peek() else {
                        self.vm_error("stack underflow");
                        return Err(());
                    };
                    self.push(top);
                }
                Op::Swap => {
                    let a = self.pop()?;
                    let b = self.pop()?;
                    self.vm.stack.push(a);
                    self.vm.stack.push(b);
                }
                Op::Typecheck => {
                    let idx = self.fetch_u24() as usize;
                    let ty = self.vm.buf.type_constants.get(idx).copied().unwrap_or(tag::ANY);
                    let Some(top) = self.peek() else {
                        self.vm_error("stack underflow");
                        return Err(());
                    };
                    if !self.types.typecheck(&self.heap, top, ty) {
                        let expected = self.types.display(ty);
                        let got = self.heap.typ(top).name();
                        self.vm_error(&format!("expected {expected}, got {got}"));
                        return Err(());
                    }
                }
                Op::AzBranch => {
                    let _ = self.fetch_u24();
                }
                Op::AzMerge => {}
            }
        }
    }

    fn collect_args(&mut self, nargs: usize, nkwargs: usize) -> Result<CallArgs, ()> {
        let mut kwargs = Vec::with_capacity(nkwargs);
        for _ in 0..nkwargs {
            let value = self.pop()?;
            let key = self.pop()?;
            let name = self.heap.str_bytes(key.obj).to_vec();
            kwargs.push((name, ArgVal { obj: value.obj, ip: value.ip }));
        }
        kwargs.reverse();
        let mut positional = Vec::with_capacity(nargs);
        for _ in 0..nargs {
            let value = self.pop()?;
            positional.push(ArgVal { obj: value.obj, ip: value.ip });
        }
        positional.reverse();
        Ok(CallArgs::new(positional, kwargs, self.vm.ip))
    }

    fn call_value(&mut self, callee: StackEntry, args: CallArgs) -> NativeResult {
        match self.heap.typ(callee.obj) {
            ObjType::Disabler => {
                self.vm.saw_disabler = true;
                Ok(Obj::DISABLER)
            }
            ObjType::Capture => {
                if args.has_disabler() {
                    self.vm.saw_disabler = true;
                    return Ok(Obj::DISABLER);
                }
                self.call_capture(callee.obj, args)
            }
            other => {
                self.vm_error_at(callee.ip, &format!("{} is not callable", other.name()));
                Err(())
            }
        }
    }

    fn call_method(&mut self, receiver: StackEntry, name: Obj, args: &mut CallArgs) -> NativeResult {
        let typ = self.heap.typ(receiver.obj);
        let name_bytes = self.heap.str_bytes(name).to_vec();
        let Some(idx) = self.natives.method_index(typ, &name_bytes) else {
            let n = String::from_utf8_lossy(&name_bytes).into_owned();
            self.vm_error_at(receiver.ip, &format!("{} has no method {n}", typ.name()));
            return Err(());
        };
        let Some(desc) = self.natives.get(idx) else {
            self.vm_error("unknown native method");
            return Err(());
        };
        let func = desc.func;
        if args.has_disabler() && !desc.handles_disabler {
            self.vm.saw_disabler = true;
            return Ok(Obj::DISABLER);
        }
        func(self, receiver.obj, args)
    }

    /// Invoke a capture from native code or a `call` instruction.
    pub fn call_capture(&mut self, capture: Obj, mut args: CallArgs) -> NativeResult {
        let cap_idx = self.heap.record_idx(capture);
        let Some(cap) = self.heap.captures.get(cap_idx).cloned() else {
            self.vm_error("invalid capture");
            return Err(());
        };
        let Some(def) = self.heap.funcs.get(cap.func as usize).cloned() else {
            self.vm_error("invalid function");
            return Err(());
        };
        let bindings = self.bind_params(&def, &mut args)?;

        let stack = self.heap.arr_dup_light(cap.scope_stack);
        let local = self.heap.dict_new();
        self.heap.arr_push(stack, local);
        for (name, value) in bindings {
            self.heap.dict_set_str(local, name, value);
        }

        let depth = self.vm.call_stack.len();
        self.vm.call_stack.push(CallFrame {
            return_ip: self.vm.ip,
            typ: FrameType::Func,
            saved_scope: self.vm.scope_stack,
            expected_return_type: def.return_type,
        });
        self.vm.scope_stack = stack;
        self.vm.ip = def.entry_ip;
        match self.run_loop(depth) {
            Ok(LoopExit::FrameDrained) => Ok(self.pop()?.obj),
            Ok(LoopExit::End(_)) => {
                self.vm_error("function fell through to top level");
                Err(())
            }
            Err(()) => Err(()),
        }
    }

    /// Uniform argument binding for language functions: required
    /// positionals in declaration order, defaulted parameters by keyword,
    /// a `glob` parameter swallowing the tail.
    fn bind_params(
        &mut self,
        def: &FuncDef,
        args: &mut CallArgs,
    ) -> Result<Vec<(Obj, Obj)>, ()> {
        let mut out = Vec::new();
        for param in &def.params {
            if param.ty.is_glob() {
                let rest = args.rest(self, "argument", tag::ANY)?;
                let arr = self.heap.arr_from_vec(&rest);
                out.push((param.name, arr));
            } else if let Some(default) = param.default {
                let pname = self.heap.str_display(param.name);
                let value = args.kw(self, &pname, param.ty)?.unwrap_or(default);
                out.push((param.name, value));
            } else {
                let pname = self.heap.str_display(param.name);
                let value = args.next_pos(self, &pname, param.ty)?;
                out.push((param.name, value));
            }
        }
        Ok(out)
    }

    fn iterator_next(&mut self, iter: Obj) -> Result<(), ()> {
        if iter == Obj::DISABLER {
            self.push(Obj::NULL);
            return Ok(());
        }
        let Some(state) = self.heap.iterator(iter).cloned() else {
            self.vm_error("value is not an iterator");
            return Err(());
        };
        match state {
            IterState::Array { arr, cell } => match self.heap.cell_value(cell) {
                Some((value, next)) => {
                    if let Some(s) = self.heap.iterator_mut(iter) {
                        *s = IterState::Array { arr, cell: next };
                    }
                    self.push(value);
                }
                None => self.push(Obj::NULL),
            },
            IterState::Dict { dict, idx } => match self.heap.dict_entry(dict, idx as usize) {
                Some((key, value)) => {
                    if let Some(s) = self.heap.iterator_mut(iter) {
                        *s = IterState::Dict { dict, idx: idx + 1 };
                    }
                    // Value first, key on top; the compiler stores key
                    // then value.
                    self.push(value);
                    let key_obj = match key {
                        DictKey::Str(s) => s,
                        DictKey::Int(n) => self.heap.make_number(n),
                    };
                    self.push(key_obj);
                }
                None => self.push(Obj::NULL),
            },
            IterState::Range { cur, end, step } => {
                if (step > 0 && cur < end) || (step < 0 && cur > end) {
                    if let Some(s) = self.heap.iterator_mut(iter) {
                        *s = IterState::Range { cur: cur + step, end, step };
                    }
                    let value = self.heap.make_number(cur);
                    self.push(value);
                } else {
                    self.push(Obj::NULL);
                }
            }
        }
        Ok(())
    }

    fn stringify(&mut self, value: StackEntry) -> Result<Obj, ()> {
        match self.heap.typ(value.obj) {
            ObjType::Disabler => Ok(Obj::DISABLER),
            ObjType::Str => Ok(value.obj),
            ObjType::Number | ObjType::Bool | ObjType::File | ObjType::FeatureOpt => {
                let text = self.heap.obj_display(value.obj);
                Ok(self.heap.str_intern(text.as_bytes()))
            }
            other => {
                self.vm_error_at(value.ip, &format!("cannot convert {} to string", other.name()));
                Err(())
            }
        }
    }

    fn binary_op(&mut self, op: Op, lhs: StackEntry, rhs: StackEntry) -> Result<Obj, ()> {
        if lhs.obj == Obj::DISABLER || rhs.obj == Obj::DISABLER {
            self.vm.saw_disabler = true;
            return Ok(Obj::DISABLER);
        }
        let lt = self.heap.typ(lhs.obj);
        let rt = self.heap.typ(rhs.obj);
        match op {
            Op::Eq => {
                let eq = self.heap.obj_equal(lhs.obj, rhs.obj);
                Ok(self.heap.make_bool(eq))
            }
            Op::In => match rt {
                ObjType::Array => {
                    let found = self.heap.arr_contains(rhs.obj, lhs.obj);
                    Ok(self.heap.make_bool(found))
                }
                ObjType::Dict => {
                    let found = self.heap.dict_get_str(rhs.obj, lhs.obj).is_some();
                    Ok(self.heap.make_bool(found))
                }
                ObjType::Str if lt == ObjType::Str => {
                    let needle = self.heap.str_bytes(lhs.obj).to_vec();
                    let hay = self.heap.str_bytes(rhs.obj);
                    let found = hay.windows(needle.len().max(1)).any(|w| w == needle.as_slice())
                        || needle.is_empty();
                    Ok(self.heap.make_bool(found))
                }
                other => {
                    self.vm_error_at(rhs.ip, &format!("cannot search inside {}", other.name()));
                    Err(())
                }
            },
            Op::Gt | Op::Lt => {
                let (Some(a), Some(b)) = (self.heap.number(lhs.obj), self.heap.number(rhs.obj))
                else {
                    self.vm_error_at(
                        lhs.ip,
                        &format!("cannot compare {} and {}", lt.name(), rt.name()),
                    );
                    return Err(());
                };
                Ok(self.heap.make_bool(if op == Op::Gt { a > b } else { a < b }))
            }
            Op::Add => self.add_op(lhs, rhs),
            Op::Sub | Op::Mul | Op::Div | Op::Mod => {
                if lt == ObjType::Str && rt == ObjType::Str && op == Op::Div {
                    // Path join.
                    let a = self.heap.str_display(lhs.obj);
                    let b = self.heap.str_display(rhs.obj);
                    let joined = if b.starts_with('/') {
                        b
                    } else if a.is_empty() || a.ends_with('/') {
                        format!("{a}{b}")
                    } else {
                        format!("{a}/{b}")
                    };
                    return Ok(self.heap.str_intern(joined.as_bytes()));
                }
                let (Some(a), Some(b)) = (self.heap.number(lhs.obj), self.heap.number(rhs.obj))
                else {
                    self.vm_error_at(
                        lhs.ip,
                        &format!("invalid operands: {} and {}", lt.name(), rt.name()),
                    );
                    return Err(());
                };
                let result = match op {
                    Op::Sub => a.checked_sub(b),
                    Op::Mul => a.checked_mul(b),
                    Op::Div => {
                        if b == 0 {
                            self.vm_error_at(rhs.ip, "division by zero");
                            return Err(());
                        }
                        a.checked_div(b)
                    }
                    _ => {
                        if b == 0 {
                            self.vm_error_at(rhs.ip, "modulo by zero");
                            return Err(());
                        }
                        a.checked_rem(b)
                    }
                };
                let Some(result) = result else {
                    self.vm_error_at(lhs.ip, "arithmetic overflow");
                    return Err(());
                };
                Ok(self.heap.make_number(result))
            }
            _ => {
                self.vm_error("bad binary opcode");
                Err(())
            }
        }
    }

    fn add_op(&mut self, lhs: StackEntry, rhs: StackEntry) -> Result<Obj, ()> {
        let lt = self.heap.typ(lhs.obj);
        let rt = self.heap.typ(rhs.obj);
        match (lt, rt) {
            (ObjType::Number, ObjType::Number) => {
                let a = self.heap.number(lhs.obj).unwrap_or(0);
                let b = self.heap.number(rhs.obj).unwrap_or(0);
                let Some(sum) = a.checked_add(b) else {
                    self.vm_error_at(lhs.ip, "arithmetic overflow");
                    return Err(());
                };
                Ok(self.heap.make_number(sum))
            }
            (ObjType::Str, ObjType::Str) => {
                let mut bytes = self.heap.str_bytes(lhs.obj).to_vec();
                bytes.extend_from_slice(self.heap.str_bytes(rhs.obj));
                Ok(self.heap.str_intern(&bytes))
            }
            (ObjType::Array, _) => {
                let out = self.heap.arr_dup_light(lhs.obj);
                if rt == ObjType::Array {
                    self.heap.arr_extend(out, rhs.obj);
                } else {
                    self.heap.arr_push(out, rhs.obj);
                }
                Ok(out)
            }
            (ObjType::Dict, ObjType::Dict) => {
                let out = self.heap.dict_dup(lhs.obj);
                for (k, v) in self.heap.dict_iter(rhs.obj).collect::<Vec<_>>() {
                    self.heap.dict_set(out, k, v);
                }
                Ok(out)
            }
            _ => {
                self.vm_error_at(
                    lhs.ip,
                    &format!("cannot add {} and {}", lt.name(), rt.name()),
                );
                Err(())
            }
        }
    }

    fn index_op(&mut self, container: StackEntry, index: StackEntry) -> Result<Obj, ()> {
        if container.obj == Obj::DISABLER || index.obj == Obj::DISABLER {
            self.vm.saw_disabler = true;
            return Ok(Obj::DISABLER);
        }
        match self.heap.typ(container.obj) {
            ObjType::Array => {
                let Some(i) = self.heap.number(index.obj) else {
                    self.vm_error_at(index.ip, "array index must be a number");
                    return Err(());
                };
                let len = self.heap.arr_len(container.obj);
                let resolved = if i < 0 { i + i64::try_from(len).unwrap_or(0) } else { i };
                let idx = usize::try_from(resolved).ok().filter(|v| *v < len);
                match idx.and_then(|v| self.heap.arr_get(container.obj, v)) {
                    Some(value) => Ok(value),
                    None => {
                        self.vm_error_at(
                            index.ip,
                            &format!("index {i} out of bounds for array of length {len}"),
                        );
                        Err(())
                    }
                }
            }
            ObjType::Dict => {
                let key = match self.heap.get(index.obj) {
                    ObjValue::Str(_) => DictKey::Str(index.obj),
                    ObjValue::Number(n) => DictKey::Int(n),
                    _ => {
                        self.vm_error_at(index.ip, "dict keys must be strings or integers");
                        return Err(());
                    }
                };
                match self.heap.dict_get(container.obj, key) {
                    Some(value) => Ok(value),
                    None => {
                        let k = self.heap.obj_display(index.obj);
                        self.vm_error_at(index.ip, &format!("key {k} not found"));
                        Err(())
                    }
                }
            }
            ObjType::Str => {
                let Some(i) = self.heap.number(index.obj) else {
                    self.vm_error_at(index.ip, "string index must be a number");
                    return Err(());
                };
                let bytes = self.heap.str_bytes(container.obj).to_vec();
                match usize::try_from(i).ok().and_then(|v| bytes.get(v)).copied() {
                    Some(b) => Ok(self.heap.str_intern(&[b])),
                    None => {
                        self.vm_error_at(index.ip, &format!("index {i} out of bounds"));
                        Err(())
                    }
                }
            }
            ObjType::CustomTarget => {
                let Some(i) = self.heap.number(index.obj) else {
                    self.vm_error_at(index.ip, "output index must be a number");
                    return Err(());
                };
                let rec_idx = self.heap.record_idx(container.obj);
                let outputs = self.heap.custom_targets[rec_idx].outputs;
                match usize::try_from(i).ok().and_then(|v| self.heap.arr_get(outputs, v)) {
                    Some(value) => Ok(value),
                    None => {
                        self.vm_error_at(index.ip, &format!("output index {i} out of bounds"));
                        Err(())
                    }
                }
            }
            other => {
                self.vm_error_at(container.ip, &format!("cannot index {}", other.name()));
                Err(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::Workspace;
    use rstest::rstest;

    fn eval(text: &str) -> (Workspace, Result<Obj, ()>) {
        let mut wk = Workspace::bare();
        let result = wk.eval_snippet(text);
        (wk, result)
    }

    fn eval_var(text: &str, var: &str) -> (Workspace, Option<Obj>) {
        let (wk, result) = eval(text);
        assert!(result.is_ok(), "evaluation failed: {text}");
        let value = wk.scope_lookup_bytes(var.as_bytes());
        (wk, value)
    }

    #[rstest]
    fn arithmetic_and_precedence() {
        let (wk, v) = eval_var("x = 1 + 2 * 3", "x");
        assert_eq!(wk.heap.number(v.expect("x")), Some(7));
    }

    #[rstest]
    fn string_concat_interned() {
        let (wk, v) = eval_var("x = 'a' + 'b'", "x");
        assert_eq!(wk.heap.str_bytes(v.expect("x")), b"ab");
    }

    #[rstest]
    fn bool_plus_bool_is_an_error() {
        let (wk, result) = eval("x = true + true");
        assert!(result.is_err());
        assert!(wk.diags.has_errors());
    }

    #[rstest]
    fn division_by_zero_is_an_error() {
        let (_, result) = eval("x = 1 / 0");
        assert!(result.is_err());
    }

    #[rstest]
    fn string_div_joins_paths() {
        let (wk, v) = eval_var("x = 'a' / 'b'", "x");
        assert_eq!(wk.heap.str_bytes(v.expect("x")), b"a/b");
    }

    #[rstest]
    fn if_chain_picks_first_true_arm() {
        let (wk, v) = eval_var("if false\nx = 1\nelif true\nx = 2\nelse\nx = 3\nendif", "x");
        assert_eq!(wk.heap.number(v.expect("x")), Some(2));
    }

    #[rstest]
    fn foreach_accumulates() {
        let (wk, v) = eval_var("x = 0\nforeach i : [1, 2, 3]\nx += i\nendforeach", "x");
        assert_eq!(wk.heap.number(v.expect("x")), Some(6));
    }

    #[rstest]
    fn foreach_over_dict_binds_key_and_value() {
        let (wk, v) = eval_var(
            "acc = ''\nforeach k, v : {'a': 'x', 'b': 'y'}\nacc += k + v\nendforeach",
            "acc",
        );
        assert_eq!(wk.heap.str_bytes(v.expect("acc")), b"axby");
    }

    #[rstest]
    fn break_and_continue() {
        let (wk, v) = eval_var(
            "x = 0\nforeach i : [1, 2, 3, 4]\nif i == 2\ncontinue\nendif\nif i == 4\nbreak\nendif\nx += i\nendforeach",
            "x",
        );
        assert_eq!(wk.heap.number(v.expect("x")), Some(4));
    }

    #[rstest]
    fn in_operator_on_arrays_and_dicts() {
        let (wk, v) = eval_var("x = 2 in [1, 2]", "x");
        assert_eq!(v.expect("x"), Obj::TRUE);
        let (_, v) = eval_var("x = 'k' in {'k': 1}", "x");
        assert_eq!(v.expect("x"), Obj::TRUE);
        let (_, v) = eval_var("x = 'zz' not in 'azza'", "x");
        assert_eq!(v.expect("x"), Obj::FALSE);
        let _ = wk;
    }

    #[rstest]
    fn ternary_evaluates_single_branch() {
        let (wk, v) = eval_var("x = true ? 1 : 2", "x");
        assert_eq!(wk.heap.number(v.expect("x")), Some(1));
    }

    #[rstest]
    fn index_negative_counts_from_end() {
        let (wk, v) = eval_var("x = [1, 2, 3][-1]", "x");
        assert_eq!(wk.heap.number(v.expect("x")), Some(3));
    }

    #[rstest]
    fn function_call_and_return_typecheck() {
        let (wk, v) = eval_var("func f(a: int) -> int\nreturn a + 1\nendfunc\nx = f(2)", "x");
        assert_eq!(wk.heap.number(v.expect("x")), Some(3));
    }

    #[rstest]
    fn function_return_type_mismatch_errors() {
        let (_, result) = eval("func f() -> int\nreturn 'nope'\nendfunc\nx = f()");
        assert!(result.is_err());
    }

    #[rstest]
    fn closure_captures_by_value() {
        // Mutating x after capture must not change the captured value.
        let src = "x = 1\nfunc make() -> func\ny = x\nreturn (func() -> int\nreturn y\nendfunc)\nendfunc\ng = make()\nx = 99\nr = g()";
        let (wk, v) = eval_var(src, "r");
        assert_eq!(wk.heap.number(v.expect("r")), Some(1));
    }

    #[rstest]
    fn defaulted_parameter_binds_by_keyword() {
        let (wk, v) = eval_var(
            "func f(a: int, b: int = 10) -> int\nreturn a + b\nendfunc\nx = f(1) + f(1, b: 2)",
            "x",
        );
        assert_eq!(wk.heap.number(v.expect("x")), Some(14));
    }

    #[rstest]
    fn disabler_short_circuits_operators_and_calls() {
        let (wk, v) = eval_var("x = disabler() + 1", "x");
        assert_eq!(v.expect("x"), Obj::DISABLER);
        let _ = wk;
        let (_, v) = eval_var("x = disabler().foo().bar", "x");
        assert_eq!(v.expect("x"), Obj::DISABLER);
    }

    #[rstest]
    fn disabler_in_ternary_condition_propagates() {
        let (_, v) = eval_var("x = disabler() ? 1 : 2", "x");
        assert_eq!(v.expect("x"), Obj::DISABLER);
    }

    #[rstest]
    fn undefined_variable_is_an_error() {
        let (wk, result) = eval("x = missing_thing");
        assert!(result.is_err());
        assert!(wk.diags.has_errors());
    }

    #[rstest]
    fn determinism_two_runs_same_diagnostics() {
        let src = "x = missing_one\ny = missing_two";
        let render = |wk: &Workspace| {
            let mut buf = Vec::new();
            wk.diags.replay(&wk.sources, &mut buf).expect("replay");
            String::from_utf8(buf).expect("utf8")
        };
        let (wk1, _) = eval(src);
        let (wk2, _) = eval(src);
        assert_eq!(render(&wk1), render(&wk2));
    }

    #[rstest]
    fn plus_assign_rebinds_arrays_without_aliasing() {
        let (wk, v) = eval_var("a = [1]\nb = a\na += 2", "b");
        // `b` still sees the one-element array.
        assert_eq!(wk.heap.arr_len(v.expect("b")), 1);
    }
}

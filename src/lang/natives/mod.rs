//! Native function registry and argument binding.
//!
//! The registry maps `(receiver type, name)` pairs to function indices and
//! is closed at startup. Free functions are looked up by bare name when the
//! callee of a call node is a plain identifier; instance methods receive
//! the receiver as their implicit first argument.

mod collections;
mod kernel;
mod objects;
mod strings;

use std::collections::HashMap;

use crate::lang::object::{Obj, ObjType};
use crate::lang::types::TypeTag;
use crate::workspace::Workspace;

/// Outcome of a native call. An `Err` means a diagnostic has already been
/// recorded and the VM error flag is set.
pub type NativeResult = Result<Obj, ()>;

pub type NativeFn = fn(&mut Workspace, Obj, &mut CallArgs) -> NativeResult;

pub struct NativeDesc {
    pub name: &'static str,
    pub receiver: Option<ObjType>,
    pub func: NativeFn,
    /// Dispatch even when an argument is the disabler singleton.
    pub handles_disabler: bool,
}

/// Closed dispatch table, built once per workspace.
pub struct NativeRegistry {
    entries: Vec<NativeDesc>,
    kernel: HashMap<&'static str, u32>,
    methods: HashMap<(ObjType, &'static str), u32>,
}

impl NativeRegistry {
    #[must_use]
    pub fn empty() -> Self {
        Self { entries: Vec::new(), kernel: HashMap::new(), methods: HashMap::new() }
    }

    /// The full standard registry.
    #[must_use]
    pub fn standard() -> Self {
        let mut reg = Self::empty();
        kernel::register(&mut reg);
        strings::register(&mut reg);
        collections::register(&mut reg);
        objects::register(&mut reg);
        reg
    }

    pub fn add_kernel(&mut self, name: &'static str, func: NativeFn) {
        self.add(NativeDesc { name, receiver: None, func, handles_disabler: false });
    }

    pub fn add_kernel_raw(&mut self, name: &'static str, func: NativeFn) {
        self.add(NativeDesc { name, receiver: None, func, handles_disabler: true });
    }

    pub fn add_method(&mut self, receiver: ObjType, name: &'static str, func: NativeFn) {
        self.add(NativeDesc { name, receiver: Some(receiver), func, handles_disabler: false });
    }

    fn add(&mut self, desc: NativeDesc) {
        let idx = u32::try_from(self.entries.len()).unwrap_or(u32::MAX);
        match desc.receiver {
            Some(t) => {
                self.methods.insert((t, desc.name), idx);
            }
            None => {
                self.kernel.insert(desc.name, idx);
            }
        }
        self.entries.push(desc);
    }

    #[must_use]
    pub fn kernel_index(&self, name: &[u8]) -> Option<u32> {
        let name = std::str::from_utf8(name).ok()?;
        self.kernel.get(name).copied()
    }

    #[must_use]
    pub fn method_index(&self, receiver: ObjType, name: &[u8]) -> Option<u32> {
        let name = std::str::from_utf8(name).ok()?;
        self.methods.get(&(receiver, name)).copied()
    }

    #[must_use]
    pub fn get(&self, idx: u32) -> Option<&NativeDesc> {
        self.entries.get(idx as usize)
    }
}

/// One bound argument with the instruction pointer it was pushed at, so
/// type errors point at the offending expression.
#[derive(Debug, Clone, Copy)]
pub struct ArgVal {
    pub obj: Obj,
    pub ip: u32,
}

/// The uniform argument frame consumed by natives and function calls.
#[derive(Debug, Default)]
pub struct CallArgs {
    pub positional: Vec<ArgVal>,
    pub kwargs: Vec<(Vec<u8>, ArgVal)>,
    next: usize,
    pub call_ip: u32,
}

impl CallArgs {
    #[must_use]
    pub fn new(positional: Vec<ArgVal>, kwargs: Vec<(Vec<u8>, ArgVal)>, call_ip: u32) -> Self {
        Self { positional, kwargs, next: 0, call_ip }
    }

    /// Restart positional consumption; used by natives that bind the same
    /// arguments twice (e.g. `both_libraries`).
    pub fn rewind(&mut self) {
        self.next = 0;
    }

    #[must_use]
    pub fn has_disabler(&self) -> bool {
        self.positional.iter().any(|a| a.obj == Obj::DISABLER)
            || self.kwargs.iter().any(|(_, a)| a.obj == Obj::DISABLER)
    }

    /// Next required positional argument, validated against `ty`. A
    /// `listify` tag collapses single values to one-element lists.
    pub fn next_pos(&mut self, wk: &mut Workspace, what: &str, ty: TypeTag) -> Result<Obj, ()> {
        let Some(arg) = self.positional.get(self.next).copied() else {
            wk.vm_error_at(self.call_ip, &format!("missing argument {what}"));
            return Err(());
        };
        self.next += 1;
        bind(wk, arg, what, ty)
    }

    /// Optional positional argument.
    pub fn opt_pos(&mut self, wk: &mut Workspace, what: &str, ty: TypeTag) -> Result<Option<Obj>, ()> {
        let Some(arg) = self.positional.get(self.next).copied() else {
            return Ok(None);
        };
        self.next += 1;
        bind(wk, arg, what, ty).map(Some)
    }

    /// Remaining positional arguments (the `glob` tail), each validated.
    pub fn rest(&mut self, wk: &mut Workspace, what: &str, ty: TypeTag) -> Result<Vec<Obj>, ()> {
        let mut out = Vec::new();
        while self.next < self.positional.len() {
            let arg = self.positional[self.next];
            self.next += 1;
            out.push(bind(wk, arg, what, ty)?);
        }
        Ok(out)
    }

    /// Keyword argument by name, validated when present.
    pub fn kw(&mut self, wk: &mut Workspace, name: &str, ty: TypeTag) -> Result<Option<Obj>, ()> {
        let found = self
            .kwargs
            .iter()
            .find(|(k, _)| k.as_slice() == name.as_bytes())
            .map(|(_, v)| *v);
        match found {
            Some(arg) => bind(wk, arg, name, ty).map(Some),
            None => Ok(None),
        }
    }

    pub fn kw_bool(&mut self, wk: &mut Workspace, name: &str, default: bool) -> Result<bool, ()> {
        let obj = self.kw(wk, name, crate::lang::types::tag::BOOL)?;
        Ok(obj.map_or(default, |o| o == Obj::TRUE))
    }

    pub fn kw_str(&mut self, wk: &mut Workspace, name: &str) -> Result<Option<Obj>, ()> {
        self.kw(wk, name, crate::lang::types::tag::STR)
    }
}

/// Validate one argument against a tag, applying the `listify` collapse.
fn bind(wk: &mut Workspace, arg: ArgVal, what: &str, ty: TypeTag) -> Result<Obj, ()> {
    if ty.is_listify() {
        let listified = wk.listify(arg.obj);
        let inner = ty.base();
        let ok = wk
            .heap
            .arr_to_vec(listified)
            .iter()
            .all(|v| wk.types.typecheck(&wk.heap, *v, inner));
        if !ok {
            let expected = wk.types.display(inner);
            wk.vm_error_at(arg.ip, &format!("{what}: expected {expected} or a list of them"));
            return Err(());
        }
        return Ok(listified);
    }
    if wk.types.typecheck(&wk.heap, arg.obj, ty) {
        Ok(arg.obj)
    } else {
        let expected = wk.types.display(ty.base());
        let got = wk.heap.typ(arg.obj).name();
        wk.vm_error_at(arg.ip, &format!("{what}: expected {expected}, got {got}"));
        Err(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registry_resolves_kernel_and_methods() {
        let reg = NativeRegistry::standard();
        assert!(reg.kernel_index(b"project").is_some());
        assert!(reg.kernel_index(b"no_such_fn").is_none());
        assert!(reg.method_index(ObjType::Str, b"format").is_some());
        assert!(reg.method_index(ObjType::Str, b"no_such_method").is_none());
    }
}

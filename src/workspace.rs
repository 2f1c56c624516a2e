//! Per-process configure state.
//!
//! The workspace owns every heap, cache, and option table and is threaded
//! through the call graph as a single value; nothing lives in globals. One
//! workspace configures one build directory.

use std::collections::HashMap;

use camino::{Utf8Path, Utf8PathBuf};

use crate::diagnostics::DiagnosticStore;
use crate::lang::compiler::Compiler;
use crate::lang::lexer::LexerMode;
use crate::lang::natives::NativeRegistry;
use crate::lang::object::{Heap, ModuleRecord, Obj};
use crate::lang::types::TypeRegistry;
use crate::lang::vm::Vm;
use crate::machines::{Machine, MachineKind};
use crate::options::{OptionSource, OptionStore};
use crate::source::Source;
use crate::toolchain::Language;
use crate::toolchain::cache::CheckCache;

/// One evaluated `project()` and everything it declared.
#[derive(Debug)]
pub struct Project {
    pub name: Obj,
    pub version: Obj,
    pub languages: Vec<Language>,
    pub compilers: HashMap<(MachineKind, Language), Obj>,
    /// Build, custom, and alias targets in declaration order.
    pub targets: Vec<Obj>,
    pub tests: Vec<Obj>,
    pub install: Vec<Obj>,
    /// Per-machine, per-language project compile args.
    pub project_args: HashMap<(MachineKind, Language), Obj>,
    /// Per-machine, per-language global compile args.
    pub global_args: HashMap<(MachineKind, Language), Obj>,
    pub summary: Obj,
    pub dep_cache: HashMap<String, Obj>,
    pub subdir: Utf8PathBuf,
}

pub struct Workspace {
    pub heap: Heap,
    pub vm: Vm,
    pub types: TypeRegistry,
    pub natives: NativeRegistry,
    pub diags: DiagnosticStore,
    pub sources: Vec<Source>,
    pub options: OptionStore,
    pub build_machine: Machine,
    pub host_machine: Machine,
    pub projects: Vec<Project>,
    pub check_cache: CheckCache,
    pub source_root: Utf8PathBuf,
    pub build_root: Utf8PathBuf,
    /// Current subdirectory relative to the source root.
    pub cur_subdir: Utf8PathBuf,
    /// Language extension keywords (`func`, `return`, …) enabled.
    pub extensions: bool,
}

impl Workspace {
    #[must_use]
    pub fn new(source_root: Utf8PathBuf, build_root: Utf8PathBuf) -> Self {
        let mut heap = Heap::new();
        let mut options = OptionStore::new();
        options.init_builtins(&mut heap);

        let machine = Machine::detect();
        let mut wk = Self {
            heap,
            vm: Vm::default(),
            types: TypeRegistry::new(),
            natives: NativeRegistry::standard(),
            diags: DiagnosticStore::new(),
            sources: Vec::new(),
            options,
            build_machine: machine.clone(),
            host_machine: machine,
            projects: Vec::new(),
            check_cache: CheckCache::new(),
            source_root,
            build_root,
            cur_subdir: Utf8PathBuf::new(),
            extensions: true,
        };
        wk.absorb_environment();
        wk.init_default_scope();
        wk
    }

    /// A workspace rooted in the current directory; used by unit tests and
    /// `eval` helpers that never touch the disk.
    #[must_use]
    pub fn bare() -> Self {
        Self::new(Utf8PathBuf::from("."), Utf8PathBuf::from("."))
    }

    /// Feed `CC`-style environment variables into the option store at
    /// environment rank.
    fn absorb_environment(&mut self) {
        for lang in Language::ALL {
            let var = lang.env_var();
            if let Ok(value) = std::env::var(var) {
                let name = format!("env.{var}");
                let _ = self.options.set_from_str(
                    &mut self.heap,
                    &name,
                    &value,
                    OptionSource::Environment,
                );
            }
        }
    }

    /// Create the outermost scope dict and populate the builtin objects.
    fn init_default_scope(&mut self) {
        let stack = self.heap.arr_new();
        let globals = self.heap.dict_new();
        self.heap.arr_push(stack, globals);
        self.vm.scope_stack = stack;

        let meson_name = self.heap.str_intern(b"meson");
        let meson = self.heap.make_module(ModuleRecord { name: meson_name, found: true });
        self.heap.dict_set_str(globals, meson_name, meson);

        let build = self.heap.make_machine(MachineKind::Build);
        let host = self.heap.make_machine(MachineKind::Host);
        for (name, obj) in
            [("build_machine", build), ("host_machine", host), ("target_machine", host)]
        {
            let key = self.heap.str_intern(name.as_bytes());
            self.heap.dict_set_str(globals, key, obj);
        }
    }

    #[must_use]
    pub fn machine(&self, kind: MachineKind) -> &Machine {
        match kind {
            MachineKind::Build => &self.build_machine,
            MachineKind::Host => &self.host_machine,
        }
    }

    pub fn machine_mut(&mut self, kind: MachineKind) -> &mut Machine {
        match kind {
            MachineKind::Build => &mut self.build_machine,
            MachineKind::Host => &mut self.host_machine,
        }
    }

    // ------------------------------------------------------------------
    // projects

    pub fn push_project(&mut self, name: Obj, version: Obj, subdir: Utf8PathBuf) -> usize {
        let summary = self.heap.dict_new();
        self.projects.push(Project {
            name,
            version,
            languages: Vec::new(),
            compilers: HashMap::new(),
            targets: Vec::new(),
            tests: Vec::new(),
            install: Vec::new(),
            project_args: HashMap::new(),
            global_args: HashMap::new(),
            summary,
            dep_cache: HashMap::new(),
            subdir,
        });
        self.projects.len() - 1
    }

    /// The project currently being configured, if `project()` ran.
    pub fn cur_project(&mut self) -> Option<&mut Project> {
        self.projects.last_mut()
    }

    // ------------------------------------------------------------------
    // evaluation pipeline

    pub fn add_source(&mut self, source: Source) -> u32 {
        self.sources.push(source);
        u32::try_from(self.sources.len() - 1).unwrap_or(u32::MAX)
    }

    #[must_use]
    pub fn lexer_mode(&self) -> LexerMode {
        LexerMode { extensions: self.extensions, formatter: false }
    }

    /// Lex, parse, compile, and execute one registered source. Failures
    /// land in the diagnostics store.
    pub fn eval_registered(&mut self, src_idx: u32) -> Result<Obj, ()> {
        let mode = self.lexer_mode();
        // The parser borrows the source immutably and everything else
        // mutably; split them via a raw index re-borrow.
        let source = std::mem::replace(
            &mut self.sources[src_idx as usize],
            Source::anonymous(Vec::new()),
        );
        let (ast, parse_ok) = crate::lang::parser::Parser::parse(
            &source,
            &mut self.heap,
            &mut self.types,
            &mut self.diags,
            src_idx,
            mode,
        );
        self.sources[src_idx as usize] = source;
        if !parse_ok {
            self.vm.error = true;
            return Err(());
        }
        let (entry, compile_ok) = Compiler::compile(
            &mut self.vm.buf,
            &mut self.heap,
            &self.natives,
            &mut self.diags,
            &ast,
            src_idx,
        );
        if !compile_ok {
            self.vm.error = true;
            return Err(());
        }
        self.vm_execute(entry)
    }

    /// Evaluate an in-memory snippet (tests, `-Dcmd` style evaluation).
    pub fn eval_snippet(&mut self, text: &str) -> Result<Obj, ()> {
        let idx = self.add_source(Source::anonymous(text.as_bytes().to_vec()));
        self.eval_registered(idx)
    }

    /// Evaluate a file from disk.
    pub fn eval_file(&mut self, path: &Utf8Path) -> Result<Obj, ()> {
        let Ok(bytes) = std::fs::read(path) else {
            self.vm_error(&format!("failed to read {path}"));
            return Err(());
        };
        let idx = self.add_source(Source::new(path.to_owned(), bytes));
        self.eval_registered(idx)
    }

    // ------------------------------------------------------------------
    // paths

    #[must_use]
    pub fn current_source_dir(&self) -> Utf8PathBuf {
        self.source_root.join(&self.cur_subdir)
    }

    #[must_use]
    pub fn current_build_dir(&self) -> Utf8PathBuf {
        self.build_root.join(&self.cur_subdir)
    }

    pub fn stri(&mut self, s: &str) -> Obj {
        self.heap.str_intern(s.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_objects_resolve_in_scope() {
        let wk = Workspace::bare();
        assert!(wk.scope_lookup_bytes(b"meson").is_some());
        assert!(wk.scope_lookup_bytes(b"build_machine").is_some());
        assert!(wk.scope_lookup_bytes(b"host_machine").is_some());
    }

    #[test]
    fn snippet_evaluation_returns_null_for_plain_statements() {
        let mut wk = Workspace::bare();
        let result = wk.eval_snippet("x = 1").expect("eval");
        assert_eq!(result, Obj::NULL);
    }

    #[test]
    fn parse_failure_reports_and_errors() {
        let mut wk = Workspace::bare();
        assert!(wk.eval_snippet("x = = =").is_err());
        assert!(wk.diags.has_errors());
    }
}

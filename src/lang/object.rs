//! The tagged object heap.
//!
//! Every language value is addressed by a 32-bit [`Obj`] handle. Handle 0 is
//! null and handles 1–3 are the compile-time singletons (disabler, true,
//! false), so equality of singletons is handle equality. Strings are
//! content-interned: equal byte sequences always share a handle.
//!
//! Aggregates follow an arena-of-indices model: arrays are chains of cells
//! in a chunked pool, dicts start as a small in-line list and promote to a
//! hash once they grow, and typed records (targets, dependencies, …) live in
//! per-type arenas whose attributes are themselves object handles.

use std::collections::HashMap;

use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;

use crate::lang::types::TypeTag;
use crate::machines::MachineKind;

/// Opaque object handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Obj(pub u32);

impl Obj {
    pub const NULL: Self = Self(0);
    pub const DISABLER: Self = Self(1);
    pub const TRUE: Self = Self(2);
    pub const FALSE: Self = Self(3);
}

macro_rules! obj_types {
    ($($variant:ident => $name:literal),+ $(,)?) => {
        /// Discriminant of every object variant. The discriminant order is
        /// load-bearing: type tags use one bit per variant.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum ObjType {
            $($variant),+
        }

        impl ObjType {
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];
            pub const COUNT: usize = Self::ALL.len();

            #[must_use]
            pub const fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $name),+
                }
            }
        }
    };
}

obj_types! {
    Null => "null",
    Disabler => "disabler",
    Bool => "bool",
    File => "file",
    FeatureOpt => "feature",
    Machine => "machine",
    Number => "number",
    Str => "string",
    Array => "array",
    Dict => "dict",
    Compiler => "compiler",
    BuildTarget => "build_target",
    CustomTarget => "custom_target",
    Dependency => "dependency",
    ExternalProgram => "external_program",
    RunResult => "run_result",
    ConfigurationData => "configuration_data",
    Test => "test",
    Module => "module",
    InstallTarget => "install_target",
    Environment => "environment",
    IncludeDirectory => "include_directory",
    BuildOption => "option",
    Generator => "generator",
    GeneratedList => "generated_list",
    AliasTarget => "alias_target",
    BothLibs => "both_libs",
    SourceSet => "source_set",
    SourceConfiguration => "source_configuration",
    Iterator => "iterator",
    Func => "func",
    Capture => "capture",
    TypeInfo => "typeinfo",
}

/// Feature-option tri-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureState {
    Enabled,
    Disabled,
    Auto,
}

impl FeatureState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
            Self::Auto => "auto",
        }
    }
}

/// The value behind a handle. Small payloads are inline; aggregates index
/// the typed arenas on [`Heap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjValue {
    Null,
    Disabler,
    Bool(bool),
    File(u32),
    FeatureOpt(FeatureState),
    Machine(MachineKind),
    Number(i64),
    Str(u32),
    Array(u32),
    Dict(u32),
    Compiler(u32),
    BuildTarget(u32),
    CustomTarget(u32),
    Dependency(u32),
    ExternalProgram(u32),
    RunResult(u32),
    ConfigurationData(u32),
    Test(u32),
    Module(u32),
    InstallTarget(u32),
    Environment(u32),
    IncludeDirectory(u32),
    BuildOption(u32),
    Generator(u32),
    GeneratedList(u32),
    AliasTarget(u32),
    BothLibs(u32),
    SourceSet(u32),
    SourceConfiguration(u32),
    Iterator(u32),
    Func(u32),
    Capture(u32),
    TypeInfo(TypeTag),
}

impl ObjValue {
    #[must_use]
    pub const fn typ(self) -> ObjType {
        match self {
            Self::Null => ObjType::Null,
            Self::Disabler => ObjType::Disabler,
            Self::Bool(_) => ObjType::Bool,
            Self::File(_) => ObjType::File,
            Self::FeatureOpt(_) => ObjType::FeatureOpt,
            Self::Machine(_) => ObjType::Machine,
            Self::Number(_) => ObjType::Number,
            Self::Str(_) => ObjType::Str,
            Self::Array(_) => ObjType::Array,
            Self::Dict(_) => ObjType::Dict,
            Self::Compiler(_) => ObjType::Compiler,
            Self::BuildTarget(_) => ObjType::BuildTarget,
            Self::CustomTarget(_) => ObjType::CustomTarget,
            Self::Dependency(_) => ObjType::Dependency,
            Self::ExternalProgram(_) => ObjType::ExternalProgram,
            Self::RunResult(_) => ObjType::RunResult,
            Self::ConfigurationData(_) => ObjType::ConfigurationData,
            Self::Test(_) => ObjType::Test,
            Self::Module(_) => ObjType::Module,
            Self::InstallTarget(_) => ObjType::InstallTarget,
            Self::Environment(_) => ObjType::Environment,
            Self::IncludeDirectory(_) => ObjType::IncludeDirectory,
            Self::BuildOption(_) => ObjType::BuildOption,
            Self::Generator(_) => ObjType::Generator,
            Self::GeneratedList(_) => ObjType::GeneratedList,
            Self::AliasTarget(_) => ObjType::AliasTarget,
            Self::BothLibs(_) => ObjType::BothLibs,
            Self::SourceSet(_) => ObjType::SourceSet,
            Self::SourceConfiguration(_) => ObjType::SourceConfiguration,
            Self::Iterator(_) => ObjType::Iterator,
            Self::Func(_) => ObjType::Func,
            Self::Capture(_) => ObjType::Capture,
            Self::TypeInfo(_) => ObjType::TypeInfo,
        }
    }
}

const CELL_NONE: u32 = u32::MAX;
const DICT_PROMOTE_THRESHOLD: usize = 16;

#[derive(Debug, Clone, Copy)]
struct ArrayCell {
    val: Obj,
    next: u32,
}

#[derive(Debug, Clone, Copy)]
struct ArrayData {
    head: u32,
    tail: u32,
    len: u32,
    cow: bool,
}

/// A dict key: an interned string handle or an integer. Handle equality is
/// value equality for interned strings, so derived `Eq`/`Hash` suffice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DictKey {
    Str(Obj),
    Int(i64),
}

#[derive(Debug, Clone)]
enum DictData {
    /// Low-cardinality layout: insertion-ordered key/value cells.
    Small(Vec<(DictKey, Obj)>),
    /// Promoted layout once the cell count crosses the threshold.
    Big(IndexMap<DictKey, Obj>),
}

// Typed records. Attributes are object handles so the heap stays the single
// owner of every value reachable from the language.

/// One consumer-facing view of a target's usage requirements.
#[derive(Debug, Clone, Copy)]
pub struct BuildDep {
    pub compile_args: Obj,
    pub include_dirs: Obj,
    pub link_args: Obj,
    pub link_with: Obj,
    pub link_whole: Obj,
    pub objects: Obj,
    pub order_deps: Obj,
    pub rpaths: Obj,
    pub sources: Obj,
    /// Partial-dependency selection flags for the raw form.
    pub parts: DepParts,
}

#[derive(Debug, Clone, Copy)]
pub struct DepParts {
    pub compile_args: bool,
    pub includes: bool,
    pub link_args: bool,
    pub links: bool,
    pub sources: bool,
}

impl DepParts {
    #[must_use]
    pub const fn all() -> Self {
        Self { compile_args: true, includes: true, link_args: true, links: true, sources: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Executable,
    StaticLibrary,
    SharedLibrary,
}

#[derive(Debug, Clone)]
pub struct BuildTargetRecord {
    pub name: Obj,
    pub kind: TargetKind,
    pub machine: MachineKind,
    pub sources: Obj,
    pub objects: Obj,
    pub include_dirs: Obj,
    pub link_with: Obj,
    pub link_args: Obj,
    /// Per-language compile args: dict of language name to argv array.
    pub lang_args: Obj,
    pub deps: Obj,
    pub dep_internal: BuildDep,
    pub dep_public: BuildDep,
    pub build_dir: Obj,
    /// Final on-disk file name, e.g. `hello` or `libfoo.a`.
    pub filename: Obj,
    pub install: bool,
}

#[derive(Debug, Clone)]
pub struct CustomTargetRecord {
    pub name: Obj,
    pub inputs: Obj,
    pub outputs: Obj,
    pub command: Obj,
    pub depfile: Obj,
    pub capture: bool,
    pub build_by_default: bool,
    pub depends: Obj,
    pub env: Obj,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyKind {
    Internal,
    External,
    NotFound,
}

#[derive(Debug, Clone)]
pub struct DependencyRecord {
    pub name: Obj,
    pub version: Obj,
    pub kind: DependencyKind,
    pub dep: BuildDep,
}

/// Which toolchain family produced a detected compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompilerKind {
    Posix,
    Gcc,
    Clang,
    AppleClang,
    Nasm,
}

impl CompilerKind {
    #[must_use]
    pub const fn id(self) -> &'static str {
        match self {
            Self::Posix => "posix",
            Self::Gcc => "gcc",
            Self::Clang | Self::AppleClang => "clang",
            Self::Nasm => "nasm",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkerKind {
    Posix,
    Gcc,
    Apple,
}

#[derive(Debug, Clone)]
pub struct CompilerRecord {
    pub lang: Obj,
    pub machine: MachineKind,
    pub kind: CompilerKind,
    pub cmd_array: Obj,
    pub version: Obj,
    pub triple: Obj,
    pub libdirs: Obj,
    pub linker_kind: LinkerKind,
    pub linker_cmd: Obj,
    pub archiver_cmd: Obj,
    /// Per-toolchain argument-generator overrides (constant or capture).
    pub overrides: Obj,
}

#[derive(Debug, Clone)]
pub struct ExternalProgramRecord {
    pub name: Obj,
    pub path: Obj,
    pub found: bool,
}

#[derive(Debug, Clone)]
pub struct RunResultRecord {
    pub status: i32,
    pub out: Obj,
    pub err: Obj,
}

#[derive(Debug, Clone)]
pub struct ConfigurationDataRecord {
    pub data: Obj,
}

#[derive(Debug, Clone)]
pub struct TestRecord {
    pub name: Obj,
    pub exe: Obj,
    pub args: Obj,
    pub env: Obj,
    pub should_fail: bool,
    pub timeout: i64,
    pub workdir: Obj,
    pub suites: Obj,
}

#[derive(Debug, Clone)]
pub struct ModuleRecord {
    pub name: Obj,
    pub found: bool,
}

#[derive(Debug, Clone)]
pub struct InstallTargetRecord {
    pub src: Obj,
    pub dest: Obj,
    pub mode: Obj,
}

/// Environment objects record their mutations in order so later expansion
/// can honor append/prepend separators.
#[derive(Debug, Clone)]
pub struct EnvironmentRecord {
    pub actions: Obj,
}

#[derive(Debug, Clone)]
pub struct IncludeDirectoryRecord {
    pub path: Obj,
    pub is_system: bool,
}

#[derive(Debug, Clone)]
pub struct GeneratorRecord {
    pub exe: Obj,
    pub args: Obj,
    pub output: Obj,
    pub depfile: Obj,
    pub capture: bool,
}

#[derive(Debug, Clone)]
pub struct GeneratedListRecord {
    pub generator: Obj,
    pub inputs: Obj,
}

#[derive(Debug, Clone)]
pub struct AliasTargetRecord {
    pub name: Obj,
    pub depends: Obj,
}

#[derive(Debug, Clone)]
pub struct BothLibsRecord {
    pub static_lib: Obj,
    pub shared_lib: Obj,
}

#[derive(Debug, Clone)]
pub struct SourceSetRecord {
    pub entries: Obj,
}

#[derive(Debug, Clone)]
pub struct SourceConfigurationRecord {
    pub sources: Obj,
    pub dependencies: Obj,
}

#[derive(Debug, Clone)]
pub enum IterState {
    Array { arr: Obj, cell: u32 },
    Dict { dict: Obj, idx: u32 },
    Range { cur: i64, end: i64, step: i64 },
}

/// A function parameter in the `func` extension.
#[derive(Debug, Clone)]
pub struct FuncParam {
    pub name: Obj,
    pub ty: TypeTag,
    pub default: Option<Obj>,
}

#[derive(Debug, Clone)]
pub struct FuncDef {
    pub name: Obj,
    pub entry_ip: u32,
    pub params: Vec<FuncParam>,
    pub return_type: TypeTag,
    pub src_idx: u32,
}

/// A function value bound to the scope stack captured (deep-duplicated) at
/// definition time.
#[derive(Debug, Clone)]
pub struct CaptureRecord {
    pub func: u32,
    pub scope_stack: Obj,
}

/// Snapshot of arena lengths; see [`Heap::mark`].
#[derive(Debug, Clone, Copy)]
pub struct HeapMark {
    objs: usize,
    strs: usize,
    cells: usize,
    arrays: usize,
    dicts: usize,
    files: usize,
}

/// The workspace object heap.
#[derive(Debug, Default)]
pub struct Heap {
    objs: Vec<ObjValue>,
    strs: Vec<Vec<u8>>,
    intern: HashMap<Vec<u8>, Obj>,
    cells: Vec<ArrayCell>,
    arrays: Vec<ArrayData>,
    dicts: Vec<DictData>,
    files: Vec<Utf8PathBuf>,
    pub compilers: Vec<CompilerRecord>,
    pub build_targets: Vec<BuildTargetRecord>,
    pub custom_targets: Vec<CustomTargetRecord>,
    pub dependencies: Vec<DependencyRecord>,
    pub external_programs: Vec<ExternalProgramRecord>,
    pub run_results: Vec<RunResultRecord>,
    pub configuration_datas: Vec<ConfigurationDataRecord>,
    pub tests: Vec<TestRecord>,
    pub modules: Vec<ModuleRecord>,
    pub install_targets: Vec<InstallTargetRecord>,
    pub environments: Vec<EnvironmentRecord>,
    pub include_directories: Vec<IncludeDirectoryRecord>,
    pub generators: Vec<GeneratorRecord>,
    pub generated_lists: Vec<GeneratedListRecord>,
    pub alias_targets: Vec<AliasTargetRecord>,
    pub both_libs: Vec<BothLibsRecord>,
    pub source_sets: Vec<SourceSetRecord>,
    pub source_configurations: Vec<SourceConfigurationRecord>,
    iterators: Vec<IterState>,
    pub funcs: Vec<FuncDef>,
    pub captures: Vec<CaptureRecord>,
}

impl Heap {
    #[must_use]
    pub fn new() -> Self {
        let mut heap = Self::default();
        heap.objs.push(ObjValue::Null);
        heap.objs.push(ObjValue::Disabler);
        heap.objs.push(ObjValue::Bool(true));
        heap.objs.push(ObjValue::Bool(false));
        heap
    }

    fn alloc(&mut self, value: ObjValue) -> Obj {
        let handle = u32::try_from(self.objs.len()).unwrap_or(u32::MAX);
        self.objs.push(value);
        Obj(handle)
    }

    #[must_use]
    pub fn get(&self, obj: Obj) -> ObjValue {
        self.objs.get(obj.0 as usize).copied().unwrap_or(ObjValue::Null)
    }

    #[must_use]
    pub fn typ(&self, obj: Obj) -> ObjType {
        self.get(obj).typ()
    }

    // ------------------------------------------------------------------
    // scalars

    #[must_use]
    pub fn make_bool(&mut self, b: bool) -> Obj {
        let _ = self;
        if b { Obj::TRUE } else { Obj::FALSE }
    }

    pub fn make_number(&mut self, n: i64) -> Obj {
        self.alloc(ObjValue::Number(n))
    }

    #[must_use]
    pub fn number(&self, obj: Obj) -> Option<i64> {
        match self.get(obj) {
            ObjValue::Number(n) => Some(n),
            _ => None,
        }
    }

    #[must_use]
    pub fn bool_value(&self, obj: Obj) -> Option<bool> {
        match self.get(obj) {
            ObjValue::Bool(b) => Some(b),
            _ => None,
        }
    }

    pub fn make_feature(&mut self, state: FeatureState) -> Obj {
        self.alloc(ObjValue::FeatureOpt(state))
    }

    pub fn make_machine(&mut self, kind: MachineKind) -> Obj {
        self.alloc(ObjValue::Machine(kind))
    }

    pub fn make_typeinfo(&mut self, tag: TypeTag) -> Obj {
        self.alloc(ObjValue::TypeInfo(tag))
    }

    // ------------------------------------------------------------------
    // strings

    /// Intern a byte string, returning the canonical handle for its
    /// contents.
    pub fn str_intern(&mut self, bytes: &[u8]) -> Obj {
        if let Some(found) = self.intern.get(bytes) {
            return *found;
        }
        let idx = u32::try_from(self.strs.len()).unwrap_or(u32::MAX);
        self.strs.push(bytes.to_vec());
        let handle = self.alloc(ObjValue::Str(idx));
        self.intern.insert(bytes.to_vec(), handle);
        handle
    }

    pub fn str_intern_utf8(&mut self, s: &str) -> Obj {
        self.str_intern(s.as_bytes())
    }

    #[must_use]
    pub fn str_bytes(&self, obj: Obj) -> &[u8] {
        match self.get(obj) {
            ObjValue::Str(idx) => self.strs.get(idx as usize).map_or(&[], Vec::as_slice),
            _ => &[],
        }
    }

    #[must_use]
    pub fn str_utf8(&self, obj: Obj) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(self.str_bytes(obj))
    }

    #[must_use]
    pub fn str_display(&self, obj: Obj) -> String {
        self.str_utf8(obj).into_owned()
    }

    // ------------------------------------------------------------------
    // files

    pub fn make_file(&mut self, path: Utf8PathBuf) -> Obj {
        let idx = u32::try_from(self.files.len()).unwrap_or(u32::MAX);
        self.files.push(path);
        self.alloc(ObjValue::File(idx))
    }

    #[must_use]
    pub fn file_path(&self, obj: Obj) -> Option<&Utf8Path> {
        match self.get(obj) {
            ObjValue::File(idx) => self.files.get(idx as usize).map(Utf8PathBuf::as_path),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // arrays

    pub fn arr_new(&mut self) -> Obj {
        let idx = u32::try_from(self.arrays.len()).unwrap_or(u32::MAX);
        self.arrays.push(ArrayData { head: CELL_NONE, tail: CELL_NONE, len: 0, cow: false });
        self.alloc(ObjValue::Array(idx))
    }

    pub fn arr_from_vec(&mut self, items: &[Obj]) -> Obj {
        let arr = self.arr_new();
        for item in items {
            self.arr_push(arr, *item);
        }
        arr
    }

    fn arr_idx(&self, obj: Obj) -> Option<usize> {
        match self.get(obj) {
            ObjValue::Array(idx) => Some(idx as usize),
            _ => None,
        }
    }

    /// Append to an array. Existing handles into the array stay valid; if
    /// the cells are shared (copy-on-write), they are copied first.
    pub fn arr_push(&mut self, arr: Obj, val: Obj) {
        let Some(idx) = self.arr_idx(arr) else { return };
        if self.arrays[idx].cow {
            self.arr_uncow(idx);
        }
        let cell = u32::try_from(self.cells.len()).unwrap_or(u32::MAX);
        self.cells.push(ArrayCell { val, next: CELL_NONE });
        let data = &mut self.arrays[idx];
        if data.head == CELL_NONE {
            data.head = cell;
        } else {
            let tail = data.tail as usize;
            self.cells[tail].next = cell;
        }
        let data = &mut self.arrays[idx];
        data.tail = cell;
        data.len += 1;
    }

    fn arr_uncow(&mut self, idx: usize) {
        let mut cur = self.arrays[idx].head;
        let mut head = CELL_NONE;
        let mut tail = CELL_NONE;
        while cur != CELL_NONE {
            let old = self.cells[cur as usize];
            let copy = u32::try_from(self.cells.len()).unwrap_or(u32::MAX);
            self.cells.push(ArrayCell { val: old.val, next: CELL_NONE });
            if head == CELL_NONE {
                head = copy;
            } else {
                self.cells[tail as usize].next = copy;
            }
            tail = copy;
            cur = old.next;
        }
        let data = &mut self.arrays[idx];
        data.head = head;
        data.tail = tail;
        data.cow = false;
    }

    #[must_use]
    pub fn arr_len(&self, arr: Obj) -> usize {
        self.arr_idx(arr).map_or(0, |idx| self.arrays[idx].len as usize)
    }

    #[must_use]
    pub fn arr_get(&self, arr: Obj, index: usize) -> Option<Obj> {
        self.arr_iter(arr).nth(index)
    }

    #[must_use]
    pub fn arr_iter(&self, arr: Obj) -> ArrIter<'_> {
        let cell = self.arr_idx(arr).map_or(CELL_NONE, |idx| self.arrays[idx].head);
        ArrIter { heap: self, cell }
    }

    #[must_use]
    pub fn arr_to_vec(&self, arr: Obj) -> Vec<Obj> {
        self.arr_iter(arr).collect()
    }

    /// Share cells between the original and the duplicate; both become
    /// copy-on-write.
    pub fn arr_dup_light(&mut self, arr: Obj) -> Obj {
        let Some(idx) = self.arr_idx(arr) else { return self.arr_new() };
        self.arrays[idx].cow = true;
        let data = self.arrays[idx];
        let new_idx = u32::try_from(self.arrays.len()).unwrap_or(u32::MAX);
        self.arrays.push(ArrayData { cow: true, ..data });
        self.alloc(ObjValue::Array(new_idx))
    }

    /// Copy every cell; element values are shared handles.
    pub fn arr_dup_deep(&mut self, arr: Obj) -> Obj {
        let items = self.arr_to_vec(arr);
        self.arr_from_vec(&items)
    }

    pub fn arr_extend(&mut self, dst: Obj, src: Obj) {
        for item in self.arr_to_vec(src) {
            self.arr_push(dst, item);
        }
    }

    #[must_use]
    pub fn arr_contains(&self, arr: Obj, needle: Obj) -> bool {
        self.arr_iter(arr).any(|v| self.obj_equal(v, needle))
    }

    #[must_use]
    pub fn first_cell(&self, arr: Obj) -> u32 {
        self.arr_idx(arr).map_or(CELL_NONE, |idx| self.arrays[idx].head)
    }

    #[must_use]
    pub fn cell_value(&self, cell: u32) -> Option<(Obj, u32)> {
        if cell == CELL_NONE {
            return None;
        }
        self.cells.get(cell as usize).map(|c| (c.val, c.next))
    }

    // ------------------------------------------------------------------
    // dicts

    pub fn dict_new(&mut self) -> Obj {
        let idx = u32::try_from(self.dicts.len()).unwrap_or(u32::MAX);
        self.dicts.push(DictData::Small(Vec::new()));
        self.alloc(ObjValue::Dict(idx))
    }

    fn dict_idx(&self, obj: Obj) -> Option<usize> {
        match self.get(obj) {
            ObjValue::Dict(idx) => Some(idx as usize),
            _ => None,
        }
    }

    pub fn dict_set(&mut self, dict: Obj, key: DictKey, val: Obj) {
        let Some(idx) = self.dict_idx(dict) else { return };
        match &mut self.dicts[idx] {
            DictData::Small(cells) => {
                if let Some(cell) = cells.iter_mut().find(|(k, _)| *k == key) {
                    cell.1 = val;
                    return;
                }
                cells.push((key, val));
                if cells.len() > DICT_PROMOTE_THRESHOLD {
                    let promoted: IndexMap<DictKey, Obj> = cells.drain(..).collect();
                    self.dicts[idx] = DictData::Big(promoted);
                }
            }
            DictData::Big(map) => {
                map.insert(key, val);
            }
        }
    }

    pub fn dict_set_str(&mut self, dict: Obj, key: Obj, val: Obj) {
        self.dict_set(dict, DictKey::Str(key), val);
    }

    #[must_use]
    pub fn dict_get(&self, dict: Obj, key: DictKey) -> Option<Obj> {
        let idx = self.dict_idx(dict)?;
        match &self.dicts[idx] {
            DictData::Small(cells) => cells.iter().find(|(k, _)| *k == key).map(|(_, v)| *v),
            DictData::Big(map) => map.get(&key).copied(),
        }
    }

    #[must_use]
    pub fn dict_get_str(&self, dict: Obj, key: Obj) -> Option<Obj> {
        self.dict_get(dict, DictKey::Str(key))
    }

    /// Lookup by byte content without having to intern a missing key.
    #[must_use]
    pub fn dict_get_bytes(&self, dict: Obj, key: &[u8]) -> Option<Obj> {
        let key = *self.intern.get(key)?;
        self.dict_get_str(dict, key)
    }

    #[must_use]
    pub fn dict_len(&self, dict: Obj) -> usize {
        self.dict_idx(dict).map_or(0, |idx| match &self.dicts[idx] {
            DictData::Small(cells) => cells.len(),
            DictData::Big(map) => map.len(),
        })
    }

    #[must_use]
    pub fn dict_iter(&self, dict: Obj) -> Box<dyn Iterator<Item = (DictKey, Obj)> + '_> {
        match self.dict_idx(dict) {
            Some(idx) => match &self.dicts[idx] {
                DictData::Small(cells) => Box::new(cells.iter().copied()),
                DictData::Big(map) => Box::new(map.iter().map(|(k, v)| (*k, *v))),
            },
            None => Box::new(std::iter::empty()),
        }
    }

    #[must_use]
    pub fn dict_entry(&self, dict: Obj, index: usize) -> Option<(DictKey, Obj)> {
        self.dict_iter(dict).nth(index)
    }

    pub fn dict_dup(&mut self, dict: Obj) -> Obj {
        let entries: Vec<(DictKey, Obj)> = self.dict_iter(dict).collect();
        let new = self.dict_new();
        for (k, v) in entries {
            self.dict_set(new, k, v);
        }
        new
    }

    // ------------------------------------------------------------------
    // typed records

    pub fn make_compiler(&mut self, rec: CompilerRecord) -> Obj {
        let idx = u32::try_from(self.compilers.len()).unwrap_or(u32::MAX);
        self.compilers.push(rec);
        self.alloc(ObjValue::Compiler(idx))
    }

    pub fn make_build_target(&mut self, rec: BuildTargetRecord) -> Obj {
        let idx = u32::try_from(self.build_targets.len()).unwrap_or(u32::MAX);
        self.build_targets.push(rec);
        self.alloc(ObjValue::BuildTarget(idx))
    }

    pub fn make_custom_target(&mut self, rec: CustomTargetRecord) -> Obj {
        let idx = u32::try_from(self.custom_targets.len()).unwrap_or(u32::MAX);
        self.custom_targets.push(rec);
        self.alloc(ObjValue::CustomTarget(idx))
    }

    pub fn make_dependency(&mut self, rec: DependencyRecord) -> Obj {
        let idx = u32::try_from(self.dependencies.len()).unwrap_or(u32::MAX);
        self.dependencies.push(rec);
        self.alloc(ObjValue::Dependency(idx))
    }

    pub fn make_external_program(&mut self, rec: ExternalProgramRecord) -> Obj {
        let idx = u32::try_from(self.external_programs.len()).unwrap_or(u32::MAX);
        self.external_programs.push(rec);
        self.alloc(ObjValue::ExternalProgram(idx))
    }

    pub fn make_run_result(&mut self, rec: RunResultRecord) -> Obj {
        let idx = u32::try_from(self.run_results.len()).unwrap_or(u32::MAX);
        self.run_results.push(rec);
        self.alloc(ObjValue::RunResult(idx))
    }

    pub fn make_configuration_data(&mut self, rec: ConfigurationDataRecord) -> Obj {
        let idx = u32::try_from(self.configuration_datas.len()).unwrap_or(u32::MAX);
        self.configuration_datas.push(rec);
        self.alloc(ObjValue::ConfigurationData(idx))
    }

    pub fn make_test(&mut self, rec: TestRecord) -> Obj {
        let idx = u32::try_from(self.tests.len()).unwrap_or(u32::MAX);
        self.tests.push(rec);
        self.alloc(ObjValue::Test(idx))
    }

    pub fn make_module(&mut self, rec: ModuleRecord) -> Obj {
        let idx = u32::try_from(self.modules.len()).unwrap_or(u32::MAX);
        self.modules.push(rec);
        self.alloc(ObjValue::Module(idx))
    }

    pub fn make_install_target(&mut self, rec: InstallTargetRecord) -> Obj {
        let idx = u32::try_from(self.install_targets.len()).unwrap_or(u32::MAX);
        self.install_targets.push(rec);
        self.alloc(ObjValue::InstallTarget(idx))
    }

    pub fn make_environment(&mut self, rec: EnvironmentRecord) -> Obj {
        let idx = u32::try_from(self.environments.len()).unwrap_or(u32::MAX);
        self.environments.push(rec);
        self.alloc(ObjValue::Environment(idx))
    }

    pub fn make_include_directory(&mut self, rec: IncludeDirectoryRecord) -> Obj {
        let idx = u32::try_from(self.include_directories.len()).unwrap_or(u32::MAX);
        self.include_directories.push(rec);
        self.alloc(ObjValue::IncludeDirectory(idx))
    }

    pub fn make_build_option(&mut self, opt_idx: u32) -> Obj {
        self.alloc(ObjValue::BuildOption(opt_idx))
    }

    pub fn make_generator(&mut self, rec: GeneratorRecord) -> Obj {
        let idx = u32::try_from(self.generators.len()).unwrap_or(u32::MAX);
        self.generators.push(rec);
        self.alloc(ObjValue::Generator(idx))
    }

    pub fn make_generated_list(&mut self, rec: GeneratedListRecord) -> Obj {
        let idx = u32::try_from(self.generated_lists.len()).unwrap_or(u32::MAX);
        self.generated_lists.push(rec);
        self.alloc(ObjValue::GeneratedList(idx))
    }

    pub fn make_alias_target(&mut self, rec: AliasTargetRecord) -> Obj {
        let idx = u32::try_from(self.alias_targets.len()).unwrap_or(u32::MAX);
        self.alias_targets.push(rec);
        self.alloc(ObjValue::AliasTarget(idx))
    }

    pub fn make_both_libs(&mut self, rec: BothLibsRecord) -> Obj {
        let idx = u32::try_from(self.both_libs.len()).unwrap_or(u32::MAX);
        self.both_libs.push(rec);
        self.alloc(ObjValue::BothLibs(idx))
    }

    pub fn make_source_set(&mut self, rec: SourceSetRecord) -> Obj {
        let idx = u32::try_from(self.source_sets.len()).unwrap_or(u32::MAX);
        self.source_sets.push(rec);
        self.alloc(ObjValue::SourceSet(idx))
    }

    pub fn make_source_configuration(&mut self, rec: SourceConfigurationRecord) -> Obj {
        let idx = u32::try_from(self.source_configurations.len()).unwrap_or(u32::MAX);
        self.source_configurations.push(rec);
        self.alloc(ObjValue::SourceConfiguration(idx))
    }

    pub fn make_iterator(&mut self, state: IterState) -> Obj {
        let idx = u32::try_from(self.iterators.len()).unwrap_or(u32::MAX);
        self.iterators.push(state);
        self.alloc(ObjValue::Iterator(idx))
    }

    #[must_use]
    pub fn iterator(&self, obj: Obj) -> Option<&IterState> {
        match self.get(obj) {
            ObjValue::Iterator(idx) => self.iterators.get(idx as usize),
            _ => None,
        }
    }

    pub fn iterator_mut(&mut self, obj: Obj) -> Option<&mut IterState> {
        match self.get(obj) {
            ObjValue::Iterator(idx) => self.iterators.get_mut(idx as usize),
            _ => None,
        }
    }

    pub fn make_func(&mut self, def: FuncDef) -> Obj {
        let idx = u32::try_from(self.funcs.len()).unwrap_or(u32::MAX);
        self.funcs.push(def);
        self.alloc(ObjValue::Func(idx))
    }

    pub fn make_capture(&mut self, rec: CaptureRecord) -> Obj {
        let idx = u32::try_from(self.captures.len()).unwrap_or(u32::MAX);
        self.captures.push(rec);
        self.alloc(ObjValue::Capture(idx))
    }

    // Record accessors keep call sites terse; a stale handle falls back to
    // index 0 rather than panicking, matching the null-object convention.

    #[must_use]
    pub fn record_idx(&self, obj: Obj) -> usize {
        match self.get(obj) {
            ObjValue::Compiler(i)
            | ObjValue::BuildTarget(i)
            | ObjValue::CustomTarget(i)
            | ObjValue::Dependency(i)
            | ObjValue::ExternalProgram(i)
            | ObjValue::RunResult(i)
            | ObjValue::ConfigurationData(i)
            | ObjValue::Test(i)
            | ObjValue::Module(i)
            | ObjValue::InstallTarget(i)
            | ObjValue::Environment(i)
            | ObjValue::IncludeDirectory(i)
            | ObjValue::BuildOption(i)
            | ObjValue::Generator(i)
            | ObjValue::GeneratedList(i)
            | ObjValue::AliasTarget(i)
            | ObjValue::BothLibs(i)
            | ObjValue::SourceSet(i)
            | ObjValue::SourceConfiguration(i)
            | ObjValue::Func(i)
            | ObjValue::Capture(i) => i as usize,
            _ => 0,
        }
    }

    // ------------------------------------------------------------------
    // equality and display

    /// Deep equality. Handle equality covers singletons and interned
    /// strings; aggregates compare structurally.
    #[must_use]
    pub fn obj_equal(&self, a: Obj, b: Obj) -> bool {
        if a == b {
            return true;
        }
        match (self.get(a), self.get(b)) {
            (ObjValue::Number(x), ObjValue::Number(y)) => x == y,
            (ObjValue::Array(_), ObjValue::Array(_)) => {
                self.arr_len(a) == self.arr_len(b)
                    && self.arr_iter(a).zip(self.arr_iter(b)).all(|(x, y)| self.obj_equal(x, y))
            }
            (ObjValue::Dict(_), ObjValue::Dict(_)) => {
                self.dict_len(a) == self.dict_len(b)
                    && self
                        .dict_iter(a)
                        .all(|(k, v)| self.dict_get(b, k).is_some_and(|w| self.obj_equal(v, w)))
            }
            (ObjValue::File(_), ObjValue::File(_)) => self.file_path(a) == self.file_path(b),
            (ObjValue::FeatureOpt(x), ObjValue::FeatureOpt(y)) => x == y,
            (ObjValue::Machine(x), ObjValue::Machine(y)) => x == y,
            _ => false,
        }
    }

    /// Render a value the way `message()` prints it.
    #[must_use]
    pub fn obj_display(&self, obj: Obj) -> String {
        match self.get(obj) {
            ObjValue::Null => "(null)".into(),
            ObjValue::Disabler => "disabler()".into(),
            ObjValue::Bool(b) => if b { "true" } else { "false" }.into(),
            ObjValue::Number(n) => n.to_string(),
            ObjValue::Str(_) => self.str_display(obj),
            ObjValue::File(_) => self.file_path(obj).map(ToString::to_string).unwrap_or_default(),
            ObjValue::FeatureOpt(f) => f.as_str().into(),
            ObjValue::Machine(m) => m.as_str().into(),
            ObjValue::Array(_) => {
                let parts: Vec<String> =
                    self.arr_iter(obj).map(|v| self.obj_display_quoted(v)).collect();
                format!("[{}]", parts.join(", "))
            }
            ObjValue::Dict(_) => {
                let parts: Vec<String> = self
                    .dict_iter(obj)
                    .map(|(k, v)| {
                        let key = match k {
                            DictKey::Str(s) => format!("'{}'", self.str_utf8(s)),
                            DictKey::Int(n) => n.to_string(),
                        };
                        format!("{key}: {}", self.obj_display_quoted(v))
                    })
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            other => format!("<{}>", other.typ().name()),
        }
    }

    fn obj_display_quoted(&self, obj: Obj) -> String {
        if self.typ(obj) == ObjType::Str {
            format!("'{}'", self.str_utf8(obj))
        } else {
            self.obj_display(obj)
        }
    }

    // ------------------------------------------------------------------
    // phase marks

    /// Snapshot the current arena sizes. Taken between evaluation and
    /// backend emission so backend temporaries can be discarded.
    #[must_use]
    pub fn mark(&self) -> HeapMark {
        HeapMark {
            objs: self.objs.len(),
            strs: self.strs.len(),
            cells: self.cells.len(),
            arrays: self.arrays.len(),
            dicts: self.dicts.len(),
            files: self.files.len(),
        }
    }

    /// Discard everything allocated after `mark`. The caller guarantees no
    /// surviving value references a discarded handle.
    pub fn reset_to_mark(&mut self, mark: HeapMark) {
        self.objs.truncate(mark.objs);
        self.strs.truncate(mark.strs);
        self.cells.truncate(mark.cells);
        self.arrays.truncate(mark.arrays);
        self.dicts.truncate(mark.dicts);
        self.files.truncate(mark.files);
        let limit = u32::try_from(mark.objs).unwrap_or(u32::MAX);
        self.intern.retain(|_, v| v.0 < limit);
    }
}

pub struct ArrIter<'heap> {
    heap: &'heap Heap,
    cell: u32,
}

impl Iterator for ArrIter<'_> {
    type Item = Obj;

    fn next(&mut self) -> Option<Obj> {
        let (val, next) = self.heap.cell_value(self.cell)?;
        self.cell = next;
        Some(val)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn singletons_have_fixed_handles() {
        let heap = Heap::new();
        assert_eq!(heap.typ(Obj::NULL), ObjType::Null);
        assert_eq!(heap.typ(Obj::DISABLER), ObjType::Disabler);
        assert_eq!(heap.bool_value(Obj::TRUE), Some(true));
        assert_eq!(heap.bool_value(Obj::FALSE), Some(false));
    }

    #[rstest]
    fn interned_strings_share_handles() {
        let mut heap = Heap::new();
        let a = heap.str_intern(b"hello");
        let b = heap.str_intern(b"hello");
        let c = heap.str_intern(b"world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.str_bytes(a), b"hello");
    }

    #[rstest]
    fn array_push_preserves_existing_handles() {
        let mut heap = Heap::new();
        let arr = heap.arr_new();
        let one = heap.make_number(1);
        heap.arr_push(arr, one);
        let before: Vec<Obj> = heap.arr_to_vec(arr);
        let two = heap.make_number(2);
        heap.arr_push(arr, two);
        assert_eq!(heap.arr_len(arr), 2);
        assert_eq!(heap.arr_get(arr, 0), Some(before[0]));
    }

    #[rstest]
    fn light_dup_shares_until_push() {
        let mut heap = Heap::new();
        let arr = heap.arr_new();
        let one = heap.make_number(1);
        heap.arr_push(arr, one);
        let dup = heap.arr_dup_light(arr);
        assert_eq!(heap.arr_len(dup), 1);

        let two = heap.make_number(2);
        heap.arr_push(arr, two);
        // The duplicate must not observe the push.
        assert_eq!(heap.arr_len(dup), 1);
        assert_eq!(heap.arr_len(arr), 2);
    }

    #[rstest]
    fn dict_promotes_past_threshold_and_keeps_entries() {
        let mut heap = Heap::new();
        let d = heap.dict_new();
        let mut keys = Vec::new();
        for i in 0..40_i64 {
            let k = heap.str_intern(format!("key{i}").as_bytes());
            let v = heap.make_number(i);
            heap.dict_set_str(d, k, v);
            keys.push((k, i));
        }
        assert_eq!(heap.dict_len(d), 40);
        for (k, i) in keys {
            let v = heap.dict_get_str(d, k).expect("entry");
            assert_eq!(heap.number(v), Some(i));
        }
    }

    #[rstest]
    fn dict_accepts_integer_keys() {
        let mut heap = Heap::new();
        let d = heap.dict_new();
        let v = heap.str_intern(b"x");
        heap.dict_set(d, DictKey::Int(7), v);
        assert_eq!(heap.dict_get(d, DictKey::Int(7)), Some(v));
        assert_eq!(heap.dict_get(d, DictKey::Int(8)), None);
    }

    #[rstest]
    fn deep_equality_descends_into_aggregates() {
        let mut heap = Heap::new();
        let a = heap.arr_new();
        let b = heap.arr_new();
        let one_a = heap.make_number(1);
        let one_b = heap.make_number(1);
        heap.arr_push(a, one_a);
        heap.arr_push(b, one_b);
        assert!(heap.obj_equal(a, b));
        let two = heap.make_number(2);
        heap.arr_push(b, two);
        assert!(!heap.obj_equal(a, b));
    }

    #[rstest]
    fn reset_to_mark_discards_scratch_strings() {
        let mut heap = Heap::new();
        let keep = heap.str_intern(b"keep");
        let mark = heap.mark();
        let _scratch = heap.str_intern(b"scratch");
        heap.reset_to_mark(mark);
        // The kept string still resolves and re-interning scratch yields a
        // fresh handle rather than a dangling one.
        assert_eq!(heap.str_bytes(keep), b"keep");
        let again = heap.str_intern(b"scratch");
        assert_eq!(heap.str_bytes(again), b"scratch");
    }

    #[rstest]
    fn display_formats_nested_values() {
        let mut heap = Heap::new();
        let arr = heap.arr_new();
        let s = heap.str_intern(b"a");
        let n = heap.make_number(2);
        heap.arr_push(arr, s);
        heap.arr_push(arr, n);
        assert_eq!(heap.obj_display(arr), "['a', 2]");
    }
}

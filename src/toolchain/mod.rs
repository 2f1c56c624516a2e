//! Toolchain registry and argument generators.
//!
//! Each toolchain family registers a detection matcher, the executables it
//! usually ships as, and a table of argument-producing functions indexed by
//! well-known name. Call sites invoke generators by name; a per-compiler
//! `overrides` dict can replace any generator with a constant argv or a
//! user capture evaluated at call time.

pub mod cache;
pub mod detect;

use crate::lang::object::{CompilerKind, LinkerKind};

/// Languages the toolchain layer exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    C,
    Cpp,
}

impl Language {
    pub const ALL: [Self; 2] = [Self::C, Self::Cpp];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::C => "c",
            Self::Cpp => "cpp",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "c" => Some(Self::C),
            "cpp" | "c++" => Some(Self::Cpp),
            _ => None,
        }
    }

    /// Environment variable naming the compiler for this language.
    #[must_use]
    pub const fn env_var(self) -> &'static str {
        match self {
            Self::C => "CC",
            Self::Cpp => "CXX",
        }
    }

    #[must_use]
    pub fn owns_extension(self, ext: &str) -> bool {
        match self {
            Self::C => ext == "c",
            Self::Cpp => matches!(ext, "cpp" | "cc" | "cxx" | "c++" | "C"),
        }
    }
}

/// How a toolchain wants its linker selected.
#[derive(Debug, Clone, Copy)]
pub enum LinkerSelection {
    /// Drive linking through the compiler itself.
    Passthrough,
    /// Probe these executables as a separate component.
    Separate(&'static [&'static str]),
}

/// A registered toolchain family, ordered by registration.
pub struct ToolchainSpec {
    pub kind: CompilerKind,
    /// Argument used to coax a version banner out of a candidate.
    pub version_arg: &'static str,
    /// Score the combined stdout+stderr of a version probe; higher wins.
    pub matcher: fn(&str) -> Option<u32>,
    pub exe_candidates: fn(Language) -> &'static [&'static str],
    pub linker: fn() -> LinkerSelection,
    pub linker_kind: LinkerKind,
}

fn match_gcc(output: &str) -> Option<u32> {
    if output.contains("Free Software Foundation") || output.contains("gcc version") {
        Some(2)
    } else {
        None
    }
}

fn match_clang(output: &str) -> Option<u32> {
    if output.contains("clang version") { Some(2) } else { None }
}

fn match_apple_clang(output: &str) -> Option<u32> {
    if output.contains("Apple clang version") { Some(3) } else { None }
}

fn match_posix(_output: &str) -> Option<u32> {
    // Fallback entry; anything that ran at all scores the minimum.
    Some(1)
}

fn gcc_exes(lang: Language) -> &'static [&'static str] {
    match lang {
        Language::C => &["gcc"],
        Language::Cpp => &["g++"],
    }
}

fn clang_exes(lang: Language) -> &'static [&'static str] {
    match lang {
        Language::C => &["clang"],
        Language::Cpp => &["clang++"],
    }
}

fn posix_exes(lang: Language) -> &'static [&'static str] {
    match lang {
        Language::C => &["cc"],
        Language::Cpp => &["c++"],
    }
}

fn passthrough() -> LinkerSelection {
    LinkerSelection::Passthrough
}

/// The ordered compiler registry. Earlier entries win score ties.
#[must_use]
pub fn compiler_registry() -> Vec<ToolchainSpec> {
    vec![
        ToolchainSpec {
            kind: CompilerKind::AppleClang,
            version_arg: "--version",
            matcher: match_apple_clang,
            exe_candidates: clang_exes,
            linker: passthrough,
            linker_kind: LinkerKind::Apple,
        },
        ToolchainSpec {
            kind: CompilerKind::Clang,
            version_arg: "--version",
            matcher: match_clang,
            exe_candidates: clang_exes,
            linker: passthrough,
            linker_kind: LinkerKind::Gcc,
        },
        ToolchainSpec {
            kind: CompilerKind::Gcc,
            version_arg: "--version",
            matcher: match_gcc,
            exe_candidates: gcc_exes,
            linker: passthrough,
            linker_kind: LinkerKind::Gcc,
        },
        ToolchainSpec {
            kind: CompilerKind::Posix,
            version_arg: "--version",
            matcher: match_posix,
            exe_candidates: posix_exes,
            linker: passthrough,
            linker_kind: LinkerKind::Posix,
        },
    ]
}

/// Archiver executables probed for static libraries.
pub const ARCHIVER_CANDIDATES: &[&str] = &["ar", "llvm-ar"];

/// Hard-coded library search fallback when `-print-search-dirs` yields
/// nothing usable.
pub const DEFAULT_LIBDIRS: &[&str] = &["/usr/local/lib", "/usr/lib", "/lib"];

// ----------------------------------------------------------------------
// argument generators

/// Typed arguments accepted by a generator. The arity set is closed.
#[derive(Debug, Clone, Copy)]
pub enum GenArgs<'a> {
    None,
    I(i64),
    S(&'a str),
    Ss(&'a str, &'a str),
    Sb(&'a str, bool),
    Many(&'a [String]),
}

/// What a generator produces: an argv slice or a capability answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenOutput {
    Args(Vec<String>),
    Flag(bool),
}

/// One entry in a toolchain's generator table.
#[derive(Debug, Clone, Copy)]
pub enum ArgGen {
    A0(fn() -> Vec<String>),
    A1i(fn(i64) -> Vec<String>),
    A1s(fn(&str) -> Vec<String>),
    A2s(fn(&str, &str) -> Vec<String>),
    A1s1b(fn(&str, bool) -> Vec<String>),
    Ns(fn(&[String]) -> Vec<String>),
    B0(fn() -> bool),
    B1s(fn(&str) -> bool),
}

impl ArgGen {
    /// Invoke with arity checking; a mismatch is a caller bug surfaced as
    /// `None`.
    #[must_use]
    pub fn invoke(self, args: &GenArgs<'_>) -> Option<GenOutput> {
        match (self, args) {
            (Self::A0(f), GenArgs::None) => Some(GenOutput::Args(f())),
            (Self::A1i(f), GenArgs::I(i)) => Some(GenOutput::Args(f(*i))),
            (Self::A1s(f), GenArgs::S(s)) => Some(GenOutput::Args(f(s))),
            (Self::A2s(f), GenArgs::Ss(a, b)) => Some(GenOutput::Args(f(a, b))),
            (Self::A1s1b(f), GenArgs::Sb(s, b)) => Some(GenOutput::Args(f(s, *b))),
            (Self::Ns(f), GenArgs::Many(items)) => Some(GenOutput::Args(f(items))),
            (Self::B0(f), GenArgs::None) => Some(GenOutput::Flag(f())),
            (Self::B1s(f), GenArgs::S(s)) => Some(GenOutput::Flag(f(s))),
            _ => None,
        }
    }
}

fn one(s: impl Into<String>) -> Vec<String> {
    vec![s.into()]
}

// gcc/clang-family generators.

fn cc_compile_only() -> Vec<String> {
    one("-c")
}

fn cc_output(path: &str) -> Vec<String> {
    vec!["-o".into(), path.into()]
}

fn cc_include(dir: &str) -> Vec<String> {
    one(format!("-I{dir}"))
}

fn cc_include_system(dir: &str) -> Vec<String> {
    vec!["-isystem".into(), dir.into()]
}

fn cc_define(name: &str, value: &str) -> Vec<String> {
    if value.is_empty() { one(format!("-D{name}")) } else { one(format!("-D{name}={value}")) }
}

fn cc_set_std(std: &str) -> Vec<String> {
    one(format!("-std={std}"))
}

fn cc_pic() -> Vec<String> {
    one("-fPIC")
}

fn cc_debug() -> Vec<String> {
    one("-g")
}

fn cc_optimization(lvl: &str) -> Vec<String> {
    match lvl {
        "plain" | "0" => Vec::new(),
        "g" => one("-Og"),
        other => one(format!("-O{other}")),
    }
}

fn cc_warning_lvl(lvl: &str) -> Vec<String> {
    match lvl {
        "0" => Vec::new(),
        "1" => one("-Wall"),
        "2" => vec!["-Wall".into(), "-Wextra".into()],
        "3" => vec!["-Wall".into(), "-Wextra".into(), "-Wpedantic".into()],
        _ => vec!["-Wall".into(), "-Wextra".into(), "-Wpedantic".into(), "-Weverything".into()],
    }
}

fn cc_werror() -> Vec<String> {
    one("-Werror")
}

/// `-MD -MQ target -MF depfile`: emit a depfile while compiling.
fn cc_deps(target: &str, depfile: &str) -> Vec<String> {
    vec!["-MD".into(), "-MQ".into(), target.into(), "-MF".into(), depfile.into()]
}

fn cc_shared() -> Vec<String> {
    one("-shared")
}

fn cc_link_lib(name: &str) -> Vec<String> {
    one(format!("-l{name}"))
}

fn cc_lib_dir(dir: &str) -> Vec<String> {
    one(format!("-L{dir}"))
}

fn cc_rpath(dir: &str) -> Vec<String> {
    one(format!("-Wl,-rpath,{dir}"))
}

fn cc_linker_passthrough(args: &[String]) -> Vec<String> {
    args.iter().map(|a| format!("-Wl,{a}")).collect()
}

fn cc_dumpmachine() -> Vec<String> {
    one("-dumpmachine")
}

fn cc_print_search_dirs() -> Vec<String> {
    one("-print-search-dirs")
}

fn cc_can_compile_llvm_ir_no() -> bool {
    false
}

fn clang_can_compile_llvm_ir() -> bool {
    true
}

fn cc_always_true(_s: &str) -> bool {
    true
}

fn posix_compile_only() -> Vec<String> {
    one("-c")
}

fn posix_optimization(_lvl: &str) -> Vec<String> {
    one("-O")
}

fn posix_nothing() -> Vec<String> {
    Vec::new()
}

fn posix_nothing_s(_s: &str) -> Vec<String> {
    Vec::new()
}

type GenEntry = (&'static str, ArgGen);

/// The gcc/clang shared core.
const CC_TABLE: &[GenEntry] = &[
    ("compile_only", ArgGen::A0(cc_compile_only)),
    ("output", ArgGen::A1s(cc_output)),
    ("include", ArgGen::A1s(cc_include)),
    ("include_system", ArgGen::A1s(cc_include_system)),
    ("define", ArgGen::A2s(cc_define)),
    ("set_std", ArgGen::A1s(cc_set_std)),
    ("pic", ArgGen::A0(cc_pic)),
    ("debug", ArgGen::A0(cc_debug)),
    ("optimization", ArgGen::A1s(cc_optimization)),
    ("warning_lvl", ArgGen::A1s(cc_warning_lvl)),
    ("werror", ArgGen::A0(cc_werror)),
    ("deps", ArgGen::A2s(cc_deps)),
    ("shared", ArgGen::A0(cc_shared)),
    ("link_lib", ArgGen::A1s(cc_link_lib)),
    ("lib_dir", ArgGen::A1s(cc_lib_dir)),
    ("rpath", ArgGen::A1s(cc_rpath)),
    ("linker_passthrough", ArgGen::Ns(cc_linker_passthrough)),
    ("dumpmachine", ArgGen::A0(cc_dumpmachine)),
    ("print_search_dirs", ArgGen::A0(cc_print_search_dirs)),
    ("can_compile_llvm_ir", ArgGen::B0(cc_can_compile_llvm_ir_no)),
    ("accepts_argument", ArgGen::B1s(cc_always_true)),
];

const CLANG_OVERLAY: &[GenEntry] = &[("can_compile_llvm_ir", ArgGen::B0(clang_can_compile_llvm_ir))];

/// A deliberately thin POSIX `cc` fallback.
const POSIX_TABLE: &[GenEntry] = &[
    ("compile_only", ArgGen::A0(posix_compile_only)),
    ("output", ArgGen::A1s(cc_output)),
    ("include", ArgGen::A1s(cc_include)),
    ("define", ArgGen::A2s(cc_define)),
    ("optimization", ArgGen::A1s(posix_optimization)),
    ("debug", ArgGen::A0(posix_nothing)),
    ("warning_lvl", ArgGen::A1s(posix_nothing_s)),
    ("link_lib", ArgGen::A1s(cc_link_lib)),
    ("lib_dir", ArgGen::A1s(cc_lib_dir)),
    ("can_compile_llvm_ir", ArgGen::B0(cc_can_compile_llvm_ir_no)),
];

/// Look up a generator for a toolchain family by well-known name. Overlay
/// tables shadow the shared core.
#[must_use]
pub fn lookup_generator(kind: CompilerKind, name: &str) -> Option<ArgGen> {
    let (overlay, base): (&[GenEntry], &[GenEntry]) = match kind {
        CompilerKind::Clang | CompilerKind::AppleClang => (CLANG_OVERLAY, CC_TABLE),
        CompilerKind::Gcc => (&[], CC_TABLE),
        CompilerKind::Posix | CompilerKind::Nasm => (&[], POSIX_TABLE),
    };
    overlay
        .iter()
        .chain(base.iter())
        .find(|(n, _)| *n == name)
        .map(|(_, generator)| *generator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn gcc_include_produces_joined_flag() {
        let generator = lookup_generator(CompilerKind::Gcc, "include").expect("generator");
        let out = generator.invoke(&GenArgs::S("/usr/include")).expect("arity");
        assert_eq!(out, GenOutput::Args(vec!["-I/usr/include".into()]));
    }

    #[rstest]
    fn clang_overlay_shadows_capability() {
        let generator =
            lookup_generator(CompilerKind::Clang, "can_compile_llvm_ir").expect("generator");
        assert_eq!(generator.invoke(&GenArgs::None), Some(GenOutput::Flag(true)));
        let generator =
            lookup_generator(CompilerKind::Gcc, "can_compile_llvm_ir").expect("generator");
        assert_eq!(generator.invoke(&GenArgs::None), Some(GenOutput::Flag(false)));
    }

    #[rstest]
    fn arity_mismatch_is_refused() {
        let generator = lookup_generator(CompilerKind::Gcc, "include").expect("generator");
        assert_eq!(generator.invoke(&GenArgs::None), None);
    }

    #[rstest]
    fn posix_table_lacks_gnu_extensions() {
        assert!(lookup_generator(CompilerKind::Posix, "deps").is_none());
        assert!(lookup_generator(CompilerKind::Posix, "compile_only").is_some());
    }

    #[rstest]
    fn deps_generator_names_target_and_depfile() {
        let generator = lookup_generator(CompilerKind::Gcc, "deps").expect("generator");
        let out = generator.invoke(&GenArgs::Ss("a.o", "a.o.d")).expect("arity");
        let GenOutput::Args(args) = out else { panic!("expected args") };
        assert_eq!(args, ["-MD", "-MQ", "a.o", "-MF", "a.o.d"]);
    }

    #[rstest]
    fn registry_orders_specific_before_generic() {
        let reg = compiler_registry();
        let kinds: Vec<_> = reg.iter().map(|s| s.kind).collect();
        let apple = kinds.iter().position(|k| *k == crate::lang::object::CompilerKind::AppleClang);
        let posix = kinds.iter().position(|k| *k == crate::lang::object::CompilerKind::Posix);
        assert!(apple < posix);
    }
}

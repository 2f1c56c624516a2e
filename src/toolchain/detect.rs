//! Configure-time compiler detection.
//!
//! For a requested `(machine, language)` the detector gathers candidate
//! executables, probes each once per distinct version argument, and lets
//! every registered toolchain score the combined output. The best-scoring
//! pair wins; a POSIX fallback catches compilers with unrecognizable
//! banners. All probes run through the compiler-check cache, so repeated
//! setup runs spawn nothing.

use camino::Utf8PathBuf;
use thiserror::Error;
use tracing::debug;

use crate::guess::guess_version;
use crate::lang::natives::CallArgs;
use crate::lang::object::{CompilerKind, CompilerRecord, Obj, ObjType};
use crate::machines::MachineKind;
use crate::toolchain::{
    ARCHIVER_CANDIDATES, DEFAULT_LIBDIRS, GenArgs, GenOutput, Language, LinkerSelection,
    ToolchainSpec, compiler_registry, lookup_generator,
};
use crate::workspace::Workspace;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("no usable {lang} compiler found (tried {tried:?})")]
    NoCompiler { lang: &'static str, tried: Vec<String> },
}

struct Selection {
    kind: CompilerKind,
    linker: LinkerSelection,
    linker_kind: crate::lang::object::LinkerKind,
    cmd: Vec<String>,
    banner: String,
}

impl Workspace {
    /// The detected compiler for `(machine, lang)`, detecting and caching
    /// on first use.
    pub fn compiler_for(
        &mut self,
        machine: MachineKind,
        lang: Language,
    ) -> Result<Obj, DetectError> {
        if let Some(project) = self.projects.last()
            && let Some(found) = project.compilers.get(&(machine, lang))
        {
            return Ok(*found);
        }
        let compiler = detect_compiler(self, machine, lang)?;
        if let Some(project) = self.projects.last_mut() {
            project.compilers.insert((machine, lang), compiler);
        }
        Ok(compiler)
    }

    /// Invoke an argument generator by well-known name, honoring the
    /// compiler's override dict. An override value may be a constant
    /// array/string or a capture evaluated here.
    pub fn compiler_args(&mut self, comp: Obj, name: &str, args: &GenArgs<'_>) -> Option<GenOutput> {
        let idx = self.heap.record_idx(comp);
        let rec = self.heap.compilers.get(idx)?;
        let overrides = rec.overrides;
        let kind = rec.kind;

        if let Some(value) = self.heap.dict_get_bytes(overrides, name.as_bytes()) {
            return self.eval_override(value, args);
        }
        lookup_generator(kind, name)?.invoke(args)
    }

    fn eval_override(&mut self, value: Obj, args: &GenArgs<'_>) -> Option<GenOutput> {
        match self.heap.typ(value) {
            ObjType::Capture => {
                let mut call_args = CallArgs::default();
                if let GenArgs::S(s) = args {
                    let obj = self.heap.str_intern(s.as_bytes());
                    call_args.positional.push(crate::lang::natives::ArgVal { obj, ip: 0 });
                }
                let result = self.call_capture(value, call_args).ok()?;
                Some(GenOutput::Args(self.obj_to_argv(result)))
            }
            ObjType::Bool => Some(GenOutput::Flag(value == Obj::TRUE)),
            _ => Some(GenOutput::Args(self.obj_to_argv(value))),
        }
    }

    /// Flatten a string or array-of-strings into an argv.
    #[must_use]
    pub fn obj_to_argv(&self, obj: Obj) -> Vec<String> {
        match self.heap.typ(obj) {
            ObjType::Str => vec![self.heap.str_display(obj)],
            ObjType::Array => self
                .heap
                .arr_to_vec(obj)
                .iter()
                .map(|o| self.heap.str_display(*o))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Run the full detection algorithm and allocate the compiler record.
pub fn detect_compiler(
    wk: &mut Workspace,
    machine: MachineKind,
    lang: Language,
) -> Result<Obj, DetectError> {
    let registry = compiler_registry();
    let candidates = gather_candidates(wk, lang, &registry);
    let selection = select(wk, &registry, &candidates).ok_or_else(|| DetectError::NoCompiler {
        lang: lang.as_str(),
        tried: candidates.iter().map(|c| c.join(" ")).collect(),
    })?;

    let version = guess_version(&selection.banner).unwrap_or("unknown").to_owned();
    debug!(compiler = ?selection.cmd, kind = ?selection.kind, %version, "selected compiler");

    let linker_cmd = match selection.linker {
        LinkerSelection::Passthrough => selection.cmd.clone(),
        LinkerSelection::Separate(exes) => probe_first(wk, exes, &selection.cmd),
    };
    let archiver_cmd = probe_first(wk, ARCHIVER_CANDIDATES, &selection.cmd);

    let triple = query_triple(wk, &selection);
    if let Some(triple) = &triple {
        wk.machine_mut(machine).refine_from_triple(triple);
    }
    let libdirs = query_libdirs(wk, &selection);

    let lang_obj = wk.stri(lang.as_str());
    let cmd_objs: Vec<Obj> = selection.cmd.iter().map(|c| wk.heap.str_intern(c.as_bytes())).collect();
    let cmd_array = wk.heap.arr_from_vec(&cmd_objs);
    let version_obj = wk.stri(&version);
    let triple_obj = triple.map_or(Obj::NULL, |t| wk.stri(&t));
    let libdir_objs: Vec<Obj> = libdirs.iter().map(|d| wk.heap.str_intern(d.as_str().as_bytes())).collect();
    let libdirs_arr = wk.heap.arr_from_vec(&libdir_objs);
    let linker_objs: Vec<Obj> = linker_cmd.iter().map(|c| wk.heap.str_intern(c.as_bytes())).collect();
    let linker_arr = wk.heap.arr_from_vec(&linker_objs);
    let archiver_objs: Vec<Obj> =
        archiver_cmd.iter().map(|c| wk.heap.str_intern(c.as_bytes())).collect();
    let archiver_arr = wk.heap.arr_from_vec(&archiver_objs);
    let overrides = wk.heap.dict_new();

    Ok(wk.heap.make_compiler(CompilerRecord {
        lang: lang_obj,
        machine,
        kind: selection.kind,
        cmd_array,
        version: version_obj,
        triple: triple_obj,
        libdirs: libdirs_arr,
        linker_kind: selection.linker_kind,
        linker_cmd: linker_arr,
        archiver_cmd: archiver_arr,
        overrides,
    }))
}

/// An explicit `env.CC`-style option is the sole candidate; otherwise all
/// registered executables for the language, deduplicated in order.
fn gather_candidates(
    wk: &mut Workspace,
    lang: Language,
    registry: &[ToolchainSpec],
) -> Vec<Vec<String>> {
    let option = format!("env.{}", lang.env_var());
    if let Some(value) = wk.options.value(&option) {
        let argv = wk.obj_to_argv(value);
        if !argv.is_empty() {
            return vec![argv];
        }
    }
    let mut out: Vec<Vec<String>> = Vec::new();
    for spec in registry {
        for exe in (spec.exe_candidates)(lang) {
            let argv = vec![(*exe).to_owned()];
            if !out.contains(&argv) {
                out.push(argv);
            }
        }
    }
    out
}

/// Partition toolchains by version argument, probe once per (candidate,
/// version arg), and score. Registration order breaks ties.
fn select(
    wk: &mut Workspace,
    registry: &[ToolchainSpec],
    candidates: &[Vec<String>],
) -> Option<Selection> {
    let mut version_args: Vec<&'static str> = Vec::new();
    for spec in registry {
        if !version_args.contains(&spec.version_arg) {
            version_args.push(spec.version_arg);
        }
    }

    let mut best: Option<(u32, Selection)> = None;
    for version_arg in version_args {
        for candidate in candidates {
            let mut argv = candidate.clone();
            argv.push(version_arg.to_owned());
            let Ok(record) = wk.check_cache.run_cached(&argv, "", b"") else { continue };
            let combined = format!("{}{}", record.stdout, record.stderr);
            for spec in registry.iter().filter(|s| s.version_arg == version_arg) {
                let Some(score) = (spec.matcher)(&combined) else { continue };
                if best.as_ref().is_none_or(|(b, _)| score > *b) {
                    best = Some((
                        score,
                        Selection {
                            kind: spec.kind,
                            linker: (spec.linker)(),
                            linker_kind: spec.linker_kind,
                            cmd: candidate.clone(),
                            banner: combined.clone(),
                        },
                    ));
                }
            }
        }
    }
    if best.is_some() {
        return best.map(|(_, s)| s);
    }
    // Last resort: any candidate that spawns at all, with an empty version
    // query, treated as a plain POSIX compiler.
    for candidate in candidates {
        if wk.check_cache.run_cached(candidate, "", b"").is_ok() {
            return Some(Selection {
                kind: CompilerKind::Posix,
                linker: LinkerSelection::Passthrough,
                linker_kind: crate::lang::object::LinkerKind::Posix,
                cmd: candidate.clone(),
                banner: String::new(),
            });
        }
    }
    None
}

/// First executable from `exes` that spawns; falls back to the compiler
/// command itself.
fn probe_first(wk: &mut Workspace, exes: &[&str], fallback: &[String]) -> Vec<String> {
    for exe in exes {
        let argv = vec![(*exe).to_owned(), "--version".to_owned()];
        if wk.check_cache.run_cached(&argv, "", b"").is_ok() {
            return vec![(*exe).to_owned()];
        }
    }
    fallback.to_vec()
}

fn query_triple(wk: &mut Workspace, selection: &Selection) -> Option<String> {
    let generator = lookup_generator(selection.kind, "dumpmachine")?;
    let GenOutput::Args(extra) = generator.invoke(&GenArgs::None)? else { return None };
    let mut argv = selection.cmd.clone();
    argv.extend(extra);
    let record = wk.check_cache.run_cached(&argv, "", b"").ok()?;
    if !record.success {
        return None;
    }
    let line = record.stdout.lines().next()?.trim();
    if line.is_empty() { None } else { Some(line.to_owned()) }
}

/// Parse `-print-search-dirs` output (`libraries: =/a:/b`), falling back
/// to the hard-coded defaults.
fn query_libdirs(wk: &mut Workspace, selection: &Selection) -> Vec<Utf8PathBuf> {
    let fallback = || DEFAULT_LIBDIRS.iter().map(Utf8PathBuf::from).collect();
    let Some(generator) = lookup_generator(selection.kind, "print_search_dirs") else {
        return fallback();
    };
    let Some(GenOutput::Args(extra)) = generator.invoke(&GenArgs::None) else {
        return fallback();
    };
    let mut argv = selection.cmd.clone();
    argv.extend(extra);
    let Ok(record) = wk.check_cache.run_cached(&argv, "", b"") else { return fallback() };
    for line in record.stdout.lines() {
        if let Some(rest) = line.strip_prefix("libraries:") {
            let rest = rest.trim().trim_start_matches('=');
            let dirs: Vec<Utf8PathBuf> = rest
                .split(':')
                .filter(|d| !d.is_empty())
                .map(Utf8PathBuf::from)
                .collect();
            if !dirs.is_empty() {
                return dirs;
            }
        }
    }
    fallback()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::OptionSource;
    use rstest::rstest;

    #[rstest]
    fn env_override_is_the_sole_candidate() {
        let mut wk = Workspace::bare();
        wk.options
            .set_from_str(&mut wk.heap, "env.CC", "my-cc --sysroot=/x", OptionSource::Environment)
            .expect("set");
        let registry = compiler_registry();
        let candidates = gather_candidates(&mut wk, Language::C, &registry);
        assert_eq!(candidates, vec![vec!["my-cc".to_owned(), "--sysroot=/x".to_owned()]]);
    }

    #[rstest]
    fn default_candidates_deduplicate_in_registry_order() {
        let mut wk = Workspace::bare();
        let registry = compiler_registry();
        let candidates = gather_candidates(&mut wk, Language::C, &registry);
        let flat: Vec<String> = candidates.into_iter().map(|c| c.join(" ")).collect();
        assert_eq!(flat, ["clang", "gcc", "cc"]);
    }

    #[rstest]
    #[cfg_attr(not(unix), ignore)]
    fn detection_with_sh_falls_back_to_posix() {
        let mut wk = Workspace::bare();
        wk.options
            .set_from_str(&mut wk.heap, "env.CC", "sh", OptionSource::Environment)
            .expect("set");
        let compiler = detect_compiler(&mut wk, MachineKind::Host, Language::C).expect("detect");
        let idx = wk.heap.record_idx(compiler);
        let rec = &wk.heap.compilers[idx];
        // `sh --version` output never matches a specific toolchain, so
        // the generic fallback wins.
        assert_eq!(rec.kind.id(), "posix");
        assert_eq!(wk.obj_to_argv(rec.cmd_array), vec!["sh".to_owned()]);
    }

    #[rstest]
    fn detection_probes_are_cached() {
        let mut wk = Workspace::bare();
        wk.options
            .set_from_str(&mut wk.heap, "env.CC", "sh", OptionSource::Environment)
            .expect("set");
        let _ = detect_compiler(&mut wk, MachineKind::Host, Language::C);
        let spawns = wk.check_cache.spawn_count();
        let _ = detect_compiler(&mut wk, MachineKind::Host, Language::C);
        assert_eq!(wk.check_cache.spawn_count(), spawns);
    }
}

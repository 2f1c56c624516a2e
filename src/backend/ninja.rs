//! `build.ninja` generation.
//!
//! Converts the configured workspace into the textual manifest consumed by
//! the embedded engine (or any ninja). Output is deterministic: rules are
//! sorted and edges follow target declaration order, so repeated setups
//! produce byte-identical manifests.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use camino::Utf8PathBuf;
use itertools::Itertools;
use serde::Serialize;
use thiserror::Error;

use crate::lang::object::{Obj, ObjType, TargetKind};
use crate::machines::MachineKind;
use crate::runner::graph::shell_escape;
use crate::toolchain::{GenArgs, GenOutput, Language};
use crate::workspace::Workspace;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("no {lang} compiler available for target '{target}'")]
    MissingCompiler { lang: String, target: String },
    #[error("cannot determine language for source '{0}'")]
    UnknownSourceLanguage(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Serialize)]
struct CompileCommand {
    directory: String,
    command: String,
    file: String,
    output: String,
}

#[derive(Debug, Serialize)]
struct InstallEntry {
    source: String,
    destination: String,
}

/// Everything the backend produces for one workspace.
#[derive(Debug)]
pub struct BackendOutput {
    pub build_ninja: String,
    pub compile_commands: String,
    pub install_manifest: String,
}

struct Emitter<'wk> {
    wk: &'wk mut Workspace,
    rules: BTreeMap<String, String>,
    edges: String,
    compile_commands: Vec<CompileCommand>,
    defaults: Vec<String>,
}

/// Generate the manifest and companion files.
pub fn emit(wk: &mut Workspace) -> Result<BackendOutput, BackendError> {
    // Backend temporaries are scratch; drop them once emission is done.
    let mark = wk.heap.mark();
    let mut emitter = Emitter {
        wk,
        rules: BTreeMap::new(),
        edges: String::new(),
        compile_commands: Vec::new(),
        defaults: Vec::new(),
    };
    emitter.emit_regenerate_rule();
    let mut result = emitter.emit_projects();
    if let Ok(output) = &mut result {
        output.install_manifest = install_manifest(emitter.wk);
    }
    let wk_mark = mark;
    emitter.wk.heap.reset_to_mark(wk_mark);
    result
}

/// Emit and write `build.ninja`, `compile_commands.json`, and the install
/// manifest into the build directory.
pub fn write_outputs(wk: &mut Workspace) -> Result<(), BackendError> {
    let build_root = wk.build_root.clone();
    let output = emit(wk)?;
    std::fs::create_dir_all(&build_root)?;
    std::fs::write(build_root.join("build.ninja"), output.build_ninja)?;
    std::fs::write(build_root.join("compile_commands.json"), output.compile_commands)?;
    std::fs::write(build_root.join("kiln-install.json"), output.install_manifest)?;
    Ok(())
}

fn install_manifest(wk: &Workspace) -> String {
    let mut entries = Vec::new();
    for project in &wk.projects {
        for target in &project.install {
            let idx = wk.heap.record_idx(*target);
            let Some(rec) = wk.heap.install_targets.get(idx) else { continue };
            entries.push(InstallEntry {
                source: wk.heap.str_display(rec.src),
                destination: wk.heap.str_display(rec.dest),
            });
        }
    }
    serde_json::to_string_pretty(&entries).unwrap_or_else(|_| "[]".to_owned())
}

impl Emitter<'_> {
    fn gen_args(&mut self, compiler: Obj, name: &str, args: &GenArgs<'_>) -> Vec<String> {
        match self.wk.compiler_args(compiler, name, args) {
            Some(GenOutput::Args(args)) => args,
            _ => Vec::new(),
        }
    }

    fn emit_regenerate_rule(&mut self) {
        let exe = std::env::current_exe()
            .ok()
            .and_then(|p| p.to_str().map(ToOwned::to_owned))
            .unwrap_or_else(|| "kiln".to_owned());
        let mut rule = String::new();
        let _ = writeln!(
            rule,
            " command = {} setup {} {}",
            shell_escape(&exe),
            shell_escape(self.wk.source_root.as_str()),
            shell_escape(self.wk.build_root.as_str()),
        );
        let _ = writeln!(rule, " description = Regenerating build files");
        let _ = writeln!(rule, " generator = 1");
        self.rules.insert("REGENERATE_BUILD".to_owned(), rule);

        let sources: Vec<String> = self
            .wk
            .sources
            .iter()
            .map(|s| s.path().to_string())
            .filter(|p| p != "<internal>")
            .collect();
        let _ = writeln!(
            self.edges,
            "build build.ninja: REGENERATE_BUILD {}",
            sources.iter().map(|s| shell_escape(s)).join(" "),
        );
        let _ = writeln!(self.edges);
    }

    fn compiler_rule_name(lang: Language, machine: MachineKind) -> String {
        let suffix = match machine {
            MachineKind::Host => String::new(),
            MachineKind::Build => "_FOR_BUILD".to_owned(),
        };
        format!("{}_COMPILER{suffix}", lang.as_str())
    }

    fn emit_compiler_rules(&mut self, lang: Language, machine: MachineKind, compiler: Obj) {
        let idx = self.wk.heap.record_idx(compiler);
        let cmd = self.wk.obj_to_argv(self.wk.heap.compilers[idx].cmd_array);
        let cmd: Vec<String> = cmd.iter().map(|c| shell_escape(c)).collect();
        let deps = self.gen_args(compiler, "deps", &GenArgs::Ss("$out", "$DEPFILE"));
        let output = self.gen_args(compiler, "output", &GenArgs::S("$out"));
        let compile_only = self.gen_args(compiler, "compile_only", &GenArgs::None);

        let rule_name = Self::compiler_rule_name(lang, machine);
        let mut rule = String::new();
        let mut command = cmd.clone();
        command.push("$ARGS".to_owned());
        command.extend(deps.clone());
        command.extend(output);
        command.extend(compile_only);
        command.push("$in".to_owned());
        let _ = writeln!(rule, " command = {}", command.join(" "));
        if !deps.is_empty() {
            let _ = writeln!(rule, " deps = gcc");
            let _ = writeln!(rule, " depfile = $DEPFILE");
        }
        let _ = writeln!(rule, " description = Compiling {} object $out", lang.as_str());
        self.rules.insert(rule_name, rule);

        let linker_name = format!("{}_LINKER", lang.as_str());
        let linker_cmd = self.wk.obj_to_argv(self.wk.heap.compilers[idx].linker_cmd);
        let linker_cmd: Vec<String> = linker_cmd.iter().map(|c| shell_escape(c)).collect();
        let mut rule = String::new();
        let _ = writeln!(rule, " command = {} $ARGS -o $out $in $LINK_ARGS", linker_cmd.join(" "));
        let _ = writeln!(rule, " description = Linking target $out");
        self.rules.insert(linker_name, rule);

        let archiver_cmd = self.wk.obj_to_argv(self.wk.heap.compilers[idx].archiver_cmd);
        let archiver_cmd: Vec<String> = archiver_cmd.iter().map(|c| shell_escape(c)).collect();
        let mut rule = String::new();
        let _ = writeln!(
            rule,
            " command = rm -f $out && {} csr $out $in",
            archiver_cmd.join(" "),
        );
        let _ = writeln!(rule, " description = Linking static target $out");
        self.rules.entry("STATIC_LINKER".to_owned()).or_insert(rule);
    }

    fn emit_custom_command_rule(&mut self) {
        let mut rule = String::new();
        let _ = writeln!(rule, " command = $COMMAND");
        let _ = writeln!(rule, " description = Generating $out");
        self.rules.entry("CUSTOM_COMMAND".to_owned()).or_insert(rule);
    }

    fn emit_projects(&mut self) -> Result<BackendOutput, BackendError> {
        // Compiler rules first, one set per detected (machine, language).
        let mut compilers: Vec<(Language, MachineKind, Obj)> = Vec::new();
        for project in &self.wk.projects {
            for ((machine, lang), compiler) in &project.compilers {
                if !compilers.iter().any(|(l, m, _)| l == lang && m == machine) {
                    compilers.push((*lang, *machine, *compiler));
                }
            }
        }
        for (lang, machine, compiler) in compilers {
            self.emit_compiler_rules(lang, machine, compiler);
        }

        let targets: Vec<Obj> =
            self.wk.projects.iter().flat_map(|p| p.targets.iter().copied()).collect();
        for target in targets {
            match self.wk.heap.typ(target) {
                ObjType::BuildTarget => self.emit_build_target(target)?,
                ObjType::CustomTarget => self.emit_custom_target(target),
                ObjType::AliasTarget => self.emit_alias_target(target),
                _ => {}
            }
        }

        let mut out = String::new();
        let _ = writeln!(out, "# This file is regenerated automatically; edits will be lost.");
        let _ = writeln!(out, "ninja_required_version = 1.9");
        let _ = writeln!(out);
        for (name, body) in &self.rules {
            let _ = writeln!(out, "rule {name}");
            out.push_str(body);
            let _ = writeln!(out);
        }
        out.push_str(&self.edges);
        if !self.defaults.is_empty() {
            let mut defaults = self.defaults.clone();
            defaults.sort();
            let _ = writeln!(out, "default {}", defaults.join(" "));
        }

        let compile_commands = serde_json::to_string_pretty(&self.compile_commands)
            .unwrap_or_else(|_| "[]".to_owned());
        Ok(BackendOutput {
            build_ninja: out,
            compile_commands,
            install_manifest: String::new(),
        })
    }

    /// Compile args shared by every object of a target.
    fn target_args(&mut self, target: Obj, lang: Language, compiler: Obj) -> Vec<String> {
        let mut args = Vec::new();
        let opt = self
            .wk
            .options
            .value("optimization")
            .map(|v| self.wk.heap.str_display(v))
            .unwrap_or_else(|| "0".to_owned());
        args.extend(self.gen_args(compiler, "optimization", &GenArgs::S(&opt)));
        if self.wk.options.value("debug") == Some(Obj::TRUE) {
            args.extend(self.gen_args(compiler, "debug", &GenArgs::None));
        }
        let warning = self
            .wk
            .options
            .value("warning_level")
            .map(|v| self.wk.heap.str_display(v))
            .unwrap_or_else(|| "1".to_owned());
        args.extend(self.gen_args(compiler, "warning_lvl", &GenArgs::S(&warning)));
        if self.wk.options.value("werror") == Some(Obj::TRUE) {
            args.extend(self.gen_args(compiler, "werror", &GenArgs::None));
        }
        if let Some(option_args) = self.wk.options.value(&format!("{}_args", lang.as_str())) {
            args.extend(self.wk.obj_to_argv(option_args));
        }

        let (global_args, project_args) = {
            let Some(project) = self.wk.projects.last() else {
                return args;
            };
            (
                project.global_args.get(&(MachineKind::Host, lang)).copied(),
                project.project_args.get(&(MachineKind::Host, lang)).copied(),
            )
        };
        if let Some(a) = global_args {
            args.extend(self.wk.obj_to_argv(a));
        }
        if let Some(a) = project_args {
            args.extend(self.wk.obj_to_argv(a));
        }

        let idx = self.wk.heap.record_idx(target);
        let rec = self.wk.heap.build_targets[idx].clone();
        for inc in self.wk.heap.arr_to_vec(rec.include_dirs) {
            let dir = match self.wk.heap.typ(inc) {
                ObjType::IncludeDirectory => {
                    let inc_idx = self.wk.heap.record_idx(inc);
                    let rec = &self.wk.heap.include_directories[inc_idx];
                    let path = self.wk.heap.str_display(rec.path);
                    let system = rec.is_system;
                    Some((path, system))
                }
                ObjType::Str => Some((self.wk.heap.str_display(inc), false)),
                _ => None,
            };
            if let Some((path, system)) = dir {
                let generator = if system { "include_system" } else { "include" };
                let source_dir = self.wk.source_root.join(&path);
                args.extend(self.gen_args(compiler, generator, &GenArgs::S(source_dir.as_str())));
            }
        }
        // Dependency usage requirements.
        for dep in self.wk.heap.arr_to_vec(rec.deps) {
            let dep_idx = self.wk.heap.record_idx(dep);
            let Some(dep_rec) = self.wk.heap.dependencies.get(dep_idx).cloned() else { continue };
            if dep_rec.dep.parts.compile_args {
                args.extend(self.wk.obj_to_argv(dep_rec.dep.compile_args));
            }
            if dep_rec.dep.parts.includes {
                for inc in self.wk.heap.arr_to_vec(dep_rec.dep.include_dirs) {
                    if self.wk.heap.typ(inc) == ObjType::IncludeDirectory {
                        let inc_idx = self.wk.heap.record_idx(inc);
                        let path =
                            self.wk.heap.str_display(self.wk.heap.include_directories[inc_idx].path);
                        let dir = self.wk.source_root.join(path);
                        args.extend(self.gen_args(compiler, "include", &GenArgs::S(dir.as_str())));
                    }
                }
            }
        }
        if rec.kind == TargetKind::SharedLibrary {
            args.extend(self.gen_args(compiler, "pic", &GenArgs::None));
        }
        if let Some(lang_args) =
            self.wk.heap.dict_get_bytes(rec.lang_args, lang.as_str().as_bytes())
        {
            args.extend(self.wk.obj_to_argv(lang_args));
        }
        args
    }

    fn source_language(&self, path: &str) -> Option<Language> {
        let ext = std::path::Path::new(path).extension()?.to_str()?;
        Language::ALL.into_iter().find(|lang| lang.owns_extension(ext))
    }

    fn emit_build_target(&mut self, target: Obj) -> Result<(), BackendError> {
        let idx = self.wk.heap.record_idx(target);
        let rec = self.wk.heap.build_targets[idx].clone();
        let name = self.wk.heap.str_display(rec.name);
        let filename = self.wk.heap.str_display(rec.filename);
        let build_dir = self.wk.heap.str_display(rec.build_dir);
        let out_path = if build_dir.is_empty() {
            filename.clone()
        } else {
            format!("{build_dir}/{filename}")
        };

        let mut objects: Vec<String> = Vec::new();
        let sources = self.wk.heap.arr_to_vec(rec.sources);
        for source in sources {
            let path = match self.wk.heap.typ(source) {
                ObjType::Str => {
                    let rel = self.wk.heap.str_display(source);
                    self.wk.source_root.join(&rec_subdir(&build_dir)).join(rel).to_string()
                }
                ObjType::File => self
                    .wk
                    .heap
                    .file_path(source)
                    .map(Utf8PathBuf::from)
                    .map(|p| p.to_string())
                    .unwrap_or_default(),
                _ => continue,
            };
            let Some(lang) = self.source_language(&path) else {
                return Err(BackendError::UnknownSourceLanguage(path));
            };
            let compiler = self
                .wk
                .projects
                .last()
                .and_then(|p| p.compilers.get(&(rec.machine, lang)).copied())
                .ok_or_else(|| BackendError::MissingCompiler {
                    lang: lang.as_str().to_owned(),
                    target: name.clone(),
                })?;

            let basename = std::path::Path::new(&path)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("src");
            let obj_path = format!("{name}.p/{basename}.o");
            let args = self.target_args(target, lang, compiler);
            let rule = Self::compiler_rule_name(lang, rec.machine);
            let _ = writeln!(
                self.edges,
                "build {}: {rule} {}",
                shell_escape(&obj_path),
                shell_escape(&path),
            );
            let _ = writeln!(self.edges, " DEPFILE = {obj_path}.d");
            if !args.is_empty() {
                let escaped: Vec<String> = args.iter().map(|a| shell_escape(a)).collect();
                let _ = writeln!(self.edges, " ARGS = {}", escaped.join(" "));
            }
            let _ = writeln!(self.edges);

            self.record_compile_command(compiler, &args, &path, &obj_path);
            objects.push(obj_path);
        }

        // Link step.
        let link_lang = rec_link_language(self.wk, &rec).unwrap_or(Language::C);
        let mut inputs = objects.clone();
        let mut link_args: Vec<String> = self.wk.obj_to_argv(rec.link_args);
        let mut implicit: Vec<String> = Vec::new();
        for lib in self.wk.heap.arr_to_vec(rec.link_with) {
            if let Some(path) = self.link_with_path(lib) {
                inputs.push(path);
            }
        }
        for dep in self.wk.heap.arr_to_vec(rec.deps) {
            let dep_idx = self.wk.heap.record_idx(dep);
            let Some(dep_rec) = self.wk.heap.dependencies.get(dep_idx).cloned() else { continue };
            if dep_rec.dep.parts.link_args {
                link_args.extend(self.wk.obj_to_argv(dep_rec.dep.link_args));
            }
            if dep_rec.dep.parts.links {
                for lib in self.wk.heap.arr_to_vec(dep_rec.dep.link_with) {
                    if let Some(path) = self.link_with_path(lib) {
                        inputs.push(path);
                    }
                }
            }
            for ordered in self.wk.heap.arr_to_vec(dep_rec.dep.order_deps) {
                if self.wk.heap.typ(ordered) == ObjType::Str {
                    implicit.push(self.wk.heap.str_display(ordered));
                }
            }
        }

        let rule = match rec.kind {
            TargetKind::StaticLibrary => "STATIC_LINKER".to_owned(),
            TargetKind::Executable | TargetKind::SharedLibrary => {
                format!("{}_LINKER", link_lang.as_str())
            }
        };
        let _ = write!(
            self.edges,
            "build {}: {rule} {}",
            shell_escape(&out_path),
            inputs.iter().map(|i| shell_escape(i)).join(" "),
        );
        if !implicit.is_empty() {
            let _ = write!(
                self.edges,
                " || {}",
                implicit.iter().map(|i| shell_escape(i)).join(" "),
            );
        }
        let _ = writeln!(self.edges);
        if rec.kind == TargetKind::SharedLibrary {
            let idx = self.wk.heap.record_idx(target);
            let machine = self.wk.heap.build_targets[idx].machine;
            if let Some(compiler) = self
                .wk
                .projects
                .last()
                .and_then(|p| p.compilers.get(&(machine, link_lang)).copied())
            {
                let shared = self.gen_args(compiler, "shared", &GenArgs::None);
                link_args.extend(shared);
            }
        }
        if !link_args.is_empty() {
            let escaped: Vec<String> = link_args.iter().map(|a| shell_escape(a)).collect();
            let _ = writeln!(self.edges, " LINK_ARGS = {}", escaped.join(" "));
        }
        let _ = writeln!(self.edges);

        self.defaults.push(out_path);
        Ok(())
    }

    fn link_with_path(&self, lib: Obj) -> Option<String> {
        let lib = match self.wk.heap.typ(lib) {
            ObjType::BothLibs => {
                let idx = self.wk.heap.record_idx(lib);
                self.wk.heap.both_libs[idx].static_lib
            }
            _ => lib,
        };
        if self.wk.heap.typ(lib) != ObjType::BuildTarget {
            return None;
        }
        let idx = self.wk.heap.record_idx(lib);
        let rec = &self.wk.heap.build_targets[idx];
        let dir = self.wk.heap.str_display(rec.build_dir);
        let filename = self.wk.heap.str_display(rec.filename);
        Some(if dir.is_empty() { filename } else { format!("{dir}/{filename}") })
    }

    fn record_compile_command(&mut self, compiler: Obj, args: &[String], file: &str, output: &str) {
        let idx = self.wk.heap.record_idx(compiler);
        let mut command = self.wk.obj_to_argv(self.wk.heap.compilers[idx].cmd_array);
        command.extend(args.iter().cloned());
        command.extend(["-o".to_owned(), output.to_owned(), "-c".to_owned(), file.to_owned()]);
        self.compile_commands.push(CompileCommand {
            directory: self.wk.build_root.to_string(),
            command: command.iter().map(|c| shell_escape(c)).join(" "),
            file: file.to_owned(),
            output: output.to_owned(),
        });
    }

    fn emit_custom_target(&mut self, target: Obj) {
        self.emit_custom_command_rule();
        let idx = self.wk.heap.record_idx(target);
        let rec = self.wk.heap.custom_targets[idx].clone();
        let outputs: Vec<String> = self
            .wk
            .heap
            .arr_to_vec(rec.outputs)
            .iter()
            .map(|o| self.wk.heap.str_display(*o))
            .collect();
        let mut inputs = Vec::new();
        for input in self.wk.heap.arr_to_vec(rec.inputs) {
            match self.wk.heap.typ(input) {
                ObjType::Str => inputs.push(self.wk.heap.str_display(input)),
                ObjType::File => {
                    if let Some(p) = self.wk.heap.file_path(input) {
                        inputs.push(p.to_string());
                    }
                }
                _ => {}
            }
        }
        let mut command: Vec<String> = Vec::new();
        for part in self.wk.heap.arr_to_vec(rec.command) {
            match self.wk.heap.typ(part) {
                ObjType::Str => command.push(self.wk.heap.str_display(part)),
                ObjType::File => {
                    if let Some(p) = self.wk.heap.file_path(part) {
                        command.push(p.to_string());
                    }
                }
                ObjType::ExternalProgram => {
                    let prog_idx = self.wk.heap.record_idx(part);
                    let path = self.wk.heap.external_programs[prog_idx].path;
                    command.push(self.wk.heap.str_display(path));
                }
                _ => {}
            }
        }
        // @OUTPUT@/@INPUT@ placeholders follow the configure-time
        // convention.
        let command: Vec<String> = command
            .iter()
            .map(|c| {
                c.replace("@OUTPUT@", &outputs.join(" ")).replace("@INPUT@", &inputs.join(" "))
            })
            .collect();

        let _ = writeln!(
            self.edges,
            "build {}: CUSTOM_COMMAND {}",
            outputs.iter().map(|o| shell_escape(o)).join(" "),
            inputs.iter().map(|i| shell_escape(i)).join(" "),
        );
        let quoted: Vec<String> = command.iter().map(|c| shell_escape(c)).collect();
        let mut cmdline = quoted.join(" ");
        if rec.capture {
            let first = outputs.first().map(String::as_str).unwrap_or("out");
            cmdline = format!("{cmdline} > {}", shell_escape(first));
        }
        let _ = writeln!(self.edges, " COMMAND = {cmdline}");
        if rec.depfile != Obj::NULL {
            let depfile = self.wk.heap.str_display(rec.depfile);
            let _ = writeln!(self.edges, " depfile = {depfile}");
            let _ = writeln!(self.edges, " deps = gcc");
        }
        let _ = writeln!(self.edges);
        if rec.build_by_default {
            self.defaults.extend(outputs);
        }
    }

    fn emit_alias_target(&mut self, target: Obj) {
        let idx = self.wk.heap.record_idx(target);
        let rec = self.wk.heap.alias_targets[idx].clone();
        let name = self.wk.heap.str_display(rec.name);
        let mut depends = Vec::new();
        for dep in self.wk.heap.arr_to_vec(rec.depends) {
            match self.wk.heap.typ(dep) {
                ObjType::BuildTarget => {
                    if let Some(path) = self.link_with_path(dep) {
                        depends.push(path);
                    }
                }
                ObjType::CustomTarget => {
                    let ct_idx = self.wk.heap.record_idx(dep);
                    let outputs = self.wk.heap.custom_targets[ct_idx].outputs;
                    for out in self.wk.heap.arr_to_vec(outputs) {
                        depends.push(self.wk.heap.str_display(out));
                    }
                }
                _ => {}
            }
        }
        let _ = writeln!(
            self.edges,
            "build {}: phony {}",
            shell_escape(&name),
            depends.iter().map(|d| shell_escape(d)).join(" "),
        );
        let _ = writeln!(self.edges);
    }
}

fn rec_subdir(build_dir: &str) -> Utf8PathBuf {
    Utf8PathBuf::from(build_dir)
}

fn rec_link_language(wk: &Workspace, rec: &crate::lang::object::BuildTargetRecord) -> Option<Language> {
    // Link with the "biggest" language among the sources; C++ wins over C.
    let mut best: Option<Language> = None;
    for source in wk.heap.arr_to_vec(rec.sources) {
        let path = match wk.heap.typ(source) {
            ObjType::Str => wk.heap.str_display(source),
            ObjType::File => wk.heap.file_path(source).map(ToString::to_string)?,
            _ => continue,
        };
        let ext = std::path::Path::new(&path).extension().and_then(|e| e.to_str())?;
        for lang in Language::ALL {
            if lang.owns_extension(ext) && (best.is_none() || lang == Language::Cpp) {
                best = Some(lang);
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::OptionSource;
    use rstest::rstest;

    fn configured_workspace(script: &str) -> Workspace {
        let mut wk = Workspace::bare();
        // Pin detection to `sh` so the test never depends on an installed
        // toolchain; the fallback classifies it as a posix compiler.
        wk.options
            .set_from_str(&mut wk.heap, "env.CC", "sh", OptionSource::Environment)
            .expect("set env.CC");
        wk.eval_snippet(script).expect("configure");
        wk
    }

    #[rstest]
    #[serial_test::serial]
    fn trivial_executable_produces_compiler_and_linker_rules() {
        let mut wk = configured_workspace(
            "project('demo', 'c')\nexecutable('hello', 'main.c')",
        );
        let output = emit(&mut wk).expect("emit");
        let text = &output.build_ninja;
        assert!(text.contains("rule c_COMPILER"), "missing compiler rule: {text}");
        assert!(text.contains("rule c_LINKER"), "missing linker rule: {text}");
        assert!(text.contains("build hello.p/main.c.o: c_COMPILER"));
        assert!(text.contains("build hello: c_LINKER hello.p/main.c.o"));
        assert!(text.contains("default"));
    }

    #[rstest]
    #[serial_test::serial]
    fn emission_is_deterministic() {
        let script = "project('demo', 'c')\nexecutable('a', 'a.c')\nexecutable('b', 'b.c')";
        let mut wk1 = configured_workspace(script);
        let mut wk2 = configured_workspace(script);
        let first = emit(&mut wk1).expect("emit");
        let second = emit(&mut wk2).expect("emit");
        assert_eq!(first.build_ninja, second.build_ninja);
    }

    #[rstest]
    #[serial_test::serial]
    fn compile_commands_cover_each_object() {
        let mut wk = configured_workspace(
            "project('demo', 'c')\nexecutable('hello', 'main.c', 'util.c')",
        );
        let output = emit(&mut wk).expect("emit");
        let parsed: serde_json::Value =
            serde_json::from_str(&output.compile_commands).expect("json");
        assert_eq!(parsed.as_array().map(Vec::len), Some(2));
    }

    #[rstest]
    #[serial_test::serial]
    fn custom_targets_emit_custom_command_edges() {
        let mut wk = configured_workspace(concat!(
            "project('demo', 'c')\n",
            "custom_target('gen', output: 'gen.c', command: ['tool', '@OUTPUT@'])",
        ));
        let output = emit(&mut wk).expect("emit");
        assert!(output.build_ninja.contains("rule CUSTOM_COMMAND"));
        assert!(output.build_ninja.contains("build gen.c: CUSTOM_COMMAND"));
        assert!(output.build_ninja.contains("COMMAND = tool gen.c"));
    }

    #[rstest]
    #[serial_test::serial]
    fn regenerate_rule_marks_generator() {
        let mut wk = configured_workspace("project('demo', 'c')");
        let output = emit(&mut wk).expect("emit");
        assert!(output.build_ninja.contains("rule REGENERATE_BUILD"));
        assert!(output.build_ninja.contains("generator = 1"));
        assert!(output.build_ninja.contains("build build.ninja: REGENERATE_BUILD"));
    }
}

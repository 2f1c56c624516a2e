//! Kernel (free) functions of the build language.

use camino::Utf8PathBuf;

use crate::lang::natives::{CallArgs, NativeRegistry, NativeResult};
use crate::lang::object::{
    BuildDep, BuildTargetRecord, ConfigurationDataRecord, CustomTargetRecord, DepParts,
    DependencyKind, DependencyRecord, EnvironmentRecord, ExternalProgramRecord, FeatureState,
    GeneratorRecord, IncludeDirectoryRecord, InstallTargetRecord, IterState, ModuleRecord, Obj,
    ObjType, ObjValue, RunResultRecord, TargetKind, TestRecord,
};
use crate::lang::types::tag;
use crate::machines::MachineKind;
use crate::options::OptionSource;
use crate::toolchain::Language;
use crate::workspace::Workspace;

pub fn register(reg: &mut NativeRegistry) {
    reg.add_kernel("project", project);
    reg.add_kernel("executable", executable);
    reg.add_kernel("static_library", static_library);
    reg.add_kernel("shared_library", shared_library);
    reg.add_kernel("library", library);
    reg.add_kernel("both_libraries", both_libraries);
    reg.add_kernel("custom_target", custom_target);
    reg.add_kernel("alias_target", alias_target);
    reg.add_kernel("generator", generator);
    reg.add_kernel("declare_dependency", declare_dependency);
    reg.add_kernel("dependency", dependency);
    reg.add_kernel("files", files);
    reg.add_kernel("include_directories", include_directories);
    reg.add_kernel("find_program", find_program);
    reg.add_kernel("run_command", run_command);
    reg.add_kernel("message", message);
    reg.add_kernel("warning", warning);
    reg.add_kernel("error", error_fn);
    reg.add_kernel("assert", assert_fn);
    reg.add_kernel("environment", environment);
    reg.add_kernel("configuration_data", configuration_data);
    reg.add_kernel("get_option", get_option);
    reg.add_kernel("option", option_fn);
    reg.add_kernel("add_project_arguments", add_project_arguments);
    reg.add_kernel("add_global_arguments", add_global_arguments);
    reg.add_kernel("test", test_fn);
    reg.add_kernel("install_data", install_data);
    reg.add_kernel("import", import);
    reg.add_kernel("subdir", subdir);
    reg.add_kernel("join_paths", join_paths);
    reg.add_kernel("summary", summary);
    reg.add_kernel("range", range);
    reg.add_kernel("disabler", disabler);
    reg.add_kernel_raw("is_disabler", is_disabler);
    reg.add_kernel_raw("set_variable", set_variable);
    reg.add_kernel("get_variable", get_variable);
    reg.add_kernel("is_variable", is_variable);
}

// ----------------------------------------------------------------------
// shared helpers

/// Interpret a string or file value as a path under the current source
/// directory.
pub fn source_path(wk: &Workspace, obj: Obj) -> Option<Utf8PathBuf> {
    match wk.heap.typ(obj) {
        ObjType::Str => {
            let s = wk.heap.str_display(obj);
            let path = Utf8PathBuf::from(&s);
            if path.is_absolute() { Some(path) } else { Some(wk.current_source_dir().join(path)) }
        }
        ObjType::File => wk.heap.file_path(obj).map(Utf8PathBuf::from),
        _ => None,
    }
}

fn require_project(wk: &mut Workspace, what: &str) -> Result<(), ()> {
    if wk.projects.is_empty() {
        wk.vm_error(&format!("{what} requires project() to have been called first"));
        return Err(());
    }
    Ok(())
}

/// A `required:` kwarg may be a bool or a feature option.
fn required_kwarg(wk: &mut Workspace, args: &mut CallArgs) -> Result<bool, ()> {
    let tag = tag::BOOL.union(tag::FEATURE_OPT);
    match args.kw(wk, "required", tag)? {
        None => Ok(true),
        Some(obj) => match wk.heap.get(obj) {
            ObjValue::Bool(b) => Ok(b),
            ObjValue::FeatureOpt(FeatureState::Enabled) => Ok(true),
            ObjValue::FeatureOpt(_) => Ok(false),
            _ => Ok(true),
        },
    }
}

fn empty_build_dep(wk: &mut Workspace) -> BuildDep {
    let mk = |wk: &mut Workspace| wk.heap.arr_new();
    BuildDep {
        compile_args: mk(wk),
        include_dirs: mk(wk),
        link_args: mk(wk),
        link_with: mk(wk),
        link_whole: mk(wk),
        objects: mk(wk),
        order_deps: mk(wk),
        rpaths: mk(wk),
        sources: mk(wk),
        parts: DepParts::all(),
    }
}

// ----------------------------------------------------------------------
// project setup

fn project(wk: &mut Workspace, _self: Obj, args: &mut CallArgs) -> NativeResult {
    let name = args.next_pos(wk, "project name", tag::STR)?;
    let langs = args.rest(wk, "language", tag::STR)?;
    let version = match args.kw_str(wk, "version")? {
        Some(v) => v,
        None => wk.stri("undefined"),
    };
    if let Some(defaults) = args.kw(wk, "default_options", tag::STR.listify())? {
        for entry in wk.heap.arr_to_vec(defaults) {
            let text = wk.heap.str_display(entry);
            let Some((opt_name, value)) = text.split_once('=') else {
                wk.vm_error(&format!("malformed default option '{text}'"));
                return Err(());
            };
            let _ = wk.options.set_from_str(
                &mut wk.heap,
                opt_name.trim(),
                value.trim(),
                OptionSource::DefaultOptions,
            );
        }
    }
    let werror = wk.options.value("werror") == Some(Obj::TRUE);
    wk.diags.set_werror(werror);

    let subdir = wk.cur_subdir.clone();
    wk.push_project(name, version, subdir);

    for lang_obj in langs {
        let lang_name = wk.heap.str_display(lang_obj);
        let Some(lang) = Language::from_str(&lang_name) else {
            wk.vm_error(&format!("unsupported language '{lang_name}'"));
            return Err(());
        };
        if let Some(project) = wk.cur_project() {
            project.languages.push(lang);
        }
        if let Err(err) = wk.compiler_for(MachineKind::Host, lang) {
            let msg = err.to_string();
            wk.vm_error(&msg);
            return Err(());
        }
    }
    Ok(Obj::NULL)
}

// ----------------------------------------------------------------------
// targets

fn build_target(
    wk: &mut Workspace,
    args: &mut CallArgs,
    kind: TargetKind,
) -> NativeResult {
    require_project(wk, "target definition")?;
    let name = args.next_pos(wk, "target name", tag::STR)?;
    let sources = args.rest(wk, "source", tag::SOURCE)?;
    let sources_arr = wk.heap.arr_from_vec(&sources);
    if let Some(extra) = args.kw(wk, "sources", tag::SOURCE.listify())? {
        wk.heap.arr_extend(sources_arr, extra);
    }
    let include_dirs = args
        .kw(wk, "include_directories", tag::INCLUDE_DIRECTORY.union(tag::STR).listify())?
        .unwrap_or_else(|| wk.heap.arr_new());
    let link_with = args
        .kw(wk, "link_with", tag::BUILD_TARGET.union(tag::BOTH_LIBS).listify())?
        .unwrap_or_else(|| wk.heap.arr_new());
    let deps = args
        .kw(wk, "dependencies", tag::DEPENDENCY.listify())?
        .unwrap_or_else(|| wk.heap.arr_new());
    let link_args = args
        .kw(wk, "link_args", tag::STR.listify())?
        .unwrap_or_else(|| wk.heap.arr_new());
    let lang_args = wk.heap.dict_new();
    for lang in Language::ALL {
        let kw_name = format!("{}_args", lang.as_str());
        if let Some(v) = args.kw(wk, &kw_name, tag::STR.listify())? {
            let key = wk.stri(lang.as_str());
            wk.heap.dict_set_str(lang_args, key, v);
        }
    }
    let install = args.kw_bool(wk, "install", false)?;

    // Unresolved dependencies disable the target via the disabler
    // propagation path before we ever get here; a NotFound dependency
    // reaching this point is a hard error.
    for dep in wk.heap.arr_to_vec(deps) {
        let idx = wk.heap.record_idx(dep);
        if wk.heap.dependencies.get(idx).is_some_and(|d| d.kind == DependencyKind::NotFound) {
            let dep_name = wk.heap.dependencies[idx].name;
            let dep_name = wk.heap.str_display(dep_name);
            wk.vm_error(&format!("target uses dependency '{dep_name}' which was not found"));
            return Err(());
        }
    }

    let name_str = wk.heap.str_display(name);
    let filename = match kind {
        TargetKind::Executable => name_str,
        TargetKind::StaticLibrary => format!("lib{name_str}.a"),
        TargetKind::SharedLibrary => format!("lib{name_str}.so"),
    };
    let filename = wk.stri(&filename);
    let cur_subdir = wk.cur_subdir.clone();
    let build_dir = wk.stri(cur_subdir.as_str());

    let dep_internal = empty_build_dep(wk);
    let mut dep_public = empty_build_dep(wk);
    dep_public.include_dirs = include_dirs;
    dep_public.link_with = link_with;

    let objects = wk.heap.arr_new();
    let record = BuildTargetRecord {
        name,
        kind,
        machine: MachineKind::Host,
        sources: sources_arr,
        objects,
        include_dirs,
        link_with,
        link_args,
        lang_args,
        deps,
        dep_internal,
        dep_public,
        build_dir,
        filename,
        install,
    };
    let target = wk.heap.make_build_target(record);
    if let Some(project) = wk.cur_project() {
        project.targets.push(target);
    }
    if install {
        let src = filename;
        let dest = wk.stri("bin");
        let install_target = wk.heap.make_install_target(InstallTargetRecord {
            src,
            dest,
            mode: Obj::NULL,
        });
        if let Some(project) = wk.cur_project() {
            project.install.push(install_target);
        }
    }
    Ok(target)
}

fn executable(wk: &mut Workspace, _self: Obj, args: &mut CallArgs) -> NativeResult {
    build_target(wk, args, TargetKind::Executable)
}

fn static_library(wk: &mut Workspace, _self: Obj, args: &mut CallArgs) -> NativeResult {
    build_target(wk, args, TargetKind::StaticLibrary)
}

fn shared_library(wk: &mut Workspace, _self: Obj, args: &mut CallArgs) -> NativeResult {
    build_target(wk, args, TargetKind::SharedLibrary)
}

/// `library()` follows the `default_library` option.
fn library(wk: &mut Workspace, _self: Obj, args: &mut CallArgs) -> NativeResult {
    let choice = wk.options.value("default_library").map(|v| wk.heap.str_display(v));
    match choice.as_deref() {
        Some("static") => build_target(wk, args, TargetKind::StaticLibrary),
        Some("both") => both_libraries(wk, Obj::NULL, args),
        _ => build_target(wk, args, TargetKind::SharedLibrary),
    }
}

fn both_libraries(wk: &mut Workspace, _self: Obj, args: &mut CallArgs) -> NativeResult {
    let static_lib = build_target(wk, args, TargetKind::StaticLibrary)?;
    args.rewind();
    let shared_lib = build_target(wk, args, TargetKind::SharedLibrary)?;
    Ok(wk
        .heap
        .make_both_libs(crate::lang::object::BothLibsRecord { static_lib, shared_lib }))
}

fn custom_target(wk: &mut Workspace, _self: Obj, args: &mut CallArgs) -> NativeResult {
    require_project(wk, "custom_target")?;
    let name = args.next_pos(wk, "target name", tag::STR)?;
    let outputs = match args.kw(wk, "output", tag::STR.listify())? {
        Some(v) => v,
        None => {
            wk.vm_error("custom_target requires an output");
            return Err(());
        }
    };
    let command = match args.kw(wk, "command", tag::SOURCE.union(tag::EXTERNAL_PROGRAM).listify())? {
        Some(v) => v,
        None => {
            wk.vm_error("custom_target requires a command");
            return Err(());
        }
    };
    let inputs =
        args.kw(wk, "input", tag::SOURCE.listify())?.unwrap_or_else(|| wk.heap.arr_new());
    let depfile = args.kw_str(wk, "depfile")?.unwrap_or(Obj::NULL);
    let capture = args.kw_bool(wk, "capture", false)?;
    let build_by_default = args.kw_bool(wk, "build_by_default", true)?;
    let depends = args
        .kw(wk, "depends", tag::BUILD_TARGET.union(tag::CUSTOM_TARGET).listify())?
        .unwrap_or_else(|| wk.heap.arr_new());
    let env = args.kw(wk, "env", tag::ENVIRONMENT)?.unwrap_or(Obj::NULL);

    let record = CustomTargetRecord {
        name,
        inputs,
        outputs,
        command,
        depfile,
        capture,
        build_by_default,
        depends,
        env,
    };
    let target = wk.heap.make_custom_target(record);
    if let Some(project) = wk.cur_project() {
        project.targets.push(target);
    }
    Ok(target)
}

fn alias_target(wk: &mut Workspace, _self: Obj, args: &mut CallArgs) -> NativeResult {
    require_project(wk, "alias_target")?;
    let name = args.next_pos(wk, "alias name", tag::STR)?;
    let depends = args.rest(wk, "dependency", tag::BUILD_TARGET.union(tag::CUSTOM_TARGET))?;
    let depends = wk.heap.arr_from_vec(&depends);
    let record = crate::lang::object::AliasTargetRecord { name, depends };
    let target = wk.heap.make_alias_target(record);
    if let Some(project) = wk.cur_project() {
        project.targets.push(target);
    }
    Ok(target)
}

fn generator(wk: &mut Workspace, _self: Obj, args: &mut CallArgs) -> NativeResult {
    let exe = args.next_pos(wk, "generator program", tag::EXTERNAL_PROGRAM.union(tag::BUILD_TARGET))?;
    let gen_args =
        args.kw(wk, "arguments", tag::STR.listify())?.unwrap_or_else(|| wk.heap.arr_new());
    let output =
        args.kw(wk, "output", tag::STR.listify())?.unwrap_or_else(|| wk.heap.arr_new());
    let depfile = args.kw_str(wk, "depfile")?.unwrap_or(Obj::NULL);
    let capture = args.kw_bool(wk, "capture", false)?;
    Ok(wk.heap.make_generator(GeneratorRecord { exe, args: gen_args, output, depfile, capture }))
}

// ----------------------------------------------------------------------
// dependencies and programs

fn declare_dependency(wk: &mut Workspace, _self: Obj, args: &mut CallArgs) -> NativeResult {
    let mut dep = empty_build_dep(wk);
    if let Some(v) = args.kw(wk, "compile_args", tag::STR.listify())? {
        dep.compile_args = v;
    }
    if let Some(v) = args.kw(wk, "link_args", tag::STR.listify())? {
        dep.link_args = v;
    }
    if let Some(v) = args.kw(wk, "link_with", tag::BUILD_TARGET.union(tag::BOTH_LIBS).listify())? {
        dep.link_with = v;
    }
    if let Some(v) =
        args.kw(wk, "include_directories", tag::INCLUDE_DIRECTORY.union(tag::STR).listify())?
    {
        dep.include_dirs = v;
    }
    if let Some(v) = args.kw(wk, "sources", tag::SOURCE.listify())? {
        dep.sources = v;
    }
    let version = args.kw_str(wk, "version")?.unwrap_or_else(|| {
        let cur = wk.projects.last().map(|p| p.version);
        cur.unwrap_or(Obj::NULL)
    });
    let name = wk.stri("internal");
    Ok(wk.heap.make_dependency(DependencyRecord {
        name,
        version,
        kind: DependencyKind::Internal,
        dep,
    }))
}

/// External dependency lookup. Only the per-project cache is consulted;
/// system lookup (pkg-config and friends) is an external collaborator, so
/// an unknown name resolves to a not-found dependency.
fn dependency(wk: &mut Workspace, _self: Obj, args: &mut CallArgs) -> NativeResult {
    require_project(wk, "dependency")?;
    let name = args.next_pos(wk, "dependency name", tag::STR)?;
    let required = required_kwarg(wk, args)?;
    let _version_req = args.kw(wk, "version", tag::STR.listify())?;
    let name_str = wk.heap.str_display(name);

    let cached = wk.projects.last().and_then(|p| p.dep_cache.get(&name_str)).copied();
    if let Some(found) = cached {
        return Ok(found);
    }
    if required {
        wk.vm_error(&format!("dependency '{name_str}' not found"));
        return Err(());
    }
    let dep = empty_build_dep(wk);
    let result = wk.heap.make_dependency(DependencyRecord {
        name,
        version: Obj::NULL,
        kind: DependencyKind::NotFound,
        dep,
    });
    if let Some(project) = wk.cur_project() {
        project.dep_cache.insert(name_str, result);
    }
    Ok(result)
}

fn files(wk: &mut Workspace, _self: Obj, args: &mut CallArgs) -> NativeResult {
    let names = args.rest(wk, "file name", tag::STR)?;
    let arr = wk.heap.arr_new();
    for name in names {
        let Some(path) = source_path(wk, name) else {
            wk.vm_error("files() arguments must be strings");
            return Err(());
        };
        let file = wk.heap.make_file(path);
        wk.heap.arr_push(arr, file);
    }
    Ok(arr)
}

fn include_directories(wk: &mut Workspace, _self: Obj, args: &mut CallArgs) -> NativeResult {
    let names = args.rest(wk, "directory", tag::STR)?;
    let is_system = args.kw_bool(wk, "is_system", false)?;
    let arr = wk.heap.arr_new();
    for name in names {
        let dir = wk.heap.str_display(name);
        let rel = wk.cur_subdir.join(dir);
        let path = wk.stri(rel.as_str());
        let inc = wk
            .heap
            .make_include_directory(IncludeDirectoryRecord { path, is_system });
        wk.heap.arr_push(arr, inc);
    }
    Ok(arr)
}

fn find_program(wk: &mut Workspace, _self: Obj, args: &mut CallArgs) -> NativeResult {
    let name = args.next_pos(wk, "program name", tag::STR)?;
    let required = required_kwarg(wk, args)?;
    let name_str = wk.heap.str_display(name);

    let found = locate_program(wk, &name_str);
    match found {
        Some(path) => {
            let path_obj = wk.stri(path.as_str());
            Ok(wk.heap.make_external_program(ExternalProgramRecord {
                name,
                path: path_obj,
                found: true,
            }))
        }
        None if required => {
            wk.vm_error(&format!("program '{name_str}' not found"));
            Err(())
        }
        None => Ok(wk.heap.make_external_program(ExternalProgramRecord {
            name,
            path: Obj::NULL,
            found: false,
        })),
    }
}

/// Resolve a program name: absolute and source-relative paths first, then
/// the `PATH` directories.
fn locate_program(wk: &Workspace, name: &str) -> Option<Utf8PathBuf> {
    let direct = Utf8PathBuf::from(name);
    if direct.is_absolute() {
        return std::fs::metadata(&direct).is_ok().then_some(direct);
    }
    let local = wk.current_source_dir().join(name);
    if std::fs::metadata(&local).is_ok() {
        return Some(local);
    }
    let path_var = std::env::var("PATH").unwrap_or_default();
    let sep = if cfg!(windows) { ';' } else { ':' };
    for dir in path_var.split(sep).filter(|d| !d.is_empty()) {
        let candidate = Utf8PathBuf::from(dir).join(name);
        if std::fs::metadata(&candidate).is_ok() {
            return Some(candidate);
        }
    }
    None
}

fn run_command(wk: &mut Workspace, _self: Obj, args: &mut CallArgs) -> NativeResult {
    let runnable = tag::STR.union(tag::EXTERNAL_PROGRAM).union(tag::COMPILER).union(tag::FILE);
    let parts = args.rest(wk, "command", runnable.listify())?;
    let check = args.kw_bool(wk, "check", false)?;

    let mut argv: Vec<String> = Vec::new();
    let mut compiler_version = None;
    let mut flattened = Vec::new();
    for part in parts {
        flattened.extend(wk.heap.arr_to_vec(part));
    }
    for (i, part) in flattened.iter().enumerate() {
        match wk.heap.typ(*part) {
            ObjType::Str => argv.push(wk.heap.str_display(*part)),
            ObjType::File => {
                if let Some(p) = wk.heap.file_path(*part) {
                    argv.push(p.to_string());
                }
            }
            ObjType::ExternalProgram => {
                let idx = wk.heap.record_idx(*part);
                let rec = &wk.heap.external_programs[idx];
                if !rec.found {
                    let n = wk.heap.str_display(rec.name);
                    wk.vm_error(&format!("cannot run unfound program '{n}'"));
                    return Err(());
                }
                argv.push(wk.heap.str_display(rec.path));
            }
            ObjType::Compiler if i == 0 => {
                let idx = wk.heap.record_idx(*part);
                let rec = &wk.heap.compilers[idx];
                compiler_version = Some(wk.heap.str_display(rec.version));
                argv.extend(wk.obj_to_argv(rec.cmd_array));
            }
            other => {
                wk.vm_error(&format!("cannot use {} in a command line", other.name()));
                return Err(());
            }
        }
    }
    if argv.is_empty() {
        wk.vm_error("run_command requires a command");
        return Err(());
    }

    // Compiler invocations go through the check cache; arbitrary
    // configure-time commands run every time.
    let record = match compiler_version {
        Some(version) => wk.check_cache.run_cached(&argv, &version, b""),
        None => {
            let mut throwaway = crate::toolchain::cache::CheckCache::new();
            throwaway.run_cached(&argv, "", b"")
        }
    };
    let record = match record {
        Ok(r) => r,
        Err(err) => {
            let msg = err.to_string();
            wk.vm_error(&msg);
            return Err(());
        }
    };
    if check && record.status != 0 {
        wk.vm_error(&format!(
            "command {:?} failed with status {}",
            argv.join(" "),
            record.status
        ));
        return Err(());
    }
    let out = wk.stri(&record.stdout);
    let err = wk.stri(&record.stderr);
    Ok(wk.heap.make_run_result(RunResultRecord { status: record.status, out, err }))
}

// ----------------------------------------------------------------------
// messages and assertions

fn message(wk: &mut Workspace, _self: Obj, args: &mut CallArgs) -> NativeResult {
    let values = args.rest(wk, "message", tag::ANY)?;
    let text: Vec<String> = values.iter().map(|v| wk.heap.obj_display(*v)).collect();
    println!("Message: {}", text.join(" "));
    Ok(Obj::NULL)
}

fn warning(wk: &mut Workspace, _self: Obj, args: &mut CallArgs) -> NativeResult {
    let values = args.rest(wk, "message", tag::ANY)?;
    let text: Vec<String> = values.iter().map(|v| wk.heap.obj_display(*v)).collect();
    let joined = text.join(" ");
    let ip = args.call_ip;
    wk.vm_warning_at(ip, &joined);
    Ok(Obj::NULL)
}

fn error_fn(wk: &mut Workspace, _self: Obj, args: &mut CallArgs) -> NativeResult {
    let values = args.rest(wk, "message", tag::ANY)?;
    let text: Vec<String> = values.iter().map(|v| wk.heap.obj_display(*v)).collect();
    let joined = text.join(" ");
    wk.vm_error(&joined);
    Err(())
}

fn assert_fn(wk: &mut Workspace, _self: Obj, args: &mut CallArgs) -> NativeResult {
    let cond = args.next_pos(wk, "condition", tag::BOOL)?;
    let msg = args.opt_pos(wk, "message", tag::STR)?;
    if cond == Obj::TRUE {
        return Ok(Obj::NULL);
    }
    let text = msg.map_or_else(|| "assertion failed".to_owned(), |m| {
        format!("assertion failed: {}", wk.heap.str_display(m))
    });
    wk.vm_error(&text);
    Err(())
}

// ----------------------------------------------------------------------
// configuration objects

fn environment(wk: &mut Workspace, _self: Obj, args: &mut CallArgs) -> NativeResult {
    let actions = wk.heap.arr_new();
    if let Some(init) = args.opt_pos(wk, "environment", tag::DICT)? {
        let set_op = wk.stri("set");
        for (key, value) in wk.heap.dict_iter(init).collect::<Vec<_>>() {
            let crate::lang::object::DictKey::Str(key) = key else { continue };
            let entry = wk.heap.arr_from_vec(&[set_op, key, value]);
            wk.heap.arr_push(actions, entry);
        }
    }
    Ok(wk.heap.make_environment(EnvironmentRecord { actions }))
}

fn configuration_data(wk: &mut Workspace, _self: Obj, args: &mut CallArgs) -> NativeResult {
    let data = match args.opt_pos(wk, "data", tag::DICT)? {
        Some(init) => wk.heap.dict_dup(init),
        None => wk.heap.dict_new(),
    };
    Ok(wk.heap.make_configuration_data(ConfigurationDataRecord { data }))
}

fn get_option(wk: &mut Workspace, _self: Obj, args: &mut CallArgs) -> NativeResult {
    let name = args.next_pos(wk, "option name", tag::STR)?;
    let name_str = wk.heap.str_display(name);
    match wk.options.value(&name_str) {
        Some(value) => Ok(value),
        None => {
            wk.vm_error(&format!("unknown option '{name_str}'"));
            Err(())
        }
    }
}

/// `option()` declarations from an options file.
fn option_fn(wk: &mut Workspace, _self: Obj, args: &mut CallArgs) -> NativeResult {
    let name = args.next_pos(wk, "option name", tag::STR)?;
    let typ = match args.kw_str(wk, "type")? {
        Some(t) => t,
        None => {
            wk.vm_error("option() requires a type");
            return Err(());
        }
    };
    let typ_str = wk.heap.str_display(typ);
    let typ = match typ_str.as_str() {
        "string" => crate::options::OptionType::String,
        "boolean" => crate::options::OptionType::Boolean,
        "combo" => crate::options::OptionType::Combo,
        "integer" => crate::options::OptionType::Integer,
        "array" => crate::options::OptionType::Array,
        "feature" => crate::options::OptionType::Feature,
        other => {
            wk.vm_error(&format!("unknown option type '{other}'"));
            return Err(());
        }
    };
    let value = args.kw(wk, "value", tag::ANY)?;
    let choices = args.kw(wk, "choices", tag::STR.listify())?;
    let min = args.kw(wk, "min", tag::NUMBER)?.and_then(|v| wk.heap.number(v));
    let max = args.kw(wk, "max", tag::NUMBER)?.and_then(|v| wk.heap.number(v));
    let description = args
        .kw_str(wk, "description")?
        .map(|d| wk.heap.str_display(d))
        .unwrap_or_default();

    let default_value = match value {
        Some(v) => v,
        None => match typ {
            crate::options::OptionType::Boolean => Obj::TRUE,
            crate::options::OptionType::Feature => wk.heap.make_feature(FeatureState::Auto),
            crate::options::OptionType::Array => wk.heap.arr_new(),
            crate::options::OptionType::Integer => wk.heap.make_number(0),
            _ => wk.stri(""),
        },
    };
    let name_str = wk.heap.str_display(name);
    wk.options.declare_project(crate::options::OptionRecord {
        name: name_str,
        typ,
        choices: choices
            .map(|c| wk.heap.arr_to_vec(c).iter().map(|o| wk.heap.str_display(*o)).collect())
            .unwrap_or_default(),
        min,
        max,
        value: default_value,
        source: OptionSource::Default,
        description,
        subproject: None,
    });
    Ok(Obj::NULL)
}

fn add_arguments(
    wk: &mut Workspace,
    args: &mut CallArgs,
    global: bool,
) -> NativeResult {
    require_project(wk, "argument registration")?;
    let values = args.rest(wk, "argument", tag::STR)?;
    let langs = match args.kw(wk, "language", tag::STR.listify())? {
        Some(v) => wk.heap.arr_to_vec(v),
        None => {
            wk.vm_error("missing keyword argument language");
            return Err(());
        }
    };
    for lang_obj in langs {
        let lang_name = wk.heap.str_display(lang_obj);
        let Some(lang) = Language::from_str(&lang_name) else {
            wk.vm_error(&format!("unsupported language '{lang_name}'"));
            return Err(());
        };
        let key = (MachineKind::Host, lang);
        let arr = {
            let Some(project) = wk.projects.last() else { return Err(()) };
            let map = if global { &project.global_args } else { &project.project_args };
            map.get(&key).copied()
        };
        let arr = match arr {
            Some(a) => a,
            None => {
                let a = wk.heap.arr_new();
                if let Some(project) = wk.cur_project() {
                    let map =
                        if global { &mut project.global_args } else { &mut project.project_args };
                    map.insert(key, a);
                }
                a
            }
        };
        for value in &values {
            wk.heap.arr_push(arr, *value);
        }
    }
    Ok(Obj::NULL)
}

fn add_project_arguments(wk: &mut Workspace, _self: Obj, args: &mut CallArgs) -> NativeResult {
    add_arguments(wk, args, false)
}

fn add_global_arguments(wk: &mut Workspace, _self: Obj, args: &mut CallArgs) -> NativeResult {
    add_arguments(wk, args, true)
}

// ----------------------------------------------------------------------
// tests and installation

fn test_fn(wk: &mut Workspace, _self: Obj, args: &mut CallArgs) -> NativeResult {
    require_project(wk, "test")?;
    let name = args.next_pos(wk, "test name", tag::STR)?;
    let exe = args.next_pos(
        wk,
        "test executable",
        tag::BUILD_TARGET.union(tag::EXTERNAL_PROGRAM).union(tag::FILE),
    )?;
    let test_args =
        args.kw(wk, "args", tag::STR.union(tag::FILE).listify())?.unwrap_or_else(|| wk.heap.arr_new());
    let env = args.kw(wk, "env", tag::ENVIRONMENT.union(tag::STR).listify())?.unwrap_or(Obj::NULL);
    let should_fail = args.kw_bool(wk, "should_fail", false)?;
    let timeout = args.kw(wk, "timeout", tag::NUMBER)?.and_then(|v| wk.heap.number(v)).unwrap_or(30);
    let workdir = args.kw_str(wk, "workdir")?.unwrap_or(Obj::NULL);
    let suites = args.kw(wk, "suite", tag::STR.listify())?.unwrap_or_else(|| wk.heap.arr_new());

    let record = TestRecord { name, exe, args: test_args, env, should_fail, timeout, workdir, suites };
    let test = wk.heap.make_test(record);
    if let Some(project) = wk.cur_project() {
        project.tests.push(test);
    }
    Ok(Obj::NULL)
}

fn install_data(wk: &mut Workspace, _self: Obj, args: &mut CallArgs) -> NativeResult {
    require_project(wk, "install_data")?;
    let sources = args.rest(wk, "file", tag::STR.union(tag::FILE))?;
    let dest = args.kw_str(wk, "install_dir")?.unwrap_or_else(|| wk.stri("share"));
    for src in sources {
        let Some(path) = source_path(wk, src) else { continue };
        let src_obj = wk.stri(path.as_str());
        let target = wk.heap.make_install_target(InstallTargetRecord {
            src: src_obj,
            dest,
            mode: Obj::NULL,
        });
        if let Some(project) = wk.cur_project() {
            project.install.push(target);
        }
    }
    Ok(Obj::NULL)
}

// ----------------------------------------------------------------------
// modules, variables, and control

/// Module implementations are external collaborators; `import()` resolves
/// to a not-found module unless the module is required.
fn import(wk: &mut Workspace, _self: Obj, args: &mut CallArgs) -> NativeResult {
    let name = args.next_pos(wk, "module name", tag::STR)?;
    let required = required_kwarg(wk, args)?;
    if required {
        let n = wk.heap.str_display(name);
        wk.vm_error(&format!("module '{n}' is not available"));
        return Err(());
    }
    Ok(wk.heap.make_module(ModuleRecord { name, found: false }))
}

fn subdir(wk: &mut Workspace, _self: Obj, args: &mut CallArgs) -> NativeResult {
    let name = args.next_pos(wk, "directory", tag::STR)?;
    let dir = wk.heap.str_display(name);
    let saved = wk.cur_subdir.clone();
    wk.cur_subdir = saved.join(&dir);
    let path = wk.current_source_dir().join("meson.build");
    let result = wk.eval_file(&path);
    wk.cur_subdir = saved;
    result.map(|_| Obj::NULL)
}

fn join_paths(wk: &mut Workspace, _self: Obj, args: &mut CallArgs) -> NativeResult {
    let parts = args.rest(wk, "path", tag::STR)?;
    let mut out = Utf8PathBuf::new();
    for part in parts {
        let s = wk.heap.str_display(part);
        if Utf8PathBuf::from(&s).is_absolute() {
            out = Utf8PathBuf::from(&s);
        } else {
            out = out.join(&s);
        }
    }
    Ok(wk.stri(out.as_str()))
}

fn summary(wk: &mut Workspace, _self: Obj, args: &mut CallArgs) -> NativeResult {
    require_project(wk, "summary")?;
    let first = args.next_pos(wk, "summary", tag::STR.union(tag::DICT))?;
    let summary = wk.projects.last().map(|p| p.summary).unwrap_or(Obj::NULL);
    if wk.heap.typ(first) == ObjType::Dict {
        for (k, v) in wk.heap.dict_iter(first).collect::<Vec<_>>() {
            wk.heap.dict_set(summary, k, v);
        }
    } else {
        let value = args.next_pos(wk, "value", tag::ANY)?;
        wk.heap.dict_set_str(summary, first, value);
    }
    Ok(Obj::NULL)
}

fn range(wk: &mut Workspace, _self: Obj, args: &mut CallArgs) -> NativeResult {
    let first = args.next_pos(wk, "stop", tag::NUMBER)?;
    let second = args.opt_pos(wk, "stop", tag::NUMBER)?;
    let third = args.opt_pos(wk, "step", tag::NUMBER)?;
    let a = wk.heap.number(first).unwrap_or(0);
    let (start, end) = match second {
        Some(s) => (a, wk.heap.number(s).unwrap_or(0)),
        None => (0, a),
    };
    let step = third.map_or(1, |s| wk.heap.number(s).unwrap_or(1));
    if step == 0 {
        wk.vm_error("range() step must not be zero");
        return Err(());
    }
    Ok(wk.heap.make_iterator(IterState::Range { cur: start, end, step }))
}

fn disabler(wk: &mut Workspace, _self: Obj, _args: &mut CallArgs) -> NativeResult {
    let _ = wk;
    Ok(Obj::DISABLER)
}

fn is_disabler(wk: &mut Workspace, _self: Obj, args: &mut CallArgs) -> NativeResult {
    let value = args.next_pos(wk, "value", tag::ANY)?;
    Ok(wk.heap.make_bool(value == Obj::DISABLER))
}

fn set_variable(wk: &mut Workspace, _self: Obj, args: &mut CallArgs) -> NativeResult {
    let name = args.next_pos(wk, "variable name", tag::STR)?;
    let value = args.next_pos(wk, "value", tag::ANY)?;
    wk.scope_store(name, value);
    Ok(Obj::NULL)
}

fn get_variable(wk: &mut Workspace, _self: Obj, args: &mut CallArgs) -> NativeResult {
    let name = args.next_pos(wk, "variable name", tag::STR)?;
    let default = args.opt_pos(wk, "default", tag::ANY)?;
    match wk.scope_lookup(name).or(default) {
        Some(value) => Ok(value),
        None => {
            let n = wk.heap.str_display(name);
            wk.vm_error(&format!("{n} is not defined"));
            Err(())
        }
    }
}

fn is_variable(wk: &mut Workspace, _self: Obj, args: &mut CallArgs) -> NativeResult {
    let name = args.next_pos(wk, "variable name", tag::STR)?;
    let found = wk.scope_lookup(name).is_some();
    Ok(wk.heap.make_bool(found))
}

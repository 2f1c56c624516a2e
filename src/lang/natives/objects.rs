//! Methods on the typed build objects: compilers, machines, dependencies,
//! programs, run results, features, configuration data, environments, and
//! targets.

use camino::Utf8PathBuf;

use crate::lang::natives::{CallArgs, NativeRegistry, NativeResult};
use crate::lang::object::{
    DepParts, DependencyKind, DependencyRecord, FeatureState, Obj, ObjType, ObjValue,
};
use crate::lang::types::tag;
use crate::toolchain::{GenArgs, GenOutput};
use crate::workspace::Workspace;

pub fn register(reg: &mut NativeRegistry) {
    let c = ObjType::Compiler;
    reg.add_method(c, "get_id", compiler_get_id);
    reg.add_method(c, "version", compiler_version);
    reg.add_method(c, "cmd_array", compiler_cmd_array);
    reg.add_method(c, "compiles", compiler_compiles);
    reg.add_method(c, "run", compiler_run);
    reg.add_method(c, "has_argument", compiler_has_argument);

    let m = ObjType::Machine;
    reg.add_method(m, "system", machine_system);
    reg.add_method(m, "cpu_family", machine_cpu_family);
    reg.add_method(m, "cpu", machine_cpu);
    reg.add_method(m, "endian", machine_endian);

    let module = ObjType::Module;
    reg.add_method(module, "found", module_found);
    reg.add_method(module, "current_source_dir", meson_current_source_dir);
    reg.add_method(module, "current_build_dir", meson_current_build_dir);
    reg.add_method(module, "project_name", meson_project_name);
    reg.add_method(module, "project_version", meson_project_version);
    reg.add_method(module, "get_compiler", meson_get_compiler);
    reg.add_method(module, "version", meson_version);
    reg.add_method(module, "backend", meson_backend);
    reg.add_method(module, "is_subproject", meson_is_subproject);

    let d = ObjType::Dependency;
    reg.add_method(d, "found", dep_found);
    reg.add_method(d, "name", dep_name);
    reg.add_method(d, "version", dep_version);
    reg.add_method(d, "get_variable", dep_get_variable);
    reg.add_method(d, "partial_dependency", dep_partial);
    reg.add_method(d, "as_system", dep_as_system);

    let p = ObjType::ExternalProgram;
    reg.add_method(p, "found", program_found);
    reg.add_method(p, "path", program_path);
    reg.add_method(p, "full_path", program_path);

    let r = ObjType::RunResult;
    reg.add_method(r, "returncode", run_returncode);
    reg.add_method(r, "stdout", run_stdout);
    reg.add_method(r, "stderr", run_stderr);

    let f = ObjType::FeatureOpt;
    reg.add_method(f, "enabled", feature_enabled);
    reg.add_method(f, "disabled", feature_disabled);
    reg.add_method(f, "auto", feature_auto);
    reg.add_method(f, "allowed", feature_allowed);
    reg.add_method(f, "require", feature_require);

    let cd = ObjType::ConfigurationData;
    reg.add_method(cd, "set", cfg_set);
    reg.add_method(cd, "set10", cfg_set10);
    reg.add_method(cd, "set_quoted", cfg_set_quoted);
    reg.add_method(cd, "get", cfg_get);
    reg.add_method(cd, "has", cfg_has);

    let e = ObjType::Environment;
    reg.add_method(e, "set", env_set);
    reg.add_method(e, "append", env_append);
    reg.add_method(e, "prepend", env_prepend);

    let t = ObjType::BuildTarget;
    reg.add_method(t, "name", target_name);
    reg.add_method(t, "full_path", target_full_path);

    let ct = ObjType::CustomTarget;
    reg.add_method(ct, "full_path", custom_target_full_path);

    let bl = ObjType::BothLibs;
    reg.add_method(bl, "get_static_lib", both_get_static);
    reg.add_method(bl, "get_shared_lib", both_get_shared);
}

// ----------------------------------------------------------------------
// compiler

fn compiler_get_id(wk: &mut Workspace, this: Obj, _args: &mut CallArgs) -> NativeResult {
    let idx = wk.heap.record_idx(this);
    let id = wk.heap.compilers[idx].kind.id();
    Ok(wk.stri(id))
}

fn compiler_version(wk: &mut Workspace, this: Obj, _args: &mut CallArgs) -> NativeResult {
    let idx = wk.heap.record_idx(this);
    Ok(wk.heap.compilers[idx].version)
}

fn compiler_cmd_array(wk: &mut Workspace, this: Obj, _args: &mut CallArgs) -> NativeResult {
    let idx = wk.heap.record_idx(this);
    let cmd = wk.heap.compilers[idx].cmd_array;
    Ok(wk.heap.arr_dup_light(cmd))
}

/// Run a feature-test compile through the check cache. The scratch source
/// file is named after the check fingerprint, so identical checks reuse
/// both the file and the recorded result.
fn check_compile(
    wk: &mut Workspace,
    this: Obj,
    source: &str,
    link: bool,
    extra_args: &[String],
) -> Result<crate::toolchain::cache::CheckRecord, ()> {
    let idx = wk.heap.record_idx(this);
    let rec = &wk.heap.compilers[idx];
    let version = wk.heap.str_display(rec.version);
    let mut argv = wk.obj_to_argv(rec.cmd_array);
    argv.extend_from_slice(extra_args);

    let key = crate::toolchain::cache::CheckCache::fingerprint(&argv, &version, source.as_bytes());
    let scratch = std::env::temp_dir().join(format!("kiln-check-{}.c", &key[..16]));
    let Some(scratch) = Utf8PathBuf::from_path_buf(scratch).ok() else {
        wk.vm_error("scratch directory is not valid UTF-8");
        return Err(());
    };
    if std::fs::write(&scratch, source).is_err() {
        wk.vm_error(&format!("failed to write {scratch}"));
        return Err(());
    }
    let out = format!("{scratch}.out");
    if !link
        && let Some(GenOutput::Args(flags)) = wk.compiler_args(this, "compile_only", &GenArgs::None)
    {
        argv.extend(flags);
    }
    argv.push(scratch.to_string());
    if let Some(GenOutput::Args(flags)) = wk.compiler_args(this, "output", &GenArgs::S(&out)) {
        argv.extend(flags);
    }
    match wk.check_cache.run_cached(&argv, &version, source.as_bytes()) {
        Ok(record) => Ok(record),
        Err(err) => {
            let msg = err.to_string();
            wk.vm_error(&msg);
            Err(())
        }
    }
}

fn compiler_compiles(wk: &mut Workspace, this: Obj, args: &mut CallArgs) -> NativeResult {
    let code = args.next_pos(wk, "code", tag::STR)?;
    let _name = args.kw_str(wk, "name")?;
    let source = wk.heap.str_display(code);
    let record = check_compile(wk, this, &source, false, &[])?;
    Ok(wk.heap.make_bool(record.success))
}

/// Compile, link, and execute a test program, reporting the program's own
/// exit status and output. The compile side is cached; the execution is
/// not, since the produced binary may not be deterministic.
fn compiler_run(wk: &mut Workspace, this: Obj, args: &mut CallArgs) -> NativeResult {
    let code = args.next_pos(wk, "code", tag::STR)?;
    let source = wk.heap.str_display(code);
    let record = check_compile(wk, this, &source, true, &[])?;
    if !record.success {
        let out = wk.stri(&record.stdout);
        let err = wk.stri(&record.stderr);
        return Ok(wk.heap.make_run_result(crate::lang::object::RunResultRecord {
            status: record.status,
            out,
            err,
        }));
    }
    let binary = check_output_path(wk, this, &source)?;
    let output = std::process::Command::new(&binary).output();
    match output {
        Ok(output) => {
            let status = output.status.code().unwrap_or(-1);
            let out_text = String::from_utf8_lossy(&output.stdout).into_owned();
            let err_text = String::from_utf8_lossy(&output.stderr).into_owned();
            let out = wk.stri(&out_text);
            let err = wk.stri(&err_text);
            Ok(wk.heap.make_run_result(crate::lang::object::RunResultRecord { status, out, err }))
        }
        Err(err) => {
            wk.vm_error(&format!("failed to run test binary {binary}: {err}"));
            Err(())
        }
    }
}

/// The artifact path a linked check compile produced; mirrors the naming
/// inside `check_compile`.
fn check_output_path(wk: &mut Workspace, this: Obj, source: &str) -> Result<Utf8PathBuf, ()> {
    let idx = wk.heap.record_idx(this);
    let rec = &wk.heap.compilers[idx];
    let version = wk.heap.str_display(rec.version);
    let argv = wk.obj_to_argv(rec.cmd_array);
    let key =
        crate::toolchain::cache::CheckCache::fingerprint(&argv, &version, source.as_bytes());
    let scratch = std::env::temp_dir().join(format!("kiln-check-{}.c", &key[..16]));
    match Utf8PathBuf::from_path_buf(scratch) {
        Ok(path) => Ok(Utf8PathBuf::from(format!("{path}.out"))),
        Err(_) => {
            wk.vm_error("scratch directory is not valid UTF-8");
            Err(())
        }
    }
}

fn compiler_has_argument(wk: &mut Workspace, this: Obj, args: &mut CallArgs) -> NativeResult {
    let arg = args.next_pos(wk, "argument", tag::STR)?;
    let arg = wk.heap.str_display(arg);
    // Capability query first, then a real probe compile with the flag on
    // the command line.
    if let Some(GenOutput::Flag(true)) =
        wk.compiler_args(this, "accepts_argument", &GenArgs::S(&arg))
    {
        let source = "int main(void) { return 0; }";
        let werror: Vec<String> = match wk.compiler_args(this, "werror", &GenArgs::None) {
            Some(GenOutput::Args(flags)) => flags,
            _ => Vec::new(),
        };
        let mut extra = werror;
        extra.push(arg);
        let record = check_compile(wk, this, source, false, &extra)?;
        return Ok(wk.heap.make_bool(record.success));
    }
    Ok(Obj::FALSE)
}

// ----------------------------------------------------------------------
// machines

fn machine_field(wk: &mut Workspace, this: Obj, field: fn(&crate::machines::Machine) -> String) -> NativeResult {
    let ObjValue::Machine(kind) = wk.heap.get(this) else {
        wk.vm_error("not a machine");
        return Err(());
    };
    let value = field(wk.machine(kind));
    Ok(wk.stri(&value))
}

fn machine_system(wk: &mut Workspace, this: Obj, _args: &mut CallArgs) -> NativeResult {
    machine_field(wk, this, |m| m.system.clone())
}

fn machine_cpu_family(wk: &mut Workspace, this: Obj, _args: &mut CallArgs) -> NativeResult {
    machine_field(wk, this, |m| m.cpu_family.clone())
}

fn machine_cpu(wk: &mut Workspace, this: Obj, _args: &mut CallArgs) -> NativeResult {
    machine_field(wk, this, |m| m.cpu.clone())
}

fn machine_endian(wk: &mut Workspace, this: Obj, _args: &mut CallArgs) -> NativeResult {
    machine_field(wk, this, |m| {
        match m.endian {
            crate::machines::Endianness::Little => "little",
            crate::machines::Endianness::Big => "big",
        }
        .to_owned()
    })
}

// ----------------------------------------------------------------------
// the meson object (and imported modules)

fn module_found(wk: &mut Workspace, this: Obj, _args: &mut CallArgs) -> NativeResult {
    let idx = wk.heap.record_idx(this);
    let found = wk.heap.modules[idx].found;
    Ok(wk.heap.make_bool(found))
}

fn meson_current_source_dir(wk: &mut Workspace, _this: Obj, _args: &mut CallArgs) -> NativeResult {
    let dir = wk.current_source_dir();
    Ok(wk.stri(dir.as_str()))
}

fn meson_current_build_dir(wk: &mut Workspace, _this: Obj, _args: &mut CallArgs) -> NativeResult {
    let dir = wk.current_build_dir();
    Ok(wk.stri(dir.as_str()))
}

fn meson_project_name(wk: &mut Workspace, _this: Obj, _args: &mut CallArgs) -> NativeResult {
    match wk.projects.last() {
        Some(project) => Ok(project.name),
        None => {
            wk.vm_error("project() has not been called");
            Err(())
        }
    }
}

fn meson_project_version(wk: &mut Workspace, _this: Obj, _args: &mut CallArgs) -> NativeResult {
    match wk.projects.last() {
        Some(project) => Ok(project.version),
        None => {
            wk.vm_error("project() has not been called");
            Err(())
        }
    }
}

fn meson_get_compiler(wk: &mut Workspace, _this: Obj, args: &mut CallArgs) -> NativeResult {
    let lang = args.next_pos(wk, "language", tag::STR)?;
    let native = args.kw_bool(wk, "native", false)?;
    let lang_str = wk.heap.str_display(lang);
    let Some(lang) = crate::toolchain::Language::from_str(&lang_str) else {
        wk.vm_error(&format!("unsupported language '{lang_str}'"));
        return Err(());
    };
    let machine = if native {
        crate::machines::MachineKind::Build
    } else {
        crate::machines::MachineKind::Host
    };
    match wk.compiler_for(machine, lang) {
        Ok(compiler) => Ok(compiler),
        Err(err) => {
            let msg = err.to_string();
            wk.vm_error(&msg);
            Err(())
        }
    }
}

fn meson_version(wk: &mut Workspace, _this: Obj, _args: &mut CallArgs) -> NativeResult {
    Ok(wk.stri(env!("CARGO_PKG_VERSION")))
}

fn meson_backend(wk: &mut Workspace, _this: Obj, _args: &mut CallArgs) -> NativeResult {
    Ok(wk.stri("ninja"))
}

fn meson_is_subproject(wk: &mut Workspace, _this: Obj, _args: &mut CallArgs) -> NativeResult {
    let nested = wk.projects.len() > 1;
    Ok(wk.heap.make_bool(nested))
}

// ----------------------------------------------------------------------
// dependencies

fn dep_found(wk: &mut Workspace, this: Obj, _args: &mut CallArgs) -> NativeResult {
    let idx = wk.heap.record_idx(this);
    let found = wk.heap.dependencies[idx].kind != DependencyKind::NotFound;
    Ok(wk.heap.make_bool(found))
}

fn dep_name(wk: &mut Workspace, this: Obj, _args: &mut CallArgs) -> NativeResult {
    let idx = wk.heap.record_idx(this);
    Ok(wk.heap.dependencies[idx].name)
}

fn dep_version(wk: &mut Workspace, this: Obj, _args: &mut CallArgs) -> NativeResult {
    let idx = wk.heap.record_idx(this);
    let version = wk.heap.dependencies[idx].version;
    if version == Obj::NULL { Ok(wk.stri("undefined")) } else { Ok(version) }
}

fn dep_get_variable(wk: &mut Workspace, _this: Obj, args: &mut CallArgs) -> NativeResult {
    let name = args.next_pos(wk, "variable", tag::STR)?;
    let default = args.kw(wk, "default_value", tag::STR)?;
    match default {
        Some(value) => Ok(value),
        None => {
            let n = wk.heap.str_display(name);
            wk.vm_error(&format!("dependency variable '{n}' not found"));
            Err(())
        }
    }
}

/// Copy the dependency keeping only the requested parts.
fn dep_partial(wk: &mut Workspace, this: Obj, args: &mut CallArgs) -> NativeResult {
    let parts = DepParts {
        compile_args: args.kw_bool(wk, "compile_args", false)?,
        includes: args.kw_bool(wk, "includes", false)?,
        link_args: args.kw_bool(wk, "link_args", false)?,
        links: args.kw_bool(wk, "links", false)?,
        sources: args.kw_bool(wk, "sources", false)?,
    };
    let idx = wk.heap.record_idx(this);
    let mut record = wk.heap.dependencies[idx].clone();
    record.dep.parts = parts;
    Ok(wk.heap.make_dependency(record))
}

fn dep_as_system(wk: &mut Workspace, this: Obj, _args: &mut CallArgs) -> NativeResult {
    let idx = wk.heap.record_idx(this);
    let record: DependencyRecord = wk.heap.dependencies[idx].clone();
    Ok(wk.heap.make_dependency(record))
}

// ----------------------------------------------------------------------
// programs and run results

fn program_found(wk: &mut Workspace, this: Obj, _args: &mut CallArgs) -> NativeResult {
    let idx = wk.heap.record_idx(this);
    let found = wk.heap.external_programs[idx].found;
    Ok(wk.heap.make_bool(found))
}

fn program_path(wk: &mut Workspace, this: Obj, _args: &mut CallArgs) -> NativeResult {
    let idx = wk.heap.record_idx(this);
    let rec = &wk.heap.external_programs[idx];
    if !rec.found {
        let n = wk.heap.str_display(rec.name);
        wk.vm_error(&format!("program '{n}' was not found"));
        return Err(());
    }
    Ok(rec.path)
}

fn run_returncode(wk: &mut Workspace, this: Obj, _args: &mut CallArgs) -> NativeResult {
    let idx = wk.heap.record_idx(this);
    let status = i64::from(wk.heap.run_results[idx].status);
    Ok(wk.heap.make_number(status))
}

fn run_stdout(wk: &mut Workspace, this: Obj, _args: &mut CallArgs) -> NativeResult {
    let idx = wk.heap.record_idx(this);
    Ok(wk.heap.run_results[idx].out)
}

fn run_stderr(wk: &mut Workspace, this: Obj, _args: &mut CallArgs) -> NativeResult {
    let idx = wk.heap.record_idx(this);
    Ok(wk.heap.run_results[idx].err)
}

// ----------------------------------------------------------------------
// feature options

fn feature_state(wk: &Workspace, this: Obj) -> FeatureState {
    match wk.heap.get(this) {
        ObjValue::FeatureOpt(state) => state,
        _ => FeatureState::Auto,
    }
}

fn feature_enabled(wk: &mut Workspace, this: Obj, _args: &mut CallArgs) -> NativeResult {
    let state = feature_state(wk, this);
    Ok(wk.heap.make_bool(state == FeatureState::Enabled))
}

fn feature_disabled(wk: &mut Workspace, this: Obj, _args: &mut CallArgs) -> NativeResult {
    let state = feature_state(wk, this);
    Ok(wk.heap.make_bool(state == FeatureState::Disabled))
}

fn feature_auto(wk: &mut Workspace, this: Obj, _args: &mut CallArgs) -> NativeResult {
    let state = feature_state(wk, this);
    Ok(wk.heap.make_bool(state == FeatureState::Auto))
}

fn feature_allowed(wk: &mut Workspace, this: Obj, _args: &mut CallArgs) -> NativeResult {
    let state = feature_state(wk, this);
    Ok(wk.heap.make_bool(state != FeatureState::Disabled))
}

fn feature_require(wk: &mut Workspace, this: Obj, args: &mut CallArgs) -> NativeResult {
    let cond = args.next_pos(wk, "condition", tag::BOOL)?;
    let msg = args.kw_str(wk, "error_message")?;
    if cond == Obj::TRUE {
        return Ok(this);
    }
    if feature_state(wk, this) == FeatureState::Enabled {
        let text = msg.map_or_else(
            || "feature requirement not met".to_owned(),
            |m| wk.heap.str_display(m),
        );
        wk.vm_error(&text);
        return Err(());
    }
    Ok(wk.heap.make_feature(FeatureState::Disabled))
}

// ----------------------------------------------------------------------
// configuration data

fn cfg_data_dict(wk: &Workspace, this: Obj) -> Obj {
    let idx = wk.heap.record_idx(this);
    wk.heap.configuration_datas[idx].data
}

fn cfg_set(wk: &mut Workspace, this: Obj, args: &mut CallArgs) -> NativeResult {
    let name = args.next_pos(wk, "name", tag::STR)?;
    let value = args.next_pos(wk, "value", tag::STR.union(tag::NUMBER).union(tag::BOOL))?;
    let dict = cfg_data_dict(wk, this);
    wk.heap.dict_set_str(dict, name, value);
    Ok(Obj::NULL)
}

fn cfg_set10(wk: &mut Workspace, this: Obj, args: &mut CallArgs) -> NativeResult {
    let name = args.next_pos(wk, "name", tag::STR)?;
    let value = args.next_pos(wk, "value", tag::BOOL)?;
    let number = wk.heap.make_number(i64::from(value == Obj::TRUE));
    let dict = cfg_data_dict(wk, this);
    wk.heap.dict_set_str(dict, name, number);
    Ok(Obj::NULL)
}

fn cfg_set_quoted(wk: &mut Workspace, this: Obj, args: &mut CallArgs) -> NativeResult {
    let name = args.next_pos(wk, "name", tag::STR)?;
    let value = args.next_pos(wk, "value", tag::STR)?;
    let quoted = format!("\"{}\"", wk.heap.str_display(value));
    let quoted = wk.stri(&quoted);
    let dict = cfg_data_dict(wk, this);
    wk.heap.dict_set_str(dict, name, quoted);
    Ok(Obj::NULL)
}

fn cfg_get(wk: &mut Workspace, this: Obj, args: &mut CallArgs) -> NativeResult {
    let name = args.next_pos(wk, "name", tag::STR)?;
    let default = args.opt_pos(wk, "default", tag::ANY)?;
    let dict = cfg_data_dict(wk, this);
    match wk.heap.dict_get_str(dict, name).or(default) {
        Some(value) => Ok(value),
        None => {
            let n = wk.heap.str_display(name);
            wk.vm_error(&format!("configuration value '{n}' not set"));
            Err(())
        }
    }
}

fn cfg_has(wk: &mut Workspace, this: Obj, args: &mut CallArgs) -> NativeResult {
    let name = args.next_pos(wk, "name", tag::STR)?;
    let dict = cfg_data_dict(wk, this);
    let found = wk.heap.dict_get_str(dict, name).is_some();
    Ok(wk.heap.make_bool(found))
}

// ----------------------------------------------------------------------
// environments

fn env_action(wk: &mut Workspace, this: Obj, args: &mut CallArgs, op: &str) -> NativeResult {
    let name = args.next_pos(wk, "variable", tag::STR)?;
    let values = args.rest(wk, "value", tag::STR)?;
    let sep = args.kw_str(wk, "separator")?;
    let idx = wk.heap.record_idx(this);
    let actions = wk.heap.environments[idx].actions;
    let op = wk.stri(op);
    let mut entry = vec![op, name];
    entry.extend(values);
    if let Some(sep) = sep {
        entry.push(sep);
    }
    let entry = wk.heap.arr_from_vec(&entry);
    wk.heap.arr_push(actions, entry);
    Ok(Obj::NULL)
}

fn env_set(wk: &mut Workspace, this: Obj, args: &mut CallArgs) -> NativeResult {
    env_action(wk, this, args, "set")
}

fn env_append(wk: &mut Workspace, this: Obj, args: &mut CallArgs) -> NativeResult {
    env_action(wk, this, args, "append")
}

fn env_prepend(wk: &mut Workspace, this: Obj, args: &mut CallArgs) -> NativeResult {
    env_action(wk, this, args, "prepend")
}

// ----------------------------------------------------------------------
// targets

fn target_name(wk: &mut Workspace, this: Obj, _args: &mut CallArgs) -> NativeResult {
    let idx = wk.heap.record_idx(this);
    Ok(wk.heap.build_targets[idx].name)
}

fn target_full_path(wk: &mut Workspace, this: Obj, _args: &mut CallArgs) -> NativeResult {
    let idx = wk.heap.record_idx(this);
    let rec = &wk.heap.build_targets[idx];
    let build_dir = wk.heap.str_display(rec.build_dir);
    let filename = wk.heap.str_display(rec.filename);
    let full = wk.build_root.join(build_dir).join(filename);
    Ok(wk.stri(full.as_str()))
}

fn custom_target_full_path(wk: &mut Workspace, this: Obj, _args: &mut CallArgs) -> NativeResult {
    let idx = wk.heap.record_idx(this);
    let rec = &wk.heap.custom_targets[idx];
    let Some(first) = wk.heap.arr_get(rec.outputs, 0) else {
        wk.vm_error("custom target has no outputs");
        return Err(());
    };
    let name = wk.heap.str_display(first);
    let full = wk.build_root.join(name);
    Ok(wk.stri(full.as_str()))
}

fn both_get_static(wk: &mut Workspace, this: Obj, _args: &mut CallArgs) -> NativeResult {
    let idx = wk.heap.record_idx(this);
    Ok(wk.heap.both_libs[idx].static_lib)
}

fn both_get_shared(wk: &mut Workspace, this: Obj, _args: &mut CallArgs) -> NativeResult {
    let idx = wk.heap.record_idx(this);
    Ok(wk.heap.both_libs[idx].shared_lib)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_and_feature_methods_work() {
        let mut wk = Workspace::bare();
        wk.eval_snippet("s = host_machine.system()\ncpu = host_machine.cpu_family()")
            .expect("eval");
        let s = wk.scope_lookup_bytes(b"s").expect("s");
        assert!(!wk.heap.str_bytes(s).is_empty());
    }

    #[test]
    fn configuration_data_set_and_get() {
        let mut wk = Workspace::bare();
        wk.eval_snippet(
            "cfg = configuration_data()\ncfg.set('NAME', 'kiln')\ncfg.set10('FLAG', true)\nx = cfg.get('NAME')\ny = cfg.get('FLAG')\nz = cfg.get('MISSING', 'dflt')",
        )
        .expect("eval");
        let x = wk.scope_lookup_bytes(b"x").expect("x");
        assert_eq!(wk.heap.str_bytes(x), b"kiln");
        let y = wk.scope_lookup_bytes(b"y").expect("y");
        assert_eq!(wk.heap.number(y), Some(1));
        let z = wk.scope_lookup_bytes(b"z").expect("z");
        assert_eq!(wk.heap.str_bytes(z), b"dflt");
    }

    #[test]
    fn meson_object_reports_backend() {
        let mut wk = Workspace::bare();
        wk.eval_snippet("b = meson.backend()").expect("eval");
        let b = wk.scope_lookup_bytes(b"b").expect("b");
        assert_eq!(wk.heap.str_bytes(b), b"ninja");
    }
}

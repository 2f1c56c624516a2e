//! End-to-end language semantics through the full pipeline: lexer,
//! parser, compiler, and VM, driven via a workspace.

use kiln::lang::object::{Obj, ObjType};
use kiln::options::OptionSource;
use kiln::workspace::Workspace;
use rstest::rstest;

fn eval_ok(script: &str) -> Workspace {
    let mut wk = Workspace::bare();
    let result = wk.eval_snippet(script);
    if result.is_err() {
        let mut buf = Vec::new();
        wk.diags.replay(&wk.sources, &mut buf).expect("replay");
        panic!("evaluation failed:\n{}", String::from_utf8_lossy(&buf));
    }
    wk
}

fn eval_err(script: &str) -> Workspace {
    let mut wk = Workspace::bare();
    assert!(wk.eval_snippet(script).is_err(), "expected failure: {script}");
    wk
}

fn var(wk: &Workspace, name: &str) -> Obj {
    wk.scope_lookup_bytes(name.as_bytes())
        .unwrap_or_else(|| panic!("variable {name} not bound"))
}

#[rstest]
fn closure_captures_are_deep_copied() {
    // The canonical closure scenario: mutating `x` after `make()` must
    // not affect the captured value.
    let wk = eval_ok(concat!(
        "x = 1\n",
        "func make() -> func\n",
        "  y = x\n",
        "  return (func() -> int\n",
        "    return y\n",
        "  endfunc)\n",
        "endfunc\n",
        "g = make()\n",
        "x = 99\n",
        "assert(g() == 1)\n",
    ));
    assert!(!wk.diags.has_errors());
}

#[rstest]
fn disabler_chain_evaluates_to_disabler() {
    let wk = eval_ok("d = disabler().foo().bar\nok = is_disabler(d)");
    assert_eq!(var(&wk, "ok"), Obj::TRUE);
}

#[rstest]
fn fstring_interpolates_and_stringifies() {
    let wk = eval_ok("who = 'world'\nn = 3\ns = f'hello @who@ x@n@'");
    assert_eq!(wk.heap.str_bytes(var(&wk, "s")), b"hello world x3");
}

#[rstest]
fn listify_parameter_accepts_single_and_list() {
    let wk = eval_ok(concat!(
        "func count(items: listify) -> int\n",
        "  return items.length()\n",
        "endfunc\n",
        "a = count('x')\n",
        "b = count(['x', 'y'])\n",
    ));
    assert_eq!(wk.heap.number(var(&wk, "a")), Some(1));
    assert_eq!(wk.heap.number(var(&wk, "b")), Some(2));
}

#[rstest]
fn typed_dict_parameter_rejects_wrong_value_type() {
    eval_err(concat!(
        "func takes(d: dict[int]) -> int\n",
        "  return 0\n",
        "endfunc\n",
        "takes({'k': 'not a number'})\n",
    ));
}

#[rstest]
fn typed_dict_parameter_accepts_matching_values() {
    let wk = eval_ok(concat!(
        "func takes(d: dict[int]) -> int\n",
        "  return d['k']\n",
        "endfunc\n",
        "v = takes({'k': 7})\n",
    ));
    assert_eq!(wk.heap.number(var(&wk, "v")), Some(7));
}

#[rstest]
fn diagnostics_are_deterministic_across_runs() {
    let script = "a = nope_one\nb = nope_two\nc = 'x' + 3";
    let render = |script: &str| {
        let mut wk = Workspace::bare();
        let _ = wk.eval_snippet(script);
        let mut buf = Vec::new();
        wk.diags.replay(&wk.sources, &mut buf).expect("replay");
        String::from_utf8(buf).expect("utf8")
    };
    assert_eq!(render(script), render(script));
}

#[rstest]
fn set_and_get_variable_roundtrip() {
    let wk = eval_ok("set_variable('answer', 42)\nv = get_variable('answer')\nw = get_variable('missing', 'dflt')");
    assert_eq!(wk.heap.number(var(&wk, "v")), Some(42));
    assert_eq!(wk.heap.str_bytes(var(&wk, "w")), b"dflt");
}

#[rstest]
fn range_iterates_like_an_array() {
    let wk = eval_ok("total = 0\nforeach i : range(1, 6, 2)\ntotal += i\nendforeach");
    assert_eq!(wk.heap.number(var(&wk, "total")), Some(9));
}

#[rstest]
fn declare_dependency_found_and_partial() {
    let wk = eval_ok(concat!(
        "dep = declare_dependency(compile_args: ['-DX'], link_args: ['-lm'])\n",
        "ok = dep.found()\n",
        "partial = dep.partial_dependency(compile_args: true)\n",
        "pok = partial.found()\n",
    ));
    assert_eq!(var(&wk, "ok"), Obj::TRUE);
    assert_eq!(var(&wk, "pok"), Obj::TRUE);
}

#[rstest]
fn import_without_required_yields_unfound_module() {
    let wk = eval_ok("m = import('qt5', required: false)\nok = m.found()");
    assert_eq!(var(&wk, "ok"), Obj::FALSE);
}

#[rstest]
fn import_of_missing_module_is_fatal_by_default() {
    eval_err("m = import('qt5')");
}

#[rstest]
fn get_option_reads_builtins_and_defines() {
    let mut wk = Workspace::bare();
    wk.options
        .set_from_str(&mut wk.heap, "warning_level", "3", OptionSource::Commandline)
        .expect("set");
    wk.eval_snippet("w = get_option('warning_level')\nd = get_option('debug')").expect("eval");
    assert_eq!(wk.heap.str_bytes(var(&wk, "w")), b"3");
    assert_eq!(var(&wk, "d"), Obj::TRUE);
}

#[rstest]
fn files_produce_file_objects() {
    let wk = eval_ok("f = files('a.c', 'sub/b.c')");
    let arr = var(&wk, "f");
    assert_eq!(wk.heap.arr_len(arr), 2);
    let first = wk.heap.arr_get(arr, 0).expect("file");
    assert_eq!(wk.heap.typ(first), ObjType::File);
}

#[rstest]
fn assertion_failures_are_reported_with_message() {
    let wk = eval_err("assert(1 == 2, 'math is broken')");
    let mut buf = Vec::new();
    wk.diags.replay(&wk.sources, &mut buf).expect("replay");
    let text = String::from_utf8(buf).expect("utf8");
    assert!(text.contains("assertion failed: math is broken"));
}

#[rstest]
#[serial_test::serial]
fn run_command_through_a_compiler_hits_the_check_cache() {
    let mut wk = Workspace::bare();
    wk.options
        .set_from_str(&mut wk.heap, "env.CC", "sh", OptionSource::Environment)
        .expect("set env.CC");
    wk.eval_snippet("project('p', 'c')").expect("project");

    wk.eval_snippet("cc = meson.get_compiler('c')\nr1 = run_command(cc, '--version')")
        .expect("first run");
    let spawns_after_first = wk.check_cache.spawn_count();
    wk.eval_snippet("r2 = run_command(cc, '--version')\nsame = r1.returncode() == r2.returncode()")
        .expect("second run");
    assert_eq!(
        wk.check_cache.spawn_count(),
        spawns_after_first,
        "second identical invocation must be served from the cache"
    );
    assert_eq!(var(&wk, "same"), Obj::TRUE);
}

#[rstest]
#[serial_test::serial]
fn project_configures_languages_and_summary() {
    let mut wk = Workspace::bare();
    wk.options
        .set_from_str(&mut wk.heap, "env.CC", "sh", OptionSource::Environment)
        .expect("set env.CC");
    wk.eval_snippet(concat!(
        "project('demo', 'c', version: '1.2.3')\n",
        "summary('lang', 'c')\n",
        "name = meson.project_name()\n",
        "ver = meson.project_version()\n",
    ))
    .expect("eval");
    assert_eq!(wk.heap.str_bytes(var(&wk, "name")), b"demo");
    assert_eq!(wk.heap.str_bytes(var(&wk, "ver")), b"1.2.3");
    assert_eq!(wk.projects.len(), 1);
}

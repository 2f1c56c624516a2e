//! Binary surface tests: the embedded engine CLI and the configure
//! pipeline, exercised through the real executable.

use assert_cmd::Command;
use predicates::prelude::*;

fn kiln() -> Command {
    Command::cargo_bin("kiln").expect("binary")
}

fn write(dir: &std::path::Path, name: &str, contents: &str) {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("mkdir");
    }
    std::fs::write(path, contents).expect("write");
}

#[test]
fn version_flag_prints_and_succeeds() {
    kiln().arg("version").assert().success().stdout(predicate::str::contains("kiln"));
}

#[test]
fn engine_reports_its_ninja_compat_version() {
    kiln()
        .args(["samu", "--version"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1.9.0"));
}

#[test]
fn engine_usage_error_exits_two() {
    kiln().args(["samu", "-z"]).assert().code(2);
}

#[test]
fn engine_builds_and_second_run_is_a_noop() {
    let dir = tempfile::tempdir().expect("tempdir");
    write(
        dir.path(),
        "build.ninja",
        concat!(
            "rule trace\n",
            "  command = echo ran-$out >> trace.log && touch $out\n",
            "build out.txt: trace\n",
        ),
    );
    kiln().args(["samu", "-C", dir.path().to_str().expect("utf8")]).assert().success();
    assert!(dir.path().join("out.txt").exists());

    kiln().args(["samu", "-C", dir.path().to_str().expect("utf8")]).assert().success();
    let trace = std::fs::read_to_string(dir.path().join("trace.log")).expect("trace");
    assert_eq!(trace.lines().count(), 1, "second build must not rerun the edge");
}

#[test]
fn manifest_cycle_reports_and_exits_one() {
    let dir = tempfile::tempdir().expect("tempdir");
    write(
        dir.path(),
        "build.ninja",
        concat!("rule r\n  command = :\n", "build a: r b\n", "build b: r a\n"),
    );
    kiln()
        .args(["samu", "-C", dir.path().to_str().expect("utf8"), "a"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("dependency cycle involving 'a'"));
}

#[test]
fn dry_run_spawns_no_commands() {
    let dir = tempfile::tempdir().expect("tempdir");
    write(
        dir.path(),
        "build.ninja",
        concat!("rule t\n  command = touch $out\n", "build out.txt: t\n"),
    );
    kiln()
        .args(["samu", "-C", dir.path().to_str().expect("utf8"), "-n"])
        .assert()
        .success()
        .stdout(predicate::str::contains("touch out.txt"));
    assert!(!dir.path().join("out.txt").exists());
}

#[test]
fn depfile_dependencies_are_recorded_and_enforced() {
    let dir = tempfile::tempdir().expect("tempdir");
    write(dir.path(), "dep.h", "#define X 1\n");
    write(
        dir.path(),
        "build.ninja",
        concat!(
            // Stands in for a compiler: fails if the header is gone,
            // otherwise emits a depfile naming it.
            "rule fakecc\n",
            "  command = test -f dep.h && printf '%s: dep.h\\n' $out > $out.d && echo built-$out >> trace.log && touch $out\n",
            "  depfile = $out.d\n",
            "  deps = gcc\n",
            "build a.o: fakecc\n",
        ),
    );
    let dirarg = dir.path().to_str().expect("utf8");
    kiln().args(["samu", "-C", dirarg]).assert().success();

    // The deps log now carries a node record for the output and a dep
    // record naming dep.h.
    let deps = std::fs::read(dir.path().join(".ninja_deps")).expect("deps log");
    assert!(deps.starts_with(b"# ninjadeps\n"));
    let body = String::from_utf8_lossy(&deps);
    assert!(body.contains("a.o"));
    assert!(body.contains("dep.h"));

    // Deleting the header dirties the output via its recorded dependency
    // and the recompile fails on the missing input.
    std::fs::remove_file(dir.path().join("dep.h")).expect("rm");
    kiln().args(["samu", "-C", dirarg]).assert().code(1);

    // Restoring it (fresh mtime) triggers a successful recompile.
    std::thread::sleep(std::time::Duration::from_millis(20));
    write(dir.path(), "dep.h", "#define X 2\n");
    kiln().args(["samu", "-C", dirarg]).assert().success();
    let trace = std::fs::read_to_string(dir.path().join("trace.log")).expect("trace");
    assert_eq!(trace.lines().count(), 2, "restore must recompile exactly once");
}

#[test]
fn restat_prunes_downstream_edges() {
    let dir = tempfile::tempdir().expect("tempdir");
    write(dir.path(), "src.txt", "same\n");
    write(
        dir.path(),
        "build.ninja",
        concat!(
            "rule gen\n",
            "  command = cmp -s src.txt mid.txt || cp src.txt mid.txt\n",
            "  restat = 1\n",
            "rule consume\n",
            "  command = echo consumed >> consumer.log && cp mid.txt final.txt\n",
            "build mid.txt: gen src.txt\n",
            "build final.txt: consume mid.txt\n",
        ),
    );
    let dirarg = dir.path().to_str().expect("utf8");
    kiln().args(["samu", "-C", dirarg]).assert().success();
    let first = std::fs::read_to_string(dir.path().join("consumer.log")).expect("log");
    assert_eq!(first.lines().count(), 1);

    // Touch the input without changing the generated output: gen reruns,
    // the consumer is pruned.
    std::thread::sleep(std::time::Duration::from_millis(20));
    write(dir.path(), "src.txt", "same\n");
    kiln().args(["samu", "-C", dirarg]).assert().success();
    let second = std::fs::read_to_string(dir.path().join("consumer.log")).expect("log");
    assert_eq!(second.lines().count(), 1, "consumer must be pruned after restat");
}

#[test]
fn build_log_records_hashes() {
    let dir = tempfile::tempdir().expect("tempdir");
    write(
        dir.path(),
        "build.ninja",
        concat!("rule t\n  command = touch $out\n", "build out.txt: t\n"),
    );
    kiln().args(["samu", "-C", dir.path().to_str().expect("utf8")]).assert().success();
    let log = std::fs::read_to_string(dir.path().join(".ninja_log")).expect("log");
    assert!(log.starts_with("# ninja log v5"));
    let record = log.lines().nth(1).expect("one record");
    let fields: Vec<&str> = record.split('\t').collect();
    assert_eq!(fields.len(), 5);
    assert_eq!(fields[3], "out.txt");
}

#[test]
fn tool_commands_prints_dependency_ordered_commands() {
    let dir = tempfile::tempdir().expect("tempdir");
    write(
        dir.path(),
        "build.ninja",
        concat!(
            "rule cc\n  command = gcc -c $in -o $out\n",
            "rule ld\n  command = gcc -o $out $in\n",
            "build a.o: cc a.c\n",
            "build prog: ld a.o\n",
        ),
    );
    kiln()
        .args(["samu", "-C", dir.path().to_str().expect("utf8"), "-t", "commands", "prog"])
        .assert()
        .success()
        .stdout(predicate::str::contains("gcc -c a.c -o a.o\ngcc -o prog a.o"));
}

#[test]
fn unsupported_tool_fails_cleanly() {
    let dir = tempfile::tempdir().expect("tempdir");
    write(dir.path(), "build.ninja", "rule r\n  command = :\n");
    kiln()
        .args(["samu", "-C", dir.path().to_str().expect("utf8"), "-t", "compdb"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("not supported"));
}

#[test]
fn samuflags_feeds_engine_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    write(
        dir.path(),
        "build.ninja",
        concat!("rule t\n  command = touch $out\n", "build out.txt: t\n"),
    );
    kiln()
        .args(["samu", "-C", dir.path().to_str().expect("utf8")])
        .env("SAMUFLAGS", "-j2 -v")
        .assert()
        .success()
        // Verbose mode prints the command instead of the description.
        .stdout(predicate::str::contains("touch out.txt"));
}

#[test]
fn ninja_status_formats_progress_lines() {
    let dir = tempfile::tempdir().expect("tempdir");
    write(
        dir.path(),
        "build.ninja",
        concat!("rule t\n  command = touch $out\n", "build out.txt: t\n"),
    );
    kiln()
        .args(["samu", "-C", dir.path().to_str().expect("utf8")])
        .env("NINJA_STATUS", "<%s/%t> ")
        .assert()
        .success()
        .stdout(predicate::str::contains("<1/1>"));
}

/// Full configure-and-build pipeline against a real C toolchain. Skipped
/// when no `cc` is installed.
#[test]
fn trivial_executable_end_to_end() {
    if std::process::Command::new("cc").arg("--version").output().is_err() {
        eprintln!("skipping: no C compiler installed");
        return;
    }
    let dir = tempfile::tempdir().expect("tempdir");
    let source = dir.path().join("src");
    let build = dir.path().join("out");
    write(&source, "meson.build", "project('hello', 'c')\nexecutable('hello', 'main.c')\n");
    write(&source, "main.c", "int main(void) { return 0; }\n");

    kiln()
        .args([
            "setup",
            source.to_str().expect("utf8"),
            build.to_str().expect("utf8"),
        ])
        .assert()
        .success();

    let manifest = std::fs::read_to_string(build.join("build.ninja")).expect("manifest");
    assert!(manifest.contains("rule c_COMPILER"));
    assert!(manifest.contains("rule c_LINKER"));
    assert!(manifest.contains("build hello"));

    kiln().args(["build", build.to_str().expect("utf8")]).assert().success();
    assert!(build.join("hello").exists(), "linked executable must exist");

    // Second build is a no-op: the binary's mtime must not change.
    let before = std::fs::metadata(build.join("hello")).expect("meta").modified().expect("mtime");
    kiln().args(["build", build.to_str().expect("utf8")]).assert().success();
    let after = std::fs::metadata(build.join("hello")).expect("meta").modified().expect("mtime");
    assert_eq!(before, after);
}

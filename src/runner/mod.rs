//! The embedded, `build.ninja`-compatible build engine.
//!
//! Drives a parsed manifest to completion without an external ninja
//! binary: manifest parsing, dirty analysis, dependency logs, and a
//! cooperative process scheduler. The historical single-letter CLI
//! surface (and `SAMUFLAGS`) is preserved so generated regeneration rules
//! keep working.

pub mod build;
pub mod depfile;
pub mod deps;
pub mod env;
pub mod graph;
pub mod log;
pub mod parse;
pub mod scan;
pub mod tool;

use anyhow::Context;

use crate::runner::build::{BuildOpts, Builder};
use crate::runner::deps::DepsLog;
use crate::runner::graph::{FLAG_DIRTY_OUT, Graph, GraphError};
use crate::runner::log::BuildLog;
use crate::runner::parse::ParseOpts;
use crate::runner::tool::Tool;

/// Exit status contract of the engine front-end.
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_USAGE: i32 = 2;

const MANIFEST_RETRIES: u32 = 100;

#[derive(Debug)]
struct EngineArgs {
    manifest: String,
    directory: Option<String>,
    build: BuildOpts,
    parse: ParseOpts,
    tool: Option<String>,
    targets: Vec<String>,
    print_version: bool,
}

impl Default for EngineArgs {
    fn default() -> Self {
        Self {
            manifest: "build.ninja".to_owned(),
            directory: None,
            build: BuildOpts::default(),
            parse: ParseOpts::default(),
            tool: None,
            targets: Vec::new(),
            print_version: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("usage: kiln samu [-C dir] [-d debugflag] [-f buildfile] [-j maxjobs] [-k maxfail] [-n] [-t tool] [-v] [-w warnflag] [target...]")]
struct UsageError;

fn parse_args(args: &[String], into: &mut EngineArgs) -> Result<(), UsageError> {
    let mut it = args.iter().peekable();
    while let Some(arg) = it.next() {
        let Some(flags) = arg.strip_prefix('-') else {
            into.targets.push(arg.clone());
            // Everything after the first free argument is a target.
            for rest in it {
                into.targets.push(rest.clone());
            }
            break;
        };
        if let Some(long) = flags.strip_prefix('-') {
            match long {
                "version" => into.print_version = true,
                "verbose" => into.build.verbose = true,
                _ => return Err(UsageError),
            }
            continue;
        }
        let mut chars = flags.chars();
        while let Some(flag) = chars.next() {
            // A flag taking a value consumes the rest of this argument or
            // the next one.
            let mut value = || -> Result<String, UsageError> {
                let rest: String = chars.by_ref().collect();
                if !rest.is_empty() {
                    return Ok(rest);
                }
                it.next().cloned().ok_or(UsageError)
            };
            match flag {
                'C' => into.directory = Some(value()?),
                'd' => match value()?.as_str() {
                    "explain" => into.build.explain = true,
                    "keepdepfile" => into.build.keepdepfile = true,
                    "keeprsp" => into.build.keeprsp = true,
                    _ => return Err(UsageError),
                },
                'f' => into.manifest = value()?,
                'j' => {
                    let n: usize = value()?.parse().map_err(|_| UsageError)?;
                    if n == 0 {
                        return Err(UsageError);
                    }
                    into.build.maxjobs = n;
                }
                'k' => {
                    let n: i64 = value()?.parse().map_err(|_| UsageError)?;
                    // -k 0 (or negative) means keep going.
                    into.build.maxfail = u64::try_from(n).ok().filter(|v| *v > 0).unwrap_or(u64::MAX);
                }
                'n' => into.build.dryrun = true,
                't' => {
                    into.tool = Some(value()?);
                    // Remaining arguments belong to the tool.
                    for rest in it.by_ref() {
                        into.targets.push(rest.clone());
                    }
                    return Ok(());
                }
                'v' => into.build.verbose = true,
                'w' => match value()?.as_str() {
                    "dupbuild=err" => into.parse.dupbuild_warn = false,
                    "dupbuild=warn" => into.parse.dupbuild_warn = true,
                    _ => return Err(UsageError),
                },
                _ => return Err(UsageError),
            }
        }
    }
    Ok(())
}

/// `SAMUFLAGS` contributes `-j`/`-v` style defaults before the real argv.
fn parse_env_args(into: &mut EngineArgs) -> Result<(), UsageError> {
    let Ok(env) = std::env::var("SAMUFLAGS") else { return Ok(()) };
    let Some(args) = shlex::split(&env) else { return Err(UsageError) };
    parse_args(&args, into)
}

/// Run the embedded engine with the given argv (not including the program
/// name). Returns the process exit code.
#[must_use]
pub fn run_engine(args: &[String]) -> i32 {
    match run_engine_inner(args) {
        Ok(code) => code,
        Err(err) => {
            if err.downcast_ref::<UsageError>().is_some() {
                eprintln!("{err}");
                EXIT_USAGE
            } else {
                eprintln!("kiln: {err:#}");
                EXIT_FAILURE
            }
        }
    }
}

fn run_engine_inner(args: &[String]) -> anyhow::Result<i32> {
    let mut engine = EngineArgs::default();
    parse_env_args(&mut engine)?;
    parse_args(args, &mut engine)?;

    if engine.print_version {
        println!("{}.{}.0", parse::NINJA_MAJOR, parse::NINJA_MINOR);
        return Ok(EXIT_SUCCESS);
    }
    if let Some(dir) = &engine.directory {
        std::env::set_current_dir(dir).with_context(|| format!("chdir to {dir}"))?;
    }
    if let Ok(fmt) = std::env::var("NINJA_STATUS") {
        engine.build.statusfmt = fmt;
    }

    let mut tries = 0;
    loop {
        tries += 1;
        let mut graph = Graph::new();
        let root = graph.root_env;
        parse::parse_file(&mut graph, engine.parse, &engine.manifest, root)?;

        if let Some(tool_name) = &engine.tool {
            let tool = Tool::from_name(tool_name)?;
            let mut stdout = std::io::stdout();
            tool.run(&mut graph, &engine.targets, &mut stdout)?;
            return Ok(EXIT_SUCCESS);
        }

        let builddir = graph.env_var(root, "builddir").map(ToOwned::to_owned);
        if let Some(dir) = &builddir {
            std::fs::create_dir_all(dir).with_context(|| format!("create builddir {dir}"))?;
        }
        let mut log = BuildLog::open(&mut graph, builddir.as_deref())?;
        let mut deps = DepsLog::open(&mut graph, builddir.as_deref())?;

        // Rebuild the manifest first if it is generated and stale, then
        // reparse and start over.
        if let Some(manifest_node) = graph.node_lookup(&engine.manifest)
            && graph.nodes[manifest_node.0 as usize].generated_by.is_some()
        {
            let mut builder = Builder::new(&mut graph, &mut deps, &mut log, engine.build.clone());
            builder.add_target(manifest_node)?;
            if builder.graph.nodes[manifest_node.0 as usize].dirty {
                builder.build()?;
                let edge = graph.nodes[manifest_node.0 as usize]
                    .generated_by
                    .ok_or_else(|| GraphError::Fatal("lost manifest edge".into()))?;
                let regenerated = graph.edges[edge.0 as usize].flags & FLAG_DIRTY_OUT != 0
                    || graph.edges[edge.0 as usize].nprune > 0;
                if regenerated && !engine.build.dryrun {
                    if tries > MANIFEST_RETRIES {
                        anyhow::bail!(
                            "manifest '{}' dirty after {MANIFEST_RETRIES} tries",
                            engine.manifest
                        );
                    }
                    log.close()?;
                    deps.close()?;
                    continue;
                }
                Builder::reset(&mut graph);
            }
        }

        let targets: Vec<_> = if engine.targets.is_empty() {
            graph.default_nodes()
        } else {
            engine
                .targets
                .iter()
                .map(|t| {
                    graph
                        .node_lookup(t)
                        .ok_or_else(|| GraphError::Fatal(format!("unknown target '{t}'")))
                })
                .collect::<Result<_, _>>()?
        };

        let mut builder = Builder::new(&mut graph, &mut deps, &mut log, engine.build.clone());
        for target in targets {
            builder.add_target(target)?;
        }
        let result = builder.build();
        log.close()?;
        deps.close()?;
        result?;
        return Ok(EXIT_SUCCESS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_owned()).collect()
    }

    #[rstest]
    fn parses_flags_and_targets() {
        let mut engine = EngineArgs::default();
        parse_args(&args(&["-j4", "-n", "-v", "a", "b"]), &mut engine).expect("parse");
        assert_eq!(engine.build.maxjobs, 4);
        assert!(engine.build.dryrun);
        assert!(engine.build.verbose);
        assert_eq!(engine.targets, ["a", "b"]);
    }

    #[rstest]
    fn detached_values_are_accepted() {
        let mut engine = EngineArgs::default();
        parse_args(&args(&["-f", "other.ninja", "-k", "0"]), &mut engine).expect("parse");
        assert_eq!(engine.manifest, "other.ninja");
        assert_eq!(engine.build.maxfail, u64::MAX);
    }

    #[rstest]
    fn debug_and_warn_flags_route() {
        let mut engine = EngineArgs::default();
        parse_args(&args(&["-d", "explain", "-w", "dupbuild=warn"]), &mut engine).expect("parse");
        assert!(engine.build.explain);
        assert!(engine.parse.dupbuild_warn);
    }

    #[rstest]
    fn unknown_flags_are_usage_errors() {
        let mut engine = EngineArgs::default();
        assert!(parse_args(&args(&["-z"]), &mut engine).is_err());
        assert!(parse_args(&args(&["-d", "bogus"]), &mut engine).is_err());
        assert!(parse_args(&args(&["-j", "0"]), &mut engine).is_err());
    }

    #[rstest]
    fn tool_consumes_remaining_arguments() {
        let mut engine = EngineArgs::default();
        parse_args(&args(&["-t", "commands", "prog"]), &mut engine).expect("parse");
        assert_eq!(engine.tool.as_deref(), Some("commands"));
        assert_eq!(engine.targets, ["prog"]);
    }
}

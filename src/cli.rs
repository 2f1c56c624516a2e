//! Command line interface definition and dispatch.
//!
//! `main` stays minimal: it parses [`Cli`] and calls [`run`], which maps
//! every outcome to a process exit code (0 success, 1 failure, 2 usage).

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use tracing::debug;

use crate::backend;
use crate::runner;
use crate::workspace::Workspace;

/// An alternative Meson interpreter with an embedded Ninja-compatible
/// build engine.
#[derive(Debug, Parser)]
#[command(name = "kiln", version, about, long_about = None)]
pub struct Cli {
    /// Run as if started in this directory.
    #[arg(short = 'C', long, value_name = "DIR")]
    pub directory: Option<Utf8PathBuf>,

    /// Enable verbose diagnostic logging.
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Evaluate a project and generate build files.
    Setup {
        /// Project source root (holds the top-level meson.build).
        #[arg(value_name = "SOURCE", default_value = ".")]
        source: Utf8PathBuf,
        /// Build directory to generate into.
        #[arg(value_name = "BUILD", default_value = "build")]
        build: Utf8PathBuf,
        /// Set a build option, `name=value`.
        #[arg(short = 'D', value_name = "OPTION")]
        define: Vec<String>,
    },
    /// Run the generated build with the embedded engine.
    Build {
        /// Build directory created by `setup`.
        #[arg(value_name = "BUILD", default_value = "build")]
        build: Utf8PathBuf,
        /// Maximum parallel jobs.
        #[arg(short, long, value_name = "N")]
        jobs: Option<usize>,
        /// Targets to build; defaults to the manifest's defaults.
        targets: Vec<String>,
    },
    /// Invoke the embedded engine with its historical flag surface.
    Samu {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// List build options and their current values.
    Options {
        /// Build directory created by `setup`.
        #[arg(value_name = "BUILD", default_value = "build")]
        build: Utf8PathBuf,
    },
    /// Print the version.
    Version,
}

/// Map the `KILN_LOG_LVL` integer override onto a tracing level.
fn log_level(verbose: bool) -> tracing::Level {
    let from_env = std::env::var("KILN_LOG_LVL").ok().and_then(|v| v.parse::<u8>().ok());
    match from_env {
        Some(0) => tracing::Level::ERROR,
        Some(1) => tracing::Level::WARN,
        Some(2) => tracing::Level::INFO,
        Some(_) => tracing::Level::DEBUG,
        None if verbose => tracing::Level::DEBUG,
        None => tracing::Level::WARN,
    }
}

fn init_logging(verbose: bool) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(log_level(verbose))
        .with_writer(std::io::stderr)
        .try_init();
}

/// Execute the parsed command line; returns the process exit code.
#[must_use]
pub fn run(cli: Cli) -> i32 {
    init_logging(cli.verbose);
    if let Some(dir) = &cli.directory
        && let Err(err) = std::env::set_current_dir(dir)
    {
        eprintln!("kiln: cannot enter {dir}: {err}");
        return runner::EXIT_FAILURE;
    }
    match cli.command {
        Commands::Setup { source, build, define } => setup(&source, &build, &define),
        Commands::Build { build, jobs, targets } => {
            let mut args = vec!["-C".to_owned(), build.to_string()];
            if let Some(jobs) = jobs {
                args.push("-j".to_owned());
                args.push(jobs.to_string());
            }
            args.extend(targets);
            runner::run_engine(&args)
        }
        Commands::Samu { args } => runner::run_engine(&args),
        Commands::Options { build } => list_options(&build),
        Commands::Version => {
            println!("kiln {}", env!("CARGO_PKG_VERSION"));
            runner::EXIT_SUCCESS
        }
    }
}

const CHECK_CACHE_FILE: &str = "kiln-check-cache.json";

/// The configure phase: evaluate the project, resolve toolchains, emit
/// build files.
fn setup(source: &Utf8PathBuf, build: &Utf8PathBuf, defines: &[String]) -> i32 {
    // The generated manifest is consumed from inside the build directory,
    // so both roots must be absolute.
    let source = absolutize(source);
    let build = absolutize(build);
    let mut wk = Workspace::new(source.clone(), build.clone());
    let cache_path = build.join(CHECK_CACHE_FILE);
    wk.check_cache.load(&cache_path);

    for define in defines {
        if let Err(err) = wk.options.set_cmdline(&mut wk.heap, define) {
            eprintln!("kiln: {err}");
            return runner::EXIT_USAGE;
        }
    }

    // Project options file, then the project description itself.
    let options_file = source.join("meson_options.txt");
    if options_file.exists() {
        let _ = wk.eval_file(&options_file);
    }
    let root_file = source.join("meson.build");
    let eval_ok = wk.eval_file(&root_file).is_ok();

    let mut stderr = std::io::stderr();
    let _ = wk.diags.replay(&wk.sources, &mut stderr);
    if !eval_ok || wk.diags.has_errors() {
        return runner::EXIT_FAILURE;
    }

    if let Err(err) = backend::write_outputs(&mut wk) {
        eprintln!("kiln: {err}");
        return runner::EXIT_FAILURE;
    }
    if let Err(err) = wk.check_cache.save(&cache_path) {
        debug!(%err, "failed to persist check cache");
    }
    let name = wk
        .projects
        .last()
        .map(|p| wk.heap.str_display(p.name))
        .unwrap_or_else(|| "project".to_owned());
    println!("kiln: configured {name} into {build}");
    runner::EXIT_SUCCESS
}

fn absolutize(path: &Utf8PathBuf) -> Utf8PathBuf {
    if path.is_absolute() {
        return path.clone();
    }
    std::env::current_dir()
        .ok()
        .and_then(|cwd| Utf8PathBuf::from_path_buf(cwd).ok())
        .map_or_else(|| path.clone(), |cwd| cwd.join(path))
}

fn list_options(build: &Utf8PathBuf) -> i32 {
    // Options are reconstructed from a bare workspace; project options
    // require a configured build dir to be listed with their values.
    let _ = build;
    let wk = Workspace::bare();
    for option in wk.options.iter() {
        let value = wk.heap.obj_display(option.value);
        println!("{:<24} {:<10} {}", option.name, format!("{:?}", option.typ), value);
    }
    runner::EXIT_SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn samu_subcommand_passes_flags_through() {
        let cli = Cli::parse_from(["kiln", "samu", "-j4", "-n", "target"]);
        let Commands::Samu { args } = cli.command else { panic!("expected samu") };
        assert_eq!(args, ["-j4", "-n", "target"]);
    }

    #[test]
    fn setup_collects_defines() {
        let cli = Cli::parse_from(["kiln", "setup", "src", "out", "-D", "werror=true"]);
        let Commands::Setup { source, build, define } = cli.command else {
            panic!("expected setup")
        };
        assert_eq!(source, Utf8PathBuf::from("src"));
        assert_eq!(build, Utf8PathBuf::from("out"));
        assert_eq!(define, ["werror=true"]);
    }
}

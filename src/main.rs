//! Binary entry point; all logic lives in the library.

use clap::Parser;
use kiln::cli::{Cli, run};

fn main() {
    let cli = Cli::parse();
    std::process::exit(run(cli));
}

use std::process::ExitCode;

use clap::Parser;

use lumaedit::cli::{self, CliArgs};

fn main() -> ExitCode {
    let args = CliArgs::parse();
    lumaedit::logger::init();
    lumaedit::log_info!("LumaEdit {} starting", env!("CARGO_PKG_VERSION"));
    cli::run(args)
}

use std::process::ExitCode;

use clap::Parser;
use perftest::{error::Error, logging, runner};
use tracing::info;

use crate::command_line::GlobalArgs;

mod command_line;

fn main() -> ExitCode {
    let args = GlobalArgs::parse();

    let verbose = args.verbose;
    logging::init(verbose);

    let (config, device) = args.into_config();

    info!(role = %config.role(), "RDMA write latency test");

    match runner::run_on_device(config, device) {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            report(&err, verbose);
            ExitCode::from(err.exit_code())
        }
    }
}

fn report(err: &Error, verbose: bool) {
    let message = match err.remediation() {
        Some(hint) => format!("{err}\n{hint}"),
        None => err.to_string(),
    };

    if verbose {
        logging::error_with_trace(message);
    } else {
        logging::error(message);
    }
}

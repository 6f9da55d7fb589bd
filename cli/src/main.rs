use std::process::ExitCode;

use anyhow::Result;

fn run() -> Result<ExitCode> {
    imgroot_utils::initialize_tracing();
    tracing::trace!("starting");
    imgroot_lib::cli::run_from_iter(std::env::args())
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            imgroot_lib::cli::exit_code_for(&e)
        }
    }
}

mod cli;

use std::process::ExitCode;

use clap::Parser;

use greyfuzz::fuzzer::{FuzzLoop, ShutdownFlag};

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = cli::Cli::parse();
    let config = match cli.into_config() {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = ShutdownFlag::new();
    if let Err(e) = signal_hook::flag::register(signal_hook::consts::SIGINT, shutdown.sigint_flag()) {
        log::error!("failed to install SIGINT handler: {e}");
        return ExitCode::FAILURE;
    }
    if let Err(e) = signal_hook::flag::register(signal_hook::consts::SIGTERM, shutdown.sigterm_flag()) {
        log::error!("failed to install SIGTERM handler: {e}");
        return ExitCode::FAILURE;
    }

    let fuzz_loop = match FuzzLoop::new(config, shutdown) {
        Ok(fuzz_loop) => fuzz_loop,
        Err(e) => {
            log::error!("startup failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    match fuzz_loop.run() {
        Ok(code) => {
            if code == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            log::error!("fuzz loop aborted: {e}");
            ExitCode::FAILURE
        }
    }
}

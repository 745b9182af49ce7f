mod archive;
mod catalog;
mod cli;
mod config;
mod context;
mod executor;
mod fleet;
mod logging;
mod model;
mod monitor;
mod notify;
mod orchestrator;
mod osdeps;
mod planner;
mod platform;
mod policy;
mod status;
mod toolchain;
mod transfer;
mod version;

#[cfg(test)]
mod testing;

use std::process;

use config::Config;

fn main() {
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            process::exit(1);
        }
    };

    logging::init_logging(config.log_format);

    if let Err(failure) = cli::run(&config) {
        eprintln!("Error: {}", failure.message);
        process::exit(failure.code);
    }
}

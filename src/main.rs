mod address;
mod cctx;
mod cli;
mod clock;
mod config;
mod ipc;
mod monitor;
mod otf2;
mod perf;
mod process;
mod symbols;
mod topology;
mod trace;
mod types;

use clap::Parser;

use config::MonitorType;

fn main() {
    env_logger::init();

    let opt = cli::Opt::parse();
    let config = match opt.into_config() {
        Ok(config) => config,
        Err(message) => {
            eprintln!("otter: {message}");
            std::process::exit(1);
        }
    };

    let result = match config.monitor_type {
        MonitorType::CpuSet => monitor::cpu_set::run(&config),
        MonitorType::Process => monitor::process::run(&config),
    };

    match result {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(err) => {
            eprintln!("otter: {err}");
            std::process::exit(1);
        }
    }
}

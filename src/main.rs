use clap::Parser as _;
use heatpump_modbus::commands;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

const LOG_ENV: &str = "HEATPUMP_MODBUS_LOG";
const DEFAULT_LOG: &str = "warn,heatpump_modbus=info";

#[derive(clap::Parser)]
#[clap(version, about, author)]
enum Commands {
    Registers(commands::registers::Args),
    Poll(commands::poll::Args),
    Write(commands::write::Args),
    Disabled(commands::disabled::Args),
}

fn end<E: std::error::Error>(r: Result<(), E>) {
    std::process::exit(match r {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            let mut cause = e.source();
            while let Some(e) = cause {
                eprintln!("  because: {e}");
                cause = e.source();
            }
            1
        }
    });
}

fn log_filter() -> tracing_subscriber::filter::Targets {
    let description = std::env::var(LOG_ENV).unwrap_or_else(|_| DEFAULT_LOG.to_string());
    match description.parse() {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("warning: ignoring {LOG_ENV}={description:?}: {e}");
            DEFAULT_LOG.parse().unwrap_or_default()
        }
    }
}

fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(log_filter())
        .init();
    match Commands::parse() {
        Commands::Registers(args) => end(commands::registers::run(args)),
        Commands::Poll(args) => end(commands::poll::run(args)),
        Commands::Write(args) => end(commands::write::run(args)),
        Commands::Disabled(args) => end(commands::disabled::run(args)),
    }
}

use anyhow::{Context, Result};
use clap::Parser;
use commandline::{CliArgs, CliCommands};
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use serialbattery_lib::driver::{self, Driver};
use serialbattery_lib::gateway::Gateway;
use std::{ops::Deref, panic};

mod commandline;
mod daemon;
mod mqtt;
mod settings;

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    let config = settings::load_battery_config(args.config.as_deref())?;
    let adapter = driver::select(&args.device, args.timeout, &config, args.driver)
        .with_context(|| format!("Cannot find a battery at '{}'", args.device))?;

    match args.command {
        CliCommands::Probe => println!("{} at {}", adapter.name(), args.device),
        CliCommands::Status { json } => {
            let mut gateway =
                Gateway::new(adapter, &config).with_context(|| "Cannot configure battery")?;
            let snapshot = gateway.poll().with_context(|| "Cannot read battery")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                println!("{}", daemon::describe(&snapshot));
            }
        }
        CliCommands::Daemon {
            output,
            interval,
            max_transport_failures,
        } => {
            let mut gateway =
                Gateway::new(adapter, &config).with_context(|| "Cannot configure battery")?;
            gateway.set_max_transport_failures(max_transport_failures);
            daemon::run(gateway, output, interval)?;
        }
    }

    Ok(())
}

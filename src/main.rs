use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use solar_exporter_lib::{mqtt, poller::Poller, prometheus, store::SharedState};
use std::{ops::Deref, panic, process::ExitCode, sync::Arc, thread};

mod commandline;

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
            thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

/// Converts a worker result into its exit status, taking the siblings down
/// with it on failure.
fn worker_status(name: &str, result: anyhow::Result<()>, state: &SharedState) -> u8 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            error!("{name} failed: {e:#}");
            state.shutdown();
            1
        }
    }
}

fn main() -> ExitCode {
    let args = commandline::Args::parse();
    let _log_handle = logging_init(args.verbose.log_level_filter());

    let state = Arc::new(SharedState::new());

    {
        let state = Arc::clone(&state);
        if let Err(e) = ctrlc::set_handler(move || {
            info!("Shutting down...");
            state.shutdown();
        }) {
            error!("Cannot install signal handler: {e}");
            return ExitCode::FAILURE;
        }
    }

    if args.prometheus.is_none() && args.mqtt_config.is_none() {
        warn!("No exporter enabled, the readings will only show up in the logs");
    }

    let kind = args.device_type.kind();
    let mut workers: Vec<(&str, thread::JoinHandle<u8>)> = Vec::new();

    {
        let state = Arc::clone(&state);
        let device_or_uri = args.device_or_uri.clone();
        let timeout = args.timeout;
        let handle = thread::Builder::new()
            .name("poller".into())
            .spawn(move || {
                let result = Poller::connect(&device_or_uri, kind, timeout, Arc::clone(&state))
                    .and_then(|mut poller| poller.run());
                worker_status("Poller", result, &state)
            })
            .expect("Cannot spawn poller thread");
        workers.push(("poller", handle));
    }

    if let Some(port) = args.prometheus {
        let state = Arc::clone(&state);
        let handle = thread::Builder::new()
            .name("prometheus".into())
            .spawn(move || {
                let result = prometheus::run(port, kind.metric_prefix(), &state);
                worker_status("HTTP server", result, &state)
            })
            .expect("Cannot spawn prometheus thread");
        workers.push(("prometheus", handle));
    }

    if let Some(config_file) = args.mqtt_config.clone() {
        let state = Arc::clone(&state);
        let handle = thread::Builder::new()
            .name("mqtt".into())
            .spawn(move || {
                let result = mqtt::run(&config_file, kind, &state);
                worker_status("MQTT bridge", result, &state)
            })
            .expect("Cannot spawn mqtt thread");
        workers.push(("mqtt", handle));
    }

    let mut status = 0u8;
    for (name, handle) in workers {
        match handle.join() {
            Ok(code) => status = status.saturating_add(code),
            Err(_) => {
                error!("Worker {name} panicked");
                status = status.saturating_add(1);
            }
        }
    }

    if status == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(status)
    }
}

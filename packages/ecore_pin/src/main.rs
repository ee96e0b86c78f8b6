#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))]

//! Binary entry point for the `ecore_pin` tool.
//!
//! This module is excluded from mutation testing because it only wires the library together
//! with process-global state (arguments, logging, exit code).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use argh::FromArgs;
use ecore_pin::{Config, LoggingObserver, PassObserver, TopologyProbe, Worker, WorkerState};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Keeps selected background processes on an efficiency processor at idle priority.
#[derive(FromArgs)]
struct Args {
    /// path to a TOML configuration file; built-in defaults are used if omitted
    #[argh(option)]
    config: Option<PathBuf>,

    /// run a single binding pass and exit
    #[argh(switch)]
    once: bool,

    /// seconds between binding passes, overriding the configuration file
    #[argh(option)]
    interval: Option<u64>,
}

/// Observes a single pass whose summary is printed by `main()` itself.
#[derive(Debug)]
struct QuietObserver;

impl PassObserver for QuietObserver {}

// Binary entry point - mutations would require subprocess testing which is impractical.
#[cfg_attr(test, mutants::skip)]
fn main() -> ExitCode {
    let args: Args = argh::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = match args.config.as_deref() {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => Config::default(),
    };

    if let Some(seconds) = args.interval {
        if let Err(e) = config.set_interval_seconds(seconds) {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    }

    let probe = TopologyProbe::new();
    info!(
        logical_processors = probe.logical_processor_count(),
        process_names = %config.allow_list(),
        interval_seconds = config.interval().as_secs(),
        "starting"
    );

    let state = Arc::new(WorkerState::new(config.allow_list()));
    let worker = Worker::new(Arc::clone(&state));

    if args.once {
        let summary = worker.run_pass(&QuietObserver);
        println!("{summary}");

        return if summary.is_aborted() {
            ExitCode::FAILURE
        } else {
            ExitCode::SUCCESS
        };
    }

    let _handle = match worker.spawn(config.schedule(), LoggingObserver) {
        Ok(handle) => handle,
        Err(e) => {
            error!(error = %e, "failed to start worker thread");
            return ExitCode::FAILURE;
        }
    };

    // The worker runs until the process is terminated. When a configuration file was given,
    // this thread picks up changes to its process names once per interval. The schedule stays
    // as it was at startup.
    loop {
        thread::sleep(config.interval());

        if let Some(path) = args.config.as_deref() {
            if let Err(e) = state.refresh_allow_list(path) {
                warn!(error = %e, "keeping previous process names");
            }
        }
    }
}

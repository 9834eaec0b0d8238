use chrono::Utc;
use clap::Parser;
use env_logger::Env;
use log::{error, info, warn, LevelFilter};
use rusty_em::config::{load_config, load_config_or_default, AppConfig};
use rusty_em::{
    plot_channel, AcquisitionState, Em2Controller, Em2Error, Logger, Reading, ReadoutRecord,
};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

/// ALBA EM2 acquisition tool
#[derive(Parser, Debug)]
#[command(name = "em2-acquire")]
#[command(about = "Run triggered acquisitions on an ALBA EM2 electrometer", long_about = None)]
struct Args {
    /// Path to configuration file (defaults to rusty_em.toml or config.toml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Number of acquisition cycles to run
    #[arg(short = 'n', long, default_value_t = 1)]
    cycles: u64,

    /// Plot this instrument channel in the terminal after each cycle
    #[arg(short, long, value_name = "CHANNEL")]
    plot: Option<u8>,

    /// Status poll interval in milliseconds
    #[arg(long, default_value_t = 50)]
    poll_ms: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = match &args.config {
        // an explicit file must load
        Some(path) => load_config(Some(path.as_path()))?,
        None => load_config_or_default(None),
    };

    let log_level = args
        .log_level
        .clone()
        .unwrap_or(config.logging.log_level.clone());
    initialize_logging(&log_level)?;
    log_startup_info(&config, args.config.as_deref());

    let mut controller = Em2Controller::from_config(&config)?;
    let shutdown_flag = setup_shutdown_handler(&controller)?;

    let mut logger = match &config.logging.data_path {
        Some(path) => Some(Logger::new(create_log_file_path(path)?, 100, false)),
        None => None,
    };

    let result = run_cycles(&mut controller, &config, &args, &shutdown_flag, &mut logger);

    info!("Cleaning up and shutting down...");
    if let Err(e) = controller.abort_one(1) {
        warn!("Stop after run failed: {e}");
    }
    if let Some(logger) = logger.as_mut() {
        logger.flush()?;
    }

    match result {
        Ok(()) if shutdown_flag.load(Ordering::SeqCst) => {
            info!("Acquisition stopped by user");
            Ok(())
        }
        Ok(()) => {
            info!("Acquisition completed");
            Ok(())
        }
        Err(e) => {
            error!("Acquisition failed: {e}");
            Err(e.into())
        }
    }
}

fn run_cycles(
    controller: &mut Em2Controller,
    config: &AppConfig,
    args: &Args,
    shutdown_flag: &AtomicBool,
    logger: &mut Option<Logger<ReadoutRecord>>,
) -> Result<(), Em2Error> {
    let acquisition = &config.acquisition;
    let poll_interval = Duration::from_millis(args.poll_ms);

    for cycle in 1..=args.cycles {
        if shutdown_flag.load(Ordering::SeqCst) {
            break;
        }
        info!("Cycle {cycle}/{}", args.cycles);

        controller.load_one(1, acquisition.integration_time, acquisition.repetitions)?;
        let axes: Vec<u8> = controller.axes().collect();
        for &axis in &axes {
            if !controller.pre_start_one(axis)? {
                return Err(Em2Error::NoResponse("ACQU:STAT?".to_string()));
            }
        }
        controller.start_all()?;

        loop {
            thread::sleep(poll_interval);
            controller.state_all()?;
            let report = controller.state_one(1)?;
            if controller.cursor().is_continuous() {
                record_new_samples(controller, cycle, logger)?;
            }
            if shutdown_flag.load(Ordering::SeqCst) || report.state != AcquisitionState::Moving {
                if report.state == AcquisitionState::Fault {
                    warn!("Instrument reports {}", report.status);
                }
                break;
            }
        }

        record_new_samples(controller, cycle, logger)?;
        print_cycle(controller, &axes, cycle);

        if let Some(channel) = args.plot {
            if let Some(buffer) = controller.buffer() {
                if let Err(e) = plot_channel(buffer, channel, "A") {
                    warn!("Plot failed: {e}");
                }
            }
        }
    }

    Ok(())
}

/// Poll the instrument and log whatever arrived.
fn record_new_samples(
    controller: &mut Em2Controller,
    cycle: u64,
    logger: &mut Option<Logger<ReadoutRecord>>,
) -> Result<usize, Em2Error> {
    let samples = controller.read_all()?;
    if samples == 0 {
        return Ok(0);
    }
    info!("Read {samples} sample(s), cursor at {}", controller.cursor().index());

    if let (Some(logger), Some(buffer)) = (logger.as_mut(), controller.buffer()) {
        let session = controller.session();
        logger.add(ReadoutRecord::new(
            cycle,
            session.sync_mode(),
            session.integration_time(),
            controller.state_one(1)?,
            buffer,
        ))?;
    }
    Ok(samples)
}

fn print_cycle(controller: &Em2Controller, axes: &[u8], cycle: u64) {
    println!("Cycle {cycle}");
    for &axis in axes {
        match controller.read_one(axis) {
            Ok(Reading::Scalar(value)) => println!("  axis {axis}: {value:e}"),
            Ok(Reading::Series(values)) => {
                println!("  axis {axis}: {} sample(s) {values:?}", values.len())
            }
            Ok(Reading::Empty) => println!("  axis {axis}: no data"),
            Err(e) => println!("  axis {axis}: {e}"),
        }
    }
}

/// Log startup information
fn log_startup_info(config: &AppConfig, config_path: Option<&Path>) {
    info!("=== Rusty EM2 Acquisition ===");
    match config_path {
        Some(path) => info!("Configuration: {}", path.display()),
        None => info!("Configuration: defaults / working directory"),
    }
    info!(
        "EM2: {}:{}",
        config.instrument.host, config.instrument.port
    );
    info!(
        "Acquisition: {} s x {} ({})",
        config.acquisition.integration_time,
        config.acquisition.repetitions,
        config.acquisition.sync_mode
    );
    if let Some(ref input) = config.instrument.ext_trigger_input {
        info!("External trigger input: {}", input);
    }
}

/// Stop the instrument on Ctrl+C and tell the cycle loop to finish
fn setup_shutdown_handler(
    controller: &Em2Controller,
) -> Result<Arc<AtomicBool>, Box<dyn std::error::Error>> {
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_clone = shutdown_flag.clone();
    let client = Arc::clone(controller.client());

    ctrlc::set_handler(move || {
        info!("Ctrl+C received - stopping acquisition...");
        shutdown_flag_clone.store(true, Ordering::SeqCst);
        if let Err(e) = client.stop_acquisition() {
            error!("Stop failed: {e}");
        }
    })?;

    Ok(shutdown_flag)
}

/// Initialize logging with configurable level
fn initialize_logging(log_level: &str) -> Result<(), Box<dyn std::error::Error>> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => {
            eprintln!("Warning: Invalid log level '{}', using 'info'", log_level);
            LevelFilter::Info
        }
    };

    env_logger::Builder::from_env(Env::default())
        .filter_level(level)
        .format_timestamp_millis()
        .init();

    Ok(())
}

fn create_log_file_path(log_path: &str) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let data_dir = PathBuf::from(log_path);
    fs::create_dir_all(&data_dir)?;

    let filename = format!("em2_{}.jsonl", Utc::now().format("%Y%m%d_%H%M%S"));
    Ok(data_dir.join(filename))
}

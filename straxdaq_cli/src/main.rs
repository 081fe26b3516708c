//! # straxdaq_cli
//!
//! The host-level readout daemon wrapping [`libstraxdaq`].
//!
//! One instance owns the digitizers configured for this host and is driven
//! through simple line commands on stdin, standing in for the orchestrator
//! transport: `arm`, `start`, `stop`, `status`, `reset`, `quit`.
//!
//! ## Use
//!
//! ```bash
//! straxdaq_cli -p <run_mode.yaml> --simulate
//! ```
//!
//! To generate a run mode template use
//!
//! ```bash
//! straxdaq_cli -p <run_mode.yaml> new
//! ```
//!
//! Without `--simulate` the daemon expects a hardware VME backend, which is
//! an integration point outside this repository.

use clap::{Arg, ArgAction, Command};
use std::fs::File;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libstraxdaq::config::Options;
use libstraxdaq::controller::DaqController;
use libstraxdaq::sim::SimBoard;
use libstraxdaq::vme::VmeFactory;
use libstraxdaq::writer::LogSink;

fn make_template_config(path: &Path) {
    let options = Options::default();
    let yaml_str = serde_yaml::to_string(&options).unwrap();
    let mut file = File::create(path).expect("Could not create template run mode file!");
    file.write_all(yaml_str.as_bytes())
        .expect("Failed to write yaml data to file!");
}

/// Simulated boards with a linear pedestal response and a little noise.
fn simulated_factory() -> VmeFactory {
    Box::new(|spec| {
        Ok(Box::new(
            SimBoard::new(spec.kind.num_channels())
                .with_response(0.25, 200.0)
                .with_noise(2),
        ))
    })
}

fn main() {
    let matches = Command::new("straxdaq_cli")
        .arg_required_else_help(true)
        .subcommand(Command::new("new").about("Make a template run mode yaml file"))
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .help("Path to the run mode file"),
        )
        .arg(
            Arg::new("host")
                .long("host")
                .default_value("reader0")
                .help("Host name used for per-host config lookups"),
        )
        .arg(
            Arg::new("cal")
                .long("cal-store")
                .help("Path to the DAC calibration store"),
        )
        .arg(
            Arg::new("simulate")
                .long("simulate")
                .action(ArgAction::SetTrue)
                .help("Run against simulated digitizers"),
        )
        .get_matches();

    // Log to a file, mixed-thread output with timestamps
    let file_sink = Arc::new(
        spdlog::sink::FileSink::builder()
            .path(PathBuf::from("./straxdaq.log"))
            .formatter(Box::new(spdlog::formatter::PatternFormatter::new(
                spdlog::formatter::pattern!(
                    "[{date_short} {time_short}] - [thread: {tid}] - [{^{level}}] - {payload}{eol}"
                ),
            )))
            .build()
            .unwrap(),
    );
    let logger = Arc::new(
        spdlog::Logger::builder()
            .flush_level_filter(spdlog::LevelFilter::All)
            .sink(file_sink)
            .build()
            .unwrap(),
    );
    spdlog::set_default_logger(logger);

    let config_path = PathBuf::from(matches.get_one::<String>("path").expect("We require args"));

    if let Some(("new", _)) = matches.subcommand() {
        spdlog::info!(
            "Making a template run mode at {}",
            config_path.to_string_lossy()
        );
        make_template_config(&config_path);
        return;
    }

    spdlog::info!("Loading run mode from {}", config_path.to_string_lossy());
    let options = match Options::read_config_file(&config_path) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("{e}");
            spdlog::error!("{}", e);
            return;
        }
    };
    spdlog::info!("Run mode '{}' loaded", options.name);
    spdlog::info!("Boards: {}", options.boards.len());

    let factory = if matches.get_flag("simulate") {
        spdlog::info!("Running with simulated digitizers");
        simulated_factory()
    } else {
        eprintln!("No hardware VME backend is compiled in; run with --simulate");
        return;
    };

    let host = matches.get_one::<String>("host").unwrap().clone();
    let mut controller = DaqController::new(host, factory, Arc::new(LogSink));
    if let Some(cal) = matches.get_one::<String>("cal") {
        controller = controller.with_cal_store(PathBuf::from(cal));
    }

    println!("Commands: arm | start | stop | status | reset | quit");
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        match line.trim() {
            "arm" => match controller.arm(options.clone()) {
                Ok(()) => println!("armed"),
                Err(e) => {
                    spdlog::error!("{}", e);
                    println!("arm failed: {e}");
                }
            },
            "start" => match controller.start() {
                Ok(()) => println!("running"),
                Err(e) => {
                    spdlog::error!("{}", e);
                    println!("start failed: {e}");
                }
            },
            "stop" => match controller.stop() {
                Ok(()) => println!("idle"),
                Err(e) => {
                    spdlog::error!("{}", e);
                    println!("stop failed: {e}");
                }
            },
            "status" => {
                let report = controller.status_report();
                println!(
                    "rate: {}",
                    human_bytes::human_bytes(report.rate_bytes as f64)
                );
                match serde_yaml::to_string(&report) {
                    Ok(yaml) => println!("{yaml}"),
                    Err(e) => println!("status failed: {e}"),
                }
            }
            "reset" => {
                controller.reset();
                println!("idle");
            }
            "quit" | "exit" => break,
            "" => (),
            other => println!("unknown command '{other}'"),
        }
    }
    spdlog::info!("Shutting down");
}

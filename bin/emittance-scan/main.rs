mod config;

use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{error, info, warn, LevelFilter};
use emittance_scanner::plotting::projections;
use emittance_scanner::{
    AcrClient, AxisController, AxisId, BeamLine, Field, Plane, ScanConfiguration, ScanEngine,
    ScanRecord, ScannerError, SessionReport, SimulatedSignal, StopFlag, plot_phase_space,
    plot_profile, twiss_summary,
};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::config::{load_config, parse_gain, AppConfig};

/// Beam emittance scanner
#[derive(Parser, Debug)]
#[command(name = "emittance-scan")]
#[command(about = "Allison-type emittance scanner control for the VENUS and AECR beam lines", long_about = None)]
struct Args {
    /// Path to configuration file (defaults, then ./emittance.toml, then EMITTANCE__* variables)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Report position, limits and drive state of every axis
    Status,
    /// Home an axis against its negative limit and move it to the beam midpoint
    Center { axis: AxisId },
    /// Withdraw an axis, or every axis of a beam line with --beam
    Retract {
        #[arg(required_unless_present = "beam")]
        axis: Option<AxisId>,
        #[arg(long, value_parser = parse_beam_line)]
        beam: Option<BeamLine>,
    },
    /// Retract and de-energise every axis, or those of one beam line
    Shutdown {
        #[arg(long, value_parser = parse_beam_line)]
        beam: Option<BeamLine>,
    },
    /// Kill all motion and latch every axis
    Stop,
    /// Release the kill latches set by `stop`
    ClearStop,
    /// Kill and release all motion, then retract and de-energise the active axis
    Reset {
        #[arg(long)]
        active: Option<AxisId>,
    },
    /// Center, run one or more scans and retract
    Scan {
        axis: AxisId,
        /// Variables file to scan with
        #[arg(long, value_name = "FILE")]
        variables: PathBuf,
        /// Number of consecutive scans
        #[arg(long, default_value_t = 1)]
        count: usize,
        /// Override the amplifier gain (1e3 ... 1e11, or the exponent alone)
        #[arg(long, value_parser = parse_gain)]
        gain: Option<f64>,
        /// Acquire from a simulated beam instead of the scan cup
        #[arg(long)]
        dry_run: bool,
    },
    /// Re-analyse and plot a saved scan
    Replay {
        file: PathBuf,
        #[arg(long)]
        width: Option<usize>,
        #[arg(long)]
        height: Option<usize>,
    },
    /// Create, inspect or edit variables files
    Variables {
        #[command(subcommand)]
        command: VariablesCommand,
    },
}

#[derive(Subcommand, Debug)]
enum VariablesCommand {
    /// Save a new variables file from FIELD=VALUE entries, applied in order
    New {
        entries: Vec<String>,
        /// Beam line whose axes bound the position ranges
        #[arg(long, value_parser = parse_beam_line)]
        beam: Option<BeamLine>,
    },
    /// Show a variables file and check both planes are scannable
    Check { file: PathBuf },
    /// Change one field and save the result as a new file
    Set {
        file: PathBuf,
        field: String,
        value: String,
        #[arg(long, value_parser = parse_beam_line)]
        beam: Option<BeamLine>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    let log_level = args.log_level.unwrap_or(config.console.verbosity.clone());
    initialize_logging(&log_level)?;

    match args.command {
        Commands::Replay {
            file,
            width,
            height,
        } => replay(&file, width, height),
        Commands::Variables { command } => run_variables(command, &config),
        command => {
            log_startup_info(&config);
            let stop = setup_shutdown_handler()?;
            let controller = connect(&config, stop.clone())?;
            run_hardware(command, controller, &config, stop)
        }
    }
}

// Helper Functions

fn parse_beam_line(text: &str) -> Result<BeamLine, String> {
    BeamLine::from_label(&text.to_uppercase())
        .ok_or_else(|| format!("unknown beam line '{text}', expected VENUS or AECR"))
}

/// Log configuration summary
fn log_startup_info(config: &AppConfig) {
    info!("=== Emittance Scanner ===");
    info!(
        "Controller: {}:{} (timeout {} ms)",
        config.controller.host_ip, config.controller.port, config.controller.connect_timeout_ms
    );
    info!("Motion profile: {}", config.controller.motion_profile());
    info!(
        "Acquisition: {} samples every {} ms, gain {:e} V/A",
        config.acquisition.samples, config.acquisition.sample_interval_ms, config.acquisition.gain
    );
    info!("Data directory: {}", config.output.data_dir.display());
}

/// Open the controller session
fn connect(
    config: &AppConfig,
    stop: StopFlag,
) -> Result<AxisController<AcrClient>, Box<dyn std::error::Error>> {
    let client = AcrClient::builder()
        .address(&config.controller.host_ip)
        .port(config.controller.port)
        .connect_timeout(config.controller.connect_timeout())
        .motion_profile(config.controller.motion_profile())
        .build()?;
    info!("Connected to motion controller");

    Ok(AxisController::new(client)
        .with_motion_config(config.motion.to_motion_config())
        .with_stop_flag(stop))
}

/// Setup Ctrl+C handler that stops motion at the next poll
fn setup_shutdown_handler() -> Result<StopFlag, Box<dyn std::error::Error>> {
    let stop = StopFlag::new();
    let handler_flag = stop.clone();

    ctrlc::set_handler(move || {
        info!("Ctrl+C received - stopping at the next safe point...");
        handler_flag.request();
    })?;

    Ok(stop)
}

fn run_hardware(
    command: Commands,
    mut controller: AxisController<AcrClient>,
    config: &AppConfig,
    stop: StopFlag,
) -> Result<(), Box<dyn std::error::Error>> {
    let result: Result<(), ScannerError> = match command {
        Commands::Status => report_status(&mut controller),
        Commands::Center { axis } => controller.center_axis(axis).map(|motion| {
            if motion.is_cancelled() {
                info!("✓ Centering of {axis} stopped by user");
            } else {
                info!("✓ {axis} centered");
            }
        }),
        Commands::Retract { axis, beam } => match (axis, beam) {
            (Some(axis), _) => controller.retract(axis).map(|motion| {
                if !motion.is_cancelled() {
                    info!("✓ {axis} retracted");
                }
            }),
            (None, beam) => controller.shutdown(beam),
        },
        Commands::Shutdown { beam } => controller.shutdown(beam),
        Commands::Stop => controller.emergency_stop(),
        Commands::ClearStop => controller.clear_emergency_stop(),
        Commands::Reset { active } => controller.soft_reset(active),
        Commands::Scan {
            axis,
            variables,
            count,
            gain,
            dry_run,
        } => {
            return run_scan(controller, config, axis, &variables, count, gain, dry_run, stop);
        }
        Commands::Replay { .. } | Commands::Variables { .. } => Ok(()),
    };

    match result {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("✗ {e}");
            Err(e.into())
        }
    }
}

fn report_status(controller: &mut AxisController<AcrClient>) -> Result<(), ScannerError> {
    for axis in AxisId::ALL {
        let position = controller.position(axis)?;
        let limits = controller.limit_status(axis)?;
        let drive = controller.drive_status(axis)?;
        let cleared = controller.is_cleared(axis)?;
        println!(
            "{:<8} position {:>10} mm | limits +{} -{} | drive {}{}{} | {}",
            axis.to_string(),
            position.map_or_else(|| "?".to_string(), |p| format!("{p:.3}")),
            u8::from(limits.positive),
            u8::from(limits.negative),
            if drive.enabled { "on" } else { "off" },
            if drive.faulted { ", FAULT" } else { "" },
            if drive.kill_latched { ", killed" } else { "" },
            if cleared { "clear" } else { "in beam" },
        );
    }
    Ok(())
}

/// Run a scan session and report results
#[allow(clippy::too_many_arguments)]
fn run_scan(
    controller: AxisController<AcrClient>,
    config: &AppConfig,
    axis: AxisId,
    variables: &Path,
    count: usize,
    gain: Option<f64>,
    dry_run: bool,
    stop: StopFlag,
) -> Result<(), Box<dyn std::error::Error>> {
    if !dry_run {
        return Err("no scan cup digitiser backend is available in this build; use --dry-run".into());
    }
    warn!("Dry run: acquiring from a simulated beam");

    let variables = ScanConfiguration::load(variables)?;
    variables.limits(axis.plane())?;

    let mut settings = config.acquisition.to_settings();
    if let Some(gain) = gain {
        settings.gain = gain;
    }
    settings.validate()?;

    fs::create_dir_all(&config.output.data_dir)?;
    let signal = SimulatedSignal::default();
    let mut engine = ScanEngine::new(controller, signal, variables, settings, &config.output.data_dir);

    info!("Starting {count} scan(s) on {axis}...");
    let result = match engine.run_session(axis, count) {
        Ok(report) => {
            log_report(&report, stop.is_requested());
            Ok(())
        }
        Err(e) => {
            if e.is_fatal() {
                error!("✗ Scan aborted, hardware needs attention: {e}");
            } else {
                error!("✗ Scan failed: {e}");
            }
            Err(e.into())
        }
    };

    info!("Cleaning up and shutting down...");
    drop(engine);
    info!("Cleanup complete");

    result
}

fn log_report(report: &SessionReport, stopped: bool) {
    for scan in &report.scans {
        info!(
            "✓ {} ε = {:.4} mm mrad -> {}",
            scan.record.axis,
            scan.record.twiss.emittance_mm_mrad(),
            scan.path.display()
        );
    }
    if report.cancelled || stopped {
        info!("✓ Scanning stopped by user after {} scan(s)", report.scans.len());
    } else {
        info!("✓ {} scan(s) completed", report.scans.len());
    }
}

/// Re-analyse a saved record and draw its phase space and projections
fn replay(
    file: &Path,
    width: Option<usize>,
    height: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let record = ScanRecord::read(file)?;
    let twiss = record.reanalyze()?;

    println!("Stored:\n{}\n", twiss_summary(&record.twiss));
    println!("Recomputed:\n{}\n", twiss_summary(&twiss));

    plot_phase_space(&record, &twiss, width, height)?;

    let plane = record.plane().label().to_lowercase();
    let (position_profile, momentum_profile) = projections(&record.current);
    plot_profile(
        &record.positions,
        &position_profile,
        &format!("{plane} profile"),
        &format!("{plane} [mm]"),
        width,
        height.map(|h| h / 2),
    )?;
    plot_profile(
        &record.momenta,
        &momentum_profile,
        &format!("{plane}' profile"),
        &format!("{plane}' [mrad]"),
        width,
        height.map(|h| h / 2),
    )?;
    Ok(())
}

fn run_variables(
    command: VariablesCommand,
    config: &AppConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        VariablesCommand::New { entries, beam } => {
            let mut variables = ScanConfiguration::default();
            for entry in &entries {
                let (key, value) = entry
                    .split_once('=')
                    .ok_or_else(|| format!("expected FIELD=VALUE, got '{entry}'"))?;
                apply(&mut variables, key, value, beam)?;
            }
            fs::create_dir_all(&config.output.variables_dir)?;
            let path = variables.save(&config.output.variables_dir)?;
            println!("{}", path.display());
        }
        VariablesCommand::Check { file } => {
            let variables = ScanConfiguration::load(&file)?;
            for field in Field::ALL {
                let value = variables
                    .get(field)
                    .map_or_else(|| "-".to_string(), |v| v.to_string());
                println!("{:<24} {value}", field.label().trim_end());
            }
            for plane in [Plane::Horizontal, Plane::Vertical] {
                match variables.limits(plane) {
                    Ok(_) => println!("{}: ready to scan", plane.label()),
                    Err(e) => println!("{}: {e}", plane.label()),
                }
            }
            if let Ok(max) = variables.max_momentum() {
                println!("Largest reachable momentum: ±{max} mrad");
            }
        }
        VariablesCommand::Set {
            file,
            field,
            value,
            beam,
        } => {
            let mut variables = ScanConfiguration::load(&file)?;
            apply(&mut variables, &field, &value, beam)?;
            let dir = file.parent().filter(|d| !d.as_os_str().is_empty()).unwrap_or(Path::new("."));
            let path = variables.save(dir)?;
            println!("{}", path.display());
        }
    }
    Ok(())
}

fn apply(
    variables: &mut ScanConfiguration,
    key: &str,
    value: &str,
    beam: Option<BeamLine>,
) -> Result<(), Box<dyn std::error::Error>> {
    let field = Field::from_key(key.trim()).ok_or_else(|| format!("unknown field '{key}'"))?;
    let stored = variables.set(field, value, beam)?;
    if value.trim().parse::<f64>().ok() != Some(stored) {
        warn!("{} stored as {stored}", field.label().trim_end());
    }
    Ok(())
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
            eprintln!("Warning: Invalid log level '{log_level}', using 'info'");
            LevelFilter::Info
        }
    };

    env_logger::Builder::from_env(Env::default())
        .filter_level(level)
        .format_timestamp_millis()
        .init();

    Ok(())
}

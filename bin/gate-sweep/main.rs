use clap::{Args as ClapArgs, Parser, Subcommand};
use env_logger::Env;
use gate_manager::{
    convert_si_value, load_config_or_default, shared, AnalysisModel, AppConfig, CurrentUnit,
    Gate, GateError, GateSet, GatesGroup, InitialState, NanonisClient, OutputIndex, SharedInstrument,
    SignalIndex, SimulatedInstrument, Sweep1d, Sweep2d, SweepRange, SweepUnits, Sweeper,
    TimeSweep, Voltage, VoltageUnit,
};
use log::{error, info, warn, LevelFilter};
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// Gate voltage control and sweeps on a Nanonis controller
#[derive(Parser, Debug)]
#[command(name = "gate-sweep")]
#[command(about = "Set gate voltages and record 1D, 2D and time sweeps", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Run against an in-memory instrument instead of the controller
    #[arg(long)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print gate voltages (outputs) and currents (inputs)
    Read {
        /// Gate names; all configured gates when empty
        gates: Vec<String>,
    },
    /// Set one gate to a voltage such as 100mV or -0.5V
    Set {
        gate: String,
        #[arg(allow_hyphen_values = true)]
        voltage: Voltage,
        /// Return without waiting for the read-back to settle
        #[arg(long)]
        no_wait: bool,
    },
    /// Set gates to 0 V; all outputs when none are named
    Off { gates: Vec<String> },
    /// List the controller's signal names
    Signals,
    /// Sweep gates over a voltage range while recording current
    Sweep1d(Sweep1dArgs),
    /// Sweep X gates for every step of the Y gates
    Sweep2d(Sweep2dArgs),
    /// Record current at a fixed interval
    Time(TimeArgs),
}

#[derive(ClapArgs, Debug)]
struct CommonSweepArgs {
    /// Measured input gate(s); the first one is recorded
    #[arg(long, value_delimiter = ',', required = true)]
    measured: Vec<String>,

    /// Initial state as GATE=VOLTAGE, e.g. P3=0.5V (repeatable)
    #[arg(long = "init", value_name = "GATE=VOLTAGE")]
    initial_state: Vec<String>,

    #[arg(long, default_value = "uA")]
    current_unit: CurrentUnit,

    /// Analysis model tag recorded in the run log
    #[arg(long)]
    model: Option<AnalysisModel>,

    /// Appended to the data filename and the run log name
    #[arg(long)]
    comments: Option<String>,

    /// Turn every output off when the sweep finishes
    #[arg(long)]
    off_after: bool,
}

#[derive(ClapArgs, Debug)]
struct Sweep1dArgs {
    /// Swept output gate(s)
    #[arg(long, value_delimiter = ',', required = true)]
    swept: Vec<String>,
    #[arg(long, allow_hyphen_values = true)]
    start: Voltage,
    #[arg(long, allow_hyphen_values = true)]
    end: Voltage,
    #[arg(long)]
    step: Voltage,
    #[arg(long, default_value = "V")]
    voltage_unit: VoltageUnit,
    #[command(flatten)]
    common: CommonSweepArgs,
}

#[derive(ClapArgs, Debug)]
struct Sweep2dArgs {
    #[arg(long, value_delimiter = ',', required = true)]
    x_swept: Vec<String>,
    #[arg(long, allow_hyphen_values = true)]
    x_start: Voltage,
    #[arg(long, allow_hyphen_values = true)]
    x_end: Voltage,
    #[arg(long)]
    x_step: Voltage,
    #[arg(long, value_delimiter = ',', required = true)]
    y_swept: Vec<String>,
    #[arg(long, allow_hyphen_values = true)]
    y_start: Voltage,
    #[arg(long, allow_hyphen_values = true)]
    y_end: Voltage,
    #[arg(long)]
    y_step: Voltage,
    #[arg(long, default_value = "V")]
    voltage_unit: VoltageUnit,
    #[command(flatten)]
    common: CommonSweepArgs,
}

#[derive(ClapArgs, Debug)]
struct TimeArgs {
    /// Total duration in seconds
    #[arg(long)]
    total: f64,
    /// Interval between samples in seconds
    #[arg(long)]
    step: f64,
    #[command(flatten)]
    common: CommonSweepArgs,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config_or_default(args.config.as_deref())?;

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.console.verbosity.clone());
    initialize_logging(&log_level)?;
    log_startup_info(&config, args.config.as_deref(), args.simulate);

    let instrument = connect(&config, args.simulate)?;
    let gates = config.build_gates(&instrument);
    apply_slew_rates(&config, &gates)?;

    let shutdown_flag = setup_shutdown_handler()?;
    run_command(args.command, &config, &gates, &instrument, shutdown_flag)
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
        .try_init()?;

    Ok(())
}

fn log_startup_info(config: &AppConfig, config_path: Option<&Path>, simulate: bool) {
    info!("=== Gate Sweep ===");
    match config_path {
        Some(path) => info!("Configuration: {}", path.display()),
        None => info!("Configuration: defaults"),
    }
    if simulate {
        info!("Instrument: simulated");
    } else {
        info!("Nanonis: {}:{}", config.nanonis.host_ip, config.nanonis.port);
    }
    info!(
        "Device: {} at {}, amplifier {} V/A",
        config.experiment.device, config.experiment.temperature, config.experiment.amplification
    );
    info!("Gates: {}", config.gates.len());
}

/// Connect to the controller, or build an in-memory stand-in.
///
/// The stand-in echoes every output into its read-back signal and reports a
/// current on each input proportional to the sum of all outputs.
fn connect(config: &AppConfig, simulate: bool) -> Result<SharedInstrument, GateError> {
    if !simulate {
        let client = NanonisClient::builder()
            .address(&config.nanonis.host_ip)
            .port(config.nanonis.port)
            .config(config.connection_config())
            .build()?;
        info!("Connected to Nanonis system");
        return Ok(shared(client));
    }

    let mut sim = SimulatedInstrument::new();
    for gate in &config.gates {
        match gate.write_index {
            Some(output) => sim = sim.link(OutputIndex(output), SignalIndex(gate.read_index)),
            None => {
                sim = sim.current_model(SignalIndex(gate.read_index), |outputs| {
                    -outputs.values().sum::<f32>() * 1e-3
                })
            }
        }
    }
    Ok(shared(sim))
}

fn apply_slew_rates(config: &AppConfig, gates: &GateSet) -> Result<(), GateError> {
    for gate_config in &config.gates {
        if let Some(rate) = gate_config.slew_rate {
            gates.get(&gate_config.name)?.set_slew_rate(rate)?;
            info!("{}: slew rate {} V/s", gate_config.name, rate);
        }
    }
    Ok(())
}

/// Setup Ctrl+C handler for graceful shutdown
fn setup_shutdown_handler() -> Result<Arc<AtomicBool>, ctrlc::Error> {
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_clone = shutdown_flag.clone();

    ctrlc::set_handler(move || {
        info!("Ctrl+C received - stopping after the current point...");
        shutdown_flag_clone.store(true, Ordering::SeqCst);
    })?;

    Ok(shutdown_flag)
}

/// Parse `GATE=VOLTAGE` into a gate and its target.
fn parse_assignment(gates: &GateSet, text: &str) -> Result<(Gate, Voltage), GateError> {
    let (name, voltage) = text.split_once('=').ok_or_else(|| {
        GateError::InvalidSweep(format!("Expected GATE=VOLTAGE, got '{text}'"))
    })?;
    Ok((gates.get(name.trim())?.clone(), voltage.parse()?))
}

fn initial_state(gates: &GateSet, entries: &[String]) -> Result<InitialState, GateError> {
    entries.iter().map(|e| parse_assignment(gates, e)).collect()
}

fn named_or(gates: &GateSet, names: &[String], fallback: GatesGroup) -> Result<GatesGroup, GateError> {
    if names.is_empty() {
        Ok(fallback)
    } else {
        gates.group(names)
    }
}

fn run_command(
    command: Command,
    config: &AppConfig,
    gates: &GateSet,
    instrument: &SharedInstrument,
    shutdown_flag: Arc<AtomicBool>,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Read { gates: names } => {
            let all: Vec<String> = gates.names().map(str::to_string).collect();
            let group = gates.group(if names.is_empty() { &all } else { &names })?;
            for gate in group.gates() {
                if gate.is_writable() {
                    println!("{:<24} {}", gate.label(), convert_si_value(gate.voltage()?, "V"));
                } else {
                    let current = gate.read_current(config.experiment.amplification)?;
                    println!("{:<24} {}", gate.label(), convert_si_value(current, "uA"));
                }
            }
        }
        Command::Set {
            gate,
            voltage,
            no_wait,
        } => {
            let gate = gates.get(&gate)?;
            gate.set_voltage(voltage.in_volts(), !no_wait)?;
            info!("{} set to {}", gate.label(), voltage);
        }
        Command::Off { gates: names } => {
            let group = named_or(gates, &names, gates.outputs())?;
            group.turn_off(true)?;
            info!("Turned off {}", group.label());
        }
        Command::Signals => {
            let names = instrument.lock().signal_names()?;
            for (index, name) in names.iter().enumerate() {
                println!("{index:>4}  {name}");
            }
        }
        Command::Sweep1d(args) => {
            let sweep = Sweep1d {
                swept: gates.group(&args.swept)?,
                measured: gates.group(&args.common.measured)?,
                range: SweepRange::new(args.start, args.end, args.step),
                initial_state: initial_state(gates, &args.common.initial_state)?,
                units: SweepUnits {
                    voltage: args.voltage_unit,
                    current: args.common.current_unit,
                },
                model: args.common.model,
                comments: args.common.comments.clone(),
            };
            run_sweep(config, gates, shutdown_flag, args.common.off_after, |s| {
                s.sweep_1d(&sweep).map(|_| ())
            })?;
        }
        Command::Sweep2d(args) => {
            let sweep = Sweep2d {
                x_swept: gates.group(&args.x_swept)?,
                x_range: SweepRange::new(args.x_start, args.x_end, args.x_step),
                y_swept: gates.group(&args.y_swept)?,
                y_range: SweepRange::new(args.y_start, args.y_end, args.y_step),
                measured: gates.group(&args.common.measured)?,
                initial_state: initial_state(gates, &args.common.initial_state)?,
                units: SweepUnits {
                    voltage: args.voltage_unit,
                    current: args.common.current_unit,
                },
                model: args.common.model,
                comments: args.common.comments.clone(),
            };
            run_sweep(config, gates, shutdown_flag, args.common.off_after, |s| {
                s.sweep_2d(&sweep).map(|_| ())
            })?;
        }
        Command::Time(args) => {
            let sweep = TimeSweep {
                measured: gates.group(&args.common.measured)?,
                total_time: args.total,
                time_step: args.step,
                initial_state: initial_state(gates, &args.common.initial_state)?,
                current_unit: args.common.current_unit,
                model: args.common.model,
                comments: args.common.comments.clone(),
            };
            run_sweep(config, gates, shutdown_flag, args.common.off_after, |s| {
                s.sweep_time(&sweep).map(|_| ())
            })?;
        }
    }
    Ok(())
}

/// Run one sweep, turning outputs off if it fails, is aborted, or `off_after` is set.
fn run_sweep<F>(
    config: &AppConfig,
    gates: &GateSet,
    shutdown_flag: Arc<AtomicBool>,
    off_after: bool,
    sweep: F,
) -> Result<(), Box<dyn std::error::Error>>
where
    F: FnOnce(&mut Sweeper) -> Result<(), GateError>,
{
    let mut sweeper = Sweeper::new(
        gates.outputs(),
        gates.inputs(),
        config.experiment.temperature.clone(),
        config.experiment.device.clone(),
        config.sweep_options(),
    )?;
    sweeper.set_shutdown_flag(shutdown_flag.clone());

    let result = sweep(&mut sweeper);
    match &result {
        Ok(()) => {
            if let Some(name) = sweeper.last_filename() {
                info!("✓ Sweep finished: data/{name}.txt");
            }
        }
        Err(GateError::Aborted) => warn!("Sweep stopped by user"),
        Err(e) => error!("✗ Sweep failed: {e}"),
    }

    if result.is_err() || off_after || shutdown_flag.load(Ordering::SeqCst) {
        info!("Cleaning up and shutting down...");
        sweeper.cleanup();
        info!("Cleanup complete");
    }

    match result {
        Err(GateError::Aborted) => Ok(()),
        other => other.map_err(Into::into),
    }
}

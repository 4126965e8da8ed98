//! Sweep recipes: 1D and 2D voltage sweeps and fixed-interval time traces.
//!
//! Every standalone run gets a unique data file under `data/`, a figure
//! under `figures/` and a start/end block in the run log. A 2D run drives
//! nested 1D sweeps that write their points into the 2D data file.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::{Local, NaiveDate};
use log::{error, info, warn};
use ndarray::Array2;

use crate::error::GateError;
use crate::gate::{wait_until_settled, Gate, GatesGroup, DEFAULT_AMPLIFICATION};
use crate::logger::{AxisEntry, DataFile, RunHeader, RunLog};
use crate::models::{AnalysisModel, SweepKind};
use crate::plotting::{self, LivePlot};
use crate::units::{convert_si_value, CurrentUnit, SweepRange, Voltage, VoltageUnit};
use crate::utils::sleep_until;

/// Gates and the voltages they are set to before a sweep starts.
pub type InitialState = Vec<(Gate, Voltage)>;

#[derive(Debug, Clone)]
pub struct SweepOptions {
    /// Directory holding `data/`, `figures/` and the run logs
    pub root_dir: PathBuf,
    /// Amplifier gain in V/A
    pub amplification: f64,
    pub live_plot: LivePlot,
}

impl Default for SweepOptions {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("."),
            amplification: DEFAULT_AMPLIFICATION,
            live_plot: LivePlot::default(),
        }
    }
}

/// Display units for recorded data.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SweepUnits {
    pub voltage: VoltageUnit,
    pub current: CurrentUnit,
}

#[derive(Debug, Clone)]
pub struct Sweep1d {
    pub swept: GatesGroup,
    pub measured: GatesGroup,
    pub range: SweepRange,
    pub initial_state: InitialState,
    pub units: SweepUnits,
    pub model: Option<AnalysisModel>,
    pub comments: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Sweep2d {
    pub x_swept: GatesGroup,
    pub x_range: SweepRange,
    pub y_swept: GatesGroup,
    pub y_range: SweepRange,
    pub measured: GatesGroup,
    pub initial_state: InitialState,
    pub units: SweepUnits,
    pub model: Option<AnalysisModel>,
    pub comments: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TimeSweep {
    pub measured: GatesGroup,
    /// Seconds
    pub total_time: f64,
    /// Seconds
    pub time_step: f64,
    pub initial_state: InitialState,
    pub current_unit: CurrentUnit,
    pub model: Option<AnalysisModel>,
    pub comments: Option<String>,
}

/// Recorded voltages and currents, in display units.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepTrace {
    pub voltages: Vec<f64>,
    pub currents: Vec<f64>,
}

/// Elapsed seconds and currents of a time sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeTrace {
    pub times: Vec<f64>,
    pub currents: Vec<f64>,
}

fn check_gates(group: &GatesGroup, what: &str) -> Result<(), GateError> {
    if group.is_empty() {
        return Err(GateError::InvalidSweep(format!("No {what} gates given")));
    }
    Ok(())
}

fn check_range(group: &GatesGroup, range: &SweepRange) -> Result<(), GateError> {
    range.validate()?;
    let (start, end, _) = range.in_volts();
    for gate in group.gates() {
        gate.verify(start)?;
        gate.verify(end)?;
    }
    Ok(())
}

fn check_model(model: Option<AnalysisModel>, kind: SweepKind) -> Result<(), GateError> {
    model.map_or(Ok(()), |m| m.check_kind(kind))
}

impl Sweep1d {
    pub fn validate(&self) -> Result<(), GateError> {
        check_model(self.model, SweepKind::OneD)?;
        check_gates(&self.swept, "swept")?;
        check_gates(&self.measured, "measured")?;
        check_range(&self.swept, &self.range)
    }
}

impl Sweep2d {
    pub fn validate(&self) -> Result<(), GateError> {
        check_model(self.model, SweepKind::TwoD)?;
        check_gates(&self.x_swept, "X swept")?;
        check_gates(&self.y_swept, "Y swept")?;
        check_gates(&self.measured, "measured")?;
        check_range(&self.x_swept, &self.x_range)?;
        check_range(&self.y_swept, &self.y_range)
    }
}

impl TimeSweep {
    pub fn validate(&self) -> Result<(), GateError> {
        check_model(self.model, SweepKind::Time)?;
        check_gates(&self.measured, "measured")?;
        if self.total_time <= 0.0 {
            return Err(GateError::InvalidSweep("Total time must be positive".into()));
        }
        if self.time_step <= 0.0 {
            return Err(GateError::InvalidSweep("Time step must be positive".into()));
        }
        if self.time_step >= self.total_time {
            return Err(GateError::InvalidSweep(
                "Time step must be smaller than total time".into(),
            ));
        }
        Ok(())
    }

    /// Samples including the one at t = 0.
    pub fn points(&self) -> usize {
        (self.total_time / self.time_step).floor() as usize + 1
    }
}

/// `{date}_{temperature}_[{z}]_vs_[{x}]`, `..._[{y}]` for 2D, `..._vs_time`
/// for time sweeps, with `_{comments}` appended when given.
pub fn base_filename(
    kind: SweepKind,
    date: NaiveDate,
    temperature: &str,
    z_label: &str,
    x_label: &str,
    y_label: &str,
    comments: Option<&str>,
) -> String {
    let date = date.format("%Y%m%d");
    let mut name = match kind {
        SweepKind::OneD => format!("{date}_{temperature}_[{z_label}]_vs_[{x_label}]"),
        SweepKind::TwoD => {
            format!("{date}_{temperature}_[{z_label}]_vs_[{x_label}]_[{y_label}]")
        }
        SweepKind::Time => format!("{date}_{temperature}_[{z_label}]_vs_time"),
    };
    if let Some(c) = comments.filter(|c| !c.is_empty()) {
        name.push('_');
        name.push_str(c);
    }
    name
}

/// First `{base}_run{n}`, counting from 1, whose `.txt` file is not yet in `data_dir`.
pub fn unique_filename(data_dir: &Path, base: &str) -> String {
    let mut counter = 1;
    loop {
        let candidate = format!("{base}_run{counter}");
        if !data_dir.join(format!("{candidate}.txt")).is_file() {
            return candidate;
        }
        counter += 1;
    }
}

/// Set every gate without waiting, then wait for all of them together.
fn apply_initial_state(state: &[(Gate, Voltage)]) -> Result<(), GateError> {
    let targets: Vec<(&Gate, f64)> = state.iter().map(|(g, v)| (g, v.in_volts())).collect();
    for (gate, volts) in &targets {
        gate.set_voltage(*volts, false)?;
    }
    wait_until_settled(&targets)
}

/// End an open run log when a run fails, keeping the original error.
fn close_on_error<T>(run_log: &mut RunLog, result: Result<T, GateError>) -> Result<T, GateError> {
    if result.is_err() {
        if let Err(e) = run_log.end() {
            warn!("Could not close run log: {e}");
        }
    }
    result
}

pub struct Sweeper {
    outputs: GatesGroup,
    inputs: GatesGroup,
    temperature: String,
    device: String,
    options: SweepOptions,
    data_dir: PathBuf,
    figures_dir: PathBuf,
    shutdown_flag: Option<Arc<AtomicBool>>,
    last_filename: Option<String>,
}

impl Sweeper {
    /// Create the sweeper and its `data/` and `figures/` directories.
    pub fn new(
        outputs: GatesGroup,
        inputs: GatesGroup,
        temperature: impl Into<String>,
        device: impl Into<String>,
        options: SweepOptions,
    ) -> Result<Self, GateError> {
        let data_dir = options.root_dir.join("data");
        let figures_dir = options.root_dir.join("figures");
        for dir in [&data_dir, &figures_dir] {
            std::fs::create_dir_all(dir).map_err(|e| {
                error!("Failed to create directory {}: {e}", dir.display());
                GateError::io(e, format!("Could not create {dir:?}"))
            })?;
        }
        info!("Sweeper initialized in {}", options.root_dir.display());
        Ok(Self {
            outputs,
            inputs,
            temperature: temperature.into(),
            device: device.into(),
            options,
            data_dir,
            figures_dir,
            shutdown_flag: None,
            last_filename: None,
        })
    }

    /// Stop sweeps between points once `flag` is raised.
    pub fn set_shutdown_flag(&mut self, flag: Arc<AtomicBool>) {
        self.shutdown_flag = Some(flag);
    }

    pub fn outputs(&self) -> &GatesGroup {
        &self.outputs
    }

    pub fn inputs(&self) -> &GatesGroup {
        &self.inputs
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn figures_dir(&self) -> &Path {
        &self.figures_dir
    }

    /// Filename (without extension) of the most recent run.
    pub fn last_filename(&self) -> Option<&str> {
        self.last_filename.as_deref()
    }

    fn check_abort(&self) -> Result<(), GateError> {
        match &self.shutdown_flag {
            Some(flag) if flag.load(Ordering::SeqCst) => {
                warn!("Shutdown requested, aborting sweep");
                Err(GateError::Aborted)
            }
            _ => Ok(()),
        }
    }

    fn allocate_filename(
        &mut self,
        kind: SweepKind,
        z_label: &str,
        x_label: &str,
        y_label: &str,
        comments: Option<&str>,
    ) -> String {
        let base = base_filename(
            kind,
            Local::now().date_naive(),
            &self.temperature,
            z_label,
            x_label,
            y_label,
            comments,
        );
        let filename = unique_filename(&self.data_dir, &base);
        self.last_filename = Some(filename.clone());
        filename
    }

    fn data_path(&self, filename: &str) -> PathBuf {
        self.data_dir.join(format!("{filename}.txt"))
    }

    fn figure_path(&self, filename: &str) -> PathBuf {
        self.figures_dir.join(format!("{filename}.png"))
    }

    fn header(&self, filename: &str, measured: String, x_label: String) -> RunHeader {
        RunHeader {
            filename: filename.to_string(),
            device: self.device.clone(),
            measured,
            amplification: self.options.amplification,
            x_label,
            ..RunHeader::default()
        }
    }

    /// Sweep `swept` across `range`, recording the first measured gate.
    pub fn sweep_1d(&mut self, sweep: &Sweep1d) -> Result<SweepTrace, GateError> {
        self.run_1d(sweep)
            .inspect_err(|e| error!("Error during 1D sweep: {e}"))
    }

    fn run_1d(&mut self, sweep: &Sweep1d) -> Result<SweepTrace, GateError> {
        sweep.validate()?;
        let x_label = sweep.swept.label();
        let z_label = sweep.measured.label();
        let filename = self.allocate_filename(
            SweepKind::OneD,
            &z_label,
            &x_label,
            "",
            sweep.comments.as_deref(),
        );

        self.prepare_1d(sweep)?;

        let mut data = DataFile::create(self.data_path(&filename))?;
        let mut run_log = RunLog::new(&self.options.root_dir, sweep.comments.as_deref());
        let (start, end, step) = sweep.range.in_volts();
        let mut header = self.header(&filename, z_label.clone(), x_label.clone());
        header.model = sweep.model;
        header.x = Some(AxisEntry {
            label: x_label.clone(),
            start,
            end,
            step,
        });
        header.initial_voltages = self.outputs.voltages()?;
        run_log.start(&header)?;

        let result = data
            .write_header(&[
                format!("{x_label} [{}]", sweep.units.voltage),
                format!("{z_label} [{}]", sweep.units.current),
            ])
            .and_then(|_| self.record_1d(sweep, &mut data, None, &x_label));
        let trace = close_on_error(&mut run_log, result)?;

        let saved = plotting::save_line_plot(
            &self.figure_path(&filename),
            &trace.voltages,
            &trace.currents,
            step * sweep.units.voltage.scale(),
        );
        close_on_error(&mut run_log, saved)?;
        run_log.end()?;
        info!("1D sweep complete and figure saved");
        Ok(trace)
    }

    /// Apply the initial state, then bring the swept gates to the start voltage.
    fn prepare_1d(&self, sweep: &Sweep1d) -> Result<(), GateError> {
        apply_initial_state(&sweep.initial_state)?;
        sweep.swept.set_voltage(sweep.range.start.in_volts(), true)
    }

    /// The measurement loop shared by standalone and nested 1D sweeps.
    ///
    /// With `y` set, rows carry the Y voltage as a leading column.
    fn record_1d(
        &self,
        sweep: &Sweep1d,
        data: &mut DataFile,
        y: Option<(f64, &str)>,
        x_label: &str,
    ) -> Result<SweepTrace, GateError> {
        let measured = sweep
            .measured
            .first()
            .ok_or_else(|| GateError::InvalidSweep("No measured gates given".into()))?;
        let total_steps = sweep.range.points();
        let v_scale = sweep.units.voltage.scale();
        let c_scale = sweep.units.current.scale();
        let (start, end, step) = sweep.range.in_volts();
        let title = match y {
            Some((y_volts, y_label)) => format!("{y_label}: {}", convert_si_value(y_volts, "V")),
            None => format!("{} [{}] vs {x_label} [{}]", measured.label(), sweep.units.current, sweep.units.voltage),
        };

        info!(
            "Starting 1D sweep from {:.3} [{}] to {:.3} [{}]",
            start * v_scale,
            sweep.units.voltage,
            end * v_scale,
            sweep.units.voltage
        );

        let mut trace = SweepTrace {
            voltages: Vec::with_capacity(total_steps),
            currents: Vec::with_capacity(total_steps),
        };
        for i in 0..total_steps {
            self.check_abort()?;
            let x = sweep.range.voltage_at(i);
            sweep.swept.set_voltage(x, true)?;
            let x_display = x * v_scale;
            let current = measured.read_current(self.options.amplification)? * c_scale;
            trace.voltages.push(x_display);
            trace.currents.push(current);

            if self.options.live_plot.is_enabled() {
                if let Some(limits) =
                    plotting::sweep_limits(&trace.voltages, &trace.currents, step * v_scale)
                {
                    self.options
                        .live_plot
                        .line(&title, &trace.voltages, &trace.currents, limits);
                }
            }

            match y {
                Some((y_volts, _)) => data.write_row_2d(y_volts * v_scale, x_display, current)?,
                None => data.write_row_1d(x_display, current)?,
            }
        }
        Ok(trace)
    }

    /// Sweep X for every Y voltage and return the `Y × X` current map.
    ///
    /// Cells not reached (after an abort) stay NaN.
    pub fn sweep_2d(&mut self, sweep: &Sweep2d) -> Result<Array2<f64>, GateError> {
        self.run_2d(sweep)
            .inspect_err(|e| error!("Error during 2D sweep: {e}"))
    }

    fn run_2d(&mut self, sweep: &Sweep2d) -> Result<Array2<f64>, GateError> {
        sweep.validate()?;
        let x_label = sweep.x_swept.label();
        let y_label = sweep.y_swept.label();
        let z_label = sweep.measured.label();
        let filename = self.allocate_filename(
            SweepKind::TwoD,
            &z_label,
            &x_label,
            &y_label,
            sweep.comments.as_deref(),
        );

        let x_num = sweep.x_range.points();
        let y_num = sweep.y_range.points();
        let mut map = Array2::from_elem((y_num, x_num), f64::NAN);

        let mut data = DataFile::create(self.data_path(&filename))?;
        let vu = sweep.units.voltage;
        data.write_header(&[
            format!("{y_label} [{vu}]"),
            format!("{x_label} [{vu}]"),
            format!("{z_label} [{}]", sweep.units.current),
        ])?;

        let mut run_log = RunLog::new(&self.options.root_dir, sweep.comments.as_deref());
        let axis = |label: &str, range: &SweepRange| {
            let (start, end, step) = range.in_volts();
            AxisEntry {
                label: label.to_string(),
                start,
                end,
                step,
            }
        };
        let mut header = self.header(&filename, z_label.clone(), x_label.clone());
        header.model = sweep.model;
        header.x = Some(axis(&x_label, &sweep.x_range));
        header.y = Some(axis(&y_label, &sweep.y_range));
        run_log.start(&header)?;

        info!("Starting 2D sweep with {y_num} Y steps and {x_num} X steps per Y value");
        let result = self.record_2d(sweep, &mut data, &mut map, &x_label, &y_label);
        close_on_error(&mut run_log, result)?;

        run_log.end()?;
        plotting::save_heat_map(&self.figure_path(&filename), &map)?;
        info!("2D sweep completed successfully");
        Ok(map)
    }

    fn record_2d(
        &self,
        sweep: &Sweep2d,
        data: &mut DataFile,
        map: &mut Array2<f64>,
        x_label: &str,
        y_label: &str,
    ) -> Result<(), GateError> {
        let title = format!("{} [{}]", sweep.measured.label(), sweep.units.current);
        for idx in 0..sweep.y_range.points() {
            let y = sweep.y_range.voltage_at(idx);
            let mut initial_state = sweep.initial_state.clone();
            initial_state.extend(
                sweep
                    .y_swept
                    .gates()
                    .iter()
                    .map(|gate| (gate.clone(), Voltage::volts(y))),
            );
            let row = Sweep1d {
                swept: sweep.x_swept.clone(),
                measured: sweep.measured.clone(),
                range: sweep.x_range,
                initial_state,
                units: sweep.units,
                model: None,
                comments: sweep.comments.clone(),
            };

            self.prepare_1d(&row)?;
            let trace = self.record_1d(&row, data, Some((y, y_label)), x_label)?;
            for (cell, current) in map.row_mut(idx).iter_mut().zip(&trace.currents) {
                *cell = *current;
            }
            self.options.live_plot.heat_map(&title, map);
        }
        Ok(())
    }

    /// Record the first measured gate every `time_step` seconds.
    pub fn sweep_time(&mut self, sweep: &TimeSweep) -> Result<TimeTrace, GateError> {
        self.run_time(sweep)
            .inspect_err(|e| error!("Error during time sweep: {e}"))
    }

    fn run_time(&mut self, sweep: &TimeSweep) -> Result<TimeTrace, GateError> {
        sweep.validate()?;
        let x_label = "time".to_string();
        let z_label = sweep.measured.label();
        let filename = self.allocate_filename(
            SweepKind::Time,
            &z_label,
            &x_label,
            "",
            sweep.comments.as_deref(),
        );

        info!("Setting up initial state");
        self.prepare_time(&sweep.initial_state)?;

        let mut data = DataFile::create(self.data_path(&filename))?;
        data.write_header(&[
            format!("{x_label} [s]"),
            format!("{z_label} [{}]", sweep.current_unit),
        ])?;

        let mut run_log = RunLog::new(&self.options.root_dir, sweep.comments.as_deref());
        let mut header = self.header(&filename, z_label, x_label);
        header.model = sweep.model;
        header.time = Some((sweep.total_time, sweep.time_step));
        header.initial_voltages = self.outputs.voltages()?;
        run_log.start(&header)?;

        info!(
            "Starting time sweep for {:.1}s with {:.3}s steps",
            sweep.total_time, sweep.time_step
        );
        let result = self.record_time(sweep, &mut data);
        let trace = close_on_error(&mut run_log, result)?;

        let saved = plotting::save_time_plot(
            &self.figure_path(&filename),
            &trace.times,
            &trace.currents,
            sweep.time_step,
        );
        close_on_error(&mut run_log, saved)?;
        run_log.end()?;
        info!("Time sweep completed successfully");
        Ok(trace)
    }

    /// Turn off every output not in `initial_state`, then apply it.
    fn prepare_time(&self, initial_state: &[(Gate, Voltage)]) -> Result<(), GateError> {
        let idle: GatesGroup = self
            .outputs
            .gates()
            .iter()
            .filter(|gate| !initial_state.iter().any(|(g, _)| g.same_channel(gate)))
            .cloned()
            .collect();
        if !idle.is_empty() {
            info!("Turning off idle outputs: {}", idle.label());
            idle.turn_off(true)?;
        }
        apply_initial_state(initial_state)
    }

    fn record_time(&self, sweep: &TimeSweep, data: &mut DataFile) -> Result<TimeTrace, GateError> {
        let measured = sweep
            .measured
            .first()
            .ok_or_else(|| GateError::InvalidSweep("No measured gates given".into()))?;
        let total_steps = sweep.points();
        let scale = sweep.current_unit.scale();
        let step = Duration::from_secs_f64(sweep.time_step);
        let title = format!("{} [{}] vs time [s]", measured.label(), sweep.current_unit);

        let mut trace = TimeTrace {
            times: Vec::with_capacity(total_steps),
            currents: Vec::with_capacity(total_steps),
        };
        let t0 = Instant::now();
        for i in 0..total_steps {
            self.check_abort()?;
            let elapsed = t0.elapsed().as_secs_f64();
            let current = measured.read_current(self.options.amplification)? * scale;
            trace.times.push(elapsed);
            trace.currents.push(current);

            if self.options.live_plot.is_enabled() {
                if let Some(limits) =
                    plotting::time_limits(&trace.times, &trace.currents, sweep.time_step)
                {
                    self.options
                        .live_plot
                        .line(&title, &trace.times, &trace.currents, limits);
                }
            }
            data.write_row_time(elapsed, current)?;

            if i + 1 < total_steps {
                sleep_until(t0 + step * (i as u32 + 1), step / 100);
            }
        }
        Ok(trace)
    }

    /// Turn every output off and forget the last run. Failures are logged.
    pub fn cleanup(&mut self) {
        if !self.outputs.is_empty() {
            info!("Turning off outputs: {}", self.outputs.label());
            if let Err(e) = self.outputs.turn_off(true) {
                error!("Error during cleanup: {e}");
            }
        }
        self.last_filename = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::{Line, NanonisSource, RampSettings};
    use crate::nanonis::{SharedInstrument, SimulatedInstrument};
    use crate::types::{OutputIndex, SignalIndex};
    use parking_lot::Mutex;
    use tempfile::{tempdir, TempDir};

    struct Bench {
        sim: Arc<Mutex<SimulatedInstrument>>,
        p1: Gate,
        p2: Gate,
        drain: Gate,
        dir: TempDir,
    }

    /// Two plunger outputs; the drain signal reads out1 + 10 * out2.
    fn bench() -> Bench {
        let sim = Arc::new(Mutex::new(
            SimulatedInstrument::new()
                .link(OutputIndex(1), SignalIndex(24))
                .link(OutputIndex(2), SignalIndex(25))
                .settle_reads(1)
                .current_model(SignalIndex(0), |out| {
                    out.get(&OutputIndex(1)).copied().unwrap_or(0.0)
                        + 10.0 * out.get(&OutputIndex(2)).copied().unwrap_or(0.0)
                }),
        ));
        let shared: SharedInstrument = sim.clone();
        let ramp = RampSettings {
            poll_interval: Duration::from_millis(1),
            settle_timeout: Some(Duration::from_secs(2)),
            ..RampSettings::default()
        };
        let p1 = Gate::new(
            NanonisSource::output("output1", 24, 1),
            vec![Line::new("t_P1")],
            shared.clone(),
        )
        .with_ramp(ramp.clone());
        let p2 = Gate::new(
            NanonisSource::output("output2", 25, 2),
            vec![Line::new("t_P2")],
            shared.clone(),
        )
        .with_ramp(ramp);
        let drain = Gate::new(NanonisSource::input("input1", 0), vec![Line::new("t_D")], shared);
        Bench {
            sim,
            p1,
            p2,
            drain,
            dir: tempdir().unwrap(),
        }
    }

    impl Bench {
        fn sweeper(&self) -> Sweeper {
            Sweeper::new(
                GatesGroup::new(vec![self.p1.clone(), self.p2.clone()]),
                GatesGroup::new(vec![self.drain.clone()]),
                "4K",
                "Dev1",
                SweepOptions {
                    root_dir: self.dir.path().to_path_buf(),
                    amplification: 1e6,
                    live_plot: LivePlot::disabled(),
                },
            )
            .unwrap()
        }

        fn sweep_p1(&self, start: f64, end: f64, step: f64) -> Sweep1d {
            Sweep1d {
                swept: GatesGroup::new(vec![self.p1.clone()]),
                measured: GatesGroup::new(vec![self.drain.clone()]),
                range: SweepRange::new(
                    Voltage::volts(start),
                    Voltage::volts(end),
                    Voltage::volts(step),
                ),
                initial_state: Vec::new(),
                units: SweepUnits::default(),
                model: None,
                comments: None,
            }
        }

        fn read(&self, relative: &str) -> String {
            std::fs::read_to_string(self.dir.path().join(relative)).unwrap()
        }
    }

    fn assert_close(actual: &[f64], expected: &[f64]) {
        assert_eq!(actual.len(), expected.len(), "{actual:?} vs {expected:?}");
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-6 * e.abs().max(1.0), "{actual:?} vs {expected:?}");
        }
    }

    #[test]
    fn test_base_filename() {
        let date = NaiveDate::from_ymd_opt(2025, 3, 7).unwrap();
        assert_eq!(
            base_filename(SweepKind::OneD, date, "4K", "t_D", "t_P1", "", None),
            "20250307_4K_[t_D]_vs_[t_P1]"
        );
        assert_eq!(
            base_filename(SweepKind::TwoD, date, "4K", "t_D", "t_P1", "t_P2", Some("scan")),
            "20250307_4K_[t_D]_vs_[t_P1]_[t_P2]_scan"
        );
        assert_eq!(
            base_filename(SweepKind::Time, date, "300mK", "t_D", "time", "", None),
            "20250307_300mK_[t_D]_vs_time"
        );
    }

    #[test]
    fn test_unique_filename_counts_runs() {
        let dir = tempdir().unwrap();
        assert_eq!(unique_filename(dir.path(), "base"), "base_run1");
        std::fs::write(dir.path().join("base_run1.txt"), "").unwrap();
        std::fs::write(dir.path().join("base_run2.txt"), "").unwrap();
        assert_eq!(unique_filename(dir.path(), "base"), "base_run3");
    }

    #[test]
    fn test_new_creates_directories() {
        let bench = bench();
        let sweeper = bench.sweeper();
        assert!(sweeper.data_dir().is_dir());
        assert!(sweeper.figures_dir().is_dir());
    }

    #[test]
    fn test_sweep_1d_records_trace_and_files() {
        let bench = bench();
        let mut sweeper = bench.sweeper();
        let trace = sweeper.sweep_1d(&bench.sweep_p1(0.0, 0.2, 0.1)).unwrap();

        assert_close(&trace.voltages, &[0.0, 0.1, 0.2]);
        assert_close(&trace.currents, &[0.0, 0.1, 0.2]);

        let filename = sweeper.last_filename().unwrap().to_string();
        assert!(filename.ends_with("_4K_[t_D]_vs_[t_P1]_run1"));
        let data = bench.read(&format!("data/{filename}.txt"));
        let lines: Vec<&str> = data.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "        t_P1 [V]        t_D [uA]");
        assert!(bench.dir.path().join(format!("figures/{filename}.png")).exists());

        let log = bench.read("log.txt");
        assert!(log.contains("Run started at"));
        assert!(log.contains("Run ended at"));
        assert!(log.contains("Initial Voltages of all outputs before sweep:"));
    }

    #[test]
    fn test_sweep_1d_descending_in_millivolts() {
        let bench = bench();
        let mut sweeper = bench.sweeper();
        let mut sweep = bench.sweep_p1(0.2, 0.0, 0.1);
        sweep.units.voltage = VoltageUnit::MilliVolt;
        sweep.units.current = CurrentUnit::NanoAmp;
        let trace = sweeper.sweep_1d(&sweep).unwrap();
        assert_close(&trace.voltages, &[200.0, 100.0, 0.0]);
        assert_close(&trace.currents, &[200.0, 100.0, 0.0]);
    }

    #[test]
    fn test_sweep_1d_applies_initial_state_first() {
        let bench = bench();
        let mut sweeper = bench.sweeper();
        let mut sweep = bench.sweep_p1(0.0, 0.1, 0.1);
        sweep.initial_state = vec![(bench.p2.clone(), Voltage::millivolts(50.0))];
        let trace = sweeper.sweep_1d(&sweep).unwrap();

        let calls = bench.sim.lock().set_calls().to_vec();
        assert_eq!(calls[0], (OutputIndex(2), 0.05));
        assert_eq!(calls[1], (OutputIndex(1), 0.0));
        assert_close(&trace.currents, &[0.5, 0.6]);
    }

    #[test]
    fn test_second_run_gets_next_number() {
        let bench = bench();
        let mut sweeper = bench.sweeper();
        sweeper.sweep_1d(&bench.sweep_p1(0.0, 0.1, 0.1)).unwrap();
        sweeper.sweep_1d(&bench.sweep_p1(0.0, 0.1, 0.1)).unwrap();
        assert!(sweeper.last_filename().unwrap().ends_with("_run2"));
    }

    #[test]
    fn test_invalid_range_touches_nothing() {
        let bench = bench();
        let mut sweeper = bench.sweeper();
        let result = sweeper.sweep_1d(&bench.sweep_p1(0.0, 0.05, 0.1));
        assert!(matches!(result, Err(GateError::InvalidSweep(_))));
        let result = sweeper.sweep_1d(&bench.sweep_p1(0.0, 3.0, 0.1));
        assert!(matches!(result, Err(GateError::OutOfRange { .. })));
        assert!(bench.sim.lock().set_calls().is_empty());
    }

    #[test]
    fn test_model_must_match_sweep_kind() {
        let bench = bench();
        let mut sweeper = bench.sweeper();
        let mut sweep = bench.sweep_p1(0.0, 0.1, 0.1);
        sweep.model = Some(AnalysisModel::NoiseAnalyzer);
        assert!(matches!(
            sweeper.sweep_1d(&sweep),
            Err(GateError::UnsupportedModel { .. })
        ));
        sweep.model = Some(AnalysisModel::PinchOffClassifier);
        sweeper.sweep_1d(&sweep).unwrap();
        assert!(bench.read("log.txt").contains("pinch-off-classifier"));
    }

    #[test]
    fn test_abort_closes_run_log() {
        let bench = bench();
        let mut sweeper = bench.sweeper();
        sweeper.set_shutdown_flag(Arc::new(AtomicBool::new(true)));
        let mut sweep = bench.sweep_p1(0.0, 0.1, 0.1);
        sweep.comments = Some("aborted".into());
        assert!(matches!(sweeper.sweep_1d(&sweep), Err(GateError::Aborted)));
        let log = bench.read("log_aborted.txt");
        assert!(log.contains("Run ended at"));
    }

    #[test]
    fn test_sweep_2d_fills_map_and_one_file() {
        let bench = bench();
        let mut sweeper = bench.sweeper();
        let sweep = Sweep2d {
            x_swept: GatesGroup::new(vec![bench.p1.clone()]),
            x_range: SweepRange::new(Voltage::volts(0.0), Voltage::volts(0.2), Voltage::volts(0.1)),
            y_swept: GatesGroup::new(vec![bench.p2.clone()]),
            y_range: SweepRange::new(Voltage::volts(0.0), Voltage::volts(0.1), Voltage::volts(0.1)),
            measured: GatesGroup::new(vec![bench.drain.clone()]),
            initial_state: Vec::new(),
            units: SweepUnits::default(),
            model: Some(AnalysisModel::TriplePointDetector),
            comments: None,
        };
        let map = sweeper.sweep_2d(&sweep).unwrap();

        assert_eq!(map.dim(), (2, 3));
        assert_close(map.row(0).as_slice().unwrap(), &[0.0, 0.1, 0.2]);
        assert_close(map.row(1).as_slice().unwrap(), &[1.0, 1.1, 1.2]);

        let files: Vec<_> = std::fs::read_dir(sweeper.data_dir()).unwrap().collect();
        assert_eq!(files.len(), 1);
        let filename = sweeper.last_filename().unwrap().to_string();
        assert!(filename.contains("_vs_[t_P1]_[t_P2]_run1"));
        let data = bench.read(&format!("data/{filename}.txt"));
        let lines: Vec<&str> = data.lines().collect();
        assert_eq!(lines.len(), 7);
        assert_eq!(lines[6].split_whitespace().count(), 3);
        assert!(lines[6].trim_start().starts_with("0.1000"));
        assert!(bench.dir.path().join(format!("figures/{filename}.png")).exists());

        let log = bench.read("log.txt");
        assert_eq!(log.matches("Run started at").count(), 1);
        assert!(log.contains("Y Swept Gates:   t_P2"));
    }

    #[test]
    fn test_sweep_time_turns_off_idle_outputs() {
        let bench = bench();
        let mut sweeper = bench.sweeper();
        bench.p2.set_voltage(0.3, true).unwrap();
        let sweep = TimeSweep {
            measured: GatesGroup::new(vec![bench.drain.clone()]),
            total_time: 0.05,
            time_step: 0.02,
            initial_state: vec![(bench.p1.clone(), Voltage::millivolts(100.0))],
            current_unit: CurrentUnit::MicroAmp,
            model: Some(AnalysisModel::DriftDetector),
            comments: Some("drift".into()),
        };
        let trace = sweeper.sweep_time(&sweep).unwrap();

        assert_eq!(trace.times.len(), 3);
        assert!(trace.times.windows(2).all(|w| w[1] > w[0]));
        assert_close(&trace.currents, &[0.1, 0.1, 0.1]);
        assert_eq!(bench.sim.lock().output(OutputIndex(2)), Some(0.0));

        let filename = sweeper.last_filename().unwrap().to_string();
        assert!(filename.ends_with("_vs_time_drift_run1"));
        let data = bench.read(&format!("data/{filename}.txt"));
        assert_eq!(data.lines().next(), Some("        time [s]        t_D [uA]"));
        assert_eq!(data.lines().count(), 4);
        assert!(bench.read("log_drift.txt").contains("Time Step:"));
    }

    #[test]
    fn test_time_sweep_validation() {
        let bench = bench();
        let mut sweeper = bench.sweeper();
        let mut sweep = TimeSweep {
            measured: GatesGroup::new(vec![bench.drain.clone()]),
            total_time: 1.0,
            time_step: 1.0,
            initial_state: Vec::new(),
            current_unit: CurrentUnit::MicroAmp,
            model: None,
            comments: None,
        };
        assert!(matches!(sweeper.sweep_time(&sweep), Err(GateError::InvalidSweep(_))));
        sweep.total_time = 0.0;
        assert!(sweeper.sweep_time(&sweep).is_err());
        sweep.total_time = 2.5;
        sweep.time_step = 1.0;
        assert_eq!(sweep.points(), 3);
    }

    #[test]
    fn test_cleanup_turns_outputs_off() {
        let bench = bench();
        let mut sweeper = bench.sweeper();
        sweeper.sweep_1d(&bench.sweep_p1(0.0, 0.1, 0.1)).unwrap();
        sweeper.cleanup();
        let sim = bench.sim.lock();
        assert_eq!(sim.output(OutputIndex(1)), Some(0.0));
        assert_eq!(sim.output(OutputIndex(2)), Some(0.0));
        drop(sim);
        assert!(sweeper.last_filename().is_none());
    }
}

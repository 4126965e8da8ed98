use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::GateError;
use crate::gate::{Gate, GatesGroup, Line, NanonisSource, RampSettings, DEFAULT_AMPLIFICATION};
use crate::nanonis::{ConnectionConfig, SharedInstrument};
use crate::plotting::LivePlot;
use crate::sweeper::SweepOptions;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub nanonis: NanonisConfig,
    pub gates: Vec<GateConfig>,
    pub experiment: ExperimentConfig,
    pub ramp: RampConfig,
    pub plot: PlotConfig,
    pub console: ConsoleConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct NanonisConfig {
    pub host_ip: String,
    pub port: u16,
    pub connect_timeout_secs: f64,
    pub read_timeout_secs: f64,
    pub write_timeout_secs: f64,
}

/// One gate: its device lines and the controller channels it is wired to.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct GateConfig {
    pub name: String,
    #[serde(default)]
    pub lines: Vec<String>,
    pub read_index: u8,
    /// Missing for input-only gates
    #[serde(default)]
    pub write_index: Option<u8>,
    /// Output slew rate in V/s, applied at startup
    #[serde(default)]
    pub slew_rate: Option<f64>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ExperimentConfig {
    pub device: String,
    pub temperature: String,
    /// Amplifier gain in V/A
    pub amplification: f64,
    pub output_dir: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct RampConfig {
    pub tolerance: f64,
    pub poll_interval_ms: u64,
    /// Unset waits indefinitely for gates to settle
    pub settle_timeout_secs: Option<f64>,
    pub min_voltage: f64,
    pub max_voltage: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct PlotConfig {
    pub live: bool,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ConsoleConfig {
    pub verbosity: String,
}

impl Default for NanonisConfig {
    fn default() -> Self {
        Self {
            host_ip: "127.0.0.1".to_string(),
            port: 6501,
            connect_timeout_secs: 5.0,
            read_timeout_secs: 10.0,
            write_timeout_secs: 5.0,
        }
    }
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            device: "device".to_string(),
            temperature: "RT".to_string(),
            amplification: DEFAULT_AMPLIFICATION,
            output_dir: PathBuf::from("."),
        }
    }
}

impl Default for RampConfig {
    fn default() -> Self {
        let ramp = RampSettings::default();
        Self {
            tolerance: ramp.tolerance,
            poll_interval_ms: ramp.poll_interval.as_millis() as u64,
            settle_timeout_secs: None,
            min_voltage: ramp.min_voltage,
            max_voltage: ramp.max_voltage,
        }
    }
}

impl Default for PlotConfig {
    fn default() -> Self {
        Self {
            live: true,
            width: 120,
            height: 40,
        }
    }
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            verbosity: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Validate all configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ramp.validate()?;

        if self.experiment.amplification == 0.0 {
            return Err(ConfigError::Message(
                "experiment.amplification must be non-zero".to_string(),
            ));
        }

        let mut names = HashSet::new();
        let mut outputs = HashSet::new();
        for gate in &self.gates {
            if !names.insert(gate.name.as_str()) {
                return Err(ConfigError::Message(format!(
                    "Duplicate gate name '{}'",
                    gate.name
                )));
            }
            if let Some(index) = gate.write_index {
                if !outputs.insert(index) {
                    return Err(ConfigError::Message(format!(
                        "Gate '{}' reuses output {}",
                        gate.name, index
                    )));
                }
            }
            if gate.slew_rate.is_some_and(|rate| rate <= 0.0) {
                return Err(ConfigError::Message(format!(
                    "Gate '{}' slew_rate must be positive",
                    gate.name
                )));
            }
        }
        Ok(())
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: Duration::from_secs_f64(self.nanonis.connect_timeout_secs),
            read_timeout: Duration::from_secs_f64(self.nanonis.read_timeout_secs),
            write_timeout: Duration::from_secs_f64(self.nanonis.write_timeout_secs),
        }
    }

    pub fn ramp_settings(&self) -> RampSettings {
        RampSettings {
            tolerance: self.ramp.tolerance,
            poll_interval: Duration::from_millis(self.ramp.poll_interval_ms),
            settle_timeout: self.ramp.settle_timeout_secs.map(Duration::from_secs_f64),
            min_voltage: self.ramp.min_voltage,
            max_voltage: self.ramp.max_voltage,
        }
    }

    pub fn sweep_options(&self) -> SweepOptions {
        SweepOptions {
            root_dir: self.experiment.output_dir.clone(),
            amplification: self.experiment.amplification,
            live_plot: LivePlot::new(self.plot.live, self.plot.width, self.plot.height),
        }
    }

    /// Create every configured gate on `instrument`.
    pub fn build_gates(&self, instrument: &SharedInstrument) -> GateSet {
        let ramp = self.ramp_settings();
        let gates = self
            .gates
            .iter()
            .map(|cfg| (cfg.name.clone(), cfg.build(instrument, ramp.clone())))
            .collect();
        GateSet { gates }
    }
}

impl RampConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.tolerance <= 0.0 {
            return Err(ConfigError::Message(format!(
                "ramp.tolerance must be positive, got: {}",
                self.tolerance
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Message(
                "ramp.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.settle_timeout_secs.is_some_and(|t| t <= 0.0) {
            return Err(ConfigError::Message(
                "ramp.settle_timeout_secs must be positive when set".to_string(),
            ));
        }
        if self.min_voltage >= self.max_voltage {
            return Err(ConfigError::Message(format!(
                "ramp.min_voltage ({}) must be less than ramp.max_voltage ({})",
                self.min_voltage, self.max_voltage
            )));
        }
        Ok(())
    }
}

impl GateConfig {
    pub fn build(&self, instrument: &SharedInstrument, ramp: RampSettings) -> Gate {
        let source = NanonisSource {
            label: self.name.clone(),
            read_index: self.read_index.into(),
            write_index: self.write_index.map(Into::into),
        };
        let lines = if self.lines.is_empty() {
            vec![Line::new(&self.name)]
        } else {
            self.lines.iter().map(Line::new).collect()
        };
        Gate::new(source, lines, instrument.clone()).with_ramp(ramp)
    }
}

/// Configured gates, looked up by name.
#[derive(Debug, Clone, Default)]
pub struct GateSet {
    gates: Vec<(String, Gate)>,
}

impl GateSet {
    pub fn get(&self, name: &str) -> Result<&Gate, GateError> {
        self.gates
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, gate)| gate)
            .ok_or_else(|| GateError::UnknownGate(name.to_string()))
    }

    /// Group the named gates, in the order given.
    pub fn group<S: AsRef<str>>(&self, names: &[S]) -> Result<GatesGroup, GateError> {
        names
            .iter()
            .map(|name| self.get(name.as_ref()).cloned())
            .collect::<Result<Vec<_>, _>>()
            .map(GatesGroup::new)
    }

    /// Every gate with a write index.
    pub fn outputs(&self) -> GatesGroup {
        self.gates
            .iter()
            .filter(|(_, g)| g.is_writable())
            .map(|(_, g)| g.clone())
            .collect()
    }

    /// Every read-only gate.
    pub fn inputs(&self) -> GatesGroup {
        self.gates
            .iter()
            .filter(|(_, g)| !g.is_writable())
            .map(|(_, g)| g.clone())
            .collect()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.gates.iter().map(|(n, _)| n.as_str())
    }
}

/// Load configuration from file with environment overrides.
///
/// Without an explicit path, `gate_manager.toml` and `config.toml` in the
/// working directory are tried in that order.
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder();

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(File::from(path));
        } else {
            return Err(ConfigError::Message(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
    } else {
        let possible_paths = ["gate_manager.toml", "config.toml"];
        if let Some(path) = possible_paths.iter().find(|p| Path::new(p).exists()) {
            builder = builder.add_source(File::with_name(path));
        }
    }

    // e.g. GATE_MANAGER__NANONIS__PORT=6502
    builder = builder.add_source(
        Environment::with_prefix("GATE_MANAGER")
            .separator("__")
            .try_parsing(true),
    );

    let config: AppConfig = builder.build()?.try_deserialize()?;
    config.validate()?;
    Ok(config)
}

/// Like [`load_config`], but fall back to defaults when no file was requested.
///
/// An explicitly requested file that fails to load is still an error.
pub fn load_config_or_default(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    match load_config(config_path) {
        Ok(config) => {
            log::info!("Configuration loaded successfully");
            Ok(config)
        }
        Err(e) if config_path.is_some() => Err(e),
        Err(e) => {
            log::warn!("Failed to load config ({}), using defaults", e);
            Ok(AppConfig::default())
        }
    }
}

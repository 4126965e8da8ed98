pub mod config;
pub mod error;
pub mod gate;
pub mod logger;
pub mod models;
pub mod nanonis;
pub mod plotting;
pub mod sweeper;
pub mod types;
pub mod units;
pub mod utils;

pub use config::{load_config, load_config_or_default, AppConfig, GateConfig, GateSet};
pub use error::GateError;
pub use gate::{Gate, GatesGroup, Line, NanonisSource, RampSettings, DEFAULT_AMPLIFICATION};
pub use logger::{DataFile, RunLog};
pub use models::{AnalysisModel, SweepKind};
pub use nanonis::{
    shared, ConnectionConfig, Instrument, NanonisClient, NanonisClientBuilder,
    SharedInstrument, SimulatedInstrument,
};
pub use plotting::LivePlot;
pub use sweeper::{
    InitialState, Sweep1d, Sweep2d, SweepOptions, SweepTrace, SweepUnits, Sweeper,
    TimeSweep, TimeTrace,
};
pub use types::{NanonisValue, OutputIndex, SignalIndex};
pub use units::{convert_si_value, CurrentUnit, SweepRange, Voltage, VoltageUnit};

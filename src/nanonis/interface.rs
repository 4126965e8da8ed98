use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::client::NanonisClient;
use crate::error::GateError;
use crate::types::{OutputIndex, SignalIndex};

/// The controller operations gates are built on.
///
/// `NanonisClient` maps these onto `Signals.*` and `UserOut.*` commands;
/// [`SimulatedInstrument`] provides an in-memory stand-in for dry runs and
/// tests.
pub trait Instrument: Send {
    /// Read several signals at once, in the order given
    fn read_signals(&mut self, indices: &[SignalIndex], wait: bool) -> Result<Vec<f32>, GateError>;

    /// Read a single signal
    fn read_signal(&mut self, index: SignalIndex, wait: bool) -> Result<f32, GateError>;

    /// Set a user output to `value` (volts)
    fn set_output(&mut self, index: OutputIndex, value: f32) -> Result<(), GateError>;

    /// Set the slew rate of a user output (V/s)
    fn set_slew_rate(&mut self, index: OutputIndex, volts_per_second: f64) -> Result<(), GateError>;

    /// Names of all signals, indexed by signal index
    fn signal_names(&mut self) -> Result<Vec<String>, GateError>;
}

/// One instrument connection shared by every gate on it.
pub type SharedInstrument = Arc<Mutex<dyn Instrument>>;

/// Wrap an instrument for sharing between gates.
pub fn shared<I: Instrument + 'static>(instrument: I) -> SharedInstrument {
    Arc::new(Mutex::new(instrument))
}

impl Instrument for NanonisClient {
    fn read_signals(&mut self, indices: &[SignalIndex], wait: bool) -> Result<Vec<f32>, GateError> {
        self.signals_vals_get(indices, wait)
    }

    fn read_signal(&mut self, index: SignalIndex, wait: bool) -> Result<f32, GateError> {
        self.signal_val_get(index, wait)
    }

    fn set_output(&mut self, index: OutputIndex, value: f32) -> Result<(), GateError> {
        self.user_out_val_set(index, value)
    }

    fn set_slew_rate(&mut self, index: OutputIndex, volts_per_second: f64) -> Result<(), GateError> {
        self.user_out_slew_rate_set(index, volts_per_second)
    }

    fn signal_names(&mut self) -> Result<Vec<String>, GateError> {
        self.signal_names_get()
    }
}

/// In-memory instrument.
///
/// Outputs can be linked to read-back signals so that setting an output
/// moves the linked signal toward the new value. With `settle_reads > 0` the
/// read-back only reaches the set value after that many reads, which
/// exercises the settle loop. A linked current signal reports a value
/// computed from the present output voltages.
pub struct SimulatedInstrument {
    signals: HashMap<SignalIndex, f32>,
    links: HashMap<OutputIndex, SignalIndex>,
    targets: HashMap<SignalIndex, (f32, u32)>,
    currents: HashMap<SignalIndex, Box<dyn Fn(&HashMap<OutputIndex, f32>) -> f32 + Send>>,
    outputs: HashMap<OutputIndex, f32>,
    slew_rates: HashMap<OutputIndex, f64>,
    settle_reads: u32,
    set_calls: Vec<(OutputIndex, f32)>,
}

impl Default for SimulatedInstrument {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedInstrument {
    pub fn new() -> Self {
        Self {
            signals: HashMap::new(),
            links: HashMap::new(),
            targets: HashMap::new(),
            currents: HashMap::new(),
            outputs: HashMap::new(),
            slew_rates: HashMap::new(),
            settle_reads: 0,
            set_calls: Vec::new(),
        }
    }

    /// Route an output to the signal that reads it back
    pub fn link(mut self, output: OutputIndex, readback: SignalIndex) -> Self {
        self.links.insert(output, readback);
        self.signals.entry(readback).or_insert(0.0);
        self
    }

    /// Number of reads before a read-back reaches a new set value
    pub fn settle_reads(mut self, reads: u32) -> Self {
        self.settle_reads = reads;
        self
    }

    /// Report a computed value on `signal` from the current output voltages
    pub fn current_model<F>(mut self, signal: SignalIndex, model: F) -> Self
    where
        F: Fn(&HashMap<OutputIndex, f32>) -> f32 + Send + 'static,
    {
        self.currents.insert(signal, Box::new(model));
        self
    }

    /// Force a signal value
    pub fn set_signal(&mut self, index: SignalIndex, value: f32) {
        self.signals.insert(index, value);
        self.targets.remove(&index);
    }

    /// Every `set_output` call so far, in order
    pub fn set_calls(&self) -> &[(OutputIndex, f32)] {
        &self.set_calls
    }

    pub fn output(&self, index: OutputIndex) -> Option<f32> {
        self.outputs.get(&index).copied()
    }

    pub fn slew_rate(&self, index: OutputIndex) -> Option<f64> {
        self.slew_rates.get(&index).copied()
    }

    fn sample(&mut self, index: SignalIndex) -> f32 {
        if let Some(model) = self.currents.get(&index) {
            return model(&self.outputs);
        }
        if let Some((target, remaining)) = self.targets.get_mut(&index) {
            if *remaining == 0 {
                let target = *target;
                self.signals.insert(index, target);
                self.targets.remove(&index);
            } else {
                *remaining -= 1;
            }
        }
        self.signals.get(&index).copied().unwrap_or(0.0)
    }
}

impl Instrument for SimulatedInstrument {
    fn read_signals(&mut self, indices: &[SignalIndex], _wait: bool) -> Result<Vec<f32>, GateError> {
        Ok(indices.iter().map(|&i| self.sample(i)).collect())
    }

    fn read_signal(&mut self, index: SignalIndex, _wait: bool) -> Result<f32, GateError> {
        Ok(self.sample(index))
    }

    fn set_output(&mut self, index: OutputIndex, value: f32) -> Result<(), GateError> {
        self.set_calls.push((index, value));
        self.outputs.insert(index, value);
        if let Some(&readback) = self.links.get(&index) {
            if self.settle_reads == 0 {
                self.signals.insert(readback, value);
            } else {
                self.targets.insert(readback, (value, self.settle_reads));
            }
        }
        Ok(())
    }

    fn set_slew_rate(&mut self, index: OutputIndex, volts_per_second: f64) -> Result<(), GateError> {
        self.slew_rates.insert(index, volts_per_second);
        Ok(())
    }

    fn signal_names(&mut self) -> Result<Vec<String>, GateError> {
        let max = self.signals.keys().map(|i| i.get()).max().unwrap_or(0);
        Ok((0..=max).map(|i| format!("Signal {i}")).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linked_output_reads_back() {
        let mut sim = SimulatedInstrument::new().link(OutputIndex(1), SignalIndex(24));
        sim.set_output(OutputIndex(1), 0.75).unwrap();
        assert_eq!(sim.read_signals(&[SignalIndex(24)], true).unwrap(), vec![0.75]);
    }

    #[test]
    fn test_settle_reads_delay_readback() {
        let mut sim = SimulatedInstrument::new()
            .link(OutputIndex(2), SignalIndex(25))
            .settle_reads(2);
        sim.set_output(OutputIndex(2), 1.0).unwrap();
        assert_eq!(sim.read_signal(SignalIndex(25), true).unwrap(), 0.0);
        assert_eq!(sim.read_signal(SignalIndex(25), true).unwrap(), 0.0);
        assert_eq!(sim.read_signal(SignalIndex(25), true).unwrap(), 1.0);
    }

    #[test]
    fn test_current_model_follows_outputs() {
        let mut sim = SimulatedInstrument::new().current_model(SignalIndex(0), |outputs| {
            outputs.get(&OutputIndex(1)).copied().unwrap_or(0.0) * 2.0
        });
        sim.set_output(OutputIndex(1), 0.5).unwrap();
        assert_eq!(sim.read_signal(SignalIndex(0), true).unwrap(), 1.0);
    }
}

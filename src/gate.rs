//! Gates: named device terminals wired to Nanonis outputs and inputs.

use std::time::{Duration, Instant};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::GateError;
use crate::nanonis::SharedInstrument;
use crate::types::{OutputIndex, SignalIndex};
use crate::utils::{poll_until, PollError};

/// Default amplifier gain in V/A. The transimpedance amplifier inverts.
pub const DEFAULT_AMPLIFICATION: f64 = -1e6;

/// One physical line of the device (a bond pad or fan-out wire).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Line {
    pub label: String,
}

impl Line {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

/// The controller channels a gate is wired to.
///
/// Every gate reads back through a signal; only output gates can be written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NanonisSource {
    pub label: String,
    pub read_index: SignalIndex,
    pub write_index: Option<OutputIndex>,
}

impl NanonisSource {
    pub fn output(label: impl Into<String>, read_index: u8, write_index: u8) -> Self {
        Self {
            label: label.into(),
            read_index: SignalIndex(read_index),
            write_index: Some(OutputIndex(write_index)),
        }
    }

    pub fn input(label: impl Into<String>, read_index: u8) -> Self {
        Self {
            label: label.into(),
            read_index: SignalIndex(read_index),
            write_index: None,
        }
    }
}

/// How gates are allowed to move and when they count as settled.
#[derive(Debug, Clone, PartialEq)]
pub struct RampSettings {
    /// Largest |read - target| that counts as arrived (V)
    pub tolerance: f64,
    /// Time between read-backs while waiting
    pub poll_interval: Duration,
    /// Give up waiting after this long; `None` waits indefinitely
    pub settle_timeout: Option<Duration>,
    pub min_voltage: f64,
    pub max_voltage: f64,
}

impl Default for RampSettings {
    fn default() -> Self {
        Self {
            tolerance: 1e-6,
            poll_interval: Duration::from_millis(100),
            settle_timeout: None,
            min_voltage: -2.5,
            max_voltage: 2.5,
        }
    }
}

/// A device terminal driven or read through the Nanonis controller.
///
/// Cloning a gate is cheap; clones share the instrument connection.
#[derive(Clone)]
pub struct Gate {
    source: NanonisSource,
    lines: Vec<Line>,
    instrument: SharedInstrument,
    ramp: RampSettings,
}

impl std::fmt::Debug for Gate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gate")
            .field("source", &self.source)
            .field("lines", &self.lines)
            .field("ramp", &self.ramp)
            .finish_non_exhaustive()
    }
}

impl Gate {
    pub fn new(source: NanonisSource, lines: Vec<Line>, instrument: SharedInstrument) -> Self {
        Self {
            source,
            lines,
            instrument,
            ramp: RampSettings::default(),
        }
    }

    pub fn with_ramp(mut self, ramp: RampSettings) -> Self {
        self.ramp = ramp;
        self
    }

    pub fn source(&self) -> &NanonisSource {
        &self.source
    }

    pub fn lines(&self) -> &[Line] {
        &self.lines
    }

    pub fn ramp(&self) -> &RampSettings {
        &self.ramp
    }

    pub fn is_writable(&self) -> bool {
        self.source.write_index.is_some()
    }

    /// Line labels joined with `&`, or the source label for a gate without lines.
    pub fn label(&self) -> String {
        if self.lines.is_empty() {
            return self.source.label.clone();
        }
        self.lines
            .iter()
            .map(|line| line.label.as_str())
            .collect::<Vec<_>>()
            .join("&")
    }

    /// True when both gates drive the same controller channels.
    pub fn same_channel(&self, other: &Gate) -> bool {
        self.source.read_index == other.source.read_index
            && self.source.write_index == other.source.write_index
    }

    /// Check `target` against the allowed voltage window.
    pub fn verify(&self, target: f64) -> Result<(), GateError> {
        if !(self.ramp.min_voltage..=self.ramp.max_voltage).contains(&target) {
            return Err(GateError::OutOfRange {
                label: self.label(),
                target,
                min: self.ramp.min_voltage,
                max: self.ramp.max_voltage,
            });
        }
        Ok(())
    }

    /// Send a new set point without waiting for the output to get there.
    pub fn set_volt(&self, target: f64) -> Result<(), GateError> {
        self.verify(target)?;
        let write_index = self
            .source
            .write_index
            .ok_or_else(|| GateError::ReadOnly(self.label()))?;
        debug!("{} -> {} V (output {})", self.label(), target, write_index.get());
        self.instrument.lock().set_output(write_index, target as f32)
    }

    /// Read the gate voltage back from its signal.
    pub fn get_volt(&self) -> Result<f64, GateError> {
        let values = self
            .instrument
            .lock()
            .read_signals(&[self.source.read_index], true)?;
        values.first().map(|&v| v as f64).ok_or_else(|| {
            GateError::Protocol(format!("No value returned for {}", self.label()))
        })
    }

    /// Current voltage of the gate (V).
    pub fn voltage(&self) -> Result<f64, GateError> {
        self.get_volt()
    }

    /// Set the gate voltage, optionally blocking until the read-back settles.
    pub fn set_voltage(&self, target: f64, wait: bool) -> Result<(), GateError> {
        self.set_volt(target)?;
        if wait {
            wait_until_settled(&[(self, target)])?;
        }
        Ok(())
    }

    pub fn turn_off(&self, wait: bool) -> Result<(), GateError> {
        self.set_voltage(0.0, wait)
    }

    pub fn is_at_target_voltage(&self, target: f64) -> Result<bool, GateError> {
        let voltage = self.get_volt()?;
        Ok((voltage - target).abs() < self.ramp.tolerance)
    }

    /// Measured current in µA.
    ///
    /// The signal is the amplifier output voltage; `amplification` is the
    /// amplifier gain in V/A.
    pub fn read_current(&self, amplification: f64) -> Result<f64, GateError> {
        let raw = self
            .instrument
            .lock()
            .read_signal(self.source.read_index, true)?;
        Ok(raw as f64 * 1e6 / amplification)
    }

    pub fn set_slew_rate(&self, volts_per_second: f64) -> Result<(), GateError> {
        let write_index = self
            .source
            .write_index
            .ok_or_else(|| GateError::ReadOnly(self.label()))?;
        self.instrument
            .lock()
            .set_slew_rate(write_index, volts_per_second)
    }
}

/// Block until every gate reads back within tolerance of its target.
///
/// Poll interval and timeout come from the first gate's ramp settings.
pub fn wait_until_settled(targets: &[(&Gate, f64)]) -> Result<(), GateError> {
    let Some((first, _)) = targets.first() else {
        return Ok(());
    };
    let ramp = first.ramp().clone();
    let start = Instant::now();

    let all_settled = || -> Result<bool, GateError> {
        for (gate, target) in targets {
            if !gate.is_at_target_voltage(*target)? {
                return Ok(false);
            }
        }
        Ok(true)
    };

    poll_until(all_settled, ramp.settle_timeout, ramp.poll_interval).map_err(|e| match e {
        PollError::ConditionError(e) => e,
        PollError::Timeout(_) => GateError::SettleTimeout {
            label: targets
                .iter()
                .map(|(gate, _)| gate.label())
                .collect::<Vec<_>>()
                .join(", "),
            target: targets[0].1,
            waited_ms: start.elapsed().as_millis(),
        },
    })
}

/// Several gates driven together.
#[derive(Debug, Clone, Default)]
pub struct GatesGroup {
    gates: Vec<Gate>,
}

impl GatesGroup {
    pub fn new(gates: Vec<Gate>) -> Self {
        Self { gates }
    }

    pub fn gates(&self) -> &[Gate] {
        &self.gates
    }

    pub fn first(&self) -> Option<&Gate> {
        self.gates.first()
    }

    pub fn len(&self) -> usize {
        self.gates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }

    pub fn contains(&self, gate: &Gate) -> bool {
        self.gates.iter().any(|g| g.same_channel(gate))
    }

    /// Every line of every gate, joined with ` & `.
    pub fn label(&self) -> String {
        self.gates
            .iter()
            .flat_map(|gate| {
                if gate.lines().is_empty() {
                    vec![gate.source().label.clone()]
                } else {
                    gate.lines().iter().map(|l| l.label.clone()).collect()
                }
            })
            .collect::<Vec<_>>()
            .join(" & ")
    }

    /// Send the same set point to every gate without waiting.
    pub fn set_volt(&self, target: f64) -> Result<(), GateError> {
        for gate in &self.gates {
            gate.set_volt(target)?;
        }
        Ok(())
    }

    /// Set every gate, then optionally wait until all have settled.
    pub fn set_voltage(&self, target: f64, wait: bool) -> Result<(), GateError> {
        for gate in &self.gates {
            gate.set_voltage(target, false)?;
        }
        if wait {
            let targets: Vec<(&Gate, f64)> = self.gates.iter().map(|g| (g, target)).collect();
            wait_until_settled(&targets)?;
        }
        Ok(())
    }

    pub fn turn_off(&self, wait: bool) -> Result<(), GateError> {
        self.set_voltage(0.0, wait)
    }

    /// Read every gate's voltage, paired with its label.
    pub fn voltages(&self) -> Result<Vec<(String, f64)>, GateError> {
        self.gates
            .iter()
            .map(|gate| Ok((gate.label(), gate.voltage()?)))
            .collect()
    }
}

impl FromIterator<Gate> for GatesGroup {
    fn from_iter<T: IntoIterator<Item = Gate>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nanonis::SimulatedInstrument;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn fast_ramp() -> RampSettings {
        RampSettings {
            poll_interval: Duration::from_millis(1),
            settle_timeout: Some(Duration::from_secs(2)),
            ..RampSettings::default()
        }
    }

    fn setup(settle_reads: u32) -> (Arc<Mutex<SimulatedInstrument>>, Gate, Gate) {
        let sim = Arc::new(Mutex::new(
            SimulatedInstrument::new()
                .link(OutputIndex(1), SignalIndex(24))
                .link(OutputIndex(2), SignalIndex(25))
                .settle_reads(settle_reads),
        ));
        let shared: SharedInstrument = sim.clone();
        let p1 = Gate::new(
            NanonisSource::output("output1", 24, 1),
            vec![Line::new("t_P1"), Line::new("t_P1b")],
            shared.clone(),
        )
        .with_ramp(fast_ramp());
        let p2 = Gate::new(
            NanonisSource::output("output2", 25, 2),
            vec![Line::new("t_P2")],
            shared,
        )
        .with_ramp(fast_ramp());
        (sim, p1, p2)
    }

    #[test]
    fn test_label_joins_lines() {
        let (_, p1, _) = setup(0);
        assert_eq!(p1.label(), "t_P1&t_P1b");
    }

    #[test]
    fn test_set_volt_writes_output() {
        let (sim, p1, _) = setup(0);
        p1.set_volt(1.5).unwrap();
        assert_eq!(sim.lock().set_calls(), &[(OutputIndex(1), 1.5)]);
    }

    #[test]
    fn test_get_volt_reads_signal() {
        let (sim, p1, _) = setup(0);
        sim.lock().set_signal(SignalIndex(24), 1.5);
        assert_eq!(p1.get_volt().unwrap(), 1.5);
    }

    #[test]
    fn test_verify_range() {
        let (_, p1, _) = setup(0);
        assert!(p1.verify(1.0).is_ok());
        assert!(p1.verify(2.5).is_ok());
        assert!(matches!(p1.verify(5.0), Err(GateError::OutOfRange { .. })));
        assert!(p1.verify(-2.6).is_err());
    }

    #[test]
    fn test_out_of_range_is_never_sent() {
        let (sim, p1, _) = setup(0);
        assert!(p1.set_volt(3.0).is_err());
        assert!(sim.lock().set_calls().is_empty());
    }

    #[test]
    fn test_read_only_gate_rejects_writes() {
        let (sim, _, _) = setup(0);
        let shared: SharedInstrument = sim.clone();
        let input = Gate::new(NanonisSource::input("input1", 0), vec![Line::new("t_D")], shared);
        assert!(matches!(input.set_volt(0.1), Err(GateError::ReadOnly(label)) if label == "t_D"));
        assert!(matches!(input.set_slew_rate(0.1), Err(GateError::ReadOnly(_))));
    }

    #[test]
    fn test_turn_off_sets_zero() {
        let (sim, p1, _) = setup(0);
        p1.set_voltage(0.4, true).unwrap();
        p1.turn_off(true).unwrap();
        assert_eq!(sim.lock().set_calls().last(), Some(&(OutputIndex(1), 0.0)));
        assert_eq!(p1.voltage().unwrap(), 0.0);
    }

    #[test]
    fn test_is_at_target_voltage() {
        let (sim, p1, _) = setup(0);
        sim.lock().set_signal(SignalIndex(24), 1.5);
        assert!(p1.is_at_target_voltage(1.5).unwrap());
        assert!(!p1.is_at_target_voltage(1.0).unwrap());
    }

    #[test]
    fn test_set_voltage_waits_for_readback() {
        let (sim, p1, _) = setup(3);
        p1.set_voltage(0.2, true).unwrap();
        assert!(p1.is_at_target_voltage(0.2).unwrap());
        assert_eq!(sim.lock().set_calls().len(), 1);
    }

    #[test]
    fn test_settle_timeout() {
        let (sim, p1, _) = setup(0);
        let p1 = p1.with_ramp(RampSettings {
            settle_timeout: Some(Duration::from_millis(20)),
            poll_interval: Duration::from_millis(1),
            ..RampSettings::default()
        });
        // Pin the read-back so the output never appears to arrive.
        p1.set_volt(0.5).unwrap();
        sim.lock().set_signal(SignalIndex(24), 0.0);
        let result = wait_until_settled(&[(&p1, 0.5)]);
        assert!(matches!(result, Err(GateError::SettleTimeout { .. })));
    }

    #[test]
    fn test_read_current_applies_amplification() {
        let (sim, _, _) = setup(0);
        let shared: SharedInstrument = sim.clone();
        let input = Gate::new(NanonisSource::input("input1", 0), vec![Line::new("t_D")], shared);
        sim.lock().set_signal(SignalIndex(0), 1.0);
        let current = input.read_current(DEFAULT_AMPLIFICATION).unwrap();
        assert!((current + 1.0).abs() < 1e-12);
        let current = input.read_current(1e6).unwrap();
        assert!((current - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_group_sets_all_then_waits() {
        let (sim, p1, p2) = setup(2);
        let group = GatesGroup::new(vec![p1.clone(), p2.clone()]);
        group.set_voltage(1.0, true).unwrap();
        assert_eq!(
            sim.lock().set_calls(),
            &[(OutputIndex(1), 1.0), (OutputIndex(2), 1.0)]
        );
        assert!(p1.is_at_target_voltage(1.0).unwrap());
        assert!(p2.is_at_target_voltage(1.0).unwrap());
    }

    #[test]
    fn test_group_set_volt_and_turn_off() {
        let (sim, p1, p2) = setup(0);
        let group = GatesGroup::new(vec![p1, p2]);
        group.set_volt(2.0).unwrap();
        group.turn_off(true).unwrap();
        let sim = sim.lock();
        assert_eq!(sim.output(OutputIndex(1)), Some(0.0));
        assert_eq!(sim.output(OutputIndex(2)), Some(0.0));
        assert_eq!(sim.set_calls().len(), 4);
    }

    #[test]
    fn test_group_label() {
        let (_, p1, p2) = setup(0);
        let group: GatesGroup = vec![p1, p2].into_iter().collect();
        assert_eq!(group.label(), "t_P1 & t_P1b & t_P2");
    }

    #[test]
    fn test_group_contains_by_channel() {
        let (_, p1, p2) = setup(0);
        let group = GatesGroup::new(vec![p1.clone()]);
        assert!(group.contains(&p1.clone()));
        assert!(!group.contains(&p2));
    }

    #[test]
    fn test_slew_rate_forwarded() {
        let (sim, p1, _) = setup(0);
        p1.set_slew_rate(0.1).unwrap();
        assert_eq!(sim.lock().slew_rate(OutputIndex(1)), Some(0.1));
    }
}

//! Voltage and current units.
//!
//! Sweep parameters arrive as a value plus a unit (`[1.0, "mV"]`) and are
//! converted to volts before anything touches the hardware. Recorded data
//! is rescaled into the display units picked for the run.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::GateError;

const VOLTAGE_UNITS: &str = "{V, mV, uV, nV}";
const CURRENT_UNITS: &str = "{mA, uA, nA, pA}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum VoltageUnit {
    #[default]
    V,
    #[serde(rename = "mV")]
    MilliVolt,
    #[serde(rename = "uV")]
    MicroVolt,
    #[serde(rename = "nV")]
    NanoVolt,
}

impl VoltageUnit {
    /// Factor converting a value in this unit to volts
    pub fn to_volts(self) -> f64 {
        match self {
            VoltageUnit::V => 1.0,
            VoltageUnit::MilliVolt => 1e-3,
            VoltageUnit::MicroVolt => 1e-6,
            VoltageUnit::NanoVolt => 1e-9,
        }
    }

    /// Factor converting volts to this unit, for display
    pub fn scale(self) -> f64 {
        match self {
            VoltageUnit::V => 1.0,
            VoltageUnit::MilliVolt => 1e3,
            VoltageUnit::MicroVolt => 1e6,
            VoltageUnit::NanoVolt => 1e9,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            VoltageUnit::V => "V",
            VoltageUnit::MilliVolt => "mV",
            VoltageUnit::MicroVolt => "uV",
            VoltageUnit::NanoVolt => "nV",
        }
    }
}

impl fmt::Display for VoltageUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for VoltageUnit {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "V" => Ok(VoltageUnit::V),
            "mV" => Ok(VoltageUnit::MilliVolt),
            "uV" | "µV" | "μV" => Ok(VoltageUnit::MicroVolt),
            "nV" => Ok(VoltageUnit::NanoVolt),
            other => Err(GateError::InvalidUnit {
                kind: "voltage",
                unit: other.to_string(),
                allowed: VOLTAGE_UNITS,
            }),
        }
    }
}

/// Display unit for measured current. Gates report current in µA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CurrentUnit {
    #[serde(rename = "mA")]
    MilliAmp,
    #[default]
    #[serde(rename = "uA")]
    MicroAmp,
    #[serde(rename = "nA")]
    NanoAmp,
    #[serde(rename = "pA")]
    PicoAmp,
}

impl CurrentUnit {
    /// Factor converting µA to this unit
    pub fn scale(self) -> f64 {
        match self {
            CurrentUnit::MilliAmp => 1e-3,
            CurrentUnit::MicroAmp => 1.0,
            CurrentUnit::NanoAmp => 1e3,
            CurrentUnit::PicoAmp => 1e6,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            CurrentUnit::MilliAmp => "mA",
            CurrentUnit::MicroAmp => "uA",
            CurrentUnit::NanoAmp => "nA",
            CurrentUnit::PicoAmp => "pA",
        }
    }
}

impl fmt::Display for CurrentUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for CurrentUnit {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mA" => Ok(CurrentUnit::MilliAmp),
            "uA" | "µA" | "μA" => Ok(CurrentUnit::MicroAmp),
            "nA" => Ok(CurrentUnit::NanoAmp),
            "pA" => Ok(CurrentUnit::PicoAmp),
            other => Err(GateError::InvalidUnit {
                kind: "current",
                unit: other.to_string(),
                allowed: CURRENT_UNITS,
            }),
        }
    }
}

/// A voltage as entered by the user: a number and its unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Voltage {
    pub value: f64,
    pub unit: VoltageUnit,
}

impl Voltage {
    pub fn new(value: f64, unit: VoltageUnit) -> Self {
        Self { value, unit }
    }

    pub fn volts(value: f64) -> Self {
        Self::new(value, VoltageUnit::V)
    }

    pub fn millivolts(value: f64) -> Self {
        Self::new(value, VoltageUnit::MilliVolt)
    }

    /// The value converted to volts
    pub fn in_volts(&self) -> f64 {
        self.value * self.unit.to_volts()
    }
}

impl fmt::Display for Voltage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.value, self.unit)
    }
}

/// Parses `"100mV"`, `"-0.5 V"`, `"2uV"` or a bare number in volts.
impl FromStr for Voltage {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let number = s.trim_end_matches(|c: char| c.is_alphabetic());
        let unit = &s[number.len()..];
        let value: f64 = number.trim().parse().map_err(|_| {
            GateError::InvalidSweep(format!("'{s}' is not a voltage"))
        })?;
        let unit = match unit.trim() {
            "" => VoltageUnit::V,
            u => u.parse()?,
        };
        Ok(Voltage { value, unit })
    }
}

/// Start, end and step of one swept axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepRange {
    pub start: Voltage,
    pub end: Voltage,
    pub step: Voltage,
}

impl SweepRange {
    pub fn new(start: Voltage, end: Voltage, step: Voltage) -> Self {
        Self { start, end, step }
    }

    /// Check that the step is positive and fits inside the range.
    pub fn validate(&self) -> Result<(), GateError> {
        if self.step.value <= 0.0 {
            return Err(GateError::InvalidSweep("Step size must be positive".into()));
        }
        let span = (self.end.in_volts() - self.start.in_volts()).abs();
        if span < self.step.in_volts() {
            return Err(GateError::InvalidSweep(
                "Step size is larger than voltage range".into(),
            ));
        }
        Ok(())
    }

    /// The range in volts: (start, end, step)
    pub fn in_volts(&self) -> (f64, f64, f64) {
        (
            self.start.in_volts(),
            self.end.in_volts(),
            self.step.in_volts(),
        )
    }

    /// Number of points including both ends.
    pub fn points(&self) -> usize {
        let (start, end, step) = self.in_volts();
        ((end - start).abs() / step).round() as usize + 1
    }

    /// Voltage of point `i`, stepping toward `end`.
    pub fn voltage_at(&self, i: usize) -> f64 {
        let (start, end, step) = self.in_volts();
        if start < end {
            start + i as f64 * step
        } else {
            start - i as f64 * step
        }
    }
}

/// Format a value with the SI prefix that puts its mantissa in [1, 1000).
///
/// `unit` may already carry a single-character prefix (`"mV"`), which is
/// folded into the value first. The result reads like `"100.000 [mV]"`.
pub fn convert_si_value(value: f64, unit: &str) -> String {
    let mut chars = unit.chars();
    let (prefix_factor, base_unit) = match (chars.next(), chars.next()) {
        (Some(p), Some(next)) if next.is_alphabetic() => match prefix_multiplier(p) {
            Some(factor) => (factor, &unit[p.len_utf8()..]),
            None => (1.0, unit),
        },
        _ => (1.0, unit),
    };

    let base_value = value * prefix_factor;
    if base_value == 0.0 {
        return format!("{:>7.3} [{}]", 0.0, base_unit);
    }

    let exponent = base_value.abs().log10().floor() as i32;
    let exponent3 = (exponent.div_euclid(3) * 3).clamp(-24, 24);
    let new_value = base_value / 10f64.powi(exponent3);
    format!("{:>7.3} [{}{}]", new_value, si_prefix(exponent3), base_unit)
}

fn prefix_multiplier(prefix: char) -> Option<f64> {
    Some(match prefix {
        'Y' => 1e24,
        'Z' => 1e21,
        'E' => 1e18,
        'P' => 1e15,
        'T' => 1e12,
        'G' => 1e9,
        'M' => 1e6,
        'k' => 1e3,
        'm' => 1e-3,
        'u' | 'µ' | 'μ' => 1e-6,
        'n' => 1e-9,
        'p' => 1e-12,
        'f' => 1e-15,
        'a' => 1e-18,
        'z' => 1e-21,
        'y' => 1e-24,
        _ => return None,
    })
}

fn si_prefix(exponent3: i32) -> &'static str {
    match exponent3 {
        -24 => "y",
        -21 => "z",
        -18 => "a",
        -15 => "f",
        -12 => "p",
        -9 => "n",
        -6 => "u",
        -3 => "m",
        3 => "k",
        6 => "M",
        9 => "G",
        12 => "T",
        15 => "P",
        18 => "E",
        21 => "Z",
        24 => "Y",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voltage_units_convert_to_volts() {
        assert_eq!(Voltage::volts(1.5).in_volts(), 1.5);
        assert!((Voltage::millivolts(250.0).in_volts() - 0.25).abs() < 1e-12);
        assert!((Voltage::new(3.0, VoltageUnit::NanoVolt).in_volts() - 3e-9).abs() < 1e-20);
    }

    #[test]
    fn test_display_scales() {
        assert_eq!(VoltageUnit::V.scale(), 1.0);
        assert_eq!(VoltageUnit::MilliVolt.scale(), 1e3);
        assert_eq!(CurrentUnit::MicroAmp.scale(), 1.0);
        assert_eq!(CurrentUnit::PicoAmp.scale(), 1e6);
        assert_eq!(CurrentUnit::MilliAmp.scale(), 1e-3);
    }

    #[test]
    fn test_parse_voltage_strings() {
        assert_eq!("100mV".parse::<Voltage>().unwrap(), Voltage::millivolts(100.0));
        assert_eq!("-0.5 V".parse::<Voltage>().unwrap(), Voltage::volts(-0.5));
        assert_eq!("1.2".parse::<Voltage>().unwrap(), Voltage::volts(1.2));
        assert_eq!(
            "20uV".parse::<Voltage>().unwrap(),
            Voltage::new(20.0, VoltageUnit::MicroVolt)
        );
        assert_eq!("1e-3V".parse::<Voltage>().unwrap(), Voltage::volts(1e-3));
    }

    #[test]
    fn test_parse_rejects_unknown_units() {
        assert!(matches!(
            "5kV".parse::<Voltage>(),
            Err(GateError::InvalidUnit { kind: "voltage", .. })
        ));
        assert!("fA".parse::<CurrentUnit>().is_err());
        assert!("abc".parse::<Voltage>().is_err());
    }

    #[test]
    fn test_sweep_range_validation() {
        let ok = SweepRange::new(Voltage::volts(0.0), Voltage::volts(1.0), Voltage::millivolts(10.0));
        assert!(ok.validate().is_ok());

        let negative = SweepRange::new(Voltage::volts(0.0), Voltage::volts(1.0), Voltage::volts(-0.1));
        assert!(matches!(negative.validate(), Err(GateError::InvalidSweep(_))));

        let too_big = SweepRange::new(Voltage::volts(0.0), Voltage::millivolts(5.0), Voltage::volts(0.1));
        assert!(too_big.validate().is_err());
    }

    #[test]
    fn test_sweep_range_points_both_directions() {
        let up = SweepRange::new(Voltage::volts(0.0), Voltage::volts(1.0), Voltage::volts(0.25));
        assert_eq!(up.points(), 5);
        assert_eq!(up.voltage_at(4), 1.0);

        let down = SweepRange::new(Voltage::volts(1.0), Voltage::volts(0.0), Voltage::volts(0.5));
        assert_eq!(down.points(), 3);
        assert_eq!(down.voltage_at(1), 0.5);
        assert_eq!(down.voltage_at(2), 0.0);
    }

    #[test]
    fn test_convert_si_value() {
        assert_eq!(convert_si_value(0.1, "V"), "100.000 [mV]");
        assert_eq!(convert_si_value(1.5, "V"), "  1.500 [V]");
        assert_eq!(convert_si_value(0.0, "V"), "  0.000 [V]");
        assert_eq!(convert_si_value(-2.5e-6, "V"), " -2.500 [uV]");
        assert_eq!(convert_si_value(1500.0, "mV"), "  1.500 [V]");
        assert_eq!(convert_si_value(12.0, "uA"), " 12.000 [uA]");
    }
}

use chrono::{DateTime, Local};
use log::info;
use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use crate::error::GateError;
use crate::models::AnalysisModel;
use crate::units::convert_si_value;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One swept axis as recorded in the run log (volts).
#[derive(Debug, Clone, PartialEq)]
pub struct AxisEntry {
    pub label: String,
    pub start: f64,
    pub end: f64,
    pub step: f64,
}

/// Everything written in a run's start block.
#[derive(Debug, Clone, Default)]
pub struct RunHeader {
    pub filename: String,
    pub device: String,
    pub measured: String,
    pub amplification: f64,
    pub model: Option<AnalysisModel>,
    /// Swept X gates, `time` for time sweeps
    pub x_label: String,
    pub x: Option<AxisEntry>,
    pub y: Option<AxisEntry>,
    /// Total time and time step in seconds
    pub time: Option<(f64, f64)>,
    /// Output gate voltages before the run, omitted for 2D runs
    pub initial_voltages: Vec<(String, f64)>,
}

/// Append-only run log shared by every run with the same comment.
#[derive(Debug)]
pub struct RunLog {
    path: PathBuf,
    started: Option<DateTime<Local>>,
}

impl RunLog {
    /// `log.txt` under `root`, or `log_{comments}.txt` when comments are given.
    pub fn new(root: &Path, comments: Option<&str>) -> Self {
        let name = match comments {
            Some(c) if !c.is_empty() => format!("log_{c}.txt"),
            _ => "log.txt".to_string(),
        };
        Self {
            path: root.join(name),
            started: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.started.is_some()
    }

    pub fn start(&mut self, header: &RunHeader) -> Result<(), GateError> {
        let now = Local::now();
        let mut text = String::new();
        text.push_str(&format!(
            "--------/// Run started at {} ///--------\n",
            now.format(TIMESTAMP_FORMAT)
        ));
        text.push_str(&format!("{:<16} {}.txt\n", "Filename:", header.filename));
        text.push_str(&format!("{:<16} {}\n", "Device:", header.device));
        text.push_str(&format!("{:<16} {}\n", "Measured Input:", header.measured));
        text.push_str(&format!("{:<16} {} V/A\n", "Amplifier:", header.amplification));
        if let Some(model) = header.model {
            text.push_str(&format!("{:<16} {}\n", "Model:", model));
        }
        text.push('\n');

        text.push_str(&format!("{:<16} {}\n", "X Swept Gates:", header.x_label));
        if let Some(x) = &header.x {
            push_axis(&mut text, x);
        }
        if let Some(y) = &header.y {
            text.push_str(&format!("{:<16} {}\n", "Y Swept Gates:", y.label));
            push_axis(&mut text, y);
        }
        if let Some((total, step)) = header.time {
            text.push_str(&format!("{:<16} {:>16.2} [s]\n", "Total Time:", total));
            text.push_str(&format!("{:<16} {:>16.2} [s]\n", "Time Step:", step));
            text.push('\n');
        }
        if header.y.is_none() {
            text.push_str("Initial Voltages of all outputs before sweep:\n");
            for (label, voltage) in &header.initial_voltages {
                text.push_str(&format!("{:<55} {}\n", label, convert_si_value(*voltage, "V")));
            }
            text.push('\n');
        }

        self.append(&text)?;
        self.started = Some(now);
        info!("Run {} logged to {}", header.filename, self.path.display());
        Ok(())
    }

    /// Write the end block. Does nothing if no run was started.
    pub fn end(&mut self) -> Result<(), GateError> {
        let Some(started) = self.started.take() else {
            return Ok(());
        };
        let now = Local::now();
        let (h, m, s) = split_duration((now - started).num_seconds().max(0));
        self.append(&format!(
            "{:<16} {h}h {m}m {s}s\n--------/// Run ended at {} ///--------\n\n",
            "Total Time:",
            now.format(TIMESTAMP_FORMAT)
        ))
    }

    fn append(&self, text: &str) -> Result<(), GateError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| GateError::io(e, format!("Could not open run log {:?}", self.path)))?;
        file.write_all(text.as_bytes())
            .map_err(|e| GateError::io(e, format!("Could not write run log {:?}", self.path)))
    }
}

fn push_axis(text: &mut String, axis: &AxisEntry) {
    text.push_str(&format!("{:<16} {}\n", "Start Voltage:", convert_si_value(axis.start, "V")));
    text.push_str(&format!("{:<16} {}\n", "End Voltage:", convert_si_value(axis.end, "V")));
    text.push_str(&format!("{:<16} {}\n", "Step Size:", convert_si_value(axis.step, "V")));
    text.push('\n');
}

fn split_duration(total_seconds: i64) -> (i64, i64, i64) {
    (total_seconds / 3600, (total_seconds % 3600) / 60, total_seconds % 60)
}

/// Whitespace-aligned measurement file, flushed after every row.
#[derive(Debug)]
pub struct DataFile {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl DataFile {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, GateError> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| GateError::io(e, format!("Could not open data file {path:?}")))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Column titles, each right-aligned to 16 characters.
    pub fn write_header(&mut self, columns: &[String]) -> Result<(), GateError> {
        let line: String = columns.iter().map(|c| format!("{c:>16}")).collect();
        self.write_line(&line)
    }

    pub fn write_row_1d(&mut self, x: f64, current: f64) -> Result<(), GateError> {
        self.write_line(&format!("{x:>16.4} {current:>16.8}"))
    }

    pub fn write_row_2d(&mut self, y: f64, x: f64, current: f64) -> Result<(), GateError> {
        self.write_line(&format!("{y:>16.4} {x:>16.4} {current:>16.8}"))
    }

    pub fn write_row_time(&mut self, t: f64, current: f64) -> Result<(), GateError> {
        self.write_line(&format!("{t:>16.2} {current:>16.8}"))
    }

    fn write_line(&mut self, line: &str) -> Result<(), GateError> {
        writeln!(self.writer, "{line}")
            .and_then(|_| self.writer.flush())
            .map_err(|e| GateError::io(e, format!("Could not write data file {:?}", self.path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_log_name_follows_comments() {
        let dir = tempdir().unwrap();
        assert!(RunLog::new(dir.path(), None).path().ends_with("log.txt"));
        assert!(RunLog::new(dir.path(), Some("cooldown"))
            .path()
            .ends_with("log_cooldown.txt"));
    }

    #[test]
    fn test_start_and_end_blocks() {
        let dir = tempdir().unwrap();
        let mut log = RunLog::new(dir.path(), None);
        let header = RunHeader {
            filename: "20250101_4K_[t_D]_vs_[t_P1]_run1".into(),
            device: "Dev1".into(),
            measured: "t_D".into(),
            amplification: -1e6,
            model: Some(AnalysisModel::PinchOffClassifier),
            x_label: "t_P1".into(),
            x: Some(AxisEntry {
                label: "t_P1".into(),
                start: 0.0,
                end: 0.1,
                step: 0.01,
            }),
            initial_voltages: vec![("t_P1".into(), 0.0)],
            ..RunHeader::default()
        };
        log.start(&header).unwrap();
        assert!(log.is_open());
        log.end().unwrap();
        assert!(!log.is_open());

        let text = std::fs::read_to_string(log.path()).unwrap();
        assert!(text.starts_with("--------/// Run started at "));
        assert!(text.contains("Filename:        20250101_4K_[t_D]_vs_[t_P1]_run1.txt\n"));
        assert!(text.contains("Measured Input:  t_D\n"));
        assert!(text.contains("Model:           pinch-off-classifier\n"));
        assert!(text.contains("End Voltage:     100.000 [mV]\n"));
        assert!(text.contains("Step Size:        10.000 [mV]\n"));
        assert!(text.contains("Initial Voltages of all outputs before sweep:\n"));
        assert!(text.contains("Total Time:      0h 0m 0s\n"));
        assert!(text.trim_end().ends_with("///--------"));
    }

    #[test]
    fn test_end_without_start_is_noop() {
        let dir = tempdir().unwrap();
        let mut log = RunLog::new(dir.path(), None);
        log.end().unwrap();
        assert!(!log.path().exists());
    }

    #[test]
    fn test_2d_header_skips_initial_voltages() {
        let dir = tempdir().unwrap();
        let mut log = RunLog::new(dir.path(), None);
        let axis = AxisEntry {
            label: "t_P2".into(),
            start: 0.0,
            end: 1.0,
            step: 0.5,
        };
        log.start(&RunHeader {
            y: Some(axis.clone()),
            x: Some(axis),
            initial_voltages: vec![("t_P1".into(), 0.0)],
            ..RunHeader::default()
        })
        .unwrap();
        let text = std::fs::read_to_string(log.path()).unwrap();
        assert!(text.contains("Y Swept Gates:   t_P2\n"));
        assert!(!text.contains("Initial Voltages"));
    }

    #[test]
    fn test_data_rows_are_aligned() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.txt");
        let mut data = DataFile::create(&path).unwrap();
        data.write_header(&["t_P1 [V]".to_string(), "t_D [uA]".to_string()])
            .unwrap();
        data.write_row_1d(0.5, -0.00125).unwrap();
        data.write_row_2d(1.0, 0.5, 2.0).unwrap();
        data.write_row_time(3.256, 1.0).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "        t_P1 [V]        t_D [uA]");
        assert_eq!(lines[1], "          0.5000      -0.00125000");
        assert_eq!(lines[2], "          1.0000           0.5000       2.00000000");
        assert_eq!(lines[3], "            3.26       1.00000000");
    }

    #[test]
    fn test_split_duration() {
        assert_eq!(split_duration(3725), (1, 2, 5));
        assert_eq!(split_duration(59), (0, 0, 59));
    }
}

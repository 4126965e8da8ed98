use super::NanonisClient;
use crate::error::GateError;
use crate::types::{NanonisValue, SignalIndex};

impl NanonisClient {
    /// Get available signal names
    pub fn signal_names_get(&mut self) -> Result<Vec<String>, GateError> {
        let result = self.quick_send("Signals.NamesGet", vec![], vec![], vec!["+*c"])?;
        match result.first() {
            Some(value) => Ok(value.as_string_array()?.to_vec()),
            None => Err(GateError::Protocol("No signal names returned".to_string())),
        }
    }

    /// Get current values of signals by index(es).
    ///
    /// Values come back in the order the indexes were given.
    pub fn signals_vals_get(
        &mut self,
        signal_indexes: &[SignalIndex],
        wait_for_newest_data: bool,
    ) -> Result<Vec<f32>, GateError> {
        let indexes: Vec<i32> = signal_indexes.iter().map(|&i| i.into()).collect();
        let wait_flag = u32::from(wait_for_newest_data);

        let result = self.quick_send(
            "Signals.ValsGet",
            vec![NanonisValue::ArrayI32(indexes), NanonisValue::U32(wait_flag)],
            vec!["+*i", "I"],
            vec!["i", "*f"],
        )?;

        match result.get(1) {
            Some(values) => Ok(values.as_f32_array()?.to_vec()),
            None => Err(GateError::Protocol(
                "Incomplete signal values response".to_string(),
            )),
        }
    }

    /// Get the current value of a single signal.
    ///
    /// The value is oversampled over the acquisition period (Tap). With
    /// `wait_for_newest_data` the first published value is discarded so the
    /// result was measured after the call, at the cost of up to 2*Tap.
    pub fn signal_val_get(
        &mut self,
        signal_index: SignalIndex,
        wait_for_newest_data: bool,
    ) -> Result<f32, GateError> {
        let wait_flag = u32::from(wait_for_newest_data);

        let result = self.quick_send(
            "Signals.ValGet",
            vec![
                NanonisValue::I32(signal_index.into()),
                NanonisValue::U32(wait_flag),
            ],
            vec!["i", "I"],
            vec!["f"],
        )?;

        match result.first() {
            Some(value) => value.as_f32(),
            None => Err(GateError::Protocol("No signal value returned".to_string())),
        }
    }
}

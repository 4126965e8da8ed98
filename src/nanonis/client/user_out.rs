use super::NanonisClient;
use crate::error::GateError;
use crate::types::{NanonisValue, OutputIndex};

impl NanonisClient {
    /// Set the value of a user output.
    ///
    /// This corresponds to the Nanonis `UserOut.ValSet` command. The output
    /// follows its configured slew rate, so the read-back signal lags the
    /// set value until the ramp completes.
    pub fn user_out_val_set(
        &mut self,
        output_index: OutputIndex,
        output_value: f32,
    ) -> Result<(), GateError> {
        self.quick_send(
            "UserOut.ValSet",
            vec![
                NanonisValue::I32(output_index.into()),
                NanonisValue::F32(output_value),
            ],
            vec!["i", "f"],
            vec![],
        )?;
        Ok(())
    }

    /// Set the slew rate of a user output in units per second.
    pub fn user_out_slew_rate_set(
        &mut self,
        output_index: OutputIndex,
        slew_rate: f64,
    ) -> Result<(), GateError> {
        self.quick_send(
            "UserOut.SlewRateSet",
            vec![
                NanonisValue::I32(output_index.into()),
                NanonisValue::F64(slew_rate),
            ],
            vec!["i", "d"],
            vec![],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::nanonis::client::test_server;
    use crate::types::OutputIndex;
    use crate::NanonisClient;

    #[test]
    fn test_user_out_val_set_body() {
        let (port, server) = test_server::spawn(2, |_| Ok(Vec::new()));

        let mut client = NanonisClient::new("127.0.0.1", port).unwrap();
        client.user_out_val_set(OutputIndex(1), 1.5).unwrap();
        client.user_out_slew_rate_set(OutputIndex(1), 0.1).unwrap();

        let requests = server.join().unwrap();
        assert_eq!(requests[0].command, "UserOut.ValSet");
        assert_eq!(&requests[0].body[..4], &1i32.to_be_bytes());
        assert_eq!(&requests[0].body[4..], &1.5f32.to_be_bytes());
        assert_eq!(requests[1].command, "UserOut.SlewRateSet");
        assert_eq!(&requests[1].body[4..], &0.1f64.to_be_bytes());
    }
}

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GateError {
    #[error("IO error: {context}: {source}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },
    #[error("Connection timeout")]
    Timeout,
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Type error: {0}")]
    Type(String),
    #[error("Command mismatch: expected {expected}, got {actual}")]
    CommandMismatch { expected: String, actual: String },
    #[error("Invalid command: {0}")]
    InvalidCommand(String),
    #[error("Server error {code}: {message}")]
    ServerError { code: i32, message: String },
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("{label} target voltage {target} V is out of range ({min}, {max})")]
    OutOfRange {
        label: String,
        target: f64,
        min: f64,
        max: f64,
    },
    #[error("'{0}' cannot set voltage because write_index is not defined")]
    ReadOnly(String),
    #[error("Invalid {kind} unit '{unit}', must be one of {allowed}")]
    InvalidUnit {
        kind: &'static str,
        unit: String,
        allowed: &'static str,
    },
    #[error("Unknown gate '{0}'")]
    UnknownGate(String),
    #[error("Invalid sweep: {0}")]
    InvalidSweep(String),
    #[error("Model '{model}' is not supported for {kind} sweeps, supported models are: {supported}")]
    UnsupportedModel {
        model: String,
        kind: String,
        supported: String,
    },
    #[error("{label} did not settle at {target} V within {waited_ms} ms")]
    SettleTimeout {
        label: String,
        target: f64,
        waited_ms: u128,
    },
    #[error("Sweep aborted")]
    Aborted,
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl From<std::io::Error> for GateError {
    fn from(source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::TimedOut
            || source.kind() == std::io::ErrorKind::WouldBlock
        {
            return GateError::Timeout;
        }
        GateError::Io {
            source,
            context: "I/O operation failed".to_string(),
        }
    }
}

impl GateError {
    /// Wrap an I/O error with a description of what was being attempted.
    pub fn io(source: std::io::Error, context: impl Into<String>) -> Self {
        GateError::Io {
            source,
            context: context.into(),
        }
    }
}

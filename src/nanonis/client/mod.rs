use super::protocol::{Protocol, HEADER_SIZE};
use crate::error::GateError;
use crate::types::NanonisValue;
use log::{debug, warn};
use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

pub mod signals;
pub mod user_out;

/// Connection configuration for the Nanonis TCP client.
///
/// Contains timeout settings for different phases of the TCP connection lifecycle.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use gate_manager::ConnectionConfig;
///
/// let config = ConnectionConfig {
///     connect_timeout: Duration::from_secs(30),
///     read_timeout: Duration::from_secs(60),
///     write_timeout: Duration::from_secs(10),
/// };
/// assert!(config.read_timeout > ConnectionConfig::default().read_timeout);
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout for establishing the initial TCP connection
    pub connect_timeout: Duration,
    /// Timeout for reading data from the Nanonis server
    pub read_timeout: Duration,
    /// Timeout for writing data to the Nanonis server
    pub write_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Builder for constructing [`NanonisClient`] instances.
///
/// ```no_run
/// use std::time::Duration;
/// use gate_manager::NanonisClient;
///
/// let client = NanonisClient::builder()
///     .address("192.168.236.1")
///     .port(6501)
///     .connect_timeout(Duration::from_secs(30))
///     .build()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Default)]
pub struct NanonisClientBuilder {
    address: Option<String>,
    port: Option<u16>,
    config: ConnectionConfig,
}

impl NanonisClientBuilder {
    pub fn address(mut self, addr: &str) -> Self {
        self.address = Some(addr.to_string());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the full connection configuration
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    /// Connect and build the NanonisClient
    pub fn build(self) -> Result<NanonisClient, GateError> {
        let address = self
            .address
            .ok_or_else(|| GateError::InvalidCommand("Address must be specified".to_string()))?;

        let port = self
            .port
            .ok_or_else(|| GateError::InvalidCommand("Port must be specified".to_string()))?;

        let socket_addr: SocketAddr = format!("{address}:{port}")
            .parse()
            .map_err(|_| GateError::InvalidAddress(address.clone()))?;

        debug!("Connecting to Nanonis at {socket_addr}");

        let stream = TcpStream::connect_timeout(&socket_addr, self.config.connect_timeout)
            .map_err(|e| {
                warn!("Failed to connect to {socket_addr}: {e}");
                if e.kind() == std::io::ErrorKind::TimedOut {
                    GateError::Timeout
                } else {
                    GateError::io(e, format!("Failed to connect to {socket_addr}"))
                }
            })?;

        stream.set_read_timeout(Some(self.config.read_timeout))?;
        stream.set_write_timeout(Some(self.config.write_timeout))?;
        stream.set_nodelay(true)?;

        debug!("Successfully connected to Nanonis");

        Ok(NanonisClient {
            stream,
            config: self.config,
        })
    }
}

/// Client for the handful of Nanonis TCP commands that gate control needs.
///
/// One client owns one TCP connection. Gates share it through
/// [`SharedInstrument`](crate::SharedInstrument).
pub struct NanonisClient {
    stream: TcpStream,
    config: ConnectionConfig,
}

impl NanonisClient {
    /// Connect with default timeouts.
    pub fn new(addr: &str, port: u16) -> Result<Self, GateError> {
        Self::builder().address(addr).port(port).build()
    }

    pub fn builder() -> NanonisClientBuilder {
        NanonisClientBuilder::default()
    }

    /// Get the current connection configuration
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Send one command and parse its typed response.
    pub fn quick_send(
        &mut self,
        command: &str,
        args: Vec<NanonisValue>,
        argument_types: Vec<&str>,
        return_types: Vec<&str>,
    ) -> Result<Vec<NanonisValue>, GateError> {
        debug!("=== COMMAND START: {} ===", command);
        debug!("Arguments: {:?}", args);

        let mut body = Vec::new();
        for (arg, arg_type) in args.iter().zip(argument_types.iter()) {
            Protocol::serialize_value(arg, arg_type, &mut body)?;
        }

        let header = Protocol::create_command_header(command, body.len() as u32);

        self.stream
            .write_all(&header)
            .map_err(|e| GateError::io(e, "Writing command header"))?;

        if !body.is_empty() {
            self.stream
                .write_all(&body)
                .map_err(|e| GateError::io(e, "Writing command body"))?;
        }

        let response_header = Protocol::read_exact_bytes::<HEADER_SIZE>(&mut self.stream)?;
        let body_size = Protocol::validate_response_header(&response_header, command)?;
        debug!("Expected response body size: {}", body_size);

        let response_body = if body_size > 0 {
            Protocol::read_variable_bytes(&mut self.stream, body_size as usize)?
        } else {
            Vec::new()
        };

        let result = Protocol::parse_response_with_error_check(&response_body, &return_types)
            .inspect_err(|e| debug!("Failed to parse response: {}", e))?;

        debug!("=== COMMAND SUCCESS: {} ===", command);
        debug!("Parsed result: {:?}", result);

        Ok(result)
    }
}

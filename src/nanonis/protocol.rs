use crate::error::GateError;
use crate::types::NanonisValue;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
use std::io::{Cursor, Read};

// Protocol constants
pub const COMMAND_SIZE: usize = 32;
pub const HEADER_SIZE: usize = 40;
pub const ERROR_INFO_SIZE: usize = 8;
pub const MAX_RESPONSE_SIZE: usize = 100 * 1024 * 1024; // 100MB
pub const RESPONSE_FLAG: u16 = 1;
pub const ZERO_BUFFER: u16 = 0;

#[derive(Debug, Clone)]
struct MessageHeader {
    command: [u8; COMMAND_SIZE],
    body_size: u32,
    send_response: u16,
    padding: u16,
}

impl MessageHeader {
    fn new(command: &str, body_size: u32) -> Self {
        let mut cmd_bytes = [0u8; COMMAND_SIZE];
        let cmd_str = command.as_bytes();
        let len = cmd_str.len().min(COMMAND_SIZE);
        cmd_bytes[..len].copy_from_slice(&cmd_str[..len]);

        Self {
            command: cmd_bytes,
            body_size,
            // Always request a response so the error block comes back
            send_response: RESPONSE_FLAG,
            padding: ZERO_BUFFER,
        }
    }

    fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..32].copy_from_slice(&self.command);
        buf[32..36].copy_from_slice(&self.body_size.to_be_bytes());
        buf[36..38].copy_from_slice(&self.send_response.to_be_bytes());
        buf[38..40].copy_from_slice(&self.padding.to_be_bytes());
        buf
    }
}

/// Low-level protocol handling
pub struct Protocol;

impl Protocol {
    /// Create command header with proper padding
    pub fn create_command_header(command: &str, body_size: u32) -> [u8; HEADER_SIZE] {
        MessageHeader::new(command, body_size).to_bytes()
    }

    /// Validate command response header, returning the body size
    pub fn validate_response_header(
        header: &[u8; HEADER_SIZE],
        expected_command: &str,
    ) -> Result<u32, GateError> {
        let response_body_size =
            u32::from_be_bytes([header[32], header[33], header[34], header[35]]);

        let received_command = String::from_utf8_lossy(&header[0..COMMAND_SIZE])
            .trim_end_matches('\0')
            .to_string();

        if received_command == expected_command {
            Ok(response_body_size)
        } else {
            Err(GateError::CommandMismatch {
                expected: expected_command.to_string(),
                actual: received_command,
            })
        }
    }

    /// Read exactly `N` bytes from the stream
    pub fn read_exact_bytes<const N: usize>(
        reader: &mut dyn Read,
    ) -> Result<[u8; N], GateError> {
        let mut buf = [0u8; N];
        reader.read_exact(&mut buf).map_err(|e| {
            debug!("Failed to read {} bytes: {} (kind: {:?})", N, e, e.kind());
            if e.kind() == std::io::ErrorKind::TimedOut
                || e.kind() == std::io::ErrorKind::WouldBlock
            {
                GateError::Timeout
            } else {
                GateError::io(e, format!("Failed to read {} bytes from Nanonis", N))
            }
        })?;
        Ok(buf)
    }

    /// Read a variable-length body with size validation
    pub fn read_variable_bytes(
        reader: &mut dyn Read,
        size: usize,
    ) -> Result<Vec<u8>, GateError> {
        if size > MAX_RESPONSE_SIZE {
            return Err(GateError::Protocol(format!(
                "Response size {} exceeds maximum {}",
                size, MAX_RESPONSE_SIZE
            )));
        }

        let mut body = vec![0u8; size];
        reader.read_exact(&mut body).map_err(|e| {
            GateError::io(e, format!("Failed to read {} byte response body", size))
        })?;
        Ok(body)
    }

    /// Serialize a value according to its type specification
    pub fn serialize_value(
        value: &NanonisValue,
        body_type: &str,
        buffer: &mut Vec<u8>,
    ) -> Result<(), GateError> {
        match (value, body_type) {
            (NanonisValue::U16(v), "H") => buffer.write_u16::<BigEndian>(*v)?,
            (NanonisValue::I16(v), "h") => buffer.write_i16::<BigEndian>(*v)?,
            (NanonisValue::U32(v), "I") => buffer.write_u32::<BigEndian>(*v)?,
            (NanonisValue::I32(v), "i") => buffer.write_i32::<BigEndian>(*v)?,
            (NanonisValue::F32(v), "f") => buffer.write_f32::<BigEndian>(*v)?,
            (NanonisValue::F64(v), "d") => buffer.write_f64::<BigEndian>(*v)?,

            (NanonisValue::String(s), t) if t.contains("*c") => {
                let bytes = s.as_bytes();
                if t.starts_with('+') {
                    buffer.write_u32::<BigEndian>(bytes.len() as u32)?;
                }
                buffer.extend_from_slice(bytes);
            }

            (NanonisValue::ArrayI32(arr), t) if t.contains("*i") => {
                if t.starts_with('+') {
                    buffer.write_u32::<BigEndian>(arr.len() as u32)?;
                }
                for &val in arr {
                    buffer.write_i32::<BigEndian>(val)?;
                }
            }

            (NanonisValue::ArrayF32(arr), t) if t.contains("*f") => {
                if t.starts_with('+') {
                    buffer.write_u32::<BigEndian>(arr.len() as u32)?;
                }
                for &val in arr {
                    buffer.write_f32::<BigEndian>(val)?;
                }
            }

            (NanonisValue::ArrayF64(arr), t) if t.contains("*d") => {
                if t.starts_with('+') {
                    buffer.write_u32::<BigEndian>(arr.len() as u32)?;
                }
                for &val in arr {
                    buffer.write_f64::<BigEndian>(val)?;
                }
            }

            _ => {
                return Err(GateError::Type(format!(
                    "Unsupported type combination: {value:?} with {body_type}"
                )))
            }
        }
        Ok(())
    }

    /// Parse response data, then check the trailing error block.
    pub fn parse_response_with_error_check(
        response: &[u8],
        response_types: &[&str],
    ) -> Result<Vec<NanonisValue>, GateError> {
        let (values, cursor) = Self::parse_response(response, response_types)?;
        Self::parse_error_info(response, cursor)?;
        Ok(values)
    }

    /// Parse response data according to type specifications.
    ///
    /// Returns the values and the byte offset where the data section ends.
    pub fn parse_response(
        response: &[u8],
        response_types: &[&str],
    ) -> Result<(Vec<NanonisValue>, usize), GateError> {
        let mut cursor = Cursor::new(response);
        let mut result: Vec<NanonisValue> = Vec::with_capacity(response_types.len());

        for &response_type in response_types {
            let value = match response_type {
                "H" => NanonisValue::U16(cursor.read_u16::<BigEndian>()?),
                "h" => NanonisValue::I16(cursor.read_i16::<BigEndian>()?),
                "I" => NanonisValue::U32(cursor.read_u32::<BigEndian>()?),
                "i" => NanonisValue::I32(cursor.read_i32::<BigEndian>()?),
                "f" => NanonisValue::F32(cursor.read_f32::<BigEndian>()?),
                "d" => NanonisValue::F64(cursor.read_f64::<BigEndian>()?),

                t if t.contains("*f") => {
                    let len = Self::array_len(&mut cursor, t, result.last())?;
                    let mut arr = Vec::with_capacity(len);
                    for _ in 0..len {
                        arr.push(cursor.read_f32::<BigEndian>()?);
                    }
                    NanonisValue::ArrayF32(arr)
                }

                t if t.contains("*d") => {
                    let len = Self::array_len(&mut cursor, t, result.last())?;
                    let mut arr = Vec::with_capacity(len);
                    for _ in 0..len {
                        arr.push(cursor.read_f64::<BigEndian>()?);
                    }
                    NanonisValue::ArrayF64(arr)
                }

                t if t.contains("*i") => {
                    let len = Self::array_len(&mut cursor, t, result.last())?;
                    let mut arr = Vec::with_capacity(len);
                    for _ in 0..len {
                        arr.push(cursor.read_i32::<BigEndian>()?);
                    }
                    NanonisValue::ArrayI32(arr)
                }

                // String array prefixed by total byte size and string count
                "+*c" => {
                    let _total_size = cursor.read_u32::<BigEndian>()?;
                    let num_strings = cursor.read_u32::<BigEndian>()? as usize;
                    NanonisValue::ArrayString(Self::read_strings(&mut cursor, num_strings)?)
                }

                // String array whose count is the previous value
                "*+c" => {
                    let num_strings = Self::previous_count(result.last(), "*+c")?;
                    NanonisValue::ArrayString(Self::read_strings(&mut cursor, num_strings)?)
                }

                // Single string whose length is the previous value
                "*-c" => {
                    let string_length = Self::previous_count(result.last(), "*-c")?;
                    let mut string_bytes = vec![0u8; string_length];
                    cursor.read_exact(&mut string_bytes)?;
                    NanonisValue::String(String::from_utf8_lossy(&string_bytes).to_string())
                }

                _ => {
                    return Err(GateError::Type(format!(
                        "Unsupported response type: {response_type}"
                    )))
                }
            };

            result.push(value);
        }

        Ok((result, cursor.position() as usize))
    }

    /// Parse error information from the end of a response body
    pub fn parse_error_info(body: &[u8], data_end_cursor: usize) -> Result<(), GateError> {
        let error_section = match body.get(data_end_cursor..) {
            Some(section) if section.len() >= ERROR_INFO_SIZE => section,
            _ => return Ok(()),
        };

        let (status_bytes, rest) = error_section.split_at(4);
        let (size_bytes, message_bytes) = rest.split_at(4);

        let error_status = i32::from_be_bytes(
            status_bytes
                .try_into()
                .map_err(|_| GateError::Protocol("Invalid error status format".into()))?,
        );
        let error_desc_size = i32::from_be_bytes(
            size_bytes
                .try_into()
                .map_err(|_| GateError::Protocol("Invalid error size format".into()))?,
        );

        if error_desc_size > 0 {
            let message_slice = message_bytes
                .get(..error_desc_size as usize)
                .ok_or_else(|| GateError::Protocol("Error message truncated".into()))?;

            let error_msg = std::str::from_utf8(message_slice)
                .map_err(|_| GateError::Protocol("Invalid UTF-8 in error message".into()))?;

            let trimmed_msg = error_msg.trim();
            if !trimmed_msg.is_empty() {
                return Err(GateError::ServerError {
                    code: error_status,
                    message: trimmed_msg.to_string(),
                });
            }
        }

        Ok(())
    }

    fn array_len(
        cursor: &mut Cursor<&[u8]>,
        type_spec: &str,
        previous: Option<&NanonisValue>,
    ) -> Result<usize, GateError> {
        if type_spec.starts_with('+') {
            Ok(cursor.read_u32::<BigEndian>()? as usize)
        } else {
            Self::previous_count(previous, type_spec)
        }
    }

    fn previous_count(previous: Option<&NanonisValue>, type_spec: &str) -> Result<usize, GateError> {
        match previous {
            Some(NanonisValue::I32(len)) if *len >= 0 => Ok(*len as usize),
            Some(NanonisValue::U32(len)) => Ok(*len as usize),
            _ => Err(GateError::Protocol(format!(
                "Length not found for {type_spec} type"
            ))),
        }
    }

    fn read_strings(cursor: &mut Cursor<&[u8]>, count: usize) -> Result<Vec<String>, GateError> {
        let mut strings = Vec::with_capacity(count);
        for _ in 0..count {
            let string_len = cursor.read_u32::<BigEndian>()? as usize;
            let mut string_bytes = vec![0u8; string_len];
            cursor.read_exact(&mut string_bytes)?;
            strings.push(String::from_utf8_lossy(&string_bytes).to_string());
        }
        Ok(strings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error_block(code: i32, message: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&code.to_be_bytes());
        buf.extend_from_slice(&(message.len() as i32).to_be_bytes());
        buf.extend_from_slice(message.as_bytes());
        buf
    }

    #[test]
    fn test_header_layout() {
        let header = Protocol::create_command_header("UserOut.ValSet", 8);
        assert_eq!(&header[..14], b"UserOut.ValSet");
        assert!(header[14..32].iter().all(|&b| b == 0));
        assert_eq!(&header[32..36], &8u32.to_be_bytes());
        assert_eq!(&header[36..38], &RESPONSE_FLAG.to_be_bytes());
        assert_eq!(&header[38..40], &[0, 0]);
    }

    #[test]
    fn test_validate_response_header() {
        let header = Protocol::create_command_header("Signals.ValGet", 12);
        assert_eq!(
            Protocol::validate_response_header(&header, "Signals.ValGet").unwrap(),
            12
        );
        assert!(matches!(
            Protocol::validate_response_header(&header, "Signals.ValsGet"),
            Err(GateError::CommandMismatch { .. })
        ));
    }

    #[test]
    fn test_serialize_user_out_args() {
        let mut body = Vec::new();
        Protocol::serialize_value(&NanonisValue::I32(3), "i", &mut body).unwrap();
        Protocol::serialize_value(&NanonisValue::F32(0.25), "f", &mut body).unwrap();
        assert_eq!(&body[..4], &3i32.to_be_bytes());
        assert_eq!(&body[4..], &0.25f32.to_be_bytes());
    }

    #[test]
    fn test_serialize_prefixed_array() {
        let mut body = Vec::new();
        Protocol::serialize_value(&NanonisValue::ArrayI32(vec![24, 25]), "+*i", &mut body)
            .unwrap();
        assert_eq!(body.len(), 12);
        assert_eq!(&body[..4], &2u32.to_be_bytes());
    }

    #[test]
    fn test_serialize_type_mismatch() {
        let mut body = Vec::new();
        let result = Protocol::serialize_value(&NanonisValue::F32(1.0), "i", &mut body);
        assert!(matches!(result, Err(GateError::Type(_))));
    }

    #[test]
    fn test_parse_counted_float_array() {
        let mut body = Vec::new();
        body.extend_from_slice(&2i32.to_be_bytes());
        body.extend_from_slice(&1.5f32.to_be_bytes());
        body.extend_from_slice(&(-0.5f32).to_be_bytes());
        body.extend_from_slice(&error_block(0, ""));

        let values = Protocol::parse_response_with_error_check(&body, &["i", "*f"]).unwrap();
        assert_eq!(values[0], NanonisValue::I32(2));
        assert_eq!(values[1], NanonisValue::ArrayF32(vec![1.5, -0.5]));
    }

    #[test]
    fn test_parse_string_array() {
        let mut body = Vec::new();
        body.extend_from_slice(&0u32.to_be_bytes());
        body.extend_from_slice(&2u32.to_be_bytes());
        for name in ["Input 1 (V)", "Output 1 (V)"] {
            body.extend_from_slice(&(name.len() as u32).to_be_bytes());
            body.extend_from_slice(name.as_bytes());
        }

        let (values, cursor) = Protocol::parse_response(&body, &["+*c"]).unwrap();
        assert_eq!(cursor, body.len());
        assert_eq!(
            values[0].as_string_array().unwrap(),
            &["Input 1 (V)".to_string(), "Output 1 (V)".to_string()]
        );
    }

    #[test]
    fn test_server_error_is_reported() {
        let mut body = Vec::new();
        body.extend_from_slice(&error_block(-1, "Output index out of range"));

        let result = Protocol::parse_response_with_error_check(&body, &[]);
        match result {
            Err(GateError::ServerError { code, message }) => {
                assert_eq!(code, -1);
                assert_eq!(message, "Output index out of range");
            }
            other => panic!("expected server error, got {other:?}"),
        }
    }

    #[test]
    fn test_truncated_response() {
        let body = 7i32.to_be_bytes();
        assert!(Protocol::parse_response(&body, &["i", "*f"]).is_err());
    }
}

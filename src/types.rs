use serde::{Deserialize, Serialize};

use crate::error::GateError;

/// A typed value on the Nanonis wire.
#[derive(Debug, Clone, PartialEq)]
pub enum NanonisValue {
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    F64(f64),
    String(String),
    ArrayI32(Vec<i32>),
    ArrayF32(Vec<f32>),
    ArrayF64(Vec<f64>),
    ArrayString(Vec<String>),
}

impl From<f32> for NanonisValue {
    fn from(value: f32) -> Self {
        NanonisValue::F32(value)
    }
}

impl From<f64> for NanonisValue {
    fn from(value: f64) -> Self {
        NanonisValue::F64(value)
    }
}

impl From<u32> for NanonisValue {
    fn from(value: u32) -> Self {
        NanonisValue::U32(value)
    }
}

impl From<i32> for NanonisValue {
    fn from(value: i32) -> Self {
        NanonisValue::I32(value)
    }
}

impl From<Vec<i32>> for NanonisValue {
    fn from(value: Vec<i32>) -> Self {
        NanonisValue::ArrayI32(value)
    }
}

impl NanonisValue {
    /// Extract f32 value with type checking
    pub fn as_f32(&self) -> Result<f32, GateError> {
        match self {
            NanonisValue::F32(v) => Ok(*v),
            _ => Err(GateError::Type(format!("Expected f32, got {self:?}"))),
        }
    }

    /// Extract i32 value with type checking
    pub fn as_i32(&self) -> Result<i32, GateError> {
        match self {
            NanonisValue::I32(v) => Ok(*v),
            _ => Err(GateError::Type(format!("Expected i32, got {self:?}"))),
        }
    }

    /// Extract f32 array with type checking
    pub fn as_f32_array(&self) -> Result<&[f32], GateError> {
        match self {
            NanonisValue::ArrayF32(arr) => Ok(arr),
            _ => Err(GateError::Type(format!(
                "Expected f32 array, got {self:?}"
            ))),
        }
    }

    /// Extract string array with type checking
    pub fn as_string_array(&self) -> Result<&[String], GateError> {
        match self {
            NanonisValue::ArrayString(arr) => Ok(arr),
            _ => Err(GateError::Type(format!(
                "Expected string array, got {self:?}"
            ))),
        }
    }
}

/// Nanonis signal index (0-127), used to read a channel back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignalIndex(pub u8);

impl SignalIndex {
    pub fn new(index: u8) -> Self {
        Self(index)
    }

    pub fn get(&self) -> u8 {
        self.0
    }
}

impl From<SignalIndex> for i32 {
    fn from(idx: SignalIndex) -> i32 {
        idx.0 as i32
    }
}

impl From<u8> for SignalIndex {
    fn from(index: u8) -> Self {
        SignalIndex(index)
    }
}

/// Nanonis user output index (1-based, as shown in the User Outputs module)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputIndex(pub u8);

impl OutputIndex {
    pub fn new(index: u8) -> Self {
        Self(index)
    }

    pub fn get(&self) -> u8 {
        self.0
    }
}

impl From<OutputIndex> for i32 {
    fn from(idx: OutputIndex) -> i32 {
        idx.0 as i32
    }
}

impl From<u8> for OutputIndex {
    fn from(index: u8) -> Self {
        OutputIndex(index)
    }
}

// MIT License - Copyright (c) 2026 zway-core contributors
// Typed values held by data holders

use serde::{Deserialize, Serialize};

/// Discriminant of a [`DataValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataType {
    Empty = 0,
    Boolean = 1,
    Integer = 2,
    Float = 3,
    String = 4,
    Binary = 5,
    ArrayOfInteger = 6,
    ArrayOfFloat = 7,
    ArrayOfString = 8,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Boolean => "bool",
            Self::Integer => "int",
            Self::Float => "float",
            Self::String => "string",
            Self::Binary => "binary",
            Self::ArrayOfInteger => "int[]",
            Self::ArrayOfFloat => "float[]",
            Self::ArrayOfString => "string[]",
        }
    }
}

/// Value stored in a data holder.
///
/// Serializes untagged (`null`, `true`, `5`, `"text"`, `[1, 2]`), which is
/// what the JSON tree snapshot shows next to the holder's `type`.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(untagged)]
pub enum DataValue {
    #[default]
    Empty,
    Bool(bool),
    Int(i32),
    Float(f32),
    String(String),
    Binary(Vec<u8>),
    IntArray(Vec<i32>),
    FloatArray(Vec<f32>),
    StringArray(Vec<String>),
}

impl DataValue {
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Empty => DataType::Empty,
            Self::Bool(_) => DataType::Boolean,
            Self::Int(_) => DataType::Integer,
            Self::Float(_) => DataType::Float,
            Self::String(_) => DataType::String,
            Self::Binary(_) => DataType::Binary,
            Self::IntArray(_) => DataType::ArrayOfInteger,
            Self::FloatArray(_) => DataType::ArrayOfFloat,
            Self::StringArray(_) => DataType::ArrayOfString,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Bit-for-bit equality. Floats compare by their bit pattern, so
    /// `NaN` equals an identical `NaN` and `0.0` differs from `-0.0`.
    pub fn same_bits(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::FloatArray(a), Self::FloatArray(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            _ => self == other,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Binary(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for DataValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for DataValue {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<f32> for DataValue {
    fn from(v: f32) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for DataValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for DataValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for DataValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Binary(v)
    }
}

impl From<Vec<i32>> for DataValue {
    fn from(v: Vec<i32>) -> Self {
        Self::IntArray(v)
    }
}

impl From<Vec<f32>> for DataValue {
    fn from(v: Vec<f32>) -> Self {
        Self::FloatArray(v)
    }
}

impl From<Vec<String>> for DataValue {
    fn from(v: Vec<String>) -> Self {
        Self::StringArray(v)
    }
}

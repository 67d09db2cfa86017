//! Tagged payload values
//!
//! Step parameters, execution state and partial results are dynamic. They are
//! carried as [`Value`], a closed set of serializable shapes with an explicit
//! `type` tag, plus an opaque byte blob for anything else.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Ordered string-keyed map of values (canonical encoding)
pub type StateMap = BTreeMap<String, Value>;

/// Dynamic payload value
///
/// Floats must be finite: JSON has no encoding for NaN or infinities, so a
/// non-finite float would not survive a checkpoint round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// Absent value
    #[default]
    Null,
    /// Boolean
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// Finite float
    Float(f64),
    /// UTF-8 text
    Text(String),
    /// Ordered list
    List(Vec<Value>),
    /// Ordered map
    Map(StateMap),
    /// Opaque bytes
    Bytes(Vec<u8>),
}

impl Value {
    /// Tag name, as written in the encoded form
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Bytes(_) => "bytes",
        }
    }

    /// Text content if this is a `Text`
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Integer content if this is an `Int`
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Map content if this is a `Map`
    #[must_use]
    pub fn as_map(&self) -> Option<&StateMap> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// List content if this is a `List`
    #[must_use]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    /// Whether every float nested in this value is finite
    #[must_use]
    pub fn is_encodable(&self) -> bool {
        match self {
            Self::Float(f) => f.is_finite(),
            Self::List(items) => items.iter().all(Value::is_encodable),
            Self::Map(map) => map.values().all(Value::is_encodable),
            _ => true,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<StateMap> for Value {
    fn from(v: StateMap) -> Self {
        Self::Map(v)
    }
}

impl<T: Into<Value>> FromIterator<T> for Value {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::List(iter.into_iter().map(Into::into).collect())
    }
}

//! Typed values for datasets and attributes.
//!
//! The container adapter stores every dataset as one of these variants and
//! every attribute as an [`AttrValue`]. Codelet scripts see them as plain
//! rhai values; the conversions in both directions live here.

use std::collections::BTreeMap;

use rhai::Dynamic;
use serde::{Deserialize, Serialize};

/// Value of a dataset node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    /// Resizable 1-D byte array; backs internal files.
    Bytes(Vec<u8>),
    IntArray(Vec<i64>),
    FloatArray(Vec<f64>),
    StrArray(Vec<String>),
    /// A reference item: a pointer into another paper.
    Reference { paper_ref: String, path: String },
    /// The append-only open/close record of the paper.
    History(Vec<HistoryEntry>),
}

/// One open/close event in `/history`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Milliseconds since the epoch; 0 in `closed` while the paper is open.
    pub opened: i64,
    pub closed: i64,
    pub platform: String,
    pub hostname: String,
    pub username: String,
    /// One entry per known component, e.g. `activepapers`, `rhai`, plus the
    /// declared external packages.
    pub versions: BTreeMap<String, String>,
}

/// Value of a node attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AttrValue {
    Str(String),
    Int(i64),
    Bool(bool),
    StrList(Vec<String>),
    RefPair { paper_ref: String, path: String },
}

impl Value {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::IntArray(_) => "int array",
            Value::FloatArray(_) => "float array",
            Value::StrArray(_) => "string array",
            Value::Reference { .. } => "reference",
            Value::History(_) => "history",
        }
    }

    /// Number of elements for array-like values, 1 for scalars.
    pub fn len(&self) -> usize {
        match self {
            Value::Bytes(b) => b.len(),
            Value::IntArray(v) => v.len(),
            Value::FloatArray(v) => v.len(),
            Value::StrArray(v) => v.len(),
            Value::History(v) => v.len(),
            _ => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Convert a rhai value into a storable one.
    ///
    /// Homogeneous arrays of ints or floats become typed arrays; an array
    /// mixing ints and floats is promoted to a float array. Anything else
    /// is rejected with a type-name message.
    pub fn from_dynamic(value: &Dynamic) -> Result<Value, String> {
        if let Some(i) = value.clone().try_cast::<i64>() {
            return Ok(Value::Int(i));
        }
        if let Some(f) = value.clone().try_cast::<f64>() {
            return Ok(Value::Float(f));
        }
        if let Some(b) = value.clone().try_cast::<bool>() {
            return Ok(Value::Bool(b));
        }
        if value.is_string() {
            return Ok(Value::Str(value.clone().cast::<String>()));
        }
        if let Some(blob) = value.clone().try_cast::<rhai::Blob>() {
            return Ok(Value::Bytes(blob));
        }
        if let Some(arr) = value.clone().try_cast::<rhai::Array>() {
            return Self::from_array(&arr);
        }
        Err(format!("cannot store a value of type {}", value.type_name()))
    }

    fn from_array(arr: &[Dynamic]) -> Result<Value, String> {
        if arr.is_empty() {
            return Ok(Value::FloatArray(Vec::new()));
        }
        if arr.iter().all(|v| v.is_int()) {
            let ints = arr.iter().map(|v| v.as_int().unwrap()).collect();
            return Ok(Value::IntArray(ints));
        }
        if arr.iter().all(|v| v.is_int() || v.is_float()) {
            let floats = arr
                .iter()
                .map(|v| {
                    v.as_float()
                        .or_else(|_| v.as_int().map(|i| i as f64))
                        .unwrap()
                })
                .collect();
            return Ok(Value::FloatArray(floats));
        }
        if arr.iter().all(|v| v.is_string()) {
            let strings = arr.iter().map(|v| v.clone().cast::<String>()).collect();
            return Ok(Value::StrArray(strings));
        }
        Err("cannot store a mixed-type array".to_string())
    }

    /// Convert to a rhai value for script consumption.
    pub fn to_dynamic(&self) -> Dynamic {
        match self {
            Value::Int(i) => Dynamic::from(*i),
            Value::Float(f) => Dynamic::from(*f),
            Value::Bool(b) => Dynamic::from(*b),
            Value::Str(s) => Dynamic::from(s.clone()),
            Value::Bytes(b) => Dynamic::from_blob(b.clone()),
            Value::IntArray(v) => {
                Dynamic::from_array(v.iter().map(|i| Dynamic::from(*i)).collect())
            }
            Value::FloatArray(v) => {
                Dynamic::from_array(v.iter().map(|f| Dynamic::from(*f)).collect())
            }
            Value::StrArray(v) => {
                Dynamic::from_array(v.iter().map(|s| Dynamic::from(s.clone())).collect())
            }
            Value::Reference { paper_ref, path } => Dynamic::from_array(vec![
                Dynamic::from(paper_ref.clone()),
                Dynamic::from(path.clone()),
            ]),
            Value::History(_) => Dynamic::UNIT,
        }
    }

    /// Element access for array-like values.
    pub fn element(&self, index: usize) -> Option<Dynamic> {
        match self {
            Value::Bytes(b) => b.get(index).map(|x| Dynamic::from(*x as i64)),
            Value::IntArray(v) => v.get(index).map(|x| Dynamic::from(*x)),
            Value::FloatArray(v) => v.get(index).map(|x| Dynamic::from(*x)),
            Value::StrArray(v) => v.get(index).map(|x| Dynamic::from(x.clone())),
            _ => None,
        }
    }
}

impl AttrValue {
    pub fn to_dynamic(&self) -> Dynamic {
        match self {
            AttrValue::Str(s) => Dynamic::from(s.clone()),
            AttrValue::Int(i) => Dynamic::from(*i),
            AttrValue::Bool(b) => Dynamic::from(*b),
            AttrValue::StrList(v) => {
                Dynamic::from_array(v.iter().map(|s| Dynamic::from(s.clone())).collect())
            }
            AttrValue::RefPair { paper_ref, path } => Dynamic::from_array(vec![
                Dynamic::from(paper_ref.clone()),
                Dynamic::from(path.clone()),
            ]),
        }
    }

    pub fn from_dynamic(value: &Dynamic) -> Result<AttrValue, String> {
        if let Some(i) = value.clone().try_cast::<i64>() {
            return Ok(AttrValue::Int(i));
        }
        if let Some(b) = value.clone().try_cast::<bool>() {
            return Ok(AttrValue::Bool(b));
        }
        if value.is_string() {
            return Ok(AttrValue::Str(value.clone().cast::<String>()));
        }
        if let Some(arr) = value.clone().try_cast::<rhai::Array>() {
            if arr.iter().all(|v| v.is_string()) {
                return Ok(AttrValue::StrList(
                    arr.iter().map(|v| v.clone().cast::<String>()).collect(),
                ));
            }
        }
        Err(format!(
            "cannot store an attribute of type {}",
            value.type_name()
        ))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttrValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str_list(&self) -> Option<&[String]> {
        match self {
            AttrValue::StrList(v) => Some(v),
            _ => None,
        }
    }
}

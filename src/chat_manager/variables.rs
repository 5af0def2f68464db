//! Chat-scoped variable store used by the macro engine.
//!
//! Values are a tagged union instead of untyped JSON. Reads coerce
//! numeric-looking strings to numbers; indexed reads and writes parse stored
//! text as JSON first and leave the value alone when that fails.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum VarValue {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<VarValue>),
    Map(BTreeMap<String, VarValue>),
}

impl VarValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            VarValue::Number(n) => Some(*n),
            VarValue::String(s) => parse_number(s),
            VarValue::Bool(_) | VarValue::Null | VarValue::List(_) | VarValue::Map(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            VarValue::Null => true,
            VarValue::String(s) => s.is_empty(),
            _ => false,
        }
    }

    /// Structured view of the value: lists and maps as-is, strings parsed as
    /// JSON. `None` when the value holds no structured data.
    fn structured(&self) -> Option<VarValue> {
        match self {
            VarValue::List(_) | VarValue::Map(_) => Some(self.clone()),
            VarValue::String(s) => serde_json::from_str::<Value>(s).ok().map(VarValue::from),
            VarValue::Null => Some(VarValue::Null),
            _ => None,
        }
    }

    fn coerce_numeric(self) -> VarValue {
        match self {
            VarValue::String(s) => match parse_number(&s) {
                Some(n) => VarValue::Number(n),
                None => VarValue::String(s),
            },
            other => other,
        }
    }
}

impl fmt::Display for VarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarValue::Null => Ok(()),
            VarValue::Bool(b) => write!(f, "{}", b),
            VarValue::Number(n) => f.write_str(&format_number(*n)),
            VarValue::String(s) => f.write_str(s),
            VarValue::List(_) | VarValue::Map(_) => {
                let json = serde_json::to_string(&Value::from(self.clone())).map_err(|_| fmt::Error)?;
                f.write_str(&json)
            }
        }
    }
}

impl From<Value> for VarValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => VarValue::Null,
            Value::Bool(b) => VarValue::Bool(b),
            Value::Number(n) => n.as_f64().map(VarValue::Number).unwrap_or(VarValue::Null),
            Value::String(s) => VarValue::String(s),
            Value::Array(items) => VarValue::List(items.into_iter().map(VarValue::from).collect()),
            Value::Object(map) => {
                VarValue::Map(map.into_iter().map(|(k, v)| (k, VarValue::from(v))).collect())
            }
        }
    }
}

impl From<VarValue> for Value {
    fn from(value: VarValue) -> Self {
        match value {
            VarValue::Null => Value::Null,
            VarValue::Bool(b) => Value::Bool(b),
            VarValue::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 9.0e15 {
                    Value::from(n as i64)
                } else {
                    serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
                }
            }
            VarValue::String(s) => Value::String(s),
            VarValue::List(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            VarValue::Map(map) => Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect()),
        }
    }
}

impl From<&str> for VarValue {
    fn from(value: &str) -> Self {
        VarValue::String(value.to_string())
    }
}

impl From<f64> for VarValue {
    fn from(value: f64) -> Self {
        VarValue::Number(value)
    }
}

fn parse_number(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Integers print without a fractional part, matching how chat text shows them.
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1.0e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

fn is_true_boolean(text: &str) -> bool {
    matches!(text.trim().to_lowercase().as_str(), "on" | "true" | "1" | "yes")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    String,
    Number,
    Int,
    Float,
    Boolean,
    List,
    Object,
    Null,
    Undefined,
}

impl FromStr for ValueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "string" | "str" => Ok(ValueType::String),
            "number" => Ok(ValueType::Number),
            "int" => Ok(ValueType::Int),
            "float" => Ok(ValueType::Float),
            "boolean" | "bool" => Ok(ValueType::Boolean),
            "list" | "array" => Ok(ValueType::List),
            "object" | "dict" | "dictionary" => Ok(ValueType::Object),
            "null" => Ok(ValueType::Null),
            "undefined" | "none" => Ok(ValueType::Undefined),
            other => Err(format!("unknown value type '{}'", other)),
        }
    }
}

/// Coerces raw text to the declared type. `None` means "undefined": the
/// variable is removed instead of stored. Non-numeric text under a numeric
/// type keeps the raw text.
pub fn convert_value_type(value: &str, as_type: Option<ValueType>) -> Option<VarValue> {
    let Some(as_type) = as_type else {
        return Some(VarValue::String(value.to_string()));
    };
    let raw = || VarValue::String(value.to_string());
    Some(match as_type {
        ValueType::String => raw(),
        ValueType::Null => VarValue::Null,
        ValueType::Undefined => return None,
        ValueType::Number | ValueType::Float => parse_number(value).map(VarValue::Number).unwrap_or_else(raw),
        ValueType::Int => {
            let trimmed = value.trim();
            let digits: String = trimmed
                .char_indices()
                .take_while(|(i, c)| c.is_ascii_digit() || (*i == 0 && (*c == '-' || *c == '+')))
                .map(|(_, c)| c)
                .collect();
            digits
                .parse::<i64>()
                .map(|n| VarValue::Number(n as f64))
                .unwrap_or_else(|_| raw())
        }
        ValueType::Boolean => VarValue::Bool(is_true_boolean(value)),
        ValueType::List => match serde_json::from_str::<Value>(value) {
            Ok(Value::Array(items)) => VarValue::List(items.into_iter().map(VarValue::from).collect()),
            _ => VarValue::List(Vec::new()),
        },
        ValueType::Object => match serde_json::from_str::<Value>(value) {
            Ok(Value::Object(map)) => VarValue::from(Value::Object(map)),
            _ => VarValue::Map(BTreeMap::new()),
        },
    })
}

#[derive(Debug, Clone, Default)]
pub struct VarAccess<'a> {
    /// Variable name override; takes precedence over the positional name.
    pub key: Option<&'a str>,
    pub index: Option<&'a str>,
}

#[derive(Debug, Clone, Default)]
pub struct VarWrite<'a> {
    pub index: Option<&'a str>,
    pub as_type: Option<ValueType>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariableStore {
    values: BTreeMap<String, VarValue>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raw(&self, name: &str) -> Option<&VarValue> {
        self.values.get(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, name: &str, access: &VarAccess) -> VarValue {
        let name = access.key.unwrap_or(name);
        let stored = self.values.get(name).cloned().unwrap_or(VarValue::Null);

        let Some(index) = access.index else {
            return stored.coerce_numeric();
        };

        match stored.structured() {
            Some(structured) => index_into(&structured, index).coerce_numeric(),
            None => stored.coerce_numeric(),
        }
    }

    pub fn set(&mut self, name: &str, value: &str, write: &VarWrite) -> VarValue {
        let converted = convert_value_type(value, write.as_type);

        let Some(index) = write.index else {
            match converted {
                Some(v) => {
                    self.values.insert(name.to_string(), v.clone());
                    return v;
                }
                None => {
                    self.values.remove(name);
                    return VarValue::Null;
                }
            }
        };

        let element = converted.unwrap_or(VarValue::Null);
        let current = self.values.get(name).cloned().unwrap_or(VarValue::Null);
        let Some(structured) = current.structured() else {
            tracing::debug!(target: "macros", name, index, "indexed write into non-structured variable ignored");
            return current;
        };

        let updated = match (structured, parse_index(index)) {
            (VarValue::Null, Some(i)) if i <= MAX_INDEX_GAP => {
                let mut list = vec![VarValue::Null; i];
                list.push(element);
                VarValue::List(list)
            }
            (VarValue::Null, None) => {
                let mut map = BTreeMap::new();
                map.insert(index.to_string(), element);
                VarValue::Map(map)
            }
            (VarValue::List(mut list), Some(i)) if i <= list.len().saturating_add(MAX_INDEX_GAP) => {
                if i >= list.len() {
                    list.resize(i + 1, VarValue::Null);
                }
                list[i] = element;
                VarValue::List(list)
            }
            (VarValue::Null | VarValue::List(_), Some(_)) => {
                tracing::debug!(target: "macros", name, index, "list index out of range, write ignored");
                return current;
            }
            (VarValue::Map(mut map), _) => {
                map.insert(index.to_string(), element);
                VarValue::Map(map)
            }
            (other, _) => {
                tracing::debug!(target: "macros", name, index, "index does not fit stored value, left untouched");
                return other;
            }
        };

        self.values.insert(name.to_string(), updated.clone());
        updated
    }

    /// Appends to lists, adds numbers, otherwise concatenates as text.
    pub fn add(&mut self, name: &str, value: &str) -> VarValue {
        let current = self.values.get(name).cloned().unwrap_or(VarValue::Number(0.0));
        let current = if current.is_empty() { VarValue::Number(0.0) } else { current };

        if let Some(VarValue::List(mut list)) = current.structured() {
            list.push(VarValue::String(value.to_string()));
            let updated = VarValue::List(list);
            self.values.insert(name.to_string(), updated.clone());
            return updated;
        }

        let updated = match (current.as_number(), parse_number(value)) {
            (Some(a), Some(b)) => VarValue::Number(a + b),
            _ => VarValue::String(format!("{}{}", current, value)),
        };
        self.values.insert(name.to_string(), updated.clone());
        updated
    }

    pub fn increment(&mut self, name: &str) -> VarValue {
        self.add(name, "1")
    }

    pub fn decrement(&mut self, name: &str) -> VarValue {
        self.add(name, "-1")
    }

    pub fn remove(&mut self, name: &str) -> Option<VarValue> {
        self.values.remove(name)
    }
}

/// How far past the end of a list an indexed write may reach.
const MAX_INDEX_GAP: usize = 1024;

fn parse_index(index: &str) -> Option<usize> {
    index.trim().parse::<usize>().ok()
}

fn index_into(value: &VarValue, index: &str) -> VarValue {
    match value {
        VarValue::List(items) => parse_index(index)
            .and_then(|i| items.get(i).cloned())
            .unwrap_or(VarValue::Null),
        VarValue::Map(map) => map.get(index).cloned().unwrap_or(VarValue::Null),
        other => other.clone(),
    }
}

// value.rs — Runtime values carried by slots
//
// A closed, tagged value representation. Logical types live in the
// `TypeRegistry`; a `Value` only carries data. Sequences are `List`, the
// collection form used by multi-input slots and iteration regions.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::id::InstanceId;

/// Sentinel left in the output slots of an instance whose compute failed.
///
/// Dependents receive the poison unchanged instead of being computed, so the
/// origin of a failure stays visible at every downstream slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Poison {
    pub origin: InstanceId,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    #[default]
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<Value>),
    Error(Poison),
}

impl Value {
    pub fn poison(origin: InstanceId, message: impl Into<String>) -> Self {
        Value::Error(Poison {
            origin,
            message: message.into(),
        })
    }

    pub fn is_poison(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    /// First poison found in this value, looking inside sequences.
    pub fn find_poison(&self) -> Option<&Poison> {
        match self {
            Value::Error(p) => Some(p),
            Value::List(items) => items.iter().find_map(Value::find_poison),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Short variant name, used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Unit => "unit",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::List(_) => "list",
            Value::Error(_) => "error",
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unit => write!(f, "()"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{:?}", x),
            Value::Text(s) => write!(f, "{:?}", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Error(p) => write!(f, "<error from {}: {}>", p.origin, p.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_nested_list() {
        let v = Value::from(vec![Value::Float(1.0), Value::from(vec![2i64, 3])]);
        assert_eq!(v.to_string(), "[1.0, [2, 3]]");
    }

    #[test]
    fn poison_found_inside_sequences() {
        let p = Value::poison(InstanceId(5), "bad input");
        let v = Value::List(vec![Value::Int(1), Value::List(vec![p.clone()])]);
        assert_eq!(v.find_poison().map(|p| p.origin), Some(InstanceId(5)));
        assert!(Value::Int(1).find_poison().is_none());
        assert_eq!(p.to_string(), "<error from n5: bad input>");
    }

    #[test]
    fn serde_uses_tagged_representation() {
        let json = serde_json::to_string(&Value::Float(2.5)).unwrap();
        assert_eq!(json, r#"{"kind":"float","value":2.5}"#);
        let unit = serde_json::to_string(&Value::Unit).unwrap();
        assert_eq!(unit, r#"{"kind":"unit"}"#);
        let back: Value = serde_json::from_str(r#"{"kind":"list","value":[{"kind":"int","value":4}]}"#).unwrap();
        assert_eq!(back, Value::List(vec![Value::Int(4)]));
    }
}

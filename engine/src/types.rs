// types.rs — Type registry and implicit conversions
//
// Declares the set of value types a type library provides and the implicit
// conversions between them. Connections are validated here at connect time;
// the scheduler applies the chosen conversion when a value crosses the edge.
//
// Preconditions: types are registered before any symbol that mentions them.
// Postconditions: `can_connect` is true only for equal types or a single
//   registered hop (lifted element-wise over sequences of equal depth).
// Failure modes: unknown types, missing conversions, conversion functions
//   rejecting a value at runtime.
// Side effects: none beyond registry mutation.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::value::Value;

// ── Handles ─────────────────────────────────────────────────────────────────

/// A registered type, optionally wrapped in `depth` levels of sequence.
///
/// Every registered type implicitly has sequence forms: `[Float]` is the
/// handle of `Float` with depth 1. No separate registration is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeHandle {
    base: u32,
    depth: u8,
}

impl TypeHandle {
    /// Sequence type whose elements are `self`.
    pub fn sequence(self) -> TypeHandle {
        TypeHandle {
            base: self.base,
            depth: self.depth + 1,
        }
    }

    /// Element type if `self` is a sequence.
    pub fn element(self) -> Option<TypeHandle> {
        if self.depth == 0 {
            return None;
        }
        Some(TypeHandle {
            base: self.base,
            depth: self.depth - 1,
        })
    }

    pub fn is_sequence(self) -> bool {
        self.depth > 0
    }

    pub fn depth(self) -> u8 {
        self.depth
    }

    fn scalar(self) -> TypeHandle {
        TypeHandle {
            base: self.base,
            depth: 0,
        }
    }
}

pub type ConversionFn = Arc<dyn Fn(&Value) -> Result<Value, String> + Send + Sync>;

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypeError {
    #[error("unknown type '{0}'")]
    UnknownType(String),
    #[error("no conversion from '{from}' to '{to}'")]
    NoConversion { from: String, to: String },
    #[error("conversion from '{from}' to '{to}' failed: {message}")]
    ConversionFailed {
        from: String,
        to: String,
        message: String,
    },
    #[error("type '{0}' is already registered")]
    DuplicateType(String),
}

// ── Registry ────────────────────────────────────────────────────────────────

/// How a value crosses an edge between two connectable types.
#[derive(Clone)]
pub enum Conversion {
    Identity,
    Direct(ConversionFn),
    /// Element conversion applied `depth` sequence levels down.
    Lifted { depth: u8, func: ConversionFn },
}

impl fmt::Debug for Conversion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Conversion::Identity => write!(f, "Identity"),
            Conversion::Direct(_) => write!(f, "Direct"),
            Conversion::Lifted { depth, .. } => write!(f, "Lifted({})", depth),
        }
    }
}

#[derive(Default)]
pub struct TypeRegistry {
    names: Vec<String>,
    by_name: HashMap<String, u32>,
    conversions: HashMap<(TypeHandle, TypeHandle), ConversionFn>,
    /// `Value` variant carrying each scalar type, where declared.
    kinds: HashMap<u32, &'static str>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new scalar type by name.
    pub fn register_type(&mut self, name: &str) -> Result<TypeHandle, TypeError> {
        if self.by_name.contains_key(name) || name.starts_with('[') {
            return Err(TypeError::DuplicateType(name.to_string()));
        }
        let base = self.names.len() as u32;
        self.names.push(name.to_string());
        self.by_name.insert(name.to_string(), base);
        Ok(TypeHandle { base, depth: 0 })
    }

    /// Declare an implicit conversion `from -> to`.
    ///
    /// Registering a conversion between scalar types also allows the lifted
    /// conversion between their sequence forms of equal depth.
    pub fn register_conversion<F>(
        &mut self,
        from: TypeHandle,
        to: TypeHandle,
        func: F,
    ) -> Result<(), TypeError>
    where
        F: Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.check_known(from)?;
        self.check_known(to)?;
        if from == to {
            return Err(TypeError::NoConversion {
                from: self.name(from),
                to: self.name(to),
            });
        }
        self.conversions.insert((from, to), Arc::new(func));
        Ok(())
    }

    /// Declare which `Value` variant (by `Value::kind_name`) carries the
    /// data of a scalar type. Types without one admit any scalar value.
    pub fn bind_value_kind(&mut self, handle: TypeHandle, kind: &'static str) -> Result<(), TypeError> {
        self.check_known(handle)?;
        self.kinds.insert(handle.base, kind);
        Ok(())
    }

    /// True if `value` is a well-formed constant of type `handle`.
    pub fn admits(&self, handle: TypeHandle, value: &Value) -> bool {
        match value {
            Value::Error(_) => false,
            Value::List(items) => match handle.element() {
                Some(element) => items.iter().all(|item| self.admits(element, item)),
                None => false,
            },
            scalar => {
                !handle.is_sequence()
                    && self
                        .kinds
                        .get(&handle.base)
                        .map_or(true, |kind| *kind == scalar.kind_name())
            }
        }
    }

    /// Look a type up by display name, including sequence forms like `[Float]`.
    pub fn lookup(&self, name: &str) -> Option<TypeHandle> {
        let trimmed = name.trim();
        let depth = trimmed.chars().take_while(|&c| c == '[').count();
        let inner = &trimmed[depth..];
        let closing = inner.chars().rev().take_while(|&c| c == ']').count();
        if closing != depth {
            return None;
        }
        let scalar = &inner[..inner.len() - closing];
        let base = *self.by_name.get(scalar)?;
        Some(TypeHandle {
            base,
            depth: u8::try_from(depth).ok()?,
        })
    }

    pub fn contains(&self, handle: TypeHandle) -> bool {
        (handle.base as usize) < self.names.len()
    }

    /// Display name of a handle, e.g. `Float` or `[[Int]]`.
    pub fn name(&self, handle: TypeHandle) -> String {
        let scalar = self
            .names
            .get(handle.base as usize)
            .map(String::as_str)
            .unwrap_or("?");
        let depth = handle.depth as usize;
        format!("{}{}{}", "[".repeat(depth), scalar, "]".repeat(depth))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// All registered scalar types in registration order.
    pub fn types(&self) -> impl Iterator<Item = TypeHandle> + '_ {
        (0..self.names.len() as u32).map(|base| TypeHandle { base, depth: 0 })
    }

    /// True if equal, or a single registered hop exists.
    pub fn can_connect(&self, from: TypeHandle, to: TypeHandle) -> bool {
        self.conversion(from, to).is_ok()
    }

    /// Resolve the conversion used on an edge `from -> to`.
    pub fn conversion(&self, from: TypeHandle, to: TypeHandle) -> Result<Conversion, TypeError> {
        self.check_known(from)?;
        self.check_known(to)?;
        if from == to {
            return Ok(Conversion::Identity);
        }
        if let Some(func) = self.conversions.get(&(from, to)) {
            return Ok(Conversion::Direct(func.clone()));
        }
        if from.depth == to.depth && from.depth > 0 {
            if let Some(func) = self.conversions.get(&(from.scalar(), to.scalar())) {
                return Ok(Conversion::Lifted {
                    depth: from.depth,
                    func: func.clone(),
                });
            }
        }
        Err(TypeError::NoConversion {
            from: self.name(from),
            to: self.name(to),
        })
    }

    /// Convert `value` from one type to another using at most one hop.
    pub fn convert(&self, value: &Value, from: TypeHandle, to: TypeHandle) -> Result<Value, TypeError> {
        let conversion = self.conversion(from, to)?;
        self.apply(&conversion, value, from, to)
    }

    /// Apply an already-resolved conversion.
    pub fn apply(
        &self,
        conversion: &Conversion,
        value: &Value,
        from: TypeHandle,
        to: TypeHandle,
    ) -> Result<Value, TypeError> {
        let fail = |message: String| TypeError::ConversionFailed {
            from: self.name(from),
            to: self.name(to),
            message,
        };
        match conversion {
            Conversion::Identity => Ok(value.clone()),
            Conversion::Direct(func) => func(value).map_err(fail),
            Conversion::Lifted { depth, func } => lift(value, *depth, func.as_ref()).map_err(fail),
        }
    }

    fn check_known(&self, handle: TypeHandle) -> Result<(), TypeError> {
        if self.contains(handle) {
            Ok(())
        } else {
            Err(TypeError::UnknownType(format!("#{}", handle.base)))
        }
    }
}

fn lift(
    value: &Value,
    depth: u8,
    func: &(dyn Fn(&Value) -> Result<Value, String> + Send + Sync),
) -> Result<Value, String> {
    if depth == 0 {
        return func(value);
    }
    match value {
        Value::List(items) => items
            .iter()
            .map(|item| lift(item, depth - 1, func))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),
        other => Err(format!("expected a sequence, found {}", other.kind_name())),
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (TypeRegistry, TypeHandle, TypeHandle, TypeHandle) {
        let mut types = TypeRegistry::new();
        let int = types.register_type("Int").unwrap();
        let float = types.register_type("Float").unwrap();
        let text = types.register_type("Text").unwrap();
        types
            .register_conversion(int, float, |v| match v {
                Value::Int(i) => Ok(Value::Float(*i as f64)),
                other => Err(format!("not an int: {}", other)),
            })
            .unwrap();
        types
            .register_conversion(float, text, |v| Ok(Value::Text(v.to_string())))
            .unwrap();
        (types, int, float, text)
    }

    #[test]
    fn equal_types_connect() {
        let (types, int, _, _) = registry();
        assert!(types.can_connect(int, int));
    }

    #[test]
    fn single_hop_only() {
        let (types, int, float, text) = registry();
        assert!(types.can_connect(int, float));
        assert!(types.can_connect(float, text));
        // int -> float -> text would take two hops
        assert!(!types.can_connect(int, text));
        assert!(!types.can_connect(float, int));
    }

    #[test]
    fn conversion_lifts_over_sequences() {
        let (types, int, float, _) = registry();
        assert!(types.can_connect(int.sequence(), float.sequence()));
        assert!(!types.can_connect(int.sequence(), float));
        let out = types
            .convert(&Value::from(vec![1i64, 2]), int.sequence(), float.sequence())
            .unwrap();
        assert_eq!(out, Value::from(vec![1.0, 2.0]));
    }

    #[test]
    fn convert_errors() {
        let (types, int, float, text) = registry();
        assert_eq!(
            types.convert(&Value::Int(1), int, text),
            Err(TypeError::NoConversion {
                from: "Int".into(),
                to: "Text".into()
            })
        );
        let err = types.convert(&Value::Bool(true), int, float).unwrap_err();
        assert!(matches!(err, TypeError::ConversionFailed { .. }));
    }

    #[test]
    fn unknown_type_rejected() {
        let (types, int, _, _) = registry();
        let mut other = TypeRegistry::new();
        for name in ["A", "B", "C", "D"] {
            other.register_type(name).unwrap();
        }
        let foreign = other.lookup("D").unwrap();
        assert!(matches!(
            types.convert(&Value::Unit, int, foreign),
            Err(TypeError::UnknownType(_))
        ));
    }

    #[test]
    fn duplicate_type_rejected() {
        let (mut types, _, _, _) = registry();
        assert_eq!(
            types.register_type("Int"),
            Err(TypeError::DuplicateType("Int".into()))
        );
    }

    #[test]
    fn admits_checks_bound_kinds_and_nesting() {
        let (mut types, int, float, text) = registry();
        types.bind_value_kind(float, "float").unwrap();
        assert!(types.admits(float, &Value::Float(1.0)));
        assert!(!types.admits(float, &Value::from("1.0")));
        assert!(!types.admits(float, &Value::Unit));
        assert!(types.admits(float.sequence(), &Value::from(vec![1.0, 2.0])));
        assert!(!types.admits(float.sequence(), &Value::Float(1.0)));
        assert!(!types.admits(float, &Value::from(vec![1.0])));
        assert!(!types.admits(float, &Value::poison(crate::id::InstanceId(0), "x")));
        // Unbound types take any scalar.
        assert!(types.admits(text, &Value::Int(3)));
        assert!(types.admits(int, &Value::Bool(true)));
    }

    #[test]
    fn names_round_trip_through_lookup() {
        let (types, _, float, _) = registry();
        let nested = float.sequence().sequence();
        assert_eq!(types.name(nested), "[[Float]]");
        assert_eq!(types.lookup("[[Float]]"), Some(nested));
        assert_eq!(types.lookup("[Float"), None);
        assert_eq!(nested.element(), Some(float.sequence()));
        assert_eq!(float.element(), None);
    }
}

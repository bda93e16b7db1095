// library.rs — Standard type and operator library
//
// A reference library: four scalar types with their one-hop conversions and
// a handful of operators over them. The core engine never depends on it;
// the CLI, integration tests and benches build graphs from it.

use std::sync::Arc;

use thiserror::Error;

use crate::command::Command;
use crate::symbol::{ComputeContext, ComputeError, SymbolDef, SymbolError, SymbolTable};
use crate::types::{TypeError, TypeHandle, TypeRegistry};
use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LibraryError {
    #[error(transparent)]
    Type(#[from] TypeError),
    #[error(transparent)]
    Symbol(#[from] SymbolError),
}

/// Handles of the standard scalar types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandardTypes {
    pub bool: TypeHandle,
    pub int: TypeHandle,
    pub float: TypeHandle,
    pub text: TypeHandle,
}

/// A populated registry and symbol table, ready for `InstanceGraph::new`.
pub struct Library {
    pub types: Arc<TypeRegistry>,
    pub symbols: SymbolTable,
    pub handles: StandardTypes,
}

/// Register Bool, Int, Float and Text plus their implicit conversions.
pub fn register_types(registry: &mut TypeRegistry) -> Result<StandardTypes, TypeError> {
    let handles = StandardTypes {
        bool: registry.register_type("Bool")?,
        int: registry.register_type("Int")?,
        float: registry.register_type("Float")?,
        text: registry.register_type("Text")?,
    };
    registry.bind_value_kind(handles.bool, "bool")?;
    registry.bind_value_kind(handles.int, "int")?;
    registry.bind_value_kind(handles.float, "float")?;
    registry.bind_value_kind(handles.text, "text")?;

    registry.register_conversion(handles.bool, handles.int, |v| match v {
        Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
        other => Err(format!("expected Bool, got {}", other.kind_name())),
    })?;
    registry.register_conversion(handles.int, handles.float, |v| match v {
        Value::Int(i) => Ok(Value::Float(*i as f64)),
        other => Err(format!("expected Int, got {}", other.kind_name())),
    })?;
    registry.register_conversion(handles.int, handles.text, |v| Ok(Value::Text(v.to_string())))?;
    registry.register_conversion(handles.float, handles.text, |v| Ok(Value::Text(v.to_string())))?;
    registry.register_conversion(handles.text, handles.float, |v| {
        let text = v.as_text().ok_or_else(|| format!("expected Text, got {}", v.kind_name()))?;
        text.trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|e| format!("'{}' is not a number: {}", text, e))
    })?;
    Ok(handles)
}

fn float(inputs: &[Value], index: usize, cx: &ComputeContext<'_>) -> Result<f64, ComputeError> {
    inputs[index]
        .as_float()
        .ok_or_else(|| cx.error(format!("input {} expects Float, got {}", index, inputs[index].kind_name())))
}

fn floats(value: &Value, cx: &ComputeContext<'_>) -> Result<Vec<f64>, ComputeError> {
    let items = value
        .as_list()
        .ok_or_else(|| cx.error(format!("expected a sequence, got {}", value.kind_name())))?;
    items
        .iter()
        .map(|v| v.as_float().ok_or_else(|| cx.error(format!("expected Float element, got {}", v.kind_name()))))
        .collect()
}

/// Define the standard operators against `t`.
pub fn register_symbols(symbols: &mut SymbolTable, t: &StandardTypes) -> Result<(), SymbolError> {
    symbols.define(
        SymbolDef::new("Constant")
            .input("value", t.float, 0.0)
            .output("out", t.float)
            .compute(|inputs, _| Ok(vec![inputs[0].clone()])),
    )?;
    symbols.define(
        SymbolDef::new("ConstantList")
            .input("values", t.float.sequence(), Value::List(Vec::new()))
            .output("out", t.float.sequence())
            .compute(|inputs, _| Ok(vec![inputs[0].clone()])),
    )?;
    symbols.define(
        SymbolDef::new("Add")
            .input("a", t.float, 0.0)
            .input("b", t.float, 0.0)
            .output("out", t.float)
            .compute(|inputs, cx| Ok(vec![Value::Float(float(inputs, 0, cx)? + float(inputs, 1, cx)?)])),
    )?;
    symbols.define(
        SymbolDef::new("Subtract")
            .input("a", t.float, 0.0)
            .input("b", t.float, 0.0)
            .output("out", t.float)
            .compute(|inputs, cx| Ok(vec![Value::Float(float(inputs, 0, cx)? - float(inputs, 1, cx)?)])),
    )?;
    symbols.define(
        SymbolDef::new("Multiply")
            .input("a", t.float, 1.0)
            .input("b", t.float, 1.0)
            .output("out", t.float)
            .compute(|inputs, cx| Ok(vec![Value::Float(float(inputs, 0, cx)? * float(inputs, 1, cx)?)])),
    )?;
    symbols.define(
        SymbolDef::new("Divide")
            .input("a", t.float, 0.0)
            .input("b", t.float, 1.0)
            .output("out", t.float)
            .compute(|inputs, cx| {
                let b = float(inputs, 1, cx)?;
                if b == 0.0 {
                    return Err(cx.error("division by zero"));
                }
                Ok(vec![Value::Float(float(inputs, 0, cx)? / b)])
            }),
    )?;
    symbols.define(
        SymbolDef::new("Double")
            .input("x", t.float, 0.0)
            .output("out", t.float)
            .compute(|inputs, cx| Ok(vec![Value::Float(float(inputs, 0, cx)? * 2.0)])),
    )?;
    symbols.define(
        SymbolDef::new("Negate")
            .input("x", t.float, 0.0)
            .output("out", t.float)
            .compute(|inputs, cx| Ok(vec![Value::Float(-float(inputs, 0, cx)?)])),
    )?;
    symbols.define(
        SymbolDef::new("Time")
            .output("seconds", t.float)
            .time_varying()
            .compute(|_, cx| Ok(vec![Value::Float(cx.time())])),
    )?;
    symbols.define(
        SymbolDef::new("Index")
            .output("index", t.int)
            .compute(|_, cx| Ok(vec![Value::Int(cx.iteration().map_or(0, i64::from))])),
    )?;
    symbols.define(
        SymbolDef::new("Sum")
            .multi_input("items", t.float)
            .output("out", t.float)
            .compute(|inputs, cx| Ok(vec![Value::Float(floats(&inputs[0], cx)?.iter().sum())])),
    )?;
    symbols.define(
        SymbolDef::new("Collect")
            .multi_input("items", t.float)
            .output("out", t.float.sequence())
            .compute(|inputs, _| Ok(vec![inputs[0].clone()])),
    )?;
    symbols.define(
        SymbolDef::new("Length")
            .input("items", t.float.sequence(), Value::List(Vec::new()))
            .output("len", t.int)
            .compute(|inputs, cx| {
                let items = inputs[0]
                    .as_list()
                    .ok_or_else(|| cx.error(format!("expected a sequence, got {}", inputs[0].kind_name())))?;
                Ok(vec![Value::Int(items.len() as i64)])
            }),
    )?;
    symbols.define(
        SymbolDef::new("Greater")
            .input("a", t.float, 0.0)
            .input("b", t.float, 0.0)
            .output("out", t.bool)
            .compute(|inputs, cx| Ok(vec![Value::Bool(float(inputs, 0, cx)? > float(inputs, 1, cx)?)])),
    )?;
    symbols.define(
        SymbolDef::new("Format")
            .input("value", t.text, "")
            .input("prefix", t.text, "")
            .output("out", t.text)
            .compute(|inputs, _| {
                let value = inputs[0].as_text().unwrap_or_default();
                let prefix = inputs[1].as_text().unwrap_or_default();
                Ok(vec![Value::Text(format!("{}{}", prefix, value))])
            }),
    )?;
    // Side effects run every pass, so Draw is time-varying.
    symbols.define(
        SymbolDef::new("Draw")
            .input("label", t.text, "")
            .input("value", t.float, 0.0)
            .output("out", t.float)
            .time_varying()
            .compute(|inputs, cx| {
                let command = Command::new("draw")
                    .with_params(vec![inputs[0].clone(), inputs[1].clone()])
                    .from_instance(cx.instance());
                cx.emit(command);
                Ok(vec![inputs[1].clone()])
            }),
    )?;
    Ok(())
}

/// The full standard library.
pub fn standard() -> Result<Library, LibraryError> {
    let mut types = TypeRegistry::new();
    let handles = register_types(&mut types)?;
    let mut symbols = SymbolTable::new();
    register_symbols(&mut symbols, &handles)?;
    log::debug!("standard library: {} types, {} symbols", types.len(), symbols.len());
    Ok(Library {
        types: Arc::new(types),
        symbols,
        handles,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions_are_single_hop() {
        let lib = standard().unwrap();
        let t = lib.handles;
        assert!(lib.types.can_connect(t.int, t.float));
        assert!(lib.types.can_connect(t.bool, t.int));
        // Bool -> Int -> Float would take two hops.
        assert!(!lib.types.can_connect(t.bool, t.float));
        assert!(lib.types.can_connect(t.int.sequence(), t.float.sequence()));
    }

    #[test]
    fn text_to_float_rejects_garbage() {
        let lib = standard().unwrap();
        let t = lib.handles;
        assert_eq!(
            lib.types.convert(&Value::from(" 2.5 "), t.text, t.float).unwrap(),
            Value::Float(2.5)
        );
        assert!(matches!(
            lib.types.convert(&Value::from("x"), t.text, t.float),
            Err(TypeError::ConversionFailed { .. })
        ));
    }

    #[test]
    fn every_symbol_is_defined_once() {
        let lib = standard().unwrap();
        for name in [
            "Constant", "ConstantList", "Add", "Subtract", "Multiply", "Divide", "Double", "Negate", "Time",
            "Index", "Sum", "Collect", "Length", "Greater", "Format", "Draw",
        ] {
            let symbol = lib.symbols.lookup(name).unwrap_or_else(|| panic!("{} missing", name));
            assert_eq!(symbol.version, 1, "{}", name);
        }
        assert!(lib.symbols.lookup("Time").unwrap().time_varying);
    }
}

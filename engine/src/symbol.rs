// symbol.rs — Symbol table: operator templates
//
// A symbol is an immutable operator template: ordered input and output
// declarations plus a factory producing the runtime operator. Many instances
// may share one symbol. Redefinition never happens in place: a new version
// gets a new ID and the old one is retired explicitly.
//
// Preconditions: every TypeHandle in a declaration comes from the registry
//   the graph is validated against.
// Postconditions: IDs are stable; a defined symbol never changes.
// Failure modes: duplicate names, unknown or retired symbols.
// Side effects: none.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::command::Command;
use crate::context::EvaluationContext;
use crate::graph::Instance;
use crate::id::{InstanceId, SymbolId};
use crate::types::TypeHandle;
use crate::value::Value;

// ── Operators ───────────────────────────────────────────────────────────────

/// A failed compute. The scheduler turns it into a poisoned slot and a
/// diagnostic; it never aborts the pass.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{instance}: {message}")]
pub struct ComputeError {
    pub instance: InstanceId,
    pub message: String,
}

impl ComputeError {
    pub fn new(instance: InstanceId, message: impl Into<String>) -> Self {
        Self {
            instance,
            message: message.into(),
        }
    }
}

/// What a compute function can see and do besides reading its inputs.
pub struct ComputeContext<'a> {
    eval: &'a EvaluationContext,
    instance: InstanceId,
    commands: &'a mut Vec<Command>,
}

impl<'a> ComputeContext<'a> {
    pub(crate) fn new(
        eval: &'a EvaluationContext,
        instance: InstanceId,
        commands: &'a mut Vec<Command>,
    ) -> Self {
        Self {
            eval,
            instance,
            commands,
        }
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    pub fn eval(&self) -> &EvaluationContext {
        self.eval
    }

    pub fn time(&self) -> f64 {
        self.eval.time()
    }

    /// Innermost iteration index, if evaluating inside a ForEach or Repeat.
    pub fn iteration(&self) -> Option<u32> {
        self.eval.call_context().iteration()
    }

    /// Defer a side effect to the command buffer.
    pub fn emit(&mut self, command: Command) {
        self.commands.push(command);
    }

    /// Build a `ComputeError` attributed to this instance.
    pub fn error(&self, message: impl Into<String>) -> ComputeError {
        ComputeError::new(self.instance, message)
    }
}

/// Runtime behavior of an instance.
pub trait Operator: Send + Sync {
    /// Compute all outputs from the collected inputs.
    ///
    /// Single inputs arrive as their value, multi-inputs as a `Value::List`
    /// in connection order. Must return exactly one value per declared output.
    fn compute(&self, inputs: &[Value], cx: &mut ComputeContext<'_>)
        -> Result<Vec<Value>, ComputeError>;
}

pub type ComputeFn =
    dyn Fn(&[Value], &mut ComputeContext<'_>) -> Result<Vec<Value>, ComputeError> + Send + Sync;

/// Operator backed by a shared closure.
#[derive(Clone)]
pub struct FnOperator {
    func: Arc<ComputeFn>,
}

impl FnOperator {
    pub fn new(func: Arc<ComputeFn>) -> Self {
        Self { func }
    }
}

impl Operator for FnOperator {
    fn compute(
        &self,
        inputs: &[Value],
        cx: &mut ComputeContext<'_>,
    ) -> Result<Vec<Value>, ComputeError> {
        (self.func)(inputs, cx)
    }
}

pub type Factory = Arc<dyn Fn() -> Box<dyn Operator> + Send + Sync>;

// ── Declarations ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    /// At most one incoming connection.
    Single,
    /// Ordered list of connections, collected into a sequence.
    Multi,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InputDecl {
    pub name: String,
    pub ty: TypeHandle,
    pub default: Value,
    pub arity: Arity,
}

impl InputDecl {
    pub fn new(name: impl Into<String>, ty: TypeHandle, default: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            ty,
            default: default.into(),
            arity: Arity::Single,
        }
    }

    /// Multi-input collecting elements of `ty`; the slot's value is `[ty]`.
    pub fn multi(name: impl Into<String>, ty: TypeHandle) -> Self {
        Self {
            name: name.into(),
            ty,
            default: Value::List(Vec::new()),
            arity: Arity::Multi,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputDecl {
    pub name: String,
    pub ty: TypeHandle,
}

impl OutputDecl {
    pub fn new(name: impl Into<String>, ty: TypeHandle) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// An immutable operator template.
pub struct Symbol {
    pub id: SymbolId,
    pub name: String,
    pub version: u32,
    pub inputs: Vec<InputDecl>,
    pub outputs: Vec<OutputDecl>,
    /// Outputs are always-dirty sources (clocks, live inputs).
    pub time_varying: bool,
    retired: bool,
    factory: Factory,
}

impl Symbol {
    pub fn is_retired(&self) -> bool {
        self.retired
    }

    pub fn input_index(&self, name: &str) -> Option<usize> {
        self.inputs.iter().position(|d| d.name == name)
    }

    pub fn output_index(&self, name: &str) -> Option<usize> {
        self.outputs.iter().position(|d| d.name == name)
    }

    pub(crate) fn make_operator(&self) -> Box<dyn Operator> {
        (self.factory)()
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Symbol")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("version", &self.version)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("time_varying", &self.time_varying)
            .field("retired", &self.retired)
            .finish()
    }
}

/// Builder for a symbol definition.
pub struct SymbolDef {
    name: String,
    inputs: Vec<InputDecl>,
    outputs: Vec<OutputDecl>,
    time_varying: bool,
    factory: Option<Factory>,
}

impl SymbolDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            time_varying: false,
            factory: None,
        }
    }

    pub fn input(mut self, name: &str, ty: TypeHandle, default: impl Into<Value>) -> Self {
        self.inputs.push(InputDecl::new(name, ty, default));
        self
    }

    pub fn multi_input(mut self, name: &str, ty: TypeHandle) -> Self {
        self.inputs.push(InputDecl::multi(name, ty));
        self
    }

    pub fn output(mut self, name: &str, ty: TypeHandle) -> Self {
        self.outputs.push(OutputDecl::new(name, ty));
        self
    }

    pub fn time_varying(mut self) -> Self {
        self.time_varying = true;
        self
    }

    pub fn factory(mut self, factory: Factory) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Use a closure as the operator; every instance shares it.
    pub fn compute<F>(self, func: F) -> Self
    where
        F: Fn(&[Value], &mut ComputeContext<'_>) -> Result<Vec<Value>, ComputeError>
            + Send
            + Sync
            + 'static,
    {
        let func: Arc<ComputeFn> = Arc::new(func);
        self.factory(Arc::new(move || {
            Box::new(FnOperator::new(func.clone())) as Box<dyn Operator>
        }))
    }
}

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SymbolError {
    #[error("symbol '{0}' is already defined")]
    DuplicateSymbol(String),
    #[error("unknown symbol '{0}'")]
    UnknownSymbol(String),
    #[error("symbol '{0}' has been retired")]
    RetiredSymbol(String),
    #[error("symbol '{0}' has no operator factory")]
    MissingFactory(String),
}

// ── Symbol table ────────────────────────────────────────────────────────────

/// Arena of symbols, addressed by `SymbolId`.
#[derive(Default)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    by_name: HashMap<String, Vec<SymbolId>>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a new symbol. Fails if the name is already taken.
    pub fn define_symbol(
        &mut self,
        name: &str,
        inputs: Vec<InputDecl>,
        outputs: Vec<OutputDecl>,
        factory: Factory,
    ) -> Result<SymbolId, SymbolError> {
        let mut def = SymbolDef::new(name).factory(factory);
        def.inputs = inputs;
        def.outputs = outputs;
        self.define(def)
    }

    /// Define a symbol from a builder. Fails if the name is already taken.
    pub fn define(&mut self, def: SymbolDef) -> Result<SymbolId, SymbolError> {
        if self.by_name.contains_key(&def.name) {
            return Err(SymbolError::DuplicateSymbol(def.name));
        }
        self.insert(def, 1)
    }

    /// Define the next version of an existing symbol under a new ID.
    ///
    /// Existing instances keep referencing the old ID until they are migrated
    /// with `InstanceGraph::migrate_instances`.
    pub fn define_version(&mut self, def: SymbolDef) -> Result<SymbolId, SymbolError> {
        let latest = self
            .by_name
            .get(&def.name)
            .and_then(|ids| ids.last())
            .ok_or_else(|| SymbolError::UnknownSymbol(def.name.clone()))?;
        let version = self.symbols[latest.0 as usize].version + 1;
        self.insert(def, version)
    }

    fn insert(&mut self, def: SymbolDef, version: u32) -> Result<SymbolId, SymbolError> {
        let factory = def
            .factory
            .ok_or_else(|| SymbolError::MissingFactory(def.name.clone()))?;
        let id = SymbolId(self.symbols.len() as u32);
        log::debug!("define symbol '{}' v{} as {}", def.name, version, id);
        self.by_name.entry(def.name.clone()).or_default().push(id);
        self.symbols.push(Symbol {
            id,
            name: def.name,
            version,
            inputs: def.inputs,
            outputs: def.outputs,
            time_varying: def.time_varying,
            retired: false,
            factory,
        });
        Ok(id)
    }

    /// Retire a symbol: it stays resolvable for existing instances but can
    /// no longer be instantiated.
    pub fn retire(&mut self, id: SymbolId) -> Result<(), SymbolError> {
        let symbol = self
            .symbols
            .get_mut(id.0 as usize)
            .ok_or_else(|| SymbolError::UnknownSymbol(id.to_string()))?;
        symbol.retired = true;
        Ok(())
    }

    /// Produce a fresh, unplaced instance of a symbol.
    pub fn instantiate(&self, id: SymbolId) -> Result<Instance, SymbolError> {
        let symbol = self.get(id)?;
        if symbol.retired {
            return Err(SymbolError::RetiredSymbol(format!(
                "{} v{}",
                symbol.name, symbol.version
            )));
        }
        Ok(Instance::from_symbol(symbol))
    }

    pub fn get(&self, id: SymbolId) -> Result<&Symbol, SymbolError> {
        self.symbols
            .get(id.0 as usize)
            .ok_or_else(|| SymbolError::UnknownSymbol(id.to_string()))
    }

    /// Latest non-retired version of a symbol by name.
    pub fn lookup(&self, name: &str) -> Option<&Symbol> {
        self.by_name
            .get(name)?
            .iter()
            .rev()
            .map(|id| &self.symbols[id.0 as usize])
            .find(|s| !s.retired)
    }

    pub fn lookup_version(&self, name: &str, version: u32) -> Option<&Symbol> {
        self.by_name
            .get(name)?
            .iter()
            .map(|id| &self.symbols[id.0 as usize])
            .find(|s| s.version == version)
    }

    pub fn symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.iter()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeRegistry;

    fn float() -> TypeHandle {
        let mut types = TypeRegistry::new();
        types.register_type("Float").unwrap()
    }

    fn passthrough(name: &str, ty: TypeHandle) -> SymbolDef {
        SymbolDef::new(name)
            .input("in", ty, 0.0)
            .output("out", ty)
            .compute(|inputs, _| Ok(vec![inputs[0].clone()]))
    }

    #[test]
    fn define_and_lookup() {
        let ty = float();
        let mut table = SymbolTable::new();
        let id = table.define(passthrough("Pass", ty)).unwrap();
        let sym = table.lookup("Pass").unwrap();
        assert_eq!(sym.id, id);
        assert_eq!(sym.version, 1);
        assert_eq!(sym.input_index("in"), Some(0));
        assert_eq!(sym.output_index("out"), Some(0));
        assert_eq!(sym.output_index("missing"), None);
    }

    #[test]
    fn duplicate_name_rejected() {
        let ty = float();
        let mut table = SymbolTable::new();
        table.define(passthrough("Pass", ty)).unwrap();
        assert_eq!(
            table.define(passthrough("Pass", ty)).unwrap_err(),
            SymbolError::DuplicateSymbol("Pass".into())
        );
    }

    #[test]
    fn define_symbol_with_explicit_declarations() {
        let ty = float();
        let mut table = SymbolTable::new();
        let factory: Factory = Arc::new(|| {
            let op = FnOperator::new(Arc::new(|inputs: &[Value], _: &mut ComputeContext<'_>| {
                Ok(vec![inputs[0].clone()])
            }));
            Box::new(op) as Box<dyn Operator>
        });
        let id = table
            .define_symbol(
                "Identity",
                vec![InputDecl::new("x", ty, 1.0)],
                vec![OutputDecl::new("y", ty)],
                factory,
            )
            .unwrap();
        let instance = table.instantiate(id).unwrap();
        assert_eq!(instance.inputs().len(), 1);
        assert_eq!(instance.outputs().len(), 1);
    }

    #[test]
    fn versioning_requires_explicit_retirement() {
        let ty = float();
        let mut table = SymbolTable::new();
        let v1 = table.define(passthrough("Pass", ty)).unwrap();
        let v2 = table.define_version(passthrough("Pass", ty)).unwrap();
        assert_ne!(v1, v2);
        assert_eq!(table.get(v2).unwrap().version, 2);
        // v1 still instantiable until retired
        assert!(table.instantiate(v1).is_ok());
        table.retire(v1).unwrap();
        assert!(matches!(
            table.instantiate(v1),
            Err(SymbolError::RetiredSymbol(_))
        ));
        assert_eq!(table.lookup("Pass").unwrap().id, v2);
        assert_eq!(table.lookup_version("Pass", 1).unwrap().id, v1);
    }

    #[test]
    fn version_of_unknown_symbol_fails() {
        let ty = float();
        let mut table = SymbolTable::new();
        assert!(matches!(
            table.define_version(passthrough("Nope", ty)),
            Err(SymbolError::UnknownSymbol(_))
        ));
    }

    #[test]
    fn unknown_symbol_instantiation_fails() {
        let table = SymbolTable::new();
        assert!(matches!(
            table.instantiate(SymbolId(9)),
            Err(SymbolError::UnknownSymbol(_))
        ));
    }

    #[test]
    fn missing_factory_rejected() {
        let ty = float();
        let mut table = SymbolTable::new();
        let def = SymbolDef::new("Hollow").output("out", ty);
        assert_eq!(
            table.define(def).unwrap_err(),
            SymbolError::MissingFactory("Hollow".into())
        );
    }
}

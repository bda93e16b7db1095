// graph.rs — Instance graph: instances, slots, connections and regions
//
// The runtime graph. Instances live in an arena keyed by `InstanceId` and
// reference their symbol by ID. Every structural mutation validates fully
// before applying, so a failed edit leaves the graph untouched.
//
// Preconditions: the type registry is fully populated before graph edits.
// Postconditions: the connection graph is acyclic; every connection joins
//   slots of the same region scope with connectable types; single inputs
//   carry at most one connection.
// Failure modes: `ConnectError`, `GraphError`, `RegionError`.
// Side effects: connecting, disconnecting and value edits invalidate the
//   affected input slots and their downstream closure.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

use crate::context::CallContext;
use crate::dirty::{self, DirtyFlag, Revision, RevisionClock};
use crate::id::{ConnectionId, IdAllocator, InstanceId, RegionId, SymbolId};
use crate::region::{Branch, Region, RegionError, RegionKind, RegionSpec};
use crate::symbol::{Arity, Operator, Symbol, SymbolError, SymbolTable};
use crate::types::{Conversion, TypeHandle, TypeRegistry};
use crate::value::Value;

// ── Slot addressing ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputRef {
    pub instance: InstanceId,
    pub index: usize,
}

impl OutputRef {
    pub fn new(instance: InstanceId, index: usize) -> Self {
        Self { instance, index }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InputRef {
    pub instance: InstanceId,
    pub index: usize,
}

impl InputRef {
    pub fn new(instance: InstanceId, index: usize) -> Self {
        Self { instance, index }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotRef {
    Input(InputRef),
    Output(OutputRef),
}

impl SlotRef {
    pub fn instance(&self) -> InstanceId {
        match self {
            SlotRef::Input(i) => i.instance,
            SlotRef::Output(o) => o.instance,
        }
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.out{}", self.instance, self.index)
    }
}

impl fmt::Display for InputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.in{}", self.instance, self.index)
    }
}

// ── Slots ───────────────────────────────────────────────────────────────────

/// Mutable runtime state of a slot, guarded by the slot's own lock so that
/// evaluation can proceed under a shared borrow of the graph.
#[derive(Debug, Clone)]
pub(crate) struct SlotState {
    pub(crate) value: Value,
    pub(crate) flag: DirtyFlag,
    /// Call context the current value was produced under.
    pub(crate) context: Option<CallContext>,
    /// Pass that last produced the value (always-dirty sources).
    pub(crate) pass: Option<u64>,
}

/// A typed value cell on an instance.
#[derive(Debug)]
pub struct Slot {
    name: String,
    ty: TypeHandle,
    arity: Arity,
    default: Value,
    /// Incoming connections for inputs, outgoing for outputs.
    connections: Vec<ConnectionId>,
    state: Mutex<SlotState>,
}

impl Slot {
    pub(crate) fn new(name: &str, ty: TypeHandle, arity: Arity, default: Value, always_dirty: bool) -> Self {
        Slot {
            name: name.to_string(),
            ty,
            arity,
            default: default.clone(),
            connections: Vec::new(),
            state: Mutex::new(SlotState {
                value: default,
                flag: DirtyFlag::new(always_dirty),
                context: None,
                pass: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared type; the element type for multi-inputs.
    pub fn ty(&self) -> TypeHandle {
        self.ty
    }

    /// Type of the value the slot holds (`[ty]` for multi-inputs).
    pub fn value_type(&self) -> TypeHandle {
        match self.arity {
            Arity::Single => self.ty,
            Arity::Multi => self.ty.sequence(),
        }
    }

    pub fn arity(&self) -> Arity {
        self.arity
    }

    pub fn is_multi(&self) -> bool {
        self.arity == Arity::Multi
    }

    pub fn default_value(&self) -> &Value {
        &self.default
    }

    pub fn connections(&self) -> &[ConnectionId] {
        &self.connections
    }

    pub fn value(&self) -> Value {
        self.state.lock().value.clone()
    }

    pub fn flag(&self) -> DirtyFlag {
        self.state.lock().flag
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().flag.is_dirty()
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock()
    }
}

// ── Instances ───────────────────────────────────────────────────────────────

pub enum InstanceKind {
    Operator {
        symbol: SymbolId,
        operator: Box<dyn Operator>,
    },
    /// Border of a region: external inputs, inner-facing outputs.
    RegionEntry(RegionId),
    /// Border of a region: inner-facing inputs, external outputs.
    RegionExit(RegionId),
}

impl fmt::Debug for InstanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceKind::Operator { symbol, .. } => write!(f, "Operator({})", symbol),
            InstanceKind::RegionEntry(r) => write!(f, "RegionEntry({})", r),
            InstanceKind::RegionExit(r) => write!(f, "RegionExit({})", r),
        }
    }
}

/// A runtime node.
#[derive(Debug)]
pub struct Instance {
    kind: InstanceKind,
    scope: Option<RegionId>,
    inputs: Vec<Slot>,
    outputs: Vec<Slot>,
    /// Transitively depends on a time-varying source.
    volatile: bool,
    time_varying: bool,
}

impl Instance {
    pub(crate) fn from_symbol(symbol: &Symbol) -> Self {
        let inputs = symbol
            .inputs
            .iter()
            .map(|d| Slot::new(&d.name, d.ty, d.arity, d.default.clone(), false))
            .collect();
        let outputs = symbol
            .outputs
            .iter()
            .map(|d| Slot::new(&d.name, d.ty, Arity::Single, Value::Unit, symbol.time_varying))
            .collect();
        Instance {
            kind: InstanceKind::Operator {
                symbol: symbol.id,
                operator: symbol.make_operator(),
            },
            scope: None,
            inputs,
            outputs,
            volatile: symbol.time_varying,
            time_varying: symbol.time_varying,
        }
    }

    pub(crate) fn boundary(kind: InstanceKind, scope: Option<RegionId>, inputs: Vec<Slot>, outputs: Vec<Slot>) -> Self {
        Instance {
            kind,
            scope,
            inputs,
            outputs,
            volatile: false,
            time_varying: false,
        }
    }

    pub fn kind(&self) -> &InstanceKind {
        &self.kind
    }

    pub fn symbol(&self) -> Option<SymbolId> {
        match &self.kind {
            InstanceKind::Operator { symbol, .. } => Some(*symbol),
            _ => None,
        }
    }

    /// Region the instance lives in; `None` for the root scope.
    pub fn scope(&self) -> Option<RegionId> {
        self.scope
    }

    pub fn inputs(&self) -> &[Slot] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Slot] {
        &self.outputs
    }

    pub fn is_volatile(&self) -> bool {
        self.volatile
    }

    pub fn is_time_varying(&self) -> bool {
        self.time_varying
    }

    pub fn is_boundary(&self) -> bool {
        !matches!(self.kind, InstanceKind::Operator { .. })
    }

    /// Latest target revision over the instance's outputs.
    pub fn revision(&self) -> Revision {
        self.outputs
            .iter()
            .map(|s| s.flag().target())
            .max()
            .unwrap_or(Revision::ZERO)
    }

    pub fn is_poisoned(&self) -> bool {
        self.outputs.iter().any(|s| s.value().is_poison())
    }
}

// ── Connections ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub source: OutputRef,
    pub target: InputRef,
    pub from_type: TypeHandle,
    pub to_type: TypeHandle,
    pub conversion: Conversion,
}

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("connecting {output} to {input} would create a cycle")]
    CycleDetected { output: OutputRef, input: InputRef },
    #[error("{output} is already connected to {input}")]
    DuplicateConnection { output: OutputRef, input: InputRef },
    #[error("single input {0} is already bound")]
    InputAlreadyBound(InputRef),
    #[error("type mismatch: cannot connect '{from}' to '{to}'")]
    TypeMismatch { from: String, to: String },
    #[error("connection from {output} to {input} crosses a region boundary")]
    CrossesRegionBoundary { output: OutputRef, input: InputRef },
    #[error("unknown instance {0}")]
    UnknownInstance(InstanceId),
    #[error("{instance} has no {side} slot {index}")]
    NoSuchSlot {
        instance: InstanceId,
        side: &'static str,
        index: usize,
    },
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error("no connection from {output} to {input}")]
    NotConnected { output: OutputRef, input: InputRef },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error(transparent)]
    Symbol(#[from] SymbolError),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Region(#[from] RegionError),
    #[error("unknown instance {0}")]
    UnknownInstance(InstanceId),
    #[error("{0} is a region boundary; remove the region instead")]
    BoundaryInstance(InstanceId),
    #[error("type mismatch: {input} expects '{expected}', got a {found} value")]
    ValueMismatch {
        input: InputRef,
        expected: String,
        found: &'static str,
    },
}

/// Outcome of `migrate_instances`.
#[derive(Debug, Default)]
pub struct MigrationReport {
    pub migrated: Vec<InstanceId>,
    /// Connections that could not be re-attached by port name and type.
    pub dropped: Vec<Connection>,
}

// ── Instance graph ──────────────────────────────────────────────────────────

/// The runtime graph. Owns the symbol table so that templates and instances
/// are only ever mutated through this API.
pub struct InstanceGraph {
    ids: IdAllocator,
    types: Arc<TypeRegistry>,
    symbols: SymbolTable,
    instances: BTreeMap<InstanceId, Instance>,
    connections: BTreeMap<ConnectionId, Connection>,
    regions: BTreeMap<RegionId, Region>,
    revisions: RevisionClock,
}

impl InstanceGraph {
    pub fn new(types: Arc<TypeRegistry>, symbols: SymbolTable) -> Self {
        InstanceGraph {
            ids: IdAllocator::new(),
            types,
            symbols,
            instances: BTreeMap::new(),
            connections: BTreeMap::new(),
            regions: BTreeMap::new(),
            revisions: RevisionClock::new(),
        }
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub fn types_arc(&self) -> Arc<TypeRegistry> {
        self.types.clone()
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// Mutable symbol table, for defining new versions and retiring old
    /// ones. Existing instances are unaffected until migrated.
    pub fn symbols_mut(&mut self) -> &mut SymbolTable {
        &mut self.symbols
    }

    pub fn revisions(&self) -> &RevisionClock {
        &self.revisions
    }

    pub fn instance(&self, id: InstanceId) -> Option<&Instance> {
        self.instances.get(&id)
    }

    pub fn instances(&self) -> impl Iterator<Item = (InstanceId, &Instance)> {
        self.instances.iter().map(|(id, inst)| (*id, inst))
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn region(&self, id: RegionId) -> Option<&Region> {
        self.regions.get(&id)
    }

    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.values()
    }

    /// Operator instances placed directly inside `region`.
    pub fn members(&self, region: RegionId) -> Vec<InstanceId> {
        self.instances
            .iter()
            .filter(|(_, inst)| inst.scope == Some(region) && !inst.is_boundary())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn symbol_of(&self, id: InstanceId) -> Option<&Symbol> {
        let symbol = self.instance(id)?.symbol()?;
        self.symbols.get(symbol).ok()
    }

    /// Output slot of an instance by declared name.
    pub fn output(&self, instance: InstanceId, name: &str) -> Option<OutputRef> {
        let index = self
            .instance(instance)?
            .outputs
            .iter()
            .position(|s| s.name == name)?;
        Some(OutputRef::new(instance, index))
    }

    /// Input slot of an instance by declared name.
    pub fn input(&self, instance: InstanceId, name: &str) -> Option<InputRef> {
        let index = self
            .instance(instance)?
            .inputs
            .iter()
            .position(|s| s.name == name)?;
        Some(InputRef::new(instance, index))
    }

    pub fn output_slot(&self, output: OutputRef) -> Option<&Slot> {
        self.instance(output.instance)?.outputs.get(output.index)
    }

    pub fn input_slot(&self, input: InputRef) -> Option<&Slot> {
        self.instance(input.instance)?.inputs.get(input.index)
    }

    /// Current (possibly stale) value of an output slot.
    pub fn value_of(&self, output: OutputRef) -> Option<Value> {
        self.output_slot(output).map(Slot::value)
    }

    pub fn is_dirty(&self, slot: SlotRef) -> bool {
        match slot {
            SlotRef::Input(i) => self.input_slot(i).is_some_and(Slot::is_dirty),
            SlotRef::Output(o) => self.output_slot(o).is_some_and(Slot::is_dirty),
        }
    }

    pub fn is_poisoned(&self, instance: InstanceId) -> bool {
        self.instance(instance).is_some_and(Instance::is_poisoned)
    }

    /// Instances that (transitively) consume any output of `start`.
    ///
    /// A region exit counts as a consumer of its entry, since the region
    /// reads its ports even when no body instance does.
    pub fn downstream_closure(&self, start: InstanceId) -> BTreeSet<InstanceId> {
        let mut seen = BTreeSet::new();
        let mut work = vec![start];
        while let Some(id) = work.pop() {
            let Some(inst) = self.instance(id) else { continue };
            if let InstanceKind::RegionEntry(region) = inst.kind {
                if let Some(r) = self.region(region) {
                    if seen.insert(r.exit) {
                        work.push(r.exit);
                    }
                }
            }
            for slot in &inst.outputs {
                for conn_id in &slot.connections {
                    let target = self.connections[conn_id].target.instance;
                    if seen.insert(target) {
                        work.push(target);
                    }
                }
            }
        }
        seen
    }

    /// Instances that `start` (transitively) consumes from.
    pub fn upstream_closure(&self, start: InstanceId) -> BTreeSet<InstanceId> {
        let mut seen = BTreeSet::new();
        let mut work = vec![start];
        while let Some(id) = work.pop() {
            let Some(inst) = self.instance(id) else { continue };
            for slot in &inst.inputs {
                for conn_id in &slot.connections {
                    let source = self.connections[conn_id].source.instance;
                    if seen.insert(source) {
                        work.push(source);
                    }
                }
            }
        }
        // Region exits depend on their entry through the body even when the
        // body does not read every port.
        let exits: Vec<RegionId> = seen
            .iter()
            .chain(std::iter::once(&start))
            .filter_map(|id| match self.instance(*id)?.kind {
                InstanceKind::RegionExit(r) => Some(r),
                _ => None,
            })
            .collect();
        for region in exits {
            if let Some(r) = self.region(region) {
                if seen.insert(r.entry) {
                    seen.extend(self.upstream_closure(r.entry));
                }
            }
        }
        seen
    }

    // ── Instances ───────────────────────────────────────────────────────

    /// Place a new instance of `symbol` in the root scope.
    pub fn add_instance(&mut self, symbol: SymbolId) -> Result<InstanceId, GraphError> {
        self.add_instance_in(symbol, None)
    }

    /// Place a new instance of `symbol` inside `region` (or the root scope).
    pub fn add_instance_in(
        &mut self,
        symbol: SymbolId,
        region: Option<RegionId>,
    ) -> Result<InstanceId, GraphError> {
        if let Some(r) = region {
            if !self.regions.contains_key(&r) {
                return Err(RegionError::UnknownRegion(r).into());
            }
        }
        let mut instance = self.symbols.instantiate(symbol)?;
        instance.scope = region;
        let id = self.ids.alloc_instance();
        log::debug!(
            "add instance {} of '{}' in {:?}",
            id,
            self.symbols.get(symbol)?.name,
            region
        );
        self.instances.insert(id, instance);
        Ok(id)
    }

    /// Remove an instance and every connection touching it.
    pub fn remove_instance(&mut self, id: InstanceId) -> Result<(), GraphError> {
        let inst = self.instance(id).ok_or(GraphError::UnknownInstance(id))?;
        if inst.is_boundary() {
            return Err(GraphError::BoundaryInstance(id));
        }
        self.remove_instance_unchecked(id);
        self.recompute_volatility();
        Ok(())
    }

    fn remove_instance_unchecked(&mut self, id: InstanceId) {
        let Some(inst) = self.instances.get(&id) else { return };
        let touching: Vec<ConnectionId> = inst
            .inputs
            .iter()
            .chain(inst.outputs.iter())
            .flat_map(|s| s.connections.iter().copied())
            .collect();
        for conn_id in touching {
            self.detach(conn_id);
        }
        self.instances.remove(&id);
        log::debug!("removed instance {}", id);
    }

    /// Set the constant value of an input slot and invalidate it.
    ///
    /// The constant is what the slot yields while it has no connection.
    pub fn set_input_value(&mut self, input: InputRef, value: Value) -> Result<Revision, GraphError> {
        let slot = self
            .input_slot(input)
            .ok_or(ConnectError::NoSuchSlot {
                instance: input.instance,
                side: "input",
                index: input.index,
            })?;
        if !self.types.admits(slot.value_type(), &value) {
            return Err(GraphError::ValueMismatch {
                input,
                expected: self.types.name(slot.value_type()),
                found: value.kind_name(),
            });
        }
        slot.state().value = value;
        self.touch_scope(self.target_scope(input.instance));
        Ok(self.invalidate(SlotRef::Input(input)))
    }

    /// Mark a slot and its downstream closure dirty.
    pub fn invalidate(&self, slot: SlotRef) -> Revision {
        dirty::invalidate(self, slot).0
    }

    // ── Connections ─────────────────────────────────────────────────────

    /// Connect an output slot to an input slot.
    pub fn connect(
        &mut self,
        src: InstanceId,
        src_output: usize,
        dst: InstanceId,
        dst_input: usize,
    ) -> Result<ConnectionId, ConnectError> {
        self.connect_slots(OutputRef::new(src, src_output), InputRef::new(dst, dst_input))
    }

    pub fn connect_slots(&mut self, source: OutputRef, target: InputRef) -> Result<ConnectionId, ConnectError> {
        let src_inst = self
            .instance(source.instance)
            .ok_or(ConnectError::UnknownInstance(source.instance))?;
        let dst_inst = self
            .instance(target.instance)
            .ok_or(ConnectError::UnknownInstance(target.instance))?;
        let src_slot = src_inst.outputs.get(source.index).ok_or(ConnectError::NoSuchSlot {
            instance: source.instance,
            side: "output",
            index: source.index,
        })?;
        let dst_slot = dst_inst.inputs.get(target.index).ok_or(ConnectError::NoSuchSlot {
            instance: target.instance,
            side: "input",
            index: target.index,
        })?;

        if self.source_scope(source.instance) != self.target_scope(target.instance) {
            return Err(ConnectError::CrossesRegionBoundary {
                output: source,
                input: target,
            });
        }

        // Multi-inputs accept elements of the declared type.
        let from_type = src_slot.ty;
        let to_type = dst_slot.ty;
        let conversion = self
            .types
            .conversion(from_type, to_type)
            .map_err(|_| ConnectError::TypeMismatch {
                from: self.types.name(from_type),
                to: self.types.name(to_type),
            })?;

        let duplicate = dst_slot
            .connections
            .iter()
            .any(|c| self.connections[c].source == source);
        if duplicate {
            return Err(ConnectError::DuplicateConnection {
                output: source,
                input: target,
            });
        }
        if !dst_slot.is_multi() && !dst_slot.connections.is_empty() {
            return Err(ConnectError::InputAlreadyBound(target));
        }
        if source.instance == target.instance
            || self.downstream_closure(target.instance).contains(&source.instance)
        {
            return Err(ConnectError::CycleDetected {
                output: source,
                input: target,
            });
        }

        let id = self.ids.alloc_connection();
        self.connections.insert(
            id,
            Connection {
                id,
                source,
                target,
                from_type,
                to_type,
                conversion,
            },
        );
        self.attach(id);
        self.recompute_volatility();
        self.touch_scope(self.target_scope(target.instance));
        self.invalidate(SlotRef::Input(target));
        log::debug!("connect {} -> {} as {}", source, target, id);
        Ok(id)
    }

    /// Remove a connection by ID.
    pub fn disconnect(&mut self, id: ConnectionId) -> Result<Connection, ConnectError> {
        if !self.connections.contains_key(&id) {
            return Err(ConnectError::UnknownConnection(id));
        }
        let conn = self.detach(id);
        self.recompute_volatility();
        log::debug!("disconnect {}", id);
        conn.ok_or(ConnectError::UnknownConnection(id))
    }

    /// Remove the connection between two specific slots.
    pub fn disconnect_slots(&mut self, source: OutputRef, target: InputRef) -> Result<Connection, ConnectError> {
        let id = self
            .connections
            .values()
            .find(|c| c.source == source && c.target == target)
            .map(|c| c.id)
            .ok_or(ConnectError::NotConnected {
                output: source,
                input: target,
            })?;
        self.disconnect(id)
    }

    fn attach(&mut self, id: ConnectionId) {
        let conn = self.connections[&id].clone();
        if let Some(inst) = self.instances.get_mut(&conn.source.instance) {
            inst.outputs[conn.source.index].connections.push(id);
        }
        if let Some(inst) = self.instances.get_mut(&conn.target.instance) {
            inst.inputs[conn.target.index].connections.push(id);
        }
    }

    /// Unlink a connection and invalidate its former target.
    fn detach(&mut self, id: ConnectionId) -> Option<Connection> {
        let conn = self.connections.remove(&id)?;
        if let Some(inst) = self.instances.get_mut(&conn.source.instance) {
            inst.outputs[conn.source.index].connections.retain(|c| *c != id);
        }
        if let Some(inst) = self.instances.get_mut(&conn.target.instance) {
            inst.inputs[conn.target.index].connections.retain(|c| *c != id);
        }
        if self.instances.contains_key(&conn.target.instance) {
            self.touch_scope(self.target_scope(conn.target.instance));
            self.invalidate(SlotRef::Input(conn.target));
        }
        Some(conn)
    }

    /// Scope a value produced by an instance's outputs belongs to.
    fn source_scope(&self, id: InstanceId) -> Option<RegionId> {
        match self.instances.get(&id).map(|i| (&i.kind, i.scope)) {
            Some((InstanceKind::RegionEntry(r), _)) => Some(*r),
            Some((_, scope)) => scope,
            None => None,
        }
    }

    /// Scope an instance's input slots consume from.
    fn target_scope(&self, id: InstanceId) -> Option<RegionId> {
        match self.instances.get(&id).map(|i| (&i.kind, i.scope)) {
            Some((InstanceKind::RegionExit(r), _)) => Some(*r),
            Some((_, scope)) => scope,
            None => None,
        }
    }

    /// Record a body edit on `scope` and every enclosing region.
    fn touch_scope(&self, mut scope: Option<RegionId>) {
        while let Some(id) = scope {
            let Some(region) = self.regions.get(&id) else { break };
            region.touch();
            scope = region.parent();
        }
    }

    /// Recompute which instances depend on a time-varying source.
    fn recompute_volatility(&mut self) {
        fn visit(
            graph: &InstanceGraph,
            id: InstanceId,
            memo: &mut HashMap<InstanceId, bool>,
        ) -> bool {
            if let Some(v) = memo.get(&id) {
                return *v;
            }
            let Some(inst) = graph.instances.get(&id) else {
                return false;
            };
            let mut volatile = inst.time_varying;
            for slot in &inst.inputs {
                for conn_id in &slot.connections {
                    let source = graph.connections[conn_id].source.instance;
                    volatile |= visit(graph, source, memo);
                }
            }
            memo.insert(id, volatile);
            volatile
        }

        let mut memo = HashMap::new();
        let ids: Vec<InstanceId> = self.instances.keys().copied().collect();
        for id in &ids {
            visit(self, *id, &mut memo);
        }
        for (id, inst) in self.instances.iter_mut() {
            inst.volatile = memo.get(id).copied().unwrap_or(false);
        }
    }

    // ── Regions ─────────────────────────────────────────────────────────

    /// Create a region and its entry/exit boundary instances.
    pub fn create_region(&mut self, spec: RegionSpec) -> Result<RegionId, RegionError> {
        spec.validate(&self.types)?;
        if let Some(parent) = spec.parent {
            if !self.regions.contains_key(&parent) {
                return Err(RegionError::UnknownRegion(parent));
            }
        }
        let id = self.ids.alloc_region();
        let entry_id = self.ids.alloc_instance();
        let exit_id = self.ids.alloc_instance();
        let (entry, exit) = spec.boundary_instances(id);
        self.instances.insert(entry_id, entry);
        self.instances.insert(exit_id, exit);
        log::debug!(
            "create region {} ({}) entry {} exit {}",
            id,
            spec.kind.name(),
            entry_id,
            exit_id
        );
        self.regions.insert(id, Region::new(id, spec, entry_id, exit_id));
        Ok(id)
    }

    /// Remove a region, its nested regions and every instance inside it.
    pub fn remove_region(&mut self, id: RegionId) -> Result<(), RegionError> {
        if !self.regions.contains_key(&id) {
            return Err(RegionError::UnknownRegion(id));
        }
        self.remove_region_unchecked(id);
        self.recompute_volatility();
        Ok(())
    }

    fn remove_region_unchecked(&mut self, id: RegionId) {
        let nested: Vec<RegionId> = self
            .regions
            .values()
            .filter(|r| r.parent() == Some(id))
            .map(|r| r.id())
            .collect();
        for child in nested {
            self.remove_region_unchecked(child);
        }
        for member in self.members(id) {
            self.remove_instance_unchecked(member);
        }
        if let Some(region) = self.regions.remove(&id) {
            self.remove_instance_unchecked(region.entry);
            self.remove_instance_unchecked(region.exit);
        }
        log::debug!("removed region {}", id);
    }

    /// Every instance a region owns: body members, nested regions and the
    /// boundary instances of each.
    pub fn region_instances(&self, id: RegionId) -> Vec<InstanceId> {
        let Some(region) = self.regions.get(&id) else {
            return Vec::new();
        };
        let mut owned = vec![region.entry, region.exit];
        owned.extend(self.members(id));
        for nested in self.regions.values().filter(|r| r.parent() == Some(id)) {
            owned.extend(self.region_instances(nested.id()));
        }
        owned
    }

    fn region_or_err(&self, id: RegionId) -> Result<&Region, RegionError> {
        self.regions.get(&id).ok_or(RegionError::UnknownRegion(id))
    }

    /// External input of a border port; upstream instances connect here.
    pub fn region_port_input(&self, region: RegionId, port: usize) -> Result<InputRef, RegionError> {
        let r = self.region_or_err(region)?;
        r.check_port(port)?;
        Ok(InputRef::new(r.entry, port))
    }

    /// Inner-facing output of a border port; body instances read from here.
    pub fn region_port_output(&self, region: RegionId, port: usize) -> Result<OutputRef, RegionError> {
        let r = self.region_or_err(region)?;
        r.check_port(port)?;
        Ok(OutputRef::new(r.entry, port))
    }

    /// Inner-facing input of a region result (all kinds except Conditional).
    pub fn region_result_input(&self, region: RegionId, result: usize) -> Result<InputRef, RegionError> {
        let r = self.region_or_err(region)?;
        if matches!(r.kind(), RegionKind::Conditional { .. }) {
            return Err(RegionError::BranchRequired(region));
        }
        r.check_result(result)?;
        Ok(InputRef::new(r.exit, result))
    }

    /// Inner-facing input of one branch of a Conditional result.
    pub fn region_branch_input(
        &self,
        region: RegionId,
        result: usize,
        branch: Branch,
    ) -> Result<InputRef, RegionError> {
        let r = self.region_or_err(region)?;
        if !matches!(r.kind(), RegionKind::Conditional { .. }) {
            return Err(RegionError::NotConditional(region));
        }
        r.check_result(result)?;
        Ok(InputRef::new(r.exit, r.branch_slot(result, branch)))
    }

    /// External output of a region result; downstream instances read here.
    pub fn region_output(&self, region: RegionId, result: usize) -> Result<OutputRef, RegionError> {
        let r = self.region_or_err(region)?;
        r.check_result(result)?;
        Ok(OutputRef::new(r.exit, result))
    }

    // ── Migration ───────────────────────────────────────────────────────

    /// Rebuild every instance of `old` as an instance of `new`.
    ///
    /// Connections are re-attached by port name when the types still
    /// connect; the rest are dropped and reported. Constant input values are
    /// carried over by name when the slot type is unchanged.
    pub fn migrate_instances(&mut self, old: SymbolId, new: SymbolId) -> Result<MigrationReport, GraphError> {
        self.symbols.get(old)?;
        let new_symbol = self.symbols.get(new)?;
        if new_symbol.is_retired() {
            return Err(SymbolError::RetiredSymbol(new_symbol.name.clone()).into());
        }

        let targets: Vec<InstanceId> = self
            .instances
            .iter()
            .filter(|(_, inst)| inst.symbol() == Some(old))
            .map(|(id, _)| *id)
            .collect();

        // Plan everything before touching the graph.
        let mut replacements = Vec::new();
        let mut rewired: HashMap<ConnectionId, Connection> = HashMap::new();
        let mut dropped = Vec::new();
        let migrating: HashSet<InstanceId> = targets.iter().copied().collect();
        for id in &targets {
            let inst = &self.instances[id];
            let mut fresh = Instance::from_symbol(new_symbol);
            fresh.scope = inst.scope;
            for (old_slot, new_slot) in inst.inputs.iter().filter_map(|s| {
                let i = new_symbol.input_index(&s.name)?;
                Some((s, i))
            }) {
                let slot = &fresh.inputs[new_slot];
                if slot.ty == old_slot.ty {
                    slot.state().value = old_slot.state().value.clone();
                }
            }
            replacements.push((*id, fresh));
        }

        for conn in self.connections.values() {
            let touches_source = migrating.contains(&conn.source.instance);
            let touches_target = migrating.contains(&conn.target.instance);
            if !touches_source && !touches_target {
                continue;
            }
            let mut next = conn.clone();
            let mut ok = true;
            if touches_source {
                let name = &self.instances[&conn.source.instance].outputs[conn.source.index].name;
                match new_symbol.output_index(name) {
                    Some(i) => {
                        next.source.index = i;
                        next.from_type = new_symbol.outputs[i].ty;
                    }
                    None => ok = false,
                }
            }
            if touches_target && ok {
                let name = &self.instances[&conn.target.instance].inputs[conn.target.index].name;
                match new_symbol.input_index(name) {
                    Some(i) => {
                        next.target.index = i;
                        next.to_type = new_symbol.inputs[i].ty;
                    }
                    None => ok = false,
                }
            }
            if ok {
                match self.types.conversion(next.from_type, next.to_type) {
                    Ok(conversion) => next.conversion = conversion,
                    Err(_) => ok = false,
                }
            }
            if ok {
                rewired.insert(conn.id, next);
            } else {
                dropped.push(conn.clone());
            }
        }

        // Apply.
        for conn in &dropped {
            self.detach(conn.id);
        }
        for conn_id in rewired.keys() {
            self.detach(*conn_id);
        }
        for (id, fresh) in replacements {
            self.instances.insert(id, fresh);
        }
        let mut order: Vec<ConnectionId> = rewired.keys().copied().collect();
        order.sort();
        for conn_id in order {
            if let Some(conn) = rewired.remove(&conn_id) {
                self.connections.insert(conn_id, conn);
                self.attach(conn_id);
            }
        }
        self.recompute_volatility();
        for id in &targets {
            self.touch_scope(self.instances[id].scope);
            let outputs = self.instances[id].outputs.len();
            for index in 0..outputs {
                self.invalidate(SlotRef::Output(OutputRef::new(*id, index)));
            }
        }
        log::debug!(
            "migrated {} instances from {} to {}, dropped {} connections",
            targets.len(),
            old,
            new,
            dropped.len()
        );
        Ok(MigrationReport {
            migrated: targets,
            dropped,
        })
    }
}

impl fmt::Display for InstanceGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "InstanceGraph ({} instances, {} connections, {} regions)",
            self.instances.len(),
            self.connections.len(),
            self.regions.len()
        )?;
        for (id, inst) in &self.instances {
            let label = match &inst.kind {
                InstanceKind::Operator { symbol, .. } => self
                    .symbols
                    .get(*symbol)
                    .map(|s| s.name.clone())
                    .unwrap_or_else(|_| symbol.to_string()),
                InstanceKind::RegionEntry(r) => format!("{}.entry", r),
                InstanceKind::RegionExit(r) => format!("{}.exit", r),
            };
            let scope = inst.scope.map(|r| format!(" in {}", r)).unwrap_or_default();
            writeln!(f, "  {} {}{}", id, label, scope)?;
        }
        for conn in self.connections.values() {
            writeln!(f, "  {}: {} -> {}", conn.id, conn.source, conn.target)?;
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{PortSpec, ResultSpec};
    use crate::symbol::SymbolDef;

    struct Fixture {
        graph: InstanceGraph,
        float: TypeHandle,
        constant: SymbolId,
        add: SymbolId,
        sum: SymbolId,
        text_sink: SymbolId,
    }

    fn fixture() -> Fixture {
        let mut types = TypeRegistry::new();
        let float = types.register_type("Float").unwrap();
        let text = types.register_type("Text").unwrap();
        let mut symbols = SymbolTable::new();
        let constant = symbols
            .define(
                SymbolDef::new("Constant")
                    .input("value", float, 0.0)
                    .output("out", float)
                    .compute(|inputs, _| Ok(vec![inputs[0].clone()])),
            )
            .unwrap();
        let add = symbols
            .define(
                SymbolDef::new("Add")
                    .input("a", float, 0.0)
                    .input("b", float, 0.0)
                    .output("out", float)
                    .compute(|inputs, _| Ok(vec![inputs[0].clone()])),
            )
            .unwrap();
        let sum = symbols
            .define(
                SymbolDef::new("Sum")
                    .multi_input("items", float)
                    .output("out", float)
                    .compute(|_, _| Ok(vec![Value::Float(0.0)])),
            )
            .unwrap();
        let text_sink = symbols
            .define(
                SymbolDef::new("Print")
                    .input("text", text, "")
                    .compute(|_, _| Ok(vec![])),
            )
            .unwrap();
        types.bind_value_kind(float, "float").unwrap();
        types.bind_value_kind(text, "text").unwrap();
        Fixture {
            graph: InstanceGraph::new(Arc::new(types), symbols),
            float,
            constant,
            add,
            sum,
            text_sink,
        }
    }

    #[test]
    fn add_and_connect() {
        let mut fx = fixture();
        let a = fx.graph.add_instance(fx.constant).unwrap();
        let b = fx.graph.add_instance(fx.add).unwrap();
        let conn = fx.graph.connect(a, 0, b, 0).unwrap();
        assert_eq!(fx.graph.connection_count(), 1);
        assert_eq!(fx.graph.connection(conn).unwrap().target, InputRef::new(b, 0));
        assert_eq!(fx.graph.input_slot(InputRef::new(b, 0)).unwrap().connections(), &[conn]);
    }

    #[test]
    fn cycle_rejected_and_graph_unchanged() {
        let mut fx = fixture();
        let a = fx.graph.add_instance(fx.add).unwrap();
        let b = fx.graph.add_instance(fx.add).unwrap();
        fx.graph.connect(a, 0, b, 0).unwrap();
        let before = fx.graph.to_string();
        let err = fx.graph.connect(b, 0, a, 0).unwrap_err();
        assert!(matches!(err, ConnectError::CycleDetected { .. }));
        assert_eq!(fx.graph.to_string(), before);
    }

    #[test]
    fn self_loop_rejected() {
        let mut fx = fixture();
        let a = fx.graph.add_instance(fx.add).unwrap();
        assert!(matches!(
            fx.graph.connect(a, 0, a, 1),
            Err(ConnectError::CycleDetected { .. })
        ));
    }

    #[test]
    fn single_input_binds_once() {
        let mut fx = fixture();
        let a = fx.graph.add_instance(fx.constant).unwrap();
        let b = fx.graph.add_instance(fx.constant).unwrap();
        let add = fx.graph.add_instance(fx.add).unwrap();
        fx.graph.connect(a, 0, add, 0).unwrap();
        assert_eq!(
            fx.graph.connect(b, 0, add, 0).unwrap_err(),
            ConnectError::InputAlreadyBound(InputRef::new(add, 0))
        );
        assert_eq!(
            fx.graph.connect(a, 0, add, 0).unwrap_err(),
            ConnectError::DuplicateConnection {
                output: OutputRef::new(a, 0),
                input: InputRef::new(add, 0)
            }
        );
    }

    #[test]
    fn multi_input_keeps_insertion_order() {
        let mut fx = fixture();
        let sources: Vec<InstanceId> = (0..3).map(|_| fx.graph.add_instance(fx.constant).unwrap()).collect();
        let sum = fx.graph.add_instance(fx.sum).unwrap();
        let conns: Vec<ConnectionId> = sources
            .iter()
            .map(|s| fx.graph.connect(*s, 0, sum, 0).unwrap())
            .collect();
        fx.graph.disconnect(conns[1]).unwrap();
        let slot = fx.graph.input_slot(InputRef::new(sum, 0)).unwrap();
        assert_eq!(slot.connections(), &[conns[0], conns[2]]);
        assert_eq!(slot.value_type(), fx.float.sequence());
    }

    #[test]
    fn type_mismatch_rejected() {
        let mut fx = fixture();
        let a = fx.graph.add_instance(fx.constant).unwrap();
        let sink = fx.graph.add_instance(fx.text_sink).unwrap();
        assert_eq!(
            fx.graph.connect(a, 0, sink, 0).unwrap_err(),
            ConnectError::TypeMismatch {
                from: "Float".into(),
                to: "Text".into()
            }
        );
    }

    #[test]
    fn unknown_slots_rejected() {
        let mut fx = fixture();
        let a = fx.graph.add_instance(fx.constant).unwrap();
        assert!(matches!(
            fx.graph.connect(a, 3, a, 0),
            Err(ConnectError::NoSuchSlot { side: "output", .. })
        ));
        assert!(matches!(
            fx.graph.connect(a, 0, InstanceId(99), 0),
            Err(ConnectError::UnknownInstance(InstanceId(99)))
        ));
    }

    #[test]
    fn remove_instance_cascades() {
        let mut fx = fixture();
        let a = fx.graph.add_instance(fx.constant).unwrap();
        let b = fx.graph.add_instance(fx.add).unwrap();
        let c = fx.graph.add_instance(fx.add).unwrap();
        fx.graph.connect(a, 0, b, 0).unwrap();
        fx.graph.connect(b, 0, c, 0).unwrap();
        fx.graph.remove_instance(b).unwrap();
        assert_eq!(fx.graph.connection_count(), 0);
        assert!(fx.graph.instance(b).is_none());
        assert!(fx.graph.input_slot(InputRef::new(c, 0)).unwrap().connections().is_empty());
        assert!(fx.graph.output_slot(OutputRef::new(a, 0)).unwrap().connections().is_empty());
    }

    #[test]
    fn connect_marks_target_dirty() {
        let mut fx = fixture();
        let a = fx.graph.add_instance(fx.constant).unwrap();
        let b = fx.graph.add_instance(fx.add).unwrap();
        {
            let slot = fx.graph.input_slot(InputRef::new(b, 0)).unwrap();
            slot.state().flag.clear();
            let out = fx.graph.output_slot(OutputRef::new(b, 0)).unwrap();
            out.state().flag.clear();
        }
        assert!(!fx.graph.is_dirty(SlotRef::Input(InputRef::new(b, 0))));
        fx.graph.connect(a, 0, b, 0).unwrap();
        assert!(fx.graph.is_dirty(SlotRef::Input(InputRef::new(b, 0))));
        assert!(fx.graph.is_dirty(SlotRef::Output(OutputRef::new(b, 0))));
    }

    #[test]
    fn connections_cannot_cross_region_borders() {
        let mut fx = fixture();
        let float = fx.float;
        let region = fx
            .graph
            .create_region(RegionSpec::for_each(
                vec![PortSpec::splice("xs", float)],
                vec![ResultSpec::collect("ys", float)],
            ))
            .unwrap();
        let outside = fx.graph.add_instance(fx.constant).unwrap();
        let inside = fx.graph.add_instance_in(fx.add, Some(region)).unwrap();
        assert!(matches!(
            fx.graph.connect(outside, 0, inside, 0),
            Err(ConnectError::CrossesRegionBoundary { .. })
        ));
        assert!(matches!(
            fx.graph.connect(inside, 0, outside, 0),
            Err(ConnectError::CrossesRegionBoundary { .. })
        ));

        // Through the border ports it is fine.
        let port_out = fx.graph.region_port_output(region, 0).unwrap();
        fx.graph.connect_slots(port_out, InputRef::new(inside, 0)).unwrap();
        let result_in = fx.graph.region_result_input(region, 0).unwrap();
        fx.graph.connect_slots(OutputRef::new(inside, 0), result_in).unwrap();
        assert_eq!(fx.graph.members(region), vec![inside]);
    }

    #[test]
    fn remove_region_cascades_to_members() {
        let mut fx = fixture();
        let float = fx.float;
        let region = fx
            .graph
            .create_region(RegionSpec::for_each(
                vec![PortSpec::splice("xs", float)],
                vec![ResultSpec::collect("ys", float)],
            ))
            .unwrap();
        let inside = fx.graph.add_instance_in(fx.add, Some(region)).unwrap();
        let entry = fx.graph.region(region).unwrap().entry;
        assert_eq!(
            fx.graph.remove_instance(entry).unwrap_err(),
            GraphError::BoundaryInstance(entry)
        );
        fx.graph.remove_region(region).unwrap();
        assert!(fx.graph.instance(inside).is_none());
        assert!(fx.graph.instance(entry).is_none());
        assert_eq!(fx.graph.instance_count(), 0);
    }

    #[test]
    fn set_input_value_invalidates_downstream() {
        let mut fx = fixture();
        let a = fx.graph.add_instance(fx.constant).unwrap();
        let b = fx.graph.add_instance(fx.add).unwrap();
        fx.graph.connect(a, 0, b, 0).unwrap();
        let before = fx.graph.revisions().current();
        let rev = fx.graph.set_input_value(InputRef::new(a, 0), Value::Float(2.0)).unwrap();
        assert!(rev > before);
        let out = fx.graph.output_slot(OutputRef::new(b, 0)).unwrap();
        assert_eq!(out.flag().target(), rev);
        assert_eq!(fx.graph.input_slot(InputRef::new(a, 0)).unwrap().value(), Value::Float(2.0));
    }

    #[test]
    fn set_input_value_checks_the_slot_type() {
        let mut fx = fixture();
        let a = fx.graph.add_instance(fx.constant).unwrap();
        let sum = fx.graph.add_instance(fx.sum).unwrap();
        let input = InputRef::new(a, 0);
        let err = fx.graph.set_input_value(input, Value::from("3")).unwrap_err();
        assert_eq!(
            err,
            GraphError::ValueMismatch {
                input,
                expected: "Float".into(),
                found: "text",
            }
        );
        assert_eq!(fx.graph.input_slot(input).unwrap().value(), Value::Float(0.0));

        // Multi-inputs hold a sequence of their element type.
        let items = InputRef::new(sum, 0);
        fx.graph.set_input_value(items, Value::from(vec![1.0, 2.0])).unwrap();
        assert!(fx.graph.set_input_value(items, Value::Float(1.0)).is_err());
    }

    #[test]
    fn feedback_into_a_region_that_ignores_its_port_is_a_cycle() {
        let mut fx = fixture();
        let float = fx.float;
        let region = fx
            .graph
            .create_region(RegionSpec::cache_boundary(
                vec![PortSpec::pass("x", float)],
                vec![ResultSpec::collect("y", float)],
            ))
            .unwrap();
        let body = fx.graph.add_instance_in(fx.constant, Some(region)).unwrap();
        let result_in = fx.graph.region_result_input(region, 0).unwrap();
        fx.graph.connect_slots(OutputRef::new(body, 0), result_in).unwrap();

        let after = fx.graph.add_instance(fx.add).unwrap();
        let region_out = fx.graph.region_output(region, 0).unwrap();
        fx.graph.connect_slots(region_out, InputRef::new(after, 0)).unwrap();
        let port_in = fx.graph.region_port_input(region, 0).unwrap();
        let entry = fx.graph.region(region).unwrap().entry;
        let exit = fx.graph.region(region).unwrap().exit;
        assert!(fx.graph.downstream_closure(entry).contains(&exit));

        let before = fx.graph.connection_count();
        assert!(matches!(
            fx.graph.connect_slots(OutputRef::new(after, 0), port_in),
            Err(ConnectError::CycleDetected { .. })
        ));
        assert_eq!(fx.graph.connection_count(), before);
    }

    #[test]
    fn region_instances_cover_nested_regions() {
        let mut fx = fixture();
        let float = fx.float;
        let outer = fx
            .graph
            .create_region(RegionSpec::for_each(
                vec![PortSpec::splice("xs", float)],
                vec![ResultSpec::collect("ys", float)],
            ))
            .unwrap();
        let inner = fx
            .graph
            .create_region(RegionSpec::cache_boundary(vec![], vec![]).inside(outer))
            .unwrap();
        let a = fx.graph.add_instance_in(fx.constant, Some(outer)).unwrap();
        let b = fx.graph.add_instance_in(fx.constant, Some(inner)).unwrap();
        let owned: BTreeSet<InstanceId> = fx.graph.region_instances(outer).into_iter().collect();
        let inner_region = fx.graph.region(inner).unwrap();
        let outer_region = fx.graph.region(outer).unwrap();
        assert_eq!(
            owned,
            BTreeSet::from([
                outer_region.entry,
                outer_region.exit,
                inner_region.entry,
                inner_region.exit,
                a,
                b
            ])
        );
        assert!(fx.graph.region_instances(RegionId(99)).is_empty());
    }

    #[test]
    fn migration_rewires_by_name() {
        let mut fx = fixture();
        let float = fx.float;
        let a = fx.graph.add_instance(fx.constant).unwrap();
        let add = fx.graph.add_instance(fx.add).unwrap();
        fx.graph.connect(a, 0, add, 0).unwrap();
        fx.graph.connect(a, 0, add, 1).unwrap();

        // v2 swaps the input order and drops `b`.
        let v2 = fx
            .graph
            .symbols_mut()
            .define_version(
                SymbolDef::new("Add")
                    .input("bias", float, 1.0)
                    .input("a", float, 0.0)
                    .output("out", float)
                    .compute(|inputs, _| Ok(vec![inputs[1].clone()])),
            )
            .unwrap();
        fx.graph.symbols_mut().retire(fx.add).unwrap();
        let report = fx.graph.migrate_instances(fx.add, v2).unwrap();
        assert_eq!(report.migrated, vec![add]);
        assert_eq!(report.dropped.len(), 1);
        assert_eq!(report.dropped[0].target, InputRef::new(add, 1));

        let inst = fx.graph.instance(add).unwrap();
        assert_eq!(inst.symbol(), Some(v2));
        assert_eq!(inst.inputs()[1].connections().len(), 1);
        assert!(inst.inputs()[0].connections().is_empty());
        assert_eq!(fx.graph.connection_count(), 1);
    }

    #[test]
    fn closures_follow_connections() {
        let mut fx = fixture();
        let a = fx.graph.add_instance(fx.constant).unwrap();
        let b = fx.graph.add_instance(fx.add).unwrap();
        let c = fx.graph.add_instance(fx.add).unwrap();
        let d = fx.graph.add_instance(fx.constant).unwrap();
        fx.graph.connect(a, 0, b, 0).unwrap();
        fx.graph.connect(b, 0, c, 0).unwrap();
        assert_eq!(fx.graph.downstream_closure(a), BTreeSet::from([b, c]));
        assert_eq!(fx.graph.upstream_closure(c), BTreeSet::from([a, b]));
        assert!(fx.graph.downstream_closure(d).is_empty());
    }
}

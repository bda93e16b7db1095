// region.rs — Regions: explicit iteration, branching and cache boundaries
//
// A region is a subgraph with border ports. It materializes as two boundary
// instances: the entry (external inputs feeding inner-facing outputs, one per
// port) and the exit (inner-facing inputs feeding external outputs, one per
// result). Body instances read ports through the entry's outputs; the values
// behind those outputs are bound per iteration in the evaluation context.
//
// Preconditions: specs pass `RegionSpec::validate` before the boundary
//   instances are built.
// Postconditions: iterations run in index order, each under its own call
//   context frame; the unselected branch of a Conditional is never pulled.
// Failure modes: `RegionError` on invalid specs. Runtime faults (splicer not
//   a sequence, guard not a bool) poison the region outputs.
// Side effects: CacheBoundary regions keep one snapshot per call context.
//   An iterating region that runs fewer iterations than last time evicts
//   the cache entries and snapshots of the iterations it no longer has.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

use crate::context::{CallContext, EvaluationContext};
use crate::diag::{codes, DiagCode, Diagnostic};
use crate::graph::{Instance, InstanceKind, Slot};
use crate::id::{InstanceId, RegionId};
use crate::schedule::{EvaluationError, Scheduler};
use crate::symbol::Arity;
use crate::types::{TypeHandle, TypeRegistry};
use crate::value::Value;

// ── Specs ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// One iteration per element of the shortest splicer.
    ForEach,
    /// A declared number of iterations.
    Repeat { count: u32, cycle: bool },
    /// Pulls the `then` or `else` side of each result, chosen by the Bool
    /// port at index `guard`.
    Conditional { guard: usize },
    /// Returns the previous outputs while the border inputs are unchanged.
    CacheBoundary,
}

impl RegionKind {
    pub fn name(&self) -> &'static str {
        match self {
            RegionKind::ForEach => "foreach",
            RegionKind::Repeat { .. } => "repeat",
            RegionKind::Conditional { .. } => "conditional",
            RegionKind::CacheBoundary => "cache_boundary",
        }
    }

    pub fn iterates(&self) -> bool {
        matches!(self, RegionKind::ForEach | RegionKind::Repeat { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortMode {
    /// External `[T]`, element `i` bound in iteration `i`.
    Splice,
    /// Same value in every iteration.
    Pass,
    /// Initial value in iteration 0, the previous iteration's result after.
    Accumulator,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PortSpec {
    pub name: String,
    pub ty: TypeHandle,
    pub mode: PortMode,
    /// Value the port yields while its external input is unconnected.
    pub initial: Value,
}

impl PortSpec {
    pub fn splice(name: &str, ty: TypeHandle) -> Self {
        Self {
            name: name.to_string(),
            ty,
            mode: PortMode::Splice,
            initial: Value::List(Vec::new()),
        }
    }

    pub fn pass(name: &str, ty: TypeHandle) -> Self {
        Self {
            name: name.to_string(),
            ty,
            mode: PortMode::Pass,
            initial: Value::Unit,
        }
    }

    pub fn accumulator(name: &str, ty: TypeHandle, initial: impl Into<Value>) -> Self {
        Self {
            name: name.to_string(),
            ty,
            mode: PortMode::Accumulator,
            initial: initial.into(),
        }
    }

    pub fn with_initial(mut self, initial: impl Into<Value>) -> Self {
        self.initial = initial.into();
        self
    }

    /// Type of the external input slot on the entry.
    pub fn external_type(&self) -> TypeHandle {
        match self.mode {
            PortMode::Splice => self.ty.sequence(),
            PortMode::Pass | PortMode::Accumulator => self.ty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultMode {
    /// Iterating regions collect one value per iteration into `[T]`; the
    /// other kinds pass the value through.
    Collect,
    /// Feeds back into the accumulator port with this index; the region
    /// output is the final value.
    Accumulate(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultSpec {
    pub name: String,
    pub ty: TypeHandle,
    pub mode: ResultMode,
}

impl ResultSpec {
    pub fn collect(name: &str, ty: TypeHandle) -> Self {
        Self {
            name: name.to_string(),
            ty,
            mode: ResultMode::Collect,
        }
    }

    pub fn accumulate(name: &str, ty: TypeHandle, port: usize) -> Self {
        Self {
            name: name.to_string(),
            ty,
            mode: ResultMode::Accumulate(port),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    Then,
    Else,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegionSpec {
    pub kind: RegionKind,
    pub ports: Vec<PortSpec>,
    pub results: Vec<ResultSpec>,
    pub parent: Option<RegionId>,
}

impl RegionSpec {
    pub fn new(kind: RegionKind, ports: Vec<PortSpec>, results: Vec<ResultSpec>) -> Self {
        Self {
            kind,
            ports,
            results,
            parent: None,
        }
    }

    pub fn for_each(ports: Vec<PortSpec>, results: Vec<ResultSpec>) -> Self {
        Self::new(RegionKind::ForEach, ports, results)
    }

    pub fn repeat(count: u32, ports: Vec<PortSpec>, results: Vec<ResultSpec>) -> Self {
        Self::new(RegionKind::Repeat { count, cycle: false }, ports, results)
    }

    pub fn conditional(guard: usize, ports: Vec<PortSpec>, results: Vec<ResultSpec>) -> Self {
        Self::new(RegionKind::Conditional { guard }, ports, results)
    }

    pub fn cache_boundary(ports: Vec<PortSpec>, results: Vec<ResultSpec>) -> Self {
        Self::new(RegionKind::CacheBoundary, ports, results)
    }

    /// Index splicers modulo their length instead of truncating (Repeat).
    pub fn cycling(mut self) -> Self {
        if let RegionKind::Repeat { count, .. } = self.kind {
            self.kind = RegionKind::Repeat { count, cycle: true };
        }
        self
    }

    /// Nest the region inside `parent`.
    pub fn inside(mut self, parent: RegionId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn validate(&self, types: &TypeRegistry) -> Result<(), RegionError> {
        for port in &self.ports {
            if !types.contains(port.ty) {
                return Err(RegionError::UnknownType(port.name.clone()));
            }
            if port.mode != PortMode::Pass && !self.kind.iterates() {
                return Err(RegionError::PortNotAllowed {
                    port: port.name.clone(),
                    kind: self.kind.name(),
                });
            }
        }
        if self.kind == RegionKind::ForEach && !self.ports.iter().any(|p| p.mode == PortMode::Splice) {
            return Err(RegionError::MissingSplicer);
        }
        if let RegionKind::Conditional { guard } = self.kind {
            match self.ports.get(guard) {
                Some(p) if p.mode == PortMode::Pass => {}
                _ => return Err(RegionError::BadGuard(guard)),
            }
        }
        for result in &self.results {
            if !types.contains(result.ty) {
                return Err(RegionError::UnknownType(result.name.clone()));
            }
            if let ResultMode::Accumulate(port) = result.mode {
                let ok = self.kind.iterates()
                    && self
                        .ports
                        .get(port)
                        .is_some_and(|p| p.mode == PortMode::Accumulator && p.ty == result.ty);
                if !ok {
                    return Err(RegionError::BadAccumulator {
                        result: result.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Build the entry and exit instances for region `id`.
    pub(crate) fn boundary_instances(&self, id: RegionId) -> (Instance, Instance) {
        let entry_inputs = self
            .ports
            .iter()
            .map(|p| Slot::new(&p.name, p.external_type(), Arity::Single, p.initial.clone(), false))
            .collect();
        let entry_outputs = self
            .ports
            .iter()
            .map(|p| Slot::new(&p.name, p.ty, Arity::Single, Value::Unit, false))
            .collect();

        let mut exit_inputs = Vec::new();
        for r in &self.results {
            if matches!(self.kind, RegionKind::Conditional { .. }) {
                exit_inputs.push(Slot::new(&format!("{}.then", r.name), r.ty, Arity::Single, Value::Unit, false));
                exit_inputs.push(Slot::new(&format!("{}.else", r.name), r.ty, Arity::Single, Value::Unit, false));
            } else {
                exit_inputs.push(Slot::new(&r.name, r.ty, Arity::Single, Value::Unit, false));
            }
        }
        let exit_outputs = self
            .results
            .iter()
            .map(|r| {
                let ty = match r.mode {
                    ResultMode::Collect if self.kind.iterates() => r.ty.sequence(),
                    _ => r.ty,
                };
                Slot::new(&r.name, ty, Arity::Single, Value::Unit, false)
            })
            .collect();

        (
            Instance::boundary(InstanceKind::RegionEntry(id), self.parent, entry_inputs, entry_outputs),
            Instance::boundary(InstanceKind::RegionExit(id), self.parent, exit_inputs, exit_outputs),
        )
    }
}

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegionError {
    #[error("a foreach region needs at least one splicer port")]
    MissingSplicer,
    #[error("port '{port}' is not allowed in a {kind} region")]
    PortNotAllowed { port: String, kind: &'static str },
    #[error("result '{result}' does not match an accumulator port")]
    BadAccumulator { result: String },
    #[error("guard port {0} must be a pass-through port")]
    BadGuard(usize),
    #[error("unknown region {0}")]
    UnknownRegion(RegionId),
    #[error("unknown type on region port or result '{0}'")]
    UnknownType(String),
    #[error("region {0} is conditional; address a branch")]
    BranchRequired(RegionId),
    #[error("region {0} is not conditional")]
    NotConditional(RegionId),
    #[error("region {region} has no port {index}")]
    NoSuchPort { region: RegionId, index: usize },
    #[error("region {region} has no result {index}")]
    NoSuchResult { region: RegionId, index: usize },
}

// ── Region ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Snapshot {
    inputs: Vec<Value>,
    outputs: Vec<Value>,
    edits: u64,
}

/// A region placed in the graph.
#[derive(Debug)]
pub struct Region {
    id: RegionId,
    spec: RegionSpec,
    pub entry: InstanceId,
    pub exit: InstanceId,
    /// Bumped by every edit inside the body, nested regions included.
    edits: AtomicU64,
    /// Iteration count of the most recent run.
    extent: AtomicU32,
    snapshots: Mutex<HashMap<CallContext, Snapshot>>,
}

impl Region {
    pub(crate) fn new(id: RegionId, spec: RegionSpec, entry: InstanceId, exit: InstanceId) -> Self {
        Region {
            id,
            spec,
            entry,
            exit,
            edits: AtomicU64::new(0),
            extent: AtomicU32::new(0),
            snapshots: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> RegionId {
        self.id
    }

    pub fn kind(&self) -> RegionKind {
        self.spec.kind
    }

    pub fn spec(&self) -> &RegionSpec {
        &self.spec
    }

    pub fn parent(&self) -> Option<RegionId> {
        self.spec.parent
    }

    pub fn ports(&self) -> &[PortSpec] {
        &self.spec.ports
    }

    pub fn results(&self) -> &[ResultSpec] {
        &self.spec.results
    }

    pub(crate) fn check_port(&self, index: usize) -> Result<(), RegionError> {
        if index < self.spec.ports.len() {
            Ok(())
        } else {
            Err(RegionError::NoSuchPort {
                region: self.id,
                index,
            })
        }
    }

    pub(crate) fn check_result(&self, index: usize) -> Result<(), RegionError> {
        if index < self.spec.results.len() {
            Ok(())
        } else {
            Err(RegionError::NoSuchResult {
                region: self.id,
                index,
            })
        }
    }

    /// Exit input index of one branch of a Conditional result.
    pub(crate) fn branch_slot(&self, result: usize, branch: Branch) -> usize {
        match branch {
            Branch::Then => 2 * result,
            Branch::Else => 2 * result + 1,
        }
    }

    pub(crate) fn touch(&self) {
        self.edits.fetch_add(1, Ordering::AcqRel);
    }

    fn edit_count(&self) -> u64 {
        self.edits.load(Ordering::Acquire)
    }

    /// Number of stored CacheBoundary snapshots.
    pub fn snapshot_count(&self) -> usize {
        self.snapshots.lock().len()
    }

    /// Drop the snapshots taken under any context matching `stale`.
    pub(crate) fn prune_snapshots(&self, stale: impl Fn(&CallContext) -> bool) -> usize {
        let mut snapshots = self.snapshots.lock();
        let before = snapshots.len();
        snapshots.retain(|context, _| !stale(context));
        before - snapshots.len()
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({} ports, {} results)",
            self.id,
            self.spec.kind.name(),
            self.spec.ports.len(),
            self.spec.results.len()
        )
    }
}

// ── Evaluation ──────────────────────────────────────────────────────────────

impl Scheduler<'_> {
    /// Evaluate a region exit: bind the border ports, run the body the way
    /// the region kind dictates and commit the exit outputs.
    pub(crate) fn evaluate_exit(
        &self,
        region_id: RegionId,
        exit_id: InstanceId,
        ctx: &EvaluationContext,
    ) -> Result<Vec<Value>, EvaluationError> {
        let graph = self.graph();
        let region = graph
            .region(region_id)
            .ok_or(EvaluationError::UnknownRegion(region_id))?;
        let exit = graph
            .instance(exit_id)
            .ok_or(EvaluationError::UnknownRegion(region_id))?;
        if self.is_fresh(exit, ctx, exit.is_volatile()) {
            self.note_reuse();
            return Ok(exit.outputs().iter().map(Slot::value).collect());
        }
        let entry = graph
            .instance(region.entry)
            .ok_or(EvaluationError::UnknownRegion(region_id))?;

        let mut ports = Vec::with_capacity(entry.inputs().len());
        for slot in entry.inputs() {
            ports.push(self.gather_input(region.entry, slot, ctx)?);
        }

        let outputs = match ports.iter().find_map(Value::find_poison) {
            Some(poison) => vec![Value::Error(poison.clone()); exit.outputs().len()],
            None => match region.kind() {
                RegionKind::ForEach | RegionKind::Repeat { .. } => self.iterate(region, exit_id, &ports, ctx)?,
                RegionKind::Conditional { guard } => self.branch(region, exit_id, guard, &ports, ctx)?,
                RegionKind::CacheBoundary => self.cache_boundary(region, exit_id, &ports, ctx)?,
            },
        };

        self.commit_boundary(entry, ctx);
        self.commit(exit, &outputs, ctx);
        Ok(outputs)
    }

    fn iterate(
        &self,
        region: &Region,
        exit_id: InstanceId,
        ports: &[Value],
        ctx: &EvaluationContext,
    ) -> Result<Vec<Value>, EvaluationError> {
        let specs = region.ports();
        let mut splices: Vec<(usize, &[Value])> = Vec::new();
        for (index, spec) in specs.iter().enumerate() {
            if spec.mode != PortMode::Splice {
                continue;
            }
            match ports[index].as_list() {
                Some(items) => splices.push((index, items)),
                None => {
                    let message = format!(
                        "splicer '{}' expects a sequence, got {}",
                        spec.name,
                        ports[index].kind_name()
                    );
                    return Ok(self.region_fault(region, exit_id, codes::E0200, message));
                }
            }
        }

        let shortest = splices.iter().map(|(_, items)| items.len()).min();
        let count = match region.kind() {
            RegionKind::Repeat { count, cycle } => match shortest {
                Some(0) => 0,
                Some(n) if !cycle => n.min(count as usize),
                _ => count as usize,
            },
            _ => shortest.unwrap_or(0),
        };

        // Accumulators start from their port value.
        let mut accumulators: Vec<Value> = ports.to_vec();
        let results = region.results();
        let mut collected: Vec<Vec<Value>> = results.iter().map(|_| Vec::with_capacity(count)).collect();
        let exit = self
            .graph()
            .instance(exit_id)
            .ok_or(EvaluationError::UnknownRegion(region.id()))?;

        log::trace!("{}: {} iterations", region, count);
        for i in 0..count {
            ctx.checkpoint()?;
            let bindings: Vec<Value> = specs
                .iter()
                .enumerate()
                .map(|(index, spec)| match spec.mode {
                    PortMode::Splice => splices
                        .iter()
                        .find(|(p, _)| *p == index)
                        .map(|(_, items)| items[i % items.len()].clone())
                        .unwrap_or_default(),
                    PortMode::Pass => ports[index].clone(),
                    PortMode::Accumulator => accumulators[index].clone(),
                })
                .collect();
            let inner = ctx.enter_iteration(region.id(), i as u32, bindings);

            let mut feedback = Vec::new();
            for (k, result) in results.iter().enumerate() {
                let value = self.gather_input(exit_id, &exit.inputs()[k], &inner)?;
                match result.mode {
                    ResultMode::Collect => collected[k].push(value),
                    ResultMode::Accumulate(port) => feedback.push((port, value)),
                }
            }
            for (port, value) in feedback {
                accumulators[port] = value;
            }
            self.note_iteration();
        }
        self.forget_iterations(region, count as u32, ctx);

        Ok(results
            .iter()
            .zip(collected)
            .map(|(result, items)| match result.mode {
                ResultMode::Collect => Value::List(items),
                ResultMode::Accumulate(port) => accumulators[port].clone(),
            })
            .collect())
    }

    fn branch(
        &self,
        region: &Region,
        exit_id: InstanceId,
        guard: usize,
        ports: &[Value],
        ctx: &EvaluationContext,
    ) -> Result<Vec<Value>, EvaluationError> {
        let branch = match ports[guard].as_bool() {
            Some(true) => Branch::Then,
            Some(false) => Branch::Else,
            None => {
                let message = format!("guard expects a Bool, got {}", ports[guard].kind_name());
                return Ok(self.region_fault(region, exit_id, codes::E0201, message));
            }
        };
        let exit = self
            .graph()
            .instance(exit_id)
            .ok_or(EvaluationError::UnknownRegion(region.id()))?;
        let inner = ctx.enter_scope(region.id(), ports.to_vec());
        let mut outputs = Vec::with_capacity(region.results().len());
        for k in 0..region.results().len() {
            let slot = &exit.inputs()[region.branch_slot(k, branch)];
            outputs.push(self.gather_input(exit_id, slot, &inner)?);
        }
        log::trace!("{}: took {:?} branch", region, branch);
        Ok(outputs)
    }

    fn cache_boundary(
        &self,
        region: &Region,
        exit_id: InstanceId,
        ports: &[Value],
        ctx: &EvaluationContext,
    ) -> Result<Vec<Value>, EvaluationError> {
        let edits = region.edit_count();
        let previous = region.snapshots.lock().get(ctx.call_context()).cloned();
        if let Some(snapshot) = previous {
            if snapshot.edits == edits && snapshot.inputs == ports {
                log::trace!("{}: border inputs unchanged", region);
                self.note_reuse();
                return Ok(snapshot.outputs);
            }
        }

        let exit = self
            .graph()
            .instance(exit_id)
            .ok_or(EvaluationError::UnknownRegion(region.id()))?;
        let inner = ctx.enter_scope(region.id(), ports.to_vec());
        let mut outputs = Vec::with_capacity(exit.inputs().len());
        for slot in exit.inputs() {
            outputs.push(self.gather_input(exit_id, slot, &inner)?);
        }
        let mut snapshots = region.snapshots.lock();
        // Snapshots from before the last body edit can never match again.
        snapshots.retain(|_, s| s.edits == edits);
        snapshots.insert(
            ctx.call_context().clone(),
            Snapshot {
                inputs: ports.to_vec(),
                outputs: outputs.clone(),
                edits,
            },
        );
        Ok(outputs)
    }

    /// After a run of `count` iterations under `ctx`, evict what earlier,
    /// longer runs left behind for iterations `count..`.
    fn forget_iterations(&self, region: &Region, count: u32, ctx: &EvaluationContext) {
        let previous = region.extent.swap(count, Ordering::AcqRel);
        if count >= previous {
            return;
        }
        let outer = ctx.call_context();
        let stale = |context: &CallContext| context.is_iteration_beyond(outer, region.id(), count);
        let evicted = self.cache().evict_where(|key| stale(&key.context));
        let pruned: usize = self.graph().regions().map(|r| r.prune_snapshots(&stale)).sum();
        log::debug!(
            "{}: shrank from {} to {} iterations, evicted {} entries and {} snapshots",
            region,
            previous,
            count,
            evicted,
            pruned
        );
    }

    /// Poison every output of a region and record why.
    fn region_fault(
        &self,
        region: &Region,
        exit_id: InstanceId,
        code: DiagCode,
        message: String,
    ) -> Vec<Value> {
        log::warn!("{}: {}", region, message);
        self.diagnose(
            Diagnostic::error(code, message.clone())
                .at_instance(exit_id)
                .at_region(region.id()),
        );
        vec![Value::poison(exit_id, message); region.results().len()]
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

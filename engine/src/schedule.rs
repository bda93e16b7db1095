// schedule.rs — Pull-based evaluation scheduler
//
// Evaluates an output slot by pulling on demand: a clean slot produced under
// the same call context is returned as is; otherwise the cache is consulted
// under (symbol, call context + call site) at the instance's revision; only
// on a miss are the inputs pulled, in declared order, and the operator run.
//
// One scheduler serves one pass over one thread. It stages the commands and
// diagnostics the pass produces; the caller commits them only when the pass
// succeeds.
//
// Preconditions: the graph is acyclic and not mutated during the pass.
// Postconditions: every slot the pass produced has reference == target.
// Failure modes: `EvaluationError` aborts the pass (recursion limit,
//   cancellation, unknown slot). Compute and conversion failures do not;
//   they poison the affected outputs and add a diagnostic. A poisoned result
//   always comes back with at least one error diagnostic.
// Side effects: writes slot state and cache entries.

use std::cell::{Cell, RefCell};
use std::fmt;

use thiserror::Error;

use crate::cache::{CacheKey, CacheManager};
use crate::command::Command;
use crate::context::EvaluationContext;
use crate::diag::{codes, Diagnostic};
use crate::dirty;
use crate::graph::{Instance, InstanceGraph, InstanceKind, OutputRef, Slot, SlotRef};
use crate::id::{ConnectionId, InstanceId, RegionId};
use crate::symbol::{ComputeContext, Operator};
use crate::value::Value;

// ── Errors and results ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvaluationError {
    #[error("recursion limit of {limit} exceeded")]
    RecursionLimitExceeded { limit: u32 },
    #[error("evaluation cancelled")]
    Cancelled,
    #[error("unknown output slot {0}")]
    UnknownOutput(OutputRef),
    #[error("unknown region {0}")]
    UnknownRegion(RegionId),
}

/// Work counters for one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvaluationStats {
    /// Operator compute invocations.
    pub computes: u64,
    /// Outputs served from the cache.
    pub cache_hits: u64,
    /// Outputs returned from clean slots or unchanged cache boundaries.
    pub reused: u64,
    /// Region iterations run.
    pub iterations: u64,
}

impl EvaluationStats {
    pub fn merge(&mut self, other: &EvaluationStats) {
        self.computes += other.computes;
        self.cache_hits += other.cache_hits;
        self.reused += other.reused;
        self.iterations += other.iterations;
    }
}

impl fmt::Display for EvaluationStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} computes, {} cache hits, {} reused, {} iterations",
            self.computes, self.cache_hits, self.reused, self.iterations
        )
    }
}

/// Result of evaluating one output.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub value: Value,
    pub diagnostics: Vec<Diagnostic>,
    pub stats: EvaluationStats,
}

impl Evaluation {
    pub fn has_errors(&self) -> bool {
        crate::diag::has_errors(&self.diagnostics)
    }
}

/// What a finished pass leaves behind for the caller to commit.
#[derive(Debug, Default)]
pub struct PassOutcome {
    pub diagnostics: Vec<Diagnostic>,
    pub commands: Vec<Command>,
    pub stats: EvaluationStats,
}

// ── Scheduler ───────────────────────────────────────────────────────────────

pub struct Scheduler<'g> {
    graph: &'g InstanceGraph,
    cache: &'g CacheManager,
    diagnostics: RefCell<Vec<Diagnostic>>,
    commands: RefCell<Vec<Command>>,
    stats: Cell<EvaluationStats>,
}

impl<'g> Scheduler<'g> {
    pub fn new(graph: &'g InstanceGraph, cache: &'g CacheManager) -> Self {
        Scheduler {
            graph,
            cache,
            diagnostics: RefCell::new(Vec::new()),
            commands: RefCell::new(Vec::new()),
            stats: Cell::new(EvaluationStats::default()),
        }
    }

    /// Evaluate one output slot.
    pub fn evaluate(&self, output: OutputRef, ctx: &EvaluationContext) -> Result<Value, EvaluationError> {
        log::debug!(
            "evaluate {} at t={} pass {} in {}",
            output,
            ctx.time(),
            ctx.pass(),
            ctx.call_context()
        );
        let value = self.pull(output, ctx)?;
        if let Some(poison) = value.find_poison() {
            // Served from a clean slot or the cache: the original diagnostic
            // went out with an earlier pass.
            if !crate::diag::has_errors(&self.diagnostics.borrow()) {
                self.diagnose(
                    Diagnostic::error(codes::E0103, poison.message.clone())
                        .at_instance(poison.origin)
                        .with_hint(format!("{} is poisoned by {}", output, poison.origin)),
                );
            }
        }
        Ok(value)
    }

    /// Staged diagnostics, commands and counters.
    pub fn finish(self) -> PassOutcome {
        PassOutcome {
            diagnostics: self.diagnostics.into_inner(),
            commands: self.commands.into_inner(),
            stats: self.stats.get(),
        }
    }

    pub fn stats(&self) -> EvaluationStats {
        self.stats.get()
    }

    pub(crate) fn graph(&self) -> &'g InstanceGraph {
        self.graph
    }

    pub(crate) fn cache(&self) -> &'g CacheManager {
        self.cache
    }

    // ── Pull ────────────────────────────────────────────────────────────

    pub(crate) fn pull(&self, output: OutputRef, ctx: &EvaluationContext) -> Result<Value, EvaluationError> {
        ctx.checkpoint()?;
        let inst = self
            .graph
            .instance(output.instance)
            .ok_or(EvaluationError::UnknownOutput(output))?;
        if output.index >= inst.outputs().len() {
            return Err(EvaluationError::UnknownOutput(output));
        }
        let values = match inst.kind() {
            InstanceKind::Operator { symbol, operator } => {
                let key = CacheKey::new(*symbol, ctx.call_context().with_site(output.instance));
                self.pull_operator(output.instance, inst, key, operator.as_ref(), ctx)?
            }
            InstanceKind::RegionEntry(region) => return Ok(self.read_port(output, *region, ctx)),
            InstanceKind::RegionExit(region) => self.evaluate_exit(*region, output.instance, ctx)?,
        };
        Ok(values.into_iter().nth(output.index).unwrap_or_default())
    }

    fn pull_operator(
        &self,
        id: InstanceId,
        inst: &Instance,
        key: CacheKey,
        operator: &dyn Operator,
        ctx: &EvaluationContext,
    ) -> Result<Vec<Value>, EvaluationError> {
        let visited = self.visited(inst, ctx);
        if inst.is_volatile() && !inst.is_time_varying() && !visited {
            self.refresh_volatile(inst, ctx)?;
        }
        if self.is_fresh(inst, ctx, false) {
            self.note_reuse();
            self.stamp(inst, ctx);
            return Ok(inst.outputs().iter().map(Slot::value).collect());
        }

        let values = if inst.is_time_varying() {
            let values = self.compute(id, inst, operator, ctx)?;
            self.propagate_changes(id, inst, &values);
            values
        } else {
            let revision = inst.revision();
            let (values, hit) = self
                .cache
                .get_or_compute(key, revision, || self.compute(id, inst, operator, ctx))?;
            if hit {
                log::trace!("{} served from cache at {}", id, revision);
                self.bump(|s| s.cache_hits += 1);
            }
            values
        };
        self.commit(inst, &values, ctx);
        Ok(values)
    }

    /// Pull the volatile sources feeding `inst` so that a changed
    /// time-varying value invalidates it before its freshness is checked.
    fn refresh_volatile(&self, inst: &Instance, ctx: &EvaluationContext) -> Result<(), EvaluationError> {
        for slot in inst.inputs() {
            for conn_id in slot.connections() {
                let Some(conn) = self.graph.connection(*conn_id) else { continue };
                let volatile = self
                    .graph
                    .instance(conn.source.instance)
                    .is_some_and(Instance::is_volatile);
                if volatile {
                    self.pull(conn.source, &ctx.descend()?)?;
                }
            }
        }
        Ok(())
    }

    fn compute(
        &self,
        id: InstanceId,
        inst: &Instance,
        operator: &dyn Operator,
        ctx: &EvaluationContext,
    ) -> Result<Vec<Value>, EvaluationError> {
        let arity = inst.outputs().len();
        let mut inputs = Vec::with_capacity(inst.inputs().len());
        for slot in inst.inputs() {
            inputs.push(self.gather_input(id, slot, ctx)?);
        }
        if let Some(poison) = inputs.iter().find_map(Value::find_poison) {
            log::trace!("{} short-circuits on poison from {}", id, poison.origin);
            return Ok(vec![Value::Error(poison.clone()); arity]);
        }

        let mut staged = Vec::new();
        let result = {
            let mut cx = ComputeContext::new(ctx, id, &mut staged);
            operator.compute(&inputs, &mut cx)
        };
        self.bump(|s| s.computes += 1);

        match result {
            Ok(values) if values.len() == arity => {
                self.commands.borrow_mut().extend(staged);
                Ok(values)
            }
            Ok(values) => {
                let message = format!("returned {} outputs, expected {}", values.len(), arity);
                self.diagnose(Diagnostic::error(codes::E0102, message.clone()).at_instance(id));
                Ok(vec![Value::poison(id, message); arity])
            }
            Err(err) => {
                log::warn!("compute failed on {}: {}", id, err.message);
                self.diagnose(Diagnostic::error(codes::E0100, err.message.clone()).at_instance(id));
                Ok(vec![Value::poison(id, err.message); arity])
            }
        }
    }

    /// Value of an input slot: the constant if unconnected, the single
    /// upstream value, or the ordered sequence of a multi-input.
    pub(crate) fn gather_input(
        &self,
        owner: InstanceId,
        slot: &Slot,
        ctx: &EvaluationContext,
    ) -> Result<Value, EvaluationError> {
        let connections = slot.connections();
        if connections.is_empty() {
            return Ok(slot.value());
        }
        let child = ctx.descend()?;
        if slot.is_multi() {
            let mut items = Vec::with_capacity(connections.len());
            for conn_id in connections {
                items.push(self.pull_connection(owner, *conn_id, &child)?);
            }
            Ok(Value::List(items))
        } else {
            self.pull_connection(owner, connections[0], &child)
        }
    }

    fn pull_connection(
        &self,
        owner: InstanceId,
        conn_id: ConnectionId,
        ctx: &EvaluationContext,
    ) -> Result<Value, EvaluationError> {
        let Some(conn) = self.graph.connection(conn_id) else {
            return Ok(Value::poison(owner, format!("dangling connection {}", conn_id)));
        };
        let value = self.pull(conn.source, ctx)?;
        if value.is_poison() {
            return Ok(value);
        }
        let types = self.graph.types();
        match types.apply(&conn.conversion, &value, conn.from_type, conn.to_type) {
            Ok(converted) => Ok(converted),
            Err(err) => {
                let message = err.to_string();
                self.diagnose(
                    Diagnostic::error(codes::E0101, message.clone())
                        .at_instance(owner)
                        .with_hint(format!("on {}", conn_id)),
                );
                Ok(Value::poison(owner, message))
            }
        }
    }

    fn read_port(&self, output: OutputRef, region: RegionId, ctx: &EvaluationContext) -> Value {
        if let Some(value) = ctx.binding(region, output.index) {
            return value.clone();
        }
        let message = format!("port {} of {} read outside its region", output.index, region);
        self.diagnose(
            Diagnostic::error(codes::E0202, message.clone())
                .at_instance(output.instance)
                .at_region(region)
                .with_hint("evaluate the region's outputs instead"),
        );
        Value::poison(output.instance, message)
    }

    // ── Slot state ──────────────────────────────────────────────────────

    /// Outputs were produced (or checked) in this pass and call context.
    fn visited(&self, inst: &Instance, ctx: &EvaluationContext) -> bool {
        inst.outputs().iter().all(|slot| {
            let state = slot.state();
            state.pass == Some(ctx.pass()) && state.context.as_ref() == Some(ctx.call_context())
        })
    }

    /// True if every output can be returned without recomputation.
    /// `same_pass` additionally requires the values to come from this pass.
    pub(crate) fn is_fresh(&self, inst: &Instance, ctx: &EvaluationContext, same_pass: bool) -> bool {
        inst.outputs().iter().all(|slot| {
            let state = slot.state();
            if state.context.as_ref() != Some(ctx.call_context()) {
                return false;
            }
            let this_pass = state.pass == Some(ctx.pass());
            if state.flag.always_dirty() {
                this_pass
            } else {
                !state.flag.is_dirty() && (this_pass || !same_pass)
            }
        })
    }

    fn stamp(&self, inst: &Instance, ctx: &EvaluationContext) {
        for slot in inst.outputs() {
            slot.state().pass = Some(ctx.pass());
        }
    }

    /// Advance the revision of every time-varying output whose value moved.
    fn propagate_changes(&self, id: InstanceId, inst: &Instance, values: &[Value]) {
        for (index, (slot, value)) in inst.outputs().iter().zip(values).enumerate() {
            if slot.value() != *value {
                let (revision, marked) = dirty::invalidate(self.graph, SlotRef::Output(OutputRef::new(id, index)));
                log::trace!("{} changed, {} slots marked at {}", id, marked, revision);
            }
        }
    }

    /// Store produced values and mark them computed at the target revision.
    pub(crate) fn commit(&self, inst: &Instance, values: &[Value], ctx: &EvaluationContext) {
        for (slot, value) in inst.outputs().iter().zip(values) {
            let mut state = slot.state();
            state.value = value.clone();
            state.flag.clear();
            state.context = Some(ctx.call_context().clone());
            state.pass = Some(ctx.pass());
        }
        for slot in inst.inputs() {
            slot.state().flag.clear();
        }
    }

    /// Clear the flags of a region entry once its ports were bound.
    pub(crate) fn commit_boundary(&self, entry: &Instance, ctx: &EvaluationContext) {
        for slot in entry.inputs() {
            slot.state().flag.clear();
        }
        for slot in entry.outputs() {
            let mut state = slot.state();
            state.flag.clear();
            state.pass = Some(ctx.pass());
        }
    }

    // ── Bookkeeping ─────────────────────────────────────────────────────

    pub(crate) fn diagnose(&self, diagnostic: Diagnostic) {
        self.diagnostics.borrow_mut().push(diagnostic);
    }

    fn bump(&self, update: impl FnOnce(&mut EvaluationStats)) {
        let mut stats = self.stats.get();
        update(&mut stats);
        self.stats.set(stats);
    }

    pub(crate) fn note_reuse(&self) {
        self.bump(|s| s.reused += 1);
    }

    pub(crate) fn note_iteration(&self) {
        self.bump(|s| s.iterations += 1);
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

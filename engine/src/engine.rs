// engine.rs — Engine facade: one graph, one cache, many passes
//
// Owns the instance graph behind a single-writer / multi-reader lock, the
// shared output cache and the command buffer. Every evaluation is a pass
// with its own pass id; commands staged during a pass reach the buffer only
// when the pass completes, so a cancelled or failed pass leaves no trace but
// the slot values it already produced.
//
// Preconditions: none.
// Postconditions: structural edits never overlap a pass.
// Failure modes: `EvaluationError` from the scheduler; `GraphError` from the
//   edit helpers. Removals through `edit` leave the removed instances' cache
//   entries behind; `remove_instance` and `remove_region` evict them.
// Side effects: fills the cache and the command buffer.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::cache::{CacheManager, DEFAULT_SHARDS};
use crate::command::{Command, CommandBuffer};
use crate::context::{EvaluationContext, DEFAULT_MAX_DEPTH};
use crate::graph::{GraphError, InstanceGraph, MigrationReport, OutputRef};
use crate::id::{InstanceId, RegionId, SymbolId};
use crate::schedule::{Evaluation, EvaluationError, PassOutcome, Scheduler};
use crate::value::Value;

// ── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Pull recursion limit per pass.
    pub max_depth: u32,
    pub cache_shards: usize,
    /// Entries per shard; unbounded when absent.
    pub shard_capacity: Option<usize>,
    /// Evaluate independent outputs of one batch on worker threads.
    pub parallel: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_depth: DEFAULT_MAX_DEPTH,
            cache_shards: DEFAULT_SHARDS,
            shard_capacity: None,
            parallel: true,
        }
    }
}

impl EngineConfig {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

// ── Engine ──────────────────────────────────────────────────────────────────

pub struct Engine {
    graph: RwLock<InstanceGraph>,
    cache: CacheManager,
    commands: Mutex<CommandBuffer>,
    passes: AtomicU64,
    config: EngineConfig,
}

impl Engine {
    pub fn new(graph: InstanceGraph, config: EngineConfig) -> Self {
        let capacity = config.shard_capacity.and_then(NonZeroUsize::new);
        Engine {
            graph: RwLock::new(graph),
            cache: CacheManager::new(config.cache_shards, capacity),
            commands: Mutex::new(CommandBuffer::new()),
            passes: AtomicU64::new(0),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Shared view of the graph. Blocks structural edits while held.
    pub fn graph(&self) -> RwLockReadGuard<'_, InstanceGraph> {
        self.graph.read()
    }

    /// Apply a structural edit under the exclusive lock.
    pub fn edit<R>(&self, f: impl FnOnce(&mut InstanceGraph) -> R) -> R {
        let mut graph = self.graph.write();
        f(&mut graph)
    }

    /// Remove an instance and forget its cache entries.
    pub fn remove_instance(&self, id: InstanceId) -> Result<(), GraphError> {
        self.edit(|g| g.remove_instance(id))?;
        self.cache.evict_site(id);
        Ok(())
    }

    /// Remove a region with everything it owns and forget their cache
    /// entries. Snapshots of removed regions go with them.
    pub fn remove_region(&self, id: RegionId) -> Result<(), GraphError> {
        let owned = self.edit(|g| {
            let owned = g.region_instances(id);
            g.remove_region(id).map(|()| owned)
        })?;
        let evicted: usize = owned.iter().map(|site| self.cache.evict_site(*site)).sum();
        log::debug!("removed {} with {} instances, {} cache entries", id, owned.len(), evicted);
        Ok(())
    }

    /// Migrate instances between symbol versions, dropping their cache
    /// entries.
    pub fn migrate_instances(&self, old: SymbolId, new: SymbolId) -> Result<MigrationReport, GraphError> {
        let report = self.edit(|g| g.migrate_instances(old, new))?;
        for id in &report.migrated {
            self.cache.evict_site(*id);
        }
        Ok(report)
    }

    /// A fresh context at `time` carrying the configured recursion limit.
    pub fn context(&self, time: f64) -> EvaluationContext {
        EvaluationContext::new(time).with_max_depth(self.config.max_depth)
    }

    fn next_pass(&self) -> u64 {
        self.passes.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Acquire)
    }

    /// Evaluate one output as a pass of its own.
    pub fn evaluate(&self, output: OutputRef, ctx: &EvaluationContext) -> Result<Evaluation, EvaluationError> {
        let pass = self.next_pass();
        let ctx = ctx.clone().with_pass(pass);
        let graph = self.graph.read();
        let (value, outcome) = run_one(&graph, &self.cache, output, &ctx).map_err(|err| {
            log::debug!("pass {} aborted: {}", pass, err);
            err
        })?;
        Ok(self.finish(pass, vec![(value, outcome)]).remove(0))
    }

    /// Evaluate several outputs in one pass.
    ///
    /// Outputs whose upstream closures are pairwise disjoint run on worker
    /// threads; otherwise they run in order. Any error aborts the whole
    /// batch and discards its commands.
    pub fn evaluate_many(
        &self,
        outputs: &[OutputRef],
        ctx: &EvaluationContext,
    ) -> Result<Vec<Evaluation>, EvaluationError> {
        if outputs.is_empty() {
            return Ok(Vec::new());
        }
        let pass = self.next_pass();
        let ctx = ctx.clone().with_pass(pass);
        let graph = self.graph.read();
        let parallel = self.config.parallel && outputs.len() > 1 && disjoint(&graph, outputs);
        log::debug!(
            "pass {}: {} outputs, {}",
            pass,
            outputs.len(),
            if parallel { "parallel" } else { "sequential" }
        );

        let graph_ref: &InstanceGraph = &graph;
        let results: Result<Vec<(Value, PassOutcome)>, EvaluationError> = if parallel {
            outputs
                .par_iter()
                .map(|output| run_one(graph_ref, &self.cache, *output, &ctx))
                .collect()
        } else {
            outputs
                .iter()
                .map(|output| run_one(graph_ref, &self.cache, *output, &ctx))
                .collect()
        };
        let results = results.map_err(|err| {
            log::debug!("pass {} aborted: {}", pass, err);
            err
        })?;
        Ok(self.finish(pass, results))
    }

    /// Commit staged commands in request order and build the evaluations.
    fn finish(&self, pass: u64, results: Vec<(Value, PassOutcome)>) -> Vec<Evaluation> {
        let mut buffer = self.commands.lock();
        results
            .into_iter()
            .map(|(value, outcome)| {
                log::debug!("pass {}: {}", pass, outcome.stats);
                buffer.extend(outcome.commands);
                Evaluation {
                    value,
                    diagnostics: outcome.diagnostics,
                    stats: outcome.stats,
                }
            })
            .collect()
    }

    /// Take every committed command in production order.
    pub fn drain_commands(&self) -> Vec<Command> {
        self.commands.lock().drain()
    }

    pub fn pending_commands(&self) -> usize {
        self.commands.lock().len()
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn into_graph(self) -> InstanceGraph {
        self.graph.into_inner()
    }
}

fn run_one(
    graph: &InstanceGraph,
    cache: &CacheManager,
    output: OutputRef,
    ctx: &EvaluationContext,
) -> Result<(Value, PassOutcome), EvaluationError> {
    let scheduler = Scheduler::new(graph, cache);
    let value = scheduler.evaluate(output, ctx)?;
    Ok((value, scheduler.finish()))
}

/// True if no instance is shared between the outputs' upstream closures.
fn disjoint(graph: &InstanceGraph, outputs: &[OutputRef]) -> bool {
    let mut seen: HashSet<InstanceId> = HashSet::new();
    for output in outputs {
        let mut closure = graph.upstream_closure(output.instance);
        closure.insert(output.instance);
        for id in closure {
            if !seen.insert(id) {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_fill_missing_fields() {
        let config = EngineConfig::from_json(r#"{"max_depth": 12}"#).unwrap();
        assert_eq!(config.max_depth, 12);
        assert_eq!(config.cache_shards, DEFAULT_SHARDS);
        assert!(config.parallel);
        assert_eq!(config.shard_capacity, None);
    }

    #[test]
    fn config_rejects_bad_json() {
        assert!(EngineConfig::from_json("{max_depth: }").is_err());
    }
}

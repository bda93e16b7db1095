// dirty.rs — Revision-based dirty flags and their propagation
//
// A single global revision clock stamps every invalidation. A slot is dirty
// while its target revision differs from the revision it was last computed
// at, or while it is an always-dirty (time-varying) source. Propagation only
// marks; recomputation is the scheduler's job.
//
// Preconditions: invalidation runs with no concurrent structural edit.
// Postconditions: every slot in the downstream closure of the invalidated
//   slot carries the same fresh target revision.
// Failure modes: none.
// Side effects: mutates dirty flags through each slot's state lock.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::graph::{InstanceGraph, InstanceKind, OutputRef, SlotRef};

// ── Revisions ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Revision(pub u64);

impl Revision {
    pub const ZERO: Revision = Revision(0);
    /// Reference revision of a slot that has never been computed.
    pub const NEVER: Revision = Revision(u64::MAX);
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Revision::NEVER {
            write!(f, "never")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}

/// Monotonically increasing global revision counter.
#[derive(Debug, Default)]
pub struct RevisionClock {
    current: AtomicU64,
}

impl RevisionClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Revision {
        Revision(self.current.load(Ordering::Acquire))
    }

    pub fn next(&self) -> Revision {
        Revision(self.current.fetch_add(1, Ordering::AcqRel) + 1)
    }
}

// ── Dirty flag ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyFlag {
    target: Revision,
    reference: Revision,
    always_dirty: bool,
}

impl DirtyFlag {
    /// A flag for a slot that has never been computed.
    pub fn new(always_dirty: bool) -> Self {
        Self {
            target: Revision::ZERO,
            reference: Revision::NEVER,
            always_dirty,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.target != self.reference || self.always_dirty
    }

    pub fn target(&self) -> Revision {
        self.target
    }

    pub fn reference(&self) -> Revision {
        self.reference
    }

    pub fn always_dirty(&self) -> bool {
        self.always_dirty
    }

    pub(crate) fn mark(&mut self, revision: Revision) {
        self.target = revision;
    }

    /// Record that the current value corresponds to the target revision.
    pub(crate) fn clear(&mut self) {
        self.reference = self.target;
    }
}

// ── Propagation ─────────────────────────────────────────────────────────────

/// Mark `start` and its whole downstream closure dirty under one fresh
/// revision. Returns the revision used and the number of slots marked.
pub fn invalidate(graph: &InstanceGraph, start: SlotRef) -> (Revision, usize) {
    let revision = graph.revisions().next();
    let mut seen: HashSet<SlotRef> = HashSet::new();
    let mut work = vec![start];

    while let Some(slot) = work.pop() {
        if !seen.insert(slot) {
            continue;
        }
        let Some(instance) = graph.instance(slot.instance()) else {
            continue;
        };
        match slot {
            SlotRef::Output(out) => {
                let Some(s) = instance.outputs().get(out.index) else {
                    continue;
                };
                s.state().flag.mark(revision);
                for conn_id in s.connections() {
                    if let Some(conn) = graph.connection(*conn_id) {
                        work.push(SlotRef::Input(conn.target));
                    }
                }
            }
            SlotRef::Input(input) => {
                let Some(s) = instance.inputs().get(input.index) else {
                    continue;
                };
                s.state().flag.mark(revision);
                for index in 0..instance.outputs().len() {
                    work.push(SlotRef::Output(OutputRef::new(input.instance, index)));
                }
                // The exit reads every port, whether or not the body does.
                if let InstanceKind::RegionEntry(region) = instance.kind() {
                    if let Some(exit) = graph.region(*region).map(|r| r.exit) {
                        let results = graph.instance(exit).map_or(0, |e| e.outputs().len());
                        for index in 0..results {
                            work.push(SlotRef::Output(OutputRef::new(exit, index)));
                        }
                    }
                }
            }
        }
    }

    log::trace!(
        "invalidate {:?}: {} slots marked at {}",
        start,
        seen.len(),
        revision
    );
    (revision, seen.len())
}

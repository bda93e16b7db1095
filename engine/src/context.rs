// context.rs — Evaluation context threaded through every pull
//
// Ambient parameters of one evaluation call: time, pass id, call context,
// recursion depth, cancellation and the border-port bindings of the regions
// currently being evaluated. Contexts are immutable; descending or entering a
// region derives a new one, so no global mutable cursor exists.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::id::{InstanceId, RegionId};
use crate::schedule::EvaluationError;
use crate::value::Value;

pub const DEFAULT_MAX_DEPTH: u32 = 256;

// ── Call context ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Frame {
    /// One iteration of a ForEach or Repeat region.
    Iteration { region: RegionId, index: u32 },
    /// The body of a Conditional or CacheBoundary region.
    Scope(RegionId),
    /// The instance being invoked.
    Site(InstanceId),
}

/// Path-dependent identity of an invocation.
///
/// Two evaluations of the same instance under different region iterations
/// have different call contexts and therefore never share a cache entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CallContext {
    frames: Vec<Frame>,
}

impl CallContext {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn is_root(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Index of the innermost enclosing iteration.
    pub fn iteration(&self) -> Option<u32> {
        self.frames.iter().rev().find_map(|f| match f {
            Frame::Iteration { index, .. } => Some(*index),
            Frame::Scope(_) | Frame::Site(_) => None,
        })
    }

    pub fn push_iteration(&self, region: RegionId, index: u32) -> Self {
        let mut frames = self.frames.clone();
        frames.push(Frame::Iteration { region, index });
        Self { frames }
    }

    pub fn push_scope(&self, region: RegionId) -> Self {
        let mut frames = self.frames.clone();
        frames.push(Frame::Scope(region));
        Self { frames }
    }

    /// True if `self` lies under `outer` inside an iteration of `region`
    /// with index `count` or higher.
    pub fn is_iteration_beyond(&self, outer: &CallContext, region: RegionId, count: u32) -> bool {
        self.frames.starts_with(&outer.frames)
            && matches!(
                self.frames.get(outer.frames.len()),
                Some(Frame::Iteration { region: r, index }) if *r == region && *index >= count
            )
    }

    /// This context with `site` appended as the invoked call site.
    pub fn with_site(&self, site: InstanceId) -> Self {
        let mut frames = self.frames.clone();
        frames.push(Frame::Site(site));
        Self { frames }
    }
}

impl fmt::Display for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.frames.is_empty() {
            return write!(f, "/");
        }
        for frame in &self.frames {
            match frame {
                Frame::Iteration { region, index } => write!(f, "/{}[{}]", region, index)?,
                Frame::Scope(region) => write!(f, "/{}", region)?,
                Frame::Site(instance) => write!(f, "/{}", instance)?,
            }
        }
        Ok(())
    }
}

// ── Cancellation ────────────────────────────────────────────────────────────

/// Cooperative cancellation flag shared between a caller and a pass.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// ── Region bindings ─────────────────────────────────────────────────────────

/// Values bound to a region's border ports for the current iteration.
#[derive(Debug)]
pub struct RegionScope {
    region: RegionId,
    values: Vec<Value>,
    parent: Option<Arc<RegionScope>>,
}

// ── Evaluation context ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EvaluationContext {
    time: f64,
    pass: u64,
    call_context: CallContext,
    depth: u32,
    max_depth: u32,
    cancel: CancelToken,
    scope: Option<Arc<RegionScope>>,
}

impl Default for EvaluationContext {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl EvaluationContext {
    pub fn new(time: f64) -> Self {
        Self {
            time,
            pass: 0,
            call_context: CallContext::root(),
            depth: 0,
            max_depth: DEFAULT_MAX_DEPTH,
            cancel: CancelToken::new(),
            scope: None,
        }
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_time(mut self, time: f64) -> Self {
        self.time = time;
        self
    }

    pub(crate) fn with_pass(mut self, pass: u64) -> Self {
        self.pass = pass;
        self
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn pass(&self) -> u64 {
        self.pass
    }

    pub fn call_context(&self) -> &CallContext {
        &self.call_context
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Fails if the pass was cancelled.
    pub fn checkpoint(&self) -> Result<(), EvaluationError> {
        if self.cancel.is_cancelled() {
            return Err(EvaluationError::Cancelled);
        }
        Ok(())
    }

    /// Context for one level deeper in the pull recursion.
    pub fn descend(&self) -> Result<Self, EvaluationError> {
        let depth = self.depth + 1;
        if depth > self.max_depth {
            return Err(EvaluationError::RecursionLimitExceeded {
                limit: self.max_depth,
            });
        }
        let mut next = self.clone();
        next.depth = depth;
        Ok(next)
    }

    /// Context for iteration `index` of `region`, with its port bindings.
    pub fn enter_iteration(&self, region: RegionId, index: u32, values: Vec<Value>) -> Self {
        let mut next = self.bind(region, values);
        next.call_context = self.call_context.push_iteration(region, index);
        next
    }

    /// Context for a non-iterating region (conditional, cache boundary).
    /// Body values produced here never share slot state or cache entries
    /// with evaluations of the same instances outside the region.
    pub fn enter_scope(&self, region: RegionId, values: Vec<Value>) -> Self {
        let mut next = self.bind(region, values);
        next.call_context = self.call_context.push_scope(region);
        next
    }

    fn bind(&self, region: RegionId, values: Vec<Value>) -> Self {
        let mut next = self.clone();
        next.scope = Some(Arc::new(RegionScope {
            region,
            values,
            parent: self.scope.clone(),
        }));
        next
    }

    /// Value bound to `port` of the innermost active scope of `region`.
    pub fn binding(&self, region: RegionId, port: usize) -> Option<&Value> {
        let mut scope = self.scope.as_deref();
        while let Some(s) = scope {
            if s.region == region {
                return s.values.get(port);
            }
            scope = s.parent.as_deref();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_context_display_and_iteration() {
        let ctx = CallContext::root()
            .push_iteration(RegionId(0), 2)
            .push_iteration(RegionId(1), 5)
            .with_site(InstanceId(7));
        assert_eq!(ctx.to_string(), "/r0[2]/r1[5]/n7");
        assert_eq!(ctx.iteration(), Some(5));
        assert_eq!(CallContext::root().to_string(), "/");
        assert_eq!(CallContext::root().iteration(), None);
    }

    #[test]
    fn iterations_produce_distinct_contexts() {
        let a = CallContext::root().push_iteration(RegionId(0), 0).with_site(InstanceId(1));
        let b = CallContext::root().push_iteration(RegionId(0), 1).with_site(InstanceId(1));
        assert_ne!(a, b);
    }

    #[test]
    fn descend_enforces_limit() {
        let ctx = EvaluationContext::new(0.0).with_max_depth(2);
        let one = ctx.descend().unwrap();
        let two = one.descend().unwrap();
        assert_eq!(two.depth(), 2);
        assert_eq!(
            two.descend().unwrap_err(),
            EvaluationError::RecursionLimitExceeded { limit: 2 }
        );
    }

    #[test]
    fn checkpoint_observes_cancellation() {
        let token = CancelToken::new();
        let ctx = EvaluationContext::new(0.0).with_cancel(token.clone());
        assert!(ctx.checkpoint().is_ok());
        token.cancel();
        assert_eq!(ctx.checkpoint().unwrap_err(), EvaluationError::Cancelled);
    }

    #[test]
    fn bindings_resolve_through_nested_scopes() {
        let ctx = EvaluationContext::new(0.0)
            .enter_iteration(RegionId(0), 1, vec![Value::Int(10)])
            .enter_scope(RegionId(1), vec![Value::Bool(true)]);
        assert_eq!(ctx.binding(RegionId(0), 0), Some(&Value::Int(10)));
        assert_eq!(ctx.binding(RegionId(1), 0), Some(&Value::Bool(true)));
        assert_eq!(ctx.binding(RegionId(2), 0), None);
        assert_eq!(ctx.call_context().iteration(), Some(1));
        assert_eq!(ctx.call_context().to_string(), "/r0[1]/r1");
    }

    #[test]
    fn scoped_context_differs_from_root() {
        let ctx = EvaluationContext::new(0.0).enter_scope(RegionId(3), vec![]);
        assert!(!ctx.call_context().is_root());
        assert_ne!(
            ctx.call_context().with_site(InstanceId(4)),
            CallContext::root().with_site(InstanceId(4))
        );
    }

    #[test]
    fn iterations_beyond_a_count_are_recognized() {
        let outer = CallContext::root().push_iteration(RegionId(0), 1);
        let inside = outer.push_iteration(RegionId(2), 3).with_site(InstanceId(9));
        assert!(inside.is_iteration_beyond(&outer, RegionId(2), 3));
        assert!(!inside.is_iteration_beyond(&outer, RegionId(2), 4));
        assert!(!inside.is_iteration_beyond(&outer, RegionId(5), 0));
        let elsewhere = CallContext::root().push_iteration(RegionId(0), 0);
        assert!(!inside.is_iteration_beyond(&elsewhere, RegionId(2), 0));
    }
}

// nodeflow — dataflow graph evaluation engine
//
// Library root. Leaves first: values and types, symbols, the instance graph
// and its dirty flags, the cache, then the scheduler and region evaluator,
// and the engine facade that ties them together.

pub mod cache;
pub mod command;
pub mod context;
pub mod diag;
pub mod dirty;
pub mod document;
pub mod dot;
pub mod engine;
pub mod graph;
pub mod id;
pub mod library;
pub mod region;
pub mod schedule;
pub mod symbol;
pub mod types;
pub mod value;

pub use command::{Command, CommandBuffer};
pub use context::{CallContext, CancelToken, EvaluationContext};
pub use engine::{Engine, EngineConfig};
pub use graph::{ConnectError, GraphError, InputRef, InstanceGraph, OutputRef, SlotRef};
pub use region::{Branch, PortSpec, RegionError, RegionKind, RegionSpec, ResultSpec};
pub use schedule::{Evaluation, EvaluationError};
pub use symbol::{ComputeContext, ComputeError, Operator, SymbolDef, SymbolError, SymbolTable};
pub use types::{TypeError, TypeHandle, TypeRegistry};
pub use value::Value;

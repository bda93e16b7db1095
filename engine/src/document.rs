// document.rs — Graph documents: load_graph / serialize_graph
//
// The persistence boundary. A `GraphDocument` names nodes and regions by
// string keys and refers to symbols, types and ports by name, so it stays
// valid across processes. Loading resolves every name against a symbol table
// and type registry and replays the graph API; serializing walks the graph
// in ID order, which makes the JSON canonical.
//
// Preconditions: the registry and symbol table passed to `load_graph` define
//   every name the document references.
// Postconditions: `serialize_graph(load_graph(d))` preserves nodes, regions,
//   constants and connection order.
// Failure modes: `LoadError`.
// Side effects: none.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::{ConnectError, GraphError, InputRef, InstanceGraph, InstanceKind, OutputRef};
use crate::id::{InstanceId, RegionId};
use crate::region::{Branch, PortMode, PortSpec, RegionError, RegionKind, RegionSpec, ResultMode, ResultSpec};
use crate::symbol::SymbolTable;
use crate::types::TypeRegistry;
use crate::value::Value;

pub const DOCUMENT_VERSION: u32 = 1;

// ── Document model ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDocument {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub regions: Vec<RegionDoc>,
    #[serde(default)]
    pub nodes: Vec<NodeDoc>,
    #[serde(default)]
    pub connections: Vec<ConnectionDoc>,
}

fn default_version() -> u32 {
    DOCUMENT_VERSION
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDoc {
    pub id: String,
    pub symbol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Constant values of unconnected inputs, by input name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortModeDoc {
    Splice,
    Pass,
    Accumulator,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortDoc {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
    pub mode: PortModeDoc,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultDoc {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
    /// Name of the accumulator port this result feeds back into.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accumulate: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegionKindDoc {
    ForEach,
    Repeat {
        count: u32,
        #[serde(default)]
        cycle: bool,
    },
    Conditional {
        guard: String,
    },
    CacheBoundary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionDoc {
    pub id: String,
    #[serde(flatten)]
    pub kind: RegionKindDoc,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default)]
    pub ports: Vec<PortDoc>,
    #[serde(default)]
    pub results: Vec<ResultDoc>,
    /// Constant values of unconnected ports, by port name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchDoc {
    Then,
    Else,
}

/// One end of a connection. Exactly one of `node` / `region` is set; for a
/// region, `port` addresses a border port and `result` a region result.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<BranchDoc>,
}

impl Endpoint {
    pub fn node(node: &str, port: &str) -> Self {
        Endpoint {
            node: Some(node.to_string()),
            port: Some(port.to_string()),
            ..Endpoint::default()
        }
    }

    pub fn region_port(region: &str, port: &str) -> Self {
        Endpoint {
            region: Some(region.to_string()),
            port: Some(port.to_string()),
            ..Endpoint::default()
        }
    }

    pub fn region_result(region: &str, result: &str) -> Self {
        Endpoint {
            region: Some(region.to_string()),
            result: Some(result.to_string()),
            ..Endpoint::default()
        }
    }

    pub fn with_branch(mut self, branch: BranchDoc) -> Self {
        self.branch = Some(branch);
        self
    }

    fn describe(&self) -> String {
        let owner = self.node.as_deref().or(self.region.as_deref()).unwrap_or("?");
        let slot = self.port.as_deref().or(self.result.as_deref()).unwrap_or("?");
        format!("{}.{}", owner, slot)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDoc {
    pub from: Endpoint,
    pub to: Endpoint,
}

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("unknown symbol '{0}'")]
    UnknownSymbol(String),
    #[error("unknown type '{0}'")]
    UnknownType(String),
    #[error("unknown node or region '{0}'")]
    UnknownNode(String),
    #[error("unknown port '{0}'")]
    UnknownPort(String),
    #[error("constant for '{port}': {message}")]
    BadConstant { port: String, message: String },
        #[error("duplicate node or region '{0}'")]
    DuplicateNode(String),
    #[error("connection {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: ConnectError,
    },
    #[error(transparent)]
    Region(#[from] RegionError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

// ── Loading ─────────────────────────────────────────────────────────────────

/// A loaded graph plus the document's names for its nodes and regions.
pub struct LoadedGraph {
    pub graph: InstanceGraph,
    pub nodes: BTreeMap<String, InstanceId>,
    pub regions: BTreeMap<String, RegionId>,
}

impl LoadedGraph {
    /// Resolve `node.port` or `region.result` to an output slot.
    pub fn output(&self, path: &str) -> Option<OutputRef> {
        let (owner, slot) = path.split_once('.')?;
        if let Some(id) = self.nodes.get(owner) {
            return self.graph.output(*id, slot);
        }
        let region_id = *self.regions.get(owner)?;
        let region = self.graph.region(region_id)?;
        let index = region.results().iter().position(|r| r.name == slot)?;
        self.graph.region_output(region_id, index).ok()
    }
}

/// Build an instance graph from a document.
pub fn load_graph(
    doc: &GraphDocument,
    types: Arc<TypeRegistry>,
    symbols: SymbolTable,
) -> Result<LoadedGraph, LoadError> {
    let mut graph = InstanceGraph::new(types, symbols);
    let mut nodes: BTreeMap<String, InstanceId> = BTreeMap::new();
    let mut regions: BTreeMap<String, RegionId> = BTreeMap::new();

    for rdoc in &doc.regions {
        if regions.contains_key(&rdoc.id) {
            return Err(LoadError::DuplicateNode(rdoc.id.clone()));
        }
        let spec = region_spec(&graph, rdoc, &regions)?;
        let id = graph.create_region(spec)?;
        for (name, value) in &rdoc.inputs {
            let port = graph
                .region(id)
                .and_then(|r| r.ports().iter().position(|p| &p.name == name))
                .ok_or_else(|| LoadError::UnknownPort(format!("{}.{}", rdoc.id, name)))?;
            let input = graph.region_port_input(id, port)?;
            set_constant(&mut graph, input, value.clone(), &rdoc.id, name)?;
        }
        regions.insert(rdoc.id.clone(), id);
    }

    for ndoc in &doc.nodes {
        if nodes.contains_key(&ndoc.id) || regions.contains_key(&ndoc.id) {
            return Err(LoadError::DuplicateNode(ndoc.id.clone()));
        }
        let symbol = match ndoc.version {
            Some(v) => graph.symbols().lookup_version(&ndoc.symbol, v),
            None => graph.symbols().lookup(&ndoc.symbol),
        }
        .map(|s| s.id)
        .ok_or_else(|| LoadError::UnknownSymbol(ndoc.symbol.clone()))?;
        let region = match &ndoc.region {
            Some(name) => Some(*regions.get(name).ok_or_else(|| LoadError::UnknownNode(name.clone()))?),
            None => None,
        };
        let id = graph.add_instance_in(symbol, region).map_err(|e| match e {
            crate::graph::GraphError::Region(r) => LoadError::Region(r),
            other => LoadError::UnknownSymbol(format!("{}: {}", ndoc.symbol, other)),
        })?;
        for (name, value) in &ndoc.inputs {
            let input = graph
                .input(id, name)
                .ok_or_else(|| LoadError::UnknownPort(format!("{}.{}", ndoc.id, name)))?;
            set_constant(&mut graph, input, value.clone(), &ndoc.id, name)?;
        }
        nodes.insert(ndoc.id.clone(), id);
    }

    for cdoc in &doc.connections {
        let source = resolve_source(&graph, &nodes, &regions, &cdoc.from)?;
        let target = resolve_target(&graph, &nodes, &regions, &cdoc.to)?;
        graph
            .connect_slots(source, target)
            .map_err(|source| LoadError::Connect {
                endpoint: format!("{} -> {}", cdoc.from.describe(), cdoc.to.describe()),
                source,
            })?;
    }

    log::debug!(
        "loaded graph: {} nodes, {} regions, {} connections",
        nodes.len(),
        regions.len(),
        doc.connections.len()
    );
    Ok(LoadedGraph { graph, nodes, regions })
}

fn set_constant(
    graph: &mut InstanceGraph,
    input: InputRef,
    value: Value,
    owner: &str,
    name: &str,
) -> Result<(), LoadError> {
    let port = format!("{}.{}", owner, name);
    graph.set_input_value(input, value).map(|_| ()).map_err(|err| match err {
        GraphError::ValueMismatch { .. } => LoadError::BadConstant {
            port,
            message: err.to_string(),
        },
        _ => LoadError::UnknownPort(port),
    })
}

fn region_spec(
    graph: &InstanceGraph,
    rdoc: &RegionDoc,
    regions: &BTreeMap<String, RegionId>,
) -> Result<RegionSpec, LoadError> {
    let types = graph.types();
    let lookup = |name: &str| types.lookup(name).ok_or_else(|| LoadError::UnknownType(name.to_string()));

    let mut ports = Vec::with_capacity(rdoc.ports.len());
    for p in &rdoc.ports {
        let ty = lookup(&p.ty)?;
        let mut port = match p.mode {
            PortModeDoc::Splice => PortSpec::splice(&p.name, ty),
            PortModeDoc::Pass => PortSpec::pass(&p.name, ty),
            PortModeDoc::Accumulator => PortSpec::accumulator(&p.name, ty, Value::Unit),
        };
        if let Some(initial) = &p.initial {
            port = port.with_initial(initial.clone());
        }
        ports.push(port);
    }
    let port_index = |name: &str| {
        rdoc.ports
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| LoadError::UnknownPort(format!("{}.{}", rdoc.id, name)))
    };

    let mut results = Vec::with_capacity(rdoc.results.len());
    for r in &rdoc.results {
        let ty = lookup(&r.ty)?;
        results.push(match &r.accumulate {
            Some(port) => ResultSpec::accumulate(&r.name, ty, port_index(port)?),
            None => ResultSpec::collect(&r.name, ty),
        });
    }

    let kind = match &rdoc.kind {
        RegionKindDoc::ForEach => RegionKind::ForEach,
        RegionKindDoc::Repeat { count, cycle } => RegionKind::Repeat {
            count: *count,
            cycle: *cycle,
        },
        RegionKindDoc::Conditional { guard } => RegionKind::Conditional {
            guard: port_index(guard)?,
        },
        RegionKindDoc::CacheBoundary => RegionKind::CacheBoundary,
    };
    let mut spec = RegionSpec::new(kind, ports, results);
    if let Some(parent) = &rdoc.parent {
        let id = regions
            .get(parent)
            .ok_or_else(|| LoadError::UnknownNode(parent.clone()))?;
        spec = spec.inside(*id);
    }
    Ok(spec)
}

fn region_by_name(
    graph: &InstanceGraph,
    regions: &BTreeMap<String, RegionId>,
    name: &str,
) -> Result<RegionId, LoadError> {
    let id = *regions.get(name).ok_or_else(|| LoadError::UnknownNode(name.to_string()))?;
    graph
        .region(id)
        .map(|r| r.id())
        .ok_or_else(|| LoadError::UnknownNode(name.to_string()))
}

fn port_of(graph: &InstanceGraph, region: RegionId, ep: &Endpoint) -> Result<usize, LoadError> {
    let name = ep.port.as_deref().unwrap_or_default();
    graph
        .region(region)
        .and_then(|r| r.ports().iter().position(|p| p.name == name))
        .ok_or_else(|| LoadError::UnknownPort(ep.describe()))
}

fn result_of(graph: &InstanceGraph, region: RegionId, ep: &Endpoint) -> Result<usize, LoadError> {
    let name = ep.result.as_deref().unwrap_or_default();
    graph
        .region(region)
        .and_then(|r| r.results().iter().position(|p| p.name == name))
        .ok_or_else(|| LoadError::UnknownPort(ep.describe()))
}

fn resolve_source(
    graph: &InstanceGraph,
    nodes: &BTreeMap<String, InstanceId>,
    regions: &BTreeMap<String, RegionId>,
    ep: &Endpoint,
) -> Result<OutputRef, LoadError> {
    match (&ep.node, &ep.region) {
        (Some(node), None) => {
            let id = *nodes.get(node).ok_or_else(|| LoadError::UnknownNode(node.clone()))?;
            let port = ep.port.as_deref().unwrap_or_default();
            graph
                .output(id, port)
                .ok_or_else(|| LoadError::UnknownPort(ep.describe()))
        }
        (None, Some(region)) => {
            let id = region_by_name(graph, regions, region)?;
            if ep.result.is_some() {
                Ok(graph.region_output(id, result_of(graph, id, ep)?)?)
            } else {
                Ok(graph.region_port_output(id, port_of(graph, id, ep)?)?)
            }
        }
        _ => Err(LoadError::UnknownNode(ep.describe())),
    }
}

fn resolve_target(
    graph: &InstanceGraph,
    nodes: &BTreeMap<String, InstanceId>,
    regions: &BTreeMap<String, RegionId>,
    ep: &Endpoint,
) -> Result<InputRef, LoadError> {
    match (&ep.node, &ep.region) {
        (Some(node), None) => {
            let id = *nodes.get(node).ok_or_else(|| LoadError::UnknownNode(node.clone()))?;
            let port = ep.port.as_deref().unwrap_or_default();
            graph
                .input(id, port)
                .ok_or_else(|| LoadError::UnknownPort(ep.describe()))
        }
        (None, Some(region)) => {
            let id = region_by_name(graph, regions, region)?;
            if ep.result.is_none() {
                return Ok(graph.region_port_input(id, port_of(graph, id, ep)?)?);
            }
            let result = result_of(graph, id, ep)?;
            match ep.branch {
                Some(BranchDoc::Then) => Ok(graph.region_branch_input(id, result, Branch::Then)?),
                Some(BranchDoc::Else) => Ok(graph.region_branch_input(id, result, Branch::Else)?),
                None => Ok(graph.region_result_input(id, result)?),
            }
        }
        _ => Err(LoadError::UnknownNode(ep.describe())),
    }
}

// ── Serializing ─────────────────────────────────────────────────────────────

fn node_name(id: InstanceId) -> String {
    id.to_string()
}

fn region_name(id: RegionId) -> String {
    id.to_string()
}

/// Describe the graph as a document. Nodes are named by instance ID and
/// regions by region ID; constants are recorded where they differ from the
/// declared default.
pub fn serialize_graph(graph: &InstanceGraph) -> GraphDocument {
    let types = graph.types();

    let regions = graph
        .regions()
        .map(|region| {
            let spec = region.spec();
            let ports: Vec<PortDoc> = spec
                .ports
                .iter()
                .map(|p| PortDoc {
                    name: p.name.clone(),
                    ty: types.name(p.ty),
                    mode: match p.mode {
                        PortMode::Splice => PortModeDoc::Splice,
                        PortMode::Pass => PortModeDoc::Pass,
                        PortMode::Accumulator => PortModeDoc::Accumulator,
                    },
                    initial: port_initial(p),
                })
                .collect();
            let results = spec
                .results
                .iter()
                .map(|r| ResultDoc {
                    name: r.name.clone(),
                    ty: types.name(r.ty),
                    accumulate: match r.mode {
                        ResultMode::Accumulate(port) => spec.ports.get(port).map(|p| p.name.clone()),
                        ResultMode::Collect => None,
                    },
                })
                .collect();
            let kind = match spec.kind {
                RegionKind::ForEach => RegionKindDoc::ForEach,
                RegionKind::Repeat { count, cycle } => RegionKindDoc::Repeat { count, cycle },
                RegionKind::Conditional { guard } => RegionKindDoc::Conditional {
                    guard: spec.ports.get(guard).map(|p| p.name.clone()).unwrap_or_default(),
                },
                RegionKind::CacheBoundary => RegionKindDoc::CacheBoundary,
            };
            let mut inputs = BTreeMap::new();
            if let Some(entry) = graph.instance(region.entry) {
                for (slot, port) in entry.inputs().iter().zip(&spec.ports) {
                    let value = slot.value();
                    if slot.connections().is_empty() && value != port.initial {
                        inputs.insert(port.name.clone(), value);
                    }
                }
            }
            RegionDoc {
                id: region_name(region.id()),
                kind,
                parent: spec.parent.map(region_name),
                ports,
                results,
                inputs,
            }
        })
        .collect();

    let nodes = graph
        .instances()
        .filter_map(|(id, inst)| {
            let symbol = graph.symbol_of(id)?;
            let mut inputs = BTreeMap::new();
            for (slot, decl) in inst.inputs().iter().zip(&symbol.inputs) {
                let value = slot.value();
                if slot.connections().is_empty() && value != decl.default {
                    inputs.insert(decl.name.clone(), value);
                }
            }
            Some(NodeDoc {
                id: node_name(id),
                symbol: symbol.name.clone(),
                version: (symbol.version != 1).then_some(symbol.version),
                region: inst.scope().map(region_name),
                inputs,
            })
        })
        .collect();

    let connections = graph
        .connections()
        .filter_map(|conn| {
            Some(ConnectionDoc {
                from: source_endpoint(graph, conn.source)?,
                to: target_endpoint(graph, conn.target)?,
            })
        })
        .collect();

    GraphDocument {
        version: DOCUMENT_VERSION,
        regions,
        nodes,
        connections,
    }
}

/// The port's initial value unless it is the mode's implicit one.
fn port_initial(port: &PortSpec) -> Option<Value> {
    let implicit = match port.mode {
        PortMode::Splice => Value::List(Vec::new()),
        PortMode::Pass => Value::Unit,
        PortMode::Accumulator => return Some(port.initial.clone()),
    };
    (port.initial != implicit).then(|| port.initial.clone())
}

fn source_endpoint(graph: &InstanceGraph, output: OutputRef) -> Option<Endpoint> {
    let inst = graph.instance(output.instance)?;
    let slot = inst.outputs().get(output.index)?;
    Some(match inst.kind() {
        InstanceKind::Operator { .. } => Endpoint::node(&node_name(output.instance), slot.name()),
        InstanceKind::RegionEntry(r) => Endpoint::region_port(&region_name(*r), slot.name()),
        InstanceKind::RegionExit(r) => Endpoint::region_result(&region_name(*r), slot.name()),
    })
}

fn target_endpoint(graph: &InstanceGraph, input: InputRef) -> Option<Endpoint> {
    let inst = graph.instance(input.instance)?;
    let slot = inst.inputs().get(input.index)?;
    Some(match inst.kind() {
        InstanceKind::Operator { .. } => Endpoint::node(&node_name(input.instance), slot.name()),
        InstanceKind::RegionEntry(r) => Endpoint::region_port(&region_name(*r), slot.name()),
        InstanceKind::RegionExit(r) => {
            let region = graph.region(*r)?;
            match region.kind() {
                RegionKind::Conditional { .. } => {
                    let result = &region.results().get(input.index / 2)?.name;
                    let branch = if input.index % 2 == 0 {
                        BranchDoc::Then
                    } else {
                        BranchDoc::Else
                    };
                    Endpoint::region_result(&region_name(*r), result).with_branch(branch)
                }
                _ => Endpoint::region_result(&region_name(*r), slot.name()),
            }
        }
    })
}

// ── JSON helpers ────────────────────────────────────────────────────────────

impl GraphDocument {
    pub fn from_json(text: &str) -> Result<Self, LoadError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Compact canonical JSON (no whitespace).
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// SHA-256 of the canonical JSON, as 64 hex characters.
    pub fn fingerprint(&self) -> Result<String, serde_json::Error> {
        use sha2::{Digest, Sha256};

        let canonical = self.to_json()?;
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(64);
        for b in digest.iter() {
            let _ = write!(hex, "{:02x}", b);
        }
        Ok(hex)
    }
}

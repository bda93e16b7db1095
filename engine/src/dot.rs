// dot.rs — Graphviz DOT output for instance graphs
//
// Renders an InstanceGraph in DOT format for debugging. Regions become
// nested clusters holding their entry, exit and body instances. Dirty
// instances are drawn dashed, poisoned ones red.
//
// Preconditions: none.
// Postconditions: output is deterministic for a given graph state.
// Failure modes: none (pure string formatting).
// Side effects: none.

use std::fmt::Write;

use crate::graph::{Instance, InstanceGraph, InstanceKind};
use crate::id::{InstanceId, RegionId};
use crate::types::Conversion;

/// Emit the instance graph as a Graphviz DOT string.
pub fn emit_dot(graph: &InstanceGraph) -> String {
    let mut buf = String::new();
    writeln!(buf, "digraph nodeflow {{").unwrap();
    writeln!(buf, "    rankdir=LR;").unwrap();
    writeln!(buf, "    node [fontname=\"Helvetica\", fontsize=10];").unwrap();
    writeln!(buf, "    edge [fontname=\"Helvetica\", fontsize=9];").unwrap();

    write_scope(&mut buf, graph, None, "    ");

    let mut wrote_header = false;
    for conn in graph.connections() {
        if !wrote_header {
            writeln!(buf).unwrap();
            wrote_header = true;
        }
        let src_slot = graph.output_slot(conn.source).map(|s| s.name().to_string()).unwrap_or_default();
        let dst_slot = graph.input_slot(conn.target).map(|s| s.name().to_string()).unwrap_or_default();
        let style = match conn.conversion {
            Conversion::Identity => String::new(),
            _ => ", style=dashed, color=blue".to_string(),
        };
        writeln!(
            buf,
            "    {} -> {} [label=\"{} → {}\"{}];",
            conn.source.instance, conn.target.instance, src_slot, dst_slot, style
        )
        .unwrap();
    }

    writeln!(buf, "}}").unwrap();
    buf
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Write the instances of one scope, then the clusters of its child regions.
fn write_scope(buf: &mut String, graph: &InstanceGraph, scope: Option<RegionId>, indent: &str) {
    for (id, inst) in graph.instances().filter(|(_, i)| i.scope() == scope) {
        // Boundaries are drawn inside their own region's cluster.
        if inst.is_boundary() {
            continue;
        }
        write_node(buf, graph, id, inst, indent);
    }

    let children: Vec<RegionId> = graph
        .regions()
        .filter(|r| r.parent() == scope)
        .map(|r| r.id())
        .collect();
    for region_id in children {
        let Some(region) = graph.region(region_id) else { continue };
        writeln!(buf).unwrap();
        writeln!(buf, "{indent}subgraph cluster_{region_id} {{").unwrap();
        writeln!(buf, "{indent}    label=\"{}\";", region).unwrap();
        writeln!(buf, "{indent}    style=rounded;").unwrap();
        writeln!(buf, "{indent}    color=gray50;").unwrap();
        let inner = format!("{indent}    ");
        for boundary in [region.entry, region.exit] {
            if let Some(inst) = graph.instance(boundary) {
                write_node(buf, graph, boundary, inst, &inner);
            }
        }
        write_scope(buf, graph, Some(region_id), &inner);
        writeln!(buf, "{indent}}}").unwrap();
    }
}

fn write_node(buf: &mut String, graph: &InstanceGraph, id: InstanceId, inst: &Instance, indent: &str) {
    let (label, shape) = match inst.kind() {
        InstanceKind::Operator { symbol, .. } => {
            let name = graph
                .symbols()
                .get(*symbol)
                .map(|s| s.name.clone())
                .unwrap_or_else(|_| symbol.to_string());
            (format!("{name}\\n{id}"), "box")
        }
        InstanceKind::RegionEntry(r) => (format!("{r} entry"), "invhouse"),
        InstanceKind::RegionExit(r) => (format!("{r} exit"), "house"),
    };
    let mut attrs = format!("label=\"{label}\", shape={shape}");
    if inst.outputs().iter().any(|s| s.is_dirty()) {
        attrs.push_str(", style=dashed");
    }
    if inst.is_poisoned() {
        attrs.push_str(", color=red");
    }
    writeln!(buf, "{indent}{id} [{attrs}];").unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library;
    use crate::region::{PortSpec, RegionSpec, ResultSpec};

    fn sample() -> InstanceGraph {
        let lib = library::standard().unwrap();
        let float = lib.handles.float;
        let add = lib.symbols.lookup("Add").unwrap().id;
        let double = lib.symbols.lookup("Double").unwrap().id;
        let mut graph = InstanceGraph::new(lib.types, lib.symbols);
        let region = graph
            .create_region(RegionSpec::for_each(
                vec![PortSpec::splice("xs", float)],
                vec![ResultSpec::collect("ys", float)],
            ))
            .unwrap();
        graph.add_instance(add).unwrap();
        let d = graph.add_instance_in(double, Some(region)).unwrap();
        let port = graph.region_port_output(region, 0).unwrap();
        graph.connect(port.instance, port.index, d, 0).unwrap();
        let result = graph.region_result_input(region, 0).unwrap();
        graph.connect(d, 0, result.instance, result.index).unwrap();
        graph
    }

    #[test]
    fn valid_dot_structure() {
        let dot = emit_dot(&sample());
        assert!(dot.starts_with("digraph nodeflow {"));
        assert!(dot.trim_end().ends_with('}'));
        assert_eq!(dot.matches('{').count(), dot.matches('}').count());
    }

    #[test]
    fn regions_are_clusters() {
        let dot = emit_dot(&sample());
        assert!(dot.contains("subgraph cluster_r0 {"));
        assert!(dot.contains("label=\"r0 foreach (1 ports, 1 results)\""));
        assert!(dot.contains("n0 [label=\"r0 entry\", shape=invhouse"));
        assert!(dot.contains("n1 [label=\"r0 exit\", shape=house"));
        assert!(dot.contains("label=\"Double\\nn3\""));
    }

    #[test]
    fn edges_name_slots() {
        let dot = emit_dot(&sample());
        assert!(dot.contains("n0 -> n3 [label=\"xs → x\"];"));
        assert!(dot.contains("n3 -> n1 [label=\"out → ys\"];"));
    }

    #[test]
    fn deterministic_output() {
        assert_eq!(emit_dot(&sample()), emit_dot(&sample()));
    }
}

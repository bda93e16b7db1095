use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use nodeflow::document::{load_graph, GraphDocument};
use nodeflow::graph::{InputRef, InstanceGraph, OutputRef};
use nodeflow::region::{PortSpec, RegionSpec, ResultSpec};
use nodeflow::value::Value;
use nodeflow::*;

const FOREACH_DOCUMENT: &str = include_str!("../demos/foreach.json");

/// A linear chain of `len` Negate nodes behind one Constant.
fn chain(len: usize) -> (InstanceGraph, InputRef, OutputRef) {
    let lib = library::standard().unwrap();
    let constant = lib.symbols.lookup("Constant").unwrap().id;
    let negate = lib.symbols.lookup("Negate").unwrap().id;
    let mut graph = InstanceGraph::new(lib.types, lib.symbols);
    let source = graph.add_instance(constant).unwrap();
    let mut prev = source;
    for _ in 0..len {
        let next = graph.add_instance(negate).unwrap();
        graph.connect(prev, 0, next, 0).unwrap();
        prev = next;
    }
    (graph, InputRef::new(source, 0), OutputRef::new(prev, 0))
}

/// A ForEach region doubling `len` elements.
fn foreach(len: usize) -> (InstanceGraph, InputRef, OutputRef) {
    let lib = library::standard().unwrap();
    let float = lib.handles.float;
    let double = lib.symbols.lookup("Double").unwrap().id;
    let mut graph = InstanceGraph::new(lib.types, lib.symbols);
    let region = graph
        .create_region(RegionSpec::for_each(
            vec![PortSpec::splice("xs", float)],
            vec![ResultSpec::collect("ys", float)],
        ))
        .unwrap();
    let body = graph.add_instance_in(double, Some(region)).unwrap();
    let port = graph.region_port_output(region, 0).unwrap();
    graph.connect_slots(port, InputRef::new(body, 0)).unwrap();
    let result = graph.region_result_input(region, 0).unwrap();
    graph.connect_slots(OutputRef::new(body, 0), result).unwrap();
    let input = graph.region_port_input(region, 0).unwrap();
    let items: Vec<f64> = (0..len).map(|i| i as f64).collect();
    graph.set_input_value(input, Value::from(items)).unwrap();
    let target = graph.region_output(region, 0).unwrap();
    (graph, input, target)
}

fn bench_cold_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("cold_chain");
    for len in [10usize, 100, 200] {
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, &len| {
            b.iter_with_setup(
                || {
                    let (graph, _, target) = chain(len);
                    (Engine::new(graph, EngineConfig::default()), target)
                },
                |(engine, target)| {
                    let result = engine.evaluate(black_box(target), &engine.context(0.0)).unwrap();
                    black_box(result.value);
                },
            );
        });
    }
    group.finish();
}

fn bench_warm_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("warm_chain");
    for len in [10usize, 100, 200] {
        let (graph, _, target) = chain(len);
        let engine = Engine::new(graph, EngineConfig::default());
        engine.evaluate(target, &engine.context(0.0)).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, _| {
            b.iter(|| {
                let result = engine.evaluate(black_box(target), &engine.context(0.0)).unwrap();
                black_box(result.value);
            });
        });
    }
    group.finish();
}

fn bench_invalidate_and_pull(c: &mut Criterion) {
    let mut group = c.benchmark_group("invalidate_and_pull");
    for len in [10usize, 100, 200] {
        let (graph, source, target) = chain(len);
        let engine = Engine::new(graph, EngineConfig::default());
        let mut value = 0.0;
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, _| {
            b.iter(|| {
                value += 1.0;
                engine.edit(|g| g.set_input_value(source, Value::Float(value))).unwrap();
                let result = engine.evaluate(black_box(target), &engine.context(0.0)).unwrap();
                black_box(result.value);
            });
        });
    }
    group.finish();
}

fn bench_foreach(c: &mut Criterion) {
    let mut group = c.benchmark_group("foreach");
    for len in [16usize, 256, 1024] {
        let (graph, input, target) = foreach(len);
        let engine = Engine::new(graph, EngineConfig::default());
        let mut offset = 0.0;
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, &len| {
            b.iter(|| {
                offset += 1.0;
                let items: Vec<f64> = (0..len).map(|i| i as f64 + offset).collect();
                engine.edit(|g| g.set_input_value(input, Value::from(items))).unwrap();
                let result = engine.evaluate(black_box(target), &engine.context(0.0)).unwrap();
                black_box(result.value);
            });
        });
    }
    group.finish();
}

fn bench_load_document(c: &mut Criterion) {
    c.bench_function("load_document", |b| {
        b.iter(|| {
            let lib = library::standard().unwrap();
            let doc = GraphDocument::from_json(black_box(FOREACH_DOCUMENT)).unwrap();
            let loaded = load_graph(&doc, lib.types, lib.symbols).unwrap();
            black_box(loaded.graph.instance_count());
        });
    });
}

criterion_group!(
    benches,
    bench_cold_chain,
    bench_warm_chain,
    bench_invalidate_and_pull,
    bench_foreach,
    bench_load_document
);
criterion_main!(benches);

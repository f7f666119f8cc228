//! Benchmarks for plan compilation and definition resolution.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pipewright::definition::{resolve_str, PipelineDefinition, Stage};
use pipewright::plan::compile_plan;
use serde_json::Map;

/// A layered definition: `width` stages per layer, each depending on every
/// stage of the previous layer, with neighbours declared parallel.
fn layered(layers: usize, width: usize) -> PipelineDefinition {
    let mut stages = Vec::with_capacity(layers * width);
    for layer in 0..layers {
        for i in 0..width {
            let mut stage = Stage::new(format!("s{layer}_{i}"), "agent");
            let deps: Vec<String> = if layer == 0 {
                Vec::new()
            } else {
                (0..width).map(|j| format!("s{}_{j}", layer - 1)).collect()
            };
            stage.depends_on = Some(deps);
            if i + 1 < width {
                stage.parallel_with = vec![format!("s{layer}_{}", i + 1)];
            }
            stages.push(stage);
        }
    }
    PipelineDefinition::new("bench", stages)
}

fn yaml_document(stages: usize) -> String {
    let mut doc = String::from("name: bench\nsettings:\n  words: 1000\nstages:\n");
    for i in 0..stages {
        doc.push_str(&format!(
            "  - id: s{i}\n    agent: writer\n    config:\n      words: ${{settings.words}}\n      topic: ${{variables.topic || 'rust'}}\n"
        ));
    }
    doc
}

fn plan_benchmark(c: &mut Criterion) {
    let wide = layered(20, 25);
    c.bench_function("compile_plan_500_stages", |b| {
        b.iter(|| compile_plan(black_box(&wide)))
    });

    let doc = yaml_document(200);
    let vars = Map::new();
    c.bench_function("resolve_200_stage_document", |b| {
        b.iter(|| resolve_str(black_box(&doc), &vars))
    });
}

criterion_group!(benches, plan_benchmark);
criterion_main!(benches);

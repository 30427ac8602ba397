//! Benchmark suite for devloop hot paths.
//!
//! This module provides performance benchmarks for:
//! - Line diffing (patch reporting)
//! - Effective prompt assembly (every oracle call after planning)
//! - Sandbox request building (every execution)
//!
//! # Running Benchmarks
//!
//! ```bash
//! # Run all benchmarks
//! cargo bench
//!
//! # Save baseline for comparison
//! cargo bench -- --save-baseline main
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use devloop::diff::line_diff;
use devloop::sandbox::SandboxRequest;
use devloop::state::RunState;
use devloop::template::TemplateRegistry;
use std::collections::BTreeMap;
use std::time::Duration;

fn source_file(lines: usize, variant: &str) -> String {
    (0..lines)
        .map(|i| {
            if i % 10 == 0 {
                format!("    value_{} = compute('{}', {})\n", i, variant, i)
            } else {
                format!("    value_{} = compute('base', {})\n", i, i)
            }
        })
        .collect()
}

fn state_with_layers(layers: usize, files: usize) -> RunState {
    let mut state = RunState::new("Create a Tic-Tac-Toe game.", vec!["pytest".into()]);
    for i in 0..layers {
        state.push_package_layer(vec![format!("package-{}", i)]);
        state.push_command_layer(vec![format!("apt-get install -y lib{}", i)]);
    }
    let code: BTreeMap<String, String> = (0..files)
        .map(|i| (format!("app/module_{}.py", i), source_file(50, "x")))
        .collect();
    state.set_initial_code(code).expect("fresh state has no code");
    state
}

// ============================================================================
// Diff Benchmarks
// ============================================================================

fn bench_line_diff(c: &mut Criterion) {
    let mut group = c.benchmark_group("line_diff");

    for lines in [50, 200, 800] {
        let original = source_file(lines, "old");
        let modified = source_file(lines, "new");
        group.throughput(Throughput::Elements(lines as u64));
        group.bench_with_input(BenchmarkId::from_parameter(lines), &lines, |b, _| {
            b.iter(|| line_diff(black_box(&original), black_box(&modified)));
        });
    }

    group.finish();
}

// ============================================================================
// Prompt / Request Benchmarks
// ============================================================================

fn bench_effective_prompt(c: &mut Criterion) {
    let mut group = c.benchmark_group("effective_prompt");

    for layers in [1, 10, 50] {
        let state = state_with_layers(layers, 0);
        group.bench_with_input(BenchmarkId::from_parameter(layers), &layers, |b, _| {
            b.iter(|| black_box(&state).effective_prompt());
        });
    }

    group.finish();
}

fn bench_sandbox_request(c: &mut Criterion) {
    let registry = TemplateRegistry::builtin();
    let template = registry.get("python").expect("builtin template").clone();
    let state = state_with_layers(10, 20);

    c.bench_function("sandbox_request_from_state", |b| {
        b.iter(|| {
            SandboxRequest::from_state(
                black_box(&template),
                black_box(&state),
                Duration::from_secs(120),
            )
            .build
            .to_dockerfile()
        });
    });
}

criterion_group!(
    benches,
    bench_line_diff,
    bench_effective_prompt,
    bench_sandbox_request
);
criterion_main!(benches);

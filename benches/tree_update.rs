//! Alarm tree update benchmarks

use alarm_server::tree::{GroupConfig, PvConfig};
use alarm_server::{AlarmState, AlarmTree, SeverityLevel};
use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn create_tree(groups: usize, pvs_per_group: usize) -> (AlarmTree, Vec<String>) {
    let tree = AlarmTree::new("Bench").unwrap();
    let mut leaves = Vec::with_capacity(groups * pvs_per_group);
    for g in 0..groups {
        let area = tree
            .add_group("/Bench", &format!("area_{}", g), GroupConfig::default())
            .unwrap();
        let system = tree
            .add_group(&area, "system", GroupConfig::default())
            .unwrap();
        for p in 0..pvs_per_group {
            let pv = tree
                .add_pv(&system, &format!("pv_{}", p), PvConfig::default())
                .unwrap();
            leaves.push(pv);
        }
    }
    (tree, leaves)
}

fn bench_pv_updates(c: &mut Criterion) {
    let mut group = c.benchmark_group("pv_update");
    for size in [10, 100, 1000] {
        let (tree, leaves) = create_tree(10, size / 10);
        let states = [
            AlarmState::new(SeverityLevel::Minor, "LOW", "1", Utc::now()),
            AlarmState::new(SeverityLevel::Major, "LOLO", "0", Utc::now()),
            AlarmState::ok(),
        ];
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            let mut i = 0usize;
            b.iter(|| {
                let path = &leaves[i % leaves.len()];
                let state = &states[i % states.len()];
                tree.update_pv(black_box(path), black_box(state)).unwrap();
                if i % 7 == 0 {
                    tree.acknowledge(path, true).unwrap();
                }
                i += 1;
            });
        });
    }
    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let (tree, leaves) = create_tree(10, 100);
    for (i, leaf) in leaves.iter().enumerate().filter(|(i, _)| i % 3 == 0) {
        let severity = if i % 2 == 0 {
            SeverityLevel::Minor
        } else {
            SeverityLevel::Major
        };
        tree.update_pv(leaf, &AlarmState::new(severity, "", "", Utc::now()))
            .unwrap();
    }
    c.bench_function("root_snapshot_1000_pvs", |b| {
        b.iter(|| black_box(tree.snapshot("/Bench").unwrap()))
    });
}

criterion_group!(benches, bench_pv_updates, bench_snapshot);
criterion_main!(benches);

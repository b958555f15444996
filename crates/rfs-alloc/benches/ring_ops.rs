//! Benchmark: allocator churn over an in-memory ring.
//!
//! Measures first-fit allocation on a fragmented ring and a full
//! allocate/free cycle that exercises splitting and coalescing.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use rfs_alloc::{FormatOptions, Ring};
use rfs_block::MemRegion;
use rfs_types::NodeOffset;

const REGION_LEN: usize = 4 * 1024 * 1024;

/// Ring with every other node freed, so first fit has to skip holes.
fn fragmented() -> (Ring<MemRegion>, Vec<NodeOffset>) {
    let mut ring =
        Ring::format(MemRegion::new(REGION_LEN), &FormatOptions::default()).expect("format");
    let mut nodes = Vec::new();
    for _ in 0..512 {
        nodes.push(ring.allocate(256, None).expect("allocate"));
    }
    let mut kept = Vec::new();
    for (i, node) in nodes.into_iter().enumerate() {
        if i % 2 == 0 {
            ring.free(node).expect("free");
        } else {
            kept.push(node);
        }
    }
    (ring, kept)
}

fn bench_allocate(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocate");

    group.bench_function("first_fit_past_holes", |b| {
        let (mut ring, _) = fragmented();
        b.iter(|| {
            // Larger than any hole: scans the whole ring before the tail.
            let node = ring.allocate(black_box(4096), None).expect("allocate");
            ring.free(node).expect("free");
        });
    });

    group.bench_function("fits_first_hole", |b| {
        let (mut ring, _) = fragmented();
        b.iter(|| {
            let node = ring.allocate(black_box(128), None).expect("allocate");
            ring.free(node).expect("free");
        });
    });

    group.finish();
}

fn bench_resize(c: &mut Criterion) {
    let mut group = c.benchmark_group("resize");

    group.bench_function("grow_shrink_in_place", |b| {
        let mut ring =
            Ring::format(MemRegion::new(REGION_LEN), &FormatOptions::default()).expect("format");
        let node = ring.allocate(64, None).expect("allocate");
        b.iter(|| {
            let node = ring.resize(node, black_box(8192)).expect("grow");
            ring.resize(node, black_box(64)).expect("shrink");
        });
    });

    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let (ring, _) = fragmented();
    c.bench_function("find_by_name_miss", |b| {
        b.iter(|| black_box(ring.find_by_name(black_box(b"absent"), false).expect("scan")));
    });
}

criterion_group!(benches, bench_allocate, bench_resize, bench_lookup);
criterion_main!(benches);

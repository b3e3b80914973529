use criterion::{black_box, criterion_group, criterion_main, Criterion};
use kdthree::{BoundingBox, KdTree, Point, TreeConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const NUM_POINTS: usize = 10_000;

fn cloud(n: usize) -> Vec<Point> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..n)
        .map(|_| {
            Point::xyz(
                rng.gen_range(-25.0..25.0),
                rng.gen_range(-25.0..25.0),
                rng.gen_range(-25.0..25.0),
            )
        })
        .collect()
}

fn benchmark_bulk_build(c: &mut Criterion) {
    let points = cloud(NUM_POINTS);
    c.bench_function(&format!("build_{}_points", NUM_POINTS), |b| {
        let tree: KdTree = KdTree::new();
        b.iter(|| {
            tree.build(black_box(&points));
        })
    });
}

fn benchmark_incremental_insert(c: &mut Criterion) {
    let points = cloud(NUM_POINTS);
    c.bench_function(&format!("add_{}_points_one_by_one", NUM_POINTS), |b| {
        b.iter(|| {
            let tree: KdTree = KdTree::new();
            for p in &points {
                tree.add_points(std::slice::from_ref(black_box(p)), false);
            }
            tree.size()
        })
    });
}

fn benchmark_downsampled_insert(c: &mut Criterion) {
    let points = cloud(NUM_POINTS);
    c.bench_function(&format!("downsample_add_{}_points", NUM_POINTS), |b| {
        b.iter(|| {
            let tree: KdTree =
                KdTree::with_config(TreeConfig::default().with_downsample_size(0.5));
            tree.add_points(black_box(&points), true)
        })
    });
}

fn benchmark_knn(c: &mut Criterion) {
    let points = cloud(NUM_POINTS);
    let tree: KdTree = KdTree::new();
    tree.build(&points);
    let mut rng = StdRng::seed_from_u64(7);
    let queries: Vec<[f64; 3]> = (0..256)
        .map(|_| {
            [
                rng.gen_range(-25.0..25.0),
                rng.gen_range(-25.0..25.0),
                rng.gen_range(-25.0..25.0),
            ]
        })
        .collect();

    c.bench_function("knn_5_on_10k_points", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % queries.len();
            tree.knn_search(black_box(queries[i]), 5, None)
        })
    });
}

fn benchmark_box_search(c: &mut Criterion) {
    let points = cloud(NUM_POINTS);
    let tree: KdTree = KdTree::new();
    tree.build(&points);

    c.bench_function("box_search_on_10k_points", |b| {
        let query = BoundingBox::new([-5.0; 3], [5.0; 3]);
        b.iter(|| tree.box_search(black_box(&query)))
    });
}

criterion_group!(
    benches,
    benchmark_bulk_build,
    benchmark_incremental_insert,
    benchmark_downsampled_insert,
    benchmark_knn,
    benchmark_box_search
);
criterion_main!(benches);

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use kdthree::{BoundingBox, KdTree, Point, TreeConfig};
use rand::Rng;

fn random_cloud(n: usize, extent: f64) -> Vec<Point> {
    let mut rng = rand::thread_rng();
    (0..n)
        .map(|_| {
            Point::xyz(
                rng.gen_range(-extent..extent),
                rng.gen_range(-extent..extent),
                rng.gen_range(-extent..extent),
            )
        })
        .collect()
}

fn key(p: &Point) -> (u64, u64, u64) {
    (p.x.to_bits(), p.y.to_bits(), p.z.to_bits())
}

/// Block until no background rebuild is pending; panics if it never settles.
fn await_quiescence(tree: &KdTree) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while tree.rebuilding() {
        assert!(
            Instant::now() < deadline,
            "background rebuild did not settle"
        );
        thread::sleep(Duration::from_millis(1));
    }
    // let the final swap publish through the state lock
    thread::sleep(Duration::from_millis(5));
}

#[test]
fn background_rebuild_preserves_the_live_set() {
    // a low offload threshold plus sorted inserts forces background rebuilds
    let tree: KdTree = KdTree::with_config(TreeConfig::default().with_rebuild_threshold(300));
    let points: Vec<Point> = (0..4000)
        .map(|i| Point::xyz(i as f64 * 0.01, (i % 17) as f64, (i % 5) as f64))
        .collect();

    for p in &points {
        tree.add_points(std::slice::from_ref(p), false);
    }
    await_quiescence(&tree);

    assert_eq!(tree.size(), 4000);
    assert_eq!(tree.valid_count(), 4000);

    let everything = BoundingBox::new([-1.0; 3], [100.0; 3]);
    let live = tree.box_search(&everything);
    let got: HashSet<_> = live.iter().map(key).collect();
    let want: HashSet<_> = points.iter().map(key).collect();
    assert_eq!(got, want, "rebuilds must not change the observable set");

    // nearest-neighbour answers stay exact after the rebuild churn
    let (pts, d_sq) = tree.knn_search([20.0, 8.0, 2.0], 4, None);
    assert_eq!(pts.len(), 4);
    for w in d_sq.windows(2) {
        assert!(w[0] <= w[1]);
    }
}

#[test]
fn removed_points_surface_after_background_reclamation() {
    let tree: KdTree = KdTree::with_config(TreeConfig::default().with_rebuild_threshold(500));
    let cloud = random_cloud(2000, 10.0);
    tree.build(&cloud);

    // delete well past the garbage criterion so a rebuild must fire
    let slab = BoundingBox::new([-10.5, -10.5, -10.5], [10.5, 10.5, 2.0]);
    let removed = tree.delete_boxes(&[slab]);
    let expected: HashSet<_> = cloud
        .iter()
        .filter(|p| slab.contains(p.pos()))
        .map(key)
        .collect();
    assert_eq!(removed, expected.len());

    await_quiescence(&tree);

    let mut drained: Vec<Point> = tree.acquire_removed_points();

    // lazily deleted points surface as rebuilds reclaim them; tighten the
    // garbage criterion and nudge the tree until everything has been swept
    tree.set_delete_criterion_param(0.001);
    for _ in 0..25 {
        if drained.len() == expected.len() {
            break;
        }
        tree.delete_points(&[Point::xyz(99.0, 99.0, 99.0)]);
        await_quiescence(&tree);
        drained.extend(tree.acquire_removed_points());
    }

    let got: HashSet<_> = drained.iter().map(key).collect();
    assert_eq!(got.len(), drained.len(), "a point was reported twice");
    assert_eq!(got, expected, "reclamation must surface the whole slab");
    assert!(tree.acquire_removed_points().is_empty());
    assert_eq!(tree.valid_count(), 2000 - expected.len());
}

#[test]
fn searches_stay_consistent_under_concurrent_mutation() {
    let tree: KdTree = KdTree::with_config(TreeConfig::default().with_rebuild_threshold(400));
    let universe = random_cloud(3000, 10.0);
    tree.build(&universe[..1500]);

    let universe_keys: HashSet<_> = universe.iter().map(key).collect();
    let stop = AtomicBool::new(false);

    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                let mut rng = rand::thread_rng();
                while !stop.load(Ordering::Relaxed) {
                    let q = [
                        rng.gen_range(-10.0..10.0),
                        rng.gen_range(-10.0..10.0),
                        rng.gen_range(-10.0..10.0),
                    ];
                    let (pts, d_sq) = tree.knn_search(q, 5, None);
                    assert!(pts.len() <= 5);
                    for w in d_sq.windows(2) {
                        assert!(w[0] <= w[1], "knn result must stay sorted");
                    }
                    for p in &pts {
                        assert!(
                            universe_keys.contains(&key(p)),
                            "search returned a point that was never inserted"
                        );
                    }
                    for p in tree.radius_search(q, 2.0) {
                        assert!(universe_keys.contains(&key(&p)));
                    }
                }
            });
        }

        // the mutating client: grow and shrink the live set while the
        // searchers and the rebuild thread run
        let mut rng = rand::thread_rng();
        let mut live: Vec<Point> = universe[..1500].to_vec();
        let mut parked: Vec<Point> = universe[1500..].to_vec();
        for _ in 0..12_000 {
            if parked.is_empty() || (!live.is_empty() && rng.gen_bool(0.45)) {
                let idx = rng.gen_range(0..live.len());
                let p = live.swap_remove(idx);
                tree.delete_points(std::slice::from_ref(&p));
                parked.push(p);
            } else {
                let idx = rng.gen_range(0..parked.len());
                let p = parked.swap_remove(idx);
                tree.add_points(std::slice::from_ref(&p), false);
                live.push(p);
            }
        }
        stop.store(true, Ordering::Relaxed);

        await_quiescence(&tree);
        let everything = BoundingBox::new([-11.0; 3], [11.0; 3]);
        let got: HashSet<_> = tree.box_search(&everything).iter().map(key).collect();
        let want: HashSet<_> = live.iter().map(key).collect();
        assert_eq!(got, want, "final live set diverged from the model");
        assert_eq!(tree.valid_count(), want.len());
    });
}

#[test]
fn dropping_the_tree_joins_the_rebuild_thread() {
    // churn enough to leave a rebuild in flight, then drop immediately
    let tree: KdTree = KdTree::with_config(TreeConfig::default().with_rebuild_threshold(200));
    for i in 0..1000 {
        tree.add_points(&[Point::xyz(i as f64, 0.0, 0.0)], false);
    }
    drop(tree);
}

#[test]
fn stats_remain_available_during_rebuild_churn() {
    let tree: KdTree = KdTree::with_config(TreeConfig::default().with_rebuild_threshold(250));
    for i in 0..2000 {
        tree.add_points(&[Point::xyz(i as f64 * 0.1, (i % 3) as f64, 0.0)], false);
        if i % 64 == 0 {
            // must never block or panic, whatever the rebuild thread is doing
            let _ = tree.size();
            let _ = tree.valid_count();
            let _ = tree.root_range();
            let _ = tree.root_alpha();
        }
    }
    await_quiescence(&tree);
    assert_eq!(tree.size(), 2000);
}

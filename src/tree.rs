//! The public incremental k-d tree: configuration, shared state, and the
//! operation surface clients program against.

use std::collections::BinaryHeap;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::RwLock;

use crate::bounds::BoundingBox;
use crate::build;
use crate::coord::Coordinator;
use crate::node::{Arena, Edge, NodeId, Side};
use crate::oplog::Operation;
use crate::ops::{self, OpCtx};
use crate::point::{dist_sq, same_position, Point};
use crate::query::{self, QueryCtx};
use crate::rebuild;

/// Tuning knobs, all settable at construction; the rebuild criteria and the
/// voxel size also have live setters on [`KdTree`].
#[derive(Clone, Copy, Debug)]
pub struct TreeConfig {
    /// Fraction of lazily deleted nodes above which a subtree is rebuilt.
    pub delete_criterion: f64,
    /// Child-size fraction beyond which a subtree counts as unbalanced.
    pub balance_criterion: f64,
    /// Voxel edge length used by downsampling inserts.
    pub downsample_size: f64,
    /// Operation log capacity. Overflow is fatal: sustained mutation beyond
    /// rebuild bandwidth has no recovery.
    pub max_log_len: usize,
    /// Subtree size at which rebuilds are offloaded to the background thread.
    pub rebuild_threshold: usize,
    /// Subtrees at or below this size are never rebuilt.
    pub min_unbalanced_size: usize,
    /// Absolute tolerance for coordinate equality.
    pub eps: f64,
}

impl Default for TreeConfig {
    fn default() -> Self {
        TreeConfig {
            delete_criterion: 0.5,
            balance_criterion: 0.7,
            downsample_size: 0.2,
            max_log_len: 1_000_000,
            rebuild_threshold: 1500,
            min_unbalanced_size: 10,
            eps: 1e-6,
        }
    }
}

impl TreeConfig {
    pub fn with_delete_criterion(mut self, v: f64) -> Self {
        self.delete_criterion = v;
        self
    }

    pub fn with_balance_criterion(mut self, v: f64) -> Self {
        self.balance_criterion = v;
        self
    }

    pub fn with_downsample_size(mut self, v: f64) -> Self {
        self.downsample_size = v;
        self
    }

    pub fn with_max_log_len(mut self, v: usize) -> Self {
        self.max_log_len = v;
        self
    }

    pub fn with_rebuild_threshold(mut self, v: usize) -> Self {
        self.rebuild_threshold = v;
        self
    }

    pub fn with_min_unbalanced_size(mut self, v: usize) -> Self {
        self.min_unbalanced_size = v;
        self
    }

    pub fn with_eps(mut self, v: f64) -> Self {
        self.eps = v;
        self
    }
}

/// Everything behind the state lock: the node arena, the sentinel whose left
/// edge owns the real root, and the configuration.
#[derive(Clone, Debug)]
pub(crate) struct TreeState<D> {
    pub arena: Arena<D>,
    pub sentinel: NodeId,
    pub config: TreeConfig,
}

impl<D> TreeState<D> {
    #[inline]
    pub(crate) fn root(&self) -> Option<NodeId> {
        self.arena.node(self.sentinel).left
    }

    #[inline]
    pub(crate) fn root_edge(&self) -> Edge {
        Edge::new(self.sentinel, Side::Left)
    }
}

/// State shared with the background rebuild thread.
pub(crate) struct Shared<D> {
    pub state: RwLock<TreeState<D>>,
    pub coord: Coordinator<D>,
}

/// An incremental k-d tree over 3D points.
///
/// Supports interleaved insertion, lazy point and box deletion, box
/// restoration, voxel downsampling on insert, box/radius/k-nearest queries,
/// and keeps itself approximately balanced through partial rebuilds. Small
/// unbalanced subtrees are rebuilt inline; large ones are handed to a
/// dedicated background thread that rebuilds them without blocking
/// concurrent queries.
///
/// Searches may be called from any number of threads concurrently with each
/// other and with mutation. Mutating operations are intended for a single
/// client thread; calls from several threads are serialised internally.
///
/// ```
/// use kdthree::{KdTree, Point};
///
/// let tree: KdTree = KdTree::new();
/// tree.build(&[
///     Point::xyz(0.0, 0.0, 0.0),
///     Point::xyz(1.0, 0.0, 0.0),
///     Point::xyz(1.0, 1.0, 1.0),
/// ]);
/// let (nearest, d_sq) = tree.knn_search([0.9, 0.9, 0.9], 1, None);
/// assert_eq!(nearest[0].pos(), [1.0, 1.0, 1.0]);
/// assert!((d_sq[0] - 0.03).abs() < 1e-9);
/// ```
pub struct KdTree<D = ()> {
    shared: Arc<Shared<D>>,
    rebuilder: Option<JoinHandle<()>>,
}

impl<D> KdTree<D>
where
    D: Clone + Default + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::with_config(TreeConfig::default())
    }

    pub fn with_config(config: TreeConfig) -> Self {
        let (arena, sentinel) = build::build_arena::<D>(&mut []);
        let shared = Arc::new(Shared {
            state: RwLock::new(TreeState {
                arena,
                sentinel,
                config,
            }),
            coord: Coordinator::new(config.max_log_len),
        });
        let rebuilder = rebuild::spawn(Arc::clone(&shared));
        KdTree {
            shared,
            rebuilder: Some(rebuilder),
        }
    }

    /// Replace the entire tree with a balanced build over `points`. An empty
    /// slice yields an empty tree.
    pub fn build(&self, points: &[Point<D>]) {
        let mut state = self.shared.state.write();
        // orphan any in-flight background pass; it notices at swap time
        *self.shared.coord.rebuild_target.lock() = None;
        self.shared.coord.log.lock().clear();

        let config = state.config;
        let mut scratch = points.to_vec();
        let (arena, sentinel) = build::build_arena(&mut scratch);
        *state = TreeState {
            arena,
            sentinel,
            config,
        };
        let state = &mut *state;
        if let Some(root) = state.root() {
            ops::update(&mut state.arena, state.sentinel, root);
        }
    }

    /// Insert points one by one. With `downsample` set, each point is folded
    /// into its voxel cell: of the cell's occupants and the incoming point,
    /// only the one closest to the cell centre survives. Returns the number
    /// of effective downsampling inserts; plain inserts are not counted.
    pub fn add_points(&self, points: &[Point<D>], downsample: bool) -> usize {
        let mut effective_inserts = 0;
        for point in points {
            let mut state = self.shared.state.write();
            let state = &mut *state;
            let target = *self.shared.coord.rebuild_target.lock();
            let root_edge = state.root_edge();
            let at_root = target == Some(root_edge);
            let cfg = state.config;

            if downsample {
                let cell = BoundingBox::voxel_of(point.pos(), cfg.downsample_size);
                let center = cell.center();
                let mut occupants = Vec::new();
                {
                    let qctx = QueryCtx {
                        arena: &state.arena,
                        coord: &self.shared.coord,
                        target: None,
                    };
                    query::box_search(&qctx, state.root(), None, &cell, &mut occupants);
                }
                let mut chosen = point.clone();
                let mut best = dist_sq(point.pos(), center);
                for p in &occupants {
                    let d = dist_sq(p.pos(), center);
                    if d < best {
                        best = d;
                        chosen = p.clone();
                    }
                }
                // keep going only if the cell had competition or the incoming
                // point wins it
                if occupants.len() > 1 || same_position(point, &chosen, cfg.eps) {
                    let had_occupants = !occupants.is_empty();
                    let mut ctx = OpCtx {
                        arena: &mut state.arena,
                        sentinel: state.sentinel,
                        cfg,
                        coord: Some(&self.shared.coord),
                        target,
                    };
                    if had_occupants {
                        ops::delete_by_range(&mut ctx, root_edge, &cell, !at_root, true);
                    }
                    let axis = ctx
                        .child_of(root_edge)
                        .map_or(0, |r| ctx.arena.node(r).axis);
                    ops::add_by_point(&mut ctx, root_edge, &chosen, !at_root, axis);
                    if at_root {
                        if had_occupants {
                            self.shared
                                .coord
                                .log_if_rebuilding(Operation::DownsampleDelete(cell));
                        }
                        self.shared
                            .coord
                            .log_if_rebuilding(Operation::AddPoint(chosen.clone()));
                    }
                    effective_inserts += 1;
                }
            } else {
                let mut ctx = OpCtx {
                    arena: &mut state.arena,
                    sentinel: state.sentinel,
                    cfg,
                    coord: Some(&self.shared.coord),
                    target,
                };
                let axis = ctx
                    .child_of(root_edge)
                    .map_or(0, |r| ctx.arena.node(r).axis);
                ops::add_by_point(&mut ctx, root_edge, point, !at_root, axis);
                if at_root {
                    self.shared
                        .coord
                        .log_if_rebuilding(Operation::AddPoint(point.clone()));
                }
            }
        }
        effective_inserts
    }

    /// Lazily delete every node whose coordinates match one of `points`
    /// within epsilon. Missing points are silent no-ops.
    pub fn delete_points(&self, points: &[Point<D>]) {
        for point in points {
            let mut state = self.shared.state.write();
            let state = &mut *state;
            let target = *self.shared.coord.rebuild_target.lock();
            let root_edge = state.root_edge();
            let at_root = target == Some(root_edge);
            let cfg = state.config;
            let mut ctx = OpCtx {
                arena: &mut state.arena,
                sentinel: state.sentinel,
                cfg,
                coord: Some(&self.shared.coord),
                target,
            };
            ops::delete_by_point(&mut ctx, root_edge, point, !at_root);
            if at_root {
                self.shared
                    .coord
                    .log_if_rebuilding(Operation::DeletePoint(point.clone()));
            }
        }
    }

    /// Restore lazily deleted points inside each box. Downsample deletions
    /// are not restorable.
    pub fn add_boxes(&self, boxes: &[BoundingBox]) {
        for bx in boxes {
            let mut state = self.shared.state.write();
            let state = &mut *state;
            let target = *self.shared.coord.rebuild_target.lock();
            let root_edge = state.root_edge();
            let at_root = target == Some(root_edge);
            let cfg = state.config;
            let mut ctx = OpCtx {
                arena: &mut state.arena,
                sentinel: state.sentinel,
                cfg,
                coord: Some(&self.shared.coord),
                target,
            };
            ops::add_by_range(&mut ctx, root_edge, bx, !at_root);
            if at_root {
                self.shared.coord.log_if_rebuilding(Operation::AddBox(*bx));
            }
        }
    }

    /// Lazily delete every live point inside each box. Returns how many were
    /// removed.
    pub fn delete_boxes(&self, boxes: &[BoundingBox]) -> usize {
        let mut removed = 0usize;
        for bx in boxes {
            let mut state = self.shared.state.write();
            let state = &mut *state;
            let target = *self.shared.coord.rebuild_target.lock();
            let root_edge = state.root_edge();
            let at_root = target == Some(root_edge);
            let cfg = state.config;
            let mut ctx = OpCtx {
                arena: &mut state.arena,
                sentinel: state.sentinel,
                cfg,
                coord: Some(&self.shared.coord),
                target,
            };
            removed += ops::delete_by_range(&mut ctx, root_edge, bx, !at_root, false) as usize;
            if at_root {
                self.shared
                    .coord
                    .log_if_rebuilding(Operation::DeleteBox(*bx));
            }
        }
        removed
    }

    /// All live points inside `query` (min-inclusive, max-exclusive).
    pub fn box_search(&self, query: &BoundingBox) -> Vec<Point<D>> {
        let state = self.shared.state.read();
        let target = *self.shared.coord.rebuild_target.lock();
        let guarded = target == Some(state.root_edge());
        let qctx = QueryCtx {
            arena: &state.arena,
            coord: &self.shared.coord,
            target,
        };
        let mut out = Vec::new();
        self.with_root_guard(guarded, || {
            query::box_search(&qctx, state.root(), None, query, &mut out)
        });
        out
    }

    /// All live points with squared distance to `center` at most `radius²`.
    pub fn radius_search(&self, center: [f64; 3], radius: f64) -> Vec<Point<D>> {
        let state = self.shared.state.read();
        let target = *self.shared.coord.rebuild_target.lock();
        let guarded = target == Some(state.root_edge());
        let qctx = QueryCtx {
            arena: &state.arena,
            coord: &self.shared.coord,
            target,
        };
        let mut out = Vec::new();
        self.with_root_guard(guarded, || {
            query::radius_search(&qctx, state.root(), None, center, radius, &mut out)
        });
        out
    }

    /// Up to `k` nearest live points to `query`, sorted by increasing squared
    /// distance, with their squared distances. `max_dist` optionally caps the
    /// search radius.
    pub fn knn_search(
        &self,
        query: [f64; 3],
        k: usize,
        max_dist: Option<f64>,
    ) -> (Vec<Point<D>>, Vec<f64>) {
        if k == 0 {
            return (Vec::new(), Vec::new());
        }
        let max_dist_sq = max_dist.map_or(f64::INFINITY, |d| d * d);
        let state = self.shared.state.read();
        let target = *self.shared.coord.rebuild_target.lock();
        let guarded = target == Some(state.root_edge());
        let qctx = QueryCtx {
            arena: &state.arena,
            coord: &self.shared.coord,
            target,
        };
        let mut heap = BinaryHeap::new();
        self.with_root_guard(guarded, || {
            query::knn_search(&qctx, state.root(), None, query, k, max_dist_sq, &mut heap)
        });

        let sorted = heap.into_sorted_vec();
        let mut points = Vec::with_capacity(sorted.len());
        let mut dists = Vec::with_capacity(sorted.len());
        for nb in sorted {
            points.push(nb.point);
            dists.push(nb.dist_sq);
        }
        (points, dists)
    }

    /// Total nodes in the tree, live and lazily deleted alike. Best-effort
    /// under a concurrent rebuild: may serve the value cached when the
    /// rebuild started.
    pub fn size(&self) -> usize {
        match self.shared.state.try_read() {
            Some(state) => state.root().map_or(0, |r| state.arena.node(r).size as usize),
            None => self.shared.coord.stats.lock().size,
        }
    }

    /// Live points in the tree. Best-effort like [`size`](Self::size).
    pub fn valid_count(&self) -> usize {
        match self.shared.state.try_read() {
            Some(state) => state.root().map_or(0, |r| {
                let n = state.arena.node(r);
                (n.size - n.invalid) as usize
            }),
            None => self.shared.coord.stats.lock().valid,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Hull of the whole tree. Zero box when empty.
    pub fn root_range(&self) -> BoundingBox {
        match self.shared.state.try_read() {
            Some(state) => state
                .root()
                .map_or(BoundingBox::new([0.0; 3], [0.0; 3]), |r| {
                    state.arena.node(r).aabb
                }),
            None => self.shared.coord.stats.lock().range,
        }
    }

    /// The root balance and garbage metrics `(alpha_bal, alpha_del)`.
    pub fn root_alpha(&self) -> (f64, f64) {
        match self.shared.state.try_read() {
            Some(state) => state.root().map_or((0.5, 0.0), |r| {
                let n = state.arena.node(r);
                (n.alpha_bal, n.alpha_del)
            }),
            None => {
                let stats = self.shared.coord.stats.lock();
                (stats.alpha_bal, stats.alpha_del)
            }
        }
    }

    /// Points removed since the last call, covering explicit deletions plus
    /// rebuild reclamation from both threads. Draining: a second call
    /// returns empty.
    pub fn acquire_removed_points(&self) -> Vec<Point<D>> {
        let mut removed = self.shared.coord.removed.lock();
        let mut out = Vec::with_capacity(removed.foreground.len() + removed.background.len());
        out.append(&mut removed.foreground);
        out.append(&mut removed.background);
        out
    }

    /// Deepest operation-log fill level ever observed. Diagnostic gauge only.
    pub fn log_high_water(&self) -> usize {
        self.shared.coord.log.lock().high_water()
    }

    /// Whether a background rebuild is pending or in flight.
    pub fn rebuilding(&self) -> bool {
        self.shared.coord.rebuild_target.lock().is_some()
    }

    pub fn set_delete_criterion_param(&self, v: f64) {
        self.shared.state.write().config.delete_criterion = v;
    }

    pub fn set_balance_criterion_param(&self, v: f64) {
        self.shared.state.write().config.balance_criterion = v;
    }

    pub fn set_downsample_size(&self, v: f64) {
        self.shared.state.write().config.downsample_size = v;
    }

    fn with_root_guard<R>(&self, guarded: bool, f: impl FnOnce() -> R) -> R {
        if guarded {
            self.shared.coord.search.enter();
        }
        let out = f();
        if guarded {
            self.shared.coord.search.exit();
        }
        out
    }
}

impl<D> Default for KdTree<D>
where
    D: Clone + Default + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<D> fmt::Debug for KdTree<D>
where
    D: Clone + Default + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KdTree")
            .field("size", &self.size())
            .field("valid", &self.valid_count())
            .field("rebuilding", &self.rebuilding())
            .finish_non_exhaustive()
    }
}

impl<D> Drop for KdTree<D> {
    fn drop(&mut self) {
        self.shared.coord.terminate.store(true, Ordering::Release);
        if let Some(handle) = self.rebuilder.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeFlags;
    use crate::ops::flatten_live;
    use rand::Rng;

    /// Deliver every pending push so the checker can verify plain sums.
    fn push_all(ctx: &mut OpCtx<'_, ()>, id: Option<NodeId>) {
        let Some(id) = id else { return };
        ops::push_down(ctx, id);
        let (l, r) = {
            let n = ctx.arena.node(id);
            (n.left, n.right)
        };
        push_all(ctx, l);
        push_all(ctx, r);
    }

    /// Verify the structural invariants of a fully materialised subtree:
    /// counter sums, subtree-deleted recomputation, flag implications, the
    /// split-axis ordering of live points, parent backlinks and hull
    /// containment. Returns (size, invalid, down_del, live positions).
    fn check_subtree(
        arena: &Arena<()>,
        id: NodeId,
        parent: Option<NodeId>,
    ) -> (u32, u32, u32, Vec<[f64; 3]>) {
        let n = arena.node(id);
        assert_eq!(n.parent, parent, "parent backlink broken");
        let pd = n.flags.contains(NodeFlags::POINT_DELETED);
        let pdd = n.flags.contains(NodeFlags::POINT_DOWNSAMPLED);
        let td = n.flags.contains(NodeFlags::TREE_DELETED);
        let tdd = n.flags.contains(NodeFlags::TREE_DOWNSAMPLED);
        if pdd {
            assert!(pd, "downsample-deleted point must be deleted");
        }
        if tdd {
            assert!(td, "downsample-deleted subtree must be deleted");
        }

        let mut size = 1u32;
        let mut invalid = pd as u32;
        let mut down = pdd as u32;
        let mut live = Vec::new();
        if !pd {
            live.push(n.point.pos());
        }
        let mut child_td = [true, true];
        let mut child_tdd = [true, true];
        for (i, (side, child)) in [(Side::Left, n.left), (Side::Right, n.right)]
            .into_iter()
            .enumerate()
        {
            let Some(c) = child else { continue };
            child_td[i] = arena.node(c).flags.contains(NodeFlags::TREE_DELETED);
            child_tdd[i] = arena.node(c).flags.contains(NodeFlags::TREE_DOWNSAMPLED);
            let (s, inv, d, l) = check_subtree(arena, c, Some(id));
            let pivot = n.point.coord(n.axis);
            for p in &l {
                match side {
                    Side::Left => assert!(
                        p[n.axis as usize] < pivot,
                        "left subtree point beyond the pivot"
                    ),
                    Side::Right => assert!(
                        p[n.axis as usize] >= pivot,
                        "right subtree point below the pivot"
                    ),
                }
            }
            size += s;
            invalid += inv;
            down += d;
            live.extend(l);
        }

        assert_eq!(n.size, size, "subtree size out of date");
        assert_eq!(n.invalid, invalid, "invalid counter out of date");
        assert_eq!(n.down_del, down, "downsample counter out of date");
        assert_eq!(td, pd && child_td[0] && child_td[1]);
        assert_eq!(tdd, pdd && child_tdd[0] && child_tdd[1]);
        for p in &live {
            for a in 0..3 {
                assert!(
                    n.aabb.min[a] <= p[a] && p[a] <= n.aabb.max[a],
                    "live point escapes the subtree hull"
                );
            }
        }
        (size, invalid, down, live)
    }

    fn check_invariants(tree: &KdTree) {
        let state = tree.shared.state.read();
        let mut clone = state.clone();
        drop(state);
        let root = clone.root();
        {
            let mut ctx = OpCtx {
                arena: &mut clone.arena,
                sentinel: clone.sentinel,
                cfg: clone.config,
                coord: None,
                target: None,
            };
            push_all(&mut ctx, root);
        }
        if let Some(root) = clone.root() {
            check_subtree(&clone.arena, root, Some(clone.sentinel));
        }
    }

    fn live_set(tree: &KdTree) -> Vec<[f64; 3]> {
        let state = tree.shared.state.read();
        let mut out = Vec::new();
        flatten_live(&state.arena, state.root(), None, &mut out, None);
        out.iter().map(|p| p.pos()).collect()
    }

    #[test]
    fn invariants_hold_after_random_operation_soup() {
        let mut rng = rand::thread_rng();
        let tree: KdTree = KdTree::new();

        let initial: Vec<Point> = (0..400)
            .map(|_| {
                Point::xyz(
                    rng.gen_range(-10.0..10.0),
                    rng.gen_range(-10.0..10.0),
                    rng.gen_range(-10.0..10.0),
                )
            })
            .collect();
        tree.build(&initial);

        let mut pool = initial.clone();
        let mut model: Vec<Point> = initial.clone();

        for _ in 0..600 {
            match rng.gen_range(0..10) {
                0..=4 => {
                    let p = Point::xyz(
                        rng.gen_range(-10.0..10.0),
                        rng.gen_range(-10.0..10.0),
                        rng.gen_range(-10.0..10.0),
                    );
                    tree.add_points(std::slice::from_ref(&p), false);
                    pool.push(p);
                    model.push(p);
                }
                5..=7 => {
                    let p = pool[rng.gen_range(0..pool.len())];
                    tree.delete_points(std::slice::from_ref(&p));
                    model.retain(|q| q.pos() != p.pos());
                }
                _ => {
                    let lo = [
                        rng.gen_range(-10.0..8.0),
                        rng.gen_range(-10.0..8.0),
                        rng.gen_range(-10.0..8.0),
                    ];
                    let bx = BoundingBox::new(
                        lo,
                        [lo[0] + 2.0, lo[1] + 2.0, lo[2] + 2.0],
                    );
                    tree.delete_boxes(std::slice::from_ref(&bx));
                    model.retain(|q| !bx.contains(q.pos()));
                }
            }
        }

        check_invariants(&tree);

        let mut got = live_set(&tree);
        let mut want: Vec<[f64; 3]> = model.iter().map(|p| p.pos()).collect();
        let key = |p: &[f64; 3]| (p[0].to_bits(), p[1].to_bits(), p[2].to_bits());
        got.sort_by_key(key);
        want.sort_by_key(key);
        assert_eq!(got, want, "live set diverged from the reference model");
        assert_eq!(tree.valid_count(), want.len());
    }

    #[test]
    fn box_round_trip_restores_everything_not_downsampled() {
        let tree: KdTree = KdTree::new();
        let pts: Vec<Point> = (0..100)
            .map(|i| Point::xyz(i as f64 * 0.1, 0.0, 0.0))
            .collect();
        tree.build(&pts);

        let all = BoundingBox::new([-1.0; 3], [11.0; 3]);
        let removed = tree.delete_boxes(std::slice::from_ref(&all));
        assert_eq!(removed, 100);
        assert_eq!(tree.valid_count(), 0);
        check_invariants(&tree);

        tree.add_boxes(std::slice::from_ref(&all));
        assert_eq!(tree.valid_count(), 100);
        check_invariants(&tree);
    }
}

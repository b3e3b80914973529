//! Read-only search descents: box, radius and k-nearest-neighbour queries.
//!
//! Searches never mutate the tree. Pending delete/restore overrides are
//! resolved on the way down, and any descent into the subtree claimed by the
//! background rebuilder passes through the search counter.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;

use crate::bounds::BoundingBox;
use crate::coord::Coordinator;
use crate::node::{Arena, Edge, NodeId, Side};
use crate::ops::{child_pending, effective, flatten_live, Pending};
use crate::point::{dist_sq, Point};

pub(crate) struct QueryCtx<'a, D> {
    pub arena: &'a Arena<D>,
    pub coord: &'a Coordinator<D>,
    /// Snapshot of the published rebuild edge for this query.
    pub target: Option<Edge>,
}

impl<D: Clone> QueryCtx<'_, D> {
    #[inline]
    fn guarded(&self, edge: Edge) -> bool {
        self.target == Some(edge)
    }
}

/// Collect every live point inside `query`.
pub(crate) fn box_search<D: Clone>(
    q: &QueryCtx<'_, D>,
    id: Option<NodeId>,
    inh: Option<Pending>,
    query: &BoundingBox,
    out: &mut Vec<Point<D>>,
) {
    let Some(id) = id else { return };
    let n = q.arena.node(id);
    if query.misses_hull(&n.aabb) {
        return;
    }
    if query.covers_hull(&n.aabb) {
        flatten_live(q.arena, Some(id), inh, out, None);
        return;
    }
    let eff = effective(n, inh);
    if !eff.pd && query.contains(n.point.pos()) {
        out.push(n.point.clone());
    }
    for side in [Side::Left, Side::Right] {
        let child = n.child(side);
        let pending = child_pending(n, &eff, inh, side);
        if q.guarded(Edge::new(id, side)) {
            q.coord.search.enter();
            box_search(q, child, pending, query, out);
            q.coord.search.exit();
        } else {
            box_search(q, child, pending, query, out);
        }
    }
}

/// Collect every live point within `radius` of `center` (boundary included).
pub(crate) fn radius_search<D: Clone>(
    q: &QueryCtx<'_, D>,
    id: Option<NodeId>,
    inh: Option<Pending>,
    center: [f64; 3],
    radius: f64,
    out: &mut Vec<Point<D>>,
) {
    let Some(id) = id else { return };
    let n = q.arena.node(id);
    // bounding-sphere pruning around the subtree hull
    let d = dist_sq(n.aabb.center(), center).sqrt();
    let hull_r = n.radius_sq.sqrt();
    if d > radius + hull_r {
        return;
    }
    if d <= radius - hull_r {
        flatten_live(q.arena, Some(id), inh, out, None);
        return;
    }
    let eff = effective(n, inh);
    if !eff.pd && dist_sq(n.point.pos(), center) <= radius * radius {
        out.push(n.point.clone());
    }
    for side in [Side::Left, Side::Right] {
        let child = n.child(side);
        let pending = child_pending(n, &eff, inh, side);
        if q.guarded(Edge::new(id, side)) {
            q.coord.search.enter();
            radius_search(q, child, pending, center, radius, out);
            q.coord.search.exit();
        } else {
            radius_search(q, child, pending, center, radius, out);
        }
    }
}

/// Candidate in the bounded knn max-heap; ordered by squared distance with a
/// deterministic coordinate tie-break.
#[derive(Clone, Debug)]
pub(crate) struct Neighbor<D> {
    pub dist_sq: f64,
    pub point: Point<D>,
}

impl<D> PartialEq for Neighbor<D> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl<D> Eq for Neighbor<D> {}

impl<D> PartialOrd for Neighbor<D> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<D> Ord for Neighbor<D> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.dist_sq
            .total_cmp(&other.dist_sq)
            .then_with(|| self.point.x.total_cmp(&other.point.x))
    }
}

/// Fill `heap` with up to `k` nearest live points to `query`.
///
/// The current cutoff is the heap top once `k` candidates are held, the
/// caller's squared maximum distance before that. A child is descended iff
/// the heap is not yet full or the child's hull can still beat the top.
pub(crate) fn knn_search<D: Clone>(
    q: &QueryCtx<'_, D>,
    id: Option<NodeId>,
    inh: Option<Pending>,
    query: [f64; 3],
    k: usize,
    max_dist_sq: f64,
    heap: &mut BinaryHeap<Neighbor<D>>,
) {
    let Some(id) = id else { return };
    let n = q.arena.node(id);
    let eff = effective(n, inh);
    if eff.td {
        return;
    }
    let cutoff = if heap.len() == k {
        heap.peek().map_or(max_dist_sq, |t| t.dist_sq)
    } else {
        max_dist_sq
    };
    if n.aabb.dist_sq_to(query) > cutoff {
        return;
    }

    if !eff.pd {
        let d = dist_sq(n.point.pos(), query);
        let beats_top = heap.len() < k || heap.peek().map_or(true, |t| d < t.dist_sq);
        if d <= max_dist_sq && beats_top {
            if heap.len() == k {
                heap.pop();
            }
            heap.push(Neighbor {
                dist_sq: d,
                point: n.point.clone(),
            });
        }
    }

    let d_left = n
        .left
        .map_or(f64::INFINITY, |l| q.arena.node(l).aabb.dist_sq_to(query));
    let d_right = n
        .right
        .map_or(f64::INFINITY, |r| q.arena.node(r).aabb.dist_sq_to(query));

    // visit the nearer child first
    let order = if d_left <= d_right {
        [(Side::Left, d_left), (Side::Right, d_right)]
    } else {
        [(Side::Right, d_right), (Side::Left, d_left)]
    };
    for (side, bound) in order {
        let worth_it = heap.len() < k || heap.peek().map_or(true, |t| bound < t.dist_sq);
        if !worth_it {
            continue;
        }
        let child = n.child(side);
        let pending = child_pending(n, &eff, inh, side);
        if q.guarded(Edge::new(id, side)) {
            q.coord.search.enter();
            knn_search(q, child, pending, query, k, max_dist_sq, heap);
            q.coord.search.exit();
        } else {
            knn_search(q, child, pending, query, k, max_dist_sq, heap);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neighbor_heap_is_a_max_heap_on_distance() {
        let mut heap: BinaryHeap<Neighbor<()>> = BinaryHeap::new();
        for (d, x) in [(4.0, 1.0), (1.0, 2.0), (9.0, 3.0), (0.25, 4.0)] {
            heap.push(Neighbor {
                dist_sq: d,
                point: Point::xyz(x, 0.0, 0.0),
            });
        }
        assert_eq!(heap.peek().unwrap().dist_sq, 9.0);
        let sorted: Vec<f64> = heap.into_sorted_vec().iter().map(|n| n.dist_sq).collect();
        assert_eq!(sorted, vec![0.25, 1.0, 4.0, 9.0]);
    }

    #[test]
    fn equal_distances_break_ties_on_x() {
        let a = Neighbor::<()> {
            dist_sq: 1.0,
            point: Point::xyz(0.5, 0.0, 0.0),
        };
        let b = Neighbor::<()> {
            dist_sq: 1.0,
            point: Point::xyz(0.7, 0.0, 0.0),
        };
        assert!(b > a);
    }
}

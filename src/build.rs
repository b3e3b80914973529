use crate::node::{Arena, Node, NodeId};
use crate::point::Point;

/// Below this many points the two halves are built sequentially; the rayon
/// fork overhead outweighs the work.
const PARALLEL_MIN: usize = 2048;

/// Build a balanced tree over `points` into a detached arena.
///
/// The arena is topped by a sentinel whose left edge owns the real root, so
/// the root is reachable through an ordinary parent edge like every other
/// node. An empty slice yields a sentinel-only arena.
///
/// Points are partitioned in place; slot `i` of the arena receives the node
/// whose point lands at index `i` after partitioning, which gives every
/// recursive call a disjoint slot range and lets the two halves build in
/// parallel.
pub(crate) fn build_arena<D>(points: &mut [Point<D>]) -> (Arena<D>, NodeId)
where
    D: Clone + Default + Send,
{
    let n = points.len();
    let mut slots: Vec<Option<Node<D>>> = Vec::with_capacity(n + 1);
    slots.resize_with(n, || None);

    let sentinel_id = NodeId(n as u32);
    let root = if n > 0 {
        Some(build_range(points, &mut slots, 0, Some(sentinel_id)))
    } else {
        None
    };

    let mut sentinel: Node<D> = Node::leaf(Point::new(0.0, 0.0, 0.0, D::default()), 0);
    sentinel.size = 0;
    sentinel.left = root;
    slots.push(Some(sentinel));

    (Arena::from_slots(slots), sentinel_id)
}

/// Build the subtree for one slice; returns the absolute slot index of its
/// root. `base` is the absolute index of `points[0]`.
fn build_range<D>(
    points: &mut [Point<D>],
    slots: &mut [Option<Node<D>>],
    base: u32,
    parent: Option<NodeId>,
) -> NodeId
where
    D: Clone + Send,
{
    debug_assert!(!points.is_empty());
    debug_assert_eq!(points.len(), slots.len());

    let len = points.len();
    let mid = len / 2;
    let id = NodeId(base + mid as u32);

    // Widest extent picks the split axis; ties go to the lower axis index.
    let mut lo = [f64::INFINITY; 3];
    let mut hi = [f64::NEG_INFINITY; 3];
    for p in points.iter() {
        let pos = p.pos();
        for a in 0..3 {
            lo[a] = lo[a].min(pos[a]);
            hi[a] = hi[a].max(pos[a]);
        }
    }
    let mut axis = 0usize;
    for a in 1..3 {
        if hi[a] - lo[a] > hi[axis] - lo[axis] {
            axis = a;
        }
    }

    // Median split on the chosen axis; the pivot becomes this node's point.
    points.select_nth_unstable_by(mid, |a, b| {
        a.coord(axis as u8).total_cmp(&b.coord(axis as u8))
    });
    let point = points[mid].clone();

    let (lp, rest_p) = points.split_at_mut(mid);
    let rp = &mut rest_p[1..];
    let (ls, rest_s) = slots.split_at_mut(mid);
    let (ms, rs) = rest_s.split_at_mut(1);
    let right_base = base + mid as u32 + 1;

    let (left, right) = if len >= PARALLEL_MIN {
        rayon::join(
            || (!lp.is_empty()).then(|| build_range(lp, &mut *ls, base, Some(id))),
            || (!rp.is_empty()).then(|| build_range(rp, &mut *rs, right_base, Some(id))),
        )
    } else {
        (
            (!lp.is_empty()).then(|| build_range(lp, &mut *ls, base, Some(id))),
            (!rp.is_empty()).then(|| build_range(rp, &mut *rs, right_base, Some(id))),
        )
    };

    let mut node = Node::leaf(point, axis as u8);
    node.parent = parent;
    node.left = left;
    node.right = right;
    if let Some(l) = left {
        let child = ls[(l.0 - base) as usize]
            .as_ref()
            .expect("left subtree root was not built");
        node.size += child.size;
        node.aabb.expand_box(&child.aabb);
    }
    if let Some(r) = right {
        let child = rs[(r.0 - right_base) as usize]
            .as_ref()
            .expect("right subtree root was not built");
        node.size += child.size;
        node.aabb.expand_box(&child.aabb);
    }
    node.radius_sq = node.aabb.half_diag_sq();
    ms[0] = Some(node);
    id
}

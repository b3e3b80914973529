//! Recursive tree operations shared by the foreground mutators and the
//! background replay path: aggregation, lazy-delete push-down, point and box
//! mutation, the rebalance criterion and inline rebuilds.

use std::sync::atomic::Ordering;

use crate::bounds::BoundingBox;
use crate::build;
use crate::coord::Coordinator;
use crate::node::{Arena, Edge, Node, NodeFlags, NodeId, Side};
use crate::oplog::Operation;
use crate::point::{same_position, Point};
use crate::tree::TreeConfig;

/// Everything one mutation needs: the arena, the sentinel anchoring the real
/// root, the configuration, and (on the foreground path only) the shared
/// coordinator plus a snapshot of the published rebuild edge. Replay against
/// a detached subtree runs with `coord` and `target` unset.
pub(crate) struct OpCtx<'a, D> {
    pub arena: &'a mut Arena<D>,
    pub sentinel: NodeId,
    pub cfg: TreeConfig,
    pub coord: Option<&'a Coordinator<D>>,
    pub target: Option<Edge>,
}

impl<D: Clone> OpCtx<'_, D> {
    #[inline]
    pub(crate) fn child_of(&self, edge: Edge) -> Option<NodeId> {
        self.arena.node(edge.parent).child(edge.side)
    }

    fn log_if_rebuilding(&self, op: Operation<D>) {
        if let Some(coord) = self.coord {
            coord.log_if_rebuilding(op);
        }
    }
}

// ---------------------------------------------------------------------------
// Pending-override resolution (read-only descents)
// ---------------------------------------------------------------------------

/// An unapplied subtree override inherited from an ancestor whose push flag
/// toward this branch is still pending: the pair `push_down` would deliver.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Pending {
    pub td: bool,
    pub tdd: bool,
}

/// A node's deletion state with any inherited override already composed in.
#[derive(Clone, Copy, Debug)]
pub(crate) struct EffFlags {
    pub pd: bool,
    pub td: bool,
    pub pdd: bool,
    pub tdd: bool,
}

pub(crate) fn effective<D>(node: &Node<D>, inh: Option<Pending>) -> EffFlags {
    let f = node.flags;
    match inh {
        None => EffFlags {
            pd: f.contains(NodeFlags::POINT_DELETED),
            td: f.contains(NodeFlags::TREE_DELETED),
            pdd: f.contains(NodeFlags::POINT_DOWNSAMPLED),
            tdd: f.contains(NodeFlags::TREE_DOWNSAMPLED),
        },
        // Mirrors apply_push: an override replaces the plain deletion bits
        // and ORs the downsample bits.
        Some(p) => {
            let tdd = f.contains(NodeFlags::TREE_DOWNSAMPLED) || p.tdd;
            let pdd = f.contains(NodeFlags::POINT_DOWNSAMPLED) || p.tdd;
            let td = p.td || tdd;
            let pd = td || pdd;
            EffFlags { pd, td, pdd, tdd }
        }
    }
}

/// The override the child on `side` would inherit from this node during a
/// read-only descent. Receiving an override arms a node's own push flags, so
/// inheritance keeps flowing once it starts.
pub(crate) fn child_pending<D>(
    node: &Node<D>,
    eff: &EffFlags,
    inh: Option<Pending>,
    side: Side,
) -> Option<Pending> {
    if inh.is_some() || node.flags.contains(side.push_flag()) {
        Some(Pending {
            td: eff.td,
            tdd: eff.tdd,
        })
    } else {
        None
    }
}

/// Collect the live points of a subtree without mutating it, resolving
/// pending overrides on the way down. When `removed` is given, lazily
/// deleted points that were neither downsample casualties nor already
/// reported are recorded there (rebuild reclamation).
pub(crate) fn flatten_live<D: Clone>(
    arena: &Arena<D>,
    id: Option<NodeId>,
    inh: Option<Pending>,
    out: &mut Vec<Point<D>>,
    mut removed: Option<&mut Vec<Point<D>>>,
) {
    let Some(id) = id else { return };
    let n = arena.node(id);
    let eff = effective(n, inh);
    if !eff.pd {
        out.push(n.point.clone());
    } else if let Some(rem) = removed.as_mut() {
        if !eff.pdd && !n.flags.contains(NodeFlags::REMOVAL_RECORDED) {
            rem.push(n.point.clone());
        }
    }
    flatten_live(
        arena,
        n.left,
        child_pending(n, &eff, inh, Side::Left),
        out,
        removed.as_mut().map(|r| &mut **r),
    );
    flatten_live(
        arena,
        n.right,
        child_pending(n, &eff, inh, Side::Right),
        out,
        removed,
    );
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
struct ChildStat {
    size: u32,
    invalid: u32,
    down_del: u32,
    td: bool,
    tdd: bool,
    aabb: BoundingBox,
}

fn child_stat<D>(arena: &Arena<D>, id: Option<NodeId>) -> Option<ChildStat> {
    id.map(|id| {
        let n = arena.node(id);
        ChildStat {
            size: n.size,
            invalid: n.invalid,
            down_del: n.down_del,
            td: n.flags.contains(NodeFlags::TREE_DELETED),
            tdd: n.flags.contains(NodeFlags::TREE_DOWNSAMPLED),
            aabb: n.aabb,
        }
    })
}

/// Recompute a node's subtree aggregates from its children: size, invalid
/// and downsample counters, subtree-deleted bits, the live-point hull (with
/// the all-points fallback when the whole subtree is deleted), the pruning
/// radius, and the root alpha metrics.
pub(crate) fn update<D: Clone>(arena: &mut Arena<D>, sentinel: NodeId, id: NodeId) {
    let (left, right) = {
        let n = arena.node(id);
        (n.left, n.right)
    };
    let ls = child_stat(arena, left);
    let rs = child_stat(arena, right);
    let (pd, pdd, pos) = {
        let n = arena.node(id);
        (
            n.flags.contains(NodeFlags::POINT_DELETED),
            n.flags.contains(NodeFlags::POINT_DOWNSAMPLED),
            n.point.pos(),
        )
    };

    let size = 1 + ls.map_or(0, |s| s.size) + rs.map_or(0, |s| s.size);
    let invalid = pd as u32 + ls.map_or(0, |s| s.invalid) + rs.map_or(0, |s| s.invalid);
    let down_del = pdd as u32 + ls.map_or(0, |s| s.down_del) + rs.map_or(0, |s| s.down_del);
    let td = pd && ls.map_or(true, |s| s.td) && rs.map_or(true, |s| s.td);
    let tdd = pdd && ls.map_or(true, |s| s.tdd) && rs.map_or(true, |s| s.tdd);

    // Live hull, unless the subtree is entirely deleted; then every point
    // counts so pruning stays sound for restoration.
    let full = td || (!pd && ls.map_or(true, |s| !s.td) && rs.map_or(true, |s| !s.td));
    let mut bb = BoundingBox::void();
    if full {
        bb.expand_point(pos);
        if let Some(s) = &ls {
            bb.expand_box(&s.aabb);
        }
        if let Some(s) = &rs {
            bb.expand_box(&s.aabb);
        }
    } else {
        if let Some(s) = &ls {
            if !s.td {
                bb.expand_box(&s.aabb);
            }
        }
        if let Some(s) = &rs {
            if !s.td {
                bb.expand_box(&s.aabb);
            }
        }
        if !pd {
            bb.expand_point(pos);
        }
    }
    debug_assert!(bb.min[0] <= bb.max[0], "subtree hull folded empty");

    let is_root = arena.node(sentinel).left == Some(id);
    {
        let n = arena.node_mut(id);
        n.size = size;
        n.invalid = invalid;
        n.down_del = down_del;
        n.flags.set(NodeFlags::TREE_DELETED, td);
        n.flags.set(NodeFlags::TREE_DOWNSAMPLED, tdd);
        n.aabb = bb;
        n.radius_sq = bb.half_diag_sq();
        if is_root && size > 3 {
            let l = ls.map_or(0, |s| s.size);
            let r = rs.map_or(0, |s| s.size);
            n.alpha_bal = l.max(r) as f64 / (size - 1) as f64;
            n.alpha_del = invalid as f64 / size as f64;
        }
    }
    if let Some(l) = left {
        arena.node_mut(l).parent = Some(id);
    }
    if let Some(r) = right {
        arena.node_mut(r).parent = Some(id);
    }
}

// ---------------------------------------------------------------------------
// Push-down
// ---------------------------------------------------------------------------

/// Apply a pending (tree_deleted, tree_downsampled) override to `child`,
/// patch its counters and arm its own push flags so the override keeps
/// travelling down.
pub(crate) fn apply_push<D>(child: &mut Node<D>, td: bool, tdd: bool) {
    if tdd {
        child
            .flags
            .insert(NodeFlags::TREE_DOWNSAMPLED | NodeFlags::POINT_DOWNSAMPLED);
    }
    let new_td = td || child.flags.contains(NodeFlags::TREE_DOWNSAMPLED);
    child.flags.set(NodeFlags::TREE_DELETED, new_td);
    let new_pd = new_td || child.flags.contains(NodeFlags::POINT_DOWNSAMPLED);
    child.flags.set(NodeFlags::POINT_DELETED, new_pd);
    if tdd {
        child.down_del = child.size;
    }
    child.invalid = if new_td { child.size } else { child.down_del };
    child.flags.insert(NodeFlags::PUSH_LEFT | NodeFlags::PUSH_RIGHT);
}

/// Deliver this node's pending delete/restore state to each flagged child.
/// A push crossing the published rebuild edge is also logged. Flags toward
/// empty edges are dropped: there is nothing to propagate to, and a stale
/// flag would hit a later insert instead.
pub(crate) fn push_down<D: Clone>(ctx: &mut OpCtx<'_, D>, id: NodeId) {
    let (flags, td, tdd, left, right) = {
        let n = ctx.arena.node(id);
        (
            n.flags,
            n.flags.contains(NodeFlags::TREE_DELETED),
            n.flags.contains(NodeFlags::TREE_DOWNSAMPLED),
            n.left,
            n.right,
        )
    };
    for (side, child) in [(Side::Left, left), (Side::Right, right)] {
        if !flags.contains(side.push_flag()) {
            continue;
        }
        if let Some(c) = child {
            apply_push(ctx.arena.node_mut(c), td, tdd);
            if ctx.target == Some(Edge::new(id, side)) {
                ctx.log_if_rebuilding(Operation::PushDown {
                    tree_deleted: td,
                    tree_downsampled: tdd,
                });
            }
        }
        ctx.arena.node_mut(id).flags.remove(side.push_flag());
    }
}

// ---------------------------------------------------------------------------
// Rebalance criterion and rebuild dispatch
// ---------------------------------------------------------------------------

/// Does this subtree need a rebuild, either too lopsided or carrying too
/// much lazily deleted garbage?
pub(crate) fn criterion_check<D>(arena: &Arena<D>, cfg: &TreeConfig, id: NodeId) -> bool {
    let n = arena.node(id);
    if n.size as usize <= cfg.min_unbalanced_size {
        return false;
    }
    let child = n
        .left
        .or(n.right)
        .expect("subtree above the balance floor has a child");
    let bal = arena.node(child).size as f64 / (n.size - 1) as f64;
    let del = n.invalid as f64 / n.size as f64;
    del > cfg.delete_criterion || bal > cfg.balance_criterion || bal < 1.0 - cfg.balance_criterion
}

/// Rebuild the subtree owned by `edge`: inline below the offload threshold,
/// otherwise publish the edge for the background thread (unless a rebuild is
/// already claimed, in which case the criterion will fire again later).
fn maybe_rebuild<D>(ctx: &mut OpCtx<'_, D>, edge: Edge)
where
    D: Clone + Default + Send,
{
    let Some(id) = ctx.child_of(edge) else { return };
    if ctx.arena.node(id).size as usize >= ctx.cfg.rebuild_threshold {
        if let Some(coord) = ctx.coord {
            let mut target = coord.rebuild_target.lock();
            if target.is_none() && !coord.rebuild_active.load(Ordering::Acquire) {
                *target = Some(edge);
            }
        }
        return;
    }
    inline_rebuild(ctx, edge);
}

/// Flatten the live points of the subtree at `edge`, discard its nodes and
/// reattach a balanced replacement. Reclaimed deletions go to the foreground
/// removed list.
pub(crate) fn inline_rebuild<D>(ctx: &mut OpCtx<'_, D>, edge: Edge)
where
    D: Clone + Default + Send,
{
    let Some(old) = ctx.child_of(edge) else { return };
    debug_assert!(
        !ctx.arena.node(edge.parent).flags.contains(edge.side.push_flag()),
        "rebuilding under an undelivered push"
    );
    let live = {
        let n = ctx.arena.node(old);
        (n.size - n.invalid) as usize
    };
    let mut scratch: Vec<Point<D>> = Vec::with_capacity(live);
    if let Some(coord) = ctx.coord {
        let mut removed = coord.removed.lock();
        flatten_live(
            ctx.arena,
            Some(old),
            None,
            &mut scratch,
            Some(&mut removed.foreground),
        );
    } else {
        flatten_live(ctx.arena, Some(old), None, &mut scratch, None);
    }
    ctx.arena.release_subtree(old);

    let (donor, donor_sentinel) = build::build_arena(&mut scratch);
    let new_root = ctx.arena.absorb(donor, donor_sentinel);
    ctx.arena.node_mut(edge.parent).set_child(edge.side, new_root);
    if let Some(r) = new_root {
        ctx.arena.node_mut(r).parent = Some(edge.parent);
        // refreshes the alpha metrics when the root itself was rebuilt
        update(ctx.arena, ctx.sentinel, r);
    }
}

/// Withdraw the published rebuild if this very subtree shrank back below the
/// offload threshold before the background thread picked it up.
fn cancel_if_shrunk<D: Clone>(ctx: &mut OpCtx<'_, D>, edge: Edge, id: NodeId) {
    if ctx.target != Some(edge) {
        return;
    }
    if (ctx.arena.node(id).size as usize) < ctx.cfg.rebuild_threshold {
        if let Some(coord) = ctx.coord {
            if !coord.rebuild_active.load(Ordering::Acquire) {
                let mut target = coord.rebuild_target.lock();
                if *target == Some(edge) {
                    *target = None;
                    ctx.target = None;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Mutators
// ---------------------------------------------------------------------------

/// Insert one point, descending by strict `<` on each split axis. A fresh
/// leaf cycles its parent's axis; the root starts on axis 0.
pub(crate) fn add_by_point<D>(
    ctx: &mut OpCtx<'_, D>,
    edge: Edge,
    point: &Point<D>,
    allow_rebuild: bool,
    parent_axis: u8,
) where
    D: Clone + Default + Send,
{
    let Some(id) = ctx.child_of(edge) else {
        let axis = if edge.parent == ctx.sentinel {
            0
        } else {
            (parent_axis + 1) % 3
        };
        let mut node = Node::leaf(point.clone(), axis);
        node.parent = Some(edge.parent);
        let id = ctx.arena.alloc(node);
        ctx.arena.node_mut(edge.parent).set_child(edge.side, Some(id));
        return;
    };

    ctx.arena.node_mut(id).flags.insert(NodeFlags::WORKING);
    push_down(ctx, id);

    let (axis, go_left) = {
        let n = ctx.arena.node(id);
        (n.axis, point.coord(n.axis) < n.point.coord(n.axis))
    };
    let side = if go_left { Side::Left } else { Side::Right };
    let child_edge = Edge::new(id, side);
    if ctx.target == Some(child_edge) {
        add_by_point(ctx, child_edge, point, false, axis);
        ctx.log_if_rebuilding(Operation::AddPoint(point.clone()));
    } else {
        add_by_point(ctx, child_edge, point, allow_rebuild, axis);
    }

    update(ctx.arena, ctx.sentinel, id);
    cancel_if_shrunk(ctx, edge, id);
    if allow_rebuild && criterion_check(ctx.arena, &ctx.cfg, id) {
        maybe_rebuild(ctx, edge);
    }
    if let Some(cur) = ctx.child_of(edge) {
        ctx.arena.node_mut(cur).flags.remove(NodeFlags::WORKING);
    }
}

/// Lazily delete the node whose coordinates match `point` within epsilon.
/// Recursion stops at the match; a miss is a silent no-op.
pub(crate) fn delete_by_point<D>(
    ctx: &mut OpCtx<'_, D>,
    edge: Edge,
    point: &Point<D>,
    allow_rebuild: bool,
) where
    D: Clone + Default + Send,
{
    let Some(id) = ctx.child_of(edge) else { return };
    if ctx.arena.node(id).flags.contains(NodeFlags::TREE_DELETED) {
        return;
    }
    ctx.arena.node_mut(id).flags.insert(NodeFlags::WORKING);
    push_down(ctx, id);

    let eps = ctx.cfg.eps;
    let matched = {
        let n = ctx.arena.node_mut(id);
        if same_position(&n.point, point, eps) && !n.flags.contains(NodeFlags::POINT_DELETED) {
            n.flags
                .insert(NodeFlags::POINT_DELETED | NodeFlags::REMOVAL_RECORDED);
            n.invalid += 1;
            if n.invalid == n.size {
                n.flags.insert(NodeFlags::TREE_DELETED);
            }
            n.flags.remove(NodeFlags::WORKING);
            Some(n.point.clone())
        } else {
            None
        }
    };
    if let Some(removed) = matched {
        // recorded at mark time so the removal is observable before any
        // rebuild reclaims the node
        if let Some(coord) = ctx.coord {
            coord.removed.lock().foreground.push(removed);
        }
        return;
    }

    let go_left = {
        let n = ctx.arena.node(id);
        point.coord(n.axis) < n.point.coord(n.axis)
    };
    let side = if go_left { Side::Left } else { Side::Right };
    let child_edge = Edge::new(id, side);
    if ctx.target == Some(child_edge) {
        delete_by_point(ctx, child_edge, point, false);
        ctx.log_if_rebuilding(Operation::DeletePoint(point.clone()));
    } else {
        delete_by_point(ctx, child_edge, point, allow_rebuild);
    }

    update(ctx.arena, ctx.sentinel, id);
    cancel_if_shrunk(ctx, edge, id);
    if allow_rebuild && criterion_check(ctx.arena, &ctx.cfg, id) {
        maybe_rebuild(ctx, edge);
    }
    if let Some(cur) = ctx.child_of(edge) {
        ctx.arena.node_mut(cur).flags.remove(NodeFlags::WORKING);
    }
}

/// Lazily delete everything inside `query`. Full hull coverage marks the
/// subtree wholesale and defers the rest to push-down; partial coverage
/// recurses. Returns how many live points were removed. With `downsample`
/// set the downsample mirrors are stamped too, making the deletion immune to
/// box restoration.
pub(crate) fn delete_by_range<D>(
    ctx: &mut OpCtx<'_, D>,
    edge: Edge,
    query: &BoundingBox,
    allow_rebuild: bool,
    downsample: bool,
) -> u32
where
    D: Clone + Default + Send,
{
    let Some(id) = ctx.child_of(edge) else { return 0 };
    if ctx.arena.node(id).flags.contains(NodeFlags::TREE_DELETED) {
        return 0;
    }
    if query.misses_hull(&ctx.arena.node(id).aabb) {
        return 0;
    }
    ctx.arena.node_mut(id).flags.insert(NodeFlags::WORKING);
    push_down(ctx, id);

    let hull = ctx.arena.node(id).aabb;
    if query.covers_hull(&hull) {
        let n = ctx.arena.node_mut(id);
        n.flags.insert(
            NodeFlags::TREE_DELETED
                | NodeFlags::POINT_DELETED
                | NodeFlags::PUSH_LEFT
                | NodeFlags::PUSH_RIGHT,
        );
        let count = n.size - n.invalid;
        n.invalid = n.size;
        if downsample {
            n.flags
                .insert(NodeFlags::TREE_DOWNSAMPLED | NodeFlags::POINT_DOWNSAMPLED);
            n.down_del = n.size;
        }
        n.flags.remove(NodeFlags::WORKING);
        return count;
    }

    let mut count = 0u32;
    {
        let n = ctx.arena.node_mut(id);
        if !n.flags.contains(NodeFlags::POINT_DELETED) && query.contains(n.point.pos()) {
            n.flags.insert(NodeFlags::POINT_DELETED);
            if downsample {
                n.flags.insert(NodeFlags::POINT_DOWNSAMPLED);
            }
            count += 1;
        }
    }

    for side in [Side::Left, Side::Right] {
        let child_edge = Edge::new(id, side);
        if ctx.target == Some(child_edge) {
            count += delete_by_range(ctx, child_edge, query, false, downsample);
            ctx.log_if_rebuilding(if downsample {
                Operation::DownsampleDelete(*query)
            } else {
                Operation::DeleteBox(*query)
            });
        } else {
            count += delete_by_range(ctx, child_edge, query, allow_rebuild, downsample);
        }
    }

    update(ctx.arena, ctx.sentinel, id);
    cancel_if_shrunk(ctx, edge, id);
    if allow_rebuild && criterion_check(ctx.arena, &ctx.cfg, id) {
        maybe_rebuild(ctx, edge);
    }
    if let Some(cur) = ctx.child_of(edge) {
        ctx.arena.node_mut(cur).flags.remove(NodeFlags::WORKING);
    }
    count
}

/// Undo box deletion inside `query`: clears the plain deletion bits wherever
/// the downsample mirror is not set. The mirror of `delete_by_range`.
pub(crate) fn add_by_range<D>(
    ctx: &mut OpCtx<'_, D>,
    edge: Edge,
    query: &BoundingBox,
    allow_rebuild: bool,
) where
    D: Clone + Default + Send,
{
    let Some(id) = ctx.child_of(edge) else { return };
    // no subtree-deleted early-out: restoration must reach deleted subtrees
    if query.misses_hull(&ctx.arena.node(id).aabb) {
        return;
    }
    ctx.arena.node_mut(id).flags.insert(NodeFlags::WORKING);
    push_down(ctx, id);

    let hull = ctx.arena.node(id).aabb;
    if query.covers_hull(&hull) {
        let n = ctx.arena.node_mut(id);
        let tdd = n.flags.contains(NodeFlags::TREE_DOWNSAMPLED);
        let pdd = n.flags.contains(NodeFlags::POINT_DOWNSAMPLED);
        n.flags.set(NodeFlags::TREE_DELETED, tdd);
        n.flags.set(NodeFlags::POINT_DELETED, pdd);
        n.flags.insert(NodeFlags::PUSH_LEFT | NodeFlags::PUSH_RIGHT);
        n.invalid = n.down_del;
        n.flags.remove(NodeFlags::WORKING);
        return;
    }

    {
        let n = ctx.arena.node_mut(id);
        if query.contains(n.point.pos()) {
            let pdd = n.flags.contains(NodeFlags::POINT_DOWNSAMPLED);
            n.flags.set(NodeFlags::POINT_DELETED, pdd);
        }
    }

    for side in [Side::Left, Side::Right] {
        let child_edge = Edge::new(id, side);
        if ctx.target == Some(child_edge) {
            add_by_range(ctx, child_edge, query, false);
            ctx.log_if_rebuilding(Operation::AddBox(*query));
        } else {
            add_by_range(ctx, child_edge, query, allow_rebuild);
        }
    }

    update(ctx.arena, ctx.sentinel, id);
    cancel_if_shrunk(ctx, edge, id);
    if allow_rebuild && criterion_check(ctx.arena, &ctx.cfg, id) {
        maybe_rebuild(ctx, edge);
    }
    if let Some(cur) = ctx.child_of(edge) {
        ctx.arena.node_mut(cur).flags.remove(NodeFlags::WORKING);
    }
}

/// Apply one logged operation to a (detached) tree, rebuilds suppressed.
pub(crate) fn run_operation<D>(ctx: &mut OpCtx<'_, D>, op: Operation<D>)
where
    D: Clone + Default + Send,
{
    let root_edge = Edge::new(ctx.sentinel, Side::Left);
    match op {
        Operation::AddPoint(p) => {
            let axis = ctx
                .child_of(root_edge)
                .map_or(0, |r| ctx.arena.node(r).axis);
            add_by_point(ctx, root_edge, &p, false, axis);
        }
        Operation::DeletePoint(p) => delete_by_point(ctx, root_edge, &p, false),
        Operation::DeleteBox(b) => {
            delete_by_range(ctx, root_edge, &b, false, false);
        }
        Operation::AddBox(b) => add_by_range(ctx, root_edge, &b, false),
        Operation::DownsampleDelete(b) => {
            delete_by_range(ctx, root_edge, &b, false, true);
        }
        Operation::PushDown {
            tree_deleted,
            tree_downsampled,
        } => {
            if let Some(r) = ctx.child_of(root_edge) {
                apply_push(ctx.arena.node_mut(r), tree_deleted, tree_downsampled);
            }
        }
    }
}

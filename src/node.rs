use bitflags::bitflags;

use crate::bounds::BoundingBox;
use crate::point::Point;

bitflags! {
    /// Per-node lazy-deletion state.
    ///
    /// The downsample bits mirror the plain deletion bits but are never
    /// cleared by box restoration. The push bits mean the node's subtree
    /// delete/restore state has not yet been applied to that child.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) struct NodeFlags: u8 {
        const POINT_DELETED     = 1 << 0;
        const TREE_DELETED      = 1 << 1;
        const POINT_DOWNSAMPLED = 1 << 2;
        const TREE_DOWNSAMPLED  = 1 << 3;
        const PUSH_LEFT         = 1 << 4;
        const PUSH_RIGHT        = 1 << 5;
        /// A mutation currently holds this node on its recursion path.
        const WORKING           = 1 << 6;
        /// The point was already reported through `acquire_removed_points`.
        const REMOVAL_RECORDED  = 1 << 7;
    }
}

/// Index of a node slot in an [`Arena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct NodeId(pub(crate) u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Side {
    Left,
    Right,
}

impl Side {
    #[inline]
    pub(crate) fn push_flag(self) -> NodeFlags {
        match self {
            Side::Left => NodeFlags::PUSH_LEFT,
            Side::Right => NodeFlags::PUSH_RIGHT,
        }
    }
}

/// A parent-owned child slot: the unit of subtree ownership.
///
/// The background rebuilder publishes one of these; foreground operations
/// compare the edges they are about to descend against it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Edge {
    pub parent: NodeId,
    pub side: Side,
}

impl Edge {
    pub(crate) fn new(parent: NodeId, side: Side) -> Self {
        Edge { parent, side }
    }
}

/// One tree node: pivot point, split axis, children, and the subtree
/// aggregates queries prune on.
#[derive(Clone, Debug)]
pub(crate) struct Node<D> {
    pub point: Point<D>,
    pub axis: u8,
    pub left: Option<NodeId>,
    pub right: Option<NodeId>,
    pub parent: Option<NodeId>,
    /// Nodes in this subtree, live and lazily deleted alike.
    pub size: u32,
    /// Lazily deleted nodes in this subtree (downsample-deleted included).
    pub invalid: u32,
    /// Downsample-deleted nodes in this subtree.
    pub down_del: u32,
    pub flags: NodeFlags,
    /// Hull of the subtree's live points; falls back to all points when the
    /// whole subtree is deleted so pruning stays sound.
    pub aabb: BoundingBox,
    /// Squared half-diagonal of `aabb`.
    pub radius_sq: f64,
    /// Balance metric, maintained at the root only.
    pub alpha_bal: f64,
    /// Garbage metric, maintained at the root only.
    pub alpha_del: f64,
}

impl<D> Node<D> {
    /// Fresh single-point node; aggregates are already correct for a leaf.
    pub(crate) fn leaf(point: Point<D>, axis: u8) -> Self {
        let aabb = BoundingBox::degenerate([point.x, point.y, point.z]);
        Node {
            point,
            axis,
            left: None,
            right: None,
            parent: None,
            size: 1,
            invalid: 0,
            down_del: 0,
            flags: NodeFlags::empty(),
            aabb,
            radius_sq: 0.0,
            alpha_bal: 0.5,
            alpha_del: 0.0,
        }
    }

    #[inline]
    pub(crate) fn child(&self, side: Side) -> Option<NodeId> {
        match side {
            Side::Left => self.left,
            Side::Right => self.right,
        }
    }

    #[inline]
    pub(crate) fn set_child(&mut self, side: Side, child: Option<NodeId>) {
        match side {
            Side::Left => self.left = child,
            Side::Right => self.right = child,
        }
    }
}

/// Slot arena holding every node of one tree.
///
/// Nodes are addressed by index so the rebuild ownership swap is an index
/// store rather than pointer surgery; freed slots are recycled through a free
/// list.
#[derive(Clone, Debug)]
pub(crate) struct Arena<D> {
    slots: Vec<Option<Node<D>>>,
    free: Vec<u32>,
}

impl<D> Arena<D> {
    pub(crate) fn from_slots(slots: Vec<Option<Node<D>>>) -> Self {
        Arena { slots, free: Vec::new() }
    }

    pub(crate) fn alloc(&mut self, node: Node<D>) -> NodeId {
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Some(node);
            NodeId(idx)
        } else {
            self.slots.push(Some(node));
            NodeId((self.slots.len() - 1) as u32)
        }
    }

    pub(crate) fn release(&mut self, id: NodeId) {
        debug_assert!(self.slots[id.0 as usize].is_some(), "double free of node slot");
        self.slots[id.0 as usize] = None;
        self.free.push(id.0);
    }

    /// Free an entire subtree. Iterative: lazily deleted regions can be
    /// arbitrarily unbalanced, so recursion depth is not trusted here.
    pub(crate) fn release_subtree(&mut self, root: NodeId) {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let node = self.slots[id.0 as usize]
                .take()
                .expect("dangling node id in release_subtree");
            self.free.push(id.0);
            if let Some(l) = node.left {
                stack.push(l);
            }
            if let Some(r) = node.right {
                stack.push(r);
            }
        }
    }

    #[inline]
    pub(crate) fn node(&self, id: NodeId) -> &Node<D> {
        self.slots[id.0 as usize].as_ref().expect("dangling node id")
    }

    #[inline]
    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node<D> {
        self.slots[id.0 as usize].as_mut().expect("dangling node id")
    }

    /// Number of live slots, counting the sentinel.
    #[cfg(test)]
    pub(crate) fn live_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Graft a detached arena into this one, reusing freed slots before
    /// growing. The donor's sentinel is dropped in the process; the donor
    /// root comes back under its new index with its parent cleared, ready to
    /// be rewired to the real owner edge.
    pub(crate) fn absorb(&mut self, donor: Arena<D>, donor_sentinel: NodeId) -> Option<NodeId> {
        let mut map = vec![u32::MAX; donor.slots.len()];
        for (i, slot) in donor.slots.iter().enumerate() {
            if slot.is_none() || i as u32 == donor_sentinel.0 {
                continue;
            }
            map[i] = if let Some(f) = self.free.pop() {
                f
            } else {
                self.slots.push(None);
                (self.slots.len() - 1) as u32
            };
        }
        let remap = |id: Option<NodeId>| -> Option<NodeId> {
            id.and_then(|id| {
                let m = map[id.0 as usize];
                (m != u32::MAX).then_some(NodeId(m))
            })
        };
        let donor_root = remap(donor.node(donor_sentinel).left);
        for (i, slot) in donor.slots.into_iter().enumerate() {
            if i as u32 == donor_sentinel.0 {
                continue;
            }
            let Some(mut n) = slot else { continue };
            n.left = remap(n.left);
            n.right = remap(n.right);
            n.parent = remap(n.parent);
            self.slots[map[i] as usize] = Some(n);
        }
        donor_root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(x: f64) -> Node<()> {
        Node::leaf(Point::xyz(x, 0.0, 0.0), 0)
    }

    #[test]
    fn alloc_release_recycles_slots() {
        let mut arena: Arena<()> = Arena::from_slots(Vec::new());
        let a = arena.alloc(leaf(1.0));
        let b = arena.alloc(leaf(2.0));
        assert_ne!(a, b);
        arena.release(a);
        let c = arena.alloc(leaf(3.0));
        assert_eq!(a, c, "freed slot should be reused");
        assert_eq!(arena.node(c).point.x, 3.0);
    }

    #[test]
    fn release_subtree_frees_all_descendants() {
        let mut arena: Arena<()> = Arena::from_slots(Vec::new());
        let l = arena.alloc(leaf(0.0));
        let r = arena.alloc(leaf(2.0));
        let mut root = leaf(1.0);
        root.left = Some(l);
        root.right = Some(r);
        let root = arena.alloc(root);
        arena.node_mut(l).parent = Some(root);
        arena.node_mut(r).parent = Some(root);

        arena.release_subtree(root);
        assert_eq!(arena.live_slots(), 0);
    }

    #[test]
    fn absorb_remaps_indices_and_reuses_free_slots() {
        let mut host: Arena<()> = Arena::from_slots(Vec::new());
        let stale = host.alloc(leaf(9.0));
        let kept = host.alloc(leaf(8.0));
        host.release(stale);

        let mut donor: Arena<()> = Arena::from_slots(Vec::new());
        let child = donor.alloc(leaf(1.0));
        let mut top = leaf(2.0);
        top.left = Some(child);
        let top = donor.alloc(top);
        donor.node_mut(child).parent = Some(top);
        let mut sent = leaf(0.0);
        sent.size = 0;
        sent.left = Some(top);
        let sent = donor.alloc(sent);

        let new_root = host.absorb(donor, sent).expect("donor had a root");
        let top_node = host.node(new_root);
        assert_eq!(top_node.point.x, 2.0);
        assert_eq!(top_node.parent, None, "graft arrives unparented");
        let new_child = top_node.left.expect("child survived the graft");
        assert_eq!(host.node(new_child).parent, Some(new_root));
        assert_eq!(host.node(new_child).point.x, 1.0);

        // the freed slot was recycled and the sentinel dropped: two donor
        // nodes fit into one freed plus one fresh slot
        assert_eq!(host.live_slots(), 3);
        assert_eq!(host.node(kept).point.x, 8.0);
    }
}

use std::collections::VecDeque;

use crate::bounds::BoundingBox;
use crate::point::Point;

/// One mutation recorded while a background rebuild holds a snapshot of the
/// subtree it will replace. Replayed in insertion order against the rebuilt
/// subtree before the ownership swap.
#[derive(Clone, Debug)]
pub(crate) enum Operation<D> {
    AddPoint(Point<D>),
    DeletePoint(Point<D>),
    DeleteBox(BoundingBox),
    AddBox(BoundingBox),
    DownsampleDelete(BoundingBox),
    /// A subtree override that crossed into the snapshot region.
    PushDown {
        tree_deleted: bool,
        tree_downsampled: bool,
    },
}

/// Bounded FIFO of pending operations: one foreground writer, one background
/// reader. Exceeding the capacity means mutation is outrunning rebuild
/// bandwidth for good, which is unrecoverable.
#[derive(Debug)]
pub(crate) struct OpLog<D> {
    buf: VecDeque<Operation<D>>,
    cap: usize,
    high_water: usize,
}

impl<D> OpLog<D> {
    pub(crate) fn new(cap: usize) -> Self {
        OpLog {
            buf: VecDeque::new(),
            cap,
            high_water: 0,
        }
    }

    pub(crate) fn push(&mut self, op: Operation<D>) {
        if self.buf.len() >= self.cap {
            panic!(
                "operation log overflow at {} entries: mutation rate exceeds rebuild bandwidth",
                self.cap
            );
        }
        self.buf.push_back(op);
        if self.buf.len() > self.high_water {
            self.high_water = self.buf.len();
        }
    }

    pub(crate) fn pop(&mut self) -> Option<Operation<D>> {
        self.buf.pop_front()
    }

    pub(crate) fn clear(&mut self) {
        self.buf.clear();
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Deepest fill level ever observed. Diagnostic gauge only.
    pub(crate) fn high_water(&self) -> usize {
        self.high_water
    }
}

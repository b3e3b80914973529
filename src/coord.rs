use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::bounds::BoundingBox;
use crate::node::Edge;
use crate::oplog::OpLog;
use crate::point::Point;

/// Tri-state reader counter guarding the subtree under rebuild: `-1` means
/// the rebuilder holds it exclusively, `0` idle, `n > 0` that many searches
/// are inside. Both waits spin with a short sleep; searches are
/// latency-sensitive and the exclusive phases are brief.
#[derive(Debug)]
pub(crate) struct SearchCounter(AtomicI32);

impl SearchCounter {
    pub(crate) fn new() -> Self {
        SearchCounter(AtomicI32::new(0))
    }

    pub(crate) fn enter(&self) {
        loop {
            let cur = self.0.load(Ordering::Acquire);
            if cur >= 0
                && self
                    .0
                    .compare_exchange_weak(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                return;
            }
            thread::sleep(Duration::from_micros(1));
        }
    }

    pub(crate) fn exit(&self) {
        self.0.fetch_sub(1, Ordering::Release);
    }

    /// Block new searches and wait for active ones to drain.
    pub(crate) fn lock_exclusive(&self) {
        loop {
            if self
                .0
                .compare_exchange(0, -1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
            thread::sleep(Duration::from_micros(1));
        }
    }

    pub(crate) fn unlock_exclusive(&self) {
        self.0.store(0, Ordering::Release);
    }
}

/// Points reclaimed by rebuild flattens and explicit deletions, split by the
/// thread that observed them. Drained together by `acquire_removed_points`.
#[derive(Debug)]
pub(crate) struct RemovedLists<D> {
    pub foreground: Vec<Point<D>>,
    pub background: Vec<Point<D>>,
}

impl<D> RemovedLists<D> {
    fn new() -> Self {
        RemovedLists {
            foreground: Vec::new(),
            background: Vec::new(),
        }
    }
}

/// Root metrics cached when a background pass starts, served while the tree
/// state is briefly unreadable.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RootStats {
    pub size: usize,
    pub valid: usize,
    pub alpha_bal: f64,
    pub alpha_del: f64,
    pub range: BoundingBox,
}

impl Default for RootStats {
    fn default() -> Self {
        RootStats {
            size: 0,
            valid: 0,
            alpha_bal: 0.5,
            alpha_del: 0.0,
            range: BoundingBox::new([0.0; 3], [0.0; 3]),
        }
    }
}

/// Shared coordination state between the client thread(s) and the background
/// rebuild thread: the operation log, the published rebuild edge, the search
/// counter, removed-point lists, cached root stats and the termination flag.
#[derive(Debug)]
pub(crate) struct Coordinator<D> {
    pub log: Mutex<OpLog<D>>,
    /// Parent edge of the subtree claimed for background rebuilding. A
    /// published value means a rebuild is pending or in flight.
    pub rebuild_target: Mutex<Option<Edge>>,
    /// Set while the background pass is between snapshot and swap; mutations
    /// crossing the published edge must be logged while it is up.
    pub rebuild_active: AtomicBool,
    pub search: SearchCounter,
    pub removed: Mutex<RemovedLists<D>>,
    pub stats: Mutex<RootStats>,
    pub terminate: AtomicBool,
}

impl<D> Coordinator<D> {
    /// Append to the rebuild log iff a background pass currently holds a
    /// snapshot the operation has to be replayed onto.
    pub(crate) fn log_if_rebuilding(&self, op: crate::oplog::Operation<D>) {
        if self.rebuild_active.load(Ordering::Acquire) {
            self.log.lock().push(op);
        }
    }

    pub(crate) fn new(log_cap: usize) -> Self {
        Coordinator {
            log: Mutex::new(OpLog::new(log_cap)),
            rebuild_target: Mutex::new(None),
            rebuild_active: AtomicBool::new(false),
            search: SearchCounter::new(),
            removed: Mutex::new(RemovedLists::new()),
            stats: Mutex::new(RootStats::default()),
            terminate: AtomicBool::new(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_tracks_readers() {
        let c = SearchCounter::new();
        c.enter();
        c.enter();
        c.exit();
        c.exit();
        c.lock_exclusive();
        c.unlock_exclusive();
        c.enter();
        c.exit();
    }
}

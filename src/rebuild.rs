//! The background rebuild thread: polls for a published parent edge, snapshots
//! the subtree behind it, rebuilds it balanced off to the side, replays the
//! mutations that arrived in the meantime, and swaps ownership back in.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::build;
use crate::coord::RootStats;
use crate::node::{Edge, NodeFlags, Side};
use crate::ops::{self, OpCtx};
use crate::point::Point;
use crate::tree::{Shared, TreeState};

/// Sleep between polls while no rebuild is published.
const IDLE_POLL: Duration = Duration::from_micros(100);

pub(crate) fn spawn<D>(shared: Arc<Shared<D>>) -> JoinHandle<()>
where
    D: Clone + Default + Send + Sync + 'static,
{
    thread::Builder::new()
        .name("kdthree-rebuild".into())
        .spawn(move || run(shared))
        .expect("failed to spawn the rebuild thread")
}

fn run<D>(shared: Arc<Shared<D>>)
where
    D: Clone + Default + Send + Sync + 'static,
{
    loop {
        if shared.coord.terminate.load(Ordering::Acquire) {
            break;
        }
        let target = *shared.coord.rebuild_target.lock();
        if let Some(edge) = target {
            background_pass(&shared, edge);
        }
        thread::sleep(IDLE_POLL);
    }
}

/// One complete rebuild of the subtree owned by `edge`.
fn background_pass<D>(shared: &Shared<D>, edge: Edge)
where
    D: Clone + Default + Send + Sync,
{
    let coord = &shared.coord;
    let mut scratch: Vec<Point<D>> = Vec::new();

    // Snapshot phase. Holding the state read lock keeps mutators out
    // entirely; the search counter additionally drains searches from the
    // target subtree while we flatten it.
    let (old_child, cfg) = {
        let state = shared.state.read();
        coord.rebuild_active.store(true, Ordering::Release);
        // once the active flag is up the publication cannot be withdrawn;
        // re-check that it survived until now
        if *coord.rebuild_target.lock() != Some(edge) {
            coord.rebuild_active.store(false, Ordering::Release);
            return;
        }
        let Some(old_child) = state.arena.node(edge.parent).child(edge.side) else {
            *coord.rebuild_target.lock() = None;
            coord.rebuild_active.store(false, Ordering::Release);
            return;
        };
        debug_assert!(coord.log.lock().is_empty(), "stale entries in the rebuild log");

        if edge.parent == state.sentinel {
            let root = state.arena.node(old_child);
            *coord.stats.lock() = RootStats {
                size: root.size as usize,
                valid: (root.size - root.invalid) as usize,
                alpha_bal: root.alpha_bal,
                alpha_del: root.alpha_del,
                range: root.aabb,
            };
        }

        coord.search.lock_exclusive();
        {
            let live = {
                let n = state.arena.node(old_child);
                (n.size - n.invalid) as usize
            };
            scratch.reserve(live);
            let mut removed = coord.removed.lock();
            ops::flatten_live(
                &state.arena,
                Some(old_child),
                None,
                &mut scratch,
                Some(&mut removed.background),
            );
        }
        coord.search.unlock_exclusive();
        (old_child, state.config)
    };

    // Build the replacement with no locks held; mutations keep landing on
    // the old subtree and are appended to the log.
    let (mut donor, donor_sentinel) = build::build_arena(&mut scratch);

    let mut replayed = 0usize;
    loop {
        let Some(op) = coord.log.lock().pop() else { break };
        let mut ctx = OpCtx {
            arena: &mut donor,
            sentinel: donor_sentinel,
            cfg,
            coord: None,
            target: None,
        };
        ops::run_operation(&mut ctx, op);
        replayed += 1;
        if replayed % 10 == 0 {
            thread::yield_now();
        }
    }

    // Swap phase. Under the write lock no further log entries can appear;
    // drain the stragglers, then transfer ownership.
    let mut state = shared.state.write();
    let state = &mut *state;
    loop {
        let Some(op) = coord.log.lock().pop() else { break };
        let mut ctx = OpCtx {
            arena: &mut donor,
            sentinel: donor_sentinel,
            cfg,
            coord: None,
            target: None,
        };
        ops::run_operation(&mut ctx, op);
    }

    let mut target = coord.rebuild_target.lock();
    if *target != Some(edge) {
        // the whole tree was replaced while we worked; drop the build
        coord.log.lock().clear();
        coord.rebuild_active.store(false, Ordering::Release);
        return;
    }

    coord.search.lock_exclusive();
    let cur = state.arena.node(edge.parent).child(edge.side);
    assert_eq!(
        cur,
        Some(old_child),
        "parent edge no longer owns the subtree being rebuilt"
    );

    let new_root = state.arena.absorb(donor, donor_sentinel);
    state.arena.node_mut(edge.parent).set_child(edge.side, new_root);
    if let Some(r) = new_root {
        state.arena.node_mut(r).parent = Some(edge.parent);
        ops::update(&mut state.arena, state.sentinel, r);
    }
    refresh_ancestors(state, edge);
    state.arena.release_subtree(old_child);
    coord.search.unlock_exclusive();

    *target = None;
    drop(target);
    coord.rebuild_active.store(false, Ordering::Release);
}

/// Walk from the swap point toward the root, refreshing aggregates. Stops at
/// a node a mutation currently holds, or one whose push toward our path is
/// still pending; that subtree state is about to change again anyway.
fn refresh_ancestors<D: Clone>(state: &mut TreeState<D>, edge: Edge) {
    let mut cur = edge.parent;
    let mut came = edge.side;
    loop {
        if cur == state.sentinel {
            break;
        }
        {
            let n = state.arena.node(cur);
            if n.flags.contains(NodeFlags::WORKING) || n.flags.contains(came.push_flag()) {
                break;
            }
        }
        ops::update(&mut state.arena, state.sentinel, cur);
        let Some(parent) = state.arena.node(cur).parent else {
            break;
        };
        if parent == state.sentinel {
            break;
        }
        came = if state.arena.node(parent).left == Some(cur) {
            Side::Left
        } else {
            Side::Right
        };
        cur = parent;
    }
}

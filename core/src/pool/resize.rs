//! Pool resizing, demotion, and dissolution.
//!
//! Every persistent-pool size change funnels through
//! [`HugePool::set_max_huge_pages`], serialized per class by the resize
//! mutex. Demotion splits a free folio of one class into folios of the next
//! smaller class; it takes both classes' resize mutexes, larger size first,
//! so it cannot deadlock against a concurrent resize.

use alloc::vec::Vec;

use spin::MutexGuard;

use hugetlb_hal::{CancelToken, GfpFlags, NodeId, NodeMask, PageRange};

use crate::error::{PoolError, Result};
use crate::folio::{FolioFlags, FolioId};
use crate::hstate::ClassId;
use crate::pool::{HugePool, PoolState};

/// Retry budget for the "refcount zero but not yet on a free list" window.
/// The window is a few instructions wide in the donor thread; a bounded spin
/// converts the unbounded-retry hazard into a `Busy` the caller can act on.
pub(crate) const DISSOLVE_RETRIES: u32 = 16;

impl HugePool {
    /// Move one page between surplus and persistent accounting, round-robin
    /// across `allowed`. Returns false when no node qualifies.
    fn adjust_pool_surplus(
        state: &mut PoolState,
        class: ClassId,
        allowed: &NodeMask,
        delta: i64,
    ) -> bool {
        debug_assert!(delta == 1 || delta == -1);
        let mut found = None;

        if delta < 0 {
            for _ in 0..allowed.weight() {
                let Some(nid) = state.classes[class.index()].next_node_to_alloc(allowed) else {
                    break;
                };
                if state.classes[class.index()].surplus_huge_pages_node[nid.index()] > 0 {
                    found = Some(nid);
                    break;
                }
            }
        } else {
            for _ in 0..allowed.weight() {
                let Some(nid) = state.classes[class.index()].next_node_to_free(allowed) else {
                    break;
                };
                let counters = &state.classes[class.index()];
                if counters.surplus_huge_pages_node[nid.index()]
                    < counters.nr_huge_pages_node[nid.index()]
                {
                    found = Some(nid);
                    break;
                }
            }
        }

        let Some(nid) = found else { return false };
        let counters = &mut state.classes[class.index()];
        if delta < 0 {
            counters.surplus_huge_pages -= 1;
            counters.surplus_huge_pages_node[nid.index()] -= 1;
        } else {
            counters.surplus_huge_pages += 1;
            counters.surplus_huge_pages_node[nid.index()] += 1;
        }
        true
    }

    /// When shrinking, free pages from the restricted low-memory zone first,
    /// stopping once the pool is down to `count` pages.
    fn try_to_free_low<'a>(
        &'a self,
        mut state: MutexGuard<'a, PoolState>,
        class: ClassId,
        count: u64,
        allowed: &NodeMask,
    ) -> MutexGuard<'a, PoolState> {
        if self.class(class).is_gigantic() {
            return state;
        }

        let mut list = Vec::new();
        'nodes: for nid in allowed.iter() {
            if nid.index() >= self.nodes() {
                continue;
            }
            let candidates: Vec<FolioId> = state.classes[class.index()].free_lists[nid.index()]
                .iter()
                .copied()
                .collect();
            for id in candidates {
                if count >= state.classes[class.index()].nr_huge_pages {
                    break 'nodes;
                }
                if !state.arena.folio(id).range.low_memory {
                    continue;
                }
                Self::remove_folio(&mut state, id, false, false);
                list.push(id);
            }
        }

        drop(state);
        self.update_and_free_folios(list);
        self.lock()
    }

    /// Resize the persistent pool of `class` to `count` pages.
    ///
    /// With `node` set, `count` is the target for that node alone and the
    /// global target is derived from it. Growth happens one page at a time
    /// with the lock dropped per allocation, and aborts (keeping partial
    /// progress) on allocation failure or cancellation. Shrinking frees free
    /// pages down to the reservation floor and marks the rest surplus rather
    /// than violating it.
    pub fn set_max_huge_pages(
        &self,
        class: ClassId,
        count: u64,
        node: Option<NodeId>,
        mask: Option<NodeMask>,
        cancel: Option<&CancelToken>,
    ) -> Result<()> {
        let allowed = match node {
            Some(nid) => NodeMask::single(nid),
            None => mask.unwrap_or_else(|| self.provider().nodes_with_memory()),
        };
        let mut noretry = NodeMask::empty();

        let _resize = self.resize_locks[class.index()].lock();
        let mut state = self.lock();

        let mut count = count;
        if let Some(nid) = node {
            // Per-node request: translate into a global target. Overflow
            // means "as many as possible".
            let counters = &state.classes[class.index()];
            let others = counters.nr_huge_pages - counters.nr_huge_pages_node[nid.index()];
            count = count.checked_add(others).unwrap_or(u64::MAX);
        }

        // Grow: first reclassify surplus pages as persistent, then allocate
        // fresh pages one at a time.
        while state.classes[class.index()].surplus_huge_pages > 0
            && count > state.classes[class.index()].persistent()
        {
            if !Self::adjust_pool_surplus(&mut state, class, &allowed, -1) {
                break;
            }
        }

        let mut aborted = false;
        while count > state.classes[class.index()].persistent() {
            drop(state);
            let ok = self.alloc_pool_huge_page(class, &allowed, &mut noretry);
            state = self.lock();
            if !ok {
                aborted = true;
                break;
            }
            // Bail on cancellation; pages already added stay in the pool.
            if cancel.map_or(false, |c| c.is_cancelled()) {
                aborted = true;
                break;
            }
        }

        if !aborted {
            // Shrink: free pages down to max(count, reservation floor),
            // low-memory pages first, then surplus-mark the remainder.
            let counters = &state.classes[class.index()];
            let floor = counters.resv_huge_pages + counters.nr_huge_pages
                - counters.free_huge_pages;
            let min_count = count.max(floor);
            state = self.try_to_free_low(state, class, min_count, &allowed);

            let mut list = Vec::new();
            while min_count < state.classes[class.index()].persistent() {
                match Self::remove_pool_folio(&mut state, class, &allowed, false) {
                    Some(id) => list.push(id),
                    None => break,
                }
            }
            drop(state);
            self.update_and_free_folios(list);
            state = self.lock();

            while count < state.classes[class.index()].persistent() {
                if !Self::adjust_pool_surplus(&mut state, class, &allowed, 1) {
                    break;
                }
            }
        }

        let counters = &mut state.classes[class.index()];
        counters.max_huge_pages = counters.persistent();
        Ok(())
    }

    // =========================================================================
    // Demotion
    // =========================================================================

    /// Demote up to `count` free folios of `class` into its demote-target
    /// class. Returns the number of source folios demoted; fails with `Busy`
    /// when only poisoned (or no) free folios remain.
    pub fn demote(&self, class: ClassId, count: u64, mask: Option<NodeMask>) -> Result<u64> {
        let Some(target) = self.class(class).demote else {
            log::warn!(
                "HugeTLB: {} has no demotion target",
                self.class(class).name
            );
            return Err(PoolError::Invalid);
        };
        let allowed = mask.unwrap_or_else(|| self.all_nodes());

        let _resize = self.resize_locks[class.index()].lock();
        let mut done = 0;
        while done < count {
            let state = self.lock();
            match self.demote_pool_folio(state, class, target, &allowed) {
                Ok(()) => done += 1,
                Err(err) if done == 0 => return Err(err),
                Err(_) => break,
            }
        }
        Ok(done)
    }

    /// Pick one free, clean folio round-robin and demote it.
    fn demote_pool_folio(
        &self,
        mut state: MutexGuard<'_, PoolState>,
        class: ClassId,
        target: ClassId,
        allowed: &NodeMask,
    ) -> Result<()> {
        let mut candidate = None;
        for _ in 0..allowed.weight() {
            let Some(nid) = state.classes[class.index()].next_node_to_free(allowed) else {
                break;
            };
            if nid.index() >= self.nodes() {
                continue;
            }
            candidate = state.classes[class.index()].free_lists[nid.index()]
                .iter()
                .copied()
                .find(|&id| !state.arena.folio(id).flags.contains(FolioFlags::HWPOISON));
            if candidate.is_some() {
                break;
            }
        }

        let Some(id) = candidate else {
            // Every free page is poisoned (or there are none): tell the
            // caller not to retry.
            return Err(PoolError::Busy);
        };
        self.demote_free_folio(state, class, target, id)
    }

    /// Split one frozen free folio of `class` into `target`-sized folios and
    /// feed them into the target pool.
    fn demote_free_folio(
        &self,
        mut state: MutexGuard<'_, PoolState>,
        class: ClassId,
        target: ClassId,
        id: FolioId,
    ) -> Result<()> {
        let optimized = state.arena.folio(id).flags.contains(FolioFlags::VMEMMAP_OPTIMIZED);
        Self::remove_folio(&mut state, id, false, true);
        drop(state);

        let src_order = self.class(class).order;
        if optimized {
            // Split requires the tail metadata back; restoration blocks and
            // can fail, in which case the folio returns to its pool whole.
            if self.vmemmap.restore(Self::vmemmap_pages(src_order)).is_err() {
                let mut state = self.lock();
                Self::add_folio(&mut state, id, false);
                return Err(PoolError::OutOfMemory);
            }
            let mut state = self.lock();
            state.arena.folio_mut(id).flags.remove(FolioFlags::VMEMMAP_OPTIMIZED);
        }

        // The compound folio stops existing here; its range is re-registered
        // piecewise below.
        let range = {
            let mut state = self.lock();
            state.arena.remove(id).range
        };

        // Target mutex taken while holding the (larger) source mutex.
        let _target_resize = self.resize_locks[target.index()].lock();
        let step = self.class(target).pages_per_huge_page();
        let pieces = range.pages / step;
        for i in 0..pieces {
            let sub = PageRange {
                pfn: range.pfn + i * step,
                pages: step,
                node: range.node,
                low_memory: range.low_memory,
            };
            let sub_id = self.prep_new_folio(target, sub);
            self.free_folio(sub_id);
        }

        let mut state = self.lock();
        state.classes[class.index()].max_huge_pages =
            state.classes[class.index()].max_huge_pages.saturating_sub(1);
        state.classes[target.index()].max_huge_pages += pieces;
        Ok(())
    }

    // =========================================================================
    // Dissolution
    // =========================================================================

    /// Dissolve a free folio back into provider pages, shrinking the pool.
    ///
    /// `Busy` when the folio is in use, reserved-against, or stuck in the
    /// not-yet-enqueued window past the retry budget; `OutOfMemory` when its
    /// vmemmap cannot be restored (the folio goes back to the pool).
    pub fn dissolve_free_folio(&self, id: FolioId) -> Result<()> {
        let mut attempts = 0;
        loop {
            let mut state = self.lock();
            let Some(folio) = state.arena.get(id) else {
                // Already dissolved by someone else.
                return Ok(());
            };
            let class = folio.class;
            if folio.refs() > 0 {
                return Err(PoolError::Busy);
            }
            if !folio.is_free() {
                // Frozen but not yet enqueued by its freeing thread.
                drop(state);
                attempts += 1;
                if attempts > DISSOLVE_RETRIES {
                    return Err(PoolError::Busy);
                }
                core::hint::spin_loop();
                continue;
            }
            if state.classes[class.index()].available() == 0 {
                return Err(PoolError::Busy);
            }

            let optimized = state.arena.folio(id).flags.contains(FolioFlags::VMEMMAP_OPTIMIZED);
            Self::remove_folio(&mut state, id, false, false);
            state.classes[class.index()].max_huge_pages =
                state.classes[class.index()].max_huge_pages.saturating_sub(1);
            drop(state);

            if optimized {
                let order = self.class(class).order;
                if self.vmemmap.restore(Self::vmemmap_pages(order)).is_err() {
                    let mut state = self.lock();
                    Self::add_folio(&mut state, id, false);
                    state.classes[class.index()].max_huge_pages += 1;
                    return Err(PoolError::OutOfMemory);
                }
                let mut state = self.lock();
                state.arena.folio_mut(id).flags.remove(FolioFlags::VMEMMAP_OPTIMIZED);
            }

            self.update_and_free_folio(id);
            return Ok(());
        }
    }

    /// Replace a free folio with a freshly allocated one on the same node,
    /// then dissolve the old folio. Pool counters stay stable throughout.
    pub fn replace_free_folio(&self, old: FolioId) -> Result<()> {
        let (class, nid) = {
            let state = self.lock();
            match state.arena.get(old) {
                None => return Ok(()),
                Some(folio) => (folio.class, folio.range.node),
            }
        };
        // Gigantic classes depend on the contiguous allocator, which may in
        // turn be waiting on us; bail out instead of retrying.
        if self.class(class).is_gigantic() {
            return Err(PoolError::OutOfMemory);
        }

        let Some(range) =
            self.alloc_buddy_range(class, GfpFlags::THISNODE, Some(nid), None, None)
        else {
            return Err(PoolError::OutOfMemory);
        };
        let new_id = self.insert_fresh_folio(class, range, false);

        let mut attempts = 0;
        loop {
            let mut state = self.lock();
            let Some(folio) = state.arena.get(old) else {
                // Freed from under us; drop the replacement too.
                drop(state);
                self.update_and_free_folio(new_id);
                return Ok(());
            };
            if folio.refs() > 0 {
                drop(state);
                self.update_and_free_folio(new_id);
                return Err(PoolError::Busy);
            }
            if !folio.is_free() {
                drop(state);
                attempts += 1;
                if attempts > DISSOLVE_RETRIES {
                    self.update_and_free_folio(new_id);
                    return Err(PoolError::Busy);
                }
                core::hint::spin_loop();
                continue;
            }

            // Swap: retire the old folio, account and enqueue the new one
            // in the same lock hold so the counters never dip.
            Self::remove_folio(&mut state, old, false, false);
            let new_nid = state.arena.folio(new_id).range.node;
            let counters = &mut state.classes[class.index()];
            counters.nr_huge_pages += 1;
            counters.nr_huge_pages_node[new_nid.index()] += 1;
            Self::enqueue_folio(&mut state, new_id);
            drop(state);

            self.update_and_free_folio(old);
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolConfig, SizeClassConfig};
    use crate::pool::tests::{class0, test_pool, HP, ORDER};
    use alloc::sync::Arc;
    use hugetlb_hal::SimProvider;

    #[test]
    fn grow_and_shrink() {
        let (pool, provider) = test_pool(2, 8, 0);
        let class = class0(&pool);

        pool.set_max_huge_pages(class, 4, None, None, None).unwrap();
        let stats = pool.stats(class);
        assert_eq!(stats.total, 4);
        assert_eq!(stats.per_node_total, [2, 2]);

        pool.set_max_huge_pages(class, 1, None, None, None).unwrap();
        assert_eq!(pool.stats(class).total, 1);
        assert_eq!(provider.outstanding_pages(), HP);
    }

    #[test]
    fn node_specific_resize() {
        let (pool, _) = test_pool(2, 8, 0);
        let class = class0(&pool);

        pool.set_max_huge_pages(class, 3, Some(hugetlb_hal::NodeId::new(1)), None, None)
            .unwrap();
        let stats = pool.stats(class);
        assert_eq!(stats.per_node_total, [0, 3]);

        // Shrinking node 1 leaves other nodes untouched.
        pool.set_max_huge_pages(class, 1, Some(hugetlb_hal::NodeId::new(1)), None, None)
            .unwrap();
        let stats = pool.stats(class);
        assert_eq!(stats.per_node_total, [0, 1]);
    }

    #[test]
    fn shrink_never_frees_reserved_pages() {
        let (pool, provider) = test_pool(1, 8, 4);
        let class = class0(&pool);
        pool.acct_memory(class, 2).unwrap();

        pool.set_max_huge_pages(class, 0, None, None, None).unwrap();
        let stats = pool.stats(class);
        // Reserved-but-unsurplus pages stay; the rest became surplus or were
        // freed.
        assert!(stats.free >= stats.reserved - stats.surplus);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.reserved, 2);
        assert_eq!(provider.outstanding_pages(), 2 * HP);

        // Dropping the reservation lets the surplus drain.
        pool.acct_memory(class, -2).unwrap();
        assert_eq!(pool.stats(class).total, 0);
    }

    #[test]
    fn growth_aborts_on_cancellation_keeping_progress() {
        let (pool, _) = test_pool(1, 16, 0);
        let class = class0(&pool);
        let cancel = CancelToken::new();
        cancel.cancel();

        pool.set_max_huge_pages(class, 8, None, None, Some(&cancel)).unwrap();
        let stats = pool.stats(class);
        // One page lands before the cancellation check fires; partial
        // progress is kept, not rolled back.
        assert_eq!(stats.total, 1);
        assert_eq!(pool.stats(class).free, 1);
    }

    #[test]
    fn shrink_frees_low_memory_pages_first() {
        let provider = Arc::new(SimProvider::with_low_memory(1, 8 * HP, 2 * HP));
        let config = PoolConfig::new(12, 1).size(SizeClassConfig::new(ORDER).boot_pages(4));
        let pool = HugePool::new(config, provider).unwrap();
        let class = class0(&pool);

        pool.set_max_huge_pages(class, 2, None, None, None).unwrap();
        // The two low-memory folios were the ones freed.
        let state = pool.lock();
        for list in &state.classes[class.index()].free_lists {
            for &id in list {
                assert!(!state.arena.folio(id).range.low_memory);
            }
        }
    }

    fn two_class_pool() -> (Arc<HugePool>, ClassId, ClassId) {
        let provider = Arc::new(SimProvider::new(1, 16 * HP));
        let config = PoolConfig::new(12, 1)
            .size(SizeClassConfig::new(ORDER).boot_pages(2))
            .size(SizeClassConfig::new(4));
        let pool = HugePool::new(config, provider).unwrap();
        let big = pool.class_for_order(ORDER).unwrap();
        let small = pool.class_for_order(4).unwrap();
        (pool, big, small)
    }

    #[test]
    fn demote_splits_counters_exactly() {
        let (pool, big, small) = two_class_pool();
        let pieces = 1u64 << (ORDER - 4);

        assert_eq!(pool.demote(big, 1, None).unwrap(), 1);
        let big_stats = pool.stats(big);
        let small_stats = pool.stats(small);
        assert_eq!(big_stats.total, 1);
        assert_eq!(big_stats.free, 1);
        assert_eq!(small_stats.total, pieces);
        assert_eq!(small_stats.free, pieces);
    }

    #[test]
    fn demote_with_only_poisoned_pages_is_busy() {
        let (pool, big, _) = two_class_pool();
        let state = pool.lock();
        let ids: Vec<FolioId> = state.classes[big.index()].free_lists[0].iter().copied().collect();
        drop(state);
        for id in ids {
            pool.poison_folio(id);
        }
        assert_eq!(pool.demote(big, 1, None), Err(PoolError::Busy));
    }

    #[test]
    fn demote_without_target_is_invalid() {
        let (pool, _) = test_pool(1, 4, 1);
        let class = class0(&pool);
        assert_eq!(pool.demote(class, 1, None), Err(PoolError::Invalid));
    }

    #[test]
    fn dissolve_frees_a_free_folio() {
        let (pool, provider) = test_pool(1, 4, 2);
        let class = class0(&pool);
        let id = {
            let state = pool.lock();
            state.classes[class.index()].free_lists[0][0]
        };

        pool.dissolve_free_folio(id).unwrap();
        let stats = pool.stats(class);
        assert_eq!(stats.total, 1);
        assert_eq!(provider.outstanding_pages(), HP);

        // Dissolving again reports success: it is already gone.
        pool.dissolve_free_folio(id).unwrap();
    }

    #[test]
    fn dissolve_in_use_folio_is_busy() {
        let (pool, _) = test_pool(1, 4, 2);
        let class = class0(&pool);
        let id = {
            let mut state = pool.lock();
            HugePool::dequeue_folio_node_exact(&mut state, class, hugetlb_hal::NodeId::new(0))
                .unwrap()
        };
        assert_eq!(pool.dissolve_free_folio(id), Err(PoolError::Busy));
        pool.put_folio(id);
        pool.dissolve_free_folio(id).unwrap();
    }

    #[test]
    fn dissolve_vmemmap_restore_failure_reinstates() {
        let provider = Arc::new(SimProvider::new(1, 8 * HP));
        let config = PoolConfig::new(12, 1)
            .size(SizeClassConfig::new(ORDER).boot_pages(2))
            .vmemmap_optimize();
        let pool = HugePool::new(config, provider).unwrap();
        let class = class0(&pool);
        let id = {
            let state = pool.lock();
            state.classes[class.index()].free_lists[0][0]
        };

        pool.vmemmap.fail_next_restores(1);
        assert_eq!(pool.dissolve_free_folio(id), Err(PoolError::OutOfMemory));
        let stats = pool.stats(class);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.free, 2);

        pool.dissolve_free_folio(id).unwrap();
        assert_eq!(pool.stats(class).total, 1);
    }

    #[test]
    fn replace_free_folio_keeps_counters_stable() {
        let (pool, _) = test_pool(1, 8, 2);
        let class = class0(&pool);
        let id = {
            let state = pool.lock();
            state.classes[class.index()].free_lists[0][0]
        };

        pool.replace_free_folio(id).unwrap();
        let stats = pool.stats(class);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.free, 2);
        // The old folio record is gone.
        assert!(pool.lock().arena.get(id).is_none());
    }
}

//! Free-list pool manager.
//!
//! One [`HugePool`] owns every size class: per-node free lists, the folio
//! arena, and all counters, guarded by a single global lock. The lock is
//! always dropped around provider calls and vmemmap restoration (both may
//! block), and counters are re-validated after re-acquisition.
//!
//! Lock order, outermost first: per-class resize mutex (larger size first)
//! -> global pool lock -> reservation-map lock -> subpool lock.

mod resize;
mod surplus;

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::{Mutex, MutexGuard};

use hugetlb_hal::{GfpFlags, NodeId, NodeMask, PageRange, PhysicalPageProvider};

use crate::config::PoolConfig;
use crate::error::Result;
use crate::folio::{Folio, FolioArena, FolioFlags, FolioId, PageState};
use crate::hstate::{ClassCounters, ClassId, ClassStats, SizeClass};
use crate::vma::{vma_has_reserves, Vma};
use crate::vmemmap::VmemmapEngine;

/// Hashed fault-serialization mutexes (power of two).
pub(crate) const FAULT_MUTEXES: usize = 64;

/// Global mutable pool state: all counters and the folio arena.
pub(crate) struct PoolState {
    pub classes: Vec<ClassCounters>,
    pub arena: FolioArena,
}

/// The huge-page pool: size classes, free lists, and the allocation engine.
pub struct HugePool {
    nodes: usize,
    classes: Vec<SizeClass>,
    state: Mutex<PoolState>,
    /// Serializes pool-size changes per class.
    resize_locks: Vec<Mutex<()>>,
    provider: Arc<dyn PhysicalPageProvider>,
    pub(crate) vmemmap: VmemmapEngine,
    /// Serializes faults on the same (inode, index).
    pub(crate) fault_mutexes: Vec<Mutex<()>>,
}

impl HugePool {
    /// Build a pool from `config`, pre-allocating boot pages.
    pub fn new(config: PoolConfig, provider: Arc<dyn PhysicalPageProvider>) -> Result<Arc<Self>> {
        config.validate()?;
        let classes = config.build_classes();
        let nodes = config.nodes;

        let pool = Arc::new(Self {
            nodes,
            resize_locks: (0..classes.len()).map(|_| Mutex::new(())).collect(),
            state: Mutex::new(PoolState {
                classes: (0..classes.len()).map(|_| ClassCounters::new(nodes)).collect(),
                arena: FolioArena::new(),
            }),
            classes,
            provider,
            vmemmap: VmemmapEngine::new(config.vmemmap_optimize),
            fault_mutexes: (0..FAULT_MUTEXES).map(|_| Mutex::new(())).collect(),
        });

        for (i, size_cfg) in config.sizes.iter().enumerate() {
            let class = ClassId(i);
            {
                let mut state = pool.state.lock();
                state.classes[i].nr_overcommit = size_cfg.overcommit_limit;
            }
            pool.boot_alloc(class, size_cfg.boot_pages, size_cfg.boot_pages_per_node.as_deref());
            let stats = pool.stats(class);
            log::info!(
                "HugeTLB: registered {} page size, pre-allocated {} pages",
                pool.classes[i].name,
                stats.total
            );
        }
        if pool.vmemmap.optimizable() {
            log::info!("HugeTLB: vmemmap optimization enabled");
        }
        Ok(pool)
    }

    fn boot_alloc(&self, class: ClassId, boot_pages: u64, per_node: Option<&[u64]>) {
        let mut noretry = NodeMask::empty();
        if let Some(per_node) = per_node {
            for (nid, &want) in per_node.iter().enumerate() {
                let node = NodeId::new(nid as u32);
                let mut got = 0;
                for _ in 0..want {
                    let allowed = NodeMask::single(node);
                    if !self.alloc_pool_huge_page(class, &allowed, &mut noretry) {
                        break;
                    }
                    got += 1;
                }
                if got < want {
                    log::warn!(
                        "HugeTLB: allocating {} of {} {} pages on node {} failed, rest ignored",
                        got,
                        want,
                        self.classes[class.index()].name,
                        nid
                    );
                }
                let mut state = self.state.lock();
                state.classes[class.index()].max_huge_pages += got;
            }
        } else {
            let allowed = self.provider.nodes_with_memory();
            let mut got = 0;
            for _ in 0..boot_pages {
                if !self.alloc_pool_huge_page(class, &allowed, &mut noretry) {
                    break;
                }
                got += 1;
            }
            if got < boot_pages {
                log::warn!(
                    "HugeTLB: allocation of {} of {} {} pages failed, rest ignored",
                    got,
                    boot_pages,
                    self.classes[class.index()].name
                );
            }
            let mut state = self.state.lock();
            state.classes[class.index()].max_huge_pages = got;
        }
    }

    // =========================================================================
    // Registry queries
    // =========================================================================

    /// Registered size classes.
    pub fn classes(&self) -> &[SizeClass] {
        &self.classes
    }

    /// Descriptor of one class.
    pub fn class(&self, id: ClassId) -> &SizeClass {
        &self.classes[id.index()]
    }

    /// Class serving pages of the given order.
    pub fn class_for_order(&self, order: u32) -> Option<ClassId> {
        self.classes.iter().find(|c| c.order == order).map(|c| c.id)
    }

    /// NUMA nodes the pool tracks.
    pub fn nodes(&self) -> usize {
        self.nodes
    }

    /// Counter snapshot for one class.
    pub fn stats(&self, class: ClassId) -> ClassStats {
        let state = self.state.lock();
        let counters = &state.classes[class.index()];
        ClassStats {
            order: self.classes[class.index()].order,
            total: counters.nr_huge_pages,
            free: counters.free_huge_pages,
            reserved: counters.resv_huge_pages,
            surplus: counters.surplus_huge_pages,
            per_node_total: counters.nr_huge_pages_node.clone(),
            per_node_free: counters.free_huge_pages_node.clone(),
            per_node_surplus: counters.surplus_huge_pages_node.clone(),
        }
    }

    /// Base pages across all pool pages of all classes.
    pub fn total_pages(&self) -> u64 {
        let state = self.state.lock();
        self.classes
            .iter()
            .map(|c| state.classes[c.id.index()].nr_huge_pages * c.pages_per_huge_page())
            .sum()
    }

    /// Set the surplus overcommit limit for a class.
    pub fn set_overcommit(&self, class: ClassId, limit: u64) {
        self.state.lock().classes[class.index()].nr_overcommit = limit;
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock()
    }

    pub(crate) fn provider(&self) -> &dyn PhysicalPageProvider {
        &*self.provider
    }

    pub(crate) fn all_nodes(&self) -> NodeMask {
        NodeMask::first_nodes(self.nodes)
    }

    /// Folio flag query, mainly for tests and the fault layer.
    pub fn folio_has_flag(&self, id: FolioId, flag: FolioFlags) -> bool {
        self.state.lock().arena.folio(id).flags.contains(flag)
    }

    /// Node a folio lives on.
    pub fn folio_node(&self, id: FolioId) -> NodeId {
        self.state.lock().arena.folio(id).range.node
    }

    /// Mark a folio hardware-poisoned.
    pub fn poison_folio(&self, id: FolioId) {
        self.state.lock().arena.folio_mut(id).flags.insert(FolioFlags::HWPOISON);
    }

    // =========================================================================
    // Free lists
    // =========================================================================

    /// Put a frozen folio on its node's free list.
    pub(crate) fn enqueue_folio(state: &mut PoolState, id: FolioId) {
        let folio = state.arena.folio_mut(id);
        assert_eq!(folio.refs(), 0, "enqueue of a referenced folio");
        let (class, nid) = (folio.class, folio.range.node);
        folio.state = PageState::Free;
        let counters = &mut state.classes[class.index()];
        counters.free_lists[nid.index()].push_back(id);
        counters.free_huge_pages += 1;
        counters.free_huge_pages_node[nid.index()] += 1;
    }

    /// Take one clean folio off a node's free list.
    pub(crate) fn dequeue_folio_node_exact(
        state: &mut PoolState,
        class: ClassId,
        nid: NodeId,
    ) -> Option<FolioId> {
        let pos = {
            let counters = &state.classes[class.index()];
            counters.free_lists[nid.index()]
                .iter()
                .position(|&id| !state.arena.folio(id).flags.contains(FolioFlags::HWPOISON))?
        };
        let counters = &mut state.classes[class.index()];
        let id = counters.free_lists[nid.index()].remove(pos).expect("free list slot");
        counters.free_huge_pages -= 1;
        counters.free_huge_pages_node[nid.index()] -= 1;
        let folio = state.arena.folio_mut(id);
        folio.state = PageState::Active { refs: 1 };
        Some(id)
    }

    /// Dequeue walking the preferred node first, then the mask (or every
    /// node). The pool is node-aware, not zone-aware.
    pub(crate) fn dequeue_folio_nodemask(
        &self,
        state: &mut PoolState,
        class: ClassId,
        preferred: Option<NodeId>,
        mask: Option<&NodeMask>,
    ) -> Option<FolioId> {
        let walk = mask.copied().unwrap_or_else(|| self.all_nodes());
        let start = preferred.unwrap_or(NodeId::new(0));

        let mut tried_start = false;
        if walk.contains(start) {
            tried_start = true;
            if let Some(id) = Self::dequeue_folio_node_exact(state, class, start) {
                return Some(id);
            }
        }
        let mut nid = start;
        for _ in 0..walk.weight() {
            nid = walk.next_in(nid)?;
            if nid == start && tried_start {
                continue;
            }
            if let Some(id) = Self::dequeue_folio_node_exact(state, class, nid) {
                return Some(id);
            }
        }
        None
    }

    /// Reservation-aware dequeue on behalf of a mapping: never dips below
    /// the reserved watermark unless this VMA's reservation is the one
    /// being consumed.
    pub(crate) fn dequeue_folio_vma(
        &self,
        state: &mut PoolState,
        class: ClassId,
        vma: &Vma,
        avoid_reserve: bool,
        chg: u64,
    ) -> Option<FolioId> {
        let available = state.classes[class.index()].available();

        // A child of a private mapping gets no reserves; make sure it cannot
        // steal them from the pool either.
        if !vma_has_reserves(vma, chg) && available == 0 {
            return None;
        }
        if avoid_reserve && available == 0 {
            return None;
        }

        let (preferred, mut mask, preferred_many) = vma.policy.resolve();
        let mut folio = None;
        if preferred_many {
            folio = self.dequeue_folio_nodemask(state, class, preferred, mask.as_ref());
            // Fall back to every node if the preferred set came up empty.
            mask = None;
        }
        if folio.is_none() {
            folio = self.dequeue_folio_nodemask(state, class, preferred, mask.as_ref());
        }

        if let Some(id) = folio {
            if !avoid_reserve && vma_has_reserves(vma, chg) {
                state.arena.folio_mut(id).flags.insert(FolioFlags::RESTORE_RESERVE);
                state.classes[class.index()].resv_huge_pages -= 1;
            }
        }
        folio
    }

    /// Remove one free folio, round-robin across `allowed`, keeping per-node
    /// counts balanced. With `acct_surplus`, only nodes holding surplus are
    /// eligible and surplus counters are adjusted.
    pub(crate) fn remove_pool_folio(
        state: &mut PoolState,
        class: ClassId,
        allowed: &NodeMask,
        acct_surplus: bool,
    ) -> Option<FolioId> {
        for _ in 0..allowed.weight() {
            let nid = state.classes[class.index()].next_node_to_free(allowed)?;
            let counters = &state.classes[class.index()];
            let eligible = (!acct_surplus || counters.surplus_huge_pages_node[nid.index()] > 0)
                && !counters.free_lists[nid.index()].is_empty();
            if eligible {
                let id = state.classes[class.index()].free_lists[nid.index()][0];
                Self::remove_folio(state, id, acct_surplus, false);
                return Some(id);
            }
        }
        None
    }

    // =========================================================================
    // Folio add/remove
    // =========================================================================

    /// Detach a folio from the pool: off the free list (if on one) and out
    /// of the counters. With `for_demote` the folio stays frozen; otherwise
    /// the caller ends up holding the reference.
    pub(crate) fn remove_folio(
        state: &mut PoolState,
        id: FolioId,
        adjust_surplus: bool,
        for_demote: bool,
    ) {
        let folio = state.arena.folio(id);
        let (class, nid, was_free) = (folio.class, folio.range.node, folio.is_free());
        debug_assert!(folio.cgroup.is_none(), "removing a charged folio");

        let counters = &mut state.classes[class.index()];
        if was_free {
            let pos = counters.free_lists[nid.index()]
                .iter()
                .position(|&f| f == id)
                .expect("free folio not on its free list");
            counters.free_lists[nid.index()].remove(pos);
            counters.free_huge_pages -= 1;
            counters.free_huge_pages_node[nid.index()] -= 1;
        }
        if adjust_surplus {
            counters.surplus_huge_pages -= 1;
            counters.surplus_huge_pages_node[nid.index()] -= 1;
        }
        counters.nr_huge_pages -= 1;
        counters.nr_huge_pages_node[nid.index()] -= 1;

        let folio = state.arena.folio_mut(id);
        folio.state = if for_demote {
            PageState::Active { refs: 0 }
        } else {
            PageState::Active { refs: 1 }
        };
    }

    /// Put a folio whose vmemmap could not be restored back into the pool.
    pub(crate) fn add_folio(state: &mut PoolState, id: FolioId, adjust_surplus: bool) {
        let folio = state.arena.folio(id);
        debug_assert!(folio.flags.contains(FolioFlags::VMEMMAP_OPTIMIZED));
        let (class, nid) = (folio.class, folio.range.node);

        let counters = &mut state.classes[class.index()];
        counters.nr_huge_pages += 1;
        counters.nr_huge_pages_node[nid.index()] += 1;
        if adjust_surplus {
            counters.surplus_huge_pages += 1;
            counters.surplus_huge_pages_node[nid.index()] += 1;
        }

        state.arena.folio_mut(id).state = PageState::Active { refs: 0 };
        Self::enqueue_folio(state, id);
    }

    // =========================================================================
    // Fresh allocation
    // =========================================================================

    /// Metadata pages releasable per folio of `order` (one retained).
    pub(crate) fn vmemmap_pages(order: u32) -> u64 {
        ((1u64 << order) / 64).saturating_sub(1)
    }

    /// Buddy-path allocation of one folio's range, with the adaptive
    /// per-node no-retry protocol and the frozen-refcount retry.
    fn alloc_buddy_range(
        &self,
        class: ClassId,
        mut flags: GfpFlags,
        node: Option<NodeId>,
        mask: Option<&NodeMask>,
        noretry: Option<&mut NodeMask>,
    ) -> Option<PageRange> {
        let order = self.classes[class.index()].order;
        let nid = node.unwrap_or(NodeId::new(0));

        // Try hard unless a previous hard try on this node already failed;
        // the bitmap resets once an easy allocation succeeds again.
        let try_hard = noretry.as_ref().map_or(true, |m| !m.contains(nid));
        flags |= GfpFlags::NOWARN;
        if try_hard {
            flags |= GfpFlags::RETRY_MAYFAIL;
        }

        let mut range = None;
        for attempt in 0..2 {
            match self.provider.alloc(order, flags, node, mask) {
                None => break,
                Some(r) => {
                    if self.provider.freeze(&r) {
                        range = Some(r);
                        break;
                    }
                    self.provider.free(r);
                    if attempt == 1 {
                        log::warn!("HugeTLB: head page unexpected inflated ref count");
                    }
                }
            }
        }

        if let Some(noretry) = noretry {
            if range.is_some() && !try_hard {
                noretry.clear(nid);
            }
            if range.is_none() && try_hard {
                noretry.set(nid);
            }
        }
        range
    }

    /// Allocate and prepare one fresh folio. Returned frozen (refs == 0),
    /// accounted in `nr_huge_pages` but on no list. Must be called without
    /// the pool lock.
    pub(crate) fn alloc_fresh_folio(
        &self,
        class: ClassId,
        flags: GfpFlags,
        node: Option<NodeId>,
        mask: Option<&NodeMask>,
        mut noretry: Option<&mut NodeMask>,
    ) -> Option<FolioId> {
        let size = &self.classes[class.index()];
        let mut retried = false;
        let range = loop {
            if size.is_gigantic() {
                let range = self
                    .provider
                    .alloc_contiguous(size.pages_per_huge_page(), flags, node, mask)?;
                // Contiguous allocators hand back individually refcounted
                // pages; collapsing them races with transient references.
                // One retry with a fresh range, then give up.
                if self.provider.freeze(&range) {
                    break range;
                }
                self.provider.free(range);
                if retried {
                    log::warn!("HugeTLB: gigantic page unexpected inflated ref count");
                    return None;
                }
                retried = true;
            } else {
                break self.alloc_buddy_range(class, flags, node, mask, noretry.as_deref_mut())?;
            }
        };
        Some(self.prep_new_folio(class, range))
    }

    /// Register a fresh provider range as a pool folio.
    pub(crate) fn prep_new_folio(&self, class: ClassId, range: PageRange) -> FolioId {
        self.insert_fresh_folio(class, range, true)
    }

    /// Register a fresh range, optionally without touching the pool
    /// counters (the replace-free-folio path accounts later, under the same
    /// lock hold that retires the folio being replaced).
    pub(crate) fn insert_fresh_folio(&self, class: ClassId, range: PageRange, account: bool) -> FolioId {
        let order = self.classes[class.index()].order;
        let optimized = self.vmemmap.optimize(Self::vmemmap_pages(order));
        let nid = range.node;

        let mut state = self.state.lock();
        let mut folio = Folio::new(class, range);
        if optimized {
            folio.flags.insert(FolioFlags::VMEMMAP_OPTIMIZED);
        }
        let id = state.arena.insert(folio);
        if account {
            let counters = &mut state.classes[class.index()];
            counters.nr_huge_pages += 1;
            counters.nr_huge_pages_node[nid.index()] += 1;
        }
        id
    }

    /// Allocate one fresh page into the pool, node-interleaved. Returns true
    /// on success.
    pub(crate) fn alloc_pool_huge_page(
        &self,
        class: ClassId,
        allowed: &NodeMask,
        noretry: &mut NodeMask,
    ) -> bool {
        for _ in 0..allowed.weight() {
            let nid = {
                let mut state = self.state.lock();
                state.classes[class.index()].next_node_to_alloc(allowed)
            };
            let Some(nid) = nid else { return false };
            if let Some(id) = self.alloc_fresh_folio(
                class,
                GfpFlags::THISNODE,
                Some(nid),
                Some(allowed),
                Some(noretry),
            ) {
                // Feed it into the pool through the regular free path.
                self.free_folio(id);
                return true;
            }
        }
        false
    }

    // =========================================================================
    // Free path
    // =========================================================================

    /// Free a folio whose last reference is gone (refs == 0).
    ///
    /// Restores a consumed reservation when the folio carries the
    /// restore-reserve mark, settles subpool and cgroup accounting, then
    /// either returns the folio to a free list or — for temporary and
    /// surplus pages — hands it back to the provider.
    pub fn free_folio(&self, id: FolioId) {
        let (class, spool, mut restore) = {
            let mut state = self.state.lock();
            let folio = state.arena.folio_mut(id);
            assert_eq!(folio.refs(), 0, "freeing a referenced folio");
            assert_eq!(folio.mapcount, 0, "freeing a mapped folio");
            folio.anon = false;
            let restore = folio.flags.contains(FolioFlags::RESTORE_RESERVE);
            folio.flags.remove(FolioFlags::RESTORE_RESERVE);
            (folio.class, folio.subpool.take(), restore)
        };

        // Subpool accounting runs outside the pool lock. If the folio did
        // not consume a reservation, give its page back to the subpool; a
        // zero return means the subpool would fall below its minimum, so the
        // global reservation must be kept (forced restore).
        if !restore {
            if let Some(spool) = &spool {
                if self.subpool_put_pages(spool, 1) == 0 {
                    restore = true;
                }
            }
        }

        let mut state = self.state.lock();
        let folio = state.arena.folio_mut(id);
        folio.flags.remove(FolioFlags::MIGRATABLE);
        let nid = folio.range.node;
        let pages = self.classes[class.index()].pages_per_huge_page();
        let temporary = folio.flags.contains(FolioFlags::TEMPORARY);
        if let Some(cg) = folio.cgroup.take() {
            cg.uncharge(class.index(), hugetlb_hal::ChargeKind::Usage, pages);
        }
        if let Some(cg) = folio.cgroup_rsvd.take() {
            cg.uncharge(class.index(), hugetlb_hal::ChargeKind::Reservation, pages);
        }
        if restore {
            state.classes[class.index()].resv_huge_pages += 1;
        }

        if temporary {
            Self::remove_folio(&mut state, id, false, false);
            drop(state);
            self.update_and_free_folio(id);
        } else if state.classes[class.index()].surplus_huge_pages_node[nid.index()] > 0 {
            Self::remove_folio(&mut state, id, true, false);
            drop(state);
            self.update_and_free_folio(id);
        } else {
            Self::enqueue_folio(&mut state, id);
        }
    }

    /// Final teardown of a folio already removed from the pool: restore its
    /// vmemmap and hand the range back to the provider.
    ///
    /// If restoration fails the folio is parked back in the pool as surplus
    /// rather than leaked or corrupted.
    pub(crate) fn update_and_free_folio(&self, id: FolioId) {
        let (optimized, order) = {
            let state = self.state.lock();
            let folio = state.arena.folio(id);
            (
                folio.flags.contains(FolioFlags::VMEMMAP_OPTIMIZED),
                self.classes[folio.class.index()].order,
            )
        };

        if optimized {
            if self.vmemmap.restore(Self::vmemmap_pages(order)).is_err() {
                let mut state = self.state.lock();
                Self::add_folio(&mut state, id, true);
                return;
            }
            let mut state = self.state.lock();
            state.arena.folio_mut(id).flags.remove(FolioFlags::VMEMMAP_OPTIMIZED);
        }

        let mut state = self.state.lock();
        let folio = state.arena.remove(id);
        drop(state);
        self.provider.free(folio.range);
    }

    /// Free a list of removed folios with the pool lock dropped.
    pub(crate) fn update_and_free_folios(&self, list: Vec<FolioId>) {
        for id in list {
            self.update_and_free_folio(id);
        }
    }

    /// Take a reference on an active folio.
    pub fn get_folio(&self, id: FolioId) {
        self.state.lock().arena.folio_mut(id).get();
    }

    /// Drop a reference; frees the folio when it was the last.
    pub fn put_folio(&self, id: FolioId) {
        let last = {
            let mut state = self.state.lock();
            state.arena.folio_mut(id).put()
        };
        if last {
            self.free_folio(id);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::SizeClassConfig;
    use hugetlb_hal::SimProvider;

    pub(crate) const ORDER: u32 = 9;
    pub(crate) const HP: u64 = 1 << ORDER;

    /// Pool with one 2 MiB class, `boot` boot pages, `nodes` nodes with
    /// `capacity` huge pages' worth of provider memory each.
    pub(crate) fn test_pool(nodes: usize, capacity_hp: u64, boot: u64) -> (Arc<HugePool>, Arc<SimProvider>) {
        let provider = Arc::new(SimProvider::new(nodes, capacity_hp * HP));
        let config = PoolConfig::new(12, nodes).size(SizeClassConfig::new(ORDER).boot_pages(boot));
        let pool = HugePool::new(config, provider.clone()).unwrap();
        (pool, provider)
    }

    pub(crate) fn class0(pool: &HugePool) -> ClassId {
        pool.class_for_order(ORDER).unwrap()
    }

    #[test]
    fn boot_alloc_fills_pool_node_interleaved() {
        let (pool, provider) = test_pool(2, 8, 4);
        let class = class0(&pool);
        let stats = pool.stats(class);
        assert_eq!(stats.total, 4);
        assert_eq!(stats.free, 4);
        assert_eq!(stats.per_node_free, [2, 2]);
        assert_eq!(provider.outstanding_pages(), 4 * HP);
    }

    #[test]
    fn boot_alloc_shortfall_is_partial_not_fatal() {
        // Capacity for 3 pages across 1 node, asking for 5.
        let (pool, _) = test_pool(1, 3, 5);
        let class = class0(&pool);
        let stats = pool.stats(class);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.free, 3);
    }

    #[test]
    fn dequeue_skips_poisoned_pages() {
        let (pool, _) = test_pool(1, 4, 2);
        let class = class0(&pool);

        let mut state = pool.lock();
        let first = state.classes[class.index()].free_lists[0][0];
        drop(state);
        pool.poison_folio(first);

        let mut state = pool.lock();
        let got = HugePool::dequeue_folio_node_exact(&mut state, class, NodeId::new(0)).unwrap();
        assert_ne!(got, first);
        // Only the poisoned page remains; nothing clean to dequeue.
        assert!(HugePool::dequeue_folio_node_exact(&mut state, class, NodeId::new(0)).is_none());
    }

    #[test]
    fn dequeue_nodemask_prefers_then_walks() {
        let (pool, _) = test_pool(3, 4, 3);
        let class = class0(&pool);

        let mut state = pool.lock();
        let id = pool
            .dequeue_folio_nodemask(&mut state, class, Some(NodeId::new(1)), None)
            .unwrap();
        assert_eq!(state.arena.folio(id).range.node, NodeId::new(1));

        // Node 1 now empty; preferring it falls over to another node.
        let id = pool
            .dequeue_folio_nodemask(&mut state, class, Some(NodeId::new(1)), None)
            .unwrap();
        assert_ne!(state.arena.folio(id).range.node, NodeId::new(1));

        // A mask excluding the remaining nodes yields nothing.
        let empty_after = pool.dequeue_folio_nodemask(
            &mut state,
            class,
            Some(NodeId::new(1)),
            Some(&NodeMask::single(NodeId::new(1))),
        );
        assert!(empty_after.is_none());
    }

    #[test]
    fn dequeue_vma_honors_mempolicy() {
        use crate::vma::{Inode, MemPolicy, Vma};
        use hugetlb_hal::MmId;

        let (pool, _) = test_pool(3, 4, 3);
        let class = class0(&pool);
        let inode = Inode::new(1, class, None);

        // Hard bind to node 2.
        let mut vma = Vma::new_shared(MmId(1), 0, 8 * HP, 0, inode.clone());
        vma.flags |= crate::vma::VmFlags::NORESERVE;
        vma.policy = MemPolicy::Bind(NodeMask::single(NodeId::new(2)));
        let mut state = pool.lock();
        let id = pool.dequeue_folio_vma(&mut state, class, &vma, false, 1).unwrap();
        assert_eq!(state.arena.folio(id).range.node, NodeId::new(2));

        // Preferred-many falls back to any node once its set is empty.
        let mut vma2 = Vma::new_shared(MmId(2), 0, 8 * HP, 0, inode);
        vma2.flags |= crate::vma::VmFlags::NORESERVE;
        vma2.policy = MemPolicy::PreferredMany(NodeMask::single(NodeId::new(2)));
        let id = pool.dequeue_folio_vma(&mut state, class, &vma2, false, 1).unwrap();
        assert_ne!(state.arena.folio(id).range.node, NodeId::new(2));
    }

    #[test]
    fn total_pages_counts_base_pages() {
        let (pool, _) = test_pool(1, 8, 3);
        assert_eq!(pool.total_pages(), 3 * HP);
    }

    #[test]
    fn free_and_reallocate_round_trips() {
        let (pool, provider) = test_pool(1, 4, 2);
        let class = class0(&pool);

        let id = {
            let mut state = pool.lock();
            HugePool::dequeue_folio_node_exact(&mut state, class, NodeId::new(0)).unwrap()
        };
        assert_eq!(pool.stats(class).free, 1);

        pool.put_folio(id);
        let stats = pool.stats(class);
        assert_eq!(stats.free, 2);
        assert_eq!(stats.total, 2);
        // Pool pages stay with the provider while pooled.
        assert_eq!(provider.outstanding_pages(), 2 * HP);
    }

    #[test]
    fn conservation_total_is_free_plus_active() {
        let (pool, _) = test_pool(2, 8, 6);
        let class = class0(&pool);

        let mut held = Vec::new();
        for _ in 0..3 {
            let mut state = pool.lock();
            let id = pool.dequeue_folio_nodemask(&mut state, class, None, None).unwrap();
            held.push(id);
        }
        let stats = pool.stats(class);
        assert_eq!(stats.total, stats.free + held.len() as u64);
        // Every pool page has exactly one arena record.
        assert_eq!(pool.lock().arena.len() as u64, stats.total);

        for id in held {
            pool.put_folio(id);
        }
        let stats = pool.stats(class);
        assert_eq!(stats.total, stats.free);
    }

    #[test]
    fn noretry_bitmap_adapts() {
        let (pool, provider) = test_pool(1, 8, 0);
        let class = class0(&pool);
        let mut noretry = NodeMask::empty();

        // Hard-tried failure sets the node's bit.
        provider.fail_next_allocs(1);
        assert!(pool
            .alloc_buddy_range(class, GfpFlags::pool(), Some(NodeId::new(0)), None, Some(&mut noretry))
            .is_none());
        assert!(noretry.contains(NodeId::new(0)));

        // A success without trying hard clears it.
        let range = pool
            .alloc_buddy_range(class, GfpFlags::pool(), Some(NodeId::new(0)), None, Some(&mut noretry))
            .unwrap();
        assert!(!noretry.contains(NodeId::new(0)));
        provider.free(range);
    }

    #[test]
    fn buddy_freeze_race_retries_once() {
        let (pool, provider) = test_pool(1, 8, 0);
        let class = class0(&pool);

        provider.fail_next_freezes(1);
        let range = pool
            .alloc_buddy_range(class, GfpFlags::pool(), None, None, None)
            .unwrap();
        provider.free(range);

        // Two failures in a row exhaust the retry.
        provider.fail_next_freezes(2);
        assert!(pool.alloc_buddy_range(class, GfpFlags::pool(), None, None, None).is_none());
        assert_eq!(provider.outstanding_pages(), 0);
    }
}

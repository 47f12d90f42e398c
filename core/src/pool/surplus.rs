//! Surplus page management and global reservation accounting.
//!
//! Surplus pages exist beyond the persistent pool size, capped by the
//! per-class overcommit limit. They back reservations the free pool cannot
//! cover (`gather_surplus_pages`) and drain back to the provider once the
//! reservations go away (`return_unused_surplus_pages`).

use alloc::vec::Vec;

use spin::MutexGuard;

use hugetlb_hal::{GfpFlags, NodeId, NodeMask};

use crate::error::{PoolError, Result};
use crate::folio::{FolioFlags, FolioId, PageState};
use crate::hstate::ClassId;
use crate::pool::{HugePool, PoolState};
use crate::vma::Vma;

impl HugePool {
    /// Allocate a fresh surplus folio, gated by the overcommit limit.
    ///
    /// The gate is re-checked under the lock after the (blocking) allocation;
    /// if the pool filled up concurrently the new page is marked temporary
    /// and pushed straight back out through the free path.
    pub(crate) fn alloc_surplus_folio(
        &self,
        class: ClassId,
        flags: GfpFlags,
        node: Option<NodeId>,
        mask: Option<&NodeMask>,
    ) -> Option<FolioId> {
        if self.class(class).is_gigantic() {
            return None;
        }

        {
            let state = self.lock();
            let counters = &state.classes[class.index()];
            if counters.surplus_huge_pages >= counters.nr_overcommit {
                return None;
            }
        }

        let id = self.alloc_fresh_folio(class, flags, node, mask, None)?;

        let mut state = self.lock();
        let counters = &state.classes[class.index()];
        if counters.surplus_huge_pages >= counters.nr_overcommit {
            // Lost the race against a pool-size change; the temporary mark
            // routes the page back to the provider.
            state.arena.folio_mut(id).flags.insert(FolioFlags::TEMPORARY);
            drop(state);
            self.free_folio(id);
            return None;
        }

        let nid = state.arena.folio(id).range.node;
        let counters = &mut state.classes[class.index()];
        counters.surplus_huge_pages += 1;
        counters.surplus_huge_pages_node[nid.index()] += 1;
        Some(id)
    }

    /// Allocate a temporary folio for migration callers: never pooled, never
    /// surplus-accounted, released on last reference.
    pub(crate) fn alloc_migrate_folio(
        &self,
        class: ClassId,
        flags: GfpFlags,
        node: Option<NodeId>,
        mask: Option<&NodeMask>,
    ) -> Option<FolioId> {
        if self.class(class).is_gigantic() {
            return None;
        }
        let id = self.alloc_fresh_folio(class, flags, node, mask, None)?;
        let mut state = self.lock();
        let folio = state.arena.folio_mut(id);
        folio.state = PageState::Active { refs: 1 };
        folio.flags.insert(FolioFlags::TEMPORARY);
        Some(id)
    }

    /// Surplus allocation honoring a mapping's memory policy, used when the
    /// free pool had nothing to dequeue.
    pub(crate) fn alloc_surplus_with_mpol(&self, class: ClassId, vma: &Vma) -> Option<FolioId> {
        let (preferred, mut mask, preferred_many) = vma.policy.resolve();
        let mut folio = None;
        if preferred_many {
            // First pass must not sink into reclaim; the fallback pass may.
            let flags = GfpFlags::pool() | GfpFlags::NOWARN | GfpFlags::NO_RECLAIM;
            folio = self.alloc_surplus_folio(class, flags, preferred, mask.as_ref());
            mask = None;
        }
        if folio.is_none() {
            folio = self.alloc_surplus_folio(class, GfpFlags::pool(), preferred, mask.as_ref());
        }
        folio
    }

    /// Migration callback: dequeue if anything unreserved is free, else hand
    /// out a temporary folio. Returns an active (refs == 1) folio.
    pub fn alloc_folio_nodemask(
        &self,
        class: ClassId,
        preferred: Option<NodeId>,
        mask: Option<&NodeMask>,
        flags: GfpFlags,
    ) -> Result<FolioId> {
        {
            let mut state = self.lock();
            if state.classes[class.index()].available() > 0 {
                if let Some(id) = self.dequeue_folio_nodemask(&mut state, class, preferred, mask) {
                    return Ok(id);
                }
            }
        }
        self.alloc_migrate_folio(class, flags, preferred, mask)
            .ok_or(PoolError::OutOfMemory)
    }

    /// Adjust the global reservation count by `delta` pages, growing the
    /// pool with surplus pages when the free pool cannot cover an increase.
    pub(crate) fn acct_memory(&self, class: ClassId, delta: i64) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }
        if delta > 0 {
            let state = self.lock();
            let state = self.gather_surplus_pages(state, class, delta as u64)?;
            drop(state);
        } else {
            let state = self.lock();
            let state = self.return_unused_surplus_pages(state, class, (-delta) as u64);
            drop(state);
        }
        Ok(())
    }

    /// Grow the pool until it can accommodate `delta` more reserved pages.
    ///
    /// The lock is dropped around each allocation round; counters are
    /// re-read afterwards because frees and resizes move them concurrently.
    /// On failure everything allocated so far is freed and no reservation is
    /// recorded. On success the lock is held again at return.
    fn gather_surplus_pages<'a>(
        &'a self,
        mut state: MutexGuard<'a, PoolState>,
        class: ClassId,
        delta: u64,
    ) -> core::result::Result<MutexGuard<'a, PoolState>, PoolError> {
        let counters = &mut state.classes[class.index()];
        let mut needed =
            (counters.resv_huge_pages + delta) as i64 - counters.free_huge_pages as i64;
        if needed <= 0 {
            counters.resv_huge_pages += delta;
            return Ok(state);
        }

        let mut allocated: Vec<FolioId> = Vec::new();
        let mut alloc_ok = true;

        let shortfall = loop {
            drop(state);
            for _ in 0..needed {
                match self.alloc_surplus_folio(class, GfpFlags::pool(), None, None) {
                    Some(id) => allocated.push(id),
                    None => {
                        alloc_ok = false;
                        break;
                    }
                }
            }

            state = self.lock();
            let counters = &state.classes[class.index()];
            let short = (counters.resv_huge_pages + delta) as i64
                - (counters.free_huge_pages + allocated.len() as u64) as i64;
            if short <= 0 {
                break short;
            }
            if alloc_ok {
                needed = short;
                continue;
            }
            // Could not allocate enough; free what we have and report.
            drop(state);
            for id in allocated {
                self.free_folio(id);
            }
            return Err(PoolError::OutOfMemory);
        };

        // Commit the whole reservation before the new pages become visible
        // on the free lists, so nobody can steal them in between.
        state.classes[class.index()].resv_huge_pages += delta;
        let to_enqueue = (allocated.len() as i64 + shortfall).max(0) as usize;
        let leftover: Vec<FolioId> = allocated.split_off(to_enqueue);
        for id in allocated {
            Self::enqueue_folio(&mut state, id);
        }

        drop(state);
        for id in leftover {
            self.free_folio(id);
        }
        Ok(self.lock())
    }

    /// Uncommit `unused` reserved pages and free up to that many surplus
    /// pages back to the provider, balanced across nodes. Pages backed by
    /// persistent pool pages are left alone.
    pub(crate) fn return_unused_surplus_pages<'a>(
        &'a self,
        mut state: MutexGuard<'a, PoolState>,
        class: ClassId,
        unused: u64,
    ) -> MutexGuard<'a, PoolState> {
        let counters = &mut state.classes[class.index()];
        counters.resv_huge_pages = counters
            .resv_huge_pages
            .checked_sub(unused)
            .expect("uncommitting more reservations than exist");

        let nr_pages = unused.min(counters.surplus_huge_pages);
        let allowed = self.provider().nodes_with_memory();
        let mut list = Vec::new();
        for _ in 0..nr_pages {
            match Self::remove_pool_folio(&mut state, class, &allowed, true) {
                Some(id) => list.push(id),
                None => break,
            }
        }

        drop(state);
        self.update_and_free_folios(list);
        self.lock()
    }
}

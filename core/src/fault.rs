//! Fault handlers: no-page and copy-on-write.
//!
//! Faults on the same `(inode, index)` are serialized by a hashed mutex
//! table so two tasks cannot race to instantiate one page and spuriously
//! fail allocation. Leaf entries are encoded as `(folio, writable)` pairs
//! through the page-table backend; each installed leaf holds one folio
//! reference and one map count.

use alloc::sync::Arc;

use hugetlb_hal::{CgroupRef, EntryHandle, PageTableBackend};

use crate::error::{PoolError, Result};
use crate::folio::{FolioFlags, FolioId};
use crate::pool::{HugePool, FAULT_MUTEXES};
use crate::vma::{vma_end_reservation, vma_needs_reservation, Inode, OwnerFlags, Vma, VmFlags};

/// Access type of a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Read,
    Write,
}

/// Everything a fault needs besides the VMA.
pub struct FaultCtx<'a> {
    pub pool: &'a HugePool,
    pub backend: &'a dyn PageTableBackend,
    pub cgroup: Option<&'a CgroupRef>,
}

fn encode_pte(id: FolioId, writable: bool) -> u64 {
    ((u64::from(id.raw()) + 1) << 1) | u64::from(writable)
}

fn decode_pte(value: u64) -> (FolioId, bool) {
    debug_assert_ne!(value, 0);
    (FolioId(((value >> 1) - 1) as u32), value & 1 != 0)
}

fn fault_mutex_hash(inode: u64, idx: u64) -> usize {
    let mixed = inode
        .wrapping_mul(0x9e37_79b9_7f4a_7c15)
        .rotate_left(31)
        .wrapping_add(idx.wrapping_mul(0x85eb_ca6b));
    (mixed >> 32) as usize & (FAULT_MUTEXES - 1)
}

impl HugePool {
    /// Insert an instantiated page into a file's page cache. The caller's
    /// folio reference is donated to the cache, and the page stops being
    /// restore-on-free: it is file-backed now.
    pub fn add_to_page_cache(&self, inode: &Arc<Inode>, idx: u64, id: FolioId) {
        let pages = self.class(inode.class).pages_per_huge_page();
        let mut cache = inode.page_cache.lock();
        let prev = cache.insert(idx, id);
        assert!(prev.is_none(), "page cache index instantiated twice");
        drop(cache);

        let mut state = self.lock();
        state.arena.folio_mut(id).flags.remove(FolioFlags::RESTORE_RESERVE);
        drop(state);
        inode.add_blocks(pages);
    }

    /// Remove a page from a file's page cache, handing its reference back
    /// to the caller.
    pub fn remove_from_page_cache(&self, inode: &Arc<Inode>, idx: u64) -> Option<FolioId> {
        let id = inode.page_cache.lock().remove(&idx)?;
        inode.sub_blocks(self.class(inode.class).pages_per_huge_page());
        Some(id)
    }
}

/// Handle a fault at `addr` (base-page units, any offset within the huge
/// page). Returns the folio now backing the address.
pub fn fault(ctx: &FaultCtx<'_>, vma: &Vma, addr: u64, kind: FaultKind) -> Result<FolioId> {
    let inode = vma.inode.as_ref().ok_or(PoolError::Invalid)?;
    let class = inode.class;
    let order = ctx.pool.class(class).order;
    let pages = ctx.pool.class(class).pages_per_huge_page();
    let haddr = addr & !(pages - 1);
    let idx = vma.hugecache_offset(order, haddr);

    let _serialized = ctx.pool.fault_mutexes[fault_mutex_hash(inode.id, idx)].lock();

    let entry = ctx
        .backend
        .alloc_leaf_entry(vma.mm, &vma.view(), haddr, pages)
        .ok_or(PoolError::OutOfMemory)?;

    let value = ctx.backend.read(entry);
    if value == 0 {
        return no_page(ctx, vma, inode, idx, haddr, entry, kind);
    }

    let (id, writable) = decode_pte(value);
    if kind == FaultKind::Write && !writable {
        return wp(ctx, vma, haddr, entry);
    }
    Ok(id)
}

/// Install a page behind a not-present leaf entry.
fn no_page(
    ctx: &FaultCtx<'_>,
    vma: &Vma,
    inode: &Arc<Inode>,
    idx: u64,
    haddr: u64,
    entry: EntryHandle,
    kind: FaultKind,
) -> Result<FolioId> {
    let pool = ctx.pool;
    let order = pool.class(inode.class).order;

    // The original mapper unmapped this page from us after a failed COW;
    // faulting it back in would look like silent data loss.
    if vma.resv_flag(OwnerFlags::UNMAPPED) {
        log::warn!("HugeTLB: fault in a mapping killed by inadequate huge page pool");
        return Err(PoolError::OutOfMemory);
    }

    if let Some(id) = inode.cache_lookup(idx) {
        // Already instantiated in the file.
        if pool.folio_has_flag(id, FolioFlags::HWPOISON) {
            return Err(PoolError::Busy);
        }
        pool.get_folio(id);
        {
            let mut state = pool.lock();
            state.arena.folio_mut(id).mapcount += 1;
        }
        let writable = vma.is_shared() && vma.flags.contains(VmFlags::WRITE);
        ctx.backend.write(entry, encode_pte(id, writable));

        if kind == FaultKind::Write && !vma.is_shared() {
            // COW without taking a second fault.
            return wp(ctx, vma, haddr, entry);
        }
        return Ok(id);
    }

    let id = pool.allocate_folio(vma, haddr, false, ctx.cgroup)?;

    if vma.is_shared() {
        pool.add_to_page_cache(inode, idx, id);
        // The cache owns the allocation reference; the leaf takes its own.
        pool.get_folio(id);
    } else {
        // Examine pending reservations for a later COW now, while blocking
        // allocation is still allowed.
        if kind == FaultKind::Write {
            if vma_needs_reservation(order, vma, haddr).is_err() {
                pool.restore_reserve_on_error(vma, haddr, id);
                pool.put_folio(id);
                return Err(PoolError::OutOfMemory);
            }
            vma_end_reservation(order, vma, haddr);
        }
    }

    {
        let mut state = pool.lock();
        let folio = state.arena.folio_mut(id);
        folio.mapcount += 1;
        folio.flags.insert(FolioFlags::MIGRATABLE);
        if !vma.is_shared() {
            // New anonymous mapping: the reservation is spent for good.
            folio.anon = true;
            folio.flags.remove(FolioFlags::RESTORE_RESERVE);
        }
    }

    // A fresh anonymous page is exclusively ours, so both mapping types
    // can go writable immediately when the mapping allows it.
    let writable = vma.flags.contains(VmFlags::WRITE);
    ctx.backend.write(entry, encode_pte(id, writable));
    Ok(id)
}

/// Write fault on a present, write-protected leaf: share, reuse, or copy.
fn wp(ctx: &FaultCtx<'_>, vma: &Vma, haddr: u64, entry: EntryHandle) -> Result<FolioId> {
    let pool = ctx.pool;
    let (old, _) = decode_pte(ctx.backend.read(entry));

    // Shared mappings just need the write bit.
    if vma.is_shared() {
        ctx.backend.write(entry, encode_pte(old, true));
        return Ok(old);
    }

    let (mapcount, anon) = {
        let state = pool.lock();
        let folio = state.arena.folio(old);
        (folio.mapcount, folio.anon)
    };
    if mapcount == 1 && anon {
        // Sole owner: reuse in place.
        ctx.backend.write(entry, encode_pte(old, true));
        return Ok(old);
    }

    // An owner COWing a page it did not consume its reservation on (the
    // page-cache copy is still there) must not eat the remaining reserves:
    // a partially faulted mapping at fork time would otherwise consume them
    // on COW instead of on the guaranteed range.
    let inode = vma.inode.as_ref().ok_or(PoolError::Invalid)?;
    let order = pool.class(inode.class).order;
    let idx = vma.hugecache_offset(order, haddr);
    let pagecache = inode.cache_lookup(idx);
    let outside_reserve = vma.resv_flag(OwnerFlags::OWNER) && pagecache != Some(old);

    pool.get_folio(old);
    let new = match pool.allocate_folio(vma, haddr, outside_reserve, ctx.cgroup) {
        Ok(new) => new,
        Err(err) => {
            pool.put_folio(old);
            // The owner's reliability is guaranteed by unmapping the page
            // from the children instead; see `unmap_ref_private`.
            return Err(err);
        }
    };

    // Copy the contents. A poisoned source fails the copy.
    if pool.folio_has_flag(old, FolioFlags::HWPOISON) {
        pool.restore_reserve_on_error(vma, haddr, new);
        pool.put_folio(new);
        pool.put_folio(old);
        return Err(PoolError::Busy);
    }

    // Switch the leaf: the old page loses this mapping (and the reference
    // the leaf held), the new one becomes an exclusive anonymous page.
    {
        let mut state = pool.lock();
        let folio = state.arena.folio_mut(old);
        folio.mapcount -= 1;
        let folio = state.arena.folio_mut(new);
        folio.mapcount = 1;
        folio.anon = true;
        folio.flags.insert(FolioFlags::MIGRATABLE);
        folio.flags.remove(FolioFlags::RESTORE_RESERVE);
    }
    ctx.backend.write(entry, encode_pte(new, true));
    // Drop the reference this leaf held on the old page, then our hold.
    pool.put_folio(old);
    pool.put_folio(old);
    Ok(new)
}

/// Copy a parent's installed leaf into a forked child: both sides end up
/// write-protected, sharing the page.
pub fn fork_share(ctx: &FaultCtx<'_>, parent: &Vma, child: &Vma, addr: u64) -> Result<()> {
    let inode = parent.inode.as_ref().ok_or(PoolError::Invalid)?;
    let pages = ctx.pool.class(inode.class).pages_per_huge_page();
    let haddr = addr & !(pages - 1);

    let parent_entry = ctx
        .backend
        .lookup_leaf_entry(parent.mm, haddr, pages)
        .ok_or(PoolError::Invalid)?;
    let value = ctx.backend.read(parent_entry);
    if value == 0 {
        return Err(PoolError::Invalid);
    }
    let (id, _) = decode_pte(value);

    let child_entry = ctx
        .backend
        .alloc_leaf_entry(child.mm, &child.view(), haddr, pages)
        .ok_or(PoolError::OutOfMemory)?;

    ctx.pool.get_folio(id);
    {
        let mut state = ctx.pool.lock();
        state.arena.folio_mut(id).mapcount += 1;
    }
    // Arm COW on both sides.
    ctx.backend.write(parent_entry, encode_pte(id, false));
    ctx.backend.write(child_entry, encode_pte(id, false));
    Ok(())
}

/// Tear down one installed leaf, dropping the map count and the reference
/// it held. Frees the folio if that was the last reference.
pub fn unmap(ctx: &FaultCtx<'_>, vma: &Vma, addr: u64) -> Result<()> {
    let inode = vma.inode.as_ref().ok_or(PoolError::Invalid)?;
    let pages = ctx.pool.class(inode.class).pages_per_huge_page();
    let haddr = addr & !(pages - 1);

    let Some(entry) = ctx.backend.lookup_leaf_entry(vma.mm, haddr, pages) else {
        return Ok(());
    };
    if ctx.backend.unshare_if_shared(vma.mm, &vma.view(), haddr, pages) {
        // The whole shared table span is gone from this address space;
        // other sharers keep the mappings and their references.
        return Ok(());
    }
    let value = ctx.backend.read(entry);
    if value == 0 {
        return Ok(());
    }
    let (id, _) = decode_pte(value);
    ctx.backend.write(entry, 0);
    {
        let mut state = ctx.pool.lock();
        state.arena.folio_mut(id).mapcount -= 1;
    }
    ctx.pool.put_folio(id);
    Ok(())
}

/// Unmap `old` from a child mapping after the owner failed to COW it, so
/// the owner's guaranteed access survives. The child may get killed if it
/// faults the page later.
pub fn unmap_ref_private(ctx: &FaultCtx<'_>, child: &Vma, addr: u64) -> Result<()> {
    debug_assert!(!child.is_shared());
    child.set_resv_flag(OwnerFlags::UNMAPPED);
    unmap(ctx, child, addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::tests::{class0, test_pool, HP};
    use hugetlb_hal::{MmId, SoftPageTables};

    struct Harness {
        pool: alloc::sync::Arc<HugePool>,
        backend: SoftPageTables,
    }

    impl Harness {
        fn new(boot: u64) -> Self {
            let (pool, _) = test_pool(1, 16, boot);
            Self {
                pool,
                backend: SoftPageTables::new(),
            }
        }

        fn ctx(&self) -> FaultCtx<'_> {
            FaultCtx {
                pool: &self.pool,
                backend: &self.backend,
                cgroup: None,
            }
        }

        fn inode(&self) -> Arc<Inode> {
            Inode::new(1, class0(&self.pool), None)
        }
    }

    #[test]
    fn scenario_reserve_fault_unreserve() {
        let h = Harness::new(4);
        let class = class0(&h.pool);
        let inode = h.inode();
        let vma = Vma::new_shared(MmId(1), 0, 4 * HP, 0, inode.clone());

        h.pool
            .reserve_pages(&inode, 0, 4, Some(&vma), vma.flags, None)
            .unwrap();
        assert_eq!(h.pool.stats(class).reserved, 4);

        // Four sequential faults, each finding its reservation in place.
        let ctx = h.ctx();
        for i in 0..4u64 {
            let id = fault(&ctx, &vma, i * HP, FaultKind::Write).unwrap();
            assert_eq!(inode.cache_lookup(i), Some(id));
            // Refaulting the same index is a no-op hit on the same folio.
            assert_eq!(fault(&ctx, &vma, i * HP, FaultKind::Read).unwrap(), id);
        }
        let stats = h.pool.stats(class);
        assert_eq!(stats.reserved, 0);
        assert_eq!(stats.free, 0);
        assert_eq!(inode.blocks(), 4 * HP);
        assert_eq!(inode.cached_pages(), 4);

        // Unmap, truncate the file, release the reservation.
        for i in 0..4u64 {
            unmap(&ctx, &vma, i * HP).unwrap();
        }
        for i in 0..4u64 {
            let id = h.pool.remove_from_page_cache(&inode, i).unwrap();
            h.pool.put_folio(id);
        }
        h.pool.unreserve_pages(&inode, 0, 4, 4).unwrap();

        let stats = h.pool.stats(class);
        assert_eq!(stats.reserved, 0);
        assert_eq!(stats.free, 4);
        assert_eq!(inode.blocks(), 0);
        assert!(inode.resv_map.snapshot().is_empty());
    }

    #[test]
    fn private_write_fault_is_immediately_exclusive() {
        let h = Harness::new(4);
        let inode = h.inode();
        let vma = Vma::new_private(MmId(1), 0, 4 * HP, 0, inode.clone());
        h.pool
            .reserve_pages(&inode, 0, 4, Some(&vma), vma.flags, None)
            .unwrap();

        let ctx = h.ctx();
        let id = fault(&ctx, &vma, 0, FaultKind::Write).unwrap();
        // Writable right away, no second fault, not in the page cache.
        assert_eq!(fault(&ctx, &vma, 0, FaultKind::Write).unwrap(), id);
        assert_eq!(inode.cache_lookup(0), None);
        assert!(!h.pool.folio_has_flag(id, FolioFlags::RESTORE_RESERVE));

        unmap(&ctx, &vma, 0).unwrap();
        h.pool.vma_close(&vma);
        assert_eq!(h.pool.stats(class0(&h.pool)).reserved, 0);
    }

    #[test]
    fn cow_after_fork_copies_and_reuses() {
        // Two pages reserved; extra free pages cover the child's copy.
        let h = Harness::new(4);
        let inode = h.inode();
        let parent = Vma::new_private(MmId(1), 0, 2 * HP, 0, inode.clone());
        h.pool
            .reserve_pages(&inode, 0, 2, Some(&parent), parent.flags, None)
            .unwrap();

        let ctx = h.ctx();
        let original = fault(&ctx, &parent, 0, FaultKind::Write).unwrap();

        let child = parent.dup_for_fork(MmId(2));
        fork_share(&ctx, &parent, &child, 0).unwrap();

        // Child write: page is shared, so it gets a copy.
        let copy = fault(&ctx, &child, 0, FaultKind::Write).unwrap();
        assert_ne!(copy, original);

        // Parent write: now exclusive again, reused in place.
        assert_eq!(fault(&ctx, &parent, 0, FaultKind::Write).unwrap(), original);

        unmap(&ctx, &child, 0).unwrap();
        unmap(&ctx, &parent, 0).unwrap();
        h.pool.vma_close(&parent);
    }

    #[test]
    fn cow_failure_leaves_ledger_untouched() {
        // Pool with exactly one page: the COW copy cannot be satisfied.
        let h = Harness::new(1);
        let inode = h.inode();
        let parent = Vma::new_private(MmId(1), 0, HP, 0, inode.clone());
        h.pool
            .reserve_pages(&inode, 0, 1, Some(&parent), parent.flags, None)
            .unwrap();

        let ctx = h.ctx();
        let original = fault(&ctx, &parent, 0, FaultKind::Write).unwrap();
        let child = parent.dup_for_fork(MmId(2));
        fork_share(&ctx, &parent, &child, 0).unwrap();

        let map_before = parent.resv_map().unwrap().snapshot();
        let resv_before = h.pool.stats(class0(&h.pool)).reserved;

        // Child COW fails for lack of pages; the ledger reads as if the
        // fault never started.
        assert!(fault(&ctx, &child, 0, FaultKind::Write).is_err());
        assert_eq!(parent.resv_map().unwrap().snapshot(), map_before);
        assert_eq!(h.pool.stats(class0(&h.pool)).reserved, resv_before);
        parent.resv_map().unwrap().assert_invariants();

        // Both mappings still point at the original page.
        assert_eq!(fault(&ctx, &parent, 0, FaultKind::Read).unwrap(), original);
    }

    #[test]
    fn cow_copy_failure_restores_reservation_state() {
        let h = Harness::new(4);
        let inode = h.inode();
        let parent = Vma::new_private(MmId(1), 0, 2 * HP, 0, inode.clone());
        h.pool
            .reserve_pages(&inode, 0, 2, Some(&parent), parent.flags, None)
            .unwrap();

        let ctx = h.ctx();
        let original = fault(&ctx, &parent, 0, FaultKind::Write).unwrap();
        let child = parent.dup_for_fork(MmId(2));
        fork_share(&ctx, &parent, &child, 0).unwrap();

        let map_before = child.resv_map().map(|m| m.snapshot());
        let resv_before = h.pool.stats(class0(&h.pool)).reserved;

        // The new page allocates, then the copy from the poisoned source
        // fails; restore_reserve_on_error must rewind the ledger.
        h.pool.poison_folio(original);
        assert_eq!(fault(&ctx, &child, 0, FaultKind::Write), Err(PoolError::Busy));
        assert_eq!(child.resv_map().map(|m| m.snapshot()), map_before);
        assert_eq!(h.pool.stats(class0(&h.pool)).reserved, resv_before);
    }

    #[test]
    fn unmapped_child_faults_fail_loudly() {
        let h = Harness::new(2);
        let inode = h.inode();
        let parent = Vma::new_private(MmId(1), 0, HP, 0, inode.clone());
        h.pool
            .reserve_pages(&inode, 0, 1, Some(&parent), parent.flags, None)
            .unwrap();

        let ctx = h.ctx();
        fault(&ctx, &parent, 0, FaultKind::Write).unwrap();
        let child = parent.dup_for_fork(MmId(2));
        fork_share(&ctx, &parent, &child, 0).unwrap();
        // Give the child its own private-map identity so the flag has
        // somewhere to live.
        child.set_resv_map(
            alloc::sync::Arc::new(crate::region::ReservationMap::new()),
            OwnerFlags::empty(),
        );

        unmap_ref_private(&ctx, &child, 0).unwrap();
        assert_eq!(fault(&ctx, &child, 0, FaultKind::Read), Err(PoolError::OutOfMemory));
    }

    #[test]
    fn shared_file_faults_hit_the_page_cache() {
        let h = Harness::new(4);
        let inode = h.inode();
        let a = Vma::new_shared(MmId(1), 0, 4 * HP, 0, inode.clone());
        let b = Vma::new_shared(MmId(2), 0, 4 * HP, 0, inode.clone());

        let ctx = h.ctx();
        let id = fault(&ctx, &a, 0, FaultKind::Write).unwrap();
        // The second mapping sees the same page, not a second copy.
        assert_eq!(fault(&ctx, &b, 0, FaultKind::Read).unwrap(), id);
        assert_eq!(h.pool.stats(class0(&h.pool)).total, 4);
    }

    #[test]
    fn pmd_sharing_across_identical_mappings() {
        use hugetlb_hal::pagetable::LEAVES_PER_TABLE;
        let span = LEAVES_PER_TABLE * HP;

        let h = Harness::new(4);
        let inode = h.inode();
        let mut a = Vma::new_shared(MmId(1), 0, span, 0, inode.clone());
        let mut b = Vma::new_shared(MmId(2), 0, span, 0, inode.clone());
        a.sharable_lock = true;
        b.sharable_lock = true;

        let ctx = h.ctx();
        let id = fault(&ctx, &a, 0, FaultKind::Write).unwrap();
        // The second mapping's fault walks the shared table and finds the
        // leaf already installed.
        assert_eq!(fault(&ctx, &b, 0, FaultKind::Write).unwrap(), id);
        assert_eq!(h.backend.shared_tables(), 1);

        // Unmapping one side only detaches it from the shared table.
        unmap(&ctx, &b, 0).unwrap();
        assert_eq!(fault(&ctx, &a, 0, FaultKind::Read).unwrap(), id);
        unmap(&ctx, &a, 0).unwrap();
    }
}

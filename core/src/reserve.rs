//! Fault/allocation orchestrator.
//!
//! [`HugePool::allocate_folio`] ties together the reservation ledger, the
//! subpool gate, cgroup charging and the pool itself. The ordering is
//! charge-before-allocate, reconcile-after-commit: the page-table lock
//! cannot be held across a blocking allocation, so a racing thread may
//! reserve the same index between the `needs` query and the `commit`; the
//! final reconciliation step settles the double charge without either
//! thread ever believing it owns the same reservation unit twice.
//!
//! Every failure branch unwinds exactly the steps that succeeded, in
//! reverse order.

use alloc::sync::Arc;

use hugetlb_hal::{ChargeKind, CgroupRef};

use crate::error::{PoolError, Result};
use crate::folio::{FolioFlags, FolioId, PageState};
use crate::pool::HugePool;
use crate::region::{RegionCharge, ReservationMap};
use crate::vma::{
    vma_add_reservation, vma_commit_reservation, vma_del_reservation, vma_end_reservation,
    vma_has_reserves, vma_needs_reservation, Inode, OwnerFlags, Vma, VmFlags,
};

impl HugePool {
    /// Allocate a huge page for a fault at `addr` within `vma`.
    ///
    /// With `avoid_reserve`, existing reservations are deliberately not
    /// consumed (COW of an owner mapping outside its reserve). The returned
    /// folio is active with one reference; drop it with
    /// [`HugePool::put_folio`].
    pub fn allocate_folio(
        &self,
        vma: &Vma,
        addr: u64,
        avoid_reserve: bool,
        cgroup: Option<&CgroupRef>,
    ) -> Result<FolioId> {
        let inode = vma.inode.as_ref().ok_or(PoolError::Invalid)?;
        let class = inode.class;
        let order = self.class(class).order;
        let pages = self.class(class).pages_per_huge_page();
        let spool = inode.subpool.clone();

        // 1. Does the faulting index still need a reservation unit? Zero
        //    means a reservation exists and will be consumed.
        let map_chg = vma_needs_reservation(order, vma, addr)?;
        let mut gbl_chg = map_chg;

        // 2. Processes without a reservation go through the subpool gate.
        //    A zero return with nonzero map_chg means the subpool's own
        //    reserve covers the page even though the map does not.
        if map_chg != 0 || avoid_reserve {
            if let Some(sp) = &spool {
                match sp.get_pages(1) {
                    Ok(gbl) => gbl_chg = gbl,
                    Err(err) => {
                        vma_end_reservation(order, vma, addr);
                        return Err(err);
                    }
                }
            }
            if avoid_reserve {
                gbl_chg = 1;
            }
        }

        // 3. Cgroup charges: the reservation counter only when this
        //    allocation is not consuming a map reservation, the usage
        //    counter always.
        let deferred_reserve = map_chg != 0 || avoid_reserve;
        let mut rsvd_charge: Option<CgroupRef> = None;
        if deferred_reserve {
            if let Some(cg) = cgroup {
                if cg.charge(class.index(), ChargeKind::Reservation, pages).is_err() {
                    if map_chg != 0 || avoid_reserve {
                        if let Some(sp) = &spool {
                            self.subpool_put_pages(sp, 1);
                        }
                    }
                    vma_end_reservation(order, vma, addr);
                    return Err(PoolError::QuotaExceeded);
                }
                rsvd_charge = Some(cg.clone());
            }
        }
        let mut usage_charge: Option<CgroupRef> = None;
        if let Some(cg) = cgroup {
            if cg.charge(class.index(), ChargeKind::Usage, pages).is_err() {
                if let Some(rsvd) = rsvd_charge.take() {
                    rsvd.uncharge(class.index(), ChargeKind::Reservation, pages);
                }
                if map_chg != 0 || avoid_reserve {
                    if let Some(sp) = &spool {
                        self.subpool_put_pages(sp, 1);
                    }
                }
                vma_end_reservation(order, vma, addr);
                return Err(PoolError::QuotaExceeded);
            }
            usage_charge = Some(cg.clone());
        }

        // 4. Acquire the page: pool first, fresh surplus second. gbl_chg
        //    tells the dequeue whether this allocation may draw from the
        //    reserved watermark.
        let id = {
            let mut state = self.lock();
            match self.dequeue_folio_vma(&mut state, class, vma, avoid_reserve, gbl_chg) {
                Some(id) => Some(id),
                None => {
                    drop(state);
                    match self.alloc_surplus_with_mpol(class, vma) {
                        None => None,
                        Some(id) => {
                            let mut state = self.lock();
                            if !avoid_reserve && vma_has_reserves(vma, gbl_chg) {
                                state
                                    .arena
                                    .folio_mut(id)
                                    .flags
                                    .insert(FolioFlags::RESTORE_RESERVE);
                                state.classes[class.index()].resv_huge_pages -= 1;
                            }
                            state.arena.folio_mut(id).state = PageState::Active { refs: 1 };
                            Some(id)
                        }
                    }
                }
            }
        };
        let Some(id) = id else {
            if let Some(cg) = usage_charge {
                cg.uncharge(class.index(), ChargeKind::Usage, pages);
            }
            if let Some(cg) = rsvd_charge {
                cg.uncharge(class.index(), ChargeKind::Reservation, pages);
            }
            if map_chg != 0 || avoid_reserve {
                if let Some(sp) = &spool {
                    self.subpool_put_pages(sp, 1);
                }
            }
            vma_end_reservation(order, vma, addr);
            return Err(PoolError::QuotaExceeded);
        };

        // Commit charges and the subpool association on the folio.
        {
            let mut state = self.lock();
            let folio = state.arena.folio_mut(id);
            folio.cgroup = usage_charge;
            if deferred_reserve {
                folio.cgroup_rsvd = rsvd_charge;
            }
            folio.subpool = spool.clone();
        }

        // 5. Commit the reservation and reconcile against a racing reserver:
        //    if commit found fewer pages to add than the earlier query
        //    predicted, another thread reserved this index in between and
        //    the extra subpool/global/cgroup charge must be rolled back.
        //    The page itself is still good.
        let map_commit = vma_commit_reservation(order, vma, addr)
            .expect("single-page reservation commit cannot fail");
        if map_chg > map_commit {
            let rsv_adjust = match &spool {
                Some(sp) => self.subpool_put_pages(sp, 1),
                None => 1,
            };
            let _ = self.acct_memory(class, -(rsv_adjust as i64));
            if deferred_reserve {
                let mut state = self.lock();
                if let Some(cg) = state.arena.folio_mut(id).cgroup_rsvd.take() {
                    drop(state);
                    cg.uncharge(class.index(), ChargeKind::Reservation, pages);
                }
            }
        }
        Ok(id)
    }

    /// Restore reservation bookkeeping after a failure between a successful
    /// [`allocate_folio`](Self::allocate_folio) and the point where the page
    /// became visible.
    ///
    /// Two situations: the folio consumed a reservation (restore-reserve set;
    /// the eventual free will re-increment the global count, so the map must
    /// show the reservation again), or it did not (the map entry added by
    /// the allocation must be removed). Ledger allocation failures inside
    /// this path degrade to whichever accounting keeps the global counters
    /// consistent, at worst costing this task a future guaranteed fault.
    pub fn restore_reserve_on_error(&self, vma: &Vma, addr: u64, id: FolioId) {
        let class = {
            let state = self.lock();
            state.arena.folio(id).class
        };
        let order = self.class(class).order;
        let rc = vma_needs_reservation(order, vma, addr);

        if self.folio_has_flag(id, FolioFlags::RESTORE_RESERVE) {
            match rc {
                Err(_) => {
                    // Cannot manipulate the map; keep the global count
                    // consistent by making the free not restore.
                    let mut state = self.lock();
                    state
                        .arena
                        .folio_mut(id)
                        .flags
                        .remove(FolioFlags::RESTORE_RESERVE);
                }
                Ok(rc) if rc != 0 => {
                    let _ = vma_add_reservation(order, vma, addr);
                }
                Ok(_) => {
                    vma_end_reservation(order, vma, addr);
                }
            }
        } else {
            match rc {
                Ok(0) => {
                    // An entry exists that this allocation did not add (it
                    // would have set restore-reserve otherwise). Remove it
                    // so a later fault does not wrongly consume it.
                    if vma_del_reservation(order, vma, addr).is_err() {
                        let mut state = self.lock();
                        state
                            .arena
                            .folio_mut(id)
                            .flags
                            .insert(FolioFlags::RESTORE_RESERVE);
                    }
                }
                Err(_) => {
                    if !vma.is_shared() {
                        // Private: no entry means a reservation exists.
                        // Freeing with restore set re-increments the count
                        // it will consume later.
                        let mut state = self.lock();
                        state
                            .arena
                            .folio_mut(id)
                            .flags
                            .insert(FolioFlags::RESTORE_RESERVE);
                    }
                }
                Ok(_) => {
                    vma_end_reservation(order, vma, addr);
                }
            }
        }
    }

    // =========================================================================
    // mmap-time reservation
    // =========================================================================

    /// Reserve `[from, to)` huge pages for a mapping at mmap time.
    ///
    /// Shared mappings record the range in the inode's ledger; private
    /// mappings get a fresh ledger attached to the VMA and reserve the full
    /// range. `NORESERVE` mappings reserve nothing and take their chances at
    /// fault time.
    pub fn reserve_pages(
        &self,
        inode: &Arc<Inode>,
        from: u64,
        to: u64,
        vma: Option<&Vma>,
        vm_flags: VmFlags,
        cgroup: Option<&CgroupRef>,
    ) -> Result<()> {
        if from > to {
            log::warn!("HugeTLB: reserve_pages called with a negative range");
            return Err(PoolError::Invalid);
        }
        let class = inode.class;
        let pages = self.class(class).pages_per_huge_page();

        if vm_flags.contains(VmFlags::NORESERVE) {
            return Ok(());
        }

        let shared = vma.map_or(true, |v| v.is_shared());
        let (resv_map, chg, regions_needed) = if shared {
            let map = inode.resv_map.clone();
            let (chg, needed) = map.chg(from, to)?;
            (map, chg, needed)
        } else {
            let map = Arc::new(ReservationMap::new());
            let vma = vma.expect("private reservation without a vma");
            vma.set_resv_map(map.clone(), OwnerFlags::OWNER);
            (map, to - from, 0)
        };

        let mut h_cg: Option<CgroupRef> = None;
        if let Some(cg) = cgroup {
            if cg
                .charge(class.index(), ChargeKind::Reservation, chg * pages)
                .is_err()
            {
                if shared {
                    resv_map.abort(regions_needed);
                }
                return Err(PoolError::QuotaExceeded);
            }
            h_cg = Some(cg.clone());
            if !shared {
                // Private maps uncharge through the map at teardown.
                resv_map.set_private_charge(RegionCharge {
                    cgroup: cg.clone(),
                    class_index: class.index(),
                    pages_per_hpage: pages,
                });
            }
        }

        // Subpool first: its pre-reserve may shrink what the global pool
        // has to commit.
        let gbl_reserve = match &inode.subpool {
            Some(sp) => match sp.get_pages(chg) {
                Ok(gbl) => gbl,
                Err(err) => {
                    if let Some(cg) = &h_cg {
                        cg.uncharge(class.index(), ChargeKind::Reservation, chg * pages);
                    }
                    if shared {
                        resv_map.abort(regions_needed);
                    }
                    return Err(err);
                }
            },
            None => chg,
        };

        if self.acct_memory(class, gbl_reserve as i64).is_err() {
            if let Some(sp) = &inode.subpool {
                self.subpool_put_pages(sp, chg);
            }
            if let Some(cg) = &h_cg {
                cg.uncharge(class.index(), ChargeKind::Reservation, chg * pages);
            }
            if shared {
                resv_map.abort(regions_needed);
            }
            return Err(PoolError::OutOfMemory);
        }

        if !shared {
            // Private: only consumption is tracked; nothing to add now.
            return Ok(());
        }

        let charge_ctx = h_cg.as_ref().map(|cg| RegionCharge {
            cgroup: cg.clone(),
            class_index: class.index(),
            pages_per_hpage: pages,
        });
        match resv_map.add(from, to, regions_needed, charge_ctx.as_ref()) {
            Err(_) => {
                let _ = self.acct_memory(class, -(gbl_reserve as i64));
                if let Some(sp) = &inode.subpool {
                    self.subpool_put_pages(sp, chg);
                }
                if let Some(cg) = &h_cg {
                    cg.uncharge(class.index(), ChargeKind::Reservation, chg * pages);
                }
                resv_map.abort(regions_needed);
                Err(PoolError::OutOfMemory)
            }
            Ok(add) if chg > add => {
                // Pages in the range were reserved by a racing fault between
                // chg and add; give back the double-counted part.
                if let Some(cg) = &h_cg {
                    cg.uncharge(class.index(), ChargeKind::Reservation, (chg - add) * pages);
                }
                let rsv_adjust = match &inode.subpool {
                    Some(sp) => self.subpool_put_pages(sp, chg - add),
                    None => chg - add,
                };
                let _ = self.acct_memory(class, -(rsv_adjust as i64));
                Ok(())
            }
            Ok(_) => Ok(()),
        }
    }

    /// Release the reservation on `[start, end)` of a file, `freed` pages of
    /// which were actually instantiated and already returned.
    pub fn unreserve_pages(
        &self,
        inode: &Arc<Inode>,
        start: u64,
        end: u64,
        freed: u64,
    ) -> Result<()> {
        let class = inode.class;
        let pages = self.class(class).pages_per_huge_page();

        // With end == WHOLE_RANGE (teardown) this cannot fail.
        let chg = inode.resv_map.del(start, end)?;
        inode.sub_blocks(freed * pages);

        let unused = chg - freed;
        let gbl_reserve = match &inode.subpool {
            Some(sp) => self.subpool_put_pages(sp, unused),
            None => unused,
        };
        let _ = self.acct_memory(class, -(gbl_reserve as i64));
        Ok(())
    }

    /// A reservation-map entry could not be removed for a freed page; keep
    /// the counters consistent by re-registering the dangling entry as a
    /// reservation.
    pub fn fix_reserve_counts(&self, inode: &Arc<Inode>) {
        let class = inode.class;
        let mut reserved = false;
        match &inode.subpool {
            Some(sp) => match sp.get_pages(1) {
                Ok(0) => reserved = true,
                Ok(_) => reserved = self.acct_memory(class, 1).is_ok(),
                Err(_) => {}
            },
            None => reserved = self.acct_memory(class, 1).is_ok(),
        }
        if !reserved {
            log::warn!("HugeTLB: reserve count may go negative");
        }
    }

    /// Tear down a private owner mapping: return the unconsumed part of its
    /// reservation and drop the map.
    pub fn vma_close(&self, vma: &Vma) {
        if vma.is_shared() || !vma.resv_flag(OwnerFlags::OWNER) {
            return;
        }
        let Some(map) = vma.resv_map() else { return };
        let Some(inode) = vma.inode.as_ref() else { return };
        let class = inode.class;
        let order = self.class(class).order;

        let start = vma.hugecache_offset(order, vma.start);
        let end = vma.hugecache_offset(order, vma.end);
        let len = end - start;
        let consumed = map.count(start, end);
        let reserve = len - consumed;

        // The mmap-time charge covered the whole range.
        map.uncharge_private(len);

        if reserve > 0 {
            let gbl_reserve = match &inode.subpool {
                Some(sp) => self.subpool_put_pages(sp, reserve),
                None => reserve,
            };
            let _ = self.acct_memory(class, -(gbl_reserve as i64));
        }

        if Arc::strong_count(&map) == 2 {
            // Ours plus the VMA's: last user, clear the regions.
            map.release_regions();
        }
        *vma.resv.lock() = crate::vma::VmaResv::None;
    }
}

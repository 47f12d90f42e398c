//! Reservation ledger: per-file (or per-private-mapping) interval map.
//!
//! The ledger records which huge-page index ranges have an outstanding
//! reservation, as an ordered list of non-overlapping `[from, to)` regions.
//! Mutations follow a two-phase protocol: `chg` examines the map, counts the
//! uncovered pages, and guarantees — by topping up a descriptor cache — that
//! the later `add` can commit without allocating; `abort` rolls back a `chg`
//! whose caller gave up. `del` removes, trims or splits regions.
//!
//! The descriptor cache exists so the commit step can run after the caller
//! has already charged counters and acquired a page: at that point failure is
//! no longer an option for single-page operations.
//!
//! Note the meaning of an entry differs by mapping type: shared mappings
//! record reservations that *exist*, private mappings record reservations
//! already *consumed*. The inversion lives in `vma.rs`, not here; the ledger
//! itself is polarity-neutral.

use alloc::vec::Vec;

use spin::{Mutex, MutexGuard};

use hugetlb_hal::{ChargeKind, CgroupRef};

use crate::error::{PoolError, Result};

/// Passing this as the `to` bound of [`ReservationMap::del`] deletes every
/// region at or above `from`, and is guaranteed not to fail.
pub const WHOLE_RANGE: u64 = u64::MAX;

/// One reserved `[from, to)` run of huge-page indices.
#[derive(Debug, Clone)]
struct FileRegion {
    from: u64,
    to: u64,
    /// Group to uncharge when the region dies. Regions coalesce only when
    /// this points at the same group (handle identity, not value equality).
    charge: Option<CgroupRef>,
}

impl FileRegion {
    fn blank() -> Self {
        Self {
            from: 0,
            to: 0,
            charge: None,
        }
    }

    fn same_charge(&self, other: &FileRegion) -> bool {
        match (&self.charge, &other.charge) {
            (None, None) => true,
            (Some(a), Some(b)) => a.same_group(b),
            _ => false,
        }
    }
}

/// Cgroup linkage for regions created by a charged reservation.
#[derive(Clone)]
pub struct RegionCharge {
    pub cgroup: CgroupRef,
    pub class_index: usize,
    pub pages_per_hpage: u64,
}

struct RegionList {
    regions: Vec<FileRegion>,
    /// Spare descriptors; `cache.len() >= adds_in_progress` between ops.
    cache: Vec<FileRegion>,
    /// Reservations between `chg` and the matching `add`/`abort`.
    adds_in_progress: u64,
    /// Cap on live descriptors (regions + cache); `None` means unlimited.
    /// An exhausted budget surfaces as an allocation failure.
    node_budget: Option<usize>,
    /// Set on first charged add; all entries of a map share one class.
    class_index: usize,
    pages_per_hpage: u64,
    /// Private-mapping reservation charge, uncharged at teardown.
    private_charge: Option<CgroupRef>,
}

impl RegionList {
    fn budget_allows(&self, extra: usize) -> bool {
        match self.node_budget {
            Some(budget) => self.regions.len() + self.cache.len() + extra <= budget,
            None => true,
        }
    }

    fn uncharge(&self, region: &FileRegion, pages: u64) {
        if let Some(cg) = &region.charge {
            cg.uncharge(
                self.class_index,
                ChargeKind::Reservation,
                pages * self.pages_per_hpage,
            );
        }
    }
}

/// Reservation map for one hugetlbfs inode or one private mapping origin.
pub struct ReservationMap {
    inner: Mutex<RegionList>,
}

impl ReservationMap {
    /// Empty map with one cached descriptor and no budget.
    pub fn new() -> Self {
        Self::with_node_budget(None)
    }

    /// Empty map whose live-descriptor count may not exceed `budget`.
    pub fn with_node_budget(budget: Option<usize>) -> Self {
        let mut cache = Vec::new();
        cache.push(FileRegion::blank());
        Self {
            inner: Mutex::new(RegionList {
                regions: Vec::new(),
                cache,
                adds_in_progress: 0,
                node_budget: budget,
                class_index: 0,
                pages_per_hpage: 0,
                private_charge: None,
            }),
        }
    }

    /// Record the reservation charge a private mapping carries, so teardown
    /// can uncharge it.
    pub fn set_private_charge(&self, charge: RegionCharge) {
        let mut list = self.inner.lock();
        list.private_charge = Some(charge.cgroup);
        list.class_index = charge.class_index;
        list.pages_per_hpage = charge.pages_per_hpage;
    }

    /// Uncharge `pages * pages_per_hpage` from the private-mapping charge.
    pub fn uncharge_private(&self, pages: u64) {
        let list = self.inner.lock();
        if let Some(cg) = &list.private_charge {
            cg.uncharge(
                list.class_index,
                ChargeKind::Reservation,
                pages * list.pages_per_hpage,
            );
        }
    }

    /// Count pages of `[f, t)` not present in the map and reserve enough
    /// descriptors for a follow-up [`add`](Self::add) of the same range.
    ///
    /// Returns `(uncovered_pages, regions_needed)`; `regions_needed` must be
    /// handed back to `add` or [`abort`](Self::abort). Does not modify the
    /// region list itself.
    pub fn chg(&self, f: u64, t: u64) -> Result<(u64, u64)> {
        let mut list = self.inner.lock();
        let (delta, mut needed) = scan_uncovered(&list.regions, f, t);
        // Always hold at least one descriptor: a racing add may consume
        // cache entries between chg and add.
        if needed == 0 {
            needed = 1;
        }
        list = self.allocate_entries(list, needed)?;
        list.adds_in_progress += needed;
        Ok((delta, needed))
    }

    /// Commit `[f, t)` into the map, filling every uncovered gap.
    ///
    /// `in_regions_needed` is the count returned by the preceding `chg`.
    /// Descriptors come from the cache; a fresh allocation is legal only when
    /// the map drifted since `chg` (a racing add on an overlapping range),
    /// and never for single-page ranges, which by construction fit the cache.
    /// Returns the number of pages newly represented.
    pub fn add(
        &self,
        f: u64,
        t: u64,
        in_regions_needed: u64,
        charge: Option<&RegionCharge>,
    ) -> Result<u64> {
        let mut list = self.inner.lock();
        loop {
            let (_, actual) = scan_uncovered(&list.regions, f, t);
            if actual > in_regions_needed
                && (list.cache.len() as u64)
                    < list.adds_in_progress + (actual - in_regions_needed)
            {
                assert!(
                    t - f > 1,
                    "single-page add cannot outgrow its chg descriptor"
                );
                list = self.allocate_entries(list, actual - in_regions_needed)?;
                continue;
            }
            break;
        }

        let added = commit_range(&mut list, f, t, charge);
        list.adds_in_progress -= in_regions_needed;
        Ok(added)
    }

    /// Roll back a `chg` that will not be committed.
    pub fn abort(&self, regions_needed: u64) {
        let mut list = self.inner.lock();
        debug_assert!(!list.cache.is_empty());
        list.adds_in_progress = list
            .adds_in_progress
            .checked_sub(regions_needed)
            .expect("abort without matching chg");
    }

    /// Delete `[f, t)` from the map, trimming or splitting boundary regions.
    ///
    /// Returns the number of pages removed. Fails only when an interior
    /// split needs a descriptor and none can be obtained; callers passing
    /// `t == WHOLE_RANGE` never split and therefore never fail.
    pub fn del(&self, f: u64, t: u64) -> Result<u64> {
        let mut spare: Option<FileRegion> = None;
        let mut list = self.inner.lock();

        // Restarted after an unlocked descriptor allocation. Regions only
        // shrink across retries, so the scan terminates.
        'retry: loop {
            let mut del = 0u64;
            let mut i = 0;
            while i < list.regions.len() {
                let (rg_from, rg_to) = (list.regions[i].from, list.regions[i].to);
                if rg_to <= f {
                    i += 1;
                    continue;
                }
                if rg_from >= t {
                    break;
                }

                if f > rg_from && t < rg_to {
                    // Interior delete: the region must split in two.
                    if spare.is_none() && (list.cache.len() as u64) > list.adds_in_progress {
                        spare = list.cache.pop();
                    }
                    if spare.is_none() {
                        if !list.budget_allows(1) {
                            debug_assert_ne!(t, WHOLE_RANGE);
                            return Err(PoolError::OutOfMemory);
                        }
                        drop(list);
                        spare = Some(FileRegion::blank());
                        list = self.inner.lock();
                        continue 'retry;
                    }

                    let mut tail = spare.take().expect("split descriptor");
                    del += t - f;
                    let removed = FileRegion {
                        from: f,
                        to: t,
                        charge: list.regions[i].charge.clone(),
                    };
                    list.uncharge(&removed, t - f);
                    tail.from = t;
                    tail.to = rg_to;
                    tail.charge = list.regions[i].charge.clone();
                    list.regions[i].to = f;
                    list.regions.insert(i + 1, tail);
                    break;
                }

                if f <= rg_from && t >= rg_to {
                    // Whole region covered.
                    del += rg_to - rg_from;
                    let removed = list.regions.remove(i);
                    list.uncharge(&removed, rg_to - rg_from);
                    continue;
                }

                if f <= rg_from {
                    // Trim the beginning.
                    let removed = list.regions[i].clone();
                    list.uncharge(&removed, t - rg_from);
                    del += t - rg_from;
                    list.regions[i].from = t;
                } else {
                    // Trim the end.
                    let removed = list.regions[i].clone();
                    list.uncharge(&removed, rg_to - f);
                    del += rg_to - f;
                    list.regions[i].to = f;
                }
                i += 1;
            }
            return Ok(del);
        }
    }

    /// Pages of `[f, t)` covered by the map.
    pub fn count(&self, f: u64, t: u64) -> u64 {
        let list = self.inner.lock();
        let mut total = 0;
        for rg in &list.regions {
            if rg.to <= f {
                continue;
            }
            if rg.from >= t {
                break;
            }
            total += rg.to.min(t) - rg.from.max(f);
        }
        total
    }

    /// Drop every region; used at teardown. Cannot fail.
    pub fn release_regions(&self) -> u64 {
        let removed = self.del(0, WHOLE_RANGE).expect("whole-range del failed");
        debug_assert_eq!(
            self.inner.lock().adds_in_progress,
            0,
            "map released with an operation in flight"
        );
        removed
    }

    /// `(from, to)` pairs currently in the map, for inspection.
    pub fn snapshot(&self) -> Vec<(u64, u64)> {
        self.inner
            .lock()
            .regions
            .iter()
            .map(|rg| (rg.from, rg.to))
            .collect()
    }

    /// Spare descriptors currently cached.
    pub fn cache_len(&self) -> usize {
        self.inner.lock().cache.len()
    }

    /// Operations between `chg` and `add`/`abort`.
    pub fn adds_in_progress(&self) -> u64 {
        self.inner.lock().adds_in_progress
    }

    /// Panic unless the list is sorted, non-overlapping and fully coalesced.
    pub fn assert_invariants(&self) {
        let list = self.inner.lock();
        for pair in list.regions.windows(2) {
            assert!(pair[0].from < pair[0].to, "empty region");
            assert!(pair[0].to <= pair[1].from, "overlapping or unsorted regions");
            assert!(
                pair[0].to != pair[1].from || !pair[0].same_charge(&pair[1]),
                "adjacent same-owner regions not coalesced"
            );
        }
        assert!(
            list.cache.len() as u64 >= list.adds_in_progress,
            "descriptor cache below in-flight adds"
        );
    }

    /// Top up the cache until it covers `adds_in_progress + regions_needed`.
    ///
    /// Descriptor allocation happens with the lock dropped; the loop re-reads
    /// the cache level after re-acquiring because concurrent `add`/`del`
    /// may have consumed entries in between.
    fn allocate_entries<'a>(
        &'a self,
        mut list: MutexGuard<'a, RegionList>,
        regions_needed: u64,
    ) -> core::result::Result<MutexGuard<'a, RegionList>, PoolError> {
        loop {
            let want = list.adds_in_progress + regions_needed;
            let have = list.cache.len() as u64;
            if have >= want {
                return Ok(list);
            }
            debug_assert!(have >= list.adds_in_progress);
            let to_allocate = (want - have) as usize;
            if !list.budget_allows(to_allocate) {
                return Err(PoolError::OutOfMemory);
            }

            drop(list);
            let mut fresh: Vec<FileRegion> =
                (0..to_allocate).map(|_| FileRegion::blank()).collect();
            list = self.inner.lock();
            list.cache.append(&mut fresh);
        }
    }
}

impl Default for ReservationMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Walk the sorted list and report `(uncovered_pages, gap_count)` for
/// `[f, t)` without mutating anything.
fn scan_uncovered(regions: &[FileRegion], f: u64, t: u64) -> (u64, u64) {
    let mut delta = 0;
    let mut gaps = 0;
    let mut last = f;
    for rg in regions {
        if rg.from < f {
            if rg.to > last {
                last = rg.to;
            }
            continue;
        }
        if rg.from >= t {
            break;
        }
        if rg.from > last {
            delta += rg.from - last;
            gaps += 1;
        }
        last = last.max(rg.to);
    }
    if last < t {
        delta += t - last;
        gaps += 1;
    }
    (delta, gaps)
}

/// Insert regions covering every gap of `[f, t)`, consuming cache
/// descriptors, then re-establish the coalescing invariant.
fn commit_range(list: &mut RegionList, f: u64, t: u64, charge: Option<&RegionCharge>) -> u64 {
    if let Some(ctx) = charge {
        if list.pages_per_hpage == 0 {
            list.pages_per_hpage = ctx.pages_per_hpage;
            list.class_index = ctx.class_index;
        }
        debug_assert_eq!(list.pages_per_hpage, ctx.pages_per_hpage);
    }

    // Collect gaps as (insert position, from, to).
    let mut gaps: Vec<(usize, u64, u64)> = Vec::new();
    let mut added = 0;
    let mut last = f;
    let mut pos = 0;
    for (i, rg) in list.regions.iter().enumerate() {
        pos = i;
        if rg.from < f {
            if rg.to > last {
                last = rg.to;
            }
            pos = i + 1;
            continue;
        }
        if rg.from >= t {
            break;
        }
        if rg.from > last {
            gaps.push((i, last, rg.from));
        }
        last = last.max(rg.to);
        pos = i + 1;
    }
    if last < t {
        gaps.push((pos, last, t));
    }

    for &(at, from, to) in gaps.iter().rev() {
        let mut node = list
            .cache
            .pop()
            .expect("descriptor cache exhausted during commit");
        node.from = from;
        node.to = to;
        node.charge = charge.map(|c| c.cgroup.clone());
        list.regions.insert(at, node);
        added += to - from;
    }

    coalesce(&mut list.regions);
    added
}

/// Merge adjacent regions with the same charge owner.
fn coalesce(regions: &mut Vec<FileRegion>) {
    let mut i = 0;
    while i + 1 < regions.len() {
        if regions[i].to == regions[i + 1].from && regions[i].same_charge(&regions[i + 1]) {
            regions[i].to = regions[i + 1].to;
            regions.remove(i + 1);
        } else {
            i += 1;
        }
    }
}

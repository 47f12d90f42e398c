//! Mapping model: VMAs, inodes, and per-mapping reservation state.
//!
//! A shared (`MAYSHARE`) mapping resolves its reservation map through the
//! backing inode; all VMAs of one file funnel into one ledger. A private
//! mapping owns (or inherits a reference to) a ledger created at mmap time.
//!
//! # Reservation polarity
//!
//! `PRIVATE_MAP_INVERTED`: a shared mapping's ledger records reservations
//! that *exist*; a private mapping's ledger records reservations already
//! *consumed* (pages instantiated), so an absent entry means the reservation
//! is still available. Every single-page wrapper below flips its ledger
//! answer for private mappings. This asymmetry is deliberate and load-bearing;
//! it must not be "fixed".

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use hashbrown::HashMap;
use hugetlb_hal::{MmId, NodeId, NodeMask, VmaView};
use spin::Mutex;

use crate::error::Result;
use crate::folio::FolioId;
use crate::hstate::ClassId;
use crate::region::ReservationMap;
use crate::subpool::Subpool;

/// See the module docs: private-mapping ledger answers are inverted.
pub const PRIVATE_MAP_INVERTED: bool = true;

bitflags! {
    /// Mapping permission and behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        /// Mapping may be shared between processes.
        const MAYSHARE = 1 << 2;
        /// Skip mmap-time reservation; fault-time allocation takes its
        /// chances.
        const NORESERVE = 1 << 3;
        const LOCKED = 1 << 4;
    }
}

bitflags! {
    /// State of a private mapping's relationship to its reservation map.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OwnerFlags: u8 {
        /// This VMA created the reservation at mmap time. Only the owner's
        /// faults may consume it.
        const OWNER = 1 << 0;
        /// The reservation was forcibly broken (COW failure); further
        /// faults in children get no guarantee.
        const UNMAPPED = 1 << 1;
    }
}

/// Memory placement policy for allocations on behalf of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemPolicy {
    Default,
    /// Prefer one node, fall back anywhere.
    Preferred(NodeId),
    /// Prefer a set of nodes, fall back anywhere.
    PreferredMany(NodeMask),
    /// Hard-bind to a set of nodes.
    Bind(NodeMask),
}

impl MemPolicy {
    /// Resolve to `(preferred node, restricting mask, preferred_many)`.
    pub(crate) fn resolve(&self) -> (Option<NodeId>, Option<NodeMask>, bool) {
        match self {
            MemPolicy::Default => (None, None, false),
            MemPolicy::Preferred(node) => (Some(*node), None, false),
            MemPolicy::PreferredMany(mask) => (mask.first(), Some(*mask), true),
            MemPolicy::Bind(mask) => (mask.first(), Some(*mask), false),
        }
    }
}

// =============================================================================
// Inode
// =============================================================================

/// Backing file of a shared mapping.
pub struct Inode {
    pub id: u64,
    pub class: ClassId,
    /// The file's reservation ledger; shared by every mapping VMA.
    pub resv_map: Arc<ReservationMap>,
    /// Mount quota, if the mount has one.
    pub subpool: Option<Arc<Subpool>>,
    /// Huge-page index -> instantiated page.
    pub(crate) page_cache: Mutex<HashMap<u64, FolioId>>,
    /// Block accounting (base pages backed by the file).
    blocks: AtomicU64,
}

impl Inode {
    pub fn new(id: u64, class: ClassId, subpool: Option<Arc<Subpool>>) -> Arc<Self> {
        Arc::new(Self {
            id,
            class,
            resv_map: Arc::new(ReservationMap::new()),
            subpool,
            page_cache: Mutex::new(HashMap::new()),
            blocks: AtomicU64::new(0),
        })
    }

    /// Base pages currently accounted to the file.
    pub fn blocks(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }

    pub(crate) fn add_blocks(&self, pages: u64) {
        self.blocks.fetch_add(pages, Ordering::Relaxed);
    }

    pub(crate) fn sub_blocks(&self, pages: u64) {
        self.blocks.fetch_sub(pages, Ordering::Relaxed);
    }

    /// Look up an instantiated page.
    pub fn cache_lookup(&self, index: u64) -> Option<FolioId> {
        self.page_cache.lock().get(&index).copied()
    }

    /// Instantiated pages in the file.
    pub fn cached_pages(&self) -> u64 {
        self.page_cache.lock().len() as u64
    }
}

// =============================================================================
// VMA
// =============================================================================

/// Private-mapping reservation linkage.
pub enum VmaResv {
    /// No private map (shared mappings, or children after fork).
    None,
    /// Private map reference plus owner state.
    Owned {
        map: Arc<ReservationMap>,
        flags: OwnerFlags,
    },
}

/// One mapping of huge pages. Addresses (`start`, `end`) and `pgoff` are in
/// base-page units and huge-page aligned.
pub struct Vma {
    pub mm: MmId,
    pub start: u64,
    pub end: u64,
    pub pgoff: u64,
    pub flags: VmFlags,
    pub policy: MemPolicy,
    pub inode: Option<Arc<Inode>>,
    /// A sharable lock object exists (required for page-table sharing and
    /// allocated when reservations are established).
    pub sharable_lock: bool,
    pub(crate) resv: Mutex<VmaResv>,
}

impl Vma {
    /// Shared file mapping.
    pub fn new_shared(mm: MmId, start: u64, end: u64, pgoff: u64, inode: Arc<Inode>) -> Self {
        Self {
            mm,
            start,
            end,
            pgoff,
            flags: VmFlags::READ | VmFlags::WRITE | VmFlags::MAYSHARE,
            policy: MemPolicy::Default,
            inode: Some(inode),
            sharable_lock: false,
            resv: Mutex::new(VmaResv::None),
        }
    }

    /// Private (COW) mapping of a file.
    pub fn new_private(mm: MmId, start: u64, end: u64, pgoff: u64, inode: Arc<Inode>) -> Self {
        Self {
            mm,
            start,
            end,
            pgoff,
            flags: VmFlags::READ | VmFlags::WRITE,
            policy: MemPolicy::Default,
            inode: Some(inode),
            sharable_lock: false,
            resv: Mutex::new(VmaResv::None),
        }
    }

    pub fn is_shared(&self) -> bool {
        self.flags.contains(VmFlags::MAYSHARE)
    }

    /// Huge-page index within the backing file for `addr`.
    pub fn hugecache_offset(&self, order: u32, addr: u64) -> u64 {
        ((addr - self.start) >> order) + (self.pgoff >> order)
    }

    /// The reservation map governing this VMA, if any.
    pub fn resv_map(&self) -> Option<Arc<ReservationMap>> {
        if self.is_shared() {
            self.inode.as_ref().map(|inode| inode.resv_map.clone())
        } else {
            match &*self.resv.lock() {
                VmaResv::Owned { map, .. } => Some(map.clone()),
                VmaResv::None => None,
            }
        }
    }

    /// Attach a private reservation map with the given owner flags.
    pub fn set_resv_map(&self, map: Arc<ReservationMap>, flags: OwnerFlags) {
        debug_assert!(!self.is_shared());
        *self.resv.lock() = VmaResv::Owned { map, flags };
    }

    /// Test a private owner flag.
    pub fn resv_flag(&self, flag: OwnerFlags) -> bool {
        match &*self.resv.lock() {
            VmaResv::Owned { flags, .. } => flags.contains(flag),
            VmaResv::None => false,
        }
    }

    /// Set a private owner flag.
    pub fn set_resv_flag(&self, flag: OwnerFlags) {
        debug_assert!(!self.is_shared());
        if let VmaResv::Owned { flags, .. } = &mut *self.resv.lock() {
            flags.insert(flag);
        }
    }

    /// Fork-time duplication: the child shares nothing of the parent's
    /// private reservation; its faults are not guaranteed to succeed.
    pub fn dup_for_fork(&self, child_mm: MmId) -> Self {
        Self {
            mm: child_mm,
            start: self.start,
            end: self.end,
            pgoff: self.pgoff,
            flags: self.flags,
            policy: self.policy,
            inode: self.inode.clone(),
            sharable_lock: self.sharable_lock,
            resv: Mutex::new(VmaResv::None),
        }
    }

    /// Projection handed to the page-table backend.
    pub fn view(&self) -> VmaView {
        VmaView {
            start: self.start,
            end: self.end,
            pgoff: self.pgoff,
            flags_key: (self.flags & !VmFlags::LOCKED).bits() as u64,
            inode: self.inode.as_ref().map(|inode| inode.id),
            may_share: self.is_shared(),
            sharable_lock: self.sharable_lock,
        }
    }
}

// =============================================================================
// Has-reserves policy
// =============================================================================

/// Decide whether an allocation for this VMA may draw from the reserved
/// watermark, given the ledger delta (`chg`) for the faulting page.
pub(crate) fn vma_has_reserves(vma: &Vma, chg: u64) -> bool {
    if vma.flags.contains(VmFlags::NORESERVE) {
        // A shared NORESERVE mapping may still sit on an index some other
        // mapping reserved; chg == 0 detects that pre-existing reservation.
        return vma.is_shared() && chg == 0;
    }

    if vma.is_shared() {
        // chg != 0 means the region was hole-punched after reservation.
        return chg == 0;
    }

    if vma.resv_flag(OwnerFlags::OWNER) {
        // chg already accounts for the private-map polarity inversion, so
        // its meaning matches the shared case here.
        return chg == 0;
    }

    false
}

// =============================================================================
// Single-page reservation wrappers
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResvMode {
    /// Query + descriptor pre-commitment (`chg`).
    Needs,
    /// Commit the earlier query (`add`).
    Commit,
    /// Abandon the earlier query (`abort`).
    End,
    /// Error path: make an entry exist (shared) / not exist (private).
    Add,
    /// Error path: make an entry not exist (shared) / exist (private).
    Del,
}

/// Single-page ledger operation for the page backing `addr`, with the
/// private-mapping inversion applied.
pub(crate) fn vma_reservation(
    order: u32,
    vma: &Vma,
    addr: u64,
    mode: ResvMode,
) -> Result<u64> {
    let Some(map) = vma.resv_map() else {
        // No ledger at all: shared semantics say "not reserved", private
        // semantics say the same because there is no owner either.
        return Ok(1);
    };
    let idx = vma.hugecache_offset(order, addr);

    let ret = match mode {
        ResvMode::Needs => {
            let (delta, needed) = map.chg(idx, idx + 1)?;
            // A 1-page range can never need more than one descriptor.
            debug_assert_eq!(needed, 1);
            delta
        }
        ResvMode::Commit => map.add(idx, idx + 1, 1, None)?,
        ResvMode::End => {
            map.abort(1);
            0
        }
        ResvMode::Add => {
            if vma.is_shared() {
                map.add(idx, idx + 1, 1, None)?
            } else {
                map.abort(1);
                map.del(idx, idx + 1)?
            }
        }
        ResvMode::Del => {
            if vma.is_shared() {
                map.abort(1);
                map.del(idx, idx + 1)?
            } else {
                map.add(idx, idx + 1, 1, None)?
            }
        }
    };

    if vma.is_shared() || mode == ResvMode::Del {
        return Ok(ret);
    }

    // PRIVATE_MAP_INVERTED: flip presence/absence for private mappings.
    debug_assert!(PRIVATE_MAP_INVERTED);
    Ok(if ret > 0 { 0 } else { 1 })
}

/// Does the page at `addr` still need a reservation unit? 0 means a
/// reservation exists and will be consumed; nonzero means the allocation
/// must bring its own.
pub(crate) fn vma_needs_reservation(order: u32, vma: &Vma, addr: u64) -> Result<u64> {
    vma_reservation(order, vma, addr, ResvMode::Needs)
}

/// Commit the reservation query made by [`vma_needs_reservation`].
pub(crate) fn vma_commit_reservation(order: u32, vma: &Vma, addr: u64) -> Result<u64> {
    vma_reservation(order, vma, addr, ResvMode::Commit)
}

/// Abandon the reservation query made by [`vma_needs_reservation`].
pub(crate) fn vma_end_reservation(order: u32, vma: &Vma, addr: u64) {
    let _ = vma_reservation(order, vma, addr, ResvMode::End);
}

/// Error path: restore the map to "reservation exists" for `addr`.
pub(crate) fn vma_add_reservation(order: u32, vma: &Vma, addr: u64) -> Result<u64> {
    vma_reservation(order, vma, addr, ResvMode::Add)
}

/// Error path: remove the map entry created for `addr`.
pub(crate) fn vma_del_reservation(order: u32, vma: &Vma, addr: u64) -> Result<u64> {
    vma_reservation(order, vma, addr, ResvMode::Del)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORDER: u32 = 9;
    const HP: u64 = 1 << ORDER;

    fn shared_vma() -> Vma {
        let inode = Inode::new(1, ClassId(0), None);
        Vma::new_shared(MmId(1), 0, 8 * HP, 0, inode)
    }

    fn owner_vma() -> Vma {
        let inode = Inode::new(1, ClassId(0), None);
        let vma = Vma::new_private(MmId(1), 0, 8 * HP, 0, inode);
        vma.set_resv_map(Arc::new(ReservationMap::new()), OwnerFlags::OWNER);
        vma
    }

    #[test]
    fn empty_map_polarity_inversion() {
        // Same empty-ledger state, opposite answers by mapping type.
        let shared = shared_vma();
        let needs = vma_needs_reservation(ORDER, &shared, 0).unwrap();
        assert_eq!(needs, 1, "shared empty map: no reservation");
        vma_end_reservation(ORDER, &shared, 0);

        let private = owner_vma();
        let needs = vma_needs_reservation(ORDER, &private, 0).unwrap();
        assert_eq!(needs, 0, "private empty map: reservation exists");
        vma_end_reservation(ORDER, &private, 0);
    }

    #[test]
    fn private_commit_records_consumption() {
        let vma = owner_vma();
        let map = vma.resv_map().unwrap();

        assert_eq!(vma_needs_reservation(ORDER, &vma, 0).unwrap(), 0);
        // Committing marks the page consumed in the private map.
        assert_eq!(vma_commit_reservation(ORDER, &vma, 0).unwrap(), 0);
        assert_eq!(map.snapshot(), [(0, 1)]);

        // The same page now reads as "needs a fresh page".
        assert_eq!(vma_needs_reservation(ORDER, &vma, 0).unwrap(), 1);
        vma_end_reservation(ORDER, &vma, 0);
    }

    #[test]
    fn has_reserves_decision_table() {
        // Shared, no NORESERVE.
        let shared = shared_vma();
        assert!(vma_has_reserves(&shared, 0));
        assert!(!vma_has_reserves(&shared, 1)); // hole-punched

        // NORESERVE shared: only a pre-existing reservation counts.
        let mut nr_shared = shared_vma();
        nr_shared.flags |= VmFlags::NORESERVE;
        assert!(vma_has_reserves(&nr_shared, 0));
        assert!(!vma_has_reserves(&nr_shared, 1));

        // NORESERVE private: never.
        let inode = Inode::new(1, ClassId(0), None);
        let mut nr_priv = Vma::new_private(MmId(1), 0, 8 * HP, 0, inode);
        nr_priv.flags |= VmFlags::NORESERVE;
        assert!(!vma_has_reserves(&nr_priv, 0));

        // Private owner.
        let owner = owner_vma();
        assert!(vma_has_reserves(&owner, 0));
        assert!(!vma_has_reserves(&owner, 1));

        // Private non-owner (forked child).
        let child = owner.dup_for_fork(MmId(2));
        assert!(!vma_has_reserves(&child, 0));
        assert!(!vma_has_reserves(&child, 1));
    }

    #[test]
    fn fork_child_loses_private_map() {
        let vma = owner_vma();
        assert!(vma.resv_map().is_some());
        let child = vma.dup_for_fork(MmId(2));
        assert!(child.resv_map().is_none());
        assert!(!child.resv_flag(OwnerFlags::OWNER));
        // No map: allocation must bring its own page.
        assert_eq!(vma_needs_reservation(ORDER, &child, 0).unwrap(), 1);
    }

    #[test]
    fn error_path_add_and_del() {
        // Shared: Add creates the entry, Del removes it.
        let shared = shared_vma();
        let map = shared.resv_map().unwrap();
        let _ = vma_needs_reservation(ORDER, &shared, 0).unwrap();
        vma_add_reservation(ORDER, &shared, 0).unwrap();
        assert_eq!(map.snapshot(), [(0, 1)]);
        let _ = vma_needs_reservation(ORDER, &shared, 0).unwrap();
        vma_del_reservation(ORDER, &shared, 0).unwrap();
        assert!(map.snapshot().is_empty());

        // Private: Del *creates* the consumption entry (reservation gone).
        let private = owner_vma();
        let map = private.resv_map().unwrap();
        let _ = vma_needs_reservation(ORDER, &private, 0).unwrap();
        vma_del_reservation(ORDER, &private, 0).unwrap();
        assert_eq!(map.snapshot(), [(0, 1)]);
    }
}

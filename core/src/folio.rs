//! Pooled page (folio) records.
//!
//! A folio is a physically contiguous block of `2^order` base pages owned by
//! one size class. Folio records live in an arena indexed by [`FolioId`];
//! every mutation happens under the global pool lock.
//!
//! Lifetime states are explicit rather than encoded in a refcount:
//! `Free` means the folio sits on a free list, `Active { refs: 0 }` is the
//! frozen caller-owned state fresh allocations and demotions pass through,
//! and `Active { refs: n > 0 }` is a referenced page.

use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use hugetlb_hal::{CgroupRef, PageRange};

use crate::hstate::ClassId;
use crate::subpool::Subpool;

/// Handle to a folio record in the pool arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FolioId(pub(crate) u32);

impl FolioId {
    /// Raw arena slot, stable for the folio's lifetime.
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Where a folio is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// On a free list. Implies no references exist.
    Free,
    /// Off the free lists; `refs == 0` is the frozen, exclusively-owned state.
    Active { refs: u32 },
}

bitflags! {
    /// Folio attribute flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FolioFlags: u8 {
        /// Allocated beyond the persistent pool; freed straight back to the
        /// provider instead of the free lists.
        const TEMPORARY = 1 << 0;
        /// Eligible for migration.
        const MIGRATABLE = 1 << 1;
        /// Freeing this folio must restore a consumed reservation.
        const RESTORE_RESERVE = 1 << 2;
        /// Backing metadata pages were released; they must be restored
        /// before the folio can be freed or split.
        const VMEMMAP_OPTIMIZED = 1 << 3;
        /// Hardware poison was reported on the range.
        const HWPOISON = 1 << 4;
    }
}

/// One pooled huge page.
pub(crate) struct Folio {
    pub class: ClassId,
    pub range: PageRange,
    pub state: PageState,
    pub flags: FolioFlags,
    /// Mount quota the page was allocated against.
    pub subpool: Option<Arc<Subpool>>,
    /// Committed usage charge.
    pub cgroup: Option<CgroupRef>,
    /// Committed reservation charge (deferred-reserve allocations only).
    pub cgroup_rsvd: Option<CgroupRef>,
    /// Mappings referencing the folio.
    pub mapcount: u32,
    /// Anonymous (private COW) page rather than page-cache backed.
    pub anon: bool,
}

impl Folio {
    pub(crate) fn new(class: ClassId, range: PageRange) -> Self {
        Self {
            class,
            range,
            state: PageState::Active { refs: 0 },
            flags: FolioFlags::empty(),
            subpool: None,
            cgroup: None,
            cgroup_rsvd: None,
            mapcount: 0,
            anon: false,
        }
    }

    pub(crate) fn is_free(&self) -> bool {
        matches!(self.state, PageState::Free)
    }

    pub(crate) fn refs(&self) -> u32 {
        match self.state {
            PageState::Free => 0,
            PageState::Active { refs } => refs,
        }
    }

    /// Take a reference on an active folio.
    pub(crate) fn get(&mut self) {
        match &mut self.state {
            PageState::Active { refs } => *refs += 1,
            PageState::Free => panic!("reference taken on a free folio"),
        }
    }

    /// Drop a reference; returns true when this was the last one.
    pub(crate) fn put(&mut self) -> bool {
        match &mut self.state {
            PageState::Active { refs } => {
                *refs = refs.checked_sub(1).expect("folio refcount underflow");
                *refs == 0
            }
            PageState::Free => panic!("reference dropped on a free folio"),
        }
    }
}

/// Slab of folio records with stable ids.
pub(crate) struct FolioArena {
    slots: Vec<Option<Folio>>,
    free_slots: Vec<u32>,
}

impl FolioArena {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
        }
    }

    pub(crate) fn insert(&mut self, folio: Folio) -> FolioId {
        if let Some(slot) = self.free_slots.pop() {
            debug_assert!(self.slots[slot as usize].is_none());
            self.slots[slot as usize] = Some(folio);
            FolioId(slot)
        } else {
            self.slots.push(Some(folio));
            FolioId((self.slots.len() - 1) as u32)
        }
    }

    /// Look up a folio that may already have been released.
    pub(crate) fn get(&self, id: FolioId) -> Option<&Folio> {
        self.slots.get(id.0 as usize).and_then(|s| s.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: FolioId) -> Option<&mut Folio> {
        self.slots.get_mut(id.0 as usize).and_then(|s| s.as_mut())
    }

    /// Look up a folio that must exist.
    pub(crate) fn folio(&self, id: FolioId) -> &Folio {
        self.get(id).expect("stale folio id")
    }

    pub(crate) fn folio_mut(&mut self, id: FolioId) -> &mut Folio {
        self.get_mut(id).expect("stale folio id")
    }

    /// Remove a record, releasing its id.
    pub(crate) fn remove(&mut self, id: FolioId) -> Folio {
        let folio = self.slots[id.0 as usize].take().expect("stale folio id");
        self.free_slots.push(id.0);
        folio
    }

    /// Number of live records.
    pub(crate) fn len(&self) -> usize {
        self.slots.len() - self.free_slots.len()
    }
}

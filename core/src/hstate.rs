//! Huge-page size classes.
//!
//! Each supported huge-page size gets one immutable [`SizeClass`] descriptor
//! and one block of mutable counters ([`ClassCounters`]) guarded by the
//! global pool lock. Size classes are created at pool construction and never
//! destroyed.

use alloc::collections::VecDeque;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use hugetlb_hal::{NodeId, NodeMask};

use crate::folio::FolioId;

/// Largest order the buddy-style provider path can supply directly; anything
/// above is a gigantic class served by the contiguous-range path.
pub const MAX_BUDDY_ORDER: u32 = 10;

/// Upper bound on registered size classes.
pub const MAX_SIZE_CLASSES: usize = 8;

/// Index of a size class within the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(pub(crate) usize);

impl ClassId {
    /// Position in the registry, usable as an array index.
    pub fn index(self) -> usize {
        self.0
    }
}

/// Immutable descriptor of one huge-page size.
#[derive(Debug)]
pub struct SizeClass {
    /// Registry index.
    pub id: ClassId,
    /// log2 of base pages per huge page.
    pub order: u32,
    /// Human-readable name, `hugepages-<kB>kB` style.
    pub name: String,
    /// Next smaller registered class, target of demotion.
    pub demote: Option<ClassId>,
}

impl SizeClass {
    pub(crate) fn new(id: ClassId, order: u32, base_page_shift: u32) -> Self {
        let kb = (1u64 << (order + base_page_shift)) >> 10;
        Self {
            id,
            order,
            name: format!("hugepages-{kb}kB"),
            demote: None,
        }
    }

    /// Base pages per huge page of this class.
    pub fn pages_per_huge_page(&self) -> u64 {
        1u64 << self.order
    }

    /// Served by the contiguous-range provider path.
    pub fn is_gigantic(&self) -> bool {
        self.order > MAX_BUDDY_ORDER
    }
}

/// Mutable per-class state. Every field is guarded by the global pool lock.
pub(crate) struct ClassCounters {
    /// Free folios per node.
    pub free_lists: Vec<VecDeque<FolioId>>,
    /// All folios owned by the class (free or active).
    pub nr_huge_pages: u64,
    pub free_huge_pages: u64,
    /// Pages promised to reservations but not yet handed out.
    pub resv_huge_pages: u64,
    /// Pages allocated beyond the persistent pool size.
    pub surplus_huge_pages: u64,
    /// Administrative target for the persistent pool size.
    pub max_huge_pages: u64,
    /// Cap on surplus growth.
    pub nr_overcommit: u64,
    pub nr_huge_pages_node: Vec<u64>,
    pub free_huge_pages_node: Vec<u64>,
    pub surplus_huge_pages_node: Vec<u64>,
    /// Round-robin cursors keeping per-node counts balanced.
    pub next_nid_to_alloc: NodeId,
    pub next_nid_to_free: NodeId,
}

impl ClassCounters {
    pub(crate) fn new(nodes: usize) -> Self {
        Self {
            free_lists: (0..nodes).map(|_| VecDeque::new()).collect(),
            nr_huge_pages: 0,
            free_huge_pages: 0,
            resv_huge_pages: 0,
            surplus_huge_pages: 0,
            max_huge_pages: 0,
            nr_overcommit: 0,
            nr_huge_pages_node: alloc::vec![0; nodes],
            free_huge_pages_node: alloc::vec![0; nodes],
            surplus_huge_pages_node: alloc::vec![0; nodes],
            next_nid_to_alloc: NodeId::new(0),
            next_nid_to_free: NodeId::new(0),
        }
    }

    /// Free pages not spoken for by reservations.
    pub(crate) fn available(&self) -> u64 {
        self.free_huge_pages - self.resv_huge_pages
    }

    /// Pool pages that are not surplus.
    pub(crate) fn persistent(&self) -> u64 {
        self.nr_huge_pages - self.surplus_huge_pages
    }

    /// Advance the allocation cursor and return the node to allocate from.
    pub(crate) fn next_node_to_alloc(&mut self, allowed: &NodeMask) -> Option<NodeId> {
        let nid = if allowed.contains(self.next_nid_to_alloc) {
            self.next_nid_to_alloc
        } else {
            allowed.next_in(self.next_nid_to_alloc)?
        };
        self.next_nid_to_alloc = allowed.next_in(nid)?;
        Some(nid)
    }

    /// Advance the free cursor and return the node to free from. The cursor
    /// moves whether or not the caller finds a page there, so consecutive
    /// frees address consecutive nodes.
    pub(crate) fn next_node_to_free(&mut self, allowed: &NodeMask) -> Option<NodeId> {
        let nid = if allowed.contains(self.next_nid_to_free) {
            self.next_nid_to_free
        } else {
            allowed.next_in(self.next_nid_to_free)?
        };
        self.next_nid_to_free = allowed.next_in(nid)?;
        Some(nid)
    }
}

/// Point-in-time counter snapshot of one size class, the administrative
/// query surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassStats {
    pub order: u32,
    pub total: u64,
    pub free: u64,
    pub reserved: u64,
    pub surplus: u64,
    pub per_node_total: Vec<u64>,
    pub per_node_free: Vec<u64>,
    pub per_node_surplus: Vec<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_naming_and_gigantic() {
        let two_mb = SizeClass::new(ClassId(0), 9, 12);
        assert_eq!(two_mb.name, "hugepages-2048kB");
        assert_eq!(two_mb.pages_per_huge_page(), 512);
        assert!(!two_mb.is_gigantic());

        let one_gb = SizeClass::new(ClassId(1), 18, 12);
        assert_eq!(one_gb.name, "hugepages-1048576kB");
        assert!(one_gb.is_gigantic());
    }

    #[test]
    fn round_robin_cursors_balance() {
        let mut counters = ClassCounters::new(4);
        let allowed = NodeMask::first_nodes(4);
        let seq: alloc::vec::Vec<u32> = (0..6)
            .map(|_| counters.next_node_to_alloc(&allowed).unwrap().raw())
            .collect();
        assert_eq!(seq, [0, 1, 2, 3, 0, 1]);

        // The free cursor is independent and also wraps.
        let mut narrow = NodeMask::empty();
        narrow.set(NodeId::new(2));
        narrow.set(NodeId::new(3));
        let seq: alloc::vec::Vec<u32> = (0..3)
            .map(|_| counters.next_node_to_free(&narrow).unwrap().raw())
            .collect();
        assert_eq!(seq, [2, 3, 2]);
    }
}

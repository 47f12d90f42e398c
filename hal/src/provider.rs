//! Physical page provider contract.
//!
//! The pool engine never touches page frames directly; it asks a provider for
//! physically contiguous ranges and hands them back when pages leave the pool.
//! The provider is the buddy/CMA/bootmem equivalent of the environment.

use crate::gfp::GfpFlags;
use crate::node::{NodeId, NodeMask};

/// A physically contiguous run of base pages.
///
/// Ranges come back from [`PhysicalPageProvider::alloc`] with a reference
/// count of one. The contiguous path used for gigantic pages returns ranges
/// whose pages are individually refcounted; [`PhysicalPageProvider::freeze`]
/// collapses them into a single frozen compound block before the pool will
/// accept them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRange {
    /// First page frame number.
    pub pfn: u64,
    /// Number of base pages.
    pub pages: u64,
    /// Node the range lives on.
    pub node: NodeId,
    /// Range sits in the restricted low-memory zone.
    pub low_memory: bool,
}

impl PageRange {
    /// One-past-the-end frame number.
    pub fn end_pfn(&self) -> u64 {
        self.pfn + self.pages
    }
}

/// Bulk allocation backend for the pool.
pub trait PhysicalPageProvider: Send + Sync {
    /// Allocate `2^order` contiguous base pages.
    ///
    /// `node` is the preferred node (`None` means "local"). With
    /// [`GfpFlags::THISNODE`] only the preferred node is eligible; otherwise
    /// `mask` (or every node with memory) is walked starting from the
    /// preference.
    fn alloc(
        &self,
        order: u32,
        flags: GfpFlags,
        node: Option<NodeId>,
        mask: Option<&NodeMask>,
    ) -> Option<PageRange>;

    /// Allocate an arbitrary-length contiguous range (CMA/contig equivalent).
    ///
    /// Used for gigantic orders the buddy path cannot supply.
    fn alloc_contiguous(
        &self,
        pages: u64,
        flags: GfpFlags,
        node: Option<NodeId>,
        mask: Option<&NodeMask>,
    ) -> Option<PageRange>;

    /// Return a range to the provider.
    fn free(&self, range: PageRange);

    /// Freeze a freshly allocated range into a compound block with reference
    /// count zero.
    ///
    /// May fail when a transient reference was taken on one of the pages
    /// (speculative access races); the caller frees the range and may retry
    /// with a new allocation.
    fn freeze(&self, range: &PageRange) -> bool;

    /// Nodes that have memory at all.
    fn nodes_with_memory(&self) -> NodeMask;
}

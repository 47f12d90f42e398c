//! Deterministic in-memory page provider.
//!
//! Backs the engine in tests and on hosts without a real physical allocator.
//! Page frames are numbers, not memory: the simulator tracks per-node budgets
//! and outstanding ranges, and supports targeted failure injection so the
//! engine's unwind paths are reachable.

use alloc::vec::Vec;

use hashbrown::HashMap;
use spin::Mutex;

use crate::gfp::GfpFlags;
use crate::node::{NodeId, NodeMask};
use crate::provider::{PageRange, PhysicalPageProvider};

struct NodeBudget {
    capacity: u64,
    allocated: u64,
}

struct SimState {
    nodes: Vec<NodeBudget>,
    next_pfn: u64,
    /// pfn -> page count of outstanding ranges.
    outstanding: HashMap<u64, (u64, NodeId)>,
    /// Fail this many upcoming allocations.
    fail_allocs: u32,
    /// Fail this many upcoming freeze attempts.
    fail_freezes: u32,
}

/// Simulated physical page provider.
pub struct SimProvider {
    state: Mutex<SimState>,
    /// Frames below this boundary report as low memory.
    low_boundary: u64,
    node_count: usize,
}

impl SimProvider {
    /// Provider with `nodes` NUMA nodes of `capacity_pages` base pages each.
    pub fn new(nodes: usize, capacity_pages: u64) -> Self {
        assert!(nodes >= 1);
        let budgets = (0..nodes)
            .map(|_| NodeBudget {
                capacity: capacity_pages,
                allocated: 0,
            })
            .collect();
        Self {
            state: Mutex::new(SimState {
                nodes: budgets,
                next_pfn: 0x1000,
                outstanding: HashMap::new(),
                fail_allocs: 0,
                fail_freezes: 0,
            }),
            low_boundary: 0,
            node_count: nodes,
        }
    }

    /// Provider whose first `low_pages` frames are low-memory.
    pub fn with_low_memory(nodes: usize, capacity_pages: u64, low_pages: u64) -> Self {
        let mut sim = Self::new(nodes, capacity_pages);
        sim.low_boundary = 0x1000 + low_pages;
        sim
    }

    /// Make the next `count` allocation calls fail.
    pub fn fail_next_allocs(&self, count: u32) {
        self.state.lock().fail_allocs = count;
    }

    /// Make the next `count` freeze calls fail.
    pub fn fail_next_freezes(&self, count: u32) {
        self.state.lock().fail_freezes = count;
    }

    /// Total base pages currently handed out.
    pub fn outstanding_pages(&self) -> u64 {
        self.state
            .lock()
            .outstanding
            .values()
            .map(|(pages, _)| pages)
            .sum()
    }

    /// Base pages handed out on one node.
    pub fn outstanding_on(&self, node: NodeId) -> u64 {
        self.state.lock().nodes[node.index()].allocated
    }

    fn take(state: &mut SimState, pages: u64, node: NodeId, low_boundary: u64) -> PageRange {
        let pfn = state.next_pfn;
        state.next_pfn += pages;
        state.nodes[node.index()].allocated += pages;
        state.outstanding.insert(pfn, (pages, node));
        PageRange {
            pfn,
            pages,
            node,
            low_memory: pfn < low_boundary,
        }
    }

    fn alloc_pages(
        &self,
        pages: u64,
        flags: GfpFlags,
        node: Option<NodeId>,
        mask: Option<&NodeMask>,
    ) -> Option<PageRange> {
        let mut state = self.state.lock();

        if state.fail_allocs > 0 {
            state.fail_allocs -= 1;
            if !flags.contains(GfpFlags::NOWARN) {
                log::debug!("sim: injected allocation failure ({pages} pages)");
            }
            return None;
        }

        let preferred = node.unwrap_or(NodeId::new(0));
        let fits = |state: &SimState, nid: NodeId| {
            let budget = &state.nodes[nid.index()];
            budget.capacity - budget.allocated >= pages
        };

        if fits(&state, preferred) {
            return Some(Self::take(&mut state, pages, preferred, self.low_boundary));
        }
        if flags.contains(GfpFlags::THISNODE) {
            return None;
        }

        let all = self.nodes_with_memory();
        let walk = mask.copied().unwrap_or(all);
        let mut nid = preferred;
        for _ in 0..walk.weight() {
            nid = walk.next_in(nid)?;
            if fits(&state, nid) {
                return Some(Self::take(&mut state, pages, nid, self.low_boundary));
            }
        }
        None
    }
}

impl PhysicalPageProvider for SimProvider {
    fn alloc(
        &self,
        order: u32,
        flags: GfpFlags,
        node: Option<NodeId>,
        mask: Option<&NodeMask>,
    ) -> Option<PageRange> {
        self.alloc_pages(1u64 << order, flags, node, mask)
    }

    fn alloc_contiguous(
        &self,
        pages: u64,
        flags: GfpFlags,
        node: Option<NodeId>,
        mask: Option<&NodeMask>,
    ) -> Option<PageRange> {
        self.alloc_pages(pages, flags, node, mask)
    }

    fn free(&self, range: PageRange) {
        let mut state = self.state.lock();
        if let Some((pages, node)) = state.outstanding.remove(&range.pfn) {
            if pages == range.pages {
                state.nodes[node.index()].allocated -= pages;
                return;
            }
            // Freeing the head of a larger range: keep the tail outstanding.
            assert!(range.pages < pages, "free exceeds outstanding range");
            state
                .outstanding
                .insert(range.pfn + range.pages, (pages - range.pages, node));
            state.nodes[node.index()].allocated -= range.pages;
            return;
        }

        // A split piece from the middle or tail of an outstanding range.
        let parent = state
            .outstanding
            .iter()
            .map(|(&pfn, &(pages, node))| (pfn, pages, node))
            .find(|&(pfn, pages, _)| pfn < range.pfn && range.pfn + range.pages <= pfn + pages)
            .expect("freeing a range the provider never handed out");
        let (pfn, pages, node) = parent;
        state.outstanding.remove(&pfn);
        state.outstanding.insert(pfn, (range.pfn - pfn, node));
        let tail = (pfn + pages) - (range.pfn + range.pages);
        if tail > 0 {
            state.outstanding.insert(range.pfn + range.pages, (tail, node));
        }
        state.nodes[node.index()].allocated -= range.pages;
    }

    fn freeze(&self, _range: &PageRange) -> bool {
        let mut state = self.state.lock();
        if state.fail_freezes > 0 {
            state.fail_freezes -= 1;
            return false;
        }
        true
    }

    fn nodes_with_memory(&self) -> NodeMask {
        NodeMask::first_nodes(self.node_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_node_budgets() {
        let sim = SimProvider::new(2, 8);
        let a = sim.alloc(3, GfpFlags::pool(), Some(NodeId::new(0)), None).unwrap();
        assert_eq!(a.node, NodeId::new(0));
        assert_eq!(a.pages, 8);

        // Node 0 exhausted; falls over to node 1 without THISNODE.
        let b = sim.alloc(3, GfpFlags::pool(), Some(NodeId::new(0)), None).unwrap();
        assert_eq!(b.node, NodeId::new(1));

        // THISNODE pins the request.
        assert!(sim
            .alloc(0, GfpFlags::THISNODE, Some(NodeId::new(0)), None)
            .is_none());

        sim.free(a);
        assert!(sim
            .alloc(0, GfpFlags::THISNODE, Some(NodeId::new(0)), None)
            .is_some());
    }

    #[test]
    fn failure_injection() {
        let sim = SimProvider::new(1, 64);
        sim.fail_next_allocs(1);
        assert!(sim.alloc(0, GfpFlags::pool(), None, None).is_none());
        assert!(sim.alloc(0, GfpFlags::pool(), None, None).is_some());

        let range = sim.alloc_contiguous(8, GfpFlags::pool(), None, None).unwrap();
        sim.fail_next_freezes(1);
        assert!(!sim.freeze(&range));
        assert!(sim.freeze(&range));
    }

    #[test]
    #[should_panic(expected = "never handed out")]
    fn double_free_is_fatal() {
        let sim = SimProvider::new(1, 16);
        let range = sim.alloc(0, GfpFlags::pool(), None, None).unwrap();
        sim.free(range.clone());
        sim.free(range);
    }

    #[test]
    fn split_ranges_free_piecewise() {
        let sim = SimProvider::new(1, 64);
        let range = sim.alloc_contiguous(16, GfpFlags::pool(), None, None).unwrap();
        let node = range.node;

        // Free the middle, then head, then tail, as a demotion would.
        let piece = |pfn, pages| PageRange {
            pfn,
            pages,
            node,
            low_memory: false,
        };
        sim.free(piece(range.pfn + 4, 4));
        assert_eq!(sim.outstanding_pages(), 12);
        sim.free(piece(range.pfn, 4));
        sim.free(piece(range.pfn + 8, 8));
        assert_eq!(sim.outstanding_pages(), 0);
    }

    #[test]
    fn low_memory_tagging() {
        let sim = SimProvider::with_low_memory(1, 64, 4);
        let a = sim.alloc(2, GfpFlags::pool(), None, None).unwrap();
        assert!(a.low_memory);
        let b = sim.alloc(2, GfpFlags::pool(), None, None).unwrap();
        assert!(!b.low_memory);
    }
}

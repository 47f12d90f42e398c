//! Page-table backend contract and a software implementation.
//!
//! The engine treats page tables as a pluggable backend that can allocate and
//! look up huge-page-sized leaf entries. Leaf entries live in tables covering
//! a fixed span of leaves; tables backing identically aligned mappings of the
//! same file region can be shared between address spaces (PMD sharing), which
//! is why the contract includes an unshare operation.
//!
//! Addresses and sizes are expressed in base-page units throughout.

use hashbrown::HashMap;
use spin::Mutex;

/// Leaf entries per table; a shared table covers this many huge pages.
pub const LEAVES_PER_TABLE: u64 = 512;

/// Identifier of an address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MmId(pub u64);

/// Handle to a huge-page leaf entry: a table and a leaf index within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHandle {
    table: u64,
    index: u64,
}

/// The slice of mapping state the backend needs to decide leaf placement and
/// sharing eligibility.
#[derive(Debug, Clone, Copy)]
pub struct VmaView {
    /// First mapped base page.
    pub start: u64,
    /// One past the last mapped base page.
    pub end: u64,
    /// File offset of `start`, in base pages.
    pub pgoff: u64,
    /// Permission bits relevant to sharing (locked-state bits already masked
    /// out by the caller).
    pub flags_key: u64,
    /// Backing file identity, if file-backed.
    pub inode: Option<u64>,
    /// Mapping may be shared with other address spaces.
    pub may_share: bool,
    /// A sharable lock object exists for this mapping.
    pub sharable_lock: bool,
}

/// Page-table operations the engine depends on.
pub trait PageTableBackend: Send + Sync {
    /// Find or create the leaf entry mapping `addr` with `leaf_pages`-sized
    /// leaves, sharing the containing table with other address spaces when
    /// eligible.
    fn alloc_leaf_entry(
        &self,
        mm: MmId,
        vma: &VmaView,
        addr: u64,
        leaf_pages: u64,
    ) -> Option<EntryHandle>;

    /// Look up an existing leaf entry, without creating tables.
    fn lookup_leaf_entry(&self, mm: MmId, addr: u64, leaf_pages: u64) -> Option<EntryHandle>;

    /// If `addr` is covered by a table shared with another address space,
    /// detach this address space from it. Returns true when an unshare
    /// happened (the whole table span is gone from `mm`).
    fn unshare_if_shared(&self, mm: MmId, vma: &VmaView, addr: u64, leaf_pages: u64) -> bool;

    /// Read a leaf entry value (0 = not present).
    fn read(&self, entry: EntryHandle) -> u64;

    /// Write a leaf entry value.
    fn write(&self, entry: EntryHandle, value: u64);
}

// =============================================================================
// Software page tables
// =============================================================================

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct ShareKey {
    inode: u64,
    /// File-relative table index (file offset / table span).
    table_index: u64,
    flags_key: u64,
}

struct Table {
    refs: u32,
    entries: HashMap<u64, u64>,
}

struct SoftState {
    tables: HashMap<u64, Table>,
    next_table: u64,
    /// (mm, span base address) -> table.
    by_span: HashMap<(MmId, u64), u64>,
    shared: HashMap<ShareKey, u64>,
}

/// Software page tables with file-keyed table sharing.
pub struct SoftPageTables {
    state: Mutex<SoftState>,
}

impl SoftPageTables {
    /// Empty table set.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SoftState {
                tables: HashMap::new(),
                next_table: 1,
                by_span: HashMap::new(),
                shared: HashMap::new(),
            }),
        }
    }

    /// Number of tables currently shared by more than one address space.
    pub fn shared_tables(&self) -> usize {
        self.state
            .lock()
            .tables
            .values()
            .filter(|t| t.refs > 1)
            .count()
    }

    fn span(leaf_pages: u64) -> u64 {
        leaf_pages * LEAVES_PER_TABLE
    }

    /// Sharing requires a file-backed MAYSHARE mapping with a sharable lock,
    /// covering the whole aligned table span with virtual and file offsets
    /// congruent modulo the span.
    fn share_key(vma: &VmaView, addr: u64, leaf_pages: u64) -> Option<ShareKey> {
        let span = Self::span(leaf_pages);
        let inode = vma.inode?;
        if !vma.may_share || !vma.sharable_lock {
            return None;
        }
        let span_base = addr & !(span - 1);
        if span_base < vma.start || span_base + span > vma.end {
            return None;
        }
        if (vma.start.wrapping_sub(vma.pgoff)) % span != 0 {
            return None;
        }
        let file_base = span_base - vma.start + vma.pgoff;
        Some(ShareKey {
            inode,
            table_index: file_base / span,
            flags_key: vma.flags_key,
        })
    }
}

impl Default for SoftPageTables {
    fn default() -> Self {
        Self::new()
    }
}

impl PageTableBackend for SoftPageTables {
    fn alloc_leaf_entry(
        &self,
        mm: MmId,
        vma: &VmaView,
        addr: u64,
        leaf_pages: u64,
    ) -> Option<EntryHandle> {
        let span = Self::span(leaf_pages);
        let span_base = addr & !(span - 1);
        let index = (addr & (span - 1)) / leaf_pages;
        let mut state = self.state.lock();

        if let Some(&table) = state.by_span.get(&(mm, span_base)) {
            return Some(EntryHandle { table, index });
        }

        let table = if let Some(key) = Self::share_key(vma, addr, leaf_pages) {
            if let Some(&shared) = state.shared.get(&key) {
                state.tables.get_mut(&shared).expect("stale share entry").refs += 1;
                shared
            } else {
                let id = state.next_table;
                state.next_table += 1;
                state.tables.insert(
                    id,
                    Table {
                        refs: 1,
                        entries: HashMap::new(),
                    },
                );
                state.shared.insert(key, id);
                id
            }
        } else {
            let id = state.next_table;
            state.next_table += 1;
            state.tables.insert(
                id,
                Table {
                    refs: 1,
                    entries: HashMap::new(),
                },
            );
            id
        };

        state.by_span.insert((mm, span_base), table);
        Some(EntryHandle { table, index })
    }

    fn lookup_leaf_entry(&self, mm: MmId, addr: u64, leaf_pages: u64) -> Option<EntryHandle> {
        let span = Self::span(leaf_pages);
        let span_base = addr & !(span - 1);
        let index = (addr & (span - 1)) / leaf_pages;
        let state = self.state.lock();
        state
            .by_span
            .get(&(mm, span_base))
            .map(|&table| EntryHandle { table, index })
    }

    fn unshare_if_shared(&self, mm: MmId, vma: &VmaView, addr: u64, leaf_pages: u64) -> bool {
        let span = Self::span(leaf_pages);
        let span_base = addr & !(span - 1);
        let mut state = self.state.lock();

        let Some(&table) = state.by_span.get(&(mm, span_base)) else {
            return false;
        };
        let refs = state.tables.get(&table).expect("mapped table missing").refs;
        if refs <= 1 {
            return false;
        }

        state.by_span.remove(&(mm, span_base));
        let table_state = state.tables.get_mut(&table).expect("mapped table missing");
        table_state.refs -= 1;
        if table_state.refs == 0 {
            // Unreachable while another sharer exists; kept for symmetry with
            // full teardown.
            state.tables.remove(&table);
            if let Some(key) = Self::share_key(vma, addr, leaf_pages) {
                state.shared.remove(&key);
            }
        }
        true
    }

    fn read(&self, entry: EntryHandle) -> u64 {
        let state = self.state.lock();
        state
            .tables
            .get(&entry.table)
            .and_then(|t| t.entries.get(&entry.index).copied())
            .unwrap_or(0)
    }

    fn write(&self, entry: EntryHandle, value: u64) {
        let mut state = self.state.lock();
        let table = state
            .tables
            .get_mut(&entry.table)
            .expect("write through a dangling leaf entry");
        if value == 0 {
            table.entries.remove(&entry.index);
        } else {
            table.entries.insert(entry.index, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEAF: u64 = 512; // 2 MiB leaves over 4 KiB base pages

    fn shared_vma(start: u64) -> VmaView {
        VmaView {
            start,
            end: start + LEAF * LEAVES_PER_TABLE,
            pgoff: start, // congruent: start - pgoff == 0
            flags_key: 0b111,
            inode: Some(7),
            may_share: true,
            sharable_lock: true,
        }
    }

    #[test]
    fn identical_mappings_share_tables() {
        let pt = SoftPageTables::new();
        let vma = shared_vma(0);
        let a = pt.alloc_leaf_entry(MmId(1), &vma, 0, LEAF).unwrap();
        let b = pt.alloc_leaf_entry(MmId(2), &vma, 0, LEAF).unwrap();
        assert_eq!(a, b);
        assert_eq!(pt.shared_tables(), 1);

        // A write through one address space is visible through the other.
        pt.write(a, 42);
        assert_eq!(pt.read(b), 42);
    }

    #[test]
    fn unshare_detaches_one_side() {
        let pt = SoftPageTables::new();
        let vma = shared_vma(0);
        let a = pt.alloc_leaf_entry(MmId(1), &vma, 0, LEAF).unwrap();
        pt.alloc_leaf_entry(MmId(2), &vma, 0, LEAF).unwrap();
        pt.write(a, 9);

        assert!(pt.unshare_if_shared(MmId(2), &vma, 0, LEAF));
        assert!(pt.lookup_leaf_entry(MmId(2), 0, LEAF).is_none());
        // Sole owner left: nothing shared to undo.
        assert!(!pt.unshare_if_shared(MmId(1), &vma, 0, LEAF));
        assert_eq!(pt.read(a), 9);
    }

    #[test]
    fn misaligned_or_private_mappings_get_own_tables() {
        let pt = SoftPageTables::new();
        let aligned = shared_vma(0);

        // Virtual/file offsets not congruent modulo the span.
        let mut skewed = shared_vma(0);
        skewed.pgoff += LEAF;
        let a = pt.alloc_leaf_entry(MmId(1), &aligned, 0, LEAF).unwrap();
        let b = pt.alloc_leaf_entry(MmId(2), &skewed, 0, LEAF).unwrap();
        assert_ne!(a, b);

        // No sharable lock object: never shared.
        let mut unlocked = shared_vma(0);
        unlocked.sharable_lock = false;
        let c = pt.alloc_leaf_entry(MmId(3), &unlocked, 0, LEAF).unwrap();
        assert_ne!(a, c);
        assert_eq!(pt.shared_tables(), 0);
    }
}

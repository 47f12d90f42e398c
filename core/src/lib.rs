//! # HugeTLB Pool Engine
//!
//! A pool allocator and reservation-accounting engine for huge pages: a
//! multi-size page pool with per-NUMA-node free lists, an interval-ledger
//! reservation map with copy-on-write semantics, per-mount subpool quotas,
//! cgroup-aware charging, and the fault orchestration that ties them
//! together.
//!
//! ## Architecture
//!
//! - [`config`]: boot-time size-class registration and pre-allocation.
//! - [`pool`]: the [`HugePool`] registry — free lists, counters, fresh and
//!   surplus allocation, resizing, demotion, dissolution.
//! - [`region`]: the reservation ledger, an ordered interval map with a
//!   pre-allocated descriptor cache guaranteeing allocation-free commits.
//! - [`subpool`]: per-mount min/max quota accounting layered above the
//!   global reservation count.
//! - [`vma`]: the mapping model, including the deliberate private/shared
//!   reservation polarity inversion.
//! - [`fault`]: no-page and copy-on-write fault handlers.
//!
//! All machine-facing concerns (physical pages, page tables, cgroup
//! counters) live behind the `hugetlb-hal` contracts, so the engine runs —
//! and is tested — against deterministic software collaborators.
//!
//! ## Locking
//!
//! One global lock guards every pool counter and folio record; it is
//! dropped around anything that can block (provider calls, vmemmap
//! restoration) and the state is re-validated afterwards. Lock order,
//! outermost first: resize mutex (larger size first) -> pool lock ->
//! reservation-map lock -> subpool lock.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod fault;
pub mod folio;
pub mod hstate;
pub mod region;
pub mod subpool;
pub mod vma;
pub mod vmemmap;

pub mod pool;
pub mod reserve;

pub use config::{PoolConfig, SizeClassConfig};
pub use error::{PoolError, Result};
pub use fault::{fault, fork_share, unmap, unmap_ref_private, FaultCtx, FaultKind};
pub use folio::{FolioFlags, FolioId};
pub use hstate::{ClassId, ClassStats, SizeClass, MAX_BUDDY_ORDER, MAX_SIZE_CLASSES};
pub use pool::HugePool;
pub use region::{RegionCharge, ReservationMap, WHOLE_RANGE};
pub use subpool::Subpool;
pub use vma::{Inode, MemPolicy, OwnerFlags, Vma, VmFlags};
pub use vmemmap::VmemmapEngine;

use static_assertions::const_assert;

// The fault-mutex hash masks with (table size - 1).
const_assert!(pool::FAULT_MUTEXES.is_power_of_two());

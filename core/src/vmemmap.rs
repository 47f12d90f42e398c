//! Vmemmap optimization collaborator.
//!
//! When enabled, the metadata pages describing a huge page's tail pages are
//! released back to the system while the page sits in the pool, and must be
//! re-allocated (restored) before the page can be freed, split or dissolved.
//! Restoration allocates memory and can therefore fail; the pool reacts by
//! parking the page back in the pool as surplus instead of freeing it.
//!
//! The engine only depends on the bookkeeping contract, so the collaborator
//! here tracks savings and failure injection rather than real struct pages.

use spin::Mutex;

use crate::error::{PoolError, Result};

struct VmemmapState {
    /// Pages of metadata currently released.
    saved_pages: u64,
    /// Upcoming restore calls to fail, for exercising the fallback paths.
    fail_restores: u32,
}

/// Tracks vmemmap state for the whole pool.
pub struct VmemmapEngine {
    enabled: bool,
    state: Mutex<VmemmapState>,
}

impl VmemmapEngine {
    /// Engine with optimization on or off for the pool's lifetime.
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            state: Mutex::new(VmemmapState {
                saved_pages: 0,
                fail_restores: 0,
            }),
        }
    }

    /// Whether folios of `order` get optimized at all.
    pub fn optimizable(&self) -> bool {
        self.enabled
    }

    /// Release the metadata for one folio. Returns true when the folio must
    /// be marked optimized. Folios too small to have releasable metadata are
    /// left alone.
    pub fn optimize(&self, metadata_pages: u64) -> bool {
        if !self.enabled || metadata_pages == 0 {
            return false;
        }
        self.state.lock().saved_pages += metadata_pages;
        true
    }

    /// Re-allocate the metadata for one folio. Blocking in the real
    /// environment, so callers drop the pool lock around this.
    pub fn restore(&self, metadata_pages: u64) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_restores > 0 {
            state.fail_restores -= 1;
            return Err(PoolError::OutOfMemory);
        }
        state.saved_pages = state
            .saved_pages
            .checked_sub(metadata_pages)
            .expect("restoring more vmemmap than was optimized");
        Ok(())
    }

    /// Metadata pages currently released.
    pub fn saved_pages(&self) -> u64 {
        self.state.lock().saved_pages
    }

    /// Make the next `count` restore calls fail.
    pub fn fail_next_restores(&self, count: u32) {
        self.state.lock().fail_restores = count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optimize_restore_accounting() {
        let engine = VmemmapEngine::new(true);
        assert!(engine.optimize(7));
        assert!(engine.optimize(7));
        assert_eq!(engine.saved_pages(), 14);
        engine.restore(7).unwrap();
        assert_eq!(engine.saved_pages(), 7);
    }

    #[test]
    fn disabled_engine_does_nothing() {
        let engine = VmemmapEngine::new(false);
        assert!(!engine.optimize(7));
        assert_eq!(engine.saved_pages(), 0);
    }

    #[test]
    fn restore_failure_injection() {
        let engine = VmemmapEngine::new(true);
        engine.optimize(7);
        engine.fail_next_restores(1);
        assert_eq!(engine.restore(7), Err(PoolError::OutOfMemory));
        engine.restore(7).unwrap();
    }
}

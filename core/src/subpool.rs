//! Per-mount subpool quota accounting.
//!
//! A subpool layers an optional maximum (hard cap on pages used) and an
//! optional minimum (pages guaranteed to the mount, pre-reserved against the
//! global pool) on top of the global counters. `get_pages`/`put_pages` report
//! how much of a delta the *global* accounting still has to absorb after the
//! subpool's own reserve was drawn down or replenished.
//!
//! A subpool is released once no handles remain, nothing is in use, and the
//! minimum reserve is whole again; release returns the minimum reservation to
//! the global pool. Release can trigger from the last handle drop or from a
//! later `put_pages`, whichever gets the subpool into that state.

use alloc::sync::Arc;

use spin::{Mutex, MutexGuard};

use crate::error::{PoolError, Result};
use crate::hstate::ClassId;
use crate::pool::HugePool;

struct SubpoolState {
    /// Handles (mounted inodes) referencing the subpool.
    count: u32,
    /// Pages currently allocated through the subpool.
    used: u64,
    /// Hard cap on `used`, if any.
    max: Option<u64>,
    /// Guaranteed minimum, if any.
    min: Option<u64>,
    /// Portion of the minimum currently unconsumed.
    rsv: u64,
    /// Minimum reservation was returned to the global pool.
    released: bool,
}

/// Mount-level quota gate for one size class.
pub struct Subpool {
    class: ClassId,
    state: Mutex<SubpoolState>,
}

impl Subpool {
    pub(crate) fn new_raw(class: ClassId, max: Option<u64>, min: Option<u64>) -> Self {
        Self {
            class,
            state: Mutex::new(SubpoolState {
                count: 1,
                used: 0,
                max,
                min,
                rsv: min.unwrap_or(0),
                released: false,
            }),
        }
    }

    /// Size class the subpool accounts for.
    pub fn class(&self) -> ClassId {
        self.class
    }

    /// Pages currently used through the subpool.
    pub fn used_pages(&self) -> u64 {
        self.state.lock().used
    }

    /// Unconsumed portion of the minimum reserve.
    pub fn reserved_pages(&self) -> u64 {
        self.state.lock().rsv
    }

    /// Charge `delta` pages against the subpool.
    ///
    /// Returns the number of pages the global pool must additionally commit:
    /// the part of `delta` not covered by the subpool's own pre-reserve.
    /// Fails without side effects when the maximum would be exceeded.
    pub fn get_pages(&self, delta: u64) -> Result<u64> {
        let mut state = self.state.lock();
        debug_assert!(!state.released);
        let mut ret = delta;

        if let Some(max) = state.max {
            if state.used + delta > max {
                return Err(PoolError::QuotaExceeded);
            }
            state.used += delta;
        }

        if state.min.is_some() && state.rsv > 0 {
            if delta > state.rsv {
                // More than the pre-reserve covers; report the difference.
                ret = delta - state.rsv;
                state.rsv = 0;
            } else {
                ret = 0;
                state.rsv -= delta;
            }
        }

        Ok(ret)
    }

    fn is_free(state: &SubpoolState) -> bool {
        if state.count != 0 {
            return false;
        }
        if state.max.is_some() {
            return state.used == 0;
        }
        if let Some(min) = state.min {
            return state.rsv == min;
        }
        true
    }
}

impl HugePool {
    /// Create a subpool for `class`, committing the minimum reserve against
    /// the global pool.
    pub fn new_subpool(
        &self,
        class: ClassId,
        max: Option<u64>,
        min: Option<u64>,
    ) -> Result<Arc<Subpool>> {
        let spool = Subpool::new_raw(class, max, min);
        if let Some(min) = min {
            self.acct_memory(class, min as i64)?;
        }
        Ok(Arc::new(spool))
    }

    /// Drop one subpool handle, releasing the subpool if that leaves it free.
    pub fn put_subpool(&self, spool: &Arc<Subpool>) {
        let mut state = spool.state.lock();
        assert!(state.count > 0, "subpool handle count underflow");
        state.count -= 1;
        self.unlock_or_release_subpool(spool, state);
    }

    /// Return `delta` pages to the subpool.
    ///
    /// Returns the number of global reservations to drop: the part of
    /// `delta` that was not needed to refill the subpool's minimum reserve.
    /// May release the subpool as a side effect.
    pub fn subpool_put_pages(&self, spool: &Arc<Subpool>, delta: u64) -> u64 {
        let mut state = spool.state.lock();
        debug_assert!(!state.released);
        let mut ret = delta;

        if state.max.is_some() {
            state.used = state
                .used
                .checked_sub(delta)
                .expect("subpool used-page underflow");
        }

        if let Some(min) = state.min {
            if state.used < min {
                ret = if state.rsv + delta <= min {
                    0
                } else {
                    state.rsv + delta - min
                };
                state.rsv = (state.rsv + delta).min(min);
            }
        }

        self.unlock_or_release_subpool(spool, state);
        ret
    }

    /// Release the subpool's minimum reservation back to the global pool if
    /// the subpool became free. Performed inside the releasing call, however
    /// awkward the context, so the reservation never dangles.
    fn unlock_or_release_subpool(&self, spool: &Arc<Subpool>, mut state: MutexGuard<'_, SubpoolState>) {
        if !state.released && Subpool::is_free(&state) {
            state.released = true;
            let min = state.min;
            drop(state);
            if let Some(min) = min {
                let _ = self.acct_memory(spool.class, -(min as i64));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_cap_gates_usage() {
        let spool = Subpool::new_raw(ClassId(0), Some(2), None);
        assert_eq!(spool.get_pages(1), Ok(1));
        assert_eq!(spool.get_pages(1), Ok(1));
        assert_eq!(spool.get_pages(1), Err(PoolError::QuotaExceeded));
        assert_eq!(spool.used_pages(), 2);
    }

    #[test]
    fn min_reserve_draws_down_and_refills() {
        let spool = Subpool::new_raw(ClassId(0), None, Some(3));
        assert_eq!(spool.reserved_pages(), 3);

        // Covered entirely by the pre-reserve: globals charge nothing.
        assert_eq!(spool.get_pages(2), Ok(0));
        assert_eq!(spool.reserved_pages(), 1);

        // Partially covered: only the uncovered remainder is reported.
        assert_eq!(spool.get_pages(3), Ok(2));
        assert_eq!(spool.reserved_pages(), 0);
    }
}

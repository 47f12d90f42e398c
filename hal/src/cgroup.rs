//! Cgroup charge counters.
//!
//! The pool engine treats control-group accounting as an opaque counter
//! service: charge before a page becomes visible as allocated, uncharge
//! exactly once per successful charge. Counters are kept per size class and
//! per kind (usage vs. reservation), mirroring the split the orchestrator
//! relies on for deferred-reservation charging.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

/// Which counter a charge applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeKind {
    /// Pages actually allocated to the group.
    Usage,
    /// Pages reserved on behalf of the group.
    Reservation,
}

struct Counter {
    charged: u64,
    limit: Option<u64>,
}

struct CgroupInner {
    /// `[usage, reservation]` per size class.
    counters: Mutex<Vec<[Counter; 2]>>,
}

/// Handle to one control group's huge-page counters.
///
/// Clones share the same counters. Identity (`same_group`) is handle
/// identity, not counter values; the reservation ledger coalesces adjacent
/// regions only when their charge owners are the same group.
#[derive(Clone)]
pub struct CgroupRef {
    inner: Arc<CgroupInner>,
}

impl CgroupRef {
    /// Group with counters for `size_classes` classes and no limits.
    pub fn new(size_classes: usize) -> Self {
        let counters = (0..size_classes)
            .map(|_| {
                [
                    Counter {
                        charged: 0,
                        limit: None,
                    },
                    Counter {
                        charged: 0,
                        limit: None,
                    },
                ]
            })
            .collect();
        Self {
            inner: Arc::new(CgroupInner {
                counters: Mutex::new(counters),
            }),
        }
    }

    /// Cap one counter; further charges past the cap fail.
    pub fn set_limit(&self, class: usize, kind: ChargeKind, limit: u64) {
        self.inner.counters.lock()[class][kind_index(kind)].limit = Some(limit);
    }

    /// Charge `pages` base pages. Fails without side effects when the limit
    /// would be exceeded.
    pub fn charge(&self, class: usize, kind: ChargeKind, pages: u64) -> Result<(), ()> {
        let mut counters = self.inner.counters.lock();
        let counter = &mut counters[class][kind_index(kind)];
        if let Some(limit) = counter.limit {
            if counter.charged + pages > limit {
                return Err(());
            }
        }
        counter.charged += pages;
        Ok(())
    }

    /// Return `pages` base pages to the counter.
    ///
    /// # Panics
    ///
    /// Underflow means a double uncharge and is a logic bug.
    pub fn uncharge(&self, class: usize, kind: ChargeKind, pages: u64) {
        let mut counters = self.inner.counters.lock();
        let counter = &mut counters[class][kind_index(kind)];
        counter.charged = counter
            .charged
            .checked_sub(pages)
            .expect("cgroup counter underflow");
    }

    /// Current charge on one counter.
    pub fn charged(&self, class: usize, kind: ChargeKind) -> u64 {
        self.inner.counters.lock()[class][kind_index(kind)].charged
    }

    /// Same underlying group?
    pub fn same_group(&self, other: &CgroupRef) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl core::fmt::Debug for CgroupRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "CgroupRef({:p})", Arc::as_ptr(&self.inner))
    }
}

fn kind_index(kind: ChargeKind) -> usize {
    match kind {
        ChargeKind::Usage => 0,
        ChargeKind::Reservation => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charge_respects_limit() {
        let cg = CgroupRef::new(2);
        cg.set_limit(0, ChargeKind::Usage, 4);
        assert!(cg.charge(0, ChargeKind::Usage, 3).is_ok());
        assert!(cg.charge(0, ChargeKind::Usage, 2).is_err());
        assert_eq!(cg.charged(0, ChargeKind::Usage), 3);
        // Other class and kind are unaffected by the limit.
        assert!(cg.charge(1, ChargeKind::Usage, 10).is_ok());
        assert!(cg.charge(0, ChargeKind::Reservation, 10).is_ok());
    }

    #[test]
    fn identity_is_per_group() {
        let a = CgroupRef::new(1);
        let b = CgroupRef::new(1);
        let a2 = a.clone();
        assert!(a.same_group(&a2));
        assert!(!a.same_group(&b));
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn double_uncharge_is_fatal() {
        let cg = CgroupRef::new(1);
        cg.charge(0, ChargeKind::Usage, 1).unwrap();
        cg.uncharge(0, ChargeKind::Usage, 1);
        cg.uncharge(0, ChargeKind::Usage, 1);
    }
}

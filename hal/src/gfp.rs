//! Allocation-request flags passed to the physical page provider.

use bitflags::bitflags;

bitflags! {
    /// Flags shaping a provider allocation request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GfpFlags: u32 {
        /// Only the named node may satisfy the request.
        const THISNODE = 1 << 0;
        /// Try hard (retry reclaim) before failing.
        const RETRY_MAYFAIL = 1 << 1;
        /// Suppress failure diagnostics.
        const NOWARN = 1 << 2;
        /// Fail fast instead of entering blocking reclaim.
        const NO_RECLAIM = 1 << 3;
    }
}

impl GfpFlags {
    /// Baseline mask for huge-page pool allocations.
    pub const fn pool() -> Self {
        GfpFlags::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_composition() {
        let flags = GfpFlags::pool() | GfpFlags::THISNODE | GfpFlags::RETRY_MAYFAIL;
        assert!(flags.contains(GfpFlags::THISNODE));
        assert!(!flags.contains(GfpFlags::NOWARN));
    }
}

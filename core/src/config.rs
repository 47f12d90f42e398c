//! Pool configuration.
//!
//! Size-class registration, boot-time page counts (global or per-node) and
//! overcommit limits, collected into a validated config struct consumed once
//! at pool construction.

use alloc::vec::Vec;

use crate::error::{PoolError, Result};
use crate::hstate::{ClassId, SizeClass, MAX_SIZE_CLASSES};

/// Configuration of one huge-page size class.
#[derive(Debug, Clone)]
pub struct SizeClassConfig {
    /// log2 of base pages per huge page. Must be at least 1.
    pub order: u32,
    /// Pages to pre-allocate at construction, spread across nodes.
    pub boot_pages: u64,
    /// Per-node pre-allocation; overrides `boot_pages` when set.
    pub boot_pages_per_node: Option<Vec<u64>>,
    /// Cap on surplus growth beyond the persistent pool.
    pub overcommit_limit: u64,
}

impl SizeClassConfig {
    /// Class of the given order with no boot pages and no overcommit.
    pub fn new(order: u32) -> Self {
        Self {
            order,
            boot_pages: 0,
            boot_pages_per_node: None,
            overcommit_limit: 0,
        }
    }

    /// Set the boot pre-allocation target.
    pub fn boot_pages(mut self, pages: u64) -> Self {
        self.boot_pages = pages;
        self
    }

    /// Set a per-node boot pre-allocation.
    pub fn boot_pages_per_node(mut self, per_node: Vec<u64>) -> Self {
        self.boot_pages_per_node = Some(per_node);
        self
    }

    /// Set the overcommit limit.
    pub fn overcommit(mut self, limit: u64) -> Self {
        self.overcommit_limit = limit;
        self
    }
}

/// Whole-pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// log2 of the base page size in bytes (12 for 4 KiB pages).
    pub base_page_shift: u32,
    /// NUMA nodes the pool tracks.
    pub nodes: usize,
    /// Release tail-page metadata while pages sit in the pool.
    pub vmemmap_optimize: bool,
    /// Registered size classes.
    pub sizes: Vec<SizeClassConfig>,
}

impl PoolConfig {
    /// Configuration with no size classes registered yet.
    pub fn new(base_page_shift: u32, nodes: usize) -> Self {
        Self {
            base_page_shift,
            nodes,
            vmemmap_optimize: false,
            sizes: Vec::new(),
        }
    }

    /// Register a size class.
    pub fn size(mut self, size: SizeClassConfig) -> Self {
        self.sizes.push(size);
        self
    }

    /// Enable vmemmap optimization.
    pub fn vmemmap_optimize(mut self) -> Self {
        self.vmemmap_optimize = true;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.nodes == 0 || self.nodes > hugetlb_hal::MAX_NODES {
            return Err(PoolError::Invalid);
        }
        if self.sizes.is_empty() || self.sizes.len() > MAX_SIZE_CLASSES {
            return Err(PoolError::Invalid);
        }
        for (i, size) in self.sizes.iter().enumerate() {
            if size.order == 0 {
                return Err(PoolError::Invalid);
            }
            if self.sizes[..i].iter().any(|s| s.order == size.order) {
                log::warn!(
                    "HugeTLB: size class order {} registered twice, rejecting",
                    size.order
                );
                return Err(PoolError::Invalid);
            }
            if let Some(per_node) = &size.boot_pages_per_node {
                if per_node.len() != self.nodes {
                    return Err(PoolError::Invalid);
                }
            }
        }
        Ok(())
    }

    /// Build the immutable class descriptors, deriving each class's demotion
    /// target as the largest registered order smaller than its own.
    pub(crate) fn build_classes(&self) -> Vec<SizeClass> {
        let mut classes: Vec<SizeClass> = self
            .sizes
            .iter()
            .enumerate()
            .map(|(i, s)| SizeClass::new(ClassId(i), s.order, self.base_page_shift))
            .collect();

        for i in 0..classes.len() {
            let mut demote: Option<ClassId> = None;
            for j in 0..classes.len() {
                if classes[j].order < classes[i].order
                    && demote.map_or(true, |d| classes[j].order > classes[d.index()].order)
                {
                    demote = Some(ClassId(j));
                }
            }
            classes[i].demote = demote;
        }
        classes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_rejects_bad_configs() {
        assert_eq!(PoolConfig::new(12, 1).validate(), Err(PoolError::Invalid));

        let dup = PoolConfig::new(12, 1)
            .size(SizeClassConfig::new(9))
            .size(SizeClassConfig::new(9));
        assert_eq!(dup.validate(), Err(PoolError::Invalid));

        let short_nodes = PoolConfig::new(12, 2)
            .size(SizeClassConfig::new(9).boot_pages_per_node(alloc::vec![1]));
        assert_eq!(short_nodes.validate(), Err(PoolError::Invalid));

        let ok = PoolConfig::new(12, 2)
            .size(SizeClassConfig::new(9).boot_pages(4))
            .size(SizeClassConfig::new(18));
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn demote_targets_largest_smaller_order() {
        let config = PoolConfig::new(12, 1)
            .size(SizeClassConfig::new(18))
            .size(SizeClassConfig::new(4))
            .size(SizeClassConfig::new(9));
        let classes = config.build_classes();
        // 1 GiB demotes to 2 MiB (order 9), not order 4.
        assert_eq!(classes[0].demote, Some(ClassId(2)));
        // Order 4 has nothing smaller.
        assert_eq!(classes[1].demote, None);
        // Order 9 demotes to order 4.
        assert_eq!(classes[2].demote, Some(ClassId(1)));
    }
}

//! Statistics and debugging for the allocators
//!
//! Plain counters collected on demand, plus a reporter that prints them
//! through the `log` facade. Compiled only with the `tracking` feature.

#[cfg(feature = "log")]
use log::info;

/// Occupancy of one fixed-size allocator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixedSizeStats {
    pub block_size: usize,
    pub allocs: usize,
    pub frees: usize,
    pub pages: usize,
    pub busy_blocks: usize,
    pub free_blocks: usize,
    /// Bytes reserved from the provider per page.
    pub region_size: usize,
}

/// Occupancy of the coalescing allocator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoalesceStats {
    pub allocs: usize,
    pub frees: usize,
    pub buffers: usize,
    pub busy_blocks: usize,
    pub free_blocks: usize,
    pub buffer_size: usize,
    /// Bytes reserved from the provider per buffer.
    pub region_size: usize,
}

/// Whole-dispatcher statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub allocs: usize,
    pub frees: usize,
    pub fixed: [FixedSizeStats; crate::SizeClass::COUNT],
    pub coalesce: CoalesceStats,
    pub os_blocks: usize,
    pub os_bytes: usize,
}

impl MemoryStats {
    /// Total bytes currently reserved from the provider.
    pub fn reserved_bytes(&self) -> usize {
        let fixed: usize = self.fixed.iter().map(|s| s.pages * s.region_size).sum();
        fixed + self.coalesce.buffers * self.coalesce.region_size + self.os_bytes
    }
}

/// Stats reporter
pub struct StatsReporter;

impl StatsReporter {
    #[allow(unused_variables)]
    pub fn report_memory(stats: &MemoryStats) {
        info!("memory allocator:");
        info!("  allocs: {} frees: {}", stats.allocs, stats.frees);
        info!(
            "  reserved: {} KB ({} os blocks, {} bytes)",
            stats.reserved_bytes() / 1024,
            stats.os_blocks,
            stats.os_bytes
        );
    }

    #[allow(unused_variables)]
    pub fn report_fixed(stats: &FixedSizeStats) {
        info!("  fixed-size {}:", stats.block_size);
        info!("    allocs: {} frees: {}", stats.allocs, stats.frees);
        info!(
            "    pages: {} busy blocks: {} free blocks: {}",
            stats.pages, stats.busy_blocks, stats.free_blocks
        );
    }

    #[allow(unused_variables)]
    pub fn report_coalesce(stats: &CoalesceStats) {
        info!("  coalesce:");
        info!("    allocs: {} frees: {}", stats.allocs, stats.frees);
        info!(
            "    buffers: {} busy blocks: {} free blocks: {}",
            stats.buffers, stats.busy_blocks, stats.free_blocks
        );
    }

    #[allow(unused_variables)]
    pub fn report_region(index: usize, addr: usize, size: usize) {
        info!("      region {} addr {:#x} size {}", index, addr, size);
    }
}

//! Kernel sizing configuration
//!
//! Consumed once at `Kernel::new`. The split between the kernel and user
//! pools is fixed at boot; the user pool backs frames for user pages and
//! the kernel pool backs thread stacks and file-descriptor tables.

/// Boot-time sizing knobs.
#[derive(Debug, Clone, Copy)]
pub struct KernelConfig {
    /// Pages available for thread stacks and kernel tables.
    pub kernel_pool_pages: usize,
    /// Pages available as user frames; exhaustion triggers eviction.
    pub user_pool_pages: usize,
    /// Sectors on the swap device.
    pub swap_sectors: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            kernel_pool_pages: 64,
            user_pool_pages: 64,
            swap_sectors: 1024,
        }
    }
}

impl KernelConfig {
    /// A deliberately tiny machine, handy for forcing eviction.
    pub fn tiny(user_pool_pages: usize, swap_sectors: u64) -> Self {
        Self {
            kernel_pool_pages: 16,
            user_pool_pages,
            swap_sectors,
        }
    }
}

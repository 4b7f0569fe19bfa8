//! Ferrite - a teaching kernel core in Rust
//!
//! The preemptive priority scheduler with priority donation, the
//! timed-sleep service, the synchronization primitives that expose
//! donation, and the virtual-memory page subsystem with anonymous swap
//! and file-backed mappings. Hardware sits behind narrow seams (context
//! switch, MMU, block device, files) with software doubles, so the whole
//! core runs and tests hosted.

#![no_std]
// Kernel types often have specialized initialization that does not fit
// Default, and ceiling division is spelled out where it mirrors sector
// arithmetic.
#![allow(clippy::new_without_default)]
#![allow(clippy::manual_div_ceil)]

extern crate alloc;

pub mod block;
pub mod config;
pub mod error;
pub mod fs;
pub mod kern;
pub mod mmu;
pub mod palloc;
pub mod types;
pub mod vm;

pub use config::KernelConfig;
pub use error::{KernError, Result};

use alloc::boxed::Box;
use alloc::sync::Arc;
use spin::Once;

use crate::block::{BlockDevice, RamDisk};
use crate::kern::sched::{Launch, Scheduler, SoftSwitch};
use crate::kern::timer::Timer;
use crate::palloc::PagePool;
use crate::vm::{AddressSpace, Vm};

/// Kernel version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Kernel name
pub const NAME: &str = "Ferrite";

// ============================================================================
// Kernel Root
// ============================================================================

/// The whole machine: executive, timer, and page subsystem.
pub struct Kernel {
    pub sched: Scheduler,
    pub timer: Timer,
    pub vm: Arc<Vm>,
    kernel_pool: Arc<PagePool>,
}

impl Kernel {
    /// Bring the kernel up with a RAM-backed swap device.
    pub fn new(config: KernelConfig) -> Kernel {
        Self::with_swap_device(config, Box::new(RamDisk::new(config.swap_sectors)))
    }

    /// Bring the kernel up over a caller-provided swap device.
    pub fn with_swap_device(config: KernelConfig, swap_dev: Box<dyn BlockDevice>) -> Kernel {
        Self::with_launcher(config, swap_dev, Box::new(SoftSwitch))
    }

    /// Full wiring: swap device and context-switch implementation.
    pub fn with_launcher(
        config: KernelConfig,
        swap_dev: Box<dyn BlockDevice>,
        launcher: Box<dyn Launch>,
    ) -> Kernel {
        let kernel_pool = PagePool::new("kernel", config.kernel_pool_pages);
        let user_pool = PagePool::new("user", config.user_pool_pages);
        let vm = Vm::new(user_pool, swap_dev);
        let sched = Scheduler::new(kernel_pool.clone(), launcher);
        sched.attach_vm(vm.clone());
        Kernel {
            sched,
            timer: Timer::new(),
            vm,
            kernel_pool,
        }
    }

    /// Start preemptive scheduling.
    pub fn start(&self) {
        self.sched.start();
        log::info!("{} {} up", NAME, VERSION);
    }

    /// One timer interrupt: the tick pipeline plus any latched yield.
    pub fn timer_interrupt(&self) {
        self.timer.interrupt(&self.sched);
    }

    /// Sleep the running thread for `ticks` timer ticks.
    pub fn sleep(&self, ticks: i64) {
        self.timer.sleep(ticks, &self.sched);
    }

    /// A fresh address space over this kernel's page subsystem.
    pub fn new_space(&self) -> Arc<AddressSpace> {
        AddressSpace::new(self.vm.clone())
    }

    pub fn kernel_pool(&self) -> &Arc<PagePool> {
        &self.kernel_pool
    }
}

// ============================================================================
// Global State
// ============================================================================

static KERNEL: Once<Kernel> = Once::new();

/// Initialize the global kernel once; later calls return the first one.
pub fn init(config: KernelConfig) -> &'static Kernel {
    KERNEL.call_once(|| {
        let k = Kernel::new(config);
        k.start();
        k
    })
}

/// The global kernel.
pub fn kernel() -> &'static Kernel {
    KERNEL.get().expect("kernel not initialized")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_bring_up() {
        let k = Kernel::new(KernelConfig::default());
        k.start();
        assert_eq!(k.sched.current().name(), "main");
        assert_eq!(k.timer.ticks(), 0);
        assert_eq!(k.vm.stats().frames_in_use, 0);
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_switch_activates_address_space() {
        let k = Kernel::new(KernelConfig::default());
        k.start();

        // The new thread outranks us and is current when create returns;
        // it had no space at that switch.
        let tid = k.sched.create("user", 50, || {}).unwrap();
        assert_eq!(k.sched.current_tid(), tid);
        assert!(k.vm.active().is_none());

        let space = k.new_space();
        k.sched.current().set_space(Some(space.clone()));

        // The next pass through the scheduler activates it.
        k.sched.yield_now();
        assert_eq!(k.sched.current_tid(), tid);
        assert!(Arc::ptr_eq(&k.vm.active().unwrap(), &space));

        // Exit drops back to the bootstrap thread, which is kernel-only.
        k.sched.exit();
        assert!(k.vm.active().is_none());
    }
}

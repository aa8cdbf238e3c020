//! Kernel Startup - Boot orchestration
//!
//! Initializes the memory subsystems in the order they depend on each
//! other:
//!
//! 1. Boot arguments parsed, zone layer bootstrapped
//! 2. Guard engine configured and its reserve stolen (pre-VM)
//! 3. Kernel map created
//! 4. Guard engine's VA arena created inside the kernel map
//!
//! The guard engine treats everything before step 4 as "VM not ready":
//! allocations come from the reserve and frees leak by design.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::boot::BootArgs;
use crate::kern::{gzalloc, zalloc};
use crate::vm::vm_map;

// ============================================================================
// Startup Phases
// ============================================================================

/// Kernel startup state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum StartupPhase {
    /// Not yet started
    NotStarted = 0,
    /// Early console/panic init
    EarlyInit = 1,
    /// Physical memory and pre-VM pools ready
    VmBootstrap = 2,
    /// Kernel map and submaps ready
    VmInit = 3,
    /// Fully running
    Running = 4,
}

impl StartupPhase {
    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => Self::EarlyInit,
            2 => Self::VmBootstrap,
            3 => Self::VmInit,
            4 => Self::Running,
            _ => Self::NotStarted,
        }
    }
}

/// Global startup phase
static STARTUP_PHASE: AtomicU32 = AtomicU32::new(0);

/// Get the current startup phase
pub fn startup_phase() -> StartupPhase {
    StartupPhase::from_u32(STARTUP_PHASE.load(Ordering::Acquire))
}

/// Advance the startup phase
pub fn set_startup_phase(phase: StartupPhase) {
    STARTUP_PHASE.store(phase as u32, Ordering::Release);
}

/// Has the VM subsystem come up?
pub fn vm_ready() -> bool {
    startup_phase() >= StartupPhase::VmInit
}

// ============================================================================
// Bootstrap Sequence
// ============================================================================

/// Nominal size of the zone submap; the guard arena is scaled from it.
pub const ZONE_MAP_SIZE: usize = 32 * 1024 * 1024;

/// Bring the memory subsystems up in dependency order.
pub fn kernel_bootstrap(cmdline: &str) {
    set_startup_phase(StartupPhase::EarlyInit);

    let args = BootArgs::parse(cmdline);
    zalloc::zone_bootstrap();
    gzalloc::gzalloc_bootstrap(&args);
    set_startup_phase(StartupPhase::VmBootstrap);

    vm_map::kernel_map_init();
    set_startup_phase(StartupPhase::VmInit);

    if let Some(kmap) = vm_map::kernel_map() {
        gzalloc::gzalloc_init(&kmap, ZONE_MAP_SIZE);
    }
    set_startup_phase(StartupPhase::Running);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_roundtrip() {
        assert_eq!(StartupPhase::from_u32(3), StartupPhase::VmInit);
        assert_eq!(StartupPhase::from_u32(99), StartupPhase::NotStarted);
        assert!(StartupPhase::Running > StartupPhase::VmBootstrap);
    }
}

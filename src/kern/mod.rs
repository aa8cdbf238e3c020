//! Kern subsystem - Core kernel services
//!
//! The zone allocator, its guard-mode engine, and the small kernel
//! services they lean on: counters, preemption state, and the startup
//! sequence.

pub mod counters;
pub mod gzalloc;
pub mod sched_prim;
pub mod startup;
pub mod zalloc;

pub use counters::Counter;
pub use gzalloc::{
    gzalloc_bootstrap, gzalloc_element_size, gzalloc_empty_free_cache, gzalloc_enabled,
    gzalloc_init, gzalloc_stats, GuardAllocator, GuardConfig, GuardLookup, GuardStats,
};
pub use sched_prim::{disable_preemption, enable_preemption, preemption_level};
pub use startup::{kernel_bootstrap, startup_phase, vm_ready, StartupPhase};
pub use zalloc::{
    zalloc, zcram, zdestroy, zfree, zinit, zone_find, AllocFlags, Zone, ZoneFlags, ZoneId,
};

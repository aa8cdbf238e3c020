//! Virtual Memory Subsystem
//!
//! The slice of the VM layer the guard allocator builds on:
//! - vm_page: page constants and alignment arithmetic
//! - vm_map: address-range bookkeeping with per-entry protection
//! - vm_kern: wired kernel memory, guard-page mapping
//! - pmap: pre-VM physical memory stealing

pub mod pmap;
pub mod vm_kern;
pub mod vm_map;
pub mod vm_page;

pub use pmap::{pmap_steal_memory, pmap_stolen_bytes};
pub use vm_kern::{kernel_memory_allocate, kmem_free, kmem_suballoc, KmaFlags};
pub use vm_map::{kernel_map, kernel_map_init, EntryFlags, MapError, VmMap, VmMapEntry, VmMapId, VmProt};
pub use vm_page::{page_aligned, round_page, trunc_page, PAGE_SIZE, PAGE_SHIFT};

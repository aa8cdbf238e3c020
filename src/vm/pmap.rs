//! Pmap Bootstrap - Physical memory stealing
//!
//! Before the VM map exists, subsystems that need wired memory steal it
//! from the physical layer. Stolen memory is page aligned, zero filled,
//! and never returned.

use alloc::alloc::alloc_zeroed;
use core::alloc::Layout;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::vm::vm_page::{round_page, PAGE_SIZE};

static STOLEN_BYTES: AtomicUsize = AtomicUsize::new(0);

/// Steal `size` bytes of physical memory from the bootstrap pool.
///
/// Panics when the request cannot be satisfied; boot cannot proceed
/// without it.
pub fn pmap_steal_memory(size: usize) -> usize {
    let rounded = round_page(size);
    let layout = match Layout::from_size_align(rounded, PAGE_SIZE) {
        Ok(l) => l,
        Err(_) => panic!("pmap_steal_memory: bad request of {} bytes", size),
    };

    let mem = unsafe { alloc_zeroed(layout) };
    if mem.is_null() {
        panic!("pmap_steal_memory: cannot steal {} bytes", rounded);
    }

    STOLEN_BYTES.fetch_add(rounded, Ordering::Relaxed);
    mem as usize
}

/// Total bytes stolen so far
pub fn pmap_stolen_bytes() -> usize {
    STOLEN_BYTES.load(Ordering::Relaxed)
}

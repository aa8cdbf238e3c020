//! VM Kernel - Wired kernel memory with guard pages
//!
//! Kernel memory allocation routines for wired, non-pageable memory.
//! Backing store comes from the global allocator, page aligned; maps
//! record the ranges. A guarded allocation maps one extra no-access page
//! at the chosen end of the range.

use alloc::alloc::{alloc_zeroed, dealloc};
use alloc::sync::Arc;
use core::alloc::Layout;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::vm::vm_map::{EntryFlags, MapError, VmMap, VmMapId, VmProt};
use crate::vm::vm_page::PAGE_SIZE;

// ============================================================================
// Allocation Flags
// ============================================================================

/// Kernel memory allocation flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KmaFlags(u32);

impl KmaFlags {
    /// Zero-fill the data portion
    pub const ZERO: Self = Self(0x01);
    /// Panic instead of failing
    pub const NOFAIL: Self = Self(0x02);
    /// Range backs a kernel object
    pub const KOBJECT: Self = Self(0x04);
    /// Map a no-access guard page at the start of the range
    pub const GUARD_FIRST: Self = Self(0x08);
    /// Map a no-access guard page at the end of the range
    pub const GUARD_LAST: Self = Self(0x10);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl core::ops::BitOr for KmaFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

// ============================================================================
// Submap Creation
// ============================================================================

static NEXT_MAP_ID: AtomicU64 = AtomicU64::new(100);

/// Create a submap of `size` bytes inside a parent map
pub fn kmem_suballoc(parent: &Arc<VmMap>, size: usize) -> Arc<VmMap> {
    let _ = parent;
    let id = VmMapId(NEXT_MAP_ID.fetch_add(1, Ordering::Relaxed));
    Arc::new(VmMap::new(id, size))
}

// ============================================================================
// Kernel Memory Allocation
// ============================================================================

/// Allocate `size` bytes of wired kernel memory in a map.
///
/// With GUARD_FIRST or GUARD_LAST, one additional no-access page is
/// mapped at the corresponding end of the range and the data portion is
/// entered as a single atomic entry carrying `tag`. Returns the base of
/// the whole range, guard page included.
pub fn kernel_memory_allocate(
    map: &Arc<VmMap>,
    size: usize,
    flags: KmaFlags,
    tag: usize,
) -> Result<usize, MapError> {
    let guard_first = flags.contains(KmaFlags::GUARD_FIRST);
    let guard_last = flags.contains(KmaFlags::GUARD_LAST);
    let guard_bytes = if guard_first || guard_last { PAGE_SIZE } else { 0 };
    let total = size + guard_bytes;

    if size == 0 || size % PAGE_SIZE != 0 {
        return Err(MapError::InvalidRange);
    }

    let layout = match Layout::from_size_align(total, PAGE_SIZE) {
        Ok(l) => l,
        Err(_) => return Err(MapError::InvalidRange),
    };

    let mem = unsafe { alloc_zeroed(layout) };
    if mem.is_null() {
        if flags.contains(KmaFlags::NOFAIL) {
            panic!("kernel_memory_allocate: out of memory allocating {} bytes", total);
        }
        return Err(MapError::ResourceShortage);
    }
    let base = mem as usize;

    let (data_start, data_end, guard_start, guard_end) = if guard_first {
        (base + PAGE_SIZE, base + total, base, base + PAGE_SIZE)
    } else if guard_last {
        (base, base + size, base + size, base + total)
    } else {
        (base, base + total, 0, 0)
    };

    let mut entry_flags = EntryFlags::ATOMIC;
    if flags.contains(KmaFlags::KOBJECT) {
        entry_flags = entry_flags | EntryFlags::KOBJECT;
    }

    let entered = map
        .enter(data_start, data_end, VmProt::ReadWrite, entry_flags, tag)
        .and_then(|()| {
            if guard_bytes != 0 {
                map.enter(guard_start, guard_end, VmProt::None, EntryFlags::GUARD, 0)
            } else {
                Ok(())
            }
        });

    if let Err(e) = entered {
        // Roll the data entry back if only the guard entry failed
        let _ = map.remove(data_start, data_end);
        unsafe { dealloc(mem, layout) };
        if flags.contains(KmaFlags::NOFAIL) {
            panic!(
                "kernel_memory_allocate: map {} cannot hold {} bytes: {:?}",
                map.id.0, total, e
            );
        }
        return Err(e);
    }

    Ok(base)
}

/// Free a kernel memory range, guard page included.
///
/// `size` must cover the exact range returned by a prior allocation.
pub fn kmem_free(map: &Arc<VmMap>, addr: usize, size: usize) -> Result<usize, MapError> {
    let layout = match Layout::from_size_align(size, PAGE_SIZE) {
        Ok(l) => l,
        Err(_) => return Err(MapError::InvalidRange),
    };

    let removed = map.remove(addr, addr + size)?;
    if removed != size {
        return Err(MapError::InvalidRange);
    }

    unsafe { dealloc(addr as *mut u8, layout) };
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::vm_map::kernel_map;

    fn parent() -> Arc<VmMap> {
        Arc::new(VmMap::kernel(VmMapId(90)))
    }

    #[test]
    fn test_suballoc_capacity() {
        let sub = kmem_suballoc(&parent(), 4 * PAGE_SIZE);
        assert_eq!(sub.capacity(), 4 * PAGE_SIZE);
        assert_eq!(sub.total_size(), 0);
    }

    #[test]
    fn test_guard_last_layout() {
        let map = kmem_suballoc(&parent(), 64 * PAGE_SIZE);
        let base = kernel_memory_allocate(
            &map,
            2 * PAGE_SIZE,
            KmaFlags::GUARD_LAST | KmaFlags::ZERO,
            24,
        )
        .expect("allocate failed");

        let data = map.lookup_entry(base).expect("data entry missing");
        assert_eq!(data.start, base);
        assert_eq!(data.end, base + 2 * PAGE_SIZE);
        assert_eq!(data.tag, 24);
        assert!(data.flags.contains(EntryFlags::ATOMIC));
        assert!(data.protection.can_write());

        let guard = map.lookup_entry(base + 2 * PAGE_SIZE).expect("guard entry missing");
        assert_eq!(guard.end, base + 3 * PAGE_SIZE);
        assert!(guard.flags.contains(EntryFlags::GUARD));
        assert!(!guard.protection.can_read());

        // Data portion is zero filled
        let first = unsafe { core::ptr::read(base as *const u8) };
        assert_eq!(first, 0);

        kmem_free(&map, base, 3 * PAGE_SIZE).expect("free failed");
        assert_eq!(map.total_size(), 0);
    }

    #[test]
    fn test_guard_first_layout() {
        let map = kmem_suballoc(&parent(), 64 * PAGE_SIZE);
        let base =
            kernel_memory_allocate(&map, PAGE_SIZE, KmaFlags::GUARD_FIRST | KmaFlags::ZERO, 0)
                .expect("allocate failed");

        let guard = map.lookup_entry(base).expect("guard entry missing");
        assert!(guard.flags.contains(EntryFlags::GUARD));
        assert_eq!(guard.end, base + PAGE_SIZE);

        let data = map.lookup_entry(base + PAGE_SIZE).expect("data entry missing");
        assert_eq!(data.end, base + 2 * PAGE_SIZE);

        kmem_free(&map, base, 2 * PAGE_SIZE).expect("free failed");
    }

    #[test]
    fn test_capacity_exhaustion() {
        let map = kmem_suballoc(&parent(), 2 * PAGE_SIZE);
        assert_eq!(
            kernel_memory_allocate(&map, 2 * PAGE_SIZE, KmaFlags::GUARD_LAST, 0),
            Err(MapError::NoSpace)
        );
    }

    #[test]
    fn test_rejects_unaligned_size() {
        let map = kmem_suballoc(&parent(), 16 * PAGE_SIZE);
        assert_eq!(
            kernel_memory_allocate(&map, 100, KmaFlags::empty(), 0),
            Err(MapError::InvalidRange)
        );
    }

    #[test]
    fn test_kernel_map_absent_until_init() {
        // The global kernel map is created by startup; nothing here
        // depends on it existing.
        let _ = kernel_map();
    }
}

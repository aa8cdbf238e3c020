//! Zone-based Memory Allocator
//!
//! A zone is a collection of fixed-size data blocks for which quick
//! allocation and deallocation is possible. Kernel routines create a
//! zone per data type and draw elements from it through a freelist.
//!
//! Zones the guard engine tracks bypass the freelist entirely: every
//! element is routed through the guard engine, which places it on its
//! own page run with a guard page and revalidates it at free time. The
//! engine owns the zone's guard extension (the free-VA ring) and keeps
//! the zone's usage counters honest while doing so.

use alloc::alloc::alloc_zeroed;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::alloc::Layout;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::Mutex;

use crate::kern::gzalloc;
use crate::vm::vm_page::PAGE_SIZE;

// ============================================================================
// Zone Flags
// ============================================================================

/// Zone behavior flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ZoneFlags(pub u32);

impl ZoneFlags {
    /// Allocation from this zone is allowed to fail
    pub const EXHAUSTIBLE: Self = Self(0x0001);
    /// Zone never expands after initial allocation
    pub const PERMANENT: Self = Self(0x0002);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl core::ops::BitOr for ZoneFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

// ============================================================================
// Allocation Flags
// ============================================================================

/// Per-call allocation flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocFlags(pub u32);

impl AllocFlags {
    pub const NONE: Self = Self(0);
    /// Fail rather than block
    pub const NOWAIT: Self = Self(0x0001);

    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl core::ops::BitOr for AllocFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

// ============================================================================
// Zone Statistics
// ============================================================================

/// Zone statistics for debugging and monitoring
#[derive(Debug, Default)]
pub struct ZoneStats {
    /// Total allocations from this zone
    pub alloc_count: AtomicU64,
    /// Total deallocations to this zone
    pub free_count: AtomicU64,
    /// Bytes handed out, page rounding included for guarded zones
    pub mem_allocated: AtomicU64,
    /// Bytes returned
    pub mem_freed: AtomicU64,
    /// Times the zone had to expand
    pub expansions: AtomicU64,
    /// Failed allocation attempts
    pub failures: AtomicU64,
}

impl ZoneStats {
    pub fn new() -> Self {
        Self::default()
    }
}

// ============================================================================
// Zone
// ============================================================================

/// Zone identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ZoneId(pub u32);

/// Guard extension: the free-VA ring the guard engine parks freed
/// ranges in. Populated only on tracked zones, by the engine's
/// `zone_init` hook. Slot value zero means empty.
#[derive(Debug)]
pub struct GuardExt {
    pub ring: Vec<usize>,
    pub index: usize,
}

/// Mutable zone state, all under the zone lock
#[derive(Debug)]
pub(crate) struct ZoneInner {
    /// Head of the freelist (0 = empty)
    pub free_head: usize,
    /// Elements currently free (signed: guarded zones go negative while
    /// elements are live, since nothing is ever crammed)
    pub elems_free: i64,
    /// Elements currently wired to callers
    pub wired_cur: i64,
    /// Live VA ranges owned by this zone
    pub va_cur: i64,
    /// Bytes of backing memory
    pub cur_size: usize,
    /// Backing memory chunks
    pub pages: Vec<ZonePage>,
    /// Guard extension, present iff the zone is tracked
    pub guard: Option<GuardExt>,
}

/// A chunk of memory backing a zone's freelist
#[derive(Debug)]
pub(crate) struct ZonePage {
    pub base: usize,
    pub size: usize,
}

/// A zone is a collection of fixed-size blocks
#[derive(Debug)]
pub struct Zone {
    /// Zone identifier
    pub id: ZoneId,

    /// Zone name (for debugging)
    pub name: String,

    /// Size of each element
    pub elem_size: usize,

    /// Allocation granularity (how much to expand by)
    pub alloc_size: usize,

    /// Maximum memory this zone can use
    pub max_size: usize,

    /// Zone behavior flags
    pub flags: ZoneFlags,

    /// Mutable state under the zone lock
    pub(crate) inner: Mutex<ZoneInner>,

    /// Zone statistics
    pub stats: ZoneStats,

    /// Routed through the guard engine?
    guarded: AtomicBool,
}

impl Zone {
    /// Create a new zone
    ///
    /// # Arguments
    /// * `id` - Zone identifier
    /// * `name` - Zone name for debugging
    /// * `elem_size` - Size of each element (aligned up to 8 bytes)
    /// * `max_size` - Maximum memory this zone can use
    /// * `alloc_size` - How much memory to allocate when expanding
    /// * `flags` - Zone behavior flags
    pub fn new(
        id: ZoneId,
        name: &str,
        elem_size: usize,
        max_size: usize,
        alloc_size: usize,
        flags: ZoneFlags,
    ) -> Self {
        // Elements must hold a freelist pointer and keep their true size
        // class; align up rather than rounding to a power of two.
        let elem_size = (elem_size.max(core::mem::size_of::<usize>()) + 7) & !7;

        let alloc_size = if alloc_size == 0 { PAGE_SIZE } else { alloc_size };

        Self {
            id,
            name: String::from(name),
            elem_size,
            alloc_size,
            max_size,
            flags,
            inner: Mutex::new(ZoneInner {
                free_head: 0,
                elems_free: 0,
                wired_cur: 0,
                va_cur: 0,
                cur_size: 0,
                pages: Vec::new(),
                guard: None,
            }),
            stats: ZoneStats::new(),
            guarded: AtomicBool::new(false),
        }
    }

    /// Zone name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Is this zone routed through the guard engine?
    pub fn is_guarded(&self) -> bool {
        self.guarded.load(Ordering::Relaxed)
    }

    pub(crate) fn set_guarded(&self) {
        self.guarded.store(true, Ordering::Relaxed);
    }

    /// Snapshot of (elems_free, wired_cur, va_cur)
    pub fn usage(&self) -> (i64, i64, i64) {
        let inner = self.inner.lock();
        (inner.elems_free, inner.wired_cur, inner.va_cur)
    }

    /// Allocate an element from the zone
    pub fn alloc(&self) -> Option<NonNull<u8>> {
        self.alloc_flags(AllocFlags::NONE)
    }

    /// Allocate an element with per-call flags
    pub fn alloc_flags(&self, flags: AllocFlags) -> Option<NonNull<u8>> {
        if self.is_guarded() {
            return gzalloc::gzalloc_alloc(self, flags);
        }

        // Fast path: take the freelist head
        {
            let mut inner = self.inner.lock();
            if inner.free_head != 0 {
                let element = inner.free_head;
                let next = unsafe { *(element as *const usize) };
                inner.free_head = next;
                inner.elems_free -= 1;
                inner.wired_cur += 1;
                drop(inner);

                self.stats.alloc_count.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .mem_allocated
                    .fetch_add(self.elem_size as u64, Ordering::Relaxed);
                return NonNull::new(element as *mut u8);
            }
        }

        // Slow path: expand the zone
        self.expand_and_alloc(flags)
    }

    /// Free an element back to the zone
    ///
    /// # Safety
    /// The element must have been allocated from this zone.
    pub unsafe fn free(&self, element: NonNull<u8>) {
        if self.is_guarded() {
            gzalloc::gzalloc_free(self, element);
            return;
        }

        let elem_ptr = element.as_ptr() as usize;

        let mut inner = self.inner.lock();
        let elem = elem_ptr as *mut usize;
        *elem = inner.free_head;
        inner.free_head = elem_ptr;
        inner.elems_free += 1;
        inner.wired_cur -= 1;
        drop(inner);

        self.stats.free_count.fetch_add(1, Ordering::Relaxed);
        self.stats
            .mem_freed
            .fetch_add(self.elem_size as u64, Ordering::Relaxed);
    }

    /// Expand the zone and allocate an element
    fn expand_and_alloc(&self, _flags: AllocFlags) -> Option<NonNull<u8>> {
        let mut inner = self.inner.lock();

        // Another thread may have expanded while we waited for the lock
        if inner.free_head == 0 {
            if inner.cur_size >= self.max_size || self.flags.contains(ZoneFlags::PERMANENT) {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                if !self.flags.contains(ZoneFlags::EXHAUSTIBLE) {
                    log::warn!("zalloc: zone {} exhausted", self.name);
                }
                return None;
            }

            let grow = self.alloc_size.min(self.max_size - inner.cur_size);
            let layout = Layout::from_size_align(grow, PAGE_SIZE).ok()?;
            let mem = unsafe { alloc_zeroed(layout) };
            if mem.is_null() {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                return None;
            }

            let base = mem as usize;
            inner.pages.push(ZonePage { base, size: grow });
            inner.cur_size += grow;
            inner.va_cur += 1;
            Self::cram_locked(&mut inner, base, grow, self.elem_size);
            self.stats.expansions.fetch_add(1, Ordering::Relaxed);
        }

        if inner.free_head == 0 {
            return None;
        }
        let element = inner.free_head;
        let next = unsafe { *(element as *const usize) };
        inner.free_head = next;
        inner.elems_free -= 1;
        inner.wired_cur += 1;
        drop(inner);

        self.stats.alloc_count.fetch_add(1, Ordering::Relaxed);
        self.stats
            .mem_allocated
            .fetch_add(self.elem_size as u64, Ordering::Relaxed);
        NonNull::new(element as *mut u8)
    }

    /// Add a memory chunk to the zone's freelist
    pub fn zcram(&self, base: usize, size: usize) {
        let mut inner = self.inner.lock();
        inner.cur_size += size;
        Self::cram_locked(&mut inner, base, size, self.elem_size);
    }

    fn cram_locked(inner: &mut ZoneInner, base: usize, size: usize, elem_size: usize) {
        let num_elements = size / elem_size;

        for i in 0..num_elements {
            let elem_addr = base + (i * elem_size);
            let elem = elem_addr as *mut usize;
            unsafe {
                *elem = inner.free_head;
            }
            inner.free_head = elem_addr;
        }
        inner.elems_free += num_elements as i64;
    }
}

// ============================================================================
// Zone Manager
// ============================================================================

/// Global zone manager
pub struct ZoneManager {
    /// All zones
    zones: BTreeMap<ZoneId, Arc<Zone>>,

    /// Zones by name
    by_name: BTreeMap<String, ZoneId>,

    /// Next zone ID
    next_id: u32,
}

impl ZoneManager {
    pub fn new() -> Self {
        Self {
            zones: BTreeMap::new(),
            by_name: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Create and register a new zone
    pub fn zinit(
        &mut self,
        name: &str,
        elem_size: usize,
        max_size: usize,
        alloc_size: usize,
        flags: ZoneFlags,
    ) -> Arc<Zone> {
        let id = ZoneId(self.next_id);
        self.next_id += 1;

        let zone = Arc::new(Zone::new(id, name, elem_size, max_size, alloc_size, flags));

        self.zones.insert(id, Arc::clone(&zone));
        self.by_name.insert(String::from(name), id);

        zone
    }

    /// Find zone by ID
    pub fn find(&self, id: ZoneId) -> Option<Arc<Zone>> {
        self.zones.get(&id).cloned()
    }

    /// Find zone by name
    pub fn find_by_name(&self, name: &str) -> Option<Arc<Zone>> {
        let id = self.by_name.get(name)?;
        self.zones.get(id).cloned()
    }

    /// Drop a zone from the registry
    pub fn remove(&mut self, id: ZoneId) -> Option<Arc<Zone>> {
        let zone = self.zones.remove(&id)?;
        self.by_name.remove(zone.name());
        Some(zone)
    }
}

impl Default for ZoneManager {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Global State
// ============================================================================

static ZONE_MANAGER: spin::Once<Mutex<ZoneManager>> = spin::Once::new();

fn zone_manager() -> &'static Mutex<ZoneManager> {
    ZONE_MANAGER.call_once(|| Mutex::new(ZoneManager::new()));
    ZONE_MANAGER.get().unwrap()
}

/// Initialize the zone allocator
pub fn zone_bootstrap() {
    let _ = zone_manager();
}

/// Create a new zone and run the guard engine's per-zone hook
pub fn zinit(
    name: &str,
    elem_size: usize,
    max_size: usize,
    alloc_size: usize,
    flags: ZoneFlags,
) -> Arc<Zone> {
    let zone = zone_manager()
        .lock()
        .zinit(name, elem_size, max_size, alloc_size, flags);
    gzalloc::gzalloc_zone_init(&zone);
    zone
}

/// Allocate from a zone
pub fn zalloc(zone: &Zone) -> Option<NonNull<u8>> {
    zone.alloc()
}

/// Allocate from a zone with flags
pub fn zalloc_flags(zone: &Zone, flags: AllocFlags) -> Option<NonNull<u8>> {
    zone.alloc_flags(flags)
}

/// Free to a zone
///
/// # Safety
/// Element must have been allocated from the given zone.
pub unsafe fn zfree(zone: &Zone, element: NonNull<u8>) {
    zone.free(element);
}

/// Add memory to a zone
pub fn zcram(zone: &Zone, base: usize, size: usize) {
    zone.zcram(base, size);
}

/// Get zone by name
pub fn zone_find(name: &str) -> Option<Arc<Zone>> {
    zone_manager().lock().find_by_name(name)
}

/// Get zone by ID
pub fn zone_find_by_id(id: ZoneId) -> Option<Arc<Zone>> {
    zone_manager().lock().find(id)
}

/// Tear a zone down: drain its guard cache and drop it from the registry
pub fn zdestroy(zone: &Arc<Zone>) {
    gzalloc::gzalloc_empty_free_cache(zone);
    zone_manager().lock().remove(zone.id);
}

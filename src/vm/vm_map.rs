//! VM Map - Kernel address-range bookkeeping
//!
//! A map records the page ranges handed out within a region of the
//! kernel address space as ordered entries, each with its own protection
//! and flags. The guard allocator's arena is a submap of the kernel map;
//! every guarded allocation is covered by one data entry plus one
//! no-access guard entry.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use spin::Mutex;

// ============================================================================
// VM Map Types
// ============================================================================

/// VM Map ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmMapId(pub u64);

impl VmMapId {
    pub const NULL: Self = Self(0);
}

/// Access protection on a mapped range.
///
/// A guarded range only ever moves between three states: read-write
/// while live, read-only while parked under write protection, and no
/// access for guard pages or ranges parked unmapped. Ordered weakest to
/// strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VmProt {
    /// Any access faults
    None,
    /// Loads succeed, stores fault
    Read,
    /// Full access
    ReadWrite,
}

impl VmProt {
    pub fn can_read(self) -> bool {
        self != Self::None
    }

    pub fn can_write(self) -> bool {
        self == Self::ReadWrite
    }

    /// May a range capped at `self` be reprotected to `requested`?
    pub fn admits(self, requested: VmProt) -> bool {
        requested <= self
    }
}

impl Default for VmProt {
    fn default() -> Self {
        Self::ReadWrite
    }
}

// ============================================================================
// VM Map Entry Flags
// ============================================================================

/// Map entry flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryFlags(u32);

impl EntryFlags {
    /// Entry must be treated as a whole; never split or partially removed
    pub const ATOMIC: Self = Self(0x0001);
    /// Entry is an unreadable, unwritable guard page
    pub const GUARD: Self = Self(0x0002);
    /// Entry backs a kernel object
    pub const KOBJECT: Self = Self(0x0004);

    /// Empty flags
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl core::ops::BitOr for EntryFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl Default for EntryFlags {
    fn default() -> Self {
        Self::empty()
    }
}

// ============================================================================
// VM Map Entry
// ============================================================================

/// A single mapping in the address space
#[derive(Debug, Clone)]
pub struct VmMapEntry {
    /// Start address of this entry
    pub start: usize,

    /// End address of this entry
    pub end: usize,

    /// Protection (current)
    pub protection: VmProt,

    /// Maximum protection
    pub max_protection: VmProt,

    /// Entry flags
    pub flags: EntryFlags,

    /// Free-use word for the subsystem owning the mapping
    pub tag: usize,
}

impl VmMapEntry {
    pub fn new(start: usize, end: usize, protection: VmProt, flags: EntryFlags) -> Self {
        Self {
            start,
            end,
            protection,
            max_protection: VmProt::ReadWrite,
            flags,
            tag: 0,
        }
    }

    /// Get entry size
    pub fn size(&self) -> usize {
        self.end - self.start
    }

    /// Check if address is in this entry
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Check if this entry overlaps with a range
    pub fn overlaps(&self, start: usize, end: usize) -> bool {
        self.start < end && start < self.end
    }
}

// ============================================================================
// Map Errors
// ============================================================================

/// VM Map operation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// Invalid address range
    InvalidRange,
    /// No space available
    NoSpace,
    /// Entry not found
    NotFound,
    /// Protection failure
    ProtectionFailure,
    /// Resource shortage
    ResourceShortage,
}

// ============================================================================
// VM Map
// ============================================================================

/// A region of kernel address space and the entries mapped within it
#[derive(Debug)]
pub struct VmMap {
    /// Map ID
    pub id: VmMapId,

    /// Map entries (ordered by start address)
    entries: Mutex<BTreeMap<usize, VmMapEntry>>,

    /// Total bytes this map may hold
    capacity: usize,

    /// Currently mapped bytes
    size: AtomicUsize,

    /// Number of entries
    entry_count: AtomicUsize,

    /// Timestamp for versioning
    timestamp: AtomicU64,
}

impl VmMap {
    /// Create a new map with a byte capacity
    pub fn new(id: VmMapId, capacity: usize) -> Self {
        Self {
            id,
            entries: Mutex::new(BTreeMap::new()),
            capacity,
            size: AtomicUsize::new(0),
            entry_count: AtomicUsize::new(0),
            timestamp: AtomicU64::new(0),
        }
    }

    /// Create the kernel map (effectively unbounded)
    pub fn kernel(id: VmMapId) -> Self {
        Self::new(id, usize::MAX)
    }

    /// Currently mapped bytes
    pub fn total_size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Byte capacity of this map
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get entry count
    pub fn entry_count(&self) -> usize {
        self.entry_count.load(Ordering::Relaxed)
    }

    /// Enter a new mapping
    pub fn enter(
        &self,
        start: usize,
        end: usize,
        protection: VmProt,
        flags: EntryFlags,
        tag: usize,
    ) -> Result<(), MapError> {
        if start >= end {
            return Err(MapError::InvalidRange);
        }

        let len = end - start;
        let mut entries = self.entries.lock();

        if self.size.load(Ordering::Relaxed) + len > self.capacity {
            return Err(MapError::NoSpace);
        }

        // Check for overlap
        if let Some((_, prev)) = entries.range(..end).next_back() {
            if prev.overlaps(start, end) {
                return Err(MapError::NoSpace);
            }
        }

        let mut entry = VmMapEntry::new(start, end, protection, flags);
        entry.tag = tag;
        entries.insert(start, entry);

        self.size.fetch_add(len, Ordering::Relaxed);
        self.entry_count.fetch_add(1, Ordering::Relaxed);
        self.timestamp.fetch_add(1, Ordering::Relaxed);

        Ok(())
    }

    /// Remove all entries fully contained in a range, returning the bytes
    /// unmapped
    pub fn remove(&self, start: usize, end: usize) -> Result<usize, MapError> {
        let mut entries = self.entries.lock();

        let to_remove: Vec<usize> = entries
            .range(start..end)
            .filter(|(_, e)| e.start >= start && e.end <= end)
            .map(|(&k, _)| k)
            .collect();

        if to_remove.is_empty() {
            return Err(MapError::NotFound);
        }

        let mut total_removed = 0usize;
        for key in &to_remove {
            if let Some(entry) = entries.remove(key) {
                total_removed += entry.size();
            }
        }

        self.size.fetch_sub(total_removed, Ordering::Relaxed);
        self.entry_count.fetch_sub(to_remove.len(), Ordering::Relaxed);
        self.timestamp.fetch_add(1, Ordering::Relaxed);

        Ok(total_removed)
    }

    /// Change protection on a range
    ///
    /// Entries marked ATOMIC must be fully covered by the range.
    pub fn protect(&self, start: usize, end: usize, new_prot: VmProt) -> Result<(), MapError> {
        let mut entries = self.entries.lock();
        let mut hit = false;

        for (_, entry) in entries.iter_mut() {
            if !entry.overlaps(start, end) {
                continue;
            }
            if !entry.max_protection.admits(new_prot) {
                return Err(MapError::ProtectionFailure);
            }
            if entry.flags.contains(EntryFlags::ATOMIC) && (entry.start < start || entry.end > end)
            {
                return Err(MapError::ProtectionFailure);
            }
            entry.protection = new_prot;
            hit = true;
        }

        if !hit {
            return Err(MapError::NotFound);
        }

        self.timestamp.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Find the entry containing an address
    pub fn lookup_entry(&self, addr: usize) -> Option<VmMapEntry> {
        let entries = self.entries.lock();
        if let Some((_, entry)) = entries.range(..=addr).next_back() {
            if entry.contains(addr) {
                return Some(entry.clone());
            }
        }
        None
    }

    /// Is the address covered by an entry of this map?
    pub fn contains(&self, addr: usize) -> bool {
        self.lookup_entry(addr).is_some()
    }
}

// ============================================================================
// Kernel Map
// ============================================================================

static KERNEL_MAP: spin::Once<Arc<VmMap>> = spin::Once::new();

/// Create the kernel map (called once from startup, after VM bootstrap)
pub fn kernel_map_init() {
    KERNEL_MAP.call_once(|| Arc::new(VmMap::kernel(VmMapId(1))));
}

/// Get the kernel map
pub fn kernel_map() -> Option<Arc<VmMap>> {
    KERNEL_MAP.get().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_map() -> VmMap {
        VmMap::new(VmMapId(7), 1 << 20)
    }

    #[test]
    fn test_enter_and_lookup() {
        let map = test_map();
        map.enter(0x1000, 0x3000, VmProt::ReadWrite, EntryFlags::ATOMIC, 42)
            .expect("enter failed");

        let entry = map.lookup_entry(0x2fff).expect("entry missing");
        assert_eq!(entry.start, 0x1000);
        assert_eq!(entry.end, 0x3000);
        assert_eq!(entry.tag, 42);
        assert!(entry.flags.contains(EntryFlags::ATOMIC));
        assert!(map.contains(0x1000));
        assert!(!map.contains(0x3000));
        assert_eq!(map.total_size(), 0x2000);
    }

    #[test]
    fn test_enter_rejects_overlap() {
        let map = test_map();
        map.enter(0x1000, 0x3000, VmProt::ReadWrite, EntryFlags::empty(), 0)
            .expect("enter failed");
        assert_eq!(
            map.enter(0x2000, 0x4000, VmProt::ReadWrite, EntryFlags::empty(), 0),
            Err(MapError::NoSpace)
        );
        assert_eq!(
            map.enter(0x0, 0x1001, VmProt::ReadWrite, EntryFlags::empty(), 0),
            Err(MapError::NoSpace)
        );
    }

    #[test]
    fn test_enter_respects_capacity() {
        let map = VmMap::new(VmMapId(8), 0x2000);
        map.enter(0x1000, 0x3000, VmProt::ReadWrite, EntryFlags::empty(), 0)
            .expect("enter failed");
        assert_eq!(
            map.enter(0x4000, 0x5000, VmProt::ReadWrite, EntryFlags::empty(), 0),
            Err(MapError::NoSpace)
        );
    }

    #[test]
    fn test_remove_accounts_all_entries() {
        let map = test_map();
        map.enter(0x1000, 0x2000, VmProt::ReadWrite, EntryFlags::empty(), 0)
            .expect("enter failed");
        map.enter(0x2000, 0x3000, VmProt::None, EntryFlags::GUARD, 0)
            .expect("enter failed");
        assert_eq!(map.entry_count(), 2);

        let removed = map.remove(0x1000, 0x3000).expect("remove failed");
        assert_eq!(removed, 0x2000);
        assert_eq!(map.entry_count(), 0);
        assert_eq!(map.total_size(), 0);
        assert!(!map.contains(0x1800));
    }

    #[test]
    fn test_protect_checks_atomic_coverage() {
        let map = test_map();
        map.enter(0x1000, 0x3000, VmProt::ReadWrite, EntryFlags::ATOMIC, 0)
            .expect("enter failed");

        // Partial coverage of an atomic entry is refused
        assert_eq!(
            map.protect(0x1000, 0x2000, VmProt::Read),
            Err(MapError::ProtectionFailure)
        );

        map.protect(0x1000, 0x3000, VmProt::Read).expect("protect failed");
        let entry = map.lookup_entry(0x1000).expect("entry missing");
        assert_eq!(entry.protection, VmProt::Read);
        assert!(!entry.protection.can_write());
    }

    #[test]
    fn test_protect_missing_range() {
        let map = test_map();
        assert_eq!(map.protect(0x1000, 0x2000, VmProt::Read), Err(MapError::NotFound));
    }
}

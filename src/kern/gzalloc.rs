//! Guard-mode Zone Allocation
//!
//! Wraps tracked zones with page-isolated allocations to trap
//! memory-safety bugs. Each element sits at the edge of its own page run
//! next to a no-access guard page and carries a signed header recording
//! the owning zone and element size; the unused remainder of the run is
//! stamped with a fill pattern and revalidated at free time. Freed
//! ranges are parked unmapped or read-only in a per-zone
//! least-recently-freed ring, so stale loads and stores keep faulting
//! long after the free, and physical pages are released only when the
//! ring evicts them.
//!
//! The engine trades memory and speed for diagnostic power: one page run
//! plus one guard page per element, and a header/pattern validation on
//! every free.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::mem;
use core::ptr::NonNull;
use spin::{Mutex, Once};

use crate::boot::BootArgs;
use crate::kern::counters::Counter;
use crate::kern::sched_prim;
use crate::kern::zalloc::{self, AllocFlags, GuardExt, Zone, ZoneId};
use crate::vm::pmap;
use crate::vm::vm_kern::{self, KmaFlags};
use crate::vm::vm_map::{EntryFlags, VmMap, VmMapEntry, VmProt};
use crate::vm::vm_page::{page_aligned, round_page, trunc_page, PAGE_SIZE};

// ============================================================================
// Constants
// ============================================================================

/// Signature proving a guard header is genuine
pub const GUARD_SIGNATURE: u32 = 0xABAD_CAFE;

/// Byte stamped into the residue and revalidated at free
pub const GUARD_FILL: u8 = 0x67;

/// Default free-cache capacity per tracked zone
pub const GUARD_FC_DEFAULT: usize = 1536;

/// Default minimum tracked element size under bare `enable`
pub const GUARD_MIN_DEFAULT: usize = 1024;

/// Default arena scale relative to the zone map
pub const GUARD_ZSCALE_DEFAULT: usize = 6;

/// Default bootstrap reserve size
pub const GUARD_RESERVE_DEFAULT: usize = 2 * 1024 * 1024;

/// Owner recorded on allocations made before the VM map exists
pub const EARLY_OWNER: ZoneId = ZoneId(u32::MAX);

const ZONE_NAME_MAX: usize = 64;

/// Where the element sits relative to the guard page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutMode {
    /// Element flush against a trailing guard page (catches overruns)
    Overflow,
    /// Leading guard page, element first in the run (catches underruns)
    Underflow,
}

/// What happens to a freed range while it sits in the ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeProtection {
    /// Pages are unmapped; any access faults
    Unmap,
    /// Pages become read-only; writes fault, headers stay readable
    WriteProtect,
}

// ============================================================================
// Config
// ============================================================================

/// Frozen engine configuration, parsed once from boot arguments
#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub enabled: bool,
    /// Track zones with element size >= min_size
    pub min_size: usize,
    /// Track zones with element size <= max_size
    pub max_size: usize,
    /// Free-cache capacity per zone (0 disables the cache)
    pub fc_size: usize,
    pub prot_on_free: FreeProtection,
    pub mode: LayoutMode,
    /// Validate signature, owner, size and fill pattern on free
    pub consistency_checks: bool,
    /// Scan the ring for the address on every free
    pub dfree_check: bool,
    /// Arena capacity multiplier over the zone map size
    pub zscale: usize,
    pub reserve_size: usize,
    /// Zone tracked by name regardless of size; `.` in the boot token
    /// stands for a space in the zone name
    pub named_zone: Option<heapless::String<ZONE_NAME_MAX>>,
}

impl GuardConfig {
    /// Hard-off configuration
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            min_size: GUARD_MIN_DEFAULT,
            max_size: usize::MAX,
            fc_size: GUARD_FC_DEFAULT,
            prot_on_free: FreeProtection::Unmap,
            mode: LayoutMode::Overflow,
            consistency_checks: true,
            dfree_check: true,
            zscale: GUARD_ZSCALE_DEFAULT,
            reserve_size: GUARD_RESERVE_DEFAULT,
            named_zone: None,
        }
    }

    /// Parse the boot tokens. `disable` overrides every enable.
    pub fn from_bootargs(args: &BootArgs) -> Self {
        let mut cfg = Self::disabled();
        let mut min_seen = false;

        if args.flag("enable") {
            cfg.enabled = true;
        }
        if let Some(n) = args.value_usize("min") {
            cfg.enabled = true;
            cfg.min_size = n;
            min_seen = true;
        }
        if let Some(n) = args.value_usize("max") {
            cfg.enabled = true;
            cfg.max_size = n;
            if !min_seen {
                cfg.min_size = 0;
            }
        }
        if let Some(n) = args.value_usize("size") {
            cfg.enabled = true;
            cfg.min_size = n;
            cfg.max_size = n;
        }
        if let Some(n) = args.value_usize("fc_size") {
            cfg.fc_size = n;
        }
        if args.flag("wp") {
            cfg.prot_on_free = FreeProtection::WriteProtect;
        }
        if args.flag("uf_mode") {
            cfg.mode = LayoutMode::Underflow;
        }
        if args.flag("no_dfree_check") {
            cfg.dfree_check = false;
        }
        if args.flag("noconsistency") {
            cfg.consistency_checks = false;
        }
        if let Some(n) = args.value_usize("zscale") {
            cfg.zscale = n.max(1);
        }
        if let Some(raw) = args.value_str("name") {
            let mut name: heapless::String<ZONE_NAME_MAX> = heapless::String::new();
            for c in raw.chars() {
                let c = if c == '.' { ' ' } else { c };
                if name.push(c).is_err() {
                    break;
                }
            }
            cfg.named_zone = Some(name);
        }
        if args.flag("disable") {
            return Self::disabled();
        }
        cfg
    }

    /// Does this configuration track a zone?
    pub fn tracks(&self, elem_size: usize, name: &str) -> bool {
        if !self.enabled {
            return false;
        }
        if let Some(wanted) = &self.named_zone {
            if wanted.as_str() == name {
                return true;
            }
        }
        elem_size >= self.min_size && elem_size <= self.max_size
    }
}

// ============================================================================
// Reserve
// ============================================================================

/// Pre-VM bump-pointer pool, stolen from the physical layer at bootstrap.
/// Carved memory is never returned.
#[derive(Debug)]
struct Reserve {
    next: usize,
    remaining: usize,
}

impl Reserve {
    const fn empty() -> Self {
        Self { next: 0, remaining: 0 }
    }

    fn init(&mut self, size: usize) {
        if size == 0 {
            return;
        }
        let rounded = round_page(size);
        self.next = pmap::pmap_steal_memory(rounded);
        self.remaining = rounded;
    }

    fn carve(&mut self, size: usize) -> usize {
        let size = round_page(size);
        if size > self.remaining {
            panic!(
                "gzalloc: reserve exhausted ({} bytes requested, {} left)",
                size, self.remaining
            );
        }
        let base = self.next;
        self.next += size;
        self.remaining -= size;
        base
    }
}

// ============================================================================
// VA Arena
// ============================================================================

/// Sub-map of the kernel map dedicated to guarded ranges
#[derive(Debug)]
struct Arena {
    map: Arc<VmMap>,
}

impl Arena {
    fn new(parent: &Arc<VmMap>, size: usize) -> Self {
        Self {
            map: vm_kern::kmem_suballoc(parent, size),
        }
    }

    /// Map `bytes` of zero-filled memory plus one no-access guard page at
    /// the trailing (overflow) or leading (underflow) edge. The data
    /// entry carries `hdr_offset` for reverse lookup. Panics on failure.
    fn alloc_guarded(&self, bytes: usize, mode: LayoutMode, hdr_offset: usize) -> usize {
        let guard = match mode {
            LayoutMode::Overflow => KmaFlags::GUARD_LAST,
            LayoutMode::Underflow => KmaFlags::GUARD_FIRST,
        };
        let flags = guard | KmaFlags::ZERO | KmaFlags::NOFAIL | KmaFlags::KOBJECT;
        match vm_kern::kernel_memory_allocate(&self.map, bytes, flags, hdr_offset) {
            Ok(base) => base,
            Err(e) => panic!("gzalloc: arena allocation of {} bytes failed: {:?}", bytes, e),
        }
    }

    /// Unmap a whole range, guard page included
    fn free_range(&self, base: usize, bytes: usize) {
        if let Err(e) = vm_kern::kmem_free(&self.map, base, bytes) {
            panic!(
                "gzalloc: cannot release range [{:#x}, {:#x}): {:?}",
                base,
                base + bytes,
                e
            );
        }
    }

    fn protect(&self, start: usize, end: usize, prot: VmProt) {
        if let Err(e) = self.map.protect(start, end, prot) {
            panic!(
                "gzalloc: protection change on [{:#x}, {:#x}) failed: {:?}",
                start, end, e
            );
        }
    }

    fn contains(&self, addr: usize) -> bool {
        self.map.contains(addr)
    }

    fn lookup_entry(&self, addr: usize) -> Option<VmMapEntry> {
        self.map.lookup_entry(addr)
    }
}

// ============================================================================
// Header Codec
// ============================================================================

/// Per-allocation metadata placed next to the element
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardHeader {
    /// Owning zone id, or `EARLY_OWNER` for pre-VM allocations
    pub zone: u32,
    /// Element size recorded at allocation
    pub size: u32,
    /// `GUARD_SIGNATURE` when genuine
    pub sig: u32,
}

pub const GUARD_HEADER_SIZE: usize = mem::size_of::<GuardHeader>();

/// The only raw header accesses in the engine. Addresses come from the
/// layout arithmetic below and are always `GuardHeader`-aligned: element
/// sizes are 8-byte multiples and runs are page based.
unsafe fn header_write(at: usize, h: GuardHeader) {
    debug_assert!(at % mem::align_of::<GuardHeader>() == 0);
    core::ptr::write(at as *mut GuardHeader, h);
}

unsafe fn header_read(at: usize) -> GuardHeader {
    debug_assert!(at % mem::align_of::<GuardHeader>() == 0);
    core::ptr::read(at as *const GuardHeader)
}

fn fill_pattern(start: usize, end: usize) {
    if start >= end {
        return;
    }
    unsafe { core::ptr::write_bytes(start as *mut u8, GUARD_FILL, end - start) };
}

/// Page-rounded run size and residue for an element size
fn guard_layout(elem_size: usize) -> (usize, usize) {
    let rounded = round_page(elem_size + GUARD_HEADER_SIZE);
    (rounded, rounded - elem_size)
}

/// Underflow-mode offsets within the data run: primary header address,
/// fill-pattern bounds, and the trailing header copy. The copy is
/// dropped for element sizes where it would overlap the primary header.
fn uf_bounds(
    data_base: usize,
    rounded: usize,
    elem_size: usize,
) -> (usize, usize, usize, Option<usize>) {
    let hdr = data_base + elem_size;
    let fill_start = hdr + GUARD_HEADER_SIZE;
    let dup = data_base + rounded - GUARD_HEADER_SIZE;
    if dup >= fill_start {
        (hdr, fill_start, dup, Some(dup))
    } else {
        (hdr, fill_start, data_base + rounded, None)
    }
}

// ============================================================================
// Counters
// ============================================================================

/// Engine-wide tallies, updated atomically
#[derive(Debug)]
pub struct GuardCounters {
    /// Bytes in live and cached guarded runs
    pub allocated: Counter,
    /// Bytes released back to the arena
    pub freed: Counter,
    /// Residue bytes currently committed
    pub wasted: Counter,
    /// Bytes carved from the reserve
    pub early_alloc: Counter,
    /// Bytes leaked by pre-VM frees
    pub early_free: Counter,
    /// Allocations entered with preemption disabled
    pub pdzalloc: Counter,
    /// Frees entered with preemption disabled
    pub pdzfree: Counter,
}

impl GuardCounters {
    const fn new() -> Self {
        Self {
            allocated: Counter::new("gzalloc.allocated"),
            freed: Counter::new("gzalloc.freed"),
            wasted: Counter::new("gzalloc.wasted"),
            early_alloc: Counter::new("gzalloc.early_alloc"),
            early_free: Counter::new("gzalloc.early_free"),
            pdzalloc: Counter::new("gzalloc.pdzalloc_count"),
            pdzfree: Counter::new("gzalloc.pdzfree_count"),
        }
    }
}

/// Point-in-time copy of the engine counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GuardStats {
    pub allocated: u64,
    pub freed: u64,
    pub wasted: u64,
    pub early_alloc: u64,
    pub early_free: u64,
    pub pdzalloc_count: u64,
    pub pdzfree_count: u64,
}

// ============================================================================
// Reverse Lookup Result
// ============================================================================

/// Answer to "whose address is this?"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardLookup {
    /// Not managed by the guard engine
    NotMine,
    /// Inside a guarded allocation
    Element { zone: ZoneId, size: usize },
}

// ============================================================================
// Engine
// ============================================================================

/// The guard allocation engine.
///
/// Built in two steps mirroring boot: [`GuardAllocator::bootstrap`]
/// freezes the configuration and steals the reserve before the VM map
/// exists; [`GuardAllocator::init`] creates the VA arena once the kernel
/// map is up. Between the two, allocations come from the reserve and
/// frees leak by design.
pub struct GuardAllocator {
    config: GuardConfig,
    reserve: Mutex<Reserve>,
    arena: Once<Arena>,
    counters: GuardCounters,
}

impl GuardAllocator {
    /// Freeze the configuration and steal the bootstrap reserve
    pub fn bootstrap(config: GuardConfig) -> Self {
        let engine = Self {
            config,
            reserve: Mutex::new(Reserve::empty()),
            arena: Once::new(),
            counters: GuardCounters::new(),
        };
        if engine.config.enabled {
            engine.reserve.lock().init(engine.config.reserve_size);
            log::info!(
                "gzalloc: enabled, tracking sizes [{}, {}], fc_size {}, {:?} layout, {:?} on free",
                engine.config.min_size,
                engine.config.max_size,
                engine.config.fc_size,
                engine.config.mode,
                engine.config.prot_on_free,
            );
        }
        engine
    }

    /// Create the VA arena inside the kernel map, sized
    /// `zone_map_size * zscale`
    pub fn init(&self, parent: &Arc<VmMap>, zone_map_size: usize) {
        if !self.config.enabled {
            return;
        }
        self.arena.call_once(|| {
            Arena::new(parent, zone_map_size.saturating_mul(self.config.zscale))
        });
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    fn vm_ready(&self) -> bool {
        self.arena.get().is_some()
    }

    fn arena(&self) -> &Arena {
        self.arena.get().unwrap()
    }

    /// Counter snapshot
    pub fn stats(&self) -> GuardStats {
        GuardStats {
            allocated: self.counters.allocated.get(),
            freed: self.counters.freed.get(),
            wasted: self.counters.wasted.get(),
            early_alloc: self.counters.early_alloc.get(),
            early_free: self.counters.early_free.get(),
            pdzalloc_count: self.counters.pdzalloc.get(),
            pdzfree_count: self.counters.pdzfree.get(),
        }
    }

    /// Per-zone hook, run once at zone creation: populate the guard
    /// extension on zones the configuration tracks
    pub fn zone_init(&self, zone: &Zone) {
        if !self.config.tracks(zone.elem_size, zone.name()) {
            return;
        }
        {
            let mut inner = zone.inner.lock();
            if inner.guard.is_none() {
                inner.guard = Some(GuardExt {
                    ring: vec![0; self.config.fc_size],
                    index: 0,
                });
            }
        }
        zone.set_guarded();
    }

    /// Allocate one guarded element from a zone.
    ///
    /// Returns None only when the engine is off or the caller cannot
    /// block (`NOWAIT` with preemption disabled).
    pub fn alloc(&self, zone: &Zone, flags: AllocFlags) -> Option<NonNull<u8>> {
        if !self.config.enabled {
            return None;
        }
        if sched_prim::preemption_level() > 0 {
            if flags.contains(AllocFlags::NOWAIT) {
                return None;
            }
            self.counters.pdzalloc.inc();
        }

        let elem_size = zone.elem_size;
        let (rounded, residue) = guard_layout(elem_size);

        let (data_base, early) = if self.vm_ready() {
            let hdr_offset = match self.config.mode {
                LayoutMode::Overflow => residue - GUARD_HEADER_SIZE,
                LayoutMode::Underflow => elem_size,
            };
            let base = self.arena().alloc_guarded(rounded, self.config.mode, hdr_offset);
            let data = match self.config.mode {
                LayoutMode::Overflow => base,
                LayoutMode::Underflow => base + PAGE_SIZE,
            };
            (data, false)
        } else {
            // A wasted page stands in for the guard page; the reserve
            // cannot map a real one.
            let base = self.reserve.lock().carve(rounded + PAGE_SIZE);
            let data = match self.config.mode {
                LayoutMode::Overflow => base,
                LayoutMode::Underflow => base + PAGE_SIZE,
            };
            self.counters.early_alloc.add(rounded as u64);
            (data, true)
        };

        let owner = if early { EARLY_OWNER } else { zone.id };
        let header = GuardHeader {
            zone: owner.0,
            size: elem_size as u32,
            sig: GUARD_SIGNATURE,
        };

        let element = match self.config.mode {
            LayoutMode::Overflow => {
                let element = data_base + residue;
                let hdr = element - GUARD_HEADER_SIZE;
                fill_pattern(data_base, hdr);
                unsafe { header_write(hdr, header) };
                element
            }
            LayoutMode::Underflow => {
                let (hdr, fill_start, fill_end, dup) = uf_bounds(data_base, rounded, elem_size);
                unsafe { header_write(hdr, header) };
                if let Some(dup) = dup {
                    unsafe { header_write(dup, header) };
                }
                fill_pattern(fill_start, fill_end);
                data_base
            }
        };

        {
            let mut inner = zone.inner.lock();
            inner.elems_free -= 1;
            inner.wired_cur += 1;
            inner.va_cur += 1;
        }
        zone.stats
            .alloc_count
            .fetch_add(1, core::sync::atomic::Ordering::Relaxed);
        zone.stats
            .mem_allocated
            .fetch_add(rounded as u64, core::sync::atomic::Ordering::Relaxed);

        self.counters.allocated.add(rounded as u64);
        self.counters.wasted.add(residue as u64);

        NonNull::new(element as *mut u8)
    }

    /// Free one guarded element.
    ///
    /// Validates the header and fill pattern, parks the range in the
    /// free ring under the configured protection, and releases the ring's
    /// LRU occupant if one is evicted. Every inconsistency panics.
    pub fn free(&self, zone: &Zone, element: NonNull<u8>) {
        if !self.config.enabled {
            return;
        }
        if sched_prim::preemption_level() > 0 {
            self.counters.pdzfree.inc();
        }

        let elem_addr = element.as_ptr() as usize;
        let elem_size = zone.elem_size;
        let (rounded, residue) = guard_layout(elem_size);

        let (range_base, data_base, hdr) = match self.config.mode {
            LayoutMode::Overflow => {
                let data = elem_addr.wrapping_sub(residue);
                (data, data, elem_addr - GUARD_HEADER_SIZE)
            }
            LayoutMode::Underflow => (
                elem_addr.wrapping_sub(PAGE_SIZE),
                elem_addr,
                elem_addr + elem_size,
            ),
        };
        if !page_aligned(range_base) {
            panic!(
                "gzalloc_free: invalid element address {:#x}, computed base {:#x} is not page aligned",
                elem_addr, range_base
            );
        }

        if self.config.dfree_check {
            let inner = zone.inner.lock();
            if let Some(g) = &inner.guard {
                for (slot, &cached) in g.ring.iter().enumerate() {
                    if cached == range_base {
                        panic!(
                            "gzalloc: double free detected, freed address: {:#x}, current free cache index: {}, freed index: {}",
                            range_base, g.index, slot
                        );
                    }
                }
            }
        }

        let header = unsafe { header_read(hdr) };
        if self.config.consistency_checks {
            if header.sig != GUARD_SIGNATURE {
                panic!(
                    "gzalloc: signature mismatch for element {:#x}, expected {:#x}, found {:#x}",
                    elem_addr, GUARD_SIGNATURE, header.sig
                );
            }
            if header.zone != zone.id.0 && header.zone != EARLY_OWNER.0 {
                panic!(
                    "gzalloc: zone mismatch for element {:#x}, freeing to zone {} but header records zone {}",
                    elem_addr, zone.id.0, header.zone
                );
            }
            if header.size as usize != elem_size {
                panic!(
                    "gzalloc: size mismatch for element {:#x}, zone element size {}, header records {}",
                    elem_addr, elem_size, header.size
                );
            }

            let (scan_start, scan_end) = match self.config.mode {
                LayoutMode::Overflow => (trunc_page(elem_addr), hdr),
                LayoutMode::Underflow => {
                    let (_, fill_start, fill_end, _) = uf_bounds(data_base, rounded, elem_size);
                    (fill_start, fill_end)
                }
            };
            let mut addr = scan_start;
            while addr < scan_end {
                let byte = unsafe { core::ptr::read(addr as *const u8) };
                if byte != GUARD_FILL {
                    panic!(
                        "gzalloc: byte at {:#x}, element {:#x}, contents {:#x}, doesn't match fill pattern ({:#x})",
                        addr, elem_addr, byte, GUARD_FILL
                    );
                }
                addr += 1;
            }
        }

        // Pre-VM allocations are leaked by design
        if !self.vm_ready() || header.zone == EARLY_OWNER.0 {
            self.counters.early_free.add(rounded as u64);
            return;
        }

        let cache_enabled = self.config.fc_size > 0;
        if cache_enabled {
            let prot = match self.config.prot_on_free {
                FreeProtection::WriteProtect => VmProt::Read,
                FreeProtection::Unmap => VmProt::None,
            };
            self.arena().protect(data_base, data_base + rounded, prot);
        }

        let mut to_release = range_base;
        {
            let mut inner = zone.inner.lock();
            if cache_enabled {
                if let Some(g) = inner.guard.as_mut() {
                    if !g.ring.is_empty() {
                        let slot = g.index;
                        to_release = g.ring[slot];
                        g.ring[slot] = range_base;
                        g.index = (slot + 1) % g.ring.len();
                    }
                }
            }
            if to_release != 0 {
                inner.elems_free += 1;
                inner.wired_cur -= 1;
                inner.va_cur -= 1;
            }
        }
        zone.stats
            .free_count
            .fetch_add(1, core::sync::atomic::Ordering::Relaxed);
        zone.stats
            .mem_freed
            .fetch_add(rounded as u64, core::sync::atomic::Ordering::Relaxed);

        if to_release != 0 {
            self.arena().free_range(to_release, rounded + PAGE_SIZE);
            self.counters.freed.add(rounded as u64);
            self.counters.wasted.sub(residue as u64);
        }
    }

    /// Release every range parked in a zone's free ring.
    ///
    /// Called on zone destroy. Idempotent: a drained ring releases
    /// nothing and leaves the counters untouched.
    pub fn empty_free_cache(&self, zone: &Zone) {
        if !self.config.enabled {
            return;
        }
        let snapshot: Vec<usize> = {
            let mut inner = zone.inner.lock();
            match inner.guard.as_mut() {
                Some(g) => {
                    let snap = g.ring.clone();
                    for slot in g.ring.iter_mut() {
                        *slot = 0;
                    }
                    g.index = 0;
                    snap
                }
                None => return,
            }
        };

        let arena = match self.arena.get() {
            Some(a) => a,
            None => return,
        };
        let (rounded, residue) = guard_layout(zone.elem_size);
        let mut freed_elements = 0i64;
        for base in snapshot {
            if base == 0 || !arena.contains(base) {
                continue;
            }
            arena.free_range(base, rounded + PAGE_SIZE);
            self.counters.freed.add(rounded as u64);
            self.counters.wasted.sub(residue as u64);
            freed_elements += 1;
        }

        if freed_elements > 0 {
            let mut inner = zone.inner.lock();
            inner.elems_free += freed_elements;
            inner.wired_cur -= freed_elements;
            inner.va_cur -= freed_elements;
            drop(inner);
            log::debug!(
                "gzalloc: drained {} cached ranges from zone {}",
                freed_elements,
                zone.name()
            );
        }
    }

    /// Identify an arbitrary address: the owning zone id and element
    /// size, or NotMine when the arena does not cover it.
    ///
    /// Panics on any inconsistency past the containment test; an address
    /// inside the arena with a bad entry or header means corruption.
    pub fn reverse_lookup(&self, addr: usize) -> GuardLookup {
        if !self.config.enabled {
            return GuardLookup::NotMine;
        }
        let arena = match self.arena.get() {
            Some(a) => a,
            None => return GuardLookup::NotMine,
        };
        if !arena.contains(addr) {
            return GuardLookup::NotMine;
        }
        let entry = match arena.lookup_entry(addr) {
            Some(e) => e,
            None => panic!("gzalloc: no arena map entry covers address {:#x}", addr),
        };
        if !entry.flags.contains(EntryFlags::ATOMIC) {
            panic!(
                "gzalloc: arena entry [{:#x}, {:#x}) covering {:#x} is not atomic",
                entry.start, entry.end, addr
            );
        }
        let header = self.read_from_entry(&entry);
        if header.sig != GUARD_SIGNATURE {
            panic!(
                "gzalloc: signature mismatch in arena entry [{:#x}, {:#x}), expected {:#x}, found {:#x}",
                entry.start, entry.end, GUARD_SIGNATURE, header.sig
            );
        }
        GuardLookup::Element {
            zone: ZoneId(header.zone),
            size: header.size as usize,
        }
    }

    /// Recover the header given only an entry's bounds.
    ///
    /// The entry tag (header offset, recorded at allocation) is
    /// preferred. Without it, underflow mode reads the trailing header
    /// copy and overflow mode scans forward one word at a time for the
    /// signature. The scan can be fooled by a signature-shaped word in
    /// element data, which is why the tag exists.
    fn read_from_entry(&self, entry: &VmMapEntry) -> GuardHeader {
        if entry.tag != 0 && entry.start + entry.tag + GUARD_HEADER_SIZE <= entry.end {
            return unsafe { header_read(entry.start + entry.tag) };
        }
        match self.config.mode {
            LayoutMode::Underflow => unsafe { header_read(entry.end - GUARD_HEADER_SIZE) },
            LayoutMode::Overflow => {
                let sig_offset = mem::offset_of!(GuardHeader, sig);
                let word = mem::size_of::<u32>();
                let mut addr = entry.start;
                while addr + word <= entry.end {
                    let value = unsafe { core::ptr::read(addr as *const u32) };
                    if value == GUARD_SIGNATURE && addr >= entry.start + sig_offset {
                        return unsafe { header_read(addr - sig_offset) };
                    }
                    addr += word;
                }
                panic!(
                    "gzalloc: no header signature in arena entry [{:#x}, {:#x})",
                    entry.start, entry.end
                );
            }
        }
    }
}

// ============================================================================
// Kernel Surface
// ============================================================================

static GZALLOC: Once<GuardAllocator> = Once::new();

/// Configure the engine from boot arguments and steal the reserve.
/// Called once, before the VM map exists.
pub fn gzalloc_bootstrap(args: &BootArgs) {
    GZALLOC.call_once(|| GuardAllocator::bootstrap(GuardConfig::from_bootargs(args)));
}

/// Create the VA arena once the kernel map is up
pub fn gzalloc_init(parent: &Arc<VmMap>, zone_map_size: usize) {
    if let Some(engine) = GZALLOC.get() {
        engine.init(parent, zone_map_size);
    }
}

/// Is the engine on?
pub fn gzalloc_enabled() -> bool {
    GZALLOC.get().map_or(false, |e| e.enabled())
}

/// Per-zone hook, called once at zone construction
pub fn gzalloc_zone_init(zone: &Zone) {
    if let Some(engine) = GZALLOC.get() {
        engine.zone_init(zone);
    }
}

/// Allocate a guarded element
pub fn gzalloc_alloc(zone: &Zone, flags: AllocFlags) -> Option<NonNull<u8>> {
    GZALLOC.get().and_then(|e| e.alloc(zone, flags))
}

/// Free a guarded element
pub fn gzalloc_free(zone: &Zone, element: NonNull<u8>) {
    if let Some(engine) = GZALLOC.get() {
        engine.free(zone, element);
    }
}

/// Drain a zone's free ring (zone destroy path)
pub fn gzalloc_empty_free_cache(zone: &Zone) {
    if let Some(engine) = GZALLOC.get() {
        engine.empty_free_cache(zone);
    }
}

/// Identify an address: the owning zone and element size.
///
/// Returns None for addresses the engine does not manage. Panics if the
/// recorded zone is no longer tracked; the header then disagrees with
/// the live configuration and something has scribbled on it.
pub fn gzalloc_element_size(addr: usize) -> Option<(ZoneId, usize)> {
    let engine = GZALLOC.get()?;
    match engine.reverse_lookup(addr) {
        GuardLookup::NotMine => None,
        GuardLookup::Element { zone, size } => {
            if zone != EARLY_OWNER {
                match zalloc::zone_find_by_id(zone) {
                    Some(z) if z.is_guarded() => {}
                    Some(z) => panic!(
                        "gzalloc: address {:#x} records zone {} which is not tracked",
                        addr,
                        z.name()
                    ),
                    None => panic!(
                        "gzalloc: address {:#x} records unknown zone id {}",
                        addr, zone.0
                    ),
                }
            }
            Some((zone, size))
        }
    }
}

/// Engine counter snapshot (zeros when the engine never came up)
pub fn gzalloc_stats() -> GuardStats {
    GZALLOC.get().map_or_else(GuardStats::default, |e| e.stats())
}

//! Virtual address-space management
//!
//! - Generic page-table walker parameterized by an architecture descriptor
//!   ([`PageTableFormat`]) and an injected table window ([`TableMapper`])
//! - `map`/`unmap`/`query` over base and huge granules, with the portable
//!   flag vocabulary in [`MapFlags`]
//! - Address-space lifecycle for the process layer: create, tear down,
//!   switch, current
//!
//! Concurrent mutation of a single address space is the caller's job to
//! serialize; this layer adds no per-space lock.

use core::marker::PhantomData;

use bitflags::bitflags;
use spin::Once;

use crate::constants::memory::{
    FRAME_SIZE, HEAP_WINDOW_SIZE, HEAP_WINDOW_START, RECURSIVE_INDEX,
};
use crate::memory::arch::{HhdmMapper, X86PageTables};
use crate::memory::error::MemError;
use crate::memory::frames::{frame_allocator, FrameAllocator};
use crate::memory::tlb;

bitflags! {
    /// Portable mapping flags shared with every memory consumer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const USER = 1 << 3;
        const KERNEL = 1 << 4;
        /// Map at the architecture's huge granule instead of base pages.
        const HUGE = 1 << 5;
        /// Copy-on-write: shared read-only until the first write fault.
        const COW = 1 << 6;
        /// Allocate-on-request: reserved but unbacked until first touch.
        /// Software-only; such entries are never present.
        const AOR = 1 << 7;
    }
}

/// Architecture descriptor consumed by the walker. The leaf is level 0;
/// the top-level table is `LEVELS - 1`.
pub trait PageTableFormat {
    const LEVELS: usize;
    const ENTRIES: usize;

    /// Table index selecting the entry for `va` at `level`.
    fn index_of(level: usize, va: u64) -> usize;
    /// Bytes translated by one entry at `level`.
    fn span(level: usize) -> u64;
    /// Level carrying huge leaves, if the architecture has one.
    fn huge_level() -> Option<usize>;

    fn encode(flags: MapFlags) -> u64;
    fn decode(entry: u64) -> MapFlags;
    fn leaf_entry(pa: u64, flags: MapFlags) -> u64;
    fn table_entry(pa: u64, user: bool) -> u64;
    fn entry_addr(entry: u64) -> u64;
    fn is_present(entry: u64) -> bool;
    fn is_huge(entry: u64) -> bool;
    /// `entry` with only its present/valid bit cleared.
    fn unmapped(entry: u64) -> u64;
    fn user_half(va: u64) -> bool;
}

/// Capability turning a table page's physical address into a writable
/// view. The kernel goes through the higher-half direct map; tests use a
/// simulated table pool.
pub trait TableMapper {
    fn map_table(&self, pa: u64) -> *mut u64;
}

/// An address space, identified by the physical address of its top-level
/// table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpace {
    root: u64,
}

impl AddressSpace {
    pub fn from_root(root: u64) -> Self {
        AddressSpace { root }
    }

    pub fn root(&self) -> u64 {
        self.root
    }
}

/// Terminal states of one walk.
enum WalkOutcome {
    /// Reached the requested level.
    Resolved { entry: *mut u64, level: usize },
    /// A table on the way down was missing (non-creating walks only).
    NotPresent,
    /// A huge leaf above the requested level translated the address; a
    /// successful stop, not an error.
    HugeStop { entry: *mut u64, level: usize },
}

/// The virtual address-space manager. One long-lived instance per
/// architecture, holding the injected table window and the frame
/// allocator used for table pages.
pub struct AddressSpaceManager<S: PageTableFormat, M: TableMapper> {
    mapper: M,
    pmm: &'static FrameAllocator,
    kernel_space: AddressSpace,
    format: PhantomData<fn() -> S>,
}

impl<S: PageTableFormat, M: TableMapper> AddressSpaceManager<S, M> {
    pub fn new(mapper: M, pmm: &'static FrameAllocator, kernel_space: AddressSpace) -> Self {
        AddressSpaceManager {
            mapper,
            pmm,
            kernel_space,
            format: PhantomData,
        }
    }

    pub fn kernel_space(&self) -> AddressSpace {
        self.kernel_space
    }

    /// Descends from the top-level table towards `target_level`. With
    /// `create`, missing intermediate tables are allocated, zero-filled
    /// and linked on the way down.
    fn walk(
        &self,
        space: &AddressSpace,
        va: u64,
        target_level: usize,
        create: bool,
    ) -> Result<WalkOutcome, MemError> {
        let mut table_pa = space.root();
        let mut level = S::LEVELS - 1;
        loop {
            let table = self.mapper.map_table(table_pa);
            let entry_ptr = unsafe { table.add(S::index_of(level, va)) };
            let entry = unsafe { entry_ptr.read_volatile() };

            if level == target_level {
                return Ok(WalkOutcome::Resolved {
                    entry: entry_ptr,
                    level,
                });
            }

            if !S::is_present(entry) {
                if !create {
                    return Ok(WalkOutcome::NotPresent);
                }
                let fresh = self.pmm.reference(0, 1, 1)?;
                self.clean_table(fresh);
                unsafe {
                    entry_ptr.write_volatile(S::table_entry(fresh, S::user_half(va)));
                }
                table_pa = fresh;
            } else if S::is_huge(entry) {
                return Ok(WalkOutcome::HugeStop {
                    entry: entry_ptr,
                    level,
                });
            } else {
                table_pa = S::entry_addr(entry);
            }
            level -= 1;
        }
    }

    /// Zero-fills a freshly allocated table page through the window and
    /// drops any stale translation the window may have cached for it.
    fn clean_table(&self, pa: u64) {
        let view = self.mapper.map_table(pa);
        unsafe {
            core::ptr::write_bytes(view, 0, S::ENTRIES);
        }
        tlb::invalidate_local(view as u64);
    }

    fn granule_for(&self, huge: bool) -> Result<(usize, u64), MemError> {
        let level = if huge {
            S::huge_level().ok_or(MemError::Unsupported)?
        } else {
            0
        };
        Ok((level, S::span(level)))
    }

    /// Installs translations for `[va, va + size)` onto `[pa, pa + size)`.
    /// Intermediate tables are created as needed; fresh mappings never
    /// require TLB invalidation.
    pub fn map(
        &self,
        space: &AddressSpace,
        va: u64,
        pa: u64,
        size: u64,
        flags: MapFlags,
    ) -> Result<(), MemError> {
        let (target, granule) = self.granule_for(flags.contains(MapFlags::HUGE))?;
        if size == 0 || va % granule != 0 || pa % granule != 0 || size % granule != 0 {
            return Err(MemError::InvalidArg);
        }

        let mut offset = 0;
        while offset < size {
            match self.walk(space, va + offset, target, true)? {
                WalkOutcome::Resolved { entry, .. } => {
                    if S::is_present(unsafe { entry.read_volatile() }) {
                        return Err(MemError::AlreadyMapped);
                    }
                    unsafe {
                        entry.write_volatile(S::leaf_entry(pa + offset, flags));
                    }
                }
                WalkOutcome::HugeStop { .. } => return Err(MemError::AlreadyMapped),
                WalkOutcome::NotPresent => unreachable!("creating walk stopped early"),
            }
            offset += granule;
        }
        Ok(())
    }

    /// Removes the translations for `[va, va + size)` at the granule
    /// implied by `huge`. Only the present bit is cleared, so software
    /// markers (COW, AOR) survive for a later remap; the range is then
    /// shot down on every other core.
    pub fn unmap(
        &self,
        space: &AddressSpace,
        va: u64,
        size: u64,
        huge: bool,
    ) -> Result<(), MemError> {
        let (target, granule) = self.granule_for(huge)?;
        if size == 0 || va % granule != 0 || size % granule != 0 {
            return Err(MemError::InvalidArg);
        }

        let mut offset = 0;
        while offset < size {
            match self.walk(space, va + offset, target, false)? {
                WalkOutcome::Resolved { entry, .. } => {
                    let value = unsafe { entry.read_volatile() };
                    if !S::is_present(value) {
                        return Err(MemError::NotMapped);
                    }
                    // a table entry where a huge leaf was requested
                    if huge && !S::is_huge(value) {
                        return Err(MemError::InvalidArg);
                    }
                    unsafe {
                        entry.write_volatile(S::unmapped(value));
                    }
                    tlb::invalidate_local(va + offset);
                }
                // a huge leaf on the base-page path
                WalkOutcome::HugeStop { .. } => return Err(MemError::InvalidArg),
                WalkOutcome::NotPresent => return Err(MemError::NotMapped),
            }
            offset += granule;
        }

        tlb::shootdown(va, size);
        Ok(())
    }

    /// Resolves `va` to its backing physical address and portable flags.
    pub fn query(&self, space: &AddressSpace, va: u64) -> Result<(u64, MapFlags), MemError> {
        match self.walk(space, va, 0, false)? {
            WalkOutcome::Resolved { entry, level }
            | WalkOutcome::HugeStop { entry, level } => {
                let value = unsafe { entry.read_volatile() };
                if !S::is_present(value) {
                    return Err(MemError::NotMapped);
                }
                let page = S::span(level);
                Ok((S::entry_addr(value) + va % page, S::decode(value)))
            }
            WalkOutcome::NotPresent => Err(MemError::NotMapped),
        }
    }

    /// Decodes the leaf entry for `va` even when it is not present. This
    /// is how the page-fault path reads AOR/COW markers off a faulting
    /// address.
    pub fn entry_flags(&self, space: &AddressSpace, va: u64) -> Result<MapFlags, MemError> {
        match self.walk(space, va, 0, false)? {
            WalkOutcome::Resolved { entry, .. } | WalkOutcome::HugeStop { entry, .. } => {
                Ok(S::decode(unsafe { entry.read_volatile() }))
            }
            WalkOutcome::NotPresent => Err(MemError::NotMapped),
        }
    }

    /// Kernel-space bring-up: plumb the heap window's top-level slots so
    /// heap growth never needs a fresh top-level table under pressure,
    /// then drop the bootloader's lower-half temporary mappings.
    pub fn init_kernel_space(&self) -> Result<(), MemError> {
        let top_span = S::span(S::LEVELS - 1);
        let mut va = HEAP_WINDOW_START;
        while va < HEAP_WINDOW_START + HEAP_WINDOW_SIZE as u64 {
            self.walk(&self.kernel_space, va, S::LEVELS - 2, true)?;
            va += top_span;
        }

        let root = self.mapper.map_table(self.kernel_space.root());
        let recursive = unsafe { root.add(RECURSIVE_INDEX) };
        if !S::is_present(unsafe { recursive.read_volatile() }) {
            unsafe {
                recursive.write_volatile(S::table_entry(self.kernel_space.root(), false));
            }
        }

        for i in 0..S::ENTRIES / 2 {
            unsafe {
                root.add(i).write_volatile(0);
            }
        }
        Ok(())
    }

    /// Builds a fresh address space: zeroed root, the kernel half shared
    /// with every other space, and the self-referential slot.
    pub fn create_address_space(&self) -> Result<AddressSpace, MemError> {
        let root_pa = self.pmm.reference(0, 1, 1)?;
        self.clean_table(root_pa);

        let src = self.mapper.map_table(self.kernel_space.root());
        let dst = self.mapper.map_table(root_pa);
        for i in S::ENTRIES / 2..S::ENTRIES {
            unsafe {
                dst.add(i).write_volatile(src.add(i).read_volatile());
            }
        }
        unsafe {
            dst.add(RECURSIVE_INDEX)
                .write_volatile(S::table_entry(root_pa, false));
        }
        Ok(AddressSpace::from_root(root_pa))
    }

    /// Tears down the user half of `space`, dropping one reference on
    /// every mapped frame and every table page, then releases the root.
    /// Shared and COW frames outlive this if other owners remain.
    pub fn free_address_space(&self, space: AddressSpace) -> Result<(), MemError> {
        self.release_table(space.root(), S::LEVELS - 1, true)?;
        self.pmm.dereference(space.root(), 1)
    }

    fn release_table(&self, table_pa: u64, level: usize, top: bool) -> Result<(), MemError> {
        let table = self.mapper.map_table(table_pa);
        // only the user half of the top level belongs to this space
        let limit = if top { S::ENTRIES / 2 } else { S::ENTRIES };
        for i in 0..limit {
            let entry = unsafe { table.add(i).read_volatile() };
            if !S::is_present(entry) {
                // includes bare AOR reservations, which hold no frame
                continue;
            }
            let pa = S::entry_addr(entry);
            if level == 0 || S::is_huge(entry) {
                let frames = (S::span(level) / FRAME_SIZE as u64) as usize;
                self.pmm.dereference(pa, frames)?;
            } else {
                self.release_table(pa, level - 1, false)?;
                self.pmm.dereference(pa, 1)?;
            }
        }
        Ok(())
    }
}

/// The kernel's address-space manager for this architecture.
pub type KernelSpaceManager = AddressSpaceManager<X86PageTables, HhdmMapper>;

static SPACE_MANAGER: Once<KernelSpaceManager> = Once::new();

/// Initializes the global manager around the address space the bootloader
/// handed us. Core 0 only, after the frame allocator.
pub fn init() -> Result<(), MemError> {
    let kernel_space = crate::memory::arch::current_address_space();
    SPACE_MANAGER.call_once(|| {
        AddressSpaceManager::new(HhdmMapper, frame_allocator(), kernel_space)
    });
    let manager = space_manager();
    manager.init_kernel_space()?;
    crate::memory::arch::flush_all();
    Ok(())
}

/// Handle on the global manager.
pub fn space_manager() -> &'static KernelSpaceManager {
    SPACE_MANAGER
        .get()
        .expect("address-space manager not initialized")
}

/// Like [`space_manager`], but usable from fault paths that may run
/// before bring-up finishes.
pub fn try_space_manager() -> Option<&'static KernelSpaceManager> {
    SPACE_MANAGER.get()
}

/// Creates an address space for a new process.
pub fn create_address_space() -> Result<AddressSpace, MemError> {
    space_manager().create_address_space()
}

/// Releases a process address space and every frame it still references.
pub fn free_address_space(space: AddressSpace) -> Result<(), MemError> {
    space_manager().free_address_space(space)
}

pub use crate::memory::arch::{current_address_space, switch_address_space};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::memory::PAGE_SIZE;
    use crate::memory::frames::test_allocator;
    use alloc::alloc::{alloc_zeroed, Layout};
    use alloc::boxed::Box;

    /// Fake physical addresses handed to the simulated pool start here.
    const FAKE_BASE: u64 = 0x10_0000;

    /// Table window over a heap-backed pool: fake physical addresses are
    /// plain offsets into an ordinary allocation.
    struct SimMapper {
        offset: u64,
    }

    impl TableMapper for SimMapper {
        fn map_table(&self, pa: u64) -> *mut u64 {
            self.offset.wrapping_add(pa) as *mut u64
        }
    }

    type SimManager = AddressSpaceManager<X86PageTables, SimMapper>;

    /// A manager over 128 simulated frames plus an empty address space.
    fn sim() -> (&'static SimManager, AddressSpace) {
        const PAGES: usize = 128;
        let layout = Layout::from_size_align(PAGES * PAGE_SIZE, PAGE_SIZE).unwrap();
        let pool = unsafe { alloc_zeroed(layout) };
        assert!(!pool.is_null());

        let pmm = test_allocator(PAGES, FAKE_BASE);
        let mapper = SimMapper {
            offset: (pool as u64).wrapping_sub(FAKE_BASE),
        };

        let root = pmm.reference(0, 1, 1).expect("root table allocation failed");
        let manager: &'static SimManager = Box::leak(Box::new(AddressSpaceManager::new(
            mapper,
            pmm,
            AddressSpace::from_root(root),
        )));
        manager.clean_table(root);
        (manager, AddressSpace::from_root(root))
    }

    /// The flag subset that must round-trip through map + query.
    fn round_trip_mask() -> MapFlags {
        MapFlags::READ
            | MapFlags::WRITE
            | MapFlags::EXEC
            | MapFlags::USER
            | MapFlags::HUGE
            | MapFlags::COW
    }

    #[test_case]
    fn map_query_round_trip() {
        let (vmm, space) = sim();
        let va = 0x1000_0000;
        let pa = 0x20_0000;
        let size = 4 * PAGE_SIZE as u64;
        let flags = MapFlags::READ | MapFlags::WRITE | MapFlags::USER;

        vmm.map(&space, va, pa, size, flags).expect("map failed");
        let mut off = 0;
        while off < size {
            let (got_pa, got_flags) = vmm.query(&space, va + off).expect("query failed");
            assert_eq!(got_pa, pa + off);
            assert_eq!(got_flags & round_trip_mask(), flags);
            off += PAGE_SIZE as u64;
        }

        // intra-page offsets resolve too
        let (got_pa, _) = vmm.query(&space, va + 0x123).unwrap();
        assert_eq!(got_pa, pa + 0x123);
    }

    #[test_case]
    fn unmap_then_query_is_not_mapped() {
        let (vmm, space) = sim();
        let va = 0x1000_0000;
        vmm.map(
            &space,
            va,
            0x20_0000,
            0x2000,
            MapFlags::READ | MapFlags::WRITE,
        )
        .unwrap();
        vmm.unmap(&space, va, 0x2000, false).unwrap();
        assert_eq!(vmm.query(&space, va), Err(MemError::NotMapped));
        assert_eq!(vmm.query(&space, va + 0x1000), Err(MemError::NotMapped));
    }

    #[test_case]
    fn double_map_is_rejected() {
        let (vmm, space) = sim();
        let va = 0x4000_0000;
        vmm.map(&space, va, 0x30_0000, 0x1000, MapFlags::READ).unwrap();
        assert_eq!(
            vmm.map(&space, va, 0x40_0000, 0x1000, MapFlags::READ),
            Err(MemError::AlreadyMapped)
        );
    }

    #[test_case]
    fn misaligned_arguments_are_rejected() {
        let (vmm, space) = sim();
        assert_eq!(
            vmm.map(&space, 0x1234, 0x20_0000, 0x1000, MapFlags::READ),
            Err(MemError::InvalidArg)
        );
        assert_eq!(
            vmm.map(&space, 0x1000, 0x20_0000, 0, MapFlags::READ),
            Err(MemError::InvalidArg)
        );
        assert_eq!(
            vmm.unmap(&space, 0x1000, 0x123, false),
            Err(MemError::InvalidArg)
        );
    }

    #[test_case]
    fn huge_mappings_resolve_at_their_level() {
        let (vmm, space) = sim();
        let va = 0x4020_0000; // 2 MiB aligned
        let pa = 0x20_0000;
        let flags = MapFlags::READ | MapFlags::WRITE | MapFlags::HUGE;
        vmm.map(&space, va, pa, 0x20_0000, flags).unwrap();

        let (got_pa, got_flags) = vmm.query(&space, va + 0x1000).unwrap();
        assert_eq!(got_pa, pa + 0x1000);
        assert!(got_flags.contains(MapFlags::HUGE));

        // the small-page path must refuse to unmap it
        assert_eq!(
            vmm.unmap(&space, va, PAGE_SIZE as u64, false),
            Err(MemError::InvalidArg)
        );
        // and the huge path must refuse small mappings
        let small_va = 0x1000_0000;
        vmm.map(&space, small_va, 0x30_0000, 0x1000, MapFlags::READ)
            .unwrap();
        assert_eq!(
            vmm.unmap(&space, 0x1000_0000 & !0x1F_FFFF, 0x20_0000, true),
            Err(MemError::InvalidArg)
        );

        vmm.unmap(&space, va, 0x20_0000, true).unwrap();
        assert_eq!(vmm.query(&space, va), Err(MemError::NotMapped));
    }

    #[test_case]
    fn software_markers_survive_unmap() {
        let (vmm, space) = sim();
        let va = 0x1000_0000;
        vmm.map(
            &space,
            va,
            0x20_0000,
            0x1000,
            MapFlags::READ | MapFlags::COW,
        )
        .unwrap();
        vmm.unmap(&space, va, 0x1000, false).unwrap();

        // not translatable, but the marker is still on the entry
        assert_eq!(vmm.query(&space, va), Err(MemError::NotMapped));
        assert!(vmm.entry_flags(&space, va).unwrap().contains(MapFlags::COW));
    }

    #[test_case]
    fn aor_reservations_are_never_present() {
        let (vmm, space) = sim();
        let va = 0x1000_0000;
        vmm.map(
            &space,
            va,
            0,
            0x1000,
            MapFlags::READ | MapFlags::WRITE | MapFlags::USER | MapFlags::AOR,
        )
        .unwrap();

        assert_eq!(vmm.query(&space, va), Err(MemError::NotMapped));
        let flags = vmm.entry_flags(&space, va).unwrap();
        assert!(flags.contains(MapFlags::AOR));
        assert!(flags.contains(MapFlags::WRITE));

        // backing it later is an ordinary map of the same leaf
        vmm.map(
            &space,
            va,
            0x50_0000,
            0x1000,
            MapFlags::READ | MapFlags::WRITE | MapFlags::USER,
        )
        .unwrap();
        let (pa, _) = vmm.query(&space, va).unwrap();
        assert_eq!(pa, 0x50_0000);
    }

    #[test_case]
    fn address_space_lifecycle_releases_frames() {
        let (vmm, _) = sim();
        let pmm = vmm.pmm;
        let before = pmm.free_frames();

        let space = vmm.create_address_space().expect("create failed");
        let frame = pmm.reference(0, 1, 1).expect("user frame");
        vmm.map(
            &space,
            0x1000_0000,
            frame,
            0x1000,
            MapFlags::READ | MapFlags::WRITE | MapFlags::USER,
        )
        .unwrap();

        vmm.free_address_space(space).expect("teardown failed");
        pmm.flush_pending();
        assert_eq!(pmm.free_frames(), before);
    }

    #[test_case]
    fn created_spaces_share_the_kernel_half() {
        let (vmm, kernel) = sim();
        // plant one kernel-half top-level entry, then clone the space
        let kernel_va = 0xFFFF_9000_0000_0000;
        vmm.map(
            &kernel,
            kernel_va,
            0x20_0000,
            0x1000,
            MapFlags::READ | MapFlags::WRITE,
        )
        .unwrap();

        let space = vmm.create_address_space().unwrap();
        let (pa, flags) = vmm.query(&space, kernel_va).expect("kernel half missing");
        assert_eq!(pa, 0x20_0000);
        assert!(flags.contains(MapFlags::KERNEL));

        // and the recursive slot points back at the root
        let root_view = vmm.mapper.map_table(space.root());
        let entry = unsafe { root_view.add(RECURSIVE_INDEX).read_volatile() };
        assert_eq!(X86PageTables::entry_addr(entry), space.root());
    }
}

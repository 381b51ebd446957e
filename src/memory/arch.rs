//! x86_64 page-table format
//!
//! The portable walker in [`crate::memory::paging`] is parameterized by a
//! [`PageTableFormat`] describing the translation hierarchy and by a
//! [`TableMapper`] giving it writable views of table pages. This module
//! provides both for x86_64: four 512-entry levels, 2 MiB huge pages at
//! level 1, and the higher-half direct map as the table window.

use x86_64::{
    registers::control::{Cr3, Cr3Flags},
    structures::paging::PhysFrame,
    PhysAddr,
};

use crate::constants::memory::KERNEL_HALF_START;
use crate::memory::paging::{AddressSpace, MapFlags, PageTableFormat, TableMapper};
use crate::memory::HHDM_OFFSET;

const PRESENT: u64 = 1 << 0;
const WRITABLE: u64 = 1 << 1;
const USER: u64 = 1 << 2;
const HUGE: u64 = 1 << 7;
// bits 9-10 are ignored by the MMU; we carry the copy-on-write and
// allocate-on-request markers there so they survive in non-present entries
const COW: u64 = 1 << 9;
const AOR: u64 = 1 << 10;
const NO_EXECUTE: u64 = 1 << 63;

const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// The 4-level x86_64 translation hierarchy.
pub struct X86PageTables;

impl PageTableFormat for X86PageTables {
    const LEVELS: usize = 4;
    const ENTRIES: usize = 512;

    #[inline]
    fn index_of(level: usize, va: u64) -> usize {
        ((va >> (12 + 9 * level)) & 0x1FF) as usize
    }

    #[inline]
    fn span(level: usize) -> u64 {
        4096 << (9 * level)
    }

    fn huge_level() -> Option<usize> {
        Some(1) // 2 MiB
    }

    fn encode(flags: MapFlags) -> u64 {
        let mut bits = 0;
        // AOR entries are reservations, not translations: present stays clear
        if flags.contains(MapFlags::READ) && !flags.contains(MapFlags::AOR) {
            bits |= PRESENT;
        }
        if flags.contains(MapFlags::WRITE) {
            bits |= WRITABLE;
        }
        if flags.contains(MapFlags::USER) {
            bits |= USER;
        }
        if flags.contains(MapFlags::HUGE) {
            bits |= HUGE;
        }
        if flags.contains(MapFlags::COW) {
            bits |= COW;
        }
        if flags.contains(MapFlags::AOR) {
            bits |= AOR;
        }
        if !flags.contains(MapFlags::EXEC) {
            bits |= NO_EXECUTE;
        }
        bits
    }

    fn decode(entry: u64) -> MapFlags {
        let mut flags = MapFlags::empty();
        if entry & PRESENT != 0 {
            flags |= MapFlags::READ;
        }
        if entry & WRITABLE != 0 {
            flags |= MapFlags::WRITE;
        }
        if entry & USER != 0 {
            flags |= MapFlags::USER;
        } else {
            flags |= MapFlags::KERNEL;
        }
        if entry & HUGE != 0 {
            flags |= MapFlags::HUGE;
        }
        if entry & COW != 0 {
            flags |= MapFlags::COW;
        }
        if entry & AOR != 0 {
            flags |= MapFlags::AOR;
        }
        if entry & NO_EXECUTE == 0 {
            flags |= MapFlags::EXEC;
        }
        flags
    }

    fn leaf_entry(pa: u64, flags: MapFlags) -> u64 {
        (pa & ADDR_MASK) | Self::encode(flags)
    }

    fn table_entry(pa: u64, user: bool) -> u64 {
        let mut bits = PRESENT | WRITABLE;
        if user {
            bits |= USER;
        }
        (pa & ADDR_MASK) | bits
    }

    #[inline]
    fn entry_addr(entry: u64) -> u64 {
        entry & ADDR_MASK
    }

    #[inline]
    fn is_present(entry: u64) -> bool {
        entry & PRESENT != 0
    }

    #[inline]
    fn is_huge(entry: u64) -> bool {
        entry & HUGE != 0
    }

    #[inline]
    fn unmapped(entry: u64) -> u64 {
        entry & !PRESENT
    }

    #[inline]
    fn user_half(va: u64) -> bool {
        va < KERNEL_HALF_START
    }
}

/// Table window through the bootloader's higher-half direct map.
pub struct HhdmMapper;

impl TableMapper for HhdmMapper {
    #[inline]
    fn map_table(&self, pa: u64) -> *mut u64 {
        ((*HHDM_OFFSET).as_u64() + pa) as *mut u64
    }
}

/// Reads the active top-level table from CR3.
pub fn current_address_space() -> AddressSpace {
    let (frame, _) = Cr3::read();
    AddressSpace::from_root(frame.start_address().as_u64())
}

/// Activates `space` on the calling core.
///
/// # Safety
/// The target tables must map the kernel half, including the code currently
/// executing.
pub unsafe fn switch_address_space(space: &AddressSpace) {
    let frame = PhysFrame::containing_address(PhysAddr::new(space.root()));
    Cr3::write(frame, Cr3Flags::empty());
}

/// Discards every cached translation on the calling core.
pub fn flush_all() {
    let (frame, flags) = Cr3::read();
    unsafe { Cr3::write(frame, flags) };
}

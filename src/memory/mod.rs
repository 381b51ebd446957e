//! Memory management
//!
//! Bring-up order matters: the frame allocator first (it only needs the
//! boot-reported map and a scratch region for its table), then the
//! address-space manager, then the heap that grows through both.

pub mod arch;
pub mod error;
pub mod frames;
pub mod heap;
pub mod paging;
pub mod tlb;

use arrayvec::ArrayVec;
use lazy_static::lazy_static;
use limine::memory_map::EntryType;
use limine::request::{HhdmRequest, KernelAddressRequest, MemoryMapRequest};
use x86_64::VirtAddr;

use crate::constants::memory::{LOW_RESERVED_BYTES, MAX_MEMORY_REGIONS, PAGE_SIZE};

#[used]
#[link_section = ".requests"]
pub static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

#[used]
#[link_section = ".requests"]
static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[link_section = ".requests"]
static KERNEL_ADDRESS_REQUEST: KernelAddressRequest = KernelAddressRequest::new();

extern "C" {
    static _kernel_end: u64;
}

lazy_static! {
    /// Base of the bootloader's higher-half direct map of physical memory.
    pub static ref HHDM_OFFSET: VirtAddr = VirtAddr::new(
        HHDM_REQUEST
            .get_response()
            .expect("HHDM request failed")
            .offset()
    );
}

/// One entry of the boot memory map.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub base: u64,
    pub page_count: usize,
    pub usable: bool,
}

/// Pre-mapped writable memory reserved for the frame table.
#[derive(Debug, Clone, Copy)]
pub struct ScratchRegion {
    pub virt: u64,
    pub len: usize,
}

/// Everything the memory subsystem consumes from the bootloader,
/// gathered once and handed to the initializers.
pub struct BootInfo {
    pub kernel_phys_start: u64,
    pub kernel_phys_end: u64,
    pub min_phys_addr: u64,
    pub max_phys_addr: u64,
    pub total_phys_bytes: usize,
    pub regions: ArrayVec<MemoryRegion, MAX_MEMORY_REGIONS>,
    pub frame_table_scratch: ScratchRegion,
    pub kernel_stack_top: u64,
}

/// Builds [`BootInfo`] from the Limine responses, carving the frame-table
/// scratch region out of the largest usable stretch of memory.
///
/// # Safety
/// Must run once, on the bootstrap core, while the Limine responses are
/// still mapped.
unsafe fn boot_info_from_limine() -> BootInfo {
    let memory_map = MEMORY_MAP_REQUEST
        .get_response()
        .expect("Memory map request failed");
    let kernel_address = KERNEL_ADDRESS_REQUEST
        .get_response()
        .expect("Kernel Address request failed");

    let kernel_phys_start = kernel_address.physical_base();
    let kernel_phys_end = (&_kernel_end as *const u64 as u64)
        .wrapping_sub(kernel_address.virtual_base())
        .wrapping_add(kernel_phys_start);

    // top of usable memory bounds the frame table
    let mut max_phys_addr = 0;
    let mut total_phys_bytes = 0;
    for entry in memory_map.entries().iter() {
        if entry.entry_type == EntryType::USABLE {
            max_phys_addr = max_phys_addr.max(entry.base + entry.length);
            total_phys_bytes += entry.length as usize;
        }
    }

    let scratch_len = frames::frame_table_bytes(0, max_phys_addr)
        .next_multiple_of(PAGE_SIZE);

    // host the table in the largest usable region above the reserved 1 MiB
    let host = memory_map
        .entries()
        .iter()
        .filter(|e| {
            e.entry_type == EntryType::USABLE
                && e.base >= LOW_RESERVED_BYTES
                && e.length as usize >= scratch_len
        })
        .max_by_key(|e| e.length)
        .expect("no usable region can hold the frame table");
    let scratch_phys = host.base;

    let mut regions = ArrayVec::new();
    for entry in memory_map.entries().iter() {
        if regions.is_full() {
            break;
        }
        let usable = entry.entry_type == EntryType::USABLE;
        let (base, length) = if usable && entry.base == scratch_phys {
            // the carved-out scratch pages never reach the free list
            (entry.base + scratch_len as u64, entry.length - scratch_len as u64)
        } else {
            (entry.base, entry.length)
        };
        regions.push(MemoryRegion {
            base,
            page_count: length as usize / PAGE_SIZE,
            usable,
        });
    }

    let kernel_stack_top: u64;
    core::arch::asm!("mov {}, rsp", out(reg) kernel_stack_top, options(nomem, nostack));

    BootInfo {
        kernel_phys_start,
        kernel_phys_end,
        min_phys_addr: 0,
        max_phys_addr,
        total_phys_bytes,
        regions,
        frame_table_scratch: ScratchRegion {
            virt: HHDM_OFFSET.as_u64() + scratch_phys,
            len: scratch_len,
        },
        kernel_stack_top,
    }
}

/// Brings up the whole memory subsystem. Only core 0 does real work; the
/// others find everything in place.
pub fn init(cpu_id: u32) {
    if cpu_id != 0 {
        return;
    }

    let info = unsafe { boot_info_from_limine() };
    unsafe {
        frames::init(&info);
    }
    paging::init().expect("address-space manager initialization failed");
    heap::init().expect("kernel heap initialization failed");

    log::info!(
        "memory online: {} MiB usable, frame table {} KiB, kernel at {:#x}..{:#x}",
        frames::frame_allocator().max_bytes() / (1024 * 1024),
        info.frame_table_scratch.len / 1024,
        info.kernel_phys_start,
        info.kernel_phys_end,
    );
}

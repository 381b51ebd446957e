//! - Interrupt Descriptor Table (IDT) setup
//!
//! This module provides:
//! - Interrupt Descriptor Table (IDT) setup
//! - Exception handlers (breakpoint, page fault, double fault)
//! - The TLB shootdown vector handler
//! - Functions to enable/disable interrupts
//!
//! The page-fault handler is where the software mapping markers come
//! alive: AOR reservations get their frame on first touch, COW pages are
//! copied on the first write.

use lazy_static::lazy_static;
use x86_64::{
    instructions::interrupts,
    structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode},
};

use crate::{
    constants::{
        gdt::DOUBLE_FAULT_IST_INDEX,
        idt::TLB_SHOOTDOWN_VECTOR,
        memory::PAGE_SIZE,
    },
    interrupts::x2apic,
    memory::{
        frames::frame_allocator,
        paging::{current_address_space, try_space_manager, MapFlags},
        tlb, HHDM_OFFSET,
    },
    serial_println,
};

lazy_static! {
    /// The system's Interrupt Descriptor Table.
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(DOUBLE_FAULT_IST_INDEX);
        }
        idt[TLB_SHOOTDOWN_VECTOR].set_handler_fn(tlb_shootdown_handler);
        idt
    };
}

/// Loads the IDT for the specified CPU core.
pub fn init_idt(_cpu_id: u32) {
    IDT.load();
}

/// Enables interrupts on the current CPU.
pub fn enable() {
    interrupts::enable();
}

/// Disables interrupts on the current CPU.
pub fn disable() {
    interrupts::disable();
}

/// Executes a closure with interrupts disabled.
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    interrupts::without_interrupts(f)
}

/// Handles breakpoint exceptions by printing debug information.
extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    serial_println!("EXCEPTION: BREAKPOINT\n{:#?}", stack_frame);
}

/// Handles double fault exceptions by panicking with debug information.
extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    panic!("EXCEPTION: DOUBLE FAULT\n{:#?}", stack_frame);
}

/// Backs an allocate-on-request reservation with a zeroed frame.
fn back_aor_page(page: u64, flags: MapFlags) -> bool {
    let vmm = match try_space_manager() {
        Some(vmm) => vmm,
        None => return false,
    };
    let space = current_address_space();

    let pa = match frame_allocator().reference(0, 1, 1) {
        Ok(pa) => pa,
        Err(_) => return false,
    };
    unsafe {
        let frame = (HHDM_OFFSET.as_u64() + pa) as *mut u8;
        core::ptr::write_bytes(frame, 0, PAGE_SIZE);
    }

    let backed = (flags - MapFlags::AOR) | MapFlags::READ;
    vmm.map(&space, page, pa, PAGE_SIZE as u64, backed).is_ok()
}

/// Splits a copy-on-write page for the faulting writer.
fn split_cow_page(page: u64, flags: MapFlags) -> bool {
    let vmm = match try_space_manager() {
        Some(vmm) => vmm,
        None => return false,
    };
    let space = current_address_space();

    let old_pa = match vmm.query(&space, page) {
        Ok((pa, _)) => pa,
        Err(_) => return false,
    };
    let new_pa = match frame_allocator().reference(0, 1, 1) {
        Ok(pa) => pa,
        Err(_) => return false,
    };

    unsafe {
        let src = (HHDM_OFFSET.as_u64() + old_pa) as *const u8;
        let dst = (HHDM_OFFSET.as_u64() + new_pa) as *mut u8;
        core::ptr::copy_nonoverlapping(src, dst, PAGE_SIZE);
    }

    // drop the shared translation everywhere before installing the
    // private writable one
    if vmm.unmap(&space, page, PAGE_SIZE as u64, false).is_err() {
        return false;
    }
    let private = (flags - MapFlags::COW) | MapFlags::READ | MapFlags::WRITE;
    if vmm.map(&space, page, new_pa, PAGE_SIZE as u64, private).is_err() {
        return false;
    }
    frame_allocator()
        .dereference(old_pa, 1)
        .expect("COW source frame had no owners");
    true
}

/// Handles page faults: resolves AOR and COW markers, reports anything
/// else as a fatal fault.
extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;

    let faulting_address = Cr2::read().expect("Cannot read faulting address").as_u64();
    let page = faulting_address & !(PAGE_SIZE as u64 - 1);

    if let Some(vmm) = try_space_manager() {
        let space = current_address_space();
        if let Ok(flags) = vmm.entry_flags(&space, faulting_address) {
            if flags.contains(MapFlags::AOR) && back_aor_page(page, flags) {
                return;
            }
            if flags.contains(MapFlags::COW)
                && error_code.contains(PageFaultErrorCode::CAUSED_BY_WRITE)
                && split_cow_page(page, flags)
            {
                return;
            }
        }
    }

    serial_println!(
        "EXCEPTION: PAGE FAULT\nFaulting Address: {:#x}\nError Code: {:?}\n{:#?}",
        faulting_address,
        error_code,
        stack_frame
    );
    panic!("PAGE FAULT!");
}

/// Remote end of [`tlb::shootdown`]: invalidate and acknowledge.
extern "x86-interrupt" fn tlb_shootdown_handler(_: InterruptStackFrame) {
    tlb::handle_shootdown_ipi();
    x2apic::send_eoi();
}

#![no_std]
#![no_main]
#![cfg_attr(test, feature(custom_test_frameworks))]
#![cfg_attr(test, test_runner(argon::test_runner))]
#![cfg_attr(test, reexport_test_harness_main = "test_main")]

extern crate alloc;
use alloc::boxed::Box;

use argon::constants::memory::PAGE_SIZE;
use argon::memory::error::MemError;
use argon::memory::frames::frame_allocator;
use argon::memory::paging::{space_manager, MapFlags};
use argon::{idle_loop, serial_println};

/// Free top-level slot used for the boot-time mapping smoke test.
const SCRATCH_VA: u64 = 0xFFFF_FD00_0000_0000;

#[no_mangle]
extern "C" fn kmain() -> ! {
    argon::init::init();

    #[cfg(test)]
    test_main();

    // heap smoke test
    let x: Box<i32> = Box::new(10);
    let y: Box<i32> = Box::new(20);
    serial_println!("Heap objects allocated at {:p} and {:p}", x, y);

    // map a fresh frame, touch it, and tear it down again
    let vmm = space_manager();
    let kernel = vmm.kernel_space();
    let frame = frame_allocator()
        .reference(0, 1, 1)
        .expect("no frame for the mapping smoke test");

    vmm.map(
        &kernel,
        SCRATCH_VA,
        frame,
        PAGE_SIZE as u64,
        MapFlags::READ | MapFlags::WRITE | MapFlags::KERNEL,
    )
    .expect("scratch mapping failed");

    let (phys, flags) = vmm.query(&kernel, SCRATCH_VA).expect("scratch page not mapped");
    serial_println!("{:#x} -> {:#x} ({:?})", SCRATCH_VA, phys, flags);

    unsafe {
        let p = SCRATCH_VA as *mut u64;
        p.write_volatile(0xC0FFEE);
        assert_eq!(p.read_volatile(), 0xC0FFEE);
    }

    serial_println!("Now unmapping the page");
    vmm.unmap(&kernel, SCRATCH_VA, PAGE_SIZE as u64, false)
        .expect("scratch unmap failed");
    match vmm.query(&kernel, SCRATCH_VA) {
        Err(MemError::NotMapped) => serial_println!("Translation failed, as expected"),
        other => panic!("stale translation after unmap: {:?}", other),
    }
    frame_allocator()
        .dereference(frame, 1)
        .expect("scratch frame release failed");

    serial_println!("BSP entering idle loop");
    idle_loop();
}

#[cfg(not(test))]
#[panic_handler]
fn rust_panic(info: &core::panic::PanicInfo) -> ! {
    serial_println!("Kernel panic: {}", info);
    idle_loop();
}

#[cfg(test)]
#[panic_handler]
fn rust_panic(info: &core::panic::PanicInfo) -> ! {
    argon::test_panic_handler(info)
}

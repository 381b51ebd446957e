//! Shared bring-up sequence for the boot and test entry points.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use limine::{
    request::{RequestsEndMarker, RequestsStartMarker, SmpRequest},
    smp::{Cpu, RequestFlags},
    BaseRevision,
};

use crate::{idle_loop, interrupts, logging, memory, serial_println};

#[used]
#[link_section = ".requests"]
static BASE_REVISION: BaseRevision = BaseRevision::new();

#[used]
#[link_section = ".requests"]
static SMP_REQUEST: SmpRequest = SmpRequest::new().with_flags(RequestFlags::X2APIC);

#[used]
#[link_section = ".requests_start_marker"]
static _START_MARKER: RequestsStartMarker = RequestsStartMarker::new();

#[used]
#[link_section = ".requests_end_marker"]
static _END_MARKER: RequestsEndMarker = RequestsEndMarker::new();

static BOOT_COMPLETE: AtomicBool = AtomicBool::new(false);
static CPU_COUNT: AtomicU64 = AtomicU64::new(0);

/// Brings up the BSP and every application core, in order: logging,
/// interrupts and the APIC, the memory subsystem, then the APs.
///
/// Returns the BSP's LAPIC id.
pub fn init() -> u32 {
    assert!(BASE_REVISION.is_supported());
    logging::init(0);
    serial_println!("Booting BSP...");

    interrupts::init(0);
    memory::init(0);

    let smp_response = SMP_REQUEST.get_response().expect("SMP request failed");
    let cpu_count = smp_response.cpus().len() as u64;
    let bsp_id = smp_response.bsp_lapic_id();

    serial_println!("Detected {} CPU cores", cpu_count);

    for cpu in smp_response.cpus() {
        if cpu.id != bsp_id {
            cpu.goto_address.write(secondary_cpu_main);
        }
    }

    while CPU_COUNT.load(Ordering::SeqCst) < cpu_count - 1 {
        core::hint::spin_loop();
    }

    BOOT_COMPLETE.store(true, Ordering::SeqCst);
    serial_println!("All CPUs initialized");

    interrupts::idt::enable();

    bsp_id
}

#[no_mangle]
unsafe extern "C" fn secondary_cpu_main(cpu: &Cpu) -> ! {
    interrupts::init(cpu.id);
    CPU_COUNT.fetch_add(1, Ordering::SeqCst);

    serial_println!("AP {} initialized", cpu.id);

    while !BOOT_COMPLETE.load(Ordering::SeqCst) {
        core::hint::spin_loop();
    }

    interrupts::idt::enable();
    serial_println!("AP {} entering idle loop", cpu.id);

    idle_loop();
}

//! Local APIC control and the online-core registry.
//!
//! Every core enables its LAPIC during bring-up and registers itself here;
//! the registry is what the TLB shootdown protocol consults to know who
//! else is online and where to send the IPI.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use raw_cpuid::CpuId;
use x2apic::lapic::{xapic_base, IpiDestMode, LocalApic, LocalApicBuilder};

use crate::constants::idt::{ERROR_VECTOR, SPURIOUS_VECTOR, TIMER_VECTOR};
use crate::constants::MAX_CORES;

#[derive(Debug)]
pub enum ApicError {
    ApicInitFailed,
}

fn lapic() -> Result<LocalApic, ApicError> {
    unsafe {
        LocalApicBuilder::new()
            .set_xapic_base(xapic_base())
            .timer_vector(TIMER_VECTOR)
            .error_vector(ERROR_VECTOR)
            .spurious_vector(SPURIOUS_VECTOR)
            .ipi_destination_mode(IpiDestMode::Physical)
            .build()
            .map_err(|_| ApicError::ApicInitFailed)
    }
}

/// Enables the local APIC on the calling core. The timer stays disarmed.
pub fn init() -> Result<(), ApicError> {
    let mut lapic = lapic()?;
    unsafe {
        lapic.enable();
        lapic.disable_timer();
    }
    Ok(())
}

/// Signal end-of-interrupt
#[inline(always)]
pub fn send_eoi() {
    if let Ok(mut lapic) = lapic() {
        unsafe {
            lapic.end_of_interrupt();
        }
    }
}

/// Send a fixed-vector IPI to the core with the given APIC id.
pub fn send_ipi(vector: u8, apic_id: u32) -> Result<(), ApicError> {
    let mut lapic = lapic()?;
    unsafe {
        lapic.send_ipi(vector, apic_id);
        // Wait for delivery
        while lapic.get_ipi_delivery_status() {
            core::hint::spin_loop();
        }
    }
    Ok(())
}

/// APIC id of the calling core, straight from CPUID.
pub fn current_core_id() -> u32 {
    CpuId::new()
        .get_feature_info()
        .map(|f| f.initial_local_apic_id() as u32)
        .unwrap_or(0)
}

// --- online-core registry ---

const UNREGISTERED: u32 = u32::MAX;

static ONLINE_COUNT: AtomicUsize = AtomicUsize::new(0);
static ONLINE_APIC_IDS: [AtomicU32; MAX_CORES] =
    [const { AtomicU32::new(UNREGISTERED) }; MAX_CORES];

/// Records the calling core as online. Every core does this exactly once
/// during bring-up, before it can receive shootdown IPIs.
pub fn register_core() {
    let slot = ONLINE_COUNT.fetch_add(1, Ordering::SeqCst);
    assert!(slot < MAX_CORES, "more cores than MAX_CORES");
    ONLINE_APIC_IDS[slot].store(current_core_id(), Ordering::SeqCst);
}

/// Number of cores currently online.
pub fn core_count() -> usize {
    ONLINE_COUNT.load(Ordering::SeqCst)
}

/// Sends `vector` to every online core except the caller.
pub fn send_ipi_all_other_cores(vector: u8) {
    let me = current_core_id();
    for slot in ONLINE_APIC_IDS.iter().take(core_count()) {
        let apic_id = slot.load(Ordering::SeqCst);
        if apic_id != UNREGISTERED && apic_id != me {
            send_ipi(vector, apic_id).expect("shootdown IPI send failed");
        }
    }
}

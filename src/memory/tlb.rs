//! Cross-core TLB coherence
//!
//! Unmapping changes translations that other cores may still hold in their
//! TLBs. One shared shootdown record, guarded by a dedicated initiator
//! lock, carries the affected range; every other online core is interrupted
//! on a fixed vector and acknowledges by decrementing the pending count.

use core::arch::asm;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use spin::Mutex;

use crate::constants::idt::TLB_SHOOTDOWN_VECTOR;
use crate::constants::memory::PAGE_SIZE;
use crate::interrupts::x2apic;

/// The one in-flight shootdown. `pending` counts cores that have not yet
/// acknowledged; the initiator spins on it.
struct ShootdownState {
    address: AtomicU64,
    size: AtomicU64,
    pending: AtomicU32,
}

static STATE: ShootdownState = ShootdownState {
    address: AtomicU64::new(0),
    size: AtomicU64::new(0),
    pending: AtomicU32::new(0),
};

/// Serializes initiators; remote handlers never take this.
static INITIATOR: Mutex<()> = Mutex::new(());

/// Shootdowns served by this kernel since boot (all cores).
static SERVED: AtomicU64 = AtomicU64::new(0);

/// Drops the calling core's cached translation for the page holding `va`.
#[inline]
pub fn invalidate_local(va: u64) {
    unsafe {
        asm!("invlpg [{}]", in(reg) va, options(nostack, preserves_flags));
    }
}

fn invalidate_range(va: u64, size: u64) {
    let mut page = va;
    while page < va + size {
        invalidate_local(page);
        page += PAGE_SIZE as u64;
    }
}

/// Forces every online core to drop its cached translations for
/// `[va, va + size)`. Blocks until all other cores have acknowledged.
pub fn shootdown(va: u64, size: u64) {
    if x2apic::core_count() <= 1 {
        invalidate_range(va, size);
        return;
    }

    let _guard = INITIATOR.lock();
    STATE.address.store(va, Ordering::SeqCst);
    STATE.size.store(size, Ordering::SeqCst);
    STATE
        .pending
        .store(x2apic::core_count() as u32 - 1, Ordering::SeqCst);

    x2apic::send_ipi_all_other_cores(TLB_SHOOTDOWN_VECTOR);
    invalidate_range(va, size);

    // No timeout here: the handler runs at the highest priority installed
    // for its vector, so a core that never acknowledges means the kernel
    // is already wedged.
    while STATE.pending.load(Ordering::SeqCst) != 0 {
        core::hint::spin_loop();
    }
}

/// Remote side, called from the shootdown interrupt handler: invalidate
/// the published range and acknowledge.
pub fn handle_shootdown_ipi() {
    let va = STATE.address.load(Ordering::SeqCst);
    let size = STATE.size.load(Ordering::SeqCst);
    invalidate_range(va, size);
    SERVED.fetch_add(1, Ordering::SeqCst);
    STATE.pending.fetch_sub(1, Ordering::SeqCst);
}

/// Shootdowns acknowledged on this kernel since boot.
pub fn served() -> u64 {
    SERVED.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn single_core_shootdown_completes() {
        // the test image keeps only the BSP online, so this must return
        // without waiting on anyone
        shootdown(0x5000, 0x3000);
        assert_eq!(STATE.pending.load(Ordering::SeqCst), 0);
    }

    #[test_case]
    fn handler_acknowledges_exactly_once() {
        STATE.address.store(0x7000, Ordering::SeqCst);
        STATE.size.store(0x2000, Ordering::SeqCst);
        STATE.pending.store(1, Ordering::SeqCst);

        let before = served();
        handle_shootdown_ipi();
        assert_eq!(served(), before + 1);
        assert_eq!(STATE.pending.load(Ordering::SeqCst), 0);
    }
}

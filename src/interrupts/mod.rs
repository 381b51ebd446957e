pub mod gdt;
pub mod idt;
pub mod x2apic;

/// Per-core interrupt bring-up: GDT, IDT, local APIC, and the online-core
/// registry the shootdown protocol relies on.
pub fn init(cpu_id: u32) {
    gdt::init(cpu_id);
    idt::init_idt(cpu_id);
    x2apic::init().expect("Failed to configure local APIC");
    x2apic::register_core();
}

#![feature(abi_x86_interrupt)]
#![no_std]
#![cfg_attr(test, no_main)]
#![cfg_attr(test, feature(custom_test_frameworks))]
#![cfg_attr(test, test_runner(crate::test_runner))]
#![cfg_attr(test, reexport_test_harness_main = "test_main")]
extern crate alloc;

use x86_64::instructions::hlt;

pub mod constants;
pub mod devices;
pub mod init;
pub mod interrupts;
pub mod logging;
pub mod memory;

pub use devices::serial;

pub mod prelude {
    pub use crate::debug_print;
    pub use crate::debug_println;
    pub use crate::serial_print;
    pub use crate::serial_println;
}

#[macro_export]
macro_rules! debug_print {
    ($($arg:tt)*) => {
        #[cfg(debug_assertions)]
        $crate::serial_print!($($arg)*);
    }
}

#[macro_export]
macro_rules! debug_println {
    ($($arg:tt)*) => {
        #[cfg(debug_assertions)]
        $crate::serial_println!($($arg)*);
    }
}

pub fn idle_loop() -> ! {
    loop {
        hlt();
    }
}

/// Exit codes understood by QEMU's isa-debug-exit device; the image
/// metadata declares `(Success << 1) | 1` as the passing exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

/// Leaves QEMU with `code`; halts forever if the exit device is absent.
pub fn exit_qemu(code: QemuExitCode) -> ! {
    use x86_64::instructions::port::Port;

    unsafe {
        let mut port = Port::new(crate::constants::ports::QEMU_EXIT_PORT);
        port.write(code as u32);
    }
    idle_loop();
}

/// Anything `#[test_case]` can point at.
pub trait Testable {
    fn run(&self);
}

impl<T: Fn()> Testable for T {
    fn run(&self) {
        serial_print!("{}...\t", core::any::type_name::<T>());
        self();
        serial_println!("[ok]");
    }
}

/// Runs every test and reports the result through the exit device.
pub fn test_runner(tests: &[&dyn Testable]) -> ! {
    serial_println!("Running {} tests", tests.len());
    for test in tests {
        test.run();
    }
    exit_qemu(QemuExitCode::Success);
}

pub fn test_panic_handler(info: &core::panic::PanicInfo) -> ! {
    serial_println!("[failed]");
    serial_println!("Error: {}", info);
    exit_qemu(QemuExitCode::Failed);
}

/// Entry point for the library's own test image.
#[cfg(test)]
#[no_mangle]
extern "C" fn kmain() -> ! {
    init::init();
    test_main();
    idle_loop();
}

#[cfg(test)]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    test_panic_handler(info)
}

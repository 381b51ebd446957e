//! Physical and virtual memory layout.

/// Size of a base page / physical frame in bytes.
pub const PAGE_SIZE: usize = 4096;
pub const FRAME_SIZE: usize = 4096;

/// Everything below this physical address is left untouched (legacy BIOS,
/// real-mode IVT, option-ROM scratch).
pub const LOW_RESERVED_BYTES: u64 = 0x10_0000; // 1 MiB

/// Upper bound on boot memory-map entries we track before the heap exists.
pub const MAX_MEMORY_REGIONS: usize = 64;

/// Start of the kernel half of every address space.
pub const KERNEL_HALF_START: u64 = 0xFFFF_8000_0000_0000;

// The kernel heap grows into a fixed virtual window in PML4 slot 508; the
// kernel image owns slot 511 and the recursive slot is 510.
pub const HEAP_WINDOW_START: u64 = 0xFFFF_FE00_0000_0000;
pub const HEAP_WINDOW_SIZE: usize = 1024 * 1024 * 1024; // 1 GiB

/// Minimum heap allocation granule; every payload is at least this aligned.
pub const HEAP_MIN_GRANULE: usize = 16;

/// Heap growth never maps less than this many bytes at once.
pub const HEAP_GROW_MIN_BYTES: usize = 32 * 1024;

/// Top-level slot through which an address space maps its own tables.
pub const RECURSIVE_INDEX: usize = 510;

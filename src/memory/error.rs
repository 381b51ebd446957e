//! Error taxonomy shared by the memory subsystem.
//!
//! Everything here is a recoverable return code. Conditions that mean the
//! allocator's own metadata can no longer be trusted (bad heap magic, double
//! free, freeing a referenced frame) panic instead.

/// Errors returned by the frame allocator, the address-space manager and
/// the kernel heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    /// Malformed input: misaligned address, zero count, non-power-of-two
    /// alignment, or an address outside the managed range. Never mutates
    /// state.
    InvalidArg,
    /// Resource exhaustion. Surfaced only after one reclamation pass and
    /// always recoverable by the caller.
    OutOfMemory,
    /// The requested translation does not exist.
    NotMapped,
    /// The target leaf entry is already present.
    AlreadyMapped,
    /// The architecture cannot represent the requested mapping class.
    Unsupported,
}

impl core::fmt::Display for MemError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MemError::InvalidArg => write!(f, "invalid argument"),
            MemError::OutOfMemory => write!(f, "out of physical memory"),
            MemError::NotMapped => write!(f, "address not mapped"),
            MemError::AlreadyMapped => write!(f, "address already mapped"),
            MemError::Unsupported => write!(f, "unsupported on this architecture"),
        }
    }
}

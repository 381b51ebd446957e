//! Physical page-frame allocator
//!
//! - Tracks every frame in `[min_addr, max_addr)` through a boot-time table
//! - Keeps free memory as a doubly linked list of contiguous runs in
//!   ascending address order, so coalescing is O(1) at the insertion point
//! - Frees batch onto an unsorted waiting list; [`FrameAllocator::flush_pending`]
//!   merges them back into the sorted list off the hot path
//! - Per-frame reference counts (lock-free atomics) keep copy-on-write and
//!   shared pages alive exactly as long as someone holds them

use core::mem::size_of;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use spin::{Mutex, Once};

use crate::constants::memory::{FRAME_SIZE, LOW_RESERVED_BYTES};
use crate::memory::error::MemError;
use crate::memory::BootInfo;

/// Sentinel index terminating the run lists.
const NIL: u32 = u32::MAX;

/// Per-frame bookkeeping. All fields are atomics so the table can be read
/// from any core; the link fields are only ever written under the free-list
/// lock, the reference count is lock-free.
///
/// * `refs`: owners of this frame. A frame with `refs > 0` is never linked
///   into the free list.
/// * `prev`/`next`: neighboring free-run heads, valid only on run heads
/// * `run`: length of the free run in frames, valid only on run heads
pub struct PageFrame {
    refs: AtomicU32,
    prev: AtomicU32,
    next: AtomicU32,
    run: AtomicU32,
}

impl PageFrame {
    const fn new() -> Self {
        PageFrame {
            refs: AtomicU32::new(0),
            prev: AtomicU32::new(NIL),
            next: AtomicU32::new(NIL),
            run: AtomicU32::new(0),
        }
    }
}

/// Free-list state guarded by the allocator spinlock.
struct FreeList {
    /// Head of the address-ordered run list.
    free_head: u32,
    /// Head of the unsorted waiting list of freed runs.
    waiting_head: u32,
    /// Frames in either list.
    free_frames: usize,
}

/// The physical memory manager. One long-lived instance, initialized once
/// from boot information and never torn down.
pub struct FrameAllocator {
    frames: &'static [PageFrame],
    min_addr: u64,
    max_addr: u64,
    max_bytes: usize,
    used_bytes: AtomicUsize,
    free: Mutex<FreeList>,
}

/// Bytes of scratch memory needed for the frame table covering
/// `[min_addr, max_addr)`.
pub fn frame_table_bytes(min_addr: u64, max_addr: u64) -> usize {
    ((max_addr - min_addr) as usize / FRAME_SIZE) * size_of::<PageFrame>()
}

impl FrameAllocator {
    /// Builds the frame table in the boot-reported scratch region and seeds
    /// the free list from the usable regions, skipping the first 1 MiB.
    ///
    /// # Safety
    /// `info.frame_table_scratch` must point to writable, unaliased memory
    /// of at least [`frame_table_bytes`] bytes that stays mapped for the
    /// lifetime of the kernel.
    pub unsafe fn from_boot_info(info: &BootInfo) -> Self {
        let min_addr = info.min_phys_addr;
        let max_addr = info.max_phys_addr;
        let frame_count = (max_addr - min_addr) as usize / FRAME_SIZE;

        let scratch = &info.frame_table_scratch;
        assert!(
            scratch.len >= frame_count * size_of::<PageFrame>(),
            "frame table scratch region too small: {} < {}",
            scratch.len,
            frame_count * size_of::<PageFrame>()
        );

        let table = scratch.virt as *mut PageFrame;
        for i in 0..frame_count {
            table.add(i).write(PageFrame::new());
        }

        let allocator = FrameAllocator {
            frames: core::slice::from_raw_parts(table, frame_count),
            min_addr,
            max_addr,
            max_bytes: 0,
            used_bytes: AtomicUsize::new(0),
            free: Mutex::new(FreeList {
                free_head: NIL,
                waiting_head: NIL,
                free_frames: 0,
            }),
        };

        allocator.seed(info)
    }

    /// Threads one run per maximal contiguous stretch of usable frames.
    fn seed(mut self, info: &BootInfo) -> Self {
        let mut list = self.free.lock();
        let mut tail = NIL;
        let mut seeded = 0usize;

        for region in info.regions.iter().filter(|r| r.usable) {
            let start = region
                .base
                .max(LOW_RESERVED_BYTES)
                .max(self.min_addr)
                .next_multiple_of(FRAME_SIZE as u64);
            let end = (region.base + (region.page_count * FRAME_SIZE) as u64).min(self.max_addr);
            if end <= start {
                continue;
            }

            let idx = ((start - self.min_addr) / FRAME_SIZE as u64) as u32;
            let count = ((end - start) / FRAME_SIZE as u64) as u32;
            debug_assert!(tail == NIL || idx > tail, "memory map regions out of order");

            if tail != NIL && tail + self.frame(tail).run.load(Ordering::Relaxed) == idx {
                // adjacent to the previous region, one longer run
                self.frame(tail).run.fetch_add(count, Ordering::Relaxed);
            } else {
                let head = self.frame(idx);
                head.prev.store(tail, Ordering::Relaxed);
                head.next.store(NIL, Ordering::Relaxed);
                head.run.store(count, Ordering::Relaxed);
                if tail == NIL {
                    list.free_head = idx;
                } else {
                    self.frame(tail).next.store(idx, Ordering::Relaxed);
                }
                tail = idx;
            }
            seeded += count as usize;
        }

        list.free_frames = seeded;
        drop(list);
        self.max_bytes = seeded * FRAME_SIZE;
        self
    }

    #[inline]
    fn frame(&self, idx: u32) -> &PageFrame {
        &self.frames[idx as usize]
    }

    #[inline]
    fn addr_of(&self, idx: u32) -> u64 {
        self.min_addr + idx as u64 * FRAME_SIZE as u64
    }

    #[inline]
    fn index_of(&self, addr: u64) -> u32 {
        ((addr - self.min_addr) / FRAME_SIZE as u64) as u32
    }

    fn check_range(&self, start: u64, count: usize) -> Result<(), MemError> {
        if count == 0
            || start % FRAME_SIZE as u64 != 0
            || start < self.min_addr
            || start + (count * FRAME_SIZE) as u64 > self.max_addr
        {
            return Err(MemError::InvalidArg);
        }
        Ok(())
    }

    /// Allocates `count` contiguous frames whose start address is aligned
    /// to `align` frames. Runs one reclamation pass before reporting
    /// exhaustion.
    pub fn allocate(&self, count: usize, align: usize) -> Result<u64, MemError> {
        if count == 0 || align == 0 || !align.is_power_of_two() {
            return Err(MemError::InvalidArg);
        }
        if let Some(addr) = self.take_run(count, align) {
            return Ok(addr);
        }
        self.reclaim();
        self.take_run(count, align).ok_or(MemError::OutOfMemory)
    }

    /// Allocates `count` frames one at a time into `out`; the frames need
    /// not be contiguous. All-or-nothing: any failure rolls back every
    /// frame already taken by this call.
    pub fn allocate_scattered(&self, out: &mut [u64], align: usize) -> Result<(), MemError> {
        for i in 0..out.len() {
            match self.allocate(1, align) {
                Ok(addr) => out[i] = addr,
                Err(e) => {
                    for &addr in &out[..i] {
                        self.free(addr, 1).expect("rollback of fresh frame failed");
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Returns `count` frames starting at `start` to the allocator. The
    /// frames land on the waiting list; the sorted merge happens in
    /// [`FrameAllocator::flush_pending`].
    pub fn free(&self, start: u64, count: usize) -> Result<(), MemError> {
        self.check_range(start, count)?;

        let idx = self.index_of(start);
        for i in 0..count as u32 {
            let refs = self.frame(idx + i).refs.load(Ordering::SeqCst);
            if refs != 0 {
                panic!(
                    "freeing frame {:#x} with {} live references",
                    self.addr_of(idx + i),
                    refs
                );
            }
        }

        let mut list = self.free.lock();
        let head = self.frame(idx);
        head.run.store(count as u32, Ordering::Relaxed);
        head.prev.store(NIL, Ordering::Relaxed);
        head.next.store(list.waiting_head, Ordering::Relaxed);
        list.waiting_head = idx;
        list.free_frames += count;
        drop(list);

        self.used_bytes.fetch_sub(count * FRAME_SIZE, Ordering::SeqCst);
        Ok(())
    }

    /// Drains the waiting list into the address-ordered free list, merging
    /// each run with physically adjacent neighbors.
    pub fn flush_pending(&self) {
        let mut list = self.free.lock();
        while list.waiting_head != NIL {
            let idx = list.waiting_head;
            let head = self.frame(idx);
            list.waiting_head = head.next.load(Ordering::Relaxed);
            let count = head.run.load(Ordering::Relaxed);
            self.insert_run(&mut list, idx, count);
        }
    }

    /// Increments the reference count on `count` frames at `start`. With
    /// `start == 0`, allocates first and hands back the referenced frames;
    /// this is the allocation entry point for every consumer above the
    /// frame layer.
    pub fn reference(&self, start: u64, count: usize, align: usize) -> Result<u64, MemError> {
        let start = if start == 0 {
            self.allocate(count, align)?
        } else {
            self.check_range(start, count)?;
            start
        };

        let idx = self.index_of(start);
        for i in 0..count as u32 {
            self.frame(idx + i).refs.fetch_add(1, Ordering::SeqCst);
        }
        Ok(start)
    }

    /// Decrements the reference count on `count` frames at `start`; a frame
    /// whose count reaches zero is freed. Dropping a counter that is
    /// already zero is an error and leaves that frame untouched.
    pub fn dereference(&self, start: u64, count: usize) -> Result<(), MemError> {
        self.check_range(start, count)?;

        let idx = self.index_of(start);
        for i in 0..count as u32 {
            let frame = self.frame(idx + i);
            let mut refs = frame.refs.load(Ordering::SeqCst);
            loop {
                if refs == 0 {
                    return Err(MemError::InvalidArg);
                }
                match frame.refs.compare_exchange(
                    refs,
                    refs - 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => break,
                    Err(current) => refs = current,
                }
            }
            if refs == 1 {
                self.free(self.addr_of(idx + i), 1)
                    .expect("freeing a fully dereferenced frame failed");
            }
        }
        Ok(())
    }

    /// Bytes currently allocated out of the free lists.
    pub fn used_bytes(&self) -> usize {
        self.used_bytes.load(Ordering::SeqCst)
    }

    /// Total allocatable bytes seeded at boot.
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Frames in the free list plus the waiting list.
    pub fn free_frames(&self) -> usize {
        self.free.lock().free_frames
    }

    /// First-fit search over the sorted run list. Returns the physical
    /// address of the carved range.
    fn take_run(&self, count: usize, align: usize) -> Option<u64> {
        // fast exhaustion check without touching the lists
        if self.used_bytes() + count * FRAME_SIZE > self.max_bytes {
            return None;
        }

        let align_bytes = (align * FRAME_SIZE) as u64;
        let mut list = self.free.lock();
        let mut cur = list.free_head;
        while cur != NIL {
            let run = self.frame(cur).run.load(Ordering::Relaxed) as usize;
            let base = self.addr_of(cur);
            let aligned = base.next_multiple_of(align_bytes);
            let skip = ((aligned - base) / FRAME_SIZE as u64) as usize;
            if skip + count <= run {
                let start = cur + skip as u32;
                self.carve(&mut list, cur, start, count as u32);
                drop(list);
                self.used_bytes.fetch_add(count * FRAME_SIZE, Ordering::SeqCst);
                return Some(self.addr_of(start));
            }
            cur = self.frame(cur).next.load(Ordering::Relaxed);
        }
        None
    }

    /// One reclamation pass: ask the heap to return page-aligned free
    /// blocks, then merge everything pending. Called at most once per
    /// failed allocation.
    fn reclaim(&self) {
        crate::memory::heap::return_memory();
        self.flush_pending();
    }

    /// Carves `[start, start + count)` out of the run headed at `head`,
    /// re-threading the left and right remainders in place.
    fn carve(&self, list: &mut FreeList, head: u32, start: u32, count: u32) {
        let run = self.frame(head).run.load(Ordering::Relaxed);
        let prev = self.frame(head).prev.load(Ordering::Relaxed);
        let next = self.frame(head).next.load(Ordering::Relaxed);
        let left = start - head;
        let right = head + run - (start + count);

        let mut link = prev;
        for (h, len) in [(head, left), (start + count, right)] {
            if len == 0 {
                continue;
            }
            let frame = self.frame(h);
            frame.prev.store(link, Ordering::Relaxed);
            frame.run.store(len, Ordering::Relaxed);
            if link == NIL {
                list.free_head = h;
            } else {
                self.frame(link).next.store(h, Ordering::Relaxed);
            }
            link = h;
        }

        if link == NIL {
            list.free_head = next;
        } else {
            self.frame(link).next.store(next, Ordering::Relaxed);
        }
        if next != NIL {
            self.frame(next).prev.store(link, Ordering::Relaxed);
        }

        self.frame(start).run.store(0, Ordering::Relaxed);
        list.free_frames -= count as usize;
    }

    /// Sorted insertion with O(1) coalescing against both neighbors.
    fn insert_run(&self, list: &mut FreeList, idx: u32, mut count: u32) {
        let mut next = list.free_head;
        let mut prev = NIL;
        while next != NIL && next < idx {
            prev = next;
            next = self.frame(next).next.load(Ordering::Relaxed);
        }

        // fuse with the right neighbor by absorbing it
        if next != NIL && idx + count == next {
            count += self.frame(next).run.load(Ordering::Relaxed);
            let after = self.frame(next).next.load(Ordering::Relaxed);
            next = after;
        }

        // fuse with the left neighbor in place
        if prev != NIL
            && prev + self.frame(prev).run.load(Ordering::Relaxed) == idx
        {
            self.frame(prev)
                .run
                .store(self.frame(prev).run.load(Ordering::Relaxed) + count, Ordering::Relaxed);
            self.frame(prev).next.store(next, Ordering::Relaxed);
            if next != NIL {
                self.frame(next).prev.store(prev, Ordering::Relaxed);
            }
            return;
        }

        let frame = self.frame(idx);
        frame.prev.store(prev, Ordering::Relaxed);
        frame.next.store(next, Ordering::Relaxed);
        frame.run.store(count, Ordering::Relaxed);
        if prev == NIL {
            list.free_head = idx;
        } else {
            self.frame(prev).next.store(idx, Ordering::Relaxed);
        }
        if next != NIL {
            self.frame(next).prev.store(idx, Ordering::Relaxed);
        }
    }
}

/// Builds a leaked allocator over one fake usable region of `pages` frames
/// starting at `base`. Shared by the allocator and walker tests.
#[cfg(test)]
pub(crate) fn test_allocator(pages: usize, base: u64) -> &'static FrameAllocator {
    use crate::memory::{MemoryRegion, ScratchRegion};
    use alloc::{boxed::Box, vec};
    use arrayvec::ArrayVec;

    let max = base + (pages * FRAME_SIZE) as u64;
    let scratch_len = frame_table_bytes(base, max);
    // u64 backing keeps the table aligned for PageFrame
    let scratch = vec![0u64; scratch_len / 8 + 1].leak();

    let mut regions = ArrayVec::new();
    regions.push(MemoryRegion {
        base,
        page_count: pages,
        usable: true,
    });

    let info = BootInfo {
        kernel_phys_start: 0,
        kernel_phys_end: 0,
        min_phys_addr: base,
        max_phys_addr: max,
        total_phys_bytes: pages * FRAME_SIZE,
        regions,
        frame_table_scratch: ScratchRegion {
            virt: scratch.as_mut_ptr() as u64,
            len: scratch.len() * 8,
        },
        kernel_stack_top: 0,
    };

    Box::leak(Box::new(unsafe { FrameAllocator::from_boot_info(&info) }))
}

/// Global frame allocator, set once during early boot.
static FRAME_ALLOCATOR: Once<FrameAllocator> = Once::new();

/// Initializes the global allocator from boot information. Core 0 only.
///
/// # Safety
/// See [`FrameAllocator::from_boot_info`].
pub unsafe fn init(info: &BootInfo) {
    FRAME_ALLOCATOR.call_once(|| FrameAllocator::from_boot_info(info));
}

/// Handle on the global allocator.
pub fn frame_allocator() -> &'static FrameAllocator {
    FRAME_ALLOCATOR
        .get()
        .expect("frame allocator not initialized")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::memory::PAGE_SIZE;

    /// Allocator over a fake region of `pages` frames starting at 1 MiB.
    fn fresh(pages: usize) -> &'static FrameAllocator {
        test_allocator(pages, LOW_RESERVED_BYTES)
    }

    #[test_case]
    fn seed_counts_usable_frames() {
        let pmm = fresh(256);
        assert_eq!(pmm.free_frames(), 256);
        assert_eq!(pmm.max_bytes(), 256 * PAGE_SIZE);
        assert_eq!(pmm.used_bytes(), 0);
    }

    #[test_case]
    fn allocate_free_flush_restores_counts() {
        let pmm = fresh(256);
        let addr = pmm.allocate(10, 1).expect("allocation failed");
        assert_eq!(pmm.free_frames(), 246);
        assert_eq!(pmm.used_bytes(), 10 * PAGE_SIZE);

        pmm.free(addr, 10).expect("free failed");
        pmm.flush_pending();
        assert_eq!(pmm.free_frames(), 256);
        assert_eq!(pmm.used_bytes(), 0);

        // the merged list must again hold one run covering everything
        let all = pmm.allocate(256, 1).expect("region did not coalesce");
        pmm.free(all, 256).unwrap();
        pmm.flush_pending();
    }

    #[test_case]
    fn freeing_in_either_order_coalesces() {
        let pmm = fresh(64);
        let a = pmm.allocate(4, 1).unwrap();
        let b = pmm.allocate(4, 1).unwrap();
        let c = pmm.allocate(4, 1).unwrap();

        // middle first, then its neighbors
        pmm.free(b, 4).unwrap();
        pmm.free(c, 4).unwrap();
        pmm.free(a, 4).unwrap();
        pmm.flush_pending();
        assert_eq!(pmm.free_frames(), 64);
        assert!(pmm.allocate(64, 1).is_ok());
    }

    #[test_case]
    fn aligned_allocation() {
        let pmm = fresh(128);
        // force the head of the list off alignment
        let _pad = pmm.allocate(1, 1).unwrap();
        for align in [2usize, 8, 16] {
            let addr = pmm.allocate(3, align).expect("aligned allocation failed");
            assert_eq!(addr % (align * PAGE_SIZE) as u64, 0);
        }
    }

    #[test_case]
    fn malformed_arguments_are_rejected() {
        let pmm = fresh(16);
        assert_eq!(pmm.allocate(0, 1), Err(MemError::InvalidArg));
        assert_eq!(pmm.allocate(1, 3), Err(MemError::InvalidArg));
        assert_eq!(pmm.allocate(1, 0), Err(MemError::InvalidArg));
        assert_eq!(pmm.free(0x123, 1), Err(MemError::InvalidArg));
        assert_eq!(pmm.dereference(LOW_RESERVED_BYTES, 0), Err(MemError::InvalidArg));
        // nothing above may have changed state
        assert_eq!(pmm.free_frames(), 16);
        assert_eq!(pmm.used_bytes(), 0);
    }

    #[test_case]
    fn exhaustion_is_recoverable() {
        let pmm = fresh(8);
        let addr = pmm.allocate(8, 1).unwrap();
        assert_eq!(pmm.allocate(1, 1), Err(MemError::OutOfMemory));
        pmm.free(addr, 8).unwrap();
        // the reclamation pass inside allocate merges the waiting list
        assert!(pmm.allocate(8, 1).is_ok());
    }

    #[test_case]
    fn refcounts_free_exactly_once() {
        let pmm = fresh(32);
        let addr = pmm.reference(0, 1, 1).expect("reference-allocate failed");
        assert_eq!(pmm.free_frames(), 31);

        // two more owners, three drops
        pmm.reference(addr, 1, 1).unwrap();
        pmm.reference(addr, 1, 1).unwrap();
        pmm.dereference(addr, 1).unwrap();
        pmm.dereference(addr, 1).unwrap();
        assert_eq!(pmm.free_frames(), 31);
        pmm.dereference(addr, 1).unwrap();
        pmm.flush_pending();
        assert_eq!(pmm.free_frames(), 32);

        // one drop too many
        assert_eq!(pmm.dereference(addr, 1), Err(MemError::InvalidArg));
    }

    #[test_case]
    fn used_bytes_tracks_referenced_frames() {
        let pmm = fresh(64);
        let a = pmm.reference(0, 5, 1).unwrap();
        let b = pmm.reference(0, 3, 1).unwrap();

        let referenced: usize = (0..pmm.frames.len())
            .filter(|&i| pmm.frames[i].refs.load(Ordering::SeqCst) > 0)
            .count();
        assert_eq!(pmm.used_bytes(), referenced * PAGE_SIZE);

        pmm.dereference(a, 5).unwrap();
        pmm.dereference(b, 3).unwrap();
        assert_eq!(pmm.used_bytes(), 0);
    }

    #[test_case]
    fn scattered_allocation_rolls_back() {
        let pmm = fresh(4);
        let mut out = [0u64; 8];
        assert_eq!(pmm.allocate_scattered(&mut out, 1), Err(MemError::OutOfMemory));
        pmm.flush_pending();
        assert_eq!(pmm.free_frames(), 4);

        let mut out = [0u64; 4];
        assert!(pmm.allocate_scattered(&mut out, 1).is_ok());
        assert!(out.iter().all(|&a| a != 0));
    }
}

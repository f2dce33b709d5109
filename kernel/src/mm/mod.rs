//! Memory Management Subsystem
//!
//! Provides physical and virtual memory management:
//! - Physical frame allocator (reference counted, first-fit)
//! - Page table (two-level, sparse)
//! - Per-process address spaces with copy-on-write fork
//!
//! # Address Space Layout
//!
//! ```text
//! Virtual Address Space (TASK_SIZE, 64MB by default):
//!
//! TASK_SIZE             ┌──────────────────────┐
//!                       │  (guard page)        │
//! stack_top             ├──────────────────────┤
//!                       │    User Stack  ↓     │
//!                       │                      │
//!                       │    User Heap   ↑     │
//! data_end .. brk       ├──────────────────────┤
//!                       │    Data              │
//! data_start            ├──────────────────────┤
//!                       │    Code              │
//! code_start (0)        └──────────────────────┘
//! ```

pub mod frame;
pub mod page;
pub mod virt;

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;

use crate::{KernelConfig, KernelResult, PAGE_SHIFT, PAGE_SIZE};

pub use frame::{FrameAllocator, FrameId};
pub use page::{PageFlags, PageTable, PageTableEntry, ENTRIES_PER_TABLE};
pub use virt::{AddressSpace, RegionKind};

/// Shared handle to the physical frame allocator.
///
/// Every method is one critical section on the allocator lock. Address spaces
/// hold a clone; the allocator is the only state siblings share.
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<Mutex<FrameAllocator>>,
}

impl FramePool {
    /// Wrap an allocator
    pub fn new(allocator: FrameAllocator) -> Self {
        Self {
            inner: Arc::new(Mutex::new(allocator)),
        }
    }

    /// Build the pool described by a configuration
    pub fn from_config(config: &KernelConfig) -> Self {
        Self::new(FrameAllocator::new(config.total_frames(), config.reserved_frames()))
    }

    /// Lock the allocator for a compound operation
    pub fn lock(&self) -> MutexGuard<'_, FrameAllocator> {
        self.inner.lock()
    }

    /// Allocate a physical frame
    pub fn allocate(&self) -> KernelResult<FrameId> {
        self.inner.lock().allocate()
    }

    /// Free a physical frame
    pub fn free(&self, frame: FrameId) {
        self.inner.lock().free(frame)
    }

    /// Add a sharer to a frame
    pub fn increment_ref(&self, frame: FrameId) -> KernelResult<()> {
        self.inner.lock().increment_ref(frame)
    }

    /// Get a frame's reference count
    pub fn ref_count(&self, frame: FrameId) -> u32 {
        self.inner.lock().ref_count(frame)
    }

    /// Get number of free frames
    pub fn free_frames(&self) -> usize {
        self.inner.lock().free_frames()
    }

    /// Get total number of frames
    pub fn total_frames(&self) -> usize {
        self.inner.lock().total_frames()
    }

    /// Usage snapshot
    pub fn stats(&self) -> MemoryStats {
        let alloc = self.inner.lock();
        MemoryStats::new(alloc.total_frames(), alloc.free_frames())
    }
}

/// Memory usage snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    /// Total frames
    pub total_frames: usize,
    /// Free frames
    pub free_frames: usize,
    /// Frames in use
    pub used_frames: usize,
    /// Bytes in use
    pub used_bytes: usize,
    /// Bytes free
    pub free_bytes: usize,
}

impl MemoryStats {
    fn new(total_frames: usize, free_frames: usize) -> Self {
        let used_frames = total_frames - free_frames;
        Self {
            total_frames,
            free_frames,
            used_frames,
            used_bytes: used_frames * PAGE_SIZE,
            free_bytes: free_frames * PAGE_SIZE,
        }
    }
}

impl std::fmt::Display for MemoryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} frames used, {} KB free",
            self.used_frames,
            self.total_frames,
            self.free_bytes / 1024
        )
    }
}

/// Physical address type (newtype for type safety)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl PhysAddr {
    /// Create new physical address
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get raw address value
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Frame containing this address
    pub const fn frame(self) -> FrameId {
        FrameId((self.0 >> PAGE_SHIFT) as usize)
    }
}

/// Virtual address type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(u64);

impl VirtAddr {
    /// Create new virtual address
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// First address of a virtual page
    pub const fn from_page(vpage: usize) -> Self {
        Self((vpage as u64) << PAGE_SHIFT)
    }

    /// Get raw address value
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Virtual page number
    pub const fn page_number(self) -> usize {
        (self.0 >> PAGE_SHIFT) as usize
    }

    /// Offset within the page
    pub const fn page_offset(self) -> usize {
        (self.0 & (PAGE_SIZE as u64 - 1)) as usize
    }

    /// Align down to page boundary
    pub const fn align_down(self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u64 - 1))
    }

    /// Align up to page boundary, or `None` past the top of the address range
    pub const fn align_up(self) -> Option<Self> {
        match self.0.checked_add(PAGE_SIZE as u64 - 1) {
            Some(addr) => Some(Self(addr & !(PAGE_SIZE as u64 - 1))),
            None => None,
        }
    }

    /// Check if aligned
    pub const fn is_aligned(self) -> bool {
        self.0 & (PAGE_SIZE as u64 - 1) == 0
    }

    /// Address `offset` bytes further on, or `None` if that wraps
    pub const fn offset(self, offset: u64) -> Option<Self> {
        match self.0.checked_add(offset) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }
}

impl From<u64> for VirtAddr {
    fn from(addr: u64) -> Self {
        Self::new(addr)
    }
}

impl std::fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virt_addr_decomposition() {
        let va = VirtAddr::new(5 * PAGE_SIZE as u64 + 10);
        assert_eq!(va.page_number(), 5);
        assert_eq!(va.page_offset(), 10);
        assert_eq!(VirtAddr::from_page(5).offset(10), Some(va));
    }

    #[test]
    fn test_alignment() {
        let va = VirtAddr::new(0x1001);
        assert_eq!(va.align_down().as_u64(), 0x1000);
        assert_eq!(va.align_up(), Some(VirtAddr::new(0x2000)));
        assert!(!va.is_aligned());
        assert_eq!(VirtAddr::new(0x2000).align_up(), Some(VirtAddr::new(0x2000)));
    }

    #[test]
    fn test_arithmetic_at_top_of_range() {
        let top = VirtAddr::new(u64::MAX);
        assert_eq!(top.align_up(), None);
        let last_page = VirtAddr::new(u64::MAX).align_down();
        assert_eq!(last_page.align_up(), Some(last_page));
        assert_eq!(top.offset(1), None);
        assert_eq!(top.offset(0), Some(top));
    }

    #[test]
    fn test_pool_stats() {
        let pool = FramePool::new(FrameAllocator::new(8, 2));
        let frame = pool.allocate().unwrap();

        let stats = pool.stats();
        assert_eq!(stats.total_frames, 8);
        assert_eq!(stats.used_frames, 3);
        assert_eq!(stats.free_bytes, 5 * PAGE_SIZE);

        pool.free(frame);
        assert_eq!(pool.free_frames(), 6);
        assert_eq!(frame.base().frame(), frame);
    }

    #[test]
    fn test_pool_from_config() {
        let pool = FramePool::from_config(&KernelConfig::default());
        assert_eq!(pool.total_frames(), 4096);
        assert_eq!(pool.free_frames(), 4096 - 256);
    }
}

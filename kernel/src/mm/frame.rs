//! Physical Frame Allocator
//!
//! Owns the simulated RAM. Frames are handed out first-fit and carry a
//! reference count so copy-on-write siblings can share them; a frame is free
//! exactly when its count is zero.

use std::fmt;

use super::PhysAddr;
use crate::{KernelError, KernelResult, PAGE_SIZE};

/// Physical frame number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(pub usize);

impl FrameId {
    /// Get raw value
    pub fn value(&self) -> usize {
        self.0
    }

    /// Physical address of the first byte of the frame
    pub fn base(&self) -> PhysAddr {
        PhysAddr::new((self.0 * PAGE_SIZE) as u64)
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Physical frame allocator with per-frame reference counts
pub struct FrameAllocator {
    /// Backing store for all frames
    memory: Vec<u8>,
    /// Reference count per frame (0 = free)
    ref_counts: Vec<u32>,
    /// Total number of frames
    total_frames: usize,
    /// Number of free frames
    free_count: usize,
}

impl FrameAllocator {
    /// Create an allocator over `total_frames` frames, the first
    /// `reserved_frames` of which belong to the kernel forever.
    pub fn new(total_frames: usize, reserved_frames: usize) -> Self {
        let reserved = reserved_frames.min(total_frames);
        let mut ref_counts = vec![0u32; total_frames];
        for count in ref_counts.iter_mut().take(reserved) {
            *count = 1;
        }

        tracing::debug!(
            "Physical memory: {} frames ({} KB), {} reserved",
            total_frames,
            total_frames * PAGE_SIZE / 1024,
            reserved
        );

        Self {
            memory: vec![0u8; total_frames * PAGE_SIZE],
            ref_counts,
            total_frames,
            free_count: total_frames - reserved,
        }
    }

    /// Allocate a single zero-filled frame with reference count 1
    pub fn allocate(&mut self) -> KernelResult<FrameId> {
        let index = self
            .ref_counts
            .iter()
            .position(|&count| count == 0)
            .ok_or(KernelError::OutOfMemory)?;

        self.ref_counts[index] = 1;
        self.free_count -= 1;

        let frame = FrameId(index);
        self.frame_bytes_mut(frame).fill(0);

        tracing::trace!("Allocated frame {}", frame);
        Ok(frame)
    }

    /// Drop one reference; the frame returns to the pool when none remain.
    ///
    /// Freeing a frame that is already free only logs a warning.
    pub fn free(&mut self, frame: FrameId) {
        let Some(count) = self.ref_counts.get_mut(frame.0) else {
            tracing::warn!("Free of out-of-range frame {}", frame);
            return;
        };

        if *count == 0 {
            tracing::warn!("Double free of frame {}", frame);
            return;
        }

        *count -= 1;
        if *count == 0 {
            self.free_count += 1;
            tracing::trace!("Frame {} released", frame);
        }
    }

    /// Add a sharer to an allocated frame
    pub fn increment_ref(&mut self, frame: FrameId) -> KernelResult<()> {
        match self.ref_counts.get_mut(frame.0) {
            Some(count) if *count > 0 => {
                *count += 1;
                Ok(())
            }
            _ => Err(KernelError::FrameNotAllocated(frame)),
        }
    }

    /// Current reference count (0 for free or unknown frames)
    pub fn ref_count(&self, frame: FrameId) -> u32 {
        self.ref_counts.get(frame.0).copied().unwrap_or(0)
    }

    /// Check whether a frame is in use
    pub fn is_allocated(&self, frame: FrameId) -> bool {
        self.ref_count(frame) > 0
    }

    /// Copy the full contents of one frame into another
    pub fn copy_frame(&mut self, src: FrameId, dst: FrameId) -> KernelResult<()> {
        let src_base = self.checked_range(src.base(), PAGE_SIZE)?;
        let dst_base = self.checked_range(dst.base(), PAGE_SIZE)?;

        self.memory.copy_within(src_base..src_base + PAGE_SIZE, dst_base);
        Ok(())
    }

    /// Read one byte of physical memory
    pub fn read_byte(&self, paddr: PhysAddr) -> KernelResult<u8> {
        let offset = self.checked_range(paddr, 1)?;
        Ok(self.memory[offset])
    }

    /// Write one byte of physical memory
    pub fn write_byte(&mut self, paddr: PhysAddr, value: u8) -> KernelResult<()> {
        let offset = self.checked_range(paddr, 1)?;
        self.memory[offset] = value;
        Ok(())
    }

    /// Read `buf.len()` bytes starting at `paddr`
    pub fn read_range(&self, paddr: PhysAddr, buf: &mut [u8]) -> KernelResult<()> {
        let offset = self.checked_range(paddr, buf.len())?;
        buf.copy_from_slice(&self.memory[offset..offset + buf.len()]);
        Ok(())
    }

    /// Write `data` starting at `paddr`
    pub fn write_range(&mut self, paddr: PhysAddr, data: &[u8]) -> KernelResult<()> {
        let offset = self.checked_range(paddr, data.len())?;
        self.memory[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Get number of free frames
    pub fn free_frames(&self) -> usize {
        self.free_count
    }

    /// Get number of frames in use (shared frames count once)
    pub fn used_frames(&self) -> usize {
        self.total_frames - self.free_count
    }

    /// Get total number of frames
    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    fn frame_bytes_mut(&mut self, frame: FrameId) -> &mut [u8] {
        let base = frame.0 * PAGE_SIZE;
        &mut self.memory[base..base + PAGE_SIZE]
    }

    /// Validate `[paddr, paddr + len)` and return it as a slice offset
    fn checked_range(&self, paddr: PhysAddr, len: usize) -> KernelResult<usize> {
        let start = paddr.as_u64();
        let end = start.checked_add(len as u64);

        match end {
            Some(end) if end <= self.memory.len() as u64 => Ok(start as usize),
            _ => Err(KernelError::HostFault { paddr: start }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conserved(alloc: &FrameAllocator) -> bool {
        let occupied = (0..alloc.total_frames())
            .filter(|&i| alloc.is_allocated(FrameId(i)))
            .count();
        alloc.free_frames() + occupied == alloc.total_frames()
    }

    #[test]
    fn test_reserved_frames() {
        let alloc = FrameAllocator::new(16, 4);
        assert_eq!(alloc.total_frames(), 16);
        assert_eq!(alloc.free_frames(), 12);
        assert_eq!(alloc.ref_count(FrameId(0)), 1);
        assert_eq!(alloc.ref_count(FrameId(4)), 0);
    }

    #[test]
    fn test_first_fit() {
        let mut alloc = FrameAllocator::new(8, 2);
        assert_eq!(alloc.allocate().unwrap(), FrameId(2));
        assert_eq!(alloc.allocate().unwrap(), FrameId(3));

        alloc.free(FrameId(2));
        assert_eq!(alloc.allocate().unwrap(), FrameId(2));
    }

    #[test]
    fn test_allocated_frame_is_zeroed() {
        let mut alloc = FrameAllocator::new(4, 0);
        let frame = alloc.allocate().unwrap();
        alloc.write_range(frame.base(), &[0xAA; PAGE_SIZE]).unwrap();
        alloc.free(frame);

        let again = alloc.allocate().unwrap();
        assert_eq!(again, frame);

        let mut buf = [0xFFu8; PAGE_SIZE];
        alloc.read_range(again.base(), &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_shared_frame_freed_on_last_reference() {
        let mut alloc = FrameAllocator::new(4, 0);
        let frame = alloc.allocate().unwrap();
        alloc.increment_ref(frame).unwrap();
        assert_eq!(alloc.ref_count(frame), 2);
        assert_eq!(alloc.free_frames(), 3);

        alloc.free(frame);
        assert!(alloc.is_allocated(frame));
        assert_eq!(alloc.free_frames(), 3);

        alloc.free(frame);
        assert!(!alloc.is_allocated(frame));
        assert_eq!(alloc.free_frames(), 4);
    }

    #[test]
    fn test_double_free_is_noop() {
        let mut alloc = FrameAllocator::new(4, 0);
        let frame = alloc.allocate().unwrap();
        alloc.free(frame);
        alloc.free(frame);
        alloc.free(FrameId(99));
        assert_eq!(alloc.free_frames(), 4);
    }

    #[test]
    fn test_increment_free_frame_rejected() {
        let mut alloc = FrameAllocator::new(4, 0);
        assert_eq!(alloc.increment_ref(FrameId(1)), Err(KernelError::FrameNotAllocated(FrameId(1))));
        assert_eq!(alloc.ref_count(FrameId(1)), 0);
    }

    #[test]
    fn test_out_of_memory_then_recover() {
        let mut alloc = FrameAllocator::new(8, 1);
        let mut frames = Vec::new();
        loop {
            match alloc.allocate() {
                Ok(frame) => {
                    alloc.write_byte(frame.base(), 0x5A).unwrap();
                    frames.push(frame);
                }
                Err(e) => {
                    assert_eq!(e, KernelError::OutOfMemory);
                    break;
                }
            }
        }
        assert_eq!(frames.len(), 7);
        assert_eq!(alloc.free_frames(), 0);

        alloc.free(frames[3]);
        let frame = alloc.allocate().unwrap();
        assert_eq!(frame, frames[3]);
        assert_eq!(alloc.read_byte(frame.base()).unwrap(), 0);
    }

    #[test]
    fn test_conservation() {
        let mut alloc = FrameAllocator::new(10, 2);
        assert!(conserved(&alloc));

        let a = alloc.allocate().unwrap();
        let b = alloc.allocate().unwrap();
        alloc.increment_ref(a).unwrap();
        alloc.increment_ref(a).unwrap();
        assert!(conserved(&alloc));
        assert_eq!(alloc.used_frames(), 4);

        alloc.free(a);
        alloc.free(b);
        assert!(conserved(&alloc));
        alloc.free(b);
        assert!(conserved(&alloc));
    }

    #[test]
    fn test_out_of_range_access_is_host_fault() {
        let mut alloc = FrameAllocator::new(2, 0);
        let end = PhysAddr::new((2 * PAGE_SIZE) as u64);

        assert_eq!(alloc.read_byte(end), Err(KernelError::HostFault { paddr: end.as_u64() }));
        assert!(alloc.write_byte(end, 1).is_err());

        let mut buf = [0u8; 8];
        let near_end = PhysAddr::new((2 * PAGE_SIZE - 4) as u64);
        assert!(alloc.read_range(near_end, &mut buf).is_err());
        assert!(alloc.read_range(near_end, &mut buf[..4]).is_ok());
    }

    #[test]
    fn test_copy_frame() {
        let mut alloc = FrameAllocator::new(4, 0);
        let src = alloc.allocate().unwrap();
        let dst = alloc.allocate().unwrap();
        alloc.write_byte(PhysAddr::new(src.base().as_u64() + 100), 0x42).unwrap();

        alloc.copy_frame(src, dst).unwrap();
        assert_eq!(alloc.read_byte(PhysAddr::new(dst.base().as_u64() + 100)).unwrap(), 0x42);
    }
}

//! Virtual Address Space Management
//!
//! Each process has its own address space, managed here. Pages are backed on
//! demand by frames from the shared [`FramePool`]; `fork` shares every frame
//! copy-on-write and the first write through either side takes a private copy.

use super::{FrameId, FramePool, PageFlags, PageTable, VirtAddr};
use crate::{KernelError, KernelResult, PAGE_SIZE, TASK_SIZE};

/// Region types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// User code
    Code,
    /// User data
    Data,
    /// User heap (data end up to brk)
    Heap,
    /// User stack (mapped pages between brk and stack top)
    Stack,
}

/// Address space for a process
pub struct AddressSpace {
    /// Physical frames backing this space
    frames: FramePool,
    /// Virtual page → frame mapping
    page_table: PageTable,
    /// Size of the space in bytes
    task_size: u64,
    code_start: u64,
    code_end: u64,
    data_start: u64,
    data_end: u64,
    /// Current end of the heap
    brk: u64,
    stack_top: u64,
}

impl AddressSpace {
    /// Create new empty address space of the default task size
    pub fn new(frames: FramePool) -> Self {
        Self::with_task_size(frames, TASK_SIZE)
    }

    /// Create new empty address space of `task_size` bytes
    pub fn with_task_size(frames: FramePool, task_size: u64) -> Self {
        Self {
            frames,
            page_table: PageTable::for_task_size(task_size),
            task_size,
            code_start: 0,
            code_end: 0,
            data_start: 0,
            data_end: 0,
            brk: 0,
            stack_top: task_size.saturating_sub(PAGE_SIZE as u64),
        }
    }

    /// Back the page containing `vaddr` with a fresh zeroed frame.
    ///
    /// Already-mapped pages are left alone. Fails with `OutOfMemory` when the
    /// allocator is exhausted; that is an allocation failure, not a fault.
    pub fn allocate_and_map(&mut self, vaddr: VirtAddr, flags: PageFlags) -> KernelResult<()> {
        let vpage = vaddr.page_number();
        if self.page_table.is_mapped(vpage) {
            return Ok(());
        }

        if vpage >= self.page_table.max_pages() {
            return Err(KernelError::AddressOutOfRange { vaddr: vaddr.as_u64() });
        }

        let frame = self.frames.allocate()?;
        self.page_table.map(vpage, frame, flags)?;

        tracing::trace!("Mapped page {:#x} -> frame {}", vaddr.align_down().as_u64(), frame);
        Ok(())
    }

    /// Grow the heap to cover `new_brk`, returning the resulting brk.
    ///
    /// Requests below the data segment, below the current brk, or past the
    /// end of the space leave brk unchanged. Growth is page-granular. If
    /// memory runs out partway, the pages mapped so far stay mapped and brk
    /// stops at the first unmapped page.
    pub fn expand_brk(&mut self, new_brk: u64) -> u64 {
        if new_brk < self.data_end {
            return self.brk;
        }

        let target = match VirtAddr::new(new_brk).align_up() {
            Some(target) if target.as_u64() <= self.task_size => target,
            _ => {
                tracing::debug!("brk request {:#x} beyond task size {:#x}", new_brk, self.task_size);
                return self.brk;
            }
        };
        if target.as_u64() <= self.brk {
            return self.brk;
        }

        let first = VirtAddr::new(self.brk).page_number();
        for vpage in first..target.page_number() {
            let page = VirtAddr::from_page(vpage);
            if let Err(e) = self.allocate_and_map(page, PageFlags::USER_DATA) {
                tracing::warn!("brk growth stopped at {}: {}", page, e);
                self.brk = self.brk.max(page.as_u64());
                return self.brk;
            }
        }

        tracing::debug!("brk {:#x} -> {}", self.brk, target);
        self.brk = target.as_u64();
        self.brk
    }

    /// Read one byte
    pub fn read_byte(&self, vaddr: VirtAddr) -> KernelResult<u8> {
        let paddr = self
            .page_table
            .translate(vaddr)
            .ok_or(KernelError::PageFault { vaddr: vaddr.as_u64() })?;

        self.frames.lock().read_byte(paddr)
    }

    /// Write one byte, resolving copy-on-write first if needed
    pub fn write_byte(&mut self, vaddr: VirtAddr, value: u8) -> KernelResult<()> {
        let vpage = vaddr.page_number();
        let entry = *self
            .page_table
            .entry(vpage)
            .ok_or(KernelError::PageFault { vaddr: vaddr.as_u64() })?;

        if entry.is_cow() {
            self.resolve_cow(vpage)?;
        } else if !entry.is_writable() {
            tracing::debug!("Write to read-only page at {}", vaddr);
            return Err(KernelError::PermissionFault { vaddr: vaddr.as_u64() });
        }

        let paddr = self
            .page_table
            .translate(vaddr)
            .ok_or(KernelError::PageFault { vaddr: vaddr.as_u64() })?;

        self.frames.lock().write_byte(paddr, value)
    }

    /// Read `buf.len()` bytes starting at `vaddr`.
    ///
    /// Each byte faults independently, so a range may span pages. A range
    /// running past the top of the address range faults where it wraps.
    pub fn read_range(&self, vaddr: VirtAddr, buf: &mut [u8]) -> KernelResult<()> {
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = self.read_byte(Self::range_addr(vaddr, i)?)?;
        }
        Ok(())
    }

    /// Write `data` starting at `vaddr`. Bytes before a fault stay written.
    pub fn write_range(&mut self, vaddr: VirtAddr, data: &[u8]) -> KernelResult<()> {
        for (i, &byte) in data.iter().enumerate() {
            self.write_byte(Self::range_addr(vaddr, i)?, byte)?;
        }
        Ok(())
    }

    fn range_addr(base: VirtAddr, i: usize) -> KernelResult<VirtAddr> {
        // The wrapped address is where the fault lands
        base.offset(i as u64)
            .ok_or(KernelError::PageFault { vaddr: base.as_u64().wrapping_add(i as u64) })
    }

    /// Duplicate this space for a child process.
    ///
    /// Every mapped frame gains a reference. Writable pages become
    /// copy-on-write in both parent and child; read-only pages are shared as
    /// they are. Segment boundaries are copied.
    pub fn fork(&mut self) -> KernelResult<AddressSpace> {
        let mut child = AddressSpace {
            frames: self.frames.clone(),
            page_table: self.page_table.clone_entries(),
            task_size: self.task_size,
            code_start: self.code_start,
            code_end: self.code_end,
            data_start: self.data_start,
            data_end: self.data_end,
            brk: self.brk,
            stack_top: self.stack_top,
        };

        let entries: Vec<_> = self.page_table.entries().collect();
        for (i, (vpage, entry)) in entries.iter().enumerate() {
            if let Err(e) = self.frames.increment_ref(entry.frame()) {
                // The child only owns references taken so far
                for (rest, _) in &entries[i..] {
                    child.page_table.unmap(*rest);
                }
                return Err(e);
            }

            if entry.is_writable() || entry.is_cow() {
                let shared = (entry.flags() - PageFlags::WRITABLE) | PageFlags::COPY_ON_WRITE;
                self.page_table.set_flags(*vpage, shared);
                child.page_table.set_flags(*vpage, shared);
            }
        }

        tracing::debug!("Forked address space: {} pages shared", entries.len());
        Ok(child)
    }

    /// Give `vpage` a private writable frame.
    ///
    /// A sole owner is promoted in place; otherwise the page is copied into a
    /// new frame and the shared one loses a reference. The check, copy and
    /// release happen under one allocator lock.
    fn resolve_cow(&mut self, vpage: usize) -> KernelResult<()> {
        let entry = *self
            .page_table
            .entry(vpage)
            .ok_or(KernelError::PageFault { vaddr: VirtAddr::from_page(vpage).as_u64() })?;
        let old = entry.frame();
        let flags = (entry.flags() - PageFlags::COPY_ON_WRITE) | PageFlags::WRITABLE;

        let copy = {
            let mut alloc = self.frames.lock();
            if alloc.ref_count(old) == 1 {
                None
            } else {
                let new = alloc.allocate()?;
                if let Err(e) = alloc.copy_frame(old, new) {
                    alloc.free(new);
                    return Err(e);
                }
                alloc.free(old);
                Some(new)
            }
        };

        match copy {
            None => {
                self.page_table.set_flags(vpage, flags);
                tracing::trace!("COW page {} promoted in place (frame {})", vpage, old);
            }
            Some(new) => {
                self.page_table.map(vpage, new, flags)?;
                tracing::trace!("COW page {} copied: frame {} -> {}", vpage, old, new);
            }
        }
        Ok(())
    }

    /// Unmap every page and drop this space's frame references
    pub fn release(&mut self) {
        let frames: Vec<FrameId> = self.page_table.entries().map(|(_, e)| e.frame()).collect();
        if frames.is_empty() {
            return;
        }

        {
            let mut alloc = self.frames.lock();
            for frame in &frames {
                alloc.free(*frame);
            }
        }
        self.page_table.clear();

        tracing::debug!("Address space released {} pages", frames.len());
    }

    /// Set the code segment
    pub fn set_code(&mut self, start: u64, end: u64) {
        self.code_start = start;
        self.code_end = end;
    }

    /// Set the data segment. Resets brk to the new data end.
    pub fn set_data(&mut self, start: u64, end: u64) {
        self.data_start = start;
        self.data_end = end;
        self.brk = end;
    }

    /// Classify an address by segment
    pub fn region_kind(&self, vaddr: VirtAddr) -> Option<RegionKind> {
        let addr = vaddr.as_u64();
        if (self.code_start..self.code_end).contains(&addr) {
            Some(RegionKind::Code)
        } else if (self.data_start..self.data_end).contains(&addr) {
            Some(RegionKind::Data)
        } else if (self.data_end..self.brk).contains(&addr) {
            Some(RegionKind::Heap)
        } else if (self.brk..self.stack_top).contains(&addr) && self.page_table.is_mapped(vaddr.page_number()) {
            Some(RegionKind::Stack)
        } else {
            None
        }
    }

    /// Get page table
    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    /// Get the frame pool backing this space
    pub fn frames(&self) -> &FramePool {
        &self.frames
    }

    /// Number of mapped pages
    pub fn mapped_pages(&self) -> usize {
        self.page_table.mapped_count()
    }

    /// Size of the space in bytes
    pub fn task_size(&self) -> u64 {
        self.task_size
    }

    /// Code segment start
    pub fn code_start(&self) -> u64 {
        self.code_start
    }

    /// Code segment end
    pub fn code_end(&self) -> u64 {
        self.code_end
    }

    /// Data segment start
    pub fn data_start(&self) -> u64 {
        self.data_start
    }

    /// Data segment end
    pub fn data_end(&self) -> u64 {
        self.data_end
    }

    /// Current heap end
    pub fn brk(&self) -> u64 {
        self.brk
    }

    /// Stack top
    pub fn stack_top(&self) -> u64 {
        self.stack_top
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        self.release();
    }
}

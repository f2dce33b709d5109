//! Page Table Management
//!
//! Two-level table indexed by virtual page number:
//! - Directory (one slot per 1024 pages, allocated lazily)
//! - Leaf tables of 1024 entries
//!
//! The table is pure data. It never touches frames or reference counts;
//! callers adjust those around `map`/`unmap`/`clone_entries`.

use bitflags::bitflags;

use super::{FrameId, PhysAddr, VirtAddr};
use crate::{KernelError, KernelResult, PAGE_SIZE};

/// Number of entries per leaf table
pub const ENTRIES_PER_TABLE: usize = 1024;

bitflags! {
    /// Page table entry flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFlags: u32 {
        /// Entry is in use
        const PRESENT = 1 << 0;
        /// Page may be written directly
        const WRITABLE = 1 << 1;
        /// Page is accessible from user mode
        const USER = 1 << 2;
        /// Shared after fork; a write must first take a private copy
        const COPY_ON_WRITE = 1 << 3;
    }
}

impl PageFlags {
    /// User code flags
    pub const USER_CODE: Self = Self::PRESENT.union(Self::USER);

    /// User data flags
    pub const USER_DATA: Self = Self::PRESENT.union(Self::WRITABLE).union(Self::USER);

    /// Enforce the entry invariants: PRESENT set, COW never writable
    fn normalized(self) -> Self {
        let mut flags = self | PageFlags::PRESENT;
        if flags.contains(PageFlags::COPY_ON_WRITE) {
            flags.remove(PageFlags::WRITABLE);
        }
        flags
    }
}

/// Page table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntry {
    frame: FrameId,
    flags: PageFlags,
}

impl PageTableEntry {
    /// Create empty entry
    pub const fn empty() -> Self {
        Self {
            frame: FrameId(0),
            flags: PageFlags::empty(),
        }
    }

    /// Create entry with frame and flags
    pub fn new(frame: FrameId, flags: PageFlags) -> Self {
        Self {
            frame,
            flags: flags.normalized(),
        }
    }

    /// Get flags
    pub fn flags(&self) -> PageFlags {
        self.flags
    }

    /// Get backing frame
    pub fn frame(&self) -> FrameId {
        self.frame
    }

    /// Check if entry is present
    pub fn is_present(&self) -> bool {
        self.flags.contains(PageFlags::PRESENT)
    }

    /// Check if the page may be written without a fault
    pub fn is_writable(&self) -> bool {
        self.flags.contains(PageFlags::WRITABLE)
    }

    /// Check if the page is shared copy-on-write
    pub fn is_cow(&self) -> bool {
        self.flags.contains(PageFlags::COPY_ON_WRITE)
    }
}

type LeafTable = [PageTableEntry; ENTRIES_PER_TABLE];

/// Per-address-space page table
#[derive(Clone)]
pub struct PageTable {
    /// Leaf tables, allocated on first mapping in their range
    directory: Vec<Option<Box<LeafTable>>>,
    /// Number of virtual pages this table can describe
    max_pages: usize,
    /// Number of present entries
    mapped: usize,
}

impl PageTable {
    /// Create empty page table covering `max_pages` virtual pages
    pub fn new(max_pages: usize) -> Self {
        let dir_len = max_pages.div_ceil(ENTRIES_PER_TABLE);
        Self {
            directory: vec![None; dir_len],
            max_pages,
            mapped: 0,
        }
    }

    /// Create a table sized for an address space of `task_size` bytes
    pub fn for_task_size(task_size: u64) -> Self {
        Self::new((task_size / PAGE_SIZE as u64) as usize)
    }

    /// Map `vpage` to `frame`. PRESENT is implied; an existing entry is replaced.
    pub fn map(&mut self, vpage: usize, frame: FrameId, flags: PageFlags) -> KernelResult<()> {
        if vpage >= self.max_pages {
            return Err(KernelError::AddressOutOfRange {
                vaddr: VirtAddr::from_page(vpage).as_u64(),
            });
        }

        let (dir, index) = split(vpage);
        let leaf = self.directory[dir].get_or_insert_with(|| Box::new([PageTableEntry::empty(); ENTRIES_PER_TABLE]));

        if !leaf[index].is_present() {
            self.mapped += 1;
        }
        leaf[index] = PageTableEntry::new(frame, flags);
        Ok(())
    }

    /// Remove the mapping for `vpage`, returning the old entry
    pub fn unmap(&mut self, vpage: usize) -> Option<PageTableEntry> {
        let entry = self.entry_mut(vpage)?;
        let old = *entry;
        *entry = PageTableEntry::empty();
        self.mapped -= 1;
        Some(old)
    }

    /// Get entry for `vpage`, if present
    pub fn entry(&self, vpage: usize) -> Option<&PageTableEntry> {
        let (dir, index) = split(vpage);
        self.directory
            .get(dir)?
            .as_ref()
            .map(|leaf| &leaf[index])
            .filter(|entry| entry.is_present())
    }

    fn entry_mut(&mut self, vpage: usize) -> Option<&mut PageTableEntry> {
        let (dir, index) = split(vpage);
        self.directory
            .get_mut(dir)?
            .as_mut()
            .map(|leaf| &mut leaf[index])
            .filter(|entry| entry.is_present())
    }

    /// Check if a virtual page is mapped
    pub fn is_mapped(&self, vpage: usize) -> bool {
        self.entry(vpage).is_some()
    }

    /// Frame backing `vpage`
    pub fn physical_frame(&self, vpage: usize) -> Option<FrameId> {
        self.entry(vpage).map(|e| e.frame())
    }

    /// Flags of `vpage`
    pub fn flags(&self, vpage: usize) -> Option<PageFlags> {
        self.entry(vpage).map(|e| e.flags())
    }

    /// Replace the flags of a mapped page. Returns false if `vpage` is unmapped.
    pub fn set_flags(&mut self, vpage: usize, flags: PageFlags) -> bool {
        match self.entry_mut(vpage) {
            Some(entry) => {
                entry.flags = flags.normalized();
                true
            }
            None => false,
        }
    }

    /// Check that every flag in `required` is set on `vpage`
    pub fn check_permission(&self, vpage: usize, required: PageFlags) -> bool {
        self.flags(vpage).is_some_and(|flags| flags.contains(required))
    }

    /// Translate virtual address to physical
    pub fn translate(&self, vaddr: VirtAddr) -> Option<PhysAddr> {
        let frame = self.physical_frame(vaddr.page_number())?;
        Some(PhysAddr::new(frame.base().as_u64() + vaddr.page_offset() as u64))
    }

    /// Shallow structural copy: same frames, same flags
    pub fn clone_entries(&self) -> PageTable {
        self.clone()
    }

    /// Iterate over present entries as `(vpage, entry)`
    pub fn entries(&self) -> impl Iterator<Item = (usize, PageTableEntry)> + '_ {
        self.directory
            .iter()
            .enumerate()
            .filter_map(|(dir, leaf)| leaf.as_ref().map(|leaf| (dir, leaf)))
            .flat_map(|(dir, leaf)| {
                leaf.iter()
                    .enumerate()
                    .filter(|(_, entry)| entry.is_present())
                    .map(move |(index, entry)| (dir * ENTRIES_PER_TABLE + index, *entry))
            })
    }

    /// Number of mapped virtual pages
    pub fn mapped_count(&self) -> usize {
        self.mapped
    }

    /// Number of virtual pages the table can describe
    pub fn max_pages(&self) -> usize {
        self.max_pages
    }

    /// Clear all entries
    pub fn clear(&mut self) {
        for leaf in &mut self.directory {
            *leaf = None;
        }
        self.mapped = 0;
    }
}

fn split(vpage: usize) -> (usize, usize) {
    (vpage / ENTRIES_PER_TABLE, vpage % ENTRIES_PER_TABLE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PageTable {
        PageTable::for_task_size(crate::TASK_SIZE)
    }

    #[test]
    fn test_map_and_lookup() {
        let mut pt = table();
        pt.map(5, FrameId(9), PageFlags::WRITABLE | PageFlags::USER).unwrap();

        assert!(pt.is_mapped(5));
        assert!(!pt.is_mapped(4));
        assert_eq!(pt.physical_frame(5), Some(FrameId(9)));
        assert_eq!(pt.flags(5), Some(PageFlags::USER_DATA));
        assert_eq!(pt.mapped_count(), 1);
    }

    #[test]
    fn test_remap_keeps_count() {
        let mut pt = table();
        pt.map(1, FrameId(3), PageFlags::USER_DATA).unwrap();
        pt.map(1, FrameId(4), PageFlags::USER_CODE).unwrap();

        assert_eq!(pt.mapped_count(), 1);
        assert_eq!(pt.physical_frame(1), Some(FrameId(4)));
        assert!(!pt.check_permission(1, PageFlags::WRITABLE));
    }

    #[test]
    fn test_unmap() {
        let mut pt = table();
        pt.map(2000, FrameId(7), PageFlags::USER_DATA).unwrap();

        let old = pt.unmap(2000).unwrap();
        assert_eq!(old.frame(), FrameId(7));
        assert!(!pt.is_mapped(2000));
        assert_eq!(pt.mapped_count(), 0);
        assert!(pt.unmap(2000).is_none());
    }

    #[test]
    fn test_out_of_range_page() {
        let mut pt = PageTable::new(16);
        assert!(matches!(
            pt.map(16, FrameId(1), PageFlags::USER_DATA),
            Err(KernelError::AddressOutOfRange { .. })
        ));
        assert!(!pt.is_mapped(1 << 30));
        assert_eq!(pt.translate(VirtAddr::new(u64::MAX)), None);
    }

    #[test]
    fn test_translate() {
        let mut pt = table();
        pt.map(3, FrameId(10), PageFlags::USER_DATA).unwrap();

        let vaddr = VirtAddr::new(3 * PAGE_SIZE as u64 + 0x123);
        assert_eq!(pt.translate(vaddr), Some(PhysAddr::new(10 * PAGE_SIZE as u64 + 0x123)));
        assert_eq!(pt.translate(VirtAddr::new(0x123)), None);
    }

    #[test]
    fn test_cow_clears_writable() {
        let mut pt = table();
        pt.map(0, FrameId(1), PageFlags::USER_DATA | PageFlags::COPY_ON_WRITE).unwrap();
        let flags = pt.flags(0).unwrap();
        assert!(flags.contains(PageFlags::COPY_ON_WRITE));
        assert!(!flags.contains(PageFlags::WRITABLE));

        pt.map(1, FrameId(2), PageFlags::USER_DATA).unwrap();
        assert!(pt.set_flags(1, PageFlags::USER_DATA | PageFlags::COPY_ON_WRITE));
        assert!(!pt.check_permission(1, PageFlags::WRITABLE));
        assert!(!pt.set_flags(9, PageFlags::USER_DATA));
    }

    #[test]
    fn test_clone_entries_is_independent() {
        let mut pt = table();
        pt.map(0, FrameId(1), PageFlags::USER_DATA).unwrap();
        pt.map(1500, FrameId(2), PageFlags::USER_CODE).unwrap();

        let mut copy = pt.clone_entries();
        assert_eq!(copy.physical_frame(0), Some(FrameId(1)));
        assert_eq!(copy.flags(1500), pt.flags(1500));

        copy.unmap(0);
        assert!(pt.is_mapped(0));
    }

    #[test]
    fn test_entries_iterates_in_page_order() {
        let mut pt = table();
        for vpage in [4000, 3, 1024, 0] {
            pt.map(vpage, FrameId(vpage + 1), PageFlags::USER_DATA).unwrap();
        }

        let pages: Vec<usize> = pt.entries().map(|(vpage, _)| vpage).collect();
        assert_eq!(pages, vec![0, 3, 1024, 4000]);

        pt.clear();
        assert_eq!(pt.entries().count(), 0);
        assert_eq!(pt.mapped_count(), 0);
    }
}

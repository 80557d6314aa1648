//! The page-table interface of the core.
//!
//! A software-walked four-level table; non-leaf tables live in frames
//! reached through the direct-map window, so the walk never depends on
//! the MMU register format of the running machine. The architecture layer
//! only ever sees the root frame and the TLB invalidation hooks.

use core::{
    fmt::{Debug, LowerHex},
    ops::{Index, IndexMut},
};

use bitflags::bitflags;
use thiserror::Error;

use super::frame_allocator::{self, Frame, FrameFlags};
use super::{PhysAddr, VirtAddr};

pub const PAGE_SIZE: usize = 4096;
const ENTRY_COUNT: usize = 512;
const LEVELS: usize = 4;

const ADDR_MASK: usize = 0x000F_FFFF_FFFF_F000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    start_address: VirtAddr,
}

impl LowerHex for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Page({:#x})", self.start_address)
    }
}

impl Page {
    pub const fn containing_address(address: VirtAddr) -> Self {
        Self {
            start_address: address.align_down(PAGE_SIZE),
        }
    }

    pub const fn virt_addr(&self) -> VirtAddr {
        self.start_address
    }

    pub fn next(&self) -> Page {
        Page {
            start_address: self.start_address + PAGE_SIZE,
        }
    }

    /// requires that start is not above end
    pub fn iter_pages(start: Page, end: Page) -> IterPage {
        assert!(start.start_address <= end.start_address);
        IterPage { start, end }
    }

    /// table indices of this page's walk, root level first
    fn table_indices(&self) -> [usize; LEVELS] {
        let raw = self.start_address.into_raw();
        [
            (raw >> 39) & 0x1FF,
            (raw >> 30) & 0x1FF,
            (raw >> 21) & 0x1FF,
            (raw >> 12) & 0x1FF,
        ]
    }
}

#[derive(Debug, Clone)]
pub struct IterPage {
    start: Page,
    end: Page,
}

impl Iterator for IterPage {
    type Item = Page;
    fn next(&mut self) -> Option<Self::Item> {
        if self.start.start_address < self.end.start_address {
            let page = self.start;
            self.start.start_address += PAGE_SIZE;
            Some(page)
        } else {
            None
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u64 {
        const PRESENT =   1;
        const WRITE =     1 << 1;
        const USER =      1 << 2;
        const NO_CACHE =  1 << 3;
        const ACCESSED =  1 << 4;
        const DIRTY =     1 << 5;
        const GLOBAL =    1 << 6;
        const EXEC =      1 << 7;
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Entry(u64);

impl Debug for Entry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("Entry")
            .field(&format_args!("{:#x}", self.frame_addr().into_raw()))
            .field(&self.flags())
            .finish()
    }
}

impl Entry {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn new(flags: EntryFlags, addr: PhysAddr) -> Self {
        Self((addr.into_raw() & ADDR_MASK) as u64 | flags.bits())
    }

    pub fn flags(&self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0)
    }

    pub fn is_present(&self) -> bool {
        self.flags().contains(EntryFlags::PRESENT)
    }

    fn frame_addr(&self) -> PhysAddr {
        PhysAddr::from(self.0 as usize & ADDR_MASK)
    }

    pub fn frame(&self) -> Option<Frame> {
        if self.is_present() {
            Some(Frame::containing_address(self.frame_addr()))
        } else {
            None
        }
    }
}

#[repr(C)]
struct PageTable {
    entries: [Entry; ENTRY_COUNT],
}

impl PageTable {
    fn zeroize(&mut self) {
        self.entries = [Entry::empty(); ENTRY_COUNT];
    }
}

impl Index<usize> for PageTable {
    type Output = Entry;
    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

/// borrows the table stored in `frame` through the direct map
unsafe fn table_in(frame: Frame) -> &'static mut PageTable {
    unsafe { &mut *frame.virt_addr().into_ptr::<PageTable>() }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum MapError {
    #[error("frame allocator: out of memory")]
    FrameAllocationFailed,
}

impl From<frame_allocator::FrameError> for MapError {
    fn from(_: frame_allocator::FrameError) -> Self {
        Self::FrameAllocationFailed
    }
}

/// An owned four-level translation table.
///
/// Dropping the root frees the intermediate tables it allocated but never
/// the leaf target frames; those belong to whoever mapped them (the area
/// backends).
#[derive(Debug)]
pub struct PageTableRoot {
    root: Frame,
}

unsafe impl Send for PageTableRoot {}

impl PageTableRoot {
    pub fn create() -> Result<Self, MapError> {
        let root = frame_allocator::allocate_frame(FrameFlags::ATOMIC)?;
        unsafe { table_in(root) }.zeroize();
        Ok(Self { root })
    }

    pub fn root_frame(&self) -> Frame {
        self.root
    }

    /// Walks to the leaf table of `page`, allocating missing levels when
    /// `create` is set.
    fn leaf_table(&mut self, page: Page, create: bool) -> Result<Option<&mut PageTable>, MapError> {
        let indices = page.table_indices();
        let mut table = unsafe { table_in(self.root) };

        for &index in &indices[..LEVELS - 1] {
            let entry = &mut table[index];
            let next = match entry.frame() {
                Some(frame) => frame,
                None if create => {
                    let frame = frame_allocator::allocate_frame(FrameFlags::ATOMIC)?;
                    unsafe { table_in(frame) }.zeroize();
                    *entry = Entry::new(
                        EntryFlags::PRESENT | EntryFlags::WRITE | EntryFlags::USER,
                        frame.start_address(),
                    );
                    frame
                }
                None => return Ok(None),
            };
            table = unsafe { table_in(next) };
        }

        Ok(Some(table))
    }

    /// Installs a leaf mapping, replacing any previous mapping at `page`.
    pub fn mapping_insert(
        &mut self,
        page: Page,
        frame: Frame,
        flags: EntryFlags,
    ) -> Result<(), MapError> {
        let indices = page.table_indices();
        let table = self.leaf_table(page, true)?.unwrap();
        table[indices[LEVELS - 1]] =
            Entry::new(flags | EntryFlags::PRESENT, frame.start_address());
        Ok(())
    }

    /// Looks up the leaf entry of `page`.
    pub fn mapping_find(&mut self, page: Page) -> Option<Entry> {
        let indices = page.table_indices();
        let table = self
            .leaf_table(page, false)
            .expect("lookup never allocates")?;
        let entry = table[indices[LEVELS - 1]];
        entry.is_present().then_some(entry)
    }

    /// Removes the leaf entry of `page`, returning the frame it pointed
    /// to. The caller owns queueing the TLB shootdown for the removal.
    pub fn mapping_remove(&mut self, page: Page) -> Option<Frame> {
        let indices = page.table_indices();
        let table = self
            .leaf_table(page, false)
            .expect("lookup never allocates")?;
        let entry = &mut table[indices[LEVELS - 1]];
        let frame = entry.frame()?;
        *entry = Entry::empty();
        Some(frame)
    }

    /// Writes back the entry of `page` (accessed/dirty bits and access
    /// flags) without structural change. Missing mappings are ignored.
    pub fn mapping_update(&mut self, page: Page, flags: EntryFlags) {
        let indices = page.table_indices();
        if let Ok(Some(table)) = self.leaf_table(page, false) {
            let entry = &mut table[indices[LEVELS - 1]];
            if let Some(frame) = entry.frame() {
                *entry = Entry::new(flags | EntryFlags::PRESENT, frame.start_address());
            }
        }
    }

    fn free_level(frame: Frame, level: usize) {
        let table = unsafe { table_in(frame) };
        if level < LEVELS - 1 {
            for entry in table.entries.iter() {
                if let Some(next) = entry.frame() {
                    Self::free_level(next, level + 1);
                }
            }
        }
        // the leaf level only drops the table frame itself; target frames
        // were released by the area teardown already
        frame_allocator::deallocate_frame(frame);
    }
}

impl Drop for PageTableRoot {
    fn drop(&mut self) {
        let root = self.root;
        let table = unsafe { table_in(root) };
        for entry in table.entries.iter() {
            if let Some(next) = entry.frame() {
                Self::free_level(next, 1);
            }
        }
        frame_allocator::deallocate_frame(root);
    }
}

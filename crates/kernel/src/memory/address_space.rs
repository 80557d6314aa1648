//! Address spaces: ordered area lists over a private page table, with
//! on-demand paging delegated to per-area backends.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use thiserror::Error;

use crate::memory::backend::AreaBackend;
use crate::memory::frame_allocator::Frame;
use crate::memory::paging::{Entry, EntryFlags, MapError, Page, PageTableRoot, PAGE_SIZE};
use crate::memory::tlb::{self, TlbMessage};
use crate::memory::VirtAddr;
use crate::sync::mutex::{Mutex, MutexGuard};
use crate::utils::locks::LazyLock;
use crate::utils::locks::SpinLock;
use crate::debug;

/// Address-space identifier tagging TLB entries.
pub type Asid = u16;

/// How many ASIDs the hardware-independent layer hands out; exhaustion is
/// a capacity error.
pub const ASID_MAX: usize = 255;

static ASIDS: LazyLock<SpinLock<slab::Slab<()>>> =
    LazyLock::new(|| SpinLock::new(slab::Slab::with_capacity(ASID_MAX)));

fn asid_alloc() -> Result<Asid, AreaError> {
    let mut asids = ASIDS.lock();
    if asids.len() >= ASID_MAX {
        return Err(AreaError::AsidExhausted);
    }
    // ASID 0 stays reserved for the kernel's global mappings
    Ok((asids.insert(()) + 1) as Asid)
}

fn asid_release(asid: Asid) {
    ASIDS.lock().remove(asid as usize - 1);
}

bitflags! {
    /// Access flags of an area.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AreaFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const CACHEABLE = 1 << 3;
    }
}

impl AreaFlags {
    /// Translates area access flags into page-table entry flags.
    pub fn pte_flags(self) -> EntryFlags {
        let mut flags = EntryFlags::USER;
        if self.contains(AreaFlags::WRITE) {
            flags |= EntryFlags::WRITE;
        }
        if self.contains(AreaFlags::EXEC) {
            flags |= EntryFlags::EXEC;
        }
        if !self.contains(AreaFlags::CACHEABLE) {
            flags |= EntryFlags::NO_CACHE;
        }
        flags
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum AreaError {
    #[error("base or size not page aligned")]
    BadAlignment,
    #[error("range overlaps an existing area")]
    Overlap,
    #[error("no area at the given base")]
    NoSuchArea,
    #[error("out of memory")]
    NoMemory,
    #[error("address space identifiers exhausted")]
    AsidExhausted,
}

impl From<MapError> for AreaError {
    fn from(_: MapError) -> Self {
        AreaError::NoMemory
    }
}

/// Outcome of a page-fault service attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PfResult {
    Ok,
    Fault,
}

/// The resident subset of an area, kept as a sorted run-length map of
/// page addresses.
#[derive(Debug, Default)]
pub struct UsedSpace {
    runs: BTreeMap<usize, usize>,
}

impl UsedSpace {
    pub const fn new() -> Self {
        Self {
            runs: BTreeMap::new(),
        }
    }

    pub fn contains(&self, page: VirtAddr) -> bool {
        let addr = page.align_down(PAGE_SIZE).into_raw();
        self.runs
            .range(..=addr)
            .next_back()
            .is_some_and(|(&base, &count)| addr < base + count * PAGE_SIZE)
    }

    /// Records one resident page; false if it was already present.
    pub fn insert(&mut self, page: VirtAddr) -> bool {
        let addr = page.align_down(PAGE_SIZE).into_raw();
        if self.contains(page) {
            return false;
        }

        // merge with the predecessor run when adjacent
        let pred = self
            .runs
            .range(..addr)
            .next_back()
            .map(|(&base, &count)| (base, count));
        let merged_base = match pred {
            Some((base, count)) if base + count * PAGE_SIZE == addr => {
                *self.runs.get_mut(&base).unwrap() += 1;
                base
            }
            _ => {
                self.runs.insert(addr, 1);
                addr
            }
        };

        // swallow an adjacent successor run
        let end = merged_base + self.runs[&merged_base] * PAGE_SIZE;
        if let Some(&succ_count) = self.runs.get(&end) {
            self.runs.remove(&end);
            *self.runs.get_mut(&merged_base).unwrap() += succ_count;
        }
        true
    }

    /// Forgets one resident page; false if it was not present.
    pub fn remove(&mut self, page: VirtAddr) -> bool {
        let addr = page.align_down(PAGE_SIZE).into_raw();
        let Some((&base, &count)) = self.runs.range(..=addr).next_back() else {
            return false;
        };
        if addr >= base + count * PAGE_SIZE {
            return false;
        }

        self.runs.remove(&base);
        let head_pages = (addr - base) / PAGE_SIZE;
        let tail_pages = count - head_pages - 1;
        if head_pages > 0 {
            self.runs.insert(base, head_pages);
        }
        if tail_pages > 0 {
            self.runs.insert(addr + PAGE_SIZE, tail_pages);
        }
        true
    }

    pub fn resident_pages(&self) -> usize {
        self.runs.values().sum()
    }

    /// All resident pages, ascending.
    pub fn pages(&self) -> impl Iterator<Item = VirtAddr> + '_ {
        self.runs.iter().flat_map(|(&base, &count)| {
            (0..count).map(move |i| VirtAddr::from(base + i * PAGE_SIZE))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

/// A contiguous virtual range with uniform access flags and one pager
/// backend.
#[derive(Debug)]
pub struct Area {
    base: VirtAddr,
    size: usize,
    flags: AreaFlags,
    backend: AreaBackend,
    used: UsedSpace,
}

impl Area {
    pub const fn base(&self) -> VirtAddr {
        self.base
    }

    pub const fn size(&self) -> usize {
        self.size
    }

    pub const fn flags(&self) -> AreaFlags {
        self.flags
    }

    pub fn resident_pages(&self) -> usize {
        self.used.resident_pages()
    }

    fn covers(&self, va: VirtAddr) -> bool {
        va >= self.base && va < self.base + self.size
    }
}

struct AsInner {
    areas: BTreeMap<VirtAddr, Area>,
    page_table: PageTableRoot,
    asid: Option<Asid>,
    /// invalidations queued by mapping removal, delivered in one batch
    pending_tlb: Vec<TlbMessage>,
}

impl AsInner {
    /// Queues the shootdown for a removed mapping. Nothing is queued
    /// before the first install, when no TLB can hold the translation.
    fn queue_remove(&mut self, page: Page) {
        if let Some(asid) = self.asid {
            self.pending_tlb.push(TlbMessage::InvalidatePages {
                asid,
                page: page.virt_addr(),
                count: 1,
            });
        }
    }

    /// Delivers every queued invalidation; mappings removed earlier are
    /// not observable anywhere once this returns.
    fn flush_pending(&mut self) {
        for msg in self.pending_tlb.drain(..) {
            tlb::shootdown(msg);
        }
    }

    fn area_covering(&mut self, va: VirtAddr) -> Option<&mut Area> {
        let (_, area) = self.areas.range_mut(..=va).next_back()?;
        area.covers(va).then_some(area)
    }

    /// Tears down every resident page of the area at `base`.
    fn evict_area_pages(&mut self, base: VirtAddr, from: Option<VirtAddr>) {
        let area = self.areas.get_mut(&base).expect("area vanished");
        let doomed: Vec<VirtAddr> = area
            .used
            .pages()
            .filter(|&page| from.is_none_or(|from| page >= from))
            .collect();

        for page_va in doomed {
            let page = Page::containing_address(page_va);
            let area = self.areas.get_mut(&base).unwrap();
            area.used.remove(page_va);
            let backend = area.backend.clone();
            let flags = area.flags;
            let area_base = area.base;

            if let Some(frame) = self.page_table.mapping_remove(page) {
                backend.frame_free(area_base, flags, page, frame);
                self.queue_remove(page);
            }
        }
    }
}

/// A task's virtual memory context. Shared-owned via `Arc`; destroyed
/// when the last owner lets go.
pub struct AddressSpace {
    inner: Mutex<AsInner>,
}

impl AddressSpace {
    pub fn new() -> Result<Arc<Self>, AreaError> {
        let page_table = PageTableRoot::create()?;
        Ok(Arc::new(Self {
            inner: Mutex::new(AsInner {
                areas: BTreeMap::new(),
                page_table,
                asid: None,
                pending_tlb: Vec::new(),
            }),
        }))
    }

    fn lock(&self) -> MutexGuard<'_, AsInner> {
        self.inner.lock()
    }

    /// Creates an area of `size` bytes at `base`. Base and size must be
    /// page aligned and the range must not overlap any existing area.
    pub fn area_create(
        &self,
        flags: AreaFlags,
        size: usize,
        base: VirtAddr,
        backend: AreaBackend,
    ) -> Result<VirtAddr, AreaError> {
        if size == 0
            || !base.is_aligned_to(PAGE_SIZE)
            || size % PAGE_SIZE != 0
        {
            return Err(AreaError::BadAlignment);
        }

        let mut inner = self.lock();

        // the predecessor may not reach into us, nor we into the successor
        if let Some((_, prev)) = inner.areas.range(..=base).next_back() {
            if prev.base + prev.size > base {
                return Err(AreaError::Overlap);
            }
        }
        if let Some((&next_base, _)) = inner.areas.range(base..).next() {
            if base + size > next_base {
                return Err(AreaError::Overlap);
            }
        }

        inner.areas.insert(
            base,
            Area {
                base,
                size,
                flags,
                backend,
                used: UsedSpace::new(),
            },
        );
        Ok(base)
    }

    /// Shrinks or grows the area at `base`. Shrinking evicts resident
    /// pages beyond the new end and delivers their shootdowns.
    pub fn area_resize(&self, base: VirtAddr, new_size: usize) -> Result<(), AreaError> {
        if new_size == 0 || new_size % PAGE_SIZE != 0 {
            return Err(AreaError::BadAlignment);
        }

        let mut inner = self.lock();
        let area = inner.areas.get(&base).ok_or(AreaError::NoSuchArea)?;
        let old_size = area.size;

        if new_size > old_size {
            if let Some((&next_base, _)) = inner.areas.range(base + 1usize..).next() {
                if base + new_size > next_base {
                    return Err(AreaError::Overlap);
                }
            }
        } else if new_size < old_size {
            inner.evict_area_pages(base, Some(base + new_size));
        }

        inner.areas.get_mut(&base).unwrap().size = new_size;
        inner.flush_pending();
        Ok(())
    }

    /// Destroys the area at `base`: every resident page goes back to its
    /// backend, mappings are removed, and the range is invalidated
    /// everywhere before the call returns.
    pub fn area_destroy(&self, base: VirtAddr) -> Result<(), AreaError> {
        let mut inner = self.lock();
        if !inner.areas.contains_key(&base) {
            return Err(AreaError::NoSuchArea);
        }

        inner.evict_area_pages(base, None);
        let area = inner.areas.remove(&base).unwrap();
        debug_assert!(area.used.is_empty());

        inner.flush_pending();
        // belt for sparse removals: drop the whole range from the TLBs
        if let Some(asid) = inner.asid {
            tlb::shootdown(TlbMessage::InvalidatePages {
                asid,
                page: base,
                count: area.size / PAGE_SIZE,
            });
        }
        Ok(())
    }

    /// Services a page fault at `va` with the access kind in `access`.
    ///
    /// Returns [`PfResult::Fault`] when no area covers `va`, the access
    /// exceeds the area's flags, or the backend cannot provide a frame;
    /// the caller decides whether that kills a task or panics the
    /// kernel.
    pub fn handle_fault(&self, va: VirtAddr, access: AreaFlags) -> PfResult {
        let mut inner = self.lock();

        if inner.asid.is_none() {
            match asid_alloc() {
                Ok(asid) => inner.asid = Some(asid),
                Err(_) => return PfResult::Fault,
            }
        }

        let Some(area) = inner.area_covering(va) else {
            return PfResult::Fault;
        };
        if !area.flags.contains(access) {
            return PfResult::Fault;
        }

        let page = Page::containing_address(va);
        if area.used.contains(page.virt_addr()) {
            // raced another faulting thread; the mapping is in place
            return PfResult::Ok;
        }

        let backend = area.backend.clone();
        let flags = area.flags;
        let area_base = area.base;

        let outcome = backend.page_fault(area_base, flags, page, &mut inner.page_table);
        if outcome == PfResult::Ok {
            let inserted = inner
                .areas
                .get_mut(&area_base)
                .unwrap()
                .used
                .insert(page.virt_addr());
            debug_assert!(inserted, "fault recorded a page twice");
        }
        outcome
    }

    /// Looks up the current translation of `va`.
    pub fn mapping_find(&self, va: VirtAddr) -> Option<Entry> {
        self.lock()
            .page_table
            .mapping_find(Page::containing_address(va))
    }

    /// The frame backing `va`, faulting it in first if needed.
    pub(crate) fn require_frame(&self, va: VirtAddr, access: AreaFlags) -> Option<Frame> {
        if let Some(entry) = self.mapping_find(va) {
            if !access.contains(AreaFlags::WRITE)
                || entry.flags().contains(EntryFlags::WRITE)
            {
                return entry.frame();
            }
        }
        if self.handle_fault(va, access) == PfResult::Fault {
            return None;
        }
        self.mapping_find(va).and_then(|entry| entry.frame())
    }

    pub fn asid(&self) -> Option<Asid> {
        self.lock().asid
    }

    pub fn area_count(&self) -> usize {
        self.lock().areas.len()
    }

    /// Total resident pages over all areas.
    pub fn resident_pages(&self) -> usize {
        self.lock()
            .areas
            .values()
            .map(|area| area.used.resident_pages())
            .sum()
    }

    /// Runs `f` over the area covering `va`.
    pub fn with_area<R>(&self, va: VirtAddr, f: impl FnOnce(&Area) -> R) -> Option<R> {
        let mut inner = self.lock();
        inner.area_covering(va).map(|area| f(&*area))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::backend::AreaBackend;
    use crate::memory::frame_allocator;
    use crate::memory::frame_bytes;
    use crate::memory::test_support::init_test_memory;
    use crate::utils::elf::{test_image, ElfImage};

    fn anon_rw() -> AreaFlags {
        AreaFlags::READ | AreaFlags::WRITE | AreaFlags::CACHEABLE
    }

    #[test]
    fn used_space_coalesces_and_splits() {
        let mut used = UsedSpace::new();
        assert!(used.insert(VirtAddr::from(0x1000)));
        assert!(used.insert(VirtAddr::from(0x3000)));
        assert!(used.insert(VirtAddr::from(0x2000)));
        assert!(!used.insert(VirtAddr::from(0x2000)));

        assert_eq!(used.resident_pages(), 3);
        assert_eq!(used.runs.len(), 1);

        assert!(used.remove(VirtAddr::from(0x2000)));
        assert_eq!(used.resident_pages(), 2);
        assert_eq!(used.runs.len(), 2);
        assert!(used.contains(VirtAddr::from(0x1000)));
        assert!(!used.contains(VirtAddr::from(0x2000)));
        assert!(used.contains(VirtAddr::from(0x3000)));

        assert!(!used.remove(VirtAddr::from(0x2000)));
    }

    #[test]
    fn areas_must_be_aligned_and_disjoint() {
        init_test_memory();
        let space = AddressSpace::new().unwrap();

        assert_eq!(
            space.area_create(
                anon_rw(),
                PAGE_SIZE,
                VirtAddr::from(0x4000_0800),
                AreaBackend::Anonymous
            ),
            Err(AreaError::BadAlignment)
        );
        assert_eq!(
            space.area_create(
                anon_rw(),
                PAGE_SIZE / 2,
                VirtAddr::from(0x4000_0000),
                AreaBackend::Anonymous
            ),
            Err(AreaError::BadAlignment)
        );

        space
            .area_create(
                anon_rw(),
                4 * PAGE_SIZE,
                VirtAddr::from(0x4000_0000),
                AreaBackend::Anonymous,
            )
            .unwrap();

        // overlapping from below, inside and above are all refused
        for base in [0x3FFF_F000usize, 0x4000_1000, 0x4000_3000] {
            assert_eq!(
                space.area_create(
                    anon_rw(),
                    2 * PAGE_SIZE,
                    VirtAddr::from(base),
                    AreaBackend::Anonymous
                ),
                Err(AreaError::Overlap)
            );
        }

        // touching is fine
        space
            .area_create(
                anon_rw(),
                PAGE_SIZE,
                VirtAddr::from(0x4000_4000),
                AreaBackend::Anonymous,
            )
            .unwrap();
        assert_eq!(space.area_count(), 2);
    }

    #[test]
    fn anonymous_fault_maps_one_zeroed_frame() {
        init_test_memory();
        let space = AddressSpace::new().unwrap();
        let base = VirtAddr::from(0x4100_0000);
        space
            .area_create(anon_rw(), 16 * PAGE_SIZE, base, AreaBackend::Anonymous)
            .unwrap();

        let fault_va = base + 8 * PAGE_SIZE + 0x123;
        assert_eq!(space.handle_fault(fault_va, AreaFlags::READ), PfResult::Ok);

        let entry = space.mapping_find(fault_va).unwrap();
        let frame = entry.frame().unwrap();
        let bytes = unsafe { frame_bytes(frame.start_address()) };
        assert!(bytes.iter().all(|&b| b == 0));

        assert_eq!(space.resident_pages(), 1);
        // a second fault on the same page is a no-op
        assert_eq!(space.handle_fault(fault_va, AreaFlags::READ), PfResult::Ok);
        assert_eq!(space.resident_pages(), 1);
    }

    #[test]
    fn faults_outside_areas_or_beyond_flags_fail() {
        init_test_memory();
        let space = AddressSpace::new().unwrap();
        let base = VirtAddr::from(0x4200_0000);
        space
            .area_create(
                AreaFlags::READ | AreaFlags::CACHEABLE,
                PAGE_SIZE,
                base,
                AreaBackend::Anonymous,
            )
            .unwrap();

        assert_eq!(
            space.handle_fault(VirtAddr::from(0x9999_0000), AreaFlags::READ),
            PfResult::Fault
        );
        assert_eq!(space.handle_fault(base, AreaFlags::WRITE), PfResult::Fault);
        assert_eq!(space.handle_fault(base, AreaFlags::READ), PfResult::Ok);
    }

    #[test]
    fn page_table_mirrors_used_space() {
        init_test_memory();
        let space = AddressSpace::new().unwrap();
        let base = VirtAddr::from(0x4300_0000);
        space
            .area_create(anon_rw(), 8 * PAGE_SIZE, base, AreaBackend::Anonymous)
            .unwrap();

        for i in [0usize, 3, 7] {
            space.handle_fault(base + i * PAGE_SIZE, AreaFlags::READ);
        }

        // every used page is mapped, every unused one is not
        for i in 0..8 {
            let va = base + i * PAGE_SIZE;
            let used = space
                .with_area(va, |area| area.resident_pages())
                .is_some();
            assert!(used);
            let mapped = space.mapping_find(va).is_some();
            assert_eq!(mapped, [0usize, 3, 7].contains(&i));
        }
    }

    #[test]
    fn create_then_destroy_restores_the_space() {
        init_test_memory();
        let space = AddressSpace::new().unwrap();
        let before_areas = space.area_count();

        let base = VirtAddr::from(0x4400_0000);
        space
            .area_create(anon_rw(), 4 * PAGE_SIZE, base, AreaBackend::Anonymous)
            .unwrap();
        for i in 0..4 {
            space.handle_fault(base + i * PAGE_SIZE, AreaFlags::WRITE);
        }
        assert_eq!(space.resident_pages(), 4);

        space.area_destroy(base).unwrap();
        assert_eq!(space.area_count(), before_areas);
        assert_eq!(space.resident_pages(), 0);
        assert!(space.mapping_find(base).is_none());
        assert_eq!(space.area_destroy(base), Err(AreaError::NoSuchArea));
    }

    #[test]
    fn shrinking_an_area_evicts_the_tail() {
        init_test_memory();
        let space = AddressSpace::new().unwrap();
        let base = VirtAddr::from(0x4500_0000);
        space
            .area_create(anon_rw(), 4 * PAGE_SIZE, base, AreaBackend::Anonymous)
            .unwrap();
        for i in 0..4 {
            space.handle_fault(base + i * PAGE_SIZE, AreaFlags::WRITE);
        }

        space.area_resize(base, 2 * PAGE_SIZE).unwrap();
        assert_eq!(space.resident_pages(), 2);
        assert!(space.mapping_find(base).is_some());
        assert!(space.mapping_find(base + 3 * PAGE_SIZE).is_none());

        // the freed range is open for a new neighbor now
        space
            .area_create(
                anon_rw(),
                PAGE_SIZE,
                base + 2 * PAGE_SIZE,
                AreaBackend::Anonymous,
            )
            .unwrap();
    }

    #[test]
    fn read_only_image_pages_are_shared() {
        init_test_memory();
        let image = ElfImage::load(&test_image::build()).unwrap();
        let text = image.segments()[0];
        let backend = AreaBackend::Image {
            image: image.clone(),
            segment: 0,
        };

        let space_a = AddressSpace::new().unwrap();
        let space_b = AddressSpace::new().unwrap();
        for space in [&space_a, &space_b] {
            space
                .area_create(text.flags, PAGE_SIZE, text.vaddr, backend.clone())
                .unwrap();
            assert_eq!(space.handle_fault(text.vaddr, AreaFlags::READ), PfResult::Ok);
        }

        // both spaces map the image's own frame: no new frame was taken
        // beyond the two page-table roots' walk tables
        let frame_a = space_a.mapping_find(text.vaddr).unwrap().frame().unwrap();
        let frame_b = space_b.mapping_find(text.vaddr).unwrap().frame().unwrap();
        assert_eq!(frame_a.start_address(), frame_b.start_address());
        assert_eq!(image.share_count(), 2);

        let bytes = unsafe { frame_bytes(frame_a.start_address()) };
        assert!(bytes.iter().all(|&b| b == 0xAA));

        space_a.area_destroy(text.vaddr).unwrap();
        assert_eq!(image.share_count(), 1);
        space_b.area_destroy(text.vaddr).unwrap();
        assert_eq!(image.share_count(), 0);
        // the image frame survives both unmaps for the next user
        assert_eq!(
            frame_allocator::FRAME_ALLOCATOR.lock().refcount(frame_a),
            1
        );
    }

    #[test]
    fn writable_image_pages_are_private_copies() {
        init_test_memory();
        let image = ElfImage::load(&test_image::build()).unwrap();
        let data = image.segments()[1];
        let backend = AreaBackend::Image {
            image: image.clone(),
            segment: 1,
        };

        let space = AddressSpace::new().unwrap();
        space
            .area_create(
                data.flags,
                crate::utils::align_up(data.mem_size, PAGE_SIZE),
                data.vaddr,
                backend,
            )
            .unwrap();

        // the straddling first page: file head, zero tail
        assert_eq!(space.handle_fault(data.vaddr, AreaFlags::WRITE), PfResult::Ok);
        let frame = space.mapping_find(data.vaddr).unwrap().frame().unwrap();
        let head = unsafe { frame_bytes(frame.start_address()) };
        assert!(head[..test_image::DATA_FILE_SIZE].iter().all(|&b| b == 0xBB));
        assert!(head[test_image::DATA_FILE_SIZE..].iter().all(|&b| b == 0));
        // a private copy, not the image frame
        assert_ne!(
            frame.start_address(),
            image.file_frame(data.offset, 0).start_address()
        );
        assert_eq!(image.share_count(), 0);

        // fully beyond file_size: zero fill
        let tail_va = data.vaddr + 2 * PAGE_SIZE;
        assert_eq!(space.handle_fault(tail_va, AreaFlags::WRITE), PfResult::Ok);
        let tail_frame = space.mapping_find(tail_va).unwrap().frame().unwrap();
        let tail = unsafe { frame_bytes(tail_frame.start_address()) };
        assert!(tail.iter().all(|&b| b == 0));
    }

    #[test]
    fn area_flags_translate_to_pte_flags() {
        let rwx = AreaFlags::READ | AreaFlags::WRITE | AreaFlags::EXEC | AreaFlags::CACHEABLE;
        let pte = rwx.pte_flags();
        assert!(pte.contains(EntryFlags::WRITE));
        assert!(pte.contains(EntryFlags::EXEC));
        assert!(pte.contains(EntryFlags::USER));
        assert!(!pte.contains(EntryFlags::NO_CACHE));

        let ro = AreaFlags::READ;
        let pte = ro.pte_flags();
        assert!(!pte.contains(EntryFlags::WRITE));
        assert!(pte.contains(EntryFlags::NO_CACHE));
    }

    #[test]
    fn asid_is_assigned_lazily_and_released() {
        init_test_memory();
        let space = AddressSpace::new().unwrap();
        assert_eq!(space.asid(), None);

        let base = VirtAddr::from(0x4600_0000);
        space
            .area_create(anon_rw(), PAGE_SIZE, base, AreaBackend::Anonymous)
            .unwrap();
        space.handle_fault(base, AreaFlags::READ);
        let asid = space.asid().unwrap();
        assert!(asid > 0);

        drop(space);
        // the id is free for reuse afterwards; allocating them all again
        // must not hit the capacity error
        let other = AddressSpace::new().unwrap();
        let other_base = VirtAddr::from(0x4700_0000);
        other
            .area_create(anon_rw(), PAGE_SIZE, other_base, AreaBackend::Anonymous)
            .unwrap();
        other.handle_fault(other_base, AreaFlags::READ);
        assert!(other.asid().is_some());
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();

        let bases: Vec<VirtAddr> = inner.areas.keys().copied().collect();
        for base in bases {
            inner.evict_area_pages(base, None);
            inner.areas.remove(&base);
        }
        inner.flush_pending();

        if let Some(asid) = inner.asid.take() {
            tlb::shootdown(TlbMessage::InvalidateAsid(asid));
            asid_release(asid);
        }
        debug!(AddressSpace, "address space destroyed");
    }
}

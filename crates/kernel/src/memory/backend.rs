//! Pager backends: who provides the frame when an area page faults.

use alloc::sync::Arc;

use crate::memory::address_space::{AreaFlags, PfResult};
use crate::memory::frame_allocator::{self, Frame, FrameFlags};
use crate::memory::paging::{Page, PageTableRoot, PAGE_SIZE};
use crate::memory::{frame_bytes, VirtAddr};
use crate::utils::elf::ElfImage;
use crate::utils::align_up;

/// An area's page provider. Cheap to clone; the image variant shares the
/// loaded executable.
#[derive(Debug, Clone)]
pub enum AreaBackend {
    /// Zero-filled memory, private to the address space.
    Anonymous,
    /// Backed by one LOAD segment of an in-memory executable image.
    Image {
        image: Arc<ElfImage>,
        segment: usize,
    },
}

impl AreaBackend {
    /// Services a fault on `page` of an area based at `area_base` with
    /// `flags`, installing the mapping on success.
    pub(crate) fn page_fault(
        &self,
        area_base: VirtAddr,
        flags: AreaFlags,
        page: Page,
        page_table: &mut PageTableRoot,
    ) -> PfResult {
        match self {
            AreaBackend::Anonymous => anon_page_fault(flags, page, page_table),
            AreaBackend::Image { image, segment } => {
                image_page_fault(image, *segment, area_base, flags, page, page_table)
            }
        }
    }

    /// Releases the frame that backed `page` when the area goes away.
    pub(crate) fn frame_free(
        &self,
        _area_base: VirtAddr,
        flags: AreaFlags,
        page: Page,
        frame: Frame,
    ) {
        match self {
            AreaBackend::Anonymous => frame_allocator::deallocate_frame(frame),
            AreaBackend::Image { image, segment } => {
                let seg = &image.segments()[*segment];
                if image_shares_page(seg.vaddr, seg.file_size, flags, page) {
                    image.drop_share();
                }
                // shared pages hold their own reference on the image frame,
                // private copies hold the only one
                frame_allocator::deallocate_frame(frame);
            }
        }
    }
}

fn anon_page_fault(flags: AreaFlags, page: Page, page_table: &mut PageTableRoot) -> PfResult {
    let Ok(frame) = frame_allocator::allocate_frame(FrameFlags::empty()) else {
        return PfResult::Fault;
    };
    unsafe { frame_bytes(frame.start_address()) }.fill(0);

    if page_table
        .mapping_insert(page, frame, flags.pte_flags())
        .is_err()
    {
        frame_allocator::deallocate_frame(frame);
        return PfResult::Fault;
    }
    PfResult::Ok
}

/// Whether `page` is served by mapping the image frame itself: fully
/// inside the initialized file window of a read-only segment.
fn image_shares_page(seg_vaddr: VirtAddr, file_size: usize, flags: AreaFlags, page: Page) -> bool {
    let file_end = seg_vaddr + file_size;
    page.virt_addr() + PAGE_SIZE <= file_end && !flags.contains(AreaFlags::WRITE)
}

fn image_page_fault(
    image: &Arc<ElfImage>,
    segment: usize,
    _area_base: VirtAddr,
    flags: AreaFlags,
    page: Page,
    page_table: &mut PageTableRoot,
) -> PfResult {
    let seg = &image.segments()[segment];
    let page_va = page.virt_addr();
    debug_assert!(page_va >= seg.vaddr && page_va < seg.vaddr + seg.mem_size);

    let file_end = seg.vaddr + seg.file_size;
    let page_index = (page_va - seg.vaddr) / PAGE_SIZE;

    let frame = if page_va + PAGE_SIZE <= file_end {
        // initialized portion of the segment
        if flags.contains(AreaFlags::WRITE) {
            // writable: give the task a private copy of the file page
            let Ok(frame) = frame_allocator::allocate_frame(FrameFlags::empty()) else {
                return PfResult::Fault;
            };
            let dst = unsafe { frame_bytes(frame.start_address()) };
            image.copy_file_page(seg.offset, page_index, dst, PAGE_SIZE);
            frame
        } else {
            // read-only: map the image frame itself, shared by every
            // address space using this image
            let frame = image.file_frame(seg.offset, page_index);
            frame_allocator::frame_ref(frame);
            image.add_share();
            frame
        }
    } else if page_va >= VirtAddr::from(align_up(file_end.into_raw(), PAGE_SIZE)) {
        // entirely beyond file_size: zero-filled anonymous memory
        let Ok(frame) = frame_allocator::allocate_frame(FrameFlags::empty()) else {
            return PfResult::Fault;
        };
        unsafe { frame_bytes(frame.start_address()) }.fill(0);
        frame
    } else {
        // the page straddles file_size: copy the head, zero the tail
        let initialized = file_end - page_va;
        let Ok(frame) = frame_allocator::allocate_frame(FrameFlags::empty()) else {
            return PfResult::Fault;
        };
        let dst = unsafe { frame_bytes(frame.start_address()) };
        image.copy_file_page(seg.offset, page_index, dst, initialized);
        dst[initialized..].fill(0);
        frame
    };

    if page_table
        .mapping_insert(page, frame, flags.pte_flags())
        .is_err()
    {
        frame_allocator::deallocate_frame(frame);
        return PfResult::Fault;
    }
    PfResult::Ok
}

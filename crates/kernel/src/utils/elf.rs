//! The executable image loader.
//!
//! Only the subset the kernel itself consumes: identification, a
//! compatibility check against the build, and the LOAD program headers.
//! Interpreter, dynamic and symbol information is userspace's problem.
//! The file bytes are copied into page frames once; read-only segment
//! pages are then shared by every address space mapping the image.

use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::sync::Arc;
use alloc::vec::Vec;
use thiserror::Error;

use crate::memory::address_space::AreaFlags;
use crate::memory::frame_allocator::{self, Frame, FrameFlags};
use crate::memory::paging::PAGE_SIZE;
use crate::memory::{frame_bytes, VirtAddr};

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const CLASS_64: u8 = 2;
const DATA_LSB: u8 = 1;
const VERSION_CURRENT: u8 = 1;
const TYPE_EXEC: u16 = 2;
const PT_LOAD: u32 = 1;

const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

/// Machine id this build accepts.
pub const ELF_MACHINE: u16 = if cfg!(target_arch = "aarch64") {
    183
} else {
    62
};

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ElfError {
    #[error("not an executable image")]
    Invalid,
    #[error("image built for another machine or class")]
    Incompatible,
    #[error("image type not loadable")]
    Unsupported,
    #[error("segment not page aligned")]
    BadAlignment,
    #[error("out of memory while loading image")]
    NoMemory,
}

/// One LOAD program header.
#[derive(Debug, Clone, Copy)]
pub struct ElfSegment {
    pub vaddr: VirtAddr,
    pub mem_size: usize,
    pub file_size: usize,
    /// byte offset of the segment inside the file
    pub offset: usize,
    pub flags: AreaFlags,
}

/// An executable held in page frames, shared between every task running
/// it.
#[derive(Debug)]
pub struct ElfImage {
    frames: Vec<Frame>,
    entry: VirtAddr,
    segments: Vec<ElfSegment>,
    /// read-only pages of this image currently mapped somewhere
    share_count: AtomicUsize,
}

fn read_u16(bytes: &[u8], offset: usize) -> Result<u16, ElfError> {
    let raw = bytes
        .get(offset..offset + 2)
        .ok_or(ElfError::Invalid)?;
    Ok(u16::from_le_bytes([raw[0], raw[1]]))
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32, ElfError> {
    let raw = bytes
        .get(offset..offset + 4)
        .ok_or(ElfError::Invalid)?;
    Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

fn read_u64(bytes: &[u8], offset: usize) -> Result<u64, ElfError> {
    let raw = bytes
        .get(offset..offset + 8)
        .ok_or(ElfError::Invalid)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(raw);
    Ok(u64::from_le_bytes(buf))
}

impl ElfImage {
    /// Parses and loads `bytes`, copying the file into freshly allocated
    /// frames.
    pub fn load(bytes: &[u8]) -> Result<Arc<Self>, ElfError> {
        if bytes.len() < 64 || bytes[0..4] != ELF_MAGIC {
            return Err(ElfError::Invalid);
        }
        if bytes[4] != CLASS_64 || bytes[5] != DATA_LSB || bytes[6] != VERSION_CURRENT {
            return Err(ElfError::Incompatible);
        }
        if read_u16(bytes, 18)? != ELF_MACHINE || read_u32(bytes, 20)? != 1 {
            return Err(ElfError::Incompatible);
        }
        if read_u16(bytes, 16)? != TYPE_EXEC {
            return Err(ElfError::Unsupported);
        }

        let entry = VirtAddr::from(read_u64(bytes, 24)? as usize);
        let phoff = read_u64(bytes, 32)? as usize;
        let phentsize = read_u16(bytes, 54)? as usize;
        let phnum = read_u16(bytes, 56)? as usize;
        if phentsize < 56 {
            return Err(ElfError::Incompatible);
        }

        let mut segments = Vec::new();
        for i in 0..phnum {
            let ph = phoff + i * phentsize;
            let p_type = read_u32(bytes, ph)?;
            if p_type != PT_LOAD {
                // everything else is handled (or ignored) in userspace
                continue;
            }

            let p_flags = read_u32(bytes, ph + 4)?;
            let offset = read_u64(bytes, ph + 8)? as usize;
            let vaddr = VirtAddr::from(read_u64(bytes, ph + 16)? as usize);
            let file_size = read_u64(bytes, ph + 32)? as usize;
            let mem_size = read_u64(bytes, ph + 40)? as usize;

            // sharing file pages requires both ends page aligned
            if !vaddr.is_aligned_to(PAGE_SIZE) || offset % PAGE_SIZE != 0 {
                return Err(ElfError::BadAlignment);
            }
            if offset + file_size > bytes.len() || file_size > mem_size {
                return Err(ElfError::Invalid);
            }

            let mut flags = AreaFlags::CACHEABLE;
            if p_flags & PF_R != 0 {
                flags |= AreaFlags::READ;
            }
            if p_flags & PF_W != 0 {
                flags |= AreaFlags::WRITE;
            }
            if p_flags & PF_X != 0 {
                flags |= AreaFlags::EXEC;
            }

            segments.push(ElfSegment {
                vaddr,
                mem_size,
                file_size,
                offset,
                flags,
            });
        }

        if segments.is_empty() {
            return Err(ElfError::Unsupported);
        }

        // copy the file into frames, page by page
        let page_count = bytes.len().div_ceil(PAGE_SIZE);
        let mut frames = Vec::with_capacity(page_count);
        for page in 0..page_count {
            let frame = match frame_allocator::allocate_frame(FrameFlags::empty()) {
                Ok(frame) => frame,
                Err(_) => {
                    for frame in frames {
                        frame_allocator::deallocate_frame(frame);
                    }
                    return Err(ElfError::NoMemory);
                }
            };
            let dst = unsafe { frame_bytes(frame.start_address()) };
            let start = page * PAGE_SIZE;
            let end = bytes.len().min(start + PAGE_SIZE);
            dst[..end - start].copy_from_slice(&bytes[start..end]);
            dst[end - start..].fill(0);
            frames.push(frame);
        }

        Ok(Arc::new(Self {
            frames,
            entry,
            segments,
            share_count: AtomicUsize::new(0),
        }))
    }

    pub const fn entry_point(&self) -> VirtAddr {
        self.entry
    }

    pub fn segments(&self) -> &[ElfSegment] {
        &self.segments
    }

    /// The frame holding file page `page_index` of the segment starting
    /// at file offset `seg_offset`.
    pub(crate) fn file_frame(&self, seg_offset: usize, page_index: usize) -> Frame {
        self.frames[seg_offset / PAGE_SIZE + page_index]
    }

    /// Copies `len` bytes of file page `page_index` into `dst`.
    pub(crate) fn copy_file_page(
        &self,
        seg_offset: usize,
        page_index: usize,
        dst: &mut [u8],
        len: usize,
    ) {
        let frame = self.file_frame(seg_offset, page_index);
        let src = unsafe { frame_bytes(frame.start_address()) };
        dst[..len].copy_from_slice(&src[..len]);
    }

    pub(crate) fn add_share(&self) {
        self.share_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn drop_share(&self) {
        self.share_count.fetch_sub(1, Ordering::Relaxed);
    }

    /// Read-only image pages currently mapped in some address space.
    pub fn share_count(&self) -> usize {
        self.share_count.load(Ordering::Relaxed)
    }
}

impl Drop for ElfImage {
    fn drop(&mut self) {
        for frame in self.frames.drain(..) {
            frame_allocator::deallocate_frame(frame);
        }
    }
}

#[cfg(test)]
pub(crate) mod test_image {
    //! A tiny hand-assembled executable for the loader and pager tests.

    use super::*;
    use alloc::vec;

    pub const TEXT_VADDR: usize = 0x40_0000;
    pub const DATA_VADDR: usize = 0x50_0000;
    pub const ENTRY: usize = TEXT_VADDR + 0x40;
    /// data bytes present in the file
    pub const DATA_FILE_SIZE: usize = 0x800;
    /// data segment total size (the rest is zero-fill)
    pub const DATA_MEM_SIZE: usize = 2 * PAGE_SIZE + 0x800;

    fn push_program_header(
        out: &mut Vec<u8>,
        flags: u32,
        offset: usize,
        vaddr: usize,
        file_size: usize,
        mem_size: usize,
    ) {
        out.extend_from_slice(&PT_LOAD.to_le_bytes());
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(&(offset as u64).to_le_bytes());
        out.extend_from_slice(&(vaddr as u64).to_le_bytes()); // p_vaddr
        out.extend_from_slice(&(vaddr as u64).to_le_bytes()); // p_paddr
        out.extend_from_slice(&(file_size as u64).to_le_bytes());
        out.extend_from_slice(&(mem_size as u64).to_le_bytes());
        out.extend_from_slice(&(PAGE_SIZE as u64).to_le_bytes()); // p_align
    }

    /// Builds an image with a read-only executable text segment (one
    /// page, at file offset 0x1000) and a writable data segment whose
    /// memory size exceeds its file size.
    pub fn build() -> Vec<u8> {
        let mut out = vec![0u8; 0];
        out.extend_from_slice(&ELF_MAGIC);
        out.push(CLASS_64);
        out.push(DATA_LSB);
        out.push(VERSION_CURRENT);
        out.extend_from_slice(&[0; 9]); // abi + padding
        out.extend_from_slice(&TYPE_EXEC.to_le_bytes());
        out.extend_from_slice(&ELF_MACHINE.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes()); // e_version
        out.extend_from_slice(&(ENTRY as u64).to_le_bytes());
        out.extend_from_slice(&64u64.to_le_bytes()); // e_phoff
        out.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
        out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        out.extend_from_slice(&64u16.to_le_bytes()); // e_ehsize
        out.extend_from_slice(&56u16.to_le_bytes()); // e_phentsize
        out.extend_from_slice(&2u16.to_le_bytes()); // e_phnum
        out.extend_from_slice(&[0u8; 6]); // section header info

        push_program_header(&mut out, PF_R | PF_X, 0x1000, TEXT_VADDR, PAGE_SIZE, PAGE_SIZE);
        push_program_header(
            &mut out,
            PF_R | PF_W,
            0x2000,
            DATA_VADDR,
            DATA_FILE_SIZE,
            DATA_MEM_SIZE,
        );

        // file body: text page then data page
        out.resize(0x1000, 0);
        out.extend_from_slice(&[0xAA; PAGE_SIZE]); // text bytes
        let mut data = vec![0u8; 0x1000];
        data[..DATA_FILE_SIZE].fill(0xBB);
        out.extend_from_slice(&data);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support::init_test_memory;

    #[test]
    fn loads_segments_and_entry() {
        init_test_memory();
        let image = ElfImage::load(&test_image::build()).unwrap();

        assert_eq!(image.entry_point(), VirtAddr::from(test_image::ENTRY));
        assert_eq!(image.segments().len(), 2);

        let text = &image.segments()[0];
        assert_eq!(text.vaddr, VirtAddr::from(test_image::TEXT_VADDR));
        assert_eq!(text.flags, AreaFlags::READ | AreaFlags::EXEC | AreaFlags::CACHEABLE);

        let data = &image.segments()[1];
        assert_eq!(data.file_size, test_image::DATA_FILE_SIZE);
        assert_eq!(data.mem_size, test_image::DATA_MEM_SIZE);
        assert!(data.flags.contains(AreaFlags::WRITE));
    }

    #[test]
    fn rejects_bad_magic() {
        init_test_memory();
        let mut bytes = test_image::build();
        bytes[0] = 0;
        assert_eq!(ElfImage::load(&bytes).unwrap_err(), ElfError::Invalid);
    }

    #[test]
    fn rejects_foreign_machine() {
        init_test_memory();
        let mut bytes = test_image::build();
        bytes[18] = 0xFE;
        bytes[19] = 0xFE;
        assert_eq!(ElfImage::load(&bytes).unwrap_err(), ElfError::Incompatible);
    }

    #[test]
    fn rejects_unaligned_load_segment() {
        init_test_memory();
        let mut bytes = test_image::build();
        // nudge the text segment's p_vaddr off the page boundary
        let p_vaddr = 64 + 16;
        bytes[p_vaddr] = 0x10;
        assert_eq!(ElfImage::load(&bytes).unwrap_err(), ElfError::BadAlignment);
    }

    #[test]
    fn rejects_relocatable_objects() {
        init_test_memory();
        let mut bytes = test_image::build();
        bytes[16] = 1; // ET_REL
        assert_eq!(ElfImage::load(&bytes).unwrap_err(), ElfError::Unsupported);
    }

    #[test]
    fn file_pages_land_in_frames() {
        init_test_memory();
        let image = ElfImage::load(&test_image::build()).unwrap();
        let text = &image.segments()[0];

        let frame = image.file_frame(text.offset, 0);
        let bytes = unsafe { crate::memory::frame_bytes(frame.start_address()) };
        assert!(bytes.iter().all(|&b| b == 0xAA));
    }
}

//! Physical frame management.
//!
//! Physical memory is registered as zones at boot; each zone runs a buddy
//! system over its frame span plus a per-frame reference count table.
//! Single-frame requests are O(log order) inside a zone, contiguous
//! multi-frame requests are best effort.

use core::fmt::Debug;

use alloc::vec;
use alloc::vec::Vec;
use bitflags::bitflags;
use lazy_static::lazy_static;
use thiserror::Error;

use crate::sync::waitq::WaitQueue;
use crate::utils::locks::SpinLock;

use super::paging::PAGE_SIZE;
use super::{PhysAddr, VirtAddr};

/// Maximum number of memory zones the allocator accepts.
pub const MAX_ZONES: usize = 32;
/// Largest block is `2^MAX_ORDER` frames (4 MiB with 4 KiB pages).
pub const MAX_ORDER: usize = 10;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("out of physical frames")]
    NoMemory,
    #[error("zone capacity exceeded")]
    TooManyZones,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        /// The request may not block waiting for reclaim.
        const ATOMIC = 1 << 0;
    }
}

/// A physical page frame.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Frame(PhysAddr);

impl Frame {
    #[inline(always)]
    // returns the frame that contains an address
    pub fn containing_address(address: PhysAddr) -> Self {
        Self(address.align_down(PAGE_SIZE))
    }

    #[inline]
    pub fn start_address(&self) -> PhysAddr {
        self.0
    }

    #[inline(always)]
    pub fn virt_addr(&self) -> VirtAddr {
        self.0.into_virt()
    }

    pub fn iter_frames(start: Frame, end: Frame) -> FrameIter {
        debug_assert!(start.start_address() <= end.start_address());
        FrameIter { start, end }
    }
}

impl Debug for Frame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("Frame")
            .field(&format_args!("{:#x}", self.start_address()))
            .finish()
    }
}

pub struct FrameIter {
    start: Frame,
    end: Frame,
}

impl Iterator for FrameIter {
    type Item = Frame;
    fn next(&mut self) -> Option<Self::Item> {
        if self.start.start_address() < self.end.start_address() {
            let frame = self.start;
            self.start.0 += PAGE_SIZE;
            Some(frame)
        } else {
            None
        }
    }
}

const STATE_TAIL: u8 = 0xFF;

#[derive(Clone, Copy, PartialEq, Eq)]
struct BlockState {
    /// order of the block this frame heads, or `STATE_TAIL` for non-heads
    order: u8,
    free: bool,
}

struct Zone {
    base: PhysAddr,
    frame_count: usize,
    free_lists: [Vec<u32>; MAX_ORDER + 1],
    states: Vec<BlockState>,
    refcounts: Vec<u16>,
    busy_frames: usize,
}

impl Zone {
    fn new(base: PhysAddr, frame_count: usize) -> Self {
        let mut zone = Self {
            base,
            frame_count,
            free_lists: core::array::from_fn(|_| Vec::new()),
            states: vec![
                BlockState {
                    order: STATE_TAIL,
                    free: false
                };
                frame_count
            ],
            refcounts: vec![0; frame_count],
            busy_frames: 0,
        };

        // carve the span into maximal naturally aligned blocks
        let mut idx = 0usize;
        while idx < frame_count {
            let mut order = MAX_ORDER.min((frame_count - idx).ilog2() as usize);
            while order > 0 && idx % (1 << order) != 0 {
                order -= 1;
            }
            zone.states[idx] = BlockState {
                order: order as u8,
                free: true,
            };
            zone.free_lists[order].push(idx as u32);
            idx += 1 << order;
        }

        zone
    }

    #[inline]
    fn contains(&self, addr: PhysAddr) -> bool {
        addr >= self.base && addr < self.base + self.frame_count * PAGE_SIZE
    }

    #[inline]
    fn index_of(&self, addr: PhysAddr) -> usize {
        (addr - self.base) / PAGE_SIZE
    }

    fn pop_free(&mut self, order: usize) -> Option<usize> {
        self.free_lists[order].pop().map(|idx| idx as usize)
    }

    fn unlink_free(&mut self, idx: usize, order: usize) {
        let pos = self.free_lists[order]
            .iter()
            .position(|&i| i as usize == idx)
            .expect("buddy free list out of sync with block states");
        self.free_lists[order].swap_remove(pos);
    }

    fn alloc(&mut self, order: usize) -> Option<usize> {
        let mut found_order = (order..=MAX_ORDER).find(|&o| !self.free_lists[o].is_empty())?;
        let idx = self.pop_free(found_order).unwrap();

        // split down to the requested order, freeing the upper halves
        while found_order > order {
            found_order -= 1;
            let buddy = idx + (1 << found_order);
            self.states[buddy] = BlockState {
                order: found_order as u8,
                free: true,
            };
            self.free_lists[found_order].push(buddy as u32);
        }

        self.states[idx] = BlockState {
            order: order as u8,
            free: false,
        };
        for tail in idx + 1..idx + (1 << order) {
            self.states[tail].order = STATE_TAIL;
        }
        self.refcounts[idx] = 1;
        self.busy_frames += 1 << order;
        Some(idx)
    }

    /// Finds the head index of the block containing `idx`.
    fn head_of(&self, mut idx: usize) -> usize {
        while self.states[idx].order == STATE_TAIL {
            idx -= 1;
        }
        idx
    }

    fn release(&mut self, mut idx: usize) {
        debug_assert!(!self.states[idx].free);
        let mut order = self.states[idx].order as usize;
        self.busy_frames -= 1 << order;

        while order < MAX_ORDER {
            let buddy = idx ^ (1 << order);
            if buddy + (1 << order) > self.frame_count {
                break;
            }
            let buddy_state = self.states[buddy];
            if !buddy_state.free || buddy_state.order as usize != order {
                break;
            }
            self.unlink_free(buddy, order);
            self.states[buddy.max(idx)].order = STATE_TAIL;
            idx = buddy.min(idx);
            order += 1;
        }

        self.states[idx] = BlockState {
            order: order as u8,
            free: true,
        };
        self.free_lists[order].push(idx as u32);
    }
}

/// The zone set. One global instance lives behind [`FRAME_ALLOCATOR`];
/// tests build private instances over their own buffers.
pub struct FrameZones {
    zones: heapless::Vec<Zone, MAX_ZONES>,
}

impl FrameZones {
    pub const fn new() -> Self {
        Self {
            zones: heapless::Vec::new(),
        }
    }

    /// Registers `[base, base + size)` as allocatable. Both ends are
    /// trimmed to page boundaries.
    pub fn register_zone(&mut self, base: PhysAddr, size: usize) -> Result<(), FrameError> {
        let start = base.align_up(PAGE_SIZE);
        let end = (base + size).align_down(PAGE_SIZE);
        if end <= start {
            return Ok(());
        }
        let frame_count = (end - start) / PAGE_SIZE;
        self.zones
            .push(Zone::new(start, frame_count))
            .map_err(|_| FrameError::TooManyZones)?;
        Ok(())
    }

    pub fn alloc(&mut self, order: usize) -> Result<Frame, FrameError> {
        for zone in self.zones.iter_mut() {
            if let Some(idx) = zone.alloc(order) {
                return Ok(Frame(zone.base + idx * PAGE_SIZE));
            }
        }
        Err(FrameError::NoMemory)
    }

    fn zone_of(&mut self, addr: PhysAddr) -> &mut Zone {
        self.zones
            .iter_mut()
            .find(|z| z.contains(addr))
            .expect("frame outside every registered zone")
    }

    /// Bumps the reference count of the block containing `frame`.
    pub fn ref_inc(&mut self, frame: Frame) {
        let zone = self.zone_of(frame.start_address());
        let head = zone.head_of(zone.index_of(frame.start_address()));
        zone.refcounts[head] += 1;
    }

    pub fn refcount(&mut self, frame: Frame) -> u16 {
        let zone = self.zone_of(frame.start_address());
        let head = zone.head_of(zone.index_of(frame.start_address()));
        zone.refcounts[head]
    }

    /// Drops one reference; the block returns to its buddy system when the
    /// count reaches zero.
    pub fn free(&mut self, frame: Frame) {
        let zone = self.zone_of(frame.start_address());
        let head = zone.head_of(zone.index_of(frame.start_address()));
        debug_assert!(zone.refcounts[head] > 0, "double frame free");
        zone.refcounts[head] -= 1;
        if zone.refcounts[head] == 0 {
            zone.release(head);
        }
    }

    pub fn busy_frames(&self) -> usize {
        self.zones.iter().map(|z| z.busy_frames).sum()
    }

    pub fn free_frames(&self) -> usize {
        self.zones
            .iter()
            .map(|z| z.frame_count - z.busy_frames)
            .sum()
    }
}

lazy_static! {
    pub static ref FRAME_ALLOCATOR: SpinLock<FrameZones> = SpinLock::new(FrameZones::new());
}

/// Threads starved of frames sleep here; every release wakes them to
/// retry.
static RECLAIM_WQ: WaitQueue = WaitQueue::new();

/// Registers an allocatable physical region, normally from boot-loader
/// memory map entries.
pub fn register_zone(base: PhysAddr, size: usize) -> Result<(), FrameError> {
    FRAME_ALLOCATOR.lock().register_zone(base, size)
}

/// Allocates a block of `2^order` contiguous frames.
///
/// Without [`FrameFlags::ATOMIC`] the caller is willing to sleep until
/// reclaim frees memory; atomic requests fail with `NoMemory` instead.
pub fn allocate_frames(order: usize, flags: FrameFlags) -> Result<Frame, FrameError> {
    loop {
        match FRAME_ALLOCATOR.lock().alloc(order) {
            Ok(frame) => return Ok(frame),
            Err(FrameError::NoMemory) => {
                if flags.contains(FrameFlags::ATOMIC) || !crate::scheduler::can_block() {
                    return Err(FrameError::NoMemory);
                }
                // bounded sleep: a release between the failed attempt and
                // the enqueue must not strand us forever
                let _ = RECLAIM_WQ.sleep_timeout(10_000);
            }
            Err(e) => return Err(e),
        }
    }
}

#[inline(always)]
pub fn allocate_frame(flags: FrameFlags) -> Result<Frame, FrameError> {
    allocate_frames(0, flags)
}

#[inline(always)]
pub fn deallocate_frame(frame: Frame) {
    FRAME_ALLOCATOR.lock().free(frame);
    RECLAIM_WQ.wake_all();
}

/// Adds a sharer to the frame's block.
#[inline(always)]
pub fn frame_ref(frame: Frame) {
    FRAME_ALLOCATOR.lock().ref_inc(frame);
}

#[inline(always)]
pub fn busy_frames() -> usize {
    FRAME_ALLOCATOR.lock().busy_frames()
}

#[inline(always)]
pub fn free_frames() -> usize {
    FRAME_ALLOCATOR.lock().free_frames()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zones_with(frames: usize) -> FrameZones {
        let mut zones = FrameZones::new();
        zones
            .register_zone(PhysAddr::from(0x10_0000), frames * PAGE_SIZE)
            .unwrap();
        zones
    }

    #[test]
    fn alloc_free_restores_free_count() {
        let mut zones = zones_with(64);
        let before = zones.free_frames();

        let frame = zones.alloc(0).unwrap();
        assert_eq!(zones.free_frames(), before - 1);

        zones.free(frame);
        assert_eq!(zones.free_frames(), before);
    }

    #[test]
    fn allocations_are_distinct_until_freed() {
        let mut zones = zones_with(16);
        let mut frames = heapless::Vec::<_, 16>::new();
        for _ in 0..16 {
            frames.push(zones.alloc(0).unwrap()).unwrap();
        }

        for i in 1..frames.len() {
            assert_ne!(frames[i - 1].start_address(), frames[i].start_address());
        }
        assert_eq!(zones.alloc(0), Err(FrameError::NoMemory));

        for frame in frames {
            zones.free(frame);
        }
        assert_eq!(zones.free_frames(), 16);
    }

    #[test]
    fn contiguous_blocks_are_aligned_and_merged_back() {
        let mut zones = zones_with(64);

        let block = zones.alloc(3).unwrap();
        assert!(block.start_address().is_aligned_to(8 * PAGE_SIZE));
        assert_eq!(zones.busy_frames(), 8);

        zones.free(block);
        assert_eq!(zones.busy_frames(), 0);
        // the span must merge back far enough to satisfy a max-width request
        let wide = zones.alloc(5).unwrap();
        zones.free(wide);
    }

    #[test]
    fn refcounted_frame_survives_one_free() {
        let mut zones = zones_with(8);
        let frame = zones.alloc(0).unwrap();
        zones.ref_inc(frame);
        assert_eq!(zones.refcount(frame), 2);

        zones.free(frame);
        assert_eq!(zones.refcount(frame), 1);
        assert_eq!(zones.busy_frames(), 1);

        zones.free(frame);
        assert_eq!(zones.busy_frames(), 0);
    }

    #[test]
    fn zone_capacity_is_limited() {
        let mut zones = FrameZones::new();
        for i in 0..MAX_ZONES {
            zones
                .register_zone(PhysAddr::from(i * 0x100_0000), PAGE_SIZE)
                .unwrap();
        }
        assert_eq!(
            zones.register_zone(PhysAddr::from(0xFFFF_0000), PAGE_SIZE),
            Err(FrameError::TooManyZones)
        );
    }
}

pub mod address_space;
pub mod backend;
pub mod frame_allocator;
pub mod paging;
pub mod tlb;

use core::{
    fmt::{Debug, LowerHex},
    ops::{Add, AddAssign, Sub, SubAssign},
};

use spin::Once;

/// A virtual memory address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(usize);

/// A physical memory address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(usize);

impl Debug for VirtAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "VirtAddr({self:#x})")
    }
}

impl Debug for PhysAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PhysAddr({self:#x})")
    }
}

macro_rules! impl_addr_ty {
    ($ty: ty) => {
        impl $ty {
            #[inline(always)]
            pub const fn null() -> Self {
                Self(0)
            }

            #[inline(always)]
            pub const fn from(value: usize) -> Self {
                Self(value)
            }

            #[inline(always)]
            pub const fn into_raw(self) -> usize {
                self.0
            }

            #[inline(always)]
            pub const fn is_null(self) -> bool {
                self.0 == 0
            }

            #[inline(always)]
            pub const fn is_aligned_to(self, alignment: usize) -> bool {
                self.0 % alignment == 0
            }

            /// Aligns up to the next multiple of `alignment` (a power of two).
            #[inline(always)]
            pub const fn align_up(self, alignment: usize) -> Self {
                Self(crate::utils::align_up(self.0, alignment))
            }

            /// Aligns down to the previous multiple of `alignment` (a power of two).
            #[inline(always)]
            pub const fn align_down(self, alignment: usize) -> Self {
                Self(crate::utils::align_down(self.0, alignment))
            }
        }

        impl LowerHex for $ty {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                LowerHex::fmt(&self.0, f)
            }
        }

        impl From<usize> for $ty {
            #[inline(always)]
            fn from(value: usize) -> Self {
                Self(value)
            }
        }

        impl Add<usize> for $ty {
            type Output = $ty;
            #[inline(always)]
            fn add(self, rhs: usize) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl AddAssign<usize> for $ty {
            #[inline(always)]
            fn add_assign(&mut self, rhs: usize) {
                *self = *self + rhs
            }
        }

        impl Sub<$ty> for $ty {
            type Output = usize;
            #[inline(always)]
            fn sub(self, rhs: $ty) -> Self::Output {
                self.0 - rhs.0
            }
        }

        impl Sub<usize> for $ty {
            type Output = Self;
            #[inline(always)]
            fn sub(self, rhs: usize) -> Self::Output {
                Self(self.0 - rhs)
            }
        }

        impl SubAssign<usize> for $ty {
            #[inline(always)]
            fn sub_assign(&mut self, rhs: usize) {
                *self = *self - rhs
            }
        }
    };
}

impl_addr_ty!(VirtAddr);
impl_addr_ty!(PhysAddr);

impl VirtAddr {
    #[inline(always)]
    pub fn from_ptr<T: ?Sized>(value: *const T) -> Self {
        Self(value as *const u8 as usize)
    }

    #[inline(always)]
    pub const fn into_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}

impl PhysAddr {
    /// Translates through the direct-map window the boot collaborator
    /// registered with [`init_direct_map`].
    #[inline(always)]
    pub fn into_virt(self) -> VirtAddr {
        VirtAddr(self.0 + direct_map_offset())
    }
}

impl<T> From<*const T> for VirtAddr {
    #[inline(always)]
    fn from(value: *const T) -> Self {
        Self::from_ptr(value)
    }
}

impl<T> From<*mut T> for VirtAddr {
    #[inline(always)]
    fn from(value: *mut T) -> Self {
        Self::from_ptr(value)
    }
}

static DIRECT_MAP_OFFSET: Once<usize> = Once::new();

/// Registers the offset of the window through which all physical memory is
/// reachable. Must happen before the first frame is touched.
pub fn init_direct_map(offset: usize) {
    DIRECT_MAP_OFFSET.call_once(|| offset);
}

#[inline(always)]
fn direct_map_offset() -> usize {
    *DIRECT_MAP_OFFSET
        .get()
        .expect("physical memory touched before init_direct_map()")
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use spin::Once;

    static TEST_MEMORY: Once<()> = Once::new();

    /// Gives the whole crate a synthetic physical window for unit tests:
    /// a leaked, page-aligned buffer registered as one zone, reached
    /// through a zero direct-map offset (physical == host virtual).
    pub fn init_test_memory() {
        TEST_MEMORY.call_once(|| {
            const TEST_MEMORY_BYTES: usize = 32 * 1024 * 1024;
            let buf = alloc::vec![0u8; TEST_MEMORY_BYTES + paging::PAGE_SIZE];
            let base = VirtAddr::from_ptr(buf.as_ptr())
                .align_up(paging::PAGE_SIZE)
                .into_raw();
            core::mem::forget(buf);

            init_direct_map(0);
            frame_allocator::register_zone(PhysAddr::from(base), TEST_MEMORY_BYTES)
                .expect("failed to register the test zone");
            crate::cpu::init(2);
        });
    }
}

/// Borrows the page-sized byte slice a frame maps to in the direct-map
/// window.
///
/// # Safety
/// The frame must be owned by the caller (allocated and not concurrently
/// reused for something with a conflicting layout).
#[inline]
pub unsafe fn frame_bytes<'a>(frame: PhysAddr) -> &'a mut [u8] {
    unsafe {
        core::slice::from_raw_parts_mut(frame.into_virt().into_ptr::<u8>(), paging::PAGE_SIZE)
    }
}
